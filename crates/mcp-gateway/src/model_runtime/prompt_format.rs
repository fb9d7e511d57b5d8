//! Chat templates for raw-prompt completion engines.
//!
//! Each backend family expects the transcript flattened into its own markup,
//! always ending with an open assistant slot for the engine to fill.

use crate::memory::{Message, Role};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromptTemplate {
    /// `<|role|>` headers.
    DeepSeek,
    /// Llama-2 chat `[INST]` / `<<SYS>>` markup.
    Llama2,
}

impl PromptTemplate {
    pub fn render(&self, transcript: &[Message]) -> String {
        match self {
            PromptTemplate::DeepSeek => render_deepseek(transcript),
            PromptTemplate::Llama2 => render_llama2(transcript),
        }
    }

    /// Strings the engine should stop at so it does not invent the next turn.
    pub fn stop_sequences(&self) -> &'static [&'static str] {
        match self {
            PromptTemplate::DeepSeek => &["<|user|>", "<|system|>"],
            PromptTemplate::Llama2 => &["</s>", "[INST]"],
        }
    }
}

fn render_deepseek(transcript: &[Message]) -> String {
    let mut out = String::new();
    for message in transcript {
        out.push_str(&format!("<|{}|>\n{}\n", message.role, message.content));
    }
    if !out.ends_with("<|assistant|>\n") {
        out.push_str("<|assistant|>\n");
    }
    out
}

fn render_llama2(transcript: &[Message]) -> String {
    let mut out = String::new();
    // true while an `[INST]` block has been opened but not yet closed
    let mut inst_open = false;

    for message in transcript {
        match message.role {
            Role::System => {
                out.push_str(&format!("<s>[INST] <<SYS>>\n{}\n<</SYS>>\n\n", message.content));
                inst_open = true;
            }
            Role::User => {
                if !inst_open {
                    out.push_str("<s>[INST] ");
                }
                out.push_str(&format!("{} [/INST]\n\n", message.content));
                inst_open = false;
            }
            Role::Assistant => {
                out.push_str(&format!("{}</s>\n\n", message.content));
                inst_open = false;
            }
        }
    }

    if !out.ends_with("[/INST]\n\n") {
        out.push_str("[/INST]\n\n");
    }
    out
}
