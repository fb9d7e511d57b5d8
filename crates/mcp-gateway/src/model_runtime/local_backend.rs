//! Local model backends
//!
//! Each backend family talks to a llama.cpp-compatible inference server over
//! HTTP (`/health`, `/completion`). When a runtime binary is configured the
//! backend spawns that server on `load` and kills it on `unload`; otherwise it
//! expects the server to be managed externally and only waits for it to answer.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use super::prompt_format::PromptTemplate;
use super::runtime_trait::{BackendDescriptor, GenerationParameters, ModelBackend};
use crate::memory::Message;

const HEALTH_POLL_INTERVAL: Duration = Duration::from_millis(250);

#[derive(Debug, Clone)]
pub struct LocalBackendConfig {
    pub model_path: PathBuf,
    /// Base URL of the inference server, e.g. `http://127.0.0.1:8081`.
    pub endpoint: String,
    /// llama-server binary to spawn on load. `None` means externally managed.
    pub runtime_binary: Option<PathBuf>,
    pub load_timeout: Duration,
    pub request_timeout: Duration,
}

#[derive(Debug, Deserialize)]
struct CompletionResponse {
    content: String,
}

pub struct LocalModelBackend {
    descriptor: BackendDescriptor,
    template: PromptTemplate,
    config: LocalBackendConfig,
    http_client: reqwest::Client,
    server_process: Mutex<Option<Child>>,
}

impl LocalModelBackend {
    pub fn new(descriptor: BackendDescriptor, template: PromptTemplate, config: LocalBackendConfig) -> Self {
        Self {
            descriptor,
            template,
            http_client: reqwest::Client::builder()
                .timeout(config.request_timeout)
                .build()
                .unwrap_or_default(),
            config,
            server_process: Mutex::new(None),
        }
    }

    pub fn deepseek(config: LocalBackendConfig) -> Self {
        Self::new(
            BackendDescriptor {
                id: "deepseek".to_string(),
                name: "DeepSeek Model".to_string(),
                description: "DeepSeek general-purpose large language model".to_string(),
                capabilities: vec![
                    "text-generation".to_string(),
                    "code-generation".to_string(),
                    "reasoning".to_string(),
                ],
                languages: vec!["en".to_string(), "ko".to_string()],
            },
            PromptTemplate::DeepSeek,
            config,
        )
    }

    pub fn llama(config: LocalBackendConfig) -> Self {
        Self::new(
            BackendDescriptor {
                id: "llama".to_string(),
                name: "Llama Model".to_string(),
                description: "Llama large language model tuned for Korean".to_string(),
                capabilities: vec![
                    "text-generation".to_string(),
                    "translation".to_string(),
                    "korean-language".to_string(),
                ],
                languages: vec!["ko".to_string(), "en".to_string()],
            },
            PromptTemplate::Llama2,
            config,
        )
    }

    fn health_url(&self) -> String {
        format!("{}/health", self.config.endpoint.trim_end_matches('/'))
    }

    fn completion_url(&self) -> String {
        format!("{}/completion", self.config.endpoint.trim_end_matches('/'))
    }

    async fn is_healthy(&self) -> bool {
        match self.http_client.get(self.health_url()).send().await {
            Ok(resp) => resp.status().is_success(),
            Err(_) => false,
        }
    }

    /// Spawn the inference server for this backend's model.
    fn spawn_server(&self, binary: &Path) -> anyhow::Result<Child> {
        if !binary.exists() {
            return Err(anyhow::anyhow!("runtime binary not found at: {}", binary.display()));
        }
        if !self.config.model_path.exists() {
            return Err(anyhow::anyhow!(
                "model not found at: {}",
                self.config.model_path.display()
            ));
        }

        let url = reqwest::Url::parse(&self.config.endpoint)
            .map_err(|e| anyhow::anyhow!("invalid endpoint '{}': {}", self.config.endpoint, e))?;
        let host = url.host_str().unwrap_or("127.0.0.1").to_string();
        let port = url
            .port_or_known_default()
            .ok_or_else(|| anyhow::anyhow!("endpoint '{}' has no port", self.config.endpoint))?;

        info!(
            "Starting inference server for {}: {} (port {})",
            self.descriptor.id,
            self.config.model_path.display(),
            port
        );

        Command::new(binary)
            .arg("--model")
            .arg(&self.config.model_path)
            .arg("--host")
            .arg(&host)
            .arg("--port")
            .arg(port.to_string())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| anyhow::anyhow!("failed to spawn {}: {}", binary.display(), e))
    }

    async fn wait_until_healthy(&self) -> anyhow::Result<()> {
        let started = Instant::now();
        loop {
            if self.is_healthy().await {
                info!(
                    "✅ Backend {} ready after {:.1}s",
                    self.descriptor.id,
                    started.elapsed().as_secs_f32()
                );
                return Ok(());
            }
            if started.elapsed() >= self.config.load_timeout {
                return Err(anyhow::anyhow!(
                    "inference server at {} not healthy within {}s",
                    self.config.endpoint,
                    self.config.load_timeout.as_secs()
                ));
            }
            sleep(HEALTH_POLL_INTERVAL).await;
        }
    }

    fn completion_payload(&self, transcript: &[Message], params: &GenerationParameters) -> Value {
        let mut payload = json!({
            "prompt": self.template.render(transcript),
            "n_predict": params.max_new_tokens,
            "temperature": params.effective_temperature(),
            "top_p": params.top_p,
            "stop": self.template.stop_sequences(),
            "stream": false,
        });
        if let Value::Object(map) = &mut payload {
            for (key, value) in &params.extra {
                map.entry(key.clone()).or_insert_with(|| value.clone());
            }
        }
        payload
    }
}

#[async_trait]
impl ModelBackend for LocalModelBackend {
    fn descriptor(&self) -> BackendDescriptor {
        self.descriptor.clone()
    }

    async fn load(&self) -> anyhow::Result<()> {
        if let Some(binary) = &self.config.runtime_binary {
            let mut process = self.server_process.lock().await;
            if process.is_none() {
                *process = Some(self.spawn_server(binary)?);
            }
        }

        if let Err(e) = self.wait_until_healthy().await {
            if let Some(mut child) = self.server_process.lock().await.take() {
                let _ = child.kill().await;
            }
            return Err(e);
        }
        Ok(())
    }

    async fn generate(
        &self,
        transcript: &[Message],
        parameters: &GenerationParameters,
    ) -> anyhow::Result<String> {
        debug!(
            "Backend {} generating from {} turn(s), max_new_tokens={}",
            self.descriptor.id,
            transcript.len(),
            parameters.max_new_tokens
        );

        let resp = self
            .http_client
            .post(self.completion_url())
            .json(&self.completion_payload(transcript, parameters))
            .send()
            .await
            .map_err(|e| anyhow::anyhow!("inference request failed: {}", e))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(anyhow::anyhow!("inference failed ({}): {}", status, body));
        }

        let completion: CompletionResponse = resp
            .json()
            .await
            .map_err(|e| anyhow::anyhow!("failed to parse inference response: {}", e))?;

        Ok(completion.content.trim().to_string())
    }

    async fn unload(&self) -> anyhow::Result<()> {
        if let Some(mut child) = self.server_process.lock().await.take() {
            info!("Stopping inference server for {}", self.descriptor.id);
            if let Err(e) = child.kill().await {
                warn!("Failed to stop inference server for {}: {}", self.descriptor.id, e);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::Matcher;

    fn config_for(endpoint: String) -> LocalBackendConfig {
        LocalBackendConfig {
            model_path: PathBuf::from("/models/test"),
            endpoint,
            runtime_binary: None,
            load_timeout: Duration::from_millis(600),
            request_timeout: Duration::from_secs(5),
        }
    }

    #[tokio::test]
    async fn load_waits_for_external_server_health() {
        let mut server = mockito::Server::new_async().await;
        let health = server.mock("GET", "/health").with_status(200).create_async().await;

        let backend = LocalModelBackend::deepseek(config_for(server.url()));
        backend.load().await.unwrap();
        health.assert_async().await;
    }

    #[tokio::test]
    async fn load_fails_when_server_never_becomes_healthy() {
        let mut server = mockito::Server::new_async().await;
        server.mock("GET", "/health").with_status(503).create_async().await;

        let backend = LocalModelBackend::llama(config_for(server.url()));
        let err = backend.load().await.unwrap_err();
        assert!(err.to_string().contains("not healthy"));
    }

    #[tokio::test]
    async fn load_fails_when_runtime_binary_is_missing() {
        let mut config = config_for("http://127.0.0.1:9".to_string());
        config.runtime_binary = Some(PathBuf::from("/nonexistent/llama-server"));
        let backend = LocalModelBackend::llama(config);

        let err = backend.load().await.unwrap_err();
        assert!(err.to_string().contains("runtime binary not found"));
    }

    #[tokio::test]
    async fn generate_sends_rendered_prompt_and_sampling_options() {
        let mut server = mockito::Server::new_async().await;
        let completion = server
            .mock("POST", "/completion")
            .match_body(Matcher::PartialJson(json!({
                "prompt": "<|user|>\nhello\n<|assistant|>\n",
                "n_predict": 32,
                "temperature": 0.0,
                "stream": false,
            })))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"content":"  Hi there!  ","stop":true}"#)
            .create_async()
            .await;

        let backend = LocalModelBackend::deepseek(config_for(server.url()));
        let params = GenerationParameters {
            max_new_tokens: 32,
            do_sample: false,
            ..Default::default()
        };
        let text = backend.generate(&[Message::user("hello")], &params).await.unwrap();

        assert_eq!(text, "Hi there!");
        completion.assert_async().await;
    }

    #[tokio::test]
    async fn generate_surfaces_engine_errors() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/completion")
            .with_status(500)
            .with_body("out of memory")
            .create_async()
            .await;

        let backend = LocalModelBackend::llama(config_for(server.url()));
        let err = backend
            .generate(&[Message::user("hi")], &GenerationParameters::default())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("out of memory"));
    }

    #[test]
    fn extra_parameters_do_not_override_typed_ones() {
        let backend = LocalModelBackend::deepseek(config_for("http://127.0.0.1:8081".into()));
        let mut params = GenerationParameters::default();
        params.extra.insert("repeat_penalty".into(), json!(1.1));
        params.extra.insert("prompt".into(), json!("injected"));

        let payload = backend.completion_payload(&[Message::user("x")], &params);
        assert_eq!(payload["repeat_penalty"], json!(1.1));
        assert_eq!(payload["prompt"], json!("<|user|>\nx\n<|assistant|>\n"));
    }
}
