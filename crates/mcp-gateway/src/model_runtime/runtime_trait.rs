use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{GatewayError, GatewayResult};
use crate::memory::Message;

/// Highest sampling temperature accepted from config or per-request overrides.
pub const MAX_TEMPERATURE: f32 = 2.0;

/// Static description of a backend, as reported by [`ModelBackend::descriptor`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendDescriptor {
    pub id: String,
    pub name: String,
    pub description: String,
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default)]
    pub languages: Vec<String>,
}

/// Lifecycle of a registered backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum LifecycleState {
    Unloaded,
    Loading,
    Ready,
    Failed { cause: String },
}

impl LifecycleState {
    pub fn is_ready(&self) -> bool {
        matches!(self, LifecycleState::Ready)
    }
}

/// Descriptor plus the lifecycle state observed when the snapshot was taken.
#[derive(Debug, Clone, Serialize)]
pub struct BackendInfo {
    #[serde(flatten)]
    pub descriptor: BackendDescriptor,
    pub state: LifecycleState,
}

/// Sampling options for one generation call.
///
/// Recognized keys are typed; anything else a caller sends is kept in `extra`
/// and forwarded to the backend untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationParameters {
    pub max_new_tokens: u32,
    pub temperature: f32,
    pub top_p: f32,
    pub do_sample: bool,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Default for GenerationParameters {
    fn default() -> Self {
        Self {
            max_new_tokens: 2048,
            temperature: 0.7,
            top_p: 0.95,
            do_sample: true,
            extra: Map::new(),
        }
    }
}

impl GenerationParameters {
    /// Overlays caller-supplied keys on top of `self`, key by key.
    pub fn layered(&self, overrides: &Map<String, Value>) -> GatewayResult<Self> {
        if overrides.is_empty() {
            return Ok(self.clone());
        }

        let mut merged = match serde_json::to_value(self) {
            Ok(Value::Object(map)) => map,
            Ok(_) => return Err(GatewayError::InvalidParameters("defaults are not an object".into())),
            Err(e) => return Err(GatewayError::InvalidParameters(e.to_string())),
        };
        for (key, value) in overrides {
            merged.insert(key.clone(), value.clone());
        }

        let params: GenerationParameters = serde_json::from_value(Value::Object(merged))
            .map_err(|e| GatewayError::InvalidParameters(e.to_string()))?;
        params.check()?;
        Ok(params)
    }

    fn check(&self) -> GatewayResult<()> {
        if self.max_new_tokens == 0 {
            return Err(GatewayError::InvalidParameters("max_new_tokens must be positive".into()));
        }
        if !(0.0..=MAX_TEMPERATURE).contains(&self.temperature) {
            return Err(GatewayError::InvalidParameters(format!(
                "temperature must be within 0.0..={}, got {}",
                MAX_TEMPERATURE, self.temperature
            )));
        }
        if !(self.top_p > 0.0 && self.top_p <= 1.0) {
            return Err(GatewayError::InvalidParameters(format!(
                "top_p must be within (0, 1], got {}",
                self.top_p
            )));
        }
        Ok(())
    }

    /// Temperature actually sent to the engine; greedy decoding when sampling is off.
    pub fn effective_temperature(&self) -> f32 {
        if self.do_sample {
            self.temperature
        } else {
            0.0
        }
    }
}

/// Capability every text-generation backend exposes to the gateway.
///
/// Implementations are held behind `Arc<dyn ModelBackend>` by the registry,
/// which guarantees `load` is never run concurrently for the same backend.
#[async_trait]
pub trait ModelBackend: Send + Sync {
    fn descriptor(&self) -> BackendDescriptor;

    /// Materialize the backend (start the engine, wait until it answers).
    async fn load(&self) -> anyhow::Result<()>;

    async fn generate(
        &self,
        transcript: &[Message],
        parameters: &GenerationParameters,
    ) -> anyhow::Result<String>;

    async fn unload(&self) -> anyhow::Result<()> {
        Ok(())
    }
}
