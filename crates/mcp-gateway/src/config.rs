// mcp-gateway/crates/mcp-gateway/src/config.rs

use anyhow::{Context, Result};
use std::collections::HashMap;
use std::env;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use tracing::{info, warn};

use crate::error::{GatewayError, GatewayResult};
use crate::model_runtime::runtime_trait::MAX_TEMPERATURE;
use crate::model_runtime::GenerationParameters;

pub const DEFAULT_ROUTE: &str = "default";

/// Persistence medium for session transcripts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageKind {
    Volatile,
    ExternalCache,
    EmbeddedRelational,
}

impl StorageKind {
    pub fn name(&self) -> &'static str {
        match self {
            StorageKind::Volatile => "memory",
            StorageKind::ExternalCache => "redis",
            StorageKind::EmbeddedRelational => "sqlite",
        }
    }
}

impl FromStr for StorageKind {
    type Err = GatewayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "memory" | "volatile" => Ok(StorageKind::Volatile),
            "redis" | "external-cache" => Ok(StorageKind::ExternalCache),
            "sqlite" | "embedded-relational" => Ok(StorageKind::EmbeddedRelational),
            other => Err(GatewayError::Config(format!(
                "unknown CONTEXT_STORAGE '{}', expected memory, redis or sqlite",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub app_name: String,
    pub debug: bool,
    pub api_prefix: String,
    pub api_host: String,
    pub api_port: u16,
    pub storage: StorageKind,
    pub context_ttl_seconds: u64,
    pub sweep_interval_seconds: u64,
    pub redis_url: String,
    pub sqlite_path: PathBuf,
    pub max_new_tokens: u32,
    pub temperature: f32,
    pub top_p: f32,
    pub do_sample: bool,
    pub generate_timeout_seconds: u64,
    pub model_routing: HashMap<String, String>,
    pub deepseek_model_path: PathBuf,
    pub llama_model_path: PathBuf,
    pub deepseek_endpoint: String,
    pub llama_endpoint: String,
    pub llama_bin: Option<PathBuf>,
    pub backend_load_timeout_seconds: u64,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        #[cfg(feature = "cli")]
        {
            if let Err(e) = dotenvy::dotenv() {
                warn!("Failed to load .env file: {}. Using system environment variables.", e);
            } else {
                info!("Loaded environment variables from .env file");
            }
        }

        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build a config from any key lookup. Missing keys take their defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let storage = lookup("CONTEXT_STORAGE")
            .unwrap_or_else(|| "memory".into())
            .parse::<StorageKind>()?;

        let model_routing = parse_routing(
            &lookup("MODEL_ROUTING")
                .unwrap_or_else(|| "default=deepseek,translation=llama,korean=llama".into()),
        )?;

        let llama_bin = lookup("LLAMA_BIN")
            .filter(|s| !s.trim().is_empty())
            .map(PathBuf::from);

        let config = Self {
            app_name: lookup("APP_NAME").unwrap_or_else(|| "MCP Server".into()),
            debug: parse_bool(&lookup, "DEBUG", true)?,
            api_prefix: lookup("API_PREFIX").unwrap_or_else(|| "/api".into()),
            api_host: lookup("API_HOST").unwrap_or_else(|| "127.0.0.1".into()),
            api_port: parse_or(&lookup, "API_PORT", 8000)?,
            storage,
            context_ttl_seconds: parse_or(&lookup, "CONTEXT_TTL", 3600)?,
            sweep_interval_seconds: parse_or(&lookup, "CONTEXT_SWEEP_INTERVAL_SECONDS", 60)?,
            redis_url: lookup("REDIS_URL").unwrap_or_else(|| "redis://127.0.0.1:6379/0".into()),
            sqlite_path: lookup("SQLITE_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./data/contexts.db")),
            max_new_tokens: parse_or(&lookup, "MAX_NEW_TOKENS", 2048)?,
            temperature: parse_or(&lookup, "TEMPERATURE", 0.7)?,
            top_p: parse_or(&lookup, "TOP_P", 0.95)?,
            do_sample: parse_bool(&lookup, "DO_SAMPLE", true)?,
            generate_timeout_seconds: parse_or(&lookup, "GENERATE_TIMEOUT_SECONDS", 300)?,
            model_routing,
            deepseek_model_path: lookup("DEEPSEEK_MODEL_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./models/deepseek")),
            llama_model_path: lookup("LLAMA_MODEL_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./models/llama")),
            deepseek_endpoint: lookup("DEEPSEEK_ENDPOINT")
                .unwrap_or_else(|| "http://127.0.0.1:8081".into()),
            llama_endpoint: lookup("LLAMA_ENDPOINT")
                .unwrap_or_else(|| "http://127.0.0.1:8082".into()),
            llama_bin,
            backend_load_timeout_seconds: parse_or(&lookup, "BACKEND_LOAD_TIMEOUT_SECONDS", 60)?,
        };

        config.validate()?;
        Ok(config)
    }

    /// Startup validation. Anything rejected here must abort the process.
    pub fn validate(&self) -> GatewayResult<()> {
        if self.context_ttl_seconds == 0 {
            return Err(GatewayError::Config("CONTEXT_TTL must be greater than zero".into()));
        }
        if self.sweep_interval_seconds == 0 {
            return Err(GatewayError::Config(
                "CONTEXT_SWEEP_INTERVAL_SECONDS must be greater than zero".into(),
            ));
        }
        if !(0.0..=MAX_TEMPERATURE).contains(&self.temperature) {
            return Err(GatewayError::Config(format!(
                "TEMPERATURE must be within 0.0..={}, got {}",
                MAX_TEMPERATURE, self.temperature
            )));
        }
        if !(0.0..=1.0).contains(&self.top_p) || self.top_p == 0.0 {
            return Err(GatewayError::Config(format!(
                "TOP_P must be within (0.0, 1.0], got {}",
                self.top_p
            )));
        }
        if self.max_new_tokens == 0 {
            return Err(GatewayError::Config("MAX_NEW_TOKENS must be greater than zero".into()));
        }
        if !self.model_routing.contains_key(DEFAULT_ROUTE) {
            return Err(GatewayError::RoutingKeyUnresolvable(DEFAULT_ROUTE.into()));
        }
        Ok(())
    }

    pub fn generation_defaults(&self) -> GenerationParameters {
        GenerationParameters {
            max_new_tokens: self.max_new_tokens,
            temperature: self.temperature,
            top_p: self.top_p,
            do_sample: self.do_sample,
            extra: Default::default(),
        }
    }

    pub fn context_ttl(&self) -> Duration {
        Duration::from_secs(self.context_ttl_seconds)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_seconds)
    }

    pub fn generate_timeout(&self) -> Duration {
        Duration::from_secs(self.generate_timeout_seconds)
    }

    pub fn backend_load_timeout(&self) -> Duration {
        Duration::from_secs(self.backend_load_timeout_seconds)
    }

    pub fn print_config(&self) {
        info!("Current Configuration:");
        info!("- App: {} (debug: {})", self.app_name, self.debug);
        info!("- API: {}:{}{}", self.api_host, self.api_port, self.api_prefix);
        info!("- Context Storage: {}", self.storage.name());
        info!("- Context TTL: {}s (sweep every {}s)", self.context_ttl_seconds, self.sweep_interval_seconds);
        info!(
            "- Generation Defaults: max_new_tokens={}, temperature={}, top_p={}, do_sample={}",
            self.max_new_tokens, self.temperature, self.top_p, self.do_sample
        );
        info!("- Generate Timeout: {}s", self.generate_timeout_seconds);
        let mut routes: Vec<_> = self.model_routing.iter().collect();
        routes.sort();
        for (key, backend) in routes {
            info!("- Route: {} -> {}", key, backend);
        }
        info!("- DeepSeek: {} @ {}", self.deepseek_model_path.display(), self.deepseek_endpoint);
        info!("- Llama: {} @ {}", self.llama_model_path.display(), self.llama_endpoint);
        if let Some(bin) = &self.llama_bin {
            info!("- Runtime Binary: {}", bin.display());
        }
    }

    pub fn api_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.api_host, self.api_port)
            .parse()
            .with_context(|| format!("invalid API address {}:{}", self.api_host, self.api_port))
    }
}

fn parse_or<F, T>(lookup: &F, key: &str, default: T) -> Result<T>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("{} has an invalid value: '{}'", key, raw)),
        None => Ok(default),
    }
}

fn parse_bool<F>(lookup: &F, key: &str, default: bool) -> Result<bool>
where
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        Some(raw) => match raw.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            _ => Err(anyhow::anyhow!("{} must be a boolean, got '{}'", key, raw)),
        },
        None => Ok(default),
    }
}

/// Parses `key=backend` pairs separated by commas, e.g.
/// `default=deepseek,translation=llama`.
pub fn parse_routing(raw: &str) -> Result<HashMap<String, String>> {
    let mut table = HashMap::new();
    for entry in raw.split(',').map(str::trim).filter(|e| !e.is_empty()) {
        let (key, backend) = entry
            .split_once('=')
            .ok_or_else(|| anyhow::anyhow!("MODEL_ROUTING entry '{}' is not key=backend", entry))?;
        let (key, backend) = (key.trim(), backend.trim());
        if key.is_empty() || backend.is_empty() {
            return Err(anyhow::anyhow!("MODEL_ROUTING entry '{}' has an empty side", entry));
        }
        table.insert(key.to_string(), backend.to_string());
    }
    Ok(table)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_from(pairs: &[(&str, &str)]) -> Result<Config> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_defaults_match_documented_values() {
        let config = config_from(&[]).unwrap();

        assert_eq!(config.app_name, "MCP Server");
        assert!(config.debug);
        assert_eq!(config.storage, StorageKind::Volatile);
        assert_eq!(config.context_ttl_seconds, 3600);
        assert_eq!(config.max_new_tokens, 2048);
        assert!((config.temperature - 0.7).abs() < f32::EPSILON);
        assert!((config.top_p - 0.95).abs() < f32::EPSILON);
        assert_eq!(config.model_routing.get("default").map(String::as_str), Some("deepseek"));
        assert_eq!(config.model_routing.get("korean").map(String::as_str), Some("llama"));
        assert!(config.llama_bin.is_none());
    }

    #[test]
    fn test_storage_aliases() {
        assert_eq!("volatile".parse::<StorageKind>().unwrap(), StorageKind::Volatile);
        assert_eq!("external-cache".parse::<StorageKind>().unwrap(), StorageKind::ExternalCache);
        assert_eq!("SQLite".parse::<StorageKind>().unwrap(), StorageKind::EmbeddedRelational);
        assert!("postgres".parse::<StorageKind>().is_err());
    }

    #[test]
    fn test_overrides_are_applied() {
        let config = config_from(&[
            ("CONTEXT_STORAGE", "sqlite"),
            ("CONTEXT_TTL", "120"),
            ("DEBUG", "false"),
            ("MODEL_ROUTING", "default=llama, code=deepseek"),
            ("LLAMA_BIN", "/opt/llama-server"),
        ])
        .unwrap();

        assert_eq!(config.storage, StorageKind::EmbeddedRelational);
        assert_eq!(config.context_ttl(), Duration::from_secs(120));
        assert!(!config.debug);
        assert_eq!(config.model_routing.len(), 2);
        assert_eq!(config.model_routing["code"], "deepseek");
        assert_eq!(config.llama_bin, Some(PathBuf::from("/opt/llama-server")));
    }

    #[test]
    fn test_missing_default_route_is_fatal() {
        let err = config_from(&[("MODEL_ROUTING", "translation=llama")]).unwrap_err();
        let gateway_err = err.downcast_ref::<GatewayError>().unwrap();
        assert!(matches!(gateway_err, GatewayError::RoutingKeyUnresolvable(_)));
    }

    #[test]
    fn test_malformed_values_are_rejected() {
        assert!(config_from(&[("CONTEXT_TTL", "soon")]).is_err());
        assert!(config_from(&[("CONTEXT_TTL", "0")]).is_err());
        assert!(config_from(&[("DEBUG", "maybe")]).is_err());
        assert!(config_from(&[("TOP_P", "1.5")]).is_err());
        assert!(config_from(&[("MODEL_ROUTING", "default")]).is_err());
    }

    #[test]
    fn test_generation_defaults_carry_config_values() {
        let config = config_from(&[("MAX_NEW_TOKENS", "256"), ("DO_SAMPLE", "no")]).unwrap();
        let params = config.generation_defaults();
        assert_eq!(params.max_new_tokens, 256);
        assert!(!params.do_sample);
        assert!(params.extra.is_empty());
    }

    #[test]
    fn test_api_addr_parsing() {
        let config = config_from(&[("API_HOST", "0.0.0.0"), ("API_PORT", "5000")]).unwrap();
        let addr = config.api_addr().unwrap();
        assert_eq!(addr.port(), 5000);
        assert_eq!(addr.ip().to_string(), "0.0.0.0");
    }
}
