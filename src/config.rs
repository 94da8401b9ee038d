//! # Configuration Management
//!
//! Loads relay configuration from multiple sources:
//! - Default values (built into the code)
//! - TOML configuration file (`config.toml`, optional)
//! - Environment variables with the `APP__` prefix and `__` as the section separator
//!   (e.g. `APP__DISPATCH__MIN_BUFFER_BYTES=65536`)
//! - Deployment shorthands: `HOST`, `PORT`, `RUNPOD_ENDPOINT`, `RUNPOD_API_KEY`
//!
//! ## Configuration Priority (highest to lowest):
//! 1. Deployment shorthands
//! 2. `APP__*` environment variables
//! 3. `config.toml`
//! 4. Defaults
//!
//! The dispatch thresholds vary a lot between deployments, so none of them are
//! hardcoded anywhere else in the crate: everything reads them from here.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;

use crate::audio::frame::HEADER_BYTES;

/// Main application configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub protocol: ProtocolConfig,
    pub dispatch: DispatchConfig,
    pub backend: BackendConfig,
    pub synthesis: SynthesisConfig,
    pub performance: PerformanceConfig,
}

/// Where the HTTP/WebSocket listener binds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

/// Fixed audio-frame protocol shared with the client.
///
/// ## Frame size:
/// Every binary frame is `8 + frame_samples * 2` bytes: an 8-byte header
/// (timestamp + flags) followed by 16-bit mono samples. The client batches
/// `frame_samples` samples per message, so both sides must agree on it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProtocolConfig {
    pub frame_samples: usize,
}

impl ProtocolConfig {
    /// Exact wire size of one frame.
    pub fn frame_bytes(&self) -> usize {
        HEADER_BYTES + self.frame_samples * 2
    }
}

/// Thresholds for the dispatch policy and the background idle sweep.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchConfig {
    /// Buffered bytes required before the threshold path may dispatch
    pub min_buffer_bytes: usize,
    /// Minimum spacing between two dispatches of the same session
    pub min_dispatch_interval_ms: u64,
    /// Silence after which the sweep flushes leftover audio
    pub max_idle_interval_ms: u64,
    /// How often the sweep runs
    pub sweep_interval_ms: u64,
    /// Hard cap on buffered audio per session; the oldest audio is dropped past it
    pub max_buffer_bytes: usize,
}

impl DispatchConfig {
    pub fn min_dispatch_interval(&self) -> Duration {
        Duration::from_millis(self.min_dispatch_interval_ms)
    }

    pub fn max_idle_interval(&self) -> Duration {
        Duration::from_millis(self.max_idle_interval_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }
}

/// How the relay discovers the result of a submitted job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendMode {
    /// Submit and block until the full result is returned (`/runsync`)
    Blocking,
    /// Submit (`/run`), then long-poll the job's stream (`/stream/{id}`)
    Streaming,
    /// Run the pipeline in-process, calling per-stage workers
    Local,
}

/// Remote inference backend settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    pub mode: BackendMode,
    /// Base URL of the job endpoint, e.g. `https://api.runpod.ai/v2/<endpoint-id>`
    pub endpoint: String,
    pub api_key: String,
    pub submit_timeout_ms: u64,
    pub stream_timeout_ms: u64,
    pub poll_interval_ms: u64,
    pub workers: WorkerEndpoints,
    pub worker_timeout_ms: u64,
}

impl BackendConfig {
    pub fn submit_timeout(&self) -> Duration {
        Duration::from_millis(self.submit_timeout_ms)
    }

    pub fn stream_timeout(&self) -> Duration {
        Duration::from_millis(self.stream_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn worker_timeout(&self) -> Duration {
        Duration::from_millis(self.worker_timeout_ms)
    }

    pub fn is_configured(&self) -> bool {
        match self.mode {
            BackendMode::Local => {
                !self.workers.recognition.is_empty()
                    && !self.workers.response.is_empty()
                    && !self.workers.synthesis.is_empty()
            }
            _ => !self.endpoint.is_empty() && !self.api_key.is_empty(),
        }
    }
}

/// Per-stage worker endpoints used by the local backend.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkerEndpoints {
    pub recognition: String,
    pub response: String,
    pub synthesis: String,
}

/// Synthesis collection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SynthesisConfig {
    /// Deadline for the whole synthesis stage
    pub deadline_ms: u64,
    /// Bound of the chunk queue between producer and collector
    pub queue_capacity: usize,
    /// Size of the raw chunks a synthesizer hands over
    pub chunk_bytes: usize,
    pub fallback: FallbackConfig,
}

impl SynthesisConfig {
    pub fn deadline(&self) -> Duration {
        Duration::from_millis(self.deadline_ms)
    }
}

/// Audio played when synthesis produced nothing before its deadline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FallbackConfig {
    pub enabled: bool,
    pub frequency_hz: f32,
    pub duration_ms: u64,
    pub sample_rate: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerformanceConfig {
    pub max_concurrent_sessions: usize,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 8080,
            },
            protocol: ProtocolConfig { frame_samples: 2048 },
            dispatch: DispatchConfig {
                min_buffer_bytes: 32_768,         // ~1s of 16kHz 16-bit mono
                min_dispatch_interval_ms: 1_000,
                max_idle_interval_ms: 3_000,
                sweep_interval_ms: 2_000,
                max_buffer_bytes: 1_920_000,      // 60s of 16kHz 16-bit mono
            },
            backend: BackendConfig {
                mode: BackendMode::Streaming,
                endpoint: String::new(),
                api_key: String::new(),
                submit_timeout_ms: 30_000,
                stream_timeout_ms: 120_000,
                poll_interval_ms: 250,
                workers: WorkerEndpoints::default(),
                worker_timeout_ms: 60_000,
            },
            synthesis: SynthesisConfig {
                deadline_ms: 60_000,
                queue_capacity: 64,
                chunk_bytes: 4_096,
                fallback: FallbackConfig {
                    enabled: true,
                    frequency_hz: 440.0,
                    duration_ms: 1_000,
                    sample_rate: 24_000,
                },
            },
            performance: PerformanceConfig {
                max_concurrent_sessions: 100,
            },
        }
    }
}

impl AppConfig {
    /// Load configuration from defaults, `config.toml` and the environment.
    pub fn load() -> Result<Self> {
        let mut settings = config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default())?)
            .add_source(config::File::with_name("config").required(false))
            .add_source(
                config::Environment::with_prefix("APP")
                    .prefix_separator("__")
                    .separator("__"),
            );

        if let Ok(host) = env::var("HOST") {
            settings = settings.set_override("server.host", host)?;
        }
        if let Ok(port) = env::var("PORT") {
            settings = settings.set_override("server.port", port)?;
        }
        if let Ok(endpoint) = env::var("RUNPOD_ENDPOINT") {
            settings = settings.set_override("backend.endpoint", endpoint)?;
        }
        if let Ok(api_key) = env::var("RUNPOD_API_KEY") {
            settings = settings.set_override("backend.api_key", api_key)?;
        }

        let config = settings.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Validate that the configuration values make sense.
    ///
    /// A missing backend endpoint is *not* a validation error: the relay still
    /// accepts connections and reports the problem per job, so it is only
    /// warned about at startup.
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(anyhow::anyhow!("Server port cannot be 0"));
        }

        if self.protocol.frame_samples == 0 {
            return Err(anyhow::anyhow!("Frame sample count must be greater than 0"));
        }

        let dispatch = &self.dispatch;
        if dispatch.min_buffer_bytes == 0 {
            return Err(anyhow::anyhow!("min_buffer_bytes must be greater than 0"));
        }
        if dispatch.min_dispatch_interval_ms == 0
            || dispatch.max_idle_interval_ms == 0
            || dispatch.sweep_interval_ms == 0
        {
            return Err(anyhow::anyhow!("Dispatch, idle and sweep intervals must be greater than 0"));
        }
        if dispatch.max_buffer_bytes < dispatch.min_buffer_bytes {
            return Err(anyhow::anyhow!(
                "max_buffer_bytes ({}) must be at least min_buffer_bytes ({})",
                dispatch.max_buffer_bytes,
                dispatch.min_buffer_bytes
            ));
        }

        let backend = &self.backend;
        if backend.submit_timeout_ms == 0
            || backend.stream_timeout_ms == 0
            || backend.poll_interval_ms == 0
            || backend.worker_timeout_ms == 0
        {
            return Err(anyhow::anyhow!("Backend timeouts and poll interval must be greater than 0"));
        }

        if self.synthesis.deadline_ms == 0 {
            return Err(anyhow::anyhow!("Synthesis deadline must be greater than 0"));
        }
        if self.synthesis.queue_capacity == 0 || self.synthesis.chunk_bytes == 0 {
            return Err(anyhow::anyhow!("Synthesis queue capacity and chunk size must be greater than 0"));
        }

        if self.performance.max_concurrent_sessions == 0 {
            return Err(anyhow::anyhow!("Max concurrent sessions must be greater than 0"));
        }

        Ok(())
    }

    /// Apply a partial JSON update (runtime tuning from `PUT /api/v1/config`).
    ///
    /// Only the `dispatch` and `synthesis` sections can change at runtime; the
    /// listener, frame size and backend wiring are fixed for the process
    /// lifetime. The result is revalidated before it is accepted.
    pub fn update_from_json(&mut self, json_str: &str) -> Result<()> {
        let partial: serde_json::Value = serde_json::from_str(json_str)?;
        let mut updated = self.clone();

        if let Some(dispatch) = partial.get("dispatch") {
            let d = &mut updated.dispatch;
            if let Some(v) = dispatch.get("min_buffer_bytes").and_then(|v| v.as_u64()) {
                d.min_buffer_bytes = v as usize;
            }
            if let Some(v) = dispatch.get("min_dispatch_interval_ms").and_then(|v| v.as_u64()) {
                d.min_dispatch_interval_ms = v;
            }
            if let Some(v) = dispatch.get("max_idle_interval_ms").and_then(|v| v.as_u64()) {
                d.max_idle_interval_ms = v;
            }
            if let Some(v) = dispatch.get("max_buffer_bytes").and_then(|v| v.as_u64()) {
                d.max_buffer_bytes = v as usize;
            }
        }

        if let Some(synthesis) = partial.get("synthesis") {
            let s = &mut updated.synthesis;
            if let Some(v) = synthesis.get("deadline_ms").and_then(|v| v.as_u64()) {
                s.deadline_ms = v;
            }
            if let Some(fallback) = synthesis.get("fallback") {
                if let Some(v) = fallback.get("enabled").and_then(|v| v.as_bool()) {
                    s.fallback.enabled = v;
                }
                if let Some(v) = fallback.get("frequency_hz").and_then(|v| v.as_f64()) {
                    s.fallback.frequency_hz = v as f32;
                }
                if let Some(v) = fallback.get("duration_ms").and_then(|v| v.as_u64()) {
                    s.fallback.duration_ms = v;
                }
            }
        }

        updated.validate()?;
        *self = updated;
        Ok(())
    }

    /// Copy safe to expose over HTTP (credentials removed).
    pub fn redacted(&self) -> Self {
        let mut copy = self.clone();
        if !copy.backend.api_key.is_empty() {
            copy.backend.api_key = "***".to_string();
        }
        copy
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.protocol.frame_bytes(), 4104);
        assert_eq!(config.backend.mode, BackendMode::Streaming);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = AppConfig::default();
        config.server.port = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.dispatch.max_buffer_bytes = config.dispatch.min_buffer_bytes - 1;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.backend.stream_timeout_ms = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.dispatch.min_dispatch_interval_ms = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_dispatch_interval_update_is_rejected() {
        let mut config = AppConfig::default();
        let json = r#"{"dispatch": {"min_dispatch_interval_ms": 0}}"#;
        assert!(config.update_from_json(json).is_err());
        assert_eq!(config.dispatch.min_dispatch_interval_ms, 1_000);
    }

    #[test]
    fn test_config_update() {
        let mut config = AppConfig::default();
        let json = r#"{"dispatch": {"min_buffer_bytes": 8192, "max_idle_interval_ms": 5000}}"#;
        assert!(config.update_from_json(json).is_ok());
        assert_eq!(config.dispatch.min_buffer_bytes, 8192);
        assert_eq!(config.dispatch.max_idle_interval_ms, 5000);
        // Untouched sections keep their values
        assert_eq!(config.dispatch.min_dispatch_interval_ms, 1000);
        assert_eq!(config.server.port, 8080);
    }

    #[test]
    fn test_rejected_update_leaves_config_untouched() {
        let mut config = AppConfig::default();
        let json = r#"{"dispatch": {"min_buffer_bytes": 0}}"#;
        assert!(config.update_from_json(json).is_err());
        assert_eq!(config.dispatch.min_buffer_bytes, 32_768);
    }

    #[test]
    fn test_backend_configured() {
        let mut config = AppConfig::default();
        assert!(!config.backend.is_configured());
        config.backend.endpoint = "https://api.runpod.ai/v2/abc".to_string();
        config.backend.api_key = "secret".to_string();
        assert!(config.backend.is_configured());
        assert_eq!(config.redacted().backend.api_key, "***");
    }
}
