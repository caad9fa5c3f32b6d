//! Server configuration.
//!
//! Supports loading from YAML files with environment variable overrides.

use std::path::Path;
use std::str::FromStr;

use anyhow::{anyhow, Context, Result};
use ensemble_core::protocol_constants::DEFAULT_SONOS_PORT;
use ensemble_core::{EngineConfig, Endpoint, RendererId};
use serde::Deserialize;

/// A renderer the server manages.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RendererConfig {
    /// Player UUID, e.g. `RINCON_000E58A0B1C201400`.
    pub id: String,
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_port() -> u16 {
    DEFAULT_SONOS_PORT
}

impl RendererConfig {
    pub fn renderer_id(&self) -> RendererId {
        RendererId::new(self.id.as_str())
    }

    pub fn endpoint(&self) -> Endpoint {
        Endpoint::new(self.host.as_str(), self.port)
    }
}

/// Parses `ID@HOST[:PORT]`.
impl FromStr for RendererConfig {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let (id, address) = s
            .split_once('@')
            .ok_or_else(|| anyhow!("expected ID@HOST[:PORT], got '{}'", s))?;
        let (host, port) = match address.rsplit_once(':') {
            Some((host, port)) => (
                host,
                port.parse()
                    .with_context(|| format!("invalid port in '{}'", s))?,
            ),
            None => (address, DEFAULT_SONOS_PORT),
        };
        if id.is_empty() || host.is_empty() {
            return Err(anyhow!("expected ID@HOST[:PORT], got '{}'", s));
        }
        Ok(Self {
            id: id.to_string(),
            host: host.to_string(),
            port,
        })
    }
}

/// Server configuration loaded from YAML with environment overrides.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Engine timings and streaming-service parameters.
    pub engine: EngineConfig,

    /// Renderers to manage.
    /// Override: `ENSEMBLE_RENDERERS` (comma-separated `ID@HOST[:PORT]`)
    pub renderers: Vec<RendererConfig>,

    /// Renderer to activate as playback target at startup.
    /// Override: `ENSEMBLE_ACTIVE_RENDERER`
    pub active_renderer: Option<String>,
}

impl ServerConfig {
    /// Loads configuration from a YAML file, then applies environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = if let Some(path) = path {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {}", path.display()))?;
            serde_yaml::from_str(&content)
                .with_context(|| format!("Failed to parse config file: {}", path.display()))?
        } else {
            Self::default()
        };

        config.apply_env_overrides()?;
        config
            .engine
            .validate()
            .map_err(|e| anyhow!("Invalid engine configuration: {}", e))?;
        Ok(config)
    }

    /// Applies environment variable overrides to the configuration.
    fn apply_env_overrides(&mut self) -> Result<()> {
        if let Ok(val) = std::env::var("ENSEMBLE_TOPOLOGY_POLL_INTERVAL_MS") {
            if let Ok(ms) = val.parse() {
                self.engine.topology_poll_interval_ms = ms;
            }
        }

        if let Ok(val) = std::env::var("ENSEMBLE_RECONCILIATION_INTERVAL_MS") {
            if let Ok(ms) = val.parse() {
                self.engine.reconciliation_interval_ms = ms;
            }
        }

        if let Ok(val) = std::env::var("ENSEMBLE_STRIKE_THRESHOLD") {
            if let Ok(strikes) = val.parse() {
                self.engine.strike_threshold = strikes;
            }
        }

        if let Ok(val) = std::env::var("ENSEMBLE_RENDERERS") {
            self.renderers = val
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(RendererConfig::from_str)
                .collect::<Result<_>>()
                .context("Invalid ENSEMBLE_RENDERERS")?;
        }

        if let Ok(val) = std::env::var("ENSEMBLE_ACTIVE_RENDERER") {
            self.active_renderer = Some(val);
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renderer_spec_defaults_the_sonos_port() {
        let r: RendererConfig = "RINCON_A@192.168.1.20".parse().expect("valid");
        assert_eq!(r.endpoint(), Endpoint::new("192.168.1.20", 1400));

        let r: RendererConfig = "RINCON_B@192.168.1.21:1401".parse().expect("valid");
        assert_eq!(r.port, 1401);
        assert!("192.168.1.21".parse::<RendererConfig>().is_err());
    }

    #[test]
    fn yaml_fills_missing_engine_fields() {
        let config: ServerConfig = serde_yaml::from_str(
            "engine:\n  strike_threshold: 5\nrenderers:\n  - id: RINCON_A\n    host: 10.0.0.2\n",
        )
        .expect("valid yaml");

        assert_eq!(config.engine.strike_threshold, 5);
        assert_eq!(config.engine.reconnect_base_ms, 60_000);
        assert_eq!(config.renderers[0].port, 1400);
    }
}
