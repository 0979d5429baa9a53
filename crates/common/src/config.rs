use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;

use crate::types::{ChanMode, ListerKind, Topology};

/// Top-level application config, loaded from config/shmfb.toml
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub general: GeneralConfig,
    pub publisher: PublisherConfig,
    pub sweep: SweepConfig,
    pub demo: DemoConfig,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    pub log_level: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PublisherConfig {
    /// Initial on/off state of the publisher.
    pub active: bool,
    /// How many mismatching pixels the conversion self-test reports before suppressing.
    pub verify_max_errors: usize,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            active: true,
            verify_max_errors: 32,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SweepConfig {
    pub lister: ListerKind,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DemoConfig {
    pub width: u32,
    pub height: u32,
    pub channels: u32,
    pub mode: ChanMode,
    pub top_to_bottom: bool,
    pub out_channels: u32,
    pub out_mode: ChanMode,
    pub out_top_to_bottom: bool,
    pub frames: u64,
    pub interval_ms: u64,
    /// Swap width/height every N frames to exercise topology changes (0 = never).
    pub resize_every: u64,
    pub pattern: u32,
}

impl Default for DemoConfig {
    fn default() -> Self {
        Self {
            width: 640,
            height: 360,
            channels: 3,
            mode: ChanMode::Uc8,
            top_to_bottom: true,
            out_channels: 3,
            out_mode: ChanMode::Uc8,
            out_top_to_bottom: true,
            frames: 120,
            interval_ms: 33,
            resize_every: 0,
            pattern: 0,
        }
    }
}

impl DemoConfig {
    pub fn source_topology(&self) -> Topology {
        Topology::new(self.width, self.height, self.channels, self.mode, self.top_to_bottom)
    }

    pub fn output_topology(&self) -> Topology {
        self.source_topology()
            .with_layout(self.out_channels, self.out_mode, self.out_top_to_bottom)
    }
}

impl AppConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config: {}", path.display()))?;
        let config: AppConfig = toml::from_str(&content)
            .with_context(|| format!("failed to parse config: {}", path.display()))?;
        Ok(config)
    }

    /// Load `path` if it exists, otherwise fall back to defaults.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            tracing::debug!("config {} not found, using defaults", path.display());
            Ok(Self::default())
        }
    }
}
