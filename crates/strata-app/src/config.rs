use std::path::Path;

use anyhow::Context;
use serde::Deserialize;
use strata_gfx::config::GfxConfig;

/// `strata.toml` 的内容
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// headless 运行多少帧
    pub frame_count: u64,
    pub gfx: GfxConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            frame_count: 6,
            gfx: GfxConfig::default(),
        }
    }
}

impl AppConfig {
    pub const DEFAULT_PATH: &'static str = "strata.toml";

    pub fn from_toml_str(content: &str) -> anyhow::Result<Self> {
        let config: AppConfig = toml::from_str(content).context("failed to parse app config")?;
        config.gfx.validate().context("invalid [gfx] section")?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content =
            std::fs::read_to_string(path).with_context(|| format!("failed to read config {}", path.display()))?;
        Self::from_toml_str(&content).with_context(|| format!("in config {}", path.display()))
    }

    /// 命令行第一个参数指定配置路径；否则尝试当前目录下的 `strata.toml`，都没有时使用默认值
    pub fn load(arg: Option<String>) -> anyhow::Result<Self> {
        match arg {
            Some(path) => Self::from_file(path),
            None if Path::new(Self::DEFAULT_PATH).exists() => Self::from_file(Self::DEFAULT_PATH),
            None => {
                log::info!("no {} found, using default config", Self::DEFAULT_PATH);
                Ok(Self::default())
            }
        }
    }
}
