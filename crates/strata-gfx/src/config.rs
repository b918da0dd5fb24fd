use serde::Deserialize;

use crate::error::{GfxError, GfxResult};
use crate::raytracing::pipeline::ShaderTableLimits;

/// 使用哪个后端
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// 在 host 内存中模拟 GPU，用于测试和 headless 运行
    #[default]
    Host,
    Vulkan,
}

/// host 后端的参数
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct HostDeviceConfig {
    pub identifier_size: u32,
    pub record_alignment: u32,
    pub table_alignment: u32,
    /// 设备内存上限，超出时创建 buffer 失败
    pub memory_budget: Option<u64>,
}

impl Default for HostDeviceConfig {
    fn default() -> Self {
        let limits = ShaderTableLimits::default();
        Self {
            identifier_size: limits.identifier_size,
            record_alignment: limits.record_alignment,
            table_alignment: limits.table_alignment,
            memory_budget: None,
        }
    }
}

impl HostDeviceConfig {
    pub fn shader_table_limits(&self) -> ShaderTableLimits {
        ShaderTableLimits {
            identifier_size: self.identifier_size,
            record_alignment: self.record_alignment,
            table_alignment: self.table_alignment,
        }
    }
}

/// 设备层的配置，对应 TOML 中的 `[gfx]`
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct GfxConfig {
    pub app_name: String,
    pub frames_in_flight: usize,
    pub backend: BackendKind,
    /// 是否开启 Vulkan 的 validation layer
    pub enable_validation: bool,
    pub host: HostDeviceConfig,
}

impl Default for GfxConfig {
    fn default() -> Self {
        Self {
            app_name: "strata".to_string(),
            frames_in_flight: 3,
            backend: BackendKind::default(),
            enable_validation: cfg!(debug_assertions),
            host: HostDeviceConfig::default(),
        }
    }
}

impl GfxConfig {
    pub fn from_toml_str(content: &str) -> GfxResult<Self> {
        let config: GfxConfig = toml::from_str(content).map_err(|e| GfxError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> GfxResult<()> {
        if self.frames_in_flight == 0 {
            return Err(GfxError::Config("frames_in_flight must be at least 1".to_string()));
        }
        if self.host.identifier_size == 0 {
            return Err(GfxError::Config("identifier_size must not be 0".to_string()));
        }
        for (name, align) in [
            ("record_alignment", self.host.record_alignment),
            ("table_alignment", self.host.table_alignment),
        ] {
            if !align.is_power_of_two() {
                return Err(GfxError::Config(format!("{name} must be a power of two, got {align}")));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_partial_config() {
        let config = GfxConfig::from_toml_str(
            r#"
            frames_in_flight = 2
            backend = "host"

            [host]
            table_alignment = 128
            memory_budget = 4096
            "#,
        )
        .unwrap();

        assert_eq!(config.frames_in_flight, 2);
        assert_eq!(config.backend, BackendKind::Host);
        assert_eq!(config.host.identifier_size, 32);
        assert_eq!(config.host.table_alignment, 128);
        assert_eq!(config.host.memory_budget, Some(4096));
        assert_eq!(config.app_name, "strata");
    }

    #[test]
    fn test_reject_bad_alignment() {
        let err = GfxConfig::from_toml_str("[host]\nrecord_alignment = 24").unwrap_err();
        assert!(matches!(err, GfxError::Config(_)));
    }

    #[test]
    fn test_reject_zero_frames() {
        assert!(GfxConfig::from_toml_str("frames_in_flight = 0").is_err());
    }
}
