use std::path::PathBuf;

use crate::error::GfxResult;

/// shader table 中的四个区域，顺序固定
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ShaderCategory {
    RayGen,
    Miss,
    HitGroup,
    Callable,
}

/// hit group 的几何类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HitGroupKind {
    Triangles,
    /// 需要 intersection shader
    Procedural,
}

impl HitGroupKind {
    /// 组成该 hit group 的入口
    pub fn stages(self) -> &'static [HitGroupStage] {
        match self {
            HitGroupKind::Triangles => &[HitGroupStage::ClosestHit, HitGroupStage::AnyHit],
            HitGroupKind::Procedural => &[HitGroupStage::ClosestHit, HitGroupStage::AnyHit, HitGroupStage::Intersection],
        }
    }
}

/// hit group 内部的各个入口
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HitGroupStage {
    ClosestHit,
    AnyHit,
    Intersection,
}

/// 管线创建时各个入口的导出名
///
/// ray gen 只有一个，所以没有下标
pub fn export_name(category: ShaderCategory, index: usize) -> String {
    match category {
        ShaderCategory::RayGen => "RayGenMain".to_string(),
        ShaderCategory::Miss => format!("MissMain{index}"),
        ShaderCategory::HitGroup => format!("HitGroup{index}"),
        ShaderCategory::Callable => format!("CallableMain{index}"),
    }
}

pub fn hit_group_stage_name(stage: HitGroupStage, index: usize) -> String {
    match stage {
        HitGroupStage::ClosestHit => format!("ClosestHitMain{index}"),
        HitGroupStage::AnyHit => format!("AnyHitMain{index}"),
        HitGroupStage::Intersection => format!("IntersectionMain{index}"),
    }
}

/// `export_name` 的逆过程
pub fn parse_export_name(name: &str) -> Option<(ShaderCategory, usize)> {
    if name == "RayGenMain" {
        return Some((ShaderCategory::RayGen, 0));
    }

    let prefixes = [
        ("MissMain", ShaderCategory::Miss),
        ("HitGroup", ShaderCategory::HitGroup),
        ("CallableMain", ShaderCategory::Callable),
    ];
    prefixes.iter().find_map(|(prefix, category)| {
        let digits = name.strip_prefix(prefix)?;
        if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        digits.parse().ok().map(|index| (*category, index))
    })
}

/// 创建光追管线需要的信息
///
/// shader group 按 raygen, miss..., hit group..., callable... 排列，每类内部的顺序即导出名中的下标
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RayTracingPipelineDesc {
    pub name: String,
    pub miss_count: usize,
    pub hit_groups: Vec<HitGroupKind>,
    pub callable_count: usize,
    /// 每个入口对应 `{入口名}.spv`，入口函数为 `main`；host 后端不读取
    pub shader_dir: Option<PathBuf>,
}

/// 由设备给出的 shader table 布局常量
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShaderTableLimits {
    /// shader identifier 的字节数
    pub identifier_size: u32,
    /// 每条 record 的对齐
    pub record_alignment: u32,
    /// 每个区域起始地址的对齐
    pub table_alignment: u32,
}

impl Default for ShaderTableLimits {
    fn default() -> Self {
        Self {
            identifier_size: 32,
            record_alignment: 32,
            table_alignment: 64,
        }
    }
}

/// 已经创建好的光追管线，只暴露 shader table 需要的部分
pub trait GfxRayTracingPipeline {
    fn miss_shader_count(&self) -> usize;

    fn hit_group_count(&self) -> usize;

    fn callable_shader_count(&self) -> usize;

    /// 根据导出名查询 shader identifier，长度等于 `ShaderTableLimits::identifier_size`
    fn shader_identifier(&self, export_name: &str) -> GfxResult<Vec<u8>>;

    fn category_count(&self, category: ShaderCategory) -> usize {
        match category {
            ShaderCategory::RayGen => 1,
            ShaderCategory::Miss => self.miss_shader_count(),
            ShaderCategory::HitGroup => self.hit_group_count(),
            ShaderCategory::Callable => self.callable_shader_count(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_export_names() {
        assert_eq!(export_name(ShaderCategory::RayGen, 5), "RayGenMain");
        assert_eq!(export_name(ShaderCategory::Miss, 1), "MissMain1");
        assert_eq!(export_name(ShaderCategory::HitGroup, 0), "HitGroup0");
        assert_eq!(export_name(ShaderCategory::Callable, 12), "CallableMain12");
        assert_eq!(hit_group_stage_name(HitGroupStage::Intersection, 2), "IntersectionMain2");
    }

    #[test]
    fn test_procedural_group_has_intersection() {
        assert!(!HitGroupKind::Triangles.stages().contains(&HitGroupStage::Intersection));
        assert_eq!(HitGroupKind::Procedural.stages().last(), Some(&HitGroupStage::Intersection));
    }

    #[test]
    fn test_parse_export_name() {
        for category in [ShaderCategory::Miss, ShaderCategory::HitGroup, ShaderCategory::Callable] {
            for index in [0, 3, 41] {
                assert_eq!(parse_export_name(&export_name(category, index)), Some((category, index)));
            }
        }
        assert_eq!(parse_export_name("RayGenMain"), Some((ShaderCategory::RayGen, 0)));
        assert_eq!(parse_export_name("MissMain"), None);
        assert_eq!(parse_export_name("MissMain+1"), None);
        assert_eq!(parse_export_name("ClosestHitMain0"), None);
    }
}
