use itertools::Itertools;

use crate::error::{GfxError, GfxResult};
use crate::raytracing::pipeline::{
    GfxRayTracingPipeline, HitGroupKind, ShaderCategory, hit_group_stage_name, parse_export_name,
};

/// host 后端的光追管线，shader identifier 由导出名确定性地生成
pub struct HostRayTracingPipeline {
    identifier_size: u32,
    miss_count: usize,
    hit_groups: Vec<HitGroupKind>,
    callable_count: usize,
}

impl HostRayTracingPipeline {
    pub fn new(identifier_size: u32, miss_count: usize, hit_groups: Vec<HitGroupKind>, callable_count: usize) -> Self {
        Self {
            identifier_size,
            miss_count,
            hit_groups,
            callable_count,
        }
    }

    /// hit group 的 identifier 由组名和它的全部成员入口决定
    fn identifier_seed(&self, export_name: &str) -> String {
        let group = parse_export_name(export_name).and_then(|(category, index)| match category {
            ShaderCategory::HitGroup => Some((index, self.hit_groups.get(index)?)),
            _ => None,
        });
        match group {
            Some((index, kind)) => {
                let stages = kind.stages().iter().map(|stage| hit_group_stage_name(*stage, index)).join("+");
                format!("{export_name}:{stages}")
            }
            None => export_name.to_string(),
        }
    }

    /// FNV-1a 作为种子，再用 xorshift 填满整个 identifier
    fn make_identifier(&self, export_name: &str) -> Vec<u8> {
        let mut state = self
            .identifier_seed(export_name)
            .bytes()
            .fold(0xcbf2_9ce4_8422_2325_u64, |hash, b| (hash ^ b as u64).wrapping_mul(0x0000_0100_0000_01b3));

        (0..self.identifier_size)
            .map(|_| {
                state ^= state << 13;
                state ^= state >> 7;
                state ^= state << 17;
                (state >> 24) as u8
            })
            .collect()
    }
}

impl GfxRayTracingPipeline for HostRayTracingPipeline {
    fn miss_shader_count(&self) -> usize {
        self.miss_count
    }

    fn hit_group_count(&self) -> usize {
        self.hit_groups.len()
    }

    fn callable_shader_count(&self) -> usize {
        self.callable_count
    }

    fn shader_identifier(&self, export_name: &str) -> GfxResult<Vec<u8>> {
        let registered = parse_export_name(export_name)
            .is_some_and(|(category, index)| category == ShaderCategory::RayGen || index < self.category_count(category));
        if !registered {
            return Err(GfxError::ShaderIdentifierNotFound(export_name.to_string()));
        }
        Ok(self.make_identifier(export_name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identifiers_are_stable_and_distinct() {
        let pipeline = HostRayTracingPipeline::new(32, 2, vec![HitGroupKind::Triangles], 0);
        let miss0 = pipeline.shader_identifier("MissMain0").unwrap();
        assert_eq!(miss0.len(), 32);
        assert_eq!(miss0, pipeline.shader_identifier("MissMain0").unwrap());
        assert_ne!(miss0, pipeline.shader_identifier("MissMain1").unwrap());
    }

    #[test]
    fn test_hit_group_identifier_depends_on_members() {
        let triangles = HostRayTracingPipeline::new(32, 0, vec![HitGroupKind::Triangles], 0);
        let procedural = HostRayTracingPipeline::new(32, 0, vec![HitGroupKind::Procedural], 0);
        assert_ne!(
            triangles.shader_identifier("HitGroup0").unwrap(),
            procedural.shader_identifier("HitGroup0").unwrap()
        );
        assert_eq!(triangles.identifier_seed("HitGroup0"), "HitGroup0:ClosestHitMain0+AnyHitMain0");
        assert_eq!(
            triangles.shader_identifier("RayGenMain").unwrap(),
            procedural.shader_identifier("RayGenMain").unwrap()
        );
    }

    #[test]
    fn test_unregistered_export() {
        let pipeline = HostRayTracingPipeline::new(32, 1, vec![], 0);
        assert!(pipeline.shader_identifier("RayGenMain").is_ok());
        assert!(matches!(pipeline.shader_identifier("MissMain1"), Err(GfxError::ShaderIdentifierNotFound(_))));
        assert!(pipeline.shader_identifier("HitGroup0").is_err());
        assert!(pipeline.shader_identifier("Whatever").is_err());
    }
}
