use std::ffi::CStr;
use std::path::Path;

use ash::vk;
use itertools::Itertools;

use crate::device::GfxDevice;
use crate::error::{GfxError, GfxResult};
use crate::raytracing::pipeline::{
    GfxRayTracingPipeline, HitGroupKind, HitGroupStage, RayTracingPipelineDesc, ShaderCategory, export_name,
    hit_group_stage_name, parse_export_name,
};
use crate::vulkan::device::VulkanDevice;

const ENTRY_POINT: &CStr = c"main";

/// 每个 shader group 的 identifier
///
/// 下标与 pipeline create info 中 group 的顺序一致：raygen, miss..., hit group..., callable...
pub struct ShaderGroupHandles {
    miss_count: usize,
    hit_group_count: usize,
    callable_count: usize,
    handles: Vec<Vec<u8>>,
}

impl ShaderGroupHandles {
    /// `data` 是 `vkGetRayTracingShaderGroupHandlesKHR` 取回的全部 group 的 handle
    pub fn from_bytes(
        data: &[u8],
        handle_size: usize,
        miss_count: usize,
        hit_group_count: usize,
        callable_count: usize,
    ) -> GfxResult<Self> {
        let group_count = 1 + miss_count + hit_group_count + callable_count;
        if handle_size == 0 || data.len() != group_count * handle_size {
            return Err(GfxError::InvalidArgument(format!(
                "expected {group_count} group handles of {handle_size} bytes, got {} bytes",
                data.len()
            )));
        }

        Ok(Self {
            miss_count,
            hit_group_count,
            callable_count,
            handles: data.chunks_exact(handle_size).map(<[u8]>::to_vec).collect_vec(),
        })
    }

    /// `(category, index)` 对应的 group 下标
    pub fn group_index(&self, category: ShaderCategory, index: usize) -> Option<usize> {
        match category {
            ShaderCategory::RayGen => (index == 0).then_some(0),
            ShaderCategory::Miss => (index < self.miss_count).then_some(1 + index),
            ShaderCategory::HitGroup => (index < self.hit_group_count).then_some(1 + self.miss_count + index),
            ShaderCategory::Callable => {
                (index < self.callable_count).then_some(1 + self.miss_count + self.hit_group_count + index)
            }
        }
    }

    pub fn identifier(&self, export_name: &str) -> GfxResult<Vec<u8>> {
        parse_export_name(export_name)
            .and_then(|(category, index)| self.group_index(category, index))
            .and_then(|group| self.handles.get(group).cloned())
            .ok_or_else(|| GfxError::ShaderIdentifierNotFound(export_name.to_string()))
    }
}

/// 创建管线期间持有的 shader module，离开作用域时销毁
struct ShaderModules<'a> {
    device: &'a ash::Device,
    modules: Vec<vk::ShaderModule>,
}

impl ShaderModules<'_> {
    fn load(&mut self, dir: &Path, entry_name: &str) -> Result<vk::ShaderModule, (String, String)> {
        let path = dir.join(format!("{entry_name}.spv"));
        let code = std::fs::File::open(&path)
            .and_then(|mut file| ash::util::read_spv(&mut file))
            .map_err(|e| (format!("failed to read {}", path.display()), e.to_string()))?;

        let module_ci = vk::ShaderModuleCreateInfo::default().code(&code);
        let module = unsafe { self.device.create_shader_module(&module_ci, None) }
            .map_err(|e| (format!("failed to create module from {}", path.display()), e.to_string()))?;
        self.modules.push(module);
        Ok(module)
    }
}

impl Drop for ShaderModules<'_> {
    fn drop(&mut self) {
        for module in self.modules.drain(..) {
            unsafe { self.device.destroy_shader_module(module, None) };
        }
    }
}

/// 所有成员都未使用的 group
fn unused_group(ty: vk::RayTracingShaderGroupTypeKHR) -> vk::RayTracingShaderGroupCreateInfoKHR<'static> {
    vk::RayTracingShaderGroupCreateInfoKHR::default()
        .ty(ty)
        .general_shader(vk::SHADER_UNUSED_KHR)
        .closest_hit_shader(vk::SHADER_UNUSED_KHR)
        .any_hit_shader(vk::SHADER_UNUSED_KHR)
        .intersection_shader(vk::SHADER_UNUSED_KHR)
}

/// 按导出名从 `shader_dir` 读取 SPIR-V 创建的光追管线
///
/// 管线布局为空，资源绑定不在这一层处理。必须在 [`VulkanDevice`] 之前释放。
pub struct VulkanRayTracingPipeline {
    device: ash::Device,
    pipeline: vk::Pipeline,
    layout: vk::PipelineLayout,
    groups: ShaderGroupHandles,
    name: String,
}

impl VulkanRayTracingPipeline {
    pub fn new(device: &VulkanDevice, desc: &RayTracingPipelineDesc) -> GfxResult<Self> {
        let creation_error = |reason: String, diagnostic: Option<String>| GfxError::PipelineCreation {
            name: desc.name.clone(),
            reason,
            diagnostic,
        };
        let shader_dir = desc
            .shader_dir
            .as_deref()
            .ok_or_else(|| creation_error("no shader_dir to load SPIR-V from".to_string(), None))?;

        let vk_device = device.vk_device();
        let mut modules = ShaderModules {
            device: vk_device,
            modules: Vec::new(),
        };
        let mut stages = Vec::new();
        let mut groups = Vec::new();
        {
            let mut push_stage = |flags: vk::ShaderStageFlags, entry_name: String| -> GfxResult<u32> {
                let module =
                    modules.load(shader_dir, &entry_name).map_err(|(reason, e)| creation_error(reason, Some(e)))?;
                stages.push(vk::PipelineShaderStageCreateInfo::default().stage(flags).module(module).name(ENTRY_POINT));
                Ok(stages.len() as u32 - 1)
            };

            let raygen = push_stage(vk::ShaderStageFlags::RAYGEN_KHR, export_name(ShaderCategory::RayGen, 0))?;
            groups.push(unused_group(vk::RayTracingShaderGroupTypeKHR::GENERAL).general_shader(raygen));

            for idx in 0..desc.miss_count {
                let miss = push_stage(vk::ShaderStageFlags::MISS_KHR, export_name(ShaderCategory::Miss, idx))?;
                groups.push(unused_group(vk::RayTracingShaderGroupTypeKHR::GENERAL).general_shader(miss));
            }

            for (idx, kind) in desc.hit_groups.iter().enumerate() {
                let ty = match kind {
                    HitGroupKind::Triangles => vk::RayTracingShaderGroupTypeKHR::TRIANGLES_HIT_GROUP,
                    HitGroupKind::Procedural => vk::RayTracingShaderGroupTypeKHR::PROCEDURAL_HIT_GROUP,
                };
                let mut group = unused_group(ty);
                for stage in kind.stages() {
                    let name = hit_group_stage_name(*stage, idx);
                    group = match stage {
                        HitGroupStage::ClosestHit => {
                            group.closest_hit_shader(push_stage(vk::ShaderStageFlags::CLOSEST_HIT_KHR, name)?)
                        }
                        HitGroupStage::AnyHit => {
                            group.any_hit_shader(push_stage(vk::ShaderStageFlags::ANY_HIT_KHR, name)?)
                        }
                        HitGroupStage::Intersection => {
                            group.intersection_shader(push_stage(vk::ShaderStageFlags::INTERSECTION_KHR, name)?)
                        }
                    };
                }
                groups.push(group);
            }

            for idx in 0..desc.callable_count {
                let callable =
                    push_stage(vk::ShaderStageFlags::CALLABLE_KHR, export_name(ShaderCategory::Callable, idx))?;
                groups.push(unused_group(vk::RayTracingShaderGroupTypeKHR::GENERAL).general_shader(callable));
            }
        }

        let layout = unsafe { vk_device.create_pipeline_layout(&vk::PipelineLayoutCreateInfo::default(), None) }
            .map_err(|e| creation_error("failed to create pipeline layout".to_string(), Some(e.to_string())))?;

        let pipeline_ci = vk::RayTracingPipelineCreateInfoKHR::default()
            .stages(&stages)
            .groups(&groups)
            .layout(layout)
            .max_pipeline_ray_recursion_depth(1);
        let pipeline = match unsafe {
            device.ray_tracing_pipeline_fns().create_ray_tracing_pipelines(
                vk::DeferredOperationKHR::null(),
                vk::PipelineCache::null(),
                std::slice::from_ref(&pipeline_ci),
                None,
            )
        } {
            Ok(pipelines) => pipelines[0],
            Err((_, e)) => {
                unsafe { vk_device.destroy_pipeline_layout(layout, None) };
                return Err(creation_error("vkCreateRayTracingPipelinesKHR failed".to_string(), Some(e.to_string())));
            }
        };
        // 管线创建之后 shader module 就不再需要了
        drop(modules);

        let handle_size = device.shader_table_limits().identifier_size as usize;
        let group_handles = unsafe {
            device.ray_tracing_pipeline_fns().get_ray_tracing_shader_group_handles(
                pipeline,
                0,
                groups.len() as u32,
                groups.len() * handle_size,
            )
        }
        .map_err(GfxError::from)
        .and_then(|data| {
            ShaderGroupHandles::from_bytes(
                &data,
                handle_size,
                desc.miss_count,
                desc.hit_groups.len(),
                desc.callable_count,
            )
        });
        let group_handles = match group_handles {
            Ok(group_handles) => group_handles,
            Err(e) => {
                unsafe {
                    vk_device.destroy_pipeline(pipeline, None);
                    vk_device.destroy_pipeline_layout(layout, None);
                }
                return Err(creation_error("failed to fetch shader group handles".to_string(), Some(e.to_string())));
            }
        };

        log::info!("vulkan: create pipeline `{}` with {} shader groups", desc.name, groups.len());
        Ok(Self {
            device: vk_device.clone(),
            pipeline,
            layout,
            groups: group_handles,
            name: desc.name.clone(),
        })
    }

    #[inline]
    pub fn vk_pipeline(&self) -> vk::Pipeline {
        self.pipeline
    }

    #[inline]
    pub fn vk_pipeline_layout(&self) -> vk::PipelineLayout {
        self.layout
    }
}

impl Drop for VulkanRayTracingPipeline {
    fn drop(&mut self) {
        log::debug!("vulkan: destroy pipeline `{}`", self.name);
        unsafe {
            self.device.destroy_pipeline(self.pipeline, None);
            self.device.destroy_pipeline_layout(self.layout, None);
        }
    }
}

impl GfxRayTracingPipeline for VulkanRayTracingPipeline {
    fn miss_shader_count(&self) -> usize {
        self.groups.miss_count
    }

    fn hit_group_count(&self) -> usize {
        self.groups.hit_group_count
    }

    fn callable_shader_count(&self) -> usize {
        self.groups.callable_count
    }

    fn shader_identifier(&self, export_name: &str) -> GfxResult<Vec<u8>> {
        self.groups.identifier(export_name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BackendKind, GfxConfig};

    /// group `g` 的 handle 每个字节都是 `g`
    fn fake_handles(group_count: usize, handle_size: usize) -> Vec<u8> {
        (0..group_count).flat_map(|group| std::iter::repeat_n(group as u8, handle_size)).collect()
    }

    #[test]
    fn test_group_order() {
        let groups = ShaderGroupHandles::from_bytes(&fake_handles(6, 8), 8, 2, 2, 1).unwrap();

        let expected = [
            ("RayGenMain", 0u8),
            ("MissMain0", 1),
            ("MissMain1", 2),
            ("HitGroup0", 3),
            ("HitGroup1", 4),
            ("CallableMain0", 5),
        ];
        for (name, group) in expected {
            assert_eq!(groups.identifier(name).unwrap(), vec![group; 8], "{name}");
        }
        assert_eq!(groups.group_index(ShaderCategory::Callable, 0), Some(5));
    }

    #[test]
    fn test_unregistered_group() {
        let groups = ShaderGroupHandles::from_bytes(&fake_handles(3, 4), 4, 1, 1, 0).unwrap();
        assert!(matches!(groups.identifier("MissMain1"), Err(GfxError::ShaderIdentifierNotFound(_))));
        assert!(groups.identifier("CallableMain0").is_err());
        assert_eq!(groups.group_index(ShaderCategory::RayGen, 1), None);
    }

    #[test]
    fn test_handle_data_size_mismatch() {
        assert!(ShaderGroupHandles::from_bytes(&fake_handles(3, 4), 4, 2, 1, 0).is_err());
        assert!(ShaderGroupHandles::from_bytes(&[], 0, 0, 0, 0).is_err());
    }

    /// 需要 `STRATA_RT_SHADER_DIR` 指向包含 RayGenMain.spv、MissMain{0,1}.spv、
    /// ClosestHitMain{0,1}.spv、AnyHitMain{0,1}.spv、IntersectionMain1.spv、CallableMain0.spv 的目录
    #[test]
    #[ignore = "needs a ray tracing capable GPU and STRATA_RT_SHADER_DIR"]
    fn test_group_order_on_device() {
        let shader_dir = std::env::var_os("STRATA_RT_SHADER_DIR").expect("STRATA_RT_SHADER_DIR is not set");
        let device = VulkanDevice::new(&GfxConfig {
            backend: BackendKind::Vulkan,
            ..Default::default()
        })
        .unwrap();
        let desc = RayTracingPipelineDesc {
            name: "group-order".to_string(),
            miss_count: 2,
            hit_groups: vec![HitGroupKind::Triangles, HitGroupKind::Procedural],
            callable_count: 1,
            shader_dir: Some(shader_dir.into()),
        };
        let pipeline = VulkanRayTracingPipeline::new(&device, &desc).unwrap();

        let handle_size = device.shader_table_limits().identifier_size as usize;
        let fetch_group = |group: u32| unsafe {
            device
                .ray_tracing_pipeline_fns()
                .get_ray_tracing_shader_group_handles(pipeline.vk_pipeline(), group, 1, handle_size)
                .unwrap()
        };
        let expected = [
            ("RayGenMain", 0),
            ("MissMain0", 1),
            ("MissMain1", 2),
            ("HitGroup0", 3),
            ("HitGroup1", 4),
            ("CallableMain0", 5),
        ];
        for (name, group) in expected {
            assert_eq!(pipeline.shader_identifier(name).unwrap(), fetch_group(group), "{name}");
        }
    }
}
