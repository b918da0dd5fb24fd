//! shader binding table 的布局与填充
//!
//! 四个区域按固定顺序排列：ray gen（1 条 record）、miss、hit group、callable。
//! 每条 record 只有 shader identifier，没有 user data。

use std::rc::Rc;

use itertools::Itertools;
use strata_gfx::device::GfxDevice;
use strata_gfx::error::{GfxError, GfxResult};
use strata_gfx::raytracing::pipeline::{GfxRayTracingPipeline, ShaderCategory, ShaderTableLimits, export_name};
use strata_gfx::resources::buffer_desc::{BufferUsage, GfxBufferDesc, MemoryClass};
use strata_gfx::resources::handles::GfxBufferHandle;

use crate::render_core::RenderCore;

/// 把 x 向上取整到 align 的倍数
///
/// * align 必须是 2 的幂
#[inline]
pub fn align_up(x: u64, align: u64) -> u64 {
    debug_assert!(align.is_power_of_two());
    (x + (align - 1)) & !(align - 1)
}

/// 各区域的偏移与 record 数量，单位都是字节
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShaderTableLayout {
    /// 每条 record 的跨度
    pub stride: u64,
    pub raygen_offset: u64,
    pub miss_offset: u64,
    pub hit_group_offset: u64,
    pub callable_offset: u64,
    pub miss_count: usize,
    pub hit_group_count: usize,
    pub callable_count: usize,
    pub total_size: u64,
}

impl ShaderTableLayout {
    pub fn compute(limits: &ShaderTableLimits, miss_count: usize, hit_group_count: usize, callable_count: usize) -> Self {
        let table_alignment = limits.table_alignment as u64;
        let stride = align_up(limits.identifier_size as u64, limits.record_alignment as u64);

        // 空的区域长度为 0，但仍然会让后面的区域对齐
        let raygen_offset = 0;
        let miss_offset = align_up(raygen_offset + stride, table_alignment);
        let hit_group_offset = align_up(miss_offset + miss_count as u64 * stride, table_alignment);
        let callable_offset = align_up(hit_group_offset + hit_group_count as u64 * stride, table_alignment);
        let total_size = align_up(callable_offset + callable_count as u64 * stride, table_alignment);

        Self {
            stride,
            raygen_offset,
            miss_offset,
            hit_group_offset,
            callable_offset,
            miss_count,
            hit_group_count,
            callable_count,
            total_size,
        }
    }

    pub fn region_offset(&self, category: ShaderCategory) -> u64 {
        match category {
            ShaderCategory::RayGen => self.raygen_offset,
            ShaderCategory::Miss => self.miss_offset,
            ShaderCategory::HitGroup => self.hit_group_offset,
            ShaderCategory::Callable => self.callable_offset,
        }
    }

    pub fn region_count(&self, category: ShaderCategory) -> usize {
        match category {
            ShaderCategory::RayGen => 1,
            ShaderCategory::Miss => self.miss_count,
            ShaderCategory::HitGroup => self.hit_group_count,
            ShaderCategory::Callable => self.callable_count,
        }
    }

    /// 区域的字节数，包含对齐产生的空隙
    pub fn region_size(&self, category: ShaderCategory) -> u64 {
        let end = match category {
            ShaderCategory::RayGen => self.miss_offset,
            ShaderCategory::Miss => self.hit_group_offset,
            ShaderCategory::HitGroup => self.callable_offset,
            ShaderCategory::Callable => self.total_size,
        };
        end - self.region_offset(category)
    }
}

/// trace rays 时需要的一个区域
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ShaderTableRegion {
    pub address: u64,
    pub stride: u64,
    pub size: u64,
}

/// 已经填充好的 shader table，buffer 是 host 可见的
pub struct GfxShaderTable {
    device: Rc<dyn GfxDevice>,
    buffer: GfxBufferHandle,
    layout: ShaderTableLayout,
    name: String,
}

// init & destroy
impl GfxShaderTable {
    /// 三个下标列表决定了各区域中 record 的顺序，下标是管线创建时注册的序号
    pub fn new(
        core: &RenderCore,
        pipeline: &dyn GfxRayTracingPipeline,
        miss_indices: &[usize],
        hit_group_indices: &[usize],
        callable_indices: &[usize],
        name: &str,
    ) -> GfxResult<Self> {
        let limits = core.device().shader_table_limits();
        let layout =
            ShaderTableLayout::compute(&limits, miss_indices.len(), hit_group_indices.len(), callable_indices.len());

        // 先在 host 上组装，出错时不需要释放任何资源
        let mut data = vec![0u8; layout.total_size as usize];
        let records = std::iter::once((ShaderCategory::RayGen, 0))
            .chain(miss_indices.iter().map(|idx| (ShaderCategory::Miss, *idx)))
            .chain(hit_group_indices.iter().map(|idx| (ShaderCategory::HitGroup, *idx)))
            .chain(callable_indices.iter().map(|idx| (ShaderCategory::Callable, *idx)))
            .collect_vec();

        let mut slot_in_region = 0;
        let mut last_category = ShaderCategory::RayGen;
        for (category, index) in records {
            if category != last_category {
                last_category = category;
                slot_in_region = 0;
            }

            let identifier = pipeline.shader_identifier(&export_name(category, index))?;
            if identifier.len() != limits.identifier_size as usize {
                return Err(GfxError::InvalidArgument(format!(
                    "identifier of `{}` has {} bytes, device expects {}",
                    export_name(category, index),
                    identifier.len(),
                    limits.identifier_size
                )));
            }

            let offset = (layout.region_offset(category) + slot_in_region * layout.stride) as usize;
            data[offset..offset + identifier.len()].copy_from_slice(&identifier);
            slot_in_region += 1;
        }

        let buffer = core.device().create_buffer(&GfxBufferDesc::new(
            layout.total_size,
            MemoryClass::Upload,
            BufferUsage::SHADER_BINDING_TABLE | BufferUsage::DEVICE_ADDRESS | BufferUsage::TRANSFER_SRC,
            format!("{name}-sbt"),
        ))?;
        if let Err(e) = core.device().write_mapped(buffer, 0, &data) {
            core.device().destroy_buffer(buffer);
            return Err(e);
        }

        log::info!(
            "shader table `{}`: {} miss, {} hit group, {} callable, stride {}, {} bytes",
            name,
            layout.miss_count,
            layout.hit_group_count,
            layout.callable_count,
            layout.stride,
            layout.total_size
        );
        Ok(Self {
            device: core.device_rc(),
            buffer,
            layout,
            name: name.to_string(),
        })
    }

    /// 使用管线中注册的所有 miss、hit group 以及 callable，按注册顺序排列
    pub fn new_with_all(core: &RenderCore, pipeline: &dyn GfxRayTracingPipeline, name: &str) -> GfxResult<Self> {
        let miss = (0..pipeline.miss_shader_count()).collect_vec();
        let hit = (0..pipeline.hit_group_count()).collect_vec();
        let callable = (0..pipeline.callable_shader_count()).collect_vec();
        Self::new(core, pipeline, &miss, &hit, &callable, name)
    }
}

impl Drop for GfxShaderTable {
    fn drop(&mut self) {
        self.device.destroy_buffer(self.buffer);
    }
}

// getter
impl GfxShaderTable {
    #[inline]
    pub fn buffer(&self) -> GfxBufferHandle {
        self.buffer
    }

    #[inline]
    pub fn layout(&self) -> &ShaderTableLayout {
        &self.layout
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn raygen_offset(&self) -> u64 {
        self.layout.raygen_offset
    }

    #[inline]
    pub fn miss_offset(&self) -> u64 {
        self.layout.miss_offset
    }

    #[inline]
    pub fn hit_group_offset(&self) -> u64 {
        self.layout.hit_group_offset
    }

    #[inline]
    pub fn callable_offset(&self) -> u64 {
        self.layout.callable_offset
    }

    #[inline]
    pub fn miss_count(&self) -> usize {
        self.layout.miss_count
    }

    #[inline]
    pub fn hit_group_count(&self) -> usize {
        self.layout.hit_group_count
    }

    #[inline]
    pub fn callable_count(&self) -> usize {
        self.layout.callable_count
    }

    /// ray gen 区域的 stride 需要和 size 一样
    pub fn region(&self, category: ShaderCategory) -> GfxResult<ShaderTableRegion> {
        let base = self.device.buffer_device_address(self.buffer)?;
        let size = self.layout.region_size(category);
        let stride = match category {
            ShaderCategory::RayGen => size,
            _ => self.layout.stride,
        };
        Ok(ShaderTableRegion {
            address: base + self.layout.region_offset(category),
            stride,
            size,
        })
    }
}
