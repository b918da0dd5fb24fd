//! Ray Tracing 所需的加速结构

use std::rc::Rc;

use itertools::Itertools;
use strata_gfx::device::{GfxDevice, GfxDeviceExt};
use strata_gfx::error::{GfxError, GfxResult};
use strata_gfx::raytracing::geometry::{
    AabbGeometry, AccelerationBuildInputs, AccelerationKind, GeometryDesc, GeometryFlags, TRIANGLE_INDEX_STRIDE,
    TriangleGeometry,
};
use strata_gfx::raytracing::instance::{GpuInstanceRecord, INSTANCE_FIELD_MAX, InstanceFlags};
use strata_gfx::resources::buffer_desc::{BufferUsage, GfxBufferDesc, MemoryClass, ResourceState};
use strata_gfx::resources::handles::{GfxAccelerationHandle, GfxBufferHandle};

use crate::buffer::{GpuBuffer, allocation_size};
use crate::render_core::RenderCore;
use crate::transient_pool::TransientPurpose;

/// TLAS 中的一个 instance
///
/// 只是借用 BLAS；TLAS 构建完成之后，调用方仍然需要保证 BLAS 比 TLAS 活得更久
#[derive(Clone, Copy)]
pub struct TlasInstance<'a> {
    pub blas: &'a GfxAcceleration,
    pub transform: glam::Mat4,
    pub mask: u8,
    /// 不能超过 24 位
    pub hit_group_offset: u32,
    pub flags: InstanceFlags,
}

impl<'a> TlasInstance<'a> {
    pub fn new(blas: &'a GfxAcceleration, transform: glam::Mat4) -> Self {
        Self {
            blas,
            transform,
            mask: 0xFF,
            hit_group_offset: 0,
            flags: InstanceFlags::TRIANGLE_CULL_DISABLE,
        }
    }

    #[inline]
    pub fn with_mask(mut self, mask: u8) -> Self {
        self.mask = mask;
        self
    }

    #[inline]
    pub fn with_hit_group_offset(mut self, hit_group_offset: u32) -> Self {
        self.hit_group_offset = hit_group_offset;
        self
    }

    #[inline]
    pub fn with_flags(mut self, flags: InstanceFlags) -> Self {
        self.flags = flags;
        self
    }
}

/// 加速结构以及承载它的 result buffer
///
/// drop 时先销毁加速结构，再销毁 buffer
pub struct GfxAcceleration {
    device: Rc<dyn GfxDevice>,
    handle: GfxAccelerationHandle,
    result_buffer: GfxBufferHandle,

    kind: AccelerationKind,
    /// BLAS 是图元数量，TLAS 是 instance 数量
    primitive_count: u32,
    size: u64,
    name: String,
}

// BLAS
impl GfxAcceleration {
    /// 同步构建 blas
    ///
    /// # 构建过程
    ///
    /// 1. 查询构建 blas 所需的尺寸
    /// 2. 从池中取 scratch buffer，创建 result buffer
    /// 3. 构建 blas，等待完成
    pub fn build_blas_sync(core: &RenderCore, geometry: &GeometryDesc, name: &str) -> GfxResult<Self> {
        if geometry.primitive_count() == 0 {
            log::warn!("blas `{}` has no primitives", name);
        }
        Self::build_sync(core, AccelerationBuildInputs::bottom_level(*geometry), name)
    }

    /// 程序化几何体，aabb 的数量由 buffer 大小推算
    pub fn build_aabb_blas_sync(
        core: &RenderCore,
        aabb_buffer: &dyn GpuBuffer,
        stride: u64,
        flags: GeometryFlags,
        name: &str,
    ) -> GfxResult<Self> {
        let count = count_elements(aabb_buffer.size(), stride, "aabb")?;
        let geometry = GeometryDesc::Aabbs(AabbGeometry {
            buffer: aabb_buffer.buffer(),
            offset: 0,
            stride,
            count,
            flags,
        });
        Self::build_blas_sync(core, &geometry, name)
    }

    /// 三角形几何体，顶点数量和图元数量由 buffer 大小推算
    ///
    /// 顶点是 3 个 f32，index 是 u32；默认不允许重复调用 any hit
    pub fn build_triangle_blas_sync(
        core: &RenderCore,
        vertex_buffer: &dyn GpuBuffer,
        vertex_stride: u64,
        index_buffer: &dyn GpuBuffer,
        name: &str,
    ) -> GfxResult<Self> {
        let geometry = GeometryDesc::Triangles(TriangleGeometry {
            vertex_buffer: vertex_buffer.buffer(),
            vertex_stride,
            vertex_count: count_elements(vertex_buffer.size(), vertex_stride, "vertex")?,
            index_buffer: index_buffer.buffer(),
            primitive_count: count_elements(index_buffer.size(), TRIANGLE_INDEX_STRIDE, "triangle")?,
            flags: GeometryFlags::NO_DUPLICATE_ANYHIT_INVOCATION,
        });
        Self::build_blas_sync(core, &geometry, name)
    }
}

// TLAS
impl GfxAcceleration {
    /// 同步构建 tlas
    ///
    /// instance id 就是 instance 在数组中的下标
    ///
    /// # 构建过程
    ///
    /// 1. 把 instance 数据直接写入池中的 instance buffer（host 可见，不需要 staging）
    /// 2. 查询构建 tlas 所需的尺寸
    /// 3. 构建 tlas，等待完成
    pub fn build_tlas_sync(core: &RenderCore, instances: &[TlasInstance<'_>], name: &str) -> GfxResult<Self> {
        if instances.len() > INSTANCE_FIELD_MAX as usize + 1 {
            return Err(GfxError::InvalidArgument(format!(
                "tlas `{}` has {} instances, instance id only has 24 bits",
                name,
                instances.len()
            )));
        }
        if instances.is_empty() {
            log::warn!("tlas `{}` has no instances", name);
        }

        let records: Vec<GpuInstanceRecord> = instances
            .iter()
            .enumerate()
            .map(|(idx, instance)| {
                if instance.blas.kind != AccelerationKind::BottomLevel {
                    return Err(GfxError::InvalidArgument(format!(
                        "instance {} of `{}` references top level `{}`",
                        idx, name, instance.blas.name
                    )));
                }
                if instance.hit_group_offset > INSTANCE_FIELD_MAX {
                    return Err(GfxError::InvalidArgument(format!(
                        "instance {} of `{}`: hit group offset {} exceeds 24 bits",
                        idx, name, instance.hit_group_offset
                    )));
                }
                Ok(GpuInstanceRecord::new(
                    &instance.transform,
                    idx as u32,
                    instance.mask,
                    instance.hit_group_offset,
                    instance.flags,
                    instance.blas.device_address()?,
                ))
            })
            .collect::<GfxResult<_>>()?;

        let bytes: &[u8] = bytemuck::cast_slice(&records);
        let instance_buffer = core.transient_buffer(TransientPurpose::Instance, bytes.len() as u64)?;
        core.device().write_mapped(instance_buffer, 0, bytes)?;

        Self::build_sync(core, AccelerationBuildInputs::top_level(instance_buffer, records.len() as u32), name)
    }

    /// 所有 instance 使用默认的 mask、hit group offset 以及 flags
    pub fn build_tlas_from_objects(
        core: &RenderCore,
        objects: &[(&GfxAcceleration, glam::Mat4)],
        name: &str,
    ) -> GfxResult<Self> {
        let instances = objects.iter().map(|(blas, transform)| TlasInstance::new(blas, *transform)).collect_vec();
        Self::build_tlas_sync(core, &instances, name)
    }
}

// tools
impl GfxAcceleration {
    /// 每一步失败都会立即返回，已经创建的资源在返回前释放
    fn build_sync(core: &RenderCore, inputs: AccelerationBuildInputs, name: &str) -> GfxResult<Self> {
        let kind = inputs.kind();
        let device = core.device();

        let sizes = device.query_prebuild_sizes(&inputs).inspect_err(|e| {
            if matches!(e, GfxError::Unsupported(_)) {
                log::error!("acceleration structure `{}`: {}", name, e);
            }
        })?;

        let scratch = core.transient_buffer(TransientPurpose::Scratch, sizes.scratch_size)?;

        let result_buffer = device.create_buffer(
            &GfxBufferDesc::new(
                allocation_size(sizes.result_size),
                MemoryClass::DeviceLocal,
                BufferUsage::ACCELERATION_STORAGE | BufferUsage::DEVICE_ADDRESS,
                format!("{name}-buffer"),
            )
            .with_state(ResourceState::AccelerationStructure),
        )?;

        let handle = match device.create_acceleration_structure(kind, result_buffer, sizes.result_size, name) {
            Ok(handle) => handle,
            Err(e) => {
                device.destroy_buffer(result_buffer);
                return Err(e);
            }
        };

        // 从这里开始，失败时由 drop 释放
        let acceleration = Self {
            device: core.device_rc(),
            handle,
            result_buffer,
            kind,
            primitive_count: inputs.primitive_count(),
            size: sizes.result_size,
            name: name.to_string(),
        };

        let cmd_name = match kind {
            AccelerationKind::BottomLevel => "build-blas",
            AccelerationKind::TopLevel => "build-tlas",
        };
        device.one_time_exec(|cmd| cmd.cmd_build_acceleration_structure(&inputs, handle, scratch), cmd_name)?;

        log::info!(
            "{:?} acceleration structure `{}` built: {} primitives, {} bytes, scratch {} bytes",
            kind,
            name,
            acceleration.primitive_count,
            sizes.result_size,
            sizes.scratch_size
        );
        Ok(acceleration)
    }
}

fn count_elements(buffer_size: u64, stride: u64, what: &str) -> GfxResult<u32> {
    if stride == 0 {
        return Err(GfxError::InvalidArgument(format!("{what} stride is 0")));
    }
    u32::try_from(buffer_size / stride)
        .map_err(|_| GfxError::InvalidArgument(format!("too many {what}s: {}", buffer_size / stride)))
}

impl Drop for GfxAcceleration {
    fn drop(&mut self) {
        self.device.destroy_acceleration_structure(self.handle);
        self.device.destroy_buffer(self.result_buffer);
    }
}

// getter
impl GfxAcceleration {
    #[inline]
    pub fn handle(&self) -> GfxAccelerationHandle {
        self.handle
    }

    #[inline]
    pub fn result_buffer(&self) -> GfxBufferHandle {
        self.result_buffer
    }

    #[inline]
    pub fn kind(&self) -> AccelerationKind {
        self.kind
    }

    #[inline]
    pub fn primitive_count(&self) -> u32 {
        self.primitive_count
    }

    /// TLAS 的 instance 数量
    #[inline]
    pub fn instance_count(&self) -> u32 {
        self.primitive_count
    }

    #[inline]
    pub fn size(&self) -> u64 {
        self.size
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn device_address(&self) -> GfxResult<u64> {
        self.device.acceleration_structure_address(self.handle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_gfx::error::FailedStep;
    use strata_gfx::host::device::{FailPoint, HostDevice};
    use strata_gfx::raytracing::geometry::AABB_SIZE;

    fn make_core() -> (Rc<HostDevice>, Rc<RenderCore>) {
        let device = Rc::new(HostDevice::with_frames_in_flight(2));
        (device.clone(), RenderCore::new(device))
    }

    fn unit_box() -> Vec<u8> {
        bytemuck::cast_slice(&[-1.0f32, -1.0, -1.0, 1.0, 1.0, 1.0]).to_vec()
    }

    fn aabb_blas(core: &Rc<RenderCore>, count: usize) -> GfxAcceleration {
        let mut buffer = core.create_static_buffer(AABB_SIZE * count as u64, "aabbs").unwrap();
        let data = unit_box().repeat(count);
        buffer.upload_data(&data, 0).unwrap();
        GfxAcceleration::build_aabb_blas_sync(core, buffer.as_ref(), AABB_SIZE, GeometryFlags::OPAQUE, "blas")
            .unwrap()
    }

    #[test]
    fn test_aabb_blas() {
        let (device, core) = make_core();
        let blas = aabb_blas(&core, 3);

        assert_eq!(blas.kind(), AccelerationKind::BottomLevel);
        assert_eq!(blas.primitive_count(), 3);
        let info = device.acceleration_info(blas.handle()).unwrap();
        assert_eq!(info.primitive_count, Some(3));
        assert_eq!(info.result_buffer, blas.result_buffer());
        // result buffer 的大小正好是 prebuild 查询的结果
        assert_eq!(device.buffer_desc(blas.result_buffer()).unwrap().size, blas.size());
    }

    #[test]
    fn test_triangle_blas_derives_counts() {
        let (device, core) = make_core();
        let vertices: [f32; 9] = [0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 1.0, 0.0];
        let indices: [u32; 3] = [0, 1, 2];

        let mut vertex_buffer = core.create_static_buffer(36, "vertices").unwrap();
        vertex_buffer.upload_data(bytemuck::cast_slice(&vertices), 0).unwrap();
        let mut index_buffer = core.create_static_buffer(12, "indices").unwrap();
        index_buffer.upload_data(bytemuck::cast_slice(&indices), 0).unwrap();

        let blas = GfxAcceleration::build_triangle_blas_sync(
            &core,
            vertex_buffer.as_ref(),
            12,
            index_buffer.as_ref(),
            "triangle",
        )
        .unwrap();
        assert_eq!(blas.primitive_count(), 1);

        match device.last_submission().as_slice() {
            [strata_gfx::commands::command::GfxCommand::BuildAcceleration { inputs, .. }] => match inputs.payload {
                strata_gfx::raytracing::geometry::AccelerationBuildPayload::BottomLevel(GeometryDesc::Triangles(t)) => {
                    assert_eq!(t.vertex_count, 3);
                    assert_eq!(t.index_count(), 3);
                    assert_eq!(t.flags, GeometryFlags::NO_DUPLICATE_ANYHIT_INVOCATION);
                }
                other => panic!("unexpected payload {other:?}"),
            },
            other => panic!("unexpected submission {other:?}"),
        }
    }

    #[test]
    fn test_empty_blas_is_not_a_crash() {
        let (_device, core) = make_core();
        let buffer = core.create_static_buffer(0, "empty").unwrap();
        match GfxAcceleration::build_aabb_blas_sync(&core, buffer.as_ref(), AABB_SIZE, GeometryFlags::empty(), "empty")
        {
            Ok(blas) => assert_eq!(blas.primitive_count(), 0),
            Err(e) => assert!(matches!(e.step(), FailedStep::Query | FailedStep::Allocation)),
        }
    }

    #[test]
    fn test_tlas_ids_are_positions() {
        let (device, core) = make_core();
        let blas_a = aabb_blas(&core, 1);
        let blas_b = aabb_blas(&core, 2);

        let shift = glam::Mat4::from_translation(glam::vec3(1.0, 2.0, 3.0));
        let instances = [
            TlasInstance::new(&blas_a, glam::Mat4::IDENTITY),
            TlasInstance::new(&blas_b, shift).with_mask(0x0F).with_hit_group_offset(2),
            TlasInstance::new(&blas_a, shift).with_flags(InstanceFlags::FORCE_OPAQUE),
        ];
        let tlas = GfxAcceleration::build_tlas_sync(&core, &instances, "tlas").unwrap();

        assert_eq!(tlas.kind(), AccelerationKind::TopLevel);
        assert_eq!(tlas.instance_count(), 3);

        let info = device.acceleration_info(tlas.handle()).unwrap();
        assert_eq!(info.instances.len(), 3);
        for (idx, record) in info.instances.iter().enumerate() {
            assert_eq!(record.instance_id(), idx as u32);
        }
        assert_eq!(info.instances[0].mask(), 0xFF);
        assert_eq!(info.instances[1].mask(), 0x0F);
        assert_eq!(info.instances[1].hit_group_offset(), 2);
        assert_eq!(info.instances[1].acceleration_structure, blas_b.device_address().unwrap());
        assert_eq!(info.instances[1].transform[3], 1.0);
        assert_eq!(info.instances[1].transform[7], 2.0);
        assert_eq!(info.instances[1].transform[11], 3.0);
        assert_eq!(info.instances[2].flags(), InstanceFlags::FORCE_OPAQUE);
    }

    #[test]
    fn test_empty_tlas() {
        let (_device, core) = make_core();
        let tlas = GfxAcceleration::build_tlas_sync(&core, &[], "empty-tlas").unwrap();
        assert_eq!(tlas.instance_count(), 0);
    }

    #[test]
    fn test_tlas_from_objects() {
        let (_device, core) = make_core();
        let blas = aabb_blas(&core, 1);
        let tlas = GfxAcceleration::build_tlas_from_objects(
            &core,
            &[(&blas, glam::Mat4::IDENTITY), (&blas, glam::Mat4::from_scale(glam::Vec3::splat(2.0)))],
            "tlas",
        )
        .unwrap();
        assert_eq!(tlas.instance_count(), 2);
    }

    #[test]
    fn test_tlas_rejects_tlas_instance() {
        let (_device, core) = make_core();
        let blas = aabb_blas(&core, 1);
        let inner = GfxAcceleration::build_tlas_from_objects(&core, &[(&blas, glam::Mat4::IDENTITY)], "inner").unwrap();
        let err = GfxAcceleration::build_tlas_from_objects(&core, &[(&inner, glam::Mat4::IDENTITY)], "outer")
            .err()
            .unwrap();
        assert!(matches!(err, GfxError::InvalidArgument(_)));
    }

    #[test]
    fn test_tlas_rejects_wide_hit_group_offset() {
        let (_device, core) = make_core();
        let blas = aabb_blas(&core, 1);
        let instance = TlasInstance::new(&blas, glam::Mat4::IDENTITY).with_hit_group_offset(1 << 24);
        assert!(matches!(
            GfxAcceleration::build_tlas_sync(&core, &[instance], "tlas"),
            Err(GfxError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_failures_report_step_and_release() {
        let (device, core) = make_core();
        let blas = aabb_blas(&core, 2);
        let buffers = device.live_buffer_count();
        let accels = device.live_acceleration_count();

        for (point, step) in [
            (FailPoint::PrebuildQuery, FailedStep::Query),
            (FailPoint::CreateBuffer, FailedStep::Allocation),
            (FailPoint::CreateAcceleration, FailedStep::Allocation),
            (FailPoint::Submit, FailedStep::Submission),
        ] {
            device.inject_failure(point);
            let err = GfxAcceleration::build_tlas_from_objects(&core, &[(&blas, glam::Mat4::IDENTITY)], "tlas")
                .err()
                .unwrap();
            assert_eq!(err.step(), step, "{point:?}");
            assert_eq!(device.live_acceleration_count(), accels, "{point:?}");
        }

        // 只可能多出池中的 scratch 与 instance buffer
        assert!(device.live_buffer_count() <= buffers + 2);
        let stats = device.stats();
        assert_eq!(stats.accelerations_created - stats.accelerations_destroyed, accels as u64);
    }

    #[test]
    fn test_scratch_is_reused() {
        let (_device, core) = make_core();
        let _big = aabb_blas(&core, 64);
        let grow_count = core.transient_grow_count();
        let _small = aabb_blas(&core, 4);
        assert_eq!(core.transient_grow_count(), grow_count);
        assert!(core.transient_capacity(TransientPurpose::Scratch) >= 128 + 64 * 32);
    }

    #[test]
    fn test_drop_releases() {
        let (device, core) = make_core();
        let blas = aabb_blas(&core, 1);
        let before = device.stats();
        drop(blas);
        let after = device.stats();
        assert_eq!(after.accelerations_destroyed, before.accelerations_destroyed + 1);
        assert_eq!(after.buffers_destroyed, before.buffers_destroyed + 1);
    }
}
