use std::cell::{Cell, RefCell};

use itertools::Itertools;
use slotmap::SlotMap;

use crate::commands::command::{BufferCopyRegion, GfxCommand};
use crate::commands::recorder::GfxCommandRecorder;
use crate::config::GfxConfig;
use crate::device::{ExternalHandleKind, ExternalMemoryHandle, GfxDevice, check_range};
use crate::error::{GfxError, GfxResult};
use crate::host::pipeline::HostRayTracingPipeline;
use crate::raytracing::geometry::{
    AABB_SIZE, AccelerationBuildInputs, AccelerationBuildPayload, AccelerationKind, GeometryDesc, PrebuildSizes,
    TRIANGLE_INDEX_STRIDE, TRIANGLE_VERTEX_SIZE,
};
use crate::raytracing::instance::GpuInstanceRecord;
use crate::raytracing::pipeline::{GfxRayTracingPipeline, RayTracingPipelineDesc, ShaderTableLimits};
use crate::resources::buffer_desc::{BufferUsage, GfxBufferDesc, MemoryClass, ResourceState};
use crate::resources::handles::{GfxAccelerationHandle, GfxBufferHandle};

/// 模拟的加速结构布局参数
const HOST_AS_HEADER_SIZE: u64 = 256;
const HOST_AS_ALIGNMENT: u64 = 256;
const HOST_ADDRESS_BASE: u64 = 0x1_0000;

/// 可以注入失败的位置，每次注入只生效一次
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailPoint {
    CreateBuffer,
    PrebuildQuery,
    CreateAcceleration,
    Submit,
    ExportMemory,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HostDeviceStats {
    pub buffers_created: u64,
    pub buffers_destroyed: u64,
    pub live_bytes: u64,
    pub accelerations_created: u64,
    pub accelerations_destroyed: u64,
    pub submissions: u64,
    pub wait_idle_calls: u64,
}

/// 已经构建好的加速结构的内容
#[derive(Debug, Clone, PartialEq)]
pub struct HostAccelerationInfo {
    pub kind: AccelerationKind,
    pub size: u64,
    pub result_buffer: GfxBufferHandle,
    /// 还没有构建时为 None
    pub primitive_count: Option<u32>,
    pub instances: Vec<GpuInstanceRecord>,
}

struct HostBuffer {
    desc: GfxBufferDesc,
    data: Vec<u8>,
    address: u64,
    state: ResourceState,
}

struct HostAcceleration {
    kind: AccelerationKind,
    result_buffer: GfxBufferHandle,
    size: u64,
    address: u64,
    name: String,
    built: Option<(u32, Vec<GpuInstanceRecord>)>,
}

/// 提交前被命令触及的状态，提交失败时整体回滚
struct SubmissionSnapshot {
    /// (buffer, state, 作为拷贝目标时的内容)
    buffers: Vec<(GfxBufferHandle, ResourceState, Option<Vec<u8>>)>,
    accelerations: Vec<(GfxAccelerationHandle, Option<(u32, Vec<GpuInstanceRecord>)>)>,
}

pub struct HostDevice {
    name: String,
    frames_in_flight: usize,
    frame_index: Cell<usize>,
    limits: ShaderTableLimits,
    memory_budget: Option<u64>,

    buffers: RefCell<SlotMap<GfxBufferHandle, HostBuffer>>,
    accelerations: RefCell<SlotMap<GfxAccelerationHandle, HostAcceleration>>,

    next_address: Cell<u64>,
    stats: Cell<HostDeviceStats>,
    fail_points: RefCell<Vec<FailPoint>>,
    last_submission: RefCell<Vec<GfxCommand>>,
}

// new & init
impl HostDevice {
    pub fn new(config: &GfxConfig) -> Self {
        log::info!(
            "host device `{}`: {} frames in flight, limits {:?}",
            config.app_name,
            config.frames_in_flight,
            config.host.shader_table_limits()
        );
        Self {
            name: format!("{}-host", config.app_name),
            frames_in_flight: config.frames_in_flight.max(1),
            frame_index: Cell::new(0),
            limits: config.host.shader_table_limits(),
            memory_budget: config.host.memory_budget,
            buffers: RefCell::new(SlotMap::with_key()),
            accelerations: RefCell::new(SlotMap::with_key()),
            next_address: Cell::new(HOST_ADDRESS_BASE),
            stats: Cell::new(HostDeviceStats::default()),
            fail_points: RefCell::new(Vec::new()),
            last_submission: RefCell::new(Vec::new()),
        }
    }

    pub fn with_frames_in_flight(frames_in_flight: usize) -> Self {
        Self::new(&GfxConfig {
            frames_in_flight,
            ..Default::default()
        })
    }
}

// inspection
impl HostDevice {
    /// 下一次经过 `point` 时返回错误
    pub fn inject_failure(&self, point: FailPoint) {
        self.fail_points.borrow_mut().push(point);
    }

    #[inline]
    pub fn stats(&self) -> HostDeviceStats {
        self.stats.get()
    }

    #[inline]
    pub fn live_buffer_count(&self) -> usize {
        self.buffers.borrow().len()
    }

    #[inline]
    pub fn live_acceleration_count(&self) -> usize {
        self.accelerations.borrow().len()
    }

    /// 绕过 map 的限制直接读取内容，只用于检查
    pub fn read_device_memory(&self, buffer: GfxBufferHandle) -> Option<Vec<u8>> {
        self.buffers.borrow().get(buffer).map(|b| b.data.clone())
    }

    pub fn buffer_desc(&self, buffer: GfxBufferHandle) -> Option<GfxBufferDesc> {
        self.buffers.borrow().get(buffer).map(|b| b.desc.clone())
    }

    pub fn buffer_state(&self, buffer: GfxBufferHandle) -> Option<ResourceState> {
        self.buffers.borrow().get(buffer).map(|b| b.state)
    }

    pub fn acceleration_info(&self, acceleration: GfxAccelerationHandle) -> Option<HostAccelerationInfo> {
        self.accelerations.borrow().get(acceleration).map(|accel| HostAccelerationInfo {
            kind: accel.kind,
            size: accel.size,
            result_buffer: accel.result_buffer,
            primitive_count: accel.built.as_ref().map(|(count, _)| *count),
            instances: accel.built.as_ref().map(|(_, instances)| instances.clone()).unwrap_or_default(),
        })
    }

    /// 最近一次提交的命令
    pub fn last_submission(&self) -> Vec<GfxCommand> {
        self.last_submission.borrow().clone()
    }
}

// tools
impl HostDevice {
    fn take_failure(&self, point: FailPoint) -> bool {
        let mut fail_points = self.fail_points.borrow_mut();
        match fail_points.iter().position(|p| *p == point) {
            Some(idx) => {
                fail_points.remove(idx);
                true
            }
            None => false,
        }
    }

    fn update_stats(&self, f: impl FnOnce(&mut HostDeviceStats)) {
        let mut stats = self.stats.get();
        f(&mut stats);
        self.stats.set(stats);
    }

    fn alloc_address(&self, size: u64) -> u64 {
        let address = self.next_address.get();
        self.next_address.set(address + size.next_multiple_of(HOST_AS_ALIGNMENT) + HOST_AS_ALIGNMENT);
        address
    }

    fn buffer_len(&self, buffer: GfxBufferHandle) -> GfxResult<u64> {
        self.buffers.borrow().get(buffer).map(|b| b.desc.size).ok_or(GfxError::InvalidHandle)
    }

    fn compute_prebuild_sizes(&self, inputs: &AccelerationBuildInputs) -> GfxResult<PrebuildSizes> {
        let (count, node_size, scratch_per_node) = match inputs.payload {
            AccelerationBuildPayload::BottomLevel(GeometryDesc::Aabbs(aabbs)) => {
                if aabbs.stride < AABB_SIZE || aabbs.stride % 8 != 0 {
                    return Err(GfxError::PrebuildQuery(format!("invalid aabb stride {}", aabbs.stride)));
                }
                if aabbs.count > 0 {
                    let span = (aabbs.count as u64 - 1) * aabbs.stride + AABB_SIZE;
                    check_range(aabbs.offset, span, self.buffer_len(aabbs.buffer)?)?;
                }
                (aabbs.count, 64, 32)
            }
            AccelerationBuildPayload::BottomLevel(GeometryDesc::Triangles(triangles)) => {
                if triangles.vertex_stride < TRIANGLE_VERTEX_SIZE {
                    return Err(GfxError::PrebuildQuery(format!("invalid vertex stride {}", triangles.vertex_stride)));
                }
                if triangles.primitive_count > 0 && triangles.vertex_count == 0 {
                    return Err(GfxError::PrebuildQuery("triangles without vertices".to_string()));
                }
                check_range(
                    0,
                    triangles.vertex_count as u64 * triangles.vertex_stride,
                    self.buffer_len(triangles.vertex_buffer)?,
                )?;
                check_range(
                    0,
                    triangles.primitive_count as u64 * TRIANGLE_INDEX_STRIDE,
                    self.buffer_len(triangles.index_buffer)?,
                )?;
                (triangles.primitive_count, 64, 32)
            }
            AccelerationBuildPayload::TopLevel {
                instance_buffer,
                instance_count,
            } => {
                check_range(0, instance_count as u64 * GpuInstanceRecord::SIZE, self.buffer_len(instance_buffer)?)?;
                (instance_count, 128, 64)
            }
        };

        let count = count as u64;
        Ok(PrebuildSizes {
            result_size: (HOST_AS_HEADER_SIZE + count * node_size).next_multiple_of(HOST_AS_ALIGNMENT),
            scratch_size: (128 + count * scratch_per_node).next_multiple_of(HOST_AS_ALIGNMENT),
        })
    }

    fn snapshot(&self, commands: &[GfxCommand]) -> SubmissionSnapshot {
        let copy_dsts = commands
            .iter()
            .filter_map(|command| match command {
                GfxCommand::CopyBuffer { dst, .. } => Some(*dst),
                _ => None,
            })
            .collect_vec();

        let buffers = self.buffers.borrow();
        let touched_buffers = commands
            .iter()
            .filter_map(|command| match command {
                GfxCommand::CopyBuffer { dst, .. } => Some(*dst),
                GfxCommand::Transition { buffer, .. } => Some(*buffer),
                GfxCommand::BuildAcceleration { .. } => None,
            })
            .unique()
            .filter_map(|handle| {
                let buffer = buffers.get(handle)?;
                Some((handle, buffer.state, copy_dsts.contains(&handle).then(|| buffer.data.clone())))
            })
            .collect_vec();

        let accels = self.accelerations.borrow();
        let touched_accels = commands
            .iter()
            .filter_map(|command| match command {
                GfxCommand::BuildAcceleration { dst, .. } => Some(*dst),
                _ => None,
            })
            .unique()
            .filter_map(|handle| Some((handle, accels.get(handle)?.built.clone())))
            .collect_vec();

        SubmissionSnapshot {
            buffers: touched_buffers,
            accelerations: touched_accels,
        }
    }

    fn restore(&self, snapshot: SubmissionSnapshot) {
        let mut buffers = self.buffers.borrow_mut();
        for (handle, state, data) in snapshot.buffers {
            let Some(buffer) = buffers.get_mut(handle) else { continue };
            buffer.state = state;
            if let Some(data) = data {
                buffer.data = data;
            }
        }

        let mut accels = self.accelerations.borrow_mut();
        for (handle, built) in snapshot.accelerations {
            if let Some(accel) = accels.get_mut(handle) {
                accel.built = built;
            }
        }
    }

    fn execute(&self, command: &GfxCommand) -> Result<(), String> {
        match command {
            GfxCommand::CopyBuffer { src, dst, region } => self.execute_copy(*src, *dst, region),
            GfxCommand::Transition { buffer, before, after } => {
                let mut buffers = self.buffers.borrow_mut();
                let buffer = buffers.get_mut(*buffer).ok_or("transition on released buffer")?;
                if buffer.state != *before {
                    return Err(format!(
                        "buffer `{}` is in {:?}, transition declared {:?} -> {:?}",
                        buffer.desc.name, buffer.state, before, after
                    ));
                }
                buffer.state = *after;
                Ok(())
            }
            GfxCommand::BuildAcceleration { inputs, dst, scratch } => self.execute_build(inputs, *dst, *scratch),
        }
    }

    fn execute_copy(&self, src: GfxBufferHandle, dst: GfxBufferHandle, region: &BufferCopyRegion) -> Result<(), String> {
        let mut buffers = self.buffers.borrow_mut();

        let src_buffer = buffers.get(src).ok_or("copy from released buffer")?;
        check_range(region.src_offset, region.size, src_buffer.desc.size).map_err(|e| e.to_string())?;
        let begin = region.src_offset as usize;
        let bytes = src_buffer.data[begin..begin + region.size as usize].to_vec();

        let dst_buffer = buffers.get_mut(dst).ok_or("copy into released buffer")?;
        if dst_buffer.state != ResourceState::CopyDest {
            return Err(format!("copy destination `{}` is in {:?}", dst_buffer.desc.name, dst_buffer.state));
        }
        check_range(region.dst_offset, region.size, dst_buffer.desc.size).map_err(|e| e.to_string())?;
        let begin = region.dst_offset as usize;
        dst_buffer.data[begin..begin + bytes.len()].copy_from_slice(&bytes);
        Ok(())
    }

    fn execute_build(
        &self,
        inputs: &AccelerationBuildInputs,
        dst: GfxAccelerationHandle,
        scratch: GfxBufferHandle,
    ) -> Result<(), String> {
        let sizes = self.compute_prebuild_sizes(inputs).map_err(|e| e.to_string())?;

        let (result_buffer, accel_size) = {
            let accels = self.accelerations.borrow();
            let accel = accels.get(dst).ok_or("build into released acceleration structure")?;
            if accel.kind != inputs.kind() {
                return Err(format!("`{}` is {:?}, inputs are {:?}", accel.name, accel.kind, inputs.kind()));
            }
            (accel.result_buffer, accel.size)
        };
        if accel_size < sizes.result_size {
            return Err(format!("result size {accel_size} < required {}", sizes.result_size));
        }

        let instances = {
            let buffers = self.buffers.borrow();
            let scratch = buffers.get(scratch).ok_or("scratch buffer released")?;
            if scratch.state != ResourceState::UnorderedAccess {
                return Err(format!("scratch buffer is in {:?}", scratch.state));
            }
            if scratch.desc.size < sizes.scratch_size {
                return Err(format!("scratch size {} < required {}", scratch.desc.size, sizes.scratch_size));
            }
            let result = buffers.get(result_buffer).ok_or("result buffer released")?;
            if result.state != ResourceState::AccelerationStructure {
                return Err(format!("result buffer is in {:?}", result.state));
            }

            match inputs.payload {
                AccelerationBuildPayload::TopLevel {
                    instance_buffer,
                    instance_count,
                } => {
                    let instance_buffer = buffers.get(instance_buffer).ok_or("instance buffer released")?;
                    let byte_len = (instance_count as u64 * GpuInstanceRecord::SIZE) as usize;
                    instance_buffer.data[..byte_len]
                        .chunks_exact(GpuInstanceRecord::SIZE as usize)
                        .map(bytemuck::pod_read_unaligned::<GpuInstanceRecord>)
                        .collect_vec()
                }
                AccelerationBuildPayload::BottomLevel(_) => Vec::new(),
            }
        };

        let mut accels = self.accelerations.borrow_mut();
        for (idx, instance) in instances.iter().enumerate() {
            let referenced = accels.values().find(|a| a.address == instance.acceleration_structure);
            match referenced {
                Some(blas) if blas.kind == AccelerationKind::BottomLevel && blas.built.is_some() => {}
                _ => {
                    return Err(format!(
                        "instance {idx} references unknown blas {:#x}",
                        instance.acceleration_structure
                    ));
                }
            }
        }

        let accel = accels.get_mut(dst).ok_or("build into released acceleration structure")?;
        accel.built = Some((inputs.primitive_count(), instances));
        Ok(())
    }
}

impl GfxDevice for HostDevice {
    fn name(&self) -> &str {
        &self.name
    }

    fn frames_in_flight(&self) -> usize {
        self.frames_in_flight
    }

    fn current_frame_index(&self) -> usize {
        self.frame_index.get()
    }

    fn advance_frame(&self) {
        self.frame_index.set((self.frame_index.get() + 1) % self.frames_in_flight);
    }

    fn create_buffer(&self, desc: &GfxBufferDesc) -> GfxResult<GfxBufferHandle> {
        let creation_error = |reason: &str| GfxError::BufferCreation {
            name: desc.name.clone(),
            size: desc.size,
            reason: reason.to_string(),
        };

        if self.take_failure(FailPoint::CreateBuffer) {
            return Err(creation_error("injected failure"));
        }
        if desc.size == 0 {
            return Err(creation_error("zero-sized buffer"));
        }
        let live_bytes = self.stats.get().live_bytes;
        if self.memory_budget.is_some_and(|budget| live_bytes + desc.size > budget) {
            return Err(creation_error("out of device memory"));
        }

        let buffer = HostBuffer {
            desc: desc.clone(),
            data: vec![0; desc.size as usize],
            address: self.alloc_address(desc.size),
            state: desc.initial_state,
        };
        let handle = self.buffers.borrow_mut().insert(buffer);
        self.update_stats(|s| {
            s.buffers_created += 1;
            s.live_bytes += desc.size;
        });
        log::debug!("host: create buffer `{}` ({} bytes, {:?})", desc.name, desc.size, desc.memory);
        Ok(handle)
    }

    fn destroy_buffer(&self, buffer: GfxBufferHandle) {
        match self.buffers.borrow_mut().remove(buffer) {
            Some(buffer) => {
                self.update_stats(|s| {
                    s.buffers_destroyed += 1;
                    s.live_bytes -= buffer.desc.size;
                });
            }
            None => log::warn!("host: destroy of released buffer {buffer:?}"),
        }
    }

    fn buffer_size(&self, buffer: GfxBufferHandle) -> GfxResult<u64> {
        self.buffer_len(buffer)
    }

    fn buffer_device_address(&self, buffer: GfxBufferHandle) -> GfxResult<u64> {
        let buffers = self.buffers.borrow();
        let buffer = buffers.get(buffer).ok_or(GfxError::InvalidHandle)?;
        if !buffer.desc.usage.contains(BufferUsage::DEVICE_ADDRESS) {
            return Err(GfxError::InvalidArgument(format!("buffer `{}` has no device address", buffer.desc.name)));
        }
        Ok(buffer.address)
    }

    fn write_mapped(&self, buffer: GfxBufferHandle, offset: u64, data: &[u8]) -> GfxResult<()> {
        let mut buffers = self.buffers.borrow_mut();
        let buffer = buffers.get_mut(buffer).ok_or(GfxError::InvalidHandle)?;
        if !buffer.desc.memory.is_host_visible() {
            return Err(GfxError::Map(format!("buffer `{}` is not host visible", buffer.desc.name)));
        }
        check_range(offset, data.len() as u64, buffer.desc.size)?;
        buffer.data[offset as usize..offset as usize + data.len()].copy_from_slice(data);
        Ok(())
    }

    fn read_mapped(&self, buffer: GfxBufferHandle, offset: u64, out: &mut [u8]) -> GfxResult<()> {
        let buffers = self.buffers.borrow();
        let buffer = buffers.get(buffer).ok_or(GfxError::InvalidHandle)?;
        if !buffer.desc.memory.is_host_visible() {
            return Err(GfxError::Map(format!("buffer `{}` is not host visible", buffer.desc.name)));
        }
        check_range(offset, out.len() as u64, buffer.desc.size)?;
        out.copy_from_slice(&buffer.data[offset as usize..offset as usize + out.len()]);
        Ok(())
    }

    fn query_prebuild_sizes(&self, inputs: &AccelerationBuildInputs) -> GfxResult<PrebuildSizes> {
        if self.take_failure(FailPoint::PrebuildQuery) {
            return Err(GfxError::PrebuildQuery("injected failure".to_string()));
        }
        self.compute_prebuild_sizes(inputs).map_err(GfxError::into_query_error)
    }

    fn create_acceleration_structure(
        &self,
        kind: AccelerationKind,
        result_buffer: GfxBufferHandle,
        size: u64,
        name: &str,
    ) -> GfxResult<GfxAccelerationHandle> {
        let creation_error = |reason: String| GfxError::AccelerationCreation {
            name: name.to_string(),
            reason,
        };

        if self.take_failure(FailPoint::CreateAcceleration) {
            return Err(creation_error("injected failure".to_string()));
        }
        let address = {
            let buffers = self.buffers.borrow();
            let buffer = buffers.get(result_buffer).ok_or_else(|| creation_error("result buffer released".to_string()))?;
            if !buffer.desc.usage.contains(BufferUsage::ACCELERATION_STORAGE) {
                return Err(creation_error(format!("`{}` is not acceleration storage", buffer.desc.name)));
            }
            if buffer.desc.size < size {
                return Err(creation_error(format!("result buffer {} < {size}", buffer.desc.size)));
            }
            buffer.address
        };

        let handle = self.accelerations.borrow_mut().insert(HostAcceleration {
            kind,
            result_buffer,
            size,
            address,
            name: name.to_string(),
            built: None,
        });
        self.update_stats(|s| s.accelerations_created += 1);
        Ok(handle)
    }

    fn destroy_acceleration_structure(&self, acceleration: GfxAccelerationHandle) {
        if self.accelerations.borrow_mut().remove(acceleration).is_some() {
            self.update_stats(|s| s.accelerations_destroyed += 1);
        } else {
            log::warn!("host: destroy of released acceleration structure {acceleration:?}");
        }
    }

    fn acceleration_structure_address(&self, acceleration: GfxAccelerationHandle) -> GfxResult<u64> {
        self.accelerations.borrow().get(acceleration).map(|a| a.address).ok_or(GfxError::InvalidHandle)
    }

    fn shader_table_limits(&self) -> ShaderTableLimits {
        self.limits
    }

    fn create_ray_tracing_pipeline(&self, desc: &RayTracingPipelineDesc) -> GfxResult<Box<dyn GfxRayTracingPipeline>> {
        log::info!(
            "host: create pipeline `{}` ({} miss, {} hit groups, {} callable)",
            desc.name,
            desc.miss_count,
            desc.hit_groups.len(),
            desc.callable_count
        );
        Ok(Box::new(HostRayTracingPipeline::new(
            self.limits.identifier_size,
            desc.miss_count,
            desc.hit_groups.clone(),
            desc.callable_count,
        )))
    }

    fn submit_and_wait(&self, recorder: &GfxCommandRecorder) -> GfxResult<()> {
        let submission_error = |reason: String| GfxError::Submission {
            name: recorder.name().to_string(),
            reason,
        };

        if self.take_failure(FailPoint::Submit) {
            return Err(submission_error("injected failure".to_string()));
        }
        self.update_stats(|s| s.submissions += 1);
        *self.last_submission.borrow_mut() = recorder.commands().to_vec();

        log::debug!("host: submit `{}` with {} commands", recorder.name(), recorder.commands().len());
        // 提交是原子的：任何一条命令失败，之前命令的效果全部撤销
        let snapshot = self.snapshot(recorder.commands());
        for (idx, command) in recorder.commands().iter().enumerate() {
            if let Err(reason) = self.execute(command) {
                self.restore(snapshot);
                return Err(submission_error(format!("command {idx}: {reason}")));
            }
        }
        Ok(())
    }

    fn wait_idle(&self) -> GfxResult<()> {
        self.update_stats(|s| s.wait_idle_calls += 1);
        Ok(())
    }

    fn export_memory_handle(&self, buffer: GfxBufferHandle) -> GfxResult<ExternalMemoryHandle> {
        if self.take_failure(FailPoint::ExportMemory) {
            return Err(GfxError::Interop {
                reason: "injected failure".to_string(),
                diagnostic: None,
            });
        }
        let buffers = self.buffers.borrow();
        let buffer = buffers.get(buffer).ok_or(GfxError::InvalidHandle)?;
        if buffer.desc.memory != MemoryClass::Shared {
            return Err(GfxError::Interop {
                reason: format!("buffer `{}` is not shareable", buffer.desc.name),
                diagnostic: Some(format!("memory class is {:?}", buffer.desc.memory)),
            });
        }
        Ok(ExternalMemoryHandle {
            kind: ExternalHandleKind::HostToken(buffer.address),
            size: buffer.desc.size,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::GfxDeviceExt;

    #[test]
    fn test_device_local_is_not_mappable() {
        let device = HostDevice::with_frames_in_flight(2);
        let buffer = device.create_buffer(&GfxBufferDesc::device_local(16, "gpu")).unwrap();
        assert!(matches!(device.write_mapped(buffer, 0, &[1, 2]), Err(GfxError::Map(_))));

        let upload = device.create_buffer(&GfxBufferDesc::upload(16, "upload")).unwrap();
        device.write_mapped(upload, 4, &[1, 2, 3]).unwrap();
        let mut out = [0u8; 3];
        device.read_mapped(upload, 4, &mut out).unwrap();
        assert_eq!(out, [1, 2, 3]);
        assert!(device.write_mapped(upload, 15, &[1, 2]).is_err());
    }

    #[test]
    fn test_copy_requires_copy_dest() {
        let device = HostDevice::with_frames_in_flight(1);
        let src = device.create_buffer(&GfxBufferDesc::upload(8, "src")).unwrap();
        let dst = device.create_buffer(&GfxBufferDesc::device_local(8, "dst")).unwrap();
        device.write_mapped(src, 0, &[9; 8]).unwrap();

        let region = BufferCopyRegion {
            src_offset: 0,
            dst_offset: 0,
            size: 8,
        };
        let err = device.one_time_exec(|cmd| cmd.cmd_copy_buffer(src, dst, &[region]), "bare-copy").unwrap_err();
        assert!(matches!(err, GfxError::Submission { .. }));

        device
            .one_time_exec(|cmd| cmd.copy_buffer_with_state(src, dst, 8, 0, 0, ResourceState::GenericRead), "copy")
            .unwrap();
        assert_eq!(device.read_device_memory(dst).unwrap(), vec![9; 8]);
        assert_eq!(device.buffer_state(dst), Some(ResourceState::GenericRead));
    }

    #[test]
    fn test_failed_submission_rolls_back() {
        let device = HostDevice::with_frames_in_flight(1);
        let src = device.create_buffer(&GfxBufferDesc::upload(8, "src")).unwrap();
        let dst = device.create_buffer(&GfxBufferDesc::device_local(8, "dst")).unwrap();
        device.write_mapped(src, 0, &[3; 8]).unwrap();

        // 拷贝本身成功，最后一条越界的拷贝让整个提交失败
        let mut cmd = GfxCommandRecorder::new("partial");
        cmd.copy_buffer_with_state(src, dst, 8, 0, 0, ResourceState::GenericRead);
        cmd.transition(dst, ResourceState::GenericRead, ResourceState::CopyDest);
        cmd.cmd_copy_buffer(
            src,
            dst,
            &[BufferCopyRegion {
                src_offset: 4,
                dst_offset: 0,
                size: 8,
            }],
        );
        assert!(matches!(device.submit_and_wait(&cmd), Err(GfxError::Submission { .. })));

        assert_eq!(device.buffer_state(dst), Some(ResourceState::GenericRead));
        assert_eq!(device.read_device_memory(dst).unwrap(), vec![0; 8]);

        // 设备仍然可用，后续的上传不会因为残留状态而失败
        device
            .one_time_exec(|cmd| cmd.copy_buffer_with_state(src, dst, 8, 0, 0, ResourceState::GenericRead), "copy")
            .unwrap();
        assert_eq!(device.read_device_memory(dst).unwrap(), vec![3; 8]);
    }

    #[test]
    fn test_pipeline_follows_device_limits() {
        let device = HostDevice::new(&GfxConfig {
            host: crate::config::HostDeviceConfig {
                identifier_size: 16,
                ..Default::default()
            },
            ..Default::default()
        });
        let desc = RayTracingPipelineDesc {
            name: "rt".to_string(),
            miss_count: 1,
            hit_groups: vec![crate::raytracing::pipeline::HitGroupKind::Procedural],
            callable_count: 0,
            shader_dir: None,
        };
        let pipeline = device.create_ray_tracing_pipeline(&desc).unwrap();
        assert_eq!(pipeline.hit_group_count(), 1);
        assert_eq!(pipeline.shader_identifier("HitGroup0").unwrap().len(), 16);
        assert!(pipeline.shader_identifier("CallableMain0").is_err());
    }

    #[test]
    fn test_memory_budget() {
        let device = HostDevice::new(&GfxConfig {
            host: crate::config::HostDeviceConfig {
                memory_budget: Some(100),
                ..Default::default()
            },
            ..Default::default()
        });
        let a = device.create_buffer(&GfxBufferDesc::upload(60, "a")).unwrap();
        assert!(device.create_buffer(&GfxBufferDesc::upload(60, "b")).is_err());
        device.destroy_buffer(a);
        assert!(device.create_buffer(&GfxBufferDesc::upload(60, "c")).is_ok());
    }

    #[test]
    fn test_injected_failure_fires_once() {
        let device = HostDevice::with_frames_in_flight(1);
        device.inject_failure(FailPoint::CreateBuffer);
        assert!(device.create_buffer(&GfxBufferDesc::upload(4, "x")).is_err());
        assert!(device.create_buffer(&GfxBufferDesc::upload(4, "y")).is_ok());
    }

    #[test]
    fn test_frame_index_wraps() {
        let device = HostDevice::with_frames_in_flight(3);
        let seen = (0..4)
            .map(|_| {
                let idx = device.current_frame_index();
                device.advance_frame();
                idx
            })
            .collect_vec();
        assert_eq!(seen, vec![0, 1, 2, 0]);
    }

    #[test]
    fn test_zero_sized_buffer_is_rejected() {
        let device = HostDevice::with_frames_in_flight(1);
        let err = device.create_buffer(&GfxBufferDesc::upload(0, "empty")).unwrap_err();
        assert_eq!(err.step(), crate::error::FailedStep::Allocation);
    }
}
