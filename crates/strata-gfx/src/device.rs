use crate::commands::recorder::GfxCommandRecorder;
use crate::error::{GfxError, GfxResult};
use crate::raytracing::geometry::{AccelerationBuildInputs, AccelerationKind, PrebuildSizes};
use crate::raytracing::pipeline::{GfxRayTracingPipeline, RayTracingPipelineDesc, ShaderTableLimits};
use crate::resources::buffer_desc::GfxBufferDesc;
use crate::resources::handles::{GfxAccelerationHandle, GfxBufferHandle};

/// 导出给另一个 API 的内存句柄
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExternalHandleKind {
    /// `VK_EXTERNAL_MEMORY_HANDLE_TYPE_OPAQUE_FD_BIT`
    OpaqueFd(i32),
    /// host 后端使用的令牌
    HostToken(u64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExternalMemoryHandle {
    pub kind: ExternalHandleKind,
    pub size: u64,
}

/// 设备抽象
///
/// 所有调用都来自同一个线程，因此方法都是 `&self`，由实现内部负责可变性。
/// 资源的所有权不在设备上：创建者负责在 drop 时调用对应的 destroy。
pub trait GfxDevice {
    fn name(&self) -> &str;

    /// frames in flight 的数量，Dynamic buffer 会为每一帧持有一份 GPU 拷贝
    fn frames_in_flight(&self) -> usize;

    fn current_frame_index(&self) -> usize;

    /// 由外部的帧调度调用，保证新的 slot 之前的 GPU 工作已经完成
    fn advance_frame(&self);

    fn create_buffer(&self, desc: &GfxBufferDesc) -> GfxResult<GfxBufferHandle>;

    fn destroy_buffer(&self, buffer: GfxBufferHandle);

    fn buffer_size(&self, buffer: GfxBufferHandle) -> GfxResult<u64>;

    fn buffer_device_address(&self, buffer: GfxBufferHandle) -> GfxResult<u64>;

    /// 只能用于 host 可见的 buffer
    fn write_mapped(&self, buffer: GfxBufferHandle, offset: u64, data: &[u8]) -> GfxResult<()>;

    /// 只能用于 host 可见的 buffer
    fn read_mapped(&self, buffer: GfxBufferHandle, offset: u64, out: &mut [u8]) -> GfxResult<()>;

    /// 只计算大小，不做任何分配
    fn query_prebuild_sizes(&self, inputs: &AccelerationBuildInputs) -> GfxResult<PrebuildSizes>;

    /// 在 `result_buffer` 上创建加速结构对象，此时还没有构建
    fn create_acceleration_structure(
        &self,
        kind: AccelerationKind,
        result_buffer: GfxBufferHandle,
        size: u64,
        name: &str,
    ) -> GfxResult<GfxAccelerationHandle>;

    fn destroy_acceleration_structure(&self, acceleration: GfxAccelerationHandle);

    fn acceleration_structure_address(&self, acceleration: GfxAccelerationHandle) -> GfxResult<u64>;

    fn shader_table_limits(&self) -> ShaderTableLimits;

    /// 返回的管线必须先于设备释放
    fn create_ray_tracing_pipeline(&self, desc: &RayTracingPipelineDesc) -> GfxResult<Box<dyn GfxRayTracingPipeline>>;

    /// 提交并阻塞等待 fence，没有超时
    fn submit_and_wait(&self, recorder: &GfxCommandRecorder) -> GfxResult<()>;

    fn wait_idle(&self) -> GfxResult<()>;

    /// 只能用于 `MemoryClass::Shared` 的 buffer
    fn export_memory_handle(&self, buffer: GfxBufferHandle) -> GfxResult<ExternalMemoryHandle>;
}

/// 同步执行的 GPU 命令
pub trait GfxDeviceExt: GfxDevice {
    /// 录制 -> 提交 -> 等待 fence -> 重置
    ///
    /// 会阻塞当前线程直到 GPU 执行完毕，只用于低频的结构性操作。
    /// `func` 录制的命令总是会被提交，即使它的返回值表示失败；
    /// 可能失败的录制使用 [`GfxDeviceExt::try_one_time_exec`]
    fn one_time_exec<F, R>(&self, func: F, name: &str) -> GfxResult<R>
    where
        F: FnOnce(&mut GfxCommandRecorder) -> R,
    {
        let mut recorder = GfxCommandRecorder::new(name);
        let result = func(&mut recorder);
        if !recorder.is_empty() {
            self.submit_and_wait(&recorder)?;
        }
        recorder.reset();
        Ok(result)
    }

    /// 同 [`GfxDeviceExt::one_time_exec`]，但 `func` 返回 `Err` 时丢弃已录制的命令，不提交
    fn try_one_time_exec<F, R>(&self, func: F, name: &str) -> GfxResult<R>
    where
        F: FnOnce(&mut GfxCommandRecorder) -> GfxResult<R>,
    {
        let mut recorder = GfxCommandRecorder::new(name);
        let result = match func(&mut recorder) {
            Ok(result) => result,
            Err(e) => {
                log::debug!("`{name}`: recording failed, {} commands discarded", recorder.commands().len());
                recorder.reset();
                return Err(e);
            }
        };
        if !recorder.is_empty() {
            self.submit_and_wait(&recorder)?;
        }
        recorder.reset();
        Ok(result)
    }
}

impl<D: GfxDevice + ?Sized> GfxDeviceExt for D {}

/// `[offset, offset + len)` 必须落在 `[0, size)` 之内
pub fn check_range(offset: u64, len: u64, size: u64) -> GfxResult<()> {
    match offset.checked_add(len) {
        Some(end) if end <= size => Ok(()),
        _ => Err(GfxError::OutOfRange { offset, len, size }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::device::HostDevice;
    use crate::resources::buffer_desc::ResourceState;

    #[test]
    fn test_failed_recording_is_not_submitted() {
        let device = HostDevice::with_frames_in_flight(1);
        let buffer = device.create_buffer(&GfxBufferDesc::device_local(16, "dst")).unwrap();

        let err = device
            .try_one_time_exec(
                |cmd| -> GfxResult<()> {
                    cmd.transition(buffer, ResourceState::GenericRead, ResourceState::CopyDest);
                    Err(GfxError::InvalidArgument("abort".to_string()))
                },
                "half-recorded",
            )
            .unwrap_err();
        assert!(matches!(err, GfxError::InvalidArgument(_)));
        assert_eq!(device.stats().submissions, 0);
        assert_eq!(device.buffer_state(buffer), Some(ResourceState::GenericRead));
    }

    #[test]
    fn test_one_time_exec_submits_recorded_commands() {
        let device = HostDevice::with_frames_in_flight(1);
        let buffer = device.create_buffer(&GfxBufferDesc::device_local(16, "dst")).unwrap();

        let value = device
            .try_one_time_exec(
                |cmd| {
                    cmd.transition(buffer, ResourceState::GenericRead, ResourceState::CopyDest);
                    Ok(7)
                },
                "transition",
            )
            .unwrap();
        assert_eq!(value, 7);
        assert_eq!(device.stats().submissions, 1);
        assert_eq!(device.buffer_state(buffer), Some(ResourceState::CopyDest));

        // 空录制不会提交
        device.one_time_exec(|_| (), "empty").unwrap();
        assert_eq!(device.stats().submissions, 1);
    }

    #[test]
    fn test_check_range() {
        assert!(check_range(0, 16, 16).is_ok());
        assert!(check_range(16, 0, 16).is_ok());
        assert!(matches!(check_range(8, 9, 16), Err(GfxError::OutOfRange { offset: 8, len: 9, size: 16 })));
        assert!(check_range(u64::MAX, 2, 16).is_err());
    }
}
