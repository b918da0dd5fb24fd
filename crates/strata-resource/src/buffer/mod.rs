//! buffer 的三种形态
//!
//! - [`static_buffer::StaticBuffer`]：单个 GPU 本地 buffer，所有操作都是同步的
//! - [`dynamic_buffer::DynamicBuffer`]：每个 frame in flight 一份 GPU 拷贝，加上一个 host 可写的 staging
//! - [`interop_buffer::InteropBuffer`]：可以导出给另一个 API 的 GPU 本地 buffer
//!
//! 调用方只持有 [`GpuBuffer`]，不关心具体的形态。

pub mod dynamic_buffer;
pub mod interop_buffer;
pub mod static_buffer;

mod staging;

use strata_gfx::commands::recorder::GfxCommandRecorder;
use strata_gfx::error::GfxResult;
use strata_gfx::resources::handles::GfxBufferHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BufferType {
    Static,
    Dynamic,
    Interop,
}

pub trait GpuBuffer {
    fn buffer_type(&self) -> BufferType;

    fn size(&self) -> u64;

    /// 保留 `min(old_size, new_size)` 字节的内容
    fn resize(&mut self, new_size: u64) -> GfxResult<()>;

    /// 写入 `[offset, offset + data.len())`
    fn upload_data(&mut self, data: &[u8], offset: u64) -> GfxResult<()>;

    /// 读取 `[offset, offset + out.len())`
    fn download_data(&self, out: &mut [u8], offset: u64) -> GfxResult<()>;

    /// GPU 应该绑定的 buffer
    fn buffer(&self) -> GfxBufferHandle;

    /// host 写入的 buffer
    fn instant_buffer(&self) -> GfxBufferHandle;

    /// 每帧在 GPU 使用之前调用，把 host 写入的内容同步到当前帧的 GPU 拷贝
    ///
    /// 只录制命令，不会等待
    fn transfer_data(&mut self, _cmd: &mut GfxCommandRecorder) -> GfxResult<()> {
        Ok(())
    }
}

/// 设备不接受零大小的分配，逻辑大小为 0 时仍然分配一个最小的 buffer
pub(crate) const MIN_ALLOCATION_SIZE: u64 = 4;

#[inline]
pub(crate) fn allocation_size(size: u64) -> u64 {
    size.max(MIN_ALLOCATION_SIZE)
}
