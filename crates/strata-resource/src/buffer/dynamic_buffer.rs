use std::rc::Rc;

use itertools::Itertools;
use strata_gfx::commands::recorder::GfxCommandRecorder;
use strata_gfx::device::check_range;
use strata_gfx::error::GfxResult;
use strata_gfx::resources::buffer_desc::{GfxBufferDesc, ResourceState};
use strata_gfx::resources::handles::GfxBufferHandle;

use crate::buffer::{BufferType, GpuBuffer, allocation_size};
use crate::render_core::RenderCore;

#[derive(Debug, Clone, Copy)]
struct FrameCopy {
    handle: GfxBufferHandle,
    /// 创建时 staging 的逻辑大小
    size: u64,
}

/// 每个 frame in flight 一份 GPU 本地拷贝，加上一个 host 可写的 staging
///
/// - host 只写 staging，upload 和 download 不需要任何 GPU 同步
/// - [`GpuBuffer::transfer_data`] 把 staging 拷贝到当前帧的 GPU 拷贝，只录制命令，不等待
/// - [`GpuBuffer::resize`] 只重新分配 staging；当前帧的 GPU 拷贝要等到下一次 transfer 才会跟上。
///   在这之间绑定 [`GpuBuffer::buffer`] 会拿到旧的、大小不对的拷贝，调用方需要自己安排好顺序
pub struct DynamicBuffer {
    core: Rc<RenderCore>,

    /// 长度始终等于 frames in flight
    frame_copies: Vec<FrameCopy>,
    staging: GfxBufferHandle,

    /// staging 的逻辑大小，即 `size()`
    size: u64,
    name: String,
}

// init & destroy
impl DynamicBuffer {
    const FRAME_STATE: ResourceState = ResourceState::GenericRead;

    pub fn new(core: Rc<RenderCore>, size: u64, name: impl Into<String>) -> GfxResult<Self> {
        let name = name.into();
        let staging = core.device().create_buffer(&Self::staging_desc(size, &name))?;

        let mut frame_copies = Vec::with_capacity(core.device().frames_in_flight());
        for frame in 0..core.device().frames_in_flight() {
            match core.device().create_buffer(&Self::frame_desc(size, &name, frame)) {
                Ok(handle) => frame_copies.push(FrameCopy { handle, size }),
                Err(e) => {
                    frame_copies.iter().for_each(|copy| core.device().destroy_buffer(copy.handle));
                    core.device().destroy_buffer(staging);
                    return Err(e);
                }
            }
        }

        log::info!("dynamic buffer `{}` created: {} bytes x {} frames", name, size, frame_copies.len());
        Ok(Self {
            core,
            frame_copies,
            staging,
            size,
            name,
        })
    }

    fn staging_desc(size: u64, name: &str) -> GfxBufferDesc {
        GfxBufferDesc::upload(allocation_size(size), format!("{name}-staging"))
    }

    fn frame_desc(size: u64, name: &str, frame: usize) -> GfxBufferDesc {
        GfxBufferDesc::device_local(allocation_size(size), format!("{name}-frame{frame}")).with_state(Self::FRAME_STATE)
    }
}

impl Drop for DynamicBuffer {
    fn drop(&mut self) {
        for copy in self.frame_copies.drain(..) {
            self.core.device().destroy_buffer(copy.handle);
        }
        self.core.device().destroy_buffer(self.staging);
    }
}

// getter
impl DynamicBuffer {
    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn frame_count(&self) -> usize {
        self.frame_copies.len()
    }

    /// 第 `frame` 份 GPU 拷贝
    #[inline]
    pub fn frame_buffer(&self, frame: usize) -> GfxBufferHandle {
        self.frame_copies[frame % self.frame_copies.len()].handle
    }

    /// 第 `frame` 份 GPU 拷贝当前的逻辑大小，可能落后于 `size()`
    #[inline]
    pub fn frame_size(&self, frame: usize) -> u64 {
        self.frame_copies[frame % self.frame_copies.len()].size
    }

    #[inline]
    fn current_frame(&self) -> usize {
        self.core.device().current_frame_index() % self.frame_copies.len()
    }
}

impl GpuBuffer for DynamicBuffer {
    fn buffer_type(&self) -> BufferType {
        BufferType::Dynamic
    }

    fn size(&self) -> u64 {
        self.size
    }

    fn resize(&mut self, new_size: u64) -> GfxResult<()> {
        let keep = self.size.min(new_size);
        let mut prefix = vec![0u8; keep as usize];
        self.core.device().read_mapped(self.staging, 0, &mut prefix)?;

        let new_staging = self.core.device().create_buffer(&Self::staging_desc(new_size, &self.name))?;
        if let Err(e) = self.core.device().write_mapped(new_staging, 0, &prefix) {
            self.core.device().destroy_buffer(new_staging);
            return Err(e);
        }

        self.core.device().destroy_buffer(self.staging);
        self.staging = new_staging;
        log::debug!("dynamic buffer `{}` resized: {} -> {} bytes", self.name, self.size, new_size);
        self.size = new_size;
        Ok(())
    }

    fn upload_data(&mut self, data: &[u8], offset: u64) -> GfxResult<()> {
        check_range(offset, data.len() as u64, self.size)?;
        self.core.device().write_mapped(self.staging, offset, data)
    }

    fn download_data(&self, out: &mut [u8], offset: u64) -> GfxResult<()> {
        check_range(offset, out.len() as u64, self.size)?;
        self.core.device().read_mapped(self.staging, offset, out)
    }

    fn buffer(&self) -> GfxBufferHandle {
        self.frame_copies[self.current_frame()].handle
    }

    fn instant_buffer(&self) -> GfxBufferHandle {
        self.staging
    }

    fn transfer_data(&mut self, cmd: &mut GfxCommandRecorder) -> GfxResult<()> {
        let frame = self.current_frame();

        if self.frame_copies[frame].size != self.size {
            let desc = Self::frame_desc(self.size, &self.name, frame);
            let handle = self.core.device().create_buffer(&desc)?;
            // 该帧上一次的 GPU 工作已经结束，由外部的帧节奏保证
            self.core.device().destroy_buffer(self.frame_copies[frame].handle);
            log::debug!(
                "dynamic buffer `{}` frame {} follows resize: {} -> {} bytes",
                self.name,
                frame,
                self.frame_copies[frame].size,
                self.size
            );
            self.frame_copies[frame] = FrameCopy { handle, size: self.size };
        }

        if self.size > 0 {
            cmd.copy_buffer_with_state(self.staging, self.frame_copies[frame].handle, self.size, 0, 0, Self::FRAME_STATE);
        }
        Ok(())
    }
}

impl std::fmt::Debug for DynamicBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DynamicBuffer")
            .field("name", &self.name)
            .field("size", &self.size)
            .field("frame_sizes", &self.frame_copies.iter().map(|copy| copy.size).collect_vec())
            .finish()
    }
}
