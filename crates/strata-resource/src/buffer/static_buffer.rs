use std::rc::Rc;

use strata_gfx::error::GfxResult;
use strata_gfx::resources::buffer_desc::{GfxBufferDesc, ResourceState};
use strata_gfx::resources::handles::GfxBufferHandle;

use crate::buffer::staging::{download_via_staging, reallocate_with_copy, upload_via_staging};
use crate::buffer::{BufferType, GpuBuffer, allocation_size};
use crate::render_core::RenderCore;

/// 单个 GPU 本地 buffer
///
/// upload、download、resize 都会阻塞，直到 GPU 完成对应的拷贝
pub struct StaticBuffer {
    core: Rc<RenderCore>,
    buffer: GfxBufferHandle,
    size: u64,
    name: String,
}

// init & destroy
impl StaticBuffer {
    pub fn new(core: Rc<RenderCore>, size: u64, name: impl Into<String>) -> GfxResult<Self> {
        let name = name.into();
        let buffer = core.device().create_buffer(&Self::buffer_desc(size, &name))?;
        log::info!("static buffer `{}` created: {} bytes", name, size);
        Ok(Self {
            core,
            buffer,
            size,
            name,
        })
    }

    /// 拷贝结束后 buffer 回到的状态
    const RESTING_STATE: ResourceState = ResourceState::GenericRead;

    fn buffer_desc(size: u64, name: &str) -> GfxBufferDesc {
        GfxBufferDesc::device_local(allocation_size(size), name).with_state(Self::RESTING_STATE)
    }
}

impl Drop for StaticBuffer {
    fn drop(&mut self) {
        self.core.device().destroy_buffer(self.buffer);
    }
}

// getter
impl StaticBuffer {
    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl GpuBuffer for StaticBuffer {
    fn buffer_type(&self) -> BufferType {
        BufferType::Static
    }

    fn size(&self) -> u64 {
        self.size
    }

    fn resize(&mut self, new_size: u64) -> GfxResult<()> {
        let desc = Self::buffer_desc(new_size, &self.name);
        let new_buffer = reallocate_with_copy(&self.core, self.buffer, self.size.min(new_size), &desc)?;

        self.core.device().destroy_buffer(self.buffer);
        self.buffer = new_buffer;
        log::debug!("static buffer `{}` resized: {} -> {} bytes", self.name, self.size, new_size);
        self.size = new_size;
        Ok(())
    }

    fn upload_data(&mut self, data: &[u8], offset: u64) -> GfxResult<()> {
        upload_via_staging(&self.core, self.buffer, self.size, Self::RESTING_STATE, data, offset)
    }

    fn download_data(&self, out: &mut [u8], offset: u64) -> GfxResult<()> {
        download_via_staging(&self.core, self.buffer, self.size, out, offset)
    }

    fn buffer(&self) -> GfxBufferHandle {
        self.buffer
    }

    fn instant_buffer(&self) -> GfxBufferHandle {
        self.buffer
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_gfx::error::GfxError;
    use strata_gfx::host::device::{FailPoint, HostDevice};

    fn make_core() -> (Rc<HostDevice>, Rc<RenderCore>) {
        let device = Rc::new(HostDevice::with_frames_in_flight(2));
        (device.clone(), RenderCore::new(device))
    }

    #[test]
    fn test_upload_download_round_trip() {
        let (device, core) = make_core();
        let mut buffer = StaticBuffer::new(core, 64, "static").unwrap();

        let data = (0..16u8).collect::<Vec<_>>();
        buffer.upload_data(&data, 8).unwrap();

        let mut out = vec![0u8; 16];
        buffer.download_data(&mut out, 8).unwrap();
        assert_eq!(out, data);

        // 拷贝结束后恢复到声明的状态
        assert_eq!(device.buffer_state(buffer.buffer()), Some(ResourceState::GenericRead));
        // 真的经过了 GPU 拷贝，而不是 map
        assert_eq!(device.read_device_memory(buffer.buffer()).unwrap()[8..24], data[..]);
    }

    #[test]
    fn test_resize_keeps_prefix() {
        let (device, core) = make_core();
        let mut buffer = StaticBuffer::new(core, 32, "static").unwrap();
        let data = (100..132u8).collect::<Vec<_>>();
        buffer.upload_data(&data, 0).unwrap();

        buffer.resize(16).unwrap();
        assert_eq!(buffer.size(), 16);
        let mut out = vec![0u8; 16];
        buffer.download_data(&mut out, 0).unwrap();
        assert_eq!(out, data[..16]);

        buffer.resize(48).unwrap();
        let mut out = vec![0u8; 48];
        buffer.download_data(&mut out, 0).unwrap();
        assert_eq!(out[..16], data[..16]);
        assert!(out[16..].iter().all(|b| *b == 0));

        // 只剩下 buffer 本身以及两个 staging
        assert_eq!(device.live_buffer_count(), 3);
    }

    #[test]
    fn test_operations_block_on_gpu() {
        let (device, core) = make_core();
        let mut buffer = StaticBuffer::new(core, 16, "static").unwrap();
        let before = device.stats();
        buffer.upload_data(&[1, 2, 3, 4], 0).unwrap();
        let after = device.stats();
        assert_eq!(after.wait_idle_calls, before.wait_idle_calls + 1);
        assert_eq!(after.submissions, before.submissions + 1);
    }

    #[test]
    fn test_out_of_range_upload() {
        let (_device, core) = make_core();
        let mut buffer = StaticBuffer::new(core, 16, "static").unwrap();
        let err = buffer.upload_data(&[0; 8], 12).unwrap_err();
        assert!(matches!(err, GfxError::OutOfRange { offset: 12, len: 8, size: 16 }));
    }

    #[test]
    fn test_failed_resize_keeps_old_buffer() {
        let (device, core) = make_core();
        let mut buffer = StaticBuffer::new(core, 16, "static").unwrap();
        buffer.upload_data(&[7; 16], 0).unwrap();
        let old = buffer.buffer();

        device.inject_failure(FailPoint::Submit);
        assert!(buffer.resize(32).is_err());
        assert_eq!(buffer.buffer(), old);
        assert_eq!(buffer.size(), 16);

        let mut out = [0u8; 16];
        buffer.download_data(&mut out, 0).unwrap();
        assert_eq!(out, [7; 16]);
    }

    #[test]
    fn test_zero_sized_buffer() {
        let (_device, core) = make_core();
        let mut buffer = StaticBuffer::new(core, 0, "empty").unwrap();
        assert_eq!(buffer.size(), 0);
        buffer.upload_data(&[], 0).unwrap();
        buffer.resize(8).unwrap();
        assert_eq!(buffer.size(), 8);
    }
}
