use std::collections::HashMap;
use std::rc::Rc;

use strata_gfx::device::GfxDevice;
use strata_gfx::error::GfxResult;
use strata_gfx::resources::buffer_desc::{BufferUsage, GfxBufferDesc, MemoryClass, ResourceState};
use strata_gfx::resources::handles::GfxBufferHandle;

/// 零大小的请求（例如空的 tlas）也会得到一个可用的 buffer
pub const MIN_TRANSIENT_CAPACITY: u64 = 256;

/// 临时 buffer 的用途，每种用途各自独立复用
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransientPurpose {
    /// 加速结构构建时的 scratch，GPU 本地
    Scratch,
    /// tlas 的 instance 数据，host 直接写入
    Instance,
    /// 上传用的 staging
    UploadStaging,
    /// 回读用的 staging
    ReadbackStaging,
}

impl TransientPurpose {
    pub const ALL: [TransientPurpose; 4] = [
        TransientPurpose::Scratch,
        TransientPurpose::Instance,
        TransientPurpose::UploadStaging,
        TransientPurpose::ReadbackStaging,
    ];

    fn buffer_desc(self, capacity: u64) -> GfxBufferDesc {
        match self {
            TransientPurpose::Scratch => GfxBufferDesc::new(
                capacity,
                MemoryClass::DeviceLocal,
                BufferUsage::STORAGE | BufferUsage::DEVICE_ADDRESS,
                "transient-scratch",
            )
            .with_state(ResourceState::UnorderedAccess),
            TransientPurpose::Instance => GfxBufferDesc::new(
                capacity,
                MemoryClass::Upload,
                BufferUsage::ACCELERATION_INPUT | BufferUsage::DEVICE_ADDRESS,
                "transient-instance",
            ),
            TransientPurpose::UploadStaging => GfxBufferDesc::upload(capacity, "transient-upload-staging"),
            TransientPurpose::ReadbackStaging => GfxBufferDesc::readback(capacity, "transient-readback-staging"),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct TransientEntry {
    handle: GfxBufferHandle,
    capacity: u64,
}

/// 可复用的临时 buffer 池
///
/// 容量只增不减。`ensure_capacity` 在需要扩容时会先释放旧的 buffer 再分配新的，
/// 因此调用前必须保证没有仍在执行的 GPU 工作在读取旧 buffer（同步的构建和拷贝天然满足这一点）。
pub struct TransientBufferPool {
    device: Rc<dyn GfxDevice>,
    entries: HashMap<TransientPurpose, TransientEntry>,
    grow_count: u64,
}

// new & init
impl TransientBufferPool {
    pub fn new(device: Rc<dyn GfxDevice>) -> Self {
        Self {
            device,
            entries: HashMap::new(),
            grow_count: 0,
        }
    }
}

impl Drop for TransientBufferPool {
    fn drop(&mut self) {
        for (_, entry) in self.entries.drain() {
            self.device.destroy_buffer(entry.handle);
        }
    }
}

// getter
impl TransientBufferPool {
    /// 还没有分配过时为 0
    #[inline]
    pub fn capacity(&self, purpose: TransientPurpose) -> u64 {
        self.entries.get(&purpose).map_or(0, |entry| entry.capacity)
    }

    #[inline]
    pub fn buffer(&self, purpose: TransientPurpose) -> Option<GfxBufferHandle> {
        self.entries.get(&purpose).map(|entry| entry.handle)
    }

    /// 发生过多少次（重新）分配
    #[inline]
    pub fn grow_count(&self) -> u64 {
        self.grow_count
    }
}

// tools
impl TransientBufferPool {
    /// 返回一个容量不小于 `size` 的 buffer
    ///
    /// 容量足够时直接复用，不会重新分配
    pub fn ensure_capacity(&mut self, purpose: TransientPurpose, size: u64) -> GfxResult<GfxBufferHandle> {
        let old = self.entries.get(&purpose).copied();
        match old {
            Some(entry) if entry.capacity >= size => return Ok(entry.handle),
            Some(entry) => {
                self.entries.remove(&purpose);
                self.device.destroy_buffer(entry.handle);
            }
            None => {}
        }

        let capacity = size.max(MIN_TRANSIENT_CAPACITY);
        let handle = self.device.create_buffer(&purpose.buffer_desc(capacity))?;
        self.entries.insert(purpose, TransientEntry { handle, capacity });
        self.grow_count += 1;

        log::info!(
            "transient pool: {:?} grows {} -> {} bytes",
            purpose,
            old.map_or(0, |entry| entry.capacity),
            capacity
        );
        Ok(handle)
    }
}
