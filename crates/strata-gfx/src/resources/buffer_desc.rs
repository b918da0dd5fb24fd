use bitflags::bitflags;

/// buffer 所在的内存类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemoryClass {
    /// GPU 本地内存，host 不可见
    DeviceLocal,
    /// host 可写，用于上传
    Upload,
    /// host 可读，用于回读
    Readback,
    /// GPU 本地内存，可以导出给另一个 API 使用
    Shared,
}

impl MemoryClass {
    /// 是否允许 host 直接 map
    #[inline]
    pub fn is_host_visible(self) -> bool {
        matches!(self, MemoryClass::Upload | MemoryClass::Readback)
    }

    /// 各个内存类型创建后的默认状态
    pub fn default_state(self) -> ResourceState {
        match self {
            MemoryClass::DeviceLocal | MemoryClass::Upload | MemoryClass::Shared => ResourceState::GenericRead,
            MemoryClass::Readback => ResourceState::CopyDest,
        }
    }
}

/// 由调用方声明的资源状态，不做自动追踪
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceState {
    Common,
    GenericRead,
    CopySource,
    CopyDest,
    UnorderedAccess,
    AccelerationStructure,
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct BufferUsage: u32 {
        const TRANSFER_SRC = 1 << 0;
        const TRANSFER_DST = 1 << 1;
        const STORAGE = 1 << 2;
        const DEVICE_ADDRESS = 1 << 3;
        /// 用作加速结构的结果 buffer
        const ACCELERATION_STORAGE = 1 << 4;
        /// 用作加速结构构建的输入（顶点、索引、AABB、instance）
        const ACCELERATION_INPUT = 1 << 5;
        const SHADER_BINDING_TABLE = 1 << 6;
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GfxBufferDesc {
    pub size: u64,
    pub memory: MemoryClass,
    pub initial_state: ResourceState,
    pub usage: BufferUsage,
    pub name: String,
}

// constructors
impl GfxBufferDesc {
    pub fn new(size: u64, memory: MemoryClass, usage: BufferUsage, name: impl Into<String>) -> Self {
        Self {
            size,
            memory,
            initial_state: memory.default_state(),
            usage,
            name: name.into(),
        }
    }

    /// 普通的 GPU buffer，可以作为拷贝的源和目标
    pub fn device_local(size: u64, name: impl Into<String>) -> Self {
        Self::new(
            size,
            MemoryClass::DeviceLocal,
            BufferUsage::TRANSFER_SRC
                | BufferUsage::TRANSFER_DST
                | BufferUsage::STORAGE
                | BufferUsage::DEVICE_ADDRESS
                | BufferUsage::ACCELERATION_INPUT,
            name,
        )
    }

    pub fn upload(size: u64, name: impl Into<String>) -> Self {
        Self::new(size, MemoryClass::Upload, BufferUsage::TRANSFER_SRC | BufferUsage::DEVICE_ADDRESS, name)
    }

    pub fn readback(size: u64, name: impl Into<String>) -> Self {
        Self::new(size, MemoryClass::Readback, BufferUsage::TRANSFER_DST, name)
    }

    pub fn shared(size: u64, name: impl Into<String>) -> Self {
        Self::new(
            size,
            MemoryClass::Shared,
            BufferUsage::TRANSFER_SRC | BufferUsage::TRANSFER_DST | BufferUsage::STORAGE | BufferUsage::DEVICE_ADDRESS,
            name,
        )
    }

    #[inline]
    pub fn with_state(mut self, state: ResourceState) -> Self {
        self.initial_state = state;
        self
    }
}
