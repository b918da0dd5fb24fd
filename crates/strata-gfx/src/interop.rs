use crate::device::ExternalMemoryHandle;
use crate::error::GfxResult;

/// 导入到另一个 API 之后的内存
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ImportedMemory {
    pub id: u64,
    pub size: u64,
}

/// 另一个 API（例如 CUDA）导入外部内存的能力
///
/// 导入的内存在 `release` 之前一直有效；原始 buffer 重新分配之前必须先 `release`。
pub trait ExternalMemoryImporter {
    fn api_name(&self) -> &str;

    fn import(&self, handle: &ExternalMemoryHandle) -> GfxResult<ImportedMemory>;

    fn release(&self, memory: ImportedMemory);

    /// 返回另一个 API 地址空间中的指针
    fn map_pointer(&self, memory: &ImportedMemory, offset: u64, size: u64) -> GfxResult<u64>;
}
