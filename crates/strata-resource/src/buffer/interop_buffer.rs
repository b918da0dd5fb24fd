use std::rc::Rc;

use strata_gfx::error::{GfxError, GfxResult};
use strata_gfx::interop::{ExternalMemoryImporter, ImportedMemory};
use strata_gfx::resources::buffer_desc::{GfxBufferDesc, ResourceState};
use strata_gfx::resources::handles::GfxBufferHandle;

use crate::buffer::staging::{download_via_staging, reallocate_with_copy, upload_via_staging};
use crate::buffer::{BufferType, GpuBuffer, allocation_size};
use crate::render_core::RenderCore;

/// 可以导出给另一个 API 的 GPU 本地 buffer
///
/// upload、download 与 [`super::static_buffer::StaticBuffer`] 相同，都是同步的。
/// resize 时先释放旧的导入，再重新分配并重新导入；在此期间另一个 API 不能访问旧的指针。
pub struct InteropBuffer {
    core: Rc<RenderCore>,
    importer: Rc<dyn ExternalMemoryImporter>,

    buffer: GfxBufferHandle,
    /// 只有 resize 失败且无法恢复时才会是 None
    imported: Option<ImportedMemory>,

    size: u64,
    name: String,
}

// init & destroy
impl InteropBuffer {
    const RESTING_STATE: ResourceState = ResourceState::GenericRead;

    pub fn new(
        core: Rc<RenderCore>,
        size: u64,
        importer: Rc<dyn ExternalMemoryImporter>,
        name: impl Into<String>,
    ) -> GfxResult<Self> {
        let name = name.into();
        let buffer = core.device().create_buffer(&Self::buffer_desc(size, &name))?;
        let imported = match Self::export_and_import(&core, importer.as_ref(), buffer) {
            Ok(imported) => imported,
            Err(e) => {
                core.device().destroy_buffer(buffer);
                return Err(e);
            }
        };

        log::info!("interop buffer `{}` created: {} bytes, shared with {}", name, size, importer.api_name());
        Ok(Self {
            core,
            importer,
            buffer,
            imported: Some(imported),
            size,
            name,
        })
    }

    fn buffer_desc(size: u64, name: &str) -> GfxBufferDesc {
        GfxBufferDesc::shared(allocation_size(size), name).with_state(Self::RESTING_STATE)
    }

    fn export_and_import(
        core: &RenderCore,
        importer: &dyn ExternalMemoryImporter,
        buffer: GfxBufferHandle,
    ) -> GfxResult<ImportedMemory> {
        let handle = core.device().export_memory_handle(buffer)?;
        importer.import(&handle)
    }
}

impl Drop for InteropBuffer {
    fn drop(&mut self) {
        if let Some(imported) = self.imported.take() {
            self.importer.release(imported);
        }
        self.core.device().destroy_buffer(self.buffer);
    }
}

// getter
impl InteropBuffer {
    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn imported_memory(&self) -> Option<ImportedMemory> {
        self.imported
    }

    /// 整个 buffer 在另一个 API 地址空间中的指针，每次调用时重新映射
    pub fn external_pointer(&self) -> GfxResult<u64> {
        let imported = self.imported.as_ref().ok_or_else(|| GfxError::Interop {
            reason: format!("interop buffer `{}` has no live import", self.name),
            diagnostic: None,
        })?;
        self.importer.map_pointer(imported, 0, self.size)
    }
}

impl GpuBuffer for InteropBuffer {
    fn buffer_type(&self) -> BufferType {
        BufferType::Interop
    }

    fn size(&self) -> u64 {
        self.size
    }

    fn resize(&mut self, new_size: u64) -> GfxResult<()> {
        // 重新分配之前，旧的导入必须先失效
        if let Some(imported) = self.imported.take() {
            self.importer.release(imported);
        }

        let desc = Self::buffer_desc(new_size, &self.name);
        let reallocated = reallocate_with_copy(&self.core, self.buffer, self.size.min(new_size), &desc)
            .and_then(|new_buffer| {
                match Self::export_and_import(&self.core, self.importer.as_ref(), new_buffer) {
                    Ok(imported) => Ok((new_buffer, imported)),
                    Err(e) => {
                        self.core.device().destroy_buffer(new_buffer);
                        Err(e)
                    }
                }
            });

        match reallocated {
            Ok((new_buffer, imported)) => {
                self.core.device().destroy_buffer(self.buffer);
                self.buffer = new_buffer;
                self.imported = Some(imported);
                log::debug!("interop buffer `{}` resized: {} -> {} bytes", self.name, self.size, new_size);
                self.size = new_size;
                Ok(())
            }
            Err(e) => {
                // 旧 buffer 仍然有效，尝试恢复它的导入
                self.imported = Self::export_and_import(&self.core, self.importer.as_ref(), self.buffer)
                    .inspect_err(|restore| {
                        log::error!("interop buffer `{}` lost its import: {}", self.name, restore);
                    })
                    .ok();
                Err(e)
            }
        }
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
