use std::cell::{Cell, RefCell};
use std::collections::HashMap;

use crate::device::{ExternalHandleKind, ExternalMemoryHandle};
use crate::error::{GfxError, GfxResult};
use crate::interop::{ExternalMemoryImporter, ImportedMemory};

/// 模拟的第二个 API，记录每一次导入
#[derive(Default)]
pub struct HostExternalImporter {
    imports: RefCell<HashMap<u64, ExternalMemoryHandle>>,
    next_id: Cell<u64>,
    import_count: Cell<u64>,
    release_count: Cell<u64>,
}

impl HostExternalImporter {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn live_imports(&self) -> usize {
        self.imports.borrow().len()
    }

    #[inline]
    pub fn import_count(&self) -> u64 {
        self.import_count.get()
    }

    #[inline]
    pub fn release_count(&self) -> u64 {
        self.release_count.get()
    }
}

impl ExternalMemoryImporter for HostExternalImporter {
    fn api_name(&self) -> &str {
        "host-interop"
    }

    fn import(&self, handle: &ExternalMemoryHandle) -> GfxResult<ImportedMemory> {
        if !matches!(handle.kind, ExternalHandleKind::HostToken(_)) {
            return Err(GfxError::Interop {
                reason: "unsupported external handle".to_string(),
                diagnostic: Some(format!("host importer cannot import {:?}", handle.kind)),
            });
        }

        let id = self.next_id.get() + 1;
        self.next_id.set(id);
        self.import_count.set(self.import_count.get() + 1);
        self.imports.borrow_mut().insert(id, *handle);

        Ok(ImportedMemory { id, size: handle.size })
    }

    fn release(&self, memory: ImportedMemory) {
        if self.imports.borrow_mut().remove(&memory.id).is_some() {
            self.release_count.set(self.release_count.get() + 1);
        } else {
            log::warn!("host importer: release of unknown import {}", memory.id);
        }
    }

    fn map_pointer(&self, memory: &ImportedMemory, offset: u64, size: u64) -> GfxResult<u64> {
        let imports = self.imports.borrow();
        let handle = imports.get(&memory.id).ok_or_else(|| GfxError::Interop {
            reason: format!("import {} has been released", memory.id),
            diagnostic: None,
        })?;
        crate::device::check_range(offset, size, handle.size)?;

        match handle.kind {
            ExternalHandleKind::HostToken(base) => Ok(base + offset),
            other => Err(GfxError::Interop {
                reason: format!("cannot map {other:?}"),
                diagnostic: None,
            }),
        }
    }
}
