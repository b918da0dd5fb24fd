use std::cell::RefCell;
use std::rc::Rc;

use strata_gfx::device::GfxDevice;
use strata_gfx::error::GfxResult;
use strata_gfx::interop::ExternalMemoryImporter;
use strata_gfx::raytracing::geometry::GeometryDesc;
use strata_gfx::raytracing::pipeline::GfxRayTracingPipeline;
use strata_gfx::resources::handles::GfxBufferHandle;

use crate::acceleration::{GfxAcceleration, TlasInstance};
use crate::buffer::GpuBuffer;
use crate::buffer::dynamic_buffer::DynamicBuffer;
use crate::buffer::interop_buffer::InteropBuffer;
use crate::buffer::static_buffer::StaticBuffer;
use crate::shader_table::GfxShaderTable;
use crate::transient_pool::{TransientBufferPool, TransientPurpose};

/// 资源工厂，持有设备以及临时 buffer 池
///
/// buffer 会持有 `Rc<RenderCore>`，因此 RenderCore 总是比它创建的 buffer 活得更久。
pub struct RenderCore {
    device: Rc<dyn GfxDevice>,

    /// scratch、instance 以及 staging buffer 都从这里借用
    transient_pool: RefCell<TransientBufferPool>,
}

// new & init
impl RenderCore {
    pub fn new(device: Rc<dyn GfxDevice>) -> Rc<Self> {
        log::info!("render core on `{}`, {} frames in flight", device.name(), device.frames_in_flight());
        Rc::new(Self {
            transient_pool: RefCell::new(TransientBufferPool::new(device.clone())),
            device,
        })
    }
}

// getter
impl RenderCore {
    #[inline]
    pub fn device(&self) -> &dyn GfxDevice {
        self.device.as_ref()
    }

    #[inline]
    pub fn device_rc(&self) -> Rc<dyn GfxDevice> {
        self.device.clone()
    }

    #[inline]
    pub fn transient_capacity(&self, purpose: TransientPurpose) -> u64 {
        self.transient_pool.borrow().capacity(purpose)
    }

    #[inline]
    pub fn transient_grow_count(&self) -> u64 {
        self.transient_pool.borrow().grow_count()
    }
}

// tools
impl RenderCore {
    /// 从池中借用一个容量足够的临时 buffer，详见 [`TransientBufferPool::ensure_capacity`]
    pub fn transient_buffer(&self, purpose: TransientPurpose, size: u64) -> GfxResult<GfxBufferHandle> {
        self.transient_pool.borrow_mut().ensure_capacity(purpose, size)
    }
}

// factory
impl RenderCore {
    pub fn create_static_buffer(self: &Rc<Self>, size: u64, name: impl Into<String>) -> GfxResult<Box<dyn GpuBuffer>> {
        Ok(Box::new(StaticBuffer::new(self.clone(), size, name)?))
    }

    pub fn create_dynamic_buffer(self: &Rc<Self>, size: u64, name: impl Into<String>) -> GfxResult<Box<dyn GpuBuffer>> {
        Ok(Box::new(DynamicBuffer::new(self.clone(), size, name)?))
    }

    pub fn create_interop_buffer(
        self: &Rc<Self>,
        size: u64,
        importer: Rc<dyn ExternalMemoryImporter>,
        name: impl Into<String>,
    ) -> GfxResult<InteropBuffer> {
        InteropBuffer::new(self.clone(), size, importer, name)
    }

    pub fn build_blas(&self, geometry: &GeometryDesc, name: &str) -> GfxResult<GfxAcceleration> {
        GfxAcceleration::build_blas_sync(self, geometry, name)
    }

    pub fn build_tlas(&self, instances: &[TlasInstance<'_>], name: &str) -> GfxResult<GfxAcceleration> {
        GfxAcceleration::build_tlas_sync(self, instances, name)
    }

    pub fn create_shader_table(
        &self,
        pipeline: &dyn GfxRayTracingPipeline,
        miss_indices: &[usize],
        hit_group_indices: &[usize],
        callable_indices: &[usize],
        name: &str,
    ) -> GfxResult<GfxShaderTable> {
        GfxShaderTable::new(self, pipeline, miss_indices, hit_group_indices, callable_indices, name)
    }
}
