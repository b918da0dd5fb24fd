use crate::raytracing::geometry::AccelerationBuildInputs;
use crate::resources::buffer_desc::ResourceState;
use crate::resources::handles::{GfxAccelerationHandle, GfxBufferHandle};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferCopyRegion {
    pub src_offset: u64,
    pub dst_offset: u64,
    pub size: u64,
}

/// 录制下来、等待提交的命令
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GfxCommand {
    CopyBuffer {
        src: GfxBufferHandle,
        dst: GfxBufferHandle,
        region: BufferCopyRegion,
    },
    Transition {
        buffer: GfxBufferHandle,
        before: ResourceState,
        after: ResourceState,
    },
    BuildAcceleration {
        inputs: AccelerationBuildInputs,
        dst: GfxAccelerationHandle,
        scratch: GfxBufferHandle,
    },
}
