use crate::commands::command::{BufferCopyRegion, GfxCommand};
use crate::raytracing::geometry::AccelerationBuildInputs;
use crate::resources::buffer_desc::ResourceState;
use crate::resources::handles::{GfxAccelerationHandle, GfxBufferHandle};

/// 命令录制器，只负责收集命令，由设备在提交时翻译成真正的 GPU 命令
#[derive(Debug, Default)]
pub struct GfxCommandRecorder {
    name: String,
    commands: Vec<GfxCommand>,
}

// init
impl GfxCommandRecorder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            commands: Vec::new(),
        }
    }
}

// getter
impl GfxCommandRecorder {
    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn commands(&self) -> &[GfxCommand] {
        &self.commands
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }
}

// commands
impl GfxCommandRecorder {
    /// - command type: action
    /// - 不处理任何状态转换
    pub fn cmd_copy_buffer(&mut self, src: GfxBufferHandle, dst: GfxBufferHandle, regions: &[BufferCopyRegion]) {
        self.commands.extend(regions.iter().map(|region| GfxCommand::CopyBuffer {
            src,
            dst,
            region: *region,
        }));
    }

    /// - command type: sync
    pub fn transition(&mut self, buffer: GfxBufferHandle, before: ResourceState, after: ResourceState) {
        if before == after {
            return;
        }
        self.commands.push(GfxCommand::Transition { buffer, before, after });
    }

    /// 拷贝前把 dst 转换到 CopyDest，拷贝后再转换回 `dst_original_state`
    ///
    /// dst 本来就处于 CopyDest（例如 readback buffer）时不需要任何 barrier
    pub fn copy_buffer_with_state(
        &mut self,
        src: GfxBufferHandle,
        dst: GfxBufferHandle,
        size: u64,
        src_offset: u64,
        dst_offset: u64,
        dst_original_state: ResourceState,
    ) {
        let region = BufferCopyRegion {
            src_offset,
            dst_offset,
            size,
        };
        self.transition(dst, dst_original_state, ResourceState::CopyDest);
        self.cmd_copy_buffer(src, dst, std::slice::from_ref(&region));
        self.transition(dst, ResourceState::CopyDest, dst_original_state);
    }

    /// - command type: action
    /// - scratch buffer 必须处于 UnorderedAccess
    pub fn cmd_build_acceleration_structure(
        &mut self,
        inputs: &AccelerationBuildInputs,
        dst: GfxAccelerationHandle,
        scratch: GfxBufferHandle,
    ) {
        self.commands.push(GfxCommand::BuildAcceleration {
            inputs: *inputs,
            dst,
            scratch,
        });
    }

    /// 提交之后清空，录制器可以复用
    pub fn reset(&mut self) {
        self.commands.clear();
    }
}
