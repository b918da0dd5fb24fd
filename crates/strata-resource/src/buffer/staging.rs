use strata_gfx::device::{GfxDeviceExt, check_range};
use strata_gfx::error::GfxResult;
use strata_gfx::resources::buffer_desc::{GfxBufferDesc, ResourceState};
use strata_gfx::resources::handles::GfxBufferHandle;

use crate::render_core::RenderCore;
use crate::transient_pool::TransientPurpose;

/// host -> staging -> `dst[offset..]`，阻塞直到拷贝完成
pub(crate) fn upload_via_staging(
    core: &RenderCore,
    dst: GfxBufferHandle,
    dst_size: u64,
    dst_state: ResourceState,
    data: &[u8],
    offset: u64,
) -> GfxResult<()> {
    let len = data.len() as u64;
    check_range(offset, len, dst_size)?;
    if data.is_empty() {
        return Ok(());
    }

    // staging 可能会被替换，替换前不能有 GPU 工作在读取它
    core.device().wait_idle()?;
    let staging = core.transient_buffer(TransientPurpose::UploadStaging, len)?;
    core.device().write_mapped(staging, 0, data)?;

    core.device()
        .one_time_exec(|cmd| cmd.copy_buffer_with_state(staging, dst, len, 0, offset, dst_state), "upload-buffer")
}

/// `src[offset..]` -> staging -> host，阻塞直到拷贝完成
pub(crate) fn download_via_staging(
    core: &RenderCore,
    src: GfxBufferHandle,
    src_size: u64,
    out: &mut [u8],
    offset: u64,
) -> GfxResult<()> {
    let len = out.len() as u64;
    check_range(offset, len, src_size)?;
    if out.is_empty() {
        return Ok(());
    }

    core.device().wait_idle()?;
    let staging = core.transient_buffer(TransientPurpose::ReadbackStaging, len)?;
    // readback buffer 一直处于 CopyDest，不需要 barrier
    core.device().one_time_exec(
        |cmd| cmd.copy_buffer_with_state(src, staging, len, offset, 0, ResourceState::CopyDest),
        "download-buffer",
    )?;
    core.device().read_mapped(staging, 0, out)
}

/// 按 `desc` 创建新的 buffer，并把旧 buffer 的前 `copy_size` 字节拷贝过去
///
/// 旧 buffer 由调用方释放；拷贝失败时新 buffer 会被释放
pub(crate) fn reallocate_with_copy(
    core: &RenderCore,
    old: GfxBufferHandle,
    copy_size: u64,
    desc: &GfxBufferDesc,
) -> GfxResult<GfxBufferHandle> {
    core.device().wait_idle()?;
    let new = core.device().create_buffer(desc)?;
    if copy_size == 0 {
        return Ok(new);
    }

    let copied = core.device().one_time_exec(
        |cmd| cmd.copy_buffer_with_state(old, new, copy_size, 0, 0, desc.initial_state),
        "resize-buffer",
    );
    if let Err(e) = copied {
        core.device().destroy_buffer(new);
        return Err(e);
    }
    Ok(new)
}
