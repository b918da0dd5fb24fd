use std::rc::Rc;

use strata_gfx::commands::recorder::GfxCommandRecorder;
use strata_gfx::frame_counter::FrameCounter;
use strata_resource::render_core::RenderCore;

/// 外部应用接口 trait
///
/// # 开发模式
/// ```ignore
/// struct MyApp { buffer: Box<dyn GpuBuffer> }
///
/// impl OuterApp for MyApp {
///     fn init(core: &Rc<RenderCore>) -> anyhow::Result<Self> {
///         Ok(Self { buffer: core.create_dynamic_buffer(64, "my-buffer")? })
///     }
///
///     fn record(&mut self, cmd: &mut GfxCommandRecorder) -> anyhow::Result<()> {
///         Ok(self.buffer.transfer_data(cmd)?)
///     }
/// }
///
/// fn main() -> anyhow::Result<()> {
///     StrataApp::<MyApp>::run()
/// }
/// ```
pub trait OuterApp: Sized {
    /// 初始化应用，设备和资源工厂已经就绪
    fn init(core: &Rc<RenderCore>) -> anyhow::Result<Self>;

    /// 每帧更新逻辑，host 侧的写入放在这里（可选）
    fn update(&mut self, _core: &Rc<RenderCore>, _frame: &FrameCounter) -> anyhow::Result<()> {
        Ok(())
    }

    /// 录制当前帧的命令，发生于 update 之后，提交之前
    fn record(&mut self, cmd: &mut GfxCommandRecorder) -> anyhow::Result<()>;

    /// 退出前调用（可选）
    fn shutdown(&mut self, _core: &Rc<RenderCore>) {}
}
