use std::marker::PhantomData;
use std::rc::Rc;

use anyhow::Context;
use strata_crate_tools::init_log::init_log;
use strata_gfx::commands::recorder::GfxCommandRecorder;
use strata_gfx::config::{BackendKind, GfxConfig};
use strata_gfx::device::GfxDevice;
use strata_gfx::frame_counter::FrameCounter;
use strata_gfx::host::device::HostDevice;
use strata_resource::render_core::RenderCore;

use crate::config::AppConfig;
use crate::outer_app::OuterApp;

pub fn panic_handler(info: &std::panic::PanicHookInfo) {
    log::error!("{}", info);
}

/// headless 应用主结构
///
/// 每一帧：update -> record -> 提交并等待 -> 切换到下一个 frame in flight
pub struct StrataApp<T: OuterApp> {
    _phantom: PhantomData<T>,
}

// 总的 main 函数
impl<T: OuterApp> StrataApp<T> {
    /// 整个程序的入口
    pub fn run() -> anyhow::Result<()> {
        std::panic::set_hook(Box::new(panic_handler));
        init_log();

        let config = AppConfig::load(std::env::args().nth(1))?;
        Self::run_with_config(&config)
    }

    pub fn run_with_config(config: &AppConfig) -> anyhow::Result<()> {
        let device = create_device(&config.gfx)?;
        let core = RenderCore::new(device);

        let mut outer_app = T::init(&core).context("failed to init app")?;
        let mut frame_counter = FrameCounter::new(0, core.device().frames_in_flight());

        for _ in 0..config.frame_count {
            outer_app.update(&core, &frame_counter)?;

            let mut cmd = GfxCommandRecorder::new(frame_counter.frame_name());
            outer_app.record(&mut cmd)?;
            core.device()
                .submit_and_wait(&cmd)
                .with_context(|| format!("failed to submit frame {}", frame_counter.frame_name()))?;
            log::debug!("{} submitted {} commands", frame_counter.frame_name(), cmd.commands().len());

            core.device().advance_frame();
            frame_counter.next_frame();
        }

        outer_app.shutdown(&core);
        core.device().wait_idle()?;
        log::info!("ran {} frames on `{}`", config.frame_count, core.device().name());
        Ok(())
    }
}

fn create_device(config: &GfxConfig) -> anyhow::Result<Rc<dyn GfxDevice>> {
    match config.backend {
        BackendKind::Host => Ok(Rc::new(HostDevice::new(config))),
        #[cfg(feature = "vulkan")]
        BackendKind::Vulkan => Ok(Rc::new(
            strata_gfx::vulkan::device::VulkanDevice::new(config).context("failed to create vulkan device")?,
        )),
        #[cfg(not(feature = "vulkan"))]
        BackendKind::Vulkan => anyhow::bail!("built without the `vulkan` feature"),
    }
}
