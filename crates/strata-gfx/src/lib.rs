//! Strata 的 GFX 层
//!
//! 资源层只和 [`device::GfxDevice`] 打交道，不关心背后是哪个后端：
//! - [`host`]：在 host 内存中模拟 GPU，总是可用
//! - `vulkan`：基于 ash + vk-mem，需要开启 `vulkan` feature
//!
//! 所有同步的 GPU 操作都通过 [`device::GfxDeviceExt::one_time_exec`] 完成。

pub mod commands;
pub mod config;
pub mod device;
pub mod error;
pub mod frame_counter;
pub mod host;
pub mod interop;
pub mod raytracing;
pub mod resources;

#[cfg(feature = "vulkan")]
pub mod vulkan;
