//! 应用框架层
//!
//! 提供基于 [`outer_app::OuterApp`] trait 的 headless 应用开发模式。
//! 开发者只需实现 [`outer_app::OuterApp`]，即可在配置好的后端上逐帧运行。

pub mod app;
pub mod config;
pub mod outer_app;
