//! GPU 资源的生命周期管理
//!
//! - [`buffer`]：buffer 的三种形态，调用方只持有 [`buffer::GpuBuffer`]
//! - [`transient_pool`]：scratch、instance 以及 staging buffer 的复用池
//! - [`acceleration`]：同步构建 BLAS 和 TLAS
//! - [`shader_table`]：shader table 的布局与填充
//! - [`render_core`]：持有设备和复用池的资源工厂

pub mod acceleration;
pub mod buffer;
pub mod render_core;
pub mod shader_table;
pub mod transient_pool;
