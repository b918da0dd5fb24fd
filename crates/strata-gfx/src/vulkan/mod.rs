//! 基于 ash + vk-mem 的后端
//!
//! 需要 Vulkan 1.3 以及下面这些扩展：
//! - `VK_KHR_acceleration_structure`
//! - `VK_KHR_ray_tracing_pipeline`
//! - `VK_KHR_deferred_host_operations`
//! - `VK_KHR_external_memory_fd`（仅 unix，用于 Shared buffer 的导出）

mod convert;
pub mod device;
pub mod pipeline;
