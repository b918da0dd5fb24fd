//! 在 host 内存中模拟 GPU 的后端
//!
//! 拷贝和构建都在提交时立即执行，同时检查调用方声明的资源状态是否正确，
//! 并提供失败注入和内部状态查询，供测试和 headless 运行使用。

pub mod device;
pub mod importer;
pub mod pipeline;
