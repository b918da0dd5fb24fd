pub mod geometry;
pub mod instance;
pub mod pipeline;
