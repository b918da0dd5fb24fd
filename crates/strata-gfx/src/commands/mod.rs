pub mod command;
pub mod recorder;
