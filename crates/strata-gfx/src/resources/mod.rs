pub mod buffer_desc;
pub mod handles;
