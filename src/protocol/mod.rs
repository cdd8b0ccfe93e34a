pub mod file_attrs;
pub mod frame;
pub mod message;
pub mod wire;
