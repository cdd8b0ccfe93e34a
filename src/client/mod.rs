pub mod client;
pub mod remote_file;
pub mod remote_stream;
