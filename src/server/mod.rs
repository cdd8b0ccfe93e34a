pub mod provider;
pub mod server;
