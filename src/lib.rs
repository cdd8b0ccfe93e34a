//! Remote file access over a single multiplexed TCP connection.
//!
//! A [`FileServer`](server::server::FileServer) exposes its local file system;
//! a [`RemoteFsClient`](client::client::RemoteFsClient) connects to it and
//! gets stream handles, whole-file transfers and path-based metadata
//! operations. Any number of streams and requests share one connection,
//! correlated by sequence numbers.
//!
//! Every frame on the wire looks like this (all integers big endian):
//! ```ascii
//! 0:  marker "_RFS" (4 ASCII bytes)
//! 4:  sequence number (u16, never 0)
//! 6:  reply-to (u16), 0 for requests
//! 8:  message tag (u16)
//! 10: body length (u32)
//! 14: body
//! ```
//!
//! Requests are answered with a frame whose reply-to carries the request's
//! sequence number. Replies to different requests may arrive in any order;
//! bulk transfers interleave with small requests on the same connection.
//! The only messages a peer sends unprompted are liveness pings from an idle
//! provider, which the client answers automatically.

pub mod client;
pub mod compress;
pub mod config;
pub mod correlation;
pub mod protocol;
pub mod server;

pub use client::client::{RemoteFsClient, SpontaneousHandler};
pub use client::remote_file::RemoteFile;
pub use client::remote_stream::{RemoteReader, RemoteWriter, StreamStats};
pub use config::{ClientConfig, ServerConfig};
pub use protocol::file_attrs::{FileAttributes, FileFlags};
pub use server::server::FileServer;

#[cfg(test)]
mod tests {
    use tracing::Level;

    #[ctor::ctor]
    fn init_test_logging() {
        tracing_subscriber::fmt()
            .with_test_writer()
            .with_max_level(Level::DEBUG)
            .try_init()
            .ok();
    }
}
