//! Tuning knobs for client and provider. The defaults are meant to work out
//! of the box on a LAN; `validate()` catches settings that cannot work at all.

use std::time::Duration;

use anyhow::bail;

use crate::compress::MAX_DEFLATE;

/// Upper bound on a single frame body. Anything bigger is treated as stream
/// corruption by the frame decoder.
pub const DEFAULT_MAX_FRAME_BODY: usize = 16 * 1024 * 1024;

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub connect_timeout: Duration,
    /// Upper bound on waiting for any single reply (and on each chunk of a
    /// bulk transfer). A provider that goes silent turns into an error after
    /// this long instead of a caller blocked forever.
    pub request_timeout: Duration,
    /// Default deflate level for streams opened through this client, 0 turns
    /// compression off.
    pub deflate: u8,
    /// Chunk size for bulk transfers.
    pub mtu: usize,
    pub max_frame_body: usize,
}

impl Default for ClientConfig {
    fn default() -> ClientConfig {
        ClientConfig {
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(30),
            deflate: 0,
            mtu: 8 * 1024,
            max_frame_body: DEFAULT_MAX_FRAME_BODY,
        }
    }
}

impl ClientConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.deflate > MAX_DEFLATE {
            bail!("deflate level {} exceeds {}", self.deflate, MAX_DEFLATE);
        }
        if self.mtu < 256 {
            bail!("mtu of {} bytes is below the minimum of 256", self.mtu);
        }
        if self.mtu > self.max_frame_body {
            bail!("mtu must fit into a single frame body");
        }
        if self.request_timeout.is_zero() {
            bail!("request timeout must be non-zero");
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// A session idle for this long gets a liveness ping.
    pub idle_ping_threshold: Duration,
    /// An unanswered ping for this long force-closes the session.
    pub ping_timeout: Duration,
    /// Granularity of the session loop's idle checks.
    pub read_timeout: Duration,
    pub max_frame_body: usize,
}

impl Default for ServerConfig {
    fn default() -> ServerConfig {
        ServerConfig {
            idle_ping_threshold: Duration::from_secs(5 * 60),
            ping_timeout: Duration::from_secs(5),
            read_timeout: Duration::from_secs(1),
            max_frame_body: DEFAULT_MAX_FRAME_BODY,
        }
    }
}

impl ServerConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.read_timeout.is_zero() {
            bail!("read timeout must be non-zero");
        }
        if self.ping_timeout < self.read_timeout {
            bail!("ping timeout below read timeout makes every ping fail");
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        ClientConfig::default().validate().unwrap();
        ServerConfig::default().validate().unwrap();
    }

    #[test]
    fn test_client_validation() {
        let mut config = ClientConfig {
            deflate: 10,
            ..ClientConfig::default()
        };
        assert!(config.validate().is_err());

        config.deflate = 9;
        config.mtu = 16;
        assert!(config.validate().is_err());

        config.mtu = 1024;
        config.max_frame_body = 512;
        assert!(config.validate().is_err());

        config.max_frame_body = DEFAULT_MAX_FRAME_BODY;
        config.request_timeout = Duration::ZERO;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_server_validation() {
        let config = ServerConfig {
            ping_timeout: Duration::from_millis(100),
            read_timeout: Duration::from_secs(1),
            ..ServerConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
