use std::time::Duration;

use anyhow::bail;

/// Tunables for endpoints and connections.
///
/// Both peers must agree on the wire-level constants in [crate::segment]; the
///  values here only shape timing and windowing and may differ between peers.
#[derive(Debug, Clone)]
pub struct Config {
    /// Number of transaction slots per connection, i.e. the maximum number of
    ///  concurrently in-flight messages per direction. Transaction ids on the
    ///  wire must be below this value.
    pub trans_slots: u16,

    /// Maximum number of segments transmitted per send round before the sender
    ///  stops and waits for the receiver's state.
    pub send_window: usize,

    /// Maximum number of send rounds (initial transmission plus
    ///  query-and-retransmit cycles) before `send_msg` gives up.
    pub send_max_rounds: usize,

    /// How long a send round waits for the peer's `Received` receipt before
    ///  querying for gaps.
    pub sending_timeout: Duration,

    /// Per-attempt timeout of the query-receive RPC; an expired attempt
    ///  retransmits the request.
    pub request_attempt_timeout: Duration,

    /// Maximum number of query-receive transmissions per RPC.
    pub request_max_attempts: usize,

    /// Overall deadline of the query-receive RPC across all attempts.
    pub request_timeout: Duration,

    /// Interval of the client's keepalive ping loop.
    pub ping_interval: Duration,

    /// How long a single ping waits for its reply.
    pub ping_timeout: Duration,

    /// Connections without inbound traffic for longer than this are reaped by
    ///  the pool's garbage collection.
    pub conn_timeout: Duration,

    /// Interval of the garbage-collection loop.
    pub gc_interval: Duration,

    /// Cadence at which a failed client handshake is retried. Also bounds the
    ///  wait for the handshake reply.
    pub handshake_retry: Duration,

    /// Polling interval while all outbound transaction slots are taken.
    pub slot_poll_interval: Duration,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            trans_slots: 10,
            send_window: 1024,
            send_max_rounds: 99,
            sending_timeout: Duration::from_secs(1),
            request_attempt_timeout: Duration::from_secs(1),
            request_max_attempts: 99,
            request_timeout: Duration::from_secs(12),
            ping_interval: Duration::from_secs(6),
            ping_timeout: Duration::from_secs(3),
            conn_timeout: Duration::from_secs(30),
            gc_interval: Duration::from_secs(10),
            handshake_retry: Duration::from_secs(6),
            slot_poll_interval: Duration::from_millis(100),
        }
    }
}

impl Config {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.trans_slots == 0 {
            bail!("at least one transaction slot is required");
        }
        if self.send_window == 0 {
            bail!("send window must be positive");
        }
        if self.send_max_rounds == 0 {
            bail!("at least one send round is required");
        }
        if self.request_attempt_timeout > self.request_timeout {
            bail!("per-attempt timeout exceeds the overall request deadline");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_zero_slots() {
        let config = Config {
            trans_slots: 0,
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_inverted_timeouts() {
        let config = Config {
            request_attempt_timeout: Duration::from_secs(20),
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }
}
