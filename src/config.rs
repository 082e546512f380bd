use std::time::Duration;

use crate::error::ProtocolError;

/// Tunables for a [MessageSystem](crate::message_system::MessageSystem). The
///  defaults reproduce the wire-compatible behavior of the simulator protocol;
///  deployments on unusual networks mostly adjust the timeouts.
#[derive(Debug, Clone)]
pub struct MessageConfig {
    /// Upper bound on concurrent circuits. Creating a circuit for a new host
    ///  beyond this fails with `CapacityExceeded`.
    pub max_circuits: usize,

    /// How long a reliable packet may stay unacknowledged before it is
    ///  promoted to the retry queue.
    pub resend_timeout: Duration,

    /// Number of transmissions after which a reliable packet is given up on
    ///  and counted as lost.
    pub retry_limit: u32,

    /// A circuit that has received nothing for this long is declared dead and
    ///  reaped on the next sweep.
    pub circuit_idle_timeout: Duration,

    /// Master switch for the timeout sweep. With this off, packets never time
    ///  out and circuits never die; useful when stepping through traffic in a
    ///  debugger.
    pub allow_timeout: bool,

    /// Datagrams larger than this are rejected at build time. Must fit the
    ///  path MTU since the protocol does not fragment.
    pub max_datagram_size: usize,

    /// When set, inbound headers with reserved flag bits are dropped as
    ///  malformed instead of having the bits ignored.
    pub strict_flags: bool,

    /// Answer inbound StartPingCheck messages with a CompletePingCheck
    ///  echoing the ping id.
    pub auto_respond_pings: bool,
}

impl Default for MessageConfig {
    fn default() -> MessageConfig {
        MessageConfig {
            max_circuits: 256,
            resend_timeout: Duration::from_secs(5),
            retry_limit: 3,
            circuit_idle_timeout: Duration::from_secs(60),
            allow_timeout: true,
            max_datagram_size: 1472,
            strict_flags: false,
            auto_respond_pings: true,
        }
    }
}

impl MessageConfig {
    pub fn validate(&self) -> Result<(), ProtocolError> {
        if self.max_circuits == 0 {
            return Err(ProtocolError::Config("max_circuits must be at least 1"));
        }
        if self.retry_limit == 0 {
            return Err(ProtocolError::Config("retry_limit must be at least 1"));
        }
        if self.max_datagram_size < 100 {
            return Err(ProtocolError::Config("max_datagram_size is too small"));
        }
        if self.resend_timeout >= self.circuit_idle_timeout {
            return Err(ProtocolError::Config(
                "resend_timeout must be shorter than circuit_idle_timeout",
            ));
        }
        Ok(())
    }
}
