use thiserror::Error;

use crate::types::PortState;

/// Transport-level failure, classified once at the SOCKS5 boundary.
/// Everything downstream (port-state mapping, domain-failure decisions)
/// matches on the variant, never on message text.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("connection refused")]
    Refused,

    #[error("timed out after {0}ms")]
    TimedOut(u64),

    #[error("host or network unreachable")]
    Unreachable,

    #[error("connection reset by peer")]
    Reset,

    #[error("socks rejection: {0}")]
    SocksRejected(String),

    #[error("proxy unavailable at {0}")]
    ProxyUnavailable(String),

    #[error("i/o error: {0}")]
    Io(String),
}

impl TransportError {
    /// Port-state classification for the scanner.
    pub fn port_state(&self) -> PortState {
        match self {
            TransportError::Refused => PortState::Closed,
            TransportError::TimedOut(_) => PortState::Timeout,
            TransportError::Unreachable
            | TransportError::Reset
            | TransportError::SocksRejected(_)
            | TransportError::ProxyUnavailable(_)
            | TransportError::Io(_) => PortState::Filtered,
        }
    }

    /// Whether this failure means the whole hidden service is unreachable,
    /// in which case the crawler fails every pending URL for the domain
    /// instead of retrying them one by one.
    pub fn is_connection_failure(&self) -> bool {
        matches!(
            self,
            TransportError::Refused
                | TransportError::TimedOut(_)
                | TransportError::Unreachable
                | TransportError::Reset
                | TransportError::SocksRejected(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn refused_maps_to_closed() {
        assert_eq!(TransportError::Refused.port_state(), PortState::Closed);
    }

    #[test]
    fn timeout_maps_to_timeout() {
        assert_eq!(TransportError::TimedOut(5000).port_state(), PortState::Timeout);
    }

    #[test]
    fn everything_else_maps_to_filtered() {
        for err in [
            TransportError::Unreachable,
            TransportError::Reset,
            TransportError::SocksRejected("general failure".into()),
            TransportError::Io("broken pipe".into()),
        ] {
            assert_eq!(err.port_state(), PortState::Filtered);
        }
    }

    #[test]
    fn io_errors_are_not_domain_failures() {
        assert!(!TransportError::Io("short write".into()).is_connection_failure());
        assert!(TransportError::Refused.is_connection_failure());
        assert!(TransportError::Unreachable.is_connection_failure());
    }
}
