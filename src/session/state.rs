//! Session lifecycle states

use std::fmt;

/// Lifecycle of a relay session.
///
/// ```text
/// AwaitingDevice --attach--> Paired --close--> Closing --> Closed
///        |                                        ^
///        +---------------close/timeout------------+
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Client side present, device has not dialed back yet
    AwaitingDevice,
    /// Both sides attached, bytes flowing
    Paired,
    /// Teardown in progress
    Closing,
    /// Fully torn down and removed from the registry
    Closed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionState::AwaitingDevice => "awaiting-device",
            SessionState::Paired => "paired",
            SessionState::Closing => "closing",
            SessionState::Closed => "closed",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    ClientClosed,
    DeviceClosed,
    /// Either transport failed mid-stream
    TransportError(String),
    /// Device offline or the dial-back request timed out
    DeviceUnreachable(String),
    /// Dial-back request was answered with an error
    DeviceRejected(String),
    /// Device never attached inside the window
    AttachTimeout,
    /// Pending bytes exceeded the bound before the device attached
    BufferOverflow { attempted: usize, limit: usize },
    Shutdown,
}

impl CloseReason {
    /// Line shown to the client when a session dies before pairing.
    pub fn diagnostic(&self) -> Option<String> {
        match self {
            CloseReason::DeviceUnreachable(detail) => {
                Some(format!("Device unreachable: {}\r\n", detail))
            }
            CloseReason::DeviceRejected(detail) => {
                Some(format!("Device rejected the connection: {}\r\n", detail))
            }
            CloseReason::AttachTimeout => {
                Some("Device unreachable: it did not connect back in time\r\n".to_string())
            }
            CloseReason::BufferOverflow { limit, .. } => Some(format!(
                "Connection closed: more than {} bytes buffered while waiting for the device\r\n",
                limit
            )),
            _ => None,
        }
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseReason::ClientClosed => write!(f, "client closed"),
            CloseReason::DeviceClosed => write!(f, "device closed"),
            CloseReason::TransportError(e) => write!(f, "transport error: {}", e),
            CloseReason::DeviceUnreachable(e) => write!(f, "device unreachable: {}", e),
            CloseReason::DeviceRejected(e) => write!(f, "device rejected: {}", e),
            CloseReason::AttachTimeout => write!(f, "device did not attach in time"),
            CloseReason::BufferOverflow { attempted, limit } => {
                write!(f, "buffer overflow ({} > {})", attempted, limit)
            }
            CloseReason::Shutdown => write!(f, "relay shutting down"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_diagnostics_only_for_failures() {
        assert!(CloseReason::ClientClosed.diagnostic().is_none());
        assert!(CloseReason::DeviceClosed.diagnostic().is_none());
        let line = CloseReason::DeviceUnreachable("device is offline".into())
            .diagnostic()
            .unwrap();
        assert!(line.contains("device is offline"));
        assert!(line.ends_with("\r\n"));
        assert!(CloseReason::DeviceRejected("HTTP 500".into())
            .diagnostic()
            .unwrap()
            .starts_with("Device rejected the connection: HTTP 500"));
        assert!(CloseReason::BufferOverflow { attempted: 10, limit: 8 }
            .diagnostic()
            .unwrap()
            .contains('8'));
    }

    #[test]
    fn test_state_display() {
        assert_eq!(SessionState::AwaitingDevice.to_string(), "awaiting-device");
        assert_eq!(SessionState::Closed.to_string(), "closed");
    }
}
