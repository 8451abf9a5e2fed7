use super::connection::ArenaState;
use super::message::ConnectionId;
use super::transport::PeerAddr;

#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    ConnectionAccepted {
        connection_id: ConnectionId,
        addr: PeerAddr,
    },
    ConnectionRejected {
        addr: PeerAddr,
        reason: String,
    },
    /// Client side: the transport to the server is up.
    Connected {
        addr: PeerAddr,
    },
    ConnectFailed {
        error: String,
    },
    HandshakeCompleted {
        connection_id: ConnectionId,
    },
    ConnectionDropped {
        connection_id: ConnectionId,
        reason: DropReason,
    },
    ArenaStateChanged {
        connection_id: ConnectionId,
        state: ArenaState,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DropReason {
    HandshakeTimeout,
    PingTimeout,
    ProtocolErrors,
    VersionMismatch,
    /// Refused by the admission check.
    Rejected(String),
    TransportFailure(String),
    ClosedByPeer(Option<String>),
    Kicked,
    Shutdown,
}

impl DropReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DropReason::HandshakeTimeout => "handshake timed out",
            DropReason::PingTimeout => "stopped answering pings",
            DropReason::ProtocolErrors => "sent too many malformed messages",
            DropReason::VersionMismatch => "protocol version mismatch",
            DropReason::Rejected(_) => "rejected",
            DropReason::TransportFailure(_) => "transport failed",
            DropReason::ClosedByPeer(_) => "disconnected",
            DropReason::Kicked => "kicked",
            DropReason::Shutdown => "shut down",
        }
    }

    /// Text for the close notice, or `None` when the peer is already gone.
    pub fn close_notice(&self) -> Option<String> {
        match self {
            DropReason::ClosedByPeer(_) => None,
            DropReason::Rejected(reason) => Some(reason.clone()),
            DropReason::TransportFailure(detail) => Some(format!("Transport failed: {detail}")),
            other => {
                let text = other.as_str();
                let mut chars = text.chars();
                chars
                    .next()
                    .map(|first| first.to_uppercase().chain(chars).collect())
            }
        }
    }
}

impl std::fmt::Display for DropReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DropReason::TransportFailure(detail) => write!(f, "transport failed: {detail}"),
            DropReason::Rejected(reason) => write!(f, "rejected: {reason}"),
            DropReason::ClosedByPeer(Some(reason)) => write!(f, "disconnected: {reason}"),
            other => f.write_str(other.as_str()),
        }
    }
}
