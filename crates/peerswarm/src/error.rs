use peer_binary_protocol::MessageDeserializeError;
use serde::Serialize;

/// Why a peer connection ended. Every connection reports exactly one of these
/// to the swarm when it goes away.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum TerminationReason {
    Completed,
    ConnectionRefused,
    UnknownHost,
    BadHandshake,
    MalformedMessage,
    Timeout,
    DuplicateConnection,
}

impl std::fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TerminationReason::Completed => "completed",
            TerminationReason::ConnectionRefused => "connection refused",
            TerminationReason::UnknownHost => "unknown host",
            TerminationReason::BadHandshake => "bad handshake",
            TerminationReason::MalformedMessage => "malformed message",
            TerminationReason::Timeout => "timeout",
            TerminationReason::DuplicateConnection => "duplicate connection",
        };
        f.write_str(s)
    }
}

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("error connecting: {0:#}")]
    Connect(#[source] std::io::Error),

    #[error("wrong info hash")]
    WrongInfoHash,
    #[error("connecting to ourselves")]
    ConnectingToOurselves,

    #[error("error writing handshake: {0:#}")]
    WriteHandshake(#[source] std::io::Error),
    #[error("error reading handshake: {0:#}")]
    ReadHandshake(#[source] std::io::Error),
    #[error("error deserializing handshake: {0:#}")]
    DeserializeHandshake(#[source] MessageDeserializeError),
    #[error("peer disconnected while reading handshake")]
    PeerDisconnectedReadingHandshake,

    #[error("error writing: {0:#}")]
    Write(#[source] std::io::Error),
    #[error("error reading: {0:#}")]
    Read(#[source] std::io::Error),

    #[error("timeout {0}")]
    Timeout(&'static str),

    #[error("no messages from peer in {0:?}")]
    PeerSilent(std::time::Duration),

    #[error("peer disconnected")]
    PeerDisconnected,
    #[error("peer disconnected in the middle of a message")]
    PeerDisconnectedMidMessage,

    #[error(transparent)]
    ProtoSerialize(#[from] peer_binary_protocol::SerializeError),

    #[error("error deserializing message: {0:#}")]
    Deserialize(
        #[from]
        #[source]
        MessageDeserializeError,
    ),

    #[error("protocol violation: {0}")]
    ProtocolViolation(&'static str),

    #[error("peer kept requesting while choked")]
    TooManyStrayRequests,

    #[error("peer requested piece {0} which we don't have")]
    RequestedMissingPiece(u32),

    #[error("duplicate connection")]
    DuplicateConnection,

    #[error("too many connections")]
    TooManyConnections,

    #[error("error reading block: {0:#}")]
    ReadBlock(#[source] anyhow::Error),

    #[error("bug: peer not found")]
    BugPeerNotFound,

    #[error(transparent)]
    Anyhow(anyhow::Error),
}

impl Error {
    /// Classify the error into the reason reported to the swarm.
    pub fn termination_reason(&self) -> TerminationReason {
        use TerminationReason as R;
        match self {
            Error::Connect(e) => match e.kind() {
                std::io::ErrorKind::ConnectionRefused => R::ConnectionRefused,
                _ => R::UnknownHost,
            },
            Error::WrongInfoHash
            | Error::ConnectingToOurselves
            | Error::WriteHandshake(_)
            | Error::ReadHandshake(_)
            | Error::DeserializeHandshake(_)
            | Error::PeerDisconnectedReadingHandshake => R::BadHandshake,
            Error::Timeout(_) | Error::PeerSilent(_) => R::Timeout,
            Error::DuplicateConnection => R::DuplicateConnection,
            Error::TooManyConnections => R::ConnectionRefused,
            // The remote hung up between frames.
            Error::PeerDisconnected => R::Completed,
            Error::Write(_)
            | Error::Read(_)
            | Error::PeerDisconnectedMidMessage
            | Error::ProtoSerialize(_)
            | Error::Deserialize(_)
            | Error::ProtocolViolation(_)
            | Error::TooManyStrayRequests
            | Error::RequestedMissingPiece(_)
            | Error::ReadBlock(_)
            | Error::BugPeerNotFound
            | Error::Anyhow(_) => R::MalformedMessage,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_termination_reasons() {
        let refused = std::io::Error::from(std::io::ErrorKind::ConnectionRefused);
        assert_eq!(
            Error::Connect(refused).termination_reason(),
            TerminationReason::ConnectionRefused
        );
        let unreachable = std::io::Error::from(std::io::ErrorKind::AddrNotAvailable);
        assert_eq!(
            Error::Connect(unreachable).termination_reason(),
            TerminationReason::UnknownHost
        );
        assert_eq!(
            Error::WrongInfoHash.termination_reason(),
            TerminationReason::BadHandshake
        );
        assert_eq!(
            Error::Deserialize(MessageDeserializeError::UnsupportedMessageId(20))
                .termination_reason(),
            TerminationReason::MalformedMessage
        );
        assert_eq!(
            Error::Timeout("connecting").termination_reason(),
            TerminationReason::Timeout
        );
        assert_eq!(
            Error::PeerDisconnected.termination_reason(),
            TerminationReason::Completed
        );
        assert_eq!(
            Error::PeerDisconnectedMidMessage.termination_reason(),
            TerminationReason::MalformedMessage
        );
    }
}
