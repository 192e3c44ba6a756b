use std::error::Error;
use std::fmt;
use std::fmt::Display;

use crate::network::codec::CodecError;
use crate::Frame;

/// This enum contains all error messages this library can return. Most API functions will generally return a [`Result<(), MeshError>`].
///
/// Every error is local to one peer relationship. A misbehaving peer is removed, the session keeps
/// running for everyone else.
///
/// [`Result<(), MeshError>`]: std::result::Result
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum MeshError {
    /// Wire data was corrupt or truncated beyond repair. The frame is dropped, the connection is kept.
    MalformedFrame {
        /// What was wrong with the frame.
        context: String,
    },
    /// A joiner announced a protocol version different from the host's.
    ProtocolVersionMismatch {
        /// The version this side speaks.
        local: u16,
        /// The version the remote side announced.
        remote: u16,
    },
    /// The application's admission predicate rejected a join request.
    AdmissionDenied {
        /// The name the rejected peer tried to join with.
        username: String,
    },
    /// A transport operation failed or the connection is closed.
    TransportError {
        /// A description of the transport failure.
        context: String,
    },
    /// A peer reported a simulation state that disagrees with the local expectation.
    StateDivergence {
        /// The divergent peer.
        peer: String,
        /// The frame at which the disagreement was detected.
        frame: Frame,
        /// The state this side expected.
        expected: i32,
        /// The state the peer reported.
        reported: i32,
    },
    /// You made an invalid request, usually by using wrong parameters for function calls.
    InvalidRequest {
        /// Further specifies why the request was invalid.
        info: String,
    },
    /// The operation is reserved for the hosting side of a session.
    NotHosting,
    /// No peer with the given name is known to this session.
    UnknownPeer {
        /// The name that was looked up.
        name: String,
    },
    /// Serialization or deserialization of a payload failed.
    SerializationError {
        /// A description of what failed to serialize/deserialize.
        context: String,
    },
}

impl Display for MeshError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MeshError::MalformedFrame { context } => {
                write!(f, "Malformed frame: {}", context)
            }
            MeshError::ProtocolVersionMismatch { local, remote } => {
                write!(
                    f,
                    "Protocol version mismatch: local version {}, remote version {}",
                    local, remote
                )
            }
            MeshError::AdmissionDenied { username } => {
                write!(f, "Admission denied for '{}'", username)
            }
            MeshError::TransportError { context } => {
                write!(f, "Transport error: {}", context)
            }
            MeshError::StateDivergence {
                peer,
                frame,
                expected,
                reported,
            } => {
                write!(
                    f,
                    "Peer '{}' diverged at frame {}: expected state {}, reported {}",
                    peer, frame, expected, reported
                )
            }
            MeshError::InvalidRequest { info } => {
                write!(f, "Invalid Request: {}", info)
            }
            MeshError::NotHosting => {
                write!(f, "Only the hosting session can perform this operation.")
            }
            MeshError::UnknownPeer { name } => {
                write!(f, "Unknown peer '{}'", name)
            }
            MeshError::SerializationError { context } => {
                write!(f, "Serialization error: {}", context)
            }
        }
    }
}

impl Error for MeshError {}

impl From<std::io::Error> for MeshError {
    fn from(err: std::io::Error) -> Self {
        MeshError::TransportError {
            context: err.to_string(),
        }
    }
}

impl From<CodecError> for MeshError {
    fn from(err: CodecError) -> Self {
        match err {
            CodecError::EncodeError { .. } | CodecError::DecodeError { .. } => {
                MeshError::SerializationError {
                    context: err.to_string(),
                }
            }
            _ => MeshError::MalformedFrame {
                context: err.to_string(),
            },
        }
    }
}

#[cfg(test)]
#[allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;

    #[test]
    fn display_names_the_peer_on_divergence() {
        let err = MeshError::StateDivergence {
            peer: "alice".to_owned(),
            frame: Frame::new(3),
            expected: 45,
            reported: 44,
        };
        let msg = err.to_string();
        assert!(msg.contains("alice"));
        assert!(msg.contains("frame 3"));
        assert!(msg.contains("45"));
        assert!(msg.contains("44"));
    }

    #[test]
    fn display_version_mismatch() {
        let err = MeshError::ProtocolVersionMismatch {
            local: 1,
            remote: 7,
        };
        assert_eq!(
            err.to_string(),
            "Protocol version mismatch: local version 1, remote version 7"
        );
    }

    #[test]
    fn io_error_becomes_transport_error() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset by peer");
        let err: MeshError = io.into();
        assert!(matches!(err, MeshError::TransportError { ref context } if context.contains("reset")));
    }

    #[test]
    fn codec_errors_map_by_kind() {
        let truncated: MeshError = CodecError::Truncated {
            needed: 4,
            available: 1,
        }
        .into();
        assert!(matches!(truncated, MeshError::MalformedFrame { .. }));

        let bincode: MeshError =
            CodecError::decode("bad", crate::network::codec::CodecOperation::Decode).into();
        assert!(matches!(bincode, MeshError::SerializationError { .. }));
    }

    #[test]
    fn errors_are_std_errors() {
        fn takes_error(_: &dyn Error) {}
        takes_error(&MeshError::NotHosting);
    }
}
