//! All possible non-I/O gateway errors.
//!
use core::{
    error,
    fmt::{Display, Formatter},
};
use std::io::{self, ErrorKind};

/// Enumeration of all possible non-I/O gateway errors.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
#[non_exhaustive]
pub enum Error {
    /// The peer deviated from the multiplexing protocol.
    ///
    /// Protocol errors are session-fatal: every running stream is shut
    /// down and the transport is closed.
    Protocol(ProtocolError),

    /// The AEAD envelope around the session could not be maintained.
    ///
    /// Transport errors are session-fatal. They usually indicate a key
    /// mismatch, a desynchronized nonce counter, or tampered data.
    Transport(TransportError),

    /// The auth handshake failed before a session was established.
    Auth(AuthError),
}

/// The peer deviated from the multiplexing protocol.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
#[non_exhaustive]
pub enum ProtocolError {
    /// The 2-bit type field of a packet header did not match any known
    /// header type.
    UnknownHeaderType,

    /// A stream id outside the 64-slot table was requested.
    InvalidStreamId {
        /// The offending stream id.
        received: u8,
    },

    /// A control message declared more payload than the handler buffer
    /// can hold.
    ControlMessageTooLong,

    /// A control message carried no payload at all.
    InvalidControlMessage,

    /// A header or sub-header field was set to a value outside its
    /// encodable range.
    ValueTooLarge,

    /// A stream operation was requested on a slot that is not running.
    OperateInactiveStream,

    /// A Close was requested on a slot that is not running.
    ClosingInactiveStream,

    /// A Completed was received for a slot that is not running.
    ReleasingInactiveStream,

    /// Data arrived for a stream after its machine was closed.
    MachineClosed,

    /// A parse needed more bytes than the working buffer provides.
    NotEnoughBuffer,

    /// A varint integer exceeded the 14-bit encodable range.
    IntegerTooLarge,

    /// The type bits of an address did not name a known address kind.
    InvalidAddressType,

    /// A second fingerprint verification response arrived for the same
    /// prompt.
    UnexpectedFingerprintRespond,

    /// A second credential response arrived for the same prompt.
    UnexpectedCredentialRespond,

    /// A credential response exceeded the accepted size.
    CredentialTooLarge,

    /// A stream frame carried a marker the command does not define.
    UnknownClientSignal {
        /// The unknown marker.
        marker: u8,
    },

    /// The backend connection behind a stream is gone.
    RemoteUnavailable,
}

/// The AEAD envelope around the session could not be maintained.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
#[non_exhaustive]
pub enum TransportError {
    /// A wire frame declared a zero or oversized ciphertext length.
    InvalidDataPackage {
        /// The declared ciphertext length.
        received: u16,
    },

    /// Decryption or tag verification of a wire frame failed.
    OpenFailed,

    /// The initial plaintext nonce exchange could not be completed.
    NonceExchangeFailed,

    /// The underlying message transport delivered a non-binary message.
    UnexpectedMessageType,
}

/// The auth handshake failed before a session was established.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
#[non_exhaustive]
pub enum AuthError {
    /// The presented auth key did not match the derived one.
    ///
    /// The embedder should answer 403; the verifier has already applied
    /// the brute-force throttle delay.
    KeyRejected,
}

impl Display for Error {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        match self {
            Error::Protocol(err) => write!(f, "Protocol: {}", err),
            Error::Transport(err) => write!(f, "Transport: {}", err),
            Error::Auth(err) => write!(f, "Auth: {}", err),
        }
    }
}

impl Display for ProtocolError {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        match self {
            ProtocolError::UnknownHeaderType => write!(f, "UnknownHeaderType"),
            ProtocolError::InvalidStreamId { received } => {
                write!(f, "InvalidStreamId: received {}", received)
            }
            ProtocolError::ControlMessageTooLong => write!(f, "ControlMessageTooLong"),
            ProtocolError::InvalidControlMessage => write!(f, "InvalidControlMessage"),
            ProtocolError::ValueTooLarge => write!(f, "ValueTooLarge"),
            ProtocolError::OperateInactiveStream => write!(f, "OperateInactiveStream"),
            ProtocolError::ClosingInactiveStream => write!(f, "ClosingInactiveStream"),
            ProtocolError::ReleasingInactiveStream => write!(f, "ReleasingInactiveStream"),
            ProtocolError::MachineClosed => write!(f, "MachineClosed"),
            ProtocolError::NotEnoughBuffer => write!(f, "NotEnoughBuffer"),
            ProtocolError::IntegerTooLarge => write!(f, "IntegerTooLarge"),
            ProtocolError::InvalidAddressType => write!(f, "InvalidAddressType"),
            ProtocolError::UnexpectedFingerprintRespond => {
                write!(f, "UnexpectedFingerprintRespond")
            }
            ProtocolError::UnexpectedCredentialRespond => {
                write!(f, "UnexpectedCredentialRespond")
            }
            ProtocolError::CredentialTooLarge => write!(f, "CredentialTooLarge"),
            ProtocolError::UnknownClientSignal { marker } => {
                write!(f, "UnknownClientSignal: marker {}", marker)
            }
            ProtocolError::RemoteUnavailable => write!(f, "RemoteUnavailable"),
        }
    }
}

impl Display for TransportError {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        match self {
            TransportError::InvalidDataPackage { received } => {
                write!(f, "InvalidDataPackage: received length {}", received)
            }
            TransportError::OpenFailed => write!(f, "OpenFailed"),
            TransportError::NonceExchangeFailed => write!(f, "NonceExchangeFailed"),
            TransportError::UnexpectedMessageType => write!(f, "UnexpectedMessageType"),
        }
    }
}

impl Display for AuthError {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        match self {
            AuthError::KeyRejected => write!(f, "KeyRejected"),
        }
    }
}

impl error::Error for Error {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match self {
            Error::Protocol(err) => Some(err),
            Error::Transport(err) => Some(err),
            Error::Auth(err) => Some(err),
        }
    }
}

impl error::Error for ProtocolError {}

impl error::Error for TransportError {}

impl error::Error for AuthError {}

impl From<Error> for io::Error {
    fn from(e: Error) -> Self {
        io::Error::new(ErrorKind::Other, e)
    }
}

impl From<ProtocolError> for io::Error {
    fn from(e: ProtocolError) -> Self {
        io::Error::new(ErrorKind::Other, Error::Protocol(e))
    }
}

impl From<TransportError> for io::Error {
    fn from(e: TransportError) -> Self {
        io::Error::new(ErrorKind::Other, Error::Transport(e))
    }
}

impl From<AuthError> for io::Error {
    fn from(e: AuthError) -> Self {
        io::Error::new(ErrorKind::Other, Error::Auth(e))
    }
}

impl From<ProtocolError> for Error {
    fn from(e: ProtocolError) -> Self {
        Error::Protocol(e)
    }
}

impl From<TransportError> for Error {
    fn from(e: TransportError) -> Self {
        Error::Transport(e)
    }
}

impl From<AuthError> for Error {
    fn from(e: AuthError) -> Self {
        Error::Auth(e)
    }
}
