//! Error types returned across the public surface.

use thiserror::Error;

/// Error decoding or validating a 7-byte protocol frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum FrameError {
    /// The buffer handed to [`crate::frame::decode`] was not exactly 7 bytes long.
    #[error("frame buffer has length {0}, expected 7")]
    LengthMismatch(usize),
    /// STX, ETX or the checksum byte did not match the expected value.
    #[error("frame failed STX/ETX/checksum validation")]
    Invalid,
}

/// Error type for the whole crate.
#[derive(Debug, Error)]
pub enum K8090Error {
    /// A command was enqueued while the driver was not connected to a card.
    #[error("not connected to a K8090 card")]
    NotConnected,
    /// The transport returned an error while writing a frame.
    #[error("transport write failed: {0}")]
    TransportWrite(String),
    /// The transport returned an error while opening a port.
    #[error("transport open failed: {0}")]
    TransportOpen(String),
    /// A frame failed to decode or validate.
    #[error(transparent)]
    Frame(#[from] FrameError),
    /// The link exhausted its retry budget and was declared dead.
    #[error("connection failed after exhausting retry budget")]
    ConnectionFailed,
}
