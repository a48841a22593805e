//! Error management.
use std::io::ErrorKind;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Everything that can go wrong between submitting a request and seeing
/// its response.
///
/// Socket-level failures keep the [`std::io::ErrorKind`] they came with so
/// the layer above can tell a refused connect from a reset mid-write.
/// The protocol variants are all fatal to the connection: once the framed
/// stream is desynchronized there is no way to re-attach responses to
/// requests.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// An IO error took place on the socket.
    #[error("IO error {0:?}")]
    IoError(ErrorKind),
    /// Waiting for the connection to come up took longer than the caller
    /// allowed. The connect attempt itself keeps running.
    #[error("Timed out waiting for the connection")]
    NetworkTimeout,
    /// The connection could not be established, or the broker was already
    /// closed when the request was submitted.
    #[error("Connection failed or broker is closed")]
    NetworkFail,
    /// The request header could not be encoded.
    #[error("Error encoding the request header")]
    EncodingError,
    /// The response length prefix or correlation id could not be parsed.
    #[error("Error decoding the response frame")]
    DecodingError,
    /// The broker answered with a correlation id that does not belong to
    /// the request at the head of the in-flight queue.
    #[error("Correlation id {actual} does not match in-flight request {expected}")]
    CorrelationMismatch { expected: i32, actual: i32 },
    /// The broker closed the stream in the middle of a response.
    #[error("Stream ended before the full response arrived")]
    ShortRead,
    /// The broker was closed while this request was still in flight; no
    /// response will ever be delivered for it.
    #[error("Broker closed with the request still in flight")]
    Closed,
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::IoError(err.kind())
    }
}
