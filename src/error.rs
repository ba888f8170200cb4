//! Error types returned by stream lifecycle operations.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors reported by [`Stream`](crate::Stream) operations.
///
/// Every expected failure mode is reported through this enum; the library
/// never panics across its public API for recoverable conditions. Native
/// backend diagnostics are logged and mapped to the closest variant rather
/// than leaked as raw platform codes.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Error {
    /// Failed to allocate the necessary memory.
    #[error("failed to allocate the necessary memory")]
    NoMemory,

    /// The requested device is not present or could not be activated.
    #[error("device is not present")]
    NotPresent,

    /// No backend is bound to the stream, or the bound backend does not
    /// support the requested operation.
    #[error("no usable backend")]
    NoApi,

    /// The device does not support the requested sample rate.
    #[error("sample rate is not supported by the device")]
    InvalidSampleRate,

    /// The device does not support the requested buffer size.
    #[error("buffer size is not supported by the device")]
    InvalidBufferSize,

    /// The device uses a sample format this library does not handle.
    #[error("device sample format is not supported")]
    UnsupportedSampleFormat,

    /// No callback was bound before `open`; format deduction needs one.
    #[error("no callback has been set")]
    NoCallback,

    /// The stream has not been opened.
    #[error("stream is not open")]
    NotOpen,

    /// The stream is not running.
    #[error("stream is not running")]
    NotRunning,

    /// The stream (or, for the driver protocol, another stream in this
    /// process) is already open.
    #[error("stream is already open")]
    AlreadyOpen,

    /// The stream is already running.
    #[error("stream is already running")]
    AlreadyRunning,

    /// Generic hardware or backend failure.
    #[error("backend failure")]
    Fail,

    /// The input/output device combination is invalid for the backend.
    #[error("invalid duplex device combination")]
    InvalidDuplex,
}

/// Result type alias for stream operations.
pub type Result<T> = std::result::Result<T, Error>;
