use std::time::Duration;

use simple_error::SimpleError;
use thiserror::Error;

use crate::transport::native::StatusError;

pub type Result<T, E = FipError> = std::result::Result<T, E>;

#[derive(Error, Debug)]
pub enum FipError {
    #[error("usb transfer failed: {0}")]
    Usb(#[from] rusb::Error),

    #[error("device did not accept the transfer after {attempts} attempts ({elapsed:?})")]
    RetriesExhausted { attempts: u32, elapsed: Duration },

    #[error("unexpected usb descriptors: {0}")]
    Descriptor(#[from] SimpleError),

    #[error("protocol violation: {0}")]
    Protocol(String),

    /// The device answered a command with its error fields set.
    #[error("device rejected request {request:#04x} (header error {header_error}, request error {request_error})")]
    Rejected {
        request: u32,
        header_error: u32,
        request_error: u32,
    },

    #[error("no response from the device within {0:?}")]
    ResponseTimeout(Duration),

    #[error("input listener stopped")]
    ListenerStopped,

    #[error(transparent)]
    Status(#[from] StatusError),

    #[error("could not load the DirectOutput library: {0}")]
    Library(#[from] libloading::Error),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("no FIP device found")]
    NoDevice,

    #[error("no FIP device appeared within {0:?}")]
    DiscoveryTimeout(Duration),

    #[error("operation cancelled")]
    Cancelled,

    #[error("frame consumer stopped before the producer finished")]
    ConsumerGone,

    #[error("frame consumer thread panicked")]
    ConsumerPanicked,

    #[error("input listener thread panicked")]
    ListenerPanicked,

    #[error("frame must be {expected} bytes, got {len}")]
    InvalidFrame { len: usize, expected: usize },

    #[error("embedded resource {0} is missing")]
    MissingResource(&'static str),

    #[error(transparent)]
    Image(#[from] image::ImageError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
