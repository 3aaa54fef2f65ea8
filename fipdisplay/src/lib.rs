mod cancel;
mod config;
mod error;
mod frame;
mod pump;
mod source;
pub mod transport;

pub use cancel::CancelToken;
pub use config::{FipConfig, RetryPolicy, UsbIds};
pub use error::{FipError, Result};
pub use frame::{Frame, PixelOrder, FRAME_HEIGHT, FRAME_SIZE, FRAME_WIDTH};
pub use pump::{FrameProducer, FramePump, FrameSink, PumpReport};
pub use source::{test_pattern, MediaSource, SourceFrame};

pub use image::imageops::FilterType;

pub const VID_SAITEK: u16 = 0x06a3;
pub const PID_SAITEK_FIP: u16 = 0xa2ae;

/// DirectOutput device type GUID of the FIP.
pub const FIP_DEVICE_TYPE: uuid::Uuid = uuid::uuid!("3E083CD8-6A37-4A58-80A8-3D6A2C07513E");
