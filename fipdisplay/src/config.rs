use std::path::PathBuf;
use std::time::Duration;

use crate::frame::PixelOrder;
use crate::{PID_SAITEK_FIP, VID_SAITEK};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UsbIds {
    pub vendor_id: u16,
    pub product_id: u16,
}

impl Default for UsbIds {
    fn default() -> Self {
        Self {
            vendor_id: VID_SAITEK,
            product_id: PID_SAITEK_FIP,
        }
    }
}

/// Bounded exponential backoff for bulk writes that time out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub max_attempts: u32,
    pub deadline: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_millis(500),
            max_attempts: 16,
            deadline: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Delay to wait after the given (1-based) failed attempt.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32
            .checked_shl(attempt.saturating_sub(1))
            .unwrap_or(u32::MAX);
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }
}

#[derive(Debug, Clone)]
pub struct FipConfig {
    pub usb: UsbIds,
    pub discovery_poll: Duration,
    /// `None` waits for the device forever.
    pub discovery_timeout: Option<Duration>,
    pub transfer_timeout: Duration,
    pub response_timeout: Duration,
    pub listener_poll: Duration,
    pub retry: RetryPolicy,
    pub queue_capacity: usize,
    pub pixel_order: PixelOrder,
    pub library_path: PathBuf,
    pub plugin_name: String,
}

impl Default for FipConfig {
    fn default() -> Self {
        Self {
            usb: UsbIds::default(),
            discovery_poll: Duration::from_millis(500),
            discovery_timeout: None,
            transfer_timeout: Duration::from_secs(5),
            response_timeout: Duration::from_secs(5),
            listener_poll: Duration::from_millis(250),
            retry: RetryPolicy::default(),
            queue_capacity: 32,
            pixel_order: PixelOrder::default(),
            library_path: PathBuf::from("./liblibfip.so"),
            plugin_name: "fip".to_owned(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_then_caps() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff(1), Duration::from_millis(10));
        assert_eq!(policy.backoff(2), Duration::from_millis(20));
        assert_eq!(policy.backoff(4), Duration::from_millis(80));
        assert_eq!(policy.backoff(7), Duration::from_millis(500));
        assert_eq!(policy.backoff(40), Duration::from_millis(500));
    }

    #[test]
    fn defaults_target_the_fip() {
        let config = FipConfig::default();
        assert_eq!(config.usb.vendor_id, 0x06a3);
        assert_eq!(config.usb.product_id, 0xa2ae);
        assert_eq!(config.queue_capacity, 32);
        assert_eq!(config.discovery_poll, Duration::from_millis(500));
    }
}
