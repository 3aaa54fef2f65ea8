//! Drives the panel through the vendor's DirectOutput library.

mod library;
mod status;

use std::ffi::c_void;
use std::thread;
use std::time::Duration;

use uuid::Uuid;

use crate::cancel::CancelToken;
use crate::error::{FipError, Result};
use crate::frame::Frame;
use crate::pump::FrameSink;

pub use library::DirectOutputLibrary;
pub use status::{
    check_status, StatusError, StatusKind, E_BUFFERTOOSMALL, E_HANDLE, E_INVALIDARG, E_NOTIMPL,
    E_OUTOFMEMORY, E_OUTOFMEMORY_WIDE, E_PAGENOTACTIVE, HRESULT, S_OK,
};

/// Opaque device pointer handed out by the library. Only valid while the
/// session that enumerated it is initialized.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceHandle(usize);

impl DeviceHandle {
    pub fn from_raw(ptr: *mut c_void) -> Self {
        Self(ptr as usize)
    }

    pub fn as_ptr(self) -> *mut c_void {
        self.0 as *mut c_void
    }
}

pub type DeviceChangeCallback = Box<dyn FnMut(DeviceHandle, bool) + Send>;
pub type PageChangeCallback = Box<dyn FnMut(DeviceHandle, u32, bool) + Send>;
pub type SoftButtonCallback = Box<dyn FnMut(DeviceHandle, u32) + Send>;

/// The subset of the DirectOutput API the panel needs.
pub trait DirectOutputApi {
    fn initialize(&self, plugin_name: &str) -> Result<()>;
    fn deinitialize(&self) -> Result<()>;
    /// Runs the library's enumeration and returns every device it reported.
    fn enumerate(&self) -> Result<Vec<DeviceHandle>>;
    fn set_image(&self, device: DeviceHandle, page: u32, index: u32, data: &[u8]) -> Result<()>;
    fn set_led(&self, device: DeviceHandle, page: u32, index: u32, on: bool) -> Result<()>;
    fn serial_number(&self, device: DeviceHandle) -> Result<String>;
    fn device_type(&self, device: DeviceHandle) -> Result<Uuid>;
    fn register_device_callback(&self, callback: DeviceChangeCallback) -> Result<()>;
    fn register_page_callback(&self, device: DeviceHandle, callback: PageChangeCallback) -> Result<()>;
    fn register_soft_button_callback(
        &self,
        device: DeviceHandle,
        callback: SoftButtonCallback,
    ) -> Result<()>;
}

/// An initialized library. Deinitialized exactly once, by [`Session::close`]
/// or on drop.
pub struct Session<'a, L: DirectOutputApi + ?Sized> {
    api: &'a L,
    initialized: bool,
}

impl<'a, L: DirectOutputApi + ?Sized> Session<'a, L> {
    pub fn initialize(api: &'a L, plugin_name: &str) -> Result<Self> {
        api.initialize(plugin_name)?;
        log::info!("DirectOutput initialized as {:?}", plugin_name);
        Ok(Self {
            api,
            initialized: true,
        })
    }

    pub fn enumerate(&self) -> Result<Vec<DeviceHandle>> {
        let devices = self.api.enumerate()?;
        log::debug!("enumerated {} devices", devices.len());
        Ok(devices)
    }

    pub fn first_device(&self) -> Result<Device<'_, L>> {
        let handle = self
            .enumerate()?
            .into_iter()
            .next()
            .ok_or(FipError::NoDevice)?;
        Ok(self.device(handle))
    }

    pub fn device(&self, handle: DeviceHandle) -> Device<'_, L> {
        Device {
            api: self.api,
            handle,
            page: 0,
        }
    }

    pub fn on_device_change<F>(&self, callback: F) -> Result<()>
    where
        F: FnMut(DeviceHandle, bool) + Send + 'static,
    {
        self.api.register_device_callback(Box::new(callback))
    }

    pub fn close(mut self) -> Result<()> {
        self.initialized = false;
        self.api.deinitialize()?;
        log::info!("DirectOutput deinitialized");
        Ok(())
    }
}

impl<L: DirectOutputApi + ?Sized> Drop for Session<'_, L> {
    fn drop(&mut self) {
        if !self.initialized {
            return;
        }
        self.initialized = false;
        match self.api.deinitialize() {
            Ok(()) => log::info!("DirectOutput deinitialized"),
            Err(err) => log::warn!("deinitialize failed: {}", err),
        }
    }
}

/// One enumerated device, borrowed from its session.
pub struct Device<'s, L: DirectOutputApi + ?Sized> {
    api: &'s L,
    handle: DeviceHandle,
    page: u32,
}

impl<'s, L: DirectOutputApi + ?Sized> Device<'s, L> {
    /// Page used by [`FrameSink::show_frame`].
    pub fn with_page(mut self, page: u32) -> Self {
        self.page = page;
        self
    }

    pub fn handle(&self) -> DeviceHandle {
        self.handle
    }

    pub fn serial_number(&self) -> Result<String> {
        self.api.serial_number(self.handle)
    }

    pub fn set_image(&self, page: u32, index: u32, frame: &Frame) -> Result<()> {
        self.api.set_image(self.handle, page, index, frame.as_bytes())
    }

    pub fn device_type(&self) -> Result<Uuid> {
        self.api.device_type(self.handle)
    }

    pub fn set_led(&self, page: u32, index: u32, on: bool) -> Result<()> {
        self.api.set_led(self.handle, page, index, on)
    }

    /// Walks LEDs 1 to 8 on, then off, `cycles` times (forever when 0),
    /// pausing `step` after each change. Stops early once `cancel` is set
    /// and returns the number of finished cycles.
    pub fn blink_leds(
        &self,
        page: u32,
        cycles: u32,
        step: Duration,
        cancel: &CancelToken,
    ) -> Result<u32> {
        let mut done = 0;
        while cycles == 0 || done < cycles {
            for on in [true, false] {
                for led in 1..=8 {
                    if cancel.is_cancelled() {
                        log::info!("blinking interrupted after {} cycles", done);
                        return Ok(done);
                    }
                    self.set_led(page, led, on)?;
                    thread::sleep(step);
                }
            }
            done += 1;
        }
        Ok(done)
    }

    pub fn on_page_change<F>(&self, callback: F) -> Result<()>
    where
        F: FnMut(DeviceHandle, u32, bool) + Send + 'static,
    {
        self.api.register_page_callback(self.handle, Box::new(callback))
    }

    pub fn on_soft_button<F>(&self, callback: F) -> Result<()>
    where
        F: FnMut(DeviceHandle, u32) + Send + 'static,
    {
        self.api
            .register_soft_button_callback(self.handle, Box::new(callback))
    }
}

impl<L: DirectOutputApi + ?Sized> FrameSink for Device<'_, L> {
    fn show_frame(&mut self, frame: &Frame) -> Result<()> {
        self.set_image(self.page, 0, frame)
    }
}
