//! Talks to the panel over its vendor bulk interface, without the vendor
//! library.
//!
//! Every OUT transfer is a [`CommandBuffer`] header, optionally followed by
//! a payload of `data_size` bytes. The panel answers each command with a
//! 44-byte response, which the input listener picks up on a background
//! thread and hands to the [`RawLink`] waiting for it.

mod listener;
mod output;
pub mod packet;

use std::thread;
use std::time::{Duration, Instant};

use crossbeam::channel::{self, Receiver, RecvTimeoutError};
use itertools::Itertools;
use rusb::{Device, DeviceDescriptor, DeviceHandle, Direction, TransferType, UsbContext};
use simple_error::SimpleError;

use crate::cancel::CancelToken;
use crate::config::{FipConfig, UsbIds};
use crate::error::{FipError, Result};
use crate::frame::Frame;
use crate::pump::FrameSink;

pub use output::{BulkPipe, OutputPump};
pub use packet::{CommandBuffer, Request, COMMAND_SIZE};

const VENDOR_SPECIFIC_CLASS: u8 = 0xff;
const DEFAULT_PAGE: u32 = 1;
/// Responses kept for a link that is not waiting. Older ones are dropped.
const RESPONSE_BACKLOG: usize = 8;

/// One scan of the bus.
pub fn find_display<T: UsbContext>(context: &T, ids: UsbIds) -> Result<Option<Device<T>>> {
    Ok(super::find_device(context, ids)?.map(|(device, _)| device))
}

/// Polls the bus every `poll` until the panel shows up, `deadline` passes or
/// `cancel` is set.
pub fn wait_for_display<T: UsbContext>(
    context: &T,
    ids: UsbIds,
    poll: Duration,
    deadline: Option<Duration>,
    cancel: &CancelToken,
) -> Result<Device<T>> {
    log::debug!("waiting for {:04x}:{:04x}", ids.vendor_id, ids.product_id);
    let device = poll_until_found(|| find_display(context, ids), poll, deadline, cancel)?;
    log::info!(
        "found {:04x}:{:04x} at {:03}-{:03}",
        ids.vendor_id,
        ids.product_id,
        device.bus_number(),
        device.address()
    );
    Ok(device)
}

fn poll_until_found<D>(
    mut scan: impl FnMut() -> Result<Option<D>>,
    poll: Duration,
    deadline: Option<Duration>,
    cancel: &CancelToken,
) -> Result<D> {
    let started = Instant::now();
    loop {
        if cancel.is_cancelled() {
            return Err(FipError::Cancelled);
        }
        if let Some(found) = scan()? {
            return Ok(found);
        }
        if let Some(deadline) = deadline {
            if started.elapsed() >= deadline {
                return Err(FipError::DiscoveryTimeout(deadline));
            }
        }
        thread::sleep(poll);
    }
}

#[derive(Debug, Clone, Copy)]
struct Endpoints {
    interface: u8,
    read: u8,
    write: u8,
}

fn vendor_endpoints<T: UsbContext>(device: &Device<T>) -> Result<Endpoints> {
    let config = device.active_config_descriptor()?;

    for interface in config.interfaces() {
        for descriptor in interface.descriptors() {
            if descriptor.class_code() != VENDOR_SPECIFIC_CLASS {
                continue;
            }

            let bulk = |direction: Direction| {
                descriptor
                    .endpoint_descriptors()
                    .filter(|endpoint| {
                        endpoint.transfer_type() == TransferType::Bulk
                            && endpoint.direction() == direction
                    })
                    .map(|endpoint| endpoint.address())
                    .exactly_one()
                    .map_err(|_| {
                        SimpleError::new(format!(
                            "interface {} needs exactly one bulk {:?} endpoint",
                            descriptor.interface_number(),
                            direction
                        ))
                    })
            };

            return Ok(Endpoints {
                interface: descriptor.interface_number(),
                read: bulk(Direction::In)?,
                write: bulk(Direction::Out)?,
            });
        }
    }

    Err(SimpleError::new("device has no vendor specific interface").into())
}

/// The claimed vendor interface. Released again on drop.
pub struct UsbPipe<T: UsbContext> {
    handle: DeviceHandle<T>,
    endpoints: Endpoints,
    reattach: bool,
    serial_number: Option<String>,
}

impl<T: UsbContext> UsbPipe<T> {
    pub fn open(device: &Device<T>, timeout: Duration) -> Result<Self> {
        let device_desc = device.device_descriptor()?;
        let endpoints = vendor_endpoints(device)?;
        let handle = device.open()?;

        let reattach = match handle.kernel_driver_active(endpoints.interface) {
            Ok(true) => {
                log::debug!("detaching kernel driver from interface {}", endpoints.interface);
                handle.detach_kernel_driver(endpoints.interface)?;
                true
            }
            Ok(false) | Err(rusb::Error::NotSupported) => false,
            Err(err) => return Err(err.into()),
        };

        if let Err(err) = handle.claim_interface(endpoints.interface) {
            if reattach {
                let _ = handle.attach_kernel_driver(endpoints.interface);
            }
            return Err(err.into());
        }
        log::debug!(
            "claimed interface {} (in {:#04x}, out {:#04x})",
            endpoints.interface,
            endpoints.read,
            endpoints.write
        );

        let serial_number = match read_serial_number(&handle, &device_desc, timeout) {
            Ok(serial) => Some(serial),
            Err(err) => {
                log::debug!("no serial number: {}", err);
                None
            }
        };

        Ok(Self {
            handle,
            endpoints,
            reattach,
            serial_number,
        })
    }

    pub fn serial_number(&self) -> Option<&str> {
        self.serial_number.as_deref()
    }

    /// The type GUID DirectOutput reports for this panel.
    pub fn device_type(&self) -> uuid::Uuid {
        crate::FIP_DEVICE_TYPE
    }
}

fn read_serial_number<T: UsbContext>(
    handle: &DeviceHandle<T>,
    device_desc: &DeviceDescriptor,
    timeout: Duration,
) -> Result<String> {
    let language = handle
        .read_languages(timeout)?
        .into_iter()
        .next()
        .ok_or_else(|| SimpleError::new("device reports no string languages"))?;
    Ok(handle.read_serial_number_string(language, device_desc, timeout)?)
}

impl<T: UsbContext> BulkPipe for UsbPipe<T> {
    fn write(&self, data: &[u8], timeout: Duration) -> rusb::Result<usize> {
        self.handle.write_bulk(self.endpoints.write, data, timeout)
    }

    fn read(&self, buf: &mut [u8], timeout: Duration) -> rusb::Result<usize> {
        self.handle.read_bulk(self.endpoints.read, buf, timeout)
    }
}

impl<T: UsbContext> Drop for UsbPipe<T> {
    fn drop(&mut self) {
        if let Err(err) = self.handle.release_interface(self.endpoints.interface) {
            log::warn!("could not release interface {}: {}", self.endpoints.interface, err);
        }
        if self.reattach {
            if let Err(err) = self.handle.attach_kernel_driver(self.endpoints.interface) {
                log::warn!("could not reattach kernel driver: {}", err);
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeOutcome {
    /// The panel rejected the probe, which is what it does when it is ready.
    Normal,
    FactoryMode,
}

/// Command/response access to the panel for the duration of [`run_session`].
pub struct RawLink<'p, P: BulkPipe + ?Sized> {
    output: OutputPump<'p, P>,
    responses: Receiver<CommandBuffer>,
    response_timeout: Duration,
    cancel: &'p CancelToken,
    page: u32,
}

impl<'p, P: BulkPipe + ?Sized> RawLink<'p, P> {
    /// Page used by [`FrameSink::show_frame`].
    pub fn set_page(&mut self, page: u32) {
        self.page = page;
    }

    pub fn page(&self) -> u32 {
        self.page
    }

    /// Sends one command and waits for the panel's answer, whatever it says.
    pub fn transceive(
        &self,
        command: &CommandBuffer,
        payload: Option<&[u8]>,
    ) -> Result<CommandBuffer> {
        if self.cancel.is_cancelled() {
            return Err(FipError::Cancelled);
        }
        for stale in self.responses.try_iter() {
            log::debug!("discarding unsolicited response {:?}", stale);
        }

        self.output.send(command, payload)?;

        match self.responses.recv_timeout(self.response_timeout) {
            Ok(response) => Ok(response),
            Err(RecvTimeoutError::Timeout) => Err(FipError::ResponseTimeout(self.response_timeout)),
            Err(RecvTimeoutError::Disconnected) => Err(FipError::ListenerStopped),
        }
    }

    fn execute(&self, command: &CommandBuffer, payload: Option<&[u8]>) -> Result<CommandBuffer> {
        let response = self.transceive(command, payload)?;
        if response.has_error() {
            return Err(FipError::Rejected {
                request: command.request,
                header_error: response.header_error,
                request_error: response.request_error,
            });
        }
        Ok(response)
    }

    pub fn probe(&self) -> Result<ProbeOutcome> {
        let response = self.transceive(&CommandBuffer::probe(), None)?;
        if response.has_error() {
            Ok(ProbeOutcome::Normal)
        } else {
            log::warn!("panel answered the probe, it is in factory mode");
            Ok(ProbeOutcome::FactoryMode)
        }
    }

    pub fn set_image(&self, page: u32, frame: &Frame) -> Result<()> {
        let data = frame.as_bytes();
        let command = CommandBuffer::set_image(page, payload_size(data)?);
        self.execute(&command, Some(data))?;
        Ok(())
    }

    pub fn set_led(&self, page: u32, index: u32, on: bool) -> Result<()> {
        self.execute(&CommandBuffer::set_led(page, index, on), None)?;
        Ok(())
    }

    pub fn clear_image(&self, page: u32) -> Result<()> {
        self.execute(&CommandBuffer::clear_image(page), None)?;
        Ok(())
    }

    /// Stores `data` in one of the panel's file slots.
    pub fn save_file(&self, page: u32, file: u32, data: &[u8]) -> Result<()> {
        let command = CommandBuffer::save_file(page, file, payload_size(data)?);
        self.execute(&command, Some(data))?;
        Ok(())
    }

    pub fn display_file(&self, page: u32, index: u32, file: u32) -> Result<()> {
        self.execute(&CommandBuffer::display_file(page, index, file), None)?;
        Ok(())
    }

    pub fn delete_file(&self, page: u32, file: u32) -> Result<()> {
        self.execute(&CommandBuffer::delete_file(page, file), None)?;
        Ok(())
    }
}

fn payload_size(data: &[u8]) -> Result<u32> {
    u32::try_from(data.len())
        .map_err(|_| FipError::InvalidArgument(format!("payload of {} bytes", data.len())))
}

impl<P: BulkPipe + ?Sized> FrameSink for RawLink<'_, P> {
    fn show_frame(&mut self, frame: &Frame) -> Result<()> {
        self.set_image(self.page, frame)
    }
}

struct StopOnDrop<'a>(&'a CancelToken);

impl Drop for StopOnDrop<'_> {
    fn drop(&mut self) {
        self.0.cancel();
    }
}

/// Runs the input listener on a scoped thread while `body` talks to the
/// panel through a [`RawLink`].
///
/// The listener is stopped and joined before this returns. If it failed, its
/// error is returned in place of whatever `body` produced.
pub fn run_session<P, R, F>(pipe: &P, config: &FipConfig, cancel: &CancelToken, body: F) -> Result<R>
where
    P: BulkPipe + Sync + ?Sized,
    F: FnOnce(&mut RawLink<'_, P>) -> Result<R>,
{
    let (sender, receiver) = channel::bounded(RESPONSE_BACKLOG);
    let backlog = receiver.clone();
    let stop = CancelToken::new();

    thread::scope(|scope| {
        let listener = {
            let stop = &stop;
            let poll = config.listener_poll;
            thread::Builder::new()
                .name("fip input listener".to_owned())
                .spawn_scoped(scope, move || listener::listen(pipe, poll, stop, sender, backlog))?
        };

        let outcome = {
            let _stop = StopOnDrop(&stop);
            let mut link = RawLink {
                output: OutputPump::new(pipe, config.retry, config.transfer_timeout),
                responses: receiver,
                response_timeout: config.response_timeout,
                cancel,
                page: DEFAULT_PAGE,
            };
            body(&mut link)
        };

        match listener.join() {
            Ok(Ok(received)) => log::debug!("session closed, {} responses received", received),
            Ok(Err(err)) => return Err(err),
            Err(_) => {
                log::error!("input listener panicked");
                return Err(FipError::ListenerPanicked);
            }
        }
        outcome
    })
}
