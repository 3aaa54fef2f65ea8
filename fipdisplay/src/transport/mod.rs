pub mod native;
pub mod raw_usb;

use rusb::{Device, DeviceDescriptor, UsbContext};

use crate::config::UsbIds;
use crate::error::Result;

/// Scans the bus once for the first device matching `ids`.
pub(crate) fn find_device<T: UsbContext>(
    context: &T,
    ids: UsbIds,
) -> Result<Option<(Device<T>, DeviceDescriptor)>> {
    let devices = context.devices()?;

    for device in devices.iter() {
        let device_desc = match device.device_descriptor() {
            Ok(d) => d,
            Err(err) => {
                log::debug!(
                    "skipping usb device {:03}-{:03}: {}",
                    device.bus_number(),
                    device.address(),
                    err
                );
                continue;
            }
        };

        if device_desc.vendor_id() == ids.vendor_id && device_desc.product_id() == ids.product_id {
            return Ok(Some((device, device_desc)));
        }
    }

    Ok(None)
}
