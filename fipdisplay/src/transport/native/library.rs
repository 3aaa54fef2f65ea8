use std::ffi::c_void;
use std::iter;
use std::panic::{self, AssertUnwindSafe};
use std::path::Path;
use std::sync::{Mutex, PoisonError};

use libc::wchar_t;
use libloading::Library;
use uuid::Uuid;

use crate::error::{FipError, Result};

use super::status::{check_status, HRESULT};
use super::{
    DeviceChangeCallback, DeviceHandle, DirectOutputApi, PageChangeCallback, SoftButtonCallback,
};

#[allow(clippy::upper_case_acronyms)]
type DWORD = i32;
type RawDevice = *mut c_void;
type Context = *mut c_void;

type EnumerateCallbackFn = unsafe extern "system" fn(RawDevice, Context);
type DeviceChangeFn = unsafe extern "system" fn(RawDevice, bool, Context);
type PageChangeFn = unsafe extern "system" fn(RawDevice, DWORD, bool, Context);
type SoftButtonChangeFn = unsafe extern "system" fn(RawDevice, DWORD, Context);

type InitializeFn = unsafe extern "system" fn(*const wchar_t) -> HRESULT;
type DeinitializeFn = unsafe extern "system" fn() -> HRESULT;
type RegisterDeviceCallbackFn = unsafe extern "system" fn(DeviceChangeFn, Context) -> HRESULT;
type EnumerateFn = unsafe extern "system" fn(EnumerateCallbackFn, Context) -> HRESULT;
type RegisterPageCallbackFn = unsafe extern "system" fn(RawDevice, PageChangeFn, Context) -> HRESULT;
type RegisterSoftButtonCallbackFn =
    unsafe extern "system" fn(RawDevice, SoftButtonChangeFn, Context) -> HRESULT;
type SetLedFn = unsafe extern "system" fn(RawDevice, DWORD, DWORD, DWORD) -> HRESULT;
type SetImageFn = unsafe extern "system" fn(RawDevice, DWORD, DWORD, DWORD, *const c_void) -> HRESULT;
type GetSerialNumberFn = unsafe extern "system" fn(RawDevice, *mut wchar_t, DWORD) -> HRESULT;
type GetDeviceTypeFn = unsafe extern "system" fn(RawDevice, *mut Guid) -> HRESULT;

const SERIAL_NUMBER_CAPACITY: usize = 64;

#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
struct Guid {
    data1: u32,
    data2: u16,
    data3: u16,
    data4: [u8; 8],
}

impl From<Guid> for Uuid {
    fn from(guid: Guid) -> Self {
        Uuid::from_fields(guid.data1, guid.data2, guid.data3, &guid.data4)
    }
}

#[derive(Clone, Copy)]
struct Symbols {
    initialize: InitializeFn,
    deinitialize: DeinitializeFn,
    register_device_callback: RegisterDeviceCallbackFn,
    enumerate: EnumerateFn,
    register_page_callback: RegisterPageCallbackFn,
    register_soft_button_callback: RegisterSoftButtonCallbackFn,
    set_led: SetLedFn,
    set_image: SetImageFn,
    get_serial_number: GetSerialNumberFn,
    get_device_type: GetDeviceTypeFn,
}

impl Symbols {
    unsafe fn resolve(library: &Library) -> std::result::Result<Self, libloading::Error> {
        Ok(Self {
            initialize: *library.get::<InitializeFn>(b"DirectOutput_Initialize\0")?,
            deinitialize: *library.get::<DeinitializeFn>(b"DirectOutput_Deinitialize\0")?,
            register_device_callback: *library
                .get::<RegisterDeviceCallbackFn>(b"DirectOutput_RegisterDeviceCallback\0")?,
            enumerate: *library.get::<EnumerateFn>(b"DirectOutput_Enumerate\0")?,
            register_page_callback: *library
                .get::<RegisterPageCallbackFn>(b"DirectOutput_RegisterPageCallback\0")?,
            register_soft_button_callback: *library
                .get::<RegisterSoftButtonCallbackFn>(b"DirectOutput_RegisterSoftButtonCallback\0")?,
            set_led: *library.get::<SetLedFn>(b"DirectOutput_SetLed\0")?,
            set_image: *library.get::<SetImageFn>(b"DirectOutput_SetImage\0")?,
            get_serial_number: *library.get::<GetSerialNumberFn>(b"DirectOutput_GetSerialNumber\0")?,
            get_device_type: *library.get::<GetDeviceTypeFn>(b"DirectOutput_GetDeviceType\0")?,
        })
    }
}

/// A boxed callback whose pointer has been handed to the library.
struct CallbackSlot {
    context: *mut c_void,
    free: unsafe fn(*mut c_void),
}

// The boxed callbacks are all `Send`.
unsafe impl Send for CallbackSlot {}

impl CallbackSlot {
    fn new<C: Send>(callback: C) -> Self {
        Self {
            context: Box::into_raw(Box::new(callback)).cast(),
            free: free_boxed::<C>,
        }
    }
}

unsafe fn free_boxed<C>(context: *mut c_void) {
    drop(Box::from_raw(context.cast::<C>()));
}

impl Drop for CallbackSlot {
    fn drop(&mut self) {
        unsafe { (self.free)(self.context) }
    }
}

/// The vendor DirectOutput library, loaded at runtime.
pub struct DirectOutputLibrary {
    symbols: Symbols,
    callbacks: Mutex<Vec<CallbackSlot>>,
    // declared last so the callbacks are freed before the code is unmapped
    _library: Library,
}

impl DirectOutputLibrary {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let library = unsafe { Library::new(path)? };
        let symbols = unsafe { Symbols::resolve(&library)? };
        log::info!("loaded DirectOutput library from {}", path.display());

        Ok(Self {
            symbols,
            callbacks: Mutex::new(Vec::new()),
            _library: library,
        })
    }

    fn register(
        &self,
        operation: &'static str,
        slot: CallbackSlot,
        call: impl FnOnce(Context) -> HRESULT,
    ) -> Result<()> {
        // slot is freed on failure, the library never saw a success
        check_status(operation, call(slot.context))?;
        self.callbacks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(slot);
        Ok(())
    }
}

fn dword(what: &str, value: u32) -> Result<DWORD> {
    DWORD::try_from(value)
        .map_err(|_| FipError::InvalidArgument(format!("{what} {value} does not fit a DWORD")))
}

impl DirectOutputApi for DirectOutputLibrary {
    fn initialize(&self, plugin_name: &str) -> Result<()> {
        let name = to_wide(plugin_name);
        let status = unsafe { (self.symbols.initialize)(name.as_ptr()) };
        Ok(check_status("DirectOutput_Initialize", status)?)
    }

    fn deinitialize(&self) -> Result<()> {
        let status = unsafe { (self.symbols.deinitialize)() };
        Ok(check_status("DirectOutput_Deinitialize", status)?)
    }

    fn enumerate(&self) -> Result<Vec<DeviceHandle>> {
        let mut found: Vec<DeviceHandle> = Vec::new();
        let context: Context = (&mut found as *mut Vec<DeviceHandle>).cast();
        // the library calls back before Enumerate returns
        let status = unsafe { (self.symbols.enumerate)(enumerate_trampoline, context) };
        check_status("DirectOutput_Enumerate", status)?;
        Ok(found)
    }

    fn set_image(&self, device: DeviceHandle, page: u32, index: u32, data: &[u8]) -> Result<()> {
        let len = u32::try_from(data.len())
            .map_err(|_| FipError::InvalidArgument(format!("image of {} bytes", data.len())))?;
        let status = unsafe {
            (self.symbols.set_image)(
                device.as_ptr(),
                dword("page", page)?,
                dword("image index", index)?,
                dword("image size", len)?,
                data.as_ptr().cast(),
            )
        };
        Ok(check_status("DirectOutput_SetImage", status)?)
    }

    fn set_led(&self, device: DeviceHandle, page: u32, index: u32, on: bool) -> Result<()> {
        let status = unsafe {
            (self.symbols.set_led)(
                device.as_ptr(),
                dword("page", page)?,
                dword("led index", index)?,
                DWORD::from(on),
            )
        };
        Ok(check_status("DirectOutput_SetLed", status)?)
    }

    fn serial_number(&self, device: DeviceHandle) -> Result<String> {
        let mut buf: [wchar_t; SERIAL_NUMBER_CAPACITY] = [0; SERIAL_NUMBER_CAPACITY];
        let status = unsafe {
            (self.symbols.get_serial_number)(
                device.as_ptr(),
                buf.as_mut_ptr(),
                SERIAL_NUMBER_CAPACITY as DWORD,
            )
        };
        check_status("DirectOutput_GetSerialNumber", status)?;
        Ok(from_wide(&buf))
    }

    fn device_type(&self, device: DeviceHandle) -> Result<Uuid> {
        let mut guid = Guid::default();
        let status = unsafe { (self.symbols.get_device_type)(device.as_ptr(), &mut guid) };
        check_status("DirectOutput_GetDeviceType", status)?;
        Ok(guid.into())
    }

    fn register_device_callback(&self, callback: DeviceChangeCallback) -> Result<()> {
        let register = self.symbols.register_device_callback;
        self.register(
            "DirectOutput_RegisterDeviceCallback",
            CallbackSlot::new(callback),
            |context| unsafe { register(device_change_trampoline, context) },
        )
    }

    fn register_page_callback(&self, device: DeviceHandle, callback: PageChangeCallback) -> Result<()> {
        let register = self.symbols.register_page_callback;
        self.register(
            "DirectOutput_RegisterPageCallback",
            CallbackSlot::new(callback),
            |context| unsafe { register(device.as_ptr(), page_change_trampoline, context) },
        )
    }

    fn register_soft_button_callback(
        &self,
        device: DeviceHandle,
        callback: SoftButtonCallback,
    ) -> Result<()> {
        let register = self.symbols.register_soft_button_callback;
        self.register(
            "DirectOutput_RegisterSoftButtonCallback",
            CallbackSlot::new(callback),
            |context| unsafe { register(device.as_ptr(), soft_button_trampoline, context) },
        )
    }
}

unsafe extern "system" fn enumerate_trampoline(device: RawDevice, context: Context) {
    let found = &mut *context.cast::<Vec<DeviceHandle>>();
    found.push(DeviceHandle::from_raw(device));
}

// Unwinding into the library is undefined behaviour, so panics stop here.
fn guarded(what: &str, call: impl FnOnce()) {
    if panic::catch_unwind(AssertUnwindSafe(call)).is_err() {
        log::error!("{} callback panicked", what);
    }
}

unsafe extern "system" fn device_change_trampoline(device: RawDevice, added: bool, context: Context) {
    let callback = &mut *context.cast::<DeviceChangeCallback>();
    guarded("device change", || callback(DeviceHandle::from_raw(device), added));
}

unsafe extern "system" fn page_change_trampoline(
    device: RawDevice,
    page: DWORD,
    active: bool,
    context: Context,
) {
    let callback = &mut *context.cast::<PageChangeCallback>();
    guarded("page change", || {
        callback(DeviceHandle::from_raw(device), page as u32, active)
    });
}

unsafe extern "system" fn soft_button_trampoline(device: RawDevice, buttons: DWORD, context: Context) {
    let callback = &mut *context.cast::<SoftButtonCallback>();
    guarded("soft button", || {
        callback(DeviceHandle::from_raw(device), buttons as u32)
    });
}

#[cfg(windows)]
fn to_wide(s: &str) -> Vec<wchar_t> {
    s.encode_utf16().chain(iter::once(0)).collect()
}

#[cfg(not(windows))]
fn to_wide(s: &str) -> Vec<wchar_t> {
    s.chars()
        .map(|c| c as wchar_t)
        .chain(iter::once(0))
        .collect()
}

fn until_nul(buf: &[wchar_t]) -> &[wchar_t] {
    let end = buf.iter().position(|&c| c == 0).unwrap_or(buf.len());
    &buf[..end]
}

#[cfg(windows)]
fn from_wide(buf: &[wchar_t]) -> String {
    String::from_utf16_lossy(until_nul(buf))
}

#[cfg(not(windows))]
fn from_wide(buf: &[wchar_t]) -> String {
    until_nul(buf)
        .iter()
        .map(|&c| char::from_u32(c as u32).unwrap_or(char::REPLACEMENT_CHARACTER))
        .collect()
}
