use thiserror::Error;

/// Status word returned by every DirectOutput call.
#[allow(clippy::upper_case_acronyms)]
pub type HRESULT = i64;

pub const S_OK: HRESULT = 0x0000_0000;
pub const E_HANDLE: HRESULT = 0x8007_0006;
pub const E_INVALIDARG: HRESULT = 0x8007_0057;
pub const E_OUTOFMEMORY: HRESULT = 0x8007_000e;
/// The misspelled out-of-memory code some library builds return.
pub const E_OUTOFMEMORY_WIDE: HRESULT = 0x8_0007_000e;
pub const E_NOTIMPL: HRESULT = 0x8000_4001;
pub const E_BUFFERTOOSMALL: HRESULT = 0xff04_006f;
pub const E_PAGENOTACTIVE: HRESULT = 0xff04_0001;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusKind {
    InvalidHandle,
    InvalidArgument,
    OutOfMemory,
    NotImplemented,
    BufferTooSmall,
    PageNotActive,
    Unknown,
}

impl StatusKind {
    pub fn from_code(code: HRESULT) -> Self {
        match widen(code) {
            E_HANDLE => StatusKind::InvalidHandle,
            E_INVALIDARG => StatusKind::InvalidArgument,
            E_OUTOFMEMORY | E_OUTOFMEMORY_WIDE => StatusKind::OutOfMemory,
            E_NOTIMPL => StatusKind::NotImplemented,
            E_BUFFERTOOSMALL => StatusKind::BufferTooSmall,
            E_PAGENOTACTIVE => StatusKind::PageNotActive,
            _ => StatusKind::Unknown,
        }
    }
}

// A 32-bit HRESULT that came back sign-extended, mapped to its zero-extended
// form. Anything outside the i32 range is left alone.
fn widen(code: HRESULT) -> HRESULT {
    match i32::try_from(code) {
        Ok(narrow) if narrow < 0 => HRESULT::from(narrow as u32),
        _ => code,
    }
}

/// A DirectOutput call returned something other than `S_OK`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{operation} failed with status {code:#010x} ({kind:?})")]
pub struct StatusError {
    pub operation: &'static str,
    pub code: HRESULT,
    pub kind: StatusKind,
}

pub fn check_status(operation: &'static str, code: HRESULT) -> Result<(), StatusError> {
    if code == S_OK {
        return Ok(());
    }
    let err = StatusError {
        operation,
        code,
        kind: StatusKind::from_code(code),
    };
    log::debug!("{}", err);
    Err(err)
}
