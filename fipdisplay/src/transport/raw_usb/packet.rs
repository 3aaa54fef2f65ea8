use std::fmt;

use crate::error::{FipError, Result};

/// Every OUT header and every IN response is exactly this long.
pub const COMMAND_SIZE: usize = 44;
const FIELD_COUNT: usize = COMMAND_SIZE / 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum Request {
    FolderRemoved = 0x02,
    SaveFile = 0x03,
    DisplayFile = 0x04,
    SetImage = 0x06,
    DeleteFile = 0x07,
    StartServer = 0x09,
    /// Answered with an error by a panel in normal mode.
    Probe = 0x0a,
    ClearImage = 0x13,
    SetLed = 0x18,
}

impl TryFrom<u32> for Request {
    type Error = FipError;

    fn try_from(value: u32) -> Result<Self> {
        Ok(match value {
            0x02 => Request::FolderRemoved,
            0x03 => Request::SaveFile,
            0x04 => Request::DisplayFile,
            0x06 => Request::SetImage,
            0x07 => Request::DeleteFile,
            0x09 => Request::StartServer,
            0x0a => Request::Probe,
            0x13 => Request::ClearImage,
            0x18 => Request::SetLed,
            other => {
                return Err(FipError::Protocol(format!(
                    "unknown request code {other:#04x}"
                )))
            }
        })
    }
}

/// The 44-byte command header: eleven big-endian u32 fields.
///
/// ```text
///  0 server_id     1 page          2 data_size     3 header_error
///  4 header_info   5 request       6 param_1       7 param_2
///  8 param_3       9 request_error 10 request_info
/// ```
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct CommandBuffer {
    pub server_id: u32,
    pub page: u32,
    /// Length of the payload written right after the header.
    pub data_size: u32,
    pub header_error: u32,
    pub header_info: u32,
    pub request: u32,
    pub param_1: u32,
    pub param_2: u32,
    pub param_3: u32,
    pub request_error: u32,
    pub request_info: u32,
}

impl CommandBuffer {
    pub fn new(request: Request) -> Self {
        Self {
            request: request as u32,
            ..Self::default()
        }
    }

    pub fn probe() -> Self {
        Self::new(Request::Probe)
    }

    pub fn set_image(page: u32, data_size: u32) -> Self {
        Self {
            page,
            data_size,
            ..Self::new(Request::SetImage)
        }
    }

    pub fn clear_image(page: u32) -> Self {
        Self {
            page,
            ..Self::new(Request::ClearImage)
        }
    }

    pub fn set_led(page: u32, index: u32, on: bool) -> Self {
        Self {
            param_1: page,
            param_2: index,
            param_3: on.into(),
            ..Self::new(Request::SetLed)
        }
    }

    pub fn save_file(page: u32, file: u32, data_size: u32) -> Self {
        Self {
            data_size,
            param_1: page,
            param_3: file,
            ..Self::new(Request::SaveFile)
        }
    }

    pub fn display_file(page: u32, index: u32, file: u32) -> Self {
        Self {
            param_1: page,
            param_2: index,
            param_3: file,
            ..Self::new(Request::DisplayFile)
        }
    }

    pub fn delete_file(page: u32, file: u32) -> Self {
        Self {
            param_1: page,
            param_3: file,
            ..Self::new(Request::DeleteFile)
        }
    }

    pub fn request(&self) -> Result<Request> {
        Request::try_from(self.request)
    }

    pub fn has_error(&self) -> bool {
        self.header_error > 0 || self.request_error > 0
    }

    pub fn fields(&self) -> [u32; FIELD_COUNT] {
        [
            self.server_id,
            self.page,
            self.data_size,
            self.header_error,
            self.header_info,
            self.request,
            self.param_1,
            self.param_2,
            self.param_3,
            self.request_error,
            self.request_info,
        ]
    }

    pub fn from_fields(f: [u32; FIELD_COUNT]) -> Self {
        let [server_id, page, data_size, header_error, header_info, request, param_1, param_2, param_3, request_error, request_info] =
            f;
        Self {
            server_id,
            page,
            data_size,
            header_error,
            header_info,
            request,
            param_1,
            param_2,
            param_3,
            request_error,
            request_info,
        }
    }

    pub fn to_bytes(&self) -> [u8; COMMAND_SIZE] {
        let mut buf = [0u8; COMMAND_SIZE];
        for (chunk, field) in buf.chunks_exact_mut(4).zip(self.fields()) {
            chunk.copy_from_slice(&field.to_be_bytes());
        }
        buf
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() != COMMAND_SIZE {
            return Err(FipError::Protocol(format!(
                "command buffer must be {} bytes, got {}",
                COMMAND_SIZE,
                data.len()
            )));
        }
        let mut fields = [0u32; FIELD_COUNT];
        for (field, chunk) in fields.iter_mut().zip(data.chunks_exact(4)) {
            *field = u32::from_be_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        }
        Ok(Self::from_fields(fields))
    }
}

impl fmt::Debug for CommandBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandBuffer")
            .field("request", &format_args!("{:#04x}", self.request))
            .field("page", &self.page)
            .field("data_size", &self.data_size)
            .field("params", &[self.param_1, self.param_2, self.param_3])
            .field("errors", &[self.header_error, self.request_error])
            .field("bytes", &hex::encode(self.to_bytes()))
            .finish()
    }
}
