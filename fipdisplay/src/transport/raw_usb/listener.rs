use std::time::Duration;

use crossbeam::channel::{Receiver, Sender, TrySendError};

use crate::cancel::CancelToken;
use crate::error::{FipError, Result};

use super::output::BulkPipe;
use super::packet::{CommandBuffer, COMMAND_SIZE};

/// Reads 44-byte responses off the bulk IN endpoint until `stop` is set.
///
/// Read timeouts only mean the panel had nothing to say. Any other transfer
/// error ends the loop and is handed back to the session. When `responses`
/// is full the oldest queued response is taken off `backlog` to make room.
/// Returns the number of responses received.
pub(crate) fn listen<P: BulkPipe + ?Sized>(
    pipe: &P,
    poll: Duration,
    stop: &CancelToken,
    responses: Sender<CommandBuffer>,
    backlog: Receiver<CommandBuffer>,
) -> Result<usize> {
    let mut buf = [0u8; COMMAND_SIZE];
    let mut received = 0;

    while !stop.is_cancelled() {
        let read = match pipe.read(&mut buf, poll) {
            Ok(read) => read,
            Err(rusb::Error::Timeout) => continue,
            Err(err) => {
                log::error!("input listener failed: {}", err);
                return Err(err.into());
            }
        };
        if read != COMMAND_SIZE {
            return Err(FipError::Protocol(format!(
                "short response: {} of {} bytes ({})",
                read,
                COMMAND_SIZE,
                hex::encode(&buf[..read])
            )));
        }

        let response = CommandBuffer::from_bytes(&buf)?;
        if response.has_error() {
            log::warn!("in: {}", hex::encode(buf));
        } else {
            log::info!("in: {}", hex::encode(buf));
        }
        received += 1;
        forward(&responses, &backlog, response);
    }

    log::debug!("input listener stopped after {} responses", received);
    Ok(received)
}

fn forward(
    responses: &Sender<CommandBuffer>,
    backlog: &Receiver<CommandBuffer>,
    response: CommandBuffer,
) {
    let response = match responses.try_send(response) {
        Err(TrySendError::Full(response)) => response,
        _ => return,
    };
    if let Ok(oldest) = backlog.try_recv() {
        log::debug!("response backlog full, dropping {:?}", oldest);
    }
    // only this thread sends, so there is room now
    let _ = responses.try_send(response);
}
