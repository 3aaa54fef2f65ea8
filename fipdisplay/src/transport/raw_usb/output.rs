use std::thread;
use std::time::{Duration, Instant};

use crate::config::RetryPolicy;
use crate::error::{FipError, Result};

use super::packet::CommandBuffer;

/// The pair of bulk endpoints of the panel's vendor interface.
pub trait BulkPipe {
    fn write(&self, data: &[u8], timeout: Duration) -> rusb::Result<usize>;
    fn read(&self, buf: &mut [u8], timeout: Duration) -> rusb::Result<usize>;
}

impl<P: BulkPipe + ?Sized> BulkPipe for &P {
    fn write(&self, data: &[u8], timeout: Duration) -> rusb::Result<usize> {
        (**self).write(data, timeout)
    }

    fn read(&self, buf: &mut [u8], timeout: Duration) -> rusb::Result<usize> {
        (**self).read(buf, timeout)
    }
}

/// Serializes command headers and their payloads onto the bulk OUT endpoint.
pub struct OutputPump<'p, P: BulkPipe + ?Sized> {
    pipe: &'p P,
    retry: RetryPolicy,
    timeout: Duration,
}

impl<'p, P: BulkPipe + ?Sized> OutputPump<'p, P> {
    pub fn new(pipe: &'p P, retry: RetryPolicy, timeout: Duration) -> Self {
        Self {
            pipe,
            retry,
            timeout,
        }
    }

    pub fn send(&self, command: &CommandBuffer, payload: Option<&[u8]>) -> Result<()> {
        let payload = payload.unwrap_or_default();
        if payload.len() != command.data_size as usize {
            return Err(FipError::Protocol(format!(
                "header announces {} payload bytes but {} were supplied",
                command.data_size,
                payload.len()
            )));
        }

        let header = command.to_bytes();
        log::debug!("out: {}", hex::encode(header));
        self.write_with_retry(&header)?;

        if !payload.is_empty() {
            log::trace!("out: [{} bytes of payload]", payload.len());
            self.write_exact(payload)?;
        }
        Ok(())
    }

    // The header write is the one the panel stalls on while it is busy, so
    // only it is retried.
    fn write_with_retry(&self, data: &[u8]) -> Result<()> {
        let started = Instant::now();
        let mut attempts = 0;
        loop {
            attempts += 1;
            match self.write_exact(data) {
                Err(FipError::Usb(rusb::Error::Timeout)) => {
                    let elapsed = started.elapsed();
                    if attempts >= self.retry.max_attempts || elapsed >= self.retry.deadline {
                        log::error!("giving up after {} write attempts", attempts);
                        return Err(FipError::RetriesExhausted { attempts, elapsed });
                    }
                    let backoff = self.retry.backoff(attempts);
                    log::warn!(
                        "write timed out (attempt {}), retrying in {:?}",
                        attempts,
                        backoff
                    );
                    thread::sleep(backoff);
                }
                other => return other,
            }
        }
    }

    fn write_exact(&self, data: &[u8]) -> Result<()> {
        let written = self.pipe.write(data, self.timeout)?;
        if written != data.len() {
            return Err(FipError::Protocol(format!(
                "short bulk write: {} of {} bytes",
                written,
                data.len()
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    #[derive(Default)]
    struct ScriptedPipe {
        failures: Mutex<VecDeque<rusb::Error>>,
        written: Mutex<Vec<Vec<u8>>>,
    }

    impl BulkPipe for ScriptedPipe {
        fn write(&self, data: &[u8], _timeout: Duration) -> rusb::Result<usize> {
            if let Some(err) = self.failures.lock().unwrap().pop_front() {
                return Err(err);
            }
            self.written.lock().unwrap().push(data.to_vec());
            Ok(data.len())
        }

        fn read(&self, _buf: &mut [u8], _timeout: Duration) -> rusb::Result<usize> {
            Err(rusb::Error::Timeout)
        }
    }

    fn fast_retry(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(2),
            max_attempts,
            deadline: Duration::from_secs(5),
        }
    }

    #[test]
    fn retries_header_after_timeouts() {
        let pipe = ScriptedPipe::default();
        pipe.failures
            .lock()
            .unwrap()
            .extend([rusb::Error::Timeout, rusb::Error::Timeout]);

        let pump = OutputPump::new(&pipe, fast_retry(5), Duration::from_millis(10));
        pump.send(&CommandBuffer::probe(), None).unwrap();

        let written = pipe.written.lock().unwrap();
        assert_eq!(written.len(), 1);
        assert_eq!(written[0], CommandBuffer::probe().to_bytes().to_vec());
    }

    #[test]
    fn gives_up_after_max_attempts() {
        let pipe = ScriptedPipe::default();
        pipe.failures
            .lock()
            .unwrap()
            .extend(std::iter::repeat_with(|| rusb::Error::Timeout).take(4));

        let pump = OutputPump::new(&pipe, fast_retry(3), Duration::from_millis(10));
        let err = pump.send(&CommandBuffer::probe(), None).unwrap_err();
        assert!(matches!(err, FipError::RetriesExhausted { attempts: 3, .. }));
        assert!(pipe.written.lock().unwrap().is_empty());
    }

    #[test]
    fn other_usb_errors_are_not_retried() {
        let pipe = ScriptedPipe::default();
        pipe.failures.lock().unwrap().push_back(rusb::Error::Pipe);

        let pump = OutputPump::new(&pipe, fast_retry(5), Duration::from_millis(10));
        let err = pump.send(&CommandBuffer::probe(), None).unwrap_err();
        assert!(matches!(err, FipError::Usb(rusb::Error::Pipe)));
    }

    #[test]
    fn payload_follows_header() {
        let pipe = ScriptedPipe::default();
        let pump = OutputPump::new(&pipe, fast_retry(1), Duration::from_millis(10));
        let payload = vec![0xab; 12];
        pump.send(&CommandBuffer::save_file(1, 2, 12), Some(&payload))
            .unwrap();

        let written = pipe.written.lock().unwrap();
        assert_eq!(written.len(), 2);
        assert_eq!(written[0].len(), 44);
        assert_eq!(written[1], payload);
    }

    #[test]
    fn mismatched_payload_is_rejected_before_writing() {
        let pipe = ScriptedPipe::default();
        let pump = OutputPump::new(&pipe, fast_retry(1), Duration::from_millis(10));
        let err = pump
            .send(&CommandBuffer::set_image(0, 100), Some(&[0u8; 99]))
            .unwrap_err();
        assert!(matches!(err, FipError::Protocol(_)));
        assert!(pipe.written.lock().unwrap().is_empty());
    }
}
