use std::cell::Cell;
use std::thread;
use std::time::Duration;

use crossbeam::channel::{self, Receiver, RecvTimeoutError, SendTimeoutError, Sender, TrySendError};

use crate::cancel::CancelToken;
use crate::error::{FipError, Result};
use crate::frame::Frame;

// How often blocked queue operations re-check the cancel token.
const CANCEL_POLL: Duration = Duration::from_millis(50);

/// Anything that can put a frame on the screen.
pub trait FrameSink {
    fn show_frame(&mut self, frame: &Frame) -> Result<()>;
}

impl<S: FrameSink + ?Sized> FrameSink for &mut S {
    fn show_frame(&mut self, frame: &Frame) -> Result<()> {
        (**self).show_frame(frame)
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PumpReport {
    pub produced: usize,
    pub delivered: usize,
    pub failed: usize,
}

/// Producer half handed to the closure passed to [`FramePump::run`].
pub struct FrameProducer<'a> {
    sender: Sender<Frame>,
    cancel: &'a CancelToken,
    produced: Cell<usize>,
}

impl FrameProducer<'_> {
    /// Queues a frame, blocking while the queue is full. Frames are never dropped.
    pub fn push(&self, frame: Frame) -> Result<()> {
        let mut frame = frame;
        loop {
            if self.cancel.is_cancelled() {
                return Err(FipError::Cancelled);
            }
            match self.sender.send_timeout(frame, CANCEL_POLL) {
                Ok(()) => {
                    self.produced.set(self.produced.get() + 1);
                    return Ok(());
                }
                Err(SendTimeoutError::Timeout(pending)) => frame = pending,
                Err(SendTimeoutError::Disconnected(_)) => return Err(FipError::ConsumerGone),
            }
        }
    }

    /// Queues a frame without blocking; hands the frame back when the queue is full.
    pub fn try_push(&self, frame: Frame) -> Result<Option<Frame>> {
        match self.sender.try_send(frame) {
            Ok(()) => {
                self.produced.set(self.produced.get() + 1);
                Ok(None)
            }
            Err(TrySendError::Full(frame)) => Ok(Some(frame)),
            Err(TrySendError::Disconnected(_)) => Err(FipError::ConsumerGone),
        }
    }

    pub fn pending(&self) -> usize {
        self.sender.len()
    }

    pub fn capacity(&self) -> usize {
        self.sender.capacity().unwrap_or(0)
    }
}

/// Bounded producer/consumer pipeline between a frame source and a device.
#[derive(Debug, Clone)]
pub struct FramePump {
    capacity: usize,
    cancel: CancelToken,
}

#[derive(Debug, Default)]
struct ConsumerStats {
    delivered: usize,
    failed: usize,
}

impl FramePump {
    pub fn new(capacity: usize, cancel: CancelToken) -> Self {
        Self {
            capacity: capacity.max(1),
            cancel,
        }
    }

    /// Runs `produce` on the calling thread while a scoped consumer thread feeds
    /// `sink`. Returns once the producer finished and every queued frame was
    /// handed to the sink, or as soon as the cancel token is set.
    pub fn run<S, P>(&self, sink: &mut S, produce: P) -> Result<PumpReport>
    where
        S: FrameSink + Send,
        P: FnOnce(&FrameProducer<'_>) -> Result<()>,
    {
        let (sender, receiver) = channel::bounded(self.capacity);
        let cancel = &self.cancel;

        thread::scope(|scope| {
            let consumer = thread::Builder::new()
                .name("fip frame consumer".to_owned())
                .spawn_scoped(scope, move || consume(receiver, sink, cancel))?;

            let producer = FrameProducer {
                sender,
                cancel,
                produced: Cell::new(0),
            };
            let produced = produce(&producer);
            let produced_count = producer.produced.get();
            // closing the queue lets the consumer drain and exit
            drop(producer);

            let stats = match consumer.join() {
                Ok(stats) => stats,
                Err(_) => {
                    log::error!("frame consumer panicked");
                    return Err(FipError::ConsumerPanicked);
                }
            };
            produced?;

            let report = PumpReport {
                produced: produced_count,
                delivered: stats.delivered,
                failed: stats.failed,
            };
            log::info!(
                "frame pump finished: {} produced, {} delivered, {} failed",
                report.produced,
                report.delivered,
                report.failed
            );
            Ok(report)
        })
    }
}

fn consume<S: FrameSink>(receiver: Receiver<Frame>, sink: &mut S, cancel: &CancelToken) -> ConsumerStats {
    let mut stats = ConsumerStats::default();
    loop {
        if cancel.is_cancelled() {
            log::debug!("frame consumer cancelled with {} frames queued", receiver.len());
            break;
        }
        let frame = match receiver.recv_timeout(CANCEL_POLL) {
            Ok(frame) => frame,
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        };
        match sink.show_frame(&frame) {
            Ok(()) => stats.delivered += 1,
            Err(err) => {
                log::warn!("could not show frame: {}", err);
                stats.failed += 1;
            }
        }
    }
    stats
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{PixelOrder, FRAME_SIZE};

    struct Collect(Vec<u8>);

    impl FrameSink for Collect {
        fn show_frame(&mut self, frame: &Frame) -> Result<()> {
            self.0.push(frame.as_bytes()[0]);
            Ok(())
        }
    }

    fn numbered(n: u8) -> Frame {
        Frame::from_device_bytes(vec![n; FRAME_SIZE]).unwrap()
    }

    #[test]
    fn delivers_everything_in_order() {
        let pump = FramePump::new(4, CancelToken::new());
        let mut sink = Collect(Vec::new());
        let report = pump
            .run(&mut sink, |producer| {
                for n in 0..20 {
                    producer.push(numbered(n))?;
                }
                Ok(())
            })
            .unwrap();

        assert_eq!(sink.0, (0..20).collect::<Vec<u8>>());
        assert_eq!(report, PumpReport { produced: 20, delivered: 20, failed: 0 });
    }

    #[test]
    fn producer_error_still_drains_queue() {
        let pump = FramePump::new(8, CancelToken::new());
        let mut sink = Collect(Vec::new());
        let result = pump.run(&mut sink, |producer| {
            producer.push(Frame::solid(9, 9, 9, PixelOrder::Rgb))?;
            Err(FipError::Protocol("source broke".into()))
        });

        assert!(matches!(result, Err(FipError::Protocol(_))));
        assert_eq!(sink.0, vec![9]);
    }

    #[test]
    fn zero_capacity_is_clamped() {
        let pump = FramePump::new(0, CancelToken::new());
        let mut sink = Collect(Vec::new());
        pump.run(&mut sink, |producer| {
            assert_eq!(producer.capacity(), 1);
            producer.push(numbered(1))
        })
        .unwrap();
        assert_eq!(sink.0, vec![1]);
    }
}
