use std::collections::{HashSet, VecDeque};
use std::sync::Mutex;
use std::thread;
use std::time::Duration;

use fipdisplay::transport::raw_usb::{self, BulkPipe, CommandBuffer, ProbeOutcome, Request, COMMAND_SIZE};
use fipdisplay::{
    CancelToken, FilterType, FipConfig, FipError, Frame, FramePump, PixelOrder, RetryPolicy,
    FRAME_SIZE,
};
use image::{DynamicImage, Rgb, RgbImage};

#[derive(Default)]
struct PanelState {
    awaiting_payload: Option<CommandBuffer>,
    responses: VecDeque<[u8; COMMAND_SIZE]>,
    writes: Vec<Vec<u8>>,
    write_timeouts: usize,
}

/// Answers every command like a panel in normal mode: the probe is
/// rejected, everything else accepted unless listed in `reject`.
#[derive(Default)]
struct FakePanel {
    state: Mutex<PanelState>,
    reject: HashSet<u32>,
    factory_mode: bool,
    read_error: Option<rusb::Error>,
}

impl FakePanel {
    fn respond(&self, state: &mut PanelState, command: CommandBuffer) {
        let mut response = command;
        response.data_size = 0;
        let rejected = if command.request == Request::Probe as u32 {
            !self.factory_mode
        } else {
            self.reject.contains(&command.request)
        };
        if rejected {
            response.request_error = 1;
        }
        state.responses.push_back(response.to_bytes());
    }

    fn writes(&self) -> Vec<Vec<u8>> {
        self.state.lock().unwrap().writes.clone()
    }
}

impl BulkPipe for FakePanel {
    fn write(&self, data: &[u8], _timeout: Duration) -> rusb::Result<usize> {
        let mut state = self.state.lock().unwrap();
        if state.write_timeouts > 0 {
            state.write_timeouts -= 1;
            return Err(rusb::Error::Timeout);
        }
        state.writes.push(data.to_vec());

        if let Some(command) = state.awaiting_payload.take() {
            self.respond(&mut state, command);
        } else {
            let command = CommandBuffer::from_bytes(data).map_err(|_| rusb::Error::Io)?;
            if command.data_size > 0 {
                state.awaiting_payload = Some(command);
            } else {
                self.respond(&mut state, command);
            }
        }
        Ok(data.len())
    }

    fn read(&self, buf: &mut [u8], timeout: Duration) -> rusb::Result<usize> {
        if let Some(err) = &self.read_error {
            return Err(err.clone());
        }
        if let Some(response) = self.state.lock().unwrap().responses.pop_front() {
            buf[..COMMAND_SIZE].copy_from_slice(&response);
            return Ok(COMMAND_SIZE);
        }
        thread::sleep(timeout);
        Err(rusb::Error::Timeout)
    }
}

fn test_config() -> FipConfig {
    FipConfig {
        listener_poll: Duration::from_millis(5),
        response_timeout: Duration::from_secs(2),
        transfer_timeout: Duration::from_millis(10),
        retry: RetryPolicy {
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(4),
            max_attempts: 4,
            deadline: Duration::from_secs(2),
        },
        ..FipConfig::default()
    }
}

fn gradient() -> DynamicImage {
    DynamicImage::ImageRgb8(RgbImage::from_fn(320, 240, |x, y| {
        Rgb([(x % 256) as u8, (y % 256) as u8, 0x80])
    }))
}

#[test]
fn set_image_header_announces_the_payload_that_follows() {
    for order in [PixelOrder::Rgb, PixelOrder::Reversed] {
        let panel = FakePanel::default();
        let frame = Frame::from_image(&gradient(), order, FilterType::Nearest).unwrap();
        let cancel = CancelToken::new();

        let outcome = raw_usb::run_session(&panel, &test_config(), &cancel, |link| {
            assert_eq!(link.probe()?, ProbeOutcome::Normal);
            link.set_image(1, &frame)
        });
        outcome.unwrap();

        let writes = panel.writes();
        assert_eq!(writes.len(), 3);
        assert_eq!(writes[0], CommandBuffer::probe().to_bytes().to_vec());

        let header = CommandBuffer::from_bytes(&writes[1]).unwrap();
        assert_eq!(header.request().unwrap(), Request::SetImage);
        assert_eq!(header.page, 1);
        assert_eq!(header.data_size as usize, FRAME_SIZE);
        assert_eq!(&writes[1][8..12], &[0x00, 0x03, 0x84, 0x00]);
        assert_eq!(writes[2].len(), FRAME_SIZE);
        assert_eq!(writes[2].as_slice(), frame.as_bytes());
    }
}

#[test]
fn pump_streams_frames_over_the_link() {
    let panel = FakePanel::default();
    let config = test_config();
    let cancel = CancelToken::new();

    let report = raw_usb::run_session(&panel, &config, &cancel, |link| {
        link.set_page(2);
        let pump = FramePump::new(config.queue_capacity, cancel.clone());
        pump.run(link, |producer| {
            for shade in [0x10, 0x20, 0x30] {
                producer.push(Frame::solid(shade, shade, shade, PixelOrder::Reversed))?;
            }
            Ok(())
        })
    })
    .unwrap();

    assert_eq!(report.delivered, 3);
    let writes = panel.writes();
    assert_eq!(writes.len(), 6);
    for pair in writes.chunks(2) {
        let header = CommandBuffer::from_bytes(&pair[0]).unwrap();
        assert_eq!(header.page, 2);
        assert_eq!(header.data_size as usize, pair[1].len());
    }
}

#[test]
fn factory_mode_panels_accept_the_probe() {
    let panel = FakePanel {
        factory_mode: true,
        ..FakePanel::default()
    };
    let outcome =
        raw_usb::run_session(&panel, &test_config(), &CancelToken::new(), |link| link.probe());
    assert_eq!(outcome.unwrap(), ProbeOutcome::FactoryMode);
}

#[test]
fn rejected_commands_surface_the_error_fields() {
    let panel = FakePanel {
        reject: HashSet::from([Request::SetLed as u32]),
        ..FakePanel::default()
    };
    let outcome = raw_usb::run_session(&panel, &test_config(), &CancelToken::new(), |link| {
        link.clear_image(1)?;
        link.set_led(2, 1, true)
    });

    match outcome {
        Err(FipError::Rejected {
            request,
            request_error,
            ..
        }) => {
            assert_eq!(request, Request::SetLed as u32);
            assert_eq!(request_error, 1);
        }
        other => panic!("unexpected outcome {other:?}"),
    }
}

#[test]
fn file_commands_carry_their_parameters() {
    let panel = FakePanel::default();
    raw_usb::run_session(&panel, &test_config(), &CancelToken::new(), |link| {
        link.save_file(1, 4, b"bitmap")?;
        link.display_file(1, 0, 4)?;
        link.delete_file(1, 4)
    })
    .unwrap();

    let writes = panel.writes();
    assert_eq!(writes.len(), 4);
    let save = CommandBuffer::from_bytes(&writes[0]).unwrap();
    assert_eq!(save.request().unwrap(), Request::SaveFile);
    assert_eq!((save.param_1, save.param_3, save.data_size), (1, 4, 6));
    assert_eq!(writes[1], b"bitmap".to_vec());

    let display = CommandBuffer::from_bytes(&writes[2]).unwrap();
    assert_eq!(display.request().unwrap(), Request::DisplayFile);
    assert_eq!([display.param_1, display.param_2, display.param_3], [1, 0, 4]);

    let delete = CommandBuffer::from_bytes(&writes[3]).unwrap();
    assert_eq!(delete.request().unwrap(), Request::DeleteFile);
}

#[test]
fn listener_failure_is_propagated_to_the_session() {
    let panel = FakePanel {
        read_error: Some(rusb::Error::NoDevice),
        ..FakePanel::default()
    };
    let outcome = raw_usb::run_session(&panel, &test_config(), &CancelToken::new(), |link| {
        // whatever the body reports, the listener's error wins
        link.probe().map(|_| ())
    });
    assert!(matches!(outcome, Err(FipError::Usb(rusb::Error::NoDevice))));
}

#[test]
fn write_timeouts_are_retried_until_the_panel_accepts() {
    let panel = FakePanel::default();
    panel.state.lock().unwrap().write_timeouts = 2;

    let outcome =
        raw_usb::run_session(&panel, &test_config(), &CancelToken::new(), |link| link.probe());
    assert_eq!(outcome.unwrap(), ProbeOutcome::Normal);
    assert_eq!(panel.writes().len(), 1);
}

#[test]
fn persistent_write_timeouts_exhaust_the_retry_budget() {
    let panel = FakePanel::default();
    panel.state.lock().unwrap().write_timeouts = 100;

    let outcome =
        raw_usb::run_session(&panel, &test_config(), &CancelToken::new(), |link| link.probe());
    assert!(matches!(
        outcome,
        Err(FipError::RetriesExhausted { attempts: 4, .. })
    ));
}

#[test]
fn cancelled_links_refuse_new_commands() {
    let panel = FakePanel::default();
    let cancel = CancelToken::new();
    cancel.cancel();

    let outcome = raw_usb::run_session(&panel, &test_config(), &cancel, |link| link.probe());
    assert!(matches!(outcome, Err(FipError::Cancelled)));
    assert!(panel.writes().is_empty());
}
