use std::path::Path;
use std::thread;
use std::time::Duration;

use image::codecs::gif::GifDecoder;
use image::imageops::FilterType;
use image::{AnimationDecoder, DynamicImage, Frames, ImageFormat};
use rust_embed::RustEmbed;

use crate::error::{FipError, Result};
use crate::frame::{Frame, PixelOrder};
use crate::pump::FrameProducer;

#[derive(RustEmbed)]
#[folder = "resources/"]
struct FipResources;

const TEST_PATTERN: &str = "smpte_bars.ppm";

/// SMPTE colour bars, scaled up to the panel resolution.
pub fn test_pattern(order: PixelOrder) -> Result<Frame> {
    let file = FipResources::get(TEST_PATTERN).ok_or(FipError::MissingResource(TEST_PATTERN))?;
    let bars = image::load_from_memory(&file.data)?;
    Frame::from_image(&bars, order, FilterType::Nearest)
}

/// A decoded picture plus how long it wants to stay on screen.
pub struct SourceFrame {
    pub image: DynamicImage,
    pub delay: Option<Duration>,
}

/// Still images yield one frame, animated GIFs one per animation frame.
pub enum MediaSource {
    Still(Option<DynamicImage>),
    Animation(Frames<'static>),
}

impl MediaSource {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let reader = image::io::Reader::open(path)?.with_guessed_format()?;
        match reader.format() {
            Some(ImageFormat::Gif) => {
                log::info!("streaming animation {}", path.display());
                let decoder = GifDecoder::new(reader.into_inner())?;
                Ok(MediaSource::Animation(decoder.into_frames()))
            }
            format => {
                log::info!("showing still image {} ({:?})", path.display(), format);
                Ok(MediaSource::Still(Some(reader.decode()?)))
            }
        }
    }

    /// Converts every frame and pushes it to the pump, sleeping for each
    /// frame's delay when `paced` is set.
    pub fn feed(
        self,
        producer: &FrameProducer<'_>,
        order: PixelOrder,
        paced: bool,
    ) -> Result<usize> {
        let mut count = 0;
        for source_frame in self {
            let source_frame = source_frame?;
            producer.push(Frame::from_image(&source_frame.image, order, FilterType::Triangle)?)?;
            count += 1;
            if let (true, Some(delay)) = (paced, source_frame.delay) {
                thread::sleep(delay);
            }
        }
        log::debug!("media source exhausted after {} frames", count);
        Ok(count)
    }
}

impl Iterator for MediaSource {
    type Item = Result<SourceFrame>;

    fn next(&mut self) -> Option<Self::Item> {
        match self {
            MediaSource::Still(image) => image.take().map(|image| {
                Ok(SourceFrame { image, delay: None })
            }),
            MediaSource::Animation(frames) => frames.next().map(|frame| -> Result<SourceFrame> {
                let frame = frame?;
                let (numer, denom) = frame.delay().numer_denom_ms();
                let millis = if denom == 0 { 0 } else { numer / denom };
                Ok(SourceFrame {
                    image: DynamicImage::ImageRgba8(frame.into_buffer()),
                    delay: Some(Duration::from_millis(millis.into())),
                })
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancel::CancelToken;
    use crate::frame::{FRAME_HEIGHT, FRAME_SIZE};
    use crate::pump::{FramePump, FrameSink};
    use image::codecs::gif::GifEncoder;
    use image::{Delay, Rgba, RgbaImage};
    use std::path::PathBuf;
    use std::time::Instant;

    const RED: [u8; 3] = [0xff, 0, 0];
    const GREEN: [u8; 3] = [0, 0xff, 0];
    const BLUE: [u8; 3] = [0, 0, 0xff];

    fn animated_gif(name: &str, colours: &[[u8; 3]], delay_ms: u32) -> PathBuf {
        let mut encoded = Vec::new();
        {
            let mut encoder = GifEncoder::new(&mut encoded);
            let frames = colours.iter().map(|&[r, g, b]| {
                let buffer = RgbaImage::from_pixel(16, 12, Rgba([r, g, b, 0xff]));
                image::Frame::from_parts(buffer, 0, 0, Delay::from_numer_denom_ms(delay_ms, 1))
            });
            encoder.encode_frames(frames).unwrap();
        }
        let path = std::env::temp_dir()
            .join(format!("fipdisplay-{}-{}.gif", name, std::process::id()));
        std::fs::write(&path, encoded).unwrap();
        path
    }

    // palette quantization may shift a solid colour slightly
    fn dominant_channel(pixel: [u8; 3]) -> usize {
        assert_eq!(pixel.iter().filter(|&&c| c > 0xc0).count(), 1, "{:?}", pixel);
        pixel.iter().position(|&c| c > 0xc0).unwrap()
    }

    struct TopLeft(Vec<[u8; 3]>);

    impl FrameSink for TopLeft {
        fn show_frame(&mut self, frame: &Frame) -> Result<()> {
            self.0.push(frame.to_rgb8(PixelOrder::Rgb).get_pixel(0, 0).0);
            Ok(())
        }
    }

    #[test]
    fn test_pattern_fills_the_screen() {
        let frame = test_pattern(PixelOrder::Rgb).unwrap();
        assert_eq!(frame.len(), FRAME_SIZE);

        let image = frame.to_rgb8(PixelOrder::Rgb);
        // top-left bar is 75% white, bottom-left is -I
        assert_eq!(image.get_pixel(0, 0).0, [192, 192, 192]);
        assert_eq!(image.get_pixel(0, FRAME_HEIGHT - 1).0, [0, 33, 76]);
    }

    #[test]
    fn still_source_yields_once() {
        let image = DynamicImage::new_rgb8(4, 4);
        let mut source = MediaSource::Still(Some(image));
        assert!(source.next().is_some());
        assert!(source.next().is_none());
    }

    #[test]
    fn gif_frames_carry_their_delays() {
        let path = animated_gif("delays", &[RED, GREEN], 20);
        let frames: Vec<SourceFrame> = MediaSource::open(&path)
            .unwrap()
            .collect::<Result<_>>()
            .unwrap();
        std::fs::remove_file(&path).ok();

        assert_eq!(frames.len(), 2);
        for frame in &frames {
            assert_eq!(frame.delay, Some(Duration::from_millis(20)));
            assert_eq!((frame.image.width(), frame.image.height()), (16, 12));
        }
    }

    #[test]
    fn animations_are_fed_in_order_and_paced() {
        let path = animated_gif("feed", &[RED, GREEN, BLUE], 20);
        let source = MediaSource::open(&path).unwrap();
        std::fs::remove_file(&path).ok();

        let mut sink = TopLeft(Vec::new());
        let pump = FramePump::new(4, CancelToken::new());
        let started = Instant::now();
        let report = pump
            .run(&mut sink, |producer| {
                assert_eq!(source.feed(producer, PixelOrder::Rgb, true)?, 3);
                Ok(())
            })
            .unwrap();

        assert!(started.elapsed() >= Duration::from_millis(60));
        assert_eq!(report.delivered, 3);
        let channels: Vec<usize> = sink.0.into_iter().map(dominant_channel).collect();
        assert_eq!(channels, vec![0, 1, 2]);
    }
}
