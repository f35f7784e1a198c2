//! Live preview fan-out.
//!
//! Capture workers forward a subsampled, downscaled copy of their frames
//! into small per-camera queues; the fan-out thread drains each queue to its
//! newest frame and hands it to a [`DisplaySink`]. Nothing here may ever
//! block capture: producers use `try_send` and drop frames when the preview
//! falls behind, and the consumer never asks a queue for its size — it just
//! drains. The UI toolkit behind the sink is out of scope.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::Receiver;
use log::debug;

use crate::camera::{ImagePlane, PixelBuffer};
use crate::error::AppResult;

/// Depth of each per-camera preview queue.
pub const DISPLAY_QUEUE_DEPTH: usize = 2;

/// An 8-bit preview image ready for a UI.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DisplayFrame {
    pub width: u32,
    pub height: u32,
    pub pixels: Vec<u8>,
}

/// Consumer of preview frames (a window, a stream, a test probe).
pub trait DisplaySink: Send {
    fn show(&mut self, camera: &str, frame: &DisplayFrame) -> AppResult<()>;
}

/// Downscale a captured plane by an integer factor, mapping 16-bit depth
/// data into 8 bits.
pub fn downsample_plane(plane: &ImagePlane, factor: u32) -> DisplayFrame {
    let factor = factor.max(1) as usize;
    let (w, h) = (plane.width as usize, plane.height as usize);
    let out_w = (w / factor).max(1);
    let out_h = (h / factor).max(1);
    let mut pixels = Vec::with_capacity(out_w * out_h);
    for y in 0..out_h {
        for x in 0..out_w {
            let index = (y * factor).min(h - 1) * w + (x * factor).min(w - 1);
            let value = match &plane.pixels {
                PixelBuffer::U8(data) => data[index],
                PixelBuffer::U16(data) => (data[index] >> 8) as u8,
            };
            pixels.push(value);
        }
    }
    DisplayFrame {
        width: out_w as u32,
        height: out_h as u32,
        pixels,
    }
}

/// Fans preview frames from every camera into one sink.
pub struct DisplayFanout {
    queues: Vec<(String, Receiver<DisplayFrame>)>,
    sink: Box<dyn DisplaySink>,
    stop: Arc<AtomicBool>,
    refresh_interval: Duration,
}

impl DisplayFanout {
    pub fn new(
        queues: Vec<(String, Receiver<DisplayFrame>)>,
        sink: Box<dyn DisplaySink>,
        stop: Arc<AtomicBool>,
        display_fps: u32,
    ) -> Self {
        Self {
            queues,
            sink,
            stop,
            refresh_interval: Duration::from_millis(1000 / u64::from(display_fps.max(1))),
        }
    }

    /// Run until the stop flag is raised or every producer is gone.
    pub fn run(mut self) -> AppResult<()> {
        use crossbeam_channel::TryRecvError;
        loop {
            let mut any_connected = false;
            for (camera, rx) in &self.queues {
                // Drain to the newest frame; stale previews are worthless.
                let mut latest = None;
                let disconnected = loop {
                    match rx.try_recv() {
                        Ok(frame) => latest = Some(frame),
                        Err(TryRecvError::Empty) => break false,
                        Err(TryRecvError::Disconnected) => break true,
                    }
                };
                if !disconnected {
                    any_connected = true;
                }
                if let Some(frame) = latest {
                    self.sink.show(camera, &frame)?;
                }
            }
            if self.stop.load(Ordering::SeqCst) || !any_connected {
                break;
            }
            std::thread::sleep(self.refresh_interval);
        }
        debug!("Display fan-out finished");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::bounded;
    use std::sync::Mutex;

    #[derive(Clone, Default)]
    struct Probe {
        shown: Arc<Mutex<Vec<(String, DisplayFrame)>>>,
    }

    impl DisplaySink for Probe {
        fn show(&mut self, camera: &str, frame: &DisplayFrame) -> AppResult<()> {
            self.shown
                .lock()
                .unwrap()
                .push((camera.to_string(), frame.clone()));
            Ok(())
        }
    }

    fn plane_u8(width: u32, height: u32, pixels: Vec<u8>) -> ImagePlane {
        ImagePlane {
            width,
            height,
            pixels: PixelBuffer::U8(pixels),
        }
    }

    #[test]
    fn test_downsample_by_two() {
        let plane = plane_u8(4, 4, (0..16).collect());
        let frame = downsample_plane(&plane, 2);
        assert_eq!(frame.width, 2);
        assert_eq!(frame.height, 2);
        assert_eq!(frame.pixels, vec![0, 2, 8, 10]);
    }

    #[test]
    fn test_downsample_maps_depth_to_high_byte() {
        let plane = ImagePlane {
            width: 2,
            height: 1,
            pixels: PixelBuffer::U16(vec![0x1234, 0xFF00]),
        };
        let frame = downsample_plane(&plane, 1);
        assert_eq!(frame.pixels, vec![0x12, 0xFF]);
    }

    #[test]
    fn test_fanout_shows_only_newest_frame() {
        let (tx, rx) = bounded(DISPLAY_QUEUE_DEPTH);
        let stop = Arc::new(AtomicBool::new(false));
        let probe = Probe::default();
        let shown = probe.shown.clone();
        let fanout = DisplayFanout::new(
            vec![("top".into(), rx)],
            Box::new(probe),
            stop.clone(),
            100,
        );

        // Two frames queued before the fan-out looks: only the newer shows.
        tx.send(DisplayFrame {
            width: 1,
            height: 1,
            pixels: vec![1],
        })
        .unwrap();
        tx.send(DisplayFrame {
            width: 1,
            height: 1,
            pixels: vec![2],
        })
        .unwrap();
        drop(tx);
        stop.store(true, Ordering::SeqCst);
        fanout.run().unwrap();

        let shown = shown.lock().unwrap();
        assert_eq!(shown.len(), 1);
        assert_eq!(shown[0].0, "top");
        assert_eq!(shown[0].1.pixels, vec![2]);
    }

    #[test]
    fn test_producer_never_blocks_when_queue_full() {
        let (tx, _rx) = bounded::<DisplayFrame>(1);
        tx.try_send(DisplayFrame {
            width: 1,
            height: 1,
            pixels: vec![0],
        })
        .unwrap();
        // Second try_send fails fast instead of blocking capture.
        assert!(tx
            .try_send(DisplayFrame {
                width: 1,
                height: 1,
                pixels: vec![1],
            })
            .is_err());
    }
}
