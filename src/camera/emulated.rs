//! Emulated camera for tests and dry runs.
//!
//! Generates synthetic greyscale frames at a fixed rate on the caller's
//! thread, pacing grabs against a monotonic clock so a run of N seconds
//! yields close to `N * fps` frames. Trigger configuration is accepted and
//! ignored, mirroring how vendor camera emulations behave.
//!
//! The number of emulated devices on the "bus" is controlled by the
//! `MULTICAM_DAQ_CAMEMU` environment variable; opening a device with an
//! index beyond the current count grows the bus, so tests can simply ask
//! for camera 0 and camera 1.

use std::time::{Duration, Instant};

use log::{debug, info};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::config::{CameraConfig, DeviceId};
use crate::error::{AcqError, AppResult};

use super::{
    CameraDriver, CapturedFrame, DeviceTimestamp, FramePayload, GrabOutcome, ImagePlane,
    PixelBuffer, TimestampUnit,
};

/// Environment variable holding the number of emulated devices.
pub const CAMEMU_ENV: &str = "MULTICAM_DAQ_CAMEMU";

const DEFAULT_WIDTH: u32 = 640;
const DEFAULT_HEIGHT: u32 = 480;

pub struct EmulatedCamera {
    name: String,
    device_index: u32,
    serial: String,
    fps: u32,
    width: u32,
    height: u32,
    exposure_us: u32,
    started: Option<Instant>,
    frames_emitted: u64,
    rng: StdRng,
    initialized: bool,
}

impl EmulatedCamera {
    pub fn new(spec: &CameraConfig, fps: u32) -> AppResult<Self> {
        let device_index = match &spec.id {
            DeviceId::Index(i) => *i,
            DeviceId::Serial(s) => {
                // Emulated devices are addressed by index; accept a numeric
                // serial for convenience.
                s.parse().map_err(|_| AcqError::DeviceNotFound {
                    name: spec.name.clone(),
                    reason: format!("emulated cameras have numeric ids, got '{s}'"),
                })?
            }
        };
        let (width, height) = match spec.roi {
            Some(roi) => (roi.width, roi.height),
            None => (DEFAULT_WIDTH, DEFAULT_HEIGHT),
        };
        Ok(Self {
            name: spec.name.clone(),
            device_index,
            serial: format!("emu-{device_index}"),
            fps: fps.max(1),
            width,
            height,
            exposure_us: spec.exposure_us,
            started: None,
            frames_emitted: 0,
            rng: StdRng::seed_from_u64(u64::from(device_index)),
            initialized: false,
        })
    }

    fn frame_interval(&self) -> Duration {
        Duration::from_secs_f64(1.0 / f64::from(self.fps))
    }

    fn render_frame(&mut self) -> Vec<u8> {
        let (w, h) = (self.width as usize, self.height as usize);
        let mut pixels = vec![0u8; w * h];
        // A bar sweeping across the sensor, one column per frame, over mild
        // deterministic noise so encoders see changing content.
        let bar = (self.frames_emitted as usize) % w;
        for y in 0..h {
            for x in 0..w {
                let base: u8 = if x.abs_diff(bar) < 8 { 200 } else { 32 };
                pixels[y * w + x] = base.saturating_add(self.rng.gen_range(0..16));
            }
        }
        pixels
    }
}

impl CameraDriver for EmulatedCamera {
    fn name(&self) -> &str {
        &self.name
    }

    fn serial(&self) -> Option<&str> {
        Some(&self.serial)
    }

    fn timestamp_unit(&self) -> TimestampUnit {
        // Matches the machine-vision cameras this driver stands in for.
        TimestampUnit::Nanoseconds
    }

    fn init(&mut self) -> AppResult<()> {
        // Grow the emulated bus if this index does not exist yet.
        let current: u32 = std::env::var(CAMEMU_ENV)
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);
        if self.device_index >= current {
            std::env::set_var(CAMEMU_ENV, (self.device_index + 1).to_string());
            debug!(
                "Emulated camera bus grown to {} devices",
                self.device_index + 1
            );
        }
        self.initialized = true;
        info!(
            "Initialized emulated camera '{}' (index {}, {}x{})",
            self.name, self.device_index, self.width, self.height
        );
        Ok(())
    }

    fn configure(&mut self, spec: &CameraConfig) -> AppResult<()> {
        if !self.initialized {
            return Err(AcqError::Camera(format!(
                "emulated camera '{}' configured before init",
                self.name
            )));
        }
        // Exposure and ROI are honored; gain, gamma and all trigger settings
        // are accepted and ignored.
        self.exposure_us = spec.exposure_us;
        if let Some(roi) = spec.roi {
            self.width = roi.width;
            self.height = roi.height;
        }
        Ok(())
    }

    fn start(&mut self) -> AppResult<()> {
        self.started = Some(Instant::now());
        self.frames_emitted = 0;
        Ok(())
    }

    fn grab(&mut self, timeout: Duration) -> AppResult<GrabOutcome> {
        let started = self
            .started
            .ok_or_else(|| AcqError::Camera(format!("camera '{}' is not started", self.name)))?;

        let due = self.frame_interval() * self.frames_emitted as u32;
        let elapsed = started.elapsed();
        if due > elapsed {
            let wait = due - elapsed;
            if wait > timeout {
                std::thread::sleep(timeout);
                return Ok(GrabOutcome::Timeout);
            }
            std::thread::sleep(wait);
        }

        let pixels = self.render_frame();
        self.frames_emitted += 1;
        // Simulated 1 GHz device clock.
        let timestamp_ns = started.elapsed().as_nanos() as u64;
        Ok(GrabOutcome::Frame(CapturedFrame {
            payload: FramePayload::Mono(ImagePlane {
                width: self.width,
                height: self.height,
                pixels: PixelBuffer::U8(pixels),
            }),
            timestamp: DeviceTimestamp {
                value: timestamp_ns,
                unit: TimestampUnit::Nanoseconds,
            },
        }))
    }

    fn stop(&mut self) -> AppResult<()> {
        self.started = None;
        Ok(())
    }

    fn close(&mut self) -> AppResult<()> {
        self.initialized = false;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CameraRole, Roi, Vendor, WriterConfig};
    use serial_test::serial;

    fn spec(index: u32) -> CameraConfig {
        CameraConfig {
            name: format!("emu{index}"),
            vendor: Vendor::Emulated,
            id: DeviceId::Index(index),
            role: CameraRole::Top,
            exposure_us: 1000,
            gain: 6.0,
            gamma: 1.0,
            roi: Some(Roi {
                x: 0,
                y: 0,
                width: 64,
                height: 48,
            }),
            trigger: None,
            trigger_source: "Line2".into(),
            sync_role: None,
            subordinate_delay_off_master_us: 0,
            writer: WriterConfig::default(),
            display: None,
        }
    }

    #[test]
    #[serial]
    fn test_emulated_bus_grows_with_device_index() {
        std::env::remove_var(CAMEMU_ENV);
        let mut cam = EmulatedCamera::new(&spec(2), 30).unwrap();
        cam.init().unwrap();
        assert_eq!(std::env::var(CAMEMU_ENV).unwrap(), "3");
    }

    #[test]
    #[serial]
    fn test_paced_grabs_produce_frames() {
        let mut cam = EmulatedCamera::new(&spec(0), 100).unwrap();
        cam.init().unwrap();
        cam.configure(&spec(0)).unwrap();
        cam.start().unwrap();

        let mut frames = 0;
        for _ in 0..5 {
            match cam.grab(Duration::from_millis(500)).unwrap() {
                GrabOutcome::Frame(f) => {
                    frames += 1;
                    match f.payload {
                        FramePayload::Mono(plane) => {
                            assert_eq!(plane.width, 64);
                            assert_eq!(plane.pixels.len(), 64 * 48);
                        }
                        FramePayload::DepthIr { .. } => panic!("mono camera produced depth"),
                    }
                    assert_eq!(f.timestamp.unit, TimestampUnit::Nanoseconds);
                }
                GrabOutcome::Timeout | GrabOutcome::Corrupt => {}
            }
        }
        assert_eq!(frames, 5);
        cam.stop().unwrap();
        cam.close().unwrap();
    }

    #[test]
    #[serial]
    fn test_short_timeout_reports_timeout_not_error() {
        // 1 fps: the second frame is due a full second after start.
        let mut cam = EmulatedCamera::new(&spec(0), 1).unwrap();
        cam.init().unwrap();
        cam.start().unwrap();
        // First frame is due immediately.
        assert!(matches!(
            cam.grab(Duration::from_millis(50)).unwrap(),
            GrabOutcome::Frame(_)
        ));
        assert!(matches!(
            cam.grab(Duration::from_millis(10)).unwrap(),
            GrabOutcome::Timeout
        ));
    }

    #[test]
    #[serial]
    fn test_grab_before_start_is_an_error() {
        let mut cam = EmulatedCamera::new(&spec(0), 30).unwrap();
        cam.init().unwrap();
        assert!(cam.grab(Duration::from_millis(10)).is_err());
    }
}
