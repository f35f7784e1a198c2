//! Camera drivers.
//!
//! Every vendor is reduced to the same small capability set,
//! [`CameraDriver`]: open, configure, arm, blocking grab with timeout, stop,
//! close. A timeout or a corrupt frame is a [`GrabOutcome`], not an error —
//! the capture loop counts them and keeps going; an `Err` from `grab` means
//! the device is gone.
//!
//! Drivers are selected from the config's vendor tag by [`build_driver`].
//! The hardware-backed variants are compiled in only when their SDK feature
//! is enabled; the emulated variant is always available.

pub mod azure;
pub mod basler;
pub mod emulated;

use std::borrow::Cow;
use std::time::Duration;

use crate::config::{CameraConfig, Vendor};
use crate::error::AppResult;

/// Pixel storage in the sensor's native bit depth.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PixelBuffer {
    U8(Vec<u8>),
    U16(Vec<u16>),
}

impl PixelBuffer {
    pub fn len(&self) -> usize {
        match self {
            PixelBuffer::U8(data) => data.len(),
            PixelBuffer::U16(data) => data.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Raw little-endian bytes as piped to an encoder. Borrowed for 8-bit
    /// data, converted for 16-bit.
    pub fn as_bytes(&self) -> Cow<'_, [u8]> {
        match self {
            PixelBuffer::U8(data) => Cow::Borrowed(data.as_slice()),
            PixelBuffer::U16(data) => {
                Cow::Owned(data.iter().flat_map(|v| v.to_le_bytes()).collect())
            }
        }
    }
}

/// Unit of a device timestamp; never silently normalized.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TimestampUnit {
    /// Machine-vision cameras report ticks of a 1 GHz camera clock.
    Nanoseconds,
    /// Depth cameras report microseconds.
    Microseconds,
}

/// Timestamp as reported by the device, unit labelled.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DeviceTimestamp {
    pub value: u64,
    pub unit: TimestampUnit,
}

/// One image plane captured from a device.
#[derive(Clone, Debug)]
pub struct ImagePlane {
    pub width: u32,
    pub height: u32,
    pub pixels: PixelBuffer,
}

/// What one grab produced. Machine-vision cameras yield a single mono plane;
/// depth cameras yield an infrared plane and a depth plane.
#[derive(Clone, Debug)]
pub enum FramePayload {
    Mono(ImagePlane),
    DepthIr { ir: ImagePlane, depth: ImagePlane },
}

/// A frame fresh off a driver, before the capture worker tags it.
#[derive(Clone, Debug)]
pub struct CapturedFrame {
    pub payload: FramePayload,
    pub timestamp: DeviceTimestamp,
}

/// Result of one blocking grab.
#[derive(Debug)]
pub enum GrabOutcome {
    Frame(CapturedFrame),
    /// No frame within the timeout; the capture loop continues.
    Timeout,
    /// The device delivered an incomplete image; dropped with a warning.
    Corrupt,
}

/// Capability set every camera vendor implements.
///
/// Lifecycle: `init` → `configure` → `start` → `grab`… → `stop` → `close`.
/// `configure` must be idempotent. For depth cameras in subordinate sync
/// mode, the first `grab` blocks until the external trigger arrives.
pub trait CameraDriver: Send {
    /// Logical camera name from the config.
    fn name(&self) -> &str;

    /// Device serial number; known once `init` has run.
    fn serial(&self) -> Option<&str>;

    fn timestamp_unit(&self) -> TimestampUnit;

    /// Open the underlying device and sanity-check its identity.
    fn init(&mut self) -> AppResult<()>;

    /// Apply exposure, gain, gamma, ROI and trigger settings.
    fn configure(&mut self, spec: &CameraConfig) -> AppResult<()>;

    /// Arm for the first frame. After this returns, a pulse on the trigger
    /// line is expected to produce a frame.
    fn start(&mut self) -> AppResult<()>;

    /// Blocking fetch of the next frame.
    fn grab(&mut self, timeout: Duration) -> AppResult<GrabOutcome>;

    fn stop(&mut self) -> AppResult<()>;

    fn close(&mut self) -> AppResult<()>;
}

/// Construct the driver for a camera from its vendor tag.
///
/// `fps` is the rate the camera will be driven at; free-running drivers pace
/// themselves with it.
pub fn build_driver(spec: &CameraConfig, fps: u32) -> AppResult<Box<dyn CameraDriver>> {
    match spec.vendor {
        Vendor::Emulated => Ok(Box::new(emulated::EmulatedCamera::new(spec, fps)?)),
        Vendor::Basler => basler::open_driver(spec),
        Vendor::Azure => azure::open_driver(spec),
    }
}
