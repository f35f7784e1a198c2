//! Azure Kinect depth cameras.
//!
//! Each grab yields a pair of planes: the active-infrared image (converted
//! to 8 bits for H.264 encoding) and the 16-bit depth map (kept lossless).
//! The device must receive its full configuration before the cameras start,
//! so `configure` caches the settings and `start` applies them.
//!
//! Sync roles: a `subordinate` waits for the external trigger, delayed by a
//! multiple of the 160 us subframe slot so several devices' infrared
//! emissions interleave instead of blinding each other. `master` here means
//! "first subordinate on the trigger line" — the device is still programmed
//! in subordinate wired-sync mode with zero delay. `standalone` runs without
//! sync cabling and starts immediately.
//!
//! The SDK layer is hand-written FFI against the vendor's `libk4a`, gated
//! behind the `azure_hardware` feature.

use crate::config::{CameraConfig, SyncRole};
use crate::error::{AcqError, AppResult};
use crate::schedule::DEPTH_SUBFRAME_DURATION_US;

/// Wired-sync mode as programmed into the device.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WiredSyncMode {
    Standalone,
    Master,
    Subordinate,
}

/// Map a camera's sync role onto the device's wired-sync mode and delay.
///
/// Rejects subordinate delays that are not a multiple of the subframe slot.
pub fn resolve_sync(spec: &CameraConfig) -> AppResult<(WiredSyncMode, u32)> {
    let role = spec.sync_role.unwrap_or(SyncRole::Standalone);
    match role {
        SyncRole::Subordinate => {
            let delay = spec.subordinate_delay_off_master_us;
            if delay % DEPTH_SUBFRAME_DURATION_US != 0 {
                return Err(AcqError::DeviceConfigRejected {
                    name: spec.name.clone(),
                    reason: format!(
                        "subordinate_delay_off_master_us must be a multiple of \
                         {DEPTH_SUBFRAME_DURATION_US} but was {delay}"
                    ),
                });
            }
            Ok((WiredSyncMode::Subordinate, delay))
        }
        // The first device on the trigger line; it still listens for
        // triggers, so it is wired as a subordinate with no delay.
        SyncRole::Master => Ok((WiredSyncMode::Subordinate, 0)),
        SyncRole::Standalone => Ok((WiredSyncMode::Standalone, 0)),
    }
}

/// Convert an active-infrared image to 8 bits: clip to 1275 and divide by 5.
pub fn ir16_to_u8(ir: &[u16]) -> Vec<u8> {
    ir.iter().map(|&v| (v.min(1275) / 5) as u8).collect()
}

#[cfg(feature = "azure_hardware")]
pub use enabled::open_driver;

#[cfg(not(feature = "azure_hardware"))]
pub fn open_driver(
    _spec: &CameraConfig,
) -> AppResult<Box<dyn super::CameraDriver>> {
    Err(AcqError::FeatureNotEnabled("azure_hardware"))
}

#[cfg(feature = "azure_hardware")]
mod enabled {
    use std::time::Duration;

    use log::{info, warn};

    use crate::camera::{
        CameraDriver, CapturedFrame, DeviceTimestamp, FramePayload, GrabOutcome, ImagePlane,
        PixelBuffer, TimestampUnit,
    };
    use crate::config::{CameraConfig, DeviceId};
    use crate::error::{AcqError, AppResult};

    use super::{ir16_to_u8, resolve_sync, WiredSyncMode};

    /// Minimal bindings to the Azure Kinect Sensor SDK (`k4a.h`).
    #[allow(unsafe_code)]
    #[allow(non_camel_case_types, dead_code)]
    mod ffi {
        use std::os::raw::{c_char, c_int, c_void};

        pub type k4a_device_t = *mut c_void;
        pub type k4a_capture_t = *mut c_void;
        pub type k4a_image_t = *mut c_void;

        pub const K4A_RESULT_SUCCEEDED: c_int = 0;
        pub const K4A_BUFFER_RESULT_SUCCEEDED: c_int = 0;
        pub const K4A_WAIT_RESULT_SUCCEEDED: c_int = 0;
        pub const K4A_WAIT_RESULT_FAILED: c_int = 1;
        pub const K4A_WAIT_RESULT_TIMEOUT: c_int = 2;

        pub const K4A_IMAGE_FORMAT_COLOR_MJPG: c_int = 0;
        pub const K4A_COLOR_RESOLUTION_OFF: c_int = 0;
        pub const K4A_DEPTH_MODE_NFOV_UNBINNED: c_int = 2;
        pub const K4A_FRAMES_PER_SECOND_30: c_int = 2;

        pub const K4A_WIRED_SYNC_MODE_STANDALONE: c_int = 0;
        pub const K4A_WIRED_SYNC_MODE_MASTER: c_int = 1;
        pub const K4A_WIRED_SYNC_MODE_SUBORDINATE: c_int = 2;

        #[repr(C)]
        pub struct k4a_device_configuration_t {
            pub color_format: c_int,
            pub color_resolution: c_int,
            pub depth_mode: c_int,
            pub camera_fps: c_int,
            pub synchronized_images_only: bool,
            pub depth_delay_off_color_usec: i32,
            pub wired_sync_mode: c_int,
            pub subordinate_delay_off_master_usec: u32,
            pub disable_streaming_indicator: bool,
        }

        #[link(name = "k4a")]
        extern "C" {
            pub fn k4a_device_get_installed_count() -> u32;
            pub fn k4a_device_open(index: u32, device: *mut k4a_device_t) -> c_int;
            pub fn k4a_device_close(device: k4a_device_t);
            pub fn k4a_device_get_serialnum(
                device: k4a_device_t,
                serial: *mut c_char,
                size: *mut usize,
            ) -> c_int;
            pub fn k4a_device_start_cameras(
                device: k4a_device_t,
                config: *const k4a_device_configuration_t,
            ) -> c_int;
            pub fn k4a_device_stop_cameras(device: k4a_device_t);
            pub fn k4a_device_get_capture(
                device: k4a_device_t,
                capture: *mut k4a_capture_t,
                timeout_ms: i32,
            ) -> c_int;
            pub fn k4a_capture_release(capture: k4a_capture_t);
            pub fn k4a_capture_get_depth_image(capture: k4a_capture_t) -> k4a_image_t;
            pub fn k4a_capture_get_ir_image(capture: k4a_capture_t) -> k4a_image_t;
            pub fn k4a_image_get_buffer(image: k4a_image_t) -> *mut u8;
            pub fn k4a_image_get_size(image: k4a_image_t) -> usize;
            pub fn k4a_image_get_width_pixels(image: k4a_image_t) -> c_int;
            pub fn k4a_image_get_height_pixels(image: k4a_image_t) -> c_int;
            pub fn k4a_image_get_device_timestamp_usec(image: k4a_image_t) -> u64;
            pub fn k4a_image_release(image: k4a_image_t);
        }
    }

    pub fn open_driver(spec: &CameraConfig) -> AppResult<Box<dyn CameraDriver>> {
        Ok(Box::new(AzureCamera::new(spec)))
    }

    pub struct AzureCamera {
        name: String,
        id: DeviceId,
        serial: Option<String>,
        device: Option<ffi::k4a_device_t>,
        config: Option<ffi::k4a_device_configuration_t>,
        running: bool,
    }

    // The raw device handle is only ever used from the owning capture thread.
    #[allow(unsafe_code)]
    unsafe impl Send for AzureCamera {}

    impl AzureCamera {
        fn new(spec: &CameraConfig) -> Self {
            Self {
                name: spec.name.clone(),
                id: spec.id.clone(),
                serial: None,
                device: None,
                config: None,
                running: false,
            }
        }

        fn device(&self) -> AppResult<ffi::k4a_device_t> {
            self.device
                .ok_or_else(|| AcqError::Camera(format!("camera '{}' is not open", self.name)))
        }

        #[allow(unsafe_code)]
        fn read_serial(device: ffi::k4a_device_t) -> Option<String> {
            unsafe {
                let mut size: usize = 0;
                // First call reports the needed buffer size.
                ffi::k4a_device_get_serialnum(device, std::ptr::null_mut(), &mut size);
                if size == 0 {
                    return None;
                }
                let mut buf: Vec<std::os::raw::c_char> = vec![0; size];
                if ffi::k4a_device_get_serialnum(device, buf.as_mut_ptr(), &mut size)
                    != ffi::K4A_BUFFER_RESULT_SUCCEEDED
                {
                    return None;
                }
                let bytes: Vec<u8> = buf
                    .iter()
                    .take_while(|&&c| c != 0)
                    .map(|&c| c as u8)
                    .collect();
                String::from_utf8(bytes).ok()
            }
        }

        #[allow(unsafe_code)]
        fn copy_u16_plane(image: ffi::k4a_image_t) -> ImagePlane {
            unsafe {
                let width = ffi::k4a_image_get_width_pixels(image) as u32;
                let height = ffi::k4a_image_get_height_pixels(image) as u32;
                let size = ffi::k4a_image_get_size(image);
                let ptr = ffi::k4a_image_get_buffer(image) as *const u16;
                let pixels = std::slice::from_raw_parts(ptr, size / 2).to_vec();
                ImagePlane {
                    width,
                    height,
                    pixels: PixelBuffer::U16(pixels),
                }
            }
        }
    }

    impl CameraDriver for AzureCamera {
        fn name(&self) -> &str {
            &self.name
        }

        fn serial(&self) -> Option<&str> {
            self.serial.as_deref()
        }

        fn timestamp_unit(&self) -> TimestampUnit {
            TimestampUnit::Microseconds
        }

        #[allow(unsafe_code)]
        fn init(&mut self) -> AppResult<()> {
            let count = unsafe { ffi::k4a_device_get_installed_count() };
            if count == 0 {
                return Err(AcqError::DeviceNotFound {
                    name: self.name.clone(),
                    reason: "no depth cameras found".into(),
                });
            }

            // Resolve the index: directly, or by scanning serial numbers.
            let index = match &self.id {
                DeviceId::Index(i) => *i,
                DeviceId::Serial(wanted) => {
                    let mut found = None;
                    for index in 0..count {
                        let mut device: ffi::k4a_device_t = std::ptr::null_mut();
                        if unsafe { ffi::k4a_device_open(index, &mut device) }
                            != ffi::K4A_RESULT_SUCCEEDED
                        {
                            continue;
                        }
                        let serial = Self::read_serial(device);
                        unsafe { ffi::k4a_device_close(device) };
                        if serial.as_deref() == Some(wanted.as_str()) {
                            found = Some(index);
                            break;
                        }
                    }
                    found.ok_or_else(|| AcqError::DeviceNotFound {
                        name: self.name.clone(),
                        reason: format!("no depth camera with serial {wanted}"),
                    })?
                }
            };

            let mut device: ffi::k4a_device_t = std::ptr::null_mut();
            if unsafe { ffi::k4a_device_open(index, &mut device) } != ffi::K4A_RESULT_SUCCEEDED {
                return Err(AcqError::DeviceNotFound {
                    name: self.name.clone(),
                    reason: format!("failed to open depth camera {index}"),
                });
            }
            self.serial = Self::read_serial(device);
            self.device = Some(device);
            info!(
                "Opened depth camera '{}' (serial {})",
                self.name,
                self.serial.as_deref().unwrap_or("?")
            );
            Ok(())
        }

        fn configure(&mut self, spec: &CameraConfig) -> AppResult<()> {
            let (mode, delay) = resolve_sync(spec)?;
            let wired_sync_mode = match mode {
                WiredSyncMode::Standalone => ffi::K4A_WIRED_SYNC_MODE_STANDALONE,
                WiredSyncMode::Master => ffi::K4A_WIRED_SYNC_MODE_MASTER,
                WiredSyncMode::Subordinate => ffi::K4A_WIRED_SYNC_MODE_SUBORDINATE,
            };
            // The full configuration is applied when the cameras start.
            self.config = Some(ffi::k4a_device_configuration_t {
                color_format: ffi::K4A_IMAGE_FORMAT_COLOR_MJPG,
                color_resolution: ffi::K4A_COLOR_RESOLUTION_OFF,
                depth_mode: ffi::K4A_DEPTH_MODE_NFOV_UNBINNED,
                camera_fps: ffi::K4A_FRAMES_PER_SECOND_30,
                synchronized_images_only: false,
                depth_delay_off_color_usec: 0,
                wired_sync_mode,
                subordinate_delay_off_master_usec: delay,
                disable_streaming_indicator: false,
            });
            Ok(())
        }

        #[allow(unsafe_code)]
        fn start(&mut self) -> AppResult<()> {
            let device = self.device()?;
            let config = self.config.as_ref().ok_or_else(|| {
                AcqError::DeviceConfigRejected {
                    name: self.name.clone(),
                    reason: "depth cameras must be configured before starting".into(),
                }
            })?;
            if unsafe { ffi::k4a_device_start_cameras(device, config) }
                != ffi::K4A_RESULT_SUCCEEDED
            {
                return Err(AcqError::Camera(format!(
                    "camera '{}': start_cameras failed",
                    self.name
                )));
            }
            self.running = true;
            Ok(())
        }

        #[allow(unsafe_code)]
        fn grab(&mut self, timeout: Duration) -> AppResult<GrabOutcome> {
            let device = self.device()?;
            let mut capture: ffi::k4a_capture_t = std::ptr::null_mut();
            let result = unsafe {
                ffi::k4a_device_get_capture(device, &mut capture, timeout.as_millis() as i32)
            };
            match result {
                ffi::K4A_WAIT_RESULT_TIMEOUT => return Ok(GrabOutcome::Timeout),
                ffi::K4A_WAIT_RESULT_SUCCEEDED => {}
                _ => {
                    return Err(AcqError::Camera(format!(
                        "camera '{}': get_capture failed",
                        self.name
                    )))
                }
            }

            let outcome = unsafe {
                let ir_image = ffi::k4a_capture_get_ir_image(capture);
                let depth_image = ffi::k4a_capture_get_depth_image(capture);
                if ir_image.is_null() || depth_image.is_null() {
                    if !ir_image.is_null() {
                        ffi::k4a_image_release(ir_image);
                    }
                    if !depth_image.is_null() {
                        ffi::k4a_image_release(depth_image);
                    }
                    warn!("Depth camera '{}' delivered a partial capture", self.name);
                    GrabOutcome::Corrupt
                } else {
                    let ir_raw = Self::copy_u16_plane(ir_image);
                    let depth = Self::copy_u16_plane(depth_image);
                    let timestamp = ffi::k4a_image_get_device_timestamp_usec(ir_image);
                    ffi::k4a_image_release(ir_image);
                    ffi::k4a_image_release(depth_image);

                    let ir_pixels = match &ir_raw.pixels {
                        PixelBuffer::U16(raw) => ir16_to_u8(raw),
                        PixelBuffer::U8(raw) => raw.clone(),
                    };
                    GrabOutcome::Frame(CapturedFrame {
                        payload: FramePayload::DepthIr {
                            ir: ImagePlane {
                                width: ir_raw.width,
                                height: ir_raw.height,
                                pixels: PixelBuffer::U8(ir_pixels),
                            },
                            depth,
                        },
                        timestamp: DeviceTimestamp {
                            value: timestamp,
                            unit: TimestampUnit::Microseconds,
                        },
                    })
                }
            };
            unsafe { ffi::k4a_capture_release(capture) };
            Ok(outcome)
        }

        #[allow(unsafe_code)]
        fn stop(&mut self) -> AppResult<()> {
            if self.running {
                unsafe { ffi::k4a_device_stop_cameras(self.device()?) };
                self.running = false;
            }
            Ok(())
        }

        #[allow(unsafe_code)]
        fn close(&mut self) -> AppResult<()> {
            self.stop()?;
            if let Some(device) = self.device.take() {
                unsafe { ffi::k4a_device_close(device) };
            }
            Ok(())
        }
    }
}
