//! Basler machine-vision cameras via the Pylon SDK.
//!
//! Compiled in with the `pylon_hardware` feature; without it the constructor
//! reports the missing feature. Exposures are driven by a TTL rising edge on
//! the configured trigger line, and the camera reports frame timestamps as
//! ticks of its internal 1 GHz clock.

#[cfg(feature = "pylon_hardware")]
pub use enabled::open_driver;

#[cfg(feature = "pylon_hardware")]
mod enabled {
    use std::sync::OnceLock;
    use std::time::Duration;

    use log::{debug, info};

    use crate::camera::{
        CameraDriver, CapturedFrame, DeviceTimestamp, FramePayload, GrabOutcome, ImagePlane,
        PixelBuffer, TimestampUnit,
    };
    use crate::config::{CameraConfig, DeviceId, TriggerMode};
    use crate::error::{AcqError, AppResult};

    /// One Pylon runtime for the whole process; camera handles borrow it.
    static PYLON: OnceLock<pylon_cxx::Pylon> = OnceLock::new();

    fn pylon() -> &'static pylon_cxx::Pylon {
        PYLON.get_or_init(pylon_cxx::Pylon::new)
    }

    fn camera_error(context: &str, err: impl std::fmt::Display) -> AcqError {
        AcqError::Camera(format!("{context}: {err}"))
    }

    pub fn open_driver(spec: &CameraConfig) -> AppResult<Box<dyn CameraDriver>> {
        Ok(Box::new(BaslerCamera::new(spec)))
    }

    pub struct BaslerCamera {
        name: String,
        id: DeviceId,
        serial: Option<String>,
        model: Option<String>,
        cam: Option<pylon_cxx::InstantCamera<'static>>,
        grabbing: bool,
    }

    impl BaslerCamera {
        fn new(spec: &CameraConfig) -> Self {
            Self {
                name: spec.name.clone(),
                id: spec.id.clone(),
                serial: None,
                model: None,
                cam: None,
                grabbing: false,
            }
        }

        fn cam(&self) -> AppResult<&pylon_cxx::InstantCamera<'static>> {
            self.cam
                .as_ref()
                .ok_or_else(|| AcqError::Camera(format!("camera '{}' is not open", self.name)))
        }

        fn set_float(&self, node: &str, value: f64) -> AppResult<()> {
            self.cam()?
                .node_map()
                .float_node(node)
                .and_then(|mut n| n.set_value(value))
                .map_err(|e| AcqError::DeviceConfigRejected {
                    name: self.name.clone(),
                    reason: format!("{node}={value}: {e}"),
                })
        }

        fn set_enum(&self, node: &str, value: &str) -> AppResult<()> {
            self.cam()?
                .node_map()
                .enum_node(node)
                .and_then(|mut n| n.set_value(value))
                .map_err(|e| AcqError::DeviceConfigRejected {
                    name: self.name.clone(),
                    reason: format!("{node}={value}: {e}"),
                })
        }

        fn set_int(&self, node: &str, value: i64) -> AppResult<()> {
            self.cam()?
                .node_map()
                .integer_node(node)
                .and_then(|mut n| n.set_value(value))
                .map_err(|e| AcqError::DeviceConfigRejected {
                    name: self.name.clone(),
                    reason: format!("{node}={value}: {e}"),
                })
        }
    }

    impl CameraDriver for BaslerCamera {
        fn name(&self) -> &str {
            &self.name
        }

        fn serial(&self) -> Option<&str> {
            self.serial.as_deref()
        }

        fn timestamp_unit(&self) -> TimestampUnit {
            TimestampUnit::Nanoseconds
        }

        fn init(&mut self) -> AppResult<()> {
            let factory = pylon_cxx::TlFactory::instance(pylon());
            let devices = factory
                .enumerate_devices()
                .map_err(|e| camera_error("device enumeration failed", e))?;
            if devices.is_empty() {
                return Err(AcqError::DeviceNotFound {
                    name: self.name.clone(),
                    reason: "no cameras found".into(),
                });
            }

            let mut selected = None;
            for (index, device) in devices.iter().enumerate() {
                let serial = device
                    .property_value("SerialNumber")
                    .unwrap_or_else(|_| String::new());
                let matches = match &self.id {
                    DeviceId::Index(i) => index == *i as usize,
                    DeviceId::Serial(s) => &serial == s,
                };
                if matches {
                    selected = Some((device, serial));
                    break;
                }
            }
            let (device, serial) = selected.ok_or_else(|| AcqError::DeviceNotFound {
                name: self.name.clone(),
                reason: format!("no camera matching {:?} among {} devices", self.id, devices.len()),
            })?;

            let cam = factory
                .create_device(device)
                .map_err(|e| camera_error("failed to create camera", e))?;
            cam.open().map_err(|e| camera_error("failed to open camera", e))?;

            // Sanity check: the device we opened is the one we resolved.
            if let DeviceId::Serial(expected) = &self.id {
                if expected != &serial {
                    return Err(AcqError::DeviceNotFound {
                        name: self.name.clone(),
                        reason: format!("serial mismatch: wanted {expected}, opened {serial}"),
                    });
                }
            }
            self.model = device.property_value("ModelName").ok();
            self.serial = Some(serial);
            self.cam = Some(cam);
            info!(
                "Opened camera '{}' (serial {}, model {})",
                self.name,
                self.serial.as_deref().unwrap_or("?"),
                self.model.as_deref().unwrap_or("?")
            );
            Ok(())
        }

        fn configure(&mut self, spec: &CameraConfig) -> AppResult<()> {
            // Reset to defaults first so leftover state from a previous run
            // cannot leak into this one.
            self.set_enum("UserSetSelector", "Default")?;
            self.cam()?
                .node_map()
                .command_node("UserSetLoad")
                .and_then(|n| n.execute())
                .map_err(|e| camera_error("UserSetLoad failed", e))?;

            self.set_enum("GainAuto", "Off")?;
            self.set_float("Gain", spec.gain)?;
            self.set_float("Gamma", spec.gamma)?;
            self.set_enum("ExposureAuto", "Off")?;
            self.set_float("ExposureTime", f64::from(spec.exposure_us))?;

            if let Some(roi) = spec.roi {
                self.set_int("Width", i64::from(roi.width))?;
                self.set_int("Height", i64::from(roi.height))?;
                self.set_int("OffsetX", i64::from(roi.x))?;
                self.set_int("OffsetY", i64::from(roi.y))?;
            }

            match spec.trigger_mode() {
                TriggerMode::External => {
                    self.set_enum("AcquisitionMode", "Continuous")?;
                    // The selector must be set while the trigger is off.
                    self.set_enum("TriggerMode", "Off")?;
                    self.set_enum("TriggerSource", &spec.trigger_source)?;
                    self.set_enum("TriggerSelector", "FrameStart")?;
                    self.set_enum("TriggerActivation", "RisingEdge")?;
                    self.set_enum("TriggerMode", "On")?;
                }
                TriggerMode::Software => {
                    return Err(AcqError::DeviceConfigRejected {
                        name: self.name.clone(),
                        reason: "software trigger is not supported for Basler cameras".into(),
                    });
                }
                TriggerMode::None => {
                    self.set_enum("AcquisitionMode", "Continuous")?;
                    self.set_enum("TriggerMode", "Off")?;
                }
            }
            debug!("Configured camera '{}'", self.name);
            Ok(())
        }

        fn start(&mut self) -> AppResult<()> {
            self.cam()?
                .start_grabbing(&pylon_cxx::GrabOptions::default())
                .map_err(|e| camera_error("start_grabbing failed", e))?;
            self.grabbing = true;
            Ok(())
        }

        fn grab(&mut self, timeout: Duration) -> AppResult<GrabOutcome> {
            let cam = self.cam()?;
            let mut result = pylon_cxx::GrabResult::new()
                .map_err(|e| camera_error("failed to allocate grab result", e))?;
            let got = cam
                .retrieve_result(
                    timeout.as_millis() as u32,
                    &mut result,
                    pylon_cxx::TimeoutHandling::Return,
                )
                .map_err(|e| camera_error("retrieve_result failed", e))?;
            if !got {
                return Ok(GrabOutcome::Timeout);
            }
            if !result
                .grab_succeeded()
                .map_err(|e| camera_error("grab status unavailable", e))?
            {
                return Ok(GrabOutcome::Corrupt);
            }

            let width = result.width().map_err(|e| camera_error("width", e))?;
            let height = result.height().map_err(|e| camera_error("height", e))?;
            let pixels = result
                .buffer()
                .map_err(|e| camera_error("buffer", e))?
                .to_vec();
            let timestamp = result
                .time_stamp()
                .map_err(|e| camera_error("time_stamp", e))?;

            Ok(GrabOutcome::Frame(CapturedFrame {
                payload: FramePayload::Mono(ImagePlane {
                    width,
                    height,
                    pixels: PixelBuffer::U8(pixels),
                }),
                timestamp: DeviceTimestamp {
                    value: timestamp,
                    unit: TimestampUnit::Nanoseconds,
                },
            }))
        }

        fn stop(&mut self) -> AppResult<()> {
            if self.grabbing {
                self.cam()?
                    .stop_grabbing()
                    .map_err(|e| camera_error("stop_grabbing failed", e))?;
                self.grabbing = false;
            }
            Ok(())
        }

        fn close(&mut self) -> AppResult<()> {
            self.stop()?;
            self.cam = None;
            Ok(())
        }
    }
}

#[cfg(not(feature = "pylon_hardware"))]
pub fn open_driver(
    _spec: &crate::config::CameraConfig,
) -> crate::error::AppResult<Box<dyn super::CameraDriver>> {
    Err(crate::error::AcqError::FeatureNotEnabled("pylon_hardware"))
}
