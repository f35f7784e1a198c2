//! Recording configuration.
//!
//! A [`RecordingConfig`] describes one acquisition run: the global frame
//! rate, the camera set, the microcontroller pin assignment and pulse
//! timings, and per-run tuning knobs. Configs load from YAML, fill gaps with
//! per-vendor defaults, validate themselves before any device I/O, and are
//! snapshotted back to `<prefix>.config.yaml` so a recording is always
//! accompanied by the exact configuration that produced it.
//!
//! Validation is a set of independent rules, each with its own test; a
//! failure names the rule and the offending value.

use std::collections::HashSet;
use std::fs::File;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{AcqError, AppResult};
use crate::schedule::{
    DEPTH_INTERSUBFRAME_PERIOD_US, DEPTH_SUBFRAME_DURATION_US, SUPPORTED_DEPTH_FPS,
};
use crate::writer::PixelFormat;

/// Camera vendor tag; selects the driver implementation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Vendor {
    /// Basler machine-vision camera (Pylon SDK).
    Basler,
    /// Synthetic free-running camera for tests and dry runs.
    Emulated,
    /// Azure Kinect depth camera.
    Azure,
}

/// Where a camera sits in the rig; determines which trigger pins drive it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CameraRole {
    Top,
    Bottom,
    Depth,
}

/// How a camera's exposures are initiated.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerMode {
    /// TTL rising edge from the microcontroller.
    External,
    /// Software trigger issued by the host.
    Software,
    /// Free-running at the configured frame rate.
    None,
}

/// Wired-sync role of a depth camera.
///
/// `Master` is the first subordinate to receive the external trigger: the
/// device is still programmed in subordinate wired-sync mode with zero delay.
/// `Standalone` runs without sync cabling and starts immediately.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncRole {
    Master,
    Subordinate,
    Standalone,
}

/// Camera device selector: enumeration index or serial number.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DeviceId {
    Index(u32),
    Serial(String),
}

impl Default for DeviceId {
    fn default() -> Self {
        DeviceId::Index(0)
    }
}

/// Region of interest for camera acquisition.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Roi {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

/// Which encoder implementation a stream uses.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WriterKind {
    /// External encoder subprocess fed over stdin.
    Ffmpeg,
    /// In-process GPU encoder writing a raw elementary stream.
    Nvenc,
}

/// Per-stream encoder settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WriterConfig {
    #[serde(default = "default_writer_kind")]
    pub kind: WriterKind,
    /// Encoder quality (qp/crf, 0-51, lower is better).
    #[serde(default = "default_quality")]
    pub quality: u32,
    /// GPU id for hardware encoding; `None` encodes on the CPU.
    #[serde(default)]
    pub gpu: Option<u32>,
    /// Encoder preset override; defaults depend on CPU vs GPU encoding.
    #[serde(default)]
    pub preset: Option<String>,
    #[serde(default = "default_loglevel")]
    pub loglevel: String,
    /// Frames per segment before rolling over to a new file.
    /// Defaults to one day of frames at the stream rate.
    #[serde(default)]
    pub max_video_frames: Option<u64>,
    /// Wrap NVENC elementary streams in a container after each segment closes.
    #[serde(default = "default_true")]
    pub auto_remux: bool,
    /// Input pixel format override; derived from the stream otherwise.
    #[serde(default)]
    pub pixel_format: Option<PixelFormat>,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            kind: default_writer_kind(),
            quality: default_quality(),
            gpu: None,
            preset: None,
            loglevel: default_loglevel(),
            max_video_frames: None,
            auto_remux: true,
            pixel_format: None,
        }
    }
}

/// Per-camera live preview settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CameraDisplayConfig {
    /// (min, max) pixel values mapped onto the display range.
    #[serde(default = "default_display_range")]
    pub display_range: (u32, u32),
}

/// One camera in the rig.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CameraConfig {
    pub name: String,
    pub vendor: Vendor,
    #[serde(default)]
    pub id: DeviceId,
    #[serde(default = "default_role")]
    pub role: CameraRole,
    #[serde(default = "default_exposure")]
    pub exposure_us: u32,
    #[serde(default = "default_gain")]
    pub gain: f64,
    #[serde(default = "default_gamma")]
    pub gamma: f64,
    #[serde(default)]
    pub roi: Option<Roi>,
    /// Defaults to `external` for hardware cameras and `none` for emulated.
    #[serde(default)]
    pub trigger: Option<TriggerMode>,
    /// Camera input line carrying the trigger signal.
    #[serde(default = "default_trigger_source")]
    pub trigger_source: String,
    /// Depth cameras only.
    #[serde(default)]
    pub sync_role: Option<SyncRole>,
    /// Depth subordinates only; must be a multiple of 160.
    #[serde(default)]
    pub subordinate_delay_off_master_us: u32,
    #[serde(default)]
    pub writer: WriterConfig,
    #[serde(default)]
    pub display: Option<CameraDisplayConfig>,
}

impl CameraConfig {
    /// Effective trigger mode after vendor defaults.
    pub fn trigger_mode(&self) -> TriggerMode {
        match self.trigger {
            Some(mode) => mode,
            None => match self.vendor {
                Vendor::Emulated => TriggerMode::None,
                _ => TriggerMode::External,
            },
        }
    }

    pub fn is_depth(&self) -> bool {
        self.vendor == Vendor::Azure
    }

    /// Frame rate this camera actually runs at: depth cameras are fixed at
    /// 30 Hz regardless of the machine-vision rate.
    pub fn stream_fps(&self, global_fps: u32) -> u32 {
        if self.is_depth() {
            30
        } else {
            global_fps
        }
    }
}

/// Microcontroller pin assignment and pulse timing.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct McuConfig {
    /// Serial port path; autodiscovered when absent.
    #[serde(default)]
    pub port: Option<String>,
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,
    #[serde(default = "default_top_camera_pins")]
    pub top_camera_pins: Vec<u16>,
    #[serde(default)]
    pub bottom_camera_pins: Vec<u16>,
    #[serde(default)]
    pub depth_trigger_pins: Vec<u16>,
    #[serde(default)]
    pub input_pins: Vec<u16>,
    #[serde(default)]
    pub top_light_pins: Vec<u16>,
    #[serde(default)]
    pub bottom_light_pins: Vec<u16>,
    #[serde(default)]
    pub random_output_pins: Vec<u16>,
    #[serde(default)]
    pub custom_output_times: Vec<u32>,
    #[serde(default)]
    pub custom_output_pins: Vec<u16>,
    #[serde(default)]
    pub custom_output_states: Vec<u8>,
    /// Defaults to the longest machine-vision exposure.
    #[serde(default)]
    pub top_light_dur_us: Option<u32>,
    #[serde(default)]
    pub bottom_light_dur_us: Option<u32>,
    #[serde(default = "default_pulse_dur")]
    pub depth_pulse_dur_us: u32,
    #[serde(default = "default_pulse_dur")]
    pub basler_pulse_dur_us: u32,
    #[serde(default = "default_pulse_dur")]
    pub bottom_camera_offset_us: u32,
    #[serde(default = "default_gap")]
    pub gap_between_depth_and_basler_us: u32,
    #[serde(default = "default_one")]
    pub cycles_per_random_bit_flip: u32,
}

impl Default for McuConfig {
    fn default() -> Self {
        Self {
            port: None,
            baud_rate: default_baud_rate(),
            top_camera_pins: default_top_camera_pins(),
            bottom_camera_pins: Vec::new(),
            depth_trigger_pins: Vec::new(),
            input_pins: Vec::new(),
            top_light_pins: Vec::new(),
            bottom_light_pins: Vec::new(),
            random_output_pins: Vec::new(),
            custom_output_times: Vec::new(),
            custom_output_pins: Vec::new(),
            custom_output_states: Vec::new(),
            top_light_dur_us: None,
            bottom_light_dur_us: None,
            depth_pulse_dur_us: default_pulse_dur(),
            basler_pulse_dur_us: default_pulse_dur(),
            bottom_camera_offset_us: default_pulse_dur(),
            gap_between_depth_and_basler_us: default_gap(),
            cycles_per_random_bit_flip: default_one(),
        }
    }
}

/// Run-wide tuning knobs.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AcquisitionTuning {
    #[serde(default = "default_frame_timeout_ms")]
    pub frame_timeout_ms: u64,
    /// Capture-to-encoder queue depth; defaults to two seconds of frames.
    #[serde(default)]
    pub queue_capacity_frames: Option<usize>,
    /// How long a capture worker blocks on a full queue before dropping.
    #[serde(default)]
    pub queue_push_timeout_ms: Option<u64>,
}

impl Default for AcquisitionTuning {
    fn default() -> Self {
        Self {
            frame_timeout_ms: default_frame_timeout_ms(),
            queue_capacity_frames: None,
            queue_push_timeout_ms: None,
        }
    }
}

impl AcquisitionTuning {
    pub fn queue_capacity(&self, fps: u32) -> usize {
        self.queue_capacity_frames
            .unwrap_or_else(|| (2 * fps) as usize)
    }

    /// A few frame intervals, never below 50 ms.
    pub fn queue_push_timeout_ms(&self, fps: u32) -> u64 {
        self.queue_push_timeout_ms
            .unwrap_or_else(|| (4_000 / u64::from(fps.max(1))).max(50))
    }
}

/// Run-wide preview settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DisplayConfig {
    #[serde(default = "default_display_fps")]
    pub display_fps: u32,
    #[serde(default = "default_downsample")]
    pub downsample: u32,
}

impl Default for DisplayConfig {
    fn default() -> Self {
        Self {
            display_fps: default_display_fps(),
            downsample: default_downsample(),
        }
    }
}

/// Global run parameters.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Globals {
    #[serde(default = "default_fps")]
    pub fps: u32,
    #[serde(default = "default_prefix")]
    pub prefix: String,
}

impl Default for Globals {
    fn default() -> Self {
        Self {
            fps: default_fps(),
            prefix: default_prefix(),
        }
    }
}

/// Full configuration of one acquisition run.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RecordingConfig {
    #[serde(default)]
    pub globals: Globals,
    pub cameras: Vec<CameraConfig>,
    #[serde(default)]
    pub microcontroller: McuConfig,
    #[serde(default)]
    pub acquisition: AcquisitionTuning,
    #[serde(default)]
    pub display: DisplayConfig,
}

impl RecordingConfig {
    pub fn load(path: &Path) -> AppResult<Self> {
        let file = File::open(path)?;
        let config: RecordingConfig = serde_yaml::from_reader(file)?;
        Ok(config)
    }

    /// Write the resolved config next to the recording it produced.
    pub fn save_snapshot(&self, path: &Path) -> AppResult<()> {
        let file = File::create(path)?;
        serde_yaml::to_writer(file, self)?;
        Ok(())
    }

    pub fn n_depth(&self) -> usize {
        self.cameras.iter().filter(|c| c.is_depth()).count()
    }

    /// Longest exposure among the machine-vision cameras, used for the light
    /// duration default and the intersubframe-gap feasibility check.
    pub fn max_machine_vision_exposure_us(&self) -> u32 {
        self.cameras
            .iter()
            .filter(|c| !c.is_depth())
            .map(|c| c.exposure_us)
            .max()
            .unwrap_or(0)
    }

    /// Whether this run drives anything through the microcontroller.
    pub fn requires_microcontroller(&self) -> bool {
        self.cameras
            .iter()
            .any(|c| c.trigger_mode() == TriggerMode::External)
    }

    /// Run every validation rule; the first failure names the rule.
    pub fn validate(&self) -> AppResult<()> {
        validate_camera_names_unique(&self.cameras)?;
        validate_emulated_not_triggered(&self.cameras)?;
        validate_depth_sync_delay(&self.cameras)?;
        validate_pins_disjoint(&self.microcontroller)?;
        validate_top_camera_pins(&self.microcontroller)?;
        validate_depth_trigger_pins(&self.microcontroller, self.n_depth())?;
        validate_fps_for_depth(self.globals.fps, self.n_depth())?;
        validate_exposure_fits_gap(
            &self.microcontroller,
            self.n_depth(),
            self.globals.fps,
            self.max_machine_vision_exposure_us(),
        )?;
        validate_custom_events(&self.microcontroller)?;
        validate_display_fps(self)?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Validation rules. Each rule stands alone so it can be tested alone.
// ---------------------------------------------------------------------------

fn validate_camera_names_unique(cameras: &[CameraConfig]) -> AppResult<()> {
    let mut seen = HashSet::new();
    for cam in cameras {
        if !seen.insert(cam.name.as_str()) {
            return Err(AcqError::Configuration(format!(
                "camera name '{}' is used more than once",
                cam.name
            )));
        }
    }
    Ok(())
}

fn validate_emulated_not_triggered(cameras: &[CameraConfig]) -> AppResult<()> {
    for cam in cameras {
        if cam.vendor == Vendor::Emulated && cam.trigger == Some(TriggerMode::External) {
            return Err(AcqError::Configuration(format!(
                "camera '{}': emulated cameras cannot use the external trigger",
                cam.name
            )));
        }
    }
    Ok(())
}

fn validate_depth_sync_delay(cameras: &[CameraConfig]) -> AppResult<()> {
    for cam in cameras.iter().filter(|c| c.is_depth()) {
        let delay = cam.subordinate_delay_off_master_us;
        if delay % DEPTH_SUBFRAME_DURATION_US != 0 {
            return Err(AcqError::Configuration(format!(
                "camera '{}': subordinate_delay_off_master_us must be a multiple of {} but was {}",
                cam.name, DEPTH_SUBFRAME_DURATION_US, delay
            )));
        }
    }
    Ok(())
}

fn validate_pins_disjoint(mcu: &McuConfig) -> AppResult<()> {
    let role_pins: Vec<u16> = mcu
        .top_camera_pins
        .iter()
        .chain(&mcu.top_light_pins)
        .chain(&mcu.bottom_camera_pins)
        .chain(&mcu.bottom_light_pins)
        .chain(&mcu.depth_trigger_pins)
        .chain(&mcu.random_output_pins)
        .chain(&mcu.input_pins)
        .copied()
        .collect();
    let unique: HashSet<u16> = role_pins.iter().copied().collect();
    if unique.len() != role_pins.len() {
        return Err(AcqError::Configuration(
            "some pins are repeated within or between the camera, light, depth, random-output \
             and input pin lists"
                .into(),
        ));
    }
    if mcu.custom_output_pins.iter().any(|p| unique.contains(p)) {
        return Err(AcqError::Configuration(
            "some pins are shared between custom_output_pins and the other pin lists".into(),
        ));
    }
    Ok(())
}

fn validate_top_camera_pins(mcu: &McuConfig) -> AppResult<()> {
    if mcu.top_camera_pins.is_empty() {
        return Err(AcqError::Configuration(
            "there must be at least one top camera trigger pin".into(),
        ));
    }
    Ok(())
}

fn validate_depth_trigger_pins(mcu: &McuConfig, n_depth: usize) -> AppResult<()> {
    if n_depth > 0 && mcu.depth_trigger_pins.is_empty() {
        return Err(AcqError::Configuration(
            "there must be at least one depth trigger pin when depth cameras are present".into(),
        ));
    }
    Ok(())
}

fn validate_fps_for_depth(fps: u32, n_depth: usize) -> AppResult<()> {
    if n_depth > 0 && !SUPPORTED_DEPTH_FPS.contains(&fps) {
        return Err(AcqError::Configuration(format!(
            "fps must be one of {SUPPORTED_DEPTH_FPS:?} when depth cameras are present, not {fps}"
        )));
    }
    Ok(())
}

fn validate_exposure_fits_gap(
    mcu: &McuConfig,
    n_depth: usize,
    fps: u32,
    max_exposure_us: u32,
) -> AppResult<()> {
    if n_depth == 0 || fps <= 30 {
        return Ok(());
    }
    let budget = DEPTH_INTERSUBFRAME_PERIOD_US
        .saturating_sub(n_depth as u32 * DEPTH_SUBFRAME_DURATION_US)
        .saturating_sub(2 * mcu.gap_between_depth_and_basler_us);
    if max_exposure_us > budget {
        return Err(AcqError::Configuration(format!(
            "machine-vision exposure must be at most {budget} us with {n_depth} depth camera(s) \
             and a {} us depth-to-camera gap, but was {max_exposure_us} us",
            mcu.gap_between_depth_and_basler_us
        )));
    }
    Ok(())
}

fn validate_custom_events(mcu: &McuConfig) -> AppResult<()> {
    if mcu.custom_output_times.len() != mcu.custom_output_pins.len()
        || mcu.custom_output_pins.len() != mcu.custom_output_states.len()
    {
        return Err(AcqError::Configuration(
            "custom_output_times, custom_output_pins and custom_output_states must all have the \
             same length"
                .into(),
        ));
    }
    if mcu.custom_output_states.iter().any(|&s| s > 1) {
        return Err(AcqError::Configuration(
            "custom_output_states must be 0 or 1".into(),
        ));
    }
    Ok(())
}

fn validate_display_fps(config: &RecordingConfig) -> AppResult<()> {
    let any_display = config.cameras.iter().any(|c| c.display.is_some());
    if !any_display {
        return Ok(());
    }
    let display_fps = config.display.display_fps;
    if display_fps == 0 || config.globals.fps % display_fps != 0 {
        return Err(AcqError::Configuration(format!(
            "display_fps ({display_fps}) must be a factor of the capture frame rate ({})",
            config.globals.fps
        )));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// serde defaults
// ---------------------------------------------------------------------------

fn default_fps() -> u32 {
    30
}
fn default_prefix() -> String {
    "recording".into()
}
fn default_role() -> CameraRole {
    CameraRole::Top
}
fn default_exposure() -> u32 {
    1000
}
fn default_gain() -> f64 {
    6.0
}
fn default_gamma() -> f64 {
    1.0
}
fn default_trigger_source() -> String {
    "Line2".into()
}
fn default_writer_kind() -> WriterKind {
    WriterKind::Ffmpeg
}
fn default_quality() -> u32 {
    15
}
fn default_loglevel() -> String {
    "error".into()
}
fn default_true() -> bool {
    true
}
fn default_display_range() -> (u32, u32) {
    (0, 255)
}
fn default_baud_rate() -> u32 {
    115_200
}
fn default_top_camera_pins() -> Vec<u16> {
    vec![1, 3, 5, 7, 9]
}
fn default_pulse_dur() -> u32 {
    100
}
fn default_gap() -> u32 {
    50
}
fn default_one() -> u32 {
    1
}
fn default_frame_timeout_ms() -> u64 {
    1000
}
fn default_display_fps() -> u32 {
    30
}
fn default_downsample() -> u32 {
    4
}

/// Frames per segment when the writer config leaves it unset: one day.
pub fn default_max_video_frames(stream_fps: u32) -> u64 {
    u64::from(stream_fps) * 86_400
}

#[cfg(test)]
mod tests {
    use super::*;

    fn emulated_camera(name: &str) -> CameraConfig {
        CameraConfig {
            name: name.into(),
            vendor: Vendor::Emulated,
            id: DeviceId::Index(0),
            role: CameraRole::Top,
            exposure_us: 1000,
            gain: 6.0,
            gamma: 1.0,
            roi: None,
            trigger: None,
            trigger_source: default_trigger_source(),
            sync_role: None,
            subordinate_delay_off_master_us: 0,
            writer: WriterConfig::default(),
            display: None,
        }
    }

    fn depth_camera(name: &str) -> CameraConfig {
        CameraConfig {
            vendor: Vendor::Azure,
            role: CameraRole::Depth,
            sync_role: Some(SyncRole::Subordinate),
            ..emulated_camera(name)
        }
    }

    fn base_config() -> RecordingConfig {
        RecordingConfig {
            globals: Globals::default(),
            cameras: vec![emulated_camera("top")],
            microcontroller: McuConfig::default(),
            acquisition: AcquisitionTuning::default(),
            display: DisplayConfig::default(),
        }
    }

    #[test]
    fn test_valid_default_config_passes() {
        base_config().validate().unwrap();
    }

    #[test]
    fn test_duplicate_camera_names_rejected() {
        let mut config = base_config();
        config.cameras.push(emulated_camera("top"));
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("more than once"));
    }

    #[test]
    fn test_repeated_pin_across_roles_rejected() {
        let mut mcu = McuConfig::default();
        mcu.bottom_camera_pins = vec![1]; // already a top camera pin
        assert!(validate_pins_disjoint(&mcu).is_err());
    }

    #[test]
    fn test_pin_shared_with_custom_outputs_rejected() {
        let mut mcu = McuConfig {
            custom_output_pins: vec![7],
            custom_output_times: vec![0],
            custom_output_states: vec![1],
            ..McuConfig::default()
        };
        assert!(mcu.top_camera_pins.contains(&7));
        assert!(validate_pins_disjoint(&mcu).is_err());
        mcu.custom_output_pins = vec![30];
        assert!(validate_pins_disjoint(&mcu).is_ok());
    }

    #[test]
    fn test_empty_top_camera_pins_rejected() {
        let mcu = McuConfig {
            top_camera_pins: Vec::new(),
            ..McuConfig::default()
        };
        assert!(validate_top_camera_pins(&mcu).is_err());
    }

    #[test]
    fn test_depth_trigger_pins_required_with_depth_cameras() {
        let mcu = McuConfig::default();
        assert!(validate_depth_trigger_pins(&mcu, 0).is_ok());
        assert!(validate_depth_trigger_pins(&mcu, 1).is_err());
    }

    #[test]
    fn test_fps_rule_only_applies_with_depth_cameras() {
        assert!(validate_fps_for_depth(100, 0).is_ok());
        assert!(validate_fps_for_depth(100, 1).is_err());
        for fps in SUPPORTED_DEPTH_FPS {
            assert!(validate_fps_for_depth(fps, 2).is_ok());
        }
    }

    #[test]
    fn test_exposure_budget_with_two_depth_cameras() {
        let mcu = McuConfig::default();
        // 1575 - 2*160 - 2*50 = 1155
        assert!(validate_exposure_fits_gap(&mcu, 2, 120, 1155).is_ok());
        assert!(validate_exposure_fits_gap(&mcu, 2, 120, 1600).is_err());
        // At 30 fps the cameras expose outside the subframe train entirely.
        assert!(validate_exposure_fits_gap(&mcu, 2, 30, 1600).is_ok());
    }

    #[test]
    fn test_custom_event_arrays_must_agree() {
        let mcu = McuConfig {
            custom_output_times: vec![10, 20],
            custom_output_pins: vec![30],
            custom_output_states: vec![1, 0],
            ..McuConfig::default()
        };
        assert!(validate_custom_events(&mcu).is_err());

        let mcu = McuConfig {
            custom_output_times: vec![10],
            custom_output_pins: vec![30],
            custom_output_states: vec![2],
            ..McuConfig::default()
        };
        assert!(validate_custom_events(&mcu).is_err());
    }

    #[test]
    fn test_depth_sync_delay_must_be_subframe_multiple() {
        let mut cam = depth_camera("depth0");
        cam.subordinate_delay_off_master_us = 480;
        assert!(validate_depth_sync_delay(&[cam.clone()]).is_ok());
        cam.subordinate_delay_off_master_us = 100;
        assert!(validate_depth_sync_delay(&[cam]).is_err());
    }

    #[test]
    fn test_display_fps_must_divide_capture_fps() {
        let mut config = base_config();
        config.cameras[0].display = Some(CameraDisplayConfig {
            display_range: (0, 255),
        });
        config.globals.fps = 90;
        config.display.display_fps = 30;
        assert!(config.validate().is_ok());
        config.display.display_fps = 40;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_emulated_camera_defaults_to_free_running() {
        let cam = emulated_camera("top");
        assert_eq!(cam.trigger_mode(), TriggerMode::None);
        let mut hw = emulated_camera("hw");
        hw.vendor = Vendor::Basler;
        assert_eq!(hw.trigger_mode(), TriggerMode::External);
    }

    #[test]
    fn test_requires_microcontroller() {
        let mut config = base_config();
        assert!(!config.requires_microcontroller());
        let mut hw = emulated_camera("hw");
        hw.vendor = Vendor::Basler;
        config.cameras.push(hw);
        assert!(config.requires_microcontroller());
    }

    #[test]
    fn test_yaml_round_trip_with_defaults() {
        let yaml = r#"
globals:
  fps: 120
cameras:
  - name: top
    vendor: basler
    id: "40122785"
    exposure_us: 950
  - name: depth0
    vendor: azure
    role: depth
    sync_role: master
microcontroller:
  depth_trigger_pins: [0]
"#;
        let config: RecordingConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.globals.fps, 120);
        assert_eq!(config.cameras[0].id, DeviceId::Serial("40122785".into()));
        assert_eq!(config.cameras[0].gain, 6.0);
        assert_eq!(config.n_depth(), 1);
        assert_eq!(config.cameras[1].stream_fps(120), 30);
        config.validate().unwrap();
    }

    #[test]
    fn test_queue_defaults_scale_with_fps() {
        let tuning = AcquisitionTuning::default();
        assert_eq!(tuning.queue_capacity(120), 240);
        assert_eq!(tuning.queue_push_timeout_ms(120), 50);
        assert_eq!(tuning.queue_push_timeout_ms(30), 133);
        assert_eq!(
            AcquisitionTuning {
                queue_capacity_frames: Some(16),
                ..Default::default()
            }
            .queue_capacity(120),
            16
        );
    }
}
