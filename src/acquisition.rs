//! Capture workers.
//!
//! One [`CaptureWorker`] per camera runs on a dedicated thread, because
//! camera SDKs block. It walks the state machine
//! `Created → Initialized → Started → Capturing → Stopping → Closed`,
//! signalling readiness twice: once after the device is opened and
//! configured, and again after `start()` — so the orchestrator knows every
//! camera is armed before the microcontroller emits its first trigger.
//!
//! Frames are tagged with a per-camera sequence and pushed into bounded
//! queues with a timed send; a full queue drops the frame with a warning
//! (never silently), and sustained backpressure fails the run. On exit the
//! worker pushes a sentinel into every queue and releases the device even
//! when the grab loop errored.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crossbeam_channel::Sender;
use log::{debug, error, info, warn};
use tokio::sync::oneshot;

use crate::camera::{CameraDriver, FramePayload, GrabOutcome, ImagePlane};
use crate::display::{self, DisplayFrame};
use crate::error::{AcqError, AppResult};
use crate::writer::{FrameMessage, StreamFrame};

/// Consecutive dropped pushes on one queue before backpressure is fatal.
const BACKPRESSURE_FATAL_DROPS: u64 = 100;

/// How long to block delivering the terminal sentinel. If the queue is still
/// full after this, dropping the sender carries the same signal: encoder
/// workers treat a disconnected queue as a sentinel once drained.
const SENTINEL_PUSH_TIMEOUT: Duration = Duration::from_secs(1);

/// Capture lifecycle; transitions are logged for post-mortems.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WorkerState {
    Created,
    Initialized,
    Started,
    Capturing,
    Stopping,
    Closed,
}

/// Counters reported when a capture worker exits.
#[derive(Debug, Default, Clone, Copy)]
pub struct CaptureReport {
    pub frames_acquired: u64,
    pub timeouts: u64,
    pub corrupt_frames: u64,
    pub dropped_backpressure: u64,
}

/// Outbound queues of one camera: one for mono cameras, infrared plus depth
/// for depth cameras (in that order).
pub struct CaptureStreams {
    pub senders: Vec<Sender<FrameMessage>>,
}

pub struct CaptureWorker {
    camera_name: String,
    driver: Box<dyn CameraDriver>,
    spec: crate::config::CameraConfig,
    streams: CaptureStreams,
    display_tx: Option<Sender<DisplayFrame>>,
    /// Forward every Nth frame to the display fan-out.
    display_stride: u64,
    display_downsample: u32,
    stop: Arc<AtomicBool>,
    run_failed: Arc<AtomicBool>,
    frame_timeout: Duration,
    push_timeout: Duration,
    max_frames: Option<u64>,
    state: WorkerState,
}

#[allow(clippy::too_many_arguments)]
impl CaptureWorker {
    pub fn new(
        driver: Box<dyn CameraDriver>,
        spec: crate::config::CameraConfig,
        streams: CaptureStreams,
        display_tx: Option<Sender<DisplayFrame>>,
        display_stride: u64,
        display_downsample: u32,
        stop: Arc<AtomicBool>,
        run_failed: Arc<AtomicBool>,
        frame_timeout: Duration,
        push_timeout: Duration,
        max_frames: Option<u64>,
    ) -> Self {
        Self {
            camera_name: spec.name.clone(),
            driver,
            spec,
            streams,
            display_tx,
            display_stride: display_stride.max(1),
            display_downsample,
            stop,
            run_failed,
            frame_timeout,
            push_timeout,
            max_frames,
            state: WorkerState::Created,
        }
    }

    fn transition(&mut self, next: WorkerState) {
        debug!("[{}] {:?} -> {:?}", self.camera_name, self.state, next);
        self.state = next;
    }

    /// Run the capture loop on the current (dedicated) thread.
    ///
    /// `ready_init` fires once the device is open and configured;
    /// `ready_armed` fires once `start()` has returned after the `proceed`
    /// signal. A dropped `proceed` means the orchestrator gave up during
    /// startup, and the worker closes the device and exits cleanly.
    pub fn run(
        mut self,
        ready_init: oneshot::Sender<()>,
        proceed: oneshot::Receiver<()>,
        ready_armed: oneshot::Sender<()>,
    ) -> AppResult<CaptureReport> {
        let result = self.run_inner(ready_init, proceed, ready_armed);
        if let Err(err) = &result {
            error!("[{}] capture worker failed: {err}", self.camera_name);
            self.run_failed.store(true, Ordering::SeqCst);
        }
        // Sentinels and device teardown happen on every exit path.
        for sender in &self.streams.senders {
            if sender
                .send_timeout(FrameMessage::End, SENTINEL_PUSH_TIMEOUT)
                .is_err()
            {
                debug!(
                    "[{}] sentinel not delivered; writer will see the queue close",
                    self.camera_name
                );
            }
        }
        self.transition(WorkerState::Stopping);
        if let Err(err) = self.driver.stop() {
            warn!("[{}] stop failed: {err}", self.camera_name);
        }
        if let Err(err) = self.driver.close() {
            warn!("[{}] close failed: {err}", self.camera_name);
        }
        self.transition(WorkerState::Closed);
        result
    }

    fn run_inner(
        &mut self,
        ready_init: oneshot::Sender<()>,
        proceed: oneshot::Receiver<()>,
        ready_armed: oneshot::Sender<()>,
    ) -> AppResult<CaptureReport> {
        self.driver.init()?;
        self.driver.configure(&self.spec)?;
        self.transition(WorkerState::Initialized);
        let _ = ready_init.send(());

        if proceed.blocking_recv().is_err() {
            info!("[{}] orchestrator gave up before start", self.camera_name);
            return Ok(CaptureReport::default());
        }
        self.driver.start()?;
        self.transition(WorkerState::Started);
        let _ = ready_armed.send(());

        let mut report = CaptureReport::default();
        let mut consecutive_drops: u64 = 0;

        while !self.stop.load(Ordering::SeqCst) {
            if let Some(max) = self.max_frames {
                if report.frames_acquired >= max {
                    info!(
                        "[{}] reached {} frames, stopping",
                        self.camera_name, max
                    );
                    break;
                }
            }
            match self.driver.grab(self.frame_timeout)? {
                GrabOutcome::Frame(frame) => {
                    if report.frames_acquired == 0 {
                        self.transition(WorkerState::Capturing);
                    }
                    let sequence = report.frames_acquired;
                    let host_uid = unix_time_seconds();
                    self.fan_out_display(sequence, &frame.payload);

                    let planes: Vec<ImagePlane> = match frame.payload {
                        FramePayload::Mono(plane) => vec![plane],
                        FramePayload::DepthIr { ir, depth } => vec![ir, depth],
                    };
                    let mut any_dropped = false;
                    for (plane, sender) in planes.into_iter().zip(&self.streams.senders) {
                        let message = FrameMessage::Frame(StreamFrame {
                            sequence,
                            device_timestamp: frame.timestamp.value,
                            host_uid,
                            width: plane.width,
                            height: plane.height,
                            pixels: plane.pixels,
                        });
                        if sender.send_timeout(message, self.push_timeout).is_err() {
                            any_dropped = true;
                            report.dropped_backpressure += 1;
                            warn!(
                                "[{}] frame {} dropped: writer queue full for {:?}",
                                self.camera_name, sequence, self.push_timeout
                            );
                        }
                    }
                    if any_dropped {
                        consecutive_drops += 1;
                        if consecutive_drops >= BACKPRESSURE_FATAL_DROPS {
                            return Err(AcqError::Encoder(format!(
                                "writer for '{}' fell behind: {} consecutive frames dropped",
                                self.camera_name, consecutive_drops
                            )));
                        }
                    } else {
                        consecutive_drops = 0;
                    }
                    report.frames_acquired += 1;
                }
                GrabOutcome::Timeout => {
                    report.timeouts += 1;
                    debug!("[{}] frame timeout", self.camera_name);
                }
                GrabOutcome::Corrupt => {
                    report.corrupt_frames += 1;
                    warn!(
                        "[{}] corrupt frame discarded (total {})",
                        self.camera_name, report.corrupt_frames
                    );
                }
            }
        }

        info!(
            "[{}] capture done: {} frames, {} timeouts, {} corrupt, {} dropped",
            self.camera_name,
            report.frames_acquired,
            report.timeouts,
            report.corrupt_frames,
            report.dropped_backpressure
        );
        Ok(report)
    }

    /// Best-effort preview: subsampled, downscaled, and never blocking.
    fn fan_out_display(&mut self, sequence: u64, payload: &FramePayload) {
        let Some(tx) = &self.display_tx else {
            return;
        };
        if sequence % self.display_stride != 0 {
            return;
        }
        let plane = match payload {
            FramePayload::Mono(plane) => plane,
            // Preview shows the infrared image for depth cameras.
            FramePayload::DepthIr { ir, .. } => ir,
        };
        let frame = display::downsample_plane(plane, self.display_downsample);
        // A full preview queue means the frame is simply not shown.
        let _ = tx.try_send(frame);
    }
}

fn unix_time_seconds() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::{
        CapturedFrame, DeviceTimestamp, PixelBuffer, TimestampUnit,
    };
    use crate::config::{CameraConfig, CameraRole, DeviceId, Vendor, WriterConfig};
    use crossbeam_channel::bounded;

    fn spec() -> CameraConfig {
        CameraConfig {
            name: "fake".into(),
            vendor: Vendor::Emulated,
            id: DeviceId::Index(0),
            role: CameraRole::Top,
            exposure_us: 1000,
            gain: 6.0,
            gamma: 1.0,
            roi: None,
            trigger: None,
            trigger_source: "Line2".into(),
            sync_role: None,
            subordinate_delay_off_master_us: 0,
            writer: WriterConfig::default(),
            display: None,
        }
    }

    /// Scripted driver: a fixed list of grab outcomes, then timeouts.
    struct ScriptedDriver {
        outcomes: Vec<ScriptStep>,
        cursor: usize,
        started: bool,
    }

    enum ScriptStep {
        Frame,
        Timeout,
        Corrupt,
        Fatal,
    }

    impl ScriptedDriver {
        fn new(outcomes: Vec<ScriptStep>) -> Self {
            Self {
                outcomes,
                cursor: 0,
                started: false,
            }
        }
    }

    impl CameraDriver for ScriptedDriver {
        fn name(&self) -> &str {
            "fake"
        }
        fn serial(&self) -> Option<&str> {
            Some("fake-0")
        }
        fn timestamp_unit(&self) -> TimestampUnit {
            TimestampUnit::Nanoseconds
        }
        fn init(&mut self) -> AppResult<()> {
            Ok(())
        }
        fn configure(&mut self, _spec: &CameraConfig) -> AppResult<()> {
            Ok(())
        }
        fn start(&mut self) -> AppResult<()> {
            self.started = true;
            Ok(())
        }
        fn grab(&mut self, _timeout: Duration) -> AppResult<GrabOutcome> {
            assert!(self.started);
            let step = self.outcomes.get(self.cursor);
            self.cursor += 1;
            match step {
                Some(ScriptStep::Frame) => Ok(GrabOutcome::Frame(CapturedFrame {
                    payload: FramePayload::Mono(ImagePlane {
                        width: 4,
                        height: 2,
                        pixels: PixelBuffer::U8(vec![9; 8]),
                    }),
                    timestamp: DeviceTimestamp {
                        value: self.cursor as u64 * 1000,
                        unit: TimestampUnit::Nanoseconds,
                    },
                })),
                Some(ScriptStep::Corrupt) => Ok(GrabOutcome::Corrupt),
                Some(ScriptStep::Fatal) => Err(AcqError::Camera("device lost".into())),
                _ => Ok(GrabOutcome::Timeout),
            }
        }
        fn stop(&mut self) -> AppResult<()> {
            self.started = false;
            Ok(())
        }
        fn close(&mut self) -> AppResult<()> {
            Ok(())
        }
    }

    fn worker_with(
        driver: ScriptedDriver,
        tx: Sender<FrameMessage>,
        max_frames: Option<u64>,
        run_failed: Arc<AtomicBool>,
    ) -> CaptureWorker {
        CaptureWorker::new(
            Box::new(driver),
            spec(),
            CaptureStreams { senders: vec![tx] },
            None,
            1,
            4,
            Arc::new(AtomicBool::new(false)),
            run_failed,
            Duration::from_millis(10),
            Duration::from_millis(10),
            max_frames,
        )
    }

    fn run_to_completion(worker: CaptureWorker) -> AppResult<CaptureReport> {
        let (init_tx, init_rx) = oneshot::channel();
        let (proceed_tx, proceed_rx) = oneshot::channel();
        let (armed_tx, armed_rx) = oneshot::channel();
        let handle = std::thread::spawn(move || worker.run(init_tx, proceed_rx, armed_tx));
        init_rx.blocking_recv().unwrap();
        proceed_tx.send(()).unwrap();
        armed_rx.blocking_recv().unwrap();
        handle.join().unwrap()
    }

    #[test]
    fn test_sequences_are_contiguous_and_sentinel_follows() {
        let (tx, rx) = bounded(16);
        let script = vec![
            ScriptStep::Frame,
            ScriptStep::Timeout,
            ScriptStep::Frame,
            ScriptStep::Corrupt,
            ScriptStep::Frame,
        ];
        let worker = worker_with(
            ScriptedDriver::new(script),
            tx,
            Some(3),
            Arc::new(AtomicBool::new(false)),
        );
        let report = run_to_completion(worker).unwrap();
        assert_eq!(report.frames_acquired, 3);
        assert_eq!(report.timeouts, 1);
        assert_eq!(report.corrupt_frames, 1);

        let mut sequences = Vec::new();
        loop {
            match rx.recv().unwrap() {
                FrameMessage::Frame(f) => sequences.push(f.sequence),
                FrameMessage::End => break,
            }
        }
        assert_eq!(sequences, vec![0, 1, 2]);
    }

    #[test]
    fn test_fatal_grab_error_sets_run_failed_and_sends_sentinel() {
        let (tx, rx) = bounded(16);
        let run_failed = Arc::new(AtomicBool::new(false));
        let script = vec![ScriptStep::Frame, ScriptStep::Fatal];
        let worker = worker_with(ScriptedDriver::new(script), tx, None, run_failed.clone());
        assert!(run_to_completion(worker).is_err());
        assert!(run_failed.load(Ordering::SeqCst));
        // The one good frame, then the sentinel.
        assert!(matches!(rx.recv().unwrap(), FrameMessage::Frame(_)));
        assert!(matches!(rx.recv().unwrap(), FrameMessage::End));
    }

    #[test]
    fn test_full_queue_drops_frames_with_accounting() {
        // Queue of 1 with no consumer: the first frame fits, later ones drop.
        let (tx, rx) = bounded(1);
        let script = vec![ScriptStep::Frame, ScriptStep::Frame, ScriptStep::Frame];
        let worker = worker_with(
            ScriptedDriver::new(script),
            tx,
            Some(3),
            Arc::new(AtomicBool::new(false)),
        );
        let report = run_to_completion(worker).unwrap();
        assert_eq!(report.frames_acquired, 3);
        assert_eq!(report.dropped_backpressure, 2);
        assert!(matches!(rx.try_recv().unwrap(), FrameMessage::Frame(_)));
    }

    #[test]
    fn test_dropped_proceed_aborts_cleanly() {
        let (tx, rx) = bounded(4);
        let worker = worker_with(
            ScriptedDriver::new(vec![ScriptStep::Frame]),
            tx,
            None,
            Arc::new(AtomicBool::new(false)),
        );
        let (init_tx, init_rx) = oneshot::channel();
        let (proceed_tx, proceed_rx) = oneshot::channel::<()>();
        let (armed_tx, _armed_rx) = oneshot::channel();
        let handle = std::thread::spawn(move || worker.run(init_tx, proceed_rx, armed_tx));
        init_rx.blocking_recv().unwrap();
        drop(proceed_tx);
        let report = handle.join().unwrap().unwrap();
        assert_eq!(report.frames_acquired, 0);
        assert!(matches!(rx.recv().unwrap(), FrameMessage::End));
    }
}
