//! Acquisition orchestration.
//!
//! [`AcquisitionSession::run`] owns the whole run: plan and validate the
//! trigger schedule, snapshot the config, spawn encoder workers (first, so
//! queues have consumers), spawn capture workers, wait for the double ready
//! handshake (devices opened, then devices armed), and only then open the
//! microcontroller and start it emitting triggers. The MCU input stream is
//! polled until it reports completion, the wall-clock deadline passes, or
//! the operator interrupts; every path funnels into the same ordered
//! teardown: raise stop flags, join capture workers, let encoder workers
//! drain their sentinels, close the MCU.
//!
//! Ownership is a tree: the session owns workers and the MCU, each capture
//! worker owns its camera, each encoder worker owns its encoder. Workers
//! never reference the session; they communicate through queues and shared
//! flags.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::bounded;
use log::{debug, error, info, warn};
use tokio::task::JoinHandle;

use crate::acquisition::{CaptureReport, CaptureStreams, CaptureWorker};
use crate::camera;
use crate::config::{default_max_video_frames, CameraConfig, RecordingConfig, WriterKind};
use crate::display::{DisplayFanout, DisplayFrame, DisplaySink, DISPLAY_QUEUE_DEPTH};
use crate::error::{AcqError, AppResult};
use crate::microcontroller::{Microcontroller, RunOutcome, TriggerLog};
use crate::paths::SegmentNamer;
use crate::schedule;
use crate::writer::{self, EncoderReport, EncoderWorker, FrameMessage, PixelFormat};

/// How long device open + configure may take across all cameras.
const STARTUP_TIMEOUT: Duration = Duration::from_secs(30);
/// Grace period past the nominal deadline for self-pacing runs.
const COMPLETION_GRACE: Duration = Duration::from_secs(10);
/// Base join timeout for workers during teardown.
const JOIN_TIMEOUT: Duration = Duration::from_secs(15);

/// How one acquisition run ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionOutcome {
    /// The MCU finished every cycle, or all cameras hit their frame target.
    Completed,
    /// The wall-clock deadline cut the run short.
    DeadlineReached,
}

#[derive(Debug)]
pub struct SessionSummary {
    pub outcome: SessionOutcome,
    pub captures: Vec<(String, CaptureReport)>,
    pub encodings: Vec<(String, EncoderReport)>,
}

/// One stream of one camera, as wired into workers.
struct StreamPlan {
    stream_name: String,
    pixel_format: PixelFormat,
    writer: crate::config::WriterConfig,
}

fn stream_plans(cam: &CameraConfig) -> Vec<StreamPlan> {
    if cam.is_depth() {
        let mut depth_writer = cam.writer.clone();
        // The 16-bit depth plane is always lossless via the subprocess
        // encoder; NVENC only takes 8-bit input.
        depth_writer.kind = WriterKind::Ffmpeg;
        depth_writer.pixel_format = Some(PixelFormat::Gray16);
        vec![
            StreamPlan {
                stream_name: cam.name.clone(),
                pixel_format: PixelFormat::Gray8,
                writer: cam.writer.clone(),
            },
            StreamPlan {
                stream_name: format!("{}_depth", cam.name),
                pixel_format: PixelFormat::Gray16,
                writer: depth_writer,
            },
        ]
    } else {
        vec![StreamPlan {
            stream_name: cam.name.clone(),
            pixel_format: PixelFormat::Gray8,
            writer: cam.writer.clone(),
        }]
    }
}

/// Serial-or-index label embedded in output filenames.
fn device_label(cam: &CameraConfig) -> String {
    match &cam.id {
        crate::config::DeviceId::Serial(serial) => serial.clone(),
        crate::config::DeviceId::Index(index) => index.to_string(),
    }
}

pub struct AcquisitionSession {
    config: RecordingConfig,
    rec_dir: PathBuf,
    duration: Duration,
    display_sink: Option<Box<dyn DisplaySink>>,
}

impl AcquisitionSession {
    pub fn new(config: RecordingConfig, rec_dir: PathBuf, duration: Duration) -> Self {
        Self {
            config,
            rec_dir,
            duration,
            display_sink: None,
        }
    }

    /// Attach a preview sink; without one, display fan-out is disabled even
    /// for cameras that request it.
    pub fn with_display_sink(mut self, sink: Box<dyn DisplaySink>) -> Self {
        self.display_sink = Some(sink);
        self
    }

    pub async fn run(mut self) -> AppResult<SessionSummary> {
        self.config.validate()?;
        let fps = self.config.globals.fps;
        let n_depth = self.config.n_depth();
        let max_exposure = self.config.max_machine_vision_exposure_us();

        let plan = schedule::plan(&self.config.microcontroller, n_depth, fps, max_exposure)?;
        schedule::validate(&self.config.microcontroller, &plan, n_depth, fps, max_exposure)?;

        let prefix = self.config.globals.prefix.clone();
        self.config
            .save_snapshot(&self.rec_dir.join(format!("{prefix}.config.yaml")))?;
        let start_ts = crate::paths::run_start_timestamp();

        let stop = Arc::new(AtomicBool::new(false));
        let run_failed = Arc::new(AtomicBool::new(false));
        let mcu_stop = Arc::new(AtomicBool::new(false));

        // ------------------------------------------------------------------
        // Build workers: encoders first, then captures, then the preview.
        // ------------------------------------------------------------------
        let mut encoder_handles: Vec<(String, JoinHandle<AppResult<EncoderReport>>)> = Vec::new();
        let mut capture_handles: Vec<(String, JoinHandle<AppResult<CaptureReport>>)> = Vec::new();
        let mut readiness = Vec::new();
        let mut display_queues = Vec::new();

        let queue_capacity = self.config.acquisition.queue_capacity(fps);
        let frame_timeout = Duration::from_millis(self.config.acquisition.frame_timeout_ms);
        let push_timeout =
            Duration::from_millis(self.config.acquisition.queue_push_timeout_ms(fps));

        for cam in &self.config.cameras {
            let stream_fps = cam.stream_fps(fps);
            let driver = camera::build_driver(cam, stream_fps)?;
            let label = device_label(cam);

            let mut senders = Vec::new();
            for stream in stream_plans(cam) {
                let (tx, rx) = bounded::<FrameMessage>(queue_capacity);
                let encoder =
                    writer::build_encoder(&stream.writer, stream.pixel_format, stream_fps)?;
                let namer = SegmentNamer::new(
                    &self.rec_dir,
                    &prefix,
                    &start_ts,
                    &stream.stream_name,
                    &label,
                    encoder.file_extension(),
                );
                let max_video_frames = stream
                    .writer
                    .max_video_frames
                    .unwrap_or_else(|| default_max_video_frames(stream_fps));
                let worker = EncoderWorker::new(
                    stream.stream_name.clone(),
                    rx,
                    encoder,
                    namer,
                    max_video_frames,
                );
                encoder_handles.push((
                    stream.stream_name.clone(),
                    tokio::task::spawn_blocking(move || worker.run()),
                ));
                senders.push(tx);
            }

            let display_tx = match (&self.display_sink, &cam.display) {
                (Some(_), Some(_)) => {
                    let (tx, rx) = bounded::<DisplayFrame>(DISPLAY_QUEUE_DEPTH);
                    display_queues.push((cam.name.clone(), rx));
                    Some(tx)
                }
                _ => None,
            };
            let display_stride =
                u64::from((stream_fps / self.config.display.display_fps.max(1)).max(1));

            let max_frames = (self.duration.as_secs_f64() * f64::from(stream_fps)).round() as u64;
            let (init_tx, init_rx) = tokio::sync::oneshot::channel();
            let (proceed_tx, proceed_rx) = tokio::sync::oneshot::channel();
            let (armed_tx, armed_rx) = tokio::sync::oneshot::channel();
            let worker = CaptureWorker::new(
                driver,
                cam.clone(),
                CaptureStreams { senders },
                display_tx,
                display_stride,
                self.config.display.downsample,
                stop.clone(),
                run_failed.clone(),
                frame_timeout,
                push_timeout,
                Some(max_frames),
            );
            capture_handles.push((
                cam.name.clone(),
                tokio::task::spawn_blocking(move || worker.run(init_tx, proceed_rx, armed_tx)),
            ));
            readiness.push((cam.name.clone(), init_rx, proceed_tx, armed_rx));
        }

        let display_handle = match (self.display_sink.take(), display_queues.is_empty()) {
            (Some(sink), false) => {
                let fanout = DisplayFanout::new(
                    display_queues,
                    sink,
                    stop.clone(),
                    self.config.display.display_fps,
                );
                Some(tokio::task::spawn_blocking(move || fanout.run()))
            }
            _ => None,
        };

        // ------------------------------------------------------------------
        // Double ready handshake.
        // ------------------------------------------------------------------
        let mut proceeds = Vec::new();
        let mut startup_failure: Option<String> = None;
        for (name, init_rx, proceed_tx, armed_rx) in readiness {
            match tokio::time::timeout(STARTUP_TIMEOUT, init_rx).await {
                Ok(Ok(())) => proceeds.push((name, proceed_tx, armed_rx)),
                _ => {
                    // The proceed sender drops here, releasing the worker.
                    error!("Camera '{name}' failed to initialize");
                    startup_failure.get_or_insert(name);
                }
            }
        }
        if let Some(name) = startup_failure.take() {
            // Dropping the remaining proceed senders unblocks every worker
            // still waiting at the arm gate.
            drop(proceeds);
            self.teardown(&stop, capture_handles, encoder_handles, display_handle)
                .await;
            return Err(AcqError::WorkerFailed(name));
        }

        info!("All cameras initialized; arming");
        let mut armed_rxs = Vec::new();
        for (name, proceed_tx, armed_rx) in proceeds {
            if proceed_tx.send(()).is_ok() {
                armed_rxs.push((name, armed_rx));
            } else {
                error!("Camera '{name}' exited before it could be armed");
                startup_failure.get_or_insert(name);
            }
        }
        for (name, armed_rx) in armed_rxs {
            match tokio::time::timeout(STARTUP_TIMEOUT, armed_rx).await {
                Ok(Ok(())) => {}
                _ => {
                    error!("Camera '{name}' failed to arm");
                    startup_failure.get_or_insert(name);
                }
            }
        }
        if let Some(name) = startup_failure {
            self.teardown(&stop, capture_handles, encoder_handles, display_handle)
                .await;
            return Err(AcqError::WorkerFailed(name));
        }
        info!("All cameras armed");

        // ------------------------------------------------------------------
        // Drive the run: MCU-paced, or self-paced for trigger-free rigs.
        // ------------------------------------------------------------------
        let mut interrupted = false;
        let mut mcu_error: Option<AcqError> = None;
        let mut outcome = SessionOutcome::Completed;

        if self.config.requires_microcontroller() {
            let trigger_log =
                TriggerLog::create(&self.rec_dir.join(format!("{prefix}.triggerdata.csv")))?;
            let mcu_config = self.config.microcontroller.clone();
            let plan_for_mcu = plan.clone();
            let duration = self.duration;
            let opened = tokio::task::spawn_blocking(move || {
                let mut mcu = Microcontroller::open(
                    mcu_config.port.as_deref(),
                    mcu_config.baud_rate,
                    plan_for_mcu,
                    Some(trigger_log),
                )?;
                mcu.start_acquisition(duration)?;
                Ok::<_, AcqError>(mcu)
            })
            .await
            .map_err(|e| AcqError::WorkerFailed(format!("mcu startup task: {e}")))?;

            let mut mcu = match opened {
                Ok(mcu) => mcu,
                Err(err) => {
                    stop.store(true, Ordering::SeqCst);
                    self.teardown(&stop, capture_handles, encoder_handles, display_handle)
                        .await;
                    return Err(err);
                }
            };

            let deadline = Instant::now() + self.duration + Duration::from_secs(2);
            let mcu_stop_flag = mcu_stop.clone();
            let mut mcu_task = tokio::task::spawn_blocking(move || {
                let outcome = mcu.run_to_completion(deadline, mcu_stop_flag.as_ref());
                (mcu, outcome)
            });

            let (mcu, run_result) = loop {
                tokio::select! {
                    joined = &mut mcu_task => {
                        break joined.map_err(|e| {
                            AcqError::WorkerFailed(format!("mcu task: {e}"))
                        })?;
                    }
                    _ = tokio::signal::ctrl_c() => {
                        info!("Operator interrupt; stopping acquisition");
                        interrupted = true;
                        mcu_stop.store(true, Ordering::SeqCst);
                    }
                    _ = tokio::time::sleep(Duration::from_millis(250)) => {
                        if run_failed.load(Ordering::SeqCst) {
                            warn!("A worker failed; interrupting the MCU");
                            mcu_stop.store(true, Ordering::SeqCst);
                        }
                    }
                }
            };
            match run_result {
                Ok(RunOutcome::Finished) => info!("MCU reported acquisition complete"),
                Ok(RunOutcome::DeadlineReached) => outcome = SessionOutcome::DeadlineReached,
                Ok(RunOutcome::Interrupted) => {}
                Err(err) => {
                    error!("MCU input loop failed: {err}");
                    mcu_error = Some(err);
                }
            }
            if let Err(err) = tokio::task::spawn_blocking(move || mcu.close())
                .await
                .map_err(|e| AcqError::WorkerFailed(format!("mcu close task: {e}")))?
            {
                warn!("Closing the MCU link failed: {err}");
            }
        } else {
            // No external triggers: cameras pace themselves and stop at
            // their frame targets.
            debug!("No externally triggered cameras; running without the MCU");
            let deadline = tokio::time::sleep(self.duration + COMPLETION_GRACE);
            tokio::pin!(deadline);
            loop {
                if capture_handles.iter().all(|(_, h)| h.is_finished()) {
                    break;
                }
                if run_failed.load(Ordering::SeqCst) {
                    break;
                }
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_millis(100)) => {}
                    _ = &mut deadline => {
                        warn!("Deadline passed before all cameras finished");
                        outcome = SessionOutcome::DeadlineReached;
                        break;
                    }
                    _ = tokio::signal::ctrl_c() => {
                        info!("Operator interrupt; stopping acquisition");
                        interrupted = true;
                        break;
                    }
                }
            }
        }

        // ------------------------------------------------------------------
        // Ordered teardown.
        // ------------------------------------------------------------------
        stop.store(true, Ordering::SeqCst);
        let (captures, encodings) = self
            .collect_reports(capture_handles, encoder_handles, display_handle)
            .await;

        if interrupted {
            return Err(AcqError::Interrupted);
        }
        if let Some(err) = mcu_error {
            return Err(err);
        }
        if run_failed.load(Ordering::SeqCst) {
            let failed = captures
                .iter()
                .find(|(_, report)| report.is_none())
                .map(|(name, _)| name.clone())
                .unwrap_or_else(|| "unknown".into());
            return Err(AcqError::WorkerFailed(failed));
        }

        let summary = SessionSummary {
            outcome,
            captures: captures
                .into_iter()
                .map(|(name, report)| (name, report.unwrap_or_default()))
                .collect(),
            encodings: encodings
                .into_iter()
                .map(|(name, report)| (name, report.unwrap_or_default()))
                .collect(),
        };
        for (name, report) in &summary.captures {
            info!(
                "[{name}] {} frames acquired, {} timeouts, {} corrupt, {} dropped",
                report.frames_acquired,
                report.timeouts,
                report.corrupt_frames,
                report.dropped_backpressure
            );
        }
        Ok(summary)
    }

    /// Teardown for failed startups: flags are already raised, just reap.
    async fn teardown(
        &self,
        stop: &Arc<AtomicBool>,
        capture_handles: Vec<(String, JoinHandle<AppResult<CaptureReport>>)>,
        encoder_handles: Vec<(String, JoinHandle<AppResult<EncoderReport>>)>,
        display_handle: Option<JoinHandle<AppResult<()>>>,
    ) {
        stop.store(true, Ordering::SeqCst);
        let _ = self
            .collect_reports(capture_handles, encoder_handles, display_handle)
            .await;
    }

    /// Join every worker with a timeout, logging escalations. Capture
    /// workers are joined first so their sentinels release the encoders.
    async fn collect_reports(
        &self,
        capture_handles: Vec<(String, JoinHandle<AppResult<CaptureReport>>)>,
        encoder_handles: Vec<(String, JoinHandle<AppResult<EncoderReport>>)>,
        display_handle: Option<JoinHandle<AppResult<()>>>,
    ) -> (
        Vec<(String, Option<CaptureReport>)>,
        Vec<(String, Option<EncoderReport>)>,
    ) {
        let capture_join = JOIN_TIMEOUT
            + Duration::from_millis(self.config.acquisition.frame_timeout_ms);

        let mut captures = Vec::new();
        for (name, handle) in capture_handles {
            captures.push((name.clone(), join_worker(&name, handle, capture_join).await));
        }
        // Encoders drain whatever is queued; give them longer.
        let mut encodings = Vec::new();
        for (name, handle) in encoder_handles {
            encodings.push((
                name.clone(),
                join_worker(&name, handle, JOIN_TIMEOUT * 4).await,
            ));
        }
        if let Some(handle) = display_handle {
            let _ = join_worker("display", handle, JOIN_TIMEOUT).await;
        }
        (captures, encodings)
    }
}

/// Await a worker with a timeout. A worker that will not stop cannot be
/// killed (it sits on a blocking SDK call), so the escalation is logged and
/// the handle abandoned.
async fn join_worker<T>(
    name: &str,
    handle: JoinHandle<AppResult<T>>,
    timeout: Duration,
) -> Option<T> {
    match tokio::time::timeout(timeout, handle).await {
        Ok(Ok(Ok(report))) => Some(report),
        Ok(Ok(Err(err))) => {
            error!("[{name}] worker returned an error: {err}");
            None
        }
        Ok(Err(join_err)) => {
            error!("[{name}] worker panicked: {join_err}");
            None
        }
        Err(_) => {
            error!("[{name}] worker did not stop within {timeout:?}; abandoning it");
            None
        }
    }
}
