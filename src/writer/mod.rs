//! Encoder workers.
//!
//! One [`EncoderWorker`] per camera stream consumes tagged frames from its
//! bounded queue, appends a metadata row, and hands the pixels to a
//! [`Encoder`]. After `max_video_frames` frames the current segment (video
//! file, metadata sidecar, encoder pipe) is closed and a new pair is opened
//! with the absolute first-frame index embedded in the filename, so segments
//! concatenate by filename sort.
//!
//! Invariants kept here: the metadata row is written before the frame is
//! handed to the encoder; row count equals frames handed over per segment;
//! the terminal sentinel produces no metadata and no encoder I/O. Files are
//! created lazily on the first frame, so a run that never produces a frame
//! leaves no files behind.

pub mod ffmpeg;
pub mod nvenc;

use std::fs::File;
use std::path::Path;

use crossbeam_channel::Receiver;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use crate::camera::PixelBuffer;
use crate::error::{AcqError, AppResult};
use crate::paths::SegmentNamer;

/// Pixel format of a stream as piped to its encoder.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PixelFormat {
    Gray8,
    Gray16,
}

impl PixelFormat {
    /// Name understood by the encoder subprocess for raw input.
    pub fn ffmpeg_name(self) -> &'static str {
        match self {
            PixelFormat::Gray8 => "gray",
            PixelFormat::Gray16 => "gray16le",
        }
    }
}

/// A frame as it travels from a capture worker to an encoder worker.
#[derive(Clone, Debug)]
pub struct StreamFrame {
    /// Per-camera sequence assigned by the capture worker.
    pub sequence: u64,
    /// Device timestamp in the unit the driver reports; never normalized.
    pub device_timestamp: u64,
    /// Host wall clock at enqueue, fractional seconds since the epoch.
    pub host_uid: f64,
    pub width: u32,
    pub height: u32,
    pub pixels: PixelBuffer,
}

/// Queue message; `End` is the terminal sentinel.
#[derive(Clone, Debug)]
pub enum FrameMessage {
    Frame(StreamFrame),
    End,
}

/// A video encoder managing one segment at a time.
pub trait Encoder: Send {
    /// Open the encoder sink for a new segment. Called lazily on the first
    /// frame of each segment, when the frame shape is known.
    fn open_segment(&mut self, video_path: &Path, width: u32, height: u32) -> AppResult<()>;

    /// Encode one frame into the current segment.
    fn append(&mut self, frame: &StreamFrame) -> AppResult<()>;

    /// Flush and close the current segment.
    fn close_segment(&mut self) -> AppResult<()>;

    /// Final cleanup after the last segment (waits for muxers etc.).
    fn finish(&mut self) -> AppResult<()>;

    fn file_extension(&self) -> &'static str;
}

/// Writes the per-segment metadata CSV.
pub struct MetadataWriter {
    writer: csv::Writer<File>,
    rows: u64,
}

impl MetadataWriter {
    pub fn create(path: &Path) -> AppResult<Self> {
        let file = File::create(path)?;
        let mut writer = csv::Writer::from_writer(file);
        writer.write_record(["frame_id", "frame_timestamp", "frame_image_uid", "queue_size"])?;
        Ok(Self { writer, rows: 0 })
    }

    /// Append one row. `queue_size` is `None` on sources that cannot report
    /// their depth; the sentinel `nan` is written in that case.
    pub fn write_row(
        &mut self,
        frame_id: u64,
        frame_timestamp: u64,
        frame_image_uid: f64,
        queue_size: Option<usize>,
    ) -> AppResult<()> {
        let qsize = match queue_size {
            Some(n) => n.to_string(),
            None => "nan".to_string(),
        };
        self.writer.write_record([
            frame_id.to_string(),
            frame_timestamp.to_string(),
            format!("{frame_image_uid:.5}"),
            qsize,
        ])?;
        self.rows += 1;
        Ok(())
    }

    pub fn rows(&self) -> u64 {
        self.rows
    }

    pub fn finish(mut self) -> AppResult<()> {
        self.writer.flush()?;
        Ok(())
    }
}

/// What an encoder worker did, for the end-of-run summary.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct EncoderReport {
    pub frames_written: u64,
    pub segments: u64,
}

/// One per camera stream; runs on a dedicated thread.
pub struct EncoderWorker {
    stream_name: String,
    rx: Receiver<FrameMessage>,
    encoder: Box<dyn Encoder>,
    namer: SegmentNamer,
    max_video_frames: u64,
}

impl EncoderWorker {
    pub fn new(
        stream_name: String,
        rx: Receiver<FrameMessage>,
        encoder: Box<dyn Encoder>,
        namer: SegmentNamer,
        max_video_frames: u64,
    ) -> Self {
        Self {
            stream_name,
            rx,
            encoder,
            namer,
            max_video_frames: max_video_frames.max(1),
        }
    }

    /// Drain the queue until the sentinel arrives or every sender is gone.
    pub fn run(mut self) -> AppResult<EncoderReport> {
        let mut report = EncoderReport::default();
        let mut segment_start: u64 = 0;
        let mut frames_in_segment: u64 = 0;
        let mut metadata: Option<MetadataWriter> = None;
        let mut segment_open = false;

        loop {
            let message = match self.rx.recv() {
                Ok(message) => message,
                // All senders dropped: treat like a sentinel so a crashed
                // capture worker cannot wedge the encoder.
                Err(_) => break,
            };
            let frame = match message {
                FrameMessage::Frame(frame) => frame,
                FrameMessage::End => {
                    debug!("[{}] got stop sentinel", self.stream_name);
                    break;
                }
            };

            let queue_size = Some(self.rx.len());
            if metadata.is_none() {
                metadata = Some(MetadataWriter::create(
                    &self.namer.metadata_path(segment_start),
                )?);
            }
            if let Some(md) = metadata.as_mut() {
                md.write_row(
                    frame.sequence,
                    frame.device_timestamp,
                    frame.host_uid,
                    queue_size,
                )?;
            }

            if !segment_open {
                let path = self.namer.video_path(segment_start);
                self.encoder
                    .open_segment(&path, frame.width, frame.height)?;
                segment_open = true;
                report.segments += 1;
                info!("[{}] opened segment {}", self.stream_name, path.display());
            }
            self.encoder.append(&frame)?;
            frames_in_segment += 1;
            report.frames_written += 1;

            if frames_in_segment >= self.max_video_frames {
                debug!(
                    "[{}] reached {} frames, rolling over",
                    self.stream_name, self.max_video_frames
                );
                self.encoder.close_segment()?;
                if let Some(md) = metadata.take() {
                    md.finish()?;
                }
                segment_open = false;
                segment_start += frames_in_segment;
                frames_in_segment = 0;
            }
        }

        if segment_open {
            self.encoder.close_segment()?;
        }
        if let Some(md) = metadata.take() {
            md.finish()?;
        }
        if let Err(err) = self.encoder.finish() {
            warn!("[{}] encoder finish: {err}", self.stream_name);
        }
        debug!(
            "[{}] writer finished: {} frames in {} segment(s)",
            self.stream_name, report.frames_written, report.segments
        );
        Ok(report)
    }
}

/// Build the encoder for one stream from its writer config.
pub fn build_encoder(
    writer: &crate::config::WriterConfig,
    pixel_format: PixelFormat,
    stream_fps: u32,
) -> AppResult<Box<dyn Encoder>> {
    match writer.kind {
        crate::config::WriterKind::Ffmpeg => Ok(Box::new(ffmpeg::FfmpegEncoder::new(
            ffmpeg::FfmpegEncoderConfig::from_writer(writer, pixel_format, stream_fps),
        ))),
        crate::config::WriterKind::Nvenc => {
            if pixel_format != PixelFormat::Gray8 {
                return Err(AcqError::Encoder(
                    "the NVENC writer only supports gray8 input".into(),
                ));
            }
            let gpu = writer.gpu.unwrap_or(0);
            let backend = nvenc::default_backend(gpu)?;
            Ok(Box::new(nvenc::NvencEncoder::new(
                nvenc::NvencConfig::from_writer(writer, stream_fps),
                backend,
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::bounded;
    use std::path::PathBuf;
    use std::sync::{Arc, Mutex};

    /// Encoder that records calls instead of encoding.
    #[derive(Clone, Default)]
    struct RecordingEncoder {
        opened: Arc<Mutex<Vec<PathBuf>>>,
        appended: Arc<Mutex<Vec<u64>>>,
        closed: Arc<Mutex<u64>>,
    }

    impl Encoder for RecordingEncoder {
        fn open_segment(&mut self, path: &Path, _w: u32, _h: u32) -> AppResult<()> {
            self.opened.lock().unwrap().push(path.to_path_buf());
            Ok(())
        }
        fn append(&mut self, frame: &StreamFrame) -> AppResult<()> {
            self.appended.lock().unwrap().push(frame.sequence);
            Ok(())
        }
        fn close_segment(&mut self) -> AppResult<()> {
            *self.closed.lock().unwrap() += 1;
            Ok(())
        }
        fn finish(&mut self) -> AppResult<()> {
            Ok(())
        }
        fn file_extension(&self) -> &'static str {
            "mp4"
        }
    }

    fn frame(sequence: u64) -> FrameMessage {
        FrameMessage::Frame(StreamFrame {
            sequence,
            device_timestamp: sequence * 1_000,
            host_uid: 1_700_000_000.0 + sequence as f64,
            width: 4,
            height: 2,
            pixels: PixelBuffer::U8(vec![0; 8]),
        })
    }

    fn run_worker(n_frames: u64, max_video_frames: u64) -> (EncoderReport, RecordingEncoder, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let namer = SegmentNamer::new(dir.path(), "t", "ts", "cam", "emu-0", "mp4");
        let (tx, rx) = bounded(1024);
        for i in 0..n_frames {
            tx.send(frame(i)).unwrap();
        }
        tx.send(FrameMessage::End).unwrap();
        let encoder = RecordingEncoder::default();
        let worker = EncoderWorker::new(
            "cam".into(),
            rx,
            Box::new(encoder.clone()),
            namer,
            max_video_frames,
        );
        let report = worker.run().unwrap();
        (report, encoder, dir.keep())
    }

    #[test]
    fn test_exactly_max_frames_is_one_segment() {
        let (report, encoder, dir) = run_worker(100, 100);
        assert_eq!(report.segments, 1);
        assert_eq!(report.frames_written, 100);
        assert_eq!(*encoder.closed.lock().unwrap(), 1);
        std::fs::remove_dir_all(dir).unwrap();
    }

    #[test]
    fn test_one_past_max_frames_is_two_segments() {
        let (report, encoder, dir) = run_worker(101, 100);
        assert_eq!(report.segments, 2);
        assert_eq!(*encoder.closed.lock().unwrap(), 2);
        let opened = encoder.opened.lock().unwrap();
        assert!(opened[0].to_string_lossy().ends_with(".0.mp4"));
        assert!(opened[1].to_string_lossy().ends_with(".100.mp4"));
        std::fs::remove_dir_all(dir).unwrap();
    }

    #[test]
    fn test_rollover_segments_and_filenames() {
        // 250 frames at 100 per segment: 100 + 100 + 50.
        let (report, encoder, dir) = run_worker(250, 100);
        assert_eq!(report.segments, 3);
        assert_eq!(report.frames_written, 250);
        let opened = encoder.opened.lock().unwrap();
        let names: Vec<String> = opened
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(
            names,
            vec![
                "t.ts.cam.emu-0.0.mp4",
                "t.ts.cam.emu-0.100.mp4",
                "t.ts.cam.emu-0.200.mp4"
            ]
        );
        // Metadata sidecars exist for each segment with matching row counts.
        for (start, rows) in [(0u64, 101u64), (100, 101), (200, 51)] {
            let path = dir.join(format!("t.ts.cam.emu-0.{start}.metadata.csv"));
            let contents = std::fs::read_to_string(&path).unwrap();
            assert_eq!(contents.lines().count() as u64, rows, "{path:?}");
        }
        std::fs::remove_dir_all(dir).unwrap();
    }

    #[test]
    fn test_metadata_rows_match_frames_written() {
        let (report, _encoder, dir) = run_worker(60, 1_000_000);
        assert_eq!(report.frames_written, 60);
        let path = dir.join("t.ts.cam.emu-0.0.metadata.csv");
        let contents = std::fs::read_to_string(path).unwrap();
        let mut lines = contents.lines();
        assert_eq!(
            lines.next().unwrap(),
            "frame_id,frame_timestamp,frame_image_uid,queue_size"
        );
        assert_eq!(lines.count(), 60);
        std::fs::remove_dir_all(dir).unwrap();
    }

    #[test]
    fn test_sentinel_without_frames_leaves_no_files() {
        let dir = tempfile::tempdir().unwrap();
        let namer = SegmentNamer::new(dir.path(), "t", "ts", "cam", "emu-0", "mp4");
        let (tx, rx) = bounded(4);
        tx.send(FrameMessage::End).unwrap();
        let worker = EncoderWorker::new(
            "cam".into(),
            rx,
            Box::new(RecordingEncoder::default()),
            namer,
            100,
        );
        let report = worker.run().unwrap();
        assert_eq!(report.frames_written, 0);
        assert_eq!(report.segments, 0);
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_dropped_sender_acts_as_sentinel() {
        let dir = tempfile::tempdir().unwrap();
        let namer = SegmentNamer::new(dir.path(), "t", "ts", "cam", "emu-0", "mp4");
        let (tx, rx) = bounded(4);
        tx.send(frame(0)).unwrap();
        drop(tx);
        let worker = EncoderWorker::new(
            "cam".into(),
            rx,
            Box::new(RecordingEncoder::default()),
            namer,
            100,
        );
        let report = worker.run().unwrap();
        assert_eq!(report.frames_written, 1);
    }

    #[test]
    fn test_metadata_queue_size_sentinel() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("m.csv");
        let mut md = MetadataWriter::create(&path).unwrap();
        md.write_row(0, 123, 1_700_000_000.12345, Some(3)).unwrap();
        md.write_row(1, 456, 1_700_000_000.45678, None).unwrap();
        assert_eq!(md.rows(), 2);
        md.finish().unwrap();
        let contents = std::fs::read_to_string(&path).unwrap();
        let rows: Vec<&str> = contents.lines().collect();
        assert_eq!(rows[1], "0,123,1700000000.12345,3");
        assert_eq!(rows[2], "1,456,1700000000.45678,nan");
    }
}
