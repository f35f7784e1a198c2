//! Encoder subprocess fed over stdin.
//!
//! Each segment spawns one `ffmpeg` process reading raw frames from a pipe:
//! H.264 for 8-bit streams (NVENC when a GPU id is configured, libx264
//! otherwise) and lossless FFV1 for 16-bit depth streams. The subprocess's
//! stdout and stderr are teed to log files next to the video for
//! post-mortem. A broken pipe nulls the pipe and keeps the worker alive —
//! frames are counted, the run is not crashed from inside the writer.

use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, Command, Stdio};

use log::{debug, error, warn};

use crate::error::{AcqError, AppResult};

use super::{Encoder, PixelFormat, StreamFrame};

/// Resolved settings for one stream's encoder subprocess.
#[derive(Clone, Debug)]
pub struct FfmpegEncoderConfig {
    pub executable: String,
    pub fps: u32,
    pub pixel_format: PixelFormat,
    /// qp/crf, 0-51, lower is better.
    pub quality: u32,
    /// GPU id for h264_nvenc; `None` selects libx264 on the CPU.
    pub gpu: Option<u32>,
    pub preset: Option<String>,
    pub loglevel: String,
}

impl FfmpegEncoderConfig {
    pub fn from_writer(
        writer: &crate::config::WriterConfig,
        pixel_format: PixelFormat,
        fps: u32,
    ) -> Self {
        Self {
            executable: "ffmpeg".into(),
            fps,
            pixel_format: writer.pixel_format.unwrap_or(pixel_format),
            quality: writer.quality,
            gpu: writer.gpu,
            preset: writer.preset.clone(),
            loglevel: writer.loglevel.clone(),
        }
    }

    fn is_depth(&self) -> bool {
        self.pixel_format == PixelFormat::Gray16
    }

    /// File extension of the container this configuration produces.
    pub fn extension(&self) -> &'static str {
        if self.is_depth() {
            "avi"
        } else {
            "mp4"
        }
    }
}

/// Assemble the subprocess command line for one segment.
pub fn pipe_command(
    cfg: &FfmpegEncoderConfig,
    path: &Path,
    width: u32,
    height: u32,
) -> Vec<String> {
    let frame_size = format!("{width}x{height}");
    let mut command: Vec<String> = vec![
        cfg.executable.clone(),
        "-loglevel".into(),
        cfg.loglevel.clone(),
        "-y".into(),
        "-f".into(),
        "rawvideo".into(),
        "-pix_fmt".into(),
        cfg.pixel_format.ffmpeg_name().into(),
        "-s".into(),
        frame_size,
        "-r".into(),
        cfg.fps.to_string(),
        "-i".into(),
        "-".into(),
        "-an".into(),
    ];

    if cfg.is_depth() {
        // Lossless 16-bit depth.
        command.extend(["-vcodec".into(), "ffv1".into()]);
    } else if let Some(gpu) = cfg.gpu {
        command.extend([
            "-c:v".into(),
            "h264_nvenc".into(),
            "-preset".into(),
            cfg.preset.clone().unwrap_or_else(|| "p1".into()),
            "-qp".into(),
            cfg.quality.to_string(),
            "-gpu".into(),
            gpu.to_string(),
            "-vsync".into(),
            "0".into(),
            "-2pass".into(),
            "0".into(),
        ]);
    } else {
        command.extend([
            "-c:v".into(),
            "libx264".into(),
            "-preset".into(),
            cfg.preset.clone().unwrap_or_else(|| "ultrafast".into()),
            "-crf".into(),
            cfg.quality.to_string(),
            "-threads".into(),
            "4".into(),
        ]);
    }

    if !cfg.is_depth() {
        // Output pixel format readable by most players.
        command.extend(["-pix_fmt".into(), "yuv420p".into()]);
    }

    command.push(path.to_string_lossy().into_owned());
    command
}

pub struct FfmpegEncoder {
    cfg: FfmpegEncoderConfig,
    child: Option<Child>,
    stdin: Option<ChildStdin>,
    current_path: Option<PathBuf>,
    frames_piped: u64,
    frames_lost_to_pipe: u64,
}

impl FfmpegEncoder {
    pub fn new(cfg: FfmpegEncoderConfig) -> Self {
        Self {
            cfg,
            child: None,
            stdin: None,
            current_path: None,
            frames_piped: 0,
            frames_lost_to_pipe: 0,
        }
    }
}

impl Encoder for FfmpegEncoder {
    fn open_segment(&mut self, video_path: &Path, width: u32, height: u32) -> AppResult<()> {
        let command = pipe_command(&self.cfg, video_path, width, height);
        debug!("Spawning encoder: {}", command.join(" "));

        let stdout_log = File::create(sidecar_log(video_path, "stdout"))?;
        let stderr_log = File::create(sidecar_log(video_path, "stderr"))?;
        let mut child = Command::new(&command[0])
            .args(&command[1..])
            .stdin(Stdio::piped())
            .stdout(Stdio::from(stdout_log))
            .stderr(Stdio::from(stderr_log))
            .spawn()
            .map_err(|e| {
                AcqError::Encoder(format!(
                    "failed to spawn '{}' (is it installed?): {e}",
                    self.cfg.executable
                ))
            })?;
        self.stdin = child.stdin.take();
        self.child = Some(child);
        self.current_path = Some(video_path.to_path_buf());
        Ok(())
    }

    fn append(&mut self, frame: &StreamFrame) -> AppResult<()> {
        let Some(stdin) = self.stdin.as_mut() else {
            // Pipe was nulled after a break; count the loss and move on.
            self.frames_lost_to_pipe += 1;
            return Ok(());
        };
        match stdin.write_all(&frame.pixels.as_bytes()) {
            Ok(()) => {
                self.frames_piped += 1;
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::BrokenPipe => {
                error!(
                    "Encoder pipe for {} broke at frame {}; continuing without it",
                    self.current_path
                        .as_deref()
                        .map(Path::display)
                        .map(|d| d.to_string())
                        .unwrap_or_default(),
                    frame.sequence
                );
                self.stdin = None;
                self.frames_lost_to_pipe += 1;
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    fn close_segment(&mut self) -> AppResult<()> {
        // Closing stdin lets the subprocess flush and finalize the file.
        self.stdin = None;
        if let Some(mut child) = self.child.take() {
            let status = child.wait()?;
            if !status.success() {
                warn!(
                    "Encoder for {} exited with {status}",
                    self.current_path
                        .as_deref()
                        .map(Path::display)
                        .map(|d| d.to_string())
                        .unwrap_or_default()
                );
            }
        }
        self.current_path = None;
        Ok(())
    }

    fn finish(&mut self) -> AppResult<()> {
        self.close_segment()?;
        debug!("Piped {} frame(s) to the encoder in total", self.frames_piped);
        if self.frames_lost_to_pipe > 0 {
            warn!(
                "{} frame(s) were lost to a broken encoder pipe",
                self.frames_lost_to_pipe
            );
        }
        Ok(())
    }

    fn file_extension(&self) -> &'static str {
        self.cfg.extension()
    }
}

fn sidecar_log(video_path: &Path, channel: &str) -> PathBuf {
    PathBuf::from(format!("{}.{channel}.log", video_path.display()))
}
