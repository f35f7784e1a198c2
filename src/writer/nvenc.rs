//! In-process GPU encoder.
//!
//! Greyscale frames are packed into NV12 (luma as-is, chroma constant at
//! 128) and submitted to an NVENC session; the returned packets are appended
//! to a raw H.264 elementary stream on disk. When a segment closes, the
//! session is flushed and, if requested, an external muxer subprocess wraps
//! the elementary stream in a container with a copy codec — no re-encode —
//! while acquisition of later segments continues.
//!
//! The encoder session itself sits behind [`EncodeSession`]; the CUDA-backed
//! implementation is gated on the `nvenc_hardware` feature, so the writer
//! logic stays testable without a GPU.

use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};

use log::{debug, warn};

use crate::camera::PixelBuffer;
use crate::error::{AcqError, AppResult};

use super::{Encoder, StreamFrame};

/// Pack an 8-bit greyscale image into NV12.
///
/// Luma is the image itself; the interleaved UV plane at half vertical
/// resolution is constant 128, which renders as neutral chroma.
pub fn grey_to_nv12(pixels: &[u8], width: usize, height: usize) -> Vec<u8> {
    let mut nv12 = Vec::new();
    pack_nv12_into(&mut nv12, pixels, width, height);
    nv12
}

fn pack_nv12_into(nv12: &mut Vec<u8>, pixels: &[u8], width: usize, height: usize) {
    debug_assert_eq!(pixels.len(), width * height);
    nv12.clear();
    nv12.reserve(width * height + width * (height / 2));
    nv12.extend_from_slice(pixels);
    nv12.resize(width * height + width * (height / 2), 128);
}

/// One open NVENC session, encoding NV12 input asynchronously.
pub trait EncodeSession: Send {
    /// Submit one frame; returns any packets that completed.
    fn encode(&mut self, nv12: &[u8]) -> AppResult<Vec<Vec<u8>>>;

    /// Drain packets still in flight. The session is done afterwards.
    fn flush(&mut self) -> AppResult<Vec<Vec<u8>>>;
}

/// Creates sessions; one per segment.
pub trait EncodeBackend: Send {
    fn open_session(
        &mut self,
        width: u32,
        height: u32,
        cfg: &NvencConfig,
    ) -> AppResult<Box<dyn EncodeSession>>;
}

/// Settings for the GPU encoder.
#[derive(Clone, Debug)]
pub struct NvencConfig {
    pub fps: u32,
    pub gpu: u32,
    /// P1 fastest .. P7 slowest.
    pub preset: String,
    pub auto_remux: bool,
}

impl NvencConfig {
    pub fn from_writer(writer: &crate::config::WriterConfig, fps: u32) -> Self {
        Self {
            fps,
            gpu: writer.gpu.unwrap_or(0),
            preset: writer.preset.clone().unwrap_or_else(|| "P1".into()),
            auto_remux: writer.auto_remux,
        }
    }
}

/// An external muxer subprocess running concurrently with acquisition.
struct MuxJob {
    video: PathBuf,
    muxed: PathBuf,
    child: std::io::Result<Child>,
}

impl MuxJob {
    fn spawn(video: &Path) -> Self {
        let muxed = PathBuf::from(format!("{}.muxed.mp4", video.display()));
        // Copy codec: wrap the elementary stream without re-encoding.
        let child = Command::new("ffmpeg")
            .args(["-y", "-loglevel", "error", "-i"])
            .arg(video)
            .args(["-c:v", "copy", "-f", "mp4"])
            .arg(&muxed)
            .stdin(Stdio::null())
            .spawn();
        debug!("Muxing {} -> {}", video.display(), muxed.display());
        Self {
            video: video.to_path_buf(),
            muxed,
            child,
        }
    }

    /// Wait for the muxer; on success the container replaces the raw stream,
    /// on failure the unmuxed segment is left in place.
    fn join(self) {
        let outcome = match self.child {
            Ok(mut child) => match child.wait() {
                Ok(status) if status.success() => {
                    std::fs::remove_file(&self.video)
                        .and_then(|()| std::fs::rename(&self.muxed, &self.video))
                        .map_err(|e| format!("could not swap in muxed file: {e}"))
                }
                Ok(status) => Err(format!("muxer exited with {status}")),
                Err(e) => Err(format!("muxer did not finish: {e}")),
            },
            Err(e) => Err(format!("muxer failed to start: {e}")),
        };
        if let Err(reason) = outcome {
            warn!(
                "Failed to mux {}; leaving the raw stream in place ({reason})",
                self.video.display()
            );
            let _ = std::fs::remove_file(&self.muxed);
        }
    }
}

pub struct NvencEncoder {
    cfg: NvencConfig,
    backend: Box<dyn EncodeBackend>,
    session: Option<Box<dyn EncodeSession>>,
    file: Option<File>,
    current_path: Option<PathBuf>,
    muxers: Vec<MuxJob>,
    nv12_scratch: Vec<u8>,
    pub frames_flushed: u64,
}

impl NvencEncoder {
    pub fn new(cfg: NvencConfig, backend: Box<dyn EncodeBackend>) -> Self {
        Self {
            cfg,
            backend,
            session: None,
            file: None,
            current_path: None,
            muxers: Vec::new(),
            nv12_scratch: Vec::new(),
            frames_flushed: 0,
        }
    }

    fn write_packets(file: &mut File, packets: Vec<Vec<u8>>) -> AppResult<u64> {
        let mut written = 0;
        for packet in packets {
            file.write_all(&packet)?;
            written += 1;
        }
        Ok(written)
    }
}

impl Encoder for NvencEncoder {
    fn open_segment(&mut self, video_path: &Path, width: u32, height: u32) -> AppResult<()> {
        self.session = Some(self.backend.open_session(width, height, &self.cfg)?);
        self.file = Some(File::create(video_path)?);
        self.current_path = Some(video_path.to_path_buf());
        Ok(())
    }

    fn append(&mut self, frame: &StreamFrame) -> AppResult<()> {
        let PixelBuffer::U8(pixels) = &frame.pixels else {
            return Err(AcqError::Encoder(
                "the NVENC writer only supports gray8 input".into(),
            ));
        };
        let (session, file) = match (self.session.as_mut(), self.file.as_mut()) {
            (Some(session), Some(file)) => (session, file),
            _ => {
                return Err(AcqError::Encoder(
                    "append called with no open segment".into(),
                ))
            }
        };
        pack_nv12_into(
            &mut self.nv12_scratch,
            pixels,
            frame.width as usize,
            frame.height as usize,
        );
        let packets = session.encode(&self.nv12_scratch)?;
        Self::write_packets(file, packets)?;
        Ok(())
    }

    fn close_segment(&mut self) -> AppResult<()> {
        if let (Some(mut session), Some(mut file)) = (self.session.take(), self.file.take()) {
            // The encoder is asynchronous; drain what is still in flight.
            let packets = session.flush()?;
            self.frames_flushed += Self::write_packets(&mut file, packets)?;
            file.flush()?;
        }
        if let Some(path) = self.current_path.take() {
            if self.cfg.auto_remux {
                self.muxers.push(MuxJob::spawn(&path));
            }
        }
        Ok(())
    }

    fn finish(&mut self) -> AppResult<()> {
        self.close_segment()?;
        for job in self.muxers.drain(..) {
            job.join();
        }
        Ok(())
    }

    fn file_extension(&self) -> &'static str {
        "mp4"
    }
}

/// The CUDA-backed session factory, or the missing-feature error without it.
#[cfg(not(feature = "nvenc_hardware"))]
pub fn default_backend(_gpu: u32) -> AppResult<Box<dyn EncodeBackend>> {
    Err(AcqError::FeatureNotEnabled("nvenc_hardware"))
}

#[cfg(feature = "nvenc_hardware")]
pub fn default_backend(gpu: u32) -> AppResult<Box<dyn EncodeBackend>> {
    Ok(Box::new(cuda::CudaBackend::new(gpu)?))
}

#[cfg(feature = "nvenc_hardware")]
mod cuda {
    use std::sync::Arc;

    use cudarc::driver::CudaDevice;
    use nvidia_video_codec_sdk::{
        sys::nvEncodeAPI::{
            NV_ENC_BUFFER_FORMAT, NV_ENC_CODEC_H264_GUID, NV_ENC_PRESET_P1_GUID,
            NV_ENC_PRESET_P4_GUID, NV_ENC_PRESET_P7_GUID, NV_ENC_TUNING_INFO,
        },
        Encoder as GpuEncoder, Session,
    };

    use crate::error::{AcqError, AppResult};

    use super::{EncodeBackend, EncodeSession, NvencConfig};

    fn gpu_error(context: &str, err: impl std::fmt::Debug) -> AcqError {
        AcqError::Encoder(format!("{context}: {err:?}"))
    }

    pub struct CudaBackend {
        device: Arc<CudaDevice>,
    }

    impl CudaBackend {
        pub fn new(gpu: u32) -> AppResult<Self> {
            let device = CudaDevice::new(gpu as usize)
                .map_err(|e| gpu_error("failed to open CUDA device", e))?;
            Ok(Self { device })
        }
    }

    impl EncodeBackend for CudaBackend {
        fn open_session(
            &mut self,
            width: u32,
            height: u32,
            cfg: &NvencConfig,
        ) -> AppResult<Box<dyn EncodeSession>> {
            let encoder = GpuEncoder::initialize_with_cuda(self.device.clone())
                .map_err(|e| gpu_error("failed to initialize NVENC", e))?;

            let preset = match cfg.preset.to_ascii_uppercase().as_str() {
                "P7" => NV_ENC_PRESET_P7_GUID,
                "P4" => NV_ENC_PRESET_P4_GUID,
                _ => NV_ENC_PRESET_P1_GUID,
            };
            let mut init_params = nvidia_video_codec_sdk::sys::nvEncodeAPI::NV_ENC_INITIALIZE_PARAMS::new(
                NV_ENC_CODEC_H264_GUID,
                width,
                height,
            );
            init_params
                .framerate(cfg.fps, 1)
                .enable_picture_type_decision();
            let session = encoder
                .start_session(
                    NV_ENC_BUFFER_FORMAT::NV_ENC_BUFFER_FORMAT_NV12,
                    init_params
                        .preset_guid(preset)
                        .tuning_info(NV_ENC_TUNING_INFO::NV_ENC_TUNING_INFO_ULTRA_LOW_LATENCY),
                )
                .map_err(|e| gpu_error("failed to start NVENC session", e))?;
            Ok(Box::new(CudaSession { session }))
        }
    }

    struct CudaSession {
        session: Session,
    }

    impl EncodeSession for CudaSession {
        fn encode(&mut self, nv12: &[u8]) -> AppResult<Vec<Vec<u8>>> {
            let mut input = self
                .session
                .create_input_buffer()
                .map_err(|e| gpu_error("input buffer", e))?;
            input
                .lock()
                .map_err(|e| gpu_error("input lock", e))?
                .write(nv12);
            let mut output = self
                .session
                .create_output_bitstream()
                .map_err(|e| gpu_error("output bitstream", e))?;
            self.session
                .encode_picture(&mut input, &mut output, Default::default())
                .map_err(|e| gpu_error("encode_picture", e))?;
            let lock = output.lock().map_err(|e| gpu_error("output lock", e))?;
            Ok(vec![lock.data().to_vec()])
        }

        fn flush(&mut self) -> AppResult<Vec<Vec<u8>>> {
            // The session drains in-flight pictures when it ends; packets
            // were already surfaced per-picture above.
            Ok(Vec::new())
        }
    }
}
