//! Output file layout.
//!
//! For each camera stream, each video segment and its metadata sidecar are
//! named `<prefix>.<start_ts>.<stream>.<serial>.<first_frame>.<ext>` and
//! `...<first_frame>.metadata.csv`, so segments sort and concatenate by
//! filename alone. Per-run files (`<prefix>.triggerdata.csv`,
//! `<prefix>.config.yaml`, `<prefix>.log`) carry no timestamp.

use std::path::{Path, PathBuf};

use chrono::Local;
use log::info;

use crate::error::{AcqError, AppResult};

/// Timestamp embedded in segment filenames and datetime subdirectories.
const START_TS_FORMAT: &str = "%y-%m-%d-%H-%M-%S";

/// Format the run start timestamp for filenames.
pub fn run_start_timestamp() -> String {
    Local::now().format(START_TS_FORMAT).to_string()
}

/// Create the directory a recording will be saved into.
///
/// With `append_datetime` the recording is nested in a subdirectory named
/// after the start time, so repeated runs never collide. Without it, an
/// existing directory is refused unless `overwrite` is set.
pub fn prepare_rec_dir(
    save_location: &Path,
    append_datetime: bool,
    overwrite: bool,
) -> AppResult<PathBuf> {
    let dir = if append_datetime {
        save_location.join(run_start_timestamp())
    } else {
        save_location.to_path_buf()
    };

    if dir.exists() && !append_datetime && !overwrite {
        return Err(AcqError::Configuration(format!(
            "save location {} already exists; pass --overwrite to reuse it",
            dir.display()
        )));
    }

    std::fs::create_dir_all(&dir)?;
    info!("Created save location {}", dir.display());
    Ok(dir)
}

/// Generates segment file names for one camera stream.
///
/// The stem is everything up to the first-frame index, so a rollover only has
/// to append a new index to start the next segment.
#[derive(Debug, Clone)]
pub struct SegmentNamer {
    dir: PathBuf,
    stem: String,
    extension: &'static str,
}

impl SegmentNamer {
    pub fn new(
        dir: &Path,
        prefix: &str,
        start_ts: &str,
        stream_name: &str,
        serial: &str,
        extension: &'static str,
    ) -> Self {
        Self {
            dir: dir.to_path_buf(),
            stem: format!("{prefix}.{start_ts}.{stream_name}.{serial}"),
            extension,
        }
    }

    /// Path of the video segment starting at absolute frame `first_frame`.
    pub fn video_path(&self, first_frame: u64) -> PathBuf {
        self.dir
            .join(format!("{}.{}.{}", self.stem, first_frame, self.extension))
    }

    /// Path of the metadata sidecar for the segment starting at `first_frame`.
    pub fn metadata_path(&self, first_frame: u64) -> PathBuf {
        self.dir
            .join(format!("{}.{}.metadata.csv", self.stem, first_frame))
    }
}
