/*!
Frame capture loop.

Pulls frames from a [`Session`] and either writes them to a timestamped
capture directory as `NNNNNNNN.raw` (little-endian 16-bit pixels) plus
`NNNNNNNN.json` (metadata), or prints one JSON metadata line per frame to
stdout.
*/

use crate::config::CaptureConfig;
use anyhow::{Context, Result};
use chrono::Local;
use lepton::{Frame, LeptonError, Metadata, Session, StatsSnapshot};
use serde::Serialize;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// How long a single wait for the next frame may block
const POLL_TIMEOUT: Duration = Duration::from_millis(250);

#[derive(Serialize)]
struct FrameRecord<'a> {
    index: u32,
    min: u16,
    max: u16,
    #[serde(flatten)]
    metadata: &'a Metadata,
}

/// Writes captured frames to disk or stdout
pub struct FrameRecorder {
    output_dir: PathBuf,
    save_files: bool,
    next_frame: u32,
    frames_recorded: u64,
}

impl FrameRecorder {
    /// Create a recorder. When saving, frames land in a new timestamped
    /// subdirectory of `output_dir`.
    pub fn new<P: AsRef<Path>>(output_dir: P, save_files: bool) -> Result<Self> {
        let timestamp = Local::now().format("%Y%m%d_%H%M%S").to_string();

        let output_dir = if save_files {
            output_dir.as_ref().join(&timestamp)
        } else {
            output_dir.as_ref().to_path_buf()
        };

        let next_frame = if save_files {
            std::fs::create_dir_all(&output_dir)
                .with_context(|| format!("Failed to create output directory: {}", output_dir.display()))?;
            info!("📁 Capture session timestamp: {}", timestamp);
            info!("📁 Files will be saved to: {}", output_dir.display());
            find_next_frame_number(&output_dir)
        } else {
            0
        };

        Ok(Self {
            output_dir,
            save_files,
            next_frame,
            frames_recorded: 0,
        })
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    pub fn frames_recorded(&self) -> u64 {
        self.frames_recorded
    }

    /// Record one frame
    pub fn record(&mut self, frame: &Frame) -> Result<()> {
        let index = self.next_frame;
        let record = FrameRecord {
            index,
            min: frame.min(),
            max: frame.max(),
            metadata: frame.metadata(),
        };

        if self.save_files {
            let raw_path = self.output_dir.join(format!("{:08}.raw", index));
            std::fs::write(&raw_path, frame.to_le_bytes())
                .with_context(|| format!("Failed to write {}", raw_path.display()))?;

            let json_path = self.output_dir.join(format!("{:08}.json", index));
            let json = serde_json::to_string_pretty(&record)?;
            std::fs::write(&json_path, json).with_context(|| format!("Failed to write {}", json_path.display()))?;
            debug!("💾 Saved frame {}", index);
        } else {
            let json = serde_json::to_string(&record)?;
            let mut stdout = std::io::stdout().lock();
            writeln!(stdout, "{}", json)?;
            stdout.flush()?;
        }

        self.next_frame += 1;
        self.frames_recorded += 1;
        Ok(())
    }
}

/// Find the next available frame number by checking existing files
pub fn find_next_frame_number(output_dir: &Path) -> u32 {
    let mut next = 0u32;

    if let Ok(entries) = std::fs::read_dir(output_dir) {
        for entry in entries.flatten() {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if !name.ends_with(".raw") || name.len() < 8 {
                continue;
            }
            if let Ok(number) = name[..8].parse::<u32>() {
                next = next.max(number.saturating_add(1));
            }
        }
    }

    next
}

/// Outcome of a capture run
#[derive(Debug)]
pub struct CaptureSummary {
    pub frames: u64,
    pub elapsed: Duration,
    pub stats: StatsSnapshot,
}

/// Record frames until the frame limit is reached or the session stops
pub fn run(mut session: Session, config: &CaptureConfig) -> Result<CaptureSummary> {
    let mut recorder = FrameRecorder::new(&config.output_directory, config.save_files)?;
    let stats_interval = Duration::from_secs(config.stats_interval_seconds.max(1));
    let start = Instant::now();
    let mut last_report = Instant::now();

    info!("🚀 Starting capture");
    loop {
        if config.frame_limit > 0 && recorder.frames_recorded() >= config.frame_limit {
            info!("🏁 Reached frame limit of {}", config.frame_limit);
            break;
        }

        match session.read_frame_timeout(POLL_TIMEOUT) {
            Ok(Some(frame)) => {
                let result = recorder.record(&frame);
                session.recycle(frame);
                result?;
            }
            Ok(None) => {}
            Err(LeptonError::Closed) => {
                info!("🛑 Session stopped");
                break;
            }
            Err(err) => return Err(err.into()),
        }

        if last_report.elapsed() >= stats_interval {
            info!("📊 {} frames recorded | {}", recorder.frames_recorded(), session.stats());
            last_report = Instant::now();
        }
    }

    session.close();
    let summary = CaptureSummary {
        frames: recorder.frames_recorded(),
        elapsed: start.elapsed(),
        stats: session.stats(),
    };

    info!("📈 Capture final stats:");
    info!("   Frames: {}", summary.frames);
    info!("   Duration: {:.1}s", summary.elapsed.as_secs_f64());
    info!("   {}", summary.stats);

    Ok(summary)
}
