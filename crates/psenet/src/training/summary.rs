//! Metric event log: scalars and image snapshots keyed by global step.
//!
//! ```text
//! <dir>/events.jsonl          one JSON event per line
//! <dir>/images/<tag>_<step>.png
//! ```

use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::Context;
use serde::{Deserialize, Serialize};

pub const EVENTS_FILE: &str = "events.jsonl";
pub const IMAGES_DIR: &str = "images";

/// One line of `events.jsonl`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SummaryEvent {
    Scalar {
        tag: String,
        step: usize,
        value: f64,
        wall_time: f64,
    },
    Image {
        tag: String,
        step: usize,
        /// Relative to the summary directory.
        path: String,
        height: usize,
        width: usize,
        wall_time: f64,
    },
}

impl SummaryEvent {
    pub fn tag(&self) -> &str {
        match self {
            SummaryEvent::Scalar { tag, .. } | SummaryEvent::Image { tag, .. } => tag,
        }
    }

    pub fn step(&self) -> usize {
        match self {
            SummaryEvent::Scalar { step, .. } | SummaryEvent::Image { step, .. } => *step,
        }
    }
}

/// Appends summary events under a directory.
pub struct SummaryWriter {
    dir: PathBuf,
    events: BufWriter<File>,
}

fn wall_time() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

impl SummaryWriter {
    pub fn create(dir: impl AsRef<Path>) -> anyhow::Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(dir.join(IMAGES_DIR))
            .with_context(|| format!("Failed to create summary directory {}", dir.display()))?;
        let path = dir.join(EVENTS_FILE);
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("Failed to open {}", path.display()))?;
        Ok(Self {
            dir,
            events: BufWriter::new(file),
        })
    }

    pub fn add_scalar(&mut self, tag: &str, value: f64, step: usize) -> anyhow::Result<()> {
        self.write(&SummaryEvent::Scalar {
            tag: tag.to_string(),
            step,
            value,
            wall_time: wall_time(),
        })
    }

    /// Store a single-channel map as an 8-bit grayscale PNG.
    ///
    /// Values are clamped to `[0, 1]` before quantisation.
    pub fn add_image(
        &mut self,
        tag: &str,
        values: &[f32],
        height: usize,
        width: usize,
        step: usize,
    ) -> anyhow::Result<PathBuf> {
        anyhow::ensure!(
            values.len() == height * width,
            "image {tag} has {} values, expected {height}x{width}",
            values.len()
        );
        let pixels: Vec<u8> = values
            .iter()
            .map(|v| (v.clamp(0.0, 1.0) * 255.0).round() as u8)
            .collect();
        let img = image::GrayImage::from_raw(width as u32, height as u32, pixels)
            .ok_or_else(|| anyhow::anyhow!("image buffer for {tag} has the wrong size"))?;

        let relative = format!("{IMAGES_DIR}/{tag}_{step}.png");
        let path = self.dir.join(&relative);
        img.save(&path)
            .with_context(|| format!("Failed to write {}", path.display()))?;

        self.write(&SummaryEvent::Image {
            tag: tag.to_string(),
            step,
            path: relative,
            height,
            width,
            wall_time: wall_time(),
        })?;
        Ok(path)
    }

    pub fn flush(&mut self) -> anyhow::Result<()> {
        self.events.flush()?;
        Ok(())
    }

    fn write(&mut self, event: &SummaryEvent) -> anyhow::Result<()> {
        serde_json::to_writer(&mut self.events, event)?;
        self.events.write_all(b"\n")?;
        Ok(())
    }
}

/// Parse every event in `<dir>/events.jsonl`.
pub fn read_events(dir: impl AsRef<Path>) -> anyhow::Result<Vec<SummaryEvent>> {
    let path = dir.as_ref().join(EVENTS_FILE);
    let file = File::open(&path).with_context(|| format!("Failed to open {}", path.display()))?;
    let mut events = Vec::new();
    for (i, line) in BufReader::new(file).lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let event = serde_json::from_str(&line)
            .with_context(|| format!("Bad event at {}:{}", path.display(), i + 1))?;
        events.push(event);
    }
    Ok(events)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scalars_and_images_are_logged() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = SummaryWriter::create(dir.path()).unwrap();
        writer.add_scalar("loss", 0.5, 0).unwrap();
        let png = writer
            .add_image("score_map", &[0.0, 1.0, 0.5, 2.0, -1.0, 1.0], 2, 3, 8)
            .unwrap();
        writer.add_scalar("loss", 0.25, 8).unwrap();
        writer.flush().unwrap();

        let events = read_events(dir.path()).unwrap();
        assert_eq!(events.len(), 3);
        assert_eq!(events[0].tag(), "loss");
        assert!(matches!(events[1], SummaryEvent::Image { step: 8, height: 2, width: 3, .. }));
        assert_eq!(events[2].step(), 8);

        let img = image::open(&png).unwrap().to_luma8();
        assert_eq!(img.dimensions(), (3, 2));
        assert_eq!(img.as_raw(), &vec![0, 255, 128, 255, 0, 255]);
    }

    #[test]
    fn test_image_size_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = SummaryWriter::create(dir.path()).unwrap();
        assert!(writer.add_image("bad", &[0.0; 5], 2, 3, 0).is_err());
    }

    #[test]
    fn test_reopen_appends() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut w = SummaryWriter::create(dir.path()).unwrap();
            w.add_scalar("a", 1.0, 0).unwrap();
            w.flush().unwrap();
        }
        let mut w = SummaryWriter::create(dir.path()).unwrap();
        w.add_scalar("a", 2.0, 1).unwrap();
        w.flush().unwrap();
        assert_eq!(read_events(dir.path()).unwrap().len(), 2);
    }
}
