//! Frame timing from `.trc` marker trajectory files.
//!
//! Only the time column is read. Marker coordinates are left to the solver.

use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TrcError {
    #[error("reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{path}: no Frame#/Time header line")]
    MissingHeader { path: PathBuf },

    #[error("{path}: no frames recorded")]
    NoFrames { path: PathBuf },

    #[error("{path}: line {line}: invalid frame time {value:?}")]
    InvalidTime {
        path: PathBuf,
        line: usize,
        value: String,
    },
}

/// First and last recorded frame times.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct FrameRange {
    pub first: f64,
    pub last: f64,
    pub frames: usize,
}

pub trait MarkerReader {
    fn frame_range(&self, path: &Path) -> anyhow::Result<FrameRange>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct TrcReader;

impl TrcReader {
    pub fn read(&self, path: &Path) -> Result<FrameRange, TrcError> {
        let text = fs::read_to_string(path).map_err(|source| TrcError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        parse_frame_range(path, &text)
    }
}

impl MarkerReader for TrcReader {
    fn frame_range(&self, path: &Path) -> anyhow::Result<FrameRange> {
        Ok(self.read(path)?)
    }
}

fn parse_frame_range(path: &Path, text: &str) -> Result<FrameRange, TrcError> {
    let mut lines = text.lines().enumerate();
    let time_col = loop {
        let Some((_, line)) = lines.next() else {
            return Err(TrcError::MissingHeader {
                path: path.to_path_buf(),
            });
        };
        let labels: Vec<&str> = line.split_whitespace().collect();
        if labels.first() == Some(&"Frame#") {
            break labels.iter().position(|l| *l == "Time").unwrap_or(1);
        }
    };

    let mut first = None;
    let mut last = 0.0;
    let mut frames = 0;
    for (idx, line) in lines {
        let fields: Vec<&str> = line.split_whitespace().collect();
        // Blank lines and the X1/Y1/Z1 label row.
        match fields.first() {
            Some(frame) if frame.parse::<f64>().is_ok() => {}
            _ => continue,
        }
        let raw = fields.get(time_col).copied().unwrap_or("");
        let time: f64 = raw
            .parse()
            .ok()
            .filter(|t: &f64| t.is_finite())
            .ok_or_else(|| TrcError::InvalidTime {
                path: path.to_path_buf(),
                line: idx + 1,
                value: raw.to_string(),
            })?;
        first.get_or_insert(time);
        last = time;
        frames += 1;
    }

    match first {
        Some(first) => Ok(FrameRange {
            first,
            last,
            frames,
        }),
        None => Err(TrcError::NoFrames {
            path: path.to_path_buf(),
        }),
    }
}
