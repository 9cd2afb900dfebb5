//! File difficulty scoring.

use std::io::Cursor;

use serde::{Deserialize, Serialize};

use super::catalog::BYTES_PER_MB;

const SMALL_FILE_BYTES: u64 = 500 * 1024;
const LARGE_FILE_BYTES: u64 = 3 * BYTES_PER_MB;
const HIGH_PIXEL_COUNT: u64 = 4_000_000;
const LOW_PIXEL_COUNT: u64 = 1_000_000;
const BASE_DIFFICULTY: i32 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Complexity {
    Low,
    Medium,
    High,
}

/// Pixel dimensions of an image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dimensions {
    pub width: u32,
    pub height: u32,
}

impl Dimensions {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    pub fn pixel_count(&self) -> u64 {
        u64::from(self.width) * u64::from(self.height)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileAnalysis {
    pub complexity: Complexity,
    /// 1 (trivial) to 10 (hardest).
    pub difficulty: u8,
}

/// Scores how hard a file will be to process.
///
/// Each rule adjusts independently; the result is clamped to 1..=10.
/// Unknown dimensions apply no pixel adjustment.
pub fn analyze(size_bytes: u64, mime_type: &str, dimensions: Option<Dimensions>) -> FileAnalysis {
    let mut complexity = Complexity::Medium;
    let mut difficulty = BASE_DIFFICULTY;

    if size_bytes < SMALL_FILE_BYTES {
        complexity = Complexity::Low;
        difficulty -= 2;
    }
    if size_bytes > LARGE_FILE_BYTES {
        complexity = Complexity::High;
        difficulty += 2;
    }

    if let Some(dims) = dimensions {
        let pixels = dims.pixel_count();
        if pixels > HIGH_PIXEL_COUNT {
            complexity = Complexity::High;
            difficulty += 1;
        }
        if pixels < LOW_PIXEL_COUNT {
            difficulty -= 1;
        }
    }

    if is_paginated(mime_type) {
        difficulty += 1;
    }

    FileAnalysis {
        complexity,
        difficulty: difficulty.clamp(1, 10) as u8,
    }
}

/// Whether the MIME type is a multi-page document format.
pub fn is_paginated(mime_type: &str) -> bool {
    let essence = mime_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase();
    matches!(essence.as_str(), "application/pdf" | "application/x-pdf")
}

/// Reads pixel dimensions from encoded image bytes without decoding pixels.
/// Returns `None` for non-image data or unsupported formats.
pub fn probe_dimensions(data: &[u8]) -> Option<Dimensions> {
    let reader = image::ImageReader::new(Cursor::new(data))
        .with_guessed_format()
        .ok()?;
    reader.format()?;
    let (width, height) = reader.into_dimensions().ok()?;
    Some(Dimensions::new(width, height))
}
