//! Output channel remapping.
//!
//! Maps internal render-buffer channels ("layout") to physical device output
//! channels ("device") at the end of the audio callback. The table is loaded
//! once from a CSV on the main thread and is immutable afterwards; the audio
//! thread only ever reads `entries()` and `identity()`.
//!
//! CSV format: a header line containing case-insensitive `layout` and
//! `device` columns (any order, extra columns ignored); `#` comments and
//! empty lines skipped; malformed or out-of-range rows dropped with a single
//! summary log line. Duplicate device targets are valid and sum.

use crate::error::{AuraSonicError, Result};
use std::path::Path;

/// One (layout, device) pair from the CSV. Both 0-based.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemapEntry {
    pub layout: usize,
    pub device: usize,
}

/// The remap table. Default-constructed it is the identity mapping.
#[derive(Debug, Clone, Default)]
pub struct OutputRemap {
    entries: Vec<RemapEntry>,
    identity: bool,
}

impl OutputRemap {
    /// The identity mapping (no CSV).
    pub fn identity_map() -> Self {
        Self {
            entries: Vec::new(),
            identity: true,
        }
    }

    /// Load a remap CSV. Out-of-range `layout` entries (>= `render_channels`)
    /// and `device` entries (>= `device_channels`) are dropped. A CSV with no
    /// valid rows falls back to identity (not fatal; logged).
    pub fn load(path: &Path, render_channels: usize, device_channels: usize) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            AuraSonicError::Configuration(format!(
                "cannot open remap CSV {}: {}",
                path.display(),
                e
            ))
        })?;
        Ok(Self::from_csv(&text, render_channels, device_channels))
    }

    /// Parse remap CSV text. Never fails: unusable input degrades to the
    /// identity mapping with a warning.
    pub fn from_csv(text: &str, render_channels: usize, device_channels: usize) -> Self {
        let mut lines = text
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty() && !l.starts_with('#'));

        // Header: locate the layout and device columns.
        let Some(header) = lines.next() else {
            log::warn!("Remap CSV is empty, using identity mapping");
            return Self::identity_map();
        };
        let mut layout_col = None;
        let mut device_col = None;
        for (i, col) in header.split(',').enumerate() {
            match col.trim().to_ascii_lowercase().as_str() {
                "layout" => layout_col = Some(i),
                "device" => device_col = Some(i),
                _ => {}
            }
        }
        let (Some(layout_col), Some(device_col)) = (layout_col, device_col) else {
            log::warn!("Remap CSV missing 'layout' or 'device' header, using identity mapping");
            return Self::identity_map();
        };

        let mut entries = Vec::new();
        let mut dropped = 0usize;
        for line in lines {
            let cols: Vec<&str> = line.split(',').map(str::trim).collect();
            let parsed = (
                cols.get(layout_col).and_then(|c| c.parse::<usize>().ok()),
                cols.get(device_col).and_then(|c| c.parse::<usize>().ok()),
            );
            match parsed {
                (Some(layout), Some(device))
                    if layout < render_channels && device < device_channels =>
                {
                    entries.push(RemapEntry { layout, device });
                }
                _ => dropped += 1,
            }
        }

        if dropped > 0 {
            log::warn!("Remap CSV: {} row(s) dropped (out-of-range or malformed)", dropped);
        }

        if entries.is_empty() {
            log::warn!("Remap CSV has no valid rows, using identity mapping");
            return Self::identity_map();
        }

        let identity = is_identity(&entries, render_channels);
        log::info!(
            "Loaded {} remap entries ({})",
            entries.len(),
            if identity {
                "identity map, fast path active"
            } else {
                "non-identity remap"
            }
        );

        Self { entries, identity }
    }

    /// True when the table is exactly the bijection i↔i over the render
    /// channels, enabling the direct-copy fast path.
    pub fn identity(&self) -> bool {
        self.identity
    }

    pub fn entries(&self) -> &[RemapEntry] {
        &self.entries
    }
}

/// Entries form an identity map iff they cover 0..render_channels exactly
/// once each with layout == device.
fn is_identity(entries: &[RemapEntry], render_channels: usize) -> bool {
    if entries.len() != render_channels {
        return false;
    }
    let mut covered = vec![false; render_channels];
    for e in entries {
        if e.layout != e.device || covered[e.layout] {
            return false;
        }
        covered[e.layout] = true;
    }
    covered.iter().all(|&c| c)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_basic_remap() {
        let csv = "layout,device\n0,10\n1,10\n2,3\n3,99\n";
        let remap = OutputRemap::from_csv(csv, 4, 16);
        assert!(!remap.identity());
        // Row 3,99 is out of device range and dropped.
        assert_eq!(
            remap.entries(),
            &[
                RemapEntry { layout: 0, device: 10 },
                RemapEntry { layout: 1, device: 10 },
                RemapEntry { layout: 2, device: 3 },
            ]
        );
    }

    #[test]
    fn test_header_order_and_case_insensitive() {
        let csv = "Device,extra,LAYOUT\n5,x,0\n";
        let remap = OutputRemap::from_csv(csv, 4, 8);
        assert_eq!(remap.entries(), &[RemapEntry { layout: 0, device: 5 }]);
    }

    #[test]
    fn test_comments_and_blank_lines_skipped() {
        let csv = "# routing for the studio\n\nlayout,device\n# front pair\n0,1\n\n1,0\n";
        let remap = OutputRemap::from_csv(csv, 2, 2);
        assert_eq!(remap.entries().len(), 2);
    }

    #[test]
    fn test_identity_detection() {
        let csv = "layout,device\n0,0\n1,1\n2,2\n3,3\n";
        let remap = OutputRemap::from_csv(csv, 4, 4);
        assert!(remap.identity());
    }

    #[test]
    fn test_partial_identity_is_not_identity() {
        let csv = "layout,device\n0,0\n1,1\n";
        let remap = OutputRemap::from_csv(csv, 4, 4);
        assert!(!remap.identity());

        let csv = "layout,device\n0,0\n1,1\n2,2\n2,2\n";
        let remap = OutputRemap::from_csv(csv, 4, 4);
        assert!(!remap.identity());
    }

    #[test]
    fn test_no_valid_rows_falls_back_to_identity() {
        let csv = "layout,device\nnope,4\n100,100\n";
        let remap = OutputRemap::from_csv(csv, 4, 4);
        assert!(remap.identity());
        assert!(remap.entries().is_empty());
    }

    #[test]
    fn test_missing_header_falls_back_to_identity() {
        let csv = "a,b\n0,1\n";
        let remap = OutputRemap::from_csv(csv, 4, 4);
        assert!(remap.identity());
    }
}
