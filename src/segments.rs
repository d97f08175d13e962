//! Split-image segment naming: scheme detection, name generation, discovery.

use std::path::{Path, PathBuf};

use tracing::debug;

use crate::error::Result;

/// Naming convention of a split image set, detected from the first
/// segment's name.
///
/// The first segment always keeps its original name; `name_for` generates
/// the names of the following segments. Detection is purely lexical, so a
/// false match is harmless: discovery probes each generated name on disk
/// and stops at the first absence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NamingScheme {
    /// Zero-padded decimal counter, zero- or one-based: `img.001`,
    /// `img_000`, `img.01`. Counters may grow past the original field
    /// width (`img.999` is followed by `img.1000`).
    Numeric {
        prefix: String,
        width: usize,
        base: u64,
    },
    /// Fixed-width base-26 counter over `a..z`: `img.aaa` .. `img.zzz`.
    /// Unlike the numeric scheme the field never widens; the scheme is
    /// exhausted after the all-`z` name.
    Alphabetic { prefix: String, width: usize },
    /// Apple segmented dmg: `disk.dmg`, `disk.002.dmgpart`, ...
    DmgPart { prefix: String },
    /// Parenthesized bin set: `dump.bin`, `dump(2).bin`, ...
    NumberedBin { prefix: String },
}

fn trailing_run(name: &str, pred: impl Fn(char) -> bool) -> usize {
    name.chars().rev().take_while(|&c| pred(c)).count()
}

impl NamingScheme {
    /// Detects the naming scheme of `first`, checking the families in
    /// priority order. `None` means a single-segment image.
    pub fn detect(first: &Path) -> Option<NamingScheme> {
        let name = first.to_str()?;

        // Zero-padded counter: the run value must be exactly 0 or 1,
        // otherwise this is not the first segment of anything.
        let digits = trailing_run(name, |c| c.is_ascii_digit());
        if digits >= 2 {
            let prefix = &name[..name.len() - digits];
            if let Ok(base) = name[name.len() - digits..].parse::<u64>() {
                if base <= 1 {
                    return Some(NamingScheme::Numeric {
                        prefix: prefix.to_string(),
                        width: digits,
                        base,
                    });
                }
            }
        }

        let alphas = trailing_run(name, |c| c == 'a');
        if alphas >= 2 {
            return Some(NamingScheme::Alphabetic {
                prefix: name[..name.len() - alphas].to_string(),
                width: alphas,
            });
        }

        if let Some(stem) = name.strip_suffix(".dmg") {
            // Keep the dot: segment 2 of `disk.dmg` is `disk.002.dmgpart`.
            return Some(NamingScheme::DmgPart {
                prefix: format!("{stem}."),
            });
        }

        if let Some(stem) = name.strip_suffix(".bin") {
            return Some(NamingScheme::NumberedBin {
                prefix: stem.to_string(),
            });
        }

        None
    }

    /// Generates the name of segment `ordinal` (0 is the first segment).
    ///
    /// Pure and deterministic. `None` means the scheme has no further
    /// segment at this ordinal.
    pub fn name_for(&self, ordinal: usize) -> Option<PathBuf> {
        match self {
            NamingScheme::Numeric {
                prefix,
                width,
                base,
            } => {
                let n = base.checked_add(ordinal as u64)?;
                let width = *width;
                Some(PathBuf::from(format!("{prefix}{n:0width$}")))
            }
            NamingScheme::Alphabetic { prefix, width } => {
                if let Some(limit) = 26usize.checked_pow(*width as u32) {
                    if ordinal >= limit {
                        return None;
                    }
                }
                let mut n = ordinal;
                let mut field = vec![b'a'; *width];
                for slot in field.iter_mut().rev() {
                    *slot = b'a' + (n % 26) as u8;
                    n /= 26;
                }
                let field = String::from_utf8(field).ok()?;
                Some(PathBuf::from(format!("{prefix}{field}")))
            }
            NamingScheme::DmgPart { prefix } => {
                if ordinal == 0 {
                    Some(PathBuf::from(format!("{prefix}dmg")))
                } else {
                    let n = ordinal.checked_add(1)?;
                    Some(PathBuf::from(format!("{prefix}{n:03}.dmgpart")))
                }
            }
            NamingScheme::NumberedBin { prefix } => {
                if ordinal == 0 {
                    Some(PathBuf::from(format!("{prefix}.bin")))
                } else {
                    let n = ordinal.checked_add(1)?;
                    Some(PathBuf::from(format!("{prefix}({n}).bin")))
                }
            }
        }
    }
}

/// Discovers the ordered segment set starting at `first`.
///
/// Returns a single-element list when no naming convention is recognized.
/// Segment ordinals are contiguous: the first generated name that does not
/// exist on disk (or scheme exhaustion) terminates discovery. Errors only
/// if `first` itself does not exist.
pub fn find_segment_files(first: &Path) -> Result<Vec<PathBuf>> {
    std::fs::metadata(first)?;

    let Some(scheme) = NamingScheme::detect(first) else {
        return Ok(vec![first.to_path_buf()]);
    };

    let mut found = vec![first.to_path_buf()];
    for ordinal in 1.. {
        let Some(name) = scheme.name_for(ordinal) else {
            break;
        };
        if !name.exists() {
            break;
        }
        debug!(segment = %name.display(), ordinal, "segment found");
        found.push(name);
    }
    debug!(count = found.len(), "segment discovery complete");
    Ok(found)
}
