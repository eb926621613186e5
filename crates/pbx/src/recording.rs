//! Recording references as sent by the PBX
//!
//! `recordfiles` looks like `2026-02/auto-1700000000-1001-5551234.wav@`: a
//! relative path with a trailing `@`. Several files are joined with `@`; the
//! first one is the call recording. A bare filename lives in the default
//! recording directory.

use serde::Serialize;

/// Directory + filename pair accepted by the recording API
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RecordingRef {
    pub dir: String,
    pub filename: String,
}

impl RecordingRef {
    /// Parse a raw `recordfiles` value; `None` when nothing usable remains
    pub fn parse(raw: &str, default_dir: &str) -> Option<Self> {
        let first = raw
            .split('@')
            .map(str::trim)
            .find(|part| !part.is_empty())?;

        let path = first.trim_start_matches('/');
        if path.split('/').any(|component| component == "..") {
            return None;
        }

        match path.rsplit_once('/') {
            Some((dir, filename)) => {
                if filename.is_empty() {
                    return None;
                }
                let dir = dir.trim_matches('/');
                Some(Self {
                    dir: if dir.is_empty() { default_dir.to_string() } else { dir.to_string() },
                    filename: filename.to_string(),
                })
            }
            None => Some(Self {
                dir: default_dir.to_string(),
                filename: path.to_string(),
            }),
        }
    }

    /// File extension, lowercased
    pub fn extension(&self) -> Option<String> {
        self.filename
            .rsplit_once('.')
            .map(|(_, ext)| ext.to_ascii_lowercase())
            .filter(|ext| !ext.is_empty())
    }
}

impl std::fmt::Display for RecordingRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.dir, self.filename)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strips_trailing_sentinel() {
        let r = RecordingRef::parse("2026-02/rec.wav@", "monitor").unwrap();
        assert_eq!(r.dir, "2026-02");
        assert_eq!(r.filename, "rec.wav");
        assert_eq!(r.to_string(), "2026-02/rec.wav");
    }

    #[test]
    fn test_bare_filename_uses_default_dir() {
        let r = RecordingRef::parse("auto-1700000000.wav", "monitor").unwrap();
        assert_eq!(r.dir, "monitor");
        assert_eq!(r.filename, "auto-1700000000.wav");
    }

    #[test]
    fn test_first_of_several_files() {
        let r = RecordingRef::parse(" a/one.wav@b/two.wav@ ", "monitor").unwrap();
        assert_eq!(r.dir, "a");
        assert_eq!(r.filename, "one.wav");
    }

    #[test]
    fn test_nested_directory() {
        let r = RecordingRef::parse("/monitor/2026-02/x.WAV@", "monitor").unwrap();
        assert_eq!(r.dir, "monitor/2026-02");
        assert_eq!(r.extension().as_deref(), Some("wav"));
    }

    #[test]
    fn test_unusable_references() {
        assert!(RecordingRef::parse("", "monitor").is_none());
        assert!(RecordingRef::parse("@", "monitor").is_none());
        assert!(RecordingRef::parse("  @ @ ", "monitor").is_none());
        assert!(RecordingRef::parse("dir/", "monitor").is_none());
        assert!(RecordingRef::parse("../etc/passwd", "monitor").is_none());
    }
}
