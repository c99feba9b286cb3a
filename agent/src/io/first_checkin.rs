//! First-checkin flag (`/tmp/first_checkin.json` by default).
//!
//! Holds a JSON boolean that is `true` from boot until the node registers
//! successfully for the first time. A missing file reads as `true`.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub struct FirstCheckinFlag {
    path: PathBuf,
}

impl FirstCheckinFlag {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether this node has not completed its first registration yet.
    ///
    /// Unreadable content is logged and treated as `true`, so the server
    /// sees the node as new rather than silently missing it.
    pub fn is_set(&self) -> bool {
        match fs::read_to_string(&self.path) {
            Ok(contents) => match serde_json::from_str::<bool>(contents.trim()) {
                Ok(flag) => flag,
                Err(err) => {
                    warn!(path = %self.path.display(), err = %err, "corrupt first-checkin flag");
                    true
                }
            },
            Err(err) if err.kind() == ErrorKind::NotFound => true,
            Err(err) => {
                warn!(path = %self.path.display(), err = %err, "unreadable first-checkin flag");
                true
            }
        }
    }

    /// Permanently clear the flag (until the node reboots).
    pub fn clear(&self) -> Result<()> {
        debug!(path = %self.path.display(), "first checkin performed");
        super::write_atomic(&self.path, "false\n")
            .with_context(|| format!("clear first-checkin flag {}", self.path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_flag_reads_as_first_checkin() {
        let temp = tempfile::tempdir().expect("tempdir");
        let flag = FirstCheckinFlag::new(temp.path().join("first_checkin.json"));
        assert!(flag.is_set());
    }

    #[test]
    fn clear_persists_false() {
        let temp = tempfile::tempdir().expect("tempdir");
        let flag = FirstCheckinFlag::new(temp.path().join("first_checkin.json"));
        flag.clear().expect("clear");
        assert!(!flag.is_set());
        let contents = fs::read_to_string(flag.path()).expect("read");
        assert_eq!(contents, "false\n");
    }

    #[test]
    fn explicit_true_reads_as_set() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("first_checkin.json");
        fs::write(&path, "true\n").expect("write");
        assert!(FirstCheckinFlag::new(path).is_set());
    }
}
