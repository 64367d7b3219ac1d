//! Optional on-disk sink for interactions whose import failed.
//!
//! Without it a failed interaction is logged and dropped.

use crate::types::Interaction;
use chrono::Utc;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

pub struct DeadLetterSink {
    dir: PathBuf,
}

impl DeadLetterSink {
    pub fn new(dir: &Path) -> Self {
        Self {
            dir: dir.to_path_buf(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Write the interaction and the failure that rejected it; returns the file.
    pub fn keep(&self, interaction: &Interaction, error: &str) -> io::Result<PathBuf> {
        fs::create_dir_all(&self.dir)?;

        let record = serde_json::json!({
            "failed_at": Utc::now().to_rfc3339(),
            "error": error,
            "interaction": interaction,
        });

        let path = self.dir.join(format!(
            "{}-{}.json",
            Utc::now().format("%Y%m%dT%H%M%S%.6f"),
            uuid::Uuid::new_v4()
        ));
        fs::write(&path, serde_json::to_vec_pretty(&record)?)?;
        Ok(path)
    }
}
