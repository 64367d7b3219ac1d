//! Append-only JSON lines storage backend
//!
//! One interaction per line, in import order. Useful as a lightweight sink or
//! for shipping reports to another system that tails the file.

use super::Storage;
use crate::error::StorageError;
use crate::types::Interaction;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

/// JSON lines [`Storage`].
pub struct JsonLinesStorage {
    path: PathBuf,
    writer: Option<BufWriter<File>>,
    closed: bool,
}

impl JsonLinesStorage {
    /// The file is opened lazily, on validation or the first import.
    pub fn new(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
            writer: None,
            closed: false,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn open(&self) -> Result<BufWriter<File>, StorageError> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        Ok(BufWriter::new(file))
    }

    fn writer(&mut self) -> Result<&mut BufWriter<File>, StorageError> {
        if self.closed {
            return Err(StorageError::Closed);
        }
        if self.writer.is_none() {
            self.writer = Some(self.open()?);
        }
        self.writer.as_mut().ok_or(StorageError::Closed)
    }
}

impl Storage for JsonLinesStorage {
    fn name(&self) -> &'static str {
        "json_lines"
    }

    fn validate(&mut self) -> Result<(), StorageError> {
        if self.path.is_dir() {
            return Err(StorageError::Validation(format!(
                "{} is a directory",
                self.path.display()
            )));
        }
        self.writer().map(|_| ())
    }

    fn import_interaction(&mut self, interaction: &Interaction) -> Result<(), StorageError> {
        let mut line = serde_json::to_vec(interaction)?;
        line.push(b'\n');

        let writer = self.writer()?;
        writer.write_all(&line)?;
        // Each line is durable before the collector logs it as imported.
        writer.flush()?;
        Ok(())
    }

    fn shutdown(&mut self) -> Result<(), StorageError> {
        self.closed = true;
        if let Some(mut writer) = self.writer.take() {
            writer.flush()?;
        }
        Ok(())
    }
}
