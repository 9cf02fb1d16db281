//! JSON snapshot files.
//!
//! Every output file is a single JSON array, pretty-printed with four-space
//! indentation and rewritten wholesale on each save.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::Serialize;
use serde_json::ser::{PrettyFormatter, Serializer};
use thiserror::Error;

use crate::monitor::MonitoredMessageRecord;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Destination the live monitor flushes its full record buffer into.
pub trait RecordSink {
    fn write_snapshot(&mut self, records: &[MonitoredMessageRecord]) -> Result<(), StoreError>;
}

#[derive(Debug, Clone)]
pub struct JsonSnapshotFile {
    path: PathBuf,
}

impl JsonSnapshotFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn save<T: Serialize>(&self, items: &[T]) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let payload = to_pretty_json(items)?;
        fs::write(&self.path, payload)?;
        Ok(())
    }
}

impl RecordSink for JsonSnapshotFile {
    fn write_snapshot(&mut self, records: &[MonitoredMessageRecord]) -> Result<(), StoreError> {
        self.save(records)
    }
}

/// Four-space pretty JSON. Non-ASCII text is written as-is.
pub fn to_pretty_json<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>, serde_json::Error> {
    let mut buffer = Vec::new();
    let mut serializer = Serializer::with_formatter(&mut buffer, PrettyFormatter::with_indent(b"    "));
    value.serialize(&mut serializer)?;
    Ok(buffer)
}
