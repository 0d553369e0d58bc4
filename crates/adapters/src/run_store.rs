use std::fs::{self, OpenOptions};
use std::io::{self, BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use log::warn;
use storyforge_core::{RunRecord, RunStore, RunStoreError};

use crate::error::AdapterError;

/// Append-only run history, one JSON record per line.
pub struct JsonlRunStore {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonlRunStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Every readable record in the file. Lines that no longer parse are
    /// skipped with a warning; a missing file is an empty history.
    pub fn read_all(&self) -> Result<Vec<RunRecord>, AdapterError> {
        let file = match fs::File::open(&self.path) {
            Ok(file) => file,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(AdapterError::io(&self.path, err)),
        };

        let mut records = Vec::new();
        for (number, line) in BufReader::new(file).lines().enumerate() {
            let line = line.map_err(|err| AdapterError::io(&self.path, err))?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<RunRecord>(&line) {
                Ok(record) => records.push(record),
                Err(err) => warn!(
                    "skipping unreadable history line {} in {}: {err}",
                    number + 1,
                    self.path.display()
                ),
            }
        }
        Ok(records)
    }

    fn io_error(&self, source: io::Error) -> RunStoreError {
        RunStoreError::Io {
            path: self.path.clone(),
            source,
        }
    }
}

impl RunStore for JsonlRunStore {
    fn record(&self, entry: &RunRecord) -> Result<(), RunStoreError> {
        let mut line = serde_json::to_string(entry)?;
        line.push('\n');

        let _guard = self
            .write_lock
            .lock()
            .map_err(|_| RunStoreError::Unavailable("history lock poisoned".to_string()))?;

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|err| self.io_error(err))?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|err| self.io_error(err))?;
        file.write_all(line.as_bytes())
            .map_err(|err| self.io_error(err))
    }
}
