use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};

use chrono::{DateTime, Local};
use serde::Serialize;
use thiserror::Error;

use crate::gateway::ModelError;
use crate::logging::{FileLogSink, LogRecord, LogSink};
use crate::stage::Stage;

pub const STORY_FILE_NAME: &str = "Story.md";
pub const TRANSCRIPTS_DIR_NAME: &str = "Transcripts";

#[derive(Debug, Error)]
pub enum RunLogError {
    #[error("failed to prepare run log directory `{path}`: {source}")]
    CreateDir { path: PathBuf, source: io::Error },
    #[error("failed to write `{path}`: {source}")]
    Write { path: PathBuf, source: io::Error },
    #[error("failed to serialize transcript `{path}`: {source}")]
    Serialize {
        path: PathBuf,
        source: serde_json::Error,
    },
}

#[derive(Serialize)]
struct Exchange<'a> {
    stage: Stage,
    model: &'a str,
    prompt: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    response: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

/// Per-run artifact directory, `<root>/Generation_<timestamp>/`, holding
/// `Main.log`, one transcript file per model exchange and the final story.
pub struct RunLog {
    dir: PathBuf,
    main: FileLogSink,
    exchanges: AtomicUsize,
}

impl RunLog {
    pub fn create(root: impl AsRef<Path>) -> Result<Self, RunLogError> {
        Self::create_at(root, Local::now())
    }

    pub fn create_at(root: impl AsRef<Path>, started: DateTime<Local>) -> Result<Self, RunLogError> {
        let dir = root
            .as_ref()
            .join(format!("Generation_{}", started.format("%Y-%m-%d_%H-%M-%S")));
        let transcripts = dir.join(TRANSCRIPTS_DIR_NAME);
        fs::create_dir_all(&transcripts).map_err(|source| RunLogError::CreateDir {
            path: transcripts.clone(),
            source,
        })?;
        let main = FileLogSink::create(&dir).map_err(|source| RunLogError::Write {
            path: dir.join(crate::logging::MAIN_LOG_FILE_NAME),
            source,
        })?;

        Ok(Self {
            dir,
            main,
            exchanges: AtomicUsize::new(0),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn main_log_path(&self) -> &Path {
        self.main.path()
    }

    pub fn record_exchange(
        &self,
        stage: Stage,
        model: &str,
        prompt: &str,
        outcome: Result<&str, &ModelError>,
    ) -> Result<PathBuf, RunLogError> {
        let number = self.exchanges.fetch_add(1, Ordering::SeqCst) + 1;
        let path = self.dir.join(TRANSCRIPTS_DIR_NAME).join(format!(
            "{number:04}_{}.json",
            stage.config_key()
        ));
        let exchange = Exchange {
            stage,
            model,
            prompt,
            response: outcome.ok(),
            error: outcome.err().map(ToString::to_string),
        };
        let body = serde_json::to_string_pretty(&exchange).map_err(|source| {
            RunLogError::Serialize {
                path: path.clone(),
                source,
            }
        })?;
        fs::write(&path, body).map_err(|source| RunLogError::Write {
            path: path.clone(),
            source,
        })?;
        Ok(path)
    }

    pub fn save_story(&self, markdown: &str) -> Result<PathBuf, RunLogError> {
        let path = self.dir.join(STORY_FILE_NAME);
        fs::write(&path, markdown).map_err(|source| RunLogError::Write {
            path: path.clone(),
            source,
        })?;
        Ok(path)
    }
}

impl LogSink for RunLog {
    fn log(&self, record: LogRecord) {
        self.main.log(record);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logging::LogLevel;
    use chrono::TimeZone;
    use tempfile::tempdir;

    #[test]
    fn lays_out_generation_directory() {
        let root = tempdir().unwrap();
        let started = Local.with_ymd_and_hms(2026, 3, 14, 9, 26, 53).unwrap();
        let run_log = RunLog::create_at(root.path(), started).unwrap();

        assert!(run_log.dir().ends_with("Generation_2026-03-14_09-26-53"));
        assert!(run_log.dir().join(TRANSCRIPTS_DIR_NAME).is_dir());

        run_log.log(LogRecord::new(LogLevel::Info, "run started"));
        let main = fs::read_to_string(run_log.main_log_path()).unwrap();
        assert!(main.contains("run started"));
    }

    #[test]
    fn numbers_transcripts_and_saves_story() {
        let root = tempdir().unwrap();
        let run_log = RunLog::create(root.path()).unwrap();

        let first = run_log
            .record_exchange(Stage::Analysis, "analyzer", "analyze this", Ok("{}"))
            .unwrap();
        let failure = ModelError::Refusal("empty payload".into());
        let second = run_log
            .record_exchange(Stage::Drafting, "drafter", "write", Err(&failure))
            .unwrap();

        assert!(first.ends_with("0001_analyzer.json"));
        assert!(second.ends_with("0002_drafter.json"));
        let body = fs::read_to_string(&second).unwrap();
        assert!(body.contains("empty payload"));
        assert!(!body.contains("\"response\""));

        let story = run_log.save_story("# Title\n").unwrap();
        assert_eq!(fs::read_to_string(story).unwrap(), "# Title\n");
    }
}
