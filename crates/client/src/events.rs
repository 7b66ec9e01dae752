// File-backed store of recorded chat events.
//
// The whole file is one JSON array. Writes always replace the file through a
// temp file in the same directory so a reader never sees a partial array.

use std::fs::{self, File};
use std::io::{BufReader, BufWriter, ErrorKind, Write};
use std::path::{Path, PathBuf};

use chatgen_common::event::RecordedEvent;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum EventSourceError {
    #[error("failed to access `{path}`: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("`{path}` is not a JSON array of chat records: {source}")]
    Malformed {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// File name used for a video's recording when none is configured.
pub fn default_history_file(video_id: &str) -> PathBuf {
    PathBuf::from(format!("chat-history-{video_id}.json"))
}

#[derive(Debug, Clone)]
pub struct EventSource {
    path: PathBuf,
}

impl EventSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the full recording, in file order.
    pub fn load(&self) -> Result<Vec<RecordedEvent>, EventSourceError> {
        let file = File::open(&self.path).map_err(|source| self.io(source))?;
        serde_json::from_reader(BufReader::new(file))
            .map_err(|source| EventSourceError::Malformed { path: self.path.clone(), source })
    }

    /// Like [`EventSource::load`], but a missing file is an empty recording.
    pub fn load_or_empty(&self) -> Result<Vec<RecordedEvent>, EventSourceError> {
        match self.load() {
            Err(EventSourceError::Io { source, .. }) if source.kind() == ErrorKind::NotFound => {
                Ok(Vec::new())
            }
            other => other,
        }
    }

    /// Replace the file with `events`.
    pub fn write_all(&self, events: &[RecordedEvent]) -> Result<(), EventSourceError> {
        let tmp_path = self.temp_path();
        let result = self.write_temp(&tmp_path, events).and_then(|()| {
            fs::rename(&tmp_path, &self.path).map_err(|source| self.io(source))
        });
        if result.is_err() {
            let _ = fs::remove_file(&tmp_path);
        }
        result
    }

    fn write_temp(&self, tmp_path: &Path, events: &[RecordedEvent]) -> Result<(), EventSourceError> {
        let file = File::create(tmp_path)
            .map_err(|source| EventSourceError::Io { path: tmp_path.to_path_buf(), source })?;
        let mut writer = BufWriter::new(file);
        serde_json::to_writer_pretty(&mut writer, events)
            .map_err(|source| EventSourceError::Malformed { path: tmp_path.to_path_buf(), source })?;
        writer.flush().map_err(|source| self.io(source))?;
        let file = writer.into_inner().map_err(|error| self.io(error.into_error()))?;
        file.sync_data().map_err(|source| self.io(source))
    }

    fn temp_path(&self) -> PathBuf {
        let name = self.path.file_name().and_then(|name| name.to_str()).unwrap_or("history");
        self.path.with_file_name(format!(".{name}.tmp.{}", Uuid::new_v4()))
    }

    fn io(&self, source: std::io::Error) -> EventSourceError {
        EventSourceError::Io { path: self.path.clone(), source }
    }
}
