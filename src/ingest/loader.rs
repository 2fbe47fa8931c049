//! Load per-session input documents from disk.
//!
//! Each `*.json` file holds either one `SessionInput` object or an array
//! of them. Files are read in name order so builds are reproducible.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::ingest::types::SessionInput;

/// Errors raised while reading input documents.
#[derive(Error, Debug)]
pub enum IngestError {
    #[error("failed to read {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {path:?}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("no session documents found in {0:?}")]
    NoInputs(PathBuf),
}

#[derive(Deserialize)]
#[serde(untagged)]
enum OneOrMany {
    Many(Vec<SessionInput>),
    One(Box<SessionInput>),
}

/// Read one input document.
pub fn load_session_file(path: &Path) -> Result<Vec<SessionInput>, IngestError> {
    let content = std::fs::read_to_string(path).map_err(|source| IngestError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let parsed: OneOrMany =
        serde_json::from_str(&content).map_err(|source| IngestError::Parse {
            path: path.to_path_buf(),
            source,
        })?;

    Ok(match parsed {
        OneOrMany::Many(sessions) => sessions,
        OneOrMany::One(session) => vec![*session],
    })
}

/// Read every `*.json` document in a directory, or a single file.
pub fn load_sessions(path: &Path) -> Result<Vec<SessionInput>, IngestError> {
    if path.is_file() {
        return load_session_file(path);
    }

    let entries = std::fs::read_dir(path).map_err(|source| IngestError::Io {
        path: path.to_path_buf(),
        source,
    })?;

    let mut files: Vec<PathBuf> = entries
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.is_file() && p.extension().map(|e| e == "json").unwrap_or(false))
        .collect();
    files.sort();

    if files.is_empty() {
        return Err(IngestError::NoInputs(path.to_path_buf()));
    }

    let mut sessions = Vec::new();
    for file in &files {
        let loaded = load_session_file(file)?;
        tracing::debug!(file = ?file, sessions = loaded.len(), "loaded input document");
        sessions.extend(loaded);
    }
    Ok(sessions)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SESSION: &str = r#"{
        "session": {"session_id": "A", "group_key": "W1",
                    "start": "2024-03-02T15:00:00Z", "end": "2024-03-02T16:00:00Z"},
        "race_control": []
    }"#;

    #[test]
    fn test_load_directory_in_name_order() {
        let dir = tempfile::tempdir().unwrap();
        let second = format!("[{SESSION}]").replace("\"A\"", "\"B\"");
        std::fs::write(dir.path().join("b.json"), second).unwrap();
        std::fs::write(dir.path().join("a.json"), SESSION).unwrap();
        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let sessions = load_sessions(dir.path()).unwrap();
        let ids: Vec<&str> = sessions.iter().map(|s| s.session.session_id.as_str()).collect();
        assert_eq!(ids, vec!["A", "B"]);
    }

    #[test]
    fn test_empty_directory_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            load_sessions(dir.path()),
            Err(IngestError::NoInputs(_))
        ));
    }

    #[test]
    fn test_parse_error_names_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.json");
        std::fs::write(&path, "{ not json").unwrap();

        let err = load_session_file(&path).unwrap_err();
        assert!(err.to_string().contains("broken.json"));
    }
}
