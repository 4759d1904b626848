//! Progress events for artifact downloads and installs.
//!
//! Callback-based reporting keeps the engine independent of whoever is
//! watching (the host bridge forwards these as `update.progress` events).

use crate::update::platform::PlatformTag;
use serde::Serialize;
use std::path::PathBuf;

/// Progress events emitted during an update session.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ProgressEvent {
    /// An artifact download has started.
    DownloadStarted {
        /// Source URL.
        url: String,
        /// Total size in bytes, if known.
        total_bytes: Option<u64>,
    },

    /// Download progress update.
    DownloadProgress {
        /// Bytes downloaded so far.
        bytes_downloaded: u64,
        /// Total size in bytes, if known.
        total_bytes: Option<u64>,
    },

    /// The artifact is complete and in place.
    DownloadComplete {
        /// Final location of the artifact.
        path: PathBuf,
        /// Bytes written.
        bytes: u64,
    },

    /// The installer reached a new stage.
    InstallStage {
        /// Installation model in use.
        updater_type: PlatformTag,
        /// Stage name (e.g. `"mounted"`, `"copied"`).
        stage: String,
    },
}

impl ProgressEvent {
    /// Fraction complete for download progress, when the total is known.
    #[must_use]
    pub fn fraction(&self) -> Option<f64> {
        match self {
            Self::DownloadProgress {
                bytes_downloaded,
                total_bytes: Some(total),
            } if *total > 0 => Some(*bytes_downloaded as f64 / *total as f64),
            _ => None,
        }
    }
}

/// Callback type for receiving progress events.
pub type ProgressCallback = Box<dyn Fn(ProgressEvent) + Send + Sync>;

/// Emit `event` if a callback is installed.
pub(crate) fn emit(callback: Option<&ProgressCallback>, event: ProgressEvent) {
    if let Some(cb) = callback {
        cb(event);
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

    use super::*;
    use std::sync::{Arc, Mutex};

    #[test]
    fn callback_receives_events() {
        let events: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let events_clone = Arc::clone(&events);

        let callback: ProgressCallback = Box::new(move |event| {
            let label = match &event {
                ProgressEvent::DownloadStarted { .. } => "started",
                ProgressEvent::DownloadProgress { .. } => "progress",
                ProgressEvent::DownloadComplete { .. } => "complete",
                ProgressEvent::InstallStage { .. } => "stage",
            };
            let Ok(mut guard) = events_clone.lock() else {
                return;
            };
            guard.push(label.to_owned());
        });

        emit(
            Some(&callback),
            ProgressEvent::DownloadStarted {
                url: "https://example.com/a.zip".into(),
                total_bytes: Some(1000),
            },
        );
        emit(
            Some(&callback),
            ProgressEvent::DownloadProgress {
                bytes_downloaded: 500,
                total_bytes: Some(1000),
            },
        );
        emit(
            Some(&callback),
            ProgressEvent::InstallStage {
                updater_type: PlatformTag::LinuxZip,
                stage: "extracted".into(),
            },
        );
        emit(None, ProgressEvent::DownloadComplete {
            path: PathBuf::from("/tmp/a.zip"),
            bytes: 1000,
        });

        let guard = events.lock().unwrap_or_else(|e| e.into_inner());
        assert_eq!(*guard, vec!["started", "progress", "stage"]);
    }

    #[test]
    fn fraction_requires_known_total() {
        let half = ProgressEvent::DownloadProgress {
            bytes_downloaded: 50,
            total_bytes: Some(100),
        };
        assert!((half.fraction().unwrap() - 0.5).abs() < f64::EPSILON);

        let unknown = ProgressEvent::DownloadProgress {
            bytes_downloaded: 50,
            total_bytes: None,
        };
        assert!(unknown.fraction().is_none());
    }

    #[test]
    fn serializes_with_kind_tag() {
        let event = ProgressEvent::InstallStage {
            updater_type: PlatformTag::MacosDmg,
            stage: "mounted".into(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["kind"], "install_stage");
        assert_eq!(json["updater_type"], "macos_dmg");
    }
}
