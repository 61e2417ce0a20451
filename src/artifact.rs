//! Artifacts: the units of data shipped to the remote store.

use crate::clock::{Clock, Timestamp};
use crate::core::{Evidence, SuspicionReason, Verdict};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Stable identifier of an artifact across queue, staging, and remote store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ArtifactId(Uuid);

impl ArtifactId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// First eight hex digits, used in file names.
    pub fn short(&self) -> String {
        self.0.simple().to_string()[..8].to_string()
    }
}

impl Default for ArtifactId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ArtifactId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    Screenshot,
    LogRecord,
}

impl ArtifactKind {
    fn file_prefix(&self) -> &'static str {
        match self {
            ArtifactKind::Screenshot => "screenshot",
            ArtifactKind::LogRecord => "log",
        }
    }

    fn extension(&self) -> &'static str {
        match self {
            ArtifactKind::Screenshot => "png",
            ArtifactKind::LogRecord => "txt",
        }
    }

    pub fn content_type(&self) -> &'static str {
        match self {
            ArtifactKind::Screenshot => "image/png",
            ArtifactKind::LogRecord => "text/plain; charset=utf-8",
        }
    }
}

/// A detection log entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogRecord {
    pub reason: SuspicionReason,
    pub evidence: Evidence,
    pub recorded_at: Timestamp,
    /// Host the detection happened on
    pub device: String,
}

impl LogRecord {
    pub fn from_verdict(verdict: &Verdict, clock: &Clock, device: impl Into<String>) -> Self {
        Self {
            reason: verdict.reason,
            evidence: verdict.evidence.clone(),
            recorded_at: clock.localize(verdict.evaluated_at),
            device: device.into(),
        }
    }

    /// The headline line of the log.
    pub fn message(&self) -> String {
        format!(
            "{} - Suspicious {} detected and flagged!",
            self.recorded_at.log_stamp(),
            self.reason.activity_label()
        )
    }

    /// Text rendering uploaded to the store: headline plus JSON evidence.
    pub fn render(&self) -> String {
        let evidence = serde_json::to_string(&self.evidence).unwrap_or_default();
        format!(
            "{}\ndevice: {}\nevidence: {}\n",
            self.message(),
            self.device,
            evidence
        )
    }
}

/// Screenshot bytes. Held in memory only until the artifact is staged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImageData {
    /// Encoded PNG image
    Png(Vec<u8>),
    /// Body lives in the staging directory and is read from there on upload
    Staged,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ArtifactPayload {
    Screenshot(ImageData),
    LogRecord(LogRecord),
}

impl ArtifactPayload {
    pub fn kind(&self) -> ArtifactKind {
        match self {
            ArtifactPayload::Screenshot(_) => ArtifactKind::Screenshot,
            ArtifactPayload::LogRecord(_) => ArtifactKind::LogRecord,
        }
    }

    /// Bytes as staged locally and uploaded, if still held in memory.
    pub fn encode(&self) -> Option<Vec<u8>> {
        match self {
            ArtifactPayload::Screenshot(ImageData::Png(png)) => Some(png.clone()),
            ArtifactPayload::Screenshot(ImageData::Staged) => None,
            ArtifactPayload::LogRecord(record) => Some(record.render().into_bytes()),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Artifact {
    pub id: ArtifactId,
    pub payload: ArtifactPayload,
    pub created_at: Timestamp,
    /// Transfer attempts made so far
    pub attempts: u32,
}

impl Artifact {
    pub fn new(payload: ArtifactPayload, created_at: Timestamp) -> Self {
        Self {
            id: ArtifactId::new(),
            payload,
            created_at,
            attempts: 0,
        }
    }

    pub fn screenshot(png: Vec<u8>, clock: &Clock) -> Self {
        Self::new(ArtifactPayload::Screenshot(ImageData::Png(png)), clock.now())
    }

    pub fn log_record(record: LogRecord) -> Self {
        let created_at = record.recorded_at.clone();
        Self::new(ArtifactPayload::LogRecord(record), created_at)
    }

    pub fn kind(&self) -> ArtifactKind {
        self.payload.kind()
    }

    /// Drop in-memory image bytes once the body has been staged.
    pub fn into_staged(mut self) -> Self {
        if let ArtifactPayload::Screenshot(data) = &mut self.payload {
            *data = ImageData::Staged;
        }
        self
    }

    /// Local file name, also the last segment of the remote key.
    pub fn file_name(&self) -> String {
        let kind = self.kind();
        format!(
            "{}_{}_{}.{}",
            kind.file_prefix(),
            self.created_at.file_stamp(),
            self.id.short(),
            kind.extension()
        )
    }

    pub fn remote_key(&self, prefix: &str) -> String {
        let prefix = prefix.trim_matches('/');
        if prefix.is_empty() {
            self.file_name()
        } else {
            format!("{prefix}/{}", self.file_name())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Zone, ZoneSource};
    use chrono::{FixedOffset, TimeZone, Utc};

    struct Utc2;

    impl ZoneSource for Utc2 {
        fn current_zone(&self) -> Zone {
            Zone::Fixed(FixedOffset::east_opt(7200).unwrap())
        }
    }

    fn verdict() -> Verdict {
        Verdict {
            is_suspicious: true,
            reason: SuspicionReason::RegularKeyTiming,
            evidence: Evidence::default(),
            evaluated_at: Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap(),
        }
    }

    #[test]
    fn test_log_record_message() {
        let clock = Clock::new(Utc2);
        let record = LogRecord::from_verdict(&verdict(), &clock, "host-a");
        assert_eq!(
            record.message(),
            "2024-05-01 12-00-00 +02:00 - Suspicious keyboard input detected and flagged!"
        );
        let text = record.render();
        assert!(text.contains("device: host-a"));
        assert!(text.contains("\"min_key_samples\""));
    }

    #[test]
    fn test_file_name_and_key() {
        let clock = Clock::new(Utc2);
        let artifact = Artifact::log_record(LogRecord::from_verdict(&verdict(), &clock, "h"));
        let name = artifact.file_name();
        assert!(name.starts_with("log_20240501_120000_"));
        assert!(name.ends_with(".txt"));
        assert_eq!(artifact.remote_key("uploads/"), format!("uploads/{name}"));
        assert_eq!(artifact.remote_key(""), name);
        assert_eq!(artifact.kind(), ArtifactKind::LogRecord);
    }

    #[test]
    fn test_screenshot_encode_is_identity() {
        let clock = Clock::new(Utc2);
        let artifact = Artifact::screenshot(vec![1, 2, 3], &clock);
        assert_eq!(artifact.payload.encode(), Some(vec![1, 2, 3]));
        assert!(artifact.file_name().ends_with(".png"));
        assert_eq!(artifact.attempts, 0);
    }

    #[test]
    fn test_into_staged_drops_image_bytes() {
        let clock = Clock::new(Utc2);
        let artifact = Artifact::screenshot(vec![0; 1024], &clock);
        let name = artifact.file_name();

        let staged = artifact.into_staged();
        assert_eq!(staged.payload, ArtifactPayload::Screenshot(ImageData::Staged));
        assert_eq!(staged.payload.encode(), None);
        assert_eq!(staged.file_name(), name);

        let log = Artifact::log_record(LogRecord::from_verdict(&verdict(), &clock, "h"));
        assert_eq!(log.clone().into_staged(), log);
    }

    #[test]
    fn test_ids_are_unique() {
        assert_ne!(ArtifactId::new(), ArtifactId::new());
        assert_eq!(ArtifactId::new().short().len(), 8);
    }
}
