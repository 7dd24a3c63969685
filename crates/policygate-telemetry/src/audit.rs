//! Hash-chained audit trail for enforcement decisions

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::VecDeque;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::debug;

/// Audit persistence errors
#[derive(Debug, thiserror::Error)]
pub enum AuditError {
    #[error("audit io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("audit serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Audit trail with hash-chained events for tamper detection
///
/// Only the most recent `max_retained` events are kept in memory. The hash
/// that preceded the oldest retained event is kept as the anchor so the
/// retained window still verifies.
pub struct AuditTrail {
    events: VecDeque<AuditEvent>,
    chain_hash: Option<String>,
    anchor: Option<String>,
    max_retained: usize,
}

impl AuditTrail {
    /// Create a new audit trail
    pub fn new() -> Self {
        Self::with_capacity(10_000)
    }

    pub fn with_capacity(max_retained: usize) -> Self {
        Self {
            events: VecDeque::new(),
            chain_hash: None,
            anchor: None,
            max_retained: max_retained.max(1),
        }
    }

    /// Add an event to the audit trail and return the chained copy
    pub fn add_event(&mut self, event: AuditEvent) -> AuditEvent {
        let event = self.link(event);
        self.commit(event.clone());
        event
    }

    /// Chain an event onto the current head without recording it
    pub fn link(&self, mut event: AuditEvent) -> AuditEvent {
        event.previous_hash = self.chain_hash.clone();
        event.hash = Some(compute_hash(&event));
        event
    }

    /// Record an event produced by [`AuditTrail::link`] against the current head
    fn commit(&mut self, event: AuditEvent) {
        self.chain_hash = event.hash.clone();
        self.events.push_back(event);

        while self.events.len() > self.max_retained {
            if let Some(dropped) = self.events.pop_front() {
                self.anchor = dropped.hash;
            }
        }
    }

    /// Verify the integrity of the retained window
    pub fn verify(&self) -> bool {
        let mut prev_hash = self.anchor.clone();

        for event in &self.events {
            if event.previous_hash != prev_hash {
                return false;
            }

            let computed_hash = compute_hash(event);
            if event.hash.as_ref() != Some(&computed_hash) {
                return false;
            }

            prev_hash = event.hash.clone();
        }

        true
    }

    /// Get all retained events, oldest first
    pub fn events(&self) -> &VecDeque<AuditEvent> {
        &self.events
    }

    /// Hash of the newest event
    pub fn head(&self) -> Option<&str> {
        self.chain_hash.as_deref()
    }
}

impl Default for AuditTrail {
    fn default() -> Self {
        Self::new()
    }
}

fn compute_hash(event: &AuditEvent) -> String {
    let mut hasher = Sha256::new();

    hasher.update(event.event_type.as_bytes());
    hasher.update(event.key.as_bytes());
    if let Some(ref data) = event.data {
        hasher.update(data.as_bytes());
    }
    hasher.update(event.timestamp_ms.to_be_bytes());
    hasher.update(event.severity.as_str().as_bytes());
    if let Some(ref prev) = event.previous_hash {
        hasher.update(prev.as_bytes());
    }

    hex::encode(hasher.finalize())
}

/// A single audit event in the trail
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEvent {
    /// Event type/category
    pub event_type: String,

    /// Idempotency key of the decision this event belongs to
    pub key: String,

    /// Event data (JSON serialized)
    pub data: Option<String>,

    /// Milliseconds since the Unix epoch
    pub timestamp_ms: u64,

    /// Hash of this event
    pub hash: Option<String>,

    /// Hash of previous event (for chaining)
    pub previous_hash: Option<String>,

    pub severity: AuditSeverity,
}

impl AuditEvent {
    /// Create a new audit event
    pub fn new(event_type: impl Into<String>, key: impl Into<String>) -> Self {
        let timestamp_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or_default();

        Self {
            event_type: event_type.into(),
            key: key.into(),
            data: None,
            timestamp_ms,
            hash: None,
            previous_hash: None,
            severity: AuditSeverity::Info,
        }
    }

    /// Set event data
    pub fn with_data(mut self, data: impl Serialize) -> Self {
        self.data = serde_json::to_string(&data).ok();
        self
    }

    /// Set severity
    pub fn with_severity(mut self, severity: AuditSeverity) -> Self {
        self.severity = severity;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditSeverity {
    Info,
    Warning,
    High,
    Critical,
}

impl AuditSeverity {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditSeverity::Info => "info",
            AuditSeverity::Warning => "warning",
            AuditSeverity::High => "high",
            AuditSeverity::Critical => "critical",
        }
    }
}

/// Thread-safe audit log with optional JSON-lines persistence
pub struct AuditLog {
    trail: Mutex<AuditTrail>,
    sink: Option<Mutex<File>>,
}

impl AuditLog {
    /// Audit log kept in memory only
    pub fn in_memory() -> Self {
        Self {
            trail: Mutex::new(AuditTrail::new()),
            sink: None,
        }
    }

    /// Audit log that also appends every event to `path`
    pub fn open(path: impl AsRef<Path>) -> Result<Self, AuditError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let file = OpenOptions::new().create(true).append(true).open(path)?;
        debug!(path = %path.display(), "Audit log opened");

        Ok(Self {
            trail: Mutex::new(AuditTrail::new()),
            sink: Some(Mutex::new(file)),
        })
    }

    /// Chain an event and persist it
    ///
    /// The trail only advances once the line is on disk; a failed write
    /// leaves both the trail and the file at the previous head.
    pub fn record(&self, event: AuditEvent) -> Result<AuditEvent, AuditError> {
        let mut trail = self.trail.lock().unwrap_or_else(|e| e.into_inner());
        let chained = trail.link(event);

        if let Some(ref sink) = self.sink {
            let mut line = serde_json::to_vec(&chained)?;
            line.push(b'\n');

            let mut file = sink.lock().unwrap_or_else(|e| e.into_inner());
            file.write_all(&line)?;
            file.flush()?;
        }

        trail.commit(chained.clone());
        Ok(chained)
    }

    /// Copy of the retained events
    pub fn events(&self) -> Vec<AuditEvent> {
        self.trail
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .events()
            .iter()
            .cloned()
            .collect()
    }

    pub fn verify(&self) -> bool {
        self.trail.lock().unwrap_or_else(|e| e.into_inner()).verify()
    }
}

impl Default for AuditLog {
    fn default() -> Self {
        Self::in_memory()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::BufRead;

    #[test]
    fn test_audit_trail() {
        let mut trail = AuditTrail::new();

        trail.add_event(AuditEvent::new("decision_denied", "k1"));
        trail.add_event(AuditEvent::new("decision_denied", "k2"));

        assert!(trail.verify());
        assert_eq!(trail.events().len(), 2);
        assert_eq!(trail.events()[1].previous_hash, trail.events()[0].hash);
    }

    #[test]
    fn test_tamper_detection() {
        let mut trail = AuditTrail::new();

        trail.add_event(AuditEvent::new("event1", "k1"));
        trail.add_event(AuditEvent::new("event2", "k2"));

        trail.events[0].event_type = "tampered".to_string();

        assert!(!trail.verify());
    }

    #[test]
    fn test_retention_window_still_verifies() {
        let mut trail = AuditTrail::with_capacity(2);

        for i in 0..5 {
            trail.add_event(AuditEvent::new("decision_denied", format!("k{}", i)));
        }

        assert_eq!(trail.events().len(), 2);
        assert_eq!(trail.events()[0].key, "k3");
        assert!(trail.verify());
    }

    #[test]
    fn test_log_persists_json_lines() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("audit").join("decisions.jsonl");

        let log = AuditLog::open(&path).unwrap();
        log.record(
            AuditEvent::new("decision_denied", "delivery-1")
                .with_severity(AuditSeverity::High)
                .with_data(serde_json::json!({"reasons": ["no approvals"]})),
        )
        .unwrap();
        log.record(AuditEvent::new("decision_denied", "delivery-2")).unwrap();

        let file = std::fs::File::open(&path).unwrap();
        let lines: Vec<AuditEvent> = std::io::BufReader::new(file)
            .lines()
            .map(|line| serde_json::from_str(&line.unwrap()).unwrap())
            .collect();

        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0].key, "delivery-1");
        assert_eq!(lines[0].severity, AuditSeverity::High);
        assert_eq!(lines[1].previous_hash, lines[0].hash);
        assert_eq!(log.events(), lines);
        assert!(log.verify());
    }

    #[test]
    fn test_link_does_not_advance_trail() {
        let mut trail = AuditTrail::new();
        trail.add_event(AuditEvent::new("decision_denied", "k1"));
        let head = trail.head().map(str::to_string);

        let pending = trail.link(AuditEvent::new("decision_denied", "k2"));

        assert_eq!(pending.previous_hash, head);
        assert_eq!(trail.events().len(), 1);
        assert_eq!(trail.head().map(str::to_string), head);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_failed_write_leaves_trail_untouched() {
        // Every write to /dev/full fails with ENOSPC
        let log = AuditLog::open("/dev/full").unwrap();

        assert!(log.record(AuditEvent::new("decision_denied", "k1")).is_err());
        assert!(log.record(AuditEvent::new("decision_denied", "k1")).is_err());

        assert!(log.events().is_empty());
        assert!(log.verify());
    }

    #[test]
    fn test_retry_after_failure_keeps_file_chained() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("decisions.jsonl");
        let log = AuditLog::open(&path).unwrap();

        log.record(AuditEvent::new("decision_denied", "k1")).unwrap();

        // A link that is never committed, as when the write fails
        let abandoned = log
            .trail
            .lock()
            .unwrap()
            .link(AuditEvent::new("decision_denied", "k2"));
        log.record(AuditEvent::new("decision_denied", "k2")).unwrap();

        let file = std::fs::File::open(&path).unwrap();
        let lines: Vec<AuditEvent> = std::io::BufReader::new(file)
            .lines()
            .map(|line| serde_json::from_str(&line.unwrap()).unwrap())
            .collect();

        assert_eq!(lines.len(), 2);
        assert_eq!(lines[1].previous_hash, lines[0].hash);
        assert_eq!(abandoned.previous_hash, lines[0].hash);
        assert!(log.verify());
    }
}
