// SPDX-License-Identifier: MIT OR Apache-2.0
//! Append-only provenance ledger for tour assets.
//!
//! Every notable event against an asset — upload, conversion, QA pass,
//! integrity check, access — is emitted as a [`ProvenanceRecord`] to a
//! configured sink.  Emission is best-effort and deliberately separate from
//! the data path: a sink failure is logged and swallowed, never surfaced to
//! the caller.  Records are never mutated after emission; within one asset
//! they order by timestamp, with a per-process sequence number breaking ties.

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod verify;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tour_core::{AssetId, BlobKey, RenderMode};
use tracing::warn;

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

/// The five provenance record types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordType {
    /// A source asset was ingested.
    Upload,
    /// A conversion produced an output artifact.
    Conversion,
    /// A QA report passed its thresholds.
    QaPass,
    /// A file was checked against an expected digest.
    IntegrityCheck,
    /// An asset was accessed.
    Access,
}

/// Typed payload per record type.  Serialises to the wire-level JSON map the
/// sinks persist.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ProvenanceDetails {
    /// Payload of an `upload` record.
    Upload {
        /// Blob key the source was stored under.
        source_key: BlobKey,
        /// SHA-256 of the uploaded bytes.
        source_digest: String,
        /// Upload size in bytes.
        source_size: u64,
    },
    /// Payload of a `conversion` record.
    Conversion {
        /// SHA-256 of the converted output.
        output_digest: String,
        /// Output size in bytes.
        output_size: u64,
        /// Converter version string.
        converter_version: String,
        /// Iterations the converter ran with.
        iterations: u32,
        /// Conversion wall-clock time in milliseconds.
        elapsed_ms: u64,
    },
    /// Payload of a `qa_pass` record.
    QaPass {
        /// Aggregate QA score.
        score: f64,
        /// Frames rendered along the canonical path.
        frames_rendered: usize,
        /// Frames that met both thresholds.
        frames_passed: usize,
        /// Renderer mode used.
        mode: RenderMode,
    },
    /// Payload of an `integrity_check` record.
    IntegrityCheck {
        /// What was checked (e.g. `"source"`, `"output"`).
        file_type: String,
        /// Expected hex digest.
        expected: String,
        /// Computed hex digest, when the file was readable.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        actual: Option<String>,
        /// Whether expected and actual matched.
        checksum_match: bool,
    },
    /// Payload of an `access` record.
    Access {
        /// What kind of access occurred (e.g. `"download"`).
        action: String,
        /// The key that was accessed.
        key: BlobKey,
    },
}

impl ProvenanceDetails {
    /// The record type this payload belongs to.
    pub fn record_type(&self) -> RecordType {
        match self {
            Self::Upload { .. } => RecordType::Upload,
            Self::Conversion { .. } => RecordType::Conversion,
            Self::QaPass { .. } => RecordType::QaPass,
            Self::IntegrityCheck { .. } => RecordType::IntegrityCheck,
            Self::Access { .. } => RecordType::Access,
        }
    }
}

/// One append-only provenance record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProvenanceRecord {
    /// Record type discriminator.
    pub record_type: RecordType,
    /// The asset the event belongs to.
    pub asset_id: AssetId,
    /// When the event was emitted.
    pub timestamp: DateTime<Utc>,
    /// Per-process emission counter; breaks timestamp ties.
    pub sequence: u64,
    /// Acting principal, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actor_id: Option<String>,
    /// Acting principal's email, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actor_email: Option<String>,
    /// Typed payload.
    pub details: ProvenanceDetails,
}

// ---------------------------------------------------------------------------
// Sinks
// ---------------------------------------------------------------------------

/// Destination for provenance records.
///
/// Implementations must be fast enough to call inline from the conversion
/// path; anything slow should buffer internally.
pub trait ProvenanceSink: Send + Sync {
    /// Persist one record.
    fn emit(&self, record: &ProvenanceRecord) -> std::io::Result<()>;
}

/// In-memory sink for tests and inspection.
#[derive(Debug, Default)]
pub struct MemorySink {
    records: Mutex<Vec<ProvenanceRecord>>,
}

impl MemorySink {
    /// Create an empty sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of all emitted records, in emission order.
    pub fn records(&self) -> Vec<ProvenanceRecord> {
        self.records.lock().expect("sink lock poisoned").clone()
    }

    /// All records of one type, in emission order.
    pub fn records_of(&self, record_type: RecordType) -> Vec<ProvenanceRecord> {
        self.records()
            .into_iter()
            .filter(|r| r.record_type == record_type)
            .collect()
    }

    /// Number of emitted records.
    pub fn len(&self) -> usize {
        self.records.lock().expect("sink lock poisoned").len()
    }

    /// Whether nothing has been emitted.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ProvenanceSink for MemorySink {
    fn emit(&self, record: &ProvenanceRecord) -> std::io::Result<()> {
        self.records
            .lock()
            .expect("sink lock poisoned")
            .push(record.clone());
        Ok(())
    }
}

/// Append-only JSONL file sink.
#[derive(Debug)]
pub struct JsonlSink {
    file: Mutex<File>,
}

impl JsonlSink {
    /// Open (or create) the ledger file in append mode.
    pub fn open(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)?;
        Ok(Self {
            file: Mutex::new(file),
        })
    }
}

impl ProvenanceSink for JsonlSink {
    fn emit(&self, record: &ProvenanceRecord) -> std::io::Result<()> {
        let line = serde_json::to_string(record).map_err(std::io::Error::other)?;
        let mut file = self.file.lock().expect("sink lock poisoned");
        writeln!(file, "{line}")
    }
}

// ---------------------------------------------------------------------------
// Ledger
// ---------------------------------------------------------------------------

/// Stamps and emits provenance records.
///
/// The ledger owns the monotonic sequence counter; clones share it.
#[derive(Clone)]
pub struct Ledger {
    sink: Arc<dyn ProvenanceSink>,
    sequence: Arc<AtomicU64>,
}

impl Ledger {
    /// Create a ledger writing to `sink`.
    pub fn new(sink: Arc<dyn ProvenanceSink>) -> Self {
        Self {
            sink,
            sequence: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Emit a record for `asset_id` with the given payload.
    ///
    /// Best-effort: sink failures are logged and swallowed.
    pub fn emit(&self, asset_id: AssetId, details: ProvenanceDetails) {
        self.emit_as(asset_id, details, None, None);
    }

    /// Emit with an acting principal attached.
    pub fn emit_as(
        &self,
        asset_id: AssetId,
        details: ProvenanceDetails,
        actor_id: Option<String>,
        actor_email: Option<String>,
    ) {
        let record = ProvenanceRecord {
            record_type: details.record_type(),
            asset_id,
            timestamp: Utc::now(),
            sequence: self.sequence.fetch_add(1, Ordering::SeqCst),
            actor_id,
            actor_email,
            details,
        };
        if let Err(e) = self.sink.emit(&record) {
            warn!(
                target: "tour.provenance",
                asset_id = %asset_id,
                record_type = ?record.record_type,
                error = %e,
                "provenance emission failed; continuing"
            );
        }
    }

    /// Emit an `upload` record.
    pub fn record_upload(
        &self,
        asset_id: AssetId,
        source_key: BlobKey,
        source_digest: String,
        source_size: u64,
    ) {
        self.emit(
            asset_id,
            ProvenanceDetails::Upload {
                source_key,
                source_digest,
                source_size,
            },
        );
    }

    /// Emit an `access` record.
    pub fn record_access(&self, asset_id: AssetId, action: impl Into<String>, key: BlobKey) {
        self.emit(
            asset_id,
            ProvenanceDetails::Access {
                action: action.into(),
                key,
            },
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn asset() -> AssetId {
        "00000000-0000-4000-8000-0000000000aa".parse().unwrap()
    }

    fn upload_details() -> ProvenanceDetails {
        ProvenanceDetails::Upload {
            source_key: BlobKey::new("tours/NYC/a/input.ply"),
            source_digest: "ab".repeat(32),
            source_size: 1024,
        }
    }

    #[test]
    fn record_type_derived_from_details() {
        assert_eq!(upload_details().record_type(), RecordType::Upload);
        assert_eq!(
            ProvenanceDetails::Access {
                action: "download".into(),
                key: BlobKey::new("k"),
            }
            .record_type(),
            RecordType::Access
        );
    }

    #[test]
    fn ledger_assigns_monotonic_sequence() {
        let sink = Arc::new(MemorySink::new());
        let ledger = Ledger::new(sink.clone());
        for _ in 0..5 {
            ledger.emit(asset(), upload_details());
        }
        let seqs: Vec<u64> = sink.records().iter().map(|r| r.sequence).collect();
        assert_eq!(seqs, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn clones_share_the_sequence_counter() {
        let sink = Arc::new(MemorySink::new());
        let ledger = Ledger::new(sink.clone());
        let clone = ledger.clone();
        ledger.emit(asset(), upload_details());
        clone.emit(asset(), upload_details());
        let seqs: Vec<u64> = sink.records().iter().map(|r| r.sequence).collect();
        assert_eq!(seqs, vec![0, 1]);
    }

    #[test]
    fn sink_failure_is_swallowed() {
        struct FailingSink;
        impl ProvenanceSink for FailingSink {
            fn emit(&self, _record: &ProvenanceRecord) -> std::io::Result<()> {
                Err(std::io::Error::other("sink down"))
            }
        }
        let ledger = Ledger::new(Arc::new(FailingSink));
        // Must not panic or propagate.
        ledger.emit(asset(), upload_details());
    }

    #[test]
    fn jsonl_sink_appends_one_line_per_record() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ledger.jsonl");
        let sink = Arc::new(JsonlSink::open(&path).unwrap());
        let ledger = Ledger::new(sink);
        ledger.emit(asset(), upload_details());
        ledger.emit(
            asset(),
            ProvenanceDetails::QaPass {
                score: 0.97,
                frames_rendered: 10,
                frames_passed: 10,
                mode: RenderMode::Mock,
            },
        );

        let contents = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 2);
        let first: ProvenanceRecord = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first.record_type, RecordType::Upload);
        let second: ProvenanceRecord = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(second.record_type, RecordType::QaPass);
        assert_eq!(second.sequence, 1);
    }

    #[test]
    fn typed_helpers_emit_matching_record_types() {
        let sink = Arc::new(MemorySink::new());
        let ledger = Ledger::new(sink.clone());
        ledger.record_upload(asset(), BlobKey::new("k"), "ab".repeat(32), 64);
        ledger.record_access(asset(), "download", BlobKey::new("k"));
        assert_eq!(sink.records_of(RecordType::Upload).len(), 1);
        assert_eq!(sink.records_of(RecordType::Access).len(), 1);
    }

    #[test]
    fn record_serde_roundtrip() {
        let record = ProvenanceRecord {
            record_type: RecordType::Conversion,
            asset_id: asset(),
            timestamp: Utc::now(),
            sequence: 7,
            actor_id: Some("worker-1".into()),
            actor_email: None,
            details: ProvenanceDetails::Conversion {
                output_digest: "cd".repeat(32),
                output_size: 2048,
                converter_version: "splat-transform/2.1.0".into(),
                iterations: 30_000,
                elapsed_ms: 1234,
            },
        };
        let json = serde_json::to_string(&record).unwrap();
        let back: ProvenanceRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(back, record);
    }
}
