//! Unified error taxonomy for the tour conversion pipeline.
//!
//! Every pipeline error carries an [`ErrorKind`] (which decides whether the
//! queue may retry the job), a stable machine-readable code string, a
//! human-readable message, an optional cause chain, and arbitrary key-value
//! context.  Use the builder returned by [`PipelineError::new`] to construct
//! errors fluently.

#![deny(unsafe_code)]
#![warn(missing_docs)]

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

// ---------------------------------------------------------------------------
// ErrorKind
// ---------------------------------------------------------------------------

/// Broad family an error belongs to.  The kind is what the worker inspects to
/// decide between re-queueing with backoff and recording a terminal failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Blob get/put, digest, or working-directory I/O failed.
    Io,
    /// The external splat-transform process exited non-zero.
    ConverterFailed,
    /// The QA report did not meet the required threshold.  Conversions are
    /// deterministic, so re-running produces the same result.
    QaFailed,
    /// Malformed input: non-WebP buffer, length-mismatched hash, etc.
    Validation,
    /// A frame renderer failed to produce an image.
    Rendering,
    /// Submission rejected before enqueue; the caller retries with its own
    /// policy.
    Backpressure,
    /// Catch-all for unexpected conditions in the orchestrator.
    Unexpected,
}

impl ErrorKind {
    /// Whether the queue's retry policy applies to this kind.
    pub fn retryable(&self) -> bool {
        match self {
            Self::Io | Self::ConverterFailed | Self::Unexpected => true,
            Self::QaFailed | Self::Validation | Self::Rendering | Self::Backpressure => false,
        }
    }

    /// Stable `&'static str` representation (e.g. `"qa_failed"`).
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Io => "io",
            Self::ConverterFailed => "converter_failed",
            Self::QaFailed => "qa_failed",
            Self::Validation => "validation",
            Self::Rendering => "rendering",
            Self::Backpressure => "backpressure",
            Self::Unexpected => "unexpected",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// PipelineError
// ---------------------------------------------------------------------------

/// Unified pipeline error.
///
/// Carries an [`ErrorKind`], a stable code string, a human-readable message,
/// an optional source error for cause-chaining, and arbitrary structured
/// context.
///
/// # Builder usage
///
/// ```
/// use tour_error::{ErrorKind, PipelineError};
///
/// let err = PipelineError::new(ErrorKind::Io, "BLOB_GET_FAILED", "download failed")
///     .with_context("key", "tours/NYC/abc/input.ply")
///     .with_context("attempt", 2);
/// assert!(err.retryable());
/// ```
pub struct PipelineError {
    /// Taxonomy kind.
    pub kind: ErrorKind,
    /// Stable machine-readable code (SCREAMING_SNAKE_CASE).
    pub code: &'static str,
    /// Human-readable description.
    pub message: String,
    /// Optional underlying cause.
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
    /// Arbitrary structured context for diagnostics.
    pub context: BTreeMap<String, serde_json::Value>,
}

impl PipelineError {
    /// Create a new error with the given kind, code, and message.
    pub fn new(kind: ErrorKind, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            kind,
            code,
            message: message.into(),
            source: None,
            context: BTreeMap::new(),
        }
    }

    /// Shorthand for an [`ErrorKind::Io`] error.
    pub fn io(code: &'static str, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Io, code, message)
    }

    /// Shorthand for an [`ErrorKind::Validation`] error.
    pub fn validation(code: &'static str, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Validation, code, message)
    }

    /// Shorthand for an [`ErrorKind::Rendering`] error.
    pub fn rendering(code: &'static str, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Rendering, code, message)
    }

    /// Attach a key-value pair to the diagnostic context.
    ///
    /// The value is converted via [`serde_json::to_value`]; if serialisation
    /// fails, the entry is silently skipped.
    pub fn with_context(mut self, key: impl Into<String>, value: impl Serialize) -> Self {
        if let Ok(v) = serde_json::to_value(value) {
            self.context.insert(key.into(), v);
        }
        self
    }

    /// Attach an underlying cause.
    pub fn with_source(mut self, source: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.source = Some(Box::new(source));
        self
    }

    /// Shorthand for `self.kind.retryable()`.
    pub fn retryable(&self) -> bool {
        self.kind.retryable()
    }
}

impl fmt::Debug for PipelineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut d = f.debug_struct("PipelineError");
        d.field("kind", &self.kind);
        d.field("code", &self.code);
        d.field("message", &self.message);
        if let Some(ref src) = self.source {
            d.field("source", &src.to_string());
        }
        if !self.context.is_empty() {
            d.field("context", &self.context);
        }
        d.finish()
    }
}

impl fmt::Display for PipelineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)?;
        if !self.context.is_empty() {
            // Deterministic output thanks to BTreeMap.
            if let Ok(ctx) = serde_json::to_string(&self.context) {
                write!(f, " {ctx}")?;
            }
        }
        Ok(())
    }
}

impl std::error::Error for PipelineError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source
            .as_ref()
            .map(|e| e.as_ref() as &(dyn std::error::Error + 'static))
    }
}

/// Convenience result type for pipeline operations.
pub type Result<T> = std::result::Result<T, PipelineError>;

// ---------------------------------------------------------------------------
// Serialization support
// ---------------------------------------------------------------------------

/// Serialisable snapshot of a [`PipelineError`], embedded in conversion
/// results (without the opaque source).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ErrorRecord {
    /// Taxonomy kind.
    pub kind: ErrorKind,
    /// Stable machine-readable code.
    pub code: String,
    /// Human-readable message.
    pub message: String,
    /// Whether the queue may retry the job.
    pub retryable: bool,
    /// Structured context.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub details: BTreeMap<String, serde_json::Value>,
}

impl From<&PipelineError> for ErrorRecord {
    fn from(err: &PipelineError) -> Self {
        let mut details = err.context.clone();
        if let Some(ref src) = err.source {
            details.insert("cause".into(), serde_json::Value::String(src.to_string()));
        }
        Self {
            kind: err.kind,
            code: err.code.to_string(),
            message: err.message.clone(),
            retryable: err.retryable(),
            details,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    const ALL_KINDS: &[ErrorKind] = &[
        ErrorKind::Io,
        ErrorKind::ConverterFailed,
        ErrorKind::QaFailed,
        ErrorKind::Validation,
        ErrorKind::Rendering,
        ErrorKind::Backpressure,
        ErrorKind::Unexpected,
    ];

    #[test]
    fn basic_construction() {
        let err = PipelineError::new(ErrorKind::Unexpected, "INTERNAL", "boom");
        assert_eq!(err.kind, ErrorKind::Unexpected);
        assert_eq!(err.code, "INTERNAL");
        assert_eq!(err.message, "boom");
        assert!(err.source.is_none());
        assert!(err.context.is_empty());
    }

    #[test]
    fn retryability_table() {
        assert!(ErrorKind::Io.retryable());
        assert!(ErrorKind::ConverterFailed.retryable());
        assert!(ErrorKind::Unexpected.retryable());
        assert!(!ErrorKind::QaFailed.retryable());
        assert!(!ErrorKind::Validation.retryable());
        assert!(!ErrorKind::Rendering.retryable());
        assert!(!ErrorKind::Backpressure.retryable());
    }

    #[test]
    fn display_without_context() {
        let err = PipelineError::io("BLOB_GET_FAILED", "no such key");
        assert_eq!(err.to_string(), "[BLOB_GET_FAILED] no such key");
    }

    #[test]
    fn display_with_context() {
        let err = PipelineError::io("DIGEST_READ_FAILED", "read failed").with_context("size", 4096);
        let s = err.to_string();
        assert!(s.starts_with("[DIGEST_READ_FAILED] read failed"));
        assert!(s.contains("size"));
        assert!(s.contains("4096"));
    }

    #[test]
    fn builder_with_source() {
        let src = io::Error::new(io::ErrorKind::NotFound, "file missing");
        let err = PipelineError::io("INPUT_MISSING", "input gone").with_source(src);
        assert!(err.source.is_some());
        let displayed = err.source.as_ref().unwrap().to_string();
        assert_eq!(displayed, "file missing");
    }

    #[test]
    fn std_error_source_chain() {
        let inner = io::Error::new(io::ErrorKind::BrokenPipe, "pipe broke");
        let err = PipelineError::io("PUT_FAILED", "upload").with_source(inner);
        let src = std::error::Error::source(&err).unwrap();
        assert_eq!(src.to_string(), "pipe broke");
    }

    #[test]
    fn kind_serde_roundtrip() {
        for kind in ALL_KINDS {
            let json = serde_json::to_string(kind).unwrap();
            let back: ErrorKind = serde_json::from_str(&json).unwrap();
            assert_eq!(back, *kind);
        }
        assert_eq!(
            serde_json::to_string(&ErrorKind::QaFailed).unwrap(),
            r#""qa_failed""#
        );
    }

    #[test]
    fn kind_display_matches_as_str() {
        for kind in ALL_KINDS {
            assert_eq!(kind.to_string(), kind.as_str());
        }
    }

    #[test]
    fn record_captures_retryability_and_cause() {
        let src = io::Error::other("underlying");
        let err = PipelineError::new(ErrorKind::QaFailed, "QA_BELOW_THRESHOLD", "score 0.70")
            .with_context("score", 0.70)
            .with_source(src);
        let rec = ErrorRecord::from(&err);
        assert_eq!(rec.code, "QA_BELOW_THRESHOLD");
        assert!(!rec.retryable);
        assert_eq!(rec.details["score"], serde_json::json!(0.70));
        assert_eq!(rec.details["cause"], serde_json::json!("underlying"));
    }

    #[test]
    fn record_serde_roundtrip() {
        let err = PipelineError::validation("WEBP_LOSSY", "must be lossless");
        let rec = ErrorRecord::from(&err);
        let json = serde_json::to_string(&rec).unwrap();
        let back: ErrorRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(rec, back);
    }
}
