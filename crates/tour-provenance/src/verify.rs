// SPDX-License-Identifier: MIT OR Apache-2.0
//! Provenance-structure and file-integrity verification.

use crate::{Ledger, ProvenanceDetails};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tour_core::{AssetId, BlobKey};

// ---------------------------------------------------------------------------
// Structural verification
// ---------------------------------------------------------------------------

/// The provenance fields accumulated against one asset, as loaded from the
/// sink.  Everything is optional; verification decides what is required.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AssetProvenance {
    /// Blob key of the uploaded source.
    pub source_key: Option<BlobKey>,
    /// SHA-256 of the uploaded source.
    pub source_digest: Option<String>,
    /// Source size in bytes.
    pub source_size: Option<u64>,
    /// Blob key of the converted output, when conversion ran.
    pub output_key: Option<BlobKey>,
    /// SHA-256 of the converted output.
    pub output_digest: Option<String>,
    /// Converter version that produced the output.
    pub converter_version: Option<String>,
    /// Aggregate QA score of the accepted conversion.
    pub qa_score: Option<f64>,
    /// Principal that uploaded the source.
    pub uploader_id: Option<String>,
    /// When the source was uploaded.
    pub uploaded_at: Option<DateTime<Utc>>,
}

/// One named verification check and its outcome.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProvenanceCheck {
    /// Check name.
    pub name: String,
    /// Whether the check passed.
    pub passed: bool,
}

/// Result of [`verify_provenance`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProvenanceVerification {
    /// `false` when any required field is missing.
    pub valid: bool,
    /// Required fields that were absent.
    pub missing_fields: Vec<String>,
    /// Advisory problems that do not invalidate the chain.
    pub warnings: Vec<String>,
    /// Every check that ran, in order.
    pub checks: Vec<ProvenanceCheck>,
}

/// Verify that an asset's provenance structure is complete.
///
/// `source_key`, `source_digest` and `source_size` are hard requirements.
/// When an output is present its digest is also required; a missing converter
/// version or QA score only warns.  Missing uploader identity or upload time
/// warns but never fails.
pub fn verify_provenance(provenance: &AssetProvenance) -> ProvenanceVerification {
    let mut missing_fields = Vec::new();
    let mut warnings = Vec::new();
    let mut checks = Vec::new();

    let mut require = |name: &str, present: bool, missing: &mut Vec<String>| {
        checks.push(ProvenanceCheck {
            name: name.to_string(),
            passed: present,
        });
        if !present {
            missing.push(name.to_string());
        }
    };

    require("source_key", provenance.source_key.is_some(), &mut missing_fields);
    require(
        "source_digest",
        provenance.source_digest.is_some(),
        &mut missing_fields,
    );
    require(
        "source_size",
        provenance.source_size.is_some(),
        &mut missing_fields,
    );

    if provenance.output_key.is_some() {
        require(
            "output_digest",
            provenance.output_digest.is_some(),
            &mut missing_fields,
        );
        if provenance.converter_version.is_none() {
            warnings.push("output present but converter_version is unrecorded".to_string());
        }
        if provenance.qa_score.is_none() {
            warnings.push("output present but qa_score is unrecorded".to_string());
        }
    }

    if provenance.uploader_id.is_none() {
        warnings.push("uploader_id is unrecorded".to_string());
    }
    if provenance.uploaded_at.is_none() {
        warnings.push("uploaded_at is unrecorded".to_string());
    }

    ProvenanceVerification {
        valid: missing_fields.is_empty(),
        missing_fields,
        warnings,
        checks,
    }
}

// ---------------------------------------------------------------------------
// File integrity
// ---------------------------------------------------------------------------

/// Outcome of one integrity check against an expected digest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntegrityCheck {
    /// Whether the file was readable and matched.
    pub valid: bool,
    /// Whether computed and expected digests matched.
    pub checksum_match: bool,
    /// The expected hex digest.
    pub expected: String,
    /// The computed hex digest, when the file was readable.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actual: Option<String>,
    /// Read failure, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Digest `path` and compare against `expected_hex`, emitting an
/// `integrity_check` provenance record regardless of outcome.
pub fn verify_integrity(
    ledger: &Ledger,
    asset_id: AssetId,
    file_type: &str,
    path: &Path,
    expected_hex: &str,
) -> IntegrityCheck {
    let check = match tour_digest::digest_file(path) {
        Ok(digest) => {
            let matched = digest.hex.eq_ignore_ascii_case(expected_hex);
            IntegrityCheck {
                valid: matched,
                checksum_match: matched,
                expected: expected_hex.to_string(),
                actual: Some(digest.hex),
                error: None,
            }
        }
        Err(e) => IntegrityCheck {
            valid: false,
            checksum_match: false,
            expected: expected_hex.to_string(),
            actual: None,
            error: Some(e.to_string()),
        },
    };

    ledger.emit(
        asset_id,
        ProvenanceDetails::IntegrityCheck {
            file_type: file_type.to_string(),
            expected: check.expected.clone(),
            actual: check.actual.clone(),
            checksum_match: check.checksum_match,
        },
    );
    check
}

/// Async wrapper around [`verify_integrity`]; the digest runs on the
/// blocking pool.
pub async fn verify_integrity_async(
    ledger: &Ledger,
    asset_id: AssetId,
    file_type: &str,
    path: &Path,
    expected_hex: &str,
) -> IntegrityCheck {
    let ledger = ledger.clone();
    let file_type = file_type.to_string();
    let path = path.to_path_buf();
    let expected = expected_hex.to_string();
    tokio::task::spawn_blocking(move || {
        verify_integrity(&ledger, asset_id, &file_type, &path, &expected)
    })
    .await
    .unwrap_or_else(|e| IntegrityCheck {
        valid: false,
        checksum_match: false,
        expected: expected_hex.to_string(),
        actual: None,
        error: Some(format!("integrity task failed to join: {e}")),
    })
}
