// SPDX-License-Identifier: MIT OR Apache-2.0
//! Driver for the external `splat-transform` process.
//!
//! The binary is resolved once at startup: an explicit override, well-known
//! install locations, then `PATH`; failing all of those, the driver falls
//! back to the package runner with a logged warning.  Every invocation pins
//! `SPLAT_SEED=42` so converter output is deterministic — the property the
//! whole QA and retry design leans on.  This layer applies no timeout; the
//! worker owns the outer deadline.

#![deny(unsafe_code)]
#![warn(missing_docs)]

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::process::Command;
use tour_core::BinaryMode;
use tour_error::{PipelineError, Result};
use tracing::{debug, info, warn};

/// Environment variable overriding binary resolution entirely.
pub const BINARY_OVERRIDE_ENV: &str = "TOUR_SPLAT_TRANSFORM";

/// Seed pinned into every converter invocation.
pub const SPLAT_SEED: &str = "42";

/// Package-runner fallback invocation.
const PACKAGE_RUNNER: &str = "npx @playcanvas/splat-transform";

/// Well-known install locations probed before `PATH`.
const WELL_KNOWN_PATHS: &[&str] = &[
    "/usr/local/bin/splat-transform",
    "/opt/splat/bin/splat-transform",
    "./node_modules/.bin/splat-transform",
];

// ---------------------------------------------------------------------------
// Binary resolution
// ---------------------------------------------------------------------------

/// How the converter executable was located.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BinaryResolution {
    /// Local executable or package-runner fallback.
    pub mode: BinaryMode,
    /// The invocation path (a file path, or the full runner command line).
    pub path: String,
}

impl BinaryResolution {
    /// A resolution pointing at a concrete local executable.
    pub fn local(path: impl Into<String>) -> Self {
        Self {
            mode: BinaryMode::Local,
            path: path.into(),
        }
    }
}

/// Probe for the converter binary.
///
/// Order: [`BINARY_OVERRIDE_ENV`], well-known install paths, `PATH`.  When
/// nothing is found the package runner is used and a warning is logged —
/// conversions still work, just with `npx` startup cost on every job.
pub fn resolve_binary() -> BinaryResolution {
    resolve_binary_with(std::env::var(BINARY_OVERRIDE_ENV).ok().as_deref())
}

/// Resolution with an explicit override (the env-free core of
/// [`resolve_binary`]).
pub fn resolve_binary_with(override_path: Option<&str>) -> BinaryResolution {
    if let Some(path) = override_path
        && !path.is_empty()
    {
        info!(target: "tour.convert", %path, "converter binary from override");
        return BinaryResolution::local(path);
    }

    for candidate in WELL_KNOWN_PATHS {
        if Path::new(candidate).is_file() {
            info!(target: "tour.convert", path = candidate, "converter binary from install path");
            return BinaryResolution::local(*candidate);
        }
    }

    if let Some(found) = which("splat-transform") {
        let path = found.to_string_lossy().into_owned();
        info!(target: "tour.convert", %path, "converter binary from PATH");
        return BinaryResolution::local(path);
    }

    warn!(
        target: "tour.convert",
        runner = PACKAGE_RUNNER,
        "no local splat-transform binary found; falling back to the package runner"
    );
    BinaryResolution {
        mode: BinaryMode::PackageRunner,
        path: PACKAGE_RUNNER.to_string(),
    }
}

fn which(bin: &str) -> Option<PathBuf> {
    let path = std::env::var_os("PATH")?;
    for p in std::env::split_paths(&path) {
        let candidate = p.join(bin);
        if candidate.is_file() {
            return Some(candidate);
        }
    }
    None
}

// ---------------------------------------------------------------------------
// Invocation
// ---------------------------------------------------------------------------

/// One conversion request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConvertRequest {
    /// Staged PLY input.
    pub input_path: PathBuf,
    /// Where the SOG output must be written.
    pub output_path: PathBuf,
    /// Optimisation iterations.
    pub iterations: u32,
    /// Pass `--verbose` to the converter.
    pub verbose: bool,
}

/// Captured outcome of one converter run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConvertOutcome {
    /// The process exited with status 0.
    pub ok: bool,
    /// Exit code, when the process exited normally.
    pub exit_code: Option<i32>,
    /// Captured stdout.
    pub stdout: String,
    /// Captured stderr.
    pub stderr: String,
    /// Wall-clock duration.
    #[serde(with = "tour_core::serde_duration_millis")]
    pub elapsed: Duration,
    /// Whether a non-zero exit looks transient (signal-terminated or
    /// `EX_TEMPFAIL`).  Diagnostic only; retry policy treats every converter
    /// failure as retryable.
    pub transient: bool,
}

/// Exit codes that indicate a transient termination: SIGKILL- and
/// SIGTERM-style shell codes plus `EX_TEMPFAIL`.
fn is_transient_exit(code: i32) -> bool {
    matches!(code, 137 | 143 | 75)
}

/// The resolved converter plus its reported version.
#[derive(Debug, Clone)]
pub struct ConverterDriver {
    resolution: BinaryResolution,
    version: String,
}

impl ConverterDriver {
    /// Resolve the binary and build a driver.
    pub fn new() -> Self {
        Self::with_resolution(resolve_binary())
    }

    /// Build a driver around an explicit resolution (tests, config pinning).
    pub fn with_resolution(resolution: BinaryResolution) -> Self {
        Self {
            resolution,
            version: "splat-transform/unknown".to_string(),
        }
    }

    /// Set the converter version string recorded in results and baselines.
    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    /// The cached resolution, included verbatim in run provenance.
    pub fn resolution(&self) -> &BinaryResolution {
        &self.resolution
    }

    /// The converter version string.
    pub fn version(&self) -> &str {
        &self.version
    }

    /// Run one conversion.
    ///
    /// Fails with an `Io` error (without spawning) when the input file does
    /// not exist; creates the output directory; otherwise reports the exit
    /// through [`ConvertOutcome`] rather than an error so callers see
    /// captured output either way.
    pub async fn run(&self, req: &ConvertRequest) -> Result<ConvertOutcome> {
        if !tokio::fs::try_exists(&req.input_path).await.unwrap_or(false) {
            return Err(PipelineError::io(
                "CONVERT_INPUT_MISSING",
                format!("input file does not exist: {}", req.input_path.display()),
            ));
        }
        if let Some(parent) = req.output_path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                PipelineError::io("CONVERT_OUTPUT_DIR", "could not create output directory")
                    .with_source(e)
            })?;
        }

        let mut cmd = self.command();
        cmd.arg(&req.input_path)
            .arg("-o")
            .arg(&req.output_path)
            .arg("-i")
            .arg(req.iterations.to_string())
            .arg("--format")
            .arg("sog");
        if req.verbose {
            cmd.arg("--verbose");
        }
        cmd.env("SPLAT_SEED", SPLAT_SEED)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        debug!(
            target: "tour.convert",
            input = %req.input_path.display(),
            output = %req.output_path.display(),
            iterations = req.iterations,
            binary = %self.resolution.path,
            "spawning converter"
        );

        let started = Instant::now();
        let output = cmd.output().await.map_err(|e| {
            PipelineError::new(
                tour_error::ErrorKind::ConverterFailed,
                "CONVERT_SPAWN_FAILED",
                format!("could not spawn {}", self.resolution.path),
            )
            .with_source(e)
        })?;
        let elapsed = started.elapsed();

        let exit_code = output.status.code();
        let outcome = ConvertOutcome {
            ok: output.status.success(),
            exit_code,
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            elapsed,
            transient: exit_code.is_some_and(is_transient_exit),
        };

        if outcome.ok {
            debug!(
                target: "tour.convert",
                elapsed_ms = elapsed.as_millis() as u64,
                "converter finished"
            );
        } else {
            warn!(
                target: "tour.convert",
                exit_code = ?outcome.exit_code,
                transient = outcome.transient,
                stderr = %outcome.stderr.trim(),
                "converter failed"
            );
        }
        Ok(outcome)
    }

    fn command(&self) -> Command {
        match self.resolution.mode {
            BinaryMode::Local => Command::new(&self.resolution.path),
            BinaryMode::PackageRunner => {
                // The runner path is a command line: program plus leading args.
                let mut parts = self.resolution.path.split_whitespace();
                let program = parts.next().unwrap_or("npx");
                let mut cmd = Command::new(program);
                cmd.args(parts);
                cmd
            }
        }
    }
}

impl Default for ConverterDriver {
    fn default() -> Self {
        Self::new()
    }
}
