//! Turns the status lines of external tools into progress samples.
//!
//! Tools like `dd status=progress` periodically print a line such as
//! `52428800 bytes (52 MB, 50 MiB) copied, 1 s, 52 MB/s`. Only the leading
//! byte count matters here; rate and elapsed fields are ignored.
use regex::Regex;
use std::sync::LazyLock;

static BYTES_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\d+) +bytes\b").expect("static regex is valid"));

/// Extracts the byte count from one status line.
///
/// Returns `None` if the line carries no `<N> bytes` token, or if `N` does not
/// fit in a `u64`.
pub fn parse_bytes(line: &str) -> Option<u64> {
    BYTES_RE
        .captures(line)
        .and_then(|caps| caps.get(1))
        .and_then(|m| m.as_str().parse::<u64>().ok())
}

/// One progress observation, placed within its pass sequence.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ProgressSample {
    /// Bytes the tool reports as transferred so far in this pass.
    pub bytes: u64,
    /// Expected size of this pass in bytes, or 0 if unknown.
    pub total: u64,
    /// 0-based index of the pass that produced this sample.
    pub pass: usize,
    /// Number of passes in the sequence (1 for single-shot operations).
    pub pass_count: usize,
}

impl ProgressSample {
    pub fn new(bytes: u64, total: u64) -> Self {
        Self {
            bytes,
            total,
            pass: 0,
            pass_count: 1,
        }
    }

    /// Places this sample at `pass` of `pass_count`.
    pub fn in_pass(self, pass: usize, pass_count: usize) -> Self {
        Self {
            pass,
            pass_count,
            ..self
        }
    }

    /// Completion of the current pass, clamped to `[0, 100]`.
    ///
    /// The total is often a stale estimate, so overshoot is clamped rather
    /// than reported.
    pub fn percentage(&self) -> Option<f64> {
        if self.total == 0 {
            return None;
        }
        let pct = self.bytes as f64 * 100.0 / self.total as f64;
        Some(pct.min(100.0))
    }

    /// Completion of the whole sequence: `(pass * 100 + pass_pct) / pass_count`.
    pub fn overall_percentage(&self) -> Option<f64> {
        let pass_pct = self.percentage()?;
        let count = self.pass_count.max(1) as f64;
        Some(((self.pass as f64 * 100.0 + pass_pct) / count).min(100.0))
    }
}
