//! Output line classification for inference server logs.
//!
//! llama-server writes every request to stderr, so a plain "does it mention
//! error" test would flood the error log during normal use. A line is only
//! error-level when it carries failure vocabulary *and* does not match one of
//! the known-benign shapes.

use regex::Regex;
use std::sync::LazyLock;

static FAILURE_VOCABULARY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)error|fail|exception|fatal|panic|crash").expect("valid failure regex")
});

static BENIGN_SHAPES: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        // llama-server request log: `request: POST /v1/embeddings 127.0.0.1 200`
        r"(?i)request:\s+(GET|POST|OPTIONS|HEAD)\s+\S+\s+\S+\s+[23]\d\d\b",
        // access-log style: `"POST /rerank HTTP/1.1" 200`
        r#""(GET|POST|OPTIONS|HEAD) [^"]*" [23]\d\d\b"#,
        // health polling
        r"(?i)/health\b.*\b200\b",
        // per-request timing summaries
        r"(?i)\bprint_timings\b",
        // counters that happen to mention errors
        r"(?i)\b(n_)?errors?\s*[=:]\s*0\b",
    ]
    .iter()
    .map(|p| Regex::new(p).expect("valid benign regex"))
    .collect()
});

/// Severity assigned to one line of process output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineLevel {
    Info,
    Error,
}

/// Classify a single output line.
pub fn classify_line(line: &str) -> LineLevel {
    if !FAILURE_VOCABULARY.is_match(line) {
        return LineLevel::Info;
    }
    if BENIGN_SHAPES.iter().any(|shape| shape.is_match(line)) {
        return LineLevel::Info;
    }
    LineLevel::Error
}
