//! The compiled step model. A script compiles to a `Vec<ParsedStep>`;
//! `Repeat` and `TryCatch` nest further step lists, so arbitrary
//! nesting falls out of the type. Variable macros never appear here:
//! the compiler expands them fully before the runner sees a step.

use crate::collaborators::ScrollDirection;
use std::time::Duration;

/// Everything a click step needs to locate and act on its target.
#[derive(Debug, Clone, PartialEq)]
pub struct ClickSpec {
    /// Canonical target name after de-aliasing, or a literal pass-through.
    pub target: String,
    /// How many clicks to deliver.
    pub repeat_count: u32,
    /// Delay between repeated clicks.
    pub interval: Duration,
    /// When true, poll the resolver until the target appears or
    /// `timeout` elapses instead of resolving once.
    pub wait_for_appear: bool,
    pub timeout: Duration,
    /// Per-step confidence threshold; `None` uses the configured default.
    pub match_threshold: Option<f64>,
    /// Which deduplicated candidate to act on, best-first (0 = best).
    pub match_index: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DomOp {
    Click,
    Type,
    Extract,
}

/// Operations delegated wholesale to an external collaborator.
#[derive(Debug, Clone, PartialEq)]
pub enum ExternalOp {
    /// Browser-DOM operation through the automation driver.
    Dom {
        op: DomOp,
        selector: String,
        text: Option<String>,
        /// Session variable to bind extracted text to.
        bind: Option<String>,
    },
    /// OCR text extraction from a resolved on-screen region.
    Ocr { target: String, bind: String },
    /// AI text generation from a prompt.
    Generate { prompt: String, bind: String },
}

#[derive(Debug, Clone, PartialEq)]
pub enum ParsedStep {
    Click(ClickSpec),
    Type {
        text: String,
    },
    Wait {
        duration: Duration,
    },
    Key {
        name: String,
    },
    Hotkey {
        keys: Vec<String>,
    },
    Scroll {
        direction: ScrollDirection,
        amount: i32,
        repeat_count: u32,
    },
    Repeat {
        count: u32,
        body: Vec<ParsedStep>,
    },
    TryCatch {
        body: Vec<ParsedStep>,
        recovery: Vec<ParsedStep>,
    },
    SystemCommand {
        name: String,
        args: Vec<String>,
    },
    External(ExternalOp),
    /// Stop executing the rest of the script without failing it.
    SkipRemaining,
}

/// Parses durations like `2s`, `500ms`, `1.5s`, or a bare number of
/// seconds. Negative, non-finite, and overflowing values all parse to
/// `None`.
pub fn parse_duration(s: &str) -> Option<Duration> {
    let s = s.trim();
    if let Some(ms) = s.strip_suffix("ms") {
        let value: f64 = ms.trim().parse().ok()?;
        return Duration::try_from_secs_f64(value / 1000.0).ok();
    }
    let secs = s.strip_suffix('s').unwrap_or(s);
    let value: f64 = secs.trim().parse().ok()?;
    Duration::try_from_secs_f64(value).ok()
}
