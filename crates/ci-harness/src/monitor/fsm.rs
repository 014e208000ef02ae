//! Multi-line matcher for the unittest summary block.
//!
//! A finished run ends with four consecutive lines:
//!
//! ```text
//! ----------------------------------------------------------------------
//! Ran 5 tests in 1.234s
//!
//! OK
//! ```
//!
//! The last line is `FAILED (errors=N)` (or `failures=`) when tests failed.

use once_cell::sync::Lazy;
use regex::Regex;

static SEPARATOR: Lazy<Regex> = Lazy::new(|| Regex::new(r"^-{70,}$").expect("valid regex"));
static RAN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^Ran \d+ tests? in \d+(\.\d+)?s$").expect("valid regex"));
static BLANK: Lazy<Regex> = Lazy::new(|| Regex::new(r"^$").expect("valid regex"));
static VERDICT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(OK( \(.*\))?|FAILED \(((errors|failures|skipped|expected failures|unexpected successes)=\d+(, )?)+\))$")
        .expect("valid regex")
});

static PATTERNS: Lazy<[&'static Regex; 4]> = Lazy::new(|| [&*SEPARATOR, &*RAN, &*BLANK, &*VERDICT]);

/// Terminal result of a monitored run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorOutcome {
    Success,
    Failure,
    Timeout,
    ParentDied,
    PatternNotFound,
}

/// Cursor over the ordered pattern list.
#[derive(Debug, Default)]
pub struct CompletionMatcher {
    cursor: usize,
}

impl CompletionMatcher {
    pub fn new() -> Self {
        Self::default()
    }

    #[cfg(test)]
    pub fn cursor(&self) -> usize {
        self.cursor
    }

    /// Feed one line, without its trailing newline.
    ///
    /// Returns the verdict once the fourth pattern matches.
    pub fn feed(&mut self, line: &str) -> Option<MonitorOutcome> {
        let line = line.strip_suffix('\r').unwrap_or(line);
        if PATTERNS[self.cursor].is_match(line) {
            self.cursor += 1;
            if self.cursor == PATTERNS.len() {
                self.cursor = 0;
                return Some(if line.starts_with("OK") {
                    MonitorOutcome::Success
                } else {
                    MonitorOutcome::Failure
                });
            }
            return None;
        }

        // resync: a separator can open a new summary on the same line
        self.cursor = usize::from(SEPARATOR.is_match(line));
        None
    }
}
