//! Test-count extraction from runner output.
//!
//! Recognises the summary lines of pytest, jest and `cargo test`. Output
//! with no recognisable summary yields `None`, which the report treats as
//! zero tests run.

use regex::Regex;
use std::sync::OnceLock;

use unitrun_core::TestCounts;

macro_rules! cached_regex {
    ($name:ident, $pattern:expr) => {
        fn $name() -> Option<&'static Regex> {
            static RE: OnceLock<Option<Regex>> = OnceLock::new();
            RE.get_or_init(|| Regex::new($pattern).ok()).as_ref()
        }
    };
}

cached_regex!(
    cargo_re,
    r"test result: \w+\. (\d+) passed; (\d+) failed; (\d+) ignored"
);
cached_regex!(jest_re, r"(?m)^Tests:\s+(.+)$");
cached_regex!(pytest_re, r"(?m)^[=\s]*((?:\d+ [a-z]+(?:, )?)+) in [\d.]+s");
cached_regex!(part_re, r"(\d+) ([a-z]+)");

/// Parse counts from combined stdout/stderr. `cargo test` summaries are
/// summed across test binaries; for jest and pytest the last summary wins.
pub fn parse_test_counts(output: &str) -> Option<TestCounts> {
    let mut cargo: Option<TestCounts> = None;
    for caps in cargo_re()?.captures_iter(output) {
        let n = |i: usize| caps[i].parse::<u64>().unwrap_or(0);
        cargo
            .get_or_insert_with(TestCounts::default)
            .merge(&TestCounts::new(n(1), n(2), n(3)));
    }
    if cargo.is_some() {
        return cargo;
    }

    if let Some(caps) = jest_re()?.captures_iter(output).last() {
        return tally(&caps[1]);
    }
    let caps = pytest_re()?.captures_iter(output).last()?;
    tally(&caps[1])
}

fn tally(summary: &str) -> Option<TestCounts> {
    let (mut passed, mut failed, mut skipped) = (0u64, 0u64, 0u64);
    for part in part_re()?.captures_iter(summary) {
        let n = part[1].parse::<u64>().unwrap_or(0);
        match &part[2] {
            "passed" | "xpassed" => passed += n,
            "failed" | "error" | "errors" => failed += n,
            "skipped" | "xfailed" | "todo" | "pending" => skipped += n,
            _ => {}
        }
    }
    Some(TestCounts::new(passed, failed, skipped))
}
