//! Failure extraction from validation script output.
//!
//! Matching is literal. A block opens on a trimmed line starting
//! with `Test`, and the block failed only if one of its lines contains
//! `FAIL: <exact start line>`. Loosening either rule changes which sub-tests
//! get reported.

use std::collections::BTreeMap;

const SUBTEST_PREFIX: &str = "Test";
const FAIL_MARKER: &str = "FAIL: ";

/// Map each failed sub-test (its trimmed start line) to its log excerpt.
pub fn parse_failed_tests(output: &str) -> BTreeMap<String, String> {
    let mut failed = BTreeMap::new();
    let mut current: Option<(String, Vec<&str>)> = None;

    for line in output.split('\n') {
        let trimmed = line.trim();
        if is_subtest_start(trimmed) {
            if let Some((name, block)) = current.take() {
                close_block(name, &block, &mut failed);
            }
            current = Some((trimmed.to_string(), vec![line]));
        } else if let Some((_, block)) = current.as_mut() {
            block.push(line);
        }
    }

    if let Some((name, block)) = current {
        close_block(name, &block, &mut failed);
    }

    failed
}

fn is_subtest_start(trimmed: &str) -> bool {
    trimmed.starts_with(SUBTEST_PREFIX) && trimmed.len() > SUBTEST_PREFIX.len()
}

fn close_block(name: String, block: &[&str], failed: &mut BTreeMap<String, String>) {
    let needle = format!("{}{}", FAIL_MARKER, name);
    if block.iter().any(|l| l.contains(&needle)) {
        failed.insert(name, block.join("\n"));
    }
}
