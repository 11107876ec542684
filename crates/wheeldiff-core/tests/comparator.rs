//! Comparator behaviour on realistic pytest transcripts.

use wheeldiff_core::{Channel, CompareFlags, LineComparator, OutputComparator};

const BASELINE: &str = "\
============================= test session starts ==============================
platform linux -- Python 3.11.4, pytest-7.4.0, pluggy-1.2.0
rootdir: <env>/idna
collected 64 items

tests/test_idna.py ........................................              [ 62%]
tests/test_intranges.py ........................                          [100%]

============================== 64 passed in 0.41s ==============================
";

#[test]
fn identical_runs_modulo_timing_match() {
    let optimized = BASELINE.replace("0.41s", "2.07s");
    let diff = LineComparator::new()
        .unwrap()
        .compare(Channel::Stdout, BASELINE, &optimized, CompareFlags::default())
        .unwrap();
    assert!(diff.is_empty(), "unexpected diff:\n{diff}");
}

#[test]
fn failing_test_in_optimized_build_is_reported() {
    let optimized = BASELINE
        .replace(
            "tests/test_intranges.py ........................ ",
            "tests/test_intranges.py .......F................ ",
        )
        .replace("64 passed", "1 failed, 63 passed");
    let diff = LineComparator::new()
        .unwrap()
        .compare(Channel::Stdout, BASELINE, &optimized, CompareFlags::default())
        .unwrap();
    assert!(!diff.is_empty());
    assert!(diff.as_str().contains("+tests/test_intranges.py .......F"));
    assert!(diff.as_str().contains("1 failed, 63 passed"));
}

#[test]
fn stderr_warnings_do_not_count_as_divergence() {
    let baseline = "";
    let optimized = "<env>/lib/python3.11/site-packages/idna/core.py:12: DeprecationWarning: x\n";
    let diff = LineComparator::new()
        .unwrap()
        .compare(Channel::Stderr, baseline, optimized, CompareFlags::default())
        .unwrap();
    assert!(diff.is_empty(), "unexpected diff:\n{diff}");
}
