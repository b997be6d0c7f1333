mod common;

use common::{pattern_image, png_bytes};
use macropilot::{DriftVerdict, LearningStore, Rect, StrategyKind};
use std::path::Path;

fn open_store(root: &Path, threshold: u64, min_fresh: usize) -> LearningStore {
    LearningStore::new(
        &root.join("learning"),
        &root.join("templates"),
        threshold,
        min_fresh,
        25.0,
    )
    .unwrap()
}

fn rect_at(x: f64, y: f64) -> Rect {
    Rect {
        x,
        y,
        width: 32.0,
        height: 32.0,
    }
}

fn record(
    store: &LearningStore,
    target: &str,
    succeeded: bool,
    rect: Rect,
) -> macropilot::learning::AttemptOutcome {
    let crop = png_bytes(&pattern_image(32, 32));
    store
        .record_attempt(
            target,
            succeeded,
            Some((crop.as_slice(), rect)),
            StrategyKind::TemplateMatch,
            "test",
        )
        .unwrap()
}

#[test]
fn accuracy_is_successes_over_total() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(dir.path(), 1000, 3);

    record(&store, "save", true, rect_at(10.0, 10.0));
    record(&store, "save", true, rect_at(10.0, 10.0));
    record(&store, "save", false, rect_at(10.0, 10.0));

    let stats = store.stats("save").unwrap();
    assert_eq!(stats.total_attempts, 3);
    assert_eq!(stats.successful_attempts, 2);
    assert_eq!(stats.failed_attempts, 1);
    assert!((stats.accuracy - 2.0 / 3.0).abs() < 1e-9);
    assert!(stats.last_success_at.is_some());
    assert!(stats.last_failure_at.is_some());
}

#[test]
fn retrain_fires_exactly_once_per_threshold_crossing() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(dir.path(), 3, 2);

    assert!(record(&store, "save", true, rect_at(10.0, 10.0)).retrain.is_none());
    assert!(record(&store, "save", true, rect_at(10.0, 10.0)).retrain.is_none());
    let third = record(&store, "save", true, rect_at(10.0, 10.0));
    let report = third.retrain.expect("third attempt crosses the threshold");
    assert_eq!(report.consumed, 3);
    assert_eq!(report.fresh_successes, 3);

    // Same total again: already consumed, nothing fires.
    assert!(store.maybe_retrain("save").unwrap().is_none());

    assert!(record(&store, "save", false, rect_at(10.0, 10.0)).retrain.is_none());
    assert!(record(&store, "save", false, rect_at(10.0, 10.0)).retrain.is_none());
    let sixth = record(&store, "save", false, rect_at(12.0, 10.0));
    assert!(sixth.retrain.is_some());

    assert_eq!(store.stats("save").unwrap().retrain_cycles, 2);
}

#[test]
fn retrain_synthesizes_a_canonical_template() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(dir.path(), 3, 2);

    for _ in 0..3 {
        record(&store, "submit", true, rect_at(40.0, 20.0));
    }
    let report = store.stats("submit").unwrap();
    assert_eq!(report.retrain_cycles, 1);

    let template_path = dir.path().join("templates").join("submit.png");
    assert!(template_path.exists());
    let template = image::open(&template_path).unwrap();
    assert_eq!((template.width(), template.height()), (64, 64));
}

#[test]
fn too_few_fresh_successes_leave_the_template_alone() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(dir.path(), 2, 3);

    record(&store, "submit", true, rect_at(40.0, 20.0));
    let second = record(&store, "submit", true, rect_at(40.0, 20.0));
    let report = second.retrain.expect("threshold crossed");
    assert!(!report.template_updated);
    assert!(!dir.path().join("templates").join("submit.png").exists());
}

#[test]
fn clustered_failures_read_as_relocation() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(dir.path(), 3, 10);

    record(&store, "save", false, rect_at(100.0, 100.0));
    record(&store, "save", false, rect_at(104.0, 102.0));
    let third = record(&store, "save", false, rect_at(98.0, 101.0));
    let report = third.retrain.unwrap();
    assert_eq!(report.drift, Some(DriftVerdict::Relocated));
}

#[test]
fn scattered_failures_read_as_instability() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(dir.path(), 3, 10);

    record(&store, "save", false, rect_at(0.0, 0.0));
    record(&store, "save", false, rect_at(500.0, 10.0));
    let third = record(&store, "save", false, rect_at(20.0, 600.0));
    let report = third.retrain.unwrap();
    assert_eq!(report.drift, Some(DriftVerdict::Unstable));
}

#[test]
fn single_failure_says_nothing_about_drift() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(dir.path(), 2, 10);

    record(&store, "save", true, rect_at(10.0, 10.0));
    let second = record(&store, "save", false, rect_at(10.0, 10.0));
    let report = second.retrain.unwrap();
    assert_eq!(report.drift, None);
}

#[test]
fn the_attempt_log_survives_a_reopen() {
    let dir = tempfile::tempdir().unwrap();
    {
        let store = open_store(dir.path(), 3, 2);
        for _ in 0..3 {
            record(&store, "save", true, rect_at(10.0, 10.0));
        }
        record(&store, "save", false, rect_at(10.0, 10.0));
    }

    let reopened = open_store(dir.path(), 3, 2);
    let stats = reopened.stats("save").unwrap();
    assert_eq!(stats.total_attempts, 4);
    assert_eq!(stats.successful_attempts, 3);

    // The retrain cycle marked its inputs consumed, durably.
    let attempts = reopened.attempts_for("save");
    assert_eq!(attempts.len(), 4);
    assert_eq!(
        attempts.iter().filter(|a| a.consumed_for_training).count(),
        3
    );

    // Retrain bookkeeping came back too.
    assert_eq!(stats.retrain_cycles, 1);
    assert!(stats.last_retrain_at.is_some());
}

#[test]
fn a_reopen_does_not_refire_a_consumed_threshold_crossing() {
    let dir = tempfile::tempdir().unwrap();
    {
        let store = open_store(dir.path(), 3, 2);
        for _ in 0..3 {
            record(&store, "save", true, rect_at(10.0, 10.0));
        }
        assert_eq!(store.stats("save").unwrap().retrain_cycles, 1);
    }

    // The total still sits exactly on the threshold multiple; the
    // crossing was already consumed before the reopen.
    let reopened = open_store(dir.path(), 3, 2);
    assert!(reopened.maybe_retrain("save").unwrap().is_none());
    let stats = reopened.stats("save").unwrap();
    assert_eq!(stats.retrain_cycles, 1);
    assert!(stats.last_retrain_at.is_some());
}
