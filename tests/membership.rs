//! Membership Integration Tests
//!
//! Statistical checks on the delivered-identity filter, directly and
//! through a persist/reload cycle of the progress tracker.

use mailferry::core::{MembershipFilter, ProgressTracker, TrackerSettings};
use tempfile::TempDir;

fn identity(i: u64) -> String {
    format!("<{:016x}.{}@mail.example.com>", i.wrapping_mul(0x9e37_79b9_7f4a_7c15), i)
}

#[test]
fn test_false_positive_rate_near_target() {
    let capacity = 100_000u64;
    let target = 0.001;
    let mut filter = MembershipFilter::with_estimates(capacity, target);

    for i in 0..capacity {
        filter.insert(&identity(i));
    }

    let samples = 100_000u64;
    let false_positives = (capacity..capacity + samples)
        .filter(|i| filter.contains(&identity(*i)))
        .count() as f64;
    let observed = false_positives / samples as f64;

    // ~100 expected; generous bounds keep this deterministic in practice
    assert!(observed < target * 3.0, "observed rate {}", observed);
    assert!(observed > target / 5.0, "observed rate {}", observed);
}

#[test]
fn test_no_false_negatives_after_reload() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("big.pst.import-state.json");
    let settings = TrackerSettings {
        capacity: 20_000,
        ..Default::default()
    };

    {
        let mut tracker =
            ProgressTracker::begin_with(path.clone(), "fp", "ann", settings.clone()).unwrap();
        for i in 0..20_000 {
            tracker.mark_delivered(&identity(i));
        }
        tracker.persist().unwrap();
    }

    let tracker = ProgressTracker::begin_with(path, "fp", "ann", settings).unwrap();
    assert!(tracker.is_resuming());
    assert!((0..20_000).all(|i| tracker.is_delivered(&identity(i))));

    // Repeat marks never inflate the count beyond the distinct identities
    let (delivered, _) = tracker.progress();
    assert!(delivered <= 20_000);
    assert!(delivered > 19_900);
}

#[test]
fn test_fresh_tracker_reports_nothing_delivered() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("new.pst.import-state.json");

    let tracker =
        ProgressTracker::begin_with(path, "fp", "ann", TrackerSettings::default()).unwrap();
    assert!(!tracker.is_resuming());
    assert!((0..1_000).all(|i| !tracker.is_delivered(&identity(i))));
}
