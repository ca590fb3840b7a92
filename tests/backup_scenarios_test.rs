//! End-to-end scenarios for the backup pipeline, covering the literal
//! cases enumerated in the engine's specification: a fresh multi-
//! destination backup, skip-on-rerun, quarantine-on-divergence, and
//! permanent-failure isolation across destinations.

use imageintact_core::coordinator::{BackupCoordinator, DestinationSpec, SessionOutcome};
use imageintact_core::fileops::FileOps;
use imageintact_core::queue::{DestinationClass, FileOutcome};
use imageintact_core::retry::RetryPolicy;
use imageintact_core::scanner::ScanOptions;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;

fn spec(name: &str, root: &Path) -> DestinationSpec {
    DestinationSpec {
        name: name.to_string(),
        root: root.to_path_buf(),
        organization_name: String::new(),
        class: DestinationClass::Local,
        worker_count: 4,
        network_destination: false,
    }
}

fn coordinator(source: &Path, destinations: Vec<DestinationSpec>) -> BackupCoordinator {
    BackupCoordinator::new(
        source.to_path_buf(),
        destinations,
        ScanOptions::default(),
        50,
        false,
        false,
        Arc::new(FileOps::default()),
        RetryPolicy::default(),
        None,
        "1.0.0-test",
        false,
    )
    .unwrap()
}

/// Scenario 1: a fresh three-file backup to two empty destinations lands
/// byte-identical copies everywhere and writes one COPIED CSV row per
/// file per destination.
#[tokio::test]
async fn fresh_backup_replicates_and_writes_copied_manifest_rows() {
    let source = TempDir::new().unwrap();
    let d1 = TempDir::new().unwrap();
    let d2 = TempDir::new().unwrap();

    fs::write(source.path().join("a.jpg"), b"aaaaaaaaaa").unwrap();
    fs::write(source.path().join("b.jpg"), b"bbbbb").unwrap();
    fs::create_dir_all(source.path().join("sub")).unwrap();
    fs::write(source.path().join("sub/c.jpg"), b"ccc").unwrap();

    let outcome = coordinator(source.path(), vec![spec("D1", d1.path()), spec("D2", d2.path())])
        .run()
        .await
        .unwrap();

    assert_eq!(outcome.outcome, SessionOutcome::Completed);
    assert!(outcome.warning.is_none());

    for dest_dir in [d1.path(), d2.path()] {
        assert_eq!(fs::read(dest_dir.join("a.jpg")).unwrap(), b"aaaaaaaaaa");
        assert_eq!(fs::read(dest_dir.join("b.jpg")).unwrap(), b"bbbbb");
        assert_eq!(fs::read(dest_dir.join("sub/c.jpg")).unwrap(), b"ccc");

        let checksums_dir = dest_dir.join(".imageintact_checksums");
        let manifest_files: Vec<_> = fs::read_dir(&checksums_dir).unwrap().collect();
        assert_eq!(manifest_files.len(), 1, "exactly one manifest CSV per session");

        let content = fs::read_to_string(manifest_files[0].as_ref().unwrap().path()).unwrap();
        assert_eq!(content.lines().count(), 4); // header + 3 rows
        assert_eq!(content.matches(",COPIED,").count(), 3);
    }

    assert!(outcome.destinations.iter().all(|d| d
        .results
        .iter()
        .all(|r| r.outcome == FileOutcome::Copied)));
}

/// Scenario 2: repeating an unchanged backup performs zero copies; every
/// row in the new manifest CSV is SKIPPED.
#[tokio::test]
async fn rerun_on_unchanged_source_skips_every_file() {
    let source = TempDir::new().unwrap();
    let dest = TempDir::new().unwrap();
    fs::write(source.path().join("a.jpg"), b"aaaaaaaaaa").unwrap();
    fs::write(source.path().join("b.jpg"), b"bbbbb").unwrap();

    coordinator(source.path(), vec![spec("D1", dest.path())])
        .run()
        .await
        .unwrap();

    let outcome = coordinator(source.path(), vec![spec("D1", dest.path())])
        .run()
        .await
        .unwrap();

    assert_eq!(outcome.outcome, SessionOutcome::Completed);
    assert!(outcome.destinations[0]
        .results
        .iter()
        .all(|r| r.outcome == FileOutcome::Skipped));

    let checksums_dir = dest.path().join(".imageintact_checksums");
    let manifest_files: Vec<_> = fs::read_dir(&checksums_dir).unwrap().collect();
    // two sessions, two manifest files, the second all-SKIPPED
    assert_eq!(manifest_files.len(), 2);
}

/// Scenario 3: a destination file diverged from the source between runs
/// is quarantined with its original content preserved, and the source
/// content lands in its place.
#[tokio::test]
async fn divergent_destination_file_is_quarantined_on_rerun() {
    let source = TempDir::new().unwrap();
    let d1 = TempDir::new().unwrap();
    let d2 = TempDir::new().unwrap();
    fs::write(source.path().join("a.jpg"), b"aaaaaaaaaa").unwrap();

    coordinator(source.path(), vec![spec("D1", d1.path()), spec("D2", d2.path())])
        .run()
        .await
        .unwrap();

    fs::write(d1.path().join("a.jpg"), b"zzzzzzzzzz").unwrap();

    let outcome = coordinator(source.path(), vec![spec("D1", d1.path()), spec("D2", d2.path())])
        .run()
        .await
        .unwrap();

    assert_eq!(outcome.outcome, SessionOutcome::Completed);
    assert_eq!(fs::read(d1.path().join("a.jpg")).unwrap(), b"aaaaaaaaaa");

    let quarantine_dir = d1.path().join(".imageintact_quarantine");
    let quarantined: Vec<_> = fs::read_dir(&quarantine_dir).unwrap().collect();
    assert_eq!(quarantined.len(), 1);
    assert_eq!(
        fs::read(quarantined[0].as_ref().unwrap().path()).unwrap(),
        b"zzzzzzzzzz"
    );

    let d1_manifest_dir = d1.path().join(".imageintact_checksums");
    let manifest_files: Vec<_> = fs::read_dir(&d1_manifest_dir).unwrap().collect();
    let second_session_entry = manifest_files
        .iter()
        .find(|e| {
            e.as_ref()
                .unwrap()
                .file_name()
                .to_string_lossy()
                .contains(&outcome.session_id)
        })
        .unwrap();
    let second_session_content =
        fs::read_to_string(second_session_entry.as_ref().unwrap().path()).unwrap();
    assert!(second_session_content.contains("QUARANTINED"));
    assert!(second_session_content.contains("COPIED"));

    // D2 never diverged: every row on its second-session manifest is SKIPPED.
    let d2_manifest_dir = d2.path().join(".imageintact_checksums");
    let d2_manifests: Vec<_> = fs::read_dir(&d2_manifest_dir).unwrap().collect();
    assert_eq!(d2_manifests.len(), 2);
}

/// Scenario 6: a permanent per-file failure on one destination does not
/// halt the run; other destinations and other files on the same
/// destination still complete.
#[tokio::test]
async fn permanent_failure_on_one_destination_does_not_halt_others() {
    let source = TempDir::new().unwrap();
    let d1 = TempDir::new().unwrap();
    let d2 = TempDir::new().unwrap();
    fs::write(source.path().join("a.jpg"), b"aaaaaaaaaa").unwrap();
    fs::create_dir_all(source.path().join("nested")).unwrap();
    fs::write(source.path().join("nested/b.jpg"), b"bbbbb").unwrap();

    // On D2, "nested" already exists as a plain file, so creating the
    // parent directory nested/b.jpg would need fails with ENOTDIR
    // regardless of caller privileges, without touching a.jpg's outcome.
    fs::write(d2.path().join("nested"), b"occupied").unwrap();

    let outcome = coordinator(source.path(), vec![spec("D1", d1.path()), spec("D2", d2.path())])
        .run()
        .await
        .unwrap();

    assert_eq!(outcome.outcome, SessionOutcome::CompletedWithErrors);

    let d1_outcome = outcome.destinations.iter().find(|d| d.name == "D1").unwrap();
    assert!(d1_outcome.results.iter().all(|r| r.outcome == FileOutcome::Copied));

    let d2_outcome = outcome.destinations.iter().find(|d| d.name == "D2").unwrap();
    let a_result = d2_outcome.results.iter().find(|r| r.relative_path == "a.jpg").unwrap();
    assert_eq!(a_result.outcome, FileOutcome::Copied);
    let b_result = d2_outcome
        .results
        .iter()
        .find(|r| r.relative_path == "nested/b.jpg")
        .unwrap();
    assert!(matches!(b_result.outcome, FileOutcome::Failed(_)));
}

/// Empty source tree completes immediately with no manifest rows written
/// to any destination, and the coordinator still reports a `completed`
/// session (with a warning, not a failure).
#[tokio::test]
async fn empty_source_completes_with_zero_files() {
    let source = TempDir::new().unwrap();
    let dest = TempDir::new().unwrap();

    let outcome = coordinator(source.path(), vec![spec("D1", dest.path())])
        .run()
        .await
        .unwrap();

    assert_eq!(outcome.outcome, SessionOutcome::Completed);
    assert_eq!(outcome.warning.as_deref(), Some("source manifest was empty"));
    assert_eq!(outcome.destinations[0].results.len(), 0);
    assert!(!dest.path().join(".imageintact_checksums").exists());
}
