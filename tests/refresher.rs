mod common;

use anyhow::Result;
use common::{hash, init_tracing, providers, wait_until, FakeProvider, BASE_TIME};
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use vcs_log::storage::InMemoryIndexStore;
use vcs_log::{
    CommitGraphSnapshot, CommitIndexStore, LogConfig, LogRefresher, RefKind, RefresherState,
};

const TIMEOUT: Duration = Duration::from_secs(10);

fn config(recent: usize) -> LogConfig {
    LogConfig {
        recent_commit_count: recent,
        overlay_commit_count: 3,
        dispose_timeout: Duration::from_secs(2),
        ..LogConfig::default()
    }
}

fn setup(fakes: &[Arc<FakeProvider>], config: LogConfig) -> (LogRefresher, Arc<dyn CommitIndexStore>) {
    init_tracing();
    let store: Arc<dyn CommitIndexStore> = Arc::new(InMemoryIndexStore::new());
    let refresher = LogRefresher::new(Arc::new(providers(fakes)), Arc::clone(&store), config);
    (refresher, store)
}

fn settle(refresher: &LogRefresher) {
    wait_until(TIMEOUT, || !refresher.is_busy());
}

fn root(name: &str) -> PathBuf {
    PathBuf::from(format!("/repos/{name}"))
}

#[test]
fn test_initial_load_then_full_reload() -> Result<()> {
    let fake = FakeProvider::linear(root("a"), 50);
    let (refresher, _) = setup(&[fake.clone()], config(10));

    let published = Arc::new(Mutex::new(Vec::new()));
    {
        let published = Arc::clone(&published);
        refresher.subscribe(move |snapshot: &CommitGraphSnapshot| {
            published
                .lock()
                .push((snapshot.commit_count(), snapshot.is_complete()));
        });
    }

    refresher.initialize()?;
    settle(&refresher);

    // recent window first, then the whole history
    assert_eq!(*published.lock(), vec![(10, false), (50, true)]);
    assert_eq!(fake.full_reloads(), 1);
    assert_eq!(refresher.processed_cycles(), 1);
    assert_eq!(refresher.state(), RefresherState::Idle);
    Ok(())
}

#[test]
fn test_initialize_is_idempotent() -> Result<()> {
    let fake = FakeProvider::linear(root("a"), 5);
    let (refresher, _) = setup(&[fake.clone()], config(10));

    refresher.initialize()?;
    refresher.initialize()?;
    settle(&refresher);

    assert_eq!(fake.recent_windows(), vec![10]);
    assert_eq!(fake.full_reloads(), 1);
    Ok(())
}

#[test]
fn test_burst_of_requests_is_coalesced() -> Result<()> {
    let fake = FakeProvider::linear(root("a"), 20);
    let (refresher, _) = setup(&[fake.clone()], config(10));

    fake.set_blocked(true);
    refresher.initialize()?;
    wait_until(TIMEOUT, || fake.is_waiting());

    for _ in 0..5 {
        refresher.refresh([root("a")], false);
    }
    assert!(refresher.is_busy());

    fake.set_blocked(false);
    settle(&refresher);

    assert_eq!(refresher.processed_cycles(), 1);
    assert_eq!(fake.full_reloads(), 1);
    Ok(())
}

#[test]
fn test_refresh_without_changes_is_idempotent() -> Result<()> {
    let fake = FakeProvider::linear(root("a"), 30);
    let (refresher, _) = setup(&[fake.clone()], config(10));
    refresher.initialize()?;
    settle(&refresher);
    let before = refresher.current_snapshot();

    refresher.refresh([root("a")], false);
    settle(&refresher);
    let after = refresher.current_snapshot();

    assert_eq!(refresher.processed_cycles(), 2);
    assert!(after.content_eq(&before));
    // joined incrementally, no second full reload
    assert_eq!(fake.full_reloads(), 1);
    Ok(())
}

#[test]
fn test_connected_window_is_joined() -> Result<()> {
    let fake = FakeProvider::linear(root("a"), 100);
    let (refresher, store) = setup(&[fake.clone()], config(6));
    refresher.initialize()?;
    settle(&refresher);
    assert_eq!(refresher.current_snapshot().commit_count(), 100);

    fake.extend_linear(100, 101);
    refresher.refresh([root("a")], false);
    settle(&refresher);

    let snapshot = refresher.current_snapshot();
    assert_eq!(snapshot.commit_count(), 101);
    assert!(snapshot.is_complete());
    assert_eq!(fake.full_reloads(), 1);

    let newest = store.index_of(&hash(100), &root("a"));
    let data = snapshot.data().expect("loaded");
    assert_eq!(data.graph.position_of(newest), Some(0));
    assert!(data.refs.contains(newest));
    Ok(())
}

#[test]
fn test_gap_retries_then_reloads() -> Result<()> {
    let fake = FakeProvider::linear(root("a"), 50);
    let (refresher, _) = setup(&[fake.clone()], config(2));
    refresher.initialize()?;
    settle(&refresher);
    assert_eq!(fake.full_reloads(), 1);

    // 51 new commits; neither a window of 2 nor of 10 reaches the known history
    fake.extend_linear(50, 101);
    refresher.refresh([root("a")], false);
    settle(&refresher);

    assert_eq!(fake.recent_windows(), vec![2, 2, 10]);
    assert_eq!(fake.full_reloads(), 2);
    let snapshot = refresher.current_snapshot();
    assert_eq!(snapshot.commit_count(), 101);
    assert!(snapshot.is_complete());
    Ok(())
}

#[test]
fn test_retry_with_larger_window_succeeds() -> Result<()> {
    let fake = FakeProvider::linear(root("a"), 50);
    let (refresher, _) = setup(&[fake.clone()], config(2));
    refresher.initialize()?;
    settle(&refresher);

    // 5 new commits: a window of 2 misses the link, a window of 10 covers it
    fake.extend_linear(50, 55);
    refresher.refresh([root("a")], false);
    settle(&refresher);

    assert_eq!(fake.recent_windows(), vec![2, 2, 10]);
    assert_eq!(fake.full_reloads(), 1);
    assert_eq!(refresher.current_snapshot().commit_count(), 55);
    Ok(())
}

#[test]
fn test_deleted_branch_disappears_on_join() -> Result<()> {
    let fake = FakeProvider::linear(root("a"), 10);
    fake.add_commit(100, &[5], BASE_TIME + 10_000);
    fake.set_ref("feature", RefKind::LocalBranch, 100);
    let (refresher, _) = setup(&[fake.clone()], config(20));
    refresher.initialize()?;
    settle(&refresher);
    assert_eq!(refresher.current_snapshot().commit_count(), 11);

    // branch deleted; its only commit is no longer reachable
    fake.remove_ref("feature");
    fake.remove_commit(100);
    refresher.refresh([root("a")], false);
    settle(&refresher);

    assert_eq!(refresher.current_snapshot().commit_count(), 10);
    Ok(())
}

#[test]
fn test_overlay_is_published_before_the_result() -> Result<()> {
    let fake = FakeProvider::linear(root("a"), 40);
    let (refresher, _) = setup(&[fake.clone()], config(10));
    refresher.initialize()?;
    settle(&refresher);

    let published = Arc::new(Mutex::new(Vec::new()));
    {
        let published = Arc::clone(&published);
        refresher.subscribe(move |snapshot: &CommitGraphSnapshot| {
            published
                .lock()
                .push((snapshot.is_overlay(), snapshot.commit_count()));
        });
    }

    fake.extend_linear(40, 41);
    refresher.refresh([root("a")], true);
    settle(&refresher);

    assert_eq!(*published.lock(), vec![(true, 3), (false, 41)]);
    assert!(!refresher.current_snapshot().is_overlay());
    Ok(())
}

#[test]
fn test_failing_root_is_isolated() -> Result<()> {
    let good = FakeProvider::linear(root("a"), 8);
    let bad = FakeProvider::linear(root("b"), 5);
    bad.set_failing(true);
    let (refresher, _) = setup(&[good.clone(), bad.clone()], config(10));

    refresher.initialize()?;
    settle(&refresher);

    let snapshot = refresher.current_snapshot();
    assert!(!snapshot.is_error());
    assert_eq!(snapshot.commit_count(), 8);
    assert!(snapshot.data().unwrap().commits_of(Path::new("/repos/b")).is_empty());
    Ok(())
}

#[test]
fn test_failing_root_keeps_stale_data_on_join() -> Result<()> {
    let a = FakeProvider::linear(root("a"), 8);
    let b = FakeProvider::linear(root("b"), 5);
    let (refresher, _) = setup(&[a.clone(), b.clone()], config(10));
    refresher.initialize()?;
    settle(&refresher);
    assert_eq!(refresher.current_snapshot().commit_count(), 13);

    b.set_failing(true);
    a.extend_linear(8, 9);
    refresher.refresh([root("a"), root("b")], false);
    settle(&refresher);

    let snapshot = refresher.current_snapshot();
    assert_eq!(snapshot.commit_count(), 14);
    assert_eq!(snapshot.data().unwrap().commits_of(Path::new("/repos/b")).len(), 5);
    Ok(())
}

#[test]
fn test_every_root_failing_publishes_error_and_keeps_running() -> Result<()> {
    let fake = FakeProvider::linear(root("a"), 5);
    fake.set_failing(true);
    let (refresher, _) = setup(&[fake.clone()], config(10));

    refresher.initialize()?;
    settle(&refresher);
    assert!(refresher.current_snapshot().is_error());
    assert_eq!(refresher.state(), RefresherState::Error);

    fake.set_failing(false);
    refresher.refresh([root("a")], false);
    settle(&refresher);

    let snapshot = refresher.current_snapshot();
    assert!(snapshot.is_complete());
    assert_eq!(snapshot.commit_count(), 5);
    assert_eq!(refresher.state(), RefresherState::Idle);
    Ok(())
}

#[test]
fn test_dispose_mid_fetch() -> Result<()> {
    let fake = FakeProvider::linear(root("a"), 12);
    let (refresher, _) = setup(&[fake.clone()], config(10));
    refresher.initialize()?;
    settle(&refresher);
    let before = refresher.current_snapshot();

    let errors = Arc::new(AtomicUsize::new(0));
    {
        let errors = Arc::clone(&errors);
        refresher.subscribe(move |snapshot: &CommitGraphSnapshot| {
            if snapshot.is_error() {
                errors.fetch_add(1, Ordering::SeqCst);
            }
        });
    }

    fake.set_blocked(true);
    fake.extend_linear(12, 13);
    refresher.refresh([root("a")], false);
    wait_until(TIMEOUT, || fake.is_waiting());

    refresher.dispose();

    assert!(!refresher.is_busy());
    assert!(refresher.current_snapshot().content_eq(&before));
    assert_eq!(errors.load(Ordering::SeqCst), 0);

    // requests after dispose are ignored
    fake.set_blocked(false);
    refresher.refresh([root("a")], false);
    assert!(!refresher.is_busy());
    assert!(refresher.initialize().is_err());
    Ok(())
}

#[test]
fn test_unknown_roots_are_ignored() -> Result<()> {
    let fake = FakeProvider::linear(root("a"), 3);
    let (refresher, _) = setup(&[fake.clone()], config(10));
    refresher.initialize()?;
    settle(&refresher);

    refresher.refresh([root("missing")], false);
    settle(&refresher);

    assert_eq!(refresher.processed_cycles(), 1);
    assert_eq!(refresher.current_snapshot().commit_count(), 3);
    Ok(())
}
