use std::path::{Path, PathBuf};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

use treedb_core::{
    status_code, AccessCoordinator, Config, Error, ManualClock, MemoryBackend, MemoryNodeStore,
    NodeId, SessionId, StoreBackend, SystemClock, TableSummary,
};
use treedb_test_support::{init_logging, named};

fn coordinator(clock: &ManualClock) -> AccessCoordinator<MemoryBackend, ManualClock> {
    init_logging();
    AccessCoordinator::new(
        MemoryBackend,
        clock.clone(),
        Duration::from_secs(60),
        PathBuf::from("/srv/treedb"),
    )
}

fn config(path: &str) -> Config {
    Config::new(path, "tree_nodes")
}

#[test]
fn forced_takeover_expires_previous_holder() {
    let clock = ManualClock::default();
    let coord = coordinator(&clock);
    let first = coord.open_session(config("data/a.sqlite"), false).unwrap();

    let err = coord.open_session(config("data/a.sqlite"), false).unwrap_err();
    assert_eq!(
        err,
        Error::Conflict {
            held_by: first.session_id.clone()
        }
    );
    assert_eq!(status_code(&err), 409);

    let second = coord.open_session(config("data/a.sqlite"), true).unwrap();
    assert!(matches!(
        coord.authorize(&first.session_id),
        Err(Error::Expired(_))
    ));
    assert!(coord.authorize(&second.session_id).is_ok());
    let err = coord
        .with_resource(&first.session_id, |tree| tree.list_all())
        .unwrap_err();
    assert_eq!(status_code(&err), 410);
}

#[test]
fn concurrent_opens_leave_one_holder() {
    init_logging();
    let coord = Arc::new(AccessCoordinator::new(
        MemoryBackend,
        SystemClock,
        Duration::from_secs(60),
        PathBuf::from("/srv/treedb"),
    ));
    let threads = 8;
    let barrier = Arc::new(Barrier::new(threads));
    let handles: Vec<_> = (0..threads)
        .map(|_| {
            let coord = Arc::clone(&coord);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                coord.open_session(config("data/a.sqlite"), false)
            })
        })
        .collect();
    let results: Vec<_> = handles
        .into_iter()
        .map(|handle| handle.join().unwrap())
        .collect();

    let winners: Vec<SessionId> = results
        .iter()
        .filter_map(|r| r.as_ref().ok().map(|s| s.session_id.clone()))
        .collect();
    assert_eq!(winners.len(), 1);
    for err in results.iter().filter_map(|r| r.as_ref().err()) {
        assert_eq!(
            err,
            &Error::Conflict {
                held_by: winners[0].clone()
            }
        );
    }
    assert_eq!(coord.list_sessions().len(), 1);
}

#[test]
fn relative_and_absolute_paths_name_the_same_resource() {
    let clock = ManualClock::default();
    let coord = coordinator(&clock);
    coord.open_session(config("data/a.sqlite"), false).unwrap();
    let err = coord
        .open_session(config("/srv/treedb/data/../data/a.sqlite"), false)
        .unwrap_err();
    assert!(matches!(err, Error::Conflict { .. }));
}

#[test]
fn takeover_keeps_the_resource_store() {
    let clock = ManualClock::default();
    let coord = coordinator(&clock);
    let first = coord.open_session(config("data/a.sqlite"), false).unwrap();
    let node = coord
        .with_resource(&first.session_id, |tree| tree.insert(named("kept")))
        .unwrap();

    let second = coord.open_session(config("data/a.sqlite"), true).unwrap();
    let seen = coord
        .with_resource(&second.session_id, |tree| tree.get(node.id))
        .unwrap();
    assert_eq!(seen, node);
}

#[test]
fn idle_session_expires_and_activity_renews_it() {
    let clock = ManualClock::default();
    let coord = coordinator(&clock);
    let session = coord.open_session(config("data/a.sqlite"), false).unwrap();

    clock.advance(chrono::Duration::seconds(50));
    coord
        .with_resource(&session.session_id, |tree| tree.list_all())
        .unwrap();
    clock.advance(chrono::Duration::seconds(50));
    assert!(coord.authorize(&session.session_id).is_ok());

    clock.advance(chrono::Duration::seconds(61));
    let err = coord
        .with_resource(&session.session_id, |tree| tree.get(NodeId(1)))
        .unwrap_err();
    assert!(matches!(err, Error::Expired(_)));
    assert!(coord.open_session(config("data/a.sqlite"), false).is_ok());
}

#[test]
fn sweep_reports_idle_sessions() {
    let clock = ManualClock::default();
    let coord = coordinator(&clock);
    let a = coord.open_session(config("data/a.sqlite"), false).unwrap();
    clock.advance(chrono::Duration::seconds(30));
    let b = coord.open_session(config("data/b.sqlite"), false).unwrap();
    clock.advance(chrono::Duration::seconds(40));

    assert_eq!(coord.sweep(), vec![a.session_id]);
    let live: Vec<SessionId> = coord
        .list_sessions()
        .into_iter()
        .map(|s| s.session_id)
        .collect();
    assert_eq!(live, vec![b.session_id]);
}

#[test]
fn update_session_rebinds_and_frees_the_old_resource() {
    let clock = ManualClock::default();
    let coord = coordinator(&clock);
    let session = coord.open_session(config("data/a.sqlite"), false).unwrap();

    let update = coord
        .update_session(&session.session_id, config("data/b.sqlite"), false)
        .unwrap();
    assert!(!update.created);
    assert_eq!(update.session.session_id, session.session_id);
    assert_eq!(
        update.session.config.data_source_path,
        PathBuf::from("/srv/treedb/data/b.sqlite")
    );
    assert!(coord.open_session(config("data/a.sqlite"), false).is_ok());
}

#[test]
fn update_of_unknown_session_needs_force() {
    let clock = ManualClock::default();
    let coord = coordinator(&clock);
    let ghost = SessionId::from("ghost");

    let err = coord
        .update_session(&ghost, config("data/a.sqlite"), false)
        .unwrap_err();
    assert_eq!(status_code(&err), 410);

    let update = coord
        .update_session(&ghost, config("data/a.sqlite"), true)
        .unwrap();
    assert!(update.created);
    assert_ne!(update.session.session_id, ghost);
}

#[test]
fn close_session_is_idempotent() {
    let clock = ManualClock::default();
    let coord = coordinator(&clock);
    let session = coord.open_session(config("data/a.sqlite"), false).unwrap();
    assert!(coord.close_session(&session.session_id));
    assert!(!coord.close_session(&session.session_id));
    assert!(coord.open_session(config("data/a.sqlite"), false).is_ok());
}

#[test]
fn invalid_config_claims_nothing() {
    let clock = ManualClock::default();
    let coord = coordinator(&clock);
    let err = coord
        .open_session(Config::new("data/a.sqlite", "  "), false)
        .unwrap_err();
    assert_eq!(status_code(&err), 400);
    assert!(coord.list_sessions().is_empty());
}

/// Refuses to open tables called `broken` and id columns called `missing`.
struct PickyBackend;

impl StoreBackend for PickyBackend {
    type Store = MemoryNodeStore;

    fn open(&self, config: &Config) -> treedb_core::Result<MemoryNodeStore> {
        if config.table_name == "broken" {
            return Err(Error::Store("disk I/O error".into()));
        }
        if config.id_field == "missing" {
            return Err(Error::Validation("id column missing not found".into()));
        }
        MemoryBackend.open(config)
    }

    fn list_tables(&self, path: &Path) -> treedb_core::Result<Vec<TableSummary>> {
        MemoryBackend.list_tables(path)
    }
}

fn picky() -> AccessCoordinator<PickyBackend, ManualClock> {
    init_logging();
    AccessCoordinator::new(
        PickyBackend,
        ManualClock::default(),
        Duration::from_secs(60),
        PathBuf::from("/srv/treedb"),
    )
}

#[test]
fn failed_open_releases_the_claim() {
    let coord = picky();
    let broken = Config::new("data/a.sqlite", "broken");
    let err = coord.open_session(broken.clone(), false).unwrap_err();
    assert_eq!(status_code(&err), 500);
    assert!(coord.list_sessions().is_empty());

    let session = coord.open_session(config("data/a.sqlite"), false).unwrap();
    let err = coord
        .update_session(&session.session_id, broken, false)
        .unwrap_err();
    assert!(matches!(err, Error::Store(_)));
    let kept = coord.authorize(&session.session_id).unwrap();
    assert_eq!(kept.table_name, "tree_nodes");
}

#[test]
fn failed_forced_open_keeps_the_holder() {
    let coord = picky();
    let holder = coord.open_session(config("data/a.sqlite"), false).unwrap();
    let node = coord
        .with_resource(&holder.session_id, |tree| tree.insert(named("kept")))
        .unwrap();

    let mut remapped = config("data/a.sqlite");
    remapped.id_field = "missing".into();
    let err = coord.open_session(remapped.clone(), true).unwrap_err();
    assert_eq!(status_code(&err), 400);

    let live = coord.list_sessions();
    assert_eq!(live.len(), 1);
    assert_eq!(live[0].session_id, holder.session_id);
    let seen = coord
        .with_resource(&holder.session_id, |tree| tree.get(node.id))
        .unwrap();
    assert_eq!(seen, node);

    let other = coord.open_session(config("data/b.sqlite"), false).unwrap();
    let err = coord
        .update_session(&other.session_id, remapped, true)
        .unwrap_err();
    assert_eq!(status_code(&err), 400);
    assert!(coord.authorize(&holder.session_id).is_ok());
    assert!(coord.authorize(&other.session_id).is_ok());
}

#[test]
fn every_error_has_a_status() {
    let cases = [
        (Error::Validation("x".into()), 400),
        (Error::NotFound("x".into()), 404),
        (
            Error::Cycle {
                node: NodeId(1),
                parent: NodeId(2),
            },
            409,
        ),
        (
            Error::Conflict {
                held_by: SessionId::from("s"),
            },
            409,
        ),
        (Error::Expired("x".into()), 410),
        (Error::Store("x".into()), 500),
        (
            Error::RenumberAborted {
                parent: "node 1".into(),
                phase: 2,
                reason: "x".into(),
            },
            500,
        ),
    ];
    for (err, status) in cases {
        assert_eq!(status_code(&err), status, "{err}");
    }
}
