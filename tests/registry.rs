//! Integration tests for the site registry on a file-backed database
//!
//! Each thread opens its own connection to the same file, the way separate
//! CLI invocations and the admin server would.

use siteport::db::Database;
use siteport::error::RegistryError;
use siteport::registry::{PortRange, SiteRegistry};
use siteport::site::{SiteAction, SiteState};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;
use tempfile::TempDir;

// ============================================================================
// Test Helpers
// ============================================================================

fn create_test_db() -> (PathBuf, TempDir) {
    let tmp = TempDir::new().unwrap();
    let path = tmp.path().join("registry.db");
    // Create schema up front so concurrent openers only connect
    Database::open(&path, Duration::from_secs(10)).unwrap();
    (path, tmp)
}

fn open_registry(path: &Path, ports: PortRange) -> SiteRegistry {
    let db = Database::open(path, Duration::from_secs(10)).unwrap();
    SiteRegistry::new(db, ports)
}

// ============================================================================
// Concurrency
// ============================================================================

#[test]
fn test_concurrent_registrations_get_distinct_ports() {
    let (path, _tmp) = create_test_db();
    let threads = 8;
    let per_thread = 5;
    let barrier = Arc::new(Barrier::new(threads));

    let handles: Vec<_> = (0..threads)
        .map(|t| {
            let path = path.clone();
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                let registry = open_registry(&path, PortRange::new(5000, 6000));
                barrier.wait();
                (0..per_thread)
                    .map(|i| registry.register(&format!("site{}-{}.example.com", t, i)).unwrap().port)
                    .collect::<Vec<u16>>()
            })
        })
        .collect();

    let mut ports: Vec<u16> = handles
        .into_iter()
        .flat_map(|h| h.join().unwrap())
        .collect();
    ports.sort_unstable();

    let expected: Vec<u16> = (5000..5000 + (threads * per_thread) as u16).collect();
    assert_eq!(ports, expected, "ports must be unique and gap-free");
}

#[test]
fn test_same_domain_race_has_one_winner() {
    let (path, _tmp) = create_test_db();
    let threads = 8;
    let barrier = Arc::new(Barrier::new(threads));

    let handles: Vec<_> = (0..threads)
        .map(|_| {
            let path = path.clone();
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                let registry = open_registry(&path, PortRange::default());
                barrier.wait();
                registry.register("race.example.com")
            })
        })
        .collect();

    let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    let winners: Vec<_> = results.iter().filter_map(|r| r.as_ref().ok()).collect();
    assert_eq!(winners.len(), 1);
    assert_eq!(winners[0].port, 5000);

    for result in results.iter().filter(|r| r.is_err()) {
        match result {
            Err(RegistryError::AlreadyRegistered { domain, port }) => {
                assert_eq!(domain, "race.example.com");
                assert_eq!(*port, 5000);
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }

    let registry = open_registry(&path, PortRange::default());
    assert_eq!(registry.list().unwrap().len(), 1);
}

#[test]
fn test_concurrent_exhaustion() {
    let (path, _tmp) = create_test_db();
    let threads = 10;
    let barrier = Arc::new(Barrier::new(threads));

    let handles: Vec<_> = (0..threads)
        .map(|t| {
            let path = path.clone();
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                let registry = open_registry(&path, PortRange::new(7000, 7004));
                barrier.wait();
                registry.register(&format!("tenant{}.io", t))
            })
        })
        .collect();

    let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    let ports: HashSet<u16> = results.iter().filter_map(|r| r.as_ref().ok()).map(|s| s.port).collect();
    assert_eq!(ports, (7000..=7004).collect::<HashSet<u16>>());

    let exhausted = results
        .iter()
        .filter(|r| matches!(r, Err(RegistryError::PortExhausted { floor: 7000, ceiling: 7004 })))
        .count();
    assert_eq!(exhausted, 5);
}

#[test]
fn test_concurrent_release_and_register() {
    let (path, _tmp) = create_test_db();
    let registry = open_registry(&path, PortRange::default());
    for i in 0..10 {
        registry.register(&format!("old{}.com", i)).unwrap();
    }

    let releaser = {
        let path = path.clone();
        thread::spawn(move || {
            let registry = open_registry(&path, PortRange::default());
            for i in 0..10 {
                registry.release(&format!("old{}.com", i)).unwrap();
            }
        })
    };
    let registrar = {
        let path = path.clone();
        thread::spawn(move || {
            let registry = open_registry(&path, PortRange::default());
            (0..10)
                .map(|i| registry.register(&format!("new{}.com", i)).unwrap().port)
                .collect::<Vec<u16>>()
        })
    };

    releaser.join().unwrap();
    let new_ports = registrar.join().unwrap();

    let unique: HashSet<u16> = new_ports.iter().copied().collect();
    assert_eq!(unique.len(), 10);

    let live = registry.list().unwrap();
    assert_eq!(live.len(), 10);
    assert!(live.iter().all(|s| s.domain.starts_with("new")));
}

// ============================================================================
// Persistence
// ============================================================================

#[test]
fn test_state_survives_reopen() {
    let (path, _tmp) = create_test_db();

    {
        let registry = open_registry(&path, PortRange::default());
        assert_eq!(registry.register("a.com").unwrap().port, 5000);
        assert_eq!(registry.register("b.com").unwrap().port, 5001);
        registry.activate("b.com").unwrap();
    }

    let registry = open_registry(&path, PortRange::default());
    let a = registry.lookup("a.com").unwrap();
    assert_eq!((a.port, a.state), (5000, SiteState::Pending));
    let b = registry.lookup("b.com").unwrap();
    assert_eq!((b.port, b.state), (5001, SiteState::Active));
    assert!(b.activated_at.is_some());

    assert_eq!(registry.release("a.com").unwrap(), 5000);
    assert_eq!(registry.register("c.com").unwrap().port, 5000);

    drop(registry);
    let registry = open_registry(&path, PortRange::default());

    let active: Vec<String> = registry.list_active().unwrap().into_iter().map(|s| s.domain).collect();
    assert_eq!(active, vec!["b.com"]);

    let removed = registry.lookup("a.com").unwrap();
    assert_eq!(removed.state, SiteState::Removed);
    assert!(removed.removed_at.is_some());

    let actions: Vec<SiteAction> = registry.history("a.com").unwrap().into_iter().map(|e| e.action).collect();
    assert_eq!(actions, vec![SiteAction::Registered, SiteAction::Released]);
}

#[test]
fn test_reregistration_after_release() {
    let (path, _tmp) = create_test_db();
    let registry = open_registry(&path, PortRange::default());

    registry.register("a.com").unwrap();
    registry.register("b.com").unwrap();
    registry.release("a.com").unwrap();

    let again = registry.register("a.com").unwrap();
    assert_eq!(again.port, 5000);
    assert_eq!(again.state, SiteState::Pending);

    let events = registry.history("a.com").unwrap();
    assert_eq!(events.len(), 3);
    assert_eq!(events[2].action, SiteAction::Registered);
}

#[test]
fn test_narrower_range_on_reopen_still_sees_held_ports() {
    let (path, _tmp) = create_test_db();

    {
        let registry = open_registry(&path, PortRange::new(5000, 5010));
        registry.register("a.com").unwrap();
        registry.register("b.com").unwrap();
    }

    let registry = open_registry(&path, PortRange::new(5001, 5002));
    assert_eq!(registry.register("c.com").unwrap().port, 5002);
    assert!(matches!(
        registry.register("d.com"),
        Err(RegistryError::PortExhausted { .. })
    ));
}
