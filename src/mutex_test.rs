use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::fixtures;
use crate::mutex::{LockStore, Locks};

/// An in-memory lock store mirroring the KV semantics the locks bucket
/// relies on: atomic create and revision-guarded delete, both failing a
/// miss with the CAS conflict message.
struct MemoryLockStore {
    state: Mutex<MemoryState>,
}

#[derive(Default)]
struct MemoryState {
    held: HashMap<String, u64>,
    next_revision: u64,
}

impl MemoryLockStore {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(MemoryState::default()),
        })
    }

    /// Drop the key regardless of holder, the way TTL expiry does.
    async fn expire(&self, key: &str) {
        self.state.lock().await.held.remove(key);
    }

    async fn holder(&self, key: &str) -> Option<u64> {
        self.state.lock().await.held.get(key).copied()
    }
}

#[async_trait]
impl LockStore for MemoryLockStore {
    async fn acquire(&self, key: &str) -> Result<u64> {
        let mut state = self.state.lock().await;
        if state.held.contains_key(key) {
            bail!("wrong last sequence: key {} is held", key);
        }
        state.next_revision += 1;
        let revision = state.next_revision;
        state.held.insert(key.to_string(), revision);
        Ok(revision)
    }

    async fn release(&self, key: &str, revision: u64) -> Result<()> {
        let mut state = self.state.lock().await;
        match state.held.get(key) {
            Some(held) if *held == revision => {
                state.held.remove(key);
                Ok(())
            }
            _ => bail!("wrong last sequence: revision {} does not hold {}", revision, key),
        }
    }
}

fn memory_locks() -> (Arc<MemoryLockStore>, Arc<Locks>) {
    let store = MemoryLockStore::new();
    let locks = Arc::new(Locks::with_store(store.clone(), CancellationToken::new()));
    (store, locks)
}

#[tokio::test(start_paused = true)]
async fn concurrent_lock_bodies_serialize() -> Result<()> {
    fixtures::init_tracing();
    let (_store, locks) = memory_locks();
    let in_critical = Arc::new(AtomicBool::new(false));
    let overlaps = Arc::new(AtomicUsize::new(0));
    let entries = Arc::new(AtomicUsize::new(0));

    let mut handles = vec![];
    for _ in 0..4 {
        let locks = locks.clone();
        let (in_critical, overlaps, entries) = (in_critical.clone(), overlaps.clone(), entries.clone());
        handles.push(tokio::spawn(async move {
            locks
                .lock("job", async {
                    if in_critical.swap(true, Ordering::SeqCst) {
                        overlaps.fetch_add(1, Ordering::SeqCst);
                    }
                    entries.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    in_critical.store(false, Ordering::SeqCst);
                    Ok(())
                })
                .await
        }));
    }
    for handle in handles {
        handle.await.expect("lock task panicked")?;
    }

    assert_eq!(entries.load(Ordering::SeqCst), 4, "expected every contender to enter the critical section");
    assert_eq!(overlaps.load(Ordering::SeqCst), 0, "expected lock bodies to serialize");
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn release_happens_after_task_failure() -> Result<()> {
    fixtures::init_tracing();
    let (store, locks) = memory_locks();

    let res: Result<()> = locks.lock("job", async { bail!("task failed") }).await;
    let err = res.expect_err("expected the task failure to propagate");
    assert_eq!(err.to_string(), "task failed");
    assert!(
        store.holder("job").await.is_none(),
        "expected the lock to be released after the failure"
    );

    // The key is immediately acquirable again.
    locks.lock("job", async { Ok(()) }).await?;
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn expired_locks_are_inherited_and_release_is_ignored() -> Result<()> {
    fixtures::init_tracing();
    let (store, locks) = memory_locks();

    let successor = {
        let store = store.clone();
        locks
            .lock("job", async move {
                // The key vanishes mid-hold, the way TTL expiry drops it,
                // and another holder takes it over.
                store.expire("job").await;
                store.acquire("job").await
            })
            .await?
    };

    // The original holder's guarded release left the successor alone.
    assert_eq!(store.holder("job").await, Some(successor));
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn contended_acquisition_gives_up() -> Result<()> {
    fixtures::init_tracing();
    let (store, locks) = memory_locks();
    store.acquire("job").await?;

    let ran = Arc::new(AtomicBool::new(false));
    let flagged = ran.clone();
    let res: Result<()> = locks
        .lock("job", async move {
            flagged.store(true, Ordering::SeqCst);
            Ok(())
        })
        .await;

    let err = res.expect_err("expected acquisition to give up against a holder which never releases");
    assert!(
        err.chain().any(|cause| cause.to_string().contains("cannot acquire lock")),
        "unexpected error: {:#}",
        err
    );
    assert!(!ran.load(Ordering::SeqCst), "expected the task to never run");
    Ok(())
}
