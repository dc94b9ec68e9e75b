//! Shared test fixtures.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;

use crate::spawner::Destroy;

/// Install a subscriber capturing tracing output for the current test.
///
/// Safe to call from every test; only the first call in the process
/// installs anything.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Shared counters tracking child construction & teardown across a test.
#[derive(Clone, Default)]
pub struct Lifecycle {
    spawned: Arc<AtomicUsize>,
    destroyed: Arc<AtomicUsize>,
}

impl Lifecycle {
    /// Construct a child, recording the spawn.
    pub fn child(&self) -> TestChild {
        self.spawned.fetch_add(1, Ordering::SeqCst);
        TestChild { lifecycle: self.clone() }
    }

    pub fn spawned(&self) -> usize {
        self.spawned.load(Ordering::SeqCst)
    }

    pub fn destroyed(&self) -> usize {
        self.destroyed.load(Ordering::SeqCst)
    }

    pub fn live(&self) -> usize {
        self.spawned() - self.destroyed()
    }
}

/// A child which records its own teardown.
pub struct TestChild {
    lifecycle: Lifecycle,
}

#[async_trait]
impl Destroy for TestChild {
    async fn destroy(&mut self) -> Result<()> {
        self.lifecycle.destroyed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
