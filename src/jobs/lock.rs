use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// Named mutual exclusion, keyed by job id.
///
/// Every read-modify-write of a job's status record happens under that job's
/// lock; acquisition is scoped and the guard releases on drop, whatever the
/// exit path. Entries are created on first contact and never removed, since
/// jobs themselves are never deleted by the coordinator.
///
/// ```
/// use renderfarm_rs::jobs::lock::JobLocks;
/// use tokio_test::block_on;
///
/// block_on(async {
///     let locks = JobLocks::new();
///     let guard = locks.acquire("0").await;
///     // Dropping the guard lets the next acquirer in.
///     drop(guard);
///     let _reacquired = locks.acquire("0").await;
/// });
/// ```
#[derive(Debug, Default)]
pub struct JobLocks {
    inner: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl JobLocks {
    pub fn new() -> Self {
        Default::default()
    }

    pub async fn acquire(&self, job_id: &str) -> OwnedMutexGuard<()> {
        let lock = {
            // Panic safety: nothing panics while this registry mutex is
            // held, so it cannot be poisoned.
            let mut map = self.inner.lock().unwrap();
            map.entry(job_id.to_owned()).or_default().clone()
        };

        lock.lock_owned().await
    }
}
