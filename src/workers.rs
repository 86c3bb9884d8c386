use std::collections::HashSet;
use std::sync::Mutex;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::debug;

/// Allocation space for worker ids.
const ID_SPACE: u32 = 100_000;

/// Hands out process-unique worker identifiers.
///
/// Ids are drawn uniformly at random and never reissued within a process
/// lifetime. They are not persisted: a worker re-initializes when it
/// reconnects after a coordinator restart.
#[derive(Debug)]
pub struct WorkerRegistry {
    state: Mutex<State>,
}

#[derive(Debug)]
struct State {
    issued: HashSet<u32>,
    rng: StdRng,
}

impl WorkerRegistry {
    pub fn new() -> Self {
        Self::with_rng(StdRng::from_entropy())
    }

    /// A registry with a fixed id-draw seed, for deterministic tests.
    pub fn with_seed(seed: u64) -> Self {
        Self::with_rng(StdRng::seed_from_u64(seed))
    }

    fn with_rng(rng: StdRng) -> Self {
        Self {
            state: Mutex::new(State {
                issued: HashSet::new(),
                rng,
            }),
        }
    }

    pub fn allocate(&self) -> u32 {
        // Panic safety: nothing panics while the registry mutex is held, so
        // it cannot be poisoned.
        let state = &mut *self.state.lock().unwrap();

        loop {
            let worker_id = state.rng.gen_range(0..ID_SPACE);
            if state.issued.insert(worker_id) {
                debug!(worker_id, "allocated worker id");
                return worker_id;
            }
        }
    }
}

impl Default for WorkerRegistry {
    fn default() -> Self {
        Self::new()
    }
}
