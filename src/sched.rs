use std::sync::{Arc, Mutex};
use std::time::SystemTime;
use std::{error, fmt};

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use tracing::{debug, info};

use crate::jobs::status::{Completion, IntegrityError, JobStatus};
use crate::jobs::store::{self, JobStore};

/// Scheduler constants, overridable per instance.
#[derive(Clone, Copy, Debug)]
pub struct Tunables {
    /// Ideal wall-clock seconds a worker spends on one batch. Smaller means
    /// less waiting on stragglers at the end of a job; larger means less
    /// relative round-trip overhead.
    pub target_batch_time: f64,
    /// Upper bound on any worker's batch size.
    pub max_batch_size: f64,
    /// Seconds of liveness silence after which an in-flight frame is
    /// reclaimed.
    pub status_timeout: f64,
    /// Minimum seconds between batch-size adjustments for one worker.
    /// Workers upload a batch one frame at a time, so without this gate a
    /// batch would trigger as many adjustments as it has frames.
    pub batch_update_min_interval: f64,
}

impl Default for Tunables {
    fn default() -> Self {
        Self {
            target_batch_time: 40.0,
            max_batch_size: 100.0,
            status_timeout: 20.0,
            batch_update_min_interval: 10.0,
        }
    }
}

/// Seconds since the Unix epoch, as stored in status records.
pub fn unix_now() -> f64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

/// Hands out frame batches, sizes them per worker from observed throughput,
/// reclaims stalled frames, and records completions.
///
/// All mutations of a job's status record happen under that job's lock; the
/// scheduler itself holds no job state between calls.
pub struct Scheduler {
    store: Arc<JobStore>,
    tunables: Tunables,
    rng: Mutex<StdRng>,
}

impl Scheduler {
    pub fn new(store: Arc<JobStore>, tunables: Tunables) -> Self {
        Self::with_rng(store, tunables, StdRng::from_entropy())
    }

    /// A scheduler with a fixed job-selection seed, for deterministic tests.
    pub fn with_seed(
        store: Arc<JobStore>,
        tunables: Tunables,
        seed: u64,
    ) -> Self {
        Self::with_rng(store, tunables, StdRng::seed_from_u64(seed))
    }

    fn with_rng(store: Arc<JobStore>, tunables: Tunables, rng: StdRng) -> Self {
        Self {
            store,
            tunables,
            rng: Mutex::new(rng),
        }
    }

    /// Picks a job uniformly at random from those with dispatchable frames
    /// and hands `worker_id` the front of its `todo`, after sweeping stale
    /// in-flight frames back into it.
    ///
    /// `None` means no work: either nothing is active, or the chosen job's
    /// `todo` drained before the take. Sweep and worker-initialization
    /// effects are committed either way.
    pub async fn get_work(
        &self,
        worker_id: u32,
    ) -> Result<Option<(String, Vec<u32>)>, Error> {
        let active = self.store.list_active().await?;

        let job_id = {
            // Panic safety: nothing panics while the RNG mutex is held, so
            // it cannot be poisoned.
            let mut rng = self.rng.lock().unwrap();
            match active.choose(&mut *rng) {
                None => return Ok(None),
                Some(job_id) => job_id.clone(),
            }
        };

        let _guard = self.store.lock(&job_id).await;
        let mut status = self.store.read_status(&job_id).await?;
        status.check()?;

        let now = unix_now();
        status.ensure_worker(worker_id, now);

        for frame in status.reclaim_stalled(now, self.tunables.status_timeout)
        {
            info!(%job_id, frame, "liveness timeout, frame reclaimed");
        }

        let frames = status.take_batch(worker_id, now);
        self.store.write_status(&job_id, &status).await?;

        if frames.is_empty() {
            Ok(None)
        } else {
            debug!(%job_id, worker_id, n_frames = frames.len(), "dispatched");
            Ok(Some((job_id, frames)))
        }
    }

    /// Records a completed frame: adjusts the worker's batch size from the
    /// observed round trip, moves the frame to `done`, and writes the image
    /// under the job's renders directory.
    ///
    /// Late deliveries are tolerated: a frame the stall sweep already
    /// reclaimed completes normally, and a duplicate of a finished frame
    /// just overwrites the image. Both skip the batch-size arithmetic, as
    /// does an upload from a worker this job has never dispatched to.
    pub async fn upload_render(
        &self,
        worker_id: u32,
        job_id: &str,
        frame: u32,
        data: &[u8],
    ) -> Result<(), Error> {
        let _guard = self.store.lock(job_id).await;
        let mut status = self.store.read_status(job_id).await?;
        status.check()?;

        let now = unix_now();
        match status.complete_frame(frame) {
            Completion::Dispatched { dispatched } => {
                self.adjust_batch_size(
                    &mut status,
                    worker_id,
                    dispatched,
                    now,
                );
            },
            Completion::Reclaimed => {
                debug!(%job_id, frame, "late delivery of a reclaimed frame");
            },
            Completion::Duplicate => {
                debug!(%job_id, frame, worker_id, "duplicate upload");
            },
            Completion::Unknown => return Err(store::Error::NotFound.into()),
        }

        self.store.write_render(job_id, frame, data).await?;
        self.store.write_status(job_id, &status).await?;

        Ok(())
    }

    /// One exponential-smoothing step of the per-worker batch size toward
    /// the size that would have hit `target_batch_time`, debounced so each
    /// batch adjusts at most once however many frames it reports.
    fn adjust_batch_size(
        &self,
        status: &mut JobStatus,
        worker_id: u32,
        dispatched: f64,
        now: f64,
    ) {
        let t = &self.tunables;

        // A worker can deliver to a job that never dispatched to it (the
        // frame was reclaimed and re-batched meanwhile); there is nothing to
        // adjust then.
        let Some(&size) = status.batch_size.get(&worker_id) else {
            return;
        };
        let Some(&last) = status.last_batch_update.get(&worker_id) else {
            return;
        };

        if now - last <= t.batch_update_min_interval {
            return;
        }

        let avg_time = (now - dispatched) / size;
        let nominal = t.target_batch_time / avg_time;
        let new = size + 0.5 * (nominal - size);

        status
            .batch_size
            .insert(worker_id, new.clamp(1.0, t.max_batch_size));
        status.last_batch_update.insert(worker_id, now);
    }

    /// Refreshes liveness for in-flight frames a worker is still rendering.
    pub async fn status_update(
        &self,
        job_id: &str,
        frames: &[u32],
    ) -> Result<(), Error> {
        let _guard = self.store.lock(job_id).await;
        let mut status = self.store.read_status(job_id).await?;
        status.check()?;

        status.refresh_liveness(frames, unix_now());
        self.store.write_status(job_id, &status).await?;

        Ok(())
    }

    /// A job's progress: frames done in completion order, and the requested
    /// frame set ascending. Reads the committed record without the job
    /// lock; commits are atomic renames.
    pub async fn job_status(
        &self,
        job_id: &str,
    ) -> Result<(Vec<u32>, Vec<u32>), Error> {
        let status = self.store.read_status(job_id).await?;
        status.check()?;

        let requested = status.requested();
        Ok((status.done, requested))
    }
}

#[derive(Debug)]
pub enum Error {
    Store(store::Error),
    Integrity(IntegrityError),
}

impl error::Error for Error {}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Store(e) => write!(f, "{e}"),
            Self::Integrity(e) => write!(f, "{e}"),
        }
    }
}

impl From<store::Error> for Error {
    fn from(value: store::Error) -> Self {
        Self::Store(value)
    }
}

impl From<IntegrityError> for Error {
    fn from(value: IntegrityError) -> Self {
        Self::Integrity(value)
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;
    use crate::jobs::store::DONE_MARKER;

    fn farm() -> (tempfile::TempDir, Arc<JobStore>, Scheduler) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(JobStore::open(dir.path().join("jobs")).unwrap());
        let sched =
            Scheduler::with_seed(store.clone(), Tunables::default(), 42);
        (dir, store, sched)
    }

    async fn create(store: &JobStore, frames: Vec<u32>) -> String {
        store
            .create_job(Bytes::from_static(b"bundle"), frames, true)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_single_worker_completes_job() {
        let (_dir, store, sched) = farm();
        let job_id = create(&store, (0..10).rev().collect()).await;
        assert_eq!(job_id, "0");

        // Initial batch size is one, so the first take is exactly [0].
        let (got_job, frames) = sched.get_work(7).await.unwrap().unwrap();
        assert_eq!(got_job, "0");
        assert_eq!(frames, [0]);
        sched.upload_render(7, "0", 0, b"img").await.unwrap();

        // The debounce keeps the batch at one frame, so nine more rounds
        // drain the job in dispatch order.
        for want in 1..10 {
            let (_, frames) = sched.get_work(7).await.unwrap().unwrap();
            assert_eq!(frames, [want]);
            sched.upload_render(7, "0", want, b"img").await.unwrap();
        }

        let (done, requested) = sched.job_status("0").await.unwrap();
        assert_eq!(done, (0..10).collect::<Vec<_>>());
        assert_eq!(requested, (0..10).collect::<Vec<_>>());

        // The next scan observes an empty todo and seals the job.
        assert!(sched.get_work(7).await.unwrap().is_none());
        assert!(store.root().join("0").join(DONE_MARKER).exists());

        for frame in 0..10 {
            assert!(!store
                .read_render("0", frame)
                .await
                .unwrap()
                .is_empty());
        }
    }

    #[tokio::test]
    async fn test_two_workers_race_to_completion() {
        let (_dir, store, sched) = farm();
        create(&store, (0..100).collect()).await;

        let sched = Arc::new(sched);
        let mut tasks = Vec::new();
        for worker_id in [1, 2] {
            let sched = sched.clone();
            tasks.push(tokio::spawn(async move {
                let mut uploaded = Vec::new();
                while let Some((job_id, frames)) =
                    sched.get_work(worker_id).await.unwrap()
                {
                    for frame in frames {
                        sched
                            .upload_render(worker_id, &job_id, frame, b"img")
                            .await
                            .unwrap();
                        uploaded.push(frame);
                    }
                }
                uploaded
            }));
        }

        let mut all = Vec::new();
        for task in tasks {
            let uploaded = task.await.unwrap();
            // No frame is uploaded twice by one worker under normal
            // operation.
            let mut dedup = uploaded.clone();
            dedup.sort_unstable();
            dedup.dedup();
            assert_eq!(dedup.len(), uploaded.len());
            all.extend(uploaded);
        }

        all.sort_unstable();
        assert_eq!(all, (0..100).collect::<Vec<_>>());

        let (done, _) = sched.job_status("0").await.unwrap();
        let mut done_sorted = done;
        done_sorted.sort_unstable();
        assert_eq!(done_sorted, (0..100).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_stall_reclaim_and_late_delivery() {
        let (_dir, store, sched) = farm();
        create(&store, vec![0, 1, 2]).await;

        // Give worker A a three-frame batch up front.
        let mut status = store.read_status("0").await.unwrap();
        status.batch_size.insert(1, 3.0);
        status.last_batch_update.insert(1, unix_now());
        store.write_status("0", &status).await.unwrap();

        let (_, frames) = sched.get_work(1).await.unwrap().unwrap();
        assert_eq!(frames, [0, 1, 2]);
        sched.upload_render(1, "0", 0, b"a0").await.unwrap();

        // Worker A goes quiet: age frames 1 and 2 past the stall timeout.
        let mut status = store.read_status("0").await.unwrap();
        for frame in [1, 2] {
            status.last_status_update.insert(frame, unix_now() - 30.0);
        }
        store.write_status("0", &status).await.unwrap();

        // Worker B's next request reclaims both and is handed the first.
        let (_, frames) = sched.get_work(2).await.unwrap().unwrap();
        assert_eq!(frames, [1]);
        let (_, frames) = sched.get_work(2).await.unwrap().unwrap();
        assert_eq!(frames, [2]);

        sched.upload_render(2, "0", 1, b"b1").await.unwrap();
        sched.upload_render(2, "0", 2, b"b2").await.unwrap();

        // Worker A reappears with its stale render of frame 1; the upload
        // is accepted, the image overwritten, the record unchanged.
        sched.upload_render(1, "0", 1, b"a1").await.unwrap();

        let (done, _) = sched.job_status("0").await.unwrap();
        assert_eq!(done, [0, 1, 2]);
        assert_eq!(store.read_render("0", 1).await.unwrap(), &b"a1"[..]);
    }

    #[tokio::test]
    async fn test_reclaimed_frame_completes_from_todo() {
        let (_dir, store, sched) = farm();
        create(&store, vec![0, 1]).await;

        let (_, frames) = sched.get_work(1).await.unwrap().unwrap();
        assert_eq!(frames, [0]);

        // Age frame 0 out and let the sweep run without re-dispatching it:
        // worker B takes frame 1, frame 0 returns to todo.
        let mut status = store.read_status("0").await.unwrap();
        status.last_status_update.insert(0, unix_now() - 30.0);
        store.write_status("0", &status).await.unwrap();

        let (_, frames) = sched.get_work(2).await.unwrap().unwrap();
        assert_eq!(frames, [1]);

        // A's late delivery finds frame 0 back in todo and completes it.
        sched.upload_render(1, "0", 0, b"a0").await.unwrap();

        let status = store.read_status("0").await.unwrap();
        assert_eq!(status.done, [0]);
        assert!(status.todo.is_empty());
        status.check().unwrap();
    }

    #[tokio::test]
    async fn test_batch_size_steps_halfway_to_nominal() {
        let (_dir, store, sched) = farm();
        create(&store, (0..100).collect()).await;

        let (_, frames) = sched.get_work(5).await.unwrap().unwrap();
        assert_eq!(frames, [0]);

        // Pretend the frame took 2 s and the debounce window has passed:
        // nominal is 40 / 2 = 20, so one step lands halfway at 10.5.
        let now = unix_now();
        let mut status = store.read_status("0").await.unwrap();
        status.pending.insert(0, now - 2.0);
        status.last_batch_update.insert(5, now - 11.0);
        store.write_status("0", &status).await.unwrap();

        sched.upload_render(5, "0", 0, b"img").await.unwrap();

        let status = store.read_status("0").await.unwrap();
        let size = status.batch_size[&5];
        assert!((size - 10.5).abs() < 0.2, "batch size {size}");

        // The next take honors the floored size.
        let (_, frames) = sched.get_work(5).await.unwrap().unwrap();
        assert_eq!(frames.len(), 10);
    }

    #[tokio::test]
    async fn test_batch_size_fixed_point() {
        let (_dir, store, sched) = farm();
        create(&store, (0..100).collect()).await;

        // A worker already at size 20 that finishes its batch in exactly
        // the target time stays at 20.
        let now = unix_now();
        let mut status = store.read_status("0").await.unwrap();
        status.batch_size.insert(5, 20.0);
        status.last_batch_update.insert(5, now - 11.0);
        status.pending.insert(0, now - 40.0);
        status.todo.retain(|&f| f != 0);
        status.last_status_update.insert(0, now);
        store.write_status("0", &status).await.unwrap();

        sched.upload_render(5, "0", 0, b"img").await.unwrap();

        let status = store.read_status("0").await.unwrap();
        let size = status.batch_size[&5];
        assert!((size - 20.0).abs() < 0.2, "batch size {size}");
    }

    #[tokio::test]
    async fn test_batch_size_stays_bounded() {
        let (_dir, store, sched) = farm();
        create(&store, (0..4).collect()).await;

        // An instantaneous round trip pushes nominal toward infinity; the
        // new size clamps to the maximum.
        let now = unix_now();
        let (_, frames) = sched.get_work(5).await.unwrap().unwrap();
        let mut status = store.read_status("0").await.unwrap();
        status.pending.insert(frames[0], now);
        status.last_batch_update.insert(5, now - 11.0);
        store.write_status("0", &status).await.unwrap();

        sched.upload_render(5, "0", frames[0], b"img").await.unwrap();
        let status = store.read_status("0").await.unwrap();
        assert_eq!(status.batch_size[&5], 100.0);

        // An absurdly slow round trip clamps to the minimum of one.
        let (_, frames) = sched.get_work(5).await.unwrap().unwrap();
        let mut status = store.read_status("0").await.unwrap();
        status.batch_size.insert(5, 1.0);
        status.pending.insert(frames[0], now - 1e6);
        status.last_batch_update.insert(5, now - 11.0);
        store.write_status("0", &status).await.unwrap();

        sched
            .upload_render(5, "0", frames[0], b"img")
            .await
            .unwrap();
        let status = store.read_status("0").await.unwrap();
        assert_eq!(status.batch_size[&5], 1.0);

        for size in status.batch_size.values() {
            assert!((1.0..=100.0).contains(size));
        }
    }

    #[tokio::test]
    async fn test_debounce_holds_batch_size_still() {
        let (_dir, store, sched) = farm();
        create(&store, (0..10).collect()).await;

        let (_, frames) = sched.get_work(5).await.unwrap().unwrap();
        // Fresh last_batch_update from worker initialization: within the
        // debounce window, the upload must not adjust the size.
        sched.upload_render(5, "0", frames[0], b"img").await.unwrap();

        let status = store.read_status("0").await.unwrap();
        assert_eq!(status.batch_size[&5], 1.0);
    }

    #[tokio::test]
    async fn test_upload_from_unknown_worker_still_completes() {
        let (_dir, store, sched) = farm();
        create(&store, vec![0]).await;

        let (_, frames) = sched.get_work(1).await.unwrap().unwrap();
        assert_eq!(frames, [0]);

        // Worker 9 never called get_work against this job.
        sched.upload_render(9, "0", 0, b"img").await.unwrap();

        let status = store.read_status("0").await.unwrap();
        assert_eq!(status.done, [0]);
        assert!(!status.batch_size.contains_key(&9));
    }

    #[tokio::test]
    async fn test_upload_of_unrequested_frame_is_not_found() {
        let (_dir, store, sched) = farm();
        create(&store, vec![0]).await;

        assert!(matches!(
            sched.upload_render(1, "0", 99, b"img").await,
            Err(Error::Store(store::Error::NotFound))
        ));
        assert!(matches!(
            sched.upload_render(1, "7", 0, b"img").await,
            Err(Error::Store(store::Error::NotFound))
        ));
    }

    #[tokio::test]
    async fn test_status_update_defers_reclaim() {
        let (_dir, store, sched) = farm();
        create(&store, vec![0, 1]).await;

        let (_, frames) = sched.get_work(1).await.unwrap().unwrap();
        assert_eq!(frames, [0]);

        // Frame 0 looks stalled, but the worker pings before anyone asks
        // for work.
        let mut status = store.read_status("0").await.unwrap();
        status.last_status_update.insert(0, unix_now() - 30.0);
        store.write_status("0", &status).await.unwrap();

        sched.status_update("0", &[0]).await.unwrap();

        let (_, frames) = sched.get_work(2).await.unwrap().unwrap();
        assert_eq!(frames, [1], "frame 0 must not have been reclaimed");

        let status = store.read_status("0").await.unwrap();
        assert!(status.pending.contains_key(&0));
    }

    #[tokio::test]
    async fn test_status_update_ignores_unknown_frames() {
        let (_dir, store, sched) = farm();
        create(&store, vec![0, 1]).await;

        sched.status_update("0", &[0, 17]).await.unwrap();

        let status = store.read_status("0").await.unwrap();
        assert!(status.last_status_update.is_empty());
        status.check().unwrap();
    }

    #[tokio::test]
    async fn test_no_work_when_everything_pending() {
        let (_dir, store, sched) = farm();
        create(&store, vec![0]).await;

        assert!(sched.get_work(1).await.unwrap().is_some());
        // The only frame is in flight and fresh, so there is nothing left
        // to hand out.
        assert!(sched.get_work(2).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_corrupt_record_is_an_integrity_error() {
        let (_dir, store, sched) = farm();
        create(&store, vec![0, 1]).await;

        let mut status = store.read_status("0").await.unwrap();
        status.done.push(0); // still in todo as well
        store.write_status("0", &status).await.unwrap();

        assert!(matches!(
            sched.get_work(1).await,
            Err(Error::Integrity(_))
        ));
    }
}
