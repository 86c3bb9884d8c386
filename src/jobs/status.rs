use std::collections::{BTreeMap, HashSet};
use std::{error, fmt};

use itertools::Itertools;
use serde::{Deserialize, Serialize};

/// Per-job bookkeeping record, persisted as `status.mpk` in the job
/// directory.
///
/// At every commit point, `done`, the keys of `pending`, and `todo` are
/// pairwise disjoint and their union is the frame set requested at job
/// creation. Timestamps are seconds since the Unix epoch, so a record
/// written before a restart remains meaningful after it.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct JobStatus {
    /// Frames completed, in completion order.
    pub done: Vec<u32>,
    /// Frames handed to a worker, keyed to the time they were dispatched.
    pub pending: BTreeMap<u32, f64>,
    /// Frames not yet dispatched. Sorted ascending at creation; reclaimed
    /// frames are appended at the back.
    pub todo: Vec<u32>,
    /// Per-worker batch size, within `[1, max_batch_size]`. Floored when a
    /// batch is taken.
    pub batch_size: BTreeMap<u32, f64>,
    /// Per-worker time of the most recent batch-size adjustment.
    pub last_batch_update: BTreeMap<u32, f64>,
    /// Per-frame time of the most recent liveness signal. Keyed exactly by
    /// the frames in `pending`.
    pub last_status_update: BTreeMap<u32, f64>,
}

/// How an uploaded frame relates to the record it lands in.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Completion {
    /// The frame was in flight; carries its dispatch time.
    Dispatched { dispatched: f64 },
    /// The frame had been reclaimed by the stall sweep and sat in `todo`
    /// again when its original worker delivered late.
    Reclaimed,
    /// The frame was already complete; the image is overwritten and the
    /// record untouched.
    Duplicate,
    /// The job never requested this frame.
    Unknown,
}

impl JobStatus {
    pub fn new(frames: impl IntoIterator<Item = u32>) -> Self {
        Self {
            todo: frames.into_iter().unique().sorted().collect(),
            ..Default::default()
        }
    }

    /// The frame set requested at creation, ascending.
    pub fn requested(&self) -> Vec<u32> {
        self.done
            .iter()
            .chain(self.pending.keys())
            .chain(self.todo.iter())
            .copied()
            .unique()
            .sorted()
            .collect()
    }

    /// Gives a first-contact worker its initial batch size of one.
    pub fn ensure_worker(&mut self, worker_id: u32, now: f64) {
        if !self.batch_size.contains_key(&worker_id) {
            self.batch_size.insert(worker_id, 1.0);
            self.last_batch_update.insert(worker_id, now);
        }
    }

    /// Returns every in-flight frame whose liveness signal aged past
    /// `timeout` to the back of `todo`, yielding the reclaimed frames.
    pub fn reclaim_stalled(&mut self, now: f64, timeout: f64) -> Vec<u32> {
        let stalled: Vec<u32> = self
            .last_status_update
            .iter()
            .filter(|&(_, &at)| now - at > timeout)
            .map(|(&frame, _)| frame)
            .collect();

        for &frame in &stalled {
            self.pending.remove(&frame);
            self.last_status_update.remove(&frame);
            self.todo.push(frame);
        }

        stalled
    }

    /// Moves the front of `todo` into `pending` for `worker_id`, floored to
    /// its batch size and clamped to what remains. Empty when `todo` is.
    pub fn take_batch(&mut self, worker_id: u32, now: f64) -> Vec<u32> {
        let size = self.batch_size.get(&worker_id).copied().unwrap_or(1.0);
        let n = (size as usize).max(1).min(self.todo.len());

        let taken: Vec<u32> = self.todo.drain(..n).collect();
        for &frame in &taken {
            self.pending.insert(frame, now);
            self.last_status_update.insert(frame, now);
        }

        taken
    }

    /// Records a frame as complete, wherever it currently sits.
    pub fn complete_frame(&mut self, frame: u32) -> Completion {
        if let Some(dispatched) = self.pending.remove(&frame) {
            self.last_status_update.remove(&frame);
            self.done.push(frame);
            return Completion::Dispatched { dispatched };
        }

        if let Some(idx) = self.todo.iter().position(|&f| f == frame) {
            self.todo.remove(idx);
            self.done.push(frame);
            return Completion::Reclaimed;
        }

        if self.done.contains(&frame) {
            Completion::Duplicate
        } else {
            Completion::Unknown
        }
    }

    /// Refreshes the liveness timestamp of each listed frame that is
    /// actually in flight. Frames outside `pending` are ignored rather than
    /// given orphan entries.
    pub fn refresh_liveness(&mut self, frames: &[u32], now: f64) {
        for frame in frames {
            if self.pending.contains_key(frame) {
                self.last_status_update.insert(*frame, now);
            }
        }
    }

    /// Verifies the record's structural invariants.
    pub fn check(&self) -> Result<(), IntegrityError> {
        let done: HashSet<u32> = self.done.iter().copied().collect();
        if done.len() != self.done.len() {
            return Err(IntegrityError("done contains duplicates".into()));
        }

        let todo: HashSet<u32> = self.todo.iter().copied().collect();
        if todo.len() != self.todo.len() {
            return Err(IntegrityError("todo contains duplicates".into()));
        }

        if let Some(frame) = done.intersection(&todo).next() {
            return Err(IntegrityError(format!(
                "frame {frame} is both done and todo"
            )));
        }

        for frame in self.pending.keys() {
            if done.contains(frame) || todo.contains(frame) {
                return Err(IntegrityError(format!(
                    "frame {frame} is pending but also done or todo"
                )));
            }
            if !self.last_status_update.contains_key(frame) {
                return Err(IntegrityError(format!(
                    "pending frame {frame} has no liveness timestamp"
                )));
            }
        }

        Ok(())
    }
}

/// A status record that violates its own invariants, typically after manual
/// tampering with the job directory.
#[derive(Debug)]
pub struct IntegrityError(pub String);

impl error::Error for IntegrityError {}

impl fmt::Display for IntegrityError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "status record integrity violation: {}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_sorts_and_dedups() {
        let status = JobStatus::new([9, 3, 3, 7, 0]);
        assert_eq!(status.todo, [0, 3, 7, 9]);
        assert!(status.done.is_empty());
        assert!(status.pending.is_empty());
        status.check().unwrap();
    }

    #[test]
    fn test_take_batch_floors_and_clamps() {
        let mut status = JobStatus::new(0..10);
        status.ensure_worker(7, 100.0);

        // Initial batch size is exactly one frame.
        assert_eq!(status.take_batch(7, 101.0), [0]);
        assert_eq!(status.pending.get(&0), Some(&101.0));
        assert_eq!(status.last_status_update.get(&0), Some(&101.0));

        // 3.9 floors to 3.
        status.batch_size.insert(7, 3.9);
        assert_eq!(status.take_batch(7, 102.0), [1, 2, 3]);

        // A batch size beyond the remaining frames takes them all.
        status.batch_size.insert(7, 100.0);
        assert_eq!(status.take_batch(7, 103.0), [4, 5, 6, 7, 8, 9]);

        // Nothing left.
        assert!(status.take_batch(7, 104.0).is_empty());
        status.check().unwrap();
    }

    #[test]
    fn test_reclaim_stalled() {
        let mut status = JobStatus::new([0, 1, 2]);
        status.ensure_worker(1, 0.0);
        status.batch_size.insert(1, 3.0);
        status.take_batch(1, 0.0);

        status.refresh_liveness(&[2], 15.0);

        let reclaimed = status.reclaim_stalled(25.0, 20.0);
        assert_eq!(reclaimed, [0, 1]);
        assert_eq!(status.todo, [0, 1]);
        assert_eq!(status.pending.keys().copied().collect::<Vec<_>>(), [2]);
        status.check().unwrap();

        // Within the timeout nothing moves.
        assert!(status.reclaim_stalled(30.0, 20.0).is_empty());
    }

    #[test]
    fn test_complete_frame_paths() {
        let mut status = JobStatus::new([0, 1]);
        status.ensure_worker(1, 0.0);
        status.take_batch(1, 5.0);

        assert_eq!(
            status.complete_frame(0),
            Completion::Dispatched { dispatched: 5.0 }
        );
        assert_eq!(status.done, [0]);
        assert!(status.last_status_update.is_empty());

        // A frame sitting in todo completes as a late reclaim delivery.
        assert_eq!(status.complete_frame(1), Completion::Reclaimed);
        assert_eq!(status.done, [0, 1]);

        assert_eq!(status.complete_frame(1), Completion::Duplicate);
        assert_eq!(status.done, [0, 1]);

        assert_eq!(status.complete_frame(42), Completion::Unknown);
        status.check().unwrap();
    }

    #[test]
    fn test_requested_is_union() {
        let mut status = JobStatus::new([5, 2, 8]);
        status.ensure_worker(1, 0.0);
        status.take_batch(1, 0.0);
        status.complete_frame(2);

        assert_eq!(status.requested(), [2, 5, 8]);
    }

    #[test]
    fn test_check_rejects_overlap() {
        let mut status = JobStatus::new([0, 1]);
        status.done.push(0);
        assert!(status.check().is_err());

        let mut status = JobStatus::new([0]);
        status.pending.insert(0, 1.0);
        // Pending without a liveness timestamp is also rejected.
        assert!(status.check().is_err());
    }
}
