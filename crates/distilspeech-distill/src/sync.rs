//! Gradient synchronisation between data-parallel workers.
//!
//! Every worker calls [`GradientSync::all_reduce_mean`] once per step with a
//! buffer of the same length. The call blocks until all workers of the group
//! have arrived, then every buffer holds the element-wise mean. A worker that
//! waits longer than the group timeout fails with
//! [`DistillError::SyncTimeout`] and poisons the group so the others fail
//! fast instead of waiting out their own timeout.

use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use candle_core::{DType, Tensor};
use tracing::{debug, error};

use crate::error::{DistillError, DistillResult};

pub trait GradientSync: Send {
    fn rank(&self) -> usize;

    fn world_size(&self) -> usize;

    /// Replace `values` with its element-wise mean across the group.
    fn all_reduce_mean(&self, values: &mut [f32]) -> DistillResult<()>;

    /// Block until every worker reaches this point.
    fn barrier(&self) -> DistillResult<()> {
        self.all_reduce_mean(&mut [])
    }

    fn is_primary(&self) -> bool {
        self.rank() == 0
    }
}

/// Single-worker sync: every operation is a no-op.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalSync;

impl GradientSync for LocalSync {
    fn rank(&self) -> usize {
        0
    }

    fn world_size(&self) -> usize {
        1
    }

    fn all_reduce_mean(&self, _values: &mut [f32]) -> DistillResult<()> {
        Ok(())
    }
}

// ── In-process collective ─────────────────────────────────────────────────────

struct GroupState {
    generation: u64,
    arrived: usize,
    sum: Vec<f32>,
    result: Vec<f32>,
    aborted: bool,
}

struct Shared {
    state: Mutex<GroupState>,
    cv: Condvar,
    world_size: usize,
    timeout: Duration,
}

/// Constructor for a group of in-process workers (one thread per device).
pub struct CollectiveGroup;

impl CollectiveGroup {
    /// One [`GroupMember`] per rank, to be moved into the worker threads.
    pub fn new(world_size: usize, timeout: Duration) -> Vec<GroupMember> {
        let shared = Arc::new(Shared {
            state: Mutex::new(GroupState {
                generation: 0,
                arrived: 0,
                sum: Vec::new(),
                result: Vec::new(),
                aborted: false,
            }),
            cv: Condvar::new(),
            world_size: world_size.max(1),
            timeout,
        });
        (0..world_size.max(1))
            .map(|rank| GroupMember { rank, shared: Arc::clone(&shared) })
            .collect()
    }
}

pub struct GroupMember {
    rank: usize,
    shared: Arc<Shared>,
}

impl GroupMember {
    fn lock(&self) -> DistillResult<MutexGuard<'_, GroupState>> {
        self.shared
            .state
            .lock()
            .map_err(|_| DistillError::SyncFailed("a worker panicked while holding the group lock".into()))
    }

    fn timeout_error(&self, arrived: usize) -> DistillError {
        DistillError::SyncTimeout {
            rank: self.rank,
            world_size: self.shared.world_size,
            arrived,
            timeout_secs: self.shared.timeout.as_secs(),
        }
    }

    /// Mark the group as failed and wake every waiter.
    pub fn abort(&self) {
        self.abort_handle().abort();
    }

    /// A handle that can abort the group after this member has been moved
    /// into a trainer.
    pub fn abort_handle(&self) -> AbortHandle {
        AbortHandle { shared: Arc::clone(&self.shared) }
    }
}

#[derive(Clone)]
pub struct AbortHandle {
    shared: Arc<Shared>,
}

impl AbortHandle {
    pub fn abort(&self) {
        if let Ok(mut st) = self.shared.state.lock() {
            st.aborted = true;
        }
        self.shared.cv.notify_all();
    }
}

impl GradientSync for GroupMember {
    fn rank(&self) -> usize {
        self.rank
    }

    fn world_size(&self) -> usize {
        self.shared.world_size
    }

    fn all_reduce_mean(&self, values: &mut [f32]) -> DistillResult<()> {
        let world = self.shared.world_size;
        let mut st = self.lock()?;
        if st.aborted {
            return Err(self.timeout_error(st.arrived));
        }

        if st.arrived == 0 {
            st.sum.clear();
            st.sum.extend_from_slice(values);
        } else if st.sum.len() != values.len() {
            st.aborted = true;
            self.shared.cv.notify_all();
            return Err(DistillError::SyncFailed(format!(
                "rank {} sent {} values, group expected {}",
                self.rank,
                values.len(),
                st.sum.len()
            )));
        } else {
            for (acc, v) in st.sum.iter_mut().zip(values.iter()) {
                *acc += *v;
            }
        }
        st.arrived += 1;

        if st.arrived == world {
            let inv = 1.0 / world as f32;
            let mean: Vec<f32> = st.sum.iter().map(|v| v * inv).collect();
            st.result = mean;
            st.arrived = 0;
            st.generation += 1;
            values.copy_from_slice(&st.result);
            debug!(rank = self.rank, generation = st.generation, len = values.len(), "All-reduce complete");
            self.shared.cv.notify_all();
            return Ok(());
        }

        let generation = st.generation;
        let deadline = Instant::now() + self.shared.timeout;
        while st.generation == generation && !st.aborted {
            let now = Instant::now();
            if now >= deadline {
                let arrived = st.arrived;
                st.aborted = true;
                self.shared.cv.notify_all();
                error!(rank = self.rank, arrived, world_size = world, "Gradient sync timed out");
                return Err(self.timeout_error(arrived));
            }
            let (guard, _) = self
                .shared
                .cv
                .wait_timeout(st, deadline - now)
                .map_err(|_| DistillError::SyncFailed("group lock poisoned while waiting".into()))?;
            st = guard;
        }

        if st.generation == generation {
            return Err(self.timeout_error(st.arrived));
        }
        values.copy_from_slice(&st.result);
        Ok(())
    }
}

// ── Tensor helpers ────────────────────────────────────────────────────────────

/// Concatenate every tensor into one host F32 buffer.
pub fn flatten_tensors(tensors: &[Tensor]) -> DistillResult<Vec<f32>> {
    let total: usize = tensors.iter().map(|t| t.elem_count()).sum();
    let mut flat = Vec::with_capacity(total);
    for t in tensors {
        flat.extend(t.to_dtype(DType::F32)?.flatten_all()?.to_vec1::<f32>()?);
    }
    Ok(flat)
}

/// Inverse of [`flatten_tensors`]: rebuild tensors with the shapes and
/// devices of `like`.
pub fn unflatten_like(flat: &[f32], like: &[Tensor]) -> DistillResult<Vec<Tensor>> {
    let mut out = Vec::with_capacity(like.len());
    let mut offset = 0;
    for t in like {
        let n = t.elem_count();
        let slice = flat.get(offset..offset + n).ok_or_else(|| {
            DistillError::SyncFailed(format!("flat buffer of {} too short at offset {offset}", flat.len()))
        })?;
        out.push(Tensor::from_slice(slice, t.shape(), t.device())?);
        offset += n;
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;
    use std::thread;

    #[test]
    fn local_sync_is_identity() {
        let mut v = vec![1.0, 2.0];
        LocalSync.all_reduce_mean(&mut v).unwrap();
        assert_eq!(v, vec![1.0, 2.0]);
        assert!(LocalSync.is_primary());
        assert_eq!(LocalSync.world_size(), 1);
    }

    #[test]
    fn all_reduce_averages_over_workers_for_several_rounds() {
        let members = CollectiveGroup::new(3, Duration::from_secs(10));
        let handles: Vec<_> = members
            .into_iter()
            .map(|m| {
                thread::spawn(move || {
                    let mut results = Vec::new();
                    for round in 0..5 {
                        let mut v = vec![m.rank() as f32 + round as f32; 4];
                        m.all_reduce_mean(&mut v).unwrap();
                        results.push(v);
                    }
                    results
                })
            })
            .collect();

        for h in handles {
            let results = h.join().unwrap();
            for (round, v) in results.iter().enumerate() {
                assert_eq!(v, &vec![1.0 + round as f32; 4]);
            }
        }
    }

    #[test]
    fn missing_worker_times_out_and_poisons_group() {
        let mut members = CollectiveGroup::new(2, Duration::from_millis(50));
        let late = members.pop().unwrap();
        let early = members.pop().unwrap();

        let err = early.all_reduce_mean(&mut [1.0]).unwrap_err();
        match err {
            DistillError::SyncTimeout { rank, world_size, arrived, .. } => {
                assert_eq!((rank, world_size, arrived), (0, 2, 1));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(err_is_timeout(late.all_reduce_mean(&mut [1.0])));
    }

    fn err_is_timeout(r: DistillResult<()>) -> bool {
        matches!(r, Err(DistillError::SyncTimeout { .. }))
    }

    #[test]
    fn abort_handle_wakes_waiting_worker() {
        let mut members = CollectiveGroup::new(2, Duration::from_secs(30));
        let failed = members.pop().unwrap();
        let waiting = members.pop().unwrap();
        let handle = failed.abort_handle();
        drop(failed);

        let waiter = thread::spawn(move || waiting.all_reduce_mean(&mut [1.0]));
        thread::sleep(Duration::from_millis(20));
        handle.abort();
        assert!(err_is_timeout(waiter.join().unwrap()));
    }

    #[test]
    fn barrier_releases_all_workers() {
        let members = CollectiveGroup::new(4, Duration::from_secs(10));
        let handles: Vec<_> = members.into_iter().map(|m| thread::spawn(move || m.barrier())).collect();
        for h in handles {
            h.join().unwrap().unwrap();
        }
    }

    #[test]
    fn flatten_roundtrip_preserves_shapes() {
        let a = Tensor::new(&[[1f32, 2.0], [3.0, 4.0]], &Device::Cpu).unwrap();
        let b = Tensor::new(&[5f32], &Device::Cpu).unwrap();
        let flat = flatten_tensors(&[a.clone(), b.clone()]).unwrap();
        assert_eq!(flat, vec![1.0, 2.0, 3.0, 4.0, 5.0]);
        let back = unflatten_like(&flat, &[a, b]).unwrap();
        assert_eq!(back[0].dims(), &[2, 2]);
        assert_eq!(back[1].to_vec1::<f32>().unwrap(), vec![5.0]);
        assert!(unflatten_like(&flat[..3], &back).is_err());
    }
}
