use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use stepwise_core::config::BusyPolicy;
use stepwise_core::error::{Result, StepwiseError};
use stepwise_core::types::ThreadId;

type LaneMap = Arc<Mutex<HashMap<ThreadId, Arc<AsyncMutex<()>>>>>;

/// Per-thread lanes ensuring serial execution of turns.
///
/// Turns on the same thread run one at a time in arrival order (the tokio
/// mutex is fair). Turns on different threads never wait on each other.
/// A lane is removed once nobody holds or waits on it; removal happens under
/// the map lock, so one thread never ends up with two live lanes.
#[derive(Default)]
pub struct ThreadLanes {
    lanes: LaneMap,
}

/// Holds a thread's lane for the duration of a turn.
pub struct LaneGuard {
    // Field order matters: the mutex is released before the lane is pruned.
    _guard: OwnedMutexGuard<()>,
    _lane: LaneRef,
}

/// A counted reference to one lane. Dropping the last one removes the lane.
struct LaneRef {
    lanes: LaneMap,
    id: ThreadId,
    lane: Option<Arc<AsyncMutex<()>>>,
}

impl Drop for LaneRef {
    fn drop(&mut self) {
        let mut lanes = self.lanes.lock().unwrap_or_else(|e| e.into_inner());
        self.lane.take();
        let idle = lanes
            .get(&self.id)
            .is_some_and(|lane| Arc::strong_count(lane) == 1);
        if idle {
            lanes.remove(&self.id);
        }
    }
}

impl ThreadLanes {
    pub fn new() -> Self {
        Self::default()
    }

    fn lane(&self, id: &ThreadId) -> (LaneRef, Arc<AsyncMutex<()>>) {
        let mut lanes = self.lanes.lock().unwrap_or_else(|e| e.into_inner());
        let lane = lanes
            .entry(id.clone())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone();
        let handle = LaneRef {
            lanes: self.lanes.clone(),
            id: id.clone(),
            lane: Some(lane.clone()),
        };
        (handle, lane)
    }

    /// Take the thread's lane. Held for the whole turn.
    pub async fn acquire(&self, id: &ThreadId, policy: BusyPolicy) -> Result<LaneGuard> {
        let (handle, lane) = self.lane(id);
        let guard = match policy {
            BusyPolicy::Queue => lane.lock_owned().await,
            BusyPolicy::Reject => lane
                .try_lock_owned()
                .map_err(|_| StepwiseError::ThreadBusy(id.to_string()))?,
        };
        Ok(LaneGuard {
            _guard: guard,
            _lane: handle,
        })
    }

    /// Number of lanes currently held or waited on.
    pub fn len(&self) -> usize {
        self.lanes.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn reject_policy_fails_while_held() {
        let lanes = ThreadLanes::new();
        let id = ThreadId::from_str("t-1");
        let guard = lanes.acquire(&id, BusyPolicy::Reject).await.unwrap();
        assert!(matches!(
            lanes.acquire(&id, BusyPolicy::Reject).await,
            Err(StepwiseError::ThreadBusy(ref t)) if t == "t-1"
        ));
        drop(guard);
        assert!(lanes.acquire(&id, BusyPolicy::Reject).await.is_ok());
    }

    #[tokio::test]
    async fn different_threads_do_not_block() {
        let lanes = ThreadLanes::new();
        let _a = lanes.acquire(&ThreadId::from_str("a"), BusyPolicy::Reject).await.unwrap();
        let _b = lanes.acquire(&ThreadId::from_str("b"), BusyPolicy::Reject).await.unwrap();
        assert_eq!(lanes.len(), 2);
    }

    #[tokio::test]
    async fn released_lanes_are_pruned() {
        let lanes = ThreadLanes::new();
        let a = lanes.acquire(&ThreadId::from_str("a"), BusyPolicy::Queue).await.unwrap();
        let b = lanes.acquire(&ThreadId::from_str("b"), BusyPolicy::Queue).await.unwrap();
        assert_eq!(lanes.len(), 2);
        drop(a);
        assert_eq!(lanes.len(), 1);
        drop(b);
        assert!(lanes.is_empty());
    }

    #[tokio::test]
    async fn rejected_acquire_does_not_leave_a_lane_behind() {
        let lanes = ThreadLanes::new();
        let id = ThreadId::from_str("t-1");
        let guard = lanes.acquire(&id, BusyPolicy::Reject).await.unwrap();
        assert!(lanes.acquire(&id, BusyPolicy::Reject).await.is_err());
        assert_eq!(lanes.len(), 1);
        drop(guard);
        assert!(lanes.is_empty());
    }

    #[tokio::test]
    async fn queue_policy_waits_for_release() {
        let lanes = Arc::new(ThreadLanes::new());
        let id = ThreadId::from_str("t-1");
        let guard = lanes.acquire(&id, BusyPolicy::Queue).await.unwrap();

        let waiter = {
            let lanes = lanes.clone();
            let id = id.clone();
            tokio::spawn(async move {
                let _guard = lanes.acquire(&id, BusyPolicy::Queue).await.unwrap();
            })
        };
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());

        assert_eq!(lanes.len(), 1);

        drop(guard);
        waiter.await.unwrap();
        assert!(lanes.is_empty());
    }
}
