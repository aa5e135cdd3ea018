//! Deduplicating single-consumer queue of pending splits
//!
//! Request handlers push a task whenever a partition crosses the split
//! threshold; the split thread pops them one by one. A burst of signals for
//! the same partition collapses into one pending task.

use parking_lot::{Condvar, Mutex};
use std::collections::{HashSet, VecDeque};
use std::time::{Duration, Instant};

use crate::metadata::{DirectoryId, PartitionIndex};

/// 分割タスク: `(directory, parent partition)`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SplitTask {
    pub directory: DirectoryId,
    pub parent: PartitionIndex,
}

impl SplitTask {
    pub fn new(directory: DirectoryId, parent: PartitionIndex) -> Self {
        Self { directory, parent }
    }
}

#[derive(Default)]
struct QueueState {
    tasks: VecDeque<SplitTask>,
    pending: HashSet<SplitTask>,
    // 取り出されたが task_done() されていないタスク数
    in_flight: usize,
    shutdown: bool,
}

/// 分割タスクキュー
#[derive(Default)]
pub struct SplitTaskQueue {
    state: Mutex<QueueState>,
    available: Condvar,
    idle: Condvar,
}

impl SplitTaskQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// タスクを追加する
    ///
    /// # Returns
    /// 同じタスクが既に待機中、またはシャットダウン済みの場合は `false`
    pub fn push(&self, task: SplitTask) -> bool {
        let mut state = self.state.lock();
        if state.shutdown || !state.pending.insert(task) {
            return false;
        }
        state.tasks.push_back(task);
        drop(state);

        tracing::debug!(
            "Queued split of directory {} partition {}",
            task.directory,
            task.parent
        );
        self.available.notify_one();
        true
    }

    /// タスクが来るまで待機して取り出す
    ///
    /// シャットダウン後は残りのタスクを捨てて `None` を返す。
    pub fn pop_blocking(&self) -> Option<SplitTask> {
        let mut state = self.state.lock();
        loop {
            if state.shutdown {
                return None;
            }
            if let Some(task) = state.tasks.pop_front() {
                state.pending.remove(&task);
                state.in_flight += 1;
                return Some(task);
            }
            self.available.wait(&mut state);
        }
    }

    /// 最大 `timeout` だけ待機して取り出す
    pub fn pop_timeout(&self, timeout: Duration) -> Option<SplitTask> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        loop {
            if state.shutdown {
                return None;
            }
            if let Some(task) = state.tasks.pop_front() {
                state.pending.remove(&task);
                state.in_flight += 1;
                return Some(task);
            }
            if self.available.wait_until(&mut state, deadline).timed_out() {
                return None;
            }
        }
    }

    /// Mark a popped task as finished
    pub fn task_done(&self) {
        let mut state = self.state.lock();
        state.in_flight = state.in_flight.saturating_sub(1);
        if state.in_flight == 0 && state.tasks.is_empty() {
            self.idle.notify_all();
        }
    }

    /// Wait until no task is queued or running
    ///
    /// # Returns
    /// `false` if `timeout` elapsed first
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        while !state.tasks.is_empty() || state.in_flight > 0 {
            if self.idle.wait_until(&mut state, deadline).timed_out() {
                return state.tasks.is_empty() && state.in_flight == 0;
            }
        }
        true
    }

    /// 待機中のコンシューマを起こして終了させる
    pub fn shutdown(&self) {
        self.state.lock().shutdown = true;
        self.available.notify_all();
        self.idle.notify_all();
    }

    pub fn is_shutdown(&self) -> bool {
        self.state.lock().shutdown
    }

    pub fn len(&self) -> usize {
        self.state.lock().tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
