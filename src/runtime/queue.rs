//! 无锁工作队列
//!
//! 并行块的裸金属路径用它在线程间分发均匀的 CPU 密集型工作，
//! 不经过完整的 Scheduler/ThreadPool 机制。
//!
//! - `WorkQueue`: 多生产者多消费者的有界队列，元素是任务上下文句柄
//! - `WorkerSignal`: 工作线程据此判断是否继续轮询的两个原子计数
//! - 排空等待使用条件变量加超时，而不是轮询

use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use crossbeam::queue::ArrayQueue;
use crossbeam_utils::CachePadded;
use parking_lot::{Condvar, Mutex};

use crate::config::DEFAULT_WORK_QUEUE_CAPACITY;

/// 工作队列
pub struct WorkQueue {
    queue: ArrayQueue<i64>,
    /// 已推入但尚未完成的条目数
    pending: CachePadded<AtomicUsize>,
    /// 排空通知
    drained_lock: Mutex<()>,
    drained: Condvar,
}

impl WorkQueue {
    /// 创建队列；容量为 0 时使用默认容量
    pub fn new(capacity: usize) -> Self {
        let capacity = if capacity == 0 {
            DEFAULT_WORK_QUEUE_CAPACITY
        } else {
            capacity
        };
        Self {
            queue: ArrayQueue::new(capacity),
            pending: CachePadded::new(AtomicUsize::new(0)),
            drained_lock: Mutex::new(()),
            drained: Condvar::new(),
        }
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.queue.capacity()
    }

    /// 队列中尚未取出的条目数
    #[inline]
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// 尚未完成的条目数（含已取出正在处理的）
    #[inline]
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    /// 推入任务上下文句柄，队列满时返回 false
    pub fn push(&self, context: i64) -> bool {
        self.pending.fetch_add(1, Ordering::AcqRel);
        if self.queue.push(context).is_err() {
            self.complete_one();
            return false;
        }
        true
    }

    /// 取出并立即视为完成
    ///
    /// 分发线程同步处理取出的条目时使用
    pub fn pop(&self) -> Option<i64> {
        let context = self.queue.pop()?;
        self.complete_one();
        Some(context)
    }

    /// 认领一个条目，守卫析构时才视为完成
    pub fn claim(&self) -> Option<WorkClaim<'_>> {
        let context = self.queue.pop()?;
        Some(WorkClaim {
            queue: self,
            context,
        })
    }

    fn complete_one(&self) {
        if self.pending.fetch_sub(1, Ordering::AcqRel) == 1 {
            // 持锁通知，等待者不会错过
            let _guard = self.drained_lock.lock();
            self.drained.notify_all();
        }
    }

    /// 等待所有已发布的工作完成
    ///
    /// `timeout` 为 None 时无限等待；返回是否已排空
    pub fn wait_drained(&self, timeout: Option<Duration>) -> bool {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut guard = self.drained_lock.lock();
        while self.pending() > 0 {
            match deadline {
                Some(deadline) => {
                    if self.drained.wait_until(&mut guard, deadline).timed_out() {
                        return self.pending() == 0;
                    }
                }
                None => self.drained.wait(&mut guard),
            }
        }
        true
    }
}

impl std::fmt::Debug for WorkQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkQueue")
            .field("capacity", &self.capacity())
            .field("len", &self.len())
            .field("pending", &self.pending())
            .finish()
    }
}

/// 已认领的工作条目
pub struct WorkClaim<'a> {
    queue: &'a WorkQueue,
    context: i64,
}

impl WorkClaim<'_> {
    /// 任务上下文句柄
    #[inline]
    pub fn context(&self) -> i64 {
        self.context
    }
}

impl Drop for WorkClaim<'_> {
    fn drop(&mut self) {
        self.queue.complete_one();
    }
}

/// 工作线程信号
#[derive(Debug, Default)]
pub struct WorkerSignal {
    work_available: CachePadded<AtomicI64>,
    active_workers: CachePadded<AtomicI64>,
}

impl WorkerSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// 发布两个计数
    pub fn publish(&self, work_available: i64, active_workers: i64) {
        self.active_workers.store(active_workers, Ordering::Release);
        self.work_available.store(work_available, Ordering::Release);
    }

    #[inline]
    pub fn work_available(&self) -> i64 {
        self.work_available.load(Ordering::Acquire)
    }

    #[inline]
    pub fn active_workers(&self) -> i64 {
        self.active_workers.load(Ordering::Acquire)
    }

    /// 工作线程是否应继续轮询
    #[inline]
    pub fn should_poll(&self) -> bool {
        self.work_available() > 0
    }

    /// 消耗一个可用工作计数，计数已归零时返回 false
    pub fn consume(&self) -> bool {
        self.work_available
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                if n > 0 {
                    Some(n - 1)
                } else {
                    None
                }
            })
            .is_ok()
    }

    /// 工作线程退出时减少活跃计数，不低于 0
    pub fn worker_exit(&self) {
        let _ = self
            .active_workers
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| (n > 0).then(|| n - 1));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_push_pop_and_capacity() {
        let q = WorkQueue::new(2);
        assert!(q.push(10));
        assert!(q.push(11));
        assert!(!q.push(12)); // 已满
        assert_eq!(q.pending(), 2);

        assert_eq!(q.pop(), Some(10));
        assert_eq!(q.pop(), Some(11));
        assert_eq!(q.pop(), None);
        assert_eq!(q.pending(), 0);
        assert_eq!(WorkQueue::new(0).capacity(), DEFAULT_WORK_QUEUE_CAPACITY);
    }

    #[test]
    fn test_concurrent_consumers_see_each_item_once() {
        let q = Arc::new(WorkQueue::new(4096));
        for i in 0..4000 {
            assert!(q.push(i));
        }

        let consumers: Vec<_> = (0..4)
            .map(|_| {
                let q = Arc::clone(&q);
                thread::spawn(move || {
                    let mut seen = Vec::new();
                    while let Some(claim) = q.claim() {
                        seen.push(claim.context());
                    }
                    seen
                })
            })
            .collect();

        let mut all = HashSet::new();
        for handle in consumers {
            for item in handle.join().unwrap() {
                assert!(all.insert(item));
            }
        }
        assert_eq!(all.len(), 4000);
        assert!(q.wait_drained(Some(Duration::from_millis(10))));
    }

    #[test]
    fn test_wait_drained_times_out_while_claimed() {
        let q = WorkQueue::new(4);
        q.push(1);
        let claim = q.claim().unwrap();
        assert!(q.is_empty());
        assert!(!q.wait_drained(Some(Duration::from_millis(20))));
        drop(claim);
        assert!(q.wait_drained(Some(Duration::from_millis(20))));
    }

    #[test]
    fn test_wait_drained_wakes_on_completion() {
        let q = Arc::new(WorkQueue::new(4));
        q.push(1);

        let q_clone = Arc::clone(&q);
        let worker = thread::spawn(move || {
            thread::sleep(Duration::from_millis(30));
            q_clone.pop()
        });

        assert!(q.wait_drained(None));
        assert_eq!(worker.join().unwrap(), Some(1));
    }

    #[test]
    fn test_signal_counters() {
        let signal = WorkerSignal::new();
        signal.publish(2, 3);
        assert!(signal.should_poll());
        assert_eq!(signal.active_workers(), 3);

        assert!(signal.consume());
        assert!(signal.consume());
        assert!(!signal.consume());
        assert!(!signal.should_poll());

        signal.worker_exit();
        assert_eq!(signal.active_workers(), 2);
    }

    #[test]
    fn test_worker_exit_stops_at_zero() {
        let signal = WorkerSignal::new();
        signal.publish(1, 1);
        signal.worker_exit();
        signal.worker_exit();
        assert_eq!(signal.active_workers(), 0);
    }
}
