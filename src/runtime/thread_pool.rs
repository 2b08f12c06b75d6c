//! 工作窃取线程池
//!
//! 固定数量的工作线程在 `start()` 时创建、在 `stop()` 时汇合。
//! 每个工作线程按顺序取任务：自己的本地队列、兄弟线程的本地队列（窃取）、
//! 调度器的全局队列。调度器关闭后，工作线程排空本地队列再退出。

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_deque::{Injector, Steal};
use parking_lot::{Mutex, RwLock};

use super::scheduler::{NextTask, Scheduler, Task};
use crate::config::DEFAULT_IDLE_POLL_MS;
use crate::error::RuntimeError;

const STATE_IDLE: u8 = 0;
const STATE_RUNNING: u8 = 1;
const STATE_STOPPED: u8 = 2;

/// 工作线程共享的状态
struct PoolShared {
    scheduler: Arc<Scheduler>,
    /// 每个工作线程的本地队列
    locals: RwLock<Arc<[Injector<Task>]>>,
    executed: AtomicU64,
    stolen: AtomicU64,
    panicked: AtomicU64,
    idle_poll: Duration,
}

impl PoolShared {
    fn run(&self, worker: usize, task: Task) {
        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(task)) {
            let message = panic_message(payload.as_ref());
            tracing::error!(
                target: "regvm::runtime::pool",
                worker,
                %message,
                "task panicked"
            );
            self.panicked.fetch_add(1, Ordering::Relaxed);
        }
        self.executed.fetch_add(1, Ordering::Relaxed);
    }
}

/// 取出 panic 负载中的消息
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "<non-string panic>".to_string())
}

fn local_queues(count: usize) -> Arc<[Injector<Task>]> {
    (0..count).map(|_| Injector::new()).collect::<Vec<_>>().into()
}

fn steal_from(queue: &Injector<Task>) -> Option<Task> {
    std::iter::repeat_with(|| queue.steal())
        .find(|s| !s.is_retry())
        .and_then(Steal::success)
}

/// 先取自己的队列，再依次窃取兄弟线程的队列
fn find_local(index: usize, locals: &[Injector<Task>], shared: &PoolShared) -> Option<Task> {
    if let Some(task) = steal_from(&locals[index]) {
        return Some(task);
    }
    let count = locals.len();
    let task = (1..count)
        .map(|offset| (index + offset) % count)
        .find_map(|victim| steal_from(&locals[victim]))?;
    shared.stolen.fetch_add(1, Ordering::Relaxed);
    Some(task)
}

fn worker_loop(index: usize, shared: Arc<PoolShared>, locals: Arc<[Injector<Task>]>) {
    tracing::trace!(target: "regvm::runtime::pool", worker = index, "worker started");
    loop {
        if let Some(task) = find_local(index, &locals, &shared) {
            shared.run(index, task);
            continue;
        }
        match shared.scheduler.next_task_timeout(shared.idle_poll) {
            NextTask::Task(task) => shared.run(index, task),
            NextTask::Idle => {}
            NextTask::Shutdown => {
                while let Some(task) = find_local(index, &locals, &shared) {
                    shared.run(index, task);
                }
                break;
            }
        }
    }
    tracing::trace!(target: "regvm::runtime::pool", worker = index, "worker exited");
}

/// 线程池
pub struct ThreadPool {
    shared: Arc<PoolShared>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    worker_count: RwLock<usize>,
    state: AtomicU8,
}

impl ThreadPool {
    /// 创建线程池；`num_threads` 为 0 时使用 CPU 核心数
    pub fn new(num_threads: usize, scheduler: Arc<Scheduler>) -> Self {
        Self::with_idle_poll(num_threads, scheduler, Duration::from_millis(DEFAULT_IDLE_POLL_MS))
    }

    /// 指定空闲轮询间隔
    pub fn with_idle_poll(num_threads: usize, scheduler: Arc<Scheduler>, idle_poll: Duration) -> Self {
        let count = if num_threads == 0 {
            num_cpus::get()
        } else {
            num_threads
        };
        Self {
            shared: Arc::new(PoolShared {
                scheduler,
                locals: RwLock::new(local_queues(count)),
                executed: AtomicU64::new(0),
                stolen: AtomicU64::new(0),
                panicked: AtomicU64::new(0),
                idle_poll,
            }),
            workers: Mutex::new(Vec::with_capacity(count)),
            worker_count: RwLock::new(count),
            state: AtomicU8::new(STATE_IDLE),
        }
    }

    /// 启动工作线程
    pub fn start(&self) -> Result<(), RuntimeError> {
        if self
            .state
            .compare_exchange(STATE_IDLE, STATE_RUNNING, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Ok(()); // 已经启动过
        }

        let count = *self.worker_count.read();
        let locals = Arc::clone(&*self.shared.locals.read());
        let mut workers = self.workers.lock();
        for index in 0..count {
            let name = format!("pool-worker-{}", index);
            let shared = Arc::clone(&self.shared);
            let locals = Arc::clone(&locals);
            let handle = thread::Builder::new()
                .name(name.clone())
                .spawn(move || worker_loop(index, shared, locals))
                .map_err(|source| RuntimeError::Spawn { name, source })?;
            workers.push(handle);
        }
        Ok(())
    }

    /// 停止：关闭调度器并汇合所有工作线程
    ///
    /// 返回后所有已提交的任务要么执行完毕，要么从未出队
    pub fn stop(&self) {
        if self.state.swap(STATE_STOPPED, Ordering::AcqRel) == STATE_STOPPED {
            return;
        }
        self.shared.scheduler.shutdown();

        let workers: Vec<_> = self.workers.lock().drain(..).collect();
        for handle in workers {
            if handle.join().is_err() {
                tracing::error!(target: "regvm::runtime::pool", "worker thread panicked");
            }
        }
    }

    #[inline]
    pub fn is_running(&self) -> bool {
        self.state.load(Ordering::Acquire) == STATE_RUNNING
    }

    /// 提交到全局队列
    pub fn submit<F>(&self, task: F) -> Result<(), RuntimeError>
    where
        F: FnOnce() + Send + 'static,
    {
        self.shared.scheduler.submit(task)
    }

    /// 提交到指定工作线程的本地队列，越界索引按取模分配
    pub fn submit_to_worker<F>(&self, worker: usize, task: F) -> Result<(), RuntimeError>
    where
        F: FnOnce() + Send + 'static,
    {
        if self.state.load(Ordering::Acquire) == STATE_STOPPED {
            return Err(RuntimeError::PoolNotRunning);
        }
        let locals = self.shared.locals.read();
        if locals.is_empty() {
            return Err(RuntimeError::PoolNotRunning);
        }
        locals[worker % locals.len()].push(Box::new(task));
        Ok(())
    }

    /// 调整工作线程数，仅在启动前有效
    pub fn set_worker_count(&self, count: usize) -> bool {
        if self.state.load(Ordering::Acquire) != STATE_IDLE || count == 0 {
            return false;
        }
        let mut current = self.worker_count.write();
        if *current != count {
            *current = count;
            // 启动前提交到本地队列的任务转入全局队列
            let old = std::mem::replace(&mut *self.shared.locals.write(), local_queues(count));
            for queue in old.iter() {
                while let Some(task) = steal_from(queue) {
                    if self.shared.scheduler.submit_boxed(task).is_err() {
                        break;
                    }
                }
            }
        }
        true
    }

    pub fn worker_count(&self) -> usize {
        *self.worker_count.read()
    }

    /// 每个工作线程本地队列的长度
    pub fn queue_sizes(&self) -> Vec<usize> {
        self.shared.locals.read().iter().map(|q| q.len()).collect()
    }

    /// 所有排队任务数（本地 + 全局）
    pub fn total_queued(&self) -> usize {
        self.queue_sizes().iter().sum::<usize>() + self.shared.scheduler.queued()
    }

    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.shared.scheduler
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            workers: self.worker_count(),
            executed: self.shared.executed.load(Ordering::Relaxed),
            stolen: self.shared.stolen.load(Ordering::Relaxed),
            panicked: self.shared.panicked.load(Ordering::Relaxed),
        }
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        if self.state.load(Ordering::Acquire) == STATE_RUNNING {
            self.stop();
        }
    }
}

/// 线程池统计
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    pub workers: usize,
    pub executed: u64,
    pub stolen: u64,
    pub panicked: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn counting_pool(threads: usize) -> (ThreadPool, Arc<AtomicUsize>) {
        let pool = ThreadPool::with_idle_poll(
            threads,
            Arc::new(Scheduler::new()),
            Duration::from_millis(1),
        );
        (pool, Arc::new(AtomicUsize::new(0)))
    }

    #[test]
    fn test_thousand_tasks_complete_before_stop_returns() {
        let (pool, counter) = counting_pool(4);
        pool.start().unwrap();
        for _ in 0..1000 {
            let counter = Arc::clone(&counter);
            pool.submit(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        }
        pool.stop();

        assert_eq!(counter.load(Ordering::SeqCst), 1000);
        assert!(!pool.is_running());
        assert_eq!(pool.stats().executed, 1000);
        assert!(pool.submit(|| {}).is_err());
    }

    #[test]
    fn test_local_queue_is_drained_by_siblings() {
        let (pool, counter) = counting_pool(4);
        for _ in 0..200 {
            let counter = Arc::clone(&counter);
            pool.submit_to_worker(0, move || {
                counter.fetch_add(1, Ordering::SeqCst);
                thread::sleep(Duration::from_micros(100));
            })
            .unwrap();
        }
        assert_eq!(pool.queue_sizes()[0], 200);
        assert_eq!(pool.total_queued(), 200);

        pool.start().unwrap();
        pool.stop();
        assert_eq!(counter.load(Ordering::SeqCst), 200);
        assert_eq!(pool.total_queued(), 0);
    }

    #[test]
    fn test_panicking_task_does_not_kill_worker() {
        let (pool, counter) = counting_pool(1);
        pool.start().unwrap();
        pool.submit(|| panic!("boom")).unwrap();
        let c = Arc::clone(&counter);
        pool.submit(move || {
            c.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();
        pool.stop();

        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert_eq!(pool.stats().panicked, 1);
    }

    #[test]
    fn test_set_worker_count_before_start_only() {
        let (pool, counter) = counting_pool(2);
        let c = Arc::clone(&counter);
        pool.submit_to_worker(1, move || {
            c.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();

        assert!(pool.set_worker_count(3));
        assert_eq!(pool.worker_count(), 3);
        assert_eq!(pool.queue_sizes(), vec![0, 0, 0]);

        pool.start().unwrap();
        assert!(!pool.set_worker_count(5));
        pool.stop();
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert!(matches!(
            pool.submit_to_worker(0, || {}),
            Err(RuntimeError::PoolNotRunning)
        ));
    }
}
