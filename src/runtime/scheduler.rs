//! 操作系统线程级调度器
//!
//! 一个 `Channel<Task>` 任务队列，由线程池中的工作线程阻塞拉取。
//! 关闭队列即是取消原语：已出队的任务执行到底，未出队的任务不再被取走。

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use super::channel::{Channel, RecvTimeoutError};
use crate::error::RuntimeError;

/// 零参数的工作单元
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// 限时取任务的结果
pub enum NextTask {
    /// 取到任务
    Task(Task),
    /// 超时，调度器仍在运行
    Idle,
    /// 已关闭且队列为空
    Shutdown,
}

/// 调度器
pub struct Scheduler {
    /// 任务队列
    queue: Channel<Task>,
    /// 累计提交数
    submitted: AtomicU64,
    /// 累计出队数
    dispatched: AtomicU64,
    /// 创建时间
    start_time: Instant,
}

impl Scheduler {
    /// 创建无界调度器
    pub fn new() -> Self {
        Self::with_queue(Channel::unbounded())
    }

    /// 创建有界调度器，队列满时 `submit` 阻塞
    pub fn bounded(capacity: usize) -> Self {
        Self::with_queue(Channel::bounded(capacity))
    }

    fn with_queue(queue: Channel<Task>) -> Self {
        Self {
            queue,
            submitted: AtomicU64::new(0),
            dispatched: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    /// 提交任务
    pub fn submit<F>(&self, task: F) -> Result<(), RuntimeError>
    where
        F: FnOnce() + Send + 'static,
    {
        self.submit_boxed(Box::new(task))
    }

    /// 提交已装箱的任务
    pub fn submit_boxed(&self, task: Task) -> Result<(), RuntimeError> {
        self.queue
            .send(task)
            .map_err(|_| RuntimeError::SchedulerClosed)?;
        self.submitted.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// 取下一个任务（阻塞），关闭且为空时返回 None
    pub fn get_next_task(&self) -> Option<Task> {
        let task = self.queue.receive()?;
        self.dispatched.fetch_add(1, Ordering::Relaxed);
        Some(task)
    }

    /// 限时取下一个任务
    pub fn next_task_timeout(&self, timeout: Duration) -> NextTask {
        match self.queue.receive_timeout(timeout) {
            Ok(task) => {
                self.dispatched.fetch_add(1, Ordering::Relaxed);
                NextTask::Task(task)
            }
            Err(RecvTimeoutError::Timeout) => NextTask::Idle,
            Err(RecvTimeoutError::Closed) => NextTask::Shutdown,
        }
    }

    /// 关闭任务队列，唤醒所有阻塞的取任务者
    pub fn shutdown(&self) {
        if self.queue.close() {
            tracing::debug!(
                target: "regvm::runtime::scheduler",
                queued = self.queue.len(),
                "scheduler shut down"
            );
        }
    }

    #[inline]
    pub fn is_shutdown(&self) -> bool {
        self.queue.is_closed()
    }

    /// 排队中的任务数
    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    /// 获取调度统计
    pub fn stats(&self) -> SchedulerStats {
        SchedulerStats {
            submitted: self.submitted.load(Ordering::Relaxed),
            dispatched: self.dispatched.load(Ordering::Relaxed),
            queued: self.queued(),
            shutdown: self.is_shutdown(),
            elapsed: self.start_time.elapsed(),
        }
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("queue", &self.queue)
            .field("submitted", &self.submitted.load(Ordering::Relaxed))
            .finish()
    }
}

/// 调度统计信息
#[derive(Debug, Clone)]
pub struct SchedulerStats {
    pub submitted: u64,
    pub dispatched: u64,
    pub queued: usize,
    pub shutdown: bool,
    pub elapsed: Duration,
}
