//! 协作式调度器
//!
//! 运行在虚拟机的分发线程上，拥有全部任务上下文、协作式 Channel 表和 tick 时钟。
//! 调度器只推进状态，从不执行字节码；任务体由虚拟机按指令区间执行。

use crate::config::{DEFAULT_CHANNEL_CAPACITY, MAX_CHANNEL_CAPACITY, MAX_TASK_CONTEXTS};
use crate::vm::{HandleTable, RegisterValue};

use super::channel::{Channel, TrySendError};
use super::task::{TaskContext, TaskState};

/// 协作式调度器
#[derive(Debug, Default)]
pub struct TaskScheduler {
    /// 任务上下文（按句柄顺序即调度顺序）
    tasks: HandleTable<TaskContext>,
    /// 协作式 Channel 表
    channels: HandleTable<Channel<RegisterValue>>,
    /// 单调递增的 tick
    current_time: u64,
}

impl TaskScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// 重置任务与时钟；Channel 表保留
    pub fn reset(&mut self) {
        self.tasks.clear();
        self.current_time = 0;
    }

    #[inline]
    pub fn current_time(&self) -> u64 {
        self.current_time
    }

    #[inline]
    pub fn task_count(&self) -> usize {
        self.tasks.len()
    }

    // ========================================================================
    // 任务上下文
    // ========================================================================

    /// 批量分配上下文，返回首个句柄（句柄连续，task_id 等于句柄）
    ///
    /// 数量为 0 或槽位总数将超过 MAX_TASK_CONTEXTS 时返回 None
    pub fn alloc_contexts(&mut self, count: usize) -> Option<usize> {
        if count == 0 {
            return None;
        }
        self.tasks
            .insert_contiguous(count, MAX_TASK_CONTEXTS, |handle| TaskContext::new(handle as i64))
    }

    /// 初始化并入队：Init/Running/Sleeping -> Running，完成态拒绝
    pub fn init_context(&mut self, handle: i64) -> bool {
        match self.tasks.lookup_mut(handle) {
            Some(task) if !task.is_completed() => task.set_state(TaskState::Running),
            _ => false,
        }
    }

    #[inline]
    pub fn task(&self, handle: i64) -> Option<&TaskContext> {
        self.tasks.lookup(handle)
    }

    #[inline]
    pub fn task_mut(&mut self, handle: i64) -> Option<&mut TaskContext> {
        self.tasks.lookup_mut(handle)
    }

    /// 让任务睡眠 `ticks` 个 tick
    pub fn sleep(&mut self, handle: i64, ticks: u64) -> bool {
        let until = self.current_time.saturating_add(ticks);
        self.tasks
            .lookup_mut(handle)
            .map_or(false, |task| task.sleep_until(until))
    }

    /// 推进一个 tick，唤醒到期的睡眠任务，返回唤醒数
    pub fn tick(&mut self) -> usize {
        self.current_time += 1;
        let now = self.current_time;
        let mut woken = 0;
        for handle in self.tasks.handles() {
            if let Some(task) = self.tasks.get_mut(handle) {
                if task.wake_if_due(now) {
                    woken += 1;
                }
            }
        }
        woken
    }

    /// 本轮要执行的任务
    ///
    /// 未初始化的上下文被提升为 Running；睡眠和已完成的任务跳过。
    pub fn begin_pass(&mut self) -> Vec<usize> {
        let mut runnable = Vec::new();
        for handle in self.tasks.handles() {
            let Some(task) = self.tasks.get_mut(handle) else {
                continue;
            };
            match task.state() {
                TaskState::Init => {
                    task.set_state(TaskState::Running);
                    runnable.push(handle);
                }
                TaskState::Running => runnable.push(handle),
                TaskState::Sleeping | TaskState::Completed => {}
            }
        }
        runnable
    }

    /// 完成任务的一个工作单元
    ///
    /// 没有任务体时计数器加一；有任务体时使用任务体算出的计数器。
    /// 若绑定了输出 Channel，把计数器推入其中，然后标记完成。
    pub fn finish_task(&mut self, handle: usize, body_counter: Option<i64>) -> bool {
        let Some(task) = self.tasks.get_mut(handle) else {
            return false;
        };
        if task.is_completed() {
            return false;
        }

        task.counter = body_counter.unwrap_or_else(|| task.counter.wrapping_add(1));
        let counter = task.counter;
        let output = task.output_channel;
        task.set_state(TaskState::Completed);

        if let Some(channel) = output.and_then(|h| self.channels.get(h)) {
            if let Err(err) = channel.try_send(RegisterValue::Int(counter)) {
                let reason = match err {
                    TrySendError::Full(_) => "full",
                    TrySendError::Closed(_) => "closed",
                };
                tracing::debug!(
                    target: "regvm::runtime::cooperative",
                    task = handle,
                    reason,
                    "dropped task output"
                );
            }
        }
        true
    }

    /// 是否有未完成的任务设置了任务体
    pub fn has_task_bodies(&self) -> bool {
        self.tasks
            .iter()
            .any(|(_, task)| task.body.is_some() && !task.is_completed())
    }

    /// 单遍执行所有任务的基础工作单元（无任务体），返回执行数
    ///
    /// 没有任务体时虚拟机的 SchedulerRun 直接走这里
    pub fn run(&mut self) -> usize {
        self.begin_pass()
            .into_iter()
            .filter(|&handle| self.finish_task(handle, None))
            .count()
    }

    // ========================================================================
    // 协作式 Channel
    // ========================================================================

    /// 分配 Channel；容量 <= 0 时使用默认容量，超过 MAX_CHANNEL_CAPACITY 时返回 None
    pub fn alloc_channel(&mut self, capacity: i64) -> Option<usize> {
        let capacity = match usize::try_from(capacity) {
            Ok(0) | Err(_) => DEFAULT_CHANNEL_CAPACITY,
            Ok(c) if c > MAX_CHANNEL_CAPACITY => return None,
            Ok(c) => c,
        };
        Some(self.channels.insert(Channel::bounded(capacity)))
    }

    #[inline]
    pub fn channel(&self, handle: i64) -> Option<&Channel<RegisterValue>> {
        self.channels.lookup(handle)
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_pushes_wired_counter() {
        let mut sched = TaskScheduler::new();
        let first = sched.alloc_contexts(3).unwrap();
        for h in first..first + 3 {
            assert!(sched.init_context(h as i64));
        }
        let ch = sched.alloc_channel(0).unwrap();
        sched
            .task_mut(first as i64)
            .unwrap()
            .output_channel = Some(ch);

        assert_eq!(sched.run(), 3);

        let channel = sched.channel(ch as i64).unwrap();
        assert_eq!(channel.capacity(), Some(DEFAULT_CHANNEL_CAPACITY));
        assert_eq!(channel.len(), 1);
        assert_eq!(channel.try_receive(), Some(RegisterValue::Int(1)));
        for h in first..first + 3 {
            assert_eq!(sched.task(h as i64).unwrap().state(), TaskState::Completed);
        }
    }

    #[test]
    fn test_completed_context_rejects_init() {
        let mut sched = TaskScheduler::new();
        let h = sched.alloc_contexts(1).unwrap() as i64;
        sched.run();
        assert!(!sched.init_context(h));
        assert_eq!(sched.run(), 0);
    }

    #[test]
    fn test_tick_wakes_only_due_sleepers() {
        let mut sched = TaskScheduler::new();
        let first = sched.alloc_contexts(2).unwrap() as i64;
        sched.init_context(first);
        sched.init_context(first + 1);
        assert!(sched.sleep(first, 2));
        assert!(sched.sleep(first + 1, 5));

        // 睡眠任务不参与执行
        assert_eq!(sched.run(), 0);

        assert_eq!(sched.tick(), 0);
        assert_eq!(sched.tick(), 1);
        assert_eq!(sched.task(first).unwrap().state(), TaskState::Running);
        assert_eq!(sched.task(first + 1).unwrap().state(), TaskState::Sleeping);
        assert_eq!(sched.current_time(), 2);

        assert_eq!(sched.run(), 1);
    }

    #[test]
    fn test_reset_keeps_channels() {
        let mut sched = TaskScheduler::new();
        sched.alloc_contexts(4).unwrap();
        let ch = sched.alloc_channel(2).unwrap();
        sched.tick();
        sched.reset();

        assert_eq!(sched.task_count(), 0);
        assert_eq!(sched.current_time(), 0);
        assert!(sched.channel(ch as i64).is_some());
        assert_eq!(sched.alloc_contexts(1), Some(0));
    }

    #[test]
    fn test_oversized_allocations_are_rejected() {
        let mut sched = TaskScheduler::new();
        assert_eq!(sched.alloc_contexts(0), None);
        assert_eq!(sched.alloc_contexts(usize::MAX), None);
        assert_eq!(sched.alloc_contexts(MAX_TASK_CONTEXTS + 1), None);
        assert_eq!(sched.task_count(), 0);

        let first = sched.alloc_contexts(MAX_TASK_CONTEXTS - 1).unwrap();
        assert_eq!(first, 0);
        assert_eq!(sched.alloc_contexts(2), None);
        assert_eq!(sched.alloc_contexts(1), Some(MAX_TASK_CONTEXTS - 1));

        assert_eq!(sched.alloc_channel(i64::MAX), None);
        assert_eq!(sched.alloc_channel(MAX_CHANNEL_CAPACITY as i64 + 1), None);
        assert!(sched.alloc_channel(MAX_CHANNEL_CAPACITY as i64).is_some());
        assert_eq!(sched.channel_count(), 1);
    }
}
