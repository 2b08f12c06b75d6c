//! 并发运行时入口
//!
//! 把调度器、线程池和事件循环组合成一个整体，并提供命名 Channel、
//! 并发错误收集与错误处理策略。

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::{Condvar, Mutex, RwLock};

use super::channel::Channel;
use super::event_loop::EventLoop;
use super::scheduler::Scheduler;
use super::thread_pool::{panic_message, ThreadPool};
use crate::config::{DEFAULT_CHANNEL_CAPACITY, DEFAULT_IDLE_POLL_MS, ENV_CHANNEL_CAPACITY, ENV_WORKERS};
use crate::error::RuntimeError;
use crate::vm::RegisterValue;

// ============================================================================
// 配置
// ============================================================================

/// 并发错误处理策略
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ErrorHandlingStrategy {
    /// 第一个错误出现后停止执行后续任务
    #[default]
    Stop,
    /// 继续执行其余任务，收集错误
    Auto,
    /// 失败的任务重试，最多 `max_attempts` 次
    Retry { max_attempts: u32 },
}

/// 运行时配置
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// 工作线程数（0 表示使用 CPU 核心数）
    pub num_workers: usize,
    /// 命名 Channel 的默认容量
    pub channel_capacity: usize,
    /// 工作线程空闲轮询间隔
    pub idle_poll: Duration,
    /// 初始错误处理策略
    pub error_strategy: ErrorHandlingStrategy,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            num_workers: 0,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            idle_poll: Duration::from_millis(DEFAULT_IDLE_POLL_MS),
            error_strategy: ErrorHandlingStrategy::Stop,
        }
    }
}

impl RuntimeConfig {
    /// 默认配置，再用环境变量覆盖
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(workers) = env_usize(ENV_WORKERS) {
            config.num_workers = workers;
        }
        if let Some(capacity) = env_usize(ENV_CHANNEL_CAPACITY) {
            config.channel_capacity = capacity;
        }
        config
    }

    /// 实际使用的工作线程数
    pub fn worker_threads(&self) -> usize {
        if self.num_workers == 0 {
            num_cpus::get()
        } else {
            self.num_workers
        }
    }
}

fn env_usize(key: &str) -> Option<usize> {
    let raw = std::env::var(key).ok()?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!(target: "regvm::runtime", key, value = %raw, "ignoring malformed environment value");
            None
        }
    }
}

// ============================================================================
// 错误收集
// ============================================================================

/// 一次任务失败
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskFailure {
    pub task_id: u64,
    pub message: String,
    pub attempts: u32,
}

/// 线程安全的并发错误收集器
#[derive(Debug, Default)]
pub struct ErrorCollector {
    errors: Mutex<Vec<TaskFailure>>,
    has_errors: AtomicBool,
}

impl ErrorCollector {
    pub fn add(&self, failure: TaskFailure) {
        self.errors.lock().push(failure);
        self.has_errors.store(true, Ordering::Release);
    }

    /// 返回副本
    pub fn errors(&self) -> Vec<TaskFailure> {
        self.errors.lock().clone()
    }

    #[inline]
    pub fn has_errors(&self) -> bool {
        self.has_errors.load(Ordering::Acquire)
    }

    pub fn len(&self) -> usize {
        self.errors.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        !self.has_errors()
    }

    pub fn clear(&self) {
        self.errors.lock().clear();
        self.has_errors.store(false, Ordering::Release);
    }
}

// ============================================================================
// 命名 Channel
// ============================================================================

/// 按名称管理的 Channel
#[derive(Debug)]
pub struct ChannelManager {
    channels: DashMap<String, Arc<Channel<RegisterValue>>>,
    default_capacity: usize,
}

impl ChannelManager {
    pub fn new(default_capacity: usize) -> Self {
        Self {
            channels: DashMap::new(),
            default_capacity,
        }
    }

    /// 创建 Channel；同名 Channel 已存在时返回已有的
    pub fn create(&self, name: &str) -> Arc<Channel<RegisterValue>> {
        let capacity = self.default_capacity;
        self.channels
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(Channel::bounded(capacity)))
            .clone()
    }

    pub fn get(&self, name: &str) -> Option<Arc<Channel<RegisterValue>>> {
        self.channels.get(name).map(|entry| Arc::clone(entry.value()))
    }

    /// 关闭指定 Channel，返回是否存在
    pub fn close(&self, name: &str) -> bool {
        match self.channels.get(name) {
            Some(channel) => {
                channel.close();
                true
            }
            None => false,
        }
    }

    pub fn close_all(&self) {
        for entry in self.channels.iter() {
            entry.value().close();
        }
    }

    /// 移出管理（不关闭）
    pub fn remove(&self, name: &str) -> Option<Arc<Channel<RegisterValue>>> {
        self.channels.remove(name).map(|(_, channel)| channel)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.channels.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }
}

// ============================================================================
// 统计
// ============================================================================

#[derive(Debug, Default)]
struct RuntimeCounters {
    spawned: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    skipped: AtomicU64,
}

/// 运行时统计快照
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RuntimeStats {
    pub spawned: u64,
    pub completed: u64,
    pub failed: u64,
    /// 因停止策略而未执行的任务
    pub skipped: u64,
    pub channels: usize,
    pub active_blocks: usize,
}

/// 活跃并发块计数，归零时唤醒等待者
#[derive(Debug, Default)]
struct ActiveBlocks {
    count: AtomicUsize,
    lock: Mutex<()>,
    idle: Condvar,
}

impl ActiveBlocks {
    fn enter(&self) {
        self.count.fetch_add(1, Ordering::AcqRel);
    }

    fn exit(&self) {
        if self.count.fetch_sub(1, Ordering::AcqRel) == 1 {
            let _guard = self.lock.lock();
            self.idle.notify_all();
        }
    }

    fn wait(&self, timeout: Option<Duration>) -> bool {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut guard = self.lock.lock();
        while self.count.load(Ordering::Acquire) > 0 {
            match deadline {
                Some(deadline) => {
                    if self.idle.wait_until(&mut guard, deadline).timed_out() {
                        return self.count.load(Ordering::Acquire) == 0;
                    }
                }
                None => self.idle.wait(&mut guard),
            }
        }
        true
    }
}

/// 离开作用域时结束一个活跃块，任务 panic 时也成立
struct ActiveGuard(Arc<ActiveBlocks>);

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.0.exit();
    }
}

// ============================================================================
// 运行时
// ============================================================================

/// 并发运行时
pub struct ConcurrencyRuntime {
    config: RuntimeConfig,
    scheduler: Arc<Scheduler>,
    pool: Arc<ThreadPool>,
    event_loop: Arc<EventLoop>,
    event_thread: Mutex<Option<JoinHandle<()>>>,
    channels: ChannelManager,
    errors: Arc<ErrorCollector>,
    counters: Arc<RuntimeCounters>,
    active: Arc<ActiveBlocks>,
    strategy: Arc<RwLock<ErrorHandlingStrategy>>,
    shutdown_requested: Arc<AtomicBool>,
    next_task_id: AtomicU64,
}

impl ConcurrencyRuntime {
    /// 创建并启动运行时；事件循环或工作线程创建失败是致命错误
    pub fn new(config: RuntimeConfig) -> Result<Self, RuntimeError> {
        let scheduler = Arc::new(Scheduler::new());
        let pool = Arc::new(ThreadPool::with_idle_poll(
            config.worker_threads(),
            Arc::clone(&scheduler),
            config.idle_poll,
        ));
        let event_loop = Arc::new(EventLoop::new()?);
        pool.start()?;

        tracing::debug!(
            target: "regvm::runtime",
            workers = pool.worker_count(),
            backend = event_loop.backend_name(),
            "concurrency runtime started"
        );

        Ok(Self {
            channels: ChannelManager::new(config.channel_capacity),
            strategy: Arc::new(RwLock::new(config.error_strategy)),
            config,
            scheduler,
            pool,
            event_loop,
            event_thread: Mutex::new(None),
            errors: Arc::new(ErrorCollector::default()),
            counters: Arc::new(RuntimeCounters::default()),
            active: Arc::new(ActiveBlocks::default()),
            shutdown_requested: Arc::new(AtomicBool::new(false)),
            next_task_id: AtomicU64::new(1),
        })
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    pub fn thread_pool(&self) -> &Arc<ThreadPool> {
        &self.pool
    }

    pub fn event_loop(&self) -> &Arc<EventLoop> {
        &self.event_loop
    }

    pub fn channels(&self) -> &ChannelManager {
        &self.channels
    }

    pub fn errors(&self) -> &ErrorCollector {
        &self.errors
    }

    pub fn set_error_strategy(&self, strategy: ErrorHandlingStrategy) {
        *self.strategy.write() = strategy;
    }

    pub fn error_strategy(&self) -> ErrorHandlingStrategy {
        *self.strategy.read()
    }

    /// 提交一个可能失败的任务，按当前策略处理失败
    ///
    /// 返回任务 ID
    pub fn spawn<F>(&self, mut task: F) -> Result<u64, RuntimeError>
    where
        F: FnMut() -> Result<(), String> + Send + 'static,
    {
        let task_id = self.next_task_id.fetch_add(1, Ordering::Relaxed);
        let errors = Arc::clone(&self.errors);
        let counters = Arc::clone(&self.counters);
        let active = Arc::clone(&self.active);
        let strategy = Arc::clone(&self.strategy);
        let shutdown = Arc::clone(&self.shutdown_requested);

        active.enter();
        let submitted = self.scheduler.submit(move || {
            let _active = ActiveGuard(active);
            if shutdown.load(Ordering::Acquire) {
                counters.skipped.fetch_add(1, Ordering::Relaxed);
                return;
            }

            let current = *strategy.read();
            let max_attempts = match current {
                ErrorHandlingStrategy::Retry { max_attempts } => max_attempts.max(1),
                _ => 1,
            };

            let mut attempts = 0;
            let outcome = loop {
                attempts += 1;
                // panic 按失败处理，与返回 Err 走同一条策略路径
                let result = panic::catch_unwind(AssertUnwindSafe(&mut task)).unwrap_or_else(
                    |payload| Err(format!("panicked: {}", panic_message(payload.as_ref()))),
                );
                match result {
                    Ok(()) => break Ok(()),
                    Err(message) if attempts >= max_attempts => break Err(message),
                    Err(message) => {
                        tracing::debug!(target: "regvm::runtime", task_id, attempts, %message, "retrying task");
                    }
                }
            };

            match outcome {
                Ok(()) => {
                    counters.completed.fetch_add(1, Ordering::Relaxed);
                }
                Err(message) => {
                    counters.failed.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(target: "regvm::runtime", task_id, attempts, %message, "task failed");
                    errors.add(TaskFailure {
                        task_id,
                        message,
                        attempts,
                    });
                    if current == ErrorHandlingStrategy::Stop {
                        shutdown.store(true, Ordering::Release);
                    }
                }
            }
        });

        if let Err(err) = submitted {
            self.active.exit();
            return Err(err);
        }
        self.counters.spawned.fetch_add(1, Ordering::Relaxed);
        Ok(task_id)
    }

    /// 在线程池中执行阻塞操作，结果通过接收端取回
    pub fn spawn_blocking<F, T>(&self, task: F) -> Result<crossbeam_channel::Receiver<T>, RuntimeError>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let (sender, receiver) = crossbeam_channel::bounded(1);
        self.pool.submit(move || {
            // 接收端可能已被丢弃
            let _ = sender.send(task());
        })?;
        Ok(receiver)
    }

    /// 在后台线程运行事件循环
    pub fn start_event_loop(&self) -> Result<(), RuntimeError> {
        let mut slot = self.event_thread.lock();
        if slot.is_some() {
            return Ok(());
        }
        let event_loop = Arc::clone(&self.event_loop);
        let name = "event-loop".to_string();
        let handle = thread::Builder::new()
            .name(name.clone())
            .spawn(move || {
                if let Err(error) = event_loop.run() {
                    tracing::error!(target: "regvm::runtime::event_loop", %error, "event loop terminated");
                }
            })
            .map_err(|source| RuntimeError::Spawn { name, source })?;
        *slot = Some(handle);
        Ok(())
    }

    /// 等待所有活跃任务结束；返回是否在超时前结束
    pub fn wait_for_active_blocks(&self, timeout: Option<Duration>) -> bool {
        self.active.wait(timeout)
    }

    pub fn request_shutdown(&self) {
        self.shutdown_requested.store(true, Ordering::Release);
    }

    #[inline]
    pub fn is_shutdown_requested(&self) -> bool {
        self.shutdown_requested.load(Ordering::Acquire)
    }

    /// 清除错误与停止标志，开始新一轮并发块
    pub fn reset_errors(&self) {
        self.errors.clear();
        self.shutdown_requested.store(false, Ordering::Release);
    }

    pub fn stats(&self) -> RuntimeStats {
        RuntimeStats {
            spawned: self.counters.spawned.load(Ordering::Relaxed),
            completed: self.counters.completed.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
            skipped: self.counters.skipped.load(Ordering::Relaxed),
            channels: self.channels.names().len(),
            active_blocks: self.active.count.load(Ordering::Acquire),
        }
    }

    /// 关闭：停止事件循环、关闭所有命名 Channel、汇合线程池
    pub fn shutdown(&self) {
        self.request_shutdown();
        self.event_loop.stop();
        if let Some(handle) = self.event_thread.lock().take() {
            if handle.join().is_err() {
                tracing::error!(target: "regvm::runtime", "event loop thread panicked");
            }
        }
        self.channels.close_all();
        self.pool.stop();
    }
}

impl Drop for ConcurrencyRuntime {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn runtime(workers: usize) -> ConcurrencyRuntime {
        ConcurrencyRuntime::new(RuntimeConfig {
            num_workers: workers,
            idle_poll: Duration::from_millis(1),
            ..RuntimeConfig::default()
        })
        .unwrap()
    }

    #[test]
    fn test_spawn_and_wait() {
        let rt = runtime(2);
        rt.set_error_strategy(ErrorHandlingStrategy::Auto);
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..50 {
            let counter = Arc::clone(&counter);
            rt.spawn(move || {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .unwrap();
        }
        assert!(rt.wait_for_active_blocks(Some(Duration::from_secs(5))));
        assert_eq!(counter.load(Ordering::SeqCst), 50);

        let stats = rt.stats();
        assert_eq!(stats.spawned, 50);
        assert_eq!(stats.completed, 50);
        assert_eq!(stats.active_blocks, 0);
    }

    #[test]
    fn test_retry_strategy_retries_until_success() {
        let rt = runtime(1);
        rt.set_error_strategy(ErrorHandlingStrategy::Retry { max_attempts: 3 });
        let calls = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&calls);
        rt.spawn(move || {
            if c.fetch_add(1, Ordering::SeqCst) < 2 {
                Err("transient".to_string())
            } else {
                Ok(())
            }
        })
        .unwrap();
        assert!(rt.wait_for_active_blocks(Some(Duration::from_secs(5))));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert!(!rt.errors().has_errors());
    }

    #[test]
    fn test_auto_strategy_collects_errors() {
        let rt = runtime(2);
        rt.set_error_strategy(ErrorHandlingStrategy::Auto);
        for i in 0..4 {
            rt.spawn(move || if i % 2 == 0 { Err(format!("task {} failed", i)) } else { Ok(()) })
                .unwrap();
        }
        assert!(rt.wait_for_active_blocks(Some(Duration::from_secs(5))));
        assert_eq!(rt.errors().len(), 2);
        assert!(!rt.is_shutdown_requested());
        assert_eq!(rt.stats().failed, 2);
    }

    #[test]
    fn test_stop_strategy_requests_shutdown() {
        let rt = runtime(1);
        rt.spawn(|| Err("fatal".to_string())).unwrap();
        assert!(rt.wait_for_active_blocks(Some(Duration::from_secs(5))));
        assert!(rt.is_shutdown_requested());
        assert_eq!(rt.errors().errors()[0].message, "fatal");

        // 停止后提交的任务不执行
        let ran = Arc::new(AtomicBool::new(false));
        let r = Arc::clone(&ran);
        rt.spawn(move || {
            r.store(true, Ordering::SeqCst);
            Ok(())
        })
        .unwrap();
        assert!(rt.wait_for_active_blocks(Some(Duration::from_secs(5))));
        assert!(!ran.load(Ordering::SeqCst));
        assert_eq!(rt.stats().skipped, 1);

        rt.reset_errors();
        assert!(rt.errors().is_empty());
    }

    #[test]
    fn test_panicking_task_counts_as_failure() {
        let rt = runtime(1);
        rt.set_error_strategy(ErrorHandlingStrategy::Auto);
        rt.spawn(|| panic!("boom")).unwrap();

        assert!(rt.wait_for_active_blocks(Some(Duration::from_secs(5))));
        let stats = rt.stats();
        assert_eq!(stats.active_blocks, 0);
        assert_eq!(stats.failed, 1);
        let errors = rt.errors().errors();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].message, "panicked: boom");
        assert!(!rt.is_shutdown_requested());
    }

    #[test]
    fn test_panicking_task_stops_runtime_under_stop_strategy() {
        let rt = runtime(1);
        rt.spawn(|| panic!("fatal panic")).unwrap();
        assert!(rt.wait_for_active_blocks(Some(Duration::from_secs(5))));
        assert!(rt.is_shutdown_requested());
    }

    #[test]
    fn test_spawn_blocking_returns_result() {
        let rt = runtime(2);
        let receiver = rt.spawn_blocking(|| 6 * 7).unwrap();
        assert_eq!(receiver.recv_timeout(Duration::from_secs(5)), Ok(42));
    }

    #[test]
    fn test_named_channels_closed_on_shutdown() {
        let rt = runtime(1);
        let results = rt.channels().create("results");
        let same = rt.channels().create("results");
        assert_eq!(results.id(), same.id());
        results.send(RegisterValue::Int(1)).unwrap();
        assert_eq!(rt.channels().names(), vec!["results".to_string()]);

        rt.start_event_loop().unwrap();
        rt.shutdown();

        assert!(results.is_closed());
        assert_eq!(results.receive(), Some(RegisterValue::Int(1)));
        assert_eq!(results.receive(), None);
        assert!(!rt.thread_pool().is_running());
    }

    #[test]
    fn test_channel_manager_remove_keeps_open() {
        let manager = ChannelManager::new(4);
        let ch = manager.create("a");
        assert!(manager.remove("a").is_some());
        assert!(manager.get("a").is_none());
        assert!(!manager.close("a"));
        assert!(!ch.is_closed());
        assert_eq!(ch.capacity(), Some(4));
    }
}
