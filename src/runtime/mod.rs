//! 并发运行时模块
//!
//! 为寄存器虚拟机提供并发原语
//!
//! 核心组件：
//! - Channel: 线程安全 FIFO，可选容量上限
//! - TaskScheduler: 单线程协作式任务调度（逻辑时钟驱动）
//! - Scheduler / ThreadPool: 全局任务队列 + 工作窃取线程池
//! - EventLoop: 平台 I/O 就绪通知（epoll / kqueue / IOCP）
//! - ConcurrencyRuntime: 把以上组件组装在一起的门面

pub mod channel;
pub mod cooperative;
pub mod event_loop;
pub mod ffi;
pub mod queue;
pub mod runtime;
pub mod scheduler;
pub mod task;
pub mod thread_pool;

pub use channel::{Channel, RecvTimeoutError, TrySendError};
pub use cooperative::TaskScheduler;
pub use event_loop::{EventCallback, EventLoop, EventLoopBackend, RawDescriptor, NO_DESCRIPTOR};
pub use ffi::RuntimeHooks;
pub use queue::{WorkClaim, WorkQueue, WorkerSignal};
pub use runtime::{
    ChannelManager, ConcurrencyRuntime, ErrorCollector, ErrorHandlingStrategy, RuntimeConfig,
    RuntimeStats, TaskFailure,
};
pub use scheduler::{NextTask, Scheduler, SchedulerStats, Task};
pub use task::{TaskBody, TaskContext, TaskField, TaskState};
pub use thread_pool::{PoolStats, ThreadPool};

/// 获取当前 CPU 核心数
pub fn num_processors() -> usize {
    num_cpus::get()
}
