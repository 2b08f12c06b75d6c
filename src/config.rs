//! 配置常量模块
//!
//! 虚拟机与并发运行时共用的常量都在这里定义，便于后期修改

/// 虚拟机名称
pub const VM_NAME: &str = "regvm";

/// 版本号
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// 寄存器文件大小（虚拟寄存器数量）
pub const REGISTER_COUNT: usize = 1024;

/// 协作式 Channel 的默认容量（申请容量 <= 0 时使用）
pub const DEFAULT_CHANNEL_CAPACITY: usize = 32;

/// 协作式 Channel 的容量上限，超过时分配失败
pub const MAX_CHANNEL_CAPACITY: usize = 1 << 16;

/// 无锁工作队列的默认容量
pub const DEFAULT_WORK_QUEUE_CAPACITY: usize = 1024;

/// 无锁工作队列的容量上限
pub const MAX_WORK_QUEUE_CAPACITY: usize = 1 << 16;

/// 任务上下文槽位总数上限
pub const MAX_TASK_CONTEXTS: usize = 1 << 16;

/// 事件循环每次等待最多取回的事件数
pub const EVENT_BATCH_SIZE: usize = 10;

/// 最大调用深度
pub const MAX_CALL_DEPTH: usize = 64;

/// 错误 ID 起点，错误值向下分配（-1000000, -1000001, ...）
pub const ERROR_ID_BASE: i64 = -1_000_000;

/// 工作线程空闲时轮询全局队列的间隔（毫秒）
pub const DEFAULT_IDLE_POLL_MS: u64 = 10;

/// 环境变量：工作线程数
pub const ENV_WORKERS: &str = "REGVM_WORKERS";

/// 环境变量：命名 Channel 默认容量
pub const ENV_CHANNEL_CAPACITY: &str = "REGVM_CHANNEL_CAPACITY";

/// 环境变量：日志过滤
pub const ENV_LOG: &str = "REGVM_LOG";
