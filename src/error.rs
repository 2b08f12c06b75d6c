//! 错误定义
//!
//! 只有构造期与入口处的失败才会以 `Result` 形式返回；
//! 单条指令的失败在虚拟机内部降级为哨兵值（空值或 0/1 标志）。

use std::io;

use thiserror::Error;

/// 运行时构造与提交错误
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// 事件循环的多路复用句柄创建失败
    #[error("failed to create {backend} event loop: {source}")]
    EventLoopCreate {
        backend: &'static str,
        #[source]
        source: io::Error,
    },

    /// 描述符注册失败
    #[error("failed to register descriptor {descriptor}: {source}")]
    Register {
        descriptor: i64,
        #[source]
        source: io::Error,
    },

    /// 等待事件时发生不可重试的错误
    #[error("event loop wait failed: {0}")]
    Wait(#[source] io::Error),

    /// 向已关闭的调度器提交任务
    #[error("scheduler is shut down")]
    SchedulerClosed,

    /// 线程池未启动或已停止
    #[error("thread pool is not running")]
    PoolNotRunning,

    /// 线程创建失败
    #[error("failed to spawn thread `{name}`: {source}")]
    Spawn {
        name: String,
        #[source]
        source: io::Error,
    },
}

/// 虚拟机入口错误
#[derive(Debug, Error)]
pub enum VmError {
    /// 寄存器操作数越界
    #[error("function `{function}`: instruction {pc} uses register r{register}, register file has {limit}")]
    RegisterOutOfRange {
        function: String,
        pc: usize,
        register: u32,
        limit: usize,
    },

    /// 跳转目标越界
    #[error("function `{function}`: instruction {pc} jumps to {target}, function has {len} instructions")]
    JumpOutOfRange {
        function: String,
        pc: usize,
        target: i64,
        len: usize,
    },

    /// 未注册的函数索引
    #[error("function `{function}`: instruction {pc} calls unknown function #{index}")]
    UnknownFunction {
        function: String,
        pc: usize,
        index: i64,
    },

    /// 执行的指令数超过上限
    #[error("instruction limit of {0} exceeded")]
    InstructionLimitExceeded(u64),

    /// 输出写入失败
    #[error("output error: {0}")]
    Output(#[from] io::Error),
}
