//! regvm: 寄存器字节码虚拟机与并发运行时
//!
//! - `compiler`: 寄存器指令模型与函数构建器
//! - `vm`: 寄存器值、句柄表与分发循环
//! - `runtime`: Channel、协作式调度、线程池、事件循环与 C 钩子边界

pub mod compiler;
pub mod config;
pub mod error;
pub mod runtime;
pub mod vm;

pub use compiler::{Function, FunctionBuilder, Instruction, OpCode, Reg, ResultType};
pub use error::{RuntimeError, VmError};
pub use runtime::{Channel, ConcurrencyRuntime, EventLoop, RuntimeConfig, Scheduler, ThreadPool};
pub use vm::{RegisterValue, RegisterVm, VmConfig};
