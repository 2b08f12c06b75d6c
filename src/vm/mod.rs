//! 虚拟机模块
//!
//! 寄存器文件、句柄表与指令分发循环

pub mod handles;
pub mod value;
pub mod vm;

pub use handles::HandleTable;
pub use value::RegisterValue;
pub use vm::{NativeFn, ParallelKernel, RegisterVm, VmConfig};
