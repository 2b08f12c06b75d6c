//! 指令模型
//!
//! 前端降级产生的寄存器指令流，以及发射这些指令的构建器

pub mod builder;
pub mod bytecode;

pub use builder::{FunctionBuilder, JumpPatch};
pub use bytecode::{Function, Instruction, OpCode, Reg, ResultType};
