//! 函数构建器
//!
//! 供前端（以及测试、演示程序）按顺序发射指令，并回填前向跳转。

use super::bytecode::{Function, Instruction, OpCode, Reg, ResultType};
use crate::vm::RegisterValue;

/// 待回填的跳转指令位置
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JumpPatch(usize);

/// 函数构建器
#[derive(Debug, Default)]
pub struct FunctionBuilder {
    function: Function,
}

impl FunctionBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            function: Function::new(name),
        }
    }

    /// 设置参数个数
    pub fn params(mut self, count: usize) -> Self {
        self.function.param_count = count;
        self
    }

    /// 在旁表中声明寄存器的结果类型
    pub fn declare(&mut self, reg: Reg, result_type: ResultType) -> &mut Self {
        self.function.register_types.insert(reg, result_type);
        self
    }

    /// 下一条指令的位置
    #[inline]
    pub fn here(&self) -> usize {
        self.function.instructions.len()
    }

    /// 发射一条指令，返回其位置
    pub fn emit(&mut self, inst: Instruction) -> usize {
        self.function.instructions.push(inst);
        self.function.instructions.len() - 1
    }

    /// 发射无立即数的普通指令
    pub fn op(&mut self, op: OpCode, dst: Reg, a: Reg, b: Reg) -> usize {
        self.emit(Instruction::new(op, dst, a, b))
    }

    /// 加载常量
    pub fn load_const(
        &mut self,
        dst: Reg,
        value: impl Into<RegisterValue>,
        result_type: ResultType,
    ) -> usize {
        self.emit(
            Instruction::new(OpCode::LoadConst, dst, 0, 0)
                .constant(value)
                .typed(result_type),
        )
    }

    /// 带声明类型的二元运算
    pub fn binary(&mut self, op: OpCode, dst: Reg, a: Reg, b: Reg, result_type: ResultType) -> usize {
        self.emit(Instruction::new(op, dst, a, b).typed(result_type))
    }

    /// 发射前向跳转，目标稍后通过 `patch` 回填
    pub fn jump(&mut self, op: OpCode, cond: Reg) -> JumpPatch {
        debug_assert!(op.is_jump());
        JumpPatch(self.emit(Instruction::new(op, 0, cond, 0)))
    }

    /// 发射到已知位置的跳转（循环回边）
    pub fn jump_to(&mut self, op: OpCode, cond: Reg, target: usize) -> usize {
        debug_assert!(op.is_jump());
        self.emit(Instruction::new(op, 0, cond, 0).imm(target as i64))
    }

    /// 把跳转目标回填为当前位置
    pub fn patch(&mut self, patch: JumpPatch) {
        let here = self.here() as i64;
        self.function.instructions[patch.0].imm = here;
    }

    /// 函数调用
    pub fn call(&mut self, dst: Reg, function_index: usize, first_arg: Reg, argc: u32) -> usize {
        self.emit(Instruction::new(OpCode::Call, dst, first_arg, argc).imm(function_index as i64))
    }

    pub fn build(self) -> Function {
        self.function
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_forward_jump_patch() {
        let mut b = FunctionBuilder::new("loop");
        b.load_const(0, true, ResultType::Bool);
        let exit = b.jump(OpCode::JumpIfFalse, 0);
        b.op(OpCode::Nop, 0, 0, 0);
        b.patch(exit);
        b.op(OpCode::Ret, 0, 0, 0);

        let func = b.build();
        assert_eq!(func.instructions[1].imm, 3);
        assert!(func.validate(1024).is_ok());
    }

    #[test]
    fn test_declare_side_table() {
        let mut b = FunctionBuilder::new("typed").params(2);
        b.declare(2, ResultType::F64);
        b.op(OpCode::Add, 2, 0, 1);
        let func = b.build();
        assert_eq!(func.param_count, 2);
        assert_eq!(func.resolve_result_types(), vec![ResultType::F64]);
    }
}
