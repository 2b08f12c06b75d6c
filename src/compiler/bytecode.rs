//! 寄存器指令定义
//!
//! 前端把抽象语法树降级为按函数组织的线性寄存器指令流，
//! 虚拟机只消费这里定义的结构，不解析文本。

use std::collections::HashMap;
use std::fmt;

use crate::error::VmError;
use crate::vm::RegisterValue;

/// 寄存器索引
pub type Reg = u32;

/// 操作码
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum OpCode {
    /// 空操作
    Nop = 0,
    /// 寄存器复制: dst = a
    Mov = 1,
    /// 加载常量: dst = const_value
    LoadConst = 2,

    // ============ 算术运算 ============
    /// 加法: dst = a + b
    Add = 10,
    /// 减法: dst = a - b
    Sub = 11,
    /// 乘法: dst = a * b
    Mul = 12,
    /// 除法: dst = a / b（整数除零得 0）
    Div = 13,
    /// 取模: dst = a % b（整数模零得 0）
    Mod = 14,
    /// 取负: dst = -a
    Neg = 15,

    // ============ 位运算 / 逻辑 ============
    /// 按位与: dst = a & b
    And = 20,
    /// 按位或: dst = a | b
    Or = 21,
    /// 按位异或: dst = a ^ b
    Xor = 22,
    /// 逻辑非: dst = !truthy(a)
    Not = 23,

    // ============ 比较运算 ============
    /// 等于
    CmpEQ = 30,
    /// 不等于
    CmpNEQ = 31,
    /// 小于
    CmpLT = 32,
    /// 小于等于
    CmpLE = 33,
    /// 大于
    CmpGT = 34,
    /// 大于等于
    CmpGE = 35,

    // ============ 控制流 ============
    /// 无条件跳转到 imm
    Jump = 40,
    /// a 为假时跳转到 imm
    JumpIfFalse = 41,
    /// a 为真时跳转到 imm
    JumpIf = 42,
    /// 调用函数表中第 imm 个函数，参数为 a..a+b，结果写入 dst
    Call = 43,
    /// 返回（dst 非 0 时先复制到 r0）
    Return = 44,
    /// 直接结束
    Ret = 45,

    // ============ 字符串 / 输出 ============
    /// 打印整数
    PrintInt = 50,
    /// 打印无符号整数
    PrintUint = 51,
    /// 打印浮点数
    PrintFloat = 52,
    /// 打印布尔值
    PrintBool = 53,
    /// 打印文本
    PrintString = 54,
    /// dst = to_string(a)
    ToString = 55,
    /// dst = a ++ b
    Concat = 56,
    /// dst = a 中第一个 %s 替换为 b（没有占位符时追加）
    StrFormat = 57,

    // ============ 错误联合 ============
    /// 构造错误值，const_value 为 "Type:message"
    ConstructError = 60,
    /// 构造成功值: dst = a
    ConstructOk = 61,
    /// dst = a 是否为错误值
    IsError = 62,
    /// 解包，错误值得到空值
    Unwrap = 63,
    /// 解包，空值或错误值时取 b
    UnwrapOr = 64,

    // ============ 原子操作 ============
    /// dst = slot[imm]
    AtomicLoad = 70,
    /// slot[imm] = a
    AtomicStore = 71,
    /// dst = slot[imm]; slot[imm] += b
    AtomicFetchAdd = 72,

    // ============ 协作式任务 ============
    /// 批量分配 a 个任务上下文，dst = 首个句柄
    TaskContextAlloc = 80,
    /// 初始化并入队上下文 a
    TaskContextInit = 81,
    /// dst = state(a)
    TaskGetState = 82,
    /// state(a) = b，dst = 是否接受
    TaskSetState = 83,
    /// dst = field(a, b)
    TaskGetField = 84,
    /// field(a, b) = dst；imm 非 0 时 field(a, imm) = b
    TaskSetField = 85,
    /// 任务体范围: 上下文 a 的指令区间 [b, imm)，b 为字面位置
    TaskSetCode = 86,
    /// 上下文 a 睡眠 b 个 tick，dst = 是否成功
    TaskSleep = 87,

    // ============ 协作式 Channel ============
    /// dst = 新 Channel（容量 a）
    ChannelAlloc = 90,
    /// dst = push(a, b)
    ChannelPush = 91,
    /// dst = pop(a)
    ChannelPop = 92,
    /// dst = a 是否有数据
    ChannelHasData = 93,
    /// 关闭 Channel a，dst = 是否由本次关闭
    ChannelClose = 94,

    // ============ 协作式调度器 ============
    /// 重置调度器
    SchedulerInit = 100,
    /// 单遍执行所有任务，dst = 执行数
    SchedulerRun = 101,
    /// 推进一个 tick，dst = 唤醒数
    SchedulerTick = 102,
    /// dst = 当前 tick
    GetTickCount = 103,
    /// dst = 当前 tick >= a
    DelayUntil = 104,

    // ============ 无锁并行 ============
    /// dst = 新工作队列（容量 a）
    WorkQueueAlloc = 110,
    /// dst = push(a, b)
    WorkQueuePush = 111,
    /// dst = pop(a)
    WorkQueuePop = 112,
    /// 发布信号（work_available = a, active_workers = b），dst = 排空任务数
    WorkerSignal = 113,
    /// 等待队列 a 排空，超时 b 毫秒（<= 0 不限时），dst = 是否排空
    ParallelWaitComplete = 114,
}

impl OpCode {
    /// 是否使用 imm 作为跳转目标
    #[inline]
    pub fn is_jump(self) -> bool {
        matches!(self, OpCode::Jump | OpCode::JumpIfFalse | OpCode::JumpIf)
    }
}

/// 指令声明的结果类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ResultType {
    I32,
    I64,
    F64,
    Bool,
    Ptr,
    #[default]
    Void,
}

impl ResultType {
    /// 是否强制整数宽度
    #[inline]
    pub fn is_integer(self) -> bool {
        matches!(self, ResultType::I32 | ResultType::I64)
    }

    pub fn name(self) -> &'static str {
        match self {
            ResultType::I32 => "i32",
            ResultType::I64 => "i64",
            ResultType::F64 => "f64",
            ResultType::Bool => "bool",
            ResultType::Ptr => "ptr",
            ResultType::Void => "void",
        }
    }
}

/// 单条寄存器指令
#[derive(Debug, Clone, PartialEq)]
pub struct Instruction {
    pub op: OpCode,
    pub dst: Reg,
    pub a: Reg,
    pub b: Reg,
    /// 立即数（跳转目标或编码的字面量）
    pub imm: i64,
    pub const_value: Option<RegisterValue>,
    pub result_type: ResultType,
}

impl Instruction {
    pub fn new(op: OpCode, dst: Reg, a: Reg, b: Reg) -> Self {
        Self {
            op,
            dst,
            a,
            b,
            imm: 0,
            const_value: None,
            result_type: ResultType::Void,
        }
    }

    /// 设置立即数
    pub fn imm(mut self, imm: i64) -> Self {
        self.imm = imm;
        self
    }

    /// 设置常量
    pub fn constant(mut self, value: impl Into<RegisterValue>) -> Self {
        self.const_value = Some(value.into());
        self
    }

    /// 设置结果类型
    pub fn typed(mut self, result_type: ResultType) -> Self {
        self.result_type = result_type;
        self
    }
}

/// 函数：扁平指令序列 + 目标寄存器类型旁表
#[derive(Debug, Clone, Default)]
pub struct Function {
    pub name: String,
    pub instructions: Vec<Instruction>,
    pub param_count: usize,
    /// 目标寄存器 -> 声明的结果类型
    pub register_types: HashMap<Reg, ResultType>,
}

impl Function {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.instructions.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.instructions.is_empty()
    }

    /// 解析每条指令的有效结果类型
    ///
    /// 指令自带的类型优先，否则查旁表；每次函数执行只解析一次。
    pub fn resolve_result_types(&self) -> Vec<ResultType> {
        self.instructions
            .iter()
            .map(|inst| match inst.result_type {
                ResultType::Void => self
                    .register_types
                    .get(&inst.dst)
                    .copied()
                    .unwrap_or(ResultType::Void),
                declared => declared,
            })
            .collect()
    }

    /// 校验寄存器与跳转目标
    ///
    /// 分发循环本身不做边界检查，所以所有函数在进入之前都要通过这里。
    pub fn validate(&self, register_limit: usize) -> Result<(), VmError> {
        let len = self.instructions.len();
        for (pc, inst) in self.instructions.iter().enumerate() {
            for register in [inst.dst, inst.a, inst.b] {
                if register as usize >= register_limit {
                    return Err(VmError::RegisterOutOfRange {
                        function: self.name.clone(),
                        pc,
                        register,
                        limit: register_limit,
                    });
                }
            }

            let targets_code = inst.op.is_jump() || inst.op == OpCode::TaskSetCode;
            if targets_code && (inst.imm < 0 || inst.imm as usize > len) {
                return Err(VmError::JumpOutOfRange {
                    function: self.name.clone(),
                    pc,
                    target: inst.imm,
                    len,
                });
            }
        }
        Ok(())
    }
}

impl fmt::Display for Function {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "=== Function {} (params: {}) ===", self.name, self.param_count)?;
        for (pc, inst) in self.instructions.iter().enumerate() {
            write!(
                f,
                "{:04} {:<20} r{}, r{}, r{}",
                pc,
                format!("{:?}", inst.op),
                inst.dst,
                inst.a,
                inst.b
            )?;
            if inst.imm != 0 || inst.op.is_jump() {
                write!(f, "  #{}", inst.imm)?;
            }
            if let Some(value) = &inst.const_value {
                write!(f, "  = {:?}", value)?;
            }
            if inst.result_type != ResultType::Void {
                write!(f, "  : {}", inst.result_type.name())?;
            }
            writeln!(f)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_side_table_fills_undeclared_types() {
        let mut func = Function::new("f");
        func.instructions.push(Instruction::new(OpCode::Add, 2, 0, 1));
        func.instructions
            .push(Instruction::new(OpCode::Add, 3, 0, 1).typed(ResultType::I32));
        func.register_types.insert(2, ResultType::F64);
        func.register_types.insert(3, ResultType::F64);

        assert_eq!(
            func.resolve_result_types(),
            vec![ResultType::F64, ResultType::I32]
        );
    }

    #[test]
    fn test_validate_rejects_bad_operands() {
        let mut func = Function::new("bad");
        func.instructions.push(Instruction::new(OpCode::Mov, 2000, 0, 0));
        assert!(matches!(
            func.validate(1024),
            Err(VmError::RegisterOutOfRange { register: 2000, .. })
        ));

        let mut func = Function::new("jump");
        func.instructions.push(Instruction::new(OpCode::Jump, 0, 0, 0).imm(5));
        assert!(matches!(
            func.validate(1024),
            Err(VmError::JumpOutOfRange { target: 5, .. })
        ));

        // 跳到末尾等价于结束
        let mut func = Function::new("end");
        func.instructions.push(Instruction::new(OpCode::Jump, 0, 0, 0).imm(1));
        assert!(func.validate(1024).is_ok());
    }

    #[test]
    fn test_disassembly() {
        let mut func = Function::new("main");
        func.instructions.push(
            Instruction::new(OpCode::LoadConst, 0, 0, 0)
                .constant(10i64)
                .typed(ResultType::I64),
        );
        let text = func.to_string();
        assert!(text.contains("=== Function main"));
        assert!(text.contains("LoadConst"));
        assert!(text.contains("Int(10)"));
        assert!(text.contains(": i64"));
    }
}
