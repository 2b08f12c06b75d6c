//! 寄存器虚拟机实现
//!
//! 执行寄存器指令，驱动协作式调度器与无锁工作队列。
//! 函数在进入分发循环之前统一校验，循环内部不再做寄存器边界检查。

use std::collections::HashMap;
use std::io::{self, Write};
use std::ops::Range;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;

use super::handles::HandleTable;
use super::value::RegisterValue;
use crate::compiler::{Function, Instruction, OpCode, Reg, ResultType};
use crate::config::{
    DEFAULT_WORK_QUEUE_CAPACITY, ERROR_ID_BASE, MAX_CALL_DEPTH, MAX_WORK_QUEUE_CAPACITY,
    REGISTER_COUNT,
};
use crate::error::VmError;
use crate::runtime::cooperative::TaskScheduler;
use crate::runtime::queue::{WorkQueue, WorkerSignal};
use crate::runtime::task::{TaskBody, TaskField, TaskState};
use crate::runtime::thread_pool::ThreadPool;

/// 原生函数
pub type NativeFn = Arc<dyn Fn(&[RegisterValue]) -> Result<RegisterValue, String> + Send + Sync>;

/// 并行内核：工作线程对每个认领到的任务上下文句柄调用一次
pub type ParallelKernel = Arc<dyn Fn(i64) + Send + Sync>;

/// 虚拟机配置
#[derive(Debug, Clone)]
pub struct VmConfig {
    /// 单次执行允许的最大指令数（None 表示不限）
    pub instruction_limit: Option<u64>,
    /// 最大调用深度（含任务体）
    pub max_call_depth: usize,
}

impl Default for VmConfig {
    fn default() -> Self {
        Self {
            instruction_limit: None,
            max_call_depth: MAX_CALL_DEPTH,
        }
    }
}

/// 函数表条目
#[derive(Clone)]
enum Callable {
    Bytecode {
        function: Arc<Function>,
        types: Arc<[ResultType]>,
    },
    Native {
        name: String,
        func: NativeFn,
    },
}

/// 错误表条目
#[derive(Debug, Clone)]
struct ErrorRecord {
    type_name: String,
    message: String,
}

/// 寄存器虚拟机
pub struct RegisterVm {
    /// 寄存器文件，长度恒为 REGISTER_COUNT
    registers: Vec<RegisterValue>,
    config: VmConfig,
    /// 协作式调度器
    scheduler: TaskScheduler,
    /// 无锁工作队列表
    work_queues: HandleTable<Arc<WorkQueue>>,
    signal: Arc<WorkerSignal>,
    pool: Option<Arc<ThreadPool>>,
    kernel: Option<ParallelKernel>,
    /// 原子槽（按立即数索引）
    atomics: Arc<DashMap<i64, AtomicI64>>,
    /// 错误联合：错误 ID -> 类型与消息
    errors: HashMap<i64, ErrorRecord>,
    next_error_id: i64,
    functions: Vec<Callable>,
    output: Box<dyn Write + Send>,
    instruction_count: u64,
    call_depth: usize,
}

impl RegisterVm {
    /// 创建虚拟机，输出到标准输出
    pub fn new() -> Self {
        Self::with_config(VmConfig::default())
    }

    pub fn with_config(config: VmConfig) -> Self {
        Self {
            registers: vec![RegisterValue::None; REGISTER_COUNT],
            config,
            scheduler: TaskScheduler::new(),
            work_queues: HandleTable::new(),
            signal: Arc::new(WorkerSignal::new()),
            pool: None,
            kernel: None,
            atomics: Arc::new(DashMap::new()),
            errors: HashMap::new(),
            next_error_id: ERROR_ID_BASE,
            functions: Vec::new(),
            output: Box::new(io::stdout()),
            instruction_count: 0,
            call_depth: 0,
        }
    }

    /// 替换输出目标
    pub fn with_output(mut self, output: impl Write + Send + 'static) -> Self {
        self.output = Box::new(output);
        self
    }

    pub fn config(&self) -> &VmConfig {
        &self.config
    }

    // ========================================================================
    // 函数表
    // ========================================================================

    /// 注册字节码函数，返回函数索引
    pub fn register_function(&mut self, function: Function) -> Result<usize, VmError> {
        function.validate(REGISTER_COUNT)?;
        let types: Arc<[ResultType]> = function.resolve_result_types().into();
        self.functions.push(Callable::Bytecode {
            function: Arc::new(function),
            types,
        });
        Ok(self.functions.len() - 1)
    }

    /// 注册原生函数，返回函数索引
    pub fn register_native<F>(&mut self, name: impl Into<String>, func: F) -> usize
    where
        F: Fn(&[RegisterValue]) -> Result<RegisterValue, String> + Send + Sync + 'static,
    {
        self.functions.push(Callable::Native {
            name: name.into(),
            func: Arc::new(func),
        });
        self.functions.len() - 1
    }

    pub fn function_count(&self) -> usize {
        self.functions.len()
    }

    // ========================================================================
    // 并行后端
    // ========================================================================

    /// 挂接线程池；WorkerSignal 会把排空任务提交到这里
    pub fn attach_pool(&mut self, pool: Arc<ThreadPool>) {
        self.pool = Some(pool);
    }

    /// 设置并行内核
    pub fn set_parallel_kernel<F>(&mut self, kernel: F)
    where
        F: Fn(i64) + Send + Sync + 'static,
    {
        self.kernel = Some(Arc::new(kernel));
    }

    // ========================================================================
    // 执行入口
    // ========================================================================

    /// 执行函数
    ///
    /// 先校验寄存器、跳转目标和调用索引，再从第 0 条指令开始执行，
    /// 直到 Return/Ret 或指令流结束。
    pub fn execute_function(&mut self, function: &Function) -> Result<(), VmError> {
        function.validate(REGISTER_COUNT)?;
        for (pc, inst) in function.instructions.iter().enumerate() {
            if inst.op == OpCode::Call
                && (inst.imm < 0 || inst.imm as usize >= self.functions.len())
            {
                return Err(VmError::UnknownFunction {
                    function: function.name.clone(),
                    pc,
                    index: inst.imm,
                });
            }
        }

        let types: Arc<[ResultType]> = function.resolve_result_types().into();
        let function = Arc::new(function.clone());
        tracing::debug!(
            target: "regvm::vm",
            function = %function.name,
            instructions = function.len(),
            "execute function"
        );

        self.instruction_count = 0;
        self.call_depth = 0;
        let result = self.run_range(&function, &types, 0..function.len());
        self.output.flush()?;
        result
    }

    /// 本次执行已分发的指令数
    pub fn instruction_count(&self) -> u64 {
        self.instruction_count
    }

    // ========================================================================
    // 状态访问
    // ========================================================================

    pub fn register(&self, index: usize) -> Option<&RegisterValue> {
        self.registers.get(index)
    }

    pub fn set_register(&mut self, index: usize, value: RegisterValue) -> bool {
        match self.registers.get_mut(index) {
            Some(slot) => {
                *slot = value;
                true
            }
            None => false,
        }
    }

    pub fn scheduler(&self) -> &TaskScheduler {
        &self.scheduler
    }

    pub fn scheduler_mut(&mut self) -> &mut TaskScheduler {
        &mut self.scheduler
    }

    pub fn work_queue(&self, handle: i64) -> Option<&Arc<WorkQueue>> {
        self.work_queues.lookup(handle)
    }

    pub fn signal(&self) -> &Arc<WorkerSignal> {
        &self.signal
    }

    /// 原子槽表（可与并行内核共享）
    pub fn atomics(&self) -> &Arc<DashMap<i64, AtomicI64>> {
        &self.atomics
    }

    /// 查询错误值的类型与消息
    pub fn error_info(&self, id: i64) -> Option<(&str, &str)> {
        self.errors
            .get(&id)
            .map(|record| (record.type_name.as_str(), record.message.as_str()))
    }

    /// 清空寄存器、调度器、工作队列、原子槽与错误表；函数表保留
    pub fn reset(&mut self) {
        self.registers.fill(RegisterValue::None);
        self.scheduler = TaskScheduler::new();
        self.work_queues.clear();
        self.signal.publish(0, 0);
        self.atomics.clear();
        self.errors.clear();
        self.next_error_id = ERROR_ID_BASE;
        self.instruction_count = 0;
        self.call_depth = 0;
    }

    // ========================================================================
    // 寄存器读写（热路径）
    // ========================================================================

    #[inline(always)]
    fn reg(&self, r: Reg) -> &RegisterValue {
        // SAFETY: 进入分发循环的函数都通过了 validate(REGISTER_COUNT)，
        // 寄存器文件长度恒为 REGISTER_COUNT
        unsafe { self.registers.get_unchecked(r as usize) }
    }

    #[inline(always)]
    fn set(&mut self, r: Reg, value: RegisterValue) {
        // SAFETY: 同 reg()
        unsafe {
            *self.registers.get_unchecked_mut(r as usize) = value;
        }
    }

    // ========================================================================
    // 分发循环
    // ========================================================================

    /// 执行 `function` 中 `range` 区间的指令
    fn run_range(
        &mut self,
        function: &Arc<Function>,
        types: &Arc<[ResultType]>,
        range: Range<usize>,
    ) -> Result<(), VmError> {
        let code: &[Instruction] = &function.instructions;
        let mut pc = range.start;

        while range.contains(&pc) {
            let inst = &code[pc];
            let ty = types[pc];
            pc += 1;

            self.instruction_count += 1;
            if let Some(limit) = self.config.instruction_limit {
                if self.instruction_count > limit {
                    return Err(VmError::InstructionLimitExceeded(limit));
                }
            }

            match inst.op {
                // ============ 基础 ============
                OpCode::Nop => {}
                OpCode::Mov => {
                    let value = self.reg(inst.a).clone();
                    self.set(inst.dst, value);
                }
                OpCode::LoadConst => {
                    let value = inst
                        .const_value
                        .clone()
                        .unwrap_or(RegisterValue::Int(inst.imm));
                    self.set(inst.dst, value);
                }

                // ============ 算术 / 位运算 ============
                OpCode::Add
                | OpCode::Sub
                | OpCode::Mul
                | OpCode::Div
                | OpCode::Mod
                | OpCode::And
                | OpCode::Or
                | OpCode::Xor => {
                    let value = binary_op(inst.op, self.reg(inst.a), self.reg(inst.b), ty);
                    self.set(inst.dst, value);
                }
                OpCode::Neg => {
                    let value = negate(self.reg(inst.a), ty);
                    self.set(inst.dst, value);
                }
                OpCode::Not => {
                    let value = RegisterValue::Bool(!self.reg(inst.a).is_truthy());
                    self.set(inst.dst, value);
                }

                // ============ 比较 ============
                OpCode::CmpEQ
                | OpCode::CmpNEQ
                | OpCode::CmpLT
                | OpCode::CmpLE
                | OpCode::CmpGT
                | OpCode::CmpGE => {
                    let result = compare_op(inst.op, self.reg(inst.a), self.reg(inst.b));
                    self.set(inst.dst, RegisterValue::Bool(result));
                }

                // ============ 控制流 ============
                OpCode::Jump => pc = inst.imm as usize,
                OpCode::JumpIfFalse => {
                    if !self.reg(inst.a).is_truthy() {
                        pc = inst.imm as usize;
                    }
                }
                OpCode::JumpIf => {
                    if self.reg(inst.a).is_truthy() {
                        pc = inst.imm as usize;
                    }
                }
                OpCode::Call => {
                    let result = self.call(inst.imm, inst.a, inst.b)?;
                    self.set(inst.dst, result);
                }
                OpCode::Return => {
                    if inst.dst != 0 {
                        let value = self.reg(inst.dst).clone();
                        self.set(0, value);
                    }
                    return Ok(());
                }
                OpCode::Ret => return Ok(()),

                // ============ 字符串 / 输出 ============
                OpCode::PrintInt => {
                    let n = self.reg(inst.a).to_int();
                    self.print(format_args!("{}", n));
                }
                OpCode::PrintUint => {
                    let n = self.reg(inst.a).to_int() as u64;
                    self.print(format_args!("{}", n));
                }
                OpCode::PrintFloat => {
                    let f = RegisterValue::Float(self.reg(inst.a).to_float());
                    self.print(format_args!("{}", f));
                }
                OpCode::PrintBool => {
                    let b = self.reg(inst.a).is_truthy();
                    self.print(format_args!("{}", b));
                }
                OpCode::PrintString => {
                    let text = self.reg(inst.a).to_string();
                    self.print(format_args!("{}", text));
                }
                OpCode::ToString => {
                    let text = self.reg(inst.a).to_string();
                    self.set(inst.dst, RegisterValue::Str(text));
                }
                OpCode::Concat => {
                    let text = format!("{}{}", self.reg(inst.a), self.reg(inst.b));
                    self.set(inst.dst, RegisterValue::Str(text));
                }
                OpCode::StrFormat => {
                    let template = self.reg(inst.a).to_string();
                    let arg = self.reg(inst.b).to_string();
                    let text = if template.contains("%s") {
                        template.replacen("%s", &arg, 1)
                    } else {
                        template + &arg
                    };
                    self.set(inst.dst, RegisterValue::Str(text));
                }

                // ============ 错误联合 ============
                OpCode::ConstructError => {
                    let text = match &inst.const_value {
                        Some(value) => value.to_string(),
                        None => self.reg(inst.a).to_string(),
                    };
                    let id = self.construct_error(&text);
                    self.set(inst.dst, RegisterValue::Int(id));
                }
                OpCode::ConstructOk => {
                    let value = self.reg(inst.a).clone();
                    self.set(inst.dst, value);
                }
                OpCode::IsError => {
                    let is_error = self.is_error(self.reg(inst.a));
                    self.set(inst.dst, RegisterValue::Bool(is_error));
                }
                OpCode::Unwrap => {
                    let value = self.reg(inst.a);
                    let value = if self.is_error(value) {
                        tracing::debug!(
                            target: "regvm::vm",
                            error = value.to_int(),
                            "unwrap of error value"
                        );
                        RegisterValue::None
                    } else {
                        value.clone()
                    };
                    self.set(inst.dst, value);
                }
                OpCode::UnwrapOr => {
                    let value = self.reg(inst.a);
                    let value = if value.is_none() || self.is_error(value) {
                        self.reg(inst.b).clone()
                    } else {
                        value.clone()
                    };
                    self.set(inst.dst, value);
                }

                // ============ 原子操作 ============
                OpCode::AtomicLoad => {
                    let value = self
                        .atomics
                        .get(&inst.imm)
                        .map_or(0, |slot| slot.load(Ordering::SeqCst));
                    self.set(inst.dst, RegisterValue::Int(value));
                }
                OpCode::AtomicStore => {
                    let value = self.reg(inst.a).to_int();
                    self.atomics
                        .entry(inst.imm)
                        .or_insert_with(|| AtomicI64::new(0))
                        .store(value, Ordering::SeqCst);
                }
                OpCode::AtomicFetchAdd => {
                    let delta = self.reg(inst.b).to_int();
                    let previous = self
                        .atomics
                        .entry(inst.imm)
                        .or_insert_with(|| AtomicI64::new(0))
                        .fetch_add(delta, Ordering::SeqCst);
                    self.set(inst.dst, RegisterValue::Int(previous));
                }

                // ============ 协作式任务 ============
                OpCode::TaskContextAlloc => {
                    let value = usize::try_from(self.reg(inst.a).to_int())
                        .ok()
                        .and_then(|count| self.scheduler.alloc_contexts(count))
                        .map_or(RegisterValue::None, |first| RegisterValue::Int(first as i64));
                    self.set(inst.dst, value);
                }
                OpCode::TaskContextInit => {
                    let handle = self.reg(inst.a).to_int();
                    let value = if self.scheduler.init_context(handle) {
                        RegisterValue::Int(handle)
                    } else {
                        RegisterValue::None
                    };
                    self.set(inst.dst, value);
                }
                OpCode::TaskGetState => {
                    let handle = self.reg(inst.a).to_int();
                    let state = self
                        .scheduler
                        .task(handle)
                        .map_or(0, |task| task.state() as i64);
                    self.set(inst.dst, RegisterValue::Int(state));
                }
                OpCode::TaskSetState => {
                    let handle = self.reg(inst.a).to_int();
                    let target = TaskState::try_from(self.reg(inst.b).to_int());
                    let accepted = match (self.scheduler.task_mut(handle), target) {
                        (Some(task), Ok(state)) => task.set_state(state),
                        _ => false,
                    };
                    self.set(inst.dst, flag(accepted));
                }
                OpCode::TaskGetField => {
                    let handle = self.reg(inst.a).to_int();
                    let field = TaskField::from(self.reg(inst.b).to_int());
                    let value = self
                        .scheduler
                        .task(handle)
                        .map_or(RegisterValue::None, |task| task.field(field));
                    self.set(inst.dst, value);
                }
                OpCode::TaskSetField => {
                    let handle = self.reg(inst.a).to_int();
                    if inst.imm != 0 {
                        let value = self.reg(inst.b).clone();
                        let stored = self.set_task_field(handle, TaskField::from(inst.imm), value);
                        self.set(inst.dst, flag(stored));
                    } else {
                        let field = TaskField::from(self.reg(inst.b).to_int());
                        let value = self.reg(inst.dst).clone();
                        self.set_task_field(handle, field, value);
                    }
                }
                OpCode::TaskSetCode => {
                    let handle = self.reg(inst.a).to_int();
                    let body = inst.b as usize..inst.imm as usize;
                    if !body.is_empty() {
                        if let Some(task) = self.scheduler.task_mut(handle) {
                            task.body = Some(TaskBody {
                                function: Arc::clone(function),
                                types: Arc::clone(types),
                                range: body,
                            });
                        }
                    }
                }
                OpCode::TaskSleep => {
                    let handle = self.reg(inst.a).to_int();
                    let ticks = self.reg(inst.b).to_int().max(0) as u64;
                    let slept = self.scheduler.sleep(handle, ticks);
                    self.set(inst.dst, flag(slept));
                }

                // ============ 协作式 Channel ============
                OpCode::ChannelAlloc => {
                    let capacity = self.reg(inst.a).to_int();
                    let value = self
                        .scheduler
                        .alloc_channel(capacity)
                        .map_or(RegisterValue::None, |handle| RegisterValue::Int(handle as i64));
                    self.set(inst.dst, value);
                }
                OpCode::ChannelPush => {
                    let handle = self.reg(inst.a).to_int();
                    let value = self.reg(inst.b).clone();
                    let pushed = self
                        .scheduler
                        .channel(handle)
                        .map_or(false, |channel| channel.try_send(value).is_ok());
                    self.set(inst.dst, flag(pushed));
                }
                OpCode::ChannelPop => {
                    let handle = self.reg(inst.a).to_int();
                    let value = self
                        .scheduler
                        .channel(handle)
                        .and_then(|channel| channel.try_receive())
                        .unwrap_or_default();
                    self.set(inst.dst, value);
                }
                OpCode::ChannelHasData => {
                    let handle = self.reg(inst.a).to_int();
                    let has_data = self
                        .scheduler
                        .channel(handle)
                        .map_or(false, |channel| !channel.is_empty());
                    self.set(inst.dst, RegisterValue::Bool(has_data));
                }
                OpCode::ChannelClose => {
                    let handle = self.reg(inst.a).to_int();
                    let closed = self
                        .scheduler
                        .channel(handle)
                        .map_or(false, |channel| channel.close());
                    self.set(inst.dst, flag(closed));
                }

                // ============ 协作式调度器 ============
                OpCode::SchedulerInit => self.scheduler.reset(),
                OpCode::SchedulerRun => {
                    let executed = self.run_scheduler_pass()?;
                    self.set(inst.dst, RegisterValue::Int(executed as i64));
                }
                OpCode::SchedulerTick => {
                    let woken = self.scheduler.tick();
                    self.set(inst.dst, RegisterValue::Int(woken as i64));
                }
                OpCode::GetTickCount => {
                    let now = self.scheduler.current_time() as i64;
                    self.set(inst.dst, RegisterValue::Int(now));
                }
                OpCode::DelayUntil => {
                    let target = self.reg(inst.a).to_int();
                    let reached = self.scheduler.current_time() as i64 >= target;
                    self.set(inst.dst, RegisterValue::Bool(reached));
                }

                // ============ 无锁并行 ============
                OpCode::WorkQueueAlloc => {
                    let capacity = match usize::try_from(self.reg(inst.a).to_int()) {
                        Ok(0) | Err(_) => Some(DEFAULT_WORK_QUEUE_CAPACITY),
                        Ok(c) if c > MAX_WORK_QUEUE_CAPACITY => None,
                        Ok(c) => Some(c),
                    };
                    let value = match capacity {
                        Some(capacity) => {
                            let handle = self.work_queues.insert(Arc::new(WorkQueue::new(capacity)));
                            RegisterValue::Int(handle as i64)
                        }
                        None => RegisterValue::None,
                    };
                    self.set(inst.dst, value);
                }
                OpCode::WorkQueuePush => {
                    let handle = self.reg(inst.a).to_int();
                    let context = self.reg(inst.b).to_int();
                    let pushed = self
                        .work_queues
                        .lookup(handle)
                        .map_or(false, |queue| queue.push(context));
                    self.set(inst.dst, flag(pushed));
                }
                OpCode::WorkQueuePop => {
                    let handle = self.reg(inst.a).to_int();
                    let value = self
                        .work_queues
                        .lookup(handle)
                        .and_then(|queue| queue.pop())
                        .map_or(RegisterValue::None, RegisterValue::Int);
                    self.set(inst.dst, value);
                }
                OpCode::WorkerSignal => {
                    let work_available = self.reg(inst.a).to_int();
                    let active_workers = self.reg(inst.b).to_int();
                    let dispatched = self.signal_workers(work_available, active_workers);
                    self.set(inst.dst, RegisterValue::Int(dispatched as i64));
                }
                OpCode::ParallelWaitComplete => {
                    let handle = self.reg(inst.a).to_int();
                    let timeout_ms = self.reg(inst.b).to_int();
                    let timeout = (timeout_ms > 0).then(|| Duration::from_millis(timeout_ms as u64));
                    let drained = self
                        .work_queues
                        .lookup(handle)
                        .map_or(false, |queue| queue.wait_drained(timeout));
                    self.set(inst.dst, flag(drained));
                }
            }
        }
        Ok(())
    }

    // ========================================================================
    // 处理器辅助
    // ========================================================================

    fn print(&mut self, args: std::fmt::Arguments<'_>) {
        if let Err(error) = writeln!(self.output, "{}", args) {
            tracing::warn!(target: "regvm::vm", %error, "print failed");
        }
    }

    /// 调用函数表中的函数
    ///
    /// 字节码函数在新的寄存器文件上执行，参数放在 r0..，返回 r0；
    /// 调用方的寄存器在返回后恢复。
    fn call(&mut self, index: i64, first: Reg, argc: Reg) -> Result<RegisterValue, VmError> {
        let args: Vec<RegisterValue> = (first..first.saturating_add(argc))
            .map(|r| self.registers.get(r as usize).cloned().unwrap_or_default())
            .collect();

        if self.call_depth >= self.config.max_call_depth {
            tracing::warn!(
                target: "regvm::vm",
                depth = self.call_depth,
                function = index,
                "call depth exceeded"
            );
            return Ok(RegisterValue::None);
        }

        let Some(callable) = usize::try_from(index)
            .ok()
            .and_then(|i| self.functions.get(i))
            .cloned()
        else {
            tracing::warn!(target: "regvm::vm", function = index, "call to unknown function");
            return Ok(RegisterValue::None);
        };

        match callable {
            Callable::Native { name, func } => match func(&args) {
                Ok(value) => Ok(value),
                Err(message) => {
                    tracing::warn!(
                        target: "regvm::vm",
                        function = %name,
                        %message,
                        "native call failed"
                    );
                    Ok(RegisterValue::None)
                }
            },
            Callable::Bytecode { function, types } => {
                let mut frame = vec![RegisterValue::None; REGISTER_COUNT];
                for (slot, arg) in frame.iter_mut().zip(args) {
                    *slot = arg;
                }
                let saved = std::mem::replace(&mut self.registers, frame);

                self.call_depth += 1;
                let outcome = self.run_range(&function, &types, 0..function.len());
                self.call_depth -= 1;

                let mut callee = std::mem::replace(&mut self.registers, saved);
                outcome?;
                Ok(std::mem::take(&mut callee[0]))
            }
        }
    }

    /// 单遍执行调度器中的任务，返回执行数
    fn run_scheduler_pass(&mut self) -> Result<usize, VmError> {
        if !self.scheduler.has_task_bodies() {
            return Ok(self.scheduler.run());
        }

        let mut executed = 0;
        for handle in self.scheduler.begin_pass() {
            let body = self
                .scheduler
                .task(handle as i64)
                .and_then(|task| task.body.clone());
            let counter = match body {
                Some(body) => self.run_task_body(handle, body)?,
                None => None,
            };
            if self.scheduler.finish_task(handle, counter) {
                executed += 1;
            }
        }
        Ok(executed)
    }

    /// 在分发线程上执行任务体
    ///
    /// 任务体总在设置它的函数的代码上执行。字段载入 r0..r3
    /// （任务 ID、循环值、输出 Channel、计数器），结束时 r3 若为整数则作为新的计数器。
    fn run_task_body(&mut self, handle: usize, body: TaskBody) -> Result<Option<i64>, VmError> {
        if self.call_depth >= self.config.max_call_depth {
            tracing::warn!(target: "regvm::vm", task = handle, "task body nested too deep");
            return Ok(None);
        }
        let Some(task) = self.scheduler.task(handle as i64) else {
            return Ok(None);
        };

        let mut frame = self.registers.clone();
        frame[0] = task.field(TaskField::TaskId);
        frame[1] = task.field(TaskField::LoopValue);
        frame[2] = task.field(TaskField::OutputChannel);
        frame[3] = task.field(TaskField::Counter);
        let saved = std::mem::replace(&mut self.registers, frame);

        self.call_depth += 1;
        let outcome = self.run_range(&body.function, &body.types, body.range);
        self.call_depth -= 1;

        let finished = std::mem::replace(&mut self.registers, saved);
        outcome?;
        Ok(finished[3].as_int())
    }

    fn set_task_field(&mut self, handle: i64, field: TaskField, value: RegisterValue) -> bool {
        match self.scheduler.task_mut(handle) {
            Some(task) => {
                task.set_field(field, value);
                true
            }
            None => false,
        }
    }

    /// 解析 "Type:message" 并分配错误 ID
    fn construct_error(&mut self, text: &str) -> i64 {
        let (type_name, message) = text.split_once(':').unwrap_or((text, ""));
        let id = self.next_error_id;
        self.next_error_id -= 1;
        self.errors.insert(
            id,
            ErrorRecord {
                type_name: type_name.trim().to_string(),
                message: message.trim().to_string(),
            },
        );
        id
    }

    #[inline]
    fn is_error(&self, value: &RegisterValue) -> bool {
        matches!(value, RegisterValue::Int(id) if self.errors.contains_key(id))
    }

    /// 发布工作信号并安排排空
    ///
    /// 挂接了运行中的线程池和内核时提交 max(active_workers, 1) 个排空任务，
    /// 否则在分发线程上直接排空。返回提交的任务数或同步排空的条目数。
    fn signal_workers(&mut self, work_available: i64, active_workers: i64) -> usize {
        self.signal.publish(work_available, active_workers.max(0));
        if work_available <= 0 {
            return 0;
        }

        let queues: Arc<[Arc<WorkQueue>]> = self
            .work_queues
            .iter()
            .map(|(_, queue)| Arc::clone(queue))
            .collect();

        if let (Some(pool), Some(kernel)) = (&self.pool, &self.kernel) {
            if pool.is_running() {
                let jobs = active_workers.max(1) as usize;
                let mut submitted = 0;
                for _ in 0..jobs {
                    let queues = Arc::clone(&queues);
                    let kernel = Arc::clone(kernel);
                    let signal = Arc::clone(&self.signal);
                    let job = move || {
                        for queue in queues.iter() {
                            while let Some(claim) = queue.claim() {
                                kernel(claim.context());
                                signal.consume();
                            }
                        }
                        signal.worker_exit();
                    };
                    match pool.submit(job) {
                        Ok(()) => submitted += 1,
                        Err(error) => {
                            tracing::warn!(target: "regvm::vm", %error, "drain job rejected");
                            break;
                        }
                    }
                }
                if submitted > 0 {
                    return submitted;
                }
            }
        }

        let mut drained = 0;
        for queue in queues.iter() {
            while let Some(context) = queue.pop() {
                if let Ok(handle) = usize::try_from(context) {
                    self.scheduler.finish_task(handle, None);
                }
                self.signal.consume();
                drained += 1;
            }
        }
        drained
    }
}

impl Default for RegisterVm {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for RegisterVm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegisterVm")
            .field("config", &self.config)
            .field("functions", &self.functions.len())
            .field("tasks", &self.scheduler.task_count())
            .field("work_queues", &self.work_queues.len())
            .field("instruction_count", &self.instruction_count)
            .finish()
    }
}

// ============================================================================
// 纯函数：算术与比较
// ============================================================================

#[inline]
fn flag(ok: bool) -> RegisterValue {
    RegisterValue::Int(ok as i64)
}

/// 结果是否按浮点计算：F64 强制浮点，整数类型强制整数，其余看操作数
#[inline]
fn computes_float(ty: ResultType, lhs: &RegisterValue, rhs: &RegisterValue) -> bool {
    match ty {
        ResultType::F64 => true,
        ResultType::I32 | ResultType::I64 => false,
        _ => lhs.is_float() || rhs.is_float(),
    }
}

#[inline]
fn narrow(value: i64, ty: ResultType) -> i64 {
    if ty == ResultType::I32 {
        value as i32 as i64
    } else {
        value
    }
}

/// 二元算术 / 位运算；任一操作数非数值时得到空值
fn binary_op(op: OpCode, lhs: &RegisterValue, rhs: &RegisterValue, ty: ResultType) -> RegisterValue {
    if !lhs.is_numeric() || !rhs.is_numeric() {
        return RegisterValue::None;
    }

    let bitwise = matches!(op, OpCode::And | OpCode::Or | OpCode::Xor);
    if !bitwise && computes_float(ty, lhs, rhs) {
        let (x, y) = (lhs.to_float(), rhs.to_float());
        let value = match op {
            OpCode::Add => x + y,
            OpCode::Sub => x - y,
            OpCode::Mul => x * y,
            OpCode::Div => x / y,
            OpCode::Mod => x % y,
            _ => return RegisterValue::None,
        };
        return RegisterValue::Float(value);
    }

    let (x, y) = (lhs.to_int(), rhs.to_int());
    let value = match op {
        OpCode::Add => x.wrapping_add(y),
        OpCode::Sub => x.wrapping_sub(y),
        OpCode::Mul => x.wrapping_mul(y),
        // 整数除零 / 模零得 0
        OpCode::Div => {
            if y == 0 {
                0
            } else {
                x.wrapping_div(y)
            }
        }
        OpCode::Mod => {
            if y == 0 {
                0
            } else {
                x.wrapping_rem(y)
            }
        }
        OpCode::And => x & y,
        OpCode::Or => x | y,
        OpCode::Xor => x ^ y,
        _ => return RegisterValue::None,
    };
    RegisterValue::Int(narrow(value, ty))
}

fn negate(value: &RegisterValue, ty: ResultType) -> RegisterValue {
    if !value.is_numeric() {
        return RegisterValue::None;
    }
    if computes_float(ty, value, value) {
        RegisterValue::Float(-value.to_float())
    } else {
        RegisterValue::Int(narrow(value.to_int().wrapping_neg(), ty))
    }
}

/// 比较；类型不匹配时一律为 false（包括 CmpNEQ）
fn compare_op(op: OpCode, lhs: &RegisterValue, rhs: &RegisterValue) -> bool {
    use std::cmp::Ordering::*;

    let Some(ordering) = lhs.compare(rhs) else {
        return false;
    };
    match op {
        OpCode::CmpEQ => ordering == Equal,
        OpCode::CmpNEQ => ordering != Equal,
        OpCode::CmpLT => ordering == Less,
        OpCode::CmpLE => ordering != Greater,
        OpCode::CmpGT => ordering == Greater,
        OpCode::CmpGE => ordering != Less,
        _ => false,
    }
}
