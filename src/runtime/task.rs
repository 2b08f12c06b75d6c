//! 协作式任务上下文
//!
//! 任务不拥有线程或栈，只是一组显式状态：生命周期、计数器、
//! 输出 Channel 绑定、任意字段存储和睡眠截止 tick。

use std::collections::HashMap;
use std::ops::Range;
use std::sync::Arc;

use crate::compiler::{Function, ResultType};
use crate::vm::RegisterValue;

/// 任务状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TaskState {
    /// 已分配，尚未初始化
    Init = 0,
    /// 可运行
    Running = 1,
    /// 睡眠中，等待 tick 唤醒
    Sleeping = 2,
    /// 已完成（终态）
    Completed = 3,
}

impl TryFrom<i64> for TaskState {
    type Error = i64;

    fn try_from(v: i64) -> Result<Self, Self::Error> {
        match v {
            0 => Ok(TaskState::Init),
            1 => Ok(TaskState::Running),
            2 => Ok(TaskState::Sleeping),
            3 => Ok(TaskState::Completed),
            other => Err(other),
        }
    }
}

/// 任务字段
///
/// 0-3 为保留字段，其余索引是自由的任务局部存储
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskField {
    /// 任务 ID
    TaskId,
    /// 循环变量
    LoopValue,
    /// 输出 Channel 句柄
    OutputChannel,
    /// 计数器
    Counter,
    /// 自定义字段
    Custom(i64),
}

impl TaskField {
    pub const TASK_ID: i64 = 0;
    pub const LOOP_VALUE: i64 = 1;
    pub const OUTPUT_CHANNEL: i64 = 2;
    pub const COUNTER: i64 = 3;

    pub fn index(self) -> i64 {
        match self {
            TaskField::TaskId => Self::TASK_ID,
            TaskField::LoopValue => Self::LOOP_VALUE,
            TaskField::OutputChannel => Self::OUTPUT_CHANNEL,
            TaskField::Counter => Self::COUNTER,
            TaskField::Custom(i) => i,
        }
    }
}

impl From<i64> for TaskField {
    fn from(index: i64) -> Self {
        match index {
            Self::TASK_ID => TaskField::TaskId,
            Self::LOOP_VALUE => TaskField::LoopValue,
            Self::OUTPUT_CHANNEL => TaskField::OutputChannel,
            Self::COUNTER => TaskField::Counter,
            other => TaskField::Custom(other),
        }
    }
}

/// 任务体
///
/// 指令区间总是相对于设置它的函数，执行时使用的也是这个函数的代码
#[derive(Debug, Clone)]
pub struct TaskBody {
    pub function: Arc<Function>,
    pub types: Arc<[ResultType]>,
    pub range: Range<usize>,
}

/// 任务上下文
#[derive(Debug, Clone)]
pub struct TaskContext {
    pub task_id: i64,
    state: TaskState,
    pub counter: i64,
    /// 绑定的输出 Channel
    pub output_channel: Option<usize>,
    pub loop_value: RegisterValue,
    fields: HashMap<i64, RegisterValue>,
    /// 睡眠截止 tick
    pub sleep_until: u64,
    pub body: Option<TaskBody>,
}

impl TaskContext {
    pub fn new(task_id: i64) -> Self {
        Self {
            task_id,
            state: TaskState::Init,
            counter: 0,
            output_channel: None,
            loop_value: RegisterValue::None,
            fields: HashMap::new(),
            sleep_until: 0,
            body: None,
        }
    }

    #[inline]
    pub fn state(&self) -> TaskState {
        self.state
    }

    #[inline]
    pub fn is_completed(&self) -> bool {
        self.state == TaskState::Completed
    }

    /// 状态迁移
    ///
    /// 完成态不可离开，非 Init 态不可回到 Init。返回是否接受。
    pub fn set_state(&mut self, to: TaskState) -> bool {
        let accepted = match (self.state, to) {
            (from, to) if from == to => true,
            (TaskState::Completed, _) => false,
            (_, TaskState::Init) => false,
            _ => true,
        };
        if accepted {
            self.state = to;
        } else {
            tracing::debug!(
                target: "regvm::runtime::task",
                task = self.task_id,
                from = ?self.state,
                to = ?to,
                "rejected task state transition"
            );
        }
        accepted
    }

    /// 进入睡眠，直到 `until` tick
    pub fn sleep_until(&mut self, until: u64) -> bool {
        if !matches!(self.state, TaskState::Running | TaskState::Sleeping) {
            return false;
        }
        self.sleep_until = until;
        self.state = TaskState::Sleeping;
        true
    }

    /// 到期则唤醒，返回是否发生了迁移
    pub fn wake_if_due(&mut self, now: u64) -> bool {
        if self.state == TaskState::Sleeping && now >= self.sleep_until {
            self.state = TaskState::Running;
            true
        } else {
            false
        }
    }

    /// 读取字段；从未写入的自由字段为空值
    pub fn field(&self, field: TaskField) -> RegisterValue {
        match field {
            TaskField::TaskId => RegisterValue::Int(self.task_id),
            TaskField::LoopValue => self.loop_value.clone(),
            TaskField::OutputChannel => self
                .output_channel
                .map_or(RegisterValue::None, |h| RegisterValue::Int(h as i64)),
            TaskField::Counter => RegisterValue::Int(self.counter),
            TaskField::Custom(index) => self.fields.get(&index).cloned().unwrap_or_default(),
        }
    }

    /// 写入字段
    pub fn set_field(&mut self, field: TaskField, value: RegisterValue) {
        match field {
            TaskField::TaskId => self.task_id = value.to_int(),
            TaskField::LoopValue => self.loop_value = value,
            TaskField::OutputChannel => {
                self.output_channel = match value {
                    RegisterValue::Int(h) if h >= 0 => Some(h as usize),
                    _ => None,
                }
            }
            TaskField::Counter => self.counter = value.to_int(),
            TaskField::Custom(index) => {
                self.fields.insert(index, value);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_completed_is_terminal() {
        let mut task = TaskContext::new(1);
        assert!(task.set_state(TaskState::Running));
        assert!(task.set_state(TaskState::Completed));
        assert!(!task.set_state(TaskState::Running));
        assert!(!task.set_state(TaskState::Sleeping));
        assert!(!task.sleep_until(10));
        assert_eq!(task.state(), TaskState::Completed);
    }

    #[test]
    fn test_no_return_to_init() {
        let mut task = TaskContext::new(1);
        assert!(task.set_state(TaskState::Running));
        assert!(!task.set_state(TaskState::Init));
    }

    #[test]
    fn test_sleep_and_wake() {
        let mut task = TaskContext::new(7);
        task.set_state(TaskState::Running);
        assert!(task.sleep_until(5));

        assert!(!task.wake_if_due(4));
        assert_eq!(task.state(), TaskState::Sleeping);
        assert!(task.wake_if_due(5));
        assert_eq!(task.state(), TaskState::Running);
    }

    #[test]
    fn test_field_schema() {
        let mut task = TaskContext::new(3);
        task.set_field(TaskField::from(2), RegisterValue::Int(4));
        task.set_field(TaskField::from(3), RegisterValue::Int(9));
        task.set_field(TaskField::from(17), RegisterValue::from("x"));

        assert_eq!(task.output_channel, Some(4));
        assert_eq!(task.counter, 9);
        assert_eq!(task.field(TaskField::TaskId), RegisterValue::Int(3));
        assert_eq!(task.field(TaskField::Custom(17)), RegisterValue::from("x"));
        assert_eq!(task.field(TaskField::Custom(18)), RegisterValue::None);
        assert_eq!(TaskField::from(17).index(), 17);
    }
}
