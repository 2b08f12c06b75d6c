//! 寄存器值定义
//!
//! 寄存器中保存的是一个封闭的和类型：整数、浮点、布尔、文本或空值。
//! 所有算术与比较处理器都对它做穷尽匹配，不存在动态类型的后门。

use std::cmp::Ordering;
use std::fmt;

/// 寄存器值
#[derive(Debug, Clone, PartialEq, Default)]
pub enum RegisterValue {
    /// 64 位有符号整数
    Int(i64),
    /// 64 位浮点数
    Float(f64),
    /// 布尔值
    Bool(bool),
    /// 拥有所有权的文本
    Str(String),
    /// 空值（从未写入的寄存器、失败的指令结果）
    #[default]
    None,
}

impl RegisterValue {
    /// 是否为数值（整数或浮点）
    #[inline]
    pub fn is_numeric(&self) -> bool {
        matches!(self, RegisterValue::Int(_) | RegisterValue::Float(_))
    }

    #[inline]
    pub fn is_float(&self) -> bool {
        matches!(self, RegisterValue::Float(_))
    }

    #[inline]
    pub fn is_none(&self) -> bool {
        matches!(self, RegisterValue::None)
    }

    /// 取整数视图
    ///
    /// 浮点截断，布尔映射为 0/1，文本尝试解析，其余为 0
    pub fn to_int(&self) -> i64 {
        match self {
            RegisterValue::Int(n) => *n,
            RegisterValue::Float(f) => *f as i64,
            RegisterValue::Bool(b) => *b as i64,
            RegisterValue::Str(s) => s.trim().parse().unwrap_or(0),
            RegisterValue::None => 0,
        }
    }

    /// 取浮点视图
    pub fn to_float(&self) -> f64 {
        match self {
            RegisterValue::Int(n) => *n as f64,
            RegisterValue::Float(f) => *f,
            RegisterValue::Bool(b) => {
                if *b {
                    1.0
                } else {
                    0.0
                }
            }
            RegisterValue::Str(s) => s.trim().parse().unwrap_or(0.0),
            RegisterValue::None => 0.0,
        }
    }

    /// 真值判断：非零数值、true、非空文本为真
    #[inline]
    pub fn is_truthy(&self) -> bool {
        match self {
            RegisterValue::Int(n) => *n != 0,
            RegisterValue::Float(f) => *f != 0.0,
            RegisterValue::Bool(b) => *b,
            RegisterValue::Str(s) => !s.is_empty(),
            RegisterValue::None => false,
        }
    }

    /// 只读文本视图
    pub fn as_str(&self) -> Option<&str> {
        match self {
            RegisterValue::Str(s) => Some(s),
            _ => None,
        }
    }

    /// 整数视图（仅 Int）
    pub fn as_int(&self) -> Option<i64> {
        match self {
            RegisterValue::Int(n) => Some(*n),
            _ => None,
        }
    }

    /// 比较两个值
    ///
    /// 仅支持数值对与文本对，其它组合返回 None（调用方据此得出 false）
    pub fn compare(&self, other: &RegisterValue) -> Option<Ordering> {
        match (self, other) {
            (RegisterValue::Int(a), RegisterValue::Int(b)) => Some(a.cmp(b)),
            (RegisterValue::Str(a), RegisterValue::Str(b)) => Some(a.as_str().cmp(b.as_str())),
            (a, b) if a.is_numeric() && b.is_numeric() => a.to_float().partial_cmp(&b.to_float()),
            _ => None,
        }
    }

    /// 类型名（用于日志）
    pub fn type_name(&self) -> &'static str {
        match self {
            RegisterValue::Int(_) => "int",
            RegisterValue::Float(_) => "float",
            RegisterValue::Bool(_) => "bool",
            RegisterValue::Str(_) => "string",
            RegisterValue::None => "nil",
        }
    }
}

impl fmt::Display for RegisterValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegisterValue::Int(n) => write!(f, "{}", n),
            RegisterValue::Float(n) => {
                if n.fract() == 0.0 {
                    write!(f, "{}.0", n)
                } else {
                    write!(f, "{}", n)
                }
            }
            RegisterValue::Bool(b) => write!(f, "{}", b),
            RegisterValue::Str(s) => write!(f, "{}", s),
            RegisterValue::None => write!(f, "nil"),
        }
    }
}

impl From<i64> for RegisterValue {
    fn from(n: i64) -> Self {
        RegisterValue::Int(n)
    }
}

impl From<f64> for RegisterValue {
    fn from(n: f64) -> Self {
        RegisterValue::Float(n)
    }
}

impl From<bool> for RegisterValue {
    fn from(b: bool) -> Self {
        RegisterValue::Bool(b)
    }
}

impl From<&str> for RegisterValue {
    fn from(s: &str) -> Self {
        RegisterValue::Str(s.to_string())
    }
}

impl From<String> for RegisterValue {
    fn from(s: String) -> Self {
        RegisterValue::Str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truthiness() {
        assert!(RegisterValue::Int(3).is_truthy());
        assert!(!RegisterValue::Int(0).is_truthy());
        assert!(!RegisterValue::Float(0.0).is_truthy());
        assert!(RegisterValue::Bool(true).is_truthy());
        assert!(!RegisterValue::from("").is_truthy());
        assert!(RegisterValue::from("x").is_truthy());
        assert!(!RegisterValue::None.is_truthy());
    }

    #[test]
    fn test_compare_mixed_kinds() {
        assert_eq!(
            RegisterValue::Int(2).compare(&RegisterValue::Float(2.5)),
            Some(Ordering::Less)
        );
        assert_eq!(
            RegisterValue::from("b").compare(&RegisterValue::from("a")),
            Some(Ordering::Greater)
        );
        assert_eq!(RegisterValue::Int(1).compare(&RegisterValue::from("1")), None);
        assert_eq!(RegisterValue::Bool(true).compare(&RegisterValue::Bool(true)), None);
    }

    #[test]
    fn test_display() {
        assert_eq!(RegisterValue::Float(2.0).to_string(), "2.0");
        assert_eq!(RegisterValue::Float(0.25).to_string(), "0.25");
        assert_eq!(RegisterValue::Float(f64::INFINITY).to_string(), "inf");
        assert_eq!(RegisterValue::None.to_string(), "nil");
    }
}
