//! 表达式求值
//!
//! 值语义贴近 Python：真值判断、数值混合运算、`and` / `or` 返回操作数本身。
//! 访问 dict 中不存在的键得到 `None`，不报错。

use super::parser::{BinaryOp, Expr, MAX_DEPTH, Program, Statement, nesting_error};
use crate::evaluator::EvaluationError;
use regex::Regex;
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};
use std::fmt;

/// 重复字符串/列表时允许的最大长度
const MAX_REPEAT_LEN: usize = 1 << 20;

/// 求值递归深度上限，解析器产出的语法树不会超过
const MAX_EVAL_DEPTH: usize = MAX_DEPTH * 4;

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    List(Vec<Value>),
    Dict(BTreeMap<String, Value>),
}

impl Value {
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::None => "NoneType",
            Self::Bool(_) => "bool",
            Self::Int(_) => "int",
            Self::Float(_) => "float",
            Self::Str(_) => "str",
            Self::List(_) => "list",
            Self::Dict(_) => "dict",
        }
    }

    pub fn truthy(&self) -> bool {
        match self {
            Self::None => false,
            Self::Bool(b) => *b,
            Self::Int(i) => *i != 0,
            Self::Float(f) => *f != 0.0,
            Self::Str(s) => !s.is_empty(),
            Self::List(items) => !items.is_empty(),
            Self::Dict(map) => !map.is_empty(),
        }
    }

    fn number(&self) -> Option<Number> {
        match self {
            Self::Bool(b) => Some(Number::Int(i64::from(*b))),
            Self::Int(i) => Some(Number::Int(*i)),
            Self::Float(f) => Some(Number::Float(*f)),
            _ => None,
        }
    }

    fn repr(&self) -> String {
        match self {
            Self::Str(s) => format!("'{}'", s),
            other => other.to_string(),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => write!(f, "None"),
            Self::Bool(true) => write!(f, "True"),
            Self::Bool(false) => write!(f, "False"),
            Self::Int(i) => write!(f, "{}", i),
            Self::Float(v) if v.fract() == 0.0 && v.is_finite() => write!(f, "{:.1}", v),
            Self::Float(v) => write!(f, "{}", v),
            Self::Str(s) => write!(f, "{}", s),
            Self::List(items) => {
                let inner: Vec<String> = items.iter().map(Value::repr).collect();
                write!(f, "[{}]", inner.join(", "))
            }
            Self::Dict(map) => {
                let inner: Vec<String> = map
                    .iter()
                    .map(|(k, v)| format!("'{}': {}", k, v.repr()))
                    .collect();
                write!(f, "{{{}}}", inner.join(", "))
            }
        }
    }
}

impl From<&serde_json::Value> for Value {
    fn from(value: &serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => Self::None,
            serde_json::Value::Bool(b) => Self::Bool(*b),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => Self::Int(i),
                None => Self::Float(n.as_f64().unwrap_or(f64::NAN)),
            },
            serde_json::Value::String(s) => Self::Str(s.clone()),
            serde_json::Value::Array(items) => Self::List(items.iter().map(Value::from).collect()),
            serde_json::Value::Object(map) => Self::Dict(
                map.iter()
                    .map(|(k, v)| (k.clone(), Value::from(v)))
                    .collect(),
            ),
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Number {
    Int(i64),
    Float(f64),
}

impl Number {
    fn as_f64(self) -> f64 {
        match self {
            Self::Int(i) => i as f64,
            Self::Float(f) => f,
        }
    }
}

fn type_error(message: impl Into<String>) -> EvaluationError {
    EvaluationError::new(message.into())
}

fn unsupported(op: BinaryOp, left: &Value, right: &Value) -> EvaluationError {
    type_error(format!(
        "unsupported operand type(s) for {}: '{}' and '{}'",
        op,
        left.type_name(),
        right.type_name()
    ))
}

fn overflow() -> EvaluationError {
    EvaluationError::new("integer overflow")
}

/// 求值结果
#[derive(Debug, Clone, PartialEq)]
pub struct Evaluation {
    /// `return` 的值，没有 `return` 时为最后一条语句的值
    pub result: Value,
    /// 通过 `ak_message` 收集的消息
    pub messages: Vec<String>,
}

/// 执行程序
pub fn run(program: &Program, globals: &HashMap<String, Value>) -> Result<Evaluation, EvaluationError> {
    let mut interpreter = Interpreter {
        globals,
        messages: Vec::new(),
        depth: 0,
    };

    let mut result = Value::None;
    for statement in &program.statements {
        match statement {
            Statement::Expr(expr) => result = interpreter.eval(expr)?,
            Statement::Return(expr) => {
                result = interpreter.eval(expr)?;
                break;
            }
        }
    }

    Ok(Evaluation {
        result,
        messages: interpreter.messages,
    })
}

struct Interpreter<'a> {
    globals: &'a HashMap<String, Value>,
    messages: Vec<String>,
    depth: usize,
}

impl Interpreter<'_> {
    fn eval(&mut self, expr: &Expr) -> Result<Value, EvaluationError> {
        if self.depth >= MAX_EVAL_DEPTH {
            return Err(nesting_error());
        }
        self.depth += 1;
        let value = self.eval_node(expr);
        self.depth -= 1;
        value
    }

    fn eval_node(&mut self, expr: &Expr) -> Result<Value, EvaluationError> {
        match expr {
            Expr::Literal(value) => Ok(value.clone()),
            Expr::Name(name) => self
                .globals
                .get(name)
                .cloned()
                .ok_or_else(|| EvaluationError::new(format!("name '{}' is not defined", name))),
            Expr::List(items) => {
                let values = items
                    .iter()
                    .map(|item| self.eval(item))
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(Value::List(values))
            }
            Expr::Attribute(target, name) => {
                let target = self.eval(target)?;
                attribute(&target, name)
            }
            Expr::Index(target, index) => {
                let target = self.eval(target)?;
                let index = self.eval(index)?;
                subscript(&target, &index)
            }
            Expr::Call(name, args) => {
                let args = args
                    .iter()
                    .map(|arg| self.eval(arg))
                    .collect::<Result<Vec<_>, _>>()?;
                self.call(name, args)
            }
            Expr::Neg(operand) => {
                let value = self.eval(operand)?;
                match value.number() {
                    Some(Number::Int(i)) => i.checked_neg().map(Value::Int).ok_or_else(overflow),
                    Some(Number::Float(f)) => Ok(Value::Float(-f)),
                    None => Err(type_error(format!(
                        "bad operand type for unary -: '{}'",
                        value.type_name()
                    ))),
                }
            }
            Expr::Not(operand) => Ok(Value::Bool(!self.eval(operand)?.truthy())),
            Expr::And(left, right) => {
                let left = self.eval(left)?;
                if left.truthy() {
                    self.eval(right)
                } else {
                    Ok(left)
                }
            }
            Expr::Or(left, right) => {
                let left = self.eval(left)?;
                if left.truthy() {
                    Ok(left)
                } else {
                    self.eval(right)
                }
            }
            Expr::Binary(op, left, right) => {
                let left = self.eval(left)?;
                let right = self.eval(right)?;
                binary(*op, &left, &right)
            }
        }
    }

    fn call(&mut self, name: &str, args: Vec<Value>) -> Result<Value, EvaluationError> {
        match name {
            "ak_message" => {
                let [message] = exactly::<1>(name, args)?;
                self.messages.push(message.to_string());
                Ok(Value::None)
            }
            "len" => {
                let [value] = exactly::<1>(name, args)?;
                let len = match &value {
                    Value::Str(s) => s.chars().count(),
                    Value::List(items) => items.len(),
                    Value::Dict(map) => map.len(),
                    other => {
                        return Err(type_error(format!(
                            "object of type '{}' has no len()",
                            other.type_name()
                        )));
                    }
                };
                Ok(Value::Int(len as i64))
            }
            "lower" | "upper" => {
                let [value] = exactly::<1>(name, args)?;
                match value {
                    Value::Str(s) if name == "lower" => Ok(Value::Str(s.to_lowercase())),
                    Value::Str(s) => Ok(Value::Str(s.to_uppercase())),
                    other => Err(type_error(format!(
                        "{}() argument must be str, not {}",
                        name,
                        other.type_name()
                    ))),
                }
            }
            "str" => {
                let [value] = exactly::<1>(name, args)?;
                Ok(Value::Str(value.to_string()))
            }
            "bool" => {
                let [value] = exactly::<1>(name, args)?;
                Ok(Value::Bool(value.truthy()))
            }
            "regex_match" => {
                let [value, pattern] = exactly::<2>(name, args)?;
                match (&value, &pattern) {
                    (Value::Str(value), Value::Str(pattern)) => {
                        let regex = Regex::new(pattern)
                            .map_err(|e| EvaluationError::new(format!("invalid regex: {}", e)))?;
                        Ok(Value::Bool(regex.is_match(value)))
                    }
                    _ => Err(type_error(format!(
                        "regex_match() arguments must be str, not '{}' and '{}'",
                        value.type_name(),
                        pattern.type_name()
                    ))),
                }
            }
            _ => Err(EvaluationError::new(format!("name '{}' is not defined", name))),
        }
    }
}

fn exactly<const N: usize>(name: &str, args: Vec<Value>) -> Result<[Value; N], EvaluationError> {
    let given = args.len();
    args.try_into().map_err(|_| {
        type_error(format!(
            "{}() takes exactly {} argument{} ({} given)",
            name,
            N,
            if N == 1 { "" } else { "s" },
            given
        ))
    })
}

fn attribute(target: &Value, name: &str) -> Result<Value, EvaluationError> {
    match target {
        Value::Dict(map) => Ok(map.get(name).cloned().unwrap_or(Value::None)),
        other => Err(type_error(format!(
            "'{}' object has no attribute '{}'",
            other.type_name(),
            name
        ))),
    }
}

fn normalize_index(index: i64, len: usize) -> Option<usize> {
    let len = len as i64;
    let index = if index < 0 { index + len } else { index };
    (0..len).contains(&index).then_some(index as usize)
}

fn subscript(target: &Value, index: &Value) -> Result<Value, EvaluationError> {
    match (target, index) {
        (Value::Dict(map), Value::Str(key)) => Ok(map.get(key).cloned().unwrap_or(Value::None)),
        (Value::Dict(_), _) => Ok(Value::None),
        (Value::List(items), Value::Int(i)) => normalize_index(*i, items.len())
            .map(|i| items[i].clone())
            .ok_or_else(|| EvaluationError::new("list index out of range")),
        (Value::Str(s), Value::Int(i)) => {
            let chars: Vec<char> = s.chars().collect();
            normalize_index(*i, chars.len())
                .map(|i| Value::Str(chars[i].to_string()))
                .ok_or_else(|| EvaluationError::new("string index out of range"))
        }
        (Value::List(_) | Value::Str(_), other) => Err(type_error(format!(
            "{} indices must be integers, not {}",
            target.type_name(),
            other.type_name()
        ))),
        (other, _) => Err(type_error(format!(
            "'{}' object is not subscriptable",
            other.type_name()
        ))),
    }
}

fn equals(left: &Value, right: &Value) -> bool {
    match (left, right) {
        (Value::Str(a), Value::Str(b)) => a == b,
        (Value::None, Value::None) => true,
        (Value::List(a), Value::List(b)) => {
            a.len() == b.len() && a.iter().zip(b).all(|(x, y)| equals(x, y))
        }
        (Value::Dict(a), Value::Dict(b)) => {
            a.len() == b.len()
                && a.iter()
                    .all(|(k, v)| b.get(k).is_some_and(|other| equals(v, other)))
        }
        _ => match (left.number(), right.number()) {
            (Some(Number::Int(a)), Some(Number::Int(b))) => a == b,
            (Some(a), Some(b)) => a.as_f64() == b.as_f64(),
            _ => false,
        },
    }
}

fn compare(op: BinaryOp, left: &Value, right: &Value) -> Result<Ordering, EvaluationError> {
    let not_supported = || {
        type_error(format!(
            "'{}' not supported between instances of '{}' and '{}'",
            op,
            left.type_name(),
            right.type_name()
        ))
    };

    match (left, right) {
        (Value::Str(a), Value::Str(b)) => Ok(a.cmp(b)),
        (Value::List(a), Value::List(b)) => {
            for (x, y) in a.iter().zip(b) {
                if !equals(x, y) {
                    return compare(op, x, y);
                }
            }
            Ok(a.len().cmp(&b.len()))
        }
        _ => match (left.number(), right.number()) {
            (Some(Number::Int(a)), Some(Number::Int(b))) => Ok(a.cmp(&b)),
            (Some(a), Some(b)) => a.as_f64().partial_cmp(&b.as_f64()).ok_or_else(not_supported),
            _ => Err(not_supported()),
        },
    }
}

fn contains(container: &Value, item: &Value) -> Result<bool, EvaluationError> {
    match container {
        Value::List(items) => Ok(items.iter().any(|v| equals(v, item))),
        Value::Dict(map) => Ok(matches!(item, Value::Str(key) if map.contains_key(key))),
        Value::Str(haystack) => match item {
            Value::Str(needle) => Ok(haystack.contains(needle.as_str())),
            other => Err(type_error(format!(
                "'in <string>' requires string as left operand, not {}",
                other.type_name()
            ))),
        },
        other => Err(type_error(format!(
            "argument of type '{}' is not iterable",
            other.type_name()
        ))),
    }
}

fn repeat<T: Clone>(items: &[T], times: i64) -> Result<Vec<T>, EvaluationError> {
    let times = usize::try_from(times.max(0)).map_err(|_| overflow())?;
    if items.len().saturating_mul(times) > MAX_REPEAT_LEN {
        return Err(EvaluationError::new("repeated sequence is too long"));
    }
    Ok((0..times).flat_map(|_| items.iter().cloned()).collect())
}

fn floor_div(a: i64, b: i64) -> Option<i64> {
    let q = a.checked_div(b)?;
    if a % b != 0 && ((a < 0) != (b < 0)) {
        q.checked_sub(1)
    } else {
        Some(q)
    }
}

fn floor_mod(a: i64, b: i64) -> Option<i64> {
    let r = a.checked_rem(b)?;
    if r != 0 && ((r < 0) != (b < 0)) {
        Some(r + b)
    } else {
        Some(r)
    }
}

fn float_mod(a: f64, b: f64) -> f64 {
    let r = a % b;
    if r != 0.0 && ((r < 0.0) != (b < 0.0)) {
        r + b
    } else {
        r
    }
}

fn arithmetic(op: BinaryOp, left: &Value, right: &Value) -> Result<Value, EvaluationError> {
    let (Some(a), Some(b)) = (left.number(), right.number()) else {
        return Err(unsupported(op, left, right));
    };

    if let (Number::Int(a), Number::Int(b)) = (a, b) {
        let value = match op {
            BinaryOp::Add => a.checked_add(b).ok_or_else(overflow)?,
            BinaryOp::Sub => a.checked_sub(b).ok_or_else(overflow)?,
            BinaryOp::Mul => a.checked_mul(b).ok_or_else(overflow)?,
            BinaryOp::Div => {
                if b == 0 {
                    return Err(EvaluationError::new("division by zero"));
                }
                return Ok(Value::Float(a as f64 / b as f64));
            }
            BinaryOp::FloorDiv => {
                if b == 0 {
                    return Err(EvaluationError::new("integer division or modulo by zero"));
                }
                floor_div(a, b).ok_or_else(overflow)?
            }
            BinaryOp::Mod => {
                if b == 0 {
                    return Err(EvaluationError::new("integer modulo by zero"));
                }
                floor_mod(a, b).ok_or_else(overflow)?
            }
            _ => return Err(unsupported(op, left, right)),
        };
        return Ok(Value::Int(value));
    }

    let (a, b) = (a.as_f64(), b.as_f64());
    let value = match op {
        BinaryOp::Add => a + b,
        BinaryOp::Sub => a - b,
        BinaryOp::Mul => a * b,
        BinaryOp::Div if b == 0.0 => return Err(EvaluationError::new("float division by zero")),
        BinaryOp::Div => a / b,
        BinaryOp::FloorDiv if b == 0.0 => {
            return Err(EvaluationError::new("float floor division by zero"));
        }
        BinaryOp::FloorDiv => (a / b).floor(),
        BinaryOp::Mod if b == 0.0 => return Err(EvaluationError::new("float modulo by zero")),
        BinaryOp::Mod => float_mod(a, b),
        _ => return Err(unsupported(op, left, right)),
    };
    Ok(Value::Float(value))
}

fn binary(op: BinaryOp, left: &Value, right: &Value) -> Result<Value, EvaluationError> {
    match op {
        BinaryOp::Eq => Ok(Value::Bool(equals(left, right))),
        BinaryOp::Ne => Ok(Value::Bool(!equals(left, right))),
        BinaryOp::Lt => Ok(Value::Bool(compare(op, left, right)? == Ordering::Less)),
        BinaryOp::Le => Ok(Value::Bool(compare(op, left, right)? != Ordering::Greater)),
        BinaryOp::Gt => Ok(Value::Bool(compare(op, left, right)? == Ordering::Greater)),
        BinaryOp::Ge => Ok(Value::Bool(compare(op, left, right)? != Ordering::Less)),
        BinaryOp::In => Ok(Value::Bool(contains(right, left)?)),
        BinaryOp::NotIn => Ok(Value::Bool(!contains(right, left)?)),
        BinaryOp::Add => match (left, right) {
            (Value::Str(a), Value::Str(b)) => Ok(Value::Str(format!("{}{}", a, b))),
            (Value::List(a), Value::List(b)) => {
                Ok(Value::List(a.iter().chain(b).cloned().collect()))
            }
            _ => arithmetic(op, left, right),
        },
        BinaryOp::Mul => match (left, right) {
            (Value::Str(s), Value::Int(n)) | (Value::Int(n), Value::Str(s)) => {
                let chars: Vec<char> = s.chars().collect();
                Ok(Value::Str(repeat(&chars, *n)?.into_iter().collect()))
            }
            (Value::List(items), Value::Int(n)) | (Value::Int(n), Value::List(items)) => {
                Ok(Value::List(repeat(items, *n)?))
            }
            _ => arithmetic(op, left, right),
        },
        BinaryOp::Sub | BinaryOp::Div | BinaryOp::FloorDiv | BinaryOp::Mod => {
            arithmetic(op, left, right)
        }
    }
}
