//! Runtime values and the operators defined on them.

use std::cmp::Ordering;
use std::sync::Arc;

use serde_json::{Map, Number};

use super::ast::{BinOp, CmpOp, FunctionDef};
use super::error::RuntimeError;
use super::format::{format_float, percent_format, repr_str};
use super::modules::Module;

/// Upper bound on elements or bytes produced by one sequence operation.
pub(crate) const MAX_SEQUENCE_LEN: usize = 10_000_000;

/// Builtins that double as type objects for `type()` and `isinstance()`.
pub(crate) const TYPE_NAMES: [&str; 8] = ["bool", "dict", "float", "int", "list", "set", "str", "tuple"];

#[derive(Clone, Debug, Default)]
pub(crate) enum Value {
    #[default]
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    List(Vec<Value>),
    Dict(Dict),
    Module(Module),
    Builtin(&'static str),
    ModuleFn(Module, &'static str),
    Capability(String),
    Function(Arc<FunctionDef>),
}

/// Insertion-ordered mapping with scalar keys.
#[derive(Clone, Debug, Default)]
pub(crate) struct Dict {
    entries: Vec<(Value, Value)>,
}

impl Dict {
    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn get(&self, key: &Value) -> Option<&Value> {
        self.entries
            .iter()
            .find(|(existing, _)| existing.py_eq(key))
            .map(|(_, value)| value)
    }

    pub(crate) fn get_mut(&mut self, key: &Value) -> Option<&mut Value> {
        self.entries
            .iter_mut()
            .find(|(existing, _)| existing.py_eq(key))
            .map(|(_, value)| value)
    }

    pub(crate) fn contains(&self, key: &Value) -> bool {
        self.get(key).is_some()
    }

    pub(crate) fn insert(&mut self, key: Value, value: Value) -> Result<(), RuntimeError> {
        if !key.is_hashable() {
            return Err(RuntimeError::type_error(format!(
                "unhashable type: '{}'",
                key.type_name()
            )));
        }
        match self.get_mut(&key) {
            Some(slot) => *slot = value,
            None => self.entries.push((key, value)),
        }
        Ok(())
    }

    pub(crate) fn remove(&mut self, key: &Value) -> Option<Value> {
        let position = self
            .entries
            .iter()
            .position(|(existing, _)| existing.py_eq(key))?;
        Some(self.entries.remove(position).1)
    }

    pub(crate) fn clear(&mut self) {
        self.entries.clear();
    }

    pub(crate) fn keys(&self) -> Vec<Value> {
        self.entries.iter().map(|(key, _)| key.clone()).collect()
    }

    pub(crate) fn values(&self) -> Vec<Value> {
        self.entries.iter().map(|(_, value)| value.clone()).collect()
    }

    pub(crate) fn items(&self) -> Vec<Value> {
        self.entries
            .iter()
            .map(|(key, value)| Value::List(vec![key.clone(), value.clone()]))
            .collect()
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = &(Value, Value)> {
        self.entries.iter()
    }
}

impl Value {
    pub(crate) fn type_name(&self) -> &'static str {
        match self {
            Self::None => "NoneType",
            Self::Bool(_) => "bool",
            Self::Int(_) => "int",
            Self::Float(_) => "float",
            Self::Str(_) => "str",
            Self::List(_) => "list",
            Self::Dict(_) => "dict",
            Self::Module(_) => "module",
            Self::Builtin(_) | Self::ModuleFn(..) | Self::Capability(_) => {
                "builtin_function_or_method"
            }
            Self::Function(_) => "function",
        }
    }

    pub(crate) fn truthy(&self) -> bool {
        match self {
            Self::None => false,
            Self::Bool(b) => *b,
            Self::Int(i) => *i != 0,
            Self::Float(f) => *f != 0.0,
            Self::Str(s) => !s.is_empty(),
            Self::List(items) => !items.is_empty(),
            Self::Dict(dict) => dict.len() > 0,
            _ => true,
        }
    }

    fn is_hashable(&self) -> bool {
        matches!(
            self,
            Self::None | Self::Bool(_) | Self::Int(_) | Self::Float(_) | Self::Str(_)
        )
    }

    /// Integer view of ints and bools.
    pub(crate) fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(i) => Some(*i),
            Self::Bool(b) => Some(i64::from(*b)),
            _ => None,
        }
    }

    /// Float view of any number.
    pub(crate) fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Float(f) => Some(*f),
            other => other.as_int().map(widen),
        }
    }

    pub(crate) fn expect_int(&self, what: &str) -> Result<i64, RuntimeError> {
        self.as_int().ok_or_else(|| {
            RuntimeError::type_error(format!(
                "{what} must be an integer, not '{}'",
                self.type_name()
            ))
        })
    }

    pub(crate) fn expect_number(&self, what: &str) -> Result<f64, RuntimeError> {
        self.as_f64().ok_or_else(|| {
            RuntimeError::type_error(format!(
                "{what} must be a number, not '{}'",
                self.type_name()
            ))
        })
    }

    pub(crate) fn expect_str(&self, what: &str) -> Result<&str, RuntimeError> {
        match self {
            Self::Str(s) => Ok(s),
            other => Err(RuntimeError::type_error(format!(
                "{what} must be a string, not '{}'",
                other.type_name()
            ))),
        }
    }

    /// Python `str()`.
    pub(crate) fn to_str(&self) -> String {
        match self {
            Self::Str(s) => s.clone(),
            other => other.repr(),
        }
    }

    /// Python `repr()`.
    pub(crate) fn repr(&self) -> String {
        match self {
            Self::None => "None".to_owned(),
            Self::Bool(true) => "True".to_owned(),
            Self::Bool(false) => "False".to_owned(),
            Self::Int(i) => i.to_string(),
            Self::Float(f) => format_float(*f),
            Self::Str(s) => repr_str(s),
            Self::List(items) => {
                let inner: Vec<String> = items.iter().map(Self::repr).collect();
                format!("[{}]", inner.join(", "))
            }
            Self::Dict(dict) => {
                let inner: Vec<String> = dict
                    .iter()
                    .map(|(key, value)| format!("{}: {}", key.repr(), value.repr()))
                    .collect();
                format!("{{{}}}", inner.join(", "))
            }
            Self::Module(module) => format!("<module '{}'>", module.name()),
            Self::Builtin(name) if TYPE_NAMES.contains(name) => format!("<class '{name}'>"),
            Self::Builtin(name) => format!("<built-in function {name}>"),
            Self::ModuleFn(module, name) => {
                format!("<built-in function {}.{name}>", module.name())
            }
            Self::Capability(name) => format!("<capability {name}>"),
            Self::Function(def) => format!("<function {}>", def.name),
        }
    }

    pub(crate) fn from_json(json: &serde_json::Value) -> Self {
        match json {
            serde_json::Value::Null => Self::None,
            serde_json::Value::Bool(b) => Self::Bool(*b),
            serde_json::Value::Number(n) => n
                .as_i64()
                .map(Self::Int)
                .or_else(|| n.as_f64().map(Self::Float))
                .unwrap_or_default(),
            serde_json::Value::String(s) => Self::Str(s.clone()),
            serde_json::Value::Array(items) => Self::List(items.iter().map(Self::from_json).collect()),
            serde_json::Value::Object(map) => Self::Dict(Dict {
                entries: map
                    .iter()
                    .map(|(key, value)| (Self::Str(key.clone()), Self::from_json(value)))
                    .collect(),
            }),
        }
    }

    /// JSON form of plain data; `None` for modules and callables.
    pub(crate) fn to_json(&self) -> Option<serde_json::Value> {
        Some(match self {
            Self::None => serde_json::Value::Null,
            Self::Bool(b) => serde_json::Value::Bool(*b),
            Self::Int(i) => serde_json::Value::from(*i),
            Self::Float(f) => Number::from_f64(*f).map_or(serde_json::Value::Null, serde_json::Value::Number),
            Self::Str(s) => serde_json::Value::String(s.clone()),
            Self::List(items) => serde_json::Value::Array(
                items.iter().map(Self::to_json).collect::<Option<Vec<_>>>()?,
            ),
            Self::Dict(dict) => {
                let mut map = Map::new();
                for (key, value) in dict.iter() {
                    map.insert(key.to_str(), value.to_json()?);
                }
                serde_json::Value::Object(map)
            }
            _ => return None,
        })
    }

    /// JSON form of any value, rendering non-data values as text.
    pub(crate) fn to_json_lossy(&self) -> serde_json::Value {
        self.to_json()
            .unwrap_or_else(|| serde_json::Value::String(self.repr()))
    }

    /// Python `==`.
    pub(crate) fn py_eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::None, Self::None) => true,
            (Self::Str(a), Self::Str(b)) => a == b,
            (Self::List(a), Self::List(b)) => {
                a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x.py_eq(y))
            }
            (Self::Dict(a), Self::Dict(b)) => {
                a.len() == b.len()
                    && a.iter()
                        .all(|(key, value)| b.get(key).is_some_and(|other| value.py_eq(other)))
            }
            (Self::Module(a), Self::Module(b)) => a == b,
            (Self::Builtin(a), Self::Builtin(b)) => a == b,
            (Self::ModuleFn(ma, a), Self::ModuleFn(mb, b)) => ma == mb && a == b,
            (Self::Capability(a), Self::Capability(b)) => a == b,
            (Self::Function(a), Self::Function(b)) => Arc::ptr_eq(a, b),
            (Self::Int(a), Self::Int(b)) => a == b,
            (a, b) => match (a.as_int(), b.as_int()) {
                (Some(x), Some(y)) => x == y,
                _ => match (a.as_f64(), b.as_f64()) {
                    (Some(x), Some(y)) => (x - y).abs() == 0.0,
                    _ => false,
                },
            },
        }
    }

    /// Python ordering (`<` and friends).
    pub(crate) fn compare(&self, other: &Self) -> Result<Ordering, RuntimeError> {
        match (self, other) {
            (Self::Str(a), Self::Str(b)) => Ok(a.cmp(b)),
            (Self::List(a), Self::List(b)) => {
                for (x, y) in a.iter().zip(b) {
                    let ordering = x.compare(y)?;
                    if ordering != Ordering::Equal {
                        return Ok(ordering);
                    }
                }
                Ok(a.len().cmp(&b.len()))
            }
            (a, b) => match (a.as_int(), b.as_int()) {
                (Some(x), Some(y)) => Ok(x.cmp(&y)),
                _ => match (a.as_f64(), b.as_f64()) {
                    (Some(x), Some(y)) => Ok(x.partial_cmp(&y).unwrap_or(Ordering::Equal)),
                    _ => Err(RuntimeError::type_error(format!(
                        "'<' not supported between instances of '{}' and '{}'",
                        a.type_name(),
                        b.type_name()
                    ))),
                },
            },
        }
    }

    /// Materializes an iterable into its items.
    pub(crate) fn iterate(&self) -> Result<Vec<Self>, RuntimeError> {
        match self {
            Self::List(items) => Ok(items.clone()),
            Self::Str(s) => Ok(s.chars().map(|c| Self::Str(c.to_string())).collect()),
            Self::Dict(dict) => Ok(dict.keys()),
            other => Err(RuntimeError::type_error(format!(
                "'{}' object is not iterable",
                other.type_name()
            ))),
        }
    }

    pub(crate) fn len(&self) -> Result<usize, RuntimeError> {
        match self {
            Self::Str(s) => Ok(s.chars().count()),
            Self::List(items) => Ok(items.len()),
            Self::Dict(dict) => Ok(dict.len()),
            other => Err(RuntimeError::type_error(format!(
                "object of type '{}' has no len()",
                other.type_name()
            ))),
        }
    }

    /// `self[key]`.
    pub(crate) fn get_item(&self, key: &Self) -> Result<Self, RuntimeError> {
        match self {
            Self::List(items) => {
                let index = normalize_index(key, items.len(), "list")?;
                Ok(items[index].clone())
            }
            Self::Str(s) => {
                let chars: Vec<char> = s.chars().collect();
                let index = normalize_index(key, chars.len(), "string")?;
                Ok(Self::Str(chars[index].to_string()))
            }
            Self::Dict(dict) => dict
                .get(key)
                .cloned()
                .ok_or_else(|| RuntimeError::key_error(key)),
            other => Err(RuntimeError::type_error(format!(
                "'{}' object is not subscriptable",
                other.type_name()
            ))),
        }
    }

    /// Shared access to `self[key]` for containers.
    pub(crate) fn item_ref(&self, key: &Self) -> Result<&Self, RuntimeError> {
        match self {
            Self::List(items) => {
                let index = normalize_index(key, items.len(), "list")?;
                Ok(&items[index])
            }
            Self::Dict(dict) => dict.get(key).ok_or_else(|| RuntimeError::key_error(key)),
            other => Err(RuntimeError::type_error(format!(
                "'{}' object is not subscriptable",
                other.type_name()
            ))),
        }
    }

    /// Mutable access to `self[key]` for nested assignment.
    pub(crate) fn item_mut(&mut self, key: &Self) -> Result<&mut Self, RuntimeError> {
        match self {
            Self::List(items) => {
                let index = normalize_index(key, items.len(), "list")?;
                Ok(&mut items[index])
            }
            Self::Dict(dict) => dict
                .get_mut(key)
                .ok_or_else(|| RuntimeError::key_error(key)),
            other => Err(RuntimeError::type_error(format!(
                "'{}' object is not subscriptable",
                other.type_name()
            ))),
        }
    }

    /// `self[key] = value`.
    pub(crate) fn set_item(&mut self, key: Self, value: Self) -> Result<(), RuntimeError> {
        match self {
            Self::List(items) => {
                let index = normalize_index(&key, items.len(), "list assignment")?;
                items[index] = value;
                Ok(())
            }
            Self::Dict(dict) => dict.insert(key, value),
            other => Err(RuntimeError::type_error(format!(
                "'{}' object does not support item assignment",
                other.type_name()
            ))),
        }
    }

    /// `self[lower:upper:step]`.
    pub(crate) fn slice(
        &self,
        lower: Option<i64>,
        upper: Option<i64>,
        step: Option<i64>,
    ) -> Result<Self, RuntimeError> {
        let step = step.unwrap_or(1);
        if step == 0 {
            return Err(RuntimeError::value_error("slice step cannot be zero"));
        }
        match self {
            Self::List(items) => Ok(Self::List(
                slice_indices(items.len(), lower, upper, step)
                    .into_iter()
                    .map(|index| items[index].clone())
                    .collect(),
            )),
            Self::Str(s) => {
                let chars: Vec<char> = s.chars().collect();
                Ok(Self::Str(
                    slice_indices(chars.len(), lower, upper, step)
                        .into_iter()
                        .map(|index| chars[index])
                        .collect(),
                ))
            }
            other => Err(RuntimeError::type_error(format!(
                "'{}' object is not subscriptable",
                other.type_name()
            ))),
        }
    }

    /// `x in self`.
    pub(crate) fn contains(&self, needle: &Self) -> Result<bool, RuntimeError> {
        match self {
            Self::List(items) => Ok(items.iter().any(|item| item.py_eq(needle))),
            Self::Dict(dict) => Ok(dict.contains(needle)),
            Self::Str(haystack) => match needle {
                Self::Str(needle) => Ok(haystack.contains(needle.as_str())),
                other => Err(RuntimeError::type_error(format!(
                    "'in <string>' requires string as left operand, not {}",
                    other.type_name()
                ))),
            },
            other => Err(RuntimeError::type_error(format!(
                "argument of type '{}' is not iterable",
                other.type_name()
            ))),
        }
    }
}

#[allow(clippy::cast_precision_loss)]
pub(crate) const fn widen(value: i64) -> f64 {
    value as f64
}

fn normalize_index(key: &Value, len: usize, what: &str) -> Result<usize, RuntimeError> {
    let Some(index) = key.as_int() else {
        return Err(RuntimeError::type_error(format!(
            "{what} indices must be integers, not '{}'",
            key.type_name()
        )));
    };
    let len = i64::try_from(len).unwrap_or(i64::MAX);
    let resolved = if index < 0 { index + len } else { index };
    if (0..len).contains(&resolved) {
        usize::try_from(resolved).map_err(|_| RuntimeError::index_error(format!("{what} index out of range")))
    } else {
        Err(RuntimeError::index_error(format!("{what} index out of range")))
    }
}

/// Positions selected by a slice, following Python's clamping rules.
fn slice_indices(len: usize, lower: Option<i64>, upper: Option<i64>, step: i64) -> Vec<usize> {
    let len = i64::try_from(len).unwrap_or(i64::MAX);
    let clamp = |bound: i64, low: i64, high: i64| {
        let bound = if bound < 0 { bound + len } else { bound };
        bound.clamp(low, high)
    };

    let mut indices = Vec::new();
    if step > 0 {
        let start = lower.map_or(0, |b| clamp(b, 0, len));
        let stop = upper.map_or(len, |b| clamp(b, 0, len));
        let mut i = start;
        while i < stop {
            indices.extend(usize::try_from(i).ok());
            i += step;
        }
    } else {
        let start = lower.map_or(len - 1, |b| clamp(b, -1, len - 1));
        let stop = upper.map_or(-1, |b| clamp(b, -1, len - 1));
        let mut i = start;
        while i > stop {
            indices.extend(usize::try_from(i).ok());
            i += step;
        }
    }
    indices
}

fn unsupported(op: &str, left: &Value, right: &Value) -> RuntimeError {
    RuntimeError::type_error(format!(
        "unsupported operand type(s) for {op}: '{}' and '{}'",
        left.type_name(),
        right.type_name()
    ))
}

fn repeat<T: Clone>(items: &[T], times: i64) -> Result<Vec<T>, RuntimeError> {
    let times = usize::try_from(times.max(0)).unwrap_or(0);
    if items.is_empty() {
        return Ok(Vec::new());
    }
    if items.len().saturating_mul(times) > MAX_SEQUENCE_LEN {
        return Err(RuntimeError::new("MemoryError", "sequence repetition is too large"));
    }
    let mut repeated = Vec::with_capacity(items.len() * times);
    for _ in 0..times {
        repeated.extend_from_slice(items);
    }
    Ok(repeated)
}

/// Applies an arithmetic operator.
pub(crate) fn binary(op: BinOp, left: &Value, right: &Value) -> Result<Value, RuntimeError> {
    let symbol = op.symbol();
    match (op, left, right) {
        (BinOp::Add, Value::Str(a), Value::Str(b)) => return Ok(Value::Str(format!("{a}{b}"))),
        (BinOp::Add, Value::List(a), Value::List(b)) => {
            return Ok(Value::List(a.iter().chain(b).cloned().collect()));
        }
        (BinOp::Mul, Value::Str(s), n) | (BinOp::Mul, n, Value::Str(s)) if n.as_int().is_some() => {
            let chars: Vec<char> = s.chars().collect();
            let times = n.as_int().unwrap_or(0);
            return Ok(Value::Str(repeat(&chars, times)?.into_iter().collect()));
        }
        (BinOp::Mul, Value::List(items), n) | (BinOp::Mul, n, Value::List(items))
            if n.as_int().is_some() =>
        {
            return Ok(Value::List(repeat(items, n.as_int().unwrap_or(0))?));
        }
        (BinOp::Mod, Value::Str(template), args) => {
            return percent_format(template, args).map(Value::Str);
        }
        _ => {}
    }

    if let (Some(a), Some(b)) = (left.as_int(), right.as_int()) {
        return int_binary(op, a, b);
    }
    let (Some(a), Some(b)) = (left.as_f64(), right.as_f64()) else {
        return Err(unsupported(symbol, left, right));
    };
    float_binary(op, a, b)
}

fn int_binary(op: BinOp, a: i64, b: i64) -> Result<Value, RuntimeError> {
    let checked = |result: Option<i64>| result.map(Value::Int).ok_or_else(RuntimeError::overflow);
    match op {
        BinOp::Add => checked(a.checked_add(b)),
        BinOp::Sub => checked(a.checked_sub(b)),
        BinOp::Mul => checked(a.checked_mul(b)),
        BinOp::Div => float_binary(op, widen(a), widen(b)),
        BinOp::FloorDiv | BinOp::Mod if b == 0 => Err(RuntimeError::zero_division(
            "integer division or modulo by zero",
        )),
        BinOp::FloorDiv => {
            let quotient = a.checked_div(b).ok_or_else(RuntimeError::overflow)?;
            let adjust = a % b != 0 && ((a < 0) != (b < 0));
            Ok(Value::Int(if adjust { quotient - 1 } else { quotient }))
        }
        BinOp::Mod => {
            let remainder = a.checked_rem(b).ok_or_else(RuntimeError::overflow)?;
            let adjust = remainder != 0 && ((remainder < 0) != (b < 0));
            Ok(Value::Int(if adjust { remainder + b } else { remainder }))
        }
        BinOp::Pow => {
            if b < 0 {
                return float_binary(op, widen(a), widen(b));
            }
            let exponent = u32::try_from(b).map_err(|_| RuntimeError::overflow())?;
            checked(a.checked_pow(exponent))
        }
    }
}

fn float_binary(op: BinOp, a: f64, b: f64) -> Result<Value, RuntimeError> {
    let value = match op {
        BinOp::Add => a + b,
        BinOp::Sub => a - b,
        BinOp::Mul => a * b,
        BinOp::Div if b == 0.0 => return Err(RuntimeError::zero_division("division by zero")),
        BinOp::Div => a / b,
        BinOp::FloorDiv | BinOp::Mod if b == 0.0 => {
            return Err(RuntimeError::zero_division("float modulo"));
        }
        BinOp::FloorDiv => (a / b).floor(),
        BinOp::Mod => {
            let remainder = a % b;
            if remainder != 0.0 && ((remainder < 0.0) != (b < 0.0)) {
                remainder + b
            } else {
                remainder
            }
        }
        BinOp::Pow if a == 0.0 && b < 0.0 => {
            return Err(RuntimeError::zero_division(
                "0.0 cannot be raised to a negative power",
            ));
        }
        BinOp::Pow => a.powf(b),
    };
    Ok(Value::Float(value))
}

/// Applies a comparison operator.
pub(crate) fn compare(op: CmpOp, left: &Value, right: &Value) -> Result<bool, RuntimeError> {
    Ok(match op {
        CmpOp::Eq => left.py_eq(right),
        CmpOp::NotEq => !left.py_eq(right),
        CmpOp::Lt => left.compare(right)? == Ordering::Less,
        CmpOp::LtE => left.compare(right)? != Ordering::Greater,
        CmpOp::Gt => left.compare(right)? == Ordering::Greater,
        CmpOp::GtE => left.compare(right)? != Ordering::Less,
        CmpOp::In => right.contains(left)?,
        CmpOp::NotIn => !right.contains(left)?,
        CmpOp::Is => identical(left, right),
        CmpOp::IsNot => !identical(left, right),
    })
}

fn identical(left: &Value, right: &Value) -> bool {
    match (left, right) {
        (Value::None, Value::None) => true,
        (Value::Bool(a), Value::Bool(b)) => a == b,
        (Value::Int(a), Value::Int(b)) => a == b,
        (Value::Str(a), Value::Str(b)) => a == b,
        (Value::Module(a), Value::Module(b)) => a == b,
        (Value::Builtin(a), Value::Builtin(b)) => a == b,
        (Value::Function(a), Value::Function(b)) => Arc::ptr_eq(a, b),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn list(items: &[i64]) -> Value {
        Value::List(items.iter().copied().map(Value::Int).collect())
    }

    #[test]
    fn python_division_semantics() {
        let div = |op, a, b| binary(op, &Value::Int(a), &Value::Int(b)).unwrap().repr();
        assert_eq!(div(BinOp::FloorDiv, -7, 2), "-4");
        assert_eq!(div(BinOp::FloorDiv, 7, -2), "-4");
        assert_eq!(div(BinOp::Mod, -7, 3), "2");
        assert_eq!(div(BinOp::Mod, 7, -3), "-2");
        assert_eq!(div(BinOp::Div, 7, 2), "3.5");
        assert_eq!(div(BinOp::Pow, 2, -1), "0.5");
        let err = binary(BinOp::Div, &Value::Int(1), &Value::Int(0)).unwrap_err();
        assert_eq!(err.kind, "ZeroDivisionError");
    }

    #[test]
    fn overflow_is_reported() {
        let err = binary(BinOp::Pow, &Value::Int(10), &Value::Int(40)).unwrap_err();
        assert_eq!(err.kind, "OverflowError");
    }

    #[test]
    fn slices_follow_python_rules() {
        let items = list(&[0, 1, 2, 3, 4]);
        assert_eq!(items.slice(Some(1), Some(-1), None).unwrap().repr(), "[1, 2, 3]");
        assert_eq!(items.slice(None, None, Some(-1)).unwrap().repr(), "[4, 3, 2, 1, 0]");
        assert_eq!(items.slice(Some(-2), None, None).unwrap().repr(), "[3, 4]");
        assert_eq!(items.slice(None, None, Some(2)).unwrap().repr(), "[0, 2, 4]");
        assert_eq!(
            Value::Str("hello".into()).slice(Some(1), Some(3), None).unwrap().repr(),
            "'el'"
        );
    }

    #[test]
    fn mixed_numeric_equality_and_ordering() {
        assert!(Value::Int(1).py_eq(&Value::Float(1.0)));
        assert!(Value::Bool(true).py_eq(&Value::Int(1)));
        assert!(compare(CmpOp::Lt, &Value::Int(1), &Value::Float(1.5)).unwrap());
        assert!(compare(CmpOp::Lt, &Value::Int(1), &Value::Str("a".into())).is_err());
    }

    #[test]
    fn json_conversion_preserves_structure() {
        let json = json!({"a": [1, 2.5, "x", null, true]});
        let value = Value::from_json(&json);
        assert_eq!(value.to_json(), Some(json));
        assert_eq!(Value::Module(Module::Math).to_json(), None);
    }

    #[test]
    fn sequences_repeat_by_count() {
        let doubled = binary(BinOp::Mul, &list(&[1, 2]), &Value::Int(2)).unwrap();
        assert_eq!(doubled.repr(), "[1, 2, 1, 2]");
        let nested = Value::List(vec![list(&[0])]);
        assert_eq!(binary(BinOp::Mul, &nested, &Value::Int(3)).unwrap().repr(), "[[0], [0], [0]]");
        let text = binary(BinOp::Mul, &Value::Str("ab".into()), &Value::Int(3)).unwrap();
        assert_eq!(text.repr(), "'ababab'");
        assert_eq!(binary(BinOp::Mul, &list(&[1]), &Value::Int(-1)).unwrap().repr(), "[]");
        let err = binary(BinOp::Mul, &list(&[1]), &Value::Int(i64::MAX)).unwrap_err();
        assert_eq!(err.kind, "MemoryError");
        let empty = binary(BinOp::Mul, &list(&[]), &Value::Int(i64::MAX)).unwrap();
        assert_eq!(empty.repr(), "[]");
    }

    #[test]
    fn negative_indexing() {
        let items = list(&[1, 2, 3]);
        assert_eq!(items.get_item(&Value::Int(-1)).unwrap().repr(), "3");
        let err = items.get_item(&Value::Int(3)).unwrap_err();
        assert_eq!(err.kind, "IndexError");
    }
}
