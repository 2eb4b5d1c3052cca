//! Builtin functions that need no access to the interpreter.
//!
//! Builtins that call back into user code (`print`, `sorted` with a key,
//! `map`, `filter` and friends) live in the interpreter and use the
//! helpers exported here.

use std::cmp::Ordering;

use super::error::RuntimeError;
use super::format::format_spec;
use super::modules::float_to_int;
use super::ast::BinOp;
use super::value::{Dict, MAX_SEQUENCE_LEN, TYPE_NAMES, Value, binary};

/// Every builtin name visible to code.
pub(crate) const BUILTINS: &[&str] = &[
    "abs", "all", "any", "bin", "bool", "chr", "dict", "divmod", "enumerate", "filter",
    "final_answer", "float", "hex", "int", "isinstance", "len", "list", "map", "max", "min",
    "oct", "ord", "pow", "print", "range", "repr", "reversed", "round", "set", "sorted", "str",
    "sum", "tuple", "type", "zip",
];

/// Looks up a builtin by name.
pub(crate) fn lookup(name: &str) -> Option<Value> {
    BUILTINS
        .iter()
        .find(|builtin| **builtin == name)
        .map(|builtin| Value::Builtin(*builtin))
}

/// Evaluated call arguments.
#[derive(Debug, Default)]
pub(crate) struct Args {
    positional: Vec<Value>,
    keywords: Vec<(String, Value)>,
}

impl Args {
    pub(crate) fn new(positional: Vec<Value>, keywords: Vec<(String, Value)>) -> Self {
        Self {
            positional,
            keywords,
        }
    }

    /// Removes and returns a keyword argument.
    pub(crate) fn keyword(&mut self, name: &str) -> Option<Value> {
        let index = self.keywords.iter().position(|(key, _)| key == name)?;
        Some(self.keywords.remove(index).1)
    }

    pub(crate) fn into_parts(self) -> (Vec<Value>, Vec<(String, Value)>) {
        (self.positional, self.keywords)
    }

    /// Returns the positional arguments after checking their count and that
    /// no unexpected keyword remains.
    pub(crate) fn finish(
        self,
        function: &str,
        min: usize,
        max: usize,
    ) -> Result<Vec<Value>, RuntimeError> {
        if let Some((key, _)) = self.keywords.first() {
            return Err(RuntimeError::type_error(format!(
                "{function}() got an unexpected keyword argument '{key}'"
            )));
        }
        let given = self.positional.len();
        if given < min || given > max {
            let expected = if min == max {
                format!("exactly {min}")
            } else if given < min {
                format!("at least {min}")
            } else {
                format!("at most {max}")
            };
            let plural = if min == max && min == 1 { "" } else { "s" };
            return Err(RuntimeError::type_error(format!(
                "{function}() takes {expected} argument{plural} ({given} given)"
            )));
        }
        Ok(self.positional)
    }

    /// Exactly `N` positional arguments.
    pub(crate) fn exact<const N: usize>(self, function: &str) -> Result<[Value; N], RuntimeError> {
        let values = self.finish(function, N, N)?;
        <[Value; N]>::try_from(values)
            .map_err(|_| RuntimeError::type_error(format!("{function}() takes {N} arguments")))
    }
}

/// Sorts `items`, ordering by the precomputed `keys` when given.
pub(crate) fn sort_values(
    items: Vec<Value>,
    keys: Option<Vec<Value>>,
    reverse: bool,
) -> Result<Vec<Value>, RuntimeError> {
    let keys = keys.unwrap_or_else(|| items.clone());
    let mut pairs: Vec<(Value, Value)> = keys.into_iter().zip(items).collect();
    let mut failure = None;
    pairs.sort_by(|(a, _), (b, _)| {
        let ordering = a.compare(b).unwrap_or_else(|err| {
            failure.get_or_insert(err);
            Ordering::Equal
        });
        if reverse { ordering.reverse() } else { ordering }
    });
    match failure {
        Some(err) => Err(err),
        None => Ok(pairs.into_iter().map(|(_, item)| item).collect()),
    }
}

/// Picks the minimum (`Ordering::Less`) or maximum (`Ordering::Greater`)
/// item, keeping the first one on ties.
pub(crate) fn extreme(
    function: &str,
    items: Vec<Value>,
    keys: Option<Vec<Value>>,
    want: Ordering,
    default: Option<Value>,
) -> Result<Value, RuntimeError> {
    let keys = keys.unwrap_or_else(|| items.clone());
    let mut best: Option<(Value, Value)> = None;
    for (key, item) in keys.into_iter().zip(items) {
        let replace = match &best {
            None => true,
            Some((best_key, _)) => key.compare(best_key)? == want,
        };
        if replace {
            best = Some((key, item));
        }
    }
    match (best, default) {
        (Some((_, item)), _) => Ok(item),
        (None, Some(default)) => Ok(default),
        (None, None) => Err(RuntimeError::value_error(format!(
            "{function}() arg is an empty sequence"
        ))),
    }
}

/// Splits `min`/`max` arguments into the candidate items.
pub(crate) fn candidates(function: &str, positional: Vec<Value>) -> Result<Vec<Value>, RuntimeError> {
    match positional.len() {
        0 => Err(RuntimeError::type_error(format!(
            "{function} expected at least 1 argument, got 0"
        ))),
        1 => positional[0].iterate(),
        _ => Ok(positional),
    }
}

fn parse_int(text: &str, base: u32) -> Result<i64, RuntimeError> {
    let invalid = || {
        RuntimeError::value_error(format!(
            "invalid literal for int() with base {base}: {}",
            Value::Str(text.to_owned()).repr()
        ))
    };
    let trimmed = text.trim().replace('_', "");
    let (negative, digits) = match trimmed.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, trimmed.strip_prefix('+').unwrap_or(&trimmed)),
    };
    let digits = match base {
        16 => digits.strip_prefix("0x").or_else(|| digits.strip_prefix("0X")).unwrap_or(digits),
        8 => digits.strip_prefix("0o").or_else(|| digits.strip_prefix("0O")).unwrap_or(digits),
        2 => digits.strip_prefix("0b").or_else(|| digits.strip_prefix("0B")).unwrap_or(digits),
        _ => digits,
    };
    if digits.is_empty() {
        return Err(invalid());
    }
    let magnitude = i64::from_str_radix(digits, base).map_err(|_| invalid())?;
    Ok(if negative { -magnitude } else { magnitude })
}

fn to_int(value: &Value, base: Option<i64>) -> Result<Value, RuntimeError> {
    match (value, base) {
        (Value::Str(text), base) => {
            let base = u32::try_from(base.unwrap_or(10))
                .ok()
                .filter(|base| (2..=36).contains(base))
                .ok_or_else(|| RuntimeError::value_error("int() base must be >= 2 and <= 36"))?;
            parse_int(text, base).map(Value::Int)
        }
        (_, Some(_)) => Err(RuntimeError::type_error(
            "int() can't convert non-string with explicit base",
        )),
        (Value::Float(f), None) => float_to_int(f.trunc()).map(Value::Int),
        (other, None) => other.as_int().map(Value::Int).ok_or_else(|| {
            RuntimeError::type_error(format!(
                "int() argument must be a string or a number, not '{}'",
                other.type_name()
            ))
        }),
    }
}

fn to_float(value: &Value) -> Result<Value, RuntimeError> {
    match value {
        Value::Str(text) => {
            let trimmed = text.trim().replace('_', "");
            trimmed.parse::<f64>().map(Value::Float).map_err(|_| {
                RuntimeError::value_error(format!(
                    "could not convert string to float: {}",
                    value.repr()
                ))
            })
        }
        other => other.as_f64().map(Value::Float).ok_or_else(|| {
            RuntimeError::type_error(format!(
                "float() argument must be a string or a number, not '{}'",
                other.type_name()
            ))
        }),
    }
}

fn round(value: &Value, digits: Option<i64>) -> Result<Value, RuntimeError> {
    match (value, digits) {
        (Value::Float(f), None) => float_to_int(f.round_ties_even()).map(Value::Int),
        (Value::Float(f), Some(digits)) => {
            let exponent = i32::try_from(digits.clamp(-300, 300)).unwrap_or(0);
            let scale = 10_f64.powi(exponent);
            Ok(Value::Float((f * scale).round_ties_even() / scale))
        }
        (other, _) => other.as_int().map(Value::Int).ok_or_else(|| {
            RuntimeError::type_error(format!(
                "type {} doesn't define __round__ method",
                other.type_name()
            ))
        }),
    }
}

fn range(values: &[Value]) -> Result<Value, RuntimeError> {
    let ints = values
        .iter()
        .map(|value| value.expect_int("range() argument"))
        .collect::<Result<Vec<i64>, _>>()?;
    let (start, stop, step) = match ints.as_slice() {
        [stop] => (0, *stop, 1),
        [start, stop] => (*start, *stop, 1),
        [start, stop, step] => (*start, *stop, *step),
        _ => return Err(RuntimeError::type_error("range expected 1 to 3 arguments")),
    };
    if step == 0 {
        return Err(RuntimeError::value_error("range() arg 3 must not be zero"));
    }
    let span = if step > 0 {
        stop.saturating_sub(start)
    } else {
        start.saturating_sub(stop)
    };
    let count = if span <= 0 {
        0
    } else {
        (span - 1) / step.saturating_abs() + 1
    };
    if usize::try_from(count).ok().is_none_or(|count| count > MAX_SEQUENCE_LEN) {
        return Err(RuntimeError::new("MemoryError", "range() is too large"));
    }
    let mut items = Vec::new();
    let mut current = start;
    for _ in 0..count {
        items.push(Value::Int(current));
        current = current.saturating_add(step);
    }
    Ok(Value::List(items))
}

fn dedup(items: Vec<Value>) -> Vec<Value> {
    let mut unique: Vec<Value> = Vec::with_capacity(items.len());
    for item in items {
        if !unique.iter().any(|seen| seen.py_eq(&item)) {
            unique.push(item);
        }
    }
    unique
}

fn dict_from(positional: &[Value], keywords: Vec<(String, Value)>) -> Result<Value, RuntimeError> {
    let mut dict = Dict::default();
    match positional.first() {
        Some(Value::Dict(source)) => {
            for (key, value) in source.iter() {
                dict.insert(key.clone(), value.clone())?;
            }
        }
        Some(iterable) => {
            for pair in iterable.iterate()? {
                match pair.iterate()?.as_slice() {
                    [key, value] => dict.insert(key.clone(), value.clone())?,
                    _ => {
                        return Err(RuntimeError::value_error(
                            "dictionary update sequence element has wrong length",
                        ));
                    }
                }
            }
        }
        None => {}
    }
    for (key, value) in keywords {
        dict.insert(Value::Str(key), value)?;
    }
    Ok(Value::Dict(dict))
}

fn type_matches(value: &Value, class: &Value) -> Result<bool, RuntimeError> {
    match class {
        Value::Builtin(name) if TYPE_NAMES.contains(name) => Ok(match *name {
            "int" => matches!(value, Value::Int(_) | Value::Bool(_)),
            "tuple" | "set" | "list" => matches!(value, Value::List(_)),
            other => value.type_name() == other,
        }),
        Value::List(classes) => {
            for class in classes {
                if type_matches(value, class)? {
                    return Ok(true);
                }
            }
            Ok(false)
        }
        other => Err(RuntimeError::type_error(format!(
            "isinstance() arg 2 must be a type or tuple of types, not {}",
            other.type_name()
        ))),
    }
}

fn type_of(value: &Value) -> Value {
    let name = value.type_name();
    TYPE_NAMES
        .iter()
        .find(|type_name| **type_name == name)
        .map_or_else(|| Value::Str(format!("<class '{name}'>")), |type_name| Value::Builtin(*type_name))
}

fn radix(value: &Value, function: &str, prefix: &str, spec: &str) -> Result<Value, RuntimeError> {
    let int = value.expect_int(&format!("{function}() argument"))?;
    let digits = format_spec(&Value::Int(int.saturating_abs()), spec)?;
    let sign = if int < 0 { "-" } else { "" };
    Ok(Value::Str(format!("{sign}{prefix}{digits}")))
}

/// Calls a builtin that does not re-enter the interpreter.
pub(crate) fn call_pure(name: &str, mut args: Args) -> Result<Value, RuntimeError> {
    match name {
        "len" => {
            let [value] = args.exact::<1>("len")?;
            let len = value.len()?;
            Ok(Value::Int(i64::try_from(len).unwrap_or(i64::MAX)))
        }
        "str" => {
            let values = args.finish("str", 0, 1)?;
            Ok(Value::Str(values.first().map(Value::to_str).unwrap_or_default()))
        }
        "repr" => {
            let [value] = args.exact::<1>("repr")?;
            Ok(Value::Str(value.repr()))
        }
        "bool" => {
            let values = args.finish("bool", 0, 1)?;
            Ok(Value::Bool(values.first().is_some_and(Value::truthy)))
        }
        "int" => {
            let base = args.keyword("base");
            let mut values = args.finish("int", 0, 2)?;
            if values.is_empty() {
                return Ok(Value::Int(0));
            }
            let base = match values.get(1).cloned().or(base) {
                Some(base) => Some(base.expect_int("int() base")?),
                None => None,
            };
            to_int(&values.swap_remove(0), base)
        }
        "float" => {
            let values = args.finish("float", 0, 1)?;
            values.first().map_or(Ok(Value::Float(0.0)), to_float)
        }
        "round" => {
            let digits = args.keyword("ndigits");
            let values = args.finish("round", 1, 2)?;
            let digits = match values.get(1).cloned().or(digits) {
                Some(Value::None) | None => None,
                Some(digits) => Some(digits.expect_int("ndigits")?),
            };
            round(&values[0], digits)
        }
        "abs" => {
            let [value] = args.exact::<1>("abs")?;
            match value {
                Value::Float(f) => Ok(Value::Float(f.abs())),
                other => {
                    let int = other.expect_int("abs() argument")?;
                    int.checked_abs().map(Value::Int).ok_or_else(RuntimeError::overflow)
                }
            }
        }
        "sum" => {
            let start = args.keyword("start");
            let values = args.finish("sum", 1, 2)?;
            let mut total = values.get(1).cloned().or(start).unwrap_or(Value::Int(0));
            for item in values[0].iterate()? {
                total = binary(BinOp::Add, &total, &item)?;
            }
            Ok(total)
        }
        "min" | "max" => {
            let default = args.keyword("default");
            let values = args.finish(name, 1, usize::MAX)?;
            let want = if name == "min" { Ordering::Less } else { Ordering::Greater };
            extreme(name, candidates(name, values)?, None, want, default)
        }
        "sorted" => {
            let reverse = args.keyword("reverse").is_some_and(|value| value.truthy());
            let [iterable] = args.exact::<1>("sorted")?;
            sort_values(iterable.iterate()?, None, reverse).map(Value::List)
        }
        "range" => {
            let values = args.finish("range", 1, 3)?;
            range(&values)
        }
        "reversed" => {
            let [iterable] = args.exact::<1>("reversed")?;
            let mut items = iterable.iterate()?;
            items.reverse();
            Ok(Value::List(items))
        }
        "list" | "tuple" => {
            let values = args.finish(name, 0, 1)?;
            match values.first() {
                Some(iterable) => iterable.iterate().map(Value::List),
                None => Ok(Value::List(Vec::new())),
            }
        }
        "set" => {
            let values = args.finish("set", 0, 1)?;
            match values.first() {
                Some(iterable) => Ok(Value::List(dedup(iterable.iterate()?))),
                None => Ok(Value::List(Vec::new())),
            }
        }
        "dict" => {
            let (positional, keywords) = args.into_parts();
            if positional.len() > 1 {
                return Err(RuntimeError::type_error(format!(
                    "dict expected at most 1 argument, got {}",
                    positional.len()
                )));
            }
            dict_from(&positional, keywords)
        }
        "type" => {
            let [value] = args.exact::<1>("type")?;
            Ok(type_of(&value))
        }
        "isinstance" => {
            let [value, class] = args.exact::<2>("isinstance")?;
            type_matches(&value, &class).map(Value::Bool)
        }
        "enumerate" => {
            let start = args.keyword("start");
            let values = args.finish("enumerate", 1, 2)?;
            let start = match values.get(1).cloned().or(start) {
                Some(start) => start.expect_int("enumerate() start")?,
                None => 0,
            };
            Ok(Value::List(
                values[0]
                    .iterate()?
                    .into_iter()
                    .zip(start..)
                    .map(|(item, index)| Value::List(vec![Value::Int(index), item]))
                    .collect(),
            ))
        }
        "zip" => {
            let values = args.finish("zip", 0, usize::MAX)?;
            let columns = values
                .iter()
                .map(Value::iterate)
                .collect::<Result<Vec<_>, _>>()?;
            let rows = columns.iter().map(Vec::len).min().unwrap_or(0);
            Ok(Value::List(
                (0..rows)
                    .map(|row| Value::List(columns.iter().map(|column| column[row].clone()).collect()))
                    .collect(),
            ))
        }
        "any" => {
            let [iterable] = args.exact::<1>("any")?;
            Ok(Value::Bool(iterable.iterate()?.iter().any(Value::truthy)))
        }
        "all" => {
            let [iterable] = args.exact::<1>("all")?;
            Ok(Value::Bool(iterable.iterate()?.iter().all(Value::truthy)))
        }
        "pow" => {
            let values = args.finish("pow", 2, 3)?;
            match values.get(2) {
                Some(modulus) => {
                    let base = values[0].expect_int("pow() base")?;
                    let exponent = values[1].expect_int("pow() exponent")?;
                    let modulus = modulus.expect_int("pow() modulus")?;
                    modular_pow(base, exponent, modulus)
                }
                None => binary(BinOp::Pow, &values[0], &values[1]),
            }
        }
        "divmod" => {
            let [a, b] = args.exact::<2>("divmod")?;
            Ok(Value::List(vec![
                binary(BinOp::FloorDiv, &a, &b)?,
                binary(BinOp::Mod, &a, &b)?,
            ]))
        }
        "chr" => {
            let [code] = args.exact::<1>("chr")?;
            let code = code.expect_int("chr() argument")?;
            u32::try_from(code)
                .ok()
                .and_then(char::from_u32)
                .map(|c| Value::Str(c.to_string()))
                .ok_or_else(|| RuntimeError::value_error("chr() arg not in range(0x110000)"))
        }
        "ord" => {
            let [text] = args.exact::<1>("ord")?;
            let text = text.expect_str("ord() argument")?;
            let mut chars = text.chars();
            match (chars.next(), chars.next()) {
                (Some(c), None) => Ok(Value::Int(i64::from(u32::from(c)))),
                _ => Err(RuntimeError::type_error(format!(
                    "ord() expected a character, but string of length {} found",
                    text.chars().count()
                ))),
            }
        }
        "hex" => radix(&args.exact::<1>("hex")?[0], "hex", "0x", "x"),
        "oct" => radix(&args.exact::<1>("oct")?[0], "oct", "0o", "o"),
        "bin" => radix(&args.exact::<1>("bin")?[0], "bin", "0b", "b"),
        other => Err(RuntimeError::name_error(other)),
    }
}

fn modular_pow(base: i64, exponent: i64, modulus: i64) -> Result<Value, RuntimeError> {
    if modulus == 0 {
        return Err(RuntimeError::value_error("pow() 3rd argument cannot be 0"));
    }
    if exponent < 0 {
        return Err(RuntimeError::value_error(
            "pow() 2nd argument cannot be negative when 3rd argument specified",
        ));
    }
    let modulus = i128::from(modulus);
    let mut result: i128 = 1;
    let mut base = i128::from(base).rem_euclid(modulus);
    let mut exponent = exponent;
    while exponent > 0 {
        if exponent & 1 == 1 {
            result = result * base % modulus;
        }
        base = base * base % modulus;
        exponent >>= 1;
    }
    let result = result.rem_euclid(modulus);
    let result = if modulus < 0 && result != 0 { result + modulus } else { result };
    i64::try_from(result).map(Value::Int).map_err(|_| RuntimeError::overflow())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn call(name: &str, positional: Vec<Value>) -> Result<Value, RuntimeError> {
        call_pure(name, Args::new(positional, Vec::new()))
    }

    fn ints(values: &[i64]) -> Value {
        Value::List(values.iter().copied().map(Value::Int).collect())
    }

    #[test]
    fn conversions() {
        assert_eq!(call("int", vec![Value::Str(" 42 ".into())]).unwrap().repr(), "42");
        assert_eq!(call("int", vec![Value::Float(-2.7)]).unwrap().repr(), "-2");
        assert_eq!(
            call("int", vec![Value::Str("ff".into()), Value::Int(16)]).unwrap().repr(),
            "255"
        );
        assert_eq!(call("float", vec![Value::Str("1e3".into())]).unwrap().repr(), "1000.0");
        let err = call("int", vec![Value::Str("abc".into())]).unwrap_err();
        assert_eq!(
            err.to_string(),
            "ValueError: invalid literal for int() with base 10: 'abc'"
        );
    }

    #[test]
    fn rounding_uses_bankers_rule() {
        assert_eq!(call("round", vec![Value::Float(2.5)]).unwrap().repr(), "2");
        assert_eq!(call("round", vec![Value::Float(3.5)]).unwrap().repr(), "4");
        assert_eq!(
            call("round", vec![Value::Float(3.14159), Value::Int(2)]).unwrap().repr(),
            "3.14"
        );
    }

    #[test]
    fn ranges_and_sequences() {
        assert_eq!(call("range", vec![Value::Int(3)]).unwrap().repr(), "[0, 1, 2]");
        assert_eq!(
            call("range", vec![Value::Int(5), Value::Int(0), Value::Int(-2)]).unwrap().repr(),
            "[5, 3, 1]"
        );
        assert_eq!(call("sum", vec![ints(&[1, 2, 3])]).unwrap().repr(), "6");
        assert_eq!(call("max", vec![Value::Int(3), Value::Int(9), Value::Int(4)]).unwrap().repr(), "9");
        assert_eq!(call("sorted", vec![ints(&[3, 1, 2])]).unwrap().repr(), "[1, 2, 3]");
        assert_eq!(
            call("zip", vec![ints(&[1, 2, 3]), ints(&[4, 5])]).unwrap().repr(),
            "[[1, 4], [2, 5]]"
        );
        assert_eq!(call("set", vec![ints(&[1, 1, 2])]).unwrap().repr(), "[1, 2]");
        let err = call("min", vec![Value::List(Vec::new())]).unwrap_err();
        assert_eq!(err.kind, "ValueError");
    }

    #[test]
    fn types_and_instances() {
        assert_eq!(call("type", vec![Value::Int(1)]).unwrap().repr(), "<class 'int'>");
        assert!(
            call("isinstance", vec![Value::Bool(true), Value::Builtin("int")])
                .unwrap()
                .truthy()
        );
        assert!(
            !call(
                "isinstance",
                vec![Value::Str("x".into()), Value::List(vec![Value::Builtin("int"), Value::Builtin("float")])]
            )
            .unwrap()
            .truthy()
        );
    }

    #[test]
    fn argument_counts_are_checked() {
        let err = call("len", Vec::new()).unwrap_err();
        assert_eq!(err.to_string(), "TypeError: len() takes exactly 1 argument (0 given)");
        let err = call_pure(
            "len",
            Args::new(vec![ints(&[1])], vec![("x".into(), Value::None)]),
        )
        .unwrap_err();
        assert!(err.message.contains("unexpected keyword argument 'x'"));
    }

    #[test]
    fn modular_power_and_characters() {
        assert_eq!(call("pow", vec![Value::Int(3), Value::Int(4), Value::Int(5)]).unwrap().repr(), "1");
        assert_eq!(call("chr", vec![Value::Int(97)]).unwrap().repr(), "'a'");
        assert_eq!(call("ord", vec![Value::Str("a".into())]).unwrap().repr(), "97");
        assert_eq!(call("hex", vec![Value::Int(-255)]).unwrap().repr(), "'-0xff'");
    }
}
