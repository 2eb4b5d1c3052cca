//! Natively implemented modules that code may import.

use std::sync::OnceLock;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use regex::{Regex, RegexBuilder};

use super::builtins::Args;
use super::error::RuntimeError;
use super::format::format_float;
use super::value::{Value, widen};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Module {
    Math,
    Json,
    Time,
    Statistics,
    Re,
}

const IGNORECASE: i64 = 2;
const MULTILINE: i64 = 8;
const DOTALL: i64 = 16;

impl Module {
    /// Names of every module the interpreter implements.
    pub(crate) const AVAILABLE: [&'static str; 5] = ["json", "math", "re", "statistics", "time"];

    pub(crate) fn from_name(name: &str) -> Option<Self> {
        Some(match name {
            "math" => Self::Math,
            "json" => Self::Json,
            "time" => Self::Time,
            "statistics" => Self::Statistics,
            "re" => Self::Re,
            _ => return None,
        })
    }

    pub(crate) const fn name(self) -> &'static str {
        match self {
            Self::Math => "math",
            Self::Json => "json",
            Self::Time => "time",
            Self::Statistics => "statistics",
            Self::Re => "re",
        }
    }

    fn functions(self) -> &'static [&'static str] {
        match self {
            Self::Math => &[
                "sqrt", "floor", "ceil", "trunc", "pow", "log", "log10", "log2", "exp", "sin",
                "cos", "tan", "asin", "acos", "atan", "atan2", "fabs", "factorial", "gcd",
                "isqrt", "hypot", "isclose", "degrees", "radians",
            ],
            Self::Json => &["dumps", "loads"],
            Self::Time => &["time", "sleep", "perf_counter", "monotonic"],
            Self::Statistics => &[
                "mean", "median", "mode", "stdev", "pstdev", "variance", "pvariance",
            ],
            Self::Re => &["findall", "search", "match", "fullmatch", "sub", "split"],
        }
    }

    fn constant(self, name: &str) -> Option<Value> {
        match (self, name) {
            (Self::Math, "pi") => Some(Value::Float(std::f64::consts::PI)),
            (Self::Math, "e") => Some(Value::Float(std::f64::consts::E)),
            (Self::Math, "tau") => Some(Value::Float(std::f64::consts::TAU)),
            (Self::Math, "inf") => Some(Value::Float(f64::INFINITY)),
            (Self::Math, "nan") => Some(Value::Float(f64::NAN)),
            (Self::Re, "IGNORECASE" | "I") => Some(Value::Int(IGNORECASE)),
            (Self::Re, "MULTILINE" | "M") => Some(Value::Int(MULTILINE)),
            (Self::Re, "DOTALL" | "S") => Some(Value::Int(DOTALL)),
            _ => None,
        }
    }

    /// `module.name`: a constant or a function reference.
    pub(crate) fn attribute(self, name: &str) -> Result<Value, RuntimeError> {
        if let Some(value) = self.constant(name) {
            return Ok(value);
        }
        self.functions()
            .iter()
            .find(|function| **function == name)
            .map(|function| Value::ModuleFn(self, *function))
            .ok_or_else(|| {
                RuntimeError::new(
                    "AttributeError",
                    format!("module '{}' has no attribute '{name}'", self.name()),
                )
            })
    }
}

/// Calls a module function that needs no interpreter access.
pub(crate) fn call(module: Module, name: &str, args: Args) -> Result<Value, RuntimeError> {
    match module {
        Module::Math => math(name, args),
        Module::Json => json(name, args),
        Module::Time => time(name, args),
        Module::Statistics => statistics(name, args),
        Module::Re => re(name, args),
    }
}

fn domain_error() -> RuntimeError {
    RuntimeError::value_error("math domain error")
}

/// Converts an integral float to an int, rejecting infinities and NaN.
#[allow(clippy::cast_possible_truncation)]
pub(crate) fn float_to_int(value: f64) -> Result<i64, RuntimeError> {
    if value.is_nan() {
        return Err(RuntimeError::value_error("cannot convert float NaN to integer"));
    }
    if !value.is_finite() || value.abs() >= 9.2e18 {
        return Err(RuntimeError::new(
            "OverflowError",
            "cannot convert float infinity to integer",
        ));
    }
    Ok(value as i64)
}

fn math(name: &str, mut args: Args) -> Result<Value, RuntimeError> {
    let function = format!("math.{name}");
    let float = |value: f64| Ok(Value::Float(value));
    match name {
        "floor" | "ceil" | "trunc" => {
            let [x] = args.exact::<1>(&function)?;
            if let Some(int) = x.as_int() {
                return Ok(Value::Int(int));
            }
            let x = x.expect_number(&function)?;
            let rounded = match name {
                "floor" => x.floor(),
                "ceil" => x.ceil(),
                _ => x.trunc(),
            };
            float_to_int(rounded).map(Value::Int)
        }
        "factorial" => {
            let [n] = args.exact::<1>(&function)?;
            let n = n.expect_int(&function)?;
            if n < 0 {
                return Err(RuntimeError::value_error(
                    "factorial() not defined for negative values",
                ));
            }
            (1..=n)
                .try_fold(1_i64, i64::checked_mul)
                .map(Value::Int)
                .ok_or_else(RuntimeError::overflow)
        }
        "gcd" => {
            let [a, b] = args.exact::<2>(&function)?;
            let (mut a, mut b) = (
                a.expect_int(&function)?.unsigned_abs(),
                b.expect_int(&function)?.unsigned_abs(),
            );
            while b != 0 {
                (a, b) = (b, a % b);
            }
            i64::try_from(a).map(Value::Int).map_err(|_| RuntimeError::overflow())
        }
        "isqrt" => {
            let [n] = args.exact::<1>(&function)?;
            let n = n.expect_int(&function)?;
            if n < 0 {
                return Err(RuntimeError::value_error("isqrt() argument must be nonnegative"));
            }
            let mut root = float_to_int(widen(n).sqrt())?;
            while root.saturating_mul(root) > n {
                root -= 1;
            }
            while (root + 1).saturating_mul(root + 1) <= n {
                root += 1;
            }
            Ok(Value::Int(root))
        }
        "isclose" => {
            let rel_tol = args.keyword("rel_tol").map_or(Ok(1e-9), |v| v.expect_number("rel_tol"))?;
            let abs_tol = args.keyword("abs_tol").map_or(Ok(0.0), |v| v.expect_number("abs_tol"))?;
            let [a, b] = args.exact::<2>(&function)?;
            let (a, b) = (a.expect_number(&function)?, b.expect_number(&function)?);
            let tolerance = (rel_tol * a.abs().max(b.abs())).max(abs_tol);
            Ok(Value::Bool((a - b).abs() <= tolerance))
        }
        "log" => {
            let values = args.finish(&function, 1, 2)?;
            let x = values[0].expect_number(&function)?;
            if x <= 0.0 {
                return Err(domain_error());
            }
            match values.get(1) {
                Some(base) => {
                    let base = base.expect_number(&function)?;
                    if base <= 0.0 || (base - 1.0).abs() == 0.0 {
                        return Err(domain_error());
                    }
                    float(x.ln() / base.ln())
                }
                None => float(x.ln()),
            }
        }
        "pow" | "atan2" | "hypot" => {
            let [a, b] = args.exact::<2>(&function)?;
            let (a, b) = (a.expect_number(&function)?, b.expect_number(&function)?);
            match name {
                "pow" => float(a.powf(b)),
                "atan2" => float(a.atan2(b)),
                _ => float(a.hypot(b)),
            }
        }
        _ => {
            let [x] = args.exact::<1>(&function)?;
            let x = x.expect_number(&function)?;
            match name {
                "sqrt" if x < 0.0 => Err(domain_error()),
                "sqrt" => float(x.sqrt()),
                "log10" | "log2" if x <= 0.0 => Err(domain_error()),
                "log10" => float(x.log10()),
                "log2" => float(x.log2()),
                "exp" => float(x.exp()),
                "sin" => float(x.sin()),
                "cos" => float(x.cos()),
                "tan" => float(x.tan()),
                "asin" | "acos" if !(-1.0..=1.0).contains(&x) => Err(domain_error()),
                "asin" => float(x.asin()),
                "acos" => float(x.acos()),
                "atan" => float(x.atan()),
                "fabs" => float(x.abs()),
                "degrees" => float(x.to_degrees()),
                "radians" => float(x.to_radians()),
                _ => Err(RuntimeError::attribute_error("module", name)),
            }
        }
    }
}

fn json(name: &str, mut args: Args) -> Result<Value, RuntimeError> {
    match name {
        "dumps" => {
            let indent = match args.keyword("indent") {
                Some(Value::None) | None => None,
                Some(value) => Some(usize::try_from(value.expect_int("indent")?).unwrap_or(0)),
            };
            args.keyword("ensure_ascii");
            args.keyword("default");
            let [value] = args.exact::<1>("json.dumps")?;
            let mut out = String::new();
            write_json(&value, indent, 0, &mut out)?;
            Ok(Value::Str(out))
        }
        "loads" => {
            let [text] = args.exact::<1>("json.loads")?;
            let text = text.expect_str("json.loads argument")?;
            serde_json::from_str::<serde_json::Value>(text)
                .map(|json| Value::from_json(&json))
                .map_err(|err| RuntimeError::new("JSONDecodeError", err.to_string()))
        }
        _ => Err(RuntimeError::attribute_error("module", name)),
    }
}

/// Serializes in insertion order with Python's default separators.
fn write_json(
    value: &Value,
    indent: Option<usize>,
    level: usize,
    out: &mut String,
) -> Result<(), RuntimeError> {
    let newline = |out: &mut String, level: usize| {
        if let Some(width) = indent {
            out.push('\n');
            out.push_str(&" ".repeat(width * level));
        }
    };
    let separator = if indent.is_some() { "," } else { ", " };

    match value {
        Value::None => out.push_str("null"),
        Value::Bool(b) => out.push_str(if *b { "true" } else { "false" }),
        Value::Int(i) => out.push_str(&i.to_string()),
        Value::Float(f) if f.is_nan() => out.push_str("NaN"),
        Value::Float(f) if f.is_infinite() => {
            out.push_str(if *f > 0.0 { "Infinity" } else { "-Infinity" });
        }
        Value::Float(f) => out.push_str(&format_float(*f)),
        Value::Str(s) => out.push_str(&serde_json::Value::String(s.clone()).to_string()),
        Value::List(items) => {
            out.push('[');
            for (index, item) in items.iter().enumerate() {
                if index > 0 {
                    out.push_str(separator);
                }
                newline(out, level + 1);
                write_json(item, indent, level + 1, out)?;
            }
            if !items.is_empty() {
                newline(out, level);
            }
            out.push(']');
        }
        Value::Dict(dict) => {
            out.push('{');
            for (index, (key, item)) in dict.iter().enumerate() {
                if index > 0 {
                    out.push_str(separator);
                }
                newline(out, level + 1);
                let key = match key {
                    Value::Str(s) => s.clone(),
                    other => other.to_json_lossy().to_string(),
                };
                out.push_str(&serde_json::Value::String(key).to_string());
                out.push_str(": ");
                write_json(item, indent, level + 1, out)?;
            }
            if dict.len() > 0 {
                newline(out, level);
            }
            out.push('}');
        }
        other => {
            return Err(RuntimeError::type_error(format!(
                "Object of type {} is not JSON serializable",
                other.type_name()
            )));
        }
    }
    Ok(())
}

fn time(name: &str, args: Args) -> Result<Value, RuntimeError> {
    static START: OnceLock<Instant> = OnceLock::new();
    let function = format!("time.{name}");
    args.finish(&function, 0, 0)?;
    match name {
        "time" => Ok(Value::Float(
            SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map_or(0.0, |elapsed| elapsed.as_secs_f64()),
        )),
        "perf_counter" | "monotonic" => Ok(Value::Float(
            START.get_or_init(Instant::now).elapsed().as_secs_f64(),
        )),
        _ => Err(RuntimeError::attribute_error("module", name)),
    }
}

fn statistics(name: &str, args: Args) -> Result<Value, RuntimeError> {
    let function = format!("statistics.{name}");
    let [data] = args.exact::<1>(&function)?;
    let items = data.iterate()?;
    let too_few = |needed: usize| {
        RuntimeError::new(
            "StatisticsError",
            format!("{name} requires at least {needed} data point(s)"),
        )
    };
    if items.is_empty() {
        return Err(too_few(1));
    }

    if name == "mode" {
        let mut best: Option<(&Value, usize)> = None;
        for item in &items {
            let count = items.iter().filter(|other| other.py_eq(item)).count();
            if best.is_none_or(|(_, top)| count > top) {
                best = Some((item, count));
            }
        }
        return Ok(best.map(|(item, _)| item.clone()).unwrap_or_default());
    }

    let numbers = items
        .iter()
        .map(|item| item.expect_number(&function))
        .collect::<Result<Vec<f64>, _>>()?;
    let count = widen(i64::try_from(numbers.len()).unwrap_or(i64::MAX));
    let mean = numbers.iter().sum::<f64>() / count;

    match name {
        "mean" => {
            let ints: Option<Vec<i64>> = items.iter().map(Value::as_int).collect();
            if let Some(ints) = ints {
                let total: i64 = ints.iter().sum();
                let len = i64::try_from(ints.len()).unwrap_or(i64::MAX);
                if total % len == 0 {
                    return Ok(Value::Int(total / len));
                }
            }
            Ok(Value::Float(mean))
        }
        "median" => {
            let mut sorted = items.clone();
            let mut failure = None;
            sorted.sort_by(|a, b| {
                a.compare(b).unwrap_or_else(|err| {
                    failure.get_or_insert(err);
                    std::cmp::Ordering::Equal
                })
            });
            if let Some(err) = failure {
                return Err(err);
            }
            let middle = sorted.len() / 2;
            if sorted.len() % 2 == 1 {
                return Ok(sorted[middle].clone());
            }
            let low = sorted[middle - 1].expect_number(&function)?;
            let high = sorted[middle].expect_number(&function)?;
            Ok(Value::Float(f64::midpoint(low, high)))
        }
        "variance" | "stdev" | "pvariance" | "pstdev" => {
            let sample = matches!(name, "variance" | "stdev");
            if sample && numbers.len() < 2 {
                return Err(too_few(2));
            }
            let squares: f64 = numbers.iter().map(|x| (x - mean).powi(2)).sum();
            let variance = squares / if sample { count - 1.0 } else { count };
            Ok(Value::Float(if name.ends_with("stdev") {
                variance.sqrt()
            } else {
                variance
            }))
        }
        _ => Err(RuntimeError::attribute_error("module", name)),
    }
}

fn compile(pattern: &str, flags: i64) -> Result<Regex, RuntimeError> {
    RegexBuilder::new(pattern)
        .case_insensitive(flags & IGNORECASE != 0)
        .multi_line(flags & MULTILINE != 0)
        .dot_matches_new_line(flags & DOTALL != 0)
        .build()
        .map_err(|err| RuntimeError::new("re.error", err.to_string()))
}

/// Translates Python replacement syntax (`\1`, `\g<name>`) to the regex
/// crate's `${1}` form.
fn replacement(repl: &str) -> String {
    let mut out = String::new();
    let mut chars = repl.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '$' => out.push_str("$$"),
            '\\' => match chars.peek().copied() {
                Some(d) if d.is_ascii_digit() => {
                    let mut group = String::new();
                    while let Some(d) = chars.peek().copied().filter(char::is_ascii_digit) {
                        group.push(d);
                        chars.next();
                    }
                    out.push_str(&format!("${{{group}}}"));
                }
                Some('g') => {
                    chars.next();
                    if chars.peek() == Some(&'<') {
                        chars.next();
                        let group: String = chars.by_ref().take_while(|c| *c != '>').collect();
                        out.push_str(&format!("${{{group}}}"));
                    } else {
                        out.push_str("\\g");
                    }
                }
                Some('n') => {
                    chars.next();
                    out.push('\n');
                }
                Some('\\') => {
                    chars.next();
                    out.push('\\');
                }
                _ => out.push('\\'),
            },
            c => out.push(c),
        }
    }
    out
}

fn groups(captures: &regex::Captures<'_>) -> Value {
    Value::List(
        captures
            .iter()
            .map(|group| group.map_or(Value::None, |m| Value::Str(m.as_str().to_owned())))
            .collect(),
    )
}

fn re(name: &str, mut args: Args) -> Result<Value, RuntimeError> {
    let function = format!("re.{name}");
    let flags = match args.keyword("flags") {
        Some(value) => value.expect_int("flags")?,
        None => 0,
    };
    let count = match args.keyword("count").or_else(|| args.keyword("maxsplit")) {
        Some(value) => usize::try_from(value.expect_int("count")?).unwrap_or(0),
        None => 0,
    };

    if name == "sub" {
        let values = args.finish(&function, 3, 4)?;
        let regex = compile(values[0].expect_str("pattern")?, flags)?;
        let repl = replacement(values[1].expect_str("repl")?);
        let text = values[2].expect_str("string")?;
        let count = match values.get(3) {
            Some(value) => usize::try_from(value.expect_int("count")?).unwrap_or(0),
            None => count,
        };
        return Ok(Value::Str(regex.replacen(text, count, repl.as_str()).into_owned()));
    }

    let values = args.finish(&function, 2, 3)?;
    let flags = match values.get(2) {
        Some(value) => value.expect_int("flags")?,
        None => flags,
    };
    let pattern = values[0].expect_str("pattern")?;
    let text = values[1].expect_str("string")?;

    match name {
        "findall" => {
            let regex = compile(pattern, flags)?;
            let group_count = regex.captures_len() - 1;
            let found = regex
                .captures_iter(text)
                .map(|captures| match group_count {
                    0 => Value::Str(captures[0].to_owned()),
                    1 => Value::Str(
                        captures
                            .get(1)
                            .map_or_else(String::new, |m| m.as_str().to_owned()),
                    ),
                    _ => Value::List(
                        (1..=group_count)
                            .map(|i| {
                                Value::Str(
                                    captures
                                        .get(i)
                                        .map_or_else(String::new, |m| m.as_str().to_owned()),
                                )
                            })
                            .collect(),
                    ),
                })
                .collect();
            Ok(Value::List(found))
        }
        "search" => {
            let regex = compile(pattern, flags)?;
            Ok(regex.captures(text).map_or(Value::None, |c| groups(&c)))
        }
        "match" => {
            let regex = compile(pattern, flags)?;
            Ok(regex
                .captures(text)
                .filter(|c| c.get(0).is_some_and(|m| m.start() == 0))
                .map_or(Value::None, |c| groups(&c)))
        }
        "fullmatch" => {
            let regex = compile(&format!(r"\A(?:{pattern})\z"), flags)?;
            Ok(regex.captures(text).map_or(Value::None, |c| groups(&c)))
        }
        "split" => {
            let regex = compile(pattern, flags)?;
            let parts: Vec<Value> = if count == 0 {
                regex.split(text).map(|s| Value::Str(s.to_owned())).collect()
            } else {
                regex
                    .splitn(text, count + 1)
                    .map(|s| Value::Str(s.to_owned()))
                    .collect()
            };
            Ok(Value::List(parts))
        }
        _ => Err(RuntimeError::attribute_error("module", name)),
    }
}
