//! Python-compatible text rendering: `repr`, format specs, `str.format`
//! and `%` interpolation.

use super::error::RuntimeError;
use super::value::Value;

/// `repr()` of a float.
pub(crate) fn format_float(value: f64) -> String {
    if value.is_nan() {
        return "nan".to_owned();
    }
    if value.is_infinite() {
        return if value > 0.0 { "inf" } else { "-inf" }.to_owned();
    }
    let magnitude = value.abs();
    if magnitude != 0.0 && !(1e-4..1e16).contains(&magnitude) {
        return python_exponent(&format!("{value:e}"));
    }
    let text = value.to_string();
    if text.contains('.') {
        text
    } else {
        format!("{text}.0")
    }
}

/// Rewrites Rust's `1.5e-7` exponent form as Python's `1.5e-07`.
fn python_exponent(text: &str) -> String {
    let Some((mantissa, exponent)) = text.split_once('e') else {
        return text.to_owned();
    };
    let (sign, digits) = match exponent.strip_prefix('-') {
        Some(digits) => ('-', digits),
        None => ('+', exponent),
    };
    format!("{mantissa}e{sign}{digits:0>2}")
}

/// `repr()` of a string.
pub(crate) fn repr_str(text: &str) -> String {
    let quote = if text.contains('\'') && !text.contains('"') {
        '"'
    } else {
        '\''
    };
    let mut out = String::with_capacity(text.len() + 2);
    out.push(quote);
    for c in text.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if c == quote => {
                out.push('\\');
                out.push(c);
            }
            c if c.is_control() => out.push_str(&format!("\\x{:02x}", u32::from(c))),
            c => out.push(c),
        }
    }
    out.push(quote);
    out
}

#[derive(Debug, Default)]
struct Spec {
    fill: Option<char>,
    align: Option<char>,
    sign: Option<char>,
    zero: bool,
    width: usize,
    grouping: Option<char>,
    precision: Option<usize>,
    kind: Option<char>,
}

fn invalid_spec(spec: &str) -> RuntimeError {
    RuntimeError::value_error(format!("Invalid format specifier '{spec}'"))
}

fn parse_spec(spec: &str) -> Result<Spec, RuntimeError> {
    let chars: Vec<char> = spec.chars().collect();
    let mut parsed = Spec::default();
    let mut i = 0;

    let is_align = |c: char| matches!(c, '<' | '>' | '^' | '=');
    if chars.len() >= 2 && is_align(chars[1]) {
        parsed.fill = Some(chars[0]);
        parsed.align = Some(chars[1]);
        i = 2;
    } else if chars.first().copied().is_some_and(is_align) {
        parsed.align = Some(chars[0]);
        i = 1;
    }
    if let Some(&sign @ ('+' | '-' | ' ')) = chars.get(i) {
        parsed.sign = Some(sign);
        i += 1;
    }
    if chars.get(i) == Some(&'0') {
        parsed.zero = true;
        i += 1;
    }
    let digits = |i: &mut usize| {
        let start = *i;
        while chars.get(*i).is_some_and(char::is_ascii_digit) {
            *i += 1;
        }
        chars[start..*i]
            .iter()
            .collect::<String>()
            .parse::<usize>()
            .ok()
    };
    parsed.width = digits(&mut i).unwrap_or(0);
    if let Some(&separator @ (',' | '_')) = chars.get(i) {
        parsed.grouping = Some(separator);
        i += 1;
    }
    if chars.get(i) == Some(&'.') {
        i += 1;
        parsed.precision = Some(digits(&mut i).ok_or_else(|| invalid_spec(spec))?);
    }
    if let Some(&kind) = chars.get(i) {
        parsed.kind = Some(kind);
        i += 1;
    }
    if i != chars.len() {
        return Err(invalid_spec(spec));
    }
    Ok(parsed)
}

fn group_digits(digits: &str, separator: char) -> String {
    let (integer, rest) = digits
        .find(|c: char| !c.is_ascii_digit())
        .map_or((digits, ""), |split| digits.split_at(split));
    let mut grouped = String::new();
    for (index, c) in integer.chars().enumerate() {
        if index > 0 && (integer.len() - index) % 3 == 0 {
            grouped.push(separator);
        }
        grouped.push(c);
    }
    grouped.push_str(rest);
    grouped
}

#[allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap, clippy::cast_sign_loss)]
fn general(value: f64, precision: usize) -> String {
    let precision = precision.max(1);
    if value == 0.0 {
        return "0".to_owned();
    }
    let exponent = value.abs().log10().floor() as i32;
    if exponent < -4 || exponent >= precision as i32 {
        let text = format!("{:.*e}", precision - 1, value);
        let (mantissa, exponent) = text.split_once('e').unwrap_or((&text, "0"));
        let mantissa = strip_zeros(mantissa);
        python_exponent(&format!("{mantissa}e{exponent}"))
    } else {
        let decimals = (precision as i32 - 1 - exponent).max(0) as usize;
        strip_zeros(&format!("{value:.decimals$}")).to_owned()
    }
}

fn strip_zeros(text: &str) -> &str {
    if text.contains('.') {
        text.trim_end_matches('0').trim_end_matches('.')
    } else {
        text
    }
}

/// Renders `value` according to a format-spec mini-language string.
pub(crate) fn format_spec(value: &Value, spec: &str) -> Result<String, RuntimeError> {
    let parsed = parse_spec(spec)?;
    let unknown = || {
        RuntimeError::value_error(format!(
            "Unknown format code '{}' for object of type '{}'",
            parsed.kind.unwrap_or(' '),
            value.type_name()
        ))
    };

    let numeric = match (parsed.kind, value) {
        (Some('f' | 'F' | '%' | 'e' | 'E' | 'g' | 'G'), v) => {
            let number = v.as_f64().ok_or_else(unknown)?;
            let digits = match parsed.kind {
                Some('%') => format!("{:.*}%", parsed.precision.unwrap_or(6), number.abs() * 100.0),
                Some('e' | 'E') => {
                    python_exponent(&format!("{:.*e}", parsed.precision.unwrap_or(6), number.abs()))
                }
                Some('g' | 'G') => general(number.abs(), parsed.precision.unwrap_or(6)),
                _ => format!("{:.*}", parsed.precision.unwrap_or(6), number.abs()),
            };
            Some((number.is_sign_negative() && number != 0.0, digits))
        }
        (Some('d' | 'x' | 'X' | 'b' | 'o'), v @ (Value::Int(_) | Value::Bool(_))) => {
            let number = v.as_int().unwrap_or(0);
            let magnitude = number.unsigned_abs();
            let digits = match parsed.kind {
                Some('x') => format!("{magnitude:x}"),
                Some('X') => format!("{magnitude:X}"),
                Some('b') => format!("{magnitude:b}"),
                Some('o') => format!("{magnitude:o}"),
                _ => magnitude.to_string(),
            };
            Some((number < 0, digits))
        }
        (None, Value::Int(number)) => Some((*number < 0, number.unsigned_abs().to_string())),
        (None, Value::Float(number)) => {
            let digits = match parsed.precision {
                Some(precision) => general(number.abs(), precision),
                None => format_float(number.abs()),
            };
            Some((number.is_sign_negative() && *number != 0.0, digits))
        }
        (None | Some('s'), _) => None,
        _ => return Err(unknown()),
    };

    let Some((negative, digits)) = numeric else {
        let mut text = value.to_str();
        if let Some(precision) = parsed.precision {
            text = text.chars().take(precision).collect();
        }
        return Ok(pad(&text, &parsed, '<'));
    };

    let digits = match parsed.grouping {
        Some(separator) => group_digits(&digits, separator),
        None => digits,
    };
    let sign = match (negative, parsed.sign) {
        (true, _) => "-",
        (false, Some('+')) => "+",
        (false, Some(' ')) => " ",
        _ => "",
    };

    if parsed.zero && parsed.align.is_none() {
        let width = parsed.width.saturating_sub(sign.len());
        return Ok(format!("{sign}{digits:0>width$}"));
    }
    Ok(pad(&format!("{sign}{digits}"), &parsed, '>'))
}

fn pad(text: &str, spec: &Spec, default_align: char) -> String {
    let len = text.chars().count();
    if len >= spec.width {
        return text.to_owned();
    }
    let fill = spec.fill.unwrap_or(' ');
    let missing = spec.width - len;
    let filler = |count: usize| fill.to_string().repeat(count);
    match spec.align.unwrap_or(default_align) {
        '<' => format!("{text}{}", filler(missing)),
        '^' => format!("{}{text}{}", filler(missing / 2), filler(missing - missing / 2)),
        _ => format!("{}{text}", filler(missing)),
    }
}

/// `template.format(*positional, **keywords)`.
pub(crate) fn str_format(
    template: &str,
    positional: &[Value],
    keywords: &[(String, Value)],
) -> Result<String, RuntimeError> {
    let chars: Vec<char> = template.chars().collect();
    let mut out = String::new();
    let mut auto_index = 0;
    let mut i = 0;
    while i < chars.len() {
        match chars[i] {
            '{' if chars.get(i + 1) == Some(&'{') => {
                out.push('{');
                i += 2;
            }
            '}' if chars.get(i + 1) == Some(&'}') => {
                out.push('}');
                i += 2;
            }
            '{' => {
                let end = chars[i..]
                    .iter()
                    .position(|c| *c == '}')
                    .map(|offset| i + offset)
                    .ok_or_else(|| {
                        RuntimeError::value_error("Single '{' encountered in format string")
                    })?;
                let field: String = chars[i + 1..end].iter().collect();
                let (name, spec) = field.split_once(':').unwrap_or((&field, ""));
                let (name, repr) = match name.strip_suffix("!r") {
                    Some(stripped) => (stripped, true),
                    None => (name.strip_suffix("!s").unwrap_or(name), false),
                };

                let value = if name.is_empty() {
                    auto_index += 1;
                    positional.get(auto_index - 1)
                } else if let Ok(index) = name.parse::<usize>() {
                    positional.get(index)
                } else {
                    keywords
                        .iter()
                        .find(|(key, _)| key == name)
                        .map(|(_, value)| value)
                };
                let value = value.ok_or_else(|| {
                    if name.is_empty() || name.parse::<usize>().is_ok() {
                        RuntimeError::index_error(
                            "Replacement index out of range for positional args tuple",
                        )
                    } else {
                        RuntimeError::new("KeyError", repr_str(name))
                    }
                })?;

                if repr {
                    out.push_str(&value.repr());
                } else if spec.is_empty() {
                    out.push_str(&value.to_str());
                } else {
                    out.push_str(&format_spec(value, spec)?);
                }
                i = end + 1;
            }
            '}' => {
                return Err(RuntimeError::value_error(
                    "Single '}' encountered in format string",
                ));
            }
            c => {
                out.push(c);
                i += 1;
            }
        }
    }
    Ok(out)
}

/// `template % args`.
pub(crate) fn percent_format(template: &str, args: &Value) -> Result<String, RuntimeError> {
    let values: Vec<Value> = match args {
        Value::List(items) => items.clone(),
        Value::Dict(_) => Vec::new(),
        other => vec![other.clone()],
    };
    let chars: Vec<char> = template.chars().collect();
    let mut out = String::new();
    let mut next = 0;
    let mut i = 0;
    while i < chars.len() {
        if chars[i] != '%' {
            out.push(chars[i]);
            i += 1;
            continue;
        }
        i += 1;
        if chars.get(i) == Some(&'%') {
            out.push('%');
            i += 1;
            continue;
        }

        let mut key = None;
        if chars.get(i) == Some(&'(') {
            let close = chars[i..]
                .iter()
                .position(|c| *c == ')')
                .ok_or_else(|| RuntimeError::value_error("incomplete format key"))?;
            key = Some(chars[i + 1..i + close].iter().collect::<String>());
            i += close + 1;
        }

        let mut spec = String::new();
        while let Some(&flag @ ('-' | '+' | ' ' | '0')) = chars.get(i) {
            match flag {
                '-' => spec.insert(0, '<'),
                '0' => spec.push('0'),
                other => spec.push(other),
            }
            i += 1;
        }
        while let Some(&c) = chars.get(i).filter(|c| c.is_ascii_digit() || **c == '.') {
            spec.push(c);
            i += 1;
        }
        let Some(&conversion) = chars.get(i) else {
            return Err(RuntimeError::value_error("incomplete format"));
        };
        i += 1;

        let value = match (&key, args) {
            (Some(key), Value::Dict(dict)) => dict
                .get(&Value::Str(key.clone()))
                .cloned()
                .ok_or_else(|| RuntimeError::new("KeyError", repr_str(key)))?,
            (Some(_), _) => {
                return Err(RuntimeError::type_error("format requires a mapping"));
            }
            (None, _) => {
                let value = values.get(next).cloned().ok_or_else(|| {
                    RuntimeError::type_error("not enough arguments for format string")
                })?;
                next += 1;
                value
            }
        };

        let rendered = match conversion {
            's' => format_spec(&Value::Str(value.to_str()), &spec)?,
            'r' => format_spec(&Value::Str(value.repr()), &spec)?,
            'd' | 'i' => {
                let number = match value {
                    Value::Float(f) => Value::Int(truncate(f)),
                    other => other,
                };
                format_spec(&number, &format!("{spec}d"))?
            }
            'f' | 'F' | 'e' | 'E' | 'g' | 'G' | 'x' | 'X' | 'o' => {
                format_spec(&value, &format!("{spec}{conversion}"))?
            }
            other => {
                return Err(RuntimeError::value_error(format!(
                    "unsupported format character '{other}'"
                )));
            }
        };
        out.push_str(&rendered);
    }

    if key_free(args) && next < values.len() {
        return Err(RuntimeError::type_error(
            "not all arguments converted during string formatting",
        ));
    }
    Ok(out)
}

fn key_free(args: &Value) -> bool {
    !matches!(args, Value::Dict(_))
}

#[allow(clippy::cast_possible_truncation)]
fn truncate(value: f64) -> i64 {
    value.trunc() as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn floats_render_like_python() {
        assert_eq!(format_float(1.0), "1.0");
        assert_eq!(format_float(0.1), "0.1");
        assert_eq!(format_float(-0.0), "-0.0");
        assert_eq!(format_float(1e20), "1e+20");
        assert_eq!(format_float(1.5e-7), "1.5e-07");
        assert_eq!(format_float(f64::INFINITY), "inf");
    }

    #[test]
    fn strings_repr_with_quotes() {
        assert_eq!(repr_str("it's"), "\"it's\"");
        assert_eq!(repr_str("a\nb"), "'a\\nb'");
    }

    #[test]
    fn format_specs() {
        assert_eq!(format_spec(&Value::Float(3.14159), ".2f").unwrap(), "3.14");
        assert_eq!(format_spec(&Value::Int(1_234_567), ",").unwrap(), "1,234,567");
        assert_eq!(format_spec(&Value::Float(-1234.5), ",.1f").unwrap(), "-1,234.5");
        assert_eq!(format_spec(&Value::Int(42), "05d").unwrap(), "00042");
        assert_eq!(format_spec(&Value::Str("ab".into()), ">4").unwrap(), "  ab");
        assert_eq!(format_spec(&Value::Str("ab".into()), "*^6").unwrap(), "**ab**");
        assert_eq!(format_spec(&Value::Float(0.256), ".1%").unwrap(), "25.6%");
        assert_eq!(format_spec(&Value::Int(255), "x").unwrap(), "ff");
        assert!(format_spec(&Value::Float(1.5), "d").is_err());
    }

    #[test]
    fn str_format_fields() {
        let text = str_format(
            "{} + {} = {total:.1f} {{ok}} {0!r}",
            &[Value::Int(1), Value::Str("x".into())],
            &[("total".into(), Value::Float(3.0))],
        )
        .unwrap();
        assert_eq!(text, "1 + x = 3.0 {ok} 1");
    }

    #[test]
    fn percent_interpolation() {
        let args = Value::List(vec![Value::Str("pi".into()), Value::Float(3.14159)]);
        assert_eq!(percent_format("%s is %.2f", &args).unwrap(), "pi is 3.14");
        assert_eq!(percent_format("%d%%", &Value::Float(99.6)).unwrap(), "99%");
        assert!(percent_format("%s %s", &Value::Int(1)).is_err());
    }
}
