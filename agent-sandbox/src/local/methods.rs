//! Methods of strings, lists and dicts.

use super::builtins::{Args, sort_values};
use super::error::RuntimeError;
use super::format::str_format;
use super::value::{Dict, MAX_SEQUENCE_LEN, Value};

/// Calls `receiver.name(*args)`, mutating the receiver in place for
/// list and dict methods.
pub(crate) fn call_method(
    receiver: &mut Value,
    name: &str,
    args: Args,
) -> Result<Value, RuntimeError> {
    match receiver {
        Value::Str(text) => str_method(text, name, args),
        Value::List(items) => list_method(items, name, args),
        Value::Dict(dict) => dict_method(dict, name, args),
        other => Err(RuntimeError::attribute_error(other.type_name(), name)),
    }
}

fn int_arg(value: &Value, what: &str) -> Result<i64, RuntimeError> {
    value.expect_int(what)
}

fn char_set(value: Option<&Value>) -> Result<Option<Vec<char>>, RuntimeError> {
    match value {
        None | Some(Value::None) => Ok(None),
        Some(chars) => Ok(Some(chars.expect_str("strip argument")?.chars().collect())),
    }
}

fn to_index(position: Option<usize>) -> Value {
    position
        .and_then(|position| i64::try_from(position).ok())
        .map_or(Value::Int(-1), Value::Int)
}

/// Char offset of a byte offset.
fn char_offset(text: &str, byte: usize) -> usize {
    text[..byte].chars().count()
}

fn affix_matches(
    text: &str,
    affix: &Value,
    test: fn(&str, &str) -> bool,
) -> Result<bool, RuntimeError> {
    match affix {
        Value::Str(affix) => Ok(test(text, affix)),
        Value::List(options) => {
            for option in options {
                if test(text, option.expect_str("prefix")?) {
                    return Ok(true);
                }
            }
            Ok(false)
        }
        other => Err(RuntimeError::type_error(format!(
            "startswith first arg must be str or a tuple of str, not {}",
            other.type_name()
        ))),
    }
}

fn strings(values: Vec<String>) -> Value {
    Value::List(values.into_iter().map(Value::Str).collect())
}

fn split(text: &str, sep: Option<&str>, maxsplit: i64) -> Result<Value, RuntimeError> {
    let limit = usize::try_from(maxsplit).ok();
    match sep {
        None => {
            let mut parts = Vec::new();
            let mut rest = text.trim_start();
            while !rest.is_empty() {
                if limit.is_some_and(|limit| parts.len() >= limit) {
                    parts.push(rest.to_owned());
                    break;
                }
                let end = rest.find(char::is_whitespace).unwrap_or(rest.len());
                parts.push(rest[..end].to_owned());
                rest = rest[end..].trim_start();
            }
            Ok(strings(parts))
        }
        Some("") => Err(RuntimeError::value_error("empty separator")),
        Some(sep) => Ok(strings(match limit {
            Some(limit) => text.splitn(limit + 1, sep).map(str::to_owned).collect(),
            None => text.split(sep).map(str::to_owned).collect(),
        })),
    }
}

fn justify(text: &str, width: i64, fill: Option<&Value>, align: char) -> Result<Value, RuntimeError> {
    let fill = match fill {
        Some(fill) => {
            let fill = fill.expect_str("fill character")?;
            let mut chars = fill.chars();
            match (chars.next(), chars.next()) {
                (Some(c), None) => c,
                _ => {
                    return Err(RuntimeError::type_error(
                        "The fill character must be exactly one character long",
                    ));
                }
            }
        }
        None => ' ',
    };
    let len = text.chars().count();
    let width = usize::try_from(width).unwrap_or(0).min(MAX_SEQUENCE_LEN);
    if width <= len {
        return Ok(Value::Str(text.to_owned()));
    }
    let missing = width - len;
    let pad = |count: usize| fill.to_string().repeat(count);
    Ok(Value::Str(match align {
        '<' => format!("{text}{}", pad(missing)),
        '>' => format!("{}{text}", pad(missing)),
        _ => {
            let left = missing / 2 + (missing & width & 1);
            format!("{}{text}{}", pad(left), pad(missing - left))
        }
    }))
}

fn title(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut previous_cased = false;
    for c in text.chars() {
        if previous_cased {
            out.extend(c.to_lowercase());
        } else {
            out.extend(c.to_uppercase());
        }
        previous_cased = c.is_alphabetic();
    }
    out
}

fn char_test(text: &str, test: fn(char) -> bool) -> Value {
    Value::Bool(!text.is_empty() && text.chars().all(test))
}

#[allow(clippy::too_many_lines)]
fn str_method(text: &str, name: &str, mut args: Args) -> Result<Value, RuntimeError> {
    let function = format!("str.{name}");
    match name {
        "upper" | "lower" | "title" | "capitalize" | "swapcase" | "casefold" => {
            args.finish(&function, 0, 0)?;
            Ok(Value::Str(match name {
                "upper" => text.to_uppercase(),
                "lower" | "casefold" => text.to_lowercase(),
                "title" => title(text),
                "swapcase" => text
                    .chars()
                    .flat_map(|c| {
                        if c.is_uppercase() {
                            c.to_lowercase().collect::<Vec<_>>()
                        } else {
                            c.to_uppercase().collect()
                        }
                    })
                    .collect(),
                _ => {
                    let mut chars = text.chars();
                    chars.next().map_or_else(String::new, |first| {
                        first.to_uppercase().chain(chars.as_str().to_lowercase().chars()).collect()
                    })
                }
            }))
        }
        "strip" | "lstrip" | "rstrip" => {
            let values = args.finish(&function, 0, 1)?;
            let chars = char_set(values.first())?;
            let matches = |c: char| match &chars {
                Some(set) => set.contains(&c),
                None => c.is_whitespace(),
            };
            Ok(Value::Str(
                match name {
                    "strip" => text.trim_matches(matches),
                    "lstrip" => text.trim_start_matches(matches),
                    _ => text.trim_end_matches(matches),
                }
                .to_owned(),
            ))
        }
        "split" | "rsplit" => {
            let sep = args.keyword("sep");
            let maxsplit = args.keyword("maxsplit");
            let values = args.finish(&function, 0, 2)?;
            let sep = values.first().cloned().or(sep);
            let maxsplit = match values.get(1).cloned().or(maxsplit) {
                Some(value) => int_arg(&value, "maxsplit")?,
                None => -1,
            };
            let sep = match &sep {
                None | Some(Value::None) => None,
                Some(sep) => Some(sep.expect_str("separator")?),
            };
            if name == "rsplit" && maxsplit >= 0 {
                if let Some(sep) = sep {
                    let limit = usize::try_from(maxsplit).unwrap_or(0);
                    let mut parts: Vec<String> =
                        text.rsplitn(limit + 1, sep).map(str::to_owned).collect();
                    parts.reverse();
                    return Ok(strings(parts));
                }
            }
            split(text, sep, maxsplit)
        }
        "splitlines" => {
            args.finish(&function, 0, 0)?;
            Ok(strings(text.lines().map(str::to_owned).collect()))
        }
        "join" => {
            let [iterable] = args.exact::<1>(&function)?;
            let parts = iterable
                .iterate()?
                .iter()
                .map(|item| match item {
                    Value::Str(s) => Ok(s.clone()),
                    other => Err(RuntimeError::type_error(format!(
                        "sequence item: expected str instance, {} found",
                        other.type_name()
                    ))),
                })
                .collect::<Result<Vec<_>, _>>()?;
            Ok(Value::Str(parts.join(text)))
        }
        "replace" => {
            let values = args.finish(&function, 2, 3)?;
            let old = values[0].expect_str("replace() argument 1")?;
            let new = values[1].expect_str("replace() argument 2")?;
            Ok(Value::Str(match values.get(2).map(|count| int_arg(count, "count")).transpose()? {
                Some(count) if count >= 0 => {
                    text.replacen(old, new, usize::try_from(count).unwrap_or(0))
                }
                _ => text.replace(old, new),
            }))
        }
        "startswith" | "endswith" => {
            let [affix] = args.exact::<1>(&function)?;
            let test: fn(&str, &str) -> bool = if name == "startswith" {
                |text, affix| text.starts_with(affix)
            } else {
                |text, affix| text.ends_with(affix)
            };
            affix_matches(text, &affix, test).map(Value::Bool)
        }
        "find" | "rfind" | "index" | "rindex" => {
            let [needle] = args.exact::<1>(&function)?;
            let needle = needle.expect_str("substring")?;
            let position = if name.starts_with('r') {
                text.rfind(needle)
            } else {
                text.find(needle)
            }
            .map(|byte| char_offset(text, byte));
            if position.is_none() && name.ends_with("index") {
                return Err(RuntimeError::value_error("substring not found"));
            }
            Ok(to_index(position))
        }
        "count" => {
            let [needle] = args.exact::<1>(&function)?;
            let needle = needle.expect_str("substring")?;
            let count = if needle.is_empty() {
                text.chars().count() + 1
            } else {
                text.matches(needle).count()
            };
            Ok(Value::Int(i64::try_from(count).unwrap_or(i64::MAX)))
        }
        "format" => {
            let (positional, keywords) = args.into_parts();
            str_format(text, &positional, &keywords).map(Value::Str)
        }
        "isdigit" | "isnumeric" | "isdecimal" => {
            args.finish(&function, 0, 0)?;
            Ok(char_test(text, |c| c.is_numeric()))
        }
        "isalpha" => {
            args.finish(&function, 0, 0)?;
            Ok(char_test(text, char::is_alphabetic))
        }
        "isalnum" => {
            args.finish(&function, 0, 0)?;
            Ok(char_test(text, char::is_alphanumeric))
        }
        "isspace" => {
            args.finish(&function, 0, 0)?;
            Ok(char_test(text, char::is_whitespace))
        }
        "isupper" | "islower" => {
            args.finish(&function, 0, 0)?;
            let cased = text.chars().any(char::is_alphabetic);
            let fits = if name == "isupper" {
                !text.chars().any(char::is_lowercase)
            } else {
                !text.chars().any(char::is_uppercase)
            };
            Ok(Value::Bool(cased && fits))
        }
        "zfill" => {
            let [width] = args.exact::<1>(&function)?;
            let width = usize::try_from(int_arg(&width, "width")?).unwrap_or(0);
            let len = text.chars().count();
            if width <= len {
                return Ok(Value::Str(text.to_owned()));
            }
            let zeros = "0".repeat((width - len).min(MAX_SEQUENCE_LEN));
            Ok(Value::Str(match text.strip_prefix(['-', '+']) {
                Some(rest) => format!("{}{zeros}{rest}", &text[..1]),
                None => format!("{zeros}{text}"),
            }))
        }
        "center" | "ljust" | "rjust" => {
            let values = args.finish(&function, 1, 2)?;
            let width = int_arg(&values[0], "width")?;
            let align = match name {
                "ljust" => '<',
                "rjust" => '>',
                _ => '^',
            };
            justify(text, width, values.get(1), align)
        }
        "partition" => {
            let [sep] = args.exact::<1>(&function)?;
            let sep = sep.expect_str("separator")?;
            let parts = match text.split_once(sep) {
                Some((head, tail)) => [head, sep, tail],
                None => [text, "", ""],
            };
            Ok(strings(parts.iter().map(|part| (*part).to_owned()).collect()))
        }
        "removeprefix" | "removesuffix" => {
            let [affix] = args.exact::<1>(&function)?;
            let affix = affix.expect_str("affix")?;
            let stripped = if name == "removeprefix" {
                text.strip_prefix(affix)
            } else {
                text.strip_suffix(affix)
            };
            Ok(Value::Str(stripped.unwrap_or(text).to_owned()))
        }
        "encode" => Ok(Value::Str(text.to_owned())),
        _ => Err(RuntimeError::attribute_error("str", name)),
    }
}

fn position_of(items: &[Value], needle: &Value) -> Option<usize> {
    items.iter().position(|item| item.py_eq(needle))
}

fn list_method(items: &mut Vec<Value>, name: &str, mut args: Args) -> Result<Value, RuntimeError> {
    let function = format!("list.{name}");
    match name {
        "append" => {
            let [item] = args.exact::<1>(&function)?;
            if items.len() >= MAX_SEQUENCE_LEN {
                return Err(RuntimeError::new("MemoryError", "list is too large"));
            }
            items.push(item);
            Ok(Value::None)
        }
        "extend" => {
            let [iterable] = args.exact::<1>(&function)?;
            let extra = iterable.iterate()?;
            if items.len() + extra.len() > MAX_SEQUENCE_LEN {
                return Err(RuntimeError::new("MemoryError", "list is too large"));
            }
            items.extend(extra);
            Ok(Value::None)
        }
        "insert" => {
            let [index, item] = args.exact::<2>(&function)?;
            let index = int_arg(&index, "index")?;
            let len = i64::try_from(items.len()).unwrap_or(i64::MAX);
            let resolved = if index < 0 { (index + len).max(0) } else { index.min(len) };
            items.insert(usize::try_from(resolved).unwrap_or(0), item);
            Ok(Value::None)
        }
        "pop" => {
            let values = args.finish(&function, 0, 1)?;
            if items.is_empty() {
                return Err(RuntimeError::index_error("pop from empty list"));
            }
            let index = match values.first() {
                Some(index) => int_arg(index, "index")?,
                None => -1,
            };
            let len = i64::try_from(items.len()).unwrap_or(i64::MAX);
            let resolved = if index < 0 { index + len } else { index };
            match usize::try_from(resolved).ok().filter(|index| *index < items.len()) {
                Some(index) => Ok(items.remove(index)),
                None => Err(RuntimeError::index_error("pop index out of range")),
            }
        }
        "remove" => {
            let [needle] = args.exact::<1>(&function)?;
            let index = position_of(items, &needle)
                .ok_or_else(|| RuntimeError::value_error("list.remove(x): x not in list"))?;
            items.remove(index);
            Ok(Value::None)
        }
        "index" => {
            let [needle] = args.exact::<1>(&function)?;
            let index = position_of(items, &needle).ok_or_else(|| {
                RuntimeError::value_error(format!("{} is not in list", needle.repr()))
            })?;
            Ok(to_index(Some(index)))
        }
        "count" => {
            let [needle] = args.exact::<1>(&function)?;
            let count = items.iter().filter(|item| item.py_eq(&needle)).count();
            Ok(Value::Int(i64::try_from(count).unwrap_or(i64::MAX)))
        }
        "sort" => {
            let reverse = args.keyword("reverse").is_some_and(|value| value.truthy());
            args.finish(&function, 0, 0)?;
            *items = sort_values(std::mem::take(items), None, reverse)?;
            Ok(Value::None)
        }
        "reverse" => {
            args.finish(&function, 0, 0)?;
            items.reverse();
            Ok(Value::None)
        }
        "copy" => {
            args.finish(&function, 0, 0)?;
            Ok(Value::List(items.clone()))
        }
        "clear" => {
            args.finish(&function, 0, 0)?;
            items.clear();
            Ok(Value::None)
        }
        _ => Err(RuntimeError::attribute_error("list", name)),
    }
}

fn dict_method(dict: &mut Dict, name: &str, args: Args) -> Result<Value, RuntimeError> {
    let function = format!("dict.{name}");
    match name {
        "get" => {
            let values = args.finish(&function, 1, 2)?;
            Ok(dict
                .get(&values[0])
                .cloned()
                .or_else(|| values.get(1).cloned())
                .unwrap_or_default())
        }
        "keys" => {
            args.finish(&function, 0, 0)?;
            Ok(Value::List(dict.keys()))
        }
        "values" => {
            args.finish(&function, 0, 0)?;
            Ok(Value::List(dict.values()))
        }
        "items" => {
            args.finish(&function, 0, 0)?;
            Ok(Value::List(dict.items()))
        }
        "update" => {
            let (positional, keywords) = args.into_parts();
            if positional.len() > 1 {
                return Err(RuntimeError::type_error(format!(
                    "update expected at most 1 argument, got {}",
                    positional.len()
                )));
            }
            if let Some(other) = positional.first() {
                match other {
                    Value::Dict(other) => {
                        for (key, value) in other.iter() {
                            dict.insert(key.clone(), value.clone())?;
                        }
                    }
                    iterable => {
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
                }
            }
            for (key, value) in keywords {
                dict.insert(Value::Str(key), value)?;
            }
            Ok(Value::None)
        }
        "pop" => {
            let values = args.finish(&function, 1, 2)?;
            match (dict.remove(&values[0]), values.get(1)) {
                (Some(value), _) => Ok(value),
                (None, Some(default)) => Ok(default.clone()),
                (None, None) => Err(RuntimeError::key_error(&values[0])),
            }
        }
        "setdefault" => {
            let values = args.finish(&function, 1, 2)?;
            if let Some(existing) = dict.get(&values[0]) {
                return Ok(existing.clone());
            }
            let default = values.get(1).cloned().unwrap_or_default();
            dict.insert(values[0].clone(), default.clone())?;
            Ok(default)
        }
        "copy" => {
            args.finish(&function, 0, 0)?;
            Ok(Value::Dict(dict.clone()))
        }
        "clear" => {
            args.finish(&function, 0, 0)?;
            dict.clear();
            Ok(Value::None)
        }
        _ => Err(RuntimeError::attribute_error("dict", name)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn s(text: &str) -> Value {
        Value::Str(text.to_owned())
    }

    fn call(receiver: &mut Value, name: &str, positional: Vec<Value>) -> Value {
        call_method(receiver, name, Args::new(positional, Vec::new())).unwrap()
    }

    #[test]
    fn string_methods() {
        let mut text = s("  Hello World  ");
        assert_eq!(call(&mut text, "strip", vec![]).repr(), "'Hello World'");
        assert_eq!(call(&mut text, "split", vec![]).repr(), "['Hello', 'World']");
        assert_eq!(call(&mut s("a,b,,c"), "split", vec![s(",")]).repr(), "['a', 'b', '', 'c']");
        assert_eq!(
            call(&mut s("-"), "join", vec![Value::List(vec![s("x"), s("y")])]).repr(),
            "'x-y'"
        );
        assert_eq!(call(&mut s("héllo"), "find", vec![s("l")]).repr(), "2");
        assert_eq!(call(&mut s("-42"), "zfill", vec![Value::Int(5)]).repr(), "'-0042'");
        assert_eq!(call(&mut s("hello world"), "title", vec![]).repr(), "'Hello World'");
        let err = call_method(&mut s("abc"), "index", Args::new(vec![s("z")], Vec::new()))
            .unwrap_err();
        assert_eq!(err.kind, "ValueError");
    }

    #[test]
    fn list_methods_mutate_in_place() {
        let mut items = Value::List(vec![Value::Int(3), Value::Int(1)]);
        call(&mut items, "append", vec![Value::Int(2)]);
        call(&mut items, "sort", vec![]);
        assert_eq!(items.repr(), "[1, 2, 3]");
        assert_eq!(call(&mut items, "pop", vec![]).repr(), "3");
        assert_eq!(items.repr(), "[1, 2]");
        let err = call_method(&mut Value::List(Vec::new()), "pop", Args::default()).unwrap_err();
        assert_eq!(err.to_string(), "IndexError: pop from empty list");
    }

    #[test]
    fn dict_methods() {
        let mut dict = Value::Dict(Dict::default());
        call_method(
            &mut dict,
            "update",
            Args::new(Vec::new(), vec![("a".into(), Value::Int(1))]),
        )
        .unwrap();
        assert_eq!(call(&mut dict, "get", vec![s("a")]).repr(), "1");
        assert_eq!(call(&mut dict, "get", vec![s("b"), Value::Int(0)]).repr(), "0");
        assert_eq!(call(&mut dict, "setdefault", vec![s("b"), Value::Int(5)]).repr(), "5");
        assert_eq!(call(&mut dict, "items", vec![]).repr(), "[['a', 1], ['b', 5]]");
        assert_eq!(call(&mut dict, "pop", vec![s("a")]).repr(), "1");
        assert_eq!(dict.repr(), "{'b': 5}");
    }

    #[test]
    fn unknown_methods_are_attribute_errors() {
        let err = call_method(&mut Value::Int(1), "upper", Args::default()).unwrap_err();
        assert_eq!(err.to_string(), "AttributeError: 'int' object has no attribute 'upper'");
    }
}
