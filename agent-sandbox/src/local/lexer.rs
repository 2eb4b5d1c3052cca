//! Tokenizer with Python-style significant indentation.

use thiserror::Error;

/// A syntax problem, located by line.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("SyntaxError: {message} (line {line})")]
pub(crate) struct SyntaxError {
    pub(crate) line: usize,
    pub(crate) message: String,
}

impl SyntaxError {
    pub(crate) fn new(line: usize, message: impl Into<String>) -> Self {
        Self {
            line,
            message: message.into(),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub(crate) enum Token {
    Name(String),
    Int(i64),
    Float(f64),
    Str(String),
    FStr(Vec<RawSegment>),
    Op(&'static str),
    Newline,
    Indent,
    Dedent,
    Eof,
}

/// Piece of an f-string before its fields are parsed.
#[derive(Clone, Debug, PartialEq)]
pub(crate) enum RawSegment {
    Literal(String),
    Field {
        source: String,
        spec: Option<String>,
        repr: bool,
    },
}

#[derive(Clone, Debug, PartialEq)]
pub(crate) struct Spanned {
    pub(crate) token: Token,
    pub(crate) line: usize,
}

// Longest first so that prefixes never shadow longer operators.
const OPERATORS: [&str; 32] = [
    "**=", "//=", "**", "//", "==", "!=", "<=", ">=", "+=", "-=", "*=", "/=", "%=", "->", "+", "-",
    "*", "/", "%", "<", ">", "=", "(", ")", "[", "]", "{", "}", ",", ":", ".", ";",
];

const STRING_PREFIXES: [&str; 10] = ["f", "r", "b", "u", "rb", "br", "fr", "rf", "bR", "Rb"];

pub(crate) fn tokenize(source: &str) -> Result<Vec<Spanned>, SyntaxError> {
    Lexer::new(source).run()
}

struct Lexer {
    chars: Vec<char>,
    pos: usize,
    line: usize,
    depth: usize,
    bracket_line: usize,
    indents: Vec<usize>,
    tokens: Vec<Spanned>,
    at_line_start: bool,
}

#[derive(Clone, Copy, Default)]
struct Prefix {
    raw: bool,
    format: bool,
}

impl Lexer {
    fn new(source: &str) -> Self {
        Self {
            chars: source.replace("\r\n", "\n").chars().collect(),
            pos: 0,
            line: 1,
            depth: 0,
            bracket_line: 1,
            indents: vec![0],
            tokens: Vec::new(),
            at_line_start: true,
        }
    }

    fn run(mut self) -> Result<Vec<Spanned>, SyntaxError> {
        while self.pos < self.chars.len() {
            if self.at_line_start && self.depth == 0 {
                self.at_line_start = false;
                if self.indentation()? {
                    continue;
                }
            }

            let c = self.chars[self.pos];
            match c {
                '\n' => {
                    self.pos += 1;
                    if self.depth == 0 {
                        self.newline();
                        self.at_line_start = true;
                    }
                    self.line += 1;
                }
                ' ' | '\t' | '\r' | '\x0c' => self.pos += 1,
                '#' => self.skip_to_line_end(),
                '\\' if self.peek(1) == Some('\n') => {
                    self.pos += 2;
                    self.line += 1;
                }
                '0'..='9' => self.number()?,
                '.' if self.peek(1).is_some_and(|n| n.is_ascii_digit()) => self.number()?,
                '"' | '\'' => self.string(Prefix::default())?,
                c if c.is_alphabetic() || c == '_' => self.word()?,
                _ => self.operator()?,
            }
        }

        if self.depth > 0 {
            return Err(SyntaxError::new(
                self.bracket_line,
                "unexpected end of input: bracket was never closed",
            ));
        }
        self.newline();
        while self.indents.len() > 1 {
            self.indents.pop();
            self.push(Token::Dedent);
        }
        self.push(Token::Eof);
        Ok(self.tokens)
    }

    fn peek(&self, offset: usize) -> Option<char> {
        self.chars.get(self.pos + offset).copied()
    }

    fn push(&mut self, token: Token) {
        self.tokens.push(Spanned {
            token,
            line: self.line,
        });
    }

    fn newline(&mut self) {
        if self
            .tokens
            .last()
            .is_some_and(|last| !matches!(last.token, Token::Newline))
        {
            self.push(Token::Newline);
        }
    }

    fn skip_to_line_end(&mut self) {
        while self.peek(0).is_some_and(|c| c != '\n') {
            self.pos += 1;
        }
    }

    /// Measures leading whitespace and emits indent tokens. Returns `true`
    /// when the line was blank and has been consumed.
    fn indentation(&mut self) -> Result<bool, SyntaxError> {
        let mut width = 0;
        let mut pos = self.pos;
        while let Some(&c) = self.chars.get(pos) {
            match c {
                ' ' => width += 1,
                '\t' => width = (width / 8 + 1) * 8,
                '\x0c' => width = 0,
                _ => break,
            }
            pos += 1;
        }
        self.pos = pos;

        match self.peek(0) {
            None => return Ok(true),
            Some('\n' | '#' | '\r') => {
                self.skip_to_line_end();
                if self.peek(0).is_some() {
                    self.pos += 1;
                    self.line += 1;
                }
                self.at_line_start = true;
                return Ok(true);
            }
            Some(_) => {}
        }

        let current = self.indents.last().copied().unwrap_or(0);
        if width > current {
            self.indents.push(width);
            self.push(Token::Indent);
        } else {
            while width < self.indents.last().copied().unwrap_or(0) {
                self.indents.pop();
                self.push(Token::Dedent);
            }
            if width != self.indents.last().copied().unwrap_or(0) {
                return Err(SyntaxError::new(
                    self.line,
                    "unindent does not match any outer indentation level",
                ));
            }
        }
        Ok(false)
    }

    fn word(&mut self) -> Result<(), SyntaxError> {
        let start = self.pos;
        while self
            .peek(0)
            .is_some_and(|c| c.is_alphanumeric() || c == '_')
        {
            self.pos += 1;
        }
        let word: String = self.chars[start..self.pos].iter().collect();

        if matches!(self.peek(0), Some('"' | '\'')) && STRING_PREFIXES.contains(&word.as_str()) {
            let lower = word.to_ascii_lowercase();
            return self.string(Prefix {
                raw: lower.contains('r'),
                format: lower.contains('f'),
            });
        }

        self.push(Token::Name(word));
        Ok(())
    }

    fn number(&mut self) -> Result<(), SyntaxError> {
        let start = self.pos;

        if self.peek(0) == Some('0') && matches!(self.peek(1), Some('x' | 'X')) {
            self.pos += 2;
            let digits_start = self.pos;
            while self
                .peek(0)
                .is_some_and(|c| c.is_ascii_hexdigit() || c == '_')
            {
                self.pos += 1;
            }
            let digits: String = self.chars[digits_start..self.pos]
                .iter()
                .filter(|c| **c != '_')
                .collect();
            let value = i64::from_str_radix(&digits, 16)
                .map_err(|_| SyntaxError::new(self.line, "invalid hexadecimal literal"))?;
            self.push(Token::Int(value));
            return Ok(());
        }

        let mut is_float = false;
        self.digits();
        if self.peek(0) == Some('.')
            && !self
                .peek(1)
                .is_some_and(|c| c.is_alphabetic() || c == '_' || c == '.')
        {
            is_float = true;
            self.pos += 1;
            self.digits();
        }
        if matches!(self.peek(0), Some('e' | 'E')) {
            let exponent_digit = match self.peek(1) {
                Some('+' | '-') => self.peek(2).is_some_and(|c| c.is_ascii_digit()),
                Some(c) => c.is_ascii_digit(),
                None => false,
            };
            if exponent_digit {
                is_float = true;
                self.pos += 2;
                self.digits();
            }
        }

        let text: String = self.chars[start..self.pos]
            .iter()
            .filter(|c| **c != '_')
            .collect();
        let token = if is_float {
            text.parse::<f64>()
                .map(Token::Float)
                .map_err(|_| SyntaxError::new(self.line, format!("invalid number `{text}`")))?
        } else {
            text.parse::<i64>().map(Token::Int).map_err(|_| {
                SyntaxError::new(self.line, format!("integer literal `{text}` is too large"))
            })?
        };
        self.push(token);
        Ok(())
    }

    fn digits(&mut self) {
        while self
            .peek(0)
            .is_some_and(|c| c.is_ascii_digit() || c == '_')
        {
            self.pos += 1;
        }
    }

    fn string(&mut self, prefix: Prefix) -> Result<(), SyntaxError> {
        let quote = self.chars[self.pos];
        let triple = self.peek(1) == Some(quote) && self.peek(2) == Some(quote);
        let start_line = self.line;
        self.pos += if triple { 3 } else { 1 };

        let mut body = String::new();
        loop {
            let Some(c) = self.peek(0) else {
                return Err(SyntaxError::new(start_line, "unterminated string literal"));
            };
            if c == quote {
                if !triple {
                    self.pos += 1;
                    break;
                }
                if self.peek(1) == Some(quote) && self.peek(2) == Some(quote) {
                    self.pos += 3;
                    break;
                }
            }
            match c {
                '\n' if !triple => {
                    return Err(SyntaxError::new(start_line, "unterminated string literal"));
                }
                '\n' => self.line += 1,
                '\\' => {
                    body.push('\\');
                    self.pos += 1;
                    let Some(escaped) = self.peek(0) else { continue };
                    if escaped == '\n' {
                        self.line += 1;
                    }
                    body.push(escaped);
                    self.pos += 1;
                    continue;
                }
                _ => {}
            }
            body.push(c);
            self.pos += 1;
        }

        let token = if prefix.format {
            Token::FStr(split_fstring(&body, prefix.raw, start_line)?)
        } else if prefix.raw {
            Token::Str(body)
        } else {
            Token::Str(unescape(&body))
        };
        self.tokens.push(Spanned {
            token,
            line: start_line,
        });
        Ok(())
    }

    fn operator(&mut self) -> Result<(), SyntaxError> {
        let rest = &self.chars[self.pos..];
        let Some(op) = OPERATORS.iter().copied().find(|op| {
            op.chars().count() <= rest.len() && op.chars().zip(rest).all(|(a, b)| a == *b)
        }) else {
            return Err(SyntaxError::new(
                self.line,
                format!("invalid character `{}`", self.chars[self.pos]),
            ));
        };

        match op {
            "(" | "[" | "{" => {
                if self.depth == 0 {
                    self.bracket_line = self.line;
                }
                self.depth += 1;
            }
            ")" | "]" | "}" => self.depth = self.depth.saturating_sub(1),
            _ => {}
        }
        self.pos += op.len();
        self.push(Token::Op(op));
        Ok(())
    }
}

/// Resolves backslash escapes.
pub(crate) fn unescape(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('t') => out.push('\t'),
            Some('r') => out.push('\r'),
            Some('0') => out.push('\0'),
            Some('\\') => out.push('\\'),
            Some('\'') => out.push('\''),
            Some('"') => out.push('"'),
            Some('\n') => {}
            Some(kind @ ('x' | 'u')) => {
                let width = if kind == 'x' { 2 } else { 4 };
                let digits: String = chars.by_ref().take(width).collect();
                match u32::from_str_radix(&digits, 16)
                    .ok()
                    .and_then(char::from_u32)
                {
                    Some(decoded) => out.push(decoded),
                    None => {
                        out.push('\\');
                        out.push(kind);
                        out.push_str(&digits);
                    }
                }
            }
            Some(other) => {
                out.push('\\');
                out.push(other);
            }
            None => out.push('\\'),
        }
    }
    out
}

fn split_fstring(body: &str, raw: bool, line: usize) -> Result<Vec<RawSegment>, SyntaxError> {
    let chars: Vec<char> = body.chars().collect();
    let mut segments = Vec::new();
    let mut literal = String::new();
    let mut i = 0;

    let flush = |literal: &mut String, segments: &mut Vec<RawSegment>| {
        if !literal.is_empty() {
            let text = if raw {
                std::mem::take(literal)
            } else {
                unescape(&std::mem::take(literal))
            };
            segments.push(RawSegment::Literal(text));
        }
    };

    while i < chars.len() {
        match chars[i] {
            '{' if chars.get(i + 1) == Some(&'{') => {
                literal.push('{');
                i += 2;
            }
            '}' if chars.get(i + 1) == Some(&'}') => {
                literal.push('}');
                i += 2;
            }
            '}' => return Err(SyntaxError::new(line, "f-string: single '}' is not allowed")),
            '{' => {
                flush(&mut literal, &mut segments);
                i += 1;
                let mut source = String::new();
                let mut spec = None;
                let mut repr = false;
                let mut depth = 0usize;
                let mut quote: Option<char> = None;
                loop {
                    let Some(&c) = chars.get(i) else {
                        return Err(SyntaxError::new(line, "f-string: expecting '}'"));
                    };
                    if let Some(open) = quote {
                        source.push(c);
                        if c == open {
                            quote = None;
                        }
                        i += 1;
                        continue;
                    }
                    match c {
                        '\'' | '"' => {
                            quote = Some(c);
                            source.push(c);
                        }
                        '(' | '[' | '{' => {
                            depth += 1;
                            source.push(c);
                        }
                        ')' | ']' => {
                            depth = depth.saturating_sub(1);
                            source.push(c);
                        }
                        '}' if depth > 0 => {
                            depth -= 1;
                            source.push(c);
                        }
                        '}' => {
                            i += 1;
                            break;
                        }
                        '!' if depth == 0
                            && matches!(chars.get(i + 1), Some('r' | 's' | 'a'))
                            && matches!(chars.get(i + 2), Some(':' | '}')) =>
                        {
                            repr = chars[i + 1] != 's';
                            i += 2;
                            continue;
                        }
                        ':' if depth == 0 => {
                            i += 1;
                            let mut format = String::new();
                            while let Some(&c) = chars.get(i) {
                                if c == '}' {
                                    break;
                                }
                                format.push(c);
                                i += 1;
                            }
                            spec = Some(format);
                            continue;
                        }
                        _ => source.push(c),
                    }
                    i += 1;
                }
                if source.trim().is_empty() {
                    return Err(SyntaxError::new(
                        line,
                        "f-string: empty expression not allowed",
                    ));
                }
                segments.push(RawSegment::Field { source, spec, repr });
            }
            c => {
                literal.push(c);
                i += 1;
            }
        }
    }
    flush(&mut literal, &mut segments);
    Ok(segments)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(source: &str) -> Vec<Token> {
        tokenize(source)
            .unwrap()
            .into_iter()
            .map(|spanned| spanned.token)
            .collect()
    }

    #[test]
    fn emits_indent_and_dedent() {
        let tokens = kinds("if x:\n    y = 1\nz\n");
        assert_eq!(
            tokens,
            vec![
                Token::Name("if".into()),
                Token::Name("x".into()),
                Token::Op(":"),
                Token::Newline,
                Token::Indent,
                Token::Name("y".into()),
                Token::Op("="),
                Token::Int(1),
                Token::Newline,
                Token::Dedent,
                Token::Name("z".into()),
                Token::Newline,
                Token::Eof,
            ]
        );
    }

    #[test]
    fn newlines_inside_brackets_are_ignored() {
        let tokens = kinds("f(1,\n  2)\n");
        assert!(!tokens[..tokens.len() - 2].contains(&Token::Newline));
    }

    #[test]
    fn blank_and_comment_lines_do_not_change_indentation() {
        let tokens = kinds("for i in x:\n\n    # note\n    y\n");
        assert_eq!(tokens.iter().filter(|t| **t == Token::Indent).count(), 1);
    }

    #[test]
    fn numbers_and_strings() {
        let tokens = kinds("1_000 2.5 1e3 0x1f 'a\\n' r'a\\n' \"\"\"x\ny\"\"\"");
        assert_eq!(
            &tokens[..7],
            &[
                Token::Int(1000),
                Token::Float(2.5),
                Token::Float(1000.0),
                Token::Int(31),
                Token::Str("a\n".into()),
                Token::Str("a\\n".into()),
                Token::Str("x\ny".into()),
            ]
        );
    }

    #[test]
    fn fstrings_split_into_fields() {
        let tokens = kinds("f'total: {a + b:.2f} {{ok}} {name!r}'");
        assert_eq!(
            tokens[0],
            Token::FStr(vec![
                RawSegment::Literal("total: ".into()),
                RawSegment::Field {
                    source: "a + b".into(),
                    spec: Some(".2f".into()),
                    repr: false,
                },
                RawSegment::Literal(" {ok} ".into()),
                RawSegment::Field {
                    source: "name".into(),
                    spec: None,
                    repr: true,
                },
            ])
        );
    }

    #[test]
    fn inconsistent_dedent_is_an_error() {
        let err = tokenize("if x:\n    y\n  z\n").unwrap_err();
        assert_eq!(err.line, 3);
    }

    #[test]
    fn unterminated_string_reports_line() {
        let err = tokenize("x = 1\ny = 'abc\n").unwrap_err();
        assert_eq!(err.line, 2);
        assert!(err.message.contains("unterminated"));
    }
}
