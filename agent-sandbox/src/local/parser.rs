//! Recursive-descent parser producing [`Program`]s.

use std::sync::Arc;

use super::ast::{
    BinOp, CmpOp, Comprehension, Expr, FSegment, FunctionDef, Param, Program, Stmt, StmtKind,
    Target, UnaryOp,
};
use super::lexer::{RawSegment, Spanned, SyntaxError, Token, tokenize};

const KEYWORDS: [&str; 35] = [
    "False", "None", "True", "and", "as", "assert", "async", "await", "break", "class",
    "continue", "def", "del", "elif", "else", "except", "finally", "for", "from", "global", "if",
    "import", "in", "is", "lambda", "nonlocal", "not", "or", "pass", "raise", "return", "try",
    "while", "with", "yield",
];

const UNSUPPORTED: [&str; 12] = [
    "class", "try", "except", "finally", "with", "raise", "del", "global", "nonlocal", "yield",
    "async", "await",
];

/// Nested blocks and parenthesised expressions allowed in one block.
const MAX_NESTING_DEPTH: usize = 100;

/// Height of an expression tree, counting nesting and chained operators
/// such as `a + b + c`.
const MAX_EXPRESSION_HEIGHT: usize = 200;

type ParseResult<T> = Result<T, SyntaxError>;

/// Parses a full code block.
pub(crate) fn parse(source: &str) -> ParseResult<Program> {
    let tokens = tokenize(source)?;
    let mut parser = Parser {
        tokens,
        pos: 0,
        depth: 0,
        height: 0,
        lines: source.lines().collect(),
    };
    parser.program()
}

fn parse_field(source: &str, line: usize, depth: usize) -> ParseResult<Expr> {
    let tokens = tokenize(source.trim()).map_err(|err| SyntaxError::new(line, err.message))?;
    let mut parser = Parser {
        tokens,
        pos: 0,
        depth,
        height: depth,
        lines: Vec::new(),
    };
    let expr = parser
        .tuple_expr()
        .map_err(|err| SyntaxError::new(line, format!("f-string: {}", err.message)))?;
    if !matches!(parser.peek(), Token::Newline | Token::Eof) {
        return Err(SyntaxError::new(line, "f-string: invalid expression"));
    }
    Ok(expr)
}

fn is_keyword(word: &str) -> bool {
    KEYWORDS.contains(&word)
}

fn describe(token: &Token) -> String {
    match token {
        Token::Name(name) => format!("`{name}`"),
        Token::Int(value) => format!("`{value}`"),
        Token::Float(value) => format!("`{value}`"),
        Token::Str(_) | Token::FStr(_) => "string literal".to_owned(),
        Token::Op(op) => format!("`{op}`"),
        Token::Newline => "end of line".to_owned(),
        Token::Indent => "indent".to_owned(),
        Token::Dedent => "dedent".to_owned(),
        Token::Eof => "end of input".to_owned(),
    }
}

fn augmented(op: &str) -> Option<BinOp> {
    Some(match op {
        "+=" => BinOp::Add,
        "-=" => BinOp::Sub,
        "*=" => BinOp::Mul,
        "/=" => BinOp::Div,
        "//=" => BinOp::FloorDiv,
        "%=" => BinOp::Mod,
        "**=" => BinOp::Pow,
        _ => return None,
    })
}

struct Parser<'s> {
    tokens: Vec<Spanned>,
    pos: usize,
    depth: usize,
    height: usize,
    lines: Vec<&'s str>,
}

impl Parser<'_> {
    fn peek(&self) -> &Token {
        &self.tokens[self.pos].token
    }

    fn peek_at(&self, offset: usize) -> &Token {
        let index = (self.pos + offset).min(self.tokens.len() - 1);
        &self.tokens[index].token
    }

    fn line(&self) -> usize {
        self.tokens[self.pos].line
    }

    fn advance(&mut self) -> Token {
        let token = self.tokens[self.pos].token.clone();
        if self.pos < self.tokens.len() - 1 {
            self.pos += 1;
        }
        token
    }

    fn error(&self, message: impl Into<String>) -> SyntaxError {
        SyntaxError::new(self.line(), message)
    }

    /// Runs `parse` one nesting level deeper.
    fn nested<T>(&mut self, parse: impl FnOnce(&mut Self) -> ParseResult<T>) -> ParseResult<T> {
        if self.depth >= MAX_NESTING_DEPTH {
            return Err(self.error("too many nested blocks or parentheses"));
        }
        self.depth += 1;
        self.height += 1;
        let result = parse(self);
        self.depth -= 1;
        self.height -= 1;
        result
    }

    /// Accounts for one more operator in a chain. Callers restore `height`
    /// once the chain is complete.
    fn link(&mut self) -> ParseResult<()> {
        self.height += 1;
        if self.height > MAX_EXPRESSION_HEIGHT {
            return Err(self.error("expression is too long"));
        }
        Ok(())
    }

    fn unexpected(&self) -> SyntaxError {
        self.error(format!("invalid syntax near {}", describe(self.peek())))
    }

    fn is_op(&self, op: &str) -> bool {
        matches!(self.peek(), Token::Op(found) if *found == op)
    }

    fn eat_op(&mut self, op: &str) -> bool {
        let found = self.is_op(op);
        if found {
            self.advance();
        }
        found
    }

    fn expect_op(&mut self, op: &str) -> ParseResult<()> {
        if self.eat_op(op) {
            Ok(())
        } else {
            Err(self.error(format!(
                "expected `{op}`, found {}",
                describe(self.peek())
            )))
        }
    }

    fn is_keyword(&self, keyword: &str) -> bool {
        matches!(self.peek(), Token::Name(name) if name == keyword)
    }

    fn eat_keyword(&mut self, keyword: &str) -> bool {
        let found = self.is_keyword(keyword);
        if found {
            self.advance();
        }
        found
    }

    fn expect_keyword(&mut self, keyword: &str) -> ParseResult<()> {
        if self.eat_keyword(keyword) {
            Ok(())
        } else {
            Err(self.error(format!(
                "expected `{keyword}`, found {}",
                describe(self.peek())
            )))
        }
    }

    fn expect_name(&mut self) -> ParseResult<String> {
        match self.peek() {
            Token::Name(name) if !is_keyword(name) => {
                let name = name.clone();
                self.advance();
                Ok(name)
            }
            other => Err(self.error(format!("expected a name, found {}", describe(other)))),
        }
    }

    fn dotted_name(&mut self) -> ParseResult<String> {
        let mut name = self.expect_name()?;
        while self.eat_op(".") {
            name.push('.');
            name.push_str(&self.expect_name()?);
        }
        Ok(name)
    }

    fn program(&mut self) -> ParseResult<Program> {
        let mut body = Vec::new();
        loop {
            match self.peek() {
                Token::Eof => break,
                Token::Newline => {
                    self.advance();
                }
                Token::Indent => return Err(self.error("unexpected indent")),
                _ => body.extend(self.statement()?),
            }
        }
        Ok(Program { body })
    }

    fn statement(&mut self) -> ParseResult<Vec<Stmt>> {
        self.nested(Self::compound_or_simple)
    }

    fn compound_or_simple(&mut self) -> ParseResult<Vec<Stmt>> {
        if let Token::Name(word) = self.peek().clone() {
            match word.as_str() {
                "if" => return Ok(vec![self.if_statement()?]),
                "for" => return Ok(vec![self.for_statement()?]),
                "while" => return Ok(vec![self.while_statement()?]),
                "def" => return Ok(vec![self.function_def()?]),
                word if UNSUPPORTED.contains(&word) => {
                    return Err(self.error(format!("`{word}` statements are not supported")));
                }
                _ => {}
            }
        }
        self.simple_statements()
    }

    fn simple_statements(&mut self) -> ParseResult<Vec<Stmt>> {
        let mut statements = self.simple_statement()?;
        while self.eat_op(";") {
            if matches!(self.peek(), Token::Newline | Token::Eof) {
                break;
            }
            statements.extend(self.simple_statement()?);
        }
        match self.peek() {
            Token::Newline => {
                self.advance();
                Ok(statements)
            }
            Token::Eof | Token::Dedent => Ok(statements),
            _ => Err(self.unexpected()),
        }
    }

    fn simple_statement(&mut self) -> ParseResult<Vec<Stmt>> {
        let line = self.line();
        let stmt = |kind| Stmt { line, kind };
        let Token::Name(word) = self.peek().clone() else {
            return Ok(vec![stmt(self.expression_statement()?)]);
        };

        let kind = match word.as_str() {
            "pass" => {
                self.advance();
                StmtKind::Pass
            }
            "break" => {
                self.advance();
                StmtKind::Break
            }
            "continue" => {
                self.advance();
                StmtKind::Continue
            }
            "return" => {
                self.advance();
                if matches!(self.peek(), Token::Newline | Token::Eof | Token::Op(";")) {
                    StmtKind::Return(None)
                } else {
                    StmtKind::Return(Some(self.tuple_expr()?))
                }
            }
            "assert" => {
                self.advance();
                let cond = self.test()?;
                let message = if self.eat_op(",") {
                    Some(self.test()?)
                } else {
                    None
                };
                StmtKind::Assert { cond, message }
            }
            "import" => {
                self.advance();
                let mut imports = Vec::new();
                loop {
                    let module = self.dotted_name()?;
                    let alias = if self.eat_keyword("as") {
                        Some(self.expect_name()?)
                    } else {
                        None
                    };
                    imports.push(stmt(StmtKind::Import { module, alias }));
                    if !self.eat_op(",") {
                        break;
                    }
                }
                return Ok(imports);
            }
            "from" => {
                self.advance();
                let module = self.dotted_name()?;
                self.expect_keyword("import")?;
                if self.is_op("*") {
                    return Err(self.error("wildcard imports are not supported"));
                }
                let parenthesized = self.eat_op("(");
                let mut names = Vec::new();
                loop {
                    let name = self.expect_name()?;
                    let alias = if self.eat_keyword("as") {
                        Some(self.expect_name()?)
                    } else {
                        None
                    };
                    names.push((name, alias));
                    if !self.eat_op(",") || (parenthesized && self.is_op(")")) {
                        break;
                    }
                }
                if parenthesized {
                    self.expect_op(")")?;
                }
                StmtKind::FromImport { module, names }
            }
            word if UNSUPPORTED.contains(&word) => {
                return Err(self.error(format!("`{word}` statements are not supported")));
            }
            _ => self.expression_statement()?,
        };
        Ok(vec![stmt(kind)])
    }

    fn expression_statement(&mut self) -> ParseResult<StmtKind> {
        let first = self.tuple_expr()?;

        if let Token::Op(op) = self.peek()
            && let Some(op) = augmented(op)
        {
            self.advance();
            let target = self.to_target(first)?;
            if matches!(target, Target::Unpack(_)) {
                return Err(self.error("illegal expression for augmented assignment"));
            }
            let value = self.tuple_expr()?;
            return Ok(StmtKind::AugAssign { target, op, value });
        }

        if self.is_op("=") {
            let mut exprs = vec![first];
            while self.eat_op("=") {
                exprs.push(self.tuple_expr()?);
            }
            let value = exprs.pop().ok_or_else(|| self.unexpected())?;
            let targets = exprs
                .into_iter()
                .map(|expr| self.to_target(expr))
                .collect::<ParseResult<Vec<_>>>()?;
            return Ok(StmtKind::Assign { targets, value });
        }

        // Annotated assignment: the annotation is parsed and ignored.
        if matches!(first, Expr::Name(_)) && self.eat_op(":") {
            self.test()?;
            if self.eat_op("=") {
                let value = self.tuple_expr()?;
                let target = self.to_target(first)?;
                return Ok(StmtKind::Assign {
                    targets: vec![target],
                    value,
                });
            }
            return Ok(StmtKind::Pass);
        }

        Ok(StmtKind::Expr(first))
    }

    fn to_target(&self, expr: Expr) -> ParseResult<Target> {
        match expr {
            Expr::Name(name) => Ok(Target::Name(name)),
            Expr::Index { obj, index } => Ok(Target::Index { obj, index }),
            Expr::List(items) => items
                .into_iter()
                .map(|item| self.to_target(item))
                .collect::<ParseResult<Vec<_>>>()
                .map(Target::Unpack),
            Expr::Attribute { .. } => Err(self.error("attribute assignment is not supported")),
            Expr::Slice { .. } => Err(self.error("slice assignment is not supported")),
            _ => Err(self.error("cannot assign to expression")),
        }
    }

    fn block(&mut self) -> ParseResult<Vec<Stmt>> {
        self.expect_op(":")?;
        if !matches!(self.peek(), Token::Newline) {
            return self.simple_statements();
        }
        self.advance();
        if !matches!(self.peek(), Token::Indent) {
            return Err(self.error("expected an indented block"));
        }
        self.advance();

        let mut body = Vec::new();
        loop {
            match self.peek() {
                Token::Dedent => {
                    self.advance();
                    break;
                }
                Token::Eof => break,
                Token::Newline => {
                    self.advance();
                }
                _ => body.extend(self.statement()?),
            }
        }
        Ok(body)
    }

    fn if_statement(&mut self) -> ParseResult<Stmt> {
        let line = self.line();
        self.advance();
        let cond = self.test()?;
        let mut branches = vec![(cond, self.block()?)];
        let mut orelse = Vec::new();
        loop {
            if self.eat_keyword("elif") {
                let cond = self.test()?;
                branches.push((cond, self.block()?));
            } else if self.eat_keyword("else") {
                orelse = self.block()?;
                break;
            } else {
                break;
            }
        }
        Ok(Stmt {
            line,
            kind: StmtKind::If { branches, orelse },
        })
    }

    fn for_statement(&mut self) -> ParseResult<Stmt> {
        let line = self.line();
        self.advance();
        let target = self.target_list()?;
        self.expect_keyword("in")?;
        let iter = self.tuple_expr()?;
        let body = self.block()?;
        Ok(Stmt {
            line,
            kind: StmtKind::For { target, iter, body },
        })
    }

    fn while_statement(&mut self) -> ParseResult<Stmt> {
        let line = self.line();
        self.advance();
        let cond = self.test()?;
        let body = self.block()?;
        Ok(Stmt {
            line,
            kind: StmtKind::While { cond, body },
        })
    }

    fn function_def(&mut self) -> ParseResult<Stmt> {
        let line = self.line();
        self.advance();
        let name = self.expect_name()?;
        self.expect_op("(")?;
        let mut params: Vec<Param> = Vec::new();
        while !self.eat_op(")") {
            if self.is_op("*") || self.is_op("**") {
                return Err(self.error("variadic parameters are not supported"));
            }
            let param = self.expect_name()?;
            if self.eat_op(":") {
                self.test()?;
            }
            let default = if self.eat_op("=") {
                Some(self.test()?)
            } else {
                None
            };
            if default.is_none() && params.iter().any(|p| p.default.is_some()) {
                return Err(self.error("non-default argument follows default argument"));
            }
            params.push(Param {
                name: param,
                default,
            });
            if !self.eat_op(",") {
                self.expect_op(")")?;
                break;
            }
        }
        if self.eat_op("->") {
            self.test()?;
        }
        let body = self.block()?;
        let source = self.source_between(line, self.last_consumed_line());
        Ok(Stmt {
            line,
            kind: StmtKind::FunctionDef(Arc::new(FunctionDef {
                name,
                params,
                body,
                source,
            })),
        })
    }

    fn last_consumed_line(&self) -> usize {
        self.tokens[..self.pos]
            .iter()
            .rev()
            .find(|spanned| !matches!(spanned.token, Token::Dedent | Token::Indent))
            .map_or(1, |spanned| spanned.line)
    }

    fn source_between(&self, start: usize, end: usize) -> String {
        let end = end.min(self.lines.len());
        let Some(lines) = self.lines.get(start.saturating_sub(1)..end) else {
            return String::new();
        };
        let indent = lines
            .first()
            .map_or(0, |first| first.len() - first.trim_start().len());
        lines
            .iter()
            .map(|line| line.get(indent..).unwrap_or_else(|| line.trim_start()))
            .collect::<Vec<_>>()
            .join("\n")
    }

    fn tuple_expr(&mut self) -> ParseResult<Expr> {
        let first = self.test()?;
        if !self.is_op(",") {
            return Ok(first);
        }
        let mut items = vec![first];
        while self.eat_op(",") {
            if self.at_tuple_end() {
                break;
            }
            items.push(self.test()?);
        }
        Ok(Expr::List(items))
    }

    fn at_tuple_end(&self) -> bool {
        match self.peek() {
            Token::Newline | Token::Eof => true,
            Token::Op(op) => matches!(*op, "=" | ")" | "]" | "}" | ";" | ":") || augmented(op).is_some(),
            _ => false,
        }
    }

    fn test(&mut self) -> ParseResult<Expr> {
        self.nested(Self::conditional)
    }

    fn conditional(&mut self) -> ParseResult<Expr> {
        if self.is_keyword("lambda") {
            return Err(self.error("lambda expressions are not supported"));
        }
        let body = self.or_test()?;
        if !self.eat_keyword("if") {
            return Ok(body);
        }
        let cond = self.or_test()?;
        self.expect_keyword("else")?;
        let orelse = self.test()?;
        Ok(Expr::IfElse {
            cond: Box::new(cond),
            then: Box::new(body),
            orelse: Box::new(orelse),
        })
    }

    fn or_test(&mut self) -> ParseResult<Expr> {
        let mut left = self.and_test()?;
        let base = self.height;
        while self.eat_keyword("or") {
            self.link()?;
            let right = self.and_test()?;
            left = Expr::Or(Box::new(left), Box::new(right));
        }
        self.height = base;
        Ok(left)
    }

    fn and_test(&mut self) -> ParseResult<Expr> {
        let mut left = self.not_test()?;
        let base = self.height;
        while self.eat_keyword("and") {
            self.link()?;
            let right = self.not_test()?;
            left = Expr::And(Box::new(left), Box::new(right));
        }
        self.height = base;
        Ok(left)
    }

    fn not_test(&mut self) -> ParseResult<Expr> {
        if self.eat_keyword("not") {
            let operand = self.nested(Self::not_test)?;
            return Ok(Expr::Unary {
                op: UnaryOp::Not,
                operand: Box::new(operand),
            });
        }
        self.comparison()
    }

    fn comparison(&mut self) -> ParseResult<Expr> {
        let first = self.arith()?;
        let mut rest = Vec::new();
        loop {
            let (op, width) = match self.peek() {
                Token::Op("==") => (CmpOp::Eq, 1),
                Token::Op("!=") => (CmpOp::NotEq, 1),
                Token::Op("<") => (CmpOp::Lt, 1),
                Token::Op("<=") => (CmpOp::LtE, 1),
                Token::Op(">") => (CmpOp::Gt, 1),
                Token::Op(">=") => (CmpOp::GtE, 1),
                Token::Name(word) if word == "in" => (CmpOp::In, 1),
                Token::Name(word)
                    if word == "not" && matches!(self.peek_at(1), Token::Name(next) if next == "in") =>
                {
                    (CmpOp::NotIn, 2)
                }
                Token::Name(word) if word == "is" => {
                    if matches!(self.peek_at(1), Token::Name(next) if next == "not") {
                        (CmpOp::IsNot, 2)
                    } else {
                        (CmpOp::Is, 1)
                    }
                }
                _ => break,
            };
            for _ in 0..width {
                self.advance();
            }
            rest.push((op, self.arith()?));
        }

        if rest.is_empty() {
            Ok(first)
        } else {
            Ok(Expr::Compare {
                first: Box::new(first),
                rest,
            })
        }
    }

    fn arith(&mut self) -> ParseResult<Expr> {
        let mut left = self.term()?;
        let base = self.height;
        loop {
            let op = match self.peek() {
                Token::Op("+") => BinOp::Add,
                Token::Op("-") => BinOp::Sub,
                _ => break,
            };
            self.advance();
            self.link()?;
            let right = self.term()?;
            left = Expr::Binary {
                op,
                left: Box::new(left),
                right: Box::new(right),
            };
        }
        self.height = base;
        Ok(left)
    }

    fn term(&mut self) -> ParseResult<Expr> {
        let mut left = self.factor()?;
        let base = self.height;
        loop {
            let op = match self.peek() {
                Token::Op("*") => BinOp::Mul,
                Token::Op("/") => BinOp::Div,
                Token::Op("//") => BinOp::FloorDiv,
                Token::Op("%") => BinOp::Mod,
                _ => break,
            };
            self.advance();
            self.link()?;
            let right = self.factor()?;
            left = Expr::Binary {
                op,
                left: Box::new(left),
                right: Box::new(right),
            };
        }
        self.height = base;
        Ok(left)
    }

    fn factor(&mut self) -> ParseResult<Expr> {
        let op = match self.peek() {
            Token::Op("-") => UnaryOp::Neg,
            Token::Op("+") => UnaryOp::Pos,
            _ => return self.power(),
        };
        self.advance();
        let operand = self.nested(Self::factor)?;
        Ok(Expr::Unary {
            op,
            operand: Box::new(operand),
        })
    }

    fn power(&mut self) -> ParseResult<Expr> {
        let base = self.primary()?;
        if !self.eat_op("**") {
            return Ok(base);
        }
        let exponent = self.factor()?;
        Ok(Expr::Binary {
            op: BinOp::Pow,
            left: Box::new(base),
            right: Box::new(exponent),
        })
    }

    fn primary(&mut self) -> ParseResult<Expr> {
        let mut expr = self.atom()?;
        let base = self.height;
        loop {
            if matches!(self.peek(), Token::Op("(" | "[" | ".")) {
                self.link()?;
            }
            if self.eat_op("(") {
                let (args, kwargs) = self.call_arguments()?;
                expr = Expr::Call {
                    func: Box::new(expr),
                    args,
                    kwargs,
                };
            } else if self.eat_op("[") {
                expr = self.subscript(expr)?;
            } else if self.eat_op(".") {
                let name = self.expect_name()?;
                expr = Expr::Attribute {
                    obj: Box::new(expr),
                    name,
                };
            } else {
                self.height = base;
                return Ok(expr);
            }
        }
    }

    fn call_arguments(&mut self) -> ParseResult<(Vec<Expr>, Vec<(String, Expr)>)> {
        let mut args = Vec::new();
        let mut kwargs: Vec<(String, Expr)> = Vec::new();
        if self.eat_op(")") {
            return Ok((args, kwargs));
        }
        loop {
            if self.is_op("*") || self.is_op("**") {
                return Err(self.error("argument unpacking is not supported"));
            }
            if let Token::Name(name) = self.peek()
                && matches!(self.peek_at(1), Token::Op("="))
            {
                let name = name.clone();
                self.advance();
                self.advance();
                if kwargs.iter().any(|(existing, _)| *existing == name) {
                    return Err(self.error(format!("keyword argument repeated: {name}")));
                }
                kwargs.push((name, self.test()?));
            } else {
                if !kwargs.is_empty() {
                    return Err(self.error("positional argument follows keyword argument"));
                }
                let mut arg = self.test()?;
                if self.is_keyword("for") {
                    let clause = self.comprehension()?;
                    arg = Expr::ListComp {
                        element: Box::new(arg),
                        clause: Box::new(clause),
                    };
                }
                args.push(arg);
            }
            if self.eat_op(")") {
                break;
            }
            self.expect_op(",")?;
            if self.eat_op(")") {
                break;
            }
        }
        Ok((args, kwargs))
    }

    fn subscript(&mut self, obj: Expr) -> ParseResult<Expr> {
        let lower = if self.is_op(":") {
            None
        } else {
            Some(self.tuple_expr()?)
        };
        if !self.eat_op(":") {
            self.expect_op("]")?;
            let index = lower.ok_or_else(|| self.unexpected())?;
            return Ok(Expr::Index {
                obj: Box::new(obj),
                index: Box::new(index),
            });
        }

        let upper = if self.is_op(":") || self.is_op("]") {
            None
        } else {
            Some(self.test()?)
        };
        let step = if self.eat_op(":") && !self.is_op("]") {
            Some(self.test()?)
        } else {
            None
        };
        self.expect_op("]")?;
        Ok(Expr::Slice {
            obj: Box::new(obj),
            lower: lower.map(Box::new),
            upper: upper.map(Box::new),
            step: step.map(Box::new),
        })
    }

    fn comprehension(&mut self) -> ParseResult<Comprehension> {
        self.expect_keyword("for")?;
        let target = self.target_list()?;
        self.expect_keyword("in")?;
        let iter = self.or_test()?;
        let mut conditions = Vec::new();
        while self.eat_keyword("if") {
            conditions.push(self.or_test()?);
        }
        if self.is_keyword("for") {
            return Err(self.error("nested comprehension clauses are not supported"));
        }
        Ok(Comprehension {
            target,
            iter,
            conditions,
        })
    }

    fn target_list(&mut self) -> ParseResult<Target> {
        let first = self.arith()?;
        if !self.is_op(",") {
            return self.to_target(first);
        }
        let mut items = vec![first];
        while self.eat_op(",") {
            if self.is_keyword("in") {
                break;
            }
            items.push(self.arith()?);
        }
        self.to_target(Expr::List(items))
    }

    fn atom(&mut self) -> ParseResult<Expr> {
        let line = self.line();
        match self.advance() {
            Token::Int(value) => Ok(Expr::Int(value)),
            Token::Float(value) => Ok(Expr::Float(value)),
            Token::Str(text) => self.strings(vec![RawSegment::Literal(text)], false, line),
            Token::FStr(segments) => self.strings(segments, true, line),
            Token::Name(name) => match name.as_str() {
                "True" => Ok(Expr::Bool(true)),
                "False" => Ok(Expr::Bool(false)),
                "None" => Ok(Expr::None),
                "lambda" => Err(SyntaxError::new(line, "lambda expressions are not supported")),
                word if is_keyword(word) => Err(SyntaxError::new(
                    line,
                    format!("invalid syntax near `{word}`"),
                )),
                _ => Ok(Expr::Name(name)),
            },
            Token::Op("(") => {
                if self.eat_op(")") {
                    return Ok(Expr::List(Vec::new()));
                }
                let first = self.test()?;
                if self.is_keyword("for") {
                    let clause = self.comprehension()?;
                    self.expect_op(")")?;
                    return Ok(Expr::ListComp {
                        element: Box::new(first),
                        clause: Box::new(clause),
                    });
                }
                if !self.is_op(",") {
                    self.expect_op(")")?;
                    return Ok(first);
                }
                let items = self.sequence(first, ")")?;
                Ok(Expr::List(items))
            }
            Token::Op("[") => {
                if self.eat_op("]") {
                    return Ok(Expr::List(Vec::new()));
                }
                let first = self.test()?;
                if self.is_keyword("for") {
                    let clause = self.comprehension()?;
                    self.expect_op("]")?;
                    return Ok(Expr::ListComp {
                        element: Box::new(first),
                        clause: Box::new(clause),
                    });
                }
                Ok(Expr::List(self.sequence(first, "]")?))
            }
            Token::Op("{") => self.braces(),
            other => Err(SyntaxError::new(
                line,
                format!("invalid syntax near {}", describe(&other)),
            )),
        }
    }

    /// Parses the remainder of a comma-separated sequence whose first item
    /// has been read, consuming the closing bracket.
    fn sequence(&mut self, first: Expr, close: &str) -> ParseResult<Vec<Expr>> {
        let mut items = vec![first];
        while self.eat_op(",") {
            if self.is_op(close) {
                break;
            }
            items.push(self.test()?);
        }
        self.expect_op(close)?;
        Ok(items)
    }

    fn braces(&mut self) -> ParseResult<Expr> {
        if self.eat_op("}") {
            return Ok(Expr::Dict(Vec::new()));
        }
        let first = self.test()?;
        if !self.eat_op(":") {
            // Set literal: deduplicated list.
            let items = self.sequence(first, "}")?;
            return Ok(Expr::Call {
                func: Box::new(Expr::Name("set".to_owned())),
                args: vec![Expr::List(items)],
                kwargs: Vec::new(),
            });
        }

        let value = self.test()?;
        if self.is_keyword("for") {
            let clause = self.comprehension()?;
            self.expect_op("}")?;
            return Ok(Expr::DictComp {
                key: Box::new(first),
                value: Box::new(value),
                clause: Box::new(clause),
            });
        }

        let mut entries = vec![(first, value)];
        while self.eat_op(",") {
            if self.is_op("}") {
                break;
            }
            let key = self.test()?;
            self.expect_op(":")?;
            entries.push((key, self.test()?));
        }
        self.expect_op("}")?;
        Ok(Expr::Dict(entries))
    }

    /// Joins adjacent string literals into one expression.
    fn strings(
        &mut self,
        mut raw: Vec<RawSegment>,
        mut formatted: bool,
        line: usize,
    ) -> ParseResult<Expr> {
        loop {
            match self.peek() {
                Token::Str(text) => {
                    raw.push(RawSegment::Literal(text.clone()));
                }
                Token::FStr(segments) => {
                    raw.extend(segments.iter().cloned());
                    formatted = true;
                }
                _ => break,
            }
            self.advance();
        }

        if !formatted {
            let text = raw
                .into_iter()
                .map(|segment| match segment {
                    RawSegment::Literal(text) => text,
                    RawSegment::Field { source, .. } => source,
                })
                .collect();
            return Ok(Expr::Str(text));
        }

        let segments = raw
            .into_iter()
            .map(|segment| match segment {
                RawSegment::Literal(text) => Ok(FSegment::Literal(text)),
                RawSegment::Field { source, spec, repr } => Ok(FSegment::Value {
                    expr: parse_field(&source, line, self.depth + 1)?,
                    spec,
                    repr,
                }),
            })
            .collect::<ParseResult<Vec<_>>>()?;
        Ok(Expr::FString(segments))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn statements(source: &str) -> Vec<StmtKind> {
        parse(source)
            .unwrap()
            .body
            .into_iter()
            .map(|stmt| stmt.kind)
            .collect()
    }

    #[test]
    fn precedence_follows_python() {
        let body = statements("x = 1 + 2 * 3 ** 2\n");
        let StmtKind::Assign { value, .. } = &body[0] else {
            panic!("expected assignment");
        };
        let Expr::Binary { op: BinOp::Add, right, .. } = value else {
            panic!("expected addition at the root: {value:?}");
        };
        assert!(matches!(**right, Expr::Binary { op: BinOp::Mul, .. }));
    }

    #[test]
    fn tuple_unpacking_targets() {
        let body = statements("a, b = 1, 2\n");
        assert!(matches!(
            &body[0],
            StmtKind::Assign { targets, .. } if matches!(&targets[0], Target::Unpack(items) if items.len() == 2)
        ));
    }

    #[test]
    fn nested_blocks_and_elif() {
        let body = statements(
            "for i in range(3):\n    if i == 0:\n        pass\n    elif i == 1:\n        continue\n    else:\n        break\nprint(i)\n",
        );
        assert_eq!(body.len(), 2);
        let StmtKind::For { body: inner, .. } = &body[0] else {
            panic!("expected for loop");
        };
        assert!(matches!(&inner[0].kind, StmtKind::If { branches, orelse } if branches.len() == 2 && orelse.len() == 1));
    }

    #[test]
    fn calls_with_keywords_and_generators() {
        let body = statements("total = sum(x * 2 for x in values if x > 0)\nprint(a, sep='-')\n");
        assert!(matches!(
            &body[0],
            StmtKind::Assign { value: Expr::Call { args, .. }, .. } if matches!(args[0], Expr::ListComp { .. })
        ));
        assert!(matches!(
            &body[1],
            StmtKind::Expr(Expr::Call { kwargs, .. }) if kwargs[0].0 == "sep"
        ));
    }

    #[test]
    fn function_definitions_capture_source() {
        let source = "if True:\n    def double(x, factor=2):\n        return x * factor\nresult = double(4)\n";
        let body = statements(source);
        let StmtKind::If { branches, .. } = &body[0] else {
            panic!("expected if");
        };
        let StmtKind::FunctionDef(def) = &branches[0].1[0].kind else {
            panic!("expected def");
        };
        assert_eq!(def.name, "double");
        assert_eq!(def.params.len(), 2);
        assert_eq!(def.source, "def double(x, factor=2):\n    return x * factor");
    }

    #[test]
    fn slices_and_imports() {
        let body = statements("from math import sqrt as root, pi\nimport json\ny = xs[1:-1:2]\n");
        assert!(matches!(&body[0], StmtKind::FromImport { names, .. } if names.len() == 2));
        assert!(matches!(&body[1], StmtKind::Import { module, alias: None } if module == "json"));
        assert!(matches!(
            &body[2],
            StmtKind::Assign { value: Expr::Slice { step: Some(_), .. }, .. }
        ));
    }

    #[test]
    fn unsupported_statements_are_reported() {
        let err = parse("try:\n    x = 1\nexcept Exception:\n    pass\n").unwrap_err();
        assert!(err.message.contains("`try` statements are not supported"));
    }

    #[test]
    fn deep_nesting_is_a_syntax_error() {
        let source = format!("{}1{}", "(".repeat(1_000), ")".repeat(1_000));
        let err = parse(&source).unwrap_err();
        assert!(err.message.contains("too many nested"));
        let source = format!("x = {}1", "not ".repeat(1_000));
        assert!(parse(&source).is_err());
        let source = format!("{}1{}", "(".repeat(50), ")".repeat(50));
        assert!(parse(&source).is_ok());

        let mut source = String::new();
        for level in 0..150 {
            source.push_str(&format!("{}if x:\n", "    ".repeat(level)));
        }
        source.push_str(&format!("{}pass\n", "    ".repeat(150)));
        assert!(parse(&source).unwrap_err().message.contains("too many nested"));
    }

    #[test]
    fn long_operator_chains_are_bounded() {
        let source = vec!["1"; 5_000].join(" + ");
        assert_eq!(parse(&source).unwrap_err().message, "expression is too long");
        let source = vec!["1"; 100].join(" + ");
        assert!(parse(&source).is_ok());
        let chain = vec!["x"; 60].join(" * ");
        let nested = format!("{chain} * ({chain} * ({chain} * ({chain})))");
        assert_eq!(parse(&nested).unwrap_err().message, "expression is too long");
        let calls = format!("x{}", "()".repeat(500));
        assert!(parse(&calls).is_err());
    }

    #[test]
    fn syntax_errors_carry_the_line() {
        let err = parse("x = 1\ny = (2 +\n").unwrap_err();
        assert_eq!(err.line, 2);
        let err = parse("x = = 2\n").unwrap_err();
        assert_eq!(err.line, 1);
    }
}
