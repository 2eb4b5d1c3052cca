//! Tree-walking evaluator for parsed programs.
//!
//! Evaluation is async so that capability calls can await the host and so
//! that long loops yield to the runtime, which lets the executor's timeout
//! fire. Recursive evaluation goes through boxed futures.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use agent_primitives::{CapabilityDescriptor, ErrorKind};
use futures::future::BoxFuture;
use serde_json::Map;
use tracing::debug;

use super::LocalConfig;
use super::ast::{
    Comprehension, Expr, FSegment, FunctionDef, Program, Stmt, StmtKind, Target, UnaryOp,
};
use super::builtins::{self, Args, candidates, extreme, sort_values};
use super::error::{Eval, Interrupt, RuntimeError};
use super::format::format_spec;
use super::methods::call_method;
use super::modules::{self, Module};
use super::parser::parse;
use super::value::{self, Dict, Value};
use crate::host::CallableHost;
use crate::state::ExecutionState;

/// Name of the builtin that ends the run with an answer.
const FINAL_ANSWER: &str = "final_answer";

/// Nested user function calls allowed before `RecursionError`.
///
/// Every level runs on the host task's stack, so the limit stays well below
/// what a default 2 MiB thread stack holds in unoptimized builds.
const MAX_CALL_DEPTH: usize = 32;

/// Nested expression evaluations allowed across all active calls.
const MAX_EVAL_DEPTH: usize = 200;

/// Operations between voluntary yields to the runtime.
const YIELD_INTERVAL: u64 = 1_024;

/// How a block finished.
#[derive(Debug)]
pub(crate) struct Completion {
    pub(crate) value: Value,
    pub(crate) final_answer: bool,
}

#[derive(Debug, Default)]
struct Frame {
    vars: BTreeMap<String, Value>,
    /// Comprehension frames see through to their enclosing scope.
    transparent: bool,
}

/// Location of an assignable value: a variable and a chain of subscripts.
type Place = (String, Vec<Value>);

pub(crate) struct Interpreter<'a> {
    host: &'a dyn CallableHost,
    config: &'a LocalConfig,
    callables: BTreeMap<String, CapabilityDescriptor>,
    globals: BTreeMap<String, Value>,
    frames: Vec<Frame>,
    stdout: String,
    operations: u64,
    depth: usize,
    eval_depth: usize,
    last_value: Value,
}

impl<'a> Interpreter<'a> {
    pub(crate) fn new(host: &'a dyn CallableHost, config: &'a LocalConfig) -> Self {
        let callables = host
            .callables()
            .into_iter()
            .map(|descriptor| (descriptor.name().to_owned(), descriptor))
            .collect();
        Self {
            host,
            config,
            callables,
            globals: BTreeMap::new(),
            frames: Vec::new(),
            stdout: String::new(),
            operations: 0,
            depth: 0,
            eval_depth: 0,
            last_value: Value::None,
        }
    }

    /// Loads variables, imports and functions bound by earlier blocks.
    pub(crate) fn restore(&mut self, state: &ExecutionState) {
        for (name, json) in state.variables() {
            self.globals.insert(name.clone(), Value::from_json(json));
        }
        for (name, target) in state.imports() {
            let value = match target.split_once('.') {
                Some((module, attribute)) => {
                    Module::from_name(module).and_then(|module| module.attribute(attribute).ok())
                }
                None => Module::from_name(target).map(Value::Module),
            };
            match value {
                Some(value) => {
                    self.globals.insert(name.clone(), value);
                }
                None => debug!(name = %name, target = %target, "skipping unavailable import"),
            }
        }
        for (name, source) in state.definitions() {
            let def = parse(source).ok().and_then(|program| {
                program.body.into_iter().find_map(|stmt| match stmt.kind {
                    StmtKind::FunctionDef(def) => Some(def),
                    _ => None,
                })
            });
            match def {
                Some(def) => {
                    self.globals.insert(name.clone(), Value::Function(def));
                }
                None => debug!(name = %name, "skipping definition that no longer parses"),
            }
        }
    }

    /// Writes the global bindings back into `state`.
    pub(crate) fn save(&self, state: &mut ExecutionState) {
        state.clear_bindings();
        let mut variables = Map::new();
        for (name, value) in &self.globals {
            match value {
                Value::Module(module) => state.record_import(name, module.name()),
                Value::ModuleFn(module, function) => {
                    state.record_import(name, format!("{}.{function}", module.name()));
                }
                Value::Function(def) => state.record_definition(name, def.source.clone()),
                Value::Builtin(_) | Value::Capability(_) => {}
                data => {
                    variables.insert(name.clone(), data.to_json_lossy());
                }
            }
        }
        state.replace_variables(variables);
    }

    /// Text printed so far.
    pub(crate) fn stdout(&self) -> &str {
        &self.stdout
    }

    pub(crate) async fn run(&mut self, program: &Program) -> Result<Completion, RuntimeError> {
        for stmt in &program.body {
            self.last_value = Value::None;
            match self.exec_stmt(stmt).await {
                Ok(()) => {}
                Err(Interrupt::FinalAnswer(value)) => {
                    return Ok(Completion {
                        value,
                        final_answer: true,
                    });
                }
                Err(Interrupt::Error(error)) => return Err(error),
                Err(Interrupt::Return(_)) => {
                    return Err(at(RuntimeError::syntax("'return' outside function"), stmt.line));
                }
                Err(Interrupt::Break | Interrupt::Continue) => {
                    return Err(at(RuntimeError::syntax("'break' outside loop"), stmt.line));
                }
            }
        }
        Ok(Completion {
            value: std::mem::take(&mut self.last_value),
            final_answer: false,
        })
    }

    async fn tick(&mut self) -> Eval<()> {
        self.operations += 1;
        if self.operations > self.config.max_operations() {
            return Err(RuntimeError::new(
                "InterpreterError",
                format!(
                    "reached the maximum of {} operations",
                    self.config.max_operations()
                ),
            )
            .into());
        }
        if self.operations % YIELD_INTERVAL == 0 {
            tokio::task::yield_now().await;
        }
        Ok(())
    }

    // Scopes

    fn variable(&self, name: &str) -> Option<&Value> {
        for frame in self.frames.iter().rev() {
            if let Some(value) = frame.vars.get(name) {
                return Some(value);
            }
            if !frame.transparent {
                break;
            }
        }
        self.globals.get(name)
    }

    fn variable_mut(&mut self, name: &str) -> Option<&mut Value> {
        let mut found = None;
        for (index, frame) in self.frames.iter().enumerate().rev() {
            if frame.vars.contains_key(name) {
                found = Some(index);
                break;
            }
            if !frame.transparent {
                break;
            }
        }
        match found {
            Some(index) => self.frames[index].vars.get_mut(name),
            None => self.globals.get_mut(name),
        }
    }

    fn lookup(&self, name: &str) -> Result<Value, RuntimeError> {
        if let Some(value) = self.variable(name) {
            return Ok(value.clone());
        }
        if name == FINAL_ANSWER {
            return Ok(Value::Builtin(FINAL_ANSWER));
        }
        if self.callables.contains_key(name) {
            return Ok(Value::Capability(name.to_owned()));
        }
        builtins::lookup(name).ok_or_else(|| RuntimeError::name_error(name))
    }

    fn bind(&mut self, name: &str, value: Value) -> Result<(), RuntimeError> {
        if name == FINAL_ANSWER || self.callables.contains_key(name) {
            return Err(RuntimeError::new(
                "InterpreterError",
                format!("cannot assign to name '{name}': doing this would erase the existing capability"),
            ));
        }
        let scope = match self.frames.last_mut() {
            Some(frame) => &mut frame.vars,
            None => &mut self.globals,
        };
        scope.insert(name.to_owned(), value);
        Ok(())
    }

    /// Resolves `expr` to a place when it is a variable or a subscript chain
    /// rooted at one. Nothing is evaluated when it is not.
    fn place<'s>(&'s mut self, expr: &'s Expr) -> BoxFuture<'s, Eval<Option<Place>>> {
        Box::pin(async move {
            match expr {
                Expr::Name(name) => Ok(Some((name.clone(), Vec::new()))),
                Expr::Index { obj, index } => match self.place(obj).await? {
                    Some((root, mut path)) => {
                        let key = self.eval(index).await?;
                        path.push(key);
                        Ok(Some((root, path)))
                    }
                    None => Ok(None),
                },
                _ => Ok(None),
            }
        })
    }

    fn read_place(&self, root: &str, path: &[Value]) -> Result<Value, RuntimeError> {
        let Some(mut current) = self.variable(root) else {
            let mut value = self.lookup(root)?;
            for key in path {
                value = value.get_item(key)?;
            }
            return Ok(value);
        };
        for (position, key) in path.iter().enumerate() {
            if let Value::List(_) | Value::Dict(_) = current {
                current = current.item_ref(key)?;
            } else {
                let mut value = current.get_item(key)?;
                for key in &path[position + 1..] {
                    value = value.get_item(key)?;
                }
                return Ok(value);
            }
        }
        Ok(current.clone())
    }

    fn place_mut(&mut self, root: &str, path: &[Value]) -> Result<&mut Value, RuntimeError> {
        let mut current = self
            .variable_mut(root)
            .ok_or_else(|| RuntimeError::name_error(root))?;
        for key in path {
            current = current.item_mut(key)?;
        }
        Ok(current)
    }

    // Statements

    fn exec_block<'s>(&'s mut self, body: &'s [Stmt]) -> BoxFuture<'s, Eval<()>> {
        Box::pin(async move {
            for stmt in body {
                self.exec_stmt(stmt).await?;
            }
            Ok(())
        })
    }

    fn exec_stmt<'s>(&'s mut self, stmt: &'s Stmt) -> BoxFuture<'s, Eval<()>> {
        Box::pin(async move {
            self.tick().await?;
            self.exec_kind(&stmt.kind)
                .await
                .map_err(|interrupt| interrupt.at_line(stmt.line))
        })
    }

    fn exec_kind<'s>(&'s mut self, kind: &'s StmtKind) -> BoxFuture<'s, Eval<()>> {
        Box::pin(async move {
            match kind {
                StmtKind::Expr(expr) => {
                    self.last_value = self.eval(expr).await?;
                }
                StmtKind::Assign { targets, value } => {
                    let value = self.eval(value).await?;
                    for target in targets {
                        self.assign(target, value.clone()).await?;
                    }
                }
                StmtKind::AugAssign { target, op, value } => {
                    let (root, mut path) = match target {
                        Target::Name(name) => (name.clone(), Vec::new()),
                        Target::Index { obj, index } => {
                            let Some(place) = self.place(obj).await? else {
                                return Err(RuntimeError::syntax(
                                    "illegal expression for augmented assignment",
                                )
                                .into());
                            };
                            let key = self.eval(index).await?;
                            let (root, mut path) = place;
                            path.push(key);
                            (root, path)
                        }
                        Target::Unpack(_) => {
                            return Err(RuntimeError::syntax(
                                "illegal expression for augmented assignment",
                            )
                            .into());
                        }
                    };
                    let current = self.read_place(&root, &path)?;
                    let operand = self.eval(value).await?;
                    let updated = value::binary(*op, &current, &operand)?;
                    match path.pop() {
                        None => self.bind(&root, updated)?,
                        Some(key) => self.place_mut(&root, &path)?.set_item(key, updated)?,
                    }
                }
                StmtKind::Import { module, alias } => {
                    let found = self.import(module)?;
                    self.bind(alias.as_deref().unwrap_or(module), Value::Module(found))?;
                }
                StmtKind::FromImport { module, names } => {
                    let found = self.import(module)?;
                    for (name, alias) in names {
                        let value = found.attribute(name).map_err(|_| {
                            RuntimeError::new(
                                "ImportError",
                                format!("cannot import name '{name}' from '{module}'"),
                            )
                        })?;
                        self.bind(alias.as_deref().unwrap_or(name), value)?;
                    }
                }
                StmtKind::If { branches, orelse } => {
                    for (cond, body) in branches {
                        if self.eval(cond).await?.truthy() {
                            return self.exec_block(body).await;
                        }
                    }
                    self.exec_block(orelse).await?;
                }
                StmtKind::For { target, iter, body } => {
                    let items = self.eval(iter).await?.iterate()?;
                    for item in items {
                        self.assign(target, item).await?;
                        match self.exec_block(body).await {
                            Ok(()) | Err(Interrupt::Continue) => {}
                            Err(Interrupt::Break) => break,
                            Err(other) => return Err(other),
                        }
                    }
                }
                StmtKind::While { cond, body } => loop {
                    self.tick().await?;
                    if !self.eval(cond).await?.truthy() {
                        break;
                    }
                    match self.exec_block(body).await {
                        Ok(()) | Err(Interrupt::Continue) => {}
                        Err(Interrupt::Break) => break,
                        Err(other) => return Err(other),
                    }
                },
                StmtKind::FunctionDef(def) => {
                    self.bind(&def.name, Value::Function(Arc::clone(def)))?;
                }
                StmtKind::Return(value) => {
                    let value = match value {
                        Some(expr) => self.eval(expr).await?,
                        None => Value::None,
                    };
                    return Err(Interrupt::Return(value));
                }
                StmtKind::Assert { cond, message } => {
                    if !self.eval(cond).await?.truthy() {
                        let message = match message {
                            Some(expr) => self.eval(expr).await?.to_str(),
                            None => String::new(),
                        };
                        return Err(RuntimeError::new("AssertionError", message).into());
                    }
                }
                StmtKind::Break => return Err(Interrupt::Break),
                StmtKind::Continue => return Err(Interrupt::Continue),
                StmtKind::Pass => {}
            }
            Ok(())
        })
    }

    fn import(&self, module: &str) -> Result<Module, RuntimeError> {
        if !self.config.allows(module) {
            let authorized: Vec<&str> = self
                .config
                .authorized_imports()
                .map(String::as_str)
                .collect();
            return Err(RuntimeError::new(
                "ImportError",
                format!(
                    "import of `{module}` is not allowed; authorized imports are: {}",
                    authorized.join(", ")
                ),
            ));
        }
        Module::from_name(module).ok_or_else(|| {
            RuntimeError::new(
                "ImportError",
                format!(
                    "module `{module}` is not available in the local executor; available modules are: {}",
                    Module::AVAILABLE.join(", ")
                ),
            )
        })
    }

    fn assign<'s>(&'s mut self, target: &'s Target, value: Value) -> BoxFuture<'s, Eval<()>> {
        Box::pin(async move {
            match target {
                Target::Name(name) => self.bind(name, value)?,
                Target::Index { obj, index } => {
                    let Some((root, path)) = self.place(obj).await? else {
                        return Err(RuntimeError::syntax("cannot assign to expression").into());
                    };
                    let key = self.eval(index).await?;
                    self.place_mut(&root, &path)?.set_item(key, value)?;
                }
                Target::Unpack(targets) => {
                    let items = value.iterate()?;
                    if items.len() != targets.len() {
                        return Err(RuntimeError::value_error(format!(
                            "expected {} values to unpack, got {}",
                            targets.len(),
                            items.len()
                        ))
                        .into());
                    }
                    for (target, item) in targets.iter().zip(items) {
                        self.assign(target, item).await?;
                    }
                }
            }
            Ok(())
        })
    }

    // Expressions

    fn eval<'s>(&'s mut self, expr: &'s Expr) -> BoxFuture<'s, Eval<Value>> {
        Box::pin(async move {
            if self.eval_depth >= MAX_EVAL_DEPTH {
                return Err(RuntimeError::new(
                    "RecursionError",
                    "maximum expression nesting exceeded",
                )
                .into());
            }
            self.eval_depth += 1;
            let result = self.eval_node(expr).await;
            self.eval_depth -= 1;
            result
        })
    }

    fn eval_node<'s>(&'s mut self, expr: &'s Expr) -> BoxFuture<'s, Eval<Value>> {
        Box::pin(async move {
            let value = match expr {
                Expr::None => Value::None,
                Expr::Bool(b) => Value::Bool(*b),
                Expr::Int(i) => Value::Int(*i),
                Expr::Float(f) => Value::Float(*f),
                Expr::Str(s) => Value::Str(s.clone()),
                Expr::FString(segments) => {
                    let mut out = String::new();
                    for segment in segments {
                        match segment {
                            FSegment::Literal(text) => out.push_str(text),
                            FSegment::Value { expr, spec, repr } => {
                                let mut value = self.eval(expr).await?;
                                if *repr {
                                    value = Value::Str(value.repr());
                                }
                                match spec {
                                    Some(spec) => out.push_str(&format_spec(&value, spec)?),
                                    None => out.push_str(&value.to_str()),
                                }
                            }
                        }
                    }
                    Value::Str(out)
                }
                Expr::Name(name) => self.lookup(name)?,
                Expr::List(items) => {
                    let mut values = Vec::with_capacity(items.len());
                    for item in items {
                        values.push(self.eval(item).await?);
                    }
                    Value::List(values)
                }
                Expr::Dict(pairs) => {
                    let mut dict = Dict::default();
                    for (key, value) in pairs {
                        let key = self.eval(key).await?;
                        let value = self.eval(value).await?;
                        dict.insert(key, value)?;
                    }
                    Value::Dict(dict)
                }
                Expr::Unary { op, operand } => {
                    let operand = self.eval(operand).await?;
                    unary(*op, &operand)?
                }
                Expr::Binary { op, left, right } => {
                    let left = self.eval(left).await?;
                    let right = self.eval(right).await?;
                    value::binary(*op, &left, &right)?
                }
                Expr::Compare { first, rest } => {
                    let mut left = self.eval(first).await?;
                    for (op, expr) in rest {
                        let right = self.eval(expr).await?;
                        if !value::compare(*op, &left, &right)? {
                            return Ok(Value::Bool(false));
                        }
                        left = right;
                    }
                    Value::Bool(true)
                }
                Expr::And(left, right) => {
                    let left = self.eval(left).await?;
                    if left.truthy() {
                        self.eval(right).await?
                    } else {
                        left
                    }
                }
                Expr::Or(left, right) => {
                    let left = self.eval(left).await?;
                    if left.truthy() {
                        left
                    } else {
                        self.eval(right).await?
                    }
                }
                Expr::IfElse { cond, then, orelse } => {
                    if self.eval(cond).await?.truthy() {
                        self.eval(then).await?
                    } else {
                        self.eval(orelse).await?
                    }
                }
                Expr::Call { func, args, kwargs } => self.eval_call(func, args, kwargs).await?,
                Expr::Attribute { obj, name } => match self.eval(obj).await? {
                    Value::Module(module) => module.attribute(name)?,
                    other => {
                        return Err(RuntimeError::attribute_error(other.type_name(), name).into());
                    }
                },
                Expr::Index { obj, index } => match self.place(obj).await? {
                    Some((root, mut path)) => {
                        path.push(self.eval(index).await?);
                        self.read_place(&root, &path)?
                    }
                    None => {
                        let container = self.eval(obj).await?;
                        let key = self.eval(index).await?;
                        container.get_item(&key)?
                    }
                },
                Expr::Slice {
                    obj,
                    lower,
                    upper,
                    step,
                } => {
                    let container = self.eval(obj).await?;
                    let lower = self.slice_bound(lower.as_deref()).await?;
                    let upper = self.slice_bound(upper.as_deref()).await?;
                    let step = self.slice_bound(step.as_deref()).await?;
                    container.slice(lower, upper, step)?
                }
                Expr::ListComp { element, clause } => {
                    self.comprehension(clause, Produce::Item(element)).await?
                }
                Expr::DictComp { key, value, clause } => {
                    self.comprehension(clause, Produce::Entry(key, value)).await?
                }
            };
            Ok(value)
        })
    }

    async fn slice_bound(&mut self, bound: Option<&Expr>) -> Eval<Option<i64>> {
        let Some(expr) = bound else {
            return Ok(None);
        };
        match self.eval(expr).await? {
            Value::None => Ok(None),
            other => Ok(Some(other.expect_int("slice indices")?)),
        }
    }

    /// Evaluates a comprehension inside a transparent frame.
    async fn comprehension(&mut self, clause: &Comprehension, produce: Produce<'_>) -> Eval<Value> {
        let items = self.eval(&clause.iter).await?.iterate()?;
        self.frames.push(Frame {
            vars: BTreeMap::new(),
            transparent: true,
        });
        let result = self.comprehension_items(clause, &produce, items).await;
        self.frames.pop();
        result
    }

    async fn comprehension_items(
        &mut self,
        clause: &Comprehension,
        produce: &Produce<'_>,
        items: Vec<Value>,
    ) -> Eval<Value> {
        let mut list = Vec::new();
        let mut dict = Dict::default();
        'items: for item in items {
            self.tick().await?;
            self.assign(&clause.target, item).await?;
            for condition in &clause.conditions {
                if !self.eval(condition).await?.truthy() {
                    continue 'items;
                }
            }
            match produce {
                Produce::Item(element) => list.push(self.eval(element).await?),
                Produce::Entry(key, value) => {
                    let key = self.eval(key).await?;
                    let value = self.eval(value).await?;
                    dict.insert(key, value)?;
                }
            }
        }
        Ok(match produce {
            Produce::Item(_) => Value::List(list),
            Produce::Entry(..) => Value::Dict(dict),
        })
    }

    // Calls

    async fn eval_args(
        &mut self,
        args: &[Expr],
        kwargs: &[(String, Expr)],
    ) -> Eval<Args> {
        let mut positional = Vec::with_capacity(args.len());
        for arg in args {
            positional.push(self.eval(arg).await?);
        }
        let mut keywords = Vec::with_capacity(kwargs.len());
        for (name, arg) in kwargs {
            keywords.push((name.clone(), self.eval(arg).await?));
        }
        Ok(Args::new(positional, keywords))
    }

    fn eval_call<'s>(
        &'s mut self,
        func: &'s Expr,
        args: &'s [Expr],
        kwargs: &'s [(String, Expr)],
    ) -> BoxFuture<'s, Eval<Value>> {
        Box::pin(async move {
            let Expr::Attribute { obj, name } = func else {
                let callee = self.eval(func).await?;
                let args = self.eval_args(args, kwargs).await?;
                return self.call_value(callee, args).await;
            };

            // Method call: mutate list and dict receivers in place.
            if let Some((root, path)) = self.place(obj).await? {
                let receiver = self.read_place_kind(&root, &path)?;
                match receiver {
                    Receiver::Module(module) => {
                        let callee = module.attribute(name)?;
                        let args = self.eval_args(args, kwargs).await?;
                        return self.call_value(callee, args).await;
                    }
                    Receiver::List | Receiver::Dict => {
                        let mut args = self.eval_args(args, kwargs).await?;
                        if name == "sort" && matches!(receiver, Receiver::List) {
                            if let Some(key) = args.keyword("key").filter(|key| !matches!(key, Value::None)) {
                                let reverse = args.keyword("reverse").is_some_and(|r| r.truthy());
                                args.finish("list.sort", 0, 0)?;
                                let items = self.read_place(&root, &path)?.iterate()?;
                                let keys = self.keys_for(&key, &items).await?;
                                let sorted = sort_values(items, Some(keys), reverse)?;
                                *self.place_mut(&root, &path)? = Value::List(sorted);
                                return Ok(Value::None);
                            }
                        }
                        let receiver = self.place_mut(&root, &path)?;
                        return Ok(call_method(receiver, name, args)?);
                    }
                    Receiver::Other => {}
                }
                let mut receiver = self.read_place(&root, &path)?;
                let args = self.eval_args(args, kwargs).await?;
                return Ok(call_method(&mut receiver, name, args)?);
            }

            let mut receiver = self.eval(obj).await?;
            if let Value::Module(module) = receiver {
                let callee = module.attribute(name)?;
                let args = self.eval_args(args, kwargs).await?;
                return self.call_value(callee, args).await;
            }
            let args = self.eval_args(args, kwargs).await?;
            Ok(call_method(&mut receiver, name, args)?)
        })
    }

    fn read_place_kind(&self, root: &str, path: &[Value]) -> Result<Receiver, RuntimeError> {
        let Some(mut current) = self.variable(root) else {
            return Ok(Receiver::Other);
        };
        for key in path {
            match current {
                Value::List(_) | Value::Dict(_) => current = current.item_ref(key)?,
                _ => return Ok(Receiver::Other),
            }
        }
        Ok(match current {
            Value::Module(module) => Receiver::Module(*module),
            Value::List(_) => Receiver::List,
            Value::Dict(_) => Receiver::Dict,
            _ => Receiver::Other,
        })
    }

    async fn keys_for(&mut self, key: &Value, items: &[Value]) -> Eval<Vec<Value>> {
        let mut keys = Vec::with_capacity(items.len());
        for item in items {
            let args = Args::new(vec![item.clone()], Vec::new());
            keys.push(self.call_value(key.clone(), args).await?);
        }
        Ok(keys)
    }

    fn call_value<'s>(&'s mut self, callee: Value, args: Args) -> BoxFuture<'s, Eval<Value>> {
        Box::pin(async move {
            self.tick().await?;
            match callee {
                Value::Builtin(name) => self.call_builtin(name, args).await,
                Value::ModuleFn(Module::Time, "sleep") => {
                    let [seconds] = args.exact::<1>("time.sleep")?;
                    let seconds = seconds.expect_number("time.sleep() argument")?;
                    let duration = Duration::try_from_secs_f64(seconds).map_err(|_| {
                        RuntimeError::value_error("sleep length must be a non-negative number")
                    })?;
                    tokio::time::sleep(duration).await;
                    Ok(Value::None)
                }
                Value::ModuleFn(module, name) => Ok(modules::call(module, name, args)?),
                Value::Capability(name) => self.call_capability(&name, args).await,
                Value::Function(def) => self.call_function(def, args).await,
                other => Err(RuntimeError::type_error(format!(
                    "'{}' object is not callable",
                    other.type_name()
                ))
                .into()),
            }
        })
    }

    async fn call_builtin(&mut self, name: &'static str, mut args: Args) -> Eval<Value> {
        match name {
            "print" => {
                let sep = match args.keyword("sep") {
                    Some(Value::None) | None => " ".to_owned(),
                    Some(sep) => sep.expect_str("sep")?.to_owned(),
                };
                let end = match args.keyword("end") {
                    Some(Value::None) | None => "\n".to_owned(),
                    Some(end) => end.expect_str("end")?.to_owned(),
                };
                args.keyword("flush");
                let values = args.finish("print", 0, usize::MAX)?;
                let text: Vec<String> = values.iter().map(Value::to_str).collect();
                self.stdout.push_str(&text.join(&sep));
                self.stdout.push_str(&end);
                Ok(Value::None)
            }
            FINAL_ANSWER => {
                let answer = args.keyword("answer");
                let mut values = args.finish(FINAL_ANSWER, 0, 1)?;
                let answer = match (values.pop(), answer) {
                    (Some(answer), None) | (None, Some(answer)) => answer,
                    (None, None) => {
                        return Err(RuntimeError::type_error(
                            "final_answer() missing 1 required argument: 'answer'",
                        )
                        .into());
                    }
                    (Some(_), Some(_)) => {
                        return Err(RuntimeError::type_error(
                            "final_answer() got multiple values for argument 'answer'",
                        )
                        .into());
                    }
                };
                Err(Interrupt::FinalAnswer(answer))
            }
            "sorted" | "min" | "max" => {
                let Some(key) = args.keyword("key").filter(|key| !matches!(key, Value::None))
                else {
                    return Ok(builtins::call_pure(name, args)?);
                };
                if name == "sorted" {
                    let reverse = args.keyword("reverse").is_some_and(|r| r.truthy());
                    let [iterable] = args.exact::<1>("sorted")?;
                    let items = iterable.iterate()?;
                    let keys = self.keys_for(&key, &items).await?;
                    return Ok(Value::List(sort_values(items, Some(keys), reverse)?));
                }
                let default = args.keyword("default");
                let items = candidates(name, args.finish(name, 1, usize::MAX)?)?;
                let keys = self.keys_for(&key, &items).await?;
                let want = if name == "min" {
                    Ordering::Less
                } else {
                    Ordering::Greater
                };
                Ok(extreme(name, items, Some(keys), want, default)?)
            }
            "map" => {
                let mut values = args.finish("map", 2, usize::MAX)?;
                let function = values.remove(0);
                let columns = values
                    .iter()
                    .map(Value::iterate)
                    .collect::<Result<Vec<_>, _>>()?;
                let rows = columns.iter().map(Vec::len).min().unwrap_or(0);
                let mut out = Vec::with_capacity(rows);
                for row in 0..rows {
                    let row_args = columns.iter().map(|column| column[row].clone()).collect();
                    out.push(self.call_value(function.clone(), Args::new(row_args, Vec::new())).await?);
                }
                Ok(Value::List(out))
            }
            "filter" => {
                let [function, iterable] = args.exact::<2>("filter")?;
                let mut out = Vec::new();
                for item in iterable.iterate()? {
                    let keep = match &function {
                        Value::None => item.truthy(),
                        function => self
                            .call_value(function.clone(), Args::new(vec![item.clone()], Vec::new()))
                            .await?
                            .truthy(),
                    };
                    if keep {
                        out.push(item);
                    }
                }
                Ok(Value::List(out))
            }
            other => Ok(builtins::call_pure(other, args)?),
        }
    }

    async fn call_function(&mut self, def: Arc<FunctionDef>, args: Args) -> Eval<Value> {
        if self.depth >= MAX_CALL_DEPTH {
            return Err(RuntimeError::new(
                "RecursionError",
                "maximum recursion depth exceeded",
            )
            .into());
        }
        let name = &def.name;
        let (positional, keywords) = args.into_parts();
        if positional.len() > def.params.len() {
            return Err(RuntimeError::type_error(format!(
                "{name}() takes {} positional argument(s) but {} were given",
                def.params.len(),
                positional.len()
            ))
            .into());
        }

        let mut vars = BTreeMap::new();
        for (param, value) in def.params.iter().zip(positional) {
            vars.insert(param.name.clone(), value);
        }
        for (key, value) in keywords {
            if !def.params.iter().any(|param| param.name == key) {
                return Err(RuntimeError::type_error(format!(
                    "{name}() got an unexpected keyword argument '{key}'"
                ))
                .into());
            }
            if vars.contains_key(&key) {
                return Err(RuntimeError::type_error(format!(
                    "{name}() got multiple values for argument '{key}'"
                ))
                .into());
            }
            vars.insert(key, value);
        }
        for param in &def.params {
            if vars.contains_key(&param.name) {
                continue;
            }
            let Some(default) = &param.default else {
                return Err(RuntimeError::type_error(format!(
                    "{name}() missing required argument: '{}'",
                    param.name
                ))
                .into());
            };
            let value = self.eval(default).await?;
            vars.insert(param.name.clone(), value);
        }

        self.frames.push(Frame {
            vars,
            transparent: false,
        });
        self.depth += 1;
        let result = self.exec_block(&def.body).await;
        self.depth -= 1;
        self.frames.pop();

        match result {
            Ok(()) => Ok(Value::None),
            Err(Interrupt::Return(value)) => Ok(value),
            Err(Interrupt::Break | Interrupt::Continue) => {
                Err(RuntimeError::syntax("'break' outside loop").into())
            }
            Err(other) => Err(other),
        }
    }

    async fn call_capability(&mut self, name: &str, args: Args) -> Eval<Value> {
        let Some(descriptor) = self.callables.get(name) else {
            return Err(RuntimeError::name_error(name).into());
        };
        let (positional, keywords) = args.into_parts();
        let parameters = descriptor.parameters();
        if positional.len() > parameters.len() {
            return Err(RuntimeError::type_error(format!(
                "{name}() takes {} argument(s) but {} were given",
                parameters.len(),
                positional.len()
            ))
            .into());
        }

        let mut arguments = Map::new();
        let named = parameters
            .iter()
            .map(|parameter| parameter.name().to_owned())
            .zip(positional)
            .chain(keywords);
        for (key, value) in named {
            let json = value.to_json().ok_or_else(|| {
                RuntimeError::type_error(format!(
                    "argument '{key}' of {name}() must be plain data, not '{}'",
                    value.type_name()
                ))
            })?;
            if arguments.insert(key.clone(), json).is_some() {
                return Err(RuntimeError::type_error(format!(
                    "{name}() got multiple values for argument '{key}'"
                ))
                .into());
            }
        }

        debug!(capability = %name, "calling capability from code");
        match self.host.call(name, arguments).await {
            Ok(output) => Ok(Value::from_json(&output)),
            Err(error) => {
                let kind = match error.kind() {
                    ErrorKind::Schema => "TypeError",
                    ErrorKind::Tool => "ToolError",
                    ErrorKind::UnknownCapability => "NameError",
                    ErrorKind::Timeout => "TimeoutError",
                    ErrorKind::Execution | ErrorKind::Infrastructure => "RuntimeError",
                };
                Err(RuntimeError::new(
                    kind,
                    format!("error calling `{name}`: {}", error.message()),
                )
                .into())
            }
        }
    }
}

/// What a method call's receiver is, without cloning it.
enum Receiver {
    Module(Module),
    List,
    Dict,
    Other,
}

/// What each comprehension iteration produces.
enum Produce<'e> {
    Item(&'e Expr),
    Entry(&'e Expr, &'e Expr),
}

fn at(mut error: RuntimeError, line: usize) -> RuntimeError {
    error.line.get_or_insert(line);
    error
}

fn unary(op: UnaryOp, operand: &Value) -> Result<Value, RuntimeError> {
    match (op, operand) {
        (UnaryOp::Not, value) => Ok(Value::Bool(!value.truthy())),
        (UnaryOp::Neg, Value::Float(f)) => Ok(Value::Float(-f)),
        (UnaryOp::Pos, Value::Float(f)) => Ok(Value::Float(*f)),
        (op, value) => {
            let Some(int) = value.as_int() else {
                let symbol = if op == UnaryOp::Neg { "-" } else { "+" };
                return Err(RuntimeError::type_error(format!(
                    "bad operand type for unary {symbol}: '{}'",
                    value.type_name()
                )));
            };
            match op {
                UnaryOp::Neg => int.checked_neg().map(Value::Int).ok_or_else(RuntimeError::overflow),
                _ => Ok(Value::Int(int)),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::NoCallables;

    async fn run(source: &str) -> (Result<Completion, RuntimeError>, String) {
        let config = LocalConfig::default();
        let program = parse(source).unwrap();
        let mut interpreter = Interpreter::new(&NoCallables, &config);
        let result = interpreter.run(&program).await;
        (result, interpreter.stdout().to_owned())
    }

    async fn value_of(source: &str) -> String {
        run(source).await.0.unwrap().value.repr()
    }

    #[tokio::test]
    async fn evaluates_arithmetic_and_last_expression() {
        assert_eq!(value_of("x = 2 + 3 * 4\nx ** 2").await, "196");
        assert_eq!(value_of("7 // 2, 7 % 3, 2 ** 0.5 > 1.41").await, "[3, 1, True]");
    }

    #[tokio::test]
    async fn loops_and_control_flow() {
        let source = "total = 0\nfor i in range(10):\n    if i % 2:\n        continue\n    if i > 6:\n        break\n    total += i\ntotal";
        assert_eq!(value_of(source).await, "12");
        assert_eq!(value_of("n = 0\nwhile n < 5:\n    n += 1\nn").await, "5");
    }

    #[tokio::test]
    async fn functions_with_defaults_and_recursion() {
        let source = "def fib(n, memo=None):\n    if n < 2:\n        return n\n    return fib(n - 1) + fib(n - 2)\nfib(15)";
        assert_eq!(value_of(source).await, "610");
        let (result, _) = run("def f():\n    return f()\nf()").await;
        assert_eq!(result.unwrap_err().kind, "RecursionError");
        let (result, _) = run("def f(n):\n    return f(n + 1)\nf(0)").await;
        assert_eq!(result.unwrap_err().kind, "RecursionError");
    }

    #[tokio::test]
    async fn deep_expressions_inside_recursion_hit_the_nesting_limit() {
        let source = format!("def f(n):\n    return {}f(n + 1){}\nf(0)", "-(".repeat(40), ")".repeat(40));
        let error = run(&source).await.0.unwrap_err();
        assert_eq!(error.kind, "RecursionError");
        assert_eq!(error.message, "maximum expression nesting exceeded");
        let shallow = format!("{}1{}", "-(".repeat(40), ")".repeat(40));
        assert_eq!(value_of(&shallow).await, "1");
    }

    #[tokio::test]
    async fn comprehensions_do_not_leak_their_variables() {
        assert_eq!(value_of("[x * x for x in range(5) if x % 2 == 0]").await, "[0, 4, 16]");
        assert_eq!(value_of("{k: len(k) for k in ['a', 'bb']}").await, "{'a': 1, 'bb': 2}");
        let (result, _) = run("[y for y in range(3)]\ny").await;
        assert_eq!(result.unwrap_err().kind, "NameError");
    }

    #[tokio::test]
    async fn methods_mutate_nested_containers() {
        let source = "data = {'items': [3, 1]}\ndata['items'].append(2)\ndata['items'].sort()\ndata";
        assert_eq!(value_of(source).await, "{'items': [1, 2, 3]}");
        let source = "words = ['bb', 'a', 'ccc']\nwords.sort(key=len)\nwords";
        assert_eq!(value_of(source).await, "['a', 'bb', 'ccc']");
    }

    #[tokio::test]
    async fn print_is_captured() {
        let (result, stdout) = run("print('a', 1, sep='-')\nprint(f'{2.5:.2f}', end='')").await;
        assert!(result.is_ok());
        assert_eq!(stdout, "a-1\n2.50");
    }

    #[tokio::test]
    async fn final_answer_interrupts() {
        let (result, stdout) = run("print('before')\nfinal_answer(2 + 2)\nprint('after')").await;
        let completion = result.unwrap();
        assert!(completion.final_answer);
        assert_eq!(completion.value.repr(), "4");
        assert_eq!(stdout, "before\n");
    }

    #[tokio::test]
    async fn errors_carry_their_line() {
        let (result, _) = run("x = 1\ny = x / 0").await;
        let error = result.unwrap_err();
        assert_eq!(error.kind, "ZeroDivisionError");
        assert_eq!(error.line, Some(2));
    }

    #[tokio::test]
    async fn imports_are_checked() {
        assert_eq!(value_of("import math\nmath.floor(math.pi)").await, "3");
        assert_eq!(value_of("from math import sqrt as root\nroot(9)").await, "3.0");
        let (result, _) = run("import os").await;
        let error = result.unwrap_err();
        assert_eq!(error.kind, "ImportError");
        assert!(error.message.contains("not allowed"));
    }

    #[tokio::test]
    async fn operation_budget_stops_runaway_loops() {
        let config = LocalConfig::default().with_max_operations(1_000);
        let program = parse("while True:\n    pass").unwrap();
        let mut interpreter = Interpreter::new(&NoCallables, &config);
        let error = interpreter.run(&program).await.unwrap_err();
        assert_eq!(error.kind, "InterpreterError");
    }

    #[tokio::test]
    async fn state_survives_save_and_restore() {
        let config = LocalConfig::default();
        let mut state = ExecutionState::new();
        {
            let program = parse("import math\nx = [1, 2]\ndef double(v):\n    return v * 2").unwrap();
            let mut interpreter = Interpreter::new(&NoCallables, &config);
            interpreter.run(&program).await.unwrap();
            interpreter.save(&mut state);
        }
        assert_eq!(state.imports().get("math").map(String::as_str), Some("math"));
        assert!(state.definitions().contains_key("double"));

        let program = parse("double(len(x)) + math.floor(1.5)").unwrap();
        let mut interpreter = Interpreter::new(&NoCallables, &config);
        interpreter.restore(&state);
        assert_eq!(interpreter.run(&program).await.unwrap().value.repr(), "5");
    }
}
