//! Tree-walking evaluator for the minimal scripting language.
//!
//! The evaluator binds exactly the documented environment (`context`,
//! `memory`, `llm_query`, `FINAL`, and the whitelisted builtins) and nothing
//! else; any other name resolves to a sandbox violation. The wall-clock
//! deadline is checked at every statement and loop iteration, so a spinning
//! program terminates with `Timeout` rather than running away.

use std::collections::{BTreeMap, HashMap};
use std::rc::Rc;
use std::sync::Arc;
use std::time::Instant;

use crate::deadline::Deadline;
use crate::error::{Error, Result};
use crate::MemoryMap;

use super::ast::{
    AssignOp, BinOp, BoolOp, CmpOp, Expr, FuncDef, Literal, Program, Stmt, Target, UnaryOp,
};
use super::value::{Builtin, Value};
use super::Outcome;

/// Maximum nesting of user-function calls.
const MAX_CALL_DEPTH: usize = 64;
/// Maximum number of elements a single `range()` may materialize.
const MAX_RANGE_LEN: i64 = 1_000_000;

/// Blocking callback servicing `llm_query` from inside the interpreter.
pub type LlmQueryFn<'a> = Box<dyn FnMut(&str, &MemoryMap) -> Result<String> + 'a>;

/// Result of one sandbox run: the outcome plus the post-execution memory
/// snapshot.
#[derive(Debug)]
pub struct SandboxRun {
    pub outcome: Outcome,
    pub memory_after: MemoryMap,
}

/// Why statement execution stopped early.
enum Interrupt {
    Error(Error),
    Final(String),
    Timeout,
}

/// Non-error control flow out of a block.
enum Flow {
    Normal,
    Break,
    Continue,
    Return(Value),
}

type Exec<T> = std::result::Result<T, Interrupt>;

impl From<Error> for Interrupt {
    fn from(err: Error) -> Self {
        Interrupt::Error(err)
    }
}

/// One program evaluation over a fixed environment.
pub struct Interpreter<'a> {
    globals: HashMap<String, Value>,
    locals: Vec<HashMap<String, Value>>,
    memory: Value,
    llm_query: LlmQueryFn<'a>,
    deadline: Arc<Deadline>,
    node_cap: Instant,
    call_depth: usize,
}

impl<'a> Interpreter<'a> {
    /// Build an interpreter over the documented environment.
    pub fn new(
        context: String,
        memory: MemoryMap,
        llm_query: LlmQueryFn<'a>,
        deadline: Arc<Deadline>,
        node_cap: Instant,
    ) -> Self {
        let memory_value = Value::map(
            memory
                .iter()
                .map(|(k, v)| (k.clone(), Value::from_json(v)))
                .collect(),
        );

        let mut globals = HashMap::new();
        globals.insert("context".to_string(), Value::Str(context));
        globals.insert("memory".to_string(), memory_value.clone());
        for builtin in Builtin::all() {
            globals.insert(builtin.name().to_string(), Value::Builtin(*builtin));
        }

        Self {
            globals,
            locals: Vec::new(),
            memory: memory_value,
            llm_query,
            deadline,
            node_cap,
            call_depth: 0,
        }
    }

    /// Execute a parsed program to a single outcome.
    pub fn run(mut self, program: &Program) -> SandboxRun {
        let outcome = match self.exec_block(&program.body) {
            Ok(_) => Outcome::Error(Error::NoFinal),
            Err(Interrupt::Final(result)) => Outcome::Final(result),
            Err(Interrupt::Error(err)) => Outcome::Error(err),
            Err(Interrupt::Timeout) => Outcome::Timeout,
        };

        SandboxRun {
            outcome,
            memory_after: self.memory_snapshot(),
        }
    }

    fn memory_snapshot(&self) -> MemoryMap {
        let Value::Map(entries) = &self.memory else {
            return BTreeMap::new();
        };
        entries
            .borrow()
            .iter()
            .filter_map(|(k, v)| v.to_json().ok().map(|json| (k.clone(), json)))
            .collect()
    }

    fn check_deadline(&self) -> Exec<()> {
        if Instant::now() >= self.node_cap || self.deadline.expired() {
            Err(Interrupt::Timeout)
        } else {
            Ok(())
        }
    }

    // ---- environment ----

    fn lookup(&self, name: &str) -> Exec<Value> {
        if let Some(scope) = self.locals.last() {
            if let Some(value) = scope.get(name) {
                return Ok(value.clone());
            }
        }
        self.globals
            .get(name)
            .cloned()
            .ok_or_else(|| Error::forbidden_name(name).into())
    }

    fn assign_name(&mut self, name: &str, value: Value) {
        match self.locals.last_mut() {
            Some(scope) => {
                scope.insert(name.to_string(), value);
            }
            None => {
                self.globals.insert(name.to_string(), value);
            }
        }
    }

    // ---- statements ----

    fn exec_block(&mut self, stmts: &[Stmt]) -> Exec<Flow> {
        for stmt in stmts {
            self.check_deadline()?;
            match self.exec_stmt(stmt)? {
                Flow::Normal => {}
                other => return Ok(other),
            }
        }
        Ok(Flow::Normal)
    }

    fn exec_stmt(&mut self, stmt: &Stmt) -> Exec<Flow> {
        match stmt {
            Stmt::Pass => Ok(Flow::Normal),
            Stmt::Break => Ok(Flow::Break),
            Stmt::Continue => Ok(Flow::Continue),
            Stmt::Expr(expr) => {
                self.eval(expr)?;
                Ok(Flow::Normal)
            }
            Stmt::Return(expr) => {
                let value = match expr {
                    Some(expr) => self.eval(expr)?,
                    None => Value::Null,
                };
                Ok(Flow::Return(value))
            }
            Stmt::Assign { target, op, value } => {
                let value = self.eval(value)?;
                let value = match op {
                    AssignOp::Set => value,
                    aug => {
                        let bin = match aug {
                            AssignOp::Add => BinOp::Add,
                            AssignOp::Sub => BinOp::Sub,
                            AssignOp::Mul => BinOp::Mul,
                            _ => BinOp::Div,
                        };
                        let current = self.read_target(target)?;
                        self.binary(bin, current, value)?
                    }
                };
                self.write_target(target, value)?;
                Ok(Flow::Normal)
            }
            Stmt::If { branches, orelse } => {
                for (condition, body) in branches {
                    if self.eval(condition)?.truthy() {
                        return self.exec_block(body);
                    }
                }
                self.exec_block(orelse)
            }
            Stmt::For {
                targets,
                iter,
                body,
            } => {
                let items = self.eval(iter)?.iter_values()?;
                for item in items {
                    self.check_deadline()?;
                    self.bind_loop_targets(targets, item)?;
                    match self.exec_block(body)? {
                        Flow::Normal | Flow::Continue => {}
                        Flow::Break => break,
                        flow @ Flow::Return(_) => return Ok(flow),
                    }
                }
                Ok(Flow::Normal)
            }
            Stmt::FuncDef(func) => {
                self.assign_name(&func.name, Value::Func(Rc::clone(func)));
                Ok(Flow::Normal)
            }
        }
    }

    fn bind_loop_targets(&mut self, targets: &[String], item: Value) -> Exec<()> {
        if targets.len() == 1 {
            self.assign_name(&targets[0], item);
            return Ok(());
        }

        let Value::List(items) = &item else {
            return Err(Error::program_runtime(format!(
                "cannot unpack '{}' into {} names",
                item.type_name(),
                targets.len()
            ))
            .into());
        };
        let items = items.borrow();
        if items.len() != targets.len() {
            return Err(Error::program_runtime(format!(
                "cannot unpack {} values into {} names",
                items.len(),
                targets.len()
            ))
            .into());
        }
        for (name, value) in targets.iter().zip(items.iter()) {
            self.assign_name(name, value.clone());
        }
        Ok(())
    }

    fn read_target(&mut self, target: &Target) -> Exec<Value> {
        match target {
            Target::Name(name) => self.lookup(name),
            Target::Index { obj, index } => {
                let obj = self.eval(obj)?;
                let index = self.eval(index)?;
                Ok(self.index_value(&obj, &index)?)
            }
        }
    }

    fn write_target(&mut self, target: &Target, value: Value) -> Exec<()> {
        match target {
            Target::Name(name) => {
                self.assign_name(name, value);
                Ok(())
            }
            Target::Index { obj, index } => {
                let obj = self.eval(obj)?;
                let index = self.eval(index)?;
                match (&obj, &index) {
                    (Value::List(items), Value::Int(i)) => {
                        let mut items = items.borrow_mut();
                        let idx = normalize_index(*i, items.len())?;
                        items[idx] = value;
                        Ok(())
                    }
                    (Value::Map(entries), Value::Str(key)) => {
                        entries.borrow_mut().insert(key.clone(), value);
                        Ok(())
                    }
                    (Value::Map(_), other) => Err(Error::program_runtime(format!(
                        "dict keys must be strings, not '{}'",
                        other.type_name()
                    ))
                    .into()),
                    (other, _) => Err(Error::program_runtime(format!(
                        "'{}' does not support item assignment",
                        other.type_name()
                    ))
                    .into()),
                }
            }
        }
    }

    // ---- expressions ----

    fn eval(&mut self, expr: &Expr) -> Exec<Value> {
        match expr {
            Expr::Literal(lit) => Ok(match lit {
                Literal::Null => Value::Null,
                Literal::Bool(b) => Value::Bool(*b),
                Literal::Int(n) => Value::Int(*n),
                Literal::Float(f) => Value::Float(*f),
                Literal::Str(s) => Value::Str(s.clone()),
            }),
            Expr::Name(name) => self.lookup(name),
            Expr::List(items) => {
                let values: Exec<Vec<_>> = items.iter().map(|e| self.eval(e)).collect();
                Ok(Value::list(values?))
            }
            Expr::Dict(entries) => {
                let mut out = BTreeMap::new();
                for (key_expr, value_expr) in entries {
                    let key = match self.eval(key_expr)? {
                        Value::Str(s) => s,
                        other => {
                            return Err(Error::program_runtime(format!(
                                "dict keys must be strings, not '{}'",
                                other.type_name()
                            ))
                            .into());
                        }
                    };
                    out.insert(key, self.eval(value_expr)?);
                }
                Ok(Value::map(out))
            }
            Expr::Unary { op, operand } => {
                let value = self.eval(operand)?;
                match op {
                    UnaryOp::Not => Ok(Value::Bool(!value.truthy())),
                    UnaryOp::Neg => match value {
                        Value::Int(n) => Ok(Value::Int(-n)),
                        Value::Float(f) => Ok(Value::Float(-f)),
                        other => Err(Error::program_runtime(format!(
                            "cannot negate '{}'",
                            other.type_name()
                        ))
                        .into()),
                    },
                }
            }
            Expr::Binary { op, left, right } => {
                let left = self.eval(left)?;
                let right = self.eval(right)?;
                self.binary(*op, left, right)
            }
            Expr::Bool { op, values } => {
                let mut last = Value::Null;
                for (i, expr) in values.iter().enumerate() {
                    last = self.eval(expr)?;
                    let truthy = last.truthy();
                    let short_circuit = match op {
                        BoolOp::And => !truthy,
                        BoolOp::Or => truthy,
                    };
                    if short_circuit && i + 1 < values.len() {
                        return Ok(last);
                    }
                }
                Ok(last)
            }
            Expr::Compare { left, ops } => {
                let mut left = self.eval(left)?;
                for (op, right_expr) in ops {
                    let right = self.eval(right_expr)?;
                    if !self.compare(*op, &left, &right)? {
                        return Ok(Value::Bool(false));
                    }
                    left = right;
                }
                Ok(Value::Bool(true))
            }
            Expr::Call { func, args } => {
                let func = self.eval(func)?;
                let args: Exec<Vec<_>> = args.iter().map(|e| self.eval(e)).collect();
                self.call(func, args?)
            }
            Expr::Method { obj, name, args } => {
                let obj = self.eval(obj)?;
                let args: Exec<Vec<_>> = args.iter().map(|e| self.eval(e)).collect();
                self.string_method(&obj, name, args?)
            }
            Expr::Index { obj, index } => {
                let obj = self.eval(obj)?;
                let index = self.eval(index)?;
                Ok(self.index_value(&obj, &index)?)
            }
            Expr::Slice { obj, start, stop } => {
                let obj = self.eval(obj)?;
                let start = match start {
                    Some(expr) => Some(self.int_arg(expr)?),
                    None => None,
                };
                let stop = match stop {
                    Some(expr) => Some(self.int_arg(expr)?),
                    None => None,
                };
                self.slice_value(&obj, start, stop)
            }
        }
    }

    fn int_arg(&mut self, expr: &Expr) -> Exec<i64> {
        match self.eval(expr)? {
            Value::Int(n) => Ok(n),
            other => Err(Error::program_runtime(format!(
                "slice indices must be integers, not '{}'",
                other.type_name()
            ))
            .into()),
        }
    }

    fn binary(&self, op: BinOp, left: Value, right: Value) -> Exec<Value> {
        use Value::*;
        let result = match (op, &left, &right) {
            (BinOp::Add, Str(a), Str(b)) => Str(format!("{}{}", a, b)),
            (BinOp::Add, List(a), List(b)) => {
                let mut items = a.borrow().clone();
                items.extend(b.borrow().iter().cloned());
                Value::list(items)
            }
            (BinOp::Add, Int(a), Int(b)) => Int(a.checked_add(*b).ok_or_else(overflow)?),
            (BinOp::Sub, Int(a), Int(b)) => Int(a.checked_sub(*b).ok_or_else(overflow)?),
            (BinOp::Mul, Int(a), Int(b)) => Int(a.checked_mul(*b).ok_or_else(overflow)?),
            (BinOp::Mul, Str(s), Int(n)) | (BinOp::Mul, Int(n), Str(s)) => {
                if *n <= 0 {
                    Str(String::new())
                } else if s.len() as i64 * n > 10_000_000 {
                    return Err(Error::program_runtime("string repetition too large").into());
                } else {
                    Str(s.repeat(*n as usize))
                }
            }
            (BinOp::Div, _, _) => {
                let (a, b) = self.numeric_pair(op, &left, &right)?;
                if b == 0.0 {
                    return Err(Error::program_runtime("division by zero").into());
                }
                Float(a / b)
            }
            (BinOp::FloorDiv, Int(a), Int(b)) => {
                if *b == 0 {
                    return Err(Error::program_runtime("division by zero").into());
                }
                Int(a.div_euclid(*b))
            }
            (BinOp::Mod, Int(a), Int(b)) => {
                if *b == 0 {
                    return Err(Error::program_runtime("division by zero").into());
                }
                Int(a.rem_euclid(*b))
            }
            _ => {
                let (a, b) = self.numeric_pair(op, &left, &right)?;
                match op {
                    BinOp::Add => Float(a + b),
                    BinOp::Sub => Float(a - b),
                    BinOp::Mul => Float(a * b),
                    BinOp::FloorDiv => {
                        if b == 0.0 {
                            return Err(Error::program_runtime("division by zero").into());
                        }
                        Float((a / b).floor())
                    }
                    BinOp::Mod => {
                        if b == 0.0 {
                            return Err(Error::program_runtime("division by zero").into());
                        }
                        Float(a.rem_euclid(b))
                    }
                    BinOp::Div => unreachable!("handled above"),
                }
            }
        };
        Ok(result)
    }

    fn numeric_pair(&self, op: BinOp, left: &Value, right: &Value) -> Exec<(f64, f64)> {
        match (left.as_number(), right.as_number()) {
            (Some(a), Some(b)) => Ok((a, b)),
            _ => Err(Error::program_runtime(format!(
                "unsupported operand types for {:?}: '{}' and '{}'",
                op,
                left.type_name(),
                right.type_name()
            ))
            .into()),
        }
    }

    fn compare(&self, op: CmpOp, left: &Value, right: &Value) -> Exec<bool> {
        let result = match op {
            CmpOp::Eq => left.is_equal(right),
            CmpOp::Ne => !left.is_equal(right),
            CmpOp::In | CmpOp::NotIn => {
                let contains = self.contains(right, left)?;
                match op {
                    CmpOp::In => contains,
                    _ => !contains,
                }
            }
            ordered => {
                let ordering = left.compare(right).ok_or_else(|| {
                    Error::program_runtime(format!(
                        "cannot compare '{}' and '{}'",
                        left.type_name(),
                        right.type_name()
                    ))
                })?;
                match ordered {
                    CmpOp::Lt => ordering.is_lt(),
                    CmpOp::Le => ordering.is_le(),
                    CmpOp::Gt => ordering.is_gt(),
                    CmpOp::Ge => ordering.is_ge(),
                    _ => unreachable!("equality handled above"),
                }
            }
        };
        Ok(result)
    }

    fn contains(&self, container: &Value, needle: &Value) -> Exec<bool> {
        match container {
            Value::Str(haystack) => match needle {
                Value::Str(sub) => Ok(haystack.contains(sub.as_str())),
                other => Err(Error::program_runtime(format!(
                    "'in <str>' requires a string, not '{}'",
                    other.type_name()
                ))
                .into()),
            },
            Value::List(items) => Ok(items.borrow().iter().any(|v| v.is_equal(needle))),
            Value::Map(entries) => match needle {
                Value::Str(key) => Ok(entries.borrow().contains_key(key)),
                other => Err(Error::program_runtime(format!(
                    "'in <dict>' requires a string key, not '{}'",
                    other.type_name()
                ))
                .into()),
            },
            other => Err(Error::program_runtime(format!(
                "'{}' does not support membership tests",
                other.type_name()
            ))
            .into()),
        }
    }

    fn index_value(&self, obj: &Value, index: &Value) -> Result<Value> {
        match (obj, index) {
            (Value::Str(s), Value::Int(i)) => {
                let chars: Vec<char> = s.chars().collect();
                let idx = normalize_index(*i, chars.len())?;
                Ok(Value::Str(chars[idx].to_string()))
            }
            (Value::List(items), Value::Int(i)) => {
                let items = items.borrow();
                let idx = normalize_index(*i, items.len())?;
                Ok(items[idx].clone())
            }
            (Value::Map(entries), Value::Str(key)) =>

                entries.borrow().get(key).cloned().ok_or_else(|| {
                    Error::program_runtime(format!("key not found: '{}'", key))
                }),
            (Value::Map(_), other) => Err(Error::program_runtime(format!(
                "dict keys must be strings, not '{}'",
                other.type_name()
            ))),
            (other, _) => Err(Error::program_runtime(format!(
                "'{}' is not subscriptable",
                other.type_name()
            ))),
        }
    }

    fn slice_value(&self, obj: &Value, start: Option<i64>, stop: Option<i64>) -> Exec<Value> {
        match obj {
            Value::Str(s) => {
                let chars: Vec<char> = s.chars().collect();
                let (lo, hi) = slice_bounds(start, stop, chars.len());
                Ok(Value::Str(chars[lo..hi].iter().collect()))
            }
            Value::List(items) => {
                let items = items.borrow();
                let (lo, hi) = slice_bounds(start, stop, items.len());
                Ok(Value::list(items[lo..hi].to_vec()))
            }
            other => Err(Error::program_runtime(format!(
                "'{}' cannot be sliced",
                other.type_name()
            ))
            .into()),
        }
    }

    // ---- calls ----

    fn call(&mut self, func: Value, args: Vec<Value>) -> Exec<Value> {
        match func {
            Value::Builtin(builtin) => self.call_builtin(builtin, args),
            Value::Func(def) => self.call_user(def, args),
            other => Err(Error::program_runtime(format!(
                "'{}' is not callable",
                other.type_name()
            ))
            .into()),
        }
    }

    fn call_user(&mut self, def: Rc<FuncDef>, args: Vec<Value>) -> Exec<Value> {
        if args.len() != def.params.len() {
            return Err(Error::program_runtime(format!(
                "{}() takes {} arguments but {} were given",
                def.name,
                def.params.len(),
                args.len()
            ))
            .into());
        }
        if self.call_depth >= MAX_CALL_DEPTH {
            return Err(Error::program_runtime("maximum call depth exceeded").into());
        }

        let mut scope = HashMap::new();
        for (param, arg) in def.params.iter().zip(args) {
            scope.insert(param.clone(), arg);
        }

        self.locals.push(scope);
        self.call_depth += 1;
        let flow = self.exec_block(&def.body);
        self.call_depth -= 1;
        self.locals.pop();

        match flow? {
            Flow::Return(value) => Ok(value),
            _ => Ok(Value::Null),
        }
    }

    fn call_builtin(&mut self, builtin: Builtin, mut args: Vec<Value>) -> Exec<Value> {
        match builtin {
            Builtin::Final => {
                let value = take_one(builtin, args)?;
                Err(Interrupt::Final(value.stringify()?))
            }
            Builtin::LlmQuery => {
                let prompt = match take_one(builtin, args)? {
                    Value::Str(s) => s,
                    other => {
                        return Err(Error::program_runtime(format!(
                            "llm_query() requires a string prompt, not '{}'",
                            other.type_name()
                        ))
                        .into());
                    }
                };
                let memory = self.memory_snapshot();
                let answer = (self.llm_query)(&prompt, &memory)?;
                Ok(Value::Str(answer))
            }
            Builtin::Len => {
                let value = take_one(builtin, args)?;
                let len = match &value {
                    Value::Str(s) => s.chars().count(),
                    Value::List(items) => items.borrow().len(),
                    Value::Map(entries) => entries.borrow().len(),
                    other => {
                        return Err(Error::program_runtime(format!(
                            "'{}' has no length",
                            other.type_name()
                        ))
                        .into());
                    }
                };
                Ok(Value::Int(len as i64))
            }
            Builtin::Range => {
                let (start, stop, step) = match args.len() {
                    1 => (0, int_of(builtin, &args[0])?, 1),
                    2 => (int_of(builtin, &args[0])?, int_of(builtin, &args[1])?, 1),
                    3 => (
                        int_of(builtin, &args[0])?,
                        int_of(builtin, &args[1])?,
                        int_of(builtin, &args[2])?,
                    ),
                    n => {
                        return Err(arity(builtin, "1 to 3", n).into());
                    }
                };
                if step == 0 {
                    return Err(Error::program_runtime("range() step must not be zero").into());
                }
                let span = if step > 0 {
                    (stop - start).max(0)
                } else {
                    (start - stop).max(0)
                };
                let count = (span + step.abs() - 1) / step.abs();
                if count > MAX_RANGE_LEN {
                    return Err(Error::program_runtime(format!(
                        "range of {} elements exceeds the limit of {}",
                        count, MAX_RANGE_LEN
                    ))
                    .into());
                }
                let mut items = Vec::with_capacity(count as usize);
                let mut v = start;
                while (step > 0 && v < stop) || (step < 0 && v > stop) {
                    items.push(Value::Int(v));
                    v += step;
                }
                Ok(Value::list(items))
            }
            Builtin::Enumerate => {
                let items = take_one(builtin, args)?.iter_values()?;
                Ok(Value::list(
                    items
                        .into_iter()
                        .enumerate()
                        .map(|(i, v)| Value::list(vec![Value::Int(i as i64), v]))
                        .collect(),
                ))
            }
            Builtin::Min | Builtin::Max => {
                let values = if args.len() == 1 {
                    args.remove(0).iter_values()?
                } else if args.len() >= 2 {
                    args
                } else {
                    return Err(arity(builtin, "at least 1", args.len()).into());
                };
                if values.is_empty() {
                    return Err(Error::program_runtime(format!(
                        "{}() of an empty sequence",
                        builtin.name()
                    ))
                    .into());
                }
                let mut best = values[0].clone();
                for value in &values[1..] {
                    let ordering = value.compare(&best).ok_or_else(|| {
                        Error::program_runtime(format!(
                            "cannot compare '{}' and '{}'",
                            value.type_name(),
                            best.type_name()
                        ))
                    })?;
                    let better = match builtin {
                        Builtin::Min => ordering.is_lt(),
                        _ => ordering.is_gt(),
                    };
                    if better {
                        best = value.clone();
                    }
                }
                Ok(best)
            }
            Builtin::Sum => {
                let values = take_one(builtin, args)?.iter_values()?;
                let mut int_sum = 0i64;
                let mut float_sum = 0.0f64;
                let mut is_float = false;
                for value in values {
                    match value {
                        Value::Int(n) => {
                            int_sum = int_sum.checked_add(n).ok_or_else(overflow)?;
                        }
                        Value::Float(f) => {
                            is_float = true;
                            float_sum += f;
                        }
                        other => {
                            return Err(Error::program_runtime(format!(
                                "sum() requires numbers, not '{}'",
                                other.type_name()
                            ))
                            .into());
                        }
                    }
                }
                if is_float {
                    Ok(Value::Float(float_sum + int_sum as f64))
                } else {
                    Ok(Value::Int(int_sum))
                }
            }
            Builtin::Sorted => {
                let mut values = take_one(builtin, args)?.iter_values()?;
                let mut failed = None;
                values.sort_by(|a, b| match a.compare(b) {
                    Some(ordering) => ordering,
                    None => {
                        failed = Some((a.type_name(), b.type_name()));
                        std::cmp::Ordering::Equal
                    }
                });
                if let Some((a, b)) = failed {
                    return Err(Error::program_runtime(format!(
                        "cannot compare '{}' and '{}'",
                        a, b
                    ))
                    .into());
                }
                Ok(Value::list(values))
            }
            Builtin::Str => Ok(Value::Str(take_one(builtin, args)?.stringify()?)),
            Builtin::Int => {
                let value = take_one(builtin, args)?;
                match value {
                    Value::Int(n) => Ok(Value::Int(n)),
                    Value::Float(f) => Ok(Value::Int(f.trunc() as i64)),
                    Value::Bool(b) => Ok(Value::Int(b as i64)),
                    Value::Str(s) => s.trim().parse::<i64>().map(Value::Int).map_err(|_| {
                        Error::program_runtime(format!("invalid literal for int(): '{}'", s))
                            .into()
                    }),
                    other => Err(Error::program_runtime(format!(
                        "cannot convert '{}' to int",
                        other.type_name()
                    ))
                    .into()),
                }
            }
            Builtin::Float => {
                let value = take_one(builtin, args)?;
                match value {
                    Value::Int(n) => Ok(Value::Float(n as f64)),
                    Value::Float(f) => Ok(Value::Float(f)),
                    Value::Bool(b) => Ok(Value::Float(b as i64 as f64)),
                    Value::Str(s) => s.trim().parse::<f64>().map(Value::Float).map_err(|_| {
                        Error::program_runtime(format!("invalid literal for float(): '{}'", s))
                            .into()
                    }),
                    other => Err(Error::program_runtime(format!(
                        "cannot convert '{}' to float",
                        other.type_name()
                    ))
                    .into()),
                }
            }
            Builtin::Bool => Ok(Value::Bool(take_one(builtin, args)?.truthy())),
            Builtin::List => match args.len() {
                0 => Ok(Value::list(Vec::new())),
                1 => Ok(Value::list(args[0].iter_values()?)),
                n => Err(arity(builtin, "0 or 1", n).into()),
            },
            Builtin::Dict => match args.len() {
                0 => Ok(Value::map(BTreeMap::new())),
                1 => match &args[0] {
                    Value::Map(entries) => Ok(Value::map(entries.borrow().clone())),
                    other => Err(Error::program_runtime(format!(
                        "dict() requires a dict, not '{}'",
                        other.type_name()
                    ))
                    .into()),
                },
                n => Err(arity(builtin, "0 or 1", n).into()),
            },
        }
    }

    fn string_method(&self, obj: &Value, name: &str, args: Vec<Value>) -> Exec<Value> {
        let Value::Str(s) = obj else {
            return Err(Error::program_runtime(format!(
                "method '{}' requires a string, not '{}'",
                name,
                obj.type_name()
            ))
            .into());
        };

        match name {
            "split" => match args.len() {
                0 => Ok(Value::list(
                    s.split_whitespace()
                        .map(|part| Value::Str(part.to_string()))
                        .collect(),
                )),
                1 => {
                    let sep = str_arg(name, &args[0])?;
                    if sep.is_empty() {
                        return Err(Error::program_runtime("empty separator").into());
                    }
                    Ok(Value::list(
                        s.split(sep.as_str())
                            .map(|part| Value::Str(part.to_string()))
                            .collect(),
                    ))
                }
                n => Err(method_arity(name, "0 or 1", n).into()),
            },
            "join" => {
                let parts = exactly_one(name, args)?.iter_values()?;
                let mut joined = Vec::with_capacity(parts.len());
                for part in parts {
                    match part {
                        Value::Str(part) => joined.push(part),
                        other => {
                            return Err(Error::program_runtime(format!(
                                "join() requires strings, not '{}'",
                                other.type_name()
                            ))
                            .into());
                        }
                    }
                }
                Ok(Value::Str(joined.join(s)))
            }
            "strip" => match args.len() {
                0 => Ok(Value::Str(s.trim().to_string())),
                1 => {
                    let chars = str_arg(name, &args[0])?;
                    Ok(Value::Str(
                        s.trim_matches(|c| chars.contains(c)).to_string(),
                    ))
                }
                n => Err(method_arity(name, "0 or 1", n).into()),
            },
            "upper" => {
                no_args(name, &args)?;
                Ok(Value::Str(s.to_uppercase()))
            }
            "lower" => {
                no_args(name, &args)?;
                Ok(Value::Str(s.to_lowercase()))
            }
            "find" => {
                let needle = str_arg(name, &exactly_one(name, args)?)?;
                match s.find(needle.as_str()) {
                    Some(byte_idx) => Ok(Value::Int(s[..byte_idx].chars().count() as i64)),
                    None => Ok(Value::Int(-1)),
                }
            }
            "replace" => {
                if args.len() != 2 {
                    return Err(method_arity(name, "2", args.len()).into());
                }
                let old = str_arg(name, &args[0])?;
                let new = str_arg(name, &args[1])?;
                if old.is_empty() {
                    return Err(Error::program_runtime("empty replace pattern").into());
                }
                Ok(Value::Str(s.replace(old.as_str(), &new)))
            }
            "startswith" => {
                let prefix = str_arg(name, &exactly_one(name, args)?)?;
                Ok(Value::Bool(s.starts_with(prefix.as_str())))
            }
            "endswith" => {
                let suffix = str_arg(name, &exactly_one(name, args)?)?;
                Ok(Value::Bool(s.ends_with(suffix.as_str())))
            }
            other => Err(Error::sandbox_violation(format!(
                "method '{}' is not allowed",
                other
            ))
            .into()),
        }
    }
}

fn overflow() -> Error {
    Error::program_runtime("integer overflow")
}

fn normalize_index(index: i64, len: usize) -> Result<usize> {
    let len = len as i64;
    let idx = if index < 0 { len + index } else { index };
    if idx < 0 || idx >= len {
        return Err(Error::program_runtime(format!(
            "index {} out of range for length {}",
            index, len
        )));
    }
    Ok(idx as usize)
}

fn slice_bounds(start: Option<i64>, stop: Option<i64>, len: usize) -> (usize, usize) {
    let len = len as i64;
    let clamp = |v: i64| -> i64 {
        let v = if v < 0 { len + v } else { v };
        v.clamp(0, len)
    };
    let lo = clamp(start.unwrap_or(0));
    let hi = clamp(stop.unwrap_or(len));
    (lo as usize, lo.max(hi) as usize)
}

fn take_one(builtin: Builtin, mut args: Vec<Value>) -> Exec<Value> {
    if args.len() != 1 {
        return Err(arity(builtin, "1", args.len()).into());
    }
    Ok(args.remove(0))
}

fn exactly_one(method: &str, mut args: Vec<Value>) -> Exec<Value> {
    if args.len() != 1 {
        return Err(method_arity(method, "1", args.len()).into());
    }
    Ok(args.remove(0))
}

fn no_args(method: &str, args: &[Value]) -> Exec<()> {
    if args.is_empty() {
        Ok(())
    } else {
        Err(method_arity(method, "0", args.len()).into())
    }
}

fn arity(builtin: Builtin, expected: &str, got: usize) -> Error {
    Error::program_runtime(format!(
        "{}() takes {} arguments but {} were given",
        builtin.name(),
        expected,
        got
    ))
}

fn method_arity(method: &str, expected: &str, got: usize) -> Error {
    Error::program_runtime(format!(
        "{}() takes {} arguments but {} were given",
        method, expected, got
    ))
}

fn int_of(builtin: Builtin, value: &Value) -> Exec<i64> {
    match value {
        Value::Int(n) => Ok(*n),
        other => Err(Error::program_runtime(format!(
            "{}() requires integers, not '{}'",
            builtin.name(),
            other.type_name()
        ))
        .into()),
    }
}

fn str_arg(method: &str, value: &Value) -> Exec<String> {
    match value {
        Value::Str(s) => Ok(s.clone()),
        other => Err(Error::program_runtime(format!(
            "{}() requires a string, not '{}'",
            method,
            other.type_name()
        ))
        .into()),
    }
}

#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn slice_bounds_stay_within_length(
            start in proptest::option::of(-50i64..50),
            stop in proptest::option::of(-50i64..50),
            len in 0usize..40,
        ) {
            let (lo, hi) = slice_bounds(start, stop, len);
            prop_assert!(lo <= hi);
            prop_assert!(hi <= len);
        }

        #[test]
        fn full_slice_is_identity(len in 0usize..40) {
            prop_assert_eq!(slice_bounds(None, None, len), (0, len));
        }

        #[test]
        fn normalized_index_is_in_range(index in -100i64..100, len in 1usize..40) {
            match normalize_index(index, len) {
                Ok(idx) => prop_assert!(idx < len),
                Err(_) => {
                    prop_assert!(index >= len as i64 || index < -(len as i64));
                }
            }
        }
    }
}
