//! Recursive-descent parser for the minimal scripting language.
//!
//! The parser is the allow-list: anything outside the documented statement
//! and expression forms is rejected with a sandbox violation naming the
//! offending construct. Notably `import`, `while`, `lambda`, `class`, `try`,
//! and attribute access outside the whitelisted string methods never make it
//! past this stage.

use std::rc::Rc;

use crate::error::{Error, Result};

use super::ast::{
    AssignOp, BinOp, BoolOp, CmpOp, Expr, FuncDef, Literal, Program, Stmt, Target, UnaryOp,
};
use super::lexer::{tokenize, Kw, Op, Tok};

/// String methods callable from programs.
pub const STRING_METHODS: &[&str] = &[
    "split",
    "join",
    "strip",
    "upper",
    "lower",
    "find",
    "replace",
    "startswith",
    "endswith",
];

/// Parse a program source string.
pub fn parse(source: &str) -> Result<Program> {
    let tokens = tokenize(source)?;
    let mut parser = Parser { tokens, pos: 0 };
    parser.program()
}

struct Parser {
    tokens: Vec<Tok>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> &Tok {
        self.tokens.get(self.pos).unwrap_or(&Tok::Eof)
    }

    fn bump(&mut self) -> Tok {
        let tok = self.tokens.get(self.pos).cloned().unwrap_or(Tok::Eof);
        self.pos += 1;
        tok
    }

    fn eat_op(&mut self, op: Op) -> bool {
        if *self.peek() == Tok::Op(op) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect_op(&mut self, op: Op, context: &str) -> Result<()> {
        if self.eat_op(op) {
            Ok(())
        } else {
            Err(self.unexpected(context))
        }
    }

    fn eat_kw(&mut self, kw: Kw) -> bool {
        if *self.peek() == Tok::Keyword(kw) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn unexpected(&self, context: &str) -> Error {
        Error::sandbox_violation(format!(
            "unexpected {} while parsing {}",
            describe(self.peek()),
            context
        ))
    }

    fn program(&mut self) -> Result<Program> {
        let mut body = Vec::new();
        loop {
            match self.peek() {
                Tok::Eof => break,
                Tok::Newline => {
                    self.pos += 1;
                }
                Tok::Indent | Tok::Dedent => {
                    return Err(Error::sandbox_violation("unexpected indentation"));
                }
                _ => body.append(&mut self.statement_line()?),
            }
        }
        Ok(Program { body })
    }

    /// One logical line: a compound statement, or `;`-separated simple
    /// statements.
    fn statement_line(&mut self) -> Result<Vec<Stmt>> {
        if let Tok::Keyword(kw) = self.peek() {
            match kw {
                Kw::If => return Ok(vec![self.if_stmt()?]),
                Kw::For => return Ok(vec![self.for_stmt()?]),
                Kw::Def => return Ok(vec![self.def_stmt()?]),
                Kw::Import | Kw::From => {
                    self.pos += 1;
                    let module = match self.peek() {
                        Tok::Name(name) => name.clone(),
                        _ => "<unknown>".to_string(),
                    };
                    return Err(Error::sandbox_violation(format!(
                        "import of '{}' is not allowed",
                        module
                    )));
                }
                Kw::While
                | Kw::Lambda
                | Kw::Class
                | Kw::Try
                | Kw::Except
                | Kw::Finally
                | Kw::Raise
                | Kw::With
                | Kw::Del
                | Kw::Global
                | Kw::Nonlocal
                | Kw::Yield
                | Kw::Assert
                | Kw::Async
                | Kw::Await => {
                    return Err(Error::sandbox_violation(format!(
                        "'{}' is not allowed",
                        kw.as_str()
                    )));
                }
                _ => {}
            }
        }
        self.simple_stmt_line()
    }

    fn simple_stmt_line(&mut self) -> Result<Vec<Stmt>> {
        let mut stmts = vec![self.simple_stmt()?];
        while self.eat_op(Op::Semicolon) {
            if matches!(self.peek(), Tok::Newline | Tok::Eof) {
                break;
            }
            stmts.push(self.simple_stmt()?);
        }
        self.end_of_line()?;
        Ok(stmts)
    }

    fn end_of_line(&mut self) -> Result<()> {
        match self.peek() {
            Tok::Newline => {
                self.pos += 1;
                Ok(())
            }
            Tok::Eof => Ok(()),
            _ => Err(self.unexpected("end of statement")),
        }
    }

    fn simple_stmt(&mut self) -> Result<Stmt> {
        match self.peek() {
            Tok::Keyword(Kw::Return) => {
                self.pos += 1;
                if matches!(self.peek(), Tok::Newline | Tok::Eof | Tok::Op(Op::Semicolon)) {
                    Ok(Stmt::Return(None))
                } else {
                    Ok(Stmt::Return(Some(self.expression()?)))
                }
            }
            Tok::Keyword(Kw::Pass) => {
                self.pos += 1;
                Ok(Stmt::Pass)
            }
            Tok::Keyword(Kw::Break) => {
                self.pos += 1;
                Ok(Stmt::Break)
            }
            Tok::Keyword(Kw::Continue) => {
                self.pos += 1;
                Ok(Stmt::Continue)
            }
            _ => self.assign_or_expr(),
        }
    }

    fn assign_or_expr(&mut self) -> Result<Stmt> {
        let expr = self.expression()?;

        let op = match self.peek() {
            Tok::Op(Op::Assign) => Some(AssignOp::Set),
            Tok::Op(Op::PlusAssign) => Some(AssignOp::Add),
            Tok::Op(Op::MinusAssign) => Some(AssignOp::Sub),
            Tok::Op(Op::StarAssign) => Some(AssignOp::Mul),
            Tok::Op(Op::SlashAssign) => Some(AssignOp::Div),
            Tok::Op(Op::Comma) => {
                return Err(Error::sandbox_violation(
                    "tuple assignment is not allowed",
                ));
            }
            _ => None,
        };

        let Some(op) = op else {
            return Ok(Stmt::Expr(expr));
        };
        self.pos += 1;

        let target = match expr {
            Expr::Name(name) => Target::Name(name),
            Expr::Index { obj, index } => Target::Index {
                obj: *obj,
                index: *index,
            },
            other => {
                return Err(Error::sandbox_violation(format!(
                    "cannot assign to {}",
                    expr_kind(&other)
                )));
            }
        };

        let value = self.expression()?;
        Ok(Stmt::Assign { target, op, value })
    }

    fn if_stmt(&mut self) -> Result<Stmt> {
        self.pos += 1; // if
        let mut branches = vec![(self.expression()?, self.block()?)];
        let mut orelse = Vec::new();
        loop {
            if self.eat_kw(Kw::Elif) {
                branches.push((self.expression()?, self.block()?));
            } else if self.eat_kw(Kw::Else) {
                orelse = self.block()?;
                break;
            } else {
                break;
            }
        }
        Ok(Stmt::If { branches, orelse })
    }

    fn for_stmt(&mut self) -> Result<Stmt> {
        self.pos += 1; // for
        let mut targets = vec![self.name("loop variable")?];
        while self.eat_op(Op::Comma) {
            targets.push(self.name("loop variable")?);
        }
        if !self.eat_kw(Kw::In) {
            return Err(self.unexpected("for statement"));
        }
        let iter = self.expression()?;
        let body = self.block()?;
        Ok(Stmt::For {
            targets,
            iter,
            body,
        })
    }

    fn def_stmt(&mut self) -> Result<Stmt> {
        self.pos += 1; // def
        let name = self.name("function name")?;
        self.expect_op(Op::LParen, "function parameters")?;
        let mut params = Vec::new();
        if !self.eat_op(Op::RParen) {
            loop {
                params.push(self.name("function parameter")?);
                if self.eat_op(Op::RParen) {
                    break;
                }
                self.expect_op(Op::Comma, "function parameters")?;
            }
        }
        let body = self.block()?;
        Ok(Stmt::FuncDef(Rc::new(FuncDef { name, params, body })))
    }

    /// `:` then either an inline simple-statement suite or an indented block.
    fn block(&mut self) -> Result<Vec<Stmt>> {
        self.expect_op(Op::Colon, "block")?;

        if *self.peek() != Tok::Newline {
            return self.simple_stmt_line();
        }
        self.pos += 1; // newline

        if self.bump() != Tok::Indent {
            return Err(Error::sandbox_violation("expected an indented block"));
        }

        let mut body = Vec::new();
        loop {
            match self.peek() {
                Tok::Dedent => {
                    self.pos += 1;
                    break;
                }
                Tok::Eof => break,
                Tok::Newline => {
                    self.pos += 1;
                }
                _ => body.append(&mut self.statement_line()?),
            }
        }
        Ok(body)
    }

    fn name(&mut self, context: &str) -> Result<String> {
        match self.bump() {
            Tok::Name(name) => Ok(name),
            _ => {
                self.pos -= 1;
                Err(self.unexpected(context))
            }
        }
    }

    // ---- expressions ----

    fn expression(&mut self) -> Result<Expr> {
        self.or_expr()
    }

    fn or_expr(&mut self) -> Result<Expr> {
        let first = self.and_expr()?;
        if *self.peek() != Tok::Keyword(Kw::Or) {
            return Ok(first);
        }
        let mut values = vec![first];
        while self.eat_kw(Kw::Or) {
            values.push(self.and_expr()?);
        }
        Ok(Expr::Bool {
            op: BoolOp::Or,
            values,
        })
    }

    fn and_expr(&mut self) -> Result<Expr> {
        let first = self.not_expr()?;
        if *self.peek() != Tok::Keyword(Kw::And) {
            return Ok(first);
        }
        let mut values = vec![first];
        while self.eat_kw(Kw::And) {
            values.push(self.not_expr()?);
        }
        Ok(Expr::Bool {
            op: BoolOp::And,
            values,
        })
    }

    fn not_expr(&mut self) -> Result<Expr> {
        if self.eat_kw(Kw::Not) {
            Ok(Expr::Unary {
                op: UnaryOp::Not,
                operand: Box::new(self.not_expr()?),
            })
        } else {
            self.comparison()
        }
    }

    fn comparison(&mut self) -> Result<Expr> {
        let left = self.arith()?;
        let mut ops = Vec::new();
        loop {
            let op = match self.peek() {
                Tok::Op(Op::Eq) => CmpOp::Eq,
                Tok::Op(Op::Ne) => CmpOp::Ne,
                Tok::Op(Op::Lt) => CmpOp::Lt,
                Tok::Op(Op::Le) => CmpOp::Le,
                Tok::Op(Op::Gt) => CmpOp::Gt,
                Tok::Op(Op::Ge) => CmpOp::Ge,
                Tok::Keyword(Kw::In) => CmpOp::In,
                Tok::Keyword(Kw::Not) => {
                    // `not in`
                    if self.tokens.get(self.pos + 1) == Some(&Tok::Keyword(Kw::In)) {
                        self.pos += 1;
                        CmpOp::NotIn
                    } else {
                        break;
                    }
                }
                _ => break,
            };
            self.pos += 1;
            ops.push((op, self.arith()?));
        }

        if ops.is_empty() {
            Ok(left)
        } else {
            Ok(Expr::Compare {
                left: Box::new(left),
                ops,
            })
        }
    }

    fn arith(&mut self) -> Result<Expr> {
        let mut left = self.term()?;
        loop {
            let op = match self.peek() {
                Tok::Op(Op::Plus) => BinOp::Add,
                Tok::Op(Op::Minus) => BinOp::Sub,
                _ => break,
            };
            self.pos += 1;
            let right = self.term()?;
            left = Expr::Binary {
                op,
                left: Box::new(left),
                right: Box::new(right),
            };
        }
        Ok(left)
    }

    fn term(&mut self) -> Result<Expr> {
        let mut left = self.factor()?;
        loop {
            let op = match self.peek() {
                Tok::Op(Op::Star) => BinOp::Mul,
                Tok::Op(Op::Slash) => BinOp::Div,
                Tok::Op(Op::DoubleSlash) => BinOp::FloorDiv,
                Tok::Op(Op::Percent) => BinOp::Mod,
                _ => break,
            };
            self.pos += 1;
            let right = self.factor()?;
            left = Expr::Binary {
                op,
                left: Box::new(left),
                right: Box::new(right),
            };
        }
        Ok(left)
    }

    fn factor(&mut self) -> Result<Expr> {
        if self.eat_op(Op::Minus) {
            Ok(Expr::Unary {
                op: UnaryOp::Neg,
                operand: Box::new(self.factor()?),
            })
        } else {
            self.postfix()
        }
    }

    fn postfix(&mut self) -> Result<Expr> {
        let mut expr = self.atom()?;
        loop {
            if self.eat_op(Op::LParen) {
                let args = self.call_args()?;
                expr = Expr::Call {
                    func: Box::new(expr),
                    args,
                };
            } else if self.eat_op(Op::LBracket) {
                expr = self.subscript(expr)?;
            } else if self.eat_op(Op::Dot) {
                let name = self.name("method name")?;
                if !STRING_METHODS.contains(&name.as_str()) {
                    return Err(Error::sandbox_violation(format!(
                        "method '{}' is not allowed",
                        name
                    )));
                }
                self.expect_op(Op::LParen, "method call")?;
                let args = self.call_args()?;
                expr = Expr::Method {
                    obj: Box::new(expr),
                    name,
                    args,
                };
            } else {
                break;
            }
        }
        Ok(expr)
    }

    fn call_args(&mut self) -> Result<Vec<Expr>> {
        let mut args = Vec::new();
        if self.eat_op(Op::RParen) {
            return Ok(args);
        }
        loop {
            args.push(self.expression()?);
            if self.eat_op(Op::RParen) {
                break;
            }
            self.expect_op(Op::Comma, "call arguments")?;
        }
        Ok(args)
    }

    fn subscript(&mut self, obj: Expr) -> Result<Expr> {
        // `[expr]`, `[start:stop]`, `[:stop]`, `[start:]`, `[:]`
        let start = if *self.peek() == Tok::Op(Op::Colon) {
            None
        } else {
            Some(Box::new(self.expression()?))
        };

        if self.eat_op(Op::Colon) {
            let stop = if *self.peek() == Tok::Op(Op::RBracket) {
                None
            } else {
                Some(Box::new(self.expression()?))
            };
            if *self.peek() == Tok::Op(Op::Colon) {
                return Err(Error::sandbox_violation("slice step is not allowed"));
            }
            self.expect_op(Op::RBracket, "slice")?;
            Ok(Expr::Slice {
                obj: Box::new(obj),
                start,
                stop,
            })
        } else {
            self.expect_op(Op::RBracket, "subscript")?;
            let index = start.ok_or_else(|| Error::sandbox_violation("empty subscript"))?;
            Ok(Expr::Index {
                obj: Box::new(obj),
                index,
            })
        }
    }

    fn atom(&mut self) -> Result<Expr> {
        match self.bump() {
            Tok::Int(n) => Ok(Expr::Literal(Literal::Int(n))),
            Tok::Float(f) => Ok(Expr::Literal(Literal::Float(f))),
            Tok::Str(s) => Ok(Expr::Literal(Literal::Str(s))),
            Tok::Keyword(Kw::True) => Ok(Expr::Literal(Literal::Bool(true))),
            Tok::Keyword(Kw::False) => Ok(Expr::Literal(Literal::Bool(false))),
            Tok::Keyword(Kw::None) => Ok(Expr::Literal(Literal::Null)),
            Tok::Name(name) => Ok(Expr::Name(name)),
            Tok::Op(Op::LParen) => {
                let expr = self.expression()?;
                self.expect_op(Op::RParen, "parenthesized expression")?;
                Ok(expr)
            }
            Tok::Op(Op::LBracket) => {
                let mut items = Vec::new();
                if self.eat_op(Op::RBracket) {
                    return Ok(Expr::List(items));
                }
                loop {
                    items.push(self.expression()?);
                    if self.eat_op(Op::RBracket) {
                        break;
                    }
                    self.expect_op(Op::Comma, "list literal")?;
                    if self.eat_op(Op::RBracket) {
                        break; // trailing comma
                    }
                }
                Ok(Expr::List(items))
            }
            Tok::Op(Op::LBrace) => {
                let mut entries = Vec::new();
                if self.eat_op(Op::RBrace) {
                    return Ok(Expr::Dict(entries));
                }
                loop {
                    let key = self.expression()?;
                    if !self.eat_op(Op::Colon) {
                        return Err(Error::sandbox_violation("set literals are not allowed"));
                    }
                    let value = self.expression()?;
                    entries.push((key, value));
                    if self.eat_op(Op::RBrace) {
                        break;
                    }
                    self.expect_op(Op::Comma, "dict literal")?;
                    if self.eat_op(Op::RBrace) {
                        break; // trailing comma
                    }
                }
                Ok(Expr::Dict(entries))
            }
            Tok::Keyword(Kw::Lambda) => {
                Err(Error::sandbox_violation("'lambda' is not allowed"))
            }
            other => {
                self.pos -= 1;
                let _ = other;
                Err(self.unexpected("expression"))
            }
        }
    }
}

fn describe(tok: &Tok) -> String {
    match tok {
        Tok::Name(name) => format!("name '{}'", name),
        Tok::Keyword(kw) => format!("keyword '{}'", kw.as_str()),
        Tok::Int(n) => format!("integer {}", n),
        Tok::Float(f) => format!("float {}", f),
        Tok::Str(_) => "string literal".to_string(),
        Tok::Op(op) => format!("operator {:?}", op),
        Tok::Newline => "end of line".to_string(),
        Tok::Indent => "indent".to_string(),
        Tok::Dedent => "dedent".to_string(),
        Tok::Eof => "end of program".to_string(),
    }
}

fn expr_kind(expr: &Expr) -> &'static str {
    match expr {
        Expr::Literal(_) => "a literal",
        Expr::Call { .. } | Expr::Method { .. } => "a call result",
        Expr::Slice { .. } => "a slice",
        _ => "this expression",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_assignment_and_call() {
        let program = parse("result = llm_query('summarize')\nFINAL(result)\n").unwrap();
        assert_eq!(program.body.len(), 2);
        assert!(matches!(program.body[0], Stmt::Assign { .. }));
        assert!(matches!(program.body[1], Stmt::Expr(Expr::Call { .. })));
    }

    #[test]
    fn test_parse_for_with_unpacking() {
        let program = parse("for i, chunk in enumerate(chunks):\n    x = i\n").unwrap();
        match &program.body[0] {
            Stmt::For { targets, .. } => assert_eq!(targets, &["i", "chunk"]),
            other => panic!("expected for, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_if_elif_else() {
        let program = parse("if a:\n    x = 1\nelif b:\n    x = 2\nelse:\n    x = 3\n").unwrap();
        match &program.body[0] {
            Stmt::If { branches, orelse } => {
                assert_eq!(branches.len(), 2);
                assert_eq!(orelse.len(), 1);
            }
            other => panic!("expected if, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_def() {
        let program = parse("def half(n):\n    return n // 2\n").unwrap();
        match &program.body[0] {
            Stmt::FuncDef(f) => {
                assert_eq!(f.name, "half");
                assert_eq!(f.params, vec!["n"]);
            }
            other => panic!("expected def, got {:?}", other),
        }
    }

    #[test]
    fn test_import_is_violation_naming_module() {
        let err = parse("import os; FINAL(os.getcwd())\n").unwrap_err();
        assert!(err.to_string().contains("os"));
        assert!(matches!(err, Error::SandboxViolation { .. }));
    }

    #[test]
    fn test_while_is_violation() {
        let err = parse("while True:\n    pass\n").unwrap_err();
        assert!(err.to_string().contains("while"));
    }

    #[test]
    fn test_unlisted_method_is_violation() {
        let err = parse("x = items.append(1)\n").unwrap_err();
        assert!(err.to_string().contains("append"));
    }

    #[test]
    fn test_bare_attribute_is_violation() {
        let err = parse("x = obj.field\n").unwrap_err();
        assert!(matches!(err, Error::SandboxViolation { .. }));
    }

    #[test]
    fn test_slice_forms() {
        let program = parse("a = s[10:20]\nb = s[:5]\nc = s[5:]\nd = s[3]\n").unwrap();
        assert_eq!(program.body.len(), 4);
        assert!(matches!(
            program.body[3],
            Stmt::Assign {
                value: Expr::Index { .. },
                ..
            }
        ));
    }

    #[test]
    fn test_slice_step_is_violation() {
        let err = parse("a = s[::2]\n").unwrap_err();
        assert!(err.to_string().contains("slice step"));
    }

    #[test]
    fn test_chained_comparison() {
        let program = parse("ok = 0 <= i < n\n").unwrap();
        match &program.body[0] {
            Stmt::Assign {
                value: Expr::Compare { ops, .. },
                ..
            } => assert_eq!(ops.len(), 2),
            other => panic!("expected comparison, got {:?}", other),
        }
    }

    #[test]
    fn test_not_in() {
        let program = parse("ok = key not in memory\n").unwrap();
        match &program.body[0] {
            Stmt::Assign {
                value: Expr::Compare { ops, .. },
                ..
            } => assert_eq!(ops[0].0, CmpOp::NotIn),
            other => panic!("expected comparison, got {:?}", other),
        }
    }

    #[test]
    fn test_inline_suite() {
        let program = parse("if done: FINAL(answer)\n").unwrap();
        match &program.body[0] {
            Stmt::If { branches, .. } => assert_eq!(branches[0].1.len(), 1),
            other => panic!("expected if, got {:?}", other),
        }
    }

    #[test]
    fn test_augmented_assignment() {
        let program = parse("total += part\n").unwrap();
        assert!(matches!(
            program.body[0],
            Stmt::Assign {
                op: AssignOp::Add,
                ..
            }
        ));
    }

    #[test]
    fn test_index_assignment_target() {
        let program = parse("memory['summary'] = text\n").unwrap();
        assert!(matches!(
            program.body[0],
            Stmt::Assign {
                target: Target::Index { .. },
                ..
            }
        ));
    }

    #[test]
    fn test_tuple_assignment_is_violation() {
        let err = parse("a, b = pair\n").unwrap_err();
        assert!(err.to_string().contains("tuple assignment"));
    }

    #[test]
    fn test_dict_literal() {
        let program = parse("m = {'a': 1, 'b': 2}\n").unwrap();
        match &program.body[0] {
            Stmt::Assign {
                value: Expr::Dict(entries),
                ..
            } => assert_eq!(entries.len(), 2),
            other => panic!("expected dict, got {:?}", other),
        }
    }

    #[test]
    fn test_set_literal_is_violation() {
        let err = parse("s = {1, 2}\n").unwrap_err();
        assert!(err.to_string().contains("set literals"));
    }
}
