//! 表达式语法分析
//!
//! 递归下降解析，优先级从低到高：
//! `or` < `and` < `not` < 比较（含 `in` / `not in`）< `+ -` < `* / // %` < 一元负号 < 后缀（属性、下标、调用）

use super::interpreter::Value;
use super::lexer::{Spanned, Token, syntax_error, tokenize};
use crate::evaluator::EvaluationError;
use std::fmt;

/// 最大嵌套深度，括号、一元运算与运算链都计入
pub(super) const MAX_DEPTH: usize = 100;

pub(super) fn nesting_error() -> EvaluationError {
    EvaluationError::new("expression nested too deeply")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    FloorDiv,
    Mod,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    In,
    NotIn,
}

impl fmt::Display for BinaryOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Add => "+",
            Self::Sub => "-",
            Self::Mul => "*",
            Self::Div => "/",
            Self::FloorDiv => "//",
            Self::Mod => "%",
            Self::Eq => "==",
            Self::Ne => "!=",
            Self::Lt => "<",
            Self::Le => "<=",
            Self::Gt => ">",
            Self::Ge => ">=",
            Self::In => "in",
            Self::NotIn => "not in",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal(Value),
    Name(String),
    List(Vec<Expr>),
    Attribute(Box<Expr>, String),
    Index(Box<Expr>, Box<Expr>),
    Call(String, Vec<Expr>),
    Neg(Box<Expr>),
    Not(Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Binary(BinaryOp, Box<Expr>, Box<Expr>),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Statement {
    Expr(Expr),
    Return(Expr),
}

/// 解析后的表达式程序
#[derive(Debug, Clone, PartialEq)]
pub struct Program {
    pub statements: Vec<Statement>,
}

/// 解析源码
pub fn parse(source: &str) -> Result<Program, EvaluationError> {
    let tokens = tokenize(source)?;
    let mut parser = Parser {
        tokens,
        pos: 0,
        depth: 0,
    };
    parser.program()
}

struct Parser {
    tokens: Vec<Spanned>,
    pos: usize,
    depth: usize,
}

impl Parser {
    fn peek(&self) -> &Token {
        &self.tokens[self.pos].token
    }

    fn peek_at(&self, offset: usize) -> &Token {
        let index = (self.pos + offset).min(self.tokens.len() - 1);
        &self.tokens[index].token
    }

    fn advance(&mut self) -> Token {
        let token = self.tokens[self.pos].token.clone();
        if self.pos < self.tokens.len() - 1 {
            self.pos += 1;
        }
        token
    }

    fn eat(&mut self, expected: &Token) -> bool {
        if self.peek() == expected {
            self.advance();
            true
        } else {
            false
        }
    }

    fn descend(&mut self) -> Result<(), EvaluationError> {
        self.depth += 1;
        if self.depth > MAX_DEPTH {
            return Err(nesting_error());
        }
        Ok(())
    }

    fn error(&self, message: impl fmt::Display) -> EvaluationError {
        let spanned = &self.tokens[self.pos];
        syntax_error(message, spanned.line, spanned.column)
    }

    fn expect(&mut self, expected: Token) -> Result<(), EvaluationError> {
        if self.eat(&expected) {
            Ok(())
        } else {
            Err(self.error(format!("expected {}, found {}", expected, self.peek())))
        }
    }

    fn program(&mut self) -> Result<Program, EvaluationError> {
        let mut statements = Vec::new();
        loop {
            while self.eat(&Token::Separator) {}
            if self.peek() == &Token::Eof {
                break;
            }

            let statement = if self.eat(&Token::Return) {
                Statement::Return(self.expression()?)
            } else {
                Statement::Expr(self.expression()?)
            };
            statements.push(statement);

            match self.peek() {
                Token::Separator | Token::Eof => {}
                other => return Err(self.error(format!("unexpected {}", other))),
            }
        }
        Ok(Program { statements })
    }

    fn expression(&mut self) -> Result<Expr, EvaluationError> {
        let depth = self.depth;
        self.descend()?;
        let expr = self.or_expr()?;
        self.depth = depth;
        Ok(expr)
    }

    fn or_expr(&mut self) -> Result<Expr, EvaluationError> {
        let depth = self.depth;
        let mut left = self.and_expr()?;
        while self.eat(&Token::Or) {
            self.descend()?;
            let right = self.and_expr()?;
            left = Expr::Or(Box::new(left), Box::new(right));
        }
        self.depth = depth;
        Ok(left)
    }

    fn and_expr(&mut self) -> Result<Expr, EvaluationError> {
        let depth = self.depth;
        let mut left = self.not_expr()?;
        while self.eat(&Token::And) {
            self.descend()?;
            let right = self.not_expr()?;
            left = Expr::And(Box::new(left), Box::new(right));
        }
        self.depth = depth;
        Ok(left)
    }

    fn not_expr(&mut self) -> Result<Expr, EvaluationError> {
        let depth = self.depth;
        let mut negations = 0;
        while self.eat(&Token::Not) {
            self.descend()?;
            negations += 1;
        }

        let mut expr = self.comparison()?;
        for _ in 0..negations {
            expr = Expr::Not(Box::new(expr));
        }
        self.depth = depth;
        Ok(expr)
    }

    fn comparison_op(&mut self) -> Option<BinaryOp> {
        let op = match self.peek() {
            Token::Eq => BinaryOp::Eq,
            Token::Ne => BinaryOp::Ne,
            Token::Lt => BinaryOp::Lt,
            Token::Le => BinaryOp::Le,
            Token::Gt => BinaryOp::Gt,
            Token::Ge => BinaryOp::Ge,
            Token::In => BinaryOp::In,
            Token::Not if self.peek_at(1) == &Token::In => {
                self.advance();
                BinaryOp::NotIn
            }
            _ => return None,
        };
        self.advance();
        Some(op)
    }

    /// 比较运算不支持链式写法（`a < b < c`）
    fn comparison(&mut self) -> Result<Expr, EvaluationError> {
        let left = self.additive()?;
        match self.comparison_op() {
            Some(op) => {
                let right = self.additive()?;
                Ok(Expr::Binary(op, Box::new(left), Box::new(right)))
            }
            None => Ok(left),
        }
    }

    fn additive(&mut self) -> Result<Expr, EvaluationError> {
        let depth = self.depth;
        let mut left = self.multiplicative()?;
        loop {
            let op = match self.peek() {
                Token::Plus => BinaryOp::Add,
                Token::Minus => BinaryOp::Sub,
                _ => {
                    self.depth = depth;
                    return Ok(left);
                }
            };
            self.advance();
            self.descend()?;
            let right = self.multiplicative()?;
            left = Expr::Binary(op, Box::new(left), Box::new(right));
        }
    }

    fn multiplicative(&mut self) -> Result<Expr, EvaluationError> {
        let depth = self.depth;
        let mut left = self.unary()?;
        loop {
            let op = match self.peek() {
                Token::Star => BinaryOp::Mul,
                Token::Slash => BinaryOp::Div,
                Token::DoubleSlash => BinaryOp::FloorDiv,
                Token::Percent => BinaryOp::Mod,
                _ => {
                    self.depth = depth;
                    return Ok(left);
                }
            };
            self.advance();
            self.descend()?;
            let right = self.unary()?;
            left = Expr::Binary(op, Box::new(left), Box::new(right));
        }
    }

    fn unary(&mut self) -> Result<Expr, EvaluationError> {
        let depth = self.depth;
        let mut negations = 0;
        while self.eat(&Token::Minus) {
            self.descend()?;
            negations += 1;
        }

        let mut expr = self.postfix()?;
        for _ in 0..negations {
            expr = Expr::Neg(Box::new(expr));
        }
        self.depth = depth;
        Ok(expr)
    }

    fn postfix(&mut self) -> Result<Expr, EvaluationError> {
        let depth = self.depth;
        let mut expr = self.primary()?;
        loop {
            if matches!(self.peek(), Token::Dot | Token::LBracket | Token::LParen) {
                self.descend()?;
            }
            match self.peek() {
                Token::Dot => {
                    self.advance();
                    match self.advance() {
                        Token::Ident(name) => expr = Expr::Attribute(Box::new(expr), name),
                        other => {
                            return Err(self.error(format!("expected attribute name, found {}", other)));
                        }
                    }
                }
                Token::LBracket => {
                    self.advance();
                    let index = self.expression()?;
                    self.expect(Token::RBracket)?;
                    expr = Expr::Index(Box::new(expr), Box::new(index));
                }
                Token::LParen => {
                    let Expr::Name(name) = expr else {
                        return Err(self.error("only named functions can be called"));
                    };
                    self.advance();
                    let args = self.sequence(Token::RParen)?;
                    expr = Expr::Call(name, args);
                }
                _ => {
                    self.depth = depth;
                    return Ok(expr);
                }
            }
        }
    }

    /// 逗号分隔的表达式序列，允许尾随逗号
    fn sequence(&mut self, close: Token) -> Result<Vec<Expr>, EvaluationError> {
        let mut items = Vec::new();
        loop {
            if self.eat(&close) {
                return Ok(items);
            }
            items.push(self.expression()?);
            if !self.eat(&Token::Comma) {
                self.expect(close)?;
                return Ok(items);
            }
        }
    }

    fn primary(&mut self) -> Result<Expr, EvaluationError> {
        let expr = match self.peek().clone() {
            Token::Int(v) => Expr::Literal(Value::Int(v)),
            Token::Float(v) => Expr::Literal(Value::Float(v)),
            Token::Str(s) => Expr::Literal(Value::Str(s)),
            Token::True => Expr::Literal(Value::Bool(true)),
            Token::False => Expr::Literal(Value::Bool(false)),
            Token::None => Expr::Literal(Value::None),
            Token::Ident(name) => Expr::Name(name),
            Token::LParen => {
                self.advance();
                let inner = self.expression()?;
                self.expect(Token::RParen)?;
                return Ok(inner);
            }
            Token::LBracket => {
                self.advance();
                return Ok(Expr::List(self.sequence(Token::RBracket)?));
            }
            other => return Err(self.error(format!("unexpected {}", other))),
        };
        self.advance();
        Ok(expr)
    }
}
