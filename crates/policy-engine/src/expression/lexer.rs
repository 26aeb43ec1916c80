//! 表达式词法分析

use crate::evaluator::EvaluationError;
use std::fmt;

#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    Int(i64),
    Float(f64),
    Str(String),
    Ident(String),

    // 关键字
    And,
    Or,
    Not,
    In,
    True,
    False,
    None,
    Return,

    // 标点
    LParen,
    RParen,
    LBracket,
    RBracket,
    Comma,
    Dot,
    /// 语句分隔：`;` 或括号外的换行
    Separator,

    // 运算符
    Plus,
    Minus,
    Star,
    Slash,
    DoubleSlash,
    Percent,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,

    Eof,
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int(v) => write!(f, "{}", v),
            Self::Float(v) => write!(f, "{}", v),
            Self::Str(s) => write!(f, "'{}'", s),
            Self::Ident(s) => write!(f, "{}", s),
            Self::And => write!(f, "and"),
            Self::Or => write!(f, "or"),
            Self::Not => write!(f, "not"),
            Self::In => write!(f, "in"),
            Self::True => write!(f, "True"),
            Self::False => write!(f, "False"),
            Self::None => write!(f, "None"),
            Self::Return => write!(f, "return"),
            Self::LParen => write!(f, "("),
            Self::RParen => write!(f, ")"),
            Self::LBracket => write!(f, "["),
            Self::RBracket => write!(f, "]"),
            Self::Comma => write!(f, ","),
            Self::Dot => write!(f, "."),
            Self::Separator => write!(f, "end of statement"),
            Self::Plus => write!(f, "+"),
            Self::Minus => write!(f, "-"),
            Self::Star => write!(f, "*"),
            Self::Slash => write!(f, "/"),
            Self::DoubleSlash => write!(f, "//"),
            Self::Percent => write!(f, "%"),
            Self::Eq => write!(f, "=="),
            Self::Ne => write!(f, "!="),
            Self::Lt => write!(f, "<"),
            Self::Le => write!(f, "<="),
            Self::Gt => write!(f, ">"),
            Self::Ge => write!(f, ">="),
            Self::Eof => write!(f, "end of input"),
        }
    }
}

/// 带位置的词法单元
#[derive(Debug, Clone, PartialEq)]
pub struct Spanned {
    pub token: Token,
    pub line: usize,
    pub column: usize,
}

pub fn syntax_error(message: impl fmt::Display, line: usize, column: usize) -> EvaluationError {
    EvaluationError::new(format!(
        "invalid syntax: {} (line {}, column {})",
        message, line, column
    ))
}

struct Lexer<'a> {
    chars: std::iter::Peekable<std::str::Chars<'a>>,
    line: usize,
    column: usize,
    /// 括号嵌套深度，括号内的换行不作为语句分隔
    depth: usize,
}

impl<'a> Lexer<'a> {
    fn bump(&mut self) -> Option<char> {
        let c = self.chars.next()?;
        if c == '\n' {
            self.line += 1;
            self.column = 1;
        } else {
            self.column += 1;
        }
        Some(c)
    }

    fn next_if(&mut self, expected: char) -> bool {
        if self.chars.peek() == Some(&expected) {
            self.bump();
            true
        } else {
            false
        }
    }

    fn number(&mut self, first: char, line: usize, column: usize) -> Result<Token, EvaluationError> {
        let mut text = String::from(first);
        let mut is_float = false;
        while let Some(&c) = self.chars.peek() {
            if c.is_ascii_digit() || c == '_' {
                text.push(c);
            } else if c == '.' && !is_float {
                is_float = true;
                text.push(c);
            } else {
                break;
            }
            self.bump();
        }
        let text = text.replace('_', "");
        if is_float {
            text.parse::<f64>()
                .map(Token::Float)
                .map_err(|_| syntax_error(format!("bad number {}", text), line, column))
        } else {
            text.parse::<i64>()
                .map(Token::Int)
                .map_err(|_| syntax_error(format!("bad number {}", text), line, column))
        }
    }

    fn string(&mut self, quote: char, line: usize, column: usize) -> Result<Token, EvaluationError> {
        let mut value = String::new();
        loop {
            match self.bump() {
                None | Some('\n') => {
                    return Err(syntax_error("unterminated string literal", line, column));
                }
                Some(c) if c == quote => return Ok(Token::Str(value)),
                Some('\\') => match self.bump() {
                    Some('n') => value.push('\n'),
                    Some('t') => value.push('\t'),
                    Some(c) => value.push(c),
                    None => return Err(syntax_error("unterminated string literal", line, column)),
                },
                Some(c) => value.push(c),
            }
        }
    }

    fn ident(&mut self, first: char) -> Token {
        let mut text = String::from(first);
        while let Some(&c) = self.chars.peek() {
            if c.is_alphanumeric() || c == '_' {
                text.push(c);
                self.bump();
            } else {
                break;
            }
        }
        match text.as_str() {
            "and" => Token::And,
            "or" => Token::Or,
            "not" => Token::Not,
            "in" => Token::In,
            "True" | "true" => Token::True,
            "False" | "false" => Token::False,
            "None" | "none" | "null" => Token::None,
            "return" => Token::Return,
            _ => Token::Ident(text),
        }
    }
}

/// 将源码切分为词法单元
pub fn tokenize(source: &str) -> Result<Vec<Spanned>, EvaluationError> {
    let mut lexer = Lexer {
        chars: source.chars().peekable(),
        line: 1,
        column: 1,
        depth: 0,
    };
    let mut tokens = Vec::new();

    loop {
        let (line, column) = (lexer.line, lexer.column);
        let Some(c) = lexer.bump() else {
            tokens.push(Spanned {
                token: Token::Eof,
                line,
                column,
            });
            return Ok(tokens);
        };

        let token = match c {
            ' ' | '\t' | '\r' => continue,
            '\n' if lexer.depth > 0 => continue,
            '\n' | ';' => Token::Separator,
            '#' => {
                while let Some(&c) = lexer.chars.peek() {
                    if c == '\n' {
                        break;
                    }
                    lexer.bump();
                }
                continue;
            }
            '(' => {
                lexer.depth += 1;
                Token::LParen
            }
            ')' => {
                lexer.depth = lexer.depth.saturating_sub(1);
                Token::RParen
            }
            '[' => {
                lexer.depth += 1;
                Token::LBracket
            }
            ']' => {
                lexer.depth = lexer.depth.saturating_sub(1);
                Token::RBracket
            }
            ',' => Token::Comma,
            '.' => Token::Dot,
            '+' => Token::Plus,
            '-' => Token::Minus,
            '*' => Token::Star,
            '%' => Token::Percent,
            '/' => {
                if lexer.next_if('/') {
                    Token::DoubleSlash
                } else {
                    Token::Slash
                }
            }
            '=' => {
                if lexer.next_if('=') {
                    Token::Eq
                } else {
                    return Err(syntax_error("assignment is not supported", line, column));
                }
            }
            '!' => {
                if lexer.next_if('=') {
                    Token::Ne
                } else {
                    return Err(syntax_error("unexpected character '!'", line, column));
                }
            }
            '<' => {
                if lexer.next_if('=') {
                    Token::Le
                } else {
                    Token::Lt
                }
            }
            '>' => {
                if lexer.next_if('=') {
                    Token::Ge
                } else {
                    Token::Gt
                }
            }
            '"' | '\'' => lexer.string(c, line, column)?,
            c if c.is_ascii_digit() => lexer.number(c, line, column)?,
            c if c.is_alphabetic() || c == '_' => lexer.ident(c),
            other => {
                return Err(syntax_error(
                    format!("unexpected character '{}'", other),
                    line,
                    column,
                ));
            }
        };

        tokens.push(Spanned {
            token,
            line,
            column,
        });
    }
}
