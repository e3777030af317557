//! Lexer for Opal source text. Produces a token stream with byte-offset
//! spans; the first malformed token aborts the phase.

use crate::common::error::{Diagnostic, Phase};
use crate::common::source::Span;

#[derive(Debug, Clone, PartialEq)]
pub enum TokenKind {
    Ident(String),
    Int(i64),
    Float(f64),
    Namespace,
    Static,
    Extern,
    If,
    Else,
    While,
    Return,
    True,
    False,
    As,
    LBrace,
    RBrace,
    LParen,
    RParen,
    LBracket,
    RBracket,
    Semicolon,
    Comma,
    Assign,
    Eq,
    Ne,
    Lt,
    Gt,
    Le,
    Ge,
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    Shl,
    Shr,
    Amp,
    Pipe,
    Eof,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub kind: TokenKind,
    pub span: Span,
}

pub struct Lexer<'a> {
    source: &'a [u8],
    pos: usize,
    file_id: u32,
}

impl<'a> Lexer<'a> {
    pub fn new(source: &'a str, file_id: u32) -> Self {
        Self { source: source.as_bytes(), pos: 0, file_id }
    }

    pub fn tokenize(&mut self) -> Result<Vec<Token>, Diagnostic> {
        let mut tokens = Vec::new();
        loop {
            let token = self.next_token()?;
            let eof = token.kind == TokenKind::Eof;
            tokens.push(token);
            if eof {
                return Ok(tokens);
            }
        }
    }

    fn peek(&self) -> u8 {
        self.source.get(self.pos).copied().unwrap_or(0)
    }

    fn peek2(&self) -> u8 {
        self.source.get(self.pos + 1).copied().unwrap_or(0)
    }

    fn span_from(&self, start: usize) -> Span {
        Span::new(start as u32, self.pos as u32, self.file_id)
    }

    fn skip_trivia(&mut self) {
        loop {
            match self.peek() {
                b' ' | b'\t' | b'\r' | b'\n' => self.pos += 1,
                b'/' if self.peek2() == b'/' => {
                    while self.pos < self.source.len() && self.peek() != b'\n' {
                        self.pos += 1;
                    }
                }
                _ => return,
            }
        }
    }

    fn next_token(&mut self) -> Result<Token, Diagnostic> {
        self.skip_trivia();
        let start = self.pos;
        if self.pos >= self.source.len() {
            return Ok(Token { kind: TokenKind::Eof, span: self.span_from(start) });
        }

        let c = self.peek();
        if c.is_ascii_alphabetic() || c == b'_' {
            while self.peek().is_ascii_alphanumeric() || self.peek() == b'_' {
                self.pos += 1;
            }
            let text = std::str::from_utf8(&self.source[start..self.pos]).unwrap();
            let kind = match text {
                "namespace" => TokenKind::Namespace,
                "static" => TokenKind::Static,
                "extern" => TokenKind::Extern,
                "if" => TokenKind::If,
                "else" => TokenKind::Else,
                "while" => TokenKind::While,
                "return" => TokenKind::Return,
                "true" => TokenKind::True,
                "false" => TokenKind::False,
                "as" => TokenKind::As,
                _ => TokenKind::Ident(text.to_string()),
            };
            return Ok(Token { kind, span: self.span_from(start) });
        }

        if c.is_ascii_digit() {
            while self.peek().is_ascii_digit() {
                self.pos += 1;
            }
            let mut is_float = false;
            if self.peek() == b'.' && self.peek2().is_ascii_digit() {
                is_float = true;
                self.pos += 1;
                while self.peek().is_ascii_digit() {
                    self.pos += 1;
                }
            }
            let text = std::str::from_utf8(&self.source[start..self.pos]).unwrap();
            let kind = if is_float {
                match text.parse::<f64>() {
                    Ok(value) => TokenKind::Float(value),
                    Err(_) => {
                        return Err(Diagnostic::new(
                            Phase::Lex,
                            format!("malformed float literal `{}`", text),
                            self.span_from(start),
                        ))
                    }
                }
            } else {
                match text.parse::<i64>() {
                    Ok(value) => TokenKind::Int(value),
                    Err(_) => {
                        return Err(Diagnostic::new(
                            Phase::Lex,
                            format!("integer literal `{}` out of range", text),
                            self.span_from(start),
                        ))
                    }
                }
            };
            return Ok(Token { kind, span: self.span_from(start) });
        }

        let (kind, length) = match (c, self.peek2()) {
            (b'=', b'=') => (TokenKind::Eq, 2),
            (b'!', b'=') => (TokenKind::Ne, 2),
            (b'<', b'=') => (TokenKind::Le, 2),
            (b'>', b'=') => (TokenKind::Ge, 2),
            (b'<', b'<') => (TokenKind::Shl, 2),
            (b'>', b'>') => (TokenKind::Shr, 2),
            (b'=', _) => (TokenKind::Assign, 1),
            (b'<', _) => (TokenKind::Lt, 1),
            (b'>', _) => (TokenKind::Gt, 1),
            (b'{', _) => (TokenKind::LBrace, 1),
            (b'}', _) => (TokenKind::RBrace, 1),
            (b'(', _) => (TokenKind::LParen, 1),
            (b')', _) => (TokenKind::RParen, 1),
            (b'[', _) => (TokenKind::LBracket, 1),
            (b']', _) => (TokenKind::RBracket, 1),
            (b';', _) => (TokenKind::Semicolon, 1),
            (b',', _) => (TokenKind::Comma, 1),
            (b'+', _) => (TokenKind::Plus, 1),
            (b'-', _) => (TokenKind::Minus, 1),
            (b'*', _) => (TokenKind::Star, 1),
            (b'/', _) => (TokenKind::Slash, 1),
            (b'%', _) => (TokenKind::Percent, 1),
            (b'&', _) => (TokenKind::Amp, 1),
            (b'|', _) => (TokenKind::Pipe, 1),
            _ => {
                return Err(Diagnostic::new(
                    Phase::Lex,
                    format!("unexpected character `{}`", c as char),
                    Span::new(start as u32, start as u32 + 1, self.file_id),
                ))
            }
        };
        self.pos += length;
        Ok(Token { kind, span: self.span_from(start) })
    }
}
