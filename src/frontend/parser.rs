//! Recursive-descent parser for Opal. Produces the AST or the first
//! parse error for the file.

use crate::common::error::{Diagnostic, Phase};
use crate::common::source::Span;
use crate::frontend::ast::*;
use crate::frontend::lexer::{Token, TokenKind};
use crate::ir::ir::{
    TypeId, TYPE_BOOLEAN, TYPE_F32, TYPE_F64, TYPE_I16, TYPE_I32, TYPE_I64, TYPE_I8, TYPE_U16,
    TYPE_U32, TYPE_U64, TYPE_U8, TYPE_VOID,
};

pub struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

fn primitive_type(name: &str) -> Option<TypeId> {
    Some(match name {
        "void" => TYPE_VOID,
        "bool" => TYPE_BOOLEAN,
        "i8" => TYPE_I8,
        "i16" => TYPE_I16,
        "i32" => TYPE_I32,
        "i64" => TYPE_I64,
        "u8" => TYPE_U8,
        "u16" => TYPE_U16,
        "u32" => TYPE_U32,
        "u64" => TYPE_U64,
        "f32" => TYPE_F32,
        "f64" => TYPE_F64,
        _ => return None,
    })
}

impl Parser {
    pub fn new(tokens: Vec<Token>) -> Self {
        Self { tokens, pos: 0 }
    }

    pub fn parse(&mut self) -> Result<Program, Diagnostic> {
        let mut program = Program::default();
        while !self.at(TokenKind::Eof) {
            program.namespaces.push(self.parse_namespace()?);
        }
        Ok(program)
    }

    fn peek(&self) -> &Token {
        &self.tokens[self.pos.min(self.tokens.len() - 1)]
    }

    fn at(&self, kind: TokenKind) -> bool {
        self.peek().kind == kind
    }

    fn advance(&mut self) -> Token {
        let token = self.peek().clone();
        if self.pos < self.tokens.len() - 1 {
            self.pos += 1;
        }
        token
    }

    fn expect(&mut self, kind: TokenKind, what: &str) -> Result<Token, Diagnostic> {
        if self.at(kind) {
            Ok(self.advance())
        } else {
            Err(self.error(format!("expected {}", what)))
        }
    }

    fn error(&self, message: String) -> Diagnostic {
        Diagnostic::new(Phase::Parse, message, self.peek().span)
    }

    fn eat(&mut self, kind: TokenKind) -> bool {
        if self.at(kind) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn parse_ident(&mut self, what: &str) -> Result<(String, Span), Diagnostic> {
        match self.peek().kind.clone() {
            TokenKind::Ident(name) => {
                let span = self.advance().span;
                Ok((name, span))
            }
            _ => Err(self.error(format!("expected {}", what))),
        }
    }

    fn parse_type(&mut self) -> Result<(TypeId, Span), Diagnostic> {
        let (name, span) = self.parse_ident("a type name")?;
        match primitive_type(&name) {
            Some(ty) => Ok((ty, span)),
            None => Err(Diagnostic::new(Phase::Parse, format!("unknown type `{}`", name), span)),
        }
    }

    fn parse_namespace(&mut self) -> Result<NamespaceDecl, Diagnostic> {
        let start = self.expect(TokenKind::Namespace, "`namespace`")?.span;
        let (name, _) = self.parse_ident("a namespace name")?;
        self.expect(TokenKind::LBrace, "`{`")?;

        let mut namespace =
            NamespaceDecl { name, functions: Vec::new(), statics: Vec::new(), span: start };
        while !self.at(TokenKind::RBrace) {
            if self.at(TokenKind::Eof) {
                return Err(self.error("unterminated namespace".to_string()));
            }
            if self.at(TokenKind::Extern) {
                namespace.functions.push(self.parse_extern()?);
                continue;
            }
            self.expect(TokenKind::Static, "`static` or `extern`")?;
            let (ty, _) = self.parse_type()?;
            let (name, name_span) = self.parse_ident("a declaration name")?;
            if self.at(TokenKind::LParen) {
                namespace.functions.push(self.parse_function(ty, name, name_span)?);
            } else {
                let init = if self.eat(TokenKind::Assign) {
                    Some(self.parse_expr()?)
                } else {
                    None
                };
                self.expect(TokenKind::Semicolon, "`;`")?;
                namespace.statics.push(StaticDecl { ty, name, init, span: name_span });
            }
        }
        self.expect(TokenKind::RBrace, "`}`")?;
        Ok(namespace)
    }

    fn parse_extern(&mut self) -> Result<FunctionDecl, Diagnostic> {
        self.expect(TokenKind::Extern, "`extern`")?;
        let (ret, _) = self.parse_type()?;
        let (name, span) = self.parse_ident("a function name")?;
        let params = self.parse_params()?;
        self.expect(TokenKind::Semicolon, "`;`")?;
        Ok(FunctionDecl { name, params, ret, body: Block::default(), is_extern: true, span })
    }

    fn parse_function(
        &mut self,
        ret: TypeId,
        name: String,
        span: Span,
    ) -> Result<FunctionDecl, Diagnostic> {
        let params = self.parse_params()?;
        let body = self.parse_block()?;
        Ok(FunctionDecl { name, params, ret, body, is_extern: false, span })
    }

    fn parse_params(&mut self) -> Result<Vec<Param>, Diagnostic> {
        self.expect(TokenKind::LParen, "`(`")?;
        let mut params = Vec::new();
        if !self.at(TokenKind::RParen) {
            loop {
                let (ty, _) = self.parse_type()?;
                let (name, span) = self.parse_ident("a parameter name")?;
                params.push(Param { ty, name, span });
                if !self.eat(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.expect(TokenKind::RParen, "`)`")?;
        Ok(params)
    }

    fn parse_block(&mut self) -> Result<Block, Diagnostic> {
        self.expect(TokenKind::LBrace, "`{`")?;
        let mut block = Block::default();
        while !self.at(TokenKind::RBrace) {
            if self.at(TokenKind::Eof) {
                return Err(self.error("unterminated block".to_string()));
            }
            block.stmts.push(self.parse_stmt()?);
        }
        self.expect(TokenKind::RBrace, "`}`")?;
        Ok(block)
    }

    fn parse_stmt(&mut self) -> Result<Stmt, Diagnostic> {
        let span = self.peek().span;
        match self.peek().kind.clone() {
            TokenKind::If => {
                self.advance();
                self.expect(TokenKind::LParen, "`(`")?;
                let cond = self.parse_cond()?;
                self.expect(TokenKind::RParen, "`)`")?;
                let then_block = self.parse_block()?;
                let else_block = if self.eat(TokenKind::Else) {
                    Some(self.parse_block()?)
                } else {
                    None
                };
                Ok(Stmt::If { cond, then_block, else_block, span })
            }
            TokenKind::While => {
                self.advance();
                self.expect(TokenKind::LParen, "`(`")?;
                let cond = self.parse_cond()?;
                self.expect(TokenKind::RParen, "`)`")?;
                let body = self.parse_block()?;
                Ok(Stmt::While { cond, body, span })
            }
            TokenKind::Return => {
                self.advance();
                let value = if self.at(TokenKind::Semicolon) {
                    None
                } else {
                    Some(self.parse_expr()?)
                };
                self.expect(TokenKind::Semicolon, "`;`")?;
                Ok(Stmt::Return { value, span })
            }
            TokenKind::Ident(name) if primitive_type(&name).is_some() => {
                let (ty, _) = self.parse_type()?;
                let array_size = if self.eat(TokenKind::LBracket) {
                    let size = match self.peek().kind {
                        TokenKind::Int(value) => {
                            self.advance();
                            value
                        }
                        _ => return Err(self.error("expected an array size".to_string())),
                    };
                    self.expect(TokenKind::RBracket, "`]`")?;
                    Some(size)
                } else {
                    None
                };
                let (name, _) = self.parse_ident("a variable name")?;
                let init = if self.eat(TokenKind::Assign) {
                    Some(self.parse_expr()?)
                } else {
                    None
                };
                self.expect(TokenKind::Semicolon, "`;`")?;
                Ok(Stmt::Decl { ty, array_size, name, init, span })
            }
            TokenKind::Ident(name) => {
                // Assignment, indexed assignment, or an expression
                // statement such as a call.
                if self.tokens[self.pos + 1].kind == TokenKind::Assign {
                    self.advance();
                    self.advance();
                    let value = self.parse_expr()?;
                    self.expect(TokenKind::Semicolon, "`;`")?;
                    return Ok(Stmt::Assign { name, value, span });
                }
                if self.tokens[self.pos + 1].kind == TokenKind::LBracket {
                    let checkpoint = self.pos;
                    self.advance();
                    self.advance();
                    let index = self.parse_expr()?;
                    self.expect(TokenKind::RBracket, "`]`")?;
                    if self.eat(TokenKind::Assign) {
                        let value = self.parse_expr()?;
                        self.expect(TokenKind::Semicolon, "`;`")?;
                        return Ok(Stmt::AssignIndex { name, index, value, span });
                    }
                    self.pos = checkpoint;
                }
                let expr = self.parse_expr()?;
                self.expect(TokenKind::Semicolon, "`;`")?;
                Ok(Stmt::Expr { expr, span })
            }
            _ => Err(self.error("expected a statement".to_string())),
        }
    }

    fn parse_cond(&mut self) -> Result<Cond, Diagnostic> {
        let span = self.peek().span;
        let left = self.parse_expr()?;
        let op = match self.peek().kind {
            TokenKind::Eq => CmpOp::Eq,
            TokenKind::Ne => CmpOp::Ne,
            TokenKind::Lt => CmpOp::Lt,
            TokenKind::Gt => CmpOp::Gt,
            TokenKind::Le => CmpOp::Le,
            TokenKind::Ge => CmpOp::Ge,
            _ => return Err(self.error("expected a comparison operator".to_string())),
        };
        self.advance();
        let right = self.parse_expr()?;
        Ok(Cond { left, op, right, span })
    }

    // Precedence, loosest first: | then & then shifts then additive then
    // multiplicative, with unary minus and postfix `as` casts innermost.
    fn parse_expr(&mut self) -> Result<Expr, Diagnostic> {
        self.parse_bitor()
    }

    fn parse_bitor(&mut self) -> Result<Expr, Diagnostic> {
        let mut left = self.parse_bitand()?;
        while self.at(TokenKind::Pipe) {
            let span = self.advance().span;
            let right = self.parse_bitand()?;
            left = Expr::Binary { op: BinOp::BitOr, left: Box::new(left), right: Box::new(right), span };
        }
        Ok(left)
    }

    fn parse_bitand(&mut self) -> Result<Expr, Diagnostic> {
        let mut left = self.parse_shift()?;
        while self.at(TokenKind::Amp) {
            let span = self.advance().span;
            let right = self.parse_shift()?;
            left = Expr::Binary { op: BinOp::BitAnd, left: Box::new(left), right: Box::new(right), span };
        }
        Ok(left)
    }

    fn parse_shift(&mut self) -> Result<Expr, Diagnostic> {
        let mut left = self.parse_additive()?;
        loop {
            let op = match self.peek().kind {
                TokenKind::Shl => BinOp::Shl,
                TokenKind::Shr => BinOp::Shr,
                _ => return Ok(left),
            };
            let span = self.advance().span;
            let right = self.parse_additive()?;
            left = Expr::Binary { op, left: Box::new(left), right: Box::new(right), span };
        }
    }

    fn parse_additive(&mut self) -> Result<Expr, Diagnostic> {
        let mut left = self.parse_multiplicative()?;
        loop {
            let op = match self.peek().kind {
                TokenKind::Plus => BinOp::Add,
                TokenKind::Minus => BinOp::Sub,
                _ => return Ok(left),
            };
            let span = self.advance().span;
            let right = self.parse_multiplicative()?;
            left = Expr::Binary { op, left: Box::new(left), right: Box::new(right), span };
        }
    }

    fn parse_multiplicative(&mut self) -> Result<Expr, Diagnostic> {
        let mut left = self.parse_cast()?;
        loop {
            let op = match self.peek().kind {
                TokenKind::Star => BinOp::Mul,
                TokenKind::Slash => BinOp::Div,
                TokenKind::Percent => BinOp::Mod,
                _ => return Ok(left),
            };
            let span = self.advance().span;
            let right = self.parse_cast()?;
            left = Expr::Binary { op, left: Box::new(left), right: Box::new(right), span };
        }
    }

    fn parse_cast(&mut self) -> Result<Expr, Diagnostic> {
        let mut expr = self.parse_unary()?;
        while self.at(TokenKind::As) {
            let span = self.advance().span;
            let (ty, _) = self.parse_type()?;
            expr = Expr::Cast { ty, operand: Box::new(expr), span };
        }
        Ok(expr)
    }

    fn parse_unary(&mut self) -> Result<Expr, Diagnostic> {
        if self.at(TokenKind::Minus) {
            let span = self.advance().span;
            let operand = self.parse_unary()?;
            return Ok(Expr::Neg { operand: Box::new(operand), span });
        }
        self.parse_primary()
    }

    fn parse_primary(&mut self) -> Result<Expr, Diagnostic> {
        let span = self.peek().span;
        match self.peek().kind.clone() {
            TokenKind::Int(value) => {
                self.advance();
                Ok(Expr::IntLiteral(value, span))
            }
            TokenKind::Float(value) => {
                self.advance();
                Ok(Expr::FloatLiteral(value, span))
            }
            TokenKind::True => {
                self.advance();
                Ok(Expr::BoolLiteral(true, span))
            }
            TokenKind::False => {
                self.advance();
                Ok(Expr::BoolLiteral(false, span))
            }
            TokenKind::LParen => {
                self.advance();
                let expr = self.parse_expr()?;
                self.expect(TokenKind::RParen, "`)`")?;
                Ok(expr)
            }
            TokenKind::Ident(name) => {
                self.advance();
                if self.eat(TokenKind::LParen) {
                    let mut args = Vec::new();
                    if !self.at(TokenKind::RParen) {
                        loop {
                            args.push(self.parse_expr()?);
                            if !self.eat(TokenKind::Comma) {
                                break;
                            }
                        }
                    }
                    self.expect(TokenKind::RParen, "`)`")?;
                    return Ok(Expr::Call { name, args, span });
                }
                if self.eat(TokenKind::LBracket) {
                    let index = self.parse_expr()?;
                    self.expect(TokenKind::RBracket, "`]`")?;
                    return Ok(Expr::Index { name, index: Box::new(index), span });
                }
                Ok(Expr::Ident(name, span))
            }
            _ => Err(self.error("expected an expression".to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frontend::lexer::Lexer;

    fn parse(source: &str) -> Result<Program, Diagnostic> {
        let tokens = Lexer::new(source, 0).tokenize()?;
        Parser::new(tokens).parse()
    }

    #[test]
    fn test_parse_minimal_program() {
        let program = parse("namespace T { static i64 main() { return 0; } }").unwrap();
        assert_eq!(program.namespaces.len(), 1);
        assert_eq!(program.namespaces[0].name, "T");
        let main = &program.namespaces[0].functions[0];
        assert_eq!(main.name, "main");
        assert_eq!(main.ret, TYPE_I64);
        assert_eq!(main.body.stmts.len(), 1);
    }

    #[test]
    fn test_parse_locals_and_arithmetic() {
        let program =
            parse("namespace T { static i64 main() { i64 x = 5; x = x * 5 + 10; return x; } }")
                .unwrap();
        let main = &program.namespaces[0].functions[0];
        assert_eq!(main.body.stmts.len(), 3);
        match &main.body.stmts[1] {
            Stmt::Assign { name, value, .. } => {
                assert_eq!(name, "x");
                // x * 5 + 10 parses as (x * 5) + 10.
                match value {
                    Expr::Binary { op: BinOp::Add, left, .. } => {
                        assert!(matches!(**left, Expr::Binary { op: BinOp::Mul, .. }));
                    }
                    _ => panic!("expected an addition"),
                }
            }
            _ => panic!("expected an assignment"),
        }
    }

    #[test]
    fn test_parse_params_and_calls() {
        let program = parse(
            "namespace T { static i64 add(i64 a, i64 b) { return a + b; } \
             static i64 main() { return add(3, 4); } }",
        )
        .unwrap();
        let add = &program.namespaces[0].functions[0];
        assert_eq!(add.params.len(), 2);
        let main = &program.namespaces[0].functions[1];
        match &main.body.stmts[0] {
            Stmt::Return { value: Some(Expr::Call { name, args, .. }), .. } => {
                assert_eq!(name, "add");
                assert_eq!(args.len(), 2);
            }
            _ => panic!("expected return of a call"),
        }
    }

    #[test]
    fn test_parse_while_and_if() {
        let program = parse(
            "namespace T { static i64 f(i64 n) { \
               i64 i = 0; \
               while (i < n) { if (i == 3) { i = i + 2; } else { i = i + 1; } } \
               return i; } }",
        )
        .unwrap();
        let f = &program.namespaces[0].functions[0];
        assert!(matches!(f.body.stmts[1], Stmt::While { .. }));
    }

    #[test]
    fn test_parse_static_and_extern() {
        let program = parse(
            "namespace T { static i64 counter = 0; extern i32 getchar(); \
             static i64 main() { return 0; } }",
        )
        .unwrap();
        assert_eq!(program.namespaces[0].statics.len(), 1);
        let ext = &program.namespaces[0].functions[0];
        assert!(ext.is_extern);
    }

    #[test]
    fn test_parse_array_and_cast() {
        let program = parse(
            "namespace T { static i64 main() { i64[4] a; a[0] = 7; \
             i32 small = a[0] as i32; return small as i64; } }",
        )
        .unwrap();
        let main = &program.namespaces[0].functions[0];
        assert!(matches!(
            main.body.stmts[0],
            Stmt::Decl { array_size: Some(4), .. }
        ));
        assert!(matches!(main.body.stmts[1], Stmt::AssignIndex { .. }));
    }

    #[test]
    fn test_parse_error_reports_position() {
        let result = parse("namespace T { static i64 main() { return 0 } }");
        assert!(result.is_err());
        assert_eq!(result.unwrap_err().phase, Phase::Parse);
    }
}
