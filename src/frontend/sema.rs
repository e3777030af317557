//! Semantic analysis: name resolution and type checking over the AST.
//! Reports the first error found; the pipeline does not proceed past a
//! failed check. Integer and float literals adopt the type the context
//! expects when it is compatible.

use crate::common::error::{Diagnostic, Phase};
use crate::common::fx_hash::FxHashMap;
use crate::common::source::Span;
use crate::frontend::ast::*;
use crate::ir::ir::{
    is_float_type, TypeId, TYPE_BOOLEAN, TYPE_F64, TYPE_I64, TYPE_VOID,
};

#[derive(Debug, Clone)]
struct FunctionSig {
    params: Vec<TypeId>,
    ret: TypeId,
}

#[derive(Debug, Clone, Copy)]
struct VarInfo {
    ty: TypeId,
    is_array: bool,
    is_param: bool,
}

pub struct SemanticAnalyzer {
    functions: FxHashMap<String, FunctionSig>,
    statics: FxHashMap<String, TypeId>,
    scope: FxHashMap<String, VarInfo>,
    current_ret: TypeId,
}

fn is_integer_type(ty: TypeId) -> bool {
    (1..=10).contains(&ty) && !is_float_type(ty)
}

fn is_numeric(ty: TypeId) -> bool {
    is_integer_type(ty) || is_float_type(ty)
}

impl SemanticAnalyzer {
    pub fn new() -> Self {
        Self {
            functions: FxHashMap::default(),
            statics: FxHashMap::default(),
            scope: FxHashMap::default(),
            current_ret: TYPE_VOID,
        }
    }

    pub fn check(&mut self, program: &Program) -> Result<(), Diagnostic> {
        for namespace in &program.namespaces {
            for function in &namespace.functions {
                let sig = FunctionSig {
                    params: function.params.iter().map(|p| p.ty).collect(),
                    ret: function.ret,
                };
                if self.functions.insert(function.name.clone(), sig).is_some() {
                    return Err(self.error(
                        format!("duplicate function `{}`", function.name),
                        function.span,
                    ));
                }
            }
            for static_decl in &namespace.statics {
                if !is_numeric(static_decl.ty) {
                    return Err(self.error(
                        "static variables must be numeric".to_string(),
                        static_decl.span,
                    ));
                }
                if self
                    .statics
                    .insert(static_decl.name.clone(), static_decl.ty)
                    .is_some()
                {
                    return Err(self.error(
                        format!("duplicate static `{}`", static_decl.name),
                        static_decl.span,
                    ));
                }
                if let Some(init) = &static_decl.init {
                    match init {
                        Expr::IntLiteral(..) | Expr::FloatLiteral(..) | Expr::BoolLiteral(..) => {}
                        _ => {
                            return Err(self.error(
                                "static initializers must be literals".to_string(),
                                init.span(),
                            ))
                        }
                    }
                }
            }
        }

        for namespace in &program.namespaces {
            for function in &namespace.functions {
                if !function.is_extern {
                    self.check_function(function)?;
                }
            }
        }
        Ok(())
    }

    fn error(&self, message: String, span: Span) -> Diagnostic {
        Diagnostic::new(Phase::Type, message, span)
    }

    fn check_function(&mut self, function: &FunctionDecl) -> Result<(), Diagnostic> {
        self.scope.clear();
        self.current_ret = function.ret;
        for param in &function.params {
            if self
                .scope
                .insert(
                    param.name.clone(),
                    VarInfo { ty: param.ty, is_array: false, is_param: true },
                )
                .is_some()
            {
                return Err(self.error(
                    format!("duplicate parameter `{}`", param.name),
                    param.span,
                ));
            }
        }
        let always_returns = self.check_block(&function.body)?;
        if function.ret != TYPE_VOID && !always_returns {
            return Err(self.error(
                format!("function `{}` does not return on every path", function.name),
                function.span,
            ));
        }
        Ok(())
    }

    /// Returns whether the block definitely returns.
    fn check_block(&mut self, block: &Block) -> Result<bool, Diagnostic> {
        let mut returns = false;
        for stmt in &block.stmts {
            returns = returns || self.check_stmt(stmt)?;
        }
        Ok(returns)
    }

    fn check_stmt(&mut self, stmt: &Stmt) -> Result<bool, Diagnostic> {
        match stmt {
            Stmt::Decl { ty, array_size, name, init, span } => {
                if *ty == TYPE_VOID {
                    return Err(self.error("variables cannot be void".to_string(), *span));
                }
                if let Some(size) = array_size {
                    if *size <= 0 {
                        return Err(self.error("array size must be positive".to_string(), *span));
                    }
                    if init.is_some() {
                        return Err(
                            self.error("arrays cannot have initializers".to_string(), *span)
                        );
                    }
                }
                if let Some(init) = init {
                    self.check_expr(init, Some(*ty))?;
                }
                if self
                    .scope
                    .insert(
                        name.clone(),
                        VarInfo { ty: *ty, is_array: array_size.is_some(), is_param: false },
                    )
                    .is_some()
                {
                    return Err(self.error(format!("duplicate variable `{}`", name), *span));
                }
                Ok(false)
            }
            Stmt::Assign { name, value, span } => {
                let ty = if let Some(info) = self.scope.get(name).copied() {
                    if info.is_param {
                        return Err(
                            self.error(format!("cannot assign to parameter `{}`", name), *span)
                        );
                    }
                    if info.is_array {
                        return Err(self.error(
                            format!("array `{}` needs an index to assign", name),
                            *span,
                        ));
                    }
                    info.ty
                } else if let Some(&ty) = self.statics.get(name) {
                    ty
                } else {
                    return Err(self.error(format!("unknown variable `{}`", name), *span));
                };
                self.check_expr(value, Some(ty))?;
                Ok(false)
            }
            Stmt::AssignIndex { name, index, value, span } => {
                let Some(info) = self.scope.get(name).copied() else {
                    return Err(self.error(format!("unknown variable `{}`", name), *span));
                };
                if !info.is_array {
                    return Err(self.error(format!("`{}` is not an array", name), *span));
                }
                let index_ty = self.check_expr(index, Some(TYPE_I64))?;
                if !is_integer_type(index_ty) {
                    return Err(self.error("array index must be an integer".to_string(), *span));
                }
                self.check_expr(value, Some(info.ty))?;
                Ok(false)
            }
            Stmt::If { cond, then_block, else_block, .. } => {
                self.check_cond(cond)?;
                let then_returns = self.check_block(then_block)?;
                let else_returns = match else_block {
                    Some(block) => self.check_block(block)?,
                    None => false,
                };
                Ok(then_returns && else_returns)
            }
            Stmt::While { cond, body, .. } => {
                self.check_cond(cond)?;
                self.check_block(body)?;
                Ok(false)
            }
            Stmt::Return { value, span } => {
                match (value, self.current_ret) {
                    (None, TYPE_VOID) => {}
                    (None, _) => {
                        return Err(self.error("missing return value".to_string(), *span))
                    }
                    (Some(_), TYPE_VOID) => {
                        return Err(
                            self.error("void function returns a value".to_string(), *span)
                        )
                    }
                    (Some(value), ret) => {
                        self.check_expr(value, Some(ret))?;
                    }
                }
                Ok(true)
            }
            Stmt::Expr { expr, span } => {
                if !matches!(expr, Expr::Call { .. }) {
                    return Err(self.error(
                        "only calls may be used as statements".to_string(),
                        *span,
                    ));
                }
                self.check_expr(expr, None)?;
                Ok(false)
            }
        }
    }

    fn check_cond(&mut self, cond: &Cond) -> Result<(), Diagnostic> {
        let left = self.check_expr(&cond.left, None)?;
        let right = self.check_expr(&cond.right, Some(left))?;
        if left != right {
            return Err(self.error(
                "comparison operands must have the same type".to_string(),
                cond.span,
            ));
        }
        if left == TYPE_VOID {
            return Err(self.error("cannot compare void values".to_string(), cond.span));
        }
        Ok(())
    }

    /// Infer and check an expression's type; literals adopt a compatible
    /// expected type.
    fn check_expr(&mut self, expr: &Expr, expected: Option<TypeId>) -> Result<TypeId, Diagnostic> {
        let ty = match expr {
            Expr::IntLiteral(_, _) => match expected {
                Some(ty) if is_integer_type(ty) => ty,
                _ => TYPE_I64,
            },
            Expr::FloatLiteral(_, _) => match expected {
                Some(ty) if is_float_type(ty) => ty,
                _ => TYPE_F64,
            },
            Expr::BoolLiteral(_, _) => TYPE_BOOLEAN,
            Expr::Ident(name, span) => {
                if let Some(info) = self.scope.get(name) {
                    if info.is_array {
                        return Err(self.error(
                            format!("array `{}` needs an index", name),
                            *span,
                        ));
                    }
                    info.ty
                } else if let Some(&ty) = self.statics.get(name) {
                    ty
                } else {
                    return Err(self.error(format!("unknown variable `{}`", name), *span));
                }
            }
            Expr::Index { name, index, span } => {
                let Some(info) = self.scope.get(name).copied() else {
                    return Err(self.error(format!("unknown variable `{}`", name), *span));
                };
                if !info.is_array {
                    return Err(self.error(format!("`{}` is not an array", name), *span));
                }
                let index_ty = self.check_expr(index, Some(TYPE_I64))?;
                if !is_integer_type(index_ty) {
                    return Err(self.error("array index must be an integer".to_string(), *span));
                }
                info.ty
            }
            Expr::Call { name, args, span } => {
                let Some(sig) = self.functions.get(name).cloned() else {
                    return Err(self.error(format!("unknown function `{}`", name), *span));
                };
                if sig.params.len() != args.len() {
                    return Err(self.error(
                        format!(
                            "`{}` takes {} arguments, {} given",
                            name,
                            sig.params.len(),
                            args.len()
                        ),
                        *span,
                    ));
                }
                for (arg, &param_ty) in args.iter().zip(&sig.params) {
                    let arg_ty = self.check_expr(arg, Some(param_ty))?;
                    if arg_ty != param_ty {
                        return Err(self.error(
                            format!("argument type mismatch in call to `{}`", name),
                            arg.span(),
                        ));
                    }
                }
                sig.ret
            }
            Expr::Neg { operand, span } => {
                let ty = self.check_expr(operand, expected)?;
                if !is_numeric(ty) {
                    return Err(self.error("cannot negate this type".to_string(), *span));
                }
                ty
            }
            Expr::Binary { op, left, right, span } => {
                let left_ty = self.check_expr(left, expected)?;
                let right_ty = self.check_expr(right, Some(left_ty))?;
                if left_ty != right_ty {
                    return Err(self.error(
                        "operand types must match".to_string(),
                        *span,
                    ));
                }
                if !is_numeric(left_ty) {
                    return Err(self.error("operands must be numeric".to_string(), *span));
                }
                let float = is_float_type(left_ty);
                if float
                    && matches!(op, BinOp::Mod | BinOp::Shl | BinOp::Shr | BinOp::BitAnd | BinOp::BitOr)
                {
                    return Err(self.error(
                        "this operator requires integer operands".to_string(),
                        *span,
                    ));
                }
                left_ty
            }
            Expr::Cast { ty, operand, span } => {
                let from = self.check_expr(operand, None)?;
                if !is_numeric(from) || !is_numeric(*ty) {
                    return Err(self.error("casts apply to numeric types".to_string(), *span));
                }
                *ty
            }
        };
        if let Some(expected) = expected {
            if ty != expected {
                return Err(self.error(
                    "type mismatch".to_string(),
                    expr.span(),
                ));
            }
        }
        Ok(ty)
    }
}

impl Default for SemanticAnalyzer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frontend::lexer::Lexer;
    use crate::frontend::parser::Parser;

    fn check(source: &str) -> Result<(), Diagnostic> {
        let tokens = Lexer::new(source, 0).tokenize()?;
        let program = Parser::new(tokens).parse()?;
        SemanticAnalyzer::new().check(&program)
    }

    #[test]
    fn test_accepts_well_typed_program() {
        assert!(check(
            "namespace T { static i64 add(i64 a, i64 b) { return a + b; } \
             static i64 main() { return add(3, 4); } }"
        )
        .is_ok());
    }

    #[test]
    fn test_rejects_unknown_variable() {
        let err = check("namespace T { static i64 main() { return y; } }").unwrap_err();
        assert_eq!(err.phase, Phase::Type);
    }

    #[test]
    fn test_rejects_arity_mismatch() {
        assert!(check(
            "namespace T { static i64 add(i64 a, i64 b) { return a + b; } \
             static i64 main() { return add(3); } }"
        )
        .is_err());
    }

    #[test]
    fn test_rejects_missing_return() {
        assert!(check("namespace T { static i64 main() { i64 x = 1; } }").is_err());
    }

    #[test]
    fn test_accepts_if_else_returns() {
        assert!(check(
            "namespace T { static i64 f(i64 n) { \
               if (n < 0) { return 0; } else { return 1; } } \
             static i64 main() { return f(1); } }"
        )
        .is_ok());
    }

    #[test]
    fn test_rejects_parameter_assignment() {
        assert!(check(
            "namespace T { static i64 f(i64 n) { n = 3; return n; } }"
        )
        .is_err());
    }

    #[test]
    fn test_rejects_operand_type_mix() {
        assert!(check(
            "namespace T { static i64 main() { f64 x = 1.5; return x + 1; } }"
        )
        .is_err());
    }

    #[test]
    fn test_accepts_casts() {
        assert!(check(
            "namespace T { static i64 main() { i32 x = 5; return x as i64; } }"
        )
        .is_ok());
    }
}
