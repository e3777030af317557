use crate::common::source::{SourceManager, Span};

/// The compilation phase a diagnostic originates from. Printed as the
/// leading tag of every diagnostic line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Lex,
    Parse,
    Type,
    Resolve,
    Allocator,
    Encoder,
    Patch,
    Internal,
}

impl Phase {
    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Lex => "lex-error",
            Phase::Parse => "parse-error",
            Phase::Type => "type-error",
            Phase::Resolve => "resolve-error",
            Phase::Allocator => "allocator-error",
            Phase::Encoder => "encoder-error",
            Phase::Patch => "patch-error",
            Phase::Internal => "internal-error",
        }
    }
}

/// A diagnostic message with source location.
#[derive(Debug, Clone)]
pub struct Diagnostic {
    pub phase: Phase,
    pub message: String,
    pub span: Span,
}

impl Diagnostic {
    pub fn new(phase: Phase, message: impl Into<String>, span: Span) -> Self {
        Self { phase, message: message.into(), span }
    }

    pub fn render(&self, source_manager: &SourceManager) -> String {
        let loc = source_manager.resolve_span(self.span);
        format!(
            "{}: {} {}:{}:{}",
            self.phase.as_str(),
            self.message,
            loc.file,
            loc.line,
            loc.column
        )
    }
}

/// Collects diagnostics during compilation. Frontend phases short-circuit
/// on the first error per file; middle- and back-end passes record a single
/// error on the context and stop further passes.
#[derive(Debug, Default)]
pub struct DiagnosticEngine {
    diagnostics: Vec<Diagnostic>,
}

impl DiagnosticEngine {
    pub fn new() -> Self {
        Self { diagnostics: Vec::new() }
    }

    pub fn emit(&mut self, diag: Diagnostic) {
        self.diagnostics.push(diag);
    }

    pub fn has_errors(&self) -> bool {
        !self.diagnostics.is_empty()
    }

    pub fn diagnostics(&self) -> &[Diagnostic] {
        &self.diagnostics
    }

    pub fn print_all(&self, source_manager: &SourceManager) {
        for diag in &self.diagnostics {
            eprintln!("{}", diag.render(source_manager));
        }
    }
}

/// Pipeline-level failures. A pass either completes or records one of
/// these on the compiler context; errors are not used as control flow.
#[derive(Debug, Clone, thiserror::Error)]
pub enum CompileError {
    #[error("resolve-error: unknown symbol `{0}`")]
    UnresolvedSymbol(String),
    #[error("allocator-error: {0}")]
    Allocator(String),
    #[error("encoder-error: {0}")]
    Encoder(String),
    #[error("patch-error: {0}")]
    Patch(String),
    #[error("internal-error: {0}")]
    Internal(String),
}

pub type CompileResult<T> = Result<T, CompileError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_diagnostic_render() {
        let mut sm = SourceManager::new();
        let id = sm.add_file("main.opal".to_string(), "namespace T {\n}\n".to_string());
        let diag = Diagnostic::new(Phase::Parse, "expected `{`", Span::new(14, 15, id));
        assert_eq!(diag.render(&sm), "parse-error: expected `{` main.opal:2:1");
    }

    #[test]
    fn test_engine_collects() {
        let mut engine = DiagnosticEngine::new();
        assert!(!engine.has_errors());
        engine.emit(Diagnostic::new(Phase::Type, "mismatch", Span::dummy()));
        assert!(engine.has_errors());
        assert_eq!(engine.diagnostics().len(), 1);
    }
}
