//! The compiler driver orchestrates all phases: lex, parse, check,
//! lower, the middle-end passes, back-end code generation, and the
//! container writer for the selected target. Frontend phases report the
//! first error per file; later phases record a single error and stop.

use crate::backend::{elf, image, pe};
use crate::backend::x86::regs::{Target, TargetOs};
use crate::common::error::DiagnosticEngine;
use crate::common::source::SourceManager;
use crate::frontend::ast::Program;
use crate::frontend::lexer::Lexer;
use crate::frontend::parser::Parser;
use crate::frontend::sema::SemanticAnalyzer;
use crate::ir::ir::Module;
use crate::ir::lowering::lower_program;
use crate::passes::run_passes;
use anyhow::{bail, Context};
use std::path::PathBuf;
use tracing::info;

pub struct Driver {
    pub input_files: Vec<PathBuf>,
    pub opt_level: u32,
    pub target: Target,
    pub output_path: Option<PathBuf>,
    pub emit_ir: bool,
}

impl Driver {
    pub fn new() -> Self {
        Self {
            input_files: Vec::new(),
            opt_level: 2,
            target: Target::new(TargetOs::Linux),
            output_path: None,
            emit_ir: false,
        }
    }

    pub fn run(&self) -> anyhow::Result<()> {
        if self.input_files.is_empty() {
            bail!("no input files");
        }

        let mut source_manager = SourceManager::new();
        let mut diagnostics = DiagnosticEngine::new();
        let mut program = Program::default();

        for path in &self.input_files {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("cannot read {}", path.display()))?;
            let file_id = source_manager.add_file(path.display().to_string(), text.clone());

            let tokens = match Lexer::new(&text, file_id).tokenize() {
                Ok(tokens) => tokens,
                Err(diag) => {
                    diagnostics.emit(diag);
                    continue;
                }
            };
            match Parser::new(tokens).parse() {
                Ok(parsed) => program.namespaces.extend(parsed.namespaces),
                Err(diag) => diagnostics.emit(diag),
            }
        }
        if diagnostics.has_errors() {
            diagnostics.print_all(&source_manager);
            bail!("{} error(s)", diagnostics.diagnostics().len());
        }

        if let Err(diag) = SemanticAnalyzer::new().check(&program) {
            diagnostics.emit(diag);
            diagnostics.print_all(&source_manager);
            bail!("1 error(s)");
        }

        let mut module = Module::new();
        lower_program(&program, &mut module);
        info!(functions = module.functions.len(), "lowered to IR");

        if let Err(error) = run_passes(&mut module, self.opt_level) {
            bail!("{}", error);
        }

        if self.emit_ir {
            print!("{}", module.dump());
        }

        let mut image = match image::generate(&mut module, &self.target, self.opt_level) {
            Ok(image) => image,
            Err(error) => bail!("{}", error),
        };
        if !image.extern_calls.is_empty() {
            bail!(
                "patch-error: {} extern call(s) require dynamic linking (first: `{}`)",
                image.extern_calls.len(),
                image.extern_calls[0].symbol
            );
        }

        let output = self
            .output_path
            .clone()
            .unwrap_or_else(|| PathBuf::from(self.target.default_output()));
        let bytes = match self.target.os {
            TargetOs::Linux => elf::write_executable(&mut image),
            TargetOs::Windows => pe::write_executable(&mut image),
        };
        std::fs::write(&output, bytes)
            .with_context(|| format!("cannot write {}", output.display()))?;

        #[cfg(unix)]
        if self.target.os == TargetOs::Linux {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&output, std::fs::Permissions::from_mode(0o755))?;
        }

        info!(output = %output.display(), "wrote executable");
        Ok(())
    }
}

impl Default for Driver {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::fx_hash::FxHashSet;
    use crate::ir::ir::{FlowGraph, Op};
    use std::io::Write;

    fn compile_to_module(source: &str, opt_level: u32) -> Module {
        let mut source_manager = SourceManager::new();
        let file_id = source_manager.add_file("test.opal".to_string(), source.to_string());
        let tokens = Lexer::new(source, file_id).tokenize().unwrap();
        let program = Parser::new(tokens).parse().unwrap();
        SemanticAnalyzer::new().check(&program).unwrap();
        let mut module = Module::new();
        lower_program(&program, &mut module);
        run_passes(&mut module, opt_level).unwrap();
        module
    }

    fn compile_to_image(source: &str, opt_level: u32) -> image::Image {
        let mut module = compile_to_module(source, opt_level);
        let target = Target::new(TargetOs::Linux);
        image::generate(&mut module, &target, opt_level).unwrap()
    }

    fn count_ops(cfg: &FlowGraph, op: Op) -> usize {
        cfg.block_order()
            .iter()
            .flat_map(|&id| cfg.block(id).instructions.iter())
            .filter(|ins| ins.op == op)
            .count()
    }

    fn assert_clean(cfg: &FlowGraph) {
        let mut defined = FxHashSet::default();
        for id in cfg.block_order() {
            let bb = cfg.block(id);
            for phi in &bb.phis {
                assert_eq!(phi.values.len(), bb.incoming.len());
            }
            for ins in &bb.instructions {
                assert_ne!(ins.name, -1, "erased instruction survived compaction");
                defined.insert(ins.name);
            }
        }
        // Every operand read refers to a defined value.
        for id in cfg.block_order() {
            for ins in &cfg.block(id).instructions {
                if ins.is_special() || ins.op == Op::Phi {
                    continue;
                }
                for operand in [ins.left, ins.right] {
                    if operand != -1 {
                        assert!(defined.contains(&operand), "dangling operand {}", operand);
                    }
                }
            }
        }
    }

    #[test]
    fn test_return_zero_program() {
        let image = compile_to_image("namespace T { static i64 main() { return 0; } }", 2);
        assert!(!image.program_data.is_empty());
        assert!(image.extern_calls.is_empty());
    }

    #[test]
    fn test_local_arithmetic_program() {
        let module = compile_to_module(
            "namespace T { static i64 main() { i64 x = 5; x = x * 5 + 10; return x; } }",
            2,
        );
        let cfg = &module.functions[0].cfg;
        assert_clean(cfg);
        // Promotion removed the memory traffic.
        assert_eq!(count_ops(cfg, Op::Alloca), 0);
        assert_eq!(count_ops(cfg, Op::Load), 0);
        assert_eq!(count_ops(cfg, Op::Store), 0);
    }

    #[test]
    fn test_call_program_inlines_small_callee() {
        let module = compile_to_module(
            "namespace T { static i64 add(i64 a, i64 b) { return a + b; } \
             static i64 main() { return add(3, 4); } }",
            2,
        );
        let main = module.find_function("T::main").unwrap();
        assert_eq!(count_ops(&module.functions[main].cfg, Op::Call), 0);
        assert_clean(&module.functions[main].cfg);
    }

    #[test]
    fn test_call_program_keeps_call_without_inlining() {
        let module = compile_to_module(
            "namespace T { static i64 add(i64 a, i64 b) { return a + b; } \
             static i64 main() { return add(3, 4); } }",
            0,
        );
        let main = module.find_function("T::main").unwrap();
        assert_eq!(count_ops(&module.functions[main].cfg, Op::Call), 1);
    }

    #[test]
    fn test_fibonacci_loop_program() {
        let source = "namespace T { \
            static i64 fib(i64 n) { \
              i64 a = 0; i64 b = 1; i64 i = 0; \
              while (i < n) { i64 t = a + b; a = b; b = t; i = i + 1; } \
              return a; } \
            static i64 main() { return fib(10); } }";
        let module = compile_to_module(source, 2);
        for function in &module.functions {
            assert_clean(&function.cfg);
        }
        let image = {
            let mut module = compile_to_module(source, 2);
            let target = Target::new(TargetOs::Linux);
            image::generate(&mut module, &target, 2).unwrap()
        };
        assert!(!image.program_data.is_empty());
    }

    #[test]
    fn test_spill_pressure_program_compiles() {
        // More simultaneously live values than allocatable registers.
        let source = "namespace T { static i64 main() { \
            i64 a = 1; i64 b = 2; i64 c = 3; i64 d = 4; i64 e = 5; \
            i64 f = 6; i64 g = 7; i64 h = 8; i64 i = 9; \
            i64 s = a + b + c + d + e + f + g + h + i; \
            return s + a + b + c + d + e + f + g + h + i; } }";
        let image = compile_to_image(source, 2);
        assert!(!image.program_data.is_empty());
    }

    #[test]
    fn test_driver_writes_elf_executable() {
        let dir = tempfile::tempdir().unwrap();
        let source_path = dir.path().join("main.opal");
        let mut file = std::fs::File::create(&source_path).unwrap();
        write!(file, "namespace T {{ static i64 main() {{ return 0; }} }}").unwrap();

        let output = dir.path().join("app");
        let mut driver = Driver::new();
        driver.input_files = vec![source_path];
        driver.output_path = Some(output.clone());
        driver.run().unwrap();

        let bytes = std::fs::read(&output).unwrap();
        assert_eq!(&bytes[..4], &[0x7f, b'E', b'L', b'F']);
    }

    #[test]
    fn test_driver_reports_type_error() {
        let dir = tempfile::tempdir().unwrap();
        let source_path = dir.path().join("main.opal");
        let mut file = std::fs::File::create(&source_path).unwrap();
        write!(file, "namespace T {{ static i64 main() {{ return y; }} }}").unwrap();

        let mut driver = Driver::new();
        driver.input_files = vec![source_path];
        assert!(driver.run().is_err());
    }

    #[test]
    fn test_driver_windows_target_writes_pe() {
        let dir = tempfile::tempdir().unwrap();
        let source_path = dir.path().join("main.opal");
        let mut file = std::fs::File::create(&source_path).unwrap();
        write!(file, "namespace T {{ static i64 main() {{ return 3; }} }}").unwrap();

        let output = dir.path().join("app.exe");
        let mut driver = Driver::new();
        driver.target = Target::new(TargetOs::Windows);
        driver.input_files = vec![source_path];
        driver.output_path = Some(output.clone());
        driver.run().unwrap();

        let bytes = std::fs::read(&output).unwrap();
        assert_eq!(&bytes[..2], b"MZ");
    }
}
