//! Core implementation of **L**, a small block-structured imperative
//! language: a parser, semantic analyser, code generator, and a stack-machine
//! interpreter for the instruction set the generator emits.
//!
//! ```
//! use bslk::{compile, run, RunConfig};
//!
//! let source = "
//! dcl x int = 2;
//! print(x + 3);
//! ";
//! let program = compile(source).unwrap();
//! let output = run(&program, "", RunConfig::default()).unwrap();
//! assert_eq!(output, "5 ");
//! ```

#![deny(unused_must_use)]

pub mod analyse;
pub mod ast;
pub mod codegen;
pub mod consts;
pub mod error;
pub mod machine;
pub mod parse;
pub mod scope;
pub mod util;

pub use codegen::CompiledProgram;
pub use consts::MAX_CYCLE_COUNT;
pub use error::*;
pub use machine::{Machine, RunConfig};

/// Parse and analyse `source`, producing a ready-to-run [CompiledProgram].
/// The code generator never runs on a program the analyser rejected; a
/// single call reports every accumulated compile-time error, not just the
/// first.
pub fn compile(source: &str) -> Result<CompiledProgram, CompileErrors> {
    debug!(println!("--- source ---\n{}", source));
    let parsed = parse::parse(source)?;
    debug!(println!("--- parsed AST ---\n{:#?}", parsed));
    let analysed = analyse::analyse(parsed, source)?;
    debug!(println!("--- decorated AST ---\n{:#?}", analysed.program));
    let compiled = codegen::generate(&analysed.program, analysed.string_heap);
    debug!(println!("--- instructions ---\n{:#?}", compiled.instructions));
    Ok(compiled)
}

/// Run an already-compiled program against `input`, returning its collected
/// stdout text.
pub fn run(
    program: &CompiledProgram,
    input: &str,
    config: RunConfig,
) -> Result<String, RuntimeErrors> {
    Machine::new(program, input, config).run(input)
}

/// Compile `source` and run it to completion against `input` in one step.
pub fn compile_and_run(
    source: &str,
    input: &str,
    config: RunConfig,
) -> Result<String, CompileOrRuntimeError> {
    let program = compile(source).map_err(CompileOrRuntimeError::Compile)?;
    run(&program, input, config).map_err(CompileOrRuntimeError::Runtime)
}

/// The two ways a full compile-and-run can fail. Kept distinct rather than
/// folded into one enum since the CLI reports them with different framing
/// (a compile-time error never invokes the VM at all).
#[derive(Debug)]
pub enum CompileOrRuntimeError {
    Compile(CompileErrors),
    Runtime(RuntimeErrors),
}

impl std::fmt::Display for CompileOrRuntimeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CompileOrRuntimeError::Compile(e) => write!(f, "{}", e),
            CompileOrRuntimeError::Runtime(e) => write!(f, "{}", e),
        }
    }
}
