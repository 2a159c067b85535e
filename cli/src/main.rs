#![deny(clippy::all)]

use bslk::{analyse, codegen, parse, run, CompileErrors, CompiledProgram, RunConfig};
use std::{
    fs,
    io::{self, Read},
    path::PathBuf,
    process,
};
use structopt::StructOpt;

/// Compile (and, by default, run) an L source file.
#[derive(Debug, StructOpt)]
#[structopt(name = "bslk")]
struct Opt {
    /// Path to the source file
    #[structopt(parse(from_os_str))]
    file: PathBuf,

    /// Dump the undecorated AST, the decorated AST, and the instruction
    /// list before running
    #[structopt(short = "d", long = "debug")]
    debug: bool,

    /// Compile and print the instruction list; don't run the program
    #[structopt(short = "o", long = "code-only")]
    code_only: bool,
}

fn main() {
    process::exit(run_cli(Opt::from_args()));
}

fn run_cli(opt: Opt) -> i32 {
    let source = match fs::read_to_string(&opt.file) {
        Ok(source) => source,
        Err(err) => {
            eprintln!("Failed to read {:?}: {}", opt.file, err);
            return 1;
        }
    };

    let program = match compile_with_optional_dump(&source, opt.debug) {
        Ok(program) => program,
        Err(err) => {
            eprintln!("{:#}", err);
            return 1;
        }
    };

    if opt.code_only {
        println!("{:#?}", program.instructions);
        return 0;
    }

    let mut input = String::new();
    // No stdin at all (e.g. piped from /dev/null) isn't an error; programs
    // that never call read() just never touch it.
    let _ = io::stdin().read_to_string(&mut input);

    match run(&program, &input, RunConfig::default()) {
        Ok(output) => {
            print!("{}", output);
            0
        }
        Err(err) => {
            eprintln!("{:#}", err);
            1
        }
    }
}

/// Runs the parse/analyse/codegen pipeline by hand instead of calling
/// `bslk::compile`, so that `-d` can dump each stage's output unconditionally
/// (the library's own `debug!` traces compile away entirely in release
/// builds, which isn't good enough for a user-facing CLI flag).
fn compile_with_optional_dump(source: &str, dump: bool) -> Result<CompiledProgram, CompileErrors> {
    let parsed = parse::parse(source)?;
    if dump {
        println!("--- parsed AST ---\n{:#?}", parsed);
    }

    let analysed = analyse::analyse(parsed, source)?;
    if dump {
        println!("--- decorated AST ---\n{:#?}", analysed.program);
    }

    let compiled = codegen::generate(&analysed.program, analysed.string_heap);
    if dump {
        println!("--- instructions ---\n{:#?}", compiled.instructions);
    }

    Ok(compiled)
}
