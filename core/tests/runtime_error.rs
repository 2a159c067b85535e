//! Integration tests for programs that compile cleanly but fault at
//! runtime.

use bslk::{compile, run, RunConfig, RuntimeError};

#[test]
fn fails_reading_a_non_integer_as_an_int() {
    let program = compile("dcl n int; read(n); print(n);").unwrap();
    let errors = run(&program, "abc", RunConfig::default()).unwrap_err();
    match errors.errors()[0].error() {
        RuntimeError::ValueError { expected, found } => {
            assert_eq!(*expected, "int");
            assert_eq!(found, "abc");
        }
        other => panic!("expected a value error, got {:?}", other),
    }
}

#[test]
fn fails_reading_past_the_end_of_input() {
    let program = compile("dcl n int; read(n); print(n);").unwrap();
    let errors = run(&program, "", RunConfig::default()).unwrap_err();
    assert!(matches!(
        errors.errors()[0].error(),
        RuntimeError::EmptyInput
    ));
}

#[test]
fn fails_dividing_by_a_runtime_zero() {
    let program = compile("dcl a int; read(a); print(10 / a);").unwrap();
    let errors = run(&program, "0", RunConfig::default()).unwrap_err();
    assert!(matches!(
        errors.errors()[0].error(),
        RuntimeError::DivisionByZero
    ));
}

#[test]
fn aborts_an_infinite_loop_once_the_cycle_budget_is_spent() {
    let program = compile("dcl x int = 0; do while 1 == 1; x += 1; od;").unwrap();
    let config = RunConfig {
        max_cycles: 200,
        ..RunConfig::default()
    };
    let errors = run(&program, "", config).unwrap_err();
    assert!(matches!(
        errors.errors()[0].error(),
        RuntimeError::TooManyCycles
    ));
}
