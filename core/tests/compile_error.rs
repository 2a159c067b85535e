//! Integration tests for programs that are expected to fail to compile.
//! None of these should ever reach the code generator or the VM.

use bslk::{compile, CompileError};

#[test]
fn rejects_a_syntax_error() {
    let errors = compile("dcl ;").unwrap_err();
    assert!(matches!(
        errors.errors()[0].error(),
        CompileError::ParseError(_)
    ));
}

#[test]
fn rejects_redeclaration_in_the_same_scope() {
    let errors = compile("dcl a int; dcl a bool;").unwrap_err();
    match errors.errors()[0].error() {
        CompileError::Redeclaration { name, .. } => assert_eq!(name, "a"),
        other => panic!("expected a redeclaration error, got {:?}", other),
    }
}

#[test]
fn rejects_an_undeclared_identifier() {
    let errors = compile("print(x);").unwrap_err();
    match errors.errors()[0].error() {
        CompileError::UndeclaredIdentifier { name } => assert_eq!(name, "x"),
        other => panic!("expected an undeclared identifier error, got {:?}", other),
    }
}

#[test]
fn rejects_an_undeclared_exit_label() {
    let errors = compile("exit nowhere;").unwrap_err();
    match errors.errors()[0].error() {
        CompileError::UndeclaredLabel { name } => assert_eq!(name, "nowhere"),
        other => panic!("expected an undeclared label error, got {:?}", other),
    }
}

/// The exact scenario named in the language spec: assigning an `int` to a
/// `bool` variable.
#[test]
fn rejects_mismatched_assignment_types() {
    let errors = compile("dcl a bool; a=1;").unwrap_err();
    assert_eq!(
        format!("{}", errors),
        "ERROR (line 1): Mismatched assignment types bool and int"
    );
}

#[test]
fn rejects_a_literal_range_with_upper_below_lower() {
    let errors = compile("dcl x int(10:1);").unwrap_err();
    assert!(matches!(
        errors.errors()[0].error(),
        CompileError::RangeError {
            lower: 10,
            upper: 1
        }
    ));
}

#[test]
fn rejects_a_call_with_the_wrong_number_of_arguments() {
    let errors = compile(
        "add: proc (a int, b int) returns (int); return a + b; end; print(add(1));",
    )
    .unwrap_err();
    match errors.errors()[0].error() {
        CompileError::ProcedureArity {
            name,
            expected,
            found,
        } => {
            assert_eq!(name, "add");
            assert_eq!(*expected, 2);
            assert_eq!(*found, 1);
        }
        other => panic!("expected a procedure arity error, got {:?}", other),
    }
}

#[test]
fn rejects_a_value_procedure_with_a_path_missing_return() {
    let errors = compile(
        "f: proc () returns (int); if 1 > 0 then return 1; fi; end; print(f());",
    )
    .unwrap_err();
    match errors.errors()[0].error() {
        CompileError::MissingReturn { name } => assert_eq!(name, "f"),
        other => panic!("expected a missing return error, got {:?}", other),
    }
}

#[test]
fn rejects_an_unsupported_operator_on_a_string_mode() {
    let errors =
        compile(r#"dcl s chars[5] = "ab"; dcl t chars[5] = "cd"; s = s - t;"#).unwrap_err();
    assert!(matches!(
        errors.errors()[0].error(),
        CompileError::UnsupportedOperator { .. }
    ));
}

#[test]
fn rejects_an_assignment_to_a_non_location() {
    let errors = compile("1 = 2;").unwrap_err();
    assert!(matches!(
        errors.errors()[0].error(),
        CompileError::InvalidLocation { .. }
    ));
}

#[test]
fn accumulates_more_than_one_error_in_a_single_pass() {
    let errors = compile("dcl a int; dcl a bool; print(b);").unwrap_err();
    assert_eq!(errors.errors().len(), 2);
}
