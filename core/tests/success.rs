//! End-to-end compile-and-run tests, one per scenario named in the
//! language's test plan.

use bslk::{compile_and_run, RunConfig};

fn expect_output(src: &str, input: &str, expected: &str) {
    let output = compile_and_run(src, input, RunConfig::default())
        .unwrap_or_else(|e| panic!("expected success, got: {}", e));
    assert_eq!(output, expected);
}

#[test]
fn arithmetic_and_variables() {
    expect_output("dcl a,b int; a=10; b=20; a=a+b-5; print(a);", "", "25 ");
}

#[test]
fn while_loop_sum() {
    expect_output(
        "dcl i,n,s int; read(n); s=0; i=1; do while i<=n; s+=i; i+=1; od; print(s);",
        "5",
        "15 ",
    );
}

#[test]
fn for_step_squares() {
    expect_output(
        "dcl i int; do for i=1 to 3; print(i*i); od;",
        "",
        "1 4 9 ",
    );
}

#[test]
fn recursive_factorial() {
    expect_output(
        "fact: proc (n int) returns (int);
             if n <= 1 then return 1; else return n * fact(n - 1); fi;
         end;
         dcl n int; read(n); print(fact(n));",
        "5",
        "120 ",
    );
}

#[test]
fn string_literals_and_read() {
    expect_output(
        r#"dcl name chars[10]; print("Hi "); read(name); print(name);"#,
        "Ada",
        "Hi Ada",
    );
}

#[test]
fn array_indexing_round_trip() {
    expect_output(
        "dcl v array[0:2] int; v[0] = 1; v[1] = 2; v[2] = v[0] + v[1]; print(v[2]);",
        "",
        "3 ",
    );
}

#[test]
fn do_loop_with_labelled_exit() {
    expect_output(
        "dcl i int = 0;
         outer: do while 1 == 1;
             i += 1;
             if i == 3 then exit outer; fi;
         od;
         print(i);",
        "",
        "3 ",
    );
}

#[test]
fn synonym_and_newmode_declarations() {
    expect_output(
        "type celsius = int; syn freezing = 0; dcl t celsius = freezing; print(t);",
        "",
        "0 ",
    );
}

#[test]
fn reference_and_dereference() {
    expect_output(
        "dcl x int = 5; dcl r ref int = ->x; r-> = 9; print(x);",
        "",
        "9 ",
    );
}

#[test]
fn num_parses_a_multi_digit_string() {
    expect_output(r#"dcl s chars[5] = "123"; print(num(s) + 1);"#, "", "124 ");
}
