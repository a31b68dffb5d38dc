//! Error reporting: compile diagnostics and runtime errors with traces.

use cinder::{CollectStringPrint, InterpretError, Vm};
use pretty_assertions::assert_eq;

fn compile_errors(source: &str) -> Vec<String> {
    let mut vm = Vm::new();
    let mut out = CollectStringPrint::new();
    match vm.interpret(source, &mut out) {
        Err(InterpretError::Compile(errors)) => errors.iter().map(ToString::to_string).collect(),
        other => panic!("expected a compile error, got {other:?}"),
    }
}

fn runtime_error(source: &str) -> String {
    let mut vm = Vm::new();
    let mut out = CollectStringPrint::new();
    match vm.interpret(source, &mut out) {
        Err(InterpretError::Runtime(error)) => error.to_string(),
        other => panic!("expected a runtime error, got {other:?}"),
    }
}

// === compile errors ===

#[test]
fn compile_errors_accumulate_across_statements() {
    let errors = compile_errors("var 1 = 2;\nprint ;\n");
    assert_eq!(
        errors,
        vec![
            "[line 1] Error at '1': expect variable name.",
            "[line 2] Error at ';': expect expression.",
        ]
    );
}

#[test]
fn error_at_end_of_input() {
    let errors = compile_errors("print 1");
    assert_eq!(errors, vec!["[line 1] Error at end: expect ';' after value."]);
}

#[test]
fn lexer_errors_surface_with_their_message() {
    let errors = compile_errors("var s = \"unterminated;");
    assert_eq!(errors, vec!["[line 1] Error: unterminated string."]);
}

#[test]
fn compile_failure_prevents_execution() {
    let mut vm = Vm::new();
    let mut out = CollectStringPrint::new();
    let result = vm.interpret("print \"ran\"; print ;", &mut out);
    assert!(matches!(result, Err(InterpretError::Compile(_))));
    assert_eq!(out.output(), "");
}

// === runtime errors ===

#[test]
fn undefined_variable_with_script_trace() {
    assert_eq!(runtime_error("print missing;"), "undefined variable 'missing'.\n[line 1] in script");
}

#[test]
fn assigning_an_undefined_global_fails() {
    assert_eq!(runtime_error("missing = 1;"), "undefined variable 'missing'.\n[line 1] in script");
}

#[test]
fn trace_lists_frames_innermost_first() {
    let message = runtime_error("fun inner() { missing(); }\nfun outer() { inner(); }\nouter();");
    assert_eq!(
        message,
        "undefined variable 'missing'.\n[line 1] in inner()\n[line 2] in outer()\n[line 3] in script"
    );
}

#[test]
fn calling_a_non_callable_value() {
    assert_eq!(
        runtime_error("var x = 1; x();"),
        "Can only call functions and classes.\n[line 1] in script"
    );
}

#[test]
fn arity_mismatch_reports_counts() {
    let message = runtime_error("fun two(a, b) {} two(1);");
    assert_eq!(message, "expected 2 arguments but got 1.\n[line 1] in script");
}

#[test]
fn class_without_init_rejects_arguments() {
    let message = runtime_error("class C {} C(1);");
    assert_eq!(message, "expected 0 arguments but got 1.\n[line 1] in script");
}

#[test]
fn deep_recursion_overflows_the_frame_stack() {
    let message = runtime_error("fun f() { f(); } f();");
    assert!(message.starts_with("stack overflow."), "got: {message}");
}

#[test]
fn arithmetic_type_errors() {
    assert_eq!(
        runtime_error("print 1 + \"a\";"),
        "operands must be two numbers or two strings.\n[line 1] in script"
    );
    assert_eq!(
        runtime_error("print 1 < \"a\";"),
        "operands must be numbers.\n[line 1] in script"
    );
    assert_eq!(runtime_error("print -\"a\";"), "operand must be a number.\n[line 1] in script");
    assert_eq!(
        runtime_error("var s = \"a\"; s++;"),
        "can only increment numbers.\n[line 1] in script"
    );
}

#[test]
fn list_index_errors() {
    assert_eq!(
        runtime_error("var a = [1]; print a[3];"),
        "index out of range.\n[line 1] in script"
    );
    assert_eq!(
        runtime_error("var a = [1]; print a[\"k\"];"),
        "index must be a number.\n[line 1] in script"
    );
    assert_eq!(
        runtime_error("var a = [1]; a[9] = 1;"),
        "index out of range.\n[line 1] in script"
    );
}

#[test]
fn string_index_errors() {
    assert_eq!(
        runtime_error("print \"ab\"[5];"),
        "index out of range.\n[line 1] in script"
    );
}

#[test]
fn subscripting_unsupported_values() {
    assert_eq!(
        runtime_error("print 1[0];"),
        "can only subscript list, string or index map.\n[line 1] in script"
    );
    assert_eq!(
        runtime_error("var n = 1; n[] = 2;"),
        "can only push value to list.\n[line 1] in script"
    );
}

#[test]
fn undefined_property_on_instance() {
    assert_eq!(
        runtime_error("class C {} print C().missing;"),
        "undefined property 'missing'.\n[line 1] in script"
    );
    assert_eq!(
        runtime_error("class C {} C().missing();"),
        "undefined property 'missing'.\n[line 1] in script"
    );
}

#[test]
fn property_access_on_unsupported_values() {
    assert_eq!(
        runtime_error("print true.field;"),
        "only lists and instances have properties.\n[line 1] in script"
    );
    assert_eq!(
        runtime_error("var n = 1; n.field = 2;"),
        "only instances have fields.\n[line 1] in script"
    );
    assert_eq!(
        runtime_error("print (1).m();"),
        "only lists, instances have methods.\n[line 1] in script"
    );
}

#[test]
fn superclass_must_be_a_class() {
    assert_eq!(
        runtime_error("var notclass = 1; class B < notclass {}"),
        "superclass must be a class.\n[line 1] in script"
    );
}

#[test]
fn builtin_argument_type_errors() {
    assert_eq!(
        runtime_error("print len(1);"),
        "argument to len() must be a list or a string.\n[line 1] in script"
    );
    assert_eq!(
        runtime_error("var a = [1]; a.insertAt(5, 0);"),
        "List index (5) out of bounds (1).\n[line 1] in script"
    );
    assert_eq!(
        runtime_error("var a = [1, 2]; a.remove(0.5);"),
        "List index (0.5) must be a whole number.\n[line 1] in script"
    );
}

#[test]
fn loop_variable_is_not_visible_after_the_loop() {
    let message = runtime_error("for (var i = 0; i < 3; i = i + 1) {} print i;");
    assert_eq!(message, "undefined variable 'i'.\n[line 1] in script");
}

#[test]
fn error_resets_the_vm_for_the_next_run() {
    let mut vm = Vm::new();
    let mut out = CollectStringPrint::new();
    assert!(vm.interpret("print missing;", &mut out).is_err());
    vm.interpret("print \"recovered\";", &mut out).expect("second run");
    assert_eq!(out.output(), "recovered\n");
}
