//! End-to-end script tests: compile, run, and check printed output.

use cinder::{CollectStringPrint, Vm};
use pretty_assertions::assert_eq;

fn run(source: &str) -> String {
    let mut vm = Vm::new();
    let mut out = CollectStringPrint::new();
    vm.interpret(source, &mut out)
        .unwrap_or_else(|err| panic!("script failed: {err}"));
    out.into_output()
}

// === closures and upvalues ===

#[test]
fn closures_share_a_counter() {
    let output = run("fun make() { var n = 0; fun inc() { n = n + 1; return n; } return inc; } \
         var f = make(); print f(); print f(); print f();");
    assert_eq!(output, "1\n2\n3\n");
}

#[test]
fn closure_reads_enclosing_local_after_return() {
    let output = run("fun outer() { var x = \"outside\"; fun inner() { print x; } return inner; } \
         outer()();");
    assert_eq!(output, "outside\n");
}

#[test]
fn two_closures_share_one_upvalue() {
    let output = run("fun pair() { var n = 0; fun add() { n = n + 10; } fun get() { return n; } \
           add(); add(); print get(); }\
         pair();");
    assert_eq!(output, "20\n");
}

#[test]
fn closed_upvalue_keeps_the_value_at_close() {
    let output = run("var f; { var a = 1; fun g() { print a; } a = 2; f = g; } f();");
    assert_eq!(output, "2\n");
}

#[test]
fn upvalues_forward_through_intermediate_functions() {
    let output = run("fun a() { var x = \"x\"; fun b() { fun c() { print x; } return c; } return b(); } \
         a()();");
    assert_eq!(output, "x\n");
}

// === classes ===

#[test]
fn inheritance_and_super() {
    let output = run("class A { greet() { print \"A\"; } } \
         class B < A { greet() { super.greet(); print \"B\"; } } \
         B().greet();");
    assert_eq!(output, "A\nB\n");
}

#[test]
fn initializer_and_method_dispatch() {
    let output = run("class P { init(x) { this.x = x; } get() { return this.x; } } print P(42).get();");
    assert_eq!(output, "42\n");
}

#[test]
fn initializer_returns_this_implicitly() {
    let output = run("class P { init() { this.n = 1; } } print P().n;");
    assert_eq!(output, "1\n");
}

#[test]
fn methods_override_inherited_ones() {
    let output = run("class A { m() { return \"A\"; } } class B < A { m() { return \"B\"; } } \
         print B().m(); print A().m();");
    assert_eq!(output, "B\nA\n");
}

#[test]
fn fields_shadow_methods() {
    let output = run("class A { f() { print \"method\"; } } fun g() { print \"field\"; } \
         var a = A(); a.f(); a.f = g; a.f();");
    assert_eq!(output, "method\nfield\n");
}

#[test]
fn bound_method_remembers_receiver() {
    let output = run("class P { init(n) { this.n = n; } get() { return this.n; } } \
         var p = P(7); var m = p.get; print m();");
    assert_eq!(output, "7\n");
}

#[test]
fn bound_list_native_remembers_receiver() {
    let output = run("var a = [1]; var push = a.push; push(5); print a.size(); print a[1];");
    assert_eq!(output, "2\n5\n");
}

#[test]
fn instances_print_with_class_name() {
    let output = run("class Point {} print Point; print Point();");
    assert_eq!(output, "Point\n<Point instance>\n");
}

// === control flow ===

#[test]
fn switch_with_breaks_and_default() {
    let output = run("fun t(x){ switch(x){ case 1: print \"one\"; break; case 2: print \"two\"; break; \
           default: print \"other\"; } } \
         t(1); t(2); t(3);");
    assert_eq!(output, "one\ntwo\nother\n");
}

#[test]
fn switch_without_break_falls_through_bodies() {
    let output = run("switch(1) { case 1: print \"one\"; case 2: print \"two\"; default: print \"d\"; }");
    assert_eq!(output, "one\ntwo\nd\n");
}

#[test]
fn switch_skips_all_cases_without_default() {
    let output = run("switch(9) { case 1: print \"one\"; case 2: print \"two\"; } print \"after\";");
    assert_eq!(output, "after\n");
}

#[test]
fn switch_last_case_matching_without_break_exits_cleanly() {
    let output = run("switch(1) { case 1: print \"one\"; } print \"after\";");
    assert_eq!(output, "one\nafter\n");
}

#[test]
fn for_loop_runs_exactly_n_times() {
    let output = run("var count = 0; for (var i = 0; i < 5; i = i + 1) { count = count + 1; } print count;");
    assert_eq!(output, "5\n");
}

#[test]
fn while_loop_with_break_and_continue() {
    let output = run("var i = 0; while (true) { i = i + 1; if (i == 2) { continue; } \
           if (i > 4) { break; } print i; }");
    assert_eq!(output, "1\n3\n4\n");
}

#[test]
fn continue_in_for_runs_the_increment() {
    let output = run("for (var i = 0; i < 3; i = i + 1) { if (i == 1) { continue; } print i; }");
    assert_eq!(output, "0\n2\n");
}

#[test]
fn break_leaves_nested_scopes_cleanly() {
    let output = run("for (var i = 0; i < 10; i = i + 1) { var x = i * 2; if (x > 2) { break; } print x; } \
         print \"done\";");
    assert_eq!(output, "0\n2\ndone\n");
}

#[test]
fn if_else_chains() {
    let output = run("fun sign(n) { if (n > 0) { return \"+\"; } else if (n < 0) { return \"-\"; } \
           else { return \"0\"; } } \
         print sign(3); print sign(-3); print sign(0);");
    assert_eq!(output, "+\n-\n0\n");
}

#[test]
fn and_or_short_circuit_to_operand_values() {
    let output = run("print true and 1; print false and 1; print nil or \"x\"; print 1 or 2;");
    assert_eq!(output, "1\nfalse\nx\n1\n");
}

#[test]
fn recursion_computes_fibonacci() {
    let output = run("fun fib(n) { if (n < 2) { return n; } return fib(n - 1) + fib(n - 2); } print fib(10);");
    assert_eq!(output, "55\n");
}

// === lists ===

#[test]
fn list_basics() {
    let output = run("var a = [10, 20, 30]; a.push(40); a[0] = 1; print a[0]; print a.size(); print a.pop();");
    assert_eq!(output, "1\n4\n40\n");
}

#[test]
fn list_insert_and_remove() {
    let output = run("var a = [1, 3]; a.insertAt(1, 2); print a; print a.remove(0); print a;");
    assert_eq!(output, "[1,2,3]\n1\n[2,3]\n");
}

#[test]
fn list_append_with_empty_subscript() {
    let output = run("var a = []; a[] = 1; a[] = 2; print a; print len(a);");
    assert_eq!(output, "[1,2]\n2\n");
}

#[test]
fn pop_on_empty_list_returns_nil() {
    let output = run("var a = []; print a.pop();");
    assert_eq!(output, "nil\n");
}

#[test]
fn push_then_pop_leaves_list_unchanged() {
    let output = run("var a = [1, 2]; a.push(9); a.pop(); print a; print a.size();");
    assert_eq!(output, "[1,2]\n2\n");
}

#[test]
fn lists_nest() {
    let output = run("var a = [[1, 2], [3]]; print a[0][1]; print a[1][0]; print a;");
    assert_eq!(output, "2\n3\n[[1,2],[3]]\n");
}

// === strings ===

#[test]
fn string_escapes_and_byte_indexing() {
    let output = run("var s = \"A\\tB\\n\"; print len(s); print s[1];");
    assert_eq!(output, "4\n9\n");
}

#[test]
fn hex_and_unicode_escapes() {
    let output = run("print \"\\x41\\x42\"; print len(\"\\u4e2d\");");
    assert_eq!(output, "AB\n3\n");
}

#[test]
fn concatenation_lengths_add_up() {
    let output = run("var a = \"foo\"; var b = \"bars\"; print len(a + b); print len(a) + len(b);");
    assert_eq!(output, "7\n7\n");
}

#[test]
fn concatenation_with_empty_string_is_identity() {
    let output = run("var a = \"x\"; print a + \"\" == a;");
    assert_eq!(output, "true\n");
}

#[test]
fn equal_string_literals_are_the_same_object() {
    let output = run("print \"ab\" == \"a\" + \"b\";");
    assert_eq!(output, "true\n");
}

// === operators and printing ===

#[test]
fn comparison_and_equality_operators() {
    let output = run("print 1 < 2; print 2 <= 2; print 3 > 4; print 3 >= 4; print 1 == 1.0; print 1 != 2;");
    assert_eq!(output, "true\ntrue\nfalse\nfalse\ntrue\ntrue\n");
}

#[test]
fn arithmetic_and_unary() {
    let output = run("print 1 + 2 * 3; print (1 + 2) * 3; print -5 + 1; print !nil; print !0;");
    assert_eq!(output, "7\n9\n-4\ntrue\nfalse\n");
}

#[test]
fn numbers_print_without_trailing_decimals() {
    let output = run("print 1; print 2.5; print 10 / 4; print 0.1 + 0.2;");
    assert_eq!(output, "1\n2.5\n2.5\n0.30000000000000004\n");
}

#[test]
fn increment_and_decrement_evaluate_to_pre_update_value() {
    let output = run("var g = 5; print g++; print g; var h = 5; print h--; print h; \
         { var a = 1; print a++; print a; }");
    assert_eq!(output, "5\n6\n5\n4\n1\n2\n");
}

#[test]
fn comma_separated_var_declarations() {
    let output = run("var a = 1, b, c = 3; print a; print b; print c;");
    assert_eq!(output, "1\nnil\n3\n");
}

#[test]
fn functions_print_by_name() {
    let output = run("fun f() {} print f; print clock;");
    assert_eq!(output, "<fn f>\n<native fn>\n");
}

// === built-ins ===

#[test]
fn type_returns_the_closed_name_set() {
    let output = run("class C {} fun f() {} \
         print type(nil); print type(true); print type(1); print type(\"s\"); \
         print type([]); print type(f); print type(C); print type(C()); print type(len);");
    assert_eq!(
        output,
        "nil\nboolean\nnumber\nstring\nlist\nfunction\nclass\nobject\nnative-function\n"
    );
}

#[test]
fn clock_is_monotonic_and_numeric() {
    let output = run("var t = clock(); print t >= 0; print type(t);");
    assert_eq!(output, "true\nnumber\n");
}

#[test]
fn len_counts_bytes_and_elements() {
    let output = run("print len(\"\"); print len(\"abc\"); print len([]); print len([1, 2, 3]);");
    assert_eq!(output, "0\n3\n0\n3\n");
}

// === state across statements ===

#[test]
fn globals_update_and_read_back() {
    let output = run("var g = 1; fun bump() { g = g + 1; } bump(); bump(); print g;");
    assert_eq!(output, "3\n");
}

#[test]
fn repl_style_reuse_keeps_globals() {
    let mut vm = Vm::new();
    let mut out = CollectStringPrint::new();
    vm.interpret("var kept = 41;", &mut out).expect("first line");
    vm.interpret("print kept + 1;", &mut out).expect("second line");
    assert_eq!(out.into_output(), "42\n");
}
