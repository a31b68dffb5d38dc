//! Collector behavior as observable through scripts.
//!
//! Stress mode collects at every safe point, so any object the VM forgot to
//! root disappears mid-run and corrupts the output. Every scenario here must
//! print exactly what it prints under the default schedule.

use cinder::{CollectStringPrint, Vm};
use pretty_assertions::assert_eq;

fn run_stressed(source: &str) -> String {
    let mut vm = Vm::new();
    vm.set_gc_stress(true);
    let mut out = CollectStringPrint::new();
    vm.interpret(source, &mut out)
        .unwrap_or_else(|err| panic!("script failed under gc stress: {err}"));
    out.into_output()
}

fn run_default(source: &str) -> String {
    let mut vm = Vm::new();
    let mut out = CollectStringPrint::new();
    vm.interpret(source, &mut out)
        .unwrap_or_else(|err| panic!("script failed: {err}"));
    out.into_output()
}

/// Runs under both schedules and checks the outputs agree.
fn run_both(source: &str) -> String {
    let default = run_default(source);
    let stressed = run_stressed(source);
    assert_eq!(default, stressed, "stress collection changed behavior");
    default
}

#[test]
fn closures_survive_stress() {
    let output = run_both("fun make() { var n = 0; fun inc() { n = n + 1; return n; } return inc; } \
         var f = make(); print f(); print f(); print f();");
    assert_eq!(output, "1\n2\n3\n");
}

#[test]
fn classes_and_instances_survive_stress() {
    let output = run_both("class A { greet() { print \"A\"; } } \
         class B < A { greet() { super.greet(); print \"B\"; } } \
         B().greet();");
    assert_eq!(output, "A\nB\n");
}

#[test]
fn string_churn_survives_stress() {
    let output = run_both("var s = \"\"; var i = 0; while (i < 50) { s = s + \"a\"; i = i + 1; } print len(s);");
    assert_eq!(output, "50\n");
}

#[test]
fn list_growth_survives_stress() {
    let output = run_both("var a = []; for (var i = 0; i < 100; i = i + 1) { a[] = \"x\" + \"y\"; } \
         print a.size(); print a[99];");
    assert_eq!(output, "100\nxy\n");
}

#[test]
fn unreachable_cycles_do_not_break_execution() {
    let output = run_both("class Node { init() { this.next = nil; } } \
         var i = 0; \
         while (i < 20) { \
           var a = Node(); var b = Node(); \
           a.next = b; b.next = a; \
           i = i + 1; \
         } \
         print \"done\";");
    assert_eq!(output, "done\n");
}

#[test]
fn interning_still_holds_after_collections() {
    let output = run_both("var a = \"left\"; var i = 0; while (i < 30) { var tmp = \"junk\" + \"junk\"; i = i + 1; } \
         print a + \"\" == \"left\";");
    assert_eq!(output, "true\n");
}

#[test]
fn bound_methods_and_upvalues_survive_stress() {
    let output = run_both("class Counter { init() { this.n = 0; } bump() { this.n = this.n + 1; return this.n; } } \
         var c = Counter(); var bump = c.bump; \
         fun twice(f) { f(); return f(); } \
         print twice(bump);");
    assert_eq!(output, "2\n");
}
