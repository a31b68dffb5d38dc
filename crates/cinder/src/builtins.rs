//! Host functions registered at VM startup: the global `clock`, `len`, and
//! `type` natives, plus the built-in `List` class whose methods back
//! `a.push(...)` and friends on every list value.

use std::time::Instant;

use crate::{
    heap::{Heap, HeapData, HeapId},
    table::Table,
    value::{Value, format_number, type_name},
};

/// Signature of every native function.
///
/// Natives report failures as messages; the VM turns them into runtime
/// errors with the usual stack trace.
pub(crate) type NativeFn = fn(&mut NativeCtx<'_>) -> Result<Value, String>;

/// What a native sees when called.
pub(crate) struct NativeCtx<'a> {
    pub heap: &'a mut Heap,
    /// The value in the callee slot: the receiver for method calls, the
    /// native itself for plain calls.
    pub receiver: Value,
    pub args: &'a [Value],
    /// VM start time, the epoch for `clock()`.
    pub clock_base: Instant,
}

/// Registers the global native functions.
pub(crate) fn install_globals(heap: &mut Heap, globals: &mut Table) {
    define_native(heap, globals, "clock", native_clock, 0);
    define_native(heap, globals, "len", native_len, 1);
    define_native(heap, globals, "type", native_type, 1);
}

/// Builds the class behind every list value's methods.
pub(crate) fn make_list_class(heap: &mut Heap) -> HeapId {
    let name = heap.intern_str("List");
    let class = heap.new_class(name);
    define_native_method(heap, class, "insertAt", list_insert_at, 2);
    define_native_method(heap, class, "push", list_push, 1);
    define_native_method(heap, class, "pop", list_pop, 0);
    define_native_method(heap, class, "remove", list_remove, 1);
    define_native_method(heap, class, "size", list_size, 0);
    class
}

fn define_native(heap: &mut Heap, globals: &mut Table, name: &str, func: NativeFn, arity: u8) {
    let name_id = heap.intern_str(name);
    let hash = heap.str_hash(name_id);
    let native = heap.new_native(func, arity);
    globals.set(name_id, hash, Value::Obj(native));
}

fn define_native_method(heap: &mut Heap, class: HeapId, name: &str, func: NativeFn, arity: u8) {
    let name_id = heap.intern_str(name);
    let hash = heap.str_hash(name_id);
    let native = heap.new_native(func, arity);
    heap.class_mut(class).methods.set(name_id, hash, Value::Obj(native));
}

/// `clock()`: seconds since the VM was created.
fn native_clock(ctx: &mut NativeCtx<'_>) -> Result<Value, String> {
    Ok(Value::Number(ctx.clock_base.elapsed().as_secs_f64()))
}

/// `len(x)`: byte length of a string or element count of a list.
fn native_len(ctx: &mut NativeCtx<'_>) -> Result<Value, String> {
    if let Value::Obj(id) = ctx.args[0] {
        match ctx.heap.get(id) {
            HeapData::Str(s) => return Ok(Value::Number(s.bytes.len() as f64)),
            HeapData::List(l) => return Ok(Value::Number(l.items.len() as f64)),
            _ => {}
        }
    }
    Err("argument to len() must be a list or a string.".to_owned())
}

/// `type(x)`: the value's type name as an interned string.
fn native_type(ctx: &mut NativeCtx<'_>) -> Result<Value, String> {
    let name = type_name(ctx.heap, ctx.args[0]);
    Ok(Value::Obj(ctx.heap.intern_str(name)))
}

fn receiver_list(ctx: &NativeCtx<'_>) -> HeapId {
    match ctx.receiver {
        Value::Obj(id) if matches!(ctx.heap.get(id), HeapData::List(_)) => id,
        _ => unreachable!("list method called on non-list receiver"),
    }
}

/// Validates a numeric index against `0 <= index < bounds`.
fn check_index(what: &str, bounds: usize, index: Value) -> Result<usize, String> {
    let Value::Number(n) = index else {
        return Err(format!("{what} must be a number."));
    };
    if n < 0.0 || n >= bounds as f64 {
        return Err(format!("{what} ({}) out of bounds ({bounds}).", format_number(n)));
    }
    if n.trunc() != n {
        return Err(format!("{what} ({}) must be a whole number.", format_number(n)));
    }
    Ok(n as usize)
}

/// `list.insertAt(i, v)`: insert before index `i`.
fn list_insert_at(ctx: &mut NativeCtx<'_>) -> Result<Value, String> {
    let list = receiver_list(ctx);
    let index = check_index("List index", ctx.heap.list(list).items.len(), ctx.args[0])?;
    let value = ctx.args[1];
    ctx.heap.list_mut(list).items.insert(index, value);
    Ok(Value::Bool(true))
}

/// `list.push(v)`: append.
fn list_push(ctx: &mut NativeCtx<'_>) -> Result<Value, String> {
    let list = receiver_list(ctx);
    let value = ctx.args[0];
    ctx.heap.list_mut(list).items.push(value);
    Ok(Value::Bool(true))
}

/// `list.pop()`: remove and return the last element, or nil when empty.
fn list_pop(ctx: &mut NativeCtx<'_>) -> Result<Value, String> {
    let list = receiver_list(ctx);
    Ok(ctx.heap.list_mut(list).items.pop().unwrap_or(Value::Nil))
}

/// `list.remove(i)`: remove and return the element at `i`.
fn list_remove(ctx: &mut NativeCtx<'_>) -> Result<Value, String> {
    let list = receiver_list(ctx);
    let index = check_index("List index", ctx.heap.list(list).items.len(), ctx.args[0])?;
    Ok(ctx.heap.list_mut(list).items.remove(index))
}

/// `list.size()`: element count.
fn list_size(ctx: &mut NativeCtx<'_>) -> Result<Value, String> {
    let list = receiver_list(ctx);
    Ok(Value::Number(ctx.heap.list(list).items.len() as f64))
}
