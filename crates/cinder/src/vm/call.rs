//! Call dispatch: plain calls, method invocation, bound methods, and the
//! open-upvalue machinery.
//!
//! Helpers here return `Result<(), String>`; the dispatch loop turns a
//! message into a runtime error with the stack trace attached.

use std::rc::Rc;

use super::{CallFrame, FRAMES_MAX, Vm};
use crate::{
    builtins::NativeCtx,
    heap::{HeapData, HeapId, Upvalue},
    tracer::VmTracer,
    value::Value,
};

/// What sits in a callee slot, read out before dispatch so no heap borrow is
/// held across the call.
enum CalleeKind {
    Closure,
    Native,
    Class,
    Bound { receiver: Value, method: HeapId },
    NotCallable,
}

impl<Tr: VmTracer> Vm<Tr> {
    /// Calls `callee` with `arg_count` arguments sitting on top of the
    /// stack. The callee itself is just below them.
    pub(super) fn call_value(&mut self, callee: Value, arg_count: u8) -> Result<(), String> {
        let Value::Obj(id) = callee else {
            return Err("Can only call functions and classes.".to_owned());
        };
        let kind = match self.heap.get(id) {
            HeapData::Closure(_) => CalleeKind::Closure,
            HeapData::Native(_) => CalleeKind::Native,
            HeapData::Class(_) => CalleeKind::Class,
            HeapData::BoundMethod(bound) => CalleeKind::Bound {
                receiver: bound.receiver,
                method: bound.method,
            },
            _ => CalleeKind::NotCallable,
        };

        match kind {
            CalleeKind::Closure => self.call_closure(id, arg_count),
            CalleeKind::Native => self.call_native(id, arg_count),
            CalleeKind::Class => self.call_class(id, arg_count),
            CalleeKind::Bound { receiver, method } => {
                // The receiver takes over slot 0 of the new frame.
                let slot = self.stack.len() - arg_count as usize - 1;
                self.stack[slot] = receiver;
                self.call_callable(method, arg_count)
            }
            CalleeKind::NotCallable => Err("Can only call functions and classes.".to_owned()),
        }
    }

    /// Dispatches a method slot, which holds either a closure or a native.
    fn call_callable(&mut self, method: HeapId, arg_count: u8) -> Result<(), String> {
        match self.heap.get(method) {
            HeapData::Closure(_) => {}
            HeapData::Native(_) => return self.call_native(method, arg_count),
            _ => return Err("Can only call functions and classes.".to_owned()),
        }
        self.call_closure(method, arg_count)
    }

    /// Pushes a new call frame for a closure after checking arity and depth.
    pub(super) fn call_closure(&mut self, closure: HeapId, arg_count: u8) -> Result<(), String> {
        let function_id = self.heap.closure(closure).function;
        let function = self.heap.function(function_id);
        let arity = function.arity;
        let chunk = Rc::clone(&function.chunk);

        if arg_count != arity {
            return Err(format!("expected {arity} arguments but got {arg_count}."));
        }
        if self.frames.len() == FRAMES_MAX {
            return Err("stack overflow.".to_owned());
        }

        let slots = self.stack.len() - arg_count as usize - 1;
        self.frames.push(CallFrame {
            closure,
            chunk,
            ip: 0,
            slots,
        });
        Ok(())
    }

    /// Runs a native in place: the callee and arguments are replaced by the
    /// returned value.
    fn call_native(&mut self, native: HeapId, arg_count: u8) -> Result<(), String> {
        let (func, arity) = match self.heap.get(native) {
            HeapData::Native(n) => (n.func, n.arity),
            _ => unreachable!("call_native on a non-native object"),
        };
        if arg_count != arity {
            return Err(format!("expected {arity} arguments but got {arg_count}."));
        }

        let base = self.stack.len() - arg_count as usize;
        let result = {
            let mut ctx = NativeCtx {
                heap: &mut self.heap,
                receiver: self.stack[base - 1],
                args: &self.stack[base..],
                clock_base: self.started,
            };
            func(&mut ctx)?
        };
        self.stack.truncate(base - 1);
        self.push(result);
        Ok(())
    }

    /// Calling a class constructs an instance; with an `init` method the
    /// arguments go to it, otherwise none are allowed.
    fn call_class(&mut self, class: HeapId, arg_count: u8) -> Result<(), String> {
        let instance = self.heap.new_instance(class);
        let slot = self.stack.len() - arg_count as usize - 1;
        self.stack[slot] = Value::Obj(instance);

        let init_hash = self.heap.str_hash(self.init_string);
        let initializer = self.heap.class(class).methods.get(self.init_string, init_hash);
        if let Some(Value::Obj(init)) = initializer {
            self.call_callable(init, arg_count)
        } else if arg_count != 0 {
            Err(format!("expected 0 arguments but got {arg_count}."))
        } else {
            Ok(())
        }
    }

    /// `recv.name(args...)` without materializing a bound method.
    ///
    /// An instance field with the same name shadows the method; lists
    /// dispatch to the built-in list class.
    pub(super) fn invoke(&mut self, name: HeapId, arg_count: u8) -> Result<(), String> {
        let receiver = self.peek(arg_count as usize);
        let Value::Obj(receiver_id) = receiver else {
            return Err("only lists, instances have methods.".to_owned());
        };

        enum ReceiverKind {
            List,
            Instance(HeapId),
            Other,
        }
        let kind = match self.heap.get(receiver_id) {
            HeapData::List(_) => ReceiverKind::List,
            HeapData::Instance(instance) => ReceiverKind::Instance(instance.class),
            _ => ReceiverKind::Other,
        };

        match kind {
            ReceiverKind::List => self.invoke_from_class(self.list_class, name, arg_count),
            ReceiverKind::Instance(class) => {
                let hash = self.heap.str_hash(name);
                if let Some(field) = self.heap.instance(receiver_id).fields.get(name, hash) {
                    // The field replaces the receiver slot and is called as
                    // an ordinary value.
                    let slot = self.stack.len() - arg_count as usize - 1;
                    self.stack[slot] = field;
                    self.call_value(field, arg_count)
                } else {
                    self.invoke_from_class(class, name, arg_count)
                }
            }
            ReceiverKind::Other => Err("only lists, instances have methods.".to_owned()),
        }
    }

    pub(super) fn invoke_from_class(&mut self, class: HeapId, name: HeapId, arg_count: u8) -> Result<(), String> {
        let hash = self.heap.str_hash(name);
        match self.heap.class(class).methods.get(name, hash) {
            Some(method) => self.call_value(method, arg_count),
            None => Err(format!("undefined property '{}'.", self.heap.str_data(name).lossy())),
        }
    }

    /// Replaces the instance on top of the stack with a bound method for
    /// `name` looked up in `class`.
    pub(super) fn bind_method(&mut self, class: HeapId, name: HeapId) -> Result<(), String> {
        let hash = self.heap.str_hash(name);
        let Some(Value::Obj(method)) = self.heap.class(class).methods.get(name, hash) else {
            return Err(format!("undefined property '{}'.", self.heap.str_data(name).lossy()));
        };
        let receiver = self.peek(0);
        let bound = self.heap.new_bound_method(receiver, method);
        self.pop();
        self.push(Value::Obj(bound));
        Ok(())
    }

    /// Returns the upvalue for a stack slot, reusing an existing open one.
    ///
    /// The open list is kept sorted by decreasing slot so closing can stop
    /// at the first entry below the boundary.
    pub(super) fn capture_upvalue(&mut self, slot: usize) -> HeapId {
        let mut index = 0;
        while index < self.open_upvalues.len() {
            let existing = self.open_slot(self.open_upvalues[index]);
            if existing <= slot {
                break;
            }
            index += 1;
        }
        if index < self.open_upvalues.len() {
            let candidate = self.open_upvalues[index];
            if self.open_slot(candidate) == slot {
                return candidate;
            }
        }

        let created = self.heap.new_upvalue(slot);
        self.open_upvalues.insert(index, created);
        created
    }

    /// Closes every open upvalue at or above `from_slot`: the stack value
    /// moves into the upvalue, which leaves the open list.
    pub(super) fn close_upvalues(&mut self, from_slot: usize) {
        while let Some(&first) = self.open_upvalues.first() {
            let slot = self.open_slot(first);
            if slot < from_slot {
                break;
            }
            let value = self.stack[slot];
            *self.heap.upvalue_mut(first) = Upvalue::Closed(value);
            self.open_upvalues.remove(0);
        }
    }

    fn open_slot(&self, upvalue: HeapId) -> usize {
        match self.heap.upvalue(upvalue) {
            Upvalue::Open(slot) => *slot,
            Upvalue::Closed(_) => unreachable!("closed upvalue in the open list"),
        }
    }
}
