//! The virtual machine: a stack interpreter over compiled chunks.
//!
//! Execution state is one operand stack plus a stack of call frames (capacity
//! 64). Each frame carries its closure, its own instruction pointer, and the
//! operand-stack index of its slot 0 (the callee or receiver). The dispatch
//! loop keeps a local copy of the current frame so operand fetches do not go
//! through the frame vector; the copy is written back before anything that
//! can push or pop frames and reloaded afterwards.
//!
//! The top of the loop is the collector's safe point: when the heap crosses
//! its threshold (or stress mode is on), the VM marks its roots (operand
//! stack, frames' closures, open upvalues, globals, and the well-known
//! objects) and lets the heap finish the cycle.
//!
//! A runtime error formats its message, captures a stack trace innermost
//! frame first, resets the run state, and aborts execution. There is no
//! user-level catch.

mod call;

use std::{rc::Rc, time::Instant};

use crate::{
    builtins,
    bytecode::{Chunk, Opcode, dis},
    compiler::compile,
    error::{InterpretError, RuntimeError, TraceFrame},
    heap::{Heap, HeapData, HeapId, Upvalue},
    io::PrintWriter,
    table::Table,
    tracer::{NoopTracer, VmTracer},
    value::{Value, format_value},
};

/// Maximum call depth.
const FRAMES_MAX: usize = 64;
/// Operand stack capacity hint: frames times the addressable slots of each.
const STACK_MAX: usize = FRAMES_MAX * 256;

/// A single function activation record.
#[derive(Debug, Clone)]
struct CallFrame {
    closure: HeapId,
    /// The code being executed, shared with the function object so the
    /// dispatch loop never borrows the heap just to fetch bytes.
    chunk: Rc<Chunk>,
    ip: usize,
    /// Operand-stack index of slot 0 (the callee or receiver).
    slots: usize,
}

/// Fetches the next code byte, advancing the cached ip.
macro_rules! fetch_byte {
    ($frame:expr) => {{
        let byte = $frame.chunk.code[$frame.ip];
        $frame.ip += 1;
        byte
    }};
}

/// Fetches a u16 operand (little-endian).
macro_rules! fetch_u16 {
    ($frame:expr) => {{
        let lo = $frame.chunk.code[$frame.ip];
        let hi = $frame.chunk.code[$frame.ip + 1];
        $frame.ip += 2;
        u16::from_le_bytes([lo, hi])
    }};
}

/// Fetches a constant-pool operand.
macro_rules! fetch_constant {
    ($frame:expr) => {{
        let index = fetch_byte!($frame) as usize;
        $frame.chunk.constants[index]
    }};
}

/// Fetches a constant that is known to be an interned string (a name).
macro_rules! fetch_string {
    ($frame:expr) => {
        match fetch_constant!($frame) {
            Value::Obj(id) => id,
            _ => unreachable!("name constant is not a string"),
        }
    };
}

/// Aborts execution with a runtime error at the current instruction.
macro_rules! bail {
    ($self:expr, $frame:expr, $($arg:tt)*) => {
        return Err($self.throw(&$frame, format!($($arg)*)))
    };
}

/// Unwraps a `Result<T, String>` from a helper, converting the message into
/// a runtime error.
macro_rules! try_rt {
    ($self:expr, $frame:expr, $expr:expr) => {
        match $expr {
            Ok(value) => value,
            Err(message) => return Err($self.throw(&$frame, message)),
        }
    };
}

/// Pops two numbers and pushes the result of `a op b`.
macro_rules! binary_op {
    ($self:expr, $frame:expr, $wrap:path, $op:tt) => {{
        let (Value::Number(b), Value::Number(a)) = ($self.peek(0), $self.peek(1)) else {
            bail!($self, $frame, "operands must be numbers.")
        };
        $self.pop();
        $self.pop();
        $self.push($wrap(a $op b));
    }};
}

/// The virtual machine. One value owns the whole runtime: heap, globals,
/// stacks, and the well-known objects.
///
/// Generic over a [`VmTracer`]; the default no-op tracer compiles away.
pub struct Vm<Tr: VmTracer = NoopTracer> {
    heap: Heap,
    stack: Vec<Value>,
    frames: Vec<CallFrame>,
    globals: Table,
    /// Upvalues still pointing into the stack, sorted by decreasing slot.
    open_upvalues: Vec<HeapId>,
    /// Interned `"init"`, looked up on every class call.
    init_string: HeapId,
    /// The hidden class supplying list methods.
    list_class: HeapId,
    started: Instant,
    tracer: Tr,
}

impl Vm<NoopTracer> {
    #[must_use]
    pub fn new() -> Self {
        Self::with_tracer(NoopTracer)
    }
}

impl Default for Vm<NoopTracer> {
    fn default() -> Self {
        Self::new()
    }
}

impl<Tr: VmTracer> Vm<Tr> {
    #[must_use]
    pub fn with_tracer(tracer: Tr) -> Self {
        let mut heap = Heap::new();
        let mut globals = Table::new();
        let init_string = heap.intern_str("init");
        builtins::install_globals(&mut heap, &mut globals);
        let list_class = builtins::make_list_class(&mut heap);
        Self {
            heap,
            stack: Vec::with_capacity(STACK_MAX),
            frames: Vec::with_capacity(FRAMES_MAX),
            globals,
            open_upvalues: Vec::new(),
            init_string,
            list_class,
            started: Instant::now(),
            tracer,
        }
    }

    /// Makes the collector run at every safe point instead of on its
    /// threshold schedule. For shaking out liveness bugs.
    pub fn set_gc_stress(&mut self, stress: bool) {
        self.heap.set_stress(stress);
    }

    /// Compiles and runs a source program.
    ///
    /// `print` receives the output of `print` statements. On failure the
    /// returned error carries either the full diagnostic list or the runtime
    /// error with its stack trace.
    pub fn interpret(&mut self, source: &str, print: &mut impl PrintWriter) -> Result<(), InterpretError> {
        self.reset_runtime_state();

        let function = compile(source, &mut self.heap).map_err(InterpretError::Compile)?;
        let closure = self.heap.new_closure(function, Vec::new());
        self.push(Value::Obj(closure));
        self.call_closure(closure, 0)
            .map_err(|message| InterpretError::Runtime(self.runtime_error(message)))?;
        self.run(print).map_err(InterpretError::Runtime)
    }

    fn reset_runtime_state(&mut self) {
        self.stack.clear();
        self.frames.clear();
        self.open_upvalues.clear();
    }

    // === stack primitives ===

    fn push(&mut self, value: Value) {
        self.stack.push(value);
    }

    fn pop(&mut self) -> Value {
        self.stack.pop().expect("operand stack underflow")
    }

    fn peek(&self, distance: usize) -> Value {
        self.stack[self.stack.len() - 1 - distance]
    }

    fn current_frame(&self) -> CallFrame {
        self.frames.last().expect("no active call frame").clone()
    }

    /// Syncs the cached ip back and builds the error with a stack trace.
    fn throw(&mut self, frame: &CallFrame, message: String) -> RuntimeError {
        if let Some(top) = self.frames.last_mut() {
            top.ip = frame.ip;
        }
        self.runtime_error(message)
    }

    /// Captures the trace innermost frame first, then resets the run state.
    fn runtime_error(&mut self, message: String) -> RuntimeError {
        let mut trace = Vec::new();
        for frame in self.frames.iter().rev() {
            // The ip sits just past the failing instruction.
            let line = frame.chunk.line_at(frame.ip.saturating_sub(1));
            let function_id = self.heap.closure(frame.closure).function;
            let name = self
                .heap
                .function(function_id)
                .name
                .map(|id| self.heap.str_data(id).lossy().into_owned());
            trace.push(TraceFrame { line, function: name });
        }
        self.reset_runtime_state();
        RuntimeError { message, trace }
    }

    /// Marks the VM's roots and runs a full collection cycle.
    fn run_gc(&mut self) {
        for value in &self.stack {
            self.heap.mark_value(*value);
        }
        for frame in &self.frames {
            self.heap.mark_object(frame.closure);
        }
        for &upvalue in &self.open_upvalues {
            self.heap.mark_object(upvalue);
        }
        self.heap.mark_table(&self.globals);
        self.heap.mark_object(self.init_string);
        self.heap.mark_object(self.list_class);
        self.heap.finish_cycle();
    }

    /// The dispatch loop.
    fn run(&mut self, print: &mut impl PrintWriter) -> Result<(), RuntimeError> {
        let mut frame = self.current_frame();

        loop {
            if self.heap.should_gc() {
                self.run_gc();
            }

            if self.tracer.enabled() {
                let (text, _) = dis::disassemble_instruction(&self.heap, &frame.chunk, frame.ip);
                self.tracer.on_instruction(&text);
            }

            let op = Opcode::from_repr(fetch_byte!(frame)).expect("invalid opcode in bytecode");

            match op {
                Opcode::Constant => {
                    let constant = fetch_constant!(frame);
                    self.push(constant);
                }
                Opcode::Nil => self.push(Value::Nil),
                Opcode::True => self.push(Value::Bool(true)),
                Opcode::False => self.push(Value::Bool(false)),
                Opcode::Pop => {
                    self.pop();
                }
                Opcode::Dup => self.push(self.peek(0)),

                Opcode::GetLocal => {
                    let slot = fetch_byte!(frame) as usize;
                    self.push(self.stack[frame.slots + slot]);
                }
                Opcode::SetLocal => {
                    let slot = fetch_byte!(frame) as usize;
                    self.stack[frame.slots + slot] = self.peek(0);
                }

                Opcode::GetGlobal => {
                    let name = fetch_string!(frame);
                    let hash = self.heap.str_hash(name);
                    match self.globals.get(name, hash) {
                        Some(value) => self.push(value),
                        None => bail!(self, frame, "undefined variable '{}'.", self.heap.str_data(name).lossy()),
                    }
                }
                Opcode::DefineGlobal => {
                    let name = fetch_string!(frame);
                    let hash = self.heap.str_hash(name);
                    let value = self.peek(0);
                    self.globals.set(name, hash, value);
                    self.pop();
                }
                Opcode::SetGlobal => {
                    let name = fetch_string!(frame);
                    let hash = self.heap.str_hash(name);
                    // Assignment must not create the global.
                    if self.globals.set(name, hash, self.peek(0)) {
                        self.globals.delete(name, hash);
                        bail!(self, frame, "undefined variable '{}'.", self.heap.str_data(name).lossy());
                    }
                }

                Opcode::GetUpvalue => {
                    let slot = fetch_byte!(frame) as usize;
                    let upvalue = self.heap.closure(frame.closure).upvalues[slot];
                    let value = match self.heap.upvalue(upvalue) {
                        Upvalue::Open(stack_slot) => self.stack[*stack_slot],
                        Upvalue::Closed(value) => *value,
                    };
                    self.push(value);
                }
                Opcode::SetUpvalue => {
                    let slot = fetch_byte!(frame) as usize;
                    let upvalue = self.heap.closure(frame.closure).upvalues[slot];
                    let value = self.peek(0);
                    let open_slot = match self.heap.upvalue_mut(upvalue) {
                        Upvalue::Open(stack_slot) => Some(*stack_slot),
                        Upvalue::Closed(closed) => {
                            *closed = value;
                            None
                        }
                    };
                    if let Some(stack_slot) = open_slot {
                        self.stack[stack_slot] = value;
                    }
                }

                Opcode::GetProperty => {
                    let name = fetch_string!(frame);
                    let Value::Obj(receiver) = self.peek(0) else {
                        bail!(self, frame, "only lists and instances have properties.")
                    };
                    enum Receiver {
                        List,
                        Instance(HeapId),
                        Other,
                    }
                    let kind = match self.heap.get(receiver) {
                        HeapData::List(_) => Receiver::List,
                        HeapData::Instance(instance) => Receiver::Instance(instance.class),
                        _ => Receiver::Other,
                    };
                    match kind {
                        Receiver::List => try_rt!(self, frame, self.bind_method(self.list_class, name)),
                        Receiver::Instance(class) => {
                            let hash = self.heap.str_hash(name);
                            if let Some(value) = self.heap.instance(receiver).fields.get(name, hash) {
                                self.pop();
                                self.push(value);
                            } else {
                                try_rt!(self, frame, self.bind_method(class, name));
                            }
                        }
                        Receiver::Other => bail!(self, frame, "only lists and instances have properties."),
                    }
                }
                Opcode::SetProperty => {
                    let name = fetch_string!(frame);
                    let Value::Obj(target) = self.peek(1) else {
                        bail!(self, frame, "only instances have fields.")
                    };
                    if !matches!(self.heap.get(target), HeapData::Instance(_)) {
                        bail!(self, frame, "only instances have fields.");
                    }
                    let hash = self.heap.str_hash(name);
                    let value = self.peek(0);
                    self.heap.instance_mut(target).fields.set(name, hash, value);
                    // The assignment is an expression; its value survives.
                    let value = self.pop();
                    self.pop();
                    self.push(value);
                }
                Opcode::GetSuper => {
                    let name = fetch_string!(frame);
                    let Value::Obj(superclass) = self.pop() else {
                        unreachable!("'super' slot does not hold a class")
                    };
                    try_rt!(self, frame, self.bind_method(superclass, name));
                }

                Opcode::Equal => {
                    let b = self.pop();
                    let a = self.pop();
                    self.push(Value::Bool(a.equals(b)));
                }
                Opcode::Greater => binary_op!(self, frame, Value::Bool, >),
                Opcode::Less => binary_op!(self, frame, Value::Bool, <),
                Opcode::Add => match (self.peek(1), self.peek(0)) {
                    (Value::Number(a), Value::Number(b)) => {
                        self.pop();
                        self.pop();
                        self.push(Value::Number(a + b));
                    }
                    (Value::Obj(a), Value::Obj(b))
                        if matches!(self.heap.get(a), HeapData::Str(_)) && matches!(self.heap.get(b), HeapData::Str(_)) =>
                    {
                        let mut bytes = self.heap.str_data(a).bytes.to_vec();
                        bytes.extend_from_slice(&self.heap.str_data(b).bytes);
                        self.pop();
                        self.pop();
                        let result = self.heap.intern_bytes(&bytes);
                        self.push(Value::Obj(result));
                    }
                    _ => bail!(self, frame, "operands must be two numbers or two strings."),
                },
                Opcode::Subtract => binary_op!(self, frame, Value::Number, -),
                Opcode::Multiply => binary_op!(self, frame, Value::Number, *),
                Opcode::Divide => binary_op!(self, frame, Value::Number, /),
                Opcode::Not => {
                    let value = self.pop();
                    self.push(Value::Bool(value.is_falsey()));
                }
                Opcode::Negate => {
                    let Value::Number(n) = self.peek(0) else {
                        bail!(self, frame, "operand must be a number.")
                    };
                    self.pop();
                    self.push(Value::Number(-n));
                }
                Opcode::Inc => {
                    let Value::Number(n) = self.peek(0) else {
                        bail!(self, frame, "can only increment numbers.")
                    };
                    self.pop();
                    self.push(Value::Number(n + 1.0));
                }
                Opcode::Dec => {
                    let Value::Number(n) = self.peek(0) else {
                        bail!(self, frame, "can only decrement numbers.")
                    };
                    self.pop();
                    self.push(Value::Number(n - 1.0));
                }

                Opcode::Print => {
                    let value = self.pop();
                    let text = format_value(&self.heap, value);
                    print.stdout_write(&text);
                    print.stdout_push('\n');
                }

                Opcode::Jump => {
                    let offset = fetch_u16!(frame) as usize;
                    frame.ip += offset;
                }
                Opcode::JumpIfFalse => {
                    let offset = fetch_u16!(frame) as usize;
                    if self.peek(0).is_falsey() {
                        frame.ip += offset;
                    }
                }
                Opcode::Loop => {
                    let offset = fetch_u16!(frame) as usize;
                    frame.ip -= offset;
                }

                Opcode::Call => {
                    let arg_count = fetch_byte!(frame);
                    self.sync_ip(&frame);
                    let callee = self.peek(arg_count as usize);
                    try_rt!(self, frame, self.call_value(callee, arg_count));
                    frame = self.current_frame();
                }
                Opcode::Invoke => {
                    let name = fetch_string!(frame);
                    let arg_count = fetch_byte!(frame);
                    self.sync_ip(&frame);
                    try_rt!(self, frame, self.invoke(name, arg_count));
                    frame = self.current_frame();
                }
                Opcode::SuperInvoke => {
                    let name = fetch_string!(frame);
                    let arg_count = fetch_byte!(frame);
                    let Value::Obj(superclass) = self.pop() else {
                        unreachable!("'super' slot does not hold a class")
                    };
                    self.sync_ip(&frame);
                    try_rt!(self, frame, self.invoke_from_class(superclass, name, arg_count));
                    frame = self.current_frame();
                }

                Opcode::Closure => {
                    let Value::Obj(function) = fetch_constant!(frame) else {
                        unreachable!("closure constant is not a function")
                    };
                    let upvalue_count = self.heap.function(function).upvalue_count;
                    let mut upvalues = Vec::with_capacity(upvalue_count);
                    for _ in 0..upvalue_count {
                        let is_local = fetch_byte!(frame) == 1;
                        let index = fetch_byte!(frame) as usize;
                        if is_local {
                            upvalues.push(self.capture_upvalue(frame.slots + index));
                        } else {
                            upvalues.push(self.heap.closure(frame.closure).upvalues[index]);
                        }
                    }
                    let closure = self.heap.new_closure(function, upvalues);
                    self.push(Value::Obj(closure));
                }
                Opcode::CloseUpvalue => {
                    self.close_upvalues(self.stack.len() - 1);
                    self.pop();
                }

                Opcode::Return => {
                    let result = self.pop();
                    self.close_upvalues(frame.slots);
                    self.frames.pop();
                    if self.frames.is_empty() {
                        // The script closure itself.
                        self.pop();
                        return Ok(());
                    }
                    self.stack.truncate(frame.slots);
                    self.push(result);
                    frame = self.current_frame();
                }

                Opcode::Class => {
                    let name = fetch_string!(frame);
                    let class = self.heap.new_class(name);
                    self.push(Value::Obj(class));
                }
                Opcode::Inherit => {
                    let Value::Obj(superclass) = self.peek(1) else {
                        bail!(self, frame, "superclass must be a class.")
                    };
                    if !matches!(self.heap.get(superclass), HeapData::Class(_)) {
                        bail!(self, frame, "superclass must be a class.");
                    }
                    let Value::Obj(subclass) = self.peek(0) else {
                        unreachable!("inherit target is not a class")
                    };
                    // Copy-down inheritance: methods defined after this point
                    // override the copied entries.
                    let methods = self.heap.class(superclass).methods.clone();
                    self.heap.class_mut(subclass).methods.add_all(&methods);
                    self.pop();
                }
                Opcode::Method => {
                    let name = fetch_string!(frame);
                    let method = self.peek(0);
                    let Value::Obj(class) = self.peek(1) else {
                        unreachable!("method target is not a class")
                    };
                    let hash = self.heap.str_hash(name);
                    self.heap.class_mut(class).methods.set(name, hash, method);
                    self.pop();
                }

                Opcode::List => {
                    let length = fetch_byte!(frame) as usize;
                    let start = self.stack.len() - length;
                    let items = self.stack.split_off(start);
                    let list = self.heap.new_list(items);
                    self.push(Value::Obj(list));
                }
                Opcode::MapInit => {
                    let map = self.heap.new_map();
                    self.push(Value::Obj(map));
                }
                Opcode::MapData => {
                    let Value::Obj(map) = self.peek(2) else {
                        bail!(self, frame, "map data can only be added to a map.")
                    };
                    if !matches!(self.heap.get(map), HeapData::Map(_)) {
                        bail!(self, frame, "map data can only be added to a map.");
                    }
                    let Value::Obj(key) = self.peek(1) else {
                        bail!(self, frame, "map key must be a string.")
                    };
                    if !matches!(self.heap.get(key), HeapData::Str(_)) {
                        bail!(self, frame, "map key must be a string.");
                    }
                    let value = self.peek(0);
                    let hash = self.heap.str_hash(key);
                    match self.heap.get_mut(map) {
                        HeapData::Map(m) => m.entries.set(key, hash, value),
                        _ => unreachable!("checked above"),
                    };
                    self.pop();
                    self.pop();
                }

                Opcode::GetIndex => self.get_index(&frame)?,
                Opcode::SetIndex => self.set_index(&frame)?,
                Opcode::ShiftIndex => {
                    let value = self.pop();
                    let Value::Obj(list) = self.peek(0) else {
                        bail!(self, frame, "can only push value to list.")
                    };
                    if !matches!(self.heap.get(list), HeapData::List(_)) {
                        bail!(self, frame, "can only push value to list.");
                    }
                    self.heap.list_mut(list).items.push(value);
                }
            }
        }
    }

    fn sync_ip(&mut self, frame: &CallFrame) {
        if let Some(top) = self.frames.last_mut() {
            top.ip = frame.ip;
        }
    }

    /// `container[index]` for lists, maps, and strings.
    fn get_index(&mut self, frame: &CallFrame) -> Result<(), RuntimeError> {
        let container = self.peek(1);
        let index = self.peek(0);

        let Value::Obj(id) = container else {
            bail!(self, frame, "can only subscript list, string or index map.")
        };
        enum Kind {
            List(usize),
            Map,
            Str(usize),
            Other,
        }
        let kind = match self.heap.get(id) {
            HeapData::List(l) => Kind::List(l.items.len()),
            HeapData::Map(_) => Kind::Map,
            HeapData::Str(s) => Kind::Str(s.bytes.len()),
            _ => Kind::Other,
        };
        match kind {
            Kind::List(len) => {
                let Value::Number(n) = index else {
                    bail!(self, frame, "index must be a number.")
                };
                let slot = n as i64;
                if slot < 0 || slot >= len as i64 {
                    bail!(self, frame, "index out of range.");
                }
                let value = self.heap.list(id).items[slot as usize];
                self.pop();
                self.pop();
                self.push(value);
            }
            Kind::Map => {
                let Value::Obj(key) = index else {
                    bail!(self, frame, "map can only be indexed by string.")
                };
                if !matches!(self.heap.get(key), HeapData::Str(_)) {
                    bail!(self, frame, "map can only be indexed by string.");
                }
                let hash = self.heap.str_hash(key);
                let entry = match self.heap.get(id) {
                    HeapData::Map(m) => m.entries.get(key, hash),
                    _ => unreachable!("checked above"),
                };
                match entry {
                    Some(value) => {
                        self.pop();
                        self.pop();
                        self.push(value);
                    }
                    None => bail!(self, frame, "undefined key '{}'", self.heap.str_data(key).lossy()),
                }
            }
            Kind::Str(len) => {
                let Value::Number(n) = index else {
                    bail!(self, frame, "index must be a number.")
                };
                let slot = n as i64;
                if slot < 0 || slot >= len as i64 {
                    bail!(self, frame, "index out of range.");
                }
                let byte = self.heap.str_data(id).bytes[slot as usize];
                self.pop();
                self.pop();
                self.push(Value::Number(f64::from(byte)));
            }
            Kind::Other => bail!(self, frame, "can only subscript list, string or index map."),
        }
        Ok(())
    }

    /// `container[index] = value` for lists and maps. The container stays on
    /// the stack as the expression's value.
    fn set_index(&mut self, frame: &CallFrame) -> Result<(), RuntimeError> {
        let value = self.pop();
        let container = self.peek(1);

        let Value::Obj(id) = container else {
            bail!(self, frame, "can only set subscript of list or index of map.")
        };
        enum Kind {
            List(usize),
            Map,
            Other,
        }
        let kind = match self.heap.get(id) {
            HeapData::List(l) => Kind::List(l.items.len()),
            HeapData::Map(_) => Kind::Map,
            _ => Kind::Other,
        };
        match kind {
            Kind::List(len) => {
                let Value::Number(n) = self.peek(0) else {
                    bail!(self, frame, "index must be a number.")
                };
                let slot = n as i64;
                if slot < 0 || slot >= len as i64 {
                    bail!(self, frame, "index out of range.");
                }
                self.pop();
                self.heap.list_mut(id).items[slot as usize] = value;
            }
            Kind::Map => {
                let Value::Obj(key) = self.peek(0) else {
                    bail!(self, frame, "map can only be indexed by string.")
                };
                if !matches!(self.heap.get(key), HeapData::Str(_)) {
                    bail!(self, frame, "map can only be indexed by string.");
                }
                let hash = self.heap.str_hash(key);
                match self.heap.get_mut(id) {
                    HeapData::Map(m) => m.entries.set(key, hash, value),
                    _ => unreachable!("checked above"),
                };
                self.pop();
            }
            Kind::Other => bail!(self, frame, "can only set subscript of list or index of map."),
        }
        Ok(())
    }
}
