//! Object heap and garbage collector.
//!
//! All runtime objects live in a slot arena: a `Vec` of optional entries plus
//! a free list, so ids stay stable for the whole life of an object and freed
//! slots are recycled. The arena doubles as the all-objects list that the
//! sweep phase walks.
//!
//! Collection is precise, non-moving, tri-color mark-sweep:
//!
//! 1. the VM marks its roots (operand stack, call frames, open upvalues,
//!    globals, well-known objects) via [`Heap::mark_value`] and friends;
//! 2. [`Heap::finish_cycle`] drains the gray worklist, blackening objects by
//!    marking everything they reference;
//! 3. interned strings that stayed white are dropped from the intern table
//!    (otherwise the table would keep every string alive forever);
//! 4. the sweep frees white objects and resets survivors to white, then
//!    schedules the next collection at twice the surviving byte count.
//!
//! Collection only ever runs at the dispatch loop's safe point, where every
//! live object is reachable from VM state. Allocation itself never collects,
//! so freshly created objects cannot be swept before they are rooted.

use std::{borrow::Cow, rc::Rc};

use smallvec::SmallVec;

use crate::{builtins::NativeFn, bytecode::Chunk, table::Table, value::Value};

/// Collection is first considered once this many bytes are live.
const FIRST_GC_THRESHOLD: usize = 1024 * 1024;

/// After a collection the next threshold is the surviving size times this.
const HEAP_GROW_FACTOR: usize = 2;

/// Index of an object in the heap arena.
///
/// `u32` keeps `Value` small; four billion live objects is far beyond any
/// realistic script.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct HeapId(u32);

impl HeapId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// An interned string: raw bytes plus the precomputed FNV-1a hash.
///
/// Bytes rather than `str` because `\xHH` escapes can produce arbitrary,
/// non-UTF-8 contents. Rendering is lossy where it has to be.
#[derive(Debug)]
pub(crate) struct Str {
    pub bytes: Box<[u8]>,
    pub hash: u32,
}

impl Str {
    pub fn lossy(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.bytes)
    }
}

/// A compiled function: bytecode plus call metadata.
///
/// The chunk sits behind `Rc` so call frames can hold the code they are
/// executing without borrowing the heap.
#[derive(Debug)]
pub(crate) struct Function {
    pub name: Option<HeapId>,
    pub arity: u8,
    pub upvalue_count: usize,
    pub chunk: Rc<Chunk>,
}

/// A host function exposed to scripts.
#[derive(Debug)]
pub(crate) struct Native {
    pub func: NativeFn,
    pub arity: u8,
}

/// A function together with its captured upvalues.
#[derive(Debug)]
pub(crate) struct Closure {
    pub function: HeapId,
    pub upvalues: Vec<HeapId>,
}

/// A captured variable.
///
/// `Open` points at a live operand-stack slot; once that slot leaves scope
/// the value is moved into the upvalue itself (`Closed`). The VM keeps open
/// upvalues in a list sorted by decreasing slot, at most one per slot.
#[derive(Debug)]
pub(crate) enum Upvalue {
    Open(usize),
    Closed(Value),
}

#[derive(Debug)]
pub(crate) struct Class {
    pub name: HeapId,
    /// Method name -> closure or native.
    pub methods: Table,
}

#[derive(Debug)]
pub(crate) struct Instance {
    pub class: HeapId,
    pub fields: Table,
}

/// A method extracted from an instance, remembering its receiver.
///
/// `method` may be a closure or a native; the call path dispatches on the
/// actual kind.
#[derive(Debug)]
pub(crate) struct BoundMethod {
    pub receiver: Value,
    pub method: HeapId,
}

#[derive(Debug, Default)]
pub(crate) struct List {
    pub items: Vec<Value>,
}

#[derive(Debug, Default)]
pub(crate) struct Map {
    pub entries: Table,
}

/// The sealed set of heap object kinds.
#[derive(Debug)]
pub(crate) enum HeapData {
    Str(Str),
    Function(Function),
    Native(Native),
    Closure(Closure),
    Upvalue(Upvalue),
    Class(Class),
    Instance(Instance),
    BoundMethod(BoundMethod),
    List(List),
    Map(Map),
}

#[derive(Debug)]
struct HeapEntry {
    marked: bool,
    data: HeapData,
}

/// The object arena plus everything the collector needs.
#[derive(Debug)]
pub(crate) struct Heap {
    entries: Vec<Option<HeapEntry>>,
    /// Slots freed by the sweep, reused by `allocate`.
    free_list: Vec<HeapId>,
    /// Intern table: every live string, keyed by itself (value is nil).
    /// Weakly cleaned during collection.
    strings: Table,
    bytes_allocated: usize,
    next_gc: usize,
    /// Gray worklist: marked but not yet traced.
    gray: Vec<HeapId>,
    /// When set, `should_gc` fires at every safe point.
    stress: bool,
}

impl Heap {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
            free_list: Vec::new(),
            strings: Table::new(),
            bytes_allocated: 0,
            next_gc: FIRST_GC_THRESHOLD,
            gray: Vec::new(),
            stress: false,
        }
    }

    /// Allocates a new heap object and returns its id.
    ///
    /// Reuses a freed slot when one is available so long-running loops that
    /// allocate and drop keep the arena from growing without bound.
    pub fn allocate(&mut self, data: HeapData) -> HeapId {
        self.bytes_allocated += estimate_size(&data);
        let entry = HeapEntry { marked: false, data };
        if let Some(id) = self.free_list.pop() {
            self.entries[id.index()] = Some(entry);
            id
        } else {
            let id = HeapId(u32::try_from(self.entries.len()).expect("heap arena exceeded u32 ids"));
            self.entries.push(Some(entry));
            id
        }
    }

    // === constructors, one per object kind ===

    pub fn new_function(&mut self, name: Option<HeapId>, arity: u8, upvalue_count: usize, chunk: Rc<Chunk>) -> HeapId {
        self.allocate(HeapData::Function(Function {
            name,
            arity,
            upvalue_count,
            chunk,
        }))
    }

    pub fn new_native(&mut self, func: NativeFn, arity: u8) -> HeapId {
        self.allocate(HeapData::Native(Native { func, arity }))
    }

    pub fn new_closure(&mut self, function: HeapId, upvalues: Vec<HeapId>) -> HeapId {
        self.allocate(HeapData::Closure(Closure { function, upvalues }))
    }

    pub fn new_upvalue(&mut self, slot: usize) -> HeapId {
        self.allocate(HeapData::Upvalue(Upvalue::Open(slot)))
    }

    pub fn new_class(&mut self, name: HeapId) -> HeapId {
        self.allocate(HeapData::Class(Class {
            name,
            methods: Table::new(),
        }))
    }

    pub fn new_instance(&mut self, class: HeapId) -> HeapId {
        self.allocate(HeapData::Instance(Instance {
            class,
            fields: Table::new(),
        }))
    }

    pub fn new_bound_method(&mut self, receiver: Value, method: HeapId) -> HeapId {
        self.allocate(HeapData::BoundMethod(BoundMethod { receiver, method }))
    }

    pub fn new_list(&mut self, items: Vec<Value>) -> HeapId {
        self.allocate(HeapData::List(List { items }))
    }

    pub fn new_map(&mut self) -> HeapId {
        self.allocate(HeapData::Map(Map::default()))
    }

    // === interning ===

    /// Returns the interned string for `bytes`, allocating it on first use.
    ///
    /// Afterwards, two strings are id-equal iff they are byte-equal, which
    /// makes method lookup and field access a plain id comparison.
    pub fn intern_bytes(&mut self, bytes: &[u8]) -> HeapId {
        let hash = fnv1a(bytes);
        let entries = &self.entries;
        let existing = self.strings.find_string(hash, bytes, |id| {
            match &entries[id.index()].as_ref().expect("intern table holds a freed string").data {
                HeapData::Str(s) => &*s.bytes,
                _ => unreachable!("intern table key is not a string"),
            }
        });
        if let Some(id) = existing {
            return id;
        }
        let id = self.allocate(HeapData::Str(Str {
            bytes: bytes.into(),
            hash,
        }));
        self.strings.set(id, hash, Value::Nil);
        id
    }

    pub fn intern_str(&mut self, s: &str) -> HeapId {
        self.intern_bytes(s.as_bytes())
    }

    // === accessors ===

    pub fn get(&self, id: HeapId) -> &HeapData {
        &self.entries[id.index()].as_ref().expect("use of freed heap object").data
    }

    pub fn get_mut(&mut self, id: HeapId) -> &mut HeapData {
        &mut self.entries[id.index()].as_mut().expect("use of freed heap object").data
    }

    pub fn str_data(&self, id: HeapId) -> &Str {
        match self.get(id) {
            HeapData::Str(s) => s,
            _ => unreachable!("expected string object"),
        }
    }

    pub fn str_hash(&self, id: HeapId) -> u32 {
        self.str_data(id).hash
    }

    pub fn function(&self, id: HeapId) -> &Function {
        match self.get(id) {
            HeapData::Function(f) => f,
            _ => unreachable!("expected function object"),
        }
    }

    pub fn closure(&self, id: HeapId) -> &Closure {
        match self.get(id) {
            HeapData::Closure(c) => c,
            _ => unreachable!("expected closure object"),
        }
    }

    pub fn class(&self, id: HeapId) -> &Class {
        match self.get(id) {
            HeapData::Class(c) => c,
            _ => unreachable!("expected class object"),
        }
    }

    pub fn class_mut(&mut self, id: HeapId) -> &mut Class {
        match self.get_mut(id) {
            HeapData::Class(c) => c,
            _ => unreachable!("expected class object"),
        }
    }

    pub fn instance(&self, id: HeapId) -> &Instance {
        match self.get(id) {
            HeapData::Instance(i) => i,
            _ => unreachable!("expected instance object"),
        }
    }

    pub fn instance_mut(&mut self, id: HeapId) -> &mut Instance {
        match self.get_mut(id) {
            HeapData::Instance(i) => i,
            _ => unreachable!("expected instance object"),
        }
    }

    pub fn list(&self, id: HeapId) -> &List {
        match self.get(id) {
            HeapData::List(l) => l,
            _ => unreachable!("expected list object"),
        }
    }

    pub fn list_mut(&mut self, id: HeapId) -> &mut List {
        match self.get_mut(id) {
            HeapData::List(l) => l,
            _ => unreachable!("expected list object"),
        }
    }

    pub fn upvalue(&self, id: HeapId) -> &Upvalue {
        match self.get(id) {
            HeapData::Upvalue(u) => u,
            _ => unreachable!("expected upvalue object"),
        }
    }

    pub fn upvalue_mut(&mut self, id: HeapId) -> &mut Upvalue {
        match self.get_mut(id) {
            HeapData::Upvalue(u) => u,
            _ => unreachable!("expected upvalue object"),
        }
    }

    // === collection scheduling ===

    pub fn set_stress(&mut self, stress: bool) {
        self.stress = stress;
    }

    pub fn should_gc(&self) -> bool {
        self.stress || self.bytes_allocated > self.next_gc
    }

    /// Number of live objects in the arena. Test hook.
    #[cfg(test)]
    pub fn live_objects(&self) -> usize {
        self.entries.iter().filter(|e| e.is_some()).count()
    }

    #[cfg(test)]
    pub fn is_live(&self, id: HeapId) -> bool {
        self.entries.get(id.index()).is_some_and(Option::is_some)
    }

    // === mark phase (driven by the VM, which knows the roots) ===

    pub fn mark_value(&mut self, value: Value) {
        if let Value::Obj(id) = value {
            self.mark_object(id);
        }
    }

    /// Marks an object gray: sets its mark bit and queues it for tracing.
    /// Already-marked objects are skipped, which is what terminates cycles.
    pub fn mark_object(&mut self, id: HeapId) {
        let Some(entry) = self.entries[id.index()].as_mut() else {
            return;
        };
        if entry.marked {
            return;
        }
        entry.marked = true;
        self.gray.push(id);
    }

    /// Marks every key and value of an externally held table (the globals).
    pub fn mark_table(&mut self, table: &Table) {
        for (key, value) in table.iter() {
            self.mark_object(key);
            self.mark_value(value);
        }
    }

    /// Runs the trace, weak-clean, and sweep phases, then schedules the next
    /// collection. Call after all roots have been marked.
    pub fn finish_cycle(&mut self) {
        self.trace();
        self.remove_white_strings();
        self.sweep();
        self.next_gc = self.bytes_allocated * HEAP_GROW_FACTOR;
    }

    /// Drains the gray worklist, blackening one object at a time.
    fn trace(&mut self) {
        while let Some(id) = self.gray.pop() {
            // Children are gathered first so marking them does not alias the
            // borrow of this object's payload.
            let mut children: SmallVec<[HeapId; 16]> = SmallVec::new();
            let entry = self.entries[id.index()].as_ref().expect("gray object was freed");
            collect_child_ids(&entry.data, &mut children);
            for child in children {
                self.mark_object(child);
            }
        }
    }

    /// Drops intern-table entries whose strings did not survive marking.
    fn remove_white_strings(&mut self) {
        let entries = &self.entries;
        self.strings
            .remove_unmarked(|id| entries[id.index()].as_ref().is_some_and(|e| e.marked));
    }

    /// Frees unmarked objects and resets survivors to white.
    ///
    /// Recomputes `bytes_allocated` from the survivors so sizes that changed
    /// since allocation (grown lists, grown tables) are accounted for.
    fn sweep(&mut self) {
        let mut live_bytes = 0;
        for (index, slot) in self.entries.iter_mut().enumerate() {
            match slot {
                Some(entry) if entry.marked => {
                    entry.marked = false;
                    live_bytes += estimate_size(&entry.data);
                }
                Some(_) => {
                    *slot = None;
                    self.free_list.push(HeapId(index as u32));
                }
                None => {}
            }
        }
        self.bytes_allocated = live_bytes;
    }
}

/// FNV-1a, 32 bits: the string hash used for interning and table probing.
pub(crate) fn fnv1a(bytes: &[u8]) -> u32 {
    let mut hash: u32 = 2_166_136_261;
    for &b in bytes {
        hash ^= u32::from(b);
        hash = hash.wrapping_mul(16_777_619);
    }
    hash
}

/// Appends every heap id directly referenced by `data` to `out`.
///
/// Strings and natives are leaves. Table-bearing objects contribute both
/// keys and values.
fn collect_child_ids(data: &HeapData, out: &mut SmallVec<[HeapId; 16]>) {
    match data {
        HeapData::Str(_) | HeapData::Native(_) => {}
        HeapData::Function(f) => {
            if let Some(name) = f.name {
                out.push(name);
            }
            for constant in &f.chunk.constants {
                if let Value::Obj(id) = constant {
                    out.push(*id);
                }
            }
        }
        HeapData::Closure(c) => {
            out.push(c.function);
            out.extend(c.upvalues.iter().copied());
        }
        HeapData::Upvalue(u) => {
            if let Upvalue::Closed(Value::Obj(id)) = u {
                out.push(*id);
            }
        }
        HeapData::Class(c) => {
            out.push(c.name);
            collect_table_ids(&c.methods, out);
        }
        HeapData::Instance(i) => {
            out.push(i.class);
            collect_table_ids(&i.fields, out);
        }
        HeapData::BoundMethod(b) => {
            if let Value::Obj(id) = b.receiver {
                out.push(id);
            }
            out.push(b.method);
        }
        HeapData::List(l) => {
            for item in &l.items {
                if let Value::Obj(id) = item {
                    out.push(*id);
                }
            }
        }
        HeapData::Map(m) => collect_table_ids(&m.entries, out),
    }
}

fn collect_table_ids(table: &Table, out: &mut SmallVec<[HeapId; 16]>) {
    for (key, value) in table.iter() {
        out.push(key);
        if let Value::Obj(id) = value {
            out.push(id);
        }
    }
}

/// Rough byte cost of an object, fed into the collection threshold.
fn estimate_size(data: &HeapData) -> usize {
    let base = size_of::<HeapEntry>();
    base + match data {
        HeapData::Str(s) => s.bytes.len(),
        HeapData::Function(f) => {
            f.chunk.code.len() + f.chunk.lines.len() * size_of::<u32>() + f.chunk.constants.len() * size_of::<Value>()
        }
        HeapData::Native(_) | HeapData::Upvalue(_) | HeapData::BoundMethod(_) => 0,
        HeapData::Closure(c) => c.upvalues.len() * size_of::<HeapId>(),
        HeapData::Class(c) => c.methods.byte_size(),
        HeapData::Instance(i) => i.fields.byte_size(),
        HeapData::List(l) => l.items.capacity() * size_of::<Value>(),
        HeapData::Map(m) => m.entries.byte_size(),
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn collect_with_roots(heap: &mut Heap, roots: &[HeapId]) {
        for &id in roots {
            heap.mark_object(id);
        }
        heap.finish_cycle();
    }

    #[test]
    fn interning_reuses_strings() {
        let mut heap = Heap::new();
        let a = heap.intern_str("shared");
        let b = heap.intern_str("shared");
        let c = heap.intern_str("other");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(heap.live_objects(), 2);
    }

    #[test]
    fn unreachable_objects_are_swept() {
        let mut heap = Heap::new();
        let keep = heap.intern_str("keep");
        let doomed = heap.intern_str("doomed");
        collect_with_roots(&mut heap, &[keep]);
        assert!(heap.is_live(keep));
        assert!(!heap.is_live(doomed));
    }

    #[test]
    fn intern_table_is_weak() {
        let mut heap = Heap::new();
        let keep = heap.intern_str("keep");
        heap.intern_str("transient");
        collect_with_roots(&mut heap, &[keep]);
        // The freed string's slot must be reusable and re-interning must not
        // resolve to the freed slot's stale entry.
        let again = heap.intern_str("transient");
        assert!(heap.is_live(again));
        assert_eq!(heap.str_data(again).lossy(), "transient");
    }

    #[test]
    fn cycles_are_collected() {
        let mut heap = Heap::new();
        let name = heap.intern_str("Node");
        let class = heap.new_class(name);
        let a = heap.new_instance(class);
        let b = heap.new_instance(class);
        let field = heap.intern_str("next");
        let hash = heap.str_hash(field);
        match heap.get_mut(a) {
            HeapData::Instance(i) => i.fields.set(field, hash, Value::Obj(b)),
            _ => unreachable!(),
        };
        match heap.get_mut(b) {
            HeapData::Instance(i) => i.fields.set(field, hash, Value::Obj(a)),
            _ => unreachable!(),
        };

        // Instances point at the class, not the other way around, so rooting
        // only the class leaves the two-instance cycle unreachable.
        collect_with_roots(&mut heap, &[class]);
        assert!(heap.is_live(class));
        assert!(!heap.is_live(a));
        assert!(!heap.is_live(b));
    }

    #[test]
    fn survivors_are_white_after_collection() {
        let mut heap = Heap::new();
        let keep = heap.intern_str("keep");
        collect_with_roots(&mut heap, &[keep]);
        // A second cycle with the same root must behave identically, which
        // requires the mark bit to have been reset.
        collect_with_roots(&mut heap, &[keep]);
        assert!(heap.is_live(keep));
    }

    #[test]
    fn freed_slots_are_reused() {
        let mut heap = Heap::new();
        let keep = heap.intern_str("keep");
        let doomed = heap.intern_str("doomed");
        collect_with_roots(&mut heap, &[keep]);
        let recycled = heap.intern_str("recycled");
        assert_eq!(doomed.index(), recycled.index());
    }

    #[test]
    fn threshold_is_rescheduled_after_collection() {
        let mut heap = Heap::new();
        let keep = heap.intern_str("keep");
        collect_with_roots(&mut heap, &[keep]);
        assert!(heap.next_gc >= heap.bytes_allocated);
    }
}
