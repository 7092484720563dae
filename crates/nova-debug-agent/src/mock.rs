//! In-memory runtime used by the agent's own tests and by embedders that want
//! to exercise a session without a real VM.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex};

use nova_jdwp::{
    FieldId, MethodId, ACC_PUBLIC, CLASS_STATUS_INITIALIZED,
    CLASS_STATUS_PREPARED, CLASS_STATUS_VERIFIED, TAG_ARRAY, TAG_OBJECT, TAG_STRING, TAG_THREAD,
    TYPE_TAG_CLASS,
};

use crate::poison::lock;
use crate::runtime::{
    ClassId, ClassInfo, ClassModel, FieldInfo, Frame, GcVisitor, Heap, HeapRef, Instrumentation,
    InstrumentationEvents, Interpreter, InvocationCall, InvokeOutcome, LineEntry, LocalVariable,
    MethodInfo, Runtime, ThreadHandle, Value,
};

/// One call the agent made into [`Instrumentation`], in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstrumentationCall {
    AddListener(InstrumentationEvents),
    RemoveListener(InstrumentationEvents),
    DeoptimizeEverything,
    UndeoptimizeEverything,
    Deoptimize(MethodId),
    Undeoptimize(MethodId),
}

#[derive(Debug, Clone)]
struct MockObject {
    class: ClassId,
    tag: u8,
    string: Option<String>,
}

#[derive(Default)]
struct State {
    next_id: u64,
    next_ref: u64,
    classes: BTreeMap<ClassId, ClassInfo>,
    methods: BTreeMap<MethodId, MethodInfo>,
    fields: BTreeMap<FieldId, FieldInfo>,
    objects: BTreeMap<HeapRef, MockObject>,
    field_values: HashMap<(Option<HeapRef>, FieldId), Value>,
    frames: HashMap<ThreadHandle, Vec<Frame>>,
    locals: HashMap<(ThreadHandle, usize, u32), Value>,
    pending_exceptions: HashMap<ThreadHandle, HeapRef>,
    invoke_results: HashMap<MethodId, InvokeOutcome>,
    invocations: Vec<(ThreadHandle, InvocationCall)>,
    inlinable: HashSet<MethodId>,
    interpret_only: bool,
    instrumentation_calls: Vec<InstrumentationCall>,
    collections: usize,
}

impl State {
    fn mint_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn class_named(&mut self, signature: &str) -> ClassId {
        if let Some(id) = self
            .classes
            .values()
            .find(|class| class.signature == signature)
            .map(|class| class.id)
        {
            return id;
        }
        let id = self.mint_id();
        self.classes.insert(
            id,
            ClassInfo {
                id,
                signature: signature.to_string(),
                generic_signature: None,
                type_tag: TYPE_TAG_CLASS,
                status: CLASS_STATUS_VERIFIED | CLASS_STATUS_PREPARED | CLASS_STATUS_INITIALIZED,
                modifiers: ACC_PUBLIC,
                source_file: None,
                superclass: None,
            },
        );
        id
    }

    fn allocate(&mut self, class: ClassId, tag: u8, string: Option<String>) -> HeapRef {
        self.next_ref += 0x10;
        let obj = HeapRef(0x1000 + self.next_ref);
        self.objects.insert(obj, MockObject { class, tag, string });
        obj
    }
}

/// A scriptable runtime: classes, objects and thread stacks are set up by the
/// test, and every instrumentation or invocation request is recorded.
#[derive(Default)]
pub struct MockRuntime {
    state: Mutex<State>,
}

impl MockRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bundle this mock as every collaborator of a [`Runtime`].
    pub fn runtime(self: &Arc<Self>) -> Runtime {
        Runtime {
            heap: self.clone(),
            classes: self.clone(),
            interpreter: self.clone(),
            instrumentation: self.clone(),
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, State> {
        lock(&self.state, "mock runtime state")
    }

    pub fn add_class(&self, signature: &str) -> ClassId {
        self.state().class_named(signature)
    }

    pub fn set_superclass(&self, class: ClassId, superclass: ClassId) {
        if let Some(info) = self.state().classes.get_mut(&class) {
            info.superclass = Some(superclass);
        }
    }

    pub fn set_source_file(&self, class: ClassId, file: &str) {
        if let Some(info) = self.state().classes.get_mut(&class) {
            info.source_file = Some(file.to_string());
        }
    }

    /// Define a method; parameter and return signatures are derived from
    /// `signature`.
    pub fn add_method(
        &self,
        class: ClassId,
        name: &str,
        signature: &str,
        modifiers: u32,
        code_length: u64,
        lines: &[(u64, i32)],
    ) -> MethodId {
        let (parameter_signatures, return_signature) = split_method_signature(signature);
        let mut state = self.state();
        let id = state.mint_id();
        state.methods.insert(
            id,
            MethodInfo {
                id,
                owner: class,
                name: name.to_string(),
                signature: signature.to_string(),
                generic_signature: None,
                modifiers,
                code_length,
                line_table: lines
                    .iter()
                    .map(|&(pc, line)| LineEntry { pc, line })
                    .collect(),
                variables: Vec::new(),
                parameter_signatures,
                return_signature,
            },
        );
        id
    }

    pub fn add_variable(&self, method: MethodId, name: &str, signature: &str, slot: u32) {
        if let Some(info) = self.state().methods.get_mut(&method) {
            let length = info.code_length as u32;
            info.variables.push(LocalVariable {
                start_pc: 0,
                length,
                name: name.to_string(),
                signature: signature.to_string(),
                slot,
            });
        }
    }

    pub fn add_field(&self, class: ClassId, name: &str, signature: &str, modifiers: u32) -> FieldId {
        let mut state = self.state();
        let id = state.mint_id();
        state.fields.insert(
            id,
            FieldInfo {
                id,
                owner: class,
                name: name.to_string(),
                signature: signature.to_string(),
                generic_signature: None,
                modifiers,
            },
        );
        id
    }

    pub fn new_object(&self, class: ClassId) -> HeapRef {
        let tag = {
            let state = self.state();
            match state.classes.get(&class) {
                Some(info) if info.signature.starts_with('[') => TAG_ARRAY,
                _ => TAG_OBJECT,
            }
        };
        self.state().allocate(class, tag, None)
    }

    pub fn new_string(&self, value: &str) -> HeapRef {
        let mut state = self.state();
        let class = state.class_named("Ljava/lang/String;");
        state.allocate(class, TAG_STRING, Some(value.to_string()))
    }

    /// A `java.lang.Thread` peer object.
    pub fn new_thread_object(&self) -> HeapRef {
        let mut state = self.state();
        let class = state.class_named("Ljava/lang/Thread;");
        state.allocate(class, TAG_THREAD, None)
    }

    /// Drop `obj` from the heap; the next [`MockRuntime::gc`] reports it dead.
    pub fn free_object(&self, obj: HeapRef) {
        self.state().objects.remove(&obj);
    }

    /// A collector pass that reports every freed object as unreachable and
    /// moves objects according to `moves`.
    pub fn gc(&self, moves: &[(HeapRef, HeapRef)]) -> MockGc {
        let mut state = self.state();
        for &(from, to) in moves {
            if let Some(obj) = state.objects.remove(&from) {
                state.objects.insert(to, obj);
            }
        }
        MockGc {
            live: state.objects.keys().copied().collect(),
            moved: moves.iter().copied().collect(),
        }
    }

    pub fn collections(&self) -> usize {
        self.state().collections
    }

    pub fn set_frames(&self, thread: ThreadHandle, frames: Vec<Frame>) {
        self.state().frames.insert(thread, frames);
    }

    pub fn local(&self, thread: ThreadHandle, depth: usize, slot: u32) -> Option<Value> {
        self.state().locals.get(&(thread, depth, slot)).copied()
    }

    pub fn field_value(&self, receiver: Option<HeapRef>, field: FieldId) -> Option<Value> {
        self.state().field_values.get(&(receiver, field)).copied()
    }

    pub fn set_inlinable(&self, method: MethodId, inlinable: bool) {
        let mut state = self.state();
        if inlinable {
            state.inlinable.insert(method);
        } else {
            state.inlinable.remove(&method);
        }
    }

    pub fn set_requires_deoptimization(&self, required: bool) {
        self.state().interpret_only = !required;
    }

    pub fn set_invoke_result(&self, method: MethodId, outcome: InvokeOutcome) {
        self.state().invoke_results.insert(method, outcome);
    }

    pub fn invocations(&self) -> Vec<(ThreadHandle, InvocationCall)> {
        self.state().invocations.clone()
    }

    pub fn set_pending_exception(&self, thread: ThreadHandle, exception: Option<HeapRef>) {
        let mut state = self.state();
        match exception {
            Some(exception) => state.pending_exceptions.insert(thread, exception),
            None => state.pending_exceptions.remove(&thread),
        };
    }

    pub fn pending_exception(&self, thread: ThreadHandle) -> Option<HeapRef> {
        self.state().pending_exceptions.get(&thread).copied()
    }

    pub fn instrumentation_calls(&self) -> Vec<InstrumentationCall> {
        self.state().instrumentation_calls.clone()
    }

    fn record_call(&self, call: InstrumentationCall) {
        self.state().instrumentation_calls.push(call);
    }
}

/// Splits `(I[JLjava/lang/String;)V` into its parameter and return parts.
fn split_method_signature(signature: &str) -> (Vec<String>, String) {
    let Some(rest) = signature.strip_prefix('(') else {
        return (Vec::new(), signature.to_string());
    };
    let Some((params, ret)) = rest.split_once(')') else {
        return (Vec::new(), signature.to_string());
    };

    let bytes = params.as_bytes();
    let mut out = Vec::new();
    let mut start = 0;
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'[' => {
                i += 1;
                continue;
            }
            b'L' => {
                while i < bytes.len() && bytes[i] != b';' {
                    i += 1;
                }
            }
            _ => {}
        }
        i += 1;
        out.push(params[start..i.min(bytes.len())].to_string());
        start = i;
    }
    (out, ret.to_string())
}

fn default_value(signature: &str) -> Value {
    match signature.as_bytes().first() {
        Some(b'Z') => Value::Boolean(false),
        Some(b'B') => Value::Byte(0),
        Some(b'C') => Value::Char(0),
        Some(b'S') => Value::Short(0),
        Some(b'I') => Value::Int(0),
        Some(b'J') => Value::Long(0),
        Some(b'F') => Value::Float(0.0),
        Some(b'D') => Value::Double(0.0),
        Some(b'V') => Value::Void,
        _ => Value::Object(None),
    }
}

/// Reachability snapshot handed to the agent's sweep.
#[derive(Debug, Clone, Default)]
pub struct MockGc {
    live: HashSet<HeapRef>,
    moved: HashMap<HeapRef, HeapRef>,
}

impl GcVisitor for MockGc {
    fn is_reachable(&self, obj: HeapRef) -> bool {
        self.live.contains(&obj) || self.moved.contains_key(&obj)
    }

    fn relocate(&self, obj: HeapRef) -> HeapRef {
        self.moved.get(&obj).copied().unwrap_or(obj)
    }
}

impl Heap for MockRuntime {
    fn class_of(&self, obj: HeapRef) -> Option<ClassId> {
        self.state().objects.get(&obj).map(|o| o.class)
    }

    fn tag_of(&self, obj: HeapRef) -> u8 {
        self.state()
            .objects
            .get(&obj)
            .map(|o| o.tag)
            .unwrap_or(TAG_OBJECT)
    }

    fn get_field(&self, receiver: Option<HeapRef>, field: &FieldInfo) -> Value {
        self.state()
            .field_values
            .get(&(receiver, field.id))
            .copied()
            .unwrap_or_else(|| default_value(&field.signature))
    }

    fn set_field(&self, receiver: Option<HeapRef>, field: &FieldInfo, value: Value) {
        self.state().field_values.insert((receiver, field.id), value);
    }

    fn string_value(&self, obj: HeapRef) -> Option<String> {
        self.state().objects.get(&obj).and_then(|o| o.string.clone())
    }

    fn instances_of(&self, class: ClassId, max: usize) -> Vec<HeapRef> {
        let state = self.state();
        let matching = state
            .objects
            .iter()
            .filter(|(_, obj)| obj.class == class)
            .map(|(r, _)| *r);
        if max == 0 {
            matching.collect()
        } else {
            matching.take(max).collect()
        }
    }

    fn collect_now(&self) {
        self.state().collections += 1;
    }
}

impl ClassModel for MockRuntime {
    fn all_classes(&self) -> Vec<ClassInfo> {
        self.state().classes.values().cloned().collect()
    }

    fn class(&self, id: ClassId) -> Option<ClassInfo> {
        self.state().classes.get(&id).cloned()
    }

    fn methods(&self, class: ClassId) -> Vec<MethodInfo> {
        self.state()
            .methods
            .values()
            .filter(|m| m.owner == class)
            .cloned()
            .collect()
    }

    fn method(&self, id: MethodId) -> Option<MethodInfo> {
        self.state().methods.get(&id).cloned()
    }

    fn fields(&self, class: ClassId) -> Vec<FieldInfo> {
        self.state()
            .fields
            .values()
            .filter(|f| f.owner == class)
            .cloned()
            .collect()
    }

    fn field(&self, id: FieldId) -> Option<FieldInfo> {
        self.state().fields.get(&id).cloned()
    }

    fn may_be_inlined(&self, method: MethodId) -> bool {
        self.state().inlinable.contains(&method)
    }

    fn is_assignable(&self, from: ClassId, to: ClassId) -> bool {
        let state = self.state();
        let mut current = Some(from);
        while let Some(class) = current {
            if class == to {
                return true;
            }
            current = state.classes.get(&class).and_then(|c| c.superclass);
        }
        false
    }
}

impl Interpreter for MockRuntime {
    fn frames(&self, thread: ThreadHandle) -> Vec<Frame> {
        self.state().frames.get(&thread).cloned().unwrap_or_default()
    }

    fn get_local(&self, thread: ThreadHandle, depth: usize, slot: u32, tag: u8) -> Option<Value> {
        let state = self.state();
        let frames = state.frames.get(&thread)?;
        let frame = frames.get(depth)?;
        let method = state.methods.get(&frame.method)?;
        if slot >= method.variables.iter().map(|v| v.slot + 1).max().unwrap_or(0) {
            return None;
        }
        Some(
            state
                .locals
                .get(&(thread, depth, slot))
                .copied()
                .unwrap_or_else(|| default_value(&(tag as char).to_string())),
        )
    }

    fn set_local(&self, thread: ThreadHandle, depth: usize, slot: u32, value: Value) -> bool {
        let mut state = self.state();
        let known = state
            .frames
            .get(&thread)
            .and_then(|frames| frames.get(depth))
            .and_then(|frame| state.methods.get(&frame.method))
            .is_some_and(|m| m.variables.iter().any(|v| v.slot == slot));
        if known {
            state.locals.insert((thread, depth, slot), value);
        }
        known
    }

    fn invoke(&self, thread: ThreadHandle, call: &InvocationCall) -> InvokeOutcome {
        let mut state = self.state();
        state.invocations.push((thread, call.clone()));
        if let Some(outcome) = state.invoke_results.get(&call.method) {
            return outcome.clone();
        }
        let value = state
            .methods
            .get(&call.method)
            .map(|m| default_value(&m.return_signature))
            .unwrap_or(Value::Void);
        InvokeOutcome {
            value,
            exception: None,
        }
    }

    fn take_pending_exception(&self, thread: ThreadHandle) -> Option<HeapRef> {
        self.state().pending_exceptions.remove(&thread)
    }

    fn set_pending_exception(&self, thread: ThreadHandle, exception: Option<HeapRef>) {
        MockRuntime::set_pending_exception(self, thread, exception);
    }
}

impl Instrumentation for MockRuntime {
    fn add_listener(&self, events: InstrumentationEvents) {
        self.record_call(InstrumentationCall::AddListener(events));
    }

    fn remove_listener(&self, events: InstrumentationEvents) {
        self.record_call(InstrumentationCall::RemoveListener(events));
    }

    fn deoptimize_everything(&self) {
        self.record_call(InstrumentationCall::DeoptimizeEverything);
    }

    fn undeoptimize_everything(&self) {
        self.record_call(InstrumentationCall::UndeoptimizeEverything);
    }

    fn deoptimize(&self, method: MethodId) {
        self.record_call(InstrumentationCall::Deoptimize(method));
    }

    fn undeoptimize(&self, method: MethodId) {
        self.record_call(InstrumentationCall::Undeoptimize(method));
    }

    fn requires_deoptimization(&self) -> bool {
        !self.state().interpret_only
    }
}
