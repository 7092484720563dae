//! Interfaces the embedding runtime implements for the agent.
//!
//! The agent never walks the heap, interprets bytecode or rewrites compiled
//! frames itself. It only asks these collaborators, which are shared as
//! `Arc<dyn ...>` in a cloneable [`Runtime`] bundle.

use std::fmt;
use std::ops::{BitOr, BitOrAssign};
use std::sync::Arc;

use nova_jdwp::{
    FieldId, MethodId, ReferenceTypeId, ACC_ABSTRACT, ACC_NATIVE, ACC_STATIC, TAG_BOOLEAN,
    TAG_BYTE, TAG_CHAR, TAG_DOUBLE, TAG_FLOAT, TAG_INT, TAG_LONG, TAG_OBJECT, TAG_SHORT, TAG_VOID,
};

pub type ClassId = ReferenceTypeId;

/// A heap reference as the runtime sees it. Not stable: a moving collector may
/// hand out a different value for the same object after relocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HeapRef(pub u64);

/// Runtime-stable identity of an application thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ThreadHandle(pub u64);

impl fmt::Display for ThreadHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "thread#{}", self.0)
    }
}

/// A value in the runtime's own representation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Value {
    Void,
    Boolean(bool),
    Byte(i8),
    Char(u16),
    Short(i16),
    Int(i32),
    Long(i64),
    Float(f32),
    Double(f64),
    Object(Option<HeapRef>),
}

impl Value {
    /// Tag of a primitive value; references report `L` and get their precise
    /// tag from [`Heap::tag_of`].
    pub fn primitive_tag(&self) -> u8 {
        match self {
            Value::Void => TAG_VOID,
            Value::Boolean(_) => TAG_BOOLEAN,
            Value::Byte(_) => TAG_BYTE,
            Value::Char(_) => TAG_CHAR,
            Value::Short(_) => TAG_SHORT,
            Value::Int(_) => TAG_INT,
            Value::Long(_) => TAG_LONG,
            Value::Float(_) => TAG_FLOAT,
            Value::Double(_) => TAG_DOUBLE,
            Value::Object(_) => TAG_OBJECT,
        }
    }
}

/// Per-cycle callbacks from the collector.
pub trait GcVisitor {
    fn is_reachable(&self, obj: HeapRef) -> bool;
    /// New location of `obj`; identity when it did not move.
    fn relocate(&self, obj: HeapRef) -> HeapRef;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassInfo {
    pub id: ClassId,
    /// JNI-style signature, e.g. `Ljava/lang/String;`.
    pub signature: String,
    pub generic_signature: Option<String>,
    pub type_tag: u8,
    pub status: u32,
    pub modifiers: u32,
    pub source_file: Option<String>,
    pub superclass: Option<ClassId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LineEntry {
    pub pc: u64,
    pub line: i32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalVariable {
    pub start_pc: u64,
    pub length: u32,
    pub name: String,
    pub signature: String,
    pub slot: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodInfo {
    pub id: MethodId,
    pub owner: ClassId,
    pub name: String,
    pub signature: String,
    pub generic_signature: Option<String>,
    pub modifiers: u32,
    /// Number of code units; valid pcs are `0..code_length`.
    pub code_length: u64,
    /// Sorted by `pc`.
    pub line_table: Vec<LineEntry>,
    pub variables: Vec<LocalVariable>,
    pub parameter_signatures: Vec<String>,
    pub return_signature: String,
}

impl MethodInfo {
    pub fn is_static(&self) -> bool {
        self.modifiers & ACC_STATIC != 0
    }

    pub fn is_native(&self) -> bool {
        self.modifiers & ACC_NATIVE != 0
    }

    pub fn is_abstract(&self) -> bool {
        self.modifiers & ACC_ABSTRACT != 0
    }

    /// Source line for `pc`, from the last line-table entry at or before it.
    pub fn line_for_pc(&self, pc: u64) -> Option<i32> {
        self.line_table
            .iter()
            .take_while(|entry| entry.pc <= pc)
            .last()
            .map(|entry| entry.line)
    }

    /// Argument slots as JDWP counts them: wide primitives take two, `this`
    /// takes one for instance methods.
    pub fn argument_slots(&self) -> u32 {
        let args: u32 = self
            .parameter_signatures
            .iter()
            .map(|sig| if sig == "J" || sig == "D" { 2 } else { 1 })
            .sum();
        if self.is_static() {
            args
        } else {
            args + 1
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldInfo {
    pub id: FieldId,
    pub owner: ClassId,
    pub name: String,
    pub signature: String,
    pub generic_signature: Option<String>,
    pub modifiers: u32,
}

impl FieldInfo {
    pub fn is_static(&self) -> bool {
        self.modifiers & ACC_STATIC != 0
    }
}

pub trait Heap: Send + Sync {
    fn class_of(&self, obj: HeapRef) -> Option<ClassId>;
    /// JDWP tag for a reference (`L`, `s`, `[`, `t`, `g`, `l` or `c`).
    fn tag_of(&self, obj: HeapRef) -> u8;
    /// Read an instance field, or a static one when `receiver` is `None`.
    fn get_field(&self, receiver: Option<HeapRef>, field: &FieldInfo) -> Value;
    fn set_field(&self, receiver: Option<HeapRef>, field: &FieldInfo, value: Value);
    fn string_value(&self, obj: HeapRef) -> Option<String>;
    /// Live instances of exactly `class`; `max == 0` means no limit.
    fn instances_of(&self, class: ClassId, max: usize) -> Vec<HeapRef>;
    /// Run a full collection synchronously so reachability queries are current.
    fn collect_now(&self);
}

pub trait ClassModel: Send + Sync {
    fn all_classes(&self) -> Vec<ClassInfo>;
    fn class(&self, id: ClassId) -> Option<ClassInfo>;
    fn class_by_signature(&self, signature: &str) -> Option<ClassId> {
        self.all_classes()
            .into_iter()
            .find(|class| class.signature == signature)
            .map(|class| class.id)
    }
    fn methods(&self, class: ClassId) -> Vec<MethodInfo>;
    fn method(&self, id: MethodId) -> Option<MethodInfo>;
    fn fields(&self, class: ClassId) -> Vec<FieldInfo>;
    fn field(&self, id: FieldId) -> Option<FieldInfo>;
    /// Whether compiled code elsewhere may contain an inlined copy of `method`.
    fn may_be_inlined(&self, method: MethodId) -> bool;
    /// `from` is `to` or a subtype of it.
    fn is_assignable(&self, from: ClassId, to: ClassId) -> bool;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Frame {
    pub method: MethodId,
    pub pc: u64,
    pub this: Option<HeapRef>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct InvocationCall {
    pub receiver: Option<HeapRef>,
    pub class: ClassId,
    pub method: MethodId,
    pub args: Vec<Value>,
    pub nonvirtual: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct InvokeOutcome {
    pub value: Value,
    pub exception: Option<HeapRef>,
}

pub trait Interpreter: Send + Sync {
    /// Frames of `thread`, innermost first. Only meaningful while the thread is
    /// parked.
    fn frames(&self, thread: ThreadHandle) -> Vec<Frame>;
    fn get_local(&self, thread: ThreadHandle, depth: usize, slot: u32, tag: u8) -> Option<Value>;
    fn set_local(&self, thread: ThreadHandle, depth: usize, slot: u32, value: Value) -> bool;
    /// Executes on `thread` itself. A thrown exception is returned in the
    /// outcome and is not left pending.
    fn invoke(&self, thread: ThreadHandle, call: &InvocationCall) -> InvokeOutcome;
    fn take_pending_exception(&self, thread: ThreadHandle) -> Option<HeapRef>;
    fn set_pending_exception(&self, thread: ThreadHandle, exception: Option<HeapRef>);
}

/// Instrumentation hooks the runtime can enable, as a bit set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct InstrumentationEvents(u8);

impl InstrumentationEvents {
    pub const NONE: Self = Self(0);
    pub const METHOD_ENTERED: Self = Self(1 << 0);
    pub const METHOD_EXITED: Self = Self(1 << 1);
    pub const LOCATION_CHANGED: Self = Self(1 << 2);
    pub const FIELD_READ: Self = Self(1 << 3);
    pub const FIELD_WRITTEN: Self = Self(1 << 4);
    pub const EXCEPTION_THROWN: Self = Self(1 << 5);

    pub const ALL: [Self; 6] = [
        Self::METHOD_ENTERED,
        Self::METHOD_EXITED,
        Self::LOCATION_CHANGED,
        Self::FIELD_READ,
        Self::FIELD_WRITTEN,
        Self::EXCEPTION_THROWN,
    ];

    pub fn bits(self) -> u8 {
        self.0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn remove(&mut self, other: Self) {
        self.0 &= !other.0;
    }

    /// The single-bit members of this set.
    pub fn iter(self) -> impl Iterator<Item = Self> {
        Self::ALL.into_iter().filter(move |event| self.contains(*event))
    }

    pub(crate) fn index(self) -> Option<usize> {
        Self::ALL.iter().position(|event| *event == self)
    }
}

impl BitOr for InstrumentationEvents {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for InstrumentationEvents {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

pub trait Instrumentation: Send + Sync {
    fn add_listener(&self, events: InstrumentationEvents);
    fn remove_listener(&self, events: InstrumentationEvents);
    fn deoptimize_everything(&self);
    fn undeoptimize_everything(&self);
    fn deoptimize(&self, method: MethodId);
    fn undeoptimize(&self, method: MethodId);
    /// `false` when everything already runs interpreted.
    fn requires_deoptimization(&self) -> bool {
        true
    }
}

#[derive(Clone)]
pub struct Runtime {
    pub heap: Arc<dyn Heap>,
    pub classes: Arc<dyn ClassModel>,
    pub interpreter: Arc<dyn Interpreter>,
    pub instrumentation: Arc<dyn Instrumentation>,
}

impl fmt::Debug for Runtime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Runtime").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn method(modifiers: u32, params: &[&str]) -> MethodInfo {
        MethodInfo {
            id: 1,
            owner: 1,
            name: "m".into(),
            signature: "()V".into(),
            generic_signature: None,
            modifiers,
            code_length: 10,
            line_table: vec![LineEntry { pc: 0, line: 5 }, LineEntry { pc: 4, line: 6 }],
            variables: Vec::new(),
            parameter_signatures: params.iter().map(|s| s.to_string()).collect(),
            return_signature: "V".into(),
        }
    }

    #[test]
    fn argument_slots_count_wide_types_and_this() {
        assert_eq!(method(0, &["I", "J", "Ljava/lang/String;"]).argument_slots(), 5);
        assert_eq!(method(ACC_STATIC, &["D"]).argument_slots(), 2);
    }

    #[test]
    fn line_for_pc_uses_the_preceding_entry() {
        let m = method(0, &[]);
        assert_eq!(m.line_for_pc(0), Some(5));
        assert_eq!(m.line_for_pc(3), Some(5));
        assert_eq!(m.line_for_pc(9), Some(6));
    }

    #[test]
    fn instrumentation_events_iterate_single_bits() {
        let set = InstrumentationEvents::METHOD_ENTERED | InstrumentationEvents::FIELD_READ;
        let members: Vec<_> = set.iter().collect();
        assert_eq!(
            members,
            vec![
                InstrumentationEvents::METHOD_ENTERED,
                InstrumentationEvents::FIELD_READ
            ]
        );
        assert_eq!(InstrumentationEvents::FIELD_READ.index(), Some(3));
    }
}
