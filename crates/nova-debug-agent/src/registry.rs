use std::collections::HashMap;

use nova_jdwp::{is_reference_tag, JdwpValue, ObjectId, TAG_OBJECT};

use crate::error::{AgentError, AgentResult};
use crate::runtime::{GcVisitor, Heap, HeapRef, Value};

/// Reserved id that never names an object. Lookups of it always fail, which
/// lets callers use it as an explicit "bad handle" marker.
pub const INVALID_OBJECT_ID: ObjectId = 1;

const FIRST_OBJECT_ID: ObjectId = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EntryState {
    Live(HeapRef),
    Collected,
}

#[derive(Debug, Clone)]
struct Entry {
    state: EntryState,
    /// Number of times the id was handed to the debugger and not yet disposed.
    refcount: u32,
    /// Collection disabled: the referent is a GC root.
    strong: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lookup {
    Live(HeapRef),
    Null,
    Invalid,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepStats {
    pub collected: usize,
    pub relocated: usize,
}

/// Mapping between debugger-visible object ids and heap references.
///
/// Entries are weak unless pinned with [`disable_collection`]; a weak entry
/// whose referent dies is kept as a tombstone so [`is_collected`] can tell
/// "collected" apart from "never issued". Ids are minted monotonically and are
/// never reused within a registry.
///
/// [`disable_collection`]: ObjectRegistry::disable_collection
/// [`is_collected`]: ObjectRegistry::is_collected
pub struct ObjectRegistry {
    next_id: ObjectId,
    entries: HashMap<ObjectId, Entry>,
    by_ref: HashMap<HeapRef, ObjectId>,
}

impl Default for ObjectRegistry {
    fn default() -> Self {
        Self {
            next_id: FIRST_OBJECT_ID,
            entries: HashMap::new(),
            by_ref: HashMap::new(),
        }
    }
}

impl ObjectRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.by_ref.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_ref.is_empty()
    }

    pub fn contains_ref(&self, obj: HeapRef) -> bool {
        self.by_ref.contains_key(&obj)
    }

    /// Id for `obj`, minting one if needed. Every call counts as one reference
    /// handed to the debugger.
    pub fn add(&mut self, obj: Option<HeapRef>) -> ObjectId {
        let Some(obj) = obj else {
            return 0;
        };

        if let Some(id) = self.by_ref.get(&obj).copied() {
            if let Some(entry) = self.entries.get_mut(&id) {
                entry.refcount = entry.refcount.saturating_add(1);
                return id;
            }
        }

        let id = self.next_id;
        self.next_id += 1;
        self.entries.insert(
            id,
            Entry {
                state: EntryState::Live(obj),
                refcount: 1,
                strong: false,
            },
        );
        self.by_ref.insert(obj, id);
        id
    }

    /// Id already issued for `obj`, without counting a new reference.
    pub fn id_of(&self, obj: HeapRef) -> Option<ObjectId> {
        self.by_ref.get(&obj).copied()
    }

    pub fn get(&self, id: ObjectId) -> Lookup {
        if id == 0 {
            return Lookup::Null;
        }
        match self.entries.get(&id).map(|entry| entry.state) {
            Some(EntryState::Live(obj)) => Lookup::Live(obj),
            _ => Lookup::Invalid,
        }
    }

    /// Resolve an id that must name a live object; `null` is rejected too.
    pub fn resolve(&self, id: ObjectId) -> AgentResult<HeapRef> {
        match self.get(id) {
            Lookup::Live(obj) => Ok(obj),
            Lookup::Null | Lookup::Invalid => Err(AgentError::InvalidObject(id)),
        }
    }

    /// Resolve an id where `0` stands for `null`.
    pub fn resolve_nullable(&self, id: ObjectId) -> AgentResult<Option<HeapRef>> {
        match self.get(id) {
            Lookup::Live(obj) => Ok(Some(obj)),
            Lookup::Null => Ok(None),
            Lookup::Invalid => Err(AgentError::InvalidObject(id)),
        }
    }

    /// Give back `count` references. The entry goes away once none remain.
    /// Unknown ids are ignored, matching `VirtualMachine.DisposeObjects`.
    pub fn dispose(&mut self, id: ObjectId, count: u32) {
        let Some(entry) = self.entries.get_mut(&id) else {
            return;
        };
        entry.refcount = entry.refcount.saturating_sub(count);
        if entry.refcount == 0 {
            self.remove(id);
        }
    }

    fn remove(&mut self, id: ObjectId) {
        if let Some(Entry {
            state: EntryState::Live(obj),
            ..
        }) = self.entries.remove(&id)
        {
            self.by_ref.remove(&obj);
        }
    }

    pub fn disable_collection(&mut self, id: ObjectId) -> AgentResult<()> {
        self.set_strong(id, true)
    }

    pub fn enable_collection(&mut self, id: ObjectId) -> AgentResult<()> {
        self.set_strong(id, false)
    }

    fn set_strong(&mut self, id: ObjectId, strong: bool) -> AgentResult<()> {
        match self.entries.get_mut(&id) {
            Some(entry) if matches!(entry.state, EntryState::Live(_)) => {
                entry.strong = strong;
                Ok(())
            }
            _ => Err(AgentError::InvalidObject(id)),
        }
    }

    pub fn is_collected(&self, id: ObjectId) -> AgentResult<bool> {
        match self.entries.get(&id) {
            Some(entry) => Ok(entry.state == EntryState::Collected),
            None => Err(AgentError::InvalidObject(id)),
        }
    }

    /// Called once per collection cycle while mutators are stopped.
    pub fn sweep(&mut self, gc: &dyn GcVisitor) -> SweepStats {
        let mut stats = SweepStats::default();
        let mut by_ref = HashMap::with_capacity(self.by_ref.len());

        for (id, entry) in self.entries.iter_mut() {
            let EntryState::Live(obj) = entry.state else {
                continue;
            };
            if !entry.strong && !gc.is_reachable(obj) {
                entry.state = EntryState::Collected;
                stats.collected += 1;
                continue;
            }
            let moved = gc.relocate(obj);
            if moved != obj {
                entry.state = EntryState::Live(moved);
                stats.relocated += 1;
            }
            by_ref.insert(moved, *id);
        }

        self.by_ref = by_ref;
        if stats.collected > 0 || stats.relocated > 0 {
            tracing::debug!(
                target = "nova.jdwp",
                collected = stats.collected,
                relocated = stats.relocated,
                "object registry swept"
            );
        }
        stats
    }

    /// Report pinned referents as GC roots.
    pub fn visit_roots(&self, mut visit: impl FnMut(HeapRef)) {
        for entry in self.entries.values() {
            if let (true, EntryState::Live(obj)) = (entry.strong, entry.state) {
                visit(obj);
            }
        }
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.by_ref.clear();
    }

    /// Decode a wire value, resolving object ids.
    pub fn runtime_value(&self, value: &JdwpValue) -> AgentResult<Value> {
        Ok(match *value {
            JdwpValue::Void => Value::Void,
            JdwpValue::Boolean(v) => Value::Boolean(v),
            JdwpValue::Byte(v) => Value::Byte(v),
            JdwpValue::Char(v) => Value::Char(v),
            JdwpValue::Short(v) => Value::Short(v),
            JdwpValue::Int(v) => Value::Int(v),
            JdwpValue::Long(v) => Value::Long(v),
            JdwpValue::Float(v) => Value::Float(v),
            JdwpValue::Double(v) => Value::Double(v),
            JdwpValue::Object { id, .. } => Value::Object(self.resolve_nullable(id)?),
        })
    }

    /// Encode a runtime value, minting ids for objects. `declared_tag` is the
    /// static type's tag, used to type a `null`.
    pub fn wire_value(&mut self, heap: &dyn Heap, value: Value, declared_tag: u8) -> JdwpValue {
        match value {
            Value::Void => JdwpValue::Void,
            Value::Boolean(v) => JdwpValue::Boolean(v),
            Value::Byte(v) => JdwpValue::Byte(v),
            Value::Char(v) => JdwpValue::Char(v),
            Value::Short(v) => JdwpValue::Short(v),
            Value::Int(v) => JdwpValue::Int(v),
            Value::Long(v) => JdwpValue::Long(v),
            Value::Float(v) => JdwpValue::Float(v),
            Value::Double(v) => JdwpValue::Double(v),
            Value::Object(None) => JdwpValue::Object {
                tag: if is_reference_tag(declared_tag) {
                    declared_tag
                } else {
                    TAG_OBJECT
                },
                id: 0,
            },
            Value::Object(Some(obj)) => JdwpValue::Object {
                tag: heap.tag_of(obj),
                id: self.add(Some(obj)),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::{HashMap, HashSet};

    use super::*;

    #[derive(Default)]
    struct Gc {
        dead: HashSet<HeapRef>,
        moved: HashMap<HeapRef, HeapRef>,
    }

    impl GcVisitor for Gc {
        fn is_reachable(&self, obj: HeapRef) -> bool {
            !self.dead.contains(&obj)
        }

        fn relocate(&self, obj: HeapRef) -> HeapRef {
            self.moved.get(&obj).copied().unwrap_or(obj)
        }
    }

    #[test]
    fn add_is_idempotent_and_skips_sentinels() {
        let mut registry = ObjectRegistry::new();
        assert_eq!(registry.add(None), 0);

        let a = registry.add(Some(HeapRef(0x10)));
        let b = registry.add(Some(HeapRef(0x20)));
        assert_eq!(a, 2);
        assert_eq!(b, 3);
        assert_eq!(registry.add(Some(HeapRef(0x10))), a);
        assert_eq!(registry.get(a), Lookup::Live(HeapRef(0x10)));
        assert_eq!(registry.get(0), Lookup::Null);
        assert_eq!(registry.get(INVALID_OBJECT_ID), Lookup::Invalid);
        assert_eq!(registry.get(999), Lookup::Invalid);
    }

    #[test]
    fn dispose_tallies_reference_counts() {
        let mut registry = ObjectRegistry::new();
        let id = registry.add(Some(HeapRef(1)));
        registry.add(Some(HeapRef(1)));
        registry.add(Some(HeapRef(1)));

        registry.dispose(id, 2);
        assert_eq!(registry.get(id), Lookup::Live(HeapRef(1)));
        registry.dispose(id, 1);
        assert_eq!(registry.get(id), Lookup::Invalid);
        assert!(registry.is_collected(id).is_err());

        // Disposed ids are never handed out again.
        let again = registry.add(Some(HeapRef(1)));
        assert_ne!(again, id);
    }

    #[test]
    fn sweep_tombstones_weak_and_relocates_live_entries() {
        let mut registry = ObjectRegistry::new();
        let weak = registry.add(Some(HeapRef(1)));
        let pinned = registry.add(Some(HeapRef(2)));
        let moving = registry.add(Some(HeapRef(3)));
        registry.disable_collection(pinned).unwrap();

        let mut gc = Gc::default();
        gc.dead.insert(HeapRef(1));
        gc.dead.insert(HeapRef(2));
        gc.moved.insert(HeapRef(3), HeapRef(30));

        let stats = registry.sweep(&gc);
        assert_eq!(stats, SweepStats { collected: 1, relocated: 1 });

        assert_eq!(registry.get(weak), Lookup::Invalid);
        assert!(registry.is_collected(weak).unwrap());
        assert_eq!(registry.get(pinned), Lookup::Live(HeapRef(2)));
        assert!(!registry.is_collected(pinned).unwrap());
        assert_eq!(registry.get(moving), Lookup::Live(HeapRef(30)));
        assert!(!registry.contains_ref(HeapRef(3)));
        assert_eq!(registry.add(Some(HeapRef(30))), moving);

        let mut roots = Vec::new();
        registry.visit_roots(|obj| roots.push(obj));
        assert_eq!(roots, vec![HeapRef(2)]);
    }

    #[test]
    fn collection_toggles_reject_unknown_ids() {
        let mut registry = ObjectRegistry::new();
        assert!(matches!(
            registry.disable_collection(42),
            Err(AgentError::InvalidObject(42))
        ));
        let id = registry.add(Some(HeapRef(7)));
        registry.disable_collection(id).unwrap();
        registry.disable_collection(id).unwrap();
        // Nesting is not counted: one enable unpins.
        registry.enable_collection(id).unwrap();
        let mut roots = 0;
        registry.visit_roots(|_| roots += 1);
        assert_eq!(roots, 0);
    }

    #[test]
    fn clear_forgets_everything() {
        let mut registry = ObjectRegistry::new();
        let id = registry.add(Some(HeapRef(5)));
        registry.clear();
        assert!(registry.is_empty());
        assert_eq!(registry.get(id), Lookup::Invalid);
        assert_ne!(registry.add(Some(HeapRef(5))), id);
    }
}
