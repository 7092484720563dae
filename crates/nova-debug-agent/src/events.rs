//! Event requests, their filters, and composite event encoding.

use nova_jdwp::{
    signature_to_class_name, FieldId, JdwpIdSizes, JdwpReader, JdwpValue, JdwpWriter, Location,
    MethodId, ObjectId, EVENT_KIND_BREAKPOINT, EVENT_KIND_CLASS_PREPARE, EVENT_KIND_EXCEPTION,
    EVENT_KIND_FIELD_ACCESS, EVENT_KIND_FIELD_MODIFICATION, EVENT_KIND_METHOD_ENTRY,
    EVENT_KIND_METHOD_EXIT, EVENT_KIND_METHOD_EXIT_WITH_RETURN_VALUE, EVENT_KIND_SINGLE_STEP,
    EVENT_KIND_THREAD_DEATH, EVENT_KIND_THREAD_START, EVENT_KIND_VM_DEATH, EVENT_KIND_VM_START,
    EVENT_MODIFIER_KIND_CLASS_EXCLUDE, EVENT_MODIFIER_KIND_CLASS_MATCH,
    EVENT_MODIFIER_KIND_CLASS_ONLY, EVENT_MODIFIER_KIND_CONDITIONAL, EVENT_MODIFIER_KIND_COUNT,
    EVENT_MODIFIER_KIND_EXCEPTION_ONLY, EVENT_MODIFIER_KIND_FIELD_ONLY,
    EVENT_MODIFIER_KIND_INSTANCE_ONLY, EVENT_MODIFIER_KIND_LOCATION_ONLY,
    EVENT_MODIFIER_KIND_SOURCE_NAME_MATCH, EVENT_MODIFIER_KIND_STEP,
    EVENT_MODIFIER_KIND_THREAD_ONLY, SUSPEND_POLICY_ALL, SUSPEND_POLICY_EVENT_THREAD,
    SUSPEND_POLICY_NONE,
};

use crate::error::{AgentError, AgentResult};
use crate::runtime::{ClassId, ClassModel, HeapRef, InstrumentationEvents, ThreadHandle, Value};
use crate::step::{StepDepth, StepSize};

/// A bytecode position inside a method.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CodeLocation {
    pub method: MethodId,
    pub pc: u64,
}

/// What the runtime reports to the agent. Each variant corresponds to one
/// instrumentation listener (thread and class lifecycle need none).
#[derive(Debug, Clone, PartialEq)]
pub enum RuntimeEvent {
    Location {
        thread: ThreadHandle,
        at: CodeLocation,
    },
    MethodEntry {
        thread: ThreadHandle,
        at: CodeLocation,
    },
    MethodExit {
        thread: ThreadHandle,
        at: CodeLocation,
        return_value: Value,
    },
    ExceptionThrown {
        thread: ThreadHandle,
        at: CodeLocation,
        exception: HeapRef,
        /// Handler that will catch it; `None` when uncaught.
        catch: Option<CodeLocation>,
    },
    FieldAccess {
        thread: ThreadHandle,
        at: CodeLocation,
        field: FieldId,
        object: Option<HeapRef>,
    },
    FieldModification {
        thread: ThreadHandle,
        at: CodeLocation,
        field: FieldId,
        object: Option<HeapRef>,
        value: Value,
    },
    ClassPrepared {
        thread: ThreadHandle,
        class: ClassId,
    },
    ThreadStarted {
        thread: ThreadHandle,
    },
    ThreadDied {
        thread: ThreadHandle,
    },
}

impl RuntimeEvent {
    pub fn thread(&self) -> ThreadHandle {
        match *self {
            RuntimeEvent::Location { thread, .. }
            | RuntimeEvent::MethodEntry { thread, .. }
            | RuntimeEvent::MethodExit { thread, .. }
            | RuntimeEvent::ExceptionThrown { thread, .. }
            | RuntimeEvent::FieldAccess { thread, .. }
            | RuntimeEvent::FieldModification { thread, .. }
            | RuntimeEvent::ClassPrepared { thread, .. }
            | RuntimeEvent::ThreadStarted { thread }
            | RuntimeEvent::ThreadDied { thread } => thread,
        }
    }

    /// Request kinds this event can satisfy.
    pub fn request_kinds(&self) -> &'static [u8] {
        match self {
            RuntimeEvent::Location { .. } => &[EVENT_KIND_SINGLE_STEP, EVENT_KIND_BREAKPOINT],
            RuntimeEvent::MethodEntry { .. } => &[EVENT_KIND_METHOD_ENTRY],
            RuntimeEvent::MethodExit { .. } => {
                &[EVENT_KIND_METHOD_EXIT, EVENT_KIND_METHOD_EXIT_WITH_RETURN_VALUE]
            }
            RuntimeEvent::ExceptionThrown { .. } => &[EVENT_KIND_EXCEPTION],
            RuntimeEvent::FieldAccess { .. } => &[EVENT_KIND_FIELD_ACCESS],
            RuntimeEvent::FieldModification { .. } => &[EVENT_KIND_FIELD_MODIFICATION],
            RuntimeEvent::ClassPrepared { .. } => &[EVENT_KIND_CLASS_PREPARE],
            RuntimeEvent::ThreadStarted { .. } => &[EVENT_KIND_THREAD_START],
            RuntimeEvent::ThreadDied { .. } => &[EVENT_KIND_THREAD_DEATH],
        }
    }
}

/// Event kinds `EventRequest.Set` accepts.
pub fn is_supported_kind(kind: u8) -> bool {
    matches!(
        kind,
        EVENT_KIND_SINGLE_STEP
            | EVENT_KIND_BREAKPOINT
            | EVENT_KIND_EXCEPTION
            | EVENT_KIND_THREAD_START
            | EVENT_KIND_THREAD_DEATH
            | EVENT_KIND_CLASS_PREPARE
            | EVENT_KIND_FIELD_ACCESS
            | EVENT_KIND_FIELD_MODIFICATION
            | EVENT_KIND_METHOD_ENTRY
            | EVENT_KIND_METHOD_EXIT
            | EVENT_KIND_METHOD_EXIT_WITH_RETURN_VALUE
            | EVENT_KIND_VM_DEATH
    )
}

#[derive(Debug, Clone, PartialEq)]
pub enum Modifier {
    Count { remaining: u32 },
    ThreadOnly(ThreadHandle),
    ClassOnly(ClassId),
    ClassMatch(String),
    ClassExclude(String),
    LocationOnly(Location),
    ExceptionOnly {
        /// `None` matches every exception class.
        class: Option<ClassId>,
        caught: bool,
        uncaught: bool,
    },
    FieldOnly { class: ClassId, field: FieldId },
    Step {
        thread: ThreadHandle,
        size: StepSize,
        depth: StepDepth,
    },
    InstanceOnly(ObjectId),
    SourceNameMatch(String),
}

/// Decode the modifier list of an `EventRequest.Set` command.
pub fn decode_modifiers(
    reader: &mut JdwpReader<'_>,
    sizes: &JdwpIdSizes,
    resolve_thread: &mut dyn FnMut(ObjectId) -> AgentResult<ThreadHandle>,
) -> AgentResult<Vec<Modifier>> {
    let count = reader.read_i32()?;
    if count < 0 {
        return Err(AgentError::IllegalArgument(format!("modifier count {count}")));
    }
    let mut modifiers = Vec::new();
    for _ in 0..count {
        let kind = reader.read_u8()?;
        let modifier = match kind {
            EVENT_MODIFIER_KIND_COUNT => {
                let count = reader.read_i32()?;
                if count <= 0 {
                    return Err(AgentError::IllegalArgument(format!("count filter {count}")));
                }
                Modifier::Count {
                    remaining: count as u32,
                }
            }
            EVENT_MODIFIER_KIND_CONDITIONAL => {
                return Err(AgentError::NotImplemented(
                    "conditional event filters".to_owned(),
                ));
            }
            EVENT_MODIFIER_KIND_THREAD_ONLY => {
                Modifier::ThreadOnly(resolve_thread(reader.read_object_id(sizes)?)?)
            }
            EVENT_MODIFIER_KIND_CLASS_ONLY => {
                Modifier::ClassOnly(reader.read_reference_type_id(sizes)?)
            }
            EVENT_MODIFIER_KIND_CLASS_MATCH => Modifier::ClassMatch(reader.read_string()?),
            EVENT_MODIFIER_KIND_CLASS_EXCLUDE => Modifier::ClassExclude(reader.read_string()?),
            EVENT_MODIFIER_KIND_LOCATION_ONLY => Modifier::LocationOnly(reader.read_location(sizes)?),
            EVENT_MODIFIER_KIND_EXCEPTION_ONLY => {
                let class = reader.read_reference_type_id(sizes)?;
                Modifier::ExceptionOnly {
                    class: (class != 0).then_some(class),
                    caught: reader.read_bool()?,
                    uncaught: reader.read_bool()?,
                }
            }
            EVENT_MODIFIER_KIND_FIELD_ONLY => Modifier::FieldOnly {
                class: reader.read_reference_type_id(sizes)?,
                field: reader.read_id(sizes.field_id)?,
            },
            EVENT_MODIFIER_KIND_STEP => {
                let thread = resolve_thread(reader.read_object_id(sizes)?)?;
                let size = StepSize::from_jdwp(reader.read_u32()?)?;
                let depth = StepDepth::from_jdwp(reader.read_u32()?)?;
                Modifier::Step {
                    thread,
                    size,
                    depth,
                }
            }
            EVENT_MODIFIER_KIND_INSTANCE_ONLY => Modifier::InstanceOnly(reader.read_object_id(sizes)?),
            EVENT_MODIFIER_KIND_SOURCE_NAME_MATCH => {
                Modifier::SourceNameMatch(reader.read_string()?)
            }
            other => {
                return Err(AgentError::IllegalArgument(format!("modifier kind {other}")));
            }
        };
        modifiers.push(modifier);
    }
    Ok(modifiers)
}

/// The instrumentation a request holds while it is installed, released again
/// when it is cleared.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Footprint {
    pub events: InstrumentationEvents,
    pub full_deoptimization: bool,
    pub breakpoint: Option<CodeLocation>,
    pub step_thread: Option<ThreadHandle>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EventRequest {
    pub id: u32,
    pub kind: u8,
    pub suspend_policy: u8,
    pub modifiers: Vec<Modifier>,
    pub footprint: Footprint,
    /// A count filter ran out; the request stays until cleared but no longer
    /// matches.
    expired: bool,
}

impl EventRequest {
    pub fn is_expired(&self) -> bool {
        self.expired
    }

    pub fn step(&self) -> Option<(ThreadHandle, StepSize, StepDepth)> {
        self.modifiers.iter().find_map(|modifier| match *modifier {
            Modifier::Step {
                thread,
                size,
                depth,
            } => Some((thread, size, depth)),
            _ => None,
        })
    }

    pub fn location(&self) -> Option<Location> {
        self.modifiers.iter().find_map(|modifier| match *modifier {
            Modifier::LocationOnly(location) => Some(location),
            _ => None,
        })
    }
}

/// Facts about one occurrence that filters are checked against.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct EventContext {
    pub thread: Option<ThreadHandle>,
    pub location: Option<Location>,
    /// Class the filters by class apply to: the location's declaring class, or
    /// the prepared class.
    pub class: Option<ClassId>,
    pub exception: Option<(ClassId, bool)>,
    pub field: Option<FieldId>,
    pub instance: Option<HeapRef>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Matched {
    pub request_id: u32,
    pub kind: u8,
    pub suspend_policy: u8,
}

#[derive(Debug)]
pub struct EventRequestTable {
    next_id: u32,
    requests: Vec<EventRequest>,
}

impl Default for EventRequestTable {
    fn default() -> Self {
        Self {
            next_id: 1,
            requests: Vec::new(),
        }
    }
}

impl EventRequestTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.requests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }

    pub fn insert(
        &mut self,
        kind: u8,
        suspend_policy: u8,
        modifiers: Vec<Modifier>,
        footprint: Footprint,
    ) -> u32 {
        let id = self.next_id;
        self.next_id = self.next_id.wrapping_add(1).max(1);
        self.requests.push(EventRequest {
            id,
            kind,
            suspend_policy,
            modifiers,
            footprint,
            expired: false,
        });
        id
    }

    pub fn get(&self, id: u32) -> Option<&EventRequest> {
        self.requests.iter().find(|request| request.id == id)
    }

    pub fn has_kind(&self, kind: u8) -> bool {
        self.requests.iter().any(|request| request.kind == kind)
    }

    pub fn remove(&mut self, kind: u8, id: u32) -> Option<EventRequest> {
        let pos = self
            .requests
            .iter()
            .position(|request| request.kind == kind && request.id == id)?;
        Some(self.requests.remove(pos))
    }

    pub fn remove_kind(&mut self, kind: u8) -> Vec<EventRequest> {
        let (removed, kept) = std::mem::take(&mut self.requests)
            .into_iter()
            .partition(|request| request.kind == kind);
        self.requests = kept;
        removed
    }

    pub fn drain_all(&mut self) -> Vec<EventRequest> {
        std::mem::take(&mut self.requests)
    }

    /// Requests of `kind` whose filters accept `ctx`, in registration order.
    /// Count filters tick as a side effect.
    pub fn matching(
        &mut self,
        kind: u8,
        ctx: &EventContext,
        classes: &dyn ClassModel,
        instance_id: &dyn Fn(HeapRef) -> Option<ObjectId>,
    ) -> Vec<Matched> {
        let mut matched = Vec::new();
        for request in self.requests.iter_mut() {
            if request.kind != kind || request.expired {
                continue;
            }
            if accepts(request, ctx, classes, instance_id) {
                matched.push(Matched {
                    request_id: request.id,
                    kind,
                    suspend_policy: request.suspend_policy,
                });
            }
        }
        matched
    }
}

fn accepts(
    request: &mut EventRequest,
    ctx: &EventContext,
    classes: &dyn ClassModel,
    instance_id: &dyn Fn(HeapRef) -> Option<ObjectId>,
) -> bool {
    for modifier in request.modifiers.iter_mut() {
        let passes = match modifier {
            Modifier::Count { remaining } => {
                *remaining = remaining.saturating_sub(1);
                if *remaining > 0 {
                    return false;
                }
                request.expired = true;
                true
            }
            Modifier::ThreadOnly(thread) | Modifier::Step { thread, .. } => {
                ctx.thread == Some(*thread)
            }
            Modifier::ClassOnly(class) => ctx
                .class
                .is_some_and(|actual| classes.is_assignable(actual, *class)),
            Modifier::ClassMatch(pattern) => class_name(ctx, classes)
                .is_some_and(|name| matches_pattern(pattern, &name)),
            Modifier::ClassExclude(pattern) => !class_name(ctx, classes)
                .is_some_and(|name| matches_pattern(pattern, &name)),
            Modifier::LocationOnly(location) => ctx.location.is_some_and(|actual| {
                actual.method_id == location.method_id && actual.index == location.index
            }),
            Modifier::ExceptionOnly {
                class,
                caught,
                uncaught,
            } => ctx.exception.is_some_and(|(actual, was_caught)| {
                let class_ok = class.map_or(true, |class| classes.is_assignable(actual, class));
                class_ok && if was_caught { *caught } else { *uncaught }
            }),
            Modifier::FieldOnly { field, .. } => ctx.field == Some(*field),
            Modifier::InstanceOnly(id) => ctx
                .instance
                .and_then(instance_id)
                .is_some_and(|actual| actual == *id),
            Modifier::SourceNameMatch(pattern) => ctx
                .class
                .and_then(|class| classes.class(class))
                .and_then(|class| class.source_file)
                .is_some_and(|file| matches_pattern(pattern, &file)),
        };
        if !passes {
            return false;
        }
    }
    true
}

fn class_name(ctx: &EventContext, classes: &dyn ClassModel) -> Option<String> {
    let class = classes.class(ctx.class?)?;
    Some(signature_to_class_name(&class.signature))
}

/// Exact match, or a single leading or trailing `*` wildcard.
pub fn matches_pattern(pattern: &str, name: &str) -> bool {
    if let Some(suffix) = pattern.strip_prefix('*') {
        name.ends_with(suffix)
    } else if let Some(prefix) = pattern.strip_suffix('*') {
        name.starts_with(prefix)
    } else {
        pattern == name
    }
}

/// The policy of a composite event: the strongest of its members.
pub fn strongest_policy(matched: &[Matched]) -> u8 {
    matched
        .iter()
        .map(|m| m.suspend_policy)
        .max_by_key(|policy| match *policy {
            SUSPEND_POLICY_ALL => 2,
            SUSPEND_POLICY_EVENT_THREAD => 1,
            _ => 0,
        })
        .unwrap_or(SUSPEND_POLICY_NONE)
}

/// One member of a composite event, with every id already on the wire side.
#[derive(Debug, Clone, PartialEq)]
pub enum EventPayload {
    VmStart {
        thread: ObjectId,
    },
    VmDeath,
    /// Single step, breakpoint, method entry and plain method exit.
    Located {
        kind: u8,
        thread: ObjectId,
        location: Location,
    },
    MethodExitWithReturnValue {
        thread: ObjectId,
        location: Location,
        value: JdwpValue,
    },
    Exception {
        thread: ObjectId,
        location: Location,
        exception: JdwpValue,
        catch_location: Location,
    },
    ThreadLifecycle {
        kind: u8,
        thread: ObjectId,
    },
    ClassPrepare {
        thread: ObjectId,
        type_tag: u8,
        class: ClassId,
        signature: String,
        status: u32,
    },
    FieldAccess {
        thread: ObjectId,
        location: Location,
        type_tag: u8,
        class: ClassId,
        field: FieldId,
        object: JdwpValue,
    },
    FieldModification {
        thread: ObjectId,
        location: Location,
        type_tag: u8,
        class: ClassId,
        field: FieldId,
        object: JdwpValue,
        value: JdwpValue,
    },
}

impl EventPayload {
    pub fn kind(&self) -> u8 {
        match self {
            EventPayload::VmStart { .. } => EVENT_KIND_VM_START,
            EventPayload::VmDeath => EVENT_KIND_VM_DEATH,
            EventPayload::Located { kind, .. } | EventPayload::ThreadLifecycle { kind, .. } => *kind,
            EventPayload::MethodExitWithReturnValue { .. } => EVENT_KIND_METHOD_EXIT_WITH_RETURN_VALUE,
            EventPayload::Exception { .. } => EVENT_KIND_EXCEPTION,
            EventPayload::ClassPrepare { .. } => EVENT_KIND_CLASS_PREPARE,
            EventPayload::FieldAccess { .. } => EVENT_KIND_FIELD_ACCESS,
            EventPayload::FieldModification { .. } => EVENT_KIND_FIELD_MODIFICATION,
        }
    }

    fn encode(&self, w: &mut JdwpWriter, sizes: &JdwpIdSizes) {
        match self {
            EventPayload::VmStart { thread } => w.write_object_id(*thread, sizes),
            EventPayload::VmDeath => {}
            EventPayload::Located {
                thread, location, ..
            } => {
                w.write_object_id(*thread, sizes);
                w.write_location(location, sizes);
            }
            EventPayload::MethodExitWithReturnValue {
                thread,
                location,
                value,
            } => {
                w.write_object_id(*thread, sizes);
                w.write_location(location, sizes);
                w.write_tagged_value(value, sizes);
            }
            EventPayload::Exception {
                thread,
                location,
                exception,
                catch_location,
            } => {
                w.write_object_id(*thread, sizes);
                w.write_location(location, sizes);
                w.write_tagged_value(exception, sizes);
                w.write_location(catch_location, sizes);
            }
            EventPayload::ThreadLifecycle { thread, .. } => w.write_object_id(*thread, sizes),
            EventPayload::ClassPrepare {
                thread,
                type_tag,
                class,
                signature,
                status,
            } => {
                w.write_object_id(*thread, sizes);
                w.write_u8(*type_tag);
                w.write_reference_type_id(*class, sizes);
                w.write_string(signature);
                w.write_u32(*status);
            }
            EventPayload::FieldAccess {
                thread,
                location,
                type_tag,
                class,
                field,
                object,
            } => {
                w.write_object_id(*thread, sizes);
                w.write_location(location, sizes);
                w.write_u8(*type_tag);
                w.write_reference_type_id(*class, sizes);
                w.write_id(*field, sizes.field_id);
                w.write_tagged_value(object, sizes);
            }
            EventPayload::FieldModification {
                thread,
                location,
                type_tag,
                class,
                field,
                object,
                value,
            } => {
                w.write_object_id(*thread, sizes);
                w.write_location(location, sizes);
                w.write_u8(*type_tag);
                w.write_reference_type_id(*class, sizes);
                w.write_id(*field, sizes.field_id);
                w.write_tagged_value(object, sizes);
                w.write_tagged_value(value, sizes);
            }
        }
    }
}

/// Body of an `Event.Composite` command.
pub fn encode_composite(
    suspend_policy: u8,
    events: &[(u32, EventPayload)],
    sizes: &JdwpIdSizes,
) -> Vec<u8> {
    let mut w = JdwpWriter::new();
    w.write_u8(suspend_policy);
    w.write_u32(events.len() as u32);
    for (request_id, payload) in events {
        w.write_u8(payload.kind());
        w.write_u32(*request_id);
        payload.encode(&mut w, sizes);
    }
    w.into_vec()
}
