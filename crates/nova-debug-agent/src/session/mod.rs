//! One attached debugger: everything that exists only between attach and
//! detach.
//!
//! Lock order: `requests`, then `steps`, then `handles`. `deopt` is only taken
//! on its own, and never while waiting for threads to stop.

mod commands;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use nova_jdwp::{
    encode_command, signature_to_tag, JdwpIdSizes, JdwpValue, Location, ObjectId,
    COMMAND_EVENT_COMPOSITE, COMMAND_SET_EVENT, EVENT_KIND_BREAKPOINT, EVENT_KIND_CLASS_PREPARE,
    EVENT_KIND_EXCEPTION, EVENT_KIND_FIELD_ACCESS, EVENT_KIND_FIELD_MODIFICATION,
    EVENT_KIND_METHOD_EXIT_WITH_RETURN_VALUE,
    EVENT_KIND_SINGLE_STEP, EVENT_KIND_THREAD_DEATH, EVENT_KIND_THREAD_START, EVENT_KIND_VM_DEATH,
    SUSPEND_POLICY_ALL, SUSPEND_POLICY_EVENT_THREAD, SUSPEND_POLICY_NONE, TAG_OBJECT,
    TYPE_TAG_CLASS,
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::alloc::AllocationTracker;
use crate::breakpoints::BreakpointTable;
use crate::config::AgentConfig;
use crate::deopt::{DeoptimizationQueue, DeoptimizationRequest};
use crate::error::{AgentError, AgentResult};
use crate::events::{
    encode_composite, strongest_policy, CodeLocation, EventContext, EventPayload, EventRequest,
    EventRequestTable, Matched, RuntimeEvent,
};
use crate::poison::lock;
use crate::registry::{Lookup, ObjectRegistry};
use crate::runtime::{GcVisitor, HeapRef, Runtime, ThreadHandle, Value};
use crate::step::SingleStepControl;
use crate::suspend::{SuspendGate, SuspensionCoordinator};

/// Object ids and the thread ids among them.
#[derive(Default)]
struct Handles {
    registry: ObjectRegistry,
    threads: HashMap<ObjectId, ThreadHandle>,
}

#[derive(Default)]
struct DeoptState {
    breakpoints: BreakpointTable,
    queue: DeoptimizationQueue,
}

pub struct DebugSession {
    config: AgentConfig,
    sizes: JdwpIdSizes,
    runtime: Runtime,
    coordinator: Arc<SuspensionCoordinator>,
    allocations: Arc<Mutex<AllocationTracker>>,
    handles: Mutex<Handles>,
    deopt: Mutex<DeoptState>,
    requests: Mutex<EventRequestTable>,
    /// Active single steps, keyed by thread, with the owning request id.
    steps: Mutex<HashMap<ThreadHandle, (u32, SingleStepControl)>>,
    outbound: Mutex<Option<mpsc::UnboundedSender<Vec<u8>>>>,
    next_packet_id: AtomicU32,
    disposed: AtomicBool,
    detached: CancellationToken,
    /// Every debugger suspension this session adds goes through here.
    gate: SuspendGate,
}

impl std::fmt::Debug for DebugSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DebugSession")
            .field("sizes", &self.sizes)
            .field("detached", &self.detached.is_cancelled())
            .finish_non_exhaustive()
    }
}

impl DebugSession {
    pub fn new(
        config: AgentConfig,
        runtime: Runtime,
        coordinator: Arc<SuspensionCoordinator>,
        allocations: Arc<Mutex<AllocationTracker>>,
        outbound: mpsc::UnboundedSender<Vec<u8>>,
    ) -> Self {
        let sizes = JdwpIdSizes::uniform(config.id_size);
        Self {
            config,
            sizes,
            runtime,
            coordinator,
            allocations,
            handles: Mutex::new(Handles::default()),
            deopt: Mutex::new(DeoptState::default()),
            requests: Mutex::new(EventRequestTable::new()),
            steps: Mutex::new(HashMap::new()),
            outbound: Mutex::new(Some(outbound)),
            next_packet_id: AtomicU32::new(1),
            disposed: AtomicBool::new(false),
            detached: CancellationToken::new(),
            gate: SuspendGate::new(),
        }
    }

    pub fn sizes(&self) -> JdwpIdSizes {
        self.sizes
    }

    /// Cancelled once the session has detached.
    pub fn detached(&self) -> &CancellationToken {
        &self.detached
    }

    pub fn is_detached(&self) -> bool {
        self.detached.is_cancelled()
    }

    /// Apply an event's suspend policy on the posting thread. False once the
    /// session has detached, in which case nothing was suspended.
    pub fn suspend_for_event(&self, thread: ThreadHandle, policy: u8) -> bool {
        let coordinator = &self.coordinator;
        self.gate
            .admit(|| match policy {
                SUSPEND_POLICY_ALL => {
                    coordinator.suspend_all_except(thread);
                    coordinator.suspend_self_for_event(thread);
                }
                SUSPEND_POLICY_EVENT_THREAD => coordinator.suspend_self_for_event(thread),
                _ => {}
            })
            .is_some()
    }

    /// Debugger suspend-all, refused once detached.
    pub fn suspend_all(&self) -> AgentResult<()> {
        self.gate
            .admit(|| self.coordinator.request_suspend_all())
            .ok_or(AgentError::VmDead)?;
        self.coordinator.wait_for_suspend_all();
        Ok(())
    }

    /// Debugger suspend of one thread, refused once detached.
    pub fn suspend_thread(&self, thread: ThreadHandle) -> AgentResult<()> {
        self.gate
            .admit(|| self.coordinator.request_suspend_one(thread))
            .ok_or(AgentError::VmDead)??;
        self.coordinator.wait_for_suspend_one(thread)
    }

    /// `VirtualMachine.Dispose` was received; the transport ends the session
    /// after sending its reply.
    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    /// Queue an already framed packet for the writer.
    pub fn send_packet(&self, packet: Vec<u8>) -> bool {
        let outbound = lock(&self.outbound, "DebugSession.outbound");
        match outbound.as_ref() {
            Some(tx) => tx.send(packet).is_ok(),
            None => false,
        }
    }

    /// Frame a composite event body and queue it.
    pub fn send_event(&self, body: &[u8]) -> bool {
        let id = self.next_packet_id.fetch_add(1, Ordering::Relaxed);
        self.send_packet(encode_command(
            id,
            COMMAND_SET_EVENT,
            COMMAND_EVENT_COMPOSITE,
            body,
        ))
    }

    /// Drop the sender so the writer drains and stops.
    pub fn close_outbound(&self) {
        lock(&self.outbound, "DebugSession.outbound").take();
    }

    /// Wire id for a registered thread. Every call counts as one reference
    /// handed to the debugger.
    fn thread_id(&self, handles: &mut Handles, thread: ThreadHandle) -> ObjectId {
        let Some(control) = self.coordinator.thread(thread) else {
            return 0;
        };
        let id = handles.registry.add(Some(control.peer()));
        handles.threads.insert(id, thread);
        id
    }

    /// Resolve a thread id from the debugger.
    fn thread_handle(&self, id: ObjectId) -> AgentResult<ThreadHandle> {
        let mut handles = lock(&self.handles, "DebugSession.handles");
        let obj = match handles.registry.get(id) {
            Lookup::Live(obj) => obj,
            Lookup::Null => return Err(AgentError::InvalidThread(id)),
            Lookup::Invalid => return Err(AgentError::InvalidObject(id)),
        };
        if let Some(thread) = handles.threads.get(&id).copied() {
            return match self.coordinator.thread(thread) {
                Some(_) => Ok(thread),
                None => Err(AgentError::ThreadNotAlive),
            };
        }
        // The peer reached the debugger as a plain object value.
        let thread = self
            .coordinator
            .threads()
            .into_iter()
            .find(|control| control.peer() == obj)
            .map(|control| control.handle())
            .ok_or(AgentError::InvalidThread(id))?;
        handles.threads.insert(id, thread);
        Ok(thread)
    }

    fn location(&self, at: CodeLocation) -> Location {
        let classes = &self.runtime.classes;
        let Some(method) = classes.method(at.method) else {
            return Location::NONE;
        };
        let type_tag = classes
            .class(method.owner)
            .map(|class| class.type_tag)
            .unwrap_or(TYPE_TAG_CLASS);
        Location {
            type_tag,
            class_id: method.owner,
            method_id: at.method,
            index: at.pc,
        }
    }

    fn object_value(handles: &mut Handles, runtime: &Runtime, obj: Option<HeapRef>) -> JdwpValue {
        handles
            .registry
            .wire_value(&*runtime.heap, Value::Object(obj), TAG_OBJECT)
    }

    /// Drain pending instrumentation changes with every thread stopped. Must
    /// be called holding no session lock.
    fn apply_deoptimizations(&self) {
        if !lock(&self.deopt, "DebugSession.deopt").queue.has_pending() {
            return;
        }
        let guard = match self.coordinator.suspend_all_scoped() {
            Ok(guard) => guard,
            Err(err) => {
                tracing::warn!(
                    target = "nova.jdwp",
                    error = %err,
                    "could not stop every thread; deoptimization stays pending"
                );
                return;
            }
        };
        let mut deopt = lock(&self.deopt, "DebugSession.deopt");
        deopt
            .queue
            .drain_and_apply(&guard, &*self.runtime.instrumentation);
    }

    /// Give back what a cleared request held. Deoptimization is applied by the
    /// caller.
    fn release(&self, request: &EventRequest) -> AgentResult<()> {
        let footprint = request.footprint;
        if let Some(thread) = footprint.step_thread {
            let mut steps = lock(&self.steps, "DebugSession.steps");
            if steps.get(&thread).is_some_and(|(id, _)| *id == request.id) {
                steps.remove(&thread);
            }
        }

        let mut deopt = lock(&self.deopt, "DebugSession.deopt");
        let DeoptState { breakpoints, queue } = &mut *deopt;
        if let Some(at) = footprint.breakpoint {
            if let Some(undo) = breakpoints.unwatch(at.method, at.pc) {
                queue.enqueue(undo)?;
            }
        }
        if !footprint.events.is_empty() {
            queue.enqueue(DeoptimizationRequest::UnregisterForEvent(footprint.events))?;
        }
        if footprint.full_deoptimization {
            queue.enqueue(DeoptimizationRequest::FullUndeoptimization)?;
        }
        tracing::debug!(
            target = "nova.jdwp",
            request = request.id,
            kind = request.kind,
            "event request cleared"
        );
        Ok(())
    }

    /// End the session: forget every request and id and give every thread
    /// back. Idempotent.
    pub fn detach(&self) {
        if self.detached.is_cancelled() {
            return;
        }
        self.detached.cancel();
        // Nothing adds a debugger suspension past this point.
        self.gate.close();

        for control in self.coordinator.threads() {
            if control.abandon_invocation() {
                tracing::debug!(
                    target = "nova.jdwp",
                    thread = %control.handle(),
                    "dropped invocation pending at detach"
                );
            }
        }

        let cleared = lock(&self.requests, "DebugSession.requests").drain_all();
        let count = cleared.len();
        for request in &cleared {
            if let Err(err) = self.release(request) {
                tracing::warn!(target = "nova.jdwp", error = %err, "failed to release request at detach");
            }
        }
        lock(&self.steps, "DebugSession.steps").clear();

        // Threads go back first so the bounded stop below cannot hold them.
        self.coordinator.undo_debugger_suspensions();
        self.apply_deoptimizations();
        {
            let mut handles = lock(&self.handles, "DebugSession.handles");
            handles.registry.clear();
            handles.threads.clear();
        }
        self.close_outbound();
        tracing::info!(target = "nova.jdwp", requests = count, "debugger detached");
    }

    /// The thread is gone; drop its ids and step state.
    pub fn forget_thread(&self, thread: ThreadHandle) {
        lock(&self.steps, "DebugSession.steps").remove(&thread);
        lock(&self.handles, "DebugSession.handles")
            .threads
            .retain(|_, handle| *handle != thread);
    }

    pub fn sweep(&self, gc: &dyn GcVisitor) {
        lock(&self.handles, "DebugSession.handles").registry.sweep(gc);
    }

    pub fn visit_roots(&self, visit: &mut dyn FnMut(HeapRef)) {
        lock(&self.handles, "DebugSession.handles")
            .registry
            .visit_roots(visit);
    }

    /// `VM_START`, reported with request id 0.
    pub fn vm_start_event(&self, thread: Option<ThreadHandle>, suspend_policy: u8) -> Vec<u8> {
        let thread = {
            let mut handles = lock(&self.handles, "DebugSession.handles");
            thread.map_or(0, |thread| self.thread_id(&mut handles, thread))
        };
        encode_composite(
            suspend_policy,
            &[(0, EventPayload::VmStart { thread })],
            &self.sizes,
        )
    }

    /// `VM_DEATH` for every request asking for it, or one unsolicited event.
    pub fn vm_death_event(&self) -> Vec<u8> {
        let matched = lock(&self.requests, "DebugSession.requests").matching(
            EVENT_KIND_VM_DEATH,
            &EventContext::default(),
            &*self.runtime.classes,
            &|_| None,
        );
        if matched.is_empty() {
            return encode_composite(SUSPEND_POLICY_NONE, &[(0, EventPayload::VmDeath)], &self.sizes);
        }
        let events: Vec<_> = matched
            .iter()
            .map(|m| (m.request_id, EventPayload::VmDeath))
            .collect();
        encode_composite(strongest_policy(&matched), &events, &self.sizes)
    }

    fn context(&self, event: &RuntimeEvent) -> EventContext {
        let with_location = |thread: ThreadHandle, at: CodeLocation| {
            let location = self.location(at);
            EventContext {
                thread: Some(thread),
                location: Some(location),
                class: (location.class_id != 0).then_some(location.class_id),
                instance: self
                    .runtime
                    .interpreter
                    .frames(thread)
                    .first()
                    .and_then(|frame| frame.this),
                ..EventContext::default()
            }
        };
        match *event {
            RuntimeEvent::Location { thread, at }
            | RuntimeEvent::MethodEntry { thread, at }
            | RuntimeEvent::MethodExit { thread, at, .. } => with_location(thread, at),
            RuntimeEvent::ExceptionThrown {
                thread,
                at,
                exception,
                catch,
            } => EventContext {
                exception: Some((
                    self.runtime.heap.class_of(exception).unwrap_or_default(),
                    catch.is_some(),
                )),
                ..with_location(thread, at)
            },
            RuntimeEvent::FieldAccess {
                thread,
                at,
                field,
                object,
            }
            | RuntimeEvent::FieldModification {
                thread,
                at,
                field,
                object,
                ..
            } => EventContext {
                field: Some(field),
                instance: object,
                ..with_location(thread, at)
            },
            RuntimeEvent::ClassPrepared { thread, class } => EventContext {
                thread: Some(thread),
                class: Some(class),
                ..EventContext::default()
            },
            RuntimeEvent::ThreadStarted { thread } | RuntimeEvent::ThreadDied { thread } => {
                EventContext {
                    thread: Some(thread),
                    ..EventContext::default()
                }
            }
        }
    }

    /// Match `event` against the installed requests and build the composite
    /// event for it. Returns the suspend policy together with the encoded
    /// body, or `None` when nobody asked for it.
    pub fn dispatch(&self, event: &RuntimeEvent) -> Option<(u8, Vec<u8>)> {
        if self.is_detached() {
            return None;
        }
        let ctx = self.context(event);
        let thread = event.thread();
        let breakpoint_hit = match *event {
            RuntimeEvent::Location { at, .. } => lock(&self.deopt, "DebugSession.deopt")
                .breakpoints
                .is_breakpoint(at.method, at.pc),
            _ => false,
        };

        let mut requests = lock(&self.requests, "DebugSession.requests");
        let step_hit = requests.has_kind(EVENT_KIND_SINGLE_STEP) && self.step_fires(thread, event);
        let handles = lock(&self.handles, "DebugSession.handles");
        let registry = &handles.registry;
        let mut matched: Vec<Matched> = Vec::new();
        for &kind in event.request_kinds() {
            let hit = match kind {
                EVENT_KIND_SINGLE_STEP => step_hit,
                EVENT_KIND_BREAKPOINT => breakpoint_hit,
                _ => true,
            };
            if !hit {
                continue;
            }
            matched.extend(requests.matching(
                kind,
                &ctx,
                &*self.runtime.classes,
                &|obj| registry.id_of(obj),
            ));
        }
        drop(handles);
        drop(requests);
        if matched.is_empty() {
            return None;
        }

        let mut handles = lock(&self.handles, "DebugSession.handles");
        let thread_id = self.thread_id(&mut handles, thread);
        let location = ctx.location.unwrap_or(Location::NONE);
        let events: Vec<(u32, EventPayload)> = matched
            .iter()
            .map(|m| {
                (
                    m.request_id,
                    self.payload(&mut handles, m.kind, thread_id, location, event),
                )
            })
            .collect();
        drop(handles);

        let policy = strongest_policy(&matched);
        tracing::debug!(
            target = "nova.jdwp",
            thread = %thread,
            events = events.len(),
            policy,
            "reporting event"
        );
        Some((policy, encode_composite(policy, &events, &self.sizes)))
    }

    fn step_fires(&self, thread: ThreadHandle, event: &RuntimeEvent) -> bool {
        let RuntimeEvent::Location { at, .. } = *event else {
            return false;
        };
        let steps = lock(&self.steps, "DebugSession.steps");
        let Some((_, step)) = steps.get(&thread) else {
            return false;
        };
        let depth = self.runtime.interpreter.frames(thread).len();
        step.should_fire(depth, at.method, at.pc)
    }

    fn payload(
        &self,
        handles: &mut Handles,
        kind: u8,
        thread: ObjectId,
        location: Location,
        event: &RuntimeEvent,
    ) -> EventPayload {
        let runtime = &self.runtime;
        match (kind, event) {
            (EVENT_KIND_METHOD_EXIT_WITH_RETURN_VALUE, RuntimeEvent::MethodExit { at, return_value, .. }) => {
                let declared = runtime
                    .classes
                    .method(at.method)
                    .map(|m| signature_to_tag(&m.return_signature))
                    .unwrap_or(TAG_OBJECT);
                EventPayload::MethodExitWithReturnValue {
                    thread,
                    location,
                    value: handles
                        .registry
                        .wire_value(&*runtime.heap, *return_value, declared),
                }
            }
            (EVENT_KIND_EXCEPTION, RuntimeEvent::ExceptionThrown { exception, catch, .. }) => {
                EventPayload::Exception {
                    thread,
                    location,
                    exception: Self::object_value(handles, runtime, Some(*exception)),
                    catch_location: catch.map_or(Location::NONE, |at| self.location(at)),
                }
            }
            (EVENT_KIND_FIELD_ACCESS, RuntimeEvent::FieldAccess { field, object, .. }) => {
                let (type_tag, class) = self.field_owner(*field);
                EventPayload::FieldAccess {
                    thread,
                    location,
                    type_tag,
                    class,
                    field: *field,
                    object: Self::object_value(handles, runtime, *object),
                }
            }
            (
                EVENT_KIND_FIELD_MODIFICATION,
                RuntimeEvent::FieldModification {
                    field,
                    object,
                    value,
                    ..
                },
            ) => {
                let (type_tag, class) = self.field_owner(*field);
                let declared = runtime
                    .classes
                    .field(*field)
                    .map(|f| signature_to_tag(&f.signature))
                    .unwrap_or(TAG_OBJECT);
                EventPayload::FieldModification {
                    thread,
                    location,
                    type_tag,
                    class,
                    field: *field,
                    object: Self::object_value(handles, runtime, *object),
                    value: handles.registry.wire_value(&*runtime.heap, *value, declared),
                }
            }
            (EVENT_KIND_CLASS_PREPARE, RuntimeEvent::ClassPrepared { class, .. }) => {
                let info = runtime.classes.class(*class);
                EventPayload::ClassPrepare {
                    thread,
                    type_tag: info.as_ref().map_or(TYPE_TAG_CLASS, |c| c.type_tag),
                    class: *class,
                    signature: info.as_ref().map(|c| c.signature.clone()).unwrap_or_default(),
                    status: info.map_or(0, |c| c.status),
                }
            }
            (EVENT_KIND_THREAD_START | EVENT_KIND_THREAD_DEATH, _) => {
                EventPayload::ThreadLifecycle { kind, thread }
            }
            _ => EventPayload::Located {
                kind,
                thread,
                location,
            },
        }
    }

    fn field_owner(&self, field: nova_jdwp::FieldId) -> (u8, u64) {
        let classes = &self.runtime.classes;
        let Some(owner) = classes.field(field).map(|f| f.owner) else {
            return (TYPE_TAG_CLASS, 0);
        };
        let type_tag = classes
            .class(owner)
            .map_or(TYPE_TAG_CLASS, |class| class.type_tag);
        (type_tag, owner)
    }
}
