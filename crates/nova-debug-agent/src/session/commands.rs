//! Command handlers. Each reads the command payload and writes the reply
//! payload; an error becomes the reply's error code and the session goes on.

use std::sync::atomic::Ordering;

use nova_jdwp::{
    is_primitive_tag, signature_to_tag, JdwpReader, JdwpValue, JdwpWriter, MethodId, ObjectId,
    ReferenceTypeId, EVENT_KIND_BREAKPOINT, EVENT_KIND_EXCEPTION, EVENT_KIND_FIELD_ACCESS,
    EVENT_KIND_FIELD_MODIFICATION, EVENT_KIND_METHOD_ENTRY, EVENT_KIND_METHOD_EXIT,
    EVENT_KIND_METHOD_EXIT_WITH_RETURN_VALUE, EVENT_KIND_SINGLE_STEP, SUSPEND_POLICY_ALL,
    SUSPEND_STATUS_SUSPENDED, TAG_VOID, THREAD_STATUS_RUNNING, THREAD_STATUS_ZOMBIE,
};

use super::{DebugSession, DeoptState};
use crate::deopt::DeoptimizationRequest;
use crate::error::{AgentError, AgentResult};
use crate::events::{decode_modifiers, is_supported_kind, CodeLocation, Footprint, Modifier};
use crate::invoke::{invoke_on_thread, prepare_invocation, InvocationRequest, InvokeOptions};
use crate::poison::lock;
use crate::registry::Lookup;
use crate::runtime::{
    ClassInfo, FieldInfo, Frame, HeapRef, InstrumentationEvents, MethodInfo, ThreadHandle, Value,
};
use crate::step::SingleStepControl;

const JDWP_MAJOR: i32 = 1;
const JDWP_MINOR: i32 = 6;

/// `VirtualMachine.CapabilitiesNew`, in protocol order. The first seven are
/// also the legacy `Capabilities` reply.
const CAPABILITIES: [bool; 32] = {
    let mut caps = [false; 32];
    caps[0] = true; // canWatchFieldModification
    caps[1] = true; // canWatchFieldAccess
    caps[11] = true; // canUseInstanceFilters
    caps[13] = true; // canRequestVMDeathEvent
    caps[15] = true; // canGetInstanceInfo
    caps[18] = true; // canUseSourceNameFilters
    caps
};

const CHUNK_REAE: u32 = u32::from_be_bytes(*b"REAE");
const CHUNK_REAQ: u32 = u32::from_be_bytes(*b"REAQ");
const CHUNK_REAL: u32 = u32::from_be_bytes(*b"REAL");

impl DebugSession {
    /// Run one debugger command. Blocks while waiting for threads to stop or
    /// for an invocation, so it must not run on an async worker.
    pub fn handle_command(
        &self,
        command_set: u8,
        command: u8,
        payload: &[u8],
    ) -> AgentResult<Vec<u8>> {
        let mut reader = JdwpReader::new(payload);
        let mut writer = JdwpWriter::new();
        let (r, w) = (&mut reader, &mut writer);
        match (command_set, command) {
            // VirtualMachine.Version
            (1, 1) => self.vm_version(w),
            // VirtualMachine.ClassesBySignature
            (1, 2) => self.classes_by_signature(r, w),
            // VirtualMachine.AllClasses
            (1, 3) => self.all_classes(w, false),
            // VirtualMachine.AllThreads
            (1, 4) => self.all_threads(w),
            // VirtualMachine.Dispose
            (1, 6) => {
                self.disposed.store(true, Ordering::Release);
                tracing::info!(target = "nova.jdwp", "debugger disposed the session");
                Ok(())
            }
            // VirtualMachine.IDSizes
            (1, 7) => {
                for size in [
                    self.sizes.field_id,
                    self.sizes.method_id,
                    self.sizes.object_id,
                    self.sizes.reference_type_id,
                    self.sizes.frame_id,
                ] {
                    w.write_i32(size as i32);
                }
                Ok(())
            }
            // VirtualMachine.Suspend
            (1, 8) => self.suspend_all(),
            // VirtualMachine.Resume
            (1, 9) => {
                self.coordinator.resume_all();
                Ok(())
            }
            // VirtualMachine.Capabilities
            (1, 12) => {
                for cap in &CAPABILITIES[..7] {
                    w.write_bool(*cap);
                }
                Ok(())
            }
            // VirtualMachine.DisposeObjects
            (1, 14) => self.dispose_objects(r),
            // VirtualMachine.CapabilitiesNew
            (1, 17) => {
                for cap in &CAPABILITIES {
                    w.write_bool(*cap);
                }
                Ok(())
            }
            // VirtualMachine.AllClassesWithGeneric
            (1, 20) => self.all_classes(w, true),
            // VirtualMachine.InstanceCounts
            (1, 21) => self.instance_counts(r, w),

            // ReferenceType.Signature
            (2, 1) => {
                let class = self.read_class(r)?;
                w.write_string(&class.signature);
                Ok(())
            }
            // ReferenceType.Fields
            (2, 4) => self.fields(r, w, false),
            // ReferenceType.Methods
            (2, 5) => self.methods(r, w, false),
            // ReferenceType.GetValues
            (2, 6) => self.static_get_values(r, w),
            // ReferenceType.SourceFile
            (2, 7) => {
                let class = self.read_class(r)?;
                let file = class.source_file.ok_or(AgentError::AbsentInformation)?;
                w.write_string(&file);
                Ok(())
            }
            // ReferenceType.Status
            (2, 9) => {
                let class = self.read_class(r)?;
                w.write_u32(class.status);
                Ok(())
            }
            // ReferenceType.FieldsWithGeneric
            (2, 14) => self.fields(r, w, true),
            // ReferenceType.MethodsWithGeneric
            (2, 15) => self.methods(r, w, true),
            // ReferenceType.Instances
            (2, 16) => self.instances(r, w),

            // ClassType.Superclass
            (3, 1) => {
                let class = self.read_class(r)?;
                w.write_reference_type_id(class.superclass.unwrap_or(0), &self.sizes);
                Ok(())
            }
            // ClassType.SetValues
            (3, 2) => self.static_set_values(r),
            // ClassType.InvokeMethod
            (3, 3) => {
                let class = self.read_class(r)?.id;
                let thread = r.read_object_id(&self.sizes)?;
                self.invoke(r, w, None, thread, class)
            }

            // Method.LineTable
            (6, 1) => self.line_table(r, w),
            // Method.VariableTable
            (6, 2) => self.variable_table(r, w),

            // ObjectReference.ReferenceType
            (9, 1) => {
                let (id, obj) = self.read_object(r)?;
                let class = self.runtime.heap.class_of(obj).ok_or(AgentError::InvalidObject(id))?;
                let class = self.class_info(class)?;
                w.write_u8(class.type_tag);
                w.write_reference_type_id(class.id, &self.sizes);
                Ok(())
            }
            // ObjectReference.GetValues
            (9, 2) => self.object_get_values(r, w),
            // ObjectReference.SetValues
            (9, 3) => self.object_set_values(r),
            // ObjectReference.InvokeMethod
            (9, 6) => {
                let receiver = r.read_object_id(&self.sizes)?;
                let thread = r.read_object_id(&self.sizes)?;
                let class = self.read_class(r)?.id;
                self.invoke(r, w, Some(receiver), thread, class)
            }
            // ObjectReference.DisableCollection
            (9, 7) => {
                let id = r.read_object_id(&self.sizes)?;
                lock(&self.handles, "DebugSession.handles")
                    .registry
                    .disable_collection(id)
            }
            // ObjectReference.EnableCollection
            (9, 8) => {
                let id = r.read_object_id(&self.sizes)?;
                lock(&self.handles, "DebugSession.handles")
                    .registry
                    .enable_collection(id)
            }
            // ObjectReference.IsCollected
            (9, 9) => {
                let id = r.read_object_id(&self.sizes)?;
                let collected = lock(&self.handles, "DebugSession.handles")
                    .registry
                    .is_collected(id)?;
                w.write_bool(collected);
                Ok(())
            }

            // StringReference.Value
            (10, 1) => {
                let (id, obj) = self.read_object(r)?;
                let value = self
                    .runtime
                    .heap
                    .string_value(obj)
                    .ok_or(AgentError::InvalidObject(id))?;
                w.write_string(&value);
                Ok(())
            }

            // ThreadReference.Name
            (11, 1) => {
                let thread = self.read_thread(r)?;
                let control = self
                    .coordinator
                    .thread(thread)
                    .ok_or(AgentError::ThreadNotAlive)?;
                w.write_string(control.name());
                Ok(())
            }
            // ThreadReference.Suspend
            (11, 2) => {
                let thread = self.read_thread(r)?;
                self.suspend_thread(thread)
            }
            // ThreadReference.Resume
            (11, 3) => {
                let thread = self.read_thread(r)?;
                self.coordinator.resume_one(thread);
                Ok(())
            }
            // ThreadReference.Status
            (11, 4) => self.thread_status(r, w),
            // ThreadReference.Frames
            (11, 6) => self.frames(r, w),
            // ThreadReference.FrameCount
            (11, 7) => {
                let thread = self.read_thread(r)?;
                w.write_i32(self.suspended_frames(thread)?.len() as i32);
                Ok(())
            }
            // ThreadReference.SuspendCount
            (11, 12) => {
                let thread = self.read_thread(r)?;
                let counts = self
                    .coordinator
                    .counts(thread)
                    .ok_or(AgentError::ThreadNotAlive)?;
                w.write_u32(counts.debug_suspend_count);
                Ok(())
            }

            // EventRequest.Set
            (15, 1) => self.set_event_request(r, w),
            // EventRequest.Clear
            (15, 2) => {
                let kind = r.read_u8()?;
                let id = r.read_u32()?;
                self.clear_event_request(kind, id)
            }
            // EventRequest.ClearAllBreakpoints
            (15, 3) => {
                let cleared = lock(&self.requests, "DebugSession.requests")
                    .remove_kind(EVENT_KIND_BREAKPOINT);
                let mut failure = None;
                for request in &cleared {
                    if let Err(err) = self.release(request) {
                        tracing::warn!(
                            target = "nova.jdwp",
                            request = request.id,
                            error = %err,
                            "failed to release breakpoint"
                        );
                        failure.get_or_insert(err);
                    }
                }
                self.apply_deoptimizations();
                failure.map_or(Ok(()), Err)
            }

            // StackFrame.GetValues
            (16, 1) => self.frame_get_values(r, w),
            // StackFrame.SetValues
            (16, 2) => self.frame_set_values(r),
            // StackFrame.ThisObject
            (16, 3) => {
                let (_, _, frame) = self.read_frame(r)?;
                let mut handles = lock(&self.handles, "DebugSession.handles");
                let this = Self::object_value(&mut handles, &self.runtime, frame.this);
                w.write_tagged_value(&this, &self.sizes);
                Ok(())
            }

            // DDM.Chunk
            (199, 1) => self.ddm_chunk(r, w),

            (set, cmd) => Err(AgentError::NotImplemented(format!("command {set}/{cmd}"))),
        }?;
        Ok(writer.into_vec())
    }

    fn class_info(&self, id: ReferenceTypeId) -> AgentResult<ClassInfo> {
        self.runtime
            .classes
            .class(id)
            .ok_or(AgentError::InvalidClass(id))
    }

    fn method_info(&self, id: MethodId) -> AgentResult<MethodInfo> {
        self.runtime
            .classes
            .method(id)
            .ok_or(AgentError::InvalidMethodId(id))
    }

    fn field_info(&self, id: u64) -> AgentResult<FieldInfo> {
        self.runtime
            .classes
            .field(id)
            .ok_or(AgentError::InvalidFieldId(id))
    }

    fn read_class(&self, r: &mut JdwpReader<'_>) -> AgentResult<ClassInfo> {
        let id = r.read_reference_type_id(&self.sizes)?;
        self.class_info(id)
    }

    fn read_object(&self, r: &mut JdwpReader<'_>) -> AgentResult<(ObjectId, HeapRef)> {
        let id = r.read_object_id(&self.sizes)?;
        let obj = lock(&self.handles, "DebugSession.handles")
            .registry
            .resolve(id)?;
        Ok((id, obj))
    }

    fn read_thread(&self, r: &mut JdwpReader<'_>) -> AgentResult<ThreadHandle> {
        let id = r.read_object_id(&self.sizes)?;
        self.thread_handle(id)
    }

    /// Frames of a thread the debugger holds, once it has actually stopped.
    fn suspended_frames(&self, thread: ThreadHandle) -> AgentResult<Vec<Frame>> {
        if !self.coordinator.is_suspended_for_debugger(thread) {
            return Err(AgentError::ThreadNotSuspended);
        }
        self.coordinator.wait_until_parked(thread)?;
        Ok(self.runtime.interpreter.frames(thread))
    }

    /// Resolve a `(threadID, frameID)` pair. Frame ids are stack depths,
    /// innermost frame first.
    fn read_frame(&self, r: &mut JdwpReader<'_>) -> AgentResult<(ThreadHandle, usize, Frame)> {
        let thread = self.read_thread(r)?;
        let frame_id = r.read_id(self.sizes.frame_id)?;
        let frames = self.suspended_frames(thread)?;
        let (depth, frame) = usize::try_from(frame_id)
            .ok()
            .and_then(|depth| Some((depth, *frames.get(depth)?)))
            .ok_or(AgentError::InvalidFrameId(frame_id))?;
        Ok((thread, depth, frame))
    }

    fn write_class_ref(&self, w: &mut JdwpWriter, class: &ClassInfo) {
        w.write_u8(class.type_tag);
        w.write_reference_type_id(class.id, &self.sizes);
    }

    /// A value about to be stored must fit the declared type.
    fn check_store(&self, value: &Value, wire_tag: u8, signature: &str) -> AgentResult<()> {
        let expected = signature_to_tag(signature);
        if is_primitive_tag(expected) {
            return if wire_tag == expected {
                Ok(())
            } else {
                Err(AgentError::TypeMismatch)
            };
        }
        let Value::Object(obj) = value else {
            return Err(AgentError::TypeMismatch);
        };
        let classes = &self.runtime.classes;
        if let (Some(obj), Some(declared)) = (obj, classes.class_by_signature(signature)) {
            let fits = self
                .runtime
                .heap
                .class_of(*obj)
                .is_some_and(|class| classes.is_assignable(class, declared));
            if !fits {
                return Err(AgentError::TypeMismatch);
            }
        }
        Ok(())
    }

    fn vm_version(&self, w: &mut JdwpWriter) -> AgentResult<()> {
        let name = &self.config.vm_name;
        let version = &self.config.vm_version;
        w.write_string(&format!("{name} {version}, JDWP {JDWP_MAJOR}.{JDWP_MINOR}"));
        w.write_i32(JDWP_MAJOR);
        w.write_i32(JDWP_MINOR);
        w.write_string(version);
        w.write_string(name);
        Ok(())
    }

    fn classes_by_signature(&self, r: &mut JdwpReader<'_>, w: &mut JdwpWriter) -> AgentResult<()> {
        let signature = r.read_string()?;
        let classes: Vec<_> = self
            .runtime
            .classes
            .all_classes()
            .into_iter()
            .filter(|class| class.signature == signature)
            .collect();
        w.write_u32(classes.len() as u32);
        for class in &classes {
            self.write_class_ref(w, class);
            w.write_u32(class.status);
        }
        Ok(())
    }

    fn all_classes(&self, w: &mut JdwpWriter, generic: bool) -> AgentResult<()> {
        let classes = self.runtime.classes.all_classes();
        w.write_u32(classes.len() as u32);
        for class in &classes {
            self.write_class_ref(w, class);
            w.write_string(&class.signature);
            if generic {
                w.write_string(class.generic_signature.as_deref().unwrap_or(""));
            }
            w.write_u32(class.status);
        }
        Ok(())
    }

    fn all_threads(&self, w: &mut JdwpWriter) -> AgentResult<()> {
        let threads = self.coordinator.threads();
        let mut handles = lock(&self.handles, "DebugSession.handles");
        w.write_u32(threads.len() as u32);
        for control in &threads {
            let id = self.thread_id(&mut handles, control.handle());
            w.write_object_id(id, &self.sizes);
        }
        Ok(())
    }

    fn dispose_objects(&self, r: &mut JdwpReader<'_>) -> AgentResult<()> {
        let count = r.read_i32()?;
        let mut handles = lock(&self.handles, "DebugSession.handles");
        for _ in 0..count.max(0) {
            let id = r.read_object_id(&self.sizes)?;
            let refs = r.read_i32()?;
            handles.registry.dispose(id, refs.max(0) as u32);
        }
        let super::Handles { registry, threads } = &mut *handles;
        threads.retain(|id, _| !matches!(registry.get(*id), Lookup::Invalid));
        Ok(())
    }

    fn instance_counts(&self, r: &mut JdwpReader<'_>, w: &mut JdwpWriter) -> AgentResult<()> {
        let count = r.read_i32()?;
        if count < 0 {
            return Err(AgentError::IllegalArgument(format!("class count {count}")));
        }
        let mut classes = Vec::new();
        for _ in 0..count {
            classes.push(self.read_class(r)?.id);
        }
        self.runtime.heap.collect_now();
        w.write_u32(classes.len() as u32);
        for class in classes {
            w.write_i64(self.runtime.heap.instances_of(class, 0).len() as i64);
        }
        Ok(())
    }

    fn fields(&self, r: &mut JdwpReader<'_>, w: &mut JdwpWriter, generic: bool) -> AgentResult<()> {
        let class = self.read_class(r)?;
        let fields = self.runtime.classes.fields(class.id);
        w.write_u32(fields.len() as u32);
        for field in &fields {
            w.write_id(field.id, self.sizes.field_id);
            w.write_string(&field.name);
            w.write_string(&field.signature);
            if generic {
                w.write_string(field.generic_signature.as_deref().unwrap_or(""));
            }
            w.write_u32(field.modifiers);
        }
        Ok(())
    }

    fn methods(&self, r: &mut JdwpReader<'_>, w: &mut JdwpWriter, generic: bool) -> AgentResult<()> {
        let class = self.read_class(r)?;
        let methods = self.runtime.classes.methods(class.id);
        w.write_u32(methods.len() as u32);
        for method in &methods {
            w.write_id(method.id, self.sizes.method_id);
            w.write_string(&method.name);
            w.write_string(&method.signature);
            if generic {
                w.write_string(method.generic_signature.as_deref().unwrap_or(""));
            }
            w.write_u32(method.modifiers);
        }
        Ok(())
    }

    fn static_get_values(&self, r: &mut JdwpReader<'_>, w: &mut JdwpWriter) -> AgentResult<()> {
        self.read_class(r)?;
        let count = r.read_i32()?;
        let mut fields = Vec::new();
        for _ in 0..count.max(0) {
            let field = self.field_info(r.read_id(self.sizes.field_id)?)?;
            if !field.is_static() {
                return Err(AgentError::InvalidFieldId(field.id));
            }
            fields.push(field);
        }
        let mut handles = lock(&self.handles, "DebugSession.handles");
        w.write_u32(fields.len() as u32);
        for field in &fields {
            let value = self.runtime.heap.get_field(None, field);
            let value = handles.registry.wire_value(
                &*self.runtime.heap,
                value,
                signature_to_tag(&field.signature),
            );
            w.write_tagged_value(&value, &self.sizes);
        }
        Ok(())
    }

    fn static_set_values(&self, r: &mut JdwpReader<'_>) -> AgentResult<()> {
        self.read_class(r)?;
        let count = r.read_i32()?;
        for _ in 0..count.max(0) {
            let field = self.field_info(r.read_id(self.sizes.field_id)?)?;
            if !field.is_static() {
                return Err(AgentError::InvalidFieldId(field.id));
            }
            let wire = r.read_value(signature_to_tag(&field.signature), &self.sizes)?;
            self.store_field(None, &field, &wire)?;
        }
        Ok(())
    }

    fn store_field(
        &self,
        receiver: Option<HeapRef>,
        field: &FieldInfo,
        wire: &JdwpValue,
    ) -> AgentResult<()> {
        let value = lock(&self.handles, "DebugSession.handles")
            .registry
            .runtime_value(wire)?;
        self.check_store(&value, wire.tag(), &field.signature)?;
        self.runtime.heap.set_field(receiver, field, value);
        Ok(())
    }

    fn instances(&self, r: &mut JdwpReader<'_>, w: &mut JdwpWriter) -> AgentResult<()> {
        let class = self.read_class(r)?;
        let max = r.read_i32()?;
        if max < 0 {
            return Err(AgentError::IllegalArgument(format!("max instances {max}")));
        }
        self.runtime.heap.collect_now();
        let instances = self.runtime.heap.instances_of(class.id, max as usize);
        let mut handles = lock(&self.handles, "DebugSession.handles");
        w.write_u32(instances.len() as u32);
        for obj in instances {
            let value = Self::object_value(&mut handles, &self.runtime, Some(obj));
            w.write_tagged_value(&value, &self.sizes);
        }
        Ok(())
    }

    /// Receiver to use for `field` on `obj`. A static field is read from its
    /// class; an instance field the object does not have is rejected.
    fn instance_receiver(&self, obj: HeapRef, field: &FieldInfo) -> AgentResult<Option<HeapRef>> {
        if field.is_static() {
            tracing::warn!(
                target = "nova.jdwp",
                field = %field.name,
                "static field accessed through an instance"
            );
            return Ok(None);
        }
        let has_field = self
            .runtime
            .heap
            .class_of(obj)
            .is_some_and(|class| self.runtime.classes.is_assignable(class, field.owner));
        if !has_field {
            return Err(AgentError::InvalidFieldId(field.id));
        }
        Ok(Some(obj))
    }

    fn object_get_values(&self, r: &mut JdwpReader<'_>, w: &mut JdwpWriter) -> AgentResult<()> {
        let (_, obj) = self.read_object(r)?;
        let count = r.read_i32()?;
        let mut reads = Vec::new();
        for _ in 0..count.max(0) {
            let field = self.field_info(r.read_id(self.sizes.field_id)?)?;
            let receiver = self.instance_receiver(obj, &field)?;
            reads.push((receiver, field));
        }
        let mut handles = lock(&self.handles, "DebugSession.handles");
        w.write_u32(reads.len() as u32);
        for (receiver, field) in &reads {
            let value = self.runtime.heap.get_field(*receiver, field);
            let value = handles.registry.wire_value(
                &*self.runtime.heap,
                value,
                signature_to_tag(&field.signature),
            );
            w.write_tagged_value(&value, &self.sizes);
        }
        Ok(())
    }

    fn object_set_values(&self, r: &mut JdwpReader<'_>) -> AgentResult<()> {
        let (_, obj) = self.read_object(r)?;
        let count = r.read_i32()?;
        for _ in 0..count.max(0) {
            let field = self.field_info(r.read_id(self.sizes.field_id)?)?;
            let receiver = self.instance_receiver(obj, &field)?;
            let wire = r.read_value(signature_to_tag(&field.signature), &self.sizes)?;
            self.store_field(receiver, &field, &wire)?;
        }
        Ok(())
    }

    /// Shared tail of `ClassType.InvokeMethod` and `ObjectReference.InvokeMethod`.
    fn invoke(
        &self,
        r: &mut JdwpReader<'_>,
        w: &mut JdwpWriter,
        receiver: Option<ObjectId>,
        thread: ObjectId,
        class: ReferenceTypeId,
    ) -> AgentResult<()> {
        let method = r.read_id(self.sizes.method_id)?;
        let arg_count = r.read_i32()?;
        let mut args = Vec::new();
        for _ in 0..arg_count.max(0) {
            args.push(r.read_tagged_value(&self.sizes)?);
        }
        let options = InvokeOptions::from_bits(r.read_u32()?);
        let request = InvocationRequest {
            thread: self.thread_handle(thread)?,
            receiver,
            class,
            method,
            args,
            options,
        };

        let (control, call) = {
            let handles = lock(&self.handles, "DebugSession.handles");
            prepare_invocation(
                &request,
                &self.coordinator,
                &handles.registry,
                &*self.runtime.heap,
                &*self.runtime.classes,
            )?
        };
        let outcome = invoke_on_thread(&self.coordinator, &control, call, options, &self.gate)?;

        let return_tag = self
            .runtime
            .classes
            .method(method)
            .map_or(TAG_VOID, |m| signature_to_tag(&m.return_signature));
        let mut handles = lock(&self.handles, "DebugSession.handles");
        let value = handles
            .registry
            .wire_value(&*self.runtime.heap, outcome.value, return_tag);
        let exception = Self::object_value(&mut handles, &self.runtime, outcome.exception);
        w.write_tagged_value(&value, &self.sizes);
        w.write_tagged_value(&exception, &self.sizes);
        Ok(())
    }

    fn line_table(&self, r: &mut JdwpReader<'_>, w: &mut JdwpWriter) -> AgentResult<()> {
        self.read_class(r)?;
        let method = self.method_info(r.read_id(self.sizes.method_id)?)?;
        if method.is_native() {
            w.write_i64(-1);
            w.write_i64(-1);
            w.write_u32(0);
            return Ok(());
        }
        w.write_u64(0);
        w.write_u64(method.code_length.saturating_sub(1));
        w.write_u32(method.line_table.len() as u32);
        for entry in &method.line_table {
            w.write_u64(entry.pc);
            w.write_i32(entry.line);
        }
        Ok(())
    }

    fn variable_table(&self, r: &mut JdwpReader<'_>, w: &mut JdwpWriter) -> AgentResult<()> {
        self.read_class(r)?;
        let method = self.method_info(r.read_id(self.sizes.method_id)?)?;
        if method.variables.is_empty() {
            return Err(AgentError::AbsentInformation);
        }
        w.write_u32(method.argument_slots());
        w.write_u32(method.variables.len() as u32);
        for var in &method.variables {
            w.write_u64(var.start_pc);
            w.write_string(&var.name);
            w.write_string(&var.signature);
            w.write_u32(var.length);
            w.write_u32(var.slot);
        }
        Ok(())
    }

    fn thread_status(&self, r: &mut JdwpReader<'_>, w: &mut JdwpWriter) -> AgentResult<()> {
        let thread = match self.read_thread(r) {
            Ok(thread) => thread,
            Err(AgentError::ThreadNotAlive) => {
                w.write_u32(THREAD_STATUS_ZOMBIE);
                w.write_u32(0);
                return Ok(());
            }
            Err(err) => return Err(err),
        };
        let suspended = self.coordinator.is_suspended_for_debugger(thread);
        w.write_u32(THREAD_STATUS_RUNNING);
        w.write_u32(if suspended { SUSPEND_STATUS_SUSPENDED } else { 0 });
        Ok(())
    }

    fn frames(&self, r: &mut JdwpReader<'_>, w: &mut JdwpWriter) -> AgentResult<()> {
        let thread = self.read_thread(r)?;
        let start = r.read_i32()?;
        let length = r.read_i32()?;
        let frames = self.suspended_frames(thread)?;
        let total = frames.len();
        let start = usize::try_from(start)
            .ok()
            .filter(|start| *start <= total)
            .ok_or_else(|| AgentError::IllegalArgument(format!("frame start {start}")))?;
        let length = match length {
            -1 => total - start,
            len => usize::try_from(len)
                .ok()
                .filter(|len| start + len <= total)
                .ok_or_else(|| AgentError::IllegalArgument(format!("frame length {len}")))?,
        };
        w.write_u32(length as u32);
        for (depth, frame) in frames.iter().enumerate().skip(start).take(length) {
            w.write_id(depth as u64, self.sizes.frame_id);
            w.write_location(
                &self.location(CodeLocation {
                    method: frame.method,
                    pc: frame.pc,
                }),
                &self.sizes,
            );
        }
        Ok(())
    }

    fn frame_get_values(&self, r: &mut JdwpReader<'_>, w: &mut JdwpWriter) -> AgentResult<()> {
        let (thread, depth, _) = self.read_frame(r)?;
        let count = r.read_i32()?;
        let mut values = Vec::new();
        for _ in 0..count.max(0) {
            let slot = r.read_i32()?;
            let tag = r.read_u8()?;
            let slot = u32::try_from(slot).map_err(|_| AgentError::InvalidSlot(slot as u32))?;
            let value = self
                .runtime
                .interpreter
                .get_local(thread, depth, slot, tag)
                .ok_or(AgentError::InvalidSlot(slot))?;
            if !tag_fits(&value, tag) {
                return Err(AgentError::TypeMismatch);
            }
            values.push((value, tag));
        }
        let mut handles = lock(&self.handles, "DebugSession.handles");
        w.write_u32(values.len() as u32);
        for (value, tag) in values {
            let value = handles
                .registry
                .wire_value(&*self.runtime.heap, value, tag);
            w.write_tagged_value(&value, &self.sizes);
        }
        Ok(())
    }

    fn frame_set_values(&self, r: &mut JdwpReader<'_>) -> AgentResult<()> {
        let (thread, depth, _) = self.read_frame(r)?;
        let count = r.read_i32()?;
        for _ in 0..count.max(0) {
            let slot = r.read_i32()?;
            let wire = r.read_tagged_value(&self.sizes)?;
            let slot = u32::try_from(slot).map_err(|_| AgentError::InvalidSlot(slot as u32))?;
            let interpreter = &self.runtime.interpreter;
            let current = interpreter
                .get_local(thread, depth, slot, wire.tag())
                .ok_or(AgentError::InvalidSlot(slot))?;
            if !tag_fits(&current, wire.tag()) {
                return Err(AgentError::TypeMismatch);
            }
            let value = lock(&self.handles, "DebugSession.handles")
                .registry
                .runtime_value(&wire)?;
            if !interpreter.set_local(thread, depth, slot, value) {
                return Err(AgentError::InvalidSlot(slot));
            }
        }
        Ok(())
    }

    fn set_event_request(&self, r: &mut JdwpReader<'_>, w: &mut JdwpWriter) -> AgentResult<()> {
        let kind = r.read_u8()?;
        let suspend_policy = r.read_u8()?;
        if !is_supported_kind(kind) {
            return Err(AgentError::InvalidEventType(kind));
        }
        if suspend_policy > SUSPEND_POLICY_ALL {
            return Err(AgentError::IllegalArgument(format!(
                "suspend policy {suspend_policy}"
            )));
        }
        let modifiers = decode_modifiers(r, &self.sizes, &mut |id| self.thread_handle(id))?;
        let (footprint, step) = self.footprint(kind, &modifiers)?;
        self.hold(footprint)?;

        let id = lock(&self.requests, "DebugSession.requests").insert(
            kind,
            suspend_policy,
            modifiers,
            footprint,
        );
        if let (Some(thread), Some(step)) = (footprint.step_thread, step) {
            lock(&self.steps, "DebugSession.steps").insert(thread, (id, step));
        }
        if self.is_detached() {
            // Detach drained the table before this insert; undo it here.
            self.clear_event_request(kind, id)?;
            return Err(AgentError::VmDead);
        }
        tracing::debug!(target = "nova.jdwp", id, kind, suspend_policy, "event request set");
        self.apply_deoptimizations();
        w.write_u32(id);
        Ok(())
    }

    /// Work out what a new request of `kind` needs from the runtime.
    fn footprint(
        &self,
        kind: u8,
        modifiers: &[Modifier],
    ) -> AgentResult<(Footprint, Option<SingleStepControl>)> {
        let mut footprint = Footprint::default();
        let watch = |events: InstrumentationEvents| Footprint {
            events,
            full_deoptimization: true,
            ..Footprint::default()
        };
        let mut step = None;
        match kind {
            EVENT_KIND_BREAKPOINT => {
                let location = modifiers
                    .iter()
                    .find_map(|modifier| match modifier {
                        Modifier::LocationOnly(location) => Some(*location),
                        _ => None,
                    })
                    .ok_or_else(|| {
                        AgentError::IllegalArgument("breakpoint without a location".to_owned())
                    })?;
                let method = self.method_info(location.method_id)?;
                if location.index >= method.code_length {
                    return Err(AgentError::InvalidLocation);
                }
                footprint.events = InstrumentationEvents::LOCATION_CHANGED;
                footprint.breakpoint = Some(CodeLocation {
                    method: method.id,
                    pc: location.index,
                });
            }
            EVENT_KIND_SINGLE_STEP => {
                let (thread, size, depth) = modifiers
                    .iter()
                    .find_map(|modifier| match *modifier {
                        Modifier::Step {
                            thread,
                            size,
                            depth,
                        } => Some((thread, size, depth)),
                        _ => None,
                    })
                    .ok_or_else(|| {
                        AgentError::IllegalArgument("single step without a step filter".to_owned())
                    })?;
                if lock(&self.steps, "DebugSession.steps").contains_key(&thread) {
                    return Err(AgentError::Duplicate);
                }
                let frames = self.suspended_frames(thread)?;
                step = Some(SingleStepControl::configure(
                    size,
                    depth,
                    &frames,
                    &*self.runtime.classes,
                )?);
                footprint = watch(InstrumentationEvents::LOCATION_CHANGED);
                footprint.step_thread = Some(thread);
            }
            EVENT_KIND_METHOD_ENTRY => footprint = watch(InstrumentationEvents::METHOD_ENTERED),
            EVENT_KIND_METHOD_EXIT | EVENT_KIND_METHOD_EXIT_WITH_RETURN_VALUE => {
                footprint = watch(InstrumentationEvents::METHOD_EXITED)
            }
            EVENT_KIND_FIELD_ACCESS => footprint = watch(InstrumentationEvents::FIELD_READ),
            EVENT_KIND_FIELD_MODIFICATION => {
                footprint = watch(InstrumentationEvents::FIELD_WRITTEN)
            }
            EVENT_KIND_EXCEPTION => {
                footprint.events = InstrumentationEvents::EXCEPTION_THROWN;
            }
            _ => {}
        }
        Ok((footprint, step))
    }

    /// Queue the instrumentation a new request holds. Applied by the caller.
    fn hold(&self, footprint: Footprint) -> AgentResult<()> {
        let mut deopt = lock(&self.deopt, "DebugSession.deopt");
        let DeoptState { breakpoints, queue } = &mut *deopt;
        if let Some(at) = footprint.breakpoint {
            if let Some(request) = breakpoints.watch(
                at.method,
                at.pc,
                &*self.runtime.classes,
                &*self.runtime.instrumentation,
            ) {
                queue.enqueue(request)?;
            }
        }
        if !footprint.events.is_empty() {
            queue.enqueue(DeoptimizationRequest::RegisterForEvent(footprint.events))?;
        }
        if footprint.full_deoptimization {
            queue.enqueue(DeoptimizationRequest::FullDeoptimization)?;
        }
        Ok(())
    }

    /// `EventRequest.Clear`. Clearing an id that is not installed is not an
    /// error.
    fn clear_event_request(&self, kind: u8, id: u32) -> AgentResult<()> {
        let removed = lock(&self.requests, "DebugSession.requests").remove(kind, id);
        let Some(request) = removed else {
            tracing::debug!(target = "nova.jdwp", id, kind, "clear of unknown event request");
            return Ok(());
        };
        self.release(&request)?;
        self.apply_deoptimizations();
        Ok(())
    }

    fn ddm_chunk(&self, r: &mut JdwpReader<'_>, w: &mut JdwpWriter) -> AgentResult<()> {
        let chunk_type = r.read_u32()?;
        let length = r.read_u32()? as usize;
        let data = r.read_bytes(length)?;
        match chunk_type {
            CHUNK_REAE => {
                let enable = data.first().is_some_and(|flag| *flag != 0);
                let mut allocations = lock(&self.allocations, "DebugSession.allocations");
                if enable {
                    let config = &self.config.allocation_tracking;
                    allocations.enable(config.max_records, config.max_stack_depth)?;
                } else {
                    allocations.disable();
                }
            }
            CHUNK_REAQ => {
                let enabled = lock(&self.allocations, "DebugSession.allocations").is_enabled();
                w.write_u32(CHUNK_REAQ);
                w.write_u32(1);
                w.write_bool(enabled);
            }
            CHUNK_REAL => {
                let report = lock(&self.allocations, "DebugSession.allocations")
                    .snapshot(&*self.runtime.classes);
                w.write_u32(CHUNK_REAL);
                w.write_u32(report.len() as u32);
                w.write_bytes(&report);
            }
            other => {
                tracing::debug!(
                    target = "nova.jdwp",
                    chunk = %String::from_utf8_lossy(&other.to_be_bytes()),
                    "ignoring unknown DDM chunk"
                );
            }
        }
        Ok(())
    }
}

/// Whether a local read with `tag` produced a value of that kind.
fn tag_fits(value: &Value, tag: u8) -> bool {
    if is_primitive_tag(tag) {
        value.primitive_tag() == tag
    } else {
        matches!(value, Value::Object(_))
    }
}
