//! Running a method on a suspended thread on the debugger's behalf.
//!
//! The debugger side validates the request, posts it into the target's
//! invocation slot together with a one-shot reply channel, resumes the target
//! (or everyone) and blocks on the reply holding no lock. The target notices
//! the request when it leaves its park, runs the call, re-suspends itself and
//! only then sends the outcome, so the debugger always finds it parked again.

use std::sync::Arc;

use nova_jdwp::{
    is_primitive_tag, signature_to_tag, JdwpValue, MethodId, ObjectId, INVOKE_NONVIRTUAL,
    INVOKE_SINGLE_THREADED,
};
use tokio::sync::oneshot;

use crate::error::{AgentError, AgentResult};
use crate::registry::ObjectRegistry;
use crate::runtime::{
    ClassId, ClassModel, Heap, InvocationCall, InvokeOutcome, Interpreter, ThreadHandle, Value,
};
use crate::suspend::{SuspendGate, SuspensionCoordinator, ThreadControl};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct InvokeOptions(u32);

impl InvokeOptions {
    pub const SINGLE_THREADED: Self = Self(INVOKE_SINGLE_THREADED);
    pub const NONVIRTUAL: Self = Self(INVOKE_NONVIRTUAL);

    pub fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    pub fn bits(self) -> u32 {
        self.0
    }

    pub fn single_threaded(self) -> bool {
        self.0 & INVOKE_SINGLE_THREADED != 0
    }

    pub fn nonvirtual(self) -> bool {
        self.0 & INVOKE_NONVIRTUAL != 0
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct InvocationRequest {
    pub thread: ThreadHandle,
    /// `None` for `ClassType.InvokeMethod`.
    pub receiver: Option<ObjectId>,
    pub class: ClassId,
    pub method: MethodId,
    pub args: Vec<JdwpValue>,
    pub options: InvokeOptions,
}

#[derive(Debug)]
pub(crate) struct PendingInvocation {
    pub(crate) call: InvocationCall,
    pub(crate) reply: oneshot::Sender<InvokeOutcome>,
}

/// Check everything that can be checked before anyone is resumed.
pub fn prepare_invocation(
    request: &InvocationRequest,
    coordinator: &SuspensionCoordinator,
    registry: &ObjectRegistry,
    heap: &dyn Heap,
    classes: &dyn ClassModel,
) -> AgentResult<(Arc<ThreadControl>, InvocationCall)> {
    let control = coordinator
        .thread(request.thread)
        .ok_or(AgentError::InvalidThread(request.thread.0))?;
    let status = coordinator
        .status(request.thread)
        .ok_or(AgentError::ThreadNotAlive)?;
    if !status.at_event {
        return Err(AgentError::ThreadNotSuspended);
    }
    if status.counts.debug_suspend_count > 1 {
        // Resuming once would not let it run; resuming more would unbalance
        // the debugger's own suspensions.
        return Err(AgentError::ThreadSuspended);
    }
    if control.has_pending_invocation() {
        return Err(AgentError::AlreadyInvoking);
    }

    let receiver = match request.receiver {
        Some(id) => Some(registry.resolve(id)?),
        None => None,
    };
    let args = request
        .args
        .iter()
        .map(|arg| registry.runtime_value(arg))
        .collect::<AgentResult<Vec<_>>>()?;

    classes
        .class(request.class)
        .ok_or(AgentError::InvalidClass(request.class))?;
    let method = classes
        .method(request.method)
        .ok_or(AgentError::InvalidMethodId(request.method))?;
    if method.is_static() != receiver.is_none() {
        return Err(AgentError::InvalidMethodId(request.method));
    }
    if !classes.is_assignable(request.class, method.owner) {
        return Err(AgentError::InvalidMethodId(request.method));
    }
    if let Some(receiver) = receiver {
        let receiver_class = heap
            .class_of(receiver)
            .ok_or(AgentError::InvalidObject(request.receiver.unwrap_or_default()))?;
        if !classes.is_assignable(receiver_class, method.owner) {
            return Err(AgentError::InvalidMethodId(request.method));
        }
    }
    if request.options.nonvirtual() && method.is_abstract() {
        return Err(AgentError::InvalidMethodId(request.method));
    }

    if args.len() != method.parameter_signatures.len() {
        return Err(AgentError::IllegalArgument(format!(
            "expected {} arguments, got {}",
            method.parameter_signatures.len(),
            args.len()
        )));
    }
    for (index, ((wire, value), signature)) in request
        .args
        .iter()
        .zip(&args)
        .zip(&method.parameter_signatures)
        .enumerate()
    {
        check_argument(index, wire, value, signature, heap, classes)?;
    }

    Ok((
        control,
        InvocationCall {
            receiver,
            class: request.class,
            method: request.method,
            args,
            nonvirtual: request.options.nonvirtual(),
        },
    ))
}

fn check_argument(
    index: usize,
    wire: &JdwpValue,
    value: &Value,
    signature: &str,
    heap: &dyn Heap,
    classes: &dyn ClassModel,
) -> AgentResult<()> {
    let expected = signature_to_tag(signature);
    if is_primitive_tag(expected) {
        if wire.tag() != expected {
            return Err(AgentError::IllegalArgument(format!(
                "argument {index}: expected {}, got {}",
                expected as char,
                wire.tag() as char
            )));
        }
        return Ok(());
    }

    let Value::Object(obj) = value else {
        return Err(AgentError::IllegalArgument(format!(
            "argument {index}: expected a reference for {signature}"
        )));
    };
    if let (Some(obj), Some(param_class)) = (obj, classes.class_by_signature(signature)) {
        let assignable = heap
            .class_of(*obj)
            .is_some_and(|class| classes.is_assignable(class, param_class));
        if !assignable {
            return Err(AgentError::IllegalArgument(format!(
                "argument {index}: not assignable to {signature}"
            )));
        }
    }
    Ok(())
}

/// Debugger side: hand the call to the target and wait for its outcome.
///
/// Must not run on an async worker; the wait blocks the calling thread.
/// `gate` is the session's: detach abandons the invocation, which ends the
/// wait, and an outcome arriving after detach releases the target instead of
/// re-suspending anyone.
pub fn invoke_on_thread(
    coordinator: &SuspensionCoordinator,
    control: &ThreadControl,
    call: InvocationCall,
    options: InvokeOptions,
    gate: &SuspendGate,
) -> AgentResult<InvokeOutcome> {
    let handle = control.handle();
    let (reply, outcome) = oneshot::channel();
    control.post_invocation(PendingInvocation { call, reply })?;

    if options.single_threaded() {
        coordinator.resume_one(handle);
    } else {
        coordinator.undo_debugger_suspensions();
    }
    tracing::debug!(
        target = "nova.jdwp",
        thread = %handle,
        single_threaded = options.single_threaded(),
        "waiting for invocation"
    );

    let outcome = outcome.blocking_recv();
    let resuspended = gate.admit(|| {
        if !options.single_threaded() {
            coordinator.suspend_all_except(handle);
        }
    });
    if resuspended.is_none() {
        if outcome.is_ok() {
            coordinator.resume_one(handle);
        }
        return Err(AgentError::VmDead);
    }
    outcome.map_err(|_| AgentError::ThreadNotAlive)
}

/// Target side: run a posted invocation, if any. Returns whether one ran.
pub fn service_invocation(
    coordinator: &SuspensionCoordinator,
    control: &ThreadControl,
    interpreter: &dyn Interpreter,
) -> bool {
    let Some(call) = control.start_invocation() else {
        return false;
    };
    let handle = control.handle();

    let saved = interpreter.take_pending_exception(handle);
    let outcome = interpreter.invoke(handle, &call);
    interpreter.set_pending_exception(handle, saved);
    tracing::debug!(
        target = "nova.jdwp",
        thread = %handle,
        method = call.method,
        threw = outcome.exception.is_some(),
        "invocation finished"
    );

    coordinator.suspend_self_for_event(handle);
    if !control.finish_invocation(outcome) {
        // Nobody is waiting any more; do not stay suspended on their behalf.
        coordinator.resume_one(handle);
    }
    true
}
