//! Suspend and resume of application threads.
//!
//! Every thread carries two counters: a general suspend count that any
//! subsystem (the collector included) may raise, and a debug suspend count
//! raised only by the agent. A thread is suspended for the debugger while both
//! are positive. Threads notice suspension at safepoints, where they park until
//! the general count drops back to zero.
//!
//! Locking: the thread list is always taken before the suspend table. The
//! suspend table's condition variable is signalled on every count or state
//! change.

use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::error::{consistency_violation, AgentError, AgentResult};
use tokio::sync::oneshot;

use crate::invoke::PendingInvocation;
use crate::poison::{lock, wait, wait_timeout};
use crate::runtime::{GcVisitor, HeapRef, InvocationCall, InvokeOutcome, ThreadHandle};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecState {
    Running,
    /// Outside managed code; counts as suspended without polling.
    Native,
    Parked,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SuspendCounts {
    pub suspend_count: u32,
    pub debug_suspend_count: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThreadStatus {
    pub counts: SuspendCounts,
    pub exec: ExecState,
    /// Parked in an event report (the only place invocations are accepted).
    pub at_event: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParkOutcome {
    /// Not suspended; the thread never stopped.
    Continued,
    Resumed,
}

/// Per-thread block shared between the thread itself and the debugger side.
#[derive(Debug)]
pub struct ThreadControl {
    handle: ThreadHandle,
    name: String,
    peer: Mutex<HeapRef>,
    invocation: Mutex<Option<PendingInvocation>>,
    /// Reply channel of the invocation the thread is running right now.
    running: Mutex<Option<oneshot::Sender<InvokeOutcome>>>,
}

impl ThreadControl {
    pub fn handle(&self) -> ThreadHandle {
        self.handle
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The thread's managed peer object, kept current across relocation.
    pub fn peer(&self) -> HeapRef {
        *lock(&self.peer, "ThreadControl.peer")
    }

    pub(crate) fn relocate_peer(&self, gc: &dyn GcVisitor) {
        let mut peer = lock(&self.peer, "ThreadControl.peer");
        *peer = gc.relocate(*peer);
    }

    pub(crate) fn post_invocation(&self, pending: PendingInvocation) -> AgentResult<()> {
        let mut slot = lock(&self.invocation, "ThreadControl.invocation");
        if slot.is_some() || lock(&self.running, "ThreadControl.running").is_some() {
            return Err(AgentError::AlreadyInvoking);
        }
        *slot = Some(pending);
        Ok(())
    }

    /// Posted or running.
    pub fn has_pending_invocation(&self) -> bool {
        lock(&self.invocation, "ThreadControl.invocation").is_some()
            || lock(&self.running, "ThreadControl.running").is_some()
    }

    /// Take the posted call and keep its reply channel until
    /// [`ThreadControl::finish_invocation`].
    pub(crate) fn start_invocation(&self) -> Option<InvocationCall> {
        let PendingInvocation { call, reply } =
            lock(&self.invocation, "ThreadControl.invocation").take()?;
        *lock(&self.running, "ThreadControl.running") = Some(reply);
        Some(call)
    }

    /// Hand the outcome to the requester. False when nobody is waiting any
    /// more.
    pub(crate) fn finish_invocation(&self, outcome: InvokeOutcome) -> bool {
        let reply = lock(&self.running, "ThreadControl.running").take();
        reply.is_some_and(|reply| reply.send(outcome).is_ok())
    }

    /// Drop the posted call and the running call's reply channel, which wakes
    /// the requester with an error. Returns whether there was either.
    pub(crate) fn abandon_invocation(&self) -> bool {
        let posted = lock(&self.invocation, "ThreadControl.invocation").take();
        let running = lock(&self.running, "ThreadControl.running").take();
        posted.is_some() || running.is_some()
    }
}

/// Admits debugger suspensions for one session. Once closed nothing more gets
/// in, so an `undo_debugger_suspensions` after [`SuspendGate::close`] is final.
#[derive(Debug)]
pub struct SuspendGate {
    open: Mutex<bool>,
}

impl Default for SuspendGate {
    fn default() -> Self {
        Self::new()
    }
}

impl SuspendGate {
    pub fn new() -> Self {
        Self {
            open: Mutex::new(true),
        }
    }

    /// Run `suspend` unless the gate is closed. `close` waits for it, so it
    /// must only raise counts and never wait for threads.
    pub fn admit<R>(&self, suspend: impl FnOnce() -> R) -> Option<R> {
        let open = lock(&self.open, "SuspendGate.open");
        if !*open {
            return None;
        }
        Some(suspend())
    }

    pub fn close(&self) {
        *lock(&self.open, "SuspendGate.open") = false;
    }

    pub fn is_open(&self) -> bool {
        *lock(&self.open, "SuspendGate.open")
    }
}

#[derive(Debug)]
struct ThreadState {
    counts: SuspendCounts,
    exec: ExecState,
    at_event: bool,
}

impl ThreadState {
    fn is_stopped(&self) -> bool {
        matches!(self.exec, ExecState::Parked | ExecState::Native)
    }
}

#[derive(Debug, Default)]
struct SuspendTable {
    states: HashMap<ThreadHandle, ThreadState>,
    /// Suspend-all votes still in force; threads registered later inherit them.
    global_suspend_count: u32,
    global_debug_suspend_count: u32,
}

#[derive(Debug)]
pub struct SuspensionCoordinator {
    threads: Mutex<Vec<Arc<ThreadControl>>>,
    table: Mutex<SuspendTable>,
    changed: Condvar,
    timeout: Duration,
}

/// Proof that every registered thread is stopped. Dropping it resumes them.
#[must_use = "dropping the guard resumes every thread"]
pub struct SuspendAllGuard<'a> {
    coordinator: &'a SuspensionCoordinator,
}

impl Drop for SuspendAllGuard<'_> {
    fn drop(&mut self) {
        self.coordinator.resume_all_for_gc();
    }
}

impl SuspensionCoordinator {
    pub fn new(timeout: Duration) -> Self {
        Self {
            threads: Mutex::new(Vec::new()),
            table: Mutex::new(SuspendTable::default()),
            changed: Condvar::new(),
            timeout,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn register_thread(
        &self,
        handle: ThreadHandle,
        name: impl Into<String>,
        peer: HeapRef,
    ) -> Arc<ThreadControl> {
        let control = Arc::new(ThreadControl {
            handle,
            name: name.into(),
            peer: Mutex::new(peer),
            invocation: Mutex::new(None),
            running: Mutex::new(None),
        });
        let mut threads = lock(&self.threads, "SuspensionCoordinator.threads");
        let mut table = lock(&self.table, "SuspensionCoordinator.table");
        threads.retain(|existing| existing.handle != handle);
        threads.push(control.clone());
        let counts = SuspendCounts {
            suspend_count: table.global_suspend_count,
            debug_suspend_count: table.global_debug_suspend_count,
        };
        table.states.insert(
            handle,
            ThreadState {
                counts,
                exec: ExecState::Running,
                at_event: false,
            },
        );
        tracing::debug!(target = "nova.jdwp", thread = %handle, ?counts, "thread registered");
        control
    }

    /// Forget a dead thread. Waiters observe the death; a pending invocation is
    /// dropped so its requester gets an error instead of waiting forever.
    pub fn unregister_thread(&self, handle: ThreadHandle) {
        let removed = {
            let mut threads = lock(&self.threads, "SuspensionCoordinator.threads");
            let mut table = lock(&self.table, "SuspensionCoordinator.table");
            table.states.remove(&handle);
            let pos = threads.iter().position(|control| control.handle == handle);
            pos.map(|pos| threads.remove(pos))
        };
        self.changed.notify_all();
        if let Some(control) = removed {
            if control.abandon_invocation() {
                tracing::warn!(
                    target = "nova.jdwp",
                    thread = %handle,
                    "thread died with a pending invocation"
                );
            }
        }
    }

    pub fn threads(&self) -> Vec<Arc<ThreadControl>> {
        lock(&self.threads, "SuspensionCoordinator.threads").clone()
    }

    pub fn thread(&self, handle: ThreadHandle) -> Option<Arc<ThreadControl>> {
        lock(&self.threads, "SuspensionCoordinator.threads")
            .iter()
            .find(|control| control.handle == handle)
            .cloned()
    }

    pub fn status(&self, handle: ThreadHandle) -> Option<ThreadStatus> {
        let table = lock(&self.table, "SuspensionCoordinator.table");
        table.states.get(&handle).map(|state| ThreadStatus {
            counts: state.counts,
            exec: state.exec,
            at_event: state.at_event,
        })
    }

    pub fn counts(&self, handle: ThreadHandle) -> Option<SuspendCounts> {
        self.status(handle).map(|status| status.counts)
    }

    pub fn is_suspended_for_debugger(&self, handle: ThreadHandle) -> bool {
        self.counts(handle).is_some_and(|counts| {
            counts.suspend_count > 0 && counts.debug_suspend_count > 0
        })
    }

    /// Mutator poll. Parks while the general suspend count is positive.
    pub fn safepoint(&self, handle: ThreadHandle) -> ParkOutcome {
        let mut table = lock(&self.table, "SuspensionCoordinator.table");
        match table.states.get_mut(&handle) {
            Some(state) if state.counts.suspend_count > 0 => state.exec = ExecState::Parked,
            _ => return ParkOutcome::Continued,
        }
        self.changed.notify_all();

        loop {
            table = wait(&self.changed, table, "SuspensionCoordinator.table");
            match table.states.get_mut(&handle) {
                None => return ParkOutcome::Resumed,
                Some(state) if state.counts.suspend_count == 0 => {
                    state.exec = ExecState::Running;
                    return ParkOutcome::Resumed;
                }
                Some(_) => {}
            }
        }
    }

    pub fn enter_native(&self, handle: ThreadHandle) {
        let mut table = lock(&self.table, "SuspensionCoordinator.table");
        if let Some(state) = table.states.get_mut(&handle) {
            state.exec = ExecState::Native;
        }
        drop(table);
        self.changed.notify_all();
    }

    /// Back to managed code; blocks while the thread is suspended.
    pub fn leave_native(&self, handle: ThreadHandle) {
        let mut table = lock(&self.table, "SuspensionCoordinator.table");
        loop {
            match table.states.get_mut(&handle) {
                Some(state) if state.counts.suspend_count > 0 => {}
                Some(state) => {
                    state.exec = ExecState::Running;
                    return;
                }
                None => return,
            }
            table = wait(&self.changed, table, "SuspensionCoordinator.table");
        }
    }

    /// Called by a thread about to report an event: one more debug suspension
    /// on itself, marked as parked at an event.
    pub fn suspend_self_for_event(&self, handle: ThreadHandle) {
        let mut table = lock(&self.table, "SuspensionCoordinator.table");
        if let Some(state) = table.states.get_mut(&handle) {
            state.counts.suspend_count += 1;
            state.counts.debug_suspend_count += 1;
            state.at_event = true;
        }
    }

    /// The thread has left its event report for good.
    pub fn leave_event(&self, handle: ThreadHandle) {
        let mut table = lock(&self.table, "SuspensionCoordinator.table");
        if let Some(state) = table.states.get_mut(&handle) {
            state.at_event = false;
        }
    }

    /// Debugger suspend-all (`VirtualMachine.Suspend`). Waits, bounded, for the
    /// threads to stop; stragglers park at their next safepoint.
    pub fn suspend_all(&self) {
        self.request_suspend_all();
        self.wait_for_suspend_all();
    }

    /// The counting half of [`SuspensionCoordinator::suspend_all`].
    pub fn request_suspend_all(&self) {
        self.suspend_all_inner(None);
    }

    /// The waiting half of [`SuspensionCoordinator::suspend_all`].
    pub fn wait_for_suspend_all(&self) {
        if let Err(err) = self.wait_until_all_stopped() {
            tracing::warn!(target = "nova.jdwp", error = %err, "not every thread parked after suspend-all");
        }
    }

    /// Suspend-all that leaves `except` alone (it is the caller and suspends
    /// itself). Does not wait.
    pub fn suspend_all_except(&self, except: ThreadHandle) {
        self.suspend_all_inner(Some(except));
    }

    fn suspend_all_inner(&self, except: Option<ThreadHandle>) {
        let _threads = lock(&self.threads, "SuspensionCoordinator.threads");
        let mut table = lock(&self.table, "SuspensionCoordinator.table");
        table.global_suspend_count += 1;
        table.global_debug_suspend_count += 1;
        for (handle, state) in table.states.iter_mut() {
            if Some(*handle) == except {
                continue;
            }
            state.counts.suspend_count += 1;
            state.counts.debug_suspend_count += 1;
        }
        tracing::debug!(
            target = "nova.jdwp",
            global = table.global_debug_suspend_count,
            "suspended all threads for debugger"
        );
    }

    /// Undo one debugger suspend-all. Every thread the debugger holds loses
    /// one vote; with no suspend-all in force this only logs.
    pub fn resume_all(&self) {
        {
            let _threads = lock(&self.threads, "SuspensionCoordinator.threads");
            let mut table = lock(&self.table, "SuspensionCoordinator.table");
            if table.global_debug_suspend_count == 0 {
                tracing::warn!(target = "nova.jdwp", "resume-all without matching suspend-all");
                return;
            }
            table.global_suspend_count = table.global_suspend_count.saturating_sub(1);
            table.global_debug_suspend_count -= 1;
            for state in table.states.values_mut() {
                if state.counts.debug_suspend_count > 0 {
                    state.counts.debug_suspend_count -= 1;
                    state.counts.suspend_count = state.counts.suspend_count.saturating_sub(1);
                }
            }
        }
        self.changed.notify_all();
    }

    /// Suspend one thread (`ThreadReference.Suspend`) and wait for it to stop.
    /// A timeout takes the vote back.
    pub fn suspend_one(&self, handle: ThreadHandle) -> AgentResult<()> {
        self.request_suspend_one(handle)?;
        self.wait_for_suspend_one(handle)
    }

    /// The counting half of [`SuspensionCoordinator::suspend_one`].
    pub fn request_suspend_one(&self, handle: ThreadHandle) -> AgentResult<()> {
        let mut table = lock(&self.table, "SuspensionCoordinator.table");
        let Some(state) = table.states.get_mut(&handle) else {
            return Err(AgentError::ThreadNotAlive);
        };
        state.counts.suspend_count += 1;
        state.counts.debug_suspend_count += 1;
        Ok(())
    }

    /// The waiting half of [`SuspensionCoordinator::suspend_one`].
    pub fn wait_for_suspend_one(&self, handle: ThreadHandle) -> AgentResult<()> {
        let deadline = Instant::now() + self.timeout;
        let mut table = lock(&self.table, "SuspensionCoordinator.table");
        loop {
            match table.states.get(&handle) {
                None => return Err(AgentError::ThreadNotAlive),
                Some(state) if state.is_stopped() => return Ok(()),
                Some(_) => {}
            }
            let now = Instant::now();
            if now >= deadline {
                if let Some(state) = table.states.get_mut(&handle) {
                    // Already gone if the debugger's suspensions were undone
                    // in the meantime.
                    if state.counts.debug_suspend_count > 0 {
                        state.counts.debug_suspend_count -= 1;
                        state.counts.suspend_count = state.counts.suspend_count.saturating_sub(1);
                    }
                }
                drop(table);
                self.changed.notify_all();
                tracing::warn!(target = "nova.jdwp", thread = %handle, "timed out suspending thread");
                return Err(AgentError::Timeout);
            }
            let (next, _) = wait_timeout(
                &self.changed,
                table,
                deadline - now,
                "SuspensionCoordinator.table",
            );
            table = next;
        }
    }

    /// Give back one debugger suspension; a no-op when the debugger holds none.
    pub fn resume_one(&self, handle: ThreadHandle) {
        let mut table = lock(&self.table, "SuspensionCoordinator.table");
        let Some(state) = table.states.get_mut(&handle) else {
            return;
        };
        if state.counts.debug_suspend_count == 0 {
            tracing::debug!(target = "nova.jdwp", thread = %handle, "resume of a thread the debugger does not hold");
            return;
        }
        state.counts.debug_suspend_count -= 1;
        if state.counts.suspend_count == 0 {
            drop(table);
            // Checked after releasing the table so the violation report does
            // not run under the lock.
            let _ = consistency_violation(format!("suspend count underflow on {handle}"));
            return;
        }
        state.counts.suspend_count -= 1;
        drop(table);
        self.changed.notify_all();
    }

    /// Drop every debugger-origin suspension. Other subsystems' votes stay.
    pub fn undo_debugger_suspensions(&self) {
        {
            let _threads = lock(&self.threads, "SuspensionCoordinator.threads");
            let mut table = lock(&self.table, "SuspensionCoordinator.table");
            let global_debug = table.global_debug_suspend_count;
            table.global_suspend_count = table.global_suspend_count.saturating_sub(global_debug);
            table.global_debug_suspend_count = 0;
            for state in table.states.values_mut() {
                let debug = state.counts.debug_suspend_count;
                state.counts.suspend_count = state.counts.suspend_count.saturating_sub(debug);
                state.counts.debug_suspend_count = 0;
            }
        }
        tracing::debug!(target = "nova.jdwp", "undid all debugger suspensions");
        self.changed.notify_all();
    }

    pub fn suspend_all_for_gc(&self) {
        let _threads = lock(&self.threads, "SuspensionCoordinator.threads");
        let mut table = lock(&self.table, "SuspensionCoordinator.table");
        table.global_suspend_count += 1;
        for state in table.states.values_mut() {
            state.counts.suspend_count += 1;
        }
    }

    pub fn resume_all_for_gc(&self) {
        {
            let _threads = lock(&self.threads, "SuspensionCoordinator.threads");
            let mut table = lock(&self.table, "SuspensionCoordinator.table");
            table.global_suspend_count = table.global_suspend_count.saturating_sub(1);
            for state in table.states.values_mut() {
                state.counts.suspend_count = state.counts.suspend_count.saturating_sub(1);
            }
        }
        self.changed.notify_all();
    }

    /// Stop the world for the duration of the guard, without touching debug
    /// counts. Fails with [`AgentError::Timeout`] (and resumes) if some thread
    /// does not reach a safepoint in time.
    pub fn suspend_all_scoped(&self) -> AgentResult<SuspendAllGuard<'_>> {
        self.suspend_all_for_gc();
        let guard = SuspendAllGuard { coordinator: self };
        self.wait_until_all_stopped()?;
        Ok(guard)
    }

    fn wait_until_all_stopped(&self) -> AgentResult<()> {
        let deadline = Instant::now() + self.timeout;
        let mut table = lock(&self.table, "SuspensionCoordinator.table");
        loop {
            let all_stopped = table
                .states
                .values()
                .all(|state| state.counts.suspend_count == 0 || state.is_stopped());
            if all_stopped {
                return Ok(());
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(AgentError::Timeout);
            }
            let (next, _) = wait_timeout(
                &self.changed,
                table,
                deadline - now,
                "SuspensionCoordinator.table",
            );
            table = next;
        }
    }

    /// Bounded wait for a suspended thread to actually stop.
    pub fn wait_until_parked(&self, handle: ThreadHandle) -> AgentResult<()> {
        let deadline = Instant::now() + self.timeout;
        let mut table = lock(&self.table, "SuspensionCoordinator.table");
        loop {
            match table.states.get(&handle) {
                None => return Err(AgentError::ThreadNotAlive),
                Some(state) if state.is_stopped() => return Ok(()),
                Some(state) if state.counts.suspend_count == 0 => {
                    return Err(AgentError::ThreadNotSuspended)
                }
                Some(_) => {}
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(AgentError::Timeout);
            }
            let (next, _) = wait_timeout(
                &self.changed,
                table,
                deadline - now,
                "SuspensionCoordinator.table",
            );
            table = next;
        }
    }
}
