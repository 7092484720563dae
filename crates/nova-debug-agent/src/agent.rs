//! The runtime-facing side of the agent. One [`DebugAgent`] lives as long as
//! the runtime; debug sessions come and go underneath it.

use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use nova_jdwp::{SUSPEND_POLICY_ALL, SUSPEND_POLICY_NONE};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::alloc::{AllocFrame, AllocationTracker};
use crate::config::{AgentConfig, TransportKind};
use crate::error::{AgentError, AgentResult};
use crate::events::RuntimeEvent;
use crate::invoke::service_invocation;
use crate::poison::lock;
use crate::runtime::{ClassId, GcVisitor, HeapRef, Runtime, ThreadHandle};
use crate::session::DebugSession;
use crate::suspend::{SuspensionCoordinator, ThreadControl};
use crate::transport;

struct Inner {
    config: AgentConfig,
    runtime: Runtime,
    coordinator: Arc<SuspensionCoordinator>,
    allocations: Arc<Mutex<AllocationTracker>>,
    session: Mutex<Option<Arc<DebugSession>>>,
    shutdown: CancellationToken,
}

/// Cheap to clone; every clone drives the same agent.
#[derive(Clone)]
pub struct DebugAgent {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for DebugAgent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DebugAgent")
            .field("attached", &self.is_attached())
            .finish_non_exhaustive()
    }
}

impl DebugAgent {
    pub fn new(config: AgentConfig, runtime: Runtime) -> AgentResult<Self> {
        config.validate()?;
        let mut allocations = AllocationTracker::new();
        if config.allocation_tracking.enabled {
            allocations.enable(
                config.allocation_tracking.max_records,
                config.allocation_tracking.max_stack_depth,
            )?;
        }
        let coordinator = Arc::new(SuspensionCoordinator::new(config.suspend_timeout()));
        Ok(Self {
            inner: Arc::new(Inner {
                config,
                runtime,
                coordinator,
                allocations: Arc::new(Mutex::new(allocations)),
                session: Mutex::new(None),
                shutdown: CancellationToken::new(),
            }),
        })
    }

    pub fn config(&self) -> &AgentConfig {
        &self.inner.config
    }

    pub fn coordinator(&self) -> &Arc<SuspensionCoordinator> {
        &self.inner.coordinator
    }

    /// The attached session, if a debugger is connected.
    pub fn session(&self) -> Option<Arc<DebugSession>> {
        lock(&self.inner.session, "DebugAgent.session")
            .as_ref()
            .filter(|session| !session.is_detached())
            .cloned()
    }

    pub fn is_attached(&self) -> bool {
        self.session().is_some()
    }

    /// Register the calling thread and report its start.
    pub fn attach_thread(
        &self,
        thread: ThreadHandle,
        name: impl Into<String>,
        peer: HeapRef,
    ) -> Arc<ThreadControl> {
        let control = self.inner.coordinator.register_thread(thread, name, peer);
        self.post(RuntimeEvent::ThreadStarted { thread });
        control
    }

    /// Report the calling thread's death and forget it.
    pub fn detach_thread(&self, thread: ThreadHandle) {
        self.post(RuntimeEvent::ThreadDied { thread });
        if let Some(session) = self.session() {
            session.forget_thread(thread);
        }
        self.inner.coordinator.unregister_thread(thread);
    }

    /// Mutator poll: park while suspended, running any invocation the
    /// debugger hands over in the meantime.
    pub fn safepoint(&self, thread: ThreadHandle) {
        let coordinator = &self.inner.coordinator;
        loop {
            coordinator.safepoint(thread);
            let Some(control) = coordinator.thread(thread) else {
                return;
            };
            if !service_invocation(coordinator, &control, &*self.inner.runtime.interpreter) {
                return;
            }
        }
    }

    /// Report a runtime event on the thread it happened on. When a request
    /// asks for suspension the thread suspends before the event is sent and
    /// parks until the debugger resumes it.
    pub fn post(&self, event: RuntimeEvent) {
        let Some(session) = self.session() else {
            return;
        };
        let Some((policy, body)) = session.dispatch(&event) else {
            return;
        };
        let thread = event.thread();
        if !session.suspend_for_event(thread, policy) {
            // Detached since the match; nobody is left to resume the thread.
            return;
        }
        session.send_event(&body);
        if policy != SUSPEND_POLICY_NONE {
            self.safepoint(thread);
            self.inner.coordinator.leave_event(thread);
        }
    }

    /// Once per collection cycle, with mutators stopped.
    pub fn sweep(&self, gc: &dyn GcVisitor) {
        if let Some(session) = self.session() {
            session.sweep(gc);
        }
        for control in self.inner.coordinator.threads() {
            control.relocate_peer(gc);
        }
    }

    /// Objects the debugger pinned with `DisableCollection`.
    pub fn visit_roots(&self, visit: &mut dyn FnMut(HeapRef)) {
        if let Some(session) = self.session() {
            session.visit_roots(visit);
        }
    }

    pub fn record_allocation(
        &self,
        thread: ThreadHandle,
        class: ClassId,
        size: u32,
        frames: impl IntoIterator<Item = AllocFrame>,
    ) {
        lock(&self.inner.allocations, "DebugAgent.allocations").record(thread, class, size, frames);
    }

    /// Run one debug session over an already connected stream.
    pub async fn serve<S>(&self, mut stream: S) -> AgentResult<()>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        if self.is_attached() {
            return Err(AgentError::IllegalArgument(
                "a debugger is already attached".to_owned(),
            ));
        }
        let inner = &self.inner;
        transport::handshake(&mut stream, inner.config.handshake_timeout()).await?;

        let (tx, rx) = mpsc::unbounded_channel();
        let session = Arc::new(DebugSession::new(
            inner.config.clone(),
            inner.runtime.clone(),
            Arc::clone(&inner.coordinator),
            Arc::clone(&inner.allocations),
            tx,
        ));
        *lock(&inner.session, "DebugAgent.session") = Some(Arc::clone(&session));
        tracing::info!(target = "nova.jdwp", suspend = inner.config.jdwp.suspend, "debugger attached");

        let suspend = inner.config.jdwp.suspend;
        let coordinator = Arc::clone(&inner.coordinator);
        let starting = Arc::clone(&session);
        let vm_start = tokio::task::spawn_blocking(move || {
            let policy = if suspend {
                starting.suspend_all()?;
                SUSPEND_POLICY_ALL
            } else {
                SUSPEND_POLICY_NONE
            };
            let initial = coordinator.threads().first().map(|control| control.handle());
            Ok::<_, AgentError>(starting.vm_start_event(initial, policy))
        })
        .await
        .map_err(|err| AgentError::Internal(format!("vm start task failed: {err}")))??;
        session.send_event(&vm_start);

        let result = transport::run(Arc::clone(&session), stream, rx).await;
        let mut slot = lock(&inner.session, "DebugAgent.session");
        if slot.as_ref().is_some_and(|current| Arc::ptr_eq(current, &session)) {
            *slot = None;
        }
        result
    }

    /// Accept debuggers on the configured address, one at a time, until
    /// [`DebugAgent::shutdown`].
    pub async fn listen(&self) -> AgentResult<()> {
        let listener = transport::bind(&self.inner.config.jdwp.address).await?;
        loop {
            let (stream, peer) = tokio::select! {
                _ = self.inner.shutdown.cancelled() => return Ok(()),
                accepted = listener.accept() => accepted?,
            };
            stream.set_nodelay(true)?;
            tracing::info!(target = "nova.jdwp", %peer, "debugger connected");
            if let Err(err) = self.serve(stream).await {
                tracing::warn!(target = "nova.jdwp", %peer, error = %err, "debug session ended with an error");
            }
        }
    }

    /// Dial out to a listening debugger.
    pub async fn connect(&self) -> AgentResult<()> {
        let stream = transport::dial(&self.inner.config.jdwp.address).await?;
        self.serve(stream).await
    }

    /// Start whichever socket transport the configuration names.
    pub async fn run(&self) -> AgentResult<()> {
        match (self.inner.config.jdwp.transport, self.inner.config.jdwp.server) {
            (TransportKind::Socket, true) => self.listen().await,
            (TransportKind::Socket, false) => self.connect().await,
            (TransportKind::Embedded, _) => Err(AgentError::IllegalArgument(
                "the embedded transport is driven through DebugAgent::serve".to_owned(),
            )),
        }
    }

    /// Run [`DebugAgent::run`] on a dedicated `jdwp` thread with its own tokio
    /// runtime.
    pub fn spawn(&self) -> AgentResult<JoinHandle<()>> {
        let agent = self.clone();
        let handle = std::thread::Builder::new()
            .name("jdwp".to_owned())
            .spawn(move || {
                let runtime = match tokio::runtime::Builder::new_multi_thread()
                    .worker_threads(1)
                    .thread_name("jdwp-io")
                    .enable_all()
                    .build()
                {
                    Ok(runtime) => runtime,
                    Err(err) => {
                        tracing::error!(target = "nova.jdwp", error = %err, "failed to start the agent runtime");
                        return;
                    }
                };
                if let Err(err) = runtime.block_on(agent.run()) {
                    tracing::error!(target = "nova.jdwp", error = %err, "debug agent stopped");
                }
            })?;
        Ok(handle)
    }

    /// Drop the current debugger, if any. Blocks while instrumentation is
    /// removed.
    pub fn detach(&self) {
        let session = lock(&self.inner.session, "DebugAgent.session").take();
        if let Some(session) = session {
            session.detach();
        }
    }

    /// The runtime is going away: report `VM_DEATH`, detach and stop
    /// accepting debuggers.
    pub fn shutdown(&self) {
        if let Some(session) = self.session() {
            let body = session.vm_death_event();
            session.send_event(&body);
        }
        self.detach();
        self.inner.shutdown.cancel();
        tracing::info!(target = "nova.jdwp", "debug agent shut down");
    }
}
