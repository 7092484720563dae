use std::sync::{mpsc, Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use nova_debug_agent::mock::MockRuntime;
use nova_debug_agent::runtime::{FieldInfo, Heap, Interpreter};
use nova_debug_agent::{
    AgentConfig, AgentError, ClassId, CodeLocation, DebugAgent, Frame, HeapRef, InvocationCall,
    InvokeOutcome, JdwpOptions, Runtime, RuntimeEvent, ThreadHandle, Value,
};
use nova_jdwp::io::{initiate_handshake, read_packet, write_packet};
use nova_jdwp::{
    encode_command, CommandPacket, JdwpIdSizes, JdwpReader, JdwpWriter, Location, MethodId,
    ObjectId, Packet, ReplyPacket, ACC_STATIC, COMMAND_EVENT_COMPOSITE, COMMAND_SET_EVENT,
    ERROR_NONE, EVENT_KIND_BREAKPOINT, EVENT_KIND_EXCEPTION, EVENT_KIND_METHOD_ENTRY,
    EVENT_KIND_SINGLE_STEP, EVENT_KIND_VM_START, EVENT_MODIFIER_KIND_LOCATION_ONLY,
    EVENT_MODIFIER_KIND_STEP, INVOKE_SINGLE_THREADED, STEP_DEPTH_OUT, STEP_DEPTH_OVER,
    STEP_SIZE_LINE, SUSPEND_POLICY_ALL, SUSPEND_POLICY_EVENT_THREAD, SUSPEND_POLICY_NONE,
    TAG_INT, TAG_OBJECT, TYPE_TAG_CLASS,
};
use tokio::io::DuplexStream;
use tokio::task::JoinHandle;

const MAIN: ThreadHandle = ThreadHandle(1);
const OTHER: ThreadHandle = ThreadHandle(2);
const TIMEOUT: Duration = Duration::from_secs(5);

struct Debugger {
    stream: DuplexStream,
    next_id: u32,
    sizes: JdwpIdSizes,
}

impl Debugger {
    async fn attach(mut stream: DuplexStream) -> Self {
        initiate_handshake(&mut stream, TIMEOUT).await.unwrap();
        Self {
            stream,
            next_id: 1,
            sizes: JdwpIdSizes::uniform(8),
        }
    }

    async fn next_packet(&mut self) -> Packet {
        tokio::time::timeout(TIMEOUT, read_packet(&mut self.stream))
            .await
            .expect("packet within timeout")
            .unwrap()
            .expect("connection open")
    }

    async fn next_event(&mut self) -> Vec<u8> {
        match self.next_packet().await {
            Packet::Command(CommandPacket {
                command_set: COMMAND_SET_EVENT,
                command: COMMAND_EVENT_COMPOSITE,
                payload,
                ..
            }) => payload,
            other => panic!("expected an event, got {other:?}"),
        }
    }

    /// Write a command without waiting for its reply.
    async fn write(&mut self, set: u8, cmd: u8, payload: &[u8]) -> u32 {
        let id = self.next_id;
        self.next_id += 1;
        write_packet(&mut self.stream, &encode_command(id, set, cmd, payload))
            .await
            .unwrap();
        id
    }

    async fn send(&mut self, set: u8, cmd: u8, payload: &[u8]) -> ReplyPacket {
        let id = self.write(set, cmd, payload).await;
        loop {
            match self.next_packet().await {
                Packet::Reply(reply) => {
                    assert_eq!(reply.id, id);
                    return reply;
                }
                // Events may interleave with replies.
                Packet::Command(_) => continue,
            }
        }
    }
}

fn agent(suspend: bool) -> (Arc<MockRuntime>, DebugAgent) {
    let mock = Arc::new(MockRuntime::new());
    let agent = agent_over(&mock, mock.runtime(), suspend);
    (mock, agent)
}

fn agent_over(mock: &Arc<MockRuntime>, runtime: Runtime, suspend: bool) -> DebugAgent {
    let config = AgentConfig {
        jdwp: JdwpOptions {
            suspend,
            ..JdwpOptions::default()
        },
        suspend_timeout_ms: 500,
        ..AgentConfig::default()
    };
    let agent = DebugAgent::new(config, runtime).unwrap();
    let peer = mock.new_thread_object();
    agent.attach_thread(MAIN, "main", peer);
    agent.coordinator().enter_native(MAIN);
    agent
}

fn serve(agent: &DebugAgent) -> (JoinHandle<Result<(), AgentError>>, DuplexStream) {
    let (agent_side, debugger_side) = tokio::io::duplex(64 * 1024);
    let agent = agent.clone();
    let task = tokio::spawn(async move { agent.serve(agent_side).await });
    (task, debugger_side)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn debugger_attaches_queries_and_disposes() {
    let (_mock, agent) = agent(false);
    let (task, stream) = serve(&agent);
    let mut debugger = Debugger::attach(stream).await;

    let start = debugger.next_event().await;
    let mut r = JdwpReader::new(&start);
    assert_eq!(r.read_u8().unwrap(), SUSPEND_POLICY_NONE);
    assert_eq!(r.read_u32().unwrap(), 1);
    assert_eq!(r.read_u8().unwrap(), EVENT_KIND_VM_START);
    assert_eq!(r.read_u32().unwrap(), 0);
    assert_ne!(r.read_object_id(&debugger.sizes).unwrap(), 0);
    assert!(agent.is_attached());

    let reply = debugger.send(1, 1, &[]).await;
    assert_eq!(reply.error_code, ERROR_NONE);
    let mut r = JdwpReader::new(&reply.payload);
    assert!(r.read_string().unwrap().starts_with("Nova VM"));

    let reply = debugger.send(1, 99, &[]).await;
    assert_eq!(reply.error_code, nova_jdwp::ERROR_NOT_IMPLEMENTED);

    let reply = debugger.send(1, 6, &[]).await;
    assert_eq!(reply.error_code, ERROR_NONE);
    tokio::time::timeout(TIMEOUT, task).await.unwrap().unwrap().unwrap();
    assert!(!agent.is_attached());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn suspend_at_start_holds_threads_until_resumed() {
    let (_mock, agent) = agent(true);
    let (task, stream) = serve(&agent);
    let mut debugger = Debugger::attach(stream).await;

    let start = debugger.next_event().await;
    assert_eq!(start[0], SUSPEND_POLICY_ALL);
    assert!(agent.coordinator().is_suspended_for_debugger(MAIN));

    let reply = debugger.send(1, 9, &[]).await;
    assert_eq!(reply.error_code, ERROR_NONE);
    assert!(!agent.coordinator().is_suspended_for_debugger(MAIN));

    drop(debugger);
    tokio::time::timeout(TIMEOUT, task).await.unwrap().unwrap().unwrap();
    assert!(!agent.is_attached());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn dropping_the_connection_gives_suspended_threads_back() {
    let (_mock, agent) = agent(true);
    let (task, stream) = serve(&agent);
    let mut debugger = Debugger::attach(stream).await;
    debugger.next_event().await;
    assert!(agent.coordinator().is_suspended_for_debugger(MAIN));

    drop(debugger);
    tokio::time::timeout(TIMEOUT, task).await.unwrap().unwrap().unwrap();
    assert!(!agent.coordinator().is_suspended_for_debugger(MAIN));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn a_second_debugger_is_turned_away() {
    let (_mock, agent) = agent(false);
    let (task, stream) = serve(&agent);
    let mut debugger = Debugger::attach(stream).await;
    debugger.next_event().await;

    let (_, other) = tokio::io::duplex(1024);
    let err = agent.serve(other).await.unwrap_err();
    assert!(matches!(err, AgentError::IllegalArgument(_)));

    debugger.send(1, 6, &[]).await;
    tokio::time::timeout(TIMEOUT, task).await.unwrap().unwrap().unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn posted_events_reach_the_debugger() {
    let (mock, agent) = agent(false);
    let class = mock.add_class("Lcom/example/Main;");
    let method = mock.add_method(class, "run", "()V", 0, 4, &[(0, 1)]);
    let (task, stream) = serve(&agent);
    let mut debugger = Debugger::attach(stream).await;
    debugger.next_event().await;

    let mut w = JdwpWriter::new();
    w.write_u8(EVENT_KIND_METHOD_ENTRY);
    w.write_u8(SUSPEND_POLICY_NONE);
    w.write_i32(0);
    let reply = debugger.send(15, 1, &w.into_vec()).await;
    assert_eq!(reply.error_code, ERROR_NONE);
    let request = JdwpReader::new(&reply.payload).read_u32().unwrap();

    let poster = agent.clone();
    tokio::task::spawn_blocking(move || {
        poster.post(RuntimeEvent::MethodEntry {
            thread: MAIN,
            at: CodeLocation { method, pc: 0 },
        })
    })
    .await
    .unwrap();

    let event = debugger.next_event().await;
    let mut r = JdwpReader::new(&event);
    assert_eq!(r.read_u8().unwrap(), SUSPEND_POLICY_NONE);
    assert_eq!(r.read_u32().unwrap(), 1);
    assert_eq!(r.read_u8().unwrap(), EVENT_KIND_METHOD_ENTRY);
    assert_eq!(r.read_u32().unwrap(), request);
    r.read_object_id(&debugger.sizes).unwrap();
    let location = r.read_location(&debugger.sizes).unwrap();
    assert_eq!((location.class_id, location.method_id), (class, method));

    debugger.send(1, 6, &[]).await;
    tokio::time::timeout(TIMEOUT, task).await.unwrap().unwrap().unwrap();
}

/// The first event of a composite, for kinds that report a thread and a
/// location.
struct Reported {
    policy: u8,
    kind: u8,
    request: u32,
    thread: ObjectId,
    location: Location,
}

impl Debugger {
    async fn next_reported(&mut self) -> Reported {
        let event = self.next_event().await;
        let mut r = JdwpReader::new(&event);
        let policy = r.read_u8().unwrap();
        assert_eq!(r.read_u32().unwrap(), 1);
        Reported {
            policy,
            kind: r.read_u8().unwrap(),
            request: r.read_u32().unwrap(),
            thread: r.read_object_id(&self.sizes).unwrap(),
            location: r.read_location(&self.sizes).unwrap(),
        }
    }

    /// `EventRequest.Set` with already encoded modifiers.
    async fn set_request(&mut self, kind: u8, policy: u8, modifiers: &[&[u8]]) -> u32 {
        let mut w = JdwpWriter::new();
        w.write_u8(kind);
        w.write_u8(policy);
        w.write_i32(modifiers.len() as i32);
        for modifier in modifiers {
            w.write_bytes(modifier);
        }
        let reply = self.send(15, 1, &w.into_vec()).await;
        assert_eq!(reply.error_code, ERROR_NONE);
        JdwpReader::new(&reply.payload).read_u32().unwrap()
    }

    fn location_only(&self, class: ClassId, method: MethodId, index: u64) -> Vec<u8> {
        let mut w = JdwpWriter::new();
        w.write_u8(EVENT_MODIFIER_KIND_LOCATION_ONLY);
        w.write_location(
            &Location {
                type_tag: TYPE_TAG_CLASS,
                class_id: class,
                method_id: method,
                index,
            },
            &self.sizes,
        );
        w.into_vec()
    }

    fn step(&self, thread: ObjectId, depth: u32) -> Vec<u8> {
        let mut w = JdwpWriter::new();
        w.write_u8(EVENT_MODIFIER_KIND_STEP);
        w.write_object_id(thread, &self.sizes);
        w.write_u32(STEP_SIZE_LINE);
        w.write_u32(depth);
        w.into_vec()
    }

    fn thread_id(&self, thread: ObjectId) -> Vec<u8> {
        let mut w = JdwpWriter::new();
        w.write_object_id(thread, &self.sizes);
        w.into_vec()
    }

    fn invoke_static(&self, class: ClassId, thread: ObjectId, method: MethodId) -> Vec<u8> {
        let mut w = JdwpWriter::new();
        w.write_reference_type_id(class, &self.sizes);
        w.write_object_id(thread, &self.sizes);
        w.write_id(method, self.sizes.method_id);
        w.write_i32(0);
        w.write_u32(INVOKE_SINGLE_THREADED);
        w.into_vec()
    }
}

/// Wait for a parked application thread without blocking the runtime.
async fn joined<T>(handle: thread::JoinHandle<T>) -> T {
    let deadline = Instant::now() + TIMEOUT;
    while !handle.is_finished() {
        assert!(Instant::now() < deadline, "thread still blocked");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    handle.join().unwrap()
}

fn post_from(agent: &DebugAgent, event: RuntimeEvent) -> thread::JoinHandle<()> {
    let agent = agent.clone();
    let thread = event.thread();
    thread::spawn(move || {
        agent.post(event);
        agent.coordinator().enter_native(thread);
    })
}

fn attach_native(mock: &MockRuntime, agent: &DebugAgent, thread: ThreadHandle, name: &str) {
    agent.attach_thread(thread, name, mock.new_thread_object());
    agent.coordinator().enter_native(thread);
}

fn settled(agent: &DebugAgent, thread: ThreadHandle) -> bool {
    agent
        .coordinator()
        .counts(thread)
        .is_some_and(|counts| counts.suspend_count == 0 && counts.debug_suspend_count == 0)
}

/// One-shot latch: `hold` parks the caller until the test lets it go.
struct Latch {
    entered: Mutex<Option<mpsc::Sender<()>>>,
    release: Mutex<mpsc::Receiver<()>>,
}

impl Latch {
    fn new() -> (Latch, mpsc::Receiver<()>, mpsc::Sender<()>) {
        let (entered_tx, entered) = mpsc::channel();
        let (release, release_rx) = mpsc::channel();
        let latch = Latch {
            entered: Mutex::new(Some(entered_tx)),
            release: Mutex::new(release_rx),
        };
        (latch, entered, release)
    }

    fn hold(&self) {
        let Some(entered) = self.entered.lock().unwrap().take() else {
            return;
        };
        let _ = entered.send(());
        let _ = self.release.lock().unwrap().recv_timeout(TIMEOUT);
    }
}

async fn entered(rx: mpsc::Receiver<()>) {
    tokio::task::spawn_blocking(move || rx.recv_timeout(TIMEOUT))
        .await
        .unwrap()
        .expect("latch reached");
}

/// Runs every invocation through a latch.
struct LatchedInterpreter {
    mock: Arc<MockRuntime>,
    latch: Latch,
}

impl Interpreter for LatchedInterpreter {
    fn frames(&self, thread: ThreadHandle) -> Vec<Frame> {
        Interpreter::frames(&*self.mock, thread)
    }

    fn get_local(&self, thread: ThreadHandle, depth: usize, slot: u32, tag: u8) -> Option<Value> {
        Interpreter::get_local(&*self.mock, thread, depth, slot, tag)
    }

    fn set_local(&self, thread: ThreadHandle, depth: usize, slot: u32, value: Value) -> bool {
        Interpreter::set_local(&*self.mock, thread, depth, slot, value)
    }

    fn invoke(&self, thread: ThreadHandle, call: &InvocationCall) -> InvokeOutcome {
        self.latch.hold();
        Interpreter::invoke(&*self.mock, thread, call)
    }

    fn take_pending_exception(&self, thread: ThreadHandle) -> Option<HeapRef> {
        Interpreter::take_pending_exception(&*self.mock, thread)
    }

    fn set_pending_exception(&self, thread: ThreadHandle, exception: Option<HeapRef>) {
        Interpreter::set_pending_exception(&*self.mock, thread, exception)
    }
}

/// Holds the first tag lookup of one object on a latch.
struct LatchedHeap {
    mock: Arc<MockRuntime>,
    target: HeapRef,
    latch: Latch,
}

impl Heap for LatchedHeap {
    fn class_of(&self, obj: HeapRef) -> Option<ClassId> {
        Heap::class_of(&*self.mock, obj)
    }

    fn tag_of(&self, obj: HeapRef) -> u8 {
        if obj == self.target {
            self.latch.hold();
        }
        Heap::tag_of(&*self.mock, obj)
    }

    fn get_field(&self, receiver: Option<HeapRef>, field: &FieldInfo) -> Value {
        Heap::get_field(&*self.mock, receiver, field)
    }

    fn set_field(&self, receiver: Option<HeapRef>, field: &FieldInfo, value: Value) {
        Heap::set_field(&*self.mock, receiver, field, value)
    }

    fn string_value(&self, obj: HeapRef) -> Option<String> {
        Heap::string_value(&*self.mock, obj)
    }

    fn instances_of(&self, class: ClassId, max: usize) -> Vec<HeapRef> {
        Heap::instances_of(&*self.mock, class, max)
    }

    fn collect_now(&self) {
        Heap::collect_now(&*self.mock)
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn breakpoint_hit_suspends_everyone_until_resumed() {
    let (mock, agent) = agent(false);
    attach_native(&mock, &agent, OTHER, "worker");
    let class = mock.add_class("Lcom/example/Main;");
    let method = mock.add_method(class, "run", "()V", 0, 10, &[(0, 1), (4, 2)]);
    let (task, stream) = serve(&agent);
    let mut debugger = Debugger::attach(stream).await;
    debugger.next_event().await;

    let modifier = debugger.location_only(class, method, 4);
    let request = debugger
        .set_request(EVENT_KIND_BREAKPOINT, SUSPEND_POLICY_ALL, &[&modifier])
        .await;

    // Another pc of the same method is not a breakpoint.
    joined(post_from(
        &agent,
        RuntimeEvent::Location {
            thread: MAIN,
            at: CodeLocation { method, pc: 2 },
        },
    ))
    .await;

    let poster = post_from(
        &agent,
        RuntimeEvent::Location {
            thread: MAIN,
            at: CodeLocation { method, pc: 4 },
        },
    );
    let hit = debugger.next_reported().await;
    assert_eq!(hit.policy, SUSPEND_POLICY_ALL);
    assert_eq!((hit.kind, hit.request), (EVENT_KIND_BREAKPOINT, request));
    assert_eq!((hit.location.method_id, hit.location.index), (method, 4));
    assert!(agent.coordinator().is_suspended_for_debugger(MAIN));
    assert!(agent.coordinator().is_suspended_for_debugger(OTHER));
    assert!(!poster.is_finished());

    let reply = debugger.send(1, 9, &[]).await;
    assert_eq!(reply.error_code, ERROR_NONE);
    joined(poster).await;
    assert!(settled(&agent, MAIN) && settled(&agent, OTHER));

    debugger.send(1, 6, &[]).await;
    tokio::time::timeout(TIMEOUT, task).await.unwrap().unwrap().unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn dropping_the_connection_at_a_breakpoint_releases_everyone() {
    let (mock, agent) = agent(false);
    attach_native(&mock, &agent, OTHER, "worker");
    let class = mock.add_class("Lcom/example/Main;");
    let method = mock.add_method(class, "run", "()V", 0, 10, &[(0, 1)]);
    let (task, stream) = serve(&agent);
    let mut debugger = Debugger::attach(stream).await;
    debugger.next_event().await;

    let modifier = debugger.location_only(class, method, 0);
    debugger
        .set_request(EVENT_KIND_BREAKPOINT, SUSPEND_POLICY_ALL, &[&modifier])
        .await;
    let poster = post_from(
        &agent,
        RuntimeEvent::Location {
            thread: MAIN,
            at: CodeLocation { method, pc: 0 },
        },
    );
    debugger.next_reported().await;
    assert!(agent.coordinator().is_suspended_for_debugger(OTHER));

    drop(debugger);
    tokio::time::timeout(TIMEOUT, task).await.unwrap().unwrap().unwrap();
    joined(poster).await;
    assert!(!agent.is_attached());
    assert!(settled(&agent, MAIN) && settled(&agent, OTHER));
    // The breakpoint went with the session.
    joined(post_from(
        &agent,
        RuntimeEvent::Location {
            thread: MAIN,
            at: CodeLocation { method, pc: 0 },
        },
    ))
    .await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn class_type_invoke_method_runs_on_the_parked_thread() {
    let (mock, agent) = agent(false);
    let class = mock.add_class("Lcom/example/Calc;");
    let run = mock.add_method(class, "run", "()V", 0, 4, &[(0, 1)]);
    let answer = mock.add_method(class, "answer", "()I", ACC_STATIC, 2, &[(0, 9)]);
    mock.set_invoke_result(
        answer,
        InvokeOutcome {
            value: Value::Int(42),
            exception: None,
        },
    );
    let (task, stream) = serve(&agent);
    let mut debugger = Debugger::attach(stream).await;
    debugger.next_event().await;

    debugger
        .set_request(EVENT_KIND_METHOD_ENTRY, SUSPEND_POLICY_EVENT_THREAD, &[])
        .await;
    let poster = post_from(
        &agent,
        RuntimeEvent::MethodEntry {
            thread: MAIN,
            at: CodeLocation { method: run, pc: 0 },
        },
    );
    let entry = debugger.next_reported().await;
    assert_eq!(entry.policy, SUSPEND_POLICY_EVENT_THREAD);

    let invoke = debugger.invoke_static(class, entry.thread, answer);
    let reply = debugger.send(3, 3, &invoke).await;
    assert_eq!(reply.error_code, ERROR_NONE);
    let mut r = JdwpReader::new(&reply.payload);
    assert_eq!(r.read_u8().unwrap(), TAG_INT);
    assert_eq!(r.read_i32().unwrap(), 42);
    assert_eq!(r.read_u8().unwrap(), TAG_OBJECT);
    assert_eq!(r.read_object_id(&debugger.sizes).unwrap(), 0);
    assert!(r.is_empty());

    assert_eq!(mock.invocations().len(), 1);
    assert_eq!(mock.invocations()[0].0, MAIN);
    // Back at the event it was invoked from.
    assert!(agent.coordinator().is_suspended_for_debugger(MAIN));
    assert!(!poster.is_finished());

    let resume = debugger.thread_id(entry.thread);
    let reply = debugger.send(11, 3, &resume).await;
    assert_eq!(reply.error_code, ERROR_NONE);
    joined(poster).await;
    assert!(settled(&agent, MAIN));

    debugger.send(1, 6, &[]).await;
    tokio::time::timeout(TIMEOUT, task).await.unwrap().unwrap().unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn step_over_skips_calls_and_step_out_stops_in_the_caller() {
    let (mock, agent) = agent(false);
    let class = mock.add_class("Lcom/example/Main;");
    let main = mock.add_method(class, "main", "()V", ACC_STATIC, 8, &[(0, 3), (4, 4)]);
    let run = mock.add_method(class, "run", "()V", 0, 12, &[(0, 10), (4, 11), (8, 12)]);
    let helper = mock.add_method(class, "helper", "()V", 0, 4, &[(0, 20)]);
    let frame = |method, pc| Frame {
        method,
        pc,
        this: None,
    };
    let (task, stream) = serve(&agent);
    let mut debugger = Debugger::attach(stream).await;
    debugger.next_event().await;

    let entry = debugger
        .set_request(EVENT_KIND_METHOD_ENTRY, SUSPEND_POLICY_EVENT_THREAD, &[])
        .await;
    let poster = {
        let agent = agent.clone();
        let mock = mock.clone();
        thread::spawn(move || {
            let at = |stack: Vec<Frame>| {
                let top = stack[0];
                mock.set_frames(MAIN, stack);
                CodeLocation {
                    method: top.method,
                    pc: top.pc,
                }
            };
            let step = |at: CodeLocation| agent.post(RuntimeEvent::Location { thread: MAIN, at });

            let start = at(vec![frame(run, 0), frame(main, 2)]);
            agent.post(RuntimeEvent::MethodEntry {
                thread: MAIN,
                at: start,
            });
            // Stepping over: the call is deeper, then back on a new line.
            step(at(vec![frame(helper, 0), frame(run, 2), frame(main, 2)]));
            step(at(vec![frame(run, 4), frame(main, 2)]));
            // Stepping out: still in `run`, then in the caller.
            step(at(vec![frame(run, 8), frame(main, 2)]));
            step(at(vec![frame(main, 4)]));
            agent.coordinator().enter_native(MAIN);
        })
    };

    let parked = debugger.next_reported().await;
    let mut w = JdwpWriter::new();
    w.write_u8(EVENT_KIND_METHOD_ENTRY);
    w.write_u32(entry);
    assert_eq!(debugger.send(15, 2, &w.into_vec()).await.error_code, ERROR_NONE);

    let over = debugger.step(parked.thread, STEP_DEPTH_OVER);
    let over = debugger
        .set_request(EVENT_KIND_SINGLE_STEP, SUSPEND_POLICY_EVENT_THREAD, &[&over])
        .await;
    let resume = debugger.thread_id(parked.thread);
    assert_eq!(debugger.send(11, 3, &resume).await.error_code, ERROR_NONE);

    let stepped = debugger.next_reported().await;
    assert_eq!((stepped.kind, stepped.request), (EVENT_KIND_SINGLE_STEP, over));
    assert_eq!((stepped.location.method_id, stepped.location.index), (run, 4));

    let mut w = JdwpWriter::new();
    w.write_u8(EVENT_KIND_SINGLE_STEP);
    w.write_u32(over);
    assert_eq!(debugger.send(15, 2, &w.into_vec()).await.error_code, ERROR_NONE);
    let out = debugger.step(parked.thread, STEP_DEPTH_OUT);
    let out = debugger
        .set_request(EVENT_KIND_SINGLE_STEP, SUSPEND_POLICY_EVENT_THREAD, &[&out])
        .await;
    assert_eq!(debugger.send(11, 3, &resume).await.error_code, ERROR_NONE);

    let stepped = debugger.next_reported().await;
    assert_eq!((stepped.kind, stepped.request), (EVENT_KIND_SINGLE_STEP, out));
    assert_eq!((stepped.location.method_id, stepped.location.index), (main, 4));

    assert_eq!(debugger.send(11, 3, &resume).await.error_code, ERROR_NONE);
    joined(poster).await;
    assert!(settled(&agent, MAIN));

    debugger.send(1, 6, &[]).await;
    tokio::time::timeout(TIMEOUT, task).await.unwrap().unwrap().unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn losing_the_connection_mid_invoke_still_detaches() {
    let mock = Arc::new(MockRuntime::new());
    let (latch, invoking, release) = Latch::new();
    let runtime = Runtime {
        interpreter: Arc::new(LatchedInterpreter {
            mock: mock.clone(),
            latch,
        }),
        ..mock.runtime()
    };
    let agent = agent_over(&mock, runtime, false);
    attach_native(&mock, &agent, OTHER, "worker");
    let class = mock.add_class("Lcom/example/Calc;");
    let run = mock.add_method(class, "run", "()V", 0, 4, &[(0, 1)]);
    let answer = mock.add_method(class, "answer", "()I", ACC_STATIC, 2, &[(0, 9)]);
    let (task, stream) = serve(&agent);
    let mut debugger = Debugger::attach(stream).await;
    debugger.next_event().await;

    debugger
        .set_request(EVENT_KIND_METHOD_ENTRY, SUSPEND_POLICY_ALL, &[])
        .await;
    let poster = post_from(
        &agent,
        RuntimeEvent::MethodEntry {
            thread: MAIN,
            at: CodeLocation { method: run, pc: 0 },
        },
    );
    let entry = debugger.next_reported().await;
    let invoke = debugger.invoke_static(class, entry.thread, answer);
    debugger.write(3, 3, &invoke).await;
    entered(invoking).await;
    assert_eq!(agent.coordinator().counts(OTHER).unwrap().debug_suspend_count, 1);

    drop(debugger);
    tokio::time::timeout(TIMEOUT, task).await.unwrap().unwrap().unwrap();
    assert!(!agent.is_attached());
    assert!(settled(&agent, OTHER));

    // The invocation finishing late must not leave its thread suspended.
    release.send(()).unwrap();
    joined(poster).await;
    assert!(settled(&agent, MAIN));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn an_event_reported_while_detaching_does_not_suspend() {
    let mock = Arc::new(MockRuntime::new());
    let class = mock.add_class("Ljava/lang/IllegalStateException;");
    let thrower = mock.add_method(class, "check", "()V", 0, 4, &[(0, 1)]);
    let exception = mock.new_object(class);
    let (latch, reporting, release) = Latch::new();
    let runtime = Runtime {
        heap: Arc::new(LatchedHeap {
            mock: mock.clone(),
            target: exception,
            latch,
        }),
        ..mock.runtime()
    };
    let agent = agent_over(&mock, runtime, false);
    let (task, stream) = serve(&agent);
    let mut debugger = Debugger::attach(stream).await;
    debugger.next_event().await;

    debugger
        .set_request(EVENT_KIND_EXCEPTION, SUSPEND_POLICY_ALL, &[])
        .await;
    let poster = post_from(
        &agent,
        RuntimeEvent::ExceptionThrown {
            thread: MAIN,
            at: CodeLocation {
                method: thrower,
                pc: 0,
            },
            exception,
            catch: None,
        },
    );
    // The event matched and its body is being built.
    entered(reporting).await;

    let detaching = agent.clone();
    let detach = tokio::task::spawn_blocking(move || detaching.detach());
    tokio::time::sleep(Duration::from_millis(100)).await;
    release.send(()).unwrap();
    tokio::time::timeout(TIMEOUT, detach).await.unwrap().unwrap();

    joined(poster).await;
    assert!(settled(&agent, MAIN));
    assert!(!agent.is_attached());
    tokio::time::timeout(TIMEOUT, task).await.unwrap().unwrap().unwrap();
    drop(debugger);
}
