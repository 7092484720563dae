//! Debug coordination core for the Nova runtime.
//!
//! The agent sits between a JDWP debugger and a running runtime. It hands out
//! stable object ids, suspends and resumes application threads, installs
//! breakpoints and steps through the runtime's instrumentation layer, runs
//! methods on suspended threads on the debugger's behalf, and reports events
//! back over the wire.
//!
//! The embedding runtime implements the traits in [`runtime`] and drives a
//! [`DebugAgent`]: it registers its threads, polls [`DebugAgent::safepoint`],
//! feeds [`RuntimeEvent`]s to [`DebugAgent::post`] and calls
//! [`DebugAgent::sweep`] once per collection.

pub mod agent;
pub mod alloc;
pub mod breakpoints;
pub mod config;
pub mod deopt;
pub mod error;
pub mod events;
pub mod invoke;
#[cfg(any(test, feature = "test-support"))]
pub mod mock;
mod poison;
pub mod registry;
pub mod runtime;
pub mod session;
pub mod step;
pub mod suspend;
pub mod transport;

pub use agent::DebugAgent;
pub use alloc::{AllocFrame, AllocationTracker};
pub use config::{init_tracing, AgentConfig, ConfigError, JdwpOptions, LoggingConfig};
pub use error::{AgentError, AgentResult};
pub use events::{CodeLocation, RuntimeEvent};
pub use runtime::{
    ClassId, Frame, GcVisitor, HeapRef, InstrumentationEvents, InvocationCall, InvokeOutcome,
    Runtime, ThreadHandle, Value,
};
pub use session::DebugSession;
pub use suspend::{SuspensionCoordinator, ThreadControl};
