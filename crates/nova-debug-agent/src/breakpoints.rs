use nova_jdwp::MethodId;

use crate::deopt::DeoptimizationRequest;
use crate::runtime::{ClassModel, Instrumentation};

/// How much had to be deoptimized for breakpoints on a method to be observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeoptKind {
    /// The runtime interprets everything already.
    Nothing,
    Selective,
    /// The method may be inlined elsewhere, so every compiled method goes.
    Full,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Breakpoint {
    method: MethodId,
    pc: u64,
    kind: DeoptKind,
}

#[derive(Debug, Default)]
pub struct BreakpointTable {
    breakpoints: Vec<Breakpoint>,
}

impl BreakpointTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.breakpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.breakpoints.is_empty()
    }

    pub fn is_breakpoint(&self, method: MethodId, pc: u64) -> bool {
        self.breakpoints
            .iter()
            .any(|bp| bp.method == method && bp.pc == pc)
    }

    fn existing_kind(&self, method: MethodId) -> Option<DeoptKind> {
        let mut kinds = self
            .breakpoints
            .iter()
            .filter(|bp| bp.method == method)
            .map(|bp| bp.kind);
        let first = kinds.next()?;
        if kinds.any(|kind| kind != first) {
            tracing::error!(
                target = "nova.jdwp",
                method,
                "breakpoints on one method disagree on deoptimization kind"
            );
            debug_assert!(false, "inconsistent breakpoint kinds for method {method}");
        }
        Some(first)
    }

    /// Record a breakpoint. Only the first one on a method asks for
    /// deoptimization; later ones ride on the recorded kind.
    pub fn watch(
        &mut self,
        method: MethodId,
        pc: u64,
        classes: &dyn ClassModel,
        instrumentation: &dyn Instrumentation,
    ) -> Option<DeoptimizationRequest> {
        if let Some(kind) = self.existing_kind(method) {
            self.breakpoints.push(Breakpoint { method, pc, kind });
            return None;
        }

        let kind = if !instrumentation.requires_deoptimization() {
            DeoptKind::Nothing
        } else if classes.may_be_inlined(method) {
            DeoptKind::Full
        } else {
            DeoptKind::Selective
        };
        tracing::debug!(target = "nova.jdwp", method, pc, ?kind, "watching breakpoint");
        self.breakpoints.push(Breakpoint { method, pc, kind });
        match kind {
            DeoptKind::Nothing => None,
            DeoptKind::Selective => Some(DeoptimizationRequest::SelectiveDeoptimization(method)),
            DeoptKind::Full => Some(DeoptimizationRequest::FullDeoptimization),
        }
    }

    /// Drop one breakpoint at `(method, pc)`. Removing the last breakpoint of a
    /// method yields the undeoptimization matching its kind.
    pub fn unwatch(&mut self, method: MethodId, pc: u64) -> Option<DeoptimizationRequest> {
        let pos = self
            .breakpoints
            .iter()
            .position(|bp| bp.method == method && bp.pc == pc)?;
        let removed = self.breakpoints.remove(pos);
        if self.breakpoints.iter().any(|bp| bp.method == method) {
            return None;
        }
        match removed.kind {
            DeoptKind::Nothing => None,
            DeoptKind::Selective => Some(DeoptimizationRequest::SelectiveUndeoptimization(method)),
            DeoptKind::Full => Some(DeoptimizationRequest::FullUndeoptimization),
        }
    }
}
