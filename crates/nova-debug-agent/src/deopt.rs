use nova_jdwp::MethodId;

use crate::error::{consistency_violation, AgentResult};
use crate::runtime::{Instrumentation, InstrumentationEvents};
use crate::suspend::SuspendAllGuard;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeoptimizationRequest {
    RegisterForEvent(InstrumentationEvents),
    UnregisterForEvent(InstrumentationEvents),
    FullDeoptimization,
    FullUndeoptimization,
    SelectiveDeoptimization(MethodId),
    SelectiveUndeoptimization(MethodId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Action {
    DeoptimizeEverything,
    UndeoptimizeEverything,
    Deoptimize(MethodId),
    Undeoptimize(MethodId),
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DrainSummary {
    pub installed: InstrumentationEvents,
    pub removed: InstrumentationEvents,
    pub actions: usize,
}

/// Pending instrumentation changes, reference counted so overlapping users
/// compose.
///
/// Event registrations only move counters; whether a hook is actually
/// installed is decided at drain time by comparing each counter with what the
/// runtime currently has, so any interleaving of N registrations and N
/// unregistrations nets out to at most one install and one removal.
#[derive(Debug, Default)]
pub struct DeoptimizationQueue {
    event_counts: [u32; InstrumentationEvents::ALL.len()],
    installed: InstrumentationEvents,
    full_count: u32,
    pending: Vec<Action>,
}

impl DeoptimizationQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enqueue(&mut self, request: DeoptimizationRequest) -> AgentResult<()> {
        tracing::trace!(target = "nova.jdwp", ?request, "deoptimization request");
        match request {
            DeoptimizationRequest::RegisterForEvent(events) => {
                for event in events.iter() {
                    let slot = self.counter(event)?;
                    *slot += 1;
                }
            }
            DeoptimizationRequest::UnregisterForEvent(events) => {
                // All or nothing: a refused bit leaves every counter as it was.
                for event in events.iter() {
                    if *self.counter(event)? == 0 {
                        return Err(consistency_violation(format!(
                            "unbalanced unregistration of {event:?}"
                        )));
                    }
                }
                for event in events.iter() {
                    *self.counter(event)? -= 1;
                }
            }
            DeoptimizationRequest::FullDeoptimization => {
                self.full_count += 1;
                if self.full_count == 1
                    && !self.cancel_pending(Action::UndeoptimizeEverything)
                {
                    self.pending.push(Action::DeoptimizeEverything);
                }
            }
            DeoptimizationRequest::FullUndeoptimization => {
                if self.full_count == 0 {
                    return Err(consistency_violation(
                        "full undeoptimization without matching deoptimization".to_string(),
                    ));
                }
                self.full_count -= 1;
                if self.full_count == 0 && !self.cancel_pending(Action::DeoptimizeEverything) {
                    self.pending.push(Action::UndeoptimizeEverything);
                }
            }
            DeoptimizationRequest::SelectiveDeoptimization(method) => {
                self.pending.push(Action::Deoptimize(method));
            }
            DeoptimizationRequest::SelectiveUndeoptimization(method) => {
                self.pending.push(Action::Undeoptimize(method));
            }
        }
        Ok(())
    }

    fn counter(&mut self, event: InstrumentationEvents) -> AgentResult<&mut u32> {
        match event.index() {
            Some(index) => Ok(&mut self.event_counts[index]),
            None => Err(consistency_violation(format!(
                "unknown instrumentation event {event:?}"
            ))),
        }
    }

    /// Drop the most recent not-yet-applied `action`; true if there was one.
    fn cancel_pending(&mut self, action: Action) -> bool {
        match self.pending.iter().rposition(|pending| *pending == action) {
            Some(pos) => {
                self.pending.remove(pos);
                true
            }
            None => false,
        }
    }

    pub fn has_pending(&self) -> bool {
        if !self.pending.is_empty() {
            return true;
        }
        InstrumentationEvents::ALL
            .iter()
            .zip(self.event_counts)
            .any(|(event, count)| (count > 0) != self.installed.contains(*event))
    }

    /// Apply everything accumulated since the last drain. The guard is proof
    /// that every mutator is stopped while frames are rewritten.
    pub fn drain_and_apply(
        &mut self,
        _suspended: &SuspendAllGuard<'_>,
        instrumentation: &dyn Instrumentation,
    ) -> DrainSummary {
        let mut summary = DrainSummary::default();

        for (event, count) in InstrumentationEvents::ALL.iter().zip(self.event_counts) {
            let wanted = count > 0;
            let present = self.installed.contains(*event);
            if wanted && !present {
                instrumentation.add_listener(*event);
                self.installed |= *event;
                summary.installed |= *event;
            } else if !wanted && present {
                instrumentation.remove_listener(*event);
                self.installed.remove(*event);
                summary.removed |= *event;
            }
        }

        for action in self.pending.drain(..) {
            match action {
                Action::DeoptimizeEverything => instrumentation.deoptimize_everything(),
                Action::UndeoptimizeEverything => instrumentation.undeoptimize_everything(),
                Action::Deoptimize(method) => instrumentation.deoptimize(method),
                Action::Undeoptimize(method) => instrumentation.undeoptimize(method),
            }
            summary.actions += 1;
        }

        tracing::debug!(
            target = "nova.jdwp",
            installed = summary.installed.bits(),
            removed = summary.removed.bits(),
            actions = summary.actions,
            full_deoptimizations = self.full_count,
            "applied deoptimization requests"
        );
        summary
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::mock::{InstrumentationCall, MockRuntime};
    use crate::suspend::SuspensionCoordinator;

    fn drain(queue: &mut DeoptimizationQueue, mock: &MockRuntime) -> DrainSummary {
        let coordinator = SuspensionCoordinator::new(Duration::from_millis(200));
        let guard = coordinator.suspend_all_scoped().unwrap();
        queue.drain_and_apply(&guard, mock)
    }

    #[test]
    fn repeated_registrations_collapse_into_one_install_and_one_removal() {
        let mock = MockRuntime::new();
        let mut queue = DeoptimizationQueue::new();
        let event = InstrumentationEvents::METHOD_ENTERED;

        queue.enqueue(DeoptimizationRequest::RegisterForEvent(event)).unwrap();
        queue.enqueue(DeoptimizationRequest::RegisterForEvent(event)).unwrap();
        drain(&mut queue, &mock);
        queue.enqueue(DeoptimizationRequest::RegisterForEvent(event)).unwrap();
        queue.enqueue(DeoptimizationRequest::UnregisterForEvent(event)).unwrap();
        drain(&mut queue, &mock);
        queue.enqueue(DeoptimizationRequest::UnregisterForEvent(event)).unwrap();
        queue.enqueue(DeoptimizationRequest::UnregisterForEvent(event)).unwrap();
        drain(&mut queue, &mock);

        assert_eq!(
            mock.instrumentation_calls(),
            vec![
                InstrumentationCall::AddListener(event),
                InstrumentationCall::RemoveListener(event),
            ]
        );
        assert!(!queue.has_pending());
    }

    #[test]
    fn register_and_unregister_before_drain_reach_nothing() {
        let mock = MockRuntime::new();
        let mut queue = DeoptimizationQueue::new();
        let event = InstrumentationEvents::FIELD_READ;
        queue.enqueue(DeoptimizationRequest::RegisterForEvent(event)).unwrap();
        queue.enqueue(DeoptimizationRequest::UnregisterForEvent(event)).unwrap();
        assert!(!queue.has_pending());
        drain(&mut queue, &mock);
        assert!(mock.instrumentation_calls().is_empty());
    }

    #[test]
    fn full_deoptimization_is_counted_separately() {
        let mock = MockRuntime::new();
        let mut queue = DeoptimizationQueue::new();

        queue.enqueue(DeoptimizationRequest::FullDeoptimization).unwrap();
        queue.enqueue(DeoptimizationRequest::FullDeoptimization).unwrap();
        queue.enqueue(DeoptimizationRequest::SelectiveDeoptimization(9)).unwrap();
        drain(&mut queue, &mock);

        queue.enqueue(DeoptimizationRequest::FullUndeoptimization).unwrap();
        assert!(!queue.has_pending());
        queue.enqueue(DeoptimizationRequest::FullUndeoptimization).unwrap();
        drain(&mut queue, &mock);

        assert_eq!(
            mock.instrumentation_calls(),
            vec![
                InstrumentationCall::DeoptimizeEverything,
                InstrumentationCall::Deoptimize(9),
                InstrumentationCall::UndeoptimizeEverything,
            ]
        );
    }

    #[test]
    fn undone_full_deoptimization_is_cancelled_before_drain() {
        let mock = MockRuntime::new();
        let mut queue = DeoptimizationQueue::new();
        queue.enqueue(DeoptimizationRequest::FullDeoptimization).unwrap();
        queue.enqueue(DeoptimizationRequest::FullUndeoptimization).unwrap();
        assert!(!queue.has_pending());
        drain(&mut queue, &mock);
        assert!(mock.instrumentation_calls().is_empty());
    }

    #[test]
    #[cfg_attr(debug_assertions, should_panic(expected = "unbalanced"))]
    fn underflow_is_a_consistency_violation() {
        let mut queue = DeoptimizationQueue::new();
        let result = queue.enqueue(DeoptimizationRequest::UnregisterForEvent(
            InstrumentationEvents::METHOD_EXITED,
        ));
        assert!(result.is_err());
    }

    #[test]
    fn refused_unregistration_leaves_every_counter_alone() {
        let mock = MockRuntime::new();
        let mut queue = DeoptimizationQueue::new();
        let entered = InstrumentationEvents::METHOD_ENTERED;
        let exited = InstrumentationEvents::METHOD_EXITED;
        queue.enqueue(DeoptimizationRequest::RegisterForEvent(entered)).unwrap();

        // Debug builds assert on the violation; release builds report it.
        let refused = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            queue.enqueue(DeoptimizationRequest::UnregisterForEvent(entered | exited))
        }));
        assert!(!matches!(refused, Ok(Ok(()))));

        drain(&mut queue, &mock);
        assert_eq!(
            mock.instrumentation_calls(),
            vec![InstrumentationCall::AddListener(entered)]
        );
        queue.enqueue(DeoptimizationRequest::UnregisterForEvent(entered)).unwrap();
        drain(&mut queue, &mock);
        assert_eq!(
            mock.instrumentation_calls().last(),
            Some(&InstrumentationCall::RemoveListener(entered))
        );
    }
}
