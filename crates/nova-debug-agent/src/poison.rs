use std::panic::Location;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

#[track_caller]
fn report_poison(context: &'static str, err: &dyn std::fmt::Display) {
    let loc = Location::caller();
    tracing::error!(
        target = "nova.jdwp",
        context,
        file = loc.file(),
        line = loc.line(),
        column = loc.column(),
        error = %err,
        "mutex poisoned; continuing with recovered guard"
    );
}

/// Lock `mutex`, recovering the guard if a previous holder panicked.
///
/// A panic on an application or debugger thread must not take the whole agent
/// (and with it every suspended thread) down with it.
#[track_caller]
pub(crate) fn lock<'a, T>(mutex: &'a Mutex<T>, context: &'static str) -> MutexGuard<'a, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(err) => {
            report_poison(context, &err);
            err.into_inner()
        }
    }
}

#[track_caller]
pub(crate) fn wait<'a, T>(
    condvar: &Condvar,
    guard: MutexGuard<'a, T>,
    context: &'static str,
) -> MutexGuard<'a, T> {
    match condvar.wait(guard) {
        Ok(guard) => guard,
        Err(err) => {
            report_poison(context, &err);
            err.into_inner()
        }
    }
}

/// Like [`wait`] with an upper bound; the returned flag is `true` on timeout.
#[track_caller]
pub(crate) fn wait_timeout<'a, T>(
    condvar: &Condvar,
    guard: MutexGuard<'a, T>,
    timeout: Duration,
    context: &'static str,
) -> (MutexGuard<'a, T>, bool) {
    match condvar.wait_timeout(guard, timeout) {
        Ok((guard, result)) => (guard, result.timed_out()),
        Err(err) => {
            report_poison(context, &err);
            let (guard, result) = PoisonError::into_inner(err);
            (guard, result.timed_out())
        }
    }
}
