use std::sync::{Condvar, Mutex};

/// Reference counter with a one-shot release-and-wait drain.
///
/// Guards an object against teardown while callbacks are in flight: each use
/// holds a reference, and teardown drops the initial reference then blocks
/// until the count reaches zero. Once released, no new references can be
/// taken.
pub(crate) struct Rundown {
    state: Mutex<State>,
    drained: Condvar,
}

struct State {
    refs: usize,
    released: bool,
}

impl Rundown {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(State {
                refs: 1,
                released: false,
            }),
            drained: Condvar::new(),
        }
    }

    /// Take a reference. Fails once the rundown has been released.
    #[must_use]
    pub(crate) fn acquire(&self) -> bool {
        let mut state = self.state.lock().unwrap();
        if state.released {
            return false;
        }
        state.refs += 1;
        true
    }

    /// Take a scoped reference. The guard releases it when dropped, which
    /// also covers unwinding out of an upcall.
    pub(crate) fn enter(&self) -> Option<RundownRef<'_>> {
        if self.acquire() {
            Some(RundownRef { rundown: self })
        } else {
            None
        }
    }

    pub(crate) fn release(&self) {
        let mut state = self.state.lock().unwrap();
        debug_assert!(state.refs > 0);
        state.refs -= 1;
        if state.refs == 0 {
            self.drained.notify_all();
        }
    }

    /// Drop the initial reference and block until every reference is gone.
    pub(crate) fn release_and_wait(&self) {
        let mut state = self.state.lock().unwrap();
        debug_assert!(!state.released);
        state.released = true;
        state.refs -= 1;
        while state.refs > 0 {
            state = self.drained.wait(state).unwrap();
        }
    }
}

/// A reference held while an upcall is in flight.
pub(crate) struct RundownRef<'a> {
    rundown: &'a Rundown,
}

impl Drop for RundownRef<'_> {
    fn drop(&mut self) {
        self.rundown.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn acquire_fails_after_release() {
        let rundown = Rundown::new();
        assert!(rundown.acquire());
        rundown.release();
        rundown.release_and_wait();
        assert!(!rundown.acquire());
    }

    #[test]
    fn guard_releases_on_unwind() {
        let rundown = Arc::new(Rundown::new());
        let held = rundown.clone();
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(move || {
            let _guard = held.enter().expect("not yet released");
            panic!("upcall failed");
        }));
        assert!(result.is_err());

        // The unwound guard released its reference, so the drain completes.
        rundown.release_and_wait();
        assert!(rundown.enter().is_none());
    }

    #[test]
    fn wait_blocks_until_references_drain() {
        let rundown = Arc::new(Rundown::new());
        assert!(rundown.acquire());

        let held = rundown.clone();
        let releaser = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            held.release();
        });

        rundown.release_and_wait();
        releaser.join().unwrap();
        assert!(!rundown.acquire());
    }
}
