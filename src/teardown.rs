//! Teardown coordinator
//!
//! Shutdown work (unlinking buffers and semaphores, killing the engine) is
//! registered as explicit hooks and run at one place, exactly once. Nothing
//! here installs process-wide signal handlers; a binary that wants Ctrl-C to
//! clean up calls [`Teardown::run`] (or drops the session) from its own
//! handler.

use tracing::{debug, warn};

type Hook = Box<dyn FnOnce() -> Result<(), String> + Send>;

/// Runs registered shutdown hooks once, newest first
#[derive(Default)]
pub struct Teardown {
    hooks: Vec<(&'static str, Hook)>,
    torn_down: bool,
}

impl Teardown {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a hook. Hooks run in reverse registration order.
    ///
    /// Registering after teardown runs the hook immediately.
    pub fn register<F>(&mut self, label: &'static str, hook: F)
    where
        F: FnOnce() -> Result<(), String> + Send + 'static,
    {
        if self.torn_down {
            warn!(hook = label, "hook registered after teardown; running now");
            if let Err(e) = hook() {
                warn!(hook = label, error = %e, "teardown hook failed");
            }
            return;
        }
        self.hooks.push((label, Box::new(hook)));
    }

    /// Run every hook. Returns `false` if teardown already happened.
    ///
    /// A failing hook is logged and does not stop the others.
    pub fn run(&mut self) -> bool {
        if self.torn_down {
            return false;
        }
        self.torn_down = true;
        while let Some((label, hook)) = self.hooks.pop() {
            debug!(hook = label, "running teardown hook");
            if let Err(e) = hook() {
                warn!(hook = label, error = %e, "teardown hook failed");
            }
        }
        true
    }

    pub fn is_torn_down(&self) -> bool {
        self.torn_down
    }

    pub fn pending(&self) -> usize {
        self.hooks.len()
    }
}

impl Drop for Teardown {
    fn drop(&mut self) {
        self.run();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[test]
    fn test_runs_once_in_reverse_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut td = Teardown::new();
        for label in ["first", "second", "third"] {
            let log = log.clone();
            td.register(label, move || {
                log.lock().unwrap().push(label);
                Ok(())
            });
        }
        assert_eq!(td.pending(), 3);
        assert!(td.run());
        assert!(!td.run());
        assert!(td.is_torn_down());
        assert_eq!(*log.lock().unwrap(), vec!["third", "second", "first"]);
    }

    #[test]
    fn test_failing_hook_does_not_stop_others() {
        let ran = Arc::new(Mutex::new(0));
        let mut td = Teardown::new();
        let r = ran.clone();
        td.register("ok", move || {
            *r.lock().unwrap() += 1;
            Ok(())
        });
        td.register("bad", || Err("boom".to_string()));
        td.run();
        assert_eq!(*ran.lock().unwrap(), 1);
    }

    #[test]
    fn test_drop_runs_pending_hooks() {
        let ran = Arc::new(Mutex::new(false));
        {
            let mut td = Teardown::new();
            let r = ran.clone();
            td.register("flag", move || {
                *r.lock().unwrap() = true;
                Ok(())
            });
        }
        assert!(*ran.lock().unwrap());
    }
}
