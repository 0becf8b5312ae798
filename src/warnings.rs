use std::sync::atomic::{AtomicBool, Ordering};

use crate::config;

static ENABLED: AtomicBool = AtomicBool::new(true);

pub(crate) enum RuntimeWarning<'a> {
    BlockingWait(&'a str, f64),
    BlockOnWorker(&'a str),
}

impl<'a> RuntimeWarning<'a> {
    /// Silences warnings for the rest of the process
    pub(crate) fn disable_warnings() {
        ENABLED.store(false, Ordering::Relaxed);
    }
    fn print_warning(&self) -> bool {
        if !ENABLED.load(Ordering::Relaxed) || config().runtime_warnings == Some(false) {
            return false;
        }
        match self {
            RuntimeWarning::BlockingWait(_, elapsed) => {
                config().deadlock_timeout > 0.0 && *elapsed > config().deadlock_timeout
            }
            RuntimeWarning::BlockOnWorker(_) => crate::scheduler::on_worker_thread(),
        }
    }

    pub(crate) fn print(self) {
        #[cfg(not(feature = "disable-runtime-warnings"))]
        if self.print_warning() {
            match self {
                RuntimeWarning::BlockingWait(what, elapsed) => {
                    tracing::warn!(
                        waiting_on = what,
                        elapsed,
                        timeout = config().deadlock_timeout,
                        "blocking wait exceeded the deadlock timeout, potential deadlock detected. Set PHYS_INST_DEADLOCK_TIMEOUT to adjust"
                    );
                }
                RuntimeWarning::BlockOnWorker(what) => {
                    tracing::warn!(
                        caller = what,
                        "blocking call issued from a worker thread, this may deadlock the node executor"
                    );
                }
            }
        }
    }
}
