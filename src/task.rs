use std::io;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};

struct TaskFlags {
    signal: bool,
    stop: bool,
    done: bool,
}

struct TaskShared {
    flags: Mutex<TaskFlags>,
    cond: Condvar,
}

/// Handle the worker uses to park between rounds and to report an
/// error exit.
pub struct TaskContext {
    shared: Arc<TaskShared>,
}

impl TaskContext {
    /// Blocks until woken or stopped. A wakeup posted before the wait is
    /// not lost. Returns `false` when the task should exit.
    pub fn wait(&self) -> bool {
        let mut flags = match self.shared.flags.lock() {
            Ok(flags) => flags,
            Err(_) => return false,
        };
        loop {
            if flags.stop {
                return false;
            }
            if flags.signal {
                flags.signal = false;
                return true;
            }
            flags = match self.shared.cond.wait(flags) {
                Ok(flags) => flags,
                Err(_) => return false,
            };
        }
    }

    /// Marks the task as exited on its own (error path).
    pub fn done(&self) {
        if let Ok(mut flags) = self.shared.flags.lock() {
            flags.done = true;
        }
    }
}

/// A background worker thread parked on a condition variable between
/// work rounds, stopped cooperatively and joined on drop.
pub struct Task {
    shared: Arc<TaskShared>,
    handle: Option<JoinHandle<()>>,
}

impl Task {
    pub fn spawn(
        name: &str,
        f: impl FnOnce(TaskContext) + Send + 'static,
    ) -> io::Result<Task> {
        let shared = Arc::new(TaskShared {
            flags: Mutex::new(TaskFlags {
                signal: false,
                stop: false,
                done: false,
            }),
            cond: Condvar::new(),
        });
        let ctx = TaskContext {
            shared: shared.clone(),
        };
        let handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || f(ctx))?;
        Ok(Task {
            shared,
            handle: Some(handle),
        })
    }

    pub fn wakeup(&self) {
        if let Ok(mut flags) = self.shared.flags.lock() {
            flags.signal = true;
            self.shared.cond.notify_all();
        }
    }

    /// Requests a cooperative exit and joins the thread.
    pub fn stop(&mut self) {
        if let Ok(mut flags) = self.shared.flags.lock() {
            flags.stop = true;
            self.shared.cond.notify_all();
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for Task {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn wakeup_before_wait_is_not_lost() {
        let rounds = Arc::new(AtomicUsize::new(0));
        let seen = rounds.clone();
        let mut task = Task::spawn("test-worker", move |ctx| {
            while ctx.wait() {
                seen.fetch_add(1, Ordering::SeqCst);
            }
        })
        .unwrap();
        task.wakeup();
        while rounds.load(Ordering::SeqCst) == 0 {
            std::thread::yield_now();
        }
        task.stop();
        assert!(rounds.load(Ordering::SeqCst) >= 1);
    }

    #[test]
    fn stop_joins_a_parked_worker() {
        let mut task = Task::spawn("parked", |ctx| while ctx.wait() {}).unwrap();
        task.stop();
    }
}
