//! The reactor thread.
//!
//! One OS thread runs a `compio` runtime for the whole engine. Callers hand
//! it work as boxed `Send` closures over a `flume` channel; each closure runs
//! on the reactor thread and spawns its (possibly `!Send`) future locally.
//!
//! The command sender doubles as the keep-alive token: the runtime keeps
//! polling the channel for as long as the reactor is running, even when no
//! socket operation is in flight. The reactor keeps the handle of every
//! task it spawned; stopping drops them, which cancels anything in flight
//! and closes the descriptors those tasks own.

use std::future::Future;
use std::io;
use std::thread::{self, JoinHandle, ThreadId};

use compio::runtime::Task;
use parking_lot::Mutex;
use sockbridge_core::error::{EngineError, Result};
use tracing::{debug, warn};

type Job = Box<dyn FnOnce() -> Task<()> + Send + 'static>;

enum Command {
    Run(Job),
    Stop,
}

struct Running {
    commands: flume::Sender<Command>,
    thread: JoinHandle<()>,
    thread_id: ThreadId,
}

/// Handle to the engine's reactor thread.
pub(crate) struct Reactor {
    thread_name: String,
    running: Mutex<Option<Running>>,
}

impl Reactor {
    pub(crate) fn new(thread_name: impl Into<String>) -> Self {
        Self {
            thread_name: thread_name.into(),
            running: Mutex::new(None),
        }
    }

    /// Start the reactor thread. No-op if it is already running.
    pub(crate) fn start(&self) -> Result<()> {
        let mut running = self.running.lock();
        if running.is_some() {
            return Ok(());
        }

        let (commands, inbox) = flume::unbounded();
        let (ready_tx, ready_rx) = flume::bounded(1);
        let thread = thread::Builder::new()
            .name(self.thread_name.clone())
            .spawn(move || run(inbox, ready_tx))?;

        // Surface runtime construction failures (e.g. io_uring unavailable)
        match ready_rx.recv() {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                let _ = thread.join();
                return Err(EngineError::Io(e));
            }
            Err(_) => {
                let _ = thread.join();
                return Err(EngineError::ReactorUnavailable);
            }
        }

        debug!(thread = %self.thread_name, "reactor started");
        *running = Some(Running {
            commands,
            thread_id: thread.thread().id(),
            thread,
        });
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn is_running(&self) -> bool {
        self.running.lock().is_some()
    }

    /// Run `task` on the reactor thread.
    ///
    /// `make` is sent across threads; the future it builds never leaves the
    /// reactor, so it may hold `Rc`s and `compio` handles.
    pub(crate) fn submit<F, Fut>(&self, make: F) -> Result<()>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + 'static,
    {
        let commands = self
            .running
            .lock()
            .as_ref()
            .map(|r| r.commands.clone())
            .ok_or(EngineError::ReactorUnavailable)?;

        let job: Job = Box::new(move || compio::runtime::spawn(make()));
        commands
            .send(Command::Run(job))
            .map_err(|_| EngineError::ReactorUnavailable)
    }

    /// Whether the caller is running on the reactor thread.
    pub(crate) fn on_reactor_thread(&self) -> bool {
        self.running
            .lock()
            .as_ref()
            .is_some_and(|r| r.thread_id == thread::current().id())
    }

    /// Stop the reactor and wait for its thread to exit.
    ///
    /// Every in-flight task is cancelled. Calling this from
    /// the reactor thread itself detaches the thread instead of joining it.
    pub(crate) fn stop(&self) {
        let Some(running) = self.running.lock().take() else {
            return;
        };

        let _ = running.commands.send(Command::Stop);
        drop(running.commands);

        if running.thread_id == thread::current().id() {
            warn!("reactor stopped from its own thread; not joining");
            return;
        }
        if running.thread.join().is_err() {
            warn!("reactor thread panicked");
        }
        debug!(thread = %self.thread_name, "reactor stopped");
    }
}

impl Drop for Reactor {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run(inbox: flume::Receiver<Command>, ready: flume::Sender<io::Result<()>>) {
    let runtime = match compio::runtime::Runtime::new() {
        Ok(runtime) => {
            let _ = ready.send(Ok(()));
            runtime
        }
        Err(e) => {
            let _ = ready.send(Err(e));
            return;
        }
    };

    runtime.block_on(async move {
        let mut tasks: Vec<Task<()>> = Vec::new();
        while let Ok(command) = inbox.recv_async().await {
            match command {
                Command::Run(job) => {
                    tasks.retain(|task| !task.is_finished());
                    tasks.push(job());
                }
                Command::Stop => break,
            }
        }
        debug!(cancelled = tasks.len(), "reactor shutting down");
        drop(tasks);
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_start_is_idempotent() {
        let reactor = Reactor::new("test-reactor");
        reactor.start().unwrap();
        reactor.start().unwrap();
        assert!(reactor.is_running());
        reactor.stop();
        assert!(!reactor.is_running());
        reactor.stop();
    }

    #[test]
    fn test_submit_runs_on_reactor_thread() {
        let reactor = Reactor::new("test-reactor");
        reactor.start().unwrap();

        let (tx, rx) = flume::bounded(1);
        reactor
            .submit(move || async move {
                let name = thread::current().name().map(str::to_owned);
                let _ = tx.send(name);
            })
            .unwrap();

        let name = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(name.as_deref(), Some("test-reactor"));
        assert!(!reactor.on_reactor_thread());
    }

    #[test]
    fn test_submit_without_start_fails() {
        let reactor = Reactor::new("idle");
        let err = reactor.submit(|| async {}).unwrap_err();
        assert!(matches!(err, EngineError::ReactorUnavailable));
    }

    #[test]
    fn test_stop_drops_pending_tasks() {
        let reactor = Reactor::new("test-reactor");
        reactor.start().unwrap();

        let (tx, rx) = flume::bounded::<()>(1);
        reactor
            .submit(move || async move {
                // Parks forever; the sender is dropped with the runtime
                let _keep = tx;
                std::future::pending::<()>().await;
            })
            .unwrap();

        reactor.stop();
        assert!(matches!(
            rx.recv_timeout(Duration::from_secs(5)),
            Err(flume::RecvTimeoutError::Disconnected)
        ));
    }
}
