//! Blocking channel bridge between caller threads and a worker thread
//!
//! Callers hand a command to the worker and block until the worker answers on
//! the single-shot reply slot carried inside the command. The command queue is
//! FIFO, so commands sent one after another from one thread are handled in
//! that order.

use async_channel::{Receiver, Sender, bounded};
use tokio::sync::oneshot;

/// Reply slot carried by a command, answered exactly once by the worker
pub type Reply<T> = oneshot::Sender<T>;

/// Default depth of the command queue
pub const DEFAULT_QUEUE_DEPTH: usize = 256;

/// Handle for caller threads (blocking)
pub struct CallerLink<C> {
    cmd_tx: Sender<C>,
}

impl<C> Clone for CallerLink<C> {
    fn clone(&self) -> Self {
        Self {
            cmd_tx: self.cmd_tx.clone(),
        }
    }
}

impl<C> CallerLink<C> {
    /// Send a command to the worker without waiting for it to be handled
    pub fn send_command(&self, cmd: C) -> crate::Result<()> {
        self.cmd_tx
            .send_blocking(cmd)
            .map_err(|e| crate::Error::Disconnected(e.to_string()))
    }

    /// Dispatch a command and block until the worker replies
    ///
    /// `build` receives the reply slot and returns the command carrying it.
    /// Must not be called from inside an async runtime.
    pub fn call<T>(&self, build: impl FnOnce(Reply<T>) -> C) -> crate::Result<T> {
        let (tx, rx) = oneshot::channel();
        self.send_command(build(tx))?;
        rx.blocking_recv().map_err(|_| crate::Error::NoReply)
    }

    /// Whether the worker side has gone away
    pub fn is_closed(&self) -> bool {
        self.cmd_tx.is_closed()
    }
}

/// Handle for the worker thread (blocking)
pub struct WorkerLink<C> {
    cmd_rx: Receiver<C>,
}

impl<C> WorkerLink<C> {
    /// Receive the next command (blocking)
    ///
    /// Fails once every [`CallerLink`] has been dropped and the queue is empty.
    pub fn recv_command(&self) -> crate::Result<C> {
        self.cmd_rx
            .recv_blocking()
            .map_err(|e| crate::Error::Disconnected(e.to_string()))
    }

    /// Try to receive a command without blocking
    pub fn try_recv_command(&self) -> Option<C> {
        self.cmd_rx.try_recv().ok()
    }

    /// Stop accepting commands
    ///
    /// Commands already queued can still be received; later sends fail.
    pub fn close(&self) {
        self.cmd_rx.close();
    }
}

/// Build a command and hand it to `execute` on the current thread
///
/// For callers that already run on the worker thread, where blocking on the
/// queue would wait for the caller itself. `execute` must answer the reply
/// slot before it returns.
pub fn call_inline<C, T>(
    build: impl FnOnce(Reply<T>) -> C,
    execute: impl FnOnce(C),
) -> crate::Result<T> {
    let (tx, mut rx) = oneshot::channel();
    execute(build(tx));
    rx.try_recv().map_err(|_| crate::Error::NoReply)
}

/// Create the channel bridge between callers and a worker
///
/// Returns (CallerLink for callers, WorkerLink for the worker thread)
pub fn create_worker_bridge<C>(capacity: usize) -> (CallerLink<C>, WorkerLink<C>) {
    let (cmd_tx, cmd_rx) = bounded(capacity.max(1));

    (CallerLink { cmd_tx }, WorkerLink { cmd_rx })
}

#[cfg(test)]
mod tests {
    use super::*;

    enum Cmd {
        Add { a: u32, b: u32, reply: Reply<u32> },
        Stop,
    }

    #[test]
    fn test_call_round_trip() {
        let (caller, worker) = create_worker_bridge::<Cmd>(DEFAULT_QUEUE_DEPTH);

        // Spawn a thread to simulate the worker
        let handle = std::thread::spawn(move || {
            while let Ok(cmd) = worker.recv_command() {
                match cmd {
                    Cmd::Add { a, b, reply } => {
                        let _ = reply.send(a + b);
                    }
                    Cmd::Stop => break,
                }
            }
        });

        let sum = caller.call(|reply| Cmd::Add { a: 2, b: 3, reply }).unwrap();
        assert_eq!(sum, 5);

        caller.send_command(Cmd::Stop).unwrap();
        handle.join().unwrap();
    }

    #[test]
    fn test_call_fails_when_worker_gone() {
        let (caller, worker) = create_worker_bridge::<Cmd>(4);
        drop(worker);

        let result = caller.call(|reply| Cmd::Add { a: 1, b: 1, reply });
        assert!(matches!(result, Err(crate::Error::Disconnected(_))));
        assert!(caller.is_closed());
    }

    #[test]
    fn test_dropped_reply_is_an_error() {
        let (caller, worker) = create_worker_bridge::<Cmd>(4);

        let handle = std::thread::spawn(move || {
            // Drop the command (and its reply slot) without answering
            let _ = worker.recv_command().unwrap();
        });

        let result = caller.call(|reply| Cmd::Add { a: 1, b: 1, reply });
        assert!(matches!(result, Err(crate::Error::NoReply)));
        handle.join().unwrap();
    }

    #[test]
    fn test_call_inline_runs_on_current_thread() {
        let caller_thread = std::thread::current().id();
        let mut ran_on = None;

        let sum = call_inline(
            |reply| Cmd::Add { a: 4, b: 5, reply },
            |cmd| {
                ran_on = Some(std::thread::current().id());
                if let Cmd::Add { a, b, reply } = cmd {
                    let _ = reply.send(a + b);
                }
            },
        )
        .unwrap();

        assert_eq!(sum, 9);
        assert_eq!(ran_on, Some(caller_thread));
    }

    #[test]
    fn test_call_inline_unanswered_is_an_error() {
        let result = call_inline(|reply| Cmd::Add { a: 1, b: 1, reply }, drop);
        assert!(matches!(result, Err(crate::Error::NoReply)));
    }

    #[test]
    fn test_close_keeps_queued_commands() {
        let (caller, worker) = create_worker_bridge::<Cmd>(4);
        caller.send_command(Cmd::Stop).unwrap();

        worker.close();

        assert!(caller.is_closed());
        assert!(caller.send_command(Cmd::Stop).is_err());
        assert!(matches!(worker.try_recv_command(), Some(Cmd::Stop)));
        assert!(worker.try_recv_command().is_none());
    }

    #[test]
    fn test_sequential_calls_keep_order() {
        let (caller, worker) = create_worker_bridge::<Cmd>(DEFAULT_QUEUE_DEPTH);

        let handle = std::thread::spawn(move || {
            let mut seen = Vec::new();
            while let Ok(cmd) = worker.recv_command() {
                match cmd {
                    Cmd::Add { a, b, reply } => {
                        seen.push(a);
                        let _ = reply.send(a + b);
                    }
                    Cmd::Stop => break,
                }
            }
            seen
        });

        for i in 0..10 {
            caller.call(|reply| Cmd::Add { a: i, b: 0, reply }).unwrap();
        }
        caller.send_command(Cmd::Stop).unwrap();

        assert_eq!(handle.join().unwrap(), (0..10).collect::<Vec<_>>());
    }
}
