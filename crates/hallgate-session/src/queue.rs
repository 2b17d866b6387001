//! The task queue: one total order for everything game logic can observe.
//!
//! Transport callbacks, the heartbeat sweep and custom handlers all run
//! concurrently, but the effects game code sees (a user joined, a user
//! left, a handler-requested state change) are pushed here and run one at a
//! time by a single [`Executor`], in arrival order.
//!
//! ```text
//! login ─────┐
//! sweep ─────┼──▶ [ bounded FIFO ] ──▶ Executor ──▶ callbacks / jobs
//! handlers ──┘
//! ```

use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use hallgate_protocol::UserId;
use tokio::sync::{mpsc, oneshot, watch};

use crate::{CallbackRegistry, SessionError};

/// A deferred closure run on the executor.
pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// One unit of serialized work.
///
/// Join and leave are their own variants so the executor can log them and
/// resolve the callback at run time (the one registered *now*, not when
/// the task was queued).
pub enum Task {
    UserJoined(UserId),
    UserLeft(UserId),
    Invoke(Job),
}

impl Task {
    fn kind(&self) -> &'static str {
        match self {
            Self::UserJoined(_) => "user_joined",
            Self::UserLeft(_) => "user_left",
            Self::Invoke(_) => "invoke",
        }
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UserJoined(id) => f.debug_tuple("UserJoined").field(id).finish(),
            Self::UserLeft(id) => f.debug_tuple("UserLeft").field(id).finish(),
            Self::Invoke(_) => f.write_str("Invoke(..)"),
        }
    }
}

/// Producer handle for the task queue. Cheap to clone.
#[derive(Clone)]
pub struct TaskQueue {
    tx: mpsc::Sender<Task>,
}

/// Creates a queue holding at most `capacity` pending tasks, and the
/// executor that drains it.
pub fn task_queue(capacity: usize, callbacks: Arc<CallbackRegistry>) -> (TaskQueue, Executor) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (
        TaskQueue { tx },
        Executor {
            rx,
            callbacks,
            executed: 0,
            failed: 0,
        },
    )
}

impl TaskQueue {
    /// Appends `task`, waiting for room if the queue is full.
    ///
    /// # Errors
    /// [`SessionError::QueueClosed`] once the executor has stopped.
    pub async fn enqueue(&self, task: Task) -> Result<(), SessionError> {
        self.tx.send(task).await.map_err(|_| SessionError::QueueClosed)
    }

    /// Queues a closure to run on the executor.
    pub async fn invoke<F>(&self, f: F) -> Result<(), SessionError>
    where
        F: FnOnce() + Send + 'static,
    {
        self.enqueue(Task::Invoke(Box::new(f))).await
    }

    /// Resolves once every task queued before this call has run.
    pub async fn flush(&self) -> Result<(), SessionError> {
        let (done_tx, done_rx) = oneshot::channel();
        self.invoke(move || {
            let _ = done_tx.send(());
        })
        .await?;
        done_rx.await.map_err(|_| SessionError::QueueClosed)
    }

    /// Tasks waiting to run.
    pub fn pending(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// The single consumer of a [`TaskQueue`].
pub struct Executor {
    rx: mpsc::Receiver<Task>,
    callbacks: Arc<CallbackRegistry>,
    executed: u64,
    failed: u64,
}

impl Executor {
    /// Runs tasks until `shutdown` flips (or its sender drops), then runs
    /// whatever was already queued and stops.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        tracing::debug!("task executor started");

        loop {
            tokio::select! {
                biased;
                task = self.rx.recv() => match task {
                    Some(task) => self.execute(task),
                    None => break,
                },
                _ = stopped(&mut shutdown) => {
                    self.rx.close();
                    while let Some(task) = self.rx.recv().await {
                        self.execute(task);
                    }
                    break;
                }
            }
        }

        tracing::debug!(
            executed = self.executed,
            failed = self.failed,
            "task executor stopped"
        );
    }

    /// Runs one task. A panic inside it is logged and swallowed so the
    /// next task still runs.
    fn execute(&mut self, task: Task) {
        let kind = task.kind();
        tracing::trace!(?task, "running task");

        let callbacks = &self.callbacks;
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| match task {
            Task::UserJoined(user_id) => {
                if let Some(cb) = callbacks.user_joined() {
                    cb(user_id);
                }
            }
            Task::UserLeft(user_id) => {
                if let Some(cb) = callbacks.user_left() {
                    cb(user_id);
                }
            }
            Task::Invoke(job) => job(),
        }));

        self.executed += 1;
        if let Err(payload) = outcome {
            self.failed += 1;
            tracing::error!(
                task = kind,
                panic = panic_message(payload.as_ref()),
                "task panicked, continuing"
            );
        }
    }
}

/// Resolves when `shutdown` reads `true` or its sender is gone.
pub(crate) async fn stopped(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s
    } else {
        "<non-string panic>"
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    fn start(capacity: usize) -> (TaskQueue, Arc<CallbackRegistry>, watch::Sender<bool>) {
        let callbacks = Arc::new(CallbackRegistry::new());
        let (queue, executor) = task_queue(capacity, Arc::clone(&callbacks));
        let (stop_tx, stop_rx) = watch::channel(false);
        tokio::spawn(executor.run(stop_rx));
        (queue, callbacks, stop_tx)
    }

    #[tokio::test]
    async fn test_tasks_run_in_arrival_order_exactly_once() {
        let (queue, _cb, _stop) = start(16);
        let log = Arc::new(Mutex::new(Vec::new()));

        for name in ["T1", "T2", "T3"] {
            let log = Arc::clone(&log);
            queue.invoke(move || log.lock().unwrap().push(name)).await.unwrap();
        }
        queue.flush().await.unwrap();

        assert_eq!(*log.lock().unwrap(), vec!["T1", "T2", "T3"]);
    }

    #[tokio::test]
    async fn test_panicking_task_does_not_stop_executor() {
        let (queue, _cb, _stop) = start(16);
        let log = Arc::new(Mutex::new(Vec::new()));

        let l = Arc::clone(&log);
        queue.invoke(move || l.lock().unwrap().push(1)).await.unwrap();
        queue.invoke(|| panic!("boom")).await.unwrap();
        let l = Arc::clone(&log);
        queue.invoke(move || l.lock().unwrap().push(3)).await.unwrap();
        queue.flush().await.unwrap();

        assert_eq!(*log.lock().unwrap(), vec![1, 3]);
    }

    #[tokio::test]
    async fn test_join_and_leave_use_current_callbacks() {
        let (queue, callbacks, _stop) = start(16);
        let seen = Arc::new(Mutex::new(Vec::new()));

        let s = Arc::clone(&seen);
        callbacks.register_user_joined(move |id| s.lock().unwrap().push(("join", id)));
        let s = Arc::clone(&seen);
        callbacks.register_user_left(move |id| s.lock().unwrap().push(("leave", id)));

        queue.enqueue(Task::UserJoined(UserId(42))).await.unwrap();
        queue.enqueue(Task::UserLeft(UserId(42))).await.unwrap();
        queue.flush().await.unwrap();

        assert_eq!(
            *seen.lock().unwrap(),
            vec![("join", UserId(42)), ("leave", UserId(42))]
        );
    }

    #[tokio::test]
    async fn test_join_without_callback_is_noop() {
        let (queue, _cb, _stop) = start(16);
        queue.enqueue(Task::UserJoined(UserId(1))).await.unwrap();
        queue.flush().await.unwrap();
    }

    #[tokio::test]
    async fn test_full_queue_applies_backpressure() {
        // No executor running: the queue fills up and stays full.
        let callbacks = Arc::new(CallbackRegistry::new());
        let (queue, executor) = task_queue(2, callbacks);

        queue.enqueue(Task::UserJoined(UserId(1))).await.unwrap();
        queue.enqueue(Task::UserJoined(UserId(2))).await.unwrap();
        assert_eq!(queue.pending(), 2);

        let third = tokio::time::timeout(
            std::time::Duration::from_millis(50),
            queue.enqueue(Task::UserJoined(UserId(3))),
        )
        .await;
        assert!(third.is_err(), "enqueue should wait while the queue is full");

        drop(executor);
    }

    #[tokio::test]
    async fn test_shutdown_drains_queued_tasks_then_closes() {
        let callbacks = Arc::new(CallbackRegistry::new());
        let (queue, executor) = task_queue(16, callbacks);
        let (stop_tx, stop_rx) = watch::channel(false);
        let count = Arc::new(Mutex::new(0));

        for _ in 0..5 {
            let c = Arc::clone(&count);
            queue.invoke(move || *c.lock().unwrap() += 1).await.unwrap();
        }
        stop_tx.send(true).unwrap();
        executor.run(stop_rx).await;

        assert_eq!(*count.lock().unwrap(), 5);
        assert!(matches!(
            queue.invoke(|| {}).await,
            Err(SessionError::QueueClosed)
        ));
    }
}
