//! Execution contexts for user callbacks.
//!
//! Events are never delivered from inside the protocol core; they are
//! submitted to an [`Executor`] chosen by the caller. The ordering
//! guarantees of the connection (connect first, messages in parse order,
//! disconnect last) hold for any executor that runs tasks serially in
//! submission order.

/// Something that can run a callback task.
pub trait Executor: Send + Sync {
    /// Run the given task.
    fn execute(&self, task: Box<dyn FnOnce() + Send>);
}

/// The default executor: runs each task immediately on the thread that
/// submits it, i.e. the connection's reader thread.
#[derive(Debug, Default, Clone, Copy)]
pub struct InlineExecutor;

impl Executor for InlineExecutor {
    fn execute(&self, task: Box<dyn FnOnce() + Send>) {
        task();
    }
}

/// Any function that accepts a task is an executor, so callers can hand
/// tasks over to their own event loop without a newtype:
///
/// ```
/// # use websock::executor::Executor;
/// let (tx, rx) = std::sync::mpsc::channel::<Box<dyn FnOnce() + Send>>();
/// let executor = move |task| tx.send(task).unwrap();
/// executor.execute(Box::new(|| println!("on my loop")));
/// for task in rx.try_iter() {
///     task();
/// }
/// ```
impl<F> Executor for F
where
    F: Fn(Box<dyn FnOnce() + Send>) + Send + Sync,
{
    fn execute(&self, task: Box<dyn FnOnce() + Send>) {
        self(task);
    }
}
