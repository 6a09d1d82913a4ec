use tokio::task::JoinHandle;

// Owns a spawned task and aborts it when going out of scope.
//
// Used for work that must not outlive its owner, like the HTTP listener or a
// shutdown countdown.
#[derive(Debug)]
pub(crate) struct DroppableHandle<T>(pub(crate) JoinHandle<T>);

impl<T> Drop for DroppableHandle<T> {
    fn drop(&mut self) {
        self.0.abort();
    }
}
