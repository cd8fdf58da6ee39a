use std::sync::Arc;

use crate::queue::TaskQueue;
use crate::storage::ResultStore;

/// Shared handles for the HTTP handlers. The queue is the same instance the
/// executor consumes from.
#[derive(Clone)]
pub struct AppState {
    pub queue: Arc<TaskQueue>,
    pub store: Arc<dyn ResultStore>,
}

impl AppState {
    pub fn new(queue: Arc<TaskQueue>, store: Arc<dyn ResultStore>) -> Self {
        Self { queue, store }
    }
}
