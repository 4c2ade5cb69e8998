use crate::session::{SessionController, SessionSnapshot};
use std::sync::Arc;
use tokio::sync::{watch, Mutex};

/// Shared application state for HTTP handlers
#[derive(Clone)]
pub struct AppState {
    /// The one live session controller; connect holds the lock until opened
    pub controller: Arc<Mutex<SessionController>>,

    /// Status feed, readable while the controller is busy
    pub status: watch::Receiver<SessionSnapshot>,
}

impl AppState {
    pub fn new(controller: SessionController) -> Self {
        let status = controller.subscribe();
        Self {
            controller: Arc::new(Mutex::new(controller)),
            status,
        }
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.status.borrow().clone()
    }
}
