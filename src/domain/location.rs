//! Single-slot register for "where am I" requests.
//!
//! Location fixes arrive through a delegate callback, long after the request.
//! At most one request is pending; a newer request replaces the older one,
//! which is failed with [`LocationError::Superseded`] rather than left hanging.

use std::sync::{Mutex, PoisonError};
use thiserror::Error;
use tokio::sync::{oneshot, Notify};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Location {
    pub latitude: f64,
    pub longitude: f64,
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum LocationError {
    #[error("a newer location request replaced this one")]
    Superseded,
    #[error("location request was dropped before it resolved")]
    Cancelled,
    #[error("location unavailable: {0}")]
    Unavailable(String),
}

type Reply = oneshot::Sender<Result<Location, LocationError>>;

#[derive(Default)]
pub struct LocationRequests {
    pending: Mutex<Option<Reply>>,
    wanted: Notify,
}

impl LocationRequests {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a request and wait for its fix.
    pub async fn request(&self) -> Result<Location, LocationError> {
        self.begin()
            .await
            .unwrap_or(Err(LocationError::Cancelled))
    }

    /// Register a request; the receiver resolves exactly once.
    pub fn begin(&self) -> oneshot::Receiver<Result<Location, LocationError>> {
        let (tx, rx) = oneshot::channel();
        let previous = self.slot().replace(tx);
        if let Some(previous) = previous {
            let _ = previous.send(Err(LocationError::Superseded));
        }
        self.wanted.notify_one();
        rx
    }

    pub fn is_pending(&self) -> bool {
        self.slot().as_ref().is_some_and(|tx| !tx.is_closed())
    }

    /// Deliver a fix to the pending request. Returns whether anyone got it.
    pub fn resolve(&self, location: Location) -> bool {
        self.complete(Ok(location))
    }

    /// Fail the pending request. Returns whether anyone was waiting.
    pub fn fail(&self, error: LocationError) -> bool {
        self.complete(Err(error))
    }

    /// Wait until someone registers a request. Used by the delegate side.
    pub async fn wanted(&self) {
        self.wanted.notified().await
    }

    fn complete(&self, result: Result<Location, LocationError>) -> bool {
        match self.slot().take() {
            Some(tx) => tx.send(result).is_ok(),
            None => false,
        }
    }

    fn slot(&self) -> std::sync::MutexGuard<'_, Option<Reply>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HERE: Location = Location {
        latitude: 47.37,
        longitude: 8.54,
    };

    #[tokio::test]
    async fn test_resolve_pending_request() {
        let requests = LocationRequests::new();
        let rx = requests.begin();
        assert!(requests.is_pending());
        assert!(requests.resolve(HERE));
        assert_eq!(rx.await.unwrap(), Ok(HERE));
        assert!(!requests.is_pending());
    }

    #[tokio::test]
    async fn test_second_request_supersedes_first() {
        let requests = LocationRequests::new();
        let first = requests.begin();
        let second = requests.begin();

        assert!(requests.resolve(HERE));
        assert_eq!(first.await.unwrap(), Err(LocationError::Superseded));
        assert_eq!(second.await.unwrap(), Ok(HERE));
    }

    #[tokio::test]
    async fn test_result_without_request_is_dropped() {
        let requests = LocationRequests::new();
        assert!(!requests.resolve(HERE));

        let rx = requests.begin();
        assert!(requests.fail(LocationError::Unavailable("denied".into())));
        // A late duplicate fix must not resolve anything twice
        assert!(!requests.resolve(HERE));
        assert_eq!(
            rx.await.unwrap(),
            Err(LocationError::Unavailable("denied".into()))
        );
    }

    #[tokio::test]
    async fn test_request_is_served_by_delegate() {
        let requests = std::sync::Arc::new(LocationRequests::new());
        let delegate = requests.clone();
        tokio::spawn(async move {
            delegate.wanted().await;
            delegate.resolve(HERE);
        });
        assert_eq!(requests.request().await, Ok(HERE));
    }
}
