use psg_protocol::{ErrCode, Severity};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::backend::FetchEvent;

/// A storage error as it crosses the fetch boundary: an HTTP-like status,
/// an application code, a severity, and human-readable text.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{message} (status {status}, code {code:?})")]
pub struct FetchError {
    pub status: u16,
    pub code: ErrCode,
    pub severity: Severity,
    pub message: String,
}

impl FetchError {
    pub fn new(status: u16, code: ErrCode, severity: Severity, message: impl Into<String>) -> Self {
        Self {
            status,
            code,
            severity,
            message: message.into(),
        }
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(504, ErrCode::StorageTimeout, Severity::Error, message)
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(503, ErrCode::StorageUnavailable, Severity::Error, message)
    }

    pub fn cancelled() -> Self {
        Self::new(499, ErrCode::Cancelled, Severity::Warning, "fetch cancelled")
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(500, ErrCode::Unknown, Severity::Error, message)
    }

    /// Whether a retry within the same request could succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self.code, ErrCode::StorageTimeout | ErrCode::StorageUnavailable)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchState {
    Idle,
    Running,
    Done,
    Error,
}

/// A single in-flight storage operation. Events arrive over a bounded
/// channel; the handle tracks the operation's lifecycle and allows
/// best-effort cancellation.
///
/// After [`Fetch::cancel`] returns, the only event that may still be
/// observed is a final `Error` carrying the cancellation code.
pub struct Fetch {
    rx: mpsc::Receiver<FetchEvent>,
    cancel: CancellationToken,
    state: FetchState,
    read_finished: bool,
}

impl Fetch {
    pub fn new(rx: mpsc::Receiver<FetchEvent>, cancel: CancellationToken) -> Self {
        Self {
            rx,
            cancel,
            state: FetchState::Idle,
            read_finished: false,
        }
    }

    /// Receive the next event, updating the fetch state. `None` once the
    /// operation has finished and the channel drained.
    pub async fn next_event(&mut self) -> Option<FetchEvent> {
        if matches!(self.state, FetchState::Done | FetchState::Error) && self.read_finished {
            return None;
        }

        let event = self.rx.recv().await;
        match &event {
            Some(FetchEvent::Done) => {
                self.state = FetchState::Done;
                self.read_finished = true;
            }
            Some(FetchEvent::Error(err)) => {
                self.state = FetchState::Error;
                self.read_finished = true;
                if err.code == ErrCode::Cancelled {
                    tracing::debug!("fetch ended by cancellation");
                }
            }
            Some(_) => self.state = FetchState::Running,
            None => {
                // Producer dropped without a terminal event.
                if self.state != FetchState::Error {
                    self.state = FetchState::Done;
                }
                self.read_finished = true;
            }
        }
        event
    }

    pub fn cancel(&mut self) {
        self.cancel.cancel();
        // Stop the producer, then discard anything it had already buffered.
        self.rx.close();
        while self.rx.try_recv().is_ok() {}
    }

    pub fn state(&self) -> FetchState {
        self.state
    }

    pub fn is_finished(&self) -> bool {
        self.read_finished
    }

    pub fn set_read_finished(&mut self) {
        self.read_finished = true;
    }
}

impl Drop for Fetch {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn state_follows_events() {
        let (tx, rx) = mpsc::channel(4);
        let mut fetch = Fetch::new(rx, CancellationToken::new());
        assert_eq!(fetch.state(), FetchState::Idle);

        tx.send(FetchEvent::BlobChunk {
            data: bytes::Bytes::from_static(b"x"),
            chunk_no: 0,
            is_last: true,
        })
        .await
        .unwrap();
        tx.send(FetchEvent::Done).await.unwrap();

        assert!(matches!(
            fetch.next_event().await,
            Some(FetchEvent::BlobChunk { .. })
        ));
        assert_eq!(fetch.state(), FetchState::Running);

        assert!(matches!(fetch.next_event().await, Some(FetchEvent::Done)));
        assert_eq!(fetch.state(), FetchState::Done);
        assert!(fetch.is_finished());
        assert!(fetch.next_event().await.is_none());
    }

    #[tokio::test]
    async fn error_event_is_terminal() {
        let (tx, rx) = mpsc::channel(4);
        let mut fetch = Fetch::new(rx, CancellationToken::new());

        tx.send(FetchEvent::Error(FetchError::timeout("query timed out")))
            .await
            .unwrap();

        let Some(FetchEvent::Error(err)) = fetch.next_event().await else {
            panic!("expected error event");
        };
        assert!(err.is_transient());
        assert_eq!(fetch.state(), FetchState::Error);
    }

    #[tokio::test]
    async fn cancel_discards_buffered_events() {
        let (tx, rx) = mpsc::channel(4);
        let token = CancellationToken::new();
        let mut fetch = Fetch::new(rx, token.clone());

        tx.send(FetchEvent::Done).await.unwrap();
        fetch.cancel();
        assert!(token.is_cancelled());
        assert!(fetch.next_event().await.is_none());
    }
}
