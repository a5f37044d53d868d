use std::time::Duration;

use psg_store::{Fetch, FetchEvent, FetchState};
use rand::Rng;

/// A [`Fetch`] that re-issues its storage operation on transient errors.
///
/// Retries apply only while nothing has been delivered yet: once any data
/// event was observed, a later transient error is terminal, since part of
/// the result may already be on the wire. Backoff doubles per attempt with
/// jitter, bounded by the configured timer period.
pub struct RetryingFetch {
    make: Box<dyn Fn() -> Fetch + Send>,
    fetch: Fetch,
    retries_left: u32,
    attempt: u32,
    delivered: bool,
    max_delay: Duration,
}

impl RetryingFetch {
    pub fn new<F>(make: F, max_retries: u32, max_delay: Duration) -> Self
    where
        F: Fn() -> Fetch + Send + 'static,
    {
        let fetch = make();
        Self {
            make: Box::new(make),
            fetch,
            retries_left: max_retries,
            attempt: 0,
            delivered: false,
            max_delay,
        }
    }

    pub async fn next_event(&mut self) -> Option<FetchEvent> {
        loop {
            let event = self.fetch.next_event().await;
            match &event {
                Some(FetchEvent::Error(err))
                    if err.is_transient() && !self.delivered && self.retries_left > 0 =>
                {
                    self.retries_left -= 1;
                    self.attempt += 1;
                    let delay = backoff(self.attempt, self.max_delay);
                    tracing::warn!(
                        error = %err,
                        attempt = self.attempt,
                        ?delay,
                        "retrying transient storage error"
                    );
                    tokio::time::sleep(delay).await;
                    self.fetch = (self.make)();
                }
                Some(FetchEvent::Done) | Some(FetchEvent::Error(_)) | None => return event,
                Some(_) => {
                    self.delivered = true;
                    return event;
                }
            }
        }
    }

    pub fn cancel(&mut self) {
        self.fetch.cancel();
    }

    pub fn state(&self) -> FetchState {
        self.fetch.state()
    }

    pub fn is_finished(&self) -> bool {
        self.fetch.is_finished()
    }
}

fn backoff(attempt: u32, max_delay: Duration) -> Duration {
    let base = Duration::from_millis(50) * 2u32.saturating_pow(attempt.min(8));
    let capped = base.min(max_delay);
    // Spread retries out so synchronized failures do not retry in lockstep.
    let jitter = rand::thread_rng().gen_range(0.5..1.0);
    capped.mul_f64(jitter)
}
