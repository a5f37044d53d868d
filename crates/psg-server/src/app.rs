use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::SystemTime;

use psg_store::{PropCache, Storage};

use crate::Config;

/// Everything a request needs, constructed once at startup and passed
/// explicitly to handlers and processors.
pub struct AppContext {
    pub config: Config,
    pub cache: Arc<dyn PropCache>,
    pub storage: Arc<dyn Storage>,
    pub counters: AppCounters,
    /// Bounds the number of requests serviced at once.
    pub limiter: Arc<tokio::sync::Semaphore>,
    started_at: SystemTime,
}

impl AppContext {
    pub fn new(config: Config, cache: Arc<dyn PropCache>, storage: Arc<dyn Storage>) -> Self {
        let limiter = Arc::new(tokio::sync::Semaphore::new(config.max_connections));
        Self {
            config,
            cache,
            storage,
            counters: AppCounters::default(),
            limiter,
            started_at: SystemTime::now(),
        }
    }

    pub fn sat_name(&self, sat: i32) -> Option<&str> {
        self.config.sat_name(sat)
    }

    pub fn started_at(&self) -> SystemTime {
        self.started_at
    }
}

macro_rules! counters {
    ($($field:ident),* $(,)?) => {
        /// Monotonic per-process counters surfaced by the status endpoint.
        #[derive(Default)]
        pub struct AppCounters {
            $(pub $field: AtomicU64,)*
        }

        impl AppCounters {
            pub fn snapshot(&self) -> serde_json::Value {
                serde_json::json!({
                    $(stringify!($field): self.$field.load(Ordering::Relaxed),)*
                })
            }
        }
    };
}

counters! {
    bad_url,
    insufficient_args,
    malformed_args,
    resolve_not_found,
    resolve_error,
    blob_not_found,
    blob_error,
    split_history_not_found,
    invalid_id2_info,
    sat_to_sat_name,
    unknown_error,
    admin_requests,
    resolve_requests,
    get_requests,
    getblob_requests,
    tse_chunk_requests,
    annot_requests,
}

impl AppCounters {
    pub fn inc(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn snapshot_reports_increments() {
        let counters = AppCounters::default();
        AppCounters::inc(&counters.resolve_requests);
        AppCounters::inc(&counters.resolve_requests);
        AppCounters::inc(&counters.bad_url);

        let snap = counters.snapshot();
        assert_eq!(snap["resolve_requests"], 2);
        assert_eq!(snap["bad_url"], 1);
        assert_eq!(snap["blob_error"], 0);
    }
}
