use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, info};

use crate::clock::Clock;
use crate::domain::{DataAccessJob, JobStatus, RequestId};
use crate::error::StagingError;
use crate::events::{EventSink, JobEvent, TracingSink};
use crate::store::CacheStore;

/// Finds ready jobs about to expire and warns their owners once per job.
pub struct ExpiryNotifier<S: CacheStore> {
    store: Arc<S>,
    clock: Arc<dyn Clock>,
    sink: Arc<dyn EventSink>,
    notified: Mutex<HashSet<RequestId>>,
}

impl<S: CacheStore> ExpiryNotifier<S> {
    pub fn new(store: Arc<S>, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            clock,
            sink: Arc::new(TracingSink),
            notified: Mutex::new(HashSet::new()),
        }
    }

    pub fn with_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Ready jobs expiring in `(now, now + window]`, soonest first.
    pub fn find_jobs_near_expiry(
        &self,
        window: Duration,
    ) -> Result<Vec<DataAccessJob>, StagingError> {
        let now = self.clock.now();
        let until = now
            .checked_add_signed(window)
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        let mut jobs = self
            .store
            .find_expiring_between(now, until)?
            .into_iter()
            .filter(|job| job.status == JobStatus::Ready)
            .collect::<Vec<_>>();
        jobs.sort_by(|a, b| {
            a.expired_timestamp
                .cmp(&b.expired_timestamp)
                .then_with(|| a.request_id.cmp(&b.request_id))
        });
        Ok(jobs)
    }

    pub fn notify_expiring(&self, window: Duration) -> Result<usize, StagingError> {
        let jobs = self.find_jobs_near_expiry(window)?;
        let mut notified = self
            .notified
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        // Forget jobs that left the window so the set stays bounded.
        let current = jobs
            .iter()
            .map(|job| job.request_id.clone())
            .collect::<HashSet<_>>();
        notified.retain(|request_id| current.contains(request_id));

        let mut sent = 0;
        for job in jobs {
            let Some(expires_at) = job.expired_timestamp else {
                continue;
            };
            if !notified.insert(job.request_id.clone()) {
                debug!(request_id = %job.request_id, "expiry warning already sent");
                continue;
            }
            self.sink.event(JobEvent::ExpiringSoon {
                request_id: job.request_id,
                expires_at,
            });
            sent += 1;
        }
        if sent > 0 {
            info!(sent, window_hours = window.num_hours(), "sent expiry warnings");
        }
        Ok(sent)
    }
}
