//! Per-domain job discipline.
//!
//! A job is an exclusive reservation of a domain for one state-changing (or
//! consistency-requiring) operation. Jobs are granted one at a time; waiters
//! block on the domain's condition variable until the slot frees up or their
//! deadline passes.

use super::Domain;
use crate::error::{Error, Result};
use std::thread::ThreadId;
use std::time::{Duration, Instant};

/// Job kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum JobKind {
    /// No job.
    #[default]
    None,
    /// Read-only, consistent view.
    Query,
    /// Forced termination.
    Destroy,
    /// State change.
    Modify,
}

impl JobKind {
    /// Get the job name as a string.
    pub fn name(&self) -> &'static str {
        match self {
            JobKind::None => "none",
            JobKind::Query => "query",
            JobKind::Destroy => "destroy",
            JobKind::Modify => "modify",
        }
    }
}

/// Job slot embedded in the domain.
#[derive(Debug, Default)]
pub struct Job {
    /// Active kind.
    pub active: JobKind,
    /// Thread holding the job.
    pub owner: Option<ThreadId>,
    /// When the job started.
    pub started: Option<Instant>,
}

impl Job {
    fn reset(&mut self) {
        self.active = JobKind::None;
        self.owner = None;
        self.started = None;
    }
}

/// RAII token for an acquired job. Dropping it ends the job.
#[must_use = "dropping the guard ends the job immediately"]
pub struct JobGuard<'a> {
    domain: &'a Domain,
    kind: JobKind,
}

impl<'a> JobGuard<'a> {
    /// Domain the job is held on.
    pub fn domain(&self) -> &'a Domain {
        self.domain
    }

    /// Kind of the held job.
    pub fn kind(&self) -> JobKind {
        self.kind
    }
}

impl Drop for JobGuard<'_> {
    fn drop(&mut self) {
        self.domain.end_job();
    }
}

impl Domain {
    /// Acquire a job, waiting up to `timeout` for the current holder.
    pub fn begin_job(&self, kind: JobKind, timeout: Duration) -> Result<JobGuard<'_>> {
        let deadline = Instant::now() + timeout;
        let mut inner = self.inner.lock();

        while inner.job.active != JobKind::None {
            tracing::debug!(
                domain = %self.name(),
                wanted = kind.name(),
                held = inner.job.active.name(),
                "waiting for job"
            );
            if self.job_cond.wait_until(&mut inner, deadline).timed_out()
                && inner.job.active != JobKind::None
            {
                tracing::warn!(
                    domain = %self.name(),
                    held = inner.job.active.name(),
                    owner = ?inner.job.owner,
                    "cannot acquire job"
                );
                return Err(Error::JobTimeout {
                    owner: inner.job.active.name().to_string(),
                });
            }
        }

        inner.job.active = kind;
        inner.job.owner = Some(std::thread::current().id());
        inner.job.started = Some(Instant::now());
        tracing::trace!(domain = %self.name(), job = kind.name(), "job started");

        Ok(JobGuard { domain: self, kind })
    }

    /// Release the job and wake every waiter.
    fn end_job(&self) {
        let mut inner = self.inner.lock();
        tracing::trace!(domain = %self.name(), job = inner.job.active.name(), "job ended");
        inner.job.reset();
        self.job_cond.notify_all();
    }

    /// Kind of job currently held, if any.
    pub fn active_job(&self) -> JobKind {
        self.inner.lock().job.active
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::def::DomainDef;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn domain() -> Arc<Domain> {
        Arc::new(Domain::new(DomainDef::new("job-test", 1, 1024)))
    }

    #[test]
    fn test_guard_releases_on_drop() {
        let dom = domain();
        {
            let job = dom.begin_job(JobKind::Modify, Duration::from_secs(1)).unwrap();
            assert_eq!(job.kind(), JobKind::Modify);
            assert_eq!(dom.active_job(), JobKind::Modify);
        }
        assert_eq!(dom.active_job(), JobKind::None);
    }

    #[test]
    fn test_second_job_times_out() {
        let dom = domain();
        let _held = dom.begin_job(JobKind::Modify, Duration::from_secs(1)).unwrap();

        let other = Arc::clone(&dom);
        let err = std::thread::spawn(move || {
            other
                .begin_job(JobKind::Modify, Duration::from_millis(50))
                .map(|_| ())
                .unwrap_err()
        })
        .join()
        .unwrap();

        assert_eq!(err.kind(), crate::error::ErrorKind::OperationTimeout);
        assert!(err.to_string().contains("state change lock"));
    }

    #[test]
    fn test_waiter_gets_job_after_release() {
        let dom = domain();
        let held = dom.begin_job(JobKind::Modify, Duration::from_secs(1)).unwrap();

        let other = Arc::clone(&dom);
        let waiter = std::thread::spawn(move || {
            let job = other.begin_job(JobKind::Query, Duration::from_secs(5)).unwrap();
            job.kind()
        });

        std::thread::sleep(Duration::from_millis(50));
        drop(held);
        assert_eq!(waiter.join().unwrap(), JobKind::Query);
    }

    #[test]
    fn test_at_most_one_job_at_a_time() {
        let dom = domain();
        let inside = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let dom = Arc::clone(&dom);
                let inside = Arc::clone(&inside);
                let max_seen = Arc::clone(&max_seen);
                std::thread::spawn(move || {
                    for _ in 0..10 {
                        let _job = dom.begin_job(JobKind::Modify, Duration::from_secs(10)).unwrap();
                        let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                        max_seen.fetch_max(now, Ordering::SeqCst);
                        std::thread::yield_now();
                        inside.fetch_sub(1, Ordering::SeqCst);
                    }
                })
            })
            .collect();

        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(max_seen.load(Ordering::SeqCst), 1);
    }
}
