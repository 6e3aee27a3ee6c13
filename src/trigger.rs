//! Interval trigger anchored to the completion time of the previous run.
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::sync::Arc;
use tokio::sync::watch;

/// Computes the next fire time of a recurring job.
///
/// The interval can be changed while the job is live; waiting loops subscribe
/// to changes and recompute their next fire time from the last completion.
#[derive(Debug, Clone)]
pub struct Trigger {
    interval: Arc<watch::Sender<u64>>,
}

impl Trigger {
    pub fn new(interval_seconds: u64) -> Self {
        let (tx, _rx) = watch::channel(interval_seconds);
        Self {
            interval: Arc::new(tx),
        }
    }

    pub fn interval_seconds(&self) -> u64 {
        *self.interval.borrow()
    }

    pub fn set_interval(&self, interval_seconds: u64) {
        self.interval.send_replace(interval_seconds);
    }

    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.interval.subscribe()
    }

    pub fn next_execution(&self, last_completion: Option<DateTime<Utc>>) -> DateTime<Utc> {
        next_execution(last_completion, self.interval_seconds())
    }
}

/// `last + interval`, or now when the job has never completed.
pub fn next_execution(last_completion: Option<DateTime<Utc>>, interval_seconds: u64) -> DateTime<Utc> {
    match last_completion {
        Some(last) => {
            let secs = i64::try_from(interval_seconds).unwrap_or(i64::MAX);
            ChronoDuration::try_seconds(secs)
                .and_then(|step| last.checked_add_signed(step))
                .unwrap_or(DateTime::<Utc>::MAX_UTC)
        }
        None => Utc::now(),
    }
}

/// Time left until `at`, zero when it already passed.
pub fn until(at: DateTime<Utc>) -> std::time::Duration {
    (at - Utc::now()).to_std().unwrap_or(std::time::Duration::ZERO)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn next_is_last_plus_interval() {
        let last = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
        let next = next_execution(Some(last), 90);
        assert_eq!(next, Utc.with_ymd_and_hms(2024, 3, 1, 12, 1, 30).unwrap());
    }

    #[test]
    fn first_run_fires_now() {
        let before = Utc::now();
        let next = next_execution(None, 3600);
        let after = Utc::now();
        assert!(next >= before && next <= after);
    }

    #[test]
    fn interval_change_applies_to_next_computation() {
        let trigger = Trigger::new(10);
        let last = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        assert_eq!(trigger.next_execution(Some(last)), last + ChronoDuration::seconds(10));

        let mut rx = trigger.subscribe();
        trigger.set_interval(60);
        assert!(rx.has_changed().unwrap());
        assert_eq!(trigger.interval_seconds(), 60);
        assert_eq!(trigger.next_execution(Some(last)), last + ChronoDuration::seconds(60));
    }

    #[test]
    fn huge_interval_saturates() {
        let last = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        assert_eq!(next_execution(Some(last), u64::MAX), DateTime::<Utc>::MAX_UTC);
    }

    #[test]
    fn until_past_is_zero() {
        let past = Utc::now() - ChronoDuration::seconds(5);
        assert_eq!(until(past), std::time::Duration::ZERO);
    }
}
