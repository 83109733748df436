//! Rate ledger: time-bounded history of the global CPM.

use std::sync::Arc;

use tracing::{info, warn};

use crate::notify::{dispatch, Notification, NotificationKind, Notifier};
use crate::{retry_on_conflict, Clock, CoreError, Money, RatePeriod, RatePeriodId, RateRepository};

/// Rate used when no period covers the requested instant. Deliberately not
/// zero: a gap in the history must not silently pause earnings.
pub const DEFAULT_FALLBACK_RATE: Money = Money::from_nanos(1_000_000_000);

const MAX_RATE_ATTEMPTS: usize = 3;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RateSource {
    Period(RatePeriodId),
    /// No period covered the instant; the configured fallback applied.
    Fallback,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ActiveRate {
    pub rate: Money,
    pub source: RateSource,
}

/// Rates must split evenly into per-event amounts.
pub fn validate_rate(rate: Money) -> Result<(), CoreError> {
    if rate.to_decimal().normalize().scale() > 6 {
        return Err(CoreError::InvalidAmount(
            "rate supports at most 6 decimal places".into(),
        ));
    }
    Ok(())
}

pub struct RateLedger<S: ?Sized, C> {
    store: Arc<S>,
    notifier: Arc<dyn Notifier>,
    clock: C,
    fallback: Money,
}

impl<S: RateRepository + ?Sized, C: Clock> RateLedger<S, C> {
    pub fn new(store: Arc<S>, notifier: Arc<dyn Notifier>, clock: C) -> Self {
        Self {
            store,
            notifier,
            clock,
            fallback: DEFAULT_FALLBACK_RATE,
        }
    }

    pub fn with_fallback(mut self, fallback: Money) -> Self {
        self.fallback = fallback;
        self
    }

    /// Rate whose period satisfies `starts_at <= as_of < ends_at-or-open`.
    pub fn active_rate(&self, as_of: std::time::SystemTime) -> Result<ActiveRate, CoreError> {
        match self.store.find_rate_period(as_of)? {
            Some(period) => Ok(ActiveRate {
                rate: period.rate,
                source: RateSource::Period(period.id),
            }),
            None => {
                warn!(fallback = %self.fallback, "no rate period covers instant, using fallback rate");
                Ok(ActiveRate {
                    rate: self.fallback,
                    source: RateSource::Fallback,
                })
            }
        }
    }

    pub fn current_rate(&self) -> Result<ActiveRate, CoreError> {
        self.active_rate(self.clock.now())
    }

    /// All periods, oldest first.
    pub fn history(&self) -> Result<Vec<RatePeriod>, CoreError> {
        self.store.list_rate_periods()
    }

    /// Close the open period and open a new one at `rate`, then broadcast the
    /// change. Delivery failures never undo the change.
    pub fn set_new_rate(&self, rate: Money) -> Result<RatePeriod, CoreError> {
        validate_rate(rate)?;
        let now = self.clock.now();
        let period = retry_on_conflict(MAX_RATE_ATTEMPTS, || self.store.open_rate_period(rate, now))?;
        info!(period_id = period.id.0, rate = %rate, "rate period opened");
        dispatch(
            self.notifier.as_ref(),
            Notification::broadcast(
                NotificationKind::RateChanged {
                    rate,
                    effective_at: period.starts_at,
                },
                now,
            ),
        );
        Ok(period)
    }

    /// Open a first period when the history is empty. Used at startup; no
    /// broadcast is sent for the seed.
    pub fn seed_if_empty(&self, rate: Money) -> Result<Option<RatePeriod>, CoreError> {
        validate_rate(rate)?;
        if !self.store.list_rate_periods()?.is_empty() {
            return Ok(None);
        }
        let period = self.store.open_rate_period(rate, self.clock.now())?;
        info!(period_id = period.id.0, rate = %rate, "rate ledger seeded");
        Ok(Some(period))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::memory_repo::InMemoryStore;
    use crate::adapters::notifier::RecordingNotifier;
    use crate::adapters::ManualClock;
    use std::time::{Duration, SystemTime};

    fn ledger() -> (
        RateLedger<InMemoryStore, ManualClock>,
        Arc<RecordingNotifier>,
        ManualClock,
    ) {
        let store = Arc::new(InMemoryStore::new());
        let notifier = Arc::new(RecordingNotifier::new());
        let clock = ManualClock::at_secs(1_000);
        let ledger = RateLedger::new(store, notifier.clone(), clock.clone());
        (ledger, notifier, clock)
    }

    #[test]
    fn empty_ledger_falls_back() {
        let (ledger, _, _) = ledger();
        let active = ledger.current_rate().unwrap();
        assert_eq!(active.source, RateSource::Fallback);
        assert_eq!(active.rate, DEFAULT_FALLBACK_RATE);
    }

    #[test]
    fn zero_rate_is_distinct_from_unconfigured() {
        let (ledger, _, clock) = ledger();
        let p = ledger.set_new_rate(Money::ZERO).unwrap();
        clock.advance(Duration::from_secs(1));
        let active = ledger.current_rate().unwrap();
        assert_eq!(active.rate, Money::ZERO);
        assert_eq!(active.source, RateSource::Period(p.id));
    }

    #[test]
    fn n_updates_leave_n_closed_and_one_open() {
        let (ledger, notifier, clock) = ledger();
        for i in 1..=5u64 {
            ledger.set_new_rate(Money::from_units(i).unwrap()).unwrap();
            clock.advance(Duration::from_secs(10));
        }
        let history = ledger.history().unwrap();
        assert_eq!(history.len(), 5);
        assert_eq!(history.iter().filter(|p| p.is_open()).count(), 1);
        assert!(history.last().unwrap().is_open());
        for pair in history.windows(2) {
            assert_eq!(pair[0].ends_at, Some(pair[1].starts_at));
            assert!(pair[0].starts_at < pair[1].starts_at);
        }
        assert_eq!(notifier.sent().len(), 5);
    }

    #[test]
    fn rate_change_scenario_three_to_four() {
        let (ledger, _, clock) = ledger();
        ledger.set_new_rate(Money::parse("3.00").unwrap()).unwrap();
        let before = clock.now();
        clock.advance(Duration::from_secs(60));
        let new_period = ledger.set_new_rate(Money::parse("4.00").unwrap()).unwrap();

        let history = ledger.history().unwrap();
        assert_eq!(history[0].ends_at, Some(new_period.starts_at));
        assert!(new_period.is_open());
        assert_eq!(ledger.current_rate().unwrap().rate, Money::parse("4.00").unwrap());
        assert_eq!(ledger.active_rate(before).unwrap().rate, Money::parse("3.00").unwrap());
    }

    #[test]
    fn instant_before_history_uses_fallback() {
        let (ledger, _, _) = ledger();
        ledger.set_new_rate(Money::parse("3").unwrap()).unwrap();
        let early = SystemTime::UNIX_EPOCH + Duration::from_secs(10);
        assert_eq!(ledger.active_rate(early).unwrap().source, RateSource::Fallback);
    }

    #[test]
    fn notifier_failure_keeps_rate_change() {
        let store = Arc::new(InMemoryStore::new());
        let notifier = Arc::new(RecordingNotifier::failing());
        let ledger = RateLedger::new(store, notifier, ManualClock::at_secs(5));
        let p = ledger.set_new_rate(Money::parse("2.5").unwrap()).unwrap();
        assert_eq!(ledger.history().unwrap(), vec![p]);
    }

    #[test]
    fn rejects_rates_that_do_not_split_per_event() {
        let (ledger, _, _) = ledger();
        let err = ledger.set_new_rate(Money::parse("0.0000001").unwrap()).unwrap_err();
        assert!(matches!(err, CoreError::InvalidAmount(_)));
    }

    #[test]
    fn seed_only_when_empty() {
        let (ledger, notifier, clock) = ledger();
        assert!(ledger.seed_if_empty(Money::parse("3").unwrap()).unwrap().is_some());
        clock.advance(Duration::from_secs(1));
        assert!(ledger.seed_if_empty(Money::parse("9").unwrap()).unwrap().is_none());
        assert_eq!(ledger.history().unwrap().len(), 1);
        assert!(notifier.sent().is_empty());
    }
}
