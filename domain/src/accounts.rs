//! Operator actions on the earnings slice of user accounts.

use std::sync::Arc;

use tracing::info;

use crate::notify::{dispatch, Notification, NotificationKind, Notifier};
use crate::rates::validate_rate;
use crate::{AccountStatus, Clock, CoreError, Money, User, UserId, UserRepository};

pub struct AccountService<S: ?Sized, C> {
    store: Arc<S>,
    notifier: Arc<dyn Notifier>,
    clock: C,
}

impl<S: UserRepository + ?Sized, C: Clock> AccountService<S, C> {
    pub fn new(store: Arc<S>, notifier: Arc<dyn Notifier>, clock: C) -> Self {
        Self {
            store,
            notifier,
            clock,
        }
    }

    pub fn get(&self, id: &UserId) -> Result<User, CoreError> {
        self.store.get_user(id)?.ok_or(CoreError::NotFound)
    }

    /// Set or clear a user's custom rate. A custom rate must be positive;
    /// `None` falls back to the global ledger.
    pub fn set_custom_rate(&self, id: &UserId, rate: Option<Money>) -> Result<User, CoreError> {
        if let Some(r) = rate {
            if r.is_zero() {
                return Err(CoreError::InvalidAmount(
                    "custom rate must be positive".into(),
                ));
            }
            validate_rate(r)?;
        }
        let user = self.store.set_custom_rate(id, rate)?;
        info!(user = %id.as_str(), rate = ?rate.map(|r| r.to_string()), "custom rate set");
        Ok(user)
    }

    pub fn set_status(&self, id: &UserId, status: AccountStatus) -> Result<User, CoreError> {
        let before = self.get(id)?;
        let user = self.store.set_account_status(id, status)?;
        if before.status != status {
            info!(user = %id.as_str(), status = status.as_str(), "account status changed");
            dispatch(
                self.notifier.as_ref(),
                Notification::to_user(
                    id.clone(),
                    NotificationKind::AccountStatusChanged { status },
                    self.clock.now(),
                ),
            );
        }
        Ok(user)
    }

    /// Record money paid to the user. Payouts never exceed generated earnings.
    pub fn record_payout(&self, id: &UserId, amount: Money) -> Result<User, CoreError> {
        if amount.is_zero() {
            return Err(CoreError::InvalidAmount("payout must be positive".into()));
        }
        let user = self.store.record_payout(id, amount)?;
        info!(user = %id.as_str(), amount = %amount, paid_out = %user.paid_out, "payout recorded");
        dispatch(
            self.notifier.as_ref(),
            Notification::to_user(
                id.clone(),
                NotificationKind::PayoutRecorded { amount },
                self.clock.now(),
            ),
        );
        Ok(user)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::memory_repo::InMemoryStore;
    use crate::adapters::notifier::RecordingNotifier;
    use crate::adapters::ManualClock;
    use crate::notify::Recipient;

    fn uid() -> UserId {
        UserId::new("alice").unwrap()
    }

    fn service() -> (AccountService<InMemoryStore, ManualClock>, Arc<RecordingNotifier>) {
        let store = Arc::new(InMemoryStore::new());
        let clock = ManualClock::at_secs(7);
        store.insert_user(User::new(uid(), clock.now())).unwrap();
        let notifier = Arc::new(RecordingNotifier::new());
        let svc = AccountService::new(store, notifier.clone(), clock);
        (svc, notifier)
    }

    #[test]
    fn get_returns_seeded_account() {
        let (svc, _) = service();
        let user = svc.get(&uid()).unwrap();
        assert!(user.is_active());
        assert_eq!(user.generated_earnings, Money::ZERO);
        assert!(matches!(
            svc.get(&UserId::new("ghost").unwrap()),
            Err(CoreError::NotFound)
        ));
    }

    #[test]
    fn custom_rate_must_be_positive() {
        let (svc, _) = service();
        assert!(matches!(
            svc.set_custom_rate(&uid(), Some(Money::ZERO)),
            Err(CoreError::InvalidAmount(_))
        ));
        let u = svc
            .set_custom_rate(&uid(), Some(Money::parse("5").unwrap()))
            .unwrap();
        assert_eq!(u.effective_custom_rate(), Some(Money::parse("5").unwrap()));
        let cleared = svc.set_custom_rate(&uid(), None).unwrap();
        assert_eq!(cleared.custom_rate, None);
    }

    #[test]
    fn status_change_notifies_once() {
        let (svc, notifier) = service();
        svc.set_status(&uid(), AccountStatus::Suspended).unwrap();
        svc.set_status(&uid(), AccountStatus::Suspended).unwrap();
        let sent = notifier.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].recipient, Recipient::User(uid()));
        assert_eq!(
            sent[0].kind,
            NotificationKind::AccountStatusChanged {
                status: AccountStatus::Suspended
            }
        );
    }

    #[test]
    fn payout_cannot_exceed_earnings() {
        let (svc, notifier) = service();
        assert!(matches!(
            svc.record_payout(&uid(), Money::parse("1").unwrap()),
            Err(CoreError::InvalidState(_))
        ));
        assert!(matches!(
            svc.record_payout(&uid(), Money::ZERO),
            Err(CoreError::InvalidAmount(_))
        ));
        assert!(notifier.sent().is_empty());
        assert!(matches!(
            svc.record_payout(&UserId::new("ghost").unwrap(), Money::parse("1").unwrap()),
            Err(CoreError::NotFound)
        ));
    }
}
