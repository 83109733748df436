//! Owner-facing notifications emitted by the earnings pipeline.
//!
//! Each kind carries its own payload. Delivery is an external concern behind
//! the [`Notifier`] port and is always fire-and-forget: callers log failures
//! and carry on.

use std::time::SystemTime;

use crate::{AccountStatus, CoreError, Money, ShortCode, UserId};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Recipient {
    AllUsers,
    User(UserId),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum NotificationKind {
    /// Global CPM changed.
    RateChanged { rate: Money, effective_at: SystemTime },
    /// A link's validated clicks reached a multiple of the milestone step.
    ClickMilestone { link: ShortCode, milestone: u64 },
    AccountStatusChanged { status: AccountStatus },
    PayoutRecorded { amount: Money },
}

impl NotificationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationKind::RateChanged { .. } => "rate_changed",
            NotificationKind::ClickMilestone { .. } => "click_milestone",
            NotificationKind::AccountStatusChanged { .. } => "account_status_changed",
            NotificationKind::PayoutRecorded { .. } => "payout_recorded",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Notification {
    pub recipient: Recipient,
    pub kind: NotificationKind,
    pub created_at: SystemTime,
}

impl Notification {
    pub fn broadcast(kind: NotificationKind, created_at: SystemTime) -> Self {
        Self {
            recipient: Recipient::AllUsers,
            kind,
            created_at,
        }
    }

    pub fn to_user(user: UserId, kind: NotificationKind, created_at: SystemTime) -> Self {
        Self {
            recipient: Recipient::User(user),
            kind,
            created_at,
        }
    }
}

/// Delivery port for notifications.
pub trait Notifier: Send + Sync {
    fn notify(&self, notification: &Notification) -> Result<(), CoreError>;
}

/// Deliver and swallow failures with a warning.
pub(crate) fn dispatch(notifier: &dyn Notifier, notification: Notification) {
    if let Err(e) = notifier.notify(&notification) {
        tracing::warn!(
            kind = notification.kind.as_str(),
            err = %e,
            "notification delivery failed"
        );
    }
}
