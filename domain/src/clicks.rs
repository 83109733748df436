//! Click ledger: visit recording, the uniqueness policy and milestones.
//!
//! Uniqueness policy. A visit is server-side unique when no earlier click on
//! the same link inside the dedup window carries the same requester key or,
//! if the visitor sent one, the same client token. Without a requester key
//! (proxied or anonymized traffic) only the client token is compared, and
//! with neither signal the visit counts as unique and the client's first-use
//! flag is the only guard. This is best-effort replay protection.

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use tracing::debug;

use crate::{
    retry_on_conflict, ClickEvent, ClickRepository, Clock, CoreError, Link, LinkRepository,
    NewClick, SettleReason, ShortCode, User, UserRepository, VisitSignals,
};

pub const DEFAULT_DEDUP_WINDOW: Duration = Duration::from_secs(60 * 60);
pub const DEFAULT_MILESTONE_STEP: u64 = 1000;

const MAX_RECORD_ATTEMPTS: usize = 3;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ClickPolicy {
    pub dedup_window: Duration,
    /// Validated clicks between owner milestone notifications.
    pub milestone_step: u64,
}

impl Default for ClickPolicy {
    fn default() -> Self {
        Self {
            dedup_window: DEFAULT_DEDUP_WINDOW,
            milestone_step: DEFAULT_MILESTONE_STEP,
        }
    }
}

/// Result of appending a visit.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VisitRecord {
    pub click: ClickEvent,
    /// Verdict at record time; settlement re-checks against fresh state.
    pub billable: bool,
    pub reason: SettleReason,
}

/// Whether a click against a previous one counts as the same requester.
pub fn same_requester(prior: &ClickEvent, click: &NewClick) -> bool {
    let key_match = match (&prior.requester_key, &click.signals.requester_key) {
        (Some(a), Some(b)) => a == b,
        _ => false,
    };
    let token_match = match (&prior.client_token, &click.signals.client_token) {
        (Some(a), Some(b)) => a == b,
        _ => false,
    };
    key_match || token_match
}

/// The single billability predicate. Checks run in a fixed order so the
/// recorded reason is the most fundamental one.
pub fn classify(link: Option<&Link>, owner: Option<&User>, click: &ClickEvent) -> SettleReason {
    let Some(link) = link else {
        return SettleReason::LinkNotFound;
    };
    let Some(owner) = owner else {
        return SettleReason::OwnerNotFound;
    };
    if link.suspended {
        SettleReason::LinkSuspended
    } else if !owner.is_active() {
        SettleReason::OwnerSuspended
    } else if !link.monetizable {
        SettleReason::NotMonetizable
    } else if !click.server_unique {
        SettleReason::Duplicate
    } else if !click.client_first_use {
        SettleReason::ClientRepeat
    } else {
        SettleReason::Billed
    }
}

/// Write-time check for a settlement computed as billable. Adapters call this
/// inside the settlement transaction with the link and owner as stored; a
/// `false` means the engine's reads are stale and it must re-read.
pub fn still_billable(link: &Link, owner: &User, click: &ClickEvent) -> bool {
    link.owner == owner.id && classify(Some(link), Some(owner), click).is_billable()
}

/// Milestone newly reached when `real_clicks` validated clicks have been
/// counted and `milestones_reached` were already announced. Adapters call
/// this inside the settlement transaction.
pub fn milestone_crossed(real_clicks: u64, milestones_reached: u64, step: u64) -> Option<u64> {
    if step == 0 {
        return None;
    }
    let reached = real_clicks / step;
    (reached > milestones_reached).then(|| reached * step)
}

pub struct ClickLedger<S: ?Sized, C> {
    store: Arc<S>,
    clock: C,
    policy: ClickPolicy,
}

impl<S, C> ClickLedger<S, C>
where
    S: LinkRepository + UserRepository + ClickRepository + ?Sized,
    C: Clock,
{
    pub fn new(store: Arc<S>, clock: C, policy: ClickPolicy) -> Self {
        Self {
            store,
            clock,
            policy,
        }
    }

    pub fn policy(&self) -> ClickPolicy {
        self.policy
    }

    /// Append exactly one click for the visit and report its preliminary
    /// verdict. Fails with `NotFound` for an unknown link.
    pub fn record_visit(
        &self,
        code: &ShortCode,
        signals: VisitSignals,
    ) -> Result<VisitRecord, CoreError> {
        let link = self.store.get_link(code)?.ok_or(CoreError::NotFound)?;
        let now = self.clock.now();
        let since = now
            .checked_sub(self.policy.dedup_window)
            .unwrap_or(SystemTime::UNIX_EPOCH);
        let click = retry_on_conflict(MAX_RECORD_ATTEMPTS, || {
            self.store.record_click(
                NewClick {
                    link: code.clone(),
                    clicked_at: now,
                    signals: signals.clone(),
                },
                since,
            )
        })?;
        let owner = self.store.get_user(&link.owner)?;
        let reason = classify(Some(&link), owner.as_ref(), &click);
        debug!(
            code = %code.as_str(),
            click_id = click.id.0,
            server_unique = click.server_unique,
            reason = reason.as_str(),
            "visit recorded"
        );
        Ok(VisitRecord {
            billable: reason.is_billable(),
            reason,
            click,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::memory_repo::InMemoryStore;
    use crate::adapters::ManualClock;
    use crate::{ClickId, RequesterKey, Rule, RuleKind, UserId};

    fn rules(n: usize) -> Vec<Rule> {
        (0..n)
            .map(|i| Rule {
                kind: RuleKind::Like,
                target_url: format!("https://social.example/{i}"),
                position: i as u32,
            })
            .collect()
    }

    fn setup(rule_count: usize) -> (ClickLedger<InMemoryStore, ManualClock>, Arc<InMemoryStore>, ManualClock, ShortCode) {
        let store = Arc::new(InMemoryStore::new());
        let clock = ManualClock::at_secs(10_000);
        let owner = UserId::new("owner").unwrap();
        store.insert_user(User::new(owner.clone(), clock.now())).unwrap();
        let code = ShortCode::new("gate1").unwrap();
        store
            .insert_link(Link::new(
                code.clone(),
                owner,
                "https://dest.example".into(),
                rules(rule_count),
                clock.now(),
            ))
            .unwrap();
        let ledger = ClickLedger::new(store.clone(), clock.clone(), ClickPolicy::default());
        (ledger, store, clock, code)
    }

    fn from(ip: &str) -> VisitSignals {
        VisitSignals {
            requester_key: RequesterKey::new(ip),
            client_token: None,
            client_first_use: true,
        }
    }

    #[test]
    fn first_visit_is_billable() {
        let (ledger, store, _, code) = setup(3);
        let rec = ledger.record_visit(&code, from("1.1.1.1")).unwrap();
        assert!(rec.billable);
        assert_eq!(rec.reason, SettleReason::Billed);
        assert!(!rec.click.processed);
        assert_eq!(store.get_link(&code).unwrap().unwrap().total_clicks, 1);
    }

    #[test]
    fn same_requester_inside_window_is_duplicate() {
        let (ledger, _, clock, code) = setup(3);
        ledger.record_visit(&code, from("1.1.1.1")).unwrap();
        clock.advance(Duration::from_secs(30 * 60));
        let second = ledger.record_visit(&code, from("1.1.1.1")).unwrap();
        assert!(!second.billable);
        assert_eq!(second.reason, SettleReason::Duplicate);
    }

    #[test]
    fn same_requester_after_window_is_unique_again() {
        let (ledger, _, clock, code) = setup(3);
        ledger.record_visit(&code, from("1.1.1.1")).unwrap();
        clock.advance(Duration::from_secs(61 * 60));
        assert!(ledger.record_visit(&code, from("1.1.1.1")).unwrap().billable);
    }

    #[test]
    fn missing_requester_key_falls_back_to_client_token() {
        let (ledger, _, _, code) = setup(3);
        let anon = VisitSignals {
            requester_key: None,
            client_token: Some("tok-1".into()),
            client_first_use: true,
        };
        assert!(ledger.record_visit(&code, anon.clone()).unwrap().billable);
        assert_eq!(
            ledger.record_visit(&code, anon).unwrap().reason,
            SettleReason::Duplicate
        );
        let no_signals = VisitSignals {
            client_first_use: true,
            ..Default::default()
        };
        assert!(ledger.record_visit(&code, no_signals).unwrap().billable);
    }

    #[test]
    fn client_repeat_is_not_billable() {
        let (ledger, _, _, code) = setup(3);
        let mut s = from("2.2.2.2");
        s.client_first_use = false;
        assert_eq!(
            ledger.record_visit(&code, s).unwrap().reason,
            SettleReason::ClientRepeat
        );
    }

    #[test]
    fn fewer_than_three_rules_never_billable() {
        let (ledger, _, _, code) = setup(2);
        let rec = ledger.record_visit(&code, from("3.3.3.3")).unwrap();
        assert_eq!(rec.reason, SettleReason::NotMonetizable);
    }

    #[test]
    fn unknown_link_is_not_found_and_not_recorded() {
        let (ledger, store, _, _) = setup(3);
        let missing = ShortCode::new("nope").unwrap();
        assert!(matches!(
            ledger.record_visit(&missing, from("1.1.1.1")),
            Err(CoreError::NotFound)
        ));
        assert!(store.get_click(ClickId(1)).unwrap().is_none());
    }

    #[test]
    fn still_billable_tracks_link_and_owner() {
        let (ledger, store, _, code) = setup(3);
        let rec = ledger.record_visit(&code, from("4.4.4.4")).unwrap();
        let mut link = store.get_link(&code).unwrap().unwrap();
        let mut owner = store.get_user(&link.owner).unwrap().unwrap();
        assert!(still_billable(&link, &owner, &rec.click));

        owner.status = crate::AccountStatus::Suspended;
        assert!(!still_billable(&link, &owner, &rec.click));
        owner.status = crate::AccountStatus::Active;

        link.suspended = true;
        assert!(!still_billable(&link, &owner, &rec.click));
        link.suspended = false;

        let stranger = User::new(UserId::new("someone").unwrap(), SystemTime::UNIX_EPOCH);
        assert!(!still_billable(&link, &stranger, &rec.click));
    }

    #[test]
    fn milestone_math() {
        assert_eq!(milestone_crossed(999, 0, 1000), None);
        assert_eq!(milestone_crossed(1000, 0, 1000), Some(1000));
        assert_eq!(milestone_crossed(1001, 1, 1000), None);
        assert_eq!(milestone_crossed(2000, 1, 1000), Some(2000));
        assert_eq!(milestone_crossed(5, 0, 0), None);
    }
}
