//! Settlement engine: turns recorded clicks into earnings.
//!
//! Every click settles exactly once. The engine reads fresh link, owner and
//! rate state, computes the per-mille amount, and hands a [`Settlement`] to
//! the store, which applies the click update, the link and owner credits and
//! the milestone check as one atomic operation. A lost race is retried with
//! fresh reads; a click already processed is returned untouched.

use std::sync::Arc;
use std::time::SystemTime;

use tracing::{info, warn};

use crate::clicks::{classify, ClickLedger, ClickPolicy};
use crate::notify::{dispatch, Notification, NotificationKind, Notifier};
use crate::rates::RateLedger;
use crate::{
    ClickEvent, ClickId, Clock, CoreError, Money, SettleReason, Settlement, SettlementApplied,
    ShortCode, Store, User, VisitSignals,
};

pub const MAX_SETTLE_ATTEMPTS: usize = 3;
pub const RECONCILE_PAGE_SIZE: usize = 200;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SettleOutcome {
    pub click_id: ClickId,
    pub billable: bool,
    pub amount: Money,
    pub rate_applied: Option<Money>,
    pub reason: SettleReason,
    /// True when the click had been settled before this call.
    pub already_processed: bool,
}

impl SettleOutcome {
    fn from_processed(click: &ClickEvent) -> Self {
        Self {
            click_id: click.id,
            billable: click.billable,
            amount: click.amount,
            rate_applied: click.rate_applied,
            reason: click.reason.unwrap_or(SettleReason::Billed),
            already_processed: true,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BatchReport {
    pub processed_count: u64,
    pub total_earnings_settled: Money,
    /// Clicks left unprocessed because the store kept failing; a later run
    /// picks them up again.
    pub failed_count: u64,
}

pub struct SettlementEngine<S: ?Sized, C> {
    store: Arc<S>,
    notifier: Arc<dyn Notifier>,
    clock: C,
    rates: RateLedger<S, C>,
    clicks: ClickLedger<S, C>,
}

impl<S: Store + ?Sized, C: Clock + Clone> SettlementEngine<S, C> {
    pub fn new(store: Arc<S>, notifier: Arc<dyn Notifier>, clock: C, policy: ClickPolicy) -> Self {
        Self {
            rates: RateLedger::new(store.clone(), notifier.clone(), clock.clone()),
            clicks: ClickLedger::new(store.clone(), clock.clone(), policy),
            store,
            notifier,
            clock,
        }
    }

    pub fn with_fallback_rate(mut self, fallback: Money) -> Self {
        self.rates = self.rates.with_fallback(fallback);
        self
    }

    pub fn rates(&self) -> &RateLedger<S, C> {
        &self.rates
    }

    pub fn clicks(&self) -> &ClickLedger<S, C> {
        &self.clicks
    }

    /// Record a visit and settle it immediately.
    pub fn settle_visit(
        &self,
        code: &ShortCode,
        signals: VisitSignals,
    ) -> Result<SettleOutcome, CoreError> {
        let record = self.clicks.record_visit(code, signals)?;
        self.settle(record.click.id)
    }

    /// Settle one click. Idempotent: a processed click is reported as-is.
    pub fn settle(&self, click_id: ClickId) -> Result<SettleOutcome, CoreError> {
        crate::retry_on_conflict(MAX_SETTLE_ATTEMPTS, || self.settle_once(click_id))
    }

    fn settle_once(&self, click_id: ClickId) -> Result<SettleOutcome, CoreError> {
        let click = self.store.get_click(click_id)?.ok_or(CoreError::NotFound)?;
        if click.processed {
            return Ok(SettleOutcome::from_processed(&click));
        }

        let link = self.store.get_link(&click.link)?;
        let owner = match &link {
            Some(l) => self.store.get_user(&l.owner)?,
            None => None,
        };
        let reason = classify(link.as_ref(), owner.as_ref(), &click);

        let (rate_applied, amount) = match (&owner, reason.is_billable()) {
            (Some(owner), true) => {
                let rate = self.resolve_rate(owner, click.clicked_at)?;
                (Some(rate), rate.per_event())
            }
            _ => (None, Money::ZERO),
        };

        let settlement = Settlement {
            click_id,
            link: click.link.clone(),
            owner: owner.as_ref().map(|u| u.id.clone()),
            billable: reason.is_billable(),
            rate_applied,
            amount,
            reason,
            processed_at: self.clock.now(),
            milestone_step: self.clicks.policy().milestone_step,
        };

        match self.store.apply_settlement(&settlement)? {
            SettlementApplied::AlreadyProcessed(existing) => {
                Ok(SettleOutcome::from_processed(&existing))
            }
            SettlementApplied::Applied { crossed_milestone } => {
                info!(
                    code = %click.link.as_str(),
                    click_id = click_id.0,
                    reason = reason.as_str(),
                    amount = %amount,
                    "click settled"
                );
                if let (Some(milestone), Some(owner)) = (crossed_milestone, &owner) {
                    dispatch(
                        self.notifier.as_ref(),
                        Notification::to_user(
                            owner.id.clone(),
                            NotificationKind::ClickMilestone {
                                link: click.link.clone(),
                                milestone,
                            },
                            settlement.processed_at,
                        ),
                    );
                }
                Ok(SettleOutcome {
                    click_id,
                    billable: settlement.billable,
                    amount,
                    rate_applied,
                    reason,
                    already_processed: false,
                })
            }
        }
    }

    /// Owner's positive custom rate, else the ledger rate at `at`.
    fn resolve_rate(&self, owner: &User, at: SystemTime) -> Result<Money, CoreError> {
        if let Some(custom) = owner.effective_custom_rate() {
            return Ok(custom);
        }
        Ok(self.rates.active_rate(at)?.rate)
    }

    /// Settle every unprocessed click. Safe to run repeatedly; a failure on
    /// one click never stops the batch.
    pub fn reconcile(&self) -> Result<BatchReport, CoreError> {
        let mut report = BatchReport::default();
        let mut cursor = None;
        loop {
            let page = self.store.list_unprocessed(cursor, RECONCILE_PAGE_SIZE)?;
            let Some(last) = page.last() else {
                break;
            };
            cursor = Some(last.id);
            for click in &page {
                match self.settle(click.id) {
                    Ok(outcome) if !outcome.already_processed => {
                        report.processed_count += 1;
                        report.total_earnings_settled =
                            report.total_earnings_settled.saturating_add(outcome.amount);
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!(click_id = click.id.0, err = %e, "reconcile: click left pending");
                        report.failed_count += 1;
                    }
                }
            }
        }
        info!(
            processed = report.processed_count,
            failed = report.failed_count,
            total = %report.total_earnings_settled,
            "reconcile finished"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::memory_repo::InMemoryStore;
    use crate::adapters::notifier::RecordingNotifier;
    use crate::adapters::ManualClock;
    use crate::notify::Recipient;
    use crate::{
        AccountStatus, ClickRepository, Link, LinkRepository, NewClick, RateRepository, RatePeriod,
        RequesterKey, Rule, RuleKind, SettlementRepository, SponsorRepository, SponsorRule, UserId,
        UserRepository,
    };
    use std::time::Duration;

    struct Fixture {
        engine: Arc<SettlementEngine<InMemoryStore, ManualClock>>,
        store: Arc<InMemoryStore>,
        notifier: Arc<RecordingNotifier>,
        clock: ManualClock,
        owner: UserId,
        code: ShortCode,
    }

    fn rules(n: usize) -> Vec<Rule> {
        (0..n)
            .map(|i| Rule {
                kind: RuleKind::Follow,
                target_url: format!("https://social.example/{i}"),
                position: i as u32,
            })
            .collect()
    }

    fn fixture_with(rule_count: usize, policy: ClickPolicy) -> Fixture {
        let store = Arc::new(InMemoryStore::new());
        let notifier = Arc::new(RecordingNotifier::new());
        let clock = ManualClock::at_secs(50_000);
        let owner = UserId::new("owner-1").unwrap();
        store.insert_user(User::new(owner.clone(), clock.now())).unwrap();
        let code = ShortCode::new("earn1").unwrap();
        store
            .insert_link(Link::new(
                code.clone(),
                owner.clone(),
                "https://dest.example".into(),
                rules(rule_count),
                clock.now(),
            ))
            .unwrap();
        let engine = Arc::new(SettlementEngine::new(
            store.clone(),
            notifier.clone(),
            clock.clone(),
            policy,
        ));
        engine.rates().set_new_rate(Money::parse("3.00").unwrap()).unwrap();
        clock.advance(Duration::from_secs(1));
        notifier.clear();
        Fixture {
            engine,
            store,
            notifier,
            clock,
            owner,
            code,
        }
    }

    fn fixture(rule_count: usize) -> Fixture {
        fixture_with(rule_count, ClickPolicy::default())
    }

    fn visitor(n: u32) -> VisitSignals {
        VisitSignals {
            requester_key: RequesterKey::new(format!("10.0.{}.{}", n / 256, n % 256)),
            client_token: Some(format!("tok-{n}")),
            client_first_use: true,
        }
    }

    fn link_earnings(f: &Fixture) -> Money {
        f.store.get_link(&f.code).unwrap().unwrap().generated_earnings
    }

    fn user_earnings(f: &Fixture) -> Money {
        f.store.get_user(&f.owner).unwrap().unwrap().generated_earnings
    }

    #[test]
    fn three_rules_at_three_dollars_earns_three_tenths_of_a_cent() {
        let f = fixture(3);
        let out = f.engine.settle_visit(&f.code, visitor(1)).unwrap();
        assert!(out.billable);
        assert_eq!(out.amount, Money::parse("0.003").unwrap());
        assert_eq!(out.rate_applied, Some(Money::parse("3.00").unwrap()));
        assert_eq!(link_earnings(&f), Money::parse("0.003").unwrap());
        assert_eq!(user_earnings(&f), Money::parse("0.003").unwrap());
        assert_eq!(f.store.get_link(&f.code).unwrap().unwrap().real_clicks, 1);
    }

    #[test]
    fn custom_rate_overrides_global() {
        let f = fixture(3);
        f.store
            .set_custom_rate(&f.owner, Some(Money::parse("5.00").unwrap()))
            .unwrap();
        let out = f.engine.settle_visit(&f.code, visitor(1)).unwrap();
        assert_eq!(out.amount, Money::parse("0.005").unwrap());
        assert_eq!(out.rate_applied, Some(Money::parse("5.00").unwrap()));
    }

    #[test]
    fn visit_after_rate_change_uses_new_rate() {
        let f = fixture(3);
        f.engine.rates().set_new_rate(Money::parse("4.00").unwrap()).unwrap();
        let out = f.engine.settle_visit(&f.code, visitor(1)).unwrap();
        assert_eq!(out.amount, Money::parse("0.004").unwrap());
    }

    #[test]
    fn duplicate_within_window_is_recorded_not_billed() {
        let f = fixture(3);
        let first = f.engine.settle_visit(&f.code, visitor(7)).unwrap();
        f.clock.advance(Duration::from_secs(120));
        let second = f.engine.settle_visit(&f.code, visitor(7)).unwrap();
        assert!(first.billable);
        assert!(!second.billable);
        assert_eq!(second.reason, SettleReason::Duplicate);
        assert_eq!(second.amount, Money::ZERO);
        let stored = f.store.get_click(second.click_id).unwrap().unwrap();
        assert!(stored.processed);
        assert_eq!(stored.reason, Some(SettleReason::Duplicate));
        let link = f.store.get_link(&f.code).unwrap().unwrap();
        assert_eq!(link.total_clicks, 2);
        assert_eq!(link.real_clicks, 1);
    }

    #[test]
    fn unmonetizable_link_never_earns() {
        let f = fixture(2);
        for n in 0..25 {
            let out = f.engine.settle_visit(&f.code, visitor(n)).unwrap();
            assert_eq!(out.amount, Money::ZERO);
            assert_eq!(out.reason, SettleReason::NotMonetizable);
        }
        assert_eq!(link_earnings(&f), Money::ZERO);
    }

    #[test]
    fn suspended_owner_settles_to_zero() {
        let f = fixture(3);
        f.engine.settle_visit(&f.code, visitor(1)).unwrap();
        f.store
            .set_account_status(&f.owner, AccountStatus::Suspended)
            .unwrap();
        let out = f.engine.settle_visit(&f.code, visitor(2)).unwrap();
        assert_eq!(out.reason, SettleReason::OwnerSuspended);
        assert_eq!(out.amount, Money::ZERO);
        assert_eq!(user_earnings(&f), Money::parse("0.003").unwrap());
    }

    #[test]
    fn suspended_link_settles_to_zero() {
        let f = fixture(3);
        let mut link = f.store.get_link(&f.code).unwrap().unwrap();
        link.suspended = true;
        f.store.update_link(&link).unwrap();
        let out = f.engine.settle_visit(&f.code, visitor(1)).unwrap();
        assert_eq!(out.reason, SettleReason::LinkSuspended);
    }

    /// Suspends the owner between the engine's reads and its write.
    struct SuspendOnApply {
        inner: InMemoryStore,
        owner: UserId,
        armed: std::sync::atomic::AtomicBool,
    }

    impl LinkRepository for SuspendOnApply {
        fn get_link(&self, code: &ShortCode) -> Result<Option<Link>, CoreError> {
            self.inner.get_link(code)
        }
        fn insert_link(&self, link: Link) -> Result<(), CoreError> {
            self.inner.insert_link(link)
        }
        fn update_link(&self, link: &Link) -> Result<(), CoreError> {
            self.inner.update_link(link)
        }
        fn list_links_by_owner(&self, owner: &UserId, limit: usize) -> Result<Vec<Link>, CoreError> {
            self.inner.list_links_by_owner(owner, limit)
        }
    }

    impl UserRepository for SuspendOnApply {
        fn get_user(&self, id: &UserId) -> Result<Option<User>, CoreError> {
            self.inner.get_user(id)
        }
        fn insert_user(&self, user: User) -> Result<(), CoreError> {
            self.inner.insert_user(user)
        }
        fn set_custom_rate(&self, id: &UserId, rate: Option<Money>) -> Result<User, CoreError> {
            self.inner.set_custom_rate(id, rate)
        }
        fn set_account_status(&self, id: &UserId, status: AccountStatus) -> Result<User, CoreError> {
            self.inner.set_account_status(id, status)
        }
        fn record_payout(&self, id: &UserId, amount: Money) -> Result<User, CoreError> {
            self.inner.record_payout(id, amount)
        }
    }

    impl RateRepository for SuspendOnApply {
        fn list_rate_periods(&self) -> Result<Vec<RatePeriod>, CoreError> {
            self.inner.list_rate_periods()
        }
        fn find_rate_period(&self, as_of: SystemTime) -> Result<Option<RatePeriod>, CoreError> {
            self.inner.find_rate_period(as_of)
        }
        fn open_rate_period(&self, rate: Money, at: SystemTime) -> Result<RatePeriod, CoreError> {
            self.inner.open_rate_period(rate, at)
        }
    }

    impl ClickRepository for SuspendOnApply {
        fn record_click(&self, click: NewClick, dedup_since: SystemTime) -> Result<ClickEvent, CoreError> {
            self.inner.record_click(click, dedup_since)
        }
        fn get_click(&self, id: ClickId) -> Result<Option<ClickEvent>, CoreError> {
            self.inner.get_click(id)
        }
        fn list_unprocessed(&self, after: Option<ClickId>, limit: usize) -> Result<Vec<ClickEvent>, CoreError> {
            self.inner.list_unprocessed(after, limit)
        }
        fn list_clicks(&self, code: &ShortCode, since: SystemTime, limit: usize) -> Result<Vec<ClickEvent>, CoreError> {
            self.inner.list_clicks(code, since, limit)
        }
    }

    impl SettlementRepository for SuspendOnApply {
        fn apply_settlement(&self, s: &Settlement) -> Result<SettlementApplied, CoreError> {
            if self.armed.swap(false, std::sync::atomic::Ordering::SeqCst) {
                self.inner
                    .set_account_status(&self.owner, AccountStatus::Suspended)?;
            }
            self.inner.apply_settlement(s)
        }
    }

    impl SponsorRepository for SuspendOnApply {
        fn insert_sponsor(&self, sponsor: SponsorRule) -> Result<(), CoreError> {
            self.inner.insert_sponsor(sponsor)
        }
        fn get_sponsor(&self, id: &str) -> Result<Option<SponsorRule>, CoreError> {
            self.inner.get_sponsor(id)
        }
        fn list_sponsors(&self, code: &ShortCode) -> Result<Vec<SponsorRule>, CoreError> {
            self.inner.list_sponsors(code)
        }
        fn record_sponsor_view(&self, id: &str) -> Result<(), CoreError> {
            self.inner.record_sponsor_view(id)
        }
        fn record_sponsor_click(&self, id: &str) -> Result<(), CoreError> {
            self.inner.record_sponsor_click(id)
        }
    }

    #[test]
    fn owner_suspended_mid_settlement_is_not_credited() {
        let clock = ManualClock::at_secs(50_000);
        let owner = UserId::new("owner-1").unwrap();
        let inner = InMemoryStore::new();
        inner.insert_user(User::new(owner.clone(), clock.now())).unwrap();
        let code = ShortCode::new("race1").unwrap();
        inner
            .insert_link(Link::new(
                code.clone(),
                owner.clone(),
                "https://dest.example".into(),
                rules(3),
                clock.now(),
            ))
            .unwrap();
        let store = Arc::new(SuspendOnApply {
            inner,
            owner: owner.clone(),
            armed: std::sync::atomic::AtomicBool::new(true),
        });
        let engine = SettlementEngine::new(
            store.clone(),
            Arc::new(RecordingNotifier::new()),
            clock.clone(),
            ClickPolicy::default(),
        );
        engine.rates().set_new_rate(Money::parse("3.00").unwrap()).unwrap();
        clock.advance(Duration::from_secs(1));

        let out = engine.settle_visit(&code, visitor(1)).unwrap();
        assert!(!out.billable);
        assert_eq!(out.reason, SettleReason::OwnerSuspended);
        assert_eq!(out.amount, Money::ZERO);
        let user = store.get_user(&owner).unwrap().unwrap();
        assert_eq!(user.status, AccountStatus::Suspended);
        assert_eq!(user.generated_earnings, Money::ZERO);
        let link = store.get_link(&code).unwrap().unwrap();
        assert_eq!((link.real_clicks, link.generated_earnings), (0, Money::ZERO));
    }

    #[test]
    fn settle_twice_is_a_noop() {
        let f = fixture(3);
        let out = f.engine.settle_visit(&f.code, visitor(1)).unwrap();
        let again = f.engine.settle(out.click_id).unwrap();
        assert!(again.already_processed);
        assert_eq!(again.amount, out.amount);
        assert_eq!(link_earnings(&f), Money::parse("0.003").unwrap());
    }

    #[test]
    fn missing_owner_records_reason() {
        let f = fixture(3);
        let stranger = UserId::new("ghost").unwrap();
        let code = ShortCode::new("orphan").unwrap();
        f.store
            .insert_link(Link::new(
                code.clone(),
                stranger,
                "https://x.example".into(),
                rules(3),
                f.clock.now(),
            ))
            .unwrap();
        let out = f.engine.settle_visit(&code, visitor(1)).unwrap();
        assert_eq!(out.reason, SettleReason::OwnerNotFound);
        assert_eq!(out.amount, Money::ZERO);
        assert!(f.store.get_click(out.click_id).unwrap().unwrap().processed);
    }

    #[test]
    fn reconcile_settles_pending_and_is_idempotent() {
        let f = fixture(3);
        for n in 0..5 {
            f.engine.clicks().record_visit(&f.code, visitor(n)).unwrap();
        }
        let first = f.engine.reconcile().unwrap();
        assert_eq!(first.processed_count, 5);
        assert_eq!(first.total_earnings_settled, Money::parse("0.015").unwrap());
        assert_eq!(first.failed_count, 0);

        let second = f.engine.reconcile().unwrap();
        assert_eq!(second, BatchReport::default());
        assert_eq!(link_earnings(&f), Money::parse("0.015").unwrap());
    }

    #[test]
    fn reconcile_uses_rate_in_force_at_click_time() {
        let f = fixture(3);
        f.engine.clicks().record_visit(&f.code, visitor(1)).unwrap();
        f.clock.advance(Duration::from_secs(10));
        f.engine.rates().set_new_rate(Money::parse("8.00").unwrap()).unwrap();
        let report = f.engine.reconcile().unwrap();
        assert_eq!(report.total_earnings_settled, Money::parse("0.003").unwrap());
    }

    #[test]
    fn reconcile_marks_orphaned_clicks_processed() {
        let f = fixture(3);
        let orphan = f
            .store
            .record_click(
                NewClick {
                    link: f.code.clone(),
                    clicked_at: f.clock.now(),
                    signals: visitor(1),
                },
                f.clock.now(),
            )
            .unwrap();
        f.store
            .set_account_status(&f.owner, AccountStatus::Suspended)
            .unwrap();
        let report = f.engine.reconcile().unwrap();
        assert_eq!(report.processed_count, 1);
        let stored = f.store.get_click(orphan.id).unwrap().unwrap();
        assert_eq!(stored.reason, Some(SettleReason::OwnerSuspended));
        assert!(stored.processed);
    }

    #[test]
    fn concurrent_visits_conserve_earnings() {
        let f = fixture(3);
        std::thread::scope(|s| {
            for t in 0..8u32 {
                let engine = f.engine.clone();
                let code = f.code.clone();
                s.spawn(move || {
                    for i in 0..25u32 {
                        engine.settle_visit(&code, visitor(t * 100 + i)).unwrap();
                    }
                });
            }
        });
        let clicks = f
            .store
            .list_clicks(&f.code, SystemTime::UNIX_EPOCH, usize::MAX)
            .unwrap();
        let per_click: Money = clicks.iter().map(|c| c.amount).sum();
        assert_eq!(clicks.len(), 200);
        assert_eq!(per_click, Money::parse("0.6").unwrap());
        assert_eq!(link_earnings(&f), per_click);
        assert_eq!(user_earnings(&f), per_click);
    }

    #[test]
    fn milestone_fires_once_under_concurrency() {
        let f = fixture_with(
            3,
            ClickPolicy {
                milestone_step: 10,
                ..ClickPolicy::default()
            },
        );
        for n in 0..8 {
            f.engine.settle_visit(&f.code, visitor(n)).unwrap();
        }
        std::thread::scope(|s| {
            for t in 0..50u32 {
                let engine = f.engine.clone();
                let code = f.code.clone();
                s.spawn(move || {
                    engine.settle_visit(&code, visitor(1000 + t)).unwrap();
                });
            }
        });
        let milestones: Vec<u64> = f
            .notifier
            .sent()
            .into_iter()
            .filter_map(|n| match (n.recipient, n.kind) {
                (Recipient::User(_), NotificationKind::ClickMilestone { milestone, .. }) => {
                    Some(milestone)
                }
                _ => None,
            })
            .collect();
        let mut sorted = milestones.clone();
        sorted.sort_unstable();
        assert_eq!(sorted, vec![10, 20, 30, 40, 50]);
        assert_eq!(f.store.get_link(&f.code).unwrap().unwrap().real_clicks, 58);
    }
}
