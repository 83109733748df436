//! Domain library for reward-gated short links.
//!
//! Holds the domain types, ports (traits), and error definitions together with
//! the services that drive the click-to-earnings pipeline: rate ledger, rule
//! set, click ledger, settlement engine and the visitor gate. Keep adapters
//! and IO concerns out of this crate.

use std::error::Error;
use std::fmt::{Display, Formatter};
use std::sync::Arc;
use std::time::SystemTime;

use serde::{Deserialize, Serialize};

/// Short code identifying a link in public URLs.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ShortCode(String);

impl ShortCode {
    pub fn new<S: Into<String>>(s: S) -> Result<Self, CoreError> {
        let val = s.into();
        if val.is_empty() {
            return Err(CoreError::InvalidCode("empty".into()));
        }
        if val.len() > 64 {
            return Err(CoreError::InvalidCode("too long".into()));
        }
        if !val
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(CoreError::InvalidCode("invalid characters".into()));
        }
        Ok(Self(val))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Identity of a link owner as issued by the external identity provider.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct UserId(String);

impl UserId {
    pub fn new<S: Into<String>>(s: S) -> Result<Self, CoreError> {
        let val = s.into();
        if val.is_empty() || val.len() > 128 || val.chars().any(char::is_whitespace) {
            return Err(CoreError::InvalidUserId);
        }
        Ok(Self(val))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Kind of action a visitor must perform to clear a gate rule.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleKind {
    Like,
    Comment,
    Subscribe,
    Follow,
    VisitSponsor,
}

impl RuleKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RuleKind::Like => "like",
            RuleKind::Comment => "comment",
            RuleKind::Subscribe => "subscribe",
            RuleKind::Follow => "follow",
            RuleKind::VisitSponsor => "visit_sponsor",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "like" => Some(RuleKind::Like),
            "comment" => Some(RuleKind::Comment),
            "subscribe" => Some(RuleKind::Subscribe),
            "follow" => Some(RuleKind::Follow),
            "visit_sponsor" | "visit-sponsor" => Some(RuleKind::VisitSponsor),
            _ => None,
        }
    }
}

/// Owner-supplied rule before validation and numbering.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RuleDraft {
    pub kind: RuleKind,
    pub target_url: String,
}

/// A completion rule, owned by exactly one link.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Rule {
    pub kind: RuleKind,
    pub target_url: String,
    /// Zero-based position in the gate sequence.
    pub position: u32,
}

/// Input data for creating a new short link.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NewLink {
    pub destination: String,
    pub custom_code: Option<ShortCode>,
    pub title: Option<String>,
    pub description: Option<String>,
    pub rules: Vec<RuleDraft>,
}

/// Stored short link with its earnings counters.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Link {
    pub code: ShortCode,
    pub owner: UserId,
    pub destination: String,
    pub title: Option<String>,
    pub description: Option<String>,
    pub rules: Vec<Rule>,
    /// Derived from the rule count when rules are edited; frozen otherwise.
    pub monetizable: bool,
    /// Every recorded visit, billable or not.
    pub total_clicks: u64,
    /// Visits that settled as billable.
    pub real_clicks: u64,
    pub generated_earnings: Money,
    /// Number of click milestones already announced to the owner.
    pub milestones_reached: u64,
    /// Soft-suspend flag. Links are never deleted.
    pub suspended: bool,
    pub created_at: SystemTime,
    pub updated_at: Option<SystemTime>,
}

impl Link {
    /// Create a link with zeroed counters. `monetizable` is derived from `rules`.
    pub fn new(
        code: ShortCode,
        owner: UserId,
        destination: String,
        rules: Vec<Rule>,
        created_at: SystemTime,
    ) -> Self {
        let monetizable = crate::rules::is_monetizable(&rules);
        Self {
            code,
            owner,
            destination,
            title: None,
            description: None,
            rules,
            monetizable,
            total_clicks: 0,
            real_clicks: 0,
            generated_earnings: Money::ZERO,
            milestones_reached: 0,
            suspended: false,
            created_at,
            updated_at: None,
        }
    }
}

/// Sponsor placement attached to a link, tracked for sponsor-side reporting.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SponsorRule {
    pub id: String,
    pub link: ShortCode,
    pub sponsor_url: String,
    pub active: bool,
    pub expires_at: Option<SystemTime>,
    pub views: u64,
    pub clicks: u64,
    pub created_at: SystemTime,
}

impl SponsorRule {
    pub fn new(id: String, link: ShortCode, sponsor_url: String, created_at: SystemTime) -> Self {
        Self {
            id,
            link,
            sponsor_url,
            active: true,
            expires_at: None,
            views: 0,
            clicks: 0,
            created_at,
        }
    }

    /// Active and not past its expiry.
    pub fn is_live(&self, now: SystemTime) -> bool {
        self.active && self.expires_at.map_or(true, |exp| now < exp)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RatePeriodId(pub u64);

/// A span of time during which one global CPM applies.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RatePeriod {
    pub id: RatePeriodId,
    /// Revenue per 1000 billable events.
    pub rate: Money,
    pub starts_at: SystemTime,
    /// `None` while this is the active period.
    pub ends_at: Option<SystemTime>,
}

impl RatePeriod {
    pub fn is_open(&self) -> bool {
        self.ends_at.is_none()
    }

    /// `starts_at <= t < ends_at`, with an open period extending forever.
    pub fn covers(&self, t: SystemTime) -> bool {
        self.starts_at <= t && self.ends_at.map_or(true, |end| t < end)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccountStatus {
    Active,
    Suspended,
}

impl AccountStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AccountStatus::Active => "active",
            AccountStatus::Suspended => "suspended",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "active" => Some(AccountStatus::Active),
            "suspended" => Some(AccountStatus::Suspended),
            _ => None,
        }
    }
}

/// Earnings-relevant slice of a user profile. The rest of the profile lives
/// in the external identity store.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct User {
    pub id: UserId,
    pub status: AccountStatus,
    pub generated_earnings: Money,
    pub paid_out: Money,
    pub custom_rate: Option<Money>,
    pub created_at: SystemTime,
}

impl User {
    pub fn new(id: UserId, created_at: SystemTime) -> Self {
        Self {
            id,
            status: AccountStatus::Active,
            generated_earnings: Money::ZERO,
            paid_out: Money::ZERO,
            custom_rate: None,
            created_at,
        }
    }

    pub fn is_active(&self) -> bool {
        self.status == AccountStatus::Active
    }

    /// Custom rate that overrides the global ledger: present and positive.
    pub fn effective_custom_rate(&self) -> Option<Money> {
        self.custom_rate.filter(|r| !r.is_zero())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ClickId(pub u64);

/// Best-effort identity of a requester (client address), used for dedup.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct RequesterKey(String);

impl RequesterKey {
    /// Returns `None` for blank input so anonymized traffic degrades cleanly.
    pub fn new<S: Into<String>>(s: S) -> Option<Self> {
        let val = s.into();
        let trimmed = val.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(Self(trimmed.to_string()))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Validity signals captured with a visit.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct VisitSignals {
    pub requester_key: Option<RequesterKey>,
    /// Opaque client-side dedup token (e.g. a value kept in local storage).
    pub client_token: Option<String>,
    /// Client's own claim that this is the first use of its token.
    pub client_first_use: bool,
}

/// A visit about to be appended to the click ledger.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NewClick {
    pub link: ShortCode,
    pub clicked_at: SystemTime,
    pub signals: VisitSignals,
}

/// Why a click settled the way it did.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SettleReason {
    Billed,
    Duplicate,
    ClientRepeat,
    NotMonetizable,
    LinkSuspended,
    OwnerSuspended,
    LinkNotFound,
    OwnerNotFound,
}

impl SettleReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            SettleReason::Billed => "billed",
            SettleReason::Duplicate => "duplicate",
            SettleReason::ClientRepeat => "client_repeat",
            SettleReason::NotMonetizable => "not_monetizable",
            SettleReason::LinkSuspended => "link_suspended",
            SettleReason::OwnerSuspended => "owner_suspended",
            SettleReason::LinkNotFound => "link_not_found",
            SettleReason::OwnerNotFound => "owner_not_found",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "billed" => Some(SettleReason::Billed),
            "duplicate" => Some(SettleReason::Duplicate),
            "client_repeat" => Some(SettleReason::ClientRepeat),
            "not_monetizable" => Some(SettleReason::NotMonetizable),
            "link_suspended" => Some(SettleReason::LinkSuspended),
            "owner_suspended" => Some(SettleReason::OwnerSuspended),
            "link_not_found" => Some(SettleReason::LinkNotFound),
            "owner_not_found" => Some(SettleReason::OwnerNotFound),
            _ => None,
        }
    }

    pub fn is_billable(&self) -> bool {
        matches!(self, SettleReason::Billed)
    }
}

/// One visit attempt in the click ledger.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClickEvent {
    pub id: ClickId,
    pub link: ShortCode,
    pub clicked_at: SystemTime,
    pub requester_key: Option<RequesterKey>,
    pub client_token: Option<String>,
    pub client_first_use: bool,
    /// Computed by the store when the click was appended.
    pub server_unique: bool,
    pub billable: bool,
    pub rate_applied: Option<Money>,
    pub amount: Money,
    pub reason: Option<SettleReason>,
    pub processed: bool,
    pub processed_at: Option<SystemTime>,
}

impl ClickEvent {
    /// A freshly appended, unprocessed click.
    pub fn pending(id: ClickId, click: NewClick, server_unique: bool) -> Self {
        Self {
            id,
            link: click.link,
            clicked_at: click.clicked_at,
            requester_key: click.signals.requester_key,
            client_token: click.signals.client_token,
            client_first_use: click.signals.client_first_use,
            server_unique,
            billable: false,
            rate_applied: None,
            amount: Money::ZERO,
            reason: None,
            processed: false,
            processed_at: None,
        }
    }
}

/// Computed result the store applies atomically to a pending click.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Settlement {
    pub click_id: ClickId,
    pub link: ShortCode,
    /// Owner credited when `billable`; may be absent for zero settlements.
    pub owner: Option<UserId>,
    pub billable: bool,
    pub rate_applied: Option<Money>,
    pub amount: Money,
    pub reason: SettleReason,
    pub processed_at: SystemTime,
    /// Validated-click interval between owner milestone notifications.
    pub milestone_step: u64,
}

/// Outcome of `SettlementRepository::apply_settlement`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SettlementApplied {
    /// Fields written and counters incremented; carries the milestone crossed
    /// by this click, if any.
    Applied { crossed_milestone: Option<u64> },
    /// The click had already been processed; nothing changed.
    AlreadyProcessed(ClickEvent),
}

/// Time source abstraction to make code testable.
pub trait Clock: Send + Sync {
    fn now(&self) -> SystemTime;
}

impl<T: Clock + ?Sized> Clock for Arc<T> {
    fn now(&self) -> SystemTime {
        (**self).now()
    }
}

/// Short code generator interface; deterministic by input id in some strategies.
pub trait CodeGenerator: Send + Sync {
    fn next_code(&self, next_id: u64) -> ShortCode;
}

/// Repository port for links. Counter fields are only ever changed through
/// `ClickRepository` and `SettlementRepository`.
pub trait LinkRepository: Send + Sync {
    fn get_link(&self, code: &ShortCode) -> Result<Option<Link>, CoreError>;
    fn insert_link(&self, link: Link) -> Result<(), CoreError>;
    /// Persist owner-editable fields (destination, title, description, rules,
    /// monetizable, suspended, updated_at). Counters are left untouched.
    fn update_link(&self, link: &Link) -> Result<(), CoreError>;
    fn list_links_by_owner(&self, owner: &UserId, limit: usize) -> Result<Vec<Link>, CoreError>;
}

/// Repository port for the earnings slice of user accounts.
pub trait UserRepository: Send + Sync {
    fn get_user(&self, id: &UserId) -> Result<Option<User>, CoreError>;
    fn insert_user(&self, user: User) -> Result<(), CoreError>;
    fn set_custom_rate(&self, id: &UserId, rate: Option<Money>) -> Result<User, CoreError>;
    fn set_account_status(&self, id: &UserId, status: AccountStatus) -> Result<User, CoreError>;
    /// Atomically add to `paid_out`; fails with `InvalidState` when the payout
    /// would exceed `generated_earnings`.
    fn record_payout(&self, id: &UserId, amount: Money) -> Result<User, CoreError>;
}

/// Repository port for the global rate history.
pub trait RateRepository: Send + Sync {
    /// All periods, oldest first.
    fn list_rate_periods(&self) -> Result<Vec<RatePeriod>, CoreError>;
    fn find_rate_period(&self, as_of: SystemTime) -> Result<Option<RatePeriod>, CoreError>;
    /// In one transaction: close the open period at `at` and open a new one
    /// starting at `at`. Fails with `InvalidState` if `at` does not come after
    /// the open period's start.
    fn open_rate_period(&self, rate: Money, at: SystemTime) -> Result<RatePeriod, CoreError>;
}

/// Repository port for the append-only click ledger.
pub trait ClickRepository: Send + Sync {
    /// Atomically: decide server-side uniqueness against clicks on the same
    /// link at or after `dedup_since`, append the click, and increment the
    /// link's `total_clicks`. Fails with `NotFound` for an unknown link.
    fn record_click(&self, click: NewClick, dedup_since: SystemTime)
        -> Result<ClickEvent, CoreError>;
    fn get_click(&self, id: ClickId) -> Result<Option<ClickEvent>, CoreError>;
    /// Unprocessed clicks with id greater than `after`, ascending by id.
    fn list_unprocessed(&self, after: Option<ClickId>, limit: usize)
        -> Result<Vec<ClickEvent>, CoreError>;
    /// Clicks on a link at or after `since`, newest first.
    fn list_clicks(&self, code: &ShortCode, since: SystemTime, limit: usize)
        -> Result<Vec<ClickEvent>, CoreError>;
}

/// Repository port for the one multi-entity write in the earnings path.
pub trait SettlementRepository: Send + Sync {
    /// As one indivisible operation: verify the click is still unprocessed,
    /// write its computed fields and flip it to processed, and when billable
    /// increment the link's `real_clicks` and `generated_earnings`, the
    /// owner's `generated_earnings`, and advance `milestones_reached`.
    /// A billable settlement is re-checked with `clicks::still_billable`
    /// against the stored link and owner; if that fails the operation changes
    /// nothing and returns `Conflict` so the engine re-reads.
    fn apply_settlement(&self, settlement: &Settlement) -> Result<SettlementApplied, CoreError>;
}

/// Repository port for sponsor placements.
pub trait SponsorRepository: Send + Sync {
    fn insert_sponsor(&self, sponsor: SponsorRule) -> Result<(), CoreError>;
    fn get_sponsor(&self, id: &str) -> Result<Option<SponsorRule>, CoreError>;
    fn list_sponsors(&self, code: &ShortCode) -> Result<Vec<SponsorRule>, CoreError>;
    fn record_sponsor_view(&self, id: &str) -> Result<(), CoreError>;
    fn record_sponsor_click(&self, id: &str) -> Result<(), CoreError>;
}

/// Everything the earnings pipeline needs from storage.
pub trait Store:
    LinkRepository + UserRepository + RateRepository + ClickRepository + SettlementRepository + SponsorRepository
{
}

impl<T> Store for T where
    T: LinkRepository
        + UserRepository
        + RateRepository
        + ClickRepository
        + SettlementRepository
        + SponsorRepository
{
}

/// Core domain errors (no external error crates to keep deps minimal).
#[derive(Debug)]
pub enum CoreError {
    InvalidUrl(String),
    InvalidCode(String),
    InvalidUserId,
    InvalidRule(String),
    InvalidAmount(String),
    AlreadyExists,
    NotFound,
    Forbidden,
    /// The target exists but its state forbids the operation (suspended,
    /// overdrawn, out of order in time).
    InvalidState(String),
    /// Lost a race on an atomic update; safe to retry with fresh reads.
    Conflict(String),
    /// An external collaborator (advisor, notifier) did not answer.
    UpstreamUnavailable(String),
    Repository(String),
}

impl CoreError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, CoreError::Conflict(_))
    }
}

impl Display for CoreError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            CoreError::InvalidUrl(msg) => write!(f, "invalid url: {}", msg),
            CoreError::InvalidCode(msg) => write!(f, "invalid short code: {}", msg),
            CoreError::InvalidUserId => write!(f, "invalid user id"),
            CoreError::InvalidRule(msg) => write!(f, "invalid rule: {}", msg),
            CoreError::InvalidAmount(msg) => write!(f, "invalid amount: {}", msg),
            CoreError::AlreadyExists => write!(f, "resource already exists"),
            CoreError::NotFound => write!(f, "not found"),
            CoreError::Forbidden => write!(f, "forbidden"),
            CoreError::InvalidState(msg) => write!(f, "invalid state: {}", msg),
            CoreError::Conflict(msg) => write!(f, "conflict: {}", msg),
            CoreError::UpstreamUnavailable(msg) => write!(f, "upstream unavailable: {}", msg),
            CoreError::Repository(msg) => write!(f, "repository error: {}", msg),
        }
    }
}

impl Error for CoreError {}

/// Run `op`, retrying on `CoreError::Conflict` up to `attempts` times in total.
pub(crate) fn retry_on_conflict<T>(
    attempts: usize,
    mut op: impl FnMut() -> Result<T, CoreError>,
) -> Result<T, CoreError> {
    let mut last = None;
    for attempt in 1..=attempts.max(1) {
        match op() {
            Err(e) if e.is_conflict() => {
                tracing::debug!(attempt, err = %e, "conflict, retrying");
                last = Some(e);
            }
            other => return other,
        }
    }
    Err(last.unwrap_or_else(|| CoreError::Conflict("retries exhausted".into())))
}

/// Return a short about/version line for the binary to print.
pub fn about() -> String {
    let pkg = env!("CARGO_PKG_NAME");
    let ver = env!("CARGO_PKG_VERSION");
    format!("{} v{} - domain library loaded", pkg, ver)
}

pub mod accounts;
pub mod adapters;
pub mod advisor;
pub mod clicks;
pub mod code;
pub mod gate;
pub mod money;
pub mod notify;
pub mod rates;
pub mod rules;
pub mod service;
pub mod settlement;
pub mod validate;

pub use money::Money;

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn short_code_accepts_simple_values() {
        let c = ShortCode::new("abc123").expect("valid code");
        assert_eq!(c.as_str(), "abc123");
    }

    #[test]
    fn short_code_rejects_empty_and_symbols() {
        assert!(matches!(ShortCode::new(""), Err(CoreError::InvalidCode(_))));
        assert!(matches!(ShortCode::new("a/b"), Err(CoreError::InvalidCode(_))));
    }

    #[test]
    fn user_id_rejects_whitespace() {
        assert!(UserId::new("owner-1").is_ok());
        assert!(matches!(UserId::new("a b"), Err(CoreError::InvalidUserId)));
        assert!(matches!(UserId::new(""), Err(CoreError::InvalidUserId)));
    }

    #[test]
    fn requester_key_blank_is_none() {
        assert!(RequesterKey::new("   ").is_none());
        assert_eq!(RequesterKey::new(" 10.0.0.1 ").unwrap().as_str(), "10.0.0.1");
    }

    #[test]
    fn rate_period_cover_is_half_open() {
        let t0 = SystemTime::UNIX_EPOCH + Duration::from_secs(100);
        let t1 = t0 + Duration::from_secs(50);
        let closed = RatePeriod {
            id: RatePeriodId(1),
            rate: Money::ZERO,
            starts_at: t0,
            ends_at: Some(t1),
        };
        assert!(closed.covers(t0));
        assert!(!closed.covers(t1));
        let open = RatePeriod { ends_at: None, ..closed };
        assert!(open.covers(t1 + Duration::from_secs(10_000)));
    }

    #[test]
    fn custom_rate_zero_does_not_override() {
        let mut u = User::new(UserId::new("u").unwrap(), SystemTime::UNIX_EPOCH);
        u.custom_rate = Some(Money::ZERO);
        assert_eq!(u.effective_custom_rate(), None);
        u.custom_rate = Some(Money::from_nanos(5));
        assert_eq!(u.effective_custom_rate(), Some(Money::from_nanos(5)));
    }

    #[test]
    fn retry_stops_after_attempts() {
        let mut calls = 0;
        let res: Result<(), CoreError> = retry_on_conflict(3, || {
            calls += 1;
            Err(CoreError::Conflict("busy".into()))
        });
        assert!(matches!(res, Err(CoreError::Conflict(_))));
        assert_eq!(calls, 3);
    }

    #[test]
    fn retry_passes_through_other_errors() {
        let mut calls = 0;
        let res: Result<(), CoreError> = retry_on_conflict(3, || {
            calls += 1;
            Err(CoreError::NotFound)
        });
        assert!(matches!(res, Err(CoreError::NotFound)));
        assert_eq!(calls, 1);
    }
}
