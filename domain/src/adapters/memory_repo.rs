use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};
use std::time::SystemTime;

use crate::clicks::{milestone_crossed, same_requester, still_billable};
use crate::gate::{GateSession, GateSessionStore};
use crate::{
    AccountStatus, ClickEvent, ClickId, ClickRepository, CoreError, Link, LinkRepository, Money,
    NewClick, RatePeriod, RatePeriodId, RateRepository, Settlement, SettlementApplied,
    SettlementRepository, ShortCode, SponsorRepository, SponsorRule, User, UserId,
    UserRepository,
};

#[derive(Default)]
struct State {
    links: BTreeMap<String, Link>,
    users: BTreeMap<String, User>,
    rate_periods: Vec<RatePeriod>,
    /// Append-only; a click's id is its index plus one.
    clicks: Vec<ClickEvent>,
    sponsors: BTreeMap<String, SponsorRule>,
}

/// In-memory store for tests and local runs. One mutex guards every table so
/// each port method is a single atomic step, like a transaction.
#[derive(Default)]
pub struct InMemoryStore {
    state: Mutex<State>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, State>, CoreError> {
        self.state
            .lock()
            .map_err(|_| CoreError::Repository("mutex poisoned".into()))
    }
}

fn add(a: Money, b: Money) -> Result<Money, CoreError> {
    a.checked_add(b)
        .ok_or_else(|| CoreError::Repository("earnings overflow".into()))
}

impl LinkRepository for InMemoryStore {
    fn get_link(&self, code: &ShortCode) -> Result<Option<Link>, CoreError> {
        Ok(self.lock()?.links.get(code.as_str()).cloned())
    }

    fn insert_link(&self, link: Link) -> Result<(), CoreError> {
        let mut state = self.lock()?;
        let key = link.code.as_str().to_string();
        if state.links.contains_key(&key) {
            return Err(CoreError::AlreadyExists);
        }
        state.links.insert(key, link);
        Ok(())
    }

    fn update_link(&self, link: &Link) -> Result<(), CoreError> {
        let mut state = self.lock()?;
        let existing = state
            .links
            .get_mut(link.code.as_str())
            .ok_or(CoreError::NotFound)?;
        existing.destination = link.destination.clone();
        existing.title = link.title.clone();
        existing.description = link.description.clone();
        existing.rules = link.rules.clone();
        existing.monetizable = link.monetizable;
        existing.suspended = link.suspended;
        existing.updated_at = link.updated_at;
        Ok(())
    }

    fn list_links_by_owner(&self, owner: &UserId, limit: usize) -> Result<Vec<Link>, CoreError> {
        let state = self.lock()?;
        let mut items: Vec<Link> = state
            .links
            .values()
            .filter(|l| &l.owner == owner)
            .cloned()
            .collect();
        items.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        items.truncate(limit);
        Ok(items)
    }
}

impl UserRepository for InMemoryStore {
    fn get_user(&self, id: &UserId) -> Result<Option<User>, CoreError> {
        Ok(self.lock()?.users.get(id.as_str()).cloned())
    }

    fn insert_user(&self, user: User) -> Result<(), CoreError> {
        let mut state = self.lock()?;
        let key = user.id.as_str().to_string();
        if state.users.contains_key(&key) {
            return Err(CoreError::AlreadyExists);
        }
        state.users.insert(key, user);
        Ok(())
    }

    fn set_custom_rate(&self, id: &UserId, rate: Option<Money>) -> Result<User, CoreError> {
        let mut state = self.lock()?;
        let user = state.users.get_mut(id.as_str()).ok_or(CoreError::NotFound)?;
        user.custom_rate = rate;
        Ok(user.clone())
    }

    fn set_account_status(&self, id: &UserId, status: AccountStatus) -> Result<User, CoreError> {
        let mut state = self.lock()?;
        let user = state.users.get_mut(id.as_str()).ok_or(CoreError::NotFound)?;
        user.status = status;
        Ok(user.clone())
    }

    fn record_payout(&self, id: &UserId, amount: Money) -> Result<User, CoreError> {
        let mut state = self.lock()?;
        let user = state.users.get_mut(id.as_str()).ok_or(CoreError::NotFound)?;
        let paid = add(user.paid_out, amount)?;
        if paid > user.generated_earnings {
            return Err(CoreError::InvalidState(
                "payout exceeds generated earnings".into(),
            ));
        }
        user.paid_out = paid;
        Ok(user.clone())
    }
}

impl RateRepository for InMemoryStore {
    fn list_rate_periods(&self) -> Result<Vec<RatePeriod>, CoreError> {
        Ok(self.lock()?.rate_periods.clone())
    }

    fn find_rate_period(&self, as_of: SystemTime) -> Result<Option<RatePeriod>, CoreError> {
        let state = self.lock()?;
        Ok(state.rate_periods.iter().rev().find(|p| p.covers(as_of)).cloned())
    }

    fn open_rate_period(&self, rate: Money, at: SystemTime) -> Result<RatePeriod, CoreError> {
        let mut state = self.lock()?;
        if let Some(open) = state.rate_periods.iter_mut().find(|p| p.is_open()) {
            if at <= open.starts_at {
                return Err(CoreError::InvalidState(
                    "new rate period must start after the open one".into(),
                ));
            }
            open.ends_at = Some(at);
        }
        let period = RatePeriod {
            id: RatePeriodId(state.rate_periods.len() as u64 + 1),
            rate,
            starts_at: at,
            ends_at: None,
        };
        state.rate_periods.push(period.clone());
        Ok(period)
    }
}

impl ClickRepository for InMemoryStore {
    fn record_click(
        &self,
        click: NewClick,
        dedup_since: SystemTime,
    ) -> Result<ClickEvent, CoreError> {
        let mut state = self.lock()?;
        if !state.links.contains_key(click.link.as_str()) {
            return Err(CoreError::NotFound);
        }
        let unique = !state.clicks.iter().any(|prior| {
            prior.link == click.link && prior.clicked_at >= dedup_since && same_requester(prior, &click)
        });
        let event = ClickEvent::pending(ClickId(state.clicks.len() as u64 + 1), click, unique);
        if let Some(link) = state.links.get_mut(event.link.as_str()) {
            link.total_clicks += 1;
        }
        state.clicks.push(event.clone());
        Ok(event)
    }

    fn get_click(&self, id: ClickId) -> Result<Option<ClickEvent>, CoreError> {
        let state = self.lock()?;
        let idx = (id.0 as usize).wrapping_sub(1);
        Ok(state.clicks.get(idx).cloned())
    }

    fn list_unprocessed(
        &self,
        after: Option<ClickId>,
        limit: usize,
    ) -> Result<Vec<ClickEvent>, CoreError> {
        let state = self.lock()?;
        let floor = after.map_or(0, |id| id.0);
        Ok(state
            .clicks
            .iter()
            .filter(|c| !c.processed && c.id.0 > floor)
            .take(limit)
            .cloned()
            .collect())
    }

    fn list_clicks(
        &self,
        code: &ShortCode,
        since: SystemTime,
        limit: usize,
    ) -> Result<Vec<ClickEvent>, CoreError> {
        let state = self.lock()?;
        Ok(state
            .clicks
            .iter()
            .rev()
            .filter(|c| &c.link == code && c.clicked_at >= since)
            .take(limit)
            .cloned()
            .collect())
    }
}

impl SettlementRepository for InMemoryStore {
    fn apply_settlement(&self, s: &Settlement) -> Result<SettlementApplied, CoreError> {
        let mut guard = self.lock()?;
        let state = &mut *guard;
        let idx = (s.click_id.0 as usize).wrapping_sub(1);
        let click = state.clicks.get(idx).ok_or(CoreError::NotFound)?;
        if click.processed {
            return Ok(SettlementApplied::AlreadyProcessed(click.clone()));
        }

        // Compute every new value before writing anything.
        let mut crossed = None;
        let credits = if s.billable {
            let owner = s.owner.as_ref().ok_or(CoreError::NotFound)?;
            let link = state.links.get(s.link.as_str()).ok_or(CoreError::NotFound)?;
            let user = state.users.get(owner.as_str()).ok_or(CoreError::NotFound)?;
            if !still_billable(link, user, click) {
                return Err(CoreError::Conflict("billing state changed".into()));
            }
            let real = link.real_clicks + 1;
            crossed = milestone_crossed(real, link.milestones_reached, s.milestone_step);
            Some((
                owner.as_str().to_string(),
                real,
                add(link.generated_earnings, s.amount)?,
                add(user.generated_earnings, s.amount)?,
            ))
        } else {
            None
        };

        if let Some((owner, real, link_total, user_total)) = credits {
            if let Some(link) = state.links.get_mut(s.link.as_str()) {
                link.real_clicks = real;
                link.generated_earnings = link_total;
                if let Some(m) = crossed {
                    link.milestones_reached = m / s.milestone_step;
                }
            }
            if let Some(user) = state.users.get_mut(&owner) {
                user.generated_earnings = user_total;
            }
        }
        if let Some(click) = state.clicks.get_mut(idx) {
            click.billable = s.billable;
            click.rate_applied = s.rate_applied;
            click.amount = s.amount;
            click.reason = Some(s.reason);
            click.processed = true;
            click.processed_at = Some(s.processed_at);
        }
        Ok(SettlementApplied::Applied {
            crossed_milestone: crossed,
        })
    }
}

impl SponsorRepository for InMemoryStore {
    fn insert_sponsor(&self, sponsor: SponsorRule) -> Result<(), CoreError> {
        let mut state = self.lock()?;
        if state.sponsors.contains_key(&sponsor.id) {
            return Err(CoreError::AlreadyExists);
        }
        state.sponsors.insert(sponsor.id.clone(), sponsor);
        Ok(())
    }

    fn get_sponsor(&self, id: &str) -> Result<Option<SponsorRule>, CoreError> {
        Ok(self.lock()?.sponsors.get(id).cloned())
    }

    fn list_sponsors(&self, code: &ShortCode) -> Result<Vec<SponsorRule>, CoreError> {
        let state = self.lock()?;
        let mut items: Vec<SponsorRule> = state
            .sponsors
            .values()
            .filter(|s| &s.link == code)
            .cloned()
            .collect();
        items.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(items)
    }

    fn record_sponsor_view(&self, id: &str) -> Result<(), CoreError> {
        let mut state = self.lock()?;
        let s = state.sponsors.get_mut(id).ok_or(CoreError::NotFound)?;
        s.views += 1;
        Ok(())
    }

    fn record_sponsor_click(&self, id: &str) -> Result<(), CoreError> {
        let mut state = self.lock()?;
        let s = state.sponsors.get_mut(id).ok_or(CoreError::NotFound)?;
        s.clicks += 1;
        Ok(())
    }
}

/// Gate sessions kept in process memory.
#[derive(Default)]
pub struct InMemorySessionStore {
    sessions: Mutex<HashMap<String, GateSession>>,
}

impl InMemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, HashMap<String, GateSession>>, CoreError> {
        self.sessions
            .lock()
            .map_err(|_| CoreError::Repository("mutex poisoned".into()))
    }
}

impl GateSessionStore for InMemorySessionStore {
    fn insert_session(&self, session: GateSession) -> Result<(), CoreError> {
        let mut map = self.lock()?;
        if map.contains_key(&session.id) {
            return Err(CoreError::AlreadyExists);
        }
        map.insert(session.id.clone(), session);
        Ok(())
    }

    fn get_session(&self, id: &str) -> Result<Option<GateSession>, CoreError> {
        Ok(self.lock()?.get(id).cloned())
    }

    fn update_session(
        &self,
        id: &str,
        f: &mut dyn FnMut(&mut GateSession),
    ) -> Result<GateSession, CoreError> {
        let mut map = self.lock()?;
        let session = map.get_mut(id).ok_or(CoreError::NotFound)?;
        f(session);
        Ok(session.clone())
    }

    fn prune_sessions(&self, cutoff: SystemTime) -> Result<usize, CoreError> {
        let mut map = self.lock()?;
        let before = map.len();
        map.retain(|_, s| s.created_at >= cutoff);
        Ok(before - map.len())
    }
}
