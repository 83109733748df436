//! Visitor gate: the per-visit state machine in front of a redirect.
//!
//! ```text
//! Idle -> Evaluating(0) -> ... -> Evaluating(n-1) -> AllCompleted -> Redirecting -> Done
//!      \-> NotFound | Suspended
//! ```
//!
//! Each rule moves `Pending -> Loading -> Completed`. A rule may only be
//! opened after its target was viewed, and completes once the minimum dwell
//! has elapsed since it was opened, either on the next poll or on an explicit
//! return-to-tab signal. Returning early drops the rule back to `Pending`.
//! Settlement runs once per session, guarded by the `AllCompleted ->
//! Redirecting` claim; abandoned sessions never settle.

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use tracing::{debug, error, info};

use crate::settlement::{SettleOutcome, SettlementEngine};
use crate::{
    ClickId, Clock, CoreError, Link, Rule, ShortCode, SponsorRule, Store, User, VisitSignals,
};

pub const DEFAULT_MIN_DWELL: Duration = Duration::from_secs(5);
pub const DEFAULT_SESSION_TTL: Duration = Duration::from_secs(60 * 60);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RuleProgress {
    Pending,
    Loading { opened_at: SystemTime },
    Completed,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GateState {
    Idle,
    Evaluating { index: usize },
    AllCompleted,
    Redirecting,
    Done,
    NotFound,
    Suspended,
}

impl GateState {
    pub fn as_str(&self) -> &'static str {
        match self {
            GateState::Idle => "idle",
            GateState::Evaluating { .. } => "evaluating",
            GateState::AllCompleted => "all_completed",
            GateState::Redirecting => "redirecting",
            GateState::Done => "done",
            GateState::NotFound => "not_found",
            GateState::Suspended => "suspended",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            GateState::Done | GateState::NotFound | GateState::Suspended
        )
    }
}

/// Retryable refusals surfaced to the visitor.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GateRejection {
    UnknownRule,
    /// Rules complete strictly in order.
    OutOfOrder { expected: usize },
    NotViewed,
    NotOpened,
    /// Came back before the minimum dwell; the rule is pending again.
    TooSoon { remaining: Duration },
    AlreadyCompleted,
    /// The session is not in a state that accepts this action.
    NotReady { state: GateState },
}

impl GateRejection {
    pub fn as_str(&self) -> &'static str {
        match self {
            GateRejection::UnknownRule => "unknown_rule",
            GateRejection::OutOfOrder { .. } => "out_of_order",
            GateRejection::NotViewed => "not_viewed",
            GateRejection::NotOpened => "not_opened",
            GateRejection::TooSoon { .. } => "too_soon",
            GateRejection::AlreadyCompleted => "already_completed",
            GateRejection::NotReady { .. } => "not_ready",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GateSession {
    pub id: String,
    pub link: Option<ShortCode>,
    pub destination: Option<String>,
    pub title: Option<String>,
    pub description: Option<String>,
    pub state: GateState,
    pub rules: Vec<Rule>,
    pub progress: Vec<RuleProgress>,
    pub viewed: Vec<bool>,
    /// Sponsors shown in this session; each is counted once.
    pub sponsors: Vec<SponsorRule>,
    pub signals: VisitSignals,
    pub min_dwell: Duration,
    pub created_at: SystemTime,
    pub click_id: Option<ClickId>,
}

impl GateSession {
    /// Evaluate the link and its owner and place the session in its first state.
    pub fn start(
        id: String,
        link: Option<&Link>,
        owner: Option<&User>,
        signals: VisitSignals,
        min_dwell: Duration,
        now: SystemTime,
    ) -> Self {
        let mut session = Self {
            id,
            link: link.map(|l| l.code.clone()),
            destination: None,
            title: None,
            description: None,
            state: GateState::Idle,
            rules: Vec::new(),
            progress: Vec::new(),
            viewed: Vec::new(),
            sponsors: Vec::new(),
            signals,
            min_dwell,
            created_at: now,
            click_id: None,
        };
        let Some(link) = link else {
            session.state = GateState::NotFound;
            return session;
        };
        if link.suspended || owner.is_some_and(|o| !o.is_active()) {
            session.state = GateState::Suspended;
            return session;
        }
        session.destination = Some(link.destination.clone());
        session.title = link.title.clone();
        session.description = link.description.clone();
        session.rules = link.rules.clone();
        session.progress = vec![RuleProgress::Pending; link.rules.len()];
        session.viewed = vec![false; link.rules.len()];
        session.state = if link.rules.is_empty() {
            GateState::AllCompleted
        } else {
            GateState::Evaluating { index: 0 }
        };
        session
    }

    fn check_current(&self, index: usize) -> Result<(), GateRejection> {
        match self.state {
            GateState::Evaluating { index: current } => {
                if index >= self.rules.len() {
                    Err(GateRejection::UnknownRule)
                } else if index < current {
                    Err(GateRejection::AlreadyCompleted)
                } else if index > current {
                    Err(GateRejection::OutOfOrder { expected: current })
                } else {
                    Ok(())
                }
            }
            state => Err(GateRejection::NotReady { state }),
        }
    }

    /// Register that the visitor saw the rule's target. Returns whether this
    /// call was the first registration.
    pub fn register_view(&mut self, index: usize) -> Result<bool, GateRejection> {
        self.check_current(index)?;
        let first = !self.viewed[index];
        self.viewed[index] = true;
        Ok(first)
    }

    /// Visitor confirmed the action and the target was opened.
    pub fn open_rule(&mut self, index: usize, now: SystemTime) -> Result<(), GateRejection> {
        self.check_current(index)?;
        if !self.viewed[index] {
            return Err(GateRejection::NotViewed);
        }
        if let RuleProgress::Pending = self.progress[index] {
            self.progress[index] = RuleProgress::Loading { opened_at: now };
        }
        Ok(())
    }

    /// Visitor came back to the gate tab. Returning to a rule that a poll
    /// already completed is accepted.
    pub fn return_to_tab(&mut self, index: usize, now: SystemTime) -> Result<(), GateRejection> {
        if self.progress.get(index) == Some(&RuleProgress::Completed) {
            return Ok(());
        }
        self.check_current(index)?;
        let RuleProgress::Loading { opened_at } = self.progress[index] else {
            return Err(GateRejection::NotOpened);
        };
        let elapsed = now.duration_since(opened_at).unwrap_or(Duration::ZERO);
        if elapsed < self.min_dwell {
            self.progress[index] = RuleProgress::Pending;
            return Err(GateRejection::TooSoon {
                remaining: self.min_dwell - elapsed,
            });
        }
        self.complete_current(index);
        Ok(())
    }

    /// Complete a loading rule whose dwell has elapsed. Returns whether the
    /// state changed.
    pub fn poll(&mut self, now: SystemTime) -> bool {
        let GateState::Evaluating { index } = self.state else {
            return false;
        };
        match self.progress[index] {
            RuleProgress::Loading { opened_at }
                if now.duration_since(opened_at).unwrap_or(Duration::ZERO) >= self.min_dwell =>
            {
                self.complete_current(index);
                true
            }
            _ => false,
        }
    }

    fn complete_current(&mut self, index: usize) {
        self.progress[index] = RuleProgress::Completed;
        self.state = if index + 1 < self.rules.len() {
            GateState::Evaluating { index: index + 1 }
        } else {
            GateState::AllCompleted
        };
    }

    /// Claim the redirect. `Ok(true)` only for the single caller that moves
    /// the session out of `AllCompleted`; later callers get `Ok(false)`.
    pub fn begin_redirect(&mut self) -> Result<bool, GateRejection> {
        match self.state {
            GateState::AllCompleted => {
                self.state = GateState::Redirecting;
                Ok(true)
            }
            GateState::Redirecting | GateState::Done => Ok(false),
            state => Err(GateRejection::NotReady { state }),
        }
    }

    pub fn finish(&mut self, click_id: Option<ClickId>) {
        if self.state == GateState::Redirecting {
            self.state = GateState::Done;
            self.click_id = click_id;
        }
    }
}

/// Session storage. `update_session` must apply `f` atomically per session.
pub trait GateSessionStore: Send + Sync {
    fn insert_session(&self, session: GateSession) -> Result<(), CoreError>;
    fn get_session(&self, id: &str) -> Result<Option<GateSession>, CoreError>;
    /// Apply `f` under the session's lock and return the updated session.
    fn update_session(
        &self,
        id: &str,
        f: &mut dyn FnMut(&mut GateSession),
    ) -> Result<GateSession, CoreError>;
    /// Drop sessions created before `cutoff`; returns how many were removed.
    fn prune_sessions(&self, cutoff: SystemTime) -> Result<usize, CoreError>;
}

/// A session snapshot plus the refusal, if the action was refused.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GateOutcome {
    pub session: GateSession,
    pub rejection: Option<GateRejection>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GateRedirect {
    pub destination: String,
    /// Present only for the call that performed settlement.
    pub settled: Option<SettleOutcome>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct GateTiming {
    pub min_dwell: Duration,
    pub session_ttl: Duration,
}

impl Default for GateTiming {
    fn default() -> Self {
        Self {
            min_dwell: DEFAULT_MIN_DWELL,
            session_ttl: DEFAULT_SESSION_TTL,
        }
    }
}

pub struct GateService<S: ?Sized, G: ?Sized, C> {
    store: Arc<S>,
    sessions: Arc<G>,
    engine: Arc<SettlementEngine<S, C>>,
    clock: C,
    timing: GateTiming,
}

impl<S, G, C> GateService<S, G, C>
where
    S: Store + ?Sized,
    G: GateSessionStore + ?Sized,
    C: Clock + Clone,
{
    pub fn new(
        store: Arc<S>,
        sessions: Arc<G>,
        engine: Arc<SettlementEngine<S, C>>,
        clock: C,
        timing: GateTiming,
    ) -> Self {
        Self {
            store,
            sessions,
            engine,
            clock,
            timing,
        }
    }

    /// Start a session for a visit. Terminal sessions (`NotFound`,
    /// `Suspended`) are returned but not stored.
    pub fn open(
        &self,
        session_id: String,
        code: &ShortCode,
        signals: VisitSignals,
    ) -> Result<GateSession, CoreError> {
        let now = self.clock.now();
        let link = self.store.get_link(code)?;
        let owner = match &link {
            Some(l) => self.store.get_user(&l.owner)?,
            None => None,
        };
        let mut session = GateSession::start(
            session_id,
            link.as_ref(),
            owner.as_ref(),
            signals,
            self.timing.min_dwell,
            now,
        );
        if session.state.is_terminal() {
            debug!(code = %code.as_str(), state = session.state.as_str(), "gate closed");
            return Ok(session);
        }
        session.sponsors = self
            .store
            .list_sponsors(code)?
            .into_iter()
            .filter(|s| s.is_live(now))
            .collect();
        for sponsor in &session.sponsors {
            if let Err(e) = self.store.record_sponsor_view(&sponsor.id) {
                debug!(sponsor = %sponsor.id, err = %e, "sponsor view not counted");
            }
        }
        self.sessions.insert_session(session.clone())?;
        Ok(session)
    }

    fn transition<T>(
        &self,
        id: &str,
        mut f: impl FnMut(&mut GateSession) -> T,
    ) -> Result<(GateSession, T), CoreError> {
        let mut out = None;
        let session = self.sessions.update_session(id, &mut |s| out = Some(f(s)))?;
        let out = out.ok_or_else(|| CoreError::Repository("session update not applied".into()))?;
        Ok((session, out))
    }

    fn outcome(
        &self,
        id: &str,
        f: impl FnMut(&mut GateSession) -> Result<(), GateRejection>,
    ) -> Result<GateOutcome, CoreError> {
        let (session, res) = self.transition(id, f)?;
        Ok(GateOutcome {
            session,
            rejection: res.err(),
        })
    }

    /// Current state, completing a loading rule whose dwell has elapsed.
    pub fn status(&self, id: &str) -> Result<GateSession, CoreError> {
        let now = self.clock.now();
        Ok(self.transition(id, |s| s.poll(now))?.0)
    }

    pub fn register_view(&self, id: &str, index: usize) -> Result<GateOutcome, CoreError> {
        let now = self.clock.now();
        self.outcome(id, |s| {
            s.poll(now);
            s.register_view(index).map(|_| ())
        })
    }

    pub fn open_rule(&self, id: &str, index: usize) -> Result<GateOutcome, CoreError> {
        let now = self.clock.now();
        self.outcome(id, |s| {
            s.poll(now);
            s.open_rule(index, now)
        })
    }

    /// No poll first: the return itself judges the dwell.
    pub fn return_to_tab(&self, id: &str, index: usize) -> Result<GateOutcome, CoreError> {
        let now = self.clock.now();
        self.outcome(id, |s| s.return_to_tab(index, now))
    }

    /// Finish the gate: settle once for this session, then hand back the
    /// destination. Settlement failures are logged and never block the
    /// redirect; the click stays pending for reconciliation.
    pub fn complete(&self, id: &str) -> Result<Result<GateRedirect, GateRejection>, CoreError> {
        let now = self.clock.now();
        let (session, claim) = self.transition(id, |s| {
            s.poll(now);
            s.begin_redirect()
        })?;
        let first = match claim {
            Ok(first) => first,
            Err(rejection) => return Ok(Err(rejection)),
        };
        let destination = session
            .destination
            .clone()
            .ok_or_else(|| CoreError::InvalidState("session has no destination".into()))?;
        if !first {
            return Ok(Ok(GateRedirect {
                destination,
                settled: None,
            }));
        }

        let settled = match &session.link {
            Some(code) => match self.engine.settle_visit(code, session.signals.clone()) {
                Ok(outcome) => Some(outcome),
                Err(e) => {
                    error!(session = %id, code = %code.as_str(), err = %e, "gate settlement failed");
                    None
                }
            },
            None => None,
        };
        let click_id = settled.as_ref().map(|o| o.click_id);
        self.transition(id, |s| s.finish(click_id))?;
        info!(
            session = %id,
            billable = settled.as_ref().is_some_and(|o| o.billable),
            "gate completed"
        );
        Ok(Ok(GateRedirect {
            destination,
            settled,
        }))
    }

    /// Count a sponsor click from this session and return the sponsor URL.
    pub fn sponsor_click(&self, id: &str, sponsor_id: &str) -> Result<String, CoreError> {
        let session = self.sessions.get_session(id)?.ok_or(CoreError::NotFound)?;
        let sponsor = session
            .sponsors
            .iter()
            .find(|s| s.id == sponsor_id)
            .ok_or(CoreError::NotFound)?;
        self.store.record_sponsor_click(&sponsor.id)?;
        Ok(sponsor.sponsor_url.clone())
    }

    /// Remove sessions older than the configured TTL.
    pub fn prune_expired(&self) -> Result<usize, CoreError> {
        let cutoff = self
            .clock
            .now()
            .checked_sub(self.timing.session_ttl)
            .unwrap_or(SystemTime::UNIX_EPOCH);
        self.sessions.prune_sessions(cutoff)
    }
}
