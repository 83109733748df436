use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use tracing::info;

use crate::code::encode_base62;
use crate::rules::{build_rules, is_monetizable};
use crate::validate::{validate_custom_code, validate_url};
use crate::{
    Clock, CodeGenerator, CoreError, Link, NewLink, RuleDraft, ShortCode, SponsorRule, Store,
    User, UserId,
};

/// Owner-editable link details. `None` leaves a field unchanged.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LinkPatch {
    pub destination: Option<String>,
    pub title: Option<String>,
    pub description: Option<String>,
}

/// Application service for link management.
///
/// Generic over the store, code generator, and clock. Generated codes come
/// from an internal counter seeded with the wall clock at construction, so
/// restarts against a persistent store rarely collide; collisions are still
/// detected by the store and retried.
pub struct LinkService<S: ?Sized, G, C> {
    store: Arc<S>,
    codes: G,
    clock: C,
    next_id: AtomicU64,
    default_sponsor_url: Option<String>,
}

impl<S: Store + ?Sized, G: CodeGenerator, C: Clock> LinkService<S, G, C> {
    pub fn new(store: Arc<S>, codes: G, clock: C) -> Self {
        let seed = clock
            .now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        Self {
            store,
            codes,
            clock,
            next_id: AtomicU64::new(seed),
            default_sponsor_url: None,
        }
    }

    /// Attach a sponsor rule with this URL to every new link.
    pub fn with_default_sponsor(mut self, url: Option<String>) -> Self {
        self.default_sponsor_url = url;
        self
    }

    fn reserve_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Create a new link for `owner`.
    pub fn create(&self, owner: &UserId, input: NewLink) -> Result<Link, CoreError> {
        validate_url(&input.destination)?;
        let rules = build_rules(input.rules)?;
        let user = self.ensure_owner(owner)?;
        if !user.is_active() {
            return Err(CoreError::InvalidState("account suspended".into()));
        }

        let now = self.clock.now();
        let build = |code: ShortCode| {
            let mut link = Link::new(code, owner.clone(), input.destination.clone(), rules.clone(), now);
            link.title = input.title.clone();
            link.description = input.description.clone();
            link
        };

        let link = if let Some(custom) = &input.custom_code {
            let code = validate_custom_code(custom.as_str())?;
            let link = build(code);
            self.store.insert_link(link.clone())?;
            link
        } else {
            self.insert_generated(build)?
        };

        if let Some(url) = &self.default_sponsor_url {
            self.insert_sponsor(&link.code, url.clone(), None)?;
        }
        info!(
            code = %link.code.as_str(),
            owner = %owner.as_str(),
            rules = link.rules.len(),
            monetizable = link.monetizable,
            "link created"
        );
        Ok(link)
    }

    fn insert_generated(&self, build: impl Fn(ShortCode) -> Link) -> Result<Link, CoreError> {
        // hard cap to avoid an endless loop in degenerate cases
        for _ in 0..100 {
            let link = build(self.codes.next_code(self.reserve_id()));
            match self.store.insert_link(link.clone()) {
                Ok(()) => return Ok(link),
                Err(CoreError::AlreadyExists) => continue,
                Err(e) => return Err(e),
            }
        }
        Err(CoreError::Repository("failed to generate unique code".into()))
    }

    fn ensure_owner(&self, owner: &UserId) -> Result<User, CoreError> {
        if let Some(user) = self.store.get_user(owner)? {
            return Ok(user);
        }
        let user = User::new(owner.clone(), self.clock.now());
        match self.store.insert_user(user.clone()) {
            Ok(()) => Ok(user),
            Err(CoreError::AlreadyExists) => self.store.get_user(owner)?.ok_or(CoreError::NotFound),
            Err(e) => Err(e),
        }
    }

    pub fn get(&self, code: &ShortCode) -> Result<Link, CoreError> {
        self.store.get_link(code)?.ok_or(CoreError::NotFound)
    }

    /// Links owned by `owner`, newest first.
    pub fn list_by_owner(&self, owner: &UserId, limit: usize) -> Result<Vec<Link>, CoreError> {
        self.store.list_links_by_owner(owner, limit)
    }

    fn owned(&self, caller: &UserId, code: &ShortCode) -> Result<Link, CoreError> {
        let link = self.get(code)?;
        if &link.owner != caller {
            return Err(CoreError::Forbidden);
        }
        Ok(link)
    }

    /// Replace the rule list and recompute `monetizable`.
    pub fn set_rules(
        &self,
        caller: &UserId,
        code: &ShortCode,
        drafts: Vec<RuleDraft>,
    ) -> Result<Link, CoreError> {
        let mut link = self.owned(caller, code)?;
        link.rules = build_rules(drafts)?;
        link.monetizable = is_monetizable(&link.rules);
        link.updated_at = Some(self.clock.now());
        self.store.update_link(&link)?;
        info!(code = %code.as_str(), rules = link.rules.len(), monetizable = link.monetizable, "rules updated");
        Ok(link)
    }

    pub fn update_details(
        &self,
        caller: &UserId,
        code: &ShortCode,
        patch: LinkPatch,
    ) -> Result<Link, CoreError> {
        let mut link = self.owned(caller, code)?;
        if let Some(dest) = patch.destination {
            validate_url(&dest)?;
            link.destination = dest;
        }
        if patch.title.is_some() {
            link.title = patch.title;
        }
        if patch.description.is_some() {
            link.description = patch.description;
        }
        link.updated_at = Some(self.clock.now());
        self.store.update_link(&link)?;
        Ok(link)
    }

    /// Soft-suspend or restore a link. Links are never deleted.
    pub fn set_suspended(&self, code: &ShortCode, suspended: bool) -> Result<Link, CoreError> {
        let mut link = self.get(code)?;
        link.suspended = suspended;
        link.updated_at = Some(self.clock.now());
        self.store.update_link(&link)?;
        info!(code = %code.as_str(), suspended, "link suspension changed");
        Ok(link)
    }

    /// Operator-created sponsor rule.
    pub fn add_sponsor(
        &self,
        code: &ShortCode,
        sponsor_url: String,
        expires_at: Option<SystemTime>,
    ) -> Result<SponsorRule, CoreError> {
        self.get(code)?;
        validate_url(&sponsor_url)?;
        self.insert_sponsor(code, sponsor_url, expires_at)
    }

    pub fn sponsors(&self, code: &ShortCode) -> Result<Vec<SponsorRule>, CoreError> {
        self.store.list_sponsors(code)
    }

    fn insert_sponsor(
        &self,
        code: &ShortCode,
        sponsor_url: String,
        expires_at: Option<SystemTime>,
    ) -> Result<SponsorRule, CoreError> {
        for _ in 0..100 {
            let id = format!("sp{}", encode_base62(self.reserve_id()));
            let mut sponsor = SponsorRule::new(id, code.clone(), sponsor_url.clone(), self.clock.now());
            sponsor.expires_at = expires_at;
            match self.store.insert_sponsor(sponsor.clone()) {
                Ok(()) => return Ok(sponsor),
                Err(CoreError::AlreadyExists) => continue,
                Err(e) => return Err(e),
            }
        }
        Err(CoreError::Repository("failed to generate unique sponsor id".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::memory_repo::InMemoryStore;
    use crate::adapters::ManualClock;
    use crate::code::Base62CodeGenerator;
    use crate::{AccountStatus, RuleKind, UserRepository};

    fn svc() -> LinkService<InMemoryStore, Base62CodeGenerator, ManualClock> {
        LinkService::new(
            Arc::new(InMemoryStore::new()),
            Base62CodeGenerator::new(6),
            ManualClock::at_secs(1_700_000_000),
        )
    }

    fn drafts(n: usize) -> Vec<RuleDraft> {
        (0..n)
            .map(|i| RuleDraft {
                kind: RuleKind::Comment,
                target_url: format!("https://video.example/{i}"),
            })
            .collect()
    }

    fn input(rules: usize) -> NewLink {
        NewLink {
            destination: "https://example.com".to_string(),
            custom_code: None,
            title: Some("My page".into()),
            description: None,
            rules: drafts(rules),
        }
    }

    fn alice() -> UserId {
        UserId::new("alice").unwrap()
    }

    #[test]
    fn create_generates_code_and_provisions_owner() {
        let svc = svc();
        let link = svc.create(&alice(), input(3)).unwrap();
        assert_eq!(link.code.as_str().len(), 7);
        assert!(link.monetizable);
        assert_eq!(svc.get(&link.code).unwrap(), link);
        assert!(svc.store.get_user(&alice()).unwrap().is_some());
    }

    #[test]
    fn custom_code_collision() {
        let svc = svc();
        let mut a = input(0);
        a.custom_code = Some(ShortCode::new("promo").unwrap());
        svc.create(&alice(), a.clone()).unwrap();
        assert!(matches!(
            svc.create(&alice(), a),
            Err(CoreError::AlreadyExists)
        ));
    }

    #[test]
    fn invalid_destination_rejected() {
        let svc = svc();
        let mut bad = input(3);
        bad.destination = "ftp://nope".into();
        assert!(matches!(svc.create(&alice(), bad), Err(CoreError::InvalidUrl(_))));
    }

    #[test]
    fn suspended_owner_cannot_create() {
        let svc = svc();
        svc.create(&alice(), input(0)).unwrap();
        svc.store
            .set_account_status(&alice(), AccountStatus::Suspended)
            .unwrap();
        assert!(matches!(
            svc.create(&alice(), input(0)),
            Err(CoreError::InvalidState(_))
        ));
    }

    #[test]
    fn set_rules_recomputes_monetizable_and_checks_owner() {
        let svc = svc();
        let link = svc.create(&alice(), input(2)).unwrap();
        assert!(!link.monetizable);
        let updated = svc.set_rules(&alice(), &link.code, drafts(4)).unwrap();
        assert!(updated.monetizable);
        assert_eq!(updated.rules[3].position, 3);
        let bob = UserId::new("bob").unwrap();
        assert!(matches!(
            svc.set_rules(&bob, &link.code, drafts(1)),
            Err(CoreError::Forbidden)
        ));
    }

    #[test]
    fn update_details_keeps_counters() {
        let svc = svc();
        let link = svc.create(&alice(), input(3)).unwrap();
        let patch = LinkPatch {
            destination: Some("https://example.org/new".into()),
            ..Default::default()
        };
        let updated = svc.update_details(&alice(), &link.code, patch).unwrap();
        assert_eq!(updated.destination, "https://example.org/new");
        assert_eq!(updated.title.as_deref(), Some("My page"));
        assert!(updated.updated_at.is_some());
    }

    #[test]
    fn default_sponsor_created_with_link() {
        let svc = svc().with_default_sponsor(Some("https://sponsor.example".into()));
        let link = svc.create(&alice(), input(3)).unwrap();
        let sponsors = svc.sponsors(&link.code).unwrap();
        assert_eq!(sponsors.len(), 1);
        assert!(sponsors[0].active);
        let extra = svc
            .add_sponsor(&link.code, "https://other.example".into(), None)
            .unwrap();
        assert_ne!(extra.id, sponsors[0].id);
        assert_eq!(svc.sponsors(&link.code).unwrap().len(), 2);
    }

    #[test]
    fn suspend_and_list() {
        let svc = svc();
        for _ in 0..3 {
            svc.create(&alice(), input(0)).unwrap();
        }
        let links = svc.list_by_owner(&alice(), 2).unwrap();
        assert_eq!(links.len(), 2);
        let s = svc.set_suspended(&links[0].code, true).unwrap();
        assert!(s.suspended);
        assert!(svc.get(&links[0].code).unwrap().suspended);
    }
}
