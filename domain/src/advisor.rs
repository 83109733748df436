//! Anomaly advisor contract. The advisor only returns an opinion about a
//! link's recent traffic; acting on it is left to a human operator.

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::{Clock, CoreError, LinkRepository, ClickRepository, ShortCode};

pub const REVIEW_LOOKBACK: Duration = Duration::from_secs(24 * 60 * 60);
pub const REVIEW_MAX_CLICKS: usize = 500;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    None,
    Moderate,
    High,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AdvisorRequest {
    pub code: ShortCode,
    /// Newest first.
    pub click_timestamps: Vec<SystemTime>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdvisorVerdict {
    pub is_suspicious: bool,
    pub risk_level: RiskLevel,
    pub reason: String,
    pub analyzed_clicks: u64,
}

/// Port for the external advisor.
pub trait AnomalyAdvisor: Send + Sync {
    fn analyze(&self, request: &AdvisorRequest) -> Result<AdvisorVerdict, CoreError>;
}

pub struct AdvisorService<S: ?Sized, C> {
    store: Arc<S>,
    advisor: Arc<dyn AnomalyAdvisor>,
    clock: C,
}

impl<S, C> AdvisorService<S, C>
where
    S: LinkRepository + ClickRepository + ?Sized,
    C: Clock,
{
    pub fn new(store: Arc<S>, advisor: Arc<dyn AnomalyAdvisor>, clock: C) -> Self {
        Self {
            store,
            advisor,
            clock,
        }
    }

    /// Ask the advisor about the last day of clicks on `code`.
    pub fn review(&self, code: &ShortCode) -> Result<AdvisorVerdict, CoreError> {
        self.store.get_link(code)?.ok_or(CoreError::NotFound)?;
        let since = self
            .clock
            .now()
            .checked_sub(REVIEW_LOOKBACK)
            .unwrap_or(SystemTime::UNIX_EPOCH);
        let clicks = self.store.list_clicks(code, since, REVIEW_MAX_CLICKS)?;
        let request = AdvisorRequest {
            code: code.clone(),
            click_timestamps: clicks.iter().map(|c| c.clicked_at).collect(),
        };
        let verdict = self.advisor.analyze(&request).map_err(|e| match e {
            CoreError::UpstreamUnavailable(_) => e,
            other => CoreError::UpstreamUnavailable(other.to_string()),
        });
        match &verdict {
            Ok(v) => info!(
                code = %code.as_str(),
                suspicious = v.is_suspicious,
                analyzed = v.analyzed_clicks,
                "anomaly review"
            ),
            Err(e) => warn!(code = %code.as_str(), err = %e, "anomaly advisor unavailable"),
        }
        verdict
    }
}

/// Local fallback advisor: flags links where many clicks land inside a short
/// sliding window.
#[derive(Clone, Copy, Debug)]
pub struct BurstAdvisor {
    pub window: Duration,
    /// Clicks inside one window that count as a moderate burst; twice this
    /// is high.
    pub threshold: usize,
}

impl Default for BurstAdvisor {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(60),
            threshold: 20,
        }
    }
}

impl BurstAdvisor {
    fn densest_window(&self, timestamps: &[SystemTime]) -> usize {
        let mut sorted = timestamps.to_vec();
        sorted.sort();
        let mut best = 0;
        let mut start = 0;
        for end in 0..sorted.len() {
            while sorted[end]
                .duration_since(sorted[start])
                .unwrap_or(Duration::ZERO)
                >= self.window
            {
                start += 1;
            }
            best = best.max(end - start + 1);
        }
        best
    }
}

impl AnomalyAdvisor for BurstAdvisor {
    fn analyze(&self, request: &AdvisorRequest) -> Result<AdvisorVerdict, CoreError> {
        let analyzed = request.click_timestamps.len() as u64;
        let peak = self.densest_window(&request.click_timestamps);
        let risk_level = if self.threshold == 0 || peak < self.threshold {
            RiskLevel::None
        } else if peak < self.threshold * 2 {
            RiskLevel::Moderate
        } else {
            RiskLevel::High
        };
        let reason = match risk_level {
            RiskLevel::None => "no unusual click bursts".to_string(),
            _ => format!(
                "{} clicks within {}s",
                peak,
                self.window.as_secs()
            ),
        };
        Ok(AdvisorVerdict {
            is_suspicious: risk_level != RiskLevel::None,
            risk_level,
            reason,
            analyzed_clicks: analyzed,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::memory_repo::InMemoryStore;
    use crate::adapters::ManualClock;
    use crate::{Link, NewClick, UserId, VisitSignals};

    fn at(secs: u64) -> SystemTime {
        SystemTime::UNIX_EPOCH + Duration::from_secs(secs)
    }

    fn request(times: &[u64]) -> AdvisorRequest {
        AdvisorRequest {
            code: ShortCode::new("abc").unwrap(),
            click_timestamps: times.iter().map(|t| at(*t)).collect(),
        }
    }

    #[test]
    fn burst_levels() {
        let advisor = BurstAdvisor {
            window: Duration::from_secs(60),
            threshold: 5,
        };
        let calm = advisor.analyze(&request(&[0, 100, 200, 300, 400, 500])).unwrap();
        assert!(!calm.is_suspicious);
        assert_eq!(calm.risk_level, RiskLevel::None);
        assert_eq!(calm.analyzed_clicks, 6);

        let moderate = advisor.analyze(&request(&[0, 1, 2, 3, 4, 500])).unwrap();
        assert_eq!(moderate.risk_level, RiskLevel::Moderate);
        assert!(moderate.is_suspicious);

        let times: Vec<u64> = (0..10).collect();
        assert_eq!(advisor.analyze(&request(&times)).unwrap().risk_level, RiskLevel::High);
    }

    #[test]
    fn empty_history_is_calm() {
        let v = BurstAdvisor::default().analyze(&request(&[])).unwrap();
        assert_eq!(v.analyzed_clicks, 0);
        assert!(!v.is_suspicious);
    }

    struct Down;

    impl AnomalyAdvisor for Down {
        fn analyze(&self, _: &AdvisorRequest) -> Result<AdvisorVerdict, CoreError> {
            Err(CoreError::Repository("connection refused".into()))
        }
    }

    fn store_with_clicks(clock: &ManualClock) -> (Arc<InMemoryStore>, ShortCode) {
        let store = Arc::new(InMemoryStore::new());
        let code = ShortCode::new("watch").unwrap();
        store
            .insert_link(Link::new(
                code.clone(),
                UserId::new("o").unwrap(),
                "https://x.example".into(),
                Vec::new(),
                clock.now(),
            ))
            .unwrap();
        for _ in 0..3 {
            store
                .record_click(
                    NewClick {
                        link: code.clone(),
                        clicked_at: clock.now(),
                        signals: VisitSignals::default(),
                    },
                    SystemTime::UNIX_EPOCH,
                )
                .unwrap();
            clock.advance(Duration::from_secs(1));
        }
        (store, code)
    }

    #[test]
    fn review_feeds_recent_clicks() {
        let clock = ManualClock::at_secs(100_000);
        let (store, code) = store_with_clicks(&clock);
        let service = AdvisorService::new(store, Arc::new(BurstAdvisor::default()), clock);
        let verdict = service.review(&code).unwrap();
        assert_eq!(verdict.analyzed_clicks, 3);
        assert!(matches!(
            service.review(&ShortCode::new("missing").unwrap()),
            Err(CoreError::NotFound)
        ));
    }

    #[test]
    fn advisor_failure_is_upstream_unavailable() {
        let clock = ManualClock::at_secs(100_000);
        let (store, code) = store_with_clicks(&clock);
        let service = AdvisorService::new(store, Arc::new(Down), clock);
        assert!(matches!(
            service.review(&code),
            Err(CoreError::UpstreamUnavailable(_))
        ));
    }
}
