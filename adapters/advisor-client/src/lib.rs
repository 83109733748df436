//! advisor-client: HTTP adapter for the external anomaly advisor.
//!
//! Purpose
//! - Implements `domain::advisor::AnomalyAdvisor` by posting a link's recent
//!   click timestamps to `{base_url}/analyze` and decoding the verdict.
//!
//! Wire format (JSON, camelCase)
//! - request:  `{ "shortCode": "abc", "clickTimestamps": [1700000000000, ...] }`
//!   (milliseconds since UNIX_EPOCH, newest first)
//! - response: `{ "isSuspicious": bool, "riskLevel": "none|moderate|high",
//!   "reason": "...", "analyzedClicks": 12 }`
//!
//! Notes
//! - Uses blocking `reqwest`; async callers run it on a blocking thread.
//! - Every failure maps to `CoreError::UpstreamUnavailable`; the verdict is
//!   advisory and its absence never blocks anything else.

use std::time::{Duration, UNIX_EPOCH};

use domain::advisor::{AdvisorRequest, AdvisorVerdict, AnomalyAdvisor, RiskLevel};
use domain::CoreError;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, thiserror::Error)]
pub enum AdvisorError {
    #[error("advisor request failed: {0}")]
    Network(#[from] reqwest::Error),
    #[error("advisor returned status {0}")]
    Status(u16),
    #[error("invalid advisor response: {0}")]
    Decode(String),
}

impl From<AdvisorError> for CoreError {
    fn from(e: AdvisorError) -> Self {
        CoreError::UpstreamUnavailable(e.to_string())
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct AnalyzeRequest<'a> {
    short_code: &'a str,
    click_timestamps: Vec<u64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AnalyzeResponse {
    is_suspicious: bool,
    risk_level: String,
    #[serde(default)]
    reason: String,
    #[serde(default)]
    analyzed_clicks: u64,
}

impl<'a> AnalyzeRequest<'a> {
    fn from_domain(req: &'a AdvisorRequest) -> Self {
        Self {
            short_code: req.code.as_str(),
            click_timestamps: req
                .click_timestamps
                .iter()
                .map(|t| t.duration_since(UNIX_EPOCH).unwrap_or_default().as_millis() as u64)
                .collect(),
        }
    }
}

fn parse_risk(s: &str) -> Result<RiskLevel, AdvisorError> {
    match s.to_ascii_lowercase().as_str() {
        "none" | "low" => Ok(RiskLevel::None),
        "moderate" | "medium" => Ok(RiskLevel::Moderate),
        "high" => Ok(RiskLevel::High),
        other => Err(AdvisorError::Decode(format!("unknown risk level {other}"))),
    }
}

fn into_verdict(resp: AnalyzeResponse) -> Result<AdvisorVerdict, AdvisorError> {
    Ok(AdvisorVerdict {
        is_suspicious: resp.is_suspicious,
        risk_level: parse_risk(&resp.risk_level)?,
        reason: resp.reason,
        analyzed_clicks: resp.analyzed_clicks,
    })
}

/// Client for a remote advisor service.
pub struct HttpAdvisor {
    endpoint: String,
    client: reqwest::blocking::Client,
}

impl HttpAdvisor {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, AdvisorError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .build()?;
        Ok(Self {
            endpoint: analyze_url(base_url),
            client,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn call(&self, request: &AdvisorRequest) -> Result<AdvisorVerdict, AdvisorError> {
        let body = AnalyzeRequest::from_domain(request);
        debug!(endpoint = %self.endpoint, clicks = body.click_timestamps.len(), "calling advisor");
        let resp = self.client.post(&self.endpoint).json(&body).send()?;
        let status = resp.status();
        if !status.is_success() {
            return Err(AdvisorError::Status(status.as_u16()));
        }
        let text = resp.text()?;
        let parsed: AnalyzeResponse =
            serde_json::from_str(&text).map_err(|e| AdvisorError::Decode(e.to_string()))?;
        into_verdict(parsed)
    }
}

fn analyze_url(base_url: &str) -> String {
    format!("{}/analyze", base_url.trim_end_matches('/'))
}

impl AnomalyAdvisor for HttpAdvisor {
    fn analyze(&self, request: &AdvisorRequest) -> Result<AdvisorVerdict, CoreError> {
        self.call(request).map_err(|e| {
            warn!(code = %request.code.as_str(), err = %e, "advisor call failed");
            CoreError::from(e)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use domain::ShortCode;
    use std::time::SystemTime;

    #[test]
    fn request_serializes_camel_case_millis() {
        let req = AdvisorRequest {
            code: ShortCode::new("abc").unwrap(),
            click_timestamps: vec![UNIX_EPOCH + Duration::from_millis(1_700_000_000_123)],
        };
        let json = serde_json::to_value(AnalyzeRequest::from_domain(&req)).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"shortCode": "abc", "clickTimestamps": [1_700_000_000_123u64]})
        );
    }

    #[test]
    fn response_decodes_into_verdict() {
        let raw = r#"{"isSuspicious":true,"riskLevel":"high","reason":"burst","analyzedClicks":42}"#;
        let resp: AnalyzeResponse = serde_json::from_str(raw).unwrap();
        let v = into_verdict(resp).unwrap();
        assert!(v.is_suspicious);
        assert_eq!(v.risk_level, RiskLevel::High);
        assert_eq!(v.analyzed_clicks, 42);
    }

    #[test]
    fn unknown_risk_level_is_decode_error() {
        let raw = r#"{"isSuspicious":false,"riskLevel":"spicy"}"#;
        let resp: AnalyzeResponse = serde_json::from_str(raw).unwrap();
        let err = into_verdict(resp).unwrap_err();
        assert!(matches!(err, AdvisorError::Decode(_)));
        assert!(matches!(
            CoreError::from(err),
            CoreError::UpstreamUnavailable(_)
        ));
    }

    #[test]
    fn endpoint_joins_base_url() {
        assert_eq!(analyze_url("http://advisor:8080/"), "http://advisor:8080/analyze");
        assert_eq!(analyze_url("http://advisor:8080/v1"), "http://advisor:8080/v1/analyze");
    }

    #[test]
    fn unreachable_advisor_is_upstream_unavailable() {
        // Port 9 (discard) on localhost is closed in test environments.
        let advisor = HttpAdvisor::new("http://127.0.0.1:9", Duration::from_millis(500)).unwrap();
        let req = AdvisorRequest {
            code: ShortCode::new("abc").unwrap(),
            click_timestamps: vec![SystemTime::now()],
        };
        assert!(matches!(
            advisor.analyze(&req),
            Err(CoreError::UpstreamUnavailable(_))
        ));
    }
}
