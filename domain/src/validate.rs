//! Lightweight input validation helpers. Keep logic minimal and deterministic.

use crate::CoreError;
use crate::ShortCode;

const MAX_URL_LEN: usize = 2048;

/// Validate a destination or rule target URL. Kept intentionally light to
/// avoid heavy parsing crates: http/https scheme, a host, and a sane length.
pub fn validate_url(s: &str) -> Result<(), CoreError> {
    let trimmed = s.trim();
    if trimmed.is_empty() {
        return Err(CoreError::InvalidUrl("empty".into()));
    }
    let rest = trimmed
        .strip_prefix("https://")
        .or_else(|| trimmed.strip_prefix("http://"))
        .ok_or_else(|| CoreError::InvalidUrl("must start with http:// or https://".into()))?;
    if rest.is_empty() || rest.starts_with('/') {
        return Err(CoreError::InvalidUrl("missing host".into()));
    }
    if trimmed.len() > MAX_URL_LEN {
        return Err(CoreError::InvalidUrl("too long".into()));
    }
    if trimmed.chars().any(char::is_whitespace) {
        return Err(CoreError::InvalidUrl("contains whitespace".into()));
    }
    Ok(())
}

/// Validate an owner-chosen alias: 3-32 chars on top of `ShortCode` rules.
pub fn validate_custom_code(s: &str) -> Result<ShortCode, CoreError> {
    if s.len() < 3 || s.len() > 32 {
        return Err(CoreError::InvalidCode("alias must be 3-32 characters".into()));
    }
    ShortCode::new(s.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_validation_basic() {
        assert!(validate_url("https://example.com").is_ok());
        assert!(validate_url("http://example.com/path?q=1").is_ok());
        assert!(validate_url("").is_err());
        assert!(validate_url("ftp://example.com").is_err());
        assert!(validate_url("https://").is_err());
        assert!(validate_url("https://exa mple.com").is_err());
        assert!(validate_url(&format!("https://e.com/{}", "a".repeat(2048))).is_err());
    }

    #[test]
    fn custom_code_length_bounds() {
        assert!(validate_custom_code("abc-123").is_ok());
        assert!(validate_custom_code("ab").is_err());
        assert!(validate_custom_code(&"a".repeat(33)).is_err());
        assert!(validate_custom_code("bad/char").is_err());
    }
}
