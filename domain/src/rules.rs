//! Monetization rule set: validation, ordering and the monetizable predicate.

use crate::validate::validate_url;
use crate::{CoreError, Rule, RuleDraft};

/// A link earns only when visitors must clear at least this many rules.
pub const MIN_RULES_FOR_MONETIZATION: usize = 3;

/// True iff the rule set is large enough for the link to earn.
pub fn is_monetizable(rules: &[Rule]) -> bool {
    rules.len() >= MIN_RULES_FOR_MONETIZATION
}

/// Validate drafts and number them in submission order.
pub fn build_rules(drafts: Vec<RuleDraft>) -> Result<Vec<Rule>, CoreError> {
    drafts
        .into_iter()
        .enumerate()
        .map(|(i, d)| {
            validate_url(&d.target_url)
                .map_err(|e| CoreError::InvalidRule(format!("rule {}: {}", i, e)))?;
            Ok(Rule {
                kind: d.kind,
                target_url: d.target_url.trim().to_string(),
                position: i as u32,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::RuleKind;

    fn draft(kind: RuleKind, url: &str) -> RuleDraft {
        RuleDraft {
            kind,
            target_url: url.to_string(),
        }
    }

    #[test]
    fn monetizable_needs_three_rules() {
        let two = build_rules(vec![
            draft(RuleKind::Like, "https://a.example"),
            draft(RuleKind::Follow, "https://b.example"),
        ])
        .unwrap();
        assert!(!is_monetizable(&two));

        let mut three = two.clone();
        three.extend(build_rules(vec![draft(RuleKind::Subscribe, "https://c.example")]).unwrap());
        assert!(is_monetizable(&three));
        assert!(!is_monetizable(&[]));
    }

    #[test]
    fn positions_follow_submission_order() {
        let rules = build_rules(vec![
            draft(RuleKind::Comment, "https://a.example"),
            draft(RuleKind::VisitSponsor, " https://b.example "),
        ])
        .unwrap();
        assert_eq!(rules[0].position, 0);
        assert_eq!(rules[1].position, 1);
        assert_eq!(rules[1].kind, RuleKind::VisitSponsor);
        assert_eq!(rules[1].target_url, "https://b.example");
    }

    #[test]
    fn bad_target_names_the_rule() {
        let err = build_rules(vec![
            draft(RuleKind::Like, "https://ok.example"),
            draft(RuleKind::Like, "javascript:alert(1)"),
        ])
        .unwrap_err();
        match err {
            CoreError::InvalidRule(msg) => assert!(msg.starts_with("rule 1")),
            other => panic!("expected InvalidRule, got {other:?}"),
        }
    }
}
