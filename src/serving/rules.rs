//! Rule engine (spec §4.4 "fallback"): a deterministic, model-free labeler
//! used whenever the model is unavailable or declines to answer, and as the
//! comparison arm for shadow-mode agreement metrics.

use crate::model::FeatureRow;

/// Injectable so serving can be tested against a fixed rule set without
/// depending on the default merchant-keyword table.
pub trait RuleEngine: Send + Sync {
    /// Returns a label if a rule matches, `None` otherwise (`RuleMissing`).
    fn classify(&self, row: &FeatureRow) -> Option<String>;
}

/// Substring-over-merchant-canonical rule table. Order matters: first match
/// wins.
pub struct KeywordRuleEngine {
    rules: Vec<(String, String)>,
}

impl KeywordRuleEngine {
    pub fn new(rules: Vec<(String, String)>) -> Self {
        Self { rules }
    }

    pub fn default_rules() -> Self {
        Self::new(vec![
            ("whole_foods".into(), "Groceries".into()),
            ("trader_joe".into(), "Groceries".into()),
            ("safeway".into(), "Groceries".into()),
            ("kroger".into(), "Groceries".into()),
            ("netflix".into(), "Subscriptions".into()),
            ("spotify".into(), "Subscriptions".into()),
            ("hulu".into(), "Subscriptions".into()),
            ("uber".into(), "Transport".into()),
            ("lyft".into(), "Transport".into()),
            ("shell".into(), "Transport".into()),
            ("chevron".into(), "Transport".into()),
            ("starbucks".into(), "Dining".into()),
            ("chipotle".into(), "Dining".into()),
            ("mcdonalds".into(), "Dining".into()),
        ])
    }
}

impl RuleEngine for KeywordRuleEngine {
    fn classify(&self, row: &FeatureRow) -> Option<String> {
        self.rules
            .iter()
            .find(|(keyword, _)| row.merchant_canonical.contains(keyword.as_str()))
            .map(|(_, label)| label.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Channel;

    fn row(merchant_canonical: &str) -> FeatureRow {
        FeatureRow {
            txn_id: 1,
            ts_month: "2026-01".into(),
            merchant_canonical: merchant_canonical.into(),
            tokens: vec![],
            abs_amount: 10.0,
            channel: Channel::Pos,
            dow: 1,
            is_weekend: false,
            is_subscription: false,
            norm_desc: String::new(),
        }
    }

    #[test]
    fn matches_known_merchant() {
        let engine = KeywordRuleEngine::default_rules();
        assert_eq!(
            engine.classify(&row("whole_foods_market")),
            Some("Groceries".to_string())
        );
    }

    #[test]
    fn unknown_merchant_has_no_rule() {
        let engine = KeywordRuleEngine::default_rules();
        assert_eq!(engine.classify(&row("mystery_llc")), None);
    }
}
