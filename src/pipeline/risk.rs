use std::path::Path;

use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};

/// Risk severity, ordered low to critical.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

/// One risk category as written in a rules file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskRule {
    pub category: String,
    pub patterns: Vec<String>,
    pub severity: Severity,
    #[serde(default)]
    pub block: bool,
    /// Text spoken or sent instead of a blocked utterance. Required when `block` is set.
    #[serde(default)]
    pub replacement: Option<String>,
}

/// Rules file shape (`[[rules]]` tables in TOML).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskRules {
    #[serde(default)]
    pub version: String,
    pub rules: Vec<RiskRule>,
}

#[derive(Debug, thiserror::Error)]
pub enum RiskRulesError {
    #[error("failed to read rules file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse rules file: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid pattern in category {category}: {source}")]
    Pattern {
        category: String,
        #[source]
        source: regex::Error,
    },
    #[error("category {0} blocks but has no replacement text")]
    MissingReplacement(String),
}

struct CompiledRule {
    category: String,
    patterns: Vec<Regex>,
    severity: Severity,
    block: bool,
    replacement: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RiskMatch {
    pub category: String,
    pub severity: Severity,
    pub blocked: bool,
}

/// Result of vetting one piece of agent text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RiskCheck {
    pub is_risky: bool,
    pub should_block: bool,
    pub matched: Vec<RiskMatch>,
    /// Replacement of the first blocking category, otherwise the input text.
    pub safe_text: String,
    pub highest_risk_level: Option<Severity>,
}

/// Regex rule table applied to agent-originated text.
pub struct RiskFilter {
    rules: Vec<CompiledRule>,
    version: String,
}

impl RiskFilter {
    pub fn new(rules: RiskRules) -> Result<Self, RiskRulesError> {
        let mut compiled = Vec::with_capacity(rules.rules.len());
        for rule in rules.rules {
            if rule.block && rule.replacement.is_none() {
                return Err(RiskRulesError::MissingReplacement(rule.category));
            }
            let patterns = rule
                .patterns
                .iter()
                .map(|p| RegexBuilder::new(p).case_insensitive(true).build())
                .collect::<Result<Vec<_>, _>>()
                .map_err(|source| RiskRulesError::Pattern {
                    category: rule.category.clone(),
                    source,
                })?;
            compiled.push(CompiledRule {
                category: rule.category,
                patterns,
                severity: rule.severity,
                block: rule.block,
                replacement: rule.replacement,
            });
        }
        Ok(Self {
            rules: compiled,
            version: rules.version,
        })
    }

    /// Load rules from a TOML file.
    pub fn from_file(path: &Path) -> Result<Self, RiskRulesError> {
        let content = std::fs::read_to_string(path)?;
        let rules: RiskRules = toml::from_str(&content)?;
        Self::new(rules)
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn check(&self, text: &str) -> RiskCheck {
        let matched: Vec<&CompiledRule> = self
            .rules
            .iter()
            .filter(|rule| rule.patterns.iter().any(|re| re.is_match(text)))
            .collect();

        let safe_text = matched
            .iter()
            .find(|rule| rule.block)
            .and_then(|rule| rule.replacement.clone())
            .unwrap_or_else(|| text.to_string());

        RiskCheck {
            is_risky: !matched.is_empty(),
            should_block: matched.iter().any(|rule| rule.block),
            highest_risk_level: matched.iter().map(|rule| rule.severity).max(),
            matched: matched
                .iter()
                .map(|rule| RiskMatch {
                    category: rule.category.clone(),
                    severity: rule.severity,
                    blocked: rule.block,
                })
                .collect(),
            safe_text,
        }
    }
}

/// Built-in rule table used when no rules file is configured.
pub fn default_rules() -> RiskRules {
    RiskRules {
        version: "1.0.0".to_string(),
        rules: vec![
            RiskRule {
                category: "guarantee".to_string(),
                patterns: vec![
                    r"\bguarantee(d|s)?\b".to_string(),
                    r"\b100\s?%\s+(sure|certain|guaranteed)\b".to_string(),
                    r"\brisk[- ]free\b".to_string(),
                    r"\bcan'?t lose\b".to_string(),
                ],
                severity: Severity::High,
                block: true,
                replacement: Some(
                    "I can't promise specific results, but I'm happy to walk you through what customers typically see."
                        .to_string(),
                ),
            },
            RiskRule {
                category: "sensitive_data".to_string(),
                patterns: vec![
                    r"\bsocial security\b".to_string(),
                    r"\b(credit|debit) card number\b".to_string(),
                    r"\bbank account number\b".to_string(),
                    r"\b(password|pin code)\b".to_string(),
                ],
                severity: Severity::Critical,
                block: true,
                replacement: Some(
                    "For your security, please don't share sensitive details over the phone. We'll send you a secure link instead."
                        .to_string(),
                ),
            },
            RiskRule {
                category: "professional_advice".to_string(),
                patterns: vec![
                    r"\b(legal|tax|investment|medical) advice\b".to_string(),
                    r"\byou should (invest|sue)\b".to_string(),
                ],
                severity: Severity::High,
                block: true,
                replacement: Some(
                    "I'm not able to advise on that; a qualified professional would be the right person to ask."
                        .to_string(),
                ),
            },
            RiskRule {
                category: "pressure".to_string(),
                patterns: vec![
                    r"\bact now\b".to_string(),
                    r"\blast chance\b".to_string(),
                    r"\b(only|expires) today\b".to_string(),
                    r"\blimited time\b".to_string(),
                ],
                severity: Severity::Medium,
                block: false,
                replacement: None,
            },
            RiskRule {
                category: "disparagement".to_string(),
                patterns: vec![
                    r"\b(scam|fraud|rip[- ]?off)\b".to_string(),
                    r"\b(terrible|awful|useless) (company|product|competitor)\b".to_string(),
                ],
                severity: Severity::Low,
                block: false,
                replacement: None,
            },
        ],
    }
}

impl Default for RiskFilter {
    fn default() -> Self {
        match Self::new(default_rules()) {
            Ok(filter) => filter,
            Err(e) => {
                tracing::error!("Built-in risk rules invalid: {e}");
                Self {
                    rules: Vec::new(),
                    version: String::new(),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule(category: &str, pattern: &str, severity: Severity, replacement: Option<&str>) -> RiskRule {
        RiskRule {
            category: category.to_string(),
            patterns: vec![pattern.to_string()],
            severity,
            block: replacement.is_some(),
            replacement: replacement.map(String::from),
        }
    }

    #[test]
    fn built_in_rules_compile() {
        let filter = RiskFilter::new(default_rules()).unwrap();
        assert_eq!(filter.version(), "1.0.0");
        assert_eq!(filter.rules.len(), 5);
    }

    #[test]
    fn clean_text_passes_through() {
        let filter = RiskFilter::default();
        for text in ["Thanks for taking my call.", "Our plans start at twenty dollars.", ""] {
            let check = filter.check(text);
            assert!(!check.is_risky);
            assert!(!check.should_block);
            assert_eq!(check.safe_text, text);
            assert_eq!(check.highest_risk_level, None);
        }
    }

    #[test]
    fn blocking_category_substitutes_replacement() {
        let filter = RiskFilter::default();
        let check = filter.check("This is GUARANTEED to double your revenue");
        assert!(check.is_risky);
        assert!(check.should_block);
        assert!(check.safe_text.starts_with("I can't promise"));
        assert_ne!(check.safe_text, "This is GUARANTEED to double your revenue");
    }

    #[test]
    fn non_blocking_match_keeps_text() {
        let filter = RiskFilter::default();
        let text = "This is a limited time offer";
        let check = filter.check(text);
        assert!(check.is_risky);
        assert!(!check.should_block);
        assert_eq!(check.safe_text, text);
        assert_eq!(check.highest_risk_level, Some(Severity::Medium));
    }

    #[test]
    fn first_blocking_category_wins_and_max_severity_reported() {
        let filter = RiskFilter::new(RiskRules {
            version: "t".into(),
            rules: vec![
                rule("pressure", r"act now", Severity::Medium, None),
                rule("first", r"promise", Severity::High, Some("first replacement")),
                rule("second", r"refund", Severity::Critical, Some("second replacement")),
            ],
        })
        .unwrap();

        let check = filter.check("Act now, I promise a full refund");
        assert_eq!(check.matched.len(), 3);
        assert_eq!(check.safe_text, "first replacement");
        assert_eq!(check.highest_risk_level, Some(Severity::Critical));
    }

    #[test]
    fn blocking_rule_without_replacement_is_rejected() {
        let mut bad = rule("x", "y", Severity::Low, None);
        bad.block = true;
        let err = RiskFilter::new(RiskRules {
            version: String::new(),
            rules: vec![bad],
        });
        assert!(matches!(err, Err(RiskRulesError::MissingReplacement(_))));
    }

    #[test]
    fn rules_load_from_toml() {
        let toml_str = r#"
            version = "2"
            [[rules]]
            category = "refunds"
            patterns = ['\bfull refund\b']
            severity = "high"
            block = true
            replacement = "Let me check our refund policy for you."
        "#;
        let rules: RiskRules = toml::from_str(toml_str).unwrap();
        let filter = RiskFilter::new(rules).unwrap();
        assert!(filter.check("you get a FULL REFUND").should_block);
    }

    #[test]
    fn severity_ordering() {
        assert!(Severity::Critical > Severity::High);
        assert!(Severity::High > Severity::Medium);
        assert!(Severity::Medium > Severity::Low);
    }
}
