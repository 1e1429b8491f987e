use std::fmt;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

/// Objection categories recognised on customer turns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ObjectionCategory {
    Price,
    Timing,
    Competition,
    Authority,
    Need,
    Trust,
    Feature,
    Support,
    Contract,
}

impl ObjectionCategory {
    pub const ALL: [ObjectionCategory; 9] = [
        ObjectionCategory::Price,
        ObjectionCategory::Timing,
        ObjectionCategory::Competition,
        ObjectionCategory::Authority,
        ObjectionCategory::Need,
        ObjectionCategory::Trust,
        ObjectionCategory::Feature,
        ObjectionCategory::Support,
        ObjectionCategory::Contract,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ObjectionCategory::Price => "price",
            ObjectionCategory::Timing => "timing",
            ObjectionCategory::Competition => "competition",
            ObjectionCategory::Authority => "authority",
            ObjectionCategory::Need => "need",
            ObjectionCategory::Trust => "trust",
            ObjectionCategory::Feature => "feature",
            ObjectionCategory::Support => "support",
            ObjectionCategory::Contract => "contract",
        }
    }

    fn patterns(self) -> &'static [&'static str] {
        match self {
            ObjectionCategory::Price => &[
                r"\bexpensive\b",
                r"\bcost(s|ly)?\b",
                r"\bpric(e|es|ed|ing)\b",
                r"\bbudget\b",
                r"\bafford\b",
                r"\bcheaper\b",
            ],
            ObjectionCategory::Timing => &[
                r"\bnot (a good|the right) time\b",
                r"\b(later|next (week|month|quarter|year))\b",
                r"\bbusy\b",
                r"\bcall (me )?back\b",
                r"\bno time\b",
            ],
            ObjectionCategory::Competition => &[
                r"\bcompetitors?\b",
                r"\balready (use|have|work with)\b",
                r"\b(another|other) (vendor|provider|company)\b",
                r"\bhappy with (our|my) current\b",
            ],
            ObjectionCategory::Authority => &[
                r"\b(my|our) (boss|manager|partner|wife|husband|team)\b",
                r"\bnot (the|my) decision\b",
                r"\bneed to (ask|check with|talk to)\b",
                r"\bdecision maker\b",
            ],
            ObjectionCategory::Need => &[
                r"\bdon'?t need\b",
                r"\bnot interested\b",
                r"\bno need\b",
                r"\b(we're|we are|i'm|i am) (fine|good|all set)\b",
            ],
            ObjectionCategory::Trust => &[
                r"\bscam\b",
                r"\btrust\b",
                r"\b(never heard of|who are you)\b",
                r"\blegit(imate)?\b",
                r"\breviews?\b",
            ],
            ObjectionCategory::Feature => &[
                r"\b(doesn'?t|does not|can'?t|cannot) (do|support|handle)\b",
                r"\bmissing\b",
                r"\bfeatures?\b",
                r"\bintegrat(e|ion|ions)\b",
            ],
            ObjectionCategory::Support => &[
                r"\bsupport\b",
                r"\bcustomer service\b",
                r"\bhelp ?desk\b",
                r"\bresponse times?\b",
            ],
            ObjectionCategory::Contract => &[
                r"\bcontracts?\b",
                r"\b(commitment|locked in|lock-in)\b",
                r"\bcancel(lation)?\b",
                r"\bterms\b",
            ],
        }
    }
}

impl fmt::Display for ObjectionCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

static OBJECTION_PATTERNS: Lazy<Vec<(ObjectionCategory, Vec<Regex>)>> = Lazy::new(|| {
    ObjectionCategory::ALL
        .into_iter()
        .map(|category| {
            let compiled = category
                .patterns()
                .iter()
                .filter_map(|p| match Regex::new(&format!("(?i){p}")) {
                    Ok(re) => Some(re),
                    Err(e) => {
                        tracing::error!(category = %category, pattern = p, "Bad objection pattern: {e}");
                        None
                    }
                })
                .collect();
            (category, compiled)
        })
        .collect()
});

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DetectedObjection {
    pub category: ObjectionCategory,
    /// Matched patterns / patterns defined for the category, in [0, 1].
    pub confidence: f64,
}

/// Pick the category with the most matching patterns. Ties go to the earlier
/// category in declaration order.
pub fn detect(text: &str) -> Option<DetectedObjection> {
    if text.trim().is_empty() {
        return None;
    }

    let mut best: Option<(ObjectionCategory, usize, usize)> = None;
    for (category, patterns) in OBJECTION_PATTERNS.iter() {
        let matched = patterns.iter().filter(|re| re.is_match(text)).count();
        if matched == 0 {
            continue;
        }
        match best {
            Some((_, best_matched, _)) if best_matched >= matched => {}
            _ => best = Some((*category, matched, patterns.len())),
        }
    }

    best.map(|(category, matched, total)| DetectedObjection {
        category,
        confidence: (matched as f64 / total.max(1) as f64).clamp(0.0, 1.0),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_category_compiles_all_patterns() {
        for (category, compiled) in OBJECTION_PATTERNS.iter() {
            assert_eq!(compiled.len(), category.patterns().len(), "{category}");
        }
    }

    #[test]
    fn budget_complaint_is_price() {
        let found = detect("this seems too expensive for our budget").unwrap();
        assert_eq!(found.category, ObjectionCategory::Price);
        assert!(found.confidence > 0.0);
        assert!((found.confidence - 2.0 / 6.0).abs() < 1e-9);
    }

    #[test]
    fn categories_are_recognised() {
        let cases = [
            ("call me back next month", ObjectionCategory::Timing),
            ("we already use a competitor", ObjectionCategory::Competition),
            ("I need to check with my manager", ObjectionCategory::Authority),
            ("honestly we're not interested", ObjectionCategory::Need),
            ("is this a scam?", ObjectionCategory::Trust),
            ("does it have the integration we need", ObjectionCategory::Feature),
            ("your customer service is slow", ObjectionCategory::Support),
            ("I don't want a long contract", ObjectionCategory::Contract),
        ];
        for (text, expected) in cases {
            assert_eq!(detect(text).map(|d| d.category), Some(expected), "{text}");
        }
    }

    #[test]
    fn plain_text_has_no_objection() {
        assert_eq!(detect("Hello, who am I speaking with"), None);
        assert_eq!(detect("   "), None);
    }
}
