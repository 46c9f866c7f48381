//! Deterministic keyword/regex rule matching with per-user weights.
//!
//! Each rule maps an intent to an agent route. Matches are scored by hit
//! count and the user's weight for that intent (1–5, default 2); the
//! weight table is adjustable at runtime.

use std::collections::HashMap;

use parking_lot::RwLock;
use regex::Regex;

pub const WEIGHT_MIN: u8 = 1;
pub const WEIGHT_MAX: u8 = 5;
pub const WEIGHT_DEFAULT: u8 = 2;

/// One routing rule.
#[derive(Debug, Clone)]
pub struct RouteRule {
    pub intent: String,
    pub route: String,
    pub keywords: Vec<String>,
    pub patterns: Vec<Regex>,
    pub base_confidence: f64,
}

/// A successful rule match.
#[derive(Debug, Clone)]
pub struct RuleMatch {
    pub route: String,
    pub intent: String,
    pub confidence: f64,
}

/// The rule matcher. Holds the rule table and the per-user weight table.
pub struct RuleMatcher {
    rules: Vec<RouteRule>,
    /// (user_id, intent) → weight.
    weights: RwLock<HashMap<(String, String), u8>>,
}

impl RuleMatcher {
    pub fn new(rules: Vec<RouteRule>) -> Self {
        Self {
            rules,
            weights: RwLock::new(HashMap::new()),
        }
    }

    /// Built-in rule set covering the default specialists.
    pub fn with_default_rules() -> Self {
        Self::new(default_rules())
    }

    /// Set a user's weight for an intent, clamped to [1, 5].
    pub fn set_weight(&self, user_id: &str, intent: &str, weight: u8) {
        let clamped = weight.clamp(WEIGHT_MIN, WEIGHT_MAX);
        self.weights
            .write()
            .insert((user_id.to_string(), intent.to_string()), clamped);
    }

    pub fn weight(&self, user_id: &str, intent: &str) -> u8 {
        self.weights
            .read()
            .get(&(user_id.to_string(), intent.to_string()))
            .copied()
            .unwrap_or(WEIGHT_DEFAULT)
    }

    /// Match an utterance. Returns the best-scoring rule, or `None` when
    /// nothing hits.
    pub fn match_input(&self, user_id: &str, input: &str) -> Option<RuleMatch> {
        let lower = input.to_lowercase();

        let mut best: Option<(f64, &RouteRule)> = None;
        for rule in &self.rules {
            let mut hits = 0u32;
            for keyword in &rule.keywords {
                if lower.contains(&keyword.to_lowercase()) {
                    hits += 1;
                }
            }
            for pattern in &rule.patterns {
                if pattern.is_match(input) {
                    hits += 1;
                }
            }
            if hits == 0 {
                continue;
            }

            let weight = self.weight(user_id, &rule.intent);
            let confidence = score(rule.base_confidence, hits, weight);
            if best.as_ref().map(|(c, _)| confidence > *c).unwrap_or(true) {
                best = Some((confidence, rule));
            }
        }

        best.map(|(confidence, rule)| {
            tracing::debug!(
                intent = %rule.intent,
                route = %rule.route,
                confidence,
                "rule matched"
            );
            RuleMatch {
                route: rule.route.clone(),
                intent: rule.intent.clone(),
                confidence,
            }
        })
    }
}

/// Confidence from base, hit count and user weight. Extra hits and an
/// above-default weight each nudge the score up; capped at 0.95.
fn score(base: f64, hits: u32, weight: u8) -> f64 {
    let hit_bonus = 0.05 * (hits.saturating_sub(1) as f64);
    let weight_bonus = 0.05 * (weight as f64 - WEIGHT_DEFAULT as f64);
    (base + hit_bonus + weight_bonus).clamp(0.0, 0.95)
}

fn default_rules() -> Vec<RouteRule> {
    vec![
        RouteRule {
            intent: "schedule".into(),
            route: "schedule".into(),
            keywords: vec![
                "schedule".into(),
                "remind".into(),
                "meeting".into(),
                "calendar".into(),
                "日程".into(),
                "提醒".into(),
                "会议".into(),
                "安排".into(),
            ],
            patterns: vec![Regex::new(r"(?i)\b(at|on)\s+\d{1,2}(:\d{2})?\s*(am|pm)?\b").unwrap()],
            base_confidence: 0.75,
        },
        RouteRule {
            intent: "note".into(),
            route: "note".into(),
            keywords: vec![
                "note".into(),
                "memo".into(),
                "write down".into(),
                "记录".into(),
                "笔记".into(),
                "备忘".into(),
            ],
            patterns: vec![],
            base_confidence: 0.75,
        },
        RouteRule {
            intent: "code".into(),
            route: "geek".into(),
            keywords: vec![
                "code".into(),
                "bug".into(),
                "debug".into(),
                "script".into(),
                "compile".into(),
                "代码".into(),
                "脚本".into(),
                "写个程序".into(),
                "报错".into(),
            ],
            patterns: vec![Regex::new(r"```").unwrap()],
            base_confidence: 0.8,
        },
        RouteRule {
            intent: "search".into(),
            route: "search".into(),
            keywords: vec![
                "search".into(),
                "look up".into(),
                "find out".into(),
                "查一下".into(),
                "搜索".into(),
                "查查".into(),
            ],
            patterns: vec![],
            base_confidence: 0.7,
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keyword_match_routes_to_agent() {
        let matcher = RuleMatcher::with_default_rules();
        let m = matcher.match_input("u1", "remind me about the meeting tomorrow").unwrap();
        assert_eq!(m.route, "schedule");
        assert_eq!(m.intent, "schedule");
        assert!(m.confidence > 0.75, "two hits should beat the base");
    }

    #[test]
    fn chinese_keywords_match() {
        let matcher = RuleMatcher::with_default_rules();
        let m = matcher.match_input("u1", "帮我记录一下这个想法").unwrap();
        assert_eq!(m.route, "note");
    }

    #[test]
    fn no_hit_returns_none() {
        let matcher = RuleMatcher::with_default_rules();
        assert!(matcher.match_input("u1", "tell me a story").is_none());
    }

    #[test]
    fn weights_shift_confidence() {
        let matcher = RuleMatcher::with_default_rules();
        let baseline = matcher.match_input("u1", "search for rust books").unwrap();

        matcher.set_weight("u1", "search", 5);
        let boosted = matcher.match_input("u1", "search for rust books").unwrap();
        assert!(boosted.confidence > baseline.confidence);

        matcher.set_weight("u1", "search", 1);
        let damped = matcher.match_input("u1", "search for rust books").unwrap();
        assert!(damped.confidence < baseline.confidence);
    }

    #[test]
    fn weights_clamp_to_range() {
        let matcher = RuleMatcher::with_default_rules();
        matcher.set_weight("u1", "search", 40);
        assert_eq!(matcher.weight("u1", "search"), WEIGHT_MAX);
        matcher.set_weight("u1", "search", 0);
        assert_eq!(matcher.weight("u1", "search"), WEIGHT_MIN);
    }

    #[test]
    fn default_weight_applies_to_unknown_users() {
        let matcher = RuleMatcher::with_default_rules();
        assert_eq!(matcher.weight("nobody", "schedule"), WEIGHT_DEFAULT);
    }

    #[test]
    fn confidence_never_exceeds_cap() {
        let matcher = RuleMatcher::with_default_rules();
        matcher.set_weight("u1", "code", 5);
        let m = matcher
            .match_input("u1", "debug this code script bug 代码 报错 ```rust```")
            .unwrap();
        assert!(m.confidence <= 0.95);
    }
}
