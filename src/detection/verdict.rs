//! Detection verdicts and the severity -> action policy.

use serde::{Deserialize, Serialize};

use super::patterns::{Severity, ThreatCategory};
use crate::fingerprint::Fingerprint;
use crate::store::SimilarityMatch;

/// What the caller is advised to do
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    /// Forward the request
    Allow,
    /// Forward, but record for review
    Flag,
    /// Reject the request
    Block,
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Action::Allow => write!(f, "allow"),
            Action::Flag => write!(f, "flag"),
            Action::Block => write!(f, "block"),
        }
    }
}

/// Configurable severity -> action map.
///
/// A `Block` is downgraded to `Flag` when the verdict confidence is below
/// `min_block_confidence`, so noisy heuristics cannot block on their own.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ActionMap {
    /// Action for `Low`
    pub low: Action,
    /// Action for `Medium`
    pub medium: Action,
    /// Action for `High`
    pub high: Action,
    /// Action for `Critical`
    pub critical: Action,
    /// Minimum confidence for a `Block`
    pub min_block_confidence: f32,
}

impl Default for ActionMap {
    fn default() -> Self {
        Self {
            low: Action::Allow,
            medium: Action::Flag,
            high: Action::Block,
            critical: Action::Block,
            min_block_confidence: 0.6,
        }
    }
}

impl ActionMap {
    /// Action for a severity alone
    pub fn for_severity(&self, severity: Severity) -> Action {
        match severity {
            Severity::Low => self.low,
            Severity::Medium => self.medium,
            Severity::High => self.high,
            Severity::Critical => self.critical,
        }
    }

    /// Resolve the recommended action
    pub fn resolve(&self, severity: Option<Severity>, confidence: f32) -> Action {
        match severity.map(|s| self.for_severity(s)) {
            None => Action::Allow,
            Some(Action::Block) if confidence < self.min_block_confidence => Action::Flag,
            Some(action) => action,
        }
    }
}

/// Which stages produced the verdict
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PathTaken {
    /// Pattern scan only
    FastOnly,
    /// Pattern scan followed by similarity lookup
    FastPlusVector,
}

/// Whether the pipeline reached a decision
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    /// Normal verdict
    Decided,
    /// Deadline expired before the scan finished
    Timeout,
}

/// How the content was read
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Encoding {
    /// Valid UTF-8, text normalization applied
    Utf8,
    /// Not UTF-8, matched as raw bytes
    Raw,
}

impl Encoding {
    /// Path `content` takes through the matchers
    pub fn of(content: &[u8]) -> Self {
        if std::str::from_utf8(content).is_ok() {
            Encoding::Utf8
        } else {
            Encoding::Raw
        }
    }
}

/// One matched category
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CategoryMatch {
    /// Category
    pub category: ThreatCategory,
    /// Highest severity among its matches
    pub severity: Severity,
    /// Noisy-OR of the matching rule weights
    pub confidence: f32,
    /// Rules (or similarity hits) that fired
    pub rule_ids: Vec<String>,
}

/// Structured detection outcome
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectionVerdict {
    /// Anything matched at all
    pub detected: bool,
    /// Matched categories, ordered by category
    pub categories: Vec<CategoryMatch>,
    /// Highest severity, `None` when nothing matched
    pub max_severity: Option<Severity>,
    /// Overall confidence (0.0 - 1.0), independent of `detected`
    pub confidence: f32,
    /// SHA-256 of the full content
    pub fingerprint: Fingerprint,
    /// Action from the severity map
    pub recommended_action: Action,
    /// Time spent producing the verdict
    pub timing_ns: u64,
    /// Stages taken
    pub path_taken: PathTaken,
    /// Decided or timed out
    pub outcome: Outcome,
    /// Text or raw-byte path
    pub encoding: Encoding,
    /// Similar known threats, when the vector stage ran
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub similar_threats: Vec<SimilarityMatch>,
}

impl DetectionVerdict {
    /// Explicit timeout verdict for `content`
    pub fn timeout(content: &[u8], action: Action, elapsed_ns: u64) -> Self {
        Self {
            detected: false,
            categories: Vec::new(),
            max_severity: None,
            confidence: 0.0,
            fingerprint: Fingerprint::of(content),
            recommended_action: action,
            timing_ns: elapsed_ns,
            path_taken: PathTaken::FastOnly,
            outcome: Outcome::Timeout,
            encoding: Encoding::of(content),
            similar_threats: Vec::new(),
        }
    }

    /// Matched categories
    pub fn matched_categories(&self) -> Vec<ThreatCategory> {
        self.categories.iter().map(|c| c.category).collect()
    }

    /// Category lookup
    pub fn category(&self, category: ThreatCategory) -> Option<&CategoryMatch> {
        self.categories.iter().find(|c| c.category == category)
    }

    /// True if the category matched
    pub fn has_category(&self, category: ThreatCategory) -> bool {
        self.category(category).is_some()
    }

    /// True when multi-stage correlation fired
    pub fn is_multi_stage(&self) -> bool {
        self.has_category(ThreatCategory::MultiStageAttack)
    }

    /// True for timeout verdicts
    pub fn is_timeout(&self) -> bool {
        self.outcome == Outcome::Timeout
    }

    /// Caller-side threshold check
    pub fn exceeds(&self, threshold: f32) -> bool {
        self.detected && self.confidence >= threshold
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_action_map_defaults() {
        let map = ActionMap::default();
        assert_eq!(map.resolve(None, 1.0), Action::Allow);
        assert_eq!(map.resolve(Some(Severity::Low), 0.9), Action::Allow);
        assert_eq!(map.resolve(Some(Severity::Medium), 0.9), Action::Flag);
        assert_eq!(map.resolve(Some(Severity::High), 0.9), Action::Block);
    }

    #[test]
    fn test_low_confidence_block_downgraded() {
        let map = ActionMap::default();
        assert_eq!(map.resolve(Some(Severity::Critical), 0.3), Action::Flag);
    }

    #[test]
    fn test_custom_map() {
        let map = ActionMap {
            medium: Action::Block,
            min_block_confidence: 0.0,
            ..Default::default()
        };
        assert_eq!(map.resolve(Some(Severity::Medium), 0.1), Action::Block);
    }

    #[test]
    fn test_timeout_verdict() {
        let v = DetectionVerdict::timeout(b"x", Action::Flag, 10);
        assert!(v.is_timeout());
        assert_eq!(v.fingerprint, Fingerprint::of(b"x"));
        assert_eq!(v.encoding, Encoding::Utf8);
        assert_eq!(DetectionVerdict::timeout(&[0xff, 0xfe], Action::Flag, 10).encoding, Encoding::Raw);
        assert!(!v.detected);
        assert!(!v.exceeds(0.0));
        assert_eq!(v.recommended_action, Action::Flag);
    }
}
