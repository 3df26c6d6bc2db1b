//! Pattern library: compiled, immutable rule sets.
//!
//! A [`PatternLibrary`] is built once (from the built-in tables, a TOML rule
//! file, or both) and never mutated afterwards. Hot reload goes through
//! [`LibraryHandle::replace`], which swaps the whole set; a scan in progress
//! keeps the snapshot it started with.
//!
//! Rule file format:
//!
//! ```toml
//! [[rules]]
//! id = "internal_codename"
//! category = "data_exfiltration"
//! severity = "high"
//! weight = 0.8
//! matcher = { keywords = ["project nightjar", "nightjar roadmap"] }
//!
//! [[rules]]
//! id = "ticket_number"
//! category = "pii"
//! severity = "low"
//! matcher = { regex = "\\bTCK-\\d{6}\\b" }
//! direction = "outbound"
//! ```

use std::collections::{BTreeSet, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use lazy_static::lazy_static;
use regex::bytes::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};

use super::patterns::{builtin_patterns, PatternMatcher, Severity, ThreatCategory, ThreatPattern};
use crate::error::{Result, WardenError};
use crate::request::Direction;

/// Compiled regex size cap; keeps a hostile rule file from exhausting memory.
const REGEX_SIZE_LIMIT: usize = 1 << 20;

/// Matcher as written in a rule file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
pub enum MatcherSpec {
    /// Regular expression (byte-oriented, UTF-8 aware)
    Regex(String),
    /// Case-insensitive whole-word keyword list
    Keywords(Vec<String>),
    /// High-entropy token heuristic
    Entropy {
        /// Minimum token length
        min_len: usize,
        /// Minimum bits per byte
        min_bits: f32,
    },
    /// Luhn-valid digit run
    PaymentCard,
}

fn default_weight() -> f32 {
    0.8
}

/// A rule definition before compilation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RuleSpec {
    /// Unique rule id
    pub id: String,
    /// Threat category
    pub category: ThreatCategory,
    /// Severity
    pub severity: Severity,
    /// Confidence contribution (0.0 - 1.0)
    #[serde(default = "default_weight")]
    pub weight: f32,
    /// Description
    #[serde(default)]
    pub description: String,
    /// Matcher
    pub matcher: MatcherSpec,
    /// Restrict to one direction
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub direction: Option<Direction>,
    /// Match against raw bytes instead of normalized input
    #[serde(default)]
    pub raw: bool,
}

impl From<&ThreatPattern> for RuleSpec {
    fn from(pattern: &ThreatPattern) -> Self {
        let matcher = match pattern.matcher {
            PatternMatcher::Regex(re) => MatcherSpec::Regex(re.to_string()),
            PatternMatcher::Entropy { min_len, min_bits } => MatcherSpec::Entropy { min_len, min_bits },
            PatternMatcher::PaymentCard => MatcherSpec::PaymentCard,
        };
        Self {
            id: pattern.name.to_string(),
            category: pattern.category,
            severity: pattern.severity,
            weight: pattern.weight,
            description: pattern.description.to_string(),
            matcher,
            direction: None,
            raw: pattern.raw,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RulesFile {
    #[serde(default)]
    rules: Vec<RuleSpec>,
}

/// Parse a TOML rule document
pub fn parse_rules(toml_src: &str) -> Result<Vec<RuleSpec>> {
    let file: RulesFile = toml::from_str(toml_src)?;
    Ok(file.rules)
}

/// Read and parse a TOML rule file
pub fn load_rules_file(path: &Path) -> Result<Vec<RuleSpec>> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| WardenError::Config(format!("Failed to read rules file {}: {e}", path.display())))?;
    parse_rules(&content)
}

/// Built-in rules as specs
pub fn builtin_specs() -> Vec<RuleSpec> {
    builtin_patterns().map(RuleSpec::from).collect()
}

#[derive(Debug)]
enum Matcher {
    Regex(Regex),
    Entropy { min_len: usize, min_bits: f32 },
    PaymentCard,
}

impl Matcher {
    fn compile(id: &str, spec: &MatcherSpec) -> Result<Self> {
        let invalid = |reason: String| WardenError::InvalidRule {
            id: id.to_string(),
            reason,
        };

        match spec {
            MatcherSpec::Regex(pattern) => RegexBuilder::new(pattern)
                .size_limit(REGEX_SIZE_LIMIT)
                .build()
                .map(Matcher::Regex)
                .map_err(|e| invalid(e.to_string())),
            MatcherSpec::Keywords(words) => {
                let words: Vec<String> = words
                    .iter()
                    .map(|w| w.trim())
                    .filter(|w| !w.is_empty())
                    .map(|w| regex::escape(w).replace(' ', r"\s+"))
                    .collect();
                if words.is_empty() {
                    return Err(invalid("keyword list is empty".to_string()));
                }
                let pattern = format!(r"(?i)\b(?:{})\b", words.join("|"));
                RegexBuilder::new(&pattern)
                    .size_limit(REGEX_SIZE_LIMIT)
                    .build()
                    .map(Matcher::Regex)
                    .map_err(|e| invalid(e.to_string()))
            },
            MatcherSpec::Entropy { min_len, min_bits } => {
                if *min_len < 8 || !(0.0..=8.0).contains(min_bits) {
                    return Err(invalid(format!(
                        "entropy matcher needs min_len >= 8 and 0 <= min_bits <= 8, got {min_len}/{min_bits}"
                    )));
                }
                Ok(Matcher::Entropy {
                    min_len: *min_len,
                    min_bits: *min_bits,
                })
            },
            MatcherSpec::PaymentCard => Ok(Matcher::PaymentCard),
        }
    }

    fn is_match(&self, input: &[u8]) -> bool {
        match self {
            Matcher::Regex(re) => re.is_match(input),
            Matcher::Entropy { min_len, min_bits } => has_high_entropy_token(input, *min_len, *min_bits),
            Matcher::PaymentCard => has_payment_card(input),
        }
    }
}

/// A rule ready for evaluation
#[derive(Debug)]
pub struct CompiledRule {
    id: String,
    category: ThreatCategory,
    severity: Severity,
    weight: f32,
    description: String,
    direction: Option<Direction>,
    raw: bool,
    matcher: Matcher,
}

impl CompiledRule {
    /// Compile one rule definition
    pub fn compile(spec: &RuleSpec) -> Result<Self> {
        if spec.id.trim().is_empty() {
            return Err(WardenError::InvalidRule {
                id: spec.id.clone(),
                reason: "rule id is empty".to_string(),
            });
        }
        if !(spec.weight > 0.0 && spec.weight <= 1.0) {
            return Err(WardenError::InvalidRule {
                id: spec.id.clone(),
                reason: format!("weight {} outside (0, 1]", spec.weight),
            });
        }
        if spec.category == ThreatCategory::MultiStageAttack {
            return Err(WardenError::InvalidRule {
                id: spec.id.clone(),
                reason: "multi_stage_attack is assigned by correlation, not by rules".to_string(),
            });
        }

        Ok(Self {
            id: spec.id.clone(),
            category: spec.category,
            severity: spec.severity,
            weight: spec.weight,
            description: spec.description.clone(),
            direction: spec.direction,
            raw: spec.raw,
            matcher: Matcher::compile(&spec.id, &spec.matcher)?,
        })
    }

    /// Rule id
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Threat category
    pub fn category(&self) -> ThreatCategory {
        self.category
    }

    /// Severity
    pub fn severity(&self) -> Severity {
        self.severity
    }

    /// Confidence contribution
    pub fn weight(&self) -> f32 {
        self.weight
    }

    /// Description
    pub fn description(&self) -> &str {
        &self.description
    }

    /// True if the rule runs for this direction
    pub fn applies_to(&self, direction: Direction) -> bool {
        self.direction.map_or(true, |d| d == direction)
    }

    /// Evaluate against normalized and raw input
    pub fn matches(&self, normalized: &[u8], raw: &[u8]) -> bool {
        if self.raw {
            self.matcher.is_match(raw)
        } else {
            self.matcher.is_match(normalized)
        }
    }
}

/// Immutable set of compiled rules
#[derive(Debug, Default)]
pub struct PatternLibrary {
    rules: Vec<CompiledRule>,
}

impl PatternLibrary {
    /// Compile specs, failing on the first bad rule or duplicate id
    pub fn compile(specs: &[RuleSpec]) -> Result<Self> {
        let mut seen = HashSet::new();
        let mut rules = Vec::with_capacity(specs.len());

        for spec in specs {
            if !seen.insert(spec.id.as_str()) {
                return Err(WardenError::InvalidRule {
                    id: spec.id.clone(),
                    reason: "duplicate rule id".to_string(),
                });
            }
            rules.push(CompiledRule::compile(spec)?);
        }

        Ok(Self { rules })
    }

    /// Compile specs, skipping (and logging) any that fail
    fn compile_lenient(specs: &[RuleSpec]) -> Self {
        let rules = specs
            .iter()
            .filter_map(|spec| match CompiledRule::compile(spec) {
                Ok(rule) => Some(rule),
                Err(e) => {
                    tracing::error!(rule = %spec.id, "skipping built-in rule: {e}");
                    None
                },
            })
            .collect();
        Self { rules }
    }

    /// Shared built-in library
    pub fn builtin() -> Arc<PatternLibrary> {
        Arc::clone(&BUILTIN_LIBRARY)
    }

    /// Built-in rules (optional) followed by rules from a TOML file (optional)
    pub fn load(include_builtin: bool, rules_path: Option<&Path>) -> Result<Self> {
        let mut specs = if include_builtin { builtin_specs() } else { Vec::new() };
        if let Some(path) = rules_path {
            let extra = load_rules_file(path)?;
            tracing::info!(path = %path.display(), rules = extra.len(), "loaded rule file");
            specs.extend(extra);
        }
        Self::compile(&specs)
    }

    /// Rules in evaluation order
    pub fn rules(&self) -> &[CompiledRule] {
        &self.rules
    }

    /// Look up a rule by id
    pub fn get(&self, id: &str) -> Option<&CompiledRule> {
        self.rules.iter().find(|r| r.id == id)
    }

    /// Number of rules
    pub fn len(&self) -> usize {
        self.rules.len()
    }

    /// True when no rules are loaded
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Categories covered by at least one rule
    pub fn categories(&self) -> BTreeSet<ThreatCategory> {
        self.rules.iter().map(|r| r.category).collect()
    }
}

lazy_static! {
    /// Compiled built-in rules
    static ref BUILTIN_LIBRARY: Arc<PatternLibrary> =
        Arc::new(PatternLibrary::compile_lenient(&builtin_specs()));
}

/// Shared, swappable pointer to the active library.
///
/// Cloning the handle shares the slot; `replace` is visible to every clone.
#[derive(Debug, Clone)]
pub struct LibraryHandle {
    slot: Arc<RwLock<Arc<PatternLibrary>>>,
    version: Arc<AtomicU64>,
}

impl LibraryHandle {
    /// Wrap a library
    pub fn new(library: Arc<PatternLibrary>) -> Self {
        Self {
            slot: Arc::new(RwLock::new(library)),
            version: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Handle over the built-in library
    pub fn builtin() -> Self {
        Self::new(PatternLibrary::builtin())
    }

    /// Current snapshot
    pub fn current(&self) -> Arc<PatternLibrary> {
        let guard = self.slot.read().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(&guard)
    }

    /// Atomically swap in a new rule set, returning the new version
    pub fn replace(&self, library: PatternLibrary) -> u64 {
        let rules = library.len();
        {
            let mut guard = self.slot.write().unwrap_or_else(PoisonError::into_inner);
            *guard = Arc::new(library);
        }
        let version = self.version.fetch_add(1, Ordering::AcqRel) + 1;
        tracing::info!(version, rules, "pattern library replaced");
        version
    }

    /// Monotonic version, bumped on every replace
    pub fn version(&self) -> u64 {
        self.version.load(Ordering::Acquire)
    }
}

impl Default for LibraryHandle {
    fn default() -> Self {
        Self::builtin()
    }
}

fn is_token_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || matches!(b, b'+' | b'/' | b'=' | b'_' | b'-')
}

/// Any token of `min_len`+ bytes with mixed letters/digits and Shannon
/// entropy of at least `min_bits` per byte.
fn has_high_entropy_token(input: &[u8], min_len: usize, min_bits: f32) -> bool {
    input
        .split(|b| !is_token_byte(*b))
        .filter(|tok| tok.len() >= min_len)
        .filter(|tok| tok.iter().any(u8::is_ascii_digit) && tok.iter().any(u8::is_ascii_alphabetic))
        .any(|tok| shannon_entropy(tok) >= min_bits)
}

fn shannon_entropy(token: &[u8]) -> f32 {
    let mut counts = [0u32; 256];
    for &b in token {
        counts[b as usize] += 1;
    }
    let len = token.len() as f32;
    counts
        .iter()
        .filter(|&&c| c > 0)
        .map(|&c| {
            let p = c as f32 / len;
            -p * p.log2()
        })
        .sum()
}

/// Digit runs of 13-19 digits (single spaces or dashes allowed between
/// digits) that pass the Luhn check.
fn has_payment_card(input: &[u8]) -> bool {
    let mut digits: Vec<u8> = Vec::with_capacity(19);
    let mut i = 0;

    while i < input.len() {
        let b = input[i];
        if b.is_ascii_digit() {
            // a run must not start in the middle of a longer alphanumeric token
            if digits.is_empty() && i > 0 && input[i - 1].is_ascii_alphanumeric() {
                while i < input.len() && input[i].is_ascii_alphanumeric() {
                    i += 1;
                }
                continue;
            }
            digits.push(b - b'0');
        } else if (b == b' ' || b == b'-')
            && !digits.is_empty()
            && input.get(i + 1).is_some_and(u8::is_ascii_digit)
        {
            // separator inside a run
        } else {
            if is_card_number(&digits) {
                return true;
            }
            digits.clear();
        }
        i += 1;
    }

    is_card_number(&digits)
}

fn is_card_number(digits: &[u8]) -> bool {
    if !(13..=19).contains(&digits.len()) {
        return false;
    }
    if digits.iter().all(|d| *d == digits[0]) {
        return false;
    }

    let sum: u32 = digits
        .iter()
        .rev()
        .enumerate()
        .map(|(idx, &d)| {
            let d = u32::from(d);
            if idx % 2 == 1 {
                let doubled = d * 2;
                if doubled > 9 {
                    doubled - 9
                } else {
                    doubled
                }
            } else {
                d
            }
        })
        .sum();
    sum % 10 == 0
}
