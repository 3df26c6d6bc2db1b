//! Built-in threat patterns.
//!
//! Static rule tables compiled into the binary, grouped by category:
//! - Prompt injection
//! - Jailbreak attempts
//! - SQL injection, XSS, code execution
//! - Data exfiltration and PII
//! - Obfuscation (matched against the raw, un-normalized bytes)
//! - Multi-stage indicators

use serde::{Deserialize, Serialize};

/// Threat categories
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThreatCategory {
    /// Prompt injection
    PromptInjection,
    /// SQL injection
    SqlInjection,
    /// Cross-site scripting
    Xss,
    /// Shell / interpreter code execution
    CodeExecution,
    /// Jailbreak attempt
    Jailbreak,
    /// Personally identifiable information or secrets
    Pii,
    /// Data exfiltration
    DataExfiltration,
    /// Hidden characters, null bytes, encoding tricks
    Obfuscation,
    /// Staging language ("in your next reply ...")
    MultiStageIndicator,
    /// Synthetic: several distinct categories in one request
    MultiStageAttack,
}

impl ThreatCategory {
    /// Every category, in declaration order
    pub const ALL: [ThreatCategory; 10] = [
        ThreatCategory::PromptInjection,
        ThreatCategory::SqlInjection,
        ThreatCategory::Xss,
        ThreatCategory::CodeExecution,
        ThreatCategory::Jailbreak,
        ThreatCategory::Pii,
        ThreatCategory::DataExfiltration,
        ThreatCategory::Obfuscation,
        ThreatCategory::MultiStageIndicator,
        ThreatCategory::MultiStageAttack,
    ];
}

impl std::fmt::Display for ThreatCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ThreatCategory::PromptInjection => write!(f, "prompt_injection"),
            ThreatCategory::SqlInjection => write!(f, "sql_injection"),
            ThreatCategory::Xss => write!(f, "xss"),
            ThreatCategory::CodeExecution => write!(f, "code_execution"),
            ThreatCategory::Jailbreak => write!(f, "jailbreak"),
            ThreatCategory::Pii => write!(f, "pii"),
            ThreatCategory::DataExfiltration => write!(f, "data_exfiltration"),
            ThreatCategory::Obfuscation => write!(f, "obfuscation"),
            ThreatCategory::MultiStageIndicator => write!(f, "multi_stage_indicator"),
            ThreatCategory::MultiStageAttack => write!(f, "multi_stage_attack"),
        }
    }
}

/// Rule severity, ordered `Low < Medium < High < Critical`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// Informational
    Low,
    /// Suspicious
    Medium,
    /// Likely attack
    High,
    /// Attack, skip further analysis
    Critical,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Severity::Low => write!(f, "low"),
            Severity::Medium => write!(f, "medium"),
            Severity::High => write!(f, "high"),
            Severity::Critical => write!(f, "critical"),
        }
    }
}

/// How a built-in pattern matches
#[derive(Debug, Clone, Copy)]
pub enum PatternMatcher {
    /// Byte regex
    Regex(&'static str),
    /// High-entropy token heuristic
    Entropy {
        /// Minimum token length
        min_len: usize,
        /// Minimum Shannon entropy, bits per byte
        min_bits: f32,
    },
    /// Digit run passing the Luhn check
    PaymentCard,
}

/// A built-in threat detection pattern
#[derive(Debug, Clone, Copy)]
pub struct ThreatPattern {
    /// Pattern name (rule id)
    pub name: &'static str,
    /// Matcher
    pub matcher: PatternMatcher,
    /// Threat category
    pub category: ThreatCategory,
    /// Severity
    pub severity: Severity,
    /// Confidence contribution (0.0 - 1.0)
    pub weight: f32,
    /// Description
    pub description: &'static str,
    /// Match against raw bytes instead of normalized input
    pub raw: bool,
}

const fn regex(
    name: &'static str,
    pattern: &'static str,
    category: ThreatCategory,
    severity: Severity,
    weight: f32,
    description: &'static str,
) -> ThreatPattern {
    ThreatPattern {
        name,
        matcher: PatternMatcher::Regex(pattern),
        category,
        severity,
        weight,
        description,
        raw: false,
    }
}

use Severity::{Critical, High, Low, Medium};
use ThreatCategory as C;

/// Prompt injection patterns
pub static INJECTION_PATTERNS: &[ThreatPattern] = &[
    regex(
        "ignore_instructions",
        r"(?i)ignore\s+(all\s+)?(the\s+)?(previous|prior|above|earlier)\s+(instructions?|prompts?|rules?|directions?)",
        C::PromptInjection,
        High,
        0.9,
        "Attempts to override system instructions",
    ),
    regex(
        "disregard_instructions",
        r"(?i)disregard\s+(all\s+)?(previous|prior|above)\s+(instructions?|prompts?)",
        C::PromptInjection,
        High,
        0.9,
        "Attempts to disregard system prompt",
    ),
    regex(
        "forget_instructions",
        r"(?i)forget\s+(your|all|previous)\s+(instructions?|rules?|training)",
        C::PromptInjection,
        High,
        0.85,
        "Attempts to make model forget constraints",
    ),
    regex(
        "new_instructions",
        r"(?i)your\s+new\s+(instructions?|rules?|role)\s+(are|is|:)",
        C::PromptInjection,
        High,
        0.85,
        "Attempts to inject new instructions",
    ),
    regex(
        "system_prompt_extract",
        r"(?i)(show|reveal|print|output|repeat|display)\s+(me\s+)?(your\s+)?(system\s+)?(prompt|instructions?)",
        C::PromptInjection,
        High,
        0.8,
        "Attempts to extract system prompt",
    ),
    regex(
        "fake_system",
        r"(?im)^\s*\[?system\]?\s*[:\-]",
        C::PromptInjection,
        High,
        0.75,
        "Fake system message injection",
    ),
    regex(
        "chat_template_tokens",
        r"(?i)(<\|im_start\|>|<\|im_end\|>|<\|endoftext\|>|\[/?INST\]|</?system>)",
        C::PromptInjection,
        High,
        0.85,
        "Raw chat-template control tokens",
    ),
    regex(
        "role_override",
        r"(?i)you\s+are\s+(now|actually)\s+(a|an|the)\s+",
        C::PromptInjection,
        Medium,
        0.6,
        "Attempts to override model role",
    ),
];

/// Jailbreak patterns
pub static JAILBREAK_PATTERNS: &[ThreatPattern] = &[
    regex(
        "dan_mode",
        r"(?i)(enable\s+)?\bdan\s+mode|do\s+anything\s+now",
        C::Jailbreak,
        Critical,
        0.95,
        "DAN (Do Anything Now) jailbreak",
    ),
    regex(
        "developer_mode",
        r"(?i)(enter|enable|activate)\s+(developer|dev)\s+mode",
        C::Jailbreak,
        High,
        0.9,
        "Fake developer mode activation",
    ),
    regex(
        "jailbreak_explicit",
        r"(?i)\bjail\s*break",
        C::Jailbreak,
        Medium,
        0.6,
        "Explicit jailbreak mention",
    ),
    regex(
        "bypass_explicit",
        r"(?i)bypass\s+(all\s+|your\s+)?(safety|content|ethical|security)\s+(filters?|restrictions?|guidelines?)",
        C::Jailbreak,
        High,
        0.9,
        "Explicit bypass attempt",
    ),
    regex(
        "unrestricted_mode",
        r"(?i)(unrestricted|unfiltered|uncensored|unethical)\s+mode",
        C::Jailbreak,
        High,
        0.9,
        "Unrestricted mode request",
    ),
    regex(
        "pretend_unrestricted",
        r"(?i)(pretend|act|behave)\s+(you\s+)?(are|as\s+if|like)\s+(you\s+)?(are\s+)?(a|an|the)?\s*(unrestricted|unfiltered|evil)",
        C::Jailbreak,
        High,
        0.9,
        "Roleplay bypass",
    ),
    regex(
        "no_limits",
        r"(?i)\b(without|remove\s+(all\s+)?(your\s+)?)\s*(limits?|restrictions?|boundaries|constraints?|filters?)\b",
        C::Jailbreak,
        Medium,
        0.5,
        "No limits request",
    ),
    regex(
        "evil_mode",
        r"(?i)\b(evil|malicious|harmful)\s+(mode|assistant|ai)\b",
        C::Jailbreak,
        High,
        0.85,
        "Evil mode request",
    ),
];

/// SQL injection patterns
pub static SQL_PATTERNS: &[ThreatPattern] = &[
    regex(
        "sql_statement",
        r"(?i)\bselect\s+[\w\*,\s\.]+?\s+from\s+\w+",
        C::SqlInjection,
        Low,
        0.35,
        "Plain SQL query text (common in benign prompts)",
    ),
    regex(
        "sql_tautology",
        r"(?i)('|\b)\s*or\s+'?(\d+|[a-z])'?\s*=\s*'?(\d+|[a-z])'?",
        C::SqlInjection,
        High,
        0.8,
        "Boolean tautology (OR 1=1)",
    ),
    regex(
        "sql_union_select",
        r"(?i)\bunion\s+(all\s+)?select\b",
        C::SqlInjection,
        High,
        0.85,
        "UNION-based injection",
    ),
    regex(
        "sql_stacked_destructive",
        r"(?i);\s*(drop|truncate|alter)\s+table\b|;\s*delete\s+from\b",
        C::SqlInjection,
        Critical,
        0.9,
        "Stacked destructive statement",
    ),
    regex(
        "sql_comment_terminator",
        r"'\s*;?\s*(--|#|/\*)",
        C::SqlInjection,
        Medium,
        0.6,
        "Quote followed by comment terminator",
    ),
    regex(
        "sql_time_based",
        r"(?i)\b(sleep|benchmark|pg_sleep|waitfor\s+delay)\s*\(?\s*'?\d",
        C::SqlInjection,
        High,
        0.75,
        "Time-based blind injection",
    ),
];

/// Cross-site scripting patterns
pub static XSS_PATTERNS: &[ThreatPattern] = &[
    regex(
        "script_tag",
        r"(?i)<\s*script\b",
        C::Xss,
        High,
        0.9,
        "Inline script tag",
    ),
    regex(
        "javascript_uri",
        r"(?i)javascript\s*:",
        C::Xss,
        High,
        0.8,
        "javascript: URI",
    ),
    regex(
        "event_handler",
        r"(?i)<[^>]{0,200}\bon(error|load|click|mouseover|focus|submit)\s*=",
        C::Xss,
        High,
        0.85,
        "Inline DOM event handler",
    ),
    regex(
        "embedded_frame",
        r"(?i)<\s*(iframe|object|embed)\b",
        C::Xss,
        Medium,
        0.6,
        "Embedded frame/object",
    ),
];

/// Code execution patterns
pub static CODE_EXEC_PATTERNS: &[ThreatPattern] = &[
    regex(
        "eval_call",
        r"(?i)\b(eval|exec)\s*\(",
        C::CodeExecution,
        High,
        0.7,
        "Dynamic evaluation call",
    ),
    regex(
        "process_spawn",
        r"(?i)\b(os\.system|os\.popen|subprocess\.(run|call|popen|check_output)|child_process|runtime\.getruntime\(\)\.exec)",
        C::CodeExecution,
        High,
        0.85,
        "Process spawning API",
    ),
    regex(
        "pipe_to_shell",
        r"(?i)\b(curl|wget)\s+[^|\n]{0,200}\|\s*(ba|z|da)?sh\b",
        C::CodeExecution,
        Critical,
        0.95,
        "Download piped into a shell",
    ),
    regex(
        "recursive_delete",
        r"(?i)\brm\s+-(rf|fr)\s+(/|~)",
        C::CodeExecution,
        Critical,
        0.9,
        "Recursive delete of root/home",
    ),
    regex(
        "python_import_hook",
        r"__import__\s*\(",
        C::CodeExecution,
        High,
        0.85,
        "Python dynamic import",
    ),
    regex(
        "command_substitution",
        r"\$\([^)\n]{1,200}\)",
        C::CodeExecution,
        Medium,
        0.5,
        "Shell command substitution",
    ),
];

/// Data exfiltration patterns
pub static EXFIL_PATTERNS: &[ThreatPattern] = &[
    regex(
        "env_access",
        r"(?i)(process\.env|os\.environ|\bgetenv\s*\()",
        C::DataExfiltration,
        High,
        0.8,
        "Environment variable access",
    ),
    regex(
        "file_read",
        r"(?i)\b(read|cat|type|open)\s+(/etc/passwd|/etc/shadow|~?/?\.env\b|\.ssh/id_rsa|credentials)",
        C::DataExfiltration,
        High,
        0.9,
        "Sensitive file read attempt",
    ),
    regex(
        "send_to_url",
        r"(?i)\b(send|post|upload|forward|exfiltrate|transmit)\s+.{0,60}\bto\s+https?://",
        C::DataExfiltration,
        High,
        0.8,
        "Instruction to ship data to a URL",
    ),
    regex(
        "markdown_image_beacon",
        r"!\[[^\]]*\]\(https?://[^)\s]*\?[^)\s]*=",
        C::DataExfiltration,
        Medium,
        0.6,
        "Markdown image with query-string beacon",
    ),
];

/// PII and secret patterns
pub static PII_PATTERNS: &[ThreatPattern] = &[
    regex(
        "email_address",
        r"(?i)\b[a-z0-9._%+-]+@[a-z0-9.-]+\.[a-z]{2,}\b",
        C::Pii,
        Low,
        0.5,
        "Email address",
    ),
    regex(
        "us_ssn",
        r"\b\d{3}-\d{2}-\d{4}\b",
        C::Pii,
        High,
        0.7,
        "US social security number format",
    ),
    ThreatPattern {
        name: "payment_card",
        matcher: PatternMatcher::PaymentCard,
        category: C::Pii,
        severity: High,
        weight: 0.85,
        description: "Luhn-valid payment card number",
        raw: false,
    },
    regex(
        "api_key",
        r"\b(sk-[A-Za-z0-9_-]{20,}|AKIA[0-9A-Z]{16}|ghp_[A-Za-z0-9]{36}|xox[baprs]-[A-Za-z0-9-]{10,})",
        C::Pii,
        High,
        0.9,
        "Vendor API key",
    ),
    regex(
        "private_key_block",
        r"-----BEGIN ((RSA|EC|DSA|OPENSSH) )?PRIVATE KEY-----",
        C::Pii,
        Critical,
        0.99,
        "PEM private key",
    ),
    ThreatPattern {
        name: "high_entropy_token",
        matcher: PatternMatcher::Entropy {
            min_len: 24,
            min_bits: 4.0,
        },
        category: C::Pii,
        severity: Medium,
        weight: 0.35,
        description: "High-entropy token (possible secret, noisy)",
        raw: false,
    },
];

/// Obfuscation patterns. These see the raw bytes, before normalization strips
/// the characters they look for.
pub static OBFUSCATION_PATTERNS: &[ThreatPattern] = &[
    ThreatPattern {
        name: "null_bytes",
        matcher: PatternMatcher::Regex(r"(?-u:\x00)|\\u0000"),
        category: C::Obfuscation,
        severity: High,
        weight: 0.9,
        description: "Null byte injection",
        raw: true,
    },
    ThreatPattern {
        name: "invisible_characters",
        matcher: PatternMatcher::Regex(r"(?-u:\xE2\x80[\x8B-\x8F\xAA-\xAE]|\xE2\x81[\xA0-\xA4\xA6-\xA9])"),
        category: C::Obfuscation,
        severity: Medium,
        weight: 0.6,
        description: "Zero-width or bidi override characters",
        raw: true,
    },
    ThreatPattern {
        name: "escaped_invisible_characters",
        matcher: PatternMatcher::Regex(r"(?i)\\u(200[b-f]|202[a-e]|206[0-9])"),
        category: C::Obfuscation,
        severity: Medium,
        weight: 0.6,
        description: "Escaped zero-width or bidi override characters",
        raw: true,
    },
    ThreatPattern {
        name: "excessive_nesting",
        matcher: PatternMatcher::Regex(r"\{\s*\{\s*\{\s*\{\s*\{"),
        category: C::Obfuscation,
        severity: Medium,
        weight: 0.5,
        description: "Excessive JSON nesting",
        raw: true,
    },
];

/// Staging language that sets up a later step
pub static MULTI_STAGE_PATTERNS: &[ThreatPattern] = &[
    regex(
        "deferred_instruction",
        r"(?i)\b(in|for)\s+(your|the)\s+next\s+(response|reply|message|turn)\b",
        C::MultiStageIndicator,
        Medium,
        0.5,
        "Instruction deferred to a later turn",
    ),
    regex(
        "conditional_followup",
        r"(?i)\b(once|after)\s+(you('ve|\s+have)?|that('s|\s+is)?)\s+(done|finished|completed?|confirmed)\b",
        C::MultiStageIndicator,
        Medium,
        0.45,
        "Follow-up gated on completion",
    ),
    regex(
        "numbered_attack_step",
        r"(?i)\bstep\s+[1-9]\s*[:.)]\s*.{0,80}\b(ignore|bypass|disable|exfiltrate|execute)\b",
        C::MultiStageIndicator,
        Medium,
        0.6,
        "Numbered step carrying an attack verb",
    ),
    regex(
        "chained_action",
        r"(?i)\bthen\s+(execute|run|send|forward|output)\s+(it|this|that|the\s+results?)\b",
        C::MultiStageIndicator,
        Medium,
        0.55,
        "Chained action on prior output",
    ),
];

/// All built-in pattern tables
pub fn builtin_patterns() -> impl Iterator<Item = &'static ThreatPattern> {
    INJECTION_PATTERNS
        .iter()
        .chain(JAILBREAK_PATTERNS)
        .chain(SQL_PATTERNS)
        .chain(XSS_PATTERNS)
        .chain(CODE_EXEC_PATTERNS)
        .chain(EXFIL_PATTERNS)
        .chain(PII_PATTERNS)
        .chain(OBFUSCATION_PATTERNS)
        .chain(MULTI_STAGE_PATTERNS)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_weights_in_range() {
        for pattern in builtin_patterns() {
            assert!(
                pattern.weight > 0.0 && pattern.weight <= 1.0,
                "{} has weight {}",
                pattern.name,
                pattern.weight
            );
        }
    }

    #[test]
    fn test_unique_names() {
        let mut names: Vec<_> = builtin_patterns().map(|p| p.name).collect();
        let total = names.len();
        names.sort_unstable();
        names.dedup();
        assert_eq!(names.len(), total);
    }

    #[test]
    fn test_no_builtin_emits_synthetic_category() {
        assert!(builtin_patterns().all(|p| p.category != ThreatCategory::MultiStageAttack));
    }

    #[test]
    fn test_severity_order() {
        assert!(Severity::Low < Severity::Medium);
        assert!(Severity::High < Severity::Critical);
    }
}
