//! External similarity search through a child process.
//!
//! The process is started directly with an argument vector; no shell is ever
//! involved, so content-derived values cannot be interpreted as commands.
//! Every value is validated first and query text is passed as a single
//! `--text=<value>` argument so it can never be parsed as a separate flag.
//!
//! Invocation:
//!
//! ```text
//! <program> <args...> [--collection NAME] --k K --threshold T --fingerprint HEX --vector v1,v2,... [--text=TEXT]
//! ```
//!
//! Expected stdout: `{"matches": [{"id": "...", "score": 0.93, "category": "jailbreak", ...}]}`

use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, Instant};

use serde::Deserialize;
use tokio::process::Command;

use super::backend::{rank, BackendFuture, SimilarityBackend, SimilarityMatch, SimilarityQuery};
use crate::error::{Result, WardenError};

/// Stderr kept in error messages
const STDERR_SNIPPET: usize = 200;

/// `[A-Za-z0-9_.-]{1,64}`
fn is_valid_collection(name: &str) -> bool {
    (1..=64).contains(&name.len())
        && name
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'_' | b'.' | b'-'))
}

#[derive(Debug, Deserialize)]
struct Response {
    #[serde(default)]
    matches: Vec<SimilarityMatch>,
}

/// Backend that runs an external program per query
#[derive(Debug, Clone)]
pub struct ProcessBackend {
    program: PathBuf,
    args: Vec<String>,
    collection: Option<String>,
    pass_text: bool,
    max_text_bytes: usize,
    timeout: Duration,
}

impl ProcessBackend {
    /// Backend running `program`
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            collection: None,
            pass_text: false,
            max_text_bytes: 4096,
            timeout: Duration::from_millis(250),
        }
    }

    /// Fixed leading arguments
    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    /// Collection / index name
    pub fn with_collection(mut self, collection: impl Into<String>) -> Self {
        self.collection = Some(collection.into());
        self
    }

    /// Pass query text, truncated to `max_bytes` at a char boundary
    pub fn with_text(mut self, max_bytes: usize) -> Self {
        self.pass_text = true;
        self.max_text_bytes = max_bytes;
        self
    }

    /// Hard per-query timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Validate everything, then build the argument vector
    pub fn build_args(&self, query: &SimilarityQuery) -> Result<Vec<String>> {
        query.validate()?;

        let mut args = self.args.clone();

        if let Some(collection) = &self.collection {
            if !is_valid_collection(collection) {
                return Err(WardenError::InvalidQuery(format!(
                    "collection name must match [A-Za-z0-9_.-]{{1,64}}, got {collection:?}"
                )));
            }
            args.push("--collection".to_string());
            args.push(collection.clone());
        }

        args.push("--k".to_string());
        args.push(query.k.to_string());
        args.push("--threshold".to_string());
        args.push(query.threshold.to_string());
        args.push("--fingerprint".to_string());
        args.push(query.fingerprint.to_hex());
        args.push("--vector".to_string());
        args.push(
            query
                .vector
                .iter()
                .map(f32::to_string)
                .collect::<Vec<_>>()
                .join(","),
        );

        if self.pass_text {
            if let Some(text) = &query.text {
                if text.contains('\0') {
                    return Err(WardenError::InvalidQuery("query text contains NUL".to_string()));
                }
                let sent = truncate_to_boundary(text, self.max_text_bytes);
                if sent.len() < text.len() {
                    tracing::debug!(
                        fingerprint = %query.fingerprint.short(),
                        bytes = text.len(),
                        limit = self.max_text_bytes,
                        "query text truncated"
                    );
                }
                args.push(format!("--text={sent}"));
            }
        }

        Ok(args)
    }

    async fn run(&self, query: &SimilarityQuery) -> Result<Vec<SimilarityMatch>> {
        let args = self.build_args(query)?;
        let start = Instant::now();

        let mut cmd = Command::new(&self.program);
        cmd.args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let output = tokio::time::timeout(self.timeout, cmd.output())
            .await
            .map_err(|_| {
                WardenError::ExternalQuery(format!(
                    "{} timed out after {}ms",
                    self.program.display(),
                    self.timeout.as_millis()
                ))
            })?
            .map_err(|e| WardenError::ExternalQuery(format!("failed to run {}: {e}", self.program.display())))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let snippet: String = stderr.trim().chars().take(STDERR_SNIPPET).collect();
            return Err(WardenError::ExternalQuery(format!(
                "{} exited with {}: {snippet}",
                self.program.display(),
                output.status
            )));
        }

        let response: Response = serde_json::from_slice(&output.stdout)
            .map_err(|e| WardenError::ExternalQuery(format!("malformed response: {e}")))?;

        tracing::debug!(
            program = %self.program.display(),
            matches = response.matches.len(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "external similarity query finished"
        );

        Ok(rank(response.matches, query.k, query.threshold))
    }
}

/// Longest prefix of `text` within `max` bytes that ends on a char boundary
fn truncate_to_boundary(text: &str, max: usize) -> &str {
    if text.len() <= max {
        return text;
    }
    let mut end = max;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}

impl SimilarityBackend for ProcessBackend {
    fn name(&self) -> &str {
        "process"
    }

    fn query<'a>(&'a self, query: &'a SimilarityQuery) -> BackendFuture<'a> {
        Box::pin(self.run(query))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fingerprint::Fingerprint;

    fn query() -> SimilarityQuery {
        SimilarityQuery::new(Fingerprint::of(b"abc"), vec![0.5, -0.25], 3, 0.8)
    }

    #[test]
    fn test_args_are_discrete() {
        let backend = ProcessBackend::new("/usr/bin/search")
            .with_args(["--index", "threats"])
            .with_collection("prompts_v2")
            .with_text(128);
        let q = query().with_text("x; rm -rf / $(id) `id` --k 100");
        let args = backend.build_args(&q).unwrap();

        assert_eq!(&args[..4], &["--index", "threats", "--collection", "prompts_v2"]);
        assert!(args.contains(&"--vector".to_string()));
        assert!(args.contains(&"0.5,-0.25".to_string()));
        assert_eq!(args.last().unwrap(), "--text=x; rm -rf / $(id) `id` --k 100");
        assert_eq!(args.iter().filter(|a| a.as_str() == "--k").count(), 1);
    }

    #[test]
    fn test_text_omitted_unless_enabled() {
        let backend = ProcessBackend::new("search");
        let args = backend.build_args(&query().with_text("hello")).unwrap();
        assert!(!args.iter().any(|a| a.starts_with("--text")));
    }

    #[test]
    fn test_rejects_bad_collection() {
        let long = "a".repeat(65);
        for name in ["", "a b", "x;y", "../../etc", long.as_str()] {
            let backend = ProcessBackend::new("search").with_collection(name);
            let err = backend.build_args(&query()).unwrap_err();
            assert!(matches!(err, WardenError::InvalidQuery(_)), "{name:?}");
        }
        assert!(ProcessBackend::new("search")
            .with_collection("prompts-v2.1_a")
            .build_args(&query())
            .is_ok());
    }

    #[test]
    fn test_rejects_nul_in_text() {
        let backend = ProcessBackend::new("search").with_text(8);
        assert!(backend.build_args(&query().with_text("nul\0byte")).is_err());
        assert!(backend.build_args(&query().with_text("fine")).is_ok());
    }

    #[test]
    fn test_long_text_is_truncated_not_rejected() {
        let backend = ProcessBackend::new("search").with_text(8);
        let args = backend.build_args(&query().with_text("far too long")).unwrap();
        assert_eq!(args.last().unwrap(), "--text=far too ");

        // never split a multi-byte char: "é" is two bytes at offsets 7..9
        let args = backend.build_args(&query().with_text("abcdefgé tail")).unwrap();
        assert_eq!(args.last().unwrap(), "--text=abcdefg");
    }

    #[tokio::test]
    async fn test_missing_program_is_external_error() {
        let backend = ProcessBackend::new("/nonexistent/warden-search-binary");
        let err = backend.query(&query()).await.unwrap_err();
        assert!(matches!(err, WardenError::ExternalQuery(_)));
    }
}
