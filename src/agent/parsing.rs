//! Parsing of remote command output.
//!
//! All functions here are pure, so the shapes of `kubeadm`, `openssl` and
//! credential-record output are tested without a node.

use regex::Regex;
use thiserror::Error;

use crate::bootstrap::credentials::StoredCredentials;

/// Errors that can occur during parsing.
#[derive(Error, Debug)]
pub enum ParseError {
    #[error("Failed to compile regex: {0}")]
    RegexCompilation(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Missing required field: {0}")]
    MissingField(String),
}

/// Parse the credential record stored on the primary.
///
/// Empty output means the record does not exist.
pub fn parse_credential_record(output: &str) -> Result<Option<StoredCredentials>, ParseError> {
    let trimmed = output.trim();
    if trimmed.is_empty() {
        return Ok(None);
    }
    serde_json::from_str(trimmed)
        .map(Some)
        .map_err(|e| ParseError::Parse(format!("credential record: {e}")))
}

/// Extract the CA public key hash from `openssl dgst -sha256 -hex` output.
///
/// Accepts both `(stdin)= <hex>` and `SHA2-256(stdin)= <hex>` forms and
/// returns it in kubeadm's `sha256:<hex>` form.
///
/// # Example
/// ```
/// use ha_bootstrap::agent::parsing::parse_ca_cert_hash;
///
/// let out = "SHA2-256(stdin)= 0a1b2c3d4e5f60718293a4b5c6d7e8f90a1b2c3d4e5f60718293a4b5c6d7e8f9\n";
/// let hash = parse_ca_cert_hash(out).unwrap();
/// assert!(hash.starts_with("sha256:0a1b"));
/// ```
pub fn parse_ca_cert_hash(output: &str) -> Result<String, ParseError> {
    let re = Regex::new(r"(?m)(?:=\s*|^\s*|sha256:)([a-fA-F0-9]{64})\s*$")
        .map_err(|e| ParseError::RegexCompilation(e.to_string()))?;

    re.captures(output)
        .and_then(|caps| caps.get(1))
        .map(|m| format!("sha256:{}", m.as_str().to_ascii_lowercase()))
        .ok_or_else(|| ParseError::MissingField("sha256 digest".to_string()))
}

/// Interpret the output of the membership probe.
pub fn parse_membership(output: &str) -> Result<bool, ParseError> {
    match output.trim() {
        "member" => Ok(true),
        "absent" => Ok(false),
        other => Err(ParseError::Parse(format!(
            "unexpected membership probe output {other:?}"
        ))),
    }
}

/// Replace every secret occurrence in a command line before it is logged.
pub fn redact(command: &str, secrets: &[&str]) -> String {
    secrets
        .iter()
        .filter(|s| !s.is_empty())
        .fold(command.to_string(), |acc, secret| {
            acc.replace(secret, "<redacted>")
        })
}

/// Pull the most useful line out of a failed `kubeadm` run.
///
/// kubeadm prints `error execution phase ...` or `[ERROR ...]` preflight
/// lines; fall back to the last non-empty line.
pub fn kubeadm_failure_summary(stderr: &str) -> String {
    let interesting = stderr.lines().map(str::trim).find(|line| {
        line.starts_with("error execution phase") || line.starts_with("[ERROR")
    });
    interesting
        .or_else(|| stderr.lines().map(str::trim).rfind(|l| !l.is_empty()))
        .unwrap_or("")
        .to_string()
}
