//! Join credential generation, reuse and validation.
//!
//! A bundle is the bootstrap token, the certificate-encryption key and the
//! CA certificate hash. All three must be present and well-formed before
//! any join is attempted. The primary's credential record is the durable
//! copy: a re-run reuses it while it is comfortably inside its validity
//! window and regenerates it otherwise.

use std::fmt;
use std::time::Duration;

use jiff::{SignedDuration, Timestamp};
use rand::Rng;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::agent::{AgentError, NodeAgent};
use crate::bootstrap::error::{Error, Result};
use crate::inventory::{CredentialSettings, Node};
use crate::retry::{RetryPolicy, retry_with_backoff};

/// kubeadm deletes uploaded certificates after two hours.
pub const CERTIFICATE_KEY_LIFETIME: Duration = Duration::from_secs(2 * 60 * 60);

const TOKEN_ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";

/// A string that never appears in `Debug` output.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// The cleartext value. Only pass it to a remote command, never to a log.
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(<redacted>)")
    }
}

/// Credential record persisted on the primary.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredCredentials {
    pub join_token: Secret,
    pub certificate_key: Secret,
    pub expires_at: Timestamp,
}

impl StoredCredentials {
    pub fn is_well_formed(&self) -> bool {
        is_valid_join_token(self.join_token.expose())
            && is_valid_certificate_key(self.certificate_key.expose())
    }

    /// Still valid `margin` from now.
    pub fn valid_for(&self, now: Timestamp, margin: Duration) -> bool {
        match offset(now, margin) {
            Some(deadline) => deadline < self.expires_at,
            None => false,
        }
    }
}

/// Complete join material handed to every join.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CredentialBundle {
    pub join_token: Secret,
    pub cert_encryption_key: Secret,
    pub ca_cert_hash: String,
    pub expires_at: Timestamp,
}

impl CredentialBundle {
    /// Fail closed unless all three parts are present and well-formed.
    pub fn validate(&self) -> Result<()> {
        if !is_valid_join_token(self.join_token.expose()) {
            return Err(Error::Credential("join token is missing or malformed".into()));
        }
        if !is_valid_certificate_key(self.cert_encryption_key.expose()) {
            return Err(Error::Credential(
                "certificate key is missing or malformed".into(),
            ));
        }
        if !is_valid_ca_cert_hash(&self.ca_cert_hash) {
            return Err(Error::Credential(format!(
                "CA certificate hash {:?} is missing or malformed",
                self.ca_cert_hash
            )));
        }
        Ok(())
    }

    /// Whether the bundle can still be used at `now`.
    pub fn is_expired(&self, now: Timestamp) -> bool {
        self.expires_at <= now
    }
}

/// Where the bundle of this run came from.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CredentialSource {
    /// Freshly generated for primary initialization or a missing record.
    Generated,
    /// Existing record inside its validity window.
    Reused,
    /// Existing record was expired or malformed and got replaced.
    Regenerated,
}

impl fmt::Display for CredentialSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CredentialSource::Generated => write!(f, "generated"),
            CredentialSource::Reused => write!(f, "reused"),
            CredentialSource::Regenerated => write!(f, "regenerated"),
        }
    }
}

enum StoredRecord {
    Missing,
    Unreadable,
    Found(StoredCredentials),
}

/// Produces the credential bundle of a run.
#[derive(Clone, Debug)]
pub struct CredentialBroker {
    settings: CredentialSettings,
}

impl CredentialBroker {
    pub fn new(settings: CredentialSettings) -> Self {
        Self { settings }
    }

    /// Token lifetime, capped at the certificate-key lifetime.
    pub fn token_ttl(&self) -> Duration {
        Duration::from_secs(self.settings.token_ttl_secs).min(CERTIFICATE_KEY_LIFETIME)
    }

    pub fn renewal_margin(&self) -> Duration {
        Duration::from_secs(self.settings.renewal_margin_secs)
    }

    /// Fresh token and certificate key valid for [`Self::token_ttl`].
    pub fn generate(&self, now: Timestamp) -> Result<StoredCredentials> {
        let expires_at = offset(now, self.token_ttl())
            .ok_or_else(|| Error::Credential("credential expiry overflows".into()))?;
        Ok(StoredCredentials {
            join_token: Secret::new(generate_join_token()),
            certificate_key: Secret::new(generate_certificate_key()),
            expires_at,
        })
    }

    /// Pair a stored record with the CA hash read back from the primary.
    pub async fn complete(
        &self,
        agent: &dyn NodeAgent,
        primary: &Node,
        stored: &StoredCredentials,
        retry: &RetryPolicy,
    ) -> Result<CredentialBundle> {
        let ca_cert_hash = retry_with_backoff(retry, "read_ca_cert_hash", || {
            agent.ca_cert_hash(primary)
        })
        .await
        .map_err(|e| Error::Credential(format!("reading CA hash from {}: {e}", primary.id)))?;

        let bundle = CredentialBundle {
            join_token: stored.join_token.clone(),
            cert_encryption_key: stored.certificate_key.clone(),
            ca_cert_hash: ca_cert_hash.trim().to_string(),
            expires_at: stored.expires_at,
        };
        bundle.validate()?;
        Ok(bundle)
    }

    /// Obtain join material from an initialized primary.
    ///
    /// Reuses the stored record while it stays valid for the renewal
    /// margin. An expired or malformed record is replaced with a warning.
    pub async fn obtain(
        &self,
        agent: &dyn NodeAgent,
        primary: &Node,
        retry: &RetryPolicy,
    ) -> Result<(CredentialBundle, CredentialSource)> {
        self.obtain_at(agent, primary, retry, Timestamp::now()).await
    }

    /// [`Self::obtain`] with an explicit clock.
    pub async fn obtain_at(
        &self,
        agent: &dyn NodeAgent,
        primary: &Node,
        retry: &RetryPolicy,
        now: Timestamp,
    ) -> Result<(CredentialBundle, CredentialSource)> {
        let existing = match retry_with_backoff(retry, "read_credentials", || {
            agent.read_credentials(primary)
        })
        .await
        {
            Ok(Some(record)) => StoredRecord::Found(record),
            Ok(None) => StoredRecord::Missing,
            Err(AgentError::Parse(e)) => {
                warn!(node = %primary.id, error = %e, "Stored credential record is unreadable");
                StoredRecord::Unreadable
            }
            Err(e) => {
                return Err(Error::Credential(format!(
                    "reading stored credentials from {}: {e}",
                    primary.id
                )));
            }
        };

        let (stored, source) = match existing {
            StoredRecord::Found(record)
                if record.is_well_formed() && record.valid_for(now, self.renewal_margin()) =>
            {
                info!(
                    node = %primary.id,
                    expires_at = %record.expires_at,
                    "Reusing stored join credentials"
                );
                (record, CredentialSource::Reused)
            }
            StoredRecord::Found(record) => {
                if record.is_well_formed() {
                    warn!(
                        node = %primary.id,
                        expires_at = %record.expires_at,
                        "Stored join credentials expire within the renewal margin, regenerating"
                    );
                } else {
                    warn!(node = %primary.id, "Stored join credentials are malformed, regenerating");
                }
                let fresh = self.generate(now)?;
                self.publish(agent, primary, &fresh, retry).await?;
                (fresh, CredentialSource::Regenerated)
            }
            StoredRecord::Unreadable => {
                warn!(node = %primary.id, "Replacing unreadable credential record");
                let fresh = self.generate(now)?;
                self.publish(agent, primary, &fresh, retry).await?;
                (fresh, CredentialSource::Regenerated)
            }
            StoredRecord::Missing => {
                info!(node = %primary.id, "No stored join credentials, generating");
                let fresh = self.generate(now)?;
                self.publish(agent, primary, &fresh, retry).await?;
                (fresh, CredentialSource::Generated)
            }
        };

        let bundle = self.complete(agent, primary, &stored, retry).await?;
        Ok((bundle, source))
    }

    async fn publish(
        &self,
        agent: &dyn NodeAgent,
        primary: &Node,
        credentials: &StoredCredentials,
        retry: &RetryPolicy,
    ) -> Result<()> {
        let ttl = self.token_ttl();
        retry_with_backoff(retry, "publish_credentials", || {
            agent.publish_credentials(primary, credentials, ttl)
        })
        .await
        .map_err(|e| Error::Credential(format!("publishing credentials on {}: {e}", primary.id)))
    }
}

/// Random token in kubeadm's `[a-z0-9]{6}.[a-z0-9]{16}` format.
pub fn generate_join_token() -> String {
    let mut rng = rand::thread_rng();
    let mut part = |len: usize| -> String {
        (0..len)
            .map(|_| {
                let idx = rng.gen_range(0..TOKEN_ALPHABET.len());
                TOKEN_ALPHABET.get(idx).copied().map(char::from).unwrap_or('0')
            })
            .collect()
    };
    let id = part(6);
    let secret = part(16);
    format!("{id}.{secret}")
}

/// 32 random bytes, hex encoded.
pub fn generate_certificate_key() -> String {
    let bytes: [u8; 32] = rand::thread_rng().r#gen();
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

pub fn is_valid_join_token(token: &str) -> bool {
    matches_pattern(r"^[a-z0-9]{6}\.[a-z0-9]{16}$", token)
}

pub fn is_valid_certificate_key(key: &str) -> bool {
    matches_pattern(r"^[a-f0-9]{64}$", key)
}

pub fn is_valid_ca_cert_hash(hash: &str) -> bool {
    matches_pattern(r"^sha256:[a-f0-9]{64}$", hash)
}

fn matches_pattern(pattern: &str, value: &str) -> bool {
    Regex::new(pattern)
        .map(|re| re.is_match(value))
        .unwrap_or(false)
}

fn offset(ts: Timestamp, by: Duration) -> Option<Timestamp> {
    let by = SignedDuration::try_from(by).ok()?;
    ts.checked_add(by).ok()
}
