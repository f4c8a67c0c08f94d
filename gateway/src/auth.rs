//! Signed-event authorization (Blossom BUD-01).
//!
//! Clients authenticate with `Authorization: Nostr <base64(event-json)>`
//! where the event is a kind-24242 Nostr event carrying a `t` tag naming the
//! verb, an `expiration` tag, and (for blob-addressed operations) an `x` tag
//! naming the digest. Validation order: scheme, base64, JSON, kind, pubkey
//! format, signature against the canonical event hash, `t` tag, expiration,
//! allow-list.
//!
//! An empty allow-list disables authentication globally; handlers check
//! [`Verifier::enabled`] and skip verification entirely in that case.

use crate::error::{GatewayError, Result};
use crate::now_secs;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use secp256k1::schnorr::Signature;
use secp256k1::{Message, Secp256k1, VerifyOnly, XOnlyPublicKey};
use serde::Deserialize;
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use tracing::{debug, warn};

/// Nostr event kind reserved for Blossom authorization events
pub const AUTH_EVENT_KIND: u32 = 24242;

/// Verbs an authorization event can grant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verb {
    Upload,
    List,
    Delete,
}

impl Verb {
    pub fn as_str(&self) -> &'static str {
        match self {
            Verb::Upload => "upload",
            Verb::List => "list",
            Verb::Delete => "delete",
        }
    }
}

/// A decoded authorization event. Read-only after parsing.
#[derive(Debug, Clone, Deserialize)]
pub struct AuthEvent {
    pub id: String,
    pub pubkey: String,
    pub created_at: u64,
    pub kind: u32,
    pub tags: Vec<Vec<String>>,
    #[serde(default)]
    pub content: String,
    pub sig: String,
}

impl AuthEvent {
    /// First value of the named tag, if present.
    pub fn tag_value(&self, name: &str) -> Option<&str> {
        self.tags
            .iter()
            .find(|tag| tag.len() >= 2 && tag[0] == name)
            .map(|tag| tag[1].as_str())
    }

    /// Parsed `expiration` tag (unix seconds).
    pub fn expiration(&self) -> Option<u64> {
        self.tag_value("expiration")?.parse().ok()
    }

    /// Require an `x` tag equal to `digest`. Blob-addressed operations
    /// (upload, mirror, delete) must name the digest they operate on.
    pub fn require_x_tag(&self, digest: &str) -> Result<()> {
        let mut found_any = false;
        for tag in &self.tags {
            if tag.len() >= 2 && tag[0] == "x" {
                found_any = true;
                if tag[1].eq_ignore_ascii_case(digest) {
                    return Ok(());
                }
            }
        }
        if found_any {
            Err(GatewayError::AuthMalformed(format!(
                "x tag does not match blob hash {digest}"
            )))
        } else {
            Err(GatewayError::AuthMalformed(
                "missing x tag for blob operation".to_string(),
            ))
        }
    }

    /// Canonical NIP-01 event hash:
    /// sha256 of `[0, pubkey, created_at, kind, tags, content]`.
    fn canonical_hash(&self) -> [u8; 32] {
        let serialized = serde_json::json!([
            0,
            self.pubkey,
            self.created_at,
            self.kind,
            self.tags,
            self.content,
        ]);
        let mut hasher = Sha256::new();
        hasher.update(serialized.to_string().as_bytes());
        hasher.finalize().into()
    }
}

/// Parse `Authorization: Nostr <base64-encoded-event-json>`.
pub fn parse_authorization_header(header: &str) -> Result<AuthEvent> {
    let (scheme, token) = header
        .split_once(' ')
        .ok_or_else(|| GatewayError::AuthMalformed("authorization header must use Nostr scheme".to_string()))?;
    if !scheme.eq_ignore_ascii_case("nostr") {
        return Err(GatewayError::AuthMalformed(
            "authorization header must use Nostr scheme".to_string(),
        ));
    }

    let event_json = BASE64.decode(token.trim()).map_err(|_| {
        GatewayError::AuthMalformed("failed to decode base64 authorization token".to_string())
    })?;

    serde_json::from_slice(&event_json).map_err(|_| {
        GatewayError::AuthMalformed("failed to parse authorization event".to_string())
    })
}

/// Normalise a pubkey (hex or bech32 `npub…`) to lowercase 64-char hex.
pub fn normalize_pubkey(input: &str) -> anyhow::Result<String> {
    let input = input.trim();

    if input
        .get(..4)
        .is_some_and(|prefix| prefix.eq_ignore_ascii_case("npub"))
    {
        let (hrp, data) =
            bech32::decode(input).map_err(|e| anyhow::anyhow!("failed to decode npub: {e}"))?;
        if !hrp.as_str().eq_ignore_ascii_case("npub") {
            anyhow::bail!("decoded prefix is not npub: {}", hrp.as_str());
        }
        if data.len() != 32 {
            anyhow::bail!("decoded pubkey has wrong length: {} (expected 32)", data.len());
        }
        return Ok(hex::encode(data));
    }

    if input.len() != 64 {
        anyhow::bail!("hex pubkey has wrong length: {} (expected 64)", input.len());
    }
    hex::decode(input).map_err(|e| anyhow::anyhow!("pubkey is not valid hex: {e}"))?;
    Ok(input.to_lowercase())
}

/// Validates authorization events against the configured allow-list.
pub struct Verifier {
    secp: Secp256k1<VerifyOnly>,
    /// Lowercase hex pubkeys. Empty means authentication is disabled.
    allowed: HashSet<String>,
}

impl Verifier {
    pub fn new(allowed_pubkeys: &[String]) -> Self {
        let mut allowed = HashSet::new();
        for pubkey in allowed_pubkeys {
            match normalize_pubkey(pubkey) {
                Ok(normalized) => {
                    allowed.insert(normalized);
                }
                Err(error) => {
                    warn!(pubkey = %pubkey, error = %error, "Invalid pubkey in allowed_pubkeys configuration");
                }
            }
        }
        Self {
            secp: Secp256k1::verification_only(),
            allowed,
        }
    }

    /// Whether authentication is active at all.
    pub fn enabled(&self) -> bool {
        !self.allowed.is_empty()
    }

    /// Validate the Authorization header for a request requiring `verb`.
    pub fn verify(&self, header: Option<&str>, verb: Verb) -> Result<AuthEvent> {
        let header = header.ok_or(GatewayError::AuthMissing)?;
        let event = parse_authorization_header(header)?;
        self.validate(&event, verb)?;
        debug!(pubkey = %event.pubkey, verb = verb.as_str(), "Authorized request");
        Ok(event)
    }

    fn validate(&self, event: &AuthEvent, verb: Verb) -> Result<()> {
        if event.kind != AUTH_EVENT_KIND {
            return Err(GatewayError::AuthMalformed(format!(
                "invalid event kind: expected {AUTH_EVENT_KIND}, got {}",
                event.kind
            )));
        }

        if event.pubkey.len() != 64 || hex::decode(&event.pubkey).is_err() {
            return Err(GatewayError::AuthMalformed(
                "invalid pubkey format: must be 64 hex characters".to_string(),
            ));
        }

        self.check_signature(event)?;

        match event.tag_value("t") {
            Some(t) if t == verb.as_str() => {}
            Some(t) => {
                return Err(GatewayError::AuthMalformed(format!(
                    "event t tag is {t:?}, expected {:?}",
                    verb.as_str()
                )));
            }
            None => {
                return Err(GatewayError::AuthMalformed(
                    "missing t tag".to_string(),
                ));
            }
        }

        match event.expiration() {
            Some(expiration) if expiration > now_secs() => {}
            Some(expiration) => {
                return Err(GatewayError::AuthExpired {
                    expired_at: expiration,
                });
            }
            None => {
                return Err(GatewayError::AuthMalformed(
                    "missing or invalid expiration tag".to_string(),
                ));
            }
        }

        if !self.allowed.is_empty() {
            let pubkey = event.pubkey.to_lowercase();
            if !self.allowed.contains(&pubkey) {
                return Err(GatewayError::AuthForbidden);
            }
        }

        Ok(())
    }

    fn check_signature(&self, event: &AuthEvent) -> Result<()> {
        let hash = event.canonical_hash();

        // The event id must be the canonical hash
        let claimed_id = hex::decode(&event.id)
            .map_err(|_| GatewayError::AuthMalformed("event id is not valid hex".to_string()))?;
        if claimed_id != hash {
            return Err(GatewayError::AuthMalformed(
                "event id does not match canonical hash".to_string(),
            ));
        }

        let pubkey_bytes = hex::decode(&event.pubkey)
            .map_err(|_| GatewayError::AuthMalformed("pubkey is not valid hex".to_string()))?;
        let pubkey = XOnlyPublicKey::from_slice(&pubkey_bytes)
            .map_err(|_| GatewayError::AuthMalformed("invalid pubkey".to_string()))?;

        let sig_bytes = hex::decode(&event.sig)
            .map_err(|_| GatewayError::AuthMalformed("signature is not valid hex".to_string()))?;
        let signature = Signature::from_slice(&sig_bytes)
            .map_err(|_| GatewayError::AuthMalformed("invalid signature format".to_string()))?;

        let message = Message::from_digest(hash);
        self.secp
            .verify_schnorr(&signature, &message, &pubkey)
            .map_err(|_| GatewayError::AuthMalformed("invalid signature".to_string()))
    }
}
