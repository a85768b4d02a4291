//! HMAC-based agent bearer tokens (C1, §4.1).
//!
//! A token is minted once per agent and handed to the operator as part of
//! the install command (§6.4). The control plane never stores the token
//! itself, only a SHA-256 hash of it, so a leaked database dump cannot be
//! replayed as a bearer credential.

use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

use crate::ids::short_id::ShortId;

type HmacSha256 = Hmac<Sha256>;

const NONCE_LEN: usize = 16;

/// A freshly minted agent token, in both its presentable form and the hash
/// that should be persisted by the repository layer.
#[derive(Debug, Clone)]
pub struct AgentToken {
    /// The full bearer string, e.g. `fwd_fa_8Jk3mQp2Wz1_7h3x...`. Shown to
    /// the operator exactly once.
    pub token: String,
    /// SHA-256 hex digest of `token`, safe to persist.
    pub token_hash: String,
}

impl AgentToken {
    /// Mints a new token bound to `agent_id`, signed with `server_secret`.
    pub fn generate(agent_id: &ShortId, server_secret: &[u8]) -> Self {
        let mut nonce = [0u8; NONCE_LEN];
        rand::rng().fill_bytes(&mut nonce);
        Self::generate_with_nonce(agent_id, server_secret, &nonce)
    }

    fn generate_with_nonce(agent_id: &ShortId, server_secret: &[u8], nonce: &[u8]) -> Self {
        let signature = sign(agent_id, server_secret, nonce);
        let body = bs58::encode(nonce.iter().chain(signature.iter()).copied().collect::<Vec<_>>())
            .into_string();
        let token = format!("fwd_{agent_id}_{body}");
        let token_hash = hash_token(&token);
        Self { token, token_hash }
    }

    /// Verifies a presented bearer token against the agent it claims to
    /// belong to. Constant-time over the HMAC comparison so a timing
    /// side-channel can't leak partial matches.
    pub fn verify(token: &str, agent_id: &ShortId, server_secret: &[u8]) -> bool {
        let Some(rest) = token.strip_prefix("fwd_") else {
            return false;
        };
        let expected_prefix = format!("{agent_id}_");
        let Some(body) = rest.strip_prefix(expected_prefix.as_str()) else {
            return false;
        };
        let Ok(decoded) = bs58::decode(body).into_vec() else {
            return false;
        };
        if decoded.len() <= NONCE_LEN {
            return false;
        }
        let (nonce, signature) = decoded.split_at(NONCE_LEN);
        let expected = sign(agent_id, server_secret, nonce);
        expected.ct_eq(signature).into()
    }
}

/// Extracts the short ID a bearer token claims to belong to, without
/// verifying the signature. Callers must still call [`AgentToken::verify`]
/// against the looked-up agent before trusting the claim.
pub fn parse_claimed_agent_id(token: &str) -> Option<ShortId> {
    let rest = token.strip_prefix("fwd_")?;
    let mut parts = rest.splitn(3, '_');
    let prefix = parts.next()?;
    let body = parts.next()?;
    parts.next()?;
    format!("{prefix}_{body}").parse().ok()
}

/// SHA-256 hex digest of a token, suitable for persistence/lookup.
pub fn hash_token(token: &str) -> String {
    let digest = Sha256::digest(token.as_bytes());
    hex::encode(digest)
}

fn sign(agent_id: &ShortId, server_secret: &[u8], nonce: &[u8]) -> Vec<u8> {
    let mut mac = HmacSha256::new_from_slice(server_secret).expect("HMAC accepts any key length");
    mac.update(agent_id.to_string().as_bytes());
    mac.update(nonce);
    mac.finalize().into_bytes().to_vec()
}

/// Builds the one-line install command shown to the operator after minting
/// or regenerating a token (§6.4).
pub fn install_command(control_plane_url: &str, token: &str) -> String {
    format!(
        "curl -fsSL {control_plane_url}/install.sh | sh -s -- --token {token}"
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::short_id::Prefix;

    fn agent_id() -> ShortId {
        ShortId::generate_with(Prefix::Agent, {
            let mut i = 0usize;
            move || {
                i += 1;
                i
            }
        })
    }

    #[test]
    fn generated_token_verifies_against_its_own_agent() {
        let id = agent_id();
        let secret = b"server-secret";
        let minted = AgentToken::generate(&id, secret);
        assert!(AgentToken::verify(&minted.token, &id, secret));
    }

    #[test]
    fn token_does_not_verify_against_a_different_agent() {
        let id = agent_id();
        let other = agent_id();
        let secret = b"server-secret";
        let minted = AgentToken::generate(&id, secret);
        assert!(!AgentToken::verify(&minted.token, &other, secret));
    }

    #[test]
    fn token_does_not_verify_with_wrong_secret() {
        let id = agent_id();
        let minted = AgentToken::generate(&id, b"server-secret");
        assert!(!AgentToken::verify(&minted.token, &id, b"wrong-secret"));
    }

    #[test]
    fn token_hash_is_deterministic_for_same_input() {
        assert_eq!(hash_token("abc"), hash_token("abc"));
        assert_ne!(hash_token("abc"), hash_token("abd"));
    }

    #[test]
    fn two_mints_for_the_same_agent_never_collide() {
        let id = agent_id();
        let secret = b"server-secret";
        let a = AgentToken::generate(&id, secret);
        let b = AgentToken::generate(&id, secret);
        assert_ne!(a.token, b.token);
    }

    #[test]
    fn install_command_embeds_the_token_verbatim() {
        let cmd = install_command("https://cp.example.com", "fwd_fa_x_y");
        assert!(cmd.contains("fwd_fa_x_y"));
        assert!(cmd.starts_with("curl"));
    }

    #[test]
    fn parses_the_claimed_agent_id_without_verifying_signature() {
        let id = agent_id();
        let minted = AgentToken::generate(&id, b"secret");
        let claimed = parse_claimed_agent_id(&minted.token).unwrap();
        assert_eq!(claimed, id);
    }

    #[test]
    fn parse_claimed_agent_id_rejects_malformed_input() {
        assert!(parse_claimed_agent_id("garbage").is_none());
        assert!(parse_claimed_agent_id("fwd_fa_onlyonepart").is_none());
    }

    #[test]
    fn malformed_tokens_are_rejected_without_panicking() {
        let id = agent_id();
        let secret = b"server-secret";
        assert!(!AgentToken::verify("not-a-token", &id, secret));
        assert!(!AgentToken::verify("fwd_fa_wrongbody_", &id, secret));
        assert!(!AgentToken::verify("", &id, secret));
    }
}
