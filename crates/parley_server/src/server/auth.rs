#![forbid(unsafe_code)]

use std::sync::Arc;

use anyhow::{Context, anyhow};
use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use hmac::{Hmac, Mac};
use parley_domain::{Identity, UserId};
use parley_store::Store;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use tracing::warn;

use crate::server::error::OpError;
use crate::util::secret::SecretString;
use crate::util::time::unix_secs_now;

/// Claims carried by a `v1.<payload>.<sig>` connection token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthClaims {
	pub sub: String,
	pub exp: u64,
}

/// Verify token format, signature, and expiry.
pub fn verify_hmac_token(token: &str, secret: &str) -> anyhow::Result<AuthClaims> {
	let parts = token.split('.').collect::<Vec<_>>();
	if parts.len() != 3 || parts[0] != "v1" {
		return Err(anyhow!("invalid token format"));
	}

	let payload_b64 = parts[1];
	let sig_b64 = parts[2];

	let payload = URL_SAFE_NO_PAD.decode(payload_b64).context("decode token payload")?;
	let expected_sig = sign(payload_b64.as_bytes(), secret.as_bytes());
	let provided_sig = URL_SAFE_NO_PAD.decode(sig_b64).context("decode token signature")?;

	if !constant_time_eq(&expected_sig, &provided_sig) {
		return Err(anyhow!("invalid token signature"));
	}

	let claims: AuthClaims = serde_json::from_slice(&payload).context("parse token claims")?;
	if claims.exp <= unix_secs_now() {
		return Err(anyhow!("token expired"));
	}

	Ok(claims)
}

/// Mint a signed token for `sub`, valid for `ttl_secs`. Dev/test helper;
/// token issuance proper belongs to the surrounding application.
pub fn mint_token(sub: &str, ttl_secs: u64, secret: &str) -> String {
	let claims = AuthClaims {
		sub: sub.to_string(),
		exp: unix_secs_now().saturating_add(ttl_secs),
	};
	let payload = serde_json::to_vec(&claims).unwrap_or_default();
	let payload_b64 = URL_SAFE_NO_PAD.encode(payload);
	let sig_b64 = URL_SAFE_NO_PAD.encode(sign(payload_b64.as_bytes(), secret.as_bytes()));
	format!("v1.{payload_b64}.{sig_b64}")
}

fn sign(payload_b64: &[u8], secret: &[u8]) -> Vec<u8> {
	let mut mac = Hmac::<Sha256>::new_from_slice(secret).expect("hmac key");
	mac.update(payload_b64);
	mac.finalize().into_bytes().to_vec()
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
	if a.len() != b.len() {
		return false;
	}

	let mut diff = 0u8;
	for (x, y) in a.iter().zip(b.iter()) {
		diff |= x ^ y;
	}

	diff == 0
}

/// Resolves an inbound credential to a durable identity, exactly once
/// per physical connection.
#[derive(Clone)]
pub struct Authenticator {
	secret: SecretString,
	store: Arc<dyn Store>,
}

impl Authenticator {
	pub fn new(secret: SecretString, store: Arc<dyn Store>) -> Self {
		Self { secret, store }
	}

	/// Verify the credential and resolve the user it names. Any failure
	/// here must terminate the connection before other handlers run.
	pub async fn authenticate(&self, token: &str) -> Result<Identity, OpError> {
		let token = token.trim();
		if token.is_empty() {
			return Err(OpError::AuthenticationFailed("missing token".to_string()));
		}

		let claims = verify_hmac_token(token, self.secret.expose())
			.map_err(|e| OpError::AuthenticationFailed(e.to_string()))?;

		let user_id = UserId::new(claims.sub.clone())
			.map_err(|_| OpError::AuthenticationFailed("empty subject".to_string()))?;

		match self.store.find_user_by_id(&user_id).await? {
			Some(identity) => Ok(identity),
			None => {
				warn!(user_id = %user_id, "token subject no longer exists");
				Err(OpError::AuthenticationFailed("user not found".to_string()))
			}
		}
	}
}
