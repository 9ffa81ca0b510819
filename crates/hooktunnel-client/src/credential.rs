//! Credential freshness checks.

use std::sync::Arc;

use jsonwebtoken::{DecodingKey, Validation};
use serde::Deserialize;

/// Tokens expiring within this many seconds are treated as expired.
const EXPIRY_LEEWAY_SECS: u64 = 30;

/// Predicate deciding whether a credential can still be presented.
pub type Freshness = Arc<dyn Fn(&str) -> bool + Send + Sync>;

#[derive(Debug, Deserialize)]
struct TimeClaims {
    exp: Option<u64>,
    nbf: Option<u64>,
}

/// Default freshness check for JWT bearer tokens.
///
/// The signature is not verified; only the relay can do that. A token is
/// usable when it decodes, carries an `exp` more than 30 seconds away and
/// has no `nbf` in the future.
pub fn is_token_usable(token: &str) -> bool {
    if token.is_empty() {
        return false;
    }

    let mut validation = Validation::default();
    validation.insecure_disable_signature_validation();
    validation.validate_exp = false;
    validation.validate_nbf = false;
    validation.validate_aud = false;
    validation.required_spec_claims.clear();

    let Ok(data) =
        jsonwebtoken::decode::<TimeClaims>(token, &DecodingKey::from_secret(&[]), &validation)
    else {
        return false;
    };

    let now = jsonwebtoken::get_current_timestamp();
    let fresh = data
        .claims
        .exp
        .is_some_and(|exp| exp > now.saturating_add(EXPIRY_LEEWAY_SECS));
    let started = data.claims.nbf.is_none_or(|nbf| nbf <= now);
    fresh && started
}

/// The default [`Freshness`] predicate.
pub fn jwt_freshness() -> Freshness {
    Arc::new(is_token_usable)
}
