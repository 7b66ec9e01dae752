pub mod refresh;
pub mod token;

pub use refresh::{CredentialRefresher, HttpRefresher, LocalRefresher, RefreshError, TokenStore};
pub use token::{AuthError, Credential, CredentialPair, SecretEncoding, TokenProvider};

use jsonwebtoken::Algorithm;

/// Parse an HMAC algorithm name. Only HMAC algorithms are accepted since the
/// chat server verifies with a shared secret.
pub fn parse_hmac_algorithm(value: &str) -> Option<Algorithm> {
    match value.trim().to_ascii_uppercase().as_str() {
        "HS256" => Some(Algorithm::HS256),
        "HS384" => Some(Algorithm::HS384),
        "HS512" => Some(Algorithm::HS512),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_hmac_algorithms_only() {
        assert_eq!(parse_hmac_algorithm("hs512"), Some(Algorithm::HS512));
        assert_eq!(parse_hmac_algorithm(" HS256 "), Some(Algorithm::HS256));
        assert_eq!(parse_hmac_algorithm("RS256"), None);
    }
}
