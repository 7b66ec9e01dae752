use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine as _;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const ACCESS_TOKEN_TTL_SECONDS: i64 = 60 * 60;
pub const REFRESH_TOKEN_TTL_SECONDS: i64 = 14 * 24 * 60 * 60;

const REFRESH_TOKEN_TYPE: &str = "refresh";

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("token signing secret is not configured")]
    MissingSecret,
    #[error("token signing secret is not valid base64: {0}")]
    InvalidSecretEncoding(#[from] base64::DecodeError),
    #[error("failed to sign token: {0}")]
    Signing(#[source] jsonwebtoken::errors::Error),
    #[error("token rejected: {0}")]
    InvalidToken(#[source] jsonwebtoken::errors::Error),
    #[error("token expired at {expires_at}")]
    Expired { expires_at: i64 },
    #[error("token is not a refresh token")]
    NotRefreshToken,
    #[error("system clock is before unix epoch")]
    Clock,
}

/// How the configured signing secret is turned into key bytes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SecretEncoding {
    /// UTF-8 bytes of the secret string.
    #[default]
    Raw,
    /// Standard base64, decoded before keying (what the chat server expects).
    Base64,
}

impl FromStr for SecretEncoding {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_ascii_lowercase().as_str() {
            "raw" => Ok(Self::Raw),
            "base64" => Ok(Self::Base64),
            other => Err(format!("unknown secret encoding `{other}` (expected raw or base64)")),
        }
    }
}

/// A signed, short-lived token together with the facts needed to judge it
/// without decoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credential {
    pub subject: String,
    pub issued_at: i64,
    pub expires_at: i64,
    pub token: String,
}

impl Credential {
    /// Valid iff `unix_seconds` is strictly before expiry.
    pub fn is_valid_at(&self, unix_seconds: i64) -> bool {
        unix_seconds < self.expires_at
    }

    pub fn is_valid_now(&self) -> bool {
        current_unix_timestamp().is_ok_and(|now| self.is_valid_at(now))
    }

    pub fn bearer(&self) -> String {
        format!("Bearer {}", self.token)
    }
}

/// An access credential and the refresh credential that can rotate it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CredentialPair {
    pub access: Credential,
    pub refresh: Credential,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct TokenClaims {
    sub: String,
    exp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    typ: Option<String>,
}

/// Issues and rotates HMAC-signed tokens for bus sessions.
#[derive(Clone)]
pub struct TokenProvider {
    algorithm: Algorithm,
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    validation: Validation,
}

impl std::fmt::Debug for TokenProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenProvider").field("algorithm", &self.algorithm).finish_non_exhaustive()
    }
}

impl TokenProvider {
    pub fn new(
        secret: &str,
        encoding: SecretEncoding,
        algorithm: Algorithm,
    ) -> Result<Self, AuthError> {
        if secret.trim().is_empty() {
            return Err(AuthError::MissingSecret);
        }

        let key_bytes = match encoding {
            SecretEncoding::Raw => secret.as_bytes().to_vec(),
            SecretEncoding::Base64 => BASE64_STANDARD.decode(secret.trim())?,
        };

        // Expiry is checked against the caller's clock, not jsonwebtoken's.
        let mut validation = Validation::new(algorithm);
        validation.validate_exp = false;
        validation.leeway = 0;
        validation.set_required_spec_claims(&["exp", "sub"]);

        Ok(Self {
            algorithm,
            encoding_key: EncodingKey::from_secret(&key_bytes),
            decoding_key: DecodingKey::from_secret(&key_bytes),
            validation,
        })
    }

    pub fn algorithm(&self) -> Algorithm {
        self.algorithm
    }

    pub fn issue(&self, subject: &str) -> Result<Credential, AuthError> {
        self.issue_at(subject, current_unix_timestamp()?)
    }

    /// Deterministic form of [`TokenProvider::issue`]: same subject and
    /// issuance time always yield the same token.
    pub fn issue_at(&self, subject: &str, issued_at: i64) -> Result<Credential, AuthError> {
        self.sign(subject, issued_at, ACCESS_TOKEN_TTL_SECONDS, None)
    }

    pub fn issue_pair(&self, subject: &str) -> Result<CredentialPair, AuthError> {
        self.issue_pair_at(subject, current_unix_timestamp()?)
    }

    pub fn issue_pair_at(&self, subject: &str, issued_at: i64) -> Result<CredentialPair, AuthError> {
        Ok(CredentialPair {
            access: self.issue_at(subject, issued_at)?,
            refresh: self.sign(
                subject,
                issued_at,
                REFRESH_TOKEN_TTL_SECONDS,
                Some(REFRESH_TOKEN_TYPE),
            )?,
        })
    }

    /// Validate a refresh token and rotate both credentials.
    pub fn refresh(&self, refresh_token: &str) -> Result<CredentialPair, AuthError> {
        self.refresh_at(refresh_token, current_unix_timestamp()?)
    }

    pub fn refresh_at(&self, refresh_token: &str, now: i64) -> Result<CredentialPair, AuthError> {
        let claims = self.decode_at(refresh_token, now)?;
        if claims.typ.as_deref() != Some(REFRESH_TOKEN_TYPE) {
            return Err(AuthError::NotRefreshToken);
        }
        self.issue_pair_at(&claims.sub, now)
    }

    /// Validate an access token and return its subject.
    pub fn validate(&self, token: &str) -> Result<String, AuthError> {
        self.validate_at(token, current_unix_timestamp()?)
    }

    pub fn validate_at(&self, token: &str, now: i64) -> Result<String, AuthError> {
        let claims = self.decode_at(token, now)?;
        if claims.typ.is_some() {
            return Err(AuthError::InvalidToken(jsonwebtoken::errors::ErrorKind::InvalidToken.into()));
        }
        Ok(claims.sub)
    }

    fn sign(
        &self,
        subject: &str,
        issued_at: i64,
        ttl_seconds: i64,
        typ: Option<&str>,
    ) -> Result<Credential, AuthError> {
        let claims = TokenClaims {
            sub: subject.to_string(),
            exp: issued_at + ttl_seconds,
            typ: typ.map(str::to_string),
        };

        let token = encode(&Header::new(self.algorithm), &claims, &self.encoding_key)
            .map_err(AuthError::Signing)?;

        Ok(Credential {
            subject: claims.sub,
            issued_at,
            expires_at: claims.exp,
            token,
        })
    }

    fn decode_at(&self, token: &str, now: i64) -> Result<TokenClaims, AuthError> {
        let claims = decode::<TokenClaims>(token, &self.decoding_key, &self.validation)
            .map_err(AuthError::InvalidToken)?
            .claims;
        if now >= claims.exp {
            return Err(AuthError::Expired { expires_at: claims.exp });
        }
        Ok(claims)
    }
}

pub fn current_unix_timestamp() -> Result<i64, AuthError> {
    let duration = SystemTime::now().duration_since(UNIX_EPOCH).map_err(|_| AuthError::Clock)?;
    i64::try_from(duration.as_secs()).map_err(|_| AuthError::Clock)
}

#[cfg(test)]
mod tests {
    use super::*;

    const TEST_SECRET: &str = "chatgen_test_secret_that_is_long_enough_for_hs512_signing";
    const T0: i64 = 1_700_000_000;

    fn provider() -> TokenProvider {
        TokenProvider::new(TEST_SECRET, SecretEncoding::Raw, Algorithm::HS512)
            .expect("provider should initialize")
    }

    #[test]
    fn issued_credential_expires_after_issuance() {
        let credential = provider().issue_at("chatbot", T0).expect("token should be issued");
        assert_eq!(credential.subject, "chatbot");
        assert!(credential.expires_at > credential.issued_at);
        assert_eq!(credential.expires_at - credential.issued_at, ACCESS_TOKEN_TTL_SECONDS);
    }

    #[test]
    fn issue_is_deterministic_for_fixed_clock() {
        let provider = provider();
        let a = provider.issue_at("7", T0).expect("token should be issued");
        let b = provider.issue_at("7", T0).expect("token should be issued");
        assert_eq!(a, b);
    }

    #[test]
    fn validity_is_strictly_before_expiry() {
        let credential = provider().issue_at("7", T0).expect("token should be issued");
        assert!(credential.is_valid_at(T0));
        assert!(credential.is_valid_at(credential.expires_at - 1));
        assert!(!credential.is_valid_at(credential.expires_at));
    }

    #[test]
    fn validates_issued_token_subject() {
        let provider = provider();
        let credential = provider.issue_at("42", T0).expect("token should be issued");
        assert_eq!(provider.validate_at(&credential.token, T0 + 10).expect("valid"), "42");
    }

    #[test]
    fn rejects_tampered_tokens() {
        let provider = provider();
        let credential = provider.issue_at("42", T0).expect("token should be issued");
        let tampered = format!("{}x", credential.token);
        assert!(provider.validate_at(&tampered, T0).is_err());
    }

    #[test]
    fn rejects_expired_access_token() {
        let provider = provider();
        let credential = provider.issue_at("42", T0).expect("token should be issued");
        let error = provider
            .validate_at(&credential.token, credential.expires_at)
            .expect_err("expired token should be rejected");
        assert!(matches!(error, AuthError::Expired { .. }));
    }

    #[test]
    fn refresh_rotates_both_credentials() {
        let provider = provider();
        let pair = provider.issue_pair_at("chatbot", T0).expect("pair should be issued");
        let rotated =
            provider.refresh_at(&pair.refresh.token, T0 + 60).expect("refresh should succeed");

        assert_eq!(rotated.access.subject, "chatbot");
        assert_eq!(rotated.access.issued_at, T0 + 60);
        assert_ne!(rotated.access.token, pair.access.token);
        assert_ne!(rotated.refresh.token, pair.refresh.token);
    }

    #[test]
    fn refresh_rejects_access_tokens() {
        let provider = provider();
        let pair = provider.issue_pair_at("chatbot", T0).expect("pair should be issued");
        let error =
            provider.refresh_at(&pair.access.token, T0).expect_err("access token is not a refresh");
        assert!(matches!(error, AuthError::NotRefreshToken));
    }

    #[test]
    fn refresh_rejects_expired_refresh_token() {
        let provider = provider();
        let pair = provider.issue_pair_at("chatbot", T0).expect("pair should be issued");
        let error = provider
            .refresh_at(&pair.refresh.token, T0 + REFRESH_TOKEN_TTL_SECONDS)
            .expect_err("expired refresh token should be rejected");
        assert!(matches!(error, AuthError::Expired { .. }));
    }

    #[test]
    fn access_validation_rejects_refresh_tokens() {
        let provider = provider();
        let pair = provider.issue_pair_at("chatbot", T0).expect("pair should be issued");
        assert!(provider.validate_at(&pair.refresh.token, T0).is_err());
    }

    #[test]
    fn empty_secret_is_a_configuration_error() {
        let error = TokenProvider::new("  ", SecretEncoding::Raw, Algorithm::HS256)
            .expect_err("empty secret should be rejected");
        assert!(matches!(error, AuthError::MissingSecret));
    }

    #[test]
    fn base64_secret_signs_with_decoded_bytes() {
        let encoded = BASE64_STANDARD.encode(TEST_SECRET);
        let from_base64 = TokenProvider::new(&encoded, SecretEncoding::Base64, Algorithm::HS512)
            .expect("base64 secret should decode");
        let token = from_base64.issue_at("9", T0).expect("token should be issued");
        assert_eq!(provider().validate_at(&token.token, T0).expect("same key"), "9");
    }

    #[test]
    fn invalid_base64_secret_is_rejected() {
        let error = TokenProvider::new("not base64!!", SecretEncoding::Base64, Algorithm::HS512)
            .expect_err("invalid base64 should fail");
        assert!(matches!(error, AuthError::InvalidSecretEncoding(_)));
    }

    #[test]
    fn secret_encoding_parses_case_insensitively() {
        assert_eq!("BASE64".parse::<SecretEncoding>(), Ok(SecretEncoding::Base64));
        assert_eq!("raw".parse::<SecretEncoding>(), Ok(SecretEncoding::Raw));
        assert!("hex".parse::<SecretEncoding>().is_err());
    }
}
