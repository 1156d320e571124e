//! Request signing for the streaming endpoint.
//!
//! The stream request is authorized by a [`RequestSigner`]. [`OAuth1Signer`]
//! produces OAuth 1.0a HMAC-SHA1 `Authorization` headers from an already
//! issued consumer/access token pair; acquiring those tokens is left to the
//! host application.

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use base64::{engine::general_purpose::STANDARD as BASE64_STANDARD, Engine as _};
use hmac::{Hmac, Mac};
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use rand::RngCore;
use secrecy::{ExposeSecret, SecretString};
use sha1::Sha1;
use thiserror::Error;

/// RFC 3986 unreserved characters stay as-is; everything else is encoded.
const OAUTH_ENCODE_SET: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'.')
    .remove(b'_')
    .remove(b'~');

/// Errors produced while signing a request.
#[derive(Debug, Error)]
pub enum SignError {
    #[error("system clock is before unix epoch")]
    Clock,

    #[error("invalid signing key: {0}")]
    Key(String),
}

/// Produces the `Authorization` header value for a stream request.
///
/// `params` holds every form/query parameter sent with the request, which
/// OAuth 1.0a folds into the signature.
pub trait RequestSigner: Send + Sync {
    fn authorization(
        &self,
        method: &str,
        url: &str,
        params: &[(String, String)],
    ) -> Result<String, SignError>;
}

/// Consumer and access token pair issued by the feed provider.
#[derive(Clone)]
pub struct OAuthCredentials {
    pub consumer_key: String,
    pub consumer_secret: SecretString,
    pub access_token: String,
    pub access_secret: SecretString,
}

impl OAuthCredentials {
    pub fn new(
        consumer_key: impl Into<String>,
        consumer_secret: SecretString,
        access_token: impl Into<String>,
        access_secret: SecretString,
    ) -> Self {
        Self {
            consumer_key: consumer_key.into(),
            consumer_secret,
            access_token: access_token.into(),
            access_secret,
        }
    }
}

impl fmt::Debug for OAuthCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OAuthCredentials")
            .field("consumer_key", &self.consumer_key)
            .field("access_token", &self.access_token)
            .finish_non_exhaustive()
    }
}

/// OAuth 1.0a HMAC-SHA1 signer.
#[derive(Clone, Debug)]
pub struct OAuth1Signer {
    credentials: OAuthCredentials,
}

impl OAuth1Signer {
    pub fn new(credentials: OAuthCredentials) -> Self {
        Self { credentials }
    }

    fn sign_with(
        &self,
        method: &str,
        url: &str,
        params: &[(String, String)],
        nonce: String,
        timestamp: String,
    ) -> Result<String, SignError> {
        let mut oauth_params = vec![
            (
                "oauth_consumer_key".to_string(),
                self.credentials.consumer_key.clone(),
            ),
            ("oauth_nonce".to_string(), nonce),
            (
                "oauth_signature_method".to_string(),
                "HMAC-SHA1".to_string(),
            ),
            ("oauth_timestamp".to_string(), timestamp),
            (
                "oauth_token".to_string(),
                self.credentials.access_token.clone(),
            ),
            ("oauth_version".to_string(), "1.0".to_string()),
        ];

        let base_string = signature_base_string(method, url, &oauth_params, params);
        let signing_key = format!(
            "{}&{}",
            percent_encode(self.credentials.consumer_secret.expose_secret()),
            percent_encode(self.credentials.access_secret.expose_secret())
        );
        let signature = hmac_sha1(&signing_key, &base_string)?;
        oauth_params.push(("oauth_signature".to_string(), signature));

        let header = oauth_params
            .iter()
            .map(|(key, value)| format!("{}=\"{}\"", percent_encode(key), percent_encode(value)))
            .collect::<Vec<_>>()
            .join(", ");

        Ok(format!("OAuth {header}"))
    }
}

impl RequestSigner for OAuth1Signer {
    fn authorization(
        &self,
        method: &str,
        url: &str,
        params: &[(String, String)],
    ) -> Result<String, SignError> {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_err(|_| SignError::Clock)?
            .as_secs()
            .to_string();
        self.sign_with(method, url, params, generate_nonce(), timestamp)
    }
}

fn signature_base_string(
    method: &str,
    url: &str,
    oauth_params: &[(String, String)],
    params: &[(String, String)],
) -> String {
    let mut encoded: Vec<(String, String)> = oauth_params
        .iter()
        .chain(params.iter())
        .map(|(key, value)| (percent_encode(key), percent_encode(value)))
        .collect();
    encoded.sort();

    let param_string = encoded
        .iter()
        .map(|(key, value)| format!("{key}={value}"))
        .collect::<Vec<_>>()
        .join("&");

    format!(
        "{}&{}&{}",
        method.to_ascii_uppercase(),
        percent_encode(url),
        percent_encode(&param_string)
    )
}

fn percent_encode(value: &str) -> String {
    utf8_percent_encode(value, OAUTH_ENCODE_SET).to_string()
}

fn generate_nonce() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    bytes.iter().map(|byte| format!("{byte:02x}")).collect()
}

fn hmac_sha1(key: &str, data: &str) -> Result<String, SignError> {
    type HmacSha1 = Hmac<Sha1>;

    let mut mac = HmacSha1::new_from_slice(key.as_bytes())
        .map_err(|err| SignError::Key(err.to_string()))?;
    mac.update(data.as_bytes());
    Ok(BASE64_STANDARD.encode(mac.finalize().into_bytes()))
}
