//! OAuth 1.0a request signing (HMAC-SHA1).
//!
//! Query parameters and url-encoded form parameters take part in the
//! signature; JSON and multipart bodies do not.

use super::ChannelError;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use hmac::{Hmac, Mac};
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::Deserialize;
use sha1::Sha1;
use url::Url;

type HmacSha1 = Hmac<Sha1>;

const NONCE_LEN: usize = 32;

/// Application and user credentials for the channel
#[derive(Clone, Default, Deserialize)]
pub struct OAuthCredentials {
    #[serde(default)]
    pub consumer_key: String,
    #[serde(default)]
    pub consumer_secret: String,
    #[serde(default)]
    pub access_token: String,
    #[serde(default)]
    pub access_token_secret: String,
}

impl OAuthCredentials {
    pub fn is_complete(&self) -> bool {
        !(self.consumer_key.is_empty()
            || self.consumer_secret.is_empty()
            || self.access_token.is_empty()
            || self.access_token_secret.is_empty())
    }
}

impl std::fmt::Debug for OAuthCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OAuthCredentials")
            .field("consumer_key", &self.consumer_key)
            .field("consumer_secret", &"<redacted>")
            .field("access_token", &self.access_token)
            .field("access_token_secret", &"<redacted>")
            .finish()
    }
}

/// Everything but RFC 3986 unreserved characters.
const OAUTH_ENCODE_SET: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'.')
    .remove(b'_')
    .remove(b'~');

/// RFC 3986 percent-encoding as OAuth 1.0a requires.
pub fn percent_encode(input: &str) -> String {
    utf8_percent_encode(input, OAUTH_ENCODE_SET).to_string()
}

#[derive(Debug, Clone)]
pub struct OAuthSigner {
    credentials: OAuthCredentials,
}

impl OAuthSigner {
    pub fn new(credentials: OAuthCredentials) -> Self {
        Self { credentials }
    }

    /// `Authorization` header value for a request.
    pub fn authorization(
        &self,
        method: &str,
        url: &Url,
        form_params: &[(&str, &str)],
    ) -> Result<String, ChannelError> {
        let nonce: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(NONCE_LEN)
            .map(char::from)
            .collect();
        let timestamp = chrono::Utc::now().timestamp().to_string();
        self.authorization_with(method, url, form_params, &nonce, &timestamp)
    }

    fn oauth_params<'a>(&'a self, nonce: &'a str, timestamp: &'a str) -> [(&'static str, &'a str); 6] {
        [
            ("oauth_consumer_key", self.credentials.consumer_key.as_str()),
            ("oauth_nonce", nonce),
            ("oauth_signature_method", "HMAC-SHA1"),
            ("oauth_timestamp", timestamp),
            ("oauth_token", self.credentials.access_token.as_str()),
            ("oauth_version", "1.0"),
        ]
    }

    fn authorization_with(
        &self,
        method: &str,
        url: &Url,
        form_params: &[(&str, &str)],
        nonce: &str,
        timestamp: &str,
    ) -> Result<String, ChannelError> {
        let signature = self.signature(method, url, form_params, nonce, timestamp)?;

        let mut header_params: Vec<(&str, &str)> = self.oauth_params(nonce, timestamp).to_vec();
        header_params.push(("oauth_signature", signature.as_str()));
        header_params.sort();

        let fields: Vec<String> = header_params
            .iter()
            .map(|(key, value)| format!("{}=\"{}\"", percent_encode(key), percent_encode(value)))
            .collect();
        Ok(format!("OAuth {}", fields.join(", ")))
    }

    /// Base64 HMAC-SHA1 over the signature base string.
    pub fn signature(
        &self,
        method: &str,
        url: &Url,
        form_params: &[(&str, &str)],
        nonce: &str,
        timestamp: &str,
    ) -> Result<String, ChannelError> {
        let mut params: Vec<(String, String)> = url
            .query_pairs()
            .map(|(key, value)| (percent_encode(&key), percent_encode(&value)))
            .collect();
        params.extend(
            form_params
                .iter()
                .chain(self.oauth_params(nonce, timestamp).iter())
                .map(|(key, value)| (percent_encode(key), percent_encode(value))),
        );
        params.sort();

        let parameter_string = params
            .iter()
            .map(|(key, value)| format!("{key}={value}"))
            .collect::<Vec<_>>()
            .join("&");

        let mut base_url = url.clone();
        base_url.set_query(None);
        base_url.set_fragment(None);

        let base_string = format!(
            "{}&{}&{}",
            method.to_ascii_uppercase(),
            percent_encode(base_url.as_str()),
            percent_encode(&parameter_string)
        );
        let signing_key = format!(
            "{}&{}",
            percent_encode(&self.credentials.consumer_secret),
            percent_encode(&self.credentials.access_token_secret)
        );

        let mut mac = HmacSha1::new_from_slice(signing_key.as_bytes())
            .map_err(|e| ChannelError::Signing(e.to_string()))?;
        mac.update(base_string.as_bytes());
        Ok(STANDARD.encode(mac.finalize().into_bytes()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn documented_signer() -> OAuthSigner {
        OAuthSigner::new(OAuthCredentials {
            consumer_key: "xvz1evFS4wEEPTGEFPHBog".to_string(),
            consumer_secret: "kAcSOqF21Fu85e7zjz7ZN2U4ZRhfV3WpwPAoE3Z7kBw".to_string(),
            access_token: "370773112-GmHxMAgYyLbNEtIKZeRNFsMKPR9EyMZeS9weJAEb".to_string(),
            access_token_secret: "LswwdoUaIvS8ltyTt5jkRh4J50vUPVVHtR2YPi5kE".to_string(),
        })
    }

    const NONCE: &str = "kYjzVBB8Y0ZFabxSWbWovY3uYSQ2pTgmZeNu2VS4cg";
    const TIMESTAMP: &str = "1318622958";

    #[test]
    fn test_percent_encode() {
        assert_eq!(percent_encode("Ladies + Gentlemen"), "Ladies%20%2B%20Gentlemen");
        assert_eq!(percent_encode("An encoded string!"), "An%20encoded%20string%21");
        assert_eq!(percent_encode("Dogs, Cats & Mice"), "Dogs%2C%20Cats%20%26%20Mice");
        assert_eq!(percent_encode("☃"), "%E2%98%83");
        assert_eq!(percent_encode("a-b.c_d~e"), "a-b.c_d~e");
        assert_eq!(percent_encode("a/b*c%d"), "a%2Fb%2Ac%25d");
    }

    #[test]
    fn test_documented_signature() {
        let url = Url::parse("https://api.twitter.com/1.1/statuses/update.json?include_entities=true")
            .unwrap();
        let signature = documented_signer()
            .signature(
                "post",
                &url,
                &[("status", "Hello Ladies + Gentlemen, a signed OAuth request!")],
                NONCE,
                TIMESTAMP,
            )
            .unwrap();

        assert_eq!(signature, "hCtSmYh+iHYCEqBWrE7C7hYmtUk=");
    }

    #[test]
    fn test_authorization_header_shape() {
        let url = Url::parse("https://api.twitter.com/1.1/statuses/update.json?include_entities=true")
            .unwrap();
        let header = documented_signer()
            .authorization_with(
                "POST",
                &url,
                &[("status", "Hello Ladies + Gentlemen, a signed OAuth request!")],
                NONCE,
                TIMESTAMP,
            )
            .unwrap();

        assert!(header.starts_with("OAuth oauth_consumer_key=\"xvz1evFS4wEEPTGEFPHBog\", "));
        assert!(header.contains("oauth_signature=\"hCtSmYh%2BiHYCEqBWrE7C7hYmtUk%3D\""));
        assert!(header.ends_with("oauth_version=\"1.0\""));
    }

    #[test]
    fn test_random_nonce_changes_signature() {
        let url = Url::parse("https://api.twitter.com/2/tweets").unwrap();
        let signer = documented_signer();
        let first = signer.authorization("POST", &url, &[]).unwrap();
        let second = signer.authorization("POST", &url, &[]).unwrap();
        assert_ne!(first, second);
    }

    #[test]
    fn test_debug_redacts_secrets() {
        let rendered = format!("{:?}", documented_signer());
        assert!(!rendered.contains("kAcSOqF21Fu85e7zjz7ZN2U4ZRhfV3WpwPAoE3Z7kBw"));
        assert!(rendered.contains("<redacted>"));
    }
}
