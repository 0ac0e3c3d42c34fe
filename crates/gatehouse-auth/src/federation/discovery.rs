//! OpenID Connect discovery.
//!
//! Fetches `{issuer}/.well-known/openid-configuration` and checks that the
//! document describes the configured issuer. Discovery is optional: every
//! endpoint it yields can also be set by hand.

use serde::{Deserialize, Serialize};
use url::Url;

use super::error::OidcError;

/// Maximum accepted discovery document size (1 MB).
pub const MAX_DOCUMENT_SIZE: usize = 1024 * 1024;

/// The subset of provider metadata the engine uses.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderMetadata {
    /// Issuer identifier. Must match the configured issuer.
    pub issuer: String,
    /// Authorization endpoint.
    pub authorization_endpoint: String,
    /// Token endpoint.
    pub token_endpoint: String,
    /// Key set endpoint.
    pub jwks_uri: String,
    /// UserInfo endpoint.
    #[serde(default)]
    pub userinfo_endpoint: Option<String>,
    /// RP-initiated logout endpoint.
    #[serde(default)]
    pub end_session_endpoint: Option<String>,
    /// Scopes the provider supports.
    #[serde(default)]
    pub scopes_supported: Vec<String>,
    /// Response types the provider supports.
    #[serde(default)]
    pub response_types_supported: Vec<String>,
    /// PKCE challenge methods the provider supports.
    #[serde(default)]
    pub code_challenge_methods_supported: Vec<String>,
    /// Signing algorithms for ID tokens.
    #[serde(default)]
    pub id_token_signing_alg_values_supported: Vec<String>,
    /// Whether back-channel logout is supported.
    #[serde(default)]
    pub backchannel_logout_supported: bool,
    /// Whether back-channel logout tokens carry `sid`.
    #[serde(default)]
    pub backchannel_logout_session_supported: bool,
}

impl ProviderMetadata {
    /// Returns `true` if the provider advertises S256 PKCE. An empty list
    /// means the provider did not say.
    #[must_use]
    pub fn supports_pkce_s256(&self) -> bool {
        self.code_challenge_methods_supported.is_empty()
            || self
                .code_challenge_methods_supported
                .iter()
                .any(|m| m == crate::token::pkce::CHALLENGE_METHOD)
    }
}

/// Builds the discovery URL for an issuer.
///
/// # Errors
///
/// Returns `OidcError::Url` if the issuer is not a valid URL.
pub fn discovery_url(issuer: &str) -> Result<Url, OidcError> {
    let mut url = Url::parse(issuer)?;
    let path = url.path().trim_end_matches('/').to_string();
    url.set_path(&format!("{path}/.well-known/openid-configuration"));
    Ok(url)
}

/// Fetches and checks the provider metadata for `issuer`.
///
/// # Errors
///
/// - `OidcError::Network` / `OidcError::HttpStatus` if the fetch fails
/// - `OidcError::Parse` if the document is not valid metadata
/// - `OidcError::IssuerMismatch` if the document is for another issuer
pub async fn discover(http: &reqwest::Client, issuer: &str) -> Result<ProviderMetadata, OidcError> {
    let url = discovery_url(issuer)?;
    tracing::debug!(issuer = %issuer, url = %url, "fetching discovery document");

    let response = http
        .get(url.as_str())
        .header(reqwest::header::ACCEPT, "application/json")
        .send()
        .await?;

    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(OidcError::HttpStatus {
            status: status.as_u16(),
            body,
        });
    }

    if let Some(len) = response.content_length()
        && len as usize > MAX_DOCUMENT_SIZE
    {
        return Err(OidcError::Parse(format!(
            "discovery document exceeds {MAX_DOCUMENT_SIZE} bytes"
        )));
    }

    let metadata: ProviderMetadata = response
        .json()
        .await
        .map_err(|e| OidcError::Parse(e.to_string()))?;

    let expected = issuer.trim_end_matches('/');
    let actual = metadata.issuer.trim_end_matches('/');
    if expected != actual {
        return Err(OidcError::IssuerMismatch {
            expected: expected.to_string(),
            actual: actual.to_string(),
        });
    }

    Ok(metadata)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn document(issuer: &str) -> serde_json::Value {
        json!({
            "issuer": issuer,
            "authorization_endpoint": format!("{issuer}/authorize"),
            "token_endpoint": format!("{issuer}/token"),
            "jwks_uri": format!("{issuer}/jwks"),
            "userinfo_endpoint": format!("{issuer}/userinfo"),
            "response_types_supported": ["code"],
            "code_challenge_methods_supported": ["S256"]
        })
    }

    #[test]
    fn test_discovery_url() {
        assert_eq!(
            discovery_url("https://idp.example.com").unwrap().as_str(),
            "https://idp.example.com/.well-known/openid-configuration"
        );
        assert_eq!(
            discovery_url("https://idp.example.com/realms/main/").unwrap().as_str(),
            "https://idp.example.com/realms/main/.well-known/openid-configuration"
        );
        assert!(discovery_url("not a url").is_err());
    }

    #[tokio::test]
    async fn test_discover() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/.well-known/openid-configuration"))
            .respond_with(ResponseTemplate::new(200).set_body_json(document(&server.uri())))
            .mount(&server)
            .await;

        let metadata = discover(&reqwest::Client::new(), &server.uri()).await.unwrap();
        assert_eq!(metadata.token_endpoint, format!("{}/token", server.uri()));
        assert!(metadata.end_session_endpoint.is_none());
        assert!(metadata.supports_pkce_s256());
        assert!(!metadata.backchannel_logout_supported);
    }

    #[tokio::test]
    async fn test_discover_issuer_mismatch() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/.well-known/openid-configuration"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(document("https://other.example.com")),
            )
            .mount(&server)
            .await;

        let err = discover(&reqwest::Client::new(), &server.uri()).await.unwrap_err();
        assert!(matches!(err, OidcError::IssuerMismatch { .. }));
    }

    #[tokio::test]
    async fn test_discover_http_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(502))
            .mount(&server)
            .await;

        let err = discover(&reqwest::Client::new(), &server.uri()).await.unwrap_err();
        assert!(matches!(err, OidcError::HttpStatus { status: 502, .. }));
        assert!(!err.is_rejection());
    }

    #[test]
    fn test_pkce_support() {
        let mut metadata: ProviderMetadata =
            serde_json::from_value(document("https://idp.example.com")).unwrap();
        assert!(metadata.supports_pkce_s256());
        metadata.code_challenge_methods_supported = vec!["plain".to_string()];
        assert!(!metadata.supports_pkce_s256());
        metadata.code_challenge_methods_supported.clear();
        assert!(metadata.supports_pkce_s256());
    }
}
