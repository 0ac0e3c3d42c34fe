//! OIDC authorization-code flow with PKCE.
//!
//! One login attempt moves through three steps:
//!
//! 1. [`OidcFlow::authorization_url`] stores a fresh authorization state
//!    (PKCE verifier, nonce, post-login redirect) and returns the provider
//!    URL to redirect to.
//! 2. The provider redirects back with `code` and `state`.
//! 3. [`OidcFlow::handle_callback`] consumes the state, exchanges the code
//!    and validates the returned ID token against the stored nonce.
//!
//! The state is consumed before the exchange, so a failed exchange still
//! burns it and a callback can never be replayed.
//!
//! Endpoints come from [`OidcFlow::discover_endpoints`] or are set directly
//! with [`OidcFlow::set_endpoints`]. Request cancellation is the caller's:
//! dropping a returned future aborts the in-flight provider request, and
//! every request is bounded by the configured timeout.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use url::Url;

use super::discovery::{self, ProviderMetadata};
use super::error::OidcError;
use super::identity::Identity;
use super::jwks::KeyCache;
use super::validator::{Claims, IdTokenValidator};
use crate::config::OidcConfig;
use crate::error::{AuthError, AuthResult};
use crate::events::{EventQueue, SecurityEvent, emit};
use crate::metrics::{MetricsSink, names};
use crate::storage::{AuthorizationState, RecordStore, StateStore};
use crate::token::pkce::CHALLENGE_METHOD;
use crate::token::{PkcePair, generate_token};

/// Random bytes in a nonce.
pub const NONCE_BYTES: usize = 16;

/// Provider endpoints used by the flow.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Endpoints {
    /// Authorization endpoint.
    pub authorization: Option<Url>,
    /// Token endpoint.
    pub token: Option<Url>,
    /// UserInfo endpoint.
    pub userinfo: Option<Url>,
    /// RP-initiated logout endpoint.
    pub end_session: Option<Url>,
}

/// Token endpoint response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenSet {
    /// Access token.
    pub access_token: String,
    /// Token type, normally `Bearer`.
    #[serde(default = "default_token_type")]
    pub token_type: String,
    /// Access token lifetime in seconds.
    #[serde(default)]
    pub expires_in: Option<u64>,
    /// Refresh token, if issued.
    #[serde(default)]
    pub refresh_token: Option<String>,
    /// ID token, if issued.
    #[serde(default)]
    pub id_token: Option<String>,
    /// Granted scopes.
    #[serde(default)]
    pub scope: Option<String>,
}

fn default_token_type() -> String {
    "Bearer".to_string()
}

/// Outcome of a completed login.
#[derive(Debug, Clone)]
pub struct TokenResult {
    /// Access token from the provider.
    pub access_token: String,
    /// Refresh token, if issued.
    pub refresh_token: Option<String>,
    /// The validated ID token.
    pub id_token: String,
    /// Token type.
    pub token_type: String,
    /// Access token lifetime in seconds.
    pub expires_in: Option<u64>,
    /// Redirect target passed to [`OidcFlow::authorization_url`].
    pub post_login_redirect: String,
    /// Identity asserted by the ID token.
    pub identity: Identity,
}

#[derive(Deserialize)]
struct OAuthErrorResponse {
    error: String,
    #[serde(default)]
    error_description: Option<String>,
}

/// Relying-party side of the authorization-code flow.
pub struct OidcFlow {
    config: Arc<OidcConfig>,
    http: reqwest::Client,
    endpoints: RwLock<Endpoints>,
    validator: IdTokenValidator,
    states: StateStore,
    metrics: Arc<dyn MetricsSink>,
    events: Option<EventQueue>,
}

impl std::fmt::Debug for OidcFlow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OidcFlow")
            .field("issuer", &self.config.issuer)
            .field("client_id", &self.config.client_id)
            .finish_non_exhaustive()
    }
}

impl OidcFlow {
    /// Creates a flow from its parts.
    pub fn new(
        config: OidcConfig,
        http: reqwest::Client,
        keys: Arc<KeyCache>,
        states: StateStore,
        metrics: Arc<dyn MetricsSink>,
    ) -> Self {
        let config = Arc::new(config);
        Self {
            validator: IdTokenValidator::new(Arc::clone(&config), keys),
            config,
            http,
            endpoints: RwLock::new(Endpoints::default()),
            states,
            metrics,
            events: None,
        }
    }

    /// Builds the HTTP client, key cache and state store from `config`.
    ///
    /// # Errors
    ///
    /// Returns `AuthError::Configuration` if the HTTP client cannot be built.
    pub fn from_config(
        config: OidcConfig,
        store: Arc<dyn RecordStore>,
        metrics: Arc<dyn MetricsSink>,
    ) -> AuthResult<Self> {
        let http = super::build_http_client(&config)?;
        let keys = Arc::new(KeyCache::new(http.clone(), &config, Arc::clone(&metrics)));
        let states = StateStore::new(store, config.state_ttl);
        Ok(Self::new(config, http, keys, states, metrics))
    }

    /// Sends login events to `events`.
    #[must_use]
    pub fn with_events(mut self, events: EventQueue) -> Self {
        self.events = Some(events);
        self
    }

    /// Provider configuration.
    #[must_use]
    pub fn config(&self) -> &OidcConfig {
        &self.config
    }

    /// ID token validator, shared with back-channel logout.
    #[must_use]
    pub fn validator(&self) -> &IdTokenValidator {
        &self.validator
    }

    /// Provider key cache.
    #[must_use]
    pub fn key_cache(&self) -> &Arc<KeyCache> {
        self.validator.key_cache()
    }

    /// Pending authorization states.
    #[must_use]
    pub fn state_store(&self) -> &StateStore {
        &self.states
    }

    /// Current endpoints.
    pub async fn endpoints(&self) -> Endpoints {
        self.endpoints.read().await.clone()
    }

    /// Sets endpoints without discovery.
    pub async fn set_endpoints(&self, endpoints: Endpoints) {
        *self.endpoints.write().await = endpoints;
    }

    /// Fetches provider metadata and installs its endpoints and key set URI.
    ///
    /// The key set is fetched right away; a failure there is logged and
    /// retried on first use.
    ///
    /// # Errors
    ///
    /// - `AuthError::Unavailable` if the document cannot be fetched or is
    ///   for another issuer
    pub async fn discover_endpoints(&self) -> AuthResult<ProviderMetadata> {
        let metadata = discovery::discover(&self.http, &self.config.issuer).await?;

        let endpoints = Endpoints {
            authorization: Some(parse_endpoint(&metadata.authorization_endpoint)?),
            token: Some(parse_endpoint(&metadata.token_endpoint)?),
            userinfo: metadata.userinfo_endpoint.as_deref().map(parse_endpoint).transpose()?,
            end_session: metadata
                .end_session_endpoint
                .as_deref()
                .map(parse_endpoint)
                .transpose()?,
        };
        let jwks_uri = parse_endpoint(&metadata.jwks_uri)?;

        if self.config.pkce_enabled && !metadata.supports_pkce_s256() {
            tracing::warn!(issuer = %self.config.issuer, "provider does not advertise S256 PKCE");
        }

        self.set_endpoints(endpoints).await;
        self.key_cache().set_jwks_uri(jwks_uri).await;
        if let Err(e) = self.key_cache().refresh().await {
            tracing::warn!(issuer = %self.config.issuer, error = %e, "initial jwks fetch failed");
        }

        tracing::info!(issuer = %metadata.issuer, "discovered provider endpoints");
        Ok(metadata)
    }

    /// Starts a login attempt and returns the provider URL to redirect to.
    ///
    /// # Errors
    ///
    /// - `AuthError::Unavailable` if no authorization endpoint is known
    /// - `AuthError::Storage` if the state cannot be stored
    pub async fn authorization_url(&self, post_login_redirect: &str) -> AuthResult<Url> {
        let mut url = self
            .endpoints
            .read()
            .await
            .authorization
            .clone()
            .ok_or(OidcError::NotConfigured("authorization"))?;

        let pkce = self.config.pkce_enabled.then(PkcePair::generate);
        let nonce = self
            .config
            .nonce_enabled
            .then(|| generate_token(NONCE_BYTES));

        let (state, _) = self
            .states
            .create(
                pkce.as_ref().map(|p| p.verifier().to_string()),
                nonce.clone(),
                post_login_redirect,
            )
            .await?;

        {
            let mut params = url.query_pairs_mut();
            params.append_pair("response_type", "code");
            params.append_pair("client_id", &self.config.client_id);
            params.append_pair("redirect_uri", &self.config.redirect_url);
            params.append_pair("scope", &self.scope());
            params.append_pair("state", &state);
            if let Some(pkce) = &pkce {
                params.append_pair("code_challenge", pkce.challenge());
                params.append_pair("code_challenge_method", CHALLENGE_METHOD);
            }
            if let Some(nonce) = &nonce {
                params.append_pair("nonce", nonce);
            }
        }

        tracing::debug!(
            issuer = %self.config.issuer,
            pkce = pkce.is_some(),
            nonce = nonce.is_some(),
            "issued authorization url"
        );
        Ok(url)
    }

    /// Consumes the authorization state for `state`.
    ///
    /// # Errors
    ///
    /// Returns `AuthError::InvalidState` if the state is unknown, expired or
    /// already used.
    pub async fn validate_state(&self, state: &str) -> AuthResult<AuthorizationState> {
        self.states.take(state).await.map_err(|err| {
            if err.is_absent() {
                tracing::debug!(error = %err, "rejected authorization state");
                AuthError::InvalidState
            } else {
                err
            }
        })
    }

    /// Completes a login from the provider callback.
    ///
    /// # Errors
    ///
    /// - `AuthError::InvalidState` for an unknown, expired or reused state
    /// - `AuthError::InvalidCredentials` if the provider rejects the code or
    ///   the ID token fails validation
    /// - `AuthError::Unavailable` if the provider cannot be reached
    pub async fn handle_callback(&self, code: &str, state: &str) -> AuthResult<TokenResult> {
        let result = self.complete_login(code, state).await;
        match &result {
            Ok(login) => {
                self.metrics
                    .increment_counter(names::OIDC_LOGINS_TOTAL, &[("outcome", "success")]);
                tracing::info!(
                    subject = %login.identity.subject,
                    provider = %login.identity.provider,
                    "oidc login succeeded"
                );
                emit(
                    self.events.as_ref(),
                    SecurityEvent::LoginSucceeded {
                        subject: login.identity.subject.clone(),
                        provider: login.identity.provider.clone(),
                        session_id: None,
                    },
                );
            }
            Err(err) => {
                let reason = err.category().as_str();
                self.metrics
                    .increment_counter(names::OIDC_LOGINS_TOTAL, &[("outcome", reason)]);
                tracing::warn!(error = %err, "oidc login failed");
                emit(
                    self.events.as_ref(),
                    SecurityEvent::LoginFailed {
                        subject: None,
                        source_addr: None,
                        reason: reason.to_string(),
                        failed_attempts: None,
                    },
                );
            }
        }
        result
    }

    async fn complete_login(&self, code: &str, state: &str) -> AuthResult<TokenResult> {
        let auth_state = self.validate_state(state).await?;

        let tokens = self
            .exchange_code(code, auth_state.code_verifier.as_deref())
            .await?;
        let id_token = tokens.id_token.ok_or(OidcError::MissingIdToken)?;

        let identity = self
            .validator
            .validate_and_parse(&id_token, auth_state.nonce.as_deref())
            .await?;

        Ok(TokenResult {
            access_token: tokens.access_token,
            refresh_token: tokens.refresh_token,
            id_token,
            token_type: tokens.token_type,
            expires_in: tokens.expires_in,
            post_login_redirect: auth_state.post_login_redirect,
            identity,
        })
    }

    async fn exchange_code(&self, code: &str, verifier: Option<&str>) -> Result<TokenSet, OidcError> {
        let mut form = vec![
            ("grant_type", "authorization_code"),
            ("code", code),
            ("redirect_uri", self.config.redirect_url.as_str()),
            ("client_id", self.config.client_id.as_str()),
        ];
        if let Some(secret) = self.config.client_secret.as_deref() {
            form.push(("client_secret", secret));
        }
        if let Some(verifier) = verifier {
            form.push(("code_verifier", verifier));
        }
        self.token_request(&form).await
    }

    /// Runs the refresh-token grant. The state store is not involved.
    ///
    /// # Errors
    ///
    /// - `AuthError::InvalidCredentials` if the provider rejects the token
    /// - `AuthError::Unavailable` if the provider cannot be reached
    pub async fn refresh_token(&self, refresh_token: &str) -> AuthResult<TokenSet> {
        let mut form = vec![
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
            ("client_id", self.config.client_id.as_str()),
        ];
        if let Some(secret) = self.config.client_secret.as_deref() {
            form.push(("client_secret", secret));
        }

        let result = self.token_request(&form).await;
        let outcome = if result.is_ok() { "success" } else { "failure" };
        self.metrics
            .increment_counter(names::OIDC_TOKEN_REFRESHES_TOTAL, &[("outcome", outcome)]);
        Ok(result?)
    }

    async fn token_request(&self, form: &[(&str, &str)]) -> Result<TokenSet, OidcError> {
        let endpoint = self
            .endpoints
            .read()
            .await
            .token
            .clone()
            .ok_or(OidcError::NotConfigured("token"))?;

        tracing::debug!(endpoint = %endpoint, "calling token endpoint");
        let response = self
            .http
            .post(endpoint.as_str())
            .header(reqwest::header::ACCEPT, "application/json")
            .form(form)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            if let Ok(oauth) = serde_json::from_str::<OAuthErrorResponse>(&body) {
                return Err(OidcError::oauth(
                    oauth.error,
                    oauth.error_description.unwrap_or_default(),
                ));
            }
            return Err(OidcError::HttpStatus {
                status: status.as_u16(),
                body,
            });
        }

        response
            .json::<TokenSet>()
            .await
            .map_err(|e| OidcError::Parse(e.to_string()))
    }

    /// Fetches claims from the UserInfo endpoint.
    ///
    /// # Errors
    ///
    /// - `AuthError::Unavailable` if no endpoint is known or the provider
    ///   cannot be reached
    /// - `AuthError::InvalidCredentials` if the access token is rejected
    pub async fn fetch_userinfo(&self, access_token: &str) -> AuthResult<Claims> {
        let endpoint = self
            .endpoints
            .read()
            .await
            .userinfo
            .clone()
            .ok_or(OidcError::NotConfigured("userinfo"))?;

        let response = self
            .http
            .get(endpoint.as_str())
            .bearer_auth(access_token)
            .send()
            .await
            .map_err(OidcError::from)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(OidcError::HttpStatus {
                status: status.as_u16(),
                body,
            }
            .into());
        }

        Ok(response
            .json::<Claims>()
            .await
            .map_err(|e| OidcError::Parse(e.to_string()))?)
    }

    /// RP-initiated logout URL, or `None` when the provider has no
    /// end-session endpoint.
    pub async fn end_session_url(
        &self,
        id_token_hint: Option<&str>,
        post_logout_redirect: Option<&str>,
    ) -> Option<Url> {
        let mut url = self.endpoints.read().await.end_session.clone()?;
        {
            let mut params = url.query_pairs_mut();
            params.append_pair("client_id", &self.config.client_id);
            if let Some(hint) = id_token_hint {
                params.append_pair("id_token_hint", hint);
            }
            if let Some(redirect) = post_logout_redirect {
                params.append_pair("post_logout_redirect_uri", redirect);
            }
        }
        Some(url)
    }

    fn scope(&self) -> String {
        let mut scopes: Vec<&str> = self.config.scopes.iter().map(String::as_str).collect();
        if !scopes.contains(&"openid") {
            scopes.insert(0, "openid");
        }
        scopes.join(" ")
    }
}

fn parse_endpoint(raw: &str) -> Result<Url, OidcError> {
    Ok(Url::parse(raw)?)
}
