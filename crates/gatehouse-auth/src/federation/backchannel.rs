//! OpenID Connect back-channel logout.
//!
//! The provider POSTs a signed `logout_token` when a user logs out
//! elsewhere. A valid token terminates the matching sessions here. Each
//! token is accepted once: its `jti` goes through the replay tracker before
//! any session is touched.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;

use super::error::TokenValidationError;
use super::validator::{Claims, IdTokenValidator, string_claim};
use crate::config::ReplayConfig;
use crate::error::{AuthError, AuthResult};
use crate::events::{EventQueue, SecurityEvent, emit};
use crate::http::SecurityRequest;
use crate::metrics::{MetricsSink, names};
use crate::storage::{JtiEntry, JtiTracker, PROVIDER_SID_KEY, SessionStore};

/// Event type a logout token must declare.
pub const BACKCHANNEL_LOGOUT_EVENT: &str = "http://schemas.openid.net/event/backchannel-logout";

/// Form field carrying the token.
pub const LOGOUT_TOKEN_FIELD: &str = "logout_token";

/// What a processed logout notification did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogoutOutcome {
    /// `sub` from the token.
    pub subject: Option<String>,
    /// `sid` from the token.
    pub session_id: Option<String>,
    /// Sessions deleted.
    pub sessions_terminated: usize,
}

/// Handler for back-channel logout notifications.
pub struct BackChannelLogout {
    validator: IdTokenValidator,
    tracker: JtiTracker,
    sessions: SessionStore,
    default_ttl: Duration,
    metrics: Arc<dyn MetricsSink>,
    events: Option<EventQueue>,
}

impl std::fmt::Debug for BackChannelLogout {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackChannelLogout")
            .field("default_ttl", &self.default_ttl)
            .finish_non_exhaustive()
    }
}

impl BackChannelLogout {
    /// Creates a handler.
    pub fn new(
        validator: IdTokenValidator,
        tracker: JtiTracker,
        sessions: SessionStore,
        config: &ReplayConfig,
        metrics: Arc<dyn MetricsSink>,
    ) -> Self {
        Self {
            validator,
            tracker,
            sessions,
            default_ttl: config.default_ttl,
            metrics,
            events: None,
        }
    }

    /// Sends logout events to `events`.
    #[must_use]
    pub fn with_events(mut self, events: EventQueue) -> Self {
        self.events = Some(events);
        self
    }

    /// Processes the `logout_token` form field of `request`.
    ///
    /// # Errors
    ///
    /// - `AuthError::InvalidCredentials` if the field is missing or the
    ///   token is invalid
    /// - `AuthError::ReplayDetected` if the token was already processed
    /// - `AuthError::Storage` if sessions cannot be deleted
    pub async fn handle<R: SecurityRequest + ?Sized>(&self, request: &R) -> AuthResult<LogoutOutcome> {
        let source_addr = request.remote_addr().map(|addr| addr.ip().to_string());
        let Some(token) = request.form_value(LOGOUT_TOKEN_FIELD) else {
            self.count("invalid");
            tracing::warn!(source_addr = source_addr.as_deref().unwrap_or("-"), "logout request without logout_token");
            return Err(AuthError::invalid_credentials("missing logout_token"));
        };
        self.handle_token(token, source_addr.as_deref()).await
    }

    /// Processes a raw logout token.
    ///
    /// # Errors
    ///
    /// Same as [`handle`](Self::handle).
    pub async fn handle_token(
        &self,
        token: &str,
        source_addr: Option<&str>,
    ) -> AuthResult<LogoutOutcome> {
        let result = self.process(token, source_addr).await;
        match &result {
            Ok(_) => self.count("success"),
            Err(AuthError::ReplayDetected { .. }) => self.count("replay"),
            Err(err) if err.is_client_error() => self.count("invalid"),
            Err(_) => self.count("error"),
        }
        result
    }

    async fn process(&self, token: &str, source_addr: Option<&str>) -> AuthResult<LogoutOutcome> {
        let claims = self.validator.verify_signed(token).await?;
        check_logout_claims(&claims)?;

        let subject = string_claim(&claims, "sub").map(str::to_string);
        let sid = string_claim(&claims, "sid").map(str::to_string);
        let jti = string_claim(&claims, "jti").unwrap_or_default();
        let issuer = string_claim(&claims, "iss").unwrap_or_default();

        let mut entry = JtiEntry::new(jti, issuer);
        if let Some(subject) = &subject {
            entry = entry.with_subject(subject.clone());
        }
        if let Some(sid) = &sid {
            entry = entry.with_session_id(sid.clone());
        }
        if let Some(addr) = source_addr {
            entry = entry.with_source_addr(addr);
        }

        // The id must outlive every instant the token could still validate.
        let ttl = self
            .validator
            .acceptance_window(&claims)
            .unwrap_or(self.default_ttl);
        match self.tracker.check_and_store(entry, ttl).await {
            Ok(()) => {}
            Err(err @ AuthError::ReplayDetected { .. }) => return Err(err),
            Err(err) => {
                tracing::warn!(jti = %jti, error = %err, "replay tracker unavailable, continuing logout");
            }
        }

        let sessions_terminated = match (&sid, &subject) {
            (Some(sid), subject) => self.terminate_session(sid, subject.as_deref()).await?,
            (None, Some(subject)) => self.sessions.delete_by_user_id(subject).await?,
            (None, None) => 0,
        };

        tracing::info!(
            subject = subject.as_deref().unwrap_or("-"),
            sid = sid.as_deref().unwrap_or("-"),
            sessions_terminated,
            "back-channel logout processed"
        );
        emit(
            self.events.as_ref(),
            SecurityEvent::BackChannelLogout {
                subject: subject.clone(),
                session_id: sid.clone(),
                sessions_terminated,
            },
        );

        Ok(LogoutOutcome {
            subject,
            session_id: sid,
            sessions_terminated,
        })
    }

    /// Deletes the session identified by `sid`: either one of ours with that
    /// id, or the subject's sessions that recorded it as provider sid.
    async fn terminate_session(&self, sid: &str, subject: Option<&str>) -> AuthResult<usize> {
        match self.sessions.get(sid).await {
            Ok(session) => {
                if let Some(subject) = subject
                    && session.user_id != subject
                {
                    tracing::warn!(sid = %sid, "logout token subject does not own session");
                    return Ok(0);
                }
                self.sessions.delete(sid).await?;
                return Ok(1);
            }
            Err(err) if err.is_absent() => {}
            Err(err) => return Err(err),
        }

        let Some(subject) = subject else {
            return Ok(0);
        };
        let mut terminated = 0;
        for session in self.sessions.get_by_user_id(subject).await? {
            if session.metadata.get(PROVIDER_SID_KEY).map(String::as_str) == Some(sid) {
                self.sessions.delete(&session.id).await?;
                terminated += 1;
            }
        }
        Ok(terminated)
    }

    fn count(&self, outcome: &str) {
        self.metrics
            .increment_counter(names::BACKCHANNEL_LOGOUT_TOTAL, &[("outcome", outcome)]);
    }
}

/// Logout token rules on top of the shared signature and claim checks.
fn check_logout_claims(claims: &Claims) -> Result<(), TokenValidationError> {
    let declares_logout = claims
        .get("events")
        .and_then(Value::as_object)
        .is_some_and(|events| events.contains_key(BACKCHANNEL_LOGOUT_EVENT));
    if !declares_logout {
        return Err(TokenValidationError::InvalidLogoutToken("missing logout event"));
    }
    if string_claim(claims, "sub").is_none() && string_claim(claims, "sid").is_none() {
        return Err(TokenValidationError::InvalidLogoutToken("neither sub nor sid"));
    }
    if claims.contains_key("nonce") {
        return Err(TokenValidationError::InvalidLogoutToken("nonce present"));
    }
    if string_claim(claims, "jti").is_none_or(str::is_empty) {
        return Err(TokenValidationError::MissingClaim("jti"));
    }
    Ok(())
}
