//! # gatehouse-auth
//!
//! Zero-trust authentication and session-security engine.
//!
//! This crate provides:
//! - OpenID Connect login with PKCE, nonce and single-use state
//! - ID token validation against a rotating, cached key set
//! - Server-side sessions with sliding expiry and encrypted provider tokens
//! - Back-channel logout with replay protection
//! - CSRF double-submit protection and login lockout
//! - Asynchronous security events and metrics
//!
//! ## Modules
//!
//! - [`config`] - Engine configuration
//! - [`error`] - Error taxonomy and HTTP mapping
//! - [`events`] - Security event queue
//! - [`federation`] - OIDC discovery, key cache, validation and flows
//! - [`http`] - Request view and response mapping for the host's router
//! - [`metrics`] - Metrics sink and metric names
//! - [`security`] - CSRF guard and lockout manager
//! - [`storage`] - TTL record store and the typed stores built on it
//! - [`tasks`] - Periodic background jobs
//! - [`token`] - Random tokens, PKCE and token encryption

pub mod config;
pub mod error;
pub mod events;
pub mod federation;
pub mod http;
pub mod metrics;
pub mod security;
pub mod storage;
pub mod tasks;
pub mod token;

pub use config::{AuthConfig, ConfigError};
pub use error::{AuthError, AuthResult, ErrorCategory};
pub use events::{EventHandler, EventQueue, LoggingEventHandler, SecurityEvent};
pub use federation::{
    AuthMethod, BackChannelLogout, IdTokenValidator, Identity, KeyCache, LogoutOutcome, OidcFlow,
    TokenResult, TokenSet,
};
pub use http::{RequestSnapshot, SecurityRequest};
pub use metrics::{MetricsFacade, MetricsSink, NoopMetrics};
pub use security::{CsrfGuard, CsrfOutcome, LockoutManager, LockoutStatus, LockoutSubject};
pub use storage::{
    JtiTracker, MemoryRecordStore, RecordStore, Session, SessionStore, StateStore,
};
pub use tasks::CleanupHandle;
pub use token::{PkcePair, TokenEncryptor};

/// Prelude module for convenient imports.
///
/// ```ignore
/// use gatehouse_auth::prelude::*;
/// ```
pub mod prelude {
    pub use crate::config::{AuthConfig, ConfigError};
    pub use crate::error::{AuthError, AuthResult, ErrorCategory};
    pub use crate::events::{EventHandler, EventQueue, SecurityEvent};
    pub use crate::federation::{
        AuthMethod, BackChannelLogout, IdTokenValidator, Identity, KeyCache, OidcFlow,
        TokenResult,
    };
    pub use crate::http::{RequestSnapshot, SecurityRequest};
    pub use crate::metrics::MetricsSink;
    pub use crate::security::{CsrfGuard, CsrfOutcome, LockoutManager, LockoutSubject};
    pub use crate::storage::{
        JtiTracker, MemoryRecordStore, RecordStore, Session, SessionStore, StateStore,
    };
    pub use crate::token::TokenEncryptor;
}
