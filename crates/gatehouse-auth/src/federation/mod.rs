//! External identity provider federation.
//!
//! - OpenID Connect discovery
//! - JWK set fetching, caching and rotation tracking
//! - ID token validation and identity mapping
//! - Authorization code flow with PKCE and nonce
//! - Back-channel logout

pub mod backchannel;
pub mod discovery;
pub mod error;
pub mod flow;
pub mod identity;
pub mod jwks;
pub mod validator;

pub use backchannel::{BackChannelLogout, LogoutOutcome};
pub use discovery::{ProviderMetadata, discover};
pub use error::{JwksError, OidcError, TokenValidationError};
pub use flow::{Endpoints, OidcFlow, TokenResult, TokenSet};
pub use identity::{AuthMethod, Identity};
pub use jwks::{KeyCache, KeyRotation};
pub use validator::{Claims, IdTokenValidator};

use crate::config::OidcConfig;
use crate::error::{AuthError, AuthResult};

/// Builds the HTTP client used for provider calls.
///
/// Every request made with it is bounded by `request_timeout`.
///
/// # Errors
///
/// Returns `AuthError::Configuration` if the client cannot be built.
pub fn build_http_client(config: &OidcConfig) -> AuthResult<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(config.request_timeout)
        .user_agent(concat!("gatehouse-auth/", env!("CARGO_PKG_VERSION")))
        .build()
        .map_err(|e| AuthError::configuration(format!("failed to build HTTP client: {e}")))
}
