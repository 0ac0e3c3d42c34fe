//! Boundary with the host's HTTP layer.
//!
//! - [`request`] - the `SecurityRequest` view the guards read from
//! - [`response`] - `IntoResponse` for `AuthError`

pub mod request;
pub mod response;

pub use request::{RequestSnapshot, SecurityRequest};
