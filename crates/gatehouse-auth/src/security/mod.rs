//! Request-level guards: CSRF double-submit and login lockout.

pub mod csrf;
pub mod lockout;

pub use csrf::{CsrfError, CsrfGuard, CsrfOutcome};
pub use lockout::{LockoutEntry, LockoutManager, LockoutStatus, LockoutSubject};
