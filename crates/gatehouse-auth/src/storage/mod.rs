//! Storage for the engine's short-lived security records.
//!
//! Everything sits on one capability, [`RecordStore`]: a TTL-keyed JSON
//! record store. The typed stores here give it meaning:
//!
//! | Store | Prefix | Semantics |
//! |-------|--------|-----------|
//! | [`StateStore`] | `state:` | single-use authorization state |
//! | [`SessionStore`] | `session:` | server-side sessions |
//! | [`JtiTracker`] | `jti:` | replay ledger |
//!
//! The CSRF ledger (`csrf:`) and lockout entries (`lockout:user:`,
//! `lockout:ip:`) live in [`crate::security`].
//!
//! Durable backends are provided in separate crates:
//! - `gatehouse-auth-postgres` - PostgreSQL backend

#[cfg(any(test, feature = "test-support"))]
pub mod conformance;
pub mod jti;
pub mod memory;
pub mod record;
pub mod session;
pub mod state;

pub use jti::{JtiEntry, JtiTracker};
pub use memory::MemoryRecordStore;
pub use record::{RecordStore, StoredRecord, expiry_after, remaining_until};
pub use session::{PROVIDER_SID_KEY, Session, SessionStore};
pub use state::{AuthorizationState, StateStore};
