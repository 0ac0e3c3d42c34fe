//! Token primitives: random identifiers, PKCE and at-rest encryption.

pub mod encryption;
pub mod pkce;
pub mod random;

pub use encryption::{
    EncryptionError, TokenEncryptor, generate_encryption_key, looks_like_jwt,
};
pub use pkce::{PkceError, PkcePair};
pub use random::generate_token;
