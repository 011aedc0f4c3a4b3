//! Authentication and authorization
//!
//! The pipeline: a bearer JWT is verified against the key store, the
//! realm registry maps its realm/scope claims to a 64-bit authorization
//! word, and the grant table tracks the shared expiry state of every
//! stream the token admitted.

mod grants;
mod keys;
mod realms;
mod verify;

pub use grants::{AccessGrant, GrantTable, SharedGrant};
pub use keys::{Key, KeyStore, KeyStoreError};
pub use realms::{
    realm_index, Realms, MAX_REALMS, MAX_SCOPES_PER_REALM, NO_AUTHORIZATION, REALM_MASK,
    SCOPE_MASK,
};
pub use verify::{Claims, TokenVerifier, VerifiedToken};
