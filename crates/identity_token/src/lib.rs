//! Token formats for the authentication service.
//!
//! Two wire formats live here:
//!
//! - **Identity (access) tokens**: RS256-signed JWTs consumed by application
//!   backends. The signing keypair rotates, so verification accepts any key
//!   published in the current [`jwks::Jwks`] and dispatches on the header
//!   `kid`.
//! - **Password-reset tokens**: HS256-signed JWTs bound to the account's
//!   current password hash. They are verified with a single derived secret
//!   and carry no `kid`.
//!
//! The crate deliberately avoids a general-purpose JWT dependency: the two
//! formats above are the only ones the service speaks, and keeping the
//! encoding explicit keeps the validation order auditable.

pub mod jwks;
pub mod jwt;

pub use jwks::{Jwk, Jwks};
pub use jwt::{
    Error, IdentityClaims, ResetClaims, parse_rsa_private_key, sign_hs256, sign_rs256,
    verify_hs256, verify_rs256,
};
