//! Credential issuance: session pairs and password-reset tokens.

pub mod reset;
pub mod session;

pub use reset::{RESET_AUDIENCE, ResetIssuer};
pub use session::{Session, SessionIssuer};
