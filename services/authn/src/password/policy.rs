//! Password strength scoring.
//!
//! Strength is estimated with zxcvbn rather than composition rules: length
//! and character-class requirements say little about guessability, while an
//! estimator catches dictionary words, keyboard walks, and — because the
//! candidate username is passed as user input — passwords resembling the
//! account's own identifier.

use crate::error::{Result, ServiceError};
use zxcvbn::zxcvbn;

#[derive(Clone, Copy)]
pub struct PasswordPolicy {
    minimum_score: u8,
}

impl PasswordPolicy {
    #[must_use]
    pub fn new(minimum_score: u8) -> Self {
        Self { minimum_score }
    }

    /// Score a candidate password from 0 (trivially guessable) to 4.
    #[must_use]
    pub fn score(&self, password: &str, user_inputs: &[&str]) -> u8 {
        // A blank password is the only input zxcvbn refuses; treat it as
        // the weakest possible score.
        zxcvbn(password, user_inputs).map_or(0, |entropy| entropy.score())
    }

    /// Reject passwords scoring below the configured minimum.
    ///
    /// # Errors
    ///
    /// Returns [`ServiceError::InsecurePassword`] for scores below the
    /// minimum.
    pub fn validate(&self, password: &str, user_inputs: &[&str]) -> Result<()> {
        if self.score(password, user_inputs) < self.minimum_score {
            return Err(ServiceError::InsecurePassword);
        }
        Ok(())
    }
}
