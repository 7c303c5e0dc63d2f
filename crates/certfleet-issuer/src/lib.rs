//! Certificate issuance through an external ACME client
//!
//! certbot does the actual ACME work (DNS-01 through a provider plugin). This
//! crate only builds the invocation, enforces a timeout and turns the exit
//! code and captured output into an [`IssuanceOutcome`].

pub mod certbot;
pub mod outcome;

pub use certbot::CertbotIssuer;
pub use outcome::{classify, IssuanceOutcome, NOT_DUE_PREFIX};

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

/// Issuer errors
///
/// These cover cases where certbot never produced an exit status to classify.
#[derive(Debug, Error)]
pub enum IssuerError {
    #[error("Invalid domain: {0}")]
    InvalidDomain(String),

    #[error("Failed to spawn '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Issuance did not finish within {0:?}")]
    Timeout(Duration),
}

/// Something that can obtain a certificate for a single domain
#[async_trait]
pub trait CertificateIssuer: Send + Sync {
    /// Request (or renew) the certificate for `domain`
    async fn issue(&self, domain: &str) -> Result<IssuanceOutcome, IssuerError>;
}

/// Reject names certbot would refuse anyway, before spawning it
pub fn validate_domain(domain: &str) -> Result<(), IssuerError> {
    if domain.is_empty() {
        return Err(IssuerError::InvalidDomain(
            "Domain cannot be empty".to_string(),
        ));
    }

    if domain.contains(char::is_whitespace) {
        return Err(IssuerError::InvalidDomain(format!(
            "'{}' contains whitespace",
            domain
        )));
    }

    if domain.starts_with('.') || domain.ends_with('.') {
        return Err(IssuerError::InvalidDomain(format!(
            "'{}' starts or ends with a dot",
            domain
        )));
    }

    Ok(())
}
