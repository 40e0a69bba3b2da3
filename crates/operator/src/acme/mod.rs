//! ACME certificate issuance over DNS-01
//!
//! # Architecture
//!
//! - [`AcmeProtocol`] - Seam to the certificate authority; [`InstantAcmeProtocol`]
//!   talks to Let's Encrypt
//! - [`AccountRegistry`] - One persisted CA account per environment, with
//!   contact changes pushed to the CA before they are stored
//! - [`Dns01Challenger`] - Publishes challenge records and confirms them in DNS
//! - [`CertificateIssuer`] - Runs the whole workflow for one request
//!
//! # Challenge Flow
//!
//! 1. [`CertificateIssuer`] opens an order for every domain of the request
//! 2. For each pending authorization the CA supplies a DNS-01 token
//! 3. [`Dns01Challenger`] writes `_acme-challenge.<domain>` with the digest
//!    of the key authorization
//! 4. The record is resolved until the expected value is seen
//! 5. Only then is the CA asked to validate
//! 6. Once every authorization is valid the order is finalized with a fresh
//!    key and the chain is written to the target secret

mod account;
mod account_update;
mod client;
pub mod dns;
mod issuer;
#[cfg(test)]
pub(crate) mod mock;
mod protocol;

pub use account::{AccountRegistry, ACCOUNT_FIELD};
pub use client::{directory_url, InstantAcmeProtocol};
pub use dns::{Dns01Challenger, DnsProvider, MemoryZone, PropagationPolicy, TxtResolver};
pub use issuer::{CertificateIssuer, IssuanceOutcome, IssuanceState, IssuerSettings};
pub use protocol::{
    AccountRecord, AcmeAccount, AcmeOrder, AcmeProtocol, Authorization, AuthorizationStatus,
    CaEnvironment, Challenge, ChallengeKind, ChallengeStatus,
};
