//! DNS-01 challenge support
//!
//! - [`DnsProvider`] writes and removes challenge records
//! - [`TxtResolver`] observes them through ordinary resolution
//! - [`Dns01Challenger`] ties the two together for one domain at a time

mod challenge;
pub mod memory;
mod propagation;
mod provider;

pub use challenge::{ChallengeRecord, Dns01Challenger};
pub use memory::MemoryZone;
pub use propagation::{
    wait_for_record, HickoryTxtResolver, LookupError, PropagationOutcome, PropagationPolicy,
    TxtResolver,
};
pub use provider::{
    challenge_record_fqdn, dns01_value, normalize_domain, DnsProvider, DnsProviderError,
    DnsResult, ACME_CHALLENGE_RECORD,
};
