//! DNS propagation checking for DNS-01 challenges
//!
//! Resolves the challenge record through ordinary DNS until it carries the
//! expected value. Polling is bounded by a timeout and stops early when the
//! cancellation token fires.

use std::fmt::Debug;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use async_trait::async_trait;
use hickory_resolver::config::{NameServerConfig, Protocol, ResolverConfig, ResolverOpts};
use hickory_resolver::error::ResolveErrorKind;
use hickory_resolver::TokioAsyncResolver;
use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use certman_config::PropagationSettings;

use crate::error::{CertmanError, CertmanResult};

/// Lookup failures; all are retried within the polling window
#[derive(Debug, Error)]
pub enum LookupError {
    #[error("no TXT records for '{0}'")]
    NoRecords(String),

    #[error("lookup of '{name}' failed: {message}")]
    Failed { name: String, message: String },
}

/// Resolves TXT records
#[async_trait]
pub trait TxtResolver: Send + Sync + Debug {
    /// All TXT values at `name`; multi-string records are concatenated
    async fn lookup_txt(&self, name: &str) -> Result<Vec<String>, LookupError>;
}

/// TXT resolver on hickory with caching disabled
#[derive(Debug)]
pub struct HickoryTxtResolver {
    resolver: TokioAsyncResolver,
}

impl HickoryTxtResolver {
    /// Query `nameservers` over UDP, or the system configuration when empty
    pub fn new(nameservers: &[IpAddr]) -> CertmanResult<Self> {
        let mut opts = ResolverOpts::default();
        opts.timeout = Duration::from_secs(5);
        opts.attempts = 3;
        opts.cache_size = 0; // every poll must reach the nameserver

        let resolver = if nameservers.is_empty() {
            let (config, _) = hickory_resolver::system_conf::read_system_conf().map_err(|e| {
                CertmanError::Configuration(format!("cannot read system resolver config: {}", e))
            })?;
            TokioAsyncResolver::tokio(config, opts)
        } else {
            let mut config = ResolverConfig::new();
            for ip in nameservers {
                config.add_name_server(NameServerConfig::new(
                    SocketAddr::new(*ip, 53),
                    Protocol::Udp,
                ));
            }
            TokioAsyncResolver::tokio(config, opts)
        };

        Ok(Self { resolver })
    }
}

#[async_trait]
impl TxtResolver for HickoryTxtResolver {
    async fn lookup_txt(&self, name: &str) -> Result<Vec<String>, LookupError> {
        match self.resolver.txt_lookup(name).await {
            Ok(records) => Ok(records
                .iter()
                .map(|record| {
                    record
                        .txt_data()
                        .iter()
                        .map(|data| String::from_utf8_lossy(data))
                        .collect::<String>()
                })
                .collect()),
            Err(e) => match e.kind() {
                ResolveErrorKind::NoRecordsFound { .. } => {
                    Err(LookupError::NoRecords(name.to_string()))
                }
                _ => Err(LookupError::Failed {
                    name: name.to_string(),
                    message: e.to_string(),
                }),
            },
        }
    }
}

/// Poll interval and overall patience
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PropagationPolicy {
    pub interval: Duration,
    pub timeout: Duration,
}

impl From<PropagationSettings> for PropagationPolicy {
    fn from(settings: PropagationSettings) -> Self {
        Self {
            interval: settings.check_interval(),
            timeout: settings.timeout(),
        }
    }
}

/// How a successful wait went
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PropagationOutcome {
    /// Lookups performed, including the successful one
    pub polls: u32,
    pub elapsed: Duration,
}

/// Poll `record` until one of its TXT values equals `expected`
///
/// The first lookup happens immediately. Lookup errors are logged and
/// retried; only the timeout or cancellation end the wait unsuccessfully.
pub async fn wait_for_record(
    resolver: &dyn TxtResolver,
    record: &str,
    expected: &str,
    policy: PropagationPolicy,
    cancel: &CancellationToken,
) -> CertmanResult<PropagationOutcome> {
    let start = Instant::now();
    let deadline = start + policy.timeout;
    let mut polls = 0u32;

    debug!(
        record = %record,
        timeout_secs = policy.timeout.as_secs(),
        "Waiting for DNS propagation"
    );

    loop {
        polls += 1;
        let remaining = deadline.saturating_duration_since(Instant::now());

        let lookup = tokio::select! {
            _ = cancel.cancelled() => return Err(CertmanError::Cancelled),
            result = tokio::time::timeout(remaining, resolver.lookup_txt(record)) => result,
        };

        match lookup {
            Ok(Ok(values)) if values.iter().any(|v| v == expected) => {
                let elapsed = start.elapsed();
                debug!(
                    record = %record,
                    polls,
                    elapsed_ms = elapsed.as_millis() as u64,
                    "DNS propagation confirmed"
                );
                return Ok(PropagationOutcome { polls, elapsed });
            }
            Ok(Ok(values)) => {
                trace!(record = %record, found = ?values, "Record not yet propagated");
            }
            Ok(Err(LookupError::NoRecords(_))) => {
                trace!(record = %record, "Record not yet visible");
            }
            Ok(Err(e)) => {
                warn!(record = %record, error = %e, "DNS lookup error, retrying");
            }
            Err(_) => {
                warn!(record = %record, "DNS lookup timed out, retrying");
            }
        }

        let now = Instant::now();
        if now >= deadline {
            return Err(CertmanError::DnsVerificationTimeout {
                record: record.to_string(),
                elapsed: now - start,
            });
        }

        let pause = policy.interval.min(deadline - now);
        tokio::select! {
            _ = cancel.cancelled() => return Err(CertmanError::Cancelled),
            _ = tokio::time::sleep(pause) => {}
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Resolver that returns the wrong value until poll `correct_from`
    #[derive(Debug)]
    pub(crate) struct ScriptedResolver {
        pub(crate) correct_from: u32,
        pub(crate) value: String,
        pub(crate) polls: AtomicU32,
        pub(crate) seen: Mutex<Vec<String>>,
    }

    impl ScriptedResolver {
        pub(crate) fn new(correct_from: u32, value: &str) -> Self {
            Self {
                correct_from,
                value: value.to_string(),
                polls: AtomicU32::new(0),
                seen: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl TxtResolver for ScriptedResolver {
        async fn lookup_txt(&self, name: &str) -> Result<Vec<String>, LookupError> {
            let poll = self.polls.fetch_add(1, Ordering::SeqCst) + 1;
            self.seen.lock().push(name.to_string());
            match poll {
                1 => Err(LookupError::NoRecords(name.to_string())),
                p if p >= self.correct_from => Ok(vec!["stale".to_string(), self.value.clone()]),
                _ => Ok(vec!["stale".to_string()]),
            }
        }
    }

    fn policy(interval_secs: u64, timeout_secs: u64) -> PropagationPolicy {
        PropagationPolicy {
            interval: Duration::from_secs(interval_secs),
            timeout: Duration::from_secs(timeout_secs),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_exactly_n_polls_before_success() {
        let resolver = ScriptedResolver::new(4, "expected");
        let outcome = wait_for_record(
            &resolver,
            "_acme-challenge.example.com",
            "expected",
            policy(5, 300),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

        assert_eq!(outcome.polls, 4);
        assert_eq!(resolver.polls.load(Ordering::SeqCst), 4);
        assert_eq!(outcome.elapsed, Duration::from_secs(15));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout() {
        let resolver = ScriptedResolver::new(u32::MAX, "expected");
        let err = wait_for_record(
            &resolver,
            "_acme-challenge.example.com",
            "expected",
            policy(5, 12),
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();

        assert!(matches!(err, CertmanError::DnsVerificationTimeout { .. }));
        // Polls at t=0, 5, 10 and a final one at the deadline
        assert_eq!(resolver.polls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_stops_polling() {
        let resolver = ScriptedResolver::new(u32::MAX, "expected");
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(7)).await;
            trigger.cancel();
        });

        let err = wait_for_record(&resolver, "r", "expected", policy(5, 300), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, CertmanError::Cancelled));
        assert_eq!(resolver.polls.load(Ordering::SeqCst), 2);
    }
}
