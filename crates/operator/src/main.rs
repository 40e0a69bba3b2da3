//! Certman - Main entry point
//!
//! Offline tooling around the certificate lifecycle engine: configuration
//! checks, request planning, renewal evaluation and live drift checks.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use certman_common::{OwnerId, RequestName};
use certman_config::OperatorConfig;
use certman_operator::{
    desired_requests, CertificateRequest, CertificateRequestSpec, CertificateValidator,
    ClusterTopology, DomainCheck, FileSecretStore, ObjectRef, PrometheusSink, RenewalEvaluator,
    RustlsFetcher,
};

/// Certman - certificate lifecycle operator for cluster fleets
#[derive(Parser, Debug)]
#[command(name = "certman")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Configuration file path
    #[arg(short = 'c', long = "config", env = "CERTMAN_CONFIG", global = true)]
    config: Option<String>,

    /// Enable verbose logging (debug level)
    #[arg(long = "verbose", global = true)]
    verbose: bool,

    /// Log output format
    #[arg(long = "log-format", value_enum, default_value_t = LogFormat::Text, global = true)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Validate configuration file and exit
    Test,
    /// Print the certificate requests a cluster topology yields
    Plan {
        /// Cluster topology as JSON
        #[arg(long = "topology")]
        topology: PathBuf,
    },
    /// Evaluate whether a stored certificate is due for renewal
    Renewal {
        /// Directory of the file-backed secret store
        #[arg(long = "secrets")]
        secrets: PathBuf,
        /// Namespace of the certificate secret
        #[arg(long = "namespace")]
        namespace: String,
        /// Name of the certificate secret
        #[arg(long = "secret")]
        secret: String,
        /// Renewal threshold in days; defaults to the configured value
        #[arg(long = "renew-before-days")]
        renew_before_days: Option<i64>,
        /// Base domain used to label the days-remaining metric
        #[arg(long = "base-domain", default_value = "")]
        base_domain: String,
        /// Print the resulting Prometheus metrics
        #[arg(long = "metrics")]
        metrics: bool,
    },
    /// Compare a stored certificate with the ones served by its domains
    Drift {
        /// Directory of the file-backed secret store
        #[arg(long = "secrets")]
        secrets: PathBuf,
        /// Namespace of the certificate secret
        #[arg(long = "namespace")]
        namespace: String,
        /// Name of the certificate secret
        #[arg(long = "secret")]
        secret: String,
        /// TLS port to dial; defaults to the configured value
        #[arg(long = "port")]
        port: Option<u16>,
        /// Domains expected to serve the certificate
        #[arg(required = true)]
        domains: Vec<String>,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Test => test_config(cli.config.as_deref()),
        command => {
            init_logging(cli.verbose, cli.log_format);
            let config = load_config(cli.config.as_deref())?;

            let runtime = tokio::runtime::Runtime::new()?;
            runtime.block_on(run_command(command, config))
        }
    }
}

/// Test configuration file and exit
fn test_config(config_path: Option<&str>) -> Result<()> {
    // Initialize minimal logging for config test
    tracing_subscriber::fmt()
        .with_target(false)
        .with_level(true)
        .init();

    let config = load_config(config_path)?;

    info!("Configuration test successful:");
    info!("  - namespace: {}", config.operator.namespace);
    info!(
        "  - CA environment: {}",
        if config.acme.staging { "staging" } else { "production" }
    );
    info!("  - {} nameserver(s)", config.dns.nameservers.len());

    for warning in config.validate_all().warnings {
        warn!("{}", warning.message);
    }

    println!(
        "certman: configuration file {} test is successful",
        config_path.unwrap_or("(embedded)")
    );

    Ok(())
}

fn init_logging(verbose: bool, format: LogFormat) {
    let log_level = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    match format {
        LogFormat::Text => tracing_subscriber::fmt().with_env_filter(filter).init(),
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init(),
    }
}

fn load_config(config_path: Option<&str>) -> Result<OperatorConfig> {
    let config = match config_path {
        Some(path) => {
            info!("Loading configuration from: {}", path);
            OperatorConfig::from_file(path).context("Failed to load configuration file")?
        }
        None => {
            info!("No configuration specified, using embedded default configuration");
            OperatorConfig::default_embedded().context("Failed to load embedded configuration")?
        }
    };
    config
        .ensure_valid()
        .context("Configuration validation failed")?;
    Ok(config)
}

async fn run_command(command: Commands, config: OperatorConfig) -> Result<()> {
    match command {
        // Already validated by load_config
        Commands::Test => Ok(()),
        Commands::Plan { topology } => plan(&topology, &config),
        Commands::Renewal {
            secrets,
            namespace,
            secret,
            renew_before_days,
            base_domain,
            metrics,
        } => {
            let request = secret_request(&namespace, &secret, &base_domain, Vec::new());
            let request = CertificateRequest {
                spec: CertificateRequestSpec {
                    renew_before_days: renew_before_days.unwrap_or_default(),
                    ..request.spec
                },
                ..request
            };
            renewal(&secrets, request, &config, metrics).await
        }
        Commands::Drift {
            secrets,
            namespace,
            secret,
            port,
            domains,
        } => {
            let request = secret_request(&namespace, &secret, "", domains);
            drift(&secrets, request, &config, port).await
        }
    }
}

fn plan(path: &Path, config: &OperatorConfig) -> Result<()> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read topology file {}", path.display()))?;
    let topology: ClusterTopology = serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse topology file {}", path.display()))?;

    if !topology.is_managed(&config.operator.managed_label) {
        warn!(
            cluster = %topology.name,
            label = %config.operator.managed_label,
            "Cluster is not managed; the operator would leave it alone"
        );
    }

    let desired = desired_requests(&topology, &config.operator.default_notification_email);
    let skipped: Vec<_> = desired
        .skipped
        .iter()
        .map(|s| serde_json::json!({ "bundle": s.bundle, "reason": s.reason }))
        .collect();
    let output = serde_json::json!({
        "requests": desired.requests,
        "skipped": skipped,
    });
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

async fn renewal(
    secrets: &Path,
    request: CertificateRequest,
    config: &OperatorConfig,
    print_metrics: bool,
) -> Result<()> {
    let store = Arc::new(FileSecretStore::open(secrets).await?);
    let sink = Arc::new(PrometheusSink::new()?);
    let evaluator = RenewalEvaluator::new(store, sink.clone(), config.operator.renew_before_days);

    let decision = evaluator
        .should_renew(&request)
        .await
        .context("Renewal evaluation failed")?;

    println!("secret:         {}", request.spec.certificate_secret);
    println!("renew:          {}", decision.renew);
    println!("reason:         {:?}", decision.reason);
    match decision.days_remaining {
        Some(days) => println!("days remaining: {}", days),
        None => println!("days remaining: unknown"),
    }
    println!("threshold:      {}", decision.threshold);

    if print_metrics {
        print!("{}", sink.gather_text()?);
    }
    Ok(())
}

async fn drift(
    secrets: &Path,
    request: CertificateRequest,
    config: &OperatorConfig,
    port: Option<u16>,
) -> Result<()> {
    let store = Arc::new(FileSecretStore::open(secrets).await?);
    let validator = CertificateValidator::new(
        Arc::new(RustlsFetcher::new()?),
        store,
        port.unwrap_or(config.validation.port),
        Duration::from_secs(config.validation.dial_timeout_secs),
    );

    let report = validator
        .check(&request)
        .await
        .context("Drift check failed")?;

    println!("stored serial: {}", report.stored_serial);
    for domain in &report.domains {
        match &domain.check {
            DomainCheck::Match => println!("  {:<40} match", domain.domain),
            DomainCheck::Mismatch { live_serial } => {
                println!("  {:<40} MISMATCH (serving {})", domain.domain, live_serial)
            }
            DomainCheck::Unreachable { message } => {
                println!("  {:<40} unreachable: {}", domain.domain, message)
            }
        }
    }

    if !report.is_consistent() {
        anyhow::bail!(
            "{} domain(s) mismatched, {} unreachable",
            report.mismatched().count(),
            report.unreachable().count()
        );
    }
    Ok(())
}

/// Ad-hoc request pointing at one stored secret
fn secret_request(
    namespace: &str,
    secret: &str,
    base_domain: &str,
    dns_names: Vec<String>,
) -> CertificateRequest {
    let secret_ref = ObjectRef::new(namespace, secret);
    CertificateRequest::new(
        namespace,
        RequestName::from_string(secret),
        OwnerId::from("certman-cli"),
        CertificateRequestSpec {
            acme_dns_domain: base_domain.to_string(),
            dns_names,
            email: String::new(),
            certificate_secret: secret_ref.clone(),
            dns_credentials: secret_ref,
            renew_before_days: 0,
            api_url: None,
            web_console_url: None,
        },
    )
}
