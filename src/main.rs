//! Fleet PKI command line
//!
//! `fleet-pki renew` runs one renewal pass over the configured devices and
//! broker; `fleet-pki inspect` prints certificate metadata. Intended to be
//! run by an operator or a scheduler (cron, systemd timer).

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use fleet_pki::configs::AppConfig;
use fleet_pki::inspect::{self, InspectEntry};
use fleet_pki::renewal::{self, IdentityOutcome};
use fleet_pki::storage::CertStore;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "fleet-pki", version, about = "Root CA and certificate renewal for a device fleet")]
struct Cli {
    /// TOML configuration file (built-in defaults when omitted)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Override the certificate output directory
    #[arg(long, global = true)]
    certs_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Issue missing or expiring certificates (default)
    Renew {
        /// Override the renewal threshold in days
        #[arg(long)]
        threshold_days: Option<u32>,
    },
    /// Print certificate metadata for the root and every identity
    Inspect {
        /// Emit JSON instead of text
        #[arg(long)]
        json: bool,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("fleet_pki=info")),
        )
        .init();

    let cli = Cli::parse();
    let mut config = AppConfig::load_or_default(cli.config.as_deref())?;
    if let Some(dir) = cli.certs_dir {
        config.certs_dir = dir;
    }

    match cli.command.unwrap_or(Command::Renew {
        threshold_days: None,
    }) {
        Command::Renew { threshold_days } => {
            if let Some(days) = threshold_days {
                config.expiry_threshold_days = days;
            }
            renew(&config)
        }
        Command::Inspect { json } => print_inspection(&config, json),
    }
}

fn renew(config: &AppConfig) -> Result<()> {
    let report = renewal::run(config).context("Renewal run failed")?;

    println!("Root CA: {} (serial {})", report.root, report.root_serial);
    for identity in &report.identities {
        match &identity.outcome {
            IdentityOutcome::Issued { reason, serial } => {
                println!("✓ {} ({}): issued, {} (serial {})", identity.name, identity.role, reason, serial)
            }
            IdentityOutcome::Current { remaining_days } => println!(
                "✓ {} ({}): current, {} days remaining",
                identity.name, identity.role, remaining_days
            ),
            IdentityOutcome::Failed { error } => {
                println!("✗ {} ({}): failed: {}", identity.name, identity.role, error)
            }
        }
    }
    println!("Certificates written to '{}'", config.certs_dir.display());

    let failed: Vec<&str> = report.failures().map(|r| r.name.as_str()).collect();
    if !failed.is_empty() {
        anyhow::bail!("{} identities failed: {}", failed.len(), failed.join(", "));
    }
    Ok(())
}

fn print_inspection(config: &AppConfig, json: bool) -> Result<()> {
    let store = CertStore::new(&config.certs_dir);
    let entries = inspect::inspect_all(&store, config);

    if json {
        let out = serde_json::to_string_pretty(&entries).context("Failed to serialize metadata")?;
        println!("{}", out);
        return Ok(());
    }

    for entry in &entries {
        match entry {
            InspectEntry::Ok(info) => {
                println!("== {} ({})", info.identity, info.path.display());
                println!("   Subject:   {}", info.subject);
                println!("   Issuer:    {}", info.issuer);
                println!("   Serial:    {}", info.serial);
                println!("   Valid:     {} .. {}", info.not_before, info.not_after);
                println!("   Remaining: {} days", info.remaining_days);
                if !info.san.is_empty() {
                    println!("   SAN:       {}", info.san.join(", "));
                }
            }
            InspectEntry::Error {
                identity,
                path,
                error,
            } => println!("== {} ({}): {}", identity, path.display(), error),
        }
    }
    Ok(())
}
