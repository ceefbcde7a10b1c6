//! natfwd - IPv4 NAT port forwarding for nftables
//!
//! # Usage
//!
//! ```bash
//! natfwd list                              # Show stored rules with their indices
//! natfwd add tcp 8080 192.168.1.10 80      # Store and apply a forward
//! natfwd remove 0                          # Remove the rule at index 0
//! natfwd apply                             # Rebuild live state from the rule file (boot)
//! natfwd flush                             # Clear live state, keep the rule file
//! natfwd export --format nft               # Print the ruleset natfwd would install
//! natfwd history -n 20                     # Show recent audit events
//! natfwd config --save                     # Write the effective config to disk
//! ```

use clap::{Parser, Subcommand, ValueEnum};
use natfwd::audit::AuditLog;
use natfwd::config::{self, AppConfig};
use natfwd::core::error::{Error, NftablesErrorPattern};
use natfwd::{NftFilter, PortForwarder, RuleStore};
use std::path::PathBuf;
use std::process::ExitCode;

shadow_rs::shadow!(build);

#[derive(Parser)]
#[command(name = "natfwd")]
#[command(about = "IPv4 NAT port forwarding for nftables", long_about = None)]
#[command(version = build::PKG_VERSION, long_version = build::CLAP_LONG_VERSION)]
struct Cli {
    /// Config file (default: <config dir>/config.json)
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,
    /// Rule file, overriding the config
    #[arg(long, global = true, value_name = "PATH")]
    rules: Option<PathBuf>,
    /// Log debug output to stderr instead of the log file
    #[arg(short, long, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List stored forwarding rules
    List,
    /// Add a forwarding rule and apply it
    Add {
        /// tcp or udp
        protocol: String,
        /// Port on this host to forward
        external_port: String,
        /// IPv4 destination address
        host: String,
        /// Port on the destination host
        port: String,
    },
    /// Remove the rule at INDEX (as shown by `list`)
    Remove { index: usize },
    /// Flush live state and re-apply every stored rule
    Apply,
    /// Remove all live forwarding, leaving the rule file untouched
    Flush,
    /// Print the ruleset for the stored rules without applying it
    Export {
        #[arg(short, long, value_enum, default_value_t = ExportFormat::Nft)]
        format: ExportFormat,
    },
    /// Show recent audit log entries, newest first
    History {
        #[arg(short = 'n', long, default_value_t = 10)]
        count: usize,
    },
    /// Print the effective configuration
    Config {
        /// Also write it to the config file
        #[arg(long)]
        save: bool,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum ExportFormat {
    Nft,
    Json,
}

fn init_logging(verbose: bool) {
    if verbose {
        tracing_subscriber::fmt()
            .with_writer(std::io::stderr)
            .with_max_level(tracing::Level::DEBUG)
            .init();
        return;
    }

    // Quiet by default: the terminal gets printed results, the file gets the log
    if let Some(mut log_path) = natfwd::utils::get_state_dir() {
        log_path.push("natfwd.log");
        if let Ok(file) = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_path)
        {
            tracing_subscriber::fmt()
                .with_writer(file)
                .with_ansi(false)
                .init();
            return;
        }
    }
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_max_level(tracing::Level::WARN)
        .init();
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    if let Err(e) = natfwd::utils::ensure_dirs() {
        eprintln!("Warning: cannot create natfwd directories: {e}");
    }
    init_logging(cli.verbose);

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("Error: failed to start async runtime: {e}");
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(handle_cli(cli)) {
        Ok(code) => code,
        Err(e) => {
            report_error(&e);
            ExitCode::FAILURE
        }
    }
}

fn report_error(error: &Error) {
    eprintln!("Error: {error}");
    if let Some(stderr) = error.nft_stderr() {
        let translation = NftablesErrorPattern::match_error(stderr);
        eprintln!("  {}", translation.user_message);
        for suggestion in &translation.suggestions {
            eprintln!("  - {suggestion}");
        }
        if let Some(url) = &translation.help_url {
            eprintln!("  See: {url}");
        }
    }
}

async fn open_forwarder(
    config: &AppConfig,
    rules_override: Option<PathBuf>,
) -> natfwd::Result<PortForwarder<NftFilter>> {
    let rules_path = rules_override
        .or_else(|| config.rules_path())
        .ok_or_else(|| Error::Internal("cannot determine rule file location".to_string()))?;

    let store = RuleStore::open(rules_path).await?;
    let filter = NftFilter::new(config.table.clone(), config.nft_timeout());
    let forwarder = PortForwarder::new(store, filter);

    if !config.audit {
        return Ok(forwarder);
    }
    match AuditLog::new() {
        Ok(audit) => Ok(forwarder.with_audit(audit)),
        Err(e) => {
            tracing::warn!("Audit log unavailable: {e}");
            Ok(forwarder)
        }
    }
}

fn note_elevation() {
    if !nix::unistd::getuid().is_root() {
        println!("Note: not running as root. Will use sudo/run0/pkexec for nft.");
    }
}

async fn handle_cli(cli: Cli) -> natfwd::Result<ExitCode> {
    let config = config::load_config(cli.config.as_deref()).await;

    match cli.command {
        Commands::List => {
            let forwarder = open_forwarder(&config, cli.rules).await?;
            let rules = forwarder.list_rules();
            if rules.is_empty() {
                println!("No forwarding rules in {}", forwarder.store().path().display());
            }
            for (index, rule) in rules {
                println!("{index:>4}  {rule}");
            }
        }
        Commands::Add {
            protocol,
            external_port,
            host,
            port,
        } => {
            let mut forwarder = open_forwarder(&config, cli.rules).await?;
            note_elevation();
            let rule = forwarder
                .add_rule(&protocol, &external_port, &host, &port)
                .await?;
            println!("✓ Forwarding {rule}");
        }
        Commands::Remove { index } => {
            let mut forwarder = open_forwarder(&config, cli.rules).await?;
            note_elevation();
            let rule = forwarder.remove_rule(index).await?;
            println!("✓ Removed {rule}");
        }
        Commands::Apply => {
            let forwarder = open_forwarder(&config, cli.rules).await?;
            note_elevation();
            let report = forwarder.apply_all().await?;
            println!("Applied {} of {} rule(s).", report.applied, report.total());
            if !report.is_success() {
                for failure in &report.failures {
                    eprintln!("✗ Rule {} [{}]:", failure.index, failure.rule);
                    report_error(&failure.error);
                }
                return Ok(ExitCode::FAILURE);
            }
        }
        Commands::Flush => {
            let forwarder = open_forwarder(&config, cli.rules).await?;
            note_elevation();
            forwarder.flush_live().await?;
            println!(
                "✓ Table ip {} cleared. Run `natfwd apply` to restore.",
                forwarder.filter().table()
            );
        }
        Commands::Export { format } => {
            let forwarder = open_forwarder(&config, cli.rules).await?;
            let rules = forwarder.store().rules();
            match format {
                ExportFormat::Nft => print!("{}", forwarder.filter().ruleset_text(rules)),
                ExportFormat::Json => println!(
                    "{}",
                    serde_json::to_string_pretty(&forwarder.filter().ruleset_json(rules))?
                ),
            }
        }
        Commands::History { count } => {
            let audit = AuditLog::new()?;
            let events = match audit.read_recent(count).await {
                Ok(events) => events,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
                Err(e) => return Err(e.into()),
            };
            if events.is_empty() {
                println!("No audit events in {}", audit.path().display());
            }
            for event in events {
                let status = if event.success { "ok" } else { "FAILED" };
                let event_type = serde_json::to_value(event.event_type)?;
                println!(
                    "{}  {:<11} {:<6} {}",
                    event.timestamp.format("%Y-%m-%d %H:%M:%S"),
                    event_type.as_str().unwrap_or_default(),
                    status,
                    event.details
                );
                if let Some(error) = event.error {
                    println!("    {error}");
                }
            }
        }
        Commands::Config { save } => {
            let mut effective = config;
            if let Some(rules) = cli.rules {
                effective.rules_file = Some(rules);
            }
            println!("{}", serde_json::to_string_pretty(&effective)?);
            if save {
                let path = cli
                    .config
                    .or_else(config::default_config_path)
                    .ok_or_else(|| Error::Internal("cannot determine config location".into()))?;
                config::save_config(&effective, &path).await?;
                println!("✓ Saved to {}", path.display());
            }
        }
    }
    Ok(ExitCode::SUCCESS)
}
