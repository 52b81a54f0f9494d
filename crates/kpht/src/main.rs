//! kpht - Command line client for KeePassXC's browser integration.
//!
//! kpht connects to a running KeePassXC the way the browser extension does
//! and fetches the entries tagged with the script indicator URL
//! (`script://keepassxc.go` by default).
//!
//! # Usage
//!
//! ```bash
//! # Print the password of the single entry whose name contains "vpn" and "work"
//! kpht clip vpn work | wl-copy
//!
//! # Print the login instead
//! kpht clip -l vpn work
//!
//! # List the matching entries
//! kpht list vpn
//!
//! # Show an example config file
//! kpht config > ~/.config/kpht/config.toml
//! ```
//!
//! The selected value is written to stdout without a trailing newline so it
//! can be piped into a clipboard tool. Prompts, status and logs go to stderr.

use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand};
use tracing::debug;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use zeroize::Zeroizing;

use kpht_core::{
    format_keys, ClientOptions, Config, ConfigIdentityStore, CredentialSet, ProtocolClient,
    Selector,
};

/// Example configuration printed by `kpht config`.
const EXAMPLE_CONFIG: &str = include_str!("../kpht.example.toml");

/// A command line client to interact with KeePassXC's browser integration.
#[derive(Parser)]
#[command(name = "kpht")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Path to config file [default: ~/.config/kpht/config.toml]
    #[arg(short, long, value_name = "PATH", global = true)]
    config: Option<PathBuf>,

    /// Increase log verbosity (-v = debug, -vv = trace)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,

    /// Only show errors
    #[arg(short, long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print a value of one entry to stdout
    Clip {
        /// Keep only entries whose name contains all of these
        #[arg(value_name = "NAMEFILTER")]
        filters: Vec<String>,

        #[command(flatten)]
        field: FieldFlags,
    },

    /// List matching entries
    #[command(alias = "ls")]
    List {
        /// Keep only entries whose name contains all of these
        #[arg(value_name = "NAMEFILTER")]
        filters: Vec<String>,
    },

    /// Print an example config to stdout
    ///
    /// The [assoc] table is created and saved automatically on the first
    /// connection to the database.
    Config,
}

/// Override the configured value to copy.
#[derive(Args, Debug, Default)]
#[group(multiple = false)]
struct FieldFlags {
    /// Copy the login instead of the configured field
    #[arg(short, long)]
    login: bool,

    /// Copy the password instead of the configured field
    #[arg(short, long)]
    password: bool,

    /// Copy the TOTP code instead of the configured field
    #[arg(short, long)]
    totp: bool,

    /// Copy the uuid instead of the configured field
    #[arg(short, long)]
    uuid: bool,
}

impl FieldFlags {
    /// The field named by a flag, if any was given.
    fn selected(&self) -> Option<&'static str> {
        if self.totp {
            Some("totp")
        } else if self.password {
            Some("password")
        } else if self.login {
            Some("login")
        } else if self.uuid {
            Some("uuid")
        } else {
            None
        }
    }
}

fn setup_logging(level: &str) {
    // RUST_LOG wins over the command line flags
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    // stdout carries the copied value, so logs go to stderr
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(io::stderr).with_target(false))
        .with(filter)
        .init();
}

fn log_level(verbose: u8, quiet: bool) -> &'static str {
    if quiet {
        "error"
    } else {
        match verbose {
            0 => "warn",
            1 => "debug",
            _ => "trace",
        }
    }
}

/// Resolve the config path: the flag, or the default location.
fn config_path(flag: Option<PathBuf>) -> Result<PathBuf> {
    match flag {
        Some(path) => Ok(path),
        None => Config::default_path()
            .context("Cannot determine the config directory, use --config"),
    }
}

/// Connect to KeePassXC and fetch the entries for the script indicator URL.
fn fetch_logins(config: &Config, path: &Path) -> Result<CredentialSet> {
    let mut identity = ConfigIdentityStore::new(path, &config.assoc)
        .with_context(|| format!("Invalid [assoc] table in {}", path.display()))?;

    let options = ClientOptions::from_config(&config.connection);
    let mut client = ProtocolClient::open(&mut identity, options)
        .context("Failed to connect to KeePassXC")?;
    let logins = client
        .query_logins(&config.script_indicator_url)
        .context("Failed to fetch logins")?;
    client.close();
    Ok(logins)
}

/// Apply the configured group filter and the name filters.
///
/// Returns the remaining entries and a description of the search criteria.
fn filter_logins(logins: CredentialSet, config: &Config, filters: &[String]) -> (CredentialSet, String) {
    let mut logins = logins;
    if !config.clip.filter_groups.is_empty() {
        logins = logins.filter_by_group_exact(&config.clip.filter_groups);
    }
    if filters.is_empty() {
        return (logins, config.script_indicator_url.clone());
    }
    (logins.filter_by_name_substrings(filters), filters.join(" "))
}

/// Keys to copy: flag, then per-entry override, then the default.
fn copy_keys(field: &FieldFlags, config: &Config, uuid: &str) -> Vec<String> {
    match field.selected() {
        Some(key) => vec![key.to_string()],
        None => config.copy_keys_for(uuid).to_vec(),
    }
}

/// Asks on stderr/stdin which of several entries to use.
struct PromptSelector<R, W> {
    input: R,
    output: W,
}

impl<R: BufRead, W: Write> Selector for PromptSelector<R, W> {
    fn choose(&mut self, labels: &[String]) -> Option<usize> {
        for (i, label) in labels.iter().enumerate() {
            writeln!(self.output, "{:>3}) {}", i + 1, label).ok()?;
        }
        write!(self.output, "Select entry [1-{}]: ", labels.len()).ok()?;
        self.output.flush().ok()?;

        let mut line = String::new();
        self.input.read_line(&mut line).ok()?;
        parse_choice(&line, labels.len())
    }
}

/// Parse a 1-based selection into an index.
fn parse_choice(line: &str, count: usize) -> Option<usize> {
    match line.trim().parse::<usize>() {
        Ok(n) if (1..=count).contains(&n) => Some(n - 1),
        _ => None,
    }
}

/// Handle the clip command.
fn cmd_clip(config: &Config, path: &Path, filters: &[String], field: &FieldFlags) -> Result<ExitCode> {
    let logins = fetch_logins(config, path)?;
    let (logins, criteria) = filter_logins(logins, config, filters);

    let mut selector = PromptSelector {
        input: io::stdin().lock(),
        output: io::stderr(),
    };
    let entry = logins.select(&config.entry_identifier, &criteria, &mut selector)?;

    let keys = copy_keys(field, config, &entry.uuid);
    debug!(uuid = %entry.uuid, keys = %format_keys(&keys), "Selected entry");
    let value = Zeroizing::new(entry.format_combined(&keys));

    let mut stdout = io::stdout().lock();
    stdout
        .write_all(value.as_bytes())
        .and_then(|_| stdout.flush())
        .context("Failed to write value to stdout")?;

    eprintln!(
        "Copied {} from {}",
        format_keys(&keys),
        entry.format_combined(&config.entry_identifier)
    );
    Ok(ExitCode::SUCCESS)
}

/// Handle the list command.
fn cmd_list(config: &Config, path: &Path, filters: &[String]) -> Result<ExitCode> {
    let logins = fetch_logins(config, path)?;
    let (logins, criteria) = filter_logins(logins, config, filters);

    if logins.is_empty() {
        eprintln!("No logins match the search criteria: {}", criteria);
        return Ok(ExitCode::FAILURE);
    }
    for label in logins.labels(&config.entry_identifier) {
        println!("{}", label);
    }
    Ok(ExitCode::SUCCESS)
}

/// Handle the config command.
fn cmd_config() -> Result<ExitCode> {
    print!("{}", EXAMPLE_CONFIG);
    Ok(ExitCode::SUCCESS)
}

/// Resolve and load the config file.
fn load_config(flag: Option<PathBuf>) -> Result<(PathBuf, Config)> {
    let path = config_path(flag)?;
    let config = Config::load_from(&path)
        .with_context(|| format!("Failed to load config from {}", path.display()))?;
    debug!(path = %path.display(), "Using config");
    Ok((path, config))
}

fn run(cli: Cli) -> Result<ExitCode> {
    match cli.command {
        Commands::Clip { filters, field } => {
            let (path, config) = load_config(cli.config)?;
            cmd_clip(&config, &path, &filters, &field)
        }
        Commands::List { filters } => {
            let (path, config) = load_config(cli.config)?;
            cmd_list(&config, &path, &filters)
        }
        Commands::Config => cmd_config(),
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    setup_logging(log_level(cli.verbose, cli.quiet));

    match run(cli) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}
