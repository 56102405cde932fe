#![forbid(unsafe_code)]

//! keyescrow command-line interface: rotate a LUKS recovery key and escrow it in the directory.

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use keyescrow_core::{
    config::{CONFIG_PATH_ENV, DEFAULT_CONFIG_PATH},
    logging, KeySlotManager, KeyescrowConfig, RetryCfg, RotationOrchestrator, RotationReport,
};
use keyescrow_krb5::KinitCredentialProvider;
use keyescrow_ldap::LdapDirectory;
use keyescrow_luks::SystemKeySlotManager;
use log::debug;
use schemars::schema_for;
use serde_json::to_string_pretty;
use settings::{read_existing_key, system_hostname, KeySource, RotateFlags, RotateSettings};
use std::path::{Path, PathBuf};

mod settings;

/// Top-level options shared by every subcommand.
#[derive(Parser, Debug)]
#[command(
    name = "keyescrow",
    version,
    about = "Rotate a LUKS recovery key and escrow it as a recovery record in the directory."
)]
struct Cli {
    /// Configuration file; defaults to /etc/keyescrow.toml when present.
    #[arg(short, long, global = true, env = CONFIG_PATH_ENV)]
    config: Option<PathBuf>,

    /// Increase log verbosity (-v debug, -vv trace).
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Only log warnings and errors.
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Add a fresh recovery key to the volume and escrow it in the directory.
    Rotate(RotateArgs),

    /// Check that a device is a LUKS volume and report its active key slots.
    CheckDevice {
        /// Encrypted block device; defaults to volume.device from the configuration.
        #[arg(long)]
        device: Option<PathBuf>,
    },

    /// Validate a configuration file and print any issues.
    Validate {
        /// Path to the config file to validate.
        #[arg(short = 'f', long, default_value = DEFAULT_CONFIG_PATH)]
        file: PathBuf,

        /// Print the configuration JSON schema instead of validating.
        #[arg(long)]
        schema: bool,
    },
}

#[derive(Args, Debug)]
struct RotateArgs {
    /// Encrypted block device (e.g. /dev/sda3).
    #[arg(long)]
    device: Option<PathBuf>,

    /// Directory URL (ldap:// or ldaps://).
    #[arg(long)]
    url: Option<String>,

    /// Distinguished name to search for the computer object under.
    #[arg(long)]
    search_base: Option<String>,

    /// Machine keytab used to obtain the directory credential.
    #[arg(long)]
    keytab: Option<PathBuf>,

    /// Kerberos principal; defaults to HOSTNAME$.
    #[arg(long)]
    principal: Option<String>,

    /// Host name as known to the directory; defaults to this machine's short name.
    #[arg(long)]
    hostname: Option<String>,

    /// Existing unlock key, inline. Visible in the process list; prefer the file or prompt.
    #[arg(long, group = "existing")]
    existing_key: Option<String>,

    /// File holding the existing unlock key.
    #[arg(long, group = "existing")]
    existing_key_file: Option<PathBuf>,

    /// Prompt for the existing unlock key.
    #[arg(long, group = "existing")]
    prompt_existing_key: bool,

    /// Remove the original key once the new one is escrowed.
    #[arg(long)]
    remove_original_key: bool,

    /// Make a single attempt at each directory operation.
    #[arg(long)]
    no_retry: bool,
}

impl From<&RotateArgs> for RotateFlags {
    fn from(args: &RotateArgs) -> Self {
        RotateFlags {
            device: args.device.clone(),
            url: args.url.clone(),
            search_base: args.search_base.clone(),
            keytab: args.keytab.clone(),
            principal: args.principal.clone(),
            hostname: args.hostname.clone(),
            existing_key: args.existing_key.clone(),
            existing_key_file: args.existing_key_file.clone(),
            prompt_existing_key: args.prompt_existing_key,
            remove_original_key: args.remove_original_key,
        }
    }
}

fn main() {
    if let Err(err) = run() {
        eprintln!("error: {err:#}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let cli = Cli::parse();
    logging::init(log_level(cli.verbose, cli.quiet));

    match cli.command {
        Commands::Validate { file, schema } => {
            if schema {
                let schema = schema_for!(KeyescrowConfig);
                println!("{}", to_string_pretty(&schema)?);
                return Ok(());
            }
            validate_config(&file)
        }
        Commands::CheckDevice { device } => {
            let config = load_config(cli.config.as_deref())?;
            check_device(&config, device)
        }
        Commands::Rotate(args) => {
            let config = load_config(cli.config.as_deref())?;
            rotate(&config, &args)
        }
    }
}

fn log_level(verbose: u8, quiet: bool) -> &'static str {
    match (quiet, verbose) {
        (true, _) => "warn",
        (false, 0) => "info",
        (false, 1) => "debug",
        (false, _) => "trace",
    }
}

fn load_config(path: Option<&Path>) -> Result<KeyescrowConfig> {
    let config = KeyescrowConfig::load_or_default(path).with_context(|| match path {
        Some(path) => format!("failed to load configuration from {}", path.display()),
        None => "failed to load configuration".to_string(),
    })?;
    if let Some(path) = &config.path {
        debug!("using configuration {}", path.display());
    }
    Ok(config)
}

fn validate_config(file: &Path) -> Result<()> {
    let config = KeyescrowConfig::load(file)
        .with_context(|| format!("failed to load configuration from {}", file.display()))?;
    let issues = config.validate();
    if issues.is_empty() {
        println!("Configuration OK: {}", file.display());
        return Ok(());
    }

    eprintln!("Configuration validation failed:");
    for issue in &issues {
        eprintln!("  - {issue}");
    }
    std::process::exit(1);
}

fn check_device(config: &KeyescrowConfig, device: Option<PathBuf>) -> Result<()> {
    let device = match device.or_else(|| config.volume.device.as_deref().map(PathBuf::from)) {
        Some(device) => device,
        None => bail!("missing volume device: pass --device or set volume.device"),
    };
    let key_slots = SystemKeySlotManager::from_config(config)?;

    if !key_slots.validate(&device)? {
        bail!("{} is not a LUKS volume", device.display());
    }
    let active = key_slots.active_slots(&device)?;
    println!("{}: LUKS volume, {active} active key slot(s)", device.display());
    Ok(())
}

fn rotate(config: &KeyescrowConfig, args: &RotateArgs) -> Result<()> {
    let flags = RotateFlags::from(args);
    let key_source = flags.key_source()?;
    let settings = RotateSettings::resolve(&flags, config, system_hostname)?;
    let key_slots = SystemKeySlotManager::from_config(config)?;
    if key_source == KeySource::Prompt {
        ensure_luks_volume(&key_slots, &settings.device)?;
    }
    let existing_key = read_existing_key(&key_source, &settings.device)?;
    let request = settings.into_request(existing_key);
    debug!("{request:?}");

    let retry = if args.no_retry {
        RetryCfg::disabled()
    } else {
        config.retry.clone()
    };
    let orchestrator = RotationOrchestrator::new(
        KinitCredentialProvider::from_config(config)?,
        LdapDirectory::from_config(config),
        key_slots,
    )
    .with_retry(retry);

    match orchestrator.rotate(&request) {
        Ok(report) => {
            print_report(&report);
            Ok(())
        }
        Err(failure) => {
            if failure.unescrowed_key_installed {
                eprintln!(
                    "warning: a new key was added to {} but is NOT escrowed; the original key \
                     still unlocks the volume",
                    request.device.display()
                );
            }
            // The failure's Display already carries its error; keep the chain from repeating it.
            Err(anyhow::anyhow!("{failure}"))
        }
    }
}

/// Refuse to ask for a passphrase for a device that cannot be rotated.
fn ensure_luks_volume(key_slots: &SystemKeySlotManager, device: &Path) -> Result<()> {
    if !key_slots
        .validate(device)
        .with_context(|| format!("failed to inspect {}", device.display()))?
    {
        bail!("{} is not a LUKS volume", device.display());
    }
    Ok(())
}

fn print_report(report: &RotationReport) {
    println!("Recovery key rotated and escrowed.");
    println!("  computer object: {}", report.host_dn);
    println!("  recovery record: {}", report.record_name);
    println!(
        "  original key:    {}",
        if report.original_key_removed {
            "removed"
        } else {
            "kept"
        }
    );
    if let Some(release) = &report.credential_release_error {
        println!("  note: credential cache cleanup failed: {release}");
    }
}
