use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
mod auth;
use duressvault::{
    AuthOutcome, KdfParams, PanicExit, PasswordKind, Vault, VaultConfig, VaultMode,
};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;
use zeroize::Zeroizing;

const ENV_LOG: &str = "DURESSVAULT_LOG";

#[derive(Debug, clap::Args)]
struct KdfArgs {
    /// Argon2 memory cost in KiB (default: 65536)
    #[arg(long = "argon-mem")]
    mem_cost_kib: Option<u32>,

    /// Argon2 time cost / iterations (default: 3)
    #[arg(long = "argon-time")]
    time_cost: Option<u32>,

    /// Argon2 parallelism (default: 1)
    #[arg(long = "argon-parallelism")]
    parallelism: Option<u32>,

    /// Use PBKDF2-HMAC-SHA256 with this many iterations instead of Argon2id
    #[arg(long, conflicts_with_all = ["mem_cost_kib", "time_cost", "parallelism"])]
    pbkdf2_iterations: Option<u32>,
}

impl KdfArgs {
    fn to_kdf_params(&self) -> Result<KdfParams> {
        if let Some(iterations) = self.pbkdf2_iterations {
            return Ok(KdfParams::pbkdf2(iterations)?);
        }

        let (mem, time, par) = match KdfParams::default() {
            KdfParams::Argon2id {
                mem_cost_kib,
                time_cost,
                parallelism,
            } => (mem_cost_kib, time_cost, parallelism),
            KdfParams::Pbkdf2Sha256 { .. } => (65536, 3, 1),
        };
        Ok(KdfParams::argon2id(
            self.mem_cost_kib.unwrap_or(mem),
            self.time_cost.unwrap_or(time),
            self.parallelism.unwrap_or(par),
        )?)
    }
}

#[derive(Debug, Parser)]
#[command(name = "duressvault")]
#[command(
    version,
    about = "Offline encrypted file vault with decoy and panic passwords."
)]
struct Cli {
    /// Vault directory
    #[arg(long, global = true, value_name = "DIR", env = "DURESSVAULT_DIR")]
    dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Creates a new vault with master, decoy and panic passwords
    Init {
        #[command(flatten)]
        kdf: KdfArgs,
    },

    /// Encrypts a file into the vault
    #[command(arg_required_else_help = true)]
    Put { name: String, file: PathBuf },

    /// Decrypts a file by id
    #[command(arg_required_else_help = true)]
    Get {
        id: String,
        /// Write to this file instead of stdout
        #[arg(short, long)]
        out: Option<PathBuf>,
    },

    /// Lists stored files
    List {
        #[arg(short, long, default_value_t = false)]
        /// Show ids, sizes, dates and tags
        all: bool,
    },

    /// Deletes a file by id
    #[command(arg_required_else_help = true)]
    Rm { id: String },

    /// Renames a file
    #[command(arg_required_else_help = true)]
    Mv { id: String, name: String },

    /// Replaces the tags of a file
    #[command(arg_required_else_help = true)]
    Tag { id: String, tags: Vec<String> },

    /// Changes one of the three passwords
    #[command(arg_required_else_help = true)]
    Passwd { kind: PasswordKind },

    /// Writes an encrypted backup of the vault
    #[command(arg_required_else_help = true)]
    Export { file: PathBuf },

    /// Restores files from an encrypted backup
    #[command(arg_required_else_help = true)]
    Import { file: PathBuf },

    /// Shows whether the vault exists and how many attempts remain
    Status,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_env(ENV_LOG).unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn resolve_config(dir: Option<PathBuf>) -> Result<VaultConfig> {
    let config = VaultConfig::from_env()?;
    let config = match dir {
        Some(dir) => config.with_root(dir),
        None => config,
    };
    // a panic login must end the same way a typo does
    Ok(config.with_panic_exit(PanicExit::Return))
}

/// Authenticates with the password from [`auth::read_password`] and keeps
/// it for commands that need it again.
fn open_session(vault: &Vault) -> Result<(AuthOutcome, Zeroizing<String>)> {
    let password = auth::read_password()?;
    let outcome = vault.authenticate(&password)?;
    Ok((outcome, password))
}

fn main() -> Result<()> {
    init_tracing();
    let args = Cli::parse();
    let config = resolve_config(args.dir)?;

    if let Commands::Init { kdf } = &args.command {
        let config = config.with_kdf(kdf.to_kdf_params()?);
        let [master, decoy, panic] = auth::read_initial_passwords()?;
        let vault = Vault::initialize(config, &master, &decoy, &panic)?;
        println!("vault initialized at {}", vault.config().root.display());
        return Ok(());
    }

    let vault = Arc::new(Vault::open(config));
    {
        let vault = Arc::clone(&vault);
        ctrlc::set_handler(move || {
            vault.wipe_session();
            std::process::exit(130);
        })
        .context("failed to install Ctrl-C handler")?;
    }

    if let Commands::Status = args.command {
        let status = vault.status();
        if !status.initialized {
            println!("no vault at {}", vault.config().root.display());
            return Ok(());
        }
        println!("vault: {}", vault.config().root.display());
        if let Some(remaining) = status.remaining_attempts {
            println!("attempts remaining: {remaining}");
        }
        return Ok(());
    }

    let (outcome, password) = open_session(&vault)?;
    let result = run_command(&vault, args.command, outcome, password);
    vault.logout();
    result
}

fn run_command(
    vault: &Vault,
    command: Commands,
    outcome: AuthOutcome,
    password: Zeroizing<String>,
) -> Result<()> {
    match command {
        Commands::Put { name, file } => {
            let data = std::fs::read(&file)
                .with_context(|| format!("failed to read {}", file.display()))?;
            let id = vault.store_file(&name, &data)?;
            println!("stored '{name}' as {id}");
        }
        Commands::Get { id, out } => {
            let data = vault.retrieve_file(&id)?;
            match out {
                Some(path) => {
                    std::fs::write(&path, data.as_slice())
                        .with_context(|| format!("failed to write {}", path.display()))?;
                    println!("wrote {} bytes to {}", data.len(), path.display());
                }
                None => {
                    let mut stdout = std::io::stdout().lock();
                    stdout.write_all(&data)?;
                    stdout.flush()?;
                }
            }
        }
        Commands::List { all } => {
            let entries = vault.list_files()?;
            if entries.is_empty() {
                println!("No files stored.");
            } else if all {
                let name_width = entries
                    .iter()
                    .map(|e| e.original_name().len())
                    .chain(std::iter::once("Name".len()))
                    .max()
                    .unwrap_or(4);

                println!(
                    "{:<32}  {:<name_width$}  {:>10}  {:<20}  Tags",
                    "Id", "Name", "Size", "Modified"
                );
                println!("{:-<32}  {:-<name_width$}  {:->10}  {:-<20}  ----", "", "", "", "");

                for e in entries {
                    println!(
                        "{:<32}  {:<name_width$}  {:>10}  {:<20}  {}",
                        e.blob_id(),
                        e.original_name(),
                        e.size_bytes(),
                        e.timestamp().format("%Y-%m-%d %H:%M:%S"),
                        e.tags().join(",")
                    );
                }
            } else {
                for e in entries {
                    println!("{}  {}", e.blob_id(), e.original_name());
                }
            }
        }
        Commands::Rm { id } => {
            vault.delete_file(&id)?;
            println!("file {id} removed");
        }
        Commands::Mv { id, name } => {
            vault.rename_file(&id, &name)?;
            println!("file {id} renamed to '{name}'");
        }
        Commands::Tag { id, tags } => {
            vault.tag_file(&id, tags)?;
            println!("tags updated for {id}");
        }
        Commands::Passwd { kind } => {
            let same_kind = matches!(
                (outcome.mode, kind),
                (VaultMode::Master, PasswordKind::Master) | (VaultMode::Decoy, PasswordKind::Decoy)
            );
            let old = if same_kind {
                password
            } else {
                auth::read_secondary(&format!("Current {kind} password: "))?
            };
            let new = auth::read_new_password_with_confirmation(&kind.to_string())?;
            vault.change_password(kind, &old, &new)?;
            println!("{kind} password changed");
        }
        Commands::Export { file } => {
            let count = vault.export_backup(&file)?;
            println!("exported {count} file(s) to {}", file.display());
        }
        Commands::Import { file } => {
            let summary = vault.import_backup(&file)?;
            println!(
                "imported {} file(s), skipped {} existing",
                summary.imported, summary.skipped
            );
        }
        Commands::Init { .. } | Commands::Status => {}
    }
    Ok(())
}
