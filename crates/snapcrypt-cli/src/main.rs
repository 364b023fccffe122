//! snapcrypt: encrypted snapshot repository CLI
//!
//! Commands:
//!   keygen --out <path>                  - generate an operator keypair
//!   put <local> <name>                   - encrypt and upload a file
//!   get <name> [<local>]                 - download and decrypt a blob
//!   ls [<prefix>] [--name-prefix <p>]    - list blobs with stored sizes
//!   dirs [<prefix>]                      - list child directories
//!   rm <name>...                         - delete blobs in batches
//!   rmdir <prefix>                       - recursively delete a directory
//!   status                               - backend reachability and key state
//!   config show                          - display current configuration

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{self, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

use snapcrypt_core::config::SnapcryptConfig;
use snapcrypt_core::SnapcryptError;
use snapcrypt_crypto::Keypair;
use snapcrypt_storage::operator::BackendCredentials;
use snapcrypt_storage::{
    build_operator, check_health, BackendProfile, BlobClient, OpendalBlobClient, Repository,
    StorageGateway,
};

// ── CLI structure ──────────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(
    name = "snapcrypt",
    version,
    about = "Encrypted, compressed snapshot blob storage",
    long_about = "snapcrypt: store and retrieve encrypted blobs in S3, GCS, or Azure Blob repositories"
)]
struct Cli {
    /// Path to snapcrypt.toml configuration file
    #[arg(
        long,
        short = 'c',
        env = "SNAPCRYPT_CONFIG",
        default_value = "/etc/snapcrypt/config.toml"
    )]
    config: PathBuf,

    /// age identity file (overrides keys.identity_file)
    #[arg(long, short = 'i', env = "SNAPCRYPT_IDENTITY")]
    identity: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "SNAPCRYPT_LOG", default_value = "warn")]
    log: String,

    /// Log format (json, text)
    #[arg(long, env = "SNAPCRYPT_LOG_FORMAT", default_value = "text")]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Debug, ValueEnum)]
enum LogFormat {
    Json,
    Text,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Generate an age X25519 keypair for wrapping repository keys
    Keygen {
        /// Where to write the identity file
        #[arg(long, short = 'o')]
        out: PathBuf,
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },

    /// Encrypt and upload a local file
    ///
    /// Credentials are read from AWS_ACCESS_KEY_ID / AWS_SECRET_ACCESS_KEY
    /// (S3) or AZURE_STORAGE_KEY (Azure); GCS uses storage.credentials_file.
    Put {
        local: PathBuf,
        /// Blob name relative to the repository base path
        name: String,
        /// Fail instead of overwriting an existing blob
        #[arg(long)]
        fail_if_exists: bool,
    },

    /// Download and decrypt a blob (to stdout when no local path is given)
    Get {
        name: String,
        local: Option<PathBuf>,
    },

    /// List blobs directly under a prefix
    Ls {
        #[arg(default_value = "")]
        prefix: String,
        /// Only names starting with this
        #[arg(long, default_value = "")]
        name_prefix: String,
        /// Emit a JSON object of name → stored size
        #[arg(long)]
        json: bool,
    },

    /// List child directories under a prefix
    Dirs {
        #[arg(default_value = "")]
        prefix: String,
    },

    /// Delete blobs by name
    Rm {
        #[arg(required = true)]
        names: Vec<String>,
        /// Treat already-missing blobs as deleted
        #[arg(long)]
        ignore_missing: bool,
    },

    /// Recursively delete everything under a prefix
    Rmdir { prefix: String },

    /// Show backend reachability and repository key state
    Status,

    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand, Debug)]
enum ConfigAction {
    /// Print the active configuration (merged defaults + config file)
    Show,
}

// ── Entry point ───────────────────────────────────────────────────────────────

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli.log, &cli.log_format);

    debug!(
        version = env!("CARGO_PKG_VERSION"),
        config = %cli.config.display(),
        "snapcrypt starting"
    );

    let config = load_config(&cli.config)?;
    let identity = cli.identity.as_deref();

    match cli.command {
        Commands::Keygen { out, force } => cmd_keygen(&out, force),
        Commands::Put {
            local,
            name,
            fail_if_exists,
        } => cmd_put(&config, identity, &local, &name, fail_if_exists),
        Commands::Get { name, local } => cmd_get(&config, identity, &name, local.as_deref()),
        Commands::Ls {
            prefix,
            name_prefix,
            json,
        } => cmd_ls(&config, identity, &prefix, &name_prefix, json),
        Commands::Dirs { prefix } => cmd_dirs(&config, identity, &prefix),
        Commands::Rm {
            names,
            ignore_missing,
        } => cmd_rm(&config, identity, &names, ignore_missing),
        Commands::Rmdir { prefix } => cmd_rmdir(&config, identity, &prefix),
        Commands::Status => cmd_status(&config, identity),
        Commands::Config {
            action: ConfigAction::Show,
        } => cmd_config_show(&config, &cli.config),
    }
}

fn init_logging(level: &str, format: &LogFormat) {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let registry = tracing_subscriber::registry().with(filter);

    // stdout carries blob contents for `get`, so logs go to stderr.
    match format {
        LogFormat::Json => registry
            .with(fmt::layer().json().with_writer(io::stderr))
            .init(),
        LogFormat::Text => registry.with(fmt::layer().with_writer(io::stderr)).init(),
    }
}

// ── Config and repository setup ───────────────────────────────────────────────

fn load_config(path: &Path) -> Result<SnapcryptConfig> {
    if path.exists() {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading config: {}", path.display()))?;
        SnapcryptConfig::from_toml(&content)
            .with_context(|| format!("parsing config: {}", path.display()))
    } else {
        tracing::warn!("config file not found: {}  (using defaults)", path.display());
        Ok(SnapcryptConfig::default())
    }
}

fn load_keypair(config: &SnapcryptConfig, identity: Option<&Path>) -> Result<Keypair> {
    let path = identity
        .map(Path::to_path_buf)
        .or_else(|| config.keys.identity_file.clone())
        .context(
            "no identity file configured\n\
             Pass --identity, set SNAPCRYPT_IDENTITY, or set keys.identity_file.\n\
             Generate one with: snapcrypt keygen --out ~/.config/snapcrypt/identity.txt",
        )?;
    Keypair::load(&expand_tilde(&path))
        .with_context(|| format!("loading identity: {}", path.display()))
}

fn build_client(config: &SnapcryptConfig) -> Result<OpendalBlobClient> {
    let op = build_operator(&config.storage, &BackendCredentials::from_env())
        .context("building storage operator")?;
    OpendalBlobClient::new(op)
}

/// Open for writing; the first write to an empty base path creates its data key.
fn open_repository(
    config: &SnapcryptConfig,
    identity: Option<&Path>,
) -> Result<Repository<OpendalBlobClient>> {
    let keypair = Arc::new(load_keypair(config, identity)?);
    let client = Arc::new(build_client(config)?);
    Repository::open(client, config, keypair).with_context(|| repository_label(config))
}

/// Open without ever creating a data key.
fn open_existing_repository(
    config: &SnapcryptConfig,
    identity: Option<&Path>,
) -> Result<Repository<OpendalBlobClient>> {
    let keypair = Arc::new(load_keypair(config, identity)?);
    let client = Arc::new(build_client(config)?);
    Repository::open_existing(client, config, keypair).map_err(|e| match e {
        SnapcryptError::BlobNotFound { path } => anyhow::anyhow!(
            "{}: no data key at {path}; write a blob with `snapcrypt put` first",
            repository_label(config)
        ),
        other => anyhow::Error::new(other).context(repository_label(config)),
    })
}

fn repository_label(config: &SnapcryptConfig) -> String {
    format!(
        "opening repository {}/{}",
        config.storage.bucket, config.storage.base_path
    )
}

/// Expand `~` in path to the user's home directory
fn expand_tilde(path: &Path) -> PathBuf {
    let s = path.to_string_lossy();
    match s.strip_prefix("~/") {
        Some(rest) => {
            let home = std::env::var("HOME").unwrap_or_default();
            PathBuf::from(home).join(rest)
        }
        None => path.to_path_buf(),
    }
}

// ── `snapcrypt keygen` ────────────────────────────────────────────────────────

fn cmd_keygen(out: &Path, force: bool) -> Result<()> {
    let out = expand_tilde(out);
    if out.exists() && !force {
        anyhow::bail!(
            "{} already exists; pass --force to overwrite",
            out.display()
        );
    }
    if let Some(parent) = out.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating directory: {}", parent.display()))?;
    }

    let keypair = Keypair::generate();
    write_private(&out, keypair.to_identity_file().as_bytes())?;
    info!(path = %out.display(), "wrote identity file");

    println!("identity:   {}", out.display());
    println!("public key: {}", keypair.recipient());
    Ok(())
}

#[cfg(unix)]
fn write_private(path: &Path, contents: &[u8]) -> Result<()> {
    use std::os::unix::fs::OpenOptionsExt;

    let mut file = std::fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)
        .with_context(|| format!("creating {}", path.display()))?;
    file.write_all(contents)
        .with_context(|| format!("writing {}", path.display()))
}

#[cfg(not(unix))]
fn write_private(path: &Path, contents: &[u8]) -> Result<()> {
    std::fs::write(path, contents).with_context(|| format!("writing {}", path.display()))
}

// ── `snapcrypt put` / `get` ───────────────────────────────────────────────────

fn cmd_put(
    config: &SnapcryptConfig,
    identity: Option<&Path>,
    local: &Path,
    name: &str,
    fail_if_exists: bool,
) -> Result<()> {
    let file = File::open(local).with_context(|| format!("opening {}", local.display()))?;
    let size = file.metadata().map(|m| m.len()).ok();
    let repo = open_repository(config, identity)?;

    repo.gateway()
        .write(name, &mut BufReader::new(file), size, fail_if_exists)
        .with_context(|| format!("uploading {} → {name}", local.display()))?;

    println!(
        "{} → {}:{}/{} ({} bytes)",
        local.display(),
        config.storage.bucket,
        config.storage.base_path,
        name,
        size.unwrap_or(0)
    );
    Ok(())
}

fn cmd_get(
    config: &SnapcryptConfig,
    identity: Option<&Path>,
    name: &str,
    local: Option<&Path>,
) -> Result<()> {
    let repo = open_existing_repository(config, identity)?;
    let mut reader = repo
        .gateway()
        .read(name)
        .with_context(|| format!("opening blob {name}"))?;

    match local {
        Some(path) => {
            // Decode into a sibling temp file so a failed read never leaves
            // a truncated destination behind.
            let tmp = path.with_extension("snapcrypt-partial");
            let copied = {
                let mut out = BufWriter::new(
                    File::create(&tmp).with_context(|| format!("creating {}", tmp.display()))?,
                );
                let copied = io::copy(&mut reader, &mut out);
                let flushed = out.flush();
                match (copied, flushed) {
                    (Ok(n), Ok(())) => Ok(n),
                    (Err(e), _) | (_, Err(e)) => Err(e),
                }
            };
            let copied = match copied {
                Ok(n) => n,
                Err(e) => {
                    let _ = std::fs::remove_file(&tmp);
                    return Err(anyhow::Error::new(SnapcryptError::from_io(e))
                        .context(format!("reading blob {name}")));
                }
            };
            std::fs::rename(&tmp, path)
                .with_context(|| format!("moving {} into place", tmp.display()))?;
            eprintln!("{name} → {} ({copied} bytes)", path.display());
        }
        None => {
            let stdout = io::stdout();
            let mut out = stdout.lock();
            io::copy(&mut reader, &mut out)
                .map_err(SnapcryptError::from_io)
                .with_context(|| format!("reading blob {name}"))?;
            out.flush()?;
        }
    }
    Ok(())
}

// ── `snapcrypt ls` / `dirs` ───────────────────────────────────────────────────

fn cmd_ls(
    config: &SnapcryptConfig,
    identity: Option<&Path>,
    prefix: &str,
    name_prefix: &str,
    json: bool,
) -> Result<()> {
    let repo = open_existing_repository(config, identity)?;
    let files: BTreeMap<String, u64> = repo
        .gateway()
        .list_files(prefix, name_prefix)
        .with_context(|| format!("listing {prefix}"))?;

    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&files).context("serializing listing")?
        );
        return Ok(());
    }

    if files.is_empty() {
        println!("(no blobs)");
        return Ok(());
    }
    for (name, size) in &files {
        println!("{:>12}  {name}", format_bytes(*size));
    }
    Ok(())
}

fn cmd_dirs(config: &SnapcryptConfig, identity: Option<&Path>, prefix: &str) -> Result<()> {
    let repo = open_existing_repository(config, identity)?;
    let dirs = repo
        .gateway()
        .list_directories(prefix)
        .with_context(|| format!("listing directories under {prefix}"))?;
    for dir in &dirs {
        println!("{dir}/");
    }
    Ok(())
}

// ── `snapcrypt rm` / `rmdir` ──────────────────────────────────────────────────

fn cmd_rm(
    config: &SnapcryptConfig,
    identity: Option<&Path>,
    names: &[String],
    ignore_missing: bool,
) -> Result<()> {
    let repo = open_existing_repository(config, identity)?;
    repo.gateway()
        .delete_files(names, ignore_missing)
        .context("deleting blobs")?;
    println!("deleted {} blob(s)", names.len());
    Ok(())
}

fn cmd_rmdir(config: &SnapcryptConfig, identity: Option<&Path>, prefix: &str) -> Result<()> {
    let repo = open_existing_repository(config, identity)?;
    let result = repo
        .gateway()
        .delete_directories(prefix)
        .with_context(|| format!("deleting {prefix}"))?;
    println!(
        "deleted {} blob(s), {}",
        result.blobs_deleted,
        format_bytes(result.bytes_deleted)
    );
    Ok(())
}

// ── `snapcrypt status` ────────────────────────────────────────────────────────

fn cmd_status(config: &SnapcryptConfig, identity: Option<&Path>) -> Result<()> {
    let storage = &config.storage;
    let profile = BackendProfile::for_kind(storage.backend);
    let mode = config.codec.mode.unwrap_or(profile.codec_mode);

    println!("snapcrypt v{}", env!("CARGO_PKG_VERSION"));
    println!("  backend:     {:?}", storage.backend);
    println!("  endpoint:    {}", storage.endpoint);
    println!("  bucket:      {}", storage.bucket);
    println!("  base path:   {}", storage.base_path);
    println!(
        "  codec:       {mode:?} (compress: {}, resumable reads: {}, delete batch: {})",
        config.codec.compress,
        profile.resumable_reads,
        config.delete.max_batch_size.min(profile.max_delete_batch)
    );

    let client = match build_client(config) {
        Ok(client) => client,
        Err(e) => {
            println!("  storage:     NOT CONFIGURED ({e:#})");
            return Ok(());
        }
    };
    match check_health(&client, &storage.base_path) {
        Ok(()) => println!("  storage:     ok"),
        Err(e) => {
            println!("  storage:     UNREACHABLE ({e})");
            return Ok(());
        }
    }

    let metadata = snapcrypt_core::types::join_path(
        &storage.base_path,
        snapcrypt_core::METADATA_BLOB,
    );
    match client.head_object(&metadata) {
        Ok(Some(_)) => println!("  data key:    present ({metadata})"),
        Ok(None) => println!("  data key:    not yet created"),
        Err(e) => println!("  data key:    unknown ({e})"),
    }

    match load_keypair(config, identity) {
        Ok(keypair) => println!("  identity:    {}", keypair.recipient()),
        Err(_) => println!("  identity:    NOT LOADED"),
    }
    Ok(())
}

// ── `snapcrypt config show` ───────────────────────────────────────────────────

fn cmd_config_show(config: &SnapcryptConfig, config_path: &Path) -> Result<()> {
    if config_path.exists() {
        println!("# Configuration from: {}", config_path.display());
    } else {
        println!("# Configuration: defaults (no file at {})", config_path.display());
    }
    println!();
    let rendered = toml::to_string_pretty(config).context("serializing config to TOML")?;
    print!("{rendered}");
    Ok(())
}

fn format_bytes(n: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    let mut value = n as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{n} B")
    } else {
        format!("{value:.1} {}", UNITS[unit])
    }
}
