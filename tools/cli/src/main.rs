//! SecureVault CLI - Command line interface for encrypted volumes.
//!
//! This tool creates password-protected volume files and adds, lists,
//! extracts and removes the files stored inside them.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use securevault_common::SensitiveBytes;
use securevault_crypto::{
    benchmark_derivation, generate_password, password_strength, validate_password, CipherKind,
    KdfParams,
};
use securevault_fs::{FileEntry, VolumeFileSystem};
use securevault_volume::{lock_volume, VolumeConfig, VolumeInfo, VolumeManager, VOLUME_EXTENSION};

/// Environment variable holding the volume password for non-interactive use.
const PASSWORD_ENV: &str = "SECUREVAULT_PASSWORD";

#[derive(Parser)]
#[command(name = "securevault")]
#[command(about = "SecureVault - Encrypted volume management")]
#[command(version)]
struct Cli {
    /// Enable verbose logging.
    #[arg(short, long)]
    verbose: bool,

    /// JSON configuration file.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a new volume.
    Create {
        /// Path of the volume file.
        #[arg(short, long)]
        path: PathBuf,

        /// Payload size in MiB (default from configuration).
        #[arg(short, long)]
        size: Option<u64>,

        /// Sector cipher.
        #[arg(long, value_enum)]
        cipher: Option<CipherArg>,

        /// Use the hardened key derivation preset.
        #[arg(long)]
        hardened: bool,
    },

    /// Check whether a file looks like a volume, without a password.
    Check {
        /// Path of the volume file.
        #[arg(short, long)]
        path: PathBuf,
    },

    /// Show volume information.
    Info {
        /// Path of the volume file.
        #[arg(short, long)]
        path: PathBuf,

        /// Print as JSON.
        #[arg(long)]
        json: bool,
    },

    /// List files in a volume.
    List {
        /// Path of the volume file.
        #[arg(short = 'p', long)]
        volume_path: PathBuf,
    },

    /// Add a file to a volume.
    Add {
        /// Path of the volume file.
        #[arg(short = 'p', long)]
        volume_path: PathBuf,

        /// Source file to add.
        #[arg(short, long)]
        source: PathBuf,

        /// Name inside the volume (default: source file name).
        #[arg(short, long)]
        name: Option<String>,
    },

    /// Extract a file from a volume.
    Extract {
        /// Path of the volume file.
        #[arg(short = 'p', long)]
        volume_path: PathBuf,

        /// Name inside the volume.
        #[arg(short, long)]
        name: String,

        /// Destination file path.
        #[arg(short, long)]
        dest: PathBuf,
    },

    /// Remove a file from a volume.
    Remove {
        /// Path of the volume file.
        #[arg(short = 'p', long)]
        volume_path: PathBuf,

        /// Name inside the volume.
        #[arg(short = 'f', long)]
        file: String,
    },

    /// Time key derivation at a given iteration count.
    Bench {
        /// PBKDF2 iterations.
        #[arg(short, long, default_value_t = KdfParams::standard().iterations)]
        iterations: u32,
    },

    /// Generate a random password.
    GenPassword {
        /// Password length.
        #[arg(short, long, default_value_t = 20)]
        length: usize,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum CipherArg {
    /// AES-256-XTS.
    Xts,
    /// Legacy tweaked AES-256-CBC.
    Cbc,
}

impl From<CipherArg> for CipherKind {
    fn from(arg: CipherArg) -> Self {
        match arg {
            CipherArg::Xts => CipherKind::AesXts,
            CipherArg::Cbc => CipherKind::TweakedCbc,
        }
    }
}

/// Shared state for one CLI invocation.
struct App {
    config: VolumeConfig,
    manager: Arc<VolumeManager>,
    env_password: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .compact()
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let config = load_config(cli.config.as_deref())?;
    let app = App {
        manager: Arc::new(VolumeManager::with_config(config.clone())),
        config,
        env_password: env_password(),
    };

    let result = run(&app, cli.command).await;

    // Nothing may stay unlocked past exit
    if let Err(e) = app.manager.close_all_volumes() {
        warn!(error = %e, "Failed to close volumes on exit");
    }

    result
}

async fn run(app: &App, command: Commands) -> Result<()> {
    match command {
        Commands::Create {
            path,
            size,
            cipher,
            hardened,
        } => cmd_create(app, path, size, cipher, hardened).await,

        Commands::Check { path } => cmd_check(app, &path),

        Commands::Info { path, json } => cmd_info(app, path, json).await,

        Commands::List { volume_path } => cmd_list(app, volume_path).await,

        Commands::Add {
            volume_path,
            source,
            name,
        } => cmd_add(app, volume_path, source, name).await,

        Commands::Extract {
            volume_path,
            name,
            dest,
        } => cmd_extract(app, volume_path, name, dest).await,

        Commands::Remove { volume_path, file } => cmd_remove(app, volume_path, file).await,

        Commands::Bench { iterations } => cmd_bench(iterations).await,

        Commands::GenPassword { length } => cmd_gen_password(length),
    }
}

/// Password from `SECUREVAULT_PASSWORD`, if set and non-empty.
///
/// Never accepted as a command-line argument.
fn env_password() -> Option<String> {
    std::env::var(PASSWORD_ENV).ok().filter(|p| !p.is_empty())
}

fn load_config(path: Option<&Path>) -> Result<VolumeConfig> {
    let Some(path) = path else {
        return Ok(VolumeConfig::default());
    };

    let json = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config {}", path.display()))?;
    let config = VolumeConfig::from_json(&json).context("Invalid configuration")?;
    config.validate().context("Invalid configuration")?;
    Ok(config)
}

impl App {
    /// Password from the environment, or prompt for it.
    fn password(&self, prompt: &str) -> Result<SensitiveBytes> {
        if let Some(password) = &self.env_password {
            return Ok(SensitiveBytes::from(password.clone()));
        }
        let password = rpassword::prompt_password(prompt).context("Failed to read password")?;
        Ok(SensitiveBytes::from(password))
    }

    /// Password for a new volume, confirmed when prompting.
    fn new_password(&self) -> Result<SensitiveBytes> {
        let password = self.password("Enter password: ")?;
        let text = std::str::from_utf8(password.as_bytes()).context("Password is not valid UTF-8")?;
        validate_password(text).context("Password rejected")?;
        info!(strength = password_strength(text), "Password accepted");

        if self.env_password.is_none() {
            let confirm = self.password("Confirm password: ")?;
            if password != confirm {
                anyhow::bail!("Passwords do not match");
            }
        }

        Ok(password)
    }

    /// Open a volume on a blocking worker, run `op` on its file system, and
    /// close it again whatever the outcome.
    async fn with_volume<T, F>(&self, path: PathBuf, op: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut VolumeFileSystem<'_>) -> securevault_common::Result<T> + Send + 'static,
    {
        let password = self.password("Enter password: ")?;
        let manager = Arc::clone(&self.manager);
        let config = self.config.clone();

        tokio::task::spawn_blocking(move || -> Result<T> {
            let handle = manager
                .open_volume(&path, password.as_bytes())
                .context("Failed to open volume")?;
            drop(password);

            let outcome = {
                let mut volume = lock_volume(&handle);
                VolumeFileSystem::load_with_config(&mut volume, &config)
                    .and_then(|mut fs| op(&mut fs))
            };

            manager
                .close_volume(&path)
                .context("Failed to close volume")?;
            Ok(outcome?)
        })
        .await
        .context("Volume worker failed")?
    }
}

/// Create a new volume.
async fn cmd_create(
    app: &App,
    path: PathBuf,
    size_mib: Option<u64>,
    cipher: Option<CipherArg>,
    hardened: bool,
) -> Result<()> {
    let mut config = app.config.clone();
    if let Some(cipher) = cipher {
        config.cipher = cipher.into();
    }
    if hardened {
        config.kdf = KdfParams::hardened();
    }
    let size = match size_mib {
        Some(mib) => mib
            .checked_mul(1024 * 1024)
            .context("Volume size too large")?,
        None => config.default_volume_size,
    };

    if path.extension().and_then(|e| e.to_str()) != Some(VOLUME_EXTENSION) {
        warn!(
            "Volume files conventionally use the .{} extension",
            VOLUME_EXTENSION
        );
    }

    info!("Creating new volume: {}", path.display());
    let password = app.new_password()?;

    let manager = Arc::clone(&app.manager);
    let volume_info = tokio::task::spawn_blocking(move || -> Result<VolumeInfo> {
        let handle = manager
            .create_volume_with_config(&path, password.as_bytes(), size, &config)
            .context("Failed to create volume")?;
        drop(password);

        let volume_info = {
            let mut volume = lock_volume(&handle);
            VolumeFileSystem::load_with_config(&mut volume, &config)?.format()?;
            volume.info()?
        };

        manager.close_volume(&path)?;
        Ok(volume_info)
    })
    .await
    .context("Volume worker failed")??;

    println!("Volume created successfully!");
    print_info(&volume_info);

    Ok(())
}

/// Check a file without unlocking it.
fn cmd_check(app: &App, path: &Path) -> Result<()> {
    if !app.manager.is_valid_volume(path) {
        anyhow::bail!("{} is not a SecureVault volume", path.display());
    }

    let basic = app
        .manager
        .get_volume_info(path)
        .context("Failed to read file metadata")?;

    println!("{} looks like a SecureVault volume.", path.display());
    println!("  File size: {}", format_size(basic.file_size));
    println!("  Modified: {}", basic.last_modified);

    Ok(())
}

/// Show volume information.
async fn cmd_info(app: &App, path: PathBuf, json: bool) -> Result<()> {
    info!("Getting volume info: {}", path.display());

    let (volume_info, used, free, files) = app
        .with_volume(path.clone(), |fs| {
            Ok((
                fs.volume_info()?,
                fs.used_space(),
                fs.free_space(),
                fs.list_files().len(),
            ))
        })
        .await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&volume_info)?);
        return Ok(());
    }

    println!("Volume Information:");
    print_info(&volume_info);
    println!("  Files: {}", files);
    println!("  Used: {}", format_size(used));
    println!("  Free: {}", format_size(free));

    Ok(())
}

/// List files in a volume.
async fn cmd_list(app: &App, volume_path: PathBuf) -> Result<()> {
    let files: Vec<FileEntry> = app
        .with_volume(volume_path, |fs| Ok(fs.list_files().to_vec()))
        .await?;

    if files.is_empty() {
        println!("Volume is empty.");
    } else {
        for entry in files {
            println!(
                "  {} ({}, added {})",
                entry.name,
                format_size(entry.size),
                entry.created().format("%Y-%m-%d %H:%M:%S")
            );
        }
    }

    Ok(())
}

/// Add a file to a volume.
async fn cmd_add(
    app: &App,
    volume_path: PathBuf,
    source: PathBuf,
    name: Option<String>,
) -> Result<()> {
    let name = match name {
        Some(name) => name,
        None => source
            .file_name()
            .and_then(|n| n.to_str())
            .map(str::to_string)
            .context("Source has no usable file name; pass --name")?,
    };
    info!("Adding file {} to volume as {}", source.display(), name);
    let total = std::fs::metadata(&source)
        .with_context(|| format!("Failed to read {}", source.display()))?
        .len();

    let entry = app
        .with_volume(volume_path, move |fs| {
            fs.add_file_with_progress(&source, &name, progress_reporter("Stored", total))
        })
        .await
        .context("Failed to add file")?;

    println!(
        "File added successfully: {} ({})",
        entry.name,
        format_size(entry.size)
    );

    Ok(())
}

/// Extract a file from a volume.
async fn cmd_extract(app: &App, volume_path: PathBuf, name: String, dest: PathBuf) -> Result<()> {
    info!("Extracting {} from volume to {}", name, dest.display());

    let target = dest.clone();
    let size = app
        .with_volume(volume_path, move |fs| {
            let total = fs.file_info(&name).map_or(0, |entry| entry.size);
            fs.extract_file_with_progress(&name, &target, progress_reporter("Extracted", total))
        })
        .await
        .context("Failed to extract file")?;

    println!(
        "File extracted successfully: {} ({})",
        dest.display(),
        format_size(size)
    );

    Ok(())
}

/// Remove a file from a volume.
async fn cmd_remove(app: &App, volume_path: PathBuf, file: String) -> Result<()> {
    info!("Removing: {}", file);

    let entry = app
        .with_volume(volume_path, move |fs| fs.delete_file(&file))
        .await
        .context("Failed to remove file")?;

    println!("File removed: {}", entry.name);

    Ok(())
}

/// Time key derivation.
async fn cmd_bench(iterations: u32) -> Result<()> {
    let elapsed = tokio::task::spawn_blocking(move || benchmark_derivation(iterations))
        .await
        .context("Benchmark worker failed")?
        .context("Key derivation failed")?;

    println!(
        "PBKDF2-HMAC-SHA512, {} iterations: {} ms",
        iterations,
        elapsed.as_millis()
    );

    Ok(())
}

/// Print a random password.
fn cmd_gen_password(length: usize) -> Result<()> {
    let password = generate_password(length).context("Failed to generate password")?;
    println!("{}", password);
    Ok(())
}

/// Progress callback logging each completed tenth of `total` bytes.
fn progress_reporter(label: &'static str, total: u64) -> impl FnMut(u64) {
    let mut reported = 0;
    move |done| {
        let tenth = completed_tenths(done, total);
        if tenth > reported {
            reported = tenth;
            info!("{} {} of {} ({}%)", label, format_size(done), format_size(total), tenth * 10);
        }
    }
}

fn completed_tenths(done: u64, total: u64) -> u64 {
    done.saturating_mul(10).checked_div(total).unwrap_or(10).min(10)
}

fn print_info(volume_info: &VolumeInfo) {
    println!("  Location: {}", volume_info.path.display());
    println!("  ID: {}", volume_info.volume_id);
    println!("  Created: {}", volume_info.created_at);
    println!("  Size: {}", format_size(volume_info.size));
    println!("  Cipher: {}", volume_info.cipher);
    println!("  KDF: PBKDF2-HMAC-SHA512, {} iterations", volume_info.iterations);
}

fn format_size(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["B", "KiB", "MiB", "GiB"];

    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }

    if unit == 0 {
        format!("{} B", bytes)
    } else {
        format!("{:.1} {}", value, UNITS[unit])
    }
}
