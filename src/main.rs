//! stackfs - stacking passthrough filesystem
//!
//! Usage:
//!   stackfs mount <lower> <mount_point>  - Stack on a directory and mount it
//!   stackfs unmount <mount_point>        - Unmount
//!   stackfs init                         - Write a default configuration
//!   stackfs status                       - Show the effective configuration

use clap::{Parser, Subcommand};
use stackfs::{
    config::Config,
    fs::StackedFuse,
    lower::HostFs,
    stack::StackFs,
    Error, Result,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "stackfs")]
#[command(author = "stackfs Contributors")]
#[command(version)]
#[command(about = "Stacking passthrough filesystem over a host directory")]
struct Cli {
    /// Configuration file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a default configuration file
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },

    /// Mount the filesystem
    Mount {
        /// Directory to stack on
        lower: PathBuf,

        /// Mount point directory
        mount_point: PathBuf,

        /// Allow other users to access the mount
        #[arg(long)]
        allow_other: bool,
    },

    /// Unmount the filesystem
    Unmount {
        /// Mount point to unmount
        mount_point: PathBuf,
    },

    /// Show the effective configuration
    Status,
}

fn main() {
    let cli = Cli::parse();

    // RUST_LOG wins over --verbose
    let level = if cli.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let config_path = cli
        .config
        .map(|p| expand_tilde(&p))
        .unwrap_or_else(Config::default_path);

    if let Err(e) = run_command(cli.command, &config_path) {
        error!("Error: {}", e);
        std::process::exit(1);
    }
}

fn run_command(command: Commands, config_path: &Path) -> Result<()> {
    match command {
        Commands::Init { force } => cmd_init(config_path, force),

        Commands::Mount {
            lower,
            mount_point,
            allow_other,
        } => cmd_mount(config_path, &lower, &mount_point, allow_other),

        Commands::Unmount { mount_point } => cmd_unmount(&mount_point),

        Commands::Status => cmd_status(config_path),
    }
}

/// Load the config file if there is one, defaults otherwise
fn load_config(config_path: &Path) -> Result<Config> {
    if config_path.exists() {
        Config::load(config_path)
    } else {
        let mut config = Config::default();
        config.apply_env_overrides();
        Ok(config)
    }
}

fn cmd_init(config_path: &Path, force: bool) -> Result<()> {
    if config_path.exists() && !force {
        return Err(Error::Config(format!(
            "{:?} already exists (use --force to overwrite)",
            config_path
        )));
    }

    Config::default().save(config_path)?;
    info!("Wrote default configuration to {:?}", config_path);
    Ok(())
}

fn cmd_mount(config_path: &Path, lower: &Path, mount_point: &Path, allow_other: bool) -> Result<()> {
    let mut config = load_config(config_path)?;
    config.lower.path = lower.to_path_buf();
    config.mount.mount_point = mount_point.to_path_buf();
    config.mount.allow_other |= allow_other;
    config.validate()?;

    let host = HostFs::new(config.lower.path.clone(), config.lower.xattr)?;
    let stack = StackFs::new(Arc::new(host), &config.stack)?;
    let fs = StackedFuse::new(stack, &config.mount);

    std::fs::create_dir_all(mount_point)?;

    let mut options = vec![fuser::MountOption::FSName(config.mount.fs_name.clone())];
    if config.mount.auto_unmount {
        options.push(fuser::MountOption::AutoUnmount);
    }
    if config.mount.allow_other {
        options.push(fuser::MountOption::AllowOther);
    }
    if config.mount.allow_root {
        options.push(fuser::MountOption::AllowRoot);
    }

    info!("Stacking {:?} at {:?}", config.lower.path, mount_point);
    fuser::mount2(fs, mount_point, &options).map_err(|e| Error::Internal(e.to_string()))?;
    info!("Unmounted {:?}", mount_point);
    Ok(())
}

fn cmd_unmount(mount_point: &Path) -> Result<()> {
    info!("Unmounting {:?}...", mount_point);

    #[cfg(target_os = "linux")]
    let output = std::process::Command::new("fusermount")
        .arg("-u")
        .arg(mount_point)
        .output()?;

    #[cfg(not(target_os = "linux"))]
    let output = std::process::Command::new("umount")
        .arg(mount_point)
        .output()?;

    if output.status.success() {
        info!("Unmounted successfully");
        Ok(())
    } else {
        Err(Error::Internal(format!(
            "Failed to unmount: {}",
            String::from_utf8_lossy(&output.stderr)
        )))
    }
}

fn cmd_status(config_path: &Path) -> Result<()> {
    let config = load_config(config_path)?;

    println!("stackfs Status");
    println!("==============");
    println!();
    println!("Configuration: {:?}{}", config_path, if config_path.exists() { "" } else { " (defaults)" });
    println!("Lower directory: {:?}", config.lower.path);
    println!("Extended attributes: {}", if config.lower.xattr { "enabled" } else { "disabled" });
    println!("Mount point: {:?}", config.mount.mount_point);
    println!("Filesystem name: {}", config.mount.fs_name);
    println!("Attribute TTL: {} ms", config.mount.attr_ttl_ms);
    println!("Max shadow nodes: {}", config.stack.max_nodes);

    match config.validate() {
        Ok(()) => println!("Configuration: valid"),
        Err(e) => println!("Configuration: INVALID - {}", e),
    }
    Ok(())
}

fn expand_tilde(path: &Path) -> PathBuf {
    match (path.strip_prefix("~"), dirs::home_dir()) {
        (Ok(rest), Some(home)) => home.join(rest),
        _ => path.to_path_buf(),
    }
}
