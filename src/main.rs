mod colors;
mod commands;

use anyhow::{Context, Result};
use clap::{CommandFactory, Parser, Subcommand};
use colored::Colorize;
use colors::ColorChoice;
use commands::CacheAction;
use kegbrew::{Config, PackageManager, SoftEdgePolicy};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "keg")]
#[command(author, version, about = "Resolve, cache and install Homebrew-style bottles", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Install prefix (overrides KEG_PREFIX)
    #[arg(long, global = true)]
    prefix: Option<PathBuf>,

    /// Directory of formula JSON files
    #[arg(long, global = true)]
    formula_dir: Option<PathBuf>,

    /// When to use colors
    #[arg(long, global = true, value_enum, default_value_t = ColorChoice::Auto)]
    color: ColorChoice,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Install packages and their dependencies
    Install {
        /// Package specs, e.g. `wget`, `openssl@3>=3.0`, `ffmpeg[with-x265]`
        #[arg(required = true)]
        packages: Vec<String>,

        /// Show the plan without installing
        #[arg(long)]
        dry_run: bool,

        /// Concurrent staging workers
        #[arg(short, long)]
        jobs: Option<usize>,

        /// Fail instead of dropping optional or recommended dependencies
        #[arg(long)]
        strict: bool,
    },

    /// Show the installation plan for packages
    Plan {
        #[arg(required = true)]
        packages: Vec<String>,

        #[arg(long)]
        strict: bool,
    },

    /// Uninstall packages
    Uninstall {
        #[arg(required = true)]
        packages: Vec<String>,

        /// Ignore dependents (force uninstall)
        #[arg(long)]
        force: bool,
    },

    /// Upgrade outdated packages (all of them when none are named)
    Upgrade {
        packages: Vec<String>,

        /// Show the plan without upgrading
        #[arg(long)]
        dry_run: bool,
    },

    /// List installed packages with newer versions available
    Outdated {
        packages: Vec<String>,

        #[arg(long)]
        json: bool,
    },

    /// List installed packages
    List {
        /// Show versions and variants
        #[arg(long)]
        versions: bool,

        #[arg(long)]
        json: bool,
    },

    /// Recreate symlinks for installed packages
    Link {
        #[arg(required = true)]
        packages: Vec<String>,
    },

    /// Inspect and maintain the artifact cache
    Cache {
        #[command(subcommand)]
        action: Option<CacheAction>,
    },

    /// Show the effective configuration
    Config {
        #[arg(long)]
        json: bool,
    },

    /// Generate shell completions
    Completions {
        shell: clap_complete::Shell,
    },
}

fn init_logging(verbose: bool) {
    let default = if verbose { "kegbrew=debug,keg=debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default)),
        )
        .with_writer(std::io::stderr)
        .init();
}

fn load_config(cli: &Cli) -> Result<Config> {
    let mut config = Config::load().context("Failed to load configuration")?;
    if let Some(prefix) = &cli.prefix {
        config.prefix = prefix.clone();
    }
    if let Some(dir) = &cli.formula_dir {
        config.formula_dir = Some(dir.clone());
    }

    match &cli.command {
        Some(Commands::Install { jobs, strict, .. }) => {
            if let Some(jobs) = jobs {
                config.jobs = (*jobs).max(1);
            }
            if *strict {
                config.soft_edge_policy = SoftEdgePolicy::Strict;
            }
        }
        Some(Commands::Plan { strict: true, .. }) => {
            config.soft_edge_policy = SoftEdgePolicy::Strict;
        }
        _ => {}
    }
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);
    colors::init_colors(cli.color);

    let Some(command) = &cli.command else {
        println!("{} keg - Homebrew-style bottles, resolved and installed atomically", "🍺".bold());
        println!("\nRun {} to see available commands.", "keg --help".cyan());
        return Ok(());
    };

    if let Commands::Completions { shell } = command {
        clap_complete::generate(*shell, &mut Cli::command(), "keg", &mut std::io::stdout());
        return Ok(());
    }

    let config = load_config(&cli)?;
    tracing::debug!("Using prefix {}", config.prefix.display());
    let pm = PackageManager::new(config).context("Failed to initialize keg")?;

    match command {
        Commands::Install {
            packages, dry_run, ..
        } => commands::install(&pm, packages, *dry_run).await?,
        Commands::Plan { packages, .. } => commands::plan(&pm, packages)?,
        Commands::Uninstall { packages, force } => commands::uninstall(&pm, packages, *force)?,
        Commands::Upgrade { packages, dry_run } => {
            commands::upgrade(&pm, packages, *dry_run).await?
        }
        Commands::Outdated { packages, json } => commands::outdated(&pm, packages, *json)?,
        Commands::List { versions, json } => commands::list(&pm, *versions, *json)?,
        Commands::Link { packages } => commands::link(&pm, packages)?,
        Commands::Cache { action } => {
            commands::cache(&pm, action.unwrap_or(CacheAction::Stats))?
        }
        Commands::Config { json } => commands::config(&pm, *json)?,
        Commands::Completions { .. } => {}
    }

    Ok(())
}
