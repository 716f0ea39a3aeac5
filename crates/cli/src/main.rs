mod cmd;
mod output;

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use kiln_lib::cache::CachePolicy;
use kiln_lib::config::EngineConfig;

use crate::output::OutputFormat;

/// kiln - content-addressed container build engine
#[derive(Parser)]
#[command(name = "kiln")]
#[command(author, version, about, long_about = None)]
struct Cli {
  /// Enable debug logging
  #[arg(short, long, global = true)]
  verbose: bool,

  /// Engine root (defaults to $KILN_ROOT, then the user cache directory)
  #[arg(long, global = true, value_name = "DIR")]
  root: Option<PathBuf>,

  /// Output format
  #[arg(short, long, global = true, value_enum, default_value_t)]
  output: OutputFormat,

  #[command(subcommand)]
  command: Commands,
}

#[derive(Subcommand)]
enum Commands {
  /// Run a pipeline script
  Run {
    /// Path to the pipeline script
    #[arg(default_value = "kiln.json")]
    script: PathBuf,

    #[command(flatten)]
    engine: EngineArgs,

    #[command(flatten)]
    policy: PolicyArgs,

    /// Do not print process output
    #[arg(short, long)]
    quiet: bool,
  },

  /// Show the graph a pipeline script builds without running it
  Plan {
    /// Path to the pipeline script
    #[arg(default_value = "kiln.json")]
    script: PathBuf,
  },

  /// Evict cache entries and delete unreferenced snapshots
  Gc {
    /// Show what would be removed without deleting anything
    #[arg(long)]
    dry_run: bool,

    #[command(flatten)]
    policy: PolicyArgs,
  },

  /// Inspect or empty the result cache
  Cache {
    #[command(subcommand)]
    command: CacheCommands,
  },

  /// Show engine locations and platform
  Info,
}

#[derive(Subcommand)]
enum CacheCommands {
  /// List cached results, most recently used first
  List,
  /// Remove every unpinned entry
  Clear,
}

#[derive(Args)]
struct EngineArgs {
  /// Maximum concurrent executions
  #[arg(short = 'j', long)]
  parallelism: Option<usize>,

  /// Time limit for each exec step (e.g. "90s", "10m")
  #[arg(long, value_parser = humantime::parse_duration)]
  timeout: Option<Duration>,

  /// Directory relative host paths are resolved against
  #[arg(short = 'C', long, value_name = "DIR")]
  workdir: Option<PathBuf>,

  /// Refuse all host filesystem access
  #[arg(long)]
  no_host: bool,

  /// Do not read or write the on-disk cache
  #[arg(long)]
  ephemeral: bool,

  /// Extra environment for every exec step
  #[arg(short, long = "env", value_name = "KEY=VALUE", value_parser = parse_env_var)]
  env: Vec<(String, String)>,
}

#[derive(Args)]
struct PolicyArgs {
  /// Keep at most this many cache entries
  #[arg(long)]
  max_entries: Option<usize>,

  /// Keep at most this many bytes of cached snapshots
  #[arg(long)]
  max_bytes: Option<u64>,

  /// Drop entries not used for this long (e.g. "7days")
  #[arg(long, value_parser = humantime::parse_duration)]
  max_age: Option<Duration>,
}

impl PolicyArgs {
  fn apply(&self, config: &mut EngineConfig) {
    config.cache_policy = CachePolicy {
      max_entries: self.max_entries.or(config.cache_policy.max_entries),
      max_bytes: self.max_bytes.or(config.cache_policy.max_bytes),
      max_age: self.max_age.or(config.cache_policy.max_age),
    };
  }
}

impl EngineArgs {
  fn apply(self, config: &mut EngineConfig) -> Result<()> {
    if let Some(parallelism) = self.parallelism {
      if parallelism == 0 {
        bail!("--parallelism must be at least 1");
      }
      config.parallelism = parallelism;
    }
    if self.timeout.is_some() {
      config.exec_timeout = self.timeout;
    }
    if let Some(workdir) = self.workdir {
      config.host_workdir =
        dunce::canonicalize(&workdir).with_context(|| format!("Invalid workdir: {}", workdir.display()))?;
    }
    config.disable_host_access |= self.no_host;
    config.persist_cache &= !self.ephemeral;
    config.exec_env.extend(self.env);
    Ok(())
  }
}

fn parse_env_var(value: &str) -> Result<(String, String), String> {
  match value.split_once('=') {
    Some((key, val)) if !key.is_empty() => Ok((key.to_string(), val.to_string())),
    _ => Err(format!("expected KEY=VALUE, got {:?}", value)),
  }
}

/// Environment defaults overlaid with the global flags.
fn engine_config(root: Option<PathBuf>) -> Result<EngineConfig> {
  let mut config = EngineConfig::from_env().context("Invalid engine configuration")?;
  if let Some(root) = root {
    config.root = root;
  }
  Ok(config)
}

fn main() -> Result<()> {
  let cli = Cli::parse();

  let filter = if cli.verbose {
    EnvFilter::new("debug")
  } else {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
  };
  tracing_subscriber::fmt()
    .with_env_filter(filter)
    .with_writer(std::io::stderr)
    .without_time()
    .init();

  let mut config = engine_config(cli.root)?;

  match cli.command {
    Commands::Run {
      script,
      engine,
      policy,
      quiet,
    } => {
      engine.apply(&mut config)?;
      policy.apply(&mut config);
      cmd::cmd_run(&script, config, quiet, cli.output)
    }
    Commands::Plan { script } => cmd::cmd_plan(&script, config, cli.output),
    Commands::Gc { dry_run, policy } => {
      policy.apply(&mut config);
      cmd::cmd_gc(&config, dry_run, cli.output)
    }
    Commands::Cache { command } => match command {
      CacheCommands::List => cmd::cmd_cache_list(&config, cli.output),
      CacheCommands::Clear => cmd::cmd_cache_clear(&config, cli.output),
    },
    Commands::Info => cmd::cmd_info(&config, cli.output),
  }
}
