//! Command-line entry point: build a system image from a YAML file and
//! emit the requested output formats.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use kitbuild::build::build_image;
use kitbuild::cache::BuildCache;
use kitbuild::config::{apply_overrides, Config};
use kitbuild::engine::DockerCli;
use kitbuild::output::OutputDispatcher;

#[derive(Parser)]
#[command(name = "kitbuild", about = "Build bootable system images from YAML", version)]
struct Cli {
    /// More log output (repeat for debug).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Only log errors.
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build an image from a YAML description.
    Build {
        /// The YAML file describing the image.
        file: PathBuf,

        /// Name for the output files (defaults to the YAML file's stem).
        #[arg(short, long)]
        name: Option<String>,

        /// Directory to write outputs into (defaults to the current one).
        #[arg(short, long)]
        output_dir: Option<PathBuf>,

        /// Output formats to generate.
        #[arg(short = 'f', long = "format", default_values = ["kernel+initrd"])]
        formats: Vec<String>,

        /// Size in MB for disk-image formats.
        #[arg(long, default_value_t = 1024)]
        size: u32,

        /// Always pull images, even when present locally.
        #[arg(long)]
        pull: bool,

        /// Cache directory for bootstrap artifacts.
        #[arg(long)]
        cache: Option<PathBuf>,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.quiet {
        "error"
    } else {
        match cli.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| default_level.into()))
        .with_target(false)
        .init();

    match cli.command {
        Commands::Build {
            file,
            name,
            output_dir,
            formats,
            size,
            pull,
            cache,
        } => build(&file, name, output_dir, &formats, size, pull, cache),
    }
}

fn build(
    file: &Path,
    name: Option<String>,
    output_dir: Option<PathBuf>,
    formats: &[String],
    size: u32,
    pull: bool,
    cache: Option<PathBuf>,
) -> Result<()> {
    let base = match name {
        Some(name) => name,
        None => file
            .file_stem()
            .context("Cannot derive an output name from the file path; pass --name")?
            .to_string_lossy()
            .into_owned(),
    };
    let base = match output_dir {
        Some(dir) => {
            fs::create_dir_all(&dir)
                .with_context(|| format!("Failed to create output directory {}", dir.display()))?;
            dir.join(&base).to_string_lossy().into_owned()
        }
        None => base,
    };

    let yaml = fs::read(file)
        .with_context(|| format!("Failed to read config file {}", file.display()))?;
    let config = Config::from_yaml(&yaml)
        .with_context(|| format!("Failed to load config file {}", file.display()))?;
    let config = apply_overrides(config);

    let cache_root = match cache {
        Some(dir) => dir,
        None => dirs::home_dir()
            .context("Cannot locate a home directory for the cache; pass --cache")?
            .join(".moby"),
    };
    let cache = BuildCache::open(&cache_root)
        .with_context(|| format!("Failed to open cache at {}", cache_root.display()))?;

    let engine = DockerCli::new().context("Failed to locate a container engine")?;
    let dispatcher = OutputDispatcher::new(&engine, &cache, pull);

    // Reject bad format names and build prerequisites before the
    // expensive image assembly starts.
    dispatcher.validate_formats(formats)?;

    tracing::info!(%base, "building image");
    let mut image = Vec::new();
    build_image(&config, &mut image, &engine, pull)
        .with_context(|| format!("Failed to build image {base:?}"))?;

    dispatcher.generate_outputs(&base, &image, formats, size)?;
    Ok(())
}
