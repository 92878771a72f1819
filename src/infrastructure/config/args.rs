use super::app_config::LogLevel;
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(
    name = "imagekeep",
    version,
    about = "Fetch images into a two-tier cache and manage it",
    long_about = None
)]
pub struct CliArgs {
    /// Configuration file path.
    #[arg(short, long, value_name = "PATH", global = true)]
    pub config: Option<PathBuf>,

    /// Log file path.
    #[arg(long, value_name = "PATH", global = true)]
    pub log_path: Option<PathBuf>,

    /// Log verbosity level.
    #[arg(long, value_enum, global = true)]
    pub log_level: Option<LogLevel>,

    /// Base directory of the disk cache.
    #[arg(long, value_name = "PATH", global = true)]
    pub cache_dir: Option<PathBuf>,

    /// Cache name.
    #[arg(long, global = true)]
    pub cache_name: Option<String>,

    /// Download timeout in seconds.
    #[arg(long, global = true)]
    pub timeout: Option<u64>,

    /// Retries per source.
    #[arg(long, global = true)]
    pub retries: Option<u32>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Retrieve an image through the cache.
    Fetch(FetchArgs),
    /// Show how an image is cached.
    Info(InfoArgs),
    /// Remove expired and oversized entries.
    Clean,
    /// Remove every cached image.
    Clear,
    /// Print the disk cache size in bytes.
    Size,
}

#[derive(Debug, Args)]
pub struct FetchArgs {
    /// URL, `file://` URL or local path.
    pub source: String,

    /// Fallback sources tried in order.
    #[arg(long = "alternative", value_name = "SOURCE")]
    pub alternatives: Vec<String>,

    /// Ignore cached copies.
    #[arg(long)]
    pub force_refresh: bool,

    /// Fail instead of downloading on a miss.
    #[arg(long)]
    pub only_from_cache: bool,

    /// Do not write to disk.
    #[arg(long)]
    pub memory_only: bool,

    /// Resize to fit WIDTHxHEIGHT.
    #[arg(long, value_name = "WxH")]
    pub resize: Option<String>,

    /// Write the image to this file.
    #[arg(short, long, value_name = "PATH")]
    pub output: Option<PathBuf>,

    /// Print the result as JSON.
    #[arg(long)]
    pub json: bool,
}

#[derive(Debug, Args)]
pub struct InfoArgs {
    /// Cache key, usually the source URL.
    pub key: String,

    /// Inspect the WIDTHxHEIGHT rendition.
    #[arg(long, value_name = "WxH")]
    pub resize: Option<String>,

    /// Print the result as JSON.
    #[arg(long)]
    pub json: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fetch_with_alternatives() {
        let args = CliArgs::parse_from([
            "imagekeep",
            "fetch",
            "https://a/x.png",
            "--alternative",
            "https://b/x.png",
            "--alternative",
            "https://c/x.png",
            "--resize",
            "64x64",
            "--json",
        ]);
        let Command::Fetch(fetch) = args.command else {
            panic!("expected fetch");
        };
        assert_eq!(fetch.alternatives.len(), 2);
        assert_eq!(fetch.resize.as_deref(), Some("64x64"));
        assert!(fetch.json);
        assert!(!fetch.force_refresh);
    }

    #[test]
    fn test_global_flags_after_subcommand() {
        let args = CliArgs::parse_from(["imagekeep", "clean", "--cache-dir", "/tmp/ik"]);
        assert!(matches!(args.command, Command::Clean));
        assert_eq!(args.cache_dir, Some(PathBuf::from("/tmp/ik")));
    }
}
