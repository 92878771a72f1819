use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use chrono::{DateTime, Utc};
use clap::Parser;
use color_eyre::eyre::{Result, WrapErr, eyre};
use serde::Serialize;
use tracing::info;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};
use url::Url;

use imagekeep::application::{ImageManager, RetrieveOptions};
use imagekeep::domain::entities::{LocalFileImageDataProvider, resource_into_source};
use imagekeep::domain::ports::{ImageProcessor, ResizingImageProcessor};
use imagekeep::domain::Source;
use imagekeep::infrastructure::config::{FetchArgs, InfoArgs};
use imagekeep::infrastructure::{AppConfig, CliArgs, Command, ConfigStore, ImageCache, ImageDownloader};

fn init_logging(config: &AppConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_level.to_string()));

    if let Some(log_path) = config.effective_log_path() {
        if let Some(parent) = log_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)?;

        let file_layer = fmt::layer()
            .with_writer(file)
            .with_ansi(false)
            .with_target(true)
            .with_thread_ids(false);

        tracing_subscriber::registry()
            .with(filter)
            .with(file_layer)
            .init();

        info!(path = %log_path.display(), "Logging initialized");
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_writer(std::io::stderr))
            .init();
    }

    Ok(())
}

fn parse_source(input: &str) -> Result<Source> {
    if let Ok(url) = Url::parse(input) {
        return Ok(resource_into_source(Arc::new(url)));
    }
    let path = std::fs::canonicalize(input)
        .wrap_err_with(|| format!("Source is neither a URL nor a readable file: {input}"))?;
    Ok(Source::provider(LocalFileImageDataProvider::new(path)))
}

fn parse_processor(resize: Option<&str>) -> Result<Option<ResizingImageProcessor>> {
    resize
        .map(|size| {
            ResizingImageProcessor::parse(size)
                .ok_or_else(|| eyre!("Invalid size {size:?}, expected WIDTHxHEIGHT"))
        })
        .transpose()
}

fn format_time(time: SystemTime) -> String {
    DateTime::<Utc>::from(time).to_rfc3339()
}

#[derive(Debug, Serialize)]
struct FetchReport {
    source: String,
    cache_key: String,
    processor: String,
    cache_type: String,
    width: u32,
    height: u32,
    output: Option<PathBuf>,
}

#[derive(Debug, Serialize)]
struct InfoReport {
    key: String,
    processor: String,
    cache_type: String,
    file_name: String,
    path: PathBuf,
    size: Option<u64>,
    last_access: Option<String>,
    expires: Option<String>,
}

fn print_report<T: Serialize>(report: &T, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(report)?);
    } else {
        let value = serde_json::to_value(report)?;
        if let Some(fields) = value.as_object() {
            for (name, field) in fields {
                match field {
                    serde_json::Value::Null => {}
                    serde_json::Value::String(text) => println!("{name}: {text}"),
                    other => println!("{name}: {other}"),
                }
            }
        }
    }
    Ok(())
}

async fn fetch(config: &AppConfig, cache: Arc<ImageCache>, args: FetchArgs) -> Result<()> {
    let downloader = ImageDownloader::with_default_transport("imagekeep")?
        .with_timeout(config.download.timeout());
    let manager = Arc::new(ImageManager::new(cache, Arc::new(downloader)));

    let source = parse_source(&args.source)?;
    let mut options: RetrieveOptions = config.retrieve.options();
    options.force_refresh = args.force_refresh;
    options.only_from_cache = args.only_from_cache;
    options.cache_memory_only = args.memory_only;
    options.alternative_sources = args
        .alternatives
        .iter()
        .map(|alternative| parse_source(alternative))
        .collect::<Result<Vec<_>>>()?;
    if let Some(processor) = parse_processor(args.resize.as_deref())? {
        options.processor = Arc::new(processor);
    }
    let processor = options.processor_identifier();

    let result = manager.retrieve(source, options).await.map_err(|e| {
        if let Some(errors) = e.propagation_errors() {
            for failure in errors {
                tracing::warn!(source = %failure.source, error = %failure.error, "Source failed");
            }
        }
        eyre!(e).wrap_err("Retrieval failed")
    })?;

    if let Some(output) = &args.output {
        result
            .image
            .as_dynamic()
            .save(output)
            .wrap_err_with(|| format!("Failed to write {}", output.display()))?;
    }

    print_report(
        &FetchReport {
            source: result.source.to_string(),
            cache_key: result.source.cache_key(),
            processor,
            cache_type: result.cache_type.to_string(),
            width: result.image.width(),
            height: result.image.height(),
            output: args.output,
        },
        args.json,
    )
}

fn info(cache: &ImageCache, args: &InfoArgs) -> Result<()> {
    let processor = parse_processor(args.resize.as_deref())?
        .map(|processor| processor.identifier())
        .unwrap_or_default();
    let path = cache.cache_path(&args.key, &processor);
    let metadata = std::fs::metadata(&path).ok();

    print_report(
        &InfoReport {
            key: args.key.clone(),
            cache_type: cache.image_cached_type(&args.key, &processor).to_string(),
            file_name: cache.hash(&args.key, &processor),
            processor,
            size: metadata.as_ref().map(std::fs::Metadata::len),
            last_access: metadata
                .as_ref()
                .and_then(|m| m.accessed().ok())
                .map(format_time),
            expires: metadata
                .as_ref()
                .and_then(|m| m.modified().ok())
                .map(format_time),
            path,
        },
        args.json,
    )
}

fn load_config(args: &CliArgs) -> Result<AppConfig> {
    let store = ConfigStore::new()?;
    let mut config = store.load_config(args.config.as_deref())?;
    config.merge_with_args(args);
    Ok(config)
}

fn describe(path: &Path) -> String {
    path.file_name()
        .map_or_else(|| path.display().to_string(), |name| name.to_string_lossy().into_owned())
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    dotenvy::dotenv().ok();

    let args = CliArgs::parse();
    let config = load_config(&args)?;
    init_logging(&config)?;

    info!(version = imagekeep::VERSION, "Starting imagekeep");

    let cache = Arc::new(config.cache.build()?);

    match args.command {
        Command::Fetch(fetch_args) => fetch(&config, cache, fetch_args).await,
        Command::Info(info_args) => info(&cache, &info_args),
        Command::Clean => {
            let removed = cache.clean_expired_cache().await?;
            for path in &removed {
                info!(file = %describe(path), "Removed cache file");
            }
            println!("removed {} file(s)", removed.len());
            Ok(())
        }
        Command::Clear => {
            cache.clear_cache().await?;
            println!("cache cleared");
            Ok(())
        }
        Command::Size => {
            println!("{}", cache.calculate_disk_storage_size().await?);
            Ok(())
        }
    }
}
