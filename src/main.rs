use std::{path::PathBuf, process::exit, sync::Arc, time::Duration};

use anyhow::Context;
pub use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use futures::future;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use url::Url;

mod addresses;
mod cache;
mod ckan;
mod errors;
mod files;
mod geocoders;
mod http;
mod metrics_report;
mod pipeline;
mod prepare;
mod progress;
mod report;

use crate::addresses::{LocationColumns, Locality};
use crate::errors::display_causes_and_backtrace;
use crate::geocoders::{
    backends::{Backend, ProviderKind},
    client::ProviderClient,
    fallback::Fallback,
    rate_limit::RateLimit,
    retry::{Backoff, RetryPolicy},
    Geocoder,
};
use crate::http::{shared_http_client, HttpFetcher, HyperFetcher};
use crate::metrics_report::MetricsReporter;
use crate::pipeline::{load_queries, OutputPaths, PipelineConfig, PipelineRunner};

/// Normalize and bulk geocode Toronto ticket locations.
#[derive(Debug, Parser)]
#[command(author, version, about, long_about = None)]
struct Opt {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Normalize the locations in a ticket CSV file into a JSON list of
    /// geocoder queries.
    Prepare(PrepareOpt),

    /// Geocode a JSON list of queries, resuming any interrupted job.
    Geocode(GeocodeOpt),

    /// Download a dataset from a CKAN open-data portal.
    Download(DownloadOpt),
}

impl Command {
    /// A short name for metrics labels.
    fn name(&self) -> &'static str {
        match self {
            Command::Prepare(_) => "prepare",
            Command::Geocode(_) => "geocode",
            Command::Download(_) => "download",
        }
    }
}

#[derive(Args, Debug)]
struct PrepareOpt {
    /// The ticket CSV file to read.
    input: PathBuf,

    /// Where to write our query list.
    #[arg(long, short = 'o', default_value = "geocode_queries.json")]
    output: PathBuf,

    /// The column holding the street.
    #[arg(long, default_value = "location2")]
    street_column: String,

    /// The column holding the cross street.
    #[arg(long, default_value = "location4")]
    cross_street_column: String,

    #[command(flatten)]
    locality: LocalityOpt,
}

#[derive(Args, Debug)]
struct LocalityOpt {
    /// The city appended to every query.
    #[arg(long, default_value = "Toronto")]
    city: String,

    /// The region appended to every query.
    #[arg(long, default_value = "ON")]
    region: String,

    /// The country appended to every query.
    #[arg(long, default_value = "Canada")]
    country: String,
}

#[derive(Args, Debug)]
struct GeocodeOpt {
    /// A JSON array of queries, as written by `prepare`.
    #[arg(long, default_value = "geocode_queries.json")]
    queries: PathBuf,

    /// Where to keep our cache, checkpoint and reports.
    #[arg(long, default_value = ".")]
    output_dir: PathBuf,

    /// The geocoding provider: nominatim, geocodio or maps-co.
    #[arg(long, env = "GEOCODER_PROVIDER", default_value = "nominatim")]
    provider: ProviderKind,

    /// The API key for our provider.
    #[arg(long, env = "GEOCODER_API_KEY", hide_env_values = true)]
    api_key: Option<String>,

    /// Use a different endpoint, like a self-hosted Nominatim.
    #[arg(long, env = "GEOCODER_BASE_URL")]
    base_url: Option<Url>,

    /// A second provider to ask about queries the first one can't find.
    #[arg(long, env = "GEOCODER_FALLBACK_PROVIDER")]
    fallback_provider: Option<ProviderKind>,

    /// The API key for our fallback provider.
    #[arg(long, env = "GEOCODER_FALLBACK_API_KEY", hide_env_values = true)]
    fallback_api_key: Option<String>,

    /// The most requests we may start in any one second.
    #[arg(long, env = "GEOCODER_REQUESTS_PER_SECOND", default_value_t = 1.0)]
    requests_per_second: f64,

    /// The most requests we may have in flight at once. Defaults to, and may
    /// not exceed, the rate rounded down (but at least one).
    #[arg(long, env = "GEOCODER_MAX_IN_FLIGHT")]
    max_in_flight: Option<usize>,

    /// How many queries to process between progress reports.
    #[arg(long, env = "GEOCODER_BATCH_SIZE", default_value_t = 25)]
    batch_size: usize,

    /// Save our cache and checkpoint after this many results.
    #[arg(long, env = "GEOCODER_CHECKPOINT_INTERVAL", default_value_t = 100)]
    checkpoint_interval: usize,

    /// How many times to try each query before giving up for this run.
    #[arg(long, env = "GEOCODER_MAX_ATTEMPTS", default_value_t = 3)]
    max_attempts: u32,

    /// How our wait between attempts grows: linear or exponential.
    #[arg(long, env = "GEOCODER_BACKOFF", default_value = "linear")]
    backoff: Backoff,

    /// Our first wait between attempts, in milliseconds.
    #[arg(long, env = "GEOCODER_RETRY_DELAY_MS", default_value_t = 2000)]
    retry_delay_ms: u64,

    /// How long a request slot stays busy after its request finishes, in
    /// milliseconds.
    #[arg(long, env = "GEOCODER_MIN_DELAY_MS", default_value_t = 0)]
    min_delay_ms: u64,

    /// How long to wait for a single request, in seconds.
    #[arg(long, env = "GEOCODER_TIMEOUT_SECS", default_value_t = 30)]
    timeout_secs: u64,
}

#[derive(Args, Debug)]
struct DownloadOpt {
    /// The CKAN package to download, like `parking-tickets`.
    package: String,

    /// Where to write the downloaded file.
    #[arg(long, short = 'o')]
    output: PathBuf,

    /// The CKAN portal to use.
    #[arg(long, env = "CKAN_BASE_URL", default_value = ckan::DEFAULT_BASE_URL)]
    base_url: Url,

    /// Acceptable resource formats, most preferred first.
    #[arg(long, value_delimiter = ',', default_value = "CSV,ZIP,JSON")]
    format: Vec<String>,
}

fn main() {
    // Set up basic logging.
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    if let Err(err) = run() {
        display_causes_and_backtrace(&err);
        exit(1);
    }
}

/// Our main entry point.
fn run() -> Result<()> {
    let opt = Opt::parse();
    let metrics = MetricsReporter::install(opt.command.name())?;

    match opt.command {
        Command::Prepare(prepare_opt) => prepare(prepare_opt)?,
        Command::Geocode(geocode_opt) => block_on(geocode(geocode_opt))?,
        Command::Download(download_opt) => block_on(download(download_opt))?,
    }

    metrics.report();
    Ok(())
}

/// Run `fut` to completion on a single-threaded runtime.
fn block_on<F: future::Future<Output = Result<()>>>(fut: F) -> Result<()> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("unable to create a runtime")?;
    runtime.block_on(fut)
}

fn prepare(opt: PrepareOpt) -> Result<()> {
    let columns = LocationColumns {
        street: opt.street_column,
        cross_street: Some(opt.cross_street_column),
    };
    let locality = Locality {
        city: opt.locality.city,
        region: opt.locality.region,
        country: opt.locality.country,
    };
    prepare::prepare_queries(&opt.input, &opt.output, &columns, &locality)?;
    Ok(())
}

async fn geocode(opt: GeocodeOpt) -> Result<()> {
    // Check everything we can before we touch the network.
    let primary = opt
        .provider
        .build(opt.api_key.as_deref(), opt.base_url.as_ref())?;
    let secondary = opt
        .fallback_provider
        .map(|kind| kind.build(opt.fallback_api_key.as_deref(), None))
        .transpose()?;
    let queries = load_queries(&opt.queries)?;

    let max_in_flight = match opt.max_in_flight {
        Some(requested) => RateLimit::clamp_max_in_flight(opt.requests_per_second, requested),
        None => RateLimit::default_max_in_flight(opt.requests_per_second),
    };
    let retry = RetryPolicy {
        max_attempts: opt.max_attempts.max(1),
        base_delay: Duration::from_millis(opt.retry_delay_ms),
        backoff: opt.backoff,
        ..RetryPolicy::default()
    };
    let fetcher: Arc<dyn HttpFetcher> = Arc::new(HyperFetcher::new(
        "geocoder",
        shared_http_client(max_in_flight),
    ));
    let client = |backend: Box<dyn Backend>| -> Result<Box<dyn Geocoder>> {
        Ok(Box::new(ProviderClient::new(
            backend,
            fetcher.clone(),
            RateLimit::new(
                opt.requests_per_second,
                max_in_flight,
                Duration::from_millis(opt.min_delay_ms),
            )?,
            retry.clone(),
            Duration::from_secs(opt.timeout_secs),
        )))
    };
    let geocoder: Box<dyn Geocoder> = match secondary {
        Some(secondary) => Box::new(Fallback::new(client(primary)?, client(secondary)?)),
        None => client(primary)?,
    };
    info!(
        "geocoding with {} at {} requests/sec, {} in flight",
        geocoder.tag(),
        opt.requests_per_second,
        max_in_flight,
    );

    let paths = OutputPaths::in_dir(&opt.output_dir);
    let cache = cache::GeocodeCache::load(&paths.cache);
    let mut runner = PipelineRunner::new(
        geocoder,
        cache,
        paths,
        PipelineConfig {
            batch_size: opt.batch_size,
            checkpoint_interval: opt.checkpoint_interval,
            concurrency: max_in_flight,
        },
    );
    let summary = runner.run(&queries, shutdown_signal()).await?;
    summary.log();
    if !summary.completed {
        warn!("run again to finish the remaining queries");
    }
    Ok(())
}

async fn download(opt: DownloadOpt) -> Result<()> {
    let fetcher = HyperFetcher::new("ckan", shared_http_client(1));
    ckan::download_package(
        &fetcher,
        &opt.base_url,
        &opt.package,
        &opt.format,
        &opt.output,
    )
    .await?;
    Ok(())
}

/// Completes when the user presses Ctrl-C.
async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!("cannot listen for Ctrl-C: {}", err);
        future::pending::<()>().await;
    }
}
