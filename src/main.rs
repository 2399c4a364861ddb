use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use serde_json::Value;
use tracing::warn;

use rentometer_cli::listing::{self, Listing, ListingError, ListingSummary};
use rentometer_cli::rentometer::{
    BrowserConfig, EstimateCache, EstimateCollection, RentEstimator, RentometerProvider,
    RetryPolicy,
};
use rentometer_cli::scenario::{self, ScenarioParams};

const DEFAULT_WEBDRIVER_URL: &str = "http://localhost:4444";
const DEFAULT_TOR_PATH: &str = "tor";
const DEFAULT_SOCKS_PORT: u16 = 9050;
const DEFAULT_CACHE_DIR: &str = "rent-cache";

#[derive(Parser)]
#[command(name = "rentometer-cli")]
#[command(
    about = "Personal real-estate deal analysis: listings, rent estimates, scenario sheets",
    long_about = None
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct SourceArgs {
    /// Listing page or search payload URL
    #[arg(long)]
    url: Option<String>,

    /// Saved listing page or search payload file
    #[arg(long)]
    file: Option<String>,

    /// Which listing to use when the source holds several (zillow payloads)
    #[arg(long, default_value_t = 0)]
    index: usize,
}

#[derive(Args)]
struct SessionArgs {
    #[arg(long, default_value_t = false, action = clap::ArgAction::Set)]
    headless: bool,

    /// WebDriver endpoint (geckodriver); RENTOMETER_WEBDRIVER_URL
    #[arg(long)]
    webdriver_url: Option<String>,

    /// Path to the tor binary; TOR_PATH
    #[arg(long)]
    tor_path: Option<String>,

    /// Local SOCKS port tor should bind; TOR_SOCKS_PORT
    #[arg(long)]
    socks_port: Option<u16>,

    /// Estimate cache directory; RENT_CACHE_DIR
    #[arg(long)]
    cache_dir: Option<String>,

    /// Give up after this many circuit/browser acquisition attempts
    #[arg(long, default_value_t = 8)]
    max_session_attempts: u32,
}

#[derive(Subcommand)]
enum Commands {
    /// Parse a listing and print its identity and unit breakdown
    Listing {
        #[command(flatten)]
        source: SourceArgs,
    },

    /// Query rentometer for per-unit rent estimates
    Estimate {
        #[command(flatten)]
        source: SourceArgs,

        #[command(flatten)]
        session: SessionArgs,
    },

    /// Estimate rents and write the financial scenario sheet
    Analyze {
        #[command(flatten)]
        source: SourceArgs,

        #[command(flatten)]
        session: SessionArgs,

        #[arg(long, value_delimiter = ',', default_values_t = vec![5.0])]
        down_payment_rates: Vec<f64>,

        #[arg(long, value_delimiter = ',', default_values_t = vec![3.23])]
        mortgage_rates: Vec<f64>,

        #[arg(long, value_delimiter = ',', default_values_t = vec![10.0])]
        management_rates: Vec<f64>,

        /// Output CSV path; defaults to a timestamped file under output/
        #[arg(long)]
        out: Option<String>,
    },

    /// List cached estimate runs, or clear one address
    Cache {
        /// Address whose cached estimates should be deleted
        #[arg(long)]
        clear: Option<String>,

        #[arg(long)]
        cache_dir: Option<String>,
    },
}

fn resolve_setting(value: Option<String>, env_key: &str, default: &str) -> String {
    if let Some(val) = value {
        let trimmed = val.trim();
        if !trimmed.is_empty() {
            return trimmed.to_string();
        }
    }
    if let Ok(val) = std::env::var(env_key) {
        if !val.trim().is_empty() {
            return val;
        }
    }
    default.to_string()
}

fn resolve_socks_port(value: Option<u16>) -> Result<u16> {
    if let Some(port) = value {
        return Ok(port);
    }
    match std::env::var("TOR_SOCKS_PORT") {
        Ok(val) => val
            .trim()
            .parse()
            .with_context(|| format!("TOR_SOCKS_PORT is not a valid port: {}", val)),
        Err(_) => Ok(DEFAULT_SOCKS_PORT),
    }
}

async fn load_listings(source: &SourceArgs) -> Result<Vec<Listing>> {
    let raw = match (&source.url, &source.file) {
        (Some(url), None) => listing::fetch_page(url).await?,
        (None, Some(path)) => std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read listing file {}", path))?,
        _ => bail!("Provide exactly one of --url or --file"),
    };
    parse_listings(&raw)
}

/// Compass pages embed the listing JSON in a script tag; anything else is
/// expected to be a JSON payload, either a zillow search state or a single
/// raw listing.
fn parse_listings(raw: &str) -> Result<Vec<Listing>> {
    if raw.contains("__PARTIAL_INITIAL_DATA__") {
        return Ok(vec![listing::from_compass_html(raw)?]);
    }

    let payload: Value = serde_json::from_str(raw.trim())
        .context("Input is neither a compass page nor a JSON payload")?;
    match listing::extract_zillow_listings(&payload) {
        Ok(listings) => Ok(listings),
        Err(ListingError::NotASearchPayload) => Ok(vec![Listing::new(payload)]),
        Err(err) => Err(err.into()),
    }
}

async fn load_summary(source: &SourceArgs) -> Result<ListingSummary> {
    let listings = load_listings(source).await?;
    let total = listings.len();
    let listing = listings.into_iter().nth(source.index).with_context(|| {
        format!(
            "Listing index {} out of range ({} listings)",
            source.index, total
        )
    })?;
    listing.summarize()
}

async fn run_estimate(
    summary: &ListingSummary,
    session: &SessionArgs,
) -> Result<EstimateCollection> {
    let cache = EstimateCache::new(resolve_setting(
        session.cache_dir.clone(),
        "RENT_CACHE_DIR",
        DEFAULT_CACHE_DIR,
    ));
    let provider = RentometerProvider::new(BrowserConfig {
        webdriver_url: resolve_setting(
            session.webdriver_url.clone(),
            "RENTOMETER_WEBDRIVER_URL",
            DEFAULT_WEBDRIVER_URL,
        ),
        headless: session.headless,
        tor_binary: resolve_setting(session.tor_path.clone(), "TOR_PATH", DEFAULT_TOR_PATH),
        socks_port: resolve_socks_port(session.socks_port)?,
    });
    let retry = RetryPolicy {
        max_session_attempts: session.max_session_attempts,
        ..RetryPolicy::default()
    };

    let mut estimator = RentEstimator::new(provider, cache).with_retry_policy(retry);
    estimator.estimate(summary).await
}

fn print_summary(summary: &ListingSummary) {
    println!("\nAddress:  {}", summary.address);
    println!("Price:    ${:.2}", summary.price);
    println!("Units:");
    for (idx, unit) in summary.units.iter().enumerate() {
        println!(
            "  {:<3} {:>4} bed / {:>4} bath",
            idx + 1,
            unit.beds,
            unit.baths
        );
    }
}

fn print_estimates(collection: &EstimateCollection) {
    if collection.is_empty() {
        println!("\nNo estimates were collected. See the log for what went wrong.");
        return;
    }

    println!(
        "\n{:<18} {:<6} {:<6} {:>14}",
        "Estimate", "Beds", "Baths", "Monthly Rent"
    );
    println!("{}", "-".repeat(48));

    for group in collection.groups() {
        for estimate in &group.units {
            println!(
                "{:<18} {:<6} {:<6} {:>14}",
                group.kind.label(),
                estimate.unit.beds,
                estimate.unit.baths,
                format!("${:.2}", estimate.monthly_rent)
            );
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();

    dotenv::dotenv().ok();

    let cli = Cli::parse();

    match cli.command {
        Commands::Listing { source } => {
            let summary = load_summary(&source).await?;
            print_summary(&summary);
        }

        Commands::Estimate { source, session } => {
            let summary = load_summary(&source).await?;
            print_summary(&summary);

            let estimates = run_estimate(&summary, &session).await?;
            print_estimates(&estimates);
        }

        Commands::Analyze {
            source,
            session,
            down_payment_rates,
            mortgage_rates,
            management_rates,
            out,
        } => {
            let summary = load_summary(&source).await?;
            print_summary(&summary);

            let estimates = run_estimate(&summary, &session).await?;
            print_estimates(&estimates);

            if estimates.is_empty() {
                warn!("No estimates collected; skipping the scenario sheet");
                return Ok(());
            }

            let params = ScenarioParams {
                down_payment_rates,
                yearly_mortgage_rates: mortgage_rates,
                monthly_management_rates: management_rates,
                ..ScenarioParams::default()
            };
            let scenarios = scenario::expand_scenarios(summary.price, &params, &estimates);
            let filename = out.unwrap_or_else(|| scenario::scenario_csv_filename(&summary.address));
            scenario::export_to_csv(&scenarios, &filename)?;
            println!("\nWrote {} scenarios to {}", scenarios.len(), filename);
        }

        Commands::Cache { clear, cache_dir } => {
            let cache = EstimateCache::new(resolve_setting(
                cache_dir,
                "RENT_CACHE_DIR",
                DEFAULT_CACHE_DIR,
            ));

            match clear {
                Some(address) => cache.remove(&address)?,
                None => {
                    let entries = cache.entries()?;
                    if entries.is_empty() {
                        println!("No cached estimates under {:?}", cache.root());
                    } else {
                        println!("\n{:<48} {:<22} {:>9}", "Address", "Saved", "Estimates");
                        println!("{}", "-".repeat(82));
                        for entry in entries {
                            println!(
                                "{:<48} {:<22} {:>9}",
                                entry.address,
                                entry.saved_at.format("%Y-%m-%d %H:%M:%S"),
                                entry.estimates.total_estimates()
                            );
                        }
                    }
                }
            }
        }
    }

    Ok(())
}
