mod browser;
mod cache;
mod tor;

pub use browser::{BrowserConfig, RentometerProvider, RentometerSession};
pub use cache::{cache_key, CacheEntry, EstimateCache};
pub use tor::{TorClient, TorProcess};

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use rand::Rng;
use scraper::{Html, Selector};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use crate::listing::{DollarAmount, ListingSummary, Unit};

#[derive(Debug, Error)]
pub enum SessionError {
    /// The anonymizing client never reached its ready state.
    #[error("tor client failed to reach ready state: {0}")]
    StartupFailed(String),
    /// The acquire/probe loop ran out of attempts without finding an
    /// unthrottled session.
    #[error("no unthrottled session after {attempts} attempts")]
    ExhaustedRetries { attempts: u32 },
    #[error(transparent)]
    WebDriver(#[from] thirtyfour::error::WebDriverError),
}

/// The four statistics rentometer reports per query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EstimateKind {
    Average,
    Median,
    Percentile25,
    Percentile75,
}

impl EstimateKind {
    pub const ALL: [EstimateKind; 4] = [
        EstimateKind::Average,
        EstimateKind::Median,
        EstimateKind::Percentile25,
        EstimateKind::Percentile75,
    ];

    pub fn label(&self) -> &'static str {
        match self {
            EstimateKind::Average => "average",
            EstimateKind::Median => "median",
            EstimateKind::Percentile25 => "25th percentile",
            EstimateKind::Percentile75 => "75th percentile",
        }
    }

    /// Classify a stat box by its label text. Unknown labels return `None`
    /// so presentation changes degrade into a logged skip, not a failure.
    fn from_stat_label(text: &str) -> Option<Self> {
        let text = text.to_uppercase();
        if text.contains("AVERAGE") {
            Some(EstimateKind::Average)
        } else if text.contains("MEDIAN") {
            Some(EstimateKind::Median)
        } else if text.contains("25TH PERCENTILE") {
            Some(EstimateKind::Percentile25)
        } else if text.contains("75TH PERCENTILE") {
            Some(EstimateKind::Percentile75)
        } else {
            None
        }
    }
}

/// One rent estimate for one unit.
///
/// A `monthly_rent` of zero is also what a unit gets when rentometer could
/// not produce an analysis for it, matching the original sheet behavior.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct UnitEstimate {
    pub unit: Unit,
    pub monthly_rent: DollarAmount,
}

/// All unit estimates of one kind, ordered like the listing's unit list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RentEstimate {
    pub kind: EstimateKind,
    pub units: Vec<UnitEstimate>,
}

/// Estimates for a whole listing, grouped by kind.
///
/// The run loop records each unit at most once per kind; groups stay
/// independent, so a failure on one unit never invalidates another's data.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EstimateCollection {
    groups: Vec<RentEstimate>,
}

impl EstimateCollection {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn groups(&self) -> &[RentEstimate] {
        &self.groups
    }

    pub fn group(&self, kind: EstimateKind) -> Option<&RentEstimate> {
        self.groups.iter().find(|g| g.kind == kind)
    }

    pub fn record(&mut self, kind: EstimateKind, unit: Unit, monthly_rent: DollarAmount) {
        let position = self
            .groups
            .iter()
            .position(|g| g.kind == kind)
            .unwrap_or_else(|| {
                self.groups.push(RentEstimate {
                    kind,
                    units: Vec::new(),
                });
                self.groups.len() - 1
            });
        self.groups[position].units.push(UnitEstimate { unit, monthly_rent });
    }

    /// Record a zero estimate for every kind, for a unit rentometer could
    /// not analyze even with the broadened filter.
    pub fn record_missing(&mut self, unit: Unit) {
        for kind in EstimateKind::ALL {
            self.record(kind, unit, 0.0);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.groups.iter().all(|g| g.units.is_empty())
    }

    pub fn total_estimates(&self) -> usize {
        self.groups.iter().map(|g| g.units.len()).sum()
    }

    pub fn gross_monthly_rent(&self, kind: EstimateKind) -> Option<DollarAmount> {
        self.group(kind)
            .map(|g| g.units.iter().map(|u| u.monthly_rent).sum())
    }
}

/// Rentometer's baths filter options.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BathsFilter {
    Any,
    OneOnly,
    OneAndHalfPlus,
}

impl BathsFilter {
    /// Exactly 1 bath maps to "1 Only", more than 1 to "1½ or more", and
    /// everything else (zero, negative, NaN) falls back to "Any".
    pub fn for_unit(baths: f64) -> Self {
        if baths == 1.0 {
            BathsFilter::OneOnly
        } else if baths > 1.0 {
            BathsFilter::OneAndHalfPlus
        } else {
            BathsFilter::Any
        }
    }

    /// The `value` attribute of the corresponding `<option>`.
    pub fn option_value(&self) -> &'static str {
        match self {
            BathsFilter::Any => "",
            BathsFilter::OneOnly => "1",
            BathsFilter::OneAndHalfPlus => "1.5",
        }
    }
}

/// The `value` attribute for the bed-style selector.
pub fn bed_style_value(beds: f64) -> String {
    if beds.fract() == 0.0 {
        format!("{}", beds as i64)
    } else {
        format!("{}", beds)
    }
}

/// Outcome of submitting one unit query.
#[derive(Debug, Clone, PartialEq)]
pub enum QueryOutcome {
    /// Rentometer reported not enough comparables for a valid analysis.
    Insufficient,
    /// The analysis succeeded; raw page source of the results page.
    ResultsPage(String),
}

/// One live rentometer session: a browser routed through a fresh circuit.
#[async_trait]
pub trait UnitQuerySession: Send {
    /// Whether the Analyze control is currently enabled. A disabled control
    /// is rentometer's "free quota reached" signal for this origin.
    async fn quota_available(&mut self) -> Result<bool>;

    /// Fill and submit the search form for one unit.
    async fn submit_query(
        &mut self,
        address: &str,
        unit: &Unit,
        filter: BathsFilter,
    ) -> Result<QueryOutcome>;

    /// Tear down the session pair. Must be safe to call exactly once per
    /// acquired session, errors logged rather than propagated.
    async fn shutdown(&mut self);
}

/// Source of fresh session pairs. Each acquisition builds a new circuit and
/// a new browser bound to it.
#[async_trait]
pub trait SessionProvider: Send {
    type Session: UnitQuerySession + Send;

    async fn acquire(&mut self) -> Result<Self::Session, SessionError>;
}

/// Bounds for the acquire/probe loop.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_session_attempts: u32,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_session_attempts: 8,
            base_backoff: Duration::from_secs(2),
            max_backoff: Duration::from_secs(60),
        }
    }
}

impl RetryPolicy {
    fn backoff(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(5);
        let exponential = self.base_backoff.saturating_mul(1 << shift);
        let capped = exponential.min(self.max_backoff);
        let jitter = rand::thread_rng().gen_range(0..250);
        capped + Duration::from_millis(jitter)
    }
}

/// Drives rent estimation for a listing: cache check, session acquisition
/// with quota probing, one query per unit with broaden-once recovery, and
/// unconditional teardown plus cache write at the end.
pub struct RentEstimator<P: SessionProvider> {
    provider: P,
    cache: EstimateCache,
    retry: RetryPolicy,
}

impl<P: SessionProvider> RentEstimator<P> {
    pub fn new(provider: P, cache: EstimateCache) -> Self {
        Self {
            provider,
            cache,
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Estimate rents for every unit of a listing.
    ///
    /// Always returns a collection; on failure partway it holds whatever was
    /// collected before the fault, and the gaps are explained in the log.
    pub async fn estimate(&mut self, listing: &ListingSummary) -> Result<EstimateCollection> {
        info!("Estimating the rents at {}", listing.address);

        if let Some(cached) = self.cache.load(&listing.address)? {
            info!(
                "✅ Using cached estimates for {} ({} entries)",
                listing.address,
                cached.total_estimates()
            );
            return Ok(cached);
        }

        let mut active: Option<P::Session> = None;
        let mut collection = EstimateCollection::new();

        if let Err(err) = self.collect(&mut active, listing, &mut collection).await {
            error!(
                "Unexpected error while estimating rents at {}: {:#}. Stopping with {} estimates collected.",
                listing.address,
                err,
                collection.total_estimates()
            );
        }

        if let Some(mut session) = active.take() {
            session.shutdown().await;
        }

        if !collection.is_empty() {
            if let Err(err) = self.cache.store(&listing.address, &collection) {
                warn!("Failed to cache estimates for {}: {:#}", listing.address, err);
            }
        }

        Ok(collection)
    }

    async fn collect(
        &mut self,
        active: &mut Option<P::Session>,
        listing: &ListingSummary,
        collection: &mut EstimateCollection,
    ) -> Result<()> {
        active.replace(self.acquire_unthrottled().await?);

        for unit in &listing.units {
            info!("Estimating rent for unit: {:?}", unit);

            // Rentometer can revoke the quota mid-run; recycle the pair and
            // keep going with the same unit.
            let throttled = match active.as_mut() {
                Some(session) => !session.quota_available().await?,
                None => true,
            };
            if throttled {
                warn!("Analyze control is disabled; recycling the tor circuit and browser");
                if let Some(mut stale) = active.take() {
                    stale.shutdown().await;
                }
                active.replace(self.acquire_unthrottled().await?);
            }
            let session = active.as_mut().context("no active session after acquisition")?;

            let mut outcome = session
                .submit_query(&listing.address, unit, BathsFilter::for_unit(unit.baths))
                .await?;

            if outcome == QueryOutcome::Insufficient {
                warn!(
                    "Not enough comparables for {:?}; retrying with the baths filter broadened to Any",
                    unit
                );
                outcome = session
                    .submit_query(&listing.address, unit, BathsFilter::Any)
                    .await?;
            }

            match outcome {
                QueryOutcome::Insufficient => {
                    warn!(
                        "Still not enough comparables for {:?}; recording zero estimates",
                        unit
                    );
                    collection.record_missing(*unit);
                }
                QueryOutcome::ResultsPage(html) => {
                    record_stats(&html, *unit, collection);
                }
            }
        }

        Ok(())
    }

    /// Keep building fresh session pairs until one comes up with the Analyze
    /// control enabled. Bounded with exponential backoff; running out of
    /// attempts surfaces `ExhaustedRetries` instead of looping forever.
    async fn acquire_unthrottled(&mut self) -> Result<P::Session, SessionError> {
        let attempts = self.retry.max_session_attempts;

        for attempt in 1..=attempts {
            match self.provider.acquire().await {
                Ok(mut session) => match session.quota_available().await {
                    Ok(true) => {
                        info!(
                            "✅ Got a rentometer session with the Analyze control enabled (attempt {}/{})",
                            attempt, attempts
                        );
                        return Ok(session);
                    }
                    Ok(false) => {
                        warn!(
                            "Analyze control was disabled on attempt {}/{}; tearing the pair down for a fresh circuit",
                            attempt, attempts
                        );
                        session.shutdown().await;
                    }
                    Err(err) => {
                        warn!("Quota probe failed on attempt {}/{}: {:#}", attempt, attempts, err);
                        session.shutdown().await;
                    }
                },
                Err(err) => {
                    warn!("Session acquisition failed on attempt {}/{}: {}", attempt, attempts, err);
                }
            }

            if attempt < attempts {
                let delay = self.retry.backoff(attempt);
                debug!("Backing off {:?} before the next session attempt", delay);
                sleep(delay).await;
            }
        }

        Err(SessionError::ExhaustedRetries { attempts })
    }
}

/// Pull the recognized stat boxes out of a results page and add them to the
/// collection. Unknown labels and unparseable values are logged and skipped;
/// missing kinds get a warning but the partial data is kept.
fn record_stats(html: &str, unit: Unit, collection: &mut EstimateCollection) {
    let mut found: Vec<EstimateKind> = Vec::new();

    for text in parse_stat_boxes(html) {
        match EstimateKind::from_stat_label(&text) {
            Some(kind) => match parse_dollar_amount(&text) {
                Ok(amount) => {
                    collection.record(kind, unit, amount);
                    found.push(kind);
                }
                Err(err) => warn!("Could not parse {} stat box {:?}: {:#}", kind.label(), text, err),
            },
            None => warn!("Unexpected stat in stats box: {:?}", text),
        }
    }

    let missing: Vec<&str> = EstimateKind::ALL
        .iter()
        .filter(|kind| !found.contains(*kind))
        .map(|kind| kind.label())
        .collect();
    if !missing.is_empty() {
        warn!(
            "Results page for {:?} was missing stats: {}",
            unit,
            missing.join(", ")
        );
    }
}

/// Text of every stat box on an analysis page.
fn parse_stat_boxes(html: &str) -> Vec<String> {
    let document = Html::parse_document(html);
    let box_selector = Selector::parse("div.box-stats").unwrap();

    document
        .select(&box_selector)
        .map(|stat| {
            stat.text()
                .collect::<String>()
                .split_whitespace()
                .collect::<Vec<_>>()
                .join(" ")
        })
        .collect()
}

/// Parse the dollar value out of a stat box text, e.g.
/// `"AVERAGE $1,234.56 /mo"` -> `1234.56`. Takes everything after the last
/// `$`, in keeping with how the stat boxes render.
pub fn parse_dollar_amount(text: &str) -> Result<DollarAmount> {
    let after_dollar = text.rsplit('$').next().unwrap_or("");
    let cleaned: String = after_dollar
        .trim_start()
        .chars()
        .take_while(|c| c.is_ascii_digit() || *c == ',' || *c == '.')
        .collect();
    let normalized = cleaned.replace(',', "");

    normalized
        .parse::<f64>()
        .with_context(|| format!("no dollar value in stat text {:?}", text))
}
