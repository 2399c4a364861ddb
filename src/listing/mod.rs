use anyhow::{Context, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

pub type DollarAmount = f64;
pub type Percentage = f64;

const FETCH_TIMEOUT_SECS: u64 = 30;
const BROWSER_USER_AGENT: &str = "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) \
     AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";

/// One rentable sub-space of a listing.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Unit {
    pub beds: f64,
    pub baths: f64,
}

#[derive(Debug, Error)]
pub enum ListingError {
    /// None of the known extraction patterns matched the listing data.
    #[error("no recognized unit layout in the listing data")]
    NoKnownFormat,
    #[error("listing data is missing {0}")]
    MissingField(&'static str),
    #[error("page does not embed compass listing data")]
    NotACompassPage,
    #[error("payload does not contain zillow search results")]
    NotASearchPayload,
    #[error("failed to parse embedded listing JSON: {0}")]
    EmbeddedJson(#[from] serde_json::Error),
}

/// What the rent estimator needs to know about a listing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListingSummary {
    pub address: String,
    pub price: DollarAmount,
    pub units: Vec<Unit>,
}

/// A single raw listing, from either a compass detail page or a zillow
/// search result.
#[derive(Debug, Clone)]
pub struct Listing {
    raw: Value,
}

impl Listing {
    pub fn new(raw: Value) -> Self {
        Self { raw }
    }

    pub fn price(&self) -> Result<DollarAmount, ListingError> {
        self.raw
            .pointer("/price/listed")
            .and_then(Value::as_f64)
            .or_else(|| self.raw.get("unformattedPrice").and_then(Value::as_f64))
            .or_else(|| {
                self.raw
                    .pointer("/hdpData/homeInfo/priceForHDP")
                    .and_then(Value::as_f64)
            })
            .ok_or(ListingError::MissingField("price"))
    }

    /// Address in the form "276 Lakefield Pl, Moraga, CA 94556".
    pub fn pretty_address(&self) -> Result<String, ListingError> {
        if let Some(location) = self.raw.get("location") {
            let street = location
                .get("prettyAddress")
                .and_then(Value::as_str)
                .ok_or(ListingError::MissingField("location.prettyAddress"))?;
            let city = location
                .get("city")
                .and_then(Value::as_str)
                .ok_or(ListingError::MissingField("location.city"))?;
            let state = location
                .get("state")
                .and_then(Value::as_str)
                .ok_or(ListingError::MissingField("location.state"))?;
            let zip_code = location
                .get("zipCode")
                .and_then(Value::as_str)
                .ok_or(ListingError::MissingField("location.zipCode"))?;
            return Ok(format!("{}, {}, {} {}", street, city, state, zip_code));
        }

        if let Some(address) = self.raw.get("address").and_then(Value::as_str) {
            return Ok(address.to_string());
        }

        Err(ListingError::MissingField("address"))
    }

    /// Extract the unit breakdown, trying each known pattern in priority
    /// order; the first that matches wins.
    pub fn units(&self) -> Result<Vec<Unit>, ListingError> {
        for (name, strategy) in STRATEGIES {
            match strategy(&self.raw) {
                Ok(units) => {
                    debug!("Extracted {} units via the {} pattern", units.len(), name);
                    return Ok(units);
                }
                Err(IncongruentFormat) => debug!("The {} pattern did not match", name),
            }
        }
        Err(ListingError::NoKnownFormat)
    }

    pub fn summarize(&self) -> Result<ListingSummary> {
        Ok(ListingSummary {
            address: self.pretty_address()?,
            price: self.price()?,
            units: self.units()?,
        })
    }
}

/// Marker error for an extraction strategy that does not apply to the data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IncongruentFormat;

type ExtractionStrategy = fn(&Value) -> Result<Vec<Unit>, IncongruentFormat>;

/// Known unit layouts, in priority order. Strategies are pure; no
/// backtracking is needed.
const STRATEGIES: &[(&str, ExtractionStrategy)] = &[
    ("compass unit information", extract_compass_units),
    ("single-unit bed/bath counts", extract_single_unit),
];

/// Compass multi-family pages list units under a "Unit Information" detail,
/// with bath fields split into full and half baths.
fn extract_compass_units(raw: &Value) -> Result<Vec<Unit>, IncongruentFormat> {
    let details = raw
        .pointer("/detailedInfo/listingDetails")
        .and_then(Value::as_array)
        .ok_or(IncongruentFormat)?;

    let raw_units = details
        .iter()
        .find(|detail| detail.get("name").and_then(Value::as_str) == Some("Unit Information"))
        .and_then(|detail| detail.get("subCategories"))
        .and_then(Value::as_array)
        .ok_or(IncongruentFormat)?;

    let mut units = Vec::new();
    for raw_unit in raw_units {
        let mut beds = 0.0;
        let mut baths = 0.0;

        let fields = raw_unit
            .get("fields")
            .and_then(Value::as_array)
            .map(Vec::as_slice)
            .unwrap_or(&[]);
        for field in fields {
            let key = field.get("key").and_then(Value::as_str).unwrap_or_default();
            let first_value: f64 = field
                .pointer("/values/0")
                .and_then(Value::as_str)
                .and_then(|v| v.parse().ok())
                .unwrap_or(0.0);

            if key.contains("Baths") {
                if key.contains("Half") {
                    baths += 0.5 * first_value;
                } else {
                    baths += first_value;
                }
            } else if key.contains("Bedrooms") {
                beds = first_value;
            }
        }

        units.push(Unit { beds, baths });
    }

    if units.is_empty() {
        return Err(IncongruentFormat);
    }
    Ok(units)
}

/// Zillow search results carry a single bed/bath count per listing.
fn extract_single_unit(raw: &Value) -> Result<Vec<Unit>, IncongruentFormat> {
    let home = raw.pointer("/hdpData/homeInfo");

    let beds = home
        .and_then(|h| h.get("bedrooms"))
        .and_then(Value::as_f64)
        .or_else(|| raw.get("beds").and_then(Value::as_f64))
        .ok_or(IncongruentFormat)?;
    let baths = home
        .and_then(|h| h.get("bathrooms"))
        .and_then(Value::as_f64)
        .or_else(|| raw.get("baths").and_then(Value::as_f64))
        .ok_or(IncongruentFormat)?;

    Ok(vec![Unit { beds, baths }])
}

/// Extract the raw listing embedded in a compass detail page's script tag.
pub fn from_compass_html(raw: &str) -> Result<Listing, ListingError> {
    info!("Extracting raw listing from compass page");

    let marker = Regex::new(r"window\.__PARTIAL_INITIAL_DATA__\s*=").unwrap();
    let start = marker
        .find(raw)
        .ok_or(ListingError::NotACompassPage)?
        .end();
    let rest = &raw[start..];
    let end = rest.find("</script>").ok_or(ListingError::NotACompassPage)?;

    let payload: Value = serde_json::from_str(rest[..end].trim())?;
    let listing = payload
        .pointer("/props/listingRelation/listing")
        .cloned()
        .ok_or(ListingError::MissingField("props.listingRelation.listing"))?;

    Ok(Listing::new(listing))
}

/// Split a zillow search-state payload into its raw listings
/// (list results followed by map results).
pub fn extract_zillow_listings(payload: &Value) -> Result<Vec<Listing>, ListingError> {
    let list_results = payload
        .pointer("/cat1/searchResults/listResults")
        .and_then(Value::as_array);
    let map_results = payload
        .pointer("/cat1/searchResults/mapResults")
        .and_then(Value::as_array);

    if list_results.is_none() && map_results.is_none() {
        return Err(ListingError::NotASearchPayload);
    }

    Ok(list_results
        .into_iter()
        .flatten()
        .chain(map_results.into_iter().flatten())
        .cloned()
        .map(Listing::new)
        .collect())
}

/// URL for zillow's search-state endpoint for a given query state blob.
pub fn zillow_search_url(query_state: &str) -> String {
    format!(
        "https://www.zillow.com/search/GetSearchPageState.htm?searchQueryState={}",
        urlencoding::encode(query_state)
    )
}

/// Fetch a listing page or search payload over plain HTTPS.
pub async fn fetch_page(url: &str) -> Result<String> {
    info!("Fetching {}", url);

    let client = reqwest::Client::builder()
        .user_agent(BROWSER_USER_AGENT)
        .timeout(Duration::from_secs(FETCH_TIMEOUT_SECS))
        .use_rustls_tls()
        .build()
        .context("Unable to construct reqwest client")?;

    let resp = client
        .get(url)
        .send()
        .await
        .with_context(|| format!("Failed to fetch {}", url))?;

    if !resp.status().is_success() {
        anyhow::bail!("Fetching {} failed with status {}", url, resp.status());
    }

    resp.text()
        .await
        .with_context(|| format!("Failed to read the body of {}", url))
}
