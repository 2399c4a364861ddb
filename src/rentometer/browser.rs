use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use thirtyfour::common::capabilities::firefox::FirefoxPreferences;
use thirtyfour::components::SelectElement;
use thirtyfour::prelude::*;
use thirtyfour::PageLoadStrategy;
use tokio::time::{sleep, Duration};
use tracing::{debug, info, warn};

use super::tor::{TorClient, TorProcess};
use super::{bed_style_value, BathsFilter, QueryOutcome, SessionError, SessionProvider, UnitQuerySession};
use crate::listing::Unit;

const RENTOMETER_URL: &str = "https://www.rentometer.com/";

const ADDRESS_BOX_ID: &str = "address_unified_search_address";
const BED_STYLE_SELECT_ID: &str = "address_unified_search_bed_style";
const BATHS_SELECT_ID: &str = "address_unified_search_baths";
const ANALYZE_BUTTON_NAME: &str = "commit";

/// Flash banner rentometer shows when a query has too few comparables.
const FLASH_BANNER_XPATH: &str = "/html/body/div[3]/div";
const INSUFFICIENT_RESULTS_TEXT: &str =
    "Sorry, there are not enough results in that location to generate a valid analysis.";

#[derive(Debug, Clone)]
pub struct BrowserConfig {
    pub webdriver_url: String,
    pub headless: bool,
    pub tor_binary: String,
    pub socks_port: u16,
}

/// Builds fresh (tor, browser) pairs. The browser's SOCKS proxy is bound to
/// the tor process's port at launch, so the two always live and die together.
pub struct RentometerProvider {
    config: BrowserConfig,
}

impl RentometerProvider {
    pub fn new(config: BrowserConfig) -> Self {
        Self { config }
    }

    async fn open_browser(&self, socks_port: u16) -> Result<WebDriver, SessionError> {
        info!("Opening browser proxied through 127.0.0.1:{}...", socks_port);

        let mut caps = DesiredCapabilities::firefox();
        if self.config.headless {
            caps.add_firefox_arg("-headless")?;
        }

        let mut prefs = FirefoxPreferences::new();
        prefs.set("network.proxy.type", 1)?;
        prefs.set("network.proxy.socks", "127.0.0.1")?;
        prefs.set("network.proxy.socks_port", socks_port as u32)?;
        prefs.set("network.proxy.socks_remote_dns", true)?;
        caps.set_preferences(prefs)?;

        // Interact as soon as the DOM is usable rather than waiting for every
        // resource; tor page loads are slow enough to make this worthwhile.
        caps.set_page_load_strategy(PageLoadStrategy::Eager)?;

        let driver = WebDriver::new(&self.config.webdriver_url, caps).await?;
        Ok(driver)
    }
}

#[async_trait]
impl SessionProvider for RentometerProvider {
    type Session = RentometerSession;

    async fn acquire(&mut self) -> Result<RentometerSession, SessionError> {
        let mut tor = TorClient::new(self.config.tor_binary.as_str(), self.config.socks_port)
            .start()
            .await?;

        match self.open_browser(tor.socks_port()).await {
            Ok(driver) => Ok(RentometerSession {
                tor,
                driver: Some(driver),
            }),
            Err(err) => {
                tor.stop().await;
                Err(err)
            }
        }
    }
}

/// A live rentometer page behind a tor circuit.
pub struct RentometerSession {
    tor: TorProcess,
    driver: Option<WebDriver>,
}

impl RentometerSession {
    fn driver(&self) -> Result<&WebDriver> {
        self.driver.as_ref().context("browser session already shut down")
    }

    /// Make sure the search form is on screen, navigating home if the
    /// current page (e.g. a results page) lost it.
    async fn ensure_search_form(&self) -> Result<()> {
        let driver = self.driver()?;

        if driver.find(By::Id(ADDRESS_BOX_ID)).await.is_ok() {
            debug!("Search form already present");
            return Ok(());
        }

        driver.goto(RENTOMETER_URL).await?;
        sleep(Duration::from_secs(1)).await;

        if driver.find(By::Id(ADDRESS_BOX_ID)).await.is_err() {
            bail!("Could not find the rentometer search form");
        }
        Ok(())
    }

    /// Named check for the "not enough results" banner. Absence of the
    /// banner is the happy path, not an error.
    async fn insufficient_banner_present(&self) -> Result<bool> {
        let driver = self.driver()?;

        match driver.find(By::XPath(FLASH_BANNER_XPATH)).await {
            Ok(banner) => {
                let text = banner.text().await?;
                if text.contains(INSUFFICIENT_RESULTS_TEXT) {
                    return Ok(true);
                }
                if !text.trim().is_empty() {
                    debug!("Flash banner present with unrelated text: {:?}", text);
                }
                Ok(false)
            }
            Err(_) => Ok(false),
        }
    }
}

#[async_trait]
impl UnitQuerySession for RentometerSession {
    async fn quota_available(&mut self) -> Result<bool> {
        let driver = self.driver()?;

        info!("Connecting to {}", RENTOMETER_URL);
        driver.goto(RENTOMETER_URL).await?;

        let analyze = driver
            .find(By::Name(ANALYZE_BUTTON_NAME))
            .await
            .context("Analyze control not found on the rentometer home page")?;
        let enabled = analyze.is_enabled().await?;

        if enabled {
            debug!("Analyze control is enabled");
        } else {
            debug!("Analyze control is disabled (free quota reached for this origin)");
        }
        Ok(enabled)
    }

    async fn submit_query(
        &mut self,
        address: &str,
        unit: &Unit,
        filter: BathsFilter,
    ) -> Result<QueryOutcome> {
        self.ensure_search_form().await?;
        let driver = self.driver()?;

        let address_box = driver
            .find(By::Id(ADDRESS_BOX_ID))
            .await
            .context("Could not find the address box")?;
        address_box.clear().await?;
        address_box.send_keys(address).await?;
        debug!("Entered {} into the address box", address);

        let beds_element = driver
            .find(By::Id(BED_STYLE_SELECT_ID))
            .await
            .context("Could not find the bed-style selector")?;
        let beds_select = SelectElement::new(&beds_element).await?;
        beds_select.select_by_value(&bed_style_value(unit.beds)).await?;
        debug!("Selected {} for beds", bed_style_value(unit.beds));

        let baths_element = driver
            .find(By::Id(BATHS_SELECT_ID))
            .await
            .context("Could not find the baths selector")?;
        let baths_select = SelectElement::new(&baths_element).await?;
        baths_select.select_by_value(filter.option_value()).await?;
        debug!("Selected {:?} for baths", filter);

        let analyze = driver
            .find(By::Name(ANALYZE_BUTTON_NAME))
            .await
            .context("Could not find the Analyze control")?;
        analyze.click().await?;
        info!("🔍 Submitted rent query for {:?}", unit);

        // The analysis page renders promptly once the DOM is interactive.
        sleep(Duration::from_secs(2)).await;

        if self.insufficient_banner_present().await? {
            return Ok(QueryOutcome::Insufficient);
        }

        let html = self.driver()?.source().await?;
        Ok(QueryOutcome::ResultsPage(html))
    }

    async fn shutdown(&mut self) {
        if let Some(driver) = self.driver.take() {
            info!("Closing the browser and stopping tor");
            if let Err(err) = driver.quit().await {
                warn!("Failed to close the browser cleanly: {}", err);
            }
        }
        self.tor.stop().await;
    }
}
