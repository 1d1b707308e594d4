//! Scrape pipeline orchestration: listing -> details -> categories -> workbook.

use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rbcn_adapters::NotesSiteAdapter;
use rbcn_browser::{
    BrowserLauncher, FixtureLauncher, PageRenderer, WebDriverConfig, WebDriverLauncher,
    DEFAULT_WEBDRIVER_URL,
};
use rbcn_core::{categorize, CategoryGroups, ProductDirectory};
use rbcn_report::{export_report, DEFAULT_OUTPUT_PATH};
use serde::Serialize;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

pub use rbcn_adapters::MalformedRowPolicy;

pub const DEFAULT_DOMAIN: &str = "https://www.rbcnotes.com";
pub const DEFAULT_PATH: &str = "/Products?q=Solactive%20Canada%20Bank%2040";
pub const DEFAULT_MAX_LOADING_TIME_SECS: u64 = 60;
pub const DEFAULT_MAX_NUMBER_FUNDS: usize = 20;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScrapeConfig {
    pub domain: String,
    pub path: String,
    pub max_loading_time: Duration,
    pub max_number_funds: usize,
    pub webdriver_url: String,
    pub headless: bool,
    pub output_path: PathBuf,
    /// Serve saved pages from this directory instead of driving a browser.
    pub fixtures_dir: Option<PathBuf>,
    pub malformed_rows: MalformedRowPolicy,
}

impl Default for ScrapeConfig {
    fn default() -> Self {
        Self {
            domain: DEFAULT_DOMAIN.to_string(),
            path: DEFAULT_PATH.to_string(),
            max_loading_time: Duration::from_secs(DEFAULT_MAX_LOADING_TIME_SECS),
            max_number_funds: DEFAULT_MAX_NUMBER_FUNDS,
            webdriver_url: DEFAULT_WEBDRIVER_URL.to_string(),
            headless: true,
            output_path: PathBuf::from(DEFAULT_OUTPUT_PATH),
            fixtures_dir: None,
            malformed_rows: MalformedRowPolicy::default(),
        }
    }
}

impl ScrapeConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Unset or unparsable values fall back to the defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        Self {
            domain: lookup("RBCN_DOMAIN").unwrap_or(defaults.domain),
            path: lookup("RBCN_PATH").unwrap_or(defaults.path),
            max_loading_time: parse_var(&lookup, "RBCN_MAX_LOADING_TIME_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.max_loading_time),
            max_number_funds: parse_var(&lookup, "RBCN_MAX_NUMBER_FUNDS").unwrap_or(defaults.max_number_funds),
            webdriver_url: lookup("RBCN_WEBDRIVER_URL").unwrap_or(defaults.webdriver_url),
            headless: lookup("RBCN_HEADLESS")
                .map(|v| !matches!(v.trim(), "0" | "false" | "FALSE" | "False"))
                .unwrap_or(defaults.headless),
            output_path: lookup("RBCN_OUTPUT_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.output_path),
            fixtures_dir: lookup("RBCN_FIXTURES_DIR").map(PathBuf::from),
            malformed_rows: parse_var(&lookup, "RBCN_MALFORMED_ROWS").unwrap_or(defaults.malformed_rows),
        }
    }

    pub fn listing_url(&self) -> String {
        format!("{}{}", self.domain, self.path)
    }
}

fn parse_var<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    lookup(key).and_then(|v| v.trim().parse().ok())
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub listed_rows: usize,
    pub products: usize,
    pub skipped_rows: usize,
    pub categories: usize,
    /// `None` when there was nothing to export.
    pub output_path: Option<String>,
}

#[derive(Debug, Clone)]
pub struct RunOutput {
    pub summary: RunSummary,
    pub directory: ProductDirectory,
    pub categories: CategoryGroups,
}

impl RunOutput {
    /// Category membership and the enriched directory as pretty JSON.
    pub fn json_dump(&self) -> Result<String> {
        serde_json::to_string_pretty(&serde_json::json!({
            "categories": self.categories,
            "products": self.directory,
        }))
        .context("serializing run output")
    }
}

pub struct ScrapePipeline {
    config: ScrapeConfig,
    adapter: NotesSiteAdapter,
    renderer: PageRenderer,
}

impl ScrapePipeline {
    pub fn new(config: ScrapeConfig) -> Self {
        let launcher: Arc<dyn BrowserLauncher> = match &config.fixtures_dir {
            Some(dir) => Arc::new(FixtureLauncher::new(dir).with_listing_url(config.listing_url())),
            None => Arc::new(WebDriverLauncher::new(WebDriverConfig {
                webdriver_url: config.webdriver_url.clone(),
                headless: config.headless,
            })),
        };
        Self::with_launcher(config, launcher)
    }

    pub fn with_launcher(config: ScrapeConfig, launcher: Arc<dyn BrowserLauncher>) -> Self {
        let adapter = NotesSiteAdapter::new(config.domain.clone());
        let renderer = PageRenderer::new(launcher, config.max_loading_time);
        Self {
            config,
            adapter,
            renderer,
        }
    }

    pub fn config(&self) -> &ScrapeConfig {
        &self.config
    }

    pub async fn run_once(&self) -> Result<RunOutput> {
        let run_id = Uuid::new_v4();
        let span = info_span!("scrape_run", %run_id);
        self.run(run_id).instrument(span).await
    }

    async fn run(&self, run_id: Uuid) -> Result<RunOutput> {
        let started_at = Utc::now();

        let mut listing = self
            .adapter
            .fetch_listing(
                &self.renderer,
                &self.config.path,
                self.config.max_number_funds,
                self.config.malformed_rows,
            )
            .await
            .with_context(|| format!("fetching listing page {}", self.config.listing_url()))?;
        info!(products = listing.directory.len(), "product directory built");

        self.adapter
            .attach_reference_info(&self.renderer, &mut listing.directory)
            .await
            .context("fetching product detail pages")?;

        let categories = categorize(&listing.directory);
        info!(categories = categories.len(), "products categorized");

        let output_path = if categories.is_empty() {
            warn!("no products found; skipping workbook export");
            None
        } else {
            let exported = export_report(&categories, &listing.directory, &self.config.output_path)
                .with_context(|| format!("exporting {}", self.config.output_path.display()))?;
            Some(exported.path.display().to_string())
        };

        let summary = RunSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            listed_rows: listing.rows_found,
            products: listing.directory.len(),
            skipped_rows: listing.skipped.len(),
            categories: categories.len(),
            output_path,
        };
        Ok(RunOutput {
            summary,
            directory: listing.directory,
            categories,
        })
    }
}

pub async fn run_once_from_env() -> Result<RunOutput> {
    ScrapePipeline::new(ScrapeConfig::from_env()).run_once().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect::<HashMap<_, _>>();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_match_the_source_site() {
        let config = ScrapeConfig::from_lookup(|_| None);
        assert_eq!(config, ScrapeConfig::default());
        assert_eq!(config.max_loading_time, Duration::from_secs(60));
        assert_eq!(config.max_number_funds, 20);
        assert_eq!(
            config.listing_url(),
            "https://www.rbcnotes.com/Products?q=Solactive%20Canada%20Bank%2040"
        );
        assert_eq!(config.output_path, PathBuf::from("funds_data.xlsx"));
    }

    #[test]
    fn env_values_override_defaults() {
        let config = ScrapeConfig::from_lookup(lookup_from(&[
            ("RBCN_DOMAIN", "https://notes.example"),
            ("RBCN_PATH", "/Products?q=Gold"),
            ("RBCN_MAX_LOADING_TIME_SECS", "15"),
            ("RBCN_MAX_NUMBER_FUNDS", " 5 "),
            ("RBCN_HEADLESS", "false"),
            ("RBCN_FIXTURES_DIR", "fixtures/rbcnotes/sample"),
            ("RBCN_MALFORMED_ROWS", "skip"),
        ]));

        assert_eq!(config.listing_url(), "https://notes.example/Products?q=Gold");
        assert_eq!(config.max_loading_time, Duration::from_secs(15));
        assert_eq!(config.max_number_funds, 5);
        assert!(!config.headless);
        assert_eq!(config.fixtures_dir, Some(PathBuf::from("fixtures/rbcnotes/sample")));
        assert_eq!(config.malformed_rows, MalformedRowPolicy::Skip);
    }

    #[test]
    fn unparsable_values_fall_back() {
        let config = ScrapeConfig::from_lookup(lookup_from(&[
            ("RBCN_MAX_LOADING_TIME_SECS", "soon"),
            ("RBCN_MAX_NUMBER_FUNDS", "-3"),
            ("RBCN_MALFORMED_ROWS", "ignore"),
        ]));
        assert_eq!(config.max_loading_time, Duration::from_secs(60));
        assert_eq!(config.max_number_funds, 20);
        assert_eq!(config.malformed_rows, MalformedRowPolicy::Fail);
    }
}
