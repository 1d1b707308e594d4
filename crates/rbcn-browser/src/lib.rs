//! Browser sessions and the scoped page renderer used to load script-rendered pages.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use fantoccini::error::{CmdError, NewSessionError};
use fantoccini::{Client, ClientBuilder, Locator};
use scraper::{Html, Selector};
use thiserror::Error;
use tokio::fs;
use tracing::{debug, info, info_span, warn, Instrument};
use url::Url;

pub const DEFAULT_WEBDRIVER_URL: &str = "http://localhost:4444";

/// Condition a rendered page must satisfy before its markup is read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WaitCondition {
    /// At least one element carrying the class is present.
    AllByClass(String),
    ById(String),
}

impl WaitCondition {
    pub fn all_by_class(class: impl Into<String>) -> Self {
        Self::AllByClass(class.into())
    }

    pub fn by_id(id: impl Into<String>) -> Self {
        Self::ById(id.into())
    }

    pub fn css_selector(&self) -> String {
        match self {
            Self::AllByClass(class) => format!(".{class}"),
            Self::ById(id) => format!("#{id}"),
        }
    }

    /// Evaluates the condition against static markup.
    pub fn is_met_by(&self, markup: &str) -> Result<bool, BrowserError> {
        let css = self.css_selector();
        let selector = Selector::parse(&css).map_err(|_| BrowserError::InvalidSelector(css.clone()))?;
        let document = Html::parse_document(markup);
        let found = document.select(&selector).next().is_some();
        Ok(found)
    }
}

#[derive(Debug, Error)]
pub enum BrowserError {
    #[error("page load timed out after {waited:?} waiting for `{selector}` at {url}")]
    PageLoadTimeout {
        url: String,
        selector: String,
        waited: Duration,
    },
    #[error("opening webdriver session: {0}")]
    NewSession(#[from] NewSessionError),
    #[error("webdriver command failed: {0}")]
    WebDriver(#[from] CmdError),
    #[error("no fixture page for {url} (expected {})", path.display())]
    FixtureMissing { url: String, path: PathBuf },
    #[error("reading fixture {}: {source}", path.display())]
    FixtureIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid selector `{0}`")]
    InvalidSelector(String),
    #[error("session has no page loaded")]
    NoPage,
    #[error("session already closed")]
    Closed,
}

#[async_trait]
pub trait BrowserSession: Send {
    async fn goto(&mut self, url: &str) -> Result<(), BrowserError>;

    async fn wait_for(
        &mut self,
        condition: &WaitCondition,
        timeout: Duration,
    ) -> Result<(), BrowserError>;

    async fn page_source(&mut self) -> Result<String, BrowserError>;

    /// Releases the underlying browser. Calling it twice is a no-op.
    async fn close(&mut self) -> Result<(), BrowserError>;
}

#[async_trait]
pub trait BrowserLauncher: Send + Sync {
    async fn launch(&self) -> Result<Box<dyn BrowserSession>, BrowserError>;
}

#[derive(Debug, Clone)]
pub struct WebDriverConfig {
    pub webdriver_url: String,
    pub headless: bool,
}

impl Default for WebDriverConfig {
    fn default() -> Self {
        Self {
            webdriver_url: DEFAULT_WEBDRIVER_URL.to_string(),
            headless: true,
        }
    }
}

/// Opens Chrome sessions through a running WebDriver endpoint (chromedriver, selenium).
#[derive(Debug, Clone, Default)]
pub struct WebDriverLauncher {
    config: WebDriverConfig,
}

impl WebDriverLauncher {
    pub fn new(config: WebDriverConfig) -> Self {
        Self { config }
    }

    fn capabilities(&self) -> serde_json::Map<String, serde_json::Value> {
        let mut caps = serde_json::Map::new();
        if self.config.headless {
            caps.insert(
                "goog:chromeOptions".to_string(),
                serde_json::json!({ "args": ["--headless=new", "--disable-gpu"] }),
            );
        }
        caps
    }
}

#[async_trait]
impl BrowserLauncher for WebDriverLauncher {
    async fn launch(&self) -> Result<Box<dyn BrowserSession>, BrowserError> {
        let mut builder = ClientBuilder::native();
        builder.capabilities(self.capabilities());
        let client = builder.connect(&self.config.webdriver_url).await?;
        debug!(webdriver = %self.config.webdriver_url, "webdriver session opened");
        Ok(Box::new(WebDriverSession {
            client: Some(client),
            current_url: None,
        }))
    }
}

struct WebDriverSession {
    client: Option<Client>,
    current_url: Option<String>,
}

impl WebDriverSession {
    fn client(&self) -> Result<&Client, BrowserError> {
        self.client.as_ref().ok_or(BrowserError::Closed)
    }
}

#[async_trait]
impl BrowserSession for WebDriverSession {
    async fn goto(&mut self, url: &str) -> Result<(), BrowserError> {
        self.client()?.goto(url).await?;
        self.current_url = Some(url.to_string());
        Ok(())
    }

    async fn wait_for(
        &mut self,
        condition: &WaitCondition,
        timeout: Duration,
    ) -> Result<(), BrowserError> {
        let selector = condition.css_selector();
        let result = self
            .client()?
            .wait()
            .at_most(timeout)
            .for_element(Locator::Css(&selector))
            .await;
        match result {
            Ok(_) => Ok(()),
            Err(CmdError::WaitTimeout) => Err(BrowserError::PageLoadTimeout {
                url: self.current_url.clone().unwrap_or_default(),
                selector,
                waited: timeout,
            }),
            Err(err) => Err(err.into()),
        }
    }

    async fn page_source(&mut self) -> Result<String, BrowserError> {
        Ok(self.client()?.source().await?)
    }

    async fn close(&mut self) -> Result<(), BrowserError> {
        if let Some(client) = self.client.take() {
            client.close().await?;
            debug!("webdriver session closed");
        }
        Ok(())
    }
}

/// Session open/close counters shared by every session a launcher hands out.
#[derive(Debug, Default)]
pub struct SessionStats {
    opened: AtomicUsize,
    closed: AtomicUsize,
}

impl SessionStats {
    pub fn opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }

    pub fn closed(&self) -> usize {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn open_sessions(&self) -> usize {
        self.opened().saturating_sub(self.closed())
    }
}

/// Serves previously rendered markup from disk.
///
/// The listing URL maps to `listing.html`; every other URL maps to
/// `details/<slug>.html` (see [`url_slug`]). Saved markup never changes, so an
/// unmet wait condition fails immediately with `PageLoadTimeout`.
#[derive(Debug, Clone)]
pub struct FixtureLauncher {
    root: PathBuf,
    listing_url: Option<String>,
    stats: Arc<SessionStats>,
}

impl FixtureLauncher {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            listing_url: None,
            stats: Arc::new(SessionStats::default()),
        }
    }

    pub fn with_listing_url(mut self, url: impl Into<String>) -> Self {
        self.listing_url = Some(url.into());
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn stats(&self) -> Arc<SessionStats> {
        Arc::clone(&self.stats)
    }

    pub fn fixture_path(&self, url: &str) -> PathBuf {
        if self.listing_url.as_deref() == Some(url) {
            return self.root.join("listing.html");
        }
        self.root.join("details").join(format!("{}.html", url_slug(url)))
    }
}

#[async_trait]
impl BrowserLauncher for FixtureLauncher {
    async fn launch(&self) -> Result<Box<dyn BrowserSession>, BrowserError> {
        self.stats.opened.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FixtureSession {
            launcher: self.clone(),
            page: None,
            closed: false,
        }))
    }
}

struct FixtureSession {
    launcher: FixtureLauncher,
    page: Option<(String, String)>,
    closed: bool,
}

#[async_trait]
impl BrowserSession for FixtureSession {
    async fn goto(&mut self, url: &str) -> Result<(), BrowserError> {
        if self.closed {
            return Err(BrowserError::Closed);
        }
        let path = self.launcher.fixture_path(url);
        let markup = match fs::read_to_string(&path).await {
            Ok(markup) => markup,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(BrowserError::FixtureMissing {
                    url: url.to_string(),
                    path,
                });
            }
            Err(source) => return Err(BrowserError::FixtureIo { path, source }),
        };
        self.page = Some((url.to_string(), markup));
        Ok(())
    }

    async fn wait_for(
        &mut self,
        condition: &WaitCondition,
        timeout: Duration,
    ) -> Result<(), BrowserError> {
        let (url, markup) = self.page.as_ref().ok_or(BrowserError::NoPage)?;
        if condition.is_met_by(markup)? {
            return Ok(());
        }
        Err(BrowserError::PageLoadTimeout {
            url: url.clone(),
            selector: condition.css_selector(),
            waited: timeout,
        })
    }

    async fn page_source(&mut self) -> Result<String, BrowserError> {
        self.page
            .as_ref()
            .map(|(_, markup)| markup.clone())
            .ok_or(BrowserError::NoPage)
    }

    async fn close(&mut self) -> Result<(), BrowserError> {
        if !self.closed {
            self.closed = true;
            self.launcher.stats.closed.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }
}

/// Lowercased URL path and query with every non-alphanumeric run collapsed to `-`.
pub fn url_slug(url: &str) -> String {
    let tail = match Url::parse(url) {
        Ok(parsed) => match parsed.query() {
            Some(query) => format!("{}?{}", parsed.path(), query),
            None => parsed.path().to_string(),
        },
        Err(_) => url.to_string(),
    };
    let slug = tail
        .to_ascii_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect::<String>()
        .split('-')
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("-");
    if slug.is_empty() {
        "index".to_string()
    } else {
        slug
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedPage {
    pub url: String,
    pub markup: String,
    pub load_time: Duration,
}

/// Loads one page per browser session and always releases the session.
#[derive(Clone)]
pub struct PageRenderer {
    launcher: Arc<dyn BrowserLauncher>,
    max_loading_time: Duration,
}

impl PageRenderer {
    pub fn new(launcher: Arc<dyn BrowserLauncher>, max_loading_time: Duration) -> Self {
        Self {
            launcher,
            max_loading_time,
        }
    }

    pub fn max_loading_time(&self) -> Duration {
        self.max_loading_time
    }

    pub async fn render(
        &self,
        url: &str,
        condition: &WaitCondition,
    ) -> Result<RenderedPage, BrowserError> {
        let span = info_span!("render_page", url);
        async move {
            let mut session = self.launcher.launch().await?;
            let loaded = self.load(session.as_mut(), url, condition).await;
            let closed = session.close().await;

            let page = match (loaded, closed) {
                (Ok(page), Ok(())) => page,
                (Ok(_), Err(close_err)) => return Err(close_err),
                (Err(load_err), Ok(())) => return Err(load_err),
                (Err(load_err), Err(close_err)) => {
                    warn!(error = %close_err, "closing browser session after failed load");
                    return Err(load_err);
                }
            };
            info!(
                load_secs = page.load_time.as_secs_f64(),
                "page took {:.2} seconds to load",
                page.load_time.as_secs_f64()
            );
            Ok(page)
        }
        .instrument(span)
        .await
    }

    async fn load(
        &self,
        session: &mut dyn BrowserSession,
        url: &str,
        condition: &WaitCondition,
    ) -> Result<RenderedPage, BrowserError> {
        let started = Instant::now();
        session.goto(url).await?;
        session.wait_for(condition, self.max_loading_time).await?;
        let load_time = started.elapsed();
        let markup = session.page_source().await?;
        Ok(RenderedPage {
            url: url.to_string(),
            markup,
            load_time,
        })
    }
}
