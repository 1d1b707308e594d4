//! Listing and detail page adapters for the structured notes site.

use std::fmt;
use std::str::FromStr;

use rbcn_browser::{BrowserError, PageRenderer, WaitCondition};
use rbcn_core::{ProductDirectory, ProductListing, ReferenceInfo};
use scraper::{ElementRef, Html, Selector};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

/// Where things live on the source site's pages.
///
/// The date columns are positional: the site renders issue and maturity dates
/// as the 10th and 11th cells of every listing row. A layout change on the
/// site is a one-line change here.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SiteLayout {
    pub listing_row_class: &'static str,
    pub name_cell_selector: &'static str,
    pub name_anchor_selector: &'static str,
    pub issue_date_column: usize,
    pub maturity_date_column: usize,
    pub detail_container_id: &'static str,
    pub detail_table_selector: &'static str,
}

pub const RBC_NOTES_LAYOUT: SiteLayout = SiteLayout {
    listing_row_class: "note-row",
    name_cell_selector: r#"td[align="left"]"#,
    name_anchor_selector: "a",
    issue_date_column: 9,
    maturity_date_column: 10,
    detail_container_id: "divRefInfo",
    detail_table_selector: "table.table",
};

impl Default for SiteLayout {
    fn default() -> Self {
        RBC_NOTES_LAYOUT
    }
}

/// What to do with a listing row that cannot be identified.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MalformedRowPolicy {
    /// Abort the run.
    #[default]
    Fail,
    /// Drop the row with a warning; it does not count toward the cap.
    Skip,
}

impl FromStr for MalformedRowPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "fail" => Ok(Self::Fail),
            "skip" => Ok(Self::Skip),
            other => Err(format!("unknown malformed row policy `{other}` (expected fail|skip)")),
        }
    }
}

impl fmt::Display for MalformedRowPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Fail => f.write_str("fail"),
            Self::Skip => f.write_str("skip"),
        }
    }
}

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("listing row {index} is malformed: {reason}")]
    MalformedRow { index: usize, reason: String },
    #[error("detail page has no `{0}` container")]
    MissingContainer(String),
    #[error("invalid selector `{0}`")]
    InvalidSelector(String),
}

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error(transparent)]
    Browser(#[from] BrowserError),
    #[error("parsing {url}: {source}")]
    Parse {
        url: String,
        #[source]
        source: ParseError,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkippedRow {
    pub index: usize,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListingPage {
    /// Qualifying rows present on the page, before the cap.
    pub rows_found: usize,
    pub directory: ProductDirectory,
    pub skipped: Vec<SkippedRow>,
}

fn selector(css: &str) -> Result<Selector, ParseError> {
    Selector::parse(css).map_err(|_| ParseError::InvalidSelector(css.to_string()))
}

fn element_text(element: ElementRef<'_>) -> String {
    element.text().collect::<String>().trim().to_string()
}

#[derive(Debug, Clone)]
pub struct NotesSiteAdapter {
    domain: String,
    layout: SiteLayout,
}

impl NotesSiteAdapter {
    pub fn new(domain: impl Into<String>) -> Self {
        Self {
            domain: domain.into(),
            layout: RBC_NOTES_LAYOUT,
        }
    }

    pub fn with_layout(mut self, layout: SiteLayout) -> Self {
        self.layout = layout;
        self
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    pub fn layout(&self) -> &SiteLayout {
        &self.layout
    }

    /// Site-relative paths are appended to the domain verbatim.
    pub fn absolute_url(&self, path_or_url: &str) -> String {
        if path_or_url.starts_with("http://") || path_or_url.starts_with("https://") {
            path_or_url.to_string()
        } else {
            format!("{}{}", self.domain, path_or_url)
        }
    }

    pub fn listing_condition(&self) -> WaitCondition {
        WaitCondition::all_by_class(self.layout.listing_row_class)
    }

    pub fn detail_condition(&self) -> WaitCondition {
        WaitCondition::by_id(self.layout.detail_container_id)
    }

    /// Parses listing rows into a directory holding at most `max_products` entries.
    ///
    /// The cap is checked before each row is read, so rows past it are never parsed.
    pub fn parse_listing(
        &self,
        markup: &str,
        max_products: usize,
        policy: MalformedRowPolicy,
    ) -> Result<ListingPage, ParseError> {
        let row_sel = selector(&format!("tr.{}", self.layout.listing_row_class))?;
        let name_cell_sel = selector(self.layout.name_cell_selector)?;
        let anchor_sel = selector(self.layout.name_anchor_selector)?;
        let cell_sel = selector("td")?;

        let document = Html::parse_document(markup);
        let rows = document.select(&row_sel).collect::<Vec<_>>();
        let mut page = ListingPage {
            rows_found: rows.len(),
            ..Default::default()
        };

        for (index, row) in rows.into_iter().enumerate() {
            if page.directory.len() >= max_products {
                break;
            }
            match self.parse_listing_row(row, &name_cell_sel, &anchor_sel, &cell_sel) {
                Ok(listing) => {
                    page.directory.insert(listing);
                }
                Err(reason) => match policy {
                    MalformedRowPolicy::Fail => return Err(ParseError::MalformedRow { index, reason }),
                    MalformedRowPolicy::Skip => {
                        warn!(index, %reason, "skipping malformed listing row");
                        page.skipped.push(SkippedRow { index, reason });
                    }
                },
            }
        }
        Ok(page)
    }

    fn parse_listing_row(
        &self,
        row: ElementRef<'_>,
        name_cell_sel: &Selector,
        anchor_sel: &Selector,
        cell_sel: &Selector,
    ) -> Result<ProductListing, String> {
        let anchor = row
            .select(name_cell_sel)
            .next()
            .ok_or_else(|| format!("no name cell matching `{}`", self.layout.name_cell_selector))?
            .select(anchor_sel)
            .next()
            .ok_or_else(|| "name cell has no anchor".to_string())?;
        let name = element_text(anchor);
        let href = anchor
            .value()
            .attr("href")
            .ok_or_else(|| format!("anchor for `{name}` has no href"))?;

        let cells = row.select(cell_sel).collect::<Vec<_>>();
        let cell_text = |column: usize, label: &str| {
            cells
                .get(column)
                .map(|cell| element_text(*cell))
                .ok_or_else(|| format!("{label} column {column} missing ({} cells)", cells.len()))
        };
        let issue_date = cell_text(self.layout.issue_date_column, "issue date")?;
        let maturity_date = cell_text(self.layout.maturity_date_column, "maturity date")?;

        Ok(ProductListing::new(
            name,
            self.absolute_url(href),
            issue_date,
            maturity_date,
        ))
    }

    /// Reads the label/value table from a detail page. Rows without exactly two
    /// cells are ignored.
    pub fn parse_detail(&self, markup: &str) -> Result<ReferenceInfo, ParseError> {
        let container_css = format!("div#{}", self.layout.detail_container_id);
        let container_sel = selector(&container_css)?;
        let table_sel = selector(self.layout.detail_table_selector)?;
        let row_sel = selector("tr")?;
        let cell_sel = selector("td")?;

        let document = Html::parse_document(markup);
        let container = document
            .select(&container_sel)
            .next()
            .ok_or(ParseError::MissingContainer(container_css.clone()))?;
        let table = container.select(&table_sel).next().ok_or_else(|| {
            ParseError::MissingContainer(format!("{container_css} {}", self.layout.detail_table_selector))
        })?;

        let mut info = ReferenceInfo::new();
        for row in table.select(&row_sel) {
            let cells = row.select(&cell_sel).collect::<Vec<_>>();
            if let [label, value] = cells.as_slice() {
                info.insert(element_text(*label), element_text(*value));
            }
        }
        Ok(info)
    }

    pub async fn fetch_listing(
        &self,
        renderer: &PageRenderer,
        path: &str,
        max_products: usize,
        policy: MalformedRowPolicy,
    ) -> Result<ListingPage, AdapterError> {
        let url = self.absolute_url(path);
        let page = renderer.render(&url, &self.listing_condition()).await?;
        let listing = self
            .parse_listing(&page.markup, max_products, policy)
            .map_err(|source| AdapterError::Parse {
                url: url.clone(),
                source,
            })?;
        if listing.rows_found == 0 {
            warn!(%url, "table not found: listing page has no product rows");
        } else {
            info!(
                rows = listing.rows_found,
                kept = listing.directory.len(),
                skipped = listing.skipped.len(),
                "parsed listing page"
            );
        }
        Ok(listing)
    }

    pub async fn fetch_detail(
        &self,
        renderer: &PageRenderer,
        url: &str,
    ) -> Result<ReferenceInfo, AdapterError> {
        let page = renderer.render(url, &self.detail_condition()).await?;
        self.parse_detail(&page.markup).map_err(|source| AdapterError::Parse {
            url: url.to_string(),
            source,
        })
    }

    /// Fetches every product's detail page in listing order, one session at a time.
    pub async fn attach_reference_info(
        &self,
        renderer: &PageRenderer,
        directory: &mut ProductDirectory,
    ) -> Result<usize, AdapterError> {
        let targets = directory
            .iter()
            .map(|listing| (listing.name.clone(), listing.detail_url.clone()))
            .collect::<Vec<_>>();
        let mut attached = 0usize;
        for (name, url) in targets {
            let info = self.fetch_detail(renderer, &url).await?;
            if directory.attach_reference_info(&name, info) {
                attached += 1;
            }
        }
        Ok(attached)
    }
}
