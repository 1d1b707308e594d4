use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use rbcn_adapters::AdapterError;
use rbcn_browser::{BrowserError, FixtureLauncher};
use rbcn_sync::{ScrapeConfig, ScrapePipeline};
use tempfile::tempdir;

fn sample_dir() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("../../fixtures/rbcnotes/sample")
        .canonicalize()
        .expect("sample fixtures")
}

fn offline_config(fixtures: &Path, output: &Path) -> ScrapeConfig {
    ScrapeConfig {
        fixtures_dir: Some(fixtures.to_path_buf()),
        output_path: output.to_path_buf(),
        ..ScrapeConfig::default()
    }
}

#[tokio::test]
async fn sample_run_groups_families_and_writes_workbook() {
    let out = tempdir().unwrap();
    let output_path = out.path().join("funds_data.xlsx");
    let pipeline = ScrapePipeline::new(offline_config(&sample_dir(), &output_path));

    let run = pipeline.run_once().await.unwrap();

    assert_eq!(run.summary.listed_rows, 5);
    assert_eq!(run.summary.products, 5);
    assert_eq!(run.summary.categories, 2);
    assert_eq!(run.summary.output_path.as_deref(), Some(output_path.display().to_string().as_str()));
    assert!(output_path.exists());

    let index_family = run.categories.get("Solactive Canada Bank 40 Index").unwrap();
    assert_eq!(
        index_family,
        &[
            "Solactive Canada Bank 40 Index Series 12".to_string(),
            "Solactive Canada Bank 40 Index Series 12, F-Class".to_string(),
            "Solactive Canada Bank 40 Index 4.25% Securities, Series 3".to_string(),
        ]
    );
    assert_eq!(run.categories.get("Solactive Canada Bank 40 AR Index").unwrap().len(), 2);

    let f_class = run.directory.get("Solactive Canada Bank 40 AR Index Series 6, F-Class").unwrap();
    assert_eq!(f_class.reference_value("Minimum Investment"), "$5,000");
    assert_eq!(f_class.maturity_date, "2031-04-11");
}

#[tokio::test]
async fn cap_limits_products_and_detail_fetches() {
    let out = tempdir().unwrap();
    let mut config = offline_config(&sample_dir(), &out.path().join("capped.xlsx"));
    config.max_number_funds = 2;
    let launcher = FixtureLauncher::new(sample_dir()).with_listing_url(config.listing_url());
    let stats = launcher.stats();

    let run = ScrapePipeline::with_launcher(config, Arc::new(launcher))
        .run_once()
        .await
        .unwrap();

    assert_eq!(
        run.directory.names().collect::<Vec<_>>(),
        vec![
            "Solactive Canada Bank 40 Index Series 12",
            "Solactive Canada Bank 40 Index Series 12, F-Class",
        ]
    );
    assert_eq!(run.summary.categories, 1);
    assert_eq!(stats.opened(), 3);
    assert_eq!(stats.open_sessions(), 0);
}

#[tokio::test]
async fn listing_timeout_is_reported_and_session_closed() {
    let fixtures = tempdir().unwrap();
    std::fs::write(
        fixtures.path().join("listing.html"),
        "<html><body><div class=\"spinner\">Loading notes...</div></body></html>",
    )
    .unwrap();
    let out = tempdir().unwrap();
    let output_path = out.path().join("never.xlsx");
    let mut config = offline_config(fixtures.path(), &output_path);
    config.max_loading_time = Duration::from_secs(3);
    let launcher = FixtureLauncher::new(fixtures.path()).with_listing_url(config.listing_url());
    let stats = launcher.stats();

    let err = ScrapePipeline::with_launcher(config, Arc::new(launcher))
        .run_once()
        .await
        .unwrap_err();

    match err.downcast_ref::<AdapterError>() {
        Some(AdapterError::Browser(BrowserError::PageLoadTimeout { selector, waited, .. })) => {
            assert_eq!(selector, ".note-row");
            assert_eq!(*waited, Duration::from_secs(3));
        }
        other => panic!("expected PageLoadTimeout, got {other:?}"),
    }
    assert_eq!(stats.opened(), 1);
    assert_eq!(stats.closed(), 1);
    assert!(!output_path.exists());
}

#[tokio::test]
async fn json_dump_contains_categories_and_products() {
    let out = tempdir().unwrap();
    let pipeline = ScrapePipeline::new(offline_config(&sample_dir(), &out.path().join("dump.xlsx")));
    let run = pipeline.run_once().await.unwrap();

    let dump: serde_json::Value = serde_json::from_str(&run.json_dump().unwrap()).unwrap();
    assert_eq!(dump["categories"].as_object().unwrap().len(), 2);
    assert_eq!(
        dump["products"]["Solactive Canada Bank 40 Index Series 12"]["reference_info"]["Term"],
        "7 years"
    );
}

#[tokio::test]
async fn listing_without_rows_writes_no_workbook() {
    let fixtures = tempdir().unwrap();
    std::fs::write(
        fixtures.path().join("listing.html"),
        "<html><body><div class=\"note-row\">No notes match your search.</div></body></html>",
    )
    .unwrap();
    let out = tempdir().unwrap();
    let output_path = out.path().join("empty.xlsx");
    let config = offline_config(fixtures.path(), &output_path);
    let launcher = FixtureLauncher::new(fixtures.path()).with_listing_url(config.listing_url());
    let stats = launcher.stats();

    let run = ScrapePipeline::with_launcher(config, Arc::new(launcher))
        .run_once()
        .await
        .unwrap();

    assert_eq!(run.summary.listed_rows, 0);
    assert_eq!(run.summary.products, 0);
    assert_eq!(run.summary.categories, 0);
    assert!(run.summary.output_path.is_none());
    assert!(run.directory.is_empty());
    assert!(!output_path.exists());
    assert_eq!(stats.opened(), 1);
    assert_eq!(stats.open_sessions(), 0);
}
