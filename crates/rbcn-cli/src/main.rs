use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use rbcn_sync::{ScrapeConfig, ScrapePipeline};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "rbcn-cli")]
#[command(about = "Structured notes scraper and family report")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Scrape the listing and detail pages and write the workbook.
    Run(RunArgs),
    /// Print the category key derived from each product name.
    Normalize { names: Vec<String> },
}

#[derive(Debug, Default, Args)]
struct RunArgs {
    #[arg(long)]
    domain: Option<String>,
    #[arg(long)]
    path: Option<String>,
    /// Seconds to wait for a page's marker element.
    #[arg(long, value_name = "SECS")]
    max_loading_time: Option<u64>,
    #[arg(long, value_name = "N")]
    max_funds: Option<usize>,
    #[arg(long)]
    output: Option<PathBuf>,
    #[arg(long, value_name = "URL")]
    webdriver_url: Option<String>,
    #[arg(long)]
    no_headless: bool,
    /// Read saved pages from DIR instead of driving a browser.
    #[arg(long, value_name = "DIR")]
    fixtures: Option<PathBuf>,
    /// Drop listing rows without a product link instead of aborting.
    #[arg(long)]
    skip_malformed: bool,
    /// Print categories and products as JSON.
    #[arg(long)]
    json: bool,
}

impl RunArgs {
    fn apply(&self, mut config: ScrapeConfig) -> ScrapeConfig {
        if let Some(domain) = &self.domain {
            config.domain = domain.clone();
        }
        if let Some(path) = &self.path {
            config.path = path.clone();
        }
        if let Some(secs) = self.max_loading_time {
            config.max_loading_time = Duration::from_secs(secs);
        }
        if let Some(max) = self.max_funds {
            config.max_number_funds = max;
        }
        if let Some(output) = &self.output {
            config.output_path = output.clone();
        }
        if let Some(url) = &self.webdriver_url {
            config.webdriver_url = url.clone();
        }
        if self.no_headless {
            config.headless = false;
        }
        if let Some(dir) = &self.fixtures {
            config.fixtures_dir = Some(dir.clone());
        }
        if self.skip_malformed {
            config.malformed_rows = rbcn_sync::MalformedRowPolicy::Skip;
        }
        config
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    match cli.command.unwrap_or_else(|| Commands::Run(RunArgs::default())) {
        Commands::Run(args) => {
            let config = args.apply(ScrapeConfig::from_env());
            let run = ScrapePipeline::new(config).run_once().await?;
            if args.json {
                println!("{}", run.json_dump()?);
            }
            let summary = &run.summary;
            println!(
                "run complete: run_id={} rows={} products={} categories={} output={}",
                summary.run_id,
                summary.listed_rows,
                summary.products,
                summary.categories,
                summary.output_path.as_deref().unwrap_or("<none>")
            );
        }
        Commands::Normalize { names } => {
            for name in names {
                println!("{name} => {}", rbcn_core::category_key(&name));
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run_args(argv: &[&str]) -> RunArgs {
        let cli = Cli::try_parse_from(argv).unwrap();
        match cli.command {
            Some(Commands::Run(args)) => args,
            other => panic!("expected run command, got {other:?}"),
        }
    }

    fn env_config() -> ScrapeConfig {
        ScrapeConfig::from_lookup(|key| match key {
            "RBCN_DOMAIN" => Some("https://env.example".to_string()),
            "RBCN_MAX_NUMBER_FUNDS" => Some("7".to_string()),
            "RBCN_OUTPUT_PATH" => Some("env.xlsx".to_string()),
            _ => None,
        })
    }

    #[test]
    fn flags_override_environment_values() {
        let args = run_args(&[
            "rbcn-cli",
            "run",
            "--domain",
            "https://flag.example",
            "--max-funds",
            "3",
            "--max-loading-time",
            "5",
            "--no-headless",
            "--skip-malformed",
            "--fixtures",
            "fixtures/rbcnotes/sample",
        ]);
        let config = args.apply(env_config());

        assert_eq!(config.domain, "https://flag.example");
        assert_eq!(config.max_number_funds, 3);
        assert_eq!(config.max_loading_time, Duration::from_secs(5));
        assert!(!config.headless);
        assert_eq!(config.malformed_rows, rbcn_sync::MalformedRowPolicy::Skip);
        assert_eq!(config.fixtures_dir, Some(PathBuf::from("fixtures/rbcnotes/sample")));
        assert_eq!(config.output_path, PathBuf::from("env.xlsx"));
    }

    #[test]
    fn no_flags_keep_environment_config() {
        let config = run_args(&["rbcn-cli", "run"]).apply(env_config());
        assert_eq!(config, env_config());
    }

    #[test]
    fn missing_subcommand_parses() {
        let cli = Cli::try_parse_from(["rbcn-cli"]).unwrap();
        assert!(cli.command.is_none());
    }
}
