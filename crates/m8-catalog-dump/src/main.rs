use anyhow::Result;
use clap::Parser;
use tracing::info;
use tracing_subscriber::{self, fmt::format::FmtSpan};

use m8_updater_core::events::{EventHub, OutboundEvent};
use m8_updater_core::firmware::CatalogService;

/// CLI tool to fetch the remote firmware catalog and print the merged result
#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Args {
    /// Also dump each version's changelog sections
    #[clap(short, long)]
    changelog: bool,

    /// Only show entries that carry a downloadable archive
    #[clap(short, long)]
    downloadable_only: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Set up tracing
    tracing_subscriber::fmt()
        .with_env_filter("info")
        .with_span_events(FmtSpan::CLOSE)
        .init();

    println!("M8 Catalog Dump");
    println!("===============");
    println!();

    let hub = EventHub::new();
    let mut outbound = hub.subscribe_outbound()?;

    let catalog = CatalogService::new(hub);

    info!("Fetching firmware catalog");

    let entries = catalog.refresh().await?;

    // Network failures surface as notices rather than errors; show them the
    // way the desktop app would.
    while let Ok(event) = outbound.try_recv() {
        if let OutboundEvent::Notice(notice) = event {
            println!("[{:?}] {}", notice.severity, notice.message);
        }
    }

    println!("Found {} catalog entries", entries.len());
    println!();

    for entry in &entries {
        let archive = if entry.path.is_empty() {
            "no standalone archive".to_string()
        } else {
            match entry.size {
                Some(size) => format!("{} ({:.2} MB)", entry.path, size as f64 / 1_048_576.0),
                None => entry.path.clone(),
            }
        };

        if args.downloadable_only && entry.path.is_empty() {
            continue;
        }

        println!(
            "{:<16} {}  {}",
            entry.version,
            entry.date.as_deref().unwrap_or("----------"),
            archive
        );

        if args.changelog {
            for section in entry.changelog.as_deref().unwrap_or_default() {
                if let Some(title) = &section.title {
                    println!("    {title}");
                }

                for item in &section.entries {
                    println!("      - {:?}: {}", item.kind, item.description);

                    for detail in &item.details {
                        println!("          {detail}");
                    }
                }
            }
            println!();
        }
    }

    Ok(())
}
