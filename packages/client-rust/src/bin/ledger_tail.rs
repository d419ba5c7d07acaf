//! ledger-tail: scrolls through the transaction ledger one viewport at a time.
//!
//! Pages are requested by a [`ScrollSentinel`] exactly as a scrolling list
//! would request them, so the output shows what a user sees while paging
//! down, followed by the aggregated totals.

use std::sync::Arc;

use clap::Parser;
use ledger_client::{
    ClientConfig, HttpTransactionApi, PageSource, PaginationAccumulator, ScrollSentinel,
    TransactionClient, ViewportGeometry,
};
use ledger_core::{Transaction, TransactionKind};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "ledger-tail")]
#[command(about = "Scroll through the transaction ledger page by page")]
struct Args {
    /// Base URL of the transaction service
    #[arg(long, env = "LEDGER_API_URL", default_value = "http://localhost:3333")]
    base_url: String,

    /// Rows requested per page
    #[arg(long, default_value_t = 10)]
    page_size: usize,

    /// Rows visible at once
    #[arg(long, default_value_t = 8)]
    viewport_rows: usize,

    /// Rows below the viewport that still trigger a load
    #[arg(long, default_value_t = 2)]
    threshold: usize,

    /// Stop after printing this many rows
    #[arg(long)]
    limit: Option<usize>,

    /// Timeout for each HTTP request in milliseconds
    #[arg(long, default_value_t = 30_000)]
    request_timeout_ms: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .init();

    let config = ClientConfig {
        base_url: args.base_url.clone(),
        page_size: args.page_size,
        request_timeout_ms: args.request_timeout_ms,
        ..ClientConfig::default()
    };
    config.validate()?;
    tracing::info!(base_url = %config.base_url, page_size = config.page_size, "tailing ledger");

    let api = HttpTransactionApi::new(&config.base_url, config.request_timeout())?;
    let client = Arc::new(TransactionClient::new(Arc::new(api), config));
    let mut gc = client.start_gc();

    let result = tail(&client, &args).await;

    gc.stop().await;
    client.dispose();
    result
}

async fn tail(client: &Arc<TransactionClient>, args: &Args) -> anyhow::Result<()> {
    let viewport = args.viewport_rows.max(1);
    let limit = args.limit.unwrap_or(usize::MAX);
    let sentinel = ScrollSentinel::new(client.paginate());
    let accumulator = sentinel.accumulator();
    accumulator.load_next().await?;

    let mut offset = 0;
    let mut printed = 0;
    loop {
        let items = accumulator.items();
        let end = (offset + viewport).min(items.len()).min(limit);
        for row in items.iter().take(end).skip(printed) {
            println!("{}", format_row(row));
        }
        printed = printed.max(end);

        if printed >= limit || (end == items.len() && !accumulator.status().has_more) {
            break;
        }
        if end < items.len() {
            offset += viewport;
        }
        sentinel
            .on_viewport_change(geometry(items.len().saturating_sub(offset), viewport, args.threshold))
            .await?;
    }

    print_footer(client, accumulator).await
}

#[allow(clippy::cast_precision_loss)]
fn geometry(rows_below_top: usize, viewport: usize, threshold: usize) -> ViewportGeometry {
    ViewportGeometry {
        content_bottom: rows_below_top as f64,
        viewport_height: viewport as f64,
        threshold: threshold as f64,
    }
}

fn format_row(row: &Transaction) -> String {
    let date = row
        .date
        .map_or_else(|| "----------".to_string(), |date| date.format("%Y-%m-%d").to_string());
    let sign = match row.kind {
        TransactionKind::Income => ' ',
        TransactionKind::Outcome => '-',
    };
    format!("{date}  {:<28} {:<14} {sign}{:>10.2}", row.title, row.category, row.price)
}

async fn print_footer<S: PageSource>(
    client: &TransactionClient,
    accumulator: &PaginationAccumulator<S>,
) -> anyhow::Result<()> {
    let summary = client.aggregate().await?;
    println!();
    println!(
        "{}/{} transactions | income {:.2} | outcome {:.2} | balance {:.2}",
        accumulator.items().len(),
        summary.total_transactions,
        summary.total_income,
        summary.total_outcome,
        summary.balance()
    );
    let stats = client.store().stats();
    tracing::debug!(
        hits = stats.hits,
        misses = stats.misses,
        fetches = stats.fetches,
        "cache stats"
    );
    Ok(())
}
