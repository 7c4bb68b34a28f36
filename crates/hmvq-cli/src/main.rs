use std::fmt::Write as _;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use hmvq_core::{Query, QuoteAssessment};
use hmvq_engine::{assess_quote, Dataset, RecordFilter};
use hmvq_web::{cluster_listing, load_dataset, WebConfig};
use tracing::error;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "hmvq-cli")]
#[command(about = "Check supplier HMV labour quotes against maintenance history")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Assess one supplier quote.
    Quote {
        #[arg(long)]
        data: PathBuf,
        #[arg(long)]
        discrepancy: String,
        #[arg(long)]
        corrective_action: String,
        #[arg(long)]
        supplier_hours: f64,
        /// Print the full assessment as JSON.
        #[arg(long)]
        json: bool,
    },
    /// List clusters by occurrence count.
    Clusters {
        #[arg(long)]
        data: PathBuf,
        #[arg(long)]
        limit: Option<usize>,
    },
    /// List historical records through the display filters.
    Records {
        #[arg(long)]
        data: PathBuf,
        #[arg(long = "year")]
        years: Vec<i32>,
        #[arg(long)]
        card: Option<String>,
        #[arg(long)]
        min_hours: Option<f64>,
        #[arg(long)]
        max_hours: Option<f64>,
    },
    /// Run the web front-end. Flags override HMVQ_* environment variables.
    Serve {
        #[arg(long)]
        data: Option<PathBuf>,
        #[arg(long)]
        port: Option<u16>,
        #[arg(long)]
        bind: Option<String>,
    },
}

#[tokio::main]
async fn main() {
    init_tracing();
    let cli = Cli::parse();

    if let Err(err) = run(cli).await {
        error!(error = %err, "command failed");
        for cause in err.chain().skip(1) {
            error!(cause = %cause, "caused by");
        }
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Quote {
            data,
            discrepancy,
            corrective_action,
            supplier_hours,
            json,
        } => {
            let dataset = load_dataset(&data)?;
            let query = Query {
                discrepancy,
                corrective_action,
                supplier_hours,
            };
            let assessment = assess_quote(&dataset, &query).context("assessing quote")?;
            if json {
                println!("{}", serde_json::to_string_pretty(&assessment)?);
            } else {
                print!("{}", render_assessment(&assessment));
            }
        }
        Commands::Clusters { data, limit } => {
            let dataset = load_dataset(&data)?;
            let clusters = cluster_listing(&dataset);
            for c in clusters.iter().take(limit.unwrap_or(usize::MAX)) {
                println!(
                    "{:<5} x{:<4} fair {:>7.2}h  {}",
                    c.id, c.occurrence_count, c.fair_quote_hours, c.representative
                );
            }
        }
        Commands::Records {
            data,
            years,
            card,
            min_hours,
            max_hours,
        } => {
            let dataset = load_dataset(&data)?;
            let filter = RecordFilter {
                years,
                card_contains: card,
                min_hours,
                max_hours,
            };
            print!("{}", render_records(&dataset, &filter));
        }
        Commands::Serve { data, port, bind } => {
            let mut config = WebConfig::from_env();
            if data.is_some() {
                config.data_path = data;
            }
            if let Some(port) = port {
                config.port = port;
            }
            if let Some(bind) = bind {
                config.bind_addr = bind;
            }
            hmvq_web::serve(config).await?;
        }
    }

    Ok(())
}

fn render_assessment(assessment: &QuoteAssessment) -> String {
    let mut out = String::new();
    let Some(tier) = assessment.result.tier() else {
        out.push_str("No eligible historical records to compare against.\n");
        return out;
    };
    let _ = writeln!(out, "{}", tier.label());
    if let Some(c) = &assessment.conclusion {
        let percent = c
            .percent_difference
            .map(|p| format!("{p:+.1}%"))
            .unwrap_or_else(|| "N/A".into());
        let _ = writeln!(out, "{}", c.verdict);
        let _ = writeln!(
            out,
            "supplier {:.2}h  fair {:.2}h  difference {percent}",
            c.supplier_hours, c.fair_quote_hours
        );
    }
    for m in assessment.result.rows() {
        let row = &m.row;
        let _ = writeln!(
            out,
            "  row {:<5} {:>7.2}h  fair {:>7.2}h x{:<3} overlap {:>5.1}  {} / {}",
            row.source_row(),
            row.record.total_hours,
            row.fair_quote_hours().unwrap_or_default(),
            row.occurrence_count().unwrap_or_default(),
            m.overlap_score,
            row.record.description,
            row.record.corrective_action,
        );
    }
    out
}

fn render_records(dataset: &Dataset, filter: &RecordFilter) -> String {
    let mut out = String::new();
    for row in dataset.filtered_rows(filter) {
        let _ = writeln!(
            out,
            "{:<5} {:<6} {:<10} {:>7.2}h  {} / {}",
            row.source_row(),
            row.record.year.map(|y| y.to_string()).unwrap_or_default(),
            row.record.card_number.as_deref().unwrap_or("-"),
            row.record.total_hours,
            row.record.description,
            row.record.corrective_action,
        );
    }
    out
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}
