//! eap-rs CLI: pareto sweep of edge attribution patching circuits

use anyhow::{Context, Result};
use clap::Parser;
use eap_rs::{EapModel, Sweep, SweepConfig};
use std::path::PathBuf;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser)]
#[command(name = "eap-rs")]
#[command(about = "Edge attribution patching: circuit size vs. task performance")]
#[command(version)]
struct Cli {
    /// Model ID from `HuggingFace` (e.g., "openai-community/gpt2")
    #[arg(long)]
    model: String,

    /// Task name (e.g., "ioi", "greater-than", "sva")
    #[arg(long)]
    task: String,

    /// Task metric ("logit_diff", "prob_diff", "kl_divergence", "js_divergence")
    #[arg(long)]
    metric: String,

    /// Examples per batch
    #[arg(long, alias = "batch_size")]
    batch_size: usize,

    /// Upper bound (exclusive) of the edge-count schedule
    #[arg(long, default_value_t = 10000)]
    end: usize,

    /// First edge count of the schedule
    #[arg(long, default_value_t = 500)]
    start: usize,

    /// Edge-count increment
    #[arg(long, default_value_t = 500)]
    step: usize,

    /// Keep only the first N examples
    #[arg(long, default_value_t = 3000)]
    head: usize,

    /// Integrated-gradients steps for the EAP-IG variants
    #[arg(long, default_value_t = 5)]
    ig_steps: usize,

    /// Dataset root holding `{task}/{family}.csv`
    #[arg(long, default_value = "data")]
    data_dir: PathBuf,

    /// Dataset file name inside `{data_dir}/{task}/` (overrides the model family)
    #[arg(long)]
    filename: Option<String>,

    /// Output directory for graph snapshots
    #[arg(long, default_value = "graphs")]
    graphs_dir: PathBuf,

    /// Output directory for progress records and the CSV summary
    #[arg(long, default_value = "results")]
    results_dir: PathBuf,

    /// Shuffle the dataset with this seed before truncating
    #[arg(long)]
    seed: Option<u64>,

    /// Force CPU mode
    #[arg(long)]
    cpu: bool,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    println!("=== eap-rs: edge attribution patching sweep ===");
    println!("Model:  {}", cli.model);
    println!("Task:   {} ({})", cli.task, cli.metric);
    println!("Edges:  {}..{} by {}", cli.start, cli.end, cli.step);
    if cli.cpu {
        println!("Mode:   CPU (forced)");
    }

    info!("Loading model...");
    let model = EapModel::from_pretrained(&cli.model, cli.cpu)
        .with_context(|| format!("Failed to load model {}", cli.model))?;
    let graph_cfg = model.graph_config();
    info!(
        "Model: {} layers, {} heads, {} hidden",
        graph_cfg.n_layers, graph_cfg.n_heads, graph_cfg.d_model
    );

    let config = SweepConfig {
        task: cli.task,
        metric: cli.metric,
        batch_size: cli.batch_size,
        head: cli.head,
        start: cli.start,
        end: cli.end,
        step: cli.step,
        ig_steps: cli.ig_steps,
        data_dir: cli.data_dir,
        filename: cli.filename,
        graphs_dir: cli.graphs_dir,
        results_dir: cli.results_dir,
        seed: cli.seed,
    };

    let sweep = Sweep::new(model, config);
    let results = sweep.run().context("Sweep failed")?;

    println!("\n=== Results ===");
    println!("Baseline:           {:.4}", results.baseline);
    println!("Corrupted baseline: {:.4}", results.corrupted_baseline);
    let p = &results.progress;
    for (row, step) in p.steps.iter().enumerate() {
        let cells: Vec<String> = results
            .labels
            .iter()
            .enumerate()
            .map(|(col, label)| {
                format!(
                    "{label}: {} edges, {:.4}",
                    p.n_edges[row][col], p.results[row][col]
                )
            })
            .collect();
        println!("{step:>6}  {}", cells.join("  |  "));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_batch_size_spellings() {
        for flag in ["--batch-size", "--batch_size"] {
            let cli = Cli::try_parse_from([
                "eap-rs", "--model", "gpt2", "--task", "ioi", "--metric", "logit_diff", flag, "8",
            ])
            .unwrap();
            assert_eq!(cli.batch_size, 8);
            assert_eq!(cli.end, 10000);
        }
    }
}
