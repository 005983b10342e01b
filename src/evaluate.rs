//! Baseline and circuit evaluation
//!
//! A circuit is evaluated by running the clean prompt while every edge
//! outside the graph carries its activation from the corrupted prompt.

use candle_core::Tensor;
use tracing::{debug, info};

use crate::attribute::progress_bar;
use crate::dataset::Batch;
use crate::error::{EapError, Result};
use crate::forward_gpt2::{ForwardOptions, Patch};
use crate::graph::Graph;
use crate::metrics::{Metric, MetricOptions};
use crate::model::EapModel;

/// Per-example metric values of the unpatched model.
///
/// With `run_corrupted` the corrupted prompts are scored, against the
/// clean logits as reference.
pub fn evaluate_baseline(
    model: &EapModel,
    batches: &[Batch],
    metric: &Metric,
    run_corrupted: bool,
) -> Result<Vec<f32>> {
    info!(
        "Evaluating {} baseline on {} batches",
        if run_corrupted { "corrupted" } else { "clean" },
        batches.len()
    );
    let mut results = Vec::new();
    for batch in batches.iter().filter(|b| !b.is_empty()) {
        let pair = model.tokenize_pair(&batch.clean, &batch.corrupted)?;
        let clean = model.forward(&pair.clean, &ForwardOptions::default())?.logits;
        let logits = if run_corrupted {
            model
                .forward(&pair.corrupted, &ForwardOptions::default())?
                .logits
        } else {
            clean.clone()
        };
        let values = metric.compute(
            &logits,
            &clean,
            &pair.input_lengths,
            &batch.labels,
            MetricOptions::EVALUATION,
        )?;
        results.extend(values.to_vec1::<f32>()?);
    }
    Ok(results)
}

/// Per-example metric values with every edge outside `graph` patched to
/// its corrupted activation
pub fn evaluate_graph(
    model: &EapModel,
    graph: &Graph,
    batches: &[Batch],
    metric: &Metric,
) -> Result<Vec<f32>> {
    let cfg = model.graph_config();
    if *graph.cfg() != cfg {
        return Err(EapError::Graph(format!(
            "graph built for {:?} but model has {:?}",
            graph.cfg(),
            cfg
        )));
    }
    let excluded = Tensor::from_vec(
        graph.excluded_edge_matrix(),
        (cfg.n_forward(), cfg.n_backward()),
        model.device(),
    )?;
    debug!(
        "Evaluating graph with {} of {} edges",
        graph.count_included_edges(),
        graph.n_edges()
    );

    let mut results = Vec::new();
    let pb = progress_bar(batches.len(), "evaluate");
    for batch in batches {
        pb.inc(1);
        if batch.is_empty() {
            continue;
        }
        let pair = model.tokenize_pair(&batch.clean, &batch.corrupted)?;
        let corrupted = model.forward(&pair.corrupted, &ForwardOptions::default())?;
        let corrupted_acts = corrupted.activations.stacked()?;
        let clean_logits = model.forward(&pair.clean, &ForwardOptions::default())?.logits;

        let patched = model.forward(
            &pair.clean,
            &ForwardOptions {
                patch: Some(Patch {
                    corrupted: &corrupted_acts,
                    excluded: &excluded,
                }),
                ..Default::default()
            },
        )?;
        let values = metric.compute(
            &patched.logits,
            &clean_logits,
            &pair.input_lengths,
            &batch.labels,
            MetricOptions::EVALUATION,
        )?;
        results.extend(values.to_vec1::<f32>()?);
    }
    pb.finish_and_clear();
    Ok(results)
}
