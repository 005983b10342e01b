//! Edge attribution scores (EAP and EAP-IG)
//!
//! The score of edge `u -> v` approximates the change in the metric when
//! the clean activation of `u` is replaced by its corrupted activation at
//! the input of `v`:
//!
//! ```text
//! score(u, v) = (a_u(corrupted) - a_u(clean)) · ∂metric/∂input_v
//! ```
//!
//! summed over batch, positions and model dimension, then divided by the
//! number of examples. EAP-IG replaces the gradient at the clean input by
//! its average along a straight path from the corrupted to the clean input
//! embeddings.

use candle_core::Tensor;
use indicatif::{ProgressBar, ProgressStyle};
use tracing::{debug, info};

use crate::cache::InputProbes;
use crate::dataset::Batch;
use crate::error::{EapError, Result};
use crate::forward_gpt2::ForwardOptions;
use crate::graph::Graph;
use crate::metrics::{Metric, MetricOptions};
use crate::model::{EapModel, TokenizedPair};

/// How gradients are taken
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttributionMethod {
    /// Gradient at the clean input
    Vanilla,
    /// Mean gradient over `steps` points between corrupted and clean embeddings
    IntegratedGradients { steps: usize },
}

impl std::fmt::Display for AttributionMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AttributionMethod::Vanilla => write!(f, "EAP"),
            AttributionMethod::IntegratedGradients { steps } => write!(f, "EAP-IG({steps})"),
        }
    }
}

/// Progress bar over `len` batches
pub(crate) fn progress_bar(len: usize, prefix: &str) -> ProgressBar {
    let pb = ProgressBar::new(len as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{prefix}: [{bar:30}] {pos}/{len} ({eta})")
            .unwrap_or_else(|_| ProgressStyle::default_bar()),
    );
    pb.set_prefix(prefix.to_string());
    pb
}

/// Score every edge of `graph` on `batches`.
///
/// Scores are added to the graph (real edges only) after dividing by the
/// total number of examples; the graph must match the model's dimensions.
pub fn attribute(
    model: &EapModel,
    graph: &mut Graph,
    batches: &[Batch],
    metric: &Metric,
    method: AttributionMethod,
) -> Result<()> {
    let cfg = model.graph_config();
    if *graph.cfg() != cfg {
        return Err(EapError::Graph(format!(
            "graph built for {:?} but model has {:?}",
            graph.cfg(),
            cfg
        )));
    }
    if let AttributionMethod::IntegratedGradients { steps: 0 } = method {
        return Err(EapError::Config(
            "integrated gradients needs at least one step".to_string(),
        ));
    }

    info!("Attributing {} batches with {}", batches.len(), method);
    let (n_fwd, n_bwd) = (cfg.n_forward(), cfg.n_backward());
    let mut totals = Tensor::zeros((n_fwd, n_bwd), candle_core::DType::F32, model.device())?;
    let mut total_items = 0usize;

    let pb = progress_bar(batches.len(), "attribute");
    for batch in batches {
        if batch.is_empty() {
            pb.inc(1);
            continue;
        }
        let pair = model.tokenize_pair(&batch.clean, &batch.corrupted)?;
        let batch_scores = score_batch(model, &pair, batch, metric, method)?;
        totals = totals.add(&batch_scores)?;
        total_items += batch.len();
        pb.inc(1);
    }
    pb.finish_and_clear();

    if total_items == 0 {
        return Err(EapError::Config("no examples to attribute".to_string()));
    }
    let matrix: Vec<f32> = totals.flatten_all()?.to_vec1()?;
    graph.add_scores(&matrix, 1.0 / total_items as f32)?;
    debug!("Attribution done over {} examples", total_items);
    Ok(())
}

/// Summed `[n_forward, n_backward]` scores of one batch
fn score_batch(
    model: &EapModel,
    pair: &TokenizedPair,
    batch: &Batch,
    metric: &Metric,
    method: AttributionMethod,
) -> Result<Tensor> {
    let cfg = model.graph_config();
    let n_fwd = cfg.n_forward();
    let n_batch = batch.len();

    let corrupted = model.forward(&pair.corrupted, &ForwardOptions::default())?;
    let clean = model.forward(&pair.clean, &ForwardOptions::default())?;
    let clean_logits = clean.logits.detach();

    let corrupted_acts = corrupted.activations.stacked()?;
    let clean_acts = clean.activations.stacked()?;
    let diff = corrupted_acts
        .sub(&clean_acts)?
        .reshape((n_fwd, ()))?
        .detach();

    let gradients = match method {
        AttributionMethod::Vanilla => {
            input_gradients(model, pair, batch, metric, &clean_logits, None)?
        }
        AttributionMethod::IntegratedGradients { steps } => {
            let clean_embeds = clean.activations.embeddings()?.detach();
            let corrupted_embeds = corrupted.activations.embeddings()?.detach();
            let direction = clean_embeds.sub(&corrupted_embeds)?;
            let mut sum: Option<Tensor> = None;
            for step in 1..=steps {
                let alpha = step as f64 / steps as f64;
                let embeds = corrupted_embeds.add(&(&direction * alpha)?)?;
                let g = input_gradients(model, pair, batch, metric, &clean_logits, Some(&embeds))?;
                sum = Some(match sum {
                    Some(acc) => acc.add(&g)?,
                    None => g,
                });
            }
            match sum {
                Some(total) => (total / steps as f64)?,
                None => {
                    return Err(EapError::Config(
                        "integrated gradients needs at least one step".to_string(),
                    ))
                }
            }
        }
    };
    debug!(
        "batch of {}: gradients {:?}, diff {:?}",
        n_batch,
        gradients.dims(),
        diff.dims()
    );

    // (n_fwd, bpd) @ (bpd, n_bwd)
    Ok(diff.matmul(&gradients.t()?.contiguous()?)?)
}

/// Gradients of the attribution loss with respect to every reader input,
/// `(n_backward, batch*seq*d_model)`
fn input_gradients(
    model: &EapModel,
    pair: &TokenizedPair,
    batch: &Batch,
    metric: &Metric,
    clean_logits: &Tensor,
    embeddings: Option<&Tensor>,
) -> Result<Tensor> {
    let probes = InputProbes::new(model.graph_config(), batch.len(), pair.n_pos, model.device())?;
    let out = model.forward(
        &pair.clean,
        &ForwardOptions {
            embeddings,
            probes: Some(&probes),
            ..Default::default()
        },
    )?;
    let value = metric.compute(
        &out.logits,
        clean_logits,
        &pair.input_lengths,
        &batch.labels,
        MetricOptions::ATTRIBUTION,
    )?;
    let grads = value.backward()?;
    probes.gradient_matrix(&grads)
}
