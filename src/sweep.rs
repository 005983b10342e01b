//! Pareto sweep: circuit size against task performance
//!
//! Scores three graphs (EAP, EAP-IG on the task metric, EAP-IG on KL
//! divergence), then for each target edge count greedily selects a circuit
//! from every graph, evaluates it and records the result.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::attribute::{attribute, progress_bar, AttributionMethod};
use crate::dataset::{Batch, EapDataset};
use crate::error::{EapError, Result};
use crate::evaluate::{evaluate_baseline, evaluate_graph};
use crate::graph::Graph;
use crate::metrics::{Metric, TaskVocab};
use crate::model::EapModel;
use crate::task::model_short_name;

/// Configuration for a pareto sweep
#[derive(Debug, Clone)]
pub struct SweepConfig {
    /// Task name (selects the dataset directory and label rules)
    pub task: String,
    /// Task metric name (`logit_diff`, `prob_diff`, ...)
    pub metric: String,
    pub batch_size: usize,
    /// Keep only the first N examples
    pub head: usize,
    /// Edge-count schedule `start..end` by `step`
    pub start: usize,
    pub end: usize,
    pub step: usize,
    /// Integrated-gradients interpolation steps
    pub ig_steps: usize,
    /// Root of the `{task}/{family}.csv` datasets
    pub data_dir: PathBuf,
    /// Explicit dataset file inside `{data_dir}/{task}/`
    pub filename: Option<String>,
    pub graphs_dir: PathBuf,
    pub results_dir: PathBuf,
    /// Shuffle the dataset with this seed before taking the head
    pub seed: Option<u64>,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            task: "ioi".to_string(),
            metric: "logit_diff".to_string(),
            batch_size: 20,
            head: 3000,
            start: 500,
            end: 10000,
            step: 500,
            ig_steps: 5,
            data_dir: PathBuf::from("data"),
            filename: None,
            graphs_dir: PathBuf::from("graphs"),
            results_dir: PathBuf::from("results"),
            seed: None,
        }
    }
}

impl SweepConfig {
    /// Target edge counts
    pub fn schedule(&self) -> Result<Vec<usize>> {
        if self.step == 0 {
            return Err(EapError::Config("sweep step must be positive".to_string()));
        }
        Ok((self.start..self.end).step_by(self.step).collect())
    }
}

/// One attribution setup of the sweep
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Variant {
    /// Label used in step snapshots and CSV columns
    pub label: &'static str,
    /// Suffix of the scored graph's file name
    pub graph_suffix: &'static str,
    pub method: AttributionMethod,
    /// Attribute against KL divergence instead of the task metric
    pub kl: bool,
}

/// EAP, EAP-IG and EAP-IG-KL, in that order
pub fn variants(ig_steps: usize) -> [Variant; 3] {
    let ig = AttributionMethod::IntegratedGradients { steps: ig_steps };
    [
        Variant {
            label: "EAP",
            graph_suffix: "vanilla",
            method: AttributionMethod::Vanilla,
            kl: false,
        },
        Variant {
            label: "EAP-IG",
            graph_suffix: "task",
            method: ig,
            kl: false,
        },
        Variant {
            label: "EAP-IG-KL",
            graph_suffix: "kl",
            method: ig,
            kl: true,
        },
    ]
}

/// Progress record rewritten after every schedule step
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SweepProgress {
    pub steps: Vec<usize>,
    /// `n_edges[step][variant]`
    pub n_edges: Vec<Vec<usize>>,
    /// `results[step][variant]`, mean task metric
    pub results: Vec<Vec<f32>>,
}

/// Outcome of a sweep
#[derive(Debug, Clone)]
pub struct SweepResults {
    pub baseline: f32,
    pub corrupted_baseline: f32,
    pub labels: Vec<String>,
    pub progress: SweepProgress,
}

impl SweepResults {
    /// Write the summary table: `baseline, corrupted_baseline, edges`, then
    /// `edges_{label}, loss_{label}` for every variant
    pub fn write_csv(&self, path: impl AsRef<Path>) -> Result<()> {
        let mut writer = csv::Writer::from_path(path)?;
        let mut header = vec![
            "baseline".to_string(),
            "corrupted_baseline".to_string(),
            "edges".to_string(),
        ];
        for label in &self.labels {
            header.push(format!("edges_{label}"));
            header.push(format!("loss_{label}"));
        }
        writer.write_record(&header)?;

        let p = &self.progress;
        for (row, &step) in p.steps.iter().enumerate() {
            let mut record = vec![
                self.baseline.to_string(),
                self.corrupted_baseline.to_string(),
                step.to_string(),
            ];
            for col in 0..self.labels.len() {
                let n = p.n_edges.get(row).and_then(|r| r.get(col));
                let r = p.results.get(row).and_then(|r| r.get(col));
                record.push(n.map(ToString::to_string).unwrap_or_default());
                record.push(r.map(ToString::to_string).unwrap_or_default());
            }
            writer.write_record(&record)?;
        }
        writer.flush()?;
        Ok(())
    }
}

fn mean(values: &[f32]) -> f32 {
    if values.is_empty() {
        return f32::NAN;
    }
    values.iter().sum::<f32>() / values.len() as f32
}

/// Sweep runner
pub struct Sweep {
    config: SweepConfig,
    model: EapModel,
}

impl Sweep {
    pub fn new(model: EapModel, config: SweepConfig) -> Self {
        Self { config, model }
    }

    pub fn config(&self) -> &SweepConfig {
        &self.config
    }

    fn graphs_dir(&self) -> PathBuf {
        self.config
            .graphs_dir
            .join(model_short_name(self.model.model_id()))
    }

    fn pareto_dir(&self) -> PathBuf {
        self.config
            .results_dir
            .join("pareto")
            .join(model_short_name(self.model.model_id()))
    }

    /// Load the dataset, shuffled and truncated as configured
    pub fn load_batches(&self) -> Result<(EapDataset, Vec<Batch>)> {
        let cfg = &self.config;
        let mut ds = EapDataset::load(
            &cfg.task,
            self.model.model_id(),
            &cfg.data_dir,
            cfg.filename.as_deref(),
        )?;
        if let Some(seed) = cfg.seed {
            ds.shuffle(seed);
        }
        ds.head(cfg.head);
        if ds.is_empty() {
            return Err(EapError::Config(format!("dataset for {} is empty", cfg.task)));
        }
        let batches = ds.to_batches(cfg.batch_size)?;
        Ok((ds, batches))
    }

    /// Run the full sweep and write every output file
    pub fn run(&self) -> Result<SweepResults> {
        let cfg = &self.config;
        info!("Starting pareto sweep");
        info!("Config: {:?}", cfg);
        let steps = cfg.schedule()?;

        let (ds, batches) = self.load_batches()?;
        info!("Loaded {} examples in {} batches", ds.len(), batches.len());

        let vocab = TaskVocab::build(ds.task(), self.model.encoder(), &cfg.data_dir)?;
        let task_metric = Metric::from_name(&cfg.metric, ds.task(), vocab.clone())?;
        let kl = Metric::from_name("kl_divergence", ds.task(), vocab)?;

        let baseline = mean(&evaluate_baseline(&self.model, &batches, &task_metric, false)?);
        let corrupted_baseline =
            mean(&evaluate_baseline(&self.model, &batches, &task_metric, true)?);
        info!("Baseline: {}", baseline);
        info!("Corrupted baseline: {}", corrupted_baseline);

        let graphs_dir = self.graphs_dir();
        fs::create_dir_all(&graphs_dir)?;
        let variants = variants(cfg.ig_steps);
        let mut graphs = Vec::with_capacity(variants.len());
        for variant in &variants {
            info!("Scoring graph for {}", variant.label);
            let mut graph = Graph::from_config(self.model.graph_config());
            let metric = if variant.kl { &kl } else { &task_metric };
            attribute(&self.model, &mut graph, &batches, metric, variant.method)?;
            let path = graphs_dir.join(format!("{}_{}.json", cfg.task, variant.graph_suffix));
            graph.to_json(&path)?;
            info!("Graph saved to {}", path.display());
            graphs.push(graph);
        }

        let pareto_dir = self.pareto_dir();
        fs::create_dir_all(&pareto_dir)?;
        let temp_path = pareto_dir.join(format!("temp_{}.json", cfg.task));

        info!("Sweeping {} edge counts", steps.len());
        let mut progress = SweepProgress {
            steps: steps.clone(),
            ..Default::default()
        };
        let pb = progress_bar(graphs.len() * steps.len(), "sweep");
        for &target in &steps {
            let mut n_edge = Vec::with_capacity(graphs.len());
            let mut result = Vec::with_capacity(graphs.len());
            for (graph, variant) in graphs.iter_mut().zip(&variants) {
                graph.apply_greedy(target, true);
                graph.prune_dead_nodes(true, true);
                let n = graph.count_included_edges();
                graph.to_json(graphs_dir.join(format!(
                    "{}_{}_step{}_{}edges.json",
                    cfg.task, variant.label, target, n
                )))?;

                let r = mean(&evaluate_graph(&self.model, graph, &batches, &task_metric)?);
                n_edge.push(n);
                result.push(r);
                pb.inc(1);
            }
            progress.n_edges.push(n_edge);
            progress.results.push(result);
            fs::write(&temp_path, serde_json::to_string(&progress)?)?;
        }
        pb.finish_and_clear();
        info!(
            "Run complete, n_edges: {:?}, results: {:?}",
            progress.n_edges, progress.results
        );

        let results = SweepResults {
            baseline,
            corrupted_baseline,
            labels: variants.iter().map(|v| v.label.to_string()).collect(),
            progress,
        };
        let csv_dir = pareto_dir.join("csv");
        fs::create_dir_all(&csv_dir)?;
        let csv_path = csv_dir.join(format!("{}.csv", cfg.task));
        results.write_csv(&csv_path)?;
        info!("Results saved to {}", csv_path.display());
        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_schedule() {
        let cfg = SweepConfig::default();
        let steps = cfg.schedule().unwrap();
        assert_eq!(steps.len(), 19);
        assert_eq!(steps.first(), Some(&500));
        assert_eq!(steps.last(), Some(&9500));

        let empty = SweepConfig {
            start: 100,
            end: 100,
            ..Default::default()
        };
        assert!(empty.schedule().unwrap().is_empty());

        let bad = SweepConfig {
            step: 0,
            ..Default::default()
        };
        assert!(bad.schedule().is_err());
    }

    #[test]
    fn test_variants() {
        let v = variants(5);
        let labels: Vec<&str> = v.iter().map(|v| v.label).collect();
        assert_eq!(labels, vec!["EAP", "EAP-IG", "EAP-IG-KL"]);
        assert_eq!(v[0].method, AttributionMethod::Vanilla);
        assert_eq!(v[2].method, AttributionMethod::IntegratedGradients { steps: 5 });
        assert!(v[2].kl && !v[1].kl);
    }

    #[test]
    fn test_write_csv() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ioi.csv");
        let results = SweepResults {
            baseline: 2.5,
            corrupted_baseline: -1.0,
            labels: vec!["EAP".to_string(), "EAP-IG".to_string()],
            progress: SweepProgress {
                steps: vec![10, 20],
                n_edges: vec![vec![9, 10], vec![18, 20]],
                results: vec![vec![0.5, 0.75], vec![1.5, 2.0]],
            },
        };
        results.write_csv(&path).unwrap();

        let text = fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(
            lines[0],
            "baseline,corrupted_baseline,edges,edges_EAP,loss_EAP,edges_EAP-IG,loss_EAP-IG"
        );
        assert_eq!(lines[1], "2.5,-1,10,9,0.5,10,0.75");
        assert_eq!(lines[2], "2.5,-1,20,18,1.5,20,2");
        assert_eq!(lines.len(), 3);
    }

    #[test]
    fn test_progress_json_shape() {
        let progress = SweepProgress {
            steps: vec![500],
            n_edges: vec![vec![480, 500, 470]],
            results: vec![vec![1.0, 2.0, 3.0]],
        };
        let value = serde_json::to_value(&progress).unwrap();
        assert_eq!(value["steps"], serde_json::json!([500]));
        assert_eq!(value["n_edges"][0][1], 500);
        assert_eq!(value["results"][0][2], 3.0);
    }
}
