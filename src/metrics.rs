//! Task metrics over final-position logits
//!
//! Every metric reads the logits at the last real token of each example
//! (`input_length - 1`) and returns one value per example, or their mean.

use std::fmt;
use std::path::Path;

use candle_core::{Tensor, D};
use tracing::{info, warn};

use crate::dataset::LabelBatch;
use crate::error::{EapError, Result};
use crate::forward_gpt2::{log_softmax_last_dim, softmax_last_dim};
use crate::model::PromptEncoder;
use crate::task::Task;

/// Metric families
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricKind {
    /// Logit of the correct answer minus logit of the incorrect one
    LogitDiff,
    /// Same on probabilities
    ProbDiff,
    /// KL divergence from the reference (clean) distribution
    KlDivergence,
    /// Jensen-Shannon divergence to the reference distribution
    JsDivergence,
}

impl MetricKind {
    pub fn from_name(name: &str) -> Result<Self> {
        match name {
            "logit_diff" => Ok(MetricKind::LogitDiff),
            "prob_diff" => Ok(MetricKind::ProbDiff),
            "kl_divergence" | "kl" => Ok(MetricKind::KlDivergence),
            "js_divergence" | "js" => Ok(MetricKind::JsDivergence),
            other => Err(EapError::UnknownMetric(other.to_string())),
        }
    }

    pub fn is_divergence(&self) -> bool {
        matches!(self, MetricKind::KlDivergence | MetricKind::JsDivergence)
    }
}

impl fmt::Display for MetricKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MetricKind::LogitDiff => "logit_diff",
            MetricKind::ProbDiff => "prob_diff",
            MetricKind::KlDivergence => "kl_divergence",
            MetricKind::JsDivergence => "js_divergence",
        };
        f.write_str(name)
    }
}

/// Reduction and sign of a metric evaluation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetricOptions {
    /// Average over the batch (returns a scalar)
    pub mean: bool,
    /// Negate difference metrics so that lower is better
    pub loss: bool,
}

impl MetricOptions {
    /// Options used when attributing: batch mean, as a loss
    pub const ATTRIBUTION: Self = Self {
        mean: true,
        loss: true,
    };
    /// Options used when evaluating: per-example raw values
    pub const EVALUATION: Self = Self {
        mean: false,
        loss: false,
    };
}

/// Task-specific token sets some metrics need
#[derive(Debug, Clone, Default)]
pub struct TaskVocab {
    /// Token of every two-digit year `00`..`99`, in order
    pub years: Vec<u32>,
    /// Singular verb forms (sva)
    pub singular: Vec<u32>,
    /// Plural verb forms (sva), parallel to `singular`
    pub plural: Vec<u32>,
}

impl TaskVocab {
    /// Collect the token sets `task` needs.
    ///
    /// Greater-than uses the year tokens; sva reads its verb pairs from
    /// `{data_dir}/sva/verbs.csv` (columns `sing`, `plur`).
    pub fn build(task: Task, encoder: &dyn PromptEncoder, data_dir: &Path) -> Result<Self> {
        let mut vocab = Self::default();
        match task {
            Task::GreaterThan => vocab.years = Self::year_tokens(encoder)?,
            Task::Sva => {
                let path = data_dir.join("sva").join("verbs.csv");
                info!("Loading verb pairs from {}", path.display());
                let reader = csv::Reader::from_path(&path)?;
                let (singular, plural) = Self::verb_tokens(encoder, reader)?;
                vocab.singular = singular;
                vocab.plural = plural;
            }
            _ => {}
        }
        Ok(vocab)
    }

    /// First token of every two-digit year string
    pub fn year_tokens(encoder: &dyn PromptEncoder) -> Result<Vec<u32>> {
        (0..100)
            .map(|year| {
                let text = format!("{year:02}");
                encoder
                    .encode(&text)?
                    .first()
                    .copied()
                    .ok_or_else(|| EapError::Tokenizer(format!("'{text}' encodes to no tokens")))
            })
            .collect()
    }

    /// Singular/plural verb tokens from a `sing,plur` CSV.
    ///
    /// Verbs are encoded with a leading space. Pairs where either form is
    /// more than one token are skipped.
    pub fn verb_tokens<R: std::io::Read>(
        encoder: &dyn PromptEncoder,
        mut reader: csv::Reader<R>,
    ) -> Result<(Vec<u32>, Vec<u32>)> {
        let headers = reader.headers()?.clone();
        let column = |name: &str| {
            headers
                .iter()
                .position(|h| h == name)
                .ok_or_else(|| EapError::Config(format!("verb list has no '{name}' column")))
        };
        let (sing_col, plur_col) = (column("sing")?, column("plur")?);

        let mut singular = Vec::new();
        let mut plural = Vec::new();
        let mut skipped = 0usize;
        for record in reader.records() {
            let record = record?;
            let (Some(sing), Some(plur)) = (record.get(sing_col), record.get(plur_col)) else {
                skipped += 1;
                continue;
            };
            let sing = encoder.encode(&format!(" {sing}"))?;
            let plur = encoder.encode(&format!(" {plur}"))?;
            match (sing.as_slice(), plur.as_slice()) {
                ([s], [p]) => {
                    singular.push(*s);
                    plural.push(*p);
                }
                _ => skipped += 1,
            }
        }
        if skipped > 0 {
            warn!("Skipped {} verb pairs that are not single tokens", skipped);
        }
        if singular.is_empty() {
            return Err(EapError::Config(
                "no single-token verb pairs in verb list".to_string(),
            ));
        }
        Ok((singular, plural))
    }
}

/// A metric bound to a task
#[derive(Debug, Clone)]
pub struct Metric {
    kind: MetricKind,
    task: Task,
    vocab: TaskVocab,
}

impl Metric {
    /// Resolve a metric name for `task`. Fails when the task needs token
    /// sets that `vocab` does not provide.
    pub fn from_name(name: &str, task: Task, vocab: TaskVocab) -> Result<Self> {
        let kind = MetricKind::from_name(name)?;
        if !kind.is_divergence() {
            match task {
                Task::GreaterThan if vocab.years.len() != 100 => {
                    return Err(EapError::Config(format!(
                        "greater-than needs 100 year tokens, got {}",
                        vocab.years.len()
                    )));
                }
                Task::Sva if vocab.singular.is_empty() => {
                    return Err(EapError::Config(
                        "sva needs singular and plural verb tokens".to_string(),
                    ));
                }
                _ => {}
            }
        }
        Ok(Self { kind, task, vocab })
    }

    pub fn kind(&self) -> MetricKind {
        self.kind
    }

    /// Evaluate on `(batch, seq, vocab)` logits.
    ///
    /// `reference_logits` are the clean-run logits; only divergences read
    /// them. Returns shape `(batch,)`, or a scalar when `opts.mean`.
    pub fn compute(
        &self,
        logits: &Tensor,
        reference_logits: &Tensor,
        input_lengths: &[usize],
        labels: &LabelBatch,
        opts: MetricOptions,
    ) -> Result<Tensor> {
        let last = final_logits(logits, input_lengths)?;
        let results = match self.kind {
            MetricKind::KlDivergence => {
                let reference = final_logits(reference_logits, input_lengths)?;
                kl_divergence(&last, &reference)?
            }
            MetricKind::JsDivergence => {
                let reference = final_logits(reference_logits, input_lengths)?;
                js_divergence(&last, &reference)?
            }
            MetricKind::LogitDiff | MetricKind::ProbDiff => {
                let diff = self.difference(&last, labels)?;
                if opts.loss {
                    diff.neg()?
                } else {
                    diff
                }
            }
        };
        if opts.mean {
            Ok(results.mean(0)?)
        } else {
            Ok(results)
        }
    }

    /// Task-specific difference on `(batch, vocab)` final logits
    fn difference(&self, last: &Tensor, labels: &LabelBatch) -> Result<Tensor> {
        let (batch, vocab) = last.dims2()?;
        if labels.len() != batch {
            return Err(EapError::Config(format!(
                "{} labels for a batch of {batch}",
                labels.len()
            )));
        }
        let use_probs = self.kind == MetricKind::ProbDiff;
        let probs = || softmax_last_dim(last);

        match (self.task, labels) {
            (Task::GreaterThan, LabelBatch::Scalars(years)) => {
                let mut weights = vec![0f32; batch * vocab];
                for (i, &year) in years.iter().enumerate() {
                    if !(0..100).contains(&year) {
                        return Err(EapError::Label {
                            row: i,
                            reason: format!("year {year} outside 0..=99"),
                        });
                    }
                    let row = &mut weights[i * vocab..(i + 1) * vocab];
                    for (y, &tok) in self.vocab.years.iter().enumerate() {
                        bump(row, tok, if y as i64 > year { 1.0 } else { -1.0 })?;
                    }
                }
                weighted_sum(&probs()?, weights)
            }
            (Task::Hypernymy, LabelBatch::Sets(sets)) => {
                let mut weights = vec![0f32; batch * vocab];
                for (i, (answers, corrupted)) in sets.iter().enumerate() {
                    let row = &mut weights[i * vocab..(i + 1) * vocab];
                    for &tok in answers {
                        bump(row, tok, 1.0)?;
                    }
                    for &tok in corrupted {
                        bump(row, tok, -1.0)?;
                    }
                }
                weighted_sum(&probs()?, weights)
            }
            (Task::Sva, LabelBatch::Scalars(plurality)) => {
                // probabilities are summed over each verb set, logits averaged
                let (sing_w, plur_w) = if use_probs {
                    (1.0, 1.0)
                } else {
                    (
                        1.0 / self.vocab.singular.len() as f32,
                        1.0 / self.vocab.plural.len() as f32,
                    )
                };
                let mut plural_minus_singular = vec![0f32; vocab];
                for &tok in &self.vocab.plural {
                    bump(&mut plural_minus_singular, tok, plur_w)?;
                }
                for &tok in &self.vocab.singular {
                    bump(&mut plural_minus_singular, tok, -sing_w)?;
                }
                let mut weights = Vec::with_capacity(batch * vocab);
                for &label in plurality {
                    let sign = if label == 0 { -1.0 } else { 1.0 };
                    weights.extend(plural_minus_singular.iter().map(|w| sign * w));
                }
                let scores = if use_probs { probs()? } else { last.clone() };
                weighted_sum(&scores, weights)
            }
            (_, LabelBatch::Pairs(pairs)) => {
                let scores = if use_probs { probs()? } else { last.clone() };
                let flat: Vec<u32> = pairs.iter().flat_map(|p| p.iter().copied()).collect();
                if let Some(&tok) = flat.iter().find(|&&t| t as usize >= vocab) {
                    return Err(EapError::Config(format!(
                        "label token {tok} outside vocabulary of {vocab}"
                    )));
                }
                let index = Tensor::from_vec(flat, (batch, 2), last.device())?;
                let good_bad = scores.gather(&index, 1)?;
                Ok(good_bad
                    .narrow(1, 0, 1)?
                    .sub(&good_bad.narrow(1, 1, 1)?)?
                    .squeeze(1)?)
            }
            (task, _) => Err(EapError::Config(format!(
                "{} is not defined for {task:?} labels",
                self.kind
            ))),
        }
    }
}

/// Logits at position `input_length - 1` of every example, `(batch, vocab)`
pub fn final_logits(logits: &Tensor, input_lengths: &[usize]) -> Result<Tensor> {
    let (batch, seq, vocab) = logits.dims3()?;
    if input_lengths.len() != batch {
        return Err(EapError::Config(format!(
            "{} input lengths for a batch of {batch}",
            input_lengths.len()
        )));
    }
    let mut rows = Vec::with_capacity(batch);
    for (i, &len) in input_lengths.iter().enumerate() {
        if len == 0 || len > seq {
            return Err(EapError::Config(format!(
                "input length {len} outside 1..={seq}"
            )));
        }
        rows.push((i * seq + len - 1) as u32);
    }
    let index = Tensor::from_vec(rows, batch, logits.device())?;
    Ok(logits.reshape((batch * seq, vocab))?.index_select(&index, 0)?)
}

fn bump(row: &mut [f32], token: u32, weight: f32) -> Result<()> {
    let vocab = row.len();
    let slot = row.get_mut(token as usize).ok_or_else(|| {
        EapError::Config(format!("label token {token} outside vocabulary of {vocab}"))
    })?;
    *slot += weight;
    Ok(())
}

/// `sum_v scores[b, v] * weights[b, v]`
fn weighted_sum(scores: &Tensor, weights: Vec<f32>) -> Result<Tensor> {
    let weights = Tensor::from_vec(weights, scores.dims2()?, scores.device())?
        .to_dtype(scores.dtype())?;
    Ok(scores.mul(&weights)?.sum(D::Minus1)?)
}

/// `mean_v p_ref · (log p_ref - log p)` per example
fn kl_divergence(logits: &Tensor, reference: &Tensor) -> Result<Tensor> {
    let log_p = log_softmax_last_dim(logits)?;
    let log_ref = log_softmax_last_dim(reference)?;
    let p_ref = log_ref.exp()?;
    Ok(p_ref.mul(&log_ref.sub(&log_p)?)?.mean(D::Minus1)?)
}

/// Jensen-Shannon divergence per example, vocab-averaged like [`kl_divergence`]
fn js_divergence(logits: &Tensor, reference: &Tensor) -> Result<Tensor> {
    let log_p = log_softmax_last_dim(logits)?;
    let log_q = log_softmax_last_dim(reference)?;
    let p = log_p.exp()?;
    let q = log_q.exp()?;
    let log_m = ((&p + &q)? * 0.5)?
        .clamp(f32::MIN_POSITIVE, 1.0f32)?
        .log()?;
    let kl_pm = p.mul(&log_p.sub(&log_m)?)?.mean(D::Minus1)?;
    let kl_qm = q.mul(&log_q.sub(&log_m)?)?.mean(D::Minus1)?;
    Ok(((kl_pm + kl_qm)? * 0.5)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    struct DigitEncoder;

    impl PromptEncoder for DigitEncoder {
        fn encode(&self, text: &str) -> Result<Vec<u32>> {
            let trimmed = text.trim_start();
            match trimmed {
                "is" => Ok(vec![100]),
                "are" => Ok(vec![101]),
                "was" => Ok(vec![102]),
                "were" => Ok(vec![103]),
                _ => match trimmed.parse::<u32>() {
                    Ok(n) => Ok(vec![n]),
                    Err(_) => Ok(trimmed.bytes().map(u32::from).collect()),
                },
            }
        }

        fn bos_token_id(&self) -> u32 {
            0
        }

        fn pad_token_id(&self) -> u32 {
            0
        }
    }

    fn logits(rows: &[Vec<f32>]) -> Tensor {
        let vocab = rows[0].len();
        let flat: Vec<f32> = rows.iter().flatten().copied().collect();
        Tensor::from_vec(flat, (rows.len(), 1, vocab), &Device::Cpu).unwrap()
    }

    fn values(t: &Tensor) -> Vec<f32> {
        t.to_vec1().unwrap()
    }

    #[test]
    fn test_metric_names() {
        assert_eq!(MetricKind::from_name("kl").unwrap(), MetricKind::KlDivergence);
        assert_eq!(MetricKind::from_name("js_divergence").unwrap(), MetricKind::JsDivergence);
        assert!(matches!(
            MetricKind::from_name("accuracy"),
            Err(EapError::UnknownMetric(_))
        ));
    }

    #[test]
    fn test_final_logits_reads_last_real_token() {
        let device = Device::Cpu;
        let data: Vec<f32> = (0..2 * 3 * 2).map(|x| x as f32).collect();
        let logits = Tensor::from_vec(data, (2, 3, 2), &device).unwrap();
        let last = final_logits(&logits, &[2, 3]).unwrap();
        let rows: Vec<Vec<f32>> = last.to_vec2().unwrap();
        assert_eq!(rows, vec![vec![2.0, 3.0], vec![10.0, 11.0]]);
        assert!(final_logits(&logits, &[0, 3]).is_err());
        assert!(final_logits(&logits, &[4, 3]).is_err());
    }

    #[test]
    fn test_logit_diff_pairs() {
        let metric = Metric::from_name("logit_diff", Task::Ioi, TaskVocab::default()).unwrap();
        let l = logits(&[vec![1.0, 4.0, 2.0], vec![3.0, 0.0, 1.0]]);
        let labels = LabelBatch::Pairs(vec![[1, 2], [2, 0]]);
        let raw = metric
            .compute(&l, &l, &[1, 1], &labels, MetricOptions::EVALUATION)
            .unwrap();
        assert_eq!(values(&raw), vec![2.0, -2.0]);

        let loss = metric
            .compute(&l, &l, &[1, 1], &labels, MetricOptions::ATTRIBUTION)
            .unwrap();
        assert_eq!(loss.to_scalar::<f32>().unwrap(), 0.0);

        let opts = MetricOptions {
            mean: false,
            loss: true,
        };
        let neg = metric.compute(&l, &l, &[1, 1], &labels, opts).unwrap();
        assert_eq!(values(&neg), vec![-2.0, 2.0]);
    }

    #[test]
    fn test_prob_diff_pairs() {
        let metric = Metric::from_name("prob_diff", Task::Ioi, TaskVocab::default()).unwrap();
        let l = logits(&[vec![0.0, 0.0, 0.0, 0.0]]);
        let labels = LabelBatch::Pairs(vec![[0, 1]]);
        let r = metric
            .compute(&l, &l, &[1], &labels, MetricOptions::EVALUATION)
            .unwrap();
        assert!(values(&r)[0].abs() < 1e-6);
    }

    #[test]
    fn test_greater_than_prob_mass() {
        let vocab = TaskVocab {
            years: TaskVocab::year_tokens(&DigitEncoder).unwrap(),
            ..Default::default()
        };
        assert_eq!(vocab.years[7], 7);
        let metric = Metric::from_name("prob_diff", Task::GreaterThan, vocab).unwrap();

        // uniform over 100 year tokens: years above 49 hold half the mass
        let l = logits(&[vec![0.0; 100]]);
        let r = metric
            .compute(&l, &l, &[1], &LabelBatch::Scalars(vec![49]), MetricOptions::EVALUATION)
            .unwrap();
        assert!(values(&r)[0].abs() < 1e-5);

        let r = metric
            .compute(&l, &l, &[1], &LabelBatch::Scalars(vec![98]), MetricOptions::EVALUATION)
            .unwrap();
        assert!((values(&r)[0] + 0.98).abs() < 1e-5);

        assert!(metric
            .compute(&l, &l, &[1], &LabelBatch::Scalars(vec![100]), MetricOptions::EVALUATION)
            .is_err());
    }

    #[test]
    fn test_greater_than_requires_years() {
        assert!(matches!(
            Metric::from_name("logit_diff", Task::GreaterThan, TaskVocab::default()),
            Err(EapError::Config(_))
        ));
        // divergences need no token sets
        assert!(Metric::from_name("kl", Task::GreaterThan, TaskVocab::default()).is_ok());
    }

    #[test]
    fn test_hypernymy_sets() {
        let metric =
            Metric::from_name("logit_diff", Task::Hypernymy, TaskVocab::default()).unwrap();
        let l = logits(&[vec![0.0; 4]]);
        let labels = LabelBatch::Sets(vec![(vec![0, 1, 2], vec![3])]);
        let r = metric
            .compute(&l, &l, &[1], &labels, MetricOptions::EVALUATION)
            .unwrap();
        assert!((values(&r)[0] - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_sva_direction() {
        let csv = "sing,plur\nis,are\nwas,were\nruns,run\n";
        let (singular, plural) =
            TaskVocab::verb_tokens(&DigitEncoder, csv::Reader::from_reader(csv.as_bytes()))
                .unwrap();
        assert_eq!(singular, vec![100, 102]);
        assert_eq!(plural, vec![101, 103]);

        let vocab = TaskVocab {
            singular,
            plural,
            ..Default::default()
        };
        let metric = Metric::from_name("logit_diff", Task::Sva, vocab).unwrap();
        let mut row = vec![0.0f32; 104];
        row[101] = 2.0;
        row[103] = 4.0;
        row[100] = 1.0;
        let l = logits(&[row.clone(), row]);
        let r = metric
            .compute(&l, &l, &[1, 1], &LabelBatch::Scalars(vec![1, 0]), MetricOptions::EVALUATION)
            .unwrap();
        // mean plural logit 3.0, mean singular logit 0.5
        let v = values(&r);
        assert!((v[0] - 2.5).abs() < 1e-5);
        assert!((v[1] + 2.5).abs() < 1e-5);
    }

    #[test]
    fn test_divergences() {
        let kl = Metric::from_name("kl_divergence", Task::Ioi, TaskVocab::default()).unwrap();
        let js = Metric::from_name("js", Task::Ioi, TaskVocab::default()).unwrap();
        let clean = logits(&[vec![2.0, 0.5, -1.0]]);
        let other = logits(&[vec![-1.0, 0.0, 3.0]]);
        let labels = LabelBatch::Pairs(vec![[0, 1]]);
        let opts = MetricOptions::EVALUATION;

        let same = kl.compute(&clean, &clean, &[1], &labels, opts).unwrap();
        assert!(values(&same)[0].abs() < 1e-6);
        let diff = kl.compute(&other, &clean, &[1], &labels, opts).unwrap();
        assert!(values(&diff)[0] > 0.0);

        let a = js.compute(&other, &clean, &[1], &labels, opts).unwrap();
        let b = js.compute(&clean, &other, &[1], &labels, opts).unwrap();
        assert!(values(&a)[0] > 0.0);
        assert!((values(&a)[0] - values(&b)[0]).abs() < 1e-6);

        // loss flag leaves divergences unchanged
        let as_loss = kl
            .compute(
                &other,
                &clean,
                &[1],
                &labels,
                MetricOptions {
                    mean: false,
                    loss: true,
                },
            )
            .unwrap();
        assert_eq!(values(&as_loss), values(&diff));
    }

    #[test]
    fn test_label_kind_mismatch() {
        let metric = Metric::from_name("logit_diff", Task::Ioi, TaskVocab::default()).unwrap();
        let l = logits(&[vec![0.0; 3]]);
        assert!(metric
            .compute(&l, &l, &[1], &LabelBatch::Scalars(vec![0]), MetricOptions::EVALUATION)
            .is_err());
    }
}
