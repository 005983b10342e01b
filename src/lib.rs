// Pedantic clippy configuration for ML/math codebase
// These are acceptable in numerical/ML code:
#![allow(clippy::cast_precision_loss)] // usize→f64/f32 intentional in ML
#![allow(clippy::cast_possible_truncation)] // usize→u32 in tensor indexing
#![allow(clippy::cast_possible_wrap)] // usize→i64 in tensor ops
#![allow(clippy::many_single_char_names)] // b, p, d, h standard in tensor code
#![allow(clippy::similar_names)] // related variables like `head`/`heads`
#![allow(clippy::module_name_repetitions)] // EapModel in model.rs is fine
// Documentation pedantic - acceptable for research code:
#![allow(clippy::doc_markdown)] // backticks for every technical term is excessive
#![allow(clippy::missing_errors_doc)] // # Errors section for every Result fn
#![allow(clippy::missing_panics_doc)] // # Panics section for every panic
// Method style pedantic:
#![allow(clippy::must_use_candidate)] // #[must_use] on every pure fn is excessive
#![allow(clippy::return_self_not_must_use)] // #[must_use] on Self returns
#![allow(clippy::trivially_copy_pass_by_ref)] // &self on Copy enums for API consistency
#![allow(clippy::needless_pass_by_value)] // value params for API flexibility
#![allow(clippy::cast_sign_loss)] // f64→usize when value is known positive

//! eap-rs: Edge Attribution Patching
//!
//! Finds the circuits a transformer uses for a task by scoring every edge
//! between its components, then measures how much of the task behaviour
//! survives as the circuit shrinks.
//!
//! ## Architecture
//!
//! - `task`: Task names, label-extraction rules and model families
//! - `dataset`: Paired clean/corrupted CSV datasets and batching
//! - `graph`: Attribution graph (nodes, edges, scores, greedy selection, JSON)
//! - `forward_gpt2`: GPT-2 forward pass with per-node inputs and outputs
//! - `cache`: Writer activations and reader-input gradient probes
//! - `model`: EapModel wrapper (hub loading, device, prompt encoding)
//! - `metrics`: Logit/probability differences and divergences
//! - `attribute`: EAP and EAP-IG edge scoring
//! - `evaluate`: Baseline and patched-circuit evaluation
//! - `sweep`: Pareto sweep over circuit sizes

pub mod attribute;
pub mod cache;
pub mod dataset;
pub mod error;
pub mod evaluate;
pub mod forward_gpt2;
pub mod graph;
pub mod metrics;
pub mod model;
pub mod sweep;
pub mod task;

pub use attribute::{attribute, AttributionMethod};
pub use cache::{InputProbes, NodeActivations};
pub use dataset::{Batch, EapDataset, Example, LabelBatch};
pub use error::{EapError, Result};
pub use evaluate::{evaluate_baseline, evaluate_graph};
pub use forward_gpt2::{ForwardOptions, ForwardOutput, Gpt2Config, HookedGpt2, Patch};
pub use graph::{Edge, Graph, GraphConfig, GraphJson, Node, Qkv};
pub use metrics::{Metric, MetricKind, MetricOptions, TaskVocab};
pub use model::{EapModel, HfEncoder, PromptEncoder, TokenizedPair};
pub use sweep::{variants, Sweep, SweepConfig, SweepProgress, SweepResults, Variant};
pub use task::{model_family, model_short_name, Label, LabelKind, Task};
