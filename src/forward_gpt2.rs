//! GPT-2 forward pass with every graph node exposed
//!
//! Unlike a standard forward pass, attention heads are run with their own
//! query, key and value inputs and their outputs are kept separate, so each
//! edge of the attribution graph has a distinct input slot:
//!
//! - every attention head writes `z_h · W_O[h]` to the residual stream
//!   (the shared output bias is added once and is not a node);
//! - every reader input is `resid + patch_delta + probe`, where the patch
//!   delta swaps excluded edges for their corrupted activations and the
//!   probe is a zero variable used to read gradients.
//!
//! Weights follow the HuggingFace `gpt2` checkpoint layout (`Conv1D`
//! weights stored as `[in, out]`).

use std::collections::HashMap;

use candle_core::{DType, Device, IndexOp, Tensor, D};
use candle_nn::VarBuilder;
use rand::{Rng, SeedableRng};
use tracing::info;

use crate::cache::{InputProbes, NodeActivations};
use crate::error::{EapError, Result};
use crate::graph::GraphConfig;

/// Model configuration (matches HuggingFace config.json for GPT-2)
#[derive(Debug, Clone, serde::Deserialize, serde::Serialize)]
pub struct Gpt2Config {
    pub vocab_size: usize,
    pub n_positions: usize,
    pub n_embd: usize,
    pub n_layer: usize,
    pub n_head: usize,
    #[serde(default)]
    pub n_inner: Option<usize>,
    #[serde(default = "default_layer_norm_epsilon")]
    pub layer_norm_epsilon: f64,
    #[serde(default)]
    pub model_type: Option<String>,
}

fn default_layer_norm_epsilon() -> f64 {
    1e-5
}

impl Gpt2Config {
    /// MLP hidden width (`4 * n_embd` unless overridden)
    pub fn inner_dim(&self) -> usize {
        self.n_inner.unwrap_or(4 * self.n_embd)
    }

    pub fn head_dim(&self) -> usize {
        self.n_embd / self.n_head
    }

    pub fn validate(&self) -> Result<()> {
        if let Some(model_type) = &self.model_type {
            if model_type != "gpt2" {
                return Err(EapError::Config(format!(
                    "unsupported model_type '{model_type}' (only gpt2 is implemented)"
                )));
            }
        }
        if self.n_head == 0 || self.n_embd % self.n_head != 0 {
            return Err(EapError::Config(format!(
                "n_embd ({}) must be divisible by n_head ({})",
                self.n_embd, self.n_head
            )));
        }
        Ok(())
    }
}

/// Edge patching inputs for a forward pass
#[derive(Debug, Clone, Copy)]
pub struct Patch<'a> {
    /// Writer outputs of the corrupted run, `(n_forward, batch, seq, d_model)`
    pub corrupted: &'a Tensor,
    /// `(n_forward, n_backward)` matrix with 1.0 on edges to patch
    pub excluded: &'a Tensor,
}

/// Running input corrections of every reader slot.
///
/// Holds `Σ_u excluded[u, r] * (corrupted_u - current_u)` over the writers
/// seen so far, as `(n_backward, batch*seq*d_model)`. Writers are added in
/// index order, so when reader `r` is read the sum covers exactly the
/// writers that precede it.
struct PatchDeltas<'a> {
    patch: Patch<'a>,
    seen: usize,
    dims: (usize, usize, usize),
    sum: Tensor,
}

impl<'a> PatchDeltas<'a> {
    fn new(patch: Patch<'a>, batch: usize, seq_len: usize, d_model: usize) -> Result<Self> {
        let n_readers = patch.excluded.dim(1)?;
        let sum = Tensor::zeros(
            (n_readers, batch * seq_len * d_model),
            DType::F32,
            patch.excluded.device(),
        )?;
        Ok(Self {
            patch,
            seen: 0,
            dims: (batch, seq_len, d_model),
            sum,
        })
    }

    /// Fold in the next writers' outputs, `(k, batch, seq, d_model)`
    fn add_writers(&mut self, current: &Tensor) -> Result<()> {
        let (k, b, p, d) = current.dims4()?;
        let diff = self
            .patch
            .corrupted
            .narrow(0, self.seen, k)?
            .sub(current)?
            .reshape((k, b * p * d))?;
        let weights = self
            .patch
            .excluded
            .narrow(0, self.seen, k)?
            .t()?
            .contiguous()?;
        self.sum = self.sum.add(&weights.matmul(&diff)?)?;
        self.seen += k;
        Ok(())
    }

    /// Corrections of `n_readers` consecutive slots, `(n_readers, batch, seq, d_model)`
    fn delta(&self, reader_start: usize, n_readers: usize) -> Result<Tensor> {
        let (b, p, d) = self.dims;
        Ok(self
            .sum
            .narrow(0, reader_start, n_readers)?
            .reshape((n_readers, b, p, d))?)
    }
}

/// Cache a chunk of writer outputs and fold it into the running patch deltas
fn record(
    activations: &mut NodeActivations,
    deltas: Option<&mut PatchDeltas<'_>>,
    chunk: Tensor,
) -> Result<()> {
    if let Some(deltas) = deltas {
        deltas.add_writers(&chunk)?;
    }
    activations.push(chunk)
}

/// Optional modifications of a forward pass
#[derive(Default, Clone, Copy)]
pub struct ForwardOptions<'a> {
    /// Replace the input node's output (token + position embeddings)
    pub embeddings: Option<&'a Tensor>,
    /// Patch excluded edges with corrupted activations
    pub patch: Option<Patch<'a>>,
    /// Add gradient probes to every reader input
    pub probes: Option<&'a InputProbes>,
}

/// Logits plus every writer's output
#[derive(Debug)]
pub struct ForwardOutput {
    /// `(batch, seq, vocab)`
    pub logits: Tensor,
    pub activations: NodeActivations,
}

/// Layer norm built from primitive ops so gradients flow through it
fn layer_norm(x: &Tensor, weight: &Tensor, bias: &Tensor, eps: f64) -> Result<Tensor> {
    let mean = x.mean_keepdim(D::Minus1)?;
    let centered = x.broadcast_sub(&mean)?;
    let var = centered.sqr()?.mean_keepdim(D::Minus1)?;
    let normed = centered.broadcast_div(&var.affine(1.0, eps)?.sqrt()?)?;
    Ok(normed.broadcast_mul(weight)?.broadcast_add(bias)?)
}

/// Softmax over the last dimension, from primitive ops
pub(crate) fn softmax_last_dim(x: &Tensor) -> Result<Tensor> {
    let max = x.max_keepdim(D::Minus1)?;
    let exp = x.broadcast_sub(&max)?.exp()?;
    let sum = exp.sum_keepdim(D::Minus1)?;
    Ok(exp.broadcast_div(&sum)?)
}

/// Log-softmax over the last dimension, from primitive ops
pub(crate) fn log_softmax_last_dim(x: &Tensor) -> Result<Tensor> {
    let max = x.max_keepdim(D::Minus1)?;
    let shifted = x.broadcast_sub(&max)?;
    let log_sum = shifted.exp()?.sum_keepdim(D::Minus1)?.log()?;
    Ok(shifted.broadcast_sub(&log_sum)?)
}

/// `(seq, seq)` mask: 0 where attention is allowed, -inf above the diagonal
fn causal_mask(seq_len: usize, device: &Device) -> Result<Tensor> {
    let mask: Vec<f32> = (0..seq_len)
        .flat_map(|i| (0..seq_len).map(move |j| if j <= i { 0.0 } else { f32::NEG_INFINITY }))
        .collect();
    Ok(Tensor::from_vec(mask, (seq_len, seq_len), device)?)
}

/// Attention block with per-head weights
struct Attention {
    ln_weight: Tensor,
    ln_bias: Tensor,
    /// `(heads, d_model, head_dim)`
    w_q: Tensor,
    w_k: Tensor,
    w_v: Tensor,
    /// `(heads, 1, head_dim)`
    b_q: Tensor,
    b_k: Tensor,
    b_v: Tensor,
    /// `(heads, head_dim, d_model)`
    w_o: Tensor,
    /// `(d_model,)`
    b_o: Tensor,
    head_dim: usize,
    eps: f64,
}

impl Attention {
    fn load(vb: VarBuilder, config: &Gpt2Config) -> Result<Self> {
        let d = config.n_embd;
        let h = config.n_head;
        let dh = config.head_dim();

        let c_attn_w = vb.get((d, 3 * d), "attn.c_attn.weight")?;
        let c_attn_b = vb.get(3 * d, "attn.c_attn.bias")?;
        let split_w = |i: usize| -> Result<Tensor> {
            Ok(c_attn_w
                .narrow(1, i * d, d)?
                .reshape((d, h, dh))?
                .permute((1, 0, 2))?
                .contiguous()?)
        };
        let split_b = |i: usize| -> Result<Tensor> {
            Ok(c_attn_b.narrow(0, i * d, d)?.reshape((h, 1, dh))?)
        };

        Ok(Self {
            ln_weight: vb.get(d, "ln_1.weight")?,
            ln_bias: vb.get(d, "ln_1.bias")?,
            w_q: split_w(0)?,
            w_k: split_w(1)?,
            w_v: split_w(2)?,
            b_q: split_b(0)?,
            b_k: split_b(1)?,
            b_v: split_b(2)?,
            w_o: vb.get((d, d), "attn.c_proj.weight")?.reshape((h, dh, d))?,
            b_o: vb.get(d, "attn.c_proj.bias")?,
            head_dim: dh,
            eps: config.layer_norm_epsilon,
        })
    }

    /// Run every head on its own inputs.
    ///
    /// `x` has shape `(batch, seq, 3, heads, d_model)` holding the query,
    /// key and value input of every head. Returns per-head outputs of shape
    /// `(batch, heads, seq, d_model)`, without the output bias.
    fn forward(&self, x: &Tensor, mask: &Tensor) -> Result<Tensor> {
        let x = layer_norm(x, &self.ln_weight, &self.ln_bias, self.eps)?;
        let project = |slot: usize, w: &Tensor, b: &Tensor| -> Result<Tensor> {
            // (batch, seq, heads, d) -> (batch, heads, seq, d) -> (batch, heads, seq, head_dim)
            let input = x.i((.., .., slot))?.transpose(1, 2)?.contiguous()?;
            Ok(input.broadcast_matmul(w)?.broadcast_add(b)?)
        };
        let q = project(0, &self.w_q, &self.b_q)?;
        let k = project(1, &self.w_k, &self.b_k)?;
        let v = project(2, &self.w_v, &self.b_v)?;

        let scale = 1.0 / (self.head_dim as f64).sqrt();
        let scores = (q.matmul(&k.transpose(2, 3)?.contiguous()?)? * scale)?;
        let scores = scores.broadcast_add(mask)?;
        let pattern = softmax_last_dim(&scores)?;
        let z = pattern.matmul(&v)?;

        Ok(z.broadcast_matmul(&self.w_o)?)
    }
}

/// MLP block (pre-norm, tanh-approximated GELU)
struct Mlp {
    ln_weight: Tensor,
    ln_bias: Tensor,
    w_fc: Tensor,
    b_fc: Tensor,
    w_proj: Tensor,
    b_proj: Tensor,
    eps: f64,
}

impl Mlp {
    fn load(vb: VarBuilder, config: &Gpt2Config) -> Result<Self> {
        let d = config.n_embd;
        let inner = config.inner_dim();
        Ok(Self {
            ln_weight: vb.get(d, "ln_2.weight")?,
            ln_bias: vb.get(d, "ln_2.bias")?,
            w_fc: vb.get((d, inner), "mlp.c_fc.weight")?,
            b_fc: vb.get(inner, "mlp.c_fc.bias")?,
            w_proj: vb.get((inner, d), "mlp.c_proj.weight")?,
            b_proj: vb.get(d, "mlp.c_proj.bias")?,
            eps: config.layer_norm_epsilon,
        })
    }

    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let x = layer_norm(x, &self.ln_weight, &self.ln_bias, self.eps)?;
        let hidden = x.broadcast_matmul(&self.w_fc)?.broadcast_add(&self.b_fc)?.gelu()?;
        Ok(hidden
            .broadcast_matmul(&self.w_proj)?
            .broadcast_add(&self.b_proj)?)
    }
}

struct Block {
    attn: Attention,
    mlp: Mlp,
}

/// GPT-2 with per-node inputs and outputs
pub struct HookedGpt2 {
    wte: Tensor,
    wpe: Tensor,
    /// Tied unembedding, `(d_model, vocab)`
    lm_head: Tensor,
    blocks: Vec<Block>,
    ln_f_weight: Tensor,
    ln_f_bias: Tensor,
    config: Gpt2Config,
}

impl HookedGpt2 {
    /// Build from a weight source. Accepts checkpoints with or without the
    /// `transformer.` prefix.
    pub fn load(vb: VarBuilder, config: &Gpt2Config) -> Result<Self> {
        config.validate()?;
        let vb = if vb.contains_tensor("transformer.wte.weight") {
            vb.pp("transformer")
        } else {
            vb
        };
        let d = config.n_embd;

        let wte = vb.get((config.vocab_size, d), "wte.weight")?;
        let wpe = vb.get((config.n_positions, d), "wpe.weight")?;

        let mut blocks = Vec::with_capacity(config.n_layer);
        for i in 0..config.n_layer {
            if (i + 1) % 6 == 0 || i == 0 {
                info!("Loading layer {}/{}", i + 1, config.n_layer);
            }
            let vb_layer = vb.pp(format!("h.{i}"));
            blocks.push(Block {
                attn: Attention::load(vb_layer.clone(), config)?,
                mlp: Mlp::load(vb_layer, config)?,
            });
        }

        Ok(Self {
            lm_head: wte.t()?.contiguous()?,
            wte,
            wpe,
            blocks,
            ln_f_weight: vb.get(d, "ln_f.weight")?,
            ln_f_bias: vb.get(d, "ln_f.bias")?,
            config: config.clone(),
        })
    }

    /// Randomly initialised model, for tests and smoke runs
    pub fn random(config: &Gpt2Config, seed: u64, device: &Device) -> Result<Self> {
        let mut rng = rand::rngs::StdRng::seed_from_u64(seed);
        let d = config.n_embd;
        let inner = config.inner_dim();
        let mut tensors = HashMap::new();
        let mut add = |name: String, shape: &[usize], center: f32, spread: f32| -> Result<()> {
            let n: usize = shape.iter().product();
            let data: Vec<f32> = (0..n)
                .map(|_| center + rng.gen_range(-spread..spread))
                .collect();
            tensors.insert(name, Tensor::from_vec(data, shape, device)?);
            Ok(())
        };

        add("wte.weight".into(), &[config.vocab_size, d], 0.0, 0.5)?;
        add("wpe.weight".into(), &[config.n_positions, d], 0.0, 0.2)?;
        for i in 0..config.n_layer {
            let p = format!("h.{i}");
            add(format!("{p}.ln_1.weight"), &[d], 1.0, 0.1)?;
            add(format!("{p}.ln_1.bias"), &[d], 0.0, 0.1)?;
            add(format!("{p}.attn.c_attn.weight"), &[d, 3 * d], 0.0, 0.5)?;
            add(format!("{p}.attn.c_attn.bias"), &[3 * d], 0.0, 0.1)?;
            add(format!("{p}.attn.c_proj.weight"), &[d, d], 0.0, 0.3)?;
            add(format!("{p}.attn.c_proj.bias"), &[d], 0.0, 0.1)?;
            add(format!("{p}.ln_2.weight"), &[d], 1.0, 0.1)?;
            add(format!("{p}.ln_2.bias"), &[d], 0.0, 0.1)?;
            add(format!("{p}.mlp.c_fc.weight"), &[d, inner], 0.0, 0.3)?;
            add(format!("{p}.mlp.c_fc.bias"), &[inner], 0.0, 0.1)?;
            add(format!("{p}.mlp.c_proj.weight"), &[inner, d], 0.0, 0.3)?;
            add(format!("{p}.mlp.c_proj.bias"), &[d], 0.0, 0.1)?;
        }
        add("ln_f.weight".into(), &[d], 1.0, 0.1)?;
        add("ln_f.bias".into(), &[d], 0.0, 0.1)?;

        let vb = VarBuilder::from_tensors(tensors, DType::F32, device);
        Self::load(vb, config)
    }

    pub fn config(&self) -> &Gpt2Config {
        &self.config
    }

    /// Graph dimensions of this model
    pub fn graph_config(&self) -> GraphConfig {
        GraphConfig::new(self.config.n_layer, self.config.n_head, self.config.n_embd)
    }

    /// Token + position embeddings, `(batch, seq, d_model)`
    fn embed(&self, input_ids: &Tensor) -> Result<Tensor> {
        let (b, p) = input_ids.dims2()?;
        if p > self.config.n_positions {
            return Err(EapError::Config(format!(
                "sequence of {p} tokens exceeds n_positions ({})",
                self.config.n_positions
            )));
        }
        let tokens = self
            .wte
            .index_select(&input_ids.flatten_all()?, 0)?
            .reshape((b, p, self.config.n_embd))?;
        Ok(tokens.broadcast_add(&self.wpe.narrow(0, 0, p)?)?)
    }

    /// Forward pass over `input_ids` of shape `(batch, seq)`
    pub fn forward(&self, input_ids: &Tensor, opts: &ForwardOptions<'_>) -> Result<ForwardOutput> {
        let (batch, seq_len) = input_ids.dims2()?;
        let (h, d) = (self.config.n_head, self.config.n_embd);
        let cfg = self.graph_config();

        let embeds = match opts.embeddings {
            Some(e) => e.clone(),
            None => self.embed(input_ids)?,
        };
        let mask = causal_mask(seq_len, input_ids.device())?;

        let mut deltas = match opts.patch {
            Some(patch) => Some(PatchDeltas::new(patch, batch, seq_len, d)?),
            None => None,
        };
        let mut activations = NodeActivations::with_capacity(2 * self.blocks.len() + 1);
        record(&mut activations, deltas.as_mut(), embeds.unsqueeze(0)?)?;
        let mut resid = embeds;

        for (layer, block) in self.blocks.iter().enumerate() {
            let mut attn_in = resid
                .unsqueeze(2)?
                .unsqueeze(2)?
                .broadcast_as((batch, seq_len, 3, h, d))?;
            if let Some(deltas) = &deltas {
                let delta = deltas
                    .delta(cfg.attention_reader_start(layer), 3 * h)?
                    .reshape((3, h, batch, seq_len, d))?
                    .permute((2, 3, 0, 1, 4))?;
                attn_in = attn_in.broadcast_add(&delta)?;
            }
            if let Some(probes) = opts.probes {
                attn_in = attn_in.broadcast_add(probes.attention(layer))?;
            }
            let heads = block.attn.forward(&attn_in, &mask)?;
            resid = resid
                .add(&heads.sum(1)?)?
                .broadcast_add(&block.attn.b_o)?;
            record(
                &mut activations,
                deltas.as_mut(),
                heads.transpose(0, 1)?.contiguous()?,
            )?;

            let mut mlp_in = resid.clone();
            if let Some(deltas) = &deltas {
                mlp_in = mlp_in.add(&deltas.delta(cfg.mlp_reader(layer), 1)?.squeeze(0)?)?;
            }
            if let Some(probes) = opts.probes {
                mlp_in = mlp_in.add(probes.mlp(layer))?;
            }
            let mlp_out = block.mlp.forward(&mlp_in)?;
            resid = resid.add(&mlp_out)?;
            record(&mut activations, deltas.as_mut(), mlp_out.unsqueeze(0)?)?;
        }

        let mut final_in = resid;
        if let Some(deltas) = &deltas {
            final_in = final_in.add(&deltas.delta(cfg.logits_reader(), 1)?.squeeze(0)?)?;
        }
        if let Some(probes) = opts.probes {
            final_in = final_in.add(probes.logits())?;
        }
        let normed = layer_norm(&final_in, &self.ln_f_weight, &self.ln_f_bias, self.config.layer_norm_epsilon)?;
        let logits = normed.broadcast_matmul(&self.lm_head)?;

        Ok(ForwardOutput {
            logits,
            activations,
        })
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn tiny_config() -> Gpt2Config {
        Gpt2Config {
            vocab_size: 32,
            n_positions: 16,
            n_embd: 8,
            n_layer: 2,
            n_head: 2,
            n_inner: None,
            layer_norm_epsilon: 1e-5,
            model_type: Some("gpt2".to_string()),
        }
    }

    fn ids(device: &Device) -> Tensor {
        Tensor::new(&[[1u32, 5, 7, 2], [3, 3, 9, 0]], device).unwrap()
    }

    fn max_abs_diff(a: &Tensor, b: &Tensor) -> f32 {
        a.sub(b)
            .unwrap()
            .abs()
            .unwrap()
            .flatten_all()
            .unwrap()
            .max(0)
            .unwrap()
            .to_scalar::<f32>()
            .unwrap()
    }

    #[test]
    fn test_config_defaults() {
        let cfg: Gpt2Config = serde_json::from_str(
            r#"{"vocab_size": 50257, "n_positions": 1024, "n_embd": 768, "n_layer": 12, "n_head": 12}"#,
        )
        .unwrap();
        assert_eq!(cfg.inner_dim(), 3072);
        assert_eq!(cfg.head_dim(), 64);
        assert_eq!(cfg.layer_norm_epsilon, 1e-5);
        assert!(cfg.validate().is_ok());

        let mut bad = cfg.clone();
        bad.n_head = 5;
        assert!(bad.validate().is_err());
        bad = cfg;
        bad.model_type = Some("llama".into());
        assert!(bad.validate().is_err());
    }

    #[test]
    fn test_forward_shapes() {
        let device = Device::Cpu;
        let model = HookedGpt2::random(&tiny_config(), 7, &device).unwrap();
        let out = model.forward(&ids(&device), &ForwardOptions::default()).unwrap();
        assert_eq!(out.logits.dims(), &[2, 4, 32]);
        let acts = out.activations.stacked().unwrap();
        assert_eq!(acts.dims(), &[model.graph_config().n_forward(), 2, 4, 8]);
    }

    #[test]
    fn test_causality() {
        // changing the last token must not change earlier positions' logits
        let device = Device::Cpu;
        let model = HookedGpt2::random(&tiny_config(), 3, &device).unwrap();
        let a = Tensor::new(&[[1u32, 5, 7, 2]], &device).unwrap();
        let b = Tensor::new(&[[1u32, 5, 7, 30]], &device).unwrap();
        let la = model.forward(&a, &ForwardOptions::default()).unwrap().logits;
        let lb = model.forward(&b, &ForwardOptions::default()).unwrap().logits;
        let prefix_a = la.narrow(1, 0, 3).unwrap();
        let prefix_b = lb.narrow(1, 0, 3).unwrap();
        assert!(max_abs_diff(&prefix_a, &prefix_b) < 1e-5);
        assert!(max_abs_diff(&la.narrow(1, 3, 1).unwrap(), &lb.narrow(1, 3, 1).unwrap()) > 1e-4);
    }

    #[test]
    fn test_zero_probes_do_not_change_logits() {
        let device = Device::Cpu;
        let model = HookedGpt2::random(&tiny_config(), 11, &device).unwrap();
        let input = ids(&device);
        let plain = model.forward(&input, &ForwardOptions::default()).unwrap();
        let probes = InputProbes::new(model.graph_config(), 2, 4, &device).unwrap();
        let probed = model
            .forward(
                &input,
                &ForwardOptions {
                    probes: Some(&probes),
                    ..Default::default()
                },
            )
            .unwrap();
        assert!(max_abs_diff(&plain.logits, &probed.logits) < 1e-5);
    }

    #[test]
    fn test_patching_extremes() {
        let device = Device::Cpu;
        let model = HookedGpt2::random(&tiny_config(), 5, &device).unwrap();
        let cfg = model.graph_config();
        let clean = ids(&device);
        let corrupted = Tensor::new(&[[4u32, 6, 8, 10], [12, 14, 16, 18]], &device).unwrap();

        let clean_out = model.forward(&clean, &ForwardOptions::default()).unwrap();
        let corrupted_out = model.forward(&corrupted, &ForwardOptions::default()).unwrap();
        let corrupted_acts = corrupted_out.activations.stacked().unwrap();

        let run = |value: f32| {
            let excluded =
                Tensor::full(value, (cfg.n_forward(), cfg.n_backward()), &device).unwrap();
            model
                .forward(
                    &clean,
                    &ForwardOptions {
                        patch: Some(Patch {
                            corrupted: &corrupted_acts,
                            excluded: &excluded,
                        }),
                        ..Default::default()
                    },
                )
                .unwrap()
                .logits
        };

        // nothing excluded: clean run
        assert!(max_abs_diff(&run(0.0), &clean_out.logits) < 1e-4);
        // everything excluded: corrupted run
        assert!(max_abs_diff(&run(1.0), &corrupted_out.logits) < 1e-4);
    }

    #[test]
    fn test_patch_deltas_accumulate_chunks() {
        let device = Device::Cpu;
        let (n_fwd, n_bwd, b, p, d) = (5, 4, 2, 3, 2);
        let corrupted = Tensor::randn(0f32, 1.0, (n_fwd, b, p, d), &device).unwrap();
        let current = Tensor::randn(0f32, 1.0, (n_fwd, b, p, d), &device).unwrap();
        let excluded = Tensor::new(
            &[
                [1f32, 0., 1., 1.],
                [0., 1., 1., 0.],
                [1., 1., 0., 1.],
                [0., 0., 1., 1.],
                [1., 0., 0., 1.],
            ],
            &device,
        )
        .unwrap();
        let patch = Patch {
            corrupted: &corrupted,
            excluded: &excluded,
        };

        let mut deltas = PatchDeltas::new(patch, b, p, d).unwrap();
        deltas.add_writers(&current.narrow(0, 0, 2).unwrap()).unwrap();
        deltas.add_writers(&current.narrow(0, 2, 3).unwrap()).unwrap();

        let expected = excluded
            .t()
            .unwrap()
            .matmul(&corrupted.sub(&current).unwrap().reshape((n_fwd, ())).unwrap())
            .unwrap()
            .narrow(0, 1, 2)
            .unwrap()
            .reshape((2, b, p, d))
            .unwrap();
        assert!(max_abs_diff(&deltas.delta(1, 2).unwrap(), &expected) < 1e-5);

        // only the first writer folded in so far
        let mut partial = PatchDeltas::new(patch, b, p, d).unwrap();
        partial.add_writers(&current.narrow(0, 0, 1).unwrap()).unwrap();
        let first = corrupted
            .narrow(0, 0, 1)
            .unwrap()
            .sub(&current.narrow(0, 0, 1).unwrap())
            .unwrap();
        assert!(max_abs_diff(&partial.delta(0, 1).unwrap(), &first) < 1e-5);
        let untouched = partial.delta(1, 1).unwrap();
        assert_eq!(max_abs_diff(&untouched, &untouched.zeros_like().unwrap()), 0.0);
    }

    #[test]
    fn test_sequence_too_long() {
        let device = Device::Cpu;
        let model = HookedGpt2::random(&tiny_config(), 1, &device).unwrap();
        let input = Tensor::zeros((1, 17), DType::U32, &device).unwrap();
        assert!(matches!(
            model.forward(&input, &ForwardOptions::default()),
            Err(EapError::Config(_))
        ));
    }
}
