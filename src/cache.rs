//! Per-node activation cache and gradient probes
//!
//! [`NodeActivations`] collects what every writer node (input embedding,
//! attention heads, MLPs) adds to the residual stream during one forward
//! pass. [`InputProbes`] are zero-valued variables added to every reader
//! input; after `backward()` their gradients are the gradients of the metric
//! with respect to those inputs.

use candle_core::backprop::GradStore;
use candle_core::{DType, Device, Tensor, Var};

use crate::error::{EapError, Result};
use crate::graph::GraphConfig;

/// Writer outputs from a forward pass, in writer-index order
///
/// Each pushed chunk has shape `(n_writers, batch, seq_len, d_model)`.
#[derive(Debug, Default)]
pub struct NodeActivations {
    chunks: Vec<Tensor>,
    n_writers: usize,
}

impl NodeActivations {
    /// Create an empty cache with room for `n_chunks` pushes
    pub fn with_capacity(n_chunks: usize) -> Self {
        Self {
            chunks: Vec::with_capacity(n_chunks),
            n_writers: 0,
        }
    }

    /// Append the outputs of the next writers
    pub fn push(&mut self, chunk: Tensor) -> Result<()> {
        self.n_writers += chunk.dim(0)?;
        self.chunks.push(chunk);
        Ok(())
    }

    /// Number of writers cached so far
    pub fn n_writers(&self) -> usize {
        self.n_writers
    }

    /// Check if cache is empty
    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    /// All cached writer outputs, shape `(n_writers, batch, seq_len, d_model)`
    pub fn stacked(&self) -> Result<Tensor> {
        if self.chunks.is_empty() {
            return Err(EapError::Graph("activation cache is empty".to_string()));
        }
        Ok(Tensor::cat(&self.chunks, 0)?)
    }

    /// Output of the input node (token + position embeddings)
    pub fn embeddings(&self) -> Result<Tensor> {
        let first = self
            .chunks
            .first()
            .ok_or_else(|| EapError::Graph("activation cache is empty".to_string()))?;
        Ok(first.squeeze(0)?)
    }
}

/// Zero-valued variables attached to every reader input
pub struct InputProbes {
    cfg: GraphConfig,
    attention: Vec<Var>,
    mlp: Vec<Var>,
    logits: Var,
}

impl InputProbes {
    /// Probes for a batch of `batch` sequences of `seq_len` tokens.
    ///
    /// Attention probes have shape `(batch, seq_len, 3, n_heads, d_model)`
    /// (query, key and value inputs of every head); MLP and logits probes
    /// have shape `(batch, seq_len, d_model)`.
    pub fn new(cfg: GraphConfig, batch: usize, seq_len: usize, device: &Device) -> Result<Self> {
        let d = cfg.d_model;
        let attention = (0..cfg.n_layers)
            .map(|_| Var::zeros((batch, seq_len, 3, cfg.n_heads, d), DType::F32, device))
            .collect::<candle_core::Result<Vec<_>>>()?;
        let mlp = (0..cfg.n_layers)
            .map(|_| Var::zeros((batch, seq_len, d), DType::F32, device))
            .collect::<candle_core::Result<Vec<_>>>()?;
        let logits = Var::zeros((batch, seq_len, d), DType::F32, device)?;
        Ok(Self {
            cfg,
            attention,
            mlp,
            logits,
        })
    }

    pub fn attention(&self, layer: usize) -> &Tensor {
        self.attention[layer].as_tensor()
    }

    pub fn mlp(&self, layer: usize) -> &Tensor {
        self.mlp[layer].as_tensor()
    }

    pub fn logits(&self) -> &Tensor {
        self.logits.as_tensor()
    }

    /// Gradients of every reader input, shape `(n_backward, batch*seq_len*d_model)`
    /// in reader-slot order. Inputs the metric does not depend on get zeros.
    pub fn gradient_matrix(&self, grads: &GradStore) -> Result<Tensor> {
        let h = self.cfg.n_heads;
        let mut rows = Vec::with_capacity(2 * self.cfg.n_layers + 1);
        for layer in 0..self.cfg.n_layers {
            let g = grad_or_zeros(grads, self.attention(layer))?;
            let (b, p, _, _, d) = g.dims5()?;
            // (b, p, qkv, head, d) -> (qkv, head, b, p, d): q heads, k heads, v heads
            rows.push(g.permute((2, 3, 0, 1, 4))?.reshape((3 * h, b * p * d))?);
            rows.push(grad_or_zeros(grads, self.mlp(layer))?.reshape((1, ()))?);
        }
        rows.push(grad_or_zeros(grads, self.logits())?.reshape((1, ()))?);
        Ok(Tensor::cat(&rows, 0)?)
    }
}

fn grad_or_zeros(grads: &GradStore, probe: &Tensor) -> Result<Tensor> {
    match grads.get(probe) {
        Some(g) => Ok(g.clone()),
        None => Ok(probe.zeros_like()?),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_activations_stack() {
        let device = Device::Cpu;
        let mut cache = NodeActivations::with_capacity(3);
        assert!(cache.is_empty());
        assert!(cache.stacked().is_err());

        cache
            .push(Tensor::zeros((1, 2, 3, 4), DType::F32, &device).unwrap())
            .unwrap();
        cache
            .push(Tensor::ones((5, 2, 3, 4), DType::F32, &device).unwrap())
            .unwrap();
        assert_eq!(cache.n_writers(), 6);
        assert_eq!(cache.stacked().unwrap().dims(), &[6, 2, 3, 4]);
        assert_eq!(cache.embeddings().unwrap().dims(), &[2, 3, 4]);
    }

    #[test]
    fn test_gradient_matrix_layout() {
        let device = Device::Cpu;
        let cfg = GraphConfig::new(2, 3, 4);
        let probes = InputProbes::new(cfg, 2, 5, &device).unwrap();

        // metric reading only the key input of head 1 in layer 1
        let k_in = probes
            .attention(1)
            .narrow(2, 1, 1)
            .unwrap()
            .narrow(3, 1, 1)
            .unwrap();
        let loss = (k_in.sum_all().unwrap() + probes.logits().sum_all().unwrap()).unwrap();
        let grads = loss.backward().unwrap();

        let m = probes.gradient_matrix(&grads).unwrap();
        assert_eq!(m.dims(), &[cfg.n_backward(), 2 * 5 * 4]);

        let row_sums: Vec<f32> = m.sum(1).unwrap().to_vec1().unwrap();
        for (reader, &s) in row_sums.iter().enumerate() {
            let expected = if reader == cfg.attention_reader(1, 1, crate::graph::Qkv::K)
                || reader == cfg.logits_reader()
            {
                40.0
            } else {
                0.0
            };
            assert_eq!(s, expected, "reader {reader}");
        }
    }
}
