//! EapModel wrapper: device choice, hub loading and prompt encoding

use candle_core::{DType, Device, Tensor};
use candle_nn::VarBuilder;
use hf_hub::{api::sync::Api, Repo, RepoType};
use tokenizers::Tokenizer;
use tracing::{debug, info};

use crate::error::{EapError, Result};
use crate::forward_gpt2::{ForwardOptions, ForwardOutput, Gpt2Config, HookedGpt2};
use crate::graph::GraphConfig;

/// Text to token ids, plus the special tokens used for batching
pub trait PromptEncoder {
    /// Encode without adding special tokens
    fn encode(&self, text: &str) -> Result<Vec<u32>>;
    /// Token prepended to every prompt
    fn bos_token_id(&self) -> u32;
    /// Token used to right-pad shorter prompts
    fn pad_token_id(&self) -> u32;
}

/// [`PromptEncoder`] backed by a HuggingFace tokenizer
pub struct HfEncoder {
    tokenizer: Tokenizer,
    bos: u32,
    pad: u32,
}

impl HfEncoder {
    /// GPT-style tokenizers use `<|endoftext|>` for both BOS and padding
    pub const SPECIAL_TOKEN: &'static str = "<|endoftext|>";

    pub fn new(tokenizer: Tokenizer) -> Result<Self> {
        let bos = tokenizer.token_to_id(Self::SPECIAL_TOKEN).ok_or_else(|| {
            EapError::Tokenizer(format!("vocabulary has no {} token", Self::SPECIAL_TOKEN))
        })?;
        Ok(Self {
            tokenizer,
            bos,
            pad: bos,
        })
    }

    pub fn from_file(path: impl AsRef<std::path::Path>) -> Result<Self> {
        let tokenizer =
            Tokenizer::from_file(path).map_err(|e| EapError::Tokenizer(e.to_string()))?;
        Self::new(tokenizer)
    }
}

impl PromptEncoder for HfEncoder {
    fn encode(&self, text: &str) -> Result<Vec<u32>> {
        let encoding = self
            .tokenizer
            .encode(text, false)
            .map_err(|e| EapError::Tokenizer(e.to_string()))?;
        Ok(encoding.get_ids().to_vec())
    }

    fn bos_token_id(&self) -> u32 {
        self.bos
    }

    fn pad_token_id(&self) -> u32 {
        self.pad
    }
}

/// Clean and corrupted prompts of one batch as padded token tensors
#[derive(Debug)]
pub struct TokenizedPair {
    /// `(batch, n_pos)` u32
    pub clean: Tensor,
    /// `(batch, n_pos)` u32
    pub corrupted: Tensor,
    /// Unpadded length of every example, BOS included
    pub input_lengths: Vec<usize>,
    pub n_pos: usize,
}

/// Model + encoder + device
pub struct EapModel {
    model: HookedGpt2,
    encoder: Box<dyn PromptEncoder>,
    device: Device,
    model_id: String,
}

impl EapModel {
    pub fn new(
        model: HookedGpt2,
        encoder: Box<dyn PromptEncoder>,
        device: Device,
        model_id: impl Into<String>,
    ) -> Self {
        Self {
            model,
            encoder,
            device,
            model_id: model_id.into(),
        }
    }

    /// Load a model from HuggingFace (tries CUDA unless `force_cpu`)
    ///
    /// Attribution needs gradients, so weights are always loaded as `F32`.
    pub fn from_pretrained(model_id: &str, force_cpu: bool) -> Result<Self> {
        if !model_id.to_lowercase().contains("gpt2") {
            return Err(EapError::Config(format!(
                "no hooked forward pass for '{model_id}' (supported: gpt2 family)"
            )));
        }

        let device = if force_cpu {
            info!("Forcing CPU mode");
            Device::Cpu
        } else {
            match Device::cuda_if_available(0) {
                Ok(dev) if dev.is_cuda() => {
                    info!("Using CUDA device");
                    dev
                }
                _ => {
                    info!("CUDA not available, using CPU");
                    Device::Cpu
                }
            }
        };

        info!("Loading model: {}", model_id);
        let api = Api::new().map_err(|e| EapError::Download(e.to_string()))?;
        let repo = api.repo(Repo::new(model_id.to_string(), RepoType::Model));
        let fetch = |name: &str| {
            repo.get(name)
                .map_err(|e| EapError::Download(format!("{name}: {e}")))
        };

        let encoder = HfEncoder::from_file(fetch("tokenizer.json")?)?;

        let config_str = std::fs::read_to_string(fetch("config.json")?)?;
        let config: Gpt2Config = serde_json::from_str(&config_str)?;
        info!(
            "Model config: {} layers, {} heads, {} hidden, {} vocab",
            config.n_layer, config.n_head, config.n_embd, config.vocab_size
        );

        let weights = fetch("model.safetensors")?;
        debug!("Weights at {}", weights.display());
        let vb = unsafe { VarBuilder::from_mmaped_safetensors(&[weights], DType::F32, &device)? };
        let model = HookedGpt2::load(vb, &config)?;

        Ok(Self::new(model, Box::new(encoder), device, model_id))
    }

    pub fn model_id(&self) -> &str {
        &self.model_id
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn encoder(&self) -> &dyn PromptEncoder {
        self.encoder.as_ref()
    }

    pub fn graph_config(&self) -> GraphConfig {
        self.model.graph_config()
    }

    pub fn forward(&self, input_ids: &Tensor, opts: &ForwardOptions<'_>) -> Result<ForwardOutput> {
        self.model.forward(input_ids, opts)
    }

    /// Encode one prompt with BOS prepended
    fn encode_prompt(&self, text: &str) -> Result<Vec<u32>> {
        let mut ids = Vec::with_capacity(text.len() / 3 + 2);
        ids.push(self.encoder.bos_token_id());
        ids.extend(self.encoder.encode(text)?);
        Ok(ids)
    }

    /// Tokenize a batch of clean/corrupted prompt pairs.
    ///
    /// Every prompt gets BOS prepended and is right-padded to the longest
    /// prompt in the batch. Each clean prompt must have the same token
    /// count as its corrupted counterpart.
    pub fn tokenize_pair(&self, clean: &[String], corrupted: &[String]) -> Result<TokenizedPair> {
        if clean.len() != corrupted.len() {
            return Err(EapError::Config(format!(
                "{} clean prompts but {} corrupted prompts",
                clean.len(),
                corrupted.len()
            )));
        }

        let mut clean_ids = Vec::with_capacity(clean.len());
        let mut corrupted_ids = Vec::with_capacity(corrupted.len());
        for (index, (c, x)) in clean.iter().zip(corrupted).enumerate() {
            let c = self.encode_prompt(c)?;
            let x = self.encode_prompt(x)?;
            if c.len() != x.len() {
                return Err(EapError::LengthMismatch {
                    index,
                    clean: c.len(),
                    corrupted: x.len(),
                });
            }
            clean_ids.push(c);
            corrupted_ids.push(x);
        }

        let input_lengths: Vec<usize> = clean_ids.iter().map(Vec::len).collect();
        let n_pos = input_lengths.iter().copied().max().unwrap_or(0);
        let pad = self.encoder.pad_token_id();
        let to_tensor = |rows: Vec<Vec<u32>>| -> Result<Tensor> {
            let n_rows = rows.len();
            let flat: Vec<u32> = rows
                .into_iter()
                .flat_map(|mut r| {
                    r.resize(n_pos, pad);
                    r
                })
                .collect();
            Ok(Tensor::from_vec(flat, (n_rows, n_pos), &self.device)?)
        };

        Ok(TokenizedPair {
            clean: to_tensor(clean_ids)?,
            corrupted: to_tensor(corrupted_ids)?,
            input_lengths,
            n_pos,
        })
    }
}
