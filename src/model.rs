use crate::{error::ParseOptionError, messages::ChatMessage};
use image::RgbImage;
use serde::Serialize;
use std::str::FromStr;

/// A video handed to the model as its decoded frames.
pub type VideoFrames = Vec<RgbImage>;

/// Numeric precision the model weights are loaded with.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Precision {
    F16,
    Bf16,
    F32,
}

impl Precision {
    pub fn as_str(&self) -> &'static str {
        match self {
            Precision::F16 => "f16",
            Precision::Bf16 => "bf16",
            Precision::F32 => "f32",
        }
    }
}

impl FromStr for Precision {
    type Err = ParseOptionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "f16" | "float16" | "half" => Ok(Precision::F16),
            "bf16" | "bfloat16" => Ok(Precision::Bf16),
            "f32" | "float32" => Ok(Precision::F32),
            _ => Err(ParseOptionError::new("precision", s)),
        }
    }
}

/// Where the model weights should be placed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DevicePolicy {
    /// First accelerator when available, otherwise the CPU.
    Auto,
    Cpu,
    Cuda(usize),
}

impl FromStr for DevicePolicy {
    type Err = ParseOptionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "auto" => Ok(DevicePolicy::Auto),
            "cpu" => Ok(DevicePolicy::Cpu),
            "cuda" => Ok(DevicePolicy::Cuda(0)),
            other => other
                .strip_prefix("cuda:")
                .and_then(|ordinal| ordinal.parse().ok())
                .map(DevicePolicy::Cuda)
                .ok_or_else(|| ParseOptionError::new("device", s)),
        }
    }
}

/// Static facts about a loaded model, reported by the health endpoint.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ModelInfo {
    pub name: String,
    pub device: String,
    pub precision: Precision,
}

/// Options controlling how token ids are turned back into text.
///
/// Decoded text is returned as the tokenizer produced it, spacing included.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DecodeOptions {
    pub skip_special_tokens: bool,
}

/// A batched, model-ready input bundle.
pub trait BatchInputs {
    /// The token ids of every row in the batch, before generation.
    fn input_ids(&self) -> &[Vec<u32>];
}

/// Trait for the pretrained vision-language model the service delegates to.
///
/// Implementations own the weights and the companion processor (tokenizer,
/// prompt template and vision preprocessing). The service only orchestrates
/// the calls; it never looks inside the tensors.
pub trait VisionLanguageModel {
    /// The bundle produced by [`VisionLanguageModel::prepare_inputs`].
    type Inputs: BatchInputs;
    /// The error type that can be returned by any model operation.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Returns the device placement and precision of the loaded weights.
    fn info(&self) -> ModelInfo;

    /// Renders chat messages into the model's textual template, without
    /// tokenizing and with the generation prompt appended.
    fn render_prompt(&self, messages: &[ChatMessage]) -> Result<String, Self::Error>;

    /// Packs rendered texts and decoded visual inputs into one padded batch.
    fn prepare_inputs(
        &self,
        texts: &[String],
        images: Vec<RgbImage>,
        videos: Vec<VideoFrames>,
    ) -> Result<Self::Inputs, Self::Error>;

    /// Moves every tensor of the bundle onto the device holding the weights.
    fn to_device(&self, inputs: Self::Inputs) -> Result<Self::Inputs, Self::Error>;

    /// Runs generation. Every returned sequence starts with its input tokens,
    /// followed by at most `max_new_tokens` generated ones.
    fn generate(
        &mut self,
        inputs: &Self::Inputs,
        max_new_tokens: usize,
    ) -> Result<Vec<Vec<u32>>, Self::Error>;

    /// Decodes a batch of token sequences into text.
    fn batch_decode(
        &self,
        sequences: &[Vec<u32>],
        options: DecodeOptions,
    ) -> Result<Vec<String>, Self::Error>;
}
