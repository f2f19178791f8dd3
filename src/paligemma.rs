use crate::{
    messages::{ChatMessage, ContentPart},
    model::{
        BatchInputs, DecodeOptions, DevicePolicy, ModelInfo, Precision, VideoFrames,
        VisionLanguageModel,
    },
};
use candle_core::{DType, Device, Tensor};
use candle_nn::VarBuilder;
use candle_transformers::{
    generation::LogitsProcessor,
    models::paligemma::{Config, Model},
    utils::apply_repeat_penalty,
};
use image::{RgbImage, imageops::FilterType};
use std::{
    collections::BTreeSet,
    path::{Path, PathBuf},
};
use tokenizers::Tokenizer;

const IMAGE_SIZE: usize = 224;

#[derive(thiserror::Error, Debug)]
pub enum PaligemmaError {
    #[error(transparent)]
    CandleError(#[from] candle_core::Error),

    #[error(transparent)]
    TokenizerError(#[from] tokenizers::Error),

    #[error(transparent)]
    IoError(#[from] std::io::Error),

    #[error("invalid safetensors index: {0}")]
    IndexError(#[from] serde_json::Error),

    #[error("missing model file: {}", .0.display())]
    MissingFile(PathBuf),

    #[error("Cannot find the <eos> token")]
    EosTokenNotFound,

    #[error("expected one prompt with one image, got {texts} prompt(s) and {images} image(s)")]
    UnsupportedBatch { texts: usize, images: usize },

    #[error("video inputs are not supported by Paligemma")]
    VideoNotSupported,
}

/// Sampling configuration for the Paligemma model
pub struct PaligemmaConfig {
    pub seed: u64,
    pub temp: Option<f64>,
    pub top_p: Option<f64>,
    pub repeat_penalty: f32,
    pub repeat_last_n: usize,
}

impl Default for PaligemmaConfig {
    fn default() -> Self {
        Self {
            seed: 299792458,
            temp: None,
            top_p: None,
            repeat_penalty: 1.1,
            repeat_last_n: 64,
        }
    }
}

/// Padded prompt tokens plus the pixel values of their images.
pub struct PaligemmaInputs {
    input_ids: Vec<Vec<u32>>,
    pixel_values: Tensor,
}

impl BatchInputs for PaligemmaInputs {
    fn input_ids(&self) -> &[Vec<u32>] {
        &self.input_ids
    }
}

/// Google Paligemma (3B, 224px) loaded from a local checkpoint directory.
///
/// The directory must contain `tokenizer.json` and either `model.safetensors`
/// or a sharded `model.safetensors.index.json`.
///
/// NOTE: to run the model with Cuda, build with `--features cuda`.
pub struct PaligemmaModel {
    model: Model,
    tokenizer: Tokenizer,
    device: Device,
    dtype: DType,
    precision: Precision,
    config: PaligemmaConfig,
    eos_token: u32,
    pad_token: u32,
}

impl PaligemmaModel {
    pub fn load(
        model_dir: &Path,
        precision: Precision,
        device_policy: DevicePolicy,
    ) -> Result<Self, PaligemmaError> {
        Self::load_with_config(model_dir, precision, device_policy, PaligemmaConfig::default())
    }

    pub fn load_with_config(
        model_dir: &Path,
        precision: Precision,
        device_policy: DevicePolicy,
        config: PaligemmaConfig,
    ) -> Result<Self, PaligemmaError> {
        let device = select_device(device_policy)?;
        let precision = effective_precision(precision, &device);
        let dtype = match precision {
            Precision::F16 => DType::F16,
            Precision::Bf16 => DType::BF16,
            Precision::F32 => DType::F32,
        };

        let tokenizer_file = model_dir.join("tokenizer.json");
        if !tokenizer_file.is_file() {
            return Err(PaligemmaError::MissingFile(tokenizer_file));
        }
        let tokenizer = Tokenizer::from_file(&tokenizer_file)?;
        let eos_token = tokenizer
            .token_to_id("<eos>")
            .ok_or(PaligemmaError::EosTokenNotFound)?;
        let pad_token = tokenizer.token_to_id("<pad>").unwrap_or(0);

        let weights = safetensors_files(model_dir)?;
        log::debug!("Loading {} weight file(s) as {:?}", weights.len(), dtype);
        let vb = unsafe { VarBuilder::from_mmaped_safetensors(&weights, dtype, &device)? };
        let model = Model::new(&Config::paligemma_3b_224(), vb)?;

        Ok(Self {
            model,
            tokenizer,
            device,
            dtype,
            precision,
            config,
            eos_token,
            pad_token,
        })
    }
}

impl VisionLanguageModel for PaligemmaModel {
    type Inputs = PaligemmaInputs;
    type Error = PaligemmaError;

    fn info(&self) -> ModelInfo {
        ModelInfo {
            name: "paligemma-3b-224".to_string(),
            device: device_label(&self.device).to_string(),
            precision: self.precision,
        }
    }

    fn render_prompt(&self, messages: &[ChatMessage]) -> Result<String, Self::Error> {
        Ok(render_prompt(messages))
    }

    fn prepare_inputs(
        &self,
        texts: &[String],
        images: Vec<RgbImage>,
        videos: Vec<VideoFrames>,
    ) -> Result<Self::Inputs, Self::Error> {
        if !videos.is_empty() {
            return Err(PaligemmaError::VideoNotSupported);
        }
        if texts.len() != 1 || images.len() != 1 {
            return Err(PaligemmaError::UnsupportedBatch {
                texts: texts.len(),
                images: images.len(),
            });
        }

        let rows = texts
            .iter()
            .map(|text| {
                let encoding = self.tokenizer.encode(text.as_str(), true)?;
                Ok(encoding.get_ids().to_vec())
            })
            .collect::<Result<Vec<_>, PaligemmaError>>()?;

        let pixel_values = images
            .iter()
            .map(image_to_tensor)
            .collect::<Result<Vec<_>, _>>()?;

        Ok(PaligemmaInputs {
            input_ids: pad_left(rows, self.pad_token),
            pixel_values: Tensor::cat(&pixel_values, 0)?,
        })
    }

    fn to_device(&self, inputs: Self::Inputs) -> Result<Self::Inputs, Self::Error> {
        Ok(PaligemmaInputs {
            pixel_values: inputs
                .pixel_values
                .to_device(&self.device)?
                .to_dtype(self.dtype)?,
            ..inputs
        })
    }

    fn generate(
        &mut self,
        inputs: &Self::Inputs,
        max_new_tokens: usize,
    ) -> Result<Vec<Vec<u32>>, Self::Error> {
        let mut outputs = Vec::with_capacity(inputs.input_ids.len());

        for (row, prompt_ids) in inputs.input_ids.iter().enumerate() {
            let pixel_values = inputs.pixel_values.narrow(0, row, 1)?;
            let mut logits_processor =
                LogitsProcessor::new(self.config.seed, self.config.temp, self.config.top_p);
            let mut tokens = prompt_ids.clone();

            self.model.clear_kv_cache();
            for index in 0..max_new_tokens {
                let logits = if index == 0 {
                    let input = Tensor::new(tokens.as_slice(), &self.device)?.unsqueeze(0)?;
                    self.model.setup(&pixel_values, &input)?
                } else {
                    let last = &tokens[tokens.len() - 1..];
                    let input = Tensor::new(last, &self.device)?.unsqueeze(0)?;
                    self.model.forward(&input)?
                };
                let logits = logits.squeeze(0)?.squeeze(0)?.to_dtype(DType::F32)?;
                let logits = if self.config.repeat_penalty == 1. {
                    logits
                } else {
                    let start_at = tokens.len().saturating_sub(self.config.repeat_last_n);
                    apply_repeat_penalty(&logits, self.config.repeat_penalty, &tokens[start_at..])?
                };

                let next_token = logits_processor.sample(&logits)?;
                tokens.push(next_token);
                if next_token == self.eos_token {
                    break;
                }
            }

            outputs.push(tokens);
        }

        Ok(outputs)
    }

    fn batch_decode(
        &self,
        sequences: &[Vec<u32>],
        options: DecodeOptions,
    ) -> Result<Vec<String>, Self::Error> {
        sequences
            .iter()
            .map(|ids| Ok(self.tokenizer.decode(ids, options.skip_special_tokens)?))
            .collect()
    }
}

/// Paligemma has no chat template: the text parts form the prefix and a
/// newline separates it from the generated suffix.
fn render_prompt(messages: &[ChatMessage]) -> String {
    let prefix = messages
        .iter()
        .flat_map(|m| &m.content)
        .filter_map(|part| match part {
            ContentPart::Text { text } => Some(text.as_str()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join(" ");
    format!("{prefix}\n")
}

/// Left-pads every row to the length of the longest one.
fn pad_left(rows: Vec<Vec<u32>>, pad_token: u32) -> Vec<Vec<u32>> {
    let longest = rows.iter().map(Vec::len).max().unwrap_or(0);
    rows.into_iter()
        .map(|row| {
            let mut padded = vec![pad_token; longest - row.len()];
            padded.extend(row);
            padded
        })
        .collect()
}

// resize to 224x224 and scale to [-1, 1] with shape [1, 3, 224, 224]
fn image_to_tensor(image: &RgbImage) -> Result<Tensor, PaligemmaError> {
    let resized = image::imageops::resize(
        image,
        IMAGE_SIZE as u32,
        IMAGE_SIZE as u32,
        FilterType::Triangle,
    );
    let tensor = Tensor::from_vec(resized.into_raw(), (IMAGE_SIZE, IMAGE_SIZE, 3), &Device::Cpu)?
        .permute((2, 0, 1))?
        .to_dtype(DType::F32)?
        .affine(2. / 255., -1.)?
        .unsqueeze(0)?;
    Ok(tensor)
}

fn safetensors_files(model_dir: &Path) -> Result<Vec<PathBuf>, PaligemmaError> {
    let index_file = model_dir.join("model.safetensors.index.json");
    if index_file.is_file() {
        let index: serde_json::Value = serde_json::from_slice(&std::fs::read(&index_file)?)?;
        let shards: BTreeSet<&str> = index["weight_map"]
            .as_object()
            .map(|map| map.values().filter_map(|v| v.as_str()).collect())
            .unwrap_or_default();
        if shards.is_empty() {
            return Err(PaligemmaError::MissingFile(index_file));
        }
        return shards
            .into_iter()
            .map(|shard| {
                let path = model_dir.join(shard);
                if path.is_file() {
                    Ok(path)
                } else {
                    Err(PaligemmaError::MissingFile(path))
                }
            })
            .collect();
    }

    let single = model_dir.join("model.safetensors");
    if single.is_file() {
        Ok(vec![single])
    } else {
        Err(PaligemmaError::MissingFile(single))
    }
}

fn select_device(policy: DevicePolicy) -> Result<Device, PaligemmaError> {
    match policy {
        DevicePolicy::Cpu => Ok(Device::Cpu),
        DevicePolicy::Cuda(ordinal) => Ok(Device::new_cuda(ordinal)?),
        DevicePolicy::Auto => match Device::cuda_if_available(0) {
            Ok(device) => Ok(device),
            Err(e) => {
                log::warn!("CUDA not available, defaulting to CPU: {e}");
                Ok(Device::Cpu)
            }
        },
    }
}

// half precision matmuls are not supported on the CPU backend
fn effective_precision(requested: Precision, device: &Device) -> Precision {
    if device.is_cpu() && requested != Precision::F32 {
        log::warn!(
            "{} is not supported on CPU, loading weights as f32",
            requested.as_str()
        );
        return Precision::F32;
    }
    requested
}

fn device_label(device: &Device) -> &'static str {
    if device.is_cuda() {
        "cuda"
    } else if device.is_metal() {
        "metal"
    } else {
        "cpu"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::tiny_image;

    #[test]
    fn prompt_is_text_prefix_with_separator() {
        let messages = vec![ChatMessage::user_image_prompt(
            "cat.jpg",
            "Describe this image.",
        )];
        assert_eq!(render_prompt(&messages), "Describe this image.\n");
    }

    #[test]
    fn rows_are_left_padded() {
        let padded = pad_left(vec![vec![5, 6, 7], vec![8]], 0);
        assert_eq!(padded, vec![vec![5, 6, 7], vec![0, 0, 8]]);
        assert_eq!(pad_left(vec![vec![1, 2]], 0), vec![vec![1, 2]]);
    }

    #[test]
    fn image_tensor_is_normalized() -> Result<(), PaligemmaError> {
        let tensor = image_to_tensor(&tiny_image())?;
        assert_eq!(tensor.dims(), &[1, 3, IMAGE_SIZE, IMAGE_SIZE]);

        let values = tensor.flatten_all()?.to_vec1::<f32>()?;
        assert!(values.iter().all(|v| (-1.0..=1.0).contains(v)));
        // red channel of (200, 120, 40)
        assert!((values[0] - (200.0 * 2.0 / 255.0 - 1.0)).abs() < 1e-2);
        Ok(())
    }

    #[test]
    fn finds_single_and_sharded_weights() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            safetensors_files(dir.path()),
            Err(PaligemmaError::MissingFile(_))
        ));

        std::fs::write(dir.path().join("model.safetensors"), b"").unwrap();
        assert_eq!(
            safetensors_files(dir.path()).unwrap(),
            vec![dir.path().join("model.safetensors")]
        );

        let index = serde_json::json!({
            "weight_map": {
                "a": "model-00001-of-00002.safetensors",
                "b": "model-00002-of-00002.safetensors",
                "c": "model-00001-of-00002.safetensors",
            }
        });
        std::fs::write(
            dir.path().join("model.safetensors.index.json"),
            index.to_string(),
        )
        .unwrap();
        assert!(matches!(
            safetensors_files(dir.path()),
            Err(PaligemmaError::MissingFile(_))
        ));

        for shard in ["model-00001-of-00002.safetensors", "model-00002-of-00002.safetensors"] {
            std::fs::write(dir.path().join(shard), b"").unwrap();
        }
        assert_eq!(safetensors_files(dir.path()).unwrap().len(), 2);
    }

    #[test]
    fn cpu_forces_full_precision() {
        assert_eq!(effective_precision(Precision::F16, &Device::Cpu), Precision::F32);
        assert_eq!(effective_precision(Precision::F32, &Device::Cpu), Precision::F32);
        assert_eq!(device_label(&Device::Cpu), "cpu");
    }

    #[test]
    fn missing_tokenizer_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let err = PaligemmaModel::load(dir.path(), Precision::F32, DevicePolicy::Cpu).err();
        assert!(matches!(err, Some(PaligemmaError::MissingFile(_))));
    }
}
