use crate::{
    config::DEFAULT_MAX_UPLOAD_BYTES,
    error::DescribeError,
    lifecycle::EngineSlot,
    messages::ChatMessage,
    model::{BatchInputs, DecodeOptions, VisionLanguageModel},
    vision::{self, ImageFetcher, VisionInputs},
};

/// Returned when the model produces no text at all.
pub const FALLBACK_DESCRIPTION: &str = "Unable to generate a description.";

const DECODE_OPTIONS: DecodeOptions = DecodeOptions {
    skip_special_tokens: true,
};

/// Everything the inference thread needs to answer one request.
pub struct DescriptionJob {
    pub messages: Vec<ChatMessage>,
    pub vision: VisionInputs,
}

/// Entry point for describe requests, shared by every HTTP handler.
#[derive(Clone)]
pub struct Describer {
    slot: EngineSlot,
    fetcher: ImageFetcher,
}

impl Describer {
    pub fn new(slot: EngineSlot) -> Self {
        Self {
            slot,
            fetcher: ImageFetcher::new(DEFAULT_MAX_UPLOAD_BYTES),
        }
    }

    /// Caps the size of images fetched from remote URLs.
    pub fn with_max_image_bytes(mut self, max_bytes: usize) -> Self {
        self.fetcher = ImageFetcher::new(max_bytes);
        self
    }

    pub fn slot(&self) -> &EngineSlot {
        &self.slot
    }

    /// Describes the image behind `image_ref` (URL, data URI or path)
    /// following `prompt`.
    pub async fn describe(&self, image_ref: &str, prompt: &str) -> Result<String, DescribeError> {
        let engine = self.slot.engine().ok_or(DescribeError::EngineUnavailable)?;

        let messages = vec![ChatMessage::user_image_prompt(image_ref, prompt)];
        let vision = vision::process_vision_info(&self.fetcher, &messages)
            .await
            .map_err(|e| DescribeError::InferenceFailed(e.to_string()))?;

        engine.submit(DescriptionJob { messages, vision }).await
    }
}

/// Runs one job against the model. Called on the inference thread.
pub(crate) fn run_description<M: VisionLanguageModel>(
    model: &mut M,
    job: DescriptionJob,
    max_new_tokens: usize,
) -> Result<String, DescribeError> {
    let failed = |e: M::Error| DescribeError::InferenceFailed(e.to_string());

    let text = model.render_prompt(&job.messages).map_err(failed)?;
    let inputs = model
        .prepare_inputs(&[text], job.vision.images, job.vision.videos)
        .map_err(failed)?;
    let inputs = model.to_device(inputs).map_err(failed)?;

    let generated = model.generate(&inputs, max_new_tokens).map_err(failed)?;
    let trimmed = trim_prompt_tokens(inputs.input_ids(), generated);

    let decoded = model
        .batch_decode(&trimmed, DECODE_OPTIONS)
        .map_err(failed)?;

    Ok(decoded
        .into_iter()
        .next()
        .filter(|text| !text.trim().is_empty())
        .unwrap_or_else(|| FALLBACK_DESCRIPTION.to_string()))
}

/// Drops from every generated sequence the leading tokens that echo its
/// input, leaving only the continuation.
pub fn trim_prompt_tokens(inputs: &[Vec<u32>], generated: Vec<Vec<u32>>) -> Vec<Vec<u32>> {
    inputs
        .iter()
        .zip(generated)
        .map(|(input, mut output)| {
            let echoed = input.len().min(output.len());
            output.split_off(echoed)
        })
        .collect()
}
