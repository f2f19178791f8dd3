//! Test doubles shared by the unit tests.

use crate::{
    messages::{ChatMessage, ContentPart},
    model::{BatchInputs, DecodeOptions, ModelInfo, Precision, VideoFrames, VisionLanguageModel},
};
use image::{ImageFormat, Rgb, RgbImage};
use std::{
    io::Cursor,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

const EOS_TOKEN: u32 = 0;

#[derive(thiserror::Error, Debug)]
#[error("{0}")]
pub(crate) struct ScriptedError(pub String);

pub(crate) struct ScriptedInputs {
    input_ids: Vec<Vec<u32>>,
}

impl BatchInputs for ScriptedInputs {
    fn input_ids(&self) -> &[Vec<u32>] {
        &self.input_ids
    }
}

/// A byte-level "model" that always answers with the same text.
///
/// Every byte is one token and token `0` is the end-of-sequence marker.
pub(crate) struct ScriptedModel {
    reply: Result<String, String>,
    latency: Duration,
    active: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
}

impl ScriptedModel {
    pub(crate) fn answering(reply: &str) -> Self {
        Self::with_reply(Ok(reply.to_string()))
    }

    pub(crate) fn failing(message: &str) -> Self {
        Self::with_reply(Err(message.to_string()))
    }

    fn with_reply(reply: Result<String, String>) -> Self {
        Self {
            reply,
            latency: Duration::from_millis(5),
            active: Arc::new(AtomicUsize::new(0)),
            peak: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Makes every generate call take `latency`.
    pub(crate) fn slow(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Highest number of generate calls ever observed running at once.
    pub(crate) fn peak_concurrency(&self) -> Arc<AtomicUsize> {
        self.peak.clone()
    }
}

impl VisionLanguageModel for ScriptedModel {
    type Inputs = ScriptedInputs;
    type Error = ScriptedError;

    fn info(&self) -> ModelInfo {
        ModelInfo {
            name: "scripted".to_string(),
            device: "cpu".to_string(),
            precision: Precision::F32,
        }
    }

    fn render_prompt(&self, messages: &[ChatMessage]) -> Result<String, Self::Error> {
        let mut rendered = String::new();
        for message in messages {
            rendered.push_str("<|user|>");
            for part in &message.content {
                match part {
                    ContentPart::Image { .. } => rendered.push_str("<image>"),
                    ContentPart::Video { .. } => rendered.push_str("<video>"),
                    ContentPart::Text { text } => rendered.push_str(text),
                }
            }
            rendered.push_str("<|end|>\n");
        }
        rendered.push_str("<|assistant|>\n");
        Ok(rendered)
    }

    fn prepare_inputs(
        &self,
        texts: &[String],
        images: Vec<RgbImage>,
        _videos: Vec<VideoFrames>,
    ) -> Result<Self::Inputs, Self::Error> {
        if images.len() != texts.len() {
            return Err(ScriptedError(format!(
                "expected one image per prompt, got {}",
                images.len()
            )));
        }
        let input_ids = texts
            .iter()
            .map(|text| text.bytes().map(u32::from).collect())
            .collect();
        Ok(ScriptedInputs { input_ids })
    }

    fn to_device(&self, inputs: Self::Inputs) -> Result<Self::Inputs, Self::Error> {
        Ok(inputs)
    }

    fn generate(
        &mut self,
        inputs: &Self::Inputs,
        max_new_tokens: usize,
    ) -> Result<Vec<Vec<u32>>, Self::Error> {
        let running = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(running, Ordering::SeqCst);
        std::thread::sleep(self.latency);
        self.active.fetch_sub(1, Ordering::SeqCst);

        let reply = self.reply.clone().map_err(ScriptedError)?;
        let mut new_tokens: Vec<u32> = reply.bytes().map(u32::from).collect();
        if new_tokens.len() < max_new_tokens {
            new_tokens.push(EOS_TOKEN);
        }
        new_tokens.truncate(max_new_tokens);

        Ok(inputs
            .input_ids
            .iter()
            .map(|ids| ids.iter().chain(&new_tokens).copied().collect())
            .collect())
    }

    fn batch_decode(
        &self,
        sequences: &[Vec<u32>],
        options: DecodeOptions,
    ) -> Result<Vec<String>, Self::Error> {
        Ok(sequences
            .iter()
            .map(|ids| {
                let bytes: Vec<u8> = ids
                    .iter()
                    .filter(|&&id| !(options.skip_special_tokens && id == EOS_TOKEN))
                    .map(|&id| id as u8)
                    .collect();
                String::from_utf8_lossy(&bytes).into_owned()
            })
            .collect())
    }
}

pub(crate) fn tiny_image() -> RgbImage {
    RgbImage::from_pixel(4, 4, Rgb([200, 120, 40]))
}

pub(crate) fn tiny_png() -> Vec<u8> {
    let mut buf = Cursor::new(Vec::new());
    tiny_image()
        .write_to(&mut buf, ImageFormat::Png)
        .expect("encode png");
    buf.into_inner()
}
