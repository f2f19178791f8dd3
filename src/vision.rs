use crate::{
    messages::{ChatMessage, ContentPart},
    model::VideoFrames,
};
use base64::{Engine, engine::general_purpose::STANDARD};
use image::RgbImage;
use std::path::PathBuf;

#[derive(thiserror::Error, Debug)]
pub enum VisionError {
    #[error("failed to fetch image '{url}': {source}")]
    Fetch {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("failed to read image '{}': {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid base64 image data: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("failed to decode image: {0}")]
    Decode(#[from] image::ImageError),

    #[error("image '{url}' exceeds the {limit} byte limit")]
    TooLarge { url: String, limit: usize },

    #[error("unsupported image reference: {0}")]
    Unsupported(String),
}

/// Decoded visual inputs of a conversation, in message order.
#[derive(Debug, Default)]
pub struct VisionInputs {
    pub images: Vec<RgbImage>,
    pub videos: Vec<VideoFrames>,
}

/// Resolves image references into raw bytes.
///
/// Remote images larger than `max_bytes` are refused while streaming.
#[derive(Clone)]
pub struct ImageFetcher {
    client: reqwest::Client,
    max_bytes: usize,
}

impl ImageFetcher {
    pub fn new(max_bytes: usize) -> Self {
        Self {
            client: reqwest::Client::new(),
            max_bytes,
        }
    }

    async fn fetch_remote(&self, url: &str) -> Result<Vec<u8>, VisionError> {
        let fetch_error = |source| VisionError::Fetch {
            url: url.to_string(),
            source,
        };
        let too_large = || VisionError::TooLarge {
            url: url.to_string(),
            limit: self.max_bytes,
        };

        let mut response = self
            .client
            .get(url)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(fetch_error)?;

        if response
            .content_length()
            .is_some_and(|len| len > self.max_bytes as u64)
        {
            return Err(too_large());
        }

        let mut bytes = Vec::new();
        while let Some(chunk) = response.chunk().await.map_err(fetch_error)? {
            if bytes.len() + chunk.len() > self.max_bytes {
                return Err(too_large());
            }
            bytes.extend_from_slice(&chunk);
        }
        Ok(bytes)
    }
}

/// Loads every image and video referenced by `messages`.
///
/// References may be `http(s)://` URLs, `data:image/...;base64,` URIs,
/// `file://` URIs or plain filesystem paths.
pub async fn process_vision_info(
    fetcher: &ImageFetcher,
    messages: &[ChatMessage],
) -> Result<VisionInputs, VisionError> {
    let mut inputs = VisionInputs::default();

    for part in messages.iter().flat_map(|m| &m.content) {
        match part {
            ContentPart::Image { image } => {
                inputs.images.push(load_image(fetcher, image).await?);
            }
            ContentPart::Video { video } => {
                let mut frames = Vec::with_capacity(video.len());
                for frame in video {
                    frames.push(load_image(fetcher, frame).await?);
                }
                inputs.videos.push(frames);
            }
            ContentPart::Text { .. } => {}
        }
    }

    Ok(inputs)
}

async fn load_image(fetcher: &ImageFetcher, reference: &str) -> Result<RgbImage, VisionError> {
    let bytes = read_image_bytes(fetcher, reference).await?;
    Ok(image::load_from_memory(&bytes)?.to_rgb8())
}

async fn read_image_bytes(
    fetcher: &ImageFetcher,
    reference: &str,
) -> Result<Vec<u8>, VisionError> {
    if reference.starts_with("http://") || reference.starts_with("https://") {
        return fetcher.fetch_remote(reference).await;
    }

    if let Some(data) = reference.strip_prefix("data:") {
        let (_, payload) = data
            .split_once(";base64,")
            .ok_or_else(|| VisionError::Unsupported("data URI without base64 payload".into()))?;
        return Ok(STANDARD.decode(payload.trim())?);
    }

    let path = PathBuf::from(reference.strip_prefix("file://").unwrap_or(reference));
    tokio::fs::read(&path)
        .await
        .map_err(|source| VisionError::Read { path, source })
}
