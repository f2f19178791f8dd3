use serde::{Deserialize, Serialize};

/// Prompt used when the caller does not send one.
pub const DEFAULT_PROMPT: &str = "Describe this image.";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
}

/// One part of a multimodal chat turn.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ContentPart {
    /// An image reference: URL, data URI or filesystem path.
    Image { image: String },
    /// A video given as an ordered list of frame references.
    Video { video: Vec<String> },
    Text { text: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: Vec<ContentPart>,
}

impl ChatMessage {
    /// Builds the single user turn carrying one image and one text prompt.
    pub fn user_image_prompt(image_ref: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: vec![
                ContentPart::Image {
                    image: image_ref.into(),
                },
                ContentPart::Text {
                    text: prompt.into(),
                },
            ],
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DescribeUrlRequest {
    pub image_url: String,
    #[serde(default)]
    pub prompt_text: Option<String>,
}

/// Body returned by both describe endpoints.
///
/// Exactly one of `description` (non-empty) or `error` is meaningful.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct DescribeResponse {
    pub description: String,
    pub prompt_used: String,
    pub error: Option<String>,
}

impl DescribeResponse {
    pub fn success(description: String, prompt_used: String) -> Self {
        Self {
            description,
            prompt_used,
            error: None,
        }
    }

    pub fn failure(error: impl ToString, prompt_used: String) -> Self {
        Self {
            description: String::new(),
            prompt_used,
            error: Some(error.to_string()),
        }
    }
}

/// Resolves the prompt a request actually runs with.
pub fn effective_prompt(prompt_text: Option<String>) -> String {
    prompt_text.unwrap_or_else(|| DEFAULT_PROMPT.to_string())
}
