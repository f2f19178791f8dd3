//! Image description service backed by a pretrained vision-language model.
//!
//! The model is loaded once at startup into an [`EngineSlot`] and moved onto
//! a dedicated inference thread ([`InferenceEngine`]). Describe requests,
//! whether they carry an image URL or an uploaded file, are normalized into a
//! single chat turn and answered by [`Describer::describe`].

pub mod config;
pub mod describe;
pub mod engine;
pub mod error;
pub mod lifecycle;
pub mod messages;
pub mod model;
pub mod paligemma;
pub mod server;
pub mod upload;
pub mod vision;

#[cfg(test)]
mod testing;

pub use config::{ServiceConfig, UploadRetention};
pub use describe::Describer;
pub use engine::{InferenceEngine, InferenceEngineState};
pub use error::{DescribeError, LoadError};
pub use lifecycle::EngineSlot;
pub use model::{DevicePolicy, ModelInfo, Precision, VisionLanguageModel};
pub use paligemma::PaligemmaModel;
