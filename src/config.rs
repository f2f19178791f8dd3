use crate::model::{DevicePolicy, Precision};
use std::path::PathBuf;

pub const DEFAULT_MODEL_PATH: &str = "models/paligemma-3b-mix-224";
pub const DEFAULT_UPLOAD_DIR: &str = "uploaded-images";
pub const DEFAULT_MAX_NEW_TOKENS: usize = 128;
pub const DEFAULT_QUEUE_CAPACITY: usize = 16;
pub const DEFAULT_MAX_UPLOAD_BYTES: usize = 32 * 1024 * 1024;

/// What happens to an uploaded image once its request has finished.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UploadRetention {
    /// Keep every stored upload on disk.
    Retain,
    /// Delete the stored upload after the response is built.
    Delete,
}

/// Settings shared by the server and the local runner.
#[derive(Clone, Debug)]
pub struct ServiceConfig {
    pub model_path: PathBuf,
    pub upload_dir: PathBuf,
    pub precision: Precision,
    pub device: DevicePolicy,
    pub max_new_tokens: usize,
    pub queue_capacity: usize,
    pub max_upload_bytes: usize,
    pub upload_retention: UploadRetention,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            model_path: PathBuf::from(DEFAULT_MODEL_PATH),
            upload_dir: PathBuf::from(DEFAULT_UPLOAD_DIR),
            precision: Precision::F16,
            device: DevicePolicy::Auto,
            max_new_tokens: DEFAULT_MAX_NEW_TOKENS,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            max_upload_bytes: DEFAULT_MAX_UPLOAD_BYTES,
            upload_retention: UploadRetention::Retain,
        }
    }
}
