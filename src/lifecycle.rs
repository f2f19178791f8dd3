use crate::{
    config::ServiceConfig,
    engine::InferenceEngine,
    error::LoadError,
    model::{DevicePolicy, Precision, VisionLanguageModel},
};
use std::{path::Path, sync::Arc};

/// Holds the one engine of the process, or nothing if loading failed.
///
/// Built once at startup and handed to the request handlers; it is never
/// replaced afterwards.
#[derive(Clone, Default)]
pub struct EngineSlot(Option<Arc<InferenceEngine>>);

impl EngineSlot {
    pub fn empty() -> Self {
        Self(None)
    }

    pub fn loaded(engine: InferenceEngine) -> Self {
        Self(Some(Arc::new(engine)))
    }

    pub fn engine(&self) -> Option<&InferenceEngine> {
        self.0.as_deref()
    }

    pub fn is_available(&self) -> bool {
        self.0.is_some()
    }
}

/// Loads the model and starts its inference thread.
pub fn try_initialize<M, E, F>(config: &ServiceConfig, load: F) -> Result<InferenceEngine, LoadError>
where
    M: VisionLanguageModel + Send + 'static,
    E: std::error::Error + Send + Sync + 'static,
    F: FnOnce(&Path, Precision, DevicePolicy) -> Result<M, E>,
{
    if !config.model_path.is_dir() {
        return Err(LoadError::NotADirectory(config.model_path.clone()));
    }

    let model = load(&config.model_path, config.precision, config.device)
        .map_err(|e| LoadError::Backend(Box::new(e)))?;

    let info = model.info();
    log::info!(
        "Model and processor loaded on {} ({})",
        info.device,
        info.precision.as_str()
    );

    Ok(InferenceEngine::new(
        model,
        config.queue_capacity,
        config.max_new_tokens,
    ))
}

/// Loads the model, or logs why it could not and starts degraded.
///
/// In degraded mode every describe request is answered as unavailable.
/// Loading is never retried.
pub fn initialize<M, E, F>(config: &ServiceConfig, load: F) -> EngineSlot
where
    M: VisionLanguageModel + Send + 'static,
    E: std::error::Error + Send + Sync + 'static,
    F: FnOnce(&Path, Precision, DevicePolicy) -> Result<M, E>,
{
    log::info!("Loading model from {}", config.model_path.display());
    match try_initialize(config, load) {
        Ok(engine) => EngineSlot::loaded(engine),
        Err(e) => {
            log::error!("{e}; describe requests will report the model as unavailable");
            EngineSlot::empty()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{ScriptedError, ScriptedModel};

    fn config_for(path: &Path) -> ServiceConfig {
        ServiceConfig {
            model_path: path.to_path_buf(),
            ..ServiceConfig::default()
        }
    }

    #[test]
    fn missing_directory_leaves_slot_empty() {
        let config = config_for(Path::new("/definitely/not/a/model"));
        let slot = initialize(&config, |_, _, _| {
            Ok::<_, ScriptedError>(ScriptedModel::answering("unused"))
        });
        assert!(!slot.is_available());
    }

    #[test]
    fn missing_directory_is_reported_before_loading() {
        let config = config_for(Path::new("/definitely/not/a/model"));
        let mut called = false;
        let result = try_initialize(&config, |_, _, _| {
            called = true;
            Ok::<_, ScriptedError>(ScriptedModel::answering("unused"))
        });
        assert!(matches!(result, Err(LoadError::NotADirectory(_))));
        assert!(!called);
    }

    #[test]
    fn loader_failure_leaves_slot_empty() {
        let dir = tempfile::tempdir().unwrap();
        let slot = initialize(&config_for(dir.path()), |_, _, _| {
            Err::<ScriptedModel, _>(ScriptedError("incompatible weights".into()))
        });
        assert!(!slot.is_available());
    }

    #[test]
    fn loader_receives_configured_options() {
        let dir = tempfile::tempdir().unwrap();
        let config = ServiceConfig {
            precision: Precision::Bf16,
            device: DevicePolicy::Cpu,
            ..config_for(dir.path())
        };
        let slot = initialize(&config, |path, precision, device| {
            assert_eq!(path, dir.path());
            assert_eq!(precision, Precision::Bf16);
            assert_eq!(device, DevicePolicy::Cpu);
            Ok::<_, ScriptedError>(ScriptedModel::answering("A cat."))
        });
        assert!(slot.is_available());
    }
}
