use argh::FromArgs;
use std::{path::PathBuf, sync::Arc};
use vlm_describe::{
    Describer, DevicePolicy, EngineSlot, PaligemmaModel, Precision, ServiceConfig,
    UploadRetention, config, lifecycle,
    server::{self, AppState},
    upload::UploadStore,
};

// defaults for the server
const DEFAULT_HOST: &str = "0.0.0.0";
const DEFAULT_PORT: u16 = 8000;

#[derive(FromArgs)]
/// HTTP service describing images with a vision-language model.
struct ServerArgs {
    /// the host to run the server on
    #[argh(option, short = 'h', default = "DEFAULT_HOST.to_string()")]
    host: String,

    /// the port to run the server on
    #[argh(option, short = 'p', default = "DEFAULT_PORT")]
    port: u16,

    /// local directory holding the model weights and tokenizer
    #[argh(option, default = "PathBuf::from(config::DEFAULT_MODEL_PATH)")]
    model_path: PathBuf,

    /// directory receiving uploaded images
    #[argh(option, default = "PathBuf::from(config::DEFAULT_UPLOAD_DIR)")]
    upload_dir: PathBuf,

    /// weight precision: f16, bf16 or f32
    #[argh(option, default = "Precision::F16")]
    precision: Precision,

    /// device placement: auto, cpu, cuda or cuda:N
    #[argh(option, default = "DevicePolicy::Auto")]
    device: DevicePolicy,

    /// maximum number of newly generated tokens per request
    #[argh(option, default = "config::DEFAULT_MAX_NEW_TOKENS")]
    max_new_tokens: usize,

    /// number of requests allowed to wait for the model
    #[argh(option, default = "config::DEFAULT_QUEUE_CAPACITY")]
    queue_capacity: usize,

    /// maximum accepted request body or fetched image size in bytes
    #[argh(option, default = "config::DEFAULT_MAX_UPLOAD_BYTES")]
    max_upload_bytes: usize,

    /// delete uploaded images once their request is answered
    #[argh(switch)]
    delete_uploads: bool,

    /// exit instead of serving when the model fails to load
    #[argh(switch)]
    strict: bool,
}

impl ServerArgs {
    fn service_config(&self) -> ServiceConfig {
        ServiceConfig {
            model_path: self.model_path.clone(),
            upload_dir: self.upload_dir.clone(),
            precision: self.precision,
            device: self.device,
            max_new_tokens: self.max_new_tokens,
            queue_capacity: self.queue_capacity,
            max_upload_bytes: self.max_upload_bytes,
            upload_retention: if self.delete_uploads {
                UploadRetention::Delete
            } else {
                UploadRetention::Retain
            },
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    let args: ServerArgs = argh::from_env();
    let config = args.service_config();

    // format the host and port
    let addr = format!("{}:{}", args.host, args.port);

    let uploads = UploadStore::prepare(&config.upload_dir, config.upload_retention).await?;

    let slot = if args.strict {
        EngineSlot::loaded(lifecycle::try_initialize(&config, PaligemmaModel::load)?)
    } else {
        lifecycle::initialize(&config, PaligemmaModel::load)
    };

    let app = server::router(
        AppState {
            describer: Describer::new(slot).with_max_image_bytes(config.max_upload_bytes),
            uploads: Arc::new(uploads),
        },
        config.max_upload_bytes,
    );

    log::info!("🚀 Starting the server");
    log::info!("🔥 Listening on: {}", addr);
    log::info!("📁 Uploads stored in: {}", config.upload_dir.display());
    log::info!("🔧 Press Ctrl+C to stop the server");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                log::error!("Failed to listen for Ctrl+C: {e}");
            }
        })
        .await?;

    Ok(())
}
