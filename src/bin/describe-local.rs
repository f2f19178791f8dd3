use argh::FromArgs;
use std::path::PathBuf;
use vlm_describe::{
    Describer, DevicePolicy, EngineSlot, PaligemmaModel, Precision, ServiceConfig, config,
    lifecycle, messages::DEFAULT_PROMPT,
};

#[derive(FromArgs)]
/// Describe one local image without starting the server.
struct LocalArgs {
    /// local directory holding the model weights and tokenizer
    #[argh(option, default = "PathBuf::from(config::DEFAULT_MODEL_PATH)")]
    model_path: PathBuf,

    /// the path to the image
    #[argh(option, short = 'i', default = "PathBuf::from(\"uploaded-images/brocock.jpg\")")]
    image: PathBuf,

    /// the prompt to use
    #[argh(option, short = 'p', default = "DEFAULT_PROMPT.to_string()")]
    prompt: String,

    /// weight precision: f16, bf16 or f32
    #[argh(option, default = "Precision::F16")]
    precision: Precision,

    /// device placement: auto, cpu, cuda or cuda:N
    #[argh(option, default = "DevicePolicy::Auto")]
    device: DevicePolicy,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    let args: LocalArgs = argh::from_env();

    let config = ServiceConfig {
        model_path: args.model_path,
        precision: args.precision,
        device: args.device,
        ..ServiceConfig::default()
    };

    let engine = lifecycle::try_initialize(&config, PaligemmaModel::load)?;
    let describer = Describer::new(EngineSlot::loaded(engine));

    let description = describer
        .describe(&args.image.to_string_lossy(), &args.prompt)
        .await?;
    println!("{description}");

    Ok(())
}
