use argh::FromArgs;
use std::path::PathBuf;
use vlm_describe::messages::{DescribeResponse, DescribeUrlRequest};

// defaults for the client
const DEFAULT_HOST: &str = "localhost";
const DEFAULT_PORT: u16 = 8000;

#[derive(FromArgs)]
/// Client for the image description service
struct ClientArgs {
    /// the host to connect to
    #[argh(option, short = 'h', default = "DEFAULT_HOST.to_string()")]
    host: String,

    /// the port to connect to
    #[argh(option, short = 'p', default = "DEFAULT_PORT")]
    port: u16,

    /// command to execute: "url" or "upload"
    #[argh(subcommand)]
    command: ClientCommands,
}

#[derive(FromArgs)]
#[argh(subcommand)]
enum ClientCommands {
    Url(UrlCommand),
    Upload(UploadCommand),
}

#[derive(FromArgs)]
/// Describe a remote image
#[argh(subcommand, name = "url")]
struct UrlCommand {
    /// the URL of the image
    #[argh(option, short = 'u')]
    image_url: String,

    /// the prompt to use
    #[argh(option)]
    prompt: Option<String>,
}

#[derive(FromArgs)]
/// Upload a local image and describe it
#[argh(subcommand, name = "upload")]
struct UploadCommand {
    /// the path to the image
    #[argh(option, short = 'i')]
    image_path: PathBuf,

    /// the prompt to use
    #[argh(option)]
    prompt: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args: ClientArgs = argh::from_env();

    let client = reqwest::Client::new();

    // format the host and port
    let addr = format!("{}:{}", args.host, args.port);

    let response = match args.command {
        ClientCommands::Url(command) => {
            client
                .post(format!("http://{}/describe_url/", addr))
                .json(&DescribeUrlRequest {
                    image_url: command.image_url,
                    prompt_text: command.prompt,
                })
                .send()
                .await?
        }
        ClientCommands::Upload(command) => {
            let filename = command
                .image_path
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_else(|| "image".to_string());
            let bytes = tokio::fs::read(&command.image_path).await?;

            let mut form = reqwest::multipart::Form::new()
                .part("image", reqwest::multipart::Part::bytes(bytes).file_name(filename));
            if let Some(prompt) = command.prompt {
                form = form.text("prompt_text", prompt);
            }

            client
                .post(format!("http://{}/describe_upload/", addr))
                .multipart(form)
                .send()
                .await?
        }
    };

    let result = response.json::<DescribeResponse>().await?;
    println!("Result: {}", serde_json::to_string_pretty(&result)?);

    Ok(())
}
