use std::io::{self, Write};
use std::sync::Arc;

use futures::StreamExt;
use provider_gateway::core::types::{
    ChatRequest, GeneratedImage, ImageRequest, Message, MessageRole, Warning,
};
use provider_gateway::providers::cohere::CohereAdapter;
use provider_gateway::providers::deepl::DeepLAdapter;
use provider_gateway::providers::openai_compatible::OpenAiCompatibleAdapter;
use provider_gateway::providers::replicate::ReplicateAdapter;
use provider_gateway::streaming::StreamEvent;
use provider_gateway::streaming::sse::encode_frame;
use provider_gateway::{GatewayConfig, GatewayRuntime, RequestContext};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

const DEFAULT_LOG_FILTER: &str = "provider_gateway=info";

enum Command {
    Chat {
        model: String,
        prompt: String,
        sse: bool,
    },
    Image {
        model: String,
        prompt: String,
    },
}

struct CliArgs {
    command: Command,
    max_output_tokens: Option<u32>,
    metadata: Vec<(String, String)>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let _ = dotenvy::dotenv();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER)),
        )
        .with_writer(io::stderr)
        .init();

    let args = parse_args(std::env::args().skip(1).collect())?;
    let config = GatewayConfig::from_env()?;
    let runtime = build_runtime(config)?;

    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            on_interrupt.cancel();
        }
    });

    let mut ctx = RequestContext::new().with_cancel(cancel);
    for (key, value) in &args.metadata {
        ctx = ctx.with_metadata(key.clone(), value.clone());
    }

    match args.command {
        Command::Chat { model, prompt, sse } => {
            let mut request =
                ChatRequest::new(model, vec![Message::text(MessageRole::User, prompt)]);
            request.max_output_tokens = args.max_output_tokens;
            request.metadata = args.metadata.into_iter().collect();
            run_chat(&runtime, &request, &ctx, sse).await
        }
        Command::Image { model, prompt } => {
            run_image(&runtime, &ImageRequest::new(model, prompt), &ctx).await
        }
    }
}

async fn run_chat(
    runtime: &GatewayRuntime,
    request: &ChatRequest,
    ctx: &RequestContext,
    sse: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let mut events = runtime.chat_stream(request, ctx).await?;
    let mut stdout = io::stdout();

    while let Some(event) = events.next().await {
        if sse {
            stdout.write_all(encode_frame(&event)?.as_bytes())?;
            stdout.flush()?;
            continue;
        }

        match event {
            StreamEvent::TextDelta { text, .. } => {
                print!("{text}");
                stdout.flush()?;
            }
            StreamEvent::TextEnd { .. } => println!(),
            StreamEvent::ToolCall { tool_call } => {
                println!(
                    "[tool_call: id={}, name={}, args={}]",
                    tool_call.id, tool_call.name, tool_call.arguments_json
                );
            }
            StreamEvent::Finish {
                reason,
                usage,
                warnings,
            } => {
                eprintln!("[finish: reason={reason:?}, usage={usage:?}]");
                print_warnings(&warnings);
            }
            StreamEvent::Error { message } => {
                return Err(format!("stream failed: {message}").into());
            }
            StreamEvent::TextStart { .. } => {}
        }
    }

    if ctx.cancel.is_cancelled() {
        eprintln!("[canceled]");
    }
    Ok(())
}

async fn run_image(
    runtime: &GatewayRuntime,
    request: &ImageRequest,
    ctx: &RequestContext,
) -> Result<(), Box<dyn std::error::Error>> {
    let response = runtime.image(request, ctx).await?;

    for image in &response.images {
        match image {
            GeneratedImage::Url { url } => println!("{url}"),
            GeneratedImage::Base64 { media_type, data } => {
                println!("[inline {media_type}, {} base64 chars]", data.len());
            }
        }
    }
    print_warnings(&response.warnings);
    Ok(())
}

fn print_warnings(warnings: &[Warning]) {
    for warning in warnings {
        eprintln!(
            "warning: {:?} {}{}",
            warning.kind,
            warning.feature,
            warning
                .detail
                .as_deref()
                .map(|detail| format!(": {detail}"))
                .unwrap_or_default()
        );
    }
}

fn env_value(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .filter(|value| !value.trim().is_empty())
}

/// Registers every bundled adapter whose credential is present in the
/// environment.
fn build_runtime(config: GatewayConfig) -> Result<GatewayRuntime, Box<dyn std::error::Error>> {
    let mut builder = GatewayRuntime::builder();

    if let Some(key) = env_value("OPENAI_API_KEY") {
        builder = builder.with_adapter(Arc::new(OpenAiCompatibleAdapter::with_transport(
            Some(key),
            env_value("OPENAI_BASE_URL").unwrap_or_default(),
            config.http.build_transport()?,
        )));
    }
    if let Some(key) = env_value("REPLICATE_API_TOKEN") {
        builder = builder.with_adapter(Arc::new(
            ReplicateAdapter::with_transport(
                Some(key),
                env_value("REPLICATE_BASE_URL").unwrap_or_default(),
                config.http.build_transport()?,
                config.poll.clone(),
            )
            .map_err(|e| format!("failed to build Replicate adapter: {e}"))?,
        ));
    }
    if let Some(key) = env_value("COHERE_API_KEY") {
        builder = builder.with_adapter(Arc::new(CohereAdapter::with_transport(
            Some(key),
            env_value("COHERE_BASE_URL").unwrap_or_default(),
            config.http.build_transport()?,
        )));
    }
    if let Some(key) = env_value("DEEPL_API_KEY") {
        builder = builder.with_adapter(Arc::new(DeepLAdapter::with_transport(
            Some(key),
            env_value("DEEPL_BASE_URL").unwrap_or_default(),
            config.http.build_transport()?,
        )));
    }

    let runtime = builder.with_config(config).build()?;
    if runtime.registry().is_empty() {
        return Err(
            "no provider credentials found; set OPENAI_API_KEY, REPLICATE_API_TOKEN, COHERE_API_KEY or DEEPL_API_KEY"
                .into(),
        );
    }
    Ok(runtime)
}

fn parse_args(args: Vec<String>) -> Result<CliArgs, Box<dyn std::error::Error>> {
    let mut positional = Vec::new();
    let mut sse = false;
    let mut max_output_tokens = None;
    let mut metadata = Vec::new();

    let mut i = 0usize;
    while i < args.len() {
        match args[i].as_str() {
            "--sse" => {
                sse = true;
                i += 1;
            }
            "--max-output-tokens" => {
                let value = args
                    .get(i + 1)
                    .ok_or("missing value for --max-output-tokens")?;
                max_output_tokens = Some(
                    value
                        .parse::<u32>()
                        .map_err(|_| "--max-output-tokens must be a positive integer")?,
                );
                i += 2;
            }
            "--meta" => {
                let value = args.get(i + 1).ok_or("missing value for --meta")?;
                let (key, value) = value
                    .split_once('=')
                    .ok_or("--meta expects key=value")?;
                metadata.push((key.trim().to_string(), value.to_string()));
                i += 2;
            }
            "--help" | "-h" => {
                print_help();
                std::process::exit(0);
            }
            other if other.starts_with("--") => {
                return Err(format!("unknown argument: {other}").into());
            }
            other => {
                positional.push(other.to_string());
                i += 1;
            }
        }
    }

    let mut positional = positional.into_iter();
    let subcommand = positional.next().ok_or("missing command (chat|image)")?;
    let model = positional.next().ok_or("missing model id, e.g. openai/gpt-4.1-mini")?;
    let prompt = positional.collect::<Vec<_>>().join(" ");
    if prompt.trim().is_empty() {
        return Err("missing prompt".into());
    }

    let command = match subcommand.as_str() {
        "chat" => Command::Chat { model, prompt, sse },
        "image" => Command::Image { model, prompt },
        other => return Err(format!("unknown command: {other} (expected chat|image)").into()),
    };

    Ok(CliArgs {
        command,
        max_output_tokens,
        metadata,
    })
}

fn print_help() {
    println!(
        "Usage:\n  cargo run --bin gateway_cli -- chat <provider/model> <prompt> [--sse] [--max-output-tokens N] [--meta key=value]...\n  cargo run --bin gateway_cli -- image <provider/model> <prompt> [--meta key=value]...\n\nEnv:\n  OPENAI_API_KEY / REPLICATE_API_TOKEN / COHERE_API_KEY / DEEPL_API_KEY\n  OPENAI_BASE_URL / REPLICATE_BASE_URL / COHERE_BASE_URL / DEEPL_BASE_URL\n  GATEWAY_* runtime settings\n  RUST_LOG (default {DEFAULT_LOG_FILTER})\n\nExamples:\n  gateway_cli chat deepl/default \"Good morning\" --meta target_lang=DE\n  gateway_cli image replicate/black-forest-labs/flux-schnell \"a red kite\""
    );
}
