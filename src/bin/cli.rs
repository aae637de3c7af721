use anyhow::{anyhow, bail, Context, Result};
use crabwhip::config::CaptureBackend;
use crabwhip::peer::RtcPeerFactory;
use crabwhip::testing::SyntheticDevices;
use crabwhip::{
    bearer_token_from_path, subscribe_url, ControllerOptions, MediaDevices, PublishController,
    PublisherConfig,
};
use std::env;
use std::sync::Arc;

const USAGE: &str = "Usage: crabwhip-cli <command> [args]

Commands:
  publish <path> [--query <qs>] [--config <file>] [--display] [--synthetic] [--json]
  token <path> [--config <file>]
  subscribe-url <url> [--config <file>]";

#[tokio::main]
async fn main() -> Result<()> {
    crabwhip::init_logging();

    let args: Vec<String> = env::args().collect();
    if args.len() < 2 {
        eprintln!("{}", USAGE);
        std::process::exit(1);
    }

    let command = &args[1];
    match command.as_str() {
        "publish" => cmd_publish(&args).await,
        "token" => cmd_token(&args),
        "subscribe-url" => cmd_subscribe_url(&args),
        "--help" | "-h" | "help" => {
            println!("{}", USAGE);
            Ok(())
        }
        _ => {
            eprintln!("Unknown command: {}\n\n{}", command, USAGE);
            std::process::exit(1);
        }
    }
}

#[derive(Debug, Default)]
struct PublishArgs {
    path: Option<String>,
    query: Option<String>,
    config: Option<String>,
    display: bool,
    synthetic: bool,
    json: bool,
}

fn parse_args(args: &[String]) -> Result<PublishArgs> {
    let mut parsed = PublishArgs::default();

    let mut i = 2;
    while i < args.len() {
        match args[i].as_str() {
            "--query" => {
                i += 1;
                parsed.query = Some(args.get(i).cloned().ok_or_else(|| anyhow!("--query needs a value"))?);
            }
            "--config" => {
                i += 1;
                parsed.config = Some(args.get(i).cloned().ok_or_else(|| anyhow!("--config needs a value"))?);
            }
            "--display" => parsed.display = true,
            "--synthetic" => parsed.synthetic = true,
            "--json" => parsed.json = true,
            other => {
                if parsed.path.is_none() {
                    parsed.path = Some(other.to_string());
                } else {
                    bail!("Unexpected argument: {}", other);
                }
            }
        }
        i += 1;
    }

    Ok(parsed)
}

fn load_config(path: Option<&str>) -> Result<PublisherConfig> {
    let path = path.map(str::to_string).or_else(|| {
        let default = PublisherConfig::default_path();
        default.exists().then(|| default.to_string_lossy().into_owned())
    });
    PublisherConfig::load(path.as_deref()).context("Failed to load configuration")
}

fn select_devices(backend: CaptureBackend) -> Result<Arc<dyn MediaDevices>> {
    match backend {
        CaptureBackend::Synthetic => Ok(Arc::new(SyntheticDevices::new())),
        #[cfg(feature = "native-capture")]
        CaptureBackend::Native => Ok(Arc::new(crabwhip::capture::native::NativeDevices::new())),
        #[cfg(not(feature = "native-capture"))]
        CaptureBackend::Native => bail!("native capture requires the `native-capture` feature"),
    }
}

async fn cmd_publish(args: &[String]) -> Result<()> {
    let parsed = parse_args(args)?;
    let path = parsed.path.clone().ok_or_else(|| anyhow!("path required\n\n{}", USAGE))?;

    let config = load_config(parsed.config.as_deref())?;
    let query = parsed
        .query
        .clone()
        .unwrap_or_else(|| config.capture.default_query.clone());

    let mut options = ControllerOptions::from_config(&config, &query);
    if parsed.display {
        options.settings.use_display_capture = true;
    }

    let backend = if parsed.synthetic {
        CaptureBackend::Synthetic
    } else {
        config.capture.backend
    };
    let devices = select_devices(backend)?;
    let controller = PublishController::new(options, devices, Arc::new(RtcPeerFactory::default()));

    let (stop_tx, mut stop_rx) = tokio::sync::mpsc::unbounded_channel();
    ctrlc::set_handler(move || {
        let _ = stop_tx.send(());
    })
    .context("Failed to install Ctrl-C handler")?;

    let mut status_rx = controller.subscribe();
    let json = parsed.json;
    let watcher = tokio::spawn(async move {
        while status_rx.changed().await.is_ok() {
            let status = status_rx.borrow_and_update().clone();
            if json {
                match serde_json::to_string(&status) {
                    Ok(line) => println!("{}", line),
                    Err(e) => eprintln!("Failed to encode status: {}", e),
                }
            } else {
                match &status.error {
                    Some(error) => println!("{:?}: {} ({})", status.state, error, error.name()),
                    None => println!("{:?}", status.state),
                }
            }
        }
    });

    let session_id = controller.start(&path).await?;
    log::info!("Publishing {} as session {}", path, session_id);

    let _ = stop_rx.recv().await;
    println!("Stopping...");
    controller.stop().await;
    controller.join_attempts().await;
    watcher.abort();

    Ok(())
}

fn cmd_token(args: &[String]) -> Result<()> {
    let parsed = parse_args(args)?;
    let path = parsed.path.ok_or_else(|| anyhow!("Usage: crabwhip-cli token <path>"))?;
    let config = load_config(parsed.config.as_deref())?;

    println!("{}", bearer_token_from_path(&path, &config.auth.publish_segment));
    Ok(())
}

fn cmd_subscribe_url(args: &[String]) -> Result<()> {
    let parsed = parse_args(args)?;
    let url = parsed
        .path
        .ok_or_else(|| anyhow!("Usage: crabwhip-cli subscribe-url <url>"))?;
    let config = load_config(parsed.config.as_deref())?;

    println!("{}", subscribe_url(&url, &config.auth.publish_segment));
    Ok(())
}
