mod args;

use std::env;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn, Level};
use wardrobe_queue::caller::ExternalCaller;
use wardrobe_queue::config::Config;
use wardrobe_queue::openai::OpenAiClient;
use wardrobe_queue::pipeline::{Services, UploadPipeline};
use wardrobe_queue::queue::JobQueue;
use wardrobe_queue::rate_limiter::RateLimiter;
use wardrobe_queue::server::ControlServer;
use wardrobe_queue::status::StatusStore;
use wardrobe_queue::storage::{JsonlItemStore, LocalBlobStore};

use crate::args::Args;

const API_KEY_VAR: &str = "OPENAI_API_KEY";

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let args = Args::parse();

    // Logging
    if args.debug {
        tracing_subscriber::fmt()
            .with_max_level(Level::TRACE)
            .init();
    } else {
        tracing_subscriber::fmt().json().init();
    }

    let api_key = match env::var(API_KEY_VAR) {
        Ok(key) if !key.trim().is_empty() => key,
        _ => {
            error!(var = API_KEY_VAR, "unsupported configuration: no API key");
            return ExitCode::from(2);
        },
    };

    let config = match load_config(&args) {
        Ok(config) => config,
        Err(error) => {
            error!(error = format!("{error:#}"), "unsupported configuration");
            return ExitCode::from(2);
        },
    };

    // Cancellation and termination channel. Connection tasks and the limiter
    // cleanup hold a sender until they finish.
    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if let Err(error) = signal::ctrl_c().await {
                warn!(%error, "something strange with ctrl-c handling!");
            };
            info!("shutting down");
            cancel.cancel();
        });
    }

    if let Err(error) = run(args, config, api_key, cancel).await {
        error!(error = format!("{error:#}"), "encountered runtime error");
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}

/// Serves until `cancel` fires or startup fails, then waits for every task
/// holding the shutdown channel to finish.
async fn run(
    args: Args,
    config: Config,
    api_key: String,
    cancel: CancellationToken,
) -> Result<()> {
    let (shutdown_hold, mut shutdown_wait) = mpsc::channel::<()>(1);

    let ret = begin(args, config, api_key, cancel.clone(), shutdown_hold).await;

    // A failed begin leaves nothing to wait for but background tasks.
    cancel.cancel();
    shutdown_wait.recv().await;

    ret
}

fn load_config(args: &Args) -> Result<Config> {
    let mut config = match &args.config {
        Some(path) => Config::from_yaml_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => Config::default(),
    };

    if let Some(max) = args.max_image_size {
        config.queue.max_image_size = max;
    }
    config.validate()?;

    Ok(config)
}

async fn begin(
    args: Args,
    config: Config,
    api_key: String,
    cancel: CancellationToken,
    shutdown_hold: mpsc::Sender<()>,
) -> Result<()> {
    // Bind first: nothing has been spawned yet if this fails.
    let listener = TcpListener::bind((args.listen, args.port))
        .await
        .context("binding control port")?;

    let limiter = Arc::new(RateLimiter::new(config.rate_limit.clone()));
    let cleanup = limiter.spawn_cleanup(cancel.clone());
    {
        let hold = shutdown_hold.clone();
        tokio::spawn(async move {
            if let Err(error) = cleanup.await {
                warn!(%error, "rate limiter cleanup task failed");
            }
            drop(hold);
        });
    }

    let openai = Arc::new(OpenAiClient::new(api_key, config.openai.clone()));
    let services = Services {
        vision: openai.clone(),
        generator: openai,
        blobs: Arc::new(LocalBlobStore::new(
            &args.blob_dir,
            args.public_base_url.as_str(),
        )),
        items: Arc::new(JsonlItemStore::new(&args.records_file)),
    };

    let caller =
        ExternalCaller::new(Arc::clone(&limiter), config.queue.retry.clone());
    let pipeline = UploadPipeline::new(caller, services);
    let queue = JobQueue::new(pipeline, config.queue, cancel.clone());
    let status = StatusStore::new(queue.clone(), limiter);

    info!(
        blob_dir = %args.blob_dir.display(),
        records_file = %args.records_file.display(),
        max_calls_per_window = config.rate_limit.max_calls_per_window,
        window_secs = config.rate_limit.window.as_secs(),
        "starting upload queue"
    );

    ControlServer::new(queue, status)
        .serve(listener, cancel, shutdown_hold)
        .await
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::time::timeout;

    use super::*;

    fn args_for(port: u16) -> Args {
        let port = port.to_string();
        Args::parse_from(["wqueue", "--port", port.as_str()])
    }

    #[tokio::test]
    async fn test_bind_failure_exits() {
        let taken = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = taken.local_addr().unwrap().port();

        let ret = timeout(
            Duration::from_secs(5),
            run(
                args_for(port),
                Config::default(),
                "key".into(),
                CancellationToken::new(),
            ),
        )
        .await
        .expect("run hung after failing to bind");

        let error = ret.unwrap_err();
        assert!(format!("{error:#}").contains("binding control port"));
    }

    #[tokio::test]
    async fn test_cancel_stops_running_server() {
        let cancel = CancellationToken::new();
        let server = tokio::spawn(run(
            args_for(0),
            Config::default(),
            "key".into(),
            cancel.clone(),
        ));

        tokio::task::yield_now().await;
        cancel.cancel();

        let ret = timeout(Duration::from_secs(5), server)
            .await
            .expect("run hung after cancel");
        assert!(ret.unwrap().is_ok());
    }
}
