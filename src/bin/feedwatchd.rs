//! feedwatchd - feed monitoring daemon
//!
//! Wires the components together:
//! 1. Loads the source catalog and starts one sampler per enabled source
//! 2. Runs the notification queue with settings from the backend
//! 3. Keeps a WebSocket connection to the message server, reconnecting on loss
//!
//! With no component flags, every component runs.

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::Duration;

use feedwatch::{
    BackendClient, CancellationToken, DefaultOpener, FailurePolicy, HttpFrameDispatcher,
    MessageRouter, NotificationQueue, RouterPublisher, ServiceConfig, Settings, Source,
    SourceRegistry, VisitorAlerts, WorkerContext, WorkerSupervisor,
};

#[derive(Parser, Debug)]
#[command(author, version, about = "Sample video feeds and route detections")]
struct Args {
    /// Run the camera samplers.
    #[arg(long)]
    camera: bool,

    /// Run the notification queue.
    #[arg(long)]
    notification: bool,

    /// Run the message router.
    #[arg(long)]
    router: bool,

    /// Backend username, used when no API token is configured.
    #[arg(long, env = "FEEDWATCH_USERNAME")]
    username: Option<String>,

    /// Backend password, used when no API token is configured.
    #[arg(long, env = "FEEDWATCH_PASSWORD")]
    password: Option<String>,

    /// Stop after this many seconds instead of waiting for Ctrl-C.
    #[arg(long, value_name = "SECS")]
    run_for: Option<u64>,
}

impl Args {
    fn all(&self) -> bool {
        !(self.camera || self.notification || self.router)
    }
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let cfg = ServiceConfig::load()?;
    let token = resolve_token(&args, &cfg)?;
    let client = BackendClient::new(&cfg.backend.url, &token, cfg.backend.timeout);
    log::info!("feedwatchd using backend {}", client.base_url());

    let run_cameras = args.all() || args.camera;
    let run_queue = args.all() || args.notification;
    let run_router = args.all() || args.router;

    let queue = run_queue.then(|| {
        let queue = Arc::new(NotificationQueue::new(
            Settings::load(&client),
            Arc::new(feedwatch::notify::LogEmailSender),
            Arc::new(feedwatch::notify::LogSystemSender),
            cfg.queue_config(),
        ));
        queue.start();
        queue
    });

    let router = run_router
        .then(|| Arc::new(MessageRouter::new(&cfg.router.url, cfg.router.read_timeout)));
    if let Some(router) = &router {
        router.register_callback("all", |envelope| {
            log::debug!("received {} message", envelope.kind);
            Ok(())
        });
    }
    let router_stop = CancellationToken::new();
    let router_thread = match &router {
        Some(router) => Some(spawn_router(
            router.clone(),
            router_stop.clone(),
            cfg.router.reconnect_delay,
        )?),
        None => None,
    };

    let supervisor = if run_cameras {
        let registry = Arc::new(SourceRegistry::load(&client));
        log::info!("loaded {} source(s)", registry.len());

        let policy = cfg.read_policy();
        let mut ctx = WorkerContext::new(
            Arc::new(DefaultOpener::new(cfg.capture_config())),
            Arc::new(
                HttpFrameDispatcher::new(client.clone())
                    .with_jpeg_quality(cfg.sampling.jpeg_quality),
            ),
        )
        .with_config(cfg.sampler_config())
        .with_policy(Arc::new(move |_: &Source| -> Box<dyn FailurePolicy> {
            Box::new(policy.clone())
        }));
        if let Some(queue) = &queue {
            ctx = ctx.with_observer(Arc::new(VisitorAlerts::new(queue.clone())));
        }
        if let Some(router) = &router {
            ctx = ctx.with_observer(Arc::new(RouterPublisher::new(router.clone())));
        }

        let supervisor = WorkerSupervisor::new(registry, ctx, cfg.supervisor_config());
        for (id, err) in supervisor.start_all() {
            if let Some(queue) = &queue {
                let details = format!("source {}: {}", id, err);
                queue.notify_system_issue("Camera Start Failure", &details);
            }
        }
        Some(supervisor)
    } else {
        None
    };

    log::info!("feedwatchd running");
    wait_for_shutdown(args.run_for)?;
    log::info!("shutdown signal received, stopping...");

    if let Some(supervisor) = &supervisor {
        supervisor.stop_all();
    }
    router_stop.cancel();
    if let Some(router) = &router {
        router.disconnect();
    }
    if let Some(handle) = router_thread {
        if handle.join().is_err() {
            log::error!("router thread panicked");
        }
    }
    if let Some(queue) = &queue {
        queue.stop();
    }
    Ok(())
}

fn resolve_token(args: &Args, cfg: &ServiceConfig) -> Result<String> {
    if let Some(token) = &cfg.backend.token {
        return Ok(token.clone());
    }
    let (Some(username), Some(password)) = (&args.username, &args.password) else {
        return Err(anyhow!(
            "no API token configured: set FEEDWATCH_API_TOKEN or pass --username and --password"
        ));
    };
    BackendClient::login(&cfg.backend.url, username, password, cfg.backend.timeout)
        .with_context(|| format!("login to {} as {}", cfg.backend.url, username))
}

fn spawn_router(
    router: Arc<MessageRouter>,
    stop: CancellationToken,
    reconnect_delay: Duration,
) -> Result<thread::JoinHandle<()>> {
    thread::Builder::new()
        .name("router".into())
        .spawn(move || {
            while !stop.is_cancelled() {
                match router.connect() {
                    Ok(()) if stop.is_cancelled() => router.disconnect(),
                    Ok(()) => router.listen(),
                    Err(err) => log::warn!("{}", err),
                }
                if stop.wait_timeout(reconnect_delay) {
                    break;
                }
                log::info!("reconnecting to {}", router.url());
            }
        })
        .context("spawn router thread")
}

fn wait_for_shutdown(run_for: Option<u64>) -> Result<()> {
    let (tx, rx) = mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = tx.send(());
    })
    .map_err(|e| anyhow!("error setting Ctrl-C handler: {}", e))?;

    match run_for {
        Some(secs) => {
            let _ = rx.recv_timeout(Duration::from_secs(secs));
        }
        None => {
            log::info!("waiting for shutdown signal (Ctrl-C)...");
            let _ = rx.recv();
        }
    }
    Ok(())
}
