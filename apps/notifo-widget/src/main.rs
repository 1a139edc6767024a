use anyhow::{Context, Result};
use clap::Parser;
use job_queue::JobQueue;
use notifo_widget::cli::{Cli, Command, WatchArgs};
use notifo_widget::config::{Credentials, WidgetConfig};
use notifo_widget::controller::WidgetController;
use notifo_widget::registration::{Registrar, RegistrationCache};
use notifo_widget::{resolve_user_token, telemetry, watch};
use tracing::{debug, info};

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();
    telemetry::init(&cli.logging.to_config()).context("failed to initialise logging")?;

    let config = WidgetConfig::load(cli.config.as_deref(), cli.overrides())
        .context("invalid configuration")?;
    debug!(
        target: "notifo.widget",
        api_url = %config.api_url,
        mode = %config.mode,
        "configuration loaded"
    );
    let cache = if cli.no_cache {
        None
    } else {
        RegistrationCache::default_location()
    };
    let queue = JobQueue::new();

    match cli.command {
        Command::Register => register(&config, cache, queue).await,
        Command::Watch(args) => run_watch(&config, cache, &queue, args).await,
    }
}

async fn register(
    config: &WidgetConfig,
    cache: Option<RegistrationCache>,
    queue: JobQueue,
) -> Result<()> {
    let Credentials::ApiKey(api_key) = &config.credentials else {
        anyhow::bail!("registering requires an app api key (--api-key or NOTIFO_API_KEY)");
    };
    let registrar = Registrar::new(&config.api_url, api_key.as_str(), cache, queue)?;
    let registered = registrar
        .register(config.register_request())
        .await
        .context("registration failed")?;
    println!("{}", registered.user_id);
    Ok(())
}

async fn run_watch(
    config: &WidgetConfig,
    cache: Option<RegistrationCache>,
    queue: &JobQueue,
    args: WatchArgs,
) -> Result<()> {
    let token = resolve_user_token(config, cache, queue)
        .await
        .context("could not obtain a user token")?;

    let (callbacks, mut events) = watch::forwarding_callbacks();
    let controller = WidgetController::mount(&config.connection_options(&token), callbacks)
        .await
        .context("failed to connect")?;
    info!(target: "notifo.widget", "watching for notifications, press Ctrl-C to stop");

    if args.auto_see {
        for notification in controller.notifications().iter().filter(|n| !n.is_seen) {
            controller.see(notification);
        }
    }

    let mut stdout = std::io::stdout();
    let outcome = watch::run(&mut events, tokio::signal::ctrl_c(), &mut stdout, |notification| {
        if args.auto_see {
            controller.see(notification);
        }
    })
    .await;

    controller.settle().await;
    controller.unmount();
    outcome.context("failed to write to stdout")?;
    println!("unseen: {}", controller.unseen_count());
    Ok(())
}
