use anyhow::Result;
use clap::Parser;
use kube::CustomResourceExt;
use tokio_util::sync::CancellationToken;
use utils::version;

use provisioner::config::Cli;
use provisioner::config::Commands;
use provisioner::config::ControllerArgs;
use provisioner::infrastructure::kube_client::init_kube_client;
use provisioner::reconcile;

/// Sets up global panic hooks.
fn setup_global_hooks() {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |panic_info| {
        default_hook(panic_info);
        tracing::error!("Thread panicked: {}", panic_info);
    }));
}

#[tokio::main]
async fn main() -> Result<()> {
    setup_global_hooks();

    let cli = Cli::parse();

    match cli.command {
        Commands::Controller(controller_args) => run_controller(*controller_args).await,
        Commands::Crd => print_crd(),
    }
}

async fn run_controller(controller_args: ControllerArgs) -> Result<()> {
    utils::logging::init();

    tracing::info!("Starting gpu capacity provisioner {}", &**version::VERSION);

    let settings = controller_args.settings()?;
    let client = init_kube_client(controller_args.kubeconfig.clone())
        .await
        .map_err(|report| anyhow::anyhow!(report))?;

    let shutdown = CancellationToken::new();
    let signal_handler = {
        let shutdown = shutdown.clone();
        #[cfg(unix)]
        {
            use tokio::signal::unix::signal;
            use tokio::signal::unix::SignalKind;
            let mut sigterm = signal(SignalKind::terminate())?;
            let mut sigint = signal(SignalKind::interrupt())?;

            tokio::spawn(async move {
                tokio::select! {
                    _ = sigterm.recv() => {
                        tracing::info!("Received SIGTERM, initiating graceful shutdown");
                    }
                    _ = sigint.recv() => {
                        tracing::info!("Received SIGINT, initiating graceful shutdown");
                    }
                }
                shutdown.cancel();
            })
        }
        #[cfg(not(unix))]
        {
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    tracing::info!("Received Ctrl+C, initiating graceful shutdown");
                }
                shutdown.cancel();
            })
        }
    };

    reconcile::run(client, settings, shutdown).await;
    signal_handler.abort();

    tracing::info!("Controller stopped");
    Ok(())
}

fn print_crd() -> Result<()> {
    let crd = api_types::GpuWorkload::crd();
    println!("{}", serde_yaml::to_string(&crd)?);
    Ok(())
}
