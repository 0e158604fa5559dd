//! The turnstile proxy daemon.

use std::{net::SocketAddr, time::Duration};

use clap::Parser;
use ipnet::IpNet;
use metrics_exporter_prometheus::PrometheusBuilder;
use tokio::{runtime::Builder, signal, time};
use tracing::{error, info, warn};
use tracing_subscriber::{util::SubscriberInitExt, EnvFilter};
use turnstile::{
    proxy::{
        coordinator,
        server::{self, BasicAuth},
        Coordinator, Server,
    },
    signals::Shutdown,
};

const UPKEEP_INTERVAL: Duration = Duration::from_secs(5);

#[derive(thiserror::Error, Debug)]
enum Error {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("proxy server returned an error: {0}")]
    Server(#[from] server::Error),
    #[error("failed to install prometheus recorder: {0}")]
    Recorder(#[from] metrics_exporter_prometheus::BuildError),
    #[error("--web.auth.username and --web.auth.password must be set together")]
    PartialCredentials,
}

#[derive(Parser)]
#[clap(version, about = "Proxy for Prometheus scrapes of unreachable targets")]
struct Args {
    /// address to listen on for proxy and client requests
    #[clap(long = "web.listen-address", default_value = "0.0.0.0:8080")]
    listen_address: SocketAddr,
    /// any scrape with a higher timeout, in seconds, is clamped to this
    #[clap(long = "scrape.max-timeout", default_value_t = 300)]
    max_scrape_timeout_seconds: u64,
    /// timeout, in seconds, assumed for scrapes that do not advertise one
    #[clap(long = "scrape.default-timeout", default_value_t = 15)]
    default_scrape_timeout_seconds: u64,
    /// seconds after its last poll that a client registration expires
    #[clap(long = "registration.timeout", default_value_t = 300)]
    registration_timeout_seconds: u64,
    /// basic auth username guarding the scrape and /clients surfaces
    #[clap(long = "web.auth.username")]
    auth_username: Option<String>,
    /// basic auth password guarding the scrape and /clients surfaces
    #[clap(long = "web.auth.password")]
    auth_password: Option<String>,
    /// disable the /clients endpoint
    #[clap(long = "web.disable-clients")]
    disable_clients: bool,
    /// networks (CIDR, comma separated) allowed to scrape without restriction
    #[clap(long = "scrape.pollers-ip", value_delimiter = ',')]
    pollers_ip: Vec<IpNet>,
    /// reject scrapers outside --scrape.pollers-ip instead of restricting
    /// them to their reverse-DNS identity
    #[clap(long = "scrape.reject-unknown-pollers")]
    reject_unknown_pollers: bool,
    /// cap on concurrently served connections
    #[clap(long = "web.max-connections", default_value_t = 256)]
    max_connections: usize,
}

fn basic_auth(args: &Args) -> Result<Option<BasicAuth>, Error> {
    match (&args.auth_username, &args.auth_password) {
        (Some(username), Some(password)) => Ok(Some(BasicAuth {
            username: username.clone(),
            password: password.clone(),
        })),
        (None, None) => Ok(None),
        _ => Err(Error::PartialCredentials),
    }
}

async fn inner_main(args: Args) -> Result<(), Error> {
    let prometheus = PrometheusBuilder::new().install_recorder()?;
    {
        let prometheus = prometheus.clone();
        tokio::spawn(async move {
            let mut interval = time::interval(UPKEEP_INTERVAL);
            loop {
                interval.tick().await;
                prometheus.run_upkeep();
            }
        });
    }

    let coordinator = Coordinator::new(coordinator::Config {
        max_scrape_timeout: Duration::from_secs(args.max_scrape_timeout_seconds),
        default_scrape_timeout: Duration::from_secs(args.default_scrape_timeout_seconds),
        registration_timeout: Duration::from_secs(args.registration_timeout_seconds),
    });

    let shutdown = Shutdown::new();
    let gc = coordinator.spawn_gc(shutdown.clone());

    let server = Server::bind(
        server::Config {
            listen: args.listen_address,
            basic_auth: basic_auth(&args)?,
            disable_clients: args.disable_clients,
            poller_networks: args.pollers_ip.clone(),
            reject_unknown_pollers: args.reject_unknown_pollers,
            concurrent_connections_max: args.max_connections,
        },
        coordinator,
        prometheus,
    )
    .await?;

    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if let Err(err) = signal::ctrl_c().await {
                error!("failed to listen for ctrl-c: {err}");
            }
            info!("received ctrl-c");
            shutdown.signal();
        });
    }

    let result = server.serve(shutdown).await;
    if let Err(err) = gc.await {
        warn!("could not join the registry sweeper: {err}");
    }
    Ok(result?)
}

fn main() -> Result<(), Error> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_ansi(false)
        .finish()
        .init();

    let version = env!("CARGO_PKG_VERSION");
    info!("starting turnstile-proxy {version}");

    let args = Args::parse();
    let runtime = Builder::new_multi_thread()
        .enable_io()
        .enable_time()
        .build()?;
    runtime.block_on(inner_main(args))
}
