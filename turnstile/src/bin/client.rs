//! The turnstile client daemon, one per scrape target host.

use std::{fs, net::SocketAddr, path::PathBuf, time::Duration};

use clap::Parser;
use metrics_exporter_prometheus::PrometheusBuilder;
use tokio::{runtime::Builder, signal};
use tracing::{error, info};
use tracing_subscriber::{util::SubscriberInitExt, EnvFilter};
use turnstile::{
    client::{self, ClientCoordinator},
    signals::Shutdown,
};

#[derive(thiserror::Error, Debug)]
enum Error {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("client coordinator returned an error: {0}")]
    Client(#[from] client::Error),
    #[error("failed to build the proxy http client: {0}")]
    HttpClient(#[from] reqwest::Error),
    #[error("--tls.cert and --tls.key must be set together")]
    PartialKeyPair,
}

#[derive(Parser)]
#[clap(version, about = "Client that polls a turnstile proxy for scrapes")]
struct Args {
    /// FQDN to register with; scrape targets must carry this host
    #[clap(long = "fqdn")]
    fqdn: String,
    /// base URL of the proxy to poll
    #[clap(long = "proxy-url")]
    proxy_url: String,
    /// CA certificate (PEM) to verify the proxy against
    #[clap(long = "tls.cacert")]
    tls_cacert: Option<PathBuf>,
    /// client certificate file (PEM)
    #[clap(long = "tls.cert")]
    tls_cert: Option<PathBuf>,
    /// client private key file (PEM)
    #[clap(long = "tls.key")]
    tls_key: Option<PathBuf>,
    /// address to serve this client's own metrics on
    #[clap(long = "metrics-addr", default_value = "0.0.0.0:9369")]
    metrics_addr: SocketAddr,
    /// seconds to wait after the first proxy failure
    #[clap(long = "proxy.retry.initial-wait", default_value_t = 1)]
    retry_initial_wait_seconds: u64,
    /// cap, in seconds, on the wait between proxy poll retries
    #[clap(long = "proxy.retry.max-wait", default_value_t = 5)]
    retry_max_wait_seconds: u64,
}

fn http_client(args: &Args) -> Result<reqwest::Client, Error> {
    let mut builder = reqwest::Client::builder();
    if let Some(path) = &args.tls_cacert {
        let pem = fs::read(path)?;
        builder = builder.add_root_certificate(reqwest::Certificate::from_pem(&pem)?);
    }
    match (&args.tls_cert, &args.tls_key) {
        (Some(cert), Some(key)) => {
            // reqwest wants the certificate and key in one PEM bundle.
            let mut pem = fs::read(cert)?;
            pem.extend_from_slice(&fs::read(key)?);
            builder = builder.identity(reqwest::Identity::from_pem(&pem)?);
        }
        (None, None) => {}
        _ => return Err(Error::PartialKeyPair),
    }
    Ok(builder.build()?)
}

async fn inner_main(args: Args) -> Result<(), Error> {
    let metrics_builder = PrometheusBuilder::new().with_http_listener(args.metrics_addr);
    tokio::spawn(async move {
        metrics_builder
            .install()
            .expect("failed to install prometheus recorder");
    });

    let coordinator = ClientCoordinator::new(
        client::Config {
            fqdn: args.fqdn.clone(),
            proxy_url: args.proxy_url.clone(),
            retry_initial_wait: Duration::from_secs(args.retry_initial_wait_seconds),
            retry_max_wait: Duration::from_secs(args.retry_max_wait_seconds),
        },
        http_client(&args)?,
    )?;

    let shutdown = Shutdown::new();
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

    coordinator.run(shutdown).await;
    Ok(())
}

fn main() -> Result<(), Error> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_ansi(false)
        .finish()
        .init();

    let version = env!("CARGO_PKG_VERSION");
    info!("starting turnstile-client {version}");

    let args = Args::parse();
    let runtime = Builder::new_multi_thread()
        .enable_io()
        .enable_time()
        .build()?;
    runtime.block_on(inner_main(args))
}
