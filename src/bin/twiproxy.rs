use anyhow::{Context, Result};
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use twiproxy::twitter::{
  ExchangeRecorder, JsonLinesStore, TimelineObserver, TokenObserver, TokenStore,
};
use twiproxy::{Certificate, LoggingInterceptor, MitmConfig, MitmProxy};

/// Intercepting proxy that records home timeline engagement.
///
/// Point the browser's HTTP and HTTPS proxy at `--listen` and trust the CA
/// printed by `--print-ca`.
#[derive(Parser, Debug)]
#[command(name = "twiproxy")]
#[command(version, about)]
struct Args {
  /// Address to listen on
  #[arg(short, long, default_value = "127.0.0.1:8082")]
  listen: SocketAddr,

  /// Directory holding ca_cert.pem and ca_key.pem
  #[arg(long, default_value = ".twiproxy")]
  ca_dir: PathBuf,

  /// Print the CA certificate in PEM format and exit
  #[arg(long)]
  print_ca: bool,

  /// File observations are appended to, one JSON object per line
  #[arg(long, default_value = "tweets.jsonl")]
  observations: PathBuf,

  /// Also log every exchange (method, url, status, headers, body) to this file
  #[arg(long)]
  requests: Option<PathBuf>,

  /// File captured session tokens are kept in
  #[arg(long, default_value = "tokens.json")]
  tokens: PathBuf,

  /// URL fragments identifying timeline responses
  #[arg(long, value_delimiter = ',', default_values_t = ["HomeTimeline".to_string(), "HomeLatestTimeline".to_string()])]
  timeline_pattern: Vec<String>,

  /// Additional PEM bundle trusted for upstream TLS
  #[arg(long)]
  extra_roots: Vec<PathBuf>,

  /// Maximum concurrent client connections
  #[arg(long, default_value_t = 512)]
  max_connections: usize,

  /// Log every exchange
  #[arg(short = 'v', long)]
  log_traffic: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
  tracing_subscriber::registry()
    .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
    .with(tracing_subscriber::fmt::layer().with_target(false))
    .init();

  let args = Args::parse();

  let mut extra_root_certs = Vec::new();
  for path in &args.extra_roots {
    let certs = Certificate::from_pem_file(path)
      .with_context(|| format!("failed to load root certificates from {:?}", path))?;
    extra_root_certs.extend(certs);
  }

  let config = MitmConfig {
    listen_addr: args.listen,
    ca_storage_path: args.ca_dir.clone(),
    max_connections: args.max_connections,
    extra_root_certs,
    ..Default::default()
  };
  let proxy = MitmProxy::new(config)
    .await
    .with_context(|| format!("failed to load CA from {:?}", args.ca_dir))?;

  if args.print_ca {
    print!("{}", proxy.ca_cert_pem());
    return Ok(());
  }

  let tokens = Arc::new(
    TokenStore::open(&args.tokens)
      .await
      .with_context(|| format!("failed to open token store {:?}", args.tokens))?,
  );
  let store = Arc::new(JsonLinesStore::new(&args.observations));
  let timeline = Arc::new(TimelineObserver::with_patterns(store, args.timeline_pattern));
  let token_observer = Arc::new(TokenObserver::new(tokens));
  {
    let handler = proxy.interceptor_handler();
    let mut handler = handler.write().await;
    if args.log_traffic {
      handler.add_request_interceptor(Arc::new(LoggingInterceptor));
    }
    handler.add_request_interceptor(token_observer.clone());
    handler.add_request_interceptor(timeline.clone());
    handler.add_response_interceptor(token_observer);
    handler.add_response_interceptor(timeline);
    if let Some(path) = &args.requests {
      tracing::info!("Logging exchanges to {:?}", path);
      handler.add_response_interceptor(Arc::new(ExchangeRecorder::new(path)));
    }
    if args.log_traffic {
      handler.add_response_interceptor(Arc::new(LoggingInterceptor));
    }
  }

  tracing::info!("CA certificate: {:?}", proxy.ca_cert_path());
  tracing::info!("Recording timelines to {:?}", args.observations);
  proxy.start().await?;
  Ok(())
}
