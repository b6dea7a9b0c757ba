//! cloud-tunnel - TCP tunnels over HTTP upgrades and Google's IAP relay

use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

use cloud_tunnel::config::{Config, RuleConfig, TunnelConfig};
use cloud_tunnel::error::Result;
use cloud_tunnel::proxy::{ProxyServer, TcpForwarder};
use cloud_tunnel::server::{TunnelServer, DEFAULT_PORT};

fn main() {
    let args: Vec<String> = std::env::args().collect();

    let Some(verb) = args.get(1) else {
        print_help();
        std::process::exit(2);
    };

    match verb.as_str() {
        "version" | "-v" | "--version" => {
            print_version();
            return;
        }
        "help" | "-h" | "--help" => {
            print_help();
            return;
        }
        _ => {}
    }

    init_logging();

    let result = match verb.as_str() {
        "server" => run(run_server(&args[2..])),
        "tcp-forward" => run(run_tcp_forward(&args[2..])),
        "proxy" => run(run_proxy(&args[2..])),
        other => {
            eprintln!("unknown command: {}", other);
            print_help();
            std::process::exit(2);
        }
    };

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

fn init_logging() {
    let log_level = std::env::var("RUST_LOG")
        .ok()
        .and_then(|level| level.parse().ok())
        .unwrap_or(Level::INFO);

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .finish();
    let _ = tracing::subscriber::set_global_default(subscriber);
}

fn run<F>(future: F) -> Result<()>
where
    F: std::future::Future<Output = Result<()>>,
{
    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(future)
}

async fn run_server(args: &[String]) -> Result<()> {
    let mut listen_addr = format!("0.0.0.0:{}", DEFAULT_PORT);
    let mut dial_timeout: u64 = 0;
    let mut allowed_upstreams: Vec<String> = Vec::new();

    let mut args = ArgReader::new(args);
    while let Some(flag) = args.next_flag() {
        match flag.as_str() {
            "--listen-addr" => listen_addr = args.value(&flag)?,
            "--dial-timeout" => {
                dial_timeout = args.value(&flag)?.parse().map_err(|_| {
                    cloud_tunnel::Error::Config("--dial-timeout expects seconds".to_string())
                })?
            }
            "--allowed-upstream" => allowed_upstreams.push(args.value(&flag)?),
            other => return unknown_flag(other),
        }
    }

    let listener = TcpListener::bind(&listen_addr).await?;
    let server = Arc::new(TunnelServer::new(
        Duration::from_secs(dial_timeout),
        &allowed_upstreams,
    ));
    server.serve(listener).await
}

async fn run_tcp_forward(args: &[String]) -> Result<()> {
    let mut listen_addr = "127.0.0.1:8080".to_string();
    let mut upstream = String::new();
    let mut tunnel = TunnelConfig::default();

    let mut args = ArgReader::new(args);
    while let Some(flag) = args.next_flag() {
        match flag.as_str() {
            "--listen-addr" => listen_addr = args.value(&flag)?,
            "--upstream" => upstream = args.value(&flag)?,
            "--service-url" => tunnel.service_url = Some(args.value(&flag)?),
            "--instance" => tunnel.instance = Some(args.value(&flag)?),
            "--project" => tunnel.project = Some(args.value(&flag)?),
            "--zone" => tunnel.zone = Some(args.value(&flag)?),
            "--port" => {
                tunnel.port = Some(args.value(&flag)?.parse().map_err(|_| {
                    cloud_tunnel::Error::Config("--port expects a port number".to_string())
                })?)
            }
            "--token-file" => tunnel.token_file = Some(args.value(&flag)?),
            "--mux" => tunnel.mux = true,
            other => return unknown_flag(other),
        }
    }

    if upstream.is_empty() {
        return Err(cloud_tunnel::Error::Config(
            "--upstream is required".to_string(),
        ));
    }

    let dialer = tunnel.build_dialer(Duration::ZERO)?;
    let listener = TcpListener::bind(&listen_addr).await?;
    let forwarder = Arc::new(TcpForwarder::new(upstream, dialer));
    forwarder.serve(listener).await
}

async fn run_proxy(args: &[String]) -> Result<()> {
    let mut listen_addr = "127.0.0.1:8080".to_string();
    let mut config_file: Option<String> = None;
    let mut rule = RuleConfig::default();

    let mut args = ArgReader::new(args);
    while let Some(flag) = args.next_flag() {
        match flag.as_str() {
            "--listen-addr" => listen_addr = args.value(&flag)?,
            "--config" => config_file = Some(args.value(&flag)?),
            "--service-url" => rule.tunnel.service_url = Some(args.value(&flag)?),
            "--instance" => rule.tunnel.instance = Some(args.value(&flag)?),
            "--project" => rule.tunnel.project = Some(args.value(&flag)?),
            "--zone" => rule.tunnel.zone = Some(args.value(&flag)?),
            "--port" => {
                rule.tunnel.port = Some(args.value(&flag)?.parse().map_err(|_| {
                    cloud_tunnel::Error::Config("--port expects a port number".to_string())
                })?)
            }
            "--token-file" => rule.tunnel.token_file = Some(args.value(&flag)?),
            "--mux" => rule.tunnel.mux = true,
            "--upstream" => rule.upstreams.push(args.value(&flag)?),
            other => return unknown_flag(other),
        }
    }

    let config = match config_file {
        Some(path) => Config::load(path)?,
        None => {
            let mut config = Config::default();
            if rule.tunnel.service_url.is_some() || rule.tunnel.instance.is_some() {
                config.rules.push(rule);
            }
            config
        }
    };

    let rules = config.build_rules()?;
    let listener = TcpListener::bind(&listen_addr).await?;
    let proxy = Arc::new(ProxyServer::new(rules, config.dial_timeout()));
    proxy.serve(listener).await
}

fn unknown_flag(flag: &str) -> Result<()> {
    Err(cloud_tunnel::Error::Config(format!(
        "unknown flag: {}",
        flag
    )))
}

/// Minimal flag reader: `--flag value` pairs plus bare switches.
struct ArgReader<'a> {
    args: &'a [String],
    index: usize,
}

impl<'a> ArgReader<'a> {
    fn new(args: &'a [String]) -> Self {
        Self { args, index: 0 }
    }

    fn next_flag(&mut self) -> Option<String> {
        let flag = self.args.get(self.index)?.clone();
        self.index += 1;
        Some(flag)
    }

    fn value(&mut self, flag: &str) -> Result<String> {
        let value = self.args.get(self.index).cloned().ok_or_else(|| {
            cloud_tunnel::Error::Config(format!("{} expects a value", flag))
        })?;
        self.index += 1;
        Ok(value)
    }
}

fn print_help() {
    println!(
        r#"cloud-tunnel - TCP tunnels over HTTP upgrades and Google's IAP relay

USAGE:
    cloud-tunnel <COMMAND> [OPTIONS]

COMMANDS:
    server        Run the upgrade tunnel server
    tcp-forward   Forward a local TCP listener through a tunnel
    proxy         Run a combined HTTP and SOCKS5 proxy
    version       Print version information

SERVER OPTIONS:
    --listen-addr <ADDR>        Listen address (default 0.0.0.0:7654)
    --dial-timeout <SECONDS>    Upstream dial timeout (default 5)
    --allowed-upstream <PAT>    Allowed upstream pattern, repeatable.
                                Patterns: *, host, host:port, CIDR.
                                No patterns allows everything.

TCP-FORWARD OPTIONS:
    --listen-addr <ADDR>        Listen address (default 127.0.0.1:8080)
    --upstream <HOST:PORT>      Upstream to reach through the tunnel
    --service-url <URL>         Tunnel server URL (e.g. a Cloud Run service)
    --instance <NAME>           Compute Engine instance behind the IAP relay
    --project <ID>              Project of the instance
    --zone <ZONE>               Zone of the instance
    --port <PORT>               Tunnel server port on the instance (default 7654)
    --token-file <PATH>         File holding a bearer token
    --mux                       Multiplex connections over one transport

PROXY OPTIONS:
    --listen-addr <ADDR>        Listen address (default 127.0.0.1:8080)
    --config <FILE>             JSON configuration file with routing rules
    --upstream <PAT>            Upstream pattern for the inline rule, repeatable
    (plus the tunnel flags above to define a single inline rule)

EXAMPLES:
    cloud-tunnel server --listen-addr 0.0.0.0:7654 --allowed-upstream 10.0.0.0/8
    cloud-tunnel tcp-forward --listen-addr 127.0.0.1:5432 \
        --upstream db.internal:5432 --service-url https://tunnel.example.run.app
    cloud-tunnel tcp-forward --upstream 10.0.0.5:22 \
        --instance bastion --project my-project --zone europe-west1-b --mux
    cloud-tunnel proxy --config rules.json
"#
    );
}

fn print_version() {
    println!("cloud-tunnel v{}", env!("CARGO_PKG_VERSION"));
}
