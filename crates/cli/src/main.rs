use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use clap::Parser;
use rtsp::monitor;
use rtsp::{Server, ServerConfig, StaticAuthenticator, StreamHub};

#[derive(Parser)]
#[command(
    name = "rtsp-relay",
    about = "RTSP server and pull/push relay over an in-process stream hub"
)]
struct Args {
    /// JSON configuration file; flags below override it
    #[arg(long, short)]
    config: Option<PathBuf>,

    /// Listen address (host:port)
    #[arg(long, short)]
    listen: Option<String>,

    /// Pull from the remote template when a stream is subscribed without a publisher
    #[arg(long)]
    auto_pull: bool,

    /// Remote URL template for pulls, e.g. rtsp://camera/${streamPath}
    #[arg(long)]
    remote_addr: Option<String>,

    /// Per-read/write deadline in milliseconds (0 disables)
    #[arg(long)]
    timeout_ms: Option<u64>,

    /// Retry failed pull/push connections
    #[arg(long)]
    reconnect: bool,

    /// Pull a stream at startup: PATH=URL (repeatable)
    #[arg(long = "pull", value_name = "PATH=URL")]
    pulls: Vec<String>,

    /// Require credentials: USER:PASSWORD (repeatable)
    #[arg(long = "user", value_name = "USER:PASSWORD")]
    users: Vec<String>,

    /// Print the session feed to stdout every N seconds
    #[arg(long, value_name = "SECONDS")]
    monitor: Option<u64>,
}

impl Args {
    fn load_config(&self) -> rtsp::Result<ServerConfig> {
        let mut config = match &self.config {
            Some(path) => ServerConfig::from_json_file(path)?,
            None => ServerConfig::default(),
        };
        if let Some(listen) = &self.listen {
            config.listen_addr = listen.clone();
        }
        if self.auto_pull {
            config.auto_pull = true;
        }
        if let Some(remote) = &self.remote_addr {
            config.remote_addr = remote.clone();
        }
        if let Some(timeout) = self.timeout_ms {
            config.timeout_ms = timeout;
        }
        if self.reconnect {
            config.reconnect = true;
        }
        Ok(config)
    }
}

fn main() {
    tracing_subscriber::fmt::init();

    let args = Args::parse();

    let config = match args.load_config() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Failed to load configuration: {}", e);
            std::process::exit(2);
        }
    };

    let hub = Arc::new(StreamHub::new());
    let mut server = Server::new(config, hub);

    if !args.users.is_empty() {
        let mut auth = StaticAuthenticator::new();
        for entry in &args.users {
            match entry.split_once(':') {
                Some((user, pass)) => auth = auth.with_user(user, pass),
                None => {
                    eprintln!("Invalid --user value {entry:?}, expected USER:PASSWORD");
                    std::process::exit(2);
                }
            }
        }
        server = server.with_authenticator(Arc::new(auth));
    }

    if let Err(e) = server.start() {
        eprintln!("Failed to start server: {}", e);
        std::process::exit(1);
    }

    for entry in &args.pulls {
        let Some((path, url)) = entry.split_once('=') else {
            eprintln!("Invalid --pull value {entry:?}, expected PATH=URL");
            continue;
        };
        let status = server.pull_status(path, url);
        tracing::info!(stream_path = path, url, code = status.code, msg = ?status.msg, "startup pull");
    }

    if let Some(secs) = args.monitor {
        let registry = server.registry().clone();
        thread::spawn(move || {
            let err = monitor::run_feed(&registry, io::stdout(), Duration::from_secs(secs.max(1)));
            tracing::warn!(error = ?err.err(), "monitor feed stopped");
        });
    }

    let addr = server
        .local_addr()
        .map_or_else(|| "?".to_string(), |a| a.to_string());
    println!("RTSP server on {} - press Enter to stop", addr);
    let mut input = String::new();
    if let Err(e) = io::stdin().read_line(&mut input) {
        eprintln!("stdin: {}", e);
    }

    server.stop();
}
