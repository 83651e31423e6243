use anyhow::Result;
use clap::Parser;
use pollproxy::{ProxyConfig, Socks5Server};
use std::net::SocketAddr;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(author, version, about = "A single-threaded SOCKS5 proxy", long_about = None)]
struct Args {
    /// Port to listen on
    port: u16,

    /// Address to listen on
    #[arg(long, default_value = "0.0.0.0")]
    host: String,

    /// DNS server for domain targets (defaults to the system nameserver)
    #[arg(long)]
    dns_server: Option<SocketAddr>,

    /// Seconds a client may wait on a DNS answer, 0 waits forever
    #[arg(long, default_value_t = 10)]
    dns_timeout: u64,

    /// Relay buffer size per connection, in bytes
    #[arg(long, default_value_t = pollproxy::config::DEFAULT_BUFFER_SIZE)]
    buffer_size: usize,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> Result<()> {
    // Parse args
    let args = Args::parse();

    // Initialize tracing subscriber
    let level = if args.verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };

    tracing_subscriber::fmt().with_max_level(level).init();

    // Bare IPv6 hosts need brackets before a port can follow
    let listen_addr = if args.host.contains(':') {
        format!("[{}]:{}", args.host, args.port)
    } else {
        format!("{}:{}", args.host, args.port)
    };

    let mut config = ProxyConfig::new(listen_addr);
    config.dns_server = args.dns_server;
    config.buffer_size = args.buffer_size;
    config.dns_timeout = match args.dns_timeout {
        0 => None,
        secs => Some(Duration::from_secs(secs)),
    };

    // Instantiate server and run it
    let mut server = Socks5Server::with_config(config);
    server.run()
}
