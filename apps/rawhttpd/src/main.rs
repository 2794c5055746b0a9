mod stream_mode;
mod tun_device;

use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, ValueEnum};
use colored::Colorize;
use rawhttpd_core::certificate::Certificate;
use rawhttpd_core::tcp::table::DEFAULT_MAX_CONNECTIONS;
use rawhttpd_core::Server;
use tracing::{info, Level};

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
enum Mode {
    Tun,
    Tcp,
}

/// rawhttpd: a userspace TCP/IP + TLS 1.2 + HTTP/1.1 server, driven either
/// off a TUN device (full IPv4/TCP synthesis) or a plain host TCP listener
/// (TLS only, the kernel does the handshake).
#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    #[arg(long, value_enum)]
    mode: Mode,

    /// TUN device name to create/attach to (tun-mode only; a platform
    /// default is used if omitted).
    #[arg(long)]
    dev: Option<String>,

    #[arg(long = "localIP")]
    local_ip: Option<Ipv4Addr>,

    #[arg(long = "remoteIP")]
    remote_ip: Option<Ipv4Addr>,

    #[arg(long)]
    subnet: Option<Ipv4Addr>,

    #[arg(long, default_value_t = 1500)]
    mtu: i32,

    /// Listening port in tcp-mode (ignored in tun-mode, which serves both
    /// 80 and 443 on the tunnel's address).
    #[arg(long, default_value_t = 443)]
    port: u16,

    #[arg(long)]
    debug: bool,

    #[arg(long = "max-connections", default_value_t = DEFAULT_MAX_CONNECTIONS)]
    max_connections: usize,
}

fn init_tracing(debug: bool) -> Result<()> {
    let subscriber = tracing_subscriber::fmt()
        .with_max_level(if debug { Level::DEBUG } else { Level::INFO })
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;
    Ok(())
}

fn load_certificate() -> Result<Certificate> {
    let cert_path = PathBuf::from("cert.pem");
    let key_path = PathBuf::from("key.pem");
    Certificate::load(&cert_path, &key_path).context("failed to load cert.pem/key.pem from the current directory")
}

fn run_tun_mode(args: &Args, server: Arc<Server>) -> Result<()> {
    let local_ip = args.local_ip.context("--localIP is required in tun mode")?;
    let remote_ip = args.remote_ip.context("--remoteIP is required in tun mode")?;
    let subnet = args.subnet.context("--subnet is required in tun mode")?;

    let mut device = tun_device::open(&tun_device::TunParams {
        name: args.dev.clone(),
        local_ip,
        remote_ip,
        subnet,
        mtu: args.mtu,
    })?;

    info!("{}", format!("TUN device up: {local_ip} <-> {remote_ip}/{subnet}").green());
    let endpoint = rawhttpd_core::endpoint::PacketEndpoint::new(device.writer.clone());

    // A single reader thread: the packet-endpoint driver has exactly
    // one thread pulling datagrams off the device, dispatching each to the
    // core synchronously before reading the next.
    let mut buf = vec![0u8; (args.mtu as usize).max(2048)];
    loop {
        let datagram = device.read_datagram(&mut buf)?;
        if let Err(err) = server.handle_datagram(&endpoint, datagram) {
            if err.is_flow_local() {
                tracing::debug!(%err, "dropping malformed datagram");
            } else {
                return Err(err.into());
            }
        }
    }
}

fn run_tcp_mode(args: &Args, server: Arc<Server>) -> Result<()> {
    stream_mode::serve(server, args.port)
}

fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(args.debug)?;

    let certificate = load_certificate()?;
    let served_ports = match args.mode {
        Mode::Tun => vec![80, 443],
        Mode::Tcp => vec![args.port],
    };
    let server = Arc::new(Server::new(certificate, args.max_connections, served_ports));

    match args.mode {
        Mode::Tun => run_tun_mode(&args, server),
        Mode::Tcp => {
            if args.local_ip.is_some() || args.remote_ip.is_some() || args.subnet.is_some() {
                bail!("--localIP/--remoteIP/--subnet only apply to tun mode");
            }
            run_tcp_mode(&args, server)
        }
    }
}
