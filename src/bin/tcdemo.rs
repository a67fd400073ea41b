//! Minimal demo client exercising the `org.tcmmd.ManagedConnections` wire
//! contract without a real media pipeline (SPEC_FULL.md §4.5). Connects a
//! plain TCP socket to the given URL to derive the 4-tuple, then drives a
//! synthetic buffer-fill schedule through `SetPolicy`/`UnsetPolicy` on the
//! same 5-percentage-point/100%-crossing cadence a real client would use.

use clap::Parser;
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::time::Duration;

#[zbus::proxy(
    interface = "org.tcmmd.ManagedConnections",
    default_service = "org.tcmmd",
    default_path = "/org/tcmmd/ManagedConnections"
)]
trait ManagedConnections {
    fn set_policy(
        &self,
        src_ip: &str,
        src_port: u32,
        dst_ip: &str,
        dst_port: u32,
        bitrate: u32,
        buffer_fill: f64,
    ) -> zbus::Result<()>;

    fn unset_policy(&self) -> zbus::Result<()>;
}

#[derive(Parser, Debug)]
#[command(name = "tcdemo")]
#[command(version)]
#[command(about = "Demo client for tcmmd's wire contract", long_about = None)]
struct Args {
    /// Print what would be sent but don't actually call the daemon.
    #[arg(short = 'd', long = "disable-tc")]
    disable_tc: bool,

    /// Replay the synthetic buffer-fill schedule until Ctrl-C.
    #[arg(short = 'l', long = "looping")]
    looping: bool,

    /// An http(s) URL; only used to pick a TCP peer to derive the 4-tuple from.
    url: String,
}

/// A scripted buffer-fill trace standing in for a real playback pipeline's
/// `notify::buffer-fill` signal - fills, dips into panic, recovers.
const SCHEDULE: &[f64] = &[1.0, 0.98, 0.90, 0.60, 0.50, 0.30, 0.10, 0.05, 0.80, 1.0];

#[derive(Default)]
struct BufferState {
    buffer_fill: f64,
    buffer_ever_full: bool,
    buffer_critically_low: bool,
    buffer_critically_low_count: u32,
}

impl BufferState {
    /// Mirrors `buffer_fill_notify_cb` in the original client: tracks
    /// critical dips and reports whether this sample crosses the
    /// 5-percentage-point-or-100%-boundary threshold that obliges a call.
    fn observe(&mut self, buffer_fill: f64) -> bool {
        if buffer_fill == 1.0 {
            self.buffer_ever_full = true;
            self.buffer_critically_low = false;
        }

        if self.buffer_ever_full && buffer_fill < 0.15 && !self.buffer_critically_low {
            self.buffer_critically_low = true;
            self.buffer_critically_low_count += 1;
        }

        let crossed_full_boundary = (self.buffer_fill == 1.0) != (buffer_fill == 1.0);
        let should_call = (self.buffer_fill - buffer_fill).abs() > 0.05 || crossed_full_boundary;
        self.buffer_fill = buffer_fill;
        should_call
    }
}

fn parse_host_port(url: &str) -> anyhow::Result<(String, u16)> {
    let (scheme, rest) = url
        .split_once("://")
        .ok_or_else(|| anyhow::anyhow!("not a URL: {url}"))?;
    let default_port = match scheme {
        "http" => 80,
        "https" => 443,
        other => anyhow::bail!("only http(s):// URLs are accepted, got {other}://"),
    };
    let authority = rest.split(['/', '?', '#']).next().unwrap_or(rest);
    match authority.rsplit_once(':') {
        Some((host, port)) => Ok((host.to_string(), port.parse()?)),
        None => Ok((authority.to_string(), default_port)),
    }
}

fn flow_from_socket(local: SocketAddr, peer: SocketAddr) -> Option<(String, u16, String, u16)> {
    match (local, peer) {
        (SocketAddr::V4(l), SocketAddr::V4(p)) => Some((
            l.ip().to_string(),
            l.port(),
            p.ip().to_string(),
            p.port(),
        )),
        _ => None,
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    if std::env::var("RUST_LOG").is_ok() {
        pretty_env_logger::formatted_builder()
            .parse_default_env()
            .init();
    }

    let args = Args::parse();
    let (host, port) = parse_host_port(&args.url)?;

    let addr = format!("{host}:{port}")
        .to_socket_addrs()?
        .next()
        .ok_or_else(|| anyhow::anyhow!("could not resolve {host}:{port}"))?;
    let socket = TcpStream::connect(addr)?;
    let local = socket.local_addr()?;
    let peer = socket.peer_addr()?;
    let Some((src_ip, src_port, dst_ip, dst_port)) = flow_from_socket(local, peer) else {
        anyhow::bail!("only IPv4 peers are supported by this demo client");
    };

    let proxy = if args.disable_tc {
        None
    } else {
        match zbus::Connection::system().await {
            Ok(conn) => match ManagedConnectionsProxy::new(&conn).await {
                Ok(p) => Some(p),
                Err(e) => {
                    log::warn!("could not reach tcmmd RPC object: {e}");
                    None
                }
            },
            Err(e) => {
                log::warn!("system bus unreachable: {e}");
                None
            }
        }
    };

    let mut state = BufferState::default();
    let bitrate: u32 = 0; // unknown - no real media tags in this demo client

    'replay: loop {
        for &fill in SCHEDULE {
            let should_call = state.observe(fill);

            if should_call {
                if args.disable_tc || proxy.is_none() {
                    println!(
                        "# Traffic control disabled ({src_ip}:{src_port}, {dst_ip}:{dst_port}, {bitrate}, {fill})"
                    );
                } else if let Some(proxy) = &proxy {
                    println!("Call SetPolicy({src_ip}:{src_port}, {dst_ip}:{dst_port}, {bitrate}, {fill})");
                    if let Err(e) = proxy
                        .set_policy(&src_ip, src_port as u32, &dst_ip, dst_port as u32, bitrate, fill)
                        .await
                    {
                        log::warn!("SetPolicy failed: {e}");
                    }
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(Duration::from_millis(500)) => {}
                _ = tokio::signal::ctrl_c() => break 'replay,
            }
        }

        if !args.looping {
            break;
        }
    }

    if let Some(proxy) = &proxy {
        let _ = proxy.unset_policy().await;
    }

    println!("buffer_critically_low_count={}", state.buffer_critically_low_count);
    Ok(())
}
