//! RPC Surface: the `org.tcmmd.ManagedConnections` D-Bus object (spec.md §4.3).
//!
//! The object itself does no policy logic - it validates wire arguments,
//! mirrors the two introspection properties, manages the peer-liveness
//! watch, and forwards everything else as a tagged [`RpcEvent`] to the
//! daemon's event loop. This mirrors the "object-based bus skeleton with
//! signals" adaptation in `spec.md` §9: the bus skeleton owns nothing but
//! wire plumbing.

use crate::tc::flow::FlowKey;
use anyhow::Context;
use tokio::sync::mpsc;

pub const BUS_NAME: &str = "org.tcmmd";
pub const OBJECT_PATH: &str = "/org/tcmmd/ManagedConnections";
pub const INTERFACE_NAME: &str = "org.tcmmd.ManagedConnections";

/// Tagged events forwarded from the bus object to the single-threaded
/// event loop - the "dispatch via a tagged event variant" adaptation.
#[derive(Debug, Clone)]
pub enum RpcEvent {
    SetPolicy {
        flow: FlowKey,
        bitrate: u32,
        buffer_fill: f64,
    },
    SetFixedPolicy {
        flow: FlowKey,
        stream_rate: u64,
        background_rate: u64,
    },
    UnsetPolicy,
}

fn parse_flow(
    src_ip: &str,
    src_port: u32,
    dst_ip: &str,
    dst_port: u32,
) -> zbus::fdo::Result<FlowKey> {
    let src_ip = FlowKey::parse_ip(src_ip)
        .ok_or_else(|| zbus::fdo::Error::InvalidArgs(format!("bad src_ip {src_ip:?}")))?;
    let dst_ip = FlowKey::parse_ip(dst_ip)
        .ok_or_else(|| zbus::fdo::Error::InvalidArgs(format!("bad dst_ip {dst_ip:?}")))?;
    let src_port = u16::try_from(src_port)
        .map_err(|_| zbus::fdo::Error::InvalidArgs(format!("src_port {src_port} out of range")))?;
    let dst_port = u16::try_from(dst_port)
        .map_err(|_| zbus::fdo::Error::InvalidArgs(format!("dst_port {dst_port} out of range")))?;

    Ok(FlowKey {
        src_ip,
        src_port,
        dst_ip,
        dst_port,
    })
}

/// The published object. Holds the mirrored `bitrate`/`buffer_fill`
/// properties, the event channel to the daemon loop, and the single
/// outstanding peer-liveness watch.
pub struct ManagedConnections {
    connection: zbus::Connection,
    events: mpsc::UnboundedSender<RpcEvent>,
    bitrate: u32,
    buffer_fill: f64,
    watch: Option<tokio::task::JoinHandle<()>>,
}

impl ManagedConnections {
    pub fn new(connection: zbus::Connection, events: mpsc::UnboundedSender<RpcEvent>) -> Self {
        Self {
            connection,
            events,
            bitrate: 0,
            buffer_fill: 0.0,
            watch: None,
        }
    }

    /// Replace the peer-liveness watch with one for `sender`. Aborts any
    /// previous watch first - "only one watch is maintained" (spec.md §4.3).
    fn rewatch(&mut self, sender: Option<String>) {
        if let Some(handle) = self.watch.take() {
            handle.abort();
        }

        let Some(sender) = sender else {
            return;
        };

        let connection = self.connection.clone();
        let events = self.events.clone();
        self.watch = Some(tokio::spawn(async move {
            let dbus = match zbus::fdo::DBusProxy::new(&connection).await {
                Ok(p) => p,
                Err(e) => {
                    log::warn!("peer-liveness watch unavailable: {e}");
                    return;
                }
            };

            let Ok(mut changes) = dbus.receive_name_owner_changed().await else {
                log::warn!("could not subscribe to NameOwnerChanged for {sender}");
                return;
            };

            use futures_util::StreamExt;
            while let Some(signal) = changes.next().await {
                let Ok(args) = signal.args() else { continue };
                if args.name() != sender.as_str() {
                    continue;
                }
                if args.new_owner().as_ref().is_none() {
                    log::info!("bus peer {sender} vanished; synthesizing UnsetPolicy");
                    let _ = events.send(RpcEvent::UnsetPolicy);
                    return;
                }
            }
        }));
    }
}

#[zbus::interface(name = "org.tcmmd.ManagedConnections")]
impl ManagedConnections {
    async fn set_policy(
        &mut self,
        #[zbus(header)] header: zbus::message::Header<'_>,
        src_ip: String,
        src_port: u32,
        dst_ip: String,
        dst_port: u32,
        bitrate: u32,
        buffer_fill: f64,
    ) -> zbus::fdo::Result<()> {
        let flow = parse_flow(&src_ip, src_port, &dst_ip, dst_port)?;
        self.bitrate = bitrate;
        self.buffer_fill = buffer_fill;
        self.rewatch(header.sender().map(|s| s.to_string()));
        self.events
            .send(RpcEvent::SetPolicy {
                flow,
                bitrate,
                buffer_fill,
            })
            .map_err(|e| zbus::fdo::Error::Failed(e.to_string()))
    }

    async fn set_fixed_policy(
        &mut self,
        #[zbus(header)] header: zbus::message::Header<'_>,
        src_ip: String,
        src_port: u32,
        dst_ip: String,
        dst_port: u32,
        stream_rate: u32,
        background_rate: u32,
    ) -> zbus::fdo::Result<()> {
        let flow = parse_flow(&src_ip, src_port, &dst_ip, dst_port)?;
        self.rewatch(header.sender().map(|s| s.to_string()));
        self.events
            .send(RpcEvent::SetFixedPolicy {
                flow,
                stream_rate: stream_rate as u64,
                background_rate: background_rate as u64,
            })
            .map_err(|e| zbus::fdo::Error::Failed(e.to_string()))
    }

    async fn unset_policy(&mut self) -> zbus::fdo::Result<()> {
        self.rewatch(None);
        self.events
            .send(RpcEvent::UnsetPolicy)
            .map_err(|e| zbus::fdo::Error::Failed(e.to_string()))
    }

    #[zbus(property)]
    fn bitrate(&self) -> u32 {
        self.bitrate
    }

    #[zbus(property)]
    fn set_bitrate(&mut self, value: u32) {
        self.bitrate = value;
    }

    #[zbus(property)]
    fn buffer_fill(&self) -> f64 {
        self.buffer_fill
    }

    #[zbus(property)]
    fn set_buffer_fill(&mut self, value: f64) {
        self.buffer_fill = value;
    }
}

/// Publish the object on the system bus. Returns `Ok(None)` rather than an
/// error when the bus itself is unreachable (dev/test environments without
/// a system bus) - see the test affordance documented in `SPEC_FULL.md`
/// §4.3. A name already owned by another daemon is a hard failure.
pub async fn serve(events: mpsc::UnboundedSender<RpcEvent>) -> anyhow::Result<Option<zbus::Connection>> {
    let connection = match zbus::Connection::system().await {
        Ok(c) => c,
        Err(e) => {
            log::warn!("system bus unreachable ({e}); RPC surface disabled");
            return Ok(None);
        }
    };

    let iface = ManagedConnections::new(connection.clone(), events);
    connection
        .object_server()
        .at(OBJECT_PATH, iface)
        .await
        .context("registering org.tcmmd.ManagedConnections object")?;

    connection
        .request_name(BUS_NAME)
        .await
        .context("acquiring bus name org.tcmmd (another daemon may already own it)")?;

    Ok(Some(connection))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_flow_rejects_garbage_ip() {
        let err = parse_flow("not-an-ip", 1, "1.2.3.4", 80);
        assert!(err.is_err());
    }

    #[test]
    fn parse_flow_accepts_any_fields() {
        let flow = parse_flow("", 0, "", 0).unwrap();
        assert_eq!(flow, FlowKey::ANY);
    }

    #[test]
    fn parse_flow_rejects_port_out_of_range() {
        let err = parse_flow("1.2.3.4", 70000, "5.6.7.8", 80);
        assert!(err.is_err());
    }
}
