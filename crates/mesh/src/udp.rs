//! UDP multicast transport: heartbeats and goodbyes.
//!
//! Frames are compact JSON with single-letter keys, tagged by `t`. Any
//! listener that doesn't understand a field ignores it; any frame that
//! doesn't parse is dropped.

use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::Arc;

use midrender_core::types::{now_ms, NodeState, RenderState};
use serde::{Deserialize, Serialize};
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;

use crate::registry::PeerRegistry;

/// Multicast group the farm chats on.
pub const MULTICAST_GROUP: Ipv4Addr = Ipv4Addr::new(239, 255, 77, 77);

/// Default multicast port.
pub const DEFAULT_UDP_PORT: u16 = 4243;

/// Largest frame we will parse. Heartbeats are tiny; anything bigger is
/// not ours.
const MAX_FRAME_BYTES: usize = 2048;

/// Wire frames. `t` selects the variant; unknown keys are ignored.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "t")]
pub enum UdpFrame {
    #[serde(rename = "hb")]
    Heartbeat {
        /// Sender node id.
        n: String,
        #[serde(default)]
        ip: String,
        #[serde(default = "default_port")]
        port: u16,
        /// Node state: `active` | `stopped`.
        #[serde(default)]
        st: Option<String>,
        /// Render state: `idle` | `rendering`.
        #[serde(default)]
        rs: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        job: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        chunk: Option<String>,
        #[serde(default = "default_priority")]
        pri: i32,
    },
    #[serde(rename = "bye")]
    Goodbye { n: String },
}

fn default_port() -> u16 {
    8420
}

fn default_priority() -> i32 {
    100
}

/// Parse one datagram. Unknown `t` values and malformed JSON are errors;
/// the receive loop drops them.
pub fn parse_frame(bytes: &[u8]) -> Result<UdpFrame, serde_json::Error> {
    serde_json::from_slice(bytes)
}

/// Multicast sender/receiver pair sharing one bound socket.
pub struct UdpTransport {
    socket: Arc<UdpSocket>,
    group: SocketAddrV4,
}

impl UdpTransport {
    /// Bind the multicast socket and join the farm group.
    pub async fn bind(port: u16) -> std::io::Result<Self> {
        let socket = UdpSocket::bind(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port)).await?;
        socket.join_multicast_v4(MULTICAST_GROUP, Ipv4Addr::UNSPECIFIED)?;
        // We want our own heartbeats back when several nodes share a host.
        socket.set_multicast_loop_v4(true)?;

        Ok(Self {
            socket: Arc::new(socket),
            group: SocketAddrV4::new(MULTICAST_GROUP, port),
        })
    }

    /// Send one frame to the group. Transient send errors are logged and
    /// swallowed -- UDP is the fast path, never the only path.
    pub async fn send(&self, frame: &UdpFrame) {
        let bytes = match serde_json::to_vec(frame) {
            Ok(b) => b,
            Err(e) => {
                tracing::error!(error = %e, "Failed to encode UDP frame");
                return;
            }
        };
        if let Err(e) = self.socket.send_to(&bytes, self.group).await {
            tracing::debug!(error = %e, "UDP send failed");
        }
    }

    /// Build and send a heartbeat from the registry's local record.
    pub async fn send_heartbeat(&self, registry: &PeerRegistry) {
        let info = registry.local_info().await;
        let (ip, port) = match info.endpoint.rsplit_once(':') {
            Some((ip, port)) => (ip.to_string(), port.parse().unwrap_or(default_port())),
            None => (info.endpoint.clone(), default_port()),
        };

        let rendering = info.render_state == RenderState::Rendering;
        self.send(&UdpFrame::Heartbeat {
            n: info.node_id.clone(),
            ip,
            port,
            st: Some(info.node_state.as_str().to_string()),
            rs: Some(info.render_state.as_str().to_string()),
            job: rendering.then(|| info.active_job.clone()),
            chunk: rendering.then(|| info.active_chunk.clone()),
            pri: info.priority,
        })
        .await;
    }

    pub async fn send_goodbye(&self, node_id: &str) {
        self.send(&UdpFrame::Goodbye {
            n: node_id.to_string(),
        })
        .await;
    }

    /// Spawn the receive loop: parse datagrams and feed the registry
    /// until cancelled.
    pub fn spawn_receiver(
        &self,
        registry: Arc<PeerRegistry>,
        cancel: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let socket = Arc::clone(&self.socket);
        tokio::spawn(async move {
            let mut buf = vec![0u8; MAX_FRAME_BYTES];
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    result = socket.recv_from(&mut buf) => {
                        let Ok((len, _from)) = result else { continue };
                        match parse_frame(&buf[..len]) {
                            Ok(frame) => handle_frame(&registry, frame).await,
                            Err(_) => {
                                // Not our traffic -- drop it.
                            }
                        }
                    }
                }
            }
            tracing::info!("UDP receiver stopped");
        })
    }
}

async fn handle_frame(registry: &PeerRegistry, frame: UdpFrame) {
    match frame {
        UdpFrame::Heartbeat {
            n,
            ip,
            port,
            st,
            rs,
            job,
            chunk,
            pri,
        } => {
            if n.is_empty() || ip.is_empty() {
                return;
            }
            registry
                .process_udp_heartbeat(
                    &n,
                    format!("{ip}:{port}"),
                    NodeState::from_str(st.as_deref().unwrap_or("active")),
                    RenderState::from_str(rs.as_deref().unwrap_or("idle")),
                    job.unwrap_or_default(),
                    chunk.unwrap_or_default(),
                    pri,
                    now_ms(),
                )
                .await;
        }
        UdpFrame::Goodbye { n } => {
            if !n.is_empty() && n != registry.node_id() {
                registry.process_udp_goodbye(&n).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_heartbeat_frame() {
        let frame = parse_frame(
            br#"{"t":"hb","n":"node-1","ip":"10.0.0.5","port":8420,"st":"active","rs":"rendering","job":"shot-a","chunk":"f1-5","pri":50}"#,
        )
        .unwrap();
        match frame {
            UdpFrame::Heartbeat { n, ip, port, rs, job, pri, .. } => {
                assert_eq!(n, "node-1");
                assert_eq!(ip, "10.0.0.5");
                assert_eq!(port, 8420);
                assert_eq!(rs.as_deref(), Some("rendering"));
                assert_eq!(job.as_deref(), Some("shot-a"));
                assert_eq!(pri, 50);
            }
            other => panic!("Expected Heartbeat, got {other:?}"),
        }
    }

    #[test]
    fn parse_minimal_heartbeat_uses_defaults() {
        let frame = parse_frame(br#"{"t":"hb","n":"node-1","ip":"10.0.0.5"}"#).unwrap();
        match frame {
            UdpFrame::Heartbeat { port, st, pri, .. } => {
                assert_eq!(port, 8420);
                assert!(st.is_none());
                assert_eq!(pri, 100);
            }
            other => panic!("Expected Heartbeat, got {other:?}"),
        }
    }

    #[test]
    fn unknown_fields_are_ignored() {
        let frame =
            parse_frame(br#"{"t":"bye","n":"node-1","future_field":[1,2,3]}"#).unwrap();
        assert!(matches!(frame, UdpFrame::Goodbye { n } if n == "node-1"));
    }

    #[test]
    fn unknown_type_is_rejected() {
        assert!(parse_frame(br#"{"t":"???","n":"node-1"}"#).is_err());
        assert!(parse_frame(b"not json").is_err());
    }

    #[test]
    fn idle_heartbeat_omits_job_fields() {
        let frame = UdpFrame::Heartbeat {
            n: "node-1".into(),
            ip: "10.0.0.5".into(),
            port: 8420,
            st: Some("active".into()),
            rs: Some("idle".into()),
            job: None,
            chunk: None,
            pri: 100,
        };
        let json = serde_json::to_string(&frame).unwrap();
        assert!(!json.contains("\"job\""));
        assert!(!json.contains("\"chunk\""));
        assert!(json.starts_with(r#"{"t":"hb""#));
    }
}
