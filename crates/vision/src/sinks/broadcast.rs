use std::net::{SocketAddr, UdpSocket};

use tracing::{debug, info};

use crate::{
    frame::EnrichedFrame,
    sinks::{Sink, SinkError, SinkKind, message::FrameMessage},
};

/// Largest datagram we attempt; bigger messages are dropped with a log line.
const MAX_DATAGRAM: usize = 65_000;

#[derive(Debug, Clone)]
pub struct BroadcastOptions {
    pub targets: Vec<SocketAddr>,
}

/// Sends one JSON datagram per frame to every listener. Delivery is
/// best-effort: send errors are counted, never raised.
pub struct MetadataBroadcaster {
    socket: UdpSocket,
    targets: Vec<SocketAddr>,
    sent: u64,
    failed: u64,
}

impl MetadataBroadcaster {
    pub fn new(options: BroadcastOptions) -> Result<Self, SinkError> {
        let bind: SocketAddr = match options.targets.first() {
            Some(SocketAddr::V6(_)) => "[::]:0",
            _ => "0.0.0.0:0",
        }
        .parse()
        .map_err(|err| SinkError::Unrecoverable(format!("bad bind address: {err}")))?;
        let socket = UdpSocket::bind(bind)?;
        socket.set_broadcast(true)?;
        info!(targets = ?options.targets, "metadata broadcaster ready");
        Ok(Self {
            socket,
            targets: options.targets,
            sent: 0,
            failed: 0,
        })
    }
}

impl Sink for MetadataBroadcaster {
    fn name(&self) -> &str {
        "metadata-udp"
    }

    fn kind(&self) -> SinkKind {
        SinkKind::Metadata
    }

    fn accepts(&mut self, frame: &EnrichedFrame) -> Result<(), SinkError> {
        let payload = serde_json::to_vec(&FrameMessage::from_frame(frame))?;
        if payload.len() > MAX_DATAGRAM {
            debug!(
                frame = frame.index(),
                bytes = payload.len(),
                "metadata too large for one datagram"
            );
            self.failed += 1;
            return Ok(());
        }
        for target in &self.targets {
            match self.socket.send_to(&payload, target) {
                Ok(_) => self.sent += 1,
                Err(err) => {
                    self.failed += 1;
                    debug!(%target, "metadata datagram not sent: {err}");
                }
            }
        }
        Ok(())
    }

    fn shutdown(&mut self) -> Result<(), SinkError> {
        info!(sent = self.sent, failed = self.failed, "metadata broadcaster stopped");
        Ok(())
    }
}
