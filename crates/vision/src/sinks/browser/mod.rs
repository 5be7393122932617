//! Browser-facing transport: MJPEG video plus a per-frame JSON side channel,
//! offered both as Server-Sent Events and over a WebSocket.
//!
//! The sink renders and encodes on its own worker thread and publishes
//! immutable snapshots; the HTTP server only ever reads them.

use std::{
    collections::VecDeque,
    net::{SocketAddr, TcpListener},
    sync::Arc,
    thread::JoinHandle,
};

use actix_web::web::Bytes;
use tokio::sync::{broadcast, oneshot, watch};
use tracing::{info, warn};

use crate::{
    frame::EnrichedFrame,
    pipeline::instrumentation,
    sinks::{
        Sink, SinkError, SinkKind,
        annotation::{encode_jpeg, render_frame},
        message::FrameMessage,
    },
};

mod page;
mod server;

pub const DEFAULT_HISTORY: usize = 64;
const EVENT_BUFFER: usize = 16;

#[derive(Debug, Clone)]
pub struct BrowserOptions {
    pub bind: SocketAddr,
    pub jpeg_quality: u8,
    /// Frames kept for `/frame.jpg?frame=N`.
    pub history: usize,
    /// Draw detections and the HUD onto the preview.
    pub overlay: bool,
}

/// One encoded frame with its metadata message.
#[derive(Debug)]
pub struct PreviewPacket {
    pub frame: u64,
    pub jpeg: Bytes,
    pub message: FrameMessage,
}

/// Snapshot published after every frame.
#[derive(Debug, Default, Clone)]
pub struct PreviewState {
    pub latest: Option<Arc<PreviewPacket>>,
    pub history: VecDeque<Arc<PreviewPacket>>,
}

impl PreviewState {
    pub fn find(&self, frame: u64) -> Option<&Arc<PreviewPacket>> {
        self.history.iter().find(|packet| packet.frame == frame)
    }
}

pub struct BrowserSink {
    addr: SocketAddr,
    jpeg_quality: u8,
    overlay: bool,
    history_capacity: usize,
    history: VecDeque<Arc<PreviewPacket>>,
    preview: Option<watch::Sender<Arc<PreviewState>>>,
    events: Option<broadcast::Sender<Arc<PreviewPacket>>>,
    stop: Option<oneshot::Sender<()>>,
    server: Option<JoinHandle<()>>,
}

impl BrowserSink {
    /// Binds the listener and starts the HTTP server thread.
    pub fn start(options: BrowserOptions) -> Result<Self, SinkError> {
        let listener = TcpListener::bind(options.bind)?;
        let addr = listener.local_addr()?;
        let (preview_tx, preview_rx) = watch::channel(Arc::new(PreviewState::default()));
        let (events_tx, _) = broadcast::channel(EVENT_BUFFER);
        let (stop_tx, stop_rx) = oneshot::channel();

        let state = server::ServerState {
            preview: preview_rx,
            events: events_tx.clone(),
        };
        let handle = instrumentation::spawn_thread("vision-preview-server", move || {
            server::serve(listener, state, stop_rx)
        })?;
        info!("browser preview on http://{addr}/");

        Ok(Self {
            addr,
            jpeg_quality: options.jpeg_quality,
            overlay: options.overlay,
            history_capacity: options.history.max(1),
            history: VecDeque::new(),
            preview: Some(preview_tx),
            events: Some(events_tx),
            stop: Some(stop_tx),
            server: Some(handle),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    fn publish(&mut self, packet: Arc<PreviewPacket>) {
        self.history.push_back(Arc::clone(&packet));
        while self.history.len() > self.history_capacity {
            self.history.pop_front();
        }
        if let Some(preview) = &self.preview {
            preview.send_replace(Arc::new(PreviewState {
                latest: Some(Arc::clone(&packet)),
                history: self.history.clone(),
            }));
        }
        if let Some(events) = &self.events {
            // no subscribers is fine
            let _ = events.send(packet);
        }
    }
}

impl Sink for BrowserSink {
    fn name(&self) -> &str {
        "browser"
    }

    fn kind(&self) -> SinkKind {
        SinkKind::Video
    }

    fn accepts(&mut self, frame: &EnrichedFrame) -> Result<(), SinkError> {
        if self.server.as_ref().is_none_or(JoinHandle::is_finished) {
            return Err(SinkError::Closed("preview server stopped".into()));
        }
        let image = render_frame(frame, self.overlay)?;
        let jpeg = encode_jpeg(&image, self.jpeg_quality)?;
        self.publish(Arc::new(PreviewPacket {
            frame: frame.index(),
            jpeg: Bytes::from(jpeg),
            message: FrameMessage::from_frame(frame),
        }));
        Ok(())
    }

    fn shutdown(&mut self) -> Result<(), SinkError> {
        // closing the channels ends open streams
        self.preview.take();
        self.events.take();
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Some(handle) = self.server.take()
            && handle.join().is_err()
        {
            warn!("preview server thread panicked");
            return Err(SinkError::Unrecoverable("preview server panicked".into()));
        }
        info!(addr = %self.addr, "browser preview stopped");
        Ok(())
    }
}

impl Drop for BrowserSink {
    fn drop(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
    }
}
