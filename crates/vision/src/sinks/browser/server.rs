use std::{net::TcpListener, sync::Arc};

use actix_web::{
    App, HttpRequest, HttpResponse, HttpServer,
    http::header,
    web::{self, Bytes},
};
use actix_ws::{Message, MessageStream, Session};
use async_stream::stream;
use serde::Deserialize;
use serde_json::json;
use tokio::sync::{
    broadcast::{self, error::RecvError},
    oneshot, watch,
};
use tracing::{debug, error, info};

use super::{PreviewPacket, PreviewState, page};
use crate::pipeline::instrumentation;

/// Read side handed to every HTTP worker.
#[derive(Clone)]
pub(super) struct ServerState {
    pub(super) preview: watch::Receiver<Arc<PreviewState>>,
    pub(super) events: broadcast::Sender<Arc<PreviewPacket>>,
}

impl ServerState {
    fn snapshot(&self) -> Arc<PreviewState> {
        Arc::clone(&self.preview.borrow())
    }
}

#[derive(Deserialize)]
struct FrameQuery {
    frame: Option<u64>,
}

/// Runs the preview server until `stop` fires or its sender is dropped.
pub(super) fn serve(listener: TcpListener, state: ServerState, stop: oneshot::Receiver<()>) {
    let result = actix_web::rt::System::new().block_on(async move {
        let server = HttpServer::new(move || App::new().configure(routes(state.clone())))
            .workers(1)
            .shutdown_timeout(2)
            .disable_signals()
            .listen(listener)?
            .run();

        let handle = server.handle();
        actix_web::rt::spawn(async move {
            let _ = stop.await;
            handle.stop(true).await;
        });

        server.await
    });
    if let Err(err) = result {
        error!("HTTP server error: {err}");
    }
}

pub(super) fn routes(state: ServerState) -> impl FnOnce(&mut web::ServiceConfig) {
    move |cfg| {
        cfg.app_data(web::Data::new(state))
            .route("/", web::get().to(index_route))
            .route("/frame.jpg", web::get().to(frame_handler))
            .route("/stream.mjpg", web::get().to(stream_handler))
            .route("/metadata", web::get().to(metadata_handler))
            .route("/ws", web::get().to(websocket_handler))
            .route("/detections", web::get().to(detections_handler))
            .route("/health", web::get().to(health_handler))
            .route("/metrics", web::get().to(metrics_handler));
    }
}

fn jpeg_response(packet: &PreviewPacket) -> actix_web::HttpResponseBuilder {
    let mut builder = HttpResponse::Ok();
    builder
        .content_type("image/jpeg")
        .insert_header(("X-Sequence", packet.frame.to_string()));
    builder
}

/// Return a single JPEG frame by sequence number or the latest frame.
async fn frame_handler(
    query: web::Query<FrameQuery>,
    state: web::Data<ServerState>,
) -> HttpResponse {
    let snapshot = state.snapshot();
    if let Some(requested) = query.frame {
        if let Some(packet) = snapshot.find(requested) {
            return jpeg_response(packet).body(packet.jpeg.clone());
        }
        return match &snapshot.latest {
            Some(latest) => jpeg_response(latest)
                .append_header((
                    header::WARNING,
                    format!(
                        "299 overwatch \"frame {requested} not buffered; returning latest {}\"",
                        latest.frame
                    ),
                ))
                .body(latest.jpeg.clone()),
            None => HttpResponse::NoContent().finish(),
        };
    }

    match &snapshot.latest {
        Some(packet) => jpeg_response(packet).body(packet.jpeg.clone()),
        None => HttpResponse::NoContent().finish(),
    }
}

fn with_stream_headers(content_type: &'static str) -> actix_web::HttpResponseBuilder {
    let mut builder = HttpResponse::Ok();
    builder
        .insert_header((header::ACCESS_CONTROL_ALLOW_ORIGIN, "*"))
        .insert_header((header::ACCESS_CONTROL_ALLOW_HEADERS, "*"))
        .insert_header((header::ACCESS_CONTROL_ALLOW_METHODS, "GET"))
        .insert_header((header::ACCESS_CONTROL_EXPOSE_HEADERS, "Content-Type"))
        .append_header(("Cache-Control", "no-cache"))
        .append_header(("Content-Type", content_type));
    builder
}

fn multipart_part(packet: &PreviewPacket) -> Bytes {
    let mut payload = Vec::with_capacity(packet.jpeg.len() + 96);
    payload.extend_from_slice(b"--frame\r\n");
    payload.extend_from_slice(format!("X-Sequence: {}\r\n", packet.frame).as_bytes());
    payload.extend_from_slice(b"Content-Type: image/jpeg\r\n");
    let length = format!("Content-Length: {}\r\n\r\n", packet.jpeg.len());
    payload.extend_from_slice(length.as_bytes());
    payload.extend_from_slice(&packet.jpeg);
    payload.extend_from_slice(b"\r\n");
    Bytes::from(payload)
}

/// Push every new frame over a multipart response.
async fn stream_handler(state: web::Data<ServerState>) -> HttpResponse {
    let mut preview = state.preview.clone();
    let stream = stream! {
        loop {
            let latest = preview.borrow_and_update().latest.clone();
            if let Some(packet) = latest {
                yield Ok::<Bytes, actix_web::Error>(multipart_part(&packet));
            }
            if preview.changed().await.is_err() {
                break;
            }
        }
    };
    with_stream_headers("multipart/x-mixed-replace; boundary=frame").streaming(stream)
}

fn sse_event(packet: &PreviewPacket) -> Bytes {
    match serde_json::to_string(&packet.message) {
        Ok(json) => Bytes::from(format!("id: {}\ndata: {json}\n\n", packet.frame)),
        Err(err) => Bytes::from(format!("event: error\ndata: {err}\n\n")),
    }
}

/// One Server-Sent Event per delivered frame.
async fn metadata_handler(state: web::Data<ServerState>) -> HttpResponse {
    let mut events = state.events.subscribe();
    let mut preview = state.preview.clone();
    let stream = stream! {
        yield Ok::<Bytes, actix_web::Error>(Bytes::from_static(b"retry: 500\n\n"));
        loop {
            let chunk = tokio::select! {
                received = events.recv() => match received {
                    Ok(packet) => Some(sse_event(&packet)),
                    Err(RecvError::Lagged(skipped)) => {
                        debug!(skipped, "metadata client lagging");
                        None
                    }
                    Err(RecvError::Closed) => break,
                },
                changed = preview.changed() => match changed {
                    Ok(()) => None,
                    Err(_) => break,
                },
            };
            if let Some(chunk) = chunk {
                yield Ok::<Bytes, actix_web::Error>(chunk);
            }
        }
    };
    with_stream_headers("text/event-stream")
        .append_header(("Connection", "keep-alive"))
        .streaming(stream)
}

/// Text message announcing the frame that the following binary JPEG carries.
fn ws_metadata(packet: &PreviewPacket) -> Option<String> {
    let message = json!({ "type": "metadata", "data": &packet.message });
    serde_json::to_string(&message).ok()
}

/// Per-frame metadata followed by the JPEG, over one WebSocket.
async fn websocket_handler(
    req: HttpRequest,
    body: web::Payload,
    state: web::Data<ServerState>,
) -> Result<HttpResponse, actix_web::Error> {
    let (response, session, messages) = actix_ws::handle(&req, body)?;
    let events = state.events.subscribe();
    actix_web::rt::spawn(forward_to_websocket(session, messages, events));
    Ok(response)
}

async fn forward_to_websocket(
    mut session: Session,
    mut messages: MessageStream,
    mut events: broadcast::Receiver<Arc<PreviewPacket>>,
) {
    info!("websocket client connected");
    loop {
        tokio::select! {
            received = events.recv() => match received {
                Ok(packet) => {
                    let Some(text) = ws_metadata(&packet) else {
                        continue;
                    };
                    if session.text(text).await.is_err()
                        || session.binary(packet.jpeg.clone()).await.is_err()
                    {
                        debug!("websocket client went away");
                        return;
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    debug!(skipped, "websocket client lagging");
                }
                Err(RecvError::Closed) => break,
            },
            incoming = messages.recv() => match incoming {
                Some(Ok(Message::Ping(bytes))) => {
                    if session.pong(&bytes).await.is_err() {
                        return;
                    }
                }
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => {
                    info!("websocket client disconnected");
                    return;
                }
                Some(Ok(_)) => {}
            },
        }
    }
    let _ = session.close(None).await;
}

async fn detections_handler(state: web::Data<ServerState>) -> HttpResponse {
    match &state.snapshot().latest {
        Some(packet) => HttpResponse::Ok().json(&packet.message),
        None => HttpResponse::NoContent().finish(),
    }
}

async fn health_handler(state: web::Data<ServerState>) -> HttpResponse {
    let snapshot = state.snapshot();
    HttpResponse::Ok().json(json!({
        "status": "ok",
        "latest_frame": snapshot.latest.as_ref().map(|p| p.frame),
        "buffered_frames": snapshot.history.len(),
        "metadata_clients": state.events.receiver_count(),
    }))
}

async fn metrics_handler() -> HttpResponse {
    match instrumentation::prometheus_handle() {
        Some(handle) => HttpResponse::Ok()
            .content_type("text/plain; version=0.0.4")
            .body(handle.render()),
        None => HttpResponse::ServiceUnavailable().body("metrics recorder not installed"),
    }
}

async fn index_route() -> HttpResponse {
    HttpResponse::Ok()
        .content_type("text/html; charset=utf-8")
        .body(page::PLAYER_HTML)
}
