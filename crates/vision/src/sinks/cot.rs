//! Cursor-on-Target forwarding of geolocated detections.
//!
//! Detections above the relevance threshold are queued, then released in
//! small batches at most once per batch window. A track is reported at most
//! once per rate-limit interval. Transport failures drop the affected events
//! and reconnect on the next send; they never retire the sink.

use std::{
    collections::{HashMap, VecDeque},
    fmt::Write as _,
    io::{self, Write},
    net::{SocketAddr, TcpStream, ToSocketAddrs, UdpSocket},
    time::{Duration, Instant},
};

use chrono::{DateTime, SecondsFormat, Utc};
use geolocate::GeoCoordinate;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    frame::EnrichedFrame,
    sinks::{Sink, SinkError, SinkKind},
};

const HOSTILE_MARKERS: [&str; 3] = ["weapon", "gun", "threat"];
const TRACK_MEMORY: usize = 1_000;
const TRACK_EXPIRY: Duration = Duration::from_secs(60);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum CotProtocol {
    Tcp,
    Udp,
}

/// Byte transport to the command-and-control endpoint.
pub trait CotTransport: Send {
    fn send(&mut self, payload: &[u8]) -> io::Result<()>;

    fn describe(&self) -> String;
}

/// Stream transport; connects lazily and reconnects after a failed write.
pub struct TcpTransport {
    endpoint: String,
    stream: Option<TcpStream>,
}

impl TcpTransport {
    pub fn new(host: &str, port: u16) -> Self {
        Self {
            endpoint: format!("{host}:{port}"),
            stream: None,
        }
    }

    fn connect(&self) -> io::Result<TcpStream> {
        let mut last_err = io::Error::new(io::ErrorKind::NotFound, "endpoint did not resolve");
        for addr in self.endpoint.to_socket_addrs()? {
            match TcpStream::connect_timeout(&addr, CONNECT_TIMEOUT) {
                Ok(stream) => {
                    stream.set_write_timeout(Some(CONNECT_TIMEOUT))?;
                    info!(endpoint = %self.endpoint, "CoT endpoint connected");
                    return Ok(stream);
                }
                Err(err) => last_err = err,
            }
        }
        Err(last_err)
    }
}

impl CotTransport for TcpTransport {
    fn send(&mut self, payload: &[u8]) -> io::Result<()> {
        if self.stream.is_none() {
            self.stream = Some(self.connect()?);
        }
        let Some(stream) = self.stream.as_mut() else {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "no CoT stream"));
        };
        let result = stream.write_all(payload).and_then(|()| stream.flush());
        if result.is_err() {
            self.stream = None;
        }
        result
    }

    fn describe(&self) -> String {
        format!("tcp://{}", self.endpoint)
    }
}

pub struct UdpTransport {
    socket: UdpSocket,
    target: SocketAddr,
}

impl UdpTransport {
    pub fn new(host: &str, port: u16) -> io::Result<Self> {
        let target = (host, port).to_socket_addrs()?.next().ok_or_else(|| {
            io::Error::new(io::ErrorKind::NotFound, format!("{host} did not resolve"))
        })?;
        let bind = if target.is_ipv6() { "[::]:0" } else { "0.0.0.0:0" };
        Ok(Self {
            socket: UdpSocket::bind(bind)?,
            target,
        })
    }
}

impl CotTransport for UdpTransport {
    fn send(&mut self, payload: &[u8]) -> io::Result<()> {
        self.socket.send_to(payload, self.target).map(|_| ())
    }

    fn describe(&self) -> String {
        format!("udp://{}", self.target)
    }
}

pub fn connect_transport(
    protocol: CotProtocol,
    host: &str,
    port: u16,
) -> Result<Box<dyn CotTransport>, SinkError> {
    Ok(match protocol {
        CotProtocol::Tcp => Box::new(TcpTransport::new(host, port)),
        CotProtocol::Udp => Box::new(UdpTransport::new(host, port)?),
    })
}

#[derive(Debug, Clone)]
pub struct CotOptions {
    /// Detections below this confidence are not reported.
    pub min_confidence: f32,
    pub stale_after: Duration,
    pub track_interval: Duration,
    pub batch_window: Duration,
    pub max_per_batch: usize,
    pub max_pending: usize,
}

impl Default for CotOptions {
    fn default() -> Self {
        Self {
            min_confidence: 0.5,
            stale_after: Duration::from_secs(600),
            track_interval: Duration::from_secs(3),
            batch_window: Duration::from_secs(5),
            max_per_batch: 5,
            max_pending: 20,
        }
    }
}

#[derive(Debug, Clone)]
struct PendingEvent {
    frame: u64,
    class_name: String,
    confidence: f32,
    track_id: Option<u64>,
    geo: GeoCoordinate,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct CotStats {
    pub sent: u64,
    pub failed: u64,
    pub rate_limited: u64,
    pub evicted: u64,
    pub without_position: u64,
}

pub struct CotForwarder {
    transport: Box<dyn CotTransport>,
    options: CotOptions,
    pending: VecDeque<PendingEvent>,
    last_sent: HashMap<u64, Instant>,
    last_batch: Option<Instant>,
    stats: CotStats,
}

impl CotForwarder {
    pub fn new(transport: Box<dyn CotTransport>, options: CotOptions) -> Self {
        info!(endpoint = %transport.describe(), "CoT forwarder ready");
        Self {
            transport,
            options,
            pending: VecDeque::new(),
            last_sent: HashMap::new(),
            last_batch: None,
            stats: CotStats::default(),
        }
    }

    pub fn stats(&self) -> CotStats {
        self.stats
    }

    fn accept_at(&mut self, frame: &EnrichedFrame, now: Instant, wall: DateTime<Utc>) {
        for det in &frame.detections {
            if det.confidence < self.options.min_confidence {
                continue;
            }
            let Some(geo) = det.geo else {
                self.stats.without_position += 1;
                metrics::counter!("vision_cot_events_total", "result" => "no_position")
                    .increment(1);
                continue;
            };
            self.pending.push_back(PendingEvent {
                frame: frame.index(),
                class_name: det.class_name.clone(),
                confidence: det.confidence,
                track_id: det.track_id,
                geo,
            });
            while self.pending.len() > self.options.max_pending {
                self.pending.pop_front();
                self.stats.evicted += 1;
                metrics::counter!("vision_cot_events_total", "result" => "evicted").increment(1);
            }
        }

        let due = self
            .last_batch
            .is_none_or(|last| now.duration_since(last) >= self.options.batch_window);
        if due && !self.pending.is_empty() {
            self.last_batch = Some(now);
            let take = self.options.max_per_batch.min(self.pending.len());
            let batch: Vec<_> = self.pending.drain(..take).collect();
            self.send_batch(batch, now, wall);
        }
    }

    fn send_batch(&mut self, batch: Vec<PendingEvent>, now: Instant, wall: DateTime<Utc>) {
        for event in batch {
            if let Some(track) = event.track_id {
                let recent = self
                    .last_sent
                    .get(&track)
                    .is_some_and(|&at| now.duration_since(at) < self.options.track_interval);
                if recent {
                    self.stats.rate_limited += 1;
                    metrics::counter!("vision_cot_events_total", "result" => "rate_limited")
                        .increment(1);
                    continue;
                }
                self.last_sent.insert(track, now);
            }
            let xml = build_event(&event, wall, self.options.stale_after);
            match self.transport.send(xml.as_bytes()) {
                Ok(()) => {
                    self.stats.sent += 1;
                    metrics::counter!("vision_cot_events_total", "result" => "sent").increment(1);
                }
                Err(err) => {
                    self.stats.failed += 1;
                    metrics::counter!("vision_cot_events_total", "result" => "failed")
                        .increment(1);
                    warn!(endpoint = %self.transport.describe(), "CoT send failed: {err}");
                }
            }
        }
        if self.last_sent.len() > TRACK_MEMORY {
            self.last_sent
                .retain(|_, at| now.duration_since(*at) < TRACK_EXPIRY);
        }
    }
}

impl Sink for CotForwarder {
    fn name(&self) -> &str {
        "cot"
    }

    fn kind(&self) -> SinkKind {
        SinkKind::Metadata
    }

    fn accepts(&mut self, frame: &EnrichedFrame) -> Result<(), SinkError> {
        self.accept_at(frame, Instant::now(), Utc::now());
        Ok(())
    }

    fn shutdown(&mut self) -> Result<(), SinkError> {
        if !self.pending.is_empty() {
            debug!(remaining = self.pending.len(), "flushing pending CoT events");
            let batch: Vec<_> = self.pending.drain(..).collect();
            self.send_batch(batch, Instant::now(), Utc::now());
        }
        let stats = self.stats;
        info!(
            sent = stats.sent,
            failed = stats.failed,
            rate_limited = stats.rate_limited,
            without_position = stats.without_position,
            "CoT forwarder stopped"
        );
        Ok(())
    }
}

fn cot_type(class_name: &str) -> &'static str {
    let lower = class_name.to_lowercase();
    if HOSTILE_MARKERS.iter().any(|marker| lower.contains(marker)) {
        "a-h-G-U-C"
    } else {
        "a-n-G-U-C"
    }
}

fn escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for ch in text.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            _ => out.push(ch),
        }
    }
    out
}

fn build_event(event: &PendingEvent, now: DateTime<Utc>, stale_after: Duration) -> String {
    let class = escape(&event.class_name);
    let percent = (event.confidence * 100.0).round();
    let (uid, callsign) = match event.track_id {
        Some(track) => (
            format!("OVERWATCH-{class}-{track}"),
            format!("{class}_ID{track}_{percent:.0}%"),
        ),
        None => {
            let suffix = Uuid::new_v4().simple().to_string();
            (
                format!("OVERWATCH-{class}-{}-{}", event.frame, &suffix[..8]),
                format!("{class}_{percent:.0}%"),
            )
        }
    };
    let time = now.to_rfc3339_opts(SecondsFormat::Millis, true);
    let stale = chrono::Duration::from_std(stale_after)
        .ok()
        .and_then(|delta| now.checked_add_signed(delta))
        .unwrap_or(now)
        .to_rfc3339_opts(SecondsFormat::Millis, true);
    let geo = &event.geo;
    let mut remarks = match event.track_id {
        Some(track) => format!("Tracked: {class} (ID:{track})"),
        None => format!("Detected: {class}"),
    };
    let _ = write!(
        remarks,
        " | Distance: {:.0}m | Camera: Az={:.1} El={:.1} | Conf={:.1}%",
        geo.ground_distance_m,
        geo.look_azimuth_deg,
        geo.look_elevation_deg,
        event.confidence * 100.0
    );

    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<event version="2.0" uid="{uid}" type="{kind}" time="{time}" start="{time}" stale="{stale}" how="m-g">
<point lat="{lat:.6}" lon="{lon:.6}" hae="0.0" ce="10.0" le="10.0"/>
<detail>
<contact callsign="{callsign}" endpoint="*:-1:stcp"/>
<uid Droid="{callsign}"/>
<__group name="Yellow" role="Team Member"/>
<takv device="Overwatch" platform="overwatch" os="Linux" version="{version}"/>
<track speed="0.0" course="{course:.1}"/>
<remarks>{remarks}</remarks>
<precisionlocation altsrc="DTED0" geopointsrc="Photogrammetry"/>
</detail>
</event>
"#,
        kind = cot_type(&event.class_name),
        lat = geo.latitude,
        lon = geo.longitude,
        version = env!("CARGO_PKG_VERSION"),
        course = geo.look_azimuth_deg,
    )
}

#[cfg(test)]
mod tests {
    use std::{
        io::Read,
        net::TcpListener,
        sync::{Arc, Mutex},
    };

    use geolocate::Pointing;
    use ml_core::BoundingBox;
    use video_ingest::{Frame, FrameFormat};

    use super::*;
    use crate::frame::{Detection, FrameRecord};

    #[derive(Clone, Default)]
    struct Recording {
        sent: Arc<Mutex<Vec<String>>>,
        fail: bool,
    }

    impl CotTransport for Recording {
        fn send(&mut self, payload: &[u8]) -> io::Result<()> {
            if self.fail {
                return Err(io::Error::new(io::ErrorKind::ConnectionRefused, "down"));
            }
            self.sent
                .lock()
                .unwrap()
                .push(String::from_utf8(payload.to_vec()).unwrap());
            Ok(())
        }

        fn describe(&self) -> String {
            "recording".into()
        }
    }

    impl Recording {
        fn uids(&self) -> Vec<String> {
            self.sent
                .lock()
                .unwrap()
                .iter()
                .filter_map(|xml| {
                    let start = xml.find("uid=\"")? + 5;
                    let end = start + xml[start..].find('"')?;
                    Some(xml[start..end].to_string())
                })
                .collect()
        }
    }

    fn geo() -> GeoCoordinate {
        GeoCoordinate {
            latitude: 45.123456,
            longitude: 16.654321,
            ground_distance_m: 120.0,
            look_azimuth_deg: 270.0,
            look_elevation_deg: -45.0,
            pointing: Pointing::Relative,
            calibrated: true,
        }
    }

    fn detection(class: &str, track: Option<u64>, located: bool) -> Detection {
        Detection {
            bbox: BoundingBox::new(0.0, 0.0, 4.0, 4.0),
            class_name: class.into(),
            confidence: 0.9,
            track_id: track,
            geo: located.then(geo),
        }
    }

    fn frame(index: u64, detections: Vec<Detection>) -> EnrichedFrame {
        EnrichedFrame {
            record: FrameRecord {
                index,
                image: Frame {
                    data: Vec::new(),
                    width: 0,
                    height: 0,
                    timestamp_ms: 0,
                    format: FrameFormat::Bgr8,
                },
                captured_at: Utc::now(),
                telemetry: None,
            },
            detections,
            inference_latency: Duration::ZERO,
        }
    }

    fn forwarder(transport: &Recording) -> CotForwarder {
        CotForwarder::new(Box::new(transport.clone()), CotOptions::default())
    }

    #[test]
    fn event_xml_carries_position_type_and_callsign() {
        let event = PendingEvent {
            frame: 4,
            class_name: "gun".into(),
            confidence: 0.9,
            track_id: Some(7),
            geo: geo(),
        };
        let now = DateTime::parse_from_rfc3339("2024-05-01T12:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let xml = build_event(&event, now, Duration::from_secs(600));
        assert!(xml.contains(r#"version="2.0""#));
        assert!(xml.contains(r#"uid="OVERWATCH-gun-7""#));
        assert!(xml.contains(r#"type="a-h-G-U-C""#));
        assert!(xml.contains(r#"how="m-g""#));
        assert!(xml.contains(r#"time="2024-05-01T12:00:00.000Z""#));
        assert!(xml.contains(r#"stale="2024-05-01T12:10:00.000Z""#));
        assert!(xml.contains(r#"lat="45.123456" lon="16.654321""#));
        assert!(xml.contains(r#"ce="10.0" le="10.0""#));
        assert!(xml.contains(r#"callsign="gun_ID7_90%""#));
        assert!(xml.contains(r#"course="270.0""#));
        assert!(xml.contains("Tracked: gun (ID:7)"));
    }

    #[test]
    fn neutral_type_and_escaped_untracked_names() {
        assert_eq!(cot_type("Person"), "a-n-G-U-C");
        assert_eq!(cot_type("Threat-vehicle"), "a-h-G-U-C");
        let event = PendingEvent {
            frame: 9,
            class_name: "a<b".into(),
            confidence: 0.5,
            track_id: None,
            geo: geo(),
        };
        let xml = build_event(&event, Utc::now(), Duration::from_secs(60));
        assert!(xml.contains("uid=\"OVERWATCH-a&lt;b-9-"));
        assert!(xml.contains(r#"callsign="a&lt;b_50%""#));
        assert!(!xml.contains("a<b"));
    }

    #[test]
    fn batches_are_capped_and_spaced_by_the_window() {
        let transport = Recording::default();
        let mut cot = forwarder(&transport);
        let t0 = Instant::now();
        let dets = (0..7).map(|t| detection("car", Some(t), true)).collect();
        cot.accept_at(&frame(0, dets), t0, Utc::now());
        assert_eq!(transport.uids().len(), 5);

        cot.accept_at(&frame(1, Vec::new()), t0 + Duration::from_secs(1), Utc::now());
        assert_eq!(transport.uids().len(), 5);

        cot.accept_at(&frame(2, Vec::new()), t0 + Duration::from_secs(5), Utc::now());
        let uids = transport.uids();
        assert_eq!(uids.len(), 7);
        assert_eq!(uids[6], "OVERWATCH-car-6");
    }

    #[test]
    fn tracks_are_rate_limited() {
        let transport = Recording::default();
        let mut cot = forwarder(&transport);
        let t0 = Instant::now();
        let dets = vec![detection("car", Some(1), true), detection("car", Some(1), true)];
        cot.accept_at(&frame(0, dets), t0, Utc::now());
        assert_eq!(transport.uids().len(), 1);
        assert_eq!(cot.stats().rate_limited, 1);

        let later = t0 + Duration::from_secs(5);
        cot.accept_at(&frame(1, vec![detection("car", Some(1), true)]), later, Utc::now());
        assert_eq!(transport.uids().len(), 2);
    }

    #[test]
    fn detections_without_position_are_counted_not_sent() {
        let transport = Recording::default();
        let mut cot = forwarder(&transport);
        cot.accepts(&frame(0, vec![detection("car", Some(1), false)]))
            .unwrap();
        assert!(transport.uids().is_empty());
        assert_eq!(cot.stats().without_position, 1);
    }

    #[test]
    fn low_confidence_detections_are_ignored() {
        let transport = Recording::default();
        let mut cot = forwarder(&transport);
        let mut weak = detection("car", Some(1), true);
        weak.confidence = 0.2;
        cot.accepts(&frame(0, vec![weak])).unwrap();
        assert!(transport.uids().is_empty());
        assert_eq!(cot.stats().without_position, 0);
    }

    #[test]
    fn pending_queue_keeps_the_most_recent_events() {
        let transport = Recording::default();
        let mut cot = forwarder(&transport);
        let t0 = Instant::now();
        cot.accept_at(&frame(0, vec![detection("car", Some(100), true)]), t0, Utc::now());

        let dets = (0..30).map(|t| detection("car", Some(t), true)).collect();
        cot.accept_at(&frame(1, dets), t0 + Duration::from_secs(1), Utc::now());
        assert_eq!(cot.pending.len(), 20);
        assert_eq!(cot.stats().evicted, 10);
        assert_eq!(cot.pending.front().and_then(|e| e.track_id), Some(10));
    }

    #[test]
    fn shutdown_flushes_everything_pending() {
        let transport = Recording::default();
        let mut cot = forwarder(&transport);
        let dets = (0..8).map(|t| detection("car", Some(t), true)).collect();
        cot.accepts(&frame(0, dets)).unwrap();
        assert_eq!(transport.uids().len(), 5);
        cot.shutdown().unwrap();
        assert_eq!(transport.uids().len(), 8);
    }

    #[test]
    fn transport_failures_never_fail_the_sink() {
        let transport = Recording {
            fail: true,
            ..Recording::default()
        };
        let mut cot = forwarder(&transport);
        for index in 0..3 {
            let dets = vec![detection("car", None, true)];
            assert!(cot.accepts(&frame(index, dets)).is_ok());
        }
        assert!(cot.shutdown().is_ok());
        assert!(cot.stats().failed >= 1);
    }

    #[test]
    fn tcp_transport_delivers_and_reconnects_lazily() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let mut transport = TcpTransport::new("127.0.0.1", port);
        transport.send(b"<event/>").unwrap();
        let (mut conn, _) = listener.accept().unwrap();
        drop(transport);
        let mut received = String::new();
        conn.read_to_string(&mut received).unwrap();
        assert_eq!(received, "<event/>");
    }

    #[test]
    fn udp_transport_sends_datagrams() {
        let listener = UdpSocket::bind("127.0.0.1:0").unwrap();
        listener
            .set_read_timeout(Some(Duration::from_secs(2)))
            .unwrap();
        let port = listener.local_addr().unwrap().port();
        let mut transport = connect_transport(CotProtocol::Udp, "127.0.0.1", port).unwrap();
        transport.send(b"<event/>").unwrap();
        let mut buf = [0u8; 64];
        let len = listener.recv(&mut buf).unwrap();
        assert_eq!(&buf[..len], b"<event/>");
    }
}
