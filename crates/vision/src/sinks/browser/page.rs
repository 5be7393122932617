/// Minimal player: MJPEG feed on the left, live detection list on the right.
pub(super) const PLAYER_HTML: &str = r#"<!doctype html>
<html lang="en">
<head>
<meta charset="utf-8">
<title>Overwatch</title>
<style>
  body { margin: 0; background: #0b0f14; color: #cfe3d2; font: 13px monospace; display: flex; }
  #video { flex: 3; padding: 8px; }
  #video img { width: 100%; border: 1px solid #24402c; }
  #side { flex: 1; padding: 8px; border-left: 1px solid #24402c; min-width: 260px; }
  .det { padding: 4px 0; border-bottom: 1px solid #16261b; }
  .geo { color: #7ad48a; }
  .nogeo { color: #d4b86a; }
  #status { color: #8899aa; margin-bottom: 8px; }
</style>
</head>
<body>
<div id="video"><img src="/stream.mjpg" alt="live feed"></div>
<div id="side">
  <div id="status">waiting for frames</div>
  <div id="telemetry"></div>
  <div id="detections"></div>
</div>
<script>
  const status = document.getElementById("status");
  const telemetry = document.getElementById("telemetry");
  const list = document.getElementById("detections");
  const events = new EventSource("/metadata");
  events.onmessage = (event) => {
    const msg = JSON.parse(event.data);
    status.textContent = `frame ${msg.frame}  ${msg.detection_count} detections  ${msg.inference_ms.toFixed(1)} ms`;
    const t = msg.telemetry;
    telemetry.textContent = t && t.lat != null
      ? `sensor ${t.lat.toFixed(5)}, ${t.lon.toFixed(5)}  alt ${t.alt != null ? t.alt.toFixed(0) : "?"} m`
      : "no telemetry";
    list.replaceChildren(...msg.detections.map((d) => {
      const row = document.createElement("div");
      const geo = d.geo_coordinates;
      row.className = "det " + (geo ? "geo" : "nogeo");
      const track = d.track_id != null ? ` #${d.track_id}` : "";
      const where = geo ? ` @ ${geo.latitude.toFixed(5)}, ${geo.longitude.toFixed(5)}` : "";
      row.textContent = `${d.class_name}${track} ${(d.confidence * 100).toFixed(0)}%${where}`;
      return row;
    }));
  };
  events.onerror = () => { status.textContent = "metadata stream disconnected"; };
</script>
</body>
</html>
"#;
