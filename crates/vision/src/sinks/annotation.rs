//! CPU rendering of detection overlays onto captured frames.

use image::{ImageBuffer, Rgb, RgbImage, codecs::jpeg::JpegEncoder};

use crate::{frame::EnrichedFrame, sinks::SinkError};

const GEOLOCATED: Rgb<u8> = Rgb([0, 255, 0]);
const UNLOCATED: Rgb<u8> = Rgb([255, 200, 0]);
const LABEL_BACKGROUND: Rgb<u8> = Rgb([0, 0, 0]);
const HUD_TEXT: Rgb<u8> = Rgb([255, 255, 255]);
const GLYPH_ADVANCE: i32 = 6;

/// Converts the BGR frame to RGB. With `overlay` set, also draws boxes,
/// labels and the HUD line.
pub fn render_frame(frame: &EnrichedFrame, overlay: bool) -> Result<RgbImage, SinkError> {
    let width = frame.record.width();
    let height = frame.record.height();
    if !frame.record.image.is_complete() {
        return Err(SinkError::Encode(format!(
            "frame {} buffer does not match {width}x{height}",
            frame.index()
        )));
    }
    let mut image = ImageBuffer::from_vec(width, height, bgr_to_rgb(&frame.record.image.data))
        .ok_or_else(|| SinkError::Encode("failed to convert frame into image buffer".into()))?;
    if !overlay {
        return Ok(image);
    }

    for det in &frame.detections {
        let color = if det.geo.is_some() { GEOLOCATED } else { UNLOCATED };
        draw_rectangle(
            &mut image,
            det.bbox.x.round() as i32,
            det.bbox.y.round() as i32,
            det.bbox.right().round() as i32,
            det.bbox.bottom().round() as i32,
            color,
        );
    }

    for det in &frame.detections {
        let label = match det.track_id {
            Some(track) => format!(
                "{} #{} {:.0}%",
                det.class_name,
                track,
                det.confidence * 100.0
            ),
            None => format!("{} {:.0}%", det.class_name, det.confidence * 100.0),
        };
        let color = if det.geo.is_some() { GEOLOCATED } else { UNLOCATED };
        let x = det.bbox.x.round() as i32;
        let y = (det.bbox.y.round() as i32 - 12).max(0);
        let text_width = label.chars().count() as i32 * GLYPH_ADVANCE;
        fill_rect(&mut image, x, y, x + text_width, y + 8, LABEL_BACKGROUND);
        draw_label(&mut image, x, y, &label, color);
    }

    let mut hud = format!(
        "FRAME {:06}  DET {}",
        frame.index(),
        frame.detections.len()
    );
    if let Some(telemetry) = frame.telemetry() {
        if let (Some(lat), Some(lon)) = (telemetry.latitude, telemetry.longitude) {
            hud.push_str(&format!("  {lat:.5} {lon:.5}"));
        }
        if let Some(alt) = telemetry.altitude.reported() {
            hud.push_str(&format!("  ALT {alt:.0}"));
        }
    } else {
        hud.push_str("  NO KLV");
    }
    let hud_width = (hud.chars().count() as i32 * GLYPH_ADVANCE).min(width as i32);
    let hud_y = (height as i32 - 12).max(0);
    fill_rect(&mut image, 0, hud_y, hud_width + 4, hud_y + 8, LABEL_BACKGROUND);
    draw_label(&mut image, 2, hud_y, &hud, HUD_TEXT);

    Ok(image)
}

pub fn encode_jpeg(image: &RgbImage, quality: u8) -> Result<Vec<u8>, SinkError> {
    let mut buffer = Vec::new();
    JpegEncoder::new_with_quality(&mut buffer, quality.clamp(1, 100)).encode_image(image)?;
    Ok(buffer)
}

fn bgr_to_rgb(input: &[u8]) -> Vec<u8> {
    let mut output = Vec::with_capacity(input.len());
    for chunk in input.chunks_exact(3) {
        output.extend_from_slice(&[chunk[2], chunk[1], chunk[0]]);
    }
    output
}

fn clamp_box(image: &RgbImage, left: i32, top: i32, right: i32, bottom: i32) -> [i32; 4] {
    let max_x = (image.width() as i32).saturating_sub(1);
    let max_y = (image.height() as i32).saturating_sub(1);
    [
        left.clamp(0, max_x),
        top.clamp(0, max_y),
        right.clamp(0, max_x),
        bottom.clamp(0, max_y),
    ]
}

fn draw_rectangle(
    image: &mut RgbImage,
    left: i32,
    top: i32,
    right: i32,
    bottom: i32,
    color: Rgb<u8>,
) {
    let [left, top, right, bottom] = clamp_box(image, left, top, right, bottom);
    for x in left..=right {
        image.put_pixel(x as u32, top as u32, color);
        image.put_pixel(x as u32, bottom as u32, color);
    }
    for y in top..=bottom {
        image.put_pixel(left as u32, y as u32, color);
        image.put_pixel(right as u32, y as u32, color);
    }
}

fn fill_rect(image: &mut RgbImage, left: i32, top: i32, right: i32, bottom: i32, color: Rgb<u8>) {
    let [left, top, right, bottom] = clamp_box(image, left, top, right, bottom);
    for y in top..=bottom {
        for x in left..=right {
            image.put_pixel(x as u32, y as u32, color);
        }
    }
}

fn draw_label(image: &mut RgbImage, mut x: i32, y: i32, text: &str, color: Rgb<u8>) {
    let (width, height) = (image.width() as i32, image.height() as i32);
    for ch in text.chars().flat_map(char::to_uppercase) {
        if let Some(glyph) = glyph_bits(ch) {
            for (row, pattern) in glyph.iter().enumerate() {
                let py = y + row as i32;
                if py < 0 || py >= height {
                    continue;
                }
                for col in 0..5 {
                    let px = x + col;
                    if (pattern >> (4 - col)) & 1 == 1 && px >= 0 && px < width {
                        image.put_pixel(px as u32, py as u32, color);
                    }
                }
            }
        }
        x += GLYPH_ADVANCE;
    }
}

/// 5x7 bitmap font, most significant of the low five bits is the left column.
fn glyph_bits(ch: char) -> Option<[u8; 7]> {
    let rows = match ch {
        'A' => [0b01110, 0b10001, 0b10001, 0b11111, 0b10001, 0b10001, 0b10001],
        'B' => [0b11110, 0b10001, 0b10001, 0b11110, 0b10001, 0b10001, 0b11110],
        'C' => [0b01110, 0b10001, 0b10000, 0b10000, 0b10000, 0b10001, 0b01110],
        'D' => [0b11100, 0b10010, 0b10001, 0b10001, 0b10001, 0b10010, 0b11100],
        'E' => [0b11111, 0b10000, 0b10000, 0b11110, 0b10000, 0b10000, 0b11111],
        'F' => [0b11111, 0b10000, 0b10000, 0b11110, 0b10000, 0b10000, 0b10000],
        'G' => [0b01110, 0b10001, 0b10000, 0b10111, 0b10001, 0b10001, 0b01111],
        'H' => [0b10001, 0b10001, 0b10001, 0b11111, 0b10001, 0b10001, 0b10001],
        'I' => [0b01110, 0b00100, 0b00100, 0b00100, 0b00100, 0b00100, 0b01110],
        'J' => [0b00111, 0b00010, 0b00010, 0b00010, 0b00010, 0b10010, 0b01100],
        'K' => [0b10001, 0b10010, 0b10100, 0b11000, 0b10100, 0b10010, 0b10001],
        'L' => [0b10000, 0b10000, 0b10000, 0b10000, 0b10000, 0b10000, 0b11111],
        'M' => [0b10001, 0b11011, 0b10101, 0b10101, 0b10001, 0b10001, 0b10001],
        'N' => [0b10001, 0b11001, 0b10101, 0b10101, 0b10011, 0b10001, 0b10001],
        'O' => [0b01110, 0b10001, 0b10001, 0b10001, 0b10001, 0b10001, 0b01110],
        'P' => [0b11110, 0b10001, 0b10001, 0b11110, 0b10000, 0b10000, 0b10000],
        'Q' => [0b01110, 0b10001, 0b10001, 0b10001, 0b10101, 0b10010, 0b01101],
        'R' => [0b11110, 0b10001, 0b10001, 0b11110, 0b10100, 0b10010, 0b10001],
        'S' => [0b01111, 0b10000, 0b10000, 0b01110, 0b00001, 0b00001, 0b11110],
        'T' => [0b11111, 0b00100, 0b00100, 0b00100, 0b00100, 0b00100, 0b00100],
        'U' => [0b10001, 0b10001, 0b10001, 0b10001, 0b10001, 0b10001, 0b01110],
        'V' => [0b10001, 0b10001, 0b10001, 0b10001, 0b10001, 0b01010, 0b00100],
        'W' => [0b10001, 0b10001, 0b10001, 0b10101, 0b10101, 0b10101, 0b01010],
        'X' => [0b10001, 0b10001, 0b01010, 0b00100, 0b01010, 0b10001, 0b10001],
        'Y' => [0b10001, 0b10001, 0b01010, 0b00100, 0b00100, 0b00100, 0b00100],
        'Z' => [0b11111, 0b00001, 0b00010, 0b00100, 0b01000, 0b10000, 0b11111],
        '0' => [0b01110, 0b10001, 0b10011, 0b10101, 0b11001, 0b10001, 0b01110],
        '1' => [0b00100, 0b01100, 0b00100, 0b00100, 0b00100, 0b00100, 0b01110],
        '2' => [0b01110, 0b10001, 0b00001, 0b00010, 0b00100, 0b01000, 0b11111],
        '3' => [0b11110, 0b00001, 0b00001, 0b01110, 0b00001, 0b00001, 0b11110],
        '4' => [0b00010, 0b00110, 0b01010, 0b10010, 0b11111, 0b00010, 0b00010],
        '5' => [0b11111, 0b10000, 0b11110, 0b00001, 0b00001, 0b10001, 0b01110],
        '6' => [0b00110, 0b01000, 0b10000, 0b11110, 0b10001, 0b10001, 0b01110],
        '7' => [0b11111, 0b00001, 0b00010, 0b00100, 0b01000, 0b01000, 0b01000],
        '8' => [0b01110, 0b10001, 0b10001, 0b01110, 0b10001, 0b10001, 0b01110],
        '9' => [0b01110, 0b10001, 0b10001, 0b01111, 0b00001, 0b00010, 0b01100],
        '%' => [0b10001, 0b10010, 0b00100, 0b01000, 0b10010, 0b10001, 0b00000],
        '#' => [0b01010, 0b01010, 0b11111, 0b01010, 0b11111, 0b01010, 0b01010],
        '-' => [0, 0, 0, 0b11111, 0, 0, 0],
        '_' => [0, 0, 0, 0, 0, 0, 0b11111],
        ':' => [0, 0b01100, 0b01100, 0, 0b01100, 0b01100, 0],
        '/' => [0b00001, 0b00010, 0b00010, 0b00100, 0b01000, 0b01000, 0b10000],
        '.' => [0, 0, 0, 0, 0, 0b00110, 0b00110],
        ' ' => [0; 7],
        _ => return None,
    };
    Some(rows)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use chrono::Utc;
    use ml_core::BoundingBox;
    use video_ingest::{Frame, FrameFormat};

    use super::*;
    use crate::frame::{Detection, FrameRecord};

    fn blank(width: u32, height: u32, detections: Vec<Detection>) -> EnrichedFrame {
        EnrichedFrame {
            record: FrameRecord {
                index: 3,
                image: Frame {
                    data: vec![0; (width * height * 3) as usize],
                    width,
                    height,
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

    #[test]
    fn box_outline_is_drawn_without_geolocation_colour() {
        let det = Detection {
            bbox: BoundingBox::new(20.0, 30.0, 20.0, 10.0),
            class_name: "car".into(),
            confidence: 0.7,
            track_id: Some(1),
            geo: None,
        };
        let image = render_frame(&blank(64, 64, vec![det]), true).unwrap();
        assert_eq!(*image.get_pixel(30, 40), UNLOCATED);
        assert_eq!(*image.get_pixel(20, 35), UNLOCATED);
        // interior untouched
        assert_eq!(*image.get_pixel(30, 35), Rgb([0, 0, 0]));
    }

    #[test]
    fn overlay_can_be_left_off() {
        let det = Detection {
            bbox: BoundingBox::new(20.0, 30.0, 20.0, 10.0),
            class_name: "car".into(),
            confidence: 0.7,
            track_id: None,
            geo: None,
        };
        let image = render_frame(&blank(64, 64, vec![det]), false).unwrap();
        assert!(image.pixels().all(|px| *px == Rgb([0, 0, 0])));
    }

    #[test]
    fn incomplete_buffers_are_rejected() {
        let mut frame = blank(4, 4, Vec::new());
        frame.record.image.data.truncate(10);
        assert!(matches!(render_frame(&frame, true), Err(SinkError::Encode(_))));
    }

    #[test]
    fn jpeg_output_has_soi_marker() {
        let image = render_frame(&blank(32, 32, Vec::new()), true).unwrap();
        let jpeg = encode_jpeg(&image, 80).unwrap();
        assert_eq!(&jpeg[..2], &[0xFF, 0xD8]);
    }

    #[test]
    fn font_covers_label_alphabet() {
        for ch in "ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789%#-_:/. ".chars() {
            assert!(glyph_bits(ch).is_some(), "missing glyph {ch}");
        }
    }

    #[test]
    fn bgr_conversion_swaps_red_and_blue() {
        assert_eq!(bgr_to_rgb(&[1, 2, 3, 4, 5, 6]), vec![3, 2, 1, 6, 5, 4]);
    }
}
