//! Ground projection of image pixels using platform telemetry.
//!
//! The model is a local tangent plane: flat earth around the platform,
//! 111 320 m per degree of latitude, linear pixel-to-angle mapping across the
//! field of view and no lens distortion or sensor roll. The ground range is
//! `height * tan(look_down)`, which is the tangent model this tool has always
//! reported; it matches the textbook `height / tan(depression)` only at 45°.

use klv::TelemetryRecord;
use serde::{Deserialize, Serialize};

pub const METERS_PER_DEGREE: f64 = 111_320.0;
/// Horizontal field of view assumed when the telemetry carries none.
pub const DEFAULT_HORIZONTAL_FOV_DEG: f64 = 60.0;
/// Look angles shallower than this are treated as pointing at the horizon.
pub const MIN_DEPRESSION_DEG: f64 = 5.0;
/// Boresight elevation used when sensor pointing is unknown.
pub const NADIR_ELEVATION_DEG: f64 = -90.0;

const MAX_REFERENCE_LATITUDE_DEG: f64 = 89.9;

/// Where the boresight orientation came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Pointing {
    /// World-frame gimbal angles reported directly.
    Absolute,
    /// Gimbal angles relative to the airframe, added to heading and pitch.
    Relative,
    /// No gimbal angles: straight down along the platform heading.
    Nadir,
}

/// Physical camera geometry. When known it replaces the telemetry fields of
/// view.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SensorOptics {
    pub sensor_width_mm: f64,
    pub sensor_height_mm: f64,
    pub focal_length_mm: f64,
}

impl SensorOptics {
    /// Full horizontal and vertical angle of view in degrees.
    pub fn fields_of_view(&self) -> Option<(f64, f64)> {
        let usable = |v: f64| v.is_finite() && v > 0.0;
        if !(usable(self.sensor_width_mm)
            && usable(self.sensor_height_mm)
            && usable(self.focal_length_mm))
        {
            return None;
        }
        let angle = |size: f64| (size / (2.0 * self.focal_length_mm)).atan().to_degrees() * 2.0;
        Some((angle(self.sensor_width_mm), angle(self.sensor_height_mm)))
    }
}

/// Estimated ground position of a pixel, with the look geometry that produced it.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoCoordinate {
    pub latitude: f64,
    pub longitude: f64,
    pub ground_distance_m: f64,
    pub look_azimuth_deg: f64,
    pub look_elevation_deg: f64,
    pub pointing: Pointing,
    /// True when the angles came from sensor optics or telemetry fields of
    /// view rather than the default.
    pub calibrated: bool,
}

/// Projects `(pixel_x, pixel_y)` of a `width`×`height` image onto the ground.
///
/// Returns `None` when telemetry is absent, lacks a position or a positive
/// height, or when the look direction does not intersect the ground at a
/// usable depression angle.
pub fn project(
    pixel_x: f64,
    pixel_y: f64,
    width: u32,
    height: u32,
    telemetry: Option<&TelemetryRecord>,
) -> Option<GeoCoordinate> {
    project_with(pixel_x, pixel_y, width, height, telemetry, None)
}

/// [`project`] with optional camera optics taking precedence over the
/// telemetry fields of view.
pub fn project_with(
    pixel_x: f64,
    pixel_y: f64,
    width: u32,
    height: u32,
    telemetry: Option<&TelemetryRecord>,
    optics: Option<&SensorOptics>,
) -> Option<GeoCoordinate> {
    let telemetry = telemetry?;
    if width == 0 || height == 0 {
        return None;
    }
    let origin_lat = telemetry.latitude?;
    let origin_lon = telemetry.longitude?;
    let platform_height = telemetry.altitude.for_projection()?;
    if platform_height.is_nan() || platform_height <= 0.0 {
        return None;
    }

    let (hfov, vfov, calibrated) = match optics.and_then(SensorOptics::fields_of_view) {
        Some((hfov, vfov)) => (hfov, vfov, true),
        None => fields_of_view(telemetry, width, height),
    };
    let offset_x = pixel_x / f64::from(width) - 0.5;
    let offset_y = pixel_y / f64::from(height) - 0.5;

    let (pointing, boresight_azimuth, boresight_elevation) = boresight(telemetry);
    let azimuth = (boresight_azimuth + offset_x * hfov).rem_euclid(360.0);
    let elevation = boresight_elevation + offset_y * vfov;
    if elevation >= 0.0 {
        return None;
    }
    let look_down = elevation.abs();
    // the tangent diverges at nadir and turns negative past it
    if !(MIN_DEPRESSION_DEG..90.0).contains(&look_down) {
        return None;
    }

    let ground_distance = platform_height * look_down.to_radians().tan();
    let north = ground_distance * azimuth.to_radians().cos();
    let east = ground_distance * azimuth.to_radians().sin();

    let reference_lat =
        origin_lat.clamp(-MAX_REFERENCE_LATITUDE_DEG, MAX_REFERENCE_LATITUDE_DEG);
    let latitude = (origin_lat + north / METERS_PER_DEGREE).clamp(-90.0, 90.0);
    let longitude = wrap_longitude(
        origin_lon + east / (METERS_PER_DEGREE * reference_lat.to_radians().cos()),
    );
    if !latitude.is_finite() || !longitude.is_finite() {
        return None;
    }

    Some(GeoCoordinate {
        latitude,
        longitude,
        ground_distance_m: ground_distance,
        look_azimuth_deg: azimuth,
        look_elevation_deg: elevation,
        pointing,
        calibrated,
    })
}

/// Boresight azimuth and elevation in the world frame.
pub fn boresight(telemetry: &TelemetryRecord) -> (Pointing, f64, f64) {
    let heading = telemetry.platform_heading.unwrap_or(0.0);
    if telemetry.sensor_absolute_azimuth.is_some() || telemetry.sensor_absolute_elevation.is_some()
    {
        return (
            Pointing::Absolute,
            telemetry.sensor_absolute_azimuth.unwrap_or(0.0),
            telemetry
                .sensor_absolute_elevation
                .unwrap_or(NADIR_ELEVATION_DEG),
        );
    }
    if telemetry.sensor_relative_azimuth.is_some() || telemetry.sensor_relative_elevation.is_some()
    {
        return (
            Pointing::Relative,
            heading + telemetry.sensor_relative_azimuth.unwrap_or(0.0),
            telemetry.platform_pitch.unwrap_or(0.0)
                + telemetry
                    .sensor_relative_elevation
                    .unwrap_or(NADIR_ELEVATION_DEG),
        );
    }
    (Pointing::Nadir, heading, NADIR_ELEVATION_DEG)
}

/// Horizontal and vertical field of view in degrees, and whether both came
/// from the telemetry. Without both, the default horizontal field applies and
/// the vertical one follows the aspect ratio.
pub fn fields_of_view(telemetry: &TelemetryRecord, width: u32, height: u32) -> (f64, f64, bool) {
    let positive = |fov: &f64| *fov > 0.0;
    match (
        telemetry.horizontal_fov.filter(positive),
        telemetry.vertical_fov.filter(positive),
    ) {
        (Some(hfov), Some(vfov)) => (hfov, vfov, true),
        _ => (
            DEFAULT_HORIZONTAL_FOV_DEG,
            DEFAULT_HORIZONTAL_FOV_DEG * f64::from(height) / f64::from(width.max(1)),
            false,
        ),
    }
}

/// Wraps a longitude into `[-180, 180)`.
pub fn wrap_longitude(longitude: f64) -> f64 {
    (longitude + 180.0).rem_euclid(360.0) - 180.0
}
