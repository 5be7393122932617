//! Detection capability consumed by the inference stage.
//!
//! Detectors receive a borrowed BGR image and return [`RawDetection`]s in
//! image pixel coordinates. Failures are classified as transient (skip this
//! frame) or fatal (stop the pipeline).

#[cfg(feature = "with-tch")]
pub mod detector;
mod error;
mod geometry;
mod stub;
mod tracker;

pub use error::DetectionError;
pub use geometry::BoundingBox;
pub use stub::StubDetector;
pub use tracker::IouTracker;

#[cfg(feature = "with-tch")]
pub use tch;

/// Borrowed view of a packed BGR8 image.
#[derive(Debug, Clone, Copy)]
pub struct ImageView<'a> {
    pub data: &'a [u8],
    pub width: u32,
    pub height: u32,
}

impl ImageView<'_> {
    pub fn expected_len(&self) -> usize {
        self.width as usize * self.height as usize * 3
    }
}

/// Detector output before telemetry fusion.
#[derive(Debug, Clone, PartialEq)]
pub struct RawDetection {
    pub bbox: BoundingBox,
    pub class_name: String,
    pub confidence: f32,
    /// Identity stable across frames for the same physical object, if tracked.
    pub track_id: Option<u64>,
}

/// Object detection capability.
///
/// An implementation is owned by exactly one inference thread and may keep
/// internal state (tracker, model handles) across calls.
pub trait ObjectDetector {
    fn infer(&mut self, image: ImageView<'_>) -> Result<Vec<RawDetection>, DetectionError>;

    fn describe(&self) -> String {
        std::any::type_name::<Self>().to_string()
    }
}

impl<D: ObjectDetector + ?Sized> ObjectDetector for Box<D> {
    fn infer(&mut self, image: ImageView<'_>) -> Result<Vec<RawDetection>, DetectionError> {
        (**self).infer(image)
    }

    fn describe(&self) -> String {
        (**self).describe()
    }
}
