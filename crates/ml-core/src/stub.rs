use std::collections::BTreeMap;

use crate::{DetectionError, ImageView, ObjectDetector, RawDetection};

/// Detector returning a fixed detection list, with optional scripted failures.
///
/// Used for dry runs without a model and by pipeline tests.
#[derive(Debug, Clone, Default)]
pub struct StubDetector {
    detections: Vec<RawDetection>,
    failures: BTreeMap<u64, DetectionError>,
    calls: u64,
}

impl StubDetector {
    pub fn new(detections: Vec<RawDetection>) -> Self {
        Self {
            detections,
            ..Self::default()
        }
    }

    /// Fails the `call`-th invocation (zero based) with `error`.
    pub fn fail_on(mut self, call: u64, error: DetectionError) -> Self {
        self.failures.insert(call, error);
        self
    }

    pub fn calls(&self) -> u64 {
        self.calls
    }
}

impl ObjectDetector for StubDetector {
    fn infer(&mut self, image: ImageView<'_>) -> Result<Vec<RawDetection>, DetectionError> {
        let call = self.calls;
        self.calls += 1;
        if image.data.len() != image.expected_len() {
            return Err(DetectionError::Transient(format!(
                "frame buffer holds {} bytes, expected {}",
                image.data.len(),
                image.expected_len()
            )));
        }
        if let Some(err) = self.failures.get(&call) {
            return Err(err.clone());
        }
        Ok(self.detections.clone())
    }

    fn describe(&self) -> String {
        format!("stub detector ({} fixed detection(s))", self.detections.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::BoundingBox;

    fn image(buf: &[u8]) -> ImageView<'_> {
        ImageView {
            data: buf,
            width: 2,
            height: 2,
        }
    }

    #[test]
    fn scripted_failures_hit_only_their_call() {
        let person = RawDetection {
            bbox: BoundingBox::new(0.0, 0.0, 1.0, 1.0),
            class_name: "person".into(),
            confidence: 0.9,
            track_id: Some(1),
        };
        let mut stub = StubDetector::new(vec![person.clone()])
            .fail_on(1, DetectionError::Transient("busy".into()));
        let buf = [0u8; 12];

        assert_eq!(stub.infer(image(&buf)).unwrap(), vec![person.clone()]);
        assert!(stub.infer(image(&buf)).is_err());
        assert_eq!(stub.infer(image(&buf)).unwrap(), vec![person]);
        assert_eq!(stub.calls(), 3);
    }

    #[test]
    fn malformed_buffer_is_transient() {
        let mut stub = StubDetector::default();
        let err = stub.infer(image(&[0u8; 5])).unwrap_err();
        assert!(!err.is_fatal());
    }
}
