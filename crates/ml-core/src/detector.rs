use std::{convert::TryFrom, path::Path};

use tch::{self, Device, Kind, Tensor};
use tracing::debug;

use crate::{
    BoundingBox, DetectionError, ImageView, IouTracker, ObjectDetector, RawDetection,
};

const MAX_DETECTIONS: usize = 512;

/// TorchScript-backed detector for YOLO-style heads emitting `(cx, cy, w, h, conf, class)` rows.
pub struct TorchDetector {
    module: tch::CModule,
    device: Device,
    input_size: (i64, i64),
    confidence_threshold: f32,
    labels: Vec<String>,
    tracker: IouTracker,
}

impl TorchDetector {
    /// Loads a TorchScript module onto `device`. Failures are fatal.
    pub fn load<P: AsRef<Path>>(
        model_path: P,
        device: Device,
        input_size: (i64, i64),
        labels: Vec<String>,
    ) -> Result<Self, DetectionError> {
        let path = model_path.as_ref();
        let module = tch::CModule::load_on_device(path, device).map_err(|err| {
            DetectionError::Fatal(format!("failed to load {}: {err}", path.display()))
        })?;
        Ok(Self {
            module,
            device,
            input_size,
            confidence_threshold: 0.25,
            labels,
            tracker: IouTracker::default(),
        })
    }

    pub fn with_confidence_threshold(mut self, confidence: f32) -> Self {
        self.confidence_threshold = confidence;
        self
    }

    pub fn device(&self) -> Device {
        self.device
    }

    fn label(&self, class_id: i64) -> String {
        usize::try_from(class_id)
            .ok()
            .and_then(|idx| self.labels.get(idx).cloned())
            .unwrap_or_else(|| format!("class_{class_id}"))
    }

    /// Converts a BGR frame into a normalised RGB `[1, 3, H, W]` tensor at the model input size.
    fn bgr_to_tensor(&self, image: ImageView<'_>) -> Result<Tensor, DetectionError> {
        if image.data.len() != image.expected_len() {
            return Err(DetectionError::Transient(format!(
                "unexpected frame buffer size: got {} bytes, expected {}",
                image.data.len(),
                image.expected_len()
            )));
        }
        let (in_w, in_h) = self.input_size;
        let tensor = Tensor::from_slice(image.data)
            .to_device(self.device)
            .to_kind(Kind::Float)
            .view([1, i64::from(image.height), i64::from(image.width), 3])
            .permute([0, 3, 1, 2])
            .flip([1])
            / 255.0;
        Ok(tensor.upsample_bilinear2d([in_h, in_w], false, None, None))
    }

    fn run(
        &self,
        input: &Tensor,
        image: ImageView<'_>,
    ) -> Result<Vec<RawDetection>, tch::TchError> {
        let output = self.module.forward_ts(&[input])?;
        let shape = output.size();
        if shape.len() != 3 || shape[0] != 1 || shape[1] < 5 {
            return Err(tch::TchError::Shape(format!(
                "unexpected detector output shape: {shape:?}"
            )));
        }

        let preds = output
            .to_device(Device::Cpu)
            .squeeze_dim(0)
            .permute([1, 0])
            .contiguous();
        let rows: Vec<Vec<f32>> = Vec::<Vec<f32>>::try_from(&preds)?;

        let (in_w, in_h) = self.input_size;
        let scale_x = image.width as f32 / in_w as f32;
        let scale_y = image.height as f32 / in_h as f32;

        let mut detections = Vec::new();
        for row in rows {
            if row.len() < 5 || row[4] < self.confidence_threshold {
                continue;
            }
            let class_id = if row.len() > 5 { row[5] as i64 } else { 0 };
            detections.push(RawDetection {
                bbox: BoundingBox::from_center(
                    row[0] * scale_x,
                    row[1] * scale_y,
                    row[2] * scale_x,
                    row[3] * scale_y,
                ),
                class_name: self.label(class_id),
                confidence: row[4],
                track_id: None,
            });
            if detections.len() >= MAX_DETECTIONS {
                break;
            }
        }
        Ok(detections)
    }
}

impl ObjectDetector for TorchDetector {
    fn infer(&mut self, image: ImageView<'_>) -> Result<Vec<RawDetection>, DetectionError> {
        let input = self.bgr_to_tensor(image)?;
        let mut detections = self
            .run(&input, image)
            .map_err(|err| DetectionError::Transient(err.to_string()))?;
        self.tracker.assign(&mut detections);
        debug!("torch detector produced {} detection(s)", detections.len());
        Ok(detections)
    }

    fn describe(&self) -> String {
        format!("torchscript detector on {:?}", self.device)
    }
}
