use crate::{BoundingBox, RawDetection};

#[derive(Debug, Clone)]
struct Track {
    id: u64,
    class_name: String,
    bbox: BoundingBox,
    missed: u32,
}

/// Greedy IoU tracker assigning stable ids to detections of the same class.
///
/// Detections that already carry a track id are left untouched.
#[derive(Debug, Clone)]
pub struct IouTracker {
    tracks: Vec<Track>,
    next_id: u64,
    min_iou: f32,
    max_missed: u32,
}

impl Default for IouTracker {
    fn default() -> Self {
        Self::new(0.3, 30)
    }
}

impl IouTracker {
    pub fn new(min_iou: f32, max_missed: u32) -> Self {
        Self {
            tracks: Vec::new(),
            next_id: 1,
            min_iou,
            max_missed,
        }
    }

    pub fn active_tracks(&self) -> usize {
        self.tracks.len()
    }

    pub fn assign(&mut self, detections: &mut [RawDetection]) {
        let mut matched = vec![false; self.tracks.len()];

        for det in detections.iter_mut().filter(|d| d.track_id.is_none()) {
            let best = self
                .tracks
                .iter()
                .enumerate()
                .filter(|(idx, track)| !matched[*idx] && track.class_name == det.class_name)
                .map(|(idx, track)| (idx, track.bbox.iou(&det.bbox)))
                .filter(|(_, iou)| *iou >= self.min_iou)
                .max_by(|a, b| a.1.total_cmp(&b.1));

            match best {
                Some((idx, _)) => {
                    matched[idx] = true;
                    let track = &mut self.tracks[idx];
                    track.bbox = det.bbox;
                    track.missed = 0;
                    det.track_id = Some(track.id);
                }
                None => {
                    let id = self.next_id;
                    self.next_id += 1;
                    self.tracks.push(Track {
                        id,
                        class_name: det.class_name.clone(),
                        bbox: det.bbox,
                        missed: 0,
                    });
                    matched.push(true);
                    det.track_id = Some(id);
                }
            }
        }

        for (track, seen) in self.tracks.iter_mut().zip(&matched) {
            if !seen {
                track.missed += 1;
            }
        }
        let max_missed = self.max_missed;
        self.tracks.retain(|track| track.missed <= max_missed);
    }
}
