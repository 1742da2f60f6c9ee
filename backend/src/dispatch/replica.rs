use image::DynamicImage;
use parking_lot::Mutex;

use crate::error::TaggerError;
use crate::model::{DeviceKind, TagModel};

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ExecutionMode {
    Normal,
    Degraded,
}

struct Slot {
    model: Box<dyn TagModel>,
    mode: ExecutionMode,
}

/// One model replica. The mutex serializes scoring calls: a model instance
/// is never used by two callers at once.
pub struct ReplicaHandle {
    index: usize,
    slot: Mutex<Slot>,
}

impl ReplicaHandle {
    pub fn new(index: usize, model: Box<dyn TagModel>) -> Self {
        Self {
            index,
            slot: Mutex::new(Slot {
                model,
                mode: ExecutionMode::Normal,
            }),
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn device(&self) -> DeviceKind {
        self.slot.lock().model.device()
    }

    pub fn mode(&self) -> ExecutionMode {
        self.slot.lock().mode
    }

    pub fn score(&self, images: &[DynamicImage]) -> Result<Vec<Vec<f32>>, TaggerError> {
        let mut slot = self.slot.lock();
        let rows = slot.model.score(images)?;
        if rows.len() != images.len() {
            return Err(TaggerError::Model(format!(
                "replica {} returned {} score rows for {} images",
                self.index,
                rows.len(),
                images.len()
            )));
        }
        Ok(rows)
    }

    /// Swap in a replacement model and mark the replica degraded.
    /// Waits for any in-flight call on this replica to finish first.
    pub(crate) fn degrade(&self, model: Box<dyn TagModel>) {
        let mut slot = self.slot.lock();
        slot.model = model;
        slot.mode = ExecutionMode::Degraded;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixed {
        device: DeviceKind,
        rows: usize,
    }

    impl TagModel for Fixed {
        fn device(&self) -> DeviceKind {
            self.device
        }

        fn score(&mut self, _images: &[DynamicImage]) -> Result<Vec<Vec<f32>>, TaggerError> {
            Ok(vec![vec![0.5]; self.rows])
        }
    }

    #[test]
    fn degrade_swaps_model_and_mode() {
        let replica = ReplicaHandle::new(
            2,
            Box::new(Fixed {
                device: DeviceKind::Accelerator,
                rows: 1,
            }),
        );
        assert_eq!(replica.mode(), ExecutionMode::Normal);
        assert_eq!(replica.device(), DeviceKind::Accelerator);

        replica.degrade(Box::new(Fixed {
            device: DeviceKind::General,
            rows: 1,
        }));
        assert_eq!(replica.index(), 2);
        assert_eq!(replica.mode(), ExecutionMode::Degraded);
        assert_eq!(replica.device(), DeviceKind::General);
    }

    #[test]
    fn row_count_must_match_batch() {
        let replica = ReplicaHandle::new(
            0,
            Box::new(Fixed {
                device: DeviceKind::General,
                rows: 3,
            }),
        );
        let images = vec![DynamicImage::new_rgb8(1, 1); 2];
        let err = replica.score(&images).unwrap_err();
        assert_eq!(err.classification(), "ModelError");
    }
}
