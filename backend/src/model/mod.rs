#[cfg(feature = "torch")]
pub mod torch;
pub mod vocab;

use std::fmt;
use std::sync::Arc;

use image::DynamicImage;

use crate::config::AppConfig;
use crate::error::TaggerError;

pub use vocab::Vocabulary;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum DeviceKind {
    Accelerator,
    General,
}

impl fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceKind::Accelerator => f.write_str("accelerator"),
            DeviceKind::General => f.write_str("general"),
        }
    }
}

/// One loaded tagging model bound to a device.
///
/// `score` returns one row of raw scores per input image, each row indexed by
/// the vocabulary. Failures coming from the accelerator runtime must be
/// reported as `TaggerError::DeviceFault` so the pool can fail over.
pub trait TagModel: Send {
    fn device(&self) -> DeviceKind;

    fn score(&mut self, images: &[DynamicImage]) -> Result<Vec<Vec<f32>>, TaggerError>;
}

/// Loads models onto a requested device kind.
///
/// Asking for `Accelerator` may yield a model on the general device when no
/// accelerator is present; callers inspect `TagModel::device` to find out.
pub trait ModelLoader: Send + Sync {
    fn load(&self, target: DeviceKind) -> Result<Box<dyn TagModel>, TaggerError>;
}

/// The loader compiled into this build.
#[cfg(feature = "torch")]
pub fn build_loader(config: &AppConfig) -> Result<Arc<dyn ModelLoader>, TaggerError> {
    Ok(Arc::new(torch::TorchLoader::new(
        config.model_path.clone(),
        config.batch_size,
        config.image_size,
    )))
}

#[cfg(not(feature = "torch"))]
pub fn build_loader(_config: &AppConfig) -> Result<Arc<dyn ModelLoader>, TaggerError> {
    Err(TaggerError::Config(
        "no model backend compiled in; rebuild with `--features torch`".into(),
    ))
}
