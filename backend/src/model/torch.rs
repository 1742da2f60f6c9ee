use std::path::PathBuf;

use image::DynamicImage;
use image::imageops::FilterType;
use tch::{CModule, Device, IValue, Kind, TchError, Tensor};

use crate::error::TaggerError;
use crate::model::{DeviceKind, ModelLoader, TagModel};

const MEAN: [f32; 3] = [0.485, 0.456, 0.406];
const STD: [f32; 3] = [0.229, 0.224, 0.225];

/// TorchScript tagger exported from the training notebook.
pub struct TorchModel {
    module: CModule,
    device: Device,
    batch_size: usize,
    image_size: u32,
}

impl TorchModel {
    fn preprocess(&self, image: &DynamicImage) -> Result<Tensor, TchError> {
        let size = self.image_size;
        let rgb = image
            .resize_exact(size, size, FilterType::Triangle)
            .to_rgb8();
        let plane = (size * size) as usize;
        let mut chw = vec![0f32; 3 * plane];
        for (i, pixel) in rgb.pixels().enumerate() {
            for c in 0..3 {
                chw[c * plane + i] = (pixel[c] as f32 / 255.0 - MEAN[c]) / STD[c];
            }
        }
        Tensor::f_from_slice(&chw)?.f_view([3, size as i64, size as i64])
    }

    fn score_chunk(&self, images: &[DynamicImage]) -> Result<Vec<Vec<f32>>, TaggerError> {
        let inputs = images
            .iter()
            .map(|image| self.preprocess(image))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| classify(self.device, e))?;
        let batch = Tensor::f_stack(&inputs, 0)
            .and_then(|batch| batch.f_to_device(self.device))
            .map_err(|e| classify(self.device, e))?;

        let output = tch::no_grad(|| self.module.forward_is(&[IValue::Tensor(batch)]))
            .map_err(|e| classify(self.device, e))?;
        let logits = match output {
            IValue::Tensor(tensor) => tensor,
            IValue::Tuple(mut values) if !values.is_empty() => match values.remove(0) {
                IValue::Tensor(tensor) => tensor,
                other => {
                    return Err(TaggerError::Model(format!(
                        "unexpected model output: {:?}",
                        other
                    )));
                }
            },
            other => {
                return Err(TaggerError::Model(format!(
                    "unexpected model output: {:?}",
                    other
                )));
            }
        };

        score_rows(&logits, images.len()).map_err(|e| classify(self.device, e))
    }
}

/// Sigmoid scores copied back to host memory, one row per image. CUDA
/// failures queued by earlier kernels surface here.
fn score_rows(logits: &Tensor, rows: usize) -> Result<Vec<Vec<f32>>, TchError> {
    let scores = logits
        .f_sigmoid()?
        .f_to_kind(Kind::Float)?
        .f_to_device(Device::Cpu)?
        .f_view([rows as i64, -1])?;
    Vec::<Vec<f32>>::try_from(&scores)
}

fn classify(device: Device, err: TchError) -> TaggerError {
    let message = err.to_string();
    if device.is_cuda() && message.to_lowercase().contains("cuda") {
        TaggerError::DeviceFault(message)
    } else {
        TaggerError::Model(message)
    }
}

impl TagModel for TorchModel {
    fn device(&self) -> DeviceKind {
        if self.device.is_cuda() {
            DeviceKind::Accelerator
        } else {
            DeviceKind::General
        }
    }

    fn score(&mut self, images: &[DynamicImage]) -> Result<Vec<Vec<f32>>, TaggerError> {
        let mut rows = Vec::with_capacity(images.len());
        for chunk in images.chunks(self.batch_size) {
            rows.extend(self.score_chunk(chunk)?);
        }
        Ok(rows)
    }
}

#[derive(Clone)]
pub struct TorchLoader {
    model_path: PathBuf,
    batch_size: usize,
    image_size: u32,
}

impl TorchLoader {
    pub fn new(model_path: PathBuf, batch_size: usize, image_size: u32) -> Self {
        Self {
            model_path,
            batch_size,
            image_size,
        }
    }
}

impl ModelLoader for TorchLoader {
    fn load(&self, target: DeviceKind) -> Result<Box<dyn TagModel>, TaggerError> {
        if !self.model_path.exists() {
            return Err(TaggerError::Config(format!(
                "model file not found: {}",
                self.model_path.display()
            )));
        }

        let device = match target {
            DeviceKind::Accelerator => Device::cuda_if_available(),
            DeviceKind::General => Device::Cpu,
        };
        let mut module = CModule::load_on_device(&self.model_path, device).map_err(|e| {
            TaggerError::Config(format!(
                "failed to load model {}: {}",
                self.model_path.display(),
                e
            ))
        })?;
        module.set_eval();

        let model = TorchModel {
            module,
            device,
            batch_size: self.batch_size,
            image_size: self.image_size,
        };
        log::info!(
            "Loaded {} on {:?} ({} device)",
            self.model_path.display(),
            device,
            model.device()
        );
        Ok(Box::new(model))
    }
}
