#![allow(dead_code)]

use std::io::Cursor;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use autotagger::TaggerError;
use autotagger::dispatch::DispatchPool;
use autotagger::model::{DeviceKind, ModelLoader, TagModel, Vocabulary};
use image::{DynamicImage, ImageFormat};
use parking_lot::Mutex;

/// Shared record of everything the scripted models did.
#[derive(Default)]
pub struct Recorder {
    pub calls: Mutex<Vec<(usize, DeviceKind)>>,
    pub loads: Mutex<Vec<DeviceKind>>,
    pub accelerator_faults: AtomicUsize,
    pub general_faults: AtomicUsize,
    pub model_errors: AtomicUsize,
    pub overlaps: AtomicUsize,
}

impl Recorder {
    pub fn call_ids(&self) -> Vec<usize> {
        self.calls.lock().iter().map(|(id, _)| *id).collect()
    }

    pub fn general_loads(&self) -> usize {
        self.loads
            .lock()
            .iter()
            .filter(|device| **device == DeviceKind::General)
            .count()
    }

    fn take(counter: &AtomicUsize) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

pub struct ScriptedModel {
    id: usize,
    device: DeviceKind,
    scores: Vec<f32>,
    delay: Duration,
    busy: AtomicBool,
    recorder: Arc<Recorder>,
}

impl TagModel for ScriptedModel {
    fn device(&self) -> DeviceKind {
        self.device
    }

    fn score(&mut self, images: &[DynamicImage]) -> Result<Vec<Vec<f32>>, TaggerError> {
        if self.busy.swap(true, Ordering::SeqCst) {
            self.recorder.overlaps.fetch_add(1, Ordering::SeqCst);
        }
        self.recorder.calls.lock().push((self.id, self.device));
        if !self.delay.is_zero() {
            std::thread::sleep(self.delay);
        }
        self.busy.store(false, Ordering::SeqCst);

        let faults = match self.device {
            DeviceKind::Accelerator => &self.recorder.accelerator_faults,
            DeviceKind::General => &self.recorder.general_faults,
        };
        if Recorder::take(faults) {
            return Err(TaggerError::DeviceFault(
                "CUDA error: an illegal memory access was encountered".into(),
            ));
        }
        if Recorder::take(&self.recorder.model_errors) {
            return Err(TaggerError::Model("tensor shape mismatch".into()));
        }

        Ok(vec![self.scores.clone(); images.len()])
    }
}

pub struct ScriptedLoader {
    pub recorder: Arc<Recorder>,
    accelerator: bool,
    scores: Vec<f32>,
    delay: Duration,
    general_load_delay: Duration,
    next_id: AtomicUsize,
}

impl ScriptedLoader {
    pub fn new(accelerator: bool, scores: Vec<f32>) -> Self {
        Self {
            recorder: Arc::new(Recorder::default()),
            accelerator,
            scores,
            delay: Duration::ZERO,
            general_load_delay: Duration::ZERO,
            next_id: AtomicUsize::new(0),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Slow down loads that explicitly target the general-purpose device.
    pub fn with_general_load_delay(mut self, delay: Duration) -> Self {
        self.general_load_delay = delay;
        self
    }
}

impl ModelLoader for ScriptedLoader {
    fn load(&self, target: DeviceKind) -> Result<Box<dyn TagModel>, TaggerError> {
        if target == DeviceKind::General && !self.general_load_delay.is_zero() {
            std::thread::sleep(self.general_load_delay);
        }
        let device = match target {
            DeviceKind::Accelerator if self.accelerator => DeviceKind::Accelerator,
            _ => DeviceKind::General,
        };
        self.recorder.loads.lock().push(device);
        Ok(Box::new(ScriptedModel {
            id: self.next_id.fetch_add(1, Ordering::SeqCst),
            device,
            scores: self.scores.clone(),
            delay: self.delay,
            busy: AtomicBool::new(false),
            recorder: Arc::clone(&self.recorder),
        }))
    }
}

pub fn animals() -> Arc<Vocabulary> {
    Arc::new(["cat", "dog", "tree"].into_iter().collect())
}

pub const ANIMAL_SCORES: [f32; 3] = [0.9, 0.05, 0.5];

/// Pool over scripted models; returns the recorder for inspection.
pub fn scripted_pool(accelerator: bool, parallelism: usize) -> (DispatchPool, Arc<Recorder>) {
    scripted_pool_with(ScriptedLoader::new(accelerator, ANIMAL_SCORES.to_vec()), parallelism)
}

pub fn scripted_pool_with(loader: ScriptedLoader, parallelism: usize) -> (DispatchPool, Arc<Recorder>) {
    let recorder = Arc::clone(&loader.recorder);
    let pool = DispatchPool::start(Arc::new(loader), animals(), parallelism).unwrap();
    (pool, recorder)
}

pub fn blank_images(count: usize) -> Vec<DynamicImage> {
    (0..count).map(|_| DynamicImage::new_rgb8(4, 4)).collect()
}

pub fn png_bytes() -> Vec<u8> {
    let mut out = Cursor::new(Vec::new());
    DynamicImage::new_rgb8(4, 4)
        .write_to(&mut out, ImageFormat::Png)
        .unwrap();
    out.into_inner()
}

/// Fresh directory under the system temp dir, unique per test name and process.
pub fn scratch_dir(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("autotagger-{}-{}", name, std::process::id()));
    std::fs::create_dir_all(&dir).unwrap();
    dir
}
