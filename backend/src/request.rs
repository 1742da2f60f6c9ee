use std::path::{Path, PathBuf};

use image::DynamicImage;
use serde_json::Value;
use shared::{DEFAULT_LIMIT, DEFAULT_THRESHOLD, WorkerRequest};

use crate::error::TaggerError;

/// A validated prediction request. Only built once every field checks out.
#[derive(Debug, Clone, PartialEq)]
pub struct PredictionRequest {
    pub id: Value,
    pub files: Vec<PathBuf>,
    pub threshold: f32,
    pub limit: usize,
}

impl TryFrom<WorkerRequest> for PredictionRequest {
    type Error = TaggerError;

    fn try_from(raw: WorkerRequest) -> Result<Self, Self::Error> {
        let threshold = match raw.threshold {
            Some(value) => threshold_from_json(&value)?,
            None => DEFAULT_THRESHOLD,
        };
        let limit = match raw.limit {
            Some(value) => limit_from_json(&value)?,
            None => DEFAULT_LIMIT,
        };
        Ok(Self {
            id: raw.id,
            files: raw.files.into_iter().map(PathBuf::from).collect(),
            threshold,
            limit,
        })
    }
}

pub fn validate_threshold(threshold: f32) -> Result<f32, TaggerError> {
    if threshold.is_finite() && (0.0..=1.0).contains(&threshold) {
        Ok(threshold)
    } else {
        Err(TaggerError::Input(format!(
            "threshold must be between 0 and 1, got {}",
            threshold
        )))
    }
}

/// Threshold from a form field or query parameter.
pub fn parse_threshold(raw: &str) -> Result<f32, TaggerError> {
    let threshold = raw
        .trim()
        .parse::<f32>()
        .map_err(|_| TaggerError::Input(format!("threshold must be a float, got {:?}", raw)))?;
    validate_threshold(threshold)
}

/// Limit from a form field or query parameter. Integral floats such as `5.0`
/// are accepted.
pub fn parse_limit(raw: &str) -> Result<usize, TaggerError> {
    let raw = raw.trim();
    if let Ok(limit) = raw.parse::<usize>() {
        return Ok(limit);
    }
    raw.parse::<f64>()
        .ok()
        .and_then(integral_limit)
        .ok_or_else(|| {
            TaggerError::Input(format!("limit must be a non-negative integer, got {:?}", raw))
        })
}

fn threshold_from_json(value: &Value) -> Result<f32, TaggerError> {
    match value {
        Value::Null => Ok(DEFAULT_THRESHOLD),
        Value::Number(number) => match number.as_f64() {
            Some(threshold) => validate_threshold(threshold as f32),
            None => Err(TaggerError::Input(format!("threshold must be a float, got {}", number))),
        },
        Value::String(raw) => parse_threshold(raw),
        other => Err(TaggerError::Input(format!(
            "threshold must be a float, got {}",
            other
        ))),
    }
}

fn limit_from_json(value: &Value) -> Result<usize, TaggerError> {
    let invalid = || TaggerError::Input(format!("limit must be a non-negative integer, got {}", value));
    match value {
        Value::Null => Ok(DEFAULT_LIMIT),
        Value::Number(number) => match number.as_u64() {
            Some(limit) => usize::try_from(limit).map_err(|_| invalid()),
            None => number.as_f64().and_then(integral_limit).ok_or_else(invalid),
        },
        Value::String(raw) => parse_limit(raw),
        _ => Err(invalid()),
    }
}

fn integral_limit(limit: f64) -> Option<usize> {
    (limit.is_finite() && limit >= 0.0 && limit.fract() == 0.0 && limit <= usize::MAX as f64)
        .then_some(limit as usize)
}

pub fn load_image(path: &Path) -> Result<DynamicImage, TaggerError> {
    Ok(image::open(path)?)
}

pub fn decode_image(bytes: &[u8]) -> Result<DynamicImage, TaggerError> {
    Ok(image::load_from_memory(bytes)?)
}

/// Final path component, as reported back to clients.
pub fn display_name(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}
