use std::path::Path;

use crate::error::TaggerError;

/// Ordered tag labels; position `i` names raw score `i`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Vocabulary {
    tags: Vec<String>,
}

impl Vocabulary {
    pub fn new(tags: Vec<String>) -> Self {
        Self { tags }
    }

    /// Read a JSON array of tag names.
    pub fn load(path: &Path) -> Result<Self, TaggerError> {
        if !path.exists() {
            return Err(TaggerError::Config(format!(
                "vocabulary file not found: {}",
                path.display()
            )));
        }
        let text = std::fs::read_to_string(path).map_err(|e| {
            TaggerError::Config(format!("failed to read vocabulary {}: {}", path.display(), e))
        })?;
        let tags: Vec<String> = serde_json::from_str(&text).map_err(|e| {
            TaggerError::Config(format!("invalid vocabulary {}: {}", path.display(), e))
        })?;
        if tags.is_empty() {
            return Err(TaggerError::Config(format!(
                "vocabulary {} is empty",
                path.display()
            )));
        }
        log::info!("Loaded {} tags from {}", tags.len(), path.display());
        Ok(Self { tags })
    }

    pub fn len(&self) -> usize {
        self.tags.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tags.is_empty()
    }

    pub fn tags(&self) -> &[String] {
        &self.tags
    }
}

impl<S: Into<String>> FromIterator<S> for Vocabulary {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        Self::new(iter.into_iter().map(Into::into).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_is_a_config_error() {
        let err = Vocabulary::load(Path::new("/nonexistent/tags.json")).unwrap_err();
        assert_eq!(err.classification(), "ConfigError");
    }

    #[test]
    fn loads_json_array() {
        let path = std::env::temp_dir().join(format!("autotagger-vocab-{}.json", std::process::id()));
        std::fs::write(&path, r#"["cat","dog","tree"]"#).unwrap();
        let vocab = Vocabulary::load(&path).unwrap();
        std::fs::remove_file(&path).ok();
        assert_eq!(vocab.tags(), ["cat", "dog", "tree"]);
    }
}
