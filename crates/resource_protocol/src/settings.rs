use serde::{Deserialize, Serialize};

use crate::ResourceFormat;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum BackingMode {
    #[default]
    Gpu,
    Bitmap,
}

/// Construction-time configuration of a resource provider. Never mutated
/// after the provider is built.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceSettings {
    pub default_backing: BackingMode,
    pub max_texture_size: u32,
    pub best_texture_format: ResourceFormat,
    pub id_allocation_batch_size: usize,
}

impl Default for ResourceSettings {
    fn default() -> Self {
        Self {
            default_backing: BackingMode::Gpu,
            max_texture_size: 4096,
            best_texture_format: ResourceFormat::Rgba8888,
            id_allocation_batch_size: 1,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("max_texture_size must be at least 1")]
    MaxTextureSizeZero,
    #[error("id_allocation_batch_size must be at least 1")]
    BatchSizeZero,
    #[error("best_texture_format {0:?} cannot be a compressed format")]
    CompressedBestFormat(ResourceFormat),
    #[error("invalid resource settings json: {0}")]
    Json(#[from] serde_json::Error),
}

impl ResourceSettings {
    pub fn software() -> Self {
        Self {
            default_backing: BackingMode::Bitmap,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<(), SettingsError> {
        if self.max_texture_size == 0 {
            return Err(SettingsError::MaxTextureSizeZero);
        }
        if self.id_allocation_batch_size == 0 {
            return Err(SettingsError::BatchSizeZero);
        }
        if self.best_texture_format.is_compressed() {
            return Err(SettingsError::CompressedBestFormat(
                self.best_texture_format,
            ));
        }
        Ok(())
    }

    pub fn from_json_str(json: &str) -> Result<Self, SettingsError> {
        let settings: Self = serde_json::from_str(json)?;
        settings.validate()?;
        Ok(settings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_fills_missing_fields_from_default() {
        let settings = ResourceSettings::from_json_str(
            r#"{ "default_backing": "Bitmap", "id_allocation_batch_size": 8 }"#,
        )
        .expect("parse settings");
        assert_eq!(settings.default_backing, BackingMode::Bitmap);
        assert_eq!(settings.id_allocation_batch_size, 8);
        assert_eq!(settings.max_texture_size, 4096);
    }

    #[test]
    fn validate_rejects_zero_batch_and_compressed_format() {
        let mut settings = ResourceSettings {
            id_allocation_batch_size: 0,
            ..ResourceSettings::default()
        };
        assert!(matches!(
            settings.validate(),
            Err(SettingsError::BatchSizeZero)
        ));

        settings.id_allocation_batch_size = 4;
        settings.best_texture_format = ResourceFormat::Etc1;
        assert!(matches!(
            settings.validate(),
            Err(SettingsError::CompressedBestFormat(ResourceFormat::Etc1))
        ));
    }

    #[test]
    fn malformed_json_is_reported() {
        let error = ResourceSettings::from_json_str("{ not json").expect_err("bad json");
        assert!(error.to_string().starts_with("invalid resource settings json"));
    }
}
