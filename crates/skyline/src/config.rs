use crate::bounds::VolumeKind;
use crate::error::{PipelineError, Result};
use crate::extrude::Shading;
use crate::partition::TilingScheme;
use crate::recommend::DEFAULT_PROXIMITY;
use serde::{Deserialize, Serialize};

/// Knobs for one pipeline invocation. Every field has a default, so a partial
/// JSON object deserializes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub tiling: TilingScheme,
    pub volume: VolumeKind,
    pub shading: Shading,
    /// Neighbour distance for height recommendations, in scene units.
    pub proximity: f64,
    /// Record the generation time in the manifest. Off keeps output reproducible.
    pub timestamp: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            tiling: TilingScheme::default(),
            volume: VolumeKind::default(),
            shading: Shading::default(),
            proximity: DEFAULT_PROXIMITY,
            timestamp: false,
        }
    }
}

impl PipelineConfig {
    pub fn validate(&self) -> Result<()> {
        if !(self.proximity >= 0.0 && self.proximity.is_finite()) {
            return Err(PipelineError::InvalidConfig(format!(
                "proximity must be a non-negative number, got {}",
                self.proximity
            )));
        }

        match self.tiling {
            TilingScheme::Single => {}
            TilingScheme::Grid { cell_size } | TilingScheme::Auto { cell_size, .. } => {
                if !(cell_size > 0.0 && cell_size.is_finite()) {
                    return Err(PipelineError::InvalidConfig(format!(
                        "grid cell size must be positive, got {cell_size}"
                    )));
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_json_takes_defaults() {
        let cfg: PipelineConfig =
            serde_json::from_str(r#"{ "volume": "sphere", "tiling": { "kind": "grid", "cell_size": 250.0 } }"#)
                .unwrap();

        assert_eq!(cfg.volume, VolumeKind::Sphere);
        assert_eq!(cfg.tiling, TilingScheme::Grid { cell_size: 250.0 });
        assert_eq!(cfg.shading, Shading::Smooth);
        assert_eq!(cfg.proximity, 50.0);
        assert!(!cfg.timestamp);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn bad_values_are_rejected() {
        let cfg = PipelineConfig {
            proximity: f64::NAN,
            ..PipelineConfig::default()
        };
        assert!(matches!(cfg.validate(), Err(PipelineError::InvalidConfig(_))));

        let cfg = PipelineConfig {
            tiling: TilingScheme::Auto {
                cell_size: 0.0,
                max_single: 10,
            },
            ..PipelineConfig::default()
        };
        assert!(matches!(cfg.validate(), Err(PipelineError::InvalidConfig(_))));
    }
}
