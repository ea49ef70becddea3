use anyhow::{bail, Context};
use skyline::{PipelineConfig, Shading, TilingScheme, VolumeKind};
use std::{net::SocketAddr, path::PathBuf, str::FromStr};

/// Holds all configuration for the scene server.
#[derive(Debug, Clone)]
pub struct Config {
    pub listen_addr: SocketAddr,
    /// Request file paths are resolved against this directory.
    pub data_root: PathBuf,
    /// Served under `/static`; tilesets are generated into `<static_dir>/tilesets`.
    pub static_dir: PathBuf,
    pub pipeline: PipelineConfig,
}

fn var_or<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: &str) -> anyhow::Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    lookup(key)
        .unwrap_or_else(|| default.into())
        .parse()
        .with_context(|| format!("Failed to parse {key}"))
}

impl Config {
    /// Parses configuration from environment variables.
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let volume = match lookup("SCENE_VOLUME").as_deref().unwrap_or("box") {
            "box" => VolumeKind::Box,
            "sphere" => VolumeKind::Sphere,
            other => bail!("SCENE_VOLUME must be 'box' or 'sphere', got '{other}'"),
        };
        let shading = match lookup("SCENE_SHADING").as_deref().unwrap_or("smooth") {
            "smooth" => Shading::Smooth,
            "flat" => Shading::Flat,
            other => bail!("SCENE_SHADING must be 'smooth' or 'flat', got '{other}'"),
        };

        let pipeline = PipelineConfig {
            tiling: TilingScheme::Auto {
                cell_size: var_or(&lookup, "SCENE_CELL_SIZE", "500")?,
                max_single: var_or(&lookup, "SCENE_MAX_SINGLE_TILE", "256")?,
            },
            volume,
            shading,
            proximity: var_or(&lookup, "SCENE_PROXIMITY", "50")?,
            timestamp: var_or(&lookup, "SCENE_TIMESTAMP", "false")?,
        };
        pipeline.validate().context("Invalid pipeline settings")?;

        Ok(Self {
            listen_addr: var_or(&lookup, "SCENE_LISTEN_ADDR", "0.0.0.0:8000")?,
            data_root: lookup("SCENE_DATA_ROOT").unwrap_or_else(|| ".".into()).into(),
            static_dir: lookup("SCENE_STATIC_DIR").unwrap_or_else(|| "static".into()).into(),
            pipeline,
        })
    }

    pub fn tilesets_dir(&self) -> PathBuf {
        self.static_dir.join("tilesets")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> =
            pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_apply_when_unset() {
        let config = Config::from_lookup(lookup(&[])).unwrap();

        assert_eq!(config.listen_addr, "0.0.0.0:8000".parse().unwrap());
        assert_eq!(config.static_dir, PathBuf::from("static"));
        assert_eq!(config.tilesets_dir(), PathBuf::from("static/tilesets"));
        assert_eq!(config.pipeline, PipelineConfig::default());
    }

    #[test]
    fn overrides_are_parsed() {
        let config = Config::from_lookup(lookup(&[
            ("SCENE_PROXIMITY", "12.5"),
            ("SCENE_VOLUME", "sphere"),
            ("SCENE_TIMESTAMP", "true"),
            ("SCENE_MAX_SINGLE_TILE", "8"),
        ]))
        .unwrap();

        assert_eq!(config.pipeline.proximity, 12.5);
        assert_eq!(config.pipeline.volume, VolumeKind::Sphere);
        assert!(config.pipeline.timestamp);
        assert_eq!(
            config.pipeline.tiling,
            TilingScheme::Auto {
                cell_size: 500.0,
                max_single: 8
            }
        );
    }

    #[test]
    fn bad_values_fail_with_the_variable_name() {
        let err = Config::from_lookup(lookup(&[("SCENE_PROXIMITY", "near")])).unwrap_err();
        assert!(err.to_string().contains("SCENE_PROXIMITY"));

        assert!(Config::from_lookup(lookup(&[("SCENE_CELL_SIZE", "-1")])).is_err());
        assert!(Config::from_lookup(lookup(&[("SCENE_SHADING", "gouraud")])).is_err());
    }
}
