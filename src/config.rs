use crate::error::PipelineError;
use crate::types::{Config, Interval, Rect};
use anyhow::{Context, Result};
use std::fs;

impl Config {
    pub fn load(path: &str) -> Result<Self> {
        let contents =
            fs::read_to_string(path).with_context(|| format!("reading config {}", path))?;
        let config: Config = serde_yaml::from_str(&contents)
            .with_context(|| format!("parsing config {}", path))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), PipelineError> {
        if self.inference.batch_size == 0 {
            return Err(PipelineError::invalid("inference.batch_size must be > 0"));
        }
        if self.inference.target_width == 0 || self.inference.target_height == 0 {
            return Err(PipelineError::invalid("inference target size must be non-zero"));
        }
        if !(0.0..=1.0).contains(&self.inference.confidence_threshold) {
            return Err(PipelineError::invalid(
                "inference.confidence_threshold must lie in [0, 1]",
            ));
        }
        if !(self.video.pixel_size_mm > 0.0) {
            return Err(PipelineError::invalid("video.pixel_size_mm must be > 0"));
        }
        self.line.validate()?;
        self.stability.validate()?;
        for pair in &self.video.intervals {
            Interval::new(pair[0], pair[1])?;
        }
        Ok(())
    }

    pub fn intervals(&self) -> Result<Vec<Interval>, PipelineError> {
        self.video
            .intervals
            .iter()
            .map(|p| Interval::new(p[0], p[1]))
            .collect()
    }

    pub fn region(&self) -> Option<Rect> {
        self.video.region.map(Rect::from_xywh)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn test_partial_yaml_fills_defaults() {
        let yaml = r#"
video:
  target_fps: 15
  pixel_size_mm: 0.3
  intervals:
    - [75, 100]
  region: [10, 20, 300, 200]
stability:
  init_window: 20
  win_size: 15
  consec_bad_stop: 10
line:
  keep_ratio: 0.25
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert!(config.validate().is_ok());
        assert_eq!(config.video.target_fps, 15.0);
        assert_eq!(config.stability.init_window, 20);
        assert_eq!(config.stability.rel_tol, 0.2);
        assert_eq!(config.inference.batch_size, 32);
        assert_eq!(config.region(), Some(Rect::new(10, 20, 300, 200)));
        assert_eq!(config.intervals().unwrap().len(), 1);
    }

    #[test]
    fn test_sample_config_loads() {
        let path = concat!(env!("CARGO_MANIFEST_DIR"), "/config.yaml");
        let config = Config::load(path).unwrap();
        assert_eq!(config.intervals().unwrap().len(), 2);
        assert_eq!(config.video.prefetch_frames, 8);
        assert_eq!(config.stability.consec_bad_stop, u32::MAX);
    }

    #[test]
    fn test_reversed_interval_is_invalid() {
        let mut config = Config::default();
        config.video.intervals = vec![[10.0, 5.0]];
        assert!(matches!(
            config.validate(),
            Err(PipelineError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_zero_sample_interval_is_invalid() {
        let mut config = Config::default();
        config.line.sample_interval = 0;
        assert!(config.validate().is_err());
    }
}
