use std::{fs, path::Path};

use anyhow::{anyhow, Context, Result};
use clap::ValueEnum;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum DeviceKind {
    Cpu,
    Gpu,
}

/// Which adversarial criterion the GAN terms use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdversarialKind {
    LeastSquares,
    Logistic,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PixelKind {
    L1,
    L2,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TrainingConfig {
    pub num_classes: usize,
    pub lr: f64,
    pub batch_size: usize,
    pub epochs: usize,
    pub accum_steps: usize,
    pub lambda_perceptual: f64,
    pub lambda_gan: f64,
    pub lambda_classification: f64,
    pub data_path: String,
    pub save_path: String,
    pub num_workers: usize,
    pub augment: bool,
    pub min_image_size: usize,
    pub max_image_size: usize,
    pub patience: usize,
    pub save_frequency: usize,
    pub save_samples: bool,
    pub device: DeviceKind,
    pub seed: u64,
    pub train_val_split: f64,
    pub adversarial_loss: AdversarialKind,
    pub pixel_loss: PixelKind,
    pub mixed_precision: bool,
    pub weight_decay: f64,
    pub scheduler_factor: f64,
    pub scheduler_patience: usize,
    pub min_lr: f64,
    pub generator_width: usize,
    pub classifier_width: usize,
    pub discriminator_width: usize,
    pub dropout_rate: f64,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            num_classes: 1000,
            lr: 1e-4,
            batch_size: 8,
            epochs: 50,
            accum_steps: 1,
            lambda_perceptual: 0.1,
            lambda_gan: 0.01,
            lambda_classification: 0.1,
            data_path: "data".to_string(),
            save_path: "checkpoints".to_string(),
            num_workers: 0,
            augment: true,
            min_image_size: 64,
            max_image_size: 256,
            patience: 10,
            save_frequency: 5,
            save_samples: true,
            device: DeviceKind::Cpu,
            seed: 42,
            train_val_split: 0.9,
            adversarial_loss: AdversarialKind::LeastSquares,
            pixel_loss: PixelKind::L1,
            mixed_precision: true,
            weight_decay: 1e-4,
            scheduler_factor: 0.5,
            scheduler_patience: 3,
            min_lr: 1e-7,
            generator_width: 64,
            classifier_width: 32,
            discriminator_width: 64,
            dropout_rate: 0.5,
        }
    }
}

impl TrainingConfig {
    /// Reads a JSON config; keys that are absent keep their defaults.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)
            .with_context(|| format!("cannot read config {}", path.display()))?;
        let config: Self = serde_json::from_str(&contents)
            .with_context(|| format!("invalid config {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json).with_context(|| format!("cannot write {}", path.display()))?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.num_classes == 0 {
            return Err(anyhow!("num_classes must be > 0"));
        }
        if self.batch_size == 0 {
            return Err(anyhow!("batch_size must be > 0"));
        }
        if self.lr <= 0.0 {
            return Err(anyhow!("lr must be > 0"));
        }
        if self.epochs == 0 {
            return Err(anyhow!("epochs must be > 0"));
        }
        if self.accum_steps == 0 {
            return Err(anyhow!("accum_steps must be > 0"));
        }
        if self.train_val_split <= 0.0 || self.train_val_split >= 1.0 {
            return Err(anyhow!("train_val_split must be between 0 and 1"));
        }
        if self.min_image_size < 16 {
            return Err(anyhow!(
                "min_image_size must be at least 16, got {}",
                self.min_image_size
            ));
        }
        if self.max_image_size < self.min_image_size {
            return Err(anyhow!(
                "max_image_size ({}) must not be smaller than min_image_size ({})",
                self.max_image_size,
                self.min_image_size
            ));
        }
        if self.patience == 0 {
            return Err(anyhow!("patience must be > 0"));
        }
        if !(0.0..1.0).contains(&self.scheduler_factor) || self.scheduler_factor == 0.0 {
            return Err(anyhow!("scheduler_factor must be in (0, 1)"));
        }
        if !(0.0..1.0).contains(&self.dropout_rate) {
            return Err(anyhow!("dropout_rate must be in [0, 1)"));
        }
        if self.generator_width == 0 || self.classifier_width == 0 || self.discriminator_width == 0
        {
            return Err(anyhow!("network widths must be > 0"));
        }
        if self.lambda_perceptual < 0.0 || self.lambda_gan < 0.0 || self.lambda_classification < 0.0
        {
            return Err(anyhow!("loss weights must be non-negative"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_json_keeps_defaults() {
        let config: TrainingConfig =
            serde_json::from_str(r#"{ "num_classes": 10, "pixel_loss": "l2" }"#).unwrap();
        assert_eq!(config.num_classes, 10);
        assert_eq!(config.pixel_loss, PixelKind::L2);
        assert_eq!(config.batch_size, TrainingConfig::default().batch_size);
        config.validate().unwrap();
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let parsed = serde_json::from_str::<TrainingConfig>(r#"{ "num_clases": 10 }"#);
        assert!(parsed.is_err());
    }

    #[test]
    fn invalid_sizes_fail_validation() {
        let config = TrainingConfig {
            min_image_size: 128,
            max_image_size: 64,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = TrainingConfig {
            min_image_size: 8,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
