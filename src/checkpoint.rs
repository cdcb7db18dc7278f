use std::path::{Path, PathBuf};

use crate::{config::TrainingConfig, error::ColorizeError, generator::Generator, model::Colorizer};
use burn::{
    module::Module,
    record::{FullPrecisionSettings, NamedMpkFileRecorder, Recorder},
    tensor::backend::Backend,
};
use log::info;

/// Full precision so a reload reproduces outputs bit for bit.
pub type CheckpointRecorder = NamedMpkFileRecorder<FullPrecisionSettings>;

pub const CHECKPOINT_EXTENSION: &str = "mpk";

/// File the recorder actually writes for a checkpoint stem.
pub fn checkpoint_file(stem: &Path) -> PathBuf {
    stem.with_extension(CHECKPOINT_EXTENSION)
}

pub fn save_colorizer<B: Backend>(
    model: &Colorizer<B>,
    stem: &Path,
) -> Result<(), ColorizeError> {
    save(model.clone(), stem)
}

pub fn save_generator<B: Backend>(
    generator: &Generator<B>,
    stem: &Path,
) -> Result<(), ColorizeError> {
    save(generator.clone(), stem)
}

fn save<B: Backend, M: Module<B>>(module: M, stem: &Path) -> Result<(), ColorizeError> {
    if let Some(parent) = stem.parent() {
        std::fs::create_dir_all(parent)?;
    }
    module
        .save_file(stem.to_path_buf(), &CheckpointRecorder::new())
        .map_err(|e| ColorizeError::IncompatibleCheckpoint {
            path: checkpoint_file(stem),
            reason: format!("write failed: {e}"),
        })?;
    info!("💾 checkpoint written to {}", checkpoint_file(stem).display());
    Ok(())
}

/// Loads a composite checkpoint into a model built from `config`, failing if
/// the stored architecture differs.
pub fn load_colorizer<B: Backend>(
    config: &TrainingConfig,
    stem: &Path,
    device: &B::Device,
) -> Result<Colorizer<B>, ColorizeError> {
    let fresh = Colorizer::<B>::new(config, device);
    let expected = [
        ("generator", fresh.generator.num_params()),
        ("classifier", fresh.classifier.num_params()),
        ("discriminator", fresh.discriminator.num_params()),
    ];

    let loaded = load(fresh, stem, device)?;
    let found = [
        loaded.generator.num_params(),
        loaded.classifier.num_params(),
        loaded.discriminator.num_params(),
    ];
    for ((name, expected), found) in expected.into_iter().zip(found) {
        ensure_param_count(stem, name, expected, found)?;
    }
    Ok(loaded)
}

/// Loads a generator-only checkpoint for inference.
pub fn load_generator<B: Backend>(
    width: usize,
    stem: &Path,
    device: &B::Device,
) -> Result<Generator<B>, ColorizeError> {
    let fresh = Generator::<B>::new(width, device);
    let expected = fresh.num_params();
    let loaded = load(fresh, stem, device)?;
    ensure_param_count(stem, "generator", expected, loaded.num_params())?;
    Ok(loaded)
}

fn load<B: Backend, M: Module<B>>(
    fresh: M,
    stem: &Path,
    device: &B::Device,
) -> Result<M, ColorizeError> {
    let file = checkpoint_file(stem);
    if !file.is_file() {
        return Err(ColorizeError::CheckpointMissing(file));
    }
    let record = CheckpointRecorder::new()
        .load(stem.to_path_buf(), device)
        .map_err(|e| ColorizeError::IncompatibleCheckpoint {
            path: file,
            reason: e.to_string(),
        })?;
    Ok(fresh.load_record(record))
}

fn ensure_param_count(
    stem: &Path,
    name: &str,
    expected: usize,
    found: usize,
) -> Result<(), ColorizeError> {
    if expected == found {
        return Ok(());
    }
    Err(ColorizeError::IncompatibleCheckpoint {
        path: checkpoint_file(stem),
        reason: format!("{name} has {found} parameters, expected {expected}"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ForwardMode;
    use burn::backend::NdArray;
    use burn::tensor::{Distribution, Tensor};

    type TestBackend = NdArray<f32>;

    fn scratch_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("tintora-ckpt-{}-{name}", std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn small_config(num_classes: usize) -> TrainingConfig {
        TrainingConfig {
            num_classes,
            generator_width: 4,
            classifier_width: 4,
            discriminator_width: 4,
            ..Default::default()
        }
    }

    #[test]
    fn round_trip_reproduces_outputs_exactly() {
        let device = Default::default();
        let dir = scratch_dir("round-trip");
        let config = small_config(5);
        let model = Colorizer::<TestBackend>::new(&config, &device);
        let x = Tensor::<TestBackend, 4>::random([1, 1, 32, 32], Distribution::Default, &device);

        save_colorizer(&model, &dir.join("model")).unwrap();
        let restored = load_colorizer::<TestBackend>(&config, &dir.join("model"), &device).unwrap();

        let before = model.forward(x.clone(), ForwardMode::Adversarial);
        let after = restored.forward(x, ForwardMode::Adversarial);
        assert_eq!(before.color().to_data(), after.color().to_data());
        assert_eq!(before.semantic().to_data(), after.semantic().to_data());
        assert_eq!(
            before.realism().unwrap().to_data(),
            after.realism().unwrap().to_data()
        );
    }

    #[test]
    fn generator_only_round_trip() {
        let device = Default::default();
        let dir = scratch_dir("generator");
        let generator = Generator::<TestBackend>::new(4, &device);
        let x = Tensor::<TestBackend, 4>::random([1, 1, 20, 24], Distribution::Default, &device);

        save_generator(&generator, &dir.join("generator")).unwrap();
        let restored = load_generator::<TestBackend>(4, &dir.join("generator"), &device).unwrap();

        assert_eq!(
            generator.forward(x.clone()).to_data(),
            restored.forward(x).to_data()
        );
    }

    #[test]
    fn mismatched_architecture_is_rejected() {
        let device = Default::default();
        let dir = scratch_dir("mismatch");
        let model = Colorizer::<TestBackend>::new(&small_config(5), &device);
        save_colorizer(&model, &dir.join("model")).unwrap();

        let result = load_colorizer::<TestBackend>(&small_config(6), &dir.join("model"), &device);
        assert!(matches!(result, Err(ColorizeError::IncompatibleCheckpoint { .. })));
    }

    #[test]
    fn generator_record_is_not_a_colorizer() {
        let device = Default::default();
        let dir = scratch_dir("wrong-kind");
        let generator = Generator::<TestBackend>::new(4, &device);
        save_generator(&generator, &dir.join("generator")).unwrap();

        let result = load_colorizer::<TestBackend>(&small_config(5), &dir.join("generator"), &device);
        assert!(matches!(result, Err(ColorizeError::IncompatibleCheckpoint { .. })));
    }

    #[test]
    fn missing_checkpoint_is_reported() {
        let device = Default::default();
        let dir = scratch_dir("missing");

        let result = load_generator::<TestBackend>(4, &dir.join("nothing"), &device);
        assert!(matches!(result, Err(ColorizeError::CheckpointMissing(_))));
    }
}
