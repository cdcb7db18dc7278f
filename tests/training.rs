use std::{
    fs,
    path::{Path, PathBuf},
};

use burn::{
    backend::{Autodiff, NdArray},
    tensor::{Distribution, Tensor},
};
use image::{GrayImage, Luma, Rgb, RgbImage};
use tintora::{
    checkpoint::{checkpoint_file, load_colorizer},
    ColorizerTrainer, ForwardMode, TrainingConfig,
};

type TrainBackend = Autodiff<NdArray<f32>>;
type InferBackend = NdArray<f32>;

fn scratch_dir(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("tintora-it-{}-{name}", std::process::id()));
    let _ = fs::remove_dir_all(&dir);
    for sub in ["bw", "color", "labels"] {
        fs::create_dir_all(dir.join("data").join(sub)).unwrap();
    }
    dir
}

fn write_pair(data: &Path, stem: &str, shade: u8, label: usize) {
    let color = RgbImage::from_fn(16, 16, |x, y| {
        Rgb([shade, (x * 16) as u8, (y * 16) as u8])
    });
    let gray = GrayImage::from_fn(16, 16, |x, y| {
        let [r, g, b] = color.get_pixel(x, y).0;
        Luma([((r as u32 * 299 + g as u32 * 587 + b as u32 * 114) / 1000) as u8])
    });
    gray.save(data.join("bw").join(format!("{stem}.png"))).unwrap();
    color.save(data.join("color").join(format!("{stem}.png"))).unwrap();
    fs::write(data.join("labels").join(format!("{stem}.json")), format!("[{label}]")).unwrap();
}

fn tiny_config(root: &Path) -> TrainingConfig {
    TrainingConfig {
        num_classes: 2,
        batch_size: 2,
        epochs: 2,
        lr: 1e-3,
        data_path: root.join("data").display().to_string(),
        save_path: root.join("runs").display().to_string(),
        augment: false,
        min_image_size: 16,
        max_image_size: 16,
        patience: 5,
        save_frequency: 1,
        save_samples: true,
        train_val_split: 0.6,
        mixed_precision: false,
        generator_width: 4,
        classifier_width: 4,
        discriminator_width: 4,
        ..Default::default()
    }
}

#[test]
fn tiny_run_writes_checkpoints_and_restores_best() {
    let root = scratch_dir("run");
    let data = root.join("data");
    for (i, shade) in [20u8, 80, 140, 200].into_iter().enumerate() {
        write_pair(&data, &format!("img{i}"), shade, i % 2);
    }
    write_pair(&data, "broken", 0, 0);
    fs::write(data.join("bw").join("broken.png"), b"definitely not a png").unwrap();

    let config = tiny_config(&root);
    let summary = ColorizerTrainer::<TrainBackend>::new(config.clone(), Default::default())
        .run()
        .unwrap();

    assert_eq!(summary.epochs_run, 2);
    assert!(!summary.early_stopped);
    // The undecodable pair is dropped once per epoch, wherever the split put it.
    assert_eq!(summary.dropped_items, 2);
    let (best_epoch, best_loss) = summary.best.expect("a finite validation loss");
    assert!((1..=2).contains(&best_epoch));
    assert!(best_loss.is_finite());

    let runs = root.join("runs");
    for stem in ["best", "final", "generator", "epoch_1", "epoch_2"] {
        assert!(checkpoint_file(&runs.join(stem)).is_file(), "{stem} missing");
    }
    assert!(runs.join("config.json").is_file());
    assert!(runs.join("samples").join("epoch_1.png").is_file());

    let reloaded = TrainingConfig::load(runs.join("config.json")).unwrap();
    assert_eq!(reloaded.num_classes, 2);

    let device = Default::default();
    let best = load_colorizer::<InferBackend>(&config, &runs.join("best"), &device).unwrap();
    let last = load_colorizer::<InferBackend>(&config, &runs.join("final"), &device).unwrap();
    let x = Tensor::<InferBackend, 4>::random([1, 1, 16, 16], Distribution::Default, &device);
    let best_out = best.forward(x.clone(), ForwardMode::Inference);
    let last_out = last.forward(x, ForwardMode::Inference);
    assert_eq!(best_out.color().to_data(), last_out.color().to_data());
    assert_eq!(best_out.semantic().to_data(), last_out.semantic().to_data());
}

#[test]
fn loss_scaled_run_trains_every_batch() {
    let root = scratch_dir("scaled");
    let data = root.join("data");
    for (i, shade) in [40u8, 100, 160, 220].into_iter().enumerate() {
        write_pair(&data, &format!("img{i}"), shade, i % 2);
    }
    let config = TrainingConfig {
        epochs: 1,
        mixed_precision: true,
        save_samples: false,
        train_val_split: 0.5,
        ..tiny_config(&root)
    };

    let summary = ColorizerTrainer::<TrainBackend>::new(config, Default::default())
        .run()
        .unwrap();

    assert_eq!(summary.epochs_run, 1);
    assert_eq!(summary.skipped_batches, 0);
    assert_eq!(summary.dropped_items, 0);
    let (_, loss) = summary.best.expect("a finite validation loss");
    assert!(loss.is_finite());
    assert!(checkpoint_file(&root.join("runs").join("generator")).is_file());
}

#[test]
fn missing_dataset_directory_fails_before_training() {
    let root = scratch_dir("missing");
    fs::remove_dir_all(root.join("data").join("color")).unwrap();

    let result = ColorizerTrainer::<TrainBackend>::new(tiny_config(&root), Default::default()).run();

    let message = format!("{:#}", result.unwrap_err());
    assert!(message.contains("color"), "{message}");
    assert!(!checkpoint_file(&root.join("runs").join("final")).exists());
}

#[test]
fn out_of_range_labels_fail_before_training() {
    let root = scratch_dir("labels");
    let data = root.join("data");
    write_pair(&data, "a", 10, 0);
    write_pair(&data, "b", 90, 5);

    let result = ColorizerTrainer::<TrainBackend>::new(tiny_config(&root), Default::default()).run();

    let message = format!("{:#}", result.unwrap_err());
    assert!(message.contains("out of range"), "{message}");
}

#[test]
fn invalid_config_is_rejected() {
    let root = scratch_dir("config");
    let config = TrainingConfig {
        batch_size: 0,
        ..tiny_config(&root)
    };

    let result = ColorizerTrainer::<TrainBackend>::new(config, Default::default()).run();
    assert!(result.is_err());
}
