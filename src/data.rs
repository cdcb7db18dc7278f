use crate::error::ColorizeError;
use anyhow::Result;
use burn::{
    data::{dataloader::batcher::Batcher, dataset::Dataset},
    tensor::{backend::Backend, Int, Tensor, TensorData},
};
use image::{imageops, imageops::FilterType, GrayImage, ImageReader, RgbImage};
use log::{info, warn};
use rand::{rngs::StdRng, seq::SliceRandom, Rng, SeedableRng};
use rayon::prelude::*;
use serde::Deserialize;
use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
    sync::{Arc, Mutex, PoisonError},
};

const VALID_EXTENSIONS: [&str; 3] = ["png", "jpg", "jpeg"];
const SIZE_STEP: usize = 16;

/// One grayscale/color pair and its semantic class.
#[derive(Debug, Clone, PartialEq)]
pub struct ColorizationItem {
    pub grayscale_path: PathBuf,
    pub color_path: PathBuf,
    pub label: usize,
}

/// Label files hold either one class index or an array whose first entry is
/// the image's class.
#[derive(Deserialize)]
#[serde(untagged)]
enum LabelFile {
    Single(u64),
    Many(Vec<u64>),
}

/// `<root>/bw`, `<root>/color` and `<root>/labels`, joined by file stem.
#[derive(Debug, Clone)]
pub struct ColorizationDataset {
    pub items: Vec<ColorizationItem>,
}

impl ColorizationDataset {
    pub fn new<P: AsRef<Path>>(data_dir: P, num_classes: usize, seed: u64) -> Result<Self> {
        let data_dir = data_dir.as_ref();
        info!("📂 loading dataset from {}", data_dir.display());

        let bw_dir = Self::require_dir(data_dir.join("bw"))?;
        let color_dir = Self::require_dir(data_dir.join("color"))?;
        let label_dir = Self::require_dir(data_dir.join("labels"))?;

        let bw_files = Self::collect_image_files(&bw_dir)?;
        if bw_files.is_empty() {
            return Err(ColorizeError::EmptyDirectory(bw_dir).into());
        }

        let mut items = bw_files
            .par_iter()
            .map(|path| Self::pair_item(path, &color_dir, &label_dir, num_classes))
            .collect::<Result<Vec<_>, ColorizeError>>()?;

        let mut rng = StdRng::seed_from_u64(seed);
        items.shuffle(&mut rng);

        Self::print_statistics(&items);

        Ok(Self { items })
    }

    pub fn from_items(items: Vec<ColorizationItem>) -> Self {
        Self { items }
    }

    fn require_dir(path: PathBuf) -> Result<PathBuf, ColorizeError> {
        if path.is_dir() {
            Ok(path)
        } else {
            Err(ColorizeError::MissingDirectory(path))
        }
    }

    fn collect_image_files(dir: &Path) -> Result<Vec<PathBuf>, ColorizeError> {
        let mut files = Vec::new();
        for entry in fs::read_dir(dir)? {
            let path = entry?.path();
            if path.is_file() && has_image_extension(&path) {
                files.push(path);
            }
        }
        files.sort();
        Ok(files)
    }

    fn pair_item(
        grayscale_path: &Path,
        color_dir: &Path,
        label_dir: &Path,
        num_classes: usize,
    ) -> Result<ColorizationItem, ColorizeError> {
        let stem = grayscale_path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();

        let color_path = Self::find_color(grayscale_path, color_dir, &stem).ok_or_else(|| {
            ColorizeError::MissingPair {
                kind: "color image",
                stem: stem.clone(),
                path: color_dir.join(grayscale_path.file_name().unwrap_or_default()),
            }
        })?;

        let label_path = label_dir.join(format!("{stem}.json"));
        if !label_path.is_file() {
            return Err(ColorizeError::MissingPair {
                kind: "label",
                stem,
                path: label_path,
            });
        }
        let label = read_label(&label_path, num_classes)?;

        Ok(ColorizationItem {
            grayscale_path: grayscale_path.to_path_buf(),
            color_path,
            label,
        })
    }

    /// Same file name first, then any supported extension with the same stem.
    fn find_color(grayscale_path: &Path, color_dir: &Path, stem: &str) -> Option<PathBuf> {
        let same_name = color_dir.join(grayscale_path.file_name()?);
        if same_name.is_file() {
            return Some(same_name);
        }
        VALID_EXTENSIONS
            .iter()
            .map(|ext| color_dir.join(format!("{stem}.{ext}")))
            .find(|candidate| candidate.is_file())
    }

    fn print_statistics(items: &[ColorizationItem]) {
        let mut per_class: BTreeMap<usize, usize> = BTreeMap::new();
        for item in items {
            *per_class.entry(item.label).or_default() += 1;
        }
        info!(
            "📊 {} image pairs across {} classes",
            items.len(),
            per_class.len()
        );
        if let Some((label, count)) = per_class.iter().max_by_key(|(_, count)| **count) {
            info!("   most frequent class: {label} ({count} images)");
        }
    }

    /// Splits off the first `ratio` of the (already shuffled) items for
    /// training; the rest validates.
    pub fn split(&self, ratio: f64) -> (Self, Self) {
        let split_index = ((self.items.len() as f64 * ratio) as usize)
            .clamp(1usize.min(self.items.len()), self.items.len());

        let train_items = self.items[..split_index].to_vec();
        let valid_items = self.items[split_index..].to_vec();

        info!(
            "📈 split (ratio {ratio}): {} train, {} validation",
            train_items.len(),
            valid_items.len()
        );

        (Self::from_items(train_items), Self::from_items(valid_items))
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<ColorizationItem> {
        self.items.get(index).cloned()
    }
}

impl Dataset<ColorizationItem> for ColorizationDataset {
    fn get(&self, index: usize) -> Option<ColorizationItem> {
        self.get(index)
    }

    fn len(&self) -> usize {
        self.len()
    }
}

fn has_image_extension(path: &Path) -> bool {
    path.extension()
        .map(|ext| ext.to_string_lossy().to_lowercase())
        .is_some_and(|ext| VALID_EXTENSIONS.contains(&ext.as_str()))
}

pub fn read_label(path: &Path, num_classes: usize) -> Result<usize, ColorizeError> {
    let contents = fs::read_to_string(path)?;
    let parsed: LabelFile =
        serde_json::from_str(&contents).map_err(|e| ColorizeError::InvalidLabel {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

    let labels = match parsed {
        LabelFile::Single(label) => vec![label],
        LabelFile::Many(labels) => labels,
    };
    let Some(&first) = labels.first() else {
        return Err(ColorizeError::InvalidLabel {
            path: path.to_path_buf(),
            reason: "empty label array".to_string(),
        });
    };
    if let Some(&label) = labels.iter().find(|&&l| l as usize >= num_classes) {
        return Err(ColorizeError::LabelOutOfRange {
            path: path.to_path_buf(),
            label,
            num_classes,
        });
    }
    Ok(first as usize)
}

#[derive(Debug, Clone)]
pub struct ColorizationBatch<B: Backend> {
    pub grayscale: Tensor<B, 4>,
    pub color: Tensor<B, 4>,
    pub labels: Tensor<B, 1, Int>,
    /// Items dropped because their images could not be loaded.
    pub skipped: usize,
}

/// Every item of a batch failed to load.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EmptyBatch {
    pub dropped: usize,
}

pub type LoadedBatch<B> = Result<ColorizationBatch<B>, EmptyBatch>;

/// Decodes and resizes pairs into square batches. With `augment`, every
/// batch gets a random side (multiple of 16 within the configured range)
/// and each pair may be flipped horizontally. The draws come from one
/// seeded generator shared by every clone of the batcher.
#[derive(Debug, Clone)]
pub struct ColorizationBatcher {
    pub min_side: usize,
    pub max_side: usize,
    pub augment: bool,
    rng: Arc<Mutex<StdRng>>,
}

impl ColorizationBatcher {
    pub fn new(min_side: usize, max_side: usize, augment: bool, seed: u64) -> Self {
        Self {
            min_side,
            max_side,
            augment,
            rng: Arc::new(Mutex::new(StdRng::seed_from_u64(seed))),
        }
    }

    /// Side length for the next batch and one flip flag per item.
    fn draw_layout(&self, items: usize) -> (usize, Vec<bool>) {
        let mut rng = self.rng.lock().unwrap_or_else(PoisonError::into_inner);
        let side = self.pick_side(&mut *rng);
        let flips = (0..items)
            .map(|_| self.augment && rng.random_bool(0.5))
            .collect();
        (side, flips)
    }

    fn pick_side<R: Rng>(&self, rng: &mut R) -> usize {
        if !self.augment {
            return self.max_side;
        }
        let lo = self.min_side.div_ceil(SIZE_STEP);
        let hi = self.max_side / SIZE_STEP;
        if lo > hi || hi == 0 {
            return self.max_side;
        }
        rng.random_range(lo..=hi) * SIZE_STEP
    }

    /// Loads one pair as CHW floats in [0, 1].
    pub fn load_pair(
        item: &ColorizationItem,
        side: usize,
        flip: bool,
    ) -> Result<(Vec<f32>, Vec<f32>), ColorizeError> {
        let gray = ImageReader::open(&item.grayscale_path)?.decode()?.to_luma8();
        let color = ImageReader::open(&item.color_path)?.decode()?.to_rgb8();
        if gray.dimensions() != color.dimensions() {
            return Err(ColorizeError::MissingPair {
                kind: "same-sized color image",
                stem: item.grayscale_path.display().to_string(),
                path: item.color_path.clone(),
            });
        }

        let side = side as u32;
        let mut gray: GrayImage = imageops::resize(&gray, side, side, FilterType::Triangle);
        let mut color: RgbImage = imageops::resize(&color, side, side, FilterType::Triangle);
        if flip {
            imageops::flip_horizontal_in_place(&mut gray);
            imageops::flip_horizontal_in_place(&mut color);
        }

        let gray_data = gray.into_raw().into_iter().map(|p| p as f32 / 255.0).collect();
        Ok((gray_data, rgb_to_chw(&color)))
    }
}

/// Interleaved RGB bytes to planar floats in [0, 1].
pub fn rgb_to_chw(image: &RgbImage) -> Vec<f32> {
    let frame_size = (image.width() * image.height()) as usize;
    let raw_pixels = image.as_raw();
    let mut chw_data = vec![0.0; frame_size * 3];

    for i in 0..frame_size {
        let base = i * 3;
        chw_data[i] = raw_pixels[base] as f32 / 255.0;
        chw_data[i + frame_size] = raw_pixels[base + 1] as f32 / 255.0;
        chw_data[i + 2 * frame_size] = raw_pixels[base + 2] as f32 / 255.0;
    }

    chw_data
}

impl<B: Backend> Batcher<B, ColorizationItem, LoadedBatch<B>> for ColorizationBatcher {
    fn batch(&self, items: Vec<ColorizationItem>, device: &B::Device) -> LoadedBatch<B> {
        let (side, flips) = self.draw_layout(items.len());
        let frame_size = side * side;

        let mut gray_data = Vec::with_capacity(items.len() * frame_size);
        let mut color_data = Vec::with_capacity(items.len() * 3 * frame_size);
        let mut labels = Vec::with_capacity(items.len());
        let mut skipped = 0;

        for (item, flip) in items.iter().zip(flips) {
            match Self::load_pair(item, side, flip) {
                Ok((gray, color)) => {
                    gray_data.extend_from_slice(&gray);
                    color_data.extend_from_slice(&color);
                    labels.push(item.label as i64);
                }
                Err(e) => {
                    warn!("⚠️ skipping {}: {}", item.grayscale_path.display(), e);
                    skipped += 1;
                }
            }
        }

        let batch_size = labels.len();
        if batch_size == 0 {
            return Err(EmptyBatch { dropped: skipped });
        }

        let grayscale = Tensor::<B, 4>::from_data(
            TensorData::new(gray_data, [batch_size, 1, side, side]),
            device,
        );
        let color = Tensor::<B, 4>::from_data(
            TensorData::new(color_data, [batch_size, 3, side, side]),
            device,
        );
        let labels =
            Tensor::<B, 1, Int>::from_data(TensorData::new(labels, [batch_size]), device);

        Ok(ColorizationBatch {
            grayscale,
            color,
            labels,
            skipped,
        })
    }
}
