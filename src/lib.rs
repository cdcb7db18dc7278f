//! Grayscale photo colorization with a U-Net generator, a semantic
//! classifier and a PatchGAN discriminator trained adversarially on burn.

pub mod blocks;
pub mod checkpoint;
pub mod classifier;
pub mod config;
pub mod data;
pub mod discriminator;
pub mod error;
pub mod generator;
pub mod imaging;
pub mod losses;
pub mod model;
pub mod precision;
pub mod schedule;
pub mod training;

pub use config::{DeviceKind, TrainingConfig};
pub use error::ColorizeError;
pub use model::{Colorizer, ColorizerOutput, ForwardMode};
pub use training::{ColorizerTrainer, TrainingSummary};
