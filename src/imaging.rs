use std::{path::Path, str::FromStr};

use crate::{error::ColorizeError, generator::Generator};
use burn::tensor::{backend::Backend, Tensor, TensorData};
use clap::ValueEnum;
use image::{imageops, imageops::FilterType, DynamicImage, GrayImage, Rgb, RgbImage};

/// Network inputs are padded up to a multiple of this.
pub const PAD_MULTIPLE: u32 = 16;

/// Geometry needed to map a generated image back onto its source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Prepared {
    /// Source image size (width, height).
    pub original: (u32, u32),
    /// Size after upscaling, before padding.
    pub working: (u32, u32),
    /// Size fed to the generator.
    pub padded: (u32, u32),
}

/// Converts to luma, upscales when the larger side is below `min_side` and
/// pads the bottom/right edges to a multiple of 16 by edge replication.
pub fn preprocess<B: Backend>(
    image: &DynamicImage,
    min_side: u32,
    device: &B::Device,
) -> (Tensor<B, 4>, Prepared) {
    let gray = image.to_luma8();
    let original = gray.dimensions();
    let (width, height) = original;

    let gray = if width.max(height) < min_side && width > 0 && height > 0 {
        let scale = min_side as f64 / width.max(height) as f64;
        let w = ((width as f64 * scale).round() as u32).max(1);
        let h = ((height as f64 * scale).round() as u32).max(1);
        imageops::resize(&gray, w, h, FilterType::Lanczos3)
    } else {
        gray
    };
    let working = gray.dimensions();
    let padded_image = pad_to_multiple(&gray, PAD_MULTIPLE);
    let padded = padded_image.dimensions();

    let data: Vec<f32> = padded_image
        .into_raw()
        .into_iter()
        .map(|p| p as f32 / 255.0)
        .collect();
    let tensor = Tensor::<B, 4>::from_data(
        TensorData::new(data, [1, 1, padded.1 as usize, padded.0 as usize]),
        device,
    );

    (
        tensor,
        Prepared {
            original,
            working,
            padded,
        },
    )
}

fn pad_to_multiple(image: &GrayImage, multiple: u32) -> GrayImage {
    let (width, height) = image.dimensions();
    let padded_w = width.div_ceil(multiple).max(1) * multiple;
    let padded_h = height.div_ceil(multiple).max(1) * multiple;
    if (padded_w, padded_h) == (width, height) {
        return image.clone();
    }
    GrayImage::from_fn(padded_w, padded_h, |x, y| {
        *image.get_pixel(x.min(width.saturating_sub(1)), y.min(height.saturating_sub(1)))
    })
}

/// First image of an NCHW batch in [0, 1] as an 8-bit RGB (or gray
/// replicated) image.
pub fn tensor_to_rgb<B: Backend>(tensor: Tensor<B, 4>) -> RgbImage {
    let [_, channels, height, width] = tensor.dims();
    let values: Vec<f32> = tensor
        .slice([0..1])
        .clamp(0.0, 1.0)
        .into_data()
        .iter::<f32>()
        .collect();
    let frame_size = height * width;
    let channel = |c: usize, i: usize| {
        let plane = if channels >= 3 { c } else { 0 };
        (values[plane * frame_size + i] * 255.0).round() as u8
    };

    RgbImage::from_fn(width as u32, height as u32, |x, y| {
        let i = y as usize * width + x as usize;
        Rgb([channel(0, i), channel(1, i), channel(2, i)])
    })
}

/// Crops the padding away and restores the source resolution.
pub fn postprocess<B: Backend>(
    generated: Tensor<B, 4>,
    prepared: &Prepared,
    enhancement: &Enhancement,
) -> Result<RgbImage, ColorizeError> {
    enhancement.validate()?;

    let rgb = tensor_to_rgb(generated);
    let (working_w, working_h) = prepared.working;
    let cropped = imageops::crop_imm(&rgb, 0, 0, working_w, working_h).to_image();

    let (width, height) = prepared.original;
    let mut restored = if (width, height) == prepared.working {
        cropped
    } else {
        imageops::resize(&cropped, width, height, FilterType::Lanczos3)
    };

    enhancement.apply(&mut restored);
    Ok(restored)
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum ColorStyle {
    #[default]
    Neutral,
    /// Punchier contrast and saturation.
    Modern,
    /// Faded sepia.
    Vintage,
}

impl FromStr for ColorStyle {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "neutral" => Ok(Self::Neutral),
            "modern" => Ok(Self::Modern),
            "vintage" => Ok(Self::Vintage),
            other => Err(format!(
                "unknown style '{other}' (expected neutral, modern or vintage)"
            )),
        }
    }
}

/// Cosmetic adjustments applied after colorization.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Enhancement {
    pub style: ColorStyle,
    /// Multiplier on chroma; must be positive.
    pub saturation: f32,
    /// -1 (cool) to 1 (warm).
    pub temperature: f32,
    pub contrast: f32,
    pub brightness: f32,
}

impl Default for Enhancement {
    fn default() -> Self {
        Self {
            style: ColorStyle::Neutral,
            saturation: 1.0,
            temperature: 0.0,
            contrast: 1.0,
            brightness: 1.0,
        }
    }
}

impl Enhancement {
    pub fn validate(&self) -> Result<(), ColorizeError> {
        let checks = [
            ("saturation", self.saturation, self.saturation > 0.0, "must be positive"),
            ("contrast", self.contrast, self.contrast >= 0.0, "must be non-negative"),
            ("brightness", self.brightness, self.brightness >= 0.0, "must be non-negative"),
            (
                "temperature",
                self.temperature,
                (-1.0..=1.0).contains(&self.temperature),
                "must be within [-1, 1]",
            ),
        ];
        for (name, value, ok, reason) in checks {
            if !ok {
                return Err(ColorizeError::InvalidEnhancement {
                    name,
                    value,
                    reason,
                });
            }
        }
        Ok(())
    }

    pub fn is_identity(&self) -> bool {
        *self == Self::default()
    }

    pub fn apply(&self, image: &mut RgbImage) {
        if self.is_identity() {
            return;
        }
        let (style_saturation, style_contrast) = match self.style {
            ColorStyle::Neutral | ColorStyle::Vintage => (1.0, 1.0),
            ColorStyle::Modern => (1.2, 1.1),
        };
        let saturation = self.saturation * style_saturation;
        let contrast = self.contrast * style_contrast;
        let warm = 0.1 * self.temperature;

        for pixel in image.pixels_mut() {
            let mut rgb = pixel.0.map(|c| c as f32 / 255.0);

            let luma = 0.299 * rgb[0] + 0.587 * rgb[1] + 0.114 * rgb[2];
            rgb = rgb.map(|c| luma + (c - luma) * saturation);

            if self.style == ColorStyle::Vintage {
                rgb = sepia(rgb);
            }

            rgb[0] *= 1.0 + warm;
            rgb[2] *= 1.0 - warm;
            rgb = rgb.map(|c| ((c - 0.5) * contrast + 0.5) * self.brightness);

            pixel.0 = rgb.map(|c| (c.clamp(0.0, 1.0) * 255.0).round() as u8);
        }
    }
}

/// 60/40 blend of the sepia matrix with the input, lifted slightly for a
/// faded look.
fn sepia([r, g, b]: [f32; 3]) -> [f32; 3] {
    let toned = [
        0.393 * r + 0.769 * g + 0.189 * b,
        0.349 * r + 0.686 * g + 0.168 * b,
        0.272 * r + 0.534 * g + 0.131 * b,
    ];
    let mut out = [0.0; 3];
    for c in 0..3 {
        let mixed = 0.6 * toned[c] + 0.4 * [r, g, b][c];
        out[c] = 0.05 + 0.9 * mixed;
    }
    out
}

/// Saves grayscale | target | generated side by side, first sample only.
pub fn save_sample_strip<B: Backend>(
    grayscale: Tensor<B, 4>,
    target: Tensor<B, 4>,
    generated: Tensor<B, 4>,
    path: &Path,
) -> Result<(), ColorizeError> {
    let panels = [
        tensor_to_rgb(grayscale),
        tensor_to_rgb(target),
        tensor_to_rgb(generated),
    ];
    let (width, height) = panels[1].dimensions();

    let mut strip = RgbImage::new(width * 3, height);
    for (i, panel) in panels.iter().enumerate() {
        let panel = if panel.dimensions() == (width, height) {
            panel.clone()
        } else {
            imageops::resize(panel, width, height, FilterType::Triangle)
        };
        imageops::replace(&mut strip, &panel, i as i64 * width as i64, 0);
    }

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    strip.save(path)?;
    Ok(())
}

/// Colorizes one image file with a loaded generator and writes the result.
pub fn colorize_file<B: Backend>(
    generator: &Generator<B>,
    input: &Path,
    output: &Path,
    min_side: u32,
    enhancement: &Enhancement,
    device: &B::Device,
) -> Result<(), ColorizeError> {
    enhancement.validate()?;
    let image = image::open(input)?;
    let (tensor, prepared) = preprocess::<B>(&image, min_side, device);
    let generated = generator.try_forward(tensor)?;
    let colorized = postprocess(generated, &prepared, enhancement)?;

    if let Some(parent) = output.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    colorized.save(output)?;
    Ok(())
}

/// Output path for `input`: `output` itself for a single file, otherwise
/// `<output dir>/<stem>_colorized.png`.
pub fn output_path(input: &Path, output: Option<&Path>, batch: bool) -> std::path::PathBuf {
    let stem = input
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "image".to_string());
    let file_name = format!("{stem}_colorized.png");
    match (output, batch) {
        (Some(output), false) => output.to_path_buf(),
        (Some(dir), true) => dir.join(file_name),
        (None, _) => input.with_file_name(file_name),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;
    use image::{GenericImageView, Luma};

    type TestBackend = NdArray<f32>;

    #[test]
    fn small_images_are_upscaled_and_padded() {
        let device = Default::default();
        let image = DynamicImage::ImageLuma8(GrayImage::from_pixel(10, 5, Luma([200])));

        let (tensor, prepared) = preprocess::<TestBackend>(&image, 40, &device);

        assert_eq!(prepared.original, (10, 5));
        assert_eq!(prepared.working, (40, 20));
        assert_eq!(prepared.padded, (48, 32));
        assert_eq!(tensor.dims(), [1, 1, 32, 48]);
    }

    #[test]
    fn large_images_are_only_padded() {
        let device = Default::default();
        let image = DynamicImage::ImageRgb8(RgbImage::from_pixel(33, 16, Rgb([10, 20, 30])));

        let (tensor, prepared) = preprocess::<TestBackend>(&image, 16, &device);

        assert_eq!(prepared.working, (33, 16));
        assert_eq!(tensor.dims(), [1, 1, 16, 48]);
    }

    #[test]
    fn postprocess_restores_source_size() {
        let device = Default::default();
        let prepared = Prepared {
            original: (10, 5),
            working: (40, 20),
            padded: (48, 32),
        };
        let generated = Tensor::<TestBackend, 4>::full([1, 3, 32, 48], 0.5, &device);

        let image = postprocess(generated, &prepared, &Enhancement::default()).unwrap();
        assert_eq!(image.dimensions(), (10, 5));
        assert!(image.get_pixel(3, 2).0.iter().all(|&c| c.abs_diff(128) <= 1));
    }

    #[test]
    fn non_positive_saturation_is_rejected() {
        let device = Default::default();
        let prepared = Prepared {
            original: (16, 16),
            working: (16, 16),
            padded: (16, 16),
        };
        let generated = Tensor::<TestBackend, 4>::zeros([1, 3, 16, 16], &device);
        let enhancement = Enhancement {
            saturation: 0.0,
            ..Default::default()
        };

        let result = postprocess(generated, &prepared, &enhancement);
        assert!(matches!(
            result,
            Err(ColorizeError::InvalidEnhancement { name: "saturation", .. })
        ));
    }

    #[test]
    fn saturation_pushes_channels_apart() {
        let mut image = RgbImage::from_pixel(1, 1, Rgb([150, 100, 100]));
        Enhancement {
            saturation: 2.0,
            ..Default::default()
        }
        .apply(&mut image);

        let [r, g, b] = image.get_pixel(0, 0).0;
        assert!(r > 150 && g < 100 && b < 100);
    }

    #[test]
    fn warm_temperature_shifts_red_over_blue() {
        let mut image = RgbImage::from_pixel(1, 1, Rgb([100, 100, 100]));
        Enhancement {
            temperature: 1.0,
            ..Default::default()
        }
        .apply(&mut image);

        let [r, _, b] = image.get_pixel(0, 0).0;
        assert!(r > b);
    }

    #[test]
    fn vintage_tints_gray_toward_sepia() {
        let mut image = RgbImage::from_pixel(1, 1, Rgb([128, 128, 128]));
        Enhancement {
            style: ColorStyle::Vintage,
            ..Default::default()
        }
        .apply(&mut image);

        let [r, g, b] = image.get_pixel(0, 0).0;
        assert!(r > g && g > b);
    }

    #[test]
    fn colorize_file_keeps_source_dimensions() {
        let device = Default::default();
        let dir = std::env::temp_dir().join(format!("tintora-colorize-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let input = dir.join("portrait.png");
        GrayImage::from_pixel(21, 13, Luma([90])).save(&input).unwrap();
        let output = output_path(&input, Some(&dir.join("out")), true);
        let generator = Generator::<TestBackend>::new(4, &device);

        colorize_file(&generator, &input, &output, 32, &Enhancement::default(), &device)
            .unwrap();

        assert!(output.ends_with("out/portrait_colorized.png"));
        assert_eq!(image::open(&output).unwrap().dimensions(), (21, 13));
    }

    #[test]
    fn single_output_path_is_used_verbatim() {
        let input = Path::new("photos/old.jpg");
        assert_eq!(
            output_path(input, Some(Path::new("new.png")), false),
            Path::new("new.png")
        );
        assert_eq!(
            output_path(input, None, false),
            Path::new("photos/old_colorized.png")
        );
    }

    #[test]
    fn styles_parse_case_insensitively() {
        assert_eq!("Modern".parse::<ColorStyle>(), Ok(ColorStyle::Modern));
        assert!("sepia".parse::<ColorStyle>().is_err());
    }

    #[test]
    fn sample_strip_is_three_panels_wide() {
        let device = Default::default();
        let dir = std::env::temp_dir().join(format!("tintora-strip-{}", std::process::id()));
        let path = dir.join("samples").join("epoch_1.png");

        save_sample_strip(
            Tensor::<TestBackend, 4>::zeros([2, 1, 16, 16], &device),
            Tensor::<TestBackend, 4>::ones([2, 3, 16, 16], &device),
            Tensor::<TestBackend, 4>::full([2, 3, 8, 8], 0.5, &device),
            &path,
        )
        .unwrap();

        let strip = image::open(&path).unwrap().to_rgb8();
        assert_eq!(strip.dimensions(), (48, 16));
        assert_eq!(strip.get_pixel(0, 0).0, [0, 0, 0]);
        assert_eq!(strip.get_pixel(20, 0).0, [255, 255, 255]);
    }
}
