use crate::error::ColorizeError;
use burn::{
    module::Param,
    nn::{
        conv::{Conv2d, Conv2dConfig},
        BatchNorm, BatchNormConfig, PaddingConfig2d, Relu,
    },
    prelude::*,
    tensor::{activation::softmax, backend::Backend, Tensor, TensorData},
};

/// Bilinear resize of an NCHW tensor, applied as one weight matrix per axis.
/// Growing an axis interpolates linearly between the corner samples,
/// shrinking it averages the covered source window. Every output is a convex
/// combination of inputs. Returns the input untouched when it already has the
/// requested spatial size.
pub fn resize_bilinear<B: Backend>(x: Tensor<B, 4>, size: [usize; 2]) -> Tensor<B, 4> {
    let [batch, channels, height, width] = x.dims();
    let [target_height, target_width] = size;
    if [height, width] == size {
        return x;
    }
    let device = x.device();
    if height == 0 || width == 0 || target_height == 0 || target_width == 0 {
        return Tensor::zeros([batch, channels, target_height, target_width], &device);
    }

    let x = if width == target_width {
        x
    } else {
        let weights = axis_matrix::<B>(width, target_width, &device)
            .transpose()
            .unsqueeze::<4>()
            .expand([batch, channels, width, target_width]);
        x.matmul(weights)
    };
    if height == target_height {
        x
    } else {
        let weights = axis_matrix::<B>(height, target_height, &device)
            .unsqueeze::<4>()
            .expand([batch, channels, target_height, height]);
        weights.matmul(x)
    }
}

fn axis_matrix<B: Backend>(from: usize, to: usize, device: &B::Device) -> Tensor<B, 2> {
    Tensor::from_data(TensorData::new(axis_weights(from, to), [to, from]), device)
}

/// Row-major `to x from` matrix whose rows are non-negative and sum to one.
fn axis_weights(from: usize, to: usize) -> Vec<f32> {
    let mut weights = vec![0.0f32; to * from];
    for (i, row) in weights.chunks_mut(from).enumerate() {
        if to >= from {
            let position = if to > 1 {
                i as f64 * (from - 1) as f64 / (to - 1) as f64
            } else {
                0.0
            };
            let low = (position.floor() as usize).min(from - 1);
            let high = (low + 1).min(from - 1);
            let frac = (position - low as f64).clamp(0.0, 1.0) as f32;
            row[low] += 1.0 - frac;
            row[high] += frac;
        } else {
            let start = i * from / to;
            let end = ((i + 1) * from).div_ceil(to).clamp(start + 1, from);
            let share = 1.0 / (end - start) as f32;
            row[start..end].fill(share);
        }
    }
    weights
}

/// Rejects inputs the networks cannot consume before any layer runs.
pub fn check_input<B: Backend>(
    x: &Tensor<B, 4>,
    expected_channels: usize,
) -> Result<(), ColorizeError> {
    let [_, channels, height, width] = x.dims();
    if channels != expected_channels {
        return Err(ColorizeError::ChannelMismatch {
            expected: expected_channels,
            found: channels,
        });
    }
    if height == 0 || width == 0 {
        return Err(ColorizeError::InputTooSmall { height, width });
    }
    Ok(())
}

/// Upscales so the smaller spatial side reaches `min_side`, keeping the aspect
/// ratio. `None` when no resize is needed.
pub fn upscaled_size(height: usize, width: usize, min_side: usize) -> Option<[usize; 2]> {
    let smaller = height.min(width);
    if smaller == 0 || smaller >= min_side {
        return None;
    }
    let scale = min_side as f64 / smaller as f64;
    let scaled = |side: usize| ((side as f64 * scale).round() as usize).max(min_side);
    Some([scaled(height), scaled(width)])
}

/// conv → batch-norm → ReLU, twice. Spatial size is preserved.
#[derive(Module, Debug)]
pub struct DoubleConv<B: Backend> {
    conv1: Conv2d<B>,
    norm1: BatchNorm<B, 2>,
    conv2: Conv2d<B>,
    norm2: BatchNorm<B, 2>,
    relu: Relu,
}

impl<B: Backend> DoubleConv<B> {
    pub fn new(in_channels: usize, out_channels: usize, device: &B::Device) -> Self {
        let conv = |cin, cout| {
            Conv2dConfig::new([cin, cout], [3, 3])
                .with_padding(PaddingConfig2d::Explicit(1, 1))
                .init(device)
        };

        Self {
            conv1: conv(in_channels, out_channels),
            norm1: BatchNormConfig::new(out_channels).init(device),
            conv2: conv(out_channels, out_channels),
            norm2: BatchNormConfig::new(out_channels).init(device),
            relu: Relu::new(),
        }
    }

    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let x = self.relu.forward(self.norm1.forward(self.conv1.forward(x)));
        self.relu.forward(self.norm2.forward(self.conv2.forward(x)))
    }
}

/// Self-attention over the spatial positions of a feature map, blended back
/// into the input through a learned gate that starts at zero.
#[derive(Module, Debug)]
pub struct AttentionBlock<B: Backend> {
    query: Conv2d<B>,
    key: Conv2d<B>,
    value: Conv2d<B>,
    gamma: Param<Tensor<B, 1>>,
    inner_channels: usize,
}

impl<B: Backend> AttentionBlock<B> {
    pub fn new(channels: usize, device: &B::Device) -> Self {
        let inner_channels = (channels / 8).max(1);
        let projection = |cout| Conv2dConfig::new([channels, cout], [1, 1]).init(device);

        Self {
            query: projection(inner_channels),
            key: projection(inner_channels),
            value: projection(channels),
            gamma: Param::from_tensor(Tensor::zeros([1], device)),
            inner_channels,
        }
    }

    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let [batch, channels, height, width] = x.dims();
        let positions = height * width;
        if positions == 0 {
            return x;
        }

        let query = self
            .query
            .forward(x.clone())
            .reshape([batch, self.inner_channels, positions])
            .swap_dims(1, 2);
        let key = self
            .key
            .forward(x.clone())
            .reshape([batch, self.inner_channels, positions]);
        let value = self
            .value
            .forward(x.clone())
            .reshape([batch, channels, positions]);

        let scale = (self.inner_channels as f64).sqrt();
        let energy = query.matmul(key).div_scalar(scale);
        // Row i holds the weights position i assigns to every other position.
        let attention = softmax(energy, 2);

        let out = value
            .matmul(attention.swap_dims(1, 2))
            .reshape([batch, channels, height, width]);

        x + out * self.gamma.val().reshape([1, 1, 1, 1])
    }
}
