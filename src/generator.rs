use crate::{
    blocks::{check_input, resize_bilinear, upscaled_size, AttentionBlock, DoubleConv},
    error::ColorizeError,
};
use burn::{
    nn::{
        conv::{Conv2d, Conv2dConfig, ConvTranspose2d, ConvTranspose2dConfig},
        pool::{MaxPool2d, MaxPool2dConfig},
        PaddingConfig2d, Relu, Sigmoid,
    },
    prelude::*,
    tensor::{backend::Backend, Tensor},
};

/// Smallest spatial side the four pooling stages can handle.
pub const MIN_GENERATOR_SIDE: usize = 16;

/// U-Net colorizer: grayscale (B,1,H,W) to RGB (B,3,H,W) in [0, 1].
#[derive(Module, Debug)]
pub struct Generator<B: Backend> {
    enc1: DoubleConv<B>,
    enc2: DoubleConv<B>,
    enc3: DoubleConv<B>,
    enc4: DoubleConv<B>,
    pool: MaxPool2d,
    bottleneck: DoubleConv<B>,
    attention: AttentionBlock<B>,
    up4: ConvTranspose2d<B>,
    dec4: DoubleConv<B>,
    up3: ConvTranspose2d<B>,
    dec3: DoubleConv<B>,
    up2: ConvTranspose2d<B>,
    dec2: DoubleConv<B>,
    up1: ConvTranspose2d<B>,
    dec1: DoubleConv<B>,
    head: Conv2d<B>,
    refine1: Conv2d<B>,
    refine2: Conv2d<B>,
    relu: Relu,
    sigmoid: Sigmoid,
}

impl<B: Backend> Generator<B> {
    /// `width` is the channel count of the first encoder level; each level
    /// doubles it.
    pub fn new(width: usize, device: &B::Device) -> Self {
        let [w1, w2, w3, w4, w5] = [width, width * 2, width * 4, width * 8, width * 16];
        let up = |cin, cout| {
            ConvTranspose2dConfig::new([cin, cout], [2, 2])
                .with_stride([2, 2])
                .init(device)
        };
        let refine_width = (width / 2).max(4);
        let conv3x3 = |cin, cout| {
            Conv2dConfig::new([cin, cout], [3, 3])
                .with_padding(PaddingConfig2d::Explicit(1, 1))
                .init(device)
        };

        Self {
            enc1: DoubleConv::new(1, w1, device),
            enc2: DoubleConv::new(w1, w2, device),
            enc3: DoubleConv::new(w2, w3, device),
            enc4: DoubleConv::new(w3, w4, device),
            pool: MaxPool2dConfig::new([2, 2]).with_strides([2, 2]).init(),
            bottleneck: DoubleConv::new(w4, w5, device),
            attention: AttentionBlock::new(w5, device),
            up4: up(w5, w4),
            dec4: DoubleConv::new(w4 * 2, w4, device),
            up3: up(w4, w3),
            dec3: DoubleConv::new(w3 * 2, w3, device),
            up2: up(w3, w2),
            dec2: DoubleConv::new(w2 * 2, w2, device),
            up1: up(w2, w1),
            dec1: DoubleConv::new(w1 * 2, w1, device),
            head: Conv2dConfig::new([w1, 3], [1, 1]).init(device),
            refine1: conv3x3(3, refine_width),
            refine2: conv3x3(refine_width, 3),
            relu: Relu::new(),
            sigmoid: Sigmoid::new(),
        }
    }

    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let [_, _, height, width] = x.dims();
        let x = match upscaled_size(height, width, MIN_GENERATOR_SIDE) {
            Some(size) => resize_bilinear(x, size),
            None => x,
        };

        let e1 = self.enc1.forward(x);
        let e2 = self.enc2.forward(self.pool.forward(e1.clone()));
        let e3 = self.enc3.forward(self.pool.forward(e2.clone()));
        let e4 = self.enc4.forward(self.pool.forward(e3.clone()));

        let b = self.bottleneck.forward(self.pool.forward(e4.clone()));
        let b = self.attention.forward(b);

        let d4 = self.dec4.forward(Self::merge(self.up4.forward(b), e4));
        let d3 = self.dec3.forward(Self::merge(self.up3.forward(d4), e3));
        let d2 = self.dec2.forward(Self::merge(self.up2.forward(d3), e2));
        let d1 = self.dec1.forward(Self::merge(self.up1.forward(d2), e1));

        let raw = self.sigmoid.forward(self.head.forward(d1));
        let refined = self.relu.forward(self.refine1.forward(raw));
        let color = self.sigmoid.forward(self.refine2.forward(refined));

        // Resize weights are convex; the clamp only absorbs rounding.
        resize_bilinear(color, [height, width]).clamp(0.0, 1.0)
    }

    pub fn try_forward(&self, x: Tensor<B, 4>) -> Result<Tensor<B, 4>, ColorizeError> {
        check_input(&x, 1)?;
        Ok(self.forward(x))
    }

    /// Concatenates an upsampled decoder tensor with its encoder skip, fixing
    /// the off-by-one left by pooling odd dimensions.
    fn merge(up: Tensor<B, 4>, skip: Tensor<B, 4>) -> Tensor<B, 4> {
        let [_, _, height, width] = skip.dims();
        let up = resize_bilinear(up, [height, width]);
        Tensor::cat(vec![up, skip], 1)
    }
}
