use std::marker::PhantomData;

use burn::{
    module::{AutodiffModule, ModuleVisitor, ParamId},
    optim::GradientsParams,
    tensor::{
        backend::{AutodiffBackend, Backend},
        ElementConversion, Tensor,
    },
};
use log::{debug, info};

// f16 tops out at 65504, so start low enough that a unit loss survives.
const INITIAL_SCALE: f64 = 1024.0;
const GROWTH_INTERVAL: usize = 2000;
const GROWTH_FACTOR: f64 = 2.0;
const BACKOFF_FACTOR: f64 = 0.5;
const MIN_SCALE: f64 = 1.0;

/// Dynamic loss scaling for reduced-precision backends.
///
/// Losses are multiplied by `scale` before `backward` so small gradients
/// survive half precision; gradients are divided back before the optimizer
/// step. An overflow skips the step and halves the scale, a long run of clean
/// steps doubles it. Powers of two are exact in binary floats, so on a
/// full-precision backend scaling leaves the gradients unchanged.
#[derive(Debug, Clone)]
pub struct LossScaler {
    enabled: bool,
    scale: f64,
    growth_interval: usize,
    clean_steps: usize,
}

impl LossScaler {
    pub fn new<B: Backend>(requested: bool) -> Self {
        if !requested {
            return Self::disabled();
        }
        let bits = core::mem::size_of::<B::FloatElem>() * 8;
        info!("mixed precision: {bits}-bit floats, dynamic loss scaling from {INITIAL_SCALE}");
        Self::dynamic(INITIAL_SCALE, GROWTH_INTERVAL)
    }

    pub fn dynamic(initial_scale: f64, growth_interval: usize) -> Self {
        Self {
            enabled: true,
            scale: initial_scale,
            growth_interval,
            clean_steps: 0,
        }
    }

    pub fn disabled() -> Self {
        Self {
            enabled: false,
            scale: 1.0,
            growth_interval: GROWTH_INTERVAL,
            clean_steps: 0,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn scale(&self) -> f64 {
        self.scale
    }

    pub fn scale_loss<B: Backend>(&self, loss: Tensor<B, 1>) -> Tensor<B, 1> {
        if self.enabled {
            loss.mul_scalar(self.scale)
        } else {
            loss
        }
    }

    /// Divides every gradient of `module` by the current scale. Returns the
    /// unscaled gradients and whether all of them are finite.
    pub fn unscale<B, M>(&self, module: &M, mut grads: GradientsParams) -> (GradientsParams, bool)
    where
        B: AutodiffBackend,
        M: AutodiffModule<B>,
    {
        if !self.enabled {
            return (grads, true);
        }

        let mut unscaler = GradUnscaler::<B> {
            grads: &mut grads,
            inv_scale: 1.0 / self.scale,
            finite: true,
            phantom: PhantomData,
        };
        module.visit(&mut unscaler);
        let finite = unscaler.finite;

        (grads, finite)
    }

    /// Records the outcome of an optimizer step.
    pub fn update(&mut self, overflow: bool) {
        if !self.enabled {
            return;
        }
        if overflow {
            self.scale = (self.scale * BACKOFF_FACTOR).max(MIN_SCALE);
            self.clean_steps = 0;
            debug!("gradient overflow, loss scale reduced to {}", self.scale);
            return;
        }
        self.clean_steps += 1;
        if self.clean_steps >= self.growth_interval {
            self.scale *= GROWTH_FACTOR;
            self.clean_steps = 0;
        }
    }
}

struct GradUnscaler<'a, B: AutodiffBackend> {
    grads: &'a mut GradientsParams,
    inv_scale: f64,
    finite: bool,
    phantom: PhantomData<B>,
}

impl<B: AutodiffBackend> ModuleVisitor<B> for GradUnscaler<'_, B> {
    fn visit_float<const D: usize>(&mut self, id: ParamId, _tensor: &Tensor<B, D>) {
        let Some(grad) = self.grads.remove::<B::InnerBackend, D>(id) else {
            return;
        };
        let grad = grad.mul_scalar(self.inv_scale);
        // Zero for finite entries, NaN for inf or NaN; summing never overflows.
        let poison: f64 = grad.clone().mul_scalar(0.0).sum().into_scalar().elem();
        if !poison.is_finite() {
            self.finite = false;
        }
        self.grads.register::<B::InnerBackend, D>(id, grad);
    }
}
