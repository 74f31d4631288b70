//! Element-wise non-linearities used between dense layers.
//!
//! Activations consume tensors shaped `(batch, features)` and return tensors
//! with identical layout. Every variant is differentiable through candle's
//! autograd so they can sit on both sides of the adversarial graph.

use candle_core::{Result, Tensor};
use candle_nn::ops;

/// Non-linearity applied after a dense projection.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Activation {
    /// Leaves the projection untouched (critic scores, regression heads).
    Identity,
    /// Standard rectifier.
    Relu,
    /// Rectifier with a slope for negative inputs.
    LeakyRelu { negative_slope: f64 },
    /// Logistic squashing into `(0, 1)`, matching min-max normalized targets.
    Sigmoid,
    /// Hyperbolic tangent.
    Tanh,
}

impl Activation {
    /// Leaky rectifier with the slope commonly used by GAN generators and critics.
    pub const fn leaky() -> Self {
        Self::LeakyRelu {
            negative_slope: 0.2,
        }
    }

    pub fn forward(&self, input: &Tensor) -> Result<Tensor> {
        match *self {
            Activation::Identity => Ok(input.clone()),
            Activation::Relu => input.relu(),
            Activation::LeakyRelu { negative_slope } => ops::leaky_relu(input, negative_slope),
            Activation::Sigmoid => ops::sigmoid(input),
            Activation::Tanh => input.tanh(),
        }
    }
}
