pub mod activation;
pub mod config;
pub mod gan;
pub mod linear;
pub mod mlp;
pub mod noise;

pub use activation::Activation;
pub use config::{GanConfig, MlpConfig};
pub use gan::ConditionalGan;
pub use linear::{Linear, LinearInit};
pub use mlp::Mlp;
pub use noise::{sample_noise, NoisePrior};
