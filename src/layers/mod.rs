//! Neural Network Layers
//!
//! Building blocks of the BERT and DeBERTa encoders, each with an explicit
//! forward and backward pass.
//!
//! ## Layers
//!
//! - **activation**: exact and tanh GELU
//! - **linear**: fully connected layer, optional bias
//! - **layer_norm**: layer normalization with configurable ε
//! - **dropout**: inverted dropout driven by a caller-supplied RNG
//! - **embeddings**: word / position / token-type lookup + LayerNorm
//! - **output**: dense → dropout → residual → LayerNorm
//! - **attention**: BERT multi-head self-attention
//! - **disentangled_attention**: DeBERTa content/position attention
//! - **mlp**: feed-forward sub-layer
//! - **block**: one encoder layer
//!
//! ## Design Pattern
//!
//! ```rust,ignore
//! impl TrainableLayer {
//!     pub fn forward(&self, x: &Tensor, ..) -> (Tensor, Cache) { }
//!     pub fn backward(&self, grad: &Tensor, cache: &Cache, ..) -> LayerGradients { }
//!     pub fn visit_parameters(&self, prefix: &str, f: &mut dyn FnMut(&str, &Tensor)) { }
//! }
//! ```
//!
//! Leaf layers return typed gradient structs; composite layers record them in
//! a [`Gradients`](crate::gradients::Gradients) map under the same names that
//! `visit_parameters` reports, and return only the input gradient.

pub mod activation;
pub mod attention;
pub mod block;
pub mod disentangled_attention;
pub mod dropout;
pub mod embeddings;
pub mod layer_norm;
pub mod linear;
pub mod mlp;
pub mod output;

pub use activation::Activation;
pub use attention::{AttentionCache, TrainableSelfAttention};
pub use block::{EncoderLayerCache, LayerAttention, TrainableEncoderLayer};
pub use disentangled_attention::{DisentangledCache, RelativeGradient, TrainableDisentangledAttention};
pub use dropout::{DropoutCache, TrainableDropout};
pub use embeddings::{EmbeddingsCache, TrainableEmbeddings};
pub use layer_norm::{LayerNormCache, LayerNormGradients, TrainableLayerNorm};
pub use linear::{normal_init, uniform_init, LinearCache, LinearGradients, TrainableLinear};
pub use mlp::{FeedForwardCache, TrainableFeedForward};
pub use output::{OutputCache, TrainableOutput};
