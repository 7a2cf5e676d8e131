//! # VLM Generate
//!
//! Load a vision-language model together with its processors, format a prompt with the
//! model-specific chat template and generate text about an image.
//!
//! The crate is organised around the steps of a single generation:
//!
//! - **Resolve**: find the model on disk or download it from the HuggingFace Hub.
//! - **Load**: read the model config, the model weights, the text processor and the
//!   image processor.
//! - **Template**: decode escape sequences in the raw prompt and render it through the
//!   chat template exposed by the processor.
//! - **Generate**: fetch and preprocess the image and run the token loop.
//!
//! [`pipeline::run`] chains the steps behind a [`pipeline::Backend`] so every
//! collaborator can be swapped out.

/// Error types for the crate.
pub mod error;

/// Python-style `unicode_escape` decoding for raw prompts.
pub mod escape;

/// Generation invoker and its request type.
pub mod generate;

/// Model path resolution and config loading.
pub mod hub;

/// Image fetching and preprocessing.
pub mod image_processor;

/// LLaVA-NeXT backend built on candle.
pub mod llava;

/// Per model family chat messages.
pub mod message;

/// Loaded model interface and the loader dispatching on the model type.
pub mod model;

/// PaliGemma backend built on candle.
pub mod paligemma;

/// End-to-end generation pipeline.
pub mod pipeline;

/// Text processor and its capability.
pub mod processor;

/// Prompt formatting strategies.
pub mod prompt;

mod sampling;

/// Chat template rendering with minijinja.
pub mod template;

pub use error::VlmError;
