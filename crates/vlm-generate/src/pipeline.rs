use std::io::Write;
use std::path::{Path, PathBuf};

use log::debug;

use crate::error::VlmError;
use crate::generate::{generate, GenerationRequest};
use crate::hub::{get_model_path, load_config, LoadOptions, ModelConfig};
use crate::image_processor::{load_image_processor, ImageProcessor, ImageSource};
use crate::model::{load, GenerationParams, VisionLanguageModel};
use crate::processor::Processor;
use crate::prompt::apply_prompt_template;

pub const DEFAULT_MODEL_PATH: &str = "llava-hf/llava-v1.6-vicuna-7b-hf";
pub const DEFAULT_IMAGE: [&str; 1] = ["http://images.cocodataset.org/val2017/000000039769.jpg"];
pub const DEFAULT_PROMPT: &str = "What are these?";
pub const DEFAULT_MAX_TOKENS: usize = 100;
pub const DEFAULT_TEMP: f64 = 0.3;
pub const DEFAULT_TOP_P: f64 = 1.0;
pub const DEFAULT_SEED: u64 = 0;

/// Settings of one invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerateArgs {
    /// Local model directory or HuggingFace Hub repository id.
    pub model: String,
    /// URLs or paths of the images.
    pub images: Vec<String>,
    /// Raw prompt, escape sequences not yet decoded.
    pub prompt: String,
    pub max_tokens: usize,
    pub temp: f64,
    pub top_p: f64,
    pub seed: u64,
    /// Let the generator stream its output instead of printing the final text.
    pub verbose: bool,
}

impl Default for GenerateArgs {
    fn default() -> Self {
        Self {
            model: DEFAULT_MODEL_PATH.to_string(),
            images: DEFAULT_IMAGE.iter().map(|image| image.to_string()).collect(),
            prompt: DEFAULT_PROMPT.to_string(),
            max_tokens: DEFAULT_MAX_TOKENS,
            temp: DEFAULT_TEMP,
            top_p: DEFAULT_TOP_P,
            seed: DEFAULT_SEED,
            verbose: true,
        }
    }
}

impl GenerateArgs {
    pub fn generation_params(&self) -> GenerationParams {
        GenerationParams {
            seed: self.seed,
            temp: self.temp,
            top_p: self.top_p,
            max_tokens: self.max_tokens,
            verbose: self.verbose,
            ..Default::default()
        }
    }
}

/// The model with everything loaded alongside it.
pub struct ModelBundle<M> {
    pub model: M,
    pub processor: Processor,
    pub image_processor: Option<ImageProcessor>,
    pub config: ModelConfig,
}

/// The collaborators the pipeline delegates to.
pub trait Backend {
    type Model: VisionLanguageModel;

    fn get_model_path(&self, path_or_repo: &str) -> Result<PathBuf, VlmError>;

    fn load_config(&self, model_path: &Path) -> Result<ModelConfig, VlmError>;

    fn load(
        &self,
        model_path: &Path,
        options: &LoadOptions,
    ) -> Result<(Self::Model, Processor), VlmError>;

    fn load_image_processor(&self, model_path: &Path)
        -> Result<Option<ImageProcessor>, VlmError>;

    fn generate(&self, request: GenerationRequest<'_, Self::Model>) -> Result<String, VlmError>;
}

/// Models from local directories or the HuggingFace Hub, run with candle.
#[derive(Debug, Clone, Copy, Default)]
pub struct HubBackend;

impl Backend for HubBackend {
    type Model = Box<dyn VisionLanguageModel>;

    fn get_model_path(&self, path_or_repo: &str) -> Result<PathBuf, VlmError> {
        get_model_path(path_or_repo)
    }

    fn load_config(&self, model_path: &Path) -> Result<ModelConfig, VlmError> {
        load_config(model_path)
    }

    fn load(
        &self,
        model_path: &Path,
        options: &LoadOptions,
    ) -> Result<(Self::Model, Processor), VlmError> {
        load(model_path, options)
    }

    fn load_image_processor(
        &self,
        model_path: &Path,
    ) -> Result<Option<ImageProcessor>, VlmError> {
        load_image_processor(model_path)
    }

    fn generate(&self, request: GenerationRequest<'_, Self::Model>) -> Result<String, VlmError> {
        generate(request)
    }
}

/// Resolve the model location and load the model, its processors and its config.
pub fn get_model_and_processors<B: Backend>(
    backend: &B,
    model_path: &str,
) -> Result<ModelBundle<B::Model>, VlmError> {
    let model_path = backend.get_model_path(model_path)?;
    let config = backend.load_config(&model_path)?;
    let (model, processor) = backend.load(
        &model_path,
        &LoadOptions {
            trust_remote_code: true,
        },
    )?;
    let image_processor = backend.load_image_processor(&model_path)?;

    Ok(ModelBundle {
        model,
        processor,
        image_processor,
        config,
    })
}

/// Run one invocation: load, format the prompt, generate.
///
/// When `args.verbose` is false the generated text is written to `out` once the
/// generator returns; otherwise the generator is expected to have shown it.
///
/// # Returns
///
/// The generated text.
pub fn run<B: Backend, W: Write>(
    args: &GenerateArgs,
    backend: &B,
    out: &mut W,
) -> Result<String, VlmError> {
    let mut bundle = get_model_and_processors(backend, &args.model)?;
    debug!("Loaded processor: {:?}", bundle.processor);

    let prompt = apply_prompt_template(
        &bundle.processor,
        bundle.model.model_type(),
        &bundle.config.model_type,
        &args.prompt,
    )?;

    let images = args
        .images
        .iter()
        .map(|image| ImageSource::parse(image))
        .collect::<Vec<_>>();

    let output = backend.generate(GenerationRequest {
        model: &mut bundle.model,
        processor: &bundle.processor,
        images: &images,
        prompt: &prompt,
        image_processor: bundle.image_processor.as_ref(),
        params: args.generation_params(),
    })?;

    if !args.verbose {
        writeln!(out, "{output}")?;
    }

    Ok(output)
}
