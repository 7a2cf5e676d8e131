use std::io::Write;
use std::path::Path;
use std::time::Duration;

use candle_core::{DType, Device};
use image::{DynamicImage, GenericImageView};
use log::info;

use crate::error::VlmError;
use crate::hub::{load_config, LoadOptions, ModelConfig};
use crate::image_processor::{ImageProcessor, PixelValues};
use crate::llava::{LlavaNext, LLAVA_NEXT_MODEL_TYPE};
use crate::paligemma::Paligemma;
use crate::pipeline::{DEFAULT_MAX_TOKENS, DEFAULT_SEED, DEFAULT_TEMP, DEFAULT_TOP_P};
use crate::processor::{load_processor, Processor};
use crate::prompt::PALIGEMMA_MODEL_TYPE;

/// Model types with a backend in this crate.
pub const SUPPORTED_MODEL_TYPES: [&str; 2] = [PALIGEMMA_MODEL_TYPE, LLAVA_NEXT_MODEL_TYPE];

/// Sampling and budget parameters of one generation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GenerationParams {
    pub seed: u64,
    /// Temperature below `1e-7` means greedy decoding.
    pub temp: f64,
    /// Nucleus threshold, `1.0` disables top-p filtering.
    pub top_p: f64,
    pub max_tokens: usize,
    pub repeat_penalty: f32,
    pub repeat_last_n: usize,
    /// Stream tokens and statistics to stdout while generating.
    pub verbose: bool,
}

impl Default for GenerationParams {
    fn default() -> Self {
        Self {
            seed: DEFAULT_SEED,
            temp: DEFAULT_TEMP,
            top_p: DEFAULT_TOP_P,
            max_tokens: DEFAULT_MAX_TOKENS,
            repeat_penalty: 1.0,
            repeat_last_n: 64,
            verbose: true,
        }
    }
}

/// Text produced by a model along with timing statistics.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GenerationOutput {
    pub text: String,
    pub prompt_tokens: usize,
    pub generated_tokens: usize,
    pub prompt_time: Duration,
    pub generation_time: Duration,
}

impl GenerationOutput {
    pub fn prompt_tps(&self) -> f64 {
        tokens_per_second(self.prompt_tokens, self.prompt_time)
    }

    pub fn generation_tps(&self) -> f64 {
        tokens_per_second(self.generated_tokens, self.generation_time)
    }
}

fn tokens_per_second(tokens: usize, elapsed: Duration) -> f64 {
    let secs = elapsed.as_secs_f64();
    if secs > 0.0 {
        tokens as f64 / secs
    } else {
        0.0
    }
}

/// A loaded vision-language model.
pub trait VisionLanguageModel {
    /// The model type the weights were loaded as.
    fn model_type(&self) -> &str;

    fn dtype(&self) -> DType;

    fn device(&self) -> &Device;

    /// Turn a decoded image into the pixel values [`Self::generate`] expects.
    ///
    /// Defaults to a single `[1, 3, H, W]` tensor from the model image processor.
    fn preprocess(
        &self,
        image: &DynamicImage,
        image_processor: &ImageProcessor,
    ) -> Result<PixelValues, VlmError> {
        Ok(PixelValues {
            tensor: image_processor.preprocess(image, self.dtype(), self.device())?,
            image_size: image.dimensions(),
        })
    }

    /// Run the token loop.
    ///
    /// # Arguments
    ///
    /// * `processor` - Supplies the tokenizer and special tokens.
    /// * `pixel_values` - One [`Self::preprocess`] output per image.
    /// * `prompt` - The formatted prompt.
    /// * `params` - Sampling parameters and token budget.
    /// * `stream` - Receives each decoded piece of text as soon as it is available.
    fn generate(
        &mut self,
        processor: &Processor,
        pixel_values: &[PixelValues],
        prompt: &str,
        params: &GenerationParams,
        stream: Option<&mut dyn Write>,
    ) -> Result<GenerationOutput, VlmError>;
}

impl<M: VisionLanguageModel + ?Sized> VisionLanguageModel for Box<M> {
    fn model_type(&self) -> &str {
        (**self).model_type()
    }

    fn dtype(&self) -> DType {
        (**self).dtype()
    }

    fn device(&self) -> &Device {
        (**self).device()
    }

    fn preprocess(
        &self,
        image: &DynamicImage,
        image_processor: &ImageProcessor,
    ) -> Result<PixelValues, VlmError> {
        (**self).preprocess(image, image_processor)
    }

    fn generate(
        &mut self,
        processor: &Processor,
        pixel_values: &[PixelValues],
        prompt: &str,
        params: &GenerationParams,
        stream: Option<&mut dyn Write>,
    ) -> Result<GenerationOutput, VlmError> {
        (**self).generate(processor, pixel_values, prompt, params, stream)
    }
}

/// Pick the device the weights are loaded on.
///
/// NOTE: to run on Cuda, pass the `--features cuda` flag to the `cargo run` command.
pub fn select_device() -> (Device, DType) {
    #[cfg(feature = "cuda")]
    let (device, dtype) = match Device::cuda_if_available(0) {
        Ok(device) if device.is_cuda() => (device, DType::BF16),
        Ok(device) => (device, DType::F32),
        Err(e) => {
            log::warn!("CUDA not available, defaulting to CPU: {e}");
            (Device::Cpu, DType::F32)
        }
    };

    #[cfg(not(feature = "cuda"))]
    let (device, dtype) = (Device::Cpu, DType::F32);

    (device, dtype)
}

/// Fail early on a config no backend can load.
pub fn ensure_supported(config: &ModelConfig) -> Result<(), VlmError> {
    if SUPPORTED_MODEL_TYPES.contains(&config.model_type.as_str()) {
        Ok(())
    } else {
        Err(VlmError::UnsupportedModelType(config.model_type.clone()))
    }
}

/// Load the model and its processor from a local model directory.
///
/// The architecture is chosen from `model_type` in `config.json`.
pub fn load(
    model_path: &Path,
    options: &LoadOptions,
) -> Result<(Box<dyn VisionLanguageModel>, Processor), VlmError> {
    let config = load_config(model_path)?;
    if config.requires_remote_code() && !options.trust_remote_code {
        return Err(VlmError::RemoteCodeNotTrusted(config.model_type));
    }
    ensure_supported(&config)?;

    let processor = load_processor(model_path)?;
    let (device, dtype) = select_device();
    info!(
        "Loading {} weights on {:?} as {:?}",
        config.model_type, device, dtype
    );

    let model: Box<dyn VisionLanguageModel> = match config.model_type.as_str() {
        PALIGEMMA_MODEL_TYPE => Box::new(Paligemma::load(model_path, &config, dtype, &device)?),
        LLAVA_NEXT_MODEL_TYPE => Box::new(LlavaNext::load(model_path, &config, dtype, &device)?),
        other => return Err(VlmError::UnsupportedModelType(other.to_string())),
    };

    Ok((model, processor))
}
