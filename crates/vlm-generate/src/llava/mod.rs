use std::io::Write;
use std::path::Path;
use std::time::Instant;

use candle_core::{DType, Device, IndexOp, Tensor};
use candle_nn::VarBuilder;
use candle_transformers::models::llama::Cache;
use candle_transformers::models::llava::config::{
    HFGenerationConfig, HFLLaVAConfig, HFPreProcessorConfig, LLaVAConfig,
};
use candle_transformers::models::llava::utils::select_best_resolution;
use candle_transformers::models::llava::LLaVA;
use image::imageops::{overlay, FilterType};
use image::{DynamicImage, GenericImageView, Rgb, RgbImage};
use log::debug;

use crate::error::VlmError;
use crate::hub::{read_model_file, weight_files, ModelConfig};
use crate::image_processor::{ImageProcessor, PixelValues};
use crate::model::{GenerationOutput, GenerationParams, VisionLanguageModel};
use crate::processor::Processor;
use crate::sampling::{apply_repeat_penalty, logits_processor, TextStream};

/// `model_type` of the LLaVA-NeXT checkpoints converted to transformers.
pub const LLAVA_NEXT_MODEL_TYPE: &str = "llava_next";

const GENERATION_CONFIG_FILE: &str = "generation_config.json";
const PREPROCESSOR_CONFIG_FILE: &str = "preprocessor_config.json";

/// The LLaVA-NeXT model
///
/// A CLIP vision tower and a projector feed image features into a Llama decoder.
/// Images are split into a grid of crops ("anyres") chosen from the pinpoints of the
/// config.
pub struct LlavaNext {
    model: LLaVA,
    config: LLaVAConfig,
    /// Side of the square crops the vision tower sees.
    patch_size: u32,
    dtype: DType,
    device: Device,
}

impl LlavaNext {
    /// Load a LLaVA-NeXT checkpoint from a model directory.
    ///
    /// Besides `config.json` the directory needs `generation_config.json` for the
    /// special token ids and `preprocessor_config.json` for the aspect ratio setting.
    pub fn load(
        model_path: &Path,
        config: &ModelConfig,
        dtype: DType,
        device: &Device,
    ) -> Result<Self, VlmError> {
        let hf_config: HFLLaVAConfig = config.parse()?;
        let generation_config: HFGenerationConfig =
            read_model_file(model_path, GENERATION_CONFIG_FILE)?;
        let preprocessor_config: HFPreProcessorConfig =
            read_model_file(model_path, PREPROCESSOR_CONFIG_FILE)?;

        let llava_config = hf_config.to_llava_config(&generation_config, &preprocessor_config);
        let clip_config = hf_config.to_clip_vision_config();
        debug!(
            "LLaVA-NeXT with {} layers, aspect ratio {}",
            llava_config.num_hidden_layers, llava_config.image_aspect_ratio
        );

        let filenames = weight_files(model_path)?;
        let vb = unsafe { VarBuilder::from_mmaped_safetensors(&filenames, dtype, device)? };
        let model = LLaVA::load(vb, &llava_config, Some(clip_config))?;

        Ok(Self {
            model,
            config: llava_config,
            patch_size: hf_config.vision_config.image_size as u32,
            dtype,
            device: device.clone(),
        })
    }

    fn image_token_count(&self, input_ids: &[u32]) -> usize {
        input_ids
            .iter()
            .filter(|&&id| id as i64 == self.config.image_token_index as i64)
            .count()
    }
}

impl VisionLanguageModel for LlavaNext {
    fn model_type(&self) -> &str {
        LLAVA_NEXT_MODEL_TYPE
    }

    fn dtype(&self) -> DType {
        self.dtype
    }

    fn device(&self) -> &Device {
        &self.device
    }

    fn preprocess(
        &self,
        image: &DynamicImage,
        image_processor: &ImageProcessor,
    ) -> Result<PixelValues, VlmError> {
        let tensor = match self.config.image_aspect_ratio.as_str() {
            "anyres" => {
                let patches =
                    anyres_patches(image, &self.config.image_grid_pinpoints, self.patch_size);
                stack_patches(&patches, image_processor, self.dtype, &self.device)?
            }
            "pad" => {
                let mean = image_processor.config().image_mean;
                let background = Rgb(mean.map(|c| (c * 255.0) as u8));
                image_processor.preprocess(
                    &expand_to_square(image, background),
                    self.dtype,
                    &self.device,
                )?
            }
            _ => image_processor.preprocess(image, self.dtype, &self.device)?,
        };

        Ok(PixelValues {
            tensor,
            image_size: image.dimensions(),
        })
    }

    fn generate(
        &mut self,
        processor: &Processor,
        pixel_values: &[PixelValues],
        prompt: &str,
        params: &GenerationParams,
        stream: Option<&mut dyn Write>,
    ) -> Result<GenerationOutput, VlmError> {
        if pixel_values.is_empty() {
            return Err(VlmError::ImageCount {
                expected: 1,
                got: 0,
            });
        }

        // chat templates may already open with the bos token
        let has_bos = processor
            .special_tokens()
            .bos_token
            .as_deref()
            .is_some_and(|bos| prompt.starts_with(bos));
        let input_ids = processor.encode(prompt, !has_bos)?;

        let image_tokens = self.image_token_count(&input_ids);
        if image_tokens != pixel_values.len() {
            return Err(VlmError::ImageCount {
                expected: image_tokens,
                got: pixel_values.len(),
            });
        }

        let prompt_tokens = input_ids.len();
        let ids: Vec<i64> = input_ids.iter().map(|&id| id as i64).collect();
        let ids = Tensor::from_vec(ids, (1, prompt_tokens), &self.device)?;

        let images: Vec<Tensor> = pixel_values.iter().map(|p| p.tensor.clone()).collect();
        let image_sizes: Vec<(u32, u32)> = pixel_values.iter().map(|p| p.image_size).collect();

        let start_prompt = Instant::now();
        let mut input_embeds =
            self.model
                .prepare_inputs_labels_for_multimodal(&ids, &images, &image_sizes)?;

        let mut cache = Cache::new(
            true,
            self.dtype,
            &self.config.to_llama_config(),
            &self.device,
        )?;
        let mut logits_processor = logits_processor(params);
        let eos_token = self.config.eos_token_id as u32;

        let mut text = TextStream::new(processor.tokenizer()?.clone(), stream);
        let mut tokens = input_ids;
        let mut generated_tokens = 0usize;
        let mut start_gen = None;
        let mut index_pos = 0;

        for index in 0..params.max_tokens {
            let (_, embeds_len, _) = input_embeds.dims3()?;
            let (context_size, context_index) = if index > 0 {
                (1, index_pos)
            } else {
                (embeds_len, 0)
            };
            let input = input_embeds.i((.., embeds_len.saturating_sub(context_size).., ..))?;
            let logits = self.model.forward(&input, context_index, &mut cache)?;
            if index == 0 {
                start_gen = Some(Instant::now());
            }
            index_pos += input.dim(1)?;

            let logits = logits.squeeze(0)?;
            let logits = apply_repeat_penalty(logits, params, &tokens)?;

            let next_token = logits_processor.sample(&logits)?;
            tokens.push(next_token);
            generated_tokens += 1;
            if next_token == eos_token {
                break;
            }
            text.push(next_token)?;

            let next = Tensor::new(&[next_token], &self.device)?;
            let next_embeds = self.model.llama.embed(&next)?.unsqueeze(0)?;
            input_embeds = Tensor::cat(&[input_embeds, next_embeds], 1)?;
        }

        let prompt_time = start_gen
            .map(|start| start.duration_since(start_prompt))
            .unwrap_or_default();
        let generation_time = start_gen.map(|start| start.elapsed()).unwrap_or_default();

        Ok(GenerationOutput {
            text: text.finish()?,
            prompt_tokens,
            generated_tokens,
            prompt_time,
            generation_time,
        })
    }
}

/// Split an image into the crops of the "anyres" strategy.
///
/// The first crop is the whole image squashed to `patch_size`, followed by the
/// `patch_size` tiles of the image fitted into the best pinpoint resolution.
fn anyres_patches(
    image: &DynamicImage,
    grid_pinpoints: &[(u32, u32)],
    patch_size: u32,
) -> Vec<DynamicImage> {
    let best = select_best_resolution(image.dimensions(), grid_pinpoints);
    let padded = resize_and_pad(image, best);

    let mut patches = vec![image.resize_exact(patch_size, patch_size, FilterType::CatmullRom)];
    for y in (0..best.1).step_by(patch_size as usize) {
        for x in (0..best.0).step_by(patch_size as usize) {
            patches.push(padded.crop_imm(x, y, patch_size, patch_size));
        }
    }
    patches
}

fn stack_patches(
    patches: &[DynamicImage],
    image_processor: &ImageProcessor,
    dtype: DType,
    device: &Device,
) -> Result<Tensor, VlmError> {
    let tensors = patches
        .iter()
        .map(|patch| image_processor.preprocess(patch, dtype, device))
        .collect::<Result<Vec<_>, VlmError>>()?;
    Ok(Tensor::cat(&tensors, 0)?)
}

/// Resize keeping the aspect ratio and center the result on a black `target` canvas.
fn resize_and_pad(image: &DynamicImage, target: (u32, u32)) -> DynamicImage {
    let (width, height) = image.dimensions();
    let (target_width, target_height) = target;
    let scale_w = target_width as f32 / width as f32;
    let scale_h = target_height as f32 / height as f32;

    let (new_width, new_height) = if scale_w < scale_h {
        (
            target_width,
            ((height as f32 * scale_w).ceil() as u32).min(target_height),
        )
    } else {
        (
            ((width as f32 * scale_h).ceil() as u32).min(target_width),
            target_height,
        )
    };

    let resized = image.resize_exact(new_width, new_height, FilterType::CatmullRom);
    let mut canvas = DynamicImage::new_rgb8(target_width, target_height);
    let x = (target_width - new_width).div_ceil(2);
    let y = (target_height - new_height).div_ceil(2);
    overlay(&mut canvas, &resized, x as i64, y as i64);
    canvas
}

fn expand_to_square(image: &DynamicImage, background: Rgb<u8>) -> DynamicImage {
    let (width, height) = image.dimensions();
    if width == height {
        return image.clone();
    }
    let side = width.max(height);
    let mut canvas = DynamicImage::from(RgbImage::from_pixel(side, side, background));
    overlay(
        &mut canvas,
        image,
        ((side - width) / 2) as i64,
        ((side - height) / 2) as i64,
    );
    canvas
}
