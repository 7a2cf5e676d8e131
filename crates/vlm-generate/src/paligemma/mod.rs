mod text_generation;

use std::io::Write;
use std::path::Path;

use candle_core::{DType, Device};
use candle_nn::VarBuilder;
use candle_transformers::models::paligemma::{Config, Model};
use log::debug;
use serde_json::Value;
use text_generation::TextGeneration;

use crate::error::VlmError;
use crate::hub::{weight_files, ModelConfig};
use crate::image_processor::PixelValues;
use crate::model::{GenerationOutput, GenerationParams, VisionLanguageModel};
use crate::processor::Processor;
use crate::prompt::PALIGEMMA_MODEL_TYPE;

const DEFAULT_EOS_TOKEN: &str = "<eos>";

/// The Paligemma model
///
/// This struct contains the Google Paligemma model for text generation from an image
/// and a given text prompt.
pub struct Paligemma {
    pipeline: TextGeneration,
    dtype: DType,
}

impl Paligemma {
    /// Load a Paligemma checkpoint from a model directory.
    ///
    /// # Arguments
    ///
    /// * `model_path` - Directory holding the safetensors weights.
    /// * `config` - The model config, used to check the vision resolution.
    /// * `dtype` - The dtype of the weights once loaded.
    /// * `device` - The device to load the weights on.
    pub fn load(
        model_path: &Path,
        config: &ModelConfig,
        dtype: DType,
        device: &Device,
    ) -> Result<Self, VlmError> {
        let model_config = model_config(config)?;
        let filenames = weight_files(model_path)?;
        debug!("Loading Paligemma weights from {filenames:?}");

        let vb = unsafe { VarBuilder::from_mmaped_safetensors(&filenames, dtype, device)? };
        let model = Model::new(&model_config, vb)?;

        Ok(Self {
            pipeline: TextGeneration::new(model, device.clone()),
            dtype,
        })
    }
}

/// Pick the candle config matching `config.json`.
///
/// Only the 3B checkpoints are known to candle: the vision resolution selects the 224
/// or 448 variant and any `text_config` entry that is present must agree with it.
fn model_config(config: &ModelConfig) -> Result<Config, VlmError> {
    let image_size = config
        .get("vision_config")
        .and_then(|vision| vision.get("image_size"))
        .and_then(Value::as_u64)
        .unwrap_or(224);

    let model_config = match image_size {
        224 => Config::paligemma_3b_224(),
        448 => Config::paligemma_3b_448(),
        other => {
            return Err(VlmError::UnsupportedModelConfig(format!(
                "paligemma with {other}x{other} images"
            )))
        }
    };

    if let Some(text_config) = config.get("text_config") {
        let text = &model_config.text_config;
        let expected = [
            ("hidden_size", text.hidden_size),
            ("intermediate_size", text.intermediate_size),
            ("num_hidden_layers", text.num_hidden_layers),
            ("num_key_value_heads", text.num_key_value_heads),
            ("vocab_size", text.vocab_size),
        ];
        for (field, value) in expected {
            match text_config.get(field).and_then(Value::as_u64) {
                Some(found) if found != value as u64 => {
                    return Err(VlmError::UnsupportedModelConfig(format!(
                        "paligemma with text_config.{field} = {found}, expected {value}"
                    )))
                }
                _ => {}
            }
        }
    }

    Ok(model_config)
}

impl VisionLanguageModel for Paligemma {
    fn model_type(&self) -> &str {
        PALIGEMMA_MODEL_TYPE
    }

    fn dtype(&self) -> DType {
        self.dtype
    }

    fn device(&self) -> &Device {
        self.pipeline.device()
    }

    fn generate(
        &mut self,
        processor: &Processor,
        pixel_values: &[PixelValues],
        prompt: &str,
        params: &GenerationParams,
        stream: Option<&mut dyn Write>,
    ) -> Result<GenerationOutput, VlmError> {
        let [image] = pixel_values else {
            return Err(VlmError::ImageCount {
                expected: 1,
                got: pixel_values.len(),
            });
        };

        let eos_token = processor
            .special_tokens()
            .eos_token
            .as_deref()
            .unwrap_or(DEFAULT_EOS_TOKEN);

        // the prefix is terminated by a newline before the model answers
        let prompt = if prompt.ends_with('\n') {
            prompt.to_string()
        } else {
            format!("{prompt}\n")
        };

        self.pipeline.run(
            processor.tokenizer()?.clone(),
            eos_token,
            &image.tensor,
            &prompt,
            params,
            stream,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image_processor::{ImageProcessor, ImageSource};
    use crate::processor::load_processor;

    #[test]
    fn test_model_config_image_size() -> Result<(), VlmError> {
        let config = ModelConfig::from_value(serde_json::json!({
            "model_type": "paligemma",
            "vision_config": {"image_size": 224}
        }))?;
        assert_eq!(model_config(&config)?.vision_config.image_size, 224);

        let config = ModelConfig::from_value(serde_json::json!({
            "model_type": "paligemma",
            "vision_config": {"image_size": 448}
        }))?;
        assert_eq!(model_config(&config)?.vision_config.image_size, 448);

        let config = ModelConfig::from_value(serde_json::json!({
            "model_type": "paligemma",
            "vision_config": {"image_size": 896}
        }))?;
        assert!(matches!(
            model_config(&config),
            Err(VlmError::UnsupportedModelConfig(_))
        ));
        Ok(())
    }

    #[test]
    fn test_model_config_text_size() -> Result<(), VlmError> {
        // https://huggingface.co/google/paligemma-3b-mix-224/blob/main/config.json
        let config = ModelConfig::from_value(serde_json::json!({
            "model_type": "paligemma",
            "text_config": {
                "hidden_size": 2048,
                "intermediate_size": 16384,
                "model_type": "gemma",
                "num_attention_heads": 8,
                "num_hidden_layers": 18,
                "num_image_tokens": 256,
                "num_key_value_heads": 1,
                "vocab_size": 257216
            },
            "vision_config": {"image_size": 224}
        }))?;
        assert!(model_config(&config).is_ok());

        // paligemma2-3b-pt-224
        let config = ModelConfig::from_value(serde_json::json!({
            "model_type": "paligemma",
            "text_config": {
                "hidden_size": 2304,
                "intermediate_size": 9216,
                "model_type": "gemma2",
                "num_hidden_layers": 26,
                "num_key_value_heads": 4
            },
            "vision_config": {"image_size": 224}
        }))?;
        assert!(matches!(
            model_config(&config),
            Err(VlmError::UnsupportedModelConfig(msg)) if msg.contains("hidden_size")
        ));
        Ok(())
    }

    // cargo test -p vlm-generate test_paligemma_inference -- --nocapture --ignored
    #[test]
    #[ignore = "Downloads the paligemma weights"]
    fn test_paligemma_inference() -> Result<(), Box<dyn std::error::Error>> {
        let model_path = crate::hub::get_model_path("google/paligemma-3b-mix-224")?;
        let config = crate::hub::load_config(&model_path)?;
        let processor = load_processor(&model_path)?;
        let mut model = Paligemma::load(&model_path, &config, DType::F32, &Device::Cpu)?;

        let image = ImageSource::parse("http://images.cocodataset.org/val2017/000000039769.jpg")
            .load()?;
        let pixels = model.preprocess(&image, &ImageProcessor::default())?;

        let output = model.generate(
            &processor,
            &[pixels],
            "caption en",
            &GenerationParams {
                max_tokens: 20,
                ..Default::default()
            },
            None,
        )?;
        assert!(!output.text.is_empty());
        Ok(())
    }
}
