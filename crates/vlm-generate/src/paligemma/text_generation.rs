use std::io::Write;
use std::time::Instant;

use candle_core::{DType, Device, Tensor};
use candle_transformers::models::paligemma::Model;
use tokenizers::Tokenizer;

use crate::error::VlmError;
use crate::model::{GenerationOutput, GenerationParams};
use crate::sampling::{apply_repeat_penalty, logits_processor, TextStream};

pub struct TextGeneration {
    model: Model,
    device: Device,
}

impl TextGeneration {
    pub fn new(model: Model, device: Device) -> Self {
        Self { model, device }
    }

    #[inline]
    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn run(
        &mut self,
        tokenizer: Tokenizer,
        eos_token: &str,
        image: &Tensor,
        prompt: &str,
        params: &GenerationParams,
        stream: Option<&mut dyn Write>,
    ) -> Result<GenerationOutput, VlmError> {
        let mut logits_processor = logits_processor(params);

        let mut tokens = tokenizer.encode(prompt, true)?.get_ids().to_vec();
        let prompt_tokens = tokens.len();

        let eos_token = tokenizer
            .token_to_id(eos_token)
            .ok_or_else(|| VlmError::EosTokenNotFound(eos_token.to_string()))?;

        let mut text = TextStream::new(tokenizer, stream);
        let mut generated_tokens = 0usize;
        let start_prompt = Instant::now();
        let mut start_gen = None;

        for index in 0..params.max_tokens {
            let context_size = if index > 0 { 1 } else { tokens.len() };
            let start_pos = tokens.len().saturating_sub(context_size);
            let ctxt = &tokens[start_pos..];
            let input = Tensor::new(ctxt, &self.device)?.unsqueeze(0)?;
            let logits = if index > 0 {
                self.model.forward(&input)?
            } else {
                self.model.setup(image, &input)?
            };
            if index == 0 {
                start_gen = Some(Instant::now());
            }

            let logits = logits.squeeze(0)?.squeeze(0)?.to_dtype(DType::F32)?;
            let logits = apply_repeat_penalty(logits, params, &tokens)?;

            let next_token = logits_processor.sample(&logits)?;
            tokens.push(next_token);
            generated_tokens += 1;
            if next_token == eos_token {
                break;
            }
            text.push(next_token)?;
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
