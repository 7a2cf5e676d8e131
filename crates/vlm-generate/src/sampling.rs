use std::io::Write;

use candle_core::Tensor;
use candle_examples::token_output_stream::TokenOutputStream;
use candle_transformers::generation::LogitsProcessor;
use tokenizers::Tokenizer;

use crate::error::VlmError;
use crate::model::GenerationParams;

/// Build the sampler for a generation.
///
/// A temperature below `1e-7` samples greedily, a `top_p` of 1.0 or more disables
/// nucleus filtering.
pub(crate) fn logits_processor(params: &GenerationParams) -> LogitsProcessor {
    LogitsProcessor::new(
        params.seed,
        Some(params.temp),
        (params.top_p < 1.0).then_some(params.top_p),
    )
}

/// Penalize the last `repeat_last_n` tokens, a no-op for a penalty of 1.
pub(crate) fn apply_repeat_penalty(
    logits: Tensor,
    params: &GenerationParams,
    tokens: &[u32],
) -> Result<Tensor, VlmError> {
    if params.repeat_penalty == 1. {
        return Ok(logits);
    }
    let start_at = tokens.len().saturating_sub(params.repeat_last_n);
    Ok(candle_transformers::utils::apply_repeat_penalty(
        &logits,
        params.repeat_penalty,
        &tokens[start_at..],
    )?)
}

/// Decodes sampled tokens and forwards the text to an optional writer as it comes.
pub(crate) struct TextStream<'a> {
    tokens: TokenOutputStream,
    out: Option<&'a mut dyn Write>,
    text: String,
}

impl<'a> TextStream<'a> {
    pub fn new(tokenizer: Tokenizer, out: Option<&'a mut dyn Write>) -> Self {
        Self {
            tokens: TokenOutputStream::new(tokenizer),
            out,
            text: String::new(),
        }
    }

    pub fn push(&mut self, token: u32) -> Result<(), VlmError> {
        if let Some(piece) = self.tokens.next_token(token)? {
            self.emit(piece)?;
        }
        Ok(())
    }

    /// Flush the pending bytes and return the full text.
    pub fn finish(mut self) -> Result<String, VlmError> {
        if let Some(rest) = self.tokens.decode_rest()? {
            self.emit(rest)?;
        }
        Ok(self.text)
    }

    fn emit(&mut self, piece: String) -> Result<(), VlmError> {
        if let Some(out) = self.out.as_deref_mut() {
            write!(out, "{piece}")?;
            out.flush()?;
        }
        self.text.push_str(&piece);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use candle_core::Device;

    use super::*;

    #[test]
    fn test_greedy_sampling() -> Result<(), VlmError> {
        let logits = Tensor::new(&[0.1f32, 3.0, 0.2, 0.5], &Device::Cpu)?;
        let mut sampler = logits_processor(&GenerationParams {
            temp: 0.0,
            ..Default::default()
        });
        assert_eq!(sampler.sample(&logits)?, 1);
        Ok(())
    }

    #[test]
    fn test_repeat_penalty() -> Result<(), VlmError> {
        let logits = Tensor::new(&[2.0f32, 2.0, 1.0], &Device::Cpu)?;

        let same = apply_repeat_penalty(logits.clone(), &GenerationParams::default(), &[0])?;
        assert_eq!(same.to_vec1::<f32>()?, vec![2.0, 2.0, 1.0]);

        let params = GenerationParams {
            repeat_penalty: 2.0,
            repeat_last_n: 1,
            ..Default::default()
        };
        // only the last token is inside the window
        let penalized = apply_repeat_penalty(logits, &params, &[1, 0])?;
        assert_eq!(penalized.to_vec1::<f32>()?, vec![1.0, 2.0, 1.0]);
        Ok(())
    }
}
