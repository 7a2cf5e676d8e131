use log::debug;

use crate::error::VlmError;
use crate::escape::decode_unicode_escape;
use crate::message::get_message_json;
use crate::processor::{Processor, ProcessorKind};

/// Model type whose tokenizer-only processors take the prompt without a template.
pub const PALIGEMMA_MODEL_TYPE: &str = "paligemma";

/// Decode the raw prompt and format it for the model.
///
/// # Arguments
///
/// * `processor` - The loaded processor; its [`ProcessorKind`] selects the strategy.
/// * `model_type` - The model type declared by the loaded model.
/// * `config_model_type` - The `model_type` of `config.json`, used to build the message.
/// * `raw_prompt` - The prompt as typed by the user, escape sequences included.
///
/// # Returns
///
/// The prompt string to hand to the generator.
pub fn apply_prompt_template(
    processor: &Processor,
    model_type: &str,
    config_model_type: &str,
    raw_prompt: &str,
) -> Result<String, VlmError> {
    let prompt = decode_unicode_escape(raw_prompt)?;
    format_prompt(processor, model_type, config_model_type, prompt)
}

/// Format an already decoded prompt.
///
/// - chat template capable: render `[get_message_json(config_model_type, prompt)]`
///   through the processor template with the generation prompt appended.
/// - tokenizer capable: same through the tokenizer template, except for `paligemma`
///   models which get the prompt unchanged.
/// - unsupported: [`VlmError::UnsupportedProcessorKind`].
pub fn format_prompt(
    processor: &Processor,
    model_type: &str,
    config_model_type: &str,
    prompt: String,
) -> Result<String, VlmError> {
    let formatted = match processor.kind() {
        ProcessorKind::ChatTemplateCapable(template) => {
            let messages = [get_message_json(config_model_type, &prompt)?];
            template.apply(&messages, true)?
        }
        ProcessorKind::TokenizerCapable { .. } if model_type == PALIGEMMA_MODEL_TYPE => prompt,
        ProcessorKind::TokenizerCapable { chat_template } => {
            let template = chat_template.as_ref().ok_or_else(|| {
                VlmError::MissingChatTemplate(format!(
                    "tokenizer of a {model_type} model has no chat template"
                ))
            })?;
            let messages = [get_message_json(config_model_type, &prompt)?];
            template.apply(&messages, true)?
        }
        ProcessorKind::Unsupported => return Err(VlmError::UnsupportedProcessorKind),
    };

    debug!("Formatted prompt: {formatted:?}");
    Ok(formatted)
}
