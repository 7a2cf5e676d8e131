use std::path::Path;

use log::debug;
use tokenizers::Tokenizer;

use crate::error::VlmError;
use crate::hub::read_optional_json;
use crate::template::{ChatTemplate, SpecialTokens};

/// How a processor can turn messages into a prompt, decided once at load time.
#[derive(Debug)]
pub enum ProcessorKind {
    /// The processor ships its own chat template (`chat_template.json` or
    /// `processor_config.json`).
    ChatTemplateCapable(ChatTemplate),
    /// Only a tokenizer is available; its template comes from `tokenizer_config.json`
    /// and may be missing.
    TokenizerCapable { chat_template: Option<ChatTemplate> },
    /// Neither a chat template nor a tokenizer was found.
    Unsupported,
}

impl ProcessorKind {
    pub fn name(&self) -> &'static str {
        match self {
            Self::ChatTemplateCapable(_) => "chat_template",
            Self::TokenizerCapable { .. } => "tokenizer",
            Self::Unsupported => "unsupported",
        }
    }
}

/// Text side of a model: tokenizer, special tokens and the prompt capability.
pub struct Processor {
    kind: ProcessorKind,
    tokenizer: Option<Tokenizer>,
    special_tokens: SpecialTokens,
}

impl Processor {
    pub fn new(kind: ProcessorKind, tokenizer: Option<Tokenizer>) -> Self {
        Self {
            kind,
            tokenizer,
            special_tokens: SpecialTokens::default(),
        }
    }

    pub fn with_special_tokens(mut self, special_tokens: SpecialTokens) -> Self {
        self.special_tokens = special_tokens;
        self
    }

    #[inline]
    pub fn kind(&self) -> &ProcessorKind {
        &self.kind
    }

    pub fn tokenizer(&self) -> Result<&Tokenizer, VlmError> {
        self.tokenizer.as_ref().ok_or(VlmError::MissingTokenizer)
    }

    pub fn special_tokens(&self) -> &SpecialTokens {
        &self.special_tokens
    }

    pub fn encode(&self, text: &str, add_special_tokens: bool) -> Result<Vec<u32>, VlmError> {
        let encoding = self.tokenizer()?.encode(text, add_special_tokens)?;
        Ok(encoding.get_ids().to_vec())
    }
}

impl std::fmt::Debug for Processor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Processor")
            .field("kind", &self.kind)
            .field("has_tokenizer", &self.tokenizer.is_some())
            .field("special_tokens", &self.special_tokens)
            .finish()
    }
}

/// Load the processor files of a model directory.
///
/// A processor-level template (`chat_template.json`, then `processor_config.json`)
/// makes the processor [`ProcessorKind::ChatTemplateCapable`]. Without one, a
/// `tokenizer.json` makes it [`ProcessorKind::TokenizerCapable`], carrying the template
/// of `tokenizer_config.json` if any. Otherwise the processor is
/// [`ProcessorKind::Unsupported`].
pub fn load_processor(model_path: &Path) -> Result<Processor, VlmError> {
    let tokenizer_path = model_path.join("tokenizer.json");
    let tokenizer = if tokenizer_path.is_file() {
        Some(Tokenizer::from_file(&tokenizer_path)?)
    } else {
        None
    };

    let tokenizer_config = read_optional_json(&model_path.join("tokenizer_config.json"))?;
    let special_tokens = tokenizer_config
        .as_ref()
        .map(SpecialTokens::from_config)
        .unwrap_or_default();

    let mut processor_template = None;
    for file in ["chat_template.json", "processor_config.json"] {
        if let Some(config) = read_optional_json(&model_path.join(file))? {
            if let Some(template) = ChatTemplate::from_config(&config)? {
                debug!("Using chat template from {file}");
                processor_template = Some(template.with_special_tokens(special_tokens.clone()));
                break;
            }
        }
    }

    let kind = match (processor_template, &tokenizer) {
        (Some(template), _) => ProcessorKind::ChatTemplateCapable(template),
        (None, Some(_)) => ProcessorKind::TokenizerCapable {
            chat_template: tokenizer_config
                .as_ref()
                .map(ChatTemplate::from_config)
                .transpose()?
                .flatten(),
        },
        (None, None) => ProcessorKind::Unsupported,
    };
    debug!("Loaded processor with {} capability", kind.name());

    Ok(Processor::new(kind, tokenizer).with_special_tokens(special_tokens))
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;

    // smallest tokenizer the `tokenizers` crate can deserialize
    const TOKENIZER_JSON: &str = r#"{
        "version": "1.0",
        "truncation": null,
        "padding": null,
        "added_tokens": [],
        "normalizer": null,
        "pre_tokenizer": {"type": "Whitespace"},
        "post_processor": null,
        "decoder": null,
        "model": {"type": "WordLevel", "vocab": {"<unk>": 0, "what": 1, "are": 2, "these": 3}, "unk_token": "<unk>"}
    }"#;

    const TEMPLATE: &str = "{% for m in messages %}{{ m['content'] }}{% endfor %}";

    #[test]
    fn test_chat_template_json_wins() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        fs::write(dir.path().join("tokenizer.json"), TOKENIZER_JSON)?;
        fs::write(
            dir.path().join("chat_template.json"),
            serde_json::json!({ "chat_template": TEMPLATE }).to_string(),
        )?;
        fs::write(
            dir.path().join("tokenizer_config.json"),
            serde_json::json!({ "chat_template": "tokenizer", "eos_token": "</s>" }).to_string(),
        )?;

        let processor = load_processor(dir.path())?;
        assert!(matches!(
            processor.kind(),
            ProcessorKind::ChatTemplateCapable(_)
        ));
        assert_eq!(processor.special_tokens().eos_token.as_deref(), Some("</s>"));
        assert_eq!(processor.encode("what are these", false)?, vec![1, 2, 3]);
        Ok(())
    }

    #[test]
    fn test_processor_config_template() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        fs::write(
            dir.path().join("processor_config.json"),
            serde_json::json!({ "chat_template": TEMPLATE, "patch_size": 14 }).to_string(),
        )?;

        let processor = load_processor(dir.path())?;
        assert_eq!(processor.kind().name(), "chat_template");
        assert!(matches!(
            processor.tokenizer(),
            Err(VlmError::MissingTokenizer)
        ));
        Ok(())
    }

    #[test]
    fn test_tokenizer_only() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        fs::write(dir.path().join("tokenizer.json"), TOKENIZER_JSON)?;
        fs::write(
            dir.path().join("processor_config.json"),
            r#"{"image_seq_length": 256}"#,
        )?;

        let processor = load_processor(dir.path())?;
        assert!(matches!(
            processor.kind(),
            ProcessorKind::TokenizerCapable {
                chat_template: None
            }
        ));

        fs::write(
            dir.path().join("tokenizer_config.json"),
            serde_json::json!({ "chat_template": TEMPLATE }).to_string(),
        )?;
        let processor = load_processor(dir.path())?;
        assert!(matches!(
            processor.kind(),
            ProcessorKind::TokenizerCapable {
                chat_template: Some(_)
            }
        ));
        Ok(())
    }

    #[test]
    fn test_unsupported() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        fs::write(
            dir.path().join("tokenizer_config.json"),
            r#"{"eos_token": "<eos>"}"#,
        )?;

        let processor = load_processor(dir.path())?;
        assert!(matches!(processor.kind(), ProcessorKind::Unsupported));
        Ok(())
    }
}
