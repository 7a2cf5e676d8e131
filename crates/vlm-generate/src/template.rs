/*
    Chat templates are Jinja2 programs shipped with the model files. They turn a list of
    structured messages into the exact text the model was trained on.
*/

use minijinja::{context, AutoEscape, Environment, Error, ErrorKind, State};
use serde_json::Value;

use crate::error::VlmError;
use crate::message::Message;

const TEMPLATE_NAME: &str = "chat";

// assistant mask markers, they render their body unchanged
const GENERATION_TAGS: [&str; 6] = [
    "{% generation %}",
    "{%- generation %}",
    "{%- generation -%}",
    "{% endgeneration %}",
    "{%- endgeneration %}",
    "{%- endgeneration -%}",
];

/// Special tokens exposed to the template as `bos_token` and `eos_token`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SpecialTokens {
    pub bos_token: Option<String>,
    pub eos_token: Option<String>,
}

impl SpecialTokens {
    /// Read the special tokens of a `tokenizer_config.json`.
    ///
    /// Tokens may be stored as plain strings or as `{"content": ...}` objects.
    pub fn from_config(config: &Value) -> Self {
        Self {
            bos_token: token_content(&config["bos_token"]),
            eos_token: token_content(&config["eos_token"]),
        }
    }
}

fn token_content(value: &Value) -> Option<String> {
    match value {
        Value::String(token) => Some(token.clone()),
        Value::Object(map) => map.get("content").and_then(Value::as_str).map(String::from),
        _ => None,
    }
}

/// A compiled chat template.
pub struct ChatTemplate {
    env: Environment<'static>,
    special_tokens: SpecialTokens,
}

impl std::fmt::Debug for ChatTemplate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChatTemplate")
            .field("special_tokens", &self.special_tokens)
            .finish_non_exhaustive()
    }
}

impl ChatTemplate {
    /// Compile a template from its Jinja source.
    pub fn new(source: impl Into<String>) -> Result<Self, VlmError> {
        let mut env = Environment::new();

        // disable auto-escaping (we're producing a plain text prompt, not HTML)
        env.set_auto_escape_callback(|_| AutoEscape::None);
        env.add_function("raise_exception", |msg: String| -> Result<String, _> {
            Err(minijinja::Error::new(ErrorKind::InvalidOperation, msg))
        });
        env.set_unknown_method_callback(string_method);

        let source = GENERATION_TAGS
            .iter()
            .fold(source.into(), |source, tag| source.replace(tag, ""));
        env.add_template_owned(TEMPLATE_NAME, source)?;

        Ok(Self {
            env,
            special_tokens: SpecialTokens::default(),
        })
    }

    pub fn with_special_tokens(mut self, special_tokens: SpecialTokens) -> Self {
        self.special_tokens = special_tokens;
        self
    }

    /// Extract the template stored under `chat_template` in a processor or tokenizer
    /// config.
    ///
    /// The field is either the template source or a list of named templates, in which
    /// case the one named `default` is used. Returns `None` when the config carries no
    /// template.
    pub fn from_config(config: &Value) -> Result<Option<Self>, VlmError> {
        let source = match &config["chat_template"] {
            Value::String(source) => Some(source.clone()),
            Value::Array(named) => named
                .iter()
                .find(|entry| entry["name"].as_str() == Some("default"))
                .and_then(|entry| entry["template"].as_str())
                .map(String::from),
            _ => None,
        };

        source
            .map(|source| {
                Ok(Self::new(source)?.with_special_tokens(SpecialTokens::from_config(config)))
            })
            .transpose()
    }

    #[cfg(test)]
    pub(crate) fn special_tokens(&self) -> &SpecialTokens {
        &self.special_tokens
    }

    /// Render `messages` into a prompt string.
    ///
    /// The output is text, never token ids; tokenization happens later inside the
    /// generation loop. With `add_generation_prompt` the template appends the prefix
    /// that opens the assistant turn.
    pub fn apply(
        &self,
        messages: &[Message],
        add_generation_prompt: bool,
    ) -> Result<String, VlmError> {
        let template = self.env.get_template(TEMPLATE_NAME)?;
        let rendered = template.render(context! {
            messages => messages,
            add_generation_prompt => add_generation_prompt,
            bos_token => &self.special_tokens.bos_token,
            eos_token => &self.special_tokens.eos_token,
        })?;
        Ok(rendered)
    }
}

/// The Python `str` methods chat templates call, e.g. `message['role'].upper()`.
fn string_method(
    _state: &State,
    value: &minijinja::Value,
    method: &str,
    args: &[minijinja::Value],
) -> Result<minijinja::Value, Error> {
    let unknown = || {
        Error::new(
            ErrorKind::UnknownMethod,
            format!("{} has no method named {method}", value.kind()),
        )
    };
    let text = value.as_str().ok_or_else(unknown)?;
    let arg = |index: usize| args.get(index).and_then(|arg| arg.as_str());

    let result: minijinja::Value = match (method, args.len()) {
        ("upper", 0) => text.to_uppercase().into(),
        ("lower", 0) => text.to_lowercase().into(),
        ("strip", 0) => text.trim().into(),
        ("lstrip", 0) => text.trim_start().into(),
        ("rstrip", 0) => text.trim_end().into(),
        ("startswith", 1) => arg(0).is_some_and(|prefix| text.starts_with(prefix)).into(),
        ("endswith", 1) => arg(0).is_some_and(|suffix| text.ends_with(suffix)).into(),
        ("replace", 2) => match (arg(0), arg(1)) {
            (Some(from), Some(to)) => text.replace(from, to).into(),
            _ => return Err(unknown()),
        },
        ("split", 0) => text
            .split_whitespace()
            .map(minijinja::Value::from)
            .collect::<Vec<_>>()
            .into(),
        ("split", 1) => match arg(0) {
            Some(separator) => text
                .split(separator)
                .map(minijinja::Value::from)
                .collect::<Vec<_>>()
                .into(),
            None => return Err(unknown()),
        },
        _ => return Err(unknown()),
    };
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{get_message_json, Content, Role};

    const CHATML: &str = "{% for message in messages %}<|im_start|>{{ message['role'] }}\n{{ message['content'] }}<|im_end|>\n{% endfor %}{% if add_generation_prompt %}<|im_start|>assistant\n{% endif %}";

    // https://huggingface.co/llava-hf/llava-1.5-7b-hf/blob/main/chat_template.json (simplified)
    const LLAVA: &str = "{% for message in messages %}{{ message['role'] | upper }}: {% for item in message['content'] %}{% if item['type'] == 'image' %}<image>\n{% elif item['type'] == 'text' %}{{ item['text'] }}{% endif %}{% endfor %}\n{% endfor %}{% if add_generation_prompt %}ASSISTANT:{% endif %}";

    #[test]
    fn test_apply_with_generation_prompt() -> Result<(), VlmError> {
        let template = ChatTemplate::new(CHATML)?;
        let messages = [get_message_json("llava-qwen2", "What are these?")?];

        let rendered = template.apply(&messages, true)?;
        assert_eq!(
            rendered,
            "<|im_start|>user\n<image>\nWhat are these?<|im_end|>\n<|im_start|>assistant\n"
        );

        let rendered = template.apply(&messages, false)?;
        assert!(!rendered.ends_with("<|im_start|>assistant\n"));
        Ok(())
    }

    #[test]
    fn test_apply_structured_content() -> Result<(), VlmError> {
        let template = ChatTemplate::new(LLAVA)?;
        let messages = [get_message_json("llava", "Describe.")?];
        assert_eq!(
            template.apply(&messages, true)?,
            "USER: <image>\nDescribe.\nASSISTANT:"
        );
        Ok(())
    }

    #[test]
    fn test_special_tokens_in_context() -> Result<(), VlmError> {
        let source = "{{ bos_token }}{{ messages[0]['content'] }}{{ eos_token }}";
        let template = ChatTemplate::new(source)?.with_special_tokens(SpecialTokens {
            bos_token: Some("<s>".to_string()),
            eos_token: Some("</s>".to_string()),
        });
        let messages = [Message {
            role: Role::User,
            content: Content::Text("hi".to_string()),
        }];
        assert_eq!(template.apply(&messages, false)?, "<s>hi</s>");
        Ok(())
    }

    #[test]
    fn test_raise_exception() -> Result<(), VlmError> {
        let template = ChatTemplate::new(
            "{% if messages[0]['role'] != 'system' %}{{ raise_exception('system first') }}{% endif %}",
        )?;
        let messages = [Message {
            role: Role::User,
            content: Content::Text("hi".to_string()),
        }];
        let err = template.apply(&messages, true).unwrap_err();
        assert!(matches!(err, VlmError::JinjaError(_)));
        assert!(err.to_string().contains("system first"));
        Ok(())
    }

    #[test]
    fn test_from_config() -> Result<(), VlmError> {
        let config = serde_json::json!({
            "chat_template": CHATML,
            "bos_token": {"content": "<s>", "lstrip": false},
            "eos_token": "</s>",
        });
        let template = ChatTemplate::from_config(&config)?.expect("template present");
        assert_eq!(
            template.special_tokens(),
            &SpecialTokens {
                bos_token: Some("<s>".to_string()),
                eos_token: Some("</s>".to_string()),
            }
        );

        let named = serde_json::json!({
            "chat_template": [
                {"name": "tool_use", "template": "tools"},
                {"name": "default", "template": "default"},
            ]
        });
        let template = ChatTemplate::from_config(&named)?.expect("default template present");
        assert_eq!(template.apply(&[], false)?, "default");

        assert!(ChatTemplate::from_config(&serde_json::json!({}))?.is_none());
        Ok(())
    }

    #[test]
    fn test_string_methods() -> Result<(), VlmError> {
        let template = ChatTemplate::new(
            "{% for message in messages %}{{ message['role'].upper() + ': ' }}{{ message['content'].strip().replace('cats', 'dogs') }}{% if message['content'].startswith(' ') %}!{% endif %}{% endfor %}",
        )?;
        let messages = [Message {
            role: Role::User,
            content: Content::Text(" two cats ".to_string()),
        }];
        assert_eq!(template.apply(&messages, false)?, "USER: two dogs!");

        let template = ChatTemplate::new("{{ messages[0]['content'].capitalize() }}")?;
        assert!(template.apply(&messages, false).is_err());
        Ok(())
    }

    #[test]
    fn test_generation_tags_are_ignored() -> Result<(), VlmError> {
        let template = ChatTemplate::new(
            "{% for message in messages %}{% generation %}{{ message['content'] }}{% endgeneration %}{% endfor %}",
        )?;
        let messages = [Message {
            role: Role::Assistant,
            content: Content::Text("hi".to_string()),
        }];
        assert_eq!(template.apply(&messages, false)?, "hi");
        Ok(())
    }

    #[test]
    fn test_invalid_template_source() {
        assert!(matches!(
            ChatTemplate::new("{% for %}"),
            Err(VlmError::JinjaError(_))
        ));
    }
}
