use serde::Serialize;

use crate::error::VlmError;

#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,      // prompt
    Assistant, // the model's response
    System,
}

/// One entry of a structured message content.
#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "type")]
#[serde(rename_all = "lowercase")]
pub enum Line {
    Text { text: String },
    Image,
}

/// Message content is either a list of typed entries or a plain string, depending on
/// what the chat template of the model family expects.
#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
#[serde(untagged)]
pub enum Content {
    Text(String),
    Lines(Vec<Line>),
}

/// A single chat turn.
#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub role: Role,
    pub content: Content,
}

/// How a model family expects the image marker and the prompt to be laid out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageFormat {
    /// `[{"type": "image"}, {"type": "text", "text": prompt}]`
    Structured,
    /// `"<image>\n{prompt}"`
    ImageTokenNewline,
    /// `"<|image_1|>\n{prompt}"`
    NumberedImageToken,
    /// `"<image>{prompt}"`
    ImageTokenInline,
    /// the prompt as is
    Plain,
}

impl MessageFormat {
    /// Look up the format for a `model_type` as declared in `config.json`.
    pub fn from_model_type(model_type: &str) -> Result<Self, VlmError> {
        let format = match model_type.to_lowercase().as_str() {
            "idefics2" | "idefics3" | "qwen2_vl" | "llava" | "llava_next" | "mllama"
            | "pixtral" => Self::Structured,
            "llava-qwen2" | "bunny-llama" => Self::ImageTokenNewline,
            "phi3_v" => Self::NumberedImageToken,
            "multi_modality" => Self::ImageTokenInline,
            "paligemma" => Self::Plain,
            _ => return Err(VlmError::UnsupportedModelType(model_type.to_string())),
        };
        Ok(format)
    }

    fn content(self, prompt: &str, with_image: bool) -> Content {
        if !with_image {
            return match self {
                Self::Structured => Content::Lines(vec![Line::Text {
                    text: prompt.to_string(),
                }]),
                _ => Content::Text(prompt.to_string()),
            };
        }

        match self {
            Self::Structured => Content::Lines(vec![
                Line::Image,
                Line::Text {
                    text: prompt.to_string(),
                },
            ]),
            Self::ImageTokenNewline => Content::Text(format!("<image>\n{prompt}")),
            Self::NumberedImageToken => Content::Text(format!("<|image_1|>\n{prompt}")),
            Self::ImageTokenInline => Content::Text(format!("<image>{prompt}")),
            Self::Plain => Content::Text(prompt.to_string()),
        }
    }
}

/// Build the user message for `prompt` in the layout expected by `model_type`.
///
/// # Arguments
///
/// * `model_type` - The `model_type` field of the model config.
/// * `prompt` - The already decoded user prompt.
///
/// # Returns
///
/// A user [`Message`] with an image marker in front of the prompt.
pub fn get_message_json(model_type: &str, prompt: &str) -> Result<Message, VlmError> {
    message_for(model_type, prompt, Role::User, false)
}

/// Build a message for any role.
///
/// The image marker is only added to user messages and can be skipped, e.g. for
/// follow-up turns that refer to an image already in the conversation.
pub fn message_for(
    model_type: &str,
    prompt: &str,
    role: Role,
    skip_image_token: bool,
) -> Result<Message, VlmError> {
    let format = MessageFormat::from_model_type(model_type)?;
    let with_image = role == Role::User && !skip_image_token;
    Ok(Message {
        role,
        content: format.content(prompt, with_image),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_structured_message_json() -> Result<(), VlmError> {
        let message = get_message_json("qwen2_vl", "What are these?")?;
        let value = serde_json::to_value(&message)?;
        assert_eq!(
            value,
            serde_json::json!({
                "role": "user",
                "content": [
                    {"type": "image"},
                    {"type": "text", "text": "What are these?"},
                ]
            })
        );
        Ok(())
    }

    #[test]
    fn test_inline_image_tokens() -> Result<(), VlmError> {
        let cases = [
            ("llava-qwen2", "<image>\nhi"),
            ("bunny-llama", "<image>\nhi"),
            ("phi3_v", "<|image_1|>\nhi"),
            ("multi_modality", "<image>hi"),
            ("paligemma", "hi"),
        ];
        for (model_type, expected) in cases {
            let message = get_message_json(model_type, "hi")?;
            assert_eq!(message.role, Role::User);
            assert_eq!(message.content, Content::Text(expected.to_string()));
        }
        Ok(())
    }

    #[test]
    fn test_model_type_case_insensitive() -> Result<(), VlmError> {
        assert_eq!(
            MessageFormat::from_model_type("LLaVA")?,
            MessageFormat::Structured
        );
        Ok(())
    }

    #[test]
    fn test_unsupported_model_type() {
        assert!(matches!(
            get_message_json("gpt2", "hi"),
            Err(VlmError::UnsupportedModelType(t)) if t == "gpt2"
        ));
    }

    #[test]
    fn test_skip_image_token() -> Result<(), VlmError> {
        let message = message_for("llava", "again", Role::User, true)?;
        assert_eq!(
            message.content,
            Content::Lines(vec![Line::Text {
                text: "again".to_string()
            }])
        );

        let message = message_for("phi3_v", "sure", Role::Assistant, false)?;
        assert_eq!(message.content, Content::Text("sure".to_string()));
        Ok(())
    }
}
