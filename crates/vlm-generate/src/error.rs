/// Errors raised while loading, templating or generating.
#[derive(thiserror::Error, Debug)]
pub enum VlmError {
    #[error(transparent)]
    FailedToLoadModel(#[from] hf_hub::api::sync::ApiError),

    #[error(transparent)]
    CandleError(#[from] candle_core::Error),

    #[error(transparent)]
    TokenizerError(#[from] tokenizers::Error),

    #[error(transparent)]
    IoError(#[from] std::io::Error),

    #[error(transparent)]
    JinjaError(#[from] minijinja::Error),

    #[error(transparent)]
    SerializationError(#[from] serde_json::Error),

    #[error(transparent)]
    ImageError(#[from] image::ImageError),

    #[error(transparent)]
    ImageFetchError(#[from] reqwest::Error),

    #[error("Error: processor does not have 'chat_template' or 'tokenizer' attribute.")]
    UnsupportedProcessorKind,

    #[error("Missing chat template: {0}")]
    MissingChatTemplate(String),

    #[error("Unsupported model: {0}")]
    UnsupportedModelType(String),

    #[error("Missing field `{field}` in {file}")]
    MissingConfigField { field: String, file: String },

    #[error("Unsupported model config: {0}")]
    UnsupportedModelConfig(String),

    #[error("No image processor found for this model")]
    MissingImageProcessor,

    #[error("Missing tokenizer")]
    MissingTokenizer,

    #[error("Cannot find the {0} token")]
    EosTokenNotFound(String),

    #[error("Expected {expected} image(s), got {got}")]
    ImageCount { expected: usize, got: usize },

    #[error("No model files found in repository {0}")]
    EmptyRepository(String),

    #[error("{0} requires custom code; load it with trust_remote_code")]
    RemoteCodeNotTrusted(String),

    #[error("No safetensors weights found in {0}")]
    MissingWeights(String),

    #[error("Invalid escape sequence at byte {position}: {reason}")]
    InvalidEscape { position: usize, reason: String },
}
