use std::io::Write;

use log::info;

use crate::error::VlmError;
use crate::image_processor::{ImageProcessor, ImageSource};
use crate::model::{GenerationParams, VisionLanguageModel};
use crate::processor::Processor;

const SEPARATOR: &str = "==========";

/// Everything needed to generate text for one prompt.
pub struct GenerationRequest<'a, M: ?Sized> {
    pub model: &'a mut M,
    pub processor: &'a Processor,
    pub images: &'a [ImageSource],
    pub prompt: &'a str,
    pub image_processor: Option<&'a ImageProcessor>,
    pub params: GenerationParams,
}

/// Fetch the images, preprocess them and run the model.
///
/// In verbose mode the prompt, the streamed tokens and the throughput are printed to
/// stdout.
///
/// # Returns
///
/// The generated text.
pub fn generate<M: VisionLanguageModel + ?Sized>(
    request: GenerationRequest<'_, M>,
) -> Result<String, VlmError> {
    let mut stdout = std::io::stdout();
    generate_with_writer(request, &mut stdout)
}

/// Same as [`generate`] with the verbose output sent to `out`.
pub fn generate_with_writer<M: VisionLanguageModel + ?Sized>(
    request: GenerationRequest<'_, M>,
    out: &mut dyn Write,
) -> Result<String, VlmError> {
    let GenerationRequest {
        model,
        processor,
        images,
        prompt,
        image_processor,
        params,
    } = request;

    let image_processor = image_processor.ok_or(VlmError::MissingImageProcessor)?;
    let pixel_values = images
        .iter()
        .map(|source| model.preprocess(&source.load()?, image_processor))
        .collect::<Result<Vec<_>, VlmError>>()?;

    if params.verbose {
        writeln!(out, "{SEPARATOR}")?;
        for source in images {
            match source {
                ImageSource::Url(url) => writeln!(out, "Image: {url}")?,
                ImageSource::Path(path) => writeln!(out, "Image: {}", path.display())?,
            }
        }
        writeln!(out, "\nPrompt: {prompt}")?;
    }

    let stream: Option<&mut dyn Write> = if params.verbose { Some(&mut *out) } else { None };
    let output = model.generate(processor, &pixel_values, prompt, &params, stream)?;

    info!(
        "Prompt: {} tokens, {:.3} tokens-per-sec; Generation: {} tokens, {:.3} tokens-per-sec",
        output.prompt_tokens,
        output.prompt_tps(),
        output.generated_tokens,
        output.generation_tps(),
    );

    if params.verbose {
        writeln!(out, "\n{SEPARATOR}")?;
        writeln!(out, "Prompt: {:.3} tokens-per-sec", output.prompt_tps())?;
        writeln!(
            out,
            "Generation: {:.3} tokens-per-sec",
            output.generation_tps()
        )?;
    }

    Ok(output.text)
}
