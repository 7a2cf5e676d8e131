use argh::FromArgs;

use vlm_generate::pipeline::{self, GenerateArgs, HubBackend};

#[derive(FromArgs)]
/// Generate text from an image and a prompt with a vision-language model
struct Args {
    /// local model directory or HuggingFace Hub repository id
    #[argh(option, default = "pipeline::DEFAULT_MODEL_PATH.to_string()")]
    model: String,

    /// URL or path of an input image, repeat for several images
    #[argh(option)]
    image: Vec<String>,

    /// message to be processed by the model, escape sequences are decoded
    #[argh(option, default = "pipeline::DEFAULT_PROMPT.to_string()")]
    prompt: String,

    /// maximum number of tokens to generate
    #[argh(option, default = "pipeline::DEFAULT_MAX_TOKENS")]
    max_tokens: usize,

    /// temperature for sampling
    #[argh(option, default = "pipeline::DEFAULT_TEMP")]
    temp: f64,

    /// nucleus sampling threshold, 1.0 disables it
    #[argh(option, default = "pipeline::DEFAULT_TOP_P")]
    top_p: f64,

    /// seed of the sampler
    #[argh(option, default = "pipeline::DEFAULT_SEED")]
    seed: u64,

    /// print only the final output instead of streaming it
    #[argh(switch)]
    verbose: bool,
}

impl From<Args> for GenerateArgs {
    fn from(args: Args) -> Self {
        let images = if args.image.is_empty() {
            pipeline::DEFAULT_IMAGE.iter().map(|s| s.to_string()).collect()
        } else {
            args.image
        };

        GenerateArgs {
            model: args.model,
            images,
            prompt: args.prompt,
            max_tokens: args.max_tokens,
            temp: args.temp,
            top_p: args.top_p,
            seed: args.seed,
            // the flag turns streaming off
            verbose: !args.verbose,
        }
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    let args: Args = argh::from_env();

    let args = GenerateArgs::from(args);
    log::debug!("Running with {args:?}");

    pipeline::run(&args, &HubBackend, &mut std::io::stdout())?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(flags: &[&str]) -> GenerateArgs {
        match Args::from_args(&["generate"], flags) {
            Ok(args) => GenerateArgs::from(args),
            Err(early_exit) => panic!("invalid flags {flags:?}: {}", early_exit.output),
        }
    }

    #[test]
    fn test_no_flags() {
        assert_eq!(parse(&[]), GenerateArgs::default());
    }

    #[test]
    fn test_verbose_flag_disables_streaming() {
        assert!(parse(&[]).verbose);
        assert!(!parse(&["--verbose"]).verbose);
    }

    #[test]
    fn test_repeated_images() {
        let args = parse(&["--image", "a.jpg", "--image", "https://x.org/b.png"]);
        assert_eq!(args.images, vec!["a.jpg", "https://x.org/b.png"]);
    }

    #[test]
    fn test_sampling_flags() {
        let args = parse(&[
            "--model",
            "google/paligemma-3b-mix-224",
            "--max-tokens",
            "20",
            "--temp",
            "0",
            "--top-p",
            "0.9",
            "--seed",
            "42",
            "--prompt",
            "caption en",
        ]);
        assert_eq!(args.model, "google/paligemma-3b-mix-224");
        assert_eq!(args.max_tokens, 20);
        assert_eq!(args.temp, 0.0);
        assert_eq!(args.top_p, 0.9);
        assert_eq!(args.seed, 42);
        assert_eq!(args.prompt, "caption en");
        assert_eq!(args.images, pipeline::DEFAULT_IMAGE.to_vec());
    }

    #[test]
    fn test_unknown_flag() {
        assert!(Args::from_args(&["generate"], &["--stream"]).is_err());
    }
}
