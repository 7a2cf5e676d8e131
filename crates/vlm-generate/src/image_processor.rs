use std::path::{Path, PathBuf};

use candle_core::{DType, Device, Tensor};
use image::{imageops, imageops::FilterType, DynamicImage, ImageReader, RgbImage};
use log::debug;
use serde::Deserialize;

use crate::error::VlmError;
use crate::hub::read_optional_json;

/// Where an image comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImageSource {
    Url(String),
    Path(PathBuf),
}

impl ImageSource {
    /// Classify an image reference: `http://` and `https://` are URLs, anything else is
    /// a filesystem path.
    pub fn parse(reference: &str) -> Self {
        if reference.starts_with("http://") || reference.starts_with("https://") {
            Self::Url(reference.to_string())
        } else {
            Self::Path(PathBuf::from(reference))
        }
    }

    /// Fetch and decode the image.
    pub fn load(&self) -> Result<DynamicImage, VlmError> {
        let image = match self {
            Self::Url(url) => {
                debug!("Downloading image from {url}");
                let bytes = reqwest::blocking::get(url)?.error_for_status()?.bytes()?;
                image::load_from_memory(&bytes)?
            }
            Self::Path(path) => ImageReader::open(path)?.with_guessed_format()?.decode()?,
        };
        debug!("Loaded image {}x{}", image.width(), image.height());
        Ok(image)
    }
}

/// Target size of a resize or crop as written in `preprocessor_config.json`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum ImageSize {
    HeightWidth { height: u32, width: u32 },
    ShortestEdge { shortest_edge: u32 },
    LongestEdge { longest_edge: u32 },
    Square(u32),
}

impl ImageSize {
    /// Output `(width, height)` for an input of `width` x `height`.
    pub fn resolve(&self, width: u32, height: u32) -> (u32, u32) {
        let scale = |edge: u32, reference: u32, other: u32| -> u32 {
            ((other as f64 * edge as f64 / reference.max(1) as f64).round() as u32).max(1)
        };
        match *self {
            Self::HeightWidth { height, width } => (width, height),
            Self::Square(edge) => (edge, edge),
            Self::ShortestEdge { shortest_edge } if width <= height => {
                (shortest_edge, scale(shortest_edge, width, height))
            }
            Self::ShortestEdge { shortest_edge } => {
                (scale(shortest_edge, height, width), shortest_edge)
            }
            Self::LongestEdge { longest_edge } if width >= height => {
                (longest_edge, scale(longest_edge, width, height))
            }
            Self::LongestEdge { longest_edge } => (scale(longest_edge, height, width), longest_edge),
        }
    }

    /// Output `(width, height)` of a center crop.
    pub fn crop(&self) -> (u32, u32) {
        match *self {
            Self::HeightWidth { height, width } => (width, height),
            Self::Square(edge)
            | Self::ShortestEdge {
                shortest_edge: edge,
            }
            | Self::LongestEdge { longest_edge: edge } => (edge, edge),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_resample() -> u8 {
    3
}

fn default_rescale_factor() -> f64 {
    1.0 / 255.0
}

fn default_mean_std() -> [f32; 3] {
    [0.5, 0.5, 0.5]
}

/// Preprocessing parameters, mirroring the fields of `preprocessor_config.json`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ImageProcessorConfig {
    #[serde(default = "default_true")]
    pub do_resize: bool,
    #[serde(default)]
    pub size: Option<ImageSize>,
    /// PIL resampling filter code.
    #[serde(default = "default_resample")]
    pub resample: u8,
    #[serde(default)]
    pub do_center_crop: bool,
    #[serde(default)]
    pub crop_size: Option<ImageSize>,
    #[serde(default = "default_true")]
    pub do_rescale: bool,
    #[serde(default = "default_rescale_factor")]
    pub rescale_factor: f64,
    #[serde(default = "default_true")]
    pub do_normalize: bool,
    #[serde(default = "default_mean_std")]
    pub image_mean: [f32; 3],
    #[serde(default = "default_mean_std")]
    pub image_std: [f32; 3],
}

impl Default for ImageProcessorConfig {
    // SigLIP at 224x224
    fn default() -> Self {
        Self {
            do_resize: true,
            size: Some(ImageSize::HeightWidth {
                height: 224,
                width: 224,
            }),
            resample: default_resample(),
            do_center_crop: false,
            crop_size: None,
            do_rescale: true,
            rescale_factor: default_rescale_factor(),
            do_normalize: true,
            image_mean: default_mean_std(),
            image_std: default_mean_std(),
        }
    }
}

impl ImageProcessorConfig {
    fn filter(&self) -> FilterType {
        match self.resample {
            0 => FilterType::Nearest,
            1 => FilterType::Lanczos3,
            2 => FilterType::Triangle,
            _ => FilterType::CatmullRom,
        }
    }
}

/// Preprocessed image handed to a model.
#[derive(Debug, Clone)]
pub struct PixelValues {
    /// `[N, 3, H, W]`, `N` is 1 unless the model splits the image into patches.
    pub tensor: Tensor,
    /// `(width, height)` of the decoded image.
    pub image_size: (u32, u32),
}

/// Turns decoded images into normalized `[1, 3, H, W]` tensors.
#[derive(Debug, Clone, Default)]
pub struct ImageProcessor {
    config: ImageProcessorConfig,
}

impl ImageProcessor {
    pub fn new(config: ImageProcessorConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ImageProcessorConfig {
        &self.config
    }

    /// Resize, crop, rescale and normalize an image.
    ///
    /// # Arguments
    ///
    /// * `image` - The decoded image, converted to RGB8 internally.
    /// * `dtype` - The dtype of the returned tensor.
    /// * `device` - The device of the returned tensor.
    ///
    /// # Returns
    ///
    /// The pixel values with shape `[1, 3, H, W]`.
    pub fn preprocess(
        &self,
        image: &DynamicImage,
        dtype: DType,
        device: &Device,
    ) -> Result<Tensor, VlmError> {
        let rgb = self.resize_and_crop(image.to_rgb8());
        let (width, height) = rgb.dimensions();

        let mut pixels =
            Tensor::from_vec(rgb.into_raw(), (height as usize, width as usize, 3), device)?
                .permute((2, 0, 1))?
                .to_dtype(DType::F32)?;

        if self.config.do_rescale {
            pixels = pixels.affine(self.config.rescale_factor, 0.)?;
        }

        if self.config.do_normalize {
            let mean = Tensor::from_slice(&self.config.image_mean, (3, 1, 1), device)?;
            let std = Tensor::from_slice(&self.config.image_std, (3, 1, 1), device)?;
            pixels = pixels.broadcast_sub(&mean)?.broadcast_div(&std)?;
        }

        Ok(pixels.unsqueeze(0)?.to_dtype(dtype)?)
    }

    fn resize_and_crop(&self, mut rgb: RgbImage) -> RgbImage {
        if self.config.do_resize {
            if let Some(size) = self.config.size {
                let (width, height) = size.resolve(rgb.width(), rgb.height());
                if (width, height) != rgb.dimensions() {
                    rgb = imageops::resize(&rgb, width, height, self.config.filter());
                }
            }
        }

        if self.config.do_center_crop {
            if let Some(crop) = self.config.crop_size {
                let (width, height) = crop.crop();
                let x = rgb.width().saturating_sub(width) / 2;
                let y = rgb.height().saturating_sub(height) / 2;
                rgb = imageops::crop_imm(&rgb, x, y, width, height).to_image();
            }
        }

        rgb
    }
}

/// Read `preprocessor_config.json`, `None` when the model has none.
pub fn load_image_processor(model_path: &Path) -> Result<Option<ImageProcessor>, VlmError> {
    read_optional_json(&model_path.join("preprocessor_config.json"))?
        .map(|value| Ok(ImageProcessor::new(serde_json::from_value(value)?)))
        .transpose()
}
