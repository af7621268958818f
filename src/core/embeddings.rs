use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use image::{imageops, imageops::FilterType, DynamicImage, RgbImage};
use ndarray::ArrayView1;

use crate::models::record::FeatureVector;

#[cfg(feature = "embeddings")]
pub use self::resnet::{Architecture, TchExtractor};

/// Per-channel ImageNet pixel statistics the pretrained networks expect.
const IMAGENET_MEAN: [f32; 3] = [0.485, 0.456, 0.406];
const IMAGENET_STD: [f32; 3] = [0.229, 0.224, 0.225];

/// Errors reported by a feature extractor. No partial vector is ever returned.
#[derive(Debug, thiserror::Error)]
pub enum ExtractionError {
    /// The bytes could not be decoded as an image.
    #[error("failed to decode image")]
    Decode(#[source] image::ImageError),

    /// The image has no pixels.
    #[error("image has zero width or height")]
    Empty,

    /// The network failed to load or run.
    #[error("model error: {0}")]
    Model(String),

    /// The extractor produced a vector of the wrong length.
    #[error("extractor produced {actual} features, expected {expected}")]
    Dimension {
        /// Length fixed at construction.
        expected: usize,
        /// Length actually produced.
        actual: usize,
    },

    /// Extraction did not finish in time.
    #[error("feature extraction timed out after {0:?}")]
    Timeout(Duration),

    /// The worker running the extraction failed.
    #[error("feature extraction task failed: {0}")]
    Task(String),

    /// The requested extractor cannot be built in this configuration.
    #[error("extractor unavailable: {0}")]
    Unavailable(String),
}

/// Converts a decoded image into a fixed-length dense vector.
///
/// Implementations are pure: the same image always yields the same vector,
/// and any loaded weights are read-only after construction.
pub trait FeatureExtractor: Send + Sync + fmt::Debug {
    /// Length N of every vector this extractor produces.
    fn dimension(&self) -> usize;

    /// Extracts the feature vector of an image in any colour mode.
    fn extract(&self, image: &DynamicImage) -> Result<FeatureVector, ExtractionError>;
}

/// Decodes an encoded image, guessing the container format from its bytes.
pub fn decode_image(bytes: &[u8]) -> Result<DynamicImage, ExtractionError> {
    image::load_from_memory(bytes).map_err(ExtractionError::Decode)
}

/// Coerces any colour mode to 8-bit RGB: alpha is dropped, grey is replicated
/// across channels and wider sample types are narrowed.
pub fn to_rgb(image: &DynamicImage) -> RgbImage {
    image.to_rgb8()
}

/// Scales an RGB image into a channel-planar buffer normalised with the
/// ImageNet statistics, in `[C, H, W]` order.
fn normalized_chw(rgb: &RgbImage) -> Vec<f32> {
    let (width, height) = rgb.dimensions();
    let plane = (width * height) as usize;
    let mut data = vec![0f32; plane * 3];

    for (x, y, pixel) in rgb.enumerate_pixels() {
        let offset = (y * width + x) as usize;
        for channel in 0..3 {
            let value = pixel[channel] as f32 / 255.0;
            data[channel * plane + offset] = (value - IMAGENET_MEAN[channel]) / IMAGENET_STD[channel];
        }
    }

    data
}

fn checked_rgb(image: &DynamicImage) -> Result<RgbImage, ExtractionError> {
    let rgb = to_rgb(image);
    if rgb.width() == 0 || rgb.height() == 0 {
        return Err(ExtractionError::Empty);
    }
    Ok(rgb)
}

/// Compute cosine similarity between two vectors.
///
/// Returns 0 when either vector has zero norm or the lengths differ.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() {
        return 0.0;
    }
    let a = ArrayView1::from(a);
    let b = ArrayView1::from(b);
    let dot_product = a.dot(&b);
    let norm_a = a.dot(&a).sqrt();
    let norm_b = b.dot(&b).sqrt();

    if norm_a > 0.0 && norm_b > 0.0 {
        (dot_product / (norm_a * norm_b)).clamp(-1.0, 1.0)
    } else {
        0.0
    }
}

/// A non-learned embedding: the normalised pixels of a small square thumbnail.
///
/// Always available, deterministic and cheap. Captures global colour layout
/// only, so it is a stand-in for the network rather than a replacement.
#[derive(Debug, Clone, Copy)]
pub struct ThumbnailExtractor {
    side: u32,
}

impl ThumbnailExtractor {
    /// Thumbnail side used by [`Default`].
    pub const DEFAULT_SIDE: u32 = 16;

    /// Creates an extractor producing `side * side * 3` features.
    pub fn new(side: u32) -> Self {
        Self { side: side.max(1) }
    }
}

impl Default for ThumbnailExtractor {
    fn default() -> Self {
        Self::new(Self::DEFAULT_SIDE)
    }
}

impl FeatureExtractor for ThumbnailExtractor {
    fn dimension(&self) -> usize {
        (self.side * self.side * 3) as usize
    }

    fn extract(&self, image: &DynamicImage) -> Result<FeatureVector, ExtractionError> {
        let rgb = checked_rgb(image)?;
        let thumbnail = imageops::resize(&rgb, self.side, self.side, FilterType::Triangle);
        Ok(normalized_chw(&thumbnail))
    }
}

/// Selects which extractor the service runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtractorKind {
    /// ResNet-18 without its classifier, 512 features.
    Resnet18,
    /// ResNet-34 without its classifier, 512 features.
    Resnet34,
    /// ResNet-50 without its classifier, 2048 features.
    Resnet50,
    /// [`ThumbnailExtractor`].
    Thumbnail,
}

impl Default for ExtractorKind {
    fn default() -> Self {
        if cfg!(feature = "embeddings") {
            Self::Resnet50
        } else {
            Self::Thumbnail
        }
    }
}

impl fmt::Display for ExtractorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Resnet18 => "resnet18",
            Self::Resnet34 => "resnet34",
            Self::Resnet50 => "resnet50",
            Self::Thumbnail => "thumbnail",
        };
        f.write_str(name)
    }
}

impl FromStr for ExtractorKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "resnet18" => Ok(Self::Resnet18),
            "resnet34" => Ok(Self::Resnet34),
            "resnet50" => Ok(Self::Resnet50),
            "thumbnail" => Ok(Self::Thumbnail),
            other => Err(format!("unknown extractor `{}`", other)),
        }
    }
}

/// Builds the configured extractor. Network weights are loaded here, once.
pub fn build_extractor(
    kind: ExtractorKind,
    weights: Option<&Path>,
) -> Result<Arc<dyn FeatureExtractor>, ExtractionError> {
    match kind {
        ExtractorKind::Thumbnail => Ok(Arc::new(ThumbnailExtractor::default())),
        #[cfg(feature = "embeddings")]
        network => {
            let architecture = match network {
                ExtractorKind::Resnet18 => Architecture::Resnet18,
                ExtractorKind::Resnet34 => Architecture::Resnet34,
                _ => Architecture::Resnet50,
            };
            let weights = weights.ok_or_else(|| {
                ExtractionError::Unavailable(format!("{} requires MODEL_WEIGHTS", network))
            })?;
            Ok(Arc::new(TchExtractor::load(architecture, weights)?))
        }
        #[cfg(not(feature = "embeddings"))]
        network => {
            let _ = weights;
            Err(ExtractionError::Unavailable(format!(
                "{} requires the `embeddings` feature",
                network
            )))
        }
    }
}

#[cfg(feature = "embeddings")]
mod resnet {
    use std::fmt;
    use std::panic::{catch_unwind, AssertUnwindSafe};
    use std::path::Path;
    use std::sync::Mutex;

    use image::{imageops, imageops::FilterType, DynamicImage};
    use tch::nn::{self, ModuleT};
    use tch::{Device, Kind, Tensor};

    use super::{checked_rgb, normalized_chw, ExtractionError, FeatureExtractor};
    use crate::models::record::FeatureVector;

    /// Input resolution of the torchvision ResNets.
    const INPUT_SIDE: u32 = 224;

    /// Supported backbones, all truncated before the classification layer.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum Architecture {
        /// ResNet-18.
        Resnet18,
        /// ResNet-34.
        Resnet34,
        /// ResNet-50.
        Resnet50,
    }

    impl Architecture {
        fn build(self, path: &nn::Path<'_>) -> nn::FuncT<'static> {
            match self {
                Self::Resnet18 => tch::vision::resnet::resnet18_no_final_layer(path),
                Self::Resnet34 => tch::vision::resnet::resnet34_no_final_layer(path),
                Self::Resnet50 => tch::vision::resnet::resnet50_no_final_layer(path),
            }
        }
    }

    struct Network {
        // Owns the weights the model closure reads from.
        _vs: nn::VarStore,
        model: nn::FuncT<'static>,
    }

    /// A pretrained ResNet used as a frozen feature extractor.
    ///
    /// The tch module is not `Sync`, so forward passes are serialised behind
    /// a mutex; the weights themselves are never mutated.
    pub struct TchExtractor {
        network: Mutex<Network>,
        device: Device,
        architecture: Architecture,
        dimension: usize,
    }

    impl fmt::Debug for TchExtractor {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.debug_struct("TchExtractor")
                .field("architecture", &self.architecture)
                .field("device", &self.device)
                .field("dimension", &self.dimension)
                .finish()
        }
    }

    impl TchExtractor {
        /// Builds the network and loads its weights from a `.ot` file.
        pub fn load(architecture: Architecture, weights: &Path) -> Result<Self, ExtractionError> {
            let device = Device::cuda_if_available();
            let mut vs = nn::VarStore::new(device);
            let model = architecture.build(&vs.root());
            vs.load(weights).map_err(|e| {
                ExtractionError::Model(format!("loading weights from {}: {}", weights.display(), e))
            })?;
            vs.freeze();
            log::info!("Loaded {:?} weights from {} on {:?}", architecture, weights.display(), device);
            Self::from_parts(architecture, vs, model, device)
        }

        /// Builds the network with freshly initialised weights, on the CPU.
        pub fn with_random_weights(architecture: Architecture) -> Result<Self, ExtractionError> {
            let device = Device::Cpu;
            let mut vs = nn::VarStore::new(device);
            let model = architecture.build(&vs.root());
            vs.freeze();
            Self::from_parts(architecture, vs, model, device)
        }

        fn from_parts(
            architecture: Architecture,
            vs: nn::VarStore,
            model: nn::FuncT<'static>,
            device: Device,
        ) -> Result<Self, ExtractionError> {
            let side = INPUT_SIDE as i64;
            let probe = Tensor::zeros(&[1, 3, side, side], (Kind::Float, device));
            let dimension = catch_unwind(AssertUnwindSafe(|| {
                tch::no_grad(|| model.forward_t(&probe, false)).numel()
            }))
            .map_err(|_| ExtractionError::Model("probe forward pass failed".to_string()))?;

            Ok(Self {
                network: Mutex::new(Network { _vs: vs, model }),
                device,
                architecture,
                dimension,
            })
        }

        fn forward(&self, input: &Tensor) -> Result<Tensor, ExtractionError> {
            let network = self
                .network
                .lock()
                .map_err(|_| ExtractionError::Model("network lock poisoned".to_string()))?;
            catch_unwind(AssertUnwindSafe(|| {
                tch::no_grad(|| network.model.forward_t(input, false))
            }))
            .map_err(|_| ExtractionError::Model("forward pass failed".to_string()))
        }
    }

    impl FeatureExtractor for TchExtractor {
        fn dimension(&self) -> usize {
            self.dimension
        }

        fn extract(&self, image: &DynamicImage) -> Result<FeatureVector, ExtractionError> {
            let rgb = checked_rgb(image)?;
            let resized = imageops::resize(&rgb, INPUT_SIDE, INPUT_SIDE, FilterType::Triangle);
            let side = INPUT_SIDE as i64;
            let input = Tensor::of_slice(&normalized_chw(&resized))
                .view([1, 3, side, side])
                .to_device(self.device);

            let output = self
                .forward(&input)?
                .flatten(0, -1)
                .to_kind(Kind::Float)
                .to_device(Device::Cpu);
            let features = Vec::<f32>::try_from(output)
                .map_err(|e| ExtractionError::Model(e.to_string()))?;

            if features.len() != self.dimension {
                return Err(ExtractionError::Dimension {
                    expected: self.dimension,
                    actual: features.len(),
                });
            }
            Ok(features)
        }
    }
}

/// Runs `extract` on the blocking pool, bounded by `timeout`.
pub(crate) async fn extract_blocking(
    extractor: Arc<dyn FeatureExtractor>,
    bytes: bytes::Bytes,
    timeout: Duration,
) -> Result<FeatureVector, ExtractionError> {
    let task = tokio::task::spawn_blocking(move || {
        let image = decode_image(&bytes)?;
        extractor.extract(&image)
    });

    match tokio::time::timeout(timeout, task).await {
        Ok(Ok(result)) => result,
        Ok(Err(join)) => Err(ExtractionError::Task(join.to_string())),
        Err(_) => Err(ExtractionError::Timeout(timeout)),
    }
}
