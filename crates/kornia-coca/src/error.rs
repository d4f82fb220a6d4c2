/// Errors raised while configuring, building or running a CoCa model.
#[derive(thiserror::Error, Debug)]
pub enum CocaError {
    /// `build` received the wrong number of shape descriptors.
    #[error("Expected 2 input shapes (images, texts), got {0} shapes")]
    ShapeCount(usize),

    /// An image or text shape descriptor has the wrong rank.
    #[error("{name} shape expected to be {layout}, instead got shape: {actual:?}")]
    ShapeRank {
        name: &'static str,
        layout: &'static str,
        actual: Vec<usize>,
    },

    /// Images and texts disagree on the batch size.
    #[error("Differing batch sizes between images and texts input: {images} vs {texts}")]
    BatchMismatch { images: usize, texts: usize },

    /// A shape descriptor has the right rank but unusable dimensions.
    #[error("{name} shape {actual:?} is invalid: {reason}")]
    InvalidShape {
        name: &'static str,
        reason: String,
        actual: Vec<usize>,
    },

    /// The image is smaller than a single patch along one of its spatial dims.
    #[error("Image of size {height}x{width} cannot be split into patches of size {patch_size}")]
    ImageTooSmall {
        height: usize,
        width: usize,
        patch_size: usize,
    },

    /// The model was called before `build`.
    #[error("CoCa model must be built before it can be called")]
    NotBuilt,

    /// `build` was called on a model that is already built.
    #[error("CoCa model is already built with images shape {images:?} and text shape {texts:?}")]
    AlreadyBuilt {
        images: Vec<usize>,
        texts: Vec<usize>,
    },

    /// A forward input does not conform to the shape the model was built with.
    #[error("{name} input expected shape {expected}, instead got shape: {actual:?}")]
    InputShapeMismatch {
        name: &'static str,
        expected: String,
        actual: Vec<usize>,
    },

    /// The configuration mapping cannot be turned into a model.
    #[error("Invalid CoCa configuration: {0}")]
    Config(String),

    #[error(transparent)]
    CandleError(#[from] candle_core::Error),

    #[error(transparent)]
    SerializationError(#[from] serde_json::Error),

    #[error(transparent)]
    IoError(#[from] std::io::Error),
}
