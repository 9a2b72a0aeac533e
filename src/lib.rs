use thiserror::Error;

/// Diagonal-covariance Gaussian mixture model, the trained model that
/// features are encoded against.
pub mod mixture;
pub use mixture::{DiagonalGmm, MixtureModel};

/// Implementation of the Fisher Vector encoder,
/// which provides the main functionality of this crate.
pub mod fisher_vector;
pub use fisher_vector::{FisherOptions, FisherVector, MaybeSync};

/// Aggregator trait and similarity measures between encodings.
pub mod aggregate;
pub use aggregate::{EncodingTrait, VectorAggregator};

/// Fisher Vector representation of a local feature set.
///
/// Length is `2 * K * D`, laid out block-major: for each component `k`,
/// `D` first-order values followed by `D` second-order values.
pub type Encoding = Vec<f32>;

pub type FvResult<T> = std::result::Result<T, FvErr>;
#[derive(Error, Debug)]
pub enum FvErr {
    #[error("Io Error")]
    Io(#[from] std::io::Error),
    #[cfg(feature = "bincode")]
    #[error("Model Serialization Error")]
    Bincode(#[from] bincode::Error),
    #[error("Cannot sample from mixture weights")]
    Sampling(#[from] rand::distributions::WeightedError),
    #[error("Dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },
    #[error("Mixture has no components")]
    EmptyMixture,
    #[error("Mixture components have zero dimensions")]
    ZeroDimensional,
    #[error("Shape mismatch in {what}: expected {expected}, got {actual}")]
    ShapeMismatch {
        what: &'static str,
        expected: usize,
        actual: usize,
    },
    #[error("Component {component} has invalid weight {value}")]
    InvalidWeight { component: usize, value: f64 },
    #[error("Component {component} has invalid variance {value} in dimension {dim}")]
    InvalidVariance {
        component: usize,
        dim: usize,
        value: f64,
    },
    #[error("Component {component} has a non-finite mean in dimension {dim}")]
    NonFiniteMean { component: usize, dim: usize },
    #[error("Mixture weights sum to {sum}, not 1")]
    WeightsNotNormalised { sum: f64 },
}
