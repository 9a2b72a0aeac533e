#[cfg(feature = "bincode")]
use bincode;
use rand::{distributions::WeightedIndex, prelude::Distribution, Rng};
use rand_distr::StandardNormal;
use serde::{Deserialize, Serialize};
use std::{fmt, sync::Arc};
#[cfg(feature = "bincode")]
use tracing::info;

use crate::*;

/// Weights read from a model trained in single precision rarely sum to exactly one.
const WEIGHT_SUM_TOLERANCE: f64 = 1e-4;

/// Read-only view of a trained Gaussian mixture, as consumed by the encoder.
///
/// Only the diagonal of each component's covariance is ever read.
pub trait MixtureModel {
    /// Number of components (K).
    fn num_components(&self) -> usize;

    /// Dimensionality of the components (D).
    fn dims(&self) -> usize;

    /// Prior weight of component `k`.
    fn weight(&self, k: usize) -> f64;

    /// Mean of component `k`, of length `dims()`.
    fn mean(&self, k: usize) -> &[f64];

    /// Variance of component `k` along dimension `j`.
    fn variance(&self, k: usize, j: usize) -> f64;

    /// Write the log posterior responsibility of each component for `x` into `out`.
    ///
    /// `out` must have length `num_components()`.
    fn log_posterior_into(&self, x: &[f64], out: &mut [f64]) -> FvResult<()>;

    /// Log posterior responsibility of each component for `x`.
    fn log_posterior(&self, x: &[f64]) -> FvResult<Vec<f64>> {
        let mut out = vec![0.; self.num_components()];
        self.log_posterior_into(x, &mut out)?;
        Ok(out)
    }
}

impl<M: MixtureModel + ?Sized> MixtureModel for &M {
    fn num_components(&self) -> usize {
        (**self).num_components()
    }
    fn dims(&self) -> usize {
        (**self).dims()
    }
    fn weight(&self, k: usize) -> f64 {
        (**self).weight(k)
    }
    fn mean(&self, k: usize) -> &[f64] {
        (**self).mean(k)
    }
    fn variance(&self, k: usize, j: usize) -> f64 {
        (**self).variance(k, j)
    }
    fn log_posterior_into(&self, x: &[f64], out: &mut [f64]) -> FvResult<()> {
        (**self).log_posterior_into(x, out)
    }
}

impl<M: MixtureModel + ?Sized> MixtureModel for Arc<M> {
    fn num_components(&self) -> usize {
        (**self).num_components()
    }
    fn dims(&self) -> usize {
        (**self).dims()
    }
    fn weight(&self, k: usize) -> f64 {
        (**self).weight(k)
    }
    fn mean(&self, k: usize) -> &[f64] {
        (**self).mean(k)
    }
    fn variance(&self, k: usize, j: usize) -> f64 {
        (**self).variance(k, j)
    }
    fn log_posterior_into(&self, x: &[f64], out: &mut [f64]) -> FvResult<()> {
        (**self).log_posterior_into(x, out)
    }
}

/// Check that a mixture can be used for encoding: at least one component and one
/// dimension, strictly positive finite weights, finite means of length `dims()`,
/// and strictly positive finite variances.
pub fn validate<M: MixtureModel + ?Sized>(model: &M) -> FvResult<()> {
    let (k, d) = (model.num_components(), model.dims());
    if k == 0 {
        return Err(FvErr::EmptyMixture);
    }
    if d == 0 {
        return Err(FvErr::ZeroDimensional);
    }
    for c in 0..k {
        let w = model.weight(c);
        if !(w.is_finite() && w > 0.) {
            return Err(FvErr::InvalidWeight {
                component: c,
                value: w,
            });
        }
        let mean = model.mean(c);
        if mean.len() != d {
            return Err(FvErr::ShapeMismatch {
                what: "means",
                expected: d,
                actual: mean.len(),
            });
        }
        if let Some(j) = mean.iter().position(|m| !m.is_finite()) {
            return Err(FvErr::NonFiniteMean { component: c, dim: j });
        }
        for j in 0..d {
            let v = model.variance(c, j);
            if !(v.is_finite() && v > 0.) {
                return Err(FvErr::InvalidVariance {
                    component: c,
                    dim: j,
                    value: v,
                });
            }
        }
    }
    Ok(())
}

#[derive(PartialEq, Clone)]
/// Gaussian mixture with diagonal covariances. Can be:
/// 1. Built from weights, means and per-dimension variances (validated once, up front).
/// 2. Saved to a file & loaded from a file (requires bincode feature, enabled by default).
/// 3. Queried for posteriors, likelihoods and hard assignments of feature vectors.
pub struct DiagonalGmm {
    weights: Vec<f64>,
    means: Vec<f64>,
    variances: Vec<f64>,
    k: usize,
    d: usize,
    /// Per component: `ln w_k - 0.5 * sum_j ln(2 pi var_kj)`.
    log_norms: Vec<f64>,
}

/// Mixture API
impl DiagonalGmm {
    /// Build a mixture from `K` weights, `K` means and `K` variance vectors, each of length `D`.
    ///
    /// Fails if any shape disagrees, a weight or variance is not strictly positive,
    /// or the weights do not sum to one.
    pub fn new(weights: Vec<f64>, means: Vec<Vec<f64>>, variances: Vec<Vec<f64>>) -> FvResult<Self> {
        let k = weights.len();
        if k == 0 {
            return Err(FvErr::EmptyMixture);
        }
        if means.len() != k {
            return Err(FvErr::ShapeMismatch {
                what: "means",
                expected: k,
                actual: means.len(),
            });
        }
        let d = means[0].len();
        if d == 0 {
            return Err(FvErr::ZeroDimensional);
        }
        Self::check_rows("means", &means, k, d)?;
        Self::check_rows("variances", &variances, k, d)?;

        let gmm = Self::from_flat(weights, means.concat(), variances.concat(), k, d);
        gmm.check()?;
        Ok(gmm)
    }

    /// Build a mixture from full `D x D` covariance matrices (row-major).
    /// Off-diagonal entries are ignored entirely.
    pub fn from_full_covariances(
        weights: Vec<f64>,
        means: Vec<Vec<f64>>,
        covariances: Vec<Vec<f64>>,
    ) -> FvResult<Self> {
        let d = means.first().map_or(0, |m| m.len());
        let variances = covariances
            .iter()
            .map(|cov| {
                if cov.len() != d * d {
                    return Err(FvErr::ShapeMismatch {
                        what: "covariances",
                        expected: d * d,
                        actual: cov.len(),
                    });
                }
                Ok((0..d).map(|j| cov[j * d + j]).collect())
            })
            .collect::<FvResult<Vec<Vec<f64>>>>()?;
        Self::new(weights, means, variances)
    }

    /// Build a spherical mixture: one variance per component, shared by every dimension.
    pub fn spherical(weights: Vec<f64>, means: Vec<Vec<f64>>, variances: Vec<f64>) -> FvResult<Self> {
        let d = means.first().map_or(0, |m| m.len());
        let variances = variances.into_iter().map(|v| vec![v; d]).collect();
        Self::new(weights, means, variances)
    }

    /// Per-component joint log density `ln w_k + ln N(x | mean_k, diag(var_k))`.
    pub fn log_component_densities(&self, x: &[f64]) -> FvResult<Vec<f64>> {
        let mut out = vec![0.; self.k];
        self.log_component_densities_into(x, &mut out)?;
        Ok(out)
    }

    /// Log likelihood of `x` under the whole mixture.
    pub fn log_likelihood(&self, x: &[f64]) -> FvResult<f64> {
        Ok(log_sum_exp(&self.log_component_densities(x)?))
    }

    /// Index of the component most responsible for `x`.
    pub fn predict(&self, x: &[f64]) -> FvResult<usize> {
        let densities = self.log_component_densities(x)?;
        let mut best = (0, f64::NEG_INFINITY);
        for (k, &p) in densities.iter().enumerate() {
            if p > best.1 {
                best = (k, p);
            }
        }
        Ok(best.0)
    }

    /// Draw `n` points from the mixture.
    pub fn sample<R: Rng + ?Sized>(&self, n: usize, rng: &mut R) -> FvResult<Vec<Vec<f64>>> {
        let components = WeightedIndex::new(&self.weights)?;
        Ok((0..n)
            .map(|_| {
                let k = components.sample(rng);
                let mean = self.mean(k);
                (0..self.d)
                    .map(|j| {
                        let z: f64 = rng.sample(StandardNormal);
                        mean[j] + z * self.variance(k, j).sqrt()
                    })
                    .collect()
            })
            .collect())
    }

    /// Load a mixture from a file. The loaded model is validated like a freshly built one.
    #[cfg(feature = "bincode")]
    pub fn load<P: AsRef<std::path::Path>>(file: P) -> FvResult<Self> {
        let mut file = std::fs::File::open(file)?;
        let mut buffer: Vec<u8> = Vec::new();
        std::io::Read::read_to_end(&mut file, &mut buffer)?;
        let gmm: Self = bincode::deserialize(&buffer)?;
        info!(k = gmm.k, d = gmm.d, "Loaded mixture");
        Ok(gmm)
    }

    /// Save mixture to a file
    #[cfg(feature = "bincode")]
    pub fn save<P: AsRef<std::path::Path>>(&self, file: P) -> FvResult<()> {
        let serialized = bincode::serialize(&self)?;
        let mut file = std::fs::File::create(file)?;
        std::io::Write::write_all(&mut file, &serialized)?;
        info!(k = self.k, d = self.d, bytes = serialized.len(), "Saved mixture");
        Ok(())
    }

    /// Component weights, in component order.
    pub fn weights(&self) -> &[f64] {
        &self.weights
    }

    /// Variances of component `k`, of length `D`.
    pub fn variances(&self, k: usize) -> &[f64] {
        &self.variances[k * self.d..(k + 1) * self.d]
    }
}

impl MixtureModel for DiagonalGmm {
    fn num_components(&self) -> usize {
        self.k
    }

    fn dims(&self) -> usize {
        self.d
    }

    fn weight(&self, k: usize) -> f64 {
        self.weights[k]
    }

    fn mean(&self, k: usize) -> &[f64] {
        &self.means[k * self.d..(k + 1) * self.d]
    }

    fn variance(&self, k: usize, j: usize) -> f64 {
        self.variances[k * self.d + j]
    }

    fn log_posterior_into(&self, x: &[f64], out: &mut [f64]) -> FvResult<()> {
        self.log_component_densities_into(x, out)?;
        let total = log_sum_exp(out);
        if total == f64::NEG_INFINITY {
            // Every component assigns zero density: no responsibility anywhere.
            out.iter_mut().for_each(|p| *p = f64::NEG_INFINITY);
        } else {
            out.iter_mut().for_each(|p| *p -= total);
        }
        Ok(())
    }
}

/////////////////////                Helpers                 ////////////////////////
/////////////////////////////////////////////////////////////////////////////////////

/// Log-space sum: `ln(sum_i exp(v_i))`, shifted by the maximum so that very negative
/// values do not all underflow to zero.
pub(crate) fn log_sum_exp(values: &[f64]) -> f64 {
    let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    if max == f64::NEG_INFINITY || max.is_nan() {
        return max;
    }
    let sum: f64 = values.iter().map(|&v| (v - max).exp()).sum();
    max + sum.ln()
}

#[derive(Serialize, Deserialize)]
/// On-disk form of a mixture. Derived quantities are rebuilt and the
/// parameters re-validated on deserialization.
struct SerializableGmm {
    weights: Vec<f64>,
    means: Vec<f64>,
    variances: Vec<f64>,
    k: usize,
    d: usize,
}

impl Serialize for DiagonalGmm {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        let ser = SerializableGmm {
            weights: self.weights.clone(),
            means: self.means.clone(),
            variances: self.variances.clone(),
            k: self.k,
            d: self.d,
        };

        ser.serialize(serializer)
    }
}
impl<'de> Deserialize<'de> for DiagonalGmm {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let ser = SerializableGmm::deserialize(deserializer)?;
        let len = ser.k.checked_mul(ser.d);
        if ser.weights.len() != ser.k
            || len != Some(ser.means.len())
            || len != Some(ser.variances.len())
        {
            return Err(serde::de::Error::custom("inconsistent mixture shape"));
        }

        let gmm = Self::from_flat(ser.weights, ser.means, ser.variances, ser.k, ser.d);
        gmm.check().map_err(serde::de::Error::custom)?;
        Ok(gmm)
    }
}

impl DiagonalGmm {
    fn from_flat(weights: Vec<f64>, means: Vec<f64>, variances: Vec<f64>, k: usize, d: usize) -> Self {
        let half_ln_2pi = 0.5 * (2. * std::f64::consts::PI).ln();
        let log_norms = (0..k)
            .map(|c| {
                let log_det: f64 = variances[c * d..(c + 1) * d].iter().map(|v| v.ln()).sum();
                weights[c].ln() - d as f64 * half_ln_2pi - 0.5 * log_det
            })
            .collect();
        Self {
            weights,
            means,
            variances,
            k,
            d,
            log_norms,
        }
    }

    /// Full validation of a mixture built by `from_flat`.
    fn check(&self) -> FvResult<()> {
        validate(self)?;
        let sum: f64 = self.weights.iter().sum();
        if (sum - 1.).abs() > WEIGHT_SUM_TOLERANCE {
            return Err(FvErr::WeightsNotNormalised { sum });
        }
        Ok(())
    }

    fn check_rows(what: &'static str, rows: &[Vec<f64>], k: usize, d: usize) -> FvResult<()> {
        if rows.len() != k {
            return Err(FvErr::ShapeMismatch {
                what,
                expected: k,
                actual: rows.len(),
            });
        }
        match rows.iter().find(|r| r.len() != d) {
            Some(r) => Err(FvErr::ShapeMismatch {
                what,
                expected: d,
                actual: r.len(),
            }),
            None => Ok(()),
        }
    }

    fn log_component_densities_into(&self, x: &[f64], out: &mut [f64]) -> FvResult<()> {
        if x.len() != self.d {
            return Err(FvErr::DimensionMismatch {
                expected: self.d,
                actual: x.len(),
            });
        }
        if out.len() != self.k {
            return Err(FvErr::ShapeMismatch {
                what: "posterior buffer",
                expected: self.k,
                actual: out.len(),
            });
        }
        for (c, o) in out.iter_mut().enumerate() {
            let mahalanobis: f64 = x
                .iter()
                .zip(self.mean(c))
                .zip(self.variances(c))
                .map(|((xi, mi), vi)| (xi - mi) * (xi - mi) / vi)
                .sum();
            *o = self.log_norms[c] - 0.5 * mahalanobis;
        }
        Ok(())
    }
}

impl fmt::Debug for DiagonalGmm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let min_var = self.variances.iter().copied().fold(f64::INFINITY, f64::min);
        let max_var = self.variances.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        f.debug_struct("DiagonalGmm")
            .field("Components", &self.k)
            .field("Dimensions", &self.d)
            .field("Weights", &self.weights)
            .field("Min Variance", &min_var)
            .field("Max Variance", &max_var)
            .finish()
    }
}
