#[cfg(feature = "rayon")]
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use std::fmt;
use tracing::{debug, instrument};

use crate::mixture::validate;
use crate::*;

/// Feature sets at least this large are accumulated in parallel (requires rayon feature).
pub const PARALLEL_THRESHOLD: usize = 512;

/// Posterior scratch lives on the stack for mixtures up to this size.
const INLINE_COMPONENTS: usize = 64;

type Posteriors = SmallVec<[f64; INLINE_COMPONENTS]>;

/// Thread-safety bound on mixtures and features accepted by the encoder.
///
/// `Sync` when parallel encoding is compiled in (rayon feature), otherwise
/// implemented by every type. Downstream generic code can use it to forward the
/// same bound without repeating the feature gate.
#[cfg(feature = "rayon")]
pub trait MaybeSync: Sync {}
#[cfg(feature = "rayon")]
impl<T: Sync + ?Sized> MaybeSync for T {}

#[cfg(not(feature = "rayon"))]
pub trait MaybeSync {}
#[cfg(not(feature = "rayon"))]
impl<T: ?Sized> MaybeSync for T {}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
/// Post-processing applied to every encoding. The default is the plain Fisher Vector.
pub struct FisherOptions {
    /// Signed square root of every element (Hellinger's kernel instead of the linear one).
    pub hellinger: bool,
    /// Scale the final vector to unit Euclidean norm. Runs after the Hellinger step.
    pub l2_normalise: bool,
}

impl FisherOptions {
    /// The improved Fisher Vector of Perronnin et al. (2010): Hellinger mapping, then l2 normalisation.
    pub fn improved() -> Self {
        Self::from_improved(true)
    }

    pub fn from_improved(improved: bool) -> Self {
        Self {
            hellinger: improved,
            l2_normalise: improved,
        }
    }
}

/// Fisher Vector encoder. Turns a variable-size set of `D`-dimensional local features
/// into one vector of length `2 * K * D` describing how the set deviates from a `K`
/// component diagonal Gaussian mixture.
///
/// The mixture is only ever read, so one encoder (or one mixture behind `&` / `Arc`)
/// can serve any number of concurrent `encode` calls.
pub struct FisherVector<M> {
    mixture: M,
    options: FisherOptions,
}

/// Encoder API
impl<M: MixtureModel + MaybeSync> FisherVector<M> {
    /// Construct with the given mixture and post-processing options.
    ///
    /// The mixture is validated once here: every weight and every variance must be
    /// strictly positive and finite.
    pub fn new(mixture: M, options: FisherOptions) -> FvResult<Self> {
        validate(&mixture)?;
        debug!(
            k = mixture.num_components(),
            d = mixture.dims(),
            hellinger = options.hellinger,
            l2_normalise = options.l2_normalise,
            "Created Fisher Vector encoder"
        );
        Ok(Self { mixture, options })
    }

    /// Plain Fisher Vector encoder with no post-processing.
    pub fn standard(mixture: M) -> FvResult<Self> {
        Self::new(mixture, FisherOptions::default())
    }

    /// Improved Fisher Vector encoder (Hellinger mapping and l2 normalisation).
    pub fn improved(mixture: M) -> FvResult<Self> {
        Self::new(mixture, FisherOptions::improved())
    }

    /// Encode a set of feature vectors.
    ///
    /// Returns `Ok(None)` for an empty set and `FvErr::DimensionMismatch` if any
    /// feature's length differs from the mixture's dimensionality. Otherwise the
    /// result has length `2 * K * D`.
    #[instrument(level = "trace", skip_all, fields(n = features.len()))]
    pub fn encode<F>(&self, features: &[F]) -> FvResult<Option<Encoding>>
    where
        F: AsRef<[f64]> + MaybeSync,
    {
        if features.is_empty() {
            return Ok(None);
        }
        let d = self.dims();
        if let Some(f) = features.iter().find(|f| f.as_ref().len() != d) {
            return Err(FvErr::DimensionMismatch {
                expected: d,
                actual: f.as_ref().len(),
            });
        }

        let mut acc = self.accumulate(features)?;
        self.rescale(&mut acc, features.len());

        let mut out: Encoding = acc.into_iter().map(|v| v as f32).collect();
        if self.options.hellinger {
            hellinger(&mut out);
        }
        if self.options.l2_normalise {
            l2_normalise(&mut out);
        }
        Ok(Some(out))
    }

    /// Encode single precision descriptors, widening each to `f64` first.
    pub fn encode_f32<F: AsRef<[f32]>>(&self, features: &[F]) -> FvResult<Option<Encoding>> {
        let widened: Vec<Vec<f64>> = features
            .iter()
            .map(|f| f.as_ref().iter().map(|&v| v as f64).collect())
            .collect();
        self.encode(&widened)
    }

    /// Encode many feature sets against the same mixture, one result per set.
    pub fn encode_batch<F>(&self, sets: &[Vec<F>]) -> FvResult<Vec<Option<Encoding>>>
    where
        F: AsRef<[f64]> + MaybeSync,
    {
        #[cfg(feature = "rayon")]
        let encoded: FvResult<Vec<_>> = sets.par_iter().map(|set| self.encode(set)).collect();
        #[cfg(not(feature = "rayon"))]
        let encoded: FvResult<Vec<_>> = sets.iter().map(|set| self.encode(set)).collect();
        encoded
    }

    /// The first-order block of component `k` within an encoding made by this encoder.
    ///
    /// `None` if `k` is not a component of the mixture or `encoding` has the wrong length.
    pub fn first_order<'a>(&self, encoding: &'a [f32], k: usize) -> Option<&'a [f32]> {
        self.block(encoding, k).map(|b| &b[..self.dims()])
    }

    /// The second-order block of component `k` within an encoding made by this encoder.
    ///
    /// `None` if `k` is not a component of the mixture or `encoding` has the wrong length.
    pub fn second_order<'a>(&self, encoding: &'a [f32], k: usize) -> Option<&'a [f32]> {
        self.block(encoding, k).map(|b| &b[self.dims()..])
    }

    /// Length of every encoding: `2 * K * D`.
    pub fn output_len(&self) -> usize {
        2 * self.mixture.num_components() * self.dims()
    }

    pub fn mixture(&self) -> &M {
        &self.mixture
    }

    pub fn options(&self) -> FisherOptions {
        self.options
    }

    pub fn hellinger(&self) -> bool {
        self.options.hellinger
    }

    pub fn l2_normalise(&self) -> bool {
        self.options.l2_normalise
    }

    fn dims(&self) -> usize {
        self.mixture.dims()
    }
}

/// Replace every element `v` by `sign(v) * sqrt(|v|)`. Zero stays zero.
pub fn hellinger(values: &mut [f32]) {
    for v in values.iter_mut() {
        *v = v.signum() * v.abs().sqrt();
    }
}

/// Scale `values` to unit Euclidean norm.
///
/// A zero (or non-finite) norm leaves the vector untouched and returns `false`.
pub fn l2_normalise(values: &mut [f32]) -> bool {
    let sumsq: f64 = values.iter().map(|&v| v as f64 * v as f64).sum();
    if sumsq == 0. || !sumsq.is_finite() {
        debug!(sumsq, "Skipping l2 normalisation of degenerate encoding");
        return false;
    }
    let inv_norm = 1. / sumsq.sqrt();
    for v in values.iter_mut() {
        *v = (*v as f64 * inv_norm) as f32;
    }
    true
}

/////////////////////                Helpers                 ////////////////////////
/////////////////////////////////////////////////////////////////////////////////////

impl<M: MixtureModel + MaybeSync> FisherVector<M> {
    fn accumulate<F>(&self, features: &[F]) -> FvResult<Vec<f64>>
    where
        F: AsRef<[f64]> + MaybeSync,
    {
        #[cfg(feature = "rayon")]
        {
            if features.len() >= PARALLEL_THRESHOLD {
                return self.accumulate_parallel(features);
            }
        }
        self.accumulate_sequential(features)
    }

    fn accumulate_sequential<F: AsRef<[f64]>>(&self, features: &[F]) -> FvResult<Vec<f64>> {
        debug!(
            n = features.len(),
            k = self.mixture.num_components(),
            d = self.dims(),
            "Sequential Fisher Vector accumulation"
        );
        let mut acc = vec![0.; self.output_len()];
        let mut post = self.posterior_scratch();
        for f in features {
            self.add_feature(&mut acc, &mut post, f.as_ref())?;
        }
        Ok(acc)
    }

    /// Each worker accumulates a partial vector over its share of the features;
    /// partial vectors are then summed.
    #[cfg(feature = "rayon")]
    fn accumulate_parallel<F>(&self, features: &[F]) -> FvResult<Vec<f64>>
    where
        F: AsRef<[f64]> + Sync,
        M: Sync,
    {
        debug!(
            n = features.len(),
            k = self.mixture.num_components(),
            d = self.dims(),
            "Parallel Fisher Vector accumulation"
        );
        let len = self.output_len();
        features
            .par_iter()
            .try_fold(
                || (vec![0.; len], self.posterior_scratch()),
                |(mut acc, mut post), f| {
                    self.add_feature(&mut acc, &mut post, f.as_ref())?;
                    Ok::<_, FvErr>((acc, post))
                },
            )
            .map(|partial| partial.map(|(acc, _)| acc))
            .try_reduce(
                || vec![0.; len],
                |mut a, b| {
                    a.iter_mut().zip(b).for_each(|(x, y)| *x += y);
                    Ok(a)
                },
            )
    }

    /// Add the contribution of one feature. Block `k` of `acc` holds `D` first-order
    /// sums followed by `D` second-order sums.
    fn add_feature(&self, acc: &mut [f64], post: &mut [f64], x: &[f64]) -> FvResult<()> {
        self.mixture.log_posterior_into(x, post)?;
        let d = self.dims();
        for (k, block) in acc.chunks_exact_mut(2 * d).enumerate() {
            let posterior = post[k].exp();
            if posterior == 0. {
                continue;
            }
            let mean = self.mixture.mean(k);
            let (first, second) = block.split_at_mut(d);
            for j in 0..d {
                let diff = (x[j] - mean[j]) / self.mixture.variance(k, j);
                first[j] += posterior * diff;
                second[j] += posterior * (diff * diff - 1.);
            }
        }
        Ok(())
    }

    /// Diagonal approximation of the inverse Fisher information, averaged over `n` features.
    fn rescale(&self, acc: &mut [f64], n: usize) {
        let d = self.dims();
        let n = n as f64;
        for (k, block) in acc.chunks_exact_mut(2 * d).enumerate() {
            let w = self.mixture.weight(k);
            let wt1 = 1. / (n * w.sqrt());
            let wt2 = 1. / (n * (2. * w).sqrt());
            let (first, second) = block.split_at_mut(d);
            first.iter_mut().for_each(|v| *v *= wt1);
            second.iter_mut().for_each(|v| *v *= wt2);
        }
    }

    fn block<'a>(&self, encoding: &'a [f32], k: usize) -> Option<&'a [f32]> {
        if encoding.len() != self.output_len() || k >= self.mixture.num_components() {
            return None;
        }
        let d = self.dims();
        Some(&encoding[2 * k * d..2 * (k + 1) * d])
    }

    fn posterior_scratch(&self) -> Posteriors {
        SmallVec::from_elem(0., self.mixture.num_components())
    }
}

impl<M: MixtureModel> fmt::Debug for FisherVector<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FisherVector")
            .field("Components", &self.mixture.num_components())
            .field("Dimensions", &self.mixture.dims())
            .field("Hellinger", &self.options.hellinger)
            .field("L2 Normalise", &self.options.l2_normalise)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TOL: f32 = 1e-5;

    fn assert_close(actual: &[f32], expected: &[f32]) {
        assert_eq!(actual.len(), expected.len());
        for (i, (a, e)) in actual.iter().zip(expected).enumerate() {
            assert!((a - e).abs() < TOL, "index {}: {} != {}", i, a, e);
        }
    }

    fn two_component_1d() -> DiagonalGmm {
        DiagonalGmm::new(
            vec![0.5, 0.5],
            vec![vec![0.], vec![10.]],
            vec![vec![1.], vec![1.]],
        )
        .unwrap()
    }

    #[test]
    fn single_component_feature_at_mean() {
        let gmm = DiagonalGmm::new(vec![1.], vec![vec![1., 2., 3.]], vec![vec![1.; 3]]).unwrap();
        let fv = FisherVector::standard(&gmm).unwrap();
        let enc = fv.encode(&[vec![1., 2., 3.]]).unwrap().unwrap();
        let s = -1. / 2f32.sqrt();
        assert_close(&enc, &[0., 0., 0., s, s, s]);
    }

    #[test]
    fn nearest_component_takes_the_feature() {
        let fv = FisherVector::standard(two_component_1d()).unwrap();
        let enc = fv.encode(&[[0.]]).unwrap().unwrap();
        assert_eq!(enc.len(), 4);
        assert!(enc[0].abs() < TOL);
        // Component 0: posterior ~1, diff 0, so (0 - 1) / sqrt(2 * 0.5).
        assert!((enc[1] + 1.).abs() < TOL);
        assert!(enc[2].abs() < TOL && enc[3].abs() < TOL);
    }

    #[test]
    fn layout_is_block_major() {
        let gmm = DiagonalGmm::new(
            vec![0.5, 0.5],
            vec![vec![0., 0.], vec![100., 100.]],
            vec![vec![1., 1.], vec![4., 4.]],
        )
        .unwrap();
        let fv = FisherVector::standard(gmm).unwrap();
        let enc = fv.encode(&[[1., 2.]]).unwrap().unwrap();
        let r2 = 2f32.sqrt();
        assert_close(fv.first_order(&enc, 0).unwrap(), &[r2, 2. * r2]);
        assert_close(fv.second_order(&enc, 0).unwrap(), &[0., 3.]);
        assert_close(fv.first_order(&enc, 1).unwrap(), &[0., 0.]);
        assert_close(fv.second_order(&enc, 1).unwrap(), &[0., 0.]);
    }

    #[test]
    fn empty_set_has_no_encoding() {
        let fv = FisherVector::improved(two_component_1d()).unwrap();
        let features: Vec<Vec<f64>> = Vec::new();
        assert!(fv.encode(&features).unwrap().is_none());
    }

    #[test]
    fn wrong_dimensionality_is_rejected() {
        let fv = FisherVector::standard(two_component_1d()).unwrap();
        let res = fv.encode(&[vec![0.], vec![0., 1.]]);
        assert!(matches!(
            res,
            Err(FvErr::DimensionMismatch { expected: 1, actual: 2 })
        ));
    }

    #[test]
    fn zero_vector_survives_l2_normalisation() {
        let gmm = DiagonalGmm::new(vec![1.], vec![vec![0.]], vec![vec![1.]]).unwrap();
        let fv = FisherVector::improved(gmm).unwrap();
        // Residuals +1 and -1 cancel in both orders.
        let enc = fv.encode(&[[1.], [-1.]]).unwrap().unwrap();
        assert_eq!(enc, vec![0., 0.]);
    }

    #[test]
    fn hellinger_keeps_sign_and_zero() {
        let mut v: Vec<f32> = vec![4., -9., 0., 0.25];
        hellinger(&mut v);
        assert_eq!(v, vec![2., -3., 0., 0.5]);
    }

    #[test]
    fn l2_normalise_reports_degenerate_input() {
        let mut zeros = vec![0f32; 4];
        assert!(!l2_normalise(&mut zeros));
        assert_eq!(zeros, vec![0.; 4]);

        let mut v: Vec<f32> = vec![3., 4.];
        assert!(l2_normalise(&mut v));
        assert_close(&v, &[0.6, 0.8]);
    }

    #[test]
    fn f32_features_match_f64_features() {
        let fv = FisherVector::standard(two_component_1d()).unwrap();
        let a = fv.encode_f32(&[[1.5f32], [8.]]).unwrap();
        let b = fv.encode(&[[1.5f64], [8.]]).unwrap();
        assert_eq!(a, b);
    }

    #[cfg(feature = "rayon")]
    #[test]
    fn parallel_matches_sequential() {
        use rand::{rngs::StdRng, SeedableRng};

        let gmm = two_component_1d();
        let fv = FisherVector::standard(&gmm).unwrap();
        let mut rng = StdRng::seed_from_u64(3);
        let features = gmm.sample(PARALLEL_THRESHOLD * 4, &mut rng).unwrap();
        let par = fv.accumulate_parallel(&features).unwrap();
        let seq = fv.accumulate_sequential(&features).unwrap();
        for (p, s) in par.iter().zip(&seq) {
            assert!((p - s).abs() < 1e-9 * (1. + s.abs()));
        }
    }

    /// Two-dimensional single-component mixture with whatever parameters a test needs.
    struct ExternalMixture {
        mean: Vec<f64>,
        variances: Vec<f64>,
    }

    impl MixtureModel for ExternalMixture {
        fn num_components(&self) -> usize {
            1
        }
        fn dims(&self) -> usize {
            2
        }
        fn weight(&self, _k: usize) -> f64 {
            1.
        }
        fn mean(&self, _k: usize) -> &[f64] {
            &self.mean
        }
        fn variance(&self, _k: usize, j: usize) -> f64 {
            self.variances[j]
        }
        fn log_posterior_into(&self, _x: &[f64], out: &mut [f64]) -> FvResult<()> {
            out[0] = 0.;
            Ok(())
        }
    }

    #[test]
    fn encoder_rejects_zero_variance_mixture() {
        let mixture = ExternalMixture {
            mean: vec![0., 0.],
            variances: vec![1., 0.],
        };
        assert!(matches!(
            FisherVector::standard(mixture),
            Err(FvErr::InvalidVariance { component: 0, dim: 1, .. })
        ));
    }

    #[test]
    fn encoder_rejects_short_mean() {
        let mixture = ExternalMixture {
            mean: vec![0.],
            variances: vec![1., 1.],
        };
        assert!(matches!(
            FisherVector::standard(mixture),
            Err(FvErr::ShapeMismatch { what: "means", expected: 2, actual: 1 })
        ));
    }

    #[test]
    fn encoder_rejects_non_finite_mean() {
        let mixture = ExternalMixture {
            mean: vec![0., f64::INFINITY],
            variances: vec![1., 1.],
        };
        assert!(matches!(
            FisherVector::standard(mixture),
            Err(FvErr::NonFiniteMean { component: 0, dim: 1 })
        ));
    }

    #[test]
    fn blocks_are_checked_against_the_encoder() {
        let fv = FisherVector::standard(two_component_1d()).unwrap();
        let enc = fv.encode(&[[0.]]).unwrap().unwrap();
        assert_eq!(fv.second_order(&enc, 1).map(|b| b.len()), Some(1));
        assert!(fv.first_order(&enc, 2).is_none());
        assert!(fv.second_order(&enc, 2).is_none());
        // An encoding from a mixture of another shape.
        assert!(fv.first_order(&enc[..2], 0).is_none());
    }
}
