use crate::fisher_vector::MaybeSync;
use crate::*;

/// Anything that summarises a variable-size set of feature vectors as one vector.
pub trait VectorAggregator<F> {
    type Output;

    /// Aggregate `features`. An empty set has no aggregate and yields `Ok(None)`.
    fn aggregate(&self, features: &[F]) -> FvResult<Option<Self::Output>>;
}

impl<M, F> VectorAggregator<F> for FisherVector<M>
where
    M: MixtureModel + MaybeSync,
    F: AsRef<[f64]> + MaybeSync,
{
    type Output = Encoding;

    fn aggregate(&self, features: &[F]) -> FvResult<Option<Encoding>> {
        self.encode(features)
    }
}

/// Provides method(s) for comparing encodings.
pub trait EncodingTrait {
    /// Linear kernel. For l2 normalised encodings this is the cosine similarity.
    fn dot(&self, other: &Self) -> f32;
    /// Euclidean distance.
    fn l2(&self, other: &Self) -> f32;
}

impl EncodingTrait for Encoding {
    fn dot(&self, other: &Self) -> f32 {
        self.iter()
            .zip(other)
            .fold(0., |a, (b, c)| a + (*b as f64) * (*c as f64)) as f32
    }

    fn l2(&self, other: &Self) -> f32 {
        self.iter()
            .zip(other)
            .fold(0., |a: f64, (b, c)| a + ((b - c) as f64).powi(2))
            .sqrt() as f32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn improved_encodings_compare_by_cosine() {
        let gmm = DiagonalGmm::new(
            vec![0.5, 0.5],
            vec![vec![0., 0.], vec![5., 5.]],
            vec![vec![1., 1.], vec![2., 2.]],
        )
        .unwrap();
        let fv = FisherVector::improved(&gmm).unwrap();
        let a = fv.aggregate(&[[0.5, 0.1], [4., 6.]]).unwrap().unwrap();
        let b = fv.aggregate(&[[-1., 2.], [5., 5.5], [0.3, 0.3]]).unwrap().unwrap();

        assert!((a.dot(&a) - 1.).abs() < 1e-5);
        assert!(a.l2(&a).abs() < 1e-6);
        // For unit vectors |a - b|^2 = 2 - 2 a.b
        let d = a.l2(&b);
        assert!((d * d - (2. - 2. * a.dot(&b))).abs() < 1e-4);
    }
}
