//! Loss primitives shared by the region-proposal and classification stages.

use burn::tensor::{backend::Backend, Tensor, TensorData};

/// Named scalar loss terms produced by one stage, in insertion order.
#[derive(Debug, Clone)]
pub struct LossTerms<B: Backend> {
    terms: Vec<(String, Tensor<B, 1>)>,
}

impl<B: Backend> Default for LossTerms<B> {
    fn default() -> Self {
        Self { terms: Vec::new() }
    }
}

impl<B: Backend> LossTerms<B> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace `name`.
    pub fn insert(&mut self, name: impl Into<String>, value: Tensor<B, 1>) {
        let name = name.into();
        if let Some(slot) = self.terms.iter_mut().find(|(n, _)| *n == name) {
            slot.1 = value;
        } else {
            self.terms.push((name, value));
        }
    }

    pub fn get(&self, name: &str) -> Option<&Tensor<B, 1>> {
        self.terms.iter().find(|(n, _)| n == name).map(|(_, t)| t)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Tensor<B, 1>)> {
        self.terms.iter().map(|(n, t)| (n.as_str(), t))
    }

    pub fn len(&self) -> usize {
        self.terms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.terms.is_empty()
    }

    /// Scale one term in place; unknown names are left alone.
    pub fn scale(&mut self, name: &str, weight: f32) {
        if let Some(slot) = self.terms.iter_mut().find(|(n, _)| n == name) {
            slot.1 = slot.1.clone().mul_scalar(weight);
        }
    }
}

impl<B: Backend> IntoIterator for LossTerms<B> {
    type Item = (String, Tensor<B, 1>);
    type IntoIter = std::vec::IntoIter<(String, Tensor<B, 1>)>;

    fn into_iter(self) -> Self::IntoIter {
        self.terms.into_iter()
    }
}

/// Element-wise smooth-L1 with the `sigma` parameterisation used by
/// Faster R-CNN: quadratic below `1 / sigma^2`, linear above.
pub fn smooth_l1<B: Backend, const D: usize>(diff: Tensor<B, D>, sigma: f32) -> Tensor<B, D> {
    let sigma2 = sigma * sigma;
    let abs = diff.abs();
    let small = abs.clone().lower_elem(1.0 / sigma2).float();
    let quadratic = abs.clone().powf_scalar(2.0).mul_scalar(0.5 * sigma2);
    let linear = abs.sub_scalar(0.5 / sigma2);
    quadratic * small.clone() + linear * small.neg().add_scalar(1.0)
}

pub fn zero_loss<B: Backend>(device: &B::Device) -> Tensor<B, 1> {
    Tensor::<B, 1>::from_data(TensorData::new(vec![0.0f32], [1]), device)
}

/// First element of a scalar tensor on the host.
pub fn scalar_value<B: Backend>(tensor: Tensor<B, 1>) -> f32 {
    tensor
        .into_data()
        .to_vec::<f32>()
        .unwrap_or_default()
        .first()
        .copied()
        .unwrap_or(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn_ndarray::NdArray;

    type B = NdArray<f32>;

    #[test]
    fn smooth_l1_matches_piecewise_definition() {
        let device = Default::default();
        let diff = Tensor::<B, 1>::from_floats([0.0, 0.5, -2.0], &device);
        let out = smooth_l1(diff, 1.0).into_data().to_vec::<f32>().unwrap();
        assert!((out[0] - 0.0).abs() < 1e-6);
        assert!((out[1] - 0.125).abs() < 1e-6);
        assert!((out[2] - 1.5).abs() < 1e-6);
    }

    #[test]
    fn loss_terms_insert_replace_and_scale() {
        let device = Default::default();
        let mut terms = LossTerms::<B>::new();
        terms.insert("a", Tensor::from_floats([1.0], &device));
        terms.insert("b", Tensor::from_floats([3.0], &device));
        terms.insert("a", Tensor::from_floats([2.0], &device));
        terms.scale("b", 2.0);
        assert_eq!(terms.len(), 2);
        assert_eq!(scalar_value(terms.get("a").unwrap().clone()), 2.0);
        assert_eq!(scalar_value(terms.get("b").unwrap().clone()), 6.0);
        assert!(terms.get("c").is_none());
    }
}
