use candle_core::{backprop::GradStore, DType, Tensor, Var};

use crate::TrainingError;

const CLIP_EPS: f64 = 1e-6;

/// Euclidean norm of the per-parameter gradient norms.
///
/// Only parameters that received a gradient participate. `None` when no
/// parameter did.
pub fn global_grad_norm<'a, I>(params: I, grads: &GradStore) -> Result<Option<f64>, TrainingError>
where
    I: IntoIterator<Item = &'a Var>,
{
    let mut total_sq = 0f64;
    let mut seen = false;
    for var in params {
        if let Some(grad) = grads.get(var.as_tensor()) {
            let norm = l2_norm(grad)?;
            total_sq += norm * norm;
            seen = true;
        }
    }
    Ok(seen.then(|| total_sq.sqrt()))
}

/// Rescales gradients in place so their global norm does not exceed
/// `max_norm`. Returns the norm measured before clipping.
pub fn clip_grad_norm<'a, I>(
    params: I,
    grads: &mut GradStore,
    max_norm: f64,
) -> Result<Option<f64>, TrainingError>
where
    I: IntoIterator<Item = &'a Var>,
    I::IntoIter: Clone,
{
    let params = params.into_iter();
    let total = match global_grad_norm(params.clone(), grads)? {
        Some(total) => total,
        None => return Ok(None),
    };

    let coef = max_norm / (total + CLIP_EPS);
    if coef < 1.0 {
        for var in params {
            let tensor = var.as_tensor();
            if let Some(grad) = grads.remove(tensor) {
                let clipped = grad.affine(coef, 0.0).map_err(to_runtime_error)?;
                grads.insert(tensor, clipped);
            }
        }
    }

    Ok(Some(total))
}

fn l2_norm(tensor: &Tensor) -> Result<f64, TrainingError> {
    let value = tensor
        .to_dtype(DType::F32)
        .map_err(to_runtime_error)?
        .sqr()
        .map_err(to_runtime_error)?
        .sum_all()
        .map_err(to_runtime_error)?
        .to_vec0::<f32>()
        .map_err(to_runtime_error)?;
    Ok((value as f64).sqrt())
}

fn to_runtime_error(err: candle_core::Error) -> TrainingError {
    TrainingError::runtime(err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    fn setup() -> (Vec<Var>, GradStore) {
        let device = Device::Cpu;
        let a = Var::from_slice(&[0f32, 0.0], (2,), &device).unwrap();
        let b = Var::from_slice(&[0f32], (1,), &device).unwrap();
        let unused = Var::from_slice(&[0f32], (1,), &device).unwrap();
        // gradients: a -> [3, 0], b -> [4]
        let ga = Tensor::from_slice(&[3f32, 0.0], (2,), &device).unwrap();
        let gb = Tensor::from_slice(&[4f32], (1,), &device).unwrap();
        let loss = a
            .as_tensor()
            .mul(&ga)
            .unwrap()
            .sum_all()
            .unwrap()
            .add(&b.as_tensor().mul(&gb).unwrap().sum_all().unwrap())
            .unwrap();
        let grads = loss.backward().unwrap();
        (vec![a, b, unused], grads)
    }

    #[test]
    fn norm_of_norms_skips_parameters_without_gradients() {
        let (params, grads) = setup();
        let norm = global_grad_norm(&params, &grads).unwrap().unwrap();
        assert!((norm - 5.0).abs() < 1e-6);
        assert!(global_grad_norm(&params[2..], &grads).unwrap().is_none());
    }

    #[test]
    fn clipping_reports_pre_clip_norm_and_bounds_result() {
        let (params, mut grads) = setup();
        let before = clip_grad_norm(&params, &mut grads, 1.0).unwrap().unwrap();
        assert!((before - 5.0).abs() < 1e-6);

        let after = global_grad_norm(&params, &grads).unwrap().unwrap();
        assert!(after <= 1.0 + 1e-5, "post-clip norm {after}");
    }

    #[test]
    fn small_gradients_are_left_alone() {
        let (params, mut grads) = setup();
        clip_grad_norm(&params, &mut grads, 10.0).unwrap();
        let grad = grads.get(params[1].as_tensor()).unwrap();
        assert_eq!(grad.to_vec1::<f32>().unwrap(), vec![4.0]);
    }
}
