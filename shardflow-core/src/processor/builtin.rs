//! Transforms selectable by name from a configuration file

use super::output::{transform, OutputValue, Transform, TransformInput, TransformOutput};
use crate::data::{Parameters, Scalar};
use crate::error::BoxError;

/// Names accepted by [`lookup`]
pub const BUILTIN_NAMES: &[&str] = &["copy", "difference"];

/// Find a builtin transform by name
pub fn lookup(name: &str) -> Option<Transform> {
    match name {
        "copy" => Some(transform(copy)),
        "difference" => Some(transform(difference)),
        _ => None,
    }
}

/// Return the first input unchanged
pub fn copy(inputs: &[TransformInput]) -> Result<TransformOutput, BoxError> {
    let first = inputs.first().ok_or("copy needs one input")?;
    Ok(first.resolve()?.into())
}

/// Sample-wise difference of the first two inputs, stored as an auxiliary
/// record carrying the standard deviation as `misfit`
pub fn difference(inputs: &[TransformInput]) -> Result<TransformOutput, BoxError> {
    let [a, b] = inputs else {
        return Err(format!("difference needs two inputs, got {}", inputs.len()).into());
    };

    let a = a.resolve()?;
    let b = b.resolve()?;
    let (Some(x), Some(y)) = (a.data(), b.data()) else {
        return Err(format!("difference needs arrays, got {} and {}", a, b).into());
    };
    if x.len() != y.len() {
        return Err(format!("length mismatch: {} vs {}", x.len(), y.len()).into());
    }

    let diff: Vec<f64> = x.iter().zip(y).map(|(x, y)| x - y).collect();

    let mut parameters = Parameters::new();
    parameters.insert("misfit".into(), Scalar::Float(std_dev(&diff)));
    Ok(OutputValue::Pair(diff, parameters).into())
}

fn std_dev(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    (values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n).sqrt()
}
