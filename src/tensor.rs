//! Backend-neutral tensor containers for model inputs and outputs

use crate::error::{NennError, Result};
use ndarray::ArrayD;

/// Owned tensor of one of the element types exported models use
#[derive(Debug, Clone, PartialEq)]
pub enum TensorData {
    F32(ArrayD<f32>),
    I64(ArrayD<i64>),
    I32(ArrayD<i32>),
}

impl TensorData {
    #[must_use]
    pub fn shape(&self) -> &[usize] {
        match self {
            Self::F32(a) => a.shape(),
            Self::I64(a) => a.shape(),
            Self::I32(a) => a.shape(),
        }
    }

    #[must_use]
    pub fn dtype(&self) -> &'static str {
        match self {
            Self::F32(_) => "float32",
            Self::I64(_) => "int64",
            Self::I32(_) => "int32",
        }
    }

    /// Borrow as `f32`, failing for integer tensors
    ///
    /// # Errors
    /// - The tensor does not hold `f32` data
    pub fn as_f32(&self) -> Result<&ArrayD<f32>> {
        match self {
            Self::F32(a) => Ok(a),
            other => Err(NennError::postprocess(format!(
                "Expected float32 tensor, got {}",
                other.dtype()
            ))),
        }
    }

    /// Convert to `f32`, widening integer tensors such as label maps
    #[must_use]
    pub fn to_f32(&self) -> ArrayD<f32> {
        match self {
            Self::F32(a) => a.clone(),
            Self::I64(a) => a.mapv(|v| v as f32),
            Self::I32(a) => a.mapv(|v| v as f32),
        }
    }

    /// Convert to `i64`, truncating float values
    #[must_use]
    pub fn to_i64(&self) -> ArrayD<i64> {
        match self {
            Self::F32(a) => a.mapv(|v| v as i64),
            Self::I64(a) => a.clone(),
            Self::I32(a) => a.mapv(i64::from),
        }
    }
}

impl From<ArrayD<f32>> for TensorData {
    fn from(value: ArrayD<f32>) -> Self {
        Self::F32(value)
    }
}

impl From<ArrayD<i64>> for TensorData {
    fn from(value: ArrayD<i64>) -> Self {
        Self::I64(value)
    }
}

impl From<ArrayD<i32>> for TensorData {
    fn from(value: ArrayD<i32>) -> Self {
        Self::I32(value)
    }
}

/// Named model inputs, in the order they are fed
pub type Feeds = Vec<(String, TensorData)>;

/// Named model outputs in the order the model declares them
#[derive(Debug, Clone, Default)]
pub struct InferenceOutputs {
    entries: Vec<(String, TensorData)>,
}

impl InferenceOutputs {
    #[must_use]
    pub fn new(entries: Vec<(String, TensorData)>) -> Self {
        Self { entries }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&TensorData> {
        self.entries
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, t)| t)
    }

    #[must_use]
    pub fn get_index(&self, index: usize) -> Option<&TensorData> {
        self.entries.get(index).map(|(_, t)| t)
    }

    /// First output, which is the primary result for every supported model
    ///
    /// # Errors
    /// - The model produced no outputs
    pub fn first(&self) -> Result<&TensorData> {
        self.get_index(0)
            .ok_or_else(|| NennError::postprocess("Model produced no outputs"))
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(n, _)| n.as_str())
    }

    #[must_use]
    pub fn into_entries(self) -> Vec<(String, TensorData)> {
        self.entries
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::IxDyn;

    #[test]
    fn test_tensor_conversions() {
        let labels = TensorData::from(ArrayD::from_elem(IxDyn(&[1, 2, 2]), 3_i32));
        assert_eq!(labels.shape(), &[1, 2, 2]);
        assert_eq!(labels.dtype(), "int32");
        assert!(labels.as_f32().is_err());
        assert!(labels.to_f32().iter().all(|v| (*v - 3.0).abs() < f32::EPSILON));
        assert!(labels.to_i64().iter().all(|v| *v == 3));
    }

    #[test]
    fn test_outputs_lookup() {
        let outputs = InferenceOutputs::new(vec![
            (
                "multiclass_nms3_0.tmp_0".to_string(),
                TensorData::from(ArrayD::<f32>::zeros(IxDyn(&[0, 6]))),
            ),
            (
                "multiclass_nms3_0.tmp_2".to_string(),
                TensorData::from(ArrayD::<i32>::zeros(IxDyn(&[1]))),
            ),
        ]);

        assert_eq!(outputs.len(), 2);
        assert_eq!(outputs.first().unwrap().shape(), &[0, 6]);
        assert_eq!(outputs.get_index(1).unwrap().dtype(), "int32");
        assert!(outputs.get("multiclass_nms3_0.tmp_2").is_some());
        assert!(outputs.get("missing").is_none());
        assert_eq!(outputs.names().count(), 2);
        assert!(InferenceOutputs::default().first().is_err());
    }
}
