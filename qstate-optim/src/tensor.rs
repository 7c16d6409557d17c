use crate::error::{OptimError, Result};
use half::f16;
use rand::{rngs::StdRng, Rng, SeedableRng};
use rand_distr::StandardNormal;
use serde::{Deserialize, Serialize};
use std::fmt;

pub use qstate_structs::core::DType;

/// Host buffer standing in for the tensor type of the surrounding framework.
///
/// Values are held as `f32`. A `F16` tensor keeps every value representable
/// in half precision: each write path rounds through [`half::f16`].
#[derive(Clone, Debug, PartialEq)]
pub struct Tensor {
    shape: Vec<usize>,
    dtype: DType,
    data: Vec<f32>,
}

impl Tensor {
    pub fn new(shape: Vec<usize>, dtype: DType, data: Vec<f32>) -> Result<Self> {
        let numel: usize = shape.iter().product();
        if numel != data.len() {
            return Err(OptimError::ShapeMismatch {
                context: "tensor data".to_string(),
                expected: shape,
                actual: vec![data.len()],
            });
        }
        let mut tensor = Self { shape, dtype, data };
        tensor.round_to_dtype();
        Ok(tensor)
    }

    pub fn zeros(shape: Vec<usize>, dtype: DType) -> Self {
        let numel = shape.iter().product();
        Self {
            shape,
            dtype,
            data: vec![0.0; numel],
        }
    }

    pub fn from_f16(shape: Vec<usize>, data: &[f16]) -> Result<Self> {
        Self::new(shape, DType::F16, data.iter().map(|x| x.to_f32()).collect())
    }

    /// Standard normal samples multiplied by `scale`.
    pub fn randn(shape: Vec<usize>, dtype: DType, scale: f32, seed: [u8; 32]) -> Self {
        let mut rng = StdRng::from_seed(seed);
        let numel: usize = shape.iter().product();
        let data = (0..numel)
            .map(|_| rng.sample::<f32, _>(StandardNormal) * scale)
            .collect();
        let mut tensor = Self { shape, dtype, data };
        tensor.round_to_dtype();
        tensor
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn numel(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.data
    }

    pub fn to_vec(&self) -> Vec<f32> {
        self.data.clone()
    }

    pub fn to_f16_vec(&self) -> Vec<f16> {
        self.data.iter().map(|x| f16::from_f32(*x)).collect()
    }

    /// Same values stored as `dtype`.
    pub fn to_dtype(&self, dtype: DType) -> Tensor {
        let mut tensor = Tensor {
            shape: self.shape.clone(),
            dtype,
            data: self.data.clone(),
        };
        tensor.round_to_dtype();
        tensor
    }

    /// Replaces the values, keeping shape and dtype.
    pub fn copy_from_slice(&mut self, data: &[f32]) -> Result<()> {
        if data.len() != self.data.len() {
            return Err(OptimError::ShapeMismatch {
                context: "tensor copy".to_string(),
                expected: self.shape.clone(),
                actual: vec![data.len()],
            });
        }
        self.data.copy_from_slice(data);
        self.round_to_dtype();
        Ok(())
    }

    /// Applies `f` elementwise.
    pub fn map_inplace<F>(&mut self, mut f: F)
    where
        F: FnMut(usize, f32) -> f32,
    {
        for (i, x) in self.data.iter_mut().enumerate() {
            *x = f(i, *x);
        }
        self.round_to_dtype();
    }

    /// Raw mutable access for kernels. Callers must invoke
    /// [`Tensor::round_to_dtype`] afterwards.
    pub(crate) fn data_mut(&mut self) -> &mut [f32] {
        &mut self.data
    }

    pub(crate) fn round_to_dtype(&mut self) {
        if self.dtype == DType::F16 {
            for x in self.data.iter_mut() {
                *x = f16::from_f32(*x).to_f32();
            }
        }
    }
}

/// Stable handle of a parameter inside a [`ParamArena`].
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ParamId(usize);

impl ParamId {
    pub fn index(&self) -> usize {
        self.0
    }
}

impl fmt::Display for ParamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Parameter {
    pub value: Tensor,
    pub grad: Option<Tensor>,
}

/// Caller owned parameter storage. Optimizers keep [`ParamId`]s and borrow the
/// arena for the duration of a step.
#[derive(Clone, Debug, Default)]
pub struct ParamArena {
    params: Vec<Parameter>,
}

impl ParamArena {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, value: Tensor) -> ParamId {
        self.params.push(Parameter { value, grad: None });
        ParamId(self.params.len() - 1)
    }

    pub fn len(&self) -> usize {
        self.params.len()
    }

    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }

    pub fn ids(&self) -> impl Iterator<Item = ParamId> {
        (0..self.params.len()).map(ParamId)
    }

    pub fn get(&self, id: ParamId) -> Result<&Parameter> {
        self.params
            .get(id.0)
            .ok_or(OptimError::UnknownParameter { param: id })
    }

    pub fn get_mut(&mut self, id: ParamId) -> Result<&mut Parameter> {
        self.params
            .get_mut(id.0)
            .ok_or(OptimError::UnknownParameter { param: id })
    }

    pub fn value(&self, id: ParamId) -> Result<&Tensor> {
        Ok(&self.get(id)?.value)
    }

    pub fn value_mut(&mut self, id: ParamId) -> Result<&mut Tensor> {
        Ok(&mut self.get_mut(id)?.value)
    }

    /// Attaches a gradient; it must match the parameter's shape and dtype.
    pub fn set_grad(&mut self, id: ParamId, grad: Tensor) -> Result<()> {
        let param = self.get_mut(id)?;
        check_grad(id, &param.value, &grad)?;
        param.grad = Some(grad);
        Ok(())
    }

    pub fn clear_grad(&mut self, id: ParamId) -> Result<()> {
        self.get_mut(id)?.grad = None;
        Ok(())
    }

    pub fn zero_grad(&mut self) {
        for param in self.params.iter_mut() {
            param.grad = None;
        }
    }
}

pub(crate) fn check_grad(id: ParamId, value: &Tensor, grad: &Tensor) -> Result<()> {
    if grad.shape() != value.shape() {
        return Err(OptimError::ShapeMismatch {
            context: format!("gradient of parameter {}", id),
            expected: value.shape().to_vec(),
            actual: grad.shape().to_vec(),
        });
    }
    if grad.dtype() != value.dtype() {
        return Err(OptimError::DTypeMismatch {
            context: format!("gradient of parameter {}", id),
            expected: value.dtype(),
            actual: grad.dtype(),
        });
    }
    Ok(())
}
