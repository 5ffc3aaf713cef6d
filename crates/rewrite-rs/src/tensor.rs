//! Dense host tensor used by the built-in symbols, layers and tests.

use anyhow::{bail, ensure, Result};

/// Row-major extents of a [`Tensor`], outermost axis first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Shape {
    dims: Vec<usize>,
}

impl Shape {
    /// Builds a shape from its extents.
    ///
    /// Scalars are not modelled: an empty `dims` panics.
    pub fn new<D: Into<Vec<usize>>>(dims: D) -> Self {
        let dims = dims.into();
        assert!(!dims.is_empty(), "tensor shapes need at least one axis");
        Shape { dims }
    }

    /// Extents per axis.
    pub fn dims(&self) -> &[usize] {
        &self.dims
    }

    /// Element count, the product of every extent.
    pub fn num_elements(&self) -> usize {
        self.dims.iter().product()
    }
}

/// Row-major `f32` tensor.
#[derive(Debug, Clone, PartialEq)]
pub struct Tensor {
    shape: Shape,
    data: Vec<f32>,
}

impl Tensor {
    /// Constructs a tensor from raw values, validating the length against the shape.
    pub fn from_vec(shape: Shape, data: Vec<f32>) -> Result<Self> {
        if data.len() != shape.num_elements() {
            bail!(
                "tensor data length ({}) does not match shape {:?}",
                data.len(),
                shape.dims()
            );
        }
        Ok(Tensor { shape, data })
    }

    /// One-dimensional tensor holding `data`.
    pub fn vector(data: Vec<f32>) -> Self {
        Tensor {
            shape: Shape::new([data.len()]),
            data,
        }
    }

    pub fn zeros(shape: Shape) -> Self {
        let len = shape.num_elements();
        Tensor {
            shape,
            data: vec![0.0; len],
        }
    }

    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    pub fn data(&self) -> &[f32] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Applies `f` to every element, returning a new tensor.
    pub fn map<F>(&self, f: F) -> Tensor
    where
        F: Fn(f32) -> f32,
    {
        Tensor {
            shape: self.shape.clone(),
            data: self.data.iter().map(|v| f(*v)).collect(),
        }
    }

    /// Combines two tensors of identical shape element by element.
    pub fn zip_with<F>(&self, rhs: &Tensor, f: F) -> Result<Tensor>
    where
        F: Fn(f32, f32) -> f32,
    {
        ensure!(
            self.shape == rhs.shape,
            "shape mismatch: {:?} vs {:?}",
            self.shape.dims(),
            rhs.shape.dims()
        );
        Ok(Tensor {
            shape: self.shape.clone(),
            data: self
                .data
                .iter()
                .zip(rhs.data.iter())
                .map(|(a, b)| f(*a, *b))
                .collect(),
        })
    }

    pub fn add(&self, rhs: &Tensor) -> Result<Tensor> {
        self.zip_with(rhs, |a, b| a + b)
    }

    pub fn sub(&self, rhs: &Tensor) -> Result<Tensor> {
        self.zip_with(rhs, |a, b| a - b)
    }

    pub fn mul(&self, rhs: &Tensor) -> Result<Tensor> {
        self.zip_with(rhs, |a, b| a * b)
    }

    pub fn div(&self, rhs: &Tensor) -> Result<Tensor> {
        self.zip_with(rhs, |a, b| a / b)
    }

    pub fn scale(&self, factor: f32) -> Tensor {
        self.map(|v| v * factor)
    }

    pub fn add_scalar(&self, value: f32) -> Tensor {
        self.map(|v| v + value)
    }

    /// `[m, k] x [k, n] -> [m, n]`.
    pub fn matmul(&self, rhs: &Tensor) -> Result<Tensor> {
        let (lhs_dims, rhs_dims) = (self.shape.dims(), rhs.shape.dims());
        ensure!(
            lhs_dims.len() == 2 && rhs_dims.len() == 2,
            "matmul expects 2D operands, got {:?} and {:?}",
            lhs_dims,
            rhs_dims
        );
        let (m, k, n) = (lhs_dims[0], lhs_dims[1], rhs_dims[1]);
        ensure!(
            rhs_dims[0] == k,
            "inner dimensions differ: {:?} x {:?}",
            lhs_dims,
            rhs_dims
        );

        let mut out = vec![0.0f32; m * n];
        for row in 0..m {
            for col in 0..n {
                let mut acc = 0.0f32;
                for kk in 0..k {
                    acc += self.data[row * k + kk] * rhs.data[kk * n + col];
                }
                out[row * n + col] = acc;
            }
        }
        Tensor::from_vec(Shape::new([m, n]), out)
    }

    /// Largest absolute element-wise difference; shapes must match.
    pub fn max_abs_diff(&self, rhs: &Tensor) -> Result<f32> {
        let diff = self.sub(rhs)?;
        Ok(diff.data.iter().fold(0.0f32, |acc, v| acc.max(v.abs())))
    }
}
