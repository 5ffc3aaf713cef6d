//! Leaf layers for building module trees.

use std::fmt;

use anyhow::{ensure, Result};

use crate::module::Layer;
use crate::tensor::Tensor;

/// Fully connected layer `y = x W + b` over `[batch, in]` inputs.
#[derive(Clone)]
pub struct Linear {
    pub weight: Tensor,
    pub bias: Option<Tensor>,
}

impl Linear {
    pub fn new(weight: Tensor, bias: Option<Tensor>) -> Result<Self> {
        let weight_dims = weight.shape().dims();
        ensure!(
            weight_dims.len() == 2,
            "linear weight must be 2D, got {:?}",
            weight_dims
        );
        if let Some(bias) = &bias {
            ensure!(
                bias.shape().dims() == [weight_dims[1]],
                "linear bias must have shape [{}], got {:?}",
                weight_dims[1],
                bias.shape().dims()
            );
        }
        Ok(Self { weight, bias })
    }
}

impl Layer for Linear {
    fn forward(&self, input: &Tensor) -> Result<Tensor> {
        let dims = input.shape().dims();
        ensure!(
            dims.len() == 2,
            "linear expects 2D input, got shape {:?}",
            dims
        );
        let mut output = input.matmul(&self.weight)?;
        if let Some(bias) = &self.bias {
            let cols = bias.len();
            let data: Vec<f32> = output
                .data()
                .iter()
                .enumerate()
                .map(|(i, v)| v + bias.data()[i % cols])
                .collect();
            output = Tensor::from_vec(output.shape().clone(), data)?;
        }
        Ok(output)
    }
}

impl fmt::Debug for Linear {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Linear")
            .field("weight", &self.weight.shape().dims())
            .field("bias", &self.bias.is_some())
            .finish()
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct Relu;

impl Layer for Relu {
    fn forward(&self, input: &Tensor) -> Result<Tensor> {
        Ok(input.map(|v| v.max(0.0)))
    }
}

/// Multiplies every element by a constant.
#[derive(Clone, Copy, Debug)]
pub struct Scale(pub f32);

impl Layer for Scale {
    fn forward(&self, input: &Tensor) -> Result<Tensor> {
        Ok(input.scale(self.0))
    }
}
