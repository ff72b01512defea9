//! Dense `f32` tensors and the layout shuffles needed to compare runtimes.
//!
//! TensorFlow hands out channel-last tensors; the converted model uses a
//! fixed 5-axis `[seq, batch, channel, height, width]` layout. Both sides are
//! brought to the source tensor's shape before they are compared.

use crate::error::StripError;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

/// Tensors keyed by tensor name (`node:port`).
pub type TensorMap = BTreeMap<String, Tensor>;

/// Axis-order convention of a runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TensorLayout {
    /// `[N, H, W, C]` and lower-rank prefixes of it.
    ChannelLast,
    /// `[S, N, C, H, W]`.
    Rank5,
}

/// Row-major `f32` tensor. Non-finite values are written to JSON as `null`
/// and read back as NaN.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawTensor")]
pub struct Tensor {
    shape: Vec<usize>,
    data: Vec<f32>,
}

/// Unchecked `{"shape": [...], "data": [...]}` form of a [`Tensor`].
#[derive(Debug, Deserialize)]
pub(crate) struct RawTensor {
    shape: Vec<usize>,
    data: Vec<Option<f32>>,
}

impl TryFrom<RawTensor> for Tensor {
    type Error = StripError;

    fn try_from(raw: RawTensor) -> Result<Self, Self::Error> {
        let data = raw.data.into_iter().map(|v| v.unwrap_or(f32::NAN)).collect();
        Self::new(raw.shape, data)
    }
}

impl Tensor {
    pub fn new(shape: Vec<usize>, data: Vec<f32>) -> Result<Self, StripError> {
        let expected = numel(&shape)?;
        if expected != data.len() {
            return Err(StripError::shape(format!(
                "shape {shape:?} needs {expected} elements, got {}",
                data.len()
            )));
        }
        Ok(Self { shape, data })
    }

    pub fn zeros(shape: Vec<usize>) -> Result<Self, StripError> {
        let len = numel(&shape)?;
        Ok(Self {
            shape,
            data: vec![0.0; len],
        })
    }

    /// Uniform values in `[low, high)`, reproducible for a given seed.
    pub fn random_uniform(
        shape: Vec<usize>,
        low: f32,
        high: f32,
        seed: u64,
    ) -> Result<Self, StripError> {
        let mut rng = StdRng::seed_from_u64(seed);
        let data = (0..numel(&shape)?).map(|_| rng.gen_range(low..high)).collect();
        Ok(Self { shape, data })
    }

    /// Read a tensor stored as `{"shape": [...], "data": [...]}`.
    pub fn load_json(path: &Path) -> Result<Self, StripError> {
        let content = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn data(&self) -> &[f32] {
        &self.data
    }

    pub fn rank(&self) -> usize {
        self.shape.len()
    }

    pub fn numel(&self) -> usize {
        self.data.len()
    }

    pub fn reshape(&self, shape: &[usize]) -> Result<Self, StripError> {
        if numel(shape)? != self.numel() {
            return Err(StripError::shape(format!(
                "cannot reshape {:?} into {shape:?}",
                self.shape
            )));
        }
        Ok(Self {
            shape: shape.to_vec(),
            data: self.data.clone(),
        })
    }

    /// Reorder axes: output axis `i` is input axis `axes[i]`.
    pub fn permute(&self, axes: &[usize]) -> Result<Self, StripError> {
        let rank = self.rank();
        let mut seen = vec![false; rank];
        let valid = axes.len() == rank
            && axes
                .iter()
                .all(|&a| a < rank && !std::mem::replace(&mut seen[a], true));
        if !valid {
            return Err(StripError::shape(format!(
                "invalid permutation {axes:?} for rank {rank}"
            )));
        }

        let in_strides = strides(&self.shape);
        let out_shape: Vec<usize> = axes.iter().map(|&a| self.shape[a]).collect();
        let mut data = Vec::with_capacity(self.numel());
        let mut index = vec![0usize; rank];
        for _ in 0..self.numel() {
            let offset: usize = index
                .iter()
                .zip(axes)
                .map(|(&i, &a)| i * in_strides[a])
                .sum();
            data.push(self.data[offset]);
            for axis in (0..rank).rev() {
                index[axis] += 1;
                if index[axis] < out_shape[axis] {
                    break;
                }
                index[axis] = 0;
            }
        }
        Ok(Self {
            shape: out_shape,
            data,
        })
    }

    /// Convert a channel-last tensor into `layout`.
    pub fn to_layout(&self, layout: TensorLayout) -> Result<Self, StripError> {
        match layout {
            TensorLayout::ChannelLast => Ok(self.clone()),
            TensorLayout::Rank5 => {
                let nhwc = match *self.shape.as_slice() {
                    [c] => [1, 1, 1, c],
                    [n, c] => [n, 1, 1, c],
                    [n, h, c] => [n, h, 1, c],
                    [n, h, w, c] => [n, h, w, c],
                    _ => {
                        return Err(StripError::shape(format!(
                            "cannot map rank-{} tensor to the 5-axis layout",
                            self.rank()
                        )));
                    }
                };
                // [N, H, W, C] -> [N, C, H, W], then a leading sequence axis.
                let nchw = self.reshape(&nhwc)?.permute(&[0, 3, 1, 2])?;
                let mut shape = vec![1];
                shape.extend_from_slice(nchw.shape());
                nchw.reshape(&shape)
            }
        }
    }

    /// Bring a tensor in `layout` back to the channel-last `reference` shape.
    pub fn align_to(&self, layout: TensorLayout, reference: &[usize]) -> Result<Self, StripError> {
        match layout {
            TensorLayout::ChannelLast => self.reshape(reference),
            TensorLayout::Rank5 => {
                // Runtimes may drop the leading sequence and batch axes.
                if !(3..=5).contains(&self.rank()) {
                    return Err(StripError::shape(format!(
                        "expected a [C, H, W] to [S, N, C, H, W] tensor, got shape {:?}",
                        self.shape
                    )));
                }
                let mut shape = vec![1; 5 - self.rank()];
                shape.extend_from_slice(&self.shape);
                // [S, N, C, H, W] -> [S, N, H, W, C]
                self.reshape(&shape)?
                    .permute(&[0, 1, 3, 4, 2])?
                    .reshape(reference)
            }
        }
    }
}

fn numel(shape: &[usize]) -> Result<usize, StripError> {
    shape
        .iter()
        .try_fold(1usize, |acc, &d| acc.checked_mul(d))
        .ok_or_else(|| StripError::shape(format!("shape {shape:?} has too many elements")))
}

fn strides(shape: &[usize]) -> Vec<usize> {
    let mut strides = vec![1; shape.len()];
    for i in (0..shape.len().saturating_sub(1)).rev() {
        strides[i] = strides[i + 1] * shape[i + 1];
    }
    strides
}
