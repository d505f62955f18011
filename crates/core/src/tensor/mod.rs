//! Tensor module for inference input and output buffers
//!
//! Tensors are dense NCHW `f32` buffers. Input tensors are built from a
//! converted image buffer; result tensors come back from the inference engine
//! and are dropped at the end of the run.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::data::ImageBuffer;
use crate::{Error, Result};

/// Data types for tensors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataType {
    /// 32-bit floating point
    F32,
    /// 16-bit floating point
    F16,
    /// 8-bit unsigned integer
    U8,
}

impl DataType {
    /// Get size in bytes for this data type
    pub fn size_bytes(&self) -> usize {
        match self {
            DataType::F32 => 4,
            DataType::F16 => 2,
            DataType::U8 => 1,
        }
    }
}

/// Tensor shape in (batch, channels, height, width) order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TensorShape {
    /// Batch size
    pub batch: usize,
    /// Channel count
    pub channels: usize,
    /// Height
    pub height: usize,
    /// Width
    pub width: usize,
}

impl TensorShape {
    /// Create a new shape
    pub const fn new(batch: usize, channels: usize, height: usize, width: usize) -> Self {
        Self {
            batch,
            channels,
            height,
            width,
        }
    }

    /// Total element count
    pub fn element_count(&self) -> usize {
        self.batch * self.channels * self.height * self.width
    }

    /// Elements in one channel plane
    pub fn plane_len(&self) -> usize {
        self.height * self.width
    }

    /// Whether any dimension is zero
    pub fn is_empty(&self) -> bool {
        self.element_count() == 0
    }

    /// Contiguous strides for this shape
    pub fn strides(&self) -> [usize; 4] {
        let w = 1;
        let h = self.width;
        let c = self.height * self.width;
        let n = self.channels * c;
        [n, c, h, w]
    }
}

impl fmt::Display for TensorShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}x{}x{}x{}",
            self.batch, self.channels, self.height, self.width
        )
    }
}

/// Dense NCHW tensor
#[derive(Debug, Clone)]
pub struct TensorBuffer {
    data: Vec<f32>,
    shape: TensorShape,
    dtype: DataType,
}

impl TensorBuffer {
    /// Create from a flat NCHW vector
    pub fn from_vec(data: Vec<f32>, shape: TensorShape) -> Result<Self> {
        if data.len() != shape.element_count() {
            return Err(Error::InvalidData(format!(
                "tensor data holds {} elements, shape {} needs {}",
                data.len(),
                shape,
                shape.element_count()
            )));
        }
        Ok(Self {
            data,
            shape,
            dtype: DataType::F32,
        })
    }

    /// Tensor with every element set to `value`
    pub fn filled(shape: TensorShape, value: f32) -> Self {
        Self {
            data: vec![value; shape.element_count()],
            shape,
            dtype: DataType::F32,
        }
    }

    /// Build a 1x3xHxW input tensor from the colour channels of an image
    pub fn from_image(image: &ImageBuffer) -> Result<Self> {
        let src_channels = image.channels();
        if src_channels < 3 {
            return Err(Error::InvalidData(format!(
                "input image needs at least 3 channels, got {}",
                src_channels
            )));
        }
        let shape = TensorShape::new(1, 3, image.height() as usize, image.width() as usize);
        let plane = shape.plane_len();
        let mut data = vec![0.0f32; shape.element_count()];
        for (i, px) in image.data().chunks_exact(src_channels).enumerate() {
            data[i] = px[0];
            data[plane + i] = px[1];
            data[2 * plane + i] = px[2];
        }
        Ok(Self {
            data,
            shape,
            dtype: DataType::F32,
        })
    }

    /// Get shape
    pub fn shape(&self) -> TensorShape {
        self.shape
    }

    /// Get data type
    pub fn dtype(&self) -> DataType {
        self.dtype
    }

    /// Flat element storage
    pub fn as_slice(&self) -> &[f32] {
        &self.data
    }

    /// Mutable flat element storage
    pub fn as_mut_slice(&mut self) -> &mut [f32] {
        &mut self.data
    }

    /// Size of the element storage in bytes
    pub fn size_bytes(&self) -> usize {
        self.data.len() * self.dtype.size_bytes()
    }

    /// One HxW plane of the first batch entry
    pub fn channel(&self, channel: usize) -> Result<&[f32]> {
        if channel >= self.shape.channels {
            return Err(Error::InvalidData(format!(
                "channel {} out of range for tensor {}",
                channel, self.shape
            )));
        }
        let plane = self.shape.plane_len();
        let start = channel * plane;
        Ok(&self.data[start..start + plane])
    }
}
