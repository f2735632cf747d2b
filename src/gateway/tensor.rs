//! WASI-NN-shaped tensor carrier for prompt input.

use bytes::Bytes;

use crate::error::{GatewayError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TensorType {
    F16,
    F32,
    U8,
    I32,
}

/// A caller-provided tensor: a dimension sequence, a primitive type tag,
/// and the raw data. Text inputs use `U8` with the byte length as the only
/// dimension.
#[derive(Debug, Clone)]
pub struct Tensor<'a> {
    pub dimensions: Vec<u32>,
    pub dtype: TensorType,
    pub data: &'a [u8],
}

impl<'a> Tensor<'a> {
    /// Convenience constructor for text prompts.
    pub fn text(data: &'a [u8]) -> Self {
        Self {
            dimensions: vec![data.len() as u32],
            dtype: TensorType::U8,
            data,
        }
    }

    /// Element count implied by the dimension sequence.
    pub fn volume(&self) -> usize {
        self.dimensions.iter().map(|&d| d as usize).product()
    }

    /// Read the payload as text: a nul-terminated byte sequence bounded by
    /// the tensor volume.
    pub(crate) fn read_text(&self) -> Result<Bytes> {
        if self.dtype != TensorType::U8 {
            return Err(GatewayError::InvalidArgument(
                "text input tensors must have type u8".into(),
            ));
        }
        let bound = self.volume().min(self.data.len());
        let bytes = &self.data[..bound];
        let end = bytes.iter().position(|&b| b == 0).unwrap_or(bound);
        Ok(Bytes::copy_from_slice(&bytes[..end]))
    }
}
