//! Safetensors-backed model weight loading and export.

use std::borrow::Cow;
use std::path::Path;

use memmap2::MmapOptions;
use safetensors::tensor::{Dtype, SafeTensorError, View, serialize_to_file};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq)]
pub struct TensorF32 {
    pub shape: Vec<usize>,
    pub data: Vec<f32>,
}

#[derive(Debug)]
pub struct WeightStore {
    mmap: memmap2::Mmap,
}

#[derive(Debug, Error)]
pub enum WeightError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("safetensors error: {0}")]
    SafeTensors(#[from] SafeTensorError),
    #[error("unsupported dtype for {name}: {dtype:?}")]
    UnsupportedDtype { name: String, dtype: Dtype },
    #[error("invalid tensor byte length for {name}: got {bytes}, expected multiple of {elem_size}")]
    InvalidByteLen {
        name: String,
        bytes: usize,
        elem_size: usize,
    },
    #[error("unexpected tensors in weight file: {0:?}")]
    Unexpected(Vec<String>),
}

fn f16_to_f32(bits: u16) -> f32 {
    let sign = u32::from(bits >> 15) << 31;
    let exp = u32::from((bits >> 10) & 0x1f);
    let mant = u32::from(bits & 0x3ff);
    let out = match (exp, mant) {
        (0, 0) => sign,
        (0, _) => {
            // subnormal: value = mant * 2^-24
            let v = (mant as f32) * f32::from_bits(0x3380_0000);
            return if sign != 0 { -v } else { v };
        }
        (0x1f, _) => sign | 0x7f80_0000 | (mant << 13),
        _ => sign | ((exp + 112) << 23) | (mant << 13),
    };
    f32::from_bits(out)
}

fn check_byte_len(name: &str, raw: &[u8], elem_size: usize) -> Result<(), WeightError> {
    if raw.len() % elem_size != 0 {
        return Err(WeightError::InvalidByteLen {
            name: name.to_string(),
            bytes: raw.len(),
            elem_size,
        });
    }
    Ok(())
}

impl WeightStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, WeightError> {
        let file = std::fs::File::open(path)?;
        // SAFETY: read-only file mapping for immutable tensor access.
        let mmap = unsafe { MmapOptions::new().map(&file)? };
        Ok(Self { mmap })
    }

    pub fn names(&self) -> Result<Vec<String>, WeightError> {
        let st = safetensors::SafeTensors::deserialize(&self.mmap)?;
        let mut names: Vec<String> = st.iter().map(|(name, _)| name.to_string()).collect();
        names.sort();
        Ok(names)
    }

    pub fn tensor_f32(&self, name: &str) -> Result<TensorF32, WeightError> {
        let st = safetensors::SafeTensors::deserialize(&self.mmap)?;
        let tv = st.tensor(name)?;
        let dtype = tv.dtype();
        let shape = tv.shape().to_vec();
        let raw = tv.data();

        let data = match dtype {
            Dtype::F32 => {
                check_byte_len(name, raw, 4)?;
                raw.chunks_exact(4)
                    .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                    .collect()
            }
            Dtype::BF16 => {
                check_byte_len(name, raw, 2)?;
                raw.chunks_exact(2)
                    .map(|c| {
                        let bits = u16::from_le_bytes([c[0], c[1]]) as u32;
                        f32::from_bits(bits << 16)
                    })
                    .collect()
            }
            Dtype::F16 => {
                check_byte_len(name, raw, 2)?;
                raw.chunks_exact(2)
                    .map(|c| f16_to_f32(u16::from_le_bytes([c[0], c[1]])))
                    .collect()
            }
            other => {
                return Err(WeightError::UnsupportedDtype {
                    name: name.to_string(),
                    dtype: other,
                });
            }
        };

        Ok(TensorF32 { shape, data })
    }
}

/// Owned little-endian F32 tensor for serialization.
struct F32View {
    shape: Vec<usize>,
    bytes: Vec<u8>,
}

impl View for F32View {
    fn dtype(&self) -> Dtype {
        Dtype::F32
    }

    fn shape(&self) -> &[usize] {
        &self.shape
    }

    fn data(&self) -> Cow<'_, [u8]> {
        Cow::Borrowed(&self.bytes)
    }

    fn data_len(&self) -> usize {
        self.bytes.len()
    }
}

/// Write named F32 tensors to a safetensors file.
pub fn save_f32<'a>(
    path: impl AsRef<Path>,
    tensors: impl IntoIterator<Item = (String, &'a TensorF32)>,
) -> Result<(), WeightError> {
    let views: Vec<(String, F32View)> = tensors
        .into_iter()
        .map(|(name, t)| {
            let mut bytes = Vec::with_capacity(t.data.len() * 4);
            for v in &t.data {
                bytes.extend_from_slice(&v.to_le_bytes());
            }
            (
                name,
                F32View {
                    shape: t.shape.clone(),
                    bytes,
                },
            )
        })
        .collect();
    serialize_to_file(views, &None, path.as_ref())?;
    Ok(())
}
