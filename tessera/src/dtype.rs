//! Data types for tensor elements

use std::fmt;
use std::str::FromStr;

use crate::Error;

/// Supported data types for tensors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DType {
    /// 32-bit floating point
    F32,
    /// 16-bit floating point (IEEE 754)
    F16,
    /// Brain floating point (16-bit)
    BF16,
    /// 32-bit signed integer (packed quantized weights, group indices)
    I32,
    /// 32-bit unsigned integer (token ids, positions, masks)
    U32,
}

impl DType {
    /// Size of the dtype in bytes
    #[must_use]
    pub const fn size_in_bytes(self) -> usize {
        match self {
            Self::F32 | Self::I32 | Self::U32 => 4,
            Self::F16 | Self::BF16 => 2,
        }
    }

    /// Whether values of this dtype are floating point.
    ///
    /// Only floating point tensors are cast to the store dtype on load;
    /// integer tensors are returned verbatim.
    #[must_use]
    pub const fn is_float(self) -> bool {
        matches!(self, Self::F32 | Self::F16 | Self::BF16)
    }

    /// Convert from a safetensors dtype
    #[must_use]
    pub fn from_safetensors(dtype: safetensors::Dtype) -> Option<Self> {
        match dtype {
            safetensors::Dtype::F32 => Some(Self::F32),
            safetensors::Dtype::F16 => Some(Self::F16),
            safetensors::Dtype::BF16 => Some(Self::BF16),
            safetensors::Dtype::I32 => Some(Self::I32),
            safetensors::Dtype::U32 => Some(Self::U32),
            _ => None,
        }
    }

    /// Convert to the safetensors dtype used when serializing
    #[must_use]
    pub fn to_safetensors(self) -> safetensors::Dtype {
        match self {
            Self::F32 => safetensors::Dtype::F32,
            Self::F16 => safetensors::Dtype::F16,
            Self::BF16 => safetensors::Dtype::BF16,
            Self::I32 => safetensors::Dtype::I32,
            Self::U32 => safetensors::Dtype::U32,
        }
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::F32 => write!(f, "f32"),
            Self::F16 => write!(f, "f16"),
            Self::BF16 => write!(f, "bf16"),
            Self::I32 => write!(f, "i32"),
            Self::U32 => write!(f, "u32"),
        }
    }
}

/// Accepts the names used by Hugging Face configs (`float16`) as well as the
/// short forms printed by `Display`.
impl FromStr for DType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "f32" | "float32" | "float" => Ok(Self::F32),
            "f16" | "float16" | "half" => Ok(Self::F16),
            "bf16" | "bfloat16" => Ok(Self::BF16),
            other => Err(Error::UnsupportedDtype(format!(
                "{other} (expected float32, float16 or bfloat16)"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dtype_size_in_bytes() {
        assert_eq!(DType::F32.size_in_bytes(), 4);
        assert_eq!(DType::F16.size_in_bytes(), 2);
        assert_eq!(DType::BF16.size_in_bytes(), 2);
        assert_eq!(DType::I32.size_in_bytes(), 4);
        assert_eq!(DType::U32.size_in_bytes(), 4);
    }

    #[test]
    fn test_dtype_from_safetensors() {
        assert_eq!(
            DType::from_safetensors(safetensors::Dtype::BF16),
            Some(DType::BF16)
        );
        assert_eq!(
            DType::from_safetensors(safetensors::Dtype::I32),
            Some(DType::I32)
        );
        assert_eq!(DType::from_safetensors(safetensors::Dtype::F64), None);
    }

    #[test]
    fn test_dtype_parse() {
        assert_eq!("float16".parse::<DType>().unwrap(), DType::F16);
        assert_eq!("BF16".parse::<DType>().unwrap(), DType::BF16);
        assert_eq!("float32".parse::<DType>().unwrap(), DType::F32);
        assert!("int8".parse::<DType>().is_err());
        // Integer dtypes are storage-only and never a model precision.
        assert!("u32".parse::<DType>().is_err());
    }

    #[test]
    fn test_dtype_display() {
        assert_eq!(format!("{}", DType::F16), "f16");
        assert_eq!(format!("{}", DType::I32), "i32");
    }
}
