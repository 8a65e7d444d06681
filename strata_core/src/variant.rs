use crate::bitstream::BitStream;
use std::fmt;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum VariantError {
    #[error("Cannot convert a {from} value to {to}")]
    Unsupported { from: &'static str, to: &'static str },
    #[error("Value '{0}' is not a valid number")]
    NotANumber(String),
    #[error("Value {0} is out of range")]
    OutOfRange(String),
}

/// The value currency passed between elements, relations, fixups and transformers.
#[derive(Debug, Clone, PartialEq)]
pub enum Variant {
    Int(i64),
    ULong(u64),
    Double(f64),
    String(String),
    Bytes(Vec<u8>),
    Bits(BitStream),
}

fn parse_integer(text: &str) -> Result<i128, VariantError> {
    let trimmed = text.trim();
    let (negative, digits) = match trimmed.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, trimmed),
    };
    let parsed = match digits
        .strip_prefix("0x")
        .or_else(|| digits.strip_prefix("0X"))
    {
        Some(hex_digits) => i128::from_str_radix(hex_digits, 16),
        None => digits.parse::<i128>(),
    }
    .map_err(|_| VariantError::NotANumber(text.to_string()))?;
    Ok(if negative { -parsed } else { parsed })
}

impl Variant {
    pub fn type_name(&self) -> &'static str {
        match self {
            Variant::Int(_) => "integer",
            Variant::ULong(_) => "unsigned integer",
            Variant::Double(_) => "double",
            Variant::String(_) => "string",
            Variant::Bytes(_) => "byte string",
            Variant::Bits(_) => "bit stream",
        }
    }

    pub fn is_stream(&self) -> bool {
        matches!(self, Variant::Bytes(_) | Variant::Bits(_))
    }

    /// Widest signed view, used for range checks against a field width.
    pub fn to_i128(&self) -> Result<i128, VariantError> {
        match self {
            Variant::Int(v) => Ok(i128::from(*v)),
            Variant::ULong(v) => Ok(i128::from(*v)),
            Variant::Double(v) => Ok(v.trunc() as i128),
            Variant::String(s) => parse_integer(s),
            other => Err(VariantError::Unsupported {
                from: other.type_name(),
                to: "integer",
            }),
        }
    }

    pub fn to_i64(&self) -> Result<i64, VariantError> {
        let wide = self.to_i128()?;
        i64::try_from(wide).map_err(|_| VariantError::OutOfRange(wide.to_string()))
    }

    pub fn to_u64(&self) -> Result<u64, VariantError> {
        let wide = self.to_i128()?;
        u64::try_from(wide).map_err(|_| VariantError::OutOfRange(wide.to_string()))
    }

    pub fn to_f64(&self) -> Result<f64, VariantError> {
        match self {
            Variant::Int(v) => Ok(*v as f64),
            Variant::ULong(v) => Ok(*v as f64),
            Variant::Double(v) => Ok(*v),
            Variant::String(s) => s
                .trim()
                .parse::<f64>()
                .map_err(|_| VariantError::NotANumber(s.clone())),
            other => Err(VariantError::Unsupported {
                from: other.type_name(),
                to: "double",
            }),
        }
    }

    /// Textual view of scalar values. Streams have no text form.
    pub fn to_text(&self) -> Result<String, VariantError> {
        match self {
            Variant::String(s) => Ok(s.clone()),
            Variant::Int(v) => Ok(v.to_string()),
            Variant::ULong(v) => Ok(v.to_string()),
            Variant::Double(v) => Ok(v.to_string()),
            other => Err(VariantError::Unsupported {
                from: other.type_name(),
                to: "string",
            }),
        }
    }

    /// Raw bit view. Strings contribute their UTF-8 bytes.
    pub fn to_bitstream(&self) -> Result<BitStream, VariantError> {
        match self {
            Variant::Bits(bits) => {
                let mut copy = bits.clone();
                // position 0 always exists
                let _ = copy.seek(0);
                Ok(copy)
            }
            Variant::Bytes(bytes) => Ok(BitStream::from_bytes(bytes.clone())),
            Variant::String(s) => Ok(BitStream::from_bytes(s.as_bytes().to_vec())),
            other => Err(VariantError::Unsupported {
                from: other.type_name(),
                to: "bit stream",
            }),
        }
    }
}

impl fmt::Display for Variant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Variant::Int(v) => write!(f, "{v}"),
            Variant::ULong(v) => write!(f, "{v}"),
            Variant::Double(v) => write!(f, "{v}"),
            Variant::String(s) => write!(f, "{s}"),
            Variant::Bytes(bytes) => write!(f, "{}", hex::encode(bytes)),
            Variant::Bits(bits) => write!(f, "{bits}"),
        }
    }
}

impl From<i64> for Variant {
    fn from(v: i64) -> Self {
        Variant::Int(v)
    }
}

impl From<i32> for Variant {
    fn from(v: i32) -> Self {
        Variant::Int(i64::from(v))
    }
}

impl From<u64> for Variant {
    fn from(v: u64) -> Self {
        Variant::ULong(v)
    }
}

impl From<f64> for Variant {
    fn from(v: f64) -> Self {
        Variant::Double(v)
    }
}

impl From<&str> for Variant {
    fn from(v: &str) -> Self {
        Variant::String(v.to_string())
    }
}

impl From<String> for Variant {
    fn from(v: String) -> Self {
        Variant::String(v)
    }
}

impl From<Vec<u8>> for Variant {
    fn from(v: Vec<u8>) -> Self {
        Variant::Bytes(v)
    }
}

impl From<&[u8]> for Variant {
    fn from(v: &[u8]) -> Self {
        Variant::Bytes(v.to_vec())
    }
}

impl From<BitStream> for Variant {
    fn from(v: BitStream) -> Self {
        Variant::Bits(v)
    }
}
