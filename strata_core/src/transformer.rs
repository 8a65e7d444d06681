//! Reversible encodings applied to an element's bits after generation and
//! undone before cracking.

use crate::bitstream::BitStream;
use crate::error::{StrataError, StrataResult};
use crate::registry;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

pub trait TransformerAlgorithm: Send + Sync + fmt::Debug {
    fn class(&self) -> &'static str;

    fn encode(&self, data: &BitStream) -> StrataResult<BitStream>;

    /// Fails with a soft error when `data` is not something `encode` produces.
    fn decode(&self, data: &BitStream) -> StrataResult<BitStream>;
}

#[derive(Debug)]
pub struct HexTransformer {
    lowercase: bool,
}

impl HexTransformer {
    pub fn new(params: &BTreeMap<String, String>) -> StrataResult<Self> {
        let lowercase = match params.get("lowercase").map(|v| v.to_ascii_lowercase()) {
            None => true,
            Some(v) if v == "true" => true,
            Some(v) if v == "false" => false,
            Some(v) => {
                return Err(StrataError::construction(
                    "Hex",
                    format!("Parameter 'lowercase' must be true or false, not '{v}'."),
                ));
            }
        };
        Ok(Self { lowercase })
    }
}

impl TransformerAlgorithm for HexTransformer {
    fn class(&self) -> &'static str {
        "Hex"
    }

    fn encode(&self, data: &BitStream) -> StrataResult<BitStream> {
        let text = if self.lowercase {
            hex::encode(data.as_bytes())
        } else {
            hex::encode_upper(data.as_bytes())
        };
        Ok(BitStream::from_bytes(text.into_bytes()))
    }

    fn decode(&self, data: &BitStream) -> StrataResult<BitStream> {
        hex::decode(data.as_bytes())
            .map(BitStream::from_bytes)
            .map_err(|e| StrataError::soft(format!("Hex transformer could not decode data: {e}")))
    }
}

#[derive(Debug, Default)]
pub struct Base64EncodeTransformer;

impl TransformerAlgorithm for Base64EncodeTransformer {
    fn class(&self) -> &'static str {
        "Base64Encode"
    }

    fn encode(&self, data: &BitStream) -> StrataResult<BitStream> {
        Ok(BitStream::from_bytes(STANDARD.encode(data.as_bytes()).into_bytes()))
    }

    fn decode(&self, data: &BitStream) -> StrataResult<BitStream> {
        STANDARD
            .decode(data.as_bytes())
            .map(BitStream::from_bytes)
            .map_err(|e| {
                StrataError::soft(format!("Base64Encode transformer could not decode data: {e}"))
            })
    }
}

/// A transformer and the optional one applied after it.
#[derive(Debug, Clone)]
pub struct Transformer {
    algorithm: Arc<dyn TransformerAlgorithm>,
    params: BTreeMap<String, String>,
    next: Option<Box<Transformer>>,
}

impl Transformer {
    pub fn new(class: &str, params: BTreeMap<String, String>) -> StrataResult<Self> {
        let algorithm = registry::transformer(class, &params)?;
        Ok(Self {
            algorithm,
            params,
            next: None,
        })
    }

    /// Appends `next` to the end of the chain.
    pub fn chain(mut self, next: Transformer) -> Self {
        match self.next.take() {
            Some(current) => self.next = Some(Box::new(current.chain(next))),
            None => self.next = Some(Box::new(next)),
        }
        self
    }

    pub fn class(&self) -> &'static str {
        self.algorithm.class()
    }

    pub fn params(&self) -> &BTreeMap<String, String> {
        &self.params
    }

    pub fn next(&self) -> Option<&Transformer> {
        self.next.as_deref()
    }

    pub fn encode(&self, data: &BitStream) -> StrataResult<BitStream> {
        let out = self.algorithm.encode(data)?;
        match &self.next {
            Some(next) => next.encode(&out),
            None => Ok(out),
        }
    }

    pub fn decode(&self, data: &BitStream) -> StrataResult<BitStream> {
        let inner = match &self.next {
            Some(next) => next.decode(data)?,
            None => data.clone(),
        };
        self.algorithm.decode(&inner)
    }
}
