//! Fixups derive an element's value from the materialized bits of the
//! element named by their `ref` parameter, typically a checksum or digest of
//! an enclosing block.

use crate::bitstream::BitStream;
use crate::dom::ElementId;
use crate::error::{StrataError, StrataResult};
use crate::registry;
use crate::variant::Variant;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::sync::Arc;

/// What a fixup algorithm sees when it runs.
#[derive(Debug, Clone)]
pub struct FixupInput {
    /// Final value of the referenced element.
    pub data: BitStream,
    /// Bit position of the fixup's owner inside `data`, when the owner lies
    /// within the referenced element and its position can be determined.
    pub owner_offset: Option<u64>,
}

/// A fixup implementation registered under a class name.
pub trait FixupAlgorithm: Send + Sync + fmt::Debug {
    fn class(&self) -> &'static str;

    fn compute(&self, input: &FixupInput) -> StrataResult<Variant>;
}

/// RFC 1008 section 7.2.1 checksum. The two checksum bytes are treated as
/// zero while summing, so the checksum must sit byte aligned inside the data.
#[derive(Debug, Default)]
pub struct IsoFletcher16Checksum;

impl FixupAlgorithm for IsoFletcher16Checksum {
    fn class(&self) -> &'static str {
        "IsoFletcher16Checksum"
    }

    fn compute(&self, input: &FixupInput) -> StrataResult<Variant> {
        // Unknown positions checksum as if the owner sat at offset zero.
        let offset = input.owner_offset.map(|bits| bits / 8).unwrap_or(0) as usize;
        let bytes = input.data.as_bytes();

        let (mut sum1, mut sum2) = (0i64, 0i64);
        for (i, byte) in bytes.iter().enumerate() {
            let b = if i == offset || i == offset + 1 { 0 } else { i64::from(*byte) };
            sum1 = (sum1 + b) % 255;
            sum2 = (sum2 + sum1) % 255;
        }

        let mut x = ((bytes.len() as i64 - offset as i64 - 1) * sum1 - sum2) % 255;
        if x <= 0 {
            x += 255;
        }
        let mut y = 510 - sum1 - x;
        if y > 255 {
            y -= 255;
        }
        Ok(Variant::Int(((x << 8) | (y & 0xff)) & 0xffff))
    }
}

#[derive(Debug, Default)]
pub struct Md5Digest;

impl FixupAlgorithm for Md5Digest {
    fn class(&self) -> &'static str {
        "Md5"
    }

    fn compute(&self, input: &FixupInput) -> StrataResult<Variant> {
        let digest = md5::compute(input.data.as_bytes());
        Ok(Variant::Bytes(digest.0.to_vec()))
    }
}

#[derive(Debug, Default)]
pub struct Sha256Digest;

impl FixupAlgorithm for Sha256Digest {
    fn class(&self) -> &'static str {
        "Sha256"
    }

    fn compute(&self, input: &FixupInput) -> StrataResult<Variant> {
        let digest = Sha256::digest(input.data.as_bytes());
        Ok(Variant::Bytes(digest.to_vec()))
    }
}

/// A fixup attached to an element: the algorithm, its parameters and the
/// lazily resolved `ref` binding.
#[derive(Debug, Clone)]
pub struct Fixup {
    algorithm: Arc<dyn FixupAlgorithm>,
    params: BTreeMap<String, String>,
    bound: Option<ElementId>,
}

impl Fixup {
    /// Looks `class` up in the registry. Every fixup needs a `ref` parameter.
    pub fn new(class: &str, params: BTreeMap<String, String>) -> StrataResult<Self> {
        let algorithm = registry::fixup(class)?;
        if !params.contains_key("ref") {
            return Err(StrataError::construction(
                class,
                format!("{class} fixup is missing required parameter 'ref'."),
            ));
        }
        Ok(Self {
            algorithm,
            params,
            bound: None,
        })
    }

    pub fn class(&self) -> &'static str {
        self.algorithm.class()
    }

    pub fn params(&self) -> &BTreeMap<String, String> {
        &self.params
    }

    pub fn reference(&self) -> &str {
        self.params.get("ref").map(String::as_str).unwrap_or_default()
    }

    /// Points `ref` somewhere else and drops the current binding.
    pub(crate) fn set_reference(&mut self, reference: String) {
        self.params.insert("ref".to_string(), reference);
        self.bound = None;
    }

    pub(crate) fn bound_ref(&self) -> Option<ElementId> {
        self.bound
    }

    /// Elements whose changes invalidate the fixup's owner.
    pub(crate) fn bound(&self) -> Vec<ElementId> {
        self.bound.into_iter().collect()
    }

    pub(crate) fn bind(&mut self, target: ElementId) {
        self.bound = Some(target);
    }

    pub(crate) fn take_bindings(&mut self) -> Vec<ElementId> {
        self.bound.take().into_iter().collect()
    }

    /// Drops bindings to elements that no longer exist.
    pub(crate) fn forget(&mut self, freed: &HashSet<ElementId>) {
        if self.bound.is_some_and(|b| freed.contains(&b)) {
            self.bound = None;
        }
    }

    pub(crate) fn compute(&self, input: &FixupInput) -> StrataResult<Variant> {
        self.algorithm.compute(input)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn input(bytes: &[u8], owner_offset: Option<u64>) -> FixupInput {
        FixupInput {
            data: BitStream::from_bytes(bytes.to_vec()),
            owner_offset,
        }
    }

    #[test]
    fn fletcher_skips_its_own_bytes() {
        let data = [0x01, 0x02, 0xaa, 0xbb, 0x03];
        let zeroed = [0x01, 0x02, 0x00, 0x00, 0x03];
        let algo = IsoFletcher16Checksum;
        assert_eq!(
            algo.compute(&input(&data, Some(16))).unwrap(),
            algo.compute(&input(&zeroed, Some(16))).unwrap(),
            "Bytes under the checksum must not influence the result"
        );
    }

    #[test]
    fn digests_match_reference_values() {
        let md5 = Md5Digest.compute(&input(b"abc", None)).unwrap();
        assert_eq!(
            hex::encode(md5.to_bitstream().unwrap().as_bytes()),
            "900150983cd24fb0d6963f7d28e17f72"
        );

        let sha = Sha256Digest.compute(&input(b"abc", None)).unwrap();
        assert_eq!(
            hex::encode(sha.to_bitstream().unwrap().as_bytes()),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn construction_requires_a_ref() {
        let err = Fixup::new("Md5", BTreeMap::new()).unwrap_err();
        assert!(err.to_string().contains("missing required parameter 'ref'"));
        assert!(Fixup::new("Crc64", BTreeMap::new()).is_err());
    }
}
