//! Class name to constructor tables for fixups and transformers.

use crate::error::{StrataError, StrataResult};
use crate::fixup::{FixupAlgorithm, IsoFletcher16Checksum, Md5Digest, Sha256Digest};
use crate::transformer::{Base64EncodeTransformer, HexTransformer, TransformerAlgorithm};
use std::collections::BTreeMap;
use std::sync::Arc;

type Params = BTreeMap<String, String>;
type FixupFactory = fn() -> Arc<dyn FixupAlgorithm>;
type TransformerFactory = fn(&Params) -> StrataResult<Arc<dyn TransformerAlgorithm>>;

fn iso_fletcher16() -> Arc<dyn FixupAlgorithm> {
    Arc::new(IsoFletcher16Checksum)
}

fn md5() -> Arc<dyn FixupAlgorithm> {
    Arc::new(Md5Digest)
}

fn sha256() -> Arc<dyn FixupAlgorithm> {
    Arc::new(Sha256Digest)
}

fn hex(params: &Params) -> StrataResult<Arc<dyn TransformerAlgorithm>> {
    Ok(Arc::new(HexTransformer::new(params)?))
}

fn base64_encode(_: &Params) -> StrataResult<Arc<dyn TransformerAlgorithm>> {
    Ok(Arc::new(Base64EncodeTransformer))
}

static FIXUPS: &[(&str, FixupFactory)] = &[
    ("IsoFletcher16Checksum", iso_fletcher16),
    ("Md5", md5),
    ("Sha256", sha256),
];

static TRANSFORMERS: &[(&str, TransformerFactory)] =
    &[("Hex", hex), ("Base64Encode", base64_encode)];

pub fn fixup(class: &str) -> StrataResult<Arc<dyn FixupAlgorithm>> {
    FIXUPS
        .iter()
        .find(|(name, _)| *name == class)
        .map(|(_, factory)| factory())
        .ok_or_else(|| StrataError::construction(class, format!("Unknown fixup class '{class}'.")))
}

pub fn transformer(class: &str, params: &Params) -> StrataResult<Arc<dyn TransformerAlgorithm>> {
    match TRANSFORMERS.iter().find(|(name, _)| *name == class) {
        Some((_, factory)) => factory(params),
        None => Err(StrataError::construction(
            class,
            format!("Unknown transformer class '{class}'."),
        )),
    }
}

pub fn fixup_classes() -> impl Iterator<Item = &'static str> {
    FIXUPS.iter().map(|(name, _)| *name)
}

pub fn transformer_classes() -> impl Iterator<Item = &'static str> {
    TRANSFORMERS.iter().map(|(name, _)| *name)
}
