use super::ElementId;
use super::LengthType;
use super::codec;
use crate::bitstream::BitStream;
use crate::error::{StrataError, StrataResult};
use crate::variant::Variant;
use std::sync::{Arc, OnceLock};

/// Byte order of multi-byte scalars.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Endian {
    #[default]
    Little,
    Big,
}

impl Endian {
    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag.to_ascii_lowercase().as_str() {
            "little" => Some(Endian::Little),
            "big" | "network" => Some(Endian::Big),
            _ => None,
        }
    }

    pub fn tag(self) -> &'static str {
        match self {
            Endian::Little => "little",
            Endian::Big => "big",
        }
    }
}

/// Text encodings supported by `String` elements.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StringType {
    #[default]
    Ascii,
    Utf8,
    /// Little endian UTF-16.
    Utf16,
    Utf16Be,
    /// Little endian UTF-32.
    Utf32,
}

impl StringType {
    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag.to_ascii_lowercase().as_str() {
            "ascii" => Some(StringType::Ascii),
            "utf8" | "utf-8" => Some(StringType::Utf8),
            "utf16" | "utf-16" => Some(StringType::Utf16),
            "utf16be" | "utf-16be" => Some(StringType::Utf16Be),
            "utf32" | "utf-32" => Some(StringType::Utf32),
            _ => None,
        }
    }

    pub fn tag(self) -> &'static str {
        match self {
            StringType::Ascii => "ascii",
            StringType::Utf8 => "utf8",
            StringType::Utf16 => "utf16",
            StringType::Utf16Be => "utf16be",
            StringType::Utf32 => "utf32",
        }
    }

    /// Width of one character in bits, `None` for variable width encodings.
    pub fn char_width_bits(self) -> Option<u64> {
        match self {
            StringType::Ascii => Some(8),
            StringType::Utf8 => None,
            StringType::Utf16 | StringType::Utf16Be => Some(16),
            StringType::Utf32 => Some(32),
        }
    }

    /// Width of the code unit used for the null terminator.
    pub fn unit_bytes(self) -> usize {
        match self {
            StringType::Ascii | StringType::Utf8 => 1,
            StringType::Utf16 | StringType::Utf16Be => 2,
            StringType::Utf32 => 4,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StringSpec {
    pub string_type: StringType,
    pub null_terminated: bool,
    pub pad_character: char,
}

impl Default for StringSpec {
    fn default() -> Self {
        Self {
            string_type: StringType::Ascii,
            null_terminated: false,
            pad_character: '\0',
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NumberSpec {
    pub size: u32,
    pub signed: bool,
    pub endian: Endian,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DoubleSpec {
    pub size: u32,
    pub endian: Endian,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlagsSpec {
    pub size: u32,
    pub endian: Endian,
}

/// A bit range inside a `Flags` container. `position` counts from the most
/// significant bit for big endian containers and from the least significant bit
/// for little endian ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlagSpec {
    pub position: u32,
    pub size: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaddingSpec {
    /// Alignment in bits.
    pub alignment: u64,
    pub aligned_to: Option<String>,
    /// Minimum generated size in bits.
    pub min_size: u64,
    pub(crate) bound: Option<ElementId>,
}

impl Default for PaddingSpec {
    fn default() -> Self {
        Self {
            alignment: 8,
            aligned_to: None,
            min_size: 0,
            bound: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct XmlSpec {
    /// Tag or attribute name written to the output.
    pub name: String,
    pub ns: Option<String>,
}

/// First token of a choice branch and the bit offset it sits at.
#[derive(Debug, Clone)]
pub(crate) struct ChoiceCacheEntry {
    pub(crate) member: ElementId,
    pub(crate) name: String,
    pub(crate) offset: u64,
    pub(crate) token: BitStream,
}

/// The authored alternatives of a choice.
///
/// Shared between a choice and its shallow clones. The token cache is computed
/// once per pool and reset whenever the member list changes.
#[derive(Debug, Clone, Default)]
pub struct ChoicePool {
    pub(crate) members: Vec<ElementId>,
    pub(crate) token_cache: OnceLock<Vec<ChoiceCacheEntry>>,
}

impl ChoicePool {
    pub fn members(&self) -> &[ElementId] {
        &self.members
    }
}

#[derive(Debug, Clone, Default)]
pub struct ChoiceState {
    pub(crate) pool: Arc<ChoicePool>,
    pub(crate) selected: Option<ElementId>,
}

impl ChoiceState {
    pub fn pool(&self) -> &ChoicePool {
        &self.pool
    }

    pub fn selected(&self) -> Option<ElementId> {
        self.selected
    }

    pub fn shares_pool_with(&self, other: &ChoiceState) -> bool {
        Arc::ptr_eq(&self.pool, &other.pool)
    }
}

#[derive(Debug, Clone)]
pub struct ArrayState {
    pub(crate) template: Option<ElementId>,
    pub min_occurs: u64,
    /// `None` is unbounded.
    pub max_occurs: Option<u64>,
    pub occurs: u64,
    pub(crate) expanded: bool,
    pub(crate) count_override: Option<u64>,
    pub(crate) override_value: Option<BitStream>,
}

impl Default for ArrayState {
    fn default() -> Self {
        Self {
            template: None,
            min_occurs: 1,
            max_occurs: Some(1),
            occurs: 1,
            expanded: false,
            count_override: None,
            override_value: None,
        }
    }
}

impl ArrayState {
    pub fn template(&self) -> Option<ElementId> {
        self.template
    }

    pub fn is_expanded(&self) -> bool {
        self.expanded
    }

    pub fn count_override(&self) -> Option<u64> {
        self.count_override
    }
}

#[derive(Debug, Clone, Default)]
pub struct SequenceState {
    pub(crate) count_override: Option<u64>,
    pub(crate) override_value: Option<BitStream>,
}

/// The element type together with its type specific state.
#[derive(Debug, Clone)]
pub enum ElementKind {
    Block,
    Choice(ChoiceState),
    Array(ArrayState),
    Sequence(SequenceState),
    Flags(FlagsSpec),
    Flag(FlagSpec),
    Blob,
    String(StringSpec),
    Number(NumberSpec),
    Double(DoubleSpec),
    Padding(PaddingSpec),
    XmlElement(XmlSpec),
    XmlAttribute(XmlSpec),
}

impl ElementKind {
    pub fn choice() -> Self {
        ElementKind::Choice(ChoiceState::default())
    }

    pub fn array() -> Self {
        ElementKind::Array(ArrayState::default())
    }

    pub fn sequence() -> Self {
        ElementKind::Sequence(SequenceState::default())
    }

    pub fn string(string_type: StringType) -> Self {
        ElementKind::String(StringSpec {
            string_type,
            ..StringSpec::default()
        })
    }

    pub fn number(size: u32, signed: bool, endian: Endian) -> Self {
        ElementKind::Number(NumberSpec {
            size,
            signed,
            endian,
        })
    }

    pub fn double(size: u32, endian: Endian) -> Self {
        ElementKind::Double(DoubleSpec { size, endian })
    }

    pub fn flags(size: u32, endian: Endian) -> Self {
        ElementKind::Flags(FlagsSpec { size, endian })
    }

    pub fn flag(position: u32, size: u32) -> Self {
        ElementKind::Flag(FlagSpec { position, size })
    }

    pub fn padding(alignment: u64) -> Self {
        ElementKind::Padding(PaddingSpec {
            alignment,
            ..PaddingSpec::default()
        })
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            ElementKind::Block => "Block",
            ElementKind::Choice(_) => "Choice",
            ElementKind::Array(_) => "Array",
            ElementKind::Sequence(_) => "Sequence",
            ElementKind::Flags(_) => "Flags",
            ElementKind::Flag(_) => "Flag",
            ElementKind::Blob => "Blob",
            ElementKind::String(_) => "String",
            ElementKind::Number(_) => "Number",
            ElementKind::Double(_) => "Double",
            ElementKind::Padding(_) => "Padding",
            ElementKind::XmlElement(_) => "XmlElement",
            ElementKind::XmlAttribute(_) => "XmlAttribute",
        }
    }

    pub fn is_container(&self) -> bool {
        matches!(
            self,
            ElementKind::Block
                | ElementKind::Choice(_)
                | ElementKind::Array(_)
                | ElementKind::Sequence(_)
                | ElementKind::Flags(_)
                | ElementKind::XmlElement(_)
                | ElementKind::XmlAttribute(_)
        )
    }

    /// Bit width fixed by the type itself, independent of any declared length.
    pub fn intrinsic_bits(&self) -> Option<u64> {
        match self {
            ElementKind::Number(spec) => Some(u64::from(spec.size)),
            ElementKind::Double(spec) => Some(u64::from(spec.size)),
            ElementKind::Flags(spec) => Some(u64::from(spec.size)),
            ElementKind::Flag(spec) => Some(u64::from(spec.size)),
            _ => None,
        }
    }

    /// Rejects type parameters no element of this type can have.
    pub(crate) fn validate(&self, path: &str) -> StrataResult<()> {
        match self {
            ElementKind::Number(spec) if !(1..=64).contains(&spec.size) => {
                Err(StrataError::construction(
                    path,
                    format!("Unsupported number size '{}'.", spec.size),
                ))
            }
            ElementKind::Double(spec) if spec.size != 32 && spec.size != 64 => {
                Err(StrataError::construction(
                    path,
                    format!("Unsupported double size '{}'.", spec.size),
                ))
            }
            ElementKind::Flags(spec) if !(1..=64).contains(&spec.size) => {
                Err(StrataError::construction(
                    path,
                    format!("Unsupported flags size '{}'.", spec.size),
                ))
            }
            ElementKind::Flag(spec) if spec.size == 0 || spec.size > 64 => {
                Err(StrataError::construction(
                    path,
                    format!("Unsupported flag size '{}'.", spec.size),
                ))
            }
            ElementKind::Padding(spec) if spec.alignment == 0 => Err(StrataError::construction(
                path,
                "Padding alignment must be greater than zero.",
            )),
            _ => Ok(()),
        }
    }
}

/// Inclusive range of an integer field.
pub(crate) fn integer_range(size: u32, signed: bool) -> (i128, i128) {
    let size = i128::from(size);
    if signed {
        (-(1i128 << (size - 1)), (1i128 << (size - 1)) - 1)
    } else {
        (0, (1i128 << size) - 1)
    }
}

fn integer_variant(value: i128) -> Variant {
    match i64::try_from(value) {
        Ok(v) => Variant::Int(v),
        Err(_) => Variant::ULong(value as u64),
    }
}

fn sanitize_integer(path: &str, value: &Variant, size: u32, signed: bool) -> StrataResult<Variant> {
    let wide = value
        .to_i128()
        .map_err(|e| StrataError::sanitize(path, e.to_string()))?;
    let (min, max) = integer_range(size, signed);
    if wide < min || wide > max {
        return Err(StrataError::sanitize(
            path,
            format!("Value '{wide}' is outside the range {min}..={max} of a {size}-bit field."),
        ));
    }
    Ok(integer_variant(wide))
}

fn declared_bytes(length: Option<u64>, length_type: LengthType) -> Option<u64> {
    match (length, length_type) {
        (Some(len), LengthType::Bytes) => Some(len),
        (Some(len), LengthType::Bits) if len % 8 == 0 => Some(len / 8),
        _ => None,
    }
}

fn sanitize_blob(
    path: &str,
    value: &Variant,
    length: Option<u64>,
    length_type: LengthType,
) -> StrataResult<Variant> {
    let mut bits = match value {
        Variant::Bits(bits) => return Ok(Variant::Bits(bits.clone())),
        Variant::Bytes(bytes) => bytes.clone(),
        Variant::String(text) => text
            .chars()
            .map(|c| {
                u8::try_from(u32::from(c)).map_err(|_| {
                    StrataError::sanitize(
                        path,
                        format!("Character '{c}' is not representable as a byte."),
                    )
                })
            })
            .collect::<StrataResult<Vec<u8>>>()?,
        other => {
            return Err(StrataError::sanitize(
                path,
                format!("A blob cannot hold a {} value.", other.type_name()),
            ));
        }
    };
    if let Some(want) = declared_bytes(length, length_type) {
        let want = want as usize;
        if bits.len() > want {
            return Err(StrataError::sanitize(
                path,
                format!("Value is {} bytes but the declared length is {want} bytes.", bits.len()),
            ));
        }
        bits.resize(want, 0);
    }
    Ok(Variant::Bytes(bits))
}

fn sanitize_string(
    path: &str,
    spec: &StringSpec,
    value: &Variant,
    length: Option<u64>,
    length_type: LengthType,
) -> StrataResult<Variant> {
    let mut text = value
        .to_text()
        .map_err(|e| StrataError::sanitize(path, e.to_string()))?;
    codec::encode_string(&text, spec.string_type).map_err(|e| StrataError::sanitize(path, e))?;

    let Some(length) = length else {
        return Ok(Variant::String(text));
    };
    match length_type {
        LengthType::Chars => {
            let have = text.chars().count() as u64;
            if have > length {
                return Err(StrataError::sanitize(
                    path,
                    format!(
                        "Value is {have} characters but the declared length is {length} characters."
                    ),
                ));
            }
            text.extend(std::iter::repeat_n(spec.pad_character, (length - have) as usize));
        }
        LengthType::Bytes | LengthType::Bits => {
            let want = if length_type == LengthType::Bytes { length * 8 } else { length };
            let pad_bits = codec::encode_string(&spec.pad_character.to_string(), spec.string_type)
                .map_err(|e| StrataError::sanitize(path, e))?
                .len() as u64
                * 8;
            let mut have = codec::encode_string(&text, spec.string_type)
                .map_err(|e| StrataError::sanitize(path, e))?
                .len() as u64
                * 8;
            if have > want {
                return Err(StrataError::sanitize(
                    path,
                    format!("Value is {have} bits but the declared length is {want} bits."),
                ));
            }
            while have + pad_bits <= want {
                text.push(spec.pad_character);
                have += pad_bits;
            }
            if have != want {
                return Err(StrataError::sanitize(
                    path,
                    format!("Value cannot be padded to exactly {want} bits."),
                ));
            }
        }
    }
    Ok(Variant::String(text))
}

/// Coerces `value` to the representation the element type stores, failing at
/// assignment time when it cannot.
pub(crate) fn sanitize(
    kind: &ElementKind,
    path: &str,
    value: &Variant,
    length: Option<u64>,
    length_type: LengthType,
) -> StrataResult<Variant> {
    match kind {
        ElementKind::Blob => sanitize_blob(path, value, length, length_type),
        ElementKind::String(spec) => sanitize_string(path, spec, value, length, length_type),
        ElementKind::Number(spec) => sanitize_integer(path, value, spec.size, spec.signed),
        ElementKind::Flag(spec) => sanitize_integer(path, value, spec.size, false),
        ElementKind::Double(_) => value
            .to_f64()
            .map(Variant::Double)
            .map_err(|e| StrataError::sanitize(path, e.to_string())),
        other => Err(StrataError::sanitize(
            path,
            format!("{} elements do not accept a default value.", other.type_name()),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn number_range_is_checked_at_assignment() {
        let kind = ElementKind::number(8, false, Endian::Big);
        assert_eq!(
            sanitize(&kind, "M.n", &Variant::from("0xff"), None, LengthType::Bytes).unwrap(),
            Variant::Int(255)
        );
        let err = sanitize(&kind, "M.n", &Variant::Int(256), None, LengthType::Bytes).unwrap_err();
        assert!(
            err.to_string().starts_with("Error, M.n:"),
            "Sanitize errors carry the element path, got: {err}"
        );

        let signed = ElementKind::number(8, true, Endian::Big);
        assert!(sanitize(&signed, "M.n", &Variant::Int(-128), None, LengthType::Bytes).is_ok());
        assert!(sanitize(&signed, "M.n", &Variant::Int(128), None, LengthType::Bytes).is_err());
    }

    #[test]
    fn wide_unsigned_values_are_stored_as_ulong() {
        let kind = ElementKind::number(64, false, Endian::Little);
        let value =
            sanitize(&kind, "M.n", &Variant::ULong(u64::MAX), None, LengthType::Bytes).unwrap();
        assert_eq!(value, Variant::ULong(u64::MAX));
    }

    #[test]
    fn blob_rejects_non_latin1_text() {
        let ok = sanitize(
            &ElementKind::Blob,
            "M.b",
            &Variant::from("\u{ff}A"),
            None,
            LengthType::Bytes,
        );
        assert_eq!(ok.unwrap(), Variant::Bytes(vec![0xff, b'A']));
        let err = sanitize(
            &ElementKind::Blob,
            "M.b",
            &Variant::from("\u{100}"),
            None,
            LengthType::Bytes,
        );
        assert!(err.is_err(), "U+0100 has no single byte form");
    }

    #[test]
    fn string_pads_to_declared_length_and_rejects_overflow() {
        let spec = StringSpec {
            pad_character: ' ',
            ..StringSpec::default()
        };
        let kind = ElementKind::String(spec);
        let padded =
            sanitize(&kind, "M.s", &Variant::from("ab"), Some(4), LengthType::Bytes).unwrap();
        assert_eq!(padded, Variant::from("ab  "));
        assert!(
            sanitize(&kind, "M.s", &Variant::from("abcde"), Some(4), LengthType::Bytes).is_err()
        );

        let numeric = sanitize(&kind, "M.s", &Variant::Int(42), None, LengthType::Bytes).unwrap();
        assert_eq!(numeric, Variant::from("42"), "Numbers are formatted in decimal");
    }

    #[test]
    fn containers_refuse_default_values() {
        let err = sanitize(&ElementKind::Block, "M", &Variant::Int(1), None, LengthType::Bytes)
            .unwrap_err();
        assert!(matches!(err, StrataError::Sanitize { .. }));
    }

    #[test]
    fn construction_validation_rejects_bad_sizes() {
        assert!(ElementKind::number(65, false, Endian::Big).validate("M.n").is_err());
        assert!(ElementKind::double(16, Endian::Big).validate("M.d").is_err());
        assert!(ElementKind::padding(0).validate("M.p").is_err());
        assert!(ElementKind::flags(16, Endian::Little).validate("M.f").is_ok());
    }
}
