//! TOML model descriptions.
//!
//! A description is a root `name` plus a list of element tables, each with a
//! `type` and the attributes that type understands:
//!
//! ```toml
//! name = "Record"
//!
//! [[children]]
//! type = "Number"
//! name = "len"
//! size = 8
//! relations = [{ type = "size", of = "data" }]
//!
//! [[children]]
//! type = "String"
//! name = "data"
//! value = "hello"
//! ```
//!
//! Building goes through the public tree-construction API only. An element
//! that carries `occurs`, `min-occurs` or `max-occurs` is wrapped in an array of
//! the same name, with the element itself as the array's template.

use crate::config::EngineConfig;
use crate::dom::{DataModel, ElementId, ElementKind, Endian, LengthType, StringType, XmlSpec};
use crate::error::{StrataError, StrataResult};
use crate::fixup::Fixup;
use crate::relation::RelationKind;
use crate::transformer::Transformer;
use crate::variant::Variant;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::PathBuf;
use tracing::debug;

#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct ModelDef {
    pub name: String,
    #[serde(default)]
    pub children: Vec<ElementDef>,
}

/// A default value as written in TOML. Strings are interpreted according to
/// the element's `value-type`.
#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(untagged)]
pub enum ValueDef {
    Integer(i64),
    Float(f64),
    Text(String),
}

#[derive(Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct ElementDef {
    #[serde(rename = "type")]
    pub element_type: String,
    pub name: String,
    pub field_id: Option<String>,
    pub value: Option<ValueDef>,
    /// `string` (default) or `hex`.
    pub value_type: Option<String>,
    pub length: Option<u64>,
    pub length_type: Option<String>,
    #[serde(default)]
    pub token: bool,
    pub mutable: Option<bool>,
    pub constraint: Option<String>,

    pub occurs: Option<u64>,
    pub min_occurs: Option<u64>,
    /// `-1` is unbounded.
    pub max_occurs: Option<i64>,

    pub size: Option<u32>,
    pub signed: Option<bool>,
    pub endian: Option<String>,
    pub string_type: Option<String>,
    pub null_terminated: Option<bool>,
    pub pad_character: Option<String>,
    pub position: Option<u32>,
    pub alignment: Option<u64>,
    pub aligned_to: Option<String>,
    pub min_size: Option<u64>,
    pub element_name: Option<String>,
    pub attribute_name: Option<String>,
    pub ns: Option<String>,

    #[serde(default)]
    pub children: Vec<ElementDef>,
    #[serde(default)]
    pub relations: Vec<RelationDef>,
    pub fixup: Option<FixupDef>,
    pub transformer: Option<TransformerDef>,
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct RelationDef {
    /// `size`, `count` or `offset`.
    #[serde(rename = "type")]
    pub kind: String,
    pub of: String,
    pub length_type: Option<String>,
    #[serde(default)]
    pub relative: bool,
    pub relative_to: Option<String>,
    pub expression_get: Option<String>,
    pub expression_set: Option<String>,
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct FixupDef {
    pub class: String,
    #[serde(default)]
    pub params: BTreeMap<String, String>,
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct TransformerDef {
    pub class: String,
    #[serde(default)]
    pub params: BTreeMap<String, String>,
    pub another_transformer: Option<Box<TransformerDef>>,
}

impl ModelDef {
    pub fn from_toml(text: &str) -> Result<Self, anyhow::Error> {
        toml::from_str(text)
            .map_err(|e| anyhow::anyhow!("Failed to parse model description: {}", e))
    }

    pub fn load_from_file(path: &PathBuf) -> Result<Self, anyhow::Error> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read model file at {:?}: {}", path, e))?;

        toml::from_str(&content)
            .map_err(|e| anyhow::anyhow!("Failed to parse TOML from model file {:?}: {}", path, e))
    }

    pub fn build(&self) -> StrataResult<DataModel> {
        self.build_with_config(EngineConfig::default())
    }

    pub fn build_with_config(&self, config: EngineConfig) -> StrataResult<DataModel> {
        let mut model = DataModel::with_config(&self.name, config)?;
        let root = model.root();
        for child in &self.children {
            build_element(&mut model, root, child)?;
        }
        model.bind_all();
        debug!(model = %self.name, elements = model.len(), "Built model");
        Ok(model)
    }
}

fn build_element(
    model: &mut DataModel,
    parent: ElementId,
    def: &ElementDef,
) -> StrataResult<ElementId> {
    let path = format!("{}.{}", model[parent].full_name(), def.name);
    let kind = def.kind(&path)?;

    let array = if def.occurs.is_some() || def.min_occurs.is_some() || def.max_occurs.is_some() {
        Some(model.add_element(parent, &def.name, ElementKind::array())?)
    } else {
        None
    };
    let id = model.add_element(array.unwrap_or(parent), &def.name, kind)?;

    if let Some(array) = array {
        let (min, max, occurs) = def.occurrences(&path)?;
        model.set_occurs(array, min, max, occurs)?;
        if let Some(mutable) = def.mutable {
            model.set_mutable(array, mutable);
        }
    }

    model.set_field_id(id, def.field_id.as_deref());
    if let Some(length) = def.length {
        model.set_length(id, Some(length), length_type(&path, def.length_type.as_deref())?)?;
    }
    if def.token {
        model.set_token(id, true);
    }
    if let Some(mutable) = def.mutable {
        model.set_mutable(id, mutable);
    }
    model.set_constraint(id, def.constraint.as_deref());
    if def.aligned_to.is_some() {
        model.set_aligned_to(id, def.aligned_to.as_deref())?;
    }

    for child in &def.children {
        build_element(model, id, child)?;
    }

    // Sanitized against the length set above.
    if let Some(value) = &def.value {
        let value = def.variant(&path, value)?;
        model.set_default_value(id, value)?;
    }

    for relation in &def.relations {
        let kind = relation.kind(&path)?;
        let rel = model.add_relation(id, kind, &relation.of);
        if relation.expression_get.is_some() || relation.expression_set.is_some() {
            model.set_relation_expressions(
                rel,
                relation.expression_get.as_deref(),
                relation.expression_set.as_deref(),
            );
        }
    }
    if let Some(fixup) = &def.fixup {
        model.set_fixup(id, Some(Fixup::new(&fixup.class, fixup.params.clone())?));
    }
    if let Some(transformer) = &def.transformer {
        model.set_transformer(id, Some(transformer.build()?));
    }
    Ok(id)
}

fn length_type(path: &str, tag: Option<&str>) -> StrataResult<LengthType> {
    match tag {
        None => Ok(LengthType::Bytes),
        Some(tag) => LengthType::from_tag(tag).ok_or_else(|| {
            StrataError::construction(path, format!("Unknown length type '{tag}'."))
        }),
    }
}

fn endian(path: &str, tag: Option<&str>) -> StrataResult<Endian> {
    match tag {
        None => Ok(Endian::default()),
        Some(tag) => Endian::from_tag(tag)
            .ok_or_else(|| StrataError::construction(path, format!("Unknown endian '{tag}'."))),
    }
}

impl ElementDef {
    fn required<T: Copy>(&self, path: &str, value: Option<T>, attribute: &str) -> StrataResult<T> {
        value.ok_or_else(|| {
            StrataError::construction(
                path,
                format!("{} elements require the '{attribute}' attribute.", self.element_type),
            )
        })
    }

    fn kind(&self, path: &str) -> StrataResult<ElementKind> {
        let kind = match self.element_type.as_str() {
            "Block" => ElementKind::Block,
            "Choice" => ElementKind::choice(),
            "Sequence" => ElementKind::sequence(),
            "Blob" => ElementKind::Blob,
            "Number" => ElementKind::number(
                self.required(path, self.size, "size")?,
                self.signed.unwrap_or(false),
                endian(path, self.endian.as_deref())?,
            ),
            "Double" => ElementKind::double(
                self.required(path, self.size, "size")?,
                endian(path, self.endian.as_deref())?,
            ),
            "Flags" => ElementKind::flags(
                self.required(path, self.size, "size")?,
                endian(path, self.endian.as_deref())?,
            ),
            "Flag" => ElementKind::flag(
                self.required(path, self.position, "position")?,
                self.required(path, self.size, "size")?,
            ),
            "String" => {
                let string_type = match self.string_type.as_deref() {
                    None => StringType::default(),
                    Some(tag) => StringType::from_tag(tag).ok_or_else(|| {
                        StrataError::construction(path, format!("Unknown string type '{tag}'."))
                    })?,
                };
                let mut kind = ElementKind::string(string_type);
                if let ElementKind::String(spec) = &mut kind {
                    spec.null_terminated = self.null_terminated.unwrap_or(false);
                    if let Some(pad) = &self.pad_character {
                        let mut chars = pad.chars();
                        match (chars.next(), chars.next()) {
                            (Some(c), None) => spec.pad_character = c,
                            _ => {
                                return Err(StrataError::construction(
                                    path,
                                    format!("Pad character '{pad}' must be a single character."),
                                ));
                            }
                        }
                    }
                }
                kind
            }
            "Padding" => {
                let mut kind = ElementKind::padding(self.alignment.unwrap_or(8));
                if let ElementKind::Padding(spec) = &mut kind {
                    spec.min_size = self.min_size.unwrap_or(0);
                }
                kind
            }
            "XmlElement" => ElementKind::XmlElement(XmlSpec {
                name: self.xml_name(path, self.element_name.as_deref(), "element-name")?,
                ns: self.ns.clone(),
            }),
            "XmlAttribute" => ElementKind::XmlAttribute(XmlSpec {
                name: self.xml_name(path, self.attribute_name.as_deref(), "attribute-name")?,
                ns: self.ns.clone(),
            }),
            other => {
                return Err(StrataError::construction(
                    path,
                    format!("Unknown element type '{other}'."),
                ));
            }
        };
        Ok(kind)
    }

    fn xml_name(&self, path: &str, name: Option<&str>, attribute: &str) -> StrataResult<String> {
        name.map(str::to_string).ok_or_else(|| {
            StrataError::construction(
                path,
                format!("{} elements require the '{attribute}' attribute.", self.element_type),
            )
        })
    }

    /// `min-occurs` alone leaves the array unbounded and generating `min` items.
    fn occurrences(&self, path: &str) -> StrataResult<(u64, Option<u64>, u64)> {
        let (mut min, mut max, mut occurs) = (1, Some(1), 1);
        if let Some(min_occurs) = self.min_occurs {
            min = min_occurs;
            max = None;
            occurs = min_occurs;
        }
        match self.max_occurs {
            None => {}
            Some(-1) => max = None,
            Some(value) => {
                max = Some(u64::try_from(value).map_err(|_| {
                    StrataError::construction(
                        path,
                        format!("maxOccurs {value} is not a valid bound."),
                    )
                })?);
            }
        }
        if let Some(value) = self.occurs {
            occurs = value;
        }
        Ok((min, max, occurs))
    }

    fn variant(&self, path: &str, value: &ValueDef) -> StrataResult<Variant> {
        match (self.value_type.as_deref().unwrap_or("string"), value) {
            ("hex", ValueDef::Text(text)) => {
                let compact: String = text.chars().filter(|c| !c.is_whitespace()).collect();
                hex::decode(&compact)
                    .map(Variant::Bytes)
                    .map_err(|e| {
                        StrataError::construction(path, format!("Invalid hex value '{text}': {e}."))
                    })
            }
            ("hex", _) => Err(StrataError::construction(
                path,
                "Hex values must be written as strings.",
            )),
            ("string", ValueDef::Integer(v)) => Ok(Variant::Int(*v)),
            ("string", ValueDef::Float(v)) => Ok(Variant::Double(*v)),
            ("string", ValueDef::Text(text)) => Ok(Variant::String(text.clone())),
            (other, _) => Err(StrataError::construction(
                path,
                format!("Unknown value type '{other}'."),
            )),
        }
    }
}

impl RelationDef {
    fn kind(&self, path: &str) -> StrataResult<RelationKind> {
        match self.kind.as_str() {
            "size" => Ok(RelationKind::Size {
                length_type: length_type(path, self.length_type.as_deref())?,
            }),
            "count" => Ok(RelationKind::Count),
            "offset" => Ok(RelationKind::Offset {
                relative: self.relative || self.relative_to.is_some(),
                relative_to: self.relative_to.clone(),
            }),
            other => Err(StrataError::construction(
                path,
                format!("Unknown relation type '{other}'."),
            )),
        }
    }
}

impl TransformerDef {
    fn build(&self) -> StrataResult<Transformer> {
        let transformer = Transformer::new(&self.class, self.params.clone())?;
        match &self.another_transformer {
            Some(next) => Ok(transformer.chain(next.build()?)),
            None => Ok(transformer),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bitstream::BitStream;

    fn build(text: &str) -> DataModel {
        ModelDef::from_toml(text).unwrap().build().unwrap()
    }

    #[test]
    fn size_relation_prefixes_the_payload() {
        let mut model = build(
            r#"
            name = "Record"

            [[children]]
            type = "Number"
            name = "len"
            size = 8
            relations = [{ type = "size", of = "data" }]

            [[children]]
            type = "String"
            name = "data"
            value = "hello"
            "#,
        );
        let root = model.root();
        assert_eq!(model.value(root).unwrap().as_bytes(), b"\x05hello");
    }

    #[test]
    fn occurrence_attributes_wrap_the_element_in_an_array() {
        let mut model = build(
            r#"
            name = "Model"

            [[children]]
            type = "Number"
            name = "n"
            size = 8
            value = 7
            min-occurs = 0
            occurs = 3
            "#,
        );
        let array = model.element_by_full_name("Model.n").unwrap();
        let ElementKind::Array(state) = model[array].kind() else {
            panic!("Expected an array, got {}", model[array].type_name());
        };
        assert_eq!((state.min_occurs, state.max_occurs, state.occurs), (0, None, 3));
        let template = state.template().unwrap();
        assert_eq!(model[template].name(), "n");
        assert_eq!(model.value(array).unwrap().as_bytes(), &[7, 7, 7]);
    }

    #[test]
    fn transformers_chain_and_fixups_keep_their_params() {
        let model = build(
            r#"
            name = "Model"

            [[children]]
            type = "Blob"
            name = "digest"
            fixup = { class = "Md5", params = { ref = "data" } }

            [[children]]
            type = "Blob"
            name = "data"
            value = "de ad be ef"
            value-type = "hex"

            [children.transformer]
            class = "Hex"
            params = { lowercase = "false" }
            another-transformer = { class = "Base64Encode" }
            "#,
        );
        let data = model.element_by_full_name("Model.data").unwrap();
        assert_eq!(
            model[data].default_value(),
            Some(&Variant::Bytes(vec![0xde, 0xad, 0xbe, 0xef]))
        );
        let transformer = model[data].transformer().unwrap();
        assert_eq!(transformer.class(), "Hex");
        assert_eq!(transformer.params().get("lowercase").map(String::as_str), Some("false"));
        assert_eq!(transformer.next().map(|t| t.class()), Some("Base64Encode"));

        let digest = model.element_by_full_name("Model.digest").unwrap();
        let fixup = model[digest].fixup().unwrap();
        assert_eq!(fixup.class(), "Md5");
        assert_eq!(fixup.reference(), "data");
    }

    #[test]
    fn cracks_into_the_option_whose_token_matches() {
        let mut model = build(
            r#"
            name = "Model"

            [[children]]
            type = "Choice"
            name = "C"

            [[children.children]]
            type = "Blob"
            name = "A"
            value = "AA"
            token = true

            [[children.children]]
            type = "Blob"
            name = "B"
            value = "BB"
            token = true
            "#,
        );
        model.crack(&mut BitStream::from_bytes(b"BB".to_vec())).unwrap();
        let choice = model.element_by_full_name("Model.C").unwrap();
        let selected = model.selected(choice).unwrap();
        assert_eq!(model[selected].name(), "B");
    }

    #[test]
    fn built_models_write_back_to_pit() {
        let model = build(
            r#"
            name = "Model"

            [[children]]
            type = "Number"
            name = "n"
            size = 16
            endian = "big"
            max-occurs = -1
            min-occurs = 2
            "#,
        );
        let pit = model.write_pit();
        assert!(pit.starts_with("<DataModel name=\"Model\">"), "{pit}");
        let array = concat!(
            r#"<Number size="16" endian="big" name="n" "#,
            r#"occurs="2" minOccurs="2" maxOccurs="-1"/>"#
        );
        assert!(pit.contains(array), "{pit}");
    }

    #[test]
    fn invalid_descriptions_are_construction_errors() {
        let missing_size =
            ModelDef::from_toml("name = \"M\"\n[[children]]\ntype = \"Number\"\nname = \"n\"")
                .unwrap();
        let err = missing_size.build().unwrap_err();
        assert_eq!(err.to_string(), "Error, M.n: Number elements require the 'size' attribute.");

        let unknown =
            ModelDef::from_toml("name = \"M\"\n[[children]]\ntype = \"Widget\"\nname = \"w\"")
                .unwrap();
        let err = unknown.build().unwrap_err();
        assert!(err.to_string().contains("Unknown element type 'Widget'."));

        let bad_pad = ModelDef::from_toml(
            "name = \"M\"\n[[children]]\ntype = \"String\"\nname = \"s\"\npad-character = \"ab\"",
        )
        .unwrap();
        assert!(bad_pad.build().is_err());
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let err = ModelDef::from_toml(
            "name = \"M\"\n[[children]]\ntype = \"Blob\"\nname = \"b\"\ncolour = 1",
        )
        .unwrap_err();
        assert!(err.to_string().contains("Failed to parse model description"), "{err}");
    }
}
