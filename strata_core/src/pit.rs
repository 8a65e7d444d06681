//! Pit XML output.
//!
//! [`DataModel::write_pit`] describes the authored model, not its current
//! expansion: arrays are written as their template under the array's name
//! with the occurrence attributes, and choices list every option in their pool.

use crate::dom::{ArrayState, DataModel, ElementId, ElementKind, Endian, LengthType, StringType};
use crate::fixup::Fixup;
use crate::relation::RelationKind;
use crate::transformer::Transformer;
use crate::variant::Variant;

/// Escapes text for use inside a double quoted XML attribute.
pub fn escape_attribute(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            '\n' => out.push_str("&#xA;"),
            '\r' => out.push_str("&#xD;"),
            '\t' => out.push_str("&#x9;"),
            c => out.push(c),
        }
    }
    out
}

#[derive(Debug)]
struct Tag {
    name: &'static str,
    attrs: Vec<(&'static str, String)>,
    children: Vec<Tag>,
}

impl Tag {
    fn new(name: &'static str) -> Self {
        Self {
            name,
            attrs: Vec::new(),
            children: Vec::new(),
        }
    }

    fn attr(&mut self, key: &'static str, value: impl ToString) {
        self.attrs.push((key, value.to_string()));
    }

    fn render(&self, depth: usize, out: &mut String) {
        let indent = "  ".repeat(depth);
        out.push_str(&indent);
        out.push('<');
        out.push_str(self.name);
        for (key, value) in &self.attrs {
            out.push_str(&format!(" {key}=\"{}\"", escape_attribute(value)));
        }
        if self.children.is_empty() {
            out.push_str("/>\n");
            return;
        }
        out.push_str(">\n");
        for child in &self.children {
            child.render(depth + 1, out);
        }
        out.push_str(&format!("{indent}</{}>\n", self.name));
    }
}

impl DataModel {
    /// Renders the model as pit XML, rooted at a `DataModel` tag.
    pub fn write_pit(&self) -> String {
        let root = self.root();
        let mut tag = Tag::new("DataModel");
        tag.attr("name", self[root].name());
        self.common_children(root, &mut tag);
        tag.children.extend(self[root].children().iter().map(|c| self.element_tag(*c, None)));
        let mut out = String::new();
        tag.render(0, &mut out);
        out
    }

    /// `array` carries the name and occurrence state of the array `id` is the template of.
    fn element_tag(&self, id: ElementId, array: Option<(&str, &ArrayState)>) -> Tag {
        let node = &self[id];
        if let ElementKind::Array(state) = node.kind() {
            return match state.template().filter(|t| self.contains(*t)) {
                Some(template) => self.element_tag(template, Some((node.name(), state))),
                None => {
                    let mut tag = Tag::new("Block");
                    tag.attr("name", node.name());
                    occurrence_attrs(&mut tag, state);
                    tag
                }
            };
        }

        let mut tag = Tag::new(node.type_name());
        match node.kind() {
            ElementKind::String(spec) => {
                if spec.string_type != StringType::Ascii {
                    tag.attr("type", spec.string_type.tag());
                }
                if spec.null_terminated {
                    tag.attr("nullTerminated", "true");
                }
                if spec.pad_character != '\0' {
                    tag.attr("padCharacter", spec.pad_character);
                }
            }
            ElementKind::Number(spec) => {
                tag.attr("size", spec.size);
                if spec.signed {
                    tag.attr("signed", "true");
                }
                endian_attr(&mut tag, spec.endian);
            }
            ElementKind::Double(spec) => {
                tag.attr("size", spec.size);
                endian_attr(&mut tag, spec.endian);
            }
            ElementKind::Flags(spec) => {
                tag.attr("size", spec.size);
                endian_attr(&mut tag, spec.endian);
            }
            ElementKind::Flag(spec) => {
                tag.attr("size", spec.size);
                tag.attr("position", spec.position);
            }
            ElementKind::Padding(spec) => {
                if spec.alignment != 8 {
                    tag.attr("alignment", spec.alignment);
                }
                if let Some(aligned_to) = &spec.aligned_to {
                    tag.attr("alignedTo", aligned_to);
                }
                if spec.min_size != 0 {
                    tag.attr("minSize", spec.min_size);
                }
            }
            ElementKind::XmlElement(spec) => {
                tag.attr("elementName", &spec.name);
                if let Some(ns) = &spec.ns {
                    tag.attr("ns", ns);
                }
            }
            ElementKind::XmlAttribute(spec) => {
                tag.attr("attributeName", &spec.name);
                if let Some(ns) = &spec.ns {
                    tag.attr("ns", ns);
                }
            }
            _ => {}
        }

        let name = array.map_or(node.name(), |(name, _)| name);
        self.common_attrs(id, name, &mut tag);
        if let Some((_, state)) = array {
            occurrence_attrs(&mut tag, state);
        }
        if let Some(value) = node.default_value() {
            value_attrs(&mut tag, value);
        }
        self.common_children(id, &mut tag);

        let children: Vec<ElementId> = match node.kind() {
            ElementKind::Choice(state) => state.pool().members().to_vec(),
            _ if node.kind().is_container() => node.children().to_vec(),
            _ => Vec::new(),
        };
        tag.children.extend(children.into_iter().map(|c| self.element_tag(c, None)));
        tag
    }

    fn common_attrs(&self, id: ElementId, name: &str, tag: &mut Tag) {
        let node = &self[id];
        tag.attr("name", name);
        if let Some(field_id) = node.field_id() {
            tag.attr("fieldId", field_id);
        }
        if node.is_token() {
            tag.attr("token", "true");
        }
        if !node.is_mutable() {
            tag.attr("mutable", "false");
        }
        if let Some(constraint) = node.constraint() {
            tag.attr("constraint", constraint);
        }
        if let (Some(length), None) = (node.length(), node.kind().intrinsic_bits()) {
            tag.attr("lengthType", node.length_type().tag());
            tag.attr("length", length);
        }
    }

    fn common_children(&self, id: ElementId, tag: &mut Tag) {
        for rel in self.from_relations(id) {
            let Some(relation) = self.relation(rel) else {
                continue;
            };
            let mut child = Tag::new("Relation");
            child.attr("type", relation.kind().tag());
            child.attr("of", relation.of_name());
            match relation.kind() {
                RelationKind::Size { length_type } if *length_type != LengthType::Bytes => {
                    child.attr("lengthType", length_type.tag());
                }
                RelationKind::Offset { relative, relative_to } => {
                    if *relative {
                        child.attr("relative", "true");
                    }
                    if let Some(relative_to) = relative_to {
                        child.attr("relativeTo", relative_to);
                    }
                }
                _ => {}
            }
            if let Some(get) = relation.expression_get() {
                child.attr("expressionGet", get);
            }
            if let Some(set) = relation.expression_set() {
                child.attr("expressionSet", set);
            }
            tag.children.push(child);
        }
        if let Some(fixup) = self[id].fixup() {
            tag.children.push(fixup_tag(fixup));
        }
        if let Some(transformer) = self[id].transformer() {
            tag.children.push(transformer_tag(transformer));
        }
    }
}

fn endian_attr(tag: &mut Tag, endian: Endian) {
    if endian == Endian::Big {
        tag.attr("endian", "big");
    }
}

// maxOccurs is always written so a 1/1/1 array still reads back as an array.
fn occurrence_attrs(tag: &mut Tag, state: &ArrayState) {
    if state.occurs != 1 {
        tag.attr("occurs", state.occurs);
    }
    if state.min_occurs != 1 {
        tag.attr("minOccurs", state.min_occurs);
    }
    match state.max_occurs {
        Some(max) => tag.attr("maxOccurs", max),
        None => tag.attr("maxOccurs", "-1"),
    }
}

fn value_attrs(tag: &mut Tag, value: &Variant) {
    match value {
        Variant::Bytes(bytes) => {
            tag.attr("valueType", "hex");
            tag.attr("value", hex::encode(bytes));
        }
        Variant::Bits(bits) => {
            tag.attr("valueType", "hex");
            tag.attr("value", bits.to_hex());
            if bits.len_bits() % 8 != 0 {
                tag.attr("valueBits", bits.len_bits());
            }
        }
        other => tag.attr("value", other),
    }
}

fn param_tags(tag: &mut Tag, params: &std::collections::BTreeMap<String, String>) {
    for (name, value) in params {
        let mut param = Tag::new("Param");
        param.attr("name", name);
        param.attr("value", value);
        tag.children.push(param);
    }
}

fn fixup_tag(fixup: &Fixup) -> Tag {
    let mut tag = Tag::new("Fixup");
    tag.attr("class", fixup.class());
    param_tags(&mut tag, fixup.params());
    tag
}

fn transformer_tag(transformer: &Transformer) -> Tag {
    let mut tag = Tag::new("Transformer");
    tag.attr("class", transformer.class());
    param_tags(&mut tag, transformer.params());
    if let Some(next) = transformer.next() {
        tag.children.push(transformer_tag(next));
    }
    tag
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bitstream::BitStream;
    use std::collections::BTreeMap;

    #[test]
    fn attributes_are_escaped() {
        assert_eq!(escape_attribute(r#"a<b & "c"'"#), "a&lt;b &amp; &quot;c&quot;&apos;");
        assert_eq!(escape_attribute("\r\n"), "&#xD;&#xA;");
    }

    #[test]
    fn writes_every_container_and_attachment() {
        let mut model = DataModel::new("Packet").unwrap();
        let root = model.root();
        let len = model
            .add_element(root, "len", ElementKind::number(16, false, Endian::Big))
            .unwrap();
        model.add_relation(len, RelationKind::Size { length_type: LengthType::Bytes }, "Body");

        let body = model.add_element(root, "Body", ElementKind::Block).unwrap();
        let kind = model.add_element(body, "Kind", ElementKind::choice()).unwrap();
        let text = model.add_element(kind, "text", ElementKind::string(StringType::Utf8)).unwrap();
        model.set_default_value(text, Variant::from("a\"b")).unwrap();
        model.set_token(text, true);
        let raw = model.add_element(kind, "raw", ElementKind::Blob).unwrap();
        model.set_length(raw, Some(2), LengthType::Bytes).unwrap();
        model.set_default_value(raw, Variant::Bytes(vec![0xde, 0xad])).unwrap();

        let items = model.add_element(body, "item", ElementKind::array()).unwrap();
        model.add_element(items, "item", ElementKind::number(8, true, Endian::Little)).unwrap();
        model.set_occurs(items, 0, None, 2).unwrap();

        let flags = model.add_element(body, "F", ElementKind::flags(8, Endian::Big)).unwrap();
        model.add_element(flags, "hi", ElementKind::flag(0, 1)).unwrap();

        let sum = model.add_element(root, "sum", ElementKind::Blob).unwrap();
        model.set_length(sum, Some(16), LengthType::Bytes).unwrap();
        let params = BTreeMap::from([("ref".to_string(), "Body".to_string())]);
        model.set_fixup(sum, Some(Fixup::new("Md5", params).unwrap()));
        let hex = Transformer::new("Hex", BTreeMap::new())
            .unwrap()
            .chain(Transformer::new("Base64Encode", BTreeMap::new()).unwrap());
        model.set_transformer(sum, Some(hex));

        let expected = r#"<DataModel name="Packet">
  <Number size="16" endian="big" name="len">
    <Relation type="size" of="Body"/>
  </Number>
  <Block name="Body">
    <Choice name="Kind">
      <String type="utf8" name="text" token="true" value="a&quot;b"/>
      <Blob name="raw" lengthType="bytes" length="2" valueType="hex" value="dead"/>
    </Choice>
    <Number size="8" signed="true" name="item" occurs="2" minOccurs="0" maxOccurs="-1"/>
    <Flags size="8" endian="big" name="F">
      <Flag size="1" position="0" name="hi"/>
    </Flags>
  </Block>
  <Blob name="sum" lengthType="bytes" length="16">
    <Fixup class="Md5">
      <Param name="ref" value="Body"/>
    </Fixup>
    <Transformer class="Hex">
      <Transformer class="Base64Encode"/>
    </Transformer>
  </Blob>
</DataModel>
"#;
        assert_eq!(model.write_pit(), expected);
    }

    #[test]
    fn arrays_are_written_under_their_own_name() {
        let mut model = DataModel::new("M").unwrap();
        let root = model.root();
        let count = model
            .add_element(root, "count", ElementKind::number(8, false, Endian::Little))
            .unwrap();
        model.add_relation(count, RelationKind::Count, "Items");
        let items = model.add_element(root, "Items", ElementKind::array()).unwrap();
        model.add_element(items, "Item", ElementKind::Blob).unwrap();
        model.set_occurs(items, 1, Some(1), 1).unwrap();

        let pit = model.write_pit();
        assert!(pit.contains(r#"<Relation type="count" of="Items"/>"#), "{pit}");
        assert!(pit.contains(r#"<Blob name="Items" maxOccurs="1"/>"#), "{pit}");
        assert!(!pit.contains(r#"name="Item""#), "{pit}");
    }

    #[test]
    fn partial_byte_values_keep_their_bit_length() {
        let mut model = DataModel::new("M").unwrap();
        let root = model.root();
        let blob = model.add_element(root, "b", ElementKind::Blob).unwrap();
        let bits = BitStream::from_bits(vec![0xab, 0xc0], 12);
        model.set_default_value(blob, Variant::Bits(bits)).unwrap();

        let pit = model.write_pit();
        assert!(
            pit.contains(r#"<Blob name="b" valueType="hex" value="abc0" valueBits="12"/>"#),
            "{pit}"
        );
    }

    #[test]
    fn padding_and_offsets_keep_their_options() {
        let mut model = DataModel::new("M").unwrap();
        let root = model.root();
        let off = model
            .add_element(root, "off", ElementKind::number(32, false, Endian::Little))
            .unwrap();
        let rel = model.add_relation(
            off,
            RelationKind::Offset {
                relative: true,
                relative_to: Some("off".to_string()),
            },
            "pad",
        );
        model.set_relation_expressions(rel, Some("offset / 2"), None);
        model.add_element(root, "pad", ElementKind::padding(32)).unwrap();

        let pit = model.write_pit();
        let relation = concat!(
            r#"<Relation type="offset" of="pad" relative="true" relativeTo="off" "#,
            r#"expressionGet="offset / 2"/>"#
        );
        assert!(pit.contains(relation), "{pit}");
        assert!(pit.contains(r#"<Padding alignment="32" name="pad"/>"#), "{pit}");
    }
}
