use super::codec;
use super::{DataModel, ElementId, ElementKind, LengthType, MutateOverride};
use crate::bitstream::BitStream;
use crate::error::{StrataError, StrataResult};
use crate::fixup::FixupInput;
use crate::pit::escape_attribute;
use crate::variant::Variant;
use tracing::{trace, warn};

impl DataModel {
    /// Final bit representation of an element, after relations, fixups and
    /// transformers. Memoized until the element is invalidated.
    pub fn value(&mut self, id: ElementId) -> StrataResult<BitStream> {
        let saved = (self[id].cache.read_cache, self[id].cache.write_cache);
        if let Some(parent) = self.parent(id) {
            let (read, write) = (self[parent].cache.read_cache, self[parent].cache.write_cache);
            let cache = &mut self[id].cache;
            cache.read_cache &= read;
            cache.write_cache &= write;
        }
        let result = self.cached_value(id);
        if let Some(node) = self.get_mut(id) {
            (node.cache.read_cache, node.cache.write_cache) = saved;
        }
        result
    }

    fn cached_value(&mut self, id: ElementId) -> StrataResult<BitStream> {
        if self.config().value_caching && self[id].cache.read_cache {
            if let Some(value) = &self[id].cache.value {
                return Ok(value.clone());
            }
        }
        self[id].cache.recursion_depth += 1;
        let result = self.generate_value(id);
        let cacheable = result.is_ok() && self.cacheable(id);
        self[id].cache.recursion_depth -= 1;
        let value = result?;
        if cacheable {
            self[id].cache.value = Some(value.clone());
        }
        Ok(value)
    }

    fn generate_value(&mut self, id: ElementId) -> StrataResult<BitStream> {
        self[id].cache.generate_count += 1;
        let flags = self[id].mutation_flags;
        let mutated = self[id].mutated_value.is_some();
        if mutated && flags.contains(MutateOverride::TYPE_TRANSFORM) {
            if let Some(value) = &self[id].mutated_value {
                return Ok(value.to_bitstream()?);
            }
        }
        let internal = self.internal_value(id)?;
        let mut bits = self.internal_to_bitstream(id, &internal)?;
        if !(mutated && flags.contains(MutateOverride::TRANSFORMER)) {
            if let Some(transformer) = &self[id].transformer {
                bits = transformer.encode(&bits)?;
            }
        }
        Ok(bits)
    }

    /// Value after relations and fixups but before conversion to bits.
    pub fn internal_value(&mut self, id: ElementId) -> StrataResult<Variant> {
        if self.config().value_caching && self[id].cache.read_cache {
            if let Some(value) = &self[id].cache.internal {
                return Ok(value.clone());
            }
        }

        let root = self.ancestors(id).last().copied().unwrap_or(id);
        let marked = if self[root].cache.root_recursion == 0 {
            let ancestors = self.ancestors(id);
            for ancestor in &ancestors {
                self[*ancestor].cache.recursion_depth += 1;
            }
            ancestors
        } else {
            Vec::new()
        };
        self[root].cache.root_recursion += 1;

        self[id].cache.int_recursion_depth += 1;
        let result = self.generate_internal_value(id);
        self[id].cache.int_recursion_depth -= 1;
        if let Ok(value) = &result {
            if self.cacheable(id) {
                self[id].cache.internal = Some(value.clone());
            }
        }

        self[root].cache.root_recursion -= 1;
        if self[root].cache.root_recursion == 0 {
            for ancestor in marked {
                if let Some(node) = self.get_mut(ancestor) {
                    node.cache.recursion_depth -= 1;
                }
            }
        }
        result
    }

    fn generate_internal_value(&mut self, id: ElementId) -> StrataResult<Variant> {
        let flags = self[id].mutation_flags;
        let mutated = self[id].mutated_value.clone();
        let is_mutated = mutated.is_some();
        let mut value = match mutated {
            Some(value) => value,
            None => self.generate_default_value(id)?,
        };
        if is_mutated && flags.contains(MutateOverride::RELATIONS) {
            return Ok(value);
        }
        for rel in self.from_relations(id) {
            if let Some(computed) = self.calculate_from_value(rel)? {
                value = computed;
            }
        }
        if is_mutated && flags.contains(MutateOverride::FIXUP) {
            return Ok(value);
        }
        if self[id].fixup.is_some() {
            value = self.run_fixup(id)?;
        }
        Ok(value)
    }

    /// Whether a value computed right now may be memoized.
    fn cacheable(&self, id: ElementId) -> bool {
        if !self.config().value_caching {
            return false;
        }
        let cache = &self[id].cache;
        if !cache.write_cache || cache.recursion_depth > 1 || cache.int_recursion_depth > 0 {
            return false;
        }
        if let Some(fixup) = &self[id].fixup {
            for dependent in fixup.bound() {
                if !self.contains(dependent) {
                    continue;
                }
                if self.is_ancestor(dependent, id) {
                    let mut current = Some(id);
                    while let Some(c) = current {
                        if self[c].cache.recursion_depth > 1 {
                            return false;
                        }
                        if c == dependent {
                            break;
                        }
                        current = self.parent(c);
                    }
                } else if self[dependent].cache.recursion_depth > 0 {
                    return false;
                }
            }
        }
        if self[id].kind.is_container() {
            return self
                .in_scope_children(id)
                .into_iter()
                .all(|child| self.contains(child) && self.cacheable(child));
        }
        true
    }

    /// Drops the cached values of `id` and notifies its parent and subscribers.
    pub fn invalidate(&mut self, id: ElementId) {
        let Some(node) = self.get_mut(id) else {
            return;
        };
        if node.cache.invalidating {
            return;
        }
        node.cache.invalidating = true;
        node.cache.internal = None;
        node.cache.value = None;
        let parent = node.parent;
        let subscribers = node.subscribers.clone();
        if let Some(parent) = parent {
            self.invalidate(parent);
        }
        for subscriber in subscribers {
            self.invalidate(subscriber);
        }
        if let Some(node) = self.get_mut(id) {
            node.cache.invalidating = false;
        }
    }

    /// Clears every cache in the model.
    pub(crate) fn clear_caches(&mut self) {
        for node in self.nodes.iter_mut().flatten() {
            node.cache.internal = None;
            node.cache.value = None;
        }
    }

    /// Length of a freshly generated value, bypassing the cache for the whole subtree.
    pub fn calc_length_bits(&mut self, id: ElementId) -> StrataResult<u64> {
        let saved = (self[id].cache.read_cache, self[id].cache.write_cache);
        self[id].cache.read_cache = false;
        self[id].cache.write_cache = false;
        let result = self.value(id).map(|v| v.len_bits());
        if let Some(node) = self.get_mut(id) {
            (node.cache.read_cache, node.cache.write_cache) = saved;
        }
        result
    }

    fn generate_default_value(&mut self, id: ElementId) -> StrataResult<Variant> {
        match &self[id].kind {
            ElementKind::Block => Ok(Variant::Bits(self.concat_children(id)?)),
            ElementKind::Choice(_) => self.choice_value(id).map(Variant::Bits),
            ElementKind::Array(_) => self.array_value(id).map(Variant::Bits),
            ElementKind::Sequence(_) => self.sequence_value(id).map(Variant::Bits),
            ElementKind::Flags(_) => self.flags_value(id).map(Variant::Bits),
            ElementKind::Padding(_) => self.padding_value(id).map(Variant::Bits),
            ElementKind::XmlElement(_) => self.xml_element_value(id).map(Variant::Bits),
            ElementKind::XmlAttribute(_) => self.xml_attribute_value(id).map(Variant::Bits),
            _ => Ok(self.leaf_default(id)),
        }
    }

    /// Authored default, or the zero value of the element type.
    pub(crate) fn leaf_default(&self, id: ElementId) -> Variant {
        if let Some(value) = &self[id].default_value {
            return value.clone();
        }
        let node = &self[id];
        let zero = match &node.kind {
            ElementKind::String(_) => Variant::String(String::new()),
            ElementKind::Number(_) | ElementKind::Flag(_) => Variant::Int(0),
            ElementKind::Double(_) => Variant::Double(0.0),
            _ => Variant::Bytes(Vec::new()),
        };
        if node.length.is_none() {
            return zero;
        }
        // Sized leaves without a default are filled to their declared length.
        super::element::sanitize(&node.kind, &node.full_name, &zero, node.length, node.length_type)
            .unwrap_or(zero)
    }

    pub(crate) fn concat_children(&mut self, id: ElementId) -> StrataResult<BitStream> {
        let mut out = BitStream::new();
        for child in self[id].children.clone() {
            out.append(&self.value(child)?);
        }
        Ok(out)
    }

    /// Converts an internal value to bits according to the element type.
    pub(crate) fn internal_to_bitstream(
        &self,
        id: ElementId,
        value: &Variant,
    ) -> StrataResult<BitStream> {
        let node = &self[id];
        let path = || node.full_name.clone();
        match &node.kind {
            ElementKind::Blob => match value {
                Variant::String(text) => {
                    let bytes = text
                        .chars()
                        .map(|c| u8::try_from(u32::from(c)))
                        .collect::<Result<Vec<u8>, _>>()
                        .map_err(|_| {
                            StrataError::sanitize(path(), "Value is not representable as bytes.")
                        })?;
                    Ok(BitStream::from_bytes(bytes))
                }
                other => Ok(other.to_bitstream()?),
            },
            ElementKind::String(spec) => {
                if value.is_stream() {
                    return Ok(value.to_bitstream()?);
                }
                let text = value.to_text()?;
                let mut bytes = codec::encode_string(&text, spec.string_type)
                    .map_err(|e| StrataError::sanitize(path(), e))?;
                if spec.null_terminated && node.length.is_none() {
                    bytes.extend(std::iter::repeat_n(0u8, spec.string_type.unit_bytes()));
                }
                Ok(BitStream::from_bytes(bytes))
            }
            ElementKind::Number(spec) => {
                if value.is_stream() {
                    return Ok(value.to_bitstream()?);
                }
                let raw = value.to_i128()? as u64;
                Ok(codec::encode_integer(raw, spec.size, spec.endian))
            }
            ElementKind::Flag(spec) => {
                if value.is_stream() {
                    return Ok(value.to_bitstream()?);
                }
                let raw = value.to_i128()? as u64;
                Ok(codec::encode_integer(raw, spec.size, super::Endian::Big))
            }
            ElementKind::Double(spec) => {
                if value.is_stream() {
                    return Ok(value.to_bitstream()?);
                }
                Ok(codec::encode_double(value.to_f64()?, spec.size, spec.endian))
            }
            _ => Ok(value.to_bitstream()?),
        }
    }

    fn run_fixup(&mut self, id: ElementId) -> StrataResult<Variant> {
        if self[id].cache.fixup_busy {
            return Ok(self.leaf_default(id));
        }
        let target = self.bind_fixup(id)?;
        self[id].cache.fixup_busy = true;
        let result = self.compute_fixup(id, target);
        if let Some(node) = self.get_mut(id) {
            node.cache.fixup_busy = false;
        }
        result
    }

    /// Resolves the fixup's `ref` lazily and subscribes the owner to it.
    fn bind_fixup(&mut self, id: ElementId) -> StrataResult<ElementId> {
        let Some(fixup) = self[id].fixup.as_ref() else {
            return Err(StrataError::soft("Element has no fixup."));
        };
        if let Some(bound) = fixup.bound_ref().filter(|b| self.contains(*b)) {
            return Ok(bound);
        }
        let reference = fixup.reference().to_string();
        let class = fixup.class();
        let Some(target) = self.find(id, &reference) else {
            return Err(StrataError::soft(format!(
                "{class} could not find ref element '{reference}'"
            )));
        };
        if let Some(fixup) = self[id].fixup.as_mut() {
            fixup.bind(target);
        }
        self.subscribe(target, id);
        trace!(
            owner = %self[id].full_name,
            target = %self[target].full_name,
            "Bound fixup reference"
        );
        Ok(target)
    }

    fn compute_fixup(&mut self, id: ElementId, target: ElementId) -> StrataResult<Variant> {
        let data = self.value(target)?;
        let owner_offset = self.position_within(target, id)?;
        let Some(fixup) = self[id].fixup.clone() else {
            return Ok(self.leaf_default(id));
        };
        fixup.compute(&FixupInput { data, owner_offset })
    }

    /// Bit position of `target` inside the value of `ancestor`, or `None` when
    /// an encoding stage or a non-contiguous layout on the path hides it.
    pub(crate) fn position_within(
        &mut self,
        ancestor: ElementId,
        target: ElementId,
    ) -> StrataResult<Option<u64>> {
        if ancestor == target {
            return Ok(Some(0));
        }
        if !self.is_ancestor(ancestor, target) || self[ancestor].transformer.is_some() {
            return Ok(None);
        }
        let mut position = 0u64;
        let mut current = target;
        while current != ancestor {
            let Some(parent) = self.parent(current) else {
                return Ok(None);
            };
            if parent != ancestor && self[parent].transformer.is_some() {
                return Ok(None);
            }
            match &self[parent].kind {
                ElementKind::Flags(spec) => {
                    let spec = *spec;
                    if spec.endian != super::Endian::Big {
                        return Ok(None);
                    }
                    if let ElementKind::Flag(flag) = &self[current].kind {
                        position += u64::from(flag.position);
                    }
                }
                ElementKind::XmlElement(_) | ElementKind::XmlAttribute(_) => return Ok(None),
                _ => {
                    for sibling in self.in_scope_children(parent) {
                        if sibling == current {
                            break;
                        }
                        position += self.value(sibling)?.len_bits();
                    }
                }
            }
            current = parent;
        }
        Ok(Some(position))
    }

    /// Zero bits that align the target element to the padding's alignment.
    fn padding_value(&mut self, id: ElementId) -> StrataResult<BitStream> {
        if self[id].cache.padding_busy {
            return Ok(BitStream::new());
        }
        let ElementKind::Padding(spec) = &self[id].kind else {
            return Ok(BitStream::new());
        };
        let spec = spec.clone();
        let target = match spec.bound.filter(|b| self.contains(*b)) {
            Some(bound) => bound,
            None => {
                let resolved = match &spec.aligned_to {
                    Some(name) => self.find(id, name).ok_or_else(|| {
                        StrataError::construction(
                            self[id].full_name.clone(),
                            format!("Could not resolve alignedTo element '{name}'."),
                        )
                    })?,
                    None => match self.parent(id) {
                        Some(parent) => parent,
                        None => return Ok(BitStream::new()),
                    },
                };
                if let ElementKind::Padding(spec) = &mut self[id].kind {
                    spec.bound = Some(resolved);
                }
                self.subscribe(resolved, id);
                resolved
            }
        };

        self[id].cache.padding_busy = true;
        let length = self.calc_length_bits(target);
        self[id].cache.padding_busy = false;
        let length = length?;

        let mut pad = spec.min_size.saturating_sub(length);
        let remainder = (pad + length) % spec.alignment;
        if remainder != 0 {
            pad += spec.alignment - remainder;
        }
        Ok(BitStream::from_bits(vec![0u8; pad.div_ceil(8) as usize], pad))
    }

    fn xml_element_value(&mut self, id: ElementId) -> StrataResult<BitStream> {
        let ElementKind::XmlElement(spec) = &self[id].kind else {
            return Ok(BitStream::new());
        };
        let tag = spec.name.clone();
        let mut open = format!("<{tag}");
        if let Some(ns) = &spec.ns {
            open.push_str(&format!(" xmlns=\"{}\"", escape_attribute(ns)));
        }
        let mut content = BitStream::new();
        for child in self[id].children.clone() {
            let value = self.value(child)?;
            if matches!(self[child].kind, ElementKind::XmlAttribute(_)) {
                open.push(' ');
                open.push_str(&String::from_utf8_lossy(value.as_bytes()));
            } else {
                content.append(&value);
            }
        }
        open.push('>');
        let mut out = BitStream::from_bytes(open.into_bytes());
        out.append(&content);
        out.write_bytes(format!("</{tag}>").as_bytes());
        Ok(out)
    }

    fn xml_attribute_value(&mut self, id: ElementId) -> StrataResult<BitStream> {
        let ElementKind::XmlAttribute(spec) = &self[id].kind else {
            return Ok(BitStream::new());
        };
        let name = spec.name.clone();
        let text = match self[id].children.first().copied() {
            Some(child) => String::from_utf8_lossy(self.value(child)?.as_bytes()).into_owned(),
            None => String::new(),
        };
        Ok(BitStream::from_bytes(
            format!("{name}=\"{}\"", escape_attribute(&text)).into_bytes(),
        ))
    }

    /// Interprets a cracked or authored value as a length in bits.
    pub(crate) fn bits_for(&self, amount: u64, length_type: LengthType) -> u64 {
        match length_type {
            LengthType::Bytes => amount * 8,
            LengthType::Bits => amount,
            LengthType::Chars => {
                warn!(amount, "Character lengths are not supported for relations, using bytes");
                amount * 8
            }
        }
    }
}
