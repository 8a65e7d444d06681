//! Parses input bits back into a model.
//!
//! The cracker walks the tree depth first. Before an element is read its size
//! is worked out from, in order: a size relation whose source is already
//! cracked, a declared length, an offset relation placing a later element, the
//! nearest token ahead, or whatever input remains once every later element with
//! a known size is accounted for.
//!
//! Choices try their options in turn and keep the first that cracks. Arrays
//! read items until a count is reached, input runs out or an item stops
//! matching.

use crate::bitstream::BitStream;
use crate::dom::codec;
use crate::dom::element::sanitize;
use crate::dom::{DataModel, ElementId, ElementKind, Endian, LengthType, StringSpec, StringType};
use crate::error::{CrackingFailure, StrataError, StrataResult};
use crate::expression::{ExpressionValue, Scope};
use crate::relation::{RelationId, RelationKind};
use crate::variant::Variant;
use std::collections::HashMap;
use tracing::{debug, trace};

/// Where a cracked (or in progress) element starts and how big it is, in
/// absolute bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct SizedPosition {
    begin: u64,
    size: Option<u64>,
    end: u64,
}

/// A token found while looking ahead.
///
/// `priority` 0 marks a token the input has to contain, 1 a token inside the
/// array item being cracked, 2 a token in a later optional array item.
#[derive(Debug, Clone, Copy)]
struct Mark {
    element: ElementId,
    position: u64,
    priority: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Until {
    /// Stop at the first element whose size is known.
    FirstSized,
    /// Keep going until an element with an unknown size is found.
    FirstUnsized,
}

/// Cracking state for one pass over the input.
pub struct DataCracker<'m> {
    model: &'m mut DataModel,
    root: ElementId,
    sized: HashMap<ElementId, SizedPosition>,
}

impl DataModel {
    /// Parses `data` into the model, starting at the root.
    ///
    /// On success every element holds the value it was read from; regenerating
    /// the model reproduces the consumed input.
    pub fn crack(&mut self, data: &mut BitStream) -> StrataResult<()> {
        let root = self.root();
        DataCracker::new(self).crack_data(root, data)
    }
}

impl<'m> DataCracker<'m> {
    pub fn new(model: &'m mut DataModel) -> Self {
        let root = model.root();
        Self {
            model,
            root,
            sized: HashMap::new(),
        }
    }

    /// Cracks `data` into `element` and everything below it.
    pub fn crack_data(&mut self, element: ElementId, data: &mut BitStream) -> StrataResult<()> {
        self.root = element;
        self.sized.clear();
        self.model.bind_all();
        data.want_bytes(1)?;
        debug!(
            element = %self.model[element].full_name(),
            bits = data.len_bits(),
            "Cracking input"
        );
        self.handle_node(element, data)
    }

    fn failure(&self, id: ElementId, data: &BitStream, message: impl Into<String>) -> StrataError {
        CrackingFailure::new(self.model[id].full_name(), data.absolute_position(), message).into()
    }

    fn element_size(&self, id: ElementId) -> Option<u64> {
        self.sized.get(&id).and_then(|pos| pos.size)
    }

    fn handle_node(&mut self, id: ElementId, data: &mut BitStream) -> StrataResult<()> {
        let result = self.crack_node(id, data);
        if result.is_err() {
            self.forget(id);
        }
        result
    }

    /// Drops the positions recorded for a subtree whose crack failed.
    fn forget(&mut self, id: ElementId) {
        self.sized.remove(&id);
        if self.model.contains(id) {
            for element in self.model.walk(id) {
                self.sized.remove(&element);
            }
        }
    }

    fn crack_node(&mut self, id: ElementId, data: &mut BitStream) -> StrataResult<()> {
        self.apply_offset(id, data)?;
        let size = self.get_size(id, data)?;
        let begin = data.absolute_position();
        trace!(element = %self.model[id].full_name(), begin, size = ?size, "Sized element");
        self.sized.insert(id, SizedPosition { begin, size, end: begin });

        match self.model[id].transformer().cloned() {
            Some(transformer) => {
                let encoded = match size {
                    None if self.model[id].kind().is_container() => {
                        let rest = data.remaining();
                        data.slice_bits(rest)?
                    }
                    size => self.read_sized_opt(id, data, size)?,
                };
                let mut decoded = match transformer.decode(&encoded) {
                    Ok(decoded) => decoded,
                    Err(StrataError::Cracking(failure)) => return Err(failure.into()),
                    Err(e) => {
                        return Err(self.failure(
                            id,
                            data,
                            format!(
                                "Transformer {} could not decode the data. {e}",
                                transformer.class()
                            ),
                        ));
                    }
                };
                decoded.seek(0)?;
                let length = decoded.len_bits();
                self.crack_element(id, &mut decoded, Some(length))?;
            }
            None => self.crack_element(id, data, size)?,
        }

        if let Some(constraint) = self.model[id].constraint().map(str::to_string) {
            self.check_constraint(id, data, &constraint)?;
        }
        self.finish_node(id, data)
    }

    /// Records the sizes this element's relations announce for later elements.
    fn finish_node(&mut self, id: ElementId, data: &BitStream) -> StrataResult<()> {
        for rel in self.model.from_relations(id) {
            if self.model.relation(rel).map(|r| r.kind().tag()) != Some("size") {
                continue;
            }
            let Some(of) = self.model.resolve_relation(rel) else {
                continue;
            };
            if !self.sized.contains_key(&of) {
                continue;
            }
            let size = self.relation_amount(id, data, rel)?;
            trace!(of = %self.model[of].full_name(), size, "Size relation resolved");
            if let Some(pos) = self.sized.get_mut(&of) {
                pos.size = Some(size);
            }
        }
        if let Some(pos) = self.sized.get_mut(&id) {
            pos.end = data.absolute_position();
        }
        debug!(
            element = %self.model[id].full_name(),
            value = ?self.model[id].default_value(),
            "Cracked element"
        );
        Ok(())
    }

    fn check_constraint(
        &mut self,
        id: ElementId,
        data: &BitStream,
        constraint: &str,
    ) -> StrataResult<()> {
        let mut scope = Scope::new(self.model[id].full_name());
        if let Some(value) = self.model[id].default_value() {
            let value = if value.is_stream() {
                value.clone()
            } else {
                Variant::String(value.to_text()?)
            };
            scope = scope.with("value", value);
        }
        match self.model.evaluate(constraint, &scope)? {
            ExpressionValue::Bool(true) => Ok(()),
            ExpressionValue::Bool(false) => {
                Err(self.failure(id, data, format!("Constraint failed [{constraint}].")))
            }
            ExpressionValue::Value(other) => Err(StrataError::soft(format!(
                "Constraint [{constraint}] on {} produced a {} instead of a boolean.",
                self.model[id].full_name(),
                other.type_name()
            ))),
        }
    }

    fn relation_amount(
        &mut self,
        id: ElementId,
        data: &BitStream,
        rel: RelationId,
    ) -> StrataResult<u64> {
        let value = self.model.relation_get_value(rel)?;
        u64::try_from(value).map_err(|_| {
            self.failure(id, data, format!("Relation produced a negative amount of {value}."))
        })
    }

    /// Bound relations of kind `tag` that target `id`.
    fn relations_of(&self, id: ElementId, tag: &str) -> Vec<RelationId> {
        self.model
            .relations_of(id)
            .into_iter()
            .filter(|r| self.model.relation(*r).is_some_and(|rel| rel.kind().tag() == tag))
            .collect()
    }

    /// True once the relation's source has been read.
    fn has_cracked(&self, rel: RelationId) -> bool {
        self.model
            .relation(rel)
            .is_some_and(|r| self.sized.contains_key(&r.from()))
    }

    // Offsets

    fn apply_offset(&mut self, id: ElementId, data: &mut BitStream) -> StrataResult<()> {
        let Some(offset) = self.relative_offset(id, data, 0)? else {
            return Ok(());
        };
        let target = data.position() + offset;
        if target > data.len_bits() {
            data.want_bytes(offset.div_ceil(8))?;
        }
        if target > data.len_bits() {
            return Err(self.failure(
                id,
                data,
                format!("Offset is {target} bits but buffer only has {} bits.", data.len_bits()),
            ));
        }
        trace!(element = %self.model[id].full_name(), target, "Jumping to offset");
        data.seek(target)?;
        Ok(())
    }

    /// Absolute bit offset of `id` announced by an already cracked offset relation.
    fn absolute_offset(&mut self, id: ElementId, data: &BitStream) -> StrataResult<Option<u64>> {
        let cracked = self.relations_of(id, "offset").into_iter().find(|r| self.has_cracked(*r));
        let Some(rel) = cracked else {
            return Ok(None);
        };
        let Some(relation) = self.model.relation(rel).cloned() else {
            return Ok(None);
        };
        let from = relation.from();
        let mut offset = self.relation_amount(from, data, rel)? * 8;
        if let RelationKind::Offset { relative: true, relative_to } = relation.kind() {
            let base = match relative_to {
                Some(name) => self.model.find(from, name).ok_or_else(|| {
                    self.failure(
                        from,
                        data,
                        format!("Unable to resolve offset relation relative to '{name}'."),
                    )
                })?,
                None => from,
            };
            offset += self.sized.get(&base).map_or(0, |pos| pos.begin);
        }
        Ok(Some(offset))
    }

    /// Offset of `id` from the current read position, checked against what
    /// has already been consumed.
    fn relative_offset(
        &mut self,
        id: ElementId,
        data: &BitStream,
        min: u64,
    ) -> StrataResult<Option<u64>> {
        let Some(absolute) = self.absolute_offset(id, data)? else {
            return Ok(None);
        };
        let offset = absolute.checked_sub(data.origin()).ok_or_else(|| {
            self.failure(
                id,
                data,
                format!("Offset is {absolute} bits but stream starts at bit {}.", data.origin()),
            )
        })?;
        let position = data.position();
        if offset < position {
            return Err(self.failure(
                id,
                data,
                format!("Offset is {offset} bits but already read {position} bits."),
            ));
        }
        let offset = offset - position;
        if offset < min {
            return Err(self.failure(
                id,
                data,
                format!("Offset is {offset} bits but must be at least {min} bits."),
            ));
        }
        Ok(Some(offset))
    }

    // Sizing

    fn get_size(&mut self, id: ElementId, data: &mut BitStream) -> StrataResult<Option<u64>> {
        let mut pos = 0;
        let mut tokens = Vec::new();
        match self.scan(id, &mut pos, &mut tokens, None, Until::FirstSized, data)? {
            Some(true) => return Ok(Some(pos)),
            Some(false) => return Ok(None),
            None => {}
        }

        let mut end = None;
        let ret = self.lookahead(id, &mut pos, &mut tokens, &mut end, data)?;
        let remaining = data.remaining();

        if let Some(end) = end {
            return Ok(Some(end.saturating_sub(pos)));
        }

        if !tokens.is_empty() {
            let mut closest: Option<(u64, Mark)> = None;
            for mark in &tokens {
                let token = self.model.value(mark.element)?;
                let found = find_token(data, &token, mark.position, mark.priority != 0)?;
                match found {
                    None if mark.priority == 0 => return Ok(None),
                    None => continue,
                    Some(at) => {
                        if closest.is_none_or(|(best, _)| at < best) {
                            closest = Some((at, *mark));
                        }
                        if mark.priority <= 1 {
                            break;
                        }
                    }
                }
            }
            if let Some((at, mark)) = closest {
                trace!(
                    element = %self.model[id].full_name(),
                    token = %self.model[mark.element].full_name(),
                    at,
                    "Sized by token"
                );
                return Ok(Some(at.saturating_sub(mark.position)));
            }
            if ret == Some(true) {
                return Ok(Some(remaining.saturating_sub(pos)));
            }
        }

        match ret {
            Some(true) if pos != 0 || !self.model[id].kind().is_container() => {
                Ok(Some(remaining.saturating_sub(pos)))
            }
            _ => Ok(None),
        }
    }

    /// Measures `id` without reading input.
    ///
    /// Returns `Some(true)` when the size was added to `pos`, `Some(false)` when
    /// the element is sized by something the cracker discovers as it reads, and
    /// `None` when the size is unknown.
    fn scan(
        &mut self,
        id: ElementId,
        pos: &mut u64,
        tokens: &mut Vec<Mark>,
        mut end: Option<&mut Option<u64>>,
        until: Until,
        data: &BitStream,
    ) -> StrataResult<Option<bool>> {
        if self.model[id].is_token() {
            tokens.push(Mark {
                element: id,
                position: *pos,
                priority: 0,
            });
        }

        if let Some(end) = end.as_deref_mut() {
            if let Some(offset) = self.relative_offset(id, data, *pos)? {
                *end = Some(offset);
                return Ok(Some(true));
            }
        }

        let sizes = self.relations_of(id, "size");
        if !sizes.is_empty() {
            return match sizes.into_iter().find(|r| self.has_cracked(*r)) {
                Some(rel) => {
                    *pos += self.relation_amount(id, data, rel)?;
                    Ok(Some(true))
                }
                None => Ok(Some(false)),
            };
        }

        let is_padding = matches!(self.model[id].kind(), ElementKind::Padding(_));
        if is_padding || self.model.has_length(id) {
            let bits = if is_padding {
                Some(self.model.value(id)?.len_bits())
            } else {
                self.model.length_bits(id)?
            };
            return Ok(match bits {
                Some(bits) => {
                    *pos += bits;
                    Some(true)
                }
                None => Some(false),
            });
        }

        if self.model.is_deterministic(id) {
            return Ok(Some(false));
        }
        if !self.model[id].kind().is_container() || self.model[id].transformer().is_some() {
            return Ok(None);
        }

        if let ElementKind::Choice(state) = self.model[id].kind() {
            if let [only] = state.pool().members() {
                let only = *only;
                return self.scan(only, pos, tokens, end, until, data);
            }
            return Ok(match until {
                Until::FirstSized => Some(false),
                Until::FirstUnsized => None,
            });
        }
        if matches!(self.model[id].kind(), ElementKind::Array(_)) {
            return self.scan_array(id, pos, tokens, until, data);
        }

        for child in self.model[id].children().to_vec() {
            match self.scan(child, pos, tokens, end.as_deref_mut(), until, data)? {
                None => {
                    return Ok(match until {
                        Until::FirstSized => Some(false),
                        Until::FirstUnsized => None,
                    });
                }
                Some(false) => return Ok(Some(false)),
                Some(true) if until == Until::FirstSized => return Ok(Some(false)),
                Some(true) => {}
            }
        }
        Ok(Some(true))
    }

    fn scan_array(
        &mut self,
        id: ElementId,
        pos: &mut u64,
        tokens: &mut Vec<Mark>,
        until: Until,
        data: &BitStream,
    ) -> StrataResult<Option<bool>> {
        let ElementKind::Array(state) = self.model[id].kind() else {
            return Ok(None);
        };
        let (template, min_occurs, max_occurs, occurs) =
            (state.template(), state.min_occurs, state.max_occurs, state.occurs);
        let Some(template) = template else {
            return Ok(Some(true));
        };
        let cracked = self.model[id].children().len() as u64;

        let mut item_tokens = Vec::new();
        let mut array_pos = 0;
        let ret = self.scan(template, &mut array_pos, &mut item_tokens, None, until, data)?;
        let found_tokens = !item_tokens.is_empty();
        for mut mark in item_tokens {
            if cracked >= min_occurs {
                mark.priority = 2;
            }
            mark.position += *pos;
            tokens.push(mark);
        }

        if ret == Some(true) {
            let result = match until {
                Until::FirstSized => Some(false),
                Until::FirstUnsized => Some(true),
            };
            let counts = self.relations_of(id, "count");
            if !counts.is_empty() {
                return match counts.into_iter().find(|r| self.has_cracked(*r)) {
                    Some(rel) => {
                        *pos += array_pos * self.relation_amount(id, data, rel)?;
                        Ok(result)
                    }
                    None => Ok(None),
                };
            }
            if min_occurs == 1 && max_occurs == Some(1) {
                *pos += array_pos * occurs;
                return Ok(result);
            }
            if !found_tokens {
                return Ok(None);
            }
        }

        if until == Until::FirstSized || !found_tokens {
            return Ok(Some(false));
        }
        Ok(Some(true))
    }

    /// Measures the elements after `elem`, walking up through parents whose
    /// size is still unknown.
    fn lookahead(
        &mut self,
        elem: ElementId,
        pos: &mut u64,
        tokens: &mut Vec<Mark>,
        end: &mut Option<u64>,
        data: &BitStream,
    ) -> StrataResult<Option<bool>> {
        let root_parent = self.model.parent(self.root);
        let mut prev = elem;
        let mut last = Some(true);

        while prev != self.root {
            let parent = self.model.parent(prev);
            if let Some(next) = next_sibling(self.model, prev) {
                let mut curr = next;
                match self.scan(next, pos, tokens, Some(&mut *end), Until::FirstUnsized, data)? {
                    None => {
                        if tokens.is_empty() {
                            return Ok(None);
                        }
                        last = None;
                        match parent {
                            Some(parent) => curr = parent,
                            None => break,
                        }
                    }
                    Some(false) => return Ok(Some(false)),
                    Some(true) => {}
                }
                if end.is_some() {
                    return Ok(last);
                }
                prev = curr;
                continue;
            }

            let Some(parent) = parent else {
                break;
            };
            if Some(parent) == root_parent || self.element_size(parent).is_some() {
                break;
            }

            let bounds = match self.model[parent].kind() {
                ElementKind::Array(state) => Some((state.min_occurs, state.max_occurs)),
                _ => None,
            };
            let is_container = self.model[elem].kind().is_container();
            if let (Some((min_occurs, max_occurs)), false) = (bounds, is_container) {
                let count = self.model[parent].children().len() as u64;
                if max_occurs.is_none_or(|max| count < max) {
                    if self.model.is_ancestor(parent, elem) {
                        for mark in tokens.iter_mut() {
                            mark.priority = 1;
                        }
                        *pos = 0;
                    }
                    let mut array_pos = *pos;
                    let ret =
                        self.scan_array(parent, &mut array_pos, tokens, Until::FirstUnsized, data)?;
                    if ret != Some(true) && count < min_occurs {
                        return Ok(ret);
                    }
                }
            }
            prev = parent;
        }
        Ok(last)
    }

    // Reading

    fn read_sized(
        &self,
        id: ElementId,
        data: &mut BitStream,
        size: u64,
        read: u64,
    ) -> StrataResult<BitStream> {
        if size < read {
            return Err(self.failure(
                id,
                data,
                format!("Length is {size} bits but already read {read} bits."),
            ));
        }
        let needed = size - read;
        data.want_bytes(needed.div_ceil(8))?;
        let remain = data.remaining();
        if needed > remain {
            let message = if read == 0 {
                format!("Length is {size} bits but buffer only has {remain} bits left.")
            } else {
                format!("Read {read} of {size} bits but buffer only has {remain} bits left.")
            };
            return Err(self.failure(id, data, message));
        }
        Ok(data.slice_bits(needed)?)
    }

    fn read_sized_opt(
        &self,
        id: ElementId,
        data: &mut BitStream,
        size: Option<u64>,
    ) -> StrataResult<BitStream> {
        match size {
            Some(size) => self.read_sized(id, data, size, 0),
            None => Err(self.failure(id, data, "Element is unsized.")),
        }
    }

    fn crack_element(
        &mut self,
        id: ElementId,
        data: &mut BitStream,
        size: Option<u64>,
    ) -> StrataResult<()> {
        match self.model[id].kind() {
            ElementKind::Block | ElementKind::Sequence(_) => self.crack_container(id, data, size),
            ElementKind::Choice(_) => self.crack_choice(id, data, size),
            ElementKind::Array(_) => self.crack_array(id, data, size),
            ElementKind::Flags(_) => self.crack_flags(id, data, size),
            ElementKind::Padding(_) => self.read_sized_opt(id, data, size).map(|_| ()),
            ElementKind::XmlElement(_) | ElementKind::XmlAttribute(_) => {
                Err(self.failure(id, data, "XML elements cannot be cracked from binary input."))
            }
            _ => self.crack_leaf(id, data, size),
        }
    }

    fn crack_container(
        &mut self,
        id: ElementId,
        data: &mut BitStream,
        size: Option<u64>,
    ) -> StrataResult<()> {
        let start = data.position();
        let mut size = size;
        let mut sized = match size {
            Some(size) => Some(self.read_sized(id, data, size, 0)?),
            None => None,
        };

        let mut index = 0;
        while let Some(child) = self.model[id].children().get(index).copied() {
            match sized.as_mut() {
                Some(stream) => self.handle_node(child, stream)?,
                None => self.handle_node(child, data)?,
            }
            // A child may have carried this container's size relation.
            if size.is_none() {
                size = self.element_size(id);
                if let Some(size) = size {
                    let read = data.position().saturating_sub(start);
                    sized = Some(self.read_sized(id, data, size, read)?);
                }
            }
            index = self.model[id]
                .children()
                .iter()
                .position(|c| *c == child)
                .unwrap_or(index)
                + 1;
        }
        Ok(())
    }

    fn crack_choice(
        &mut self,
        id: ElementId,
        data: &mut BitStream,
        size: Option<u64>,
    ) -> StrataResult<()> {
        match size {
            Some(size) => {
                let mut sized = self.read_sized(id, data, size, 0)?;
                self.crack_choice_in(id, &mut sized)
            }
            None => self.crack_choice_in(id, data),
        }
    }

    fn crack_choice_in(&mut self, id: ElementId, data: &mut BitStream) -> StrataResult<()> {
        let start = data.position();
        self.model.clear_selection(id);

        let cache = self.model.choice_token_cache(id)?;
        let mut tried: Option<String> = None;
        for entry in &cache {
            data.want_bytes((entry.offset + entry.token.len_bits()).div_ceil(8))?;
            if !data.matches_at(start + entry.offset, &entry.token) {
                continue;
            }
            trace!(choice = %self.model[id].full_name(), option = %entry.name, "Token matched");
            if self.try_option(id, entry.member, start, data)? {
                return Ok(());
            }
            tried = Some(entry.name.clone());
            break;
        }

        let members = match self.model[id].kind() {
            ElementKind::Choice(state) => state.pool().members().to_vec(),
            _ => Vec::new(),
        };
        for member in members {
            let name = self.model[member].name();
            if tried.is_none() && cache.iter().any(|e| e.name == name) {
                continue;
            }
            if tried.as_deref() == Some(name) {
                continue;
            }
            if self.try_option(id, member, start, data)? {
                return Ok(());
            }
        }

        data.seek(start)?;
        Err(self.failure(id, data, "No valid children were found."))
    }

    /// Cracks a fresh copy of `member` as the choice's selection. `Ok(false)`
    /// means the option did not match and has been discarded.
    fn try_option(
        &mut self,
        choice: ElementId,
        member: ElementId,
        start: u64,
        data: &mut BitStream,
    ) -> StrataResult<bool> {
        let copy = self.model.clone_element(member, None, Some(choice), true)?;
        self.model.install_selection(choice, copy);
        data.seek(start)?;
        match self.handle_node(copy, data) {
            Ok(()) => {
                debug!(
                    choice = %self.model[choice].full_name(),
                    selected = %self.model[copy].name(),
                    "Choice resolved"
                );
                Ok(true)
            }
            Err(StrataError::Cracking(failure)) => {
                trace!(
                    option = %self.model[copy].full_name(),
                    reason = %failure,
                    "Option did not match"
                );
                self.model.clear_selection(choice);
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    fn crack_array(
        &mut self,
        id: ElementId,
        data: &mut BitStream,
        size: Option<u64>,
    ) -> StrataResult<()> {
        let start = data.position();
        match size {
            Some(size) => {
                let mut sized = self.read_sized(id, data, size, 0)?;
                self.crack_array_in(id, &mut sized)?;
                data.seek(start + sized.position())?;
                Ok(())
            }
            None => self.crack_array_in(id, data),
        }
    }

    fn crack_array_in(&mut self, id: ElementId, data: &mut BitStream) -> StrataResult<()> {
        let ElementKind::Array(state) = self.model[id].kind() else {
            return Ok(());
        };
        let (template, min_occurs, max_occurs, occurs) =
            (state.template(), state.min_occurs, state.max_occurs, state.occurs);
        let Some(template) = template else {
            return Err(self.failure(id, data, "Array has no template element."));
        };
        self.model.clear_items(id);

        let count = self.relations_of(id, "count").into_iter().find(|r| self.has_cracked(*r));
        let (min, max) = match count {
            Some(rel) => {
                let count = self.relation_amount(id, data, rel)?;
                (count, Some(count))
            }
            None if min_occurs == 1 && max_occurs == Some(1) => (occurs, Some(occurs)),
            None => (min_occurs, max_occurs),
        };
        if let Some(limit) = max_occurs {
            if min > limit && min != occurs {
                return Err(self.failure(
                    id,
                    data,
                    format!("Count of {min} is greater than the maximum of {limit}."),
                ));
            }
        }
        if min < min_occurs && min != occurs {
            return Err(self.failure(
                id,
                data,
                format!("Count of {min} is less than the minimum of {min_occurs}."),
            ));
        }
        let limit = self.model.config().max_array_expansion;
        if min > limit {
            return Err(self.failure(
                id,
                data,
                format!("Count of {min} exceeds the expansion limit of {limit}."),
            ));
        }

        let mut index = 0u64;
        while max.is_none_or(|max| index < max) {
            data.want_bytes(1)?;
            let pos = data.position();
            if pos == data.len_bits() {
                trace!(array = %self.model[id].full_name(), index, "Input exhausted");
                break;
            }
            let item = self.model.array_item(id, template, index)?;
            self.model.attach_array_item(id, item);
            match self.handle_node(item, data) {
                Ok(()) => {
                    if data.position() == pos && index >= min {
                        trace!(
                            array = %self.model[id].full_name(),
                            index,
                            "Item consumed no input"
                        );
                        self.model.remove(item)?;
                        break;
                    }
                }
                Err(StrataError::Cracking(failure)) => {
                    if index < min {
                        let message = format!("Only cracked {index} of {min} array entries.");
                        let error = CrackingFailure::new(
                            self.model[id].full_name(),
                            data.absolute_position(),
                            message,
                        )
                        .with_cause(failure);
                        return Err(error.into());
                    }
                    trace!(
                        array = %self.model[id].full_name(),
                        index,
                        reason = %failure,
                        "Item did not match"
                    );
                    self.model.remove(item)?;
                    data.seek(pos)?;
                    break;
                }
                Err(e) => return Err(e),
            }
            index += 1;
        }

        let cracked = self.model[id].children().len() as u64;
        if cracked < min {
            return Err(self.failure(
                id,
                data,
                format!("Only cracked {cracked} of {min} array entries."),
            ));
        }
        Ok(())
    }

    fn crack_flags(
        &mut self,
        id: ElementId,
        data: &mut BitStream,
        size: Option<u64>,
    ) -> StrataResult<()> {
        let spec = match self.model[id].kind() {
            ElementKind::Flags(spec) => *spec,
            _ => return Ok(()),
        };
        let mut sized = self.read_sized_opt(id, data, size.or(Some(u64::from(spec.size))))?;
        if sized.len_bits() < u64::from(spec.size) {
            return Err(self.failure(
                id,
                data,
                format!(
                    "Flags need {} bits but only {} are available.",
                    spec.size,
                    sized.len_bits()
                ),
            ));
        }

        // Little endian flags are read from the byte swapped integer so that
        // every flag sits at a fixed big endian offset.
        let mut packed = match spec.endian {
            Endian::Big => sized,
            Endian::Little => {
                let raw = codec::decode_integer(&mut sized, spec.size, Endian::Little)?;
                let mut normalized = codec::encode_integer(raw, spec.size, Endian::Big);
                normalized.set_origin(sized.origin());
                normalized
            }
        };
        for child in self.model[id].children().to_vec() {
            let ElementKind::Flag(flag) = *self.model[child].kind() else {
                return Err(self.failure(
                    id,
                    data,
                    format!(
                        "Flags hold only Flag children, found {}.",
                        self.model[child].type_name()
                    ),
                ));
            };
            let offset = match spec.endian {
                Endian::Big => flag.position,
                Endian::Little => spec.size - flag.position - flag.size,
            };
            packed.seek(u64::from(offset))?;
            self.handle_node(child, &mut packed)?;
        }
        Ok(())
    }

    fn crack_leaf(
        &mut self,
        id: ElementId,
        data: &mut BitStream,
        size: Option<u64>,
    ) -> StrataResult<()> {
        let raw = self.read_leaf_value(id, data, size)?;
        let node = &self.model[id];
        let value = sanitize(node.kind(), node.full_name(), &raw, node.length(), node.length_type())
            .map_err(|e| self.failure(id, data, e.to_string()))?;

        if self.model[id].is_token() {
            let expected = self.model.leaf_default(id);
            if expected != value {
                return Err(self.failure(
                    id,
                    data,
                    format!("Token did not match '{value}' vs. '{expected}'."),
                ));
            }
        }
        trace!(element = %self.model[id].full_name(), value = %value, "Read value");
        self.model
            .set_default_value(id, value)
            .map_err(|e| self.failure(id, data, e.to_string()))
    }

    fn read_leaf_value(
        &mut self,
        id: ElementId,
        data: &mut BitStream,
        size: Option<u64>,
    ) -> StrataResult<Variant> {
        let kind = self.model[id].kind().clone();
        match kind {
            ElementKind::Number(spec) => {
                let mut bits = self.read_sized_opt(id, data, size)?;
                let decoded = codec::decode_integer(&mut bits, spec.size, spec.endian);
                let raw = self.decode_bits(id, data, decoded)?;
                Ok(if spec.signed {
                    Variant::Int(codec::sign_extend(raw, spec.size))
                } else {
                    unsigned(raw)
                })
            }
            ElementKind::Flag(spec) => {
                let mut bits = self.read_sized_opt(id, data, size)?;
                let decoded = codec::decode_integer(&mut bits, spec.size, Endian::Big);
                let raw = self.decode_bits(id, data, decoded)?;
                Ok(unsigned(raw))
            }
            ElementKind::Double(spec) => {
                let mut bits = self.read_sized_opt(id, data, size)?;
                let decoded = codec::decode_double(&mut bits, spec.size, spec.endian);
                let value = self.decode_bits(id, data, decoded)?;
                Ok(Variant::Double(value))
            }
            ElementKind::String(spec) => self.read_string(id, data, size, &spec),
            _ => {
                let bits = self.read_sized_opt(id, data, size)?;
                Ok(if bits.len_bits() % 8 == 0 {
                    Variant::Bytes(bits.to_bytes())
                } else {
                    Variant::Bits(bits)
                })
            }
        }
    }

    fn decode_bits<T>(
        &self,
        id: ElementId,
        data: &BitStream,
        decoded: Result<T, crate::bitstream::BitStreamError>,
    ) -> StrataResult<T> {
        decoded.map_err(|e| self.failure(id, data, e.to_string()))
    }

    fn read_string(
        &mut self,
        id: ElementId,
        data: &mut BitStream,
        size: Option<u64>,
        spec: &StringSpec,
    ) -> StrataResult<Variant> {
        let length = self.model[id].length();
        let length_type = self.model[id].length_type();
        if size.is_none() {
            if length.is_none() && spec.null_terminated {
                return self.read_characters(id, data, spec.string_type, None).map(Variant::String);
            }
            if let (Some(count), LengthType::Chars) = (length, length_type) {
                return self
                    .read_characters(id, data, spec.string_type, Some(count))
                    .map(Variant::String);
            }
        }
        let bits = self.read_sized_opt(id, data, size)?;
        let mut text = codec::decode_string(bits.as_bytes(), spec.string_type)
            .map_err(|e| self.failure(id, data, e))?;
        if length.is_none() && spec.null_terminated {
            if let Some(stripped) = text.strip_suffix('\0') {
                text = stripped.to_string();
            }
        }
        Ok(Variant::String(text))
    }

    /// Reads whole characters until `count` is reached, or up to a null
    /// terminator when there is no count. The terminator is consumed but not
    /// returned.
    fn read_characters(
        &mut self,
        id: ElementId,
        data: &mut BitStream,
        string_type: StringType,
        count: Option<u64>,
    ) -> StrataResult<String> {
        let unit = string_type.unit_bytes() as u64;
        let mut bytes = Vec::new();
        let mut chars = 0u64;
        let short = |cracker: &Self, data: &BitStream, chars: u64| match count {
            Some(max) => {
                cracker.failure(id, data, format!("Only read {chars} of {max} characters."))
            }
            None => cracker.failure(id, data, "Did not encounter a null terminator."),
        };

        while count.is_none_or(|max| chars < max) {
            data.want_bytes(unit)?;
            if data.remaining() < unit * 8 {
                return Err(short(self, data, chars));
            }
            let mut ch = data.read_bytes(unit)?;
            let extra = match string_type {
                StringType::Utf8 => codec::utf8_sequence_len(ch[0]).map_or(0, |n| n as u64 - 1),
                StringType::Utf16 | StringType::Utf16Be => {
                    let pair = [ch[0], ch[1]];
                    let code = if string_type == StringType::Utf16 {
                        u16::from_le_bytes(pair)
                    } else {
                        u16::from_be_bytes(pair)
                    };
                    if (0xd800..0xdc00).contains(&code) { 2 } else { 0 }
                }
                StringType::Ascii | StringType::Utf32 => 0,
            };
            if extra > 0 {
                data.want_bytes(extra)?;
                if data.remaining() < extra * 8 {
                    return Err(short(self, data, chars));
                }
                ch.extend(data.read_bytes(extra)?);
            }
            if count.is_none() && ch.iter().all(|b| *b == 0) {
                break;
            }
            bytes.extend(ch);
            chars += 1;
        }
        codec::decode_string(&bytes, string_type).map_err(|e| self.failure(id, data, e))
    }
}

fn unsigned(raw: u64) -> Variant {
    match i64::try_from(raw) {
        Ok(value) => Variant::Int(value),
        Err(_) => Variant::ULong(raw),
    }
}

fn next_sibling(model: &DataModel, id: ElementId) -> Option<ElementId> {
    let parent = model.parent(id)?;
    let siblings = model[parent].children();
    let index = siblings.iter().position(|c| *c == id)?;
    siblings.get(index + 1).copied()
}

/// Distance from `pos` to the next occurrence of `token`, at least `offset`
/// bits ahead. Required tokens pull more input until found or the input ends.
fn find_token(
    data: &mut BitStream,
    token: &BitStream,
    offset: u64,
    optional: bool,
) -> StrataResult<Option<u64>> {
    loop {
        let pos = data.position();
        let start = pos + offset;
        if start < data.len_bits() {
            if let Some(at) = data.find(token, start) {
                return Ok(Some(at - pos));
            }
        }
        if optional {
            return Ok(None);
        }
        let before = data.len_bits();
        let want = (data.remaining() / 8).max(offset.div_ceil(8) + token.len_bytes()) + 1;
        data.want_bytes(want)?;
        if data.len_bits() == before {
            return Ok(None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dom::{Endian, LengthType, StringType};
    use crate::expression::ExpressionValue;
    use crate::transformer::Transformer;
    use proptest::prelude::*;
    use std::collections::BTreeMap;
    use std::sync::Arc;

    fn number(model: &mut DataModel, parent: ElementId, name: &str, size: u32) -> ElementId {
        model.add_element(parent, name, ElementKind::number(size, false, Endian::Big)).unwrap()
    }

    fn token(model: &mut DataModel, parent: ElementId, name: &str, value: &str) -> ElementId {
        let id = model.add_element(parent, name, ElementKind::Blob).unwrap();
        model.set_default_value(id, Variant::from(value)).unwrap();
        model.set_token(id, true);
        id
    }

    fn failure_of(err: StrataError) -> CrackingFailure {
        match err {
            StrataError::Cracking(failure) => failure,
            other => panic!("expected a cracking failure, got {other}"),
        }
    }

    fn choice_model() -> (DataModel, ElementId) {
        let mut model = DataModel::new("Model").unwrap();
        let root = model.root();
        let choice = model.add_element(root, "C", ElementKind::choice()).unwrap();
        for (name, tok) in [("A", "AA"), ("B", "BB")] {
            let branch = model.add_element(choice, name, ElementKind::Block).unwrap();
            token(&mut model, branch, "tok", tok);
        }
        (model, choice)
    }

    #[test]
    fn choice_selects_the_option_whose_token_matches() {
        let (mut model, choice) = choice_model();
        model.crack(&mut BitStream::from_bytes(b"BB".to_vec())).unwrap();
        let selected = model.selected(choice).unwrap();
        assert_eq!(model[selected].name(), "B");
        let root = model.root();
        assert_eq!(model.value(root).unwrap().as_bytes(), b"BB");
    }

    #[test]
    fn choice_without_a_match_names_the_choice() {
        let (mut model, choice) = choice_model();
        let failure =
            failure_of(model.crack(&mut BitStream::from_bytes(b"CC".to_vec())).unwrap_err());
        assert_eq!(failure.element, "Model.C");
        assert_eq!(failure.position, 0);
        assert!(failure.message.contains("No valid children were found."), "{failure}");
        assert!(model.selected(choice).is_none());
    }

    #[test]
    fn choice_falls_back_to_options_without_tokens() {
        let (mut model, choice) = choice_model();
        let other = model.add_element(choice, "Other", ElementKind::Blob).unwrap();
        model.set_length(other, Some(2), LengthType::Bytes).unwrap();
        model.crack(&mut BitStream::from_bytes(b"CC".to_vec())).unwrap();
        let selected = model.selected(choice).unwrap();
        assert_eq!(model[selected].name(), "Other");
        assert_eq!(model[selected].default_value(), Some(&Variant::Bytes(b"CC".to_vec())));
    }

    fn array_model() -> (DataModel, ElementId) {
        let mut model = DataModel::new("Model").unwrap();
        let root = model.root();
        let array = model.add_element(root, "Items", ElementKind::array()).unwrap();
        let item = model.add_element(array, "Item", ElementKind::Block).unwrap();
        token(&mut model, item, "marker", "I");
        number(&mut model, item, "v", 8);
        model.set_occurs(array, 2, Some(4), 2).unwrap();
        (model, array)
    }

    #[test]
    fn array_stops_at_the_first_item_that_does_not_match() {
        let (mut model, array) = array_model();
        model.crack(&mut BitStream::from_bytes(b"I\x01I\x02I\x03zz".to_vec())).unwrap();
        let values: Vec<Option<&Variant>> = model[array]
            .children()
            .iter()
            .map(|item| model[model[*item].children()[1]].default_value())
            .collect();
        assert_eq!(
            values,
            [Some(&Variant::Int(1)), Some(&Variant::Int(2)), Some(&Variant::Int(3))]
        );
    }

    #[test]
    fn array_respects_max_occurs() {
        let (mut model, array) = array_model();
        model
            .crack(&mut BitStream::from_bytes(b"I\x01I\x02I\x03I\x04I\x05".to_vec()))
            .unwrap();
        assert_eq!(model[array].children().len(), 4);
    }

    #[test]
    fn array_below_min_occurs_fails_with_cause() {
        let (mut model, _) = array_model();
        let failure =
            failure_of(model.crack(&mut BitStream::from_bytes(b"I\x01zz".to_vec())).unwrap_err());
        assert_eq!(failure.element, "Model.Items");
        assert!(failure.message.contains("Only cracked 1 of 2 array entries."), "{failure}");
        assert!(failure.root_cause().message.contains("Token did not match"), "{failure:?}");
    }

    fn sized_items_model(occurs: u64) -> (DataModel, ElementId) {
        let mut model = DataModel::new("Model").unwrap();
        let root = model.root();
        let len = number(&mut model, root, "len", 8);
        let array = model.add_element(root, "Items", ElementKind::array()).unwrap();
        let item = model.add_element(array, "Item", ElementKind::Blob).unwrap();
        model.set_length(item, Some(2), LengthType::Bytes).unwrap();
        model.set_default_value(item, Variant::from("ab")).unwrap();
        model.set_occurs(array, 0, None, occurs).unwrap();
        model.add_relation(len, RelationKind::Size { length_type: LengthType::Bytes }, "Items");
        (model, array)
    }

    #[test]
    fn size_relation_bounds_the_array_on_crack() {
        let (mut source, _) = sized_items_model(3);
        let root = source.root();
        let generated = source.value(root).unwrap();
        assert_eq!(generated.as_bytes(), b"\x06ababab");

        let (mut model, array) = sized_items_model(1);
        let mut input = generated.clone();
        input.append(&BitStream::from_bytes(b"??".to_vec()));
        model.crack(&mut input).unwrap();
        assert_eq!(model[array].children().len(), 3);
        assert_eq!(input.position(), 56, "Trailing bytes stay unread");
        let root = model.root();
        assert_eq!(model.value(root).unwrap().as_bytes(), generated.as_bytes());
    }

    #[test]
    fn size_relation_reaches_into_a_selected_option() {
        let mut model = DataModel::new("Model").unwrap();
        let root = model.root();
        let len = number(&mut model, root, "len", 8);
        let choice = model.add_element(root, "C", ElementKind::choice()).unwrap();
        let branch = model.add_element(choice, "A", ElementKind::Block).unwrap();
        token(&mut model, branch, "tag", "A");
        model.add_element(branch, "data", ElementKind::Blob).unwrap();
        model.add_element(root, "rest", ElementKind::Blob).unwrap();
        model.add_relation(len, RelationKind::Size { length_type: LengthType::Bytes }, "C.A.data");

        model.crack(&mut BitStream::from_bytes(b"\x02Axyz".to_vec())).unwrap();
        let selected = model.selected(choice).unwrap();
        assert_eq!(model[selected].name(), "A");
        let data = model.child_by_name(selected, "data").unwrap();
        assert_eq!(model[data].default_value(), Some(&Variant::Bytes(b"xy".to_vec())));
        let rest = model.element_by_full_name("Model.rest").unwrap();
        assert_eq!(model[rest].default_value(), Some(&Variant::Bytes(b"z".to_vec())));
        assert_eq!(model.value(root).unwrap().as_bytes(), b"\x02Axyz");
    }

    #[test]
    fn little_endian_flags_crack_to_their_values() {
        let mut model = DataModel::new("Model").unwrap();
        let root = model.root();
        let flags = model.add_element(root, "F", ElementKind::flags(8, Endian::Little)).unwrap();
        for (i, (position, size)) in [(0, 1), (1, 2), (5, 3)].into_iter().enumerate() {
            model.add_element(flags, &format!("f{i}"), ElementKind::flag(position, size)).unwrap();
        }
        model.crack(&mut BitStream::from_bytes(vec![0b1010_0101])).unwrap();
        let values: Vec<Option<&Variant>> = model[flags]
            .children()
            .iter()
            .map(|f| model[*f].default_value())
            .collect();
        assert_eq!(
            values,
            [Some(&Variant::Int(1)), Some(&Variant::Int(2)), Some(&Variant::Int(5))]
        );
        assert_eq!(model.value(root).unwrap().as_bytes(), &[0b1010_0101]);
    }

    #[test]
    fn offset_relation_skips_to_the_target() {
        let mut model = DataModel::new("Model").unwrap();
        let root = model.root();
        let offset = number(&mut model, root, "offset", 8);
        let target = model.add_element(root, "target", ElementKind::Blob).unwrap();
        model.set_length(target, Some(1), LengthType::Bytes).unwrap();
        model.add_relation(
            offset,
            RelationKind::Offset {
                relative: false,
                relative_to: None,
            },
            "target",
        );

        model.crack(&mut BitStream::from_bytes(b"\x03??D".to_vec())).unwrap();
        assert_eq!(model[target].default_value(), Some(&Variant::Bytes(b"D".to_vec())));

        let failure =
            failure_of(model.crack(&mut BitStream::from_bytes(b"\x00D".to_vec())).unwrap_err());
        assert_eq!(failure.element, "Model.target");
        assert!(failure.message.contains("Offset is 0 bits but already read 8 bits."), "{failure}");
    }

    #[test]
    fn null_terminated_string_consumes_its_terminator() {
        let mut model = DataModel::new("Model").unwrap();
        let root = model.root();
        let s = model.add_element(root, "s", ElementKind::string(StringType::Ascii)).unwrap();
        if let ElementKind::String(spec) = &mut model.get_mut(s).unwrap().kind {
            spec.null_terminated = true;
        }
        let n = number(&mut model, root, "n", 8);
        model.crack(&mut BitStream::from_bytes(b"abc\0\x07".to_vec())).unwrap();
        assert_eq!(model[s].default_value(), Some(&Variant::from("abc")));
        assert_eq!(model[n].default_value(), Some(&Variant::Int(7)));

        let failure =
            failure_of(model.crack(&mut BitStream::from_bytes(b"abc".to_vec())).unwrap_err());
        assert!(failure.message.contains("Did not encounter a null terminator."), "{failure}");
    }

    #[test]
    fn unsized_blob_is_bounded_by_the_next_token() {
        let mut model = DataModel::new("Model").unwrap();
        let root = model.root();
        let body = model.add_element(root, "body", ElementKind::Blob).unwrap();
        token(&mut model, root, "end", "\r\n");
        model.crack(&mut BitStream::from_bytes(b"hello\r\n".to_vec())).unwrap();
        assert_eq!(model[body].default_value(), Some(&Variant::Bytes(b"hello".to_vec())));
    }

    #[test]
    fn unsized_blob_leaves_room_for_sized_trailers() {
        let mut model = DataModel::new("Model").unwrap();
        let root = model.root();
        number(&mut model, root, "a", 8);
        let rest = model.add_element(root, "rest", ElementKind::Blob).unwrap();
        let tail = number(&mut model, root, "tail", 16);
        model.crack(&mut BitStream::from_bytes(b"\x01xyz\x00\x02".to_vec())).unwrap();
        assert_eq!(model[rest].default_value(), Some(&Variant::Bytes(b"xyz".to_vec())));
        assert_eq!(model[tail].default_value(), Some(&Variant::Int(2)));
    }

    #[test]
    fn transformer_decodes_before_cracking() {
        let mut model = DataModel::new("Model").unwrap();
        let root = model.root();
        let h = model.add_element(root, "h", ElementKind::Blob).unwrap();
        model.set_transformer(h, Some(Transformer::new("Hex", BTreeMap::new()).unwrap()));
        model.crack(&mut BitStream::from_bytes(b"6869".to_vec())).unwrap();
        assert_eq!(model[h].default_value(), Some(&Variant::Bytes(b"hi".to_vec())));
        assert_eq!(model.value(root).unwrap().as_bytes(), b"6869");
    }

    #[test]
    fn constraint_rejects_values() {
        let mut model = DataModel::new("Model").unwrap();
        let root = model.root();
        let s = model.add_element(root, "s", ElementKind::string(StringType::Ascii)).unwrap();
        model.set_length(s, Some(2), LengthType::Bytes).unwrap();
        model.set_constraint(s, Some("value == 'ok'"));
        model.set_evaluator(Arc::new(|_: &str, scope: &Scope| -> StrataResult<ExpressionValue> {
            Ok(ExpressionValue::Bool(scope.values.get("value") == Some(&Variant::from("ok"))))
        }));

        model.crack(&mut BitStream::from_bytes(b"ok".to_vec())).unwrap();
        let failure =
            failure_of(model.crack(&mut BitStream::from_bytes(b"no".to_vec())).unwrap_err());
        assert!(failure.message.contains("Constraint failed [value == 'ok']."), "{failure}");
    }

    fn counted_model(count: u64) -> (DataModel, ElementId, ElementId) {
        let mut model = DataModel::new("Model").unwrap();
        let root = model.root();
        let n = number(&mut model, root, "n", 8);
        let array = model.add_element(root, "Items", ElementKind::array()).unwrap();
        number(&mut model, array, "v", 8);
        model.set_occurs(array, 0, None, count).unwrap();
        let len = number(&mut model, root, "len", 16);
        let payload = model.add_element(root, "payload", ElementKind::Blob).unwrap();
        model.add_relation(n, RelationKind::Count, "Items");
        model.add_relation(len, RelationKind::Size { length_type: LengthType::Bytes }, "payload");
        (model, array, payload)
    }

    proptest! {
        #[test]
        fn generated_output_cracks_back_to_the_same_bytes(
            items in proptest::collection::vec(any::<u8>(), 0..6),
            payload in proptest::collection::vec(any::<u8>(), 0..20),
        ) {
            let (mut source, array, blob) = counted_model(0);
            source.expand_to(array, items.len() as u64).unwrap();
            for (item, value) in source[array].children().to_vec().into_iter().zip(&items) {
                source.set_default_value(item, Variant::Int(i64::from(*value))).unwrap();
            }
            source.set_default_value(blob, Variant::Bytes(payload.clone())).unwrap();
            let root = source.root();
            let generated = source.value(root).unwrap();

            let (mut model, array, blob) = counted_model(1);
            model.crack(&mut generated.clone()).unwrap();
            prop_assert_eq!(model[array].children().len(), items.len());
            prop_assert_eq!(model[blob].default_value(), Some(&Variant::Bytes(payload)));
            let root = model.root();
            let regenerated = model.value(root).unwrap();
            prop_assert_eq!(regenerated.as_bytes(), generated.as_bytes());
        }
    }
}
