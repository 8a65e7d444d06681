use super::{DataModel, ElementId, ElementKind};
use crate::bitstream::BitStream;
use crate::error::{StrataError, StrataResult};
use tracing::debug;

/// Concatenates `times` copies of `unit`, doubling the chunk each round.
fn repeat_bits(unit: &BitStream, times: u64) -> BitStream {
    let mut out = BitStream::new();
    let mut chunk = unit.clone();
    let mut left = times;
    while left > 0 {
        if left & 1 == 1 {
            out.append(&chunk);
        }
        left >>= 1;
        if left > 0 {
            let copy = chunk.clone();
            chunk.append(&copy);
        }
    }
    out
}

impl DataModel {
    /// Replaces the array's items with `count` copies of its template and
    /// marks it expanded.
    pub fn expand_to(&mut self, array: ElementId, count: u64) -> StrataResult<()> {
        let template = match &self[array].kind {
            ElementKind::Array(state) => state.template,
            _ => {
                return Err(StrataError::construction(
                    self[array].full_name.clone(),
                    "Only arrays can be expanded.",
                ));
            }
        };
        let Some(template) = template else {
            return Err(StrataError::construction(
                self[array].full_name.clone(),
                "Array has no template element.",
            ));
        };
        let limit = self.config().max_array_expansion;
        if count > limit {
            return Err(StrataError::soft(format!(
                "Expanding {} to {count} items exceeds the limit of {limit}.",
                self[array].full_name
            )));
        }

        self.clear_items(array);
        for index in 0..count {
            let item = self.array_item(array, template, index)?;
            self[array].children.push(item);
        }
        let subtree = self.walk(array);
        self.bind_relations_from(&subtree);
        self.invalidate(array);
        debug!(array = %self[array].full_name, count, "Expanded array");
        Ok(())
    }

    /// Frees every item and marks the array expanded with zero items.
    pub(crate) fn clear_items(&mut self, array: ElementId) {
        for item in self[array].children.clone() {
            self.detach(item);
            self.free_subtree(item);
        }
        if let ElementKind::Array(state) = &mut self[array].kind {
            state.expanded = true;
        }
    }

    /// Copies the template for position `index` without attaching it.
    pub(crate) fn array_item(
        &mut self,
        array: ElementId,
        template: ElementId,
        index: u64,
    ) -> StrataResult<ElementId> {
        let name = format!("{}_{index}", self[template].name);
        let shallow = self.prefers_shallow_clone(template);
        self.clone_element(template, Some(&name), Some(array), shallow)
    }

    /// Appends an item produced by [`DataModel::array_item`].
    pub(crate) fn attach_array_item(&mut self, array: ElementId, item: ElementId) {
        self[item].parent = Some(array);
        self[array].children.push(item);
        if let ElementKind::Array(state) = &mut self[array].kind {
            state.expanded = true;
        }
        self.refresh_names(item);
        let subtree = self.walk(item);
        self.bind_relations_from(&subtree);
        self.invalidate(array);
    }

    /// Choice templates keep their option pool shared across items.
    fn prefers_shallow_clone(&self, template: ElementId) -> bool {
        match &self[template].kind {
            ElementKind::Choice(_) => true,
            ElementKind::Block => match self[template].children.as_slice() {
                [only] => matches!(self[*only].kind, ElementKind::Choice(_)),
                _ => false,
            },
            _ => false,
        }
    }

    /// Forces the generated item count of an array or sequence.
    ///
    /// Items beyond the stored ones are produced by repeating `value`, or the
    /// value of the last stored item (the template when there is none).
    /// `None` removes the override.
    pub fn set_count_override(
        &mut self,
        id: ElementId,
        count: Option<u64>,
        value: Option<BitStream>,
    ) -> StrataResult<()> {
        let repeated = match (count, value) {
            (None, _) => None,
            (Some(_), Some(value)) => Some(value),
            (Some(_), None) => {
                let source = match (self[id].children.last().copied(), &self[id].kind) {
                    (Some(last), _) => Some(last),
                    (None, ElementKind::Array(state)) => state.template,
                    (None, _) => None,
                };
                match source {
                    Some(source) => Some(self.value(source)?),
                    None => Some(BitStream::new()),
                }
            }
        };
        match &mut self[id].kind {
            ElementKind::Array(state) => {
                state.count_override = count;
                state.override_value = repeated;
            }
            ElementKind::Sequence(state) => {
                state.count_override = count;
                state.override_value = repeated;
            }
            _ => {
                return Err(StrataError::construction(
                    self[id].full_name.clone(),
                    "Only arrays and sequences accept a count override.",
                ));
            }
        }
        self.invalidate(id);
        Ok(())
    }

    /// Item count generation will produce.
    pub fn array_count(&self, id: ElementId) -> u64 {
        match &self[id].kind {
            ElementKind::Array(state) => match state.count_override {
                Some(count) => count,
                None if state.expanded => self[id].children.len() as u64,
                None => state.occurs,
            },
            _ => 0,
        }
    }

    pub fn sequence_count(&self, id: ElementId) -> u64 {
        match &self[id].kind {
            ElementKind::Sequence(state) => {
                state.count_override.unwrap_or(self[id].children.len() as u64)
            }
            _ => 0,
        }
    }

    pub(crate) fn array_value(&mut self, id: ElementId) -> StrataResult<BitStream> {
        if let ElementKind::Array(state) = &self[id].kind {
            if !state.expanded {
                let occurs = state.occurs;
                self.expand_to(id, occurs)?;
            }
        }
        self.repeated_value(id)
    }

    pub(crate) fn sequence_value(&mut self, id: ElementId) -> StrataResult<BitStream> {
        self.repeated_value(id)
    }

    fn repeated_value(&mut self, id: ElementId) -> StrataResult<BitStream> {
        let (count, unit) = match &self[id].kind {
            ElementKind::Array(state) => (state.count_override, state.override_value.clone()),
            ElementKind::Sequence(state) => (state.count_override, state.override_value.clone()),
            _ => (None, None),
        };
        let children = self[id].children.clone();
        let Some(count) = count else {
            return self.concat_children(id);
        };
        let stored = (count as usize).min(children.len());
        let mut out = BitStream::new();
        for child in &children[..stored] {
            out.append(&self.value(*child)?);
        }
        let missing = count.saturating_sub(children.len() as u64);
        if missing > 0 {
            out.append(&repeat_bits(&unit.unwrap_or_default(), missing));
        }
        Ok(out)
    }
}
