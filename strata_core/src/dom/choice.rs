use super::element::ChoiceCacheEntry;
use super::{DataModel, ElementId, ElementKind};
use crate::bitstream::BitStream;
use crate::error::{StrataError, StrataResult};
use std::sync::Arc;
use tracing::debug;

impl DataModel {
    pub(crate) fn choice_value(&mut self, id: ElementId) -> StrataResult<BitStream> {
        let ElementKind::Choice(state) = &self[id].kind else {
            return Ok(BitStream::new());
        };
        let selected = match (state.selected, state.pool.members.is_empty()) {
            (Some(selected), _) => selected,
            (None, true) => return Ok(BitStream::new()),
            (None, false) => self.select_default(id)?,
        };
        self.value(selected)
    }

    /// Selects the option called `name`, replacing the current selection with a
    /// fresh copy of it. Selecting the current option again is a no-op.
    pub fn select_element(&mut self, choice: ElementId, name: &str) -> StrataResult<ElementId> {
        let ElementKind::Choice(state) = &self[choice].kind else {
            return Err(StrataError::construction(
                self[choice].full_name.clone(),
                format!("{} elements have no options to select.", self[choice].type_name()),
            ));
        };
        if let Some(selected) = state.selected.filter(|s| self[*s].name == name) {
            return Ok(selected);
        }
        let Some(member) = state.pool.members.iter().copied().find(|m| self[*m].name == name) else {
            return Err(StrataError::construction(
                self[choice].full_name.clone(),
                format!("Choice has no option named '{name}'."),
            ));
        };

        let copy = self.clone_element(member, None, Some(choice), true)?;
        self.install_selection(choice, copy);
        debug!(choice = %self[choice].full_name, selected = name, "Selected choice option");
        Ok(copy)
    }

    /// Makes `copy`, a detached copy of one of the options, the current selection.
    ///
    /// Relations from outside the choice that pointed at an option are moved
    /// over to whatever their names resolve to with the new selection in place.
    pub(crate) fn install_selection(&mut self, choice: ElementId, copy: ElementId) {
        self.clear_selection(choice);
        self[copy].parent = Some(choice);
        self[choice].children.push(copy);
        let members = match &mut self[choice].kind {
            ElementKind::Choice(state) => {
                state.selected = Some(copy);
                state.pool.members.clone()
            }
            _ => Vec::new(),
        };
        self.refresh_names(copy);
        let options: Vec<ElementId> = members
            .into_iter()
            .filter(|m| self.contains(*m))
            .flat_map(|m| self.walk(m))
            .collect();
        self.rebind_relations_into(&options);
        let subtree = self.walk(copy);
        self.bind_relations_from(&subtree);
        self.bind_pending();
        self.invalidate(choice);
    }

    /// Drops the current selection, returning the choice to its unresolved state.
    pub(crate) fn clear_selection(&mut self, choice: ElementId) {
        let previous = match &self[choice].kind {
            ElementKind::Choice(state) => state.selected,
            _ => None,
        };
        if let Some(previous) = previous {
            self.detach(previous);
            self.free_subtree(previous);
        }
        if let ElementKind::Choice(state) = &mut self[choice].kind {
            state.selected = None;
        }
    }

    /// Selects the first option.
    pub fn select_default(&mut self, choice: ElementId) -> StrataResult<ElementId> {
        let first = match &self[choice].kind {
            ElementKind::Choice(state) => state.pool.members.first().copied(),
            _ => None,
        };
        match first {
            Some(first) => {
                let name = self[first].name.clone();
                self.select_element(choice, &name)
            }
            None => Err(StrataError::construction(
                self[choice].full_name.clone(),
                "Choice has no options.",
            )),
        }
    }

    pub fn selected(&self, choice: ElementId) -> Option<ElementId> {
        match &self[choice].kind {
            ElementKind::Choice(state) => state.selected,
            _ => None,
        }
    }

    /// Returns the pool's token table, computing it on first use.
    pub(crate) fn choice_token_cache(
        &mut self,
        choice: ElementId,
    ) -> StrataResult<Vec<ChoiceCacheEntry>> {
        let pool = match &self[choice].kind {
            ElementKind::Choice(state) => Arc::clone(&state.pool),
            _ => return Ok(Vec::new()),
        };
        if let Some(cached) = pool.token_cache.get() {
            return Ok(cached.clone());
        }
        let mut entries = Vec::new();
        for member in pool.members.iter().copied() {
            if let Some((offset, token)) = self.leading_token(member)? {
                entries.push(ChoiceCacheEntry {
                    member,
                    name: self[member].name.clone(),
                    offset,
                    token,
                });
            }
        }
        let _ = pool.token_cache.set(entries.clone());
        Ok(entries)
    }

    /// First token in `id` and its bit offset, provided everything before it
    /// has a fixed size.
    fn leading_token(&mut self, id: ElementId) -> StrataResult<Option<(u64, BitStream)>> {
        let node = &self[id];
        if node.is_token && node.default_value.is_some() && !node.kind.is_container() {
            return Ok(Some((0, self.value(id)?)));
        }
        if !matches!(node.kind, ElementKind::Block) || node.transformer.is_some() {
            return Ok(None);
        }
        let mut offset = 0;
        self.scan_for_token(id, &mut offset)
    }

    fn scan_for_token(
        &mut self,
        id: ElementId,
        offset: &mut u64,
    ) -> StrataResult<Option<(u64, BitStream)>> {
        for child in self[id].children.clone() {
            let node = &self[child];
            if node.transformer.is_some() {
                return Ok(None);
            }
            match &node.kind {
                ElementKind::Choice(_)
                | ElementKind::Array(_)
                | ElementKind::Sequence(_)
                | ElementKind::XmlElement(_)
                | ElementKind::XmlAttribute(_) => return Ok(None),
                ElementKind::Block => {
                    if let Some(found) = self.scan_for_token(child, offset)? {
                        return Ok(Some(found));
                    }
                    continue;
                }
                _ => {}
            }
            if node.is_token && node.default_value.is_some() {
                return Ok(Some((*offset, self.value(child)?)));
            }
            match self.length_bits(child)? {
                Some(bits) if self.has_length(child) => *offset += bits,
                _ => return Ok(None),
            }
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::variant::Variant;

    fn choice_model() -> (DataModel, ElementId) {
        let mut model = DataModel::new("Model").unwrap();
        let root = model.root();
        let choice = model.add_element(root, "C", ElementKind::choice()).unwrap();
        for (name, token) in [("A", "AA"), ("B", "BB")] {
            let branch = model.add_element(choice, name, ElementKind::Block).unwrap();
            let len = model.add_element(branch, "pad", ElementKind::Blob).unwrap();
            model.set_length(len, Some(1), crate::dom::LengthType::Bytes).unwrap();
            let tok = model.add_element(branch, "tok", ElementKind::Blob).unwrap();
            model.set_default_value(tok, Variant::from(token)).unwrap();
            model.set_token(tok, true);
        }
        (model, choice)
    }

    #[test]
    fn generation_selects_the_first_option() {
        let (mut model, choice) = choice_model();
        let root = model.root();
        assert_eq!(model.value(root).unwrap().as_bytes(), b"\0AA");
        let selected = model.selected(choice).unwrap();
        assert_eq!(model[selected].name(), "A");
    }

    #[test]
    fn reselecting_is_a_no_op() {
        let (mut model, choice) = choice_model();
        let first = model.select_element(choice, "B").unwrap();
        let again = model.select_element(choice, "B").unwrap();
        assert_eq!(first, again);

        let other = model.select_element(choice, "A").unwrap();
        assert!(model.get(first).is_none(), "Replaced selection must be freed");
        assert_eq!(model[choice].children(), &[other]);
        assert!(model.select_element(choice, "Z").is_err());
    }

    #[test]
    fn token_cache_records_offsets() {
        let (mut model, choice) = choice_model();
        let cache = model.choice_token_cache(choice).unwrap();
        assert_eq!(cache.len(), 2);
        assert_eq!(cache[1].name, "B");
        assert_eq!(cache[1].offset, 8);
        assert_eq!(cache[1].token.as_bytes(), b"BB");
    }
}
