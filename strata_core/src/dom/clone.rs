use super::element::ChoicePool;
use super::{DataModel, ElementId, ElementKind, ValueCache, validate_name};
use crate::error::StrataResult;
use crate::relation::Relation;
use std::collections::HashMap;
use std::sync::{Arc, OnceLock};
use tracing::trace;

impl DataModel {
    /// Copies the subtree rooted at `id`.
    ///
    /// The copy is named `new_name` (or keeps the original name) and gets a
    /// non-owning link to `parent` without being inserted into it. Relations
    /// owned inside the subtree are duplicated and references that named the
    /// old root are renamed with it. A shallow copy shares the option pools of
    /// nested choices instead of duplicating them.
    pub fn clone_element(
        &mut self,
        id: ElementId,
        new_name: Option<&str>,
        parent: Option<ElementId>,
        shallow: bool,
    ) -> StrataResult<ElementId> {
        let old_name = self[id].name.clone();
        let name = new_name.unwrap_or(&old_name).to_string();
        validate_name(&self[id].full_name, &name)?;

        let mut map: HashMap<ElementId, ElementId> = HashMap::new();
        let mut order = Vec::new();
        let mut stack = vec![id];
        while let Some(current) = stack.pop() {
            if map.contains_key(&current) || !self.contains(current) {
                continue;
            }
            let mut node = self[current].clone();
            node.relations.clear();
            node.subscribers.clear();
            node.cache = ValueCache::default();
            if let Some(fixup) = node.fixup.as_mut() {
                fixup.take_bindings();
            }
            if let ElementKind::Padding(spec) = &mut node.kind {
                spec.bound = None;
            }
            let copy = self.alloc(node);
            map.insert(current, copy);
            order.push(current);

            let source = &self[current];
            stack.extend(source.children.iter().rev().copied());
            match &source.kind {
                ElementKind::Array(state) => stack.extend(state.template),
                ElementKind::Choice(state) if !shallow => {
                    stack.extend(state.pool.members.iter().copied())
                }
                _ => {}
            }
        }

        let remap = |x: ElementId| map.get(&x).copied().unwrap_or(x);
        for original in &order {
            let node = &mut self[map[original]];
            node.parent = node.parent.map(remap);
            node.children = node.children.iter().copied().map(remap).collect();
            match &mut node.kind {
                ElementKind::Array(state) => state.template = state.template.map(remap),
                ElementKind::Choice(state) => {
                    state.selected = state.selected.map(remap);
                    if !shallow {
                        state.pool = Arc::new(ChoicePool {
                            members: state.pool.members.iter().copied().map(remap).collect(),
                            token_cache: OnceLock::new(),
                        });
                    }
                }
                _ => {}
            }
        }

        let root = map[&id];
        self[root].name = name.clone();
        self[root].parent = parent;
        self.refresh_names(root);

        let rename = |reference: &str| -> Option<String> {
            if name == old_name {
                return None;
            }
            let mut parts = reference.splitn(2, '.');
            match (parts.next(), parts.next()) {
                (Some(first), rest) if first == old_name => Some(match rest {
                    Some(rest) => format!("{name}.{rest}"),
                    None => name.clone(),
                }),
                _ => None,
            }
        };

        for original in &order {
            let copy = map[original];

            for rel_id in self.from_relations(*original) {
                let Some(rel) = self.relation(rel_id).cloned() else {
                    continue;
                };
                let target = rel
                    .of
                    .filter(|of| self.contains(*of))
                    .or_else(|| self.find(*original, &rel.of_name));
                let of_name = match target.filter(|t| map.contains_key(t)) {
                    Some(_) => rename(&rel.of_name).unwrap_or(rel.of_name.clone()),
                    None => rel.of_name.clone(),
                };
                let new_id = crate::relation::RelationId(self.relations.len());
                self.relations.push(Some(Relation {
                    of_name,
                    from: copy,
                    of: None,
                    recursing: false,
                    ..rel
                }));
                self[copy].relations.push(new_id);
            }

            let fixup_ref = self[copy].fixup.as_ref().map(|f| f.reference().to_string());
            if let Some(reference) = fixup_ref {
                let inside = self.find(*original, &reference).is_some_and(|t| map.contains_key(&t));
                if let Some(renamed) = rename(&reference).filter(|_| inside) {
                    if let Some(fixup) = self[copy].fixup.as_mut() {
                        fixup.set_reference(renamed);
                    }
                }
            }

            let aligned_to = match &self[copy].kind {
                ElementKind::Padding(spec) => spec.aligned_to.clone(),
                _ => None,
            };
            if let Some(reference) = aligned_to {
                let inside = self.find(*original, &reference).is_some_and(|t| map.contains_key(&t));
                if let Some(renamed) = rename(&reference).filter(|_| inside) {
                    if let ElementKind::Padding(spec) = &mut self[copy].kind {
                        spec.aligned_to = Some(renamed);
                    }
                }
            }
        }

        let copies: Vec<ElementId> = order.iter().map(|o| map[o]).collect();
        self.bind_relations_from(&copies);
        trace!(
            source = %self[id].full_name,
            copy = %self[root].full_name,
            elements = copies.len(),
            shallow,
            "Cloned element"
        );
        Ok(root)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dom::{Endian, LengthType};
    use crate::relation::RelationKind;
    use crate::variant::Variant;

    #[test]
    fn clones_are_independent() {
        let mut model = DataModel::new("Model").unwrap();
        let root = model.root();
        let block = model.add_element(root, "Item", ElementKind::Block).unwrap();
        let leaf = model.add_element(block, "v", ElementKind::Blob).unwrap();
        model.set_default_value(leaf, Variant::from("x")).unwrap();

        let copy = model.clone_element(block, Some("Item_1"), Some(root), false).unwrap();
        model.append_child(root, copy).unwrap();
        let copy_leaf = model.child_by_name(copy, "v").unwrap();
        assert_eq!(model[copy_leaf].full_name(), "Model.Item_1.v");

        model.set_default_value(copy_leaf, Variant::from("y")).unwrap();
        assert_eq!(model.value(root).unwrap().as_bytes(), b"xy");
    }

    #[test]
    fn internal_relations_follow_the_copy() {
        let mut model = DataModel::new("Model").unwrap();
        let root = model.root();
        let block = model.add_element(root, "Rec", ElementKind::Block).unwrap();
        let len = model
            .add_element(block, "len", ElementKind::number(8, false, Endian::Big))
            .unwrap();
        let data = model.add_element(block, "data", ElementKind::Blob).unwrap();
        model.set_default_value(data, Variant::from("abc")).unwrap();
        model.add_relation(len, RelationKind::Size { length_type: LengthType::Bytes }, "Rec.data");

        let copy = model.clone_element(block, Some("Rec2"), Some(root), false).unwrap();
        model.append_child(root, copy).unwrap();
        let copy_len = model.child_by_name(copy, "len").unwrap();
        let copy_data = model.child_by_name(copy, "data").unwrap();

        let rel = model.from_relations(copy_len)[0];
        assert_eq!(model.relation(rel).unwrap().of_name(), "Rec2.data");

        model.set_default_value(copy_data, Variant::from("hello")).unwrap();
        assert_eq!(model.value(root).unwrap().as_bytes(), b"\x03abc\x05hello");
        assert_eq!(model.relation(rel).unwrap().of(), Some(copy_data));
    }

    #[test]
    fn shallow_clones_share_choice_pools() {
        let mut model = DataModel::new("Model").unwrap();
        let root = model.root();
        let choice = model.add_element(root, "C", ElementKind::choice()).unwrap();
        model.add_element(choice, "A", ElementKind::Blob).unwrap();
        model.add_element(choice, "B", ElementKind::Blob).unwrap();

        let shallow = model.clone_element(choice, Some("C1"), Some(root), true).unwrap();
        let deep = model.clone_element(choice, Some("C2"), Some(root), false).unwrap();
        let state = |m: &DataModel, id: ElementId| match m[id].kind() {
            ElementKind::Choice(s) => s.clone(),
            _ => unreachable!(),
        };
        assert!(state(&model, choice).shares_pool_with(&state(&model, shallow)));
        assert!(!state(&model, choice).shares_pool_with(&state(&model, deep)));
        assert_eq!(state(&model, deep).pool().members().len(), 2);
    }
}
