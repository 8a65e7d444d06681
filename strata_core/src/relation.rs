//! Count, size and offset relations.
//!
//! A relation's `from` element receives a value computed from its `of` element
//! during generation. During cracking the direction reverses: the already
//! cracked `from` value tells the cracker how many items, how many bits or
//! which position to expect for `of`.

use crate::dom::{DataModel, ElementId, ElementKind, LengthType};
use crate::error::StrataResult;
use crate::variant::Variant;
use std::collections::HashSet;
use tracing::{trace, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RelationId(pub(crate) usize);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelationKind {
    Size { length_type: LengthType },
    Count,
    Offset {
        relative: bool,
        relative_to: Option<String>,
    },
}

impl RelationKind {
    pub fn tag(&self) -> &'static str {
        match self {
            RelationKind::Size { .. } => "size",
            RelationKind::Count => "count",
            RelationKind::Offset { .. } => "offset",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Relation {
    pub(crate) kind: RelationKind,
    pub(crate) from: ElementId,
    pub(crate) of_name: String,
    pub(crate) of: Option<ElementId>,
    pub(crate) expression_get: Option<String>,
    pub(crate) expression_set: Option<String>,
    pub(crate) recursing: bool,
}

impl Relation {
    pub fn kind(&self) -> &RelationKind {
        &self.kind
    }

    pub fn from(&self) -> ElementId {
        self.from
    }

    pub fn of_name(&self) -> &str {
        &self.of_name
    }

    /// Bound target, if it has been resolved.
    pub fn of(&self) -> Option<ElementId> {
        self.of
    }

    pub fn expression_get(&self) -> Option<&str> {
        self.expression_get.as_deref()
    }

    pub fn expression_set(&self) -> Option<&str> {
        self.expression_set.as_deref()
    }
}

impl DataModel {
    /// Attaches a relation whose value is written into `from`. `of_name` is
    /// resolved lazily against `from`'s position in the tree.
    pub fn add_relation(
        &mut self,
        from: ElementId,
        kind: RelationKind,
        of_name: &str,
    ) -> RelationId {
        let id = RelationId(self.relations.len());
        self.relations.push(Some(Relation {
            kind,
            from,
            of_name: of_name.to_string(),
            of: None,
            expression_get: None,
            expression_set: None,
            recursing: false,
        }));
        self[from].relations.push(id);
        self.invalidate(from);
        id
    }

    pub fn set_relation_expressions(
        &mut self,
        id: RelationId,
        get: Option<&str>,
        set: Option<&str>,
    ) {
        if let Some(rel) = self.relation_mut(id) {
            rel.expression_get = get.map(str::to_string);
            rel.expression_set = set.map(str::to_string);
            let from = rel.from;
            self.invalidate(from);
        }
    }

    pub fn relation(&self, id: RelationId) -> Option<&Relation> {
        self.relations.get(id.0).and_then(Option::as_ref)
    }

    pub(crate) fn relation_mut(&mut self, id: RelationId) -> Option<&mut Relation> {
        self.relations.get_mut(id.0).and_then(Option::as_mut)
    }

    pub fn relation_ids(&self) -> Vec<RelationId> {
        self.relations
            .iter()
            .enumerate()
            .filter_map(|(i, r)| r.as_ref().map(|_| RelationId(i)))
            .collect()
    }

    pub fn remove_relation(&mut self, id: RelationId) {
        self.delete_relation(id);
    }

    pub(crate) fn delete_relation(&mut self, id: RelationId) {
        let Some(rel) = self.relations.get_mut(id.0).and_then(Option::take) else {
            return;
        };
        if let Some(node) = self.get_mut(rel.from) {
            node.relations.retain(|r| *r != id);
        }
        if let Some(of) = rel.of {
            if let Some(node) = self.get_mut(of) {
                node.relations.retain(|r| *r != id);
            }
            self.unsubscribe(of, rel.from);
        }
        self.invalidate(rel.from);
    }

    /// Relations that compute the value of `id`.
    pub fn from_relations(&self, id: ElementId) -> Vec<RelationId> {
        self[id]
            .relations
            .iter()
            .copied()
            .filter(|r| self.relation(*r).is_some_and(|rel| rel.from == id))
            .collect()
    }

    /// Bound relations targeting `id`.
    pub fn relations_of(&self, id: ElementId) -> Vec<RelationId> {
        self[id]
            .relations
            .iter()
            .copied()
            .filter(|r| self.relation(*r).is_some_and(|rel| rel.of == Some(id)))
            .collect()
    }

    /// Returns the relation's target, resolving `of_name` on first use.
    pub fn resolve_relation(&mut self, id: RelationId) -> Option<ElementId> {
        let rel = self.relation(id)?;
        if let Some(of) = rel.of.filter(|of| self.contains(*of)) {
            return Some(of);
        }
        let from = rel.from;
        if !self.contains(from) {
            return None;
        }
        let target = self.find(from, &rel.of_name)?;
        if let Some(rel) = self.relation_mut(id) {
            rel.of = Some(target);
        }
        if !self[target].relations.contains(&id) {
            self[target].relations.push(id);
        }
        self.subscribe(target, from);
        trace!(
            from = %self[from].full_name(),
            of = %self[target].full_name(),
            "Bound relation"
        );
        Some(target)
    }

    /// Drops the binding of every relation touching the subtree so that the
    /// next use re-resolves it from the element's new position.
    pub(crate) fn unbind_relations(&mut self, ids: &[ElementId]) {
        for id in ids {
            for rel_id in self[*id].relations.clone() {
                let Some(rel) = self.relation(rel_id).cloned() else {
                    continue;
                };
                let Some(of) = rel.of else {
                    continue;
                };
                if let Some(node) = self.get_mut(of) {
                    node.relations.retain(|r| *r != rel_id);
                }
                self.unsubscribe(of, rel.from);
                if let Some(rel) = self.relation_mut(rel_id) {
                    rel.of = None;
                }
            }
        }
    }

    /// Resolves every relation whose `from` lies in the given elements.
    pub(crate) fn bind_relations_from(&mut self, ids: &[ElementId]) {
        for id in ids {
            for rel in self.from_relations(*id) {
                self.resolve_relation(rel);
            }
        }
    }

    /// Resolves every relation in the model. Unresolvable ones are logged and
    /// stay unbound.
    pub fn bind_all(&mut self) {
        for id in self.bind_pending() {
            if let Some(rel) = self.relation(id) {
                if self.contains(rel.from) {
                    warn!(
                        from = %self[rel.from].full_name(),
                        of = %rel.of_name,
                        "Unable to resolve relation target"
                    );
                }
            }
        }
    }

    /// Resolves relations that are not bound yet and returns those that still
    /// cannot be.
    pub(crate) fn bind_pending(&mut self) -> Vec<RelationId> {
        let pending: Vec<RelationId> = self
            .relation_ids()
            .into_iter()
            .filter(|id| {
                self.relation(*id)
                    .is_some_and(|rel| !rel.of.is_some_and(|of| self.contains(of)))
            })
            .collect();
        pending
            .into_iter()
            .filter(|id| self.resolve_relation(*id).is_none())
            .collect()
    }

    /// Re-resolves relations owned outside `ids` that are bound to one of them.
    pub(crate) fn rebind_relations_into(&mut self, ids: &[ElementId]) {
        let inside: HashSet<ElementId> = ids.iter().copied().collect();
        let mut moved = Vec::new();
        for id in ids {
            for rel_id in self[*id].relations.clone() {
                let Some(rel) = self.relation(rel_id) else {
                    continue;
                };
                if rel.of != Some(*id) || inside.contains(&rel.from) {
                    continue;
                }
                let from = rel.from;
                self[*id].relations.retain(|r| *r != rel_id);
                self.unsubscribe(*id, from);
                if let Some(rel) = self.relation_mut(rel_id) {
                    rel.of = None;
                }
                moved.push(rel_id);
            }
        }
        for rel_id in moved {
            self.resolve_relation(rel_id);
        }
    }

    /// Value that generation writes into the relation's `from` element.
    ///
    /// Re-entrant calls return `0` so that self-referential graphs terminate.
    /// An unresolvable target yields `None` and leaves the element's own value.
    pub fn calculate_from_value(&mut self, id: RelationId) -> StrataResult<Option<Variant>> {
        let Some(rel) = self.relation(id) else {
            return Ok(None);
        };
        if rel.recursing {
            return Ok(Some(Variant::Int(0)));
        }
        let Some(of) = self.resolve_relation(id) else {
            if let Some(rel) = self.relation(id) {
                warn!(
                    from = %self[rel.from].full_name(),
                    of = %rel.of_name,
                    "Relation target is unresolved, keeping current value"
                );
            }
            return Ok(None);
        };

        if let Some(rel) = self.relation_mut(id) {
            rel.recursing = true;
        }
        let result = self.compute_relation(id, of);
        if let Some(rel) = self.relation_mut(id) {
            rel.recursing = false;
        }
        result
    }

    fn compute_relation(&mut self, id: RelationId, of: ElementId) -> StrataResult<Option<Variant>> {
        let Some(rel) = self.relation(id).cloned() else {
            return Ok(None);
        };
        let (name, amount) = match &rel.kind {
            RelationKind::Size { length_type } => {
                let bits = self.value(of)?.len_bits();
                let size = match length_type {
                    LengthType::Bits => bits,
                    _ => bits.div_ceil(8),
                };
                ("size", size as i64)
            }
            RelationKind::Count => {
                let count = match &self[of].kind {
                    ElementKind::Array(_) => self.array_count(of),
                    ElementKind::Sequence(_) => self.sequence_count(of),
                    other => {
                        warn!(
                            of = %self[of].full_name(),
                            kind = other.type_name(),
                            "Count relation target is not an array"
                        );
                        return Ok(None);
                    }
                };
                ("count", count as i64)
            }
            RelationKind::Offset { .. } => match self.offset_bits(&rel, of)? {
                Some(bits) => ("offset", bits / 8),
                None => {
                    warn!(
                        from = %self[rel.from].full_name(),
                        of = %self[of].full_name(),
                        "Unable to calculate offset"
                    );
                    return Ok(None);
                }
            },
        };
        match &rel.expression_set {
            None => Ok(Some(Variant::Int(amount))),
            Some(expression) => self
                .evaluate_integer(rel.from, expression, &[(name, amount), ("value", amount)])
                .map(Some),
        }
    }

    /// Distance in bits between the offset's origin and `of`.
    fn offset_bits(&mut self, rel: &Relation, of: ElementId) -> StrataResult<Option<i64>> {
        let RelationKind::Offset { relative, relative_to } = &rel.kind else {
            return Ok(None);
        };
        let (anchor, start) = if !relative {
            let root = self.ancestors(rel.from).last().copied().unwrap_or(rel.from);
            (root, 0)
        } else {
            let base = match relative_to {
                Some(name) => match self.find(rel.from, name) {
                    Some(base) => base,
                    None => return Ok(None),
                },
                None => rel.from,
            };
            let Some(anchor) = self.common_parent(base, of) else {
                return Ok(None);
            };
            match self.position_within(anchor, base)? {
                Some(start) => (anchor, start),
                None => return Ok(None),
            }
        };
        // Anything resized under the anchor moves the target.
        self.subscribe(anchor, rel.from);
        let Some(to) = self.position_within(anchor, of)? else {
            return Ok(None);
        };
        Ok(Some(to as i64 - start as i64))
    }

    /// Cracked value of the relation's `from` side, in bits for sizes, items
    /// for counts and bytes for offsets.
    pub fn relation_get_value(&mut self, id: RelationId) -> StrataResult<i64> {
        let Some(rel) = self.relation(id).cloned() else {
            return Ok(0);
        };
        if rel.recursing {
            return Ok(0);
        }
        let raw = match self[rel.from].default_value() {
            Some(value) => value.to_i64()?,
            None => 0,
        };
        let value = match &rel.expression_get {
            None => raw,
            Some(expression) => {
                if let Some(r) = self.relation_mut(id) {
                    r.recursing = true;
                }
                let result = self
                    .evaluate_integer(
                        rel.from,
                        expression,
                        &[(rel.kind.tag(), raw), ("value", raw)],
                    )
                    .and_then(|v| Ok(v.to_i64()?));
                if let Some(r) = self.relation_mut(id) {
                    r.recursing = false;
                }
                result?
            }
        };
        Ok(match &rel.kind {
            RelationKind::Size { length_type } => {
                if value < 0 {
                    value
                } else {
                    self.bits_for(value as u64, *length_type) as i64
                }
            }
            _ => value,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dom::{Endian, StringType};
    use crate::expression::{ExpressionValue, Scope};
    use std::sync::Arc;

    #[test]
    fn size_relation_writes_byte_length() {
        let mut model = DataModel::new("Model").unwrap();
        let root = model.root();
        let len = model
            .add_element(root, "len", ElementKind::number(8, false, Endian::Big))
            .unwrap();
        let data = model.add_element(root, "data", ElementKind::string(StringType::Ascii)).unwrap();
        model.set_default_value(data, Variant::from("hello")).unwrap();
        model.add_relation(len, RelationKind::Size { length_type: LengthType::Bytes }, "data");

        assert_eq!(model.value(root).unwrap().as_bytes(), b"\x05hello");

        model.set_default_value(data, Variant::from("hi")).unwrap();
        assert_eq!(
            model.value(root).unwrap().as_bytes(),
            b"\x02hi",
            "Changing the target must invalidate the size field"
        );
    }

    #[test]
    fn self_referential_size_terminates() {
        let mut model = DataModel::new("Model").unwrap();
        let root = model.root();
        let block = model.add_element(root, "Packet", ElementKind::Block).unwrap();
        let len = model
            .add_element(block, "len", ElementKind::number(16, false, Endian::Big))
            .unwrap();
        let body = model.add_element(block, "body", ElementKind::Blob).unwrap();
        model.set_default_value(body, Variant::from("abcd")).unwrap();
        let size = RelationKind::Size { length_type: LengthType::Bytes };
        let rel = model.add_relation(len, size, "Packet");

        assert_eq!(model.value(root).unwrap().as_bytes(), b"\x00\x06abcd");
        assert_eq!(model.calculate_from_value(rel).unwrap(), Some(Variant::Int(6)));
    }

    #[test]
    fn unresolved_relation_keeps_default() {
        let mut model = DataModel::new("Model").unwrap();
        let root = model.root();
        let len = model
            .add_element(root, "len", ElementKind::number(8, false, Endian::Big))
            .unwrap();
        model.set_default_value(len, Variant::Int(7)).unwrap();
        model.add_relation(len, RelationKind::Count, "Missing");
        assert_eq!(model.value(root).unwrap().as_bytes(), &[7]);
    }

    #[test]
    fn offset_relation_measures_from_root() {
        let mut model = DataModel::new("Model").unwrap();
        let root = model.root();
        let offset = model
            .add_element(root, "offset", ElementKind::number(8, false, Endian::Big))
            .unwrap();
        let gap = model.add_element(root, "gap", ElementKind::Blob).unwrap();
        model.set_default_value(gap, Variant::from("xyz")).unwrap();
        let target = model.add_element(root, "target", ElementKind::Blob).unwrap();
        model.set_default_value(target, Variant::from("T")).unwrap();
        model.add_relation(
            offset,
            RelationKind::Offset {
                relative: false,
                relative_to: None,
            },
            "target",
        );
        assert_eq!(model.value(root).unwrap().as_bytes(), b"\x04xyzT");

        model.set_default_value(gap, Variant::from("xyzxyz")).unwrap();
        assert_eq!(
            model.value(root).unwrap().as_bytes(),
            b"\x07xyzxyzT",
            "Resizing an element before the target must move the offset"
        );
    }

    #[test]
    fn relative_offset_measures_from_the_relation_owner() {
        let mut model = DataModel::new("Model").unwrap();
        let root = model.root();
        let lead = model.add_element(root, "lead", ElementKind::Blob).unwrap();
        model.set_default_value(lead, Variant::from("__")).unwrap();
        let offset = model
            .add_element(root, "offset", ElementKind::number(8, false, Endian::Big))
            .unwrap();
        let gap = model.add_element(root, "gap", ElementKind::Blob).unwrap();
        model.set_default_value(gap, Variant::from("xy")).unwrap();
        model.add_element(root, "target", ElementKind::Blob).unwrap();
        model.add_relation(
            offset,
            RelationKind::Offset {
                relative: true,
                relative_to: None,
            },
            "target",
        );
        assert_eq!(model.value(root).unwrap().as_bytes(), b"__\x03xy");
    }

    #[test]
    fn expressions_post_process_both_directions() {
        let mut model = DataModel::new("Model").unwrap();
        let root = model.root();
        model.set_evaluator(Arc::new(|expr: &str, scope: &Scope| -> StrataResult<ExpressionValue> {
            let value = scope.values["value"].to_i64()?;
            Ok(ExpressionValue::Value(Variant::Int(match expr {
                "value + 1" => value + 1,
                _ => value - 1,
            })))
        }));
        let len = model
            .add_element(root, "len", ElementKind::number(8, false, Endian::Big))
            .unwrap();
        let data = model.add_element(root, "data", ElementKind::Blob).unwrap();
        model.set_default_value(data, Variant::from("abc")).unwrap();
        let size = RelationKind::Size { length_type: LengthType::Bytes };
        let rel = model.add_relation(len, size, "data");
        model.set_relation_expressions(rel, Some("value - 1"), Some("value + 1"));

        assert_eq!(model.value(root).unwrap().as_bytes(), b"\x04abc");
        model.set_default_value(len, Variant::Int(4)).unwrap();
        assert_eq!(
            model.relation_get_value(rel).unwrap(),
            24,
            "3 bytes once the expression undoes the +1"
        );
    }
}
