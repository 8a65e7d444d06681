//! The element tree.
//!
//! Elements live in an arena owned by [`DataModel`] and refer to each other by
//! [`ElementId`]. Parents own their children through id lists; children keep a
//! non-owning `parent` id. Relations are stored in a model-level table and
//! referenced from both endpoints by [`RelationId`].

mod array;
mod choice;
mod clone;
pub mod codec;
pub mod element;
mod flags;
mod snapshot;
mod value;

pub use element::{
    ArrayState, ChoicePool, ChoiceState, DoubleSpec, ElementKind, Endian, FlagSpec, FlagsSpec,
    NumberSpec, PaddingSpec, SequenceState, StringSpec, StringType, XmlSpec,
};
pub use snapshot::ElementSnapshot;

use crate::bitstream::BitStream;
use crate::config::EngineConfig;
use crate::error::{StrataError, StrataResult};
use crate::expression::ExpressionEvaluator;
use crate::fixup::Fixup;
use crate::relation::{Relation, RelationId};
use crate::transformer::Transformer;
use crate::variant::Variant;
use bitflags::bitflags;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::ops::{Index, IndexMut};
use std::sync::Arc;
use tracing::debug;

/// Handle of an element inside its [`DataModel`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ElementId(pub(crate) usize);

impl ElementId {
    pub fn index(self) -> usize {
        self.0
    }
}

impl fmt::Display for ElementId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

bitflags! {
    /// Pipeline stages a mutated value bypasses.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct MutateOverride: u8 {
        const FIXUP = 0x01;
        const TRANSFORMER = 0x02;
        const TYPE_CONSTRAINTS = 0x04;
        const RELATIONS = 0x08;
        /// The mutated value is already the final bit representation.
        const TYPE_TRANSFORM = 0x20;
    }
}

impl Default for MutateOverride {
    fn default() -> Self {
        MutateOverride::FIXUP
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LengthType {
    #[default]
    Bytes,
    Bits,
    Chars,
}

impl LengthType {
    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag.to_ascii_lowercase().as_str() {
            "bytes" => Some(LengthType::Bytes),
            "bits" => Some(LengthType::Bits),
            "chars" => Some(LengthType::Chars),
            _ => None,
        }
    }

    pub fn tag(self) -> &'static str {
        match self {
            LengthType::Bytes => "bytes",
            LengthType::Bits => "bits",
            LengthType::Chars => "chars",
        }
    }
}

/// Memoized values plus the re-entrancy bookkeeping that decides whether a
/// freshly computed value may be stored.
#[derive(Debug, Clone)]
pub(crate) struct ValueCache {
    pub(crate) internal: Option<Variant>,
    pub(crate) value: Option<BitStream>,
    pub(crate) invalidating: bool,
    pub(crate) recursion_depth: u32,
    pub(crate) int_recursion_depth: u32,
    pub(crate) root_recursion: u32,
    pub(crate) read_cache: bool,
    pub(crate) write_cache: bool,
    pub(crate) fixup_busy: bool,
    pub(crate) padding_busy: bool,
    pub(crate) generate_count: u64,
}

impl Default for ValueCache {
    fn default() -> Self {
        Self {
            internal: None,
            value: None,
            invalidating: false,
            recursion_depth: 0,
            int_recursion_depth: 0,
            root_recursion: 0,
            read_cache: true,
            write_cache: true,
            fixup_busy: false,
            padding_busy: false,
            generate_count: 0,
        }
    }
}

/// One element of the format tree.
#[derive(Debug, Clone)]
pub struct Node {
    pub(crate) name: String,
    pub(crate) full_name: String,
    pub(crate) field_id: Option<String>,
    pub(crate) full_field_id: Option<String>,
    pub(crate) parent: Option<ElementId>,
    pub(crate) children: Vec<ElementId>,
    pub(crate) kind: ElementKind,
    pub(crate) default_value: Option<Variant>,
    pub(crate) mutated_value: Option<Variant>,
    pub(crate) mutation_flags: MutateOverride,
    pub(crate) is_token: bool,
    pub(crate) is_mutable: bool,
    pub(crate) length: Option<u64>,
    pub(crate) length_type: LengthType,
    pub(crate) constraint: Option<String>,
    pub(crate) fixup: Option<Fixup>,
    pub(crate) transformer: Option<Transformer>,
    pub(crate) relations: Vec<RelationId>,
    pub(crate) subscribers: Vec<ElementId>,
    pub(crate) cache: ValueCache,
}

impl Node {
    fn new(name: &str, kind: ElementKind) -> Self {
        Self {
            name: name.to_string(),
            full_name: name.to_string(),
            field_id: None,
            full_field_id: None,
            parent: None,
            children: Vec::new(),
            kind,
            default_value: None,
            mutated_value: None,
            mutation_flags: MutateOverride::default(),
            is_token: false,
            is_mutable: true,
            length: None,
            length_type: LengthType::Bytes,
            constraint: None,
            fixup: None,
            transformer: None,
            relations: Vec::new(),
            subscribers: Vec::new(),
            cache: ValueCache::default(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Dotted path from the root.
    pub fn full_name(&self) -> &str {
        &self.full_name
    }

    pub fn field_id(&self) -> Option<&str> {
        self.field_id.as_deref()
    }

    pub fn full_field_id(&self) -> Option<&str> {
        self.full_field_id.as_deref()
    }

    pub fn parent(&self) -> Option<ElementId> {
        self.parent
    }

    /// Physically stored children. For an unexpanded array this is empty and
    /// for an unresolved choice it holds nothing either.
    pub fn children(&self) -> &[ElementId] {
        &self.children
    }

    pub fn kind(&self) -> &ElementKind {
        &self.kind
    }

    pub fn type_name(&self) -> &'static str {
        self.kind.type_name()
    }

    pub fn default_value(&self) -> Option<&Variant> {
        self.default_value.as_ref()
    }

    pub fn mutated_value(&self) -> Option<&Variant> {
        self.mutated_value.as_ref()
    }

    pub fn mutation_flags(&self) -> MutateOverride {
        self.mutation_flags
    }

    pub fn is_token(&self) -> bool {
        self.is_token
    }

    pub fn is_mutable(&self) -> bool {
        self.is_mutable
    }

    pub fn length(&self) -> Option<u64> {
        self.length
    }

    pub fn length_type(&self) -> LengthType {
        self.length_type
    }

    pub fn constraint(&self) -> Option<&str> {
        self.constraint.as_deref()
    }

    pub fn fixup(&self) -> Option<&Fixup> {
        self.fixup.as_ref()
    }

    pub fn transformer(&self) -> Option<&Transformer> {
        self.transformer.as_ref()
    }

    pub fn relations(&self) -> &[RelationId] {
        &self.relations
    }

    /// Number of times the final value has been materialized.
    pub fn generate_count(&self) -> u64 {
        self.cache.generate_count
    }
}

/// A format tree plus the relations layered on top of it.
#[derive(Clone)]
pub struct DataModel {
    nodes: Vec<Option<Node>>,
    pub(crate) relations: Vec<Option<Relation>>,
    root: ElementId,
    evaluator: Option<Arc<dyn ExpressionEvaluator>>,
    config: EngineConfig,
}

impl fmt::Debug for DataModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DataModel")
            .field("root", &self.root)
            .field("elements", &self.len())
            .field("relations", &self.relations.iter().flatten().count())
            .finish()
    }
}

fn validate_name(path: &str, name: &str) -> StrataResult<()> {
    if name.is_empty() {
        return Err(StrataError::construction(path, "Element names cannot be empty."));
    }
    if name.contains('.') {
        return Err(StrataError::construction(
            path,
            format!("Element name '{name}' cannot contain a '.' character."),
        ));
    }
    Ok(())
}

impl Index<ElementId> for DataModel {
    type Output = Node;

    fn index(&self, id: ElementId) -> &Node {
        match self.nodes.get(id.0) {
            Some(Some(node)) => node,
            _ => panic!("invalid element id {id}"),
        }
    }
}

impl IndexMut<ElementId> for DataModel {
    fn index_mut(&mut self, id: ElementId) -> &mut Node {
        match self.nodes.get_mut(id.0) {
            Some(Some(node)) => node,
            _ => panic!("invalid element id {id}"),
        }
    }
}

impl DataModel {
    /// Creates a model whose root is an empty block called `name`.
    pub fn new(name: &str) -> StrataResult<Self> {
        Self::with_config(name, EngineConfig::default())
    }

    pub fn with_config(name: &str, config: EngineConfig) -> StrataResult<Self> {
        validate_name(name, name)?;
        let mut model = Self {
            nodes: Vec::new(),
            relations: Vec::new(),
            root: ElementId(0),
            evaluator: None,
            config,
        };
        model.root = model.alloc(Node::new(name, ElementKind::Block));
        Ok(model)
    }

    pub fn root(&self) -> ElementId {
        self.root
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn set_config(&mut self, config: EngineConfig) {
        self.config = config;
        self.clear_caches();
    }

    pub fn set_evaluator(&mut self, evaluator: Arc<dyn ExpressionEvaluator>) {
        self.evaluator = Some(evaluator);
    }

    pub fn evaluator(&self) -> Option<Arc<dyn ExpressionEvaluator>> {
        self.evaluator.clone()
    }

    pub fn get(&self, id: ElementId) -> Option<&Node> {
        self.nodes.get(id.0).and_then(Option::as_ref)
    }

    pub(crate) fn get_mut(&mut self, id: ElementId) -> Option<&mut Node> {
        self.nodes.get_mut(id.0).and_then(Option::as_mut)
    }

    pub fn contains(&self, id: ElementId) -> bool {
        self.get(id).is_some()
    }

    /// Number of live elements, including detached ones such as choice pool members.
    pub fn len(&self) -> usize {
        self.nodes.iter().flatten().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub(crate) fn alloc(&mut self, node: Node) -> ElementId {
        self.nodes.push(Some(node));
        ElementId(self.nodes.len() - 1)
    }

    /// Creates a detached element. Attach it with [`DataModel::append_child`].
    pub fn create(&mut self, name: &str, kind: ElementKind) -> StrataResult<ElementId> {
        validate_name(name, name)?;
        kind.validate(name)?;
        Ok(self.alloc(Node::new(name, kind)))
    }

    /// Creates an element and appends it to `parent`.
    pub fn add_element(
        &mut self,
        parent: ElementId,
        name: &str,
        kind: ElementKind,
    ) -> StrataResult<ElementId> {
        let id = self.create(name, kind)?;
        if let Err(e) = self.append_child(parent, id) {
            self.free_subtree(id);
            return Err(e);
        }
        Ok(id)
    }

    pub fn append_child(&mut self, parent: ElementId, child: ElementId) -> StrataResult<()> {
        let index = self[parent].children.len();
        self.insert_child(parent, index, child)
    }

    /// Links a detached element under `parent`.
    ///
    /// Choices add it to their pool, arrays take it as their template, flags
    /// containers validate its bit range. Every other container inserts it at
    /// `index` among its children.
    pub fn insert_child(
        &mut self,
        parent: ElementId,
        index: usize,
        child: ElementId,
    ) -> StrataResult<()> {
        let parent_path = self[parent].full_name.clone();
        if parent == child || self.is_ancestor(child, parent) {
            return Err(StrataError::construction(parent_path, "An element cannot contain itself."));
        }
        if self.is_attached(child) {
            return Err(StrataError::construction(
                self[child].full_name.clone(),
                "Element already has a parent.",
            ));
        }
        let name = self[child].name.clone();
        match &self[parent].kind {
            ElementKind::Choice(state) => {
                if state.pool.members.iter().any(|m| self[*m].name == name) {
                    return Err(StrataError::construction(
                        parent_path,
                        format!("Choice already has an option named '{name}'."),
                    ));
                }
                if let ElementKind::Choice(state) = &mut self[parent].kind {
                    let pool = Arc::make_mut(&mut state.pool);
                    pool.members.push(child);
                    pool.token_cache = Default::default();
                }
            }
            ElementKind::Array(state) => {
                if state.template.is_some() {
                    return Err(StrataError::construction(
                        parent_path,
                        "Array already has a template element.",
                    ));
                }
                if let ElementKind::Array(state) = &mut self[parent].kind {
                    state.template = Some(child);
                }
            }
            ElementKind::Flags(spec) => {
                let spec = *spec;
                self.check_flag_placement(parent, spec, child)?;
                self.check_unique_child(parent, &name)?;
                let index = index.min(self[parent].children.len());
                self[parent].children.insert(index, child);
            }
            ElementKind::XmlAttribute(_) if !self[parent].children.is_empty() => {
                return Err(StrataError::construction(
                    parent_path,
                    "An XML attribute holds exactly one value element.",
                ));
            }
            kind if kind.is_container() => {
                self.check_unique_child(parent, &name)?;
                let index = index.min(self[parent].children.len());
                self[parent].children.insert(index, child);
            }
            kind => {
                return Err(StrataError::construction(
                    parent_path,
                    format!("{} elements cannot hold children.", kind.type_name()),
                ));
            }
        }
        self[child].parent = Some(parent);
        self.refresh_names(child);
        self.invalidate(parent);
        Ok(())
    }

    fn check_unique_child(&self, parent: ElementId, name: &str) -> StrataResult<()> {
        if self[parent].children.iter().any(|c| self[*c].name == name) {
            return Err(StrataError::construction(
                self[parent].full_name.clone(),
                format!("Container already has a child named '{name}'."),
            ));
        }
        Ok(())
    }

    /// True when `child` is referenced from its parent's child list, pool or template.
    pub(crate) fn is_attached(&self, child: ElementId) -> bool {
        let Some(parent) = self[child].parent.filter(|p| self.contains(*p)) else {
            return false;
        };
        let node = &self[parent];
        if node.children.contains(&child) {
            return true;
        }
        match &node.kind {
            ElementKind::Choice(state) => state.pool.members.contains(&child),
            ElementKind::Array(state) => state.template == Some(child),
            _ => false,
        }
    }

    /// Renames an element and re-derives the names of its subtree.
    pub fn rename(&mut self, id: ElementId, name: &str) -> StrataResult<()> {
        validate_name(&self[id].full_name, name)?;
        if let Some(parent) = self[id].parent.filter(|p| self.contains(*p)) {
            let clash = self
                .structural_children(parent)
                .into_iter()
                .any(|sibling| sibling != id && self[sibling].name == name);
            if clash {
                return Err(StrataError::construction(
                    self[parent].full_name.clone(),
                    format!("Container already has a child named '{name}'."),
                ));
            }
        }
        self[id].name = name.to_string();
        self.refresh_names(id);
        Ok(())
    }

    pub fn set_field_id(&mut self, id: ElementId, field_id: Option<&str>) {
        self[id].field_id = field_id.map(str::to_string);
        self.refresh_names(id);
    }

    /// Recomputes `full_name` and `full_field_id` for `id` and everything below it.
    pub(crate) fn refresh_names(&mut self, id: ElementId) {
        let mut stack = vec![id];
        while let Some(current) = stack.pop() {
            let node = &self[current];
            let (full_name, full_field_id) = match node.parent.and_then(|p| self.get(p)) {
                Some(parent) => {
                    let field_ids = (parent.full_field_id.as_deref(), node.field_id.as_deref());
                    let full_field_id = match field_ids {
                        (Some(base), Some(own)) => Some(format!("{base}.{own}")),
                        (None, own) => own.map(str::to_string),
                        (base, None) => base.map(str::to_string),
                    };
                    (format!("{}.{}", parent.full_name, node.name), full_field_id)
                }
                None => (node.name.clone(), node.field_id.clone()),
            };
            self[current].full_name = full_name;
            self[current].full_field_id = full_field_id;
            stack.extend(self.structural_children(current));
        }
    }

    /// Children, array template and owned pool members.
    pub(crate) fn structural_children(&self, id: ElementId) -> Vec<ElementId> {
        let node = &self[id];
        let mut out = node.children.clone();
        match &node.kind {
            ElementKind::Array(state) => out.extend(state.template),
            ElementKind::Choice(state) => out.extend(
                state
                    .pool
                    .members
                    .iter()
                    .copied()
                    .filter(|m| {
                        self.get(*m).is_some_and(|n| n.parent == Some(id))
                            && !node.children.contains(m)
                    }),
            ),
            _ => {}
        }
        out
    }

    /// Children that take part in generation and name lookup.
    pub fn in_scope_children(&self, id: ElementId) -> Vec<ElementId> {
        let node = &self[id];
        match &node.kind {
            ElementKind::Choice(state) => match state.selected {
                Some(selected) => vec![selected],
                None => state.pool.members.clone(),
            },
            ElementKind::Array(state) if !state.expanded => state.template.into_iter().collect(),
            _ => node.children.clone(),
        }
    }

    pub fn child_by_name(&self, id: ElementId, name: &str) -> Option<ElementId> {
        self.in_scope_children(id)
            .into_iter()
            .find(|c| self.get(*c).is_some_and(|n| n.name == name))
    }

    pub fn parent(&self, id: ElementId) -> Option<ElementId> {
        self[id].parent.filter(|p| self.contains(*p))
    }

    /// Parent chain, nearest first.
    pub fn ancestors(&self, id: ElementId) -> Vec<ElementId> {
        let mut out = Vec::new();
        let mut current = self.parent(id);
        while let Some(p) = current {
            out.push(p);
            current = self.parent(p);
        }
        out
    }

    pub fn is_ancestor(&self, ancestor: ElementId, id: ElementId) -> bool {
        self.ancestors(id).contains(&ancestor)
    }

    /// Smallest element containing both `a` and `b` (either may be the answer).
    pub fn common_parent(&self, a: ElementId, b: ElementId) -> Option<ElementId> {
        let mut chain_a = vec![a];
        chain_a.extend(self.ancestors(a));
        let mut chain_b: HashSet<ElementId> = self.ancestors(b).into_iter().collect();
        chain_b.insert(b);
        chain_a.into_iter().find(|x| chain_b.contains(x))
    }

    /// Pre-order walk over in-scope elements starting at `id`.
    pub fn walk(&self, id: ElementId) -> Vec<ElementId> {
        let mut out = Vec::new();
        let mut stack = vec![id];
        while let Some(current) = stack.pop() {
            out.push(current);
            let children = self.in_scope_children(current);
            stack.extend(children.into_iter().rev());
        }
        out
    }

    fn enumerate_all(&self, id: ElementId) -> Vec<ElementId> {
        let mut out = Vec::new();
        let mut to_visit = vec![self.in_scope_children(id)];
        while !to_visit.is_empty() {
            let elems = to_visit.remove(0);
            for (index, item) in elems.into_iter().enumerate() {
                to_visit.insert(index, self.in_scope_children(item));
                out.push(item);
            }
        }
        out
    }

    /// Candidate order for name resolution: own descendants, then each
    /// ancestor's children and their descendants, closest first.
    fn enumerate_up_tree(&self, id: ElementId) -> Vec<ElementId> {
        let mut out = self.enumerate_all(id);
        let mut skip = id;
        let mut next = self.parent(id);
        while let Some(parent) = next {
            let children = self.in_scope_children(parent);
            out.extend(children.iter().copied());
            for child in children.into_iter().filter(|c| *c != skip) {
                out.extend(self.enumerate_all(child));
            }
            skip = parent;
            next = self.parent(parent);
        }
        out.push(skip);
        out
    }

    /// Resolves a dotted element reference relative to `from`.
    pub fn find(&self, from: ElementId, path: &str) -> Option<ElementId> {
        let parts: Vec<&str> = path.split('.').collect();
        if parts.len() == 1 && self[from].name == path {
            return Some(from);
        }
        self.enumerate_up_tree(from)
            .into_iter()
            .filter(|candidate| self[*candidate].name == parts[0])
            .find_map(|candidate| {
                parts[1..]
                    .iter()
                    .try_fold(candidate, |current, part| self.child_by_name(current, part))
            })
    }

    /// Looks an element up by its dotted path from the root.
    pub fn element_by_full_name(&self, full_name: &str) -> Option<ElementId> {
        let mut parts = full_name.split('.');
        let first = parts.next()?;
        if self[self.root].name != first {
            return None;
        }
        parts.try_fold(self.root, |current, part| self.child_by_name(current, part))
    }

    pub fn set_default_value(&mut self, id: ElementId, value: Variant) -> StrataResult<()> {
        let node = &self[id];
        let sanitized = element::sanitize(
            &node.kind,
            &node.full_name,
            &value,
            node.length,
            node.length_type,
        )?;
        self[id].default_value = Some(sanitized);
        self.invalidate(id);
        Ok(())
    }

    pub fn clear_default_value(&mut self, id: ElementId) {
        self[id].default_value = None;
        self.invalidate(id);
    }

    /// Stores a mutator supplied value and the stages it bypasses.
    pub fn set_mutated_value(
        &mut self,
        id: ElementId,
        value: Option<Variant>,
        flags: MutateOverride,
    ) {
        self[id].mutated_value = value;
        self[id].mutation_flags = flags;
        self.invalidate(id);
    }

    /// Declares a fixed size. Re-sanitizes the current default against it.
    pub fn set_length(
        &mut self,
        id: ElementId,
        length: Option<u64>,
        length_type: LengthType,
    ) -> StrataResult<()> {
        if self[id].kind.intrinsic_bits().is_some() {
            return Err(StrataError::construction(
                self[id].full_name.clone(),
                format!("{} elements have a fixed size.", self[id].type_name()),
            ));
        }
        if length_type == LengthType::Chars && !matches!(self[id].kind, ElementKind::String(_)) {
            return Err(StrataError::construction(
                self[id].full_name.clone(),
                "Only strings support a length in characters.",
            ));
        }
        let previous = (self[id].length, self[id].length_type);
        self[id].length = length;
        self[id].length_type = length_type;
        if let Some(current) = self[id].default_value.clone() {
            if let Err(e) = self.set_default_value(id, current) {
                (self[id].length, self[id].length_type) = previous;
                return Err(e);
            }
        }
        self.invalidate(id);
        Ok(())
    }

    pub fn set_token(&mut self, id: ElementId, is_token: bool) {
        self[id].is_token = is_token;
    }

    pub fn set_mutable(&mut self, id: ElementId, is_mutable: bool) {
        self[id].is_mutable = is_mutable;
    }

    pub fn set_constraint(&mut self, id: ElementId, constraint: Option<&str>) {
        self[id].constraint = constraint.map(str::to_string);
    }

    pub fn set_fixup(&mut self, id: ElementId, fixup: Option<Fixup>) {
        self.unsubscribe_fixup(id);
        self[id].fixup = fixup;
        self.invalidate(id);
    }

    pub fn set_transformer(&mut self, id: ElementId, transformer: Option<Transformer>) {
        self[id].transformer = transformer;
        self.invalidate(id);
    }

    /// Sets the `aligned_to` reference of a padding element.
    pub fn set_aligned_to(&mut self, id: ElementId, aligned_to: Option<&str>) -> StrataResult<()> {
        let previous = match &mut self[id].kind {
            ElementKind::Padding(spec) => {
                spec.aligned_to = aligned_to.map(str::to_string);
                spec.bound.take()
            }
            _ => {
                return Err(StrataError::construction(
                    self[id].full_name.clone(),
                    "Only padding elements can be aligned.",
                ));
            }
        };
        if let Some(previous) = previous {
            self.unsubscribe(previous, id);
        }
        self.invalidate(id);
        Ok(())
    }

    /// Sets the occurrence bounds of an array. `None` for `max_occurs` is unbounded.
    pub fn set_occurs(
        &mut self,
        id: ElementId,
        min_occurs: u64,
        max_occurs: Option<u64>,
        occurs: u64,
    ) -> StrataResult<()> {
        let path = self[id].full_name.clone();
        if let Some(max) = max_occurs {
            if min_occurs > max {
                return Err(StrataError::construction(
                    path,
                    format!("minOccurs {min_occurs} is greater than maxOccurs {max}."),
                ));
            }
        }
        match &mut self[id].kind {
            ElementKind::Array(state) => {
                state.min_occurs = min_occurs;
                state.max_occurs = max_occurs;
                state.occurs = occurs;
            }
            _ => return Err(StrataError::construction(path, "Only arrays have occurrence bounds.")),
        }
        self.invalidate(id);
        Ok(())
    }

    pub(crate) fn subscribe(&mut self, target: ElementId, subscriber: ElementId) {
        if let Some(node) = self.get_mut(target) {
            if !node.subscribers.contains(&subscriber) {
                node.subscribers.push(subscriber);
            }
        }
    }

    pub(crate) fn unsubscribe(&mut self, target: ElementId, subscriber: ElementId) {
        if let Some(node) = self.get_mut(target) {
            node.subscribers.retain(|s| *s != subscriber);
        }
    }

    fn unsubscribe_fixup(&mut self, id: ElementId) {
        let bound: Vec<ElementId> = match self[id].fixup.as_mut() {
            Some(fixup) => fixup.take_bindings(),
            None => Vec::new(),
        };
        for target in bound {
            self.unsubscribe(target, id);
        }
    }

    /// Removes an element and its subtree from the model.
    pub fn remove(&mut self, id: ElementId) -> StrataResult<()> {
        if id == self.root {
            return Err(StrataError::construction(
                self[id].full_name.clone(),
                "The root element cannot be removed.",
            ));
        }
        self.detach(id);
        self.free_subtree(id);
        Ok(())
    }

    /// Unlinks `id` from its parent without freeing it.
    pub(crate) fn detach(&mut self, id: ElementId) {
        let subtree = self.owned_subtree(id);
        self.unbind_relations(&subtree);
        let Some(parent) = self.parent(id) else {
            self[id].parent = None;
            return;
        };
        let node = &mut self[parent];
        node.children.retain(|c| *c != id);
        match &mut node.kind {
            ElementKind::Choice(state) => {
                if state.selected == Some(id) {
                    state.selected = None;
                }
                if state.pool.members.contains(&id) {
                    let pool = Arc::make_mut(&mut state.pool);
                    pool.members.retain(|m| *m != id);
                    pool.token_cache = Default::default();
                }
            }
            ElementKind::Array(state) => {
                if state.template == Some(id) {
                    state.template = None;
                }
            }
            _ => {}
        }
        self[id].parent = None;
        self.refresh_names(id);
        self.invalidate(parent);
    }

    /// Every id owned by `id`'s subtree. Choice pools are included once every
    /// choice sharing them is part of the subtree.
    fn owned_subtree(&self, id: ElementId) -> Vec<ElementId> {
        let mut out = Vec::new();
        let mut seen = HashSet::new();
        let mut stack = vec![id];
        loop {
            while let Some(current) = stack.pop() {
                if !self.contains(current) || !seen.insert(current) {
                    continue;
                }
                out.push(current);
                let node = &self[current];
                stack.extend(node.children.iter().copied());
                if let ElementKind::Array(state) = &node.kind {
                    stack.extend(state.template);
                }
            }
            let mut sharers: HashMap<*const ChoicePool, (usize, &Arc<ChoicePool>)> = HashMap::new();
            for current in &out {
                if let ElementKind::Choice(state) = &self[*current].kind {
                    sharers.entry(Arc::as_ptr(&state.pool)).or_insert((0, &state.pool)).0 += 1;
                }
            }
            for (count, pool) in sharers.into_values() {
                if count == Arc::strong_count(pool) {
                    stack.extend(pool.members.iter().filter(|m| !seen.contains(*m)));
                }
            }
            if stack.is_empty() {
                return out;
            }
        }
    }

    /// Releases a detached subtree and unwinds every reference into it.
    pub(crate) fn free_subtree(&mut self, id: ElementId) {
        let ids = self.owned_subtree(id);
        let set: HashSet<ElementId> = ids.iter().copied().collect();

        let relation_ids: HashSet<RelationId> = ids
            .iter()
            .flat_map(|i| self[*i].relations.iter().copied())
            .collect();
        for rel_id in relation_ids {
            let Some(rel) = self.relation(rel_id).cloned() else {
                continue;
            };
            if set.contains(&rel.from) {
                self.delete_relation(rel_id);
            } else if let Some(of) = rel.of.filter(|of| set.contains(of)) {
                if let Some(Some(r)) = self.relations.get_mut(rel_id.0) {
                    r.of = None;
                }
                self[of].relations.retain(|r| *r != rel_id);
                self.invalidate(rel.from);
            }
        }

        let mut outside_subscribers = Vec::new();
        for current in &ids {
            let subscribed_to: Vec<ElementId> = {
                let node = &self[*current];
                let mut targets: Vec<ElementId> =
                    node.fixup.as_ref().map(Fixup::bound).unwrap_or_default();
                if let ElementKind::Padding(spec) = &node.kind {
                    targets.extend(spec.bound);
                }
                targets
            };
            for target in subscribed_to.into_iter().filter(|t| !set.contains(t)) {
                self.unsubscribe(target, *current);
            }
            outside_subscribers.extend(
                self[*current]
                    .subscribers
                    .iter()
                    .copied()
                    .filter(|s| !set.contains(s)),
            );
        }

        for current in &ids {
            if let ElementKind::Choice(state) = &self[*current].kind {
                if Arc::strong_count(&state.pool) > 1 {
                    let shared: Vec<ElementId> = state.pool.members.clone();
                    for member in shared {
                        if let Some(node) = self.get_mut(member) {
                            if node.parent == Some(*current) {
                                node.parent = None;
                            }
                        }
                    }
                }
            }
        }
        for current in &ids {
            self.nodes[current.0] = None;
        }

        for subscriber in outside_subscribers {
            if !self.contains(subscriber) {
                continue;
            }
            let node = &mut self[subscriber];
            if let Some(fixup) = node.fixup.as_mut() {
                fixup.forget(&set);
            }
            if let ElementKind::Padding(spec) = &mut node.kind {
                if spec.bound.is_some_and(|b| set.contains(&b)) {
                    spec.bound = None;
                }
            }
            self.invalidate(subscriber);
        }
        debug!(element = %id, freed = ids.len(), "Freed subtree");
    }

    /// True when the element's size is known without looking at the input.
    pub fn has_length(&self, id: ElementId) -> bool {
        let node = &self[id];
        if node.kind.intrinsic_bits().is_some() || node.length.is_some() {
            return true;
        }
        node.is_token && node.default_value.is_some()
    }

    /// Declared size in bits, if it can be computed without reading input.
    pub fn length_bits(&mut self, id: ElementId) -> StrataResult<Option<u64>> {
        let node = &self[id];
        if let Some(bits) = node.kind.intrinsic_bits() {
            return Ok(Some(bits));
        }
        match (node.length, node.length_type, &node.kind) {
            (Some(len), LengthType::Bytes, _) => Ok(Some(len * 8)),
            (Some(len), LengthType::Bits, _) => Ok(Some(len)),
            (Some(len), LengthType::Chars, ElementKind::String(spec)) => {
                Ok(spec.string_type.char_width_bits().map(|w| w * len))
            }
            (Some(_), LengthType::Chars, _) => Ok(None),
            (None, _, _) if node.is_token && node.default_value.is_some() => {
                Ok(Some(self.value(id)?.len_bits()))
            }
            (None, _, _) => Ok(None),
        }
    }

    /// True when the cracker can find this element's extent from its own
    /// description, even if the size is not a fixed number.
    pub fn is_deterministic(&self, id: ElementId) -> bool {
        if let ElementKind::String(spec) = &self[id].kind {
            if self[id].length.is_none() && spec.null_terminated {
                return true;
            }
            if self[id].length.is_some() && self[id].length_type == LengthType::Chars {
                return true;
            }
        }
        self.has_length(id)
    }

    /// Serializable view of the in-scope tree.
    pub fn snapshot(&mut self) -> StrataResult<ElementSnapshot> {
        let root = self.root;
        snapshot::build(self, root)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> (DataModel, ElementId, ElementId, ElementId) {
        let mut model = DataModel::new("Model").unwrap();
        let root = model.root();
        let header = model.add_element(root, "Header", ElementKind::Block).unwrap();
        let magic = model.add_element(header, "Magic", ElementKind::Blob).unwrap();
        let body = model.add_element(root, "Body", ElementKind::Block).unwrap();
        (model, header, magic, body)
    }

    #[test]
    fn full_names_follow_tree_position() {
        let (mut model, header, magic, body) = sample();
        assert_eq!(model[magic].full_name(), "Model.Header.Magic");

        model.rename(header, "Head").unwrap();
        assert_eq!(model[magic].full_name(), "Model.Head.Magic", "Rename must refresh the subtree");

        model.detach(magic);
        model.append_child(body, magic).unwrap();
        assert_eq!(
            model[magic].full_name(),
            "Model.Body.Magic",
            "Reparent must refresh the subtree"
        );
    }

    #[test]
    fn field_ids_join_along_ancestors() {
        let (mut model, header, magic, _) = sample();
        model.set_field_id(header, Some("hdr"));
        model.set_field_id(magic, Some("m"));
        assert_eq!(model[magic].full_field_id(), Some("hdr.m"));
    }

    #[test]
    fn duplicate_and_dotted_names_are_rejected() {
        let (mut model, header, _, _) = sample();
        assert!(model.add_element(header, "Magic", ElementKind::Blob).is_err());
        assert!(model.add_element(header, "a.b", ElementKind::Blob).is_err());
        let before = model.len();
        assert!(model.add_element(header, "Magic", ElementKind::Blob).is_err());
        assert_eq!(model.len(), before, "A rejected element must not leak into the arena");
    }

    #[test]
    fn leaves_cannot_hold_children() {
        let (mut model, _, magic, _) = sample();
        let err = model.add_element(magic, "Inner", ElementKind::Blob).unwrap_err();
        assert!(err.to_string().contains("Blob elements cannot hold children"));
    }

    #[test]
    fn find_prefers_nearby_elements_and_supports_paths() {
        let (mut model, header, magic, body) = sample();
        let other_magic = model.add_element(body, "Magic", ElementKind::Blob).unwrap();

        assert_eq!(model.find(body, "Magic"), Some(other_magic), "Own descendants come first");
        assert_eq!(model.find(header, "Magic"), Some(magic));
        assert_eq!(model.find(other_magic, "Header.Magic"), Some(magic));
        assert_eq!(model.find(magic, "Model"), Some(model.root()));
        assert_eq!(model.find(magic, "Missing"), None);
        assert_eq!(model.element_by_full_name("Model.Body.Magic"), Some(other_magic));
    }

    #[test]
    fn remove_frees_the_whole_subtree() {
        let (mut model, header, magic, _) = sample();
        let before = model.len();
        model.remove(header).unwrap();
        assert_eq!(model.len(), before - 2);
        assert!(model.get(magic).is_none());
        assert!(model.remove(model.root()).is_err());
    }

    #[test]
    fn common_parent_is_the_smallest_enclosing_element() {
        let (model, header, magic, body) = sample();
        assert_eq!(model.common_parent(magic, body), Some(model.root()));
        assert_eq!(model.common_parent(magic, header), Some(header));
    }

    #[test]
    fn length_changes_resanitize_the_default() {
        let (mut model, _, magic, _) = sample();
        model.set_default_value(magic, Variant::from("abcd")).unwrap();
        assert!(model.set_length(magic, Some(2), LengthType::Bytes).is_err());
        model.set_length(magic, Some(6), LengthType::Bytes).unwrap();
        assert_eq!(model[magic].default_value(), Some(&Variant::Bytes(b"abcd\0\0".to_vec())));
    }
}
