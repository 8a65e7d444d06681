use super::{DataModel, ElementId, ElementKind};
use crate::error::StrataResult;
use serde::Serialize;

/// Serializable view of an element and its in-scope children.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct ElementSnapshot {
    pub name: String,
    #[serde(rename = "type")]
    pub type_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<ElementSnapshot>,
}

pub(crate) fn build(model: &mut DataModel, id: ElementId) -> StrataResult<ElementSnapshot> {
    let value = match &model[id].kind {
        ElementKind::String(_)
        | ElementKind::Number(_)
        | ElementKind::Flag(_)
        | ElementKind::Double(_) => {
            Some(model.internal_value(id)?.to_string())
        }
        ElementKind::Blob | ElementKind::Padding(_) => Some(model.value(id)?.to_hex()),
        _ => None,
    };
    let children = model
        .in_scope_children(id)
        .into_iter()
        .map(|child| build(model, child))
        .collect::<StrataResult<Vec<_>>>()?;
    Ok(ElementSnapshot {
        name: model[id].name.clone(),
        type_name: model[id].type_name().to_string(),
        value,
        children,
    })
}
