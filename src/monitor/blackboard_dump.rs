//! Blackboard contents as returned by the BLACKBOARD request.

use crate::{blackboard::Blackboards, ScopeId};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::any::Any;

/// One blackboard scope. Scopes of several instances of the same subtree
/// share a name and are dumped one after another.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScopeDump {
    pub scope: String,
    pub entries: Vec<EntryDump>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntryDump {
    pub key: String,
    #[serde(rename = "type")]
    pub type_name: String,
    /// The entry lives in an ancestor scope and is visible here through a remap.
    pub remapped: bool,
    /// Present for strings, booleans and numbers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
}

/// Dumps the scopes named in `names`, or every scope if `names` is empty.
/// Names that match no scope are skipped.
pub fn dump_scopes(blackboards: &Blackboards, names: &[&str]) -> Vec<ScopeDump> {
    let scopes: Vec<ScopeId> = if names.is_empty() {
        (0..blackboards.len()).collect()
    } else {
        names
            .iter()
            .flat_map(|name| blackboards.find_scopes(name))
            .collect()
    };
    scopes
        .into_iter()
        .filter_map(|scope| dump_scope(blackboards, scope))
        .collect()
}

fn dump_scope(blackboards: &Blackboards, scope: ScopeId) -> Option<ScopeDump> {
    let name = blackboards.scope_name(scope)?.to_owned();
    let mut keys = blackboards.local_keys(scope);
    keys.extend(blackboards.remapped_keys(scope));
    keys.sort_by(|a, b| a.as_str().cmp(b.as_str()));

    let entries = keys
        .into_iter()
        .filter_map(|key| {
            let info = blackboards.entry_info(scope, key)?;
            let value = blackboards.get_any(scope, key)?;
            Some(EntryDump {
                key: key.to_string(),
                type_name: info.type_name.to_owned(),
                remapped: info.remapped,
                value: printable(value.as_ref()),
            })
        })
        .collect();
    Some(ScopeDump {
        scope: name,
        entries,
    })
}

macro_rules! try_numbers {
    ($value:expr, $($ty:ty),*) => {
        $(
            if let Some(number) = $value.downcast_ref::<$ty>() {
                return Some(Value::from(*number));
            }
        )*
    };
}

fn printable(value: &(dyn Any + Send + Sync)) -> Option<Value> {
    if let Some(s) = value.downcast_ref::<String>() {
        return Some(Value::from(s.as_str()));
    }
    if let Some(s) = value.downcast_ref::<&'static str>() {
        return Some(Value::from(*s));
    }
    if let Some(b) = value.downcast_ref::<bool>() {
        return Some(Value::from(*b));
    }
    try_numbers!(value, i8, i16, i32, i64, isize, u8, u16, u32, u64, usize, f32, f64);
    None
}
