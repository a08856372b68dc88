use crate::{
    blackboard::{Blackboards, ScopeId},
    error::{TickError, TickResult},
    BBMap, BlackboardValue, NodeUid, PortType, Symbol,
};
use std::{any::Any, str::FromStr};

/// The view of the blackboard a node gets while it is ticked.
///
/// Keys passed to the accessors are port names. They are translated through
/// the node's port map to blackboard keys or literals; a name that is not in
/// the port map is used as a blackboard key as is.
pub struct Context<'a> {
    blackboards: &'a mut Blackboards,
    scope: ScopeId,
    blackboard_map: &'a BBMap,
    uid: NodeUid,
    name: &'a str,
}

impl<'a> Context<'a> {
    pub(crate) fn new(
        blackboards: &'a mut Blackboards,
        scope: ScopeId,
        blackboard_map: &'a BBMap,
        uid: NodeUid,
        name: &'a str,
    ) -> Self {
        Self {
            blackboards,
            scope,
            blackboard_map,
            uid,
            name,
        }
    }

    /// Uid of the node being ticked.
    pub fn uid(&self) -> NodeUid {
        self.uid
    }

    /// Instance name of the node being ticked.
    pub fn name(&self) -> &str {
        self.name
    }

    pub fn get<T: 'static>(&self, key: impl Into<Symbol>) -> Option<&T> {
        let key: Symbol = key.into();
        match self.blackboard_map.get(&key) {
            None => self.blackboards.get(self.scope, key),
            Some(BlackboardValue::Ref(mapped, _)) => self.blackboards.get(self.scope, *mapped),
            Some(BlackboardValue::Literal(literal)) => (literal as &dyn Any).downcast_ref(),
        }
    }

    /// Reads the value, parsing it from a string if the entry holds one (literals always do).
    pub fn get_parse<T>(&self, key: impl Into<Symbol>) -> Option<T>
    where
        T: FromStr + Clone + 'static,
    {
        let key: Symbol = key.into();
        if let Some(value) = self.get::<T>(key) {
            return Some(value.clone());
        }
        if let Some(text) = self.get::<String>(key) {
            return text.trim().parse().ok();
        }
        self.get::<&'static str>(key)
            .and_then(|text| text.trim().parse().ok())
    }

    /// Reads a required input; absence is an error instead of `None`.
    pub fn require<T: 'static>(&self, key: impl Into<Symbol>) -> TickResult<&T> {
        let key: Symbol = key.into();
        let found = match self.blackboard_map.get(&key) {
            None => self.blackboards.get_checked(self.scope, key)?,
            Some(BlackboardValue::Ref(mapped, _)) => {
                self.blackboards.get_checked(self.scope, *mapped)?
            }
            Some(BlackboardValue::Literal(literal)) => {
                return (literal as &dyn Any).downcast_ref().ok_or(TickError::TypeMismatch {
                    key,
                    found: "literal string",
                })
            }
        };
        found.ok_or(TickError::MissingInput { port: key })
    }

    /// Like [`Self::get_parse`], but absence is an error.
    pub fn require_parse<T>(&self, key: impl Into<Symbol>) -> TickResult<T>
    where
        T: FromStr + Clone + 'static,
    {
        let key: Symbol = key.into();
        self.get_parse(key).ok_or(TickError::MissingInput { port: key })
    }

    pub fn set<T: Any + Send + Sync>(&mut self, key: impl Into<Symbol>, val: T) -> TickResult<()> {
        let key: Symbol = key.into();
        match self.blackboard_map.get(&key) {
            None => self.blackboards.set(self.scope, key, val),
            Some(BlackboardValue::Ref(mapped, ty)) => {
                let ty = if matches!(ty, PortType::Input) {
                    PortType::InOut
                } else {
                    *ty
                };
                self.blackboards
                    .set_through_port(self.scope, *mapped, val, ty)
            }
            Some(BlackboardValue::Literal(_)) => {
                return Err(TickError::ReadOnlyPort { port: key })
            }
        }
        Ok(())
    }
}
