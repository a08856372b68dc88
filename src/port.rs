use crate::Symbol;
use serde::{Deserialize, Serialize};
use std::fmt::{self, Display, Formatter};

#[derive(Debug, PartialEq, Eq, Clone, Copy, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PortType {
    #[serde(alias = "in")]
    Input,
    #[serde(alias = "out")]
    Output,
    InOut,
}

impl PortType {
    pub fn is_readable(self) -> bool {
        matches!(self, PortType::Input | PortType::InOut)
    }

    pub fn is_writable(self) -> bool {
        matches!(self, PortType::Output | PortType::InOut)
    }
}

impl Display for PortType {
    fn fmt(&self, fmt: &mut Formatter) -> fmt::Result {
        match self {
            Self::Input => write!(fmt, "input"),
            Self::Output => write!(fmt, "output"),
            Self::InOut => write!(fmt, "inout"),
        }
    }
}

/// A port a node declares through [`crate::BehaviorNode::provided_ports`].
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub struct PortSpec {
    pub ty: PortType,
    pub key: Symbol,
}

impl PortSpec {
    pub fn new_in(key: impl Into<Symbol>) -> Self {
        Self {
            ty: PortType::Input,
            key: key.into(),
        }
    }

    pub fn new_out(key: impl Into<Symbol>) -> Self {
        Self {
            ty: PortType::Output,
            key: key.into(),
        }
    }

    pub fn new_inout(key: impl Into<Symbol>) -> Self {
        Self {
            ty: PortType::InOut,
            key: key.into(),
        }
    }
}
