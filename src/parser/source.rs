//! Definitions of a tree source file.
//!
//! ```yaml
//! main_tree: main          # optional, defaults to "main"
//! trees:
//!   main:
//!     root:
//!       type: Sequence
//!       children:
//!       - type: Sub
//!         ports:
//!           input: "{value}"
//!   Sub:
//!     ports:
//!     - { name: input, direction: in }
//!     autoremap: false
//!     root:
//!       type: IsTrue
//!       name: check_input
//!       _skipIf: "{skip}"
//!       ports:
//!         input: "{input}"
//! ```

use crate::{error::LoadError, PortType};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreeSource {
    #[serde(default = "default_main_tree")]
    pub main_tree: String,
    pub trees: BTreeMap<String, TreeDef>,
}

fn default_main_tree() -> String {
    "main".to_owned()
}

impl TreeSource {
    /// A source with a single tree named `main`.
    pub fn new(root: NodeDef) -> Self {
        let mut trees = BTreeMap::new();
        trees.insert(default_main_tree(), TreeDef::new(root));
        Self {
            main_tree: default_main_tree(),
            trees,
        }
    }

    pub fn with_tree(mut self, name: impl Into<String>, tree: TreeDef) -> Self {
        self.trees.insert(name.into(), tree);
        self
    }

    pub fn from_yaml(text: &str) -> Result<Self, LoadError> {
        Ok(serde_yaml::from_str(text)?)
    }

    pub fn to_yaml(&self) -> Result<String, LoadError> {
        Ok(serde_yaml::to_string(self)?)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreeDef {
    /// Ports a subtree instance can remap.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ports: Vec<TreePortDef>,
    /// Makes every public entry of the parent scope visible.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub autoremap: bool,
    pub root: NodeDef,
}

impl TreeDef {
    pub fn new(root: NodeDef) -> Self {
        Self {
            ports: vec![],
            autoremap: false,
            root,
        }
    }

    pub fn with_port(mut self, name: impl Into<String>, direction: PortType) -> Self {
        self.ports.push(TreePortDef {
            name: name.into(),
            direction,
        });
        self
    }

    pub fn with_autoremap(mut self, autoremap: bool) -> Self {
        self.autoremap = autoremap;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreePortDef {
    pub name: String,
    #[serde(default = "default_direction")]
    pub direction: PortType,
}

fn default_direction() -> PortType {
    PortType::InOut
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeDef {
    /// A registered node type or the name of another tree of the source.
    #[serde(rename = "type")]
    pub ty: String,
    /// Instance name. Defaults to the type name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub ports: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<NodeDef>,
    #[serde(rename = "_skipIf", default, skip_serializing_if = "Option::is_none")]
    pub skip_if: Option<String>,
    #[serde(rename = "_failureIf", default, skip_serializing_if = "Option::is_none")]
    pub failure_if: Option<String>,
    #[serde(rename = "_successIf", default, skip_serializing_if = "Option::is_none")]
    pub success_if: Option<String>,
}

impl NodeDef {
    pub fn new(ty: impl Into<String>) -> Self {
        Self {
            ty: ty.into(),
            name: None,
            ports: BTreeMap::new(),
            children: vec![],
            skip_if: None,
            failure_if: None,
            success_if: None,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_port(mut self, port: impl Into<String>, value: impl Into<String>) -> Self {
        self.ports.insert(port.into(), value.into());
        self
    }

    pub fn with_child(mut self, child: NodeDef) -> Self {
        self.children.push(child);
        self
    }

    pub fn with_skip_if(mut self, guard: impl Into<String>) -> Self {
        self.skip_if = Some(guard.into());
        self
    }

    pub fn with_failure_if(mut self, guard: impl Into<String>) -> Self {
        self.failure_if = Some(guard.into());
        self
    }

    pub fn with_success_if(mut self, guard: impl Into<String>) -> Self {
        self.success_if = Some(guard.into());
        self
    }

    pub fn instance_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.ty)
    }
}
