use crate::{BlackboardValue, NodeKind, NodeUid, PortType, Tree};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Namespace of the tree_id fingerprints.
const TREE_ID_NAMESPACE: Uuid = Uuid::from_u128(0x6b1d_58a3_3c2e_4e0f_9d4a_b7e1_2f90_c5d8);

/// The FULLTREE payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreeDescription {
    pub tree_id: String,
    pub nodes: Vec<NodeDescription>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeDescription {
    pub uid: NodeUid,
    pub name: String,
    pub registration_name: String,
    pub kind: NodeKind,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<NodeUid>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ports: Vec<PortDescription>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortDescription {
    pub name: String,
    pub direction: PortType,
    /// `{key}` or a literal, as written in the tree source.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mapping: Option<String>,
}

impl TreeDescription {
    /// Describes the tree and stamps the description with its fingerprint.
    pub fn from_tree(tree: &Tree) -> Result<Self, serde_yaml::Error> {
        let nodes = tree
            .slots()
            .iter()
            .map(|slot| {
                let mut ports: Vec<_> = slot
                    .ports
                    .iter()
                    .map(|port| PortDescription {
                        name: port.key.to_string(),
                        direction: port.ty,
                        mapping: slot.blackboard_map.get(&port.key).map(BlackboardValue::to_string),
                    })
                    .collect();
                // Mappings accepted without a declared port
                let mut undeclared: Vec<_> = slot
                    .blackboard_map
                    .iter()
                    .filter(|(key, _)| !slot.ports.iter().any(|port| port.key == **key))
                    .map(|(key, value)| PortDescription {
                        name: key.to_string(),
                        direction: PortType::InOut,
                        mapping: Some(value.to_string()),
                    })
                    .collect();
                undeclared.sort_by(|a, b| a.name.cmp(&b.name));
                ports.extend(undeclared);
                NodeDescription {
                    uid: slot.uid,
                    name: slot.name.clone(),
                    registration_name: slot.registration_name.clone(),
                    kind: slot.kind,
                    children: slot.children.clone(),
                    ports,
                }
            })
            .collect();
        let mut description = Self {
            tree_id: String::new(),
            nodes,
        };
        description.tree_id = description.fingerprint()?.to_string();
        Ok(description)
    }

    /// UUID v5 of the description text with a blank tree_id.
    pub fn fingerprint(&self) -> Result<Uuid, serde_yaml::Error> {
        let blank = Self {
            tree_id: String::new(),
            nodes: self.nodes.clone(),
        };
        let text = serde_yaml::to_string(&blank)?;
        Ok(Uuid::new_v5(&TREE_ID_NAMESPACE, text.as_bytes()))
    }

    /// The tree_id as it appears in reply headers; zeroed if the field is malformed.
    pub fn tree_id_bytes(&self) -> [u8; 16] {
        Uuid::parse_str(&self.tree_id)
            .map(|id| *id.as_bytes())
            .unwrap_or_default()
    }

    pub fn to_yaml(&self) -> Result<String, serde_yaml::Error> {
        serde_yaml::to_string(self)
    }

    pub fn from_yaml(text: &str) -> Result<Self, serde_yaml::Error> {
        serde_yaml::from_str(text)
    }
}

/// What the server answers FULLTREE with, computed once per topology.
#[derive(Debug, Clone)]
pub(crate) struct Topology {
    pub(crate) text: String,
    pub(crate) tree_id: [u8; 16],
    pub(crate) num_nodes: usize,
}

impl Topology {
    pub(crate) fn describe(tree: &Tree) -> Result<Self, serde_yaml::Error> {
        let description = TreeDescription::from_tree(tree)?;
        Ok(Self {
            text: description.to_yaml()?,
            tree_id: description.tree_id_bytes(),
            num_nodes: description.nodes.len(),
        })
    }
}
