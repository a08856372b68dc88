use super::source::{NodeDef, TreeDef, TreePortDef, TreeSource};
use crate::{
    blackboard::{Blackboards, ScopeId, ROOT_SCOPE},
    error::LoadError,
    node::{Behavior, NodeSlot, Preconditions},
    BBMap, BlackboardValue, NodeKind, NodeStatus, NodeUid, NumChildren, PortSpec, PortType,
    Registry, Tree,
};
use tracing::debug;

/// Parses a YAML tree source and instantiates its main tree, checking ports.
pub fn load_yaml(text: &str, registry: &Registry) -> Result<Tree, LoadError> {
    let source = TreeSource::from_yaml(text)?;
    load(&source, registry, true)
}

/// Instantiate a behavior tree from a tree source.
///
/// Nodes get their uids in depth-first pre-order, the root being 0, and subtrees
/// are expanded in place.
///
/// `check_ports` enables static checking of port availability before actually ticking.
/// It is useful to catch errors in a behavior tree source file, but you need to
/// implement [`crate::BehaviorNode::provided_ports`] to use it.
pub fn load(
    tree_source: &TreeSource,
    registry: &Registry,
    check_ports: bool,
) -> Result<Tree, LoadError> {
    let main = tree_source
        .trees
        .get(&tree_source.main_tree)
        .ok_or_else(|| LoadError::MissingTree(tree_source.main_tree.clone()))?;

    let mut builder = Builder {
        tree_source,
        registry,
        check_ports,
        nodes: vec![],
        blackboards: Blackboards::new(),
    };
    let top = TreeStack {
        name: &tree_source.main_tree,
        ports: &main.ports,
        parent: None,
    };
    builder.add_node(&main.root, None, ROOT_SCOPE, &top)?;
    debug!(
        nodes = builder.nodes.len(),
        scopes = builder.blackboards.len(),
        "behavior tree loaded"
    );
    Ok(Tree::from_parts(builder.nodes, builder.blackboards))
}

/// A mechanism to detect infinite recursion. It is a linked list in call stack.
/// You can traverse the link back to enumerate all the subtree names (which is effectively function names)
/// and check if a subtree name to be inserted is already there.
///
/// Recursive subtrees would need lazy instantiation, and uids must be known
/// before the first tick, so they are an error. Without this check they would
/// overflow the stack.
struct TreeStack<'a, 'src> {
    name: &'src str,
    /// Ports declared by the tree being expanded.
    ports: &'src [TreePortDef],
    parent: Option<&'a TreeStack<'a, 'src>>,
}

impl<'a, 'src> TreeStack<'a, 'src> {
    fn find(&self, name: &str) -> bool {
        if self.name == name {
            true
        } else if let Some(parent) = self.parent {
            parent.find(name)
        } else {
            false
        }
    }

    fn declared_direction(&self, key: &str) -> Option<PortType> {
        self.ports
            .iter()
            .find(|port| port.name == key)
            .map(|port| port.direction)
    }
}

struct Builder<'src> {
    tree_source: &'src TreeSource,
    registry: &'src Registry,
    check_ports: bool,
    nodes: Vec<NodeSlot>,
    blackboards: Blackboards,
}

impl<'src> Builder<'src> {
    fn add_node(
        &mut self,
        def: &'src NodeDef,
        parent: Option<NodeUid>,
        scope: ScopeId,
        stack: &TreeStack<'_, 'src>,
    ) -> Result<NodeUid, LoadError> {
        let uid = NodeUid::try_from(self.nodes.len())
            .map_err(|_| LoadError::TooManyNodes(self.nodes.len()))?;

        let (kind, behavior, subtree) = match self.registry.build(&def.ty) {
            Some((kind, behavior)) => (kind, behavior, None),
            None => {
                let tree = self
                    .tree_source
                    .trees
                    .get(&def.ty)
                    .ok_or_else(|| LoadError::MissingNode(def.ty.clone()))?;
                // Prevent infinite recursion
                if stack.find(&def.ty) {
                    return Err(LoadError::InfiniteRecursion {
                        node: def.ty.clone(),
                    });
                }
                (NodeKind::SubTree, Behavior::SubTree, Some(tree))
            }
        };

        let ports: Vec<PortSpec> = match subtree {
            Some(tree) => tree
                .ports
                .iter()
                .map(|port| PortSpec {
                    key: port.name.as_str().into(),
                    ty: port.direction,
                })
                .collect(),
            None => behavior.provided_ports(),
        };
        let blackboard_map = self.port_map(def, &ports, stack)?;
        let preconditions = Preconditions {
            failure_if: def.failure_if.as_deref().map(parse_guard),
            success_if: def.success_if.as_deref().map(parse_guard),
            skip_if: def.skip_if.as_deref().map(parse_guard),
        };

        let num_children = if subtree.is_some() {
            if !def.children.is_empty() {
                return Err(LoadError::TooManyChildren {
                    node: def.instance_name().to_owned(),
                    max: 0,
                });
            }
            1
        } else {
            def.children.len()
        };
        if let NumChildren::Finite(max) = behavior.max_children() {
            if num_children > max {
                return Err(LoadError::TooManyChildren {
                    node: def.instance_name().to_owned(),
                    max,
                });
            }
        }
        let min = behavior.min_children();
        if num_children < min {
            return Err(LoadError::MissingChild {
                node: def.instance_name().to_owned(),
                min,
            });
        }

        self.nodes.push(NodeSlot {
            uid,
            name: def.instance_name().to_owned(),
            registration_name: def.ty.clone(),
            kind,
            behavior,
            children: vec![],
            parent,
            status: NodeStatus::Idle,
            ports,
            blackboard_map,
            scope,
            preconditions,
        });

        let children = match subtree {
            Some(tree) => {
                let child_scope = self.subtree_scope(def, tree, scope);
                let tree_stack = TreeStack {
                    name: &def.ty,
                    ports: &tree.ports,
                    parent: Some(stack),
                };
                vec![self.add_node(&tree.root, Some(uid), child_scope, &tree_stack)?]
            }
            None => def
                .children
                .iter()
                .map(|child| self.add_node(child, Some(uid), scope, stack))
                .collect::<Result<Vec<_>, _>>()?,
        };
        self.nodes[uid as usize].children = children;
        Ok(uid)
    }

    fn port_map(
        &self,
        def: &NodeDef,
        ports: &[PortSpec],
        stack: &TreeStack,
    ) -> Result<BBMap, LoadError> {
        let mut bbmap = BBMap::new();
        for (port, value) in &def.ports {
            let spec = ports.iter().find(|spec| spec.key == port.as_str());
            let ty = match spec {
                Some(spec) => spec.ty,
                None if self.check_ports => {
                    return Err(LoadError::PortUnmatch {
                        node: def.ty.clone(),
                        port: port.clone(),
                    })
                }
                None => PortType::InOut,
            };
            let value = BlackboardValue::parse(port, value, ty);
            if self.check_ports {
                match &value {
                    BlackboardValue::Literal(_) if ty == PortType::Output => {
                        return Err(LoadError::LiteralToOutput {
                            node: def.ty.clone(),
                            port: port.clone(),
                        })
                    }
                    // Writing to a key the enclosing subtree only accepts as input
                    BlackboardValue::Ref(key, _)
                        if ty.is_writable()
                            && stack.declared_direction(key.as_str())
                                == Some(PortType::Input) =>
                    {
                        return Err(LoadError::PortIOUnmatch {
                            node: def.ty.clone(),
                            port: port.clone(),
                        })
                    }
                    _ => (),
                }
            }
            bbmap.insert(port.as_str().into(), value);
        }
        Ok(bbmap)
    }

    /// Creates the blackboard scope of a subtree instance and wires its ports.
    fn subtree_scope(&mut self, def: &NodeDef, tree: &TreeDef, parent: ScopeId) -> ScopeId {
        let scope = self.blackboards.create_child(parent, def.instance_name());
        self.blackboards.set_autoremap(scope, tree.autoremap);
        for port in &tree.ports {
            let Some(value) = def.ports.get(&port.name) else {
                continue;
            };
            match BlackboardValue::parse(&port.name, value, port.direction) {
                BlackboardValue::Ref(key, _) => {
                    self.blackboards
                        .add_remap(scope, port.name.as_str(), key)
                }
                BlackboardValue::Literal(literal) => {
                    self.blackboards.set(scope, port.name.as_str(), literal)
                }
            }
        }
        scope
    }
}

fn parse_guard(text: &str) -> BlackboardValue {
    BlackboardValue::parse("", text, PortType::Input)
}
