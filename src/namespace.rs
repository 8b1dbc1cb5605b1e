//! Hierarchical namespace of named firmware objects
//!
//! The tree owns its nodes through parent-to-child links; child-to-parent
//! links are weak, so dropping a subtree cannot leak through back edges.
//! Each node's object slot is its own lock: replacing the object (e.g. by
//! `CopyObject`) is safe while other threads hold references into the old
//! object.

use crate::error::AmlError;
use crate::name::{AmlName, NameSeg};
use crate::object::{Method, NativeMethod, Object, ObjectRef};
use crate::sync::AmlMutex;

use std::str::FromStr;
use std::sync::{Arc, RwLock, Weak};

use bitflags::bitflags;

bitflags! {
    /// Per-node attributes fixed at creation.
    pub struct NodeFlags: u8 {
        /// Created inside a method body; unlinked when the method returns.
        const METHOD_LOCAL = 0x01;
        /// Predefined scope; survives table unload.
        const PERMANENT = 0x02;
    }
}

/// Shared handle to a namespace node.
pub type NodeRef = Arc<Node>;

/// Owner id for nodes installed by the core itself.
pub const OWNER_CORE: u32 = 0;

/// Named entry in the namespace tree.
#[derive(Debug)]
pub struct Node {
    name: NameSeg,
    parent: Weak<Node>,
    object: RwLock<ObjectRef>,
    children: RwLock<Vec<NodeRef>>,
    flags: NodeFlags,
    owner: u32,
}

impl Node {
    fn new(name: NameSeg, parent: &NodeRef, object: ObjectRef, flags: NodeFlags, owner: u32) -> NodeRef {
        Arc::new(Self {
            name,
            parent: Arc::downgrade(parent),
            object: RwLock::new(object),
            children: RwLock::new(Vec::new()),
            flags,
            owner,
        })
    }

    /// Four-character node name.
    pub const fn name(&self) -> NameSeg {
        self.name
    }

    /// Parent node; `None` for the root or an unlinked node whose parent
    /// is gone.
    pub fn parent(&self) -> Option<NodeRef> {
        self.parent.upgrade()
    }

    /// Current object cell. Cheap: clones the `Arc`, not the value.
    pub fn object(&self) -> ObjectRef {
        match self.object.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Atomically replace the node's object.
    ///
    /// Holders of references into the previous object keep it alive; later
    /// lookups observe `object`.
    pub fn set_object(&self, object: ObjectRef) {
        let mut slot = match self.object.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *slot = object;
    }

    /// Node attributes.
    pub const fn flags(&self) -> NodeFlags {
        self.flags
    }

    /// Id of the table or client that installed the node.
    pub const fn owner(&self) -> u32 {
        self.owner
    }

    /// Child with the given name, by exact four-byte match.
    pub fn child(&self, name: NameSeg) -> Option<NodeRef> {
        self.children_snapshot()
            .into_iter()
            .find(|child| child.name == name)
    }

    /// Children at this instant, in installation order.
    pub fn children_snapshot(&self) -> Vec<NodeRef> {
        match self.children.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn link_child(&self, child: NodeRef) -> Result<(), AmlError> {
        let mut children = match self.children.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if children.iter().any(|c| c.name == child.name) {
            return Err(AmlError::AlreadyExists(child.name.to_string()));
        }
        children.push(child);
        Ok(())
    }

    fn unlink_child(&self, name: NameSeg) -> Option<NodeRef> {
        let mut children = match self.children.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let at = children.iter().position(|c| c.name == name)?;
        Some(children.remove(at))
    }

    /// Absolute path of this node, `\` for the root.
    ///
    /// A node whose ancestor chain has been dropped renders from the
    /// deepest ancestor still reachable.
    pub fn absolute_path(&self) -> String {
        if self.parent.upgrade().is_none() {
            return String::from("\\");
        }
        let mut segments = vec![self.name];
        let mut cursor = self.parent();
        while let Some(node) = cursor {
            if node.parent().is_none() {
                break;
            }
            segments.push(node.name);
            cursor = node.parent();
        }
        let mut path = String::from("\\");
        for (i, seg) in segments.iter().rev().enumerate() {
            if i > 0 {
                path.push('.');
            }
            path.push_str(seg.as_str());
        }
        path
    }
}

/// Traversal verdict returned by walk callbacks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WalkControl {
    /// Descend into this node's children.
    Continue,
    /// Skip the children, continue with siblings.
    SkipSubtree,
    /// Abort the walk.
    Stop,
}

/// The namespace tree.
#[derive(Debug)]
pub struct Namespace {
    root: NodeRef,
}

impl Namespace {
    /// Fresh namespace holding the predefined scopes and objects.
    pub fn new() -> Self {
        // The root's segment is never matched against; any valid name works.
        let root = Arc::new(Node {
            name: NameSeg::from_str("____").expect("root segment"),
            parent: Weak::new(),
            object: RwLock::new(ObjectRef::new(Object::Uninitialized)),
            children: RwLock::new(Vec::new()),
            flags: NodeFlags::PERMANENT,
            owner: OWNER_CORE,
        });
        let ns = Self { root };
        ns.install_predefined();
        ns
    }

    fn install_predefined(&self) {
        for scope in ["_GPE", "_PR_", "_SB_", "_SI_", "_TZ_"] {
            let _ = self.install_at(
                &self.root,
                scope.parse().expect("predefined scope name"),
                ObjectRef::new(Object::Uninitialized),
                NodeFlags::PERMANENT,
                OWNER_CORE,
            );
        }
        let predefined: [(&str, Object); 4] = [
            (
                "_OSI",
                Object::Method(Arc::new(Method::native(NativeMethod::OsiQuery, 1))),
            ),
            ("_REV", Object::Integer(crate::consts::INTERPRETER_REVISION)),
            ("_OS_", Object::string("Microsoft Windows NT")),
            ("_GL_", Object::Mutex(Arc::new(AmlMutex::new(0)))),
        ];
        for (name, object) in predefined {
            let _ = self.install_at(
                &self.root,
                name.parse().expect("predefined object name"),
                ObjectRef::new(object),
                NodeFlags::PERMANENT,
                OWNER_CORE,
            );
        }
    }

    /// Root node.
    pub fn root(&self) -> &NodeRef {
        &self.root
    }

    /// Resolve `name` against `scope` with the AML search rules: a bare
    /// single segment searches the parent chain; anything anchored or
    /// multi-segment is interpreted as written.
    pub fn find(&self, scope: &NodeRef, name: &AmlName) -> Result<NodeRef, AmlError> {
        if name.is_null() {
            return Err(AmlError::NotFound(String::from("<null name>")));
        }
        if name.searches_parents() {
            let seg = name.segments()[0];
            let mut cursor = Some(scope.clone());
            while let Some(node) = cursor {
                if let Some(found) = node.child(seg) {
                    return Ok(found);
                }
                cursor = node.parent();
            }
            return Err(AmlError::NotFound(name.to_string()));
        }
        let base = self.anchor(scope, name)?;
        let mut node = base;
        for seg in name.segments() {
            node = node
                .child(*seg)
                .ok_or_else(|| AmlError::NotFound(name.to_string()))?;
        }
        Ok(node)
    }

    /// Install a new node for `name` resolved against `scope`.
    ///
    /// Intermediate segments must already exist; the final segment must
    /// not. Creation never applies the parent-chain search rule.
    pub fn install(
        &self,
        scope: &NodeRef,
        name: &AmlName,
        object: ObjectRef,
        flags: NodeFlags,
        owner: u32,
    ) -> Result<NodeRef, AmlError> {
        let (last, parents) = match name.segments().split_last() {
            Some(pair) => pair,
            None => return Err(AmlError::InvalidArgument("empty name for install")),
        };
        let mut node = self.anchor(scope, name)?;
        for seg in parents {
            node = node
                .child(*seg)
                .ok_or_else(|| AmlError::NotFound(name.to_string()))?;
        }
        self.install_at(&node, AmlName::single(*last), object, flags, owner)
    }

    fn install_at(
        &self,
        parent: &NodeRef,
        name: AmlName,
        object: ObjectRef,
        flags: NodeFlags,
        owner: u32,
    ) -> Result<NodeRef, AmlError> {
        let seg = name
            .last_seg()
            .ok_or(AmlError::InvalidArgument("empty name for install"))?;
        let node = Node::new(seg, parent, object, flags, owner);
        parent.link_child(node.clone())?;
        Ok(node)
    }

    fn anchor(&self, scope: &NodeRef, name: &AmlName) -> Result<NodeRef, AmlError> {
        let mut base = if name.is_absolute() {
            self.root.clone()
        } else {
            scope.clone()
        };
        for _ in 0..name.parent_hops() {
            base = base
                .parent()
                .ok_or_else(|| AmlError::NotFound(name.to_string()))?;
        }
        Ok(base)
    }

    /// Unlink `node` from its parent. The node (and its object) stay alive
    /// for existing holders; lookups no longer see it.
    pub fn remove(&self, node: &NodeRef) {
        if let Some(parent) = node.parent() {
            parent.unlink_child(node.name());
        }
    }

    /// Unlink every non-permanent node installed by `owner`.
    ///
    /// Children installed by other owners under a removed node are removed
    /// with it; table unload takes the whole subtree.
    pub fn remove_owner(&self, owner: u32) {
        let mut work = vec![self.root.clone()];
        while let Some(node) = work.pop() {
            for child in node.children_snapshot() {
                if child.owner() == owner && !child.flags().contains(NodeFlags::PERMANENT) {
                    node.unlink_child(child.name());
                } else {
                    work.push(child);
                }
            }
        }
    }

    /// Depth-first pre-order walk from `from`, iterative.
    pub fn walk(&self, from: &NodeRef, mut visit: impl FnMut(&NodeRef, usize) -> WalkControl) {
        let mut stack = vec![(from.clone(), 0usize)];
        while let Some((node, depth)) = stack.pop() {
            match visit(&node, depth) {
                WalkControl::Stop => return,
                WalkControl::SkipSubtree => continue,
                WalkControl::Continue => {
                    let children = node.children_snapshot();
                    for child in children.into_iter().rev() {
                        stack.push((child, depth + 1));
                    }
                }
            }
        }
    }
}

impl Default for Namespace {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn name(text: &str) -> AmlName {
        text.parse().expect("test name")
    }

    fn install(ns: &Namespace, path: &str, object: Object) -> NodeRef {
        ns.install(
            ns.root(),
            &name(path),
            ObjectRef::new(object),
            NodeFlags::empty(),
            1,
        )
        .expect("install")
    }

    #[test]
    fn predefined_scopes_exist() {
        let ns = Namespace::new();
        for path in ["\\_SB_", "\\_GPE", "\\_PR_", "\\_TZ_", "\\_SI_", "\\_OSI", "\\_GL_"] {
            assert!(ns.find(ns.root(), &name(path)).is_ok(), "{path}");
        }
    }

    #[test]
    fn absolute_and_relative_lookup() {
        let ns = Namespace::new();
        install(&ns, "\\_SB_.PCI0", Object::Device);
        install(&ns, "\\_SB_.PCI0.VEND", Object::Integer(0x8086));

        let sb = ns.find(ns.root(), &name("\\_SB_")).unwrap();
        let vend = ns.find(&sb, &name("PCI0.VEND")).unwrap();
        assert_eq!(vend.absolute_path(), "\\_SB_.PCI0.VEND");
    }

    #[test]
    fn single_segment_searches_parent_chain() {
        let ns = Namespace::new();
        install(&ns, "\\VAL_", Object::Integer(7));
        install(&ns, "\\_SB_.PCI0", Object::Device);
        let pci0 = ns.find(ns.root(), &name("\\_SB_.PCI0")).unwrap();

        // VAL_ is three levels up from PCI0; a bare segment finds it.
        assert!(ns.find(&pci0, &name("VAL_")).is_ok());
        // A dotted path does not search upward.
        assert!(ns.find(&pci0, &name("^^^BOGS.VAL_")).is_err());
    }

    #[test]
    fn parent_hops_anchor_resolution() {
        let ns = Namespace::new();
        install(&ns, "\\_SB_.PCI0", Object::Device);
        install(&ns, "\\_SB_.LID_", Object::Device);
        let pci0 = ns.find(ns.root(), &name("\\_SB_.PCI0")).unwrap();
        let lid = ns.find(&pci0, &name("^LID_")).unwrap();
        assert_eq!(lid.absolute_path(), "\\_SB_.LID_");
    }

    #[test]
    fn duplicate_install_is_rejected() {
        let ns = Namespace::new();
        install(&ns, "\\FOO_", Object::Integer(1));
        let dup = ns.install(
            ns.root(),
            &name("\\FOO_"),
            ObjectRef::new(Object::Integer(2)),
            NodeFlags::empty(),
            1,
        );
        assert!(matches!(dup, Err(AmlError::AlreadyExists(_))));
    }

    #[test]
    fn removed_nodes_keep_their_objects() {
        let ns = Namespace::new();
        let node = install(&ns, "\\TMP_", Object::Integer(9));
        let object = node.object();
        ns.remove(&node);
        assert!(ns.find(ns.root(), &name("\\TMP_")).is_err());
        assert!(matches!(*object.read(), Object::Integer(9)));
    }

    #[test]
    fn remove_owner_takes_subtrees() {
        let ns = Namespace::new();
        install(&ns, "\\_SB_.DEV0", Object::Device);
        ns.install(
            ns.root(),
            &name("\\_SB_.DEV0.CHLD"),
            ObjectRef::new(Object::Integer(1)),
            NodeFlags::empty(),
            2,
        )
        .unwrap();
        ns.remove_owner(1);
        assert!(ns.find(ns.root(), &name("\\_SB_.DEV0")).is_err());
        assert!(ns.find(ns.root(), &name("\\_SB_")).is_ok());
    }

    #[test]
    fn walk_visits_depth_first() {
        let ns = Namespace::new();
        install(&ns, "\\_SB_.AAA_", Object::Device);
        install(&ns, "\\_SB_.AAA_.BBB_", Object::Device);
        let mut seen = Vec::new();
        let sb = ns.find(ns.root(), &name("\\_SB_")).unwrap();
        ns.walk(&sb, |node, depth| {
            seen.push((node.name().to_string(), depth));
            WalkControl::Continue
        });
        assert_eq!(
            seen,
            vec![
                ("_SB_".into(), 0),
                ("AAA_".into(), 1),
                ("BBB_".into(), 2)
            ]
        );
    }
}
