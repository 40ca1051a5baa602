use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::{ContentId, HierarchyKey, PlacementId, TreeError};

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct Placement {
    pub placement_id: PlacementId,
    pub content_id: ContentId,
    pub is_category: bool,
    #[serde(default)]
    pub children: Vec<Placement>,
}

impl Placement {
    #[must_use]
    pub fn new(content_id: ContentId, is_category: bool) -> Self {
        Self { placement_id: PlacementId::new(), content_id, is_category, children: Vec::new() }
    }

    /// This placement followed by every descendant, depth-first pre-order.
    #[must_use]
    pub fn subtree(&self) -> Vec<&Placement> {
        let mut out = vec![self];
        out.extend(Descendants::of(self));
        out
    }

    #[must_use]
    pub fn contains(&self, placement_id: PlacementId) -> bool {
        self.subtree().iter().any(|node| node.placement_id == placement_id)
    }
}

/// Lazy depth-first pre-order walk over the descendants of one placement.
///
/// Uses an explicit stack, so adversarially deep hierarchies cost heap, not call stack.
#[derive(Debug)]
pub struct Descendants<'a> {
    stack: Vec<&'a Placement>,
}

impl<'a> Descendants<'a> {
    fn of(placement: &'a Placement) -> Self {
        Self { stack: placement.children.iter().rev().collect() }
    }
}

impl<'a> Iterator for Descendants<'a> {
    type Item = &'a Placement;

    fn next(&mut self) -> Option<Self::Item> {
        let node = self.stack.pop()?;
        self.stack.extend(node.children.iter().rev());
        Some(node)
    }
}

/// One Tree Store document. `revision` is the optimistic-concurrency token the store compares
/// on save.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct Hierarchy {
    pub key: HierarchyKey,
    pub revision: u64,
    pub root: Placement,
}

impl Hierarchy {
    #[must_use]
    pub fn new(key: HierarchyKey, root_content_id: ContentId) -> Self {
        Self { key, revision: 0, root: Placement::new(root_content_id, true) }
    }

    /// The root followed by every placement, pre-order, without materializing the tree.
    fn nodes(&self) -> impl Iterator<Item = &Placement> {
        std::iter::once(&self.root).chain(Descendants::of(&self.root))
    }

    #[must_use]
    pub fn find_by_placement_id(&self, placement_id: PlacementId) -> Option<&Placement> {
        self.nodes().find(|node| node.placement_id == placement_id)
    }

    /// First placement (pre-order) referencing `content_id`. Duplicates are tolerated.
    #[must_use]
    pub fn find_by_content_id(&self, content_id: &ContentId) -> Option<&Placement> {
        self.nodes().find(|node| &node.content_id == content_id)
    }

    /// Placement that directly holds `placement_id` among its children.
    #[must_use]
    pub fn parent_of(&self, placement_id: PlacementId) -> Option<&Placement> {
        self.nodes()
            .find(|node| node.children.iter().any(|child| child.placement_id == placement_id))
    }

    /// Edges between the root and `placement_id`; the root is at depth 0.
    #[must_use]
    pub fn depth_of(&self, placement_id: PlacementId) -> Option<usize> {
        self.path_to(placement_id).map(|path| path.len())
    }

    /// # Errors
    /// Returns [`TreeError::NotFound`] when `parent` is not in this hierarchy, or
    /// [`TreeError::Validation`] when the new placement id is already in use.
    pub fn add_child(
        &mut self,
        parent: PlacementId,
        placement: Placement,
    ) -> Result<(), TreeError> {
        let existing: BTreeSet<PlacementId> = self.nodes().map(|node| node.placement_id).collect();
        if let Some(duplicate) =
            placement.subtree().into_iter().find(|node| existing.contains(&node.placement_id))
        {
            return Err(TreeError::Validation(format!(
                "placement {} already exists in hierarchy {}",
                duplicate.placement_id, self.key
            )));
        }
        self.attach(parent, placement)
    }

    fn attach(&mut self, parent: PlacementId, placement: Placement) -> Result<(), TreeError> {
        let path = self.path_to(parent).ok_or_else(|| self.missing(parent))?;
        let node =
            self.node_at_mut(&path).ok_or_else(|| TreeError::NotFound(parent.to_string()))?;
        node.children.push(placement);
        Ok(())
    }

    /// Detach the subtree rooted at `placement_id` and hand it back intact.
    ///
    /// # Errors
    /// Returns [`TreeError::NotFound`] for unknown placements and [`TreeError::Validation`]
    /// for the root placement.
    pub fn remove_by_placement_id(
        &mut self,
        placement_id: PlacementId,
    ) -> Result<Placement, TreeError> {
        let mut path = self.path_to(placement_id).ok_or_else(|| self.missing(placement_id))?;
        let Some(index) = path.pop() else {
            return Err(TreeError::Validation(format!(
                "root placement of hierarchy {} cannot be removed",
                self.key
            )));
        };
        let parent = self
            .node_at_mut(&path)
            .ok_or_else(|| TreeError::NotFound(placement_id.to_string()))?;
        if index >= parent.children.len() {
            return Err(TreeError::NotFound(placement_id.to_string()));
        }
        Ok(parent.children.remove(index))
    }

    /// Remove-then-add, preserving the moved subtree's internal structure. Returns the moved
    /// subtree as re-attached.
    ///
    /// # Errors
    /// Returns [`TreeError::NotFound`] when either placement is missing, or
    /// [`TreeError::Validation`] when the move targets the root or would place a subtree
    /// beneath itself. Validation happens before anything is detached.
    pub fn move_by_placement_id(
        &mut self,
        placement_id: PlacementId,
        new_parent: PlacementId,
    ) -> Result<Placement, TreeError> {
        let moved =
            self.find_by_placement_id(placement_id).ok_or_else(|| self.missing(placement_id))?;
        if self.find_by_placement_id(new_parent).is_none() {
            return Err(self.missing(new_parent));
        }
        if placement_id == self.root.placement_id {
            return Err(TreeError::Validation("root placement cannot be moved".to_string()));
        }
        if moved.contains(new_parent) {
            return Err(TreeError::Validation(format!(
                "placement {placement_id} cannot be moved beneath itself ({new_parent})"
            )));
        }

        let subtree = self.remove_by_placement_id(placement_id)?;
        let captured = subtree.clone();
        self.attach(new_parent, subtree)?;
        Ok(captured)
    }

    /// # Errors
    /// Returns [`TreeError::NotFound`] when `placement_id` is not in this hierarchy.
    pub fn depth_first_descendants(
        &self,
        placement_id: PlacementId,
    ) -> Result<Descendants<'_>, TreeError> {
        self.find_by_placement_id(placement_id)
            .map(Descendants::of)
            .ok_or_else(|| self.missing(placement_id))
    }

    #[must_use]
    pub fn placement_count(&self) -> usize {
        self.root.subtree().len()
    }

    fn missing(&self, placement_id: PlacementId) -> TreeError {
        TreeError::NotFound(format!("placement {placement_id} in hierarchy {}", self.key))
    }

    fn path_to(&self, placement_id: PlacementId) -> Option<Vec<usize>> {
        let mut stack: Vec<(&Placement, Vec<usize>)> = vec![(&self.root, Vec::new())];
        while let Some((node, path)) = stack.pop() {
            if node.placement_id == placement_id {
                return Some(path);
            }
            for (index, child) in node.children.iter().enumerate().rev() {
                let mut child_path = path.clone();
                child_path.push(index);
                stack.push((child, child_path));
            }
        }
        None
    }

    fn node_at_mut(&mut self, path: &[usize]) -> Option<&mut Placement> {
        let mut node = &mut self.root;
        for &index in path {
            node = node.children.get_mut(index)?;
        }
        Some(node)
    }
}
