//! Folder-tree resolution of bulk selections.
//!
//! Works on the full folder list of one workspace, so the tree is walked in memory
//! instead of with one query per level.

use std::collections::{HashMap, HashSet};

use stowage_core::models::{Folder, Selection};
use stowage_core::FolderId;

/// How the folder part of a [`Selection`] maps onto the folder tree.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ResolvedFolders {
    /// Selected folders and their descendants, minus excluded subtrees.
    pub included: Vec<FolderId>,
    /// Included folders whose subtree contains no exclusion, deepest first.
    pub removable: Vec<FolderId>,
    /// Topmost included folders that can move as a unit.
    pub move_roots: Vec<FolderId>,
    /// Included folders that contain an exclusion. They stay in place and their
    /// included direct children move on their own.
    pub split: Vec<FolderId>,
    /// Selected folder ids that are not part of the workspace.
    pub unknown: Vec<FolderId>,
}

pub struct FolderTree<'a> {
    parents: HashMap<&'a FolderId, Option<&'a FolderId>>,
    children: HashMap<&'a FolderId, Vec<&'a FolderId>>,
}

impl<'a> FolderTree<'a> {
    pub fn new(folders: &'a [Folder]) -> Self {
        let mut parents = HashMap::with_capacity(folders.len());
        let mut children: HashMap<&FolderId, Vec<&FolderId>> = HashMap::new();
        for folder in folders {
            parents.insert(&folder.id, folder.parent_id.as_ref());
            if let Some(parent) = &folder.parent_id {
                children.entry(parent).or_default().push(&folder.id);
            }
        }
        Self { parents, children }
    }

    pub fn contains(&self, id: &FolderId) -> bool {
        self.parents.contains_key(id)
    }

    /// `id` and every folder above it, nearest first.
    pub fn ancestors_and_self(&self, id: &'a FolderId) -> Vec<&'a FolderId> {
        let mut chain = Vec::new();
        let mut current = Some(id);
        while let Some(folder) = current {
            // Guards against a corrupt parent loop.
            if chain.contains(&folder) {
                break;
            }
            chain.push(folder);
            current = self.parents.get(folder).copied().flatten();
        }
        chain
    }

    fn depth(&self, id: &FolderId) -> usize {
        let mut depth = 0;
        let mut current = self.parents.get(id).copied().flatten();
        while let Some(parent) = current {
            depth += 1;
            if depth > self.parents.len() {
                break;
            }
            current = self.parents.get(parent).copied().flatten();
        }
        depth
    }

    fn children_of(&self, id: &FolderId) -> &[&'a FolderId] {
        self.children.get(id).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Resolve the folder part of `selection`. `excluded_file_folders` holds the folder
    /// of every excluded file that lives in a folder.
    pub fn resolve(
        &self,
        selection: &'a Selection,
        excluded_file_folders: &'a [FolderId],
    ) -> ResolvedFolders {
        let excluded: HashSet<&FolderId> = selection.excluded_folders.iter().collect();

        // Folders with an exclusion somewhere below them, themselves included.
        let mut dirty: HashSet<&FolderId> = HashSet::new();
        for id in &selection.excluded_folders {
            if let Some(Some(parent)) = self.parents.get(id).copied() {
                dirty.extend(self.ancestors_and_self(parent));
            }
        }
        for id in excluded_file_folders {
            if self.contains(id) {
                dirty.extend(self.ancestors_and_self(id));
            }
        }

        let mut resolved = ResolvedFolders::default();
        let mut included: HashSet<&FolderId> = HashSet::new();
        let mut included_order: Vec<&FolderId> = Vec::new();

        for id in &selection.selected_folders {
            if !self.contains(id) {
                resolved.unknown.push(id.clone());
                continue;
            }
            if excluded.contains(id) {
                continue;
            }
            let mut stack = vec![id];
            while let Some(folder) = stack.pop() {
                if excluded.contains(folder) || !included.insert(folder) {
                    continue;
                }
                included_order.push(folder);
                stack.extend(self.children_of(folder).iter().copied());
            }
        }

        // A folder moves as a unit unless something above it is already moving with
        // it, or it holds an exclusion.
        for &folder in &included_order {
            let parent_included = self
                .parents
                .get(folder)
                .copied()
                .flatten()
                .is_some_and(|parent| included.contains(parent));
            let parent_split = self
                .parents
                .get(folder)
                .copied()
                .flatten()
                .is_some_and(|parent| dirty.contains(parent));

            if dirty.contains(folder) {
                resolved.split.push(folder.clone());
            } else if !parent_included || parent_split {
                resolved.move_roots.push(folder.clone());
            }
        }

        let mut removable: Vec<&FolderId> = included_order
            .iter()
            .copied()
            .filter(|folder| !dirty.contains(folder))
            .collect();
        removable.sort_by_key(|folder| std::cmp::Reverse(self.depth(folder)));

        resolved.removable = removable.into_iter().cloned().collect();
        resolved.included = included_order.into_iter().cloned().collect();
        resolved
    }
}
