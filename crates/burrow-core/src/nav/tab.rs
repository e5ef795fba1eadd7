//! Open views and their navigation history.

use std::path::{Path, PathBuf};

use crate::cache::normalize;

/// One open view onto a directory.
///
/// Besides the current directory a tab remembers where it has been, with
/// browser-style back and forward stacks: entering a new directory clears
/// the forward stack.
#[derive(Debug, Clone)]
pub struct Tab {
    path: PathBuf,
    back_stack: Vec<PathBuf>,
    forward_stack: Vec<PathBuf>,
}

impl Tab {
    pub fn new(path: &Path) -> Self {
        Self {
            path: normalize(path),
            back_stack: Vec::new(),
            forward_stack: Vec::new(),
        }
    }

    /// The directory this tab shows.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Switches to `path`, remembering the current directory.
    pub fn enter(&mut self, path: &Path) {
        let path = normalize(path);
        if path == self.path {
            return;
        }
        let previous = std::mem::replace(&mut self.path, path);
        self.back_stack.push(previous);
        self.forward_stack.clear();
    }

    /// Goes back one step. Returns the new current directory.
    pub fn go_back(&mut self) -> Option<&Path> {
        let path = self.back_stack.pop()?;
        let previous = std::mem::replace(&mut self.path, path);
        self.forward_stack.push(previous);
        Some(&self.path)
    }

    /// Goes forward one step. Returns the new current directory.
    pub fn go_forward(&mut self) -> Option<&Path> {
        let path = self.forward_stack.pop()?;
        let previous = std::mem::replace(&mut self.path, path);
        self.back_stack.push(previous);
        Some(&self.path)
    }

    pub fn can_go_back(&self) -> bool {
        !self.back_stack.is_empty()
    }

    pub fn can_go_forward(&self) -> bool {
        !self.forward_stack.is_empty()
    }

    /// The active path: every directory from the root down to the current one.
    pub fn pathway(&self) -> Vec<PathBuf> {
        let mut pathway: Vec<PathBuf> = self.path.ancestors().map(Path::to_path_buf).collect();
        pathway.reverse();
        pathway
    }
}
