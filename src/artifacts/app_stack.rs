use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use serde::Serialize;

/// Application language recognized from copied source files
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    Python,
    Ruby,
    Node,
}

/// What was seen of one language stack
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AppStackInfo {
    pub code_files: usize,
    /// Package roots, e.g. `/usr/lib/python3/dist-packages`
    pub package_dirs: BTreeSet<String>,
}

const PY_EXT: &str = "py";
const PY_PACKAGE_DIRS: &[&str] = &["/dist-packages/", "/site-packages/"];

const RB_EXT: &str = "rb";
const RB_GEMS_DIR: &str = "/gems/";

const JS_EXT: &str = "js";
const NODE_PACKAGE_DIR: &str = "/node_modules/";

/// Per-language app stacks, created lazily as source files are copied
#[derive(Debug, Clone, Default)]
pub struct AppStacks {
    stacks: BTreeMap<Language, AppStackInfo>,
}

impl AppStacks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a copied file; returns the language it counted toward
    pub fn detect(&mut self, path: &str) -> Option<Language> {
        let ext = Path::new(path).extension().and_then(|e| e.to_str())?;

        let (language, package_dir) = match ext {
            PY_EXT => (Language::Python, python_package_dir(path)),
            RB_EXT => (Language::Ruby, ruby_package_dir(path)),
            JS_EXT => (Language::Node, node_package_dir(path)),
            _ => return None,
        };

        let stack = self.stacks.entry(language).or_default();
        stack.code_files += 1;
        if let Some(dir) = package_dir {
            stack.package_dirs.insert(dir);
        }

        Some(language)
    }

    pub fn get(&self, language: Language) -> Option<&AppStackInfo> {
        self.stacks.get(&language)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Language, &AppStackInfo)> {
        self.stacks.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.stacks.is_empty()
    }
}

/// Prefix up to and including the first `dist-packages`/`site-packages`
/// segment
fn python_package_dir(path: &str) -> Option<String> {
    PY_PACKAGE_DIRS.iter().find_map(|marker| {
        path.find(marker)
            .map(|idx| path[..idx + marker.len()].to_string())
    })
}

/// Prefix up to and including the last `/gems/` segment
fn ruby_package_dir(path: &str) -> Option<String> {
    path.rfind(RB_GEMS_DIR)
        .map(|idx| path[..idx + RB_GEMS_DIR.len()].to_string())
}

/// Prefix up to and including the first `/node_modules/` segment
fn node_package_dir(path: &str) -> Option<String> {
    path.find(NODE_PACKAGE_DIR)
        .map(|idx| path[..idx + NODE_PACKAGE_DIR.len()].to_string())
}
