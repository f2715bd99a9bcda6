//! Ports tree reader.
//!
//! A ports tree holds one directory per package, optionally grouped by
//! category: `<ports>/<category>/<name>/<name>.toml` or
//! `<ports>/<name>/recipe.toml`. Any other file is ignored, so distfiles
//! and patches may live alongside the recipes.

use crate::recipe::{parse_recipe_file, parse_recipe_str, PackageDefinition, RecipeError};
use crate::types::PackageName;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::debug;
use walkdir::WalkDir;

const RECIPE_FILE: &str = "recipe.toml";

/// Whether `path` names a recipe file according to the tree layout.
pub fn is_recipe_path(path: &Path) -> bool {
    let Some(file_name) = path.file_name().and_then(|n| n.to_str()) else {
        return false;
    };
    if file_name == RECIPE_FILE {
        return true;
    }
    let Some(stem) = file_name.strip_suffix(".toml") else {
        return false;
    };
    path.parent()
        .and_then(Path::file_name)
        .and_then(|n| n.to_str())
        .is_some_and(|dir| dir == stem)
}

#[derive(Debug, Clone, Default)]
pub struct PortsTree {
    packages: BTreeMap<PackageName, PackageDefinition>,
    origins: BTreeMap<PackageName, PathBuf>,
}

impl PortsTree {
    pub fn new() -> Self {
        Self::default()
    }

    /// Walk `dir` and parse every recipe it contains.
    pub fn load(dir: &Path) -> Result<Self, RecipeError> {
        let mut tree = Self::new();
        let walker = WalkDir::new(dir)
            .follow_links(false)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|e| {
                e.file_name()
                    .to_str()
                    .map_or(true, |n| e.depth() == 0 || !n.starts_with('.'))
            });
        for entry in walker {
            let entry = entry.map_err(|e| RecipeError::Io {
                path: e.path().map_or_else(|| dir.to_path_buf(), Path::to_path_buf),
                source: e.into(),
            })?;
            if !entry.file_type().is_file() || !is_recipe_path(entry.path()) {
                continue;
            }
            let def = parse_recipe_file(entry.path())?;
            tree.insert(def, entry.path().to_path_buf())?;
        }
        debug!("loaded {} recipes from {}", tree.len(), dir.display());
        Ok(tree)
    }

    /// Build a tree from a raw `(path, contents)` listing.
    pub fn from_listing<I, P, S>(files: I) -> Result<Self, RecipeError>
    where
        I: IntoIterator<Item = (P, S)>,
        P: AsRef<Path>,
        S: AsRef<str>,
    {
        let mut tree = Self::new();
        for (path, contents) in files {
            let path = path.as_ref();
            if !is_recipe_path(path) {
                continue;
            }
            let mut def = parse_recipe_str(contents.as_ref())?;
            def.recipe_path = Some(path.to_path_buf());
            tree.insert(def, path.to_path_buf())?;
        }
        Ok(tree)
    }

    /// Add a definition; a second definition of the same name is an error.
    pub fn insert(&mut self, def: PackageDefinition, origin: PathBuf) -> Result<(), RecipeError> {
        if let Some(first) = self.origins.get(&def.name) {
            return Err(RecipeError::DuplicatePackage {
                name: def.name.to_string(),
                first: first.clone(),
                second: origin,
            });
        }
        self.origins.insert(def.name.clone(), origin);
        self.packages.insert(def.name.clone(), def);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&PackageDefinition> {
        self.packages.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.packages.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.packages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.packages.is_empty()
    }

    /// Definitions in lexical name order.
    pub fn iter(&self) -> impl Iterator<Item = &PackageDefinition> {
        self.packages.values()
    }

    pub fn names(&self) -> impl Iterator<Item = &PackageName> {
        self.packages.keys()
    }
}
