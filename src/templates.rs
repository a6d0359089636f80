use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// A built-in meme background.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TemplateEntry {
    pub name: String,
    pub alias: String,
    pub image_path: PathBuf,
    pub width: u32,
}

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("read template catalog {path}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parse template catalog")]
    Parse(#[from] serde_yaml::Error),
    #[error("template {name} has a zero width")]
    ZeroWidth { name: String },
    #[error("template name {name:?} is not a valid file name")]
    InvalidName { name: String },
    #[error("alias {alias} is claimed by both {first} and {second}")]
    DuplicateAlias {
        alias: String,
        first: String,
        second: String,
    },
}

#[derive(Debug, Error)]
#[error("invalid template {selector:?}")]
pub struct InvalidTemplate {
    pub selector: String,
}

#[derive(Debug, Deserialize)]
struct RawEntry {
    #[serde(alias = ":alias")]
    alias: Option<String>,
    #[serde(alias = ":width")]
    width: u32,
}

/// Read-only template catalog plus its alias index.
#[derive(Debug, Clone)]
pub struct TemplateRegistry {
    entries: HashMap<String, TemplateEntry>,
    aliases: HashMap<String, String>,
}

impl TemplateRegistry {
    pub fn load(catalog_path: &Path, templates_dir: &Path) -> Result<Self, CatalogError> {
        let raw = std::fs::read_to_string(catalog_path).map_err(|source| CatalogError::Read {
            path: catalog_path.to_path_buf(),
            source,
        })?;
        Self::from_yaml(&raw, templates_dir)
    }

    pub fn from_yaml(raw: &str, templates_dir: &Path) -> Result<Self, CatalogError> {
        // BTreeMap keeps alias conflict reporting stable across runs.
        let parsed: BTreeMap<String, RawEntry> = serde_yaml::from_str(raw)?;
        let mut entries = HashMap::with_capacity(parsed.len());
        let mut aliases: HashMap<String, String> = HashMap::with_capacity(parsed.len());
        for (name, raw_entry) in parsed {
            let name = name.trim().to_ascii_lowercase();
            if !is_valid_name(&name) {
                return Err(CatalogError::InvalidName { name });
            }
            if raw_entry.width == 0 {
                return Err(CatalogError::ZeroWidth { name });
            }
            let alias = raw_entry
                .alias
                .map(|alias| alias.trim().to_ascii_lowercase())
                .filter(|alias| !alias.is_empty())
                .unwrap_or_else(|| name.clone());
            if let Some(first) = aliases.get(&alias) {
                return Err(CatalogError::DuplicateAlias {
                    alias,
                    first: first.clone(),
                    second: name,
                });
            }
            aliases.insert(alias.clone(), name.clone());
            let image_path = templates_dir.join(format!("{name}.jpg"));
            entries.insert(
                name.clone(),
                TemplateEntry {
                    name,
                    alias,
                    image_path,
                    width: raw_entry.width,
                },
            );
        }
        Ok(Self { entries, aliases })
    }

    /// Resolves a template file token such as `Y_U_NO.JPG` to its catalog entry.
    pub fn resolve(&self, selector: &str) -> Result<&TemplateEntry, InvalidTemplate> {
        let key = normalize_selector(selector);
        let name = self.aliases.get(&key).unwrap_or(&key);
        self.entries.get(name).ok_or_else(|| InvalidTemplate {
            selector: selector.to_string(),
        })
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.entries.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn normalize_selector(selector: &str) -> String {
    let stem = selector.split('.').next().unwrap_or_default();
    stem.trim().to_lowercase()
}

fn is_valid_name(name: &str) -> bool {
    !name.is_empty()
        && !name.contains('/')
        && !name.contains('\\')
        && !name.contains('.')
        && !name.contains('\0')
}

#[cfg(test)]
mod tests {
    use super::*;

    const CATALOG: &str = r#"
standard:
  alias: standard
  width: 550
y_u_no:
  alias: yuno
  width: 500
trollface:
  :alias: troll
  :width: 400
philosoraptor:
  width: 450
"#;

    fn registry() -> TemplateRegistry {
        TemplateRegistry::from_yaml(CATALOG, Path::new("/srv/memes")).unwrap()
    }

    #[test]
    fn alias_and_name_resolve_to_same_entry() {
        let registry = registry();
        let by_alias = registry.resolve("yuno.jpg").unwrap();
        let by_name = registry.resolve("y_u_no.jpg").unwrap();
        assert_eq!(by_alias, by_name);
        assert_eq!(by_name.width, 500);
        assert_eq!(by_name.image_path, PathBuf::from("/srv/memes/y_u_no.jpg"));
    }

    #[test]
    fn selector_is_case_folded_and_extension_stripped() {
        let registry = registry();
        assert_eq!(registry.resolve("STANDARD.JPG").unwrap().name, "standard");
        assert_eq!(registry.resolve("Standard").unwrap().name, "standard");
        assert_eq!(registry.resolve("standard.tar.gz").unwrap().name, "standard");
    }

    #[test]
    fn colon_prefixed_keys_are_accepted() {
        let registry = registry();
        let entry = registry.resolve("troll.jpg").unwrap();
        assert_eq!(entry.name, "trollface");
        assert_eq!(entry.width, 400);
    }

    #[test]
    fn missing_alias_defaults_to_name() {
        let registry = registry();
        assert_eq!(registry.resolve("philosoraptor.jpg").unwrap().alias, "philosoraptor");
    }

    #[test]
    fn unknown_selector_is_invalid() {
        let registry = registry();
        let err = registry.resolve("nope.jpg").unwrap_err();
        assert_eq!(err.selector, "nope.jpg");
        assert!(registry.resolve("").is_err());
    }

    #[test]
    fn names_are_sorted() {
        assert_eq!(
            registry().names(),
            vec!["philosoraptor", "standard", "trollface", "y_u_no"]
        );
    }

    #[test]
    fn duplicate_alias_is_fatal() {
        let raw = "a:\n  alias: same\n  width: 1\nb:\n  alias: same\n  width: 1\n";
        let err = TemplateRegistry::from_yaml(raw, Path::new(".")).unwrap_err();
        assert!(matches!(err, CatalogError::DuplicateAlias { .. }));
    }

    #[test]
    fn malformed_catalog_is_fatal() {
        assert!(matches!(
            TemplateRegistry::from_yaml("standard: [1, 2", Path::new(".")),
            Err(CatalogError::Parse(_))
        ));
        assert!(matches!(
            TemplateRegistry::from_yaml("standard:\n  width: 0\n", Path::new(".")),
            Err(CatalogError::ZeroWidth { .. })
        ));
        assert!(matches!(
            TemplateRegistry::from_yaml("../etc:\n  width: 10\n", Path::new(".")),
            Err(CatalogError::InvalidName { .. })
        ));
    }
}
