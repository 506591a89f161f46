//! Project manifest (`envy.lua`)
//!
//! The manifest is a Lua file defining `PACKAGES` (a list of package
//! entries shaped like dependency declarations) and optionally `BUNDLES`
//! (alias -> bundle declaration). Leading `-- @envy` comment directives
//! carry engine meta-options; the body is evaluated in the same
//! sandboxed environment as specs.

pub mod directives;
pub mod discover;

use crate::error::{Error, Result};
use crate::resolver::BundleAlias;
use crate::spec::dependency::{parse_dependency, DependencyDecl};
use crate::spec::loader::fresh_load_env;
use directives::Directives;
pub use discover::{discover_manifest, MANIFEST_NAME};
use mlua::{Table, Value};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

#[derive(Debug)]
pub struct Manifest {
    pub path: PathBuf,
    pub dir: PathBuf,
    pub directives: Directives,
    pub packages: Vec<DependencyDecl>,
    pub bundles: BTreeMap<String, BundleAlias>,
}

/// Load and parse a manifest file.
pub fn load_manifest(path: &Path) -> Result<Manifest> {
    let text = std::fs::read_to_string(path).map_err(|e| {
        Error::Io(std::io::Error::new(
            e.kind(),
            format!("failed to read manifest {}: {}", path.display(), e),
        ))
    })?;
    let directives = Directives::parse(&text)?;

    let lua = fresh_load_env()?;
    lua.load(&text)
        .set_name(path.display().to_string())
        .exec()?;
    let globals = lua.globals();

    let packages = match globals.get::<_, Value>("PACKAGES")? {
        Value::Nil => Vec::new(),
        Value::Table(table) => {
            let mut entries = Vec::new();
            for (i, entry) in table.sequence_values::<Value>().enumerate() {
                match entry? {
                    Value::Table(t) => entries.push(parse_dependency(&t).map_err(|e| {
                        Error::Schema(format!("PACKAGES[{}]: {}", i + 1, e))
                    })?),
                    other => {
                        return Err(Error::Schema(format!(
                            "PACKAGES[{}] must be a table, got {}",
                            i + 1,
                            other.type_name()
                        )))
                    }
                }
            }
            entries
        }
        other => {
            return Err(Error::Schema(format!(
                "PACKAGES must be a table, got {}",
                other.type_name()
            )))
        }
    };

    let bundles = match globals.get::<_, Value>("BUNDLES")? {
        Value::Nil => BTreeMap::new(),
        Value::Table(table) => parse_bundles(&table)?,
        other => {
            return Err(Error::Schema(format!(
                "BUNDLES must be a table, got {}",
                other.type_name()
            )))
        }
    };

    let dir = path
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));

    Ok(Manifest {
        path: path.to_path_buf(),
        dir,
        directives,
        packages,
        bundles,
    })
}

fn parse_bundles(table: &Table) -> Result<BTreeMap<String, BundleAlias>> {
    let mut bundles = BTreeMap::new();
    for pair in table.clone().pairs::<String, Value>() {
        let (alias, decl) = pair?;
        let decl = match decl {
            Value::Table(t) => t,
            other => {
                return Err(Error::Schema(format!(
                    "BUNDLES['{}'] must be a table, got {}",
                    alias,
                    other.type_name()
                )))
            }
        };
        let identity: String = decl.get::<_, Option<String>>("bundle")?.ok_or_else(|| {
            Error::Schema(format!("BUNDLES['{}'] is missing 'bundle'", alias))
        })?;
        let source: String = decl.get::<_, Option<String>>("source")?.ok_or_else(|| {
            Error::Schema(format!("BUNDLES['{}'] is missing 'source'", alias))
        })?;
        bundles.insert(
            alias,
            BundleAlias {
                identity: identity.parse()?,
                source,
            },
        );
    }
    Ok(bundles)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_load_manifest_packages_and_bundles() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("envy.lua");
        fs::write(
            &path,
            r#"-- @envy version "0.4.0"
-- @envy package-depot "https://depot.example.com/m.txt"

PACKAGES = {
  { spec = "local.tool@v1", source = "specs/tool.lua" },
  { spec = "local.tool@v1", source = "specs/tool.lua", options = { variant = "lto" } },
}

BUNDLES = {
  helpers = { bundle = "test.helpers@v1", source = "bundles/helpers" },
}
"#,
        )
        .unwrap();

        let manifest = load_manifest(&path).unwrap();
        assert_eq!(manifest.packages.len(), 2);
        assert_eq!(manifest.directives.version.as_deref(), Some("0.4.0"));
        assert_eq!(manifest.directives.package_depots.len(), 1);
        let helpers = manifest.bundles.get("helpers").unwrap();
        assert_eq!(helpers.identity.to_string(), "test.helpers@v1");
        assert_eq!(manifest.dir, temp.path());
    }

    #[test]
    fn test_empty_manifest_is_valid() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("envy.lua");
        fs::write(&path, "PACKAGES = {}\n").unwrap();
        let manifest = load_manifest(&path).unwrap();
        assert!(manifest.packages.is_empty());
        assert!(manifest.bundles.is_empty());
    }

    #[test]
    fn test_packages_entry_schema_error_is_positional() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("envy.lua");
        fs::write(&path, "PACKAGES = { { spec = \"local.a@v1\" } }\n").unwrap();
        let err = load_manifest(&path).unwrap_err();
        assert!(err.to_string().contains("PACKAGES[1]"), "{}", err);
    }

    #[test]
    fn test_manifest_can_use_platform_constant() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("envy.lua");
        fs::write(
            &path,
            r#"
PACKAGES = {}
if envy.PLATFORM == "linux" then
  PACKAGES = { }
end
"#,
        )
        .unwrap();
        load_manifest(&path).unwrap();
    }
}
