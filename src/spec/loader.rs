//! Spec file loading
//!
//! `load_spec` executes a Lua file in a fresh environment and collects
//! the declared globals. The declared `IDENTITY` must match what the
//! caller expects (local specs included, there is no exemption), and an
//! optional SHA-256 pins the file's content.

use crate::error::{Error, Result};
use crate::hash::sha256_bytes;
use crate::identity::Identity;
use crate::spec::dependency::parse_dependencies;
use crate::spec::options::OptionValue;
use crate::spec::{
    BundleManifest, FetchDecl, FetchSource, HookKind, HookSet, ProductDecl, Spec, StageDecl,
};
use mlua::{Lua, Table, Value};
use std::collections::BTreeMap;
use std::path::Path;

/// Execute a spec file and collect its declarations.
pub fn load_spec(path: &Path, expected: &Identity, sha256: Option<&str>) -> Result<Spec> {
    let source = std::fs::read_to_string(path).map_err(|e| {
        Error::Io(std::io::Error::new(
            e.kind(),
            format!("failed to read spec {}: {}", path.display(), e),
        ))
    })?;

    if let Some(expected_sha) = sha256 {
        let actual = sha256_bytes(source.as_bytes());
        let expected_sha = expected_sha.to_lowercase();
        if actual != expected_sha {
            return Err(Error::Integrity {
                context: format!("spec {}", path.display()),
                expected: expected_sha,
                actual,
            });
        }
    }

    let lua = fresh_load_env()?;
    lua.load(&source)
        .set_name(path.display().to_string())
        .exec()?;
    let globals = lua.globals();

    let identity = read_identity(&globals, path)?;
    if identity != *expected {
        return Err(Error::Identity(format!(
            "spec {} declares identity '{}' but '{}' was expected",
            path.display(),
            identity,
            expected
        )));
    }

    let dependencies = parse_dependencies(&globals.get::<_, Value>("DEPENDENCIES")?)?;
    let products = read_products(&globals)?;
    let exportable = read_exportable(&globals)?;
    let hooks = read_hooks(&globals)?;

    Ok(Spec {
        identity,
        path: path.to_path_buf(),
        source,
        dependencies,
        products,
        exportable,
        hooks,
    })
}

/// Execute `envy-bundle.lua` and collect the bundle's member map.
pub fn load_bundle_manifest(path: &Path, expected: &Identity) -> Result<BundleManifest> {
    let source = std::fs::read_to_string(path).map_err(|e| {
        Error::Io(std::io::Error::new(
            e.kind(),
            format!("failed to read bundle manifest {}: {}", path.display(), e),
        ))
    })?;

    let lua = fresh_load_env()?;
    lua.load(&source)
        .set_name(path.display().to_string())
        .exec()?;
    let globals = lua.globals();

    let identity: Identity = match globals.get::<_, Value>("BUNDLE")? {
        Value::String(s) => s.to_str()?.parse()?,
        Value::Nil => {
            return Err(Error::Identity(format!(
                "bundle manifest {} does not declare BUNDLE",
                path.display()
            )))
        }
        other => {
            return Err(Error::Identity(format!(
                "BUNDLE must be a string, got {} in {}",
                other.type_name(),
                path.display()
            )))
        }
    };
    if identity != *expected {
        return Err(Error::Security(format!(
            "bundle manifest {} declares BUNDLE '{}' but '{}' was expected",
            path.display(),
            identity,
            expected
        )));
    }

    let mut specs = BTreeMap::new();
    match globals.get::<_, Value>("SPECS")? {
        Value::Nil => {}
        Value::Table(table) => {
            for pair in table.pairs::<String, Value>() {
                let (member, rel) = pair?;
                let rel = match rel {
                    Value::String(s) => s.to_str()?.to_string(),
                    other => {
                        return Err(Error::Schema(format!(
                            "SPECS['{}'] must be a relative path string, got {}",
                            member,
                            other.type_name()
                        )))
                    }
                };
                member.parse::<Identity>()?;
                specs.insert(member, rel);
            }
        }
        other => {
            return Err(Error::Schema(format!(
                "SPECS must be a table, got {} in {}",
                other.type_name(),
                path.display()
            )))
        }
    }

    Ok(BundleManifest { identity, specs })
}

/// Run a spec's `VALIDATE` hook against one options vector. Re-executes
/// the spec source in a fresh environment; validation happens once per
/// instance at resolve time.
pub fn run_validate(spec: &Spec, options: Option<&OptionValue>) -> Result<()> {
    if !spec.hooks.has_validate {
        return Ok(());
    }
    let lua = fresh_load_env()?;
    lua.load(&spec.source)
        .set_name(spec.path.display().to_string())
        .exec()?;
    let validate: mlua::Function = lua.globals().get("VALIDATE")?;
    let opts_value = match options {
        Some(o) => o.to_lua(&lua)?,
        None => Value::Nil,
    };
    let result: Value = validate
        .call(opts_value)
        .map_err(|e| Error::Validation(format!("VALIDATE for '{}' raised: {}", spec.identity, e)))?;
    match result {
        Value::Boolean(true) => Ok(()),
        Value::Boolean(false) => Err(Error::Validation(format!(
            "VALIDATE for '{}' returned false",
            spec.identity
        ))),
        Value::String(s) => Err(Error::Validation(format!(
            "VALIDATE for '{}' rejected options: {}",
            spec.identity,
            s.to_str()?
        ))),
        other => Err(Error::Validation(format!(
            "VALIDATE must return true or an error string, got {} from '{}'",
            other.type_name(),
            spec.identity
        ))),
    }
}

/// A fresh Lua state for top-level spec evaluation. The `envy` table
/// exists but its context functions refuse to run outside a phase; specs
/// may still read `envy.PLATFORM` at the top level.
pub fn fresh_load_env() -> Result<Lua> {
    let lua = Lua::new();
    install_platform_globals(&lua)?;
    let envy: Table = lua.globals().get("envy")?;
    for name in [
        "run",
        "extract_all",
        "fetch",
        "commit_fetch",
        "package",
        "product",
        "asset",
        "loadenv",
        "loadenv_spec",
        "info",
    ] {
        let fn_name = name.to_string();
        envy.set(
            name,
            lua.create_function(move |_, _: mlua::MultiValue| -> mlua::Result<()> {
                Err(mlua::Error::external(format!(
                    "envy.{} must be called inside a phase function, not at module top level",
                    fn_name
                )))
            })?,
        )?;
    }
    drop(envy);
    Ok(lua)
}

/// Install `envy.PLATFORM`, `envy.ARCH`, `envy.extend`, and the
/// `ENVY_SHELL` enum. Shared between the load environment and the
/// per-phase sandbox.
pub fn install_platform_globals(lua: &Lua) -> Result<()> {
    let globals = lua.globals();

    let envy = lua.create_table()?;
    envy.set("PLATFORM", crate::platform::platform())?;
    envy.set("ARCH", crate::platform::arch())?;
    envy.set(
        "extend",
        lua.create_function(|lua, (base, overrides): (Table, Table)| {
            let merged = lua.create_table()?;
            for pair in base.pairs::<Value, Value>() {
                let (k, v) = pair?;
                merged.set(k, v)?;
            }
            for pair in overrides.pairs::<Value, Value>() {
                let (k, v) = pair?;
                merged.set(k, v)?;
            }
            Ok(merged)
        })?,
    )?;
    globals.set("envy", envy)?;

    let shell = lua.create_table()?;
    shell.set("SH", "sh")?;
    shell.set("BASH", "bash")?;
    shell.set("CMD", "cmd")?;
    shell.set("POWERSHELL", "powershell")?;
    globals.set("ENVY_SHELL", shell)?;

    Ok(())
}

fn read_identity(globals: &Table, path: &Path) -> Result<Identity> {
    match globals.get::<_, Value>("IDENTITY")? {
        Value::Nil => Err(Error::Identity(format!(
            "spec {} does not declare IDENTITY",
            path.display()
        ))),
        Value::String(s) => s.to_str()?.parse(),
        other => Err(Error::Identity(format!(
            "IDENTITY must be a string, got {} in {}",
            other.type_name(),
            path.display()
        ))),
    }
}

fn read_products(globals: &Table) -> Result<BTreeMap<String, ProductDecl>> {
    let mut products = BTreeMap::new();
    match globals.get::<_, Value>("PRODUCTS")? {
        Value::Nil => {}
        Value::Table(table) => {
            for pair in table.pairs::<String, Value>() {
                let (name, decl) = pair?;
                let decl = match decl {
                    Value::String(s) => ProductDecl::Path(s.to_str()?.to_string()),
                    Value::Function(_) => ProductDecl::Function,
                    other => {
                        return Err(Error::Schema(format!(
                            "PRODUCTS['{}'] must be a path string or function, got {}",
                            name,
                            other.type_name()
                        )))
                    }
                };
                products.insert(name, decl);
            }
        }
        other => {
            return Err(Error::Schema(format!(
                "PRODUCTS must be a table, got {}",
                other.type_name()
            )))
        }
    }
    Ok(products)
}

fn read_exportable(globals: &Table) -> Result<bool> {
    match globals.get::<_, Value>("EXPORTABLE")? {
        Value::Nil => Ok(false),
        Value::Boolean(b) => Ok(b),
        other => Err(Error::Schema(format!(
            "EXPORTABLE must be a boolean, got {}",
            other.type_name()
        ))),
    }
}

fn read_hook(globals: &Table, name: &str) -> Result<Option<HookKind>> {
    match globals.get::<_, Value>(name)? {
        Value::Nil => Ok(None),
        Value::Function(_) => Ok(Some(HookKind::Function)),
        Value::String(s) => Ok(Some(HookKind::Shell(s.to_str()?.to_string()))),
        other => Err(Error::Schema(format!(
            "{} must be a function or shell string, got {}",
            name,
            other.type_name()
        ))),
    }
}

fn read_fetch(globals: &Table) -> Result<Option<FetchDecl>> {
    match globals.get::<_, Value>("FETCH")? {
        Value::Nil => Ok(None),
        Value::Function(_) => Ok(Some(FetchDecl::Function)),
        Value::Table(table) => {
            let sources = if table.contains_key("source")? {
                vec![read_fetch_source(&table)?]
            } else {
                let mut sources = Vec::new();
                for (i, entry) in table.clone().sequence_values::<Value>().enumerate() {
                    match entry? {
                        Value::Table(t) => sources.push(read_fetch_source(&t).map_err(|e| {
                            Error::Schema(format!("FETCH[{}]: {}", i + 1, e))
                        })?),
                        other => {
                            return Err(Error::Schema(format!(
                                "FETCH[{}] must be a table, got {}",
                                i + 1,
                                other.type_name()
                            )))
                        }
                    }
                }
                if sources.is_empty() {
                    return Err(Error::Schema(
                        "FETCH table declares no sources".to_string(),
                    ));
                }
                sources
            };
            Ok(Some(FetchDecl::Declarative(sources)))
        }
        other => Err(Error::Schema(format!(
            "FETCH must be a table or function, got {}",
            other.type_name()
        ))),
    }
}

fn read_fetch_source(table: &Table) -> Result<FetchSource> {
    let source = match table.get::<_, Value>("source")? {
        Value::String(s) => s.to_str()?.to_string(),
        Value::Nil => return Err(Error::Schema("fetch source is missing 'source'".to_string())),
        other => {
            return Err(Error::Schema(format!(
                "fetch 'source' must be a string, got {}",
                other.type_name()
            )))
        }
    };
    let sha256 = match table.get::<_, Value>("sha256")? {
        Value::Nil => None,
        Value::String(s) => Some(s.to_str()?.to_string()),
        other => {
            return Err(Error::Schema(format!(
                "fetch 'sha256' must be a string, got {}",
                other.type_name()
            )))
        }
    };
    Ok(FetchSource { source, sha256 })
}

fn read_stage(globals: &Table) -> Result<Option<StageDecl>> {
    match globals.get::<_, Value>("STAGE")? {
        Value::Nil => Ok(None),
        Value::Function(_) => Ok(Some(StageDecl::Function)),
        Value::String(s) => Ok(Some(StageDecl::Shell(s.to_str()?.to_string()))),
        Value::Table(table) => {
            let strip = match table.get::<_, Value>("strip")? {
                Value::Integer(i) if i >= 0 => i as u32,
                Value::Nil => 0,
                other => {
                    return Err(Error::Schema(format!(
                        "STAGE.strip must be a non-negative integer, got {:?}",
                        other
                    )))
                }
            };
            Ok(Some(StageDecl::Strip(strip)))
        }
        other => Err(Error::Schema(format!(
            "STAGE must be a table, function, or shell string, got {}",
            other.type_name()
        ))),
    }
}

fn read_hooks(globals: &Table) -> Result<HookSet> {
    let has_validate = match globals.get::<_, Value>("VALIDATE")? {
        Value::Nil => false,
        Value::Function(_) => true,
        _ => {
            return Err(Error::Validation(
                "VALIDATE must be a function".to_string(),
            ))
        }
    };
    Ok(HookSet {
        check: read_hook(globals, "CHECK")?,
        fetch: read_fetch(globals)?,
        stage: read_stage(globals)?,
        build: read_hook(globals, "BUILD")?,
        install: read_hook(globals, "INSTALL")?,
        has_validate,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn write_spec(temp: &TempDir, name: &str, content: &str) -> std::path::PathBuf {
        let path = temp.path().join(name);
        fs::write(&path, content).unwrap();
        path
    }

    fn id(s: &str) -> Identity {
        s.parse().unwrap()
    }

    #[test]
    fn test_load_minimal_spec() {
        let temp = TempDir::new().unwrap();
        let path = write_spec(
            &temp,
            "simple.lua",
            r#"
IDENTITY = "local.simple@v1"
function INSTALL(install_dir, stage_dir, fetch_dir, tmp_dir, options)
end
"#,
        );
        let spec = load_spec(&path, &id("local.simple@v1"), None).unwrap();
        assert_eq!(spec.identity.to_string(), "local.simple@v1");
        assert!(!spec.is_user_managed());
        assert!(!spec.exportable);
        assert_eq!(spec.hooks.install, Some(HookKind::Function));
        assert!(spec.dependencies.is_empty());
    }

    #[test]
    fn test_missing_identity_fails() {
        let temp = TempDir::new().unwrap();
        let path = write_spec(&temp, "noident.lua", "-- nothing here\n");
        let err = load_spec(&path, &id("local.x@v1"), None).unwrap_err();
        assert!(err.to_string().contains("does not declare IDENTITY"));
    }

    #[test]
    fn test_identity_wrong_type_fails() {
        let temp = TempDir::new().unwrap();
        let path = write_spec(&temp, "badident.lua", "IDENTITY = 42\n");
        let err = load_spec(&path, &id("local.x@v1"), None).unwrap_err();
        assert!(err.to_string().contains("IDENTITY must be a string"));
    }

    #[test]
    fn test_identity_mismatch_fails_for_local_specs_too() {
        let temp = TempDir::new().unwrap();
        let path = write_spec(&temp, "mismatch.lua", "IDENTITY = \"local.other@v1\"\n");
        let err = load_spec(&path, &id("local.x@v1"), None).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("local.other@v1"));
        assert!(msg.contains("local.x@v1"));
    }

    #[test]
    fn test_sha256_verification() {
        let temp = TempDir::new().unwrap();
        let content = "IDENTITY = \"local.pinned@v1\"\n";
        let path = write_spec(&temp, "pinned.lua", content);
        let good = sha256_bytes(content.as_bytes());

        load_spec(&path, &id("local.pinned@v1"), Some(&good)).unwrap();

        let err = load_spec(&path, &id("local.pinned@v1"), Some(&"00".repeat(32))).unwrap_err();
        assert!(matches!(err, Error::Integrity { .. }));
    }

    #[test]
    fn test_user_managed_detection() {
        let temp = TempDir::new().unwrap();
        let path = write_spec(
            &temp,
            "um.lua",
            r#"
IDENTITY = "local.um@v1"
function CHECK(project_root, options) return false end
function INSTALL(install_dir, stage_dir, fetch_dir, tmp_dir, options) end
"#,
        );
        let spec = load_spec(&path, &id("local.um@v1"), None).unwrap();
        assert!(spec.is_user_managed());
    }

    #[test]
    fn test_declarative_fetch_single_and_list() {
        let temp = TempDir::new().unwrap();
        let single = write_spec(
            &temp,
            "single.lua",
            r#"
IDENTITY = "local.single@v1"
FETCH = { source = "https://example.com/a.tar.gz", sha256 = "abc" }
"#,
        );
        let spec = load_spec(&single, &id("local.single@v1"), None).unwrap();
        match &spec.hooks.fetch {
            Some(FetchDecl::Declarative(sources)) => {
                assert_eq!(sources.len(), 1);
                assert_eq!(sources[0].sha256.as_deref(), Some("abc"));
            }
            other => panic!("unexpected: {:?}", other),
        }

        let list = write_spec(
            &temp,
            "list.lua",
            r#"
IDENTITY = "local.list@v1"
FETCH = {
  { source = "https://example.com/a.tar.gz" },
  { source = "https://example.com/b.tar.gz", sha256 = "def" },
}
"#,
        );
        let spec = load_spec(&list, &id("local.list@v1"), None).unwrap();
        match &spec.hooks.fetch {
            Some(FetchDecl::Declarative(sources)) => assert_eq!(sources.len(), 2),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_stage_forms() {
        let temp = TempDir::new().unwrap();
        let path = write_spec(
            &temp,
            "strip.lua",
            "IDENTITY = \"local.strip@v1\"\nSTAGE = { strip = 1 }\n",
        );
        let spec = load_spec(&path, &id("local.strip@v1"), None).unwrap();
        assert_eq!(spec.hooks.stage, Some(StageDecl::Strip(1)));

        let path = write_spec(
            &temp,
            "shellstage.lua",
            "IDENTITY = \"local.shellstage@v1\"\nSTAGE = \"cp -r . out/\"\n",
        );
        let spec = load_spec(&path, &id("local.shellstage@v1"), None).unwrap();
        assert!(matches!(spec.hooks.stage, Some(StageDecl::Shell(_))));
    }

    #[test]
    fn test_products_and_exportable() {
        let temp = TempDir::new().unwrap();
        let path = write_spec(
            &temp,
            "prod.lua",
            r#"
IDENTITY = "local.prod@v1"
EXPORTABLE = true
PRODUCTS = { tool = "bin/tool", meta = function() return 42 end }
"#,
        );
        let spec = load_spec(&path, &id("local.prod@v1"), None).unwrap();
        assert!(spec.exportable);
        assert_eq!(
            spec.products.get("tool"),
            Some(&ProductDecl::Path("bin/tool".to_string()))
        );
        assert_eq!(spec.products.get("meta"), Some(&ProductDecl::Function));
    }

    #[test]
    fn test_validate_must_be_function() {
        let temp = TempDir::new().unwrap();
        let path = write_spec(
            &temp,
            "badval.lua",
            "IDENTITY = \"local.badval@v1\"\nVALIDATE = \"not a function\"\n",
        );
        let err = load_spec(&path, &id("local.badval@v1"), None).unwrap_err();
        assert!(err.to_string().contains("VALIDATE must be a function"));
    }

    #[test]
    fn test_run_validate_outcomes() {
        let temp = TempDir::new().unwrap();

        let ok = write_spec(
            &temp,
            "vok.lua",
            r#"
IDENTITY = "local.vok@v1"
VALIDATE = function(options) return true end
"#,
        );
        let spec = load_spec(&ok, &id("local.vok@v1"), None).unwrap();
        run_validate(&spec, None).unwrap();

        let rejects = write_spec(
            &temp,
            "vno.lua",
            r#"
IDENTITY = "local.vno@v1"
VALIDATE = function(options)
  if options and options.variant == "bad" then return "nope" end
  return false
end
"#,
        );
        let spec = load_spec(&rejects, &id("local.vno@v1"), None).unwrap();
        let err = run_validate(&spec, None).unwrap_err();
        assert!(err.to_string().contains("returned false"));

        let lua = Lua::new();
        let opts_val: Value = lua.load(r#"{ variant = "bad" }"#).eval().unwrap();
        let opts = OptionValue::from_lua(&opts_val).unwrap();
        let err = run_validate(&spec, Some(&opts)).unwrap_err();
        assert!(err.to_string().contains("nope"));

        let wrong = write_spec(
            &temp,
            "vwrong.lua",
            r#"
IDENTITY = "local.vwrong@v1"
VALIDATE = function(options) return 42 end
"#,
        );
        let spec = load_spec(&wrong, &id("local.vwrong@v1"), None).unwrap();
        let err = run_validate(&spec, None).unwrap_err();
        assert!(err.to_string().contains("VALIDATE must return"));
    }

    #[test]
    fn test_top_level_ctx_access_is_refused() {
        let temp = TempDir::new().unwrap();
        let path = write_spec(
            &temp,
            "toplevel.lua",
            r#"
IDENTITY = "local.toplevel@v1"
envy.package("local.other@v1")
"#,
        );
        let err = load_spec(&path, &id("local.toplevel@v1"), None).unwrap_err();
        assert!(err
            .to_string()
            .contains("must be called inside a phase function"));
    }

    #[test]
    fn test_platform_readable_at_top_level() {
        let temp = TempDir::new().unwrap();
        let path = write_spec(
            &temp,
            "plat.lua",
            r#"
IDENTITY = "local.plat@v1"
PLATFORM_SEEN = envy.PLATFORM
"#,
        );
        load_spec(&path, &id("local.plat@v1"), None).unwrap();
    }

    #[test]
    fn test_bundle_manifest_load_and_mismatch() {
        let temp = TempDir::new().unwrap();
        let path = write_spec(
            &temp,
            "envy-bundle.lua",
            r#"
BUNDLE = "test.helpers@v1"
SPECS = { ["test.member@v1"] = "member.lua" }
"#,
        );
        let bundle = load_bundle_manifest(&path, &id("test.helpers@v1")).unwrap();
        assert_eq!(bundle.specs.get("test.member@v1").unwrap(), "member.lua");

        let err = load_bundle_manifest(&path, &id("test.other@v1")).unwrap_err();
        assert!(matches!(err, Error::Security(_)));
    }

    #[test]
    fn test_envy_extend_merges() {
        let temp = TempDir::new().unwrap();
        let path = write_spec(
            &temp,
            "extend.lua",
            r#"
IDENTITY = "local.extend@v1"
local merged = envy.extend({ a = 1, b = 2 }, { b = 3, c = 4 })
assert(merged.a == 1 and merged.b == 3 and merged.c == 4)
"#,
        );
        load_spec(&path, &id("local.extend@v1"), None).unwrap();
    }
}
