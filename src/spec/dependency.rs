//! Dependency declarations
//!
//! Each entry of a spec's `DEPENDENCIES` table is one of five shapes:
//! strong spec, strong product, weak product, bundle, or spec-from-bundle.
//! `needed_by` names the earliest phase of the dependent at which the
//! dependency's artifact must be ready.

use crate::error::{Error, Result};
use crate::identity::Identity;
use crate::spec::options::OptionValue;
use mlua::{Table, Value};
use serde::Serialize;

/// Execution phases, in intra-node order. `Check` only exists on
/// user-managed specs and runs before everything else.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Check,
    Fetch,
    Stage,
    Build,
    Install,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Check => "check",
            Phase::Fetch => "fetch",
            Phase::Stage => "stage",
            Phase::Build => "build",
            Phase::Install => "install",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "check" => Ok(Phase::Check),
            "fetch" => Ok(Phase::Fetch),
            "stage" => Ok(Phase::Stage),
            "build" => Ok(Phase::Build),
            "install" => Ok(Phase::Install),
            other => Err(Error::Interface(format!(
                "invalid needed_by value '{}' (expected fetch, stage, build, install, or check)",
                other
            ))),
        }
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Fallback provider for a weak product dependency.
#[derive(Debug, Clone)]
pub struct WeakFallback {
    pub spec: Identity,
    pub source: String,
}

#[derive(Debug, Clone)]
pub enum DependencyDecl {
    /// `{ spec = identity, source = path, [options], [needed_by] }`
    Spec {
        spec: Identity,
        source: String,
        options: Option<OptionValue>,
        needed_by: Phase,
    },
    /// `{ spec = identity, bundle = identity-or-alias }`
    SpecFromBundle {
        spec: Identity,
        bundle: String,
        options: Option<OptionValue>,
        needed_by: Phase,
    },
    /// `{ product = name, spec = identity, source = path, [options] }`
    Product {
        product: String,
        spec: Identity,
        source: String,
        options: Option<OptionValue>,
        needed_by: Phase,
    },
    /// `{ product = name, [weak = { spec, source }] }`
    WeakProduct {
        product: String,
        fallback: Option<WeakFallback>,
        needed_by: Phase,
    },
    /// `{ bundle = identity, source = path-or-alias }`
    Bundle {
        bundle: Identity,
        source: String,
        needed_by: Phase,
    },
}

impl DependencyDecl {
    pub fn needed_by(&self) -> Phase {
        match self {
            DependencyDecl::Spec { needed_by, .. }
            | DependencyDecl::SpecFromBundle { needed_by, .. }
            | DependencyDecl::Product { needed_by, .. }
            | DependencyDecl::WeakProduct { needed_by, .. }
            | DependencyDecl::Bundle { needed_by, .. } => *needed_by,
        }
    }
}

fn get_string(table: &Table, key: &str) -> Result<Option<String>> {
    match table.get::<_, Value>(key)? {
        Value::Nil => Ok(None),
        Value::String(s) => Ok(Some(s.to_str()?.to_string())),
        other => Err(Error::Schema(format!(
            "dependency field '{}' must be a string, got {}",
            key,
            other.type_name()
        ))),
    }
}

fn get_options(table: &Table) -> Result<Option<OptionValue>> {
    match table.get::<_, Value>("options")? {
        Value::Nil => Ok(None),
        value @ Value::Table(_) => Ok(Some(OptionValue::from_lua(&value)?)),
        other => Err(Error::Schema(format!(
            "dependency field 'options' must be a table, got {}",
            other.type_name()
        ))),
    }
}

fn get_needed_by(table: &Table, default: Phase) -> Result<Phase> {
    match get_string(table, "needed_by")? {
        None => Ok(default),
        Some(s) => Phase::parse(&s),
    }
}

/// Parse one entry of a `DEPENDENCIES` table.
pub fn parse_dependency(table: &Table) -> Result<DependencyDecl> {
    let spec = get_string(table, "spec")?;
    let product = get_string(table, "product")?;
    let bundle = get_string(table, "bundle")?;
    let source = get_string(table, "source")?;

    if let Some(product) = product {
        if let Some(spec) = spec {
            // Strong product: explicit provider.
            let source = source.ok_or_else(|| {
                Error::Schema(format!(
                    "product dependency '{}' names spec '{}' but has no source",
                    product, spec
                ))
            })?;
            return Ok(DependencyDecl::Product {
                product,
                spec: spec.parse()?,
                source,
                options: get_options(table)?,
                needed_by: get_needed_by(table, Phase::Install)?,
            });
        }
        // Weak / ref-only product.
        let fallback = match table.get::<_, Value>("weak")? {
            Value::Nil => None,
            Value::Table(weak) => {
                let spec = get_string(&weak, "spec")?.ok_or_else(|| {
                    Error::Schema(format!(
                        "weak fallback for product '{}' is missing 'spec'",
                        product
                    ))
                })?;
                let source = get_string(&weak, "source")?.ok_or_else(|| {
                    Error::Schema(format!(
                        "weak fallback for product '{}' is missing 'source'",
                        product
                    ))
                })?;
                Some(WeakFallback {
                    spec: spec.parse()?,
                    source,
                })
            }
            other => {
                return Err(Error::Schema(format!(
                    "dependency field 'weak' must be a table, got {}",
                    other.type_name()
                )))
            }
        };
        return Ok(DependencyDecl::WeakProduct {
            product,
            fallback,
            needed_by: get_needed_by(table, Phase::Install)?,
        });
    }

    if let Some(spec) = spec {
        if let Some(bundle) = bundle {
            return Ok(DependencyDecl::SpecFromBundle {
                spec: spec.parse()?,
                bundle,
                options: get_options(table)?,
                needed_by: get_needed_by(table, Phase::Install)?,
            });
        }
        let source = source.ok_or_else(|| {
            Error::Schema(format!("spec dependency '{}' has no source", spec))
        })?;
        return Ok(DependencyDecl::Spec {
            spec: spec.parse()?,
            source,
            options: get_options(table)?,
            needed_by: get_needed_by(table, Phase::Install)?,
        });
    }

    if let Some(bundle) = bundle {
        let source = source.ok_or_else(|| {
            Error::Schema(format!("bundle dependency '{}' has no source", bundle))
        })?;
        return Ok(DependencyDecl::Bundle {
            bundle: bundle.parse()?,
            source,
            needed_by: get_needed_by(table, Phase::Check)?,
        });
    }

    Err(Error::Schema(
        "dependency entry must declare 'spec', 'product', or 'bundle'".to_string(),
    ))
}

/// Parse a whole `DEPENDENCIES` table (a sequence of entry tables).
pub fn parse_dependencies(value: &Value) -> Result<Vec<DependencyDecl>> {
    let table = match value {
        Value::Nil => return Ok(Vec::new()),
        Value::Table(t) => t,
        other => {
            return Err(Error::Schema(format!(
                "DEPENDENCIES must be a table, got {}",
                other.type_name()
            )))
        }
    };

    let mut deps = Vec::new();
    for (i, entry) in table.clone().sequence_values::<Value>().enumerate() {
        match entry? {
            Value::Table(t) => deps.push(parse_dependency(&t).map_err(|e| {
                Error::Schema(format!("DEPENDENCIES[{}]: {}", i + 1, e))
            })?),
            other => {
                return Err(Error::Schema(format!(
                    "DEPENDENCIES[{}] must be a table, got {}",
                    i + 1,
                    other.type_name()
                )))
            }
        }
    }
    Ok(deps)
}

#[cfg(test)]
mod tests {
    use super::*;
    use mlua::Lua;

    fn parse(src: &str) -> Result<Vec<DependencyDecl>> {
        let lua = Lua::new();
        let value: Value = lua.load(src).eval().unwrap();
        parse_dependencies(&value)
    }

    #[test]
    fn test_phase_order() {
        assert!(Phase::Check < Phase::Fetch);
        assert!(Phase::Fetch < Phase::Stage);
        assert!(Phase::Stage < Phase::Build);
        assert!(Phase::Build < Phase::Install);
    }

    #[test]
    fn test_strong_spec_defaults_to_install() {
        let deps = parse(r#"{ { spec = "local.dep@v1", source = "dep.lua" } }"#).unwrap();
        assert_eq!(deps.len(), 1);
        match &deps[0] {
            DependencyDecl::Spec {
                spec, needed_by, ..
            } => {
                assert_eq!(spec.to_string(), "local.dep@v1");
                assert_eq!(*needed_by, Phase::Install);
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_bundle_defaults_to_check() {
        let deps =
            parse(r#"{ { bundle = "test.helpers@v1", source = "helpers/" } }"#).unwrap();
        match &deps[0] {
            DependencyDecl::Bundle { needed_by, .. } => assert_eq!(*needed_by, Phase::Check),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_explicit_needed_by() {
        let deps = parse(
            r#"{ { spec = "local.dep@v1", source = "dep.lua", needed_by = "stage" } }"#,
        )
        .unwrap();
        assert_eq!(deps[0].needed_by(), Phase::Stage);
    }

    #[test]
    fn test_invalid_needed_by_is_interface_error() {
        let err = parse(
            r#"{ { spec = "local.dep@v1", source = "dep.lua", needed_by = "later" } }"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("invalid needed_by value 'later'"));
    }

    #[test]
    fn test_weak_product_with_fallback() {
        let deps = parse(
            r#"{ { product = "tool", weak = { spec = "local.fb@v1", source = "fb.lua" } } }"#,
        )
        .unwrap();
        match &deps[0] {
            DependencyDecl::WeakProduct {
                product, fallback, ..
            } => {
                assert_eq!(product, "tool");
                assert_eq!(fallback.as_ref().unwrap().spec.to_string(), "local.fb@v1");
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_ref_only_product() {
        let deps = parse(r#"{ { product = "tool" } }"#).unwrap();
        match &deps[0] {
            DependencyDecl::WeakProduct { fallback, .. } => assert!(fallback.is_none()),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_strong_product() {
        let deps = parse(
            r#"{ { product = "cc", spec = "acme.gcc@v13", source = "gcc.lua" } }"#,
        )
        .unwrap();
        match &deps[0] {
            DependencyDecl::Product { product, spec, .. } => {
                assert_eq!(product, "cc");
                assert_eq!(spec.to_string(), "acme.gcc@v13");
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_spec_from_bundle() {
        let deps = parse(r#"{ { spec = "test.member@v1", bundle = "helpers" } }"#).unwrap();
        match &deps[0] {
            DependencyDecl::SpecFromBundle { spec, bundle, .. } => {
                assert_eq!(spec.to_string(), "test.member@v1");
                assert_eq!(bundle, "helpers");
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_empty_entry_is_schema_error() {
        let err = parse(r#"{ { } }"#).unwrap_err();
        assert!(matches!(err, Error::Schema(_)));
    }

    #[test]
    fn test_weak_fallback_missing_source_is_schema_error() {
        let err =
            parse(r#"{ { product = "tool", weak = { spec = "local.fb@v1" } } }"#).unwrap_err();
        assert!(err.to_string().contains("missing 'source'"));
    }
}
