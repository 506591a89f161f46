//! Canonical option values
//!
//! Options tables attached to manifest entries and dependency
//! declarations are canonicalized into a stable byte form: keys sorted
//! recursively, scalars stringified, functions and userdata rejected.
//! The canonical text is both the equality key for instance memoization
//! and an input to the variant hash.

use crate::error::{Error, Result};
use mlua::{Lua, Value};
use std::collections::BTreeMap;
use std::fmt::Write;

#[derive(Debug, Clone, PartialEq)]
pub enum OptionValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Table(BTreeMap<String, OptionValue>),
}

impl OptionValue {
    /// Convert a Lua value into a canonical option value. Functions,
    /// userdata, and threads have no stable byte form and are rejected.
    pub fn from_lua(value: &Value) -> Result<Self> {
        match value {
            Value::Boolean(b) => Ok(OptionValue::Bool(*b)),
            Value::Integer(i) => Ok(OptionValue::Int(*i)),
            Value::Number(n) => Ok(OptionValue::Float(*n)),
            Value::String(s) => Ok(OptionValue::Str(s.to_str()?.to_string())),
            Value::Table(t) => {
                let mut map = BTreeMap::new();
                for pair in t.clone().pairs::<Value, Value>() {
                    let (k, v) = pair?;
                    let key = match &k {
                        Value::String(s) => s.to_str()?.to_string(),
                        Value::Integer(i) => i.to_string(),
                        Value::Number(n) => n.to_string(),
                        other => {
                            return Err(Error::Interface(format!(
                                "invalid option key type: {}",
                                other.type_name()
                            )))
                        }
                    };
                    map.insert(key, OptionValue::from_lua(&v)?);
                }
                Ok(OptionValue::Table(map))
            }
            other => Err(Error::Interface(format!(
                "invalid option type: {}",
                other.type_name()
            ))),
        }
    }

    /// Rebuild a Lua value for passing options into phase hooks.
    pub fn to_lua<'lua>(&self, lua: &'lua Lua) -> mlua::Result<Value<'lua>> {
        Ok(match self {
            OptionValue::Bool(b) => Value::Boolean(*b),
            OptionValue::Int(i) => Value::Integer(*i),
            OptionValue::Float(f) => Value::Number(*f),
            OptionValue::Str(s) => Value::String(lua.create_string(s)?),
            OptionValue::Table(map) => {
                let table = lua.create_table()?;
                for (k, v) in map {
                    table.set(k.as_str(), v.to_lua(lua)?)?;
                }
                Value::Table(table)
            }
        })
    }

    /// Stable canonical text. Tables render as `{k=v,…}` with keys in
    /// lexicographic order; strings are quoted with `"` and `\` escaped.
    pub fn canonical_text(&self) -> String {
        let mut out = String::new();
        self.write_canonical(&mut out);
        out
    }

    fn write_canonical(&self, out: &mut String) {
        match self {
            OptionValue::Bool(b) => {
                let _ = write!(out, "{}", b);
            }
            OptionValue::Int(i) => {
                let _ = write!(out, "{}", i);
            }
            OptionValue::Float(f) => {
                let _ = write!(out, "{}", f);
            }
            OptionValue::Str(s) => {
                out.push('"');
                for c in s.chars() {
                    if c == '"' || c == '\\' {
                        out.push('\\');
                    }
                    out.push(c);
                }
                out.push('"');
            }
            OptionValue::Table(map) => {
                out.push('{');
                for (i, (k, v)) in map.iter().enumerate() {
                    if i > 0 {
                        out.push(',');
                    }
                    out.push_str(k);
                    out.push('=');
                    v.write_canonical(out);
                }
                out.push('}');
            }
        }
    }

    pub fn is_empty_table(&self) -> bool {
        matches!(self, OptionValue::Table(m) if m.is_empty())
    }
}

/// Canonical instance key: the identity, plus `{options}` when any are
/// set. This is the memoization key and the identity component of the
/// variant hash input, e.g. `local.gcc@v13{variant="lto"}`.
pub fn canonical_key(identity: &crate::identity::Identity, options: Option<&OptionValue>) -> String {
    match options {
        None => identity.to_string(),
        Some(o) if o.is_empty_table() => identity.to_string(),
        Some(o) => format!("{}{}", identity, o.canonical_text()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn from_lua_src(src: &str) -> Result<OptionValue> {
        let lua = Lua::new();
        let value: Value = lua.load(src).eval().unwrap();
        OptionValue::from_lua(&value)
    }

    #[test]
    fn test_keys_sorted_recursively() {
        let opts = from_lua_src(r#"{ b = 2, a = 1, c = { z = true, y = "s" } }"#).unwrap();
        assert_eq!(opts.canonical_text(), r#"{a=1,b=2,c={y="s",z=true}}"#);
    }

    #[test]
    fn test_table_order_does_not_matter() {
        let a = from_lua_src(r#"{ x = 1, y = 2 }"#).unwrap();
        let b = from_lua_src(r#"{ y = 2, x = 1 }"#).unwrap();
        assert_eq!(a.canonical_text(), b.canonical_text());
    }

    #[test]
    fn test_string_escaping() {
        let opts = from_lua_src(r#"{ s = 'say "hi"' }"#).unwrap();
        assert_eq!(opts.canonical_text(), r#"{s="say \"hi\""}"#);
    }

    #[test]
    fn test_integer_keys_stringified() {
        let opts = from_lua_src(r#"{ [1] = "first", [2] = "second" }"#).unwrap();
        assert_eq!(opts.canonical_text(), r#"{1="first",2="second"}"#);
    }

    #[test]
    fn test_function_rejected() {
        let err = from_lua_src(r#"{ f = function() end }"#).unwrap_err();
        assert!(matches!(err, Error::Interface(_)));
        assert!(err.to_string().contains("invalid option type"));
    }

    #[test]
    fn test_canonical_key_with_and_without_options() {
        let identity: crate::identity::Identity = "local.with_options@v1".parse().unwrap();
        assert_eq!(canonical_key(&identity, None), "local.with_options@v1");

        let opts = from_lua_src(r#"{ variant = "foo" }"#).unwrap();
        assert_eq!(
            canonical_key(&identity, Some(&opts)),
            r#"local.with_options@v1{variant="foo"}"#
        );

        let empty = from_lua_src("{}").unwrap();
        assert_eq!(canonical_key(&identity, Some(&empty)), "local.with_options@v1");
    }

    #[test]
    fn test_roundtrip_through_lua() {
        let lua = Lua::new();
        let opts = from_lua_src(r#"{ n = 3, s = "x", t = { deep = true } }"#).unwrap();
        let value = opts.to_lua(&lua).unwrap();
        let back = OptionValue::from_lua(&value).unwrap();
        assert_eq!(opts.canonical_text(), back.canonical_text());
    }
}
