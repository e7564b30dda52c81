use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde_json::Value;

use super::args::{CallArgs, ParamKind, Signature};

/// The suffix appended to a [`CacheKey`] to form the key of its lease lock.
pub const LOCK_SUFFIX: &str = "-lock";

/// The key a computed value is stored under.
///
/// Identical logical calls produce identical keys, in every process.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey(Arc<str>);

impl CacheKey {
    /// Synthesizes a key from the target name and the call arguments.
    ///
    /// The key looks like `name(1, 'x')[('a', 1), ('b', 2)]`: positional arguments in call
    /// order, followed by keyword arguments sorted by name. With `noself`, the first positional
    /// argument (a receiver) does not contribute to the key.
    pub fn for_call(name: &str, args: &CallArgs, noself: bool) -> Self {
        let positional = match args.positional() {
            [_, rest @ ..] if noself => rest,
            all => all,
        };

        let mut builder = CacheKeyBuilder::new(name);
        builder.write_positional(positional);
        builder.write_keywords(args.keywords());
        builder.build()
    }

    /// Synthesizes a key from the resolved parameter mapping.
    ///
    /// Calls that bind the same values to the same parameters share a key, no matter whether
    /// the values were passed positionally, by keyword, or left at their defaults.
    pub fn for_parameters(name: &str, resolved: &BTreeMap<String, Value>) -> Self {
        let mut builder = CacheKeyBuilder::new(name);
        builder.write_mapping(resolved);
        builder.build()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The key of the lease lock guarding the computation of this key.
    pub fn lock_key(&self) -> String {
        format!("{}{LOCK_SUFFIX}", self.0)
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for CacheKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl From<String> for CacheKey {
    fn from(key: String) -> Self {
        Self(key.into())
    }
}

impl From<&str> for CacheKey {
    fn from(key: &str) -> Self {
        Self(key.into())
    }
}

/// A caller-supplied key function, receiving the target name and the call arguments.
pub type KeyBuilderFn = Arc<dyn Fn(&str, &CallArgs) -> String + Send + Sync>;

/// How a single-value wrapper derives the [`CacheKey`] of a call.
#[derive(Clone, Default)]
pub enum KeyStrategy {
    /// `name(positional)[keywords]`, see [`CacheKey::for_call`].
    #[default]
    Arguments,
    /// The resolved parameter mapping, see [`CacheKey::for_parameters`].
    Parameters,
    /// The output of a caller-supplied function, used verbatim.
    Custom(KeyBuilderFn),
}

impl KeyStrategy {
    /// Derives the key of a call to the target `name` declared with `signature`.
    ///
    /// With `noself`, the first positional argument, or the first positional parameter when
    /// keying by parameters, is left out. Custom functions always see the full arguments.
    pub fn build(
        &self,
        name: &str,
        signature: &Signature,
        args: &CallArgs,
        noself: bool,
    ) -> CacheKey {
        match self {
            Self::Arguments => CacheKey::for_call(name, args, noself),
            Self::Parameters => {
                let mut resolved = signature.resolve(args);
                if noself {
                    let receiver = signature
                        .params()
                        .iter()
                        .find(|param| param.kind() == ParamKind::Positional);
                    if let Some(receiver) = receiver {
                        resolved.remove(receiver.name());
                    }
                }
                CacheKey::for_parameters(name, &resolved)
            }
            Self::Custom(build) => CacheKey::from(build(name, args)),
        }
    }
}

impl fmt::Debug for KeyStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Arguments => write!(f, "Arguments"),
            Self::Parameters => write!(f, "Parameters"),
            Self::Custom(_) => write!(f, "Custom(..)"),
        }
    }
}

/// A builder for [`CacheKey`]s.
///
/// This builder implements the [`Write`](std::fmt::Write) trait, so arbitrary stable text
/// can be appended to the synthesized parts.
#[derive(Debug)]
pub struct CacheKeyBuilder {
    key: String,
}

impl CacheKeyBuilder {
    pub fn new(name: &str) -> Self {
        Self {
            key: name.to_owned(),
        }
    }

    /// Writes positional arguments as `(a, b)`.
    pub fn write_positional(&mut self, values: &[Value]) {
        self.key.push('(');
        for (i, value) in values.iter().enumerate() {
            if i > 0 {
                self.key.push_str(", ");
            }
            push_value(&mut self.key, value);
        }
        self.key.push(')');
    }

    /// Writes keyword arguments as `[('a', 1), ('b', 2)]`, in the map's (sorted) order.
    pub fn write_keywords(&mut self, keywords: &BTreeMap<String, Value>) {
        self.key.push('[');
        for (i, (name, value)) in keywords.iter().enumerate() {
            if i > 0 {
                self.key.push_str(", ");
            }
            self.key.push('(');
            push_quoted(&mut self.key, name);
            self.key.push_str(", ");
            push_value(&mut self.key, value);
            self.key.push(')');
        }
        self.key.push(']');
    }

    /// Writes a mapping as `{'a': 1, 'b': 2}`.
    pub fn write_mapping(&mut self, mapping: &BTreeMap<String, Value>) {
        push_mapping(&mut self.key, mapping);
    }

    /// Finalize the [`CacheKey`].
    pub fn build(self) -> CacheKey {
        CacheKey(self.key.into())
    }
}

impl fmt::Write for CacheKeyBuilder {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.key.write_str(s)
    }
}

fn push_value(out: &mut String, value: &Value) {
    match value {
        Value::Null => out.push_str("null"),
        Value::Bool(b) => out.push_str(if *b { "true" } else { "false" }),
        Value::Number(n) => out.push_str(&n.to_string()),
        Value::String(s) => push_quoted(out, s),
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push_str(", ");
                }
                push_value(out, item);
            }
            out.push(']');
        }
        Value::Object(map) => {
            let mut entries: Vec<_> = map.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            push_entries(out, entries);
        }
    }
}

fn push_mapping(out: &mut String, mapping: &BTreeMap<String, Value>) {
    push_entries(out, mapping.iter().collect());
}

fn push_entries(out: &mut String, entries: Vec<(&String, &Value)>) {
    out.push('{');
    for (i, (name, value)) in entries.into_iter().enumerate() {
        if i > 0 {
            out.push_str(", ");
        }
        push_quoted(out, name);
        out.push_str(": ");
        push_value(out, value);
    }
    out.push('}');
}

fn push_quoted(out: &mut String, s: &str) {
    out.push('\'');
    for c in s.chars() {
        if matches!(c, '\'' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out.push('\'');
}
