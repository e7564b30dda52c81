//! Explicit calling convention of wrapped computations.
//!
//! Arguments travel as a [`CallArgs`] bag of JSON values, the cache toggles as a separate
//! [`CallOptions`], so the toggles can never leak into the computation. Parameter names are
//! declared up front through a [`Signature`].

use std::collections::BTreeMap;

use serde_json::Value;

/// Positional and keyword arguments of a single call.
///
/// Keyword arguments are kept sorted by name.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CallArgs {
    positional: Vec<Value>,
    keyword: BTreeMap<String, Value>,
}

impl CallArgs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a positional argument.
    pub fn arg(mut self, value: impl Into<Value>) -> Self {
        self.positional.push(value.into());
        self
    }

    /// Sets a keyword argument, replacing a previous one with the same name.
    pub fn kwarg(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.keyword.insert(name.into(), value.into());
        self
    }

    pub fn positional(&self) -> &[Value] {
        &self.positional
    }

    pub fn keywords(&self) -> &BTreeMap<String, Value> {
        &self.keyword
    }

    /// Returns the positional argument at `index`.
    pub fn get(&self, index: usize) -> Option<&Value> {
        self.positional.get(index)
    }

    /// Returns the keyword argument called `name`.
    pub fn keyword(&self, name: &str) -> Option<&Value> {
        self.keyword.get(name)
    }

    pub fn is_empty(&self) -> bool {
        self.positional.is_empty() && self.keyword.is_empty()
    }

    /// Replaces the positional argument at `index`.
    ///
    /// Returns `false` if there is no such argument.
    pub(crate) fn replace_positional(&mut self, index: usize, value: Value) -> bool {
        match self.positional.get_mut(index) {
            Some(slot) => {
                *slot = value;
                true
            }
            None => false,
        }
    }

    pub(crate) fn set_keyword(&mut self, name: &str, value: Value) {
        self.keyword.insert(name.to_owned(), value);
    }
}

/// Per-call cache toggles.
///
/// These are consumed by the wrappers and never forwarded to the computation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallOptions {
    /// Look the value up in the cache before computing.
    pub cache_read: bool,
    /// Write a freshly computed value back to the cache.
    pub cache_write: bool,
    /// Await the write-back before returning. Otherwise it runs detached.
    pub wait_for_write: bool,
}

impl CallOptions {
    /// Skips the cache lookup, always computing.
    pub fn without_read(mut self) -> Self {
        self.cache_read = false;
        self
    }

    /// Skips writing the computed value back.
    pub fn without_write(mut self) -> Self {
        self.cache_write = false;
        self
    }

    /// Returns as soon as the value is computed and lets the write-back finish in the background.
    pub fn detached_write(mut self) -> Self {
        self.wait_for_write = false;
        self
    }
}

impl Default for CallOptions {
    fn default() -> Self {
        Self {
            cache_read: true,
            cache_write: true,
            wait_for_write: true,
        }
    }
}

/// How a declared parameter receives its value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamKind {
    /// Can be passed positionally or by keyword.
    Positional,
    /// Collects surplus positional arguments. Not addressable by name.
    VarPositional,
    /// Can only be passed by keyword.
    KeywordOnly,
    /// Collects surplus keyword arguments. Not addressable by name.
    VarKeyword,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Param {
    name: String,
    kind: ParamKind,
    default: Option<Value>,
}

impl Param {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> ParamKind {
        self.kind
    }

    pub fn default(&self) -> Option<&Value> {
        self.default.as_ref()
    }
}

/// The ordered parameter list of a wrapped computation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Signature {
    params: Vec<Param>,
}

impl Signature {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(mut self, name: impl Into<String>, kind: ParamKind, default: Option<Value>) -> Self {
        let positional_closed = self.params.iter().any(|param| {
            matches!(param.kind, ParamKind::VarPositional | ParamKind::KeywordOnly)
        });
        let kind = match kind {
            ParamKind::Positional if positional_closed => ParamKind::KeywordOnly,
            kind => kind,
        };
        self.params.push(Param {
            name: name.into(),
            kind,
            default,
        });
        self
    }

    /// Declares a required parameter.
    ///
    /// Declared after a variadic positional or a keyword-only parameter, it is keyword-only.
    pub fn param(self, name: impl Into<String>) -> Self {
        self.push(name, ParamKind::Positional, None)
    }

    /// Declares a parameter with a default value, keyword-only under the same rule as
    /// [`param`](Self::param).
    pub fn param_with_default(self, name: impl Into<String>, default: impl Into<Value>) -> Self {
        self.push(name, ParamKind::Positional, Some(default.into()))
    }

    /// Declares a parameter collecting surplus positional arguments.
    pub fn var_positional(self, name: impl Into<String>) -> Self {
        self.push(name, ParamKind::VarPositional, None)
    }

    /// Declares a keyword-only parameter, optionally with a default.
    pub fn keyword_only(self, name: impl Into<String>, default: Option<Value>) -> Self {
        self.push(name, ParamKind::KeywordOnly, default)
    }

    /// Declares a parameter collecting surplus keyword arguments.
    pub fn var_keyword(self, name: impl Into<String>) -> Self {
        self.push(name, ParamKind::VarKeyword, None)
    }

    pub fn params(&self) -> &[Param] {
        &self.params
    }

    /// Parameters that positional arguments bind to, in declaration order.
    fn positional_params(&self) -> impl Iterator<Item = &Param> {
        self.params
            .iter()
            .filter(|param| param.kind == ParamKind::Positional)
    }

    /// Returns the positional slot of the parameter called `name`.
    ///
    /// Keyword-only and variadic parameters have no slot.
    pub fn positional_index(&self, name: &str) -> Option<usize> {
        self.positional_params()
            .position(|param| param.name == name)
    }

    /// Maps parameter names to the values a call binds to them.
    ///
    /// Declared defaults come first, then positional arguments matched to the positional
    /// parameters in order, then all keyword arguments. Later sources win. Surplus positional
    /// arguments are dropped since they are not addressable by name.
    pub fn resolve(&self, args: &CallArgs) -> BTreeMap<String, Value> {
        let mut resolved: BTreeMap<String, Value> = self
            .params
            .iter()
            .filter_map(|param| Some((param.name.clone(), param.default.clone()?)))
            .collect();

        for (param, value) in self.positional_params().zip(args.positional()) {
            resolved.insert(param.name.clone(), value.clone());
        }

        for (name, value) in args.keywords() {
            resolved.insert(name.clone(), value.clone());
        }

        resolved
    }
}
