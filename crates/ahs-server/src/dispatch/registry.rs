//! CommandRegistry: the catalog of invokable command handlers.
//!
//! Built once at startup from an explicit bootstrap list and shared
//! read-only afterwards.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use ahs_core::{AhsError, AhsResult, Identity};
use futures_util::future::BoxFuture;
use futures_util::stream::BoxStream;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use tracing::{debug, warn};
use uuid::Uuid;

/// Declared type of a handler parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamType {
    String,
    Int,
    Float,
    Bool,
    Uuid,
    Any,
}

impl ParamType {
    pub fn accepts(self, value: &Value) -> bool {
        match self {
            ParamType::String => value.is_string(),
            ParamType::Int => value.is_i64() || value.is_u64(),
            ParamType::Float => value.is_number(),
            ParamType::Bool => value.is_boolean(),
            ParamType::Uuid => value
                .as_str()
                .is_some_and(|s| Uuid::parse_str(s).is_ok()),
            ParamType::Any => true,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            ParamType::String => "string",
            ParamType::Int => "int",
            ParamType::Float => "float",
            ParamType::Bool => "bool",
            ParamType::Uuid => "uuid",
            ParamType::Any => "any",
        }
    }
}

/// One declared parameter. `default: None` means required.
#[derive(Debug, Clone, PartialEq)]
pub struct Param {
    pub name: String,
    pub ty: ParamType,
    pub default: Option<Value>,
}

impl Param {
    pub fn is_required(&self) -> bool {
        self.default.is_none()
    }
}

/// Arguments after validation, keyed by parameter name.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BoundArgs {
    values: Map<String, Value>,
}

impl BoundArgs {
    pub fn new(values: Map<String, Value>) -> Self {
        Self { values }
    }

    pub fn raw(&self, name: &str) -> Option<&Value> {
        self.values.get(name)
    }

    pub fn get<T: DeserializeOwned>(&self, name: &str) -> anyhow::Result<T> {
        let value = self
            .values
            .get(name)
            .ok_or_else(|| anyhow::anyhow!("argument '{name}' not bound"))?;
        Ok(serde_json::from_value(value.clone())?)
    }

    /// `None` when absent or null.
    pub fn get_opt<T: DeserializeOwned>(&self, name: &str) -> anyhow::Result<Option<T>> {
        match self.values.get(name) {
            None | Some(Value::Null) => Ok(None),
            Some(v) => Ok(Some(serde_json::from_value(v.clone())?)),
        }
    }
}

pub type OneShotFn =
    dyn Fn(Identity, BoundArgs) -> BoxFuture<'static, anyhow::Result<Option<Value>>> + Send + Sync;
pub type StreamFn =
    dyn Fn(Identity, BoundArgs) -> BoxStream<'static, anyhow::Result<Value>> + Send + Sync;

/// How a handler produces its results.
#[derive(Clone)]
pub enum Handler {
    /// Runs once; a `None` or null result sends nothing.
    OneShot(Arc<OneShotFn>),
    /// Yields any number of results, each sent as soon as it is produced.
    Stream(Arc<StreamFn>),
}

impl Handler {
    pub fn kind(&self) -> &'static str {
        match self {
            Handler::OneShot(_) => "one_shot",
            Handler::Stream(_) => "stream",
        }
    }
}

impl fmt::Debug for Handler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Handler::{}", self.kind())
    }
}

/// A command's name, declared parameters and handler.
#[derive(Debug, Clone)]
pub struct CommandSpec {
    pub name: String,
    pub params: Vec<Param>,
    pub handler: Handler,
}

impl CommandSpec {
    pub fn one_shot<F>(name: impl Into<String>, f: F) -> Self
    where
        F: Fn(Identity, BoundArgs) -> BoxFuture<'static, anyhow::Result<Option<Value>>>
            + Send
            + Sync
            + 'static,
    {
        Self {
            name: name.into(),
            params: Vec::new(),
            handler: Handler::OneShot(Arc::new(f)),
        }
    }

    pub fn stream<F>(name: impl Into<String>, f: F) -> Self
    where
        F: Fn(Identity, BoundArgs) -> BoxStream<'static, anyhow::Result<Value>> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            params: Vec::new(),
            handler: Handler::Stream(Arc::new(f)),
        }
    }

    pub fn required(mut self, name: impl Into<String>, ty: ParamType) -> Self {
        self.params.push(Param {
            name: name.into(),
            ty,
            default: None,
        });
        self
    }

    pub fn optional(mut self, name: impl Into<String>, ty: ParamType, default: Value) -> Self {
        self.params.push(Param {
            name: name.into(),
            ty,
            default: Some(default),
        });
        self
    }

    /// Required parameter names, in declaration order.
    pub fn required_params(&self) -> Vec<&str> {
        self.params
            .iter()
            .filter(|p| p.is_required())
            .map(|p| p.name.as_str())
            .collect()
    }

    pub fn optional_params(&self) -> Vec<(&str, &Value)> {
        self.params
            .iter()
            .filter_map(|p| p.default.as_ref().map(|d| (p.name.as_str(), d)))
            .collect()
    }

    pub fn param(&self, name: &str) -> Option<&Param> {
        self.params.iter().find(|p| p.name == name)
    }
}

/// Lookup table keyed by `(namespace, command)`.
#[derive(Debug)]
pub struct CommandRegistry {
    namespaces: HashSet<String>,
    commands: HashMap<(String, String), Arc<CommandSpec>>,
}

impl CommandRegistry {
    /// Create a registry that accepts registrations for `namespaces` only.
    pub fn new<I, S>(namespaces: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            namespaces: namespaces.into_iter().map(Into::into).collect(),
            commands: HashMap::new(),
        }
    }

    pub fn register(&mut self, namespace: &str, spec: CommandSpec) -> AhsResult<()> {
        if !self.namespaces.contains(namespace) {
            return Err(AhsError::UnknownNamespace(namespace.to_string()));
        }
        let command = spec.name.clone();
        debug!(
            namespace,
            command = %command,
            kind = spec.handler.kind(),
            required = ?spec.required_params(),
            "registered command"
        );
        let key = (namespace.to_string(), command.clone());
        if self.commands.insert(key, Arc::new(spec)).is_some() {
            warn!(namespace, command = %command, "duplicate command registration, last one wins");
        }
        Ok(())
    }

    pub fn lookup(&self, namespace: &str, command: &str) -> Option<Arc<CommandSpec>> {
        self.commands
            .get(&(namespace.to_string(), command.to_string()))
            .cloned()
    }

    pub fn has_namespace(&self, namespace: &str) -> bool {
        self.namespaces.contains(namespace)
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    /// Registered `(namespace, command)` pairs, sorted.
    pub fn names(&self) -> Vec<(String, String)> {
        let mut names: Vec<_> = self.commands.keys().cloned().collect();
        names.sort();
        names
    }
}
