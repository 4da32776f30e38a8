//! Code units: the manifest format, loader scopes and compiled instances.
//!
//! A unit is a JSON manifest naming its capabilities and a list of steps.
//! Units advertising [`ACTION_CAPABILITY`] are compiled into a
//! [`UnitInstance`] and run once against the execution context; others are
//! loaded passively. Native steps refer to actions registered in the
//! device's [`ActionRegistry`] and are resolved at instantiation, so an
//! unknown native fails before anything runs.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use ensemble_core::message::{Arg, Message};

use super::context::ExecutionContext;
use super::CodeError;
use crate::control::ControlDispatcher;

/// Capability that marks a unit as executable.
pub const ACTION_CAPABILITY: &str = "action";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnitManifest {
    pub name: String,
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default)]
    pub steps: Vec<Step>,
}

impl UnitManifest {
    pub fn parse(bytes: &[u8]) -> Result<Self, CodeError> {
        let manifest: UnitManifest =
            serde_json::from_slice(bytes).map_err(|e| CodeError::Malformed(e.to_string()))?;
        if manifest.name.trim().is_empty() {
            return Err(CodeError::Malformed("unit name is empty".into()));
        }
        Ok(manifest)
    }

    pub fn is_action(&self) -> bool {
        self.capabilities.iter().any(|c| c == ACTION_CAPABILITY)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Step {
    /// Log locally and to the controller.
    Log { text: String },
    /// Replace the device status.
    Status { text: String },
    Put { key: String, value: serde_json::Value },
    Remove { key: String },
    /// Apply a control message locally, as if it came from the controller.
    Control {
        message: String,
        #[serde(default)]
        args: Vec<Arg>,
    },
    /// Publish on the broadcast group.
    Broadcast {
        message: String,
        #[serde(default)]
        args: Vec<Arg>,
    },
    /// Run `steps` at an absolute synchronized time, or `delay_ms` after now.
    At {
        #[serde(default)]
        at_ms: Option<i64>,
        #[serde(default)]
        delay_ms: Option<i64>,
        steps: Vec<Step>,
    },
    Native { name: String },
}

// ── Native actions ────────────────────────────────────────────────────────────

/// Compiled-in behavior a unit can invoke by name.
pub trait NativeAction: Send + Sync {
    fn run(&self, ctx: &ExecutionContext) -> anyhow::Result<()>;
}

impl<F> NativeAction for F
where
    F: Fn(&ExecutionContext) -> anyhow::Result<()> + Send + Sync,
{
    fn run(&self, ctx: &ExecutionContext) -> anyhow::Result<()> {
        self(ctx)
    }
}

#[derive(Clone, Default)]
pub struct ActionRegistry {
    actions: Arc<DashMap<String, Arc<dyn NativeAction>>>,
}

impl ActionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, name: &str, action: Arc<dyn NativeAction>) {
        self.actions.insert(name.to_string(), action);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn NativeAction>> {
        self.actions.get(name).map(|a| a.value().clone())
    }
}

// ── Scopes ────────────────────────────────────────────────────────────────────

static NEXT_SCOPE: AtomicU64 = AtomicU64::new(1);

/// Namespace units are defined into. A name can be defined once per scope.
#[derive(Debug)]
pub struct LoaderScope {
    id: u64,
    units: HashMap<String, Arc<LoadedUnit>>,
}

impl Default for LoaderScope {
    fn default() -> Self {
        Self::new()
    }
}

impl LoaderScope {
    pub fn new() -> Self {
        Self {
            id: NEXT_SCOPE.fetch_add(1, Ordering::Relaxed),
            units: HashMap::new(),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn define(
        &mut self,
        manifest: UnitManifest,
        hash: [u8; 32],
    ) -> Result<Arc<LoadedUnit>, CodeError> {
        if self.units.contains_key(&manifest.name) {
            return Err(CodeError::DuplicateName(manifest.name));
        }
        let unit = Arc::new(LoadedUnit {
            manifest,
            hash,
            scope: self.id,
        });
        self.units.insert(unit.manifest.name.clone(), unit.clone());
        Ok(unit)
    }

    pub fn get(&self, name: &str) -> Option<Arc<LoadedUnit>> {
        self.units.get(name).cloned()
    }
}

/// A defined but not yet instantiated unit.
#[derive(Debug)]
pub struct LoadedUnit {
    pub manifest: UnitManifest,
    pub hash: [u8; 32],
    pub scope: u64,
}

impl LoadedUnit {
    pub fn name(&self) -> &str {
        &self.manifest.name
    }

    pub fn is_action(&self) -> bool {
        self.manifest.is_action()
    }

    /// Resolve every step. Fails on unknown natives or bad control names.
    pub fn instantiate(&self, registry: &ActionRegistry) -> Result<UnitInstance, CodeError> {
        let ops = compile(&self.manifest.steps, registry).map_err(|reason| {
            CodeError::Instantiation {
                unit: self.manifest.name.clone(),
                reason,
            }
        })?;
        Ok(UnitInstance {
            name: self.manifest.name.clone(),
            ops: Arc::new(ops),
        })
    }
}

// ── Compiled form ─────────────────────────────────────────────────────────────

enum When {
    At(i64),
    After(i64),
}

enum Op {
    Log(String),
    Status(String),
    Put(String, serde_json::Value),
    Remove(String),
    Control(Message),
    Broadcast(String, Vec<Arg>),
    Schedule(When, Arc<Vec<Op>>),
    Native(String, Arc<dyn NativeAction>),
}

fn compile(steps: &[Step], registry: &ActionRegistry) -> Result<Vec<Op>, String> {
    steps
        .iter()
        .map(|step| {
            Ok(match step {
                Step::Log { text } => Op::Log(text.clone()),
                Step::Status { text } => Op::Status(text.clone()),
                Step::Put { key, value } => Op::Put(key.clone(), value.clone()),
                Step::Remove { key } => Op::Remove(key.clone()),
                Step::Control { message, args } => {
                    if !message.starts_with('/') {
                        return Err(format!("control message must start with '/': {message}"));
                    }
                    Op::Control(Message::new(message.as_str(), args.clone()))
                }
                Step::Broadcast { message, args } => {
                    if !message.starts_with('/') {
                        return Err(format!("broadcast message must start with '/': {message}"));
                    }
                    Op::Broadcast(message.clone(), args.clone())
                }
                Step::At {
                    at_ms,
                    delay_ms,
                    steps,
                } => {
                    let when = match (at_ms, delay_ms) {
                        (Some(t), None) => When::At(*t),
                        (None, d) => When::After(d.unwrap_or(0)),
                        (Some(_), Some(_)) => {
                            return Err("`at` takes at_ms or delay_ms, not both".into())
                        }
                    };
                    Op::Schedule(when, Arc::new(compile(steps, registry)?))
                }
                Step::Native { name } => match registry.get(name) {
                    Some(action) => Op::Native(name.clone(), action),
                    None => return Err(format!("unknown native action: {name}")),
                },
            })
        })
        .collect()
}

/// An instantiated executable unit.
pub struct UnitInstance {
    name: String,
    ops: Arc<Vec<Op>>,
}

impl std::fmt::Debug for UnitInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UnitInstance")
            .field("name", &self.name)
            .field("ops", &self.ops.len())
            .finish()
    }
}

impl UnitInstance {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The entry point. Stops at the first failing native step.
    pub fn run(&self, ctx: &ExecutionContext) -> anyhow::Result<()> {
        run_ops(&self.name, &self.ops, ctx)
    }
}

fn run_ops(unit: &str, ops: &Arc<Vec<Op>>, ctx: &ExecutionContext) -> anyhow::Result<()> {
    for op in ops.iter() {
        match op {
            Op::Log(text) => ctx.log(text),
            Op::Status(text) => ctx.set_status(text),
            Op::Put(key, value) => {
                ctx.store.insert(key.clone(), value.clone());
            }
            Op::Remove(key) => {
                ctx.store.remove(key);
            }
            Op::Control(msg) => {
                ControlDispatcher::for_context(ctx).dispatch(msg);
            }
            Op::Broadcast(name, args) => ctx.broadcast(name, args.clone()),
            Op::Schedule(when, nested) => {
                let target = match when {
                    When::At(t) => *t,
                    When::After(d) => ctx.now() + d,
                };
                let nested = nested.clone();
                let task_ctx = ctx.clone();
                let unit = unit.to_string();
                ctx.do_at_time(target, move || {
                    if let Err(e) = run_ops(&unit, &nested, &task_ctx) {
                        tracing::warn!(unit, error = %e, "scheduled unit steps failed");
                    }
                });
            }
            Op::Native(name, action) => {
                action
                    .run(ctx)
                    .map_err(|e| e.context(format!("native action {name} in {unit}")))?;
            }
        }
    }
    Ok(())
}
