// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use crate::expr::{Expr, Fragment, Intrinsic};
use crate::resolver::TypedExpr;
use crate::template::{Entity, Override, Tag};
use crate::value::{DeferredValue, Value};

use std::collections::BTreeMap;
use std::rc::Rc;

use anyhow::{anyhow, bail, Result};
use data_encoding::BASE64;
use indexmap::IndexMap;
use log::debug;

/// What the construct factory hands back for a produced entity: a
/// primary value usable wherever the entity is referenced by name, and
/// an attribute lookup for attribute-lookup intrinsics. Attributes that
/// only materialize later may be absent; lookups against them produce
/// deferred values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConstructHandle {
    pub primary: Value,
    pub attributes: BTreeMap<Rc<str>, Value>,
}

/// The external object-construction runtime. The evaluator never
/// instantiates target objects itself: once an entity's arguments are
/// fully evaluated it hands them here, together with tags, override
/// instructions and declared dependencies.
pub trait ConstructFactory {
    /// Construct an entity from its initializer arguments and wire it
    /// into the output artifact under the given logical id.
    fn instantiate(&mut self, fqn: &str, logical_id: &str, args: Vec<Value>)
        -> Result<ConstructHandle>;

    /// Invoke a method on an already-constructed entity; the result
    /// becomes an entity of its own.
    fn invoke(
        &mut self,
        fqn: &str,
        method: &str,
        target: &str,
        args: Vec<Value>,
    ) -> Result<ConstructHandle>;

    /// Construct a plain (non-entity) object appearing inside property
    /// values.
    fn create(&mut self, fqn: &str, args: Vec<Value>) -> Result<Value>;

    /// Call a static factory method of a class.
    fn invoke_static(&mut self, fqn: &str, method: &str, args: Vec<Value>) -> Result<Value>;

    /// Select a static property of an enum-like class.
    fn static_property(&mut self, fqn: &str, property: &str) -> Result<Value>;

    /// Apply a structural patch to an already-produced entity.
    fn apply_override(&mut self, logical_id: &str, patch: &Override) -> Result<()>;

    /// Annotate an already-produced entity.
    fn apply_tag(&mut self, logical_id: &str, tag: &Tag) -> Result<()>;

    /// Record an explicit dependency edge between two entities,
    /// independent of any value reference.
    fn add_dependency(&mut self, from: &str, to: &str) -> Result<()>;

    /// Fetch a value imported from outside the template.
    fn import_value(&mut self, name: &str) -> Result<Value>;

    /// Look an attribute up a second time, after construction has
    /// completed. This is how deferred values are forced.
    fn resolve_attribute(&self, logical_id: &str, attribute: &str) -> Result<Value>;
}

impl Value {
    /// Replace every deferred placeholder in this value by asking the
    /// factory, which by now has finished construction.
    pub fn force(&self, factory: &dyn ConstructFactory) -> Result<Value> {
        match self {
            Value::Deferred(d) => factory.resolve_attribute(&d.target, &d.attribute),
            Value::Array(items) => {
                let mut out = Vec::with_capacity(items.len());
                for item in items.iter() {
                    out.push(item.force(factory)?);
                }
                Ok(Value::from(out))
            }
            Value::Object(fields) => {
                let mut out = IndexMap::with_capacity(fields.len());
                for (k, v) in fields.iter() {
                    out.insert(k.clone(), v.force(factory)?);
                }
                Ok(Value::from(out))
            }
            _ => Ok(self.clone()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EntityState {
    Pending,
    Resolving,
    Registered,
    Failed,
}

/// A produced entity's registry record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Registered {
    pub primary: Value,
    pub attributes: BTreeMap<Rc<str>, Value>,
}

/// Per-run mutable state: logical id -> produced record, populated
/// strictly in dependency order. Lookups distinguish a name that does
/// not exist (unknown reference) from one that exists but has not been
/// evaluated yet (ordering bug); both are fatal.
#[derive(Debug, Default)]
pub struct Registry {
    entries: BTreeMap<Rc<str>, Registered>,
    order: Vec<Rc<str>>,
    states: BTreeMap<Rc<str>, EntityState>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Announce an entity name before evaluation starts. Every name in
    /// the template is declared up front so lookups can tell unknown
    /// names apart from not-yet-evaluated ones.
    pub fn declare(&mut self, name: &Rc<str>) {
        self.states.insert(name.clone(), EntityState::Pending);
    }

    fn begin(&mut self, name: &Rc<str>) -> Result<()> {
        match self.states.get(name) {
            Some(EntityState::Pending) => {
                self.states.insert(name.clone(), EntityState::Resolving);
                Ok(())
            }
            None => bail!("unknown entity `{name}`"),
            Some(state) => bail!("entity `{name}` evaluated twice (state {state:?})"),
        }
    }

    fn register(&mut self, name: &Rc<str>, record: Registered) -> Result<()> {
        match self.states.get(name) {
            Some(EntityState::Resolving) => {
                self.states.insert(name.clone(), EntityState::Registered);
                self.entries.insert(name.clone(), record);
                self.order.push(name.clone());
                Ok(())
            }
            _ => bail!("entity `{name}` registered out of order"),
        }
    }

    fn fail(&mut self, name: &Rc<str>) {
        self.states.insert(name.clone(), EntityState::Failed);
    }

    /// The record of a registered entity.
    pub fn get(&self, name: &str) -> Result<&Registered> {
        match self.states.get(name) {
            None => bail!("unknown entity `{name}`"),
            Some(EntityState::Registered) => match self.entries.get(name) {
                Some(record) => Ok(record),
                None => bail!("internal error: `{name}` registered without a record"),
            },
            Some(_) => {
                bail!("entity `{name}` has not been evaluated yet; this is an evaluation-order bug")
            }
        }
    }

    pub fn is_registered(&self, name: &str) -> bool {
        matches!(self.states.get(name), Some(EntityState::Registered))
    }

    /// Registered names, in the order they were produced.
    pub fn names(&self) -> impl Iterator<Item = &Rc<str>> {
        self.order.iter()
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Collapse the registry into one object of primary values, in
    /// registration order, forcing any deferred placeholders.
    pub fn finalize(&self, factory: &dyn ConstructFactory) -> Result<Value> {
        let mut out = IndexMap::with_capacity(self.order.len());
        for name in self.order.iter() {
            let record = self.get(name)?;
            out.insert(name.clone(), record.primary.force(factory)?);
        }
        Ok(Value::from(out))
    }
}

/// An entity after resolution, ready to evaluate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolvedEntity {
    Construct {
        fqn: Rc<str>,
        args: Vec<TypedExpr>,
    },
    Call {
        target: Rc<str>,
        target_fqn: Rc<str>,
        method: Rc<str>,
        args: Vec<TypedExpr>,
    },
}

/// Walks resolved expressions, computes intrinsics, and drives object
/// construction through the factory in dependency order. Owns the
/// registry for the lifetime of one template run.
pub struct Evaluator {
    registry: Registry,
    conditions: IndexMap<Rc<str>, Expr>,
    condition_cache: BTreeMap<Rc<str>, bool>,
    imports: BTreeMap<Rc<str>, Value>,
}

impl Evaluator {
    pub fn new(conditions: IndexMap<Rc<str>, Expr>) -> Self {
        Self {
            registry: Registry::new(),
            conditions,
            condition_cache: BTreeMap::new(),
            imports: BTreeMap::new(),
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn registry_mut(&mut self) -> &mut Registry {
        &mut self.registry
    }

    pub fn into_registry(self) -> Registry {
        self.registry
    }

    /// Evaluate one entity and register the produced record before the
    /// next entity starts. Must be called in dependency order.
    pub fn evaluate_entity(
        &mut self,
        entity: &Entity,
        resolved: &ResolvedEntity,
        factory: &mut dyn ConstructFactory,
    ) -> Result<()> {
        let logical_id = &entity.logical_id;
        self.registry.begin(logical_id)?;
        debug!("evaluating entity `{logical_id}`");
        match self.construct_entity(entity, resolved, factory) {
            Ok(handle) => self.registry.register(
                logical_id,
                Registered {
                    primary: handle.primary,
                    attributes: handle.attributes,
                },
            ),
            Err(e) => {
                self.registry.fail(logical_id);
                Err(e)
            }
        }
    }

    fn construct_entity(
        &mut self,
        entity: &Entity,
        resolved: &ResolvedEntity,
        factory: &mut dyn ConstructFactory,
    ) -> Result<ConstructHandle> {
        let logical_id = &entity.logical_id;
        let handle = match resolved {
            ResolvedEntity::Construct { fqn, args } => {
                let args = self.evaluate_all(args, factory)?;
                factory.instantiate(fqn, logical_id, args)?
            }
            ResolvedEntity::Call {
                target,
                target_fqn,
                method,
                args,
            } => {
                // The call target must already have been constructed.
                self.registry.get(target)?;
                let args = self.evaluate_all(args, factory)?;
                factory.invoke(target_fqn, method, target, args)?
            }
        };
        for patch in &entity.overrides {
            factory.apply_override(logical_id, patch)?;
        }
        for tag in &entity.tags {
            factory.apply_tag(logical_id, tag)?;
        }
        for dep in &entity.depends_on {
            factory.add_dependency(logical_id, dep)?;
        }
        Ok(handle)
    }

    fn evaluate_all(
        &mut self,
        args: &[TypedExpr],
        factory: &mut dyn ConstructFactory,
    ) -> Result<Vec<Value>> {
        let mut out = Vec::with_capacity(args.len());
        for arg in args {
            out.push(self.evaluate(arg, factory)?);
        }
        Ok(out)
    }

    /// Evaluate a resolved expression to a plain value.
    pub fn evaluate(
        &mut self,
        typed: &TypedExpr,
        factory: &mut dyn ConstructFactory,
    ) -> Result<Value> {
        match typed {
            TypedExpr::Null | TypedExpr::Void => Ok(Value::Null),
            TypedExpr::Bool(b) => Ok(Value::Bool(*b)),
            TypedExpr::Number(n) => Ok(Value::Number(*n)),
            TypedExpr::String(s) => Ok(Value::String(s.clone())),
            TypedExpr::Array(items) => {
                let mut out = Vec::with_capacity(items.len());
                for item in items {
                    out.push(self.evaluate(item, factory)?);
                }
                Ok(Value::from(out))
            }
            TypedExpr::Map(fields) | TypedExpr::Struct { fields, .. } => {
                let mut out = IndexMap::with_capacity(fields.len());
                for (k, v) in fields.iter() {
                    out.insert(k.clone(), self.evaluate(v, factory)?);
                }
                Ok(Value::from(out))
            }
            // Enum choices serialize as the choice name.
            TypedExpr::EnumChoice { choice, .. } => Ok(Value::String(choice.clone())),
            TypedExpr::StaticProperty { fqn, property } => {
                factory.static_property(fqn, property)
            }
            TypedExpr::StaticMethodCall { fqn, method, args } => {
                let args = self.evaluate_all(args, factory)?;
                factory.invoke_static(fqn, method, args)
            }
            TypedExpr::InitializerCall { fqn, args } => {
                let args = self.evaluate_all(args, factory)?;
                factory.create(fqn, args)
            }
            TypedExpr::ConstructRef(intrinsic) | TypedExpr::Intrinsic(intrinsic) => {
                self.eval_intrinsic(intrinsic, factory)
            }
            TypedExpr::Any(expr) => self.eval_raw(expr, factory),
        }
    }

    // Evaluate raw, un-narrowed structure (`any`/`json` positions and
    // intrinsic sub-expressions).
    fn eval_raw(&mut self, expr: &Expr, factory: &mut dyn ConstructFactory) -> Result<Value> {
        match expr {
            Expr::Null => Ok(Value::Null),
            Expr::Bool(b) => Ok(Value::Bool(*b)),
            Expr::Number(n) => Ok(Value::Number(*n)),
            Expr::String(s) => Ok(Value::String(s.clone())),
            Expr::Array(items) => {
                let mut out = Vec::with_capacity(items.len());
                for item in items {
                    out.push(self.eval_raw(item, factory)?);
                }
                Ok(Value::from(out))
            }
            Expr::Object(fields) => {
                let mut out = IndexMap::with_capacity(fields.len());
                for (k, v) in fields.iter() {
                    out.insert(k.clone(), self.eval_raw(v, factory)?);
                }
                Ok(Value::from(out))
            }
            Expr::Intrinsic(intrinsic) => self.eval_intrinsic(intrinsic, factory),
        }
    }

    fn eval_intrinsic(
        &mut self,
        intrinsic: &Intrinsic,
        factory: &mut dyn ConstructFactory,
    ) -> Result<Value> {
        match intrinsic {
            Intrinsic::Ref { logical_id } => Ok(self.registry.get(logical_id)?.primary.clone()),

            Intrinsic::GetAtt {
                logical_id,
                attribute,
                ..
            } => self.eval_get_att(logical_id, attribute),

            Intrinsic::Sub {
                fragments,
                substitutions,
            } => self.eval_sub(fragments, substitutions, factory),

            Intrinsic::Select { index, list } => {
                let index_value = self.eval_raw(index, factory)?;
                let index = index_value
                    .as_number()
                    .ok()
                    .and_then(|n| n.as_usize())
                    .ok_or_else(|| {
                        anyhow!(
                            "Fn::Select index must be a non-negative integer, got {index_value}"
                        )
                    })?;
                let list = self.eval_raw(list, factory)?;
                let items = list
                    .as_array()
                    .map_err(|_| anyhow!("Fn::Select needs a list, got {}", list.kind()))?;
                // The list may itself be a deferred computation, so the
                // bound is only known now.
                match items.get(index) {
                    Some(item) => Ok(item.clone()),
                    None if items.is_empty() => {
                        bail!("Fn::Select index {index} is out of range; the list is empty")
                    }
                    None => bail!(
                        "Fn::Select index {index} is out of range; valid range is 0..{}",
                        items.len() - 1
                    ),
                }
            }

            Intrinsic::Split { delimiter, source } => {
                let source = self.eval_raw(source, factory)?;
                let s = source
                    .as_string()
                    .map_err(|_| anyhow!("Fn::Split needs a string, got {}", source.kind()))?;
                Ok(Value::from(
                    s.split(delimiter.as_ref())
                        .map(Value::from)
                        .collect::<Vec<_>>(),
                ))
            }

            Intrinsic::Join { delimiter, list } => {
                let list = self.eval_raw(list, factory)?;
                let items = list
                    .as_array()
                    .map_err(|_| anyhow!("Fn::Join needs a list, got {}", list.kind()))?;
                let mut parts = Vec::with_capacity(items.len());
                for item in items {
                    parts.push(value_to_string(item)?);
                }
                Ok(Value::from(parts.join(delimiter.as_ref())))
            }

            Intrinsic::If {
                condition,
                then_branch,
                else_branch,
            } => {
                // Only the taken branch is ever evaluated.
                if self.eval_condition(condition, factory)? {
                    self.eval_raw(then_branch, factory)
                } else {
                    self.eval_raw(else_branch, factory)
                }
            }

            Intrinsic::And { operands } => {
                let mut result = true;
                for op in operands {
                    result &= self.eval_bool_operand(op, "Fn::And", factory)?;
                }
                Ok(Value::Bool(result))
            }

            Intrinsic::Or { operands } => {
                let mut result = false;
                for op in operands {
                    result |= self.eval_bool_operand(op, "Fn::Or", factory)?;
                }
                Ok(Value::Bool(result))
            }

            Intrinsic::Not { operand } => {
                let b = self.eval_bool_operand(operand, "Fn::Not", factory)?;
                Ok(Value::Bool(!b))
            }

            Intrinsic::Equals { lhs, rhs } => {
                let lhs = self.eval_raw(lhs, factory)?;
                let rhs = self.eval_raw(rhs, factory)?;
                Ok(Value::Bool(lhs == rhs))
            }

            Intrinsic::ImportValue { name } => {
                let name_value = self.eval_raw(name, factory)?;
                let name = name_value.as_string().map_err(|_| {
                    anyhow!(
                        "Fn::ImportValue needs a string name, got {}",
                        name_value.kind()
                    )
                })?;
                if let Some(v) = self.imports.get(name) {
                    return Ok(v.clone());
                }
                let v = factory.import_value(name)?;
                self.imports.insert(name.clone(), v.clone());
                Ok(v)
            }

            Intrinsic::Base64 { source } => {
                let source = self.eval_raw(source, factory)?;
                let s = source
                    .as_string()
                    .map_err(|_| anyhow!("Fn::Base64 needs a string, got {}", source.kind()))?;
                Ok(Value::from(BASE64.encode(s.as_bytes())))
            }
        }
    }

    fn eval_get_att(&mut self, logical_id: &Rc<str>, attribute: &Rc<str>) -> Result<Value> {
        let record = self.registry.get(logical_id)?;
        match record.attributes.get(attribute) {
            Some(v) => Ok(v.clone()),
            // The entity exists but this attribute has not materialized
            // yet: leave a placeholder to be looked up a second time
            // once construction has completed.
            None => Ok(Value::Deferred(Rc::new(DeferredValue {
                target: logical_id.clone(),
                attribute: attribute.clone(),
            }))),
        }
    }

    fn eval_sub(
        &mut self,
        fragments: &[Fragment],
        substitutions: &IndexMap<Rc<str>, Expr>,
        factory: &mut dyn ConstructFactory,
    ) -> Result<Value> {
        // The local substitution map is evaluated once and consulted
        // before the registry.
        let mut locals: IndexMap<Rc<str>, Value> = IndexMap::with_capacity(substitutions.len());
        for (name, expr) in substitutions.iter() {
            locals.insert(name.clone(), self.eval_raw(expr, factory)?);
        }

        let mut out = String::new();
        for fragment in fragments {
            match fragment {
                // `${!` cooks down to a literal `${`.
                Fragment::Literal(text) => out.push_str(&text.replace("${!", "${")),
                Fragment::Ref(name) => {
                    let value = match locals.get(name) {
                        Some(v) => v.clone(),
                        None => self.registry.get(name)?.primary.clone(),
                    };
                    out.push_str(&value_to_string(&value)?);
                }
                Fragment::GetAtt(name, attr) => {
                    let key: Rc<str> = format!("{name}.{attr}").into();
                    let value = match locals.get(&key) {
                        Some(v) => v.clone(),
                        None => self.eval_get_att(name, attr)?,
                    };
                    out.push_str(&value_to_string(&value)?);
                }
            }
        }
        Ok(Value::from(out))
    }

    fn eval_bool_operand(
        &mut self,
        expr: &Expr,
        context: &str,
        factory: &mut dyn ConstructFactory,
    ) -> Result<bool> {
        let v = self.eval_raw(expr, factory)?;
        match v.as_bool() {
            Ok(b) => Ok(*b),
            Err(_) => bail!("{context} operands must be booleans, got {}", v.kind()),
        }
    }

    /// Evaluate a named condition, memoized per run.
    pub fn eval_condition(
        &mut self,
        name: &Rc<str>,
        factory: &mut dyn ConstructFactory,
    ) -> Result<bool> {
        if let Some(b) = self.condition_cache.get(name) {
            return Ok(*b);
        }
        let Some(expr) = self.conditions.get(name).cloned() else {
            bail!("unknown condition `{name}`");
        };
        let v = self.eval_raw(&expr, factory)?;
        let b = match v.as_bool() {
            Ok(b) => *b,
            Err(_) => bail!("condition `{name}` must evaluate to a boolean, got {}", v.kind()),
        };
        self.condition_cache.insert(name.clone(), b);
        Ok(b)
    }
}

fn value_to_string(v: &Value) -> Result<String> {
    match v {
        Value::String(s) => Ok(s.to_string()),
        Value::Number(n) => Ok(n.to_string()),
        Value::Bool(b) => Ok(b.to_string()),
        Value::Deferred(d) => bail!(
            "attribute `{}.{}` has not materialized yet and cannot be interpolated",
            d.target,
            d.attribute
        ),
        _ => bail!("cannot convert {} to a string", v.kind()),
    }
}
