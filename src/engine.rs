// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use crate::evaluator::{ConstructFactory, Evaluator, Registry, ResolvedEntity};
use crate::resolver::Resolver;
use crate::schema::{TypeRef, TypeSystem};
use crate::template::{Entity, EntityKind, Template};
use crate::value::Value;

use std::collections::{BTreeMap, BTreeSet};
use std::rc::Rc;

use anyhow::{anyhow, bail, Result};
use log::{debug, info};
use thiserror::Error;

/// One failing entity's report: the entity, and what went wrong inside
/// it (the message carries the sub-path within its properties).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diagnostic {
    pub logical_id: String,
    pub message: String,
}

fn format_diagnostics(diagnostics: &[Diagnostic]) -> String {
    let mut out = format!(
        "evaluation failed for {} entit{}:",
        diagnostics.len(),
        if diagnostics.len() == 1 { "y" } else { "ies" }
    );
    for d in diagnostics {
        out.push_str(&format!("\n  {}: {}", d.logical_id, d.message));
    }
    out
}

/// A failed run: one diagnostic per failing entity. Failures do not
/// stop the run early; every failing entity is reported at once.
#[derive(Debug, Clone, Error)]
#[error("{}", format_diagnostics(.diagnostics))]
pub struct EvaluationError {
    pub diagnostics: Vec<Diagnostic>,
}

/// The template evaluation engine: turns parsed templates into a
/// registry of produced entities by draining the dependency queue,
/// narrowing each entity against the type system, and delegating
/// construction to the factory.
#[derive(Default)]
pub struct Engine {
    type_system: Option<Rc<TypeSystem>>,
    template: Template,
}

impl Engine {
    pub fn new() -> Self {
        Self::default()
    }

    /// The schema provider to resolve against. The type system is
    /// large and read-mostly; it is passed in explicitly rather than
    /// discovered ambiently.
    pub fn set_type_system(&mut self, type_system: TypeSystem) {
        self.type_system = Some(Rc::new(type_system));
    }

    /// Parse and add a template. Templates added separately are merged;
    /// entity names must stay unique across all of them.
    pub fn add_template(&mut self, raw: &Value) -> Result<()> {
        let template = Template::from_value(raw)?;
        self.template.merge(template)
    }

    pub fn add_template_from_json(&mut self, json: &str) -> Result<()> {
        self.add_template(&Value::from_json_str(json)?)
    }

    #[cfg(feature = "yaml")]
    pub fn add_template_from_yaml(&mut self, yaml: &str) -> Result<()> {
        self.add_template(&Value::from_yaml_str(yaml)?)
    }

    pub fn template(&self) -> &Template {
        &self.template
    }

    /// Evaluate every entity in dependency order. On success, returns
    /// the registry in registration order; deferred placeholders inside
    /// it are forced by the caller via [`Registry::finalize`] or
    /// [`Value::force`] once construction has settled. On failure,
    /// reports one diagnostic per failing entity; dependents of a
    /// failed entity are skipped without diagnostics of their own.
    pub fn evaluate(&mut self, factory: &mut dyn ConstructFactory) -> Result<Registry> {
        let Some(type_system) = self.type_system.clone() else {
            bail!("no type system configured; call set_type_system first");
        };

        let graph = self.template.dependency_graph()?;
        let dependencies: BTreeMap<Rc<str>, BTreeSet<Rc<str>>> = graph
            .names()
            .map(|n| {
                let deps = graph.dependencies(n).cloned().unwrap_or_default();
                (n.clone(), deps)
            })
            .collect();

        let entity_types = self.entity_types(&type_system);
        let resolver = Resolver::with_entities(&type_system, entity_types.clone());
        let mut evaluator = Evaluator::new(self.template.conditions.clone());
        for name in self.template.entities.keys() {
            evaluator.registry_mut().declare(name);
        }

        let mut queue = graph.queue();
        let mut failed: BTreeSet<Rc<str>> = BTreeSet::new();
        let mut diagnostics: Vec<Diagnostic> = vec![];

        while let Some(name) = queue.take()? {
            let Some(entity) = self.template.entities.get(&name).cloned() else {
                queue.complete(&name);
                continue;
            };

            let blocked = dependencies
                .get(&name)
                .is_some_and(|deps| deps.iter().any(|d| failed.contains(d)));
            if blocked {
                // One root cause, one diagnostic: dependents of a
                // failed entity are skipped silently.
                debug!("skipping `{name}`: a dependency failed");
                failed.insert(name.clone());
                queue.complete(&name);
                continue;
            }

            match self.process(&entity, &entity_types, &type_system, &resolver, &mut evaluator, factory)
            {
                Ok(()) => {}
                Err(e) => {
                    diagnostics.push(Diagnostic {
                        logical_id: name.to_string(),
                        message: format!("{e:#}"),
                    });
                    failed.insert(name.clone());
                }
            }
            queue.complete(&name);
        }

        if !diagnostics.is_empty() {
            return Err(EvaluationError { diagnostics }.into());
        }
        info!("evaluated {} entities", evaluator.registry().len());
        Ok(evaluator.into_registry())
    }

    fn process(
        &self,
        entity: &Entity,
        entity_types: &BTreeMap<Rc<str>, Rc<str>>,
        type_system: &TypeSystem,
        resolver: &Resolver,
        evaluator: &mut Evaluator,
        factory: &mut dyn ConstructFactory,
    ) -> Result<()> {
        let resolved = self.resolve_entity(entity, entity_types, type_system, resolver)?;
        evaluator.evaluate_entity(entity, &resolved, factory)
    }

    fn resolve_entity(
        &self,
        entity: &Entity,
        entity_types: &BTreeMap<Rc<str>, Rc<str>>,
        type_system: &TypeSystem,
        resolver: &Resolver,
    ) -> Result<ResolvedEntity> {
        let path = format!("resources.{}", entity.logical_id);
        match &entity.kind {
            EntityKind::Construct { type_fqn } => {
                type_system
                    .find_type(type_fqn)
                    .map_err(|e| anyhow!("{path}.type: {e}"))?;
                if !type_system.is_construct(type_fqn) {
                    bail!("{path}.type: `{type_fqn}` is not an entity type");
                }
                let Some(initializer) = type_system.initializer_of(type_fqn) else {
                    bail!("{path}.type: `{type_fqn}` has no initializer");
                };
                let args = resolver.resolve_arguments(
                    initializer,
                    &entity.properties,
                    &format!("{path}.properties"),
                )?;
                Ok(ResolvedEntity::Construct {
                    fqn: type_fqn.clone(),
                    args,
                })
            }
            EntityKind::Call {
                target,
                method,
                args,
            } => {
                let Some(target_fqn) = entity_types.get(target) else {
                    bail!("{path}.on: `{target}` is not an entity with a concrete type");
                };
                let Some(callable) = type_system.method_of(target_fqn, method) else {
                    bail!("{path}.call: `{target_fqn}` has no method `{method}`");
                };
                let resolved_args = resolver.resolve_arguments(
                    callable,
                    args,
                    &format!("{path}.call.{method}"),
                )?;
                Ok(ResolvedEntity::Call {
                    target: target.clone(),
                    target_fqn: target_fqn.clone(),
                    method: callable.name.clone(),
                    args: resolved_args,
                })
            }
        }
    }

    // The declared type of each entity, for construct-reference
    // assignability checks. Constructor-form entities declare theirs;
    // call-form entities take the named return type of the called
    // method, following chains of calls to a fixpoint. Entities whose
    // produced type is primitive or unknown stay unmapped; resolution
    // errors for them surface when the entity itself is processed.
    fn entity_types(&self, type_system: &TypeSystem) -> BTreeMap<Rc<str>, Rc<str>> {
        let mut types: BTreeMap<Rc<str>, Rc<str>> = BTreeMap::new();
        for (name, entity) in self.template.entities.iter() {
            if let EntityKind::Construct { type_fqn } = &entity.kind {
                types.insert(name.clone(), type_fqn.clone());
            }
        }
        loop {
            let mut progressed = false;
            for (name, entity) in self.template.entities.iter() {
                if types.contains_key(name) {
                    continue;
                }
                let EntityKind::Call { target, method, .. } = &entity.kind else {
                    continue;
                };
                let Some(target_fqn) = types.get(target) else {
                    continue;
                };
                let Some(callable) = type_system.method_of(target_fqn, method) else {
                    continue;
                };
                if let Some(TypeRef::Named(fqn)) = &callable.returns {
                    types.insert(name.clone(), fqn.clone());
                    progressed = true;
                }
            }
            if !progressed {
                break;
            }
        }
        types
    }
}
