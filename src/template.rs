// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use crate::expr::Expr;
use crate::graph::{DepGraph, GraphError};
use crate::parser;
use crate::value::Value;

use std::collections::{BTreeMap, BTreeSet};
use std::rc::Rc;

use anyhow::{bail, Result};
use indexmap::IndexMap;

/// A key/value annotation applied to a constructed entity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tag {
    pub key: Rc<str>,
    pub value: Rc<str>,
}

/// A structural patch applied to an entity after construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Override {
    Update { path: Rc<str>, value: Value },
    Remove { path: Rc<str> },
}

/// How an entity comes into being: constructed from its declared type,
/// or produced by calling a method on another, already-constructed
/// entity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntityKind {
    Construct {
        type_fqn: Rc<str>,
    },
    Call {
        target: Rc<str>,
        method: Rc<str>,
        args: Expr,
    },
}

/// A named, typed declaration in a template. Immutable once parsed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entity {
    pub logical_id: Rc<str>,
    pub kind: EntityKind,
    pub properties: Expr,
    pub tags: Vec<Tag>,
    pub depends_on: Vec<Rc<str>>,
    pub overrides: Vec<Override>,
    pub metadata: Option<Value>,
}

impl Entity {
    /// Every entity this one depends on: names referenced anywhere in
    /// its expressions, the call target, and explicit declarations.
    pub fn dependencies(&self) -> BTreeSet<Rc<str>> {
        let mut deps = self.properties.references();
        if let EntityKind::Call { target, args, .. } = &self.kind {
            deps.insert(target.clone());
            deps.extend(args.references());
        }
        deps.extend(self.depends_on.iter().cloned());
        deps
    }
}

/// A parsed template: an ordered set of entity declarations plus the
/// named boolean conditions its conditional expressions select on.
#[derive(Debug, Clone, Default)]
pub struct Template {
    pub entities: IndexMap<Rc<str>, Rc<Entity>>,
    pub conditions: IndexMap<Rc<str>, Expr>,
}

impl Template {
    /// Parse the raw template mapping. Structural errors carry the
    /// offending field path.
    pub fn from_value(raw: &Value) -> Result<Template> {
        let Value::Object(sections) = raw else {
            bail!("template: expecting an object, got {}", raw.kind());
        };

        let mut template = Template::default();
        for (section, value) in sections.iter() {
            match section.as_ref() {
                "resources" => template.parse_entities(value)?,
                "conditions" => template.parse_conditions(value)?,
                _ => bail!("template: unknown section `{section}`"),
            }
        }
        Ok(template)
    }

    pub fn from_json_str(s: &str) -> Result<Template> {
        Self::from_value(&Value::from_json_str(s)?)
    }

    #[cfg(feature = "yaml")]
    pub fn from_yaml_str(s: &str) -> Result<Template> {
        Self::from_value(&Value::from_yaml_str(s)?)
    }

    fn parse_entities(&mut self, raw: &Value) -> Result<()> {
        let Value::Object(entities) = raw else {
            bail!("resources: expecting an object, got {}", raw.kind());
        };
        for (logical_id, decl) in entities.iter() {
            let entity = parse_entity(logical_id, decl)?;
            if self
                .entities
                .insert(logical_id.clone(), Rc::new(entity))
                .is_some()
            {
                bail!("resources.{logical_id}: duplicate entity");
            }
        }
        Ok(())
    }

    fn parse_conditions(&mut self, raw: &Value) -> Result<()> {
        let Value::Object(conditions) = raw else {
            bail!("conditions: expecting an object, got {}", raw.kind());
        };
        for (name, value) in conditions.iter() {
            let expr = parser::parse_at(value, &format!("conditions.{name}"))?;
            if self.conditions.insert(name.clone(), expr).is_some() {
                bail!("conditions.{name}: duplicate condition");
            }
        }
        Ok(())
    }

    /// Merge another template into this one. Entity and condition
    /// names must not collide.
    pub fn merge(&mut self, other: Template) -> Result<()> {
        for (logical_id, entity) in other.entities {
            if self.entities.insert(logical_id.clone(), entity).is_some() {
                bail!("resources.{logical_id}: duplicate entity across templates");
            }
        }
        for (name, expr) in other.conditions {
            if self.conditions.insert(name.clone(), expr).is_some() {
                bail!("conditions.{name}: duplicate condition across templates");
            }
        }
        Ok(())
    }

    /// The dependency graph over this template's entities: one node per
    /// logical id, one edge per discovered or declared dependency. A
    /// reference to an entity that is never declared fails here, naming
    /// that entity.
    pub fn dependency_graph(&self) -> Result<DepGraph<Rc<Entity>>, GraphError> {
        let nodes: IndexMap<Rc<str>, Rc<Entity>> = self
            .entities
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        let deps: BTreeMap<Rc<str>, BTreeSet<Rc<str>>> = self
            .entities
            .iter()
            .map(|(k, v)| (k.clone(), v.dependencies()))
            .collect();
        DepGraph::new(nodes, deps)
    }
}

fn parse_entity(logical_id: &Rc<str>, raw: &Value) -> Result<Entity> {
    let path = format!("resources.{logical_id}");
    let Value::Object(fields) = raw else {
        bail!("{path}: expecting an object, got {}", raw.kind());
    };

    let mut type_fqn = None;
    let mut on = None;
    let mut call = None;
    let mut properties = Expr::Object(IndexMap::new());
    let mut tags = vec![];
    let mut depends_on = vec![];
    let mut overrides = vec![];
    let mut metadata = None;

    for (key, value) in fields.iter() {
        match key.as_ref() {
            "type" => type_fqn = Some(expect_string(value, &format!("{path}.type"))?),
            "on" => on = Some(expect_string(value, &format!("{path}.on"))?),
            "call" => call = Some(parse_call(value, &format!("{path}.call"))?),
            "properties" => {
                properties = parser::parse_at(value, &format!("{path}.properties"))?;
            }
            "tags" => tags = parse_tags(value, &format!("{path}.tags"))?,
            "dependsOn" => depends_on = parse_depends_on(value, &format!("{path}.dependsOn"))?,
            "overrides" => overrides = parse_overrides(value, &format!("{path}.overrides"))?,
            "metadata" => metadata = Some(value.clone()),
            _ => bail!("{path}: unknown field `{key}`"),
        }
    }

    let kind = match (type_fqn, on, call) {
        (Some(type_fqn), None, None) => EntityKind::Construct { type_fqn },
        (None, Some(target), Some((method, args))) => EntityKind::Call {
            target,
            method,
            args,
        },
        (None, Some(_), None) | (None, None, Some(_)) => {
            bail!("{path}: the call form requires both `on` and `call`")
        }
        (Some(_), _, _) => {
            bail!("{path}: `type` cannot be combined with `on`/`call`")
        }
        (None, None, None) => {
            bail!("{path}: an entity needs either `type` or `on`/`call`")
        }
    };

    if matches!(kind, EntityKind::Call { .. }) && !matches!(&properties, Expr::Object(f) if f.is_empty())
    {
        bail!("{path}: the call form does not take `properties`; arguments go under `call`");
    }

    Ok(Entity {
        logical_id: logical_id.clone(),
        kind,
        properties,
        tags,
        depends_on,
        overrides,
        metadata,
    })
}

fn parse_call(raw: &Value, path: &str) -> Result<(Rc<str>, Expr)> {
    let Value::Object(fields) = raw else {
        bail!("{path}: expecting a single-key object naming the method, got {}", raw.kind());
    };
    if fields.len() != 1 {
        bail!(
            "{path}: expecting a single-key object naming the method, got {} keys",
            fields.len()
        );
    }
    match fields.iter().next() {
        Some((method, args)) => {
            let args = parser::parse_at(args, &format!("{path}.{method}"))?;
            Ok((method.clone(), args))
        }
        None => bail!("{path}: expecting a single-key object naming the method"),
    }
}

fn parse_tags(raw: &Value, path: &str) -> Result<Vec<Tag>> {
    let Value::Array(items) = raw else {
        bail!("{path}: expecting a list of tags, got {}", raw.kind());
    };
    let mut tags = Vec::with_capacity(items.len());
    for (i, item) in items.iter().enumerate() {
        let path = format!("{path}[{i}]");
        let Value::Object(fields) = item else {
            bail!("{path}: expecting a {{key, value}} object, got {}", item.kind());
        };
        let mut key = None;
        let mut value = None;
        for (k, v) in fields.iter() {
            match k.as_ref() {
                "key" => key = Some(expect_string(v, &format!("{path}.key"))?),
                "value" => value = Some(expect_string(v, &format!("{path}.value"))?),
                _ => bail!("{path}: unknown field `{k}`"),
            }
        }
        match (key, value) {
            (Some(key), Some(value)) => tags.push(Tag { key, value }),
            _ => bail!("{path}: a tag needs both `key` and `value`"),
        }
    }
    Ok(tags)
}

fn parse_depends_on(raw: &Value, path: &str) -> Result<Vec<Rc<str>>> {
    match raw {
        Value::String(s) => Ok(vec![s.clone()]),
        Value::Array(items) => {
            let mut out = Vec::with_capacity(items.len());
            for (i, item) in items.iter().enumerate() {
                out.push(expect_string(item, &format!("{path}[{i}]"))?);
            }
            Ok(out)
        }
        _ => bail!(
            "{path}: expecting an entity name or a list of entity names, got {}",
            raw.kind()
        ),
    }
}

fn parse_overrides(raw: &Value, path: &str) -> Result<Vec<Override>> {
    let Value::Array(items) = raw else {
        bail!("{path}: expecting a list of overrides, got {}", raw.kind());
    };
    let mut out = Vec::with_capacity(items.len());
    for (i, item) in items.iter().enumerate() {
        let path = format!("{path}[{i}]");
        let Value::Object(fields) = item else {
            bail!("{path}: expecting an override object, got {}", item.kind());
        };
        let mut target = None;
        let mut update = None;
        let mut remove = false;
        for (k, v) in fields.iter() {
            match k.as_ref() {
                "path" => target = Some(expect_string(v, &format!("{path}.path"))?),
                "update" => update = Some(v.clone()),
                "remove" => remove = *v.as_bool().map_err(|_| {
                    anyhow::anyhow!("{path}.remove: expecting a boolean, got {}", v.kind())
                })?,
                _ => bail!("{path}: unknown field `{k}`"),
            }
        }
        let Some(target) = target else {
            bail!("{path}: an override needs a `path`");
        };
        out.push(match (update, remove) {
            (Some(value), false) => Override::Update {
                path: target,
                value,
            },
            (None, true) => Override::Remove { path: target },
            _ => bail!("{path}: an override needs exactly one of `update` or `remove`"),
        });
    }
    Ok(out)
}

fn expect_string(raw: &Value, path: &str) -> Result<Rc<str>> {
    match raw {
        Value::String(s) => Ok(s.clone()),
        _ => bail!("{path}: expecting a string, got {}", raw.kind()),
    }
}
