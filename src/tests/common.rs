// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Shared test fixtures: a small reflected type universe and a
//! recording construct factory.

use crate::evaluator::{ConstructFactory, ConstructHandle};
use crate::template::{Override, Tag};
use crate::value::Value;
use crate::TypeSystem;

use std::collections::BTreeMap;
use std::rc::Rc;

use anyhow::{bail, Result};
use indexmap::IndexMap;

pub fn value(v: serde_json::Value) -> Value {
    serde_json::from_value(v).expect("fixture value")
}

/// A universe with one of everything: constructs, structs, an enum, an
/// enum-like class with static methods and properties, and a behavioral
/// interface with a construct implementation.
pub fn type_system() -> TypeSystem {
    TypeSystem::from_serde_json_value(serde_json::json!({
        "types": [
            { "kind": "interface", "fqn": "acme.IGrantable" },
            {
                "kind": "struct",
                "fqn": "acme.ServiceProps",
                "properties": [
                    { "name": "memory", "type": { "primitive": "number" }, "optional": true }
                ]
            },
            {
                "kind": "class",
                "fqn": "acme.Service",
                "construct": true,
                "interfaces": ["acme.IGrantable"],
                "initializer": {
                    "name": "<init>",
                    "parameters": [
                        { "name": "props", "type": { "fqn": "acme.ServiceProps" }, "optional": true }
                    ]
                }
            },
            { "kind": "enum", "fqn": "acme.Visibility", "members": ["PUBLIC", "PRIVATE"] },
            {
                "kind": "class",
                "fqn": "acme.Duration",
                "methods": [
                    {
                        "name": "minutes",
                        "static": true,
                        "parameters": [
                            { "name": "amount", "type": { "primitive": "number" } }
                        ],
                        "returns": { "fqn": "acme.Duration" }
                    }
                ]
            },
            {
                "kind": "class",
                "fqn": "acme.StorageClass",
                "staticProperties": [
                    { "name": "STANDARD", "type": { "fqn": "acme.StorageClass" } },
                    { "name": "ARCHIVE", "type": { "fqn": "acme.StorageClass" } }
                ]
            },
            {
                "kind": "struct",
                "fqn": "acme.BucketProps",
                "properties": [
                    { "name": "bucketName", "type": { "primitive": "string" }, "optional": true },
                    { "name": "versioned", "type": { "primitive": "boolean" }, "optional": true },
                    { "name": "timeout", "type": { "fqn": "acme.Duration" }, "optional": true },
                    { "name": "storageClass", "type": { "fqn": "acme.StorageClass" }, "optional": true },
                    { "name": "visibility", "type": { "fqn": "acme.Visibility" }, "optional": true },
                    { "name": "extra", "type": { "primitive": "json" }, "optional": true }
                ]
            },
            {
                "kind": "class",
                "fqn": "acme.Grant",
                "construct": true,
                "initializer": { "name": "<init>" }
            },
            {
                "kind": "class",
                "fqn": "acme.Bucket",
                "construct": true,
                "initializer": {
                    "name": "<init>",
                    "parameters": [
                        { "name": "props", "type": { "fqn": "acme.BucketProps" }, "optional": true }
                    ]
                },
                "methods": [
                    {
                        "name": "grantRead",
                        "parameters": [
                            { "name": "grantee", "type": { "fqn": "acme.IGrantable" } }
                        ],
                        "returns": { "fqn": "acme.Grant" }
                    }
                ]
            }
        ]
    }))
    .expect("fixture type system")
}

/// Records every factory interaction and produces synthetic handles:
/// `ref:<logical id>` primaries for constructed entities and
/// `call:<target>.<method>` primaries for invocations.
#[derive(Default)]
pub struct TestFactory {
    pub instantiated: Vec<(String, String, Vec<Value>)>,
    pub invoked: Vec<(String, String, String, Vec<Value>)>,
    pub overrides: Vec<(String, Override)>,
    pub tags: Vec<(String, Tag)>,
    pub dependencies: Vec<(String, String)>,
    // attributes handed out with the handle at construction time
    pub attributes: BTreeMap<String, BTreeMap<Rc<str>, Value>>,
    // attributes that only materialize after construction
    pub late_attributes: BTreeMap<(String, String), Value>,
    pub imports: BTreeMap<String, Value>,
}

impl TestFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_attribute(mut self, logical_id: &str, attribute: &str, value: Value) -> Self {
        self.attributes
            .entry(logical_id.to_string())
            .or_default()
            .insert(attribute.into(), value);
        self
    }

    pub fn with_late_attribute(mut self, logical_id: &str, attribute: &str, value: Value) -> Self {
        self.late_attributes
            .insert((logical_id.to_string(), attribute.to_string()), value);
        self
    }

    pub fn with_import(mut self, name: &str, value: Value) -> Self {
        self.imports.insert(name.to_string(), value);
        self
    }

    pub fn instantiation_order(&self) -> Vec<&str> {
        self.instantiated
            .iter()
            .map(|(_, id, _)| id.as_str())
            .collect()
    }
}

impl ConstructFactory for TestFactory {
    fn instantiate(
        &mut self,
        fqn: &str,
        logical_id: &str,
        args: Vec<Value>,
    ) -> Result<ConstructHandle> {
        self.instantiated
            .push((fqn.to_string(), logical_id.to_string(), args));
        Ok(ConstructHandle {
            primary: Value::from(format!("ref:{logical_id}")),
            attributes: self
                .attributes
                .get(logical_id)
                .cloned()
                .unwrap_or_default(),
        })
    }

    fn invoke(
        &mut self,
        fqn: &str,
        method: &str,
        target: &str,
        args: Vec<Value>,
    ) -> Result<ConstructHandle> {
        self.invoked.push((
            fqn.to_string(),
            method.to_string(),
            target.to_string(),
            args,
        ));
        Ok(ConstructHandle {
            primary: Value::from(format!("call:{target}.{method}")),
            attributes: BTreeMap::new(),
        })
    }

    fn create(&mut self, fqn: &str, args: Vec<Value>) -> Result<Value> {
        let mut fields = IndexMap::new();
        fields.insert("new".into(), Value::from(fqn));
        fields.insert("args".into(), Value::from(args));
        Ok(Value::from(fields))
    }

    fn invoke_static(&mut self, fqn: &str, method: &str, args: Vec<Value>) -> Result<Value> {
        let mut fields = IndexMap::new();
        fields.insert("call".into(), Value::from(format!("{fqn}.{method}")));
        fields.insert("args".into(), Value::from(args));
        Ok(Value::from(fields))
    }

    fn static_property(&mut self, fqn: &str, property: &str) -> Result<Value> {
        Ok(Value::from(format!("{fqn}.{property}")))
    }

    fn apply_override(&mut self, logical_id: &str, patch: &Override) -> Result<()> {
        self.overrides.push((logical_id.to_string(), patch.clone()));
        Ok(())
    }

    fn apply_tag(&mut self, logical_id: &str, tag: &Tag) -> Result<()> {
        self.tags.push((logical_id.to_string(), tag.clone()));
        Ok(())
    }

    fn add_dependency(&mut self, from: &str, to: &str) -> Result<()> {
        self.dependencies.push((from.to_string(), to.to_string()));
        Ok(())
    }

    fn import_value(&mut self, name: &str) -> Result<Value> {
        match self.imports.get(name) {
            Some(v) => Ok(v.clone()),
            None => bail!("unknown import `{name}`"),
        }
    }

    fn resolve_attribute(&self, logical_id: &str, attribute: &str) -> Result<Value> {
        match self
            .late_attributes
            .get(&(logical_id.to_string(), attribute.to_string()))
        {
            Some(v) => Ok(v.clone()),
            None => bail!("attribute `{attribute}` of `{logical_id}` never materialized"),
        }
    }
}
