// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

/// The resolver narrows template expressions against an externally
/// supplied, reflected description of the available types. That
/// description arrives as a JSON document listing every type in the
/// universe:
///
/// ```json
/// {
///   "types": [
///     { "kind": "enum", "fqn": "acme.Color", "members": ["RED", "BLUE"] },
///     {
///       "kind": "struct",
///       "fqn": "acme.BucketProps",
///       "properties": [
///         { "name": "bucketName", "type": { "primitive": "string" } },
///         { "name": "versioned", "type": { "primitive": "boolean" }, "optional": true }
///       ]
///     },
///     {
///       "kind": "class",
///       "fqn": "acme.Bucket",
///       "construct": true,
///       "interfaces": ["acme.IBucket"],
///       "initializer": {
///         "name": "<init>",
///         "parameters": [
///           { "name": "props", "type": { "fqn": "acme.BucketProps" }, "optional": true }
///         ]
///       },
///       "methods": [
///         {
///           "name": "grantRead",
///           "parameters": [{ "name": "grantee", "type": { "fqn": "acme.IGrantable" } }]
///         }
///       ]
///     },
///     { "kind": "interface", "fqn": "acme.IBucket" }
///   ]
/// }
/// ```
///
/// Shape references inside the document discriminate on which key is
/// present, the same way the template dialect discriminates intrinsics:
///
/// - `{ "primitive": "string" }` — `string`, `number`, `boolean`,
///   `json`, `any` or `void`.
/// - `{ "fqn": "acme.Bucket" }` — a named type declared elsewhere in
///   the document.
/// - `{ "listOf": { ... } }` / `{ "mapOf": { ... } }` — homogeneous
///   collections.
/// - `{ "union": [ ... ] }` — any of the member shapes, tried in
///   declaration order.
///
/// The document is validated eagerly at load: duplicate fully qualified
/// names, references to undeclared types, and malformed shapes are
/// reported then, not at resolution time. Once loaded, the type system
/// is immutable and read-only for the duration of a run.
use core::fmt;
use std::collections::BTreeSet;

use std::rc::Rc;

use anyhow::{bail, Result};
use indexmap::IndexMap;
use serde::{Deserialize, Deserializer};

type String = Rc<str>;

/// A primitive shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Primitive {
    String,
    Number,
    Boolean,
    /// Arbitrary data, preserved without narrowing but still parsed.
    Json,
    /// Arbitrary data, preserved without narrowing.
    Any,
    /// Accepts only null. The implicit return shape of methods that
    /// return nothing.
    Void,
}

impl fmt::Display for Primitive {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Primitive::String => "string",
            Primitive::Number => "number",
            Primitive::Boolean => "boolean",
            Primitive::Json => "json",
            Primitive::Any => "any",
            Primitive::Void => "void",
        };
        write!(f, "{s}")
    }
}

/// A reference to a shape: either a primitive, a named type declared in
/// the document, a collection, or a union of shapes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TypeRef {
    Primitive(Primitive),
    Named(String),
    List(Rc<TypeRef>),
    Map(Rc<TypeRef>),
    Union(Rc<Vec<TypeRef>>),
}

impl fmt::Display for TypeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TypeRef::Primitive(p) => write!(f, "{p}"),
            TypeRef::Named(fqn) => write!(f, "{fqn}"),
            TypeRef::List(t) => write!(f, "list<{t}>"),
            TypeRef::Map(t) => write!(f, "map<{t}>"),
            TypeRef::Union(members) => {
                let parts: Vec<std::string::String> =
                    members.iter().map(|m| m.to_string()).collect();
                write!(f, "union<{}>", parts.join(" | "))
            }
        }
    }
}

impl<'de> Deserialize<'de> for TypeRef {
    /// Discriminates on which key is present: `primitive`, `fqn`,
    /// `listOf`, `mapOf` or `union`. Exactly one must appear.
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        use serde::de::Error;

        let v: serde_json::Value = Deserialize::deserialize(deserializer)?;
        let Some(obj) = v.as_object() else {
            return Err(D::Error::custom(format!("expecting a shape object, got {v}")));
        };
        if obj.len() != 1 {
            return Err(D::Error::custom(
                "a shape object must have exactly one of `primitive`, `fqn`, `listOf`, `mapOf`, `union`",
            ));
        }

        if let Some(p) = obj.get("primitive") {
            let p: Primitive =
                Deserialize::deserialize(p).map_err(|e| D::Error::custom(format!("{e}")))?;
            return Ok(TypeRef::Primitive(p));
        }
        if let Some(fqn) = obj.get("fqn") {
            let fqn: String =
                Deserialize::deserialize(fqn).map_err(|e| D::Error::custom(format!("{e}")))?;
            return Ok(TypeRef::Named(fqn));
        }
        if let Some(t) = obj.get("listOf") {
            let t: TypeRef =
                Deserialize::deserialize(t).map_err(|e| D::Error::custom(format!("{e}")))?;
            return Ok(TypeRef::List(Rc::new(t)));
        }
        if let Some(t) = obj.get("mapOf") {
            let t: TypeRef =
                Deserialize::deserialize(t).map_err(|e| D::Error::custom(format!("{e}")))?;
            return Ok(TypeRef::Map(Rc::new(t)));
        }
        if let Some(members) = obj.get("union") {
            let members: Vec<TypeRef> =
                Deserialize::deserialize(members).map_err(|e| D::Error::custom(format!("{e}")))?;
            if members.is_empty() {
                return Err(D::Error::custom("a union must have at least one member"));
            }
            return Ok(TypeRef::Union(Rc::new(members)));
        }
        Err(D::Error::custom(format!(
            "unknown shape object: {v}; expecting one of `primitive`, `fqn`, `listOf`, `mapOf`, `union`"
        )))
    }
}

/// A named, typed, possibly-optional slot. Used both for struct
/// properties and for callable parameters; the two have identical
/// shapes in the reflection document.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Property {
    pub name: String,
    #[serde(rename = "type")]
    pub type_ref: TypeRef,
    #[serde(default)]
    pub optional: bool,
}

/// An initializer, method, or static factory method.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Callable {
    pub name: String,
    #[serde(default)]
    pub parameters: Rc<Vec<Property>>,
    #[serde(default)]
    pub returns: Option<TypeRef>,
    #[serde(default)]
    pub r#static: bool,
}

/// One reflected type declaration.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "kind")]
#[serde(rename_all = "camelCase")]
pub enum TypeInfo {
    /// A closed set of named choices.
    Enum {
        fqn: String,
        members: Rc<Vec<String>>,
    },

    /// A named bag of possibly-optional properties, passed by value.
    Struct {
        fqn: String,
        properties: Rc<Vec<Property>>,
    },

    /// A constructible class. Classes without an initializer whose only
    /// public surface is static members act as open enums ("enum-like").
    /// Classes with `construct: true` are entity types: instances
    /// become nodes of the output artifact.
    #[serde(rename_all = "camelCase")]
    Class {
        fqn: String,
        #[serde(default)]
        initializer: Option<Callable>,
        #[serde(default)]
        methods: Rc<Vec<Callable>>,
        #[serde(default)]
        static_properties: Rc<Vec<Property>>,
        #[serde(default)]
        base: Option<String>,
        #[serde(default)]
        interfaces: Rc<Vec<String>>,
        #[serde(default)]
        construct: bool,
    },

    /// A behavioral interface: an open set of implementing classes,
    /// enumerable through [`TypeSystem::implementations_of`].
    Interface {
        fqn: String,
        #[serde(default)]
        extends: Rc<Vec<String>>,
    },
}

impl TypeInfo {
    pub fn fqn(&self) -> &String {
        match self {
            TypeInfo::Enum { fqn, .. }
            | TypeInfo::Struct { fqn, .. }
            | TypeInfo::Class { fqn, .. }
            | TypeInfo::Interface { fqn, .. } => fqn,
        }
    }

    pub const fn kind(&self) -> &'static str {
        match self {
            TypeInfo::Enum { .. } => "enum",
            TypeInfo::Struct { .. } => "struct",
            TypeInfo::Class { .. } => "class",
            TypeInfo::Interface { .. } => "interface",
        }
    }

    /// A class whose only public surface is static factory members.
    pub fn is_enum_like(&self) -> bool {
        match self {
            TypeInfo::Class {
                initializer,
                methods,
                static_properties,
                ..
            } => {
                initializer.is_none()
                    && (!static_properties.is_empty() || methods.iter().any(|m| m.r#static))
            }
            _ => false,
        }
    }

    /// Static factory methods of an enum-like class.
    pub fn static_methods(&self) -> impl Iterator<Item = &Callable> {
        let methods = match self {
            TypeInfo::Class { methods, .. } => Some(methods.iter()),
            _ => None,
        };
        methods.into_iter().flatten().filter(|m| m.r#static)
    }

    /// Instance method lookup by name, not following the base chain.
    pub fn method(&self, name: &str) -> Option<&Callable> {
        match self {
            TypeInfo::Class { methods, .. } => methods
                .iter()
                .find(|m| !m.r#static && m.name.as_ref() == name),
            _ => None,
        }
    }
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct Document {
    types: Vec<TypeInfo>,
}

/// The schema provider: an immutable universe of reflected types,
/// loaded once and queried repeatedly during resolution. Derived
/// lookups (implementation tables, construct classification) are
/// precomputed at load time.
#[derive(Debug, Clone, Default)]
pub struct TypeSystem {
    types: IndexMap<String, Rc<TypeInfo>>,
    // target fqn (class or interface) -> constructible classes
    // assignable to it, in declaration order.
    implementations: IndexMap<String, Vec<String>>,
}

impl TypeSystem {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a reflection document. Performs eager validation so that a
    /// bad document is reported at load, not at first use.
    pub fn from_serde_json_value(v: serde_json::Value) -> Result<Self> {
        let doc: Document = match serde_json::from_value(v) {
            Ok(doc) => doc,
            Err(e) => bail!("failed to parse type document: {e}"),
        };
        let mut types = IndexMap::with_capacity(doc.types.len());
        for info in doc.types {
            let fqn = info.fqn().clone();
            if types.insert(fqn.clone(), Rc::new(info)).is_some() {
                bail!("duplicate type `{fqn}` in type document");
            }
        }
        let mut system = TypeSystem {
            types,
            implementations: IndexMap::new(),
        };
        system.link()?;
        Ok(system)
    }

    pub fn from_json_str(s: &str) -> Result<Self> {
        let v: serde_json::Value = match serde_json::from_str(s) {
            Ok(v) => v,
            Err(e) => bail!("failed to parse type document: {e}"),
        };
        Self::from_serde_json_value(v)
    }

    // Check cross-references and build the implementations table.
    fn link(&mut self) -> Result<()> {
        for info in self.types.values() {
            let mut named = BTreeSet::new();
            collect_named_refs(info, &mut named);
            for fqn in named {
                if !self.types.contains_key(&fqn) {
                    bail!(
                        "type `{}` refers to undeclared type `{fqn}`",
                        info.fqn()
                    );
                }
            }
            if let TypeInfo::Class {
                base, interfaces, ..
            } = info.as_ref()
            {
                if let Some(base) = base {
                    match self.types.get(base).map(|t| t.as_ref()) {
                        Some(TypeInfo::Class { .. }) => {}
                        Some(other) => bail!(
                            "type `{}` extends `{base}` which is a {}, not a class",
                            info.fqn(),
                            other.kind()
                        ),
                        None => bail!("type `{}` extends undeclared type `{base}`", info.fqn()),
                    }
                }
                for iface in interfaces.iter() {
                    if !matches!(
                        self.types.get(iface).map(|t| t.as_ref()),
                        Some(TypeInfo::Interface { .. })
                    ) {
                        bail!(
                            "type `{}` implements `{iface}` which is not an interface",
                            info.fqn()
                        );
                    }
                }
            }
        }

        let mut implementations: IndexMap<String, Vec<String>> = IndexMap::new();
        for (fqn, info) in self.types.iter() {
            let constructible = matches!(
                info.as_ref(),
                TypeInfo::Class {
                    initializer: Some(_),
                    ..
                }
            );
            if !constructible {
                continue;
            }
            for target in self.supertypes_of(fqn) {
                implementations.entry(target).or_default().push(fqn.clone());
            }
        }
        self.implementations = implementations;
        Ok(())
    }

    // The fqn itself, its base chain, and every interface reachable
    // from either (following interface extension).
    fn supertypes_of(&self, fqn: &str) -> BTreeSet<String> {
        let mut out = BTreeSet::new();
        let mut pending: Vec<String> = vec![fqn.into()];
        while let Some(next) = pending.pop() {
            if !out.insert(next.clone()) {
                continue;
            }
            match self.types.get(&next).map(|t| t.as_ref()) {
                Some(TypeInfo::Class {
                    base, interfaces, ..
                }) => {
                    if let Some(base) = base {
                        pending.push(base.clone());
                    }
                    pending.extend(interfaces.iter().cloned());
                }
                Some(TypeInfo::Interface { extends, .. }) => {
                    pending.extend(extends.iter().cloned());
                }
                _ => {}
            }
        }
        out
    }

    /// Look up a type by fully qualified name.
    pub fn find_type(&self, fqn: &str) -> Result<&TypeInfo> {
        match self.types.get(fqn) {
            Some(info) => Ok(info),
            None => bail!("unknown type `{fqn}`"),
        }
    }

    pub fn get(&self, fqn: &str) -> Option<&TypeInfo> {
        self.types.get(fqn).map(|t| t.as_ref())
    }

    pub fn contains(&self, fqn: &str) -> bool {
        self.types.contains_key(fqn)
    }

    /// Constructible classes assignable to the given class or
    /// interface, in declaration order. This is the closed
    /// implementation table behind polymorphic resolution.
    pub fn implementations_of(&self, fqn: &str) -> &[String] {
        self.implementations
            .get(fqn)
            .map(|v| v.as_slice())
            .unwrap_or(&[])
    }

    /// True if a value of type `sub` can stand where `target` is
    /// expected: same type, a base class, or an implemented interface.
    pub fn is_assignable(&self, sub: &str, target: &str) -> bool {
        sub == target || self.supertypes_of(sub).contains(target)
    }

    /// True if the named type is an entity type: instances become
    /// nodes of the output artifact.
    pub fn is_construct(&self, fqn: &str) -> bool {
        let mut current: Option<&str> = Some(fqn);
        while let Some(next) = current {
            match self.types.get(next).map(|t| t.as_ref()) {
                Some(TypeInfo::Class {
                    construct, base, ..
                }) => {
                    if *construct {
                        return true;
                    }
                    current = base.as_ref().map(|b| b.as_ref());
                }
                _ => return false,
            }
        }
        false
    }

    /// The initializer of a class, following the base chain if the
    /// class itself does not declare one.
    pub fn initializer_of(&self, fqn: &str) -> Option<&Callable> {
        let mut current: Option<&str> = Some(fqn);
        while let Some(next) = current {
            match self.types.get(next).map(|t| t.as_ref()) {
                Some(TypeInfo::Class {
                    initializer, base, ..
                }) => match initializer {
                    Some(init) => return Some(init),
                    None => current = base.as_ref().map(|b| b.as_ref()),
                },
                _ => return None,
            }
        }
        None
    }

    /// Instance method lookup by name, following the base chain.
    pub fn method_of(&self, fqn: &str, name: &str) -> Option<&Callable> {
        let mut current: Option<&str> = Some(fqn);
        while let Some(next) = current {
            let info = self.types.get(next).map(|t| t.as_ref())?;
            if let Some(m) = info.method(name) {
                return Some(m);
            }
            match info {
                TypeInfo::Class { base, .. } => current = base.as_ref().map(|b| b.as_ref()),
                _ => return None,
            }
        }
        None
    }
}

fn collect_named_refs(info: &TypeInfo, out: &mut BTreeSet<String>) {
    fn walk(t: &TypeRef, out: &mut BTreeSet<String>) {
        match t {
            TypeRef::Primitive(_) => {}
            TypeRef::Named(fqn) => {
                out.insert(fqn.clone());
            }
            TypeRef::List(t) | TypeRef::Map(t) => walk(t, out),
            TypeRef::Union(members) => {
                for m in members.iter() {
                    walk(m, out);
                }
            }
        }
    }
    fn walk_callable(c: &Callable, out: &mut BTreeSet<String>) {
        for p in c.parameters.iter() {
            walk(&p.type_ref, out);
        }
        if let Some(ret) = &c.returns {
            walk(ret, out);
        }
    }
    match info {
        TypeInfo::Enum { .. } => {}
        TypeInfo::Struct { properties, .. } => {
            for p in properties.iter() {
                walk(&p.type_ref, out);
            }
        }
        TypeInfo::Class {
            initializer,
            methods,
            static_properties,
            base,
            interfaces,
            ..
        } => {
            if let Some(init) = initializer {
                walk_callable(init, out);
            }
            for m in methods.iter() {
                walk_callable(m, out);
            }
            for p in static_properties.iter() {
                walk(&p.type_ref, out);
            }
            if let Some(base) = base {
                out.insert(base.clone());
            }
            for iface in interfaces.iter() {
                out.insert(iface.clone());
            }
        }
        TypeInfo::Interface { extends, .. } => {
            for e in extends.iter() {
                out.insert(e.clone());
            }
        }
    }
}
