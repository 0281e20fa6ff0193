// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use crate::expr::{Expr, Intrinsic};
use crate::number::Number;
use crate::schema::{Callable, Primitive, Property, TypeInfo, TypeRef, TypeSystem};

use std::collections::BTreeMap;
use std::rc::Rc;

use indexmap::IndexMap;
use thiserror::Error;

fn join_member_errors(errors: &[ValidationError]) -> String {
    errors
        .iter()
        .map(|e| format!("\n  - {e}"))
        .collect::<Vec<_>>()
        .join("")
}

/// An expression could not be reconciled with a type descriptor. These
/// are expected user errors, distinct from programmer-error panics;
/// they are recoverable only inside union resolution, where failure of
/// one member is retried against the next.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("{path}: expected {expected}, got {actual}")]
    TypeMismatch {
        path: String,
        expected: String,
        actual: String,
    },

    #[error("{path}: missing required property `{property}` of {fqn}")]
    MissingRequiredProperty {
        path: String,
        fqn: String,
        property: String,
    },

    #[error("{path}: required property `{property}` of {fqn} must not be null")]
    NullRequiredProperty {
        path: String,
        fqn: String,
        property: String,
    },

    #[error("{path}: unknown property `{property}`; {fqn} declares [{declared}]")]
    UnknownProperty {
        path: String,
        fqn: String,
        property: String,
        declared: String,
    },

    #[error("{path}: `{choice}` is not a valid choice for {fqn}; allowed choices: [{choices}]")]
    UnknownEnumChoice {
        path: String,
        fqn: String,
        choice: String,
        choices: String,
    },

    #[error("{path}: `{member}` is not a static member of {fqn}; available: [{members}]")]
    UnknownStaticMember {
        path: String,
        fqn: String,
        member: String,
        members: String,
    },

    #[error("{path}: `{key}` does not name an implementation of {fqn}; known implementations: [{candidates}]")]
    UnknownImplementation {
        path: String,
        fqn: String,
        key: String,
        candidates: String,
    },

    #[error("{path}: missing required argument `{parameter}` of `{callable}`")]
    MissingArgument {
        path: String,
        callable: String,
        parameter: String,
    },

    #[error("{path}: unknown argument `{argument}`; `{callable}` takes [{parameters}]")]
    UnknownArgument {
        path: String,
        callable: String,
        argument: String,
        parameters: String,
    },

    #[error("{path}: unknown entity `{logical_id}`")]
    UnknownEntity { path: String, logical_id: String },

    #[error("{path}: entity `{logical_id}` has type {actual}, which is not assignable to {expected}")]
    NotAssignable {
        path: String,
        logical_id: String,
        actual: String,
        expected: String,
    },

    #[error("{path}: unknown type `{fqn}`")]
    UnknownType { path: String, fqn: String },

    /// Every union member rejected the expression. Carries one error
    /// per member, in member-declaration order.
    #[error("{path}: value does not match any member of the union:{}", join_member_errors(.errors))]
    NoUnionMatch {
        path: String,
        errors: Vec<ValidationError>,
    },
}

/// An expression after it has been committed to exactly one concrete
/// interpretation per node. Never mutated after creation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TypedExpr {
    Null,
    Bool(bool),
    Number(Number),
    String(Rc<str>),
    Array(Vec<TypedExpr>),
    Map(IndexMap<Rc<str>, TypedExpr>),
    Struct {
        fqn: Rc<str>,
        fields: IndexMap<Rc<str>, TypedExpr>,
    },
    EnumChoice {
        fqn: Rc<str>,
        choice: Rc<str>,
    },
    StaticProperty {
        fqn: Rc<str>,
        property: Rc<str>,
    },
    StaticMethodCall {
        fqn: Rc<str>,
        method: Rc<str>,
        args: Vec<TypedExpr>,
    },
    InitializerCall {
        fqn: Rc<str>,
        args: Vec<TypedExpr>,
    },
    /// A reference or attribute lookup against a declared entity.
    ConstructRef(Intrinsic),
    /// An intrinsic in a primitive or collection position; computed and
    /// type-checked at evaluation time.
    Intrinsic(Intrinsic),
    /// Raw structure preserved without narrowing (`json`/`any`).
    Any(Expr),
    /// Nothing: an absent optional argument or a `void` position.
    Void,
}

/// Narrows expressions against type descriptors. Holds the schema
/// provider and the declared type of every entity in the template, the
/// latter for construct-reference assignability checks.
pub struct Resolver<'a> {
    schema: &'a TypeSystem,
    entities: BTreeMap<Rc<str>, Rc<str>>,
}

impl<'a> Resolver<'a> {
    pub fn new(schema: &'a TypeSystem) -> Self {
        Self {
            schema,
            entities: BTreeMap::new(),
        }
    }

    /// A resolver that knows the declared type of each entity, keyed by
    /// logical id.
    pub fn with_entities(schema: &'a TypeSystem, entities: BTreeMap<Rc<str>, Rc<str>>) -> Self {
        Self { schema, entities }
    }

    /// Narrow `expr` to exactly one typed interpretation of `wanted`.
    ///
    /// Dispatch order is a deliberate, tested policy; first match wins:
    /// construct references, then collections, then unions, then named
    /// types (enum / struct / enum-like class / implementation lookup),
    /// and only then the unconditional primitive and `any` fallbacks.
    pub fn resolve(
        &self,
        expr: &Expr,
        wanted: &TypeRef,
        path: &str,
    ) -> Result<TypedExpr, ValidationError> {
        // 1. References and attribute lookups satisfy descriptors that
        // name an entity type.
        if let Expr::Intrinsic(intrinsic) = expr {
            if matches!(intrinsic, Intrinsic::Ref { .. } | Intrinsic::GetAtt { .. }) {
                if let TypeRef::Named(fqn) = wanted {
                    if self.names_entity(fqn) {
                        return self.resolve_construct_ref(intrinsic, fqn, path);
                    }
                }
            }
        }

        match wanted {
            // 2. Arrays resolve element-wise.
            TypeRef::List(item) => match expr {
                Expr::Array(items) => {
                    let mut out = Vec::with_capacity(items.len());
                    for (i, element) in items.iter().enumerate() {
                        out.push(self.resolve(element, item, &format!("{path}[{i}]"))?);
                    }
                    Ok(TypedExpr::Array(out))
                }
                Expr::Intrinsic(intrinsic) => Ok(TypedExpr::Intrinsic(intrinsic.clone())),
                _ => Err(self.mismatch(path, wanted, expr)),
            },

            // 3. Maps resolve per-key.
            TypeRef::Map(item) => match expr {
                Expr::Object(fields) => {
                    let mut out = IndexMap::with_capacity(fields.len());
                    for (key, value) in fields.iter() {
                        let resolved = self.resolve(value, item, &format!("{path}.{key}"))?;
                        out.insert(key.clone(), resolved);
                    }
                    Ok(TypedExpr::Map(out))
                }
                Expr::Intrinsic(intrinsic) => Ok(TypedExpr::Intrinsic(intrinsic.clone())),
                _ => Err(self.mismatch(path, wanted, expr)),
            },

            // 4. Unions keep the first member that accepts; total
            // failure reports every attempted interpretation, not just
            // the last.
            TypeRef::Union(members) => {
                let mut errors = Vec::with_capacity(members.len());
                for member in members.iter() {
                    match self.resolve(expr, member, path) {
                        Ok(resolved) => return Ok(resolved),
                        Err(e) => errors.push(e),
                    }
                }
                Err(ValidationError::NoUnionMatch {
                    path: path.to_string(),
                    errors,
                })
            }

            TypeRef::Named(fqn) => self.resolve_named(expr, fqn, path),

            // 9. Primitive passthrough; `any`/`json` wrap without
            // narrowing.
            TypeRef::Primitive(p) => self.resolve_primitive(expr, *p, path),
        }
    }

    fn resolve_named(
        &self,
        expr: &Expr,
        fqn: &Rc<str>,
        path: &str,
    ) -> Result<TypedExpr, ValidationError> {
        let Some(info) = self.schema.get(fqn) else {
            return Err(ValidationError::UnknownType {
                path: path.to_string(),
                fqn: fqn.to_string(),
            });
        };

        match info {
            // 5. Enum choices match case-insensitively: the choice is
            // upper-cased before lookup.
            TypeInfo::Enum { fqn, members } => match expr {
                Expr::String(choice) => {
                    let upper = choice.to_uppercase();
                    for member in members.iter() {
                        if member.to_uppercase() == upper {
                            return Ok(TypedExpr::EnumChoice {
                                fqn: fqn.clone(),
                                choice: member.clone(),
                            });
                        }
                    }
                    Err(ValidationError::UnknownEnumChoice {
                        path: path.to_string(),
                        fqn: fqn.to_string(),
                        choice: choice.to_string(),
                        choices: join_names(members.iter()),
                    })
                }
                _ => Err(self.mismatch(path, &TypeRef::Named(fqn.clone()), expr)),
            },

            // 6. Structs resolve each declared property by name.
            TypeInfo::Struct { fqn, properties } => match expr {
                Expr::Object(fields) => self.resolve_struct(fqn, properties, fields, path),
                _ => Err(self.mismatch(path, &TypeRef::Named(fqn.clone()), expr)),
            },

            // 7. Enum-like classes select a static member by string, or
            // call a static factory method via a single-key object.
            TypeInfo::Class { .. } if info.is_enum_like() => self.resolve_enum_like(expr, info, path),

            // 8. Classes and behavioral interfaces accept a single-key
            // object naming one known implementation: a table lookup
            // over the closed implementation set, not late binding.
            TypeInfo::Class { .. } | TypeInfo::Interface { .. } => {
                self.resolve_implementation(expr, fqn, path)
            }
        }
    }

    fn resolve_struct(
        &self,
        fqn: &Rc<str>,
        properties: &[Property],
        fields: &IndexMap<Rc<str>, Expr>,
        path: &str,
    ) -> Result<TypedExpr, ValidationError> {
        let mut out = IndexMap::with_capacity(properties.len());
        for property in properties {
            let field_path = format!("{path}.{}", property.name);
            match fields.get(&property.name) {
                // A present-but-null optional property is treated as
                // absent; a required one is an error.
                Some(Expr::Null) => {
                    if !property.optional {
                        return Err(ValidationError::NullRequiredProperty {
                            path: path.to_string(),
                            fqn: fqn.to_string(),
                            property: property.name.to_string(),
                        });
                    }
                }
                Some(value) => {
                    let resolved = self.resolve(value, &property.type_ref, &field_path)?;
                    out.insert(property.name.clone(), resolved);
                }
                None if property.optional => {}
                None => {
                    return Err(ValidationError::MissingRequiredProperty {
                        path: path.to_string(),
                        fqn: fqn.to_string(),
                        property: property.name.to_string(),
                    });
                }
            }
        }
        for key in fields.keys() {
            if !properties.iter().any(|p| &p.name == key) {
                return Err(ValidationError::UnknownProperty {
                    path: path.to_string(),
                    fqn: fqn.to_string(),
                    property: key.to_string(),
                    declared: join_names(properties.iter().map(|p| &p.name)),
                });
            }
        }
        Ok(TypedExpr::Struct {
            fqn: fqn.clone(),
            fields: out,
        })
    }

    fn resolve_enum_like(
        &self,
        expr: &Expr,
        info: &TypeInfo,
        path: &str,
    ) -> Result<TypedExpr, ValidationError> {
        let TypeInfo::Class {
            fqn,
            static_properties,
            ..
        } = info
        else {
            return Err(self.mismatch_named(path, info.fqn(), expr));
        };

        match expr {
            // Static property selection, matched like an enum choice.
            Expr::String(member) => {
                let upper = member.to_uppercase();
                for property in static_properties.iter() {
                    if property.name.to_uppercase() == upper {
                        return Ok(TypedExpr::StaticProperty {
                            fqn: fqn.clone(),
                            property: property.name.clone(),
                        });
                    }
                }
                Err(ValidationError::UnknownStaticMember {
                    path: path.to_string(),
                    fqn: fqn.to_string(),
                    member: member.to_string(),
                    members: self.static_member_names(info),
                })
            }

            // Single-key object: the key names a static factory method,
            // the value supplies keyword-style arguments.
            Expr::Object(fields) if fields.len() == 1 => {
                let Some((method_name, args)) = fields.iter().next() else {
                    return Err(self.mismatch_named(path, fqn, expr));
                };
                let Some(method) = info.static_methods().find(|m| &m.name == method_name) else {
                    return Err(ValidationError::UnknownStaticMember {
                        path: path.to_string(),
                        fqn: fqn.to_string(),
                        member: method_name.to_string(),
                        members: self.static_member_names(info),
                    });
                };
                let call_path = format!("{path}.{method_name}");
                let args = self.resolve_arguments(method, args, &call_path)?;
                Ok(TypedExpr::StaticMethodCall {
                    fqn: fqn.clone(),
                    method: method.name.clone(),
                    args,
                })
            }

            _ => Err(self.mismatch_named(path, fqn, expr)),
        }
    }

    fn resolve_implementation(
        &self,
        expr: &Expr,
        fqn: &Rc<str>,
        path: &str,
    ) -> Result<TypedExpr, ValidationError> {
        let candidates = self.schema.implementations_of(fqn);
        match expr {
            Expr::Object(fields) if fields.len() == 1 => {
                let Some((key, args)) = fields.iter().next() else {
                    return Err(self.mismatch_named(path, fqn, expr));
                };
                let initializer = match candidates.contains(key) {
                    true => self.schema.initializer_of(key),
                    false => None,
                };
                let Some(initializer) = initializer else {
                    return Err(ValidationError::UnknownImplementation {
                        path: path.to_string(),
                        fqn: fqn.to_string(),
                        key: key.to_string(),
                        candidates: join_names(candidates.iter()),
                    });
                };
                let call_path = format!("{path}.{key}");
                let args = self.resolve_arguments(initializer, args, &call_path)?;
                Ok(TypedExpr::InitializerCall {
                    fqn: key.clone(),
                    args,
                })
            }
            _ => Err(self.mismatch_named(path, fqn, expr)),
        }
    }

    /// Bind keyword-style arguments to a callable's parameters.
    ///
    /// Parameters bind to same-named fields. If the final parameter's
    /// own type is a named struct and no field carries its name, the
    /// entire remaining object is resolved as that struct instead of
    /// requiring one more level of nesting (kwargs flattening). The
    /// schema promises that no earlier parameter shares a name with a
    /// flattened struct property.
    pub fn resolve_arguments(
        &self,
        callable: &Callable,
        args: &Expr,
        path: &str,
    ) -> Result<Vec<TypedExpr>, ValidationError> {
        let fields = match args {
            Expr::Object(fields) => fields,
            _ => {
                return Err(ValidationError::TypeMismatch {
                    path: path.to_string(),
                    expected: format!("keyword arguments for `{}`", callable.name),
                    actual: args.kind().to_string(),
                })
            }
        };

        let mut out = Vec::with_capacity(callable.parameters.len());
        let mut consumed: Vec<&Rc<str>> = vec![];
        let last = callable.parameters.len().checked_sub(1);

        for (i, parameter) in callable.parameters.iter().enumerate() {
            if let Some(value) = fields.get(&parameter.name) {
                let arg_path = format!("{path}.{}", parameter.name);
                out.push(self.resolve(value, &parameter.type_ref, &arg_path)?);
                consumed.push(&parameter.name);
                continue;
            }

            // kwargs flattening for a trailing struct parameter.
            if Some(i) == last {
                if let TypeRef::Named(struct_fqn) = &parameter.type_ref {
                    if let Some(TypeInfo::Struct { fqn, properties }) = self.schema.get(struct_fqn)
                    {
                        let remaining: IndexMap<Rc<str>, Expr> = fields
                            .iter()
                            .filter(|(k, _)| !consumed.contains(k))
                            .map(|(k, v)| (k.clone(), v.clone()))
                            .collect();
                        if !remaining.is_empty() || !parameter.optional {
                            out.push(self.resolve_struct(fqn, properties, &remaining, path)?);
                            return Ok(out);
                        }
                    }
                }
            }

            if parameter.optional {
                out.push(TypedExpr::Void);
                continue;
            }
            return Err(ValidationError::MissingArgument {
                path: path.to_string(),
                callable: callable.name.to_string(),
                parameter: parameter.name.to_string(),
            });
        }

        for key in fields.keys() {
            if !consumed.contains(&key) {
                return Err(ValidationError::UnknownArgument {
                    path: path.to_string(),
                    callable: callable.name.to_string(),
                    argument: key.to_string(),
                    parameters: join_names(callable.parameters.iter().map(|p| &p.name)),
                });
            }
        }
        Ok(out)
    }

    fn resolve_primitive(
        &self,
        expr: &Expr,
        wanted: Primitive,
        path: &str,
    ) -> Result<TypedExpr, ValidationError> {
        match (wanted, expr) {
            (Primitive::Json | Primitive::Any, _) => Ok(TypedExpr::Any(expr.clone())),
            (Primitive::String, Expr::String(s)) => Ok(TypedExpr::String(s.clone())),
            (Primitive::Number, Expr::Number(n)) => Ok(TypedExpr::Number(*n)),
            (Primitive::Boolean, Expr::Bool(b)) => Ok(TypedExpr::Bool(*b)),
            (Primitive::Void, Expr::Null) => Ok(TypedExpr::Void),
            // Intrinsics in primitive positions are computed at
            // evaluation time; the produced value is checked then.
            (_, Expr::Intrinsic(intrinsic)) => Ok(TypedExpr::Intrinsic(intrinsic.clone())),
            _ => Err(self.mismatch(path, &TypeRef::Primitive(wanted), expr)),
        }
    }

    fn resolve_construct_ref(
        &self,
        intrinsic: &Intrinsic,
        fqn: &Rc<str>,
        path: &str,
    ) -> Result<TypedExpr, ValidationError> {
        let logical_id = match intrinsic {
            Intrinsic::Ref { logical_id } | Intrinsic::GetAtt { logical_id, .. } => logical_id,
            _ => {
                return Err(ValidationError::TypeMismatch {
                    path: path.to_string(),
                    expected: fqn.to_string(),
                    actual: intrinsic.keyword().to_string(),
                })
            }
        };
        let Some(declared) = self.entities.get(logical_id) else {
            return Err(ValidationError::UnknownEntity {
                path: path.to_string(),
                logical_id: logical_id.to_string(),
            });
        };
        // A whole-entity reference must be assignable to the wanted
        // type. Attribute lookups produce values whose types are only
        // known at evaluation time.
        if matches!(intrinsic, Intrinsic::Ref { .. }) && !self.schema.is_assignable(declared, fqn) {
            return Err(ValidationError::NotAssignable {
                path: path.to_string(),
                logical_id: logical_id.to_string(),
                actual: declared.to_string(),
                expected: fqn.to_string(),
            });
        }
        Ok(TypedExpr::ConstructRef(intrinsic.clone()))
    }

    // An entity type: a construct class, or a class/interface some
    // construct is assignable to.
    fn names_entity(&self, fqn: &str) -> bool {
        if self.schema.is_construct(fqn) {
            return true;
        }
        self.schema
            .implementations_of(fqn)
            .iter()
            .any(|c| self.schema.is_construct(c))
    }

    fn static_member_names(&self, info: &TypeInfo) -> String {
        let mut names: Vec<Rc<str>> = match info {
            TypeInfo::Class {
                static_properties, ..
            } => static_properties.iter().map(|p| p.name.clone()).collect(),
            _ => vec![],
        };
        names.extend(info.static_methods().map(|m| m.name.clone()));
        join_names(names.iter())
    }

    fn mismatch(&self, path: &str, wanted: &TypeRef, expr: &Expr) -> ValidationError {
        ValidationError::TypeMismatch {
            path: path.to_string(),
            expected: wanted.to_string(),
            actual: expr.kind().to_string(),
        }
    }

    fn mismatch_named(&self, path: &str, fqn: &Rc<str>, expr: &Expr) -> ValidationError {
        ValidationError::TypeMismatch {
            path: path.to_string(),
            expected: fqn.to_string(),
            actual: expr.kind().to_string(),
        }
    }
}

fn join_names<'n>(names: impl Iterator<Item = &'n Rc<str>>) -> String {
    names.map(|n| n.to_string()).collect::<Vec<_>>().join(", ")
}
