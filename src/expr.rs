// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use crate::number::Number;

use core::fmt;
use std::collections::BTreeSet;
use std::rc::Rc;

use indexmap::IndexMap;

/// One token of an interpolated string. Literal fragments keep the
/// source text verbatim (including `${!...}` escapes and unterminated
/// `${` runs) so that joining the fragments reproduces the original
/// string exactly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fragment {
    Literal(Rc<str>),
    Ref(Rc<str>),
    GetAtt(Rc<str>, Rc<str>),
}

impl fmt::Display for Fragment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Fragment::Literal(s) => write!(f, "{s}"),
            Fragment::Ref(name) => write!(f, "${{{name}}}"),
            Fragment::GetAtt(name, attr) => write!(f, "${{{name}.{attr}}}"),
        }
    }
}

/// Reconstruct the source string of an interpolation fragment list.
pub fn join_fragments(fragments: &[Fragment]) -> String {
    let mut out = String::new();
    for f in fragments {
        out.push_str(&f.to_string());
    }
    out
}

/// The closed set of deferred operations a template may use. Each
/// variant corresponds to one single-key object spelling in the input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Intrinsic {
    Ref {
        logical_id: Rc<str>,
    },
    GetAtt {
        logical_id: Rc<str>,
        attribute: Rc<str>,
        // Written as "id.attr" rather than [id, attr].
        shorthand: bool,
    },
    Sub {
        fragments: Vec<Fragment>,
        substitutions: IndexMap<Rc<str>, Expr>,
    },
    Select {
        index: Box<Expr>,
        list: Box<Expr>,
    },
    Split {
        delimiter: Rc<str>,
        source: Box<Expr>,
    },
    Join {
        delimiter: Rc<str>,
        list: Box<Expr>,
    },
    If {
        condition: Rc<str>,
        then_branch: Box<Expr>,
        else_branch: Box<Expr>,
    },
    And {
        operands: Vec<Expr>,
    },
    Or {
        operands: Vec<Expr>,
    },
    Not {
        operand: Box<Expr>,
    },
    Equals {
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
    ImportValue {
        name: Box<Expr>,
    },
    Base64 {
        source: Box<Expr>,
    },
}

impl Intrinsic {
    /// The operator spelling this intrinsic was parsed from.
    pub const fn keyword(&self) -> &'static str {
        match self {
            Self::Ref { .. } => "Ref",
            Self::GetAtt { .. } => "Fn::GetAtt",
            Self::Sub { .. } => "Fn::Sub",
            Self::Select { .. } => "Fn::Select",
            Self::Split { .. } => "Fn::Split",
            Self::Join { .. } => "Fn::Join",
            Self::If { .. } => "Fn::If",
            Self::And { .. } => "Fn::And",
            Self::Or { .. } => "Fn::Or",
            Self::Not { .. } => "Fn::Not",
            Self::Equals { .. } => "Fn::Equals",
            Self::ImportValue { .. } => "Fn::ImportValue",
            Self::Base64 { .. } => "Fn::Base64",
        }
    }
}

impl fmt::Display for Intrinsic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ref { logical_id } => write!(f, "Ref {logical_id}"),
            Self::GetAtt {
                logical_id,
                attribute,
                shorthand: true,
            } => write!(f, "Fn::GetAtt {logical_id}.{attribute}"),
            Self::GetAtt {
                logical_id,
                attribute,
                ..
            } => write!(f, "Fn::GetAtt [{logical_id}, {attribute}]"),
            Self::Sub { fragments, .. } => {
                write!(f, "Fn::Sub \"{}\"", join_fragments(fragments))
            }
            _ => write!(f, "{}", self.keyword()),
        }
    }
}

/// An expression tree produced once from raw template data. Every node
/// is self-describing: the variant alone determines which fields are
/// legal, nothing is inferred from context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Expr {
    Null,
    Bool(bool),
    Number(Number),
    String(Rc<str>),
    Array(Vec<Expr>),
    Object(IndexMap<Rc<str>, Expr>),
    Intrinsic(Intrinsic),
}

impl Expr {
    pub fn kind(&self) -> &'static str {
        match self {
            Expr::Null => "null",
            Expr::Bool(_) => "boolean",
            Expr::Number(_) => "number",
            Expr::String(_) => "string",
            Expr::Array(_) => "array",
            Expr::Object(_) => "object",
            Expr::Intrinsic(i) => i.keyword(),
        }
    }

    /// Collect the logical ids of every entity this expression refers
    /// to, via reference and attribute-lookup intrinsics at any depth.
    /// Interpolation placeholders shadowed by a local substitution map
    /// are not references to entities.
    pub fn references(&self) -> BTreeSet<Rc<str>> {
        let mut out = BTreeSet::new();
        self.gather_references(&mut out);
        out
    }

    fn gather_references(&self, out: &mut BTreeSet<Rc<str>>) {
        match self {
            Expr::Null | Expr::Bool(_) | Expr::Number(_) | Expr::String(_) => {}
            Expr::Array(items) => {
                for item in items {
                    item.gather_references(out);
                }
            }
            Expr::Object(fields) => {
                for value in fields.values() {
                    value.gather_references(out);
                }
            }
            Expr::Intrinsic(intrinsic) => intrinsic.gather_references(out),
        }
    }
}

impl Intrinsic {
    fn gather_references(&self, out: &mut BTreeSet<Rc<str>>) {
        match self {
            Self::Ref { logical_id } => {
                out.insert(logical_id.clone());
            }
            Self::GetAtt { logical_id, .. } => {
                out.insert(logical_id.clone());
            }
            Self::Sub {
                fragments,
                substitutions,
            } => {
                for fragment in fragments {
                    let name = match fragment {
                        Fragment::Ref(name) | Fragment::GetAtt(name, _) => name,
                        Fragment::Literal(_) => continue,
                    };
                    if !substitutions.contains_key(name) {
                        out.insert(name.clone());
                    }
                }
                for expr in substitutions.values() {
                    expr.gather_references(out);
                }
            }
            Self::Select { index, list } => {
                index.gather_references(out);
                list.gather_references(out);
            }
            Self::Split { source, .. } => source.gather_references(out),
            Self::Join { list, .. } => list.gather_references(out),
            // The condition is a named boolean in the template's
            // conditions section, not an entity. Both branches count as
            // dependencies even though only one will be evaluated.
            Self::If {
                then_branch,
                else_branch,
                ..
            } => {
                then_branch.gather_references(out);
                else_branch.gather_references(out);
            }
            Self::And { operands } | Self::Or { operands } => {
                for op in operands {
                    op.gather_references(out);
                }
            }
            Self::Not { operand } => operand.gather_references(out),
            Self::Equals { lhs, rhs } => {
                lhs.gather_references(out);
                rhs.gather_references(out);
            }
            Self::ImportValue { name } => name.gather_references(out),
            Self::Base64 { source } => source.gather_references(out),
        }
    }
}
