// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use crate::expr::{Expr, Fragment, Intrinsic};
use crate::value::Value;

use std::collections::BTreeMap;
use std::rc::Rc;

use anyhow::{bail, Result};
use indexmap::IndexMap;
use lazy_static::lazy_static;

type IntrinsicParser = fn(&Value, &str) -> Result<Intrinsic>;

lazy_static! {
    // Single-key objects whose key appears here parse as an intrinsic;
    // any other object is plain data.
    static ref INTRINSICS: BTreeMap<&'static str, IntrinsicParser> = {
        let mut m: BTreeMap<&'static str, IntrinsicParser> = BTreeMap::new();
        m.insert("Ref", parse_ref);
        m.insert("Fn::GetAtt", parse_get_att);
        m.insert("Fn::Sub", parse_sub);
        m.insert("Fn::Select", parse_select);
        m.insert("Fn::Split", parse_split);
        m.insert("Fn::Join", parse_join);
        m.insert("Fn::If", parse_if);
        m.insert("Fn::And", parse_and);
        m.insert("Fn::Or", parse_or);
        m.insert("Fn::Not", parse_not);
        m.insert("Fn::Equals", parse_equals);
        m.insert("Fn::ImportValue", parse_import_value);
        m.insert("Fn::Base64", parse_base64);
        m
    };
}

/// Convert raw template data into an expression tree. Total and pure:
/// every legal raw value maps to exactly one expression; illegal
/// intrinsic shapes fail with the offending field path.
pub fn parse(raw: &Value) -> Result<Expr> {
    parse_at(raw, "$")
}

/// Like [`parse`], rooted at the given field path for error reporting.
pub fn parse_at(raw: &Value, path: &str) -> Result<Expr> {
    match raw {
        Value::Null => Ok(Expr::Null),
        Value::Bool(b) => Ok(Expr::Bool(*b)),
        Value::Number(n) => Ok(Expr::Number(*n)),
        Value::String(s) => Ok(Expr::String(s.clone())),
        Value::Deferred(_) => bail!("{path}: raw template data cannot contain deferred values"),
        Value::Array(items) => {
            let mut out = Vec::with_capacity(items.len());
            for (i, item) in items.iter().enumerate() {
                out.push(parse_at(item, &format!("{path}[{i}]"))?);
            }
            Ok(Expr::Array(out))
        }
        Value::Object(fields) => {
            if fields.len() == 1 {
                if let Some((key, arg)) = fields.iter().next() {
                    if let Some(handler) = INTRINSICS.get(key.as_ref()) {
                        let path = format!("{path}.{key}");
                        return Ok(Expr::Intrinsic(handler(arg, &path)?));
                    }
                }
            }
            let mut out = IndexMap::with_capacity(fields.len());
            for (key, value) in fields.iter() {
                let expr = parse_at(value, &format!("{path}.{key}"))?;
                out.insert(key.clone(), expr);
            }
            Ok(Expr::Object(out))
        }
    }
}

fn expect_string(arg: &Value, path: &str, what: &str) -> Result<Rc<str>> {
    match arg {
        Value::String(s) => Ok(s.clone()),
        _ => bail!("{path}: expecting {what}, got {}", arg.kind()),
    }
}

fn expect_list<'a>(arg: &'a Value, path: &str, arity: usize, what: &str) -> Result<&'a Vec<Value>> {
    match arg {
        Value::Array(items) if items.len() == arity => Ok(items),
        Value::Array(items) => bail!(
            "{path}: expecting {what} with {arity} items, got {}",
            items.len()
        ),
        _ => bail!("{path}: expecting {what}, got {}", arg.kind()),
    }
}

fn parse_ref(arg: &Value, path: &str) -> Result<Intrinsic> {
    let logical_id = expect_string(arg, path, "an entity name")?;
    Ok(Intrinsic::Ref { logical_id })
}

fn parse_get_att(arg: &Value, path: &str) -> Result<Intrinsic> {
    match arg {
        // Shorthand spelling: "id.attribute". The attribute itself may
        // contain further dots.
        Value::String(s) => match s.split_once('.') {
            Some((id, attr)) if !id.is_empty() && !attr.is_empty() => Ok(Intrinsic::GetAtt {
                logical_id: id.into(),
                attribute: attr.into(),
                shorthand: true,
            }),
            _ => bail!("{path}: expecting \"id.attribute\", got `{s}`"),
        },
        Value::Array(_) => {
            let items = expect_list(arg, path, 2, "a [id, attribute] pair")?;
            let logical_id = expect_string(&items[0], &format!("{path}[0]"), "an entity name")?;
            let attribute = expect_string(&items[1], &format!("{path}[1]"), "an attribute name")?;
            Ok(Intrinsic::GetAtt {
                logical_id,
                attribute,
                shorthand: false,
            })
        }
        _ => bail!(
            "{path}: expecting \"id.attribute\" or a [id, attribute] pair, got {}",
            arg.kind()
        ),
    }
}

fn parse_sub(arg: &Value, path: &str) -> Result<Intrinsic> {
    let (template, substitutions) = match arg {
        Value::String(s) => (s.clone(), IndexMap::new()),
        Value::Array(_) => {
            let items = expect_list(arg, path, 2, "a [template, substitutions] pair")?;
            let template = expect_string(&items[0], &format!("{path}[0]"), "a template string")?;
            let subs = match &items[1] {
                Value::Object(fields) => {
                    let mut out = IndexMap::with_capacity(fields.len());
                    for (key, value) in fields.iter() {
                        let expr = parse_at(value, &format!("{path}[1].{key}"))?;
                        out.insert(key.clone(), expr);
                    }
                    out
                }
                other => bail!(
                    "{path}[1]: expecting a substitution object, got {}",
                    other.kind()
                ),
            };
            (template, subs)
        }
        _ => bail!(
            "{path}: expecting a template string or [template, substitutions] pair, got {}",
            arg.kind()
        ),
    };
    Ok(Intrinsic::Sub {
        fragments: tokenize_interpolation(&template),
        substitutions,
    })
}

fn parse_select(arg: &Value, path: &str) -> Result<Intrinsic> {
    let items = expect_list(arg, path, 2, "a [index, list] pair")?;
    Ok(Intrinsic::Select {
        index: Box::new(parse_at(&items[0], &format!("{path}[0]"))?),
        list: Box::new(parse_at(&items[1], &format!("{path}[1]"))?),
    })
}

fn parse_split(arg: &Value, path: &str) -> Result<Intrinsic> {
    let items = expect_list(arg, path, 2, "a [delimiter, string] pair")?;
    let delimiter = expect_string(&items[0], &format!("{path}[0]"), "a delimiter string")?;
    Ok(Intrinsic::Split {
        delimiter,
        source: Box::new(parse_at(&items[1], &format!("{path}[1]"))?),
    })
}

fn parse_join(arg: &Value, path: &str) -> Result<Intrinsic> {
    let items = expect_list(arg, path, 2, "a [delimiter, list] pair")?;
    let delimiter = expect_string(&items[0], &format!("{path}[0]"), "a delimiter string")?;
    Ok(Intrinsic::Join {
        delimiter,
        list: Box::new(parse_at(&items[1], &format!("{path}[1]"))?),
    })
}

fn parse_if(arg: &Value, path: &str) -> Result<Intrinsic> {
    let items = expect_list(arg, path, 3, "a [condition, then, else] triple")?;
    let condition = expect_string(&items[0], &format!("{path}[0]"), "a condition name")?;
    Ok(Intrinsic::If {
        condition,
        then_branch: Box::new(parse_at(&items[1], &format!("{path}[1]"))?),
        else_branch: Box::new(parse_at(&items[2], &format!("{path}[2]"))?),
    })
}

fn parse_operands(arg: &Value, path: &str) -> Result<Vec<Expr>> {
    match arg {
        Value::Array(items) if items.len() >= 2 => {
            let mut out = Vec::with_capacity(items.len());
            for (i, item) in items.iter().enumerate() {
                out.push(parse_at(item, &format!("{path}[{i}]"))?);
            }
            Ok(out)
        }
        Value::Array(items) => bail!(
            "{path}: expecting at least 2 operands, got {}",
            items.len()
        ),
        _ => bail!("{path}: expecting a list of operands, got {}", arg.kind()),
    }
}

fn parse_and(arg: &Value, path: &str) -> Result<Intrinsic> {
    Ok(Intrinsic::And {
        operands: parse_operands(arg, path)?,
    })
}

fn parse_or(arg: &Value, path: &str) -> Result<Intrinsic> {
    Ok(Intrinsic::Or {
        operands: parse_operands(arg, path)?,
    })
}

fn parse_not(arg: &Value, path: &str) -> Result<Intrinsic> {
    let items = expect_list(arg, path, 1, "a single-operand list")?;
    Ok(Intrinsic::Not {
        operand: Box::new(parse_at(&items[0], &format!("{path}[0]"))?),
    })
}

fn parse_equals(arg: &Value, path: &str) -> Result<Intrinsic> {
    let items = expect_list(arg, path, 2, "a [lhs, rhs] pair")?;
    Ok(Intrinsic::Equals {
        lhs: Box::new(parse_at(&items[0], &format!("{path}[0]"))?),
        rhs: Box::new(parse_at(&items[1], &format!("{path}[1]"))?),
    })
}

fn parse_import_value(arg: &Value, path: &str) -> Result<Intrinsic> {
    Ok(Intrinsic::ImportValue {
        name: Box::new(parse_at(arg, path)?),
    })
}

fn parse_base64(arg: &Value, path: &str) -> Result<Intrinsic> {
    Ok(Intrinsic::Base64 {
        source: Box::new(parse_at(arg, path)?),
    })
}

/// Tokenize `${name}` / `${name.attr}` placeholders into an ordered
/// fragment list. `${!...}` is the escape for a literal `${...}` and is
/// kept verbatim inside a literal fragment; so is an unterminated `${`
/// and a placeholder with an empty name. Joining the returned fragments
/// reproduces `text` exactly.
pub fn tokenize_interpolation(text: &str) -> Vec<Fragment> {
    let mut fragments = vec![];
    let mut literal = String::new();
    let mut rest = text;

    let mut flush = |literal: &mut String, fragments: &mut Vec<Fragment>| {
        if !literal.is_empty() {
            fragments.push(Fragment::Literal(literal.as_str().into()));
            literal.clear();
        }
    };

    while let Some(pos) = rest.find("${") {
        literal.push_str(&rest[..pos]);
        let after = &rest[pos + 2..];

        if let Some(escaped) = after.strip_prefix('!') {
            match escaped.find('}') {
                Some(end) => {
                    // "${!" + body + "}"
                    literal.push_str(&rest[pos..pos + 3 + end + 1]);
                    rest = &escaped[end + 1..];
                }
                None => {
                    literal.push_str(&rest[pos..]);
                    rest = "";
                }
            }
            continue;
        }

        match after.find('}') {
            Some(end) => {
                let name = &after[..end];
                let fragment = match name.split_once('.') {
                    _ if name.is_empty() => None,
                    Some((id, attr)) if !id.is_empty() && !attr.is_empty() => {
                        Some(Fragment::GetAtt(id.into(), attr.into()))
                    }
                    Some(_) => None,
                    None => Some(Fragment::Ref(name.into())),
                };
                match fragment {
                    Some(fragment) => {
                        flush(&mut literal, &mut fragments);
                        fragments.push(fragment);
                    }
                    // Malformed placeholder, keep as literal text.
                    None => literal.push_str(&rest[pos..pos + 2 + end + 1]),
                }
                rest = &after[end + 1..];
            }
            None => {
                literal.push_str(&rest[pos..]);
                rest = "";
            }
        }
    }
    literal.push_str(rest);
    flush(&mut literal, &mut fragments);
    fragments
}
