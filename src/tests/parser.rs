// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use crate::expr::{join_fragments, Expr, Fragment, Intrinsic};
use crate::parser::{parse, tokenize_interpolation};
use crate::tests::common::value;

use anyhow::Result;

#[test]
fn literals_and_structure() -> Result<()> {
    let expr = parse(&value(serde_json::json!({
        "name": "assets",
        "count": 3,
        "nested": { "flag": true, "nothing": null },
        "list": [1, "two"]
    })))?;

    let Expr::Object(fields) = &expr else {
        panic!("expected an object, got {expr:?}");
    };
    assert_eq!(fields["name"], Expr::String("assets".into()));
    assert_eq!(fields["count"], Expr::Number(3i64.into()));
    let Expr::Object(nested) = &fields["nested"] else {
        panic!("expected nested object");
    };
    assert_eq!(nested["flag"], Expr::Bool(true));
    assert_eq!(nested["nothing"], Expr::Null);
    let Expr::Array(list) = &fields["list"] else {
        panic!("expected a list");
    };
    assert_eq!(list.len(), 2);
    Ok(())
}

#[test]
fn object_field_order_is_preserved() -> Result<()> {
    let expr = parse(&value(serde_json::json!({
        "zeta": 1, "alpha": 2, "midway": 3
    })))?;
    let Expr::Object(fields) = &expr else {
        panic!("expected an object");
    };
    let keys: Vec<&str> = fields.keys().map(|k| k.as_ref()).collect();
    assert_eq!(keys, ["zeta", "alpha", "midway"]);
    Ok(())
}

#[test]
fn ref_intrinsic() -> Result<()> {
    let expr = parse(&value(serde_json::json!({ "Ref": "bucket" })))?;
    assert_eq!(
        expr,
        Expr::Intrinsic(Intrinsic::Ref {
            logical_id: "bucket".into()
        })
    );
    Ok(())
}

#[test]
fn single_key_object_with_unknown_key_is_plain_data() -> Result<()> {
    let expr = parse(&value(serde_json::json!({ "Fn::Bogus": "x" })))?;
    assert!(matches!(expr, Expr::Object(_)));
    Ok(())
}

#[test]
fn get_att_both_spellings() -> Result<()> {
    let list = parse(&value(serde_json::json!({ "Fn::GetAtt": ["bucket", "arn"] })))?;
    let short = parse(&value(serde_json::json!({ "Fn::GetAtt": "bucket.arn" })))?;
    assert_eq!(
        list,
        Expr::Intrinsic(Intrinsic::GetAtt {
            logical_id: "bucket".into(),
            attribute: "arn".into(),
            shorthand: false,
        })
    );
    assert_eq!(
        short,
        Expr::Intrinsic(Intrinsic::GetAtt {
            logical_id: "bucket".into(),
            attribute: "arn".into(),
            shorthand: true,
        })
    );
    Ok(())
}

#[test]
fn get_att_shorthand_keeps_attribute_dots() -> Result<()> {
    let expr = parse(&value(serde_json::json!({ "Fn::GetAtt": "db.endpoint.port" })))?;
    assert_eq!(
        expr,
        Expr::Intrinsic(Intrinsic::GetAtt {
            logical_id: "db".into(),
            attribute: "endpoint.port".into(),
            shorthand: true,
        })
    );
    Ok(())
}

#[test]
fn wrong_arity_reports_field_path() {
    let err = parse(&value(serde_json::json!({
        "outer": { "Fn::Select": [1, ["a"], "extra"] }
    })))
    .expect_err("three items must fail");
    let msg = format!("{err}");
    assert!(msg.contains("$.outer.Fn::Select"), "got: {msg}");
    assert!(msg.contains("2"), "got: {msg}");
}

#[test]
fn boolean_intrinsic_arity() {
    assert!(parse(&value(serde_json::json!({ "Fn::And": [true] }))).is_err());
    assert!(parse(&value(serde_json::json!({ "Fn::Not": [true, false] }))).is_err());
    assert!(parse(&value(serde_json::json!({ "Fn::And": [true, false] }))).is_ok());
}

#[test]
fn if_takes_condition_name_and_two_branches() -> Result<()> {
    let expr = parse(&value(serde_json::json!({ "Fn::If": ["isProd", "a", "b"] })))?;
    let Expr::Intrinsic(Intrinsic::If { condition, .. }) = &expr else {
        panic!("expected Fn::If");
    };
    assert_eq!(condition.as_ref(), "isProd");
    assert!(parse(&value(serde_json::json!({ "Fn::If": ["isProd", "a"] }))).is_err());
    Ok(())
}

#[test]
fn sub_with_substitution_map() -> Result<()> {
    let expr = parse(&value(serde_json::json!({
        "Fn::Sub": ["${stage}-${bucket}", { "stage": "beta" }]
    })))?;
    let Expr::Intrinsic(Intrinsic::Sub {
        fragments,
        substitutions,
    }) = &expr
    else {
        panic!("expected Fn::Sub");
    };
    assert_eq!(
        fragments,
        &vec![
            Fragment::Ref("stage".into()),
            Fragment::Literal("-".into()),
            Fragment::Ref("bucket".into()),
        ]
    );
    assert_eq!(substitutions.len(), 1);
    assert!(substitutions.contains_key("stage"));
    Ok(())
}

#[test]
fn interpolation_fragments() {
    let fragments = tokenize_interpolation("a${x}b${y.z}c");
    assert_eq!(
        fragments,
        vec![
            Fragment::Literal("a".into()),
            Fragment::Ref("x".into()),
            Fragment::Literal("b".into()),
            Fragment::GetAtt("y".into(), "z".into()),
            Fragment::Literal("c".into()),
        ]
    );
}

#[test]
fn interpolation_escape_stays_literal() {
    let fragments = tokenize_interpolation("${!keep}-${use}");
    assert_eq!(
        fragments,
        vec![
            Fragment::Literal("${!keep}-".into()),
            Fragment::Ref("use".into()),
        ]
    );
}

#[test]
fn interpolation_round_trip() {
    let cases = [
        "",
        "plain text",
        "${one}",
        "a${x}b${y.z}c",
        "${!literal}",
        "mixed ${a} and ${!b} and ${c.d}",
        "unterminated ${oops",
        "unterminated escape ${!oops",
        "${}",
        "${.bad}",
        "${trailing.}",
        "$${double}",
        "${a}${b}",
    ];
    for case in cases {
        let fragments = tokenize_interpolation(case);
        assert_eq!(join_fragments(&fragments), case, "case: {case}");
    }
}

#[test]
fn nested_intrinsics() -> Result<()> {
    let expr = parse(&value(serde_json::json!({
        "Fn::Select": [0, { "Fn::Split": [",", { "Ref": "csv" }] }]
    })))?;
    let Expr::Intrinsic(Intrinsic::Select { list, .. }) = &expr else {
        panic!("expected Fn::Select");
    };
    let Expr::Intrinsic(Intrinsic::Split { source, .. }) = list.as_ref() else {
        panic!("expected nested Fn::Split");
    };
    assert!(matches!(
        source.as_ref(),
        Expr::Intrinsic(Intrinsic::Ref { .. })
    ));
    Ok(())
}
