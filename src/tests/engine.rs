// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use crate::tests::common::{type_system, value, TestFactory};
use crate::value::Value;
use crate::{Engine, EvaluationError};

use anyhow::Result;

fn engine_with(template: serde_json::Value) -> Result<Engine> {
    let mut engine = Engine::new();
    engine.set_type_system(type_system());
    engine.add_template(&value(template))?;
    Ok(engine)
}

#[test]
fn instantiates_an_entity_with_evaluated_properties() -> Result<()> {
    let mut engine = engine_with(serde_json::json!({
        "resources": {
            "assets": {
                "type": "acme.Bucket",
                "properties": { "bucketName": "assets", "versioned": true }
            }
        }
    }))?;
    let mut factory = TestFactory::new();
    let registry = engine.evaluate(&mut factory)?;

    assert_eq!(factory.instantiated.len(), 1);
    let (fqn, logical_id, args) = &factory.instantiated[0];
    assert_eq!(fqn, "acme.Bucket");
    assert_eq!(logical_id, "assets");
    assert_eq!(args.len(), 1);
    assert_eq!(args[0]["bucketName"], Value::from("assets"));
    assert_eq!(args[0]["versioned"], Value::Bool(true));

    assert_eq!(registry.get("assets")?.primary, Value::from("ref:assets"));
    Ok(())
}

#[test]
fn references_order_construction() -> Result<()> {
    // `assets` is declared first but depends on `svc` through an
    // interpolated reference.
    let mut engine = engine_with(serde_json::json!({
        "resources": {
            "assets": {
                "type": "acme.Bucket",
                "properties": {
                    "bucketName": { "Fn::Sub": "${svc}-assets" }
                }
            },
            "svc": { "type": "acme.Service" }
        }
    }))?;
    let mut factory = TestFactory::new();
    engine.evaluate(&mut factory)?;

    assert_eq!(factory.instantiation_order(), ["svc", "assets"]);
    let (_, _, args) = &factory.instantiated[1];
    assert_eq!(args[0]["bucketName"], Value::from("ref:svc-assets"));
    Ok(())
}

#[test]
fn forward_attribute_reference_defers_until_finalize() -> Result<()> {
    let mut engine = engine_with(serde_json::json!({
        "resources": {
            "reader": {
                "type": "acme.Bucket",
                "properties": {
                    "bucketName": { "Fn::GetAtt": ["store", "arn"] }
                }
            },
            "store": { "type": "acme.Bucket" }
        }
    }))?;
    // `arn` is not part of the handle at construction time; it only
    // materializes later.
    let mut factory = TestFactory::new().with_late_attribute("store", "arn", Value::from("arn:1"));
    let registry = engine.evaluate(&mut factory)?;

    let (_, _, args) = &factory.instantiated[1];
    assert!(args[0]["bucketName"].has_deferred());

    let artifact = registry.finalize(&factory)?;
    assert_eq!(artifact["reader"], Value::from("ref:reader"));
    // Forcing a registry with no deferred primaries is a no-op; the
    // deferred value sat inside the constructed properties.
    let forced = args[0].force(&factory)?;
    assert_eq!(forced["bucketName"], Value::from("arn:1"));
    Ok(())
}

#[test]
fn attribute_present_at_construction_is_immediate() -> Result<()> {
    let mut engine = engine_with(serde_json::json!({
        "resources": {
            "reader": {
                "type": "acme.Bucket",
                "properties": {
                    "bucketName": { "Fn::GetAtt": "store.arn" }
                }
            },
            "store": { "type": "acme.Bucket" }
        }
    }))?;
    let mut factory = TestFactory::new().with_attribute("store", "arn", Value::from("arn:2"));
    engine.evaluate(&mut factory)?;

    let (_, _, args) = &factory.instantiated[1];
    assert_eq!(args[0]["bucketName"], Value::from("arn:2"));
    Ok(())
}

#[test]
fn reference_to_undeclared_entity_fails_naming_it() -> Result<()> {
    let mut engine = engine_with(serde_json::json!({
        "resources": {
            "assets": {
                "type": "acme.Bucket",
                "properties": {
                    "bucketName": { "Fn::Sub": "${ghost}-assets" }
                }
            }
        }
    }))?;
    let mut factory = TestFactory::new();
    let err = engine.evaluate(&mut factory).expect_err("ghost is undeclared");
    assert!(format!("{err}").contains("ghost"), "got: {err}");
    Ok(())
}

#[test]
fn reference_cycle_fails_with_path() -> Result<()> {
    let mut engine = engine_with(serde_json::json!({
        "resources": {
            "a": {
                "type": "acme.Bucket",
                "properties": { "bucketName": { "Fn::Sub": "${b}" } }
            },
            "b": {
                "type": "acme.Bucket",
                "properties": { "bucketName": { "Fn::Sub": "${a}" } }
            }
        }
    }))?;
    let mut factory = TestFactory::new();
    let err = engine.evaluate(&mut factory).expect_err("a and b form a cycle");
    let message = format!("{err}");
    assert!(
        message.contains("a -> b -> a") || message.contains("b -> a -> b"),
        "got: {message}"
    );
    Ok(())
}

#[test]
fn every_failing_entity_is_reported_once() -> Result<()> {
    let mut engine = engine_with(serde_json::json!({
        "resources": {
            "bad1": {
                "type": "acme.Bucket",
                "properties": { "bogus": 1 }
            },
            "bad2": {
                "type": "acme.Bucket",
                "properties": { "bucketName": 42 }
            },
            // depends on a failed entity: skipped, no diagnostic
            "child": {
                "type": "acme.Bucket",
                "properties": { "bucketName": { "Fn::Sub": "${bad1}-x" } }
            },
            "fine": { "type": "acme.Service" }
        }
    }))?;
    let mut factory = TestFactory::new();
    let err = engine.evaluate(&mut factory).expect_err("two entities fail");

    let failure = err
        .downcast_ref::<EvaluationError>()
        .expect("an evaluation failure");
    let mut failing: Vec<&str> = failure
        .diagnostics
        .iter()
        .map(|d| d.logical_id.as_str())
        .collect();
    failing.sort_unstable();
    assert_eq!(failing, ["bad1", "bad2"]);

    // The healthy entity was still evaluated.
    assert_eq!(factory.instantiation_order(), ["fine"]);
    Ok(())
}

#[test]
fn diagnostics_carry_the_property_path() -> Result<()> {
    let mut engine = engine_with(serde_json::json!({
        "resources": {
            "assets": {
                "type": "acme.Bucket",
                "properties": { "versioned": "yes" }
            }
        }
    }))?;
    let mut factory = TestFactory::new();
    let err = engine.evaluate(&mut factory).expect_err("versioned must be a boolean");
    let message = format!("{err}");
    assert!(
        message.contains("resources.assets.properties.versioned"),
        "got: {message}"
    );
    Ok(())
}

#[test]
fn call_form_invokes_a_method_on_the_target() -> Result<()> {
    let mut engine = engine_with(serde_json::json!({
        "resources": {
            "assets": { "type": "acme.Bucket" },
            "svc": { "type": "acme.Service" },
            "grant": {
                "on": "assets",
                "call": {
                    "grantRead": { "grantee": { "Ref": "svc" } }
                }
            }
        }
    }))?;
    let mut factory = TestFactory::new();
    let registry = engine.evaluate(&mut factory)?;

    assert_eq!(factory.invoked.len(), 1);
    let (fqn, method, target, args) = &factory.invoked[0];
    assert_eq!(fqn, "acme.Bucket");
    assert_eq!(method, "grantRead");
    assert_eq!(target, "assets");
    assert_eq!(args, &vec![Value::from("ref:svc")]);

    assert_eq!(
        registry.get("grant")?.primary,
        Value::from("call:assets.grantRead")
    );
    Ok(())
}

#[test]
fn call_form_unknown_method_is_reported() -> Result<()> {
    let mut engine = engine_with(serde_json::json!({
        "resources": {
            "assets": { "type": "acme.Bucket" },
            "grant": {
                "on": "assets",
                "call": { "grantWrite": {} }
            }
        }
    }))?;
    let mut factory = TestFactory::new();
    let err = engine.evaluate(&mut factory).expect_err("no grantWrite");
    assert!(format!("{err}").contains("grantWrite"), "got: {err}");
    Ok(())
}

#[test]
fn tags_overrides_and_dependencies_reach_the_factory() -> Result<()> {
    let mut engine = engine_with(serde_json::json!({
        "resources": {
            "base": { "type": "acme.Service" },
            "assets": {
                "type": "acme.Bucket",
                "dependsOn": ["base"],
                "tags": [{ "key": "team", "value": "storage" }],
                "overrides": [
                    { "path": "encryption.enabled", "update": true },
                    { "path": "legacy", "remove": true }
                ]
            }
        }
    }))?;
    let mut factory = TestFactory::new();
    engine.evaluate(&mut factory)?;

    // The explicit dependency also orders construction.
    assert_eq!(factory.instantiation_order(), ["base", "assets"]);
    assert_eq!(factory.dependencies, [("assets".to_string(), "base".to_string())]);
    assert_eq!(factory.tags.len(), 1);
    assert_eq!(factory.tags[0].0, "assets");
    assert_eq!(factory.overrides.len(), 2);
    Ok(())
}

#[test]
fn enum_like_and_enum_properties_evaluate_through_the_factory() -> Result<()> {
    let mut engine = engine_with(serde_json::json!({
        "resources": {
            "assets": {
                "type": "acme.Bucket",
                "properties": {
                    "timeout": { "minutes": { "amount": 5 } },
                    "storageClass": "archive",
                    "visibility": "public"
                }
            }
        }
    }))?;
    let mut factory = TestFactory::new();
    engine.evaluate(&mut factory)?;

    let (_, _, args) = &factory.instantiated[0];
    let props = &args[0];
    assert_eq!(props["timeout"]["call"], Value::from("acme.Duration.minutes"));
    assert_eq!(
        props["storageClass"],
        Value::from("acme.StorageClass.ARCHIVE")
    );
    assert_eq!(props["visibility"], Value::from("PUBLIC"));
    Ok(())
}

#[test]
fn conditions_select_branches_in_properties() -> Result<()> {
    let mut engine = engine_with(serde_json::json!({
        "conditions": {
            "isProd": { "Fn::Equals": ["prod", "dev"] }
        },
        "resources": {
            "assets": {
                "type": "acme.Bucket",
                "properties": {
                    "bucketName": { "Fn::If": ["isProd", "assets-prod", "assets-dev"] }
                }
            }
        }
    }))?;
    let mut factory = TestFactory::new();
    engine.evaluate(&mut factory)?;

    let (_, _, args) = &factory.instantiated[0];
    assert_eq!(args[0]["bucketName"], Value::from("assets-dev"));
    Ok(())
}

#[test]
fn unknown_type_is_reported_with_the_entity() -> Result<()> {
    let mut engine = engine_with(serde_json::json!({
        "resources": {
            "mystery": { "type": "acme.DoesNotExist" }
        }
    }))?;
    let mut factory = TestFactory::new();
    let err = engine.evaluate(&mut factory).expect_err("unknown type");
    let message = format!("{err}");
    assert!(message.contains("mystery") && message.contains("acme.DoesNotExist"), "got: {message}");
    Ok(())
}

#[test]
fn evaluating_without_a_type_system_fails() {
    let mut engine = Engine::new();
    engine
        .add_template(&value(serde_json::json!({ "resources": {} })))
        .expect("empty template parses");
    let mut factory = TestFactory::new();
    assert!(engine.evaluate(&mut factory).is_err());
}

#[cfg(feature = "yaml")]
#[test]
fn yaml_templates_parse() -> Result<()> {
    let mut engine = Engine::new();
    engine.set_type_system(type_system());
    engine.add_template_from_yaml(
        r#"
resources:
  assets:
    type: acme.Bucket
    properties:
      bucketName: assets
"#,
    )?;
    let mut factory = TestFactory::new();
    engine.evaluate(&mut factory)?;
    assert_eq!(factory.instantiation_order(), ["assets"]);
    Ok(())
}
