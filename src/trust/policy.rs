//! Metadata-policy application.
//!
//! A superior's `metadata_policy` constrains the metadata of everything
//! below it. Policies are applied one statement at a time, Trust Anchor
//! first, each operating on the output of the previous one. Unknown
//! operators are ignored so future federation extensions pass through.

use serde_json::{Map, Value};

use crate::errors::{Error, Result};

/// Apply one policy object (claim → operators) to a metadata block.
pub fn apply_policy(metadata: &Value, policy: &Value) -> Result<Value> {
    let mut out = metadata
        .as_object()
        .cloned()
        .ok_or_else(|| Error::MetadataPolicy("metadata is not an object".into()))?;
    let policy = policy
        .as_object()
        .ok_or_else(|| Error::MetadataPolicy("policy is not an object".into()))?;

    for (claim, operators) in policy {
        let operators = operators.as_object().ok_or_else(|| {
            Error::MetadataPolicy(format!("operators for '{claim}' are not an object"))
        })?;
        apply_operators(&mut out, claim, operators)?;
    }

    Ok(Value::Object(out))
}

fn apply_operators(out: &mut Map<String, Value>, claim: &str, ops: &Map<String, Value>) -> Result<()> {
    // value / add / default modify, the rest check
    if let Some(value) = ops.get("value") {
        if value.is_null() {
            out.remove(claim);
        } else {
            out.insert(claim.to_string(), value.clone());
        }
    }

    if let Some(add) = ops.get("add") {
        let additions = as_array(add);
        let mut current = out.get(claim).map(as_array).unwrap_or_default();
        for v in additions {
            if !current.contains(&v) {
                current.push(v);
            }
        }
        out.insert(claim.to_string(), Value::Array(current));
    }

    if let Some(default) = ops.get("default") {
        if !out.contains_key(claim) {
            out.insert(claim.to_string(), default.clone());
        }
    }

    if let Some(one_of) = ops.get("one_of").and_then(Value::as_array) {
        if let Some(value) = out.get(claim) {
            if !one_of.contains(value) {
                return Err(Error::MetadataPolicy(format!(
                    "'{claim}' value {value} is not one_of the permitted values"
                )));
            }
        }
    }

    if let Some(subset) = ops.get("subset_of").and_then(Value::as_array) {
        if let Some(value) = out.get(claim) {
            let current = as_array(value);
            let kept: Vec<Value> = current.into_iter().filter(|v| subset.contains(v)).collect();
            if kept.is_empty() {
                out.remove(claim);
            } else {
                out.insert(claim.to_string(), Value::Array(kept));
            }
        }
    }

    if let Some(superset) = ops.get("superset_of").and_then(Value::as_array) {
        if let Some(value) = out.get(claim) {
            let current = as_array(value);
            if !superset.iter().all(|v| current.contains(v)) {
                return Err(Error::MetadataPolicy(format!(
                    "'{claim}' is not a superset_of the required values"
                )));
            }
        }
    }

    if ops.get("essential").and_then(Value::as_bool) == Some(true) && !out.contains_key(claim) {
        return Err(Error::MetadataPolicy(format!(
            "essential claim '{claim}' is absent"
        )));
    }

    Ok(())
}

fn as_array(value: &Value) -> Vec<Value> {
    match value {
        Value::Array(items) => items.clone(),
        other => vec![other.clone()],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_value_replaces() {
        let merged = apply_policy(
            &json!({"grant_types": ["implicit"]}),
            &json!({"grant_types": {"value": ["authorization_code"]}}),
        )
        .unwrap();
        assert_eq!(merged["grant_types"], json!(["authorization_code"]));
    }

    #[test]
    fn test_value_null_removes() {
        let merged = apply_policy(
            &json!({"logo_uri": "https://x.example/logo.png"}),
            &json!({"logo_uri": {"value": null}}),
        )
        .unwrap();
        assert!(merged.get("logo_uri").is_none());
    }

    #[test]
    fn test_add_appends_missing_entries() {
        let merged = apply_policy(
            &json!({"contacts": ["a@example.org"]}),
            &json!({"contacts": {"add": ["b@example.org", "a@example.org"]}}),
        )
        .unwrap();
        assert_eq!(merged["contacts"], json!(["a@example.org", "b@example.org"]));
    }

    #[test]
    fn test_default_only_fills_absent() {
        let policy = json!({"response_types": {"default": ["code"]}});
        let absent = apply_policy(&json!({}), &policy).unwrap();
        assert_eq!(absent["response_types"], json!(["code"]));

        let present = apply_policy(&json!({"response_types": ["token"]}), &policy).unwrap();
        assert_eq!(present["response_types"], json!(["token"]));
    }

    #[test]
    fn test_one_of_enforced() {
        let policy = json!({"token_endpoint_auth_method": {"one_of": ["private_key_jwt"]}});
        assert!(apply_policy(
            &json!({"token_endpoint_auth_method": "private_key_jwt"}),
            &policy
        )
        .is_ok());
        assert!(matches!(
            apply_policy(&json!({"token_endpoint_auth_method": "none"}), &policy),
            Err(Error::MetadataPolicy(_))
        ));
    }

    #[test]
    fn test_subset_of_intersects() {
        let merged = apply_policy(
            &json!({"scope": ["openid", "profile", "email"]}),
            &json!({"scope": {"subset_of": ["openid", "email"]}}),
        )
        .unwrap();
        assert_eq!(merged["scope"], json!(["openid", "email"]));
    }

    #[test]
    fn test_subset_of_empty_intersection_removes_claim() {
        let merged = apply_policy(
            &json!({"scope": ["profile"]}),
            &json!({"scope": {"subset_of": ["openid"]}}),
        )
        .unwrap();
        assert!(merged.get("scope").is_none());
    }

    #[test]
    fn test_superset_of_enforced() {
        let policy = json!({"grant_types": {"superset_of": ["authorization_code"]}});
        assert!(apply_policy(
            &json!({"grant_types": ["authorization_code", "refresh_token"]}),
            &policy
        )
        .is_ok());
        assert!(apply_policy(&json!({"grant_types": ["implicit"]}), &policy).is_err());
    }

    #[test]
    fn test_essential_requires_presence() {
        let policy = json!({"jwks": {"essential": true}});
        assert!(matches!(
            apply_policy(&json!({}), &policy),
            Err(Error::MetadataPolicy(_))
        ));
        assert!(apply_policy(&json!({"jwks": {"keys": []}}), &policy).is_ok());
    }

    #[test]
    fn test_operators_compose_in_order() {
        // default fills the claim, then subset_of trims it
        let merged = apply_policy(
            &json!({}),
            &json!({"scope": {
                "default": ["openid", "profile"],
                "subset_of": ["openid"],
                "essential": true
            }}),
        )
        .unwrap();
        assert_eq!(merged["scope"], json!(["openid"]));
    }

    #[test]
    fn test_unknown_operator_is_ignored() {
        let merged = apply_policy(
            &json!({"scope": ["openid"]}),
            &json!({"scope": {"regexp": "^openid$"}}),
        )
        .unwrap();
        assert_eq!(merged["scope"], json!(["openid"]));
    }
}
