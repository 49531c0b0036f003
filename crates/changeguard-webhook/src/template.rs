//! Pod template comparison for admission
//!
//! An update only triggers a review when `spec.template` changed. The API
//! server fills in `metadata.creationTimestamp: null` and similar empty
//! fields differently on old and new objects, so both sides are normalized
//! before comparing.

use serde_json::Value;

/// `spec.template` of a raw workload object, normalized for comparison
pub fn normalized_template(object: &Value) -> Value {
    let mut template = object
        .pointer("/spec/template")
        .cloned()
        .unwrap_or(Value::Null);
    if let Some(meta) = template
        .get_mut("metadata")
        .and_then(Value::as_object_mut)
    {
        meta.remove("creationTimestamp");
    }
    strip_nulls(&mut template);
    template
}

/// True if the pod template differs between the old and new object
pub fn template_changed(old: &Value, new: &Value) -> bool {
    normalized_template(old) != normalized_template(new)
}

fn strip_nulls(value: &mut Value) {
    match value {
        Value::Object(map) => {
            map.retain(|_, v| !v.is_null());
            map.values_mut().for_each(strip_nulls);
        }
        Value::Array(items) => items.iter_mut().for_each(strip_nulls),
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn deployment(image: &str, extra_meta: Value) -> Value {
        json!({
            "metadata": {"name": "web", "generation": 4},
            "spec": {
                "replicas": 3,
                "template": {
                    "metadata": extra_meta,
                    "spec": {"containers": [{"name": "app", "image": image, "args": null}]}
                }
            }
        })
    }

    #[test]
    fn volatile_fields_do_not_count_as_changes() {
        let old = deployment("web:1", json!({"creationTimestamp": null, "labels": {"app": "web"}}));
        let new = deployment("web:1", json!({"labels": {"app": "web"}}));
        assert!(!template_changed(&old, &new));
    }

    #[test]
    fn image_change_is_a_template_change() {
        let old = deployment("web:1", json!({}));
        let new = deployment("web:2", json!({}));
        assert!(template_changed(&old, &new));
    }

    #[test]
    fn replica_only_changes_are_ignored() {
        let old = deployment("web:1", json!({}));
        let mut new = old.clone();
        new["spec"]["replicas"] = json!(5);
        assert!(!template_changed(&old, &new));
    }

    #[test]
    fn nested_nulls_are_stripped() {
        let mut value = json!({"a": null, "b": [{"c": null, "d": 1}]});
        strip_nulls(&mut value);
        assert_eq!(value, json!({"b": [{"d": 1}]}));
    }
}
