//! Machine-config patches
//!
//! Maps merge recursively, `interfaces` lists merge entry by entry keyed on
//! `interface` or `deviceSelector`, every other list is replaced, and a map
//! of `{"$patch": "delete"}` removes the key it is attached to.

use serde_json::{Map, Value};

const DIRECTIVE: &str = "$patch";

fn is_delete(value: &Value) -> bool {
    value
        .get(DIRECTIVE)
        .and_then(Value::as_str)
        .is_some_and(|d| d == "delete")
}

/// Apply `patch` onto `base` in place.
pub fn apply_patch(base: &mut Value, patch: &Value) {
    let (Value::Object(base_map), Value::Object(patch_map)) = (&mut *base, patch) else {
        if !patch.is_null() {
            *base = without_directives(patch);
        }
        return;
    };
    merge_maps(base_map, patch_map);
}

fn merge_maps(base: &mut Map<String, Value>, patch: &Map<String, Value>) {
    for (key, value) in patch {
        if is_delete(value) {
            base.remove(key);
            continue;
        }
        if value.is_null() {
            continue;
        }
        match (base.get_mut(key), value) {
            (Some(Value::Array(existing)), Value::Array(entries)) if key == "interfaces" => {
                merge_interfaces(existing, entries);
            }
            (Some(existing), Value::Object(_)) if existing.is_object() => apply_patch(existing, value),
            _ => {
                base.insert(key.clone(), without_directives(value));
            }
        }
    }
}

/// The identity of an interface entry.
fn interface_key(entry: &Value) -> Option<(&'static str, &Value)> {
    if let Some(name) = entry.get("interface") {
        return Some(("interface", name));
    }
    entry.get("deviceSelector").map(|selector| ("deviceSelector", selector))
}

fn merge_interfaces(existing: &mut Vec<Value>, entries: &[Value]) {
    for entry in entries {
        let position = interface_key(entry).and_then(|key| {
            existing
                .iter()
                .position(|current| interface_key(current) == Some(key))
        });
        match position {
            Some(index) if is_delete(entry) => {
                existing.remove(index);
            }
            Some(index) => apply_patch(&mut existing[index], entry),
            None if is_delete(entry) => {}
            None => existing.push(without_directives(entry)),
        }
    }
}

fn without_directives(value: &Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.iter()
                .filter(|(k, v)| k.as_str() != DIRECTIVE && !is_delete(v))
                .map(|(k, v)| (k.clone(), without_directives(v)))
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.iter().map(without_directives).collect()),
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_maps_merge_lists_replace() {
        let mut base = json!({
            "machine": {"type": "worker", "certSANs": ["a"], "install": {"disk": "/dev/vda", "wipe": false}}
        });
        apply_patch(
            &mut base,
            &json!({"machine": {"certSANs": ["b", "c"], "install": {"disk": "/dev/sda"}}}),
        );
        assert_eq!(
            base,
            json!({"machine": {"type": "worker", "certSANs": ["b", "c"], "install": {"disk": "/dev/sda", "wipe": false}}})
        );
    }

    #[test]
    fn test_interfaces_merge_by_name() {
        let mut base = json!({"machine": {"network": {"interfaces": [
            {"interface": "eth0", "dhcp": true},
            {"interface": "eth1", "dhcp": true}
        ]}}});
        apply_patch(
            &mut base,
            &json!({"machine": {"network": {"interfaces": [
                {"interface": "eth0", "addresses": ["10.0.0.2/24"], "dhcp": false},
                {"deviceSelector": {"hardwareAddr": "52:54:*"}, "dhcp": true}
            ]}}}),
        );
        assert_eq!(
            base["machine"]["network"]["interfaces"],
            json!([
                {"interface": "eth0", "dhcp": false, "addresses": ["10.0.0.2/24"]},
                {"interface": "eth1", "dhcp": true},
                {"deviceSelector": {"hardwareAddr": "52:54:*"}, "dhcp": true}
            ])
        );
    }

    #[test]
    fn test_delete_directive() {
        let mut base = json!({"machine": {
            "network": {"interfaces": [{"interface": "eth0"}, {"interface": "eth1"}]},
            "kubelet": {"extraArgs": {"a": "b"}}
        }});
        apply_patch(
            &mut base,
            &json!({"machine": {
                "kubelet": {"$patch": "delete"},
                "network": {"interfaces": [{"interface": "eth1", "$patch": "delete"}]}
            }}),
        );
        assert_eq!(
            base,
            json!({"machine": {"network": {"interfaces": [{"interface": "eth0"}]}}})
        );
    }

    #[test]
    fn test_null_and_new_keys() {
        let mut base = json!({"a": 1});
        apply_patch(&mut base, &json!({"a": null, "b": {"c": 2, "d": {"$patch": "delete"}}}));
        assert_eq!(base, json!({"a": 1, "b": {"c": 2}}));
    }
}
