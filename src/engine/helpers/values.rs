//! Value tree queries: `lookup`, `has`, `required`, `default`

use serde_json::Value;

use super::{as_text, int_param, is_empty, opt_param, param, str_param, HelperEnv, Registrar};
use crate::engine::budget::Failure;
use crate::values::get_path;

pub(super) fn register(registrar: &mut Registrar<'_, '_>, env: &HelperEnv) {
    // `lookup "a.b[0]" [default]` reads the value tree; `lookup obj key`
    // keeps the stock index semantics.
    registrar.value("lookup", |h, ctx| match param(h, 0)? {
        Value::String(path) => {
            let values = ctx.data().get("Values").unwrap_or(&Value::Null);
            match get_path(values, path) {
                Some(found) if !found.is_null() => Ok(found.clone()),
                _ => Ok(opt_param(h, 1).cloned().unwrap_or(Value::Null)),
            }
        }
        Value::Object(map) => {
            let key = as_text(param(h, 1)?);
            Ok(map.get(&key).cloned().unwrap_or(Value::Null))
        }
        Value::Array(items) => {
            let index = int_param(h, 1)?;
            Ok(usize::try_from(index)
                .ok()
                .and_then(|i| items.get(i))
                .cloned()
                .unwrap_or(Value::Null))
        }
        _ => Ok(Value::Null),
    });

    registrar.value("has", |h, ctx| {
        let path = str_param(h, 0)?;
        let values = ctx.data().get("Values").unwrap_or(&Value::Null);
        Ok(Value::Bool(get_path(values, path).is_some_and(|v| !v.is_null())))
    });

    let failures = env.failures.clone();
    registrar.value("required", move |h, _| {
        let message = str_param(h, 0)?;
        let value = opt_param(h, 1).unwrap_or(&Value::Null);
        if is_empty(value) && !matches!(value, Value::Bool(false)) {
            let path = h
                .param(1)
                .and_then(|p| p.relative_path())
                .map(|p| p.to_string());
            return Err(failures.fail(Failure::Eval {
                message: message.to_string(),
                path,
            }));
        }
        Ok(value.clone())
    });

    registrar.value("default", |h, _| {
        let fallback = param(h, 0)?;
        match opt_param(h, 1) {
            Some(value) if !is_empty(value) => Ok(value.clone()),
            _ => Ok(fallback.clone()),
        }
    });
}

#[cfg(test)]
mod tests {
    use super::super::testing::{env_with, render, render_with, MapFacts};
    use crate::engine::budget::Failure;
    use serde_json::json;
    use std::sync::Arc;

    fn data() -> serde_json::Value {
        json!({"Values": {
            "endpoint": "https://10.0.0.1:6443",
            "podSubnets": ["10.244.0.0/16", "10.245.0.0/16"],
            "empty": "",
            "nested": {"disk": "/dev/nvme0n1"}
        }})
    }

    #[test]
    fn test_lookup_by_path_with_default() {
        assert_eq!(render(r#"{{lookup "nested.disk"}}"#, &data()).unwrap(), "/dev/nvme0n1");
        assert_eq!(render(r#"{{lookup "podSubnets[1]"}}"#, &data()).unwrap(), "10.245.0.0/16");
        assert_eq!(render(r#"{{lookup "missing" "/dev/sda"}}"#, &data()).unwrap(), "/dev/sda");
        assert_eq!(render(r#"{{lookup "missing"}}"#, &data()).unwrap(), "");
    }

    #[test]
    fn test_lookup_keeps_index_form() {
        assert_eq!(render(r#"{{lookup Values.nested "disk"}}"#, &data()).unwrap(), "/dev/nvme0n1");
        assert_eq!(render("{{lookup Values.podSubnets 0}}", &data()).unwrap(), "10.244.0.0/16");
    }

    #[test]
    fn test_has() {
        assert_eq!(render(r#"{{#if (has "nested.disk")}}yes{{/if}}"#, &data()).unwrap(), "yes");
        assert_eq!(render(r#"{{#if (has "nope")}}yes{{else}}no{{/if}}"#, &data()).unwrap(), "no");
    }

    #[test]
    fn test_required_reports_value_path() {
        let env = env_with(Arc::new(MapFacts(json!({}))), None);
        let err = render_with(&env, r#"{{required "endpoint is mandatory" Values.empty}}"#, &data());
        assert!(err.is_err());
        assert_eq!(
            env.failures.take(),
            Some(Failure::Eval {
                message: "endpoint is mandatory".into(),
                path: Some("Values.empty".into()),
            })
        );
        assert_eq!(
            render(r#"{{required "x" Values.endpoint}}"#, &data()).unwrap(),
            "https://10.0.0.1:6443"
        );
    }

    #[test]
    fn test_default() {
        assert_eq!(render(r#"{{default "cluster.local" Values.empty}}"#, &data()).unwrap(), "cluster.local");
        assert_eq!(render(r#"{{default "x" Values.nested.disk}}"#, &data()).unwrap(), "/dev/nvme0n1");
        assert_eq!(render(r#"{{default "x" Values.absent}}"#, &data()).unwrap(), "x");
    }
}
