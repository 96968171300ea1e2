//! Data, string and number helpers

use std::fmt::Write as _;
use std::sync::atomic::{AtomicUsize, Ordering};

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use handlebars::{Context, Handlebars, Helper, HelperDef, RenderContext, RenderError, ScopedJson};
use serde_json::{Map, Number, Value};

use super::{as_text, int_param, opt_param, param, str_param, text_param, HelperEnv, Registrar};
use crate::engine::budget::{Failure, FailureSlot};

/// Nesting limit for `include`.
pub const MAX_INCLUDE_DEPTH: usize = 32;

pub(super) fn register(registrar: &mut Registrar<'_, '_>, env: &HelperEnv) {
    register_data(registrar, env);
    register_strings(registrar, env);
    register_numbers(registrar);
}

// ============================================================================
// Data
// ============================================================================

/// `include "partial" ctx`: renders a partial to a string so it can be piped
/// through `indent` and friends.
struct Include {
    depth: AtomicUsize,
    failures: FailureSlot,
}

impl HelperDef for Include {
    fn call_inner<'reg: 'rc, 'rc>(
        &self,
        h: &Helper<'reg, 'rc>,
        r: &'reg Handlebars<'reg>,
        ctx: &'rc Context,
        _: &mut RenderContext<'reg, 'rc>,
    ) -> Result<ScopedJson<'reg, 'rc>, RenderError> {
        let name = str_param(h, 0)?;
        let data = opt_param(h, 1).cloned().unwrap_or_else(|| ctx.data().clone());

        let depth = self.depth.fetch_add(1, Ordering::SeqCst) + 1;
        let rendered = if depth > MAX_INCLUDE_DEPTH {
            Err(self.failures.fail(Failure::TooComplex(format!(
                "include \"{name}\" nested deeper than {MAX_INCLUDE_DEPTH}"
            ))))
        } else if !r.has_template(name) {
            Err(self.failures.fail(Failure::Eval {
                message: format!("include: no partial named \"{name}\""),
                path: None,
            }))
        } else {
            r.render(name, &data)
        };
        self.depth.fetch_sub(1, Ordering::SeqCst);
        rendered.map(|s| ScopedJson::Derived(Value::String(s)))
    }
}

fn register_data(registrar: &mut Registrar<'_, '_>, env: &HelperEnv) {
    registrar.helper(
        "include",
        Include {
            depth: AtomicUsize::new(0),
            failures: env.failures.clone(),
        },
    );

    for name in ["toYaml", "yaml"] {
        registrar.value(name, |h, _| to_yaml(param(h, 0)?).map(Value::String));
    }
    registrar.value("fromYaml", |h, _| {
        let source = str_param(h, 0)?;
        serde_yaml::from_str::<Value>(source)
            .map_err(|e| RenderError::new(format!("fromYaml: {e}")))
    });
    registrar.value("toJson", |h, _| {
        serde_json::to_string(param(h, 0)?)
            .map(Value::String)
            .map_err(|e| RenderError::new(format!("toJson: {e}")))
    });
    registrar.value("fromJson", |h, _| {
        serde_json::from_str::<Value>(str_param(h, 0)?)
            .map_err(|e| RenderError::new(format!("fromJson: {e}")))
    });
    registrar.value("list", |h, _| {
        Ok(Value::Array(h.params().iter().map(|p| p.value().clone()).collect()))
    });
    registrar.value("dict", |h, _| {
        let params = h.params();
        if params.len() % 2 != 0 {
            return Err(RenderError::new("dict: expected key/value pairs"));
        }
        let mut map = Map::new();
        for pair in params.chunks(2) {
            map.insert(as_text(pair[0].value()), pair[1].value().clone());
        }
        Ok(Value::Object(map))
    });
}

/// YAML text of a value without the trailing newline; null renders empty.
pub fn to_yaml(value: &Value) -> Result<String, RenderError> {
    if value.is_null() {
        return Ok(String::new());
    }
    let text = serde_yaml::to_string(value).map_err(|e| RenderError::new(format!("toYaml: {e}")))?;
    Ok(text.trim_end_matches('\n').to_string())
}

// ============================================================================
// Strings
// ============================================================================

/// Prefix every line with `width` spaces.
pub fn indent(width: usize, text: &str) -> String {
    let pad = " ".repeat(width);
    let mut out = String::with_capacity(text.len() + pad.len());
    for (i, line) in text.split('\n').enumerate() {
        if i > 0 {
            out.push('\n');
        }
        out.push_str(&pad);
        out.push_str(line);
    }
    out
}

/// Join path segments with `/`, collapsing duplicate separators.
pub fn path_join(segments: &[String]) -> String {
    let absolute = segments.first().is_some_and(|s| s.starts_with('/'));
    let joined = segments
        .iter()
        .flat_map(|s| s.split('/'))
        .filter(|s| !s.is_empty() && *s != ".")
        .collect::<Vec<_>>()
        .join("/");
    if absolute {
        format!("/{joined}")
    } else {
        joined
    }
}

fn register_strings(registrar: &mut Registrar<'_, '_>, env: &HelperEnv) {
    registrar.value("indent", |h, _| {
        let width = usize::try_from(int_param(h, 0)?).unwrap_or(0);
        Ok(Value::String(indent(width, &text_param(h, 1)?)))
    });
    registrar.value("nindent", |h, _| {
        let width = usize::try_from(int_param(h, 0)?).unwrap_or(0);
        Ok(Value::String(format!("\n{}", indent(width, &text_param(h, 1)?))))
    });
    registrar.value("trim", |h, _| Ok(Value::String(text_param(h, 0)?.trim().to_string())));
    registrar.value("quote", |h, _| {
        Ok(Value::String(Value::String(text_param(h, 0)?).to_string()))
    });
    registrar.value("squote", |h, _| {
        Ok(Value::String(format!("'{}'", text_param(h, 0)?.replace('\'', "''"))))
    });
    registrar.value("upper", |h, _| Ok(Value::String(text_param(h, 0)?.to_uppercase())));
    registrar.value("lower", |h, _| Ok(Value::String(text_param(h, 0)?.to_lowercase())));
    registrar.value("replace", |h, _| {
        let (old, new, text) = (text_param(h, 0)?, text_param(h, 1)?, text_param(h, 2)?);
        Ok(Value::String(text.replace(&old, &new)))
    });
    registrar.value("join", |h, _| {
        let sep = text_param(h, 0)?;
        let joined = match param(h, 1)? {
            Value::Array(items) => items.iter().map(as_text).collect::<Vec<_>>().join(&sep),
            other => as_text(other),
        };
        Ok(Value::String(joined))
    });
    registrar.value("split", |h, _| {
        let (sep, text) = (text_param(h, 0)?, text_param(h, 1)?);
        if text.is_empty() {
            return Ok(Value::Array(Vec::new()));
        }
        Ok(Value::Array(
            text.split(sep.as_str()).map(|s| Value::String(s.to_string())).collect(),
        ))
    });
    registrar.value("hasPrefix", |h, _| {
        Ok(Value::Bool(text_param(h, 1)?.starts_with(&text_param(h, 0)?)))
    });
    registrar.value("hasSuffix", |h, _| {
        Ok(Value::Bool(text_param(h, 1)?.ends_with(&text_param(h, 0)?)))
    });
    registrar.value("contains", |h, _| {
        let needle = param(h, 0)?;
        let found = match param(h, 1)? {
            Value::Array(items) => items.contains(needle),
            Value::Object(map) => map.contains_key(&as_text(needle)),
            other => as_text(other).contains(&as_text(needle)),
        };
        Ok(Value::Bool(found))
    });
    registrar.value("pathJoin", |h, _| {
        let segments: Vec<String> = h.params().iter().map(|p| as_text(p.value())).collect();
        Ok(Value::String(path_join(&segments)))
    });
    registrar.value("b64enc", |h, _| Ok(Value::String(STANDARD.encode(text_param(h, 0)?))));
    registrar.value("b64dec", |h, _| {
        let bytes = STANDARD
            .decode(text_param(h, 0)?.trim())
            .map_err(|e| RenderError::new(format!("b64dec: {e}")))?;
        String::from_utf8(bytes)
            .map(Value::String)
            .map_err(|_| RenderError::new("b64dec: decoded data is not UTF-8"))
    });

    let now = env.now;
    registrar.value("now", move |h, _| {
        let format = match opt_param(h, 0) {
            Some(value) => as_text(value),
            None => "%Y-%m-%dT%H:%M:%SZ".to_string(),
        };
        let mut out = String::new();
        write!(out, "{}", now.format(&format))
            .map_err(|_| RenderError::new(format!("now: invalid format '{format}'")))?;
        Ok(Value::String(out))
    });
}

// ============================================================================
// Numbers
// ============================================================================

fn numbers(h: &Helper<'_, '_>) -> Result<Vec<i64>, RenderError> {
    (0..h.params().len()).map(|i| int_param(h, i)).collect()
}

fn number(n: i64) -> Value {
    Value::Number(Number::from(n))
}

fn register_numbers(registrar: &mut Registrar<'_, '_>) {
    registrar.value("add", |h, _| {
        numbers(h)?
            .into_iter()
            .try_fold(0i64, i64::checked_add)
            .map(number)
            .ok_or_else(|| RenderError::new("add: overflow"))
    });
    registrar.value("mul", |h, _| {
        numbers(h)?
            .into_iter()
            .try_fold(1i64, i64::checked_mul)
            .map(number)
            .ok_or_else(|| RenderError::new("mul: overflow"))
    });
    registrar.value("sub", |h, _| {
        int_param(h, 0)?
            .checked_sub(int_param(h, 1)?)
            .map(number)
            .ok_or_else(|| RenderError::new("sub: overflow"))
    });
    registrar.value("div", |h, _| {
        int_param(h, 0)?
            .checked_div(int_param(h, 1)?)
            .map(number)
            .ok_or_else(|| RenderError::new("div: division by zero"))
    });
    registrar.value("mod", |h, _| {
        int_param(h, 0)?
            .checked_rem(int_param(h, 1)?)
            .map(number)
            .ok_or_else(|| RenderError::new("mod: division by zero"))
    });
    registrar.value("max", |h, _| {
        numbers(h)?
            .into_iter()
            .max()
            .map(number)
            .ok_or_else(|| RenderError::new("max: no arguments"))
    });
    registrar.value("min", |h, _| {
        numbers(h)?
            .into_iter()
            .min()
            .map(number)
            .ok_or_else(|| RenderError::new("min: no arguments"))
    });
}

#[cfg(test)]
mod tests {
    use super::super::testing::render;
    use super::*;
    use serde_json::json;

    #[test]
    fn test_to_yaml_and_indent() {
        let data = json!({"Values": {"certSANs": ["a.example", "b.example"]}});
        let out = render("certSANs:{{nindent 2 (toYaml Values.certSANs)}}", &data).unwrap();
        assert_eq!(out, "certSANs:\n  - a.example\n  - b.example");
        assert_eq!(render("{{toYaml Values.missing}}", &data).unwrap(), "");
    }

    #[test]
    fn test_indent_pure() {
        assert_eq!(indent(2, "a\nb"), "  a\n  b");
        assert_eq!(indent(0, "x"), "x");
    }

    #[test]
    fn test_from_yaml_json() {
        let data = json!({"Values": {"doc": "a: 1\nb: [x]\n", "js": "{\"k\":true}"}});
        assert_eq!(render("{{lookup (fromYaml Values.doc) \"a\"}}", &data).unwrap(), "1");
        assert_eq!(render("{{#if (lookup (fromJson Values.js) \"k\")}}t{{/if}}", &data).unwrap(), "t");
        assert_eq!(render("{{toJson (list 1 \"a\")}}", &data).unwrap(), "[1,\"a\"]");
    }

    #[test]
    fn test_dict() {
        assert_eq!(
            render("{{toJson (dict \"a\" 1 \"b\" \"x\")}}", &json!({})).unwrap(),
            "{\"a\":1,\"b\":\"x\"}"
        );
        assert!(render("{{dict \"a\"}}", &json!({})).is_err());
    }

    #[test]
    fn test_string_helpers() {
        let data = json!({"s": " Talos ", "csv": "a,b,c", "q": "a\"b", "it": "it's"});
        assert_eq!(render("{{trim s}}", &data).unwrap(), "Talos");
        assert_eq!(render("{{upper (trim s)}}", &data).unwrap(), "TALOS");
        assert_eq!(render("{{lower \"AbC\"}}", &data).unwrap(), "abc");
        assert_eq!(render("{{quote q}}", &data).unwrap(), "\"a\\\"b\"");
        assert_eq!(render("{{squote it}}", &data).unwrap(), "'it''s'");
        assert_eq!(render("{{replace \",\" \";\" csv}}", &data).unwrap(), "a;b;c");
        assert_eq!(render("{{join \"-\" (split \",\" csv)}}", &data).unwrap(), "a-b-c");
        assert_eq!(render("{{#if (hasPrefix \"a,\" csv)}}y{{/if}}", &data).unwrap(), "y");
        assert_eq!(render("{{#if (hasSuffix \",c\" csv)}}y{{/if}}", &data).unwrap(), "y");
        assert_eq!(render("{{#if (contains \"b\" csv)}}y{{/if}}", &data).unwrap(), "y");
        assert_eq!(render("{{#if (contains \"b\" (split \",\" csv))}}y{{/if}}", &data).unwrap(), "y");
    }

    #[test]
    fn test_path_join() {
        assert_eq!(path_join(&["/var/".into(), "/lib".into(), "etcd".into()]), "/var/lib/etcd");
        assert_eq!(path_join(&["a".into(), "./b".into()]), "a/b");
    }

    #[test]
    fn test_base64() {
        assert_eq!(render("{{b64enc \"talos\"}}", &json!({})).unwrap(), "dGFsb3M=");
        assert_eq!(render("{{b64dec (b64enc \"talos\")}}", &json!({})).unwrap(), "talos");
        assert!(render("{{b64dec \"***\"}}", &json!({})).is_err());
    }

    #[test]
    fn test_now_uses_render_clock() {
        assert_eq!(render("{{now \"%Y-%m-%d\"}}", &json!({})).unwrap(), "2025-03-04");
        assert_eq!(render("{{now}}", &json!({})).unwrap(), "2025-03-04T05:06:07Z");
        assert!(render("{{now \"%Q\"}}", &json!({})).is_err());
    }

    #[test]
    fn test_numbers() {
        let data = json!({});
        assert_eq!(render("{{add 1 2 3}}", &data).unwrap(), "6");
        assert_eq!(render("{{sub 10 4}}", &data).unwrap(), "6");
        assert_eq!(render("{{mul 2 3 4}}", &data).unwrap(), "24");
        assert_eq!(render("{{div 7 2}}", &data).unwrap(), "3");
        assert_eq!(render("{{mod 7 2}}", &data).unwrap(), "1");
        assert_eq!(render("{{max 1 9 3}}", &data).unwrap(), "9");
        assert_eq!(render("{{min 4 2 8}}", &data).unwrap(), "2");
        assert_eq!(render("{{add \"5\" 1}}", &data).unwrap(), "6");
        assert!(render("{{div 1 0}}", &data).is_err());
    }

    #[test]
    fn test_include_renders_partial() {
        use super::super::testing::{env_with, MapFacts};
        use std::sync::Arc;

        let env = env_with(Arc::new(MapFacts(json!({}))), None);
        let mut registry = Handlebars::new();
        registry.register_escape_fn(handlebars::no_escape);
        super::super::register(&mut registry, &env);
        registry.register_partial("labels", "a: {{x}}\nb: 2").unwrap();
        registry
            .register_template_string("t", "labels:{{nindent 2 (include \"labels\" .)}}")
            .unwrap();
        assert_eq!(
            registry.render("t", &json!({"x": 1})).unwrap(),
            "labels:\n  a: 1\n  b: 2"
        );

        registry.register_partial("loop", "{{include \"loop\" .}}").unwrap();
        registry.register_template_string("l", "{{include \"loop\" .}}").unwrap();
        assert!(registry.render("l", &json!({})).is_err());
        assert!(matches!(env.failures.take(), Some(Failure::TooComplex(_))));
    }
}
