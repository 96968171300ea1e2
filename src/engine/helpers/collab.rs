//! Helpers backed by collaborators: discovery, secrets, modeline

use serde_json::Value;

use super::{str_param, string_list, HelperEnv, Registrar};
use crate::discovery::FACT_NAMES;
use crate::engine::budget::Failure;
use crate::modeline::{generate, Modeline};

pub(super) fn register(registrar: &mut Registrar<'_, '_>, env: &HelperEnv) {
    let facts = env.facts.clone();
    let failures = env.failures.clone();
    registrar.value("discovered", move |h, _| {
        let fact = str_param(h, 0)?;
        if !FACT_NAMES.contains(&fact) {
            return Err(failures.fail(Failure::Eval {
                message: format!(
                    "unknown fact \"{fact}\", expected one of {}",
                    FACT_NAMES.join(", ")
                ),
                path: Some(fact.to_string()),
            }));
        }
        let fallback = h
            .hash_get("fallback")
            .map(|p| string_list(p.value()))
            .unwrap_or_default();
        facts.fact(fact, &fallback).map_err(|source| {
            failures.fail(Failure::Discovery {
                fact: fact.to_string(),
                source,
            })
        })
    });

    let secrets = env.secrets.clone();
    let failures = env.failures.clone();
    registrar.value("secret", move |h, _| {
        let path = str_param(h, 0)?;
        match &secrets {
            None => Err(failures.fail(Failure::SecretsMissing(path.to_string()))),
            Some(bundle) => bundle
                .field(path)
                .map(Value::String)
                .map_err(|_| failures.fail(Failure::SecretPathMissing(path.to_string()))),
        }
    });

    let secrets = env.secrets.clone();
    registrar.value("has_secret", move |h, _| {
        let path = str_param(h, 0)?;
        let found = secrets
            .as_ref()
            .is_some_and(|bundle| bundle.field(path).is_ok_and(|v| !v.is_empty()));
        Ok(Value::Bool(found))
    });

    let available = env.secrets.is_some();
    registrar.value("secrets_available", move |_, _| Ok(Value::Bool(available)));

    registrar.value("modeline", |h, _| {
        let list = |key: &str| {
            h.hash_get(key)
                .map(|p| string_list(p.value()))
                .unwrap_or_default()
        };
        let mut modeline = Modeline::new(list("nodes"), list("endpoints"), list("templates"));
        if let Some(user) = h.hash_get("user").and_then(|p| p.value().as_str()) {
            modeline = modeline.with_user(user);
        }
        Ok(Value::String(generate(&modeline)))
    });
}
