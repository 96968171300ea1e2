//! Template function library
//!
//! Every helper is wrapped in [`Metered`] so each call consumes one budget
//! step. Helpers that produce data implement `call_inner`, which lets them
//! be used both directly (`{{ toYaml x }}`) and as subexpressions
//! (`{{#each (split "," x)}}`).

mod collab;
mod net;
mod text;
mod values;

use std::sync::Arc;

use chrono::{DateTime, Utc};
use handlebars::{
    Context, Handlebars, Helper, HelperDef, HelperResult, Output, RenderContext, RenderError,
    ScopedJson,
};
use serde_json::Value;

use super::budget::{Budget, FailureSlot};
use crate::discovery::FactSource;
use crate::secrets::SecretsBundle;

/// Collaborators and per-render state shared by the helpers.
#[derive(Clone)]
pub struct HelperEnv {
    pub budget: Arc<Budget>,
    pub failures: FailureSlot,
    pub facts: Arc<dyn FactSource>,
    pub secrets: Option<Arc<SecretsBundle>>,
    pub now: DateTime<Utc>,
}

/// Charges one budget step per call, then defers to the wrapped helper.
pub struct Metered<H> {
    inner: H,
    budget: Arc<Budget>,
}

impl<H: HelperDef + Send + Sync> HelperDef for Metered<H> {
    fn call_inner<'reg: 'rc, 'rc>(
        &self,
        h: &Helper<'reg, 'rc>,
        r: &'reg Handlebars<'reg>,
        ctx: &'rc Context,
        rc: &mut RenderContext<'reg, 'rc>,
    ) -> Result<ScopedJson<'reg, 'rc>, RenderError> {
        self.budget.tick()?;
        self.inner.call_inner(h, r, ctx, rc)
    }

    fn call<'reg: 'rc, 'rc>(
        &self,
        h: &Helper<'reg, 'rc>,
        r: &'reg Handlebars<'reg>,
        ctx: &'rc Context,
        rc: &mut RenderContext<'reg, 'rc>,
        out: &mut dyn Output,
    ) -> HelperResult {
        self.budget.tick()?;
        self.inner.call(h, r, ctx, rc, out)
    }
}

/// A helper computing a JSON value from its parameters and the root data.
pub struct ValueHelper<F>(pub F);

impl<F> HelperDef for ValueHelper<F>
where
    F: Fn(&Helper<'_, '_>, &Context) -> Result<Value, RenderError> + Send + Sync,
{
    fn call_inner<'reg: 'rc, 'rc>(
        &self,
        h: &Helper<'reg, 'rc>,
        _: &'reg Handlebars<'reg>,
        ctx: &'rc Context,
        _: &mut RenderContext<'reg, 'rc>,
    ) -> Result<ScopedJson<'reg, 'rc>, RenderError> {
        (self.0)(h, ctx).map(ScopedJson::Derived)
    }
}

/// Registers helpers on a registry, metering each one.
pub struct Registrar<'a, 'reg> {
    registry: &'a mut Handlebars<'reg>,
    budget: Arc<Budget>,
}

impl<'a, 'reg> Registrar<'a, 'reg> {
    pub fn helper<H: HelperDef + Send + Sync + 'reg>(&mut self, name: &str, helper: H) {
        let metered = Metered {
            inner: helper,
            budget: self.budget.clone(),
        };
        self.registry.register_helper(name, Box::new(metered));
    }

    pub fn value<F>(&mut self, name: &str, f: F)
    where
        F: Fn(&Helper<'_, '_>, &Context) -> Result<Value, RenderError> + Send + Sync + 'reg,
    {
        self.helper(name, ValueHelper(f));
    }
}

/// Install the whole function library.
pub fn register(registry: &mut Handlebars<'_>, env: &HelperEnv) {
    let mut registrar = Registrar {
        registry,
        budget: env.budget.clone(),
    };
    values::register(&mut registrar, env);
    collab::register(&mut registrar, env);
    text::register(&mut registrar, env);
    net::register(&mut registrar);
}

// ============================================================================
// Parameter access
// ============================================================================

pub(crate) fn param<'a>(h: &'a Helper<'_, '_>, index: usize) -> Result<&'a Value, RenderError> {
    h.param(index).map(|p| p.value()).ok_or_else(|| {
        RenderError::new(format!("{}: missing parameter #{}", h.name(), index + 1))
    })
}

pub(crate) fn opt_param<'a>(h: &'a Helper<'_, '_>, index: usize) -> Option<&'a Value> {
    h.param(index).map(|p| p.value())
}

pub(crate) fn str_param<'a>(h: &'a Helper<'_, '_>, index: usize) -> Result<&'a str, RenderError> {
    param(h, index)?.as_str().ok_or_else(|| {
        RenderError::new(format!("{}: parameter #{} must be a string", h.name(), index + 1))
    })
}

/// A parameter rendered as text: strings verbatim, numbers and booleans
/// formatted, null empty.
pub(crate) fn text_param(h: &Helper<'_, '_>, index: usize) -> Result<String, RenderError> {
    Ok(as_text(param(h, index)?))
}

pub(crate) fn as_text(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

pub(crate) fn int_param(h: &Helper<'_, '_>, index: usize) -> Result<i64, RenderError> {
    let value = param(h, index)?;
    match value {
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().map(|f| f as i64))
            .ok_or_else(|| RenderError::new(format!("{}: {n} is not an integer", h.name()))),
        Value::String(s) => s.trim().parse::<i64>().map_err(|_| {
            RenderError::new(format!("{}: '{s}' is not an integer", h.name()))
        }),
        other => Err(RenderError::new(format!(
            "{}: parameter #{} must be a number, got {other}",
            h.name(),
            index + 1
        ))),
    }
}

/// Strings out of a list parameter, or a single string as a one-element list.
pub(crate) fn string_list(value: &Value) -> Vec<String> {
    match value {
        Value::Array(items) => items.iter().map(as_text).collect(),
        Value::Null => Vec::new(),
        other => vec![as_text(other)],
    }
}

/// Handlebars truthiness, also used by `default` and `required`.
pub(crate) fn is_empty(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Bool(b) => !b,
        Value::String(s) => s.is_empty(),
        Value::Array(a) => a.is_empty(),
        Value::Object(o) => o.is_empty(),
        Value::Number(_) => false,
    }
}
