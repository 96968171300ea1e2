//! Network helpers over CIDR strings

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use handlebars::RenderError;
use ipnet::IpNet;
use serde_json::{json, Value};

use super::{as_text, int_param, param, string_list, text_param, Registrar};

pub(super) fn register(registrar: &mut Registrar<'_, '_>) {
    registrar.value("cidrContains", |h, _| {
        let net = parse_net(&text_param(h, 0)?)?;
        let inner = parse_net(&text_param(h, 1)?)?;
        Ok(Value::Bool(net.contains(&inner)))
    });
    registrar.value("cidrIntersects", |h, _| {
        let a = parse_net(&text_param(h, 0)?)?;
        let b = parse_net(&text_param(h, 1)?)?;
        Ok(Value::Bool(intersects(&a, &b)))
    });
    registrar.value("cidrMerge", |h, _| {
        let nets = parse_all(&string_list(param(h, 0)?))?;
        Ok(to_strings(IpNet::aggregate(&nets)))
    });
    registrar.value("cidrExclude", |h, _| {
        let bases = parse_all(&string_list(param(h, 0)?))?;
        let excluded = parse_all(&string_list(param(h, 1)?))?;
        let mut remaining = Vec::new();
        for base in bases {
            remaining.extend(exclude(base, &excluded));
        }
        Ok(to_strings(IpNet::aggregate(&remaining)))
    });
    registrar.value("cidrHost", |h, _| {
        let net = parse_net(&text_param(h, 0)?)?;
        host(&net, int_param(h, 1)?)
            .map(|ip| Value::String(ip.to_string()))
            .map_err(RenderError::new)
    });
    registrar.value("cidrNetwork", |h, _| {
        Ok(Value::String(parse_net(&text_param(h, 0)?)?.trunc().to_string()))
    });
    registrar.value("cidrPrefix", |h, _| {
        Ok(json!(parse_net(&text_param(h, 0)?)?.prefix_len()))
    });
    registrar.value("cidrRange", |h, _| {
        let (start, end) = range(&parse_net(&text_param(h, 0)?)?);
        Ok(json!({"start": start.to_string(), "end": end.to_string()}))
    });
    registrar.value("ipOf", |h, _| {
        let text = as_text(param(h, 0)?);
        Ok(Value::String(parse_net(&text)?.addr().to_string()))
    });
}

// ============================================================================
// SBIO: Pure functions (no I/O)
// ============================================================================

/// Parse `a.b.c.d/n`, or a bare address as a host route.
pub fn parse_net(text: &str) -> Result<IpNet, RenderError> {
    let text = text.trim();
    if let Ok(net) = text.parse::<IpNet>() {
        return Ok(net);
    }
    text.parse::<IpAddr>()
        .map(IpNet::from)
        .map_err(|_| RenderError::new(format!("'{text}' is not a CIDR or IP address")))
}

fn parse_all(items: &[String]) -> Result<Vec<IpNet>, RenderError> {
    items.iter().map(|s| parse_net(s)).collect()
}

fn to_strings(nets: Vec<IpNet>) -> Value {
    Value::Array(nets.into_iter().map(|n| Value::String(n.to_string())).collect())
}

pub fn intersects(a: &IpNet, b: &IpNet) -> bool {
    a.contains(&b.network()) || b.contains(&a.network())
}

/// `base` minus every network in `excluded`, as a list of CIDRs.
pub fn exclude(base: IpNet, excluded: &[IpNet]) -> Vec<IpNet> {
    let mut pending = vec![base.trunc()];
    let mut kept = Vec::new();
    while let Some(net) = pending.pop() {
        match excluded.iter().find(|ex| intersects(&net, ex)) {
            None => kept.push(net),
            Some(ex) if ex.contains(&net) => {}
            Some(_) => {
                if let Ok(halves) = net.subnets(net.prefix_len() + 1) {
                    pending.extend(halves);
                }
            }
        }
    }
    kept.sort();
    kept
}

/// The `n`th address of a network; negative `n` counts back from the end.
pub fn host(net: &IpNet, n: i64) -> Result<IpAddr, String> {
    let out_of_range = || format!("host number {n} is outside {net}");
    match net {
        IpNet::V4(v4) => {
            let size = 1u64 << (32 - u32::from(v4.prefix_len()));
            let index = if n < 0 { size as i64 + n } else { n };
            if index < 0 || index as u64 >= size {
                return Err(out_of_range());
            }
            let base = u32::from(v4.network());
            Ok(IpAddr::V4(Ipv4Addr::from(base + index as u32)))
        }
        IpNet::V6(v6) => {
            let base = u128::from(v6.network());
            let size = 1u128.checked_shl(128 - u32::from(v6.prefix_len()));
            let index = match (n < 0, size) {
                (false, Some(size)) if (n as u128) < size => n as u128,
                (false, None) => n as u128,
                (true, Some(size)) if n.unsigned_abs() as u128 <= size => size - n.unsigned_abs() as u128,
                (true, None) => u128::MAX - (n.unsigned_abs() as u128 - 1),
                _ => return Err(out_of_range()),
            };
            Ok(IpAddr::V6(Ipv6Addr::from(base + index)))
        }
    }
}

/// First and last usable addresses. IPv4 networks wider than /31 skip the
/// network and broadcast addresses.
pub fn range(net: &IpNet) -> (IpAddr, IpAddr) {
    match net {
        IpNet::V4(v4) if v4.prefix_len() < 31 => {
            let start = Ipv4Addr::from(u32::from(v4.network()) + 1);
            let end = Ipv4Addr::from(u32::from(v4.broadcast()) - 1);
            (IpAddr::V4(start), IpAddr::V4(end))
        }
        IpNet::V4(v4) => (IpAddr::V4(v4.network()), IpAddr::V4(v4.broadcast())),
        IpNet::V6(v6) => (IpAddr::V6(v6.network()), IpAddr::V6(v6.broadcast())),
    }
}
