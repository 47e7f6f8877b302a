//! Untyped JSON-document surgery over the relay's transport-engine config
//! (spec.md §4.6, §9 "Dynamic JSON-document surgery"). The remote schema
//! evolves independently of this crate, so nothing here binds to a
//! generated type — every lookup walks a `serde_json::Value` tree.

use serde_json::{json, Value};

/// Finds the VLESS inbound: tag `vless-in` first, protocol `vless` as
/// fallback (spec.md §3, §4.6).
pub fn find_vless_inbound(config: &mut Value) -> Option<&mut Value> {
    let inbounds = config.get_mut("inbounds")?.as_array_mut()?;

    if let Some(pos) = inbounds
        .iter()
        .position(|ib| ib.get("tag").and_then(Value::as_str) == Some("vless-in"))
    {
        return inbounds.get_mut(pos);
    }

    let pos = inbounds
        .iter()
        .position(|ib| ib.get("protocol").and_then(Value::as_str) == Some("vless"))?;
    inbounds.get_mut(pos)
}

fn clients_mut(inbound: &mut Value) -> Option<&mut Vec<Value>> {
    inbound
        .get_mut("settings")?
        .get_mut("clients")?
        .as_array_mut()
}

fn client_id(client: &Value) -> Option<&str> {
    client.get("id").and_then(Value::as_str)
}

/// Appends `{id, email: id}` for every id not already present. Returns the
/// number actually added (spec.md invariant: clients deduplicated by id).
pub fn add_clients(inbound: &mut Value, ids: &[String]) -> usize {
    let Some(clients) = clients_mut(inbound) else {
        return 0;
    };
    let mut added = 0;
    for id in ids {
        if clients.iter().any(|c| client_id(c) == Some(id.as_str())) {
            continue;
        }
        clients.push(json!({ "id": id, "email": id }));
        added += 1;
    }
    added
}

/// Removes any client whose id is in `ids`. Returns the number removed.
pub fn remove_clients(inbound: &mut Value, ids: &[String]) -> usize {
    let Some(clients) = clients_mut(inbound) else {
        return 0;
    };
    let before = clients.len();
    clients.retain(|c| match client_id(c) {
        Some(id) => !ids.iter().any(|target| target == id),
        None => true,
    });
    before - clients.len()
}

/// Checks whether the stats block required by spec.md §4.6 `ensureStats`
/// is fully present: a `stats: {}` marker, `"StatsService"` in
/// `api.services`, and the four policy counters.
pub fn stats_configured(config: &Value) -> bool {
    config.get("stats").is_some()
        && config
            .get("api")
            .and_then(|api| api.get("services"))
            .and_then(Value::as_array)
            .is_some_and(|services| services.iter().any(|s| s.as_str() == Some("StatsService")))
        && config
            .pointer("/policy/system/statsInboundUplink")
            .and_then(Value::as_bool)
            == Some(true)
        && config
            .pointer("/policy/system/statsInboundDownlink")
            .and_then(Value::as_bool)
            == Some(true)
        && config
            .pointer("/policy/system/statsOutboundUplink")
            .and_then(Value::as_bool)
            == Some(true)
        && config
            .pointer("/policy/system/statsOutboundDownlink")
            .and_then(Value::as_bool)
            == Some(true)
        && config
            .pointer("/policy/levels/0/statsUserUplink")
            .and_then(Value::as_bool)
            == Some(true)
        && config
            .pointer("/policy/levels/0/statsUserDownlink")
            .and_then(Value::as_bool)
            == Some(true)
        && config
            .pointer("/policy/levels/0/statsUserOnline")
            .and_then(Value::as_bool)
            == Some(true)
}

/// Patches in the stats block spec.md §4.6 requires, leaving everything
/// else in the document untouched.
pub fn ensure_stats(config: &mut Value) {
    let obj = config.as_object_mut().expect("config root must be an object");
    obj.entry("stats").or_insert_with(|| json!({}));

    let api = obj.entry("api").or_insert_with(|| json!({ "services": [] }));
    let services = api
        .as_object_mut()
        .expect("api must be an object")
        .entry("services")
        .or_insert_with(|| json!([]));
    let services = services.as_array_mut().expect("services must be an array");
    if !services.iter().any(|s| s.as_str() == Some("StatsService")) {
        services.push(json!("StatsService"));
    }

    let policy = obj.entry("policy").or_insert_with(|| json!({}));
    let policy = policy.as_object_mut().expect("policy must be an object");

    let system = policy
        .entry("system")
        .or_insert_with(|| json!({}))
        .as_object_mut()
        .expect("policy.system must be an object");
    for key in [
        "statsInboundUplink",
        "statsInboundDownlink",
        "statsOutboundUplink",
        "statsOutboundDownlink",
    ] {
        system.insert(key.to_string(), json!(true));
    }

    let levels = policy
        .entry("levels")
        .or_insert_with(|| json!({}))
        .as_object_mut()
        .expect("policy.levels must be an object");
    let level0 = levels
        .entry("0")
        .or_insert_with(|| json!({}))
        .as_object_mut()
        .expect("policy.levels.0 must be an object");
    for key in ["statsUserUplink", "statsUserDownlink", "statsUserOnline"] {
        level0.insert(key.to_string(), json!(true));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_with_tagged_inbound() -> Value {
        json!({
            "inbounds": [
                { "tag": "other", "protocol": "http" },
                { "tag": "vless-in", "protocol": "vless", "settings": { "clients": [] } }
            ]
        })
    }

    #[test]
    fn finds_inbound_by_tag_first() {
        let mut config = config_with_tagged_inbound();
        let inbound = find_vless_inbound(&mut config).unwrap();
        assert_eq!(inbound["tag"], "vless-in");
    }

    #[test]
    fn falls_back_to_protocol_when_tag_absent() {
        let mut config = json!({
            "inbounds": [{ "protocol": "vless", "settings": { "clients": [] } }]
        });
        let inbound = find_vless_inbound(&mut config).unwrap();
        assert_eq!(inbound["protocol"], "vless");
    }

    #[test]
    fn add_clients_deduplicates_by_id() {
        let mut config = config_with_tagged_inbound();
        let inbound = find_vless_inbound(&mut config).unwrap();
        let added = add_clients(inbound, &["a".into(), "b".into(), "a".into()]);
        assert_eq!(added, 2);
        let added_again = add_clients(inbound, &["a".into()]);
        assert_eq!(added_again, 0);
        assert_eq!(inbound["settings"]["clients"].as_array().unwrap().len(), 2);
    }

    #[test]
    fn remove_clients_filters_by_id() {
        let mut config = config_with_tagged_inbound();
        let inbound = find_vless_inbound(&mut config).unwrap();
        add_clients(inbound, &["a".into(), "b".into()]);
        let removed = remove_clients(inbound, &["a".into()]);
        assert_eq!(removed, 1);
        assert_eq!(inbound["settings"]["clients"].as_array().unwrap().len(), 1);
    }

    #[test]
    fn stats_configured_detects_missing_block() {
        let config = json!({});
        assert!(!stats_configured(&config));
    }

    #[test]
    fn ensure_stats_makes_stats_configured_true() {
        let mut config = json!({"inbounds": []});
        ensure_stats(&mut config);
        assert!(stats_configured(&config));
    }
}
