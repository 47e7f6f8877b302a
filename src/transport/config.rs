//! JSON config tree for the transport engine, for each role it's asked to
//! play (spec.md §4.1).
//!
//! Every role renders the same shape: one `dokodemo-door` inbound on
//! loopback listening at port `p`, one `vless` outbound over
//! `splithttp`+TLS to the relay. `p` is where the caller (ReverseTunnel,
//! ForwardTunnel, RelayControl) dials; the dokodemo inbound's own target
//! `q` is baked into its settings rather than taken from a redirect, so it
//! becomes the destination the VLESS outbound asks the relay to reach —
//! the relay's real sshd for server/control sessions, or the server's
//! published reverse-forward port for client sessions. None of that
//! relay-side routing is ours to configure; this module only renders the
//! local half.

use serde_json::{json, Value};

use crate::config::XrayConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportRole {
    /// Wraps the server's dial to the relay's sshd, which ReverseTunnel
    /// then treats as if it dialed the relay directly.
    Server,
    /// Wraps the client's dial to the server's published port on the
    /// relay, which ForwardTunnel treats as if it dialed the relay
    /// directly.
    Client,
    /// Ephemeral, short-lived: wraps a single connection to the relay's
    /// sshd for RelayControl (C6), not user traffic.
    Control,
}

impl TransportRole {
    fn tag(self) -> &'static str {
        match self {
            TransportRole::Server => "tw-server",
            TransportRole::Client => "tw-client",
            TransportRole::Control => "tw-control",
        }
    }
}

/// Fixed local listen port for client-mode Transport instances (spec.md
/// §4.1).
pub const CLIENT_TRANSPORT_PORT: u16 = 54001;
/// Fixed local listen port for control-mode Transport instances.
pub const CONTROL_TRANSPORT_PORT: u16 = 59000;

#[derive(Debug, Clone)]
pub struct TransportParams {
    pub role: TransportRole,
    /// `p`: the loopback port callers dial.
    pub local_port: u16,
    /// `q`: the destination baked into the dokodemo inbound, which
    /// becomes the VLESS outbound's requested target on the relay side.
    pub target_port: u16,
    pub relay_host: String,
    pub relay_port: u16,
    pub path: String,
    pub uuid: String,
    /// Optional upstream HTTP proxy the outbound dials through, for
    /// operators behind a corporate egress proxy (spec.md §6 `proxy.url`).
    pub proxy_url: Option<String>,
}

impl TransportParams {
    /// `p = sshPort + 1`, `q = relay_ssh_port` (spec.md §4.1, server mode).
    pub fn for_server(
        ssh_port: u16,
        relay_ssh_port: u16,
        xray: &XrayConfig,
        proxy_url: Option<String>,
    ) -> Self {
        Self {
            role: TransportRole::Server,
            local_port: ssh_port + 1,
            target_port: relay_ssh_port,
            relay_host: xray.relay_host.clone(),
            relay_port: xray.relay_port,
            path: xray.path.clone(),
            uuid: xray.uuid.clone(),
            proxy_url,
        }
    }

    /// `p = 54001` fixed, `q = server_ssh_port` (spec.md §4.1, client
    /// mode).
    pub fn for_client(server_ssh_port: u16, xray: &XrayConfig, proxy_url: Option<String>) -> Self {
        Self {
            role: TransportRole::Client,
            local_port: CLIENT_TRANSPORT_PORT,
            target_port: server_ssh_port,
            relay_host: xray.relay_host.clone(),
            relay_port: xray.relay_port,
            path: xray.path.clone(),
            uuid: xray.uuid.clone(),
            proxy_url,
        }
    }

    /// `p = 59000` fixed, `q = relay_ssh_port` (spec.md §4.1, control
    /// mode).
    pub fn for_control(
        relay_ssh_port: u16,
        xray: &XrayConfig,
        proxy_url: Option<String>,
    ) -> Self {
        Self {
            role: TransportRole::Control,
            local_port: CONTROL_TRANSPORT_PORT,
            target_port: relay_ssh_port,
            relay_host: xray.relay_host.clone(),
            relay_port: xray.relay_port,
            path: xray.path.clone(),
            uuid: xray.uuid.clone(),
            proxy_url,
        }
    }
}

pub fn build_config(params: &TransportParams) -> Value {
    let out_tag = format!("{}-out", params.role.tag());
    let in_tag = format!("{}-in", params.role.tag());

    let mut outbounds = vec![vless_outbound(&out_tag, params)];
    let mut rule_outbound = out_tag.clone();

    if let Some(proxy_url) = params.proxy_url.as_deref().filter(|u| !u.is_empty()) {
        let proxy_tag = format!("{}-proxy", params.role.tag());
        outbounds.push(http_proxy_outbound(&proxy_tag, proxy_url));
        // The vless outbound tunnels through the proxy outbound rather than
        // dialing the relay directly.
        if let Some(stream) = outbounds[0].get_mut("streamSettings") {
            stream["sockopt"] = json!({ "dialerProxy": proxy_tag });
        }
        rule_outbound = out_tag.clone();
    }

    json!({
        "inbounds": [{
            "listen": "127.0.0.1",
            "port": params.local_port,
            "protocol": "dokodemo-door",
            "settings": {
                "address": "127.0.0.1",
                "port": params.target_port,
                "network": "tcp",
                "followRedirect": false
            },
            "tag": in_tag
        }],
        "outbounds": outbounds,
        "routing": {
            "domainStrategy": "AsIs",
            "rules": [{
                "type": "field",
                "inboundTag": [in_tag],
                "outboundTag": rule_outbound
            }]
        }
    })
}

fn vless_outbound(tag: &str, params: &TransportParams) -> Value {
    json!({
        "tag": tag,
        "protocol": "vless",
        "settings": {
            "vnext": [{
                "address": params.relay_host,
                "port": params.relay_port,
                "users": [{
                    "id": params.uuid,
                    "encryption": "none"
                }]
            }]
        },
        "streamSettings": {
            "network": "splithttp",
            "security": "tls",
            "splithttpSettings": {
                "path": params.path
            },
            "tlsSettings": {
                "serverName": params.relay_host,
                "allowInsecure": false
            }
        }
    })
}

fn http_proxy_outbound(tag: &str, proxy_url: &str) -> Value {
    let (address, port) = split_proxy_url(proxy_url);
    json!({
        "tag": tag,
        "protocol": "http",
        "settings": {
            "servers": [{
                "address": address,
                "port": port
            }]
        }
    })
}

fn split_proxy_url(url: &str) -> (String, u16) {
    let stripped = url
        .trim_start_matches("http://")
        .trim_start_matches("https://");
    match stripped.rsplit_once(':') {
        Some((host, port)) => (host.to_string(), port.parse().unwrap_or(8080)),
        None => (stripped.to_string(), 8080),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn xray() -> XrayConfig {
        XrayConfig {
            uuid: "11111111-1111-1111-1111-111111111111".into(),
            relay_host: "relay.example.com".into(),
            relay_port: 443,
            path: "/tw".into(),
        }
    }

    #[test]
    fn server_params_derive_ports_from_spec_formula() {
        let params = TransportParams::for_server(2222, 22, &xray(), None);
        assert_eq!(params.local_port, 2223);
        assert_eq!(params.target_port, 22);
    }

    #[test]
    fn client_params_use_fixed_local_port() {
        let params = TransportParams::for_client(2222, &xray(), None);
        assert_eq!(params.local_port, CLIENT_TRANSPORT_PORT);
        assert_eq!(params.target_port, 2222);
    }

    #[test]
    fn server_config_has_one_inbound_and_outbound() {
        let params = TransportParams::for_server(2222, 22, &xray(), None);
        let cfg = build_config(&params);
        assert_eq!(cfg["inbounds"].as_array().unwrap().len(), 1);
        assert_eq!(cfg["outbounds"].as_array().unwrap().len(), 1);
        assert_eq!(cfg["outbounds"][0]["protocol"], "vless");
        assert_eq!(cfg["inbounds"][0]["settings"]["port"], 22);
    }

    #[test]
    fn proxy_adds_second_outbound_and_dialer_proxy() {
        let mut params = TransportParams::for_client(2222, &xray(), None);
        params.proxy_url = Some("http://proxy.internal:8888".into());
        let cfg = build_config(&params);
        assert_eq!(cfg["outbounds"].as_array().unwrap().len(), 2);
        assert!(cfg["outbounds"][0]["streamSettings"]["sockopt"]["dialerProxy"].is_string());
    }

    #[test]
    fn control_role_uses_distinct_tag_and_fixed_port() {
        let params = TransportParams::for_control(22, &xray(), None);
        assert_eq!(params.local_port, CONTROL_TRANSPORT_PORT);
        let cfg = build_config(&params);
        let tag = cfg["outbounds"][0]["tag"].as_str().unwrap();
        assert!(tag.starts_with("tw-control"));
    }
}
