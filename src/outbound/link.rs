//! Subscription link parsing
//!
//! Accepts the three supported schemes and normalizes them into a
//! [`ChainFile`]: `vless://` (user-info carries the identifier, the query
//! string carries transport and security options), `vmess://` (a single
//! base64 JSON payload) and `ss://` (base64 credentials with host:port and an
//! optional plugin query). Two links describing the same outbound produce
//! byte-identical outbound sections.

use std::collections::HashMap;

use base64::Engine;
use url::Url;

use crate::error::OutboundError;

use super::document::{
    ChainFile, ChainMetadata, GrpcSettings, HeaderEntry, HttpUpgradeSettings, Inbound, KcpHeader,
    KcpSettings, Outbound, Proxy, ProxyUser, RealitySettings, ServerEntry, ShadowsocksSettings,
    SplitHttpSettings, StreamSettings, TcpHeader, TcpRequest, TcpSettings, TlsSettings,
    VnextServer, VnextSettings, WsSettings,
};

/// Parse a subscription link into a chain file with the given inbound port
///
/// # Errors
///
/// `OutboundError::UnsupportedScheme` for unknown schemes,
/// `OutboundError::InvalidLink` for malformed payloads.
pub fn parse_link(link: &str, inbound_port: u16) -> Result<ChainFile, OutboundError> {
    let link = link.trim();
    if link.starts_with("vless://") {
        let params = parse_vless(link)?;
        Ok(generate_vless(&params, inbound_port))
    } else if link.starts_with("vmess://") {
        let params = parse_vmess(link)?;
        Ok(generate_vmess(&params, inbound_port))
    } else if link.starts_with("ss://") {
        let params = parse_ss(link)?;
        Ok(generate_ss(&params, inbound_port))
    } else {
        Err(OutboundError::UnsupportedScheme)
    }
}

/// Flat key/value view of a parsed link, before typing
type LinkParams = HashMap<&'static str, String>;

fn get<'a>(params: &'a LinkParams, key: &str) -> &'a str {
    params.get(key).map_or("", String::as_str)
}

fn parse_vless(link: &str) -> Result<LinkParams, OutboundError> {
    let url = Url::parse(link).map_err(|e| OutboundError::InvalidLink(e.to_string()))?;
    if url.scheme() != "vless" {
        return Err(OutboundError::InvalidLink("not a VLESS URL".into()));
    }

    let query: HashMap<String, String> = url
        .query_pairs()
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    let any = |keys: &[&str]| -> String {
        keys.iter()
            .filter_map(|k| query.get(*k))
            .find(|v| !v.is_empty())
            .cloned()
            .unwrap_or_default()
    };

    let mut tag = any(&["tag"]);
    if tag.is_empty() {
        tag = url.fragment().map(percent_decode).unwrap_or_default();
    }

    let mut params = LinkParams::new();
    params.insert("uuid", url.username().to_string());
    params.insert(
        "address",
        url.host_str().unwrap_or_default().to_string(),
    );
    params.insert("port", url.port().unwrap_or(443).to_string());
    params.insert("encryption", any(&["encryption"]));
    params.insert("security", any(&["security"]));
    params.insert("type", any(&["type", "transport", "network", "net"]));
    params.insert("headerType", any(&["headerType", "header"]));
    params.insert("path", any(&["path"]));
    params.insert("host", any(&["host"]));
    params.insert("sni", any(&["sni", "serverName", "peer"]));
    params.insert("fingerprint", any(&["fp", "fingerprint"]));
    params.insert("alpn", any(&["alpn"]));
    params.insert("allowInsecure", any(&["allowInsecure", "insecure"]));
    params.insert("flow", any(&["flow"]));
    params.insert("tag", tag);
    params.insert("pbk", any(&["pbk", "publicKey"]));
    params.insert("sid", any(&["sid", "shortId"]));
    params.insert("pqv", any(&["pqv", "mldsa65Verify"]));
    params.insert("spx", any(&["spx", "spiderX"]));
    params.insert("serviceName", any(&["serviceName", "service"]));
    params.insert("authority", any(&["authority"]));
    params.insert("mode", any(&["mode"]));
    params.insert("multiMode", any(&["multiMode"]));
    params.insert("idleTimeout", any(&["idle_timeout", "idleTimeout"]));
    params.insert(
        "healthCheckTimeout",
        any(&["health_check_timeout", "healthCheckTimeout"]),
    );
    params.insert(
        "permitWithoutStream",
        any(&["permit_without_stream", "permitWithoutStream"]),
    );
    params.insert(
        "initialWindowsSize",
        any(&["initial_windows_size", "initialWindowsSize"]),
    );
    params.insert("userAgent", any(&["user_agent", "userAgent"]));
    params.insert("seed", any(&["seed"]));
    params.insert("mtu", any(&["mtu"]));
    params.insert("tti", any(&["tti"]));
    params.insert("uplinkCapacity", any(&["uplinkCapacity", "upCap"]));
    params.insert("downlinkCapacity", any(&["downlinkCapacity", "downCap"]));
    params.insert("congestion", any(&["congestion"]));
    params.insert("readBufferSize", any(&["readBufferSize"]));
    params.insert("writeBufferSize", any(&["writeBufferSize"]));
    params.insert("acceptProxyProtocol", any(&["acceptProxyProtocol"]));
    Ok(params)
}

fn parse_vmess(link: &str) -> Result<LinkParams, OutboundError> {
    let raw = link.trim_start_matches("vmess://").trim();
    let decoded = decode_base64(raw)
        .ok_or_else(|| OutboundError::InvalidLink("invalid base64 payload".into()))?;
    let payload: serde_json::Value = serde_json::from_slice(&decoded)
        .map_err(|e| OutboundError::InvalidLink(format!("invalid VMess JSON: {e}")))?;
    let payload = payload
        .as_object()
        .ok_or_else(|| OutboundError::InvalidLink("VMess payload is not an object".into()))?;

    let json = |keys: &[&str]| -> String {
        keys.iter()
            .filter_map(|k| payload.get(*k))
            .filter_map(stringify_json)
            .find(|v| !v.is_empty())
            .unwrap_or_default()
    };

    let mut cipher = json(&["scy", "security"]);
    let mut network = json(&["net", "network"]).to_lowercase();
    let mut header_type = json(&["type"]);
    if network.is_empty() {
        match header_type.to_lowercase().as_str() {
            t @ ("tcp" | "ws" | "websocket" | "grpc" | "kcp" | "mkcp" | "httpupgrade" | "xhttp"
            | "splithttp") => {
                network = t.to_string();
                header_type = String::new();
            }
            _ => {}
        }
    }
    let tls = json(&["tls"]).to_lowercase();
    let mut security = if tls.is_empty() || tls == "none" {
        String::new()
    } else {
        tls
    };
    if security.is_empty() {
        match cipher.to_lowercase().as_str() {
            c @ ("tls" | "reality" | "xtls") => {
                security = c.to_string();
                cipher = String::new();
            }
            _ => {}
        }
    }

    let mut params = LinkParams::new();
    params.insert("tag", json(&["ps", "remark", "remarks", "name"]));
    params.insert("address", json(&["add", "address", "server"]));
    params.insert("port", json(&["port", "serverPort"]));
    params.insert("uuid", json(&["id", "uuid"]));
    params.insert("aid", json(&["aid", "alterId"]));
    params.insert("cipher", cipher);
    params.insert("type", network);
    params.insert("headerType", header_type);
    params.insert("host", json(&["host"]));
    params.insert("path", json(&["path"]));
    params.insert("sni", json(&["sni", "serverName", "peer"]));
    params.insert("fingerprint", json(&["fp", "fingerprint"]));
    params.insert("alpn", json(&["alpn"]));
    params.insert("allowInsecure", json(&["allowInsecure", "insecure"]));
    params.insert("security", security);
    params.insert("pbk", json(&["pbk", "publicKey"]));
    params.insert("sid", json(&["sid", "shortId"]));
    params.insert("pqv", json(&["pqv", "mldsa65Verify"]));
    params.insert("spx", json(&["spx", "spiderX"]));
    params.insert("serviceName", json(&["serviceName", "service"]));
    params.insert("authority", json(&["authority"]));
    params.insert("mode", json(&["mode"]));
    params.insert("multiMode", json(&["multiMode"]));
    params.insert("idleTimeout", json(&["idle_timeout", "idleTimeout"]));
    params.insert(
        "healthCheckTimeout",
        json(&["health_check_timeout", "healthCheckTimeout"]),
    );
    params.insert(
        "permitWithoutStream",
        json(&["permit_without_stream", "permitWithoutStream"]),
    );
    params.insert(
        "initialWindowsSize",
        json(&["initial_windows_size", "initialWindowsSize"]),
    );
    params.insert("userAgent", json(&["user_agent", "userAgent"]));
    params.insert("seed", json(&["seed"]));
    params.insert("mtu", json(&["mtu"]));
    params.insert("tti", json(&["tti"]));
    params.insert("uplinkCapacity", json(&["uplinkCapacity", "upCap"]));
    params.insert("downlinkCapacity", json(&["downlinkCapacity", "downCap"]));
    params.insert("congestion", json(&["congestion"]));
    params.insert("readBufferSize", json(&["readBufferSize"]));
    params.insert("writeBufferSize", json(&["writeBufferSize"]));
    params.insert("acceptProxyProtocol", json(&["acceptProxyProtocol"]));
    Ok(params)
}

fn parse_ss(link: &str) -> Result<LinkParams, OutboundError> {
    let mut raw = link.trim_start_matches("ss://").trim().to_string();

    let mut tag = String::new();
    if let Some(idx) = raw.find('#') {
        tag = percent_decode(&raw[idx + 1..]);
        raw.truncate(idx);
    }

    let mut plugin = String::new();
    if let Some(idx) = raw.find('?') {
        let query = raw[idx + 1..].to_string();
        raw.truncate(idx);
        for pair in query.split('&') {
            if let Some(value) = pair.strip_prefix("plugin=") {
                plugin = percent_decode(value);
            }
        }
    }
    let raw = raw.trim();

    let (method, password, host, port) = if let Some((user_info, host_port)) = raw.split_once('@')
    {
        let user_info = if user_info.contains(':') {
            user_info.to_string()
        } else {
            let decoded = decode_base64(user_info)
                .ok_or_else(|| OutboundError::InvalidLink("invalid base64 credentials".into()))?;
            String::from_utf8(decoded)
                .map_err(|_| OutboundError::InvalidLink("invalid SS credentials".into()))?
        };
        let (method, password) = split_ss_user_info(&user_info)?;
        let (host, port) = split_ss_host_port(host_port)?;
        (method, password, host, port)
    } else {
        let decoded = decode_base64(raw)
            .ok_or_else(|| OutboundError::InvalidLink("invalid base64 payload".into()))?;
        let payload = String::from_utf8(decoded)
            .map_err(|_| OutboundError::InvalidLink("invalid SS payload".into()))?;
        let (user_info, host_port) = payload
            .split_once('@')
            .ok_or_else(|| OutboundError::InvalidLink("unsupported SS link format".into()))?;
        let (method, password) = split_ss_user_info(user_info)?;
        let (host, port) = split_ss_host_port(host_port)?;
        (method, password, host, port)
    };

    let mut params = LinkParams::new();
    params.insert("method", method);
    params.insert("password", password);
    params.insert("address", host);
    params.insert("port", port.to_string());
    if !tag.is_empty() {
        params.insert("tag", tag);
    }
    if !plugin.is_empty() {
        params.insert("plugin", plugin);
    }
    Ok(params)
}

fn split_ss_user_info(raw: &str) -> Result<(String, String), OutboundError> {
    let (method, password) = raw
        .split_once(':')
        .ok_or_else(|| OutboundError::InvalidLink("invalid SS credentials".into()))?;
    Ok((percent_decode(method), percent_decode(password)))
}

fn split_ss_host_port(raw: &str) -> Result<(String, u16), OutboundError> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Err(OutboundError::InvalidLink("invalid SS address section".into()));
    }
    // Bracketed v6 literals and plain host:port both split on the last colon
    if let Some((host, port)) = raw.rsplit_once(':') {
        let host = host.trim_start_matches('[').trim_end_matches(']');
        if let Ok(port) = port.parse::<u16>() {
            return Ok((host.to_string(), port));
        }
    }
    Err(OutboundError::InvalidLink("invalid SS address section".into()))
}

fn generate_vless(params: &LinkParams, inbound_port: u16) -> ChainFile {
    let encryption = non_empty_or(get(params, "encryption"), "none");
    let tag = non_empty_or(get(params, "tag"), "vless-reality");
    let remote_port = to_port(get(params, "port"));

    let mut user = ProxyUser {
        id: get(params, "uuid").to_string(),
        encryption: Some(encryption),
        level: Some(0),
        ..ProxyUser::default()
    };
    if !get(params, "flow").is_empty() {
        user.flow = Some(get(params, "flow").to_string());
    }

    let mut primary = Outbound {
        tag: Some(tag),
        proxy: Proxy::Vless(VnextSettings {
            vnext: vec![VnextServer {
                address: get(params, "address").to_string(),
                port: remote_port,
                users: vec![user],
            }],
        }),
        stream_settings: None,
    };
    primary.stream_settings = build_stream_settings(params);

    let mut outbounds = vec![primary];
    outbounds.extend(Outbound::default_companions());

    ChainFile {
        inbounds: vec![Inbound::redirect(inbound_port)],
        outbounds,
        auto_run: false,
        metadata: ChainMetadata {
            protocol: "vless".into(),
            remote_host: get(params, "address").to_string(),
            remote_port,
            socks_port: inbound_port,
        },
    }
}

fn generate_vmess(params: &LinkParams, inbound_port: u16) -> ChainFile {
    let security = non_empty_or(get(params, "cipher"), "auto");
    let remote_port = to_port(get(params, "port"));

    let mut user = ProxyUser {
        id: get(params, "uuid").to_string(),
        security: Some(security),
        ..ProxyUser::default()
    };
    if !get(params, "aid").is_empty() {
        user.alter_id = Some(to_u32(get(params, "aid")));
    }

    let mut primary = Outbound {
        tag: None,
        proxy: Proxy::Vmess(VnextSettings {
            vnext: vec![VnextServer {
                address: get(params, "address").to_string(),
                port: remote_port,
                users: vec![user],
            }],
        }),
        stream_settings: None,
    };
    if !get(params, "tag").is_empty() {
        primary.tag = Some(get(params, "tag").to_string());
    }
    primary.stream_settings = build_stream_settings(params);

    ChainFile {
        inbounds: vec![Inbound::redirect(inbound_port)],
        outbounds: vec![primary],
        auto_run: false,
        metadata: ChainMetadata {
            protocol: "vmess".into(),
            remote_host: get(params, "address").to_string(),
            remote_port,
            socks_port: inbound_port,
        },
    }
}

fn generate_ss(params: &LinkParams, inbound_port: u16) -> ChainFile {
    let remote_port = to_port(get(params, "port"));

    let mut primary = Outbound {
        tag: None,
        proxy: Proxy::Shadowsocks(ShadowsocksSettings {
            servers: vec![ServerEntry {
                address: get(params, "address").to_string(),
                port: remote_port,
                method: get(params, "method").to_string(),
                password: get(params, "password").to_string(),
            }],
        }),
        stream_settings: None,
    };
    if !get(params, "tag").is_empty() {
        primary.tag = Some(get(params, "tag").to_string());
    }

    ChainFile {
        inbounds: vec![Inbound::redirect(inbound_port)],
        outbounds: vec![primary],
        auto_run: false,
        metadata: ChainMetadata {
            protocol: "shadowsocks".into(),
            remote_host: get(params, "address").to_string(),
            remote_port,
            socks_port: inbound_port,
        },
    }
}

#[allow(clippy::too_many_lines)]
fn build_stream_settings(params: &LinkParams) -> Option<StreamSettings> {
    let mut stream = StreamSettings::default();

    let explicit_network = !get(params, "type").is_empty();
    let network = if explicit_network {
        get(params, "type").to_lowercase()
    } else {
        "tcp".to_string()
    };
    let sni = non_empty_or(get(params, "sni"), get(params, "host"));

    let security = get(params, "security").to_lowercase();
    if !security.is_empty() {
        stream.security = Some(security.clone());
        match security.as_str() {
            "tls" => {
                let mut tls = TlsSettings::default();
                if !sni.is_empty() {
                    tls.server_name = Some(sni.clone());
                }
                if !get(params, "fingerprint").is_empty() {
                    tls.fingerprint = Some(get(params, "fingerprint").to_string());
                }
                tls.alpn = split_csv(get(params, "alpn"));
                if !get(params, "allowInsecure").is_empty() {
                    tls.allow_insecure = Some(parse_bool(get(params, "allowInsecure")));
                }
                if tls != TlsSettings::default() {
                    stream.tls_settings = Some(tls);
                }
            }
            "reality" => {
                let mut reality = RealitySettings::default();
                if !sni.is_empty() {
                    reality.server_name = Some(sni.clone());
                }
                if !get(params, "fingerprint").is_empty() {
                    reality.fingerprint = Some(get(params, "fingerprint").to_string());
                }
                if !get(params, "pbk").is_empty() {
                    reality.public_key = Some(get(params, "pbk").to_string());
                }
                if !get(params, "sid").is_empty() {
                    reality.short_id = Some(get(params, "sid").to_string());
                }
                if !get(params, "pqv").is_empty() {
                    reality.mldsa65_verify = Some(get(params, "pqv").to_string());
                }
                reality.spider_x = Some(non_empty_or(get(params, "spx"), "/"));
                stream.reality_settings = Some(reality);
            }
            _ => {}
        }
    }

    if explicit_network {
        stream.network = Some(network.clone());
    }

    match network.as_str() {
        "tcp" | "raw" => {
            let mut tcp = TcpSettings::default();
            let header_type = get(params, "headerType").to_lowercase();
            if !header_type.is_empty() {
                let mut header = TcpHeader {
                    kind: header_type.clone(),
                    request: None,
                };
                if header_type == "http" {
                    let mut request = TcpRequest::default();
                    request.uri = split_csv(non_empty_or(get(params, "path"), "/").as_str());
                    let host = non_empty_or(get(params, "host"), sni.as_str());
                    if !host.is_empty() {
                        let values = {
                            let v = split_csv(&host);
                            if v.is_empty() {
                                vec![host.clone()]
                            } else {
                                v
                            }
                        };
                        request.header = vec![HeaderEntry {
                            name: "Host".into(),
                            value: values,
                        }];
                    }
                    if request != TcpRequest::default() {
                        header.request = Some(request);
                    }
                }
                tcp.header = Some(header);
            }
            if !get(params, "acceptProxyProtocol").is_empty() {
                tcp.accept_proxy_protocol = Some(parse_bool(get(params, "acceptProxyProtocol")));
            }
            if tcp != TcpSettings::default() {
                stream.tcp_settings = Some(tcp);
            }
        }
        "ws" | "websocket" => {
            let mut ws = WsSettings::default();
            if !get(params, "path").is_empty() {
                ws.path = Some(get(params, "path").to_string());
            }
            let host = non_empty_or(get(params, "host"), sni.as_str());
            if !host.is_empty() {
                ws.host = Some(host);
            }
            if !get(params, "acceptProxyProtocol").is_empty() {
                ws.accept_proxy_protocol = Some(parse_bool(get(params, "acceptProxyProtocol")));
            }
            if ws != WsSettings::default() {
                stream.ws_settings = Some(ws);
            }
        }
        "grpc" => {
            let mut grpc = GrpcSettings::default();
            let mut service_name = get(params, "serviceName").to_string();
            if service_name.is_empty() && !get(params, "path").is_empty() {
                service_name = get(params, "path").trim_start_matches('/').to_string();
            }
            if !service_name.is_empty() {
                grpc.service_name = Some(service_name);
            }
            let authority = non_empty_or(
                get(params, "authority"),
                non_empty_or(get(params, "host"), sni.as_str()).as_str(),
            );
            if !authority.is_empty() {
                grpc.authority = Some(authority);
            }
            let mode = get(params, "mode").to_lowercase();
            if matches!(mode.as_str(), "multi" | "multimode" | "multi-mode") {
                grpc.multi_mode = Some(true);
            }
            if !get(params, "multiMode").is_empty() {
                grpc.multi_mode = Some(parse_bool(get(params, "multiMode")));
            }
            if !get(params, "idleTimeout").is_empty() {
                grpc.idle_timeout = Some(to_u32(get(params, "idleTimeout")));
            }
            if !get(params, "healthCheckTimeout").is_empty() {
                grpc.health_check_timeout = Some(to_u32(get(params, "healthCheckTimeout")));
            }
            if !get(params, "permitWithoutStream").is_empty() {
                grpc.permit_without_stream =
                    Some(parse_bool(get(params, "permitWithoutStream")));
            }
            if !get(params, "initialWindowsSize").is_empty() {
                grpc.initial_windows_size = Some(to_u32(get(params, "initialWindowsSize")));
            }
            if !get(params, "userAgent").is_empty() {
                grpc.user_agent = Some(get(params, "userAgent").to_string());
            }
            if grpc != GrpcSettings::default() {
                stream.grpc_settings = Some(grpc);
            }
        }
        "kcp" | "mkcp" => {
            let mut kcp = KcpSettings::default();
            if !get(params, "mtu").is_empty() {
                kcp.mtu = Some(to_u32(get(params, "mtu")));
            }
            if !get(params, "tti").is_empty() {
                kcp.tti = Some(to_u32(get(params, "tti")));
            }
            if !get(params, "uplinkCapacity").is_empty() {
                kcp.uplink_capacity = Some(to_u32(get(params, "uplinkCapacity")));
            }
            if !get(params, "downlinkCapacity").is_empty() {
                kcp.downlink_capacity = Some(to_u32(get(params, "downlinkCapacity")));
            }
            if !get(params, "congestion").is_empty() {
                kcp.congestion = Some(parse_bool(get(params, "congestion")));
            }
            if !get(params, "readBufferSize").is_empty() {
                kcp.read_buffer_size = Some(to_u32(get(params, "readBufferSize")));
            }
            if !get(params, "writeBufferSize").is_empty() {
                kcp.write_buffer_size = Some(to_u32(get(params, "writeBufferSize")));
            }
            if !get(params, "seed").is_empty() {
                kcp.seed = Some(get(params, "seed").to_string());
            }
            let header_type = get(params, "headerType").to_lowercase();
            if !header_type.is_empty() {
                kcp.header = Some(KcpHeader { kind: header_type });
            }
            if kcp != KcpSettings::default() {
                stream.kcp_settings = Some(kcp);
            }
        }
        "httpupgrade" => {
            let mut upgrade = HttpUpgradeSettings::default();
            if !get(params, "path").is_empty() {
                upgrade.path = Some(get(params, "path").to_string());
            }
            let host = non_empty_or(get(params, "host"), sni.as_str());
            if !host.is_empty() {
                upgrade.host = Some(host);
            }
            if !get(params, "acceptProxyProtocol").is_empty() {
                upgrade.accept_proxy_protocol =
                    Some(parse_bool(get(params, "acceptProxyProtocol")));
            }
            if upgrade != HttpUpgradeSettings::default() {
                stream.httpupgrade_settings = Some(upgrade);
            }
        }
        "xhttp" | "splithttp" => {
            let mut split = SplitHttpSettings::default();
            if !get(params, "path").is_empty() {
                split.path = Some(get(params, "path").to_string());
            }
            let host = non_empty_or(get(params, "host"), sni.as_str());
            if !host.is_empty() {
                split.host = Some(host);
            }
            if !get(params, "mode").is_empty() {
                split.mode = Some(get(params, "mode").to_lowercase());
            }
            if split != SplitHttpSettings::default() {
                stream.splithttp_settings = Some(split);
            }
        }
        _ => {}
    }

    if stream.is_empty() {
        None
    } else {
        Some(stream)
    }
}

/// Decode base64 accepting standard/URL alphabets with or without padding
fn decode_base64(raw: &str) -> Option<Vec<u8>> {
    use base64::engine::general_purpose::{
        STANDARD, STANDARD_NO_PAD, URL_SAFE, URL_SAFE_NO_PAD,
    };
    let raw = raw.trim();
    STANDARD
        .decode(raw)
        .or_else(|_| STANDARD_NO_PAD.decode(raw))
        .or_else(|_| URL_SAFE.decode(raw))
        .or_else(|_| URL_SAFE_NO_PAD.decode(raw))
        .ok()
}

fn stringify_json(value: &serde_json::Value) -> Option<String> {
    match value {
        serde_json::Value::String(s) => Some(s.clone()),
        serde_json::Value::Number(n) => Some(n.to_string()),
        serde_json::Value::Bool(b) => Some(b.to_string()),
        serde_json::Value::Array(items) => Some(
            items
                .iter()
                .filter_map(stringify_json)
                .filter(|s| !s.is_empty())
                .collect::<Vec<_>>()
                .join(","),
        ),
        _ => None,
    }
}

fn percent_decode(raw: &str) -> String {
    let bytes = raw.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%'
            && i + 2 < bytes.len()
            && bytes[i + 1].is_ascii_hexdigit()
            && bytes[i + 2].is_ascii_hexdigit()
        {
            if let Ok(byte) = u8::from_str_radix(&raw[i + 1..i + 3], 16) {
                out.push(byte);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

fn split_csv(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(ToString::to_string)
        .collect()
}

fn parse_bool(raw: &str) -> bool {
    matches!(raw.to_lowercase().as_str(), "1" | "true" | "yes" | "on")
}

fn non_empty_or(value: &str, fallback: &str) -> String {
    if value.is_empty() {
        fallback.to_string()
    } else {
        value.to_string()
    }
}

fn to_port(raw: &str) -> u16 {
    raw.parse().unwrap_or(0)
}

fn to_u32(raw: &str) -> u32 {
    raw.parse().unwrap_or(0)
}
