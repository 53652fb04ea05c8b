//! Typed proxy chain documents
//!
//! The persisted per-chain file follows the xray config shape (inbounds,
//! outbounds, stream settings) but is modeled as typed records: one variant
//! per protocol, a shared stream-settings record with typed per-transport
//! sub-records, and a flattened bag for transports the core passes through
//! without introspecting.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// The persisted file for one proxy chain
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChainFile {
    /// Local inbounds the child process listens on
    #[serde(default)]
    pub inbounds: Vec<Inbound>,

    /// Outbounds, the parsed link first
    #[serde(default)]
    pub outbounds: Vec<Outbound>,

    /// Start this chain on daemon startup
    #[serde(default)]
    pub auto_run: bool,

    /// Summary for listings
    #[serde(default)]
    pub metadata: ChainMetadata,
}

impl ChainFile {
    /// Canonical identity of the outbound section, compared as bytes for
    /// duplicate detection. Typed records serialize with stable key order.
    #[must_use]
    pub fn outbound_identity(&self) -> Vec<u8> {
        serde_yaml::to_string(&self.outbounds)
            .unwrap_or_default()
            .into_bytes()
    }

    /// Listing summary, falling back to document extraction where the
    /// metadata block is incomplete (older files)
    #[must_use]
    pub fn to_info(&self) -> ChainInfo {
        let mut info = ChainInfo {
            protocol: self.metadata.protocol.clone(),
            host: self.metadata.remote_host.clone(),
            port: self.metadata.remote_port,
            auto_run: self.auto_run,
            inbound_port: self.metadata.socks_port,
        };

        if info.inbound_port == 0 {
            info.inbound_port = self.inbounds.first().map_or(0, |i| i.port);
        }

        if info.protocol.is_empty() || info.host.is_empty() || info.port == 0 {
            if let Some(primary) = self.outbounds.first() {
                if info.protocol.is_empty() {
                    info.protocol = primary.proxy.protocol_name().to_string();
                }
                if let Some((host, port)) = primary.proxy.endpoint() {
                    if info.host.is_empty() {
                        info.host = host.to_string();
                    }
                    if info.port == 0 {
                        info.port = port;
                    }
                }
            }
        }

        info
    }
}

/// Summary of one proxy chain for listings
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChainInfo {
    /// Outbound protocol (vless, vmess, shadowsocks)
    pub protocol: String,
    /// Remote endpoint host
    pub host: String,
    /// Remote endpoint port
    pub port: u16,
    /// Auto-run flag
    pub auto_run: bool,
    /// Local inbound port the redirect targets
    pub inbound_port: u16,
}

/// Metadata block of a chain file
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChainMetadata {
    #[serde(default)]
    pub protocol: String,
    #[serde(default)]
    pub remote_host: String,
    #[serde(default)]
    pub remote_port: u16,
    #[serde(default)]
    pub socks_port: u16,
}

/// A local inbound
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Inbound {
    pub port: u16,
    pub protocol: String,
    pub settings: InboundSettings,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sniffing: Option<Sniffing>,
}

impl Inbound {
    /// The transparent-redirect inbound the firewall rules target
    #[must_use]
    pub fn redirect(port: u16) -> Self {
        Self {
            port,
            protocol: "dokodemo-door".into(),
            settings: InboundSettings {
                network: "tcp,udp".into(),
                follow_redirect: true,
                timeout: 0,
            },
            sniffing: Some(Sniffing {
                enabled: true,
                dest_override: vec!["http".into(), "tls".into()],
            }),
        }
    }
}

/// Inbound settings for dokodemo-door
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InboundSettings {
    pub network: String,
    pub follow_redirect: bool,
    pub timeout: u64,
}

/// Inbound sniffing settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Sniffing {
    pub enabled: bool,
    pub dest_override: Vec<String>,
}

/// One outbound: a protocol variant plus optional stream settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Outbound {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,

    #[serde(flatten)]
    pub proxy: Proxy,

    #[serde(
        rename = "streamSettings",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub stream_settings: Option<StreamSettings>,
}

impl Outbound {
    /// The standard companion outbounds appended after the primary one
    #[must_use]
    pub fn default_companions() -> Vec<Self> {
        vec![
            Self {
                tag: Some("direct".into()),
                proxy: Proxy::Freedom(FreedomSettings::default()),
                stream_settings: None,
            },
            Self {
                tag: Some("block".into()),
                proxy: Proxy::Blackhole(BlackholeSettings {
                    response: Some(BlackholeResponse {
                        kind: "http".into(),
                    }),
                }),
                stream_settings: None,
            },
        ]
    }
}

/// Discriminated outbound settings, one variant per protocol
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "protocol", content = "settings", rename_all = "lowercase")]
pub enum Proxy {
    Vless(VnextSettings),
    Vmess(VnextSettings),
    Shadowsocks(ShadowsocksSettings),
    Freedom(FreedomSettings),
    Blackhole(BlackholeSettings),
}

impl Proxy {
    /// Protocol name as it appears on the wire
    #[must_use]
    pub const fn protocol_name(&self) -> &'static str {
        match self {
            Self::Vless(_) => "vless",
            Self::Vmess(_) => "vmess",
            Self::Shadowsocks(_) => "shadowsocks",
            Self::Freedom(_) => "freedom",
            Self::Blackhole(_) => "blackhole",
        }
    }

    /// Remote endpoint, where the protocol has one
    #[must_use]
    pub fn endpoint(&self) -> Option<(&str, u16)> {
        match self {
            Self::Vless(s) | Self::Vmess(s) => s
                .vnext
                .first()
                .map(|v| (v.address.as_str(), v.port)),
            Self::Shadowsocks(s) => s
                .servers
                .first()
                .map(|v| (v.address.as_str(), v.port)),
            Self::Freedom(_) | Self::Blackhole(_) => None,
        }
    }
}

/// vnext block shared by VLESS and VMESS
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VnextSettings {
    pub vnext: Vec<VnextServer>,
}

/// One vnext server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VnextServer {
    pub address: String,
    pub port: u16,
    pub users: Vec<ProxyUser>,
}

/// A user record; VLESS fills encryption/flow, VMESS security/alterId
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProxyUser {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encryption: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flow: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub level: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub security: Option<String>,
    #[serde(rename = "alterId", default, skip_serializing_if = "Option::is_none")]
    pub alter_id: Option<u32>,
}

/// Shadowsocks servers block
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ShadowsocksSettings {
    pub servers: Vec<ServerEntry>,
}

/// One shadowsocks server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerEntry {
    pub address: String,
    pub port: u16,
    pub method: String,
    pub password: String,
}

/// Freedom outbound has no settings
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FreedomSettings {}

/// Blackhole outbound settings
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BlackholeSettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<BlackholeResponse>,
}

/// Blackhole response shape
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlackholeResponse {
    #[serde(rename = "type")]
    pub kind: String,
}

/// Shared stream settings record
///
/// Known transports get typed sub-records; anything else lands in the
/// flattened bag and is written back untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamSettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub security: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls_settings: Option<TlsSettings>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reality_settings: Option<RealitySettings>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tcp_settings: Option<TcpSettings>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ws_settings: Option<WsSettings>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub grpc_settings: Option<GrpcSettings>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kcp_settings: Option<KcpSettings>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub httpupgrade_settings: Option<HttpUpgradeSettings>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub splithttp_settings: Option<SplitHttpSettings>,
    #[serde(flatten, default, skip_serializing_if = "BTreeMap::is_empty")]
    pub other: BTreeMap<String, serde_yaml::Value>,
}

impl StreamSettings {
    /// True when no field carries anything worth persisting
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self == &Self::default()
    }
}

/// TLS security sub-record
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TlsSettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fingerprint: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub alpn: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allow_insecure: Option<bool>,
}

/// REALITY security sub-record
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RealitySettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fingerprint: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub short_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mldsa65_verify: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spider_x: Option<String>,
}

/// Raw TCP transport sub-record
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TcpSettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub header: Option<TcpHeader>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub accept_proxy_protocol: Option<bool>,
}

/// TCP header obfuscation
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TcpHeader {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request: Option<TcpRequest>,
}

/// HTTP-style request block for tcp/http header obfuscation
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TcpRequest {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub uri: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub header: Vec<HeaderEntry>,
}

/// One request header entry
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HeaderEntry {
    pub name: String,
    pub value: Vec<String>,
}

/// WebSocket transport sub-record
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WsSettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub accept_proxy_protocol: Option<bool>,
}

/// gRPC transport sub-record
///
/// The tuning options keep their snake_case wire names.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GrpcSettings {
    #[serde(
        rename = "serviceName",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub service_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub authority: Option<String>,
    #[serde(rename = "multiMode", default, skip_serializing_if = "Option::is_none")]
    pub multi_mode: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idle_timeout: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub health_check_timeout: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub permit_without_stream: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initial_windows_size: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,
}

/// mKCP transport sub-record
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KcpSettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mtu: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tti: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uplink_capacity: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub downlink_capacity: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub congestion: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub read_buffer_size: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub write_buffer_size: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub header: Option<KcpHeader>,
}

/// mKCP header obfuscation
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct KcpHeader {
    #[serde(rename = "type")]
    pub kind: String,
}

/// HTTPUpgrade transport sub-record
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HttpUpgradeSettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub accept_proxy_protocol: Option<bool>,
}

/// SplitHTTP/XHTTP transport sub-record
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SplitHttpSettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_file() -> ChainFile {
        ChainFile {
            inbounds: vec![Inbound::redirect(10800)],
            outbounds: vec![Outbound {
                tag: Some("vless-reality".into()),
                proxy: Proxy::Vless(VnextSettings {
                    vnext: vec![VnextServer {
                        address: "proxy.example.net".into(),
                        port: 443,
                        users: vec![ProxyUser {
                            id: "8f3a".into(),
                            encryption: Some("none".into()),
                            level: Some(0),
                            flow: Some("xtls-rprx-vision".into()),
                            ..ProxyUser::default()
                        }],
                    }],
                }),
                stream_settings: Some(StreamSettings {
                    network: Some("tcp".into()),
                    security: Some("reality".into()),
                    reality_settings: Some(RealitySettings {
                        server_name: Some("cdn.example.org".into()),
                        public_key: Some("pbk".into()),
                        short_id: Some("ab12".into()),
                        spider_x: Some("/".into()),
                        ..RealitySettings::default()
                    }),
                    ..StreamSettings::default()
                }),
            }],
            auto_run: true,
            metadata: ChainMetadata {
                protocol: "vless".into(),
                remote_host: "proxy.example.net".into(),
                remote_port: 443,
                socks_port: 10800,
            },
        }
    }

    #[test]
    fn test_yaml_round_trip() {
        let doc = sample_file();
        let yaml = serde_yaml::to_string(&doc).unwrap();
        let parsed: ChainFile = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(parsed, doc);
    }

    #[test]
    fn test_protocol_tagging() {
        let doc = sample_file();
        let yaml = serde_yaml::to_string(&doc).unwrap();
        assert!(yaml.contains("protocol: vless"));
        assert!(yaml.contains("streamSettings:"));
        assert!(yaml.contains("realitySettings:"));
    }

    #[test]
    fn test_unknown_transport_passes_through() {
        let yaml = r#"
inbounds: []
outbounds:
- protocol: vless
  settings:
    vnext: []
  streamSettings:
    network: quic
    quicSettings:
      security: none
      key: k
auto_run: false
metadata: {}
"#;
        let parsed: ChainFile = serde_yaml::from_str(yaml).unwrap();
        let stream = parsed.outbounds[0].stream_settings.as_ref().unwrap();
        assert!(stream.other.contains_key("quicSettings"));

        let round = serde_yaml::to_string(&parsed).unwrap();
        assert!(round.contains("quicSettings"));
    }

    #[test]
    fn test_outbound_identity_stable() {
        let a = sample_file();
        let mut b = sample_file();
        assert_eq!(a.outbound_identity(), b.outbound_identity());

        // The identity covers only the outbound section
        b.auto_run = false;
        b.metadata.socks_port = 1;
        assert_eq!(a.outbound_identity(), b.outbound_identity());

        b.outbounds[0].tag = Some("renamed".into());
        assert_ne!(a.outbound_identity(), b.outbound_identity());
    }

    #[test]
    fn test_info_fallback_extraction() {
        let mut doc = sample_file();
        doc.metadata = ChainMetadata::default();
        let info = doc.to_info();
        assert_eq!(info.protocol, "vless");
        assert_eq!(info.host, "proxy.example.net");
        assert_eq!(info.port, 443);
        assert_eq!(info.inbound_port, 10800);
    }
}
