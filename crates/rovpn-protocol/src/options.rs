//! Negotiation options
//!
//! Two string formats live here: the OCC options string sent inside the
//! key-method-2 blob, and the PUSH_REPLY options delivered by the server.
//! Both are comma-separated `key value` pairs with a space between key and
//! value, but the separators are parameters of the stringifier because the
//! two code paths must match the peer's expectation independently.
//!
//! PUSH_REPLY binding is explicit registration: a static table maps each
//! option name to a converter and a setter, so the recognized surface is
//! visible in one place.

use serde::{Deserialize, Serialize};

use rovpn_config::ClientConfig;
use rovpn_crypto::CipherKind;

use crate::{ProtocolError, Result};

/// Prefix of the server's options message
pub const PUSH_REPLY_PREFIX: &str = "PUSH_REPLY";

/// Network topology pushed by the server
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Topology {
    /// Point-to-point /30 per client
    Net30,
    /// Point-to-point
    P2p,
    /// Subnet mode
    #[default]
    Subnet,
}

impl Topology {
    fn parse(s: &str) -> Result<Self> {
        match s {
            "net30" => Ok(Topology::Net30),
            "p2p" => Ok(Topology::P2p),
            "subnet" => Ok(Topology::Subnet),
            _ => Err(ProtocolError::OptionsFormat(format!(
                "unknown topology {s:?}"
            ))),
        }
    }

    /// Topology name as pushed on the wire
    pub fn as_str(&self) -> &'static str {
        match self {
            Topology::Net30 => "net30",
            Topology::P2p => "p2p",
            Topology::Subnet => "subnet",
        }
    }
}

/// Options recognized from a PUSH_REPLY
///
/// Unknown options are retained verbatim in `unknown` and ignored.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PushOptions {
    /// Client asked the server not to push routes
    pub route_nopull: bool,
    /// Gateway for pushed routes
    pub route_gateway: Option<String>,
    /// Data channel cipher selected by the server
    pub cipher: Option<String>,
    /// Tunnel MTU
    pub tun_mtu: Option<i64>,
    /// IPv6 interface configuration
    pub ifconfig_ipv6: Option<String>,
    /// Keepalive ping interval, seconds
    pub ping: Option<i64>,
    /// IPv6 capability flag
    pub tun_ipv6: bool,
    /// Protocol capability flags; `tls-ekm` selects exporter keying
    pub protocol_flags: Vec<String>,
    /// redirect-gateway flags
    pub redirect_gateway: Vec<String>,
    /// Peer-id for DataV2 headers
    pub peer_id: Option<u32>,
    /// Restart threshold after silence, seconds
    pub ping_restart: Option<i64>,
    /// Addressing topology
    pub topology: Topology,
    /// IPv4 interface configuration: "addr netmask-or-peer"
    pub ifconfig: Option<String>,
    /// Options with no binding, kept for the application
    pub unknown: Vec<String>,
}

impl PushOptions {
    /// Parse a `PUSH_REPLY,...` message
    pub fn parse(message: &str) -> Result<Self> {
        let message = message.trim_end_matches('\0');
        let body = message
            .strip_prefix(PUSH_REPLY_PREFIX)
            .ok_or_else(|| ProtocolError::OptionsFormat("missing PUSH_REPLY prefix".into()))?;
        let body = body.strip_prefix(',').unwrap_or(body);

        let mut options = Self::default();
        let mut seen: Vec<&'static str> = Vec::new();

        for part in body.split(',') {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }
            let (name, raw) = match part.split_once(' ') {
                Some((name, value)) => (name, Some(value)),
                None => (part, None),
            };
            match BINDINGS.iter().find(|b| b.name == name) {
                Some(binding) => {
                    let value = binding.converter.convert(name, raw)?;
                    (binding.set)(&mut options, value);
                    seen.push(binding.name);
                }
                None => options.unknown.push(part.to_string()),
            }
        }

        for binding in BINDINGS.iter().filter(|b| b.required) {
            if !seen.contains(&binding.name) {
                return Err(ProtocolError::OptionsFormat(format!(
                    "missing required option {:?}",
                    binding.name
                )));
            }
        }

        Ok(options)
    }

    /// Whether the server enabled exporter-based keying
    pub fn tls_ekm(&self) -> bool {
        self.protocol_flags.iter().any(|f| f == "tls-ekm")
    }
}

/// Typed value produced by a converter
#[derive(Debug, Clone, PartialEq)]
enum Value {
    Int(i64),
    Uint(u32),
    Flag,
    Str(String),
    List(Vec<String>),
    Topology(Topology),
}

/// How an option's raw text becomes a typed value
#[derive(Debug, Clone, Copy)]
enum Converter {
    /// Signed integer
    Int,
    /// Unsigned integer
    Uint,
    /// Presence flag, no value allowed
    Flag,
    /// Verbatim string (may contain spaces)
    Str,
    /// Topology enum
    Topology,
    /// Value split on a character
    Split(char),
}

impl Converter {
    fn convert(self, name: &str, raw: Option<&str>) -> Result<Value> {
        match self {
            Converter::Flag => match raw {
                None => Ok(Value::Flag),
                Some(_) => Err(ProtocolError::OptionsFormat(format!(
                    "option {name:?} takes no value"
                ))),
            },
            Converter::Int => require(name, raw)?
                .parse()
                .map(Value::Int)
                .map_err(|_| ProtocolError::OptionsFormat(format!("bad integer for {name:?}"))),
            Converter::Uint => require(name, raw)?
                .parse()
                .map(Value::Uint)
                .map_err(|_| ProtocolError::OptionsFormat(format!("bad unsigned for {name:?}"))),
            Converter::Str => Ok(Value::Str(require(name, raw)?.to_string())),
            Converter::Topology => Topology::parse(require(name, raw)?).map(Value::Topology),
            Converter::Split(sep) => Ok(Value::List(
                require(name, raw)?.split(sep).map(str::to_string).collect(),
            )),
        }
    }
}

fn require<'a>(name: &str, raw: Option<&'a str>) -> Result<&'a str> {
    raw.ok_or_else(|| ProtocolError::OptionsFormat(format!("option {name:?} requires a value")))
}

struct Binding {
    name: &'static str,
    required: bool,
    converter: Converter,
    set: fn(&mut PushOptions, Value),
}

static BINDINGS: &[Binding] = &[
    Binding {
        name: "route-nopull",
        required: false,
        converter: Converter::Flag,
        set: |o, _| o.route_nopull = true,
    },
    Binding {
        name: "route-gateway",
        required: false,
        converter: Converter::Str,
        set: |o, v| {
            if let Value::Str(s) = v {
                o.route_gateway = Some(s);
            }
        },
    },
    Binding {
        name: "cipher",
        required: false,
        converter: Converter::Str,
        set: |o, v| {
            if let Value::Str(s) = v {
                o.cipher = Some(s);
            }
        },
    },
    Binding {
        name: "tun-mtu",
        required: false,
        converter: Converter::Int,
        set: |o, v| {
            if let Value::Int(n) = v {
                o.tun_mtu = Some(n);
            }
        },
    },
    Binding {
        name: "ifconfig-ipv6",
        required: false,
        converter: Converter::Str,
        set: |o, v| {
            if let Value::Str(s) = v {
                o.ifconfig_ipv6 = Some(s);
            }
        },
    },
    Binding {
        name: "ping",
        required: false,
        converter: Converter::Int,
        set: |o, v| {
            if let Value::Int(n) = v {
                o.ping = Some(n);
            }
        },
    },
    Binding {
        name: "tun-ipv6",
        required: false,
        converter: Converter::Flag,
        set: |o, _| o.tun_ipv6 = true,
    },
    Binding {
        name: "protocol-flags",
        required: false,
        converter: Converter::Split(' '),
        set: |o, v| {
            if let Value::List(l) = v {
                o.protocol_flags = l;
            }
        },
    },
    Binding {
        name: "redirect-gateway",
        required: false,
        converter: Converter::Split(' '),
        set: |o, v| {
            if let Value::List(l) = v {
                o.redirect_gateway = l;
            }
        },
    },
    Binding {
        name: "peer-id",
        required: true,
        converter: Converter::Uint,
        set: |o, v| {
            if let Value::Uint(n) = v {
                o.peer_id = Some(n);
            }
        },
    },
    Binding {
        name: "ping-restart",
        required: false,
        converter: Converter::Int,
        set: |o, v| {
            if let Value::Int(n) = v {
                o.ping_restart = Some(n);
            }
        },
    },
    Binding {
        name: "topology",
        required: false,
        converter: Converter::Topology,
        set: |o, v| {
            if let Value::Topology(t) = v {
                o.topology = t;
            }
        },
    },
    Binding {
        name: "ifconfig",
        required: false,
        converter: Converter::Str,
        set: |o, v| {
            if let Value::Str(s) = v {
                o.ifconfig = Some(s);
            }
        },
    },
];

/// Join key/value pairs with the given separators
///
/// Fails on an empty key. A `None` value emits the bare key.
pub fn stringify_options(
    pairs: &[(String, Option<String>)],
    pair_sep: char,
    kv_sep: char,
) -> Result<String> {
    let mut out = String::new();
    for (key, value) in pairs {
        if key.is_empty() {
            return Err(ProtocolError::OptionsFormat("empty option key".into()));
        }
        if !out.is_empty() {
            out.push(pair_sep);
        }
        out.push_str(key);
        if let Some(value) = value {
            out.push(kv_sep);
            out.push_str(value);
        }
    }
    Ok(out)
}

/// Split an options string back into key/value pairs
pub fn parse_options(s: &str, pair_sep: char, kv_sep: char) -> Vec<(String, Option<String>)> {
    s.split(pair_sep)
        .filter(|part| !part.is_empty())
        .map(|part| match part.split_once(kv_sep) {
            Some((key, value)) => (key.to_string(), Some(value.to_string())),
            None => (part.to_string(), None),
        })
        .collect()
}

/// Build the OCC options string advertised in the key-method-2 blob
pub fn build_occ_string(config: &ClientConfig, cipher: CipherKind) -> Result<String> {
    let pairs: Vec<(String, Option<String>)> = vec![
        ("V4".to_string(), None),
        ("dev-type".to_string(), Some(config.device.as_str().to_string())),
        ("link-mtu".to_string(), Some(config.link_mtu.to_string())),
        ("tun-mtu".to_string(), Some(config.tun_mtu.to_string())),
        ("proto".to_string(), Some(config.protocol.occ_name().to_string())),
        ("cipher".to_string(), Some(cipher.name().to_string())),
        ("keysize".to_string(), Some(cipher.key_bits().to_string())),
        ("key-method".to_string(), Some("2".to_string())),
        ("tls-client".to_string(), None),
    ];
    stringify_options(&pairs, ',', ' ')
}

/// Build the peer-info block advertised in the key-method-2 blob
pub fn build_peer_info(config: &ClientConfig) -> String {
    // IV_PROTO: bit 1 = DataV2 support, bit 3 = tls-ekm support
    let mut proto = 1u32 << 1;
    if config.control_crypto.use_key_material_exporters {
        proto |= 1 << 3;
    }

    let ciphers: Vec<&str> = config
        .supported_data_ciphers()
        .iter()
        .map(|c| c.name())
        .collect();

    format!(
        "IV_VER={}\nIV_PLAT={}\nIV_PROTO={}\nIV_CIPHERS={}\n",
        config.version,
        config.platform.as_str(),
        proto,
        ciphers.join(":"),
    )
}
