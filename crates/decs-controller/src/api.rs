//! DECS cloud API endpoints and wire records
//!
//! Requests are form-encoded POSTs; responses are JSON. Records only carry the fields this
//! crate reads, and every field defaults so that older controllers omitting one still decode.

use crate::error::{DecsError, Result};
use serde::Deserialize;
use serde::de::DeserializeOwned;

// ============ Authentication ============

/// Legacy login: `username` + `password` -> session id
pub const LEGACY_LOGIN_API: &str = "/restmachine/cloudapi/users/authenticate";
/// OAuth2 token endpoint, relative to the OAuth2 provider URL
pub const OAUTH2_TOKEN_API: &str = "/v1/oauth/access_token";
/// JWT exchange: bearer JWT -> resolved user name (and optionally a session id)
pub const JWT_EXCHANGE_API: &str = "/restmachine/cloudapi/users/whoami";

// ============ Resource groups ============

pub const RESGROUP_LIST_API: &str = "/restmachine/cloudapi/cloudspaces/list";
pub const RESGROUP_GET_API: &str = "/restmachine/cloudapi/cloudspaces/get";
pub const RESGROUP_CREATE_API: &str = "/restmachine/cloudapi/cloudspaces/create";
pub const RESGROUP_UPDATE_API: &str = "/restmachine/cloudapi/cloudspaces/update";
pub const RESGROUP_DELETE_API: &str = "/restmachine/cloudapi/cloudspaces/delete";

// ============ Machines ============

pub const MACHINE_LIST_API: &str = "/restmachine/cloudapi/machines/list";
pub const MACHINE_GET_API: &str = "/restmachine/cloudapi/machines/get";
pub const MACHINE_CREATE_API: &str = "/restmachine/cloudapi/machines/create";
pub const MACHINE_DELETE_API: &str = "/restmachine/cloudapi/machines/delete";

// ============ Disks, networks, port forwards, images ============

pub const DISK_CREATE_API: &str = "/restmachine/cloudapi/disks/create";
pub const DISK_ATTACH_API: &str = "/restmachine/cloudapi/machines/attachDisk";
pub const EXTNET_LIST_API: &str = "/restmachine/cloudapi/externalnetwork/list";
pub const EXTNET_ATTACH_API: &str = "/restmachine/cloudapi/machines/attachExternalNetwork";
pub const PORTFORWARD_LIST_API: &str = "/restmachine/cloudapi/portforwarding/list";
pub const PORTFORWARD_CREATE_API: &str = "/restmachine/cloudapi/portforwarding/create";
pub const IMAGE_LIST_API: &str = "/restmachine/cloudapi/images/list";

/// Decode a response body, tolerating Python dict literals some endpoints emit
pub fn decode<T: DeserializeOwned>(endpoint: &str, body: &str) -> Result<T> {
    match serde_json::from_str(body) {
        Ok(value) => Ok(value),
        Err(first) => serde_json::from_str(&python_literal_to_json(body)).map_err(|_| {
            DecsError::Decode {
                endpoint: endpoint.to_string(),
                message: first.to_string(),
            }
        }),
    }
}

/// Decode a numeric ID returned as a bare number or a quoted string
pub fn decode_id(endpoint: &str, body: &str) -> Result<u64> {
    let trimmed = body.trim().trim_matches('"');
    trimmed.parse::<u64>().map_err(|_| DecsError::Decode {
        endpoint: endpoint.to_string(),
        message: format!("expected a numeric ID, got '{}'", truncate(body, 64)),
    })
}

/// Decode a string token returned either as a JSON string or as plain text
pub fn decode_token(body: &str) -> String {
    serde_json::from_str::<String>(body)
        .unwrap_or_else(|_| body.trim().trim_matches('"').to_string())
}

/// Rewrite `u'x'`, `'x'`, `True`, `False` and `None` into their JSON spellings.
///
/// Only applied as a fallback, so well-formed JSON is never touched. String contents are
/// copied as they are and keywords are only replaced as whole words.
pub fn python_literal_to_json(body: &str) -> String {
    let mut out = String::with_capacity(body.len());
    let mut chars = body.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '\'' || c == '"' {
            copy_string_literal(c, &mut chars, &mut out);
        } else if c.is_alphanumeric() || c == '_' {
            let mut word = String::from(c);
            while let Some(&next) = chars.peek() {
                if !(next.is_alphanumeric() || next == '_') {
                    break;
                }
                word.push(next);
                chars.next();
            }
            match word.as_str() {
                // unicode prefix of the string that follows
                "u" if matches!(chars.peek(), Some('\'' | '"')) => {}
                "True" => out.push_str("true"),
                "False" => out.push_str("false"),
                "None" => out.push_str("null"),
                other => out.push_str(other),
            }
        } else {
            out.push(c);
        }
    }
    out
}

/// Copy one string literal opened by `quote` as a double-quoted JSON string
fn copy_string_literal(
    quote: char,
    chars: &mut std::iter::Peekable<std::str::Chars<'_>>,
    out: &mut String,
) {
    out.push('"');
    while let Some(c) = chars.next() {
        match c {
            '\\' => match chars.next() {
                Some('\'') => out.push('\''),
                Some(escaped) => {
                    out.push('\\');
                    out.push(escaped);
                }
                None => out.push_str("\\\\"),
            },
            '"' if quote == '\'' => out.push_str("\\\""),
            c if c == quote => break,
            c => out.push(c),
        }
    }
    out.push('"');
}

pub(crate) fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

/// Answer of the JWT exchange endpoint
#[derive(Debug, Clone, Default, Deserialize)]
pub struct JwtExchangeRecord {
    #[serde(default)]
    pub username: String,
    #[serde(default, alias = "sid")]
    pub session_id: Option<String>,
}

/// Entry of `cloudspaces/list`
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ResgroupRecord {
    pub id: u64,
    pub name: String,
    pub status: String,
    #[serde(rename = "accountId")]
    pub tenant_id: u64,
    #[serde(rename = "accountName")]
    pub tenant_name: String,
    #[serde(rename = "gid")]
    pub grid_id: u64,
    pub location: String,
    #[serde(rename = "externalnetworkip")]
    pub ext_ip: String,
    #[serde(rename = "publicipaddress")]
    pub public_ip: String,
}

/// Resource limits of a resource group; `-1` means unlimited
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(default)]
pub struct QuotaRecord {
    #[serde(rename = "CU_C")]
    pub cpu: f64,
    /// RAM in MB; the controller reports it as a float
    #[serde(rename = "CU_M")]
    pub ram: f64,
    #[serde(rename = "CU_D")]
    pub disk: f64,
    #[serde(rename = "CU_NP")]
    pub net_traffic: f64,
    #[serde(rename = "CU_I")]
    pub ext_ips: f64,
}

impl Default for QuotaRecord {
    fn default() -> Self {
        Self {
            cpu: -1.0,
            ram: -1.0,
            disk: -1.0,
            net_traffic: -1.0,
            ext_ips: -1.0,
        }
    }
}

/// Answer of `cloudspaces/get`
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ResgroupDetailsRecord {
    pub id: u64,
    pub name: String,
    pub status: String,
    pub description: String,
    #[serde(rename = "accountId")]
    pub tenant_id: u64,
    #[serde(rename = "gid")]
    pub grid_id: u64,
    pub location: String,
    #[serde(rename = "externalnetworkip")]
    pub ext_ip: String,
    #[serde(rename = "publicipaddress")]
    pub public_ip: String,
    #[serde(rename = "resourceLimits")]
    pub quotas: QuotaRecord,
}

/// Entry of `machines/list`
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct MachineRecord {
    pub id: u64,
    pub name: String,
    pub status: String,
    #[serde(rename = "vcpus")]
    pub cpu: u32,
    #[serde(rename = "memory")]
    pub ram: u32,
    #[serde(rename = "imageId")]
    pub image_id: u64,
    #[serde(rename = "storage")]
    pub boot_disk: u32,
}

/// Disk as reported inside `machines/get`
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct DiskRecord {
    pub id: u64,
    /// Disk label as given at creation
    #[serde(rename = "name")]
    pub label: String,
    #[serde(rename = "descr")]
    pub description: String,
    pub status: String,
    /// `B` for boot disks, `D` for data disks
    #[serde(rename = "type")]
    pub disk_type: String,
    #[serde(rename = "sizeMax")]
    pub size_max: u32,
    pub pool: String,
    #[serde(rename = "sepid")]
    pub sep_id: u64,
}

impl DiskRecord {
    pub fn is_boot(&self) -> bool {
        self.disk_type.eq_ignore_ascii_case("B")
    }
}

/// Network interface as reported inside `machines/get`
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct NicRecord {
    pub status: String,
    #[serde(rename = "macAddress")]
    pub mac_address: String,
    #[serde(rename = "deviceName")]
    pub device_name: String,
    /// `bridge` for internal networks, `PUBLIC` for external ones
    #[serde(rename = "type")]
    pub nic_type: String,
    /// e.g. `gateway:176.118.165.1 externalnetworkId:6`
    pub params: String,
    #[serde(rename = "networkId")]
    pub network_id: u64,
    #[serde(rename = "ipAddress")]
    pub ip_address: String,
    #[serde(rename = "referenceId")]
    pub reference_id: String,
}

impl NicRecord {
    /// External network ID parsed out of `params`, for NICs on an external network
    pub fn external_network_id(&self) -> Option<u64> {
        self.params
            .split_whitespace()
            .find_map(|kv| kv.strip_prefix("externalnetworkId:"))
            .and_then(|id| id.parse().ok())
    }
}

/// Guest OS account created by the controller
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct GuestLoginRecord {
    pub guid: String,
    pub login: String,
    pub password: String,
}

/// Answer of `machines/get`
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct MachineDetailsRecord {
    pub id: u64,
    pub name: String,
    pub status: String,
    pub description: String,
    pub hostname: String,
    #[serde(rename = "cloudspaceId", alias = "cloudspaceid")]
    pub resgroup_id: u64,
    #[serde(rename = "vcpus")]
    pub cpu: u32,
    #[serde(rename = "memory")]
    pub ram: u32,
    /// Requested boot disk size in GB, not the boot disk ID
    #[serde(rename = "storage")]
    pub boot_disk: u32,
    #[serde(rename = "imageid")]
    pub image_id: u64,
    #[serde(rename = "osImage")]
    pub image_name: String,
    pub disks: Vec<DiskRecord>,
    #[serde(rename = "interfaces")]
    pub nics: Vec<NicRecord>,
    #[serde(rename = "accounts")]
    pub guest_logins: Vec<GuestLoginRecord>,
}

/// Entry of `portforwarding/list`
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct PortForwardRecord {
    #[serde(rename = "protocol")]
    pub proto: String,
    #[serde(rename = "localPort")]
    pub int_port: String,
    #[serde(rename = "publicPort")]
    pub ext_port: String,
    #[serde(rename = "publicIp")]
    pub ext_ip: String,
    #[serde(rename = "localIp")]
    pub int_ip: String,
    #[serde(rename = "machineId")]
    pub machine_id: u64,
    #[serde(rename = "machineName")]
    pub machine_name: String,
}

/// Entry of `images/list`
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ImageRecord {
    pub id: u64,
    pub name: String,
    pub status: String,
    pub description: String,
    #[serde(rename = "type")]
    pub image_type: String,
    pub size: u32,
    pub username: String,
    #[serde(rename = "accountId")]
    pub tenant_id: u64,
    #[serde(rename = "sepid")]
    pub sep_id: u64,
    pub pool: String,
}

/// Entry of `externalnetwork/list`
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ExtNetworkRecord {
    pub id: u64,
    /// The controller puts the IP range into `name`
    #[serde(rename = "name")]
    pub ip_range: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_python_literal_body() {
        let body =
            "{u'id': 7, u'name': u'rg-1', u'status': u'CREATED', u'gid': 212, u'accountId': 3}";
        let record: ResgroupRecord = decode(RESGROUP_LIST_API, body).unwrap();
        assert_eq!(record.id, 7);
        assert_eq!(record.name, "rg-1");
        assert_eq!(record.grid_id, 212);
        assert_eq!(record.tenant_id, 3);
    }

    #[test]
    fn test_python_literal_keeps_string_contents() {
        let body = concat!(
            r#"{'name': u'O\'Brien', 'note': 'NoneSuch True', "#,
            r#"'quote': 'say "hi"', 'ok': True, 'gone': None}"#,
        );
        let value: serde_json::Value = decode(RESGROUP_LIST_API, body).unwrap();
        assert_eq!(value["name"], "O'Brien");
        assert_eq!(value["note"], "NoneSuch True");
        assert_eq!(value["quote"], "say \"hi\"");
        assert_eq!(value["ok"], true);
        assert!(value["gone"].is_null());
    }

    #[test]
    fn test_decode_error_names_endpoint() {
        let err = decode::<MachineRecord>(MACHINE_GET_API, "<html>oops</html>").unwrap_err();
        assert!(matches!(
            err,
            DecsError::Decode { ref endpoint, .. } if endpoint == MACHINE_GET_API
        ));
    }

    #[test]
    fn test_decode_id_and_token() {
        assert_eq!(decode_id(MACHINE_CREATE_API, "1042\n").unwrap(), 1042);
        assert_eq!(decode_id(MACHINE_CREATE_API, "\"1042\"").unwrap(), 1042);
        assert!(decode_id(MACHINE_CREATE_API, "true").is_err());

        assert_eq!(decode_token("\"abc123\""), "abc123");
        assert_eq!(decode_token("abc123\n"), "abc123");
    }

    #[test]
    fn test_quota_ram_is_float() {
        let body =
            r#"{"id": 5, "resourceLimits": {"CU_C": 8, "CU_M": 16384.0, "CU_D": -1, "CU_I": 2}}"#;
        let record: ResgroupDetailsRecord = decode(RESGROUP_GET_API, body).unwrap();
        assert_eq!(record.quotas.cpu, 8.0);
        assert_eq!(record.quotas.ram, 16384.0);
        assert_eq!(record.quotas.net_traffic, -1.0);
    }

    #[test]
    fn test_nic_external_network_id() {
        let nic = NicRecord {
            nic_type: "PUBLIC".into(),
            params: "gateway:176.118.165.1 externalnetworkId:6".into(),
            ..Default::default()
        };
        assert_eq!(nic.external_network_id(), Some(6));
        assert_eq!(NicRecord::default().external_network_id(), None);
    }
}
