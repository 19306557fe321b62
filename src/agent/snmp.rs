use std::time::Duration;

use anyhow::Context;
use snmp2::{v3, SyncSession, Value};

use crate::model::{sec_level, snmp_version, Oid, SnmpParams};

/// Max repetitions asked per getbulk round.
const BULK_REPETITIONS: u32 = 10;

/// One name/value pair from an snmp reply, with the OID in
/// leading-dot dotted form.
#[derive(Debug, Clone)]
pub struct Pdu {
    pub name: String,
    pub value: PduValue,
}

/// Wire value decoded into an owned representation. This is the full set
/// of types the converter accepts; everything else is a decode error.
#[derive(Debug, Clone)]
pub enum PduValue {
    Int(i64),
    Uint(u32),
    Counter64(u64),
    OctetString(Vec<u8>),
    OpaqueFloat(f32),
    OpaqueDouble(f64),
    Oid(String),
    IpAddr(String),
    Bool(bool),
    Null,
    NoSuchObject,
    NoSuchInstance,
    EndOfMib,
}

impl PduValue {
    pub fn type_name(&self) -> &'static str {
        match self {
            PduValue::Int(_) => "Integer",
            PduValue::Uint(_) => "Unsigned32",
            PduValue::Counter64(_) => "Counter64",
            PduValue::OctetString(_) => "OctetString",
            PduValue::OpaqueFloat(_) => "OpaqueFloat",
            PduValue::OpaqueDouble(_) => "OpaqueDouble",
            PduValue::Oid(_) => "ObjectIdentifier",
            PduValue::IpAddr(_) => "IpAddress",
            PduValue::Bool(_) => "Boolean",
            PduValue::Null => "Null",
            PduValue::NoSuchObject => "NoSuchObject",
            PduValue::NoSuchInstance => "NoSuchInstance",
            PduValue::EndOfMib => "EndOfMibView",
        }
    }

    fn from_wire(value: &Value) -> Self {
        match value {
            Value::Integer(v) => PduValue::Int(*v),
            Value::Counter32(v) | Value::Unsigned32(v) | Value::Timeticks(v) => PduValue::Uint(*v),
            Value::Counter64(v) => PduValue::Counter64(*v),
            Value::OctetString(b) => PduValue::OctetString(b.to_vec()),
            Value::Opaque(b) => decode_opaque(b).unwrap_or_else(|| PduValue::OctetString(b.to_vec())),
            Value::ObjectIdentifier(oid) => PduValue::Oid(format!(".{}", oid)),
            Value::IpAddress(b) => PduValue::IpAddr(format!("{}.{}.{}.{}", b[0], b[1], b[2], b[3])),
            Value::Boolean(v) => PduValue::Bool(*v),
            Value::Null => PduValue::Null,
            Value::NoSuchObject => PduValue::NoSuchObject,
            Value::NoSuchInstance => PduValue::NoSuchInstance,
            Value::EndOfMibView => PduValue::EndOfMib,
            _ => PduValue::Null,
        }
    }
}

/// Opaque-wrapped floats per the SNMP special-types encoding:
/// 0x9f 0x78 len + ieee754 float, 0x9f 0x79 len + double.
fn decode_opaque(b: &[u8]) -> Option<PduValue> {
    if b.len() == 7 && b[0] == 0x9f && b[1] == 0x78 {
        let raw: [u8; 4] = b[3..7].try_into().ok()?;
        return Some(PduValue::OpaqueFloat(f32::from_be_bytes(raw)));
    }
    if b.len() == 11 && b[0] == 0x9f && b[1] == 0x79 {
        let raw: [u8; 8] = b[3..11].try_into().ok()?;
        return Some(PduValue::OpaqueDouble(f64::from_be_bytes(raw)));
    }
    None
}

/// One SNMP connection to a device. Sessions are bound to a community at
/// construction, so a second session is kept for measures polled with the
/// device's alternate community. All calls are blocking and must run
/// inside `tokio::task::spawn_blocking`.
pub struct SnmpConn {
    session: SyncSession,
    alt_session: Option<SyncSession>,
    retries: u32,
    disable_bulk: bool,
    pub index: usize,
}

impl SnmpConn {
    /// Opens the connection(s) to the device. UDP has no handshake, so
    /// failures here are socket/resolution errors.
    pub fn dial(params: &SnmpParams, index: usize) -> anyhow::Result<Self> {
        let session = new_session(params, params.snmp_community.as_bytes())
            .with_context(|| format!("dial snmp conn #{}", index))?;
        let alt_session = if params.snmp_alternate_community.is_empty() {
            None
        } else {
            Some(
                new_session(params, params.snmp_alternate_community.as_bytes())
                    .with_context(|| format!("dial alternate snmp conn #{}", index))?,
            )
        };
        Ok(SnmpConn {
            session,
            alt_session,
            retries: params.snmp_retries,
            disable_bulk: params.snmp_disable_bulk,
            index,
        })
    }

    fn session(&mut self, alternate: bool) -> &mut SyncSession {
        match (&mut self.alt_session, alternate) {
            (Some(alt), true) => alt,
            (_, _) => &mut self.session,
        }
    }

    /// Single-OID GET, retried on timeout up to the device's retry count.
    pub fn get_one(&mut self, oid: &Oid, alternate: bool) -> anyhow::Result<Vec<Pdu>> {
        let wire = wire_oid(oid)?;
        let retries = self.retries;
        let sess = self.session(alternate);
        let mut last_err = None;
        for _ in 0..=retries {
            match sess.get(&wire) {
                Ok(mut pdu) => {
                    let mut out = Vec::new();
                    for (name, value) in pdu.varbinds {
                        out.push(Pdu {
                            name: format!(".{}", name),
                            value: PduValue::from_wire(&value),
                        });
                    }
                    return Ok(out);
                }
                Err(e) => {
                    let err = classify_snmp_err(e);
                    let retry = super::result::err_is_timeout(&err.to_string());
                    last_err = Some(err);
                    if !retry {
                        break;
                    }
                }
            }
        }
        Err(last_err.unwrap_or_else(|| anyhow::anyhow!("get {}: no reply", oid)))
    }

    /// Walks the subtree below `base`, with getnext for v1/bulk-disabled
    /// devices and getbulk otherwise. Replies outside the subtree end the
    /// walk.
    pub fn walk(&mut self, base: &Oid, alternate: bool) -> anyhow::Result<Vec<Pdu>> {
        let disable_bulk = self.disable_bulk;
        let base = base.clone();
        let mut cursor = base.components()?;
        let sess = self.session(alternate);
        let mut out: Vec<Pdu> = Vec::new();
        'walk: loop {
            let wire = snmp2::Oid::from(cursor.as_slice()).map_err(|e| anyhow::anyhow!("oid {:?}: {:?}", cursor, e))?;
            let pdu = if disable_bulk {
                sess.getnext(&wire)
            } else {
                sess.getbulk(&[&wire], 0, BULK_REPETITIONS)
            }
            .map_err(classify_snmp_err)?;
            let mut advanced = false;
            for (name, value) in pdu.varbinds {
                let dotted = format!(".{}", name);
                if matches!(value, Value::EndOfMibView) || !base.contains(&dotted) {
                    break 'walk;
                }
                out.push(Pdu {
                    name: dotted.clone(),
                    value: PduValue::from_wire(&value),
                });
                cursor = Oid::parse(&dotted)?.components()?;
                advanced = true;
            }
            if !advanced {
                break;
            }
        }
        Ok(out)
    }
}

fn new_session(params: &SnmpParams, community: &[u8]) -> anyhow::Result<SyncSession> {
    let addr = format!("{}:{}", params.ip_address, params.snmp_port);
    let timeout = Some(Duration::from_secs(params.snmp_timeout));
    let sess = match params.snmp_version.as_str() {
        snmp_version::V1 => SyncSession::new_v1(addr.as_str(), community, timeout, 0),
        snmp_version::V3 => SyncSession::new_v3(addr.as_str(), timeout, 0, v3_security(params)?),
        _ => SyncSession::new_v2c(addr.as_str(), community, timeout, 0),
    };
    sess.map_err(classify_snmp_err)
}

/// Maps the device's v3 parameters onto the library security settings.
fn v3_security(params: &SnmpParams) -> anyhow::Result<v3::Security> {
    let mut sec = v3::Security::new(params.snmpv3_auth_user.as_bytes(), params.snmpv3_auth_passwd.as_bytes());
    if params.snmpv3_security_level == sec_level::NO_AUTH_NO_PRIV {
        return Ok(sec);
    }
    match params.snmpv3_auth_proto.as_str() {
        "MD5" => sec = sec.with_auth_protocol(v3::AuthProtocol::Md5),
        "SHA" => sec = sec.with_auth_protocol(v3::AuthProtocol::Sha1),
        "" => {}
        other => anyhow::bail!("invalid snmpv3 auth protocol {}", other),
    }
    if params.snmpv3_security_level == sec_level::AUTH_PRIV {
        sec = sec.with_privacy_password(params.snmpv3_privacy_passwd.as_bytes());
        match params.snmpv3_privacy_proto.as_str() {
            "DES" => sec = sec.with_privacy_protocol(v3::PrivacyProtocol::Des),
            "AES" => sec = sec.with_privacy_protocol(v3::PrivacyProtocol::Aes128),
            "" => {}
            other => anyhow::bail!("invalid snmpv3 privacy protocol {}", other),
        }
    }
    Ok(sec)
}

fn wire_oid(oid: &Oid) -> anyhow::Result<snmp2::Oid<'static>> {
    let components = oid.components()?;
    snmp2::Oid::from(components.as_slice()).map_err(|e| anyhow::anyhow!("oid {}: {:?}", oid, e))
}

/// Folds library errors into messages the unreachable-classification
/// helpers understand.
fn classify_snmp_err(e: snmp2::Error) -> anyhow::Error {
    let msg = format!("{:?}", e);
    if msg.contains("Receive") || msg.contains("Timeout") || msg.contains("TimedOut") || msg.contains("WouldBlock") {
        anyhow::anyhow!("snmp timeout: {}", msg)
    } else if msg.contains("Refused") {
        anyhow::anyhow!("connection refused: {}", msg)
    } else {
        anyhow::anyhow!("snmp: {}", msg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_opaque_float() {
        let mut b = vec![0x9f, 0x78, 0x04];
        b.extend_from_slice(&1.5f32.to_be_bytes());
        match decode_opaque(&b) {
            Some(PduValue::OpaqueFloat(v)) => assert_eq!(v, 1.5),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_decode_opaque_double() {
        let mut b = vec![0x9f, 0x79, 0x08];
        b.extend_from_slice(&2.25f64.to_be_bytes());
        match decode_opaque(&b) {
            Some(PduValue::OpaqueDouble(v)) => assert_eq!(v, 2.25),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_decode_opaque_passthrough() {
        assert!(decode_opaque(b"plain text").is_none());
        assert!(decode_opaque(&[0x9f]).is_none());
    }
}
