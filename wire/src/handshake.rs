use serde::{Deserialize, Serialize};

use crate::node::NodeDetails;

/// Sent exactly once by the orchestrator's `/api/v1/node_token` response,
/// routed through the host's bootstrap flow to the guest's agent installer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistrationDetails {
    pub k8s_token: String,
    pub k8s_ip: String,
    pub k8s_port: u16,
    pub vpn_token: String,
    pub vpn_ip: String,
    pub vpn_port: u16,
}

/// Host -> guest, bootstrap channel. Sent exactly once; authoritative
/// binding of the guest to this host and this orchestrator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandshakeReceptionMessage {
    pub ip: String,
    pub port: u16,
    /// Base64-encoded PEM bytes of the X.509 cert the guest must pin when
    /// it later opens the persistent TLS channel back to this host.
    pub secret_key: String,
    pub server_url: String,
    pub machine_unique_identification: NodeDetails,
}

impl HandshakeReceptionMessage {
    pub fn new(
        ip: String,
        port: u16,
        cert_pem: &[u8],
        server_url: String,
        node: NodeDetails,
    ) -> Self {
        Self {
            ip,
            port,
            secret_key: base64_encode(cert_pem),
            server_url,
            machine_unique_identification: node,
        }
    }

    /// Decodes `secret_key` back into PEM bytes. The only trusted TLS anchor
    /// the guest pins when reconnecting on the persistent channel.
    pub fn cert_pem(&self) -> Result<Vec<u8>, base64::DecodeError> {
        base64_decode(&self.secret_key)
    }
}

fn base64_encode(bytes: &[u8]) -> String {
    use base64::Engine;
    base64::engine::general_purpose::STANDARD.encode(bytes)
}

fn base64_decode(s: &str) -> Result<Vec<u8>, base64::DecodeError> {
    use base64::Engine;
    base64::engine::general_purpose::STANDARD.decode(s)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HandshakeStatus {
    Success,
    Initializing,
    Failure,
}

impl HandshakeStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, HandshakeStatus::Success | HandshakeStatus::Failure)
    }
}

// The original protocol accepted either the status name ("SUCCESS") or its
// historical ordinal (0/1/2); accept both on the wire, but only ever emit
// the name.
impl<'de> Deserialize<'de> for HandshakeStatus {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let value = serde_json::Value::deserialize(deserializer)?;
        match value {
            serde_json::Value::String(s) => match s.to_uppercase().as_str() {
                "SUCCESS" => Ok(HandshakeStatus::Success),
                "INITIALIZING" => Ok(HandshakeStatus::Initializing),
                "FAILURE" => Ok(HandshakeStatus::Failure),
                other => Err(serde::de::Error::custom(format!(
                    "unknown handshake status: {other}"
                ))),
            },
            serde_json::Value::Number(n) => match n.as_u64() {
                Some(0) => Ok(HandshakeStatus::Success),
                Some(1) => Ok(HandshakeStatus::Initializing),
                Some(2) => Ok(HandshakeStatus::Failure),
                _ => Err(serde::de::Error::custom(format!(
                    "unknown handshake status ordinal: {n}"
                ))),
            },
            other => Err(serde::de::Error::custom(format!(
                "unexpected handshake status shape: {other}"
            ))),
        }
    }
}

/// Guest -> host, bootstrap channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandshakeResponse {
    #[serde(rename = "STATUS")]
    pub status: HandshakeStatus,
    #[serde(rename = "DESCRIPTION")]
    pub description: String,
}

impl HandshakeResponse {
    pub fn initializing(description: impl Into<String>) -> Self {
        Self { status: HandshakeStatus::Initializing, description: description.into() }
    }

    pub fn success(description: impl Into<String>) -> Self {
        Self { status: HandshakeStatus::Success, description: description.into() }
    }

    pub fn failure(description: impl Into<String>) -> Self {
        Self { status: HandshakeStatus::Failure, description: description.into() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cert_pem_round_trips_through_base64() {
        let node = NodeDetails::new("host-1", "abc");
        let msg = HandshakeReceptionMessage::new(
            "10.0.0.1".into(),
            8443,
            b"-----BEGIN CERTIFICATE-----\nabc\n-----END CERTIFICATE-----\n",
            "http://orchestrator".into(),
            node,
        );
        assert_eq!(
            msg.cert_pem().unwrap(),
            b"-----BEGIN CERTIFICATE-----\nabc\n-----END CERTIFICATE-----\n"
        );
    }

    #[test]
    fn status_accepts_name_and_ordinal() {
        let by_name: HandshakeResponse =
            serde_json::from_str(r#"{"STATUS":"SUCCESS","DESCRIPTION":"ok"}"#).unwrap();
        assert_eq!(by_name.status, HandshakeStatus::Success);

        let by_ordinal: HandshakeResponse =
            serde_json::from_str(r#"{"STATUS":2,"DESCRIPTION":"bad"}"#).unwrap();
        assert_eq!(by_ordinal.status, HandshakeStatus::Failure);
    }

    #[test]
    fn terminal_status_classification() {
        assert!(HandshakeStatus::Success.is_terminal());
        assert!(HandshakeStatus::Failure.is_terminal());
        assert!(!HandshakeStatus::Initializing.is_terminal());
    }
}
