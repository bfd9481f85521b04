//! Domain primitive types used across the DAOS CSI driver.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{CsiError, Result};

/// A DAOS pool and container pair named by a CSI volume id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VolumeRef {
    pool: String,
    container: String,
}

impl VolumeRef {
    /// Parses a `<pool>/<container>` volume id.
    ///
    /// Both halves must be non-empty and limited to ASCII alphanumerics,
    /// `.`, `_`, `:` and `-`. No normalization is attempted.
    ///
    /// # Errors
    ///
    /// Returns [`CsiError::InvalidVolumeId`] for anything else.
    pub fn parse(volume_id: &str) -> Result<Self> {
        let invalid = |reason| CsiError::InvalidVolumeId {
            id: volume_id.to_string(),
            reason,
        };

        if volume_id.is_empty() {
            return Err(invalid("volume id must be provided"));
        }
        let (pool, container) = volume_id
            .split_once('/')
            .ok_or_else(|| invalid("expected <pool>/<container>"))?;
        if pool.is_empty() {
            return Err(invalid("pool name is empty"));
        }
        if container.is_empty() {
            return Err(invalid("container name is empty"));
        }
        if container.contains('/') {
            return Err(invalid("too many path segments"));
        }
        if !pool.chars().all(is_name_char) || !container.chars().all(is_name_char) {
            return Err(invalid("unsupported character"));
        }

        Ok(Self {
            pool: pool.to_string(),
            container: container.to_string(),
        })
    }

    /// Returns the pool name.
    pub fn pool(&self) -> &str {
        &self.pool
    }

    /// Returns the container name.
    pub fn container(&self) -> &str {
        &self.container
    }
}

impl fmt::Display for VolumeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.pool, self.container)
    }
}

const fn is_name_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | ':' | '-')
}

/// Configuration sent to the sidecar next to the FUSE handle.
///
/// The handle itself never appears here; it rides the same message as
/// `SCM_RIGHTS` ancillary data.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HandoffPayload {
    /// Kubernetes volume name from the target path.
    #[serde(rename = "volumeName", skip_serializing_if = "String::is_empty")]
    pub volume_name: String,
    /// DAOS pool to mount.
    #[serde(rename = "daosPoolName", skip_serializing_if = "String::is_empty")]
    pub pool_name: String,
    /// DAOS container to mount.
    #[serde(rename = "daosContainerName", skip_serializing_if = "String::is_empty")]
    pub container_name: String,
}

impl HandoffPayload {
    /// Builds the payload for a resolved volume.
    #[must_use]
    pub fn new(volume_name: impl Into<String>, volume: &VolumeRef) -> Self {
        Self {
            volume_name: volume_name.into(),
            pool_name: volume.pool().to_string(),
            container_name: volume.container().to_string(),
        }
    }

    /// Serializes the payload into its wire form.
    ///
    /// # Errors
    ///
    /// Returns an error if JSON serialization fails.
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Parses a payload received from the driver.
    ///
    /// # Errors
    ///
    /// Returns an error if the bytes are not a JSON object of this shape.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Code;

    #[test]
    fn parses_pool_and_container() {
        let v = VolumeRef::parse("poolA/containerB").unwrap();
        assert_eq!(v.pool(), "poolA");
        assert_eq!(v.container(), "containerB");
        assert_eq!(v.to_string(), "poolA/containerB");
    }

    #[test]
    fn rejects_malformed_ids() {
        for id in [
            "",
            "pool",
            "/container",
            "pool/",
            "a/b/c",
            "pool /c",
            "pool/c\n",
            "../etc",
        ] {
            let err = VolumeRef::parse(id).unwrap_err();
            assert_eq!(err.code(), Code::InvalidArgument, "{id:?}");
        }
    }

    #[test]
    fn accepts_uuid_like_names() {
        let v = VolumeRef::parse("tank_1:prod/3f2a-9c.ctr").unwrap();
        assert_eq!(v.pool(), "tank_1:prod");
        assert_eq!(v.container(), "3f2a-9c.ctr");
    }

    #[test]
    fn payload_uses_sidecar_wire_names() {
        let v = VolumeRef::parse("poolA/containerB").unwrap();
        let payload = HandoffPayload::new("v1", &v);
        let json: serde_json::Value = serde_json::from_slice(&payload.encode().unwrap()).unwrap();
        assert_eq!(json["volumeName"], "v1");
        assert_eq!(json["daosPoolName"], "poolA");
        assert_eq!(json["daosContainerName"], "containerB");
    }

    #[test]
    fn payload_roundtrip_preserves_fields() {
        let payload = HandoffPayload {
            volume_name: "v1".into(),
            pool_name: "p".into(),
            container_name: "c".into(),
        };
        let bytes = payload.encode().unwrap();
        assert_eq!(HandoffPayload::decode(&bytes).unwrap(), payload);
        assert_eq!(HandoffPayload::decode(&bytes).unwrap().encode().unwrap(), bytes);
    }

    #[test]
    fn payload_omits_empty_fields() {
        let payload = HandoffPayload {
            volume_name: String::new(),
            pool_name: "p".into(),
            container_name: String::new(),
        };
        let bytes = payload.encode().unwrap();
        assert_eq!(bytes, br#"{"daosPoolName":"p"}"#);
        assert_eq!(HandoffPayload::decode(&bytes).unwrap(), payload);
    }

    #[test]
    fn payload_decode_rejects_garbage() {
        assert!(HandoffPayload::decode(b"not json").is_err());
    }
}
