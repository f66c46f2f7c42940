//! 對端握手

use fusion_core::{Result, VersionSet};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// 握手訊息
///
/// 每個連線交換一次；接收方檢查對端的 API 版本後才信任它的快取。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpcHandshake {
    pub remote_peer_id: Uuid,
    pub remote_api_version_set: Option<VersionSet>,
}

impl RpcHandshake {
    pub fn new(peer_id: Uuid, versions: Option<VersionSet>) -> Self {
        Self {
            remote_peer_id: peer_id,
            remote_api_version_set: versions,
        }
    }

    /// 檢查對端版本是否滿足要求（缺少版本集合視為空集合）
    pub fn verify(&self, required: &VersionSet) -> Result<()> {
        match &self.remote_api_version_set {
            Some(versions) => versions.check_compatible(required),
            None => VersionSet::new().check_compatible(required),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fusion_core::FusionError;

    #[test]
    fn test_handshake_serde() {
        let handshake = RpcHandshake::new(Uuid::new_v4(), Some(VersionSet::parse("api=1.0").unwrap()));
        let json = serde_json::to_string(&handshake).unwrap();
        assert!(json.contains("\"api=1.0\""));

        let restored: RpcHandshake = serde_json::from_str(&json).unwrap();
        assert_eq!(restored, handshake);
    }

    #[test]
    fn test_verify() {
        let required = VersionSet::parse("api=1.2").unwrap();

        let newer = RpcHandshake::new(Uuid::new_v4(), Some(VersionSet::parse("api=1.4").unwrap()));
        assert!(newer.verify(&required).is_ok());

        let older = RpcHandshake::new(Uuid::new_v4(), Some(VersionSet::parse("api=1.1").unwrap()));
        assert!(matches!(
            older.verify(&required),
            Err(FusionError::VersionMismatch { .. })
        ));

        let missing = RpcHandshake::new(Uuid::new_v4(), None);
        assert!(missing.verify(&required).is_err());
        assert!(missing.verify(&VersionSet::new()).is_ok());
    }
}
