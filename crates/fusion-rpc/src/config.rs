//! RPC 配置

use std::time::Duration;

use fusion_core::config::duration_ms;
use fusion_core::{Result, VersionSet};
use serde::{Deserialize, Serialize};

/// 遠端計算的快取模式
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum RemoteCacheMode {
    /// 先呼叫遠端，暫時性失敗時退回本地快取
    #[default]
    NetworkFirst,
    /// 先回傳本地快取，背景更新
    CacheFirst,
}

/// RPC 配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RpcConfig {
    /// 單次呼叫最多重新路由次數
    pub max_reroutes: u32,

    /// 客戶端快取的批次寫入延遲
    #[serde(with = "duration_ms")]
    pub client_cache_flush_delay: Duration,

    /// 遠端計算快取模式
    pub remote_cache_mode: RemoteCacheMode,

    /// 本端提供的 API 版本
    pub local_versions: VersionSet,

    /// 要求對端滿足的 API 版本
    pub required_versions: VersionSet,
}

impl RpcConfig {
    pub fn new() -> Self {
        Self {
            max_reroutes: 8,
            client_cache_flush_delay: Duration::from_millis(100),
            remote_cache_mode: RemoteCacheMode::NetworkFirst,
            local_versions: VersionSet::new(),
            required_versions: VersionSet::new(),
        }
    }

    /// 從 JSON 讀取配置
    pub fn from_json_str(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// 建構器模式：設置最多重新路由次數
    pub fn with_max_reroutes(mut self, max_reroutes: u32) -> Self {
        self.max_reroutes = max_reroutes;
        self
    }

    /// 建構器模式：設置快取寫入延遲
    pub fn with_client_cache_flush_delay(mut self, delay: Duration) -> Self {
        self.client_cache_flush_delay = delay;
        self
    }

    /// 建構器模式：設置快取模式
    pub fn with_remote_cache_mode(mut self, mode: RemoteCacheMode) -> Self {
        self.remote_cache_mode = mode;
        self
    }

    /// 建構器模式：設置本端版本
    pub fn with_local_versions(mut self, versions: VersionSet) -> Self {
        self.local_versions = versions;
        self
    }

    /// 建構器模式：設置要求版本
    pub fn with_required_versions(mut self, versions: VersionSet) -> Self {
        self.required_versions = versions;
        self
    }
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fusion_core::ApiVersion;

    #[test]
    fn test_config_from_json() {
        let json = r#"{
            "max_reroutes": 3,
            "client_cache_flush_delay": 250,
            "remote_cache_mode": "CacheFirst",
            "required_versions": "api=1.2"
        }"#;

        let config = RpcConfig::from_json_str(json).unwrap();
        assert_eq!(config.max_reroutes, 3);
        assert_eq!(config.client_cache_flush_delay, Duration::from_millis(250));
        assert_eq!(config.remote_cache_mode, RemoteCacheMode::CacheFirst);
        assert_eq!(config.required_versions.get("api"), ApiVersion::new(1, 2, 0));
        assert!(config.local_versions.is_empty());
    }
}
