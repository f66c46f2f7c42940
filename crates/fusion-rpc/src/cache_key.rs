//! 遠端快取鍵

use std::fmt;

use bytes::Bytes;
use fusion_core::{ArgumentList, ComputedInput, Result};
use serde::{Deserialize, Serialize};

use crate::services::RpcMethodDef;

/// 遠端快取鍵：服務、方法與序列化後的參數
///
/// 逐位元組比較；與同一呼叫的 [`ComputedInput`] 一一對應。
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RpcCacheKey {
    pub service: String,
    pub method: String,
    pub argument_data: Bytes,
}

impl RpcCacheKey {
    pub fn new(method: &RpcMethodDef, arguments: &ArgumentList) -> Result<Self> {
        Ok(Self {
            service: method.service.clone(),
            method: method.method.clone(),
            argument_data: arguments.to_bytes()?,
        })
    }

    pub fn method_def(&self) -> RpcMethodDef {
        RpcMethodDef::new(&self.service, &self.method)
    }

    /// 對應的計算輸入
    pub fn to_input(&self) -> ComputedInput {
        ComputedInput::from_parts(&self.service, &self.method, self.argument_data.clone())
    }
}

impl fmt::Display for RpcCacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}.{}({})",
            self.service,
            self.method,
            String::from_utf8_lossy(&self.argument_data)
        )
    }
}

/// 快取資訊擷取模式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RpcCacheInfoCaptureMode {
    /// 只擷取鍵
    KeyOnly,
    /// 擷取鍵與回應資料
    KeyAndData,
}

/// 呼叫過程中擷取的快取資訊
#[derive(Debug, Clone)]
pub struct RpcCacheInfoCapture {
    pub mode: RpcCacheInfoCaptureMode,
    pub key: Option<RpcCacheKey>,
    pub data: Option<Bytes>,
}

impl RpcCacheInfoCapture {
    pub fn new(mode: RpcCacheInfoCaptureMode) -> Self {
        Self {
            mode,
            key: None,
            data: None,
        }
    }

    /// 記錄回應資料（只在 KeyAndData 模式）
    pub fn capture_data(&mut self, data: &Bytes) {
        if self.mode == RpcCacheInfoCaptureMode::KeyAndData {
            self.data = Some(data.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_matches_computed_input() {
        let method = RpcMethodDef::new("todo", "get");
        let args = ArgumentList::new().with("todo-1").unwrap();

        let key = RpcCacheKey::new(&method, &args).unwrap();
        let input = ComputedInput::new("todo", "get", &args).unwrap();
        assert_eq!(key.to_input(), input);
        assert_eq!(key.to_string(), "todo.get([\"todo-1\"])");
        assert_eq!(key.method_def(), method);
    }

    #[test]
    fn test_key_equality_is_bytewise() {
        let method = RpcMethodDef::new("todo", "get");
        let a = RpcCacheKey::new(&method, &ArgumentList::new().with(1).unwrap()).unwrap();
        let b = RpcCacheKey::new(&method, &ArgumentList::new().with(1).unwrap()).unwrap();
        let c = RpcCacheKey::new(&method, &ArgumentList::new().with("1").unwrap()).unwrap();

        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_key_only_skips_data() {
        let mut capture = RpcCacheInfoCapture::new(RpcCacheInfoCaptureMode::KeyOnly);
        capture.capture_data(&Bytes::from_static(b"42"));
        assert!(capture.data.is_none());

        let mut capture = RpcCacheInfoCapture::new(RpcCacheInfoCaptureMode::KeyAndData);
        capture.capture_data(&Bytes::from_static(b"42"));
        assert_eq!(capture.data, Some(Bytes::from_static(b"42")));
    }
}
