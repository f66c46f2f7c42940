//! 計算輸入與參數列表

use std::fmt;

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::{FusionError, Result};

/// 參數列表
///
/// 長度可變、有序的型別抹除參數槽；每個槽以 JSON 值保存，
/// 讀取時再以 `get::<T>` 解碼。
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ArgumentList(Vec<serde_json::Value>);

impl ArgumentList {
    /// 創建空的參數列表
    pub fn new() -> Self {
        Self(Vec::new())
    }

    /// 建構器模式：追加參數
    pub fn with<T: Serialize>(mut self, value: T) -> Result<Self> {
        self.push(value)?;
        Ok(self)
    }

    /// 追加參數
    pub fn push<T: Serialize>(&mut self, value: T) -> Result<()> {
        self.0.push(serde_json::to_value(value)?);
        Ok(())
    }

    /// 解碼指定位置的參數
    pub fn get<T: DeserializeOwned>(&self, index: usize) -> Result<T> {
        let slot = self.0.get(index).ok_or_else(|| {
            FusionError::Format(format!("參數索引 {} 超出範圍（共 {} 個）", index, self.0.len()))
        })?;
        Ok(serde_json::from_value(slot.clone())?)
    }

    /// 參數數量
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// 是否沒有參數
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// 序列化為位元組（作為快取指紋的一部分）
    pub fn to_bytes(&self) -> Result<Bytes> {
        Ok(Bytes::from(serde_json::to_vec(&self.0)?))
    }

    /// 從位元組還原
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        Ok(Self(serde_json::from_slice(data)?))
    }
}

/// 計算輸入
///
/// 由服務名稱、方法名稱與序列化後的參數組成，唯一識別一個計算。
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ComputedInput {
    service: String,
    method: String,
    arguments: Bytes,
}

impl ComputedInput {
    /// 從參數列表創建
    pub fn new(service: &str, method: &str, arguments: &ArgumentList) -> Result<Self> {
        Ok(Self::from_parts(service, method, arguments.to_bytes()?))
    }

    /// 從已序列化的參數創建
    pub fn from_parts(service: &str, method: &str, arguments: Bytes) -> Self {
        Self {
            service: service.to_string(),
            method: method.to_string(),
            arguments,
        }
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn arguments(&self) -> &Bytes {
        &self.arguments
    }

    /// 解碼參數列表
    pub fn argument_list(&self) -> Result<ArgumentList> {
        ArgumentList::from_bytes(&self.arguments)
    }
}

impl fmt::Display for ComputedInput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}.{}({})",
            self.service,
            self.method,
            String::from_utf8_lossy(&self.arguments)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_argument_list_slots() {
        let args = ArgumentList::new()
            .with("todo-1")
            .unwrap()
            .with(42_u32)
            .unwrap()
            .with(Some(true))
            .unwrap();

        assert_eq!(args.len(), 3);
        assert_eq!(args.get::<String>(0).unwrap(), "todo-1");
        assert_eq!(args.get::<u32>(1).unwrap(), 42);
        assert_eq!(args.get::<Option<bool>>(2).unwrap(), Some(true));

        // 越界與型別錯誤
        assert!(matches!(args.get::<u32>(3), Err(FusionError::Format(_))));
        assert!(matches!(args.get::<u32>(0), Err(FusionError::Serialization(_))));
    }

    #[test]
    fn test_input_identity_depends_on_all_parts() {
        let args = ArgumentList::new().with(1).unwrap().with(2).unwrap();
        let a = ComputedInput::new("math", "sum", &args).unwrap();
        let b = ComputedInput::new("math", "sum", &args).unwrap();
        let c = ComputedInput::new("math", "product", &args).unwrap();
        let d = ComputedInput::new("other", "sum", &args).unwrap();
        let e = ComputedInput::new("math", "sum", &ArgumentList::new().with(2).unwrap()).unwrap();

        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_ne!(a, d);
        assert_ne!(a, e);
    }

    #[test]
    fn test_input_display() {
        let args = ArgumentList::new().with(1).unwrap().with(2).unwrap();
        let input = ComputedInput::new("math", "sum", &args).unwrap();

        assert_eq!(input.to_string(), "math.sum([1,2])");
        assert_eq!(input.argument_list().unwrap(), args);
    }
}
