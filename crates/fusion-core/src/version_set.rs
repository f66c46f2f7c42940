//! API 版本集合
//!
//! 握手時交換，用來在信任對端快取之前偵測協定或結構的版本差異。
//! 文字格式為 `scope=1.2,other=3.0`。

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::{FusionError, Result};

/// 語意化 API 版本
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ApiVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl ApiVersion {
    /// 零版本（缺少的範圍以此表示）
    pub const ZERO: ApiVersion = ApiVersion::new(0, 0, 0);

    pub const fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }

    /// 是否能滿足所需版本：主版本相同，且不低於所需版本
    pub fn satisfies(&self, required: &ApiVersion) -> bool {
        self.major == required.major && self >= required
    }
}

impl fmt::Display for ApiVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.patch == 0 {
            write!(f, "{}.{}", self.major, self.minor)
        } else {
            write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
        }
    }
}

impl FromStr for ApiVersion {
    type Err = FusionError;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || FusionError::Format(format!("無效的版本: {}", s));
        let parts: Vec<&str> = s.trim().split('.').collect();
        if parts.is_empty() || parts.len() > 3 {
            return Err(invalid());
        }

        let mut numbers = [0_u32; 3];
        for (i, part) in parts.iter().enumerate() {
            numbers[i] = part.parse().map_err(|_| invalid())?;
        }
        Ok(ApiVersion::new(numbers[0], numbers[1], numbers[2]))
    }
}

/// 版本集合：範圍名稱 → 版本
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct VersionSet {
    items: BTreeMap<String, ApiVersion>,
}

impl VersionSet {
    /// 創建空的版本集合
    pub fn new() -> Self {
        Self::default()
    }

    /// 建構器模式：加入範圍版本
    pub fn with(mut self, scope: &str, version: ApiVersion) -> Self {
        self.items.insert(scope.to_string(), version);
        self
    }

    /// 取得範圍的版本，缺少時為零版本
    pub fn get(&self, scope: &str) -> ApiVersion {
        self.items.get(scope).copied().unwrap_or(ApiVersion::ZERO)
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &ApiVersion)> {
        self.items.iter().map(|(scope, version)| (scope.as_str(), version))
    }

    /// 格式化為 `scope=version,...`
    pub fn format(&self) -> String {
        self.items
            .iter()
            .map(|(scope, version)| format!("{}={}", scope, version))
            .collect::<Vec<_>>()
            .join(",")
    }

    /// 解析版本集合
    pub fn parse(s: &str) -> Result<Self> {
        Self::parse_with(s, false)
    }

    /// 解析版本集合，`ignore_errors` 為真時略過無法解析的項目
    pub fn parse_with(s: &str, ignore_errors: bool) -> Result<Self> {
        let mut items = BTreeMap::new();
        for item in s.split(',').map(str::trim).filter(|item| !item.is_empty()) {
            let parsed = item
                .split_once('=')
                .ok_or_else(|| FusionError::Format(format!("缺少 '=': {}", item)))
                .and_then(|(scope, version)| Ok((scope.trim(), version.parse::<ApiVersion>()?)));
            match parsed {
                Ok((scope, version)) => {
                    items.insert(scope.to_string(), version);
                }
                Err(_) if ignore_errors => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(Self { items })
    }

    /// 檢查此（遠端）版本集合是否滿足所有必要範圍
    pub fn check_compatible(&self, required: &VersionSet) -> Result<()> {
        for (scope, required_version) in required.iter() {
            let actual = self.get(scope);
            if !actual.satisfies(required_version) {
                return Err(FusionError::VersionMismatch {
                    scope: scope.to_string(),
                    required: required_version.to_string(),
                    actual: actual.to_string(),
                });
            }
        }
        Ok(())
    }
}

impl fmt::Display for VersionSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VersionSet(\"{}\")", self.format())
    }
}

impl TryFrom<String> for VersionSet {
    type Error = FusionError;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(&value)
    }
}

impl From<VersionSet> for String {
    fn from(value: VersionSet) -> Self {
        value.format()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rstest::rstest;

    #[test]
    fn test_parse_and_format() {
        let set = VersionSet::parse("api=1.2, storage=3.0.1").unwrap();

        assert_eq!(set.len(), 2);
        assert_eq!(set.get("api"), ApiVersion::new(1, 2, 0));
        assert_eq!(set.get("storage"), ApiVersion::new(3, 0, 1));
        assert_eq!(set.get("missing"), ApiVersion::ZERO);
        assert_eq!(set.format(), "api=1.2,storage=3.0.1");
    }

    #[test]
    fn test_parse_empty() {
        assert!(VersionSet::parse("").unwrap().is_empty());
    }

    #[test]
    fn test_parse_errors() {
        assert!(VersionSet::parse("api").is_err());
        assert!(VersionSet::parse("api=x.y").is_err());

        // 忽略錯誤時只保留有效項目
        let set = VersionSet::parse_with("api, storage=2.1, bad=1.a", true).unwrap();
        assert_eq!(set.len(), 1);
        assert_eq!(set.get("storage"), ApiVersion::new(2, 1, 0));
    }

    #[test]
    fn test_serde_as_string() {
        let set = VersionSet::new().with("api", ApiVersion::new(1, 0, 0));
        let json = serde_json::to_string(&set).unwrap();
        assert_eq!(json, "\"api=1.0\"");

        let restored: VersionSet = serde_json::from_str(&json).unwrap();
        assert_eq!(restored, set);
    }

    #[rstest]
    #[case("api=1.2", "api=1.2", true)]
    #[case("api=1.5", "api=1.2", true)]
    #[case("api=1.1", "api=1.2", false)]
    #[case("api=2.0", "api=1.2", false)]
    #[case("", "api=1.0", false)]
    #[case("api=1.0,extra=9.9", "", true)]
    fn test_check_compatible(#[case] remote: &str, #[case] required: &str, #[case] ok: bool) {
        let remote = VersionSet::parse(remote).unwrap();
        let required = VersionSet::parse(required).unwrap();

        let result = remote.check_compatible(&required);
        assert_eq!(result.is_ok(), ok);
        if !ok {
            assert!(matches!(result, Err(FusionError::VersionMismatch { .. })));
        }
    }

    proptest! {
        #[test]
        fn prop_format_parse_is_stable(
            entries in proptest::collection::btree_map("[a-z]{1,8}", (0u32..50, 0u32..50, 0u32..50), 0..6)
        ) {
            let mut set = VersionSet::new();
            for (scope, (major, minor, patch)) in &entries {
                set = set.with(scope, ApiVersion::new(*major, *minor, *patch));
            }
            let parsed = VersionSet::parse(&set.format()).unwrap();
            prop_assert_eq!(parsed, set);
        }
    }
}
