//! 备用键解析层的行为配置。
//!
//! # 教案式说明
//! - **意图 (Why)**：选择器参数名、批量 id 参数名、批量失败策略等差异外部化为配置，
//!   使改写阶段本身保持无状态并可在不同服务间复用；
//! - **结构 (How)**：[`AltKeyConfig`] 派生 `serde::Deserialize`，所有字段都有默认值，
//!   可从 TOML 片段加载，缺省字段回落到默认；
//! - **契约 (What)**：`from_toml_str` 在字段为空或两个参数名冲突时返回 [`ConfigError`]。

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const DEFAULT_SELECTOR_PARAM: &str = "altkey";
pub const DEFAULT_BATCH_IDS_PARAM: &str = "ids";
pub const DEFAULT_CREATED_ID_HEADER: &str = "X-Resource-Id";
pub const DEFAULT_LOCATION_HEADER: &str = "Location";

/// 批量 id 列表中某个备用键被 Coercer 拒绝时的处理策略。
///
/// - `PerKeyError`：跳过该键，在响应的错误映射中以原始字符串为键记录一条 400；
/// - `RejectRequest`：整批请求以 400 失败。
///
/// 两种策略都只作用于 [`crate::coercer::CoercionError::Invalid`]；Coercer 故障始终以 500 终止请求。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchFailurePolicy {
    #[default]
    PerKeyError,
    RejectRequest,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AltKeyConfig {
    /// 选择备用键空间的查询参数名。
    pub selector_param: String,
    /// 批量操作的 id 列表查询参数名。
    pub batch_ids_param: String,
    pub batch_failure_policy: BatchFailurePolicy,
    /// 是否校验 Coercer 产出的主键满足资源形状。
    pub validate_keys: bool,
    pub created_id_header: String,
    pub location_header: String,
}

impl Default for AltKeyConfig {
    fn default() -> Self {
        Self {
            selector_param: DEFAULT_SELECTOR_PARAM.to_owned(),
            batch_ids_param: DEFAULT_BATCH_IDS_PARAM.to_owned(),
            batch_failure_policy: BatchFailurePolicy::default(),
            validate_keys: true,
            created_id_header: DEFAULT_CREATED_ID_HEADER.to_owned(),
            location_header: DEFAULT_LOCATION_HEADER.to_owned(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to parse alternative key configuration: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("configuration field `{field}` must not be empty")]
    EmptyField { field: &'static str },
    #[error("`selector_param` and `batch_ids_param` must differ (both are `{0}`)")]
    ParamCollision(String),
}

impl AltKeyConfig {
    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        let config: AltKeyConfig = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        for (field, value) in [
            ("selector_param", &self.selector_param),
            ("batch_ids_param", &self.batch_ids_param),
            ("created_id_header", &self.created_id_header),
            ("location_header", &self.location_header),
        ] {
            if value.trim().is_empty() {
                return Err(ConfigError::EmptyField { field });
            }
        }
        if self.selector_param == self.batch_ids_param {
            return Err(ConfigError::ParamCollision(self.selector_param.clone()));
        }
        Ok(())
    }

    #[must_use]
    pub fn with_batch_failure_policy(mut self, policy: BatchFailurePolicy) -> Self {
        self.batch_failure_policy = policy;
        self
    }
}
