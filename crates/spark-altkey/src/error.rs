//! # error 模块说明
//!
//! ## 角色定位（Why）
//! - 集中定义备用键解析层的请求期错误，并为每个变体给出稳定错误码与 HTTP 状态；
//! - 区分客户端错误（未知备用键名、格式错误的键）与服务端错误（Coercer 违约），
//!   后者意味着资源作者的代码需要修复，而非调用方重试。
//!
//! ## 设计要求（What）
//! - 所有错误类型派生 `thiserror::Error`；
//! - 错误码遵循 `altkey.<语义>` 命名约定，便于在日志与告警中聚合；
//! - 层外的错误（未找到实体、校验失败、Action 异常）不经过本模块，由 Dispatcher 原样返回。

use serde::Serialize;
use thiserror::Error;

use crate::coercer::CoercionError;
use crate::key::ShapeViolation;
use crate::key::codec::KeyDecodeError;
use crate::registry::{LookupError, ResourceId};
use crate::request::OperationKind;

/// 稳定错误码。
pub mod codes {
    /// 请求指定的备用键名未在资源上注册。
    pub const UNKNOWN_ALT_KEY: &str = "altkey.unknown";
    /// 请求未指向任何资源。
    pub const EMPTY_PATH: &str = "altkey.empty_path";
    /// 请求路径指向未声明的资源。
    pub const UNKNOWN_RESOURCE: &str = "altkey.resource_not_found";
    /// 备用键字符串被 Coercer 拒绝。
    pub const INVALID_ALT_KEY: &str = "altkey.invalid";
    /// 原生主键字符串无法解码。
    pub const MALFORMED_KEY: &str = "altkey.malformed_primary_key";
    /// 操作要求实体键但请求未提供。
    pub const KEY_REQUIRED: &str = "altkey.key_required";
    /// 操作不接受路径键却收到了路径键。
    pub const UNEXPECTED_KEY: &str = "altkey.unexpected_key";
    /// 批量操作缺少 id 列表参数。
    pub const BATCH_IDS_MISSING: &str = "altkey.batch_ids_missing";
    /// 批量实体映射中的键不在 id 列表内。
    pub const BATCH_ENTITY_MISMATCH: &str = "altkey.batch_entity_mismatch";
    /// Coercer 违反契约（抛出故障或无法渲染键）。
    pub const COERCER_FAULT: &str = "altkey.coercer_fault";
    /// Coercer 产出的主键不满足资源声明的形状。
    pub const SHAPE_VIOLATION: &str = "altkey.shape_violation";
}

/// 备用键解析层的请求期错误。
///
/// # 教案式说明
/// - **意图 (Why)**：请求改写与响应改写共享同一错误域，管线据此统一渲染错误响应，且保证错误请求不会抵达 Dispatcher；
/// - **契约 (What)**：
///   - [`AltKeyError::status`] 返回 HTTP 状态：客户端输入问题为 400，未知资源为 404，Coercer 违约为 500；
///   - [`AltKeyError::code`] 返回 [`codes`] 中的稳定错误码；
/// - **风险 (Trade-offs)**：使用 `String` 保存上下文，牺牲少量分配换取可读的诊断信息。
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum AltKeyError {
    #[error("unknown alternative key: `{name}` (resource `{resource}`)")]
    UnknownAltKey { resource: ResourceId, name: String },

    #[error("request does not address any resource")]
    EmptyPath,

    #[error("resource `{resource}` is not registered")]
    UnknownResource { resource: ResourceId },

    #[error("invalid alternative key `{raw}` for `{name}` on resource `{resource}`: {detail}")]
    InvalidAltKey {
        resource: ResourceId,
        name: String,
        raw: String,
        detail: String,
    },

    #[error("key `{raw}` is not a valid key for resource `{resource}`: {source}")]
    MalformedKey {
        resource: ResourceId,
        raw: String,
        #[source]
        source: KeyDecodeError,
    },

    #[error("{operation} on resource `{resource}` requires an entity key")]
    KeyRequired {
        operation: OperationKind,
        resource: ResourceId,
    },

    #[error("{operation} on resource `{resource}` does not accept a path key")]
    UnexpectedKey {
        operation: OperationKind,
        resource: ResourceId,
    },

    #[error("{operation} requires the `{param}` parameter")]
    BatchIdsMissing {
        operation: OperationKind,
        param: String,
    },

    #[error("batch entity key `{raw}` is not part of the requested ids")]
    BatchEntityMismatch { raw: String },

    #[error("key coercer `{name}` on resource `{resource}` failed: {detail}")]
    CoercerFault {
        resource: ResourceId,
        name: String,
        detail: String,
    },

    #[error("key coercer `{name}` on resource `{resource}` produced a malformed key: {source}")]
    ShapeViolation {
        resource: ResourceId,
        name: String,
        #[source]
        source: ShapeViolation,
    },
}

impl AltKeyError {
    pub fn status(&self) -> u16 {
        match self {
            AltKeyError::UnknownResource { .. } => 404,
            AltKeyError::CoercerFault { .. } | AltKeyError::ShapeViolation { .. } => 500,
            _ => 400,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            AltKeyError::UnknownAltKey { .. } => codes::UNKNOWN_ALT_KEY,
            AltKeyError::EmptyPath => codes::EMPTY_PATH,
            AltKeyError::UnknownResource { .. } => codes::UNKNOWN_RESOURCE,
            AltKeyError::InvalidAltKey { .. } => codes::INVALID_ALT_KEY,
            AltKeyError::MalformedKey { .. } => codes::MALFORMED_KEY,
            AltKeyError::KeyRequired { .. } => codes::KEY_REQUIRED,
            AltKeyError::UnexpectedKey { .. } => codes::UNEXPECTED_KEY,
            AltKeyError::BatchIdsMissing { .. } => codes::BATCH_IDS_MISSING,
            AltKeyError::BatchEntityMismatch { .. } => codes::BATCH_ENTITY_MISMATCH,
            AltKeyError::CoercerFault { .. } => codes::COERCER_FAULT,
            AltKeyError::ShapeViolation { .. } => codes::SHAPE_VIOLATION,
        }
    }

    pub fn is_server_fault(&self) -> bool {
        self.status() >= 500
    }

    /// 将 Coercer 的失败归类为请求错误。
    ///
    /// - `Invalid` → 400 [`AltKeyError::InvalidAltKey`]；
    /// - `Fault` → 500 [`AltKeyError::CoercerFault`]。
    pub fn from_coercion(
        resource: &ResourceId,
        name: &str,
        raw: &str,
        error: CoercionError,
    ) -> Self {
        match error {
            CoercionError::Invalid(detail) => AltKeyError::InvalidAltKey {
                resource: resource.clone(),
                name: name.to_owned(),
                raw: raw.to_owned(),
                detail,
            },
            CoercionError::Fault(detail) => AltKeyError::CoercerFault {
                resource: resource.clone(),
                name: name.to_owned(),
                detail,
            },
        }
    }

    /// 响应阶段渲染键失败：无论 Coercer 报告何种失败，均视为服务端故障。
    pub fn from_render(resource: &ResourceId, name: &str, error: CoercionError) -> Self {
        let detail = match error {
            CoercionError::Invalid(detail) | CoercionError::Fault(detail) => detail,
        };
        AltKeyError::CoercerFault {
            resource: resource.clone(),
            name: name.to_owned(),
            detail,
        }
    }
}

impl From<LookupError> for AltKeyError {
    fn from(value: LookupError) -> Self {
        match value {
            LookupError::UnknownResource(resource) => AltKeyError::UnknownResource { resource },
            LookupError::UnknownAltKey { resource, name } => {
                AltKeyError::UnknownAltKey { resource, name }
            }
        }
    }
}

/// 写入响应体的错误描述。
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ErrorDetail {
    pub status: u16,
    pub code: String,
    pub message: String,
}

impl ErrorDetail {
    pub fn new(status: u16, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            status,
            code: code.into(),
            message: message.into(),
        }
    }
}

impl From<&AltKeyError> for ErrorDetail {
    fn from(value: &AltKeyError) -> Self {
        ErrorDetail::new(value.status(), value.code(), value.to_string())
    }
}
