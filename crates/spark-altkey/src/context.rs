//! 请求级键上下文。
//!
//! # 教案式说明
//! - **意图 (Why)**：请求改写阶段需要把“本次请求使用了哪个备用键空间”以及“原始字符串 → 主键”的对应关系
//!   交给响应改写阶段，而 Dispatcher 对此毫无感知；
//! - **生命周期 (How)**：由 [`crate::request::RequestKeyRewriter`] 创建，按值交给
//!   [`crate::response::ResponseKeyRewriter`] 消费后丢弃，不跨请求共享，也不进入任何全局状态；
//! - **契约 (What)**：`active_alt_key` 为空表示主键寻址，响应改写随之退化为原生编码。

use crate::error::ErrorDetail;
use crate::key::PrimaryKey;
use crate::registry::ResourceId;
use crate::request::OperationKind;

/// 本次请求选中的备用键空间。
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ActiveAltKey {
    pub resource: ResourceId,
    pub name: String,
}

#[derive(Clone, Debug)]
pub struct RequestKeyContext {
    operation: OperationKind,
    target: ResourceId,
    collection_path: String,
    active: Option<ActiveAltKey>,
    resolved: Vec<(String, PrimaryKey)>,
    batch_key_errors: Vec<(String, ErrorDetail)>,
}

impl RequestKeyContext {
    pub(crate) fn new(
        operation: OperationKind,
        target: ResourceId,
        collection_path: String,
        active: Option<ActiveAltKey>,
    ) -> Self {
        Self {
            operation,
            target,
            collection_path,
            active,
            resolved: Vec::new(),
            batch_key_errors: Vec::new(),
        }
    }

    pub(crate) fn record_resolved(&mut self, raw: &str, key: PrimaryKey) {
        self.resolved.push((raw.to_owned(), key));
    }

    pub(crate) fn record_batch_error(&mut self, raw: &str, detail: ErrorDetail) {
        self.batch_key_errors.push((raw.to_owned(), detail));
    }

    pub fn operation(&self) -> OperationKind {
        self.operation
    }

    /// 请求最内层的目标资源。
    pub fn target(&self) -> &ResourceId {
        &self.target
    }

    /// 目标集合的路径，例如 `/altKey/Alt1/altKeySub`；`Location` 头在其后追加实体键。
    pub fn collection_path(&self) -> &str {
        &self.collection_path
    }

    pub fn active_alt_key(&self) -> Option<&ActiveAltKey> {
        self.active.as_ref()
    }

    pub fn active_alt_key_name(&self) -> Option<&str> {
        self.active.as_ref().map(|active| active.name.as_str())
    }

    /// 本次请求中所有成功解析的 `(原始字符串, 主键)` 对，按出现顺序排列。
    pub fn resolved(&self) -> &[(String, PrimaryKey)] {
        &self.resolved
    }

    pub fn resolved_key(&self, raw: &str) -> Option<&PrimaryKey> {
        self.resolved
            .iter()
            .find(|(candidate, _)| candidate == raw)
            .map(|(_, key)| key)
    }

    /// 批量 id 列表中被跳过的键及其错误描述，键为客户端原始字符串。
    pub fn batch_key_errors(&self) -> &[(String, ErrorDetail)] {
        &self.batch_key_errors
    }

    pub(crate) fn has_batch_error(&self, raw: &str) -> bool {
        self.batch_key_errors
            .iter()
            .any(|(candidate, _)| candidate == raw)
    }

    pub(crate) fn take_batch_key_errors(&mut self) -> Vec<(String, ErrorDetail)> {
        std::mem::take(&mut self.batch_key_errors)
    }
}
