//! # request 模块说明
//!
//! ## 角色定位（Why）
//! - 入站阶段：把客户端以备用键或原生字符串表达的所有键位（路径段、批量 id 列表、批量实体映射的键）
//!   统一转换为主键对象，使 Dispatcher 始终工作在主键空间；
//! - 未携带选择器参数时按原生编码解码，行为与未启用备用键的服务完全一致。
//!
//! ## 执行流程（How）
//! 1. 定位目标资源并校验嵌套关系；若携带选择器，先在目标资源上查找备用键定义；
//! 2. 自外向内解析路径段，每一段使用其自身资源在同名备用键下注册的 Coercer；
//! 3. 按操作的键位约束（[`KeyArity`]）检查路径键，批量操作读取 id 列表并按主键去重；
//! 4. 以解析结果重写批量实体映射，移除选择器与 id 参数后产出 [`KeyedRequest`]。
//!
//! ## 契约（What）
//! - 改写是纯同步变换，不做任何 I/O；
//! - 任何错误都在 Dispatcher 之前返回，错误请求不会抵达资源方法。

use std::collections::BTreeSet;
use std::fmt;

use serde_json::Value;
use tracing::{debug, warn};

use crate::config::{AltKeyConfig, BatchFailurePolicy};
use crate::context::{ActiveAltKey, RequestKeyContext};
use crate::error::{AltKeyError, ErrorDetail};
use crate::key::PrimaryKey;
use crate::key::codec;
use crate::registry::{AltKeyDefinition, AltKeyRegistry, ResourceEntry, ResourceId};

/// 实体负载。本层从不读取或修改其中的字段。
pub type Entity = Value;

/// 资源操作类型。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum OperationKind {
    Get,
    BatchGet,
    Create,
    BatchCreate,
    Update,
    PartialUpdate,
    BatchUpdate,
    BatchPartialUpdate,
    Delete,
    BatchDelete,
    /// 实体级或集合级 Action；是否携带路径键由路由决定。
    Action,
}

/// 操作对目标路径段键位的要求。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum KeyArity {
    /// 集合级操作，不接受路径键。
    Absent,
    /// 单实体操作，必须携带路径键。
    Single,
    /// 可携带也可不携带路径键。
    Optional,
    /// 批量操作，键位来自 id 列表参数。
    Batch,
}

impl OperationKind {
    pub fn as_str(self) -> &'static str {
        match self {
            OperationKind::Get => "GET",
            OperationKind::BatchGet => "BATCH_GET",
            OperationKind::Create => "CREATE",
            OperationKind::BatchCreate => "BATCH_CREATE",
            OperationKind::Update => "UPDATE",
            OperationKind::PartialUpdate => "PARTIAL_UPDATE",
            OperationKind::BatchUpdate => "BATCH_UPDATE",
            OperationKind::BatchPartialUpdate => "BATCH_PARTIAL_UPDATE",
            OperationKind::Delete => "DELETE",
            OperationKind::BatchDelete => "BATCH_DELETE",
            OperationKind::Action => "ACTION",
        }
    }

    pub fn key_arity(self) -> KeyArity {
        match self {
            OperationKind::Get
            | OperationKind::Update
            | OperationKind::PartialUpdate
            | OperationKind::Delete => KeyArity::Single,
            OperationKind::Create | OperationKind::BatchCreate => KeyArity::Absent,
            OperationKind::BatchGet
            | OperationKind::BatchUpdate
            | OperationKind::BatchPartialUpdate
            | OperationKind::BatchDelete => KeyArity::Batch,
            OperationKind::Action => KeyArity::Optional,
        }
    }

    pub fn is_batch(self) -> bool {
        self.key_arity() == KeyArity::Batch
    }

    /// 全部操作类型，按声明顺序排列。
    pub const ALL: [OperationKind; 11] = [
        OperationKind::Get,
        OperationKind::BatchGet,
        OperationKind::Create,
        OperationKind::BatchCreate,
        OperationKind::Update,
        OperationKind::PartialUpdate,
        OperationKind::BatchUpdate,
        OperationKind::BatchPartialUpdate,
        OperationKind::Delete,
        OperationKind::BatchDelete,
        OperationKind::Action,
    ];
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 保序的查询参数表，同名参数可出现多次。
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct QueryParams(Vec<(String, String)>);

impl QueryParams {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.push(name, value);
        self
    }

    pub fn push(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.0.push((name.into(), value.into()));
    }

    /// 返回同名参数的第一个值。
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(candidate, _)| candidate == name)
            .map(|(_, value)| value.as_str())
    }

    pub fn get_all<'q>(&'q self, name: &'q str) -> impl Iterator<Item = &'q str> + 'q {
        self.0
            .iter()
            .filter(move |(candidate, _)| candidate == name)
            .map(|(_, value)| value.as_str())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.0.iter().any(|(candidate, _)| candidate == name)
    }

    /// 移除同名参数并按出现顺序返回其值。
    pub fn remove(&mut self, name: &str) -> Vec<String> {
        let mut removed = Vec::new();
        self.0.retain(|(candidate, value)| {
            if candidate == name {
                removed.push(value.clone());
                false
            } else {
                true
            }
        });
        removed
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0
            .iter()
            .map(|(name, value)| (name.as_str(), value.as_str()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<N, V> FromIterator<(N, V)> for QueryParams
where
    N: Into<String>,
    V: Into<String>,
{
    fn from_iter<I: IntoIterator<Item = (N, V)>>(iter: I) -> Self {
        Self(
            iter.into_iter()
                .map(|(name, value)| (name.into(), value.into()))
                .collect(),
        )
    }
}

/// 路径中的一段：资源名与可选的原始键字符串。
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PathSegment {
    pub resource: ResourceId,
    pub key: Option<String>,
}

impl PathSegment {
    pub fn new(resource: impl Into<ResourceId>) -> Self {
        Self {
            resource: resource.into(),
            key: None,
        }
    }

    pub fn keyed(resource: impl Into<ResourceId>, key: impl Into<String>) -> Self {
        Self {
            resource: resource.into(),
            key: Some(key.into()),
        }
    }
}

/// 路由层交来的入站请求，键位仍是客户端给出的原始字符串。
///
/// - `segments` 自外向内排列，最后一段为目标资源；
/// - `base_path` 为服务挂载前缀，仅用于拼接 `Location`；
/// - `batch_entities` 为批量更新请求体中以原始键字符串为键的实体映射。
#[derive(Clone, Debug, PartialEq)]
pub struct InboundRequest {
    pub operation: OperationKind,
    pub base_path: String,
    pub segments: Vec<PathSegment>,
    pub query: QueryParams,
    pub body: Option<Entity>,
    pub batch_entities: Option<Vec<(String, Entity)>>,
}

impl InboundRequest {
    pub fn new(operation: OperationKind, resource: impl Into<ResourceId>) -> Self {
        Self {
            operation,
            base_path: String::new(),
            segments: vec![PathSegment::new(resource)],
            query: QueryParams::new(),
            body: None,
            batch_entities: None,
        }
    }

    /// 为目标段设置原始键。
    #[must_use]
    pub fn with_key(mut self, raw: impl Into<String>) -> Self {
        if let Some(target) = self.segments.last_mut() {
            target.key = Some(raw.into());
        }
        self
    }

    /// 在最外层之前插入父资源段；多层嵌套时由内向外依次调用。
    #[must_use]
    pub fn beneath(mut self, parent: impl Into<ResourceId>, parent_key: impl Into<String>) -> Self {
        self.segments.insert(0, PathSegment::keyed(parent, parent_key));
        self
    }

    #[must_use]
    pub fn with_base_path(mut self, base_path: impl Into<String>) -> Self {
        self.base_path = base_path.into();
        self
    }

    #[must_use]
    pub fn with_param(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push(name, value);
        self
    }

    #[must_use]
    pub fn with_params<I, V>(mut self, name: &str, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<String>,
    {
        for value in values {
            self.query.push(name, value);
        }
        self
    }

    #[must_use]
    pub fn with_body(mut self, body: Entity) -> Self {
        self.body = Some(body);
        self
    }

    #[must_use]
    pub fn with_batch_entity(mut self, raw: impl Into<String>, entity: Entity) -> Self {
        self.batch_entities
            .get_or_insert_with(Vec::new)
            .push((raw.into(), entity));
        self
    }

    pub fn target(&self) -> Option<&PathSegment> {
        self.segments.last()
    }
}

/// 已解析为主键的路径段。
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResolvedSegment {
    pub resource: ResourceId,
    pub key: Option<PrimaryKey>,
}

/// 主键空间中的请求，交给 Dispatcher 执行。
///
/// Dispatcher 看到的请求与未启用备用键时完全相同：选择器参数已移除，
/// 批量 id 以主键列表给出，批量实体映射以主键为键。
#[derive(Clone, Debug, PartialEq)]
pub struct KeyedRequest {
    pub operation: OperationKind,
    /// 目标之外的父资源段，自外向内排列。
    pub parents: Vec<ResolvedSegment>,
    pub target: ResolvedSegment,
    pub params: QueryParams,
    pub batch_keys: Option<Vec<PrimaryKey>>,
    pub body: Option<Entity>,
    pub batch_entities: Option<Vec<(PrimaryKey, Entity)>>,
}

impl KeyedRequest {
    /// 目标实体键。
    pub fn key(&self) -> Option<&PrimaryKey> {
        self.target.key.as_ref()
    }

    /// 按资源名查找路径上的实体键，包括父资源段。
    pub fn path_key(&self, resource: &str) -> Option<&PrimaryKey> {
        self.parents
            .iter()
            .chain(std::iter::once(&self.target))
            .find(|segment| segment.resource.as_str() == resource)
            .and_then(|segment| segment.key.as_ref())
    }

    pub fn batch_keys(&self) -> &[PrimaryKey] {
        self.batch_keys.as_deref().unwrap_or_default()
    }
}

/// 批量 id 列表的解析结果。
struct BatchResolution {
    /// 去重后的主键，保持首次出现的顺序。
    keys: Vec<PrimaryKey>,
    /// 每个成功解析的原始字符串及其主键。
    pairs: Vec<(String, PrimaryKey)>,
}

/// 入站键改写器。
///
/// # 教案式说明
/// - **意图 (Why)**：以纯函数形式完成“原始键字符串 → 主键”的替换，Dispatcher 因此无需知道备用键的存在；
/// - **契约 (What)**：
///   - 未知资源 → 404；未知备用键名 → 400，对任何操作类型一致；
///   - 单实体操作的键被 Coercer 拒绝 → 400；Coercer 故障或产出形状不符的键 → 500；
///   - 批量 id 被拒绝时依 [`BatchFailurePolicy`] 处理：默认跳过并在响应错误映射中记录，或整批拒绝；
///   - 原生寻址下键解码失败 → 400，单实体与批量一致；
/// - **风险 (Trade-offs)**：批量 id 以主键去重，客户端以两种写法给出同一实体时只会执行一次。
#[derive(Clone, Copy, Debug)]
pub struct RequestKeyRewriter<'a> {
    registry: &'a AltKeyRegistry,
    config: &'a AltKeyConfig,
}

impl<'a> RequestKeyRewriter<'a> {
    pub fn new(registry: &'a AltKeyRegistry, config: &'a AltKeyConfig) -> Self {
        Self { registry, config }
    }

    pub fn rewrite(
        &self,
        request: InboundRequest,
    ) -> Result<(KeyedRequest, RequestKeyContext), AltKeyError> {
        let InboundRequest {
            operation,
            base_path,
            mut segments,
            mut query,
            body,
            batch_entities,
        } = request;

        let target_segment = segments.pop().ok_or(AltKeyError::EmptyPath)?;
        let target_entry = self.registry.resource(&target_segment.resource)?;
        let selector = query
            .remove(&self.config.selector_param)
            .into_iter()
            .next();
        let target_definition = match selector.as_deref() {
            Some(name) => Some(self.registry.lookup(target_entry.id(), name)?),
            None => None,
        };

        let mut collection_path = base_path.trim_end_matches('/').to_owned();
        let mut resolved = Vec::new();
        let mut parents = Vec::with_capacity(segments.len());
        let mut previous: Option<ResourceId> = None;
        for segment in segments {
            let entry = self.registry.resource(&segment.resource)?;
            check_nesting(entry, previous.as_ref())?;
            let raw = segment.key.ok_or_else(|| AltKeyError::KeyRequired {
                operation,
                resource: segment.resource.clone(),
            })?;
            let definition = match selector.as_deref() {
                Some(name) => Some(self.registry.lookup(entry.id(), name)?),
                None => None,
            };
            let key = self.resolve(entry, definition, &raw)?;
            collection_path.push('/');
            collection_path.push_str(entry.id().as_str());
            collection_path.push('/');
            collection_path.push_str(&path_text(definition.is_some(), &raw));
            resolved.push((raw, key.clone()));
            previous = Some(segment.resource.clone());
            parents.push(ResolvedSegment {
                resource: segment.resource,
                key: Some(key),
            });
        }
        check_nesting(target_entry, previous.as_ref())?;
        collection_path.push('/');
        collection_path.push_str(target_entry.id().as_str());

        let target_key = match (operation.key_arity(), target_segment.key) {
            (KeyArity::Single, None) => {
                return Err(AltKeyError::KeyRequired {
                    operation,
                    resource: target_entry.id().clone(),
                });
            }
            (KeyArity::Absent | KeyArity::Batch, Some(_)) => {
                return Err(AltKeyError::UnexpectedKey {
                    operation,
                    resource: target_entry.id().clone(),
                });
            }
            (_, Some(raw)) => {
                let key = self.resolve(target_entry, target_definition, &raw)?;
                resolved.push((raw, key.clone()));
                Some(key)
            }
            (_, None) => None,
        };

        let active = selector.as_ref().map(|name| ActiveAltKey {
            resource: target_entry.id().clone(),
            name: name.clone(),
        });
        let mut context = RequestKeyContext::new(
            operation,
            target_entry.id().clone(),
            collection_path,
            active,
        );
        for (raw, key) in resolved {
            context.record_resolved(&raw, key);
        }

        let (batch_keys, batch_entities) = if operation.is_batch() {
            let raws = query.remove(&self.config.batch_ids_param);
            if raws.is_empty() {
                return Err(AltKeyError::BatchIdsMissing {
                    operation,
                    param: self.config.batch_ids_param.clone(),
                });
            }
            let resolution =
                self.resolve_batch(operation, target_entry, target_definition, &raws, &mut context)?;
            let entities = match batch_entities {
                Some(entities) => Some(self.rekey_entities(
                    target_entry,
                    target_definition,
                    entities,
                    &resolution,
                    &context,
                )?),
                None => None,
            };
            (Some(resolution.keys), entities)
        } else {
            (None, None)
        };

        debug!(
            resource = %target_entry.id(),
            altkey = selector.as_deref().unwrap_or("-"),
            operation = %operation,
            keys = context.resolved().len(),
            skipped = context.batch_key_errors().len(),
            "request keys resolved into primary key space"
        );

        let request = KeyedRequest {
            operation,
            parents,
            target: ResolvedSegment {
                resource: target_segment.resource,
                key: target_key,
            },
            params: query,
            batch_keys,
            body,
            batch_entities,
        };
        Ok((request, context))
    }

    /// 将单个原始键解析为主键：有定义时走 Coercer，否则按原生编码解码。
    fn resolve(
        &self,
        entry: &ResourceEntry,
        definition: Option<&AltKeyDefinition>,
        raw: &str,
    ) -> Result<PrimaryKey, AltKeyError> {
        let Some(definition) = definition else {
            return codec::decode(entry.shape(), raw).map_err(|source| {
                AltKeyError::MalformedKey {
                    resource: entry.id().clone(),
                    raw: raw.to_owned(),
                    source,
                }
            });
        };

        let key = definition
            .coerce_to_key(raw)
            .map_err(|error| AltKeyError::from_coercion(entry.id(), definition.name(), raw, error))?;
        if self.config.validate_keys {
            key.conforms_to(entry.shape())
                .map_err(|source| AltKeyError::ShapeViolation {
                    resource: entry.id().clone(),
                    name: definition.name().to_owned(),
                    source,
                })?;
        }
        Ok(key)
    }

    fn resolve_batch(
        &self,
        operation: OperationKind,
        entry: &ResourceEntry,
        definition: Option<&AltKeyDefinition>,
        raws: &[String],
        context: &mut RequestKeyContext,
    ) -> Result<BatchResolution, AltKeyError> {
        let mut seen = BTreeSet::new();
        let mut resolution = BatchResolution {
            keys: Vec::with_capacity(raws.len()),
            pairs: Vec::with_capacity(raws.len()),
        };

        for raw in raws.iter().filter(|raw| !raw.is_empty()) {
            match self.resolve(entry, definition, raw) {
                Ok(key) => {
                    context.record_resolved(raw, key.clone());
                    if seen.insert(key.clone()) {
                        resolution.keys.push(key.clone());
                    }
                    resolution.pairs.push((raw.clone(), key));
                }
                Err(error @ AltKeyError::InvalidAltKey { .. })
                    if self.config.batch_failure_policy == BatchFailurePolicy::PerKeyError =>
                {
                    warn!(
                        resource = %entry.id(),
                        altkey = definition.map(AltKeyDefinition::name).unwrap_or("-"),
                        operation = %operation,
                        key = %raw,
                        error = %error,
                        "skipping batch key rejected by coercer"
                    );
                    if !context.has_batch_error(raw) {
                        context.record_batch_error(raw, ErrorDetail::from(&error));
                    }
                }
                Err(error) => return Err(error),
            }
        }
        Ok(resolution)
    }

    /// 用批量 id 的解析结果重写实体映射的键；已被跳过的键对应的实体一并丢弃。
    ///
    /// 不在 id 列表中的原始键只在能解析到列表内同一主键时才被接受（例如 `02` 与 `2`）；
    /// 无法解析或解析到列表外的键一律视为 [`AltKeyError::BatchEntityMismatch`]，Coercer 故障仍按 500 上报。
    fn rekey_entities(
        &self,
        entry: &ResourceEntry,
        definition: Option<&AltKeyDefinition>,
        entities: Vec<(String, Entity)>,
        resolution: &BatchResolution,
        context: &RequestKeyContext,
    ) -> Result<Vec<(PrimaryKey, Entity)>, AltKeyError> {
        let mut rekeyed = Vec::with_capacity(entities.len());
        for (raw, entity) in entities {
            if context.has_batch_error(&raw) {
                continue;
            }
            let known = resolution
                .pairs
                .iter()
                .find(|(candidate, _)| *candidate == raw)
                .map(|(_, key)| key.clone());
            let key = match known {
                Some(key) => key,
                None => match self.resolve(entry, definition, &raw) {
                    Ok(key) => key,
                    Err(error) if error.is_server_fault() => return Err(error),
                    Err(_) => return Err(AltKeyError::BatchEntityMismatch { raw }),
                },
            };
            if !resolution.keys.contains(&key) {
                return Err(AltKeyError::BatchEntityMismatch { raw });
            }
            rekeyed.push((key, entity));
        }
        Ok(rekeyed)
    }
}

/// 资源声明的父资源必须与路径上紧邻的外层段一致。
fn check_nesting(entry: &ResourceEntry, outer: Option<&ResourceId>) -> Result<(), AltKeyError> {
    if entry.parent() == outer {
        Ok(())
    } else {
        Err(AltKeyError::UnknownResource {
            resource: entry.id().clone(),
        })
    }
}

/// 备用键按路径段转义；原生编码本身已是路径安全的形式。
fn path_text(alternative: bool, raw: &str) -> String {
    if alternative {
        codec::escape_path_segment(raw)
    } else {
        raw.to_owned()
    }
}
