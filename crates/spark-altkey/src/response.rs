//! # response 模块说明
//!
//! ## 角色定位（Why）
//! - 出站阶段：Dispatcher 的响应以主键对象表达所有键位，本模块把它们渲染为客户端使用的键空间中的字符串；
//! - 请求未选择备用键时按原生编码渲染，与未启用备用键的服务输出一致。
//!
//! ## 契约（What）
//! - 只改写键位：创建 id 头、`Location` 头、批量结果/错误映射的键、批量创建状态中的 id；
//!   实体负载原样透传，即便其中存在形似键的字段；
//! - 批量结果与错误保持 Dispatcher 给出的顺序；不同主键渲染出相同字符串时两条记录都保留；
//! - 任何渲染失败都是服务端故障（500），意味着 Coercer 违反了“对所有可产生的主键有定义”的契约；
//! - 请求阶段跳过的批量键只能并入批量响应体；Dispatcher 以整体错误结束批量操作时，
//!   这些逐键错误随之丢弃，并以 `debug!` 事件记录被丢弃的条目数。

use serde::Serialize;
use serde::ser::{SerializeMap, Serializer};
use tracing::debug;

use crate::config::AltKeyConfig;
use crate::context::RequestKeyContext;
use crate::error::{AltKeyError, ErrorDetail};
use crate::key::PrimaryKey;
use crate::key::codec;
use crate::registry::{AltKeyDefinition, AltKeyRegistry};
use crate::request::Entity;

/// Dispatcher 返回的响应，键位均为主键对象。
#[derive(Clone, Debug, PartialEq)]
pub struct DispatchResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    /// 创建操作分配的主键。
    pub created_id: Option<PrimaryKey>,
    pub body: ResponseBody,
}

impl DispatchResponse {
    pub fn new(status: u16, body: ResponseBody) -> Self {
        Self {
            status,
            headers: Vec::new(),
            created_id: None,
            body,
        }
    }

    pub fn empty(status: u16) -> Self {
        Self::new(status, ResponseBody::Empty)
    }

    pub fn entity(status: u16, entity: Entity) -> Self {
        Self::new(status, ResponseBody::Entity(entity))
    }

    pub fn error(detail: ErrorDetail) -> Self {
        Self::new(detail.status, ResponseBody::Error(detail))
    }

    #[must_use]
    pub fn with_created_id(mut self, id: PrimaryKey) -> Self {
        self.created_id = Some(id);
        self
    }

    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum ResponseBody {
    Empty,
    Entity(Entity),
    Batch(BatchResponse),
    BatchCreate(Vec<CreateStatus>),
    /// Dispatcher 自身的错误（未找到、校验失败、Action 异常等），本层不做改动。
    Error(ErrorDetail),
}

/// 批量 GET/UPDATE/PARTIAL_UPDATE/DELETE 的结果，按主键分别给出结果与错误。
#[derive(Clone, Debug, Default, PartialEq)]
pub struct BatchResponse {
    pub results: Vec<(PrimaryKey, Entity)>,
    pub errors: Vec<(PrimaryKey, ErrorDetail)>,
}

/// 批量创建中单个实体的结果。请求不携带键，键只出现在响应中。
#[derive(Clone, Debug, PartialEq)]
pub struct CreateStatus {
    pub status: u16,
    pub id: Option<PrimaryKey>,
    pub error: Option<ErrorDetail>,
}

impl CreateStatus {
    pub fn created(id: PrimaryKey) -> Self {
        Self {
            status: 201,
            id: Some(id),
            error: None,
        }
    }

    pub fn failed(detail: ErrorDetail) -> Self {
        Self {
            status: detail.status,
            id: None,
            error: Some(detail),
        }
    }
}

/// 保序、允许重复键的映射，序列化为 JSON 对象时原样写出重复键。
#[derive(Clone, Debug, PartialEq)]
pub struct KeyedEntries<V>(pub Vec<(String, V)>);

impl<V> Default for KeyedEntries<V> {
    fn default() -> Self {
        Self(Vec::new())
    }
}

impl<V> KeyedEntries<V> {
    /// 返回第一个匹配键的值。
    pub fn get(&self, key: &str) -> Option<&V> {
        self.0
            .iter()
            .find(|(candidate, _)| candidate == key)
            .map(|(_, value)| value)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(|(key, _)| key.as_str())
    }

    pub fn values(&self) -> impl Iterator<Item = &V> {
        self.0.iter().map(|(_, value)| value)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<V: Serialize> Serialize for KeyedEntries<V> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for (key, value) in &self.0 {
            map.serialize_entry(key, value)?;
        }
        map.end()
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct RenderedBatch {
    pub results: KeyedEntries<Entity>,
    pub errors: KeyedEntries<ErrorDetail>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct RenderedCreateStatus {
    pub status: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorDetail>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct RenderedBatchCreate {
    pub elements: Vec<RenderedCreateStatus>,
}

/// 渲染后的响应体。
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(untagged)]
pub enum RenderedBody {
    Empty,
    Entity(Entity),
    Batch(RenderedBatch),
    BatchCreate(RenderedBatchCreate),
    Error(ErrorDetail),
}

/// 交还给传输层的响应，键位均已渲染为字符串。
#[derive(Clone, Debug, PartialEq)]
pub struct RenderedResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: RenderedBody,
}

impl RenderedResponse {
    /// 以本层错误构造错误响应。
    pub fn from_error(error: &AltKeyError) -> Self {
        let detail = ErrorDetail::from(error);
        Self {
            status: detail.status,
            headers: Vec::new(),
            body: RenderedBody::Error(detail),
        }
    }

    /// 按名称查找响应头，名称比较不区分大小写。
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(candidate, _)| candidate.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    pub fn body_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(&self.body)
    }

    pub fn entity(&self) -> Option<&Entity> {
        match &self.body {
            RenderedBody::Entity(entity) => Some(entity),
            _ => None,
        }
    }

    pub fn batch(&self) -> Option<&RenderedBatch> {
        match &self.body {
            RenderedBody::Batch(batch) => Some(batch),
            _ => None,
        }
    }

    pub fn batch_create(&self) -> Option<&[RenderedCreateStatus]> {
        match &self.body {
            RenderedBody::BatchCreate(batch) => Some(&batch.elements),
            _ => None,
        }
    }

    pub fn error(&self) -> Option<&ErrorDetail> {
        match &self.body {
            RenderedBody::Error(detail) => Some(detail),
            _ => None,
        }
    }
}

/// 当前请求所用键空间的渲染方式。
#[derive(Clone, Copy, Debug)]
pub enum KeyRenderer<'a> {
    Native,
    Alternative(&'a AltKeyDefinition),
}

impl KeyRenderer<'_> {
    pub fn render(&self, key: &PrimaryKey) -> Result<String, AltKeyError> {
        match self {
            KeyRenderer::Native => Ok(codec::encode(key)),
            KeyRenderer::Alternative(definition) => definition
                .coerce_from_key(key)
                .map_err(|error| AltKeyError::from_render(definition.resource(), definition.name(), error)),
        }
    }

    fn path_segment(&self, rendered: &str) -> String {
        match self {
            KeyRenderer::Native => rendered.to_owned(),
            KeyRenderer::Alternative(_) => codec::escape_path_segment(rendered),
        }
    }
}

/// 出站键改写器。
///
/// # 教案式说明
/// - **意图 (Why)**：与 [`crate::request::RequestKeyRewriter`] 对称，把主键空间的响应映射回客户端所用的键空间；
/// - **执行 (How)**：依据上下文中记录的备用键名选定 [`KeyRenderer`]，逐个键位渲染；
///   请求阶段跳过的批量键以原始字符串为键追加在 Dispatcher 错误之后；
/// - **契约 (What)**：消费 [`RequestKeyContext`]，上下文不会在请求之间复用。
#[derive(Clone, Copy, Debug)]
pub struct ResponseKeyRewriter<'a> {
    registry: &'a AltKeyRegistry,
    config: &'a AltKeyConfig,
}

impl<'a> ResponseKeyRewriter<'a> {
    pub fn new(registry: &'a AltKeyRegistry, config: &'a AltKeyConfig) -> Self {
        Self { registry, config }
    }

    pub fn rewrite(
        &self,
        mut context: RequestKeyContext,
        response: DispatchResponse,
    ) -> Result<RenderedResponse, AltKeyError> {
        let renderer = match context.active_alt_key() {
            Some(active) => {
                KeyRenderer::Alternative(self.registry.lookup(&active.resource, &active.name)?)
            }
            None => KeyRenderer::Native,
        };

        let DispatchResponse {
            status,
            mut headers,
            created_id,
            body,
        } = response;

        if let Some(id) = &created_id {
            let rendered = renderer.render(id)?;
            let location = self.location(&context, &renderer, &rendered);
            headers.push((self.config.created_id_header.clone(), rendered));
            headers.push((self.config.location_header.clone(), location));
        }

        let skipped = context.take_batch_key_errors();
        if !skipped.is_empty() && !matches!(body, ResponseBody::Batch(_)) {
            debug!(
                resource = %context.target(),
                operation = %context.operation(),
                status,
                discarded = skipped.len(),
                "discarding skipped batch keys: dispatcher did not return a batch body"
            );
        }

        let body = match body {
            ResponseBody::Empty => RenderedBody::Empty,
            ResponseBody::Entity(entity) => RenderedBody::Entity(entity),
            ResponseBody::Error(detail) => RenderedBody::Error(detail),
            ResponseBody::Batch(batch) => {
                let mut rendered = RenderedBatch {
                    results: KeyedEntries(render_entries(&renderer, batch.results)?),
                    errors: KeyedEntries(render_entries(&renderer, batch.errors)?),
                };
                rendered.errors.0.extend(skipped);
                RenderedBody::Batch(rendered)
            }
            ResponseBody::BatchCreate(statuses) => {
                let mut elements = Vec::with_capacity(statuses.len());
                for status in statuses {
                    let (id, location) = match &status.id {
                        Some(id) => {
                            let rendered = renderer.render(id)?;
                            let location = self.location(&context, &renderer, &rendered);
                            (Some(rendered), Some(location))
                        }
                        None => (None, None),
                    };
                    elements.push(RenderedCreateStatus {
                        status: status.status,
                        id,
                        location,
                        error: status.error,
                    });
                }
                RenderedBody::BatchCreate(RenderedBatchCreate { elements })
            }
        };

        debug!(
            resource = %context.target(),
            altkey = context.active_alt_key_name().unwrap_or("-"),
            operation = %context.operation(),
            status,
            "response keys rendered"
        );

        Ok(RenderedResponse {
            status,
            headers,
            body,
        })
    }

    /// `<collection_path>/<id>`，选择了备用键时追加 `?<selector>=<name>`。
    fn location(&self, context: &RequestKeyContext, renderer: &KeyRenderer<'_>, rendered: &str) -> String {
        let mut location = format!("{}/{}", context.collection_path(), renderer.path_segment(rendered));
        if let Some(name) = context.active_alt_key_name() {
            location.push('?');
            location.push_str(&self.config.selector_param);
            location.push('=');
            location.push_str(&codec::escape_path_segment(name));
        }
        location
    }
}

fn render_entries<V>(
    renderer: &KeyRenderer<'_>,
    entries: Vec<(PrimaryKey, V)>,
) -> Result<Vec<(String, V)>, AltKeyError> {
    entries
        .into_iter()
        .map(|(key, value)| Ok((renderer.render(&key)?, value)))
        .collect()
}
