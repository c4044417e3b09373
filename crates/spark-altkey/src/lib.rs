//! # spark-altkey
//!
//! ## 定位与职责（Why）
//! - 为 REST 资源提供“备用键”寻址：同一实体既可用原生主键访问，也可通过一个或多个具名的字符串键空间访问；
//! - 无论客户端选用哪个键空间，CRUD、批量与实体级 Action 的行为都保持一致，唯一的差异是响应中键位的书写形式。
//!
//! ## 架构嵌入（Where）
//! - `key` 模块定义主键值模型（单值、复合、复杂键）与原生字符串编码；
//! - `coercer` 模块定义资源侧实现的双向映射契约及按形状选择的适配器；
//! - `registry` 模块在启动期构建只读的 `(资源, 备用键名) → Coercer` 注册表；
//! - `request` / `response` 模块分别完成入站与出站的键位改写，`context` 在两者之间传递请求级状态；
//! - `pipeline` 模块把两个改写阶段与宿主提供的 Dispatcher 串联为一个处理阶段；
//! - `config` 与 `error` 模块集中承载行为配置与错误域。
//!
//! ## 契约（What）
//! - 两个改写阶段都是纯同步变换，不做 I/O，不引入任何同步原语；
//! - 本层只触碰请求与响应中的键位，从不读取或修改实体负载。

pub mod coercer;
pub mod config;
pub mod context;
pub mod error;
pub mod key;
pub mod pipeline;
pub mod registry;
pub mod request;
pub mod response;

pub use coercer::{CoercionError, DynKeyCoercer, FnCoercer, KeyCoercer, ShapeAdapter, TypedCoercer};
pub use config::{AltKeyConfig, BatchFailurePolicy, ConfigError};
pub use context::{ActiveAltKey, RequestKeyContext};
pub use error::{AltKeyError, ErrorDetail, codes};
pub use key::{
    ComplexKey, CompoundKey, DeclaredKeyType, KeyPart, KeyShape, PrimaryKey, Record, RecordSchema,
    ResourceKey, Scalar, ScalarType, ShapeViolation,
};
pub use pipeline::{AltKeyPipeline, Dispatcher};
pub use registry::{
    AltKeyDefinition, AltKeyRegistry, AltKeyRegistryBuilder, AltKeySchema, LookupError,
    RegistryError, ResourceEntry, ResourceId,
};
pub use request::{
    Entity, InboundRequest, KeyArity, KeyedRequest, OperationKind, PathSegment, QueryParams,
    RequestKeyRewriter, ResolvedSegment,
};
pub use response::{
    BatchResponse, CreateStatus, DispatchResponse, KeyRenderer, KeyedEntries, RenderedBatch,
    RenderedBatchCreate, RenderedBody, RenderedCreateStatus, RenderedResponse, ResponseBody,
    ResponseKeyRewriter,
};
