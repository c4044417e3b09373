//! # coercer 模块说明
//!
//! ## 角色定位（Why）
//! - 资源作者通过 [`KeyCoercer`] 提供“主键对象 ⇄ 备用键字符串”的双向映射；
//! - 框架在注册时把强类型 Coercer 擦除为 [`DynKeyCoercer`]，再按资源形状包装成 [`ShapeAdapter`]，
//!   运行期只通过求和类型分派，不依赖继承层次。
//!
//! ## 契约（What）
//! - `coerce_to_key` 是偏函数：可拒绝格式错误的输入，返回 [`CoercionError::Invalid`]；
//! - `coerce_from_key` 对资源可能产生的每个主键都必须有定义；
//! - 对资源能产生的每个主键 `k`，必须满足 `coerce_to_key(coerce_from_key(k)) == k`。

use std::any::type_name;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use thiserror::Error;

use crate::key::{DeclaredKeyType, KeyShape, PrimaryKey, ResourceKey};

/// Coercer 的失败分类。
///
/// # 教案式说明
/// - **意图 (Why)**：区分“客户端给出的备用键不合法”与“Coercer 自身违约”，两者分别映射为 400 与 500；
/// - **契约 (What)**：`Invalid` 只应出现在 `coerce_to_key`；`coerce_from_key` 的任何失败都被框架视为服务端故障。
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum CoercionError {
    #[error("invalid alternative key: {0}")]
    Invalid(String),
    #[error("key coercer failure: {0}")]
    Fault(String),
}

impl CoercionError {
    pub fn invalid(detail: impl Into<String>) -> Self {
        CoercionError::Invalid(detail.into())
    }

    pub fn fault(detail: impl Into<String>) -> Self {
        CoercionError::Fault(detail.into())
    }
}

/// 资源侧实现的强类型 Coercer。
pub trait KeyCoercer<K>: Send + Sync + 'static
where
    K: ResourceKey,
{
    /// 将备用键字符串转换为主键对象。
    fn coerce_to_key(&self, alt_key: &str) -> Result<K, CoercionError>;

    /// 将主键对象转换为备用键字符串。
    fn coerce_from_key(&self, key: &K) -> Result<String, CoercionError>;
}

impl<K, C> KeyCoercer<K> for Arc<C>
where
    K: ResourceKey,
    C: KeyCoercer<K> + ?Sized,
{
    fn coerce_to_key(&self, alt_key: &str) -> Result<K, CoercionError> {
        (**self).coerce_to_key(alt_key)
    }

    fn coerce_from_key(&self, key: &K) -> Result<String, CoercionError> {
        (**self).coerce_from_key(key)
    }
}

/// 对象安全的 Coercer 视图，统一工作在 [`PrimaryKey`] 上。
pub trait DynKeyCoercer: Send + Sync + 'static {
    fn declared_type(&self) -> DeclaredKeyType;

    /// Coercer 的实现类型名，用于资源描述导出。
    fn type_name(&self) -> &'static str;

    fn coerce_to_primary(&self, alt_key: &str) -> Result<PrimaryKey, CoercionError>;

    fn coerce_from_primary(&self, key: &PrimaryKey) -> Result<String, CoercionError>;
}

/// 将 [`KeyCoercer<K>`] 擦除为 [`DynKeyCoercer`] 的适配器。
pub struct TypedCoercer<K, C> {
    inner: C,
    _key: PhantomData<fn() -> K>,
}

impl<K, C> TypedCoercer<K, C>
where
    K: ResourceKey,
    C: KeyCoercer<K>,
{
    pub fn new(inner: C) -> Self {
        Self {
            inner,
            _key: PhantomData,
        }
    }
}

impl<K, C> DynKeyCoercer for TypedCoercer<K, C>
where
    K: ResourceKey,
    C: KeyCoercer<K>,
{
    fn declared_type(&self) -> DeclaredKeyType {
        K::declared_type()
    }

    fn type_name(&self) -> &'static str {
        type_name::<C>()
    }

    fn coerce_to_primary(&self, alt_key: &str) -> Result<PrimaryKey, CoercionError> {
        self.inner.coerce_to_key(alt_key).map(ResourceKey::into_primary)
    }

    fn coerce_from_primary(&self, key: &PrimaryKey) -> Result<String, CoercionError> {
        let typed = K::from_primary(key).ok_or_else(|| {
            CoercionError::fault(format!(
                "coercer for {} keys cannot render a {} key",
                K::declared_type(),
                key.declared_type()
            ))
        })?;
        self.inner.coerce_from_key(&typed)
    }
}

/// 以一对闭包构造 Coercer，便于测试与轻量资源使用。
pub struct FnCoercer<K, ToKey, FromKey> {
    to_key: ToKey,
    from_key: FromKey,
    _key: PhantomData<fn() -> K>,
}

impl<K, ToKey, FromKey> FnCoercer<K, ToKey, FromKey>
where
    K: ResourceKey,
    ToKey: Fn(&str) -> Result<K, CoercionError> + Send + Sync + 'static,
    FromKey: Fn(&K) -> Result<String, CoercionError> + Send + Sync + 'static,
{
    pub fn new(to_key: ToKey, from_key: FromKey) -> Self {
        Self {
            to_key,
            from_key,
            _key: PhantomData,
        }
    }
}

impl<K, ToKey, FromKey> KeyCoercer<K> for FnCoercer<K, ToKey, FromKey>
where
    K: ResourceKey,
    ToKey: Fn(&str) -> Result<K, CoercionError> + Send + Sync + 'static,
    FromKey: Fn(&K) -> Result<String, CoercionError> + Send + Sync + 'static,
{
    fn coerce_to_key(&self, alt_key: &str) -> Result<K, CoercionError> {
        (self.to_key)(alt_key)
    }

    fn coerce_from_key(&self, key: &K) -> Result<String, CoercionError> {
        (self.from_key)(key)
    }
}

/// 按资源键形状选定的 Coercer 包装。
///
/// # 教案式说明
/// - **意图 (Why)**：三类形状的键在框架内的处理方式一致（整体交给 Coercer），但注册期需要按形状
///   选择适配器，以便在入口处拒绝“声明类型与形状不符”的配置；
/// - **执行 (How)**：`select` 依据 [`KeyShape`] 选择变体并做相容性判定；运行期 `to_primary` /
///   `from_primary` 在调用 Coercer 前后核对键变体；
/// - **契约 (What)**：复合/复杂键始终以完整对象进出 Coercer，框架从不逐段转换。
#[derive(Clone)]
pub enum ShapeAdapter {
    Simple(Arc<dyn DynKeyCoercer>),
    Compound(Arc<dyn DynKeyCoercer>),
    Complex(Arc<dyn DynKeyCoercer>),
}

impl ShapeAdapter {
    /// 按形状选择适配器；声明类型不相容时返回 `Err(coercer 声明的类型)`。
    pub fn select(
        shape: &KeyShape,
        coercer: Arc<dyn DynKeyCoercer>,
    ) -> Result<Self, DeclaredKeyType> {
        let declared = coercer.declared_type();
        if !declared.compatible_with(shape) {
            return Err(declared);
        }
        Ok(match shape {
            KeyShape::Simple { .. } => ShapeAdapter::Simple(coercer),
            KeyShape::Compound { .. } => ShapeAdapter::Compound(coercer),
            KeyShape::Complex { .. } => ShapeAdapter::Complex(coercer),
        })
    }

    fn coercer(&self) -> &Arc<dyn DynKeyCoercer> {
        match self {
            ShapeAdapter::Simple(coercer)
            | ShapeAdapter::Compound(coercer)
            | ShapeAdapter::Complex(coercer) => coercer,
        }
    }

    fn accepts(&self, key: &PrimaryKey) -> bool {
        matches!(
            (self, key),
            (ShapeAdapter::Simple(_), PrimaryKey::Simple(_))
                | (ShapeAdapter::Compound(_), PrimaryKey::Compound(_))
                | (ShapeAdapter::Complex(_), PrimaryKey::Complex(_))
        )
    }

    pub fn type_name(&self) -> &'static str {
        self.coercer().type_name()
    }

    pub fn to_primary(&self, alt_key: &str) -> Result<PrimaryKey, CoercionError> {
        let key = self.coercer().coerce_to_primary(alt_key)?;
        if !self.accepts(&key) {
            return Err(CoercionError::fault(format!(
                "coercer produced a {} key for a {} resource",
                key.declared_type(),
                self.coercer().declared_type()
            )));
        }
        Ok(key)
    }

    pub fn from_primary(&self, key: &PrimaryKey) -> Result<String, CoercionError> {
        if !self.accepts(key) {
            return Err(CoercionError::fault(format!(
                "cannot render a {} key through a {} coercer",
                key.declared_type(),
                self.coercer().declared_type()
            )));
        }
        self.coercer().coerce_from_primary(key)
    }
}

impl fmt::Debug for ShapeAdapter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let variant = match self {
            ShapeAdapter::Simple(_) => "Simple",
            ShapeAdapter::Compound(_) => "Compound",
            ShapeAdapter::Complex(_) => "Complex",
        };
        f.debug_tuple(variant).field(&self.type_name()).finish()
    }
}
