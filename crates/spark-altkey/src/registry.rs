//! # registry 模块说明
//!
//! ## 角色定位（Why）
//! - 保存 `(资源, 备用键名) → Coercer + 键形状` 的进程级映射；
//! - 启动期由 [`AltKeyRegistryBuilder`] 单线程构建，`build` 之后只读，以 `Arc<AltKeyRegistry>`
//!   注入请求管线，查询无需加锁。
//!
//! ## 设计要求（What）
//! - 注册期发现的任何不一致（重名、类型与形状不相容、形状冲突、父资源未声明）都以
//!   [`RegistryError`] 形式在启动时失败，而不是留到请求期；
//! - 服务期间不允许增删定义，因此没有任何写接口暴露在 [`AltKeyRegistry`] 上。

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;

use crate::coercer::{CoercionError, DynKeyCoercer, KeyCoercer, ShapeAdapter, TypedCoercer};
use crate::key::{DeclaredKeyType, KeyShape, PrimaryKey, ResourceKey};

/// 资源标识。
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct ResourceId(String);

impl ResourceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ResourceId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for ResourceId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// 一条备用键定义，注册后不可变。
#[derive(Clone, Debug)]
pub struct AltKeyDefinition {
    resource: ResourceId,
    name: String,
    shape: KeyShape,
    adapter: ShapeAdapter,
}

impl AltKeyDefinition {
    pub fn resource(&self) -> &ResourceId {
        &self.resource
    }

    /// 客户端在选择器参数中传入的字面值。
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn shape(&self) -> &KeyShape {
        &self.shape
    }

    pub fn coercer_name(&self) -> &'static str {
        self.adapter.type_name()
    }

    pub fn coerce_to_key(&self, alt_key: &str) -> Result<PrimaryKey, CoercionError> {
        self.adapter.to_primary(alt_key)
    }

    pub fn coerce_from_key(&self, key: &PrimaryKey) -> Result<String, CoercionError> {
        self.adapter.from_primary(key)
    }
}

/// 资源条目：主键形状、父资源与其备用键集合。
#[derive(Clone, Debug)]
pub struct ResourceEntry {
    id: ResourceId,
    shape: KeyShape,
    parent: Option<ResourceId>,
    alt_keys: BTreeMap<String, AltKeyDefinition>,
}

impl ResourceEntry {
    pub fn id(&self) -> &ResourceId {
        &self.id
    }

    pub fn shape(&self) -> &KeyShape {
        &self.shape
    }

    pub fn parent(&self) -> Option<&ResourceId> {
        self.parent.as_ref()
    }

    pub fn alt_key(&self, name: &str) -> Option<&AltKeyDefinition> {
        self.alt_keys.get(name)
    }

    pub fn alt_keys(&self) -> impl Iterator<Item = &AltKeyDefinition> {
        self.alt_keys.values()
    }
}

/// 注册期配置错误。
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("resource `{resource}` already declares alternative key `{name}`")]
    DuplicateAltKey { resource: ResourceId, name: String },

    #[error("alternative key names on resource `{resource}` must not be empty")]
    EmptyAltKeyName { resource: ResourceId },

    #[error(
        "coercer `{name}` on resource `{resource}` works on {declared} keys, incompatible with the declared shape"
    )]
    IncompatibleCoercer {
        resource: ResourceId,
        name: String,
        declared: DeclaredKeyType,
    },

    #[error("resource `{resource}` is already declared with a different key shape")]
    ShapeConflict { resource: ResourceId },

    #[error("resource `{resource}` declares an invalid key shape: {detail}")]
    InvalidShape { resource: ResourceId, detail: String },

    #[error("resource `{resource}` is declared under unknown parent `{parent}`")]
    UnknownParent {
        resource: ResourceId,
        parent: ResourceId,
    },

    #[error("resource `{resource}` is already declared under a different parent")]
    ParentConflict { resource: ResourceId },
}

/// 查询失败。
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum LookupError {
    #[error("resource `{0}` is not registered")]
    UnknownResource(ResourceId),
    #[error("unknown alternative key: `{name}` (resource `{resource}`)")]
    UnknownAltKey { resource: ResourceId, name: String },
}

/// 启动期构建器。
///
/// # 教案式说明
/// - **意图 (Why)**：把“可变的注册过程”与“只读的服务期注册表”拆成两个类型，
///   由类型系统保证服务期间不会出现增删；
/// - **执行 (How)**：`declare_*` 声明资源形状与父子关系，`register*` 追加备用键，
///   `build` 校验父资源均已声明后产出 [`AltKeyRegistry`]；
/// - **契约 (What)**：构建器方法在发现配置错误时立即返回 [`RegistryError`]，已写入的条目保持不变。
#[derive(Debug, Default)]
pub struct AltKeyRegistryBuilder {
    resources: BTreeMap<ResourceId, ResourceEntry>,
}

impl AltKeyRegistryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// 声明顶层资源及其主键形状。重复声明同一形状是幂等的。
    pub fn declare_resource(
        &mut self,
        resource: impl Into<ResourceId>,
        shape: KeyShape,
    ) -> Result<&mut Self, RegistryError> {
        self.declare(resource.into(), shape, None)?;
        Ok(self)
    }

    /// 声明嵌套在 `parent` 实体之下的子资源。
    pub fn declare_sub_resource(
        &mut self,
        resource: impl Into<ResourceId>,
        parent: impl Into<ResourceId>,
        shape: KeyShape,
    ) -> Result<&mut Self, RegistryError> {
        self.declare(resource.into(), shape, Some(parent.into()))?;
        Ok(self)
    }

    fn declare(
        &mut self,
        resource: ResourceId,
        shape: KeyShape,
        parent: Option<ResourceId>,
    ) -> Result<&mut ResourceEntry, RegistryError> {
        shape
            .validate()
            .map_err(|detail| RegistryError::InvalidShape {
                resource: resource.clone(),
                detail,
            })?;

        let entry = self
            .resources
            .entry(resource.clone())
            .or_insert_with(|| ResourceEntry {
                id: resource.clone(),
                shape: shape.clone(),
                parent: parent.clone(),
                alt_keys: BTreeMap::new(),
            });
        if entry.shape != shape {
            return Err(RegistryError::ShapeConflict { resource });
        }
        if let Some(parent) = parent {
            if entry.parent.as_ref().is_some_and(|existing| *existing != parent) {
                return Err(RegistryError::ParentConflict { resource });
            }
            entry.parent = Some(parent);
        }
        Ok(entry)
    }

    /// 以强类型 Coercer 注册备用键。
    ///
    /// - **前置条件**：`K` 的声明类型必须与 `shape` 相容，否则返回 [`RegistryError::IncompatibleCoercer`]；
    /// - **后置条件**：资源若尚未声明，将以 `shape` 隐式声明为顶层资源。
    pub fn register<K, C>(
        &mut self,
        resource: impl Into<ResourceId>,
        name: impl Into<String>,
        coercer: C,
        shape: KeyShape,
    ) -> Result<&mut Self, RegistryError>
    where
        K: ResourceKey,
        C: KeyCoercer<K>,
    {
        self.register_dyn(
            resource,
            name,
            Arc::new(TypedCoercer::<K, C>::new(coercer)),
            shape,
        )
    }

    /// 以已擦除类型的 Coercer 注册备用键。
    pub fn register_dyn(
        &mut self,
        resource: impl Into<ResourceId>,
        name: impl Into<String>,
        coercer: Arc<dyn DynKeyCoercer>,
        shape: KeyShape,
    ) -> Result<&mut Self, RegistryError> {
        let resource = resource.into();
        let name = name.into();
        if name.is_empty() {
            return Err(RegistryError::EmptyAltKeyName { resource });
        }

        let adapter = ShapeAdapter::select(&shape, coercer).map_err(|declared| {
            RegistryError::IncompatibleCoercer {
                resource: resource.clone(),
                name: name.clone(),
                declared,
            }
        })?;

        let entry = self.declare(resource.clone(), shape.clone(), None)?;
        if entry.alt_keys.contains_key(&name) {
            return Err(RegistryError::DuplicateAltKey { resource, name });
        }
        entry.alt_keys.insert(
            name.clone(),
            AltKeyDefinition {
                resource,
                name,
                shape,
                adapter,
            },
        );
        Ok(self)
    }

    pub fn build(self) -> Result<AltKeyRegistry, RegistryError> {
        for entry in self.resources.values() {
            if let Some(parent) = &entry.parent {
                if !self.resources.contains_key(parent) {
                    return Err(RegistryError::UnknownParent {
                        resource: entry.id.clone(),
                        parent: parent.clone(),
                    });
                }
            }
        }
        Ok(AltKeyRegistry {
            resources: self.resources,
        })
    }
}

/// 只读备用键注册表。
///
/// # 教案式说明
/// - **意图 (Why)**：作为启动期构建、服务期共享的配置值，通过引用注入请求管线，而非可变全局单例；
/// - **契约 (What)**：`lookup` 对未注册的资源返回 [`LookupError::UnknownResource`]，
///   对资源上不存在的名字返回 [`LookupError::UnknownAltKey`]；
/// - **线程安全**：内部无可变状态，`Send + Sync`，并发查询无需任何同步原语。
#[derive(Clone, Debug, Default)]
pub struct AltKeyRegistry {
    resources: BTreeMap<ResourceId, ResourceEntry>,
}

impl AltKeyRegistry {
    pub fn builder() -> AltKeyRegistryBuilder {
        AltKeyRegistryBuilder::new()
    }

    pub fn resource(&self, resource: &ResourceId) -> Result<&ResourceEntry, LookupError> {
        self.resources
            .get(resource)
            .ok_or_else(|| LookupError::UnknownResource(resource.clone()))
    }

    pub fn shape(&self, resource: &ResourceId) -> Result<&KeyShape, LookupError> {
        self.resource(resource).map(ResourceEntry::shape)
    }

    pub fn lookup(&self, resource: &ResourceId, name: &str) -> Result<&AltKeyDefinition, LookupError> {
        self.resource(resource)?
            .alt_key(name)
            .ok_or_else(|| LookupError::UnknownAltKey {
                resource: resource.clone(),
                name: name.to_owned(),
            })
    }

    pub fn alt_key_names(&self, resource: &ResourceId) -> Vec<&str> {
        self.resources
            .get(resource)
            .map(|entry| entry.alt_keys.keys().map(String::as_str).collect())
            .unwrap_or_default()
    }

    pub fn resources(&self) -> impl Iterator<Item = &ResourceEntry> {
        self.resources.values()
    }

    /// 导出资源上全部备用键的描述，用于 IDL/文档生成。
    pub fn alternative_key_schemas(&self, resource: &ResourceId) -> Vec<AltKeySchema> {
        self.resources
            .get(resource)
            .map(|entry| {
                entry
                    .alt_keys()
                    .map(|definition| AltKeySchema {
                        name: definition.name.clone(),
                        key_type: "string",
                        key_coercer: definition.coercer_name().to_owned(),
                    })
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// 备用键的对外描述。
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AltKeySchema {
    pub name: String,
    pub key_type: &'static str,
    pub key_coercer: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coercer::FnCoercer;
    use crate::key::{KeyPart, ScalarType};

    struct AltPrefixCoercer;

    impl KeyCoercer<i64> for AltPrefixCoercer {
        fn coerce_to_key(&self, alt_key: &str) -> Result<i64, CoercionError> {
            alt_key
                .strip_prefix("Alt")
                .and_then(|digits| digits.parse().ok())
                .ok_or_else(|| CoercionError::invalid(alt_key))
        }

        fn coerce_from_key(&self, key: &i64) -> Result<String, CoercionError> {
            Ok(format!("Alt{key}"))
        }
    }

    fn long_shape() -> KeyShape {
        KeyShape::simple(ScalarType::Long)
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let mut builder = AltKeyRegistry::builder();
        builder
            .register::<i64, _>("altKey", "alt", AltPrefixCoercer, long_shape())
            .expect("首次注册成功");
        let error = builder
            .register::<i64, _>("altKey", "alt", AltPrefixCoercer, long_shape())
            .expect_err("重名应失败");
        assert_eq!(
            error,
            RegistryError::DuplicateAltKey {
                resource: ResourceId::new("altKey"),
                name: "alt".to_owned(),
            }
        );
    }

    #[test]
    fn incompatible_coercer_type_is_a_configuration_error() {
        let mut builder = AltKeyRegistry::builder();
        let shape = KeyShape::compound([KeyPart::new("a", ScalarType::String)]);
        let error = builder
            .register::<i64, _>("association", "alt", AltPrefixCoercer, shape)
            .expect_err("i64 Coercer 不能服务复合键资源");
        assert!(matches!(
            error,
            RegistryError::IncompatibleCoercer {
                declared: DeclaredKeyType::Scalar(ScalarType::Long),
                ..
            }
        ));
    }

    #[test]
    fn shape_must_match_previous_declaration() {
        let mut builder = AltKeyRegistry::builder();
        builder
            .declare_resource("altKey", KeyShape::simple(ScalarType::String))
            .expect("声明成功");
        let error = builder
            .register::<i64, _>("altKey", "alt", AltPrefixCoercer, long_shape())
            .expect_err("形状冲突");
        assert_eq!(
            error,
            RegistryError::ShapeConflict {
                resource: ResourceId::new("altKey")
            }
        );
    }

    #[test]
    fn sub_resources_require_declared_parents() {
        let mut builder = AltKeyRegistry::builder();
        builder
            .declare_sub_resource("altKeySub", "altKey", long_shape())
            .expect("声明成功");
        assert!(matches!(
            builder.build(),
            Err(RegistryError::UnknownParent { .. })
        ));
    }

    #[test]
    fn lookup_distinguishes_unknown_resource_and_name() {
        let mut builder = AltKeyRegistry::builder();
        builder
            .register::<i64, _>("altKey", "alt", AltPrefixCoercer, long_shape())
            .expect("注册成功");
        let registry = builder.build().expect("构建成功");

        let altkey = ResourceId::new("altKey");
        let definition = registry.lookup(&altkey, "alt").expect("已注册");
        assert_eq!(definition.coerce_to_key("Alt3"), Ok(3i64.into_primary()));
        assert!(matches!(
            registry.lookup(&altkey, "other"),
            Err(LookupError::UnknownAltKey { .. })
        ));
        assert!(matches!(
            registry.lookup(&ResourceId::new("missing"), "alt"),
            Err(LookupError::UnknownResource(_))
        ));
        assert_eq!(registry.alt_key_names(&altkey), vec!["alt"]);
    }

    #[test]
    fn schemas_report_coercer_type_names() {
        let mut builder = AltKeyRegistry::builder();
        builder
            .register::<i64, _>("altKey", "alt", AltPrefixCoercer, long_shape())
            .and_then(|builder| {
                builder.register::<i64, _>(
                    "altKey",
                    "hex",
                    FnCoercer::new(
                        |alt: &str| {
                            i64::from_str_radix(alt, 16).map_err(|e| CoercionError::invalid(e.to_string()))
                        },
                        |key: &i64| Ok(format!("{key:x}")),
                    ),
                    long_shape(),
                )
            })
            .expect("注册成功");
        let registry = builder.build().expect("构建成功");

        let schemas = registry.alternative_key_schemas(&ResourceId::new("altKey"));
        assert_eq!(schemas.len(), 2);
        assert_eq!(schemas[0].name, "alt");
        assert!(schemas[0].key_coercer.ends_with("AltPrefixCoercer"));
        let json = serde_json::to_value(&schemas[0]).expect("可序列化");
        assert_eq!(json["keyType"], "string");
    }
}
