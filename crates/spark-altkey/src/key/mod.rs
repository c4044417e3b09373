//! # key 模块说明
//!
//! ## 角色定位（Why）
//! - 描述资源“主键”（Primary Key）的值模型与声明形状，是备用键解析层的最底层数据结构；
//! - 三种形状对应三类资源：单值键（Simple）、多段复合键（Compound）、记录型复杂键（Complex）。
//!
//! ## 设计要求（What）
//! - [`PrimaryKey`] 必须可比较、可排序、可哈希，以便批量请求去重与测试断言；
//! - [`KeyShape`] 在资源注册时一次性声明，运行期只读；
//! - 编解码（原生字符串形式）位于 [`codec`] 子模块，本模块不关心任何 URL 语法。

pub mod codec;

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// 单值键允许的标量类型。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScalarType {
    Int,
    Long,
    String,
    Boolean,
}

impl ScalarType {
    pub fn as_str(self) -> &'static str {
        match self {
            ScalarType::Int => "int",
            ScalarType::Long => "long",
            ScalarType::String => "string",
            ScalarType::Boolean => "boolean",
        }
    }
}

impl fmt::Display for ScalarType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 标量键值。
///
/// - **契约 (What)**：`Display` 输出未转义的文本形式；需要进入 URL 的场景请走 [`codec`]。
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Scalar {
    Int(i32),
    Long(i64),
    String(String),
    Boolean(bool),
}

impl Scalar {
    pub fn scalar_type(&self) -> ScalarType {
        match self {
            Scalar::Int(_) => ScalarType::Int,
            Scalar::Long(_) => ScalarType::Long,
            Scalar::String(_) => ScalarType::String,
            Scalar::Boolean(_) => ScalarType::Boolean,
        }
    }

    /// 按声明类型解析已反转义的文本。
    ///
    /// 失败时返回 `None`，由调用方补充上下文后构造具体错误。
    pub fn parse(ty: ScalarType, text: &str) -> Option<Self> {
        match ty {
            ScalarType::Int => text.parse().ok().map(Scalar::Int),
            ScalarType::Long => text.parse().ok().map(Scalar::Long),
            ScalarType::String => Some(Scalar::String(text.to_owned())),
            ScalarType::Boolean => match text {
                "true" => Some(Scalar::Boolean(true)),
                "false" => Some(Scalar::Boolean(false)),
                _ => None,
            },
        }
    }
}

impl fmt::Display for Scalar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scalar::Int(value) => write!(f, "{value}"),
            Scalar::Long(value) => write!(f, "{value}"),
            Scalar::String(value) => f.write_str(value),
            Scalar::Boolean(value) => write!(f, "{value}"),
        }
    }
}

impl From<i32> for Scalar {
    fn from(value: i32) -> Self {
        Scalar::Int(value)
    }
}

impl From<i64> for Scalar {
    fn from(value: i64) -> Self {
        Scalar::Long(value)
    }
}

impl From<&str> for Scalar {
    fn from(value: &str) -> Self {
        Scalar::String(value.to_owned())
    }
}

impl From<String> for Scalar {
    fn from(value: String) -> Self {
        Scalar::String(value)
    }
}

impl From<bool> for Scalar {
    fn from(value: bool) -> Self {
        Scalar::Boolean(value)
    }
}

/// 复合键中的一段声明：名称 + 标量类型。
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct KeyPart {
    pub name: String,
    pub ty: ScalarType,
}

impl KeyPart {
    pub fn new(name: impl Into<String>, ty: ScalarType) -> Self {
        Self {
            name: name.into(),
            ty,
        }
    }
}

/// 复杂键记录中的字段声明。
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RecordField {
    pub name: String,
    pub ty: ScalarType,
    #[serde(default)]
    pub optional: bool,
}

/// 复杂键的记录类型声明（键记录或参数记录）。
///
/// # 教案式说明
/// - **意图 (Why)**：复杂键由“键记录 + 可选参数记录”组成，解码与校验都需要知道字段集合与类型；
/// - **契约 (What)**：`fields` 按声明顺序保存；字段名在同一记录内唯一，重复声明视为配置错误；
/// - **风险 (Trade-offs)**：当前仅支持标量字段，嵌套记录需由资源侧的 Coercer 自行拼装。
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RecordSchema {
    pub name: String,
    pub fields: Vec<RecordField>,
}

impl RecordSchema {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            fields: Vec::new(),
        }
    }

    /// 追加必填字段。
    pub fn required(mut self, name: impl Into<String>, ty: ScalarType) -> Self {
        self.fields.push(RecordField {
            name: name.into(),
            ty,
            optional: false,
        });
        self
    }

    /// 追加可选字段。
    pub fn optional(mut self, name: impl Into<String>, ty: ScalarType) -> Self {
        self.fields.push(RecordField {
            name: name.into(),
            ty,
            optional: true,
        });
        self
    }

    pub fn field(&self, name: &str) -> Option<&RecordField> {
        self.fields.iter().find(|field| field.name == name)
    }
}

/// 资源主键的声明形状。
///
/// # 教案式说明
/// - **意图 (Why)**：注册阶段据此校验 Coercer 的键类型是否相容，请求阶段据此解码原生键字符串；
/// - **契约 (What)**：
///   - `Simple`：单一标量；
///   - `Compound`：有序的命名段集合，段名唯一；
///   - `Complex`：键记录 + 可选参数记录；
/// - **执行 (How)**：声明一次后在注册表中只读共享，不会在服务期间变更。
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "kind")]
pub enum KeyShape {
    Simple {
        ty: ScalarType,
    },
    Compound {
        parts: Vec<KeyPart>,
    },
    Complex {
        key: RecordSchema,
        params: Option<RecordSchema>,
    },
}

impl KeyShape {
    pub fn simple(ty: ScalarType) -> Self {
        KeyShape::Simple { ty }
    }

    pub fn compound<I>(parts: I) -> Self
    where
        I: IntoIterator<Item = KeyPart>,
    {
        KeyShape::Compound {
            parts: parts.into_iter().collect(),
        }
    }

    pub fn complex(key: RecordSchema, params: Option<RecordSchema>) -> Self {
        KeyShape::Complex { key, params }
    }

    pub fn declared_type(&self) -> DeclaredKeyType {
        match self {
            KeyShape::Simple { ty } => DeclaredKeyType::Scalar(*ty),
            KeyShape::Compound { .. } => DeclaredKeyType::Compound,
            KeyShape::Complex { .. } => DeclaredKeyType::Complex,
        }
    }

    /// 检查形状声明本身是否自洽（段名/字段名唯一且非空）。
    pub fn validate(&self) -> Result<(), String> {
        fn unique<'a>(names: impl Iterator<Item = &'a str>, what: &str) -> Result<(), String> {
            let mut seen = std::collections::BTreeSet::new();
            for name in names {
                if name.is_empty() {
                    return Err(format!("{what} name must not be empty"));
                }
                if !seen.insert(name) {
                    return Err(format!("{what} `{name}` is declared more than once"));
                }
            }
            Ok(())
        }

        match self {
            KeyShape::Simple { .. } => Ok(()),
            KeyShape::Compound { parts } => {
                if parts.is_empty() {
                    return Err("compound key must declare at least one part".to_owned());
                }
                unique(parts.iter().map(|part| part.name.as_str()), "key part")
            }
            KeyShape::Complex { key, params } => {
                unique(key.fields.iter().map(|f| f.name.as_str()), "key field")?;
                if let Some(params) = params {
                    unique(params.fields.iter().map(|f| f.name.as_str()), "params field")?;
                }
                Ok(())
            }
        }
    }
}

/// Coercer 声明的键类型，用于注册期与 [`KeyShape`] 做相容性判定。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DeclaredKeyType {
    Scalar(ScalarType),
    Compound,
    Complex,
}

impl DeclaredKeyType {
    pub fn compatible_with(self, shape: &KeyShape) -> bool {
        self == shape.declared_type()
    }
}

impl fmt::Display for DeclaredKeyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeclaredKeyType::Scalar(ty) => write!(f, "{ty}"),
            DeclaredKeyType::Compound => f.write_str("compound"),
            DeclaredKeyType::Complex => f.write_str("complex"),
        }
    }
}

/// 复杂键记录值：字段名 → 标量。
pub type Record = BTreeMap<String, Scalar>;

/// 复合键：命名段集合，按段名规范排序。
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CompoundKey {
    parts: BTreeMap<String, Scalar>,
}

impl CompoundKey {
    pub fn new() -> Self {
        Self::default()
    }

    /// 追加一段，同名段会被覆盖。
    #[must_use]
    pub fn with_part(mut self, name: impl Into<String>, value: impl Into<Scalar>) -> Self {
        self.parts.insert(name.into(), value.into());
        self
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<Scalar>) -> Option<Scalar> {
        self.parts.insert(name.into(), value.into())
    }

    pub fn part(&self, name: &str) -> Option<&Scalar> {
        self.parts.get(name)
    }

    pub fn parts(&self) -> impl Iterator<Item = (&str, &Scalar)> {
        self.parts.iter().map(|(name, value)| (name.as_str(), value))
    }

    pub fn len(&self) -> usize {
        self.parts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.parts.is_empty()
    }
}

/// 复杂键：键记录 + 可选参数记录。
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ComplexKey {
    pub key: Record,
    pub params: Option<Record>,
}

impl ComplexKey {
    pub fn new(key: Record) -> Self {
        Self { key, params: None }
    }

    #[must_use]
    pub fn with_field(mut self, name: impl Into<String>, value: impl Into<Scalar>) -> Self {
        self.key.insert(name.into(), value.into());
        self
    }

    #[must_use]
    pub fn with_param(mut self, name: impl Into<String>, value: impl Into<Scalar>) -> Self {
        self.params
            .get_or_insert_with(Record::new)
            .insert(name.into(), value.into());
        self
    }
}

/// 资源原生主键对象。
///
/// # 教案式说明
/// - **意图 (Why)**：Dispatcher 始终工作在主键空间，所有键位（路径段、批量 id、响应键）最终都落到本类型；
/// - **契约 (What)**：三种变体与 [`KeyShape`] 一一对应，可通过 [`PrimaryKey::conforms_to`] 校验；
/// - **风险 (Trade-offs)**：复合/复杂键整体参与比较，框架从不拆分单独的段做转换。
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PrimaryKey {
    Simple(Scalar),
    Compound(CompoundKey),
    Complex(ComplexKey),
}

impl PrimaryKey {
    pub fn declared_type(&self) -> DeclaredKeyType {
        match self {
            PrimaryKey::Simple(scalar) => DeclaredKeyType::Scalar(scalar.scalar_type()),
            PrimaryKey::Compound(_) => DeclaredKeyType::Compound,
            PrimaryKey::Complex(_) => DeclaredKeyType::Complex,
        }
    }

    /// 校验键值是否满足资源声明的形状。
    ///
    /// # 教案式说明
    /// - **意图 (Why)**：Coercer 由资源作者实现，其输出必须再经框架确认，避免形状错误的键流入 Dispatcher；
    /// - **执行 (How)**：依次比对变体、标量类型、复合键段集合、复杂键必填字段与字段类型；
    /// - **契约 (What)**：成功返回 `Ok(())`；否则返回首个发现的 [`ShapeViolation`]。
    pub fn conforms_to(&self, shape: &KeyShape) -> Result<(), ShapeViolation> {
        match (self, shape) {
            (PrimaryKey::Simple(scalar), KeyShape::Simple { ty }) => {
                if scalar.scalar_type() == *ty {
                    Ok(())
                } else {
                    Err(ShapeViolation::ScalarType {
                        expected: *ty,
                        found: scalar.scalar_type(),
                    })
                }
            }
            (PrimaryKey::Compound(key), KeyShape::Compound { parts }) => {
                for part in parts {
                    match key.part(&part.name) {
                        None => {
                            return Err(ShapeViolation::MissingField {
                                name: part.name.clone(),
                            });
                        }
                        Some(value) if value.scalar_type() != part.ty => {
                            return Err(ShapeViolation::FieldType {
                                name: part.name.clone(),
                                expected: part.ty,
                                found: value.scalar_type(),
                            });
                        }
                        Some(_) => {}
                    }
                }
                match key
                    .parts()
                    .find(|(name, _)| parts.iter().all(|part| part.name != *name))
                {
                    Some((name, _)) => Err(ShapeViolation::UnknownField {
                        name: name.to_owned(),
                    }),
                    None => Ok(()),
                }
            }
            (PrimaryKey::Complex(key), KeyShape::Complex { key: schema, params }) => {
                record_conforms(&key.key, schema)?;
                match (&key.params, params) {
                    (None, _) => Ok(()),
                    (Some(values), Some(schema)) => record_conforms(values, schema),
                    (Some(values), None) => match values.keys().next() {
                        Some(name) => Err(ShapeViolation::UnknownField { name: name.clone() }),
                        None => Ok(()),
                    },
                }
            }
            (key, shape) => Err(ShapeViolation::Variant {
                expected: shape.declared_type(),
                found: key.declared_type(),
            }),
        }
    }
}

fn record_conforms(record: &Record, schema: &RecordSchema) -> Result<(), ShapeViolation> {
    for field in &schema.fields {
        match record.get(&field.name) {
            None if field.optional => {}
            None => {
                return Err(ShapeViolation::MissingField {
                    name: field.name.clone(),
                });
            }
            Some(value) if value.scalar_type() != field.ty => {
                return Err(ShapeViolation::FieldType {
                    name: field.name.clone(),
                    expected: field.ty,
                    found: value.scalar_type(),
                });
            }
            Some(_) => {}
        }
    }
    match record.keys().find(|name| schema.field(name).is_none()) {
        Some(name) => Err(ShapeViolation::UnknownField { name: name.clone() }),
        None => Ok(()),
    }
}

impl From<Scalar> for PrimaryKey {
    fn from(value: Scalar) -> Self {
        PrimaryKey::Simple(value)
    }
}

impl From<CompoundKey> for PrimaryKey {
    fn from(value: CompoundKey) -> Self {
        PrimaryKey::Compound(value)
    }
}

impl From<ComplexKey> for PrimaryKey {
    fn from(value: ComplexKey) -> Self {
        PrimaryKey::Complex(value)
    }
}

impl fmt::Display for PrimaryKey {
    /// 输出原生字符串形式，等价于 [`codec::encode`]。
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&codec::encode(self))
    }
}

/// 键值与声明形状不符。
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ShapeViolation {
    #[error("expected a {expected} key, found a {found} key")]
    Variant {
        expected: DeclaredKeyType,
        found: DeclaredKeyType,
    },
    #[error("expected scalar type {expected}, found {found}")]
    ScalarType {
        expected: ScalarType,
        found: ScalarType,
    },
    #[error("required key field `{name}` is missing")]
    MissingField { name: String },
    #[error("key field `{name}` is not declared")]
    UnknownField { name: String },
    #[error("key field `{name}` expects {expected}, found {found}")]
    FieldType {
        name: String,
        expected: ScalarType,
        found: ScalarType,
    },
}

/// 资源作者可直接使用的强类型键。
///
/// # 教案式说明
/// - **意图 (Why)**：Coercer 以资源自身的键类型（如 `i64`、[`CompoundKey`]）编写，
///   框架在注册时借助本 trait 完成类型擦除，并据 `declared_type` 校验与形状是否相容；
/// - **契约 (What)**：`from_primary(&k.into_primary()) == Some(k)`；变体不符时返回 `None`。
pub trait ResourceKey: Sized + Send + Sync + 'static {
    fn declared_type() -> DeclaredKeyType;
    fn into_primary(self) -> PrimaryKey;
    fn from_primary(key: &PrimaryKey) -> Option<Self>;
}

macro_rules! scalar_resource_key {
    ($ty:ty, $variant:ident) => {
        impl ResourceKey for $ty {
            fn declared_type() -> DeclaredKeyType {
                DeclaredKeyType::Scalar(ScalarType::$variant)
            }

            fn into_primary(self) -> PrimaryKey {
                PrimaryKey::Simple(Scalar::$variant(self))
            }

            fn from_primary(key: &PrimaryKey) -> Option<Self> {
                match key {
                    PrimaryKey::Simple(Scalar::$variant(value)) => Some(value.clone()),
                    _ => None,
                }
            }
        }
    };
}

scalar_resource_key!(i32, Int);
scalar_resource_key!(i64, Long);
scalar_resource_key!(String, String);
scalar_resource_key!(bool, Boolean);

impl ResourceKey for CompoundKey {
    fn declared_type() -> DeclaredKeyType {
        DeclaredKeyType::Compound
    }

    fn into_primary(self) -> PrimaryKey {
        PrimaryKey::Compound(self)
    }

    fn from_primary(key: &PrimaryKey) -> Option<Self> {
        match key {
            PrimaryKey::Compound(value) => Some(value.clone()),
            _ => None,
        }
    }
}

impl ResourceKey for ComplexKey {
    fn declared_type() -> DeclaredKeyType {
        DeclaredKeyType::Complex
    }

    fn into_primary(self) -> PrimaryKey {
        PrimaryKey::Complex(self)
    }

    fn from_primary(key: &PrimaryKey) -> Option<Self> {
        match key {
            PrimaryKey::Complex(value) => Some(value.clone()),
            _ => None,
        }
    }
}
