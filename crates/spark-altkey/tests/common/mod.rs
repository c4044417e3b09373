//! 集成测试共享夹具：注册表、Coercer 与内存中的 greetings Dispatcher。
#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use serde_json::{Value, json};
use spark_altkey::{
    AltKeyConfig, AltKeyPipeline, AltKeyRegistry, BatchResponse, CoercionError, ComplexKey,
    CompoundKey, CreateStatus, DispatchResponse, Dispatcher, ErrorDetail, InboundRequest,
    KeyCoercer, KeyPart, KeyShape, KeyedRequest, OperationKind, PrimaryKey, RecordSchema, Scalar,
    ScalarType,
};

pub const ALT_KEY: &str = "altKey";
pub const ALT_KEY_SUB: &str = "altKeySub";
pub const ASSOCIATION: &str = "associationAltKey";
pub const COMPLEX: &str = "complexKeyAltKey";

/// 创建操作分配的第一个 id。
pub const FIRST_CREATED_ID: i64 = 100;

/// `Alt{n}` ⇄ `n`
pub struct AltPrefixCoercer;

impl KeyCoercer<i64> for AltPrefixCoercer {
    fn coerce_to_key(&self, alt_key: &str) -> Result<i64, CoercionError> {
        alt_key
            .strip_prefix("Alt")
            .and_then(|digits| digits.parse().ok())
            .ok_or_else(|| CoercionError::invalid(format!("`{alt_key}` is not of the form AltN")))
    }

    fn coerce_from_key(&self, key: &i64) -> Result<String, CoercionError> {
        Ok(format!("Alt{key}"))
    }
}

/// `urn:li:message:{n}` ⇄ `n`
pub struct MessageUrnCoercer;

impl KeyCoercer<i64> for MessageUrnCoercer {
    fn coerce_to_key(&self, alt_key: &str) -> Result<i64, CoercionError> {
        alt_key
            .strip_prefix("urn:li:message:")
            .and_then(|digits| digits.parse().ok())
            .ok_or_else(|| CoercionError::invalid(format!("`{alt_key}` is not a message urn")))
    }

    fn coerce_from_key(&self, key: &i64) -> Result<String, CoercionError> {
        Ok(format!("urn:li:message:{key}"))
    }
}

/// `message{m}xgreetingId{g}` ⇄ `(greetingId:g,message:m)`
pub struct AssociationCoercer;

impl KeyCoercer<CompoundKey> for AssociationCoercer {
    fn coerce_to_key(&self, alt_key: &str) -> Result<CompoundKey, CoercionError> {
        let invalid = || CoercionError::invalid(format!("`{alt_key}` is not an association key"));
        let rest = alt_key.strip_prefix("message").ok_or_else(invalid)?;
        let (message, greeting) = rest.rsplit_once("xgreetingId").ok_or_else(invalid)?;
        let greeting: i64 = greeting.parse().map_err(|_| invalid())?;
        Ok(CompoundKey::new()
            .with_part("greetingId", greeting)
            .with_part("message", message))
    }

    fn coerce_from_key(&self, key: &CompoundKey) -> Result<String, CoercionError> {
        match (key.part("message"), key.part("greetingId")) {
            (Some(Scalar::String(message)), Some(Scalar::Long(greeting))) => {
                Ok(format!("message{message}xgreetingId{greeting}"))
            }
            _ => Err(CoercionError::fault("association key is missing parts")),
        }
    }
}

/// 只产出 `greetingId` 一段的 Coercer，用于触发形状校验。
pub struct PartialAssociationCoercer;

impl KeyCoercer<CompoundKey> for PartialAssociationCoercer {
    fn coerce_to_key(&self, alt_key: &str) -> Result<CompoundKey, CoercionError> {
        let greeting: i64 = alt_key
            .parse()
            .map_err(|_| CoercionError::invalid(alt_key))?;
        Ok(CompoundKey::new().with_part("greetingId", greeting))
    }

    fn coerce_from_key(&self, key: &CompoundKey) -> Result<String, CoercionError> {
        key.part("greetingId")
            .map(ToString::to_string)
            .ok_or_else(|| CoercionError::fault("missing greetingId"))
    }
}

/// `majorx{a}xminorx{b}[xversionx{v}]` ⇄ `(major:a,minor:b[,$params:(version:v)])`
pub struct ComplexCoercer;

impl KeyCoercer<ComplexKey> for ComplexCoercer {
    fn coerce_to_key(&self, alt_key: &str) -> Result<ComplexKey, CoercionError> {
        let invalid = || CoercionError::invalid(format!("`{alt_key}` is not a complex key"));
        let rest = alt_key.strip_prefix("majorx").ok_or_else(invalid)?;
        let (major, rest) = rest.split_once("xminorx").ok_or_else(invalid)?;
        let key = ComplexKey::default().with_field("major", major);
        match rest.split_once("xversionx") {
            Some((minor, version)) => {
                let version: i64 = version.parse().map_err(|_| invalid())?;
                Ok(key.with_field("minor", minor).with_param("version", version))
            }
            None => Ok(key.with_field("minor", rest)),
        }
    }

    fn coerce_from_key(&self, key: &ComplexKey) -> Result<String, CoercionError> {
        let (Some(Scalar::String(major)), Some(Scalar::String(minor))) =
            (key.key.get("major"), key.key.get("minor"))
        else {
            return Err(CoercionError::fault("complex key is missing fields"));
        };
        let mut rendered = format!("majorx{major}xminorx{minor}");
        match key.params.as_ref().map(|params| params.get("version")) {
            None | Some(None) => {}
            Some(Some(Scalar::Long(version))) => {
                rendered.push_str(&format!("xversionx{version}"));
            }
            Some(Some(_)) => return Err(CoercionError::fault("version param must be a long")),
        }
        Ok(rendered)
    }
}

/// 把奇偶性相同的主键映射到同一个字符串，用于观察碰撞行为。
pub struct BucketCoercer;

impl KeyCoercer<i64> for BucketCoercer {
    fn coerce_to_key(&self, alt_key: &str) -> Result<i64, CoercionError> {
        alt_key
            .strip_prefix("bucket")
            .and_then(|digits| digits.parse().ok())
            .ok_or_else(|| CoercionError::invalid(alt_key))
    }

    fn coerce_from_key(&self, key: &i64) -> Result<String, CoercionError> {
        Ok(format!("bucket{}", key % 2))
    }
}

/// 违约的 Coercer：`boom` 触发故障，主键 13 无法渲染。
pub struct FaultyCoercer;

pub const UNRENDERABLE_ID: i64 = 13;

impl KeyCoercer<i64> for FaultyCoercer {
    fn coerce_to_key(&self, alt_key: &str) -> Result<i64, CoercionError> {
        if alt_key == "boom" {
            return Err(CoercionError::fault("lookup table unavailable"));
        }
        AltPrefixCoercer.coerce_to_key(alt_key)
    }

    fn coerce_from_key(&self, key: &i64) -> Result<String, CoercionError> {
        if *key == UNRENDERABLE_ID {
            return Err(CoercionError::invalid(format!("no alternative key for {key}")));
        }
        AltPrefixCoercer.coerce_from_key(key)
    }
}

pub fn long_shape() -> KeyShape {
    KeyShape::simple(ScalarType::Long)
}

pub fn association_shape() -> KeyShape {
    KeyShape::compound([
        KeyPart::new("greetingId", ScalarType::Long),
        KeyPart::new("message", ScalarType::String),
    ])
}

pub fn complex_shape() -> KeyShape {
    KeyShape::complex(
        RecordSchema::new("TwoPartKey")
            .required("major", ScalarType::String)
            .required("minor", ScalarType::String),
        Some(RecordSchema::new("TwoPartKeyParams").optional("version", ScalarType::Long)),
    )
}

pub fn registry() -> AltKeyRegistry {
    let mut builder = AltKeyRegistry::builder();
    builder
        .register::<i64, _>(ALT_KEY, "alt", AltPrefixCoercer, long_shape())
        .and_then(|b| b.register::<i64, _>(ALT_KEY, "bucket", BucketCoercer, long_shape()))
        .and_then(|b| b.register::<i64, _>(ALT_KEY, "faulty", FaultyCoercer, long_shape()))
        .and_then(|b| b.declare_sub_resource(ALT_KEY_SUB, ALT_KEY, long_shape()))
        .and_then(|b| b.register::<i64, _>(ALT_KEY_SUB, "alt", MessageUrnCoercer, long_shape()))
        .and_then(|b| {
            b.register::<CompoundKey, _>(ASSOCIATION, "alt", AssociationCoercer, association_shape())
        })
        .and_then(|b| {
            b.register::<CompoundKey, _>(
                ASSOCIATION,
                "partial",
                PartialAssociationCoercer,
                association_shape(),
            )
        })
        .and_then(|b| b.register::<ComplexKey, _>(COMPLEX, "alt", ComplexCoercer, complex_shape()))
        .expect("夹具注册表合法");
    builder.build().expect("夹具注册表构建成功")
}

pub fn pipeline() -> AltKeyPipeline {
    pipeline_with(AltKeyConfig::default())
}

pub fn pipeline_with(config: AltKeyConfig) -> AltKeyPipeline {
    AltKeyPipeline::new(Arc::new(registry()), config)
}

pub fn long_key(id: i64) -> PrimaryKey {
    PrimaryKey::Simple(Scalar::Long(id))
}

pub fn association_key(greeting: i64, message: &str) -> PrimaryKey {
    CompoundKey::new()
        .with_part("greetingId", greeting)
        .with_part("message", message)
        .into()
}

pub fn complex_key(major: &str, minor: &str) -> PrimaryKey {
    ComplexKey::default()
        .with_field("major", major)
        .with_field("minor", minor)
        .into()
}

/// 携带 `$params:(version:v)` 的复杂键。
pub fn versioned_complex_key(major: &str, minor: &str, version: i64) -> PrimaryKey {
    ComplexKey::default()
        .with_field("major", major)
        .with_field("minor", minor)
        .with_param("version", version)
        .into()
}

/// 为请求追加 `altkey=<name>`。
pub fn with_alt(request: InboundRequest, name: &str) -> InboundRequest {
    request.with_param("altkey", name)
}

pub fn batch(operation: OperationKind, resource: &str, ids: &[&str]) -> InboundRequest {
    InboundRequest::new(operation, resource).with_params("ids", ids.iter().copied())
}

type StoreKey = (String, Vec<PrimaryKey>);

struct StoreState {
    entities: BTreeMap<StoreKey, Value>,
    next_id: i64,
    calls: usize,
}

/// 内存中的 greetings 资源集合，只工作在主键空间。
pub struct GreetingStore {
    state: Mutex<StoreState>,
}

impl GreetingStore {
    pub fn seeded() -> Self {
        let mut entities = BTreeMap::new();
        let mut seed = |resource: &str, path: Vec<PrimaryKey>, message: &str| {
            entities.insert(
                (resource.to_owned(), path),
                json!({"message": message, "tone": "FRIENDLY"}),
            );
        };
        seed(ALT_KEY, vec![long_key(1)], "Hello");
        seed(ALT_KEY, vec![long_key(2)], "World");
        seed(ALT_KEY, vec![long_key(3)], "Again");
        seed(ALT_KEY_SUB, vec![long_key(1), long_key(1)], "sub 1 of 1");
        seed(ALT_KEY_SUB, vec![long_key(1), long_key(2)], "sub 2 of 1");
        seed(ALT_KEY_SUB, vec![long_key(2), long_key(1)], "sub 1 of 2");
        seed(ASSOCIATION, vec![association_key(1, "a")], "assoc a");
        seed(ASSOCIATION, vec![association_key(2, "b")], "assoc b");
        seed(COMPLEX, vec![complex_key("KEY 1", "KEY 1")], "complex 1");
        seed(COMPLEX, vec![complex_key("KEY 2", "KEY 2")], "complex 2");
        seed(
            COMPLEX,
            vec![versioned_complex_key("KEY 1", "KEY 1", 2)],
            "complex 1 v2",
        );

        Self {
            state: Mutex::new(StoreState {
                entities,
                next_id: FIRST_CREATED_ID,
                calls: 0,
            }),
        }
    }

    pub fn calls(&self) -> usize {
        self.state.lock().expect("store lock").calls
    }

    pub fn entity(&self, resource: &str, path: Vec<PrimaryKey>) -> Option<Value> {
        self.state
            .lock()
            .expect("store lock")
            .entities
            .get(&(resource.to_owned(), path))
            .cloned()
    }
}

fn not_found() -> ErrorDetail {
    ErrorDetail::new(404, "greetings.not_found", "greeting not found")
}

fn bad_request(message: &str) -> DispatchResponse {
    DispatchResponse::error(ErrorDetail::new(400, "greetings.bad_request", message))
}

/// 按资源形状分配新主键；复杂键资源在实体带有 `version` 时把它写入参数记录。
fn allocate(resource: &str, id: i64, entity: &Value) -> PrimaryKey {
    match resource {
        ASSOCIATION => association_key(id, &format!("m{id}")),
        COMPLEX => match entity.get("version").and_then(Value::as_i64) {
            Some(version) => {
                versioned_complex_key(&format!("KEY {id}"), &format!("KEY {id}"), version)
            }
            None => complex_key(&format!("KEY {id}"), &format!("KEY {id}")),
        },
        _ => long_key(id),
    }
}

fn merge(target: &mut Value, patch: &Value) {
    if let (Some(target), Some(patch)) = (target.as_object_mut(), patch.as_object()) {
        for (field, value) in patch {
            target.insert(field.clone(), value.clone());
        }
    }
}

impl Dispatcher for GreetingStore {
    fn dispatch(&self, request: KeyedRequest) -> DispatchResponse {
        let mut state = self.state.lock().expect("store lock");
        state.calls += 1;

        let resource = request.target.resource.as_str().to_owned();
        let prefix: Vec<PrimaryKey> = request
            .parents
            .iter()
            .filter_map(|segment| segment.key.clone())
            .collect();
        let path = |key: &PrimaryKey| {
            let mut path = prefix.clone();
            path.push(key.clone());
            (resource.clone(), path)
        };

        match request.operation {
            OperationKind::Get => {
                let Some(key) = request.key() else {
                    return bad_request("missing key");
                };
                match state.entities.get(&path(key)) {
                    Some(entity) => DispatchResponse::entity(200, entity.clone()),
                    None => DispatchResponse::error(not_found()),
                }
            }
            OperationKind::BatchGet => {
                let mut response = BatchResponse::default();
                for key in request.batch_keys() {
                    match state.entities.get(&path(key)) {
                        Some(entity) => response.results.push((key.clone(), entity.clone())),
                        None => response.errors.push((key.clone(), not_found())),
                    }
                }
                DispatchResponse::new(200, spark_altkey::ResponseBody::Batch(response))
            }
            OperationKind::Create => {
                let entity = request.body.clone().unwrap_or(Value::Null);
                let id = allocate(&resource, state.next_id, &entity);
                state.next_id += 1;
                state.entities.insert(path(&id), entity);
                DispatchResponse::empty(201).with_created_id(id)
            }
            OperationKind::BatchCreate => {
                let Some(Value::Array(entities)) = request.body.clone() else {
                    return bad_request("batch create expects an array");
                };
                let mut statuses = Vec::with_capacity(entities.len());
                for entity in entities {
                    if entity.get("message").is_none() {
                        statuses.push(CreateStatus::failed(ErrorDetail::new(
                            422,
                            "greetings.invalid",
                            "message is required",
                        )));
                        continue;
                    }
                    let id = allocate(&resource, state.next_id, &entity);
                    state.next_id += 1;
                    state.entities.insert(path(&id), entity);
                    statuses.push(CreateStatus::created(id));
                }
                DispatchResponse::new(200, spark_altkey::ResponseBody::BatchCreate(statuses))
            }
            OperationKind::Update | OperationKind::PartialUpdate => {
                let Some(key) = request.key() else {
                    return bad_request("missing key");
                };
                let patch = request.body.clone().unwrap_or(Value::Null);
                match state.entities.get_mut(&path(key)) {
                    Some(entity) if request.operation == OperationKind::Update => {
                        *entity = patch;
                        DispatchResponse::empty(204)
                    }
                    Some(entity) => {
                        merge(entity, &patch);
                        DispatchResponse::empty(204)
                    }
                    None => DispatchResponse::error(not_found()),
                }
            }
            OperationKind::BatchUpdate | OperationKind::BatchPartialUpdate => {
                let mut response = BatchResponse::default();
                let partial = request.operation == OperationKind::BatchPartialUpdate;
                for (key, patch) in request.batch_entities.clone().unwrap_or_default() {
                    match state.entities.get_mut(&path(&key)) {
                        Some(entity) => {
                            if partial {
                                merge(entity, &patch);
                            } else {
                                *entity = patch;
                            }
                            response.results.push((key, json!({"status": 204})));
                        }
                        None => response.errors.push((key, not_found())),
                    }
                }
                DispatchResponse::new(200, spark_altkey::ResponseBody::Batch(response))
            }
            OperationKind::Delete => {
                let Some(key) = request.key() else {
                    return bad_request("missing key");
                };
                match state.entities.remove(&path(key)) {
                    Some(_) => DispatchResponse::empty(204),
                    None => DispatchResponse::error(not_found()),
                }
            }
            OperationKind::BatchDelete => {
                let mut response = BatchResponse::default();
                for key in request.batch_keys() {
                    match state.entities.remove(&path(key)) {
                        Some(_) => response.results.push((key.clone(), json!({"status": 204}))),
                        None => response.errors.push((key.clone(), not_found())),
                    }
                }
                DispatchResponse::new(200, spark_altkey::ResponseBody::Batch(response))
            }
            OperationKind::Action => match request.key() {
                Some(key) => match state.entities.get(&path(key)) {
                    Some(entity) => DispatchResponse::entity(
                        200,
                        json!({"value": entity["message"].as_str().map(str::to_uppercase)}),
                    ),
                    None => DispatchResponse::error(not_found()),
                },
                None => {
                    let count = state
                        .entities
                        .keys()
                        .filter(|(candidate, _)| *candidate == resource)
                        .count();
                    DispatchResponse::entity(200, json!({"value": count}))
                }
            },
        }
    }
}
