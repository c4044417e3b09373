//! 端到端的备用键处理阶段：入站改写 → Dispatcher → 出站改写。

use std::sync::Arc;

use tracing::{debug, error};

use crate::config::AltKeyConfig;
use crate::error::AltKeyError;
use crate::registry::AltKeyRegistry;
use crate::request::{InboundRequest, KeyedRequest, RequestKeyRewriter};
use crate::response::{DispatchResponse, RenderedResponse, ResponseKeyRewriter};

/// 资源方法调用的协作方。
///
/// # 教案式说明
/// - **意图 (Why)**：资源业务逻辑（存储、校验、Action）对备用键一无所知，只处理主键空间的请求；
/// - **契约 (What)**：输入为 [`KeyedRequest`]，输出为以主键表达键位的 [`DispatchResponse`]；
///   业务错误（未找到、校验失败等）以 [`crate::response::ResponseBody::Error`] 返回，本层原样透传。
pub trait Dispatcher {
    fn dispatch(&self, request: KeyedRequest) -> DispatchResponse;
}

impl<F> Dispatcher for F
where
    F: Fn(KeyedRequest) -> DispatchResponse,
{
    fn dispatch(&self, request: KeyedRequest) -> DispatchResponse {
        self(request)
    }
}

/// 备用键处理管线。
///
/// # 教案式说明
/// - **意图 (Why)**：把注册表与配置作为启动期构建的只读值注入，请求期只做纯同步变换；
/// - **执行 (How)**：
///   1. [`RequestKeyRewriter`] 将请求改写到主键空间，并生成请求级上下文；
///   2. 调用 [`Dispatcher`]；
///   3. [`ResponseKeyRewriter`] 消费上下文，把响应键位渲染回客户端使用的键空间；
/// - **契约 (What)**：本层错误渲染为 `{status, code, message}` 错误响应，且入站错误不会抵达 Dispatcher；
/// - **风险 (Trade-offs)**：出站渲染失败时 Dispatcher 的副作用已经发生，响应仍为 500。
#[derive(Clone, Debug)]
pub struct AltKeyPipeline {
    registry: Arc<AltKeyRegistry>,
    config: AltKeyConfig,
}

impl AltKeyPipeline {
    pub fn new(registry: Arc<AltKeyRegistry>, config: AltKeyConfig) -> Self {
        Self { registry, config }
    }

    pub fn registry(&self) -> &AltKeyRegistry {
        &self.registry
    }

    pub fn config(&self) -> &AltKeyConfig {
        &self.config
    }

    pub fn request_rewriter(&self) -> RequestKeyRewriter<'_> {
        RequestKeyRewriter::new(&self.registry, &self.config)
    }

    pub fn response_rewriter(&self) -> ResponseKeyRewriter<'_> {
        ResponseKeyRewriter::new(&self.registry, &self.config)
    }

    pub fn handle<D>(&self, dispatcher: &D, request: InboundRequest) -> RenderedResponse
    where
        D: Dispatcher + ?Sized,
    {
        let operation = request.operation;
        let resource = request
            .target()
            .map(|segment| segment.resource.to_string())
            .unwrap_or_default();
        let altkey = request
            .query
            .get(&self.config.selector_param)
            .unwrap_or("-")
            .to_owned();

        let outcome = self
            .request_rewriter()
            .rewrite(request)
            .and_then(|(keyed, context)| {
                let response = dispatcher.dispatch(keyed);
                self.response_rewriter().rewrite(context, response)
            });

        match outcome {
            Ok(response) => response,
            Err(failure) => {
                report(&failure, &resource, &altkey, operation.as_str());
                RenderedResponse::from_error(&failure)
            }
        }
    }
}

fn report(failure: &AltKeyError, resource: &str, altkey: &str, operation: &str) {
    if failure.is_server_fault() {
        error!(
            resource,
            altkey,
            operation,
            code = failure.code(),
            error = %failure,
            "alternative key resolution failed"
        );
    } else {
        debug!(
            resource,
            altkey,
            operation,
            code = failure.code(),
            error = %failure,
            "request rejected by alternative key resolution"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::{KeyShape, ScalarType};
    use crate::request::OperationKind;
    use serde_json::json;
    use std::cell::Cell;

    fn pipeline() -> AltKeyPipeline {
        let mut builder = AltKeyRegistry::builder();
        builder
            .declare_resource("greetings", KeyShape::simple(ScalarType::Long))
            .expect("声明成功");
        AltKeyPipeline::new(
            Arc::new(builder.build().expect("构建成功")),
            AltKeyConfig::default(),
        )
    }

    #[test]
    fn rejected_requests_never_reach_the_dispatcher() {
        let pipeline = pipeline();
        let calls = Cell::new(0);
        let dispatcher = |_request: KeyedRequest| {
            calls.set(calls.get() + 1);
            DispatchResponse::empty(204)
        };

        let response = pipeline.handle(
            &dispatcher,
            InboundRequest::new(OperationKind::Get, "greetings")
                .with_key("1")
                .with_param("altkey", "missing"),
        );
        assert_eq!(response.status, 400);
        assert_eq!(calls.get(), 0, "未知备用键不应调用 Dispatcher");

        let response = pipeline.handle(
            &dispatcher,
            InboundRequest::new(OperationKind::Get, "greetings").with_key("1"),
        );
        assert_eq!(response.status, 204);
        assert_eq!(calls.get(), 1);
    }

    #[test]
    fn native_created_id_is_written_to_headers() {
        let pipeline = pipeline();
        let dispatcher = |_request: KeyedRequest| {
            DispatchResponse::entity(201, json!({"message": "hi"}))
                .with_created_id(crate::key::Scalar::Long(9).into())
        };
        let response = pipeline.handle(
            &dispatcher,
            InboundRequest::new(OperationKind::Create, "greetings").with_base_path("/v2/"),
        );
        assert_eq!(response.header("X-Resource-Id"), Some("9"));
        assert_eq!(response.header("location"), Some("/v2/greetings/9"));
        assert_eq!(response.entity(), Some(&json!({"message": "hi"})));
    }

    #[test]
    fn native_string_ids_stay_inside_one_path_segment() {
        let mut builder = AltKeyRegistry::builder();
        builder
            .declare_resource("files", KeyShape::simple(ScalarType::String))
            .expect("声明成功");
        let pipeline = AltKeyPipeline::new(
            Arc::new(builder.build().expect("构建成功")),
            AltKeyConfig::default(),
        );
        let dispatcher = |_request: KeyedRequest| {
            DispatchResponse::empty(201).with_created_id(crate::key::Scalar::from("a/b?c#d").into())
        };

        let response = pipeline.handle(
            &dispatcher,
            InboundRequest::new(OperationKind::Create, "files"),
        );
        assert_eq!(response.header("X-Resource-Id"), Some("a%2Fb%3Fc%23d"));
        assert_eq!(
            response.header("Location"),
            Some("/files/a%2Fb%3Fc%23d"),
            "Location 不应被键值拆成额外的路径段、查询或片段"
        );

        let fetched = Cell::new(None);
        let echo = |request: KeyedRequest| {
            fetched.set(request.key().cloned());
            DispatchResponse::empty(204)
        };
        pipeline.handle(
            &echo,
            InboundRequest::new(OperationKind::Get, "files").with_key("a%2Fb%3Fc%23d"),
        );
        assert_eq!(
            fetched.take(),
            Some(crate::key::PrimaryKey::from(crate::key::Scalar::from("a/b?c#d"))),
            "渲染出的 id 可原样用于后续寻址"
        );
    }
}
