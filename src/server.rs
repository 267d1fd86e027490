//! Envoy ext_authz gRPC server
//!
//! Reads claims from route filter metadata and answers every check either
//! with an `Authorization: Bearer` header to inject or with a fixed 500
//! denial.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use envoy_types::ext_authz::v3::pb::{
    Authorization, AuthorizationServer, CheckRequest, CheckResponse,
};
use envoy_types::pb::envoy::config::core::v3::{HeaderValue, HeaderValueOption};
use envoy_types::pb::envoy::r#type::v3::{HttpStatus, StatusCode};
use envoy_types::pb::envoy::service::auth::v3::check_response::HttpResponse;
use envoy_types::pb::envoy::service::auth::v3::{DeniedHttpResponse, OkHttpResponse};
use envoy_types::pb::google::protobuf::value::Kind;
use envoy_types::pb::google::rpc;
use tonic::{Request, Response, Status};
use tracing::{debug, info};

use crate::exchange::TokenPipeline;
use crate::injector::{CheckOutcome, TokenInjector};

/// Default route metadata namespace carrying the claims.
pub const DEFAULT_METADATA_NAMESPACE: &str = "com.unitvectory.authzgcpk8stokeninjector";

/// gRPC status code sent with a denial (INTERNAL).
const DENIED_GRPC_CODE: i32 = 13;
const DENIED_GRPC_MESSAGE: &str = "Internal server error";
const DENIED_BODY: &str = "Failed to request token";

/// ext_authz gRPC server
pub struct InjectorServer<P> {
    injector: Arc<TokenInjector<P>>,
    metadata_namespace: String,
    addr: SocketAddr,
}

impl<P: TokenPipeline + 'static> InjectorServer<P> {
    pub fn new(
        injector: Arc<TokenInjector<P>>,
        metadata_namespace: impl Into<String>,
        addr: SocketAddr,
    ) -> Self {
        Self {
            injector,
            metadata_namespace: metadata_namespace.into(),
            addr,
        }
    }

    /// Run the gRPC server until the process exits.
    pub async fn run(self) -> Result<()> {
        let addr = self.addr;
        let service = InjectorService {
            injector: self.injector,
            metadata_namespace: self.metadata_namespace,
        };

        info!(%addr, "Starting ext_authz gRPC server");

        tonic::transport::Server::builder()
            .add_service(AuthorizationServer::new(service))
            .serve(addr)
            .await
            .with_context(|| format!("gRPC server on {} failed", addr))
    }
}

/// Internal gRPC service implementation
struct InjectorService<P> {
    injector: Arc<TokenInjector<P>>,
    metadata_namespace: String,
}

/// String-valued fields of the route filter metadata under `namespace`.
pub fn extract_metadata_claims(request: &CheckRequest, namespace: &str) -> HashMap<String, String> {
    let metadata = request
        .attributes
        .as_ref()
        .and_then(|a| a.route_metadata_context.as_ref())
        .and_then(|m| m.filter_metadata.get(namespace));

    let Some(metadata) = metadata else {
        debug!(namespace = %namespace, "Namespace not found in filter metadata");
        return HashMap::new();
    };

    metadata
        .fields
        .iter()
        .filter_map(|(key, value)| match &value.kind {
            Some(Kind::StringValue(s)) => Some((key.clone(), s.clone())),
            _ => None,
        })
        .collect()
}

/// Build an allow response injecting the bearer token
pub fn authorized_response(token: &str) -> CheckResponse {
    CheckResponse {
        status: Some(rpc::Status {
            code: 0,
            ..Default::default()
        }),
        http_response: Some(HttpResponse::OkResponse(OkHttpResponse {
            headers: vec![HeaderValueOption {
                header: Some(HeaderValue {
                    key: "Authorization".to_string(),
                    value: format!("Bearer {}", token),
                    ..Default::default()
                }),
                ..Default::default()
            }],
            ..Default::default()
        })),
        ..Default::default()
    }
}

/// Build the fixed denial response
pub fn denied_response() -> CheckResponse {
    CheckResponse {
        status: Some(rpc::Status {
            code: DENIED_GRPC_CODE,
            message: DENIED_GRPC_MESSAGE.to_string(),
            ..Default::default()
        }),
        http_response: Some(HttpResponse::DeniedResponse(DeniedHttpResponse {
            status: Some(HttpStatus {
                code: StatusCode::InternalServerError as i32,
            }),
            body: DENIED_BODY.to_string(),
            ..Default::default()
        })),
        ..Default::default()
    }
}

#[tonic::async_trait]
impl<P: TokenPipeline + 'static> Authorization for InjectorService<P> {
    async fn check(
        &self,
        request: Request<CheckRequest>,
    ) -> std::result::Result<Response<CheckResponse>, Status> {
        let check_request = request.into_inner();
        let claims = extract_metadata_claims(&check_request, &self.metadata_namespace);

        let response = match self.injector.check(&claims).await {
            CheckOutcome::Authorized { token } => authorized_response(&token),
            CheckOutcome::Denied => denied_response(),
        };

        Ok(Response::new(response))
    }
}
