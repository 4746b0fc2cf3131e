//! gRPC front door for the proxy resume fast path.
//!
//! Thin adapter layer: converts wire messages to/from `ResumeCoordinator`'s
//! own types and maps `ApiError` to `tonic::Status` via `ErrorKind::grpc_code`
//! (the one place besides `error.rs` allowed to know about transport status
//! codes). `http_api.rs` covers the REST surface; this is the dedicated
//! `tonic` service alongside it, matching the shape services take
//! throughout that ecosystem.

use std::sync::Arc;

use tonic::{Request, Response, Status};

use crate::error::{ApiError, GrpcCode};
use crate::proxy::v1::proxy_resume_server::ProxyResume;
use crate::proxy::v1::{SandboxResumeRequest, SandboxResumeResponse};
use crate::resume::ResumeCoordinator;

fn to_status(err: ApiError) -> Status {
    let code = match err.kind.grpc_code() {
        GrpcCode::InvalidArgument => tonic::Code::InvalidArgument,
        GrpcCode::Unauthenticated => tonic::Code::Unauthenticated,
        GrpcCode::PermissionDenied => tonic::Code::PermissionDenied,
        GrpcCode::NotFound => tonic::Code::NotFound,
        GrpcCode::AlreadyExists => tonic::Code::AlreadyExists,
        GrpcCode::ResourceExhausted => tonic::Code::ResourceExhausted,
        GrpcCode::FailedPrecondition => tonic::Code::FailedPrecondition,
        GrpcCode::DeadlineExceeded => tonic::Code::DeadlineExceeded,
        GrpcCode::Unimplemented => tonic::Code::Unimplemented,
        GrpcCode::Unavailable => tonic::Code::Unavailable,
        GrpcCode::Internal => tonic::Code::Internal,
    };
    Status::new(code, err.client_msg)
}

pub struct ProxyResumeService {
    coordinator: Arc<ResumeCoordinator>,
}

impl ProxyResumeService {
    pub fn new(coordinator: Arc<ResumeCoordinator>) -> Self {
        Self { coordinator }
    }
}

#[tonic::async_trait]
impl ProxyResume for ProxyResumeService {
    async fn resume_sandbox(&self, request: Request<SandboxResumeRequest>) -> Result<Response<SandboxResumeResponse>, Status> {
        let sandbox_id = request.into_inner().sandbox_id;
        if sandbox_id.is_empty() {
            return Err(Status::invalid_argument("sandbox_id must not be empty"));
        }

        let routing = self.coordinator.resume_for_proxy(&sandbox_id).await.map_err(to_status)?;

        Ok(Response::new(SandboxResumeResponse {
            orchestrator_ip: routing.node.address,
        }))
    }
}
