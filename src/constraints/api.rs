use std::sync::Arc;

use async_trait::async_trait;
use jsonrpsee::{
    core::RpcResult,
    proc_macros::rpc,
    types::{
        ErrorObject,
        error::{INTERNAL_ERROR_CODE, INVALID_PARAMS_CODE},
    },
};
use tracing::info;

use crate::constraints::{BatchedSignedConstraints, ConstraintCache, ParseError};

/// Constraints submission rpc interface.
#[rpc(server, namespace = "constraints")]
pub trait ConstraintsApi {
    /// Pushes a batch of signed constraints, returning how many were stored.
    #[method(name = "submitConstraintsV1")]
    async fn submit_constraints_v1(&self, batch: BatchedSignedConstraints) -> RpcResult<usize>;
}

/// The type that implements the constraints rpc trait
#[derive(Clone, Debug, derive_more::Deref)]
pub struct ConstraintsApi {
    #[deref]
    inner: Arc<ConstraintsApiInner>,
}

impl ConstraintsApi {
    pub fn new(cache: Arc<ConstraintCache>) -> Self {
        Self { inner: Arc::new(ConstraintsApiInner { cache }) }
    }
}

pub struct ConstraintsApiInner {
    /// Cache the submitted constraints are written to.
    pub cache: Arc<ConstraintCache>,
}

impl core::fmt::Debug for ConstraintsApiInner {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ConstraintsApiInner").finish_non_exhaustive()
    }
}

/// Errors thrown by the constraints API.
#[derive(Debug, thiserror::Error)]
pub(crate) enum ConstraintsApiError {
    #[error(transparent)]
    Parse(#[from] ParseError),
    #[error("constraint insertion task failed")]
    TaskFailed,
}

impl From<ConstraintsApiError> for ErrorObject<'static> {
    fn from(error: ConstraintsApiError) -> Self {
        match error {
            ConstraintsApiError::Parse(_) => ErrorObject::owned(INVALID_PARAMS_CODE, error.to_string(), None::<()>),
            ConstraintsApiError::TaskFailed => ErrorObject::owned(INTERNAL_ERROR_CODE, error.to_string(), None::<()>),
        }
    }
}

#[async_trait]
impl ConstraintsApiServer for ConstraintsApi {
    async fn submit_constraints_v1(&self, batch: BatchedSignedConstraints) -> RpcResult<usize> {
        info!(target: "rpc::constraints", messages = batch.len(), "Submitting constraints v1");
        let cache = self.cache.clone();

        let result = tokio::task::spawn_blocking(move || cache.add_signed_constraints(&batch))
            .await
            .map_err(|_| ConstraintsApiError::TaskFailed)?;

        Ok(result.map_err(ConstraintsApiError::from)?)
    }
}
