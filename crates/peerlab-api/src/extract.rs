//! Extractors that answer malformed input inside the response envelope.

use std::error::Error;

use axum::Json;
use axum::extract::{FromRequest, FromRequestParts, Query, Request};
use axum::http::request::Parts;
use peerlab_core::LabError;
use serde::de::DeserializeOwned;

use crate::response::ApiError;

/// JSON body; a rejection becomes `InvalidArgument`.
#[derive(Debug)]
pub struct ApiJson<T>(pub T);

/// Query string; a rejection becomes `InvalidArgument`.
#[derive(Debug)]
pub struct ApiQuery<T>(pub T);

/// The deserializer's message without axum's framing.
fn detail(rejection: &dyn Error) -> String {
    rejection
        .source()
        .map_or_else(|| rejection.to_string(), ToString::to_string)
}

impl<S, T> FromRequest<S> for ApiJson<T>
where
    T: DeserializeOwned,
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        match Json::<T>::from_request(req, state).await {
            Ok(Json(value)) => Ok(Self(value)),
            Err(rejection) => Err(ApiError(LabError::InvalidArgument(format!(
                "malformed request body: {}",
                detail(&rejection)
            )))),
        }
    }
}

impl<S, T> FromRequestParts<S> for ApiQuery<T>
where
    T: DeserializeOwned,
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        match Query::<T>::from_request_parts(parts, state).await {
            Ok(Query(value)) => Ok(Self(value)),
            Err(rejection) => Err(ApiError(LabError::InvalidArgument(format!(
                "malformed query string: {}",
                detail(&rejection)
            )))),
        }
    }
}
