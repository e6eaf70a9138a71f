// Copyright (c) 2022 Espresso Systems (espressosys.com)
// This file is part of the Docrest library.

// This program is free software: you can redistribute it and/or modify it under the terms of the GNU General Public License as published by the Free Software Foundation, either version 3 of the License, or (at your option) any later version.
// This program is distributed in the hope that it will be useful, but WITHOUT ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the GNU General Public License for more details.
// You should have received a copy of the GNU General Public License along with this program. If not, see <https://www.gnu.org/licenses/>.

use crate::store::StoreError;
use serde::{Deserialize, Serialize, Serializer};
use serde_json::Value;
use snafu::{ErrorCompat, IntoError, Snafu};
use tide::StatusCode;

/// The body of every error response: `{"detail": ...}`.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ErrorBody {
    pub detail: Value,
}

/// Errors which can be serialized in a response body.
///
/// When a request fails for any reason, the body of the response contains the [ErrorBody] of the
/// error that caused the failure. On the client, the body and the status code are enough to
/// rebuild the error with [Error::from_detail]; the `client` module provides a middleware handler
/// that does this automatically.
///
/// Other errors (those which don't downcast to the API's error type, such as errors generated
/// from the [tide] framework) are converted using their [Display](std::fmt::Display) instance
/// and the `catch_all` function.
pub trait Error: std::error::Error + Sized + Send + Sync + 'static {
    fn catch_all(msg: String) -> Self;
    fn status(&self) -> StatusCode;
    fn detail(&self) -> Value;

    /// Rebuild an error from the status code and detail of an error response.
    fn from_detail(status: StatusCode, detail: Value) -> Self;

    fn body(&self) -> ErrorBody {
        ErrorBody {
            detail: self.detail(),
        }
    }

    /// Convert from a generic client-side error to a specific error type.
    ///
    /// If `source` can be downcast to `Self`, it is simply downcasted. Otherwise, it is converted
    /// to a [String] using [Display](std::fmt::Display) and then converted to `Self` using
    /// [catch_all](Error::catch_all).
    ///
    /// `surf::Error` and `tide::Error` are the same type, so this also works for errors carried by
    /// server responses.
    fn from_client_error(source: surf::Error) -> Self {
        match source.downcast::<Self>() {
            Ok(err) => err,
            Err(err) => Self::catch_all(err.to_string()),
        }
    }
}

/// The errors raised by serializers, filters and viewsets.
///
/// Errors the caller is responsible for map to 4xx statuses. Errors in the way a model, filter or
/// viewset was wired up are the developer's fault and map to 500.
#[derive(Clone, Debug, Snafu, PartialEq)]
#[snafu(visibility(pub))]
pub enum ApiError {
    #[snafu(display("{}", detail_text(detail)))]
    ImproperlyConfigured { detail: Value },

    #[snafu(display("{}", detail_text(detail)))]
    Validation { detail: Value },

    #[snafu(display("{}", detail_text(detail)))]
    NonSerializable { detail: Value },

    #[snafu(display("{}", detail_text(detail)))]
    UnacceptableRequest { detail: Value },

    #[snafu(display("{}", detail_text(detail)))]
    MethodNotAllowed { detail: Value, allowed: Vec<String> },

    #[snafu(display("{}", detail_text(detail)))]
    Internal { detail: Value },
}

fn detail_text(detail: &Value) -> String {
    match detail {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

impl ApiError {
    pub fn improperly_configured(detail: impl Into<Value>) -> Self {
        Self::ImproperlyConfigured {
            detail: detail.into(),
        }
        .or_default_detail()
    }

    pub fn validation(detail: impl Into<Value>) -> Self {
        Self::Validation {
            detail: detail.into(),
        }
        .or_default_detail()
    }

    pub fn non_serializable(detail: impl Into<Value>) -> Self {
        Self::NonSerializable {
            detail: detail.into(),
        }
        .or_default_detail()
    }

    pub fn unacceptable(detail: impl Into<Value>) -> Self {
        Self::UnacceptableRequest {
            detail: detail.into(),
        }
        .or_default_detail()
    }

    pub fn method_not_allowed(method: &str, allowed: Vec<String>) -> Self {
        Self::MethodNotAllowed {
            detail: format!("Method {} not allowed", method).into(),
            allowed,
        }
    }

    pub fn internal(detail: impl Into<Value>) -> Self {
        Self::Internal {
            detail: detail.into(),
        }
        .or_default_detail()
    }

    /// The detail each variant carries when nothing more specific is known.
    ///
    /// The constructors fall back to it for an empty or `null` detail.
    pub fn default_detail(&self) -> &'static str {
        match self {
            Self::ImproperlyConfigured { .. } => "Improperly Configured",
            Self::Validation { .. } => "Invalid request",
            Self::NonSerializable { .. } => "Object is not serializable",
            Self::UnacceptableRequest { .. } => "The request made could not be accepted",
            Self::MethodNotAllowed { .. } => "Method not allowed",
            Self::Internal { .. } => "A server error occurred.",
        }
    }

    /// Replace an empty detail with the variant's default detail.
    pub fn or_default_detail(mut self) -> Self {
        let default = self.default_detail();
        match &mut self {
            Self::ImproperlyConfigured { detail }
            | Self::Validation { detail }
            | Self::NonSerializable { detail }
            | Self::UnacceptableRequest { detail }
            | Self::MethodNotAllowed { detail, .. }
            | Self::Internal { detail } => {
                let empty = match detail {
                    Value::Null => true,
                    Value::String(s) => s.is_empty(),
                    _ => false,
                };
                if empty {
                    *detail = default.into();
                }
            }
        }
        self
    }

    /// The verbs to advertise in an `Allow` header, if this is a 405.
    pub fn allowed(&self) -> Option<&[String]> {
        match self {
            Self::MethodNotAllowed { allowed, .. } => Some(allowed),
            _ => None,
        }
    }
}

impl Error for ApiError {
    fn catch_all(msg: String) -> Self {
        Self::internal(msg)
    }

    fn status(&self) -> StatusCode {
        match self {
            Self::ImproperlyConfigured { .. } | Self::Internal { .. } => {
                StatusCode::InternalServerError
            }
            Self::Validation { .. } | Self::NonSerializable { .. } => StatusCode::BadRequest,
            Self::UnacceptableRequest { .. } => StatusCode::NotAcceptable,
            Self::MethodNotAllowed { .. } => StatusCode::MethodNotAllowed,
        }
    }

    fn detail(&self) -> Value {
        match self {
            Self::ImproperlyConfigured { detail }
            | Self::Validation { detail }
            | Self::NonSerializable { detail }
            | Self::UnacceptableRequest { detail }
            | Self::MethodNotAllowed { detail, .. }
            | Self::Internal { detail } => detail.clone(),
        }
    }

    // 400 and 500 are shared by several variants, so the mapping picks the most common one.
    fn from_detail(status: StatusCode, detail: Value) -> Self {
        match status {
            StatusCode::BadRequest => Self::Validation { detail },
            StatusCode::NotAcceptable => Self::UnacceptableRequest { detail },
            StatusCode::MethodNotAllowed => Self::MethodNotAllowed {
                detail,
                allowed: Vec::new(),
            },
            _ => Self::Internal { detail },
        }
    }
}

impl Serialize for ApiError {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.body().serialize(serializer)
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound { id, .. } => {
                Self::validation(format!("Object with id {} not found", id))
            }
            StoreError::UnknownModel { kind } => Self::validation(format!(
                "Expected a registered model. Got {} instead",
                kind
            )),
            StoreError::BadValue { message } => Self::validation(message),
            err @ StoreError::IdentifierChanged { .. } => {
                Self::improperly_configured(err.to_string())
            }
        }
    }
}

/// Convert a concrete error type into a server error.
///
/// The error is first converted into an `E` using the [From] instance. That error is then
/// upcasted into an anyhow error to be embedded in the [tide::Error], using the status code
/// indicated by [Error::status].
///
/// Endpoints use it through a helper which fixes the type parameter:
/// ```ignore
/// fn api_error(error: impl Into<ApiError>) -> tide::Error {
///     server_error(error)
/// }
///
/// some_result.map_err(api_error)?;
/// ```
pub fn server_error<E: Error>(error: impl Into<E>) -> tide::Error {
    let error = error.into();
    tide::Error::new(error.status(), error)
}

/// Context for embedding network client errors into specific error types.
///
/// This type implements the [IntoError] trait from SNAFU, so it can be used with
/// [ResultExt::context](snafu::ResultExt::context) just like automatically generated SNAFU
/// contexts.
///
/// Calling `some_result.context(ClientError)` will convert a potential error from a [surf::Error]
/// to a specific error type `E` using the method `E::from_client_error`, provided by the
/// [Error] trait.
pub struct ClientError;

impl<E: Error + ErrorCompat + std::error::Error> IntoError<E> for ClientError {
    type Source = surf::Error;

    fn into_error(self, source: Self::Source) -> E {
        E::from_client_error(source)
    }
}
