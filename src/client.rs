// Copyright (c) 2022 Espresso Systems (espressosys.com)
// This file is part of the Docrest library.

// This program is free software: you can redistribute it and/or modify it under the terms of the GNU General Public License as published by the Free Software Foundation, either version 3 of the License, or (at your option) any later version.
// This program is distributed in the hope that it will be useful, but WITHOUT ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the GNU General Public License for more details.
// You should have received a copy of the GNU General Public License along with this program. If not, see <https://www.gnu.org/licenses/>.

use crate::error::{Error, ErrorBody};
use futures::future::BoxFuture;
use futures::prelude::*;
use serde::Deserialize;
use surf::{middleware::Next, Client, Request, Response, StatusCode};

/// Deserialize the body of a response.
///
/// The Content-Type header is used to determine the serialization format. Only JSON bodies can be
/// decoded; XML responses are meant for clients other than this one.
pub async fn response_body<T: for<'de> Deserialize<'de>>(
    res: &mut Response,
) -> Result<T, surf::Error> {
    match res.content_type() {
        Some(content_type) if content_type.essence() == "application/json" => {
            res.body_json().await
        }
        Some(content_type) => Err(surf::Error::from_str(
            StatusCode::UnsupportedMediaType,
            format!("unsupported content type {}", content_type),
        )),
        None => Err(surf::Error::from_str(
            StatusCode::UnsupportedMediaType,
            "unspecified content type in response",
        )),
    }
}

/// Pass successful responses through, and decode the `{"detail": ...}` body of any other response
/// into an `E`.
///
/// A failed response whose body is not a detail envelope still becomes an error, built with
/// [Error::catch_all].
pub async fn response_to_result<E: Error>(mut res: Response) -> surf::Result<Response> {
    if res.status().is_success() {
        return Ok(res);
    }
    let status = res.status();
    let err = match response_body::<ErrorBody>(&mut res).await {
        Ok(body) => E::from_detail(status, body.detail),
        Err(source) => E::catch_all(format!("{} response without a detail: {}", status, source)),
    };
    Err(surf::Error::new(err.status(), err))
}

/// Client middleware which turns responses with non-success statuses into errors.
///
/// If the status code of the response is a success (2xx), the response is passed through
/// unchanged. Otherwise, the body of the response is decoded into an [Error] which is lifted into
/// a [surf::Error]. This can then be converted back into the error type using
/// [Error::from_client_error].
///
/// If the request fails without producing a response at all, the [surf::Error] from the failed
/// request is passed through.
///
/// This middleware is the inverse of the server-side middleware `add_error_body`, and of the
/// error responses written by viewsets.
pub fn parse_error_body<E: Error>(
    req: Request,
    client: Client,
    next: Next<'_>,
) -> BoxFuture<surf::Result<Response>> {
    Box::pin(
        next.run(req, client)
            .and_then(|res| async { response_to_result::<E>(res).await }),
    )
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::error::ApiError;
    use serde_json::json;
    use surf::http;

    fn response(status: StatusCode, body: Option<serde_json::Value>) -> Response {
        let mut res = http::Response::new(status);
        if let Some(body) = body {
            res.set_body(http::Body::from_json(&body).unwrap());
        }
        res.into()
    }

    #[async_std::test]
    async fn success_passes_through() {
        let res = response(StatusCode::NoContent, None);
        let res = response_to_result::<ApiError>(res).await.unwrap();
        assert_eq!(res.status(), StatusCode::NoContent);

        let mut res = response(StatusCode::Ok, Some(json!({"id": 1})));
        let body: serde_json::Value = response_body(&mut res).await.unwrap();
        assert_eq!(body, json!({"id": 1}));
    }

    #[async_std::test]
    async fn detail_bodies_become_errors() {
        let res = response(
            StatusCode::BadRequest,
            Some(json!({"detail": "Property name is required"})),
        );
        let err = response_to_result::<ApiError>(res).await.unwrap_err();
        assert_eq!(err.status(), StatusCode::BadRequest);
        assert_eq!(
            ApiError::from_client_error(err),
            ApiError::validation("Property name is required")
        );

        let res = response(
            StatusCode::InternalServerError,
            Some(json!({"detail": {"filter": ["misconfigured"]}})),
        );
        let err = ApiError::from_client_error(response_to_result::<ApiError>(res).await.unwrap_err());
        assert_eq!(err.detail(), json!({"filter": ["misconfigured"]}));
    }

    #[async_std::test]
    async fn other_failures_are_caught_all() {
        let res = response(StatusCode::BadGateway, None);
        let err = ApiError::from_client_error(response_to_result::<ApiError>(res).await.unwrap_err());
        assert!(matches!(err, ApiError::Internal { .. }));
    }
}
