// Copyright (c) 2022 Espresso Systems (espressosys.com)
// This file is part of the Docrest library.

// This program is free software: you can redistribute it and/or modify it under the terms of the GNU General Public License as published by the Free Software Foundation, either version 3 of the License, or (at your option) any later version.
// This program is distributed in the hope that it will be useful, but WITHOUT ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the GNU General Public License for more details.
// You should have received a copy of the GNU General Public License along with this program. If not, see <https://www.gnu.org/licenses/>.

use crate::error::{ApiError, Error};
use crate::viewset::{ModelViewSet, RouteMatch};
use futures::future::BoxFuture;
use itertools::Itertools;
use mime::Mime;
use std::sync::Arc;
use tide::http::{content::Accept, mime, Method};
use tide::{Body, Next, Request, Response};
use tracing::{event, Level};

pub fn best_response_type(
    accept: &mut Option<Accept>,
    available: &[Mime],
) -> Result<Mime, ApiError> {
    let default = available
        .first()
        .cloned()
        .ok_or_else(|| ApiError::improperly_configured("No renderers configured"))?;
    match accept {
        Some(accept) => {
            // The Accept type has a `negotiate` method, but it doesn't properly handle
            // wildcards. It handles * but not */* and basetype/*, because for content type
            // proposals like */* and basetype/*, it looks for a literal match in `available`,
            // it does not perform pattern matching. So, we implement negotiation ourselves.
            //
            // First sort by the weight parameter, which the Accept type does do correctly.
            accept.sort();
            // Go through each proposed content type, in the order specified by the client, and
            // match them against our available types, respecting wildcards.
            for proposed in accept.iter() {
                if proposed.basetype() == "*" {
                    // The only acceptable Accept value with a basetype of * is */*, therefore
                    // this will match any available type.
                    return Ok(default);
                } else if proposed.subtype() == "*" {
                    // If the subtype is * but the basetype is not, look for a proposed type
                    // with a matching basetype and any subtype.
                    for mime in available {
                        if mime.basetype() == proposed.basetype() {
                            return Ok(mime.clone());
                        }
                    }
                } else if let Some(mime) = available
                    .iter()
                    .find(|mime| mime.essence() == proposed.essence())
                {
                    // If neither part of the proposal is a wildcard, look for a literal match.
                    return Ok(mime.clone());
                }
            }

            if accept.wildcard() {
                // If no proposals are available but a wildcard flag * was given, return any
                // available content type.
                Ok(default)
            } else {
                Err(ApiError::unacceptable("No suitable Content-Type found"))
            }
        }
        None => {
            // If no content type is explicitly requested, default to the first available type.
            Ok(default)
        }
    }
}

/// The response for a structured API error: its detail envelope as JSON, its status code, and an
/// `Allow` header for 405s.
pub fn error_response(error: &ApiError) -> Response {
    let body = serde_json::to_vec(&error.body()).unwrap_or_default();
    let mut res = Response::builder(error.status())
        .body(body)
        .content_type(mime::JSON)
        .build();
    if let Some(allowed) = error.allowed() {
        res.insert_header("Allow", allowed.iter().join(", "));
    }
    res
}

/// Server middleware which automatically populates the body of error responses.
///
/// If the response contains an error, the error is encoded into the [Error] type (either by
/// downcasting if the server has generated an instance of [Error], or by converting to a
/// [String] using [Display](std::fmt::Display) if the error can not be downcasted to [Error]).
/// The resulting `{"detail": ...}` body is always JSON.
///
/// If the response does not contain an error, it is passed through unchanged.
///
/// This middleware is the inverse of the client-side middleware `parse_error_body`, which
/// automatically converts error responses into [Err] variants, assuming the responses follow
/// the convention implemented by this middleware.
pub fn add_error_body<'a, T: Clone + Send + Sync + 'static, E: Error>(
    req: Request<T>,
    next: Next<'a, T>,
) -> BoxFuture<'a, tide::Result> {
    Box::pin(async {
        let mut res = next.run(req).await;
        if let Some(error) = res.take_error() {
            let error = E::from_client_error(error);
            event!(Level::WARN, "responding with error: {}", error);
            Ok(Response::builder(error.status())
                .body(Body::from_json(&error.body())?)
                .content_type(mime::JSON)
                .build())
        } else {
            Ok(res)
        }
    })
}

/// Server middleware which logs requests and responses.
pub fn trace<'a, T: Clone + Send + Sync + 'static>(
    req: tide::Request<T>,
    next: tide::Next<'a, T>,
) -> BoxFuture<'a, tide::Result> {
    Box::pin(async {
        event!(
            Level::INFO,
            "<-- received request {{method: {}, url: {}, content-type: {:?}, accept: {:?}}}",
            req.method(),
            req.url(),
            req.content_type(),
            Accept::from_headers(&req),
        );
        let res = next.run(req).await;
        event!(
            Level::INFO,
            "--> responding with {{status: {}, content-type: {:?}, error: {:?}}}",
            res.status(),
            res.content_type(),
            res.error(),
        );
        Ok(res)
    })
}

/// How [route] maps a viewset to URLs.
#[derive(Clone, Debug, PartialEq)]
pub struct RouteOptions {
    /// The name of the path variable identifying a resource.
    pub detail_field: String,
    /// The verbs the list URL answers.
    pub list_methods: Vec<Method>,
    /// The verbs the detail URL answers.
    pub detail_methods: Vec<Method>,
}

impl Default for RouteOptions {
    fn default() -> Self {
        Self {
            detail_field: "id".to_string(),
            list_methods: vec![Method::Get, Method::Post],
            detail_methods: vec![Method::Get, Method::Put, Method::Patch, Method::Delete],
        }
    }
}

/// Serve `viewset` under `base_url`.
///
/// Two routes are added: the list route at `base_url` and the detail route at
/// `base_url/:<detail_field>`. A request whose verb the route does not answer gets a 405
/// without reaching the viewset. HEAD is answered wherever GET is.
pub fn route<State: Clone + Send + Sync + 'static>(
    app: &mut tide::Server<State>,
    base_url: &str,
    viewset: Arc<ModelViewSet>,
    options: RouteOptions,
) {
    let base = base_url.trim_end_matches('/').to_string();
    event!(
        Level::DEBUG,
        "routing {} and {}/:{} to {} viewset",
        base,
        base,
        options.detail_field,
        viewset.serializer().model().kind()
    );

    let list_viewset = viewset.clone();
    let list_methods = Arc::new(options.list_methods);
    app.at(&base).all(move |req: Request<State>| {
        let viewset = list_viewset.clone();
        let allowed = list_methods.clone();
        async move { serve(&viewset, &allowed, req, RouteMatch::default()).await }
    });

    let detail_field = Arc::new(options.detail_field);
    let detail_methods = Arc::new(options.detail_methods);
    app.at(&format!("{}/:{}", base, detail_field))
        .all(move |req: Request<State>| {
            let viewset = viewset.clone();
            let allowed = detail_methods.clone();
            let detail_field = detail_field.clone();
            async move {
                let id = req.param(&detail_field)?.to_string();
                let route = RouteMatch::default().with_kwarg(detail_field.as_str(), id);
                serve(&viewset, &allowed, req, route).await
            }
        });
}

async fn serve<State: Clone + Send + Sync + 'static>(
    viewset: &ModelViewSet,
    allowed: &[Method],
    req: Request<State>,
    route: RouteMatch,
) -> tide::Result<Response> {
    let verb = match req.method() {
        Method::Head => Method::Get,
        method => method,
    };
    if !allowed.contains(&verb) {
        let error = ApiError::method_not_allowed(
            &req.method().to_string(),
            allowed.iter().map(Method::to_string).collect(),
        );
        event!(Level::WARN, "responding with error: {}", error);
        return Ok(error_response(&error));
    }
    viewset.dispatch(req.into(), route).await
}

#[cfg(test)]
mod test {
    use super::*;
    use serde_json::{json, Value};
    use tide::StatusCode;

    fn accept(header: &str) -> Option<Accept> {
        let mut req = tide::http::Request::new(
            Method::Get,
            tide::http::Url::parse("http://localhost/").unwrap(),
        );
        req.insert_header("Accept", header);
        Accept::from_headers(&req).unwrap()
    }

    #[test]
    fn negotiation() {
        let available = [mime::JSON, mime::XML];
        assert_eq!(
            best_response_type(&mut None, &available).unwrap().essence(),
            "application/json"
        );
        assert_eq!(
            best_response_type(&mut accept("application/xml"), &available)
                .unwrap()
                .essence(),
            "application/xml"
        );
        assert_eq!(
            best_response_type(&mut accept("*/*"), &available)
                .unwrap()
                .essence(),
            "application/json"
        );
        assert_eq!(
            best_response_type(&mut accept("text/html"), &available).unwrap_err(),
            ApiError::unacceptable("No suitable Content-Type found")
        );
    }

    #[async_std::test]
    async fn error_responses() {
        let mut res = error_response(&ApiError::method_not_allowed(
            "PATCH",
            vec!["GET".into(), "POST".into()],
        ));
        assert_eq!(res.status(), StatusCode::MethodNotAllowed);
        assert_eq!(res.header("Allow").unwrap().as_str(), "GET, POST");
        assert_eq!(res.content_type().unwrap().essence(), "application/json");
        let body: Value = serde_json::from_str(&res.take_body().into_string().await.unwrap())
            .unwrap();
        assert_eq!(body, json!({"detail": "Method PATCH not allowed"}));

        let res = error_response(&ApiError::validation("bad"));
        assert_eq!(res.status(), StatusCode::BadRequest);
        assert!(res.header("Allow").is_none());
    }

    #[async_std::test]
    async fn unhandled_errors_get_a_detail_body() {
        let mut app = tide::new();
        app.with(add_error_body::<(), ApiError>);
        app.at("/boom").get(|_req: Request<()>| async {
            Err::<Response, _>(tide::Error::from_str(
                StatusCode::InternalServerError,
                "exploded",
            ))
        });
        let req = tide::http::Request::new(
            Method::Get,
            tide::http::Url::parse("http://localhost/boom").unwrap(),
        );
        let mut res: tide::http::Response = app.respond(req).await.unwrap();
        assert_eq!(res.status(), StatusCode::InternalServerError);
        let body: Value = res.body_json().await.unwrap();
        assert_eq!(body, json!({"detail": "exploded"}));
    }
}
