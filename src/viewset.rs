// Copyright (c) 2022 Espresso Systems (espressosys.com)
// This file is part of the Docrest library.

// This program is free software: you can redistribute it and/or modify it under the terms of the GNU General Public License as published by the Free Software Foundation, either version 3 of the License, or (at your option) any later version.
// This program is distributed in the hope that it will be useful, but WITHOUT ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the GNU General Public License for more details.
// You should have received a copy of the GNU General Public License along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Request dispatch for one model.
//!
//! A [ModelViewSet] resolves each request to an [Operation], runs the operation's hooks around
//! it, and turns the outcome into a response. Structured [ApiError]s become `{"detail": ...}`
//! responses right here; any other error is left for the server's generic error handling.

use crate::error::{server_error, ApiError};
use crate::filter::FilterSet;
use crate::renderer::{default_renderers, negotiate, Renderer};
use crate::serializer::ModelSerializer;
use crate::server::error_response;
use crate::store::{Query, RecordId, Store};
use crate::types::QueryParams;
use indexmap::IndexMap;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::fmt::{self, Display, Formatter};
use std::sync::Arc;
use tide::http::{self, content::Accept, Method};
use tide::{Response, StatusCode};
use tracing::{event, Level};

fn api_error(error: impl Into<ApiError>) -> tide::Error {
    server_error(error)
}

/// What a viewset can do with a request.
///
/// The verb operations are what requests resolve to by default. `Get` lists the collection when
/// the route carries no arguments and retrieves one record otherwise. `List` and `Retrieve` are
/// reached only through a route's declared handler method.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Operation {
    Get,
    Post,
    Put,
    Patch,
    Delete,
    List,
    Retrieve,
}

impl Operation {
    pub const ALL: [Operation; 7] = [
        Operation::Get,
        Operation::Post,
        Operation::Put,
        Operation::Patch,
        Operation::Delete,
        Operation::List,
        Operation::Retrieve,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Self::Get => "get",
            Self::Post => "post",
            Self::Put => "put",
            Self::Patch => "patch",
            Self::Delete => "delete",
            Self::List => "list",
            Self::Retrieve => "retrieve",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|op| op.name() == name)
    }

    /// The HTTP verb which reaches this operation.
    pub fn verb(self) -> Method {
        match self {
            Self::Get | Self::List | Self::Retrieve => Method::Get,
            Self::Post => Method::Post,
            Self::Put => Method::Put,
            Self::Patch => Method::Patch,
            Self::Delete => Method::Delete,
        }
    }
}

impl Display for Operation {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// The routing layer's view of a request: an optional handler method and the path arguments.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RouteMatch {
    pub handler_method: Option<String>,
    pub args: Vec<String>,
    pub kwargs: IndexMap<String, String>,
}

impl RouteMatch {
    pub fn with_handler_method(mut self, method: impl Into<String>) -> Self {
        self.handler_method = Some(method.into());
        self
    }

    pub fn with_arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn with_kwarg(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.kwargs.insert(name.into(), value.into());
        self
    }

    /// The arguments passed on to hooks and operations.
    ///
    /// Positional arguments are only passed when there are no named ones.
    pub fn into_args(self) -> RouteArgs {
        if self.kwargs.is_empty() {
            RouteArgs {
                args: self.args,
                kwargs: self.kwargs,
            }
        } else {
            RouteArgs {
                args: Vec::new(),
                kwargs: self.kwargs,
            }
        }
    }
}

/// Path arguments of a resolved route.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RouteArgs {
    pub args: Vec<String>,
    pub kwargs: IndexMap<String, String>,
}

impl RouteArgs {
    pub fn is_empty(&self) -> bool {
        self.args.is_empty() && self.kwargs.is_empty()
    }

    /// The resource identifier: the first named argument, else the first positional one.
    pub fn identifier(&self) -> Option<&str> {
        self.kwargs
            .values()
            .next()
            .or_else(|| self.args.first())
            .map(String::as_str)
    }
}

/// A callback run before or after an operation, with the operation's route arguments.
pub type Hook = Arc<dyn Fn(&RouteArgs) -> Result<(), ApiError> + Send + Sync>;

/// The result of an operation: a status and the data to render, if any.
pub type Outcome = (StatusCode, Option<Value>);

/// CRUD endpoints for the model of a [ModelSerializer].
pub struct ModelViewSet {
    store: Arc<dyn Store>,
    serializer: Arc<ModelSerializer>,
    query: Query,
    filter_sets: Vec<FilterSet>,
    operations: Vec<Operation>,
    pre_hooks: HashMap<Operation, Hook>,
    post_hooks: HashMap<Operation, Hook>,
    renderers: Vec<Arc<dyn Renderer>>,
}

impl ModelViewSet {
    /// A viewset enabling every operation, over every record of the serializer's model.
    pub fn new(store: Arc<dyn Store>, serializer: ModelSerializer) -> Self {
        let query = Query::new(serializer.model().kind());
        Self {
            store,
            serializer: Arc::new(serializer),
            query,
            filter_sets: Vec::new(),
            operations: Operation::ALL.to_vec(),
            pre_hooks: HashMap::new(),
            post_hooks: HashMap::new(),
            renderers: default_renderers(),
        }
    }

    /// Replace the base query that `list` narrows with filters.
    pub fn query(mut self, query: Query) -> Self {
        self.query = query;
        self
    }

    /// Add a filter set. Filter sets apply in the order they are added.
    pub fn filter_set(mut self, filter_set: FilterSet) -> Self {
        self.filter_sets.push(filter_set);
        self
    }

    pub fn operations(mut self, operations: impl IntoIterator<Item = Operation>) -> Self {
        self.operations = operations.into_iter().collect();
        self
    }

    /// Only allow reading.
    pub fn read_only(self) -> Self {
        self.operations(vec![Operation::Get, Operation::List, Operation::Retrieve])
    }

    pub fn pre_hook<F>(mut self, operation: Operation, hook: F) -> Self
    where
        F: Fn(&RouteArgs) -> Result<(), ApiError> + Send + Sync + 'static,
    {
        self.pre_hooks.insert(operation, Arc::new(hook));
        self
    }

    pub fn post_hook<F>(mut self, operation: Operation, hook: F) -> Self
    where
        F: Fn(&RouteArgs) -> Result<(), ApiError> + Send + Sync + 'static,
    {
        self.post_hooks.insert(operation, Arc::new(hook));
        self
    }

    /// Set the renderers to negotiate between. The first one is the default.
    pub fn renderers(mut self, renderers: Vec<Arc<dyn Renderer>>) -> Self {
        self.renderers = renderers;
        self
    }

    pub fn serializer(&self) -> &ModelSerializer {
        &self.serializer
    }

    pub fn store(&self) -> &dyn Store {
        self.store.as_ref()
    }

    /// The upper-case verbs reaching some enabled operation, in a stable order.
    pub fn allowed_methods(&self) -> Vec<String> {
        let mut verbs = Vec::new();
        for op in &self.operations {
            let verb = op.verb().to_string();
            if !verbs.contains(&verb) {
                verbs.push(verb);
            }
        }
        verbs
    }

    /// Handle `req`, which the routing layer resolved to `route`.
    pub async fn dispatch(&self, req: http::Request, route: RouteMatch) -> tide::Result<Response> {
        let method = req.method();
        let name = match &route.handler_method {
            Some(name) => name.clone(),
            None if method == Method::Head => Operation::Get.name().to_string(),
            None => method.to_string().to_lowercase().replace('-', "_"),
        };
        let operation = match Operation::from_name(&name) {
            Some(op) if self.operations.contains(&op) => op,
            _ => {
                let error =
                    ApiError::method_not_allowed(&method.to_string(), self.allowed_methods());
                event!(Level::WARN, "responding with error: {}", error);
                return Ok(error_response(&error));
            }
        };
        event!(
            Level::DEBUG,
            "dispatching {} {} to {} {}",
            method,
            req.url(),
            self.serializer.model().kind(),
            operation
        );

        let mut res = match self.handle(operation, req, route.into_args()).await {
            Ok(res) => res,
            Err(err) => match err.downcast::<ApiError>() {
                Ok(error) => {
                    event!(Level::WARN, "responding with error: {}", error);
                    error_response(&error)
                }
                Err(err) => return Err(err),
            },
        };
        // HEAD gets the GET response without its body.
        if method == Method::Head {
            res.take_body();
        }
        Ok(res)
    }

    async fn handle(
        &self,
        operation: Operation,
        mut req: http::Request,
        args: RouteArgs,
    ) -> tide::Result<Response> {
        let mut accept = Accept::from_headers(&req)
            .map_err(|err| api_error(ApiError::unacceptable(err.to_string())))?;
        let renderer = negotiate(&self.renderers, &mut accept).map_err(api_error)?;
        let params = QueryParams::from_url(req.url());
        let body = req.body_bytes().await?;

        if let Some(hook) = self.pre_hooks.get(&operation) {
            hook(&args).map_err(api_error)?;
        }
        let (status, data) = self
            .perform(operation, &args, &params, &body)
            .map_err(api_error)?;
        if let Some(hook) = self.post_hooks.get(&operation) {
            hook(&args).map_err(api_error)?;
        }

        let body = renderer.render(data.as_ref()).map_err(api_error)?;
        Ok(Response::builder(status)
            .body(body)
            .content_type(renderer.media_type())
            .build())
    }

    fn perform(
        &self,
        operation: Operation,
        args: &RouteArgs,
        params: &QueryParams,
        body: &[u8],
    ) -> Result<Outcome, ApiError> {
        match operation {
            Operation::Get if args.is_empty() => self.list(params),
            Operation::Get | Operation::Retrieve => self.retrieve(args),
            Operation::List => self.list(params),
            Operation::Post => self.create(body),
            Operation::Put => self.update(args, body, false),
            Operation::Patch => self.update(args, body, true),
            Operation::Delete => self.destroy(args),
        }
    }

    /// Every record of the base query which passes all filter sets.
    pub fn list(&self, params: &QueryParams) -> Result<Outcome, ApiError> {
        let model = self.serializer.model();
        let mut query = self.query.clone();
        for filter_set in &self.filter_sets {
            query = filter_set.get_filtered_query(model, query, params)?;
        }
        let data = self.serializer.representation(self.store.as_ref(), &query)?;
        Ok((StatusCode::Ok, Some(data)))
    }

    pub fn retrieve(&self, args: &RouteArgs) -> Result<Outcome, ApiError> {
        let id = self.identifier(args)?;
        let record = self
            .serializer
            .get_or_create_target(self.store.as_ref(), Some(&id), None)?;
        Ok((StatusCode::Ok, Some(self.serializer.to_representation(&record))))
    }

    pub fn create(&self, body: &[u8]) -> Result<Outcome, ApiError> {
        let data = parse_body(body)?;
        let record = self.serializer.create(self.store.as_ref(), &data)?;
        Ok((StatusCode::Ok, Some(self.serializer.to_representation(&record))))
    }

    pub fn update(&self, args: &RouteArgs, body: &[u8], partial: bool) -> Result<Outcome, ApiError> {
        let id = self.identifier(args)?;
        let data = parse_body(body)?;
        let record = self
            .serializer
            .update(self.store.as_ref(), &data, &id, partial)?;
        Ok((StatusCode::Ok, Some(self.serializer.to_representation(&record))))
    }

    pub fn destroy(&self, args: &RouteArgs) -> Result<Outcome, ApiError> {
        let id = self.identifier(args)?;
        let kind = self.serializer.model().kind();
        if !self.store.delete(kind, &id)? {
            return Err(ApiError::validation(format!(
                "Object with id {} not found",
                id
            )));
        }
        event!(Level::INFO, "deleted {} {}", kind, id);
        Ok((StatusCode::NoContent, None))
    }

    fn identifier(&self, args: &RouteArgs) -> Result<RecordId, ApiError> {
        args.identifier().map(RecordId::parse).ok_or_else(|| {
            ApiError::improperly_configured(format!(
                "{} route has no resource identifier",
                self.serializer.model().kind()
            ))
        })
    }
}

/// Decode a request body, which must be a JSON object.
fn parse_body(body: &[u8]) -> Result<Map<String, Value>, ApiError> {
    match serde_json::from_slice(body) {
        Ok(Value::Object(data)) => Ok(data),
        Ok(other) => Err(ApiError::validation(format!(
            "Expected a JSON object, got {}",
            other
        ))),
        Err(err) => Err(ApiError::validation(format!("Malformed JSON body: {}", err))),
    }
}
