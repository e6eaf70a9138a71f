// Copyright (c) 2022 Espresso Systems (espressosys.com)
// This file is part of the Docrest library.

// This program is free software: you can redistribute it and/or modify it under the terms of the GNU General Public License as published by the Free Software Foundation, either version 3 of the License, or (at your option) any later version.
// This program is distributed in the hope that it will be useful, but WITHOUT ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the GNU General Public License for more details.
// You should have received a copy of the GNU General Public License along with this program. If not, see <https://www.gnu.org/licenses/>.

//! # A small REST framework for document models.
//!
//! A model is declared once, as an ordered schema of typed fields, and registered in a [Store].
//! From there a [ModelSerializer] validates client input against the schema and turns records
//! back into plain JSON, a [FilterSet] maps query parameters onto storage predicates, and a
//! [ModelViewSet] ties these together into list, retrieve, create, update and delete endpoints.
//!
//! Viewsets are mounted on a `tide::Server` with [server::route]. Responses are rendered as JSON,
//! or as XML for clients that ask for it. Every failure a client can see is answered with a JSON
//! body of the form `{"detail": ...}` and the status code of the [ApiError] behind it; the
//! `client` module contains `surf` middleware turning such responses back into errors.
//!
//! ```ignore
//! let store = Arc::new(MemoryStore::new());
//! let model = store.register(
//!     Model::new("Item")
//!         .with_field("number", Field::integer().default(42))
//!         .with_field("text", Field::string()),
//! );
//! let viewset = ModelViewSet::new(store, ModelSerializer::new(model))
//!     .filter_set(FilterSet::new().filter("number", Filter::number("number")));
//!
//! let mut app = tide::new();
//! app.with(server::trace).with(server::add_error_body::<_, ApiError>);
//! server::route(&mut app, "/items", Arc::new(viewset), RouteOptions::default());
//! ```

pub mod client;
pub mod error;
pub mod filter;
pub mod memory;
pub mod renderer;
pub mod serializer;
pub mod server;
pub mod store;
pub mod types;
pub mod viewset;

pub use error::*;
pub use filter::{Converter, Filter, FilterSet, FilterValue};
pub use memory::MemoryStore;
pub use renderer::{JsonRenderer, Renderer, XmlRenderer};
pub use serializer::{ModelSerializer, Serializable, ValidatedData};
pub use server::RouteOptions;
pub use store::*;
pub use types::*;
pub use viewset::{ModelViewSet, Operation, RouteArgs, RouteMatch};
