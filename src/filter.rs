// Copyright (c) 2022 Espresso Systems (espressosys.com)
// This file is part of the Docrest library.

// This program is free software: you can redistribute it and/or modify it under the terms of the GNU General Public License as published by the Free Software Foundation, either version 3 of the License, or (at your option) any later version.
// This program is distributed in the hope that it will be useful, but WITHOUT ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the GNU General Public License for more details.
// You should have received a copy of the GNU General Public License along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Query-parameter filtering for list endpoints.
//!
//! A [Filter] turns the raw string value of one query parameter into a [Predicate] on one model
//! field. A [FilterSet] names a group of filters and narrows a [Query] by every filter whose name
//! appears in the request.

use crate::error::ApiError;
use crate::store::{Lookup, Model, Operand, Predicate, Query, StoreError};
use crate::types::QueryParams;
use indexmap::IndexMap;
use itertools::Itertools;
use serde_json::{Number, Value};
use std::fmt::{self, Debug, Formatter};
use std::str::FromStr;
use std::sync::Arc;
use tracing::{event, Level};

impl FromStr for Lookup {
    type Err = ApiError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Lookup::ALL
            .iter()
            .copied()
            .find(|lookup| lookup.name() == s)
            .ok_or_else(|| {
                ApiError::improperly_configured(format!(
                    "`lookup_type` must be one of: {}. Found `{}` instead.",
                    Lookup::ALL.iter().map(|l| format!("`{}`", l)).join(", "),
                    s
                ))
            })
    }
}

pub type ConvertFn = Arc<dyn Fn(&str) -> Result<Value, ApiError> + Send + Sync>;

/// Converts raw query-parameter strings to typed comparison operands.
#[derive(Clone)]
pub enum Converter {
    /// Parses a floating-point number.
    Number,
    /// Anything except `false`, `0`, `no`, `f` and `n` (in any case) is true.
    Boolean,
    /// Uses the string as is.
    String,
    Custom { name: String, convert: ConvertFn },
}

const FALSE_VALUES: [&str; 5] = ["false", "0", "no", "f", "n"];

impl Converter {
    pub fn custom<F>(name: impl Into<String>, convert: F) -> Self
    where
        F: Fn(&str) -> Result<Value, ApiError> + Send + Sync + 'static,
    {
        Self::Custom {
            name: name.into(),
            convert: Arc::new(convert),
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Self::Number => "NumberFilter",
            Self::Boolean => "BooleanFilter",
            Self::String => "StringFilter",
            Self::Custom { name, .. } => name,
        }
    }

    pub fn convert(&self, raw: &str) -> Result<Value, ApiError> {
        match self {
            Self::Number => raw
                .trim()
                .parse::<f64>()
                .ok()
                .and_then(Number::from_f64)
                .map(Value::Number)
                .ok_or_else(|| {
                    ApiError::validation(format!(
                        "Value passed for {} is not a number. Found {:?} instead",
                        self.name(),
                        raw
                    ))
                }),
            Self::Boolean => Ok(Value::Bool(
                !FALSE_VALUES.contains(&raw.to_lowercase().as_str()),
            )),
            Self::String => Ok(Value::from(raw)),
            Self::Custom { convert, .. } => convert(raw),
        }
    }
}

impl Debug for Converter {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// The raw request value a filter is applied to.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FilterValue {
    Single(String),
    List(Vec<String>),
}

/// Compares one model field with a converted request value.
#[derive(Clone, Debug)]
pub struct Filter {
    field: String,
    lookup: Lookup,
    converter: Converter,
}

impl Filter {
    pub fn new(field: impl Into<String>, converter: Converter) -> Self {
        Self {
            field: field.into(),
            lookup: Lookup::Eq,
            converter,
        }
    }

    pub fn number(field: impl Into<String>) -> Self {
        Self::new(field, Converter::Number)
    }

    pub fn boolean(field: impl Into<String>) -> Self {
        Self::new(field, Converter::Boolean)
    }

    pub fn string(field: impl Into<String>) -> Self {
        Self::new(field, Converter::String)
    }

    pub fn lookup(mut self, lookup: Lookup) -> Self {
        self.lookup = lookup;
        self
    }

    pub fn field(&self) -> &str {
        &self.field
    }

    pub fn lookup_kind(&self) -> Lookup {
        self.lookup
    }

    /// Build the predicate comparing this filter's field of `model` with `value`.
    ///
    /// An `in` filter needs a list of values and every other lookup a single value; otherwise
    /// the filter is wired up wrong and this fails with ImproperlyConfigured. Values the
    /// converter rejects fail with ValidationError. A converter whose values the field cannot be
    /// compared with is also a wiring mistake, reported as ImproperlyConfigured.
    pub fn get_filter(&self, model: &Model, value: FilterValue) -> Result<Predicate, ApiError> {
        let operand = match (self.lookup, value) {
            (Lookup::In, FilterValue::List(items)) => Operand::List(
                items
                    .iter()
                    .map(|item| self.converter.convert(item))
                    .collect::<Result<_, _>>()?,
            ),
            (Lookup::In, FilterValue::Single(_)) => {
                return Err(ApiError::improperly_configured(
                    "IN comparison must be against a list. Found a single value instead",
                ));
            }
            (_, FilterValue::Single(raw)) => Operand::Scalar(self.converter.convert(&raw)?),
            (lookup, FilterValue::List(_)) => {
                return Err(ApiError::improperly_configured(format!(
                    "`{}` comparison must be against a single value. Found a list instead",
                    lookup
                )));
            }
        };
        let field = model.field(&self.field).ok_or_else(|| {
            ApiError::improperly_configured(format!(
                "{} has no field `{}` to filter on",
                model.kind(),
                self.field
            ))
        })?;
        field
            .compare(&self.field, self.lookup, operand)
            .map_err(|err| match err {
                StoreError::BadValue { .. } => ApiError::improperly_configured(format!(
                    "Mismatch in the filter type and the model's field type \
                     ({} used for {} field `{}`)",
                    self.converter.name(),
                    field.kind(),
                    self.field
                )),
                err => err.into(),
            })
    }
}

/// An ordered, named group of filters.
///
/// Filters only apply when their name is present in the request's query parameters.
#[derive(Clone, Debug, Default)]
pub struct FilterSet {
    filters: IndexMap<String, Filter>,
}

impl FilterSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn filter(mut self, name: impl Into<String>, filter: Filter) -> Self {
        self.filters.insert(name.into(), filter);
        self
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.filters.keys().map(String::as_str)
    }

    /// The predicates of every filter named in `params`.
    ///
    /// `in` filters take every value of their parameter, others take the last one.
    pub fn get_filters(
        &self,
        model: &Model,
        params: &QueryParams,
    ) -> Result<Vec<Predicate>, ApiError> {
        self.filters
            .iter()
            .filter(|(name, _)| params.contains(name))
            .map(|(name, filter)| {
                let value = if filter.lookup_kind() == Lookup::In {
                    FilterValue::List(params.get_all(name).into_iter().map(String::from).collect())
                } else {
                    FilterValue::Single(params.get(name).unwrap_or_default().to_string())
                };
                filter.get_filter(model, value)
            })
            .collect()
    }

    /// Narrow `query` by every filter named in `params`.
    pub fn get_filtered_query(
        &self,
        model: &Model,
        query: Query,
        params: &QueryParams,
    ) -> Result<Query, ApiError> {
        let predicates = self.get_filters(model, params)?;
        for predicate in &predicates {
            event!(Level::DEBUG, "filtering {} by {}", query.kind(), predicate);
        }
        Ok(query.filter(predicates))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::store::Field;
    use serde_json::json;

    fn model() -> Model {
        Model::new("Item")
            .with_field("number", Field::integer())
            .with_field("text", Field::string())
            .with_field("active", Field::boolean())
            .with_field("notes", Field::text())
    }

    fn params(pairs: &[(&str, &str)]) -> QueryParams {
        pairs.iter().copied().collect()
    }

    #[test]
    fn lookup_names() {
        assert_eq!("ge".parse::<Lookup>().unwrap(), Lookup::Ge);
        assert_eq!("in".parse::<Lookup>().unwrap(), Lookup::In);
        assert!(matches!(
            "like".parse::<Lookup>(),
            Err(ApiError::ImproperlyConfigured { .. })
        ));
    }

    #[test]
    fn converters() {
        assert_eq!(Converter::Number.convert(" 2.5 ").unwrap(), json!(2.5));
        assert!(matches!(
            Converter::Number.convert("two"),
            Err(ApiError::Validation { .. })
        ));
        for raw in &["false", "0", "NO", "F", "n"] {
            assert_eq!(Converter::Boolean.convert(raw).unwrap(), json!(false));
        }
        for raw in &["true", "yes", "1", "anything"] {
            assert_eq!(Converter::Boolean.convert(raw).unwrap(), json!(true));
        }
        assert_eq!(Converter::String.convert("x y").unwrap(), json!("x y"));

        let upper = Converter::custom("UpperFilter", |raw| Ok(json!(raw.to_uppercase())));
        assert_eq!(upper.convert("ab").unwrap(), json!("AB"));
        assert_eq!(upper.name(), "UpperFilter");
    }

    #[test]
    fn number_filter_predicate() {
        let predicate = Filter::number("number")
            .get_filter(&model(), FilterValue::Single("1".into()))
            .unwrap();
        assert_eq!(predicate.field(), "number");
        assert_eq!(predicate.lookup(), Lookup::Eq);
        assert_eq!(predicate.operand(), &Operand::Scalar(json!(1.0)));
    }

    #[test]
    fn in_filters_need_lists() {
        let filter = Filter::number("number").lookup(Lookup::In);
        assert!(matches!(
            filter.get_filter(&model(), FilterValue::Single("1".into())),
            Err(ApiError::ImproperlyConfigured { .. })
        ));

        let values = vec!["1".to_string(), "2".to_string(), "3".to_string()];
        let predicate = filter
            .get_filter(&model(), FilterValue::List(values.clone()))
            .unwrap();
        match predicate.operand() {
            Operand::List(items) => assert_eq!(items.len(), values.len()),
            other => panic!("expected a list operand, got {:?}", other),
        }

        let empty = filter.get_filter(&model(), FilterValue::List(vec![])).unwrap();
        assert_eq!(empty.operand(), &Operand::List(vec![]));
    }

    #[test]
    fn scalar_filters_reject_lists() {
        assert!(matches!(
            Filter::string("text").get_filter(&model(), FilterValue::List(vec!["a".into()])),
            Err(ApiError::ImproperlyConfigured { .. })
        ));
    }

    #[test]
    fn bad_input_is_the_callers_fault() {
        let err = Filter::number("number")
            .get_filter(&model(), FilterValue::Single("many".into()))
            .unwrap_err();
        assert!(matches!(err, ApiError::Validation { .. }));
    }

    #[test]
    fn mismatched_filters_are_the_developers_fault() {
        let err = Filter::number("text")
            .get_filter(&model(), FilterValue::Single("1".into()))
            .unwrap_err();
        assert_eq!(
            err,
            ApiError::improperly_configured(
                "Mismatch in the filter type and the model's field type \
                 (NumberFilter used for string field `text`)"
            )
        );
        assert!(matches!(
            Filter::string("notes").get_filter(&model(), FilterValue::Single("a".into())),
            Err(ApiError::ImproperlyConfigured { .. })
        ));
        assert!(matches!(
            Filter::string("missing").get_filter(&model(), FilterValue::Single("a".into())),
            Err(ApiError::ImproperlyConfigured { .. })
        ));
    }

    #[test]
    fn filter_sets_skip_absent_parameters() {
        let set = FilterSet::new()
            .filter("number", Filter::number("number"))
            .filter("min_number", Filter::number("number").lookup(Lookup::Ge))
            .filter("active", Filter::boolean("active"))
            .filter("text_in", Filter::string("text").lookup(Lookup::In));
        assert_eq!(
            set.names().collect::<Vec<_>>(),
            vec!["number", "min_number", "active", "text_in"]
        );

        let predicates = set
            .get_filters(
                &model(),
                &params(&[("text_in", "a"), ("number", "1"), ("text_in", "b"), ("page", "2")]),
            )
            .unwrap();
        assert_eq!(predicates.len(), 2);
        assert_eq!(predicates[0].field(), "number");
        assert_eq!(predicates[0].operand(), &Operand::Scalar(json!(1.0)));
        assert_eq!(predicates[1].lookup(), Lookup::In);
        assert_eq!(
            predicates[1].operand(),
            &Operand::List(vec![json!("a"), json!("b")])
        );

        let query = set
            .get_filtered_query(&model(), Query::new("Item"), &params(&[]))
            .unwrap();
        assert!(query.predicates().is_empty());
    }

    #[test]
    fn filtered_query_is_conjunctive() {
        let set = FilterSet::new()
            .filter("min_number", Filter::number("number").lookup(Lookup::Ge))
            .filter("max_number", Filter::number("number").lookup(Lookup::Lt));
        let query = set
            .get_filtered_query(
                &model(),
                Query::new("Item"),
                &params(&[("min_number", "2"), ("max_number", "5")]),
            )
            .unwrap();
        assert_eq!(query.predicates().len(), 2);

        let mut record = crate::store::Record::new(&model());
        record.set("number", 3);
        assert!(query.matches(&record));
        record.set("number", 5);
        assert!(!query.matches(&record));
    }

    #[test]
    fn last_value_wins_for_scalar_filters() {
        let set = FilterSet::new().filter("text", Filter::string("text"));
        let predicates = set
            .get_filters(&model(), &params(&[("text", "a"), ("text", "b")]))
            .unwrap();
        assert_eq!(predicates[0].operand(), &Operand::Scalar(json!("b")));
    }
}
