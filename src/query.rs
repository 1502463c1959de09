//! Queries the client can subscribe to.
//!
//! The client treats a query as opaque beyond three needs: value equality
//! (to match `unsubscribe` calls against registered subscriptions), a class
//! name, and a serializable where-clause. [`LiveQuery`] captures exactly that.
//! [`Query`] is a plain value implementation for callers that have no richer
//! query model of their own.

use std::fmt;
use std::marker::PhantomData;

use serde_json::Value;

use crate::object::{LiveObject, ObjectState};
use crate::protocol::{JsonObject, QueryPayload};

/// A query that can back a live subscription.
///
/// `Object` is the type events for this query are delivered as.
pub trait LiveQuery: PartialEq + fmt::Debug + Send + Sync + 'static {
    /// Type each matching object is converted into.
    type Object: LiveObject;

    /// Class the query targets.
    fn class_name(&self) -> String;

    /// Where-clause in wire form.
    fn where_clause(&self) -> JsonObject;

    /// Field selection, if any.
    fn selected_fields(&self) -> Option<Vec<String>> {
        None
    }

    /// The `query` member of a `subscribe` operation.
    fn to_payload(&self) -> QueryPayload {
        QueryPayload {
            class_name: self.class_name(),
            r#where: self.where_clause(),
            fields: self.selected_fields(),
        }
    }
}

/// Value-type query: class name, where-clause, optional field selection.
///
/// ```
/// use livequery::Query;
///
/// let query: Query = Query::new("Game")
///     .equal_to("status", "live")
///     .constraint("score", "$gt", 10)
///     .select(["score", "players"]);
/// assert_eq!(query.class_name(), "Game");
/// ```
pub struct Query<T = ObjectState> {
    class_name: String,
    where_clause: JsonObject,
    fields: Option<Vec<String>>,
    _object: PhantomData<fn() -> T>,
}

impl<T> Query<T> {
    /// Query matching every object of `class_name`.
    pub fn new(class_name: impl Into<String>) -> Self {
        Self {
            class_name: class_name.into(),
            where_clause: JsonObject::new(),
            fields: None,
            _object: PhantomData,
        }
    }

    /// Require `key` to equal `value`.
    #[must_use]
    pub fn equal_to(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.where_clause.insert(key.into(), value.into());
        self
    }

    /// Add an operator constraint such as `$gt`, `$in`, `$exists` on `key`.
    ///
    /// Several operators on the same key are merged into one object.
    #[must_use]
    pub fn constraint(
        mut self,
        key: impl Into<String>,
        operator: impl Into<String>,
        value: impl Into<Value>,
    ) -> Self {
        let entry = self
            .where_clause
            .entry(key.into())
            .or_insert_with(|| Value::Object(JsonObject::new()));
        if !entry.is_object() {
            *entry = Value::Object(JsonObject::new());
        }
        if let Value::Object(operators) = entry {
            operators.insert(operator.into(), value.into());
        }
        self
    }

    /// Only deliver the listed fields.
    #[must_use]
    pub fn select<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.fields = Some(fields.into_iter().map(Into::into).collect());
        self
    }

    /// Replace the where-clause wholesale.
    #[must_use]
    pub fn with_where(mut self, where_clause: JsonObject) -> Self {
        self.where_clause = where_clause;
        self
    }

    /// Class the query targets.
    #[must_use]
    pub fn class_name(&self) -> &str {
        &self.class_name
    }

    /// Current where-clause.
    #[must_use]
    pub fn where_json(&self) -> &JsonObject {
        &self.where_clause
    }

    /// Current field selection.
    #[must_use]
    pub fn fields(&self) -> Option<&[String]> {
        self.fields.as_deref()
    }
}

impl<T> Clone for Query<T> {
    fn clone(&self) -> Self {
        Self {
            class_name: self.class_name.clone(),
            where_clause: self.where_clause.clone(),
            fields: self.fields.clone(),
            _object: PhantomData,
        }
    }
}

impl<T> PartialEq for Query<T> {
    fn eq(&self, other: &Self) -> bool {
        self.class_name == other.class_name
            && self.where_clause == other.where_clause
            && self.fields == other.fields
    }
}

impl<T> fmt::Debug for Query<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Query")
            .field("class_name", &self.class_name)
            .field("where", &self.where_clause)
            .field("fields", &self.fields)
            .finish()
    }
}

impl<T: LiveObject> LiveQuery for Query<T> {
    type Object = T;

    fn class_name(&self) -> String {
        self.class_name.clone()
    }

    fn where_clause(&self) -> JsonObject {
        self.where_clause.clone()
    }

    fn selected_fields(&self) -> Option<Vec<String>> {
        self.fields.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_equality_is_by_value() {
        let a: Query = Query::new("Game").equal_to("status", "live");
        let b: Query = Query::new("Game").equal_to("status", "live");
        let c: Query = Query::new("Game").equal_to("status", "over");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_ne!(a, Query::new("Player").equal_to("status", "live"));
    }

    #[test]
    fn test_constraints_merge_per_key() {
        let query: Query = Query::new("Game")
            .constraint("score", "$gt", 10)
            .constraint("score", "$lt", 20);
        assert_eq!(
            Value::Object(query.where_json().clone()),
            json!({"score": {"$gt": 10, "$lt": 20}})
        );
    }

    #[test]
    fn test_constraint_replaces_equality() {
        let query: Query = Query::new("Game")
            .equal_to("score", 5)
            .constraint("score", "$gte", 1);
        assert_eq!(
            Value::Object(query.where_json().clone()),
            json!({"score": {"$gte": 1}})
        );
    }

    #[test]
    fn test_payload_for_empty_query() {
        let query: Query = Query::new("Game");
        let payload = query.to_payload();
        assert_eq!(payload.class_name, "Game");
        assert!(payload.r#where.is_empty());
        assert_eq!(payload.fields, None);
    }

    #[test]
    fn test_payload_with_selection() {
        let query: Query = Query::new("Game").select(["score"]);
        assert_eq!(query.to_payload().fields, Some(vec!["score".to_string()]));
        assert_eq!(query.fields(), Some(&["score".to_string()][..]));
    }
}
