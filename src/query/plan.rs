use crate::error::FabricError;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

/// Maximum nesting depth for conditions to prevent stack overflow
const MAX_CONDITION_DEPTH: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Order {
    Asc,
    Desc,
}

impl Order {
    fn as_str(self) -> &'static str {
        match self {
            Order::Asc => "asc",
            Order::Desc => "desc",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Condition {
    Eq(String, Value),
    Ne(String, Value),
    Lt(String, Value),
    Lte(String, Value),
    Gt(String, Value),
    Gte(String, Value),
    In(String, Vec<Value>),
    NotIn(String, Vec<Value>),
    Between(String, Value, Value),
    Exists(String, bool),
    And(Box<Condition>, Box<Condition>),
    Or(Box<Condition>, Box<Condition>),
    Not(Box<Condition>),
}

impl Condition {
    pub fn and(self, rhs: Condition) -> Condition {
        Condition::And(Box::new(self), Box::new(rhs))
    }

    pub fn or(self, rhs: Condition) -> Condition {
        Condition::Or(Box::new(self), Box::new(rhs))
    }

    #[allow(clippy::should_implement_trait)]
    pub fn not(self) -> Condition {
        Condition::Not(Box::new(self))
    }

    pub fn depth(&self) -> usize {
        match self {
            Condition::Not(inner) => 1 + inner.depth(),
            Condition::And(left, right) | Condition::Or(left, right) => {
                1 + left.depth().max(right.depth())
            }
            _ => 1,
        }
    }

    pub fn validate_depth(&self) -> Result<(), FabricError> {
        let depth = self.depth();
        if depth > MAX_CONDITION_DEPTH {
            return Err(FabricError::Validation(format!(
                "condition depth {} exceeds maximum allowed depth of {}",
                depth, MAX_CONDITION_DEPTH
            )));
        }
        Ok(())
    }

    /// Compiles the condition into a Mango selector, renaming attributes
    /// through `column` (model field name -> stored column name).
    pub fn to_selector(&self, column: &dyn Fn(&str) -> String) -> Value {
        let op = |attr: &str, op: &str, value: Value| {
            let mut inner = Map::new();
            inner.insert(op.to_string(), value);
            let mut outer = Map::new();
            outer.insert(column(attr), Value::Object(inner));
            Value::Object(outer)
        };
        match self {
            Condition::Eq(a, v) => op(a, "$eq", v.clone()),
            Condition::Ne(a, v) => op(a, "$ne", v.clone()),
            Condition::Lt(a, v) => op(a, "$lt", v.clone()),
            Condition::Lte(a, v) => op(a, "$lte", v.clone()),
            Condition::Gt(a, v) => op(a, "$gt", v.clone()),
            Condition::Gte(a, v) => op(a, "$gte", v.clone()),
            Condition::In(a, vs) => op(a, "$in", Value::Array(vs.clone())),
            Condition::NotIn(a, vs) => op(a, "$nin", Value::Array(vs.clone())),
            Condition::Between(a, lo, hi) => {
                let mut inner = Map::new();
                inner.insert("$gte".into(), lo.clone());
                inner.insert("$lte".into(), hi.clone());
                let mut outer = Map::new();
                outer.insert(column(a), Value::Object(inner));
                Value::Object(outer)
            }
            Condition::Exists(a, present) => op(a, "$exists", Value::Bool(*present)),
            Condition::And(l, r) => {
                json!({ "$and": [l.to_selector(column), r.to_selector(column)] })
            }
            Condition::Or(l, r) => {
                json!({ "$or": [l.to_selector(column), r.to_selector(column)] })
            }
            Condition::Not(inner) => json!({ "$not": inner.to_selector(column) }),
        }
    }
}

/// Structured query over one model's table.
#[derive(Debug, Clone, PartialEq)]
pub struct Query {
    pub fields: Vec<String>,
    pub table: String,
    pub condition: Option<Condition>,
    pub order_by: Vec<(String, Order)>,
    pub limit: Option<usize>,
}

/// Wire form handed to `getQueryResult`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MangoQuery {
    pub selector: Value,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub fields: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sort: Vec<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bookmark: Option<String>,
}

impl MangoQuery {
    pub fn to_json(&self) -> Result<String, FabricError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn parse(raw: &str) -> Result<Self, FabricError> {
        Ok(serde_json::from_str(raw)?)
    }
}

impl Query {
    /// An empty field list selects whole records.
    pub fn select(fields: &[&str]) -> Self {
        Self {
            fields: fields.iter().map(|s| s.to_string()).collect(),
            table: String::new(),
            condition: None,
            order_by: Vec::new(),
            limit: None,
        }
    }

    pub fn from(mut self, table: &str) -> Self {
        self.table = table.to_string();
        self
    }

    pub fn where_(mut self, condition: Condition) -> Self {
        self.condition = Some(match self.condition.take() {
            Some(existing) => existing.and(condition),
            None => condition,
        });
        self
    }

    pub fn order_by(mut self, field: &str, order: Order) -> Self {
        self.order_by.push((field.to_string(), order));
        self
    }

    pub fn limit(mut self, n: usize) -> Self {
        self.limit = Some(n);
        self
    }

    pub fn compile(
        &self,
        table_field: &str,
        column: &dyn Fn(&str) -> String,
    ) -> Result<MangoQuery, FabricError> {
        if self.table.is_empty() {
            return Err(FabricError::Validation("query has no table".into()));
        }
        let table_selector = json!({ table_field: { "$eq": self.table } });
        let selector = match &self.condition {
            Some(condition) => {
                condition.validate_depth()?;
                json!({ "$and": [table_selector, condition.to_selector(column)] })
            }
            None => table_selector,
        };
        let sort = self
            .order_by
            .iter()
            .map(|(field, order)| json!({ column(field): order.as_str() }))
            .collect();
        Ok(MangoQuery {
            selector,
            fields: self.fields.iter().map(|f| column(f)).collect(),
            sort,
            limit: self.limit,
            bookmark: None,
        })
    }
}

pub struct AttributeRef(String);

pub fn attr(name: &str) -> AttributeRef {
    AttributeRef(name.to_string())
}

impl AttributeRef {
    pub fn eq(self, value: impl Into<Value>) -> Condition {
        Condition::Eq(self.0, value.into())
    }

    pub fn neq(self, value: impl Into<Value>) -> Condition {
        Condition::Ne(self.0, value.into())
    }

    pub fn gt(self, value: impl Into<Value>) -> Condition {
        Condition::Gt(self.0, value.into())
    }

    pub fn gte(self, value: impl Into<Value>) -> Condition {
        Condition::Gte(self.0, value.into())
    }

    pub fn lt(self, value: impl Into<Value>) -> Condition {
        Condition::Lt(self.0, value.into())
    }

    pub fn lte(self, value: impl Into<Value>) -> Condition {
        Condition::Lte(self.0, value.into())
    }

    pub fn between(self, low: impl Into<Value>, high: impl Into<Value>) -> Condition {
        Condition::Between(self.0, low.into(), high.into())
    }

    pub fn in_(self, values: Vec<Value>) -> Condition {
        Condition::In(self.0, values)
    }

    pub fn not_in(self, values: Vec<Value>) -> Condition {
        Condition::NotIn(self.0, values)
    }

    pub fn exists(self) -> Condition {
        Condition::Exists(self.0, true)
    }

    pub fn missing(self) -> Condition {
        Condition::Exists(self.0, false)
    }
}
