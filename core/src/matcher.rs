use std::{error::Error, fmt};

use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};

/// A payload predicate attached to a destination.
///
/// Filters are a tagged-union AST parsed from the JSON form stored with
/// the destination, e.g.
/// `{"$or": [{"amount": {"$gte": 100}}, {"region": {"$in": ["eu", "us"]}}]}`.
/// Evaluation is a recursive walk over the AST, never reflection over
/// arbitrary structures.
#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    /// Every sub-filter must match.
    And(Vec<Filter>),
    /// At least one sub-filter must match.
    Or(Vec<Filter>),
    /// The sub-filter must not match.
    Not(Box<Filter>),
    /// A conjunction of per-field predicates.
    Fields(Vec<FieldPredicate>),
}

/// Predicates applied to one dotted field path, all must hold.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldPredicate {
    pub path: String,
    pub predicates: Vec<Predicate>,
}

/// A single comparison or membership operator.
#[derive(Debug, Clone, PartialEq)]
pub enum Predicate {
    Eq(Value),
    Ne(Value),
    Gt(Value),
    Gte(Value),
    Lt(Value),
    Lte(Value),
    In(Vec<Value>),
    Nin(Vec<Value>),
}

/// Provides a custom error type to be used for failures
/// in parsing a filter from its JSON form.
#[derive(Debug)]
pub enum FilterParseError {
    InvalidOperator(String),
    InvalidOperand(String),
    InvalidStructure(String),
}

impl fmt::Display for FilterParseError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            FilterParseError::InvalidOperator(operator) => {
                write!(f, "filter parse error: unknown operator {operator}")
            }
            FilterParseError::InvalidOperand(reason) => {
                write!(f, "filter parse error: invalid operand: {reason}")
            }
            FilterParseError::InvalidStructure(reason) => {
                write!(f, "filter parse error: {reason}")
            }
        }
    }
}

impl Error for FilterParseError {}

impl Filter {
    /// Parses a filter from its JSON form.
    pub fn parse(value: &Value) -> Result<Filter, FilterParseError> {
        let object = value.as_object().ok_or_else(|| {
            FilterParseError::InvalidStructure("a filter must be a JSON object".to_string())
        })?;

        let mut parts = Vec::new();
        let mut field_predicates = Vec::new();
        for (key, entry) in object {
            match key.as_str() {
                "$and" => parts.push(Filter::And(parse_filter_list(entry)?)),
                "$or" => parts.push(Filter::Or(parse_filter_list(entry)?)),
                "$not" => parts.push(Filter::Not(Box::new(Filter::parse(entry)?))),
                key if key.starts_with('$') => {
                    return Err(FilterParseError::InvalidOperator(key.to_string()))
                }
                path => field_predicates.push(FieldPredicate {
                    path: path.to_string(),
                    predicates: parse_predicates(entry)?,
                }),
            }
        }

        if !field_predicates.is_empty() {
            parts.push(Filter::Fields(field_predicates));
        }

        match parts.len() {
            0 => Err(FilterParseError::InvalidStructure(
                "a filter must contain at least one operator or field".to_string(),
            )),
            1 => Ok(parts.remove(0)),
            _ => Ok(Filter::And(parts)),
        }
    }

    /// Evaluates the filter against an event data payload.
    pub fn matches(&self, data: &Value) -> bool {
        match self {
            Filter::And(filters) => filters.iter().all(|filter| filter.matches(data)),
            Filter::Or(filters) => filters.iter().any(|filter| filter.matches(data)),
            Filter::Not(filter) => !filter.matches(data),
            Filter::Fields(field_predicates) => field_predicates.iter().all(|field_predicate| {
                let value = lookup_path(data, &field_predicate.path);
                field_predicate
                    .predicates
                    .iter()
                    .all(|predicate| predicate.matches(value))
            }),
        }
    }

    fn to_json(&self) -> Value {
        match self {
            Filter::And(filters) => {
                Value::Object(single_entry("$and", filters.iter().map(Filter::to_json).collect()))
            }
            Filter::Or(filters) => {
                Value::Object(single_entry("$or", filters.iter().map(Filter::to_json).collect()))
            }
            Filter::Not(filter) => {
                let mut object = Map::new();
                object.insert("$not".to_string(), filter.to_json());
                Value::Object(object)
            }
            Filter::Fields(field_predicates) => {
                let mut object = Map::new();
                for field_predicate in field_predicates {
                    object.insert(
                        field_predicate.path.clone(),
                        predicates_to_json(&field_predicate.predicates),
                    );
                }
                Value::Object(object)
            }
        }
    }
}

impl Predicate {
    fn matches(&self, value: Option<&Value>) -> bool {
        match self {
            Predicate::Eq(expected) => value == Some(expected),
            Predicate::Ne(expected) => value != Some(expected),
            Predicate::Gt(bound) => compare(value, bound).is_some_and(|ordering| ordering.is_gt()),
            Predicate::Gte(bound) => compare(value, bound).is_some_and(|ordering| ordering.is_ge()),
            Predicate::Lt(bound) => compare(value, bound).is_some_and(|ordering| ordering.is_lt()),
            Predicate::Lte(bound) => compare(value, bound).is_some_and(|ordering| ordering.is_le()),
            Predicate::In(members) => {
                value.is_some_and(|value| members.iter().any(|member| member == value))
            }
            Predicate::Nin(members) => {
                !value.is_some_and(|value| members.iter().any(|member| member == value))
            }
        }
    }

    fn operator(&self) -> &'static str {
        match self {
            Predicate::Eq(_) => "$eq",
            Predicate::Ne(_) => "$ne",
            Predicate::Gt(_) => "$gt",
            Predicate::Gte(_) => "$gte",
            Predicate::Lt(_) => "$lt",
            Predicate::Lte(_) => "$lte",
            Predicate::In(_) => "$in",
            Predicate::Nin(_) => "$nin",
        }
    }

    fn operand(&self) -> Value {
        match self {
            Predicate::Eq(value)
            | Predicate::Ne(value)
            | Predicate::Gt(value)
            | Predicate::Gte(value)
            | Predicate::Lt(value)
            | Predicate::Lte(value) => value.clone(),
            Predicate::In(members) | Predicate::Nin(members) => Value::Array(members.clone()),
        }
    }
}

fn parse_filter_list(value: &Value) -> Result<Vec<Filter>, FilterParseError> {
    let entries = value.as_array().ok_or_else(|| {
        FilterParseError::InvalidOperand("$and and $or take an array of filters".to_string())
    })?;
    entries.iter().map(Filter::parse).collect()
}

fn parse_predicates(value: &Value) -> Result<Vec<Predicate>, FilterParseError> {
    let Some(object) = value.as_object() else {
        // A bare value is shorthand for equality.
        return Ok(vec![Predicate::Eq(value.clone())]);
    };
    if !object.keys().all(|key| key.starts_with('$')) {
        // An object operand without operators is matched structurally.
        return Ok(vec![Predicate::Eq(value.clone())]);
    }

    object
        .iter()
        .map(|(operator, operand)| match operator.as_str() {
            "$eq" => Ok(Predicate::Eq(operand.clone())),
            "$ne" => Ok(Predicate::Ne(operand.clone())),
            "$gt" => Ok(Predicate::Gt(operand.clone())),
            "$gte" => Ok(Predicate::Gte(operand.clone())),
            "$lt" => Ok(Predicate::Lt(operand.clone())),
            "$lte" => Ok(Predicate::Lte(operand.clone())),
            "$in" => Ok(Predicate::In(membership_operand(operand)?)),
            "$nin" => Ok(Predicate::Nin(membership_operand(operand)?)),
            operator => Err(FilterParseError::InvalidOperator(operator.to_string())),
        })
        .collect()
}

fn membership_operand(operand: &Value) -> Result<Vec<Value>, FilterParseError> {
    operand.as_array().cloned().ok_or_else(|| {
        FilterParseError::InvalidOperand("$in and $nin take an array of values".to_string())
    })
}

fn single_entry(key: &str, entries: Vec<Value>) -> Map<String, Value> {
    let mut object = Map::new();
    object.insert(key.to_string(), Value::Array(entries));
    object
}

fn predicates_to_json(predicates: &[Predicate]) -> Value {
    if let [Predicate::Eq(value)] = predicates {
        return value.clone();
    }
    let mut object = Map::new();
    for predicate in predicates {
        object.insert(predicate.operator().to_string(), predicate.operand());
    }
    Value::Object(object)
}

/// Resolves a dotted path such as `order.total` against a JSON tree.
fn lookup_path<'a>(data: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = data;
    for segment in path.split('.') {
        current = current.as_object()?.get(segment)?;
    }
    Some(current)
}

/// Orders two JSON scalars when they are comparable,
/// numbers against numbers and strings against strings.
fn compare(value: Option<&Value>, bound: &Value) -> Option<std::cmp::Ordering> {
    match (value?, bound) {
        (Value::Number(left), Value::Number(right)) => {
            left.as_f64()?.partial_cmp(&right.as_f64()?)
        }
        (Value::String(left), Value::String(right)) => Some(left.as_str().cmp(right.as_str())),
        _ => None,
    }
}

impl Serialize for Filter {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_json().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Filter {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        Filter::parse(&value).map_err(de::Error::custom)
    }
}
