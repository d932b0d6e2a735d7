//! Declarative extraction queries.
//!
//! A query is a JSON document listing output tables. Each table names the
//! resource type it reads from, its columns (heading + expression), and
//! optionally a key column, a flat-map `rows` path and a row `filter`:
//!
//! ```json
//! {
//!   "tables": [
//!     {"name": "Forms", "source": "form", "key": "id",
//!      "columns": [{"heading": "id", "expr": "id"},
//!                  {"heading": "name", "expr": "form.name"}]},
//!     {"name": "Cases", "source": "form", "rows": "form.case",
//!      "columns": [{"heading": "case_id", "expr": "@case_id"}]}
//!   ],
//!   "order_by": {"form": ["server_modified_on", "received_on"]}
//! }
//! ```
//!
//! Expressions are a path string, `{"path": ...}`, `{"lit": value}`, or
//! `{"apply": "<builtin>", "args": [...]}`. Compiling groups tables by
//! resource into [`ResourcePlan`]s in first-appearance order.

pub mod functions;
pub mod path;

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{ExtractError, QueryError};
use crate::models::{Record, Row, Table};
use crate::replay::Replayable;
use crate::value::{normalize, Extracted};

use functions::{truthy, Function};
use path::Path;

/// Parsed (uncompiled) query document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryDefinition {
    pub tables: Vec<TableDefinition>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub order_by: BTreeMap<String, Vec<String>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableDefinition {
    pub name: String,
    pub source: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rows: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter: Option<ExprDefinition>,
    pub columns: Vec<ColumnDefinition>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnDefinition {
    pub heading: String,
    pub expr: ExprDefinition,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ExprDefinition {
    Path(String),
    Ref {
        path: String,
    },
    Literal {
        lit: Value,
    },
    Apply {
        apply: String,
        #[serde(default)]
        args: Vec<ExprDefinition>,
    },
}

impl QueryDefinition {
    pub fn from_slice(bytes: &[u8]) -> Result<Self, QueryError> {
        Ok(serde_json::from_slice(bytes)?)
    }

    pub fn to_pretty_json(&self) -> Result<String, QueryError> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

/// Ordering fields CommCare HQ sorts its resources by.
pub fn default_order_by(resource: &str) -> Option<Vec<String>> {
    let fields: &[&str] = match resource {
        "form" => &["server_modified_on", "received_on"],
        "case" => &["server_date_modified"],
        _ => return None,
    };
    Some(fields.iter().map(|f| f.to_string()).collect())
}

#[derive(Debug, Clone)]
enum Expr {
    Path(Arc<Path>),
    Literal(Value),
    Apply { function: Function, args: Vec<Expr> },
}

/// Evaluation scope: the whole record plus the current row context.
struct Scope {
    record: Arc<Record>,
    current: Arc<Value>,
}

impl Expr {
    fn compile(def: &ExprDefinition) -> Result<Self, QueryError> {
        Ok(match def {
            ExprDefinition::Path(path) | ExprDefinition::Ref { path } => {
                Expr::Path(Arc::new(Path::parse(path)?))
            }
            ExprDefinition::Literal { lit } => Expr::Literal(lit.clone()),
            ExprDefinition::Apply { apply, args } => {
                let function = functions::lookup(apply)?
                    .ok_or_else(|| QueryError::UnknownFunction(apply.clone()))?;
                if args.len() != function.signature.arity() {
                    return Err(QueryError::Arity {
                        function: apply.clone(),
                        expected: function.signature.arity(),
                        got: args.len(),
                    });
                }
                let args = args.iter().map(Expr::compile).collect::<Result<_, _>>()?;
                Expr::Apply { function, args }
            }
        })
    }

    fn eval(&self, scope: &Scope) -> Result<Extracted, ExtractError> {
        match self {
            Expr::Path(path) => {
                let path = Arc::clone(path);
                let target = if path.is_anchored() {
                    Arc::clone(&scope.record)
                } else {
                    Arc::clone(&scope.current)
                };
                Ok(Extracted::Sequence(Replayable::new(move || {
                    path.find(&target).into_iter().map(Extracted::Located)
                })))
            }
            Expr::Literal(value) => Ok(Extracted::Value(value.clone())),
            Expr::Apply { function, args } => {
                let args = args
                    .iter()
                    .map(|arg| arg.eval(scope))
                    .collect::<Result<Vec<_>, _>>()?;
                (function.call)(args)
            }
        }
    }
}

/// One output table's extraction rules.
#[derive(Debug, Clone)]
pub struct TablePlan {
    pub name: String,
    pub headings: Vec<String>,
    pub key: Option<String>,
    rows: Option<Arc<Path>>,
    filter: Option<Expr>,
    columns: Vec<Expr>,
}

impl TablePlan {
    fn compile(def: &TableDefinition) -> Result<Self, QueryError> {
        if def.columns.is_empty() {
            return Err(QueryError::NoColumns {
                table: def.name.clone(),
            });
        }

        let mut seen = HashSet::new();
        for column in &def.columns {
            if !seen.insert(column.heading.as_str()) {
                return Err(QueryError::DuplicateHeading {
                    table: def.name.clone(),
                    heading: column.heading.clone(),
                });
            }
        }
        if let Some(key) = &def.key {
            if !seen.contains(key.as_str()) {
                return Err(QueryError::UnknownKey {
                    table: def.name.clone(),
                    key: key.clone(),
                });
            }
        }

        Ok(Self {
            name: def.name.clone(),
            headings: def.columns.iter().map(|c| c.heading.clone()).collect(),
            key: def.key.clone(),
            rows: def
                .rows
                .as_deref()
                .map(Path::parse)
                .transpose()?
                .map(Arc::new),
            filter: def.filter.as_ref().map(Expr::compile).transpose()?,
            columns: def
                .columns
                .iter()
                .map(|c| Expr::compile(&c.expr))
                .collect::<Result<_, _>>()?,
        })
    }

    /// A table with this plan's name, headings and key, and no rows.
    pub fn empty_table(&self) -> Table {
        Table::new(self.name.clone(), self.headings.clone()).with_key(self.key.clone())
    }

    /// Rows this table draws from `record`.
    ///
    /// With a `rows` path there is one row per match (array matches are
    /// expanded); otherwise exactly one row per record. Empty cells become
    /// `missing`.
    pub fn rows_for(&self, record: &Arc<Record>, missing: &Value) -> Result<Vec<Row>, ExtractError> {
        let contexts: Vec<Arc<Value>> = match &self.rows {
            Some(path) => path
                .find(record)
                .into_iter()
                .flat_map(|located| match located.value {
                    Value::Array(items) => items,
                    other => vec![other],
                })
                .map(Arc::new)
                .collect(),
            None => vec![Arc::clone(record)],
        };

        let mut rows = Vec::with_capacity(contexts.len());
        for current in contexts {
            let scope = Scope {
                record: Arc::clone(record),
                current,
            };
            if let Some(filter) = &self.filter {
                if !truthy(&normalize(&filter.eval(&scope)?)?) {
                    continue;
                }
            }
            let row = self
                .columns
                .iter()
                .map(|column| Ok(render_cell(normalize(&column.eval(&scope)?)?, missing)))
                .collect::<Result<Row, ExtractError>>()?;
            rows.push(row);
        }
        Ok(rows)
    }
}

/// Render a normalized value as a row cell: numbers and booleans become
/// text, empty and null cells become `missing`.
pub fn render_cell(value: Value, missing: &Value) -> Value {
    match value {
        Value::Null => missing.clone(),
        Value::Array(items) if items.is_empty() => missing.clone(),
        Value::Array(items) => Value::Array(
            items
                .into_iter()
                .map(|item| render_cell(item, missing))
                .collect(),
        ),
        Value::Number(n) => Value::String(n.to_string()),
        Value::Bool(b) => Value::String(b.to_string()),
        other => other,
    }
}

/// All tables fed by one resource type.
#[derive(Debug, Clone)]
pub struct ResourcePlan {
    pub resource: String,
    pub order_by: Vec<String>,
    pub tables: Vec<TablePlan>,
}

/// A query ready to run.
#[derive(Debug, Clone)]
pub struct CompiledQuery {
    definition: QueryDefinition,
    resources: Vec<ResourcePlan>,
}

impl CompiledQuery {
    pub fn from_slice(bytes: &[u8]) -> Result<Self, QueryError> {
        Self::compile(QueryDefinition::from_slice(bytes)?)
    }

    pub fn compile(definition: QueryDefinition) -> Result<Self, QueryError> {
        if definition.tables.is_empty() {
            return Err(QueryError::Empty);
        }

        let mut resources: Vec<ResourcePlan> = Vec::new();
        for table in &definition.tables {
            let plan = TablePlan::compile(table)?;
            match resources.iter_mut().find(|r| r.resource == table.source) {
                Some(resource) => resource.tables.push(plan),
                None => {
                    let order_by = definition
                        .order_by
                        .get(&table.source)
                        .cloned()
                        .or_else(|| default_order_by(&table.source))
                        .filter(|fields| !fields.is_empty())
                        .ok_or_else(|| QueryError::MissingOrder {
                            resource: table.source.clone(),
                        })?;
                    resources.push(ResourcePlan {
                        resource: table.source.clone(),
                        order_by,
                        tables: vec![plan],
                    });
                }
            }
        }

        Ok(Self {
            definition,
            resources,
        })
    }

    pub fn definition(&self) -> &QueryDefinition {
        &self.definition
    }

    pub fn resources(&self) -> &[ResourcePlan] {
        &self.resources
    }

    pub fn tables(&self) -> impl Iterator<Item = &TablePlan> {
        self.resources.iter().flat_map(|r| r.tables.iter())
    }

    /// `(table, heading)` pairs whose heading exceeds `max_len` characters.
    pub fn long_headings(&self, max_len: usize) -> Vec<(String, String)> {
        self.tables()
            .flat_map(|t| {
                t.headings
                    .iter()
                    .filter(|h| h.chars().count() > max_len)
                    .map(|h| (t.name.clone(), h.clone()))
                    .collect::<Vec<_>>()
            })
            .collect()
    }
}
