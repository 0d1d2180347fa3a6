use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};

/// Collections served by the backend
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Collection {
    Cameras,
    Incidents,
    Users,
}

impl Collection {
    pub fn table_name(&self) -> &'static str {
        match self {
            Self::Cameras => "cameras",
            Self::Incidents => "incidents",
            Self::Users => "users",
        }
    }
}

impl Display for Collection {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.table_name())
    }
}

/// Row filter in PostgREST operator syntax (`column=op.value`)
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Filter {
    Eq(String, String),
    Is(String, String),
    /// Matches when any of the inner filters does (`or=(a.eq.1,b.is.true)`)
    Or(Vec<Filter>),
}

impl Filter {
    fn to_pair(&self) -> (String, String) {
        match self {
            Self::Eq(column, value) => (column.clone(), format!("eq.{}", value)),
            Self::Is(column, value) => (column.clone(), format!("is.{}", value)),
            Self::Or(filters) => ("or".to_string(), format!("({})", Self::conditions(filters))),
        }
    }

    /// Inline form used inside logical operators
    fn condition(&self) -> String {
        match self {
            Self::Eq(column, value) => format!("{}.eq.{}", column, value),
            Self::Is(column, value) => format!("{}.is.{}", column, value),
            Self::Or(filters) => format!("or({})", Self::conditions(filters)),
        }
    }

    fn conditions(filters: &[Filter]) -> String {
        filters
            .iter()
            .map(Filter::condition)
            .collect::<Vec<_>>()
            .join(",")
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Order {
    pub column: String,
    pub descending: bool,
}

/// Read request against one collection: filters, ordering, and an optional
/// embedded-relation projection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectionQuery {
    pub collection: Collection,
    select: Vec<String>,
    filters: Vec<Filter>,
    order: Vec<Order>,
    limit: Option<u32>,
}

impl CollectionQuery {
    pub fn new(collection: Collection) -> Self {
        Self {
            collection,
            select: Vec::new(),
            filters: Vec::new(),
            order: Vec::new(),
            limit: None,
        }
    }

    pub fn select(mut self, columns: &str) -> Self {
        self.select.push(columns.to_string());
        self
    }

    /// Embed the related collection under `alias` (`alias:table(*)`).
    pub fn embed(mut self, alias: &str, related: Collection) -> Self {
        self.select.push(format!("{}:{}(*)", alias, related.table_name()));
        self
    }

    pub fn eq(mut self, column: &str, value: impl Display) -> Self {
        self.filters.push(Filter::Eq(column.to_string(), value.to_string()));
        self
    }

    pub fn filter(mut self, filter: Filter) -> Self {
        self.filters.push(filter);
        self
    }

    pub fn order_asc(mut self, column: &str) -> Self {
        self.order.push(Order {
            column: column.to_string(),
            descending: false,
        });
        self
    }

    pub fn order_desc(mut self, column: &str) -> Self {
        self.order.push(Order {
            column: column.to_string(),
            descending: true,
        });
        self
    }

    pub fn limit(mut self, limit: u32) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn filters(&self) -> &[Filter] {
        &self.filters
    }

    /// Query string pairs in the order the backend documents them.
    pub fn to_query_pairs(&self) -> Vec<(String, String)> {
        let mut pairs = Vec::new();

        let select = if self.select.is_empty() {
            "*".to_string()
        } else {
            self.select.join(",")
        };
        pairs.push(("select".to_string(), select));

        pairs.extend(self.filters.iter().map(Filter::to_pair));

        if !self.order.is_empty() {
            let order = self
                .order
                .iter()
                .map(|o| {
                    format!(
                        "{}.{}",
                        o.column,
                        if o.descending { "desc" } else { "asc" }
                    )
                })
                .collect::<Vec<_>>()
                .join(",");
            pairs.push(("order".to_string(), order));
        }

        if let Some(limit) = self.limit {
            pairs.push(("limit".to_string(), limit.to_string()));
        }

        pairs
    }
}
