use serde::{Deserialize, Serialize};
use std::fmt;

/// Outbound request priority.
///
/// Priority decides dequeue order in the shared request scheduler; lower
/// numeric value is dequeued first. The bands follow the pull urgency of the
/// resource kinds:
/// - TaxRate: a sale cannot total without tax rates
/// - Catalog: core product catalog
/// - Customer / Order: account and order history pulls
/// - Search: text-search variants of any pull
/// - Variation: per-product variation expansions
/// - Taxonomy: categories and tags, cheapest to refresh last
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum RequestPriority {
    TaxRate = 0,
    Catalog = 1,
    Customer = 2,
    Order = 3,
    Search = 4,
    Variation = 5,
    Taxonomy = 6,
}

impl RequestPriority {
    pub fn value(&self) -> u8 {
        *self as u8
    }

    pub fn from_value(value: u8) -> Option<Self> {
        match value {
            0 => Some(RequestPriority::TaxRate),
            1 => Some(RequestPriority::Catalog),
            2 => Some(RequestPriority::Customer),
            3 => Some(RequestPriority::Order),
            4 => Some(RequestPriority::Search),
            5 => Some(RequestPriority::Variation),
            6 => Some(RequestPriority::Taxonomy),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            RequestPriority::TaxRate => "tax_rate",
            RequestPriority::Catalog => "catalog",
            RequestPriority::Customer => "customer",
            RequestPriority::Order => "order",
            RequestPriority::Search => "search",
            RequestPriority::Variation => "variation",
            RequestPriority::Taxonomy => "taxonomy",
        }
    }

    /// Whether this band should preempt ordinary catalog traffic.
    pub fn is_urgent(&self) -> bool {
        matches!(self, RequestPriority::TaxRate | RequestPriority::Catalog)
    }

    /// Whether this band may be deferred without a visible cashier impact.
    pub fn is_background(&self) -> bool {
        matches!(self, RequestPriority::Variation | RequestPriority::Taxonomy)
    }

    pub fn all() -> Vec<Self> {
        vec![
            RequestPriority::TaxRate,
            RequestPriority::Catalog,
            RequestPriority::Customer,
            RequestPriority::Order,
            RequestPriority::Search,
            RequestPriority::Variation,
            RequestPriority::Taxonomy,
        ]
    }
}

impl fmt::Display for RequestPriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl Default for RequestPriority {
    fn default() -> Self {
        RequestPriority::Catalog
    }
}

impl From<RequestPriority> for u8 {
    fn from(priority: RequestPriority) -> Self {
        priority.value()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_priority_ordering() {
        assert!(RequestPriority::TaxRate < RequestPriority::Catalog);
        assert!(RequestPriority::Catalog < RequestPriority::Customer);
        assert!(RequestPriority::Customer < RequestPriority::Order);
        assert!(RequestPriority::Order < RequestPriority::Search);
        assert!(RequestPriority::Search < RequestPriority::Variation);
        assert!(RequestPriority::Variation < RequestPriority::Taxonomy);
    }

    #[test]
    fn test_priority_round_trip() {
        for p in RequestPriority::all() {
            assert_eq!(RequestPriority::from_value(p.value()), Some(p));
        }
        assert_eq!(RequestPriority::from_value(7), None);
    }

    #[test]
    fn test_priority_helpers() {
        assert!(RequestPriority::TaxRate.is_urgent());
        assert!(RequestPriority::Catalog.is_urgent());
        assert!(!RequestPriority::Order.is_urgent());

        assert!(RequestPriority::Taxonomy.is_background());
        assert!(RequestPriority::Variation.is_background());
        assert!(!RequestPriority::Search.is_background());
    }
}
