//! Resource kinds synchronized by the engine.
//!
//! Remote-endpoint quirks (which endpoints support `modified_after`, which
//! selector keys are renamed, which sort fields differ) are capability data
//! on the enum, not separate code paths.

use std::str::FromStr;

use crate::scheduler::RequestPriority;

/// A remote REST resource collection mirrored into the local store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    Product,
    ProductVariation,
    Order,
    Customer,
    TaxRate,
    Category,
    Tag,
}

impl ResourceKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Product => "products",
            Self::ProductVariation => "variations",
            Self::Order => "orders",
            Self::Customer => "customers",
            Self::TaxRate => "taxes",
            Self::Category => "products/categories",
            Self::Tag => "products/tags",
        }
    }

    /// REST path segment under the API base URL.
    pub fn endpoint(self) -> &'static str {
        self.as_str()
    }

    /// Local collection name. Nested endpoint paths flatten to a single
    /// collection identifier.
    pub fn collection(self) -> &'static str {
        match self {
            Self::Product => "products",
            Self::ProductVariation => "variations",
            Self::Order => "orders",
            Self::Customer => "customers",
            Self::TaxRate => "taxes",
            Self::Category => "categories",
            Self::Tag => "tags",
        }
    }

    /// Whether the remote endpoint honors a `modified_after` filter.
    ///
    /// Taxonomy-style resources (tax rates, categories, tags) carry no
    /// reliable modification timestamp remotely; for those the ID-set audit
    /// is the only correct change detector.
    pub fn supports_modified_after(self) -> bool {
        matches!(
            self,
            Self::Product | Self::ProductVariation | Self::Order | Self::Customer
        )
    }

    /// Per-resource selector key aliases (local key -> remote query key).
    pub fn selector_alias(self, key: &str) -> &str {
        match (self, key) {
            (Self::Product | Self::ProductVariation, "categories") => "category",
            (Self::Product | Self::ProductVariation, "tags") => "tag",
            (Self::Order, "customer") => "customer_id",
            _ => key,
        }
    }

    /// Per-resource sort field renames (local field -> remote `orderby`).
    ///
    /// Products sort locally by `name` but remotely by `title`.
    pub fn remote_sort_field(self, local_field: &str) -> &str {
        match (self, local_field) {
            (Self::Product | Self::ProductVariation, "name") => "title",
            (Self::Order, "date_created") => "date",
            _ => local_field,
        }
    }

    /// Pull priority for the request scheduler (lower value = more urgent).
    ///
    /// Canonical ordering: tax rates < core catalog < customers < orders <
    /// text-search variants < variations < categories/tags.
    pub fn pull_priority(self, has_search: bool) -> RequestPriority {
        if has_search {
            return RequestPriority::Search;
        }
        match self {
            Self::TaxRate => RequestPriority::TaxRate,
            Self::Product => RequestPriority::Catalog,
            Self::Customer => RequestPriority::Customer,
            Self::Order => RequestPriority::Order,
            Self::ProductVariation => RequestPriority::Variation,
            Self::Category | Self::Tag => RequestPriority::Taxonomy,
        }
    }

    /// All kinds in pull-priority order, used for bootstrap sync.
    pub fn all() -> &'static [ResourceKind] {
        &[
            Self::TaxRate,
            Self::Product,
            Self::Customer,
            Self::Order,
            Self::ProductVariation,
            Self::Category,
            Self::Tag,
        ]
    }
}

impl FromStr for ResourceKind {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "products" => Ok(Self::Product),
            "variations" => Ok(Self::ProductVariation),
            "orders" => Ok(Self::Order),
            "customers" => Ok(Self::Customer),
            "taxes" => Ok(Self::TaxRate),
            "categories" | "products/categories" => Ok(Self::Category),
            "tags" | "products/tags" => Ok(Self::Tag),
            _ => Err(()),
        }
    }
}

impl std::fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
