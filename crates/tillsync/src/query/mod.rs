//! Local query surface: state, REST translation, reactive pipeline.

pub mod pipeline;
pub mod state;
pub mod translate;

pub use pipeline::{PaginationWindow, QueryPipeline};
pub use state::{FilterValue, QueryState, SortDirection, StructuredFilter};
pub use translate::{translate, TranslatedParams};
