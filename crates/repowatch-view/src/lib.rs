//! View layer for Repowatch.
//!
//! Turns cached rows and user query parameters into screen states.

pub mod model;
pub mod query;
pub mod state;

pub use model::{
    RepositoriesIntent, RepositoriesModel, RepositoryDetailIntent, RepositoryDetailModel,
};
pub use query::{
    derive_view, filter, search, sort, FilterOption, QueryParams, QueryState, SortDirection,
    SortField, SortOption,
};
pub use state::{reduce, ItemState, ViewEvent, ViewState};
