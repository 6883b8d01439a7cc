pub mod api;
pub mod error;
pub mod state;

pub use api::{create_router, OperationStatus};
pub use error::ApiError;
pub use state::AppState;
