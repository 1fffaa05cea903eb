pub mod error;
pub mod games;
pub mod live;
pub mod models;
pub mod replay;
pub mod routes;
pub mod stream;

pub use error::ApiError;
pub use routes::{build_router, AppState};
