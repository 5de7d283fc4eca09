//! HTTP API for controlling the relay
//!
//! - POST /relay/login - Start relaying a channel from an access token
//! - POST /relay/logout - Stop relaying
//! - GET /relay/status - Query relay state
//! - GET /health - Health check

mod handlers;
mod routes;
mod state;

pub use handlers::{ErrorResponse, LoginRequest, LoginResponse, LogoutResponse};
pub use routes::create_router;
pub use state::AppState;
