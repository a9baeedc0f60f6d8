mod server;
mod state;

pub use server::{router, start_server};
pub use state::AppState;
