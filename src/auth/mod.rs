pub mod session;
pub mod token;

pub use session::{AuthOutcome, ConnectionId, SessionManager};
pub use token::TokenStore;
