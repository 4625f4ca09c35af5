mod api_auth;

pub use api_auth::*;
