mod backend;
mod users;

pub use backend::{DefaultLoginHooks, LoginHooks, OpenIdConnectBackend, OpenIdUserData};
pub use users::{MemoryUserStore, User, UserStore, UserStoreError};
