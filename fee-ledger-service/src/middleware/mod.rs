pub mod tenant;

pub use tenant::{
    tenant_middleware, Actor, ACTOR_HEADER, TENANT_HANDLE_HEADER, WEBHOOK_PATH_PREFIX,
};
