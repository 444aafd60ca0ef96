//! HTTP surface of the proxy.
//!
//! | Path | Method | Behaviour |
//! |------|--------|-----------|
//! | `/health` | GET | Liveness, `{"status":"ok"}` |
//! | `/metrics` | GET | Prometheus exposition (when enabled) |
//! | anything else | collapsible methods | Coalesced through the batcher |
//! | anything else | other methods | Forwarded one-to-one |

pub mod routes;
pub mod state;

pub use routes::{
    create_router, create_router_with_body_limit, create_router_with_observability,
    DEFAULT_BODY_LIMIT, DEFAULT_METRICS_PATH,
};
pub use state::{AppState, ProxyBatcher};
