//! collapse-api: HTTP collapsed-forwarding proxy
//!
//! Accepts client requests, collapses concurrent identical ones through a
//! [`collapse_server::Batcher`] and answers them all from one upstream call.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │                collapse-api                  │
//! ├─────────────────────────────────────────────┤
//! │  http/          - Router and proxy handler  │
//! │  upstream       - reqwest upstream invoker  │
//! │  errors         - Proxy error responses     │
//! │  observability/ - Logging and metrics       │
//! │  server         - Serve, then drain on stop │
//! │  utils          - Coalescing key derivation │
//! └─────────────────────────────────────────────┘
//! ```

pub mod errors;
pub mod http;
pub mod observability;
pub mod server;
pub mod upstream;
pub mod utils;
