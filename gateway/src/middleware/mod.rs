pub mod auth;
pub mod client_ip;
pub mod connection_limit;
pub mod origin;

// Re-export middleware functions
pub use auth::{SessionCredential, auth_middleware};
pub use client_ip::{ClientIp, ClientIpKeyExtractor, client_ip_middleware};
pub use connection_limit::{AdmissionTicket, connection_limit_middleware};
pub use origin::{OriginPolicy, origin_guard_middleware};
