pub mod ip_network;

pub use ip_network::{IpNetwork, IpNetworkError, parse_network_list};
