pub mod registry;
pub mod transport;

pub use registry::ensure_node_id;
pub use transport::HttpTransport;
