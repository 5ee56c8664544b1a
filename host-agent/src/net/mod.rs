pub mod cert;
pub mod port;

pub use cert::SelfSignedCert;
pub use port::{get_available_port, get_primary_ip};
