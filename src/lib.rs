pub mod config;
pub mod formatting;
pub mod framed_json_stream;
pub mod gdb_client;
pub mod instance;
pub mod interfaces;
pub mod keymap;
pub mod protocol;
pub mod qmp_client;
pub mod rsp_packet;
pub mod video;

pub use config::{GdbConfig, InstanceConfig, QmpConfig};
pub use gdb_client::GdbClient;
pub use instance::{DosInstance, InstanceState};
pub use interfaces::{GdbError, InstanceError, QmpError};
pub use qmp_client::QmpClient;

use std::io;
use std::net::{TcpStream, ToSocketAddrs};
use std::time::Duration;

/// Connects to the first resolved address that accepts within `timeout`.
pub(crate) fn connect_tcp(addr: &str, timeout: Duration) -> io::Result<TcpStream> {
    let mut last_err = None;
    for sock_addr in addr.to_socket_addrs()? {
        match TcpStream::connect_timeout(&sock_addr, timeout) {
            Ok(stream) => return Ok(stream),
            Err(e) => last_err = Some(e),
        }
    }
    Err(last_err.unwrap_or_else(|| {
        io::Error::new(io::ErrorKind::AddrNotAvailable, format!("no address for {}", addr))
    }))
}

pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info"));
    // Tests call this repeatedly; only the first call installs a subscriber.
    let _ = tracing_subscriber::fmt()
        .without_time()
        .with_env_filter(filter)
        .try_init();
}
