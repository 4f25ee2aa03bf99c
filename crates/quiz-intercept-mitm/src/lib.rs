//! MITM proxy with selective HTTPS interception
//!
//! A small man-in-the-middle proxy: browsers connect to it as an HTTP proxy, `CONNECT`
//! tunnels to selected hosts are decrypted with leaf certificates minted from a local CA,
//! and every decrypted request/response pair runs through pluggable interceptor chains.
//!
//! # Features
//!
//! - Automatic CA certificate generation and per-host leaf caching
//! - HTTPS termination with rustls, upstream forwarding with reqwest
//! - Host allow-list: tunnels to other hosts are relayed untouched
//! - Graceful shutdown through a caller supplied future
//!
//! # Example
//!
//! ```no_run
//! use quiz_intercept_mitm::{LoggingInterceptor, MitmConfig, MitmProxy};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!   let proxy = MitmProxy::new(MitmConfig::default()).await?;
//!   proxy
//!     .interceptor_handler()
//!     .write()
//!     .await
//!     .add_response_interceptor(Arc::new(LoggingInterceptor));
//!   proxy.start("127.0.0.1:8080").await?;
//!   Ok(())
//! }
//! ```

mod ca;
mod error;
mod interceptor;
mod proxy;
mod server;

pub use ca::{CertificateAuthority, CertificateManager, ServerCert};
pub use error::{Error, Result};
pub use interceptor::{
  pretty_url, InterceptorHandler, LoggingInterceptor, MitmRequest, MitmResponse,
  RequestInterceptor, ResponseInterceptor,
};
pub use proxy::{MitmConfig, MitmProxy};
pub use server::ProxyServer;
