pub mod error;
pub mod proxy;
pub mod router;

pub use error::ProxyError;
pub use proxy::{
    BackendTls, CaIssuer, CertificateIssuer, FileTarget, FnTarget, IssuedCertificate,
    ListenScheme, ListenSpec, Proxy, ProxyOptions, ProxyStats, RequestObserver, ResponseHead,
    SelfSignedIssuer, ServeState, StaticTarget, TargetResolver,
};
pub use router::Router;
