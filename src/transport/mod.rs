//! Transport module - request/response types, the transport trait, and the HTTP client

pub mod codec;
pub mod http_transport;
pub mod traits;

pub use http_transport::ReqwestTransport;
pub use traits::{
    BodyStream, HttpRequest, HttpResponse, RewrittenRequest, StreamingResponse, Transport,
};
