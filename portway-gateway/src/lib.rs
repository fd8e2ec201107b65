pub mod dispatcher;
pub mod headers;
pub mod http;
pub mod path;

pub use dispatcher::{
    BlobGateway, DispatchResult, Dispatcher, IncomingRequest, NullBlobStore, ProxyGateway,
    SqlGateway,
};
