pub mod backend;
pub mod http_client;

pub use backend::{Artifact, BackendClient, CollectionKind, Event, Task};
pub use http_client::{HttpClient, ReqwestHttpClient, SimpleHttpResponse};
