pub mod http;
pub mod sandbox;

pub use http::ReqwestHttpProxy;
pub use sandbox::ProcessSandbox;
