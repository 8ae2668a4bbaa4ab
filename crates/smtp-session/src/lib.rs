pub mod connect;
pub mod response;
pub mod session;
pub mod tls;
pub mod traits;

pub use connect::*;
pub use response::*;
pub use session::*;
pub use tls::TlsParameters;
pub use traits::*;
