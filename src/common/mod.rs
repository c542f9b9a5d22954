pub mod addr;
pub mod error;
pub mod stream;

pub use addr::Address;
pub use error::Error;
pub use stream::ProxyStream;
