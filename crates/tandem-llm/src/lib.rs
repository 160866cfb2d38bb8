pub mod echo;
pub mod mock;
pub mod reliable;

pub use echo::EchoProvider;
pub use mock::{MockProvider, MockResponse};
pub use reliable::{ReliableConfig, ReliableProvider};
