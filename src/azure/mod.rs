pub mod identity;
pub mod management;

pub use identity::{AccessToken, DefaultAzureCredential, TokenProvider};
pub use management::{ArmClient, ManagementApi, ServerInfo, ServerParameter};
