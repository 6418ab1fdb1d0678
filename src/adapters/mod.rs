// Adapters layer: concrete implementations for external systems (docker cli, local storage).

pub mod docker;
pub mod storage;

pub use docker::{BuildRequest, DockerCli, ProcessRunner};
pub use storage::LocalStorage;
