use crate::domain::model::{CommandOutput, Invocation};
use crate::utils::error::Result;
use async_trait::async_trait;

pub trait Storage: Send + Sync {
    fn write_file(
        &self,
        path: &str,
        data: &[u8],
    ) -> impl std::future::Future<Output = Result<String>> + Send;
}

/// Runs an external program to completion and captures its output.
///
/// A non-zero exit status is reported through [`CommandOutput::status`],
/// not as an error; only a failure to launch the program is an `Err`.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, invocation: &Invocation) -> Result<CommandOutput>;
}
