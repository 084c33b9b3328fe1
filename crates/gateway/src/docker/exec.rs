//! Exec domain: run commands inside a container.

use super::client::{DockerClient, DockerError};
use crate::runtime::{ExecOutput, ExecSession};

use bollard::container::LogOutput;
use bollard::exec::{StartExecOptions, StartExecResults};
use bollard::models::ExecConfig;
use futures_util::stream::StreamExt;

impl DockerClient {
    /// Create an exec instance in a container and return its id.
    pub async fn create_exec(
        &self,
        name: &str,
        cmd: Vec<String>,
        interactive: bool,
    ) -> Result<String, DockerError> {
        let config = ExecConfig {
            attach_stdin: Some(interactive),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            tty: Some(interactive),
            cmd: Some(cmd),
            ..Default::default()
        };

        let result = self
            .client
            .create_exec(name, config)
            .await
            .map_err(|e| DockerError::not_found(name, e))?;

        Ok(result.id)
    }

    async fn start_attached(&self, exec_id: &str, tty: bool) -> Result<StartExecResults, DockerError> {
        let options = Some(StartExecOptions {
            detach: false,
            tty,
            ..Default::default()
        });

        self.client
            .start_exec(exec_id, options)
            .await
            .map_err(DockerError::from)
    }

    /// Run a command to completion and collect stdout and stderr.
    pub async fn exec_collect(&self, name: &str, cmd: Vec<String>) -> Result<ExecOutput, DockerError> {
        let exec_id = self.create_exec(name, cmd, false).await?;

        let mut output = match self.start_attached(&exec_id, false).await? {
            StartExecResults::Attached { output, .. } => output,
            StartExecResults::Detached => return Err(DockerError::StreamClosed),
        };

        let mut collected = Vec::new();
        while let Some(chunk) = output.next().await {
            match chunk? {
                LogOutput::StdOut { message }
                | LogOutput::StdErr { message }
                | LogOutput::Console { message } => collected.extend_from_slice(&message),
                LogOutput::StdIn { .. } => {}
            }
        }

        let inspect = self.client.inspect_exec(&exec_id).await?;

        Ok(ExecOutput {
            output: String::from_utf8_lossy(&collected).into_owned(),
            exit_code: inspect.exit_code.unwrap_or(-1),
        })
    }

    /// Start an interactive exec with a TTY and hand back both directions.
    pub async fn exec_attach(&self, name: &str, cmd: Vec<String>) -> Result<ExecSession, DockerError> {
        let exec_id = self.create_exec(name, cmd, true).await?;

        match self.start_attached(&exec_id, true).await? {
            StartExecResults::Attached { output, input } => {
                let output = output.map(|chunk| match chunk {
                    Ok(LogOutput::StdOut { message })
                    | Ok(LogOutput::StdErr { message })
                    | Ok(LogOutput::StdIn { message })
                    | Ok(LogOutput::Console { message }) => Ok(message),
                    Err(e) => Err(DockerError::from(e)),
                });
                Ok(ExecSession {
                    exec_id,
                    output: Box::pin(output),
                    input,
                })
            }
            StartExecResults::Detached => Err(DockerError::StreamClosed),
        }
    }
}
