//! Live: Bollard-backed [`ContainerRuntime`] implementation.

use super::client::DockerClient;
use crate::runtime::{
    BoxFuture, ContainerRuntime, EventStream, ExecOutput, ExecSession, LineStream, LogOptions,
};
use crate::docker::client::DockerError;
use crate::tracker::ContainerRecord;

impl ContainerRuntime for DockerClient {
    fn inspect<'a>(
        &'a self,
        name: &'a str,
    ) -> BoxFuture<'a, Result<Option<ContainerRecord>, DockerError>> {
        Box::pin(self.inspect_record(name))
    }

    fn events(&self, since: Option<i64>) -> EventStream {
        self.stream_container_events(since)
    }

    fn logs<'a>(
        &'a self,
        name: &'a str,
        options: LogOptions,
    ) -> BoxFuture<'a, Result<LineStream, DockerError>> {
        Box::pin(async move { self.stream_log_lines(name, options) })
    }

    fn exec<'a>(
        &'a self,
        name: &'a str,
        cmd: Vec<String>,
    ) -> BoxFuture<'a, Result<ExecOutput, DockerError>> {
        Box::pin(self.exec_collect(name, cmd))
    }

    fn exec_interactive<'a>(
        &'a self,
        name: &'a str,
        cmd: Vec<String>,
    ) -> BoxFuture<'a, Result<ExecSession, DockerError>> {
        Box::pin(self.exec_attach(name, cmd))
    }
}
