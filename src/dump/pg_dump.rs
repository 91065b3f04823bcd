use std::ffi::OsString;
use std::path::Path;
use std::process::{ExitStatus, Stdio};

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr, Command};
use tokio_util::sync::CancellationToken;

use super::{ConnectionParams, DumpArtifact, DumpLogSink, DumpProducer};
use crate::config::AppConfig;
use crate::error::AppError;

/// Runs `pg_dump` as a child process
pub struct PgDumpProducer {
    program: String,
    connection: ConnectionParams,
    extra_args: Vec<String>,
}

impl PgDumpProducer {
    pub fn new(
        program: impl Into<String>,
        connection: ConnectionParams,
        extra_args: Vec<String>,
    ) -> Self {
        Self {
            program: program.into(),
            connection,
            extra_args,
        }
    }

    pub fn from_config(config: &AppConfig) -> Result<Self, AppError> {
        let connection = ConnectionParams::parse(&config.database.connection_string)?;
        Ok(Self::new(
            config.dump.program.clone(),
            connection,
            config.dump.extra_args(),
        ))
    }

    /// Command line for a dump written to `target`
    ///
    /// The password is never part of it; see `produce`.
    pub fn arguments(&self, target: &Path) -> Vec<OsString> {
        let mut args: Vec<OsString> = vec![
            "--host".into(),
            self.connection.host.clone().into(),
            "--port".into(),
            self.connection.port.to_string().into(),
            "--dbname".into(),
            self.connection.database.clone().into(),
            "--username".into(),
            self.connection.username.clone().into(),
            "--no-password".into(),
            "--file".into(),
            target.as_os_str().to_owned(),
        ];
        args.extend(self.extra_args.iter().map(OsString::from));
        args
    }

    async fn wait_with_stderr(
        child: &mut Child,
        stderr: Option<ChildStderr>,
        sink: &dyn DumpLogSink,
    ) -> std::io::Result<(ExitStatus, Option<String>)> {
        let mut last_line = None;
        if let Some(stderr) = stderr {
            // Server messages arrive in the database encoding, not always UTF-8
            let mut segments = BufReader::new(stderr).split(b'\n');
            while let Some(segment) = segments.next_segment().await? {
                let line = String::from_utf8_lossy(&segment).trim_end().to_string();
                if line.trim().is_empty() {
                    continue;
                }
                sink.record(&line);
                last_line = Some(line);
            }
        }
        let status = child.wait().await?;
        Ok((status, last_line))
    }
}

#[async_trait]
impl DumpProducer for PgDumpProducer {
    async fn produce(
        &self,
        target: &Path,
        sink: &dyn DumpLogSink,
        cancel: &CancellationToken,
    ) -> Result<DumpArtifact, AppError> {
        if cancel.is_cancelled() {
            return Err(AppError::Cancelled);
        }

        let mut command = Command::new(&self.program);
        command
            .args(self.arguments(target))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(password) = &self.connection.password {
            command.env("PGPASSWORD", password);
        }

        tracing::info!(
            program = %self.program,
            host = %self.connection.host,
            port = self.connection.port,
            database = %self.connection.database,
            target = %target.display(),
            "Starting dump"
        );

        let mut child = command.spawn().map_err(|e| {
            AppError::DumpProducerFailed(format!("failed to start {}: {}", self.program, e))
        })?;
        let stderr = child.stderr.take();

        let finished = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            result = Self::wait_with_stderr(&mut child, stderr, sink) => Some(result),
        };

        let Some(result) = finished else {
            if let Err(error) = child.kill().await {
                tracing::warn!(error = %error, "Failed to stop dump process");
            }
            return Err(AppError::Cancelled);
        };

        let (status, last_line) = result.map_err(|e| {
            AppError::DumpProducerFailed(format!("failed waiting for {}: {}", self.program, e))
        })?;

        if !status.success() {
            let detail = last_line.map(|line| format!(": {}", line)).unwrap_or_default();
            return Err(AppError::DumpProducerFailed(format!(
                "{} exited with {}{}",
                self.program, status, detail
            )));
        }

        let size = match tokio::fs::metadata(target).await {
            Ok(metadata) if metadata.is_file() => metadata.len(),
            _ => {
                return Err(AppError::DumpProducerFailed(format!(
                    "{} produced no file at {}",
                    self.program,
                    target.display()
                )));
            }
        };

        tracing::info!(target = %target.display(), size, "Dump finished");

        Ok(DumpArtifact {
            path: target.to_path_buf(),
            size,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn producer(extra_args: Vec<String>) -> PgDumpProducer {
        let connection = ConnectionParams::parse(
            "Host=db.internal;Port=6432;Database=app;Username=backup;Password=hunter2",
        )
        .unwrap();
        PgDumpProducer::new("pg_dump", connection, extra_args)
    }

    #[test]
    fn arguments_carry_connection_and_target() {
        let args = producer(vec!["--format=custom".to_string(), "--no-owner".to_string()])
            .arguments(Path::new("/tmp/run/dump.backup"));

        let args: Vec<String> = args
            .into_iter()
            .map(|arg| arg.into_string().unwrap())
            .collect();
        assert_eq!(
            args,
            vec![
                "--host",
                "db.internal",
                "--port",
                "6432",
                "--dbname",
                "app",
                "--username",
                "backup",
                "--no-password",
                "--file",
                "/tmp/run/dump.backup",
                "--format=custom",
                "--no-owner",
            ]
        );
    }

    #[test]
    fn password_is_not_on_the_command_line() {
        let args = producer(Vec::new()).arguments(Path::new("dump.backup"));
        assert!(args.iter().all(|arg| arg.to_str() != Some("hunter2")));
    }

    #[tokio::test]
    async fn missing_program_is_a_producer_failure() {
        let connection = ConnectionParams::parse("Host=db;Database=app;Username=u").unwrap();
        let producer = PgDumpProducer::new("/nonexistent/pg_dump", connection, Vec::new());
        let dir = tempfile::tempdir().unwrap();

        let error = producer
            .produce(
                &dir.path().join("dump.backup"),
                &crate::dump::TracingLogSink,
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(error, AppError::DumpProducerFailed(_)));
    }
}
