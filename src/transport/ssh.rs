use super::{reject_on_error_line, Advertisement, Error, PackStream, Result, ScanOptions, SshEndpoint};
use crate::git_protocol::{read_pkt_line, UploadPackRequest};
use std::process::Stdio;
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tracing::debug;

/// upload-pack running at the far end of an `ssh` child process.
pub(super) struct SshSession {
    child: Child,
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
}

impl SshSession {
    pub(super) async fn connect(
        endpoint: &SshEndpoint,
        options: &ScanOptions,
    ) -> Result<(Self, Advertisement)> {
        let mut cmd = Command::new(&options.ssh_command);

        if let Some(port) = endpoint.port {
            cmd.arg("-p").arg(port.to_string());
        }
        cmd.arg(endpoint.destination());
        cmd.arg(remote_command(&endpoint.path));

        cmd.stdin(Stdio::piped());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::inherit());
        cmd.kill_on_drop(true);

        debug!(program = %options.ssh_command, host = %endpoint.host, "Spawning ssh");
        let mut child = cmd.spawn().map_err(|err| {
            Error::Connection(format!("failed to spawn {}: {err}", options.ssh_command))
        })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::Connection("failed to open ssh stdin".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::Connection("failed to open ssh stdout".into()))?;
        let mut stdout = BufReader::new(stdout);

        let mut lines = vec![];
        loop {
            match read_pkt_line(&mut stdout).await? {
                None => {
                    return Err(Error::Connection(format!(
                        "{} closed the connection before advertising refs",
                        endpoint.destination()
                    )))
                }
                Some(line) if line.is_flush() => break,
                Some(line) => {
                    reject_on_error_line(&line)?;
                    lines.push(line);
                }
            }
        }

        let advertisement = Advertisement::parse(lines)?;
        let session = Self {
            child,
            stdin,
            stdout,
        };
        Ok((session, advertisement))
    }

    pub(super) async fn upload_pack(self, request: &UploadPackRequest) -> Result<PackStream> {
        let Self {
            child,
            mut stdin,
            stdout,
        } = self;

        stdin.write_all(&request.serialize()).await?;
        stdin.flush().await?;
        // upload-pack reads nothing after `done`.
        drop(stdin);

        PackStream::negotiate(Box::new(stdout), Some(child)).await
    }
}

/// Remote shell command with the repository path single-quoted.
fn remote_command(path: &str) -> String {
    format!("git-upload-pack '{}'", path.replace('\'', r"'\''"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn it_quotes_the_repository_path() {
        assert_eq!(remote_command("org/repo.git"), "git-upload-pack 'org/repo.git'");
        assert_eq!(
            remote_command("it's/repo"),
            r"git-upload-pack 'it'\''s/repo'"
        );
    }

    #[tokio::test]
    async fn it_reports_a_missing_ssh_program() {
        let endpoint = SshEndpoint {
            user: None,
            host: "example.com".into(),
            port: None,
            path: "repo.git".into(),
        };
        let options = ScanOptions::default().ssh_command("/nonexistent/git-pack-scanner-ssh");

        let err = SshSession::connect(&endpoint, &options).await.err().unwrap();
        assert!(err.is_connection());
    }
}
