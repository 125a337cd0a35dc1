//! Access to the hosts a cluster runs on.

use std::fmt::Debug;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

use crate::Error;

/// Outcome of a finished command.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit code, `None` when terminated by a signal.
    pub status: Option<i32>,
    /// Captured standard output.
    pub stdout: String,
    /// Captured standard error.
    pub stderr: String,
}

impl CommandOutput {
    /// A successful run printing `stdout`.
    pub fn success(stdout: impl Into<String>) -> Self {
        Self {
            status: Some(0),
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    /// Whether the command exited with status zero.
    #[must_use]
    pub const fn succeeded(&self) -> bool {
        matches!(self.status, Some(0))
    }
}

/// One host, accessed as one user.
///
/// Path arguments are absolute paths on that host. Commands take an argument
/// vector; only [`NodeClient::run_shell`] goes through a shell.
#[async_trait]
pub trait NodeClient: Debug + Send + Sync {
    /// Address of the host.
    fn ip(&self) -> &str;

    /// User commands run as.
    fn user(&self) -> &str;

    /// Runs `argv` and returns its output whatever the exit status.
    async fn try_run(&self, argv: &[&str]) -> Result<CommandOutput, Error>;

    /// Runs `argv`, failing with [`Error::Command`] on a non-zero exit.
    async fn run(&self, argv: &[&str]) -> Result<String, Error> {
        let output = self.try_run(argv).await?;
        if output.succeeded() {
            Ok(output.stdout)
        } else {
            Err(Error::Command {
                command: argv.join(" "),
                status: output.status,
                stderr: output.stderr,
            })
        }
    }

    /// Runs `command` through `sh -c`.
    async fn run_shell(&self, command: &str) -> Result<String, Error> {
        self.run(&["sh", "-c", command]).await
    }

    /// Whether `path` is an existing file.
    async fn file_exists(&self, path: &str) -> Result<bool, Error>;

    /// Contents of the file at `path`.
    async fn file_read(&self, path: &str) -> Result<String, Error>;

    /// Replaces the file at `path`, creating parent directories.
    async fn file_write(&self, path: &str, contents: &str) -> Result<(), Error>;

    /// Removes the files; missing ones are skipped.
    async fn file_delete(&self, paths: &[String]) -> Result<(), Error>;

    /// Absolute paths of the files in `directory`, descending when `recursive`.
    async fn file_list(&self, directory: &str, recursive: bool) -> Result<Vec<String>, Error>;

    /// Whether `path` is an existing directory.
    async fn dir_exists(&self, path: &str) -> Result<bool, Error>;

    /// Creates the directories and their parents.
    async fn dir_create(&self, paths: &[String]) -> Result<(), Error>;

    /// Removes the directories with everything inside; missing ones are skipped.
    async fn dir_delete(&self, paths: &[String]) -> Result<(), Error>;

    /// Sets the permission bits of the directories.
    async fn dir_chmod(&self, paths: &[String], mode: u32, recursive: bool) -> Result<(), Error>;

    /// Changes the owner of the directories.
    async fn dir_chown(&self, paths: &[String], user: &str, group: &str, recursive: bool) -> Result<(), Error>;
}

/// Opens [`NodeClient`]s.
#[async_trait]
pub trait NodeConnector: Debug + Send + Sync {
    /// Connects to `ip` as `user`.
    async fn connect(&self, ip: &str, user: &str) -> Result<Arc<dyn NodeClient>, Error>;
}

/// [`NodeClient`] for the host this process runs on.
#[derive(Clone, Debug)]
pub struct LocalNodeClient {
    ip: String,
    user: String,
}

impl LocalNodeClient {
    /// Local access on behalf of `ip` as `user`.
    pub fn new(ip: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            ip: ip.into(),
            user: user.into(),
        }
    }
}

async fn walk(directory: &Path, recursive: bool, files: &mut Vec<String>, dirs: &mut Vec<String>) -> Result<(), Error> {
    let mut pending = vec![directory.to_path_buf()];
    while let Some(current) = pending.pop() {
        let mut entries = tokio::fs::read_dir(&current).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if entry.file_type().await?.is_dir() {
                dirs.push(path.to_string_lossy().into_owned());
                if recursive {
                    pending.push(path);
                }
            } else {
                files.push(path.to_string_lossy().into_owned());
            }
        }
    }
    Ok(())
}

#[async_trait]
impl NodeClient for LocalNodeClient {
    fn ip(&self) -> &str {
        &self.ip
    }

    fn user(&self) -> &str {
        &self.user
    }

    async fn try_run(&self, argv: &[&str]) -> Result<CommandOutput, Error> {
        let Some((program, args)) = argv.split_first() else {
            return Ok(CommandOutput::default());
        };
        debug!(ip = %self.ip, command = %argv.join(" "), "running command");

        let output = Command::new(program).args(args).output().await?;
        Ok(CommandOutput {
            status: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }

    async fn file_exists(&self, path: &str) -> Result<bool, Error> {
        Ok(tokio::fs::metadata(path)
            .await
            .map(|metadata| metadata.is_file())
            .unwrap_or(false))
    }

    async fn file_read(&self, path: &str) -> Result<String, Error> {
        Ok(tokio::fs::read_to_string(path).await?)
    }

    async fn file_write(&self, path: &str, contents: &str) -> Result<(), Error> {
        if let Some(parent) = Path::new(path).parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        Ok(tokio::fs::write(path, contents).await?)
    }

    async fn file_delete(&self, paths: &[String]) -> Result<(), Error> {
        for path in paths {
            match tokio::fs::remove_file(path).await {
                Err(error) if error.kind() != std::io::ErrorKind::NotFound => return Err(error.into()),
                _ => {}
            }
        }
        Ok(())
    }

    async fn file_list(&self, directory: &str, recursive: bool) -> Result<Vec<String>, Error> {
        let mut files = Vec::new();
        walk(Path::new(directory), recursive, &mut files, &mut Vec::new()).await?;
        files.sort();
        Ok(files)
    }

    async fn dir_exists(&self, path: &str) -> Result<bool, Error> {
        Ok(tokio::fs::metadata(path)
            .await
            .map(|metadata| metadata.is_dir())
            .unwrap_or(false))
    }

    async fn dir_create(&self, paths: &[String]) -> Result<(), Error> {
        for path in paths {
            tokio::fs::create_dir_all(path).await?;
        }
        Ok(())
    }

    async fn dir_delete(&self, paths: &[String]) -> Result<(), Error> {
        for path in paths {
            match tokio::fs::remove_dir_all(path).await {
                Err(error) if error.kind() != std::io::ErrorKind::NotFound => return Err(error.into()),
                _ => {}
            }
        }
        Ok(())
    }

    async fn dir_chmod(&self, paths: &[String], mode: u32, recursive: bool) -> Result<(), Error> {
        for path in paths {
            let mut targets = vec![path.clone()];
            if recursive {
                let mut files = Vec::new();
                walk(Path::new(path), true, &mut files, &mut targets).await?;
                targets.extend(files);
            }
            for target in targets {
                tokio::fs::set_permissions(&target, std::fs::Permissions::from_mode(mode)).await?;
            }
        }
        Ok(())
    }

    async fn dir_chown(&self, paths: &[String], user: &str, group: &str, recursive: bool) -> Result<(), Error> {
        let owner = format!("{user}:{group}");
        let mut argv = vec!["chown"];
        if recursive {
            argv.push("-R");
        }
        argv.push(&owner);
        argv.extend(paths.iter().map(String::as_str));
        self.run(&argv).await.map(|_| ())
    }
}

/// Connects every address to the local host.
#[derive(Clone, Copy, Debug, Default)]
pub struct LocalConnector;

#[async_trait]
impl NodeConnector for LocalConnector {
    async fn connect(&self, ip: &str, user: &str) -> Result<Arc<dyn NodeClient>, Error> {
        Ok(Arc::new(LocalNodeClient::new(ip, user)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn client() -> LocalNodeClient {
        LocalNodeClient::new("127.0.0.1", "ovs")
    }

    #[tokio::test]
    async fn test_files_and_directories() {
        let root = tempfile::tempdir().unwrap();
        let base = root.path().to_string_lossy().into_owned();
        let client = client();

        let nested = format!("{base}/db/sub/value");
        client.file_write(&nested, "contents").await.unwrap();
        client.file_write(&format!("{base}/db/top"), "").await.unwrap();

        assert!(client.file_exists(&nested).await.unwrap());
        assert!(!client.file_exists(&format!("{base}/db")).await.unwrap());
        assert!(client.dir_exists(&format!("{base}/db/sub")).await.unwrap());
        assert_eq!(client.file_read(&nested).await.unwrap(), "contents");

        assert_eq!(
            client.file_list(&format!("{base}/db"), true).await.unwrap(),
            vec![format!("{base}/db/sub/value"), format!("{base}/db/top")]
        );
        assert_eq!(
            client.file_list(&format!("{base}/db"), false).await.unwrap(),
            vec![format!("{base}/db/top")]
        );

        client
            .dir_chmod(&[format!("{base}/db")], 0o750, true)
            .await
            .unwrap();
        let mode = std::fs::metadata(format!("{base}/db/sub")).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o750);

        client.file_delete(&[nested.clone(), nested.clone()]).await.unwrap();
        assert!(!client.file_exists(&nested).await.unwrap());

        client.dir_delete(&[format!("{base}/db")]).await.unwrap();
        client.dir_delete(&[format!("{base}/db")]).await.unwrap();
        assert!(!client.dir_exists(&format!("{base}/db")).await.unwrap());
    }

    #[tokio::test]
    async fn test_commands() {
        let client = client();

        assert_eq!(client.run(&["echo", "hello"]).await.unwrap(), "hello\n");
        assert_eq!(client.run_shell("echo a b | cut -d ' ' -f 2").await.unwrap(), "b\n");
        assert_matches!(
            client.run(&["sh", "-c", "echo oops >&2; exit 3"]).await,
            Err(Error::Command { status: Some(3), stderr, .. }) if stderr == "oops\n"
        );
        assert!(!client.try_run(&["false"]).await.unwrap().succeeded());
    }
}
