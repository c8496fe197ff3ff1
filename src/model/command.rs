use super::{ModelBackend, ModelContext, ModelError};
use crate::config::ModelSettings;
use std::io::{BufReader, Read, Write};
use std::process::{Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

/// Runs an external generator: the rendered context goes to stdin, the reply
/// is read from stdout.
#[derive(Debug, Clone)]
pub struct CommandModel {
    pub binary: String,
    pub args: Vec<String>,
    pub timeout: Duration,
}

impl CommandModel {
    pub fn from_settings(settings: &ModelSettings) -> Self {
        Self {
            binary: settings.command.clone(),
            args: settings.args.clone(),
            timeout: settings.timeout(),
        }
    }

    fn io_error(&self, source: std::io::Error) -> ModelError {
        ModelError::Io {
            path: self.binary.clone(),
            source,
        }
    }
}

impl ModelBackend for CommandModel {
    fn generate(&self, context: &ModelContext, trigger: &str) -> Result<String, ModelError> {
        let args: Vec<String> = self
            .args
            .iter()
            .map(|arg| arg.replace("{trigger}", trigger))
            .collect();
        let mut command = Command::new(&self.binary);
        command
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(ModelError::MissingBinary {
                    binary: self.binary.clone(),
                })
            }
            Err(err) => return Err(self.io_error(err)),
        };

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| self.io_error(std::io::Error::other("missing stdin pipe")))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| self.io_error(std::io::Error::other("missing stdout pipe")))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| self.io_error(std::io::Error::other("missing stderr pipe")))?;

        let prompt = context.render(trigger);
        let stdin_writer = thread::spawn(move || {
            // A generator that ignores stdin closes the pipe early; that is not an error.
            let _ = stdin.write_all(prompt.as_bytes());
        });
        let stdout_reader = thread::spawn(move || read_lossy(stdout));
        let stderr_reader = thread::spawn(move || read_lossy(stderr));

        let start = Instant::now();
        let exit_status = loop {
            match child.try_wait() {
                Ok(Some(status)) => break status,
                Ok(None) => {
                    if start.elapsed() > self.timeout {
                        let _ = child.kill();
                        let _ = child.wait();
                        let _ = stdin_writer.join();
                        let _ = stdout_reader.join();
                        let _ = stderr_reader.join();
                        return Err(ModelError::Timeout {
                            binary: self.binary.clone(),
                            timeout_ms: self.timeout.as_millis() as u64,
                        });
                    }
                    thread::sleep(Duration::from_millis(10));
                }
                Err(err) => return Err(self.io_error(err)),
            }
        };

        let _ = stdin_writer.join();
        let stdout = stdout_reader.join().unwrap_or_default();
        let stderr = stderr_reader.join().unwrap_or_default();

        if !exit_status.success() {
            return Err(ModelError::NonZeroExit {
                binary: self.binary.clone(),
                exit_code: exit_status.code().unwrap_or(-1),
                stderr: stderr.trim().to_string(),
            });
        }

        let reply = stdout.trim_end().to_string();
        if reply.trim().is_empty() {
            return Err(ModelError::EmptyOutput {
                binary: self.binary.clone(),
            });
        }
        Ok(reply)
    }
}
/// Reads a pipe to the end; invalid UTF-8 is replaced rather than dropping
/// the whole output.
fn read_lossy(pipe: impl Read) -> String {
    let mut bytes = Vec::new();
    let _ = BufReader::new(pipe).read_to_end(&mut bytes);
    String::from_utf8_lossy(&bytes).into_owned()
}

