//! Child processes bounded by a timeout. Stdout and stderr are drained on reader threads
//! while the child runs, so a chatty child never stalls on a full pipe.

use std::io::{self, Read, Write};
use std::process::{Command, ExitStatus, Stdio};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use thiserror::Error;
use wait_timeout::ChildExt;

#[derive(Debug)]
pub struct ProcessOutput {
    pub status: ExitStatus,
    pub stdout: String,
    pub stderr: String,
}

impl ProcessOutput {
    pub fn code(&self) -> i32 {
        self.status.code().unwrap_or(1)
    }
}

#[derive(Debug, Error)]
pub enum RunError {
    #[error("failed to spawn {program}: {source}")]
    Spawn { program: String, source: io::Error },

    #[error("{program} timed out after {}s", timeout.as_secs())]
    TimedOut { program: String, timeout: Duration },

    #[error("{program}: {source}")]
    Io { program: String, source: io::Error },
}

/// Runs `cmd` to completion or kills it after `timeout`. `input`, when given, is fed to
/// the child's stdin and then closed.
pub fn run_with_timeout(
    cmd: &mut Command,
    input: Option<&[u8]>,
    timeout: Duration,
) -> Result<ProcessOutput, RunError> {
    let program = cmd.get_program().to_string_lossy().into_owned();
    cmd.stdin(if input.is_some() {
        Stdio::piped()
    } else {
        Stdio::null()
    })
    .stdout(Stdio::piped())
    .stderr(Stdio::piped());

    let mut child = cmd.spawn().map_err(|source| RunError::Spawn {
        program: program.clone(),
        source,
    })?;

    let stdout = drain(child.stdout.take());
    let stderr = drain(child.stderr.take());
    let writer = match (input, child.stdin.take()) {
        (Some(bytes), Some(mut stdin)) => {
            let bytes = bytes.to_vec();
            // A child may exit without reading its input; the broken pipe is not ours to report.
            Some(thread::spawn(move || {
                let _ = stdin.write_all(&bytes);
            }))
        }
        _ => None,
    };

    let status = match child.wait_timeout(timeout) {
        Ok(Some(status)) => status,
        Ok(None) => {
            let _ = child.kill();
            let _ = child.wait();
            // Readers are left detached: a grandchild may still hold the pipes open.
            return Err(RunError::TimedOut { program, timeout });
        }
        Err(source) => {
            let _ = child.kill();
            let _ = child.wait();
            return Err(RunError::Io { program, source });
        }
    };

    if let Some(writer) = writer {
        let _ = writer.join();
    }
    Ok(ProcessOutput {
        status,
        stdout: collect(stdout, &program)?,
        stderr: collect(stderr, &program)?,
    })
}

fn drain<R: Read + Send + 'static>(pipe: Option<R>) -> JoinHandle<io::Result<Vec<u8>>> {
    thread::spawn(move || {
        let mut buf = Vec::new();
        if let Some(mut pipe) = pipe {
            pipe.read_to_end(&mut buf)?;
        }
        Ok(buf)
    })
}

fn collect(
    handle: JoinHandle<io::Result<Vec<u8>>>,
    program: &str,
) -> Result<String, RunError> {
    let bytes = handle
        .join()
        .map_err(|_| RunError::Io {
            program: program.to_string(),
            source: io::Error::new(io::ErrorKind::Other, "pipe reader panicked"),
        })?
        .map_err(|source| RunError::Io {
            program: program.to_string(),
            source,
        })?;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::time::Instant;

    fn sh(script: &str) -> Command {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(script);
        cmd
    }

    #[test]
    fn large_output_on_both_pipes_does_not_stall() {
        let started = Instant::now();
        let out = run_with_timeout(
            &mut sh("head -c 200000 /dev/zero | tr '\\0' e >&2; head -c 150000 /dev/zero | tr '\\0' o; echo done"),
            None,
            Duration::from_secs(10),
        )
        .unwrap();
        assert!(out.status.success());
        assert_eq!(out.stderr.len(), 200_000);
        assert_eq!(out.stdout.len(), 150_005);
        assert!(out.stdout.ends_with("done\n"));
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[test]
    fn input_reaches_stdin() {
        let out = run_with_timeout(&mut sh("tr a-z A-Z"), Some(b"pick up"), Duration::from_secs(10))
            .unwrap();
        assert_eq!(out.stdout, "PICK UP");
    }

    #[test]
    fn slow_child_times_out() {
        let err = run_with_timeout(&mut sh("exec sleep 5"), None, Duration::from_secs(1))
            .unwrap_err();
        assert!(matches!(err, RunError::TimedOut { .. }));
        assert_eq!(err.to_string(), "sh timed out after 1s");
    }

    #[test]
    fn missing_program_is_spawn_error() {
        let err = run_with_timeout(
            &mut Command::new("/definitely/not/a/program"),
            None,
            Duration::from_secs(1),
        )
        .unwrap_err();
        assert!(matches!(err, RunError::Spawn { .. }));
    }

    #[test]
    fn exit_code_is_reported() {
        let out = run_with_timeout(&mut sh("echo boom >&2; exit 3"), None, Duration::from_secs(10))
            .unwrap();
        assert_eq!(out.code(), 3);
        assert_eq!(out.stderr, "boom\n");
    }
}
